use log::trace;

use crate::header::{has_sentinel_at, HeapObject, Word, SENTINEL, WORD_SIZE};
use crate::metadata::Metadata;
use crate::mmap::{Mmap, PAGE_SIZE};
use crate::utils::{align_up, formatted_size};

pub const MIN_CHUNK_SIZE: usize = PAGE_SIZE;

/// A page-multiple range of reserved memory owned by the old space. The
/// last word holds the chunk-end sentinel from initialization on; linear
/// object traversal stops there. Side tables travel with the chunk.
pub struct Chunk {
    map: Mmap,
    start: usize,
    end: usize,
    metadata: Metadata,
}

impl Chunk {
    /// Reserves and commits a chunk of at least `size` bytes, rounded up
    /// to the page size. Returns `None` when the platform reservation
    /// fails; the caller turns that into an allocation failure.
    pub fn allocate(size: usize) -> Option<Box<Chunk>> {
        let size = align_up(size.max(MIN_CHUNK_SIZE), PAGE_SIZE);
        let map = Mmap::new(size)?;
        map.commit(map.start(), size);
        let start = map.start() as usize;
        let end = start + size;
        let chunk = Box::new(Chunk {
            metadata: Metadata::new(start, size),
            map,
            start,
            end,
        });
        unsafe {
            *((end - WORD_SIZE) as *mut Word) = SENTINEL;
        }
        trace!("chunk {:#x}..{:#x} ({})", start, end, formatted_size(size));
        Some(chunk)
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// End of the allocatable range; the sentinel word lies at this
    /// address.
    #[inline]
    pub fn usable_end(&self) -> usize {
        self.end - WORD_SIZE
    }

    #[inline]
    pub fn includes(&self, address: usize) -> bool {
        self.start <= address && address < self.end
    }

    #[inline]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn map(&self) -> &Mmap {
        &self.map
    }

    /// Walks the chunk's objects in address order. Only valid while the
    /// space is flushed or every open window is covered by a promoted
    /// track, since the walk relies on headers and the end sentinel.
    pub fn each_object(&self, mut f: impl FnMut(HeapObject)) {
        let mut current = self.start;
        while !has_sentinel_at(current) {
            let object = HeapObject::from_address(current);
            f(object);
            current += object.size();
        }
    }
}
