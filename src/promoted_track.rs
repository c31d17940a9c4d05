use crate::header::{HeapObject, HeapObjectHeader, Kind, Word, WORD_SIZE};

/// In-heap record delimiting a range of freshly promoted objects whose
/// interiors have not been scanned yet. The record sits at the front of
/// the allocation window it covers; `size()` of the underlying object
/// reports `end - address`, so linear traversal skips the whole range
/// while it may still hold uninitialized memory.
#[derive(Clone, Copy)]
pub struct PromotedTrack {
    address: usize,
}

impl PromotedTrack {
    pub const HEADER_SIZE: usize = 3 * WORD_SIZE;

    /// Writes a track header at `begin` covering `[begin, end)`, chained
    /// in front of `previous` (0 for the end of the chain). Returns the
    /// new chain head.
    pub fn initialize(previous: usize, begin: usize, end: usize) -> usize {
        debug_assert!(end >= begin + Self::HEADER_SIZE);
        unsafe {
            *(begin as *mut HeapObjectHeader) =
                HeapObjectHeader::new(Kind::PromotedTrack, Self::HEADER_SIZE);
            *((begin + WORD_SIZE) as *mut Word) = previous;
            *((begin + 2 * WORD_SIZE) as *mut Word) = end;
        }
        begin
    }

    #[inline]
    pub fn from_address(address: usize) -> PromotedTrack {
        debug_assert!(HeapObject::from_address(address).kind() == Kind::PromotedTrack);
        PromotedTrack { address }
    }

    #[inline]
    pub fn address(self) -> usize {
        self.address
    }

    #[inline]
    pub fn next(self) -> usize {
        unsafe { *((self.address + WORD_SIZE) as *const Word) }
    }

    /// First promoted object covered by this track.
    #[inline]
    pub fn start(self) -> usize {
        self.address + Self::HEADER_SIZE
    }

    #[inline]
    pub fn end(self) -> usize {
        unsafe { *((self.address + 2 * WORD_SIZE) as *const Word) }
    }

    /// Shrinks the covered range when the window above it flushes before
    /// filling up.
    #[inline]
    pub fn set_end(self, end: usize) {
        debug_assert!(end >= self.start() && end <= self.end());
        unsafe {
            *((self.address + 2 * WORD_SIZE) as *mut Word) = end;
        }
    }

    /// Rewrites the header words as one-word fillers. Only legal once the
    /// covered range has been fully scanned; afterwards the record is
    /// inert for mark-sweep.
    pub fn zap(self) {
        for i in 0..Self::HEADER_SIZE / WORD_SIZE {
            HeapObject::format_filler(self.address + i * WORD_SIZE);
        }
    }
}
