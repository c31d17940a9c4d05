use std::ops::{Deref, DerefMut};

use im::Vector;
use log::debug;

use crate::chunk::Chunk;
use crate::free_list::FreeList;
use crate::header::{has_sentinel_at, HeapObject, Word, SENTINEL, WORD_SIZE};
use crate::mark_sweep::{MarkingStack, MarkingVisitor, SweepingVisitor};
use crate::metadata::{Metadata, CARD_SIZE, NO_NEW_SPACE_POINTERS, NO_OBJECT_START};
use crate::mmap::PAGE_SIZE;
use crate::promoted_track::PromotedTrack;
use crate::utils::{align_up, formatted_size, is_aligned};
use crate::visitor::ScavengeVisitor;
use crate::weak_refs::{self, WeakPointer, WeakPointerCallback};

pub const DEFAULT_ALLOCATION_BUDGET: usize = 512 * 1024;

const MIN_DEFAULT_CHUNK_SIZE: usize = 32 * 1024;
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// The old generation: a non-moving mark-sweep space. Allocation bumps a
/// pointer over the current window; windows come from worst-fit free-list
/// spans or fresh chunks. During a scavenge the space doubles as the
/// tenuring destination, recording freshly promoted objects in in-heap
/// promoted tracks until their interiors have been scanned.
pub struct OldSpace {
    chunks: Vec<Box<Chunk>>,
    free_list: FreeList,
    top: usize,
    limit: usize,
    used: usize,
    allocation_budget: isize,
    tracking_allocations: bool,
    promoted_track: usize,
    weak_pointers: Vector<WeakPointer>,
    no_allocation_failure_nesting: usize,
    // Chunk owning the open window; valid whenever `top != 0`.
    current_chunk: *mut Chunk,
}

impl OldSpace {
    pub fn new() -> OldSpace {
        OldSpace {
            chunks: Vec::new(),
            free_list: FreeList::new(),
            top: 0,
            limit: 0,
            used: 0,
            allocation_budget: DEFAULT_ALLOCATION_BUDGET as isize,
            tracking_allocations: false,
            promoted_track: 0,
            weak_pointers: Vector::new(),
            no_allocation_failure_nesting: 0,
            current_chunk: core::ptr::null_mut(),
        }
    }

    // --- accounting ---

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn allocation_budget(&self) -> isize {
        self.allocation_budget
    }

    pub fn set_allocation_budget(&mut self, budget: usize) {
        self.allocation_budget = budget as isize;
    }

    /// Sizes the budget from the live heap after a collection, so larger
    /// heaps run longer between collections.
    pub fn adjust_allocation_budget(&mut self) {
        self.allocation_budget = (self.used / 2).max(MIN_DEFAULT_CHUNK_SIZE) as isize;
    }

    pub fn needs_garbage_collection(&self) -> bool {
        self.allocation_budget <= 0
    }

    pub fn in_no_allocation_failure_scope(&self) -> bool {
        self.no_allocation_failure_nesting > 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[Box<Chunk>] {
        &self.chunks
    }

    pub fn includes(&self, address: usize) -> bool {
        self.chunk_index(address).is_some()
    }

    fn chunk_index(&self, address: usize) -> Option<usize> {
        self.chunks.iter().position(|chunk| chunk.includes(address))
    }

    pub(crate) fn metadata_for(&self, address: usize) -> &Metadata {
        let index = self.chunk_index(address).expect("address outside the heap");
        self.chunks[index].metadata()
    }

    /// Write-barrier entry: records that the object at `address` may hold
    /// a pointer into young space.
    pub fn insert_into_remembered_set(&self, address: usize) {
        self.metadata_for(address).mark_remembered(address);
    }

    // --- allocation ---

    /// Allocates `size` bytes (word-aligned, at least one word). Returns
    /// the address, or 0 when the caller should run a collection first.
    /// Never blocks.
    pub fn allocate(&mut self, size: usize) -> usize {
        debug_assert!(size >= HeapObject::HEADER_SIZE);
        debug_assert!(is_aligned(size, WORD_SIZE));

        // Fast case bump allocation.
        if self.limit - self.top >= size {
            let result = self.top;
            self.top += size;
            self.allocation_budget -= size as isize;
            unsafe {
                (*self.current_chunk).metadata().record_start(result);
            }
            return result;
        }

        if !self.in_no_allocation_failure_scope() && self.needs_garbage_collection() {
            return 0;
        }

        let mut result = self.allocate_from_free_list(size);
        if result == 0 {
            result = self.allocate_in_new_chunk(size);
        }
        if result == 0 {
            // Trigger a collection on the next request.
            self.allocation_budget = 0;
        }
        result
    }

    /// Closes the allocation window: the unused tail goes back to the free
    /// list and is no longer accounted as used, and an open promoted track
    /// shrinks to the bytes actually handed out. A no-op when no window is
    /// open, including while tracking.
    pub fn flush(&mut self) {
        if self.top != 0 {
            let free_size = self.limit - self.top;
            self.free_list.add(self.top, free_size);
            if self.tracking_allocations && self.promoted_track != 0 {
                let track = PromotedTrack::from_address(self.promoted_track);
                debug_assert!(track.end() >= self.top);
                track.set_end(self.top);
            }
            self.top = 0;
            self.limit = 0;
            debug_assert!(free_size <= self.used);
            self.used -= free_size;
        }
    }

    fn use_whole_chunk(&mut self, index: usize) {
        let chunk = &mut self.chunks[index];
        self.top = chunk.start();
        self.limit = self.top + chunk.size() - WORD_SIZE;
        unsafe {
            *(self.limit as *mut Word) = SENTINEL;
        }
        self.current_chunk = chunk.as_mut() as *mut Chunk;
        if self.tracking_allocations {
            self.promoted_track =
                PromotedTrack::initialize(self.promoted_track, self.top, self.limit);
            self.top += PromotedTrack::HEADER_SIZE;
        }
        // The whole chunk counts as used until the unused tail is flushed
        // back to the free list.
        self.used += chunk.size() - WORD_SIZE;
    }

    fn allocate_and_use_chunk(&mut self, size: usize) -> bool {
        match Chunk::allocate(size) {
            Some(chunk) => {
                self.chunks.push(chunk);
                self.use_whole_chunk(self.chunks.len() - 1);
                true
            }
            None => false,
        }
    }

    fn allocate_from_free_list(&mut self, size: usize) -> usize {
        // Flush the rest of the active window into the free list.
        self.flush();

        let request = if self.tracking_allocations {
            size + PromotedTrack::HEADER_SIZE
        } else {
            size
        };
        if let Some(span) = self.free_list.get(request) {
            let address = span.address();
            // Read before the tracking header overwrites the record.
            let span_size = span.size();
            let index = self
                .chunk_index(address)
                .expect("free span outside every chunk");
            self.current_chunk = self.chunks[index].as_mut() as *mut Chunk;
            self.top = address;
            self.limit = address + span_size;
            // The whole span counts as used until the unused tail is
            // flushed back.
            self.used += span_size;
            if self.tracking_allocations {
                self.promoted_track =
                    PromotedTrack::initialize(self.promoted_track, self.top, self.limit);
                self.top += PromotedTrack::HEADER_SIZE;
            }
            debug_assert!(size <= self.limit - self.top);
            return self.allocate(size);
        }

        0
    }

    fn allocate_in_new_chunk(&mut self, size: usize) -> usize {
        debug_assert!(self.top == 0); // Space is flushed.
        let tracking_size = if self.tracking_allocations {
            PromotedTrack::HEADER_SIZE
        } else {
            0
        };
        // Make room for the sentinel.
        let required = size + tracking_size + WORD_SIZE;
        let chunk_size = required.max(self.default_chunk_size(self.used));
        if self.allocate_and_use_chunk(chunk_size) {
            return self.allocate(size);
        }

        self.allocation_budget = -1; // Trigger a collection.
        0
    }

    fn default_chunk_size(&self, used: usize) -> usize {
        align_up(
            (used / 4).clamp(MIN_DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE),
            PAGE_SIZE,
        )
    }

    /// Pre-grows the space: acquires a chunk of at least `size` bytes and
    /// hands its usable range to the free list. Returns false when the
    /// platform reservation fails.
    pub fn expand(&mut self, size: usize) -> bool {
        match Chunk::allocate(size) {
            Some(chunk) => {
                let (start, usable_end) = (chunk.start(), chunk.usable_end());
                self.chunks.push(chunk);
                self.free_list.add(start, usable_end - start);
                true
            }
            None => false,
        }
    }

    // --- identity ---

    /// Old space never moves objects; after marking, a live object's new
    /// location is itself.
    pub fn new_location(&self, object: HeapObject) -> HeapObject {
        debug_assert!(self.includes(object.address()));
        debug_assert!(self.is_alive(object));
        object
    }

    pub fn is_alive(&self, object: HeapObject) -> bool {
        debug_assert!(self.includes(object.address()));
        self.metadata_for(object.address())
            .is_marked(object.address())
    }

    // --- scavenge cooperation ---

    pub fn start_tracking_allocations(&mut self) {
        self.flush();
        debug_assert!(!self.tracking_allocations);
        debug_assert!(self.promoted_track == 0);
        self.tracking_allocations = true;
    }

    pub fn end_tracking_allocations(&mut self) {
        debug_assert!(self.tracking_allocations);
        debug_assert!(self.promoted_track == 0);
        self.tracking_allocations = false;
    }

    pub fn is_tracking_allocations(&self) -> bool {
        self.tracking_allocations
    }

    /// Zaps every outstanding promoted track without scanning it. For
    /// abandoning a scavenge; the tracked objects become ordinary heap
    /// contents.
    pub fn unlink_promoted_track(&mut self) {
        self.flush();
        let mut promoted = self.promoted_track;
        self.promoted_track = 0;
        while promoted != 0 {
            let track = PromotedTrack::from_address(promoted);
            promoted = track.next();
            track.zap();
        }
    }

    /// Scans every dirty card for old-to-young pointers. The remembered
    /// byte is cleared before its card is scanned; the visitor re-dirties
    /// it through the installed sink if a young pointer survives.
    pub fn visit_remembered_set<V: ScavengeVisitor>(&mut self, visitor: &mut V) {
        self.flush();
        let chunk_count = self.chunks.len();
        for i in 0..chunk_count {
            // The visitor may promote into this space and append chunks;
            // those start with clean cards and are covered by the promoted
            // tracks instead, so the snapshot count is enough.
            let chunk: *const Chunk = self.chunks[i].as_ref();
            unsafe {
                Self::visit_remembered_set_in(&*chunk, visitor);
            }
        }
    }

    fn visit_remembered_set_in<V: ScavengeVisitor>(chunk: &Chunk, visitor: &mut V) {
        let md = chunk.metadata();
        let start = chunk.start();
        let end = chunk.end();
        let mut current = start;
        let mut bytes = md.remembered_begin();
        let mut earliest_iteration_start = start;
        unsafe {
            while current < end {
                // Skip blank cards a word at a time.
                if is_aligned(bytes as usize, WORD_SIZE) {
                    let mut words = bytes as *mut usize;
                    if *words == 0 {
                        while current < end && *words == 0 {
                            words = words.add(1);
                            current += WORD_SIZE * CARD_SIZE;
                        }
                        bytes = words as *mut u8;
                        continue;
                    }
                }
                if *bytes != NO_NEW_SPACE_POINTERS {
                    let mut iteration_start = current;
                    let mut starts = md.starts_begin().add(md.card_index(current));
                    if starts != md.starts_begin() {
                        // The starts entry can name any object in the card,
                        // so step back across cards with no recorded start
                        // (large objects) to a point guaranteed to be at or
                        // before the first object touching this card. Never
                        // step back past the end of the previous scan: that
                        // could land inside a promoted track whose interior
                        // is not yet traversable.
                        loop {
                            starts = starts.sub(1);
                            iteration_start -= CARD_SIZE;
                            if iteration_start <= earliest_iteration_start
                                || *starts != NO_OBJECT_START
                            {
                                break;
                            }
                        }
                        if iteration_start > earliest_iteration_start {
                            iteration_start =
                                Metadata::object_address_from_start(iteration_start, *starts);
                        } else {
                            iteration_start = earliest_iteration_start;
                        }
                    }
                    // Skip objects that start before the dirty card.
                    while iteration_start < current {
                        if has_sentinel_at(iteration_start) {
                            break;
                        }
                        iteration_start += HeapObject::from_address(iteration_start).size();
                    }
                    // Reset in case there are no new-space pointers any
                    // more; the visitor re-dirties through the sink.
                    *bytes = NO_NEW_SPACE_POINTERS;
                    visitor.set_record_new_space_pointers(bytes);
                    // Iterate objects that start in the relevant card.
                    while iteration_start < current + CARD_SIZE {
                        if has_sentinel_at(iteration_start) {
                            break;
                        }
                        let object = HeapObject::from_address(iteration_start);
                        object.iterate_pointers(visitor);
                        iteration_start += object.size();
                    }
                    earliest_iteration_start = iteration_start;
                }
                current += CARD_SIZE;
                bytes = bytes.add(1);
            }
        }
    }

    /// Scans objects promoted since the last round and zaps their tracks.
    /// Promotions made by the visitor itself land on a fresh chain, so the
    /// caller loops until this returns false.
    pub fn complete_scavenge_generational<V: ScavengeVisitor>(&mut self, visitor: &mut V) -> bool {
        self.flush();
        debug_assert!(self.tracking_allocations);

        let mut found_work = false;
        let mut promoted = self.promoted_track;
        self.promoted_track = 0;

        while promoted != 0 {
            let track = PromotedTrack::from_address(promoted);
            let mut traverse = track.start();
            let end = track.end();
            if traverse != end {
                found_work = true;
            }
            let md: *const Metadata = self.metadata_for(track.address());
            while traverse != end {
                let object = HeapObject::from_address(traverse);
                unsafe {
                    visitor.set_record_new_space_pointers((*md).remembered_byte_ptr(traverse));
                }
                object.iterate_pointers(visitor);
                traverse += object.size();
            }
            promoted = track.next();
            track.zap();
        }
        found_work
    }

    // --- weak pointers ---

    pub fn register_weak_pointer(
        &mut self,
        slot: *mut Word,
        callback: WeakPointerCallback,
        arg: *mut u8,
    ) {
        self.weak_pointers
            .push_back(WeakPointer::new(slot, callback, arg));
    }

    /// Runs between marking and sweeping.
    pub fn process_weak_pointers(&mut self) {
        let mut pointers = std::mem::take(&mut self.weak_pointers);
        weak_refs::process(&mut pointers, self);
        self.weak_pointers = pointers;
    }

    // --- mark-sweep ---

    /// Rebuilds the free list and the starts tables, recomputes `used`,
    /// and clears the mark bits, in one linear pass per chunk. The chunk
    /// sentinels are never swept.
    pub fn sweep(&mut self) {
        debug_assert!(!self.tracking_allocations);
        self.flush();
        let mut visitor = SweepingVisitor::new(&mut self.free_list);
        for chunk in self.chunks.iter() {
            let md = chunk.metadata();
            // Rewritten from scratch so stale entries for dead objects
            // cannot survive the collection.
            md.clear_starts();
            let mut current = chunk.start();
            while !has_sentinel_at(current) {
                let object = HeapObject::from_address(current);
                current += visitor.visit(object, md);
            }
            visitor.chunk_done(current);
            md.clear_marks();
        }
        self.used = visitor.used();
        debug!(
            "sweep: {} live across {} chunks",
            formatted_size(self.used),
            self.chunks.len()
        );
    }

    /// Overflow recovery: re-iterates every marked object so the visitor
    /// can push referents the overflowed stack dropped. Re-marks each
    /// object's full extent on the way.
    pub(crate) fn iterate_overflowed_objects(&self, stack: &mut MarkingStack) {
        for chunk in self.chunks.iter() {
            let md = chunk.metadata();
            chunk.each_object(|object| {
                if md.is_marked(object.address()) {
                    md.mark_all(object.address(), object.size());
                    object.iterate_pointers(&mut MarkingVisitor::new(self, &mut *stack));
                }
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    // --- debugging ---

    /// Audits every chunk's side tables. Requires a flushed space.
    #[cfg(debug_assertions)]
    pub fn verify(&self, young: &dyn crate::visitor::YoungSpace) {
        assert!(self.top == 0, "verify requires a flushed space");
        for chunk in self.chunks.iter() {
            let md = chunk.metadata();
            // Every recorded start must decode to a well-formed header,
            // and an object stretching over the whole next card must leave
            // that card's entry blank.
            for index in 0..md.cards() {
                let byte = md.starts_byte(index);
                if byte == NO_OBJECT_START {
                    continue;
                }
                let card = md.card_address(index);
                let address = Metadata::object_address_from_start(card, byte);
                let object = HeapObject::from_address(address);
                assert!(object.size() > 0);
                assert!(is_aligned(object.size(), WORD_SIZE));
                if address + object.size() > card + 2 * CARD_SIZE {
                    assert_eq!(md.starts_byte(index + 1), NO_OBJECT_START);
                }
            }
            // Objects holding young pointers must sit on a dirty card.
            chunk.each_object(|object| {
                if object.contains_pointers_to(young) {
                    assert_ne!(md.remembered_byte(object.address()), NO_NEW_SPACE_POINTERS);
                }
            });
        }
    }
}

impl Default for OldSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps `allocate` from short-circuiting on an exhausted budget for the
/// duration of a critical section (for example while a scavenge promotes).
/// Entry and exit stay paired on every return path.
pub struct NoAllocationFailureScope<'a> {
    space: &'a mut OldSpace,
}

impl<'a> NoAllocationFailureScope<'a> {
    pub fn new(space: &'a mut OldSpace) -> NoAllocationFailureScope<'a> {
        space.no_allocation_failure_nesting += 1;
        NoAllocationFailureScope { space }
    }
}

impl<'a> Drop for NoAllocationFailureScope<'a> {
    fn drop(&mut self) {
        debug_assert!(self.space.no_allocation_failure_nesting > 0);
        self.space.no_allocation_failure_nesting -= 1;
    }
}

impl<'a> Deref for NoAllocationFailureScope<'a> {
    type Target = OldSpace;

    fn deref(&self) -> &OldSpace {
        self.space
    }
}

impl<'a> DerefMut for NoAllocationFailureScope<'a> {
    fn deref_mut(&mut self) -> &mut OldSpace {
        self.space
    }
}
