use log::{debug, trace};

use crate::free_list::FreeList;
use crate::header::{is_heap_word, untag_pointer, HeapObject, Word};
use crate::metadata::Metadata;
use crate::old_space::OldSpace;
use crate::utils::formatted_size;
use crate::visitor::PointerVisitor;

pub const MARKING_STACK_SIZE: usize = 512;

/// Bounded stack of grey objects. Pushing into a full stack sets the
/// overflow flag instead of growing; `process` recovers by re-iterating
/// marked objects. Marks only ever get set, so each recovery pass strictly
/// grows the marked set and the loop terminates.
pub struct MarkingStack {
    next: usize,
    overflowed: bool,
    overflow_events: usize,
    backing: [usize; MARKING_STACK_SIZE],
}

impl MarkingStack {
    pub fn new() -> MarkingStack {
        MarkingStack {
            next: 0,
            overflowed: false,
            overflow_events: 0,
            backing: [0; MARKING_STACK_SIZE],
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.next == 0
    }

    #[inline]
    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    /// Number of times the stack tipped into overflow. Diagnostics only.
    pub fn overflow_events(&self) -> usize {
        self.overflow_events
    }

    fn clear_overflow(&mut self) {
        self.overflowed = false;
    }

    pub(crate) fn push(&mut self, address: usize) {
        if self.next == MARKING_STACK_SIZE {
            if !self.overflowed {
                self.overflow_events += 1;
            }
            self.overflowed = true;
        } else {
            self.backing[self.next] = address;
            self.next += 1;
        }
    }

    fn pop(&mut self) -> Option<usize> {
        if self.next == 0 {
            return None;
        }
        self.next -= 1;
        Some(self.backing[self.next])
    }

    /// Pops until empty, blackening each object: its full extent is
    /// marked, then its pointers are traced (which may push more).
    pub fn empty(&mut self, space: &OldSpace) {
        while let Some(address) = self.pop() {
            let object = HeapObject::from_address(address);
            space
                .metadata_for(address)
                .mark_all(address, object.size());
            object.iterate_pointers(&mut MarkingVisitor::new(space, &mut *self));
        }
    }

    /// Drains the stack to completion, alternating with overflow
    /// recovery until a drain finishes without tipping over again.
    pub fn process(&mut self, space: &OldSpace) {
        while !self.is_empty() || self.is_overflowed() {
            self.empty(space);
            if self.is_overflowed() {
                self.clear_overflow();
                trace!("marking stack overflow; rescanning marked objects");
                space.iterate_overflowed_objects(self);
            }
        }
    }
}

impl Default for MarkingStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Pushes unmarked old-space referents of the visited slots. Objects are
/// marked grey (header bit) on push, so nothing enters the stack twice.
pub struct MarkingVisitor<'a, 'b> {
    space: &'a OldSpace,
    stack: &'b mut MarkingStack,
}

impl<'a, 'b> MarkingVisitor<'a, 'b> {
    pub fn new(space: &'a OldSpace, stack: &'b mut MarkingStack) -> MarkingVisitor<'a, 'b> {
        MarkingVisitor { space, stack }
    }
}

impl<'a, 'b> PointerVisitor for MarkingVisitor<'a, 'b> {
    fn visit_block(&mut self, start: *mut Word, end: *mut Word) {
        let mut current = start;
        while current < end {
            unsafe {
                let word = *current;
                if is_heap_word(word) {
                    let address = untag_pointer(word);
                    if self.space.includes(address) {
                        let md = self.space.metadata_for(address);
                        if !md.is_marked(address) {
                            md.mark(address);
                            self.stack.push(address);
                        }
                    }
                }
                current = current.add(1);
            }
        }
    }
}

/// Visits every object of a chunk in address order during the sweep,
/// rebuilding the free list and the object-starts table and accumulating
/// the live byte count.
pub struct SweepingVisitor<'a> {
    free_list: &'a mut FreeList,
    free_start: usize,
    used: usize,
}

impl<'a> SweepingVisitor<'a> {
    pub fn new(free_list: &'a mut FreeList) -> SweepingVisitor<'a> {
        // Clear the free list. It will be rebuilt during sweeping.
        free_list.clear();
        SweepingVisitor {
            free_list,
            free_start: 0,
            used: 0,
        }
    }

    fn add_free_span(&mut self, free_end: usize) {
        if self.free_start != 0 {
            self.free_list.add(self.free_start, free_end - self.free_start);
            self.free_start = 0;
        }
    }

    /// Visits one object and returns its size. The free-list record over a
    /// dead run is only written once the run closes, so the caller may
    /// overwrite an object's memory only after this returns.
    pub fn visit(&mut self, object: HeapObject, metadata: &Metadata) -> usize {
        let address = object.address();
        let size = object.size();
        if metadata.is_marked(address) {
            self.add_free_span(address);
            metadata.record_start(address);
            self.used += size;
        } else if self.free_start == 0 {
            self.free_start = address;
        }
        size
    }

    /// Closes any open free run at the chunk's sentinel word.
    pub fn chunk_done(&mut self, sentinel: usize) {
        self.add_free_span(sentinel);
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

/// Full collection of the old space: mark from `roots` (a block of tagged
/// words), process weak pointers, sweep, and resize the allocation
/// budget. Returns the number of bytes freed.
pub fn collect(space: &mut OldSpace, roots: &mut [Word]) -> usize {
    space.flush();
    let before = space.used();

    let mut stack = MarkingStack::new();
    {
        let mut visitor = MarkingVisitor::new(space, &mut stack);
        let range = roots.as_mut_ptr_range();
        visitor.visit_block(range.start, range.end);
    }
    stack.process(space);

    space.process_weak_pointers();
    space.sweep();
    space.adjust_allocation_budget();

    let freed = before.saturating_sub(space.used());
    debug!("collect: freed {}", formatted_size(freed));
    freed
}
