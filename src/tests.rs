use std::collections::HashMap;

use rand::{thread_rng, Rng};

use crate::header::{
    has_sentinel_at, is_heap_word, smi, tag_pointer, untag_pointer, HeapObject, Word, WORD_SIZE,
};
use crate::mark_sweep::{collect, MarkingStack, MarkingVisitor};
use crate::metadata::{Metadata, NEW_SPACE_POINTERS, NO_OBJECT_START};
use crate::old_space::{NoAllocationFailureScope, OldSpace};
use crate::visitor::{PointerVisitor, ScavengeVisitor, YoungSpace};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct NoYoung;

impl YoungSpace for NoYoung {
    fn includes(&self, _address: usize) -> bool {
        false
    }
}

/// Word arena standing in for the young generation.
struct TestYoungSpace {
    _arena: Vec<Word>,
    base: usize,
    end: usize,
    top: usize,
}

impl TestYoungSpace {
    fn new(words: usize) -> TestYoungSpace {
        let mut arena = vec![0 as Word; words];
        let base = arena.as_mut_ptr() as usize;
        TestYoungSpace {
            base,
            end: base + words * WORD_SIZE,
            top: base,
            _arena: arena,
        }
    }

    fn allocate(&mut self, size: usize) -> HeapObject {
        let address = self.top;
        self.top += size;
        assert!(self.top <= self.end, "young arena exhausted");
        HeapObject::format_boxed(address, size)
    }
}

impl YoungSpace for TestYoungSpace {
    fn includes(&self, address: usize) -> bool {
        self.base <= address && address < self.end
    }
}

/// Counts young-pointer visits and leaves the referents where they are,
/// re-dirtying the installed card byte for each one.
struct CountingScavengeVisitor<'a> {
    young: &'a TestYoungSpace,
    record: *mut u8,
    young_visits: usize,
    sinks_installed: usize,
}

impl<'a> CountingScavengeVisitor<'a> {
    fn new(young: &'a TestYoungSpace) -> CountingScavengeVisitor<'a> {
        CountingScavengeVisitor {
            young,
            record: core::ptr::null_mut(),
            young_visits: 0,
            sinks_installed: 0,
        }
    }
}

impl<'a> PointerVisitor for CountingScavengeVisitor<'a> {
    fn visit_block(&mut self, start: *mut Word, end: *mut Word) {
        let mut current = start;
        while current < end {
            unsafe {
                let word = *current;
                if is_heap_word(word) && self.young.includes(untag_pointer(word)) {
                    self.young_visits += 1;
                    assert!(!self.record.is_null());
                    *self.record = NEW_SPACE_POINTERS;
                }
                current = current.add(1);
            }
        }
    }
}

impl<'a> ScavengeVisitor for CountingScavengeVisitor<'a> {
    fn set_record_new_space_pointers(&mut self, byte: *mut u8) {
        self.record = byte;
        self.sinks_installed += 1;
    }
}

/// Promotes every young referent it sees into the old space, rewriting
/// the visited slot. Promoted copies keep their slots, so young pointers
/// inside them are found by the scavenge-completion rounds.
struct ForwardingScavengeVisitor<'a> {
    space: *mut OldSpace,
    young: &'a TestYoungSpace,
    forwarded: HashMap<usize, usize>,
    record: *mut u8,
}

impl<'a> ForwardingScavengeVisitor<'a> {
    fn new(space: *mut OldSpace, young: &'a TestYoungSpace) -> ForwardingScavengeVisitor<'a> {
        ForwardingScavengeVisitor {
            space,
            young,
            forwarded: HashMap::new(),
            record: core::ptr::null_mut(),
        }
    }
}

impl<'a> PointerVisitor for ForwardingScavengeVisitor<'a> {
    fn visit_block(&mut self, start: *mut Word, end: *mut Word) {
        let mut current = start;
        while current < end {
            unsafe {
                let word = *current;
                if is_heap_word(word) && self.young.includes(untag_pointer(word)) {
                    let address = untag_pointer(word);
                    let destination = match self.forwarded.get(&address) {
                        Some(&destination) => destination,
                        None => {
                            let object = HeapObject::from_address(address);
                            let size = object.size();
                            let destination = (*self.space).allocate(size);
                            assert!(destination != 0, "promotion failed");
                            core::ptr::copy_nonoverlapping(
                                address as *const u8,
                                destination as *mut u8,
                                size,
                            );
                            self.forwarded.insert(address, destination);
                            destination
                        }
                    };
                    // The slot now refers to old space, so the card's
                    // remembered byte stays clean.
                    *current = tag_pointer(destination);
                }
                current = current.add(1);
            }
        }
    }
}

impl<'a> ScavengeVisitor for ForwardingScavengeVisitor<'a> {
    fn set_record_new_space_pointers(&mut self, byte: *mut u8) {
        self.record = byte;
    }
}

fn alloc_boxed(space: &mut OldSpace, roots: &mut Vec<Word>, size: usize) -> HeapObject {
    let mut address = space.allocate(size);
    if address == 0 {
        collect(space, roots);
        address = space.allocate(size);
    }
    assert!(address != 0, "allocation failed after collection");
    HeapObject::format_boxed(address, size)
}

fn reap(_object: HeapObject, arg: *mut u8) {
    unsafe {
        *(arg as *mut usize) += 1;
    }
}

#[test]
fn bump_allocation_fills_a_single_chunk() {
    let mut space = OldSpace::new();
    space.set_allocation_budget(1_000_000);

    let mut addresses = vec![];
    for _ in 0..32 {
        let address = space.allocate(128);
        assert!(address != 0);
        HeapObject::format_boxed(address, 128);
        addresses.push(address);
    }

    assert_eq!(space.chunk_count(), 1);
    assert!(addresses.windows(2).all(|pair| pair[0] < pair[1]));
    // The budget shrinks by exactly the bytes handed out.
    assert_eq!(space.allocation_budget(), 1_000_000 - 32 * 128);

    space.flush();
    assert_eq!(space.used(), 32 * 128);
}

#[test]
fn sweep_rebuilds_free_list_and_starts() {
    let mut space = OldSpace::new();
    space.set_allocation_budget(1_000_000);

    let mut objects = vec![];
    for _ in 0..5 {
        let address = space.allocate(256);
        assert!(address != 0);
        objects.push(HeapObject::format_boxed(address, 256));
    }
    let (a, b, c, d, e) = (objects[0], objects[1], objects[2], objects[3], objects[4]);
    assert_eq!(b.address(), a.address() + 256);
    assert_eq!(e.address(), a.address() + 1024);

    let mut roots = vec![
        tag_pointer(a.address()),
        tag_pointer(c.address()),
        tag_pointer(e.address()),
    ];
    collect(&mut space, &mut roots);

    assert_eq!(space.used(), 3 * 256);

    let tail_start = e.address() + 256;
    let tail_size = space.chunks()[0].usable_end() - tail_start;
    assert_eq!(
        space.free_list().spans(),
        vec![
            (b.address(), 256),
            (d.address(), 256),
            (tail_start, tail_size),
        ]
    );

    let md = space.chunks()[0].metadata();
    for object in [a, c, e] {
        let index = md.card_index(object.address());
        let byte = md.starts_byte(index);
        assert_ne!(byte, NO_OBJECT_START);
        assert_eq!(
            Metadata::object_address_from_start(md.card_address(index), byte),
            object.address()
        );
    }
    // Dead objects leave no starts entries behind.
    assert_eq!(md.starts_byte(md.card_index(b.address())), NO_OBJECT_START);
    assert_eq!(md.starts_byte(md.card_index(d.address())), NO_OBJECT_START);
}

#[test]
fn scavenge_promotes_and_retraces() {
    let mut young = TestYoungSpace::new(512);
    let y = young.allocate(32);

    let mut space = OldSpace::new();
    space.start_tracking_allocations();
    let address = space.allocate(64);
    assert!(address != 0);
    let x = HeapObject::format_boxed(address, 64);
    unsafe {
        *x.slot(0) = tag_pointer(y.address());
    }

    let mut visitor = CountingScavengeVisitor::new(&young);
    // No card was dirtied, so the remembered-set pass finds nothing.
    space.visit_remembered_set(&mut visitor);
    assert_eq!(visitor.young_visits, 0);

    // The promoted track covers x; the first completion round scans it.
    assert!(space.complete_scavenge_generational(&mut visitor));
    assert_eq!(visitor.young_visits, 1);
    assert!(!space.complete_scavenge_generational(&mut visitor));
    space.end_tracking_allocations();

    // The visitor reported the surviving young pointer through the sink.
    let md = space.chunks()[0].metadata();
    assert_ne!(md.remembered_byte(x.address()), 0);
    #[cfg(debug_assertions)]
    {
        space.flush();
        space.verify(&young);
    }
}

#[test]
fn clean_cards_are_skipped() {
    let young = TestYoungSpace::new(64);
    let mut space = OldSpace::new();
    assert!(space.expand(16 * 1024));

    let mut visitor = CountingScavengeVisitor::new(&young);
    space.visit_remembered_set(&mut visitor);
    assert_eq!(visitor.sinks_installed, 0);
    assert_eq!(visitor.young_visits, 0);
}

#[test]
fn marking_stack_overflow_recovers() {
    const FANOUT: usize = 2000;

    let mut space = OldSpace::new();
    space.set_allocation_budget(8 * 1024 * 1024);

    let address = space.allocate((FANOUT + 1) * WORD_SIZE);
    assert!(address != 0);
    let wide = HeapObject::format_boxed(address, (FANOUT + 1) * WORD_SIZE);

    let mut children = vec![];
    for i in 0..FANOUT {
        let address = space.allocate(2 * WORD_SIZE);
        assert!(address != 0);
        let child = HeapObject::format_boxed(address, 2 * WORD_SIZE);
        unsafe {
            *wide.slot(i) = tag_pointer(child.address());
        }
        children.push(child);
    }

    space.flush();
    let mut roots = vec![tag_pointer(wide.address())];
    let mut stack = MarkingStack::new();
    {
        let mut visitor = MarkingVisitor::new(&space, &mut stack);
        let range = roots.as_mut_ptr_range();
        visitor.visit_block(range.start, range.end);
    }
    stack.process(&space);

    assert!(stack.overflow_events() >= 1);
    assert!(space.is_alive(wide));
    assert_eq!(space.new_location(wide), wide);
    for child in &children {
        assert!(space.is_alive(*child));
    }

    space.sweep();
    assert_eq!(space.used(), (FANOUT + 1) * WORD_SIZE + FANOUT * 2 * WORD_SIZE);
}

#[test]
fn dead_weak_referent_is_reaped() {
    let mut space = OldSpace::new();
    let address = space.allocate(2 * WORD_SIZE);
    assert!(address != 0);
    let unreachable = HeapObject::format_boxed(address, 2 * WORD_SIZE);

    let mut slot: Word = tag_pointer(unreachable.address());
    let mut finalized: usize = 0;
    space.register_weak_pointer(&mut slot, reap, &mut finalized as *mut usize as *mut u8);

    collect(&mut space, &mut []);

    assert_eq!(slot, smi(0));
    assert_eq!(finalized, 1);
    // The referent's memory went back to the free list.
    assert!(space
        .free_list()
        .spans()
        .iter()
        .any(|&(start, size)| start <= unreachable.address()
            && unreachable.address() < start + size));

    // The entry is gone; another collection must not finalize again.
    collect(&mut space, &mut []);
    assert_eq!(finalized, 1);
}

#[test]
fn exhausted_budget_requests_collection() {
    let mut space = OldSpace::new();
    space.set_allocation_budget(0);
    assert_eq!(space.allocate(64), 0);

    {
        let mut scope = NoAllocationFailureScope::new(&mut space);
        let address = scope.allocate(64);
        assert!(address != 0);
        HeapObject::format_boxed(address, 64);
    }

    // Outside the scope the budget rules again once the window closes;
    // bump allocation itself never consults the budget.
    space.flush();
    assert_eq!(space.allocate(64), 0);
}

#[test]
fn flush_while_tracking_without_window_is_a_noop() {
    let mut space = OldSpace::new();
    space.start_tracking_allocations();
    space.flush();
    space.end_tracking_allocations();
}

#[test]
fn unlinking_promoted_tracks_leaves_a_traversable_heap() {
    let mut space = OldSpace::new();
    space.start_tracking_allocations();
    let address = space.allocate(64);
    assert!(address != 0);
    HeapObject::format_boxed(address, 64);
    space.unlink_promoted_track();
    space.end_tracking_allocations();

    // Zapped track headers decay to fillers; the sweep walks over them.
    space.sweep();
    assert_eq!(space.used(), 0);
}

#[test]
fn mark_sweep_twice_is_idempotent() {
    let mut space = OldSpace::new();
    space.set_allocation_budget(8 * 1024 * 1024);

    let mut objects = vec![];
    for i in 0..40 {
        let size = (2 + i % 7) * WORD_SIZE;
        let address = space.allocate(size);
        assert!(address != 0);
        objects.push(HeapObject::format_boxed(address, size));
    }
    for i in 0..40 {
        unsafe {
            *objects[i].slot(0) = tag_pointer(objects[(i * 7 + 3) % 40].address());
        }
    }
    let mut roots: Vec<Word> = objects
        .iter()
        .step_by(3)
        .map(|object| tag_pointer(object.address()))
        .collect();

    collect(&mut space, &mut roots);
    let used = space.used();
    let spans = space.free_list().spans();
    let starts: Vec<Vec<u8>> = space
        .chunks()
        .iter()
        .map(|chunk| chunk.metadata().starts_snapshot())
        .collect();

    collect(&mut space, &mut roots);
    assert_eq!(space.used(), used);
    assert_eq!(space.free_list().spans(), spans);
    let starts_after: Vec<Vec<u8>> = space
        .chunks()
        .iter()
        .map(|chunk| chunk.metadata().starts_snapshot())
        .collect();
    assert_eq!(starts, starts_after);
}

#[test]
fn scavenge_forwards_until_no_young_pointers_remain() {
    let mut young = TestYoungSpace::new(1024);
    let y0 = young.allocate(4 * WORD_SIZE);
    let y1 = young.allocate(4 * WORD_SIZE);
    let y2 = young.allocate(4 * WORD_SIZE);
    let y3 = young.allocate(4 * WORD_SIZE);
    // A young-to-young edge, found only when y1's promoted copy is
    // retraced.
    unsafe {
        *y1.slot(0) = tag_pointer(y2.address());
    }

    let mut space = OldSpace::new();
    space.set_allocation_budget(8 * 1024 * 1024);
    let o1_address = space.allocate(64);
    let o2_address = space.allocate(64);
    assert!(o1_address != 0 && o2_address != 0);
    let o1 = HeapObject::format_boxed(o1_address, 64);
    let o2 = HeapObject::format_boxed(o2_address, 64);
    unsafe {
        *o1.slot(0) = tag_pointer(y0.address());
        *o1.slot(1) = tag_pointer(y1.address());
        *o2.slot(3) = tag_pointer(y3.address());
    }
    space.insert_into_remembered_set(o1.address());
    space.insert_into_remembered_set(o2.address());

    space.start_tracking_allocations();
    let space_ptr: *mut OldSpace = &mut space;
    let mut visitor = ForwardingScavengeVisitor::new(space_ptr, &young);
    space.visit_remembered_set(&mut visitor);
    while space.complete_scavenge_generational(&mut visitor) {}
    space.end_tracking_allocations();

    assert_eq!(visitor.forwarded.len(), 4);
    // A sink was installed for every scanned object.
    assert!(!visitor.record.is_null());
    for chunk in space.chunks() {
        chunk.each_object(|object| {
            assert!(!object.contains_pointers_to(&young));
        });
    }
    // The forwarded slots point at the promoted copies.
    unsafe {
        let promoted = untag_pointer(*o1.slot(0));
        assert!(space.includes(promoted));
        assert_eq!(promoted, visitor.forwarded[&y0.address()]);
    }
    #[cfg(debug_assertions)]
    {
        space.flush();
        space.verify(&young);
    }
}

#[test]
fn random_allocate_collect_stress() {
    init_logging();
    let mut rng = thread_rng();
    let mut space = OldSpace::new();
    space.set_allocation_budget(2 * 1024 * 1024);

    let mut live: Vec<HeapObject> = vec![];
    for step in 0..600 {
        let mut roots: Vec<Word> = live
            .iter()
            .map(|object| tag_pointer(object.address()))
            .collect();
        match rng.gen_range(0..10) {
            0..=6 => {
                let size = rng.gen_range(2..64) * WORD_SIZE;
                let object = alloc_boxed(&mut space, &mut roots, size);
                if rng.gen_bool(0.5) {
                    live.push(object);
                }
            }
            7 => space.flush(),
            8 => {
                if live.len() > 4 {
                    let index = rng.gen_range(0..live.len());
                    live.swap_remove(index);
                }
            }
            _ => {
                collect(&mut space, &mut roots);
            }
        }
        // Cross-link random live objects to give marking a real graph.
        if live.len() >= 2 {
            let from = live[rng.gen_range(0..live.len())];
            let to = live[rng.gen_range(0..live.len())];
            let slots = from.size() / WORD_SIZE - 1;
            unsafe {
                *from.slot(rng.gen_range(0..slots)) = tag_pointer(to.address());
            }
        }

        if step % 50 == 49 {
            space.flush();
            for chunk in space.chunks() {
                assert!(has_sentinel_at(chunk.usable_end()));
            }
            let reserved: usize = space.chunks().iter().map(|chunk| chunk.size()).sum();
            assert!(space.used() <= reserved);
            #[cfg(debug_assertions)]
            space.verify(&NoYoung);
        }
    }
}
