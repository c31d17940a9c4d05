use crate::header::Word;

/// Visits blocks of pointer slots. Implementations may rewrite the visited
/// slots (the scavenger forwards young referents in place).
pub trait PointerVisitor {
    fn visit_block(&mut self, start: *mut Word, end: *mut Word);

    fn visit_pointer(&mut self, slot: *mut Word) {
        let end = unsafe { slot.add(1) };
        self.visit_block(slot, end);
    }
}

/// Membership test for the young generation. The remembered-set scan and
/// the debug verifier use it to recognize intergenerational pointers; the
/// young generation itself lives outside this crate.
pub trait YoungSpace {
    fn includes(&self, address: usize) -> bool;
}

/// A pointer visitor driven over dirty cards and promoted objects during a
/// scavenge. Before each object is scanned the space installs the object's
/// remembered-set byte; the visitor must store a nonzero value through it
/// whenever a visited slot still refers to young space afterwards.
pub trait ScavengeVisitor: PointerVisitor {
    fn set_record_new_space_pointers(&mut self, byte: *mut u8);
}
