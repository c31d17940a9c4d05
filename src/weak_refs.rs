use im::Vector;

use crate::header::{is_heap_word, smi, untag_pointer, HeapObject, Word};
use crate::old_space::OldSpace;

/// Invoked on the dead referent before its memory is swept. Runs on the
/// collector's thread; it must not allocate into the old space and must
/// not resurrect the referent.
pub type WeakPointerCallback = fn(HeapObject, *mut u8);

/// A registered weak reference: a slot holding a tagged pointer plus the
/// finalizer to run when the referent dies.
#[derive(Clone)]
pub struct WeakPointer {
    slot: *mut Word,
    callback: WeakPointerCallback,
    arg: *mut u8,
}

impl WeakPointer {
    pub fn new(slot: *mut Word, callback: WeakPointerCallback, arg: *mut u8) -> WeakPointer {
        WeakPointer {
            slot,
            callback,
            arg,
        }
    }
}

/// Single pass over the registered weak pointers, between marking and
/// sweeping. A dead referent gets its slot nulled to a tagged zero and
/// its finalizer invoked exactly once; the entry is dropped. Live and
/// non-heap entries survive to the next collection.
pub(crate) fn process(pointers: &mut Vector<WeakPointer>, space: &OldSpace) {
    let mut survivors = Vector::new();
    for weak in pointers.iter() {
        unsafe {
            let word = *weak.slot;
            if is_heap_word(word) {
                let referent = HeapObject::from_address(untag_pointer(word));
                if space.includes(referent.address()) && !space.is_alive(referent) {
                    *weak.slot = smi(0);
                    (weak.callback)(referent, weak.arg);
                    continue;
                }
            }
            survivors.push_back(weak.clone());
        }
    }
    *pointers = survivors;
}
