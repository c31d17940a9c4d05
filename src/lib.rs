//! Old-generation mark-sweep heap of a generational object memory.
//!
//! Allocation bumps a pointer over a window carved from worst-fit free
//! list spans or fresh chunks; a card-granular remembered set makes the
//! space cheap to scan as a root set for a young-generation scavenge, and
//! in-heap promoted tracks record freshly tenured objects until their
//! interiors have been traced. Full collections mark through a bounded
//! stack with overflow recovery and sweep in one linear pass per chunk.

pub mod chunk;
pub mod free_list;
pub mod header;
pub mod mark_sweep;
pub mod metadata;
pub mod mmap;
pub mod old_space;
pub mod promoted_track;
pub mod utils;
pub mod visitor;
pub mod weak_refs;

#[cfg(test)]
mod tests;

pub use header::{HeapObject, Word, WORD_SIZE};
pub use mark_sweep::{collect, MarkingStack, MarkingVisitor};
pub use old_space::{NoAllocationFailureScope, OldSpace};
pub use visitor::{PointerVisitor, ScavengeVisitor, YoungSpace};
pub use weak_refs::WeakPointerCallback;
