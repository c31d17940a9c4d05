use crate::utils::{is_aligned, BitFieldTrait};
use crate::visitor::{PointerVisitor, YoungSpace};

pub type Word = usize;
pub const WORD_SIZE: usize = std::mem::size_of::<Word>();

/// Tagged small integer: low bit clear, payload in the upper bits.
#[inline(always)]
pub const fn smi(value: isize) -> Word {
    (value as usize) << 1
}

/// The chunk-end sentinel. A tagged small-integer zero, so a plain zero
/// word. Written once per chunk and never overwritten afterwards.
pub const SENTINEL: Word = smi(0);

#[inline(always)]
pub const fn is_heap_word(word: Word) -> bool {
    word & 1 != 0
}

#[inline(always)]
pub const fn tag_pointer(address: usize) -> Word {
    address | 1
}

#[inline(always)]
pub const fn untag_pointer(word: Word) -> usize {
    word & !1
}

#[inline]
pub fn has_sentinel_at(address: usize) -> bool {
    unsafe { *(address as *const Word) == SENTINEL }
}

// The header is a single word in front of every heap object:
//
// +------+------+---------------------------------------------+
// | name | bits |                                             |
// +------+------+---------------------------------------------+
// | kind |    8 | filler / free span / promoted track / boxed |
// | size |   48 | size in words. Promoted tracks derive their |
// |      |      | size from the end word instead.             |
// +------+------+---------------------------------------------+
//
// Kind values start at 1 so a header word is never zero and cannot be
// mistaken for the sentinel.
pub struct KindField;
pub struct SizeField;

impl BitFieldTrait<0, 8> for KindField {}
impl BitFieldTrait<8, 48> for SizeField {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Kind {
    /// One-word inert object. Free-list remainders too small for a span
    /// record and zapped promoted-track headers decay to fillers.
    Filler = 1,
    /// In-place free-list record: `[header, next]`.
    FreeSpan = 2,
    /// In-place record covering a promoted-but-unscanned range:
    /// `[header, next, end]`.
    PromotedTrack = 3,
    /// Live payload. The body is tagged slots, all of them pointer slots.
    Boxed = 4,
}

#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct HeapObjectHeader {
    encoded: u64,
}

impl HeapObjectHeader {
    #[inline]
    pub fn new(kind: Kind, size: usize) -> Self {
        debug_assert!(is_aligned(size, WORD_SIZE));
        Self {
            encoded: KindField::encode(kind as u64)
                | SizeField::encode((size / WORD_SIZE) as u64),
        }
    }

    #[inline]
    pub fn kind(self) -> Kind {
        match KindField::decode(self.encoded) {
            1 => Kind::Filler,
            2 => Kind::FreeSpan,
            3 => Kind::PromotedTrack,
            4 => Kind::Boxed,
            _ => unreachable!("corrupt object header"),
        }
    }

    #[inline]
    pub fn size(self) -> usize {
        SizeField::decode(self.encoded) as usize * WORD_SIZE
    }
}

/// A word-aligned address of an object header. All heap reads and writes
/// go through the accessors here; the address itself is plain data and
/// stays valid across allocations (old space never moves objects).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeapObject {
    address: usize,
}

impl HeapObject {
    pub const HEADER_SIZE: usize = WORD_SIZE;

    #[inline]
    pub fn from_address(address: usize) -> Self {
        debug_assert!(address != 0 && is_aligned(address, WORD_SIZE));
        Self { address }
    }

    #[inline]
    pub fn address(self) -> usize {
        self.address
    }

    #[inline]
    pub fn header(self) -> HeapObjectHeader {
        unsafe { *(self.address as *const HeapObjectHeader) }
    }

    #[inline]
    pub fn kind(self) -> Kind {
        self.header().kind()
    }

    #[inline]
    pub fn is_filler(self) -> bool {
        self.kind() == Kind::Filler
    }

    /// Size in bytes, including the header. Word-aligned and positive for
    /// every well-formed object, so address-order traversal always makes
    /// progress.
    #[inline]
    pub fn size(self) -> usize {
        match self.kind() {
            Kind::PromotedTrack => {
                let end = unsafe { *((self.address + 2 * WORD_SIZE) as *const Word) };
                end - self.address
            }
            _ => self.header().size(),
        }
    }

    #[inline]
    pub fn body_start(self) -> usize {
        self.address + Self::HEADER_SIZE
    }

    #[inline]
    pub fn slot(self, index: usize) -> *mut Word {
        debug_assert!(Self::HEADER_SIZE + (index + 1) * WORD_SIZE <= self.size());
        (self.body_start() + index * WORD_SIZE) as *mut Word
    }

    /// Invokes the visitor on every outgoing reference slot. Fillers, free
    /// spans and promoted tracks have no pointers of their own; a track's
    /// interior is visited by the scavenge-completion walk, not here.
    pub fn iterate_pointers(self, visitor: &mut dyn PointerVisitor) {
        if self.kind() == Kind::Boxed {
            let start = self.body_start() as *mut Word;
            let end = (self.address + self.size()) as *mut Word;
            visitor.visit_block(start, end);
        }
    }

    /// True when any slot holds a pointer into `young`.
    pub fn contains_pointers_to(self, young: &dyn YoungSpace) -> bool {
        if self.kind() != Kind::Boxed {
            return false;
        }
        let mut current = self.body_start();
        let end = self.address + self.size();
        while current < end {
            let word = unsafe { *(current as *const Word) };
            if is_heap_word(word) && young.includes(untag_pointer(word)) {
                return true;
            }
            current += WORD_SIZE;
        }
        false
    }

    /// Writes a boxed object header at `address` and clears the body to
    /// tagged zeros so every slot decodes as a small integer.
    pub fn format_boxed(address: usize, size: usize) -> HeapObject {
        debug_assert!(size >= Self::HEADER_SIZE + WORD_SIZE);
        unsafe {
            *(address as *mut HeapObjectHeader) = HeapObjectHeader::new(Kind::Boxed, size);
            core::ptr::write_bytes(
                (address + Self::HEADER_SIZE) as *mut u8,
                0,
                size - Self::HEADER_SIZE,
            );
        }
        Self::from_address(address)
    }

    /// Writes a one-word filler at `address`.
    pub fn format_filler(address: usize) -> HeapObject {
        unsafe {
            *(address as *mut HeapObjectHeader) = HeapObjectHeader::new(Kind::Filler, WORD_SIZE);
        }
        Self::from_address(address)
    }
}
