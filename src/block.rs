//! Boundary tags and block offset math.
//!
//! Every block starts with a one-word header holding its size and two flags:
//! whether the block itself is allocated, and whether the block physically
//! before it is allocated. Free blocks additionally keep a copy of the header
//! in their last word (the footer) and store their free-list links in the
//! space that would otherwise be payload:
//!
//! ```text
//! Allocated:  | header | payload ...                         |
//! Free:       | header | next link | prev link | ... | footer |
//! ```
//!
//! Allocated blocks have no footer; the successor's "previous allocated" bit
//! tells a neighbour everything it needs to know without one.
//!
//! Blocks are identified by the offset of their header from the bottom of the
//! heap, never by native pointers, and every word is read and written through
//! bounds-checked slice indexing.

use static_assertions::const_assert;

/// A single boundary-tag word.
pub type Word = u64;

/// Size of a boundary-tag word, in bytes.
pub const WSIZE: usize = core::mem::size_of::<Word>();

/// All payloads are aligned to this, and all block sizes are multiples of it.
pub const ALIGNMENT: usize = 2 * WSIZE;

/// Header, two free-list links, and a footer.
pub const MIN_BLOCK_SIZE: usize = 2 * ALIGNMENT;

/// The heap is always extended by at least this much.
pub const CHUNK_SIZE: usize = 1 << 12;

const ALLOC_MASK: Word = 0x1;
const PREV_ALLOC_MASK: Word = 0x2;
const SIZE_MASK: Word = !0xF;

const_assert!(ALIGNMENT == 16);
const_assert!(MIN_BLOCK_SIZE >= 4 * WSIZE);
const_assert!(CHUNK_SIZE % ALIGNMENT == 0);
const_assert!(core::mem::size_of::<usize>() <= WSIZE);

/// Round `value` up to the nearest multiple of `n`.
///
/// Returns `None` if the result does not fit in a `usize`.
pub const fn round_up(value: usize, n: usize) -> Option<usize> {
    match value.checked_add(n - 1) {
        Some(v) => Some(n * (v / n)),
        None => None,
    }
}

/// The decoded contents of a header or footer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub size: usize,
    pub allocated: bool,
    pub prev_allocated: bool,
}

/// Pack a block size and its flags into a single word.
///
/// `size` must be a multiple of 16, leaving the low four bits for flags.
pub const fn pack(size: usize, allocated: bool, prev_allocated: bool) -> Word {
    let mut word = size as Word;
    if allocated {
        word |= ALLOC_MASK;
    }
    if prev_allocated {
        word |= PREV_ALLOC_MASK;
    }
    word
}

/// Unpack a header or footer word.
pub const fn unpack(word: Word) -> Tag {
    Tag {
        size: (word & SIZE_MASK) as usize,
        allocated: word & ALLOC_MASK != 0,
        prev_allocated: word & PREV_ALLOC_MASK != 0,
    }
}

impl Tag {
    pub const fn pack(self) -> Word {
        pack(self.size, self.allocated, self.prev_allocated)
    }
}

/// Read the word at `offset`. Panics if it lies outside `mem`.
pub fn read_word(mem: &[u8], offset: usize) -> Word {
    let mut bytes = [0u8; WSIZE];
    bytes.copy_from_slice(&mem[offset..offset + WSIZE]);
    Word::from_ne_bytes(bytes)
}

/// Write the word at `offset`. Panics if it lies outside `mem`.
pub fn write_word(mem: &mut [u8], offset: usize, word: Word) {
    mem[offset..offset + WSIZE].copy_from_slice(&word.to_ne_bytes());
}

/// A block in the heap, identified by the offset of its header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(usize);

impl Block {
    pub const fn from_offset(offset: usize) -> Block {
        Block(offset)
    }

    /// The block owning the payload starting at `payload`.
    pub const fn from_payload(payload: usize) -> Block {
        Block(payload - WSIZE)
    }

    /// Offset of the header word.
    pub const fn offset(self) -> usize {
        self.0
    }

    /// Offset of the first payload byte.
    pub const fn payload(self) -> usize {
        self.0 + WSIZE
    }

    /// Offset of the footer word of a block of `size` bytes.
    pub const fn footer(self, size: usize) -> usize {
        self.0 + size - WSIZE
    }

    const fn next_link(self) -> usize {
        self.0 + WSIZE
    }

    const fn prev_link(self) -> usize {
        self.0 + 2 * WSIZE
    }

    pub fn tag(self, mem: &[u8]) -> Tag {
        unpack(read_word(mem, self.0))
    }

    pub fn size(self, mem: &[u8]) -> usize {
        self.tag(mem).size
    }

    pub fn is_allocated(self, mem: &[u8]) -> bool {
        self.tag(mem).allocated
    }

    pub fn prev_allocated(self, mem: &[u8]) -> bool {
        self.tag(mem).prev_allocated
    }

    /// Bytes available to the caller while this block is allocated.
    pub fn payload_size(self, mem: &[u8]) -> usize {
        self.size(mem) - WSIZE
    }

    /// The decoded footer of this block. Only meaningful for free blocks.
    pub fn footer_tag(self, mem: &[u8]) -> Tag {
        let size = self.size(mem);
        debug_assert!(size != 0, "footer_tag called on the epilogue");
        unpack(read_word(mem, self.footer(size)))
    }

    /// Write a block's header, and its footer if it is free.
    pub fn write(self, mem: &mut [u8], size: usize, allocated: bool, prev_allocated: bool) {
        debug_assert!(size >= MIN_BLOCK_SIZE);
        debug_assert!(size % ALIGNMENT == 0);
        let word = pack(size, allocated, prev_allocated);
        write_word(mem, self.0, word);
        if !allocated {
            write_word(mem, self.footer(size), word);
        }
    }

    /// Write a zero-sized, allocated epilogue header at this block.
    pub fn write_epilogue(self, mem: &mut [u8], prev_allocated: bool) {
        write_word(mem, self.0, pack(0, true, prev_allocated));
    }

    /// Update the "previous allocated" bit, keeping a free block's footer in
    /// step with its header.
    pub fn set_prev_allocated(self, mem: &mut [u8], prev_allocated: bool) {
        let tag = Tag {
            prev_allocated,
            ..self.tag(mem)
        };
        write_word(mem, self.0, tag.pack());
        if !tag.allocated && tag.size != 0 {
            write_word(mem, self.footer(tag.size), tag.pack());
        }
    }

    /// The block physically after this one.
    ///
    /// Must not be called on the epilogue.
    pub fn next(self, mem: &[u8]) -> Block {
        let size = self.size(mem);
        debug_assert!(size != 0, "next called on the epilogue");
        Block(self.0 + size)
    }

    /// The block physically before this one, found through its footer.
    ///
    /// The previous block must be free (or be the prologue, which yields
    /// `None`); allocated blocks have no footer to read.
    pub fn prev(self, mem: &[u8]) -> Option<Block> {
        let footer = unpack(read_word(mem, self.0 - WSIZE));
        if footer.size == 0 {
            return None;
        }
        Some(Block(self.0 - footer.size))
    }

    /// The next block in this block's free list.
    pub fn next_free(self, mem: &[u8]) -> Block {
        Block(read_word(mem, self.next_link()) as usize)
    }

    /// The previous block in this block's free list.
    pub fn prev_free(self, mem: &[u8]) -> Block {
        Block(read_word(mem, self.prev_link()) as usize)
    }

    pub fn set_next_free(self, mem: &mut [u8], next: Block) {
        write_word(mem, self.next_link(), next.0 as Word);
    }

    pub fn set_prev_free(self, mem: &mut [u8], prev: Block) {
        write_word(mem, self.prev_link(), prev.0 as Word);
    }
}
