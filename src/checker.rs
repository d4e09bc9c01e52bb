//! Heap consistency checking.
//!
//! [`check_heap`] walks every block from the first one to the epilogue, then
//! walks every free list, and counts each kind of broken invariant it finds.
//! It never modifies the heap and can be run at any point between operations.

use crate::block::{read_word, unpack, Block, Word, ALIGNMENT, MIN_BLOCK_SIZE, WSIZE};
use crate::seglist::{seg_index, SegList, SEG_COUNT};

// Header bits that are neither part of the size nor a flag.
const RESERVED_BITS: Word = 0xC;

/// Validity contains a count of every invalid state found in a heap.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// The prologue or epilogue is missing or not a zero-sized allocated tag.
    pub bad_sentinels: usize,
    /// Blocks whose payload is not aligned relative to the start of the heap,
    /// or whose header has stray bits set below the size.
    pub misaligned: usize,
    /// Blocks extending past the end of the heap.
    ///
    /// The heap walk stops at the first one of these.
    pub out_of_bounds: usize,
    /// Blocks smaller than the minimum block size.
    pub undersized: usize,
    /// Free blocks whose footer disagrees with their header.
    pub tag_mismatches: usize,
    /// Blocks whose "previous allocated" bit is wrong.
    pub prev_bit_mismatches: usize,
    /// Pairs of free blocks that sit next to each other without being merged.
    pub adjacent_frees: usize,
    /// Free list members that are not free blocks in the heap.
    pub allocated_in_list: usize,
    /// Free list members stored in a class that doesn't match their size.
    pub wrong_class: usize,
    /// Free list members whose neighbours don't link back to them, or lists
    /// that never return to their head.
    pub broken_links: usize,
    /// Difference between the number of free blocks found by walking the heap
    /// and the number found by walking the free lists.
    pub free_count_mismatch: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Number of blocks, not counting sentinels.
    pub blocks: usize,
    pub free_blocks: usize,
    /// Total size of free blocks, including their boundary tags.
    pub free_size: usize,
    /// Total size of allocated blocks, including their headers.
    pub allocated_size: usize,
    /// Size of the whole heap, including sentinels.
    pub heap_size: usize,
}

/// Check a heap whose first block starts at `start`, and whose free blocks
/// are indexed by `lists`.
pub fn check_heap(mem: &[u8], start: Block, lists: &SegList) -> (Validity, Stats) {
    let mut validity = Validity::default();
    let mut stats = Stats {
        heap_size: mem.len(),
        ..Stats::default()
    };

    // The prologue sits in the word right before the first block.
    match start.offset().checked_sub(WSIZE) {
        Some(prologue) if mem.len() >= start.offset() + WSIZE => {
            let tag = unpack(read_word(mem, prologue));
            if tag.size != 0 || !tag.allocated {
                validity.bad_sentinels += 1;
            }
        }
        _ => {
            validity.bad_sentinels += 1;
            return (validity, stats);
        }
    }

    let mut block = start;
    let mut prev_allocated = true;
    loop {
        if block.offset() + WSIZE > mem.len() {
            validity.out_of_bounds += 1;
            break;
        }
        let tag = block.tag(mem);

        if tag.prev_allocated != prev_allocated {
            validity.prev_bit_mismatches += 1;
        }

        if tag.size == 0 {
            // The epilogue: it must be allocated, and be the last word.
            if !tag.allocated || block.offset() + WSIZE != mem.len() {
                validity.bad_sentinels += 1;
            }
            break;
        }

        let stray = read_word(mem, block.offset()) & RESERVED_BITS;
        if block.payload() % ALIGNMENT != 0 || stray != 0 {
            validity.misaligned += 1;
        }
        if tag.size < MIN_BLOCK_SIZE {
            validity.undersized += 1;
        }
        // Leave room for the epilogue after every block.
        if block.offset() + tag.size + WSIZE > mem.len() {
            validity.out_of_bounds += 1;
            break;
        }

        if !tag.allocated {
            if block.footer_tag(mem) != tag {
                validity.tag_mismatches += 1;
            }
            if !prev_allocated {
                validity.adjacent_frees += 1;
            }
            stats.free_blocks += 1;
            stats.free_size += tag.size;
        } else {
            stats.allocated_size += tag.size;
        }

        stats.blocks += 1;
        prev_allocated = tag.allocated;
        block = block.next(mem);
    }

    let listed = check_lists(mem, lists, stats.blocks, &mut validity);
    if listed != stats.free_blocks {
        validity.free_count_mismatch += listed.max(stats.free_blocks) - listed.min(stats.free_blocks);
    }

    (validity, stats)
}

// Walk every class list, returning the number of members found. No list can
// hold more than `max_len` members, which bounds the walk if a list is
// corrupted into a cycle that skips its head.
fn check_lists(mem: &[u8], lists: &SegList, max_len: usize, validity: &mut Validity) -> usize {
    let in_bounds = |block: Block| block.offset() + MIN_BLOCK_SIZE <= mem.len();
    let mut count = 0;

    for index in 0..SEG_COUNT {
        let head = match lists.head(index) {
            None => continue,
            Some(head) => head,
        };

        let mut block = head;
        let mut steps = 0;
        loop {
            if !in_bounds(block) {
                validity.broken_links += 1;
                break;
            }
            let tag = block.tag(mem);
            if tag.allocated || tag.size < MIN_BLOCK_SIZE {
                validity.allocated_in_list += 1;
                break;
            }
            if seg_index(tag.size) != index {
                validity.wrong_class += 1;
            }

            let next = block.next_free(mem);
            let prev = block.prev_free(mem);
            if !in_bounds(next) || !in_bounds(prev) {
                validity.broken_links += 1;
                break;
            }
            if next.prev_free(mem) != block || prev.next_free(mem) != block {
                validity.broken_links += 1;
            }

            count += 1;
            steps += 1;
            if next == head {
                break;
            }
            if steps > max_len {
                validity.broken_links += 1;
                break;
            }
            block = next;
        }
    }

    count
}
