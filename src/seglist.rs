use core::fmt;

use static_assertions::const_assert;

use crate::block::{Block, MIN_BLOCK_SIZE};

/// Number of size classes.
pub const SEG_COUNT: usize = 14;

/// log2 of the smallest block size, which heads the first class.
const MIN_CLASS_SHIFT: usize = 5;

const_assert!(1 << MIN_CLASS_SHIFT == MIN_BLOCK_SIZE);

/// The size class for a free block of `size` bytes.
///
/// Class `i` holds sizes in `[2^(i+5), 2^(i+6))`, except for the last class,
/// which holds everything too large for the others.
pub fn seg_index(size: usize) -> usize {
    debug_assert!(size >= MIN_BLOCK_SIZE);
    let log2 = (usize::BITS - 1 - (size | 1).leading_zeros()) as usize;
    log2.saturating_sub(MIN_CLASS_SHIFT).min(SEG_COUNT - 1)
}

/// A `SegList` is an array of size classes, each a circular, doubly-linked
/// list of free blocks.
///
/// The links live inside the free blocks themselves, so every operation takes
/// the heap memory the blocks live in. An empty class has no head; a class
/// with one member links that member to itself.
///
/// Invariants:
///
/// - Every member is free, and is a member of exactly one class, the one
///   given by `seg_index` of its size.
/// - For every member, `next.prev == member` and `prev.next == member`.
#[derive(Clone, Debug, Default)]
pub struct SegList {
    heads: [Option<Block>; SEG_COUNT],
}

impl SegList {
    pub const fn new() -> Self {
        SegList {
            heads: [None; SEG_COUNT],
        }
    }

    /// The head of the given class, if it has any members.
    pub fn head(&self, index: usize) -> Option<Block> {
        self.heads[index]
    }

    /// Iterate through the members of one class, starting at its head.
    pub fn iter_class<'mem>(&self, mem: &'mem [u8], index: usize) -> ClassIter<'mem> {
        ClassIter {
            mem,
            head: self.heads[index],
            next: self.heads[index],
        }
    }

    /// Iterate through every free block, class by class.
    pub fn iter<'a>(&'a self, mem: &'a [u8]) -> impl Iterator<Item = Block> + 'a {
        (0..SEG_COUNT).flat_map(move |index| self.iter_class(mem, index))
    }

    /// Total number of free blocks in all classes.
    pub fn len(&self, mem: &[u8]) -> usize {
        self.iter(mem).count()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(Option::is_none)
    }

    /// Whether `block` is a member of the class its size maps to.
    pub fn contains(&self, mem: &[u8], block: Block) -> bool {
        let index = seg_index(block.size(mem));
        self.iter_class(mem, index).any(|b| b == block)
    }

    /// Push a free block onto the head of its class.
    ///
    /// The block's header must already describe it as free.
    pub fn insert(&mut self, mem: &mut [u8], block: Block) {
        debug_assert!(!block.is_allocated(mem));
        let index = seg_index(block.size(mem));

        match self.heads[index] {
            None => {
                block.set_next_free(mem, block);
                block.set_prev_free(mem, block);
            }
            Some(head) => {
                let tail = head.prev_free(mem);
                block.set_next_free(mem, head);
                block.set_prev_free(mem, tail);
                tail.set_next_free(mem, block);
                head.set_prev_free(mem, block);
            }
        }

        self.heads[index] = Some(block);
    }

    /// Unlink a free block from its class.
    ///
    /// The block's size must not have changed since it was inserted.
    pub fn remove(&mut self, mem: &mut [u8], block: Block) {
        debug_assert!(
            self.contains(mem, block),
            "Removing {:?}, which is not in its free list",
            block
        );
        let index = seg_index(block.size(mem));

        let next = block.next_free(mem);
        if next == block {
            // The only member
            self.heads[index] = None;
            return;
        }

        let prev = block.prev_free(mem);
        prev.set_next_free(mem, next);
        next.set_prev_free(mem, prev);

        if self.heads[index] == Some(block) {
            self.heads[index] = Some(next);
        }
    }

    /// Find a free block of at least `size` bytes, without removing it.
    ///
    /// Classes are searched from the one `size` maps to upwards, first-fit
    /// within each class. Any member of a higher class is large enough, so in
    /// practice only the first class searched is scanned past its head.
    pub fn find_fit(&self, mem: &[u8], size: usize) -> Option<Block> {
        (seg_index(size)..SEG_COUNT)
            .find_map(|index| self.iter_class(mem, index).find(|b| b.size(mem) >= size))
    }
}

/// Iterator over one class of a [`SegList`].
pub struct ClassIter<'mem> {
    mem: &'mem [u8],
    head: Option<Block>,
    next: Option<Block>,
}

impl<'mem> Iterator for ClassIter<'mem> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let current = self.next.take()?;
        let following = current.next_free(self.mem);
        if Some(following) != self.head {
            self.next = Some(following);
        }
        Some(current)
    }
}

/// Displays the free lists held in some heap memory.
pub struct SegListDisplay<'a> {
    pub lists: &'a SegList,
    pub mem: &'a [u8],
}

impl fmt::Display for SegListDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegList(")?;
        let mut start = true;
        for index in 0..SEG_COUNT {
            if self.lists.head(index).is_none() {
                continue;
            }
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{}: [", index)?;
            for (i, block) in self.lists.iter_class(self.mem, index).enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}:{}", block.offset(), block.size(self.mem))?;
            }
            write!(f, "]")?;
        }

        write!(f, ")")
    }
}
