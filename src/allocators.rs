//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded, non-thread-safe heap manager. It
//! implements `allocate`, `free`, `reallocate` and `zero_allocate` on top of a
//! single contiguous heap, which it grows on demand through a `HeapGrower`.
//! Because it is not thread-safe, it cannot be used as a global allocator
//! directly.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps `RawAlloc` with a spin lock to make it
//! thread-safe, and implements `GlobalAlloc`. Every operation takes the one
//! lock for its whole duration.
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `GenericAllocator` that grows the process data segment with `sbrk`.
//! Requires the `use_libc` feature.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the calls to
//! the OS to expand the heap.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a static array that can pretend to be a heap, and implements
//! `HeapGrower` for such a purpose. It is mainly useful for testing.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::ops::{Deref, DerefMut};
use core::ptr::{addr_of_mut, null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "use_libc")]
use errno::Errno;
use log::{debug, trace};
use spin::{Mutex, MutexGuard};

use crate::block::{pack, round_up, write_word, Block, ALIGNMENT, CHUNK_SIZE, MIN_BLOCK_SIZE, WSIZE};
use crate::checker::{check_heap, Stats, Validity};
use crate::seglist::{SegList, SegListDisplay};

/// A `HeapGrower` owns one contiguous region of memory, which it can extend
/// upwards on request.
///
/// # Safety
///
/// Implementations must uphold:
///
/// - `grow_heap(n)` either fails, leaving the region unchanged, or extends it
///   by exactly `n` bytes and returns the old `heap_hi()`.
/// - `heap_lo()` is aligned to 16 bytes and never changes once the region is
///   non-empty.
/// - `heap_lo()..heap_hi()` is valid for reads and writes, and is not used by
///   anything other than the owner of the `HeapGrower`.
pub unsafe trait HeapGrower {
    type Err: fmt::Debug;

    /// Grow the heap by exactly `increment` bytes, returning a pointer to the
    /// start of the new space.
    ///
    /// # Safety
    ///
    /// The new memory is uninitialized and untracked; the caller takes
    /// ownership of it.
    unsafe fn grow_heap(&mut self, increment: usize) -> Result<NonNull<u8>, Self::Err>;

    /// The lowest address in the heap.
    fn heap_lo(&self) -> *mut u8;

    /// One past the highest address in the heap.
    fn heap_hi(&self) -> *mut u8;

    /// The whole heap, as bytes.
    fn heap(&self) -> &[u8] {
        let len = self.heap_hi() as usize - self.heap_lo() as usize;
        if len == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.heap_lo(), len) }
    }

    /// The whole heap, as mutable bytes.
    fn heap_mut(&mut self) -> &mut [u8] {
        let len = self.heap_hi() as usize - self.heap_lo() as usize;
        if len == 0 {
            return &mut [];
        }
        unsafe { core::slice::from_raw_parts_mut(self.heap_lo(), len) }
    }
}

/// SbrkHeapGrower grows the process data segment with `sbrk`.
///
/// Only one of these should exist per process, and nothing else in the process
/// may move the program break while it is in use.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct SbrkHeapGrower {
    // Addresses rather than pointers, so that the grower is Send
    lo: usize,
    hi: usize,
    // Just for tracking, not really needed
    growths: usize,
}

#[cfg(feature = "use_libc")]
impl SbrkHeapGrower {
    pub const fn new() -> Self {
        SbrkHeapGrower {
            lo: 0,
            hi: 0,
            growths: 0,
        }
    }

    pub fn growths(&self) -> usize {
        self.growths
    }

    unsafe fn sbrk(increment: usize) -> Result<usize, Errno> {
        let ptr = libc::sbrk(increment as libc::intptr_t);
        if ptr as isize == -1 {
            return Err(errno::errno());
        }
        Ok(ptr as usize)
    }
}

#[cfg(feature = "use_libc")]
unsafe impl HeapGrower for SbrkHeapGrower {
    type Err = Errno;

    unsafe fn grow_heap(&mut self, increment: usize) -> Result<NonNull<u8>, Errno> {
        // sbrk takes a signed increment
        if increment > isize::MAX as usize {
            return Err(Errno(libc::ENOMEM));
        }
        if self.lo == 0 {
            // The break may not be aligned yet; pad it out before we start.
            let current = Self::sbrk(0)?;
            let padding = round_up(current, ALIGNMENT).unwrap_or(current) - current;
            if padding > 0 {
                Self::sbrk(padding)?;
            }
            self.lo = current + padding;
            self.hi = self.lo;
        }

        let start = Self::sbrk(increment)?;
        if start != self.hi {
            // Someone else moved the break; our heap is no longer contiguous.
            debug!("Program break moved from {:#x} to {:#x}", self.hi, start);
            Self::sbrk(0usize.wrapping_sub(increment))?;
            return Err(Errno(libc::ENOMEM));
        }
        self.hi = start + increment;
        self.growths += 1;

        Ok(NonNull::new_unchecked(start as *mut u8))
    }

    fn heap_lo(&self) -> *mut u8 {
        self.lo as *mut u8
    }

    fn heap_hi(&self) -> *mut u8 {
        self.hi as *mut u8
    }
}

/// A raw allocator, capable of growing the heap, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// Free blocks are kept in a [`SegList`](../seglist/struct.SegList.html) of
/// size classes, and are merged with their neighbours as soon as they are
/// freed, so no two free blocks are ever adjacent.
///
/// Note: It never returns memory to the OS; that is not implemented.
pub struct RawAlloc<G> {
    pub grower: G,
    pub free_lists: SegList,
    // The first block after the prologue, once initialized
    heap_start: Option<Block>,
}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

/// Calculate the size of the block needed to hold `size` bytes of payload.
///
/// Returns `None` if that doesn't fit in a `usize`.
pub fn block_size(size: usize) -> Option<usize> {
    let asize = round_up(size.checked_add(WSIZE)?, ALIGNMENT)?;
    Some(asize.max(MIN_BLOCK_SIZE))
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Create a new `RawAlloc`. The heap is set up by [`init`](#method.init),
    /// or on the first allocation.
    pub const fn new(grower: G) -> Self {
        RawAlloc {
            grower,
            free_lists: SegList::new(),
            heap_start: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.heap_start.is_some()
    }

    /// Set up an empty heap: a prologue and epilogue, and one free chunk
    /// between them.
    ///
    /// Calling this again after it has succeeded does nothing. If the
    /// sentinels are written but the first chunk can't be added, this returns
    /// the error and leaves the heap valid but empty. Calling `init` again
    /// after that returns `Ok(())` without adding the chunk, so the heap is
    /// still empty; later allocations grow it as usual.
    pub fn init(&mut self) -> Result<(), G::Err> {
        if self.heap_start.is_some() {
            return Ok(());
        }

        let start = unsafe { self.grower.grow_heap(2 * WSIZE)? };
        let prologue = self.offset_of(start.as_ptr());
        let first = Block::from_offset(prologue + WSIZE);

        let mem = self.grower.heap_mut();
        write_word(mem, prologue, pack(0, true, true));
        first.write_epilogue(mem, true);

        self.heap_start = Some(first);
        self.free_lists = SegList::new();
        debug!("Initialized heap at {:p}", self.grower.heap_lo());

        self.extend_heap(CHUNK_SIZE)?;
        Ok(())
    }

    /// Get statistics on this allocator, and verify the validity of the heap
    /// and the free lists.
    pub fn stats(&self) -> (Validity, Stats) {
        match self.heap_start {
            None => (Validity::default(), Stats::default()),
            Some(start) => check_heap(self.grower.heap(), start, &self.free_lists),
        }
    }

    /// Something displayable showing the contents of the free lists.
    pub fn free_list_display(&self) -> SegListDisplay<'_> {
        SegListDisplay {
            lists: &self.free_lists,
            mem: self.grower.heap(),
        }
    }

    #[cfg(feature = "check-heap")]
    fn check(&self) {
        let (validity, stats) = self.stats();
        assert!(
            validity.is_valid(),
            "Heap check failed: {:?} {:?}",
            validity,
            stats
        );
    }

    #[cfg(not(feature = "check-heap"))]
    #[inline(always)]
    fn check(&self) {}

    fn offset_of(&self, ptr: *const u8) -> usize {
        debug_assert!(ptr >= self.grower.heap_lo() as *const u8);
        debug_assert!(ptr < self.grower.heap_hi() as *const u8);
        ptr as usize - self.grower.heap_lo() as usize
    }

    fn payload_ptr(&mut self, block: Block) -> *mut u8 {
        self.grower.heap_mut()[block.payload()..].as_mut_ptr()
    }

    ////////////////////////////////////////////////////////////
    // Growth and coalescing

    /// Grow the heap by `size` bytes (rounded up to the alignment), and
    /// return the free block covering the new space, merged with any free
    /// block that ended where the heap used to.
    fn extend_heap(&mut self, size: usize) -> Result<Block, G::Err> {
        let size = round_up(size, ALIGNMENT).unwrap_or(usize::MAX & !(ALIGNMENT - 1));
        let start = unsafe { self.grower.grow_heap(size)? };
        trace!("Extended heap by {} bytes at {:p}", size, start);

        // The old epilogue becomes the header of the new block.
        let block = Block::from_payload(self.offset_of(start.as_ptr()));
        let mem = self.grower.heap_mut();
        let prev_allocated = block.prev_allocated(mem);
        block.write(mem, size, false, prev_allocated);
        block.next(mem).write_epilogue(mem, false);

        Ok(self.coalesce_block(block))
    }

    /// Merge a free block with its free neighbours, if any, and index the
    /// result. `None` passes straight through.
    pub fn coalesce(&mut self, block: Option<Block>) -> Option<Block> {
        block.map(|b| self.coalesce_block(b))
    }

    // The block must already be marked free, and must not be in a free list.
    fn coalesce_block(&mut self, block: Block) -> Block {
        let mem = self.grower.heap_mut();
        debug_assert!(!block.is_allocated(mem));

        let size = block.size(mem);
        let next = block.next(mem);
        let prev = if block.prev_allocated(mem) {
            None
        } else {
            block.prev(mem)
        };
        let next_free = !next.is_allocated(mem);

        let merged = match (prev, next_free) {
            (None, false) => block,
            (None, true) => {
                self.free_lists.remove(mem, next);
                let tag = block.tag(mem);
                block.write(mem, size + next.size(mem), false, tag.prev_allocated);
                block
            }
            (Some(prev), false) => {
                self.free_lists.remove(mem, prev);
                let tag = prev.tag(mem);
                prev.write(mem, tag.size + size, false, tag.prev_allocated);
                prev
            }
            (Some(prev), true) => {
                self.free_lists.remove(mem, prev);
                self.free_lists.remove(mem, next);
                let tag = prev.tag(mem);
                let total = tag.size + size + next.size(mem);
                prev.write(mem, total, false, tag.prev_allocated);
                prev
            }
        };

        merged.next(mem).set_prev_allocated(mem, false);
        self.free_lists.insert(mem, merged);
        merged
    }

    // Cut an allocated block down to `asize`, returning the rest to the free
    // lists, if the rest is big enough to be a block of its own.
    fn split_block(&mut self, block: Block, asize: usize) {
        let mem = self.grower.heap_mut();
        debug_assert!(block.is_allocated(mem));

        let tag = block.tag(mem);
        let size = tag.size;
        if size - asize < MIN_BLOCK_SIZE {
            return;
        }

        block.write(mem, asize, true, tag.prev_allocated);
        let rest = block.next(mem);
        rest.write(mem, size - asize, false, true);
        rest.next(mem).set_prev_allocated(mem, false);
        self.free_lists.insert(mem, rest);
    }

    ////////////////////////////////////////////////////////////
    // The allocation interface

    /// Allocate a block with room for at least `size` bytes, aligned to 16
    /// bytes.
    ///
    /// Returns null if `size` is 0 or if the heap can't grow any further.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if !self.is_initialized() {
            if let Err(e) = self.init() {
                debug!("Failed to initialize heap: {:?}", e);
                return null_mut();
            }
        }

        if size == 0 {
            return null_mut();
        }
        self.check();

        let asize = match block_size(size) {
            Some(asize) => asize,
            None => return null_mut(),
        };

        let block = match self.free_lists.find_fit(self.grower.heap(), asize) {
            Some(block) => block,
            None => match self.extend_heap(asize.max(CHUNK_SIZE)) {
                Ok(block) => block,
                Err(e) => {
                    debug!("Out of memory allocating {} bytes: {:?}", size, e);
                    return null_mut();
                }
            },
        };

        let mem = self.grower.heap_mut();
        debug_assert!(!block.is_allocated(mem));
        self.free_lists.remove(mem, block);
        let tag = block.tag(mem);
        block.write(mem, tag.size, true, tag.prev_allocated);
        block.next(mem).set_prev_allocated(mem, true);

        self.split_block(block, asize);
        self.check();

        self.payload_ptr(block)
    }

    /// Free a block returned by one of the allocation methods. Null is
    /// ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator, and must
    /// not be used again afterwards.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.check();

        let block = Block::from_payload(self.offset_of(ptr));
        let mem = self.grower.heap_mut();
        let tag = block.tag(mem);
        debug_assert!(tag.allocated, "Double free of {:p}", ptr);

        block.write(mem, tag.size, false, tag.prev_allocated);
        block.next(mem).set_prev_allocated(mem, false);
        self.coalesce_block(block);
        self.check();
    }

    /// Move an allocation into a block with room for `size` bytes, keeping as
    /// much of its contents as fits.
    ///
    /// A null `ptr` allocates; a `size` of 0 frees and returns null. If a new
    /// block can't be allocated, null is returned and `ptr` is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator. Unless
    /// null is returned for a non-zero `size`, `ptr` must not be used again.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            self.free(ptr);
            return null_mut();
        }
        if ptr.is_null() {
            return self.allocate(size);
        }

        let old = Block::from_payload(self.offset_of(ptr));
        let old_size = old.payload_size(self.grower.heap());

        let new_ptr = self.allocate(size);
        if new_ptr.is_null() {
            return null_mut();
        }

        let copied = size.min(old_size);
        let src = old.payload();
        let dst = self.offset_of(new_ptr);
        self.grower.heap_mut().copy_within(src..src + copied, dst);

        self.free(ptr);
        new_ptr
    }

    /// Allocate room for `count` elements of `elem_size` bytes each, filled
    /// with zeroes.
    ///
    /// Returns null if `count` is 0, or if the total size overflows.
    pub fn zero_allocate(&mut self, count: usize, elem_size: usize) -> *mut u8 {
        if count == 0 {
            return null_mut();
        }
        let size = match count.checked_mul(elem_size) {
            Some(size) => size,
            None => return null_mut(),
        };

        let ptr = self.allocate(size);
        if ptr.is_null() {
            return ptr;
        }

        let start = self.offset_of(ptr);
        self.grower.heap_mut()[start..start + size].fill(0);
        ptr
    }
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// Thread-safety is required for an allocator to be used as a global allocator,
/// so that was easy to add with a spin lock.
pub struct GenericAllocator<G> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    lock: Mutex<()>,
    // Only touched while `lock` is held, once `init` is 2
    raw: UnsafeCell<MaybeUninit<RawAlloc<G>>>,
}

unsafe impl<G: Send> Sync for GenericAllocator<G> {}

/// Exclusive access to the `RawAlloc` inside a [`GenericAllocator`], held
/// until dropped.
pub struct RawAllocGuard<'a, G> {
    _lock: MutexGuard<'a, ()>,
    raw: &'a mut RawAlloc<G>,
}

impl<G> Deref for RawAllocGuard<'_, G> {
    type Target = RawAlloc<G>;

    fn deref(&self) -> &RawAlloc<G> {
        self.raw
    }
}

impl<G> DerefMut for RawAllocGuard<'_, G> {
    fn deref_mut(&mut self) -> &mut RawAlloc<G> {
        self.raw
    }
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            lock: Mutex::new(()),
            raw: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Get a reference to the underlying RawAlloc.
    ///
    /// # Safety
    ///
    /// This is unsafe because it blocks allocation while the mutex guard is in
    /// place.
    pub unsafe fn get_raw(&self) -> RawAllocGuard<'_, G> {
        // The plan:
        // - Check if initialization hasn't started (0)
        // - If initializing hasn't yet started (0):
        //   - Mark it as initializing (1), then initialize, then mark it as fully initialized (2)
        // - If it has started but not completed (1):
        //   - Enter a spin loop until it is fully initialized (2)
        // - If it finished initializing (2):
        //   - Continue
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {}
            Ok(0) => {
                // Fill in the fields where they live: a grower may be far too
                // large to build on the stack and then move.
                let raw = (*self.raw.get()).as_mut_ptr();
                addr_of_mut!((*raw).grower).write(G::default());
                addr_of_mut!((*raw).free_lists).write(SegList::new());
                addr_of_mut!((*raw).heap_start).write(None);

                // Let other threads know that the raw allocator is now
                // initialized, and they are free to lock it
                self.init.store(2, Ordering::SeqCst);
            }
            Err(1) => {
                // Some other thread is currently initializing. We wait for it.
                loop {
                    core::hint::spin_loop();

                    match self.init.load(Ordering::SeqCst) {
                        1 => continue,
                        2 => break,
                        state => panic!("Unexpected state {}", state),
                    }
                }
            }
            Ok(v) => panic!("Unexpected OK state loaded: {}", v),
            Err(v) => panic!("Unexpected Err state loaded: {}", v),
        }

        let lock = self.lock.lock();
        RawAllocGuard {
            _lock: lock,
            raw: &mut *(*self.raw.get()).as_mut_ptr(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        unsafe { self.get_raw().stats() }
    }
}

unsafe impl<G: HeapGrower + Default + Send> GlobalAlloc for GenericAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.get_raw().allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.get_raw().free(ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.get_raw().zero_allocate(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.get_raw().reallocate(ptr, new_size)
    }
}

/// A global allocator over the process data segment.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<SbrkHeapGrower>,
}

#[cfg(feature = "use_libc")]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

#[cfg(feature = "use_libc")]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}

const TOY_HEAP_SIZE: usize = 256 * 1024;

/// A fixed-size array that pretends to be a heap.
///
/// Pointers into a `ToyHeap` are only good for as long as it stays where it
/// is; moving it (or the `RawAlloc` holding it) invalidates them.
#[repr(C, align(16))]
pub struct ToyHeap {
    pub heap: [u8; TOY_HEAP_SIZE],
    pub size: usize,
    /// Growth past this many bytes fails.
    pub limit: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            size: 0,
            limit: TOY_HEAP_SIZE,
        }
    }
}

impl ToyHeap {
    pub fn with_limit(limit: usize) -> Self {
        ToyHeap {
            limit: limit.min(TOY_HEAP_SIZE),
            ..ToyHeap::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

unsafe impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn grow_heap(&mut self, increment: usize) -> Result<NonNull<u8>, Self::Err> {
        let available = self.limit - self.size;
        if increment > available {
            return Err(ToyHeapOverflowError {
                requested: increment,
                available,
            });
        }

        let ptr = self.heap.as_mut_ptr().add(self.size);
        self.size += increment;
        Ok(NonNull::new_unchecked(ptr))
    }

    fn heap_lo(&self) -> *mut u8 {
        self.heap.as_ptr() as *mut u8
    }

    fn heap_hi(&self) -> *mut u8 {
        self.heap_lo().wrapping_add(self.size)
    }

    fn heap(&self) -> &[u8] {
        &self.heap[..self.size]
    }

    fn heap_mut(&mut self) -> &mut [u8] {
        &mut self.heap[..self.size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn assert_valid(allocator: &RawAlloc<ToyHeap>) -> Stats {
        let (validity, stats) = allocator.stats();
        log::info!("{:?} {}", stats, allocator.free_list_display());
        assert!(validity.is_valid(), "{:?}", validity);
        stats
    }

    fn fill(ptr: *mut u8, len: usize, value: u8) {
        unsafe { core::ptr::write_bytes(ptr, value, len) }
    }

    fn all_equal(ptr: *mut u8, len: usize, value: u8) -> bool {
        unsafe { core::slice::from_raw_parts(ptr, len) }
            .iter()
            .all(|&b| b == value)
    }

    #[test]
    fn test_block_size() {
        assert_eq!(block_size(1), Some(32));
        assert_eq!(block_size(24), Some(32));
        assert_eq!(block_size(25), Some(48));
        assert_eq!(block_size(100), Some(112));
        assert_eq!(block_size(usize::MAX - 4), None);
    }

    #[test]
    fn test_init() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        assert!(!allocator.is_initialized());
        allocator.init().unwrap();
        let stats = assert_valid(&allocator);
        assert_eq!(stats.heap_size, 2 * WSIZE + CHUNK_SIZE);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_size, CHUNK_SIZE);

        // A second init changes nothing
        allocator.init().unwrap();
        assert_eq!(assert_valid(&allocator), stats);
    }

    #[test]
    fn test_init_failure() {
        let mut allocator = RawAlloc::new(ToyHeap::with_limit(64));
        assert!(allocator.init().is_err());
        assert!(allocator.allocate(16).is_null());
    }

    #[test]
    fn test_init_retry_after_failure() {
        let mut allocator = RawAlloc::new(ToyHeap::with_limit(2 * WSIZE + 64));
        assert!(allocator.init().is_err());
        assert!(allocator.is_initialized());

        // The sentinels are in place, so a retry succeeds without the chunk
        allocator.init().unwrap();
        let stats = assert_valid(&allocator);
        assert_eq!(stats.heap_size, 2 * WSIZE);
        assert_eq!(stats.blocks, 0);

        // Allocations still grow the heap once there is room
        assert!(allocator.allocate(16).is_null());
        allocator.grower.limit = TOY_HEAP_SIZE;
        let p = allocator.allocate(16);
        assert!(!p.is_null());
        assert_eq!(assert_valid(&allocator).allocated_size, 32);
    }

    #[test]
    fn test_basic() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        assert!(allocator.allocate(0).is_null());
        let p1 = allocator.allocate(100);
        assert!(!p1.is_null());
        assert_valid(&allocator);
        let p2 = allocator.allocate(200);
        assert!(!p2.is_null());
        assert_ne!(p1, p2);
        assert_valid(&allocator);

        for &p in &[p1, p2] {
            assert_eq!(p as usize % ALIGNMENT, 0);
        }
        // Blocks are carved off the front of the first free block, in order
        assert_eq!(p2 as usize - p1 as usize, block_size(100).unwrap());

        fill(p2, 200, 0xAB);
        unsafe { allocator.free(p1) };
        assert_valid(&allocator);

        let p3 = allocator.allocate(90);
        assert!(!p3.is_null());
        assert_valid(&allocator);
        // The freed block fits, and it's the head of the smallest class
        assert_eq!(p3, p1);
        let p3_end = p3 as usize + 90;
        assert!(p3_end <= p2 as usize);
        assert!(all_equal(p2, 200, 0xAB));

        unsafe { allocator.free(p2) };
        unsafe { allocator.free(p3) };
        let stats = assert_valid(&allocator);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn test_coalesce_left_and_right() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        let p1 = allocator.allocate(16);
        let p2 = allocator.allocate(16);
        let p3 = allocator.allocate(16);
        fill(p3, 16, 7);
        let before = assert_valid(&allocator);
        assert_eq!(before.free_blocks, 1);

        unsafe { allocator.free(p2) };
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_blocks, 2);

        // p1's right neighbour is p2's free block
        unsafe { allocator.free(p1) };
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.blocks, 3);
        let heap = allocator.grower.heap();
        let merged = Block::from_payload(p1 as usize - heap.as_ptr() as usize);
        assert_eq!(merged.size(heap), 2 * block_size(16).unwrap());
        assert!(all_equal(p3, 16, 7));

        // Freeing p3 merges with both neighbours
        unsafe { allocator.free(p3) };
        let stats = assert_valid(&allocator);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_size, CHUNK_SIZE);
    }

    #[test]
    fn test_coalesce_left() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        let p1 = allocator.allocate(40);
        let p2 = allocator.allocate(40);
        let _p3 = allocator.allocate(40);

        unsafe { allocator.free(p1) };
        unsafe { allocator.free(p2) };
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_blocks, 2);
        let heap = allocator.grower.heap();
        let merged = Block::from_payload(p1 as usize - heap.as_ptr() as usize);
        assert_eq!(merged.size(heap), 2 * block_size(40).unwrap());
        assert_eq!(allocator.free_lists.find_fit(heap, 96), Some(merged));
    }

    #[test]
    fn test_coalesce_none() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        assert_eq!(allocator.coalesce(None), None);
    }

    #[test]
    fn test_round_trip() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        allocator.init().unwrap();
        let before = assert_valid(&allocator);

        for &size in &[1, 24, 100, 1000, 4000, 10_000] {
            let p = allocator.allocate(size);
            assert!(!p.is_null());
            unsafe { allocator.free(p) };
            let after = assert_valid(&allocator);
            assert_eq!(after.blocks, 1);
            assert_eq!(after.free_size, after.heap_size - 2 * WSIZE);
            assert_eq!(before.blocks, after.blocks);
        }
    }

    #[test]
    fn test_free_null() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let p = allocator.allocate(64);
        let before = assert_valid(&allocator);
        let heap_before = allocator.grower.heap().to_vec();
        unsafe { allocator.free(null_mut()) };
        assert_eq!(assert_valid(&allocator), before);
        assert_eq!(allocator.grower.heap(), &heap_before[..]);
        unsafe { allocator.free(p) };
    }

    #[test]
    fn test_grow_heap() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let small = allocator.allocate(100);
        // Doesn't fit in the rest of the first chunk
        let big = allocator.allocate(3 * CHUNK_SIZE);
        assert!(!small.is_null());
        assert!(!big.is_null());
        let stats = assert_valid(&allocator);
        assert!(stats.heap_size > 3 * CHUNK_SIZE);
        // The new space was merged with the free tail of the first chunk
        assert_eq!(big as usize - small as usize, block_size(100).unwrap());
        fill(big, 3 * CHUNK_SIZE, 0x11);
        unsafe { allocator.free(big) };
        unsafe { allocator.free(small) };
        assert_eq!(assert_valid(&allocator).blocks, 1);
    }

    #[test]
    fn test_out_of_memory() {
        let mut allocator = RawAlloc::new(ToyHeap::with_limit(2 * CHUNK_SIZE));
        let p = allocator.allocate(1000);
        assert!(!p.is_null());
        fill(p, 1000, 0x5A);

        assert!(allocator.allocate(4 * CHUNK_SIZE).is_null());
        assert_valid(&allocator);

        // A failed reallocation leaves the original alone
        let q = unsafe { allocator.reallocate(p, 4 * CHUNK_SIZE) };
        assert!(q.is_null());
        assert!(all_equal(p, 1000, 0x5A));
        assert_valid(&allocator);

        // Absurd sizes fail rather than wrapping around
        assert!(allocator.allocate(usize::MAX).is_null());
        assert!(allocator.allocate(usize::MAX - 2 * CHUNK_SIZE).is_null());
        assert_valid(&allocator);
        unsafe { allocator.free(p) };
    }

    #[test]
    fn test_reallocate() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        let p = unsafe { allocator.reallocate(null_mut(), 50) };
        assert!(!p.is_null());
        for i in 0..50 {
            unsafe { *p.add(i) = i as u8 };
        }

        let q = unsafe { allocator.reallocate(p, 500) };
        assert!(!q.is_null());
        assert_valid(&allocator);
        for i in 0..50 {
            assert_eq!(unsafe { *q.add(i) }, i as u8);
        }

        // Shrinking keeps the prefix
        let r = unsafe { allocator.reallocate(q, 10) };
        assert!(!r.is_null());
        for i in 0..10 {
            assert_eq!(unsafe { *r.add(i) }, i as u8);
        }

        assert!(unsafe { allocator.reallocate(r, 0) }.is_null());
        let stats = assert_valid(&allocator);
        assert_eq!(stats.blocks, 1);
    }

    #[test]
    fn test_zero_allocate() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        // Dirty some memory, then give it back
        let p = allocator.allocate(512);
        fill(p, 512, 0xFF);
        unsafe { allocator.free(p) };

        let z = allocator.zero_allocate(16, 32);
        assert!(!z.is_null());
        assert!(all_equal(z, 512, 0));
        assert_valid(&allocator);

        assert!(allocator.zero_allocate(0, 32).is_null());
        assert!(allocator.zero_allocate(1 << 40, 1 << 40).is_null());
        assert!(allocator.zero_allocate(usize::MAX, 2).is_null());
        assert_valid(&allocator);
        unsafe { allocator.free(z) };
    }

    #[test]
    fn test_split_remainder() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        allocator.init().unwrap();

        // Leaves less than a minimum block at the end of the chunk, so the
        // allocation takes the whole thing.
        let p = allocator.allocate(CHUNK_SIZE - WSIZE - 16);
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.allocated_size, CHUNK_SIZE);
        unsafe { allocator.free(p) };
        assert_eq!(assert_valid(&allocator).free_size, CHUNK_SIZE);
    }

    #[test]
    fn test_generic_allocator() {
        static ALLOCATOR: GenericAllocator<ToyHeap> = GenericAllocator::new();

        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let p = ALLOCATOR.alloc(layout);
            assert!(!p.is_null());
            let z = ALLOCATOR.alloc_zeroed(layout);
            assert!(all_equal(z, 64, 0));
            let q = ALLOCATOR.realloc(p, layout, 128);
            assert!(!q.is_null());
            ALLOCATOR.dealloc(q, Layout::from_size_align(128, 8).unwrap());
            ALLOCATOR.dealloc(z, layout);

            let overaligned = Layout::from_size_align(64, 64).unwrap();
            assert!(ALLOCATOR.alloc(overaligned).is_null());
        }

        let (validity, stats) = ALLOCATOR.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.blocks, 1);
    }

    #[test]
    fn test_generic_allocator_small_stack() {
        static ALLOCATOR: GenericAllocator<ToyHeap> = GenericAllocator::new();

        // The default thread stack size; the heap must not pass through it
        let handle = std::thread::Builder::new()
            .stack_size(2 << 20)
            .spawn(|| unsafe {
                let mut raw = ALLOCATOR.get_raw();
                let p = raw.allocate(100);
                assert!(!p.is_null());
                raw.free(p);
                raw.stats()
            })
            .unwrap();

        let (validity, stats) = handle.join().unwrap();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_size, CHUNK_SIZE);
    }
}
