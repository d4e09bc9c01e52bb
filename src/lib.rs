#![cfg_attr(not(test), no_std)]

//! A segregated free-list memory allocator, written in pure Rust.
//!
//! The allocator manages one contiguous heap, grown on demand through a
//! [`HeapGrower`](allocators/trait.HeapGrower.html). The heap is a chain of
//! blocks carrying boundary tags, bracketed by a zero-sized prologue and
//! epilogue:
//!
//! ```text
//! | prologue | block | block | ... | block | epilogue |
//! ```
//!
//! Free blocks are kept in circular, doubly-linked lists, one per size class,
//! and are merged with their free neighbours as soon as they are freed.
//! Allocation searches the classes from the smallest that could fit upwards,
//! splits off whatever is left over, and grows the heap when nothing fits.
//!
//! ## Modules
//!
//! - [`block`](block/index.html): the boundary-tag format, and all block
//!   offset math.
//! - [`seglist`](seglist/index.html): the size-class free lists.
//! - [`checker`](checker/index.html): a heap consistency checker.
//! - [`allocators`](allocators/index.html): the allocator itself, heap
//!   growers, and a thread-safe wrapper implementing `GlobalAlloc`.
//!
//! ## Example
//!
//! ```
//! use seglist_alloc::{RawAlloc, ToyHeap};
//!
//! let mut allocator = RawAlloc::new(ToyHeap::default());
//! let p = allocator.allocate(100);
//! assert!(!p.is_null());
//! unsafe { allocator.free(p) };
//! assert!(allocator.stats().0.is_valid());
//! ```

pub mod allocators;
pub mod block;
pub mod checker;
pub mod seglist;

#[cfg(feature = "use_libc")]
pub use allocators::{SbrkHeapGrower, UnixAllocator};
pub use allocators::{GenericAllocator, HeapGrower, RawAlloc, RawAllocGuard, ToyHeap};
pub use checker::{Stats, Validity};
