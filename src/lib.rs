//! NOS user-space malloc
//!
//! A boundary-tagged, implicit free list allocator for userland: `init`,
//! `allocate`, `release`, and `reallocate` over one contiguous heap that
//! grows on demand and never shrinks. It is the crate a process links when
//! it wants explicit control over heap layout and growth instead of the
//! general-purpose allocator.
//!
//! Every block carries its size and allocation state in a 4-byte header and
//! a duplicate footer, so the chain of blocks needs no list structure at
//! all: the next block is `size` bytes ahead, the previous one is found
//! through the footer just below. Allocation is a first-fit scan with
//! splitting; release eagerly merges free neighbors; growth is delegated to
//! a [`HeapSource`], the single point of contact with the environment.
//!
//! ```text
//!   padding  prologue       blocks ...                         epilogue
//!   ┌───────┬───────┬───────┬──────────────────┬───────┬  ~  ┬───────┐
//!   │  pad  │ 8 | a │ 8 | a │ hdr │ payload... │  ftr  │     │ 0 | a │
//!   └───────┴───────┴───────┴──────────────────┴───────┴  ~  ┴───────┘
//!    4 bytes  header  footer                              8-byte aligned
//! ```
//!
//! # Quick start
//!
//! ```
//! use nos_ummalloc::{FixedHeap, ImplicitListAllocator};
//!
//! let mut region = vec![0u8; 64 * 1024];
//! let source = unsafe { FixedHeap::new(region.as_mut_ptr(), region.len()).unwrap() };
//! let mut heap = ImplicitListAllocator::new(source);
//! heap.init().unwrap();
//!
//! let p = heap.allocate(64).unwrap();
//! unsafe { p.as_ptr().write_bytes(0xab, 64) };
//! heap.release(p);
//! # heap.check().unwrap();
//! ```
//!
//! For process-wide use, [`LockedAllocator`] adapts an allocator to
//! `core::alloc::GlobalAlloc` behind a spinlock.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod arena;
pub mod error;
pub mod layout;
pub mod tag;

pub use allocator::global::LockedAllocator;
pub use allocator::implicit::{AllocatorStats, ImplicitListAllocator};
#[cfg(unix)]
pub use arena::Sbrk;
pub use arena::{Arena, FixedHeap, HeapSource};
pub use error::{Error, Result};
pub use tag::{BlockView, Tag, TagFlags};
