//! Memory allocator module
//!
//! The implicit-list allocator itself lives in [`implicit`]; [`global`]
//! wraps it behind a lock so it can serve as the process-wide allocator.

pub mod global;
pub mod implicit;

pub use global::LockedAllocator;
pub use implicit::{AllocatorStats, ImplicitListAllocator};
