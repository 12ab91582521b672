//! Process-wide allocator adapter
//!
//! [`LockedAllocator`] wraps the core allocator in a `spin::Mutex` and
//! implements [`GlobalAlloc`], so one heap can replace the general-purpose
//! allocator of a process. The core is single-threaded by contract; the
//! lock is what serializes callers on its behalf. The heap is bootstrapped
//! lazily on the first allocation, since `#[global_allocator]` statics have
//! no init hook.
//!
//! ```rust,ignore
//! use nos_ummalloc::{LockedAllocator, Sbrk};
//!
//! #[global_allocator]
//! static ALLOCATOR: LockedAllocator<Sbrk> = LockedAllocator::new(Sbrk);
//! ```

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{null_mut, NonNull};

use log::warn;
use spin::{Mutex, MutexGuard};

use crate::allocator::implicit::ImplicitListAllocator;
use crate::arena::HeapSource;
use crate::layout::ALIGNMENT;

/// A lock-serialized allocator suitable for `#[global_allocator]`.
pub struct LockedAllocator<S> {
    inner: Mutex<ImplicitListAllocator<S>>,
}

impl<S> LockedAllocator<S> {
    /// Creates an adapter over an uninitialized allocator.
    pub const fn new(source: S) -> Self {
        Self {
            inner: Mutex::new(ImplicitListAllocator::new(source)),
        }
    }

    /// Locks and returns the wrapped allocator, for direct access to
    /// `stats`, `check`, or an eager `init`.
    pub fn lock(&self) -> MutexGuard<'_, ImplicitListAllocator<S>> {
        self.inner.lock()
    }
}

impl<S: HeapSource> LockedAllocator<S> {
    fn ensure_ready(alloc: &mut ImplicitListAllocator<S>) -> bool {
        if alloc.is_ready() {
            return true;
        }
        match alloc.init() {
            Ok(()) => true,
            Err(err) => {
                warn!("heap bootstrap failed: {}", err);
                false
            }
        }
    }
}

unsafe impl<S: HeapSource + Send> GlobalAlloc for LockedAllocator<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            warn!("refusing allocation aligned to {} bytes", layout.align());
            return null_mut();
        }
        let mut inner = self.inner.lock();
        if !Self::ensure_ready(&mut inner) {
            return null_mut();
        }
        match inner.allocate(layout.size()) {
            Some(ptr) => ptr.as_ptr(),
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.inner.lock().release(ptr);
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            warn!("refusing allocation aligned to {} bytes", layout.align());
            return null_mut();
        }
        let mut inner = self.inner.lock();
        if !Self::ensure_ready(&mut inner) {
            return null_mut();
        }
        match inner.allocate_zeroed(layout.size()) {
            Some(ptr) => ptr.as_ptr(),
            None => null_mut(),
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            warn!("refusing allocation aligned to {} bytes", layout.align());
            return null_mut();
        }
        let mut inner = self.inner.lock();
        if !Self::ensure_ready(&mut inner) {
            return null_mut();
        }
        match inner.reallocate(NonNull::new(ptr), new_size) {
            Some(ptr) => ptr.as_ptr(),
            None => null_mut(),
        }
    }
}
