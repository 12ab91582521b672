//! Heap arena and the environment boundary
//!
//! This is the only module that touches raw memory. Everything above it
//! computes block boundaries as integer offsets into one contiguous,
//! monotonically growing byte region; the [`Arena`] bounds-checks every
//! access before the offset is turned into an address.
//!
//! The sole call into the environment is [`HeapSource::extend`]: "extend the
//! process heap by N bytes, return the new region's start address or fail."
//! Two sources ship with the crate: [`FixedHeap`] hands out slices of a
//! caller-supplied region and fails when it is exhausted, and [`Sbrk`] moves
//! the program break on Unix hosts.

use core::ptr::{self, NonNull};

use crate::error::{Error, Result};
use crate::layout::{is_aligned, ALIGNMENT, WSIZE};

/// The environment's heap-extension primitive.
///
/// Each call must return a region that begins exactly where the previous
/// one ended, so the committed heap stays contiguous. A failed extension is
/// surfaced to the caller immediately and never retried.
pub trait HeapSource {
    /// Extends the heap by `bytes` bytes, returning the new region's start.
    fn extend(&mut self, bytes: usize) -> Result<NonNull<u8>>;
}

/// Heap source over a fixed caller-supplied memory region.
///
/// Hands the region out chunk by chunk and fails with
/// [`Error::OutOfMemory`] once it is exhausted. This is the source used by
/// the test suite and by embedded callers that reserve their heap up front.
pub struct FixedHeap {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
}

impl FixedHeap {
    /// Creates a source over the `capacity` bytes starting at `base`.
    ///
    /// The usable region starts at the first 8-byte boundary at or after
    /// `base`; the capacity shrinks by the skipped padding.
    ///
    /// # Safety
    ///
    /// - `base` must point to valid, contiguous, writable memory of at
    ///   least `capacity` bytes
    /// - the region must stay valid and untouched by other code for the
    ///   lifetime of the source and of every allocator built on it
    pub unsafe fn new(base: *mut u8, capacity: usize) -> Result<Self> {
        let Some(base) = NonNull::new(base) else {
            return Err(Error::InvalidArgument("null heap region"));
        };
        let addr = base.as_ptr() as usize;
        let padding = crate::layout::align_up(addr, ALIGNMENT) - addr;
        if capacity <= padding {
            return Err(Error::InvalidArgument("heap region too small"));
        }
        let aligned = unsafe { base.as_ptr().add(padding) };
        Ok(Self {
            // aligned is padding bytes into a non-null region
            base: unsafe { NonNull::new_unchecked(aligned) },
            capacity: capacity - padding,
            brk: 0,
        })
    }

    /// Bytes still available for extension.
    pub fn remaining(&self) -> usize {
        self.capacity - self.brk
    }
}

impl HeapSource for FixedHeap {
    fn extend(&mut self, bytes: usize) -> Result<NonNull<u8>> {
        if self.remaining() < bytes {
            return Err(Error::OutOfMemory);
        }
        let start = unsafe { self.base.as_ptr().add(self.brk) };
        self.brk += bytes;
        // start is inside the non-null region
        Ok(unsafe { NonNull::new_unchecked(start) })
    }
}

// The source exclusively owns its region per the contract of `new`.
unsafe impl Send for FixedHeap {}

/// Heap source backed by the `sbrk(2)` program-break primitive.
///
/// Assumes nothing else in the process moves the break between extensions,
/// which is the deal a process makes when it replaces its general-purpose
/// allocator.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Sbrk;

#[cfg(unix)]
impl HeapSource for Sbrk {
    fn extend(&mut self, bytes: usize) -> Result<NonNull<u8>> {
        if bytes > isize::MAX as usize {
            return Err(Error::OutOfMemory);
        }
        let prev = unsafe { libc::sbrk(bytes as libc::intptr_t) };
        if prev as usize == usize::MAX {
            return Err(Error::OutOfMemory);
        }
        NonNull::new(prev as *mut u8).ok_or(Error::OutOfMemory)
    }
}

/// The committed heap region, addressed by byte offsets.
///
/// Owns the base address and committed length and performs every raw read
/// and write on behalf of the modules above it. Offsets are validated
/// against the committed length; a violated bound is a caller bug and
/// panics rather than touching memory outside the region.
pub struct Arena<S> {
    source: S,
    base: Option<NonNull<u8>>,
    len: usize,
}

impl<S> Arena<S> {
    /// Creates an empty arena over `source`; no memory is committed yet.
    pub const fn new(source: S) -> Self {
        Self {
            source,
            base: None,
            len: 0,
        }
    }

    /// Committed heap size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether any memory has been committed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the tag word at `offset`.
    pub fn read_word(&self, offset: usize) -> u32 {
        assert!(is_aligned(offset, WSIZE), "misaligned word read");
        assert!(
            offset + WSIZE <= self.len,
            "word read at {} outside the committed heap",
            offset
        );
        unsafe { (self.ptr_at(offset) as *const u32).read() }
    }

    /// Writes the tag word at `offset`.
    pub fn write_word(&mut self, offset: usize, word: u32) {
        assert!(is_aligned(offset, WSIZE), "misaligned word write");
        assert!(
            offset + WSIZE <= self.len,
            "word write at {} outside the committed heap",
            offset
        );
        unsafe { (self.ptr_at(offset) as *mut u32).write(word) }
    }

    /// The address of the payload starting at `offset`.
    pub fn payload_ptr(&self, offset: usize) -> NonNull<u8> {
        let ptr = self.ptr_at(offset);
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Translates an address handed out by [`Self::payload_ptr`] back into
    /// its offset, or `None` if it lies outside the committed heap.
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let base = self.base?.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        if addr < base || addr >= base + self.len {
            return None;
        }
        Some(addr - base)
    }

    /// Copies `len` payload bytes from `src` to `dst`.
    ///
    /// The two ranges belong to distinct blocks and must not overlap.
    pub fn copy_payload(&mut self, src: usize, dst: usize, len: usize) {
        assert!(src + len <= self.len && dst + len <= self.len);
        debug_assert!(src + len <= dst || dst + len <= src);
        unsafe { ptr::copy_nonoverlapping(self.ptr_at(src), self.ptr_at(dst), len) }
    }

    /// Fills `len` bytes starting at `offset` with `byte`.
    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.len);
        unsafe { ptr::write_bytes(self.ptr_at(offset), byte, len) }
    }

    fn ptr_at(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset outside the committed heap");
        match self.base {
            Some(base) => unsafe { base.as_ptr().add(offset) },
            None => panic!("arena accessed before the first extension"),
        }
    }
}

impl<S: HeapSource> Arena<S> {
    /// Commits `bytes` more bytes from the source, returning the offset at
    /// which the new region starts.
    pub fn extend(&mut self, bytes: usize) -> Result<usize> {
        debug_assert!(is_aligned(bytes, ALIGNMENT));
        let start = self.source.extend(bytes)?;
        match self.base {
            None => {
                debug_assert!(is_aligned(start.as_ptr() as usize, ALIGNMENT));
                self.base = Some(start);
            }
            Some(base) => {
                // the heap is one contiguous region; the source must append
                debug_assert_eq!(
                    start.as_ptr() as usize,
                    base.as_ptr() as usize + self.len,
                    "heap source returned a non-contiguous region"
                );
            }
        }
        let offset = self.len;
        self.len += bytes;
        Ok(offset)
    }
}

// The arena exclusively owns its committed region.
unsafe impl<S: Send> Send for Arena<S> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_heap_hands_out_contiguous_chunks() {
        let mut buffer = vec![0u8; 1024];
        let mut source = unsafe { FixedHeap::new(buffer.as_mut_ptr(), buffer.len()).unwrap() };

        let first = source.extend(64).unwrap();
        let second = source.extend(32).unwrap();
        assert_eq!(
            second.as_ptr() as usize,
            first.as_ptr() as usize + 64,
        );
        assert!(is_aligned(first.as_ptr() as usize, ALIGNMENT));
    }

    #[test]
    fn test_fixed_heap_exhaustion() {
        let mut buffer = vec![0u8; 64];
        let mut source = unsafe { FixedHeap::new(buffer.as_mut_ptr(), buffer.len()).unwrap() };

        assert!(source.extend(40).is_ok());
        assert_eq!(source.extend(40), Err(Error::OutOfMemory));
        // a smaller request can still fit afterwards
        assert!(source.extend(16).is_ok());
    }

    #[test]
    fn test_fixed_heap_rejects_bad_regions() {
        assert!(matches!(
            unsafe { FixedHeap::new(core::ptr::null_mut(), 1024) },
            Err(Error::InvalidArgument("null heap region"))
        ));
    }

    #[test]
    fn test_arena_word_round_trip() {
        let mut buffer = vec![0u8; 256];
        let source = unsafe { FixedHeap::new(buffer.as_mut_ptr(), buffer.len()).unwrap() };
        let mut arena = Arena::new(source);

        assert!(arena.is_empty());
        assert_eq!(arena.extend(32).unwrap(), 0);
        assert_eq!(arena.extend(16).unwrap(), 32);
        assert_eq!(arena.len(), 48);

        arena.write_word(0, 0xdead_beef);
        arena.write_word(44, 0x41);
        assert_eq!(arena.read_word(0), 0xdead_beef);
        assert_eq!(arena.read_word(44), 0x41);
    }

    #[test]
    fn test_arena_address_translation() {
        let mut buffer = vec![0u8; 256];
        let source = unsafe { FixedHeap::new(buffer.as_mut_ptr(), buffer.len()).unwrap() };
        let mut arena = Arena::new(source);
        arena.extend(64).unwrap();

        let ptr = arena.payload_ptr(16);
        assert_eq!(arena.offset_of(ptr), Some(16));

        let outside = NonNull::new(arena.payload_ptr(0).as_ptr().wrapping_sub(8)).unwrap();
        assert_eq!(arena.offset_of(outside), None);
    }

    #[test]
    #[should_panic(expected = "outside the committed heap")]
    fn test_arena_rejects_out_of_bounds_reads() {
        let mut buffer = vec![0u8; 256];
        let source = unsafe { FixedHeap::new(buffer.as_mut_ptr(), buffer.len()).unwrap() };
        let mut arena = Arena::new(source);
        arena.extend(32).unwrap();
        arena.read_word(32);
    }
}
