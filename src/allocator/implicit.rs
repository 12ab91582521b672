//! Implicit free list allocator with boundary tags
//!
//! Blocks form an implicit chain through address arithmetic alone: the next
//! block starts `size` bytes after the current one, and the duplicated
//! footer word lets the previous block be found the same way. Free blocks
//! are found by a first-fit scan of the whole chain; releasing a block
//! eagerly merges it with free neighbors so no two free blocks are ever
//! adjacent.
//!
//! The heap is bounded by two sentinels that are never merged away: an
//! 8-byte prologue block after one padding word, and a size-0 epilogue
//! header at the top. Every real block therefore has a left and a right
//! neighbor, and neither the scan nor the coalescer carries boundary
//! special cases.

use core::ptr::NonNull;

use log::{debug, trace, warn};

use crate::arena::{Arena, HeapSource};
use crate::error::{Error, Result};
use crate::layout::{
    is_aligned, ALIGNMENT, CHUNKSIZE, DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, WSIZE,
};
use crate::tag::{BlockView, Tag};

/// Payload offset of the first real block, immediately after the prologue.
const FIRST_BLOCK: usize = 2 * DSIZE;

/// Snapshot of the allocator's heap, produced by a full chain walk.
///
/// Byte counts cover whole blocks, tag words included; the sentinels are
/// not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Committed heap size in bytes, sentinels included.
    pub heap_size: usize,
    /// Total bytes in allocated blocks.
    pub allocated_bytes: usize,
    /// Total bytes in free blocks.
    pub free_bytes: usize,
    /// Number of allocated blocks.
    pub allocated_blocks: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Number of successful heap extensions.
    pub extensions: usize,
    /// Number of allocation requests that failed.
    pub failed_allocations: usize,
}

/// A first-fit, eagerly coalescing allocator over one growable heap.
///
/// The allocator is an explicit instance so independent heaps can coexist
/// and be tested in isolation; process-wide use goes through
/// [`LockedAllocator`](crate::allocator::global::LockedAllocator). It is
/// single-threaded by construction: callers serialize all access.
///
/// Created `Uninitialized`; [`init`](Self::init) bootstraps the sentinels
/// plus one default-chunk extension and moves it to `Ready`, where it stays
/// for the rest of its life.
pub struct ImplicitListAllocator<S> {
    arena: Arena<S>,
    ready: bool,
    extensions: usize,
    failed_allocations: usize,
}

impl<S> ImplicitListAllocator<S> {
    /// Creates an uninitialized allocator over `source`.
    pub const fn new(source: S) -> Self {
        Self {
            arena: Arena::new(source),
            ready: false,
            extensions: 0,
            failed_allocations: 0,
        }
    }

    /// Whether [`init`](Self::init) has completed.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Payload capacity of the live block at `ptr`, or `None` if `ptr` is
    /// not a live payload address.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        if !self.ready {
            return None;
        }
        let bp = self.arena.offset_of(ptr)?;
        let block = BlockView::at(&self.arena, bp);
        if !block.allocated() {
            return None;
        }
        Some(block.usable())
    }

    /// Walks the block chain and returns a usage snapshot.
    pub fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats {
            heap_size: self.arena.len(),
            allocated_bytes: 0,
            free_bytes: 0,
            allocated_blocks: 0,
            free_blocks: 0,
            extensions: self.extensions,
            failed_allocations: self.failed_allocations,
        };
        if self.arena.len() < FIRST_BLOCK {
            return stats;
        }
        let mut bp = FIRST_BLOCK;
        loop {
            let block = BlockView::at(&self.arena, bp);
            let size = block.size();
            if size == 0 {
                return stats;
            }
            if block.allocated() {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += size;
            }
            bp += size;
        }
    }

    /// Walks the heap and verifies its structural invariants: sentinel
    /// integrity, header/footer agreement, block alignment, and the absence
    /// of adjacent free blocks.
    ///
    /// Returns the first violation found as an [`Error::InvalidState`].
    pub fn check(&self) -> Result<()> {
        if self.arena.len() < FIRST_BLOCK {
            return Ok(());
        }
        let prologue = Tag::decode(self.arena.read_word(WSIZE));
        let prologue_footer = Tag::decode(self.arena.read_word(2 * WSIZE));
        if prologue.size != DSIZE || !prologue.allocated() || prologue != prologue_footer {
            return Err(Error::InvalidState("prologue sentinel damaged"));
        }

        let mut bp = FIRST_BLOCK;
        let mut prev_free = false;
        loop {
            let block = BlockView::at(&self.arena, bp);
            let header = block.header();
            if header.size == 0 {
                if !header.allocated() {
                    return Err(Error::InvalidState("epilogue sentinel damaged"));
                }
                if bp != self.arena.len() {
                    return Err(Error::InvalidState("epilogue not at top of heap"));
                }
                return Ok(());
            }
            if header.size < MIN_BLOCK_SIZE || !is_aligned(header.size, ALIGNMENT) {
                return Err(Error::InvalidState("block size misaligned or under minimum"));
            }
            if !is_aligned(bp, ALIGNMENT) {
                return Err(Error::InvalidState("payload misaligned"));
            }
            if bp + header.size > self.arena.len() {
                return Err(Error::InvalidState("block chain runs past top of heap"));
            }
            if block.footer() != header {
                return Err(Error::InvalidState("header and footer disagree"));
            }
            if prev_free && !header.allocated() {
                return Err(Error::InvalidState("adjacent free blocks not coalesced"));
            }
            prev_free = !header.allocated();
            bp += header.size;
        }
    }

    /// Writes a block's header and its duplicate footer in one call.
    fn write_tags(&mut self, bp: usize, tag: Tag) {
        let word = tag.encode();
        self.arena.write_word(bp - WSIZE, word);
        self.arena.write_word(bp + tag.size - DSIZE, word);
    }

    /// First-fit scan: the first free block of at least `asize` bytes, in
    /// address order.
    fn find_fit(&self, asize: usize) -> Option<usize> {
        let mut bp = FIRST_BLOCK;
        loop {
            let block = BlockView::at(&self.arena, bp);
            let size = block.size();
            if size == 0 {
                return None;
            }
            if !block.allocated() && size >= asize {
                return Some(bp);
            }
            bp += size;
        }
    }

    /// Marks the free block at `bp` allocated, splitting off the remainder
    /// as a new free block when it is large enough to stand alone.
    fn place(&mut self, bp: usize, asize: usize) {
        let size = BlockView::at(&self.arena, bp).size();
        debug_assert!(size >= asize);
        if size - asize >= MIN_BLOCK_SIZE {
            self.write_tags(bp, Tag::new(asize, true));
            self.write_tags(bp + asize, Tag::new(size - asize, false));
        } else {
            // remainder too small to stand alone; accept the slack
            self.write_tags(bp, Tag::new(size, true));
        }
    }

    /// Merges the free block at `bp` with whichever neighbors are free and
    /// returns the merged block's payload offset.
    ///
    /// The sentinels are permanently allocated, so both neighbor reads are
    /// always in bounds and the sentinels themselves never merge.
    fn coalesce(&mut self, bp: usize) -> usize {
        let size = BlockView::at(&self.arena, bp).size();
        let prev_footer = Tag::decode(self.arena.read_word(bp - DSIZE));
        let next_header = Tag::decode(self.arena.read_word(bp + size - WSIZE));

        match (prev_footer.allocated(), next_header.allocated()) {
            (true, true) => bp,
            (true, false) => {
                self.write_tags(bp, Tag::new(size + next_header.size, false));
                bp
            }
            (false, true) => {
                let merged_bp = bp - prev_footer.size;
                self.write_tags(merged_bp, Tag::new(size + prev_footer.size, false));
                merged_bp
            }
            (false, false) => {
                let merged_bp = bp - prev_footer.size;
                let merged = size + prev_footer.size + next_header.size;
                self.write_tags(merged_bp, Tag::new(merged, false));
                merged_bp
            }
        }
    }

    /// Rounds a request up to a legal block size: alignment for the
    /// payload, plus the header and footer words, never below the minimum
    /// block. `None` if the request cannot be encoded in a tag word.
    fn adjust(size: usize) -> Option<usize> {
        let asize = if size <= DSIZE {
            MIN_BLOCK_SIZE
        } else {
            let aligned = size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);
            aligned.checked_add(DSIZE)?
        };
        if asize > MAX_BLOCK_SIZE {
            return None;
        }
        Some(asize)
    }
}

impl<S: HeapSource> ImplicitListAllocator<S> {
    /// Bootstraps the heap: padding word, prologue block, epilogue header,
    /// then one default-chunk extension.
    ///
    /// Fails with [`Error::OutOfMemory`] if the source cannot supply the
    /// initial chunk (retrying later is allowed) and with
    /// [`Error::InvalidState`] if the allocator is already initialized.
    pub fn init(&mut self) -> Result<()> {
        if self.ready {
            return Err(Error::InvalidState("allocator already initialized"));
        }
        if self.arena.is_empty() {
            self.arena.extend(4 * WSIZE)?;
            self.arena.write_word(0, 0);
            self.arena.write_word(WSIZE, Tag::new(DSIZE, true).encode());
            self.arena.write_word(2 * WSIZE, Tag::new(DSIZE, true).encode());
            self.arena.write_word(3 * WSIZE, Tag::new(0, true).encode());
        }
        self.extend_heap(CHUNKSIZE)?;
        self.ready = true;
        debug!("heap initialized, {} bytes committed", self.arena.len());
        Ok(())
    }

    /// Allocates a block with at least `size` usable bytes, returning the
    /// 8-byte-aligned payload address.
    ///
    /// `None` on `size == 0`, before [`init`](Self::init), or when the heap
    /// cannot be grown to satisfy the request.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let bp = self.allocate_block(size)?;
        Some(self.arena.payload_ptr(bp))
    }

    /// [`allocate`](Self::allocate) with the payload zero-filled.
    pub fn allocate_zeroed(&mut self, size: usize) -> Option<NonNull<u8>> {
        let bp = self.allocate_block(size)?;
        let usable = BlockView::at(&self.arena, bp).usable();
        self.arena.fill(bp, usable, 0);
        Some(self.arena.payload_ptr(bp))
    }

    /// Returns the block at `ptr` to the heap and merges it with any free
    /// neighbor.
    ///
    /// `ptr` must be a payload address previously returned by
    /// [`allocate`](Self::allocate) or [`reallocate`](Self::reallocate) and
    /// not released since; apart from a cheap bounds check, that
    /// precondition is the caller's responsibility.
    pub fn release(&mut self, ptr: NonNull<u8>) {
        if !self.ready {
            warn!("release before init ignored");
            return;
        }
        let Some(bp) = self.arena.offset_of(ptr) else {
            warn!("release of {:p} outside the heap ignored", ptr.as_ptr());
            return;
        };
        let size = BlockView::at(&self.arena, bp).size();
        self.write_tags(bp, Tag::new(size, false));
        self.coalesce(bp);
    }

    /// Resizes the allocation at `ptr` to at least `size` usable bytes.
    ///
    /// `None` for `ptr` degenerates to [`allocate`](Self::allocate);
    /// `size == 0` degenerates to [`release`](Self::release) and returns
    /// `None`. Otherwise a fresh block is always obtained, the common
    /// payload prefix copied over, and the old block released; no in-place
    /// resize is attempted even when the old block could satisfy the
    /// request.
    pub fn reallocate(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(old) = ptr else {
            return self.allocate(size);
        };
        if size == 0 {
            self.release(old);
            return None;
        }
        let Some(old_bp) = self.arena.offset_of(old) else {
            warn!("reallocate of {:p} outside the heap ignored", old.as_ptr());
            return None;
        };
        let old_usable = BlockView::at(&self.arena, old_bp).usable();

        let new_bp = self.allocate_block(size)?;
        let new_usable = BlockView::at(&self.arena, new_bp).usable();
        self.arena.copy_payload(old_bp, new_bp, old_usable.min(new_usable));
        self.release(old);
        trace!(
            "reallocated {:p} into a {}-byte block",
            old.as_ptr(),
            new_usable + DSIZE
        );
        Some(self.arena.payload_ptr(new_bp))
    }

    /// Allocation core shared by the public entry points: adjust the
    /// request, first-fit scan, grow the heap on a miss, place.
    fn allocate_block(&mut self, size: usize) -> Option<usize> {
        if !self.ready {
            warn!("allocate before init refused");
            return None;
        }
        if size == 0 {
            return None;
        }
        let Some(asize) = Self::adjust(size) else {
            self.failed_allocations += 1;
            warn!("allocation of {} bytes exceeds the block size limit", size);
            return None;
        };

        if let Some(bp) = self.find_fit(asize) {
            self.place(bp, asize);
            return Some(bp);
        }

        match self.extend_heap(asize.max(CHUNKSIZE)) {
            Ok(bp) => {
                self.place(bp, asize);
                Some(bp)
            }
            Err(err) => {
                self.failed_allocations += 1;
                warn!("allocation of {} bytes failed: {}", size, err);
                None
            }
        }
    }

    /// Grows the heap by at least `bytes` (rounded to an even word count),
    /// writes the new region as one free block reusing the old epilogue
    /// word as its header, relocates the epilogue, and coalesces with the
    /// block below.
    fn extend_heap(&mut self, bytes: usize) -> Result<usize> {
        let words = bytes.div_ceil(WSIZE);
        let size = if words % 2 == 1 {
            (words + 1) * WSIZE
        } else {
            words * WSIZE
        };

        let bp = self.arena.extend(size)?;
        self.extensions += 1;
        self.write_tags(bp, Tag::new(size, false));
        self.arena.write_word(bp + size - WSIZE, Tag::new(0, true).encode());
        debug!("heap extended by {} bytes", size);
        Ok(self.coalesce(bp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::FixedHeap;

    fn test_heap(capacity: usize) -> (Vec<u8>, ImplicitListAllocator<FixedHeap>) {
        let mut buffer = vec![0u8; capacity];
        let source = unsafe { FixedHeap::new(buffer.as_mut_ptr(), buffer.len()).unwrap() };
        let mut alloc = ImplicitListAllocator::new(source);
        alloc.init().unwrap();
        (buffer, alloc)
    }

    #[test]
    fn test_init_bootstraps_one_free_chunk() {
        let (_buf, alloc) = test_heap(1 << 16);
        let stats = alloc.stats();
        assert_eq!(stats.heap_size, 4 * WSIZE + CHUNKSIZE);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, CHUNKSIZE);
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.extensions, 1);
        alloc.check().unwrap();
    }

    #[test]
    fn test_init_twice_is_an_error() {
        let (_buf, mut alloc) = test_heap(1 << 16);
        assert_eq!(
            alloc.init(),
            Err(Error::InvalidState("allocator already initialized"))
        );
    }

    #[test]
    fn test_init_surfaces_source_exhaustion() {
        let mut buffer = vec![0u8; 1024];
        let source = unsafe { FixedHeap::new(buffer.as_mut_ptr(), buffer.len()).unwrap() };
        let mut alloc = ImplicitListAllocator::new(source);
        assert_eq!(alloc.init(), Err(Error::OutOfMemory));
        assert!(!alloc.is_ready());
    }

    #[test]
    fn test_allocate_before_init_refused() {
        let mut buffer = vec![0u8; 1 << 16];
        let source = unsafe { FixedHeap::new(buffer.as_mut_ptr(), buffer.len()).unwrap() };
        let mut alloc = ImplicitListAllocator::new(source);
        assert_eq!(alloc.allocate(32), None);
    }

    #[test]
    fn test_allocate_zero_returns_none() {
        let (_buf, mut alloc) = test_heap(1 << 16);
        assert_eq!(alloc.allocate(0), None);
        assert_eq!(alloc.stats().allocated_blocks, 0);
    }

    #[test]
    fn test_adjusted_sizes() {
        assert_eq!(ImplicitListAllocator::<FixedHeap>::adjust(1), Some(16));
        assert_eq!(ImplicitListAllocator::<FixedHeap>::adjust(8), Some(16));
        assert_eq!(ImplicitListAllocator::<FixedHeap>::adjust(9), Some(24));
        assert_eq!(ImplicitListAllocator::<FixedHeap>::adjust(100), Some(112));
        assert_eq!(ImplicitListAllocator::<FixedHeap>::adjust(usize::MAX), None);
    }

    #[test]
    fn test_split_leaves_free_remainder() {
        let (_buf, mut alloc) = test_heap(1 << 16);
        let p = alloc.allocate(100).unwrap();
        assert_eq!(alloc.usable_size(p), Some(104));

        let stats = alloc.stats();
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.allocated_bytes, 112);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, CHUNKSIZE - 112);
        alloc.check().unwrap();
    }

    #[test]
    fn test_small_remainder_is_absorbed() {
        let (_buf, mut alloc) = test_heap(1 << 16);
        // leave exactly 8 free bytes behind the placed block
        let p = alloc.allocate(CHUNKSIZE - DSIZE - 8).unwrap();
        assert_eq!(alloc.usable_size(p), Some(CHUNKSIZE - DSIZE));
        assert_eq!(alloc.stats().free_blocks, 0);
        alloc.check().unwrap();
    }

    #[test]
    fn test_coalesce_merges_left_neighbor() {
        let (_buf, mut alloc) = test_heap(1 << 16);
        let a = alloc.allocate(24).unwrap();
        let b = alloc.allocate(24).unwrap();
        let c = alloc.allocate(24).unwrap();
        let _guard = alloc.allocate(24).unwrap();

        // free left neighbor first, then the middle: merges left
        alloc.release(a);
        alloc.release(b);
        alloc.check().unwrap();
        assert_eq!(alloc.stats().free_blocks, 2); // merged a+b, tail

        // freeing c merges with the a+b block on its left only
        alloc.release(c);
        alloc.check().unwrap();
        assert_eq!(alloc.stats().free_blocks, 2); // merged a+b+c, tail

        let merged = alloc.allocate(88).unwrap(); // 3 * 32 - DSIZE usable
        assert_eq!(merged, a);
        alloc.check().unwrap();
    }

    #[test]
    fn test_coalesce_merges_right_neighbor() {
        let (_buf, mut alloc) = test_heap(1 << 16);
        let a = alloc.allocate(24).unwrap();
        let b = alloc.allocate(24).unwrap();
        let _c = alloc.allocate(24).unwrap();

        // free the right neighbor first, then a: a absorbs b
        alloc.release(b);
        alloc.release(a);
        alloc.check().unwrap();
        assert_eq!(alloc.stats().free_blocks, 2); // merged a+b, tail

        let merged = alloc.allocate(56).unwrap(); // exactly the merged block
        assert_eq!(merged, a);
        alloc.check().unwrap();
    }

    #[test]
    fn test_coalesce_merges_both_neighbors() {
        let (_buf, mut alloc) = test_heap(1 << 16);
        let a = alloc.allocate(24).unwrap();
        let b = alloc.allocate(24).unwrap();
        let c = alloc.allocate(24).unwrap();
        let _guard = alloc.allocate(24).unwrap();

        alloc.release(a);
        alloc.release(c);
        alloc.check().unwrap();
        assert_eq!(alloc.stats().free_blocks, 3); // a, c, tail

        // b sits between two free blocks; freeing it fuses all three
        alloc.release(b);
        alloc.check().unwrap();
        assert_eq!(alloc.stats().free_blocks, 2); // merged a+b+c, tail

        let merged = alloc.allocate(88).unwrap();
        assert_eq!(merged, a);
        alloc.check().unwrap();
    }

    #[test]
    fn test_release_out_of_range_pointer_is_ignored() {
        let (_buf, mut alloc) = test_heap(1 << 16);
        let p = alloc.allocate(16).unwrap();
        let before = alloc.stats();

        let mut local = 0u64;
        let foreign = NonNull::from(&mut local).cast::<u8>();
        alloc.release(foreign);
        assert_eq!(alloc.stats(), before);
        alloc.check().unwrap();
        alloc.release(p);
    }

    #[test]
    fn test_failed_allocations_are_counted() {
        let mut buffer = vec![0u8; 4 * WSIZE + CHUNKSIZE + 64];
        let source = unsafe { FixedHeap::new(buffer.as_mut_ptr(), buffer.len()).unwrap() };
        let mut alloc = ImplicitListAllocator::new(source);
        alloc.init().unwrap();

        assert!(alloc.allocate(2 * CHUNKSIZE).is_none());
        assert_eq!(alloc.stats().failed_allocations, 1);
        // the heap is still usable after a failed growth
        assert!(alloc.allocate(64).is_some());
        alloc.check().unwrap();
    }
}
