//! Boundary tag codec
//!
//! Every block carries a 4-byte header and a byte-identical 4-byte footer.
//! Both pack the block size and its allocation state into one word: the size
//! is always a multiple of 8, so the low 3 bits are free to carry flags, with
//! the allocation state in bit 0. The duplicate footer is what lets the
//! coalescer reach the left neighbor's tag without any linked structure.

use crate::arena::Arena;
use crate::layout::{is_aligned, ALIGNMENT, DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, WSIZE};

/// Mask selecting the flag bits of a tag word.
pub const FLAG_MASK: u32 = 0b111;

bitflags::bitflags! {
    /// Flag bits carried in the low bits of a tag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TagFlags: u32 {
        /// The block is allocated (in use by the caller).
        const ALLOCATED = 1 << 0;
    }
}

/// A decoded header or footer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    /// Total block size in bytes, including both tag words.
    pub size: usize,
    /// Flag bits of the tag word.
    pub flags: TagFlags,
}

impl Tag {
    /// Builds a tag for a block of `size` bytes.
    pub fn new(size: usize, allocated: bool) -> Self {
        debug_assert!(is_aligned(size, ALIGNMENT));
        debug_assert!(size <= MAX_BLOCK_SIZE);
        let flags = if allocated {
            TagFlags::ALLOCATED
        } else {
            TagFlags::empty()
        };
        Self { size, flags }
    }

    /// Whether the tag marks its block allocated.
    pub fn allocated(self) -> bool {
        self.flags.contains(TagFlags::ALLOCATED)
    }

    /// Packs the tag into one word.
    pub fn encode(self) -> u32 {
        self.size as u32 | self.flags.bits()
    }

    /// Unpacks a tag word.
    pub fn decode(word: u32) -> Self {
        Self {
            size: (word & !FLAG_MASK) as usize,
            flags: TagFlags::from_bits_truncate(word & FLAG_MASK),
        }
    }
}

/// Read-only view of one block, addressed by its payload offset.
///
/// The view validates the offset against the committed heap before any tag
/// word is reinterpreted; all block arithmetic goes through it rather than
/// touching raw words at call sites.
pub struct BlockView<'a, S> {
    arena: &'a Arena<S>,
    payload: usize,
}

impl<'a, S> BlockView<'a, S> {
    /// Creates a view of the block whose payload starts at `payload`.
    ///
    /// Panics if the offset cannot belong to a block in the committed heap.
    pub fn at(arena: &'a Arena<S>, payload: usize) -> Self {
        assert!(
            payload >= WSIZE && payload <= arena.len(),
            "block payload offset {} outside the committed heap",
            payload
        );
        Self { arena, payload }
    }

    /// The payload offset this view was created with.
    pub fn payload_offset(&self) -> usize {
        self.payload
    }

    /// The block's header tag.
    pub fn header(&self) -> Tag {
        Tag::decode(self.arena.read_word(self.payload - WSIZE))
    }

    /// The block's footer tag.
    pub fn footer(&self) -> Tag {
        Tag::decode(self.arena.read_word(self.payload + self.size() - DSIZE))
    }

    /// Total block size in bytes, taken from the header.
    pub fn size(&self) -> usize {
        self.header().size
    }

    /// Whether the block is allocated, taken from the header.
    pub fn allocated(&self) -> bool {
        self.header().allocated()
    }

    /// Payload capacity in bytes.
    pub fn usable(&self) -> usize {
        let size = self.size();
        debug_assert!(size >= MIN_BLOCK_SIZE);
        size - DSIZE
    }

    /// View of the block immediately after this one.
    pub fn next(&self) -> BlockView<'a, S> {
        BlockView::at(self.arena, self.payload + self.size())
    }

    /// View of the block immediately before this one, located through the
    /// neighbor's footer word.
    pub fn prev(&self) -> BlockView<'a, S> {
        let prev_size = Tag::decode(self.arena.read_word(self.payload - DSIZE)).size;
        BlockView::at(self.arena, self.payload - prev_size)
    }
}
