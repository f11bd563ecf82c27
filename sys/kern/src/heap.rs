// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! First-fit block allocator over an owned byte arena.
//!
//! The kernel runs two independent instances: one backing event-data
//! records, one backing data-store payloads. Blocks form a singly linked
//! list threaded through headers that live *inside* the arena, read and
//! written as `zerocopy` records at 4-byte-aligned offsets; offsets stand in
//! for the pointers a C allocator would use, which keeps the whole thing in
//! safe code and makes double-free detection a table scan rather than UB.
//!
//! Invariant: no two adjacent blocks are both free. Freeing coalesces with
//! the immediate predecessor and successor, and the predecessor is found by
//! a forward scan because the block list *is* the free list.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Byte size of a block header inside the arena.
pub(crate) const HDR: u32 = 8;

/// Offset sentinel meaning "no block" / "no record".
pub(crate) const REF_NIL: u32 = u32::MAX;

const FREE_BIT: u32 = 1 << 31;

/// Allocation failures, with the stable error codes the debug surface
/// reports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HeapError {
    /// Zero-byte allocations are rejected rather than rounded up.
    ZeroSize = 1,
    /// No free block can satisfy the request.
    Exhausted = 2,
    /// Free of an offset that is not a live allocation (including
    /// double-free).
    NotAllocated = 4,
}

#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct BlockHeader {
    next: u32,
    size_free: u32,
}

impl BlockHeader {
    fn size(self) -> u32 {
        self.size_free & !FREE_BIT
    }

    fn is_free(self) -> bool {
        self.size_free & FREE_BIT != 0
    }

    fn encode(next: u32, size: u32, free: bool) -> Self {
        debug_assert_eq!(size & FREE_BIT, 0);
        Self { next, size_free: size | if free { FREE_BIT } else { 0 } }
    }
}

/// One allocator instance.
#[derive(Debug)]
pub(crate) struct Heap {
    arena: Box<[u8]>,
}

impl Heap {
    /// Creates a heap of `size` bytes, all of it one free block (minus the
    /// initial header).
    pub(crate) fn new(size: usize) -> Self {
        assert!(size > HDR as usize, "heap smaller than a block header");
        assert!(size % 4 == 0, "heap size must be 4-byte aligned");
        assert!(size < FREE_BIT as usize);
        let mut heap = Self { arena: vec![0; size].into_boxed_slice() };
        heap.put(
            0,
            BlockHeader::encode(REF_NIL, size as u32 - HDR, true),
        );
        heap
    }

    pub(crate) fn total(&self) -> u32 {
        self.arena.len() as u32
    }

    /// Allocates `size` bytes (rounded up to a 4-byte multiple) and returns
    /// the offset of the data area.
    pub(crate) fn alloc(&mut self, size: u32) -> Result<u32, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let size = (size + 3) & !3;

        // First fit.
        let mut off = 0;
        let block = loop {
            let h = self.hdr(off);
            if h.is_free() && h.size() >= size {
                break h;
            }
            match h.next {
                REF_NIL => return Err(HeapError::Exhausted),
                n => off = n,
            }
        };

        if block.size() > size + HDR {
            // Enough left over for a block of its own; split.
            let rest = off + HDR + size;
            self.put(
                rest,
                BlockHeader::encode(block.next, block.size() - size - HDR, true),
            );
            self.put(off, BlockHeader::encode(rest, size, false));
        } else {
            // Hand out the whole block.
            self.put(off, BlockHeader::encode(block.next, block.size(), false));
        }

        Ok(off + HDR)
    }

    /// Releases the allocation whose data area starts at `data_off`,
    /// coalescing with free neighbors.
    pub(crate) fn free(&mut self, data_off: u32) -> Result<(), HeapError> {
        let target = data_off
            .checked_sub(HDR)
            .ok_or(HeapError::NotAllocated)?;

        // Find the block and its predecessor by walking the list.
        let mut prev: Option<u32> = None;
        let mut off = 0;
        let mut h = loop {
            let h = self.hdr(off);
            if off == target {
                if h.is_free() {
                    return Err(HeapError::NotAllocated);
                }
                break h;
            }
            prev = Some(off);
            match h.next {
                REF_NIL => return Err(HeapError::NotAllocated),
                n => off = n,
            }
        };

        // Merge into a free predecessor, if any.
        if let Some(p) = prev {
            let ph = self.hdr(p);
            if ph.is_free() {
                h = BlockHeader::encode(h.next, ph.size() + h.size() + HDR, true);
                off = p;
            }
        }

        // Merge a free successor, if any.
        if h.next != REF_NIL {
            let nh = self.hdr(h.next);
            if nh.is_free() {
                h = BlockHeader::encode(nh.next, h.size() + nh.size() + HDR, true);
            }
        }

        self.put(off, BlockHeader::encode(h.next, h.size(), true));
        Ok(())
    }

    /// Borrows the data area of an allocation.
    pub(crate) fn data(&self, off: u32, len: usize) -> &[u8] {
        &self.arena[off as usize..off as usize + len]
    }

    pub(crate) fn data_mut(&mut self, off: u32, len: usize) -> &mut [u8] {
        &mut self.arena[off as usize..off as usize + len]
    }

    /// Bytes currently handed out (data areas only, headers excluded).
    pub(crate) fn used(&self) -> u32 {
        self.blocks().iter().filter(|b| !b.free).map(|b| b.size).sum()
    }

    /// Walks the block list. Debug/stats surface; also what the accounting
    /// tests check against.
    pub(crate) fn blocks(&self) -> Vec<Block> {
        let mut out = Vec::new();
        let mut off = 0;
        loop {
            let h = self.hdr(off);
            out.push(Block { off, size: h.size(), free: h.is_free() });
            match h.next {
                REF_NIL => break,
                n => off = n,
            }
        }
        out
    }

    fn hdr(&self, off: u32) -> BlockHeader {
        let off = off as usize;
        BlockHeader::read_from_bytes(&self.arena[off..off + HDR as usize])
            .expect("block header")
    }

    fn put(&mut self, off: u32, h: BlockHeader) {
        let off = off as usize;
        h.write_to(&mut self.arena[off..off + HDR as usize])
            .expect("block header")
    }
}

/// Debug view of one block.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Block {
    pub off: u32,
    pub size: u32,
    pub free: bool,
}
