//! Transactions: the unit of atomicity handed to the physical journal.
//!
//! A transaction collects the dirty disk blocks produced by applying one
//! logged metadata operation, plus the block allocations and frees the
//! operation performed. Blocks are deduplicated on insertion; the latest
//! write of a block wins.

use crate::BSIZE;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// A snapshot of one dirty disk block.
pub struct DiskBlock {
    pub bno: u32,
    pub data: Box<[u8; BSIZE]>,
}

impl DiskBlock {
    pub fn new(bno: u32, data: &[u8; BSIZE]) -> Self {
        DiskBlock {
            bno,
            data: Box::new(*data),
        }
    }
}

/// An ordered set of dirty blocks carrying the originating operation's
/// timestamp, plus the allocation side effects that must be folded into the
/// on-disk bitmap before commit and into the in-memory allocator after.
pub struct Transaction {
    pub timestamp: u64,
    blocks: Vec<DiskBlock>,
    allocated_blocks: Vec<u32>,
    freed_blocks: Vec<u32>,
}

impl Transaction {
    pub fn new(timestamp: u64) -> Self {
        Transaction {
            timestamp,
            blocks: Vec::new(),
            allocated_blocks: Vec::new(),
            freed_blocks: Vec::new(),
        }
    }

    /// Record the current contents of a dirty block. A block already present
    /// is overwritten in place, so the set never holds two entries for one
    /// block number.
    pub fn add_block(&mut self, bno: u32, data: &[u8; BSIZE]) {
        if let Some(existing) = self.blocks.iter_mut().find(|b| b.bno == bno) {
            existing.data.copy_from_slice(&data[..]);
            return;
        }
        self.blocks.push(DiskBlock::new(bno, data));
    }

    /// Record a block handed out by the allocator for this transaction.
    pub fn add_allocated(&mut self, bno: u32) {
        self.allocated_blocks.push(bno);
    }

    /// Record a block released by this transaction. The in-memory free bit
    /// is flipped only after commit, so concurrent allocation cannot hand
    /// the block out before the free is durable.
    pub fn add_freed(&mut self, bno: u32) {
        self.freed_blocks.push(bno);
    }

    pub fn blocks(&self) -> &[DiskBlock] {
        &self.blocks
    }

    pub fn allocated_blocks(&self) -> &[u32] {
        &self.allocated_blocks
    }

    pub fn freed_blocks(&self) -> &[u32] {
        &self.freed_blocks
    }

    /// Final fixup before journaling: order the block set by block number so
    /// the journal layout is deterministic.
    pub fn prepare_for_commit(&mut self) {
        self.blocks.sort_by_key(|b| b.bno);
    }
}
