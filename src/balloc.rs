//! Free-block allocator.
//!
//! Two disjoint views of the same state: a vector of [`FreeBit`]s indexed by
//! block number (O(1) free) and a freelist of the block numbers that are
//! currently free (O(1) allocation). Lock protocol: allocation takes the
//! freelist lock first, then the popped bit's write lock; freeing takes the
//! bit's write lock, releases it, and only then takes the freelist lock.
//! Taking the freelist lock while holding a bit lock is forbidden.

use crate::cache::BufferCache;
use crate::common::FsResult;
use crate::inode::SuperBlock;
use crate::BPB;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, Once};

/// Allocation state of one disk block.
pub struct FreeBit {
    bno: u32,
    is_free: AtomicBool,
    write_lock: Mutex<()>,
}

impl FreeBit {
    fn new(bno: u32, is_free: bool) -> Self {
        FreeBit {
            bno,
            is_free: AtomicBool::new(is_free),
            write_lock: Mutex::new(()),
        }
    }

    pub fn bno(&self) -> u32 {
        self.bno
    }

    pub fn is_free(&self) -> bool {
        self.is_free.load(Ordering::Acquire)
    }
}

/// The allocator. Constructed empty at mount; [`BlockAllocator::initialize`]
/// populates it from the on-disk bitmap once journal recovery has run
/// (recovered transactions may contain bitmap updates).
pub struct BlockAllocator {
    bits: Once<Vec<FreeBit>>,
    freelist: Mutex<VecDeque<u32>>,
}

impl BlockAllocator {
    pub fn new() -> Self {
        BlockAllocator {
            bits: Once::new(),
            freelist: Mutex::new(VecDeque::new()),
        }
    }

    /// Build the free-bit vector and freelist from the allocation bitmap.
    pub fn initialize(&self, sb: &SuperBlock, cache: &BufferCache) -> FsResult<()> {
        let mut bits = Vec::with_capacity(sb.size as usize);
        let mut freelist = self.freelist.lock();
        for base in (0..sb.size).step_by(BPB) {
            let bmap_block = cache.get(sb.bmap_start + base / BPB as u32)?;
            let nbits = core::cmp::min(BPB as u32, sb.size - base);
            bmap_block.read(|data| {
                for bi in 0..nbits {
                    let mask = 1u8 << (bi % 8);
                    let free = data[bi as usize / 8] & mask == 0;
                    bits.push(FreeBit::new(base + bi, free));
                    if free {
                        freelist.push_back(base + bi);
                    }
                }
            });
        }
        drop(freelist);
        self.bits.call_once(|| bits);
        log::info!(
            "block allocator initialized: {} of {} blocks free",
            self.free_count(),
            sb.size
        );
        Ok(())
    }

    fn bits(&self) -> &[FreeBit] {
        self.bits.get().expect("block allocator used before initialize")
    }

    /// Pop a free block off the freelist and mark it allocated.
    /// Returns `None` when the disk is full.
    pub fn alloc(&self) -> Option<u32> {
        let mut freelist = self.freelist.lock();
        let bno = freelist.pop_front()?;
        let bit = &self.bits()[bno as usize];
        let _guard = bit.write_lock.lock();
        assert!(bit.is_free(), "allocating block {} that is not free", bno);
        bit.is_free.store(false, Ordering::Release);
        Some(bno)
    }

    /// Mark `bno` free and push it to the freelist head.
    ///
    /// Panics on double free. The bit lock is dropped before the freelist
    /// lock is taken, which keeps this path out of ABBA range of `alloc`.
    pub fn free(&self, bno: u32) {
        let bit = &self.bits()[bno as usize];
        {
            let _guard = bit.write_lock.lock();
            if bit.is_free() {
                panic!("freeing free block {}", bno);
            }
            bit.is_free.store(true, Ordering::Release);
        }
        self.freelist.lock().push_front(bno);
    }

    /// Approximate count of free blocks, taken without locks. Snapshot
    /// semantics only; concurrent allocation can skew the result.
    pub fn free_count(&self) -> usize {
        self.bits().iter().filter(|b| b.is_free()).count()
    }

    pub fn size(&self) -> u32 {
        self.bits().len() as u32
    }

    #[cfg(test)]
    pub(crate) fn initialize_for_test(&self, nblocks: u32, reserved: u32) {
        let mut bits = Vec::with_capacity(nblocks as usize);
        let mut freelist = self.freelist.lock();
        for bno in 0..nblocks {
            let free = bno >= reserved;
            bits.push(FreeBit::new(bno, free));
            if free {
                freelist.push_back(bno);
            }
        }
        drop(freelist);
        self.bits.call_once(|| bits);
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn alloc_and_free_round_trip() {
        let alloc = BlockAllocator::new();
        alloc.initialize_for_test(16, 4);
        assert_eq!(alloc.free_count(), 12);
        let bno = alloc.alloc().unwrap();
        assert!(bno >= 4);
        assert_eq!(alloc.free_count(), 11);
        alloc.free(bno);
        assert_eq!(alloc.free_count(), 12);
        // Freed block goes to the head and is handed out first.
        assert_eq!(alloc.alloc().unwrap(), bno);
    }

    #[test]
    fn exhaustion_returns_none() {
        let alloc = BlockAllocator::new();
        alloc.initialize_for_test(4, 2);
        assert!(alloc.alloc().is_some());
        assert!(alloc.alloc().is_some());
        assert!(alloc.alloc().is_none());
    }

    #[test]
    #[should_panic(expected = "freeing free block")]
    fn double_free_panics() {
        let alloc = BlockAllocator::new();
        alloc.initialize_for_test(8, 1);
        let bno = alloc.alloc().unwrap();
        alloc.free(bno);
        alloc.free(bno);
    }

    #[test]
    fn concurrent_alloc_yields_distinct_blocks() {
        const THREADS: usize = 16;
        const PER_THREAD: usize = 1000;
        let alloc = Arc::new(BlockAllocator::new());
        alloc.initialize_for_test((THREADS * PER_THREAD + 64) as u32, 8);
        let initial = alloc.free_count();

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::with_capacity(PER_THREAD);
                    for _ in 0..PER_THREAD {
                        got.push(alloc.alloc().expect("disk full"));
                    }
                    got
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for bno in h.join().unwrap() {
                assert!(all.insert(bno), "block {} allocated twice", bno);
                assert!(!alloc.bits()[bno as usize].is_free());
            }
        }
        assert_eq!(all.len(), THREADS * PER_THREAD);
        assert_eq!(alloc.free_count(), initial - THREADS * PER_THREAD);
    }

    #[test]
    fn concurrent_alloc_free_churn() {
        let alloc = Arc::new(BlockAllocator::new());
        alloc.initialize_for_test(256, 8);
        let initial = alloc.free_count();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(bno) = alloc.alloc() {
                            alloc.free(bno);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(alloc.free_count(), initial);
    }
}
