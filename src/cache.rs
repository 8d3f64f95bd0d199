//! Write-back buffer cache.
//!
//! Every in-core view of a disk block lives here. Mutations are captured by
//! the transaction machinery (the cache itself never initiates writeback);
//! a buffer's dirty bit only gates eviction. Committed transactions write
//! their own block snapshots to the home locations and then mark the
//! corresponding buffers clean.

use crate::common::FsResult;
use crate::device::BlockDevice;
use crate::BSIZE;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

/// A cached disk block.
pub struct Buffer {
    bno: u32,
    data: Mutex<Box<[u8; BSIZE]>>,
    dirty: AtomicBool,
}

impl Buffer {
    pub fn bno(&self) -> u32 {
        self.bno
    }

    /// Read the block contents under the buffer lock.
    pub fn read<R>(&self, f: impl FnOnce(&[u8; BSIZE]) -> R) -> R {
        let data = self.data.lock();
        f(&data)
    }

    /// Mutate the block contents under the buffer lock and mark it dirty.
    pub fn modify<R>(&self, f: impl FnOnce(&mut [u8; BSIZE]) -> R) -> R {
        let mut data = self.data.lock();
        self.dirty.store(true, Ordering::Release);
        f(&mut data)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Cache of [`Buffer`]s keyed by block number.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    buffers: Mutex<HashMap<u32, Arc<Buffer>>>,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        BufferCache {
            device,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the buffer for `bno`, reading it from the device on a miss.
    pub fn get(&self, bno: u32) -> FsResult<Arc<Buffer>> {
        if let Some(buf) = self.buffers.lock().get(&bno) {
            return Ok(buf.clone());
        }
        // Read outside the table lock; racing readers of the same block may
        // both hit the device, the second insert wins and both copies are
        // identical.
        let mut data = Box::new([0u8; BSIZE]);
        self.device.read_block(bno, &mut data[..])?;
        let buf = Arc::new(Buffer {
            bno,
            data: Mutex::new(data),
            dirty: AtomicBool::new(false),
        });
        Ok(self
            .buffers
            .lock()
            .entry(bno)
            .or_insert(buf)
            .clone())
    }

    /// Clear the dirty bit after the block's latest contents reached its
    /// home location.
    pub fn mark_clean(&self, bno: u32) {
        if let Some(buf) = self.buffers.lock().get(&bno) {
            buf.dirty.store(false, Ordering::Release);
        }
    }

    /// Drop every clean buffer.
    pub fn evict_clean(&self) {
        let mut buffers = self.buffers.lock();
        let clean: Vec<u32> = buffers
            .iter()
            .filter(|(_, b)| !b.is_dirty())
            .map(|(&bno, _)| bno)
            .collect();
        for bno in clean {
            buffers.remove(&bno);
        }
    }

    /// Durability barrier on the underlying device.
    pub fn flush_device(&self) -> FsResult<()> {
        self.device.flush()
    }

    pub fn cached_blocks(&self) -> usize {
        self.buffers.lock().len()
    }
}
