//! Block device abstraction and a RAM-backed implementation.

use crate::common::{FsError, FsResult};
use crate::BSIZE;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// A block-granular storage device.
///
/// All writes are synchronous with respect to the device's own cache;
/// [`BlockDevice::flush`] is the barrier that makes previously written
/// blocks durable.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, bno: u32, buf: &mut [u8]) -> FsResult<()>;
    fn write_block(&self, bno: u32, buf: &[u8]) -> FsResult<()>;
    /// Durability barrier: every block written before this call survives a
    /// crash once it returns.
    fn flush(&self) -> FsResult<()>;
    /// Total number of blocks on the device.
    fn nblocks(&self) -> u32;
}

/// An in-memory volume.
///
/// Backs the tests and any host that wants a purely volatile filesystem.
/// [`MemDisk::to_bytes`] / [`MemDisk::from_bytes`] snapshot the raw contents,
/// which is how the tests model a crash: clone the bytes, drop every in-core
/// structure, and mount the copy.
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    nblocks: u32,
}

impl MemDisk {
    pub fn new(nblocks: u32) -> Self {
        MemDisk {
            data: Mutex::new(vec![0u8; nblocks as usize * BSIZE]),
            nblocks,
        }
    }

    /// Rebuild a disk from a raw snapshot.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        assert!(data.len() % BSIZE == 0, "snapshot is not block-aligned");
        let nblocks = (data.len() / BSIZE) as u32;
        MemDisk {
            data: Mutex::new(data),
            nblocks,
        }
    }

    /// Snapshot the raw device contents.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, bno: u32, buf: &mut [u8]) -> FsResult<()> {
        debug_assert_eq!(buf.len(), BSIZE);
        if bno >= self.nblocks {
            return Err(FsError::Io);
        }
        let data = self.data.lock();
        let off = bno as usize * BSIZE;
        buf.copy_from_slice(&data[off..off + BSIZE]);
        Ok(())
    }

    fn write_block(&self, bno: u32, buf: &[u8]) -> FsResult<()> {
        debug_assert_eq!(buf.len(), BSIZE);
        if bno >= self.nblocks {
            return Err(FsError::Io);
        }
        let mut data = self.data.lock();
        let off = bno as usize * BSIZE;
        data[off..off + BSIZE].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> FsResult<()> {
        Ok(())
    }

    fn nblocks(&self) -> u32 {
        self.nblocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let disk = MemDisk::new(8);
        let block = [0xabu8; BSIZE];
        disk.write_block(3, &block).unwrap();
        let mut out = [0u8; BSIZE];
        disk.read_block(3, &mut out).unwrap();
        assert_eq!(out[..], block[..]);
    }

    #[test]
    fn out_of_range_is_io_error() {
        let disk = MemDisk::new(2);
        let mut buf = [0u8; BSIZE];
        assert_eq!(disk.read_block(2, &mut buf), Err(FsError::Io));
    }

    #[test]
    fn snapshot_round_trip() {
        let disk = MemDisk::new(4);
        disk.write_block(1, &[7u8; BSIZE]).unwrap();
        let copy = MemDisk::from_bytes(disk.to_bytes());
        let mut buf = [0u8; BSIZE];
        copy.read_block(1, &mut buf).unwrap();
        assert_eq!(buf[0], 7);
    }
}
