//! On-disk inode layer: superblock, inodes, directory entries.
//!
//! Disk layout, in blocks:
//! `[0: superblock][inodes][allocation bitmap][journal][data]`.
//!
//! Every mutation routes its dirty blocks into a [`Transaction`]; nothing
//! here writes to the device directly except [`format`], which builds a
//! fresh volume before any journal exists.

use crate::balloc::BlockAllocator;
use crate::cache::BufferCache;
use crate::common::{FsError, FsResult, Inum};
use crate::device::BlockDevice;
use crate::transaction::Transaction;
use crate::{BPB, BSIZE, DIRSIZ, PHYS_JOURNAL_SIZE};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

pub const FSMAGIC: u32 = 0x5343_4653;

/// Inode types.
pub const T_NONE: u16 = 0;
pub const T_DIR: u16 = 1;
pub const T_FILE: u16 = 2;

/// Direct block pointers per inode; also the maximum file size in blocks.
pub const NDIRECT: usize = 12;

const INODE_SIZE: usize = 64;
/// Inodes per block.
pub const IPB: usize = BSIZE / INODE_SIZE;

const DIRENT_SIZE: usize = 32;

pub const ROOT_INUM: Inum = 1;

/// On-disk superblock, stored in block 0 as consecutive little-endian u32s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u32,
    /// Total blocks on the volume.
    pub size: u32,
    pub ninodes: u32,
    pub inode_start: u32,
    pub bmap_start: u32,
    pub journal_start: u32,
    pub journal_blocks: u32,
    pub data_start: u32,
}

impl SuperBlock {
    fn encode(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        for (i, v) in [
            self.magic,
            self.size,
            self.ninodes,
            self.inode_start,
            self.bmap_start,
            self.journal_start,
            self.journal_blocks,
            self.data_start,
        ]
        .iter()
        .enumerate()
        {
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        let word = |i: usize| u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        SuperBlock {
            magic: word(0),
            size: word(1),
            ninodes: word(2),
            inode_start: word(3),
            bmap_start: word(4),
            journal_start: word(5),
            journal_blocks: word(6),
            data_start: word(7),
        }
    }

    /// Read and validate the superblock of a mounted volume.
    pub fn read(device: &dyn BlockDevice) -> FsResult<Self> {
        let mut block = [0u8; BSIZE];
        device.read_block(0, &mut block)?;
        let sb = Self::decode(&block);
        if sb.magic != FSMAGIC || sb.size > device.nblocks() || sb.data_start >= sb.size {
            return Err(FsError::Corrupted);
        }
        Ok(sb)
    }

    /// Bitmap block covering `bno`.
    pub fn bmap_block(&self, bno: u32) -> u32 {
        self.bmap_start + bno / BPB as u32
    }
}

/// In-core copy of an on-disk inode.
#[derive(Debug, Clone, Copy)]
pub struct InodeInner {
    pub itype: u16,
    pub nlink: u16,
    pub size: u32,
    pub addrs: [u32; NDIRECT],
}

impl InodeInner {
    fn encode(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0u8; INODE_SIZE];
        buf[0..2].copy_from_slice(&self.itype.to_le_bytes());
        buf[2..4].copy_from_slice(&self.nlink.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        for (i, a) in self.addrs.iter().enumerate() {
            buf[8 + i * 4..12 + i * 4].copy_from_slice(&a.to_le_bytes());
        }
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        let mut addrs = [0u32; NDIRECT];
        for (i, a) in addrs.iter_mut().enumerate() {
            *a = u32::from_le_bytes(buf[8 + i * 4..12 + i * 4].try_into().unwrap());
        }
        InodeInner {
            itype: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            nlink: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            addrs,
        }
    }
}

/// An in-core inode. The mutex is the per-inode lock of the lock hierarchy;
/// it nests inside the commit lock and outside the allocator locks.
pub struct Inode {
    pub inum: Inum,
    inner: Mutex<InodeInner>,
}

impl Inode {
    pub fn lock(&self) -> MutexGuard<'_, InodeInner> {
        self.inner.lock()
    }

    pub fn itype(&self) -> u16 {
        self.inner.lock().itype
    }

    pub fn nlink(&self) -> u16 {
        self.inner.lock().nlink
    }

    pub fn size(&self) -> u32 {
        self.inner.lock().size
    }
}

/// A directory entry slot: inum (4 bytes LE, 0 = empty) + NUL-padded name.
fn encode_dirent(inum: Inum, name: &str) -> [u8; DIRENT_SIZE] {
    debug_assert!(name.len() < DIRSIZ);
    let mut buf = [0u8; DIRENT_SIZE];
    buf[0..4].copy_from_slice(&inum.to_le_bytes());
    buf[4..4 + name.len()].copy_from_slice(name.as_bytes());
    buf
}

fn decode_dirent(buf: &[u8]) -> (Inum, String) {
    let inum = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let raw = &buf[4..4 + DIRSIZ];
    let len = raw.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
    let name = String::from_utf8_lossy(&raw[..len]).into_owned();
    (inum, name)
}

/// The inode layer: the on-disk side of the interface.
pub struct InodeLayer {
    sb: SuperBlock,
    cache: Arc<BufferCache>,
    pub(crate) balloc: Arc<BlockAllocator>,
    itable: Mutex<HashMap<Inum, Arc<Inode>>>,
}

impl InodeLayer {
    pub fn new(sb: SuperBlock, cache: Arc<BufferCache>, balloc: Arc<BlockAllocator>) -> Self {
        InodeLayer {
            sb,
            cache,
            balloc,
            itable: Mutex::new(HashMap::with_capacity(crate::NINODES)),
        }
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    fn slot(&self, inum: Inum) -> (u32, usize) {
        assert!(inum != 0 && inum < self.sb.ninodes, "bad inum {}", inum);
        (
            self.sb.inode_start + inum / IPB as u32,
            (inum as usize % IPB) * INODE_SIZE,
        )
    }

    /// Mutate a cached block and capture the result in the transaction.
    fn write_through(
        &self,
        bno: u32,
        tr: &mut Transaction,
        f: impl FnOnce(&mut [u8; BSIZE]),
    ) -> FsResult<()> {
        let buf = self.cache.get(bno)?;
        buf.modify(f);
        buf.read(|data| tr.add_block(bno, data));
        Ok(())
    }

    /// Fetch the in-core inode for `inum`, reading it from disk on a miss.
    pub fn iget(&self, inum: Inum) -> FsResult<Arc<Inode>> {
        if let Some(ip) = self.itable.lock().get(&inum) {
            return Ok(ip.clone());
        }
        let (bno, off) = self.slot(inum);
        let block = self.cache.get(bno)?;
        let inner = block.read(|data| InodeInner::decode(&data[off..off + INODE_SIZE]));
        let ip = Arc::new(Inode {
            inum,
            inner: Mutex::new(inner),
        });
        Ok(self.itable.lock().entry(inum).or_insert(ip).clone())
    }

    /// Write the in-core inode back to its slot.
    pub fn iupdate(&self, ip: &Inode, tr: &mut Transaction) -> FsResult<()> {
        let inner = *ip.lock();
        self.update_slot(ip.inum, &inner, tr)
    }

    fn update_slot(&self, inum: Inum, inner: &InodeInner, tr: &mut Transaction) -> FsResult<()> {
        let (bno, off) = self.slot(inum);
        self.write_through(bno, tr, |data| {
            data[off..off + INODE_SIZE].copy_from_slice(&inner.encode());
        })
    }

    /// Allocate an on-disk inode of the given type. The new inode starts
    /// with no links; directory entries account for every link.
    pub fn ialloc(&self, itype: u16, tr: &mut Transaction) -> FsResult<Arc<Inode>> {
        for inum in 1..self.sb.ninodes {
            let (bno, off) = self.slot(inum);
            let block = self.cache.get(bno)?;
            let existing = block.read(|data| InodeInner::decode(&data[off..off + INODE_SIZE]));
            if existing.itype != T_NONE {
                continue;
            }
            let inner = InodeInner {
                itype,
                nlink: 0,
                size: 0,
                addrs: [0; NDIRECT],
            };
            self.update_slot(inum, &inner, tr)?;
            let ip = Arc::new(Inode {
                inum,
                inner: Mutex::new(inner),
            });
            self.itable.lock().insert(inum, ip.clone());
            return Ok(ip);
        }
        Err(FsError::NoSpace)
    }

    /// Release the on-disk inode: clear its type and drop it from the
    /// in-core table. The caller must already have truncated it.
    pub fn ifree(&self, ip: &Inode, tr: &mut Transaction) -> FsResult<()> {
        let mut inner = ip.lock();
        assert_eq!(inner.nlink, 0, "freeing linked inode {}", ip.inum);
        inner.itype = T_NONE;
        let snapshot = *inner;
        drop(inner);
        self.update_slot(ip.inum, &snapshot, tr)?;
        self.itable.lock().remove(&ip.inum);
        Ok(())
    }

    /// Map a file block index to a disk block, allocating on demand.
    fn bmap(&self, inner: &mut InodeInner, bn: usize, tr: &mut Transaction) -> FsResult<u32> {
        if bn >= NDIRECT {
            return Err(FsError::FileTooLarge);
        }
        if inner.addrs[bn] == 0 {
            let bno = self.balloc.alloc().ok_or(FsError::NoSpace)?;
            tr.add_allocated(bno);
            self.write_through(bno, tr, |data| data.fill(0))?;
            inner.addrs[bn] = bno;
        }
        Ok(inner.addrs[bn])
    }

    /// Read up to `buf.len()` bytes at `off`. Short reads happen at EOF.
    pub fn readi(&self, ip: &Inode, buf: &mut [u8], off: u32) -> FsResult<usize> {
        let inner = ip.lock();
        if off >= inner.size {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len(), (inner.size - off) as usize);
        let mut done = 0usize;
        while done < n {
            let pos = off as usize + done;
            let bn = pos / BSIZE;
            let inner_off = pos % BSIZE;
            let chunk = core::cmp::min(BSIZE - inner_off, n - done);
            if inner.addrs[bn] == 0 {
                buf[done..done + chunk].fill(0);
            } else {
                let block = self.cache.get(inner.addrs[bn])?;
                block.read(|data| {
                    buf[done..done + chunk].copy_from_slice(&data[inner_off..inner_off + chunk])
                });
            }
            done += chunk;
        }
        Ok(n)
    }

    /// Write `buf` at `off`, growing the file as needed. Dirty data blocks
    /// and the updated inode go into `tr`.
    pub fn writei(&self, ip: &Inode, buf: &[u8], off: u32, tr: &mut Transaction) -> FsResult<usize> {
        let mut inner = ip.lock();
        let end = off as usize + buf.len();
        if end > NDIRECT * BSIZE {
            return Err(FsError::FileTooLarge);
        }
        let mut done = 0usize;
        while done < buf.len() {
            let pos = off as usize + done;
            let bn = pos / BSIZE;
            let inner_off = pos % BSIZE;
            let chunk = core::cmp::min(BSIZE - inner_off, buf.len() - done);
            let bno = self.bmap(&mut inner, bn, tr)?;
            self.write_through(bno, tr, |data| {
                data[inner_off..inner_off + chunk].copy_from_slice(&buf[done..done + chunk])
            })?;
            done += chunk;
        }
        if end as u32 > inner.size {
            inner.size = end as u32;
        }
        let snapshot = *inner;
        drop(inner);
        self.update_slot(ip.inum, &snapshot, tr)?;
        Ok(buf.len())
    }

    /// Truncate the file to `off` bytes, releasing whole blocks past the
    /// new end into the transaction's free list.
    pub fn itrunc(&self, ip: &Inode, off: u32, tr: &mut Transaction) -> FsResult<()> {
        let mut inner = ip.lock();
        let keep = (off as usize + BSIZE - 1) / BSIZE;
        for bn in keep..NDIRECT {
            if inner.addrs[bn] != 0 {
                tr.add_freed(inner.addrs[bn]);
                inner.addrs[bn] = 0;
            }
        }
        if inner.size > off {
            inner.size = off;
        }
        let snapshot = *inner;
        drop(inner);
        self.update_slot(ip.inum, &snapshot, tr)
    }

    /// Update the recorded size without touching data blocks.
    pub fn update_size(&self, ip: &Inode, size: u32, tr: &mut Transaction) -> FsResult<()> {
        let mut inner = ip.lock();
        inner.size = size;
        let snapshot = *inner;
        drop(inner);
        self.update_slot(ip.inum, &snapshot, tr)
    }

    /// Look up `name` in directory `dp`.
    pub fn dirlookup(&self, dp: &Inode, name: &str) -> FsResult<Option<Inum>> {
        for (entry_name, inum) in self.dir_entries(dp)? {
            if entry_name == name {
                return Ok(Some(inum));
            }
        }
        Ok(None)
    }

    /// Every live entry of a directory, in slot order.
    pub fn dir_entries(&self, dp: &Inode) -> FsResult<Vec<(String, Inum)>> {
        assert_eq!(dp.itype(), T_DIR, "dir_entries on non-directory {}", dp.inum);
        let size = dp.size() as usize;
        let mut entries = Vec::new();
        let mut slot_buf = [0u8; DIRENT_SIZE];
        for pos in (0..size).step_by(DIRENT_SIZE) {
            let n = self.readi(dp, &mut slot_buf, pos as u32)?;
            if n < DIRENT_SIZE {
                break;
            }
            let (inum, name) = decode_dirent(&slot_buf);
            if inum != 0 {
                entries.push((name, inum));
            }
        }
        Ok(entries)
    }

    /// Add the entry `name -> inum` to `dp` and take a link on the target.
    /// A directory entry pointing at a directory also counts a link on `dp`
    /// through the child's implicit `..`; that is the child's job
    /// ([`InodeLayer::dirlink`] only accounts for the named edge).
    pub fn dirlink(&self, dp: &Inode, name: &str, inum: Inum, tr: &mut Transaction) -> FsResult<()> {
        // Reuse an emptied slot if one exists, otherwise append.
        let size = dp.size() as usize;
        let mut slot_off = size as u32;
        let mut slot_buf = [0u8; DIRENT_SIZE];
        for pos in (0..size).step_by(DIRENT_SIZE) {
            if self.readi(dp, &mut slot_buf, pos as u32)? < DIRENT_SIZE {
                break;
            }
            let (existing, _) = decode_dirent(&slot_buf);
            if existing == 0 {
                slot_off = pos as u32;
                break;
            }
        }
        self.writei(dp, &encode_dirent(inum, name), slot_off, tr)?;

        let target = self.iget(inum)?;
        let mut inner = target.lock();
        inner.nlink += 1;
        let snapshot = *inner;
        drop(inner);
        self.update_slot(inum, &snapshot, tr)
    }

    /// Remove the entry `name` from `dp`, dropping a link on the target.
    /// Unlinking a directory also releases the link its `..` held on `dp`.
    /// Returns the target's inum.
    pub fn dirunlink(&self, dp: &Inode, name: &str, tr: &mut Transaction) -> FsResult<Inum> {
        let size = dp.size() as usize;
        let mut slot_buf = [0u8; DIRENT_SIZE];
        for pos in (0..size).step_by(DIRENT_SIZE) {
            if self.readi(dp, &mut slot_buf, pos as u32)? < DIRENT_SIZE {
                break;
            }
            let (inum, entry_name) = decode_dirent(&slot_buf);
            if inum == 0 || entry_name != name {
                continue;
            }
            self.writei(dp, &[0u8; DIRENT_SIZE], pos as u32, tr)?;

            let target = self.iget(inum)?;
            let mut inner = target.lock();
            assert!(inner.nlink > 0, "unlinking inode {} with no links", inum);
            inner.nlink -= 1;
            let is_dir = inner.itype == T_DIR;
            let snapshot = *inner;
            drop(inner);
            self.update_slot(inum, &snapshot, tr)?;

            if is_dir && dp.inum != inum {
                let mut dinner = dp.lock();
                assert!(dinner.nlink > 0);
                dinner.nlink -= 1;
                let snapshot = *dinner;
                drop(dinner);
                self.update_slot(dp.inum, &snapshot, tr)?;
            }
            return Ok(inum);
        }
        Err(FsError::NotFound)
    }
}

/// Build a fresh volume on `device`: superblock, zeroed inode and journal
/// regions, an allocation bitmap with every metadata block taken, and a
/// root directory at inum 1.
pub fn format(device: &dyn BlockDevice, ninodes: u32) -> FsResult<SuperBlock> {
    let size = device.nblocks();
    let inode_blocks = (ninodes + IPB as u32 - 1) / IPB as u32;
    let bmap_blocks = (size + BPB as u32 - 1) / BPB as u32;
    let journal_blocks = (PHYS_JOURNAL_SIZE / BSIZE) as u32;
    let sb = SuperBlock {
        magic: FSMAGIC,
        size,
        ninodes,
        inode_start: 1,
        bmap_start: 1 + inode_blocks,
        journal_start: 1 + inode_blocks + bmap_blocks,
        journal_blocks,
        data_start: 1 + inode_blocks + bmap_blocks + journal_blocks,
    };
    if sb.data_start >= size {
        return Err(FsError::NoSpace);
    }

    let zero = [0u8; BSIZE];
    for bno in sb.inode_start..sb.data_start {
        device.write_block(bno, &zero)?;
    }

    // Every block below data_start is permanently allocated.
    let mut bmap = [0u8; BSIZE];
    for bno in 0..sb.data_start {
        let bi = bno as usize % BPB;
        if bno != 0 && bi == 0 {
            device.write_block(sb.bmap_block(bno - 1), &bmap)?;
            bmap = [0u8; BSIZE];
        }
        bmap[bi / 8] |= 1 << (bi % 8);
    }
    device.write_block(sb.bmap_block(sb.data_start - 1), &bmap)?;

    // Root directory.
    let root = InodeInner {
        itype: T_DIR,
        nlink: 1,
        size: 0,
        addrs: [0; NDIRECT],
    };
    let mut inode_block = [0u8; BSIZE];
    device.read_block(sb.inode_start + ROOT_INUM / IPB as u32, &mut inode_block)?;
    let off = (ROOT_INUM as usize % IPB) * INODE_SIZE;
    inode_block[off..off + INODE_SIZE].copy_from_slice(&root.encode());
    device.write_block(sb.inode_start + ROOT_INUM / IPB as u32, &inode_block)?;

    let mut sb_block = [0u8; BSIZE];
    sb_block[..32].copy_from_slice(&sb.encode());
    device.write_block(0, &sb_block)?;
    device.flush()?;
    log::info!(
        "formatted volume: {} blocks, {} inodes, data starts at {}",
        size,
        ninodes,
        sb.data_start
    );
    Ok(sb)
}
