//! The interface layer: translates logged metadata operations into
//! journaled transactions and keeps the in-memory and on-disk worlds in
//! step.
//!
//! Ownership of the two mapping tables follows the tree: `mnode -> inode`
//! stores plain inums, `inode -> mnode` stores weak back-references, and
//! the [`MnodeTree`] remains the sole owner of live nodes. The pair is kept
//! symmetric: both directions are inserted when an inode is bound to an
//! mnode and both are gone once the node's unlink and delete have been
//! applied.

use crate::balloc::BlockAllocator;
use crate::cache::BufferCache;
use crate::common::{check_name, FsError, FsResult, Inum, MnodeType, Mnum, Tsc};
use crate::device::BlockDevice;
use crate::inode::{format, InodeLayer, SuperBlock, T_DIR, T_FILE};
use crate::journal::{Journal, JournalState};
use crate::mnode::{Mnode, MnodeTree};
use crate::operation::{MfsOperation, OpKind};
use crate::oplog::LogicalLog;
use crate::transaction::Transaction;
use crate::{BPB, BSIZE};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

/// The top-level filesystem context. One value per mounted volume; no
/// process-wide state.
pub struct MfsInterface {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) cache: Arc<BufferCache>,
    pub(crate) inodes: InodeLayer,
    pub(crate) mnodes: Arc<MnodeTree>,
    pub(crate) balloc: Arc<BlockAllocator>,
    pub(crate) journal: Journal,
    pub(crate) oplog: LogicalLog,
    tsc: Tsc,
    inum_to_mnode: Mutex<HashMap<Inum, Weak<Mnode>>>,
    mnode_to_inode: Mutex<HashMap<Mnum, Inum>>,
    root_mnum: Mnum,
}

impl MfsInterface {
    /// Mount a formatted volume. Journal recovery runs first, then the
    /// allocator is built from the (recovered) bitmap, then the root
    /// directory is loaded.
    pub fn mount(device: Arc<dyn BlockDevice>, ncpu: usize) -> FsResult<Self> {
        let sb = SuperBlock::read(device.as_ref())?;
        let journal = Journal::new(device.clone(), sb.journal_start, sb.journal_blocks);

        // Reapply committed transactions before anything reads the disk:
        // they may contain bitmap and inode updates.
        let recovered = journal.recover()?;
        if !recovered.is_empty() {
            log::info!("recovery: writing back {} journaled blocks", recovered.len());
            for b in &recovered {
                device.write_block(b.bno, &b.data[..])?;
            }
            device.flush()?;
        }

        let cache = Arc::new(BufferCache::new(device.clone()));
        let balloc = Arc::new(BlockAllocator::new());
        balloc.initialize(&sb, &cache)?;
        let inodes = InodeLayer::new(sb, cache.clone(), balloc.clone());
        let oplog = LogicalLog::new(ncpu);
        oplog.preload();

        let mut fs = MfsInterface {
            device,
            cache,
            inodes,
            mnodes: Arc::new(MnodeTree::new()),
            balloc,
            journal,
            oplog,
            tsc: Tsc::new(),
            inum_to_mnode: Mutex::new(HashMap::with_capacity(crate::NINODES)),
            mnode_to_inode: Mutex::new(HashMap::with_capacity(crate::NINODES)),
            root_mnum: 0,
        };
        fs.root_mnum = fs.load_root()?;
        Ok(fs)
    }

    /// Format `device` and mount the fresh volume.
    pub fn mkfs(device: Arc<dyn BlockDevice>, ninodes: u32, ncpu: usize) -> FsResult<Self> {
        format(device.as_ref(), ninodes)?;
        Self::mount(device, ncpu)
    }

    pub fn root(&self) -> Mnum {
        self.root_mnum
    }

    pub fn tree(&self) -> &MnodeTree {
        &self.mnodes
    }

    pub fn ncpu(&self) -> usize {
        self.oplog.ncpu()
    }

    // ------------------------------------------------------------------
    // Mapping tables
    // ------------------------------------------------------------------

    /// The inum bound to `mnum`, if any.
    pub fn inode_lookup(&self, mnum: Mnum) -> Option<Inum> {
        self.mnode_to_inode.lock().get(&mnum).copied()
    }

    /// The live mnode bound to `inum`, if any.
    pub fn mnode_for_inum(&self, inum: Inum) -> Option<Arc<Mnode>> {
        self.inum_to_mnode.lock().get(&inum).and_then(Weak::upgrade)
    }

    fn bind_mapping(&self, mnum: Mnum, inum: Inum) {
        let weak = self
            .mnodes
            .get(mnum)
            .map(|m| Arc::downgrade(&m))
            .unwrap_or_default();
        self.inum_to_mnode.lock().insert(inum, weak);
        self.mnode_to_inode.lock().insert(mnum, inum);
    }

    fn get_inode(&self, mnum: Mnum, caller: &str) -> Arc<crate::inode::Inode> {
        let inum = self
            .inode_lookup(mnum)
            .unwrap_or_else(|| panic!("{}: no inode mapping for mnode {}", caller, mnum));
        self.inodes
            .iget(inum)
            .unwrap_or_else(|e| panic!("{}: inode {} unreadable: {}", caller, inum, e))
    }

    // ------------------------------------------------------------------
    // Metadata mutations (the enqueue side)
    // ------------------------------------------------------------------

    /// Run `body` bracketed by the per-CPU start/end timestamps the
    /// synchronization barrier depends on.
    fn with_op<R>(&self, cpu: usize, body: impl FnOnce(u64) -> FsResult<R>) -> FsResult<R> {
        let start = self.tsc.read();
        self.oplog.update_start_tsc(cpu, start);
        let result = body(start);
        self.oplog.update_end_tsc(cpu, self.tsc.read());
        result
    }

    fn log_op(&self, cpu: usize, timestamp: u64, kind: OpKind) {
        self.oplog
            .add_operation(cpu, MfsOperation::new(timestamp, cpu, kind));
    }

    /// Create a file or directory `name` under `parent` and log the intent.
    pub fn create(
        &self,
        cpu: usize,
        parent: Mnum,
        name: &str,
        kind: MnodeType,
    ) -> FsResult<Mnum> {
        check_name(name)?;
        self.with_op(cpu, |start| {
            let _epoch = self.mnodes.epoch();
            let dir = self.mnodes.get(parent).ok_or(FsError::NotFound)?;
            if !dir.is_dir() {
                return Err(FsError::NotDir);
            }
            if dir.dir_lookup(name).is_some() {
                return Err(FsError::AlreadyExists);
            }
            let node = self.mnodes.alloc(kind);
            dir.dir_insert(name, node.mnum())?;
            node.inc_nlink();
            self.log_op(
                cpu,
                start,
                OpKind::Create {
                    mnum: node.mnum(),
                    parent,
                    mtype: kind,
                    name: String::from(name),
                },
            );
            Ok(node.mnum())
        })
    }

    /// Add another name for an existing file.
    pub fn link(&self, cpu: usize, parent: Mnum, target: Mnum, name: &str) -> FsResult<()> {
        check_name(name)?;
        self.with_op(cpu, |start| {
            let _epoch = self.mnodes.epoch();
            let dir = self.mnodes.get(parent).ok_or(FsError::NotFound)?;
            if !dir.is_dir() {
                return Err(FsError::NotDir);
            }
            let node = self.mnodes.get(target).ok_or(FsError::NotFound)?;
            if node.is_dir() {
                return Err(FsError::IsDir);
            }
            dir.dir_insert(name, target)?;
            node.inc_nlink();
            self.log_op(
                cpu,
                start,
                OpKind::Link {
                    parent,
                    mnum: target,
                    mtype: node.kind(),
                    name: String::from(name),
                },
            );
            Ok(())
        })
    }

    /// Remove the entry `name` from `parent`. Directories must be empty.
    pub fn unlink(&self, cpu: usize, parent: Mnum, name: &str) -> FsResult<()> {
        self.with_op(cpu, |start| {
            let _epoch = self.mnodes.epoch();
            let dir = self.mnodes.get(parent).ok_or(FsError::NotFound)?;
            if !dir.is_dir() {
                return Err(FsError::NotDir);
            }
            let child_mnum = dir.dir_lookup(name).ok_or(FsError::NotFound)?;
            let child = self
                .mnodes
                .get(child_mnum)
                .expect("directory entry without a live mnode");
            if child.is_dir() && !child.dir_is_empty() {
                return Err(FsError::NotEmpty);
            }
            dir.dir_remove(name);
            child.dec_nlink();
            self.log_op(
                cpu,
                start,
                OpKind::Unlink {
                    parent,
                    name: String::from(name),
                },
            );
            self.maybe_reap(cpu, &child);
            Ok(())
        })
    }

    /// Move `old_parent/old_name` to `new_parent/new_name`, displacing any
    /// existing target entry.
    pub fn rename(
        &self,
        cpu: usize,
        old_parent: Mnum,
        old_name: &str,
        new_parent: Mnum,
        new_name: &str,
    ) -> FsResult<()> {
        check_name(new_name)?;
        self.with_op(cpu, |start| {
            let _epoch = self.mnodes.epoch();
            let src = self.mnodes.get(old_parent).ok_or(FsError::NotFound)?;
            let dst = self.mnodes.get(new_parent).ok_or(FsError::NotFound)?;
            if !src.is_dir() || !dst.is_dir() {
                return Err(FsError::NotDir);
            }
            let child_mnum = src.dir_lookup(old_name).ok_or(FsError::NotFound)?;
            let child = self
                .mnodes
                .get(child_mnum)
                .expect("directory entry without a live mnode");

            let displaced = match dst.dir_lookup(new_name) {
                Some(existing) if existing == child_mnum => return Ok(()),
                Some(existing) => {
                    let node = self
                        .mnodes
                        .get(existing)
                        .expect("directory entry without a live mnode");
                    if node.is_dir() && !node.dir_is_empty() {
                        return Err(FsError::NotEmpty);
                    }
                    dst.dir_remove(new_name);
                    node.dec_nlink();
                    Some(node)
                }
                None => None,
            };

            src.dir_remove(old_name);
            dst.dir_insert(new_name, child_mnum)?;
            self.log_op(
                cpu,
                start,
                OpKind::Rename {
                    mnum: child_mnum,
                    mtype: child.kind(),
                    old_parent,
                    old_name: String::from(old_name),
                    new_parent,
                    new_name: String::from(new_name),
                },
            );
            if let Some(node) = displaced {
                self.maybe_reap(cpu, &node);
            }
            Ok(())
        })
    }

    /// Called when the last open handle on `mnum` goes away. If the node is
    /// unlinked, its delete is logged and it leaves the tree.
    pub fn release(&self, cpu: usize, mnum: Mnum) -> FsResult<()> {
        self.with_op(cpu, |_| {
            let _epoch = self.mnodes.epoch();
            if let Some(node) = self.mnodes.get(mnum) {
                self.maybe_reap(cpu, &node);
            }
            Ok(())
        })
    }

    /// Log the deferred delete once a node has no links and no holders
    /// beyond the tree itself.
    fn maybe_reap(&self, cpu: usize, node: &Arc<Mnode>) {
        if node.nlink() != 0 || MnodeTree::external_refs(node) != 0 {
            return;
        }
        self.mnodes.remove(node.mnum());
        self.log_op(cpu, self.tsc.read(), OpKind::Delete { mnum: node.mnum() });
    }

    // ------------------------------------------------------------------
    // sync / fsync
    // ------------------------------------------------------------------

    /// Apply every logged operation and push the resulting transactions
    /// through the journal.
    pub fn sync(&self) -> FsResult<()> {
        let mut st = self.journal.prepare_for_commit();
        self.process_metadata_log(&mut st)?;
        self.flush_journal(&mut st)
    }

    /// Make `mnum` durable: apply exactly the logged operations it depends
    /// on (plus, for files, the node's dirty pages), commit, and write back.
    pub fn fsync(&self, mnum: Mnum, isdir: bool) -> FsResult<()> {
        let max_tsc = self.tsc.read();
        let mut st = self.journal.prepare_for_commit();
        let deps = {
            let mut guard = self.oplog.wait_synchronize(max_tsc);
            Self::find_dependent_ops(&mut guard, mnum, isdir)
        };
        // `deps` is newest-first; apply oldest-first so each operation sees
        // the on-disk state its predecessors created.
        for op in deps.iter().rev() {
            let mut tr = Transaction::new(op.timestamp);
            self.apply_op(op, &mut tr)?;
            self.journal.append(&mut st, tr);
        }
        if !isdir {
            self.sync_file_data(&mut st, mnum)?;
        }
        self.flush_journal(&mut st)
    }

    fn process_metadata_log(&self, st: &mut JournalState) -> FsResult<()> {
        let sync_tsc = self.tsc.read();
        let ops: Vec<MfsOperation> = {
            let mut guard = self.oplog.wait_synchronize(sync_tsc);
            guard.drain(..).collect()
        };
        for op in &ops {
            let mut tr = Transaction::new(op.timestamp);
            self.apply_op(op, &mut tr)?;
            self.journal.append(st, tr);
        }
        Ok(())
    }

    /// Backward walk over the merged log, pulling out every operation whose
    /// mnum closure touches the target. One pass suffices: inclusion only
    /// grows the needed set, and later operations are visited first.
    fn find_dependent_ops(
        ops: &mut Vec<MfsOperation>,
        mnum: Mnum,
        isdir: bool,
    ) -> Vec<MfsOperation> {
        let mut needed = alloc::vec![mnum];
        let mut deps = Vec::new();
        let mut i = ops.len();
        while i > 0 {
            i -= 1;
            let hit = if isdir && ops[i].check_parent_dependency(&needed, mnum) {
                true
            } else {
                ops[i].check_dependency(&needed)
            };
            if hit {
                let op = ops.remove(i);
                op.collect_mnums(&mut needed);
                deps.push(op);
            }
        }
        deps
    }

    /// Write a dirty file's resident pages into a transaction of its own.
    fn sync_file_data(&self, st: &mut JournalState, mnum: Mnum) -> FsResult<()> {
        let Some(node) = self.mnodes.get(mnum) else {
            return Ok(());
        };
        if node.is_dir() || !node.file_is_dirty() {
            return Ok(());
        }
        let _epoch = self.mnodes.epoch();
        let ip = self.get_inode(mnum, "sync_file_data");
        let mut tr = Transaction::new(self.tsc.read());
        let size = node.file_size();
        if (ip.size() as u64) > size {
            self.inodes.itrunc(&ip, size as u32, &mut tr)?;
        }
        for (page, data) in node.file_pages() {
            let off = page * BSIZE as u64;
            if off >= size {
                continue;
            }
            let len = core::cmp::min(BSIZE as u64, size - off) as usize;
            self.inodes.writei(&ip, &data[..len], off as u32, &mut tr)?;
        }
        self.inodes.update_size(&ip, size as u32, &mut tr)?;
        node.file_mark_clean();
        self.journal.append(st, tr);
        Ok(())
    }

    /// Flush every dirty file's pages to disk in one journaled batch.
    pub fn sync_dirty_files(&self) -> FsResult<()> {
        let mut st = self.journal.prepare_for_commit();
        let live: Vec<Mnum> = {
            let table = self.inum_to_mnode.lock();
            table
                .values()
                .filter_map(Weak::upgrade)
                .filter(|m| !m.is_dir())
                .map(|m| m.mnum())
                .collect()
        };
        for mnum in live {
            self.sync_file_data(&mut st, mnum)?;
        }
        self.flush_journal(&mut st)
    }

    // ------------------------------------------------------------------
    // Applying operations (the dequeue side)
    // ------------------------------------------------------------------

    fn apply_op(&self, op: &MfsOperation, tr: &mut Transaction) -> FsResult<()> {
        let _epoch = self.mnodes.epoch();
        match &op.kind {
            OpKind::Create {
                mnum,
                parent,
                mtype,
                name,
            } => match mtype {
                MnodeType::File => self
                    .create_file_if_new(*mnum, *parent, name, tr, true)
                    .map(|_| ()),
                MnodeType::Dir => self
                    .create_dir_if_new(*mnum, *parent, name, tr, true)
                    .map(|_| ()),
            },
            OpKind::Link {
                parent,
                mnum,
                mtype,
                name,
            } => {
                self.create_directory_entry(*parent, name, *mnum, *mtype, tr)?;
                self.update_dir_inode(*parent, tr)
            }
            OpKind::Unlink { parent, name } => {
                self.unlink_old_inode(*parent, name, tr)?;
                self.update_dir_inode(*parent, tr)
            }
            OpKind::Delete { mnum } => self.delete_old_inode(*mnum, tr),
            OpKind::Rename {
                mnum,
                mtype,
                old_parent,
                old_name,
                new_parent,
                new_name,
            } => {
                self.create_directory_entry(*new_parent, new_name, *mnum, *mtype, tr)?;
                self.update_dir_inode(*new_parent, tr)?;
                self.unlink_old_inode(*old_parent, old_name, tr)?;
                self.update_dir_inode(*old_parent, tr)
            }
        }
    }

    /// Allocate an on-disk inode for a fresh file mnode. Idempotent: a
    /// second call with the same mnum is a no-op returning `None`.
    ///
    /// The parent is always on disk already: creates are logged in order,
    /// so a parent's create reaches the disk before any child's.
    pub fn create_file_if_new(
        &self,
        mnum: Mnum,
        parent: Mnum,
        name: &str,
        tr: &mut Transaction,
        link_in_parent: bool,
    ) -> FsResult<Option<Inum>> {
        if self.inode_lookup(mnum).is_some() {
            return Ok(None);
        }
        let parent_inum = self
            .inode_lookup(parent)
            .unwrap_or_else(|| panic!("create_file_if_new: parent {} does not exist", parent));

        let ip = self.inodes.ialloc(T_FILE, tr)?;
        self.bind_mapping(mnum, ip.inum);

        if link_in_parent {
            let parenti = self.inodes.iget(parent_inum)?;
            self.inodes.dirlink(&parenti, name, ip.inum, tr)?;
        }
        Ok(Some(ip.inum))
    }

    /// Directory flavor of [`MfsInterface::create_file_if_new`]; also emits
    /// the `..` entry pointing at the parent.
    pub fn create_dir_if_new(
        &self,
        mnum: Mnum,
        parent: Mnum,
        name: &str,
        tr: &mut Transaction,
        link_in_parent: bool,
    ) -> FsResult<Option<Inum>> {
        if self.inode_lookup(mnum).is_some() {
            return Ok(None);
        }
        let parent_inum = self
            .inode_lookup(parent)
            .unwrap_or_else(|| panic!("create_dir_if_new: parent {} does not exist", parent));

        let ip = self.inodes.ialloc(T_DIR, tr)?;
        self.bind_mapping(mnum, ip.inum);
        self.inodes.dirlink(&ip, "..", parent_inum, tr)?;

        if link_in_parent {
            let parenti = self.inodes.iget(parent_inum)?;
            self.inodes.dirlink(&parenti, name, ip.inum, tr)?;
        }
        Ok(Some(ip.inum))
    }

    /// Materialize the entry `name -> child` in the on-disk parent. An
    /// existing entry under the same name that points at a different inode
    /// is unlinked first; if that orphans it, its contents are released and
    /// its back-reference dropped.
    pub fn create_directory_entry(
        &self,
        parent: Mnum,
        name: &str,
        child: Mnum,
        mtype: MnodeType,
        tr: &mut Transaction,
    ) -> FsResult<()> {
        let dp = self.get_inode(parent, "create_directory_entry");

        if let Some(existing) = self.inodes.dirlookup(&dp, name)? {
            if self.inode_lookup(child) == Some(existing) {
                return Ok(());
            }
            self.inodes.dirunlink(&dp, name, tr)?;
            let old = self.inodes.iget(existing)?;
            if old.nlink() == 0 {
                self.inodes.itrunc(&old, 0, tr)?;
                self.inum_to_mnode.lock().remove(&existing);
            }
        }

        match self.inode_lookup(child) {
            Some(inum) => self.inodes.dirlink(&dp, name, inum, tr),
            None => {
                let inum = match mtype {
                    MnodeType::File => self.create_file_if_new(child, parent, name, tr, false)?,
                    MnodeType::Dir => self.create_dir_if_new(child, parent, name, tr, false)?,
                }
                .expect("mapping existed for unmapped mnode");
                self.inodes.dirlink(&dp, name, inum, tr)
            }
        }
    }

    /// Remove the on-disk entry `name` from the parent. When the target's
    /// link count reaches zero its back-reference is dropped so the mnode
    /// can drain; truncation waits for the delete operation.
    pub fn unlink_old_inode(&self, parent: Mnum, name: &str, tr: &mut Transaction) -> FsResult<()> {
        let dp = self.get_inode(parent, "unlink_old_inode");
        let Some(target) = self.inodes.dirlookup(&dp, name)? else {
            return Ok(());
        };
        self.inodes.dirunlink(&dp, name, tr)?;
        let ti = self.inodes.iget(target)?;
        if ti.nlink() == 0 {
            self.inum_to_mnode.lock().remove(&target);
        }
        Ok(())
    }

    /// Release the on-disk inode behind a fully dropped mnode: truncate,
    /// clear, and unbind. Pairs with the table reference taken at
    /// allocation time.
    pub fn delete_old_inode(&self, mnum: Mnum, tr: &mut Transaction) -> FsResult<()> {
        let ip = self.get_inode(mnum, "delete_old_inode");
        self.inodes.itrunc(&ip, 0, tr)?;
        self.inodes.ifree(&ip, tr)?;
        self.mnode_to_inode.lock().remove(&mnum);
        self.inum_to_mnode.lock().remove(&ip.inum);
        Ok(())
    }

    /// Push the parent directory's inode to the transaction.
    pub fn update_dir_inode(&self, parent: Mnum, tr: &mut Transaction) -> FsResult<()> {
        let dp = self.get_inode(parent, "update_dir_inode");
        self.inodes.iupdate(&dp, tr)
    }

    // ------------------------------------------------------------------
    // Commit protocol
    // ------------------------------------------------------------------

    /// Write every pending transaction through the journal, one commit per
    /// transaction, in timestamp order.
    fn flush_journal(&self, st: &mut JournalState) -> FsResult<()> {
        let pending = core::mem::take(&mut st.pending);
        for mut tr in pending {
            self.pre_process_transaction(&mut tr)?;
            tr.prepare_for_commit();
            self.journal.commit_transaction(st, &tr);
            self.post_process_transaction(&tr);
            self.journal.clear(st);
        }
        Ok(())
    }

    /// Fold the transaction's allocation deltas into the on-disk bitmap.
    fn pre_process_transaction(&self, tr: &mut Transaction) -> FsResult<()> {
        let sb = *self.inodes.superblock();
        let mut touched: Vec<u32> = Vec::new();
        let flips: Vec<(u32, bool)> = tr
            .allocated_blocks()
            .iter()
            .map(|&b| (b, true))
            .chain(tr.freed_blocks().iter().map(|&b| (b, false)))
            .collect();
        for (bno, set) in flips {
            let bmap_bno = sb.bmap_block(bno);
            let buf = self.cache.get(bmap_bno)?;
            buf.modify(|data| {
                let bi = bno as usize % BPB;
                let mask = 1u8 << (bi % 8);
                if set {
                    data[bi / 8] |= mask;
                } else {
                    data[bi / 8] &= !mask;
                }
            });
            if !touched.contains(&bmap_bno) {
                touched.push(bmap_bno);
            }
        }
        for bmap_bno in touched {
            let buf = self.cache.get(bmap_bno)?;
            buf.read(|data| tr.add_block(bmap_bno, data));
        }
        Ok(())
    }

    /// After the commit record is durable: write every block to its home
    /// location, barrier, and only then release freed blocks to the
    /// in-memory allocator. Freeing earlier would let concurrent allocation
    /// hand the blocks out before the free was durable.
    fn post_process_transaction(&self, tr: &Transaction) {
        for b in tr.blocks() {
            if let Err(e) = self.device.write_block(b.bno, &b.data[..]) {
                panic!("writeback of block {} failed: {}", b.bno, e);
            }
            // The cached copy may already carry a later pending
            // transaction's changes; only mark it clean if it matches what
            // just hit the disk.
            if let Ok(buf) = self.cache.get(b.bno) {
                if buf.read(|data| data[..] == b.data[..]) {
                    self.cache.mark_clean(b.bno);
                }
            }
        }
        if let Err(e) = self.device.flush() {
            panic!("writeback barrier failed: {}", e);
        }
        for &bno in tr.freed_blocks() {
            self.balloc.free(bno);
        }
    }

    // ------------------------------------------------------------------
    // File data plumbing
    // ------------------------------------------------------------------

    /// Adopt the on-disk size into a freshly referenced file mnode.
    pub fn initialize_file(&self, node: &Arc<Mnode>) -> FsResult<()> {
        let _epoch = self.mnodes.epoch();
        let ip = self.get_inode(node.mnum(), "initialize_file");
        node.file_initialize_size(ip.size() as u64);
        Ok(())
    }

    /// Read file bytes from the disk inode backing `mnum`.
    pub fn load_file_page(&self, mnum: Mnum, buf: &mut [u8], pos: u32) -> FsResult<usize> {
        let _epoch = self.mnodes.epoch();
        let ip = self.get_inode(mnum, "load_file_page");
        self.inodes.readi(&ip, buf, pos)
    }

    /// On-disk size of the file backing `mnum`.
    pub fn get_file_size(&self, mnum: Mnum) -> u64 {
        let _epoch = self.mnodes.epoch();
        self.get_inode(mnum, "get_file_size").size() as u64
    }

    /// Record a new on-disk size for the file backing `mnum`.
    pub fn update_file_size(&self, mnum: Mnum, size: u32, tr: &mut Transaction) -> FsResult<()> {
        let _epoch = self.mnodes.epoch();
        let ip = self.get_inode(mnum, "update_file_size");
        self.inodes.update_size(&ip, size, tr)
    }

    /// Write file bytes through to the disk inode backing `mnum`.
    pub fn sync_file_page(
        &self,
        mnum: Mnum,
        buf: &[u8],
        pos: u32,
        tr: &mut Transaction,
    ) -> FsResult<usize> {
        let _epoch = self.mnodes.epoch();
        let ip = self.get_inode(mnum, "sync_file_page");
        self.inodes.writei(&ip, buf, pos, tr)
    }

    /// Truncate both the on-disk file and the in-memory pages to `off`.
    pub fn truncate_file(&self, mnum: Mnum, off: u32, tr: &mut Transaction) -> FsResult<()> {
        let _epoch = self.mnodes.epoch();
        let ip = self.get_inode(mnum, "truncate_file");
        self.inodes.itrunc(&ip, off, tr)?;
        if let Some(node) = self.mnodes.get(mnum) {
            node.file_truncate(off as u64);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loading from disk
    // ------------------------------------------------------------------

    fn mnode_alloc(&self, inum: Inum, kind: MnodeType) -> Arc<Mnode> {
        let node = self.mnodes.alloc(kind);
        self.bind_mapping(node.mnum(), inum);
        node
    }

    /// Build (or find) the mnode for an on-disk inode discovered during
    /// directory traversal.
    pub fn load_dir_entry(&self, inum: Inum) -> FsResult<Option<Arc<Mnode>>> {
        if let Some(node) = self.mnode_for_inum(inum) {
            return Ok(Some(node));
        }
        let ip = self.inodes.iget(inum)?;
        let kind = match ip.itype() {
            T_DIR => MnodeType::Dir,
            T_FILE => MnodeType::File,
            _ => return Ok(None),
        };
        let node = self.mnode_alloc(inum, kind);
        if kind == MnodeType::File {
            node.file_initialize_size(ip.size() as u64);
        }
        Ok(Some(node))
    }

    /// Populate a directory mnode with its on-disk entries.
    pub fn load_dir(&self, node: &Arc<Mnode>) -> FsResult<()> {
        let _epoch = self.mnodes.epoch();
        let ip = self.get_inode(node.mnum(), "load_dir");
        for (name, inum) in self.inodes.dir_entries(&ip)? {
            // The parent back-link carries no entry of its own.
            if name == "." || name == ".." {
                continue;
            }
            let Some(child) = self.load_dir_entry(inum)? else {
                continue;
            };
            if node.dir_lookup(&name).is_none() {
                node.dir_insert(&name, child.mnum())?;
                child.inc_nlink();
            }
        }
        Ok(())
    }

    fn load_root(&self) -> FsResult<Mnum> {
        let _epoch = self.mnodes.epoch();
        if let Some(node) = self.mnode_for_inum(crate::inode::ROOT_INUM) {
            return Ok(node.mnum());
        }
        let ip = self.inodes.iget(crate::inode::ROOT_INUM)?;
        if ip.itype() != T_DIR {
            return Err(FsError::Corrupted);
        }
        let node = self.mnode_alloc(crate::inode::ROOT_INUM, MnodeType::Dir);
        node.inc_nlink();
        Ok(node.mnum())
    }

    // ------------------------------------------------------------------
    // Allocator and cache surface
    // ------------------------------------------------------------------

    pub fn alloc_block(&self) -> Option<u32> {
        self.balloc.alloc()
    }

    pub fn free_block(&self, bno: u32) {
        self.balloc.free(bno);
    }

    /// Snapshot-approximate count of free data blocks.
    pub fn free_block_count(&self) -> usize {
        self.balloc.free_count()
    }

    /// Drop clean blocks from the buffer cache.
    pub fn evict_bufcache(&self) {
        log::info!("evicting clean buffer-cache blocks");
        self.cache.evict_clean();
    }

    /// Drop clean resident pages from every initialized file mnode.
    pub fn evict_pagecache(&self) {
        log::info!("evicting clean page-cache pages");
        let table = self.inum_to_mnode.lock();
        for node in table.values().filter_map(Weak::upgrade) {
            if !node.is_dir() && node.file_is_initialized() {
                node.drop_pagecache();
            }
        }
    }
}
