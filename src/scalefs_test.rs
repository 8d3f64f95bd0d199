//! End-to-end tests over an in-memory volume: the metadata path from
//! system call to logical log to journal to home locations, crash points
//! in the commit protocol, and the fsync dependency walk.

use crate::common::MnodeType;
use crate::device::{BlockDevice, MemDisk};
use crate::inode::{T_DIR, T_NONE};
use crate::interface::MfsInterface;
use crate::journal::{JournalHeader, RecordKind};
use crate::transaction::Transaction;
use crate::{BPB, BSIZE};
use std::sync::Arc;

const NINODES: u32 = 64;
const DISK_BLOCKS: u32 = 600;

fn fresh_fs() -> (Arc<MemDisk>, MfsInterface) {
    let disk = Arc::new(MemDisk::new(DISK_BLOCKS));
    let fs = MfsInterface::mkfs(disk.clone(), NINODES, 2).unwrap();
    (disk, fs)
}

/// Crash: snapshot the raw device, dropping every in-core structure.
fn crash(disk: &MemDisk) -> Arc<MemDisk> {
    Arc::new(MemDisk::from_bytes(disk.to_bytes()))
}

fn bitmap_bit(disk: &MemDisk, fs: &MfsInterface, bno: u32) -> bool {
    let mut block = [0u8; BSIZE];
    disk.read_block(fs.inodes.superblock().bmap_block(bno), &mut block)
        .unwrap();
    let bi = bno as usize % BPB;
    block[bi / 8] & (1 << (bi % 8)) != 0
}

#[test]
fn create_sync_survives_remount() {
    let (disk, fs) = fresh_fs();
    let root = fs.root();
    fs.create(0, root, "a", MnodeType::File).unwrap();
    fs.sync().unwrap();
    drop(fs);

    let fs = MfsInterface::mount(disk, 2).unwrap();
    let root = fs.tree().get(fs.root()).unwrap();
    fs.load_dir(&root).unwrap();
    let mnum = root.dir_lookup("a").expect("/a missing after remount");
    let node = fs.tree().get(mnum).unwrap();
    assert_eq!(node.kind(), MnodeType::File);
    assert_eq!(fs.get_file_size(mnum), 0);
}

#[test]
fn sync_applies_operations_in_timestamp_order() {
    let (_, fs) = fresh_fs();
    let root = fs.root();
    let d1 = fs.create(0, root, "d1", MnodeType::Dir).unwrap();
    let d2 = fs.create(1, d1, "d2", MnodeType::Dir).unwrap();
    let f = fs.create(0, d2, "f", MnodeType::File).unwrap();
    fs.sync().unwrap();
    // The nested create chain only works if parents reached the disk first.
    for mnum in [d1, d2, f] {
        assert!(fs.inode_lookup(mnum).is_some());
    }
    let d2_inode = fs.inodes.iget(fs.inode_lookup(d2).unwrap()).unwrap();
    assert_eq!(
        fs.inodes.dirlookup(&d2_inode, "f").unwrap(),
        fs.inode_lookup(f)
    );
}

#[test]
fn crash_between_data_and_commit_discards_transaction() {
    let (disk, fs) = fresh_fs();
    let baseline = fs.free_block_count();

    // Hand-write a transaction prefix: Start plus three Data records aimed
    // at free data blocks, then crash before the Commit record.
    let sb = *fs.inodes.superblock();
    {
        let mut st = fs.journal.prepare_for_commit();
        let zero = [0u8; BSIZE];
        fs.journal
            .write_record(&mut st, &JournalHeader::new(RecordKind::Start, 77, 0), &zero);
        for bno in sb.data_start..sb.data_start + 3 {
            fs.journal.write_record(
                &mut st,
                &JournalHeader::new(RecordKind::Data, 77, bno),
                &[0xeeu8; BSIZE],
            );
        }
    }

    let crashed = crash(&disk);
    let fs = MfsInterface::mount(crashed.clone(), 1).unwrap();
    // The unfinished transaction left no trace: the bitmap still shows the
    // pre-crash state and the blocks it targeted are handed out again.
    assert_eq!(fs.free_block_count(), baseline);
    let got = fs.alloc_block().unwrap();
    assert!((sb.data_start..sb.data_start + 3).contains(&got));
    // Home locations were never touched.
    let mut buf = [0u8; BSIZE];
    crashed.read_block(sb.data_start, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn crash_after_commit_replays_on_mount() {
    let (disk, fs) = fresh_fs();
    let sb = *fs.inodes.superblock();
    let target = sb.data_start + 5;
    {
        let mut st = fs.journal.prepare_for_commit();
        let mut tr = Transaction::new(9);
        tr.add_block(target, &[0x5au8; BSIZE]);
        fs.journal.commit_transaction(&mut st, &tr);
        // Crash before writeback and before the journal is cleared.
    }

    let crashed = crash(&disk);
    let mut buf = [0u8; BSIZE];
    crashed.read_block(target, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0), "home write must not precede recovery");

    drop(MfsInterface::mount(crashed.clone(), 1).unwrap());
    crashed.read_block(target, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0x5a), "committed transaction not replayed");

    // Journal is zero-filled after recovery...
    for jb in sb.journal_start..sb.journal_start + sb.journal_blocks {
        crashed.read_block(jb, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
    // ...so recovering again changes nothing (idempotent recovery).
    let again = crash(&crashed);
    drop(MfsInterface::mount(again.clone(), 1).unwrap());
    assert_eq!(again.to_bytes(), crashed.to_bytes());
}

#[test]
fn fsync_applies_only_the_dependency_closure() {
    let (disk, fs) = fresh_fs();
    let root = fs.root();
    let d1 = fs.create(0, root, "d1", MnodeType::Dir).unwrap();
    let d2 = fs.create(0, d1, "d2", MnodeType::Dir).unwrap();
    let f = fs.create(1, d2, "f", MnodeType::File).unwrap();
    let g = fs.create(1, d2, "g", MnodeType::File).unwrap();

    fs.fsync(f, false).unwrap();

    // The ancestor chain and the target are on disk; the sibling is not.
    for mnum in [d1, d2, f] {
        assert!(fs.inode_lookup(mnum).is_some());
    }
    assert!(fs.inode_lookup(g).is_none());

    // The sibling's create stays in the logical log and a later sync
    // applies it.
    fs.sync().unwrap();
    assert!(fs.inode_lookup(g).is_some());

    // A crash right after the fsync still shows the fsynced chain.
    drop(fs);
    let fs = MfsInterface::mount(crash(&disk), 1).unwrap();
    let root = fs.tree().get(fs.root()).unwrap();
    fs.load_dir(&root).unwrap();
    let d1 = fs.tree().get(root.dir_lookup("d1").unwrap()).unwrap();
    fs.load_dir(&d1).unwrap();
    let d2 = fs.tree().get(d1.dir_lookup("d2").unwrap()).unwrap();
    fs.load_dir(&d2).unwrap();
    assert!(d2.dir_lookup("f").is_some());
    assert!(d2.dir_lookup("g").is_some());
}

#[test]
fn fsync_of_directory_pulls_its_entries() {
    let (_, fs) = fresh_fs();
    let root = fs.root();
    let d = fs.create(0, root, "d", MnodeType::Dir).unwrap();
    let f = fs.create(0, d, "f", MnodeType::File).unwrap();
    let x = fs.create(1, root, "x", MnodeType::File).unwrap();

    fs.fsync(d, true).unwrap();
    assert!(fs.inode_lookup(d).is_some());
    assert!(fs.inode_lookup(f).is_some(), "entry of fsynced dir must be durable");
    assert!(fs.inode_lookup(x).is_none(), "unrelated file must stay logged");
}

#[test]
fn fsync_writes_dirty_file_pages() {
    let (disk, fs) = fresh_fs();
    let root = fs.root();
    let f = fs.create(0, root, "f", MnodeType::File).unwrap();
    let node = fs.tree().get(f).unwrap();
    node.file_write(10, b"durable bytes");
    fs.fsync(f, false).unwrap();

    drop(fs);
    let fs = MfsInterface::mount(crash(&disk), 1).unwrap();
    let root = fs.tree().get(fs.root()).unwrap();
    fs.load_dir(&root).unwrap();
    let f = root.dir_lookup("f").unwrap();
    assert_eq!(fs.get_file_size(f), 23);
    let mut buf = [0u8; 13];
    fs.load_file_page(f, &mut buf, 10).unwrap();
    assert_eq!(&buf, b"durable bytes");
}

#[test]
fn unlink_defers_delete_until_last_close() {
    let (_, fs) = fresh_fs();
    let root = fs.root();
    let f = fs.create(0, root, "a", MnodeType::File).unwrap();
    let open_handle = fs.tree().get(f).unwrap();
    open_handle.file_write(0, &[7u8; BSIZE]);
    fs.fsync(f, false).unwrap();
    let inum = fs.inode_lookup(f).unwrap();
    let after_write = fs.free_block_count();

    fs.unlink(0, root, "a").unwrap();
    fs.sync().unwrap();

    // The name is gone and the back-reference dropped, but the inode keeps
    // its contents while the handle is open.
    assert_eq!(fs.inodes.iget(inum).unwrap().nlink(), 0);
    assert!(fs.mnode_for_inum(inum).is_none());
    assert!(fs.inode_lookup(f).is_some());
    assert_eq!(fs.free_block_count(), after_write);

    drop(open_handle);
    fs.release(0, f).unwrap();
    fs.sync().unwrap();

    // Now the delete ran: mapping gone, inode cleared, data block freed.
    assert!(fs.inode_lookup(f).is_none());
    assert_eq!(fs.inodes.iget(inum).unwrap().itype(), T_NONE);
    assert_eq!(fs.free_block_count(), after_write + 1);
}

#[test]
fn rename_over_existing_frees_the_displaced_inode() {
    let (disk, fs) = fresh_fs();
    let root = fs.root();
    let a = fs.create(0, root, "a", MnodeType::File).unwrap();
    let b = fs.create(0, root, "b", MnodeType::File).unwrap();
    fs.tree().get(b).unwrap().file_write(0, &[1u8; 2 * BSIZE]);
    fs.fsync(a, false).unwrap();
    fs.fsync(b, false).unwrap();
    let i_a = fs.inode_lookup(a).unwrap();
    let i_b = fs.inode_lookup(b).unwrap();
    let before = fs.free_block_count();

    fs.rename(0, root, "a", root, "b").unwrap();
    fs.sync().unwrap();

    let root_inode = fs.inodes.iget(fs.inode_lookup(root).unwrap()).unwrap();
    assert_eq!(fs.inodes.dirlookup(&root_inode, "b").unwrap(), Some(i_a));
    assert_eq!(fs.inodes.dirlookup(&root_inode, "a").unwrap(), None);
    assert_eq!(fs.inodes.iget(i_b).unwrap().itype(), T_NONE);
    assert_eq!(fs.free_block_count(), before + 2);

    // Rename atomicity across a crash after the sync: new link only.
    drop(fs);
    let fs = MfsInterface::mount(crash(&disk), 1).unwrap();
    let root = fs.tree().get(fs.root()).unwrap();
    fs.load_dir(&root).unwrap();
    assert!(root.dir_lookup("b").is_some());
    assert!(root.dir_lookup("a").is_none());
}

#[test]
fn rename_before_sync_keeps_old_state_on_crash() {
    let (disk, fs) = fresh_fs();
    let root = fs.root();
    fs.create(0, root, "a", MnodeType::File).unwrap();
    fs.sync().unwrap();
    fs.rename(0, root, "a", root, "b").unwrap();
    // Crash with the rename still in the logical log.
    let fs2 = MfsInterface::mount(crash(&disk), 1).unwrap();
    let root2 = fs2.tree().get(fs2.root()).unwrap();
    fs2.load_dir(&root2).unwrap();
    assert!(root2.dir_lookup("a").is_some());
    assert!(root2.dir_lookup("b").is_none());
}

#[test]
fn create_file_if_new_is_idempotent() {
    let (_, fs) = fresh_fs();
    let root = fs.root();
    let f = fs.create(0, root, "x", MnodeType::File).unwrap();
    fs.sync().unwrap();
    let inum = fs.inode_lookup(f).unwrap();

    let mut tr = Transaction::new(fs.inode_lookup(f).unwrap() as u64 + 100);
    let again = fs.create_file_if_new(f, root, "x", &mut tr, true).unwrap();
    assert_eq!(again, None);
    assert_eq!(fs.inode_lookup(f), Some(inum));
    assert!(tr.blocks().is_empty(), "no-op create must not dirty blocks");
}

#[test]
fn mapping_tables_stay_symmetric() {
    let (_, fs) = fresh_fs();
    let root = fs.root();
    let d = fs.create(0, root, "d", MnodeType::Dir).unwrap();
    let f = fs.create(0, d, "f", MnodeType::File).unwrap();
    fs.sync().unwrap();
    fs.unlink(0, d, "f").unwrap();
    fs.sync().unwrap();

    for mnum in [root, d, f] {
        if let Some(inum) = fs.inode_lookup(mnum) {
            if let Some(node) = fs.mnode_for_inum(inum) {
                assert_eq!(node.mnum(), mnum);
            }
        }
    }
}

#[test]
fn bitmap_matches_allocator_after_commit() {
    let (disk, fs) = fresh_fs();
    let root = fs.root();
    let f = fs.create(0, root, "f", MnodeType::File).unwrap();
    fs.tree().get(f).unwrap().file_write(0, &[3u8; BSIZE]);
    fs.fsync(f, false).unwrap();

    let inum = fs.inode_lookup(f).unwrap();
    let addrs = fs.inodes.iget(inum).unwrap().lock().addrs;
    let data_block = addrs[0];
    assert_ne!(data_block, 0);
    assert!(bitmap_bit(&disk, &fs, data_block), "allocated bit must be set on disk");

    let free = fs.alloc_block().unwrap();
    // Not yet committed, so the disk bit for a freshly popped block is
    // still clear.
    assert!(!bitmap_bit(&disk, &fs, free));
}

#[test]
fn concurrent_creates_from_two_cpus_all_reach_disk() {
    let (_, fs) = fresh_fs();
    let fs = Arc::new(fs);
    let root = fs.root();

    let spawn = |cpu: usize, prefix: &'static str| {
        let fs = fs.clone();
        std::thread::spawn(move || {
            for i in 0..20 {
                fs.create(cpu, root, &format!("{}{}", prefix, i), MnodeType::File)
                    .unwrap();
            }
        })
    };
    let t0 = spawn(0, "a");
    let t1 = spawn(1, "b");
    t0.join().unwrap();
    t1.join().unwrap();

    fs.sync().unwrap();
    let root_inode = fs.inodes.iget(fs.inode_lookup(root).unwrap()).unwrap();
    let entries = fs.inodes.dir_entries(&root_inode).unwrap();
    assert_eq!(entries.len(), 40);
}

#[test]
fn journal_is_empty_after_every_sync() {
    let (disk, fs) = fresh_fs();
    let root = fs.root();
    let sb = *fs.inodes.superblock();
    fs.create(0, root, "p", MnodeType::Dir).unwrap();
    fs.sync().unwrap();
    let mut buf = [0u8; BSIZE];
    for jb in sb.journal_start..sb.journal_start + sb.journal_blocks {
        disk.read_block(jb, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0), "journal block {} not cleared", jb);
    }
}

#[test]
fn link_creates_a_second_durable_name() {
    let (disk, fs) = fresh_fs();
    let root = fs.root();
    let f = fs.create(0, root, "one", MnodeType::File).unwrap();
    fs.link(0, root, f, "two").unwrap();
    fs.sync().unwrap();

    let inum = fs.inode_lookup(f).unwrap();
    assert_eq!(fs.inodes.iget(inum).unwrap().nlink(), 2);

    fs.unlink(0, root, "one").unwrap();
    fs.sync().unwrap();
    assert_eq!(fs.inodes.iget(inum).unwrap().nlink(), 1);

    drop(fs);
    let fs = MfsInterface::mount(crash(&disk), 1).unwrap();
    let root = fs.tree().get(fs.root()).unwrap();
    fs.load_dir(&root).unwrap();
    assert!(root.dir_lookup("one").is_none());
    assert!(root.dir_lookup("two").is_some());
}

#[test]
fn evict_caches_preserve_correctness() {
    let (_, fs) = fresh_fs();
    let root = fs.root();
    let f = fs.create(0, root, "f", MnodeType::File).unwrap();
    let node = fs.tree().get(f).unwrap();
    node.file_write(0, b"resident");
    fs.fsync(f, false).unwrap();

    fs.evict_bufcache();
    fs.evict_pagecache();

    // Pages were clean after fsync, so they are gone; re-read from disk.
    let mut buf = [0u8; 8];
    fs.load_file_page(f, &mut buf, 0).unwrap();
    assert_eq!(&buf, b"resident");
}

#[test]
fn sync_dirty_files_flushes_every_dirty_file() {
    let (disk, fs) = fresh_fs();
    let root = fs.root();
    let f1 = fs.create(0, root, "f1", MnodeType::File).unwrap();
    let f2 = fs.create(0, root, "f2", MnodeType::File).unwrap();
    fs.sync().unwrap();
    fs.tree().get(f1).unwrap().file_write(0, b"first");
    fs.tree().get(f2).unwrap().file_write(0, b"second");

    fs.sync_dirty_files().unwrap();

    drop(fs);
    let fs = MfsInterface::mount(crash(&disk), 1).unwrap();
    let root = fs.tree().get(fs.root()).unwrap();
    fs.load_dir(&root).unwrap();
    assert_eq!(fs.get_file_size(root.dir_lookup("f1").unwrap()), 5);
    assert_eq!(fs.get_file_size(root.dir_lookup("f2").unwrap()), 6);
}

#[test]
fn out_of_space_is_reported_not_fatal() {
    let (_, fs) = fresh_fs();
    // Drain the allocator dry.
    while fs.alloc_block().is_some() {}
    assert_eq!(fs.free_block_count(), 0);
    assert!(fs.alloc_block().is_none());

    // A metadata op that needs a block now fails with NoSpace before any
    // journal write.
    let root = fs.root();
    fs.create(0, root, "no-room", MnodeType::File).unwrap();
    let err = fs.sync().unwrap_err();
    assert_eq!(err, crate::common::FsError::NoSpace);
}

#[test]
fn root_directory_loads_as_dir() {
    let (_, fs) = fresh_fs();
    let root = fs.tree().get(fs.root()).unwrap();
    assert!(root.is_dir());
    assert_eq!(
        fs.inodes.iget(fs.inode_lookup(fs.root()).unwrap()).unwrap().itype(),
        T_DIR
    );
}
