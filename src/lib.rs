//! ScaleFS core: the bridge between a scalable in-memory filesystem and a
//! conventional on-disk inode filesystem.
//!
//! Metadata system calls mutate the in-memory mnode tree and record their
//! intention as an [`operation::MfsOperation`] in a per-CPU logical log.
//! `sync` and `fsync` translate logged operations into [`transaction::Transaction`]s
//! of dirty disk blocks and push them through a physical write-ahead journal,
//! so that a crash at any point leaves the disk equivalent to some prefix of
//! the globally timestamp-ordered operation stream.
#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod balloc;
pub mod cache;
pub mod common;
pub mod device;
pub mod inode;
pub mod interface;
pub mod journal;
pub mod mnode;
pub mod operation;
pub mod oplog;
pub mod transaction;

#[cfg(test)]
mod scalefs_test;

pub use common::{FsError, FsResult, Inum, MnodeType, Mnum};
pub use device::{BlockDevice, MemDisk};
pub use interface::MfsInterface;

/// Disk block size in bytes.
pub const BSIZE: usize = 4096;

/// Maximum length of a directory-entry name.
pub const DIRSIZ: usize = 28;

/// Initial capacity of the mnum/inum mapping tables.
pub const NINODES: usize = 1024;

/// Byte size of the on-disk journal region. Bounds the size of a single
/// committed transaction (the journal is cleared after every commit).
pub const PHYS_JOURNAL_SIZE: usize = 1024 * 1024;

/// Bits per bitmap block.
pub const BPB: usize = BSIZE * 8;
