//! Shared types: error taxonomy, identifiers, and the timestamp source.

use core::sync::atomic::{AtomicU64, Ordering};

/// In-memory node identifier, unique for the lifetime of the process.
pub type Mnum = u64;

/// On-disk inode number.
pub type Inum = u32;

/// Result alias used throughout the crate.
pub type FsResult<T> = Result<T, FsError>;

/// Errors surfaced by the core. Invariant violations do not appear here:
/// they panic with a diagnostic instead (a broken mapping or a double free
/// means the filesystem state can no longer be trusted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Block or inode allocation found no free slot.
    NoSpace,
    /// Lookup target does not exist.
    NotFound,
    /// Create or link target already exists.
    AlreadyExists,
    /// Directory operation applied to a non-directory.
    NotDir,
    /// File operation applied to a directory.
    IsDir,
    /// Directory still has entries.
    NotEmpty,
    /// Name is empty, too long, or contains a reserved byte.
    InvalidName,
    /// Write would exceed the maximum file size.
    FileTooLarge,
    /// Block device failure.
    Io,
    /// On-disk structure failed validation.
    Corrupted,
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            FsError::NoSpace => "out of disk space",
            FsError::NotFound => "no such file or directory",
            FsError::AlreadyExists => "already exists",
            FsError::NotDir => "not a directory",
            FsError::IsDir => "is a directory",
            FsError::NotEmpty => "directory not empty",
            FsError::InvalidName => "invalid name",
            FsError::FileTooLarge => "file too large",
            FsError::Io => "I/O error",
            FsError::Corrupted => "corrupted on-disk structure",
        };
        f.write_str(msg)
    }
}

/// Type of an in-memory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MnodeType {
    File,
    Dir,
}

/// Monotonic timestamp source standing in for the CPU timestamp counter.
///
/// A single fetch-and-add keeps the counter strictly monotonic per CPU and
/// globally, which is stronger than real TSCs but satisfies the same
/// ordering contract the logical log depends on.
#[derive(Debug, Default)]
pub struct Tsc(AtomicU64);

impl Tsc {
    pub const fn new() -> Self {
        Tsc(AtomicU64::new(0))
    }

    /// Read the next timestamp value.
    pub fn read(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Validate a directory-entry name against the on-disk limits.
pub fn check_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name.len() >= crate::DIRSIZ {
        return Err(FsError::InvalidName);
    }
    if name.bytes().any(|b| b == 0 || b == b'/') {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsc_is_strictly_monotonic() {
        let tsc = Tsc::new();
        let a = tsc.read();
        let b = tsc.read();
        assert!(b > a);
    }

    #[test]
    fn name_validation() {
        assert!(check_name("a").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("a/b").is_err());
        let long = "x".repeat(crate::DIRSIZ);
        assert!(check_name(&long).is_err());
    }
}
