//! Logged metadata operations.
//!
//! Every metadata system call records its intention as one `MfsOperation`
//! before returning. Operations carry the timestamp taken when the call
//! began; the merged per-CPU streams ordered by that timestamp are the
//! serialization the filesystem linearizes against.

use crate::common::{MnodeType, Mnum};
use alloc::string::String;
use alloc::vec::Vec;

/// Payload of a logged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    /// A new file or directory `name` was created under `parent`.
    Create {
        mnum: Mnum,
        parent: Mnum,
        mtype: MnodeType,
        name: String,
    },
    /// An additional name for `mnum` was created under `parent`.
    Link {
        parent: Mnum,
        mnum: Mnum,
        mtype: MnodeType,
        name: String,
    },
    /// The entry `name` was removed from `parent`.
    Unlink { parent: Mnum, name: String },
    /// The node's last link and last open handle are gone; its on-disk
    /// inode can be truncated and released.
    Delete { mnum: Mnum },
    /// `old_parent/old_name` became `new_parent/new_name`.
    Rename {
        mnum: Mnum,
        mtype: MnodeType,
        old_parent: Mnum,
        old_name: String,
        new_parent: Mnum,
        new_name: String,
    },
}

/// A timestamped operation in the logical log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfsOperation {
    pub timestamp: u64,
    /// CPU whose log recorded the operation; breaks timestamp ties.
    pub cpu: usize,
    pub kind: OpKind,
}

impl MfsOperation {
    pub fn new(timestamp: u64, cpu: usize, kind: OpKind) -> Self {
        MfsOperation {
            timestamp,
            cpu,
            kind,
        }
    }

    /// Append every mnum this operation mentions to `out`, skipping ones
    /// already present.
    pub fn collect_mnums(&self, out: &mut Vec<Mnum>) {
        let mut push = |m: Mnum| {
            if !out.contains(&m) {
                out.push(m);
            }
        };
        match &self.kind {
            OpKind::Create { mnum, parent, .. } => {
                push(*mnum);
                push(*parent);
            }
            OpKind::Link { parent, mnum, .. } => {
                push(*parent);
                push(*mnum);
            }
            OpKind::Unlink { parent, .. } => push(*parent),
            OpKind::Delete { mnum } => push(*mnum),
            OpKind::Rename {
                mnum,
                old_parent,
                new_parent,
                ..
            } => {
                push(*mnum);
                push(*old_parent);
                push(*new_parent);
            }
        }
    }

    /// Does this operation mention any mnum in `needed`?
    pub fn check_dependency(&self, needed: &[Mnum]) -> bool {
        let hit = |m: &Mnum| needed.contains(m);
        match &self.kind {
            OpKind::Create { mnum, parent, .. } => hit(mnum) || hit(parent),
            OpKind::Link { parent, mnum, .. } => hit(parent) || hit(mnum),
            OpKind::Unlink { parent, .. } => hit(parent),
            OpKind::Delete { mnum } => hit(mnum),
            OpKind::Rename {
                mnum,
                old_parent,
                new_parent,
                ..
            } => hit(mnum) || hit(old_parent) || hit(new_parent),
        }
    }

    /// Does this operation change the structure of a directory in `needed`
    /// (or of `target` itself)? Used when the fsync target is a directory:
    /// entries added to or removed from it must be durable with it.
    pub fn check_parent_dependency(&self, needed: &[Mnum], target: Mnum) -> bool {
        let hit = |m: &Mnum| *m == target || needed.contains(m);
        match &self.kind {
            OpKind::Create { parent, .. } => hit(parent),
            OpKind::Link { parent, .. } => hit(parent),
            OpKind::Unlink { parent, .. } => hit(parent),
            OpKind::Delete { .. } => false,
            OpKind::Rename {
                old_parent,
                new_parent,
                ..
            } => hit(old_parent) || hit(new_parent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn create(mnum: Mnum, parent: Mnum) -> MfsOperation {
        MfsOperation::new(
            1,
            0,
            OpKind::Create {
                mnum,
                parent,
                mtype: MnodeType::File,
                name: "f".to_string(),
            },
        )
    }

    #[test]
    fn dependency_matches_any_mention() {
        let op = create(10, 2);
        assert!(op.check_dependency(&[10]));
        assert!(op.check_dependency(&[2]));
        assert!(!op.check_dependency(&[3]));
    }

    #[test]
    fn parent_dependency_ignores_the_child_edge() {
        let op = create(10, 2);
        assert!(op.check_parent_dependency(&[], 2));
        assert!(!op.check_parent_dependency(&[], 10));
    }

    #[test]
    fn rename_mentions_both_parents() {
        let op = MfsOperation::new(
            5,
            1,
            OpKind::Rename {
                mnum: 7,
                mtype: MnodeType::File,
                old_parent: 2,
                old_name: "a".to_string(),
                new_parent: 3,
                new_name: "b".to_string(),
            },
        );
        let mut mnums = Vec::new();
        op.collect_mnums(&mut mnums);
        assert_eq!(mnums, [7, 2, 3]);
        assert!(op.check_parent_dependency(&[3], 99));
    }

    #[test]
    fn collect_mnums_deduplicates() {
        let op = create(10, 2);
        let mut mnums = alloc::vec![2];
        op.collect_mnums(&mut mnums);
        assert_eq!(mnums, [2, 10]);
    }
}
