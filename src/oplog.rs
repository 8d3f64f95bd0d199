//! Per-CPU logical log of metadata operations.
//!
//! Each CPU appends to its own buffer without contending with other CPUs.
//! Merging into the shared `operation_vec` happens only under
//! [`LogicalLog::wait_synchronize`], which first waits out every CPU whose
//! in-flight operation started at or before the target timestamp.

use crate::operation::MfsOperation;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

struct CpuBuffer {
    ops: Vec<MfsOperation>,
    /// Timestamp of the most recently started operation on this CPU.
    start_tsc: u64,
    /// Timestamp recorded when that operation finished. `start > end`
    /// means an operation is in flight.
    end_tsc: u64,
}

impl CpuBuffer {
    const fn new() -> Self {
        CpuBuffer {
            ops: Vec::new(),
            start_tsc: 0,
            end_tsc: 0,
        }
    }
}

/// While a `SyncGuard` is held the merged operation vector is stable and
/// contains every operation with `timestamp <= target`, sorted by timestamp
/// (CPU id ascending on ties). Dependency resolution removes the operations
/// it claims through the guard.
pub type SyncGuard<'a> = MutexGuard<'a, Vec<MfsOperation>>;

pub struct LogicalLog {
    cpus: Vec<Mutex<CpuBuffer>>,
    operation_vec: Mutex<Vec<MfsOperation>>,
}

impl LogicalLog {
    pub fn new(ncpu: usize) -> Self {
        assert!(ncpu > 0, "logical log needs at least one CPU");
        let mut cpus = Vec::with_capacity(ncpu);
        for _ in 0..ncpu {
            cpus.push(Mutex::new(CpuBuffer::new()));
        }
        LogicalLog {
            cpus,
            operation_vec: Mutex::new(Vec::new()),
        }
    }

    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }

    /// Reserve per-CPU buffer space ahead of the first operation.
    pub fn preload(&self) {
        for cpu in &self.cpus {
            cpu.lock().ops.reserve(64);
        }
    }

    /// Record that an operation with start timestamp `tsc` began on `cpu`.
    pub fn update_start_tsc(&self, cpu: usize, tsc: u64) {
        self.cpus[cpu].lock().start_tsc = tsc;
    }

    /// Record that the operation on `cpu` finished at `tsc`.
    pub fn update_end_tsc(&self, cpu: usize, tsc: u64) {
        self.cpus[cpu].lock().end_tsc = tsc;
    }

    /// Append to the calling CPU's buffer. Buffers stay timestamp-ordered
    /// because each CPU's timestamps are monotonic.
    pub fn add_operation(&self, cpu: usize, op: MfsOperation) {
        self.cpus[cpu].lock().ops.push(op);
    }

    /// Merge every operation with `timestamp <= target` into the shared
    /// vector and return a guard over it. Spins until no CPU has an
    /// operation in flight that started at or before `target`.
    pub fn wait_synchronize(&self, target: u64) -> SyncGuard<'_> {
        let mut merged = self.operation_vec.lock();
        for cpu in &self.cpus {
            loop {
                let mut buf = cpu.lock();
                if buf.start_tsc <= target && buf.start_tsc > buf.end_tsc {
                    // An operation that must be visible is still executing.
                    drop(buf);
                    core::hint::spin_loop();
                    continue;
                }
                let split = buf
                    .ops
                    .iter()
                    .position(|op| op.timestamp > target)
                    .unwrap_or(buf.ops.len());
                merged.extend(buf.ops.drain(..split));
                break;
            }
        }
        // Stable sort: ties keep per-CPU drain order, i.e. CPU id ascending.
        merged.sort_by_key(|op| op.timestamp);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MnodeType;
    use crate::operation::OpKind;
    use alloc::string::ToString;

    fn op(ts: u64, cpu: usize, mnum: u64) -> MfsOperation {
        MfsOperation::new(
            ts,
            cpu,
            OpKind::Create {
                mnum,
                parent: 1,
                mtype: MnodeType::File,
                name: "n".to_string(),
            },
        )
    }

    #[test]
    fn merge_orders_across_cpus_by_timestamp() {
        let log = LogicalLog::new(2);
        log.add_operation(0, op(3, 0, 10));
        log.add_operation(1, op(1, 1, 11));
        log.add_operation(0, op(5, 0, 12));
        log.add_operation(1, op(4, 1, 13));
        let merged = log.wait_synchronize(10);
        let ts: alloc::vec::Vec<u64> = merged.iter().map(|o| o.timestamp).collect();
        assert_eq!(ts, [1, 3, 4, 5]);
    }

    #[test]
    fn synchronize_leaves_newer_operations_in_place() {
        let log = LogicalLog::new(1);
        log.add_operation(0, op(1, 0, 10));
        log.add_operation(0, op(8, 0, 11));
        {
            let mut merged = log.wait_synchronize(4);
            assert_eq!(merged.len(), 1);
            merged.clear();
        }
        let merged = log.wait_synchronize(u64::MAX);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].timestamp, 8);
    }

    #[test]
    fn waits_for_in_flight_operation() {
        use std::sync::Arc;

        let log = Arc::new(LogicalLog::new(1));
        log.update_start_tsc(0, 2);
        let log2 = log.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            log2.add_operation(0, op(2, 0, 10));
            log2.update_end_tsc(0, 3);
        });
        let merged = log.wait_synchronize(5);
        assert_eq!(merged.len(), 1);
        t.join().unwrap();
    }

    #[test]
    fn equal_timestamps_break_ties_by_cpu() {
        let log = LogicalLog::new(3);
        log.add_operation(2, op(7, 2, 32));
        log.add_operation(0, op(7, 0, 30));
        log.add_operation(1, op(7, 1, 31));
        let merged = log.wait_synchronize(7);
        let cpus: alloc::vec::Vec<usize> = merged.iter().map(|o| o.cpu).collect();
        assert_eq!(cpus, [0, 1, 2]);
    }
}
