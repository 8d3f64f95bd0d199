//! Physical write-ahead journal.
//!
//! The journal occupies a fixed contiguous block range reserved at format
//! time. Records are `(header, data)` pairs written back to back from byte
//! offset zero; a transaction is one `Start` record, one `Data` record per
//! dirty block, and one `Commit` record, all carrying the transaction's
//! timestamp. An all-zero header marks the end of the log. The region is
//! zero-filled after every successful commit-and-writeback, so at most one
//! flush's worth of records is ever present.
//!
//! A single mutex over [`JournalState`] is the filesystem-wide commit lock;
//! every write path takes the guard via [`Journal::prepare_for_commit`] and
//! passes it down, so a journal append without the lock held is
//! unrepresentable.

use crate::common::{FsError, FsResult};
use crate::device::BlockDevice;
use crate::transaction::{DiskBlock, Transaction};
use crate::BSIZE;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

/// Encoded size of a record header.
pub const JOURNAL_HEADER_SIZE: usize = 13;

/// Bytes occupied by one record: header plus one data block.
pub const JOURNAL_RECORD_SIZE: usize = JOURNAL_HEADER_SIZE + BSIZE;

/// Journal record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Start = 1,
    Data = 2,
    Commit = 3,
}

/// On-disk record header, packed little-endian:
/// timestamp (8) | block_no (4) | kind (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub timestamp: u64,
    /// Home location of the data block; meaningful only for `Data` records.
    pub block_no: u32,
    pub kind: RecordKind,
}

impl JournalHeader {
    pub fn new(kind: RecordKind, timestamp: u64, block_no: u32) -> Self {
        JournalHeader {
            timestamp,
            block_no,
            kind,
        }
    }

    pub fn encode(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_no.to_le_bytes());
        buf[12] = self.kind as u8;
        buf
    }

    /// Decode a header. Returns `None` for an all-zero header (end of log)
    /// and for an unrecognized record type (a torn or corrupt record; the
    /// committed prefix before it stands).
    pub fn decode(buf: &[u8; JOURNAL_HEADER_SIZE]) -> Option<Self> {
        let kind = match buf[12] {
            1 => RecordKind::Start,
            2 => RecordKind::Data,
            3 => RecordKind::Commit,
            _ => return None,
        };
        let timestamp = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let block_no = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        Some(JournalHeader {
            timestamp,
            block_no,
            kind,
        })
    }
}

/// Byte-granular view of the reserved journal blocks.
struct JournalRegion {
    device: Arc<dyn BlockDevice>,
    start: u32,
    size: u64,
}

impl JournalRegion {
    fn write_at(&self, mut off: u64, data: &[u8]) -> FsResult<()> {
        if off + data.len() as u64 > self.size {
            return Err(FsError::Io);
        }
        let mut scratch = Box::new([0u8; BSIZE]);
        let mut pos = 0usize;
        while pos < data.len() {
            let bno = self.start + (off / BSIZE as u64) as u32;
            let inner = (off % BSIZE as u64) as usize;
            let n = core::cmp::min(BSIZE - inner, data.len() - pos);
            if n == BSIZE {
                self.device.write_block(bno, &data[pos..pos + BSIZE])?;
            } else {
                self.device.read_block(bno, &mut scratch[..])?;
                scratch[inner..inner + n].copy_from_slice(&data[pos..pos + n]);
                self.device.write_block(bno, &scratch[..])?;
            }
            pos += n;
            off += n as u64;
        }
        Ok(())
    }

    fn read_at(&self, mut off: u64, buf: &mut [u8]) -> FsResult<()> {
        if off + buf.len() as u64 > self.size {
            return Err(FsError::Io);
        }
        let mut scratch = Box::new([0u8; BSIZE]);
        let mut pos = 0usize;
        while pos < buf.len() {
            let bno = self.start + (off / BSIZE as u64) as u32;
            let inner = (off % BSIZE as u64) as usize;
            let n = core::cmp::min(BSIZE - inner, buf.len() - pos);
            self.device.read_block(bno, &mut scratch[..])?;
            buf[pos..pos + n].copy_from_slice(&scratch[inner..inner + n]);
            pos += n;
            off += n as u64;
        }
        Ok(())
    }

    /// Zero-fill every block overlapping `[0, upto)`.
    fn zero(&self, upto: u64) -> FsResult<()> {
        let zeroes = [0u8; BSIZE];
        let nblocks = (upto + BSIZE as u64 - 1) / BSIZE as u64;
        for b in 0..nblocks as u32 {
            self.device.write_block(self.start + b, &zeroes)?;
        }
        Ok(())
    }

    fn flush(&self) -> FsResult<()> {
        self.device.flush()
    }
}

/// State protected by the commit lock: the journal write offset and the
/// transactions built since the lock was taken, awaiting flush.
pub struct JournalState {
    pub(crate) offset: u64,
    pub(crate) pending: Vec<Transaction>,
}

impl JournalState {
    pub fn current_offset(&self) -> u64 {
        self.offset
    }
}

/// The physical journal and its commit lock.
pub struct Journal {
    region: JournalRegion,
    state: Mutex<JournalState>,
}

impl Journal {
    pub fn new(device: Arc<dyn BlockDevice>, start_block: u32, nblocks: u32) -> Self {
        Journal {
            region: JournalRegion {
                device,
                start: start_block,
                size: nblocks as u64 * BSIZE as u64,
            },
            state: Mutex::new(JournalState {
                offset: 0,
                pending: Vec::new(),
            }),
        }
    }

    /// Take the commit lock. The returned guard is the capability every
    /// journal mutation requires.
    pub fn prepare_for_commit(&self) -> MutexGuard<'_, JournalState> {
        self.state.lock()
    }

    /// Queue a fully built transaction for the next flush.
    pub fn append(&self, st: &mut JournalState, tr: Transaction) {
        st.pending.push(tr);
    }

    /// Write one transaction's records to the journal and make them durable.
    /// On return the transaction is committed: a crash at any later point
    /// will replay it. Journal I/O failure is fatal by contract.
    pub fn commit_transaction(&self, st: &mut JournalState, tr: &Transaction) {
        let needed = ((tr.blocks().len() + 2) * JOURNAL_RECORD_SIZE) as u64;
        assert!(
            st.offset + needed <= self.region.size,
            "transaction ({} blocks) exceeds journal capacity",
            tr.blocks().len()
        );

        let zero_data = [0u8; BSIZE];
        self.write_record(
            st,
            &JournalHeader::new(RecordKind::Start, tr.timestamp, 0),
            &zero_data,
        );
        for b in tr.blocks() {
            self.write_record(
                st,
                &JournalHeader::new(RecordKind::Data, tr.timestamp, b.bno),
                &b.data[..],
            );
        }
        // Data must be durable before the commit record can appear.
        self.barrier();
        self.write_record(
            st,
            &JournalHeader::new(RecordKind::Commit, tr.timestamp, 0),
            &zero_data,
        );
        self.barrier();
    }

    pub(crate) fn write_record(&self, st: &mut JournalState, hdr: &JournalHeader, data: &[u8]) {
        if let Err(e) = self
            .region
            .write_at(st.offset, &hdr.encode())
            .and_then(|_| self.region.write_at(st.offset + JOURNAL_HEADER_SIZE as u64, data))
        {
            panic!("journal write failed at offset {}: {}", st.offset, e);
        }
        st.offset += JOURNAL_RECORD_SIZE as u64;
    }

    fn barrier(&self) {
        if let Err(e) = self.region.flush() {
            panic!("journal flush failed: {}", e);
        }
    }

    /// Zero-fill the region just used and rewind the write offset.
    pub fn clear(&self, st: &mut JournalState) {
        if let Err(e) = self.region.zero(st.offset).and_then(|_| self.region.flush()) {
            panic!("journal clear failed: {}", e);
        }
        st.offset = 0;
    }

    /// Boot-time recovery: scan the journal from offset zero and collect the
    /// blocks of every fully committed transaction, in commit order. The
    /// scan stops at an all-zero header, a record of unknown type, or a
    /// timestamp that does not match the open transaction; everything after
    /// that point is discarded. The region is zero-filled afterwards.
    ///
    /// Runs before the block allocator is initialized, so the returned
    /// blocks may include bitmap updates.
    pub fn recover(&self) -> FsResult<Vec<DiskBlock>> {
        let mut committed: Vec<DiskBlock> = Vec::new();
        let mut pending: Vec<DiskBlock> = Vec::new();
        let mut open: Option<u64> = None;
        let mut off = 0u64;
        let mut hdr_buf = [0u8; JOURNAL_HEADER_SIZE];
        let mut data = Box::new([0u8; BSIZE]);

        while off + JOURNAL_RECORD_SIZE as u64 <= self.region.size {
            self.region.read_at(off, &mut hdr_buf)?;
            if hdr_buf.iter().all(|&b| b == 0) {
                break;
            }
            let Some(hdr) = JournalHeader::decode(&hdr_buf) else {
                log::warn!("journal: unrecognized record at offset {}, truncating", off);
                break;
            };
            self.region
                .read_at(off + JOURNAL_HEADER_SIZE as u64, &mut data[..])?;
            off += JOURNAL_RECORD_SIZE as u64;

            match hdr.kind {
                RecordKind::Start => {
                    open = Some(hdr.timestamp);
                    pending.clear();
                }
                RecordKind::Data if open == Some(hdr.timestamp) => {
                    pending.push(DiskBlock::new(hdr.block_no, &data));
                }
                RecordKind::Commit if open == Some(hdr.timestamp) => {
                    log::info!(
                        "journal: replaying transaction @{} ({} blocks)",
                        hdr.timestamp,
                        pending.len()
                    );
                    committed.append(&mut pending);
                    open = None;
                }
                _ => {
                    log::warn!(
                        "journal: timestamp mismatch at offset {}, truncating",
                        off - JOURNAL_RECORD_SIZE as u64
                    );
                    break;
                }
            }
        }

        self.region.zero(self.region.size)?;
        self.region.flush()?;
        Ok(committed)
    }

    /// Raw view of the journal bytes, for consistency checks.
    #[cfg(test)]
    pub(crate) fn read_raw(&self, off: u64, buf: &mut [u8]) -> FsResult<()> {
        self.region.read_at(off, buf)
    }
}
