// Append-only log manager.
//
// The log lives in its own backing file (the disk manager's partition 0 is
// reserved for it). Layout: a 16-byte header holding a magic number and the
// mutable master-record slot, followed by self-delimiting frames of
// `[len: u32][crc32: u32][bincode payload]`. A record's LSN is the byte
// offset of its frame; LSN 0 designates the master record and `prev_lsn = 0`
// terminates a chain, since no real record lives at offset 0.
//
// Appends land in an in-memory tail and become durable when `flush_to_lsn`
// writes and fsyncs them, so unflushed records stay fetchable (rollback
// walks records that may never have been flushed) while a crash drops
// exactly the tail. Opening a log truncates any torn frame left by a crash
// mid-flush.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::Lsn;

use super::error::{TransactionError, TransactionResult};
use super::log_record::{LogEntry, LogRecord};

const LOG_MAGIC: &[u8; 8] = b"FDB_WAL1";
const HEADER_SIZE: u64 = 16;
const FRAME_HEADER_SIZE: u64 = 8;
/// Upper bound on a single record's payload; anything larger is corruption.
const MAX_RECORD_SIZE: u32 = 1 << 24;

struct TailRecord {
    lsn: Lsn,
    frame: Vec<u8>,
    record: LogRecord,
}

struct LogInner {
    file: File,
    /// Offset the next appended record will get.
    next_lsn: Lsn,
    /// Everything below this offset has been written and fsynced.
    durable_end: Lsn,
    /// Appended but not yet flushed records, in LSN order.
    tail: Vec<TailRecord>,
}

/// Append-only LSN-assigning write-ahead log.
pub struct LogManager {
    inner: Mutex<LogInner>,
}

impl LogManager {
    /// Opens (or creates) the log at `path`, truncating any torn frame a
    /// crash may have left behind.
    pub fn open(path: &Path) -> TransactionResult<Arc<Self>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(LOG_MAGIC)?;
            file.write_all(&0u64.to_le_bytes())?;
            file.sync_data()?;
            return Ok(Arc::new(Self {
                inner: Mutex::new(LogInner {
                    file,
                    next_lsn: HEADER_SIZE,
                    durable_end: HEADER_SIZE,
                    tail: Vec::new(),
                }),
            }));
        }

        let mut magic = [0u8; 8];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(TransactionError::corrupt_log(0, "bad log file magic"));
        }

        let end = Self::scan_valid_end(&mut file, len)?;
        if end < len {
            debug!(end, len, "truncating torn log tail");
            file.set_len(end)?;
            file.sync_data()?;
        }
        Ok(Arc::new(Self {
            inner: Mutex::new(LogInner {
                file,
                next_lsn: end,
                durable_end: end,
                tail: Vec::new(),
            }),
        }))
    }

    /// Walks frames from the header until the end of the file or the first
    /// damaged frame, returning the offset where valid data stops.
    fn scan_valid_end(file: &mut File, len: u64) -> TransactionResult<u64> {
        let mut offset = HEADER_SIZE;
        while offset + FRAME_HEADER_SIZE <= len {
            file.seek(SeekFrom::Start(offset))?;
            let mut header = [0u8; 8];
            file.read_exact(&mut header)?;
            let payload_len = u32::from_le_bytes(header[..4].try_into().expect("4 bytes"));
            let crc = u32::from_le_bytes(header[4..].try_into().expect("4 bytes"));
            if payload_len == 0 || payload_len > MAX_RECORD_SIZE {
                break;
            }
            let frame_end = offset + FRAME_HEADER_SIZE + payload_len as u64;
            if frame_end > len {
                break;
            }
            let mut payload = vec![0u8; payload_len as usize];
            file.read_exact(&mut payload)?;
            if crc32fast::hash(&payload) != crc {
                break;
            }
            offset = frame_end;
        }
        Ok(offset)
    }

    /// Appends a record and returns its LSN. The record is not durable
    /// until a flush covers it.
    pub fn append(&self, record: LogRecord) -> TransactionResult<Lsn> {
        if matches!(record, LogRecord::Master { .. }) {
            return Err(TransactionError::RecoveryFailed(
                "the master record is rewritten in place, never appended".to_string(),
            ));
        }
        let payload = bincode::serde::encode_to_vec(&record, bincode::config::standard())?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        inner.next_lsn += frame.len() as u64;
        inner.tail.push(TailRecord { lsn, frame, record });
        trace!(lsn, "appended log record");
        Ok(lsn)
    }

    /// Appends and immediately makes the record durable.
    pub fn append_and_flush(&self, record: LogRecord) -> TransactionResult<Lsn> {
        let lsn = self.append(record)?;
        self.flush_to_lsn(lsn)?;
        Ok(lsn)
    }

    /// Makes every record with LSN at most `lsn` durable. Monotonic: a
    /// flush that is already covered is a no-op.
    pub fn flush_to_lsn(&self, lsn: Lsn) -> TransactionResult<()> {
        let mut inner = self.inner.lock();
        let mut wrote = false;
        while let Some(front) = inner.tail.first() {
            if front.lsn > lsn {
                break;
            }
            let rec = inner.tail.remove(0);
            inner.file.seek(SeekFrom::Start(rec.lsn))?;
            inner.file.write_all(&rec.frame)?;
            wrote = true;
        }
        if wrote {
            inner.file.sync_data()?;
            inner.durable_end = inner
                .tail
                .first()
                .map(|r| r.lsn)
                .unwrap_or(inner.next_lsn);
            trace!(durable_end = inner.durable_end, "flushed log");
        }
        Ok(())
    }

    /// Flushes the entire log.
    pub fn flush_all(&self) -> TransactionResult<()> {
        let end = self.inner.lock().next_lsn;
        self.flush_to_lsn(end)
    }

    /// Exclusive upper bound of the durable region: every record with
    /// LSN below this is on disk.
    pub fn flushed_lsn(&self) -> Lsn {
        self.inner.lock().durable_end
    }

    /// The LSN the next appended record will receive.
    pub fn end_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    /// Fetches the record at `lsn`. LSN 0 yields the master record.
    pub fn fetch(&self, lsn: Lsn) -> TransactionResult<LogEntry> {
        let mut inner = self.inner.lock();
        Self::fetch_with_len(&mut inner, lsn).map(|(entry, _)| entry)
    }

    /// Reads the master record's checkpoint pointer.
    pub fn fetch_master(&self) -> TransactionResult<Lsn> {
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(8))?;
        let mut slot = [0u8; 8];
        inner
            .file
            .read_exact(&mut slot)
            .map_err(TransactionError::WalReadError)?;
        Ok(u64::from_le_bytes(slot))
    }

    /// Atomically overwrites the master record slot and syncs.
    pub fn rewrite_master_record(&self, last_checkpoint_lsn: Lsn) -> TransactionResult<()> {
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(8))?;
        inner.file.write_all(&last_checkpoint_lsn.to_le_bytes())?;
        inner.file.sync_data()?;
        debug!(last_checkpoint_lsn, "rewrote master record");
        Ok(())
    }

    /// Forward iterator over records starting at `lsn` (clamped past the
    /// header). Records appended during the scan are included.
    pub fn scan_from(self: &Arc<Self>, lsn: Lsn) -> LogIterator {
        LogIterator {
            log: Arc::clone(self),
            next_lsn: lsn.max(HEADER_SIZE),
            done: false,
        }
    }

    fn fetch_with_len(inner: &mut LogInner, lsn: Lsn) -> TransactionResult<(LogEntry, Lsn)> {
        if lsn == 0 {
            inner.file.seek(SeekFrom::Start(8))?;
            let mut slot = [0u8; 8];
            inner
                .file
                .read_exact(&mut slot)
                .map_err(TransactionError::WalReadError)?;
            let entry = LogEntry {
                lsn: 0,
                record: LogRecord::Master {
                    last_checkpoint_lsn: u64::from_le_bytes(slot),
                },
            };
            return Ok((entry, HEADER_SIZE));
        }
        if lsn >= inner.next_lsn {
            return Err(TransactionError::LogRecordNotFound(lsn));
        }
        if let Some(first_tail) = inner.tail.first().map(|r| r.lsn) {
            if lsn >= first_tail {
                let rec = inner
                    .tail
                    .iter()
                    .find(|r| r.lsn == lsn)
                    .ok_or_else(|| {
                        TransactionError::corrupt_log(lsn, "not a record boundary")
                    })?;
                let entry = LogEntry {
                    lsn,
                    record: rec.record.clone(),
                };
                return Ok((entry, lsn + rec.frame.len() as u64));
            }
        }

        inner.file.seek(SeekFrom::Start(lsn))?;
        let mut header = [0u8; 8];
        inner
            .file
            .read_exact(&mut header)
            .map_err(TransactionError::WalReadError)?;
        let payload_len = u32::from_le_bytes(header[..4].try_into().expect("4 bytes"));
        let crc = u32::from_le_bytes(header[4..].try_into().expect("4 bytes"));
        if payload_len == 0 || payload_len > MAX_RECORD_SIZE {
            return Err(TransactionError::corrupt_log(lsn, "implausible record length"));
        }
        let mut payload = vec![0u8; payload_len as usize];
        inner
            .file
            .read_exact(&mut payload)
            .map_err(TransactionError::WalReadError)?;
        if crc32fast::hash(&payload) != crc {
            return Err(TransactionError::corrupt_log(lsn, "checksum mismatch"));
        }
        let (record, _) =
            bincode::serde::decode_from_slice::<LogRecord, _>(&payload, bincode::config::standard())?;
        Ok((
            LogEntry { lsn, record },
            lsn + FRAME_HEADER_SIZE + payload_len as u64,
        ))
    }
}

/// Forward iterator over log records.
pub struct LogIterator {
    log: Arc<LogManager>,
    next_lsn: Lsn,
    done: bool,
}

impl Iterator for LogIterator {
    type Item = TransactionResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut inner = self.log.inner.lock();
        match LogManager::fetch_with_len(&mut inner, self.next_lsn) {
            Ok((entry, next)) => {
                self.next_lsn = next;
                Some(Ok(entry))
            }
            Err(TransactionError::LogRecordNotFound(_)) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
