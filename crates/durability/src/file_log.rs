//! File-backed edit log
//!
//! Append-only file of CRC-framed records (see [`crate::encoding`]).
//!
//! ## Durability Modes
//!
//! - `Strict` - fsync after every append (DEFAULT, an acknowledged mutation
//!   survives a crash)
//! - `Batched` - fsync every N appends OR T ms (may lose the tail on crash)
//!
//! ## Reading
//!
//! `read_all()` decodes from the beginning of the file. A truncated record at
//! the end of the file is a partial write and is ignored; a checksum failure
//! before the end is reported as corruption. `FileEditLog::recover` also cuts
//! that partial record so appends after a restart start on a record boundary.

use crate::edit_log::EditLog;
use crate::encoding::{decode_record, encode_record};
use crate::record::EditLogRecord;
use loadtxn_core::{EditLogDurability, Result, TxnError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// fsync policy of a [`FileEditLog`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync after every append
    Strict,
    /// fsync every `batch_size` appends or `interval_ms` milliseconds
    Batched {
        /// Maximum time between fsyncs in milliseconds
        interval_ms: u64,
        /// Maximum appends between fsyncs
        batch_size: usize,
    },
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::Strict
    }
}

impl From<EditLogDurability> for DurabilityMode {
    fn from(value: EditLogDurability) -> Self {
        match value {
            EditLogDurability::Strict => DurabilityMode::Strict,
            EditLogDurability::Batched => DurabilityMode::Batched {
                interval_ms: 100,
                batch_size: 1000,
            },
        }
    }
}

struct Writer {
    file: BufWriter<File>,
    offset: u64,
    last_fsync: Instant,
    appends_since_fsync: usize,
}

/// Edit log stored in a single append-only file
pub struct FileEditLog {
    path: PathBuf,
    mode: DurabilityMode,
    writer: Mutex<Writer>,
}

impl FileEditLog {
    /// Open existing log or create a new one
    ///
    /// Creates parent directories if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P, mode: DurabilityMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let offset = file.metadata()?.len();
        debug!(target: "loadtxn::editlog", path = %path.display(), offset, "Opened edit log");

        Ok(Self {
            path,
            mode,
            writer: Mutex::new(Writer {
                file: BufWriter::new(file),
                offset,
                last_fsync: Instant::now(),
                appends_since_fsync: 0,
            }),
        })
    }

    /// Open a log after a restart
    ///
    /// Decodes every complete record and cuts a partial record at the tail,
    /// so new appends start on a record boundary.
    pub fn recover<P: AsRef<Path>>(
        path: P,
        mode: DurabilityMode,
    ) -> Result<(Self, Vec<EditLogRecord>)> {
        let path = path.as_ref();
        let mut records = Vec::new();
        if path.exists() {
            let (decoded, valid_len) = scan_records(path)?;
            records = decoded;
            let file = OpenOptions::new().write(true).open(path)?;
            let len = file.metadata()?.len();
            if len > valid_len {
                warn!(
                    target: "loadtxn::editlog",
                    path = %path.display(),
                    from = len,
                    to = valid_len,
                    "Truncating partial record at end of edit log"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }
        Ok((Self::open(path, mode)?, records))
    }

    /// Flush buffered writes and fsync
    pub fn fsync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        Self::sync_locked(&mut writer)
    }

    fn sync_locked(writer: &mut Writer) -> Result<()> {
        writer
            .file
            .flush()
            .map_err(|e| TxnError::EditLog(format!("Failed to flush: {}", e)))?;
        writer
            .file
            .get_mut()
            .sync_all()
            .map_err(|e| TxnError::EditLog(format!("Failed to fsync: {}", e)))?;
        writer.last_fsync = Instant::now();
        writer.appends_since_fsync = 0;
        Ok(())
    }

    /// Decode every complete record in the file
    pub fn read_all(&self) -> Result<Vec<EditLogRecord>> {
        {
            let mut writer = self.writer.lock();
            writer
                .file
                .flush()
                .map_err(|e| TxnError::EditLog(format!("Failed to flush: {}", e)))?;
        }
        read_records(&self.path)
    }

    /// Bytes written so far (offset of the next append)
    pub fn size(&self) -> u64 {
        self.writer.lock().offset
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// fsync policy
    pub fn durability_mode(&self) -> DurabilityMode {
        self.mode
    }
}

impl EditLog for FileEditLog {
    fn append(&self, record: &EditLogRecord) -> Result<u64> {
        let encoded = encode_record(record)?;
        let mut writer = self.writer.lock();
        let offset = writer.offset;

        writer.file.write_all(&encoded).map_err(|e| {
            TxnError::EditLog(format!("Failed to write record at offset {}: {}", offset, e))
        })?;
        writer.offset += encoded.len() as u64;
        writer.appends_since_fsync += 1;

        match self.mode {
            DurabilityMode::Strict => Self::sync_locked(&mut writer)?,
            DurabilityMode::Batched {
                interval_ms,
                batch_size,
            } => {
                let due = writer.last_fsync.elapsed() >= Duration::from_millis(interval_ms)
                    || writer.appends_since_fsync >= batch_size;
                if due {
                    Self::sync_locked(&mut writer)?;
                }
            }
        }

        Ok(offset)
    }
}

impl Drop for FileEditLog {
    fn drop(&mut self) {
        let _ = self.fsync();
    }
}

/// Decode every complete record of a log file
///
/// A partial record at the tail is ignored (with a warning).
pub fn read_records(path: &Path) -> Result<Vec<EditLogRecord>> {
    scan_records(path).map(|(records, _)| records)
}

/// Decode complete records, returning them with the length of the valid prefix
fn scan_records(path: &Path) -> Result<(Vec<EditLogRecord>, u64)> {
    let buf = std::fs::read(path)?;
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        match decode_record(&buf[pos..], pos as u64) {
            Ok((record, consumed)) => {
                records.push(record);
                pos += consumed;
            }
            Err(TxnError::IncompleteEntry { offset, have, .. }) => {
                warn!(
                    target: "loadtxn::editlog",
                    offset,
                    bytes = have,
                    "Ignoring partial record at end of edit log"
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok((records, pos as u64))
}
