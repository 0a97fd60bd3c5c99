//! Durability layer for loadtxn
//!
//! This crate handles everything that leaves the process:
//!
//! - Edit log records: one record per coordinator mutation
//! - Record framing with CRC32 checksums
//! - Edit log implementations: file-backed (strict/batched fsync), in-memory
//! - Fencing: refuse further appends after a replication failure
//! - Checkpoint images for restart

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod edit_log;
pub mod encoding;
pub mod file_log;
pub mod record;

pub use checkpoint::TxnCheckpoint;
pub use edit_log::{EditLog, FencedEditLog, MemoryEditLog};
pub use encoding::{decode_record, encode_record};
pub use file_log::{read_records, DurabilityMode, FileEditLog};
pub use record::EditLogRecord;
