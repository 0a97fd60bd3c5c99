//! Edit log record encoding and decoding
//!
//! Records are framed with a CRC32 checksum for corruption detection.
//!
//! ## Frame Format
//!
//! ```text
//! [length: u32][type: u8][payload: bytes][crc32: u32]
//! ```
//!
//! - **length**: Total size of type + payload + crc (NOT including length itself)
//! - **type**: Record type tag (see [`crate::record::op`])
//! - **payload**: rmp-serde (MessagePack) serialized record
//! - **crc32**: CRC32 checksum over \[type\]\[payload\]

use crate::record::EditLogRecord;
use crc32fast::Hasher;
use loadtxn_core::{Result, TxnError};

/// Minimum valid frame body: type(1) + crc(4)
const MIN_FRAME_LEN: usize = 5;

/// Frame an already serialized payload
pub fn encode_frame(type_tag: u8, payload: &[u8]) -> Vec<u8> {
    let total_len = 1 + payload.len() + 4;
    let mut buf = Vec::with_capacity(4 + total_len);
    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.push(type_tag);
    buf.extend_from_slice(payload);

    let mut hasher = Hasher::new();
    hasher.update(&[type_tag]);
    hasher.update(payload);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf
}

/// Unframe one entry from the start of `buf`
///
/// Returns the type tag, the payload and the number of bytes consumed.
///
/// # Errors
///
/// - `IncompleteEntry` when the buffer ends before the frame does (partial
///   write at the tail of a file)
/// - `Corruption` on an impossible length or a CRC mismatch
pub fn decode_frame(buf: &[u8], offset: u64) -> Result<(u8, &[u8], usize)> {
    if buf.len() < 4 {
        return Err(TxnError::IncompleteEntry {
            offset,
            have: buf.len(),
            needed: 4,
        });
    }
    let total_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if total_len < MIN_FRAME_LEN {
        return Err(TxnError::Corruption(format!(
            "offset {}: Invalid entry length {} (minimum is {} bytes)",
            offset, total_len, MIN_FRAME_LEN
        )));
    }
    if buf.len() < 4 + total_len {
        return Err(TxnError::IncompleteEntry {
            offset,
            have: buf.len(),
            needed: 4 + total_len,
        });
    }

    let type_tag = buf[4];
    let payload = &buf[5..4 + total_len - 4];
    let crc_start = 4 + total_len - 4;
    let expected_crc = u32::from_le_bytes([
        buf[crc_start],
        buf[crc_start + 1],
        buf[crc_start + 2],
        buf[crc_start + 3],
    ]);

    let mut hasher = Hasher::new();
    hasher.update(&[type_tag]);
    hasher.update(payload);
    let actual_crc = hasher.finalize();

    if actual_crc != expected_crc {
        return Err(TxnError::Corruption(format!(
            "offset {}: CRC mismatch: expected {:08x}, got {:08x}",
            offset, expected_crc, actual_crc
        )));
    }

    Ok((type_tag, payload, 4 + total_len))
}

/// Encode a record into a frame
pub fn encode_record(record: &EditLogRecord) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(record)
        .map_err(|e| TxnError::Serialization(format!("Failed to encode record: {}", e)))?;
    Ok(encode_frame(record.op_code(), &payload))
}

/// Decode one record from the start of `buf`
///
/// Returns the record and the number of bytes consumed.
pub fn decode_record(buf: &[u8], offset: u64) -> Result<(EditLogRecord, usize)> {
    let (type_tag, payload, consumed) = decode_frame(buf, offset)?;

    let record: EditLogRecord = rmp_serde::from_slice(payload).map_err(|e| {
        TxnError::Corruption(format!("offset {}: Deserialization failed: {}", offset, e))
    })?;

    if record.op_code() != type_tag {
        return Err(TxnError::Corruption(format!(
            "offset {}: Type tag mismatch: expected {}, got {}",
            offset,
            record.op_code(),
            type_tag
        )));
    }

    Ok((record, consumed))
}
