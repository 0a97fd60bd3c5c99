//! Checkpoint images
//!
//! A checkpoint is the full set of retained transaction states plus the id
//! generator's reservation bound. Restart loads the latest checkpoint and then
//! replays the edit log written after it.
//!
//! The image is a single CRC-framed MessagePack payload written to a
//! temporary file and renamed into place, so a crash mid-write leaves the
//! previous checkpoint intact.

use crate::encoding::{decode_frame, encode_frame};
use loadtxn_core::{Result, TransactionState, TxnError, TxnId};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Frame tag of a checkpoint image
const CHECKPOINT_TAG: u8 = 0x40;

/// Serialized coordinator state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxnCheckpoint {
    /// Exclusive bound of ids already reserved by the id generator
    pub next_txn_id: TxnId,
    /// Every retained transaction, running and finished
    pub states: Vec<TransactionState>,
}

impl TxnCheckpoint {
    /// Write the image to `path`, replacing any previous one
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let payload = rmp_serde::to_vec(self)
            .map_err(|e| TxnError::Serialization(format!("Failed to encode checkpoint: {}", e)))?;
        let framed = encode_frame(CHECKPOINT_TAG, &payload);

        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&framed)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;

        info!(
            target: "loadtxn::editlog",
            path = %path.display(),
            txns = self.states.len(),
            next_txn_id = self.next_txn_id,
            "Checkpoint written"
        );
        Ok(())
    }

    /// Read an image written by [`TxnCheckpoint::write_to`]
    ///
    /// Returns `Ok(None)` when no checkpoint exists yet.
    pub fn read_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let buf = std::fs::read(path)?;
        let (tag, payload, _) = decode_frame(&buf, 0).map_err(|e| match e {
            TxnError::IncompleteEntry { .. } => {
                TxnError::Corruption(format!("truncated checkpoint {}", path.display()))
            }
            other => other,
        })?;
        if tag != CHECKPOINT_TAG {
            return Err(TxnError::Corruption(format!(
                "{} is not a checkpoint (tag {})",
                path.display(),
                tag
            )));
        }
        let checkpoint = rmp_serde::from_slice(payload)
            .map_err(|e| TxnError::Corruption(format!("Failed to decode checkpoint: {}", e)))?;
        Ok(Some(checkpoint))
    }
}
