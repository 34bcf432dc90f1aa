//! Persistence of accepted envelopes
//!
//! Append-only JSONL ledger, one line per accepted envelope with its receipt
//! metadata. Downstream analytics tail this file; ingestion itself never
//! reads it back except for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use plategate_core::{codec, Envelope};

use crate::error::Result;

/// One accepted envelope with receipt metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEnvelope {
    pub envelope_id: Uuid,
    pub device_id: String,
    pub checkpoint_id: String,
    pub kind: String,
    pub received_at: DateTime<Utc>,
    pub transport: String,
    pub watch_hit: bool,
    pub envelope: serde_json::Value,
}

/// Append-only envelope ledger
pub struct EnvelopeStore {
    base_path: Option<PathBuf>,
}

impl EnvelopeStore {
    /// Open a store rooted at the given directory
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path).await?;
        Ok(Self {
            base_path: Some(base_path),
        })
    }

    /// A store that accepts and discards everything
    pub fn discard() -> Self {
        Self { base_path: None }
    }

    fn ledger_path(&self) -> Option<PathBuf> {
        self.base_path.as_ref().map(|p| p.join("envelopes.jsonl"))
    }

    /// Append an accepted envelope to the ledger
    pub async fn append(
        &self,
        envelope: &Envelope,
        transport: &str,
        watch_hit: bool,
    ) -> Result<()> {
        let Some(path) = self.ledger_path() else {
            return Ok(());
        };

        let stored = StoredEnvelope {
            envelope_id: envelope.id,
            device_id: envelope.device_id.clone(),
            checkpoint_id: envelope.checkpoint_id.clone(),
            kind: envelope.kind.to_string(),
            received_at: Utc::now(),
            transport: transport.to_string(),
            watch_hit,
            envelope: serde_json::from_slice(&codec::encode(envelope))?,
        };

        let line = serde_json::to_string(&stored)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// Read the whole ledger; malformed lines are skipped
    pub async fn read_all(&self) -> Result<Vec<StoredEnvelope>> {
        let Some(path) = self.ledger_path() else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredEnvelope>(line) {
                Ok(entry) => entries.push(entry),
                Err(_) => continue,
            }
        }
        Ok(entries)
    }
}
