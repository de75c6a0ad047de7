pub mod encryption;
pub mod vault;

pub use encryption::*;
pub use vault::*;

use serde::{Deserialize, Serialize};

use crate::policy::StoreError;
use crate::sandbox::ThreatLevel;
use crate::util::now_ms;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file already quarantined (hash {0})")]
    Duplicate(String),
    #[error("quarantined blob missing on disk: {0}")]
    MissingBlob(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("vault I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata row for one neutralized file. The encrypted blob at
/// `quarantine_path` exists on disk iff this record exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub id: i64,
    pub original_path: String,
    pub quarantine_path: String,
    pub quarantine_reason: String,
    pub threat_score: f64,
    pub threat_level: ThreatLevel,
    pub quarantined_at_ms: i64,
    pub file_size: u64,
    pub sha256_hash: String,
}

impl QuarantineRecord {
    pub fn is_expired(&self, retention: std::time::Duration) -> bool {
        now_ms() > self.quarantined_at_ms + retention.as_millis() as i64
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QuarantineStatistics {
    pub total_quarantined: u64,
    pub total_restored: u64,
    pub total_deleted: u64,
    pub total_expired_cleaned: u64,
    pub current_quarantine_count: u64,
    pub total_quarantine_size_bytes: u64,
}
