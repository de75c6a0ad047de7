use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    decrypt_file, encrypt_data, generate_key, CryptoError, QuarantineRecord, QuarantineStatistics,
    VaultError, KEY_SIZE,
};
use crate::policy::{PolicyStore, StoreError};
use crate::sandbox::SandboxResult;
use crate::util::{now_ms, now_secs, sha256_hex};

const KEY_FILE_NAME: &str = "encryption.key";
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Encrypted custodianship of neutralized files.
///
/// The vault owns the key material and the vault directory; record
/// metadata lives in the policy store. Directory and key permissions are
/// set at creation and never widened afterwards.
pub struct QuarantineVault {
    dir: PathBuf,
    store: Arc<PolicyStore>,
    key: [u8; KEY_SIZE],
    stats: Mutex<QuarantineStatistics>,
}

impl QuarantineVault {
    pub fn open(dir: &Path, store: Arc<PolicyStore>) -> Result<Self, VaultError> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let key = Self::load_or_generate_key(dir)?;

        let vault = Self {
            dir: dir.to_path_buf(),
            store,
            key,
            stats: Mutex::new(QuarantineStatistics::default()),
        };

        // Rebuild the running counters from existing records.
        let records = vault.store.list_quarantine_records(None)?;
        {
            let mut stats = vault.stats.lock();
            stats.current_quarantine_count = records.len() as u64;
            stats.total_quarantine_size_bytes = records.iter().map(|r| r.file_size).sum();
        }

        info!("quarantine vault opened at {} ({} records)", dir.display(), records.len());
        Ok(vault)
    }

    fn load_or_generate_key(dir: &Path) -> Result<[u8; KEY_SIZE], VaultError> {
        let key_path = dir.join(KEY_FILE_NAME);

        if key_path.exists() {
            let bytes = std::fs::read(&key_path)?;
            let key: [u8; KEY_SIZE] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| VaultError::Crypto(CryptoError::InvalidKeySize))?;
            return Ok(key);
        }

        let key = generate_key();
        std::fs::write(&key_path, key)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!("generated new quarantine encryption key");
        Ok(key)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Neutralize a file: hash it, reject duplicates, encrypt it into the
    /// vault, delete the original, and persist the record.
    pub fn quarantine_file(
        &self,
        file_path: &Path,
        analysis: &SandboxResult,
    ) -> Result<QuarantineRecord, VaultError> {
        if !file_path.exists() {
            return Err(VaultError::NotFound(file_path.display().to_string()));
        }

        let contents = std::fs::read(file_path)?;
        let sha256_hash = sha256_hex(&contents);

        if self.store.quarantine_record_by_hash(&sha256_hash)?.is_some() {
            return Err(VaultError::Duplicate(sha256_hash));
        }

        let file_size = contents.len() as u64;
        let quarantine_path = self.dir.join(quarantine_filename(file_path, &sha256_hash));

        let blob = encrypt_data(&contents, &self.key)?;
        std::fs::write(&quarantine_path, blob)?;
        drop(contents);

        // Original only goes away once the encrypted copy is durable.
        std::fs::remove_file(file_path)?;

        let quarantine_reason = format!(
            "Threat Level: {} | Confidence: {:.1}% | Behaviors: {} | Rules: {}",
            analysis.threat_level.as_i32(),
            analysis.confidence * 100.0,
            analysis.detected_behaviors.len(),
            analysis.triggered_rules.len(),
        );

        let mut record = QuarantineRecord {
            id: -1,
            original_path: file_path.display().to_string(),
            quarantine_path: quarantine_path.display().to_string(),
            quarantine_reason,
            threat_score: analysis.composite_score as f64,
            threat_level: analysis.threat_level,
            quarantined_at_ms: now_ms(),
            file_size,
            sha256_hash,
        };

        record.id = match self.store.insert_quarantine_record(&record) {
            Ok(id) => id,
            Err(e) => {
                // Roll the blob back so disk state matches the database.
                let _ = std::fs::remove_file(&quarantine_path);
                return Err(match e {
                    StoreError::Conflict(_) => VaultError::Duplicate(record.sha256_hash),
                    other => VaultError::Store(other),
                });
            }
        };

        {
            let mut stats = self.stats.lock();
            stats.total_quarantined += 1;
            stats.current_quarantine_count += 1;
            stats.total_quarantine_size_bytes += file_size;
        }

        info!(
            "quarantined {} -> {} (id {})",
            record.original_path, record.quarantine_path, record.id
        );
        Ok(record)
    }

    /// Decrypt back to `target_path` and forget the record (false-positive
    /// rollback path).
    pub fn restore_file(&self, quarantine_id: i64, target_path: &Path) -> Result<(), VaultError> {
        let record = self.get_quarantine_record(quarantine_id)?;
        let blob_path = Path::new(&record.quarantine_path);

        if !blob_path.exists() {
            return Err(VaultError::MissingBlob(record.quarantine_path.clone()));
        }

        decrypt_file(blob_path, target_path, &self.key)?;
        std::fs::remove_file(blob_path)?;
        self.store.delete_quarantine_record(quarantine_id)?;

        {
            let mut stats = self.stats.lock();
            stats.total_restored += 1;
            stats.current_quarantine_count = stats.current_quarantine_count.saturating_sub(1);
            stats.total_quarantine_size_bytes =
                stats.total_quarantine_size_bytes.saturating_sub(record.file_size);
        }

        info!("restored quarantined file {} -> {}", quarantine_id, target_path.display());
        Ok(())
    }

    /// Erase the blob and the record permanently.
    pub fn delete_file(&self, quarantine_id: i64) -> Result<(), VaultError> {
        let record = self.get_quarantine_record(quarantine_id)?;

        let blob_path = Path::new(&record.quarantine_path);
        if blob_path.exists() {
            std::fs::remove_file(blob_path)?;
        }
        self.store.delete_quarantine_record(quarantine_id)?;

        {
            let mut stats = self.stats.lock();
            stats.total_deleted += 1;
            stats.current_quarantine_count = stats.current_quarantine_count.saturating_sub(1);
            stats.total_quarantine_size_bytes =
                stats.total_quarantine_size_bytes.saturating_sub(record.file_size);
        }

        info!("permanently deleted quarantined file (id {quarantine_id})");
        Ok(())
    }

    pub fn get_quarantine_record(&self, quarantine_id: i64) -> Result<QuarantineRecord, VaultError> {
        self.store.get_quarantine_record(quarantine_id).map_err(|e| match e {
            StoreError::NotFound(msg) => VaultError::NotFound(msg),
            other => VaultError::Store(other),
        })
    }

    pub fn list_quarantined_files(
        &self,
        threat_level_filter: Option<crate::sandbox::ThreatLevel>,
    ) -> Result<Vec<QuarantineRecord>, VaultError> {
        Ok(self
            .store
            .list_quarantine_records(threat_level_filter.map(|l| l.as_i32()))?)
    }

    pub fn is_file_quarantined(&self, sha256_hash: &str) -> Result<bool, VaultError> {
        Ok(self.store.quarantine_record_by_hash(sha256_hash)?.is_some())
    }

    /// Delete records older than the retention window. Returns how many
    /// were cleaned; individual failures are logged and skipped.
    pub fn cleanup_expired(&self, retention: Duration) -> Result<u64, VaultError> {
        let records = self.list_quarantined_files(None)?;
        let mut cleaned = 0u64;

        for record in records {
            if record.is_expired(retention) {
                match self.delete_file(record.id) {
                    Ok(()) => cleaned += 1,
                    Err(e) => warn!("failed to delete expired quarantine record {}: {e}", record.id),
                }
            }
        }

        if cleaned > 0 {
            self.stats.lock().total_expired_cleaned += cleaned;
            debug!("cleaned up {cleaned} expired quarantine records");
        }
        Ok(cleaned)
    }

    pub fn statistics(&self) -> QuarantineStatistics {
        *self.stats.lock()
    }
}

/// `<epoch-seconds>_<hash-prefix>_<sanitized-basename>.quar`
fn quarantine_filename(original: &Path, sha256_hash: &str) -> String {
    let basename = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());

    let sanitized: String = basename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();

    format!("{}_{}_{}.quar", now_secs(), &sha256_hash[..8], sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_has_no_spaces_and_quar_suffix() {
        let name = quarantine_filename(Path::new("/tmp/evil file$.exe"), &"ab".repeat(32));
        assert!(name.ends_with(".quar"));
        assert!(!name.contains(' '));
        assert!(name.contains("abababab"));
        assert!(name.contains("evil_file_.exe"));
    }

    #[test]
    fn filename_sanitizes_path_separators() {
        let name = quarantine_filename(Path::new("payload.bin"), &"cd".repeat(32));
        assert!(!name.contains('/'));
        assert!(name.contains("payload.bin"));
    }
}
