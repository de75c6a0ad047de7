use std::collections::HashMap;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{BloomFilter, FilterError};
use crate::util::now_ms;

/// Bloom filter sized for ~100M hashes at a 0.1% false positive rate.
pub const FILTER_SIZE_BITS: u64 = 1_200_000_000;
pub const FILTER_NUM_HASHES: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("threat hash must be 64 lowercase hex characters")]
    InvalidHash,
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("threat list I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ThreatCategory {
    Malware,
    Phishing,
    Exploit,
    Pup,
    Unknown,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ThreatInfo {
    pub sha256_hash: String,
    pub category: ThreatCategory,
    /// 0-10 scale.
    pub severity: u32,
    pub family_name: Option<String>,
    pub first_seen_ms: i64,
    pub last_updated_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FeedStatistics {
    pub total_threats: usize,
    pub malware_count: usize,
    pub phishing_count: usize,
    pub exploit_count: usize,
    pub pup_count: usize,
    pub false_positive_rate: f64,
}

/// Known-threat hash feed backed by a bloom filter prefilter plus a detail
/// cache for hashes we hold metadata on.
///
/// Peer distribution is a collaborator concern: the only contract consumed
/// by the scan path is `probably_malicious`. Transport sync lands threat
/// hashes here via `add_threat_hash` / `import_threat_list`.
pub struct ThreatFeed {
    filter: BloomFilter,
    info_cache: HashMap<String, ThreatInfo>,
}

impl ThreatFeed {
    pub fn new() -> Result<Self, FeedError> {
        Self::with_filter_params(FILTER_SIZE_BITS, FILTER_NUM_HASHES)
    }

    /// Smaller filters are useful for tests and memory-constrained hosts.
    pub fn with_filter_params(size_bits: u64, num_hashes: u32) -> Result<Self, FeedError> {
        Ok(Self {
            filter: BloomFilter::new(size_bits, num_hashes)?,
            info_cache: HashMap::new(),
        })
    }

    pub fn add_threat_hash(
        &mut self,
        sha256_hash: &str,
        category: ThreatCategory,
        severity: u32,
    ) -> Result<(), FeedError> {
        if !is_sha256_hex(sha256_hash) {
            return Err(FeedError::InvalidHash);
        }

        self.filter.add(sha256_hash.as_bytes());

        let now = now_ms();
        self.info_cache
            .entry(sha256_hash.to_string())
            .and_modify(|info| {
                info.category = category;
                info.severity = severity.min(10);
                info.last_updated_ms = now;
            })
            .or_insert_with(|| ThreatInfo {
                sha256_hash: sha256_hash.to_string(),
                category,
                severity: severity.min(10),
                family_name: None,
                first_seen_ms: now,
                last_updated_ms: now,
            });

        Ok(())
    }

    pub fn probably_malicious(&self, sha256_hash: &str) -> bool {
        self.filter.contains(sha256_hash.as_bytes())
    }

    pub fn probably_malicious_content(&self, content: &[u8]) -> bool {
        let hash = hex::encode(Sha256::digest(content));
        self.probably_malicious(&hash)
    }

    pub fn get_threat_info(&self, sha256_hash: &str) -> Option<&ThreatInfo> {
        self.info_cache.get(sha256_hash)
    }

    /// Import a newline-separated hash list. Blank lines and `#` comments
    /// are skipped; malformed hashes are logged and dropped.
    pub fn import_threat_list(&mut self, path: &Path) -> Result<usize, FeedError> {
        let content = std::fs::read_to_string(path)?;
        let mut imported = 0usize;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match self.add_threat_hash(line, ThreatCategory::Unknown, 5) {
                Ok(()) => imported += 1,
                Err(FeedError::InvalidHash) => {
                    warn!("skipping malformed threat hash in {}: {line}", path.display());
                }
                Err(e) => return Err(e),
            }
        }

        info!("imported {imported} threat hashes from {}", path.display());
        Ok(imported)
    }

    pub fn export_threat_list(&self, path: &Path) -> Result<usize, FeedError> {
        let mut out = String::from("# sentinel threat hash list\n");
        for hash in self.info_cache.keys() {
            out.push_str(hash);
            out.push('\n');
        }
        std::fs::write(path, out)?;
        debug!("exported {} threat hashes to {}", self.info_cache.len(), path.display());
        Ok(self.info_cache.len())
    }

    pub fn statistics(&self) -> FeedStatistics {
        let mut stats = FeedStatistics {
            total_threats: self.info_cache.len(),
            false_positive_rate: self.filter.estimated_false_positive_rate(),
            ..Default::default()
        };

        for info in self.info_cache.values() {
            match info.category {
                ThreatCategory::Malware => stats.malware_count += 1,
                ThreatCategory::Phishing => stats.phishing_count += 1,
                ThreatCategory::Exploit => stats.exploit_count += 1,
                ThreatCategory::Pup => stats.pup_count += 1,
                ThreatCategory::Unknown => {}
            }
        }

        stats
    }
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash(n: u8) -> String {
        hex::encode(Sha256::digest([n]))
    }

    #[test]
    fn added_hashes_report_malicious() {
        let mut feed = ThreatFeed::with_filter_params(1 << 16, 5).unwrap();
        let hash = sample_hash(1);
        feed.add_threat_hash(&hash, ThreatCategory::Malware, 8).unwrap();

        assert!(feed.probably_malicious(&hash));
        let info = feed.get_threat_info(&hash).unwrap();
        assert_eq!(info.category, ThreatCategory::Malware);
        assert_eq!(info.severity, 8);
    }

    #[test]
    fn content_lookup_hashes_before_checking() {
        let mut feed = ThreatFeed::with_filter_params(1 << 16, 5).unwrap();
        let content = b"malicious payload bytes";
        let hash = hex::encode(Sha256::digest(content));
        feed.add_threat_hash(&hash, ThreatCategory::Malware, 9).unwrap();

        assert!(feed.probably_malicious_content(content));
        assert!(!feed.probably_malicious_content(b"different bytes"));
    }

    #[test]
    fn rejects_malformed_hashes() {
        let mut feed = ThreatFeed::with_filter_params(1 << 12, 3).unwrap();
        assert!(feed.add_threat_hash("short", ThreatCategory::Unknown, 5).is_err());
        assert!(feed
            .add_threat_hash(&"Z".repeat(64), ThreatCategory::Unknown, 5)
            .is_err());
    }

    #[test]
    fn import_export_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threats.txt");

        let mut feed = ThreatFeed::with_filter_params(1 << 16, 5).unwrap();
        for n in 0..10 {
            feed.add_threat_hash(&sample_hash(n), ThreatCategory::Malware, 7).unwrap();
        }
        assert_eq!(feed.export_threat_list(&path).unwrap(), 10);

        let mut restored = ThreatFeed::with_filter_params(1 << 16, 5).unwrap();
        assert_eq!(restored.import_threat_list(&path).unwrap(), 10);
        for n in 0..10 {
            assert!(restored.probably_malicious(&sample_hash(n)));
        }
    }

    #[test]
    fn statistics_count_categories() {
        let mut feed = ThreatFeed::with_filter_params(1 << 16, 5).unwrap();
        feed.add_threat_hash(&sample_hash(0), ThreatCategory::Malware, 5).unwrap();
        feed.add_threat_hash(&sample_hash(1), ThreatCategory::Phishing, 5).unwrap();
        feed.add_threat_hash(&sample_hash(2), ThreatCategory::Phishing, 5).unwrap();

        let stats = feed.statistics();
        assert_eq!(stats.total_threats, 3);
        assert_eq!(stats.malware_count, 1);
        assert_eq!(stats.phishing_count, 2);
    }
}
