pub mod behavioral;
pub mod orchestrator;
pub mod reporter;
pub mod scorer;
pub mod verdict;

pub use behavioral::*;
pub use orchestrator::*;
pub use reporter::*;
pub use scorer::*;
pub use verdict::*;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("tier 1 scorer failed: {0}")]
    Scorer(String),
    #[error("behavioral analysis failed: {0}")]
    Behavioral(String),
    #[error("both sandbox tiers failed")]
    AllTiersFailed,
    #[error("sandbox I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Threat classification, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum ThreatLevel {
    Clean = 0,
    Suspicious = 1,
    Malicious = 2,
    Critical = 3,
}

impl ThreatLevel {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => ThreatLevel::Clean,
            1 => ThreatLevel::Suspicious,
            2 => ThreatLevel::Malicious,
            _ => ThreatLevel::Critical,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn label(self) -> &'static str {
        match self {
            ThreatLevel::Clean => "clean",
            ThreatLevel::Suspicious => "suspicious",
            ThreatLevel::Malicious => "malicious",
            ThreatLevel::Critical => "critical",
        }
    }
}

/// Configuration shared by both sandbox tiers.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Per-tier execution budget.
    pub timeout: Duration,
    /// Tier 1 fast guest-module pre-analysis.
    pub enable_tier1: bool,
    /// Tier 2 deep OS-sandbox analysis.
    pub enable_tier2: bool,
    pub allow_network: bool,
    pub allow_filesystem: bool,
    /// Memory budget for the guest, 128 MiB by default.
    pub max_memory_bytes: u64,
    /// Instruction fuel budget for the guest.
    pub fuel_budget: u64,
    /// Override for the OS sandbox binary; when absent the analyzer falls
    /// back to heuristic (mock) analysis.
    pub sandbox_binary: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            enable_tier1: true,
            enable_tier2: true,
            allow_network: false,
            allow_filesystem: false,
            max_memory_bytes: 128 * 1024 * 1024,
            fuel_budget: 500_000_000,
            sandbox_binary: None,
        }
    }
}

/// Full analysis outcome for one file.
///
/// A timed-out tier is not an error: `timed_out` is set and scoring
/// proceeds with whatever evidence was collected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    pub threat_level: ThreatLevel,
    /// 0.0-1.0 agreement between detectors.
    pub confidence: f32,
    pub detected_behaviors: Vec<String>,
    pub triggered_rules: Vec<String>,
    pub verdict_explanation: String,

    pub yara_score: f32,
    pub ml_score: f32,
    pub behavioral_score: f32,
    pub composite_score: f32,

    pub file_operations: u32,
    pub process_operations: u32,
    pub network_operations: u32,
    pub registry_operations: u32,
    pub memory_operations: u32,

    pub timed_out: bool,
    pub from_cache: bool,
    pub execution_time: Duration,
}

impl Default for SandboxResult {
    fn default() -> Self {
        Self {
            threat_level: ThreatLevel::Clean,
            confidence: 0.0,
            detected_behaviors: Vec::new(),
            triggered_rules: Vec::new(),
            verdict_explanation: String::new(),
            yara_score: 0.0,
            ml_score: 0.0,
            behavioral_score: 0.0,
            composite_score: 0.0,
            file_operations: 0,
            process_operations: 0,
            network_operations: 0,
            registry_operations: 0,
            memory_operations: 0,
            timed_out: false,
            from_cache: false,
            execution_time: Duration::ZERO,
        }
    }
}

impl SandboxResult {
    pub fn is_malicious(&self) -> bool {
        self.threat_level >= ThreatLevel::Malicious
    }

    pub fn is_suspicious(&self) -> bool {
        self.threat_level >= ThreatLevel::Suspicious
    }
}
