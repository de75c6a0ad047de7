use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    agreement_confidence, composite_score, BehavioralAnalyzer, HeuristicScorer, SandboxConfig,
    SandboxError, SandboxResult, ThreatLevel, Tier1Scorer, VerdictEngine,
};
use crate::policy::{PolicyStore, SandboxVerdictRow};
use crate::util::{now_ms, sha256_hex};

#[derive(Debug, Clone, Copy, Default)]
pub struct OrchestratorStats {
    pub total_files_analyzed: u64,
    pub cache_hits: u64,
    pub tier1_executions: u64,
    pub tier2_executions: u64,
    pub malicious_detected: u64,
    pub timeouts: u64,
    pub average_tier1_time: Duration,
    pub average_tier2_time: Duration,
    pub average_total_time: Duration,
}

/// End-to-end analysis pipeline: verdict-cache lookup, Tier 1 fast
/// scoring, conditional Tier 2 behavioral analysis, verdict generation,
/// and verdict persistence.
pub struct Orchestrator {
    config: SandboxConfig,
    scorer: Box<dyn Tier1Scorer>,
    analyzer: BehavioralAnalyzer,
    verdict_engine: VerdictEngine,
    store: Option<Arc<PolicyStore>>,
    stats: Mutex<OrchestratorStats>,
}

impl Orchestrator {
    /// Default pipeline with the heuristic Tier 1 scorer. `store` enables
    /// verdict caching; analysis works without it.
    pub fn new(config: SandboxConfig, store: Option<Arc<PolicyStore>>) -> Self {
        Self::with_scorer(config, store, Box::new(HeuristicScorer::new()))
    }

    pub fn with_scorer(
        config: SandboxConfig,
        store: Option<Arc<PolicyStore>>,
        scorer: Box<dyn Tier1Scorer>,
    ) -> Self {
        let analyzer = BehavioralAnalyzer::new(config.clone());
        info!(
            "orchestrator ready (tier1: {}, tier2: {}, scorer: {}, cache: {})",
            config.enable_tier1,
            config.enable_tier2,
            scorer.name(),
            store.is_some(),
        );
        Self {
            config,
            scorer,
            analyzer,
            verdict_engine: VerdictEngine::new(),
            store,
            stats: Mutex::new(OrchestratorStats::default()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub async fn analyze_file(
        &self,
        data: &[u8],
        filename: &str,
    ) -> Result<SandboxResult, SandboxError> {
        let start = Instant::now();
        self.stats.lock().total_files_analyzed += 1;

        let file_hash = sha256_hex(data);

        // Stage 0: content-addressed verdict cache.
        if let Some(store) = &self.store {
            match store.lookup_sandbox_verdict(&file_hash) {
                Ok(Some(row)) => {
                    debug!("verdict cache hit for '{filename}'");
                    self.stats.lock().cache_hits += 1;
                    let mut result = result_from_cached_row(row);
                    result.execution_time = start.elapsed();
                    return Ok(result);
                }
                Ok(None) => {}
                Err(e) => warn!("verdict cache lookup failed: {e}"),
            }
        }

        let mut result = SandboxResult::default();
        let mut tier1_succeeded = false;

        // Stage 1: fast pre-analysis.
        if self.config.enable_tier1 {
            let tier1_start = Instant::now();
            match self.scorer.score(data, filename, self.config.timeout).await {
                Ok(output) => {
                    result.yara_score = output.yara_score;
                    result.ml_score = output.ml_score;
                    result.detected_behaviors = output.detected_behaviors;
                    result.triggered_rules = output.triggered_rules;
                    result.timed_out = output.timed_out;
                    tier1_succeeded = true;

                    let mut stats = self.stats.lock();
                    stats.tier1_executions += 1;
                    if output.timed_out {
                        stats.timeouts += 1;
                    }
                    let n = stats.tier1_executions as u32;
                    stats.average_tier1_time =
                        (stats.average_tier1_time * (n - 1) + tier1_start.elapsed()) / n;
                    drop(stats);

                    if self.tier1_is_conclusive(&result) {
                        debug!("tier 1 verdict conclusive for '{filename}', skipping tier 2");
                        self.finish_verdict(&mut result);
                        self.persist_verdict(&file_hash, &result);
                        self.record_outcome(&result, start);
                        result.execution_time = start.elapsed();
                        return Ok(result);
                    }
                }
                Err(e) => {
                    // Tier 1 failing is not fatal; fall through to tier 2.
                    warn!("tier 1 scoring failed for '{filename}': {e}");
                }
            }
        }

        // Stage 2: deep behavioral analysis, gated on tier 1 suspicion.
        let provisional =
            composite_score(result.yara_score, result.ml_score, 0.0, None);
        let tier2_wanted =
            provisional > 0.3 || !self.config.enable_tier1 || !tier1_succeeded;
        let mut tier2_succeeded = false;

        if self.config.enable_tier2 && tier2_wanted {
            let tier2_start = Instant::now();
            match self.analyzer.analyze(data, filename, self.config.timeout).await {
                Ok(metrics) => {
                    result.behavioral_score = metrics.threat_score;
                    result.file_operations = metrics.file_operations;
                    result.process_operations = metrics.process_operations;
                    result.network_operations = metrics.network_operations;
                    result.registry_operations = metrics.registry_operations;
                    result.memory_operations = metrics.memory_operations;
                    result.timed_out |= metrics.timed_out;
                    result.detected_behaviors.extend(metrics.suspicious_behaviors);
                    tier2_succeeded = true;

                    let mut stats = self.stats.lock();
                    stats.tier2_executions += 1;
                    if metrics.timed_out {
                        stats.timeouts += 1;
                    }
                    let n = stats.tier2_executions as u32;
                    stats.average_tier2_time =
                        (stats.average_tier2_time * (n - 1) + tier2_start.elapsed()) / n;
                }
                Err(e) => {
                    warn!("tier 2 analysis failed for '{filename}': {e}");
                }
            }
        }

        if !tier1_succeeded && self.config.enable_tier2 && tier2_wanted && !tier2_succeeded {
            return Err(SandboxError::AllTiersFailed);
        }

        // Stage 3: final verdict, persistence, bookkeeping.
        self.finish_verdict(&mut result);
        self.persist_verdict(&file_hash, &result);
        self.record_outcome(&result, start);
        result.execution_time = start.elapsed();
        Ok(result)
    }

    /// Tier 1 alone settles the verdict only when both fast detectors
    /// agree at the extremes; middling agreement still goes to tier 2.
    fn tier1_is_conclusive(&self, result: &SandboxResult) -> bool {
        let scores = [result.yara_score, result.ml_score];
        let both_high = scores.iter().all(|&s| s > 0.8);
        let both_low = scores.iter().all(|&s| s < 0.2);
        (both_high || both_low) && agreement_confidence(&scores) > 0.9
    }

    fn finish_verdict(&self, result: &mut SandboxResult) {
        let verdict = self.verdict_engine.calculate_verdict(
            result.yara_score,
            result.ml_score,
            result.behavioral_score,
            None,
        );
        result.composite_score = verdict.composite_score;
        result.confidence = verdict.confidence;
        result.threat_level = verdict.threat_level;
        result.verdict_explanation = verdict.explanation;
    }

    fn persist_verdict(&self, file_hash: &str, result: &SandboxResult) {
        let Some(store) = &self.store else { return };

        let row = SandboxVerdictRow {
            file_hash: file_hash.to_string(),
            threat_level: result.threat_level.as_i32(),
            confidence: (result.confidence * 1000.0) as i32,
            composite_score: (result.composite_score * 1000.0) as i32,
            yara_score: (result.yara_score * 1000.0) as i32,
            ml_score: (result.ml_score * 1000.0) as i32,
            behavioral_score: (result.behavioral_score * 1000.0) as i32,
            verdict_explanation: result.verdict_explanation.clone(),
            triggered_rules: result.triggered_rules.clone(),
            detected_behaviors: result.detected_behaviors.clone(),
            analyzed_at_ms: now_ms(),
            expires_at_ms: 0, // derived by the store from the TTL table
        };

        if let Err(e) = store.store_sandbox_verdict(&row) {
            warn!("failed to cache verdict for {file_hash}: {e}");
        }
    }

    fn record_outcome(&self, result: &SandboxResult, start: Instant) {
        let mut stats = self.stats.lock();
        if result.is_malicious() {
            stats.malicious_detected += 1;
        }
        let n = stats.total_files_analyzed as u32;
        stats.average_total_time = (stats.average_total_time * (n - 1) + start.elapsed()) / n;
    }

    pub fn statistics(&self) -> OrchestratorStats {
        *self.stats.lock()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = OrchestratorStats::default();
    }

    pub fn verdict_statistics(&self) -> super::VerdictStats {
        self.verdict_engine.statistics()
    }
}

fn result_from_cached_row(row: SandboxVerdictRow) -> SandboxResult {
    SandboxResult {
        threat_level: ThreatLevel::from_i32(row.threat_level),
        confidence: row.confidence as f32 / 1000.0,
        composite_score: row.composite_score as f32 / 1000.0,
        yara_score: row.yara_score as f32 / 1000.0,
        ml_score: row.ml_score as f32 / 1000.0,
        behavioral_score: row.behavioral_score as f32 / 1000.0,
        verdict_explanation: row.verdict_explanation,
        triggered_rules: row.triggered_rules,
        detected_behaviors: row.detected_behaviors,
        from_cache: true,
        ..Default::default()
    }
}
