use parking_lot::Mutex;
use tracing::debug;

use super::ThreatLevel;

/// Composite-score cutoffs between threat levels.
#[derive(Debug, Clone, Copy)]
pub struct ScoringThresholds {
    pub clean: f32,
    pub suspicious: f32,
    pub malicious: f32,
}

impl Default for ScoringThresholds {
    fn default() -> Self {
        Self {
            clean: 0.3,
            suspicious: 0.6,
            malicious: 0.8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub composite_score: f32,
    pub confidence: f32,
    pub threat_level: ThreatLevel,
    pub explanation: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerdictStats {
    pub total_verdicts: u64,
    pub clean: u64,
    pub suspicious: u64,
    pub malicious: u64,
    pub critical: u64,
    pub average_composite_score: f32,
    pub average_confidence: f32,
}

/// Combines per-detector scores into a composite score, a confidence
/// value derived from detector agreement, a threat level, and a
/// human-readable explanation.
pub struct VerdictEngine {
    thresholds: ScoringThresholds,
    stats: Mutex<VerdictStats>,
}

impl VerdictEngine {
    pub fn new() -> Self {
        Self::with_thresholds(ScoringThresholds::default())
    }

    pub fn with_thresholds(thresholds: ScoringThresholds) -> Self {
        Self {
            thresholds,
            stats: Mutex::new(VerdictStats::default()),
        }
    }

    /// `reputation` is the optional external reputation score; when absent
    /// the 3-way weight table applies.
    pub fn calculate_verdict(
        &self,
        yara: f32,
        ml: f32,
        behavioral: f32,
        reputation: Option<f32>,
    ) -> Verdict {
        let composite = composite_score(yara, ml, behavioral, reputation);

        let mut scores = vec![yara, ml, behavioral];
        if let Some(vt) = reputation {
            scores.push(vt);
        }
        let confidence = agreement_confidence(&scores);

        let threat_level = self.determine_threat_level(composite);
        let explanation =
            build_explanation(threat_level, composite, yara, ml, behavioral, reputation);

        let mut stats = self.stats.lock();
        stats.total_verdicts += 1;
        match threat_level {
            ThreatLevel::Clean => stats.clean += 1,
            ThreatLevel::Suspicious => stats.suspicious += 1,
            ThreatLevel::Malicious => stats.malicious += 1,
            ThreatLevel::Critical => stats.critical += 1,
        }
        let n = stats.total_verdicts as f32;
        stats.average_composite_score =
            (stats.average_composite_score * (n - 1.0) + composite) / n;
        stats.average_confidence = (stats.average_confidence * (n - 1.0) + confidence) / n;
        drop(stats);

        debug!(
            "verdict: level {:?}, composite {:.3}, confidence {:.3}",
            threat_level, composite, confidence
        );

        Verdict {
            composite_score: composite,
            confidence,
            threat_level,
            explanation,
        }
    }

    pub fn determine_threat_level(&self, composite: f32) -> ThreatLevel {
        if composite < self.thresholds.clean {
            ThreatLevel::Clean
        } else if composite < self.thresholds.suspicious {
            ThreatLevel::Suspicious
        } else if composite < self.thresholds.malicious {
            ThreatLevel::Malicious
        } else {
            ThreatLevel::Critical
        }
    }

    pub fn update_thresholds(&mut self, thresholds: ScoringThresholds) {
        self.thresholds = thresholds;
    }

    pub fn statistics(&self) -> VerdictStats {
        *self.stats.lock()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = VerdictStats::default();
    }
}

impl Default for VerdictEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Weighted average. With a reputation score: YARA 30%, ML 25%,
/// behavioral 20%, reputation 25%. Without: YARA 40%, ML 35%,
/// behavioral 25%.
pub fn composite_score(yara: f32, ml: f32, behavioral: f32, reputation: Option<f32>) -> f32 {
    let composite = match reputation {
        Some(vt) => yara * 0.30 + ml * 0.25 + behavioral * 0.20 + vt * 0.25,
        None => yara * 0.40 + ml * 0.35 + behavioral * 0.25,
    };
    composite.clamp(0.0, 1.0)
}

/// Confidence from detector agreement: `1 - clamp(2σ, 0, 1)` over the
/// participating scores, boosted to at least 0.9 when three or more
/// detectors agree at the extremes (>0.8 or <0.2).
pub fn agreement_confidence(scores: &[f32]) -> f32 {
    if scores.is_empty() {
        return 0.0;
    }

    let n = scores.len() as f32;
    let mean = scores.iter().sum::<f32>() / n;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
    let stddev = variance.sqrt();

    let mut confidence = 1.0 - (stddev * 2.0).min(1.0);

    let high = scores.iter().filter(|&&s| s > 0.8).count();
    let low = scores.iter().filter(|&&s| s < 0.2).count();
    if high >= 3 || low >= 3 {
        confidence = confidence.max(0.9);
    }

    confidence.clamp(0.0, 1.0)
}

fn build_explanation(
    level: ThreatLevel,
    composite: f32,
    yara: f32,
    ml: f32,
    behavioral: f32,
    reputation: Option<f32>,
) -> String {
    let mut out = String::new();
    out.push_str(match level {
        ThreatLevel::Clean => "File appears clean. ",
        ThreatLevel::Suspicious => "File exhibits suspicious behavior. ",
        ThreatLevel::Malicious => "File is likely malicious. ",
        ThreatLevel::Critical => "CRITICAL THREAT DETECTED. ",
    });

    out.push_str(&format!("Overall threat score: {:.0}%. ", composite * 100.0));

    // Call out the dominant detector when it carries real signal.
    let vt = reputation.unwrap_or(0.0);
    let max_score = yara.max(ml).max(behavioral).max(vt);
    if max_score > 0.5 {
        if max_score == yara {
            out.push_str(&format!(
                "Pattern matching detected malware signatures ({:.0}%). ",
                yara * 100.0
            ));
        } else if max_score == ml {
            out.push_str(&format!(
                "Machine learning model flagged malicious features ({:.0}%). ",
                ml * 100.0
            ));
        } else if max_score == behavioral {
            out.push_str(&format!(
                "Behavioral analysis detected suspicious runtime activity ({:.0}%). ",
                behavioral * 100.0
            ));
        } else {
            out.push_str(&format!(
                "Reputation service flagged this file across multiple engines ({:.0}%). ",
                vt * 100.0
            ));
        }
    }

    let mut agreeing = [yara, ml, behavioral].iter().filter(|&&s| s > 0.5).count();
    if reputation.map_or(false, |v| v > 0.5) {
        agreeing += 1;
    }
    if agreeing >= 2 {
        out.push_str(&format!("{agreeing} detection methods agree. "));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_way_fixture_is_malicious_with_high_confidence() {
        let engine = VerdictEngine::new();
        let verdict = engine.calculate_verdict(0.8, 0.7, 0.6, None);

        // 0.40*0.8 + 0.35*0.7 + 0.25*0.6 = 0.715
        assert!((verdict.composite_score - 0.715).abs() < 1e-4);
        assert_eq!(verdict.threat_level, ThreatLevel::Malicious);
        assert!(verdict.confidence >= 0.8, "confidence was {}", verdict.confidence);
    }

    #[test]
    fn disagreement_lowers_confidence() {
        let engine = VerdictEngine::new();
        let verdict = engine.calculate_verdict(0.9, 0.5, 0.1, None);
        assert!(verdict.confidence < 0.6, "confidence was {}", verdict.confidence);
    }

    #[test]
    fn extreme_agreement_boosts_confidence() {
        let engine = VerdictEngine::new();
        let high = engine.calculate_verdict(0.95, 0.9, 0.85, None);
        assert!(high.confidence >= 0.9);

        let low = engine.calculate_verdict(0.05, 0.1, 0.15, None);
        assert!(low.confidence >= 0.9);
    }

    #[test]
    fn four_way_weights_apply_when_reputation_present() {
        let engine = VerdictEngine::new();
        let verdict = engine.calculate_verdict(0.8, 0.7, 0.6, Some(0.5));
        // 0.30*0.8 + 0.25*0.7 + 0.20*0.6 + 0.25*0.5 = 0.66
        assert!((verdict.composite_score - 0.66).abs() < 1e-4);
        assert_eq!(verdict.threat_level, ThreatLevel::Malicious);
    }

    #[test]
    fn threshold_table() {
        let engine = VerdictEngine::new();
        assert_eq!(engine.determine_threat_level(0.0), ThreatLevel::Clean);
        assert_eq!(engine.determine_threat_level(0.29), ThreatLevel::Clean);
        assert_eq!(engine.determine_threat_level(0.3), ThreatLevel::Suspicious);
        assert_eq!(engine.determine_threat_level(0.59), ThreatLevel::Suspicious);
        assert_eq!(engine.determine_threat_level(0.6), ThreatLevel::Malicious);
        assert_eq!(engine.determine_threat_level(0.79), ThreatLevel::Malicious);
        assert_eq!(engine.determine_threat_level(0.8), ThreatLevel::Critical);
        assert_eq!(engine.determine_threat_level(1.0), ThreatLevel::Critical);
    }

    #[test]
    fn composite_is_clamped() {
        assert_eq!(composite_score(2.0, 2.0, 2.0, Some(2.0)), 1.0);
        assert_eq!(composite_score(0.0, 0.0, 0.0, None), 0.0);
    }

    #[test]
    fn explanation_names_the_dominant_detector() {
        let engine = VerdictEngine::new();
        let verdict = engine.calculate_verdict(0.9, 0.2, 0.1, None);
        assert!(verdict.explanation.contains("Pattern matching"));

        let verdict = engine.calculate_verdict(0.1, 0.2, 0.9, None);
        assert!(verdict.explanation.contains("Behavioral analysis"));
    }

    #[test]
    fn explanation_counts_agreeing_detectors() {
        let engine = VerdictEngine::new();
        let verdict = engine.calculate_verdict(0.8, 0.7, 0.6, None);
        assert!(verdict.explanation.contains("3 detection methods agree"));
    }

    #[test]
    fn statistics_track_levels_and_averages() {
        let engine = VerdictEngine::new();
        engine.calculate_verdict(0.0, 0.0, 0.0, None);
        engine.calculate_verdict(0.9, 0.9, 0.9, None);

        let stats = engine.statistics();
        assert_eq!(stats.total_verdicts, 2);
        assert_eq!(stats.clean, 1);
        assert_eq!(stats.critical, 1);
        assert!(stats.average_composite_score > 0.0);
    }
}
