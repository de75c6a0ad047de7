use std::fmt::Write;

use parking_lot::Mutex;

use super::{SandboxResult, ThreatLevel};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReporterStats {
    pub reports_generated: u64,
    pub clean_reports: u64,
    pub suspicious_reports: u64,
    pub malicious_reports: u64,
    pub critical_reports: u64,
}

/// Pure formatter turning a [`SandboxResult`] into user-facing text for
/// the UI: a full multi-section report and a one-line summary.
pub struct ThreatReporter {
    stats: Mutex<ReporterStats>,
}

impl ThreatReporter {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(ReporterStats::default()),
        }
    }

    pub fn severity_emoji(level: ThreatLevel) -> &'static str {
        match level {
            ThreatLevel::Clean => "\u{1F7E2}",      // green circle
            ThreatLevel::Suspicious => "\u{1F7E1}", // yellow circle
            ThreatLevel::Malicious => "\u{1F7E0}",  // orange circle
            ThreatLevel::Critical => "\u{1F534}",   // red circle
        }
    }

    pub fn severity_label(level: ThreatLevel) -> &'static str {
        match level {
            ThreatLevel::Clean => "LOW",
            ThreatLevel::Suspicious => "MEDIUM",
            ThreatLevel::Malicious => "HIGH",
            ThreatLevel::Critical => "CRITICAL",
        }
    }

    pub fn confidence_label(confidence: f32) -> &'static str {
        if confidence >= 0.8 {
            "High"
        } else if confidence >= 0.5 {
            "Medium"
        } else {
            "Low"
        }
    }

    pub fn format_full_report(&self, result: &SandboxResult, filename: &str) -> String {
        {
            let mut stats = self.stats.lock();
            stats.reports_generated += 1;
            match result.threat_level {
                ThreatLevel::Clean => stats.clean_reports += 1,
                ThreatLevel::Suspicious => stats.suspicious_reports += 1,
                ThreatLevel::Malicious => stats.malicious_reports += 1,
                ThreatLevel::Critical => stats.critical_reports += 1,
            }
        }

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {} RISK: {}",
            Self::severity_emoji(result.threat_level),
            Self::severity_label(result.threat_level),
            filename
        );
        let _ = writeln!(
            out,
            "Threat level: {} | Confidence: {} ({:.0}%) | Score: {:.0}%",
            result.threat_level.label(),
            Self::confidence_label(result.confidence),
            result.confidence * 100.0,
            result.composite_score * 100.0
        );
        out.push('\n');

        out.push_str(&self.format_detection_summary(result));
        out.push('\n');
        out.push_str(&self.format_threat_behaviors(result));
        out.push('\n');
        out.push_str(&self.format_recommendation(result));
        out.push('\n');
        out.push_str(&self.format_technical_details(result));
        out
    }

    pub fn format_summary_line(&self, result: &SandboxResult, filename: &str) -> String {
        format!(
            "{} {}: {} (score {:.0}%, confidence {})",
            Self::severity_emoji(result.threat_level),
            filename,
            result.threat_level.label(),
            result.composite_score * 100.0,
            Self::confidence_label(result.confidence)
        )
    }

    fn format_detection_summary(&self, result: &SandboxResult) -> String {
        let mut out = String::from("## Detection Summary\n");

        if result.yara_score > 0.5 {
            let rule = result
                .triggered_rules
                .first()
                .map(|r| r.as_str())
                .unwrap_or("malicious");
            let _ = writeln!(out, "\u{2713} YARA: Detected {rule} signature");
        } else {
            out.push_str("\u{2717} YARA: No signature match\n");
        }

        if result.ml_score > 0.5 {
            let _ = writeln!(
                out,
                "\u{2713} Machine Learning: {}% probability of malware",
                (result.ml_score * 100.0) as i32
            );
        } else {
            out.push_str("\u{2717} Machine Learning: Low threat probability\n");
        }

        if result.behavioral_score > 0.5 {
            let behavior = result
                .detected_behaviors
                .first()
                .map(|b| b.as_str())
                .unwrap_or("Suspicious patterns");
            let _ = writeln!(out, "\u{2713} Behavioral Analysis: {behavior} detected");
        } else {
            out.push_str("\u{2717} Behavioral Analysis: No suspicious patterns\n");
        }

        out
    }

    fn format_threat_behaviors(&self, result: &SandboxResult) -> String {
        if result.detected_behaviors.is_empty()
            && result.file_operations == 0
            && result.network_operations == 0
        {
            return "No suspicious behaviors detected.\n".to_string();
        }

        let mut out = String::from("## Threat Behaviors\n");
        for behavior in &result.detected_behaviors {
            let _ = writeln!(out, "\u{2022} {behavior}");
        }

        if result.file_operations > 50 {
            let _ = writeln!(
                out,
                "\u{2022} File Operations: {} file system operations detected",
                result.file_operations
            );
        }
        if result.network_operations > 0 {
            let _ = writeln!(
                out,
                "\u{2022} Network: {} network operations attempted",
                result.network_operations
            );
        }
        if result.process_operations > 0 {
            let _ = writeln!(
                out,
                "\u{2022} Process Control: {} process operations detected",
                result.process_operations
            );
        }
        if result.memory_operations > 20 {
            let _ = writeln!(
                out,
                "\u{2022} Memory Operations: {} memory allocations/modifications",
                result.memory_operations
            );
        }

        out
    }

    fn format_recommendation(&self, result: &SandboxResult) -> String {
        let action = match result.threat_level {
            ThreatLevel::Clean => "\u{2705} File appears safe. Proceed with caution.",
            ThreatLevel::Suspicious => {
                "\u{26A0}\u{FE0F} File exhibits suspicious patterns. Review carefully before opening."
            }
            ThreatLevel::Malicious => "\u{26D4} This file has been QUARANTINED and will not execute.",
            ThreatLevel::Critical => {
                "\u{1F6A8} SEVERE THREAT. File blocked and quarantined. Report to security team."
            }
        };

        let reason = if result.threat_level >= ThreatLevel::Malicious {
            if result.yara_score > 0.5 && result.ml_score > 0.5 {
                "Multiple independent detection methods confirm malicious intent"
            } else if result.yara_score > 0.7 {
                "Known malware signature detected"
            } else if result.ml_score > 0.7 {
                "Machine learning model indicates high probability of malware"
            } else if result.behavioral_score > 0.7 {
                "Behavioral analysis detected malicious patterns"
            } else {
                "Composite threat score indicates malicious behavior"
            }
        } else if result.threat_level == ThreatLevel::Suspicious {
            if result.behavioral_score > 0.5 {
                "Behavioral analysis detected suspicious patterns"
            } else if result.ml_score > 0.4 {
                "File characteristics match known suspicious patterns"
            } else {
                "Some indicators suggest potential risk"
            }
        } else {
            "No significant threat indicators detected"
        };

        format!(
            "## Recommendation\n{action}\nReason: {reason}\nLearn more: review the technical details below before overriding this decision.\n"
        )
    }

    fn format_technical_details(&self, result: &SandboxResult) -> String {
        let mut out = String::from("## Technical Details\n");
        let _ = writeln!(
            out,
            "Weighted scores: YARA {:.2}, ML {:.2}, Behavioral {:.2} -> Composite {:.2}",
            result.yara_score, result.ml_score, result.behavioral_score, result.composite_score
        );
        if !result.triggered_rules.is_empty() {
            let _ = writeln!(out, "Triggered rules: {}", result.triggered_rules.join(", "));
        }
        let _ = writeln!(out, "Analysis time: {} ms", result.execution_time.as_millis());
        if result.timed_out {
            out.push_str("Note: analysis hit its time budget; results are partial.\n");
        }
        if result.from_cache {
            out.push_str("Served from verdict cache.\n");
        }
        out
    }

    pub fn statistics(&self) -> ReporterStats {
        *self.stats.lock()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = ReporterStats::default();
    }
}

impl Default for ThreatReporter {
    fn default() -> Self {
        Self::new()
    }
}
