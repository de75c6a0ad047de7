use std::collections::HashMap;

use pretty_assertions::assert_eq;
use sentinel::policy::{
    self, CredentialRelationship, NetworkBehaviorPolicy, Policy, PolicyAction, PolicyMatchType,
    PolicyStore, SandboxVerdictRow, StoreError, ThreatMetadata,
};
use sentinel::util::now_ms;

fn open_store() -> (tempfile::TempDir, PolicyStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = PolicyStore::open(dir.path()).unwrap();
    (dir, store)
}

fn eicar_hash() -> String {
    "ab".repeat(32)
}

#[test]
fn create_then_get_preserves_all_matcher_fields() {
    let (_dir, store) = open_store();

    let mut policy = Policy::new("Download-Guard", PolicyAction::Quarantine);
    policy.url_pattern = Some("https://downloads.example.com/%.exe".to_string());
    policy.file_hash = Some(eicar_hash());
    policy.mime_type = Some("application/x-msdownload".to_string());
    policy.match_type = PolicyMatchType::DownloadOriginFileType;
    policy.enforcement_action = "notify".to_string();

    let id = store.create_policy(&policy).unwrap();
    let fetched = store.get_policy(id).unwrap();

    assert_eq!(fetched.rule_name, policy.rule_name);
    assert_eq!(fetched.url_pattern, policy.url_pattern);
    assert_eq!(fetched.file_hash, policy.file_hash);
    assert_eq!(fetched.mime_type, policy.mime_type);
    assert_eq!(fetched.action, policy.action);
    assert_eq!(fetched.match_type, policy.match_type);
    assert_eq!(fetched.hit_count, 0);
    assert!(fetched.last_hit_ms.is_none());
}

#[test]
fn update_and_delete_round_trip() {
    let (_dir, store) = open_store();

    let policy = Policy::new("Mutable", PolicyAction::Allow);
    let id = store.create_policy(&policy).unwrap();

    let mut updated = store.get_policy(id).unwrap();
    updated.action = PolicyAction::Block;
    updated.url_pattern = Some("https://bad.example.org/%".to_string());
    store.update_policy(id, &updated).unwrap();

    let fetched = store.get_policy(id).unwrap();
    assert_eq!(fetched.action, PolicyAction::Block);
    assert_eq!(fetched.url_pattern.as_deref(), Some("https://bad.example.org/%"));

    store.delete_policy(id).unwrap();
    assert!(matches!(store.get_policy(id), Err(StoreError::NotFound(_))));
    assert!(matches!(store.delete_policy(id), Err(StoreError::NotFound(_))));
}

#[test]
fn eicar_scenario_matches_by_hash_and_counts_hits() {
    let (_dir, store) = open_store();

    let mut policy = Policy::new("EICAR", PolicyAction::Block);
    policy.file_hash = Some(eicar_hash());
    let id = store.create_policy(&policy).unwrap();

    let threat = ThreatMetadata {
        url: "http://x/y".to_string(),
        file_hash: eicar_hash(),
        ..Default::default()
    };

    let matched = store.match_policy(&threat).unwrap().expect("policy must match");
    assert_eq!(matched.id, id);

    let fetched = store.get_policy(id).unwrap();
    assert_eq!(fetched.hit_count, 1);
    assert!(fetched.last_hit_ms.is_some());
}

#[test]
fn hash_match_beats_url_pattern_match() {
    let (_dir, store) = open_store();

    let mut url_policy = Policy::new("by-url", PolicyAction::Allow);
    url_policy.url_pattern = Some("https://example.com/%".to_string());
    let url_id = store.create_policy(&url_policy).unwrap();

    let mut hash_policy = Policy::new("by-hash", PolicyAction::Block);
    hash_policy.file_hash = Some(eicar_hash());
    let hash_id = store.create_policy(&hash_policy).unwrap();

    // Both policies apply to this threat; the hash stage wins.
    let threat = ThreatMetadata {
        url: "https://example.com/evil.exe".to_string(),
        file_hash: eicar_hash(),
        ..Default::default()
    };
    let matched = store.match_policy(&threat).unwrap().unwrap();
    assert_eq!(matched.id, hash_id);
    assert_ne!(matched.id, url_id);

    // Without the hash, the URL stage applies.
    let threat = ThreatMetadata {
        url: "https://example.com/other.exe".to_string(),
        ..Default::default()
    };
    let matched = store.match_policy(&threat).unwrap().unwrap();
    assert_eq!(matched.id, url_id);
}

#[test]
fn rule_name_stage_requires_bare_policy() {
    let (_dir, store) = open_store();

    // A policy with a hash must not be matched via the rule-name stage.
    let mut hashed = Policy::new("shared-name", PolicyAction::Block);
    hashed.file_hash = Some("cd".repeat(32));
    store.create_policy(&hashed).unwrap();

    let threat = ThreatMetadata {
        rule_name: "shared-name".to_string(),
        ..Default::default()
    };
    assert!(store.match_policy(&threat).unwrap().is_none());

    let bare = Policy::new("shared-name", PolicyAction::WarnUser);
    let bare_id = store.create_policy(&bare).unwrap();
    let matched = store.match_policy(&threat).unwrap().unwrap();
    assert_eq!(matched.id, bare_id);
}

#[test]
fn expired_policies_never_match_and_are_cleaned() {
    let (_dir, store) = open_store();

    let mut expired = Policy::new("expired", PolicyAction::Block);
    expired.file_hash = Some(eicar_hash());
    expired.expires_at_ms = Some(now_ms() - 1000);
    store.create_policy(&expired).unwrap();

    let threat = ThreatMetadata {
        file_hash: eicar_hash(),
        ..Default::default()
    };
    assert!(store.match_policy(&threat).unwrap().is_none());

    assert_eq!(store.cleanup_expired_policies().unwrap(), 1);
    assert_eq!(store.policy_count().unwrap(), 0);
}

#[test]
fn injection_shapes_are_rejected_and_db_stays_intact() {
    let (_dir, store) = open_store();

    for pattern in [
        "'; DROP TABLE policies; --",
        "%' OR '1'='1",
        "a\"; DELETE FROM policies; --",
    ] {
        let mut policy = Policy::new("Injector", PolicyAction::Block);
        policy.url_pattern = Some(pattern.to_string());
        let err = store.create_policy(&policy).unwrap_err();
        assert!(
            matches!(err, StoreError::InvalidInput(_)),
            "pattern '{pattern}' produced {err:?}"
        );
    }

    // Oversized and empty names die at validation too.
    let mut oversized = Policy::new("x".repeat(300), PolicyAction::Block);
    assert!(matches!(store.create_policy(&oversized), Err(StoreError::InvalidInput(_))));
    oversized.rule_name = String::new();
    assert!(matches!(store.create_policy(&oversized), Err(StoreError::InvalidInput(_))));

    // The table is intact: a valid create still succeeds.
    let ok = Policy::new("Valid-After-Attack", PolicyAction::Allow);
    let id = store.create_policy(&ok).unwrap();
    assert_eq!(store.get_policy(id).unwrap().rule_name, "Valid-After-Attack");
}

#[test]
fn update_with_injection_pattern_keeps_old_row() {
    let (_dir, store) = open_store();

    let mut policy = Policy::new("Update-Test", PolicyAction::Block);
    policy.url_pattern = Some("https://test.com/%".to_string());
    let id = store.create_policy(&policy).unwrap();

    let mut hostile = store.get_policy(id).unwrap();
    hostile.url_pattern = Some("'; DROP TABLE policies--".to_string());
    assert!(store.update_policy(id, &hostile).is_err());

    let fetched = store.get_policy(id).unwrap();
    assert_eq!(fetched.url_pattern.as_deref(), Some("https://test.com/%"));
}

#[test]
fn wildcard_pattern_matches_via_like() {
    let (_dir, store) = open_store();

    let mut policy = Policy::new("Wildcard", PolicyAction::Block);
    policy.url_pattern = Some("https://example.com/file%.exe".to_string());
    let id = store.create_policy(&policy).unwrap();

    let hit = ThreatMetadata {
        url: "https://example.com/file-2024.exe".to_string(),
        ..Default::default()
    };
    assert_eq!(store.match_policy(&hit).unwrap().unwrap().id, id);

    let miss = ThreatMetadata {
        url: "https://example.com/file.zip".to_string(),
        ..Default::default()
    };
    assert!(store.match_policy(&miss).unwrap().is_none());
}

#[test]
fn threat_history_append_and_query() {
    let (_dir, store) = open_store();

    let threat = ThreatMetadata {
        url: "https://evil.example.net/a.exe".to_string(),
        filename: "a.exe".to_string(),
        file_hash: eicar_hash(),
        mime_type: "application/octet-stream".to_string(),
        file_size: 1234,
        rule_name: "EICAR".to_string(),
        severity: "malicious".to_string(),
    };

    store.record_threat(&threat, "block", None, "{}").unwrap();
    store.record_threat(&threat, "quarantine", Some(1), "{}").unwrap();

    let all = store.get_threat_history(None).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].file_hash, eicar_hash());

    let by_rule = store.get_threats_by_rule("EICAR").unwrap();
    assert_eq!(by_rule.len(), 2);
    assert_eq!(store.threat_count().unwrap(), 2);

    let future_only = store.get_threat_history(Some(now_ms() + 60_000)).unwrap();
    assert!(future_only.is_empty());

    // Nothing is old enough to prune yet.
    assert_eq!(store.cleanup_old_threats(30).unwrap(), 0);
}

#[test]
fn verdict_cache_honors_per_level_ttl() {
    let (_dir, store) = open_store();
    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    let row = |hash: String, level: i32, analyzed_at: i64| SandboxVerdictRow {
        file_hash: hash,
        threat_level: level,
        confidence: 900,
        composite_score: 750,
        yara_score: 800,
        ml_score: 700,
        behavioral_score: 600,
        verdict_explanation: "test".to_string(),
        triggered_rules: vec!["r1".to_string()],
        detected_behaviors: vec!["b1".to_string()],
        analyzed_at_ms: analyzed_at,
        expires_at_ms: 0,
    };

    // Clean verdict analyzed 31 days ago: past its 30-day TTL.
    let stale_clean = "11".repeat(32);
    store
        .store_sandbox_verdict(&row(stale_clean.clone(), 0, now_ms() - 31 * DAY_MS))
        .unwrap();
    assert!(store.lookup_sandbox_verdict(&stale_clean).unwrap().is_none());

    // Malicious verdict analyzed 31 days ago: 90-day TTL still holds.
    let fresh_malicious = "22".repeat(32);
    store
        .store_sandbox_verdict(&row(fresh_malicious.clone(), 2, now_ms() - 31 * DAY_MS))
        .unwrap();
    let cached = store.lookup_sandbox_verdict(&fresh_malicious).unwrap().unwrap();
    assert_eq!(cached.threat_level, 2);
    assert_eq!(cached.triggered_rules, vec!["r1".to_string()]);

    // Invalidate removes, clear removes all.
    store.invalidate_verdict(&fresh_malicious).unwrap();
    assert!(store.lookup_sandbox_verdict(&fresh_malicious).unwrap().is_none());

    let hash = "33".repeat(32);
    store.store_sandbox_verdict(&row(hash.clone(), 3, now_ms())).unwrap();
    store.clear_verdict_cache().unwrap();
    assert!(store.lookup_sandbox_verdict(&hash).unwrap().is_none());
}

#[test]
fn verdict_upsert_overwrites_previous_row() {
    let (_dir, store) = open_store();
    let hash = "44".repeat(32);

    let mut row = SandboxVerdictRow {
        file_hash: hash.clone(),
        threat_level: 0,
        confidence: 100,
        composite_score: 100,
        yara_score: 0,
        ml_score: 0,
        behavioral_score: 0,
        verdict_explanation: "first".to_string(),
        triggered_rules: vec![],
        detected_behaviors: vec![],
        analyzed_at_ms: now_ms(),
        expires_at_ms: 0,
    };
    store.store_sandbox_verdict(&row).unwrap();

    row.threat_level = 3;
    row.verdict_explanation = "second".to_string();
    store.store_sandbox_verdict(&row).unwrap();

    let cached = store.lookup_sandbox_verdict(&hash).unwrap().unwrap();
    assert_eq!(cached.threat_level, 3);
    assert_eq!(cached.verdict_explanation, "second");
}

#[test]
fn network_behavior_upsert_is_unique_per_domain_and_type() {
    let (_dir, store) = open_store();

    let mut policy = NetworkBehaviorPolicy {
        id: -1,
        domain: "tracker.example.com".to_string(),
        threat_type: "form_exfil".to_string(),
        policy: "block".to_string(),
        confidence: 800,
        notes: String::new(),
        created_at_ms: 0,
        updated_at_ms: 0,
    };
    store.upsert_network_behavior(&policy).unwrap();

    policy.policy = "warn".to_string();
    policy.confidence = 600;
    store.upsert_network_behavior(&policy).unwrap();

    let all = store.list_network_behaviors().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].policy, "warn");
    assert_eq!(all[0].confidence, 600);

    let fetched = store
        .get_network_behavior("tracker.example.com", "form_exfil")
        .unwrap()
        .unwrap();
    assert_eq!(fetched.policy, "warn");

    store.delete_network_behavior("tracker.example.com", "form_exfil").unwrap();
    assert!(store.list_network_behaviors().unwrap().is_empty());
}

#[test]
fn network_behavior_validates_inputs() {
    let (_dir, store) = open_store();

    let bad_domain = NetworkBehaviorPolicy {
        id: -1,
        domain: "bad domain with spaces".to_string(),
        threat_type: "x".to_string(),
        policy: "block".to_string(),
        confidence: 500,
        notes: String::new(),
        created_at_ms: 0,
        updated_at_ms: 0,
    };
    assert!(store.upsert_network_behavior(&bad_domain).is_err());

    let bad_confidence = NetworkBehaviorPolicy {
        domain: "ok.example.com".to_string(),
        confidence: 2000,
        ..bad_domain
    };
    assert!(store.upsert_network_behavior(&bad_confidence).is_err());
}

#[test]
fn credential_relationships_crud() {
    let (_dir, store) = open_store();

    let relationship = CredentialRelationship {
        id: -1,
        primary_origin: "accounts.example.com".to_string(),
        related_origin: "sso.example.com".to_string(),
        relation: "sso".to_string(),
        notes: "single sign-on pair".to_string(),
        created_at_ms: 0,
    };
    let id = store.create_credential_relationship(&relationship).unwrap();

    let all = store.list_credential_relationships().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].relation, "sso");

    store.delete_credential_relationship(id).unwrap();
    assert!(store.list_credential_relationships().unwrap().is_empty());
}

#[test]
fn template_lifecycle_through_store() {
    let (_dir, store) = open_store();
    policy::seed_builtin_templates(&store).unwrap();

    let templates = store.list_templates().unwrap();
    assert!(templates.iter().any(|t| t.name == "block-known-hash" && t.is_builtin));

    let mut vars = HashMap::new();
    vars.insert("rule_name".to_string(), "EICAR".to_string());
    vars.insert("file_hash".to_string(), eicar_hash());
    let ids = policy::apply_template(&store, "block-known-hash", &vars).unwrap();
    assert_eq!(ids.len(), 1);

    // Builtins cannot be deleted.
    assert!(store.delete_template("block-known-hash").is_err());
}

#[test]
fn maintenance_operations_run() {
    let (_dir, store) = open_store();
    store.vacuum_database().unwrap();
    store.verify_database_integrity().unwrap();
    assert!(store.is_database_healthy());
    assert_eq!(store.cleanup_expired_verdicts().unwrap(), 0);
}

#[test]
fn cache_metrics_reflect_match_traffic() {
    let (_dir, store) = open_store();

    let mut policy = Policy::new("cached", PolicyAction::Block);
    policy.file_hash = Some(eicar_hash());
    store.create_policy(&policy).unwrap();

    let threat = ThreatMetadata {
        file_hash: eicar_hash(),
        ..Default::default()
    };
    store.match_policy(&threat).unwrap();
    store.match_policy(&threat).unwrap();
    store.match_policy(&threat).unwrap();

    let metrics = store.cache_metrics();
    assert!(metrics.hits >= 2);
    assert!(metrics.current_size >= 1);
    assert!(metrics.hit_rate() > 0.0);
}
