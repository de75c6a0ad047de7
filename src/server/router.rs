use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::filter::ThreatFeed;
use crate::guard::{ClientRateLimiter, RateLimitError};
use crate::health::{DegradationRegistry, HealthRegistry};
use crate::policy::{
    self, CredentialRelationship, InputValidator, NetworkBehaviorPolicy, Policy, PolicyAction,
    PolicyMatchType, PolicyStore, StoreError, ThreatMetadata,
};
use crate::quarantine::{QuarantineVault, VaultError, DEFAULT_RETENTION};
use crate::sandbox::{Orchestrator, SandboxResult, ThreatLevel, ThreatReporter};
use crate::util::sha256_hex;

/// Decoded scan payload ceiling (200 MiB) and the base64 body ceiling
/// that can encode it (300 MiB).
pub const MAX_SCAN_BYTES: usize = 200 * 1024 * 1024;
pub const MAX_BASE64_BYTES: usize = 300 * 1024 * 1024;

const SCAN_PATH_PREFIXES: &[&str] = &["/home", "/tmp", "/var/tmp"];

/// Validates, rate-limits, and dispatches UI/IPC requests to the core
/// components. One instance serves every client; per-client fairness is
/// the rate limiter's job.
pub struct RequestRouter {
    store: Arc<PolicyStore>,
    orchestrator: Arc<Orchestrator>,
    vault: Arc<QuarantineVault>,
    health: Arc<HealthRegistry>,
    degradation: Arc<DegradationRegistry>,
    rate_limiter: Arc<ClientRateLimiter>,
    threat_feed: Arc<Mutex<ThreatFeed>>,
    reporter: ThreatReporter,
}

impl RequestRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<PolicyStore>,
        orchestrator: Arc<Orchestrator>,
        vault: Arc<QuarantineVault>,
        health: Arc<HealthRegistry>,
        degradation: Arc<DegradationRegistry>,
        rate_limiter: Arc<ClientRateLimiter>,
        threat_feed: Arc<Mutex<ThreatFeed>>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            vault,
            health,
            degradation,
            rate_limiter,
            threat_feed,
            reporter: ThreatReporter::new(),
        }
    }

    pub fn rate_limiter(&self) -> &ClientRateLimiter {
        &self.rate_limiter
    }

    /// Entry point for one request object; always produces a reply
    /// envelope carrying the request id.
    pub async fn handle_request(&self, client_id: u64, request: Value) -> Value {
        let request_id = request
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let Some(action) = request.get("action").and_then(Value::as_str) else {
            return error_reply(&request_id, "Missing 'action' field");
        };

        debug!("client {client_id}: {action}");

        match action {
            // Health endpoints always answer, even when everything else
            // is on fire.
            "health" => self.handle_health(&request_id),
            "health_live" => success_reply(&request_id, json!({ "liveness": self.health.check_liveness() })),
            "health_ready" => success_reply(&request_id, json!({ "readiness": self.health.check_readiness() })),
            "metrics" => success_reply(&request_id, json!({ "metrics": self.health.prometheus_format() })),

            "scan_file" => self.handle_scan_file(client_id, &request_id, &request).await,
            "scan_content" => self.handle_scan_content(client_id, &request_id, &request).await,

            "getSystemStatus" | "loadStatistics" => self.handle_statistics(&request_id),
            "getMetrics" => self.handle_component_metrics(&request_id),

            "loadPolicies" => self.guarded_policy_query(client_id, &request_id, |router| {
                let policies = router.store.list_policies()?;
                Ok(json!({ "policies": policies }))
            }),
            "getPolicy" => self.guarded_policy_query(client_id, &request_id, |router| {
                let id = require_i64(&request, "policy_id")?;
                Ok(json!({ "policy": router.store.get_policy(id)? }))
            }),
            "createPolicy" => self.guarded_policy_query(client_id, &request_id, |router| {
                let policy = policy_from_request(&request)?;
                let id = router.store.create_policy(&policy)?;
                Ok(json!({ "policy_id": id }))
            }),
            "updatePolicy" => self.guarded_policy_query(client_id, &request_id, |router| {
                let id = require_i64(&request, "policy_id")?;
                let mut policy = policy_from_request(&request)?;
                policy.id = id;
                router.store.update_policy(id, &policy)?;
                Ok(json!({ "policy_id": id }))
            }),
            "deletePolicy" => self.guarded_policy_query(client_id, &request_id, |router| {
                let id = require_i64(&request, "policy_id")?;
                router.store.delete_policy(id)?;
                Ok(json!({ "deleted": true }))
            }),

            "loadThreatHistory" => self.guarded_policy_query(client_id, &request_id, |router| {
                let since = request.get("since_ms").and_then(Value::as_i64);
                let threats = router.store.get_threat_history(since)?;
                Ok(json!({ "threats": threats }))
            }),

            "getTemplates" => self.guarded_policy_query(client_id, &request_id, |router| {
                Ok(json!({ "templates": router.store.list_templates()? }))
            }),
            "createFromTemplate" | "applyPolicyTemplate" => {
                self.guarded_policy_query(client_id, &request_id, |router| {
                    let name = require_str(&request, "template_name")?;
                    let vars = string_map(request.get("variables"));
                    let ids = policy::apply_template(&router.store, &name, &vars)
                        .map_err(|e| RouterError::Message(e.to_string()))?;
                    Ok(json!({ "policy_ids": ids }))
                })
            }
            "exportPolicyTemplates" => self.guarded_policy_query(client_id, &request_id, |router| {
                let templates = router.store.list_templates()?;
                let exported = policy::export_templates(&templates)
                    .map_err(|e| RouterError::Message(e.to_string()))?;
                Ok(json!({ "templates_json": exported }))
            }),
            "importPolicyTemplates" => self.guarded_policy_query(client_id, &request_id, |router| {
                let body = require_str(&request, "templates_json")?;
                let imported = policy::import_templates(&router.store, &body)
                    .map_err(|e| RouterError::Message(e.to_string()))?;
                Ok(json!({ "imported": imported }))
            }),

            "openQuarantineManager" | "listQuarantinedFiles" => {
                let filter = request
                    .get("threat_level")
                    .and_then(Value::as_i64)
                    .map(|l| ThreatLevel::from_i32(l as i32));
                match self.vault.list_quarantined_files(filter) {
                    Ok(records) => success_reply(&request_id, json!({ "quarantined_files": records })),
                    Err(e) => error_reply(&request_id, &e.to_string()),
                }
            }
            "quarantineFile" => self.handle_quarantine_file(&request_id, &request).await,
            "restoreQuarantinedFile" => {
                let result = require_i64(&request, "quarantine_id").and_then(|id| {
                    let target = require_str(&request, "target_path")?;
                    InputValidator::validate_file_path(&target)
                        .map_err(|e| RouterError::Message(e.to_string()))?;
                    self.vault
                        .restore_file(id, Path::new(&target))
                        .map_err(RouterError::from)
                });
                reply_from(result.map(|_| json!({ "restored": true })), &request_id)
            }
            "deleteQuarantinedFile" => {
                let result = require_i64(&request, "quarantine_id")
                    .and_then(|id| self.vault.delete_file(id).map_err(RouterError::from));
                reply_from(result.map(|_| json!({ "deleted": true })), &request_id)
            }
            "cleanupQuarantine" => match self.vault.cleanup_expired(DEFAULT_RETENTION) {
                Ok(cleaned) => success_reply(&request_id, json!({ "cleaned": cleaned })),
                Err(e) => error_reply(&request_id, &e.to_string()),
            },

            "setNetworkBehaviorPolicy" => self.guarded_policy_query(client_id, &request_id, |router| {
                let policy = network_behavior_from_request(&request)?;
                let id = router.store.upsert_network_behavior(&policy)?;
                Ok(json!({ "policy_id": id }))
            }),
            "getNetworkBehaviorPolicies" => self.guarded_policy_query(client_id, &request_id, |router| {
                Ok(json!({ "policies": router.store.list_network_behaviors()? }))
            }),
            "deleteNetworkBehaviorPolicy" => self.guarded_policy_query(client_id, &request_id, |router| {
                let domain = require_str(&request, "domain")?;
                let threat_type = require_str(&request, "threat_type")?;
                router.store.delete_network_behavior(&domain, &threat_type)?;
                Ok(json!({ "deleted": true }))
            }),

            "addCredentialRelationship" => self.guarded_policy_query(client_id, &request_id, |router| {
                let relationship = CredentialRelationship {
                    id: -1,
                    primary_origin: require_str(&request, "primary_origin")?,
                    related_origin: require_str(&request, "related_origin")?,
                    relation: optional_str(&request, "relation"),
                    notes: optional_str(&request, "notes"),
                    created_at_ms: 0,
                };
                let id = router.store.create_credential_relationship(&relationship)?;
                Ok(json!({ "relationship_id": id }))
            }),
            "listCredentialRelationships" => self.guarded_policy_query(client_id, &request_id, |router| {
                Ok(json!({ "relationships": router.store.list_credential_relationships()? }))
            }),
            "deleteCredentialRelationship" => self.guarded_policy_query(client_id, &request_id, |router| {
                let id = require_i64(&request, "relationship_id")?;
                router.store.delete_credential_relationship(id)?;
                Ok(json!({ "deleted": true }))
            }),

            _ => error_reply(&request_id, "Unknown action"),
        }
    }

    fn handle_health(&self, request_id: &str) -> Value {
        let report = self.health.check_all();
        success_reply(
            request_id,
            json!({
                "health": {
                    "status": report.overall_status.as_str(),
                    "timestamp": report.timestamp_ms,
                    "uptime_seconds": report.uptime_seconds,
                    "components": report.components.iter()
                        .map(|c| (c.component_name.clone(), serde_json::to_value(c).unwrap_or(Value::Null)))
                        .collect::<serde_json::Map<String, Value>>(),
                    "metrics": report.metrics,
                    "degradation": self.degradation.metrics(),
                }
            }),
        )
    }

    async fn handle_scan_file(&self, client_id: u64, request_id: &str, request: &Value) -> Value {
        if let Err(reply) = self.admit_scan(client_id, request_id) {
            return reply;
        }

        let reply = match request.get("file_path").and_then(Value::as_str) {
            None => error_reply(request_id, "Missing 'file_path' field"),
            Some(path) => match InputValidator::validate_file_path(path) {
                Err(e) => error_reply(request_id, &e.to_string()),
                Ok(()) => match validate_scan_path(path) {
                    Err(msg) => error_reply(request_id, &msg),
                    Ok(canonical) => match std::fs::read(&canonical) {
                        Err(e) => error_reply(request_id, &format!("Failed to read file: {e}")),
                        Ok(content) => {
                            let filename = canonical
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default();
                            self.scan_bytes(request_id, &content, &filename).await
                        }
                    },
                },
            },
        };

        self.rate_limiter.release_scan_slot(client_id);
        reply
    }

    async fn handle_scan_content(&self, client_id: u64, request_id: &str, request: &Value) -> Value {
        if let Err(reply) = self.admit_scan(client_id, request_id) {
            return reply;
        }

        let reply = match request.get("content").and_then(Value::as_str) {
            None => error_reply(request_id, "Missing 'content' field"),
            Some(content) if content.len() > MAX_BASE64_BYTES => {
                error_reply(request_id, "Content too large for scanning (max 200MB after decode)")
            }
            Some(content) => match base64::engine::general_purpose::STANDARD.decode(content) {
                Err(_) => error_reply(request_id, "Failed to decode base64 content"),
                Ok(decoded) if decoded.len() > MAX_SCAN_BYTES => {
                    error_reply(request_id, "Content too large for scanning (max 200MB after decode)")
                }
                Ok(decoded) => self.scan_bytes(request_id, &decoded, "content").await,
            },
        };

        self.rate_limiter.release_scan_slot(client_id);
        reply
    }

    /// Shared scan path: bloom prefilter, sandbox pipeline, policy match,
    /// threat-history append, and the wire-shape result.
    async fn scan_bytes(&self, request_id: &str, content: &[u8], filename: &str) -> Value {
        let file_hash = sha256_hex(content);
        let bloom_hit = self.threat_feed.lock().probably_malicious(&file_hash);

        let analysis = match self.orchestrator.analyze_file(content, filename).await {
            Ok(result) => result,
            Err(e) => return error_reply(request_id, &format!("Scan failed: {e}")),
        };

        let threat_detected = bloom_hit || analysis.is_suspicious();

        // Policy decision + audit trail. A corrupted database must not
        // block the verdict; the reply carries a notification instead.
        let mut database_error = false;
        let mut policy_action: Option<PolicyAction> = None;

        let threat = ThreatMetadata {
            url: String::new(),
            filename: filename.to_string(),
            file_hash: file_hash.clone(),
            mime_type: String::new(),
            file_size: content.len() as u64,
            rule_name: analysis
                .triggered_rules
                .first()
                .cloned()
                .unwrap_or_else(|| "sandbox".to_string()),
            severity: analysis.threat_level.label().to_string(),
        };

        match self.store.match_policy(&threat) {
            Ok(matched) => {
                policy_action = matched.as_ref().map(|p| p.action);
                if threat_detected {
                    let action_taken = match policy_action {
                        Some(action) => action.as_str().to_string(),
                        None => if analysis.is_malicious() { "block" } else { "allow" }.to_string(),
                    };
                    let alert_json = json!({
                        "summary": self.reporter.format_summary_line(&analysis, filename),
                        "composite_score": analysis.composite_score,
                    })
                    .to_string();
                    if let Err(e) = self.store.record_threat(
                        &threat,
                        &action_taken,
                        matched.map(|p| p.id),
                        &alert_json,
                    ) {
                        warn!("failed to record threat: {e}");
                        database_error = true;
                    }
                }
            }
            Err(e) => {
                warn!("policy match failed: {e}");
                database_error = true;
            }
        }

        let result = scan_result_json(&analysis, bloom_hit, threat_detected, policy_action);
        let mut reply = success_reply(request_id, json!({ "result": result }));
        if database_error {
            reply["databaseError"] = Value::Bool(true);
        }
        reply
    }

    async fn handle_quarantine_file(&self, request_id: &str, request: &Value) -> Value {
        let path = match request.get("file_path").and_then(Value::as_str) {
            Some(p) => p.to_string(),
            None => return error_reply(request_id, "Missing 'file_path' field"),
        };
        if let Err(e) = InputValidator::validate_file_path(&path) {
            return error_reply(request_id, &e.to_string());
        }

        let content = match std::fs::read(&path) {
            Ok(c) => c,
            Err(e) => return error_reply(request_id, &format!("Failed to read file: {e}")),
        };

        let analysis = match self.orchestrator.analyze_file(&content, &path).await {
            Ok(result) => result,
            Err(e) => return error_reply(request_id, &format!("Analysis failed: {e}")),
        };
        drop(content);

        match self.vault.quarantine_file(Path::new(&path), &analysis) {
            Ok(record) => success_reply(request_id, json!({ "record": record })),
            Err(e) => error_reply(request_id, &e.to_string()),
        }
    }

    fn handle_statistics(&self, request_id: &str) -> Value {
        let orchestrator = self.orchestrator.statistics();
        let verdicts = self.orchestrator.verdict_statistics();
        let quarantine = self.vault.statistics();
        let feed = self.threat_feed.lock().statistics();

        success_reply(
            request_id,
            json!({
                "statistics": {
                    "files_analyzed": orchestrator.total_files_analyzed,
                    "cache_hits": orchestrator.cache_hits,
                    "tier1_executions": orchestrator.tier1_executions,
                    "tier2_executions": orchestrator.tier2_executions,
                    "malicious_detected": orchestrator.malicious_detected,
                    "timeouts": orchestrator.timeouts,
                    "verdicts": {
                        "clean": verdicts.clean,
                        "suspicious": verdicts.suspicious,
                        "malicious": verdicts.malicious,
                        "critical": verdicts.critical,
                    },
                    "policy_count": self.store.policy_count().unwrap_or(0),
                    "threat_count": self.store.threat_count().unwrap_or(0),
                    "quarantine": quarantine,
                    "threat_feed": {
                        "total_threats": feed.total_threats,
                        "false_positive_rate": feed.false_positive_rate,
                    },
                    "rate_limiter": {
                        "total_rejected": self.rate_limiter.total_rejected(),
                    },
                }
            }),
        )
    }

    fn handle_component_metrics(&self, request_id: &str) -> Value {
        success_reply(
            request_id,
            json!({
                "metrics": {
                    "match_cache": self.store.cache_metrics(),
                    "match_cache_hit_rate": self.store.cache_metrics().hit_rate(),
                    "circuit_breaker": self.store.breaker_metrics(),
                    "degradation": self.degradation.metrics(),
                }
            }),
        )
    }

    fn admit_scan(&self, client_id: u64, request_id: &str) -> Result<(), Value> {
        if let Err(e) = self.rate_limiter.check_scan_request(client_id) {
            return Err(rate_limit_reply(request_id, &e));
        }
        if let Err(e) = self.rate_limiter.acquire_scan_slot(client_id) {
            return Err(rate_limit_reply(request_id, &e));
        }
        Ok(())
    }

    fn guarded_policy_query(
        &self,
        client_id: u64,
        request_id: &str,
        op: impl FnOnce(&Self) -> Result<Value, RouterError>,
    ) -> Value {
        if let Err(e) = self.rate_limiter.check_policy_query(client_id) {
            return rate_limit_reply(request_id, &e);
        }
        reply_from(op(self), request_id)
    }
}

// ---- Reply helpers ----

#[derive(Debug)]
enum RouterError {
    Message(String),
    Store(StoreError),
}

impl From<StoreError> for RouterError {
    fn from(e: StoreError) -> Self {
        RouterError::Store(e)
    }
}

impl From<VaultError> for RouterError {
    fn from(e: VaultError) -> Self {
        RouterError::Message(e.to_string())
    }
}

impl RouterError {
    fn message(&self) -> String {
        match self {
            RouterError::Message(msg) => msg.clone(),
            RouterError::Store(StoreError::CircuitBlocked) => {
                "Service temporarily unavailable (database circuit open)".to_string()
            }
            RouterError::Store(e) => e.to_string(),
        }
    }
}

fn success_reply(request_id: &str, payload: Value) -> Value {
    let mut reply = json!({
        "request_id": request_id,
        "status": "success",
    });
    if let (Value::Object(reply_map), Value::Object(payload_map)) = (&mut reply, payload) {
        reply_map.extend(payload_map);
    }
    reply
}

fn error_reply(request_id: &str, message: &str) -> Value {
    json!({
        "request_id": request_id,
        "status": "error",
        "error": message,
    })
}

fn rate_limit_reply(request_id: &str, error: &RateLimitError) -> Value {
    let message = match error {
        RateLimitError::RateExceeded(_) => {
            "Rate limit exceeded. Too many scan requests. Please try again later."
        }
        RateLimitError::ConcurrencyExceeded(_) => {
            "Concurrent scan limit exceeded. Please wait for ongoing scans to complete."
        }
    };
    error_reply(request_id, message)
}

fn reply_from(result: Result<Value, RouterError>, request_id: &str) -> Value {
    match result {
        Ok(payload) => success_reply(request_id, payload),
        Err(e) => error_reply(request_id, &e.message()),
    }
}

// ---- Request parsing helpers ----

fn require_str(request: &Value, field: &str) -> Result<String, RouterError> {
    request
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RouterError::Message(format!("Missing '{field}' field")))
}

fn optional_str(request: &Value, field: &str) -> String {
    request
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn require_i64(request: &Value, field: &str) -> Result<i64, RouterError> {
    request
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| RouterError::Message(format!("Missing '{field}' field")))
}

fn string_map(value: Option<&Value>) -> std::collections::HashMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Policy payloads ride under a nested `"policy"` object so the policy's
/// own `action` field never collides with the dispatch verb.
fn policy_from_request(request: &Value) -> Result<Policy, RouterError> {
    let body = request
        .get("policy")
        .ok_or_else(|| RouterError::Message("Missing 'policy' object".to_string()))?;

    let rule_name = require_str(body, "rule_name")?;
    let action_str = require_str(body, "action")?;
    let action = PolicyAction::parse(&action_str)
        .ok_or_else(|| RouterError::Message(format!("unknown action '{action_str}'")))?;

    let mut policy = Policy::new(rule_name, action);
    policy.url_pattern = body
        .get("url_pattern")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    policy.file_hash = body
        .get("file_hash")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    policy.mime_type = body
        .get("mime_type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    if let Some(match_type) = body.get("match_type").and_then(Value::as_str) {
        policy.match_type = PolicyMatchType::parse(match_type)
            .ok_or_else(|| RouterError::Message(format!("unknown match_type '{match_type}'")))?;
    }
    policy.enforcement_action = optional_str(body, "enforcement_action");
    policy.expires_at_ms = body.get("expires_at_ms").and_then(Value::as_i64);
    if let Some(created_by) = body.get("created_by").and_then(Value::as_str) {
        policy.created_by = created_by.to_string();
    }
    Ok(policy)
}

fn network_behavior_from_request(request: &Value) -> Result<NetworkBehaviorPolicy, RouterError> {
    Ok(NetworkBehaviorPolicy {
        id: -1,
        domain: require_str(request, "domain")?,
        threat_type: require_str(request, "threat_type")?,
        policy: require_str(request, "policy")?,
        confidence: request.get("confidence").and_then(Value::as_i64).unwrap_or(500),
        notes: optional_str(request, "notes"),
        created_at_ms: 0,
        updated_at_ms: 0,
    })
}

/// Canonicalize and confine `scan_file` paths: must resolve under an
/// allowed prefix, to a regular file, within the size ceiling.
fn validate_scan_path(file_path: &str) -> Result<PathBuf, String> {
    let canonical = std::fs::canonicalize(file_path)
        .map_err(|e| format!("Cannot resolve path: {e}"))?;

    let canonical_str = canonical.to_string_lossy();
    if !SCAN_PATH_PREFIXES.iter().any(|prefix| canonical_str.starts_with(prefix)) {
        return Err("File path not in allowed directory".to_string());
    }

    let metadata = std::fs::symlink_metadata(&canonical)
        .map_err(|e| format!("Cannot stat file: {e}"))?;
    if !metadata.is_file() {
        return Err("Can only scan regular files".to_string());
    }
    if metadata.len() as usize > MAX_SCAN_BYTES {
        return Err("File too large to scan".to_string());
    }

    Ok(canonical)
}

/// Wire shape: `"clean"` or a JSON object describing the detection.
fn scan_result_json(
    analysis: &SandboxResult,
    bloom_hit: bool,
    threat_detected: bool,
    policy_action: Option<PolicyAction>,
) -> Value {
    if !threat_detected {
        return Value::String("clean".to_string());
    }

    let matched_rules: Vec<Value> = analysis
        .triggered_rules
        .iter()
        .map(|rule| json!({ "rule_name": rule, "severity": analysis.threat_level.label() }))
        .collect();

    let mut result = json!({
        "threat_detected": true,
        "matched_rules": matched_rules,
        "match_count": analysis.triggered_rules.len(),
        "threat_level": analysis.threat_level.label(),
        "composite_score": analysis.composite_score,
        "ml_prediction": {
            "malware_probability": analysis.ml_score,
            "confidence": analysis.confidence,
            "explanation": analysis.verdict_explanation,
        },
    });

    if bloom_hit {
        result["bloom_filter_hit"] = Value::Bool(true);
        result["known_threat"] = Value::String("File hash matches federated threat database".to_string());
    }
    if let Some(action) = policy_action {
        result["policy_action"] = Value::String(action.as_str().to_string());
    }

    result
}
