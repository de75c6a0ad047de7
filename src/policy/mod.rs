pub mod store;
pub mod templates;
pub mod validator;

pub use store::*;
pub use templates::*;
pub use validator::*;

use serde::{Deserialize, Serialize};

use crate::guard::BreakerError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database circuit breaker is open")]
    CircuitBlocked,
    #[error("database integrity check failed: {0}")]
    Corruption(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ValidationError> for StoreError {
    fn from(e: ValidationError) -> Self {
        StoreError::InvalidInput(e.0)
    }
}

impl From<BreakerError<rusqlite::Error>> for StoreError {
    fn from(e: BreakerError<rusqlite::Error>) -> Self {
        match e {
            BreakerError::Blocked(_) => StoreError::CircuitBlocked,
            BreakerError::Inner(inner) => StoreError::Database(inner),
        }
    }
}

/// What to do when a policy matches a threat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Block,
    Quarantine,
    /// Prevent autofill for matching forms.
    BlockAutofill,
    /// Show a warning, allow if the user confirms.
    WarnUser,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Block => "block",
            PolicyAction::Quarantine => "quarantine",
            PolicyAction::BlockAutofill => "block_autofill",
            PolicyAction::WarnUser => "warn_user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(PolicyAction::Allow),
            "block" => Some(PolicyAction::Block),
            "quarantine" => Some(PolicyAction::Quarantine),
            "block_autofill" => Some(PolicyAction::BlockAutofill),
            "warn_user" => Some(PolicyAction::WarnUser),
            _ => None,
        }
    }
}

/// The kind of event a policy matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMatchType {
    DownloadOriginFileType,
    FormActionMismatch,
    InsecureCredentialPost,
    ThirdPartyFormPost,
}

impl PolicyMatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyMatchType::DownloadOriginFileType => "download",
            PolicyMatchType::FormActionMismatch => "form_action_mismatch",
            PolicyMatchType::InsecureCredentialPost => "insecure_credential_post",
            PolicyMatchType::ThirdPartyFormPost => "third_party_form_post",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "download" => Some(PolicyMatchType::DownloadOriginFileType),
            "form_action_mismatch" => Some(PolicyMatchType::FormActionMismatch),
            "insecure_credential_post" => Some(PolicyMatchType::InsecureCredentialPost),
            "third_party_form_post" => Some(PolicyMatchType::ThirdPartyFormPost),
            _ => None,
        }
    }
}

/// A user-authored decision rule. `id` is assigned on insert (-1 before).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: i64,
    pub rule_name: String,
    pub url_pattern: Option<String>,
    pub file_hash: Option<String>,
    pub mime_type: Option<String>,
    pub action: PolicyAction,
    pub match_type: PolicyMatchType,
    /// Free-form detail, e.g. "block_autofill" parameters.
    pub enforcement_action: String,
    pub created_at_ms: i64,
    pub created_by: String,
    pub expires_at_ms: Option<i64>,
    pub hit_count: i64,
    pub last_hit_ms: Option<i64>,
}

impl Policy {
    /// Fresh policy with sensible bookkeeping defaults; callers fill the
    /// matcher fields.
    pub fn new(rule_name: impl Into<String>, action: PolicyAction) -> Self {
        Self {
            id: -1,
            rule_name: rule_name.into(),
            url_pattern: None,
            file_hash: None,
            mime_type: None,
            action,
            match_type: PolicyMatchType::DownloadOriginFileType,
            enforcement_action: String::new(),
            created_at_ms: crate::util::now_ms(),
            created_by: "user".to_string(),
            expires_at_ms: None,
            hit_count: 0,
            last_hit_ms: None,
        }
    }
}

/// Everything known about a threat event when a policy decision is needed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreatMetadata {
    pub url: String,
    pub filename: String,
    pub file_hash: String,
    pub mime_type: String,
    pub file_size: u64,
    pub rule_name: String,
    pub severity: String,
}

/// Append-only audit row for a detection and the action taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub id: i64,
    pub detected_at_ms: i64,
    pub url: String,
    pub filename: String,
    pub file_hash: String,
    pub mime_type: String,
    pub file_size: u64,
    pub rule_name: String,
    pub severity: String,
    pub action_taken: String,
    pub policy_id: Option<i64>,
    pub alert_json: String,
}

/// Cached sandbox verdict row. Scores are stored as integer thousandths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxVerdictRow {
    pub file_hash: String,
    pub threat_level: i32,
    pub confidence: i32,
    pub composite_score: i32,
    pub yara_score: i32,
    pub ml_score: i32,
    pub behavioral_score: i32,
    pub verdict_explanation: String,
    pub triggered_rules: Vec<String>,
    pub detected_behaviors: Vec<String>,
    pub analyzed_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Verdict cache TTL by threat level: clean verdicts age out fastest so a
/// newly-weaponized file is re-examined; confirmed threats are remembered
/// for much longer.
pub fn verdict_ttl_ms(threat_level: i32) -> i64 {
    const DAY_MS: i64 = 24 * 60 * 60 * 1000;
    match threat_level {
        0 => 30 * DAY_MS,
        1 => 7 * DAY_MS,
        2 => 90 * DAY_MS,
        _ => 365 * DAY_MS,
    }
}

/// Per-(domain, threat_type) decision for observed network/form behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkBehaviorPolicy {
    pub id: i64,
    pub domain: String,
    pub threat_type: String,
    pub policy: String,
    /// 0..=1000.
    pub confidence: i64,
    pub notes: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Learned relationship between two credential origins (e.g. SSO pairs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRelationship {
    pub id: i64,
    pub primary_origin: String,
    pub related_origin: String,
    pub relation: String,
    pub notes: String,
    pub created_at_ms: i64,
}

/// Parameterized policy blueprint; `body` is JSON carrying `${var}`
/// placeholders substituted at instantiation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTemplate {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub category: String,
    pub is_builtin: bool,
    pub body: String,
}
