use super::{Policy, PolicyAction, PolicyMatchType};

pub const MAX_RULE_NAME_BYTES: usize = 256;
pub const MAX_URL_PATTERN_BYTES: usize = 2048;
pub const MAX_MIME_TYPE_BYTES: usize = 256;
pub const MAX_FILE_PATH_BYTES: usize = 4096;
pub const MAX_URL_WILDCARDS: usize = 10;

/// One hundred years past the epoch start we call a timestamp insane.
const MAX_TIMESTAMP_MS: i64 = 4_102_444_800_000 + 100 * 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

type Valid = Result<(), ValidationError>;

fn err(msg: impl Into<String>) -> Valid {
    Err(ValidationError(msg.into()))
}

/// Input validation shared by the policy store and the request router.
/// Every CRUD entry point runs through here before any SQL is built, so
/// hostile input dies at the boundary rather than at query time.
pub struct InputValidator;

impl InputValidator {
    pub fn validate_rule_name(name: &str) -> Valid {
        if name.is_empty() {
            return err("rule_name must not be empty");
        }
        if name.len() > MAX_RULE_NAME_BYTES {
            return err(format!("rule_name exceeds {MAX_RULE_NAME_BYTES} bytes"));
        }
        if name.chars().any(|c| c.is_control()) {
            return err("rule_name contains control characters");
        }
        Ok(())
    }

    /// URL patterns are matched with SQL LIKE, so the charset is locked
    /// down hard: letters, digits, and `/ _ . * % : -` only.
    pub fn validate_url_pattern(pattern: &str) -> Valid {
        if pattern.len() > MAX_URL_PATTERN_BYTES {
            return err(format!("url_pattern exceeds {MAX_URL_PATTERN_BYTES} bytes"));
        }

        for c in pattern.chars() {
            let allowed = c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '*' | '%' | ':' | '-');
            if !allowed {
                return err(format!("url_pattern contains disallowed character '{c}'"));
            }
        }

        let wildcard_count = pattern.chars().filter(|c| matches!(c, '%' | '*')).count();
        if wildcard_count > MAX_URL_WILDCARDS {
            return err(format!("url_pattern has too many wildcards (max {MAX_URL_WILDCARDS})"));
        }

        Ok(())
    }

    /// Empty (absent) or exactly 64 lowercase hex characters.
    pub fn validate_file_hash(hash: &str) -> Valid {
        if hash.is_empty() {
            return Ok(());
        }
        if hash.len() != 64 {
            return err("file_hash must be 64 hex characters");
        }
        if !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return err("file_hash must be lowercase hex");
        }
        Ok(())
    }

    pub fn validate_mime_type(mime: &str) -> Valid {
        if mime.len() > MAX_MIME_TYPE_BYTES {
            return err(format!("mime_type exceeds {MAX_MIME_TYPE_BYTES} bytes"));
        }
        if mime.chars().any(|c| c.is_control()) {
            return err("mime_type contains control characters");
        }
        Ok(())
    }

    pub fn validate_timestamp_ms(ts: i64, field: &str) -> Valid {
        if ts < 0 {
            return err(format!("{field} must not be negative"));
        }
        if ts > MAX_TIMESTAMP_MS {
            return err(format!("{field} is unreasonably far in the future"));
        }
        Ok(())
    }

    pub fn validate_action(action: &str) -> Valid {
        if PolicyAction::parse(action).is_none() {
            return err(format!("unknown action '{action}'"));
        }
        Ok(())
    }

    pub fn validate_match_type(match_type: &str) -> Valid {
        if PolicyMatchType::parse(match_type).is_none() {
            return err(format!("unknown match_type '{match_type}'"));
        }
        Ok(())
    }

    pub fn validate_file_path(path: &str) -> Valid {
        if path.is_empty() {
            return err("file_path must not be empty");
        }
        if path.len() > MAX_FILE_PATH_BYTES {
            return err(format!("file_path exceeds {MAX_FILE_PATH_BYTES} bytes"));
        }
        if path.bytes().any(|b| b == 0) {
            return err("file_path contains a null byte");
        }
        if path.chars().any(|c| c.is_control()) {
            return err("file_path contains control characters");
        }
        Ok(())
    }

    pub fn validate_domain(domain: &str) -> Valid {
        if domain.is_empty() || domain.len() > 253 {
            return err("domain must be 1-253 bytes");
        }
        let allowed = domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'));
        if !allowed {
            return err("domain contains disallowed characters");
        }
        Ok(())
    }

    /// Composite check used by every policy CRUD entry point.
    pub fn validate_policy(policy: &Policy) -> Valid {
        Self::validate_rule_name(&policy.rule_name)?;
        if let Some(pattern) = &policy.url_pattern {
            Self::validate_url_pattern(pattern)?;
        }
        if let Some(hash) = &policy.file_hash {
            Self::validate_file_hash(hash)?;
        }
        if let Some(mime) = &policy.mime_type {
            Self::validate_mime_type(mime)?;
        }
        Self::validate_timestamp_ms(policy.created_at_ms, "created_at")?;
        if let Some(expires) = policy.expires_at_ms {
            Self::validate_timestamp_ms(expires, "expires_at")?;
            if expires == 0 {
                return err("expires_at must be positive when present");
            }
        }
        Ok(())
    }

    pub fn validate_threat_metadata(threat: &super::ThreatMetadata) -> Valid {
        Self::validate_file_hash(&threat.file_hash)?;
        Self::validate_mime_type(&threat.mime_type)?;
        if threat.url.len() > MAX_URL_PATTERN_BYTES {
            return err("url exceeds maximum length");
        }
        Ok(())
    }
}
