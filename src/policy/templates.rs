use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{InputValidator, Policy, PolicyAction, PolicyMatchType, PolicyStore, PolicyTemplate, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unresolved placeholder '${{{0}}}'")]
    UnresolvedPlaceholder(String),
    #[error("template body is not valid JSON: {0}")]
    MalformedBody(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<super::ValidationError> for TemplateError {
    fn from(e: super::ValidationError) -> Self {
        TemplateError::Store(StoreError::InvalidInput(e.0))
    }
}

/// Serialized template/export shape:
/// `{"policies":[{"ruleName":…, "action":…, "match_pattern":{…}}]}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TemplateDocument {
    pub policies: Vec<TemplatePolicy>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TemplatePolicy {
    #[serde(rename = "ruleName")]
    pub rule_name: String,
    pub action: PolicyAction,
    #[serde(default)]
    pub match_type: Option<PolicyMatchType>,
    #[serde(default)]
    pub match_pattern: MatchPattern,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MatchPattern {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Replace every `${name}` in `body` with `vars[name]`. Unknown
/// placeholders are an error so a half-instantiated policy never lands
/// in the store.
pub fn substitute_placeholders(
    body: &str,
    vars: &HashMap<String, String>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| TemplateError::UnresolvedPlaceholder(after.to_string()))?;
        let name = &after[..end];
        let value = vars
            .get(name)
            .ok_or_else(|| TemplateError::UnresolvedPlaceholder(name.to_string()))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Instantiate a template into concrete, validated policies. Nothing is
/// persisted; pair with [`apply_template`] to insert the result.
pub fn instantiate_template(
    template: &PolicyTemplate,
    vars: &HashMap<String, String>,
) -> Result<Vec<Policy>, TemplateError> {
    let body = substitute_placeholders(&template.body, vars)?;
    let document: TemplateDocument = serde_json::from_str(&body)?;

    let mut policies = Vec::with_capacity(document.policies.len());
    for entry in document.policies {
        let mut policy = Policy::new(entry.rule_name, entry.action);
        policy.match_type = entry.match_type.unwrap_or(PolicyMatchType::DownloadOriginFileType);
        policy.url_pattern = entry.match_pattern.url_pattern;
        policy.file_hash = entry.match_pattern.file_hash;
        policy.mime_type = entry.match_pattern.mime_type;
        policy.created_by = format!("template:{}", template.name);

        InputValidator::validate_policy(&policy)?;
        policies.push(policy);
    }

    debug!("instantiated template '{}' into {} policies", template.name, policies.len());
    Ok(policies)
}

/// Instantiate and persist; returns the new policy ids.
pub fn apply_template(
    store: &PolicyStore,
    template_name: &str,
    vars: &HashMap<String, String>,
) -> Result<Vec<i64>, TemplateError> {
    let template = store.get_template(template_name)?;
    let policies = instantiate_template(&template, vars)?;

    let mut ids = Vec::with_capacity(policies.len());
    for policy in &policies {
        ids.push(store.create_policy(policy)?);
    }

    info!("applied template '{template_name}': created {} policies", ids.len());
    Ok(ids)
}

pub fn export_templates(templates: &[PolicyTemplate]) -> Result<String, TemplateError> {
    #[derive(Serialize)]
    struct Export<'a> {
        templates: &'a [PolicyTemplate],
    }
    Ok(serde_json::to_string_pretty(&Export { templates })?)
}

pub fn import_templates(store: &PolicyStore, json: &str) -> Result<usize, TemplateError> {
    #[derive(Deserialize)]
    struct Import {
        templates: Vec<PolicyTemplate>,
    }

    let parsed: Import = serde_json::from_str(json)?;
    let mut imported = 0usize;
    for mut template in parsed.templates {
        // Imported templates are never trusted as builtins.
        template.is_builtin = false;
        store.insert_template(&template)?;
        imported += 1;
    }
    Ok(imported)
}

/// Seed the built-in template set; safe to call on every startup.
pub fn seed_builtin_templates(store: &PolicyStore) -> Result<(), StoreError> {
    let builtins = [
        PolicyTemplate {
            id: -1,
            name: "block-known-hash".to_string(),
            description: "Block a file everywhere by its SHA-256 hash".to_string(),
            category: "downloads".to_string(),
            is_builtin: true,
            body: r#"{"policies":[{"ruleName":"${rule_name}","action":"block","match_pattern":{"file_hash":"${file_hash}"}}]}"#
                .to_string(),
        },
        PolicyTemplate {
            id: -1,
            name: "quarantine-origin-downloads".to_string(),
            description: "Quarantine every download matching an origin pattern".to_string(),
            category: "downloads".to_string(),
            is_builtin: true,
            body: r#"{"policies":[{"ruleName":"${rule_name}","action":"quarantine","match_pattern":{"url_pattern":"${url_pattern}"}}]}"#
                .to_string(),
        },
        PolicyTemplate {
            id: -1,
            name: "warn-insecure-credential-post".to_string(),
            description: "Warn when credentials are posted over an insecure channel".to_string(),
            category: "forms".to_string(),
            is_builtin: true,
            body: r#"{"policies":[{"ruleName":"${rule_name}","action":"warn_user","match_type":"insecure_credential_post","match_pattern":{"url_pattern":"${url_pattern}"}}]}"#
                .to_string(),
        },
    ];

    for template in &builtins {
        store.insert_template(template)?;
    }
    Ok(())
}
