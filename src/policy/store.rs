use std::hash::BuildHasher;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::{
    CredentialRelationship, InputValidator, NetworkBehaviorPolicy, Policy, PolicyAction,
    PolicyMatchType, PolicyTemplate, SandboxVerdictRow, StoreError, ThreatMetadata, ThreatRecord,
    verdict_ttl_ms,
};
use crate::cache::{CacheMetrics, MeteredLruCache};
use crate::guard::{BreakerConfig, BreakerMetrics, CircuitBreaker};
use crate::quarantine::QuarantineRecord;
use crate::util::now_ms;

const DB_FILE_NAME: &str = "sentinel.db";
const MATCH_CACHE_SIZE: usize = 1000;

/// Persistent store for policies, threat history, the sandbox verdict
/// cache, quarantine records, network-behavior policies, templates, and
/// credential relationships.
///
/// The store solely owns the database handle. Every operation is wrapped
/// by a circuit breaker so a failing database surfaces as `CircuitBlocked`
/// instead of a pile-up of hung queries.
pub struct PolicyStore {
    conn: Mutex<Connection>,
    match_cache: Mutex<MeteredLruCache<u64, Option<i64>>>,
    breaker: CircuitBreaker,
    hash_state: ahash::RandomState,
    database_healthy: AtomicBool,
    db_path: PathBuf,
}

impl PolicyStore {
    /// Open (or create) the store under `dir`. The directory is created
    /// with owner-only permissions; the schema is declared idempotently.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let db_path = dir.join(DB_FILE_NAME);
        let conn = Connection::open(&db_path)?;
        Self::create_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            match_cache: Mutex::new(MeteredLruCache::new(MATCH_CACHE_SIZE)),
            breaker: CircuitBreaker::new(BreakerConfig::database("policy-store")),
            hash_state: ahash::RandomState::new(),
            database_healthy: AtomicBool::new(true),
            db_path,
        };

        // Old threat rows are pruned on startup; failure here is not fatal.
        if let Err(e) = store.cleanup_old_threats(30) {
            warn!("startup threat-history cleanup failed: {e}");
        }

        info!("policy store opened at {}", store.db_path.display());
        Ok(store)
    }

    fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS policies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_name TEXT NOT NULL,
                url_pattern TEXT,
                file_hash TEXT,
                mime_type TEXT,
                action TEXT NOT NULL,
                match_type TEXT NOT NULL DEFAULT 'download',
                enforcement_action TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                created_by TEXT NOT NULL,
                expires_at INTEGER,
                hit_count INTEGER NOT NULL DEFAULT 0,
                last_hit INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_policies_rule_name ON policies(rule_name);
            CREATE INDEX IF NOT EXISTS idx_policies_file_hash ON policies(file_hash);
            CREATE INDEX IF NOT EXISTS idx_policies_url_pattern ON policies(url_pattern);

            CREATE TABLE IF NOT EXISTS threat_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                detected_at INTEGER NOT NULL,
                url TEXT NOT NULL,
                filename TEXT NOT NULL,
                file_hash TEXT NOT NULL,
                mime_type TEXT,
                file_size INTEGER NOT NULL,
                rule_name TEXT NOT NULL,
                severity TEXT NOT NULL,
                action_taken TEXT NOT NULL,
                policy_id INTEGER,
                alert_json TEXT NOT NULL,
                FOREIGN KEY (policy_id) REFERENCES policies(id)
            );
            CREATE INDEX IF NOT EXISTS idx_threat_history_detected_at ON threat_history(detected_at);
            CREATE INDEX IF NOT EXISTS idx_threat_history_rule_name ON threat_history(rule_name);
            CREATE INDEX IF NOT EXISTS idx_threat_history_file_hash ON threat_history(file_hash);

            CREATE TABLE IF NOT EXISTS sandbox_verdicts (
                file_hash TEXT PRIMARY KEY,
                threat_level INTEGER NOT NULL,
                confidence INTEGER NOT NULL,
                composite_score INTEGER NOT NULL,
                yara_score INTEGER NOT NULL,
                ml_score INTEGER NOT NULL,
                behavioral_score INTEGER NOT NULL,
                verdict_explanation TEXT NOT NULL,
                triggered_rules TEXT NOT NULL DEFAULT '[]',
                detected_behaviors TEXT NOT NULL DEFAULT '[]',
                analyzed_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS quarantine_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_path TEXT NOT NULL,
                quarantine_path TEXT NOT NULL,
                quarantine_reason TEXT NOT NULL,
                threat_score REAL NOT NULL,
                threat_level INTEGER NOT NULL,
                quarantined_at INTEGER NOT NULL,
                file_size INTEGER NOT NULL,
                sha256_hash TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS network_behavior_policies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL,
                threat_type TEXT NOT NULL,
                policy TEXT NOT NULL,
                confidence INTEGER NOT NULL DEFAULT 500,
                notes TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(domain, threat_type)
            );

            CREATE TABLE IF NOT EXISTS policy_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT 'general',
                is_builtin INTEGER NOT NULL DEFAULT 0,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credential_relationships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                primary_origin TEXT NOT NULL,
                related_origin TEXT NOT NULL,
                relation TEXT NOT NULL DEFAULT '',
                notes TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                UNIQUE(primary_origin, related_origin)
            );
            "#,
        )
    }

    fn with_db<T>(&self, op: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T, StoreError> {
        self.breaker
            .call(|| {
                let conn = self.conn.lock();
                op(&conn)
            })
            .map_err(StoreError::from)
    }

    // ---- Policy CRUD ----

    pub fn create_policy(&self, policy: &Policy) -> Result<i64, StoreError> {
        InputValidator::validate_policy(policy)?;

        let id = self.with_db(|conn| {
            conn.prepare_cached(
                r#"INSERT INTO policies (rule_name, url_pattern, file_hash, mime_type, action,
                       match_type, enforcement_action, created_at, created_by, expires_at, hit_count, last_hit)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, NULL)"#,
            )?
            .execute(params![
                policy.rule_name,
                policy.url_pattern,
                policy.file_hash,
                policy.mime_type,
                policy.action.as_str(),
                policy.match_type.as_str(),
                policy.enforcement_action,
                policy.created_at_ms,
                policy.created_by,
                policy.expires_at_ms,
            ])?;
            Ok(conn.last_insert_rowid())
        })?;

        // A new rule can change any previously-cached match decision.
        self.match_cache.lock().invalidate();
        debug!("created policy {id} ('{}')", policy.rule_name);
        Ok(id)
    }

    pub fn get_policy(&self, policy_id: i64) -> Result<Policy, StoreError> {
        let policy = self.with_db(|conn| {
            conn.prepare_cached("SELECT * FROM policies WHERE id = ?1")?
                .query_row(params![policy_id], policy_from_row)
                .optional()
        })?;
        policy.ok_or_else(|| StoreError::NotFound(format!("policy {policy_id}")))
    }

    pub fn list_policies(&self) -> Result<Vec<Policy>, StoreError> {
        self.with_db(|conn| {
            let mut stmt = conn.prepare_cached("SELECT * FROM policies ORDER BY created_at DESC")?;
            let rows = stmt.query_map([], policy_from_row)?;
            rows.collect()
        })
    }

    pub fn update_policy(&self, policy_id: i64, policy: &Policy) -> Result<(), StoreError> {
        InputValidator::validate_policy(policy)?;

        let changed = self.with_db(|conn| {
            conn.prepare_cached(
                r#"UPDATE policies
                   SET rule_name = ?1, url_pattern = ?2, file_hash = ?3, mime_type = ?4,
                       action = ?5, match_type = ?6, enforcement_action = ?7, expires_at = ?8
                   WHERE id = ?9"#,
            )?
            .execute(params![
                policy.rule_name,
                policy.url_pattern,
                policy.file_hash,
                policy.mime_type,
                policy.action.as_str(),
                policy.match_type.as_str(),
                policy.enforcement_action,
                policy.expires_at_ms,
                policy_id,
            ])
        })?;

        if changed == 0 {
            return Err(StoreError::NotFound(format!("policy {policy_id}")));
        }
        self.match_cache.lock().invalidate();
        Ok(())
    }

    pub fn delete_policy(&self, policy_id: i64) -> Result<(), StoreError> {
        let changed = self.with_db(|conn| {
            conn.prepare_cached("DELETE FROM policies WHERE id = ?1")?
                .execute(params![policy_id])
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("policy {policy_id}")));
        }
        self.match_cache.lock().invalidate();
        Ok(())
    }

    // ---- Policy matching ----

    fn fingerprint(&self, threat: &ThreatMetadata) -> u64 {
        let key = format!(
            "{}|{}|{}|{}",
            threat.url, threat.filename, threat.mime_type, threat.file_hash
        );
        self.hash_state.hash_one(key)
    }

    /// Priority-ordered match: file hash, then URL pattern, then bare rule
    /// name. Hot lookups go through the fingerprint LRU; a cached policy id
    /// is revalidated against the database before being trusted, since the
    /// fingerprint is a non-cryptographic hash and rows can be deleted or
    /// expire underneath the cache.
    pub fn match_policy(&self, threat: &ThreatMetadata) -> Result<Option<Policy>, StoreError> {
        InputValidator::validate_threat_metadata(threat)?;

        let fingerprint = self.fingerprint(threat);
        let now = now_ms();

        let cached = self.match_cache.lock().get(&fingerprint).copied();
        match cached {
            Some(None) => return Ok(None),
            Some(Some(policy_id)) => match self.get_policy(policy_id) {
                Ok(policy) if policy.expires_at_ms.map_or(true, |e| e > now) => {
                    self.record_hit(policy_id, now)?;
                    return Ok(Some(policy));
                }
                Ok(_) | Err(StoreError::NotFound(_)) => {
                    // Row gone or expired: evict and fall through to re-match.
                    self.match_cache.lock().remove(&fingerprint);
                }
                Err(e) => return Err(e),
            },
            None => {}
        }

        let matched = self.run_match_ladder(threat, now)?;
        match &matched {
            Some(policy) => {
                self.record_hit(policy.id, now)?;
                self.match_cache.lock().put(fingerprint, Some(policy.id));
            }
            None => {
                self.match_cache.lock().put(fingerprint, None);
            }
        }
        Ok(matched)
    }

    fn run_match_ladder(&self, threat: &ThreatMetadata, now: i64) -> Result<Option<Policy>, StoreError> {
        // Stage 1: exact file hash.
        if !threat.file_hash.is_empty() {
            let hit = self.with_db(|conn| {
                conn.prepare_cached(
                    r#"SELECT * FROM policies
                       WHERE file_hash = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                       LIMIT 1"#,
                )?
                .query_row(params![threat.file_hash, now], policy_from_row)
                .optional()
            })?;
            if hit.is_some() {
                return Ok(hit);
            }
        }

        // Stage 2: URL pattern (LIKE with explicit escape; the stored
        // pattern passed charset validation on the way in).
        let hit = self.with_db(|conn| {
            conn.prepare_cached(
                r#"SELECT * FROM policies
                   WHERE url_pattern IS NOT NULL AND url_pattern != ''
                     AND ?1 LIKE url_pattern ESCAPE '\'
                     AND (expires_at IS NULL OR expires_at > ?2)
                   LIMIT 1"#,
            )?
            .query_row(params![threat.url, now], policy_from_row)
            .optional()
        })?;
        if hit.is_some() {
            return Ok(hit);
        }

        // Stage 3: bare rule name, only for policies with no hash/pattern.
        self.with_db(|conn| {
            conn.prepare_cached(
                r#"SELECT * FROM policies
                   WHERE rule_name = ?1
                     AND (file_hash IS NULL OR file_hash = '')
                     AND (url_pattern IS NULL OR url_pattern = '')
                     AND (expires_at IS NULL OR expires_at > ?2)
                   LIMIT 1"#,
            )?
            .query_row(params![threat.rule_name, now], policy_from_row)
            .optional()
        })
    }

    fn record_hit(&self, policy_id: i64, now: i64) -> Result<(), StoreError> {
        self.with_db(|conn| {
            conn.prepare_cached("UPDATE policies SET hit_count = hit_count + 1, last_hit = ?1 WHERE id = ?2")?
                .execute(params![now, policy_id])
        })?;
        Ok(())
    }

    // ---- Threat history ----

    pub fn record_threat(
        &self,
        threat: &ThreatMetadata,
        action_taken: &str,
        policy_id: Option<i64>,
        alert_json: &str,
    ) -> Result<i64, StoreError> {
        InputValidator::validate_threat_metadata(threat)?;
        self.with_db(|conn| {
            conn.prepare_cached(
                r#"INSERT INTO threat_history
                       (detected_at, url, filename, file_hash, mime_type, file_size,
                        rule_name, severity, action_taken, policy_id, alert_json)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            )?
            .execute(params![
                now_ms(),
                threat.url,
                threat.filename,
                threat.file_hash,
                threat.mime_type,
                threat.file_size,
                threat.rule_name,
                threat.severity,
                action_taken,
                policy_id,
                alert_json,
            ])?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_threat_history(&self, since_ms: Option<i64>) -> Result<Vec<ThreatRecord>, StoreError> {
        self.with_db(|conn| match since_ms {
            Some(since) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT * FROM threat_history WHERE detected_at >= ?1 ORDER BY detected_at DESC",
                )?;
                let rows = stmt.query_map(params![since], threat_record_from_row)?;
                rows.collect()
            }
            None => {
                let mut stmt =
                    conn.prepare_cached("SELECT * FROM threat_history ORDER BY detected_at DESC")?;
                let rows = stmt.query_map([], threat_record_from_row)?;
                rows.collect()
            }
        })
    }

    pub fn get_threats_by_rule(&self, rule_name: &str) -> Result<Vec<ThreatRecord>, StoreError> {
        InputValidator::validate_rule_name(rule_name)?;
        self.with_db(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM threat_history WHERE rule_name = ?1 ORDER BY detected_at DESC",
            )?;
            let rows = stmt.query_map(params![rule_name], threat_record_from_row)?;
            rows.collect()
        })
    }

    pub fn policy_count(&self) -> Result<u64, StoreError> {
        self.with_db(|conn| {
            conn.prepare_cached("SELECT COUNT(*) FROM policies")?
                .query_row([], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    pub fn threat_count(&self) -> Result<u64, StoreError> {
        self.with_db(|conn| {
            conn.prepare_cached("SELECT COUNT(*) FROM threat_history")?
                .query_row([], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    // ---- Verdict cache ----

    /// Returns `None` when absent **or** expired; expired rows are left
    /// for `cleanup` / overwrite rather than deleted on the read path.
    pub fn lookup_sandbox_verdict(&self, file_hash: &str) -> Result<Option<SandboxVerdictRow>, StoreError> {
        InputValidator::validate_file_hash(file_hash)?;
        let row = self.with_db(|conn| {
            conn.prepare_cached("SELECT * FROM sandbox_verdicts WHERE file_hash = ?1")?
                .query_row(params![file_hash], verdict_from_row)
                .optional()
        })?;

        Ok(row.filter(|v| v.expires_at_ms > now_ms()))
    }

    /// Upserts the verdict; `expires_at` is derived from the threat level
    /// TTL table, overriding whatever the caller put in the row.
    pub fn store_sandbox_verdict(&self, verdict: &SandboxVerdictRow) -> Result<(), StoreError> {
        InputValidator::validate_file_hash(&verdict.file_hash)?;
        if verdict.file_hash.is_empty() {
            return Err(StoreError::InvalidInput("verdict requires a file hash".into()));
        }

        let expires_at = verdict.analyzed_at_ms + verdict_ttl_ms(verdict.threat_level);
        let triggered = serde_json::to_string(&verdict.triggered_rules).unwrap_or_else(|_| "[]".into());
        let behaviors = serde_json::to_string(&verdict.detected_behaviors).unwrap_or_else(|_| "[]".into());

        self.with_db(|conn| {
            conn.prepare_cached(
                r#"INSERT INTO sandbox_verdicts
                       (file_hash, threat_level, confidence, composite_score, yara_score,
                        ml_score, behavioral_score, verdict_explanation, triggered_rules,
                        detected_behaviors, analyzed_at, expires_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                   ON CONFLICT(file_hash) DO UPDATE SET
                       threat_level = excluded.threat_level,
                       confidence = excluded.confidence,
                       composite_score = excluded.composite_score,
                       yara_score = excluded.yara_score,
                       ml_score = excluded.ml_score,
                       behavioral_score = excluded.behavioral_score,
                       verdict_explanation = excluded.verdict_explanation,
                       triggered_rules = excluded.triggered_rules,
                       detected_behaviors = excluded.detected_behaviors,
                       analyzed_at = excluded.analyzed_at,
                       expires_at = excluded.expires_at"#,
            )?
            .execute(params![
                verdict.file_hash,
                verdict.threat_level,
                verdict.confidence,
                verdict.composite_score,
                verdict.yara_score,
                verdict.ml_score,
                verdict.behavioral_score,
                verdict.verdict_explanation,
                triggered,
                behaviors,
                verdict.analyzed_at_ms,
                expires_at,
            ])?;
            Ok(())
        })
    }

    pub fn invalidate_verdict(&self, file_hash: &str) -> Result<(), StoreError> {
        InputValidator::validate_file_hash(file_hash)?;
        self.with_db(|conn| {
            conn.prepare_cached("DELETE FROM sandbox_verdicts WHERE file_hash = ?1")?
                .execute(params![file_hash])?;
            Ok(())
        })
    }

    pub fn clear_verdict_cache(&self) -> Result<(), StoreError> {
        self.with_db(|conn| {
            conn.execute("DELETE FROM sandbox_verdicts", [])?;
            Ok(())
        })
    }

    // ---- Quarantine records ----

    pub fn insert_quarantine_record(&self, record: &QuarantineRecord) -> Result<i64, StoreError> {
        let result = self.with_db(|conn| {
            conn.prepare_cached(
                r#"INSERT INTO quarantine_records
                       (original_path, quarantine_path, quarantine_reason, threat_score,
                        threat_level, quarantined_at, file_size, sha256_hash)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            )?
            .execute(params![
                record.original_path,
                record.quarantine_path,
                record.quarantine_reason,
                record.threat_score,
                record.threat_level as i32,
                record.quarantined_at_ms,
                record.file_size,
                record.sha256_hash,
            ])?;
            Ok(conn.last_insert_rowid())
        });

        match result {
            Err(StoreError::Database(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Conflict(format!(
                    "file already quarantined (hash {})",
                    record.sha256_hash
                )))
            }
            other => other,
        }
    }

    pub fn get_quarantine_record(&self, id: i64) -> Result<QuarantineRecord, StoreError> {
        let record = self.with_db(|conn| {
            conn.prepare_cached("SELECT * FROM quarantine_records WHERE id = ?1")?
                .query_row(params![id], quarantine_from_row)
                .optional()
        })?;
        record.ok_or_else(|| StoreError::NotFound(format!("quarantine record {id}")))
    }

    pub fn quarantine_record_by_hash(&self, sha256_hash: &str) -> Result<Option<QuarantineRecord>, StoreError> {
        InputValidator::validate_file_hash(sha256_hash)?;
        self.with_db(|conn| {
            conn.prepare_cached("SELECT * FROM quarantine_records WHERE sha256_hash = ?1")?
                .query_row(params![sha256_hash], quarantine_from_row)
                .optional()
        })
    }

    pub fn list_quarantine_records(
        &self,
        threat_level_filter: Option<i32>,
    ) -> Result<Vec<QuarantineRecord>, StoreError> {
        self.with_db(|conn| match threat_level_filter {
            Some(level) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT * FROM quarantine_records WHERE threat_level = ?1 ORDER BY quarantined_at DESC",
                )?;
                let rows = stmt.query_map(params![level], quarantine_from_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn
                    .prepare_cached("SELECT * FROM quarantine_records ORDER BY quarantined_at DESC")?;
                let rows = stmt.query_map([], quarantine_from_row)?;
                rows.collect()
            }
        })
    }

    pub fn delete_quarantine_record(&self, id: i64) -> Result<(), StoreError> {
        let changed = self.with_db(|conn| {
            conn.prepare_cached("DELETE FROM quarantine_records WHERE id = ?1")?
                .execute(params![id])
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("quarantine record {id}")));
        }
        Ok(())
    }

    // ---- Network behavior policies ----

    pub fn upsert_network_behavior(&self, policy: &NetworkBehaviorPolicy) -> Result<i64, StoreError> {
        InputValidator::validate_domain(&policy.domain)?;
        if policy.confidence < 0 || policy.confidence > 1000 {
            return Err(StoreError::InvalidInput("confidence must be 0..=1000".into()));
        }

        self.with_db(|conn| {
            conn.prepare_cached(
                r#"INSERT INTO network_behavior_policies
                       (domain, threat_type, policy, confidence, notes, created_at, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                   ON CONFLICT(domain, threat_type) DO UPDATE SET
                       policy = excluded.policy,
                       confidence = excluded.confidence,
                       notes = excluded.notes,
                       updated_at = excluded.updated_at"#,
            )?
            .execute(params![
                policy.domain,
                policy.threat_type,
                policy.policy,
                policy.confidence,
                policy.notes,
                now_ms(),
            ])?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_network_behavior(
        &self,
        domain: &str,
        threat_type: &str,
    ) -> Result<Option<NetworkBehaviorPolicy>, StoreError> {
        InputValidator::validate_domain(domain)?;
        self.with_db(|conn| {
            conn.prepare_cached(
                "SELECT * FROM network_behavior_policies WHERE domain = ?1 AND threat_type = ?2",
            )?
            .query_row(params![domain, threat_type], network_behavior_from_row)
            .optional()
        })
    }

    pub fn list_network_behaviors(&self) -> Result<Vec<NetworkBehaviorPolicy>, StoreError> {
        self.with_db(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT * FROM network_behavior_policies ORDER BY updated_at DESC")?;
            let rows = stmt.query_map([], network_behavior_from_row)?;
            rows.collect()
        })
    }

    pub fn delete_network_behavior(&self, domain: &str, threat_type: &str) -> Result<(), StoreError> {
        let changed = self.with_db(|conn| {
            conn.prepare_cached(
                "DELETE FROM network_behavior_policies WHERE domain = ?1 AND threat_type = ?2",
            )?
            .execute(params![domain, threat_type])
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("network behavior {domain}/{threat_type}")));
        }
        Ok(())
    }

    // ---- Credential relationships ----

    pub fn create_credential_relationship(
        &self,
        relationship: &CredentialRelationship,
    ) -> Result<i64, StoreError> {
        InputValidator::validate_domain(&relationship.primary_origin)?;
        InputValidator::validate_domain(&relationship.related_origin)?;

        self.with_db(|conn| {
            conn.prepare_cached(
                r#"INSERT INTO credential_relationships
                       (primary_origin, related_origin, relation, notes, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5)
                   ON CONFLICT(primary_origin, related_origin) DO UPDATE SET
                       relation = excluded.relation,
                       notes = excluded.notes"#,
            )?
            .execute(params![
                relationship.primary_origin,
                relationship.related_origin,
                relationship.relation,
                relationship.notes,
                now_ms(),
            ])?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn list_credential_relationships(&self) -> Result<Vec<CredentialRelationship>, StoreError> {
        self.with_db(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT * FROM credential_relationships ORDER BY created_at DESC")?;
            let rows = stmt.query_map([], credential_from_row)?;
            rows.collect()
        })
    }

    pub fn delete_credential_relationship(&self, id: i64) -> Result<(), StoreError> {
        let changed = self.with_db(|conn| {
            conn.prepare_cached("DELETE FROM credential_relationships WHERE id = ?1")?
                .execute(params![id])
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("credential relationship {id}")));
        }
        Ok(())
    }

    // ---- Policy templates ----

    pub fn insert_template(&self, template: &PolicyTemplate) -> Result<i64, StoreError> {
        InputValidator::validate_rule_name(&template.name)?;
        self.with_db(|conn| {
            conn.prepare_cached(
                r#"INSERT INTO policy_templates (name, description, category, is_builtin, body)
                   VALUES (?1, ?2, ?3, ?4, ?5)
                   ON CONFLICT(name) DO UPDATE SET
                       description = excluded.description,
                       category = excluded.category,
                       body = excluded.body"#,
            )?
            .execute(params![
                template.name,
                template.description,
                template.category,
                template.is_builtin as i32,
                template.body,
            ])?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_template(&self, name: &str) -> Result<PolicyTemplate, StoreError> {
        let template = self.with_db(|conn| {
            conn.prepare_cached("SELECT * FROM policy_templates WHERE name = ?1")?
                .query_row(params![name], template_from_row)
                .optional()
        })?;
        template.ok_or_else(|| StoreError::NotFound(format!("template '{name}'")))
    }

    pub fn list_templates(&self) -> Result<Vec<PolicyTemplate>, StoreError> {
        self.with_db(|conn| {
            let mut stmt = conn.prepare_cached("SELECT * FROM policy_templates ORDER BY name")?;
            let rows = stmt.query_map([], template_from_row)?;
            rows.collect()
        })
    }

    pub fn delete_template(&self, name: &str) -> Result<(), StoreError> {
        let changed = self.with_db(|conn| {
            conn.prepare_cached("DELETE FROM policy_templates WHERE name = ?1 AND is_builtin = 0")?
                .execute(params![name])
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("template '{name}'")));
        }
        Ok(())
    }

    // ---- Maintenance ----

    pub fn cleanup_expired_policies(&self) -> Result<usize, StoreError> {
        let removed = self.with_db(|conn| {
            conn.prepare_cached(
                "DELETE FROM policies WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            )?
            .execute(params![now_ms()])
        })?;
        if removed > 0 {
            self.match_cache.lock().invalidate();
            info!("removed {removed} expired policies");
        }
        Ok(removed)
    }

    pub fn cleanup_old_threats(&self, days_to_keep: i64) -> Result<usize, StoreError> {
        let cutoff = now_ms() - days_to_keep * 24 * 60 * 60 * 1000;
        self.with_db(|conn| {
            conn.prepare_cached("DELETE FROM threat_history WHERE detected_at < ?1")?
                .execute(params![cutoff])
        })
    }

    pub fn cleanup_expired_verdicts(&self) -> Result<usize, StoreError> {
        self.with_db(|conn| {
            conn.prepare_cached("DELETE FROM sandbox_verdicts WHERE expires_at <= ?1")?
                .execute(params![now_ms()])
        })
    }

    pub fn vacuum_database(&self) -> Result<(), StoreError> {
        self.with_db(|conn| conn.execute_batch("VACUUM"))
    }

    /// Full integrity check. A failure flips the health flag; scoring
    /// continues best-effort while health endpoints report the corruption.
    pub fn verify_database_integrity(&self) -> Result<(), StoreError> {
        let verdict: String = self.with_db(|conn| {
            conn.prepare_cached("PRAGMA integrity_check")?
                .query_row([], |row| row.get(0))
        })?;

        if verdict == "ok" {
            self.database_healthy.store(true, Ordering::Relaxed);
            Ok(())
        } else {
            self.database_healthy.store(false, Ordering::Relaxed);
            Err(StoreError::Corruption(verdict))
        }
    }

    /// Cheap liveness probe; does not run a full integrity check.
    pub fn is_database_healthy(&self) -> bool {
        if !self.database_healthy.load(Ordering::Relaxed) {
            return false;
        }
        self.with_db(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .is_ok()
    }

    // ---- Metrics ----

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.match_cache.lock().metrics()
    }

    pub fn reset_cache_metrics(&self) {
        self.match_cache.lock().reset_metrics();
    }

    pub fn breaker_metrics(&self) -> BreakerMetrics {
        self.breaker.metrics()
    }

    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }
}

// ---- Row mappers ----

fn policy_from_row(row: &Row<'_>) -> rusqlite::Result<Policy> {
    let action_str: String = row.get("action")?;
    let match_type_str: String = row.get("match_type")?;
    let url_pattern: Option<String> = row.get("url_pattern")?;
    let file_hash: Option<String> = row.get("file_hash")?;
    let mime_type: Option<String> = row.get("mime_type")?;

    Ok(Policy {
        id: row.get("id")?,
        rule_name: row.get("rule_name")?,
        url_pattern: url_pattern.filter(|s| !s.is_empty()),
        file_hash: file_hash.filter(|s| !s.is_empty()),
        mime_type: mime_type.filter(|s| !s.is_empty()),
        action: PolicyAction::parse(&action_str).unwrap_or(PolicyAction::Block),
        match_type: PolicyMatchType::parse(&match_type_str)
            .unwrap_or(PolicyMatchType::DownloadOriginFileType),
        enforcement_action: row.get("enforcement_action")?,
        created_at_ms: row.get("created_at")?,
        created_by: row.get("created_by")?,
        expires_at_ms: row.get("expires_at")?,
        hit_count: row.get("hit_count")?,
        last_hit_ms: row.get("last_hit")?,
    })
}

fn threat_record_from_row(row: &Row<'_>) -> rusqlite::Result<ThreatRecord> {
    Ok(ThreatRecord {
        id: row.get("id")?,
        detected_at_ms: row.get("detected_at")?,
        url: row.get("url")?,
        filename: row.get("filename")?,
        file_hash: row.get("file_hash")?,
        mime_type: row.get::<_, Option<String>>("mime_type")?.unwrap_or_default(),
        file_size: row.get::<_, i64>("file_size")? as u64,
        rule_name: row.get("rule_name")?,
        severity: row.get("severity")?,
        action_taken: row.get("action_taken")?,
        policy_id: row.get("policy_id")?,
        alert_json: row.get("alert_json")?,
    })
}

fn verdict_from_row(row: &Row<'_>) -> rusqlite::Result<SandboxVerdictRow> {
    let triggered: String = row.get("triggered_rules")?;
    let behaviors: String = row.get("detected_behaviors")?;
    Ok(SandboxVerdictRow {
        file_hash: row.get("file_hash")?,
        threat_level: row.get("threat_level")?,
        confidence: row.get("confidence")?,
        composite_score: row.get("composite_score")?,
        yara_score: row.get("yara_score")?,
        ml_score: row.get("ml_score")?,
        behavioral_score: row.get("behavioral_score")?,
        verdict_explanation: row.get("verdict_explanation")?,
        triggered_rules: serde_json::from_str(&triggered).unwrap_or_default(),
        detected_behaviors: serde_json::from_str(&behaviors).unwrap_or_default(),
        analyzed_at_ms: row.get("analyzed_at")?,
        expires_at_ms: row.get("expires_at")?,
    })
}

fn quarantine_from_row(row: &Row<'_>) -> rusqlite::Result<QuarantineRecord> {
    Ok(QuarantineRecord {
        id: row.get("id")?,
        original_path: row.get("original_path")?,
        quarantine_path: row.get("quarantine_path")?,
        quarantine_reason: row.get("quarantine_reason")?,
        threat_score: row.get("threat_score")?,
        threat_level: crate::sandbox::ThreatLevel::from_i32(row.get("threat_level")?),
        quarantined_at_ms: row.get("quarantined_at")?,
        file_size: row.get::<_, i64>("file_size")? as u64,
        sha256_hash: row.get("sha256_hash")?,
    })
}

fn network_behavior_from_row(row: &Row<'_>) -> rusqlite::Result<NetworkBehaviorPolicy> {
    Ok(NetworkBehaviorPolicy {
        id: row.get("id")?,
        domain: row.get("domain")?,
        threat_type: row.get("threat_type")?,
        policy: row.get("policy")?,
        confidence: row.get("confidence")?,
        notes: row.get("notes")?,
        created_at_ms: row.get("created_at")?,
        updated_at_ms: row.get("updated_at")?,
    })
}

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<PolicyTemplate> {
    Ok(PolicyTemplate {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        category: row.get("category")?,
        is_builtin: row.get::<_, i64>("is_builtin")? != 0,
        body: row.get("body")?,
    })
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<CredentialRelationship> {
    Ok(CredentialRelationship {
        id: row.get("id")?,
        primary_origin: row.get("primary_origin")?,
        related_origin: row.get("related_origin")?,
        relation: row.get("relation")?,
        notes: row.get("notes")?,
        created_at_ms: row.get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, PolicyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn schema_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let _first = PolicyStore::open(dir.path()).unwrap();
        let second = PolicyStore::open(dir.path());
        assert!(second.is_ok());
    }

    #[test]
    fn match_cache_caches_both_hits_and_misses() {
        let (_dir, store) = open_store();

        let mut policy = Policy::new("hash-rule", PolicyAction::Block);
        policy.file_hash = Some("ab".repeat(32));
        store.create_policy(&policy).unwrap();

        let threat = ThreatMetadata {
            file_hash: "ab".repeat(32),
            url: "https://x/y".into(),
            ..Default::default()
        };

        // First match goes to the database, second is served via the
        // fingerprint cache (still revalidated against the row).
        assert!(store.match_policy(&threat).unwrap().is_some());
        let before = store.cache_metrics();
        assert!(store.match_policy(&threat).unwrap().is_some());
        let after = store.cache_metrics();
        assert_eq!(after.hits, before.hits + 1);

        let miss = ThreatMetadata {
            url: "https://nowhere/else".into(),
            ..Default::default()
        };
        assert!(store.match_policy(&miss).unwrap().is_none());
        assert!(store.match_policy(&miss).unwrap().is_none());
    }

    #[test]
    fn cached_policy_id_is_revalidated_after_delete() {
        let (_dir, store) = open_store();

        let mut policy = Policy::new("volatile", PolicyAction::Block);
        policy.file_hash = Some("cd".repeat(32));
        let id = store.create_policy(&policy).unwrap();

        let threat = ThreatMetadata {
            file_hash: "cd".repeat(32),
            ..Default::default()
        };
        assert!(store.match_policy(&threat).unwrap().is_some());

        store.delete_policy(id).unwrap();
        assert!(store.match_policy(&threat).unwrap().is_none());
    }

    #[test]
    fn database_health_probe() {
        let (_dir, store) = open_store();
        assert!(store.is_database_healthy());
        store.verify_database_integrity().unwrap();
        assert!(store.is_database_healthy());
    }
}
