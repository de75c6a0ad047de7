//! Sentinel: a local security service embedded in the browser.
//!
//! Classifies downloaded files and observed network/form activity as
//! clean, suspicious, malicious, or critical, persists user-governed
//! policies that decide future verdicts automatically, and keeps
//! neutralized files in an encrypted quarantine vault. A companion UI
//! talks to the service over a local stream socket.
//!
//! Designed for a single-thread Tokio runtime:
//! `#[tokio::main(flavor = "current_thread")]`. Scans and sandbox waits
//! are cooperative suspension points; shared component state is guarded
//! by short-lived mutexes so worker completions can cross back onto the
//! event loop safely.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

pub mod cache;
pub mod filter;
pub mod guard;
pub mod health;
pub mod policy;
pub mod quarantine;
pub mod sandbox;
pub mod server;
pub mod util;

use crate::filter::{FeedError, ThreatFeed};
use crate::guard::{ClientLimits, ClientRateLimiter};
use crate::health::{ComponentHealth, DegradationRegistry, HealthRegistry};
use crate::policy::{PolicyStore, StoreError};
use crate::quarantine::{QuarantineVault, VaultError};
use crate::sandbox::{Orchestrator, SandboxConfig, SandboxError};
use crate::server::{RequestRouter, SentinelServer, ServerError};

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("policy store error: {0}")]
    Store(#[from] StoreError),
    #[error("quarantine error: {0}")]
    Vault(#[from] VaultError),
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("threat feed error: {0}")]
    Feed(#[from] FeedError),
    #[error("server error: {0}")]
    Server(#[from] ServerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SentinelError>;

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub socket_path: PathBuf,
    /// Policy database directory (created 0700).
    pub data_dir: PathBuf,
    /// Encrypted vault directory (created 0700).
    pub quarantine_dir: PathBuf,
    pub sandbox: SandboxConfig,
    pub client_limits: ClientLimits,
    pub health_check_interval: Duration,
    /// Smaller bloom filters keep test and embedded deployments light.
    pub threat_filter_bits: u64,
    pub threat_filter_hashes: u32,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"));
        Self {
            socket_path: PathBuf::from("/tmp/sentinel.sock"),
            data_dir: home.join(".cache/sentinel"),
            quarantine_dir: home.join(".local/share/sentinel/quarantine"),
            sandbox: SandboxConfig::default(),
            client_limits: ClientLimits::default(),
            health_check_interval: Duration::from_secs(30),
            threat_filter_bits: filter::FILTER_SIZE_BITS,
            threat_filter_hashes: filter::FILTER_NUM_HASHES,
        }
    }
}

/// The assembled service: every core component wired together plus the
/// socket front end. Construction is synchronous; `run` drives the
/// accept loop until cancelled.
pub struct Sentinel {
    config: SentinelConfig,
    store: Arc<PolicyStore>,
    orchestrator: Arc<Orchestrator>,
    vault: Arc<QuarantineVault>,
    health: Arc<HealthRegistry>,
    degradation: Arc<DegradationRegistry>,
    server: SentinelServer,
}

impl Sentinel {
    pub fn new(config: SentinelConfig) -> Result<Self> {
        let store = Arc::new(PolicyStore::open(&config.data_dir)?);
        if let Err(e) = policy::seed_builtin_templates(&store) {
            warn!("failed to seed builtin templates: {e}");
        }

        let vault = Arc::new(QuarantineVault::open(&config.quarantine_dir, store.clone())?);
        let orchestrator = Arc::new(Orchestrator::new(config.sandbox.clone(), Some(store.clone())));
        let threat_feed = Arc::new(Mutex::new(ThreatFeed::with_filter_params(
            config.threat_filter_bits,
            config.threat_filter_hashes,
        )?));

        let health = Arc::new(HealthRegistry::new());
        let degradation = Arc::new(DegradationRegistry::new());
        let rate_limiter = Arc::new(ClientRateLimiter::new(config.client_limits));

        let router = Arc::new(RequestRouter::new(
            store.clone(),
            orchestrator.clone(),
            vault.clone(),
            health.clone(),
            degradation.clone(),
            rate_limiter,
            threat_feed,
        ));
        let server = SentinelServer::new(router, config.socket_path.clone());

        let sentinel = Self {
            config,
            store,
            orchestrator,
            vault,
            health,
            degradation,
            server,
        };
        sentinel.register_health_checks();
        Ok(sentinel)
    }

    fn register_health_checks(&self) {
        let store = self.store.clone();
        self.health.register_check(
            "database",
            Box::new(move || {
                if store.is_database_healthy() {
                    ComponentHealth::healthy("database").with_details(serde_json::json!({
                        "policies": store.policy_count().unwrap_or(0),
                        "threats": store.threat_count().unwrap_or(0),
                    }))
                } else {
                    ComponentHealth::unhealthy("database", "health probe failed")
                }
            }),
        );

        // The heuristic scorer has no external dependency; the probe
        // exists so readiness semantics stay uniform.
        self.health
            .register_check("scorer", Box::new(|| ComponentHealth::healthy("scorer")));

        let vault_dir = self.vault.directory().to_path_buf();
        self.health.register_check(
            "quarantine",
            Box::new(move || {
                if vault_dir.is_dir() {
                    ComponentHealth::healthy("quarantine")
                } else {
                    ComponentHealth::unhealthy("quarantine", "vault directory missing")
                }
            }),
        );

        let data_dir = self.config.data_dir.clone();
        self.health.register_check(
            "disk",
            Box::new(move || {
                let probe = data_dir.join(".health-probe");
                match std::fs::write(&probe, b"ok") {
                    Ok(()) => {
                        let _ = std::fs::remove_file(&probe);
                        ComponentHealth::healthy("disk")
                    }
                    Err(e) => ComponentHealth::unhealthy("disk", format!("data dir not writable: {e}")),
                }
            }),
        );

        self.health.register_check(
            "memory",
            Box::new(|| match resident_memory_bytes() {
                Some(bytes) => ComponentHealth::healthy("memory")
                    .with_details(serde_json::json!({ "resident_bytes": bytes })),
                None => ComponentHealth::degraded("memory", "resident size unavailable"),
            }),
        );

        let active = self.server.active_connections();
        self.health.register_check(
            "ipc",
            Box::new(move || {
                ComponentHealth::healthy("ipc").with_details(serde_json::json!({
                    "active_connections": active.load(std::sync::atomic::Ordering::Relaxed),
                }))
            }),
        );
    }

    /// Serve until cancelled. Also starts periodic health checks and the
    /// daily maintenance sweep.
    pub async fn run(&self) -> Result<()> {
        self.health.clone().start_periodic_checks(self.config.health_check_interval);
        self.start_maintenance_task();

        info!("sentinel service starting on {}", self.config.socket_path.display());
        self.server.run().await?;
        Ok(())
    }

    fn start_maintenance_task(&self) {
        let store = self.store.clone();
        let vault = self.vault.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.cleanup_expired_policies() {
                    warn!("expired-policy cleanup failed: {e}");
                }
                if let Err(e) = store.cleanup_old_threats(30) {
                    warn!("threat-history cleanup failed: {e}");
                }
                if let Err(e) = store.cleanup_expired_verdicts() {
                    warn!("verdict-cache cleanup failed: {e}");
                }
                if let Err(e) = vault.cleanup_expired(quarantine::DEFAULT_RETENTION) {
                    warn!("quarantine cleanup failed: {e}");
                }
            }
        });
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn vault(&self) -> &Arc<QuarantineVault> {
        &self.vault
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn degradation(&self) -> &Arc<DegradationRegistry> {
        &self.degradation
    }
}

/// VmRSS from /proc on Linux; other platforms report `None`.
fn resident_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
                return Some(kb * 1024);
            }
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
