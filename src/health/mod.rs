pub mod degradation;

pub use degradation::*;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::util::now_ms;

/// Components whose failure blocks readiness.
const CRITICAL_COMPONENTS: &[&str] = &["database", "scorer", "quarantine"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    fn worst(a: HealthStatus, b: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (a, b) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component_name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_ms: i64,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            component_name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            last_check_ms: now_ms(),
            response_time_ms: 0,
            details: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            ..Self::healthy(name)
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            ..Self::healthy(name)
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub timestamp_ms: i64,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
    pub metrics: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivenessProbe {
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessProbe {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub blocking_components: Vec<String>,
}

pub type HealthCheckFn = Box<dyn Fn() -> ComponentHealth + Send + Sync>;

#[derive(Default)]
struct HealthCounters {
    total_checks: i64,
    healthy_checks: i64,
    degraded_checks: i64,
    unhealthy_checks: i64,
}

/// Pluggable per-component health probes with aggregate reporting,
/// liveness/readiness semantics, cached results, and Prometheus text
/// rendering.
pub struct HealthRegistry {
    checks: Mutex<HashMap<String, HealthCheckFn>>,
    cached_results: Mutex<HashMap<String, ComponentHealth>>,
    last_report: Mutex<Option<HealthReport>>,
    counters: Mutex<HealthCounters>,
    startup: Instant,
    periodic_running: AtomicBool,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            checks: Mutex::new(HashMap::new()),
            cached_results: Mutex::new(HashMap::new()),
            last_report: Mutex::new(None),
            counters: Mutex::new(HealthCounters::default()),
            startup: Instant::now(),
            periodic_running: AtomicBool::new(false),
        }
    }

    pub fn register_check(&self, name: impl Into<String>, check: HealthCheckFn) {
        let name = name.into();
        debug!("registered health check '{name}'");
        self.checks.lock().insert(name, check);
    }

    pub fn unregister_check(&self, name: &str) {
        self.checks.lock().remove(name);
        self.cached_results.lock().remove(name);
    }

    pub fn check_component(&self, name: &str) -> Option<ComponentHealth> {
        let checks = self.checks.lock();
        let check = checks.get(name)?;

        let started = Instant::now();
        let mut health = check();
        health.response_time_ms = started.elapsed().as_millis() as u64;
        health.last_check_ms = now_ms();
        drop(checks);

        {
            let mut counters = self.counters.lock();
            counters.total_checks += 1;
            match health.status {
                HealthStatus::Healthy => counters.healthy_checks += 1,
                HealthStatus::Degraded => counters.degraded_checks += 1,
                HealthStatus::Unhealthy => counters.unhealthy_checks += 1,
            }
        }

        self.cached_results.lock().insert(name.to_string(), health.clone());
        Some(health)
    }

    /// Run every registered probe and aggregate the worst status.
    pub fn check_all(&self) -> HealthReport {
        let names: Vec<String> = self.checks.lock().keys().cloned().collect();

        let mut components = Vec::with_capacity(names.len());
        let mut overall = HealthStatus::Healthy;
        for name in names {
            if let Some(health) = self.check_component(&name) {
                overall = HealthStatus::worst(overall, health.status);
                components.push(health);
            }
        }
        components.sort_by(|a, b| a.component_name.cmp(&b.component_name));

        let report = HealthReport {
            overall_status: overall,
            timestamp_ms: now_ms(),
            uptime_seconds: self.uptime().as_secs(),
            components,
            metrics: self.metrics(),
        };

        if overall != HealthStatus::Healthy {
            warn!("health check aggregate: {}", overall.as_str());
        }

        *self.last_report.lock() = Some(report.clone());
        report
    }

    /// Liveness is about the process itself: if we can answer, we are
    /// alive, regardless of dependency state.
    pub fn check_liveness(&self) -> LivenessProbe {
        LivenessProbe {
            alive: true,
            reason: None,
        }
    }

    /// Readiness fails only when a critical component is Unhealthy.
    pub fn check_readiness(&self) -> ReadinessProbe {
        let report = self.check_all();

        let blocking: Vec<String> = report
            .components
            .iter()
            .filter(|c| {
                c.status == HealthStatus::Unhealthy
                    && CRITICAL_COMPONENTS.contains(&c.component_name.as_str())
            })
            .map(|c| c.component_name.clone())
            .collect();

        if blocking.is_empty() {
            ReadinessProbe {
                ready: true,
                reason: None,
                blocking_components: Vec::new(),
            }
        } else {
            ReadinessProbe {
                ready: false,
                reason: Some(format!("critical components unhealthy: {}", blocking.join(", "))),
                blocking_components: blocking,
            }
        }
    }

    pub fn cached_result(&self, name: &str) -> Option<ComponentHealth> {
        self.cached_results.lock().get(name).cloned()
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report.lock().clone()
    }

    pub fn clear_cache(&self) {
        self.cached_results.lock().clear();
        *self.last_report.lock() = None;
    }

    pub fn uptime(&self) -> Duration {
        self.startup.elapsed()
    }

    pub fn metrics(&self) -> HashMap<String, i64> {
        let counters = self.counters.lock();
        let mut metrics = HashMap::new();
        metrics.insert("sentinel_health_checks_total".to_string(), counters.total_checks);
        metrics.insert("sentinel_health_checks_healthy".to_string(), counters.healthy_checks);
        metrics.insert("sentinel_health_checks_degraded".to_string(), counters.degraded_checks);
        metrics.insert("sentinel_health_checks_unhealthy".to_string(), counters.unhealthy_checks);
        metrics.insert(
            "sentinel_registered_components".to_string(),
            self.checks.lock().len() as i64,
        );
        metrics.insert("sentinel_uptime_seconds".to_string(), self.uptime().as_secs() as i64);
        metrics
    }

    /// Prometheus text exposition: `# HELP` / `# TYPE` / value triplets.
    pub fn prometheus_format(&self) -> String {
        let report = self.last_report().unwrap_or_else(|| self.check_all());

        let mut out = String::new();
        out.push_str("# HELP sentinel_health_status Overall health (0=healthy, 1=degraded, 2=unhealthy)\n");
        out.push_str("# TYPE sentinel_health_status gauge\n");
        let status_value = match report.overall_status {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        };
        out.push_str(&format!("sentinel_health_status {status_value}\n"));

        let mut metrics: Vec<(&String, &i64)> = report.metrics.iter().collect();
        metrics.sort_by_key(|(name, _)| name.as_str());
        for (name, value) in metrics {
            let kind = if name.ends_with("_total") { "counter" } else { "gauge" };
            out.push_str(&format!("# HELP {name} {name}\n"));
            out.push_str(&format!("# TYPE {name} {kind}\n"));
            out.push_str(&format!("{name} {value}\n"));
        }

        if !report.components.is_empty() {
            out.push_str("# HELP sentinel_component_health Per-component health status\n");
            out.push_str("# TYPE sentinel_component_health gauge\n");
            for component in &report.components {
                let value = match component.status {
                    HealthStatus::Healthy => 0,
                    HealthStatus::Degraded => 1,
                    HealthStatus::Unhealthy => 2,
                };
                out.push_str(&format!(
                    "sentinel_component_health{{component=\"{}\"}} {value}\n",
                    component.component_name
                ));
            }
        }

        out
    }

    /// Re-run all probes on an interval until the registry is dropped or
    /// `stop_periodic_checks` is called.
    pub fn start_periodic_checks(self: Arc<Self>, interval: Duration) {
        if self.periodic_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        if !registry.periodic_running.load(Ordering::SeqCst) {
                            break;
                        }
                        registry.check_all();
                    }
                    None => break,
                }
            }
        });
    }

    pub fn stop_periodic_checks(&self) {
        self.periodic_running.store(false, Ordering::SeqCst);
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_is_worst_of_probes() {
        let registry = HealthRegistry::new();
        registry.register_check("good", Box::new(|| ComponentHealth::healthy("good")));
        registry.register_check("meh", Box::new(|| ComponentHealth::degraded("meh", "slow")));

        let report = registry.check_all();
        assert_eq!(report.overall_status, HealthStatus::Degraded);
        assert_eq!(report.components.len(), 2);

        registry.register_check("bad", Box::new(|| ComponentHealth::unhealthy("bad", "down")));
        assert_eq!(registry.check_all().overall_status, HealthStatus::Unhealthy);
    }

    #[test]
    fn liveness_is_always_alive() {
        let registry = HealthRegistry::new();
        registry.register_check("database", Box::new(|| ComponentHealth::unhealthy("database", "gone")));
        assert!(registry.check_liveness().alive);
    }

    #[test]
    fn readiness_blocks_only_on_critical_components() {
        let registry = HealthRegistry::new();
        registry.register_check("disk", Box::new(|| ComponentHealth::unhealthy("disk", "full")));
        let probe = registry.check_readiness();
        assert!(probe.ready, "non-critical component must not block readiness");

        registry.register_check(
            "database",
            Box::new(|| ComponentHealth::unhealthy("database", "corrupt")),
        );
        let probe = registry.check_readiness();
        assert!(!probe.ready);
        assert_eq!(probe.blocking_components, vec!["database".to_string()]);
    }

    #[test]
    fn results_are_cached() {
        let registry = HealthRegistry::new();
        registry.register_check("c", Box::new(|| ComponentHealth::healthy("c")));
        assert!(registry.cached_result("c").is_none());
        registry.check_component("c");
        assert!(registry.cached_result("c").is_some());
        assert!(registry.last_report().is_none());
        registry.check_all();
        assert!(registry.last_report().is_some());
    }

    #[test]
    fn unregister_removes_probe_and_cache() {
        let registry = HealthRegistry::new();
        registry.register_check("x", Box::new(|| ComponentHealth::healthy("x")));
        registry.check_component("x");
        registry.unregister_check("x");
        assert!(registry.check_component("x").is_none());
        assert!(registry.cached_result("x").is_none());
    }

    #[test]
    fn prometheus_output_has_help_type_value_triplets() {
        let registry = HealthRegistry::new();
        registry.register_check("database", Box::new(|| ComponentHealth::healthy("database")));
        registry.check_all();

        let text = registry.prometheus_format();
        assert!(text.contains("# HELP sentinel_health_status"));
        assert!(text.contains("# TYPE sentinel_health_status gauge"));
        assert!(text.contains("sentinel_health_status 0"));
        assert!(text.contains("sentinel_component_health{component=\"database\"} 0"));
        assert!(text.contains("# TYPE sentinel_health_checks_total counter"));
    }

    #[test]
    fn metrics_track_check_outcomes() {
        let registry = HealthRegistry::new();
        registry.register_check("a", Box::new(|| ComponentHealth::healthy("a")));
        registry.register_check("b", Box::new(|| ComponentHealth::unhealthy("b", "x")));
        registry.check_all();

        let metrics = registry.metrics();
        assert_eq!(metrics["sentinel_health_checks_total"], 2);
        assert_eq!(metrics["sentinel_health_checks_healthy"], 1);
        assert_eq!(metrics["sentinel_health_checks_unhealthy"], 1);
        assert_eq!(metrics["sentinel_registered_components"], 2);
    }
}
