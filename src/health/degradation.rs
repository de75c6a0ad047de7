use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::util::now_ms;

/// Per-service state, escalating with repeated failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Healthy,
    Degraded,
    Failed,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Normal,
    Degraded,
    CriticalFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    None,
    UseCache,
    AllowWithWarning,
    SkipWithLog,
    RetryWithBackoff,
    QueueForRetry,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceFailure {
    pub service_name: String,
    pub state: ServiceState,
    pub failure_reason: String,
    pub failed_at_ms: i64,
    pub last_check_at_ms: i64,
    pub failure_count: u64,
    pub recovery_attempts: u64,
    pub fallback_strategy: FallbackStrategy,
    pub auto_recovery_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradationEvent {
    pub service_name: String,
    pub old_state: ServiceState,
    pub new_state: ServiceState,
    pub reason: String,
    pub timestamp_ms: i64,
}

pub type DegradationCallback = Box<dyn Fn(&DegradationEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DegradationMetrics {
    pub total_services: usize,
    pub healthy_services: usize,
    pub degraded_services: usize,
    pub failed_services: usize,
    pub critical_services: usize,
    pub total_failures: u64,
    pub total_recoveries: u64,
    pub system_level: DegradationLevel,
    pub last_failure_ms: Option<i64>,
    pub last_recovery_ms: Option<i64>,
}

/// Well-known service names, shared between callers so states line up.
pub mod services {
    pub const POLICY_STORE: &str = "policy-store";
    pub const DATABASE: &str = "database";
    pub const SCORER: &str = "scorer";
    pub const QUARANTINE: &str = "quarantine";
    pub const IPC_SERVER: &str = "ipc-server";
    pub const THREAT_FEED: &str = "threat-feed";
}

#[derive(Default)]
struct DegradationCounters {
    total_failures: u64,
    total_recoveries: u64,
    last_failure_ms: Option<i64>,
    last_recovery_ms: Option<i64>,
}

/// Tracks per-service health states, drives fallback behavior when
/// services fail, and notifies subscribers of every state change.
pub struct DegradationRegistry {
    services: Mutex<HashMap<String, ServiceFailure>>,
    callbacks: Mutex<Vec<DegradationCallback>>,
    counters: Mutex<DegradationCounters>,
    recovery_attempt_limit: u64,
}

impl DegradationRegistry {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            counters: Mutex::new(DegradationCounters::default()),
            recovery_attempt_limit: 5,
        }
    }

    pub fn set_service_state(
        &self,
        service_name: &str,
        state: ServiceState,
        reason: &str,
        fallback: FallbackStrategy,
    ) {
        let now = now_ms();
        let old_state;
        {
            let mut services = self.services.lock();
            let entry = services
                .entry(service_name.to_string())
                .or_insert_with(|| ServiceFailure {
                    service_name: service_name.to_string(),
                    state: ServiceState::Healthy,
                    failure_reason: String::new(),
                    failed_at_ms: 0,
                    last_check_at_ms: now,
                    failure_count: 0,
                    recovery_attempts: 0,
                    fallback_strategy: FallbackStrategy::None,
                    auto_recovery_enabled: true,
                });

            old_state = entry.state;
            entry.state = state;
            entry.failure_reason = reason.to_string();
            entry.last_check_at_ms = now;
            entry.fallback_strategy = fallback;
            if state > ServiceState::Healthy {
                entry.failure_count += 1;
                entry.failed_at_ms = now;
            }
        }

        if state > ServiceState::Healthy {
            let mut counters = self.counters.lock();
            counters.total_failures += 1;
            counters.last_failure_ms = Some(now);
        }

        if old_state != state {
            if state > old_state {
                warn!("service '{service_name}' degraded {old_state:?} -> {state:?}: {reason}");
            } else {
                info!("service '{service_name}' improved {old_state:?} -> {state:?}");
            }
            self.notify(DegradationEvent {
                service_name: service_name.to_string(),
                old_state,
                new_state: state,
                reason: reason.to_string(),
                timestamp_ms: now,
            });
        }
    }

    pub fn get_service_state(&self, service_name: &str) -> ServiceState {
        self.services
            .lock()
            .get(service_name)
            .map(|s| s.state)
            .unwrap_or(ServiceState::Healthy)
    }

    pub fn mark_service_recovered(&self, service_name: &str) {
        let old_state = self.get_service_state(service_name);
        if old_state == ServiceState::Healthy {
            return;
        }

        let now = now_ms();
        {
            let mut services = self.services.lock();
            if let Some(entry) = services.get_mut(service_name) {
                entry.state = ServiceState::Healthy;
                entry.failure_reason.clear();
                entry.recovery_attempts = 0;
                entry.fallback_strategy = FallbackStrategy::None;
                entry.last_check_at_ms = now;
            }
        }
        {
            let mut counters = self.counters.lock();
            counters.total_recoveries += 1;
            counters.last_recovery_ms = Some(now);
        }

        info!("service '{service_name}' recovered");
        self.notify(DegradationEvent {
            service_name: service_name.to_string(),
            old_state,
            new_state: ServiceState::Healthy,
            reason: "recovered".to_string(),
            timestamp_ms: now,
        });
    }

    /// Count a recovery attempt; services that exhaust the attempt budget
    /// escalate to Critical.
    pub fn attempt_recovery(&self, service_name: &str) {
        let mut escalate_to_critical = false;
        {
            let mut services = self.services.lock();
            if let Some(entry) = services.get_mut(service_name) {
                entry.recovery_attempts += 1;
                entry.last_check_at_ms = now_ms();
                if entry.recovery_attempts >= self.recovery_attempt_limit
                    && entry.state != ServiceState::Critical
                {
                    escalate_to_critical = true;
                }
            }
        }
        if escalate_to_critical {
            self.set_service_state(
                service_name,
                ServiceState::Critical,
                "recovery attempt limit exhausted",
                FallbackStrategy::None,
            );
        }
    }

    pub fn should_use_fallback(&self, service_name: &str) -> bool {
        self.get_service_state(service_name) > ServiceState::Healthy
    }

    pub fn fallback_strategy(&self, service_name: &str) -> Option<FallbackStrategy> {
        self.services
            .lock()
            .get(service_name)
            .map(|s| s.fallback_strategy)
    }

    pub fn degraded_services(&self) -> Vec<String> {
        self.services_in_state(ServiceState::Degraded)
    }

    pub fn failed_services(&self) -> Vec<String> {
        self.services_in_state(ServiceState::Failed)
    }

    fn services_in_state(&self, state: ServiceState) -> Vec<String> {
        self.services
            .lock()
            .values()
            .filter(|s| s.state == state)
            .map(|s| s.service_name.clone())
            .collect()
    }

    pub fn all_service_failures(&self) -> Vec<ServiceFailure> {
        self.services.lock().values().cloned().collect()
    }

    pub fn system_level(&self) -> DegradationLevel {
        let services = self.services.lock();
        let any_critical = services
            .values()
            .any(|s| s.state >= ServiceState::Failed);
        let any_degraded = services.values().any(|s| s.state > ServiceState::Healthy);
        drop(services);

        if any_critical {
            DegradationLevel::CriticalFailure
        } else if any_degraded {
            DegradationLevel::Degraded
        } else {
            DegradationLevel::Normal
        }
    }

    pub fn subscribe(&self, callback: DegradationCallback) {
        self.callbacks.lock().push(callback);
    }

    pub fn clear_subscribers(&self) {
        self.callbacks.lock().clear();
    }

    fn notify(&self, event: DegradationEvent) {
        for callback in self.callbacks.lock().iter() {
            callback(&event);
        }
    }

    pub fn metrics(&self) -> DegradationMetrics {
        let services = self.services.lock();
        let count_in = |state: ServiceState| services.values().filter(|s| s.state == state).count();
        let healthy = count_in(ServiceState::Healthy);
        let degraded = count_in(ServiceState::Degraded);
        let failed = count_in(ServiceState::Failed);
        let critical = count_in(ServiceState::Critical);
        let total = services.len();
        drop(services);

        let counters = self.counters.lock();
        DegradationMetrics {
            total_services: total,
            healthy_services: healthy,
            degraded_services: degraded,
            failed_services: failed,
            critical_services: critical,
            total_failures: counters.total_failures,
            total_recoveries: counters.total_recoveries,
            system_level: self.system_level(),
            last_failure_ms: counters.last_failure_ms,
            last_recovery_ms: counters.last_recovery_ms,
        }
    }

    /// Run `op`; on failure mark the service Degraded with the UseCache
    /// strategy and serve the fallback instead. A service already known
    /// to be unhealthy skips straight to the fallback.
    pub async fn execute_with_fallback<T, E, Op, OpFut, Fb, FbFut>(
        &self,
        service_name: &str,
        op: Op,
        fallback: Fb,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        Op: FnOnce() -> OpFut,
        OpFut: Future<Output = Result<T, E>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
    {
        if self.should_use_fallback(service_name) {
            debug!("service '{service_name}' is degraded, using fallback");
            return fallback().await;
        }

        match op().await {
            Ok(value) => {
                if self.get_service_state(service_name) != ServiceState::Healthy {
                    self.mark_service_recovered(service_name);
                }
                Ok(value)
            }
            Err(e) => {
                self.set_service_state(
                    service_name,
                    ServiceState::Degraded,
                    &format!("operation failed: {e}"),
                    FallbackStrategy::UseCache,
                );
                fallback().await
            }
        }
    }

    /// Retry `op` with exponential backoff, escalating the service state
    /// per attempt: first failure marks Degraded, intermediate failures
    /// count recovery attempts, the final failure marks Failed.
    pub async fn try_with_recovery<T, E, Op, OpFut>(
        &self,
        service_name: &str,
        mut op: Op,
        max_retries: usize,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        Op: FnMut() -> OpFut,
        OpFut: Future<Output = Result<T, E>>,
    {
        let mut backoff = Duration::from_millis(100);
        let mut last_err = None;

        for attempt in 0..max_retries {
            match op().await {
                Ok(value) => {
                    if self.get_service_state(service_name) != ServiceState::Healthy {
                        self.mark_service_recovered(service_name);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt == 0 {
                        self.set_service_state(
                            service_name,
                            ServiceState::Degraded,
                            &format!("attempt 1 failed: {e}"),
                            FallbackStrategy::RetryWithBackoff,
                        );
                    } else if attempt < max_retries - 1 {
                        self.attempt_recovery(service_name);
                    } else {
                        self.set_service_state(
                            service_name,
                            ServiceState::Failed,
                            &format!("all {max_retries} attempts failed"),
                            FallbackStrategy::None,
                        );
                    }
                    last_err = Some(e);
                }
            }

            if attempt < max_retries - 1 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(last_err.expect("at least one attempt runs"))
    }
}

impl Default for DegradationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
