use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for client {0}")]
    RateExceeded(u64),
    #[error("concurrent scan limit exceeded for client {0}")]
    ConcurrencyExceeded(u64),
}

/// Token bucket with fractional tokens. Refill happens lazily on each
/// `try_consume`; a failed consume never mutates the balance.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_rate: refill_rate_per_sec,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn try_consume(&mut self, tokens: f64) -> bool {
        self.try_consume_at(tokens, Instant::now())
    }

    pub(crate) fn try_consume_at(&mut self, tokens: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.tokens = self.capacity;
        self.last_refill = Instant::now();
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Per-client admission limits.
#[derive(Debug, Clone, Copy)]
pub struct ClientLimits {
    pub scan_requests_per_second: f64,
    pub policy_queries_per_second: f64,
    pub max_concurrent_scans: usize,
    pub scan_burst_capacity: f64,
    pub policy_burst_capacity: f64,
}

impl Default for ClientLimits {
    fn default() -> Self {
        Self {
            scan_requests_per_second: 10.0,
            policy_queries_per_second: 100.0,
            max_concurrent_scans: 5,
            scan_burst_capacity: 20.0,
            policy_burst_capacity: 200.0,
        }
    }
}

#[derive(Default)]
struct ClientState {
    scan_limiters: HashMap<u64, TokenBucket>,
    policy_limiters: HashMap<u64, TokenBucket>,
    concurrent_scans: HashMap<u64, usize>,
    rejected_counts: HashMap<u64, u64>,
    total_rejected: u64,
}

/// Per-client rate limiter; isolates clients so one cannot starve the rest.
/// Shared across the event loop and scan workers behind a single mutex.
pub struct ClientRateLimiter {
    limits: ClientLimits,
    state: Mutex<ClientState>,
}

impl ClientRateLimiter {
    pub fn new(limits: ClientLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn check_scan_request(&self, client_id: u64) -> Result<(), RateLimitError> {
        let limits = self.limits;
        let mut state = self.state.lock();
        let bucket = state
            .scan_limiters
            .entry(client_id)
            .or_insert_with(|| TokenBucket::new(limits.scan_burst_capacity, limits.scan_requests_per_second));

        if bucket.try_consume(1.0) {
            Ok(())
        } else {
            *state.rejected_counts.entry(client_id).or_default() += 1;
            state.total_rejected += 1;
            debug!("scan request rejected for client {client_id}");
            Err(RateLimitError::RateExceeded(client_id))
        }
    }

    pub fn check_policy_query(&self, client_id: u64) -> Result<(), RateLimitError> {
        let limits = self.limits;
        let mut state = self.state.lock();
        let bucket = state
            .policy_limiters
            .entry(client_id)
            .or_insert_with(|| TokenBucket::new(limits.policy_burst_capacity, limits.policy_queries_per_second));

        if bucket.try_consume(1.0) {
            Ok(())
        } else {
            *state.rejected_counts.entry(client_id).or_default() += 1;
            state.total_rejected += 1;
            Err(RateLimitError::RateExceeded(client_id))
        }
    }

    /// Take a concurrent-scan slot. The caller must pair this with
    /// `release_scan_slot` on completion, error, or cancellation.
    pub fn acquire_scan_slot(&self, client_id: u64) -> Result<(), RateLimitError> {
        let mut state = self.state.lock();
        let count = state.concurrent_scans.entry(client_id).or_insert(0);
        if *count >= self.limits.max_concurrent_scans {
            *state.rejected_counts.entry(client_id).or_default() += 1;
            state.total_rejected += 1;
            return Err(RateLimitError::ConcurrencyExceeded(client_id));
        }
        *count += 1;
        Ok(())
    }

    pub fn release_scan_slot(&self, client_id: u64) {
        let mut state = self.state.lock();
        if let Some(count) = state.concurrent_scans.get_mut(&client_id) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn total_rejected(&self) -> u64 {
        self.state.lock().total_rejected
    }

    pub fn per_client_rejected(&self) -> HashMap<u64, u64> {
        self.state.lock().rejected_counts.clone()
    }

    pub fn concurrent_scans(&self) -> HashMap<u64, usize> {
        self.state.lock().concurrent_scans.clone()
    }

    pub fn reset_telemetry(&self) {
        let mut state = self.state.lock();
        state.rejected_counts.clear();
        state.total_rejected = 0;
    }

    pub fn reset_client(&self, client_id: u64) {
        let mut state = self.state.lock();
        state.scan_limiters.remove(&client_id);
        state.policy_limiters.remove(&client_id);
        state.concurrent_scans.remove(&client_id);
    }

    /// Drop all per-client state when a connection closes.
    pub fn forget_client(&self, client_id: u64) {
        self.reset_client(client_id);
        self.state.lock().rejected_counts.remove(&client_id);
    }
}

impl Default for ClientRateLimiter {
    fn default() -> Self {
        Self::new(ClientLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bucket_allows_burst_then_rejects() {
        let mut bucket = TokenBucket::new(3.0, 1.0);
        let now = Instant::now();
        assert!(bucket.try_consume_at(1.0, now));
        assert!(bucket.try_consume_at(1.0, now));
        assert!(bucket.try_consume_at(1.0, now));
        assert!(!bucket.try_consume_at(1.0, now));
    }

    #[test]
    fn failed_consume_does_not_mutate() {
        let mut bucket = TokenBucket::new(2.0, 1.0);
        let now = Instant::now();
        assert!(bucket.try_consume_at(2.0, now));
        assert!(!bucket.try_consume_at(1.0, now));
        // Half a second of refill at 1 token/sec is still not enough for 1.0,
        // and the failed attempt above must not have burned anything.
        assert!(!bucket.try_consume_at(1.0, now + Duration::from_millis(500)));
        assert!(bucket.try_consume_at(1.0, now + Duration::from_secs(1)));
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let mut bucket = TokenBucket::new(5.0, 10.0);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(bucket.try_consume_at(1.0, now));
        }
        // A long idle period refills to capacity, never beyond.
        let later = now + Duration::from_secs(60);
        for _ in 0..5 {
            assert!(bucket.try_consume_at(1.0, later));
        }
        assert!(!bucket.try_consume_at(1.0, later));
    }

    #[test]
    fn idle_refill_matches_rate_times_elapsed() {
        // After draining, min(C, R*t) tokens are available after t seconds.
        let mut bucket = TokenBucket::new(10.0, 2.0);
        let now = Instant::now();
        for _ in 0..10 {
            assert!(bucket.try_consume_at(1.0, now));
        }

        let t3 = now + Duration::from_secs(3); // 6 tokens accrued
        assert!(bucket.try_consume_at(6.0, t3));
        assert!(!bucket.try_consume_at(0.5, t3));
    }

    #[test]
    fn reset_refills_to_capacity() {
        let mut bucket = TokenBucket::new(2.0, 0.001);
        assert!(bucket.try_consume(2.0));
        assert!(!bucket.try_consume(1.0));
        bucket.reset();
        assert!(bucket.try_consume(2.0));
    }

    #[test]
    fn clients_are_isolated() {
        let limiter = ClientRateLimiter::new(ClientLimits {
            scan_requests_per_second: 0.001,
            scan_burst_capacity: 2.0,
            ..Default::default()
        });

        assert!(limiter.check_scan_request(1).is_ok());
        assert!(limiter.check_scan_request(1).is_ok());
        assert!(limiter.check_scan_request(1).is_err());

        // Client 2 has its own bucket.
        assert!(limiter.check_scan_request(2).is_ok());
        assert_eq!(limiter.total_rejected(), 1);
        assert_eq!(limiter.per_client_rejected().get(&1), Some(&1));
    }

    #[test]
    fn concurrent_slots_acquire_and_release() {
        let limiter = ClientRateLimiter::new(ClientLimits {
            max_concurrent_scans: 2,
            ..Default::default()
        });

        assert!(limiter.acquire_scan_slot(7).is_ok());
        assert!(limiter.acquire_scan_slot(7).is_ok());
        assert!(limiter.acquire_scan_slot(7).is_err());

        limiter.release_scan_slot(7);
        assert!(limiter.acquire_scan_slot(7).is_ok());
    }

    #[test]
    fn reset_client_restores_budget() {
        let limiter = ClientRateLimiter::new(ClientLimits {
            scan_requests_per_second: 0.001,
            scan_burst_capacity: 1.0,
            ..Default::default()
        });
        assert!(limiter.check_scan_request(3).is_ok());
        assert!(limiter.check_scan_request(3).is_err());
        limiter.reset_client(3);
        assert!(limiter.check_scan_request(3).is_ok());
    }
}
