//! Multi-endpoint RPC layer.
//!
//! Wraps a set of equivalent upstream endpoints (Esplora explorers, EVM RPC
//! nodes) behind one call surface with:
//!
//! - selection strategy: failover, round-robin, or health-based,
//! - a per-endpoint circuit breaker (Closed → Open → Half-Open),
//! - retry with exponential back-off inside a single endpoint, with a long
//!   minimum wait after a 429,
//! - per-endpoint health metadata exposed as a read-only snapshot.
//!
//! Endpoint state lives behind a per-endpoint mutex; selection itself is
//! wait-free (an atomic cursor for round-robin, a state read for the rest).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Error classification contract every pooled client error implements.
pub trait Retryable {
    /// Network errors, timeouts, 5xx and 429 are worth retrying; protocol or
    /// validation errors are not.
    fn is_retryable(&self) -> bool;

    /// Rate-limit responses force a long minimum back-off.
    fn is_rate_limited(&self) -> bool {
        false
    }
}

/// Minimum initial wait after a 429 before the next attempt.
pub const RATE_LIMIT_MIN_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    Failover,
    RoundRobin,
    HealthBased,
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failover" => Ok(SelectionStrategy::Failover),
            "round-robin" => Ok(SelectionStrategy::RoundRobin),
            "health-based" => Ok(SelectionStrategy::HealthBased),
            other => Err(format!("unknown load balancing strategy {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub strategy: SelectionStrategy,
    /// Retries per endpoint on retryable errors, on top of the first attempt.
    pub retry_max: u32,
    pub retry_base_delay: Duration,
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before probing again.
    pub cooldown: Duration,
    pub half_open_max_probes: u32,
    pub half_open_success_threshold: u32,
    pub request_timeout: Duration,
    /// Rolling error-rate above which an endpoint stops being preferred.
    pub error_rate_threshold: f64,
    pub health_window: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::Failover,
            retry_max: 2,
            retry_base_delay: Duration::from_millis(500),
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            half_open_max_probes: 2,
            half_open_success_threshold: 2,
            request_timeout: Duration::from_secs(10),
            error_rate_threshold: 0.5,
            health_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Breaker {
    Closed {
        consecutive_failures: u32,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        probes_in_flight: u32,
        consecutive_successes: u32,
    },
}

impl Breaker {
    fn state(&self) -> BreakerState {
        match self {
            Breaker::Closed { .. } => BreakerState::Closed,
            Breaker::Open { .. } => BreakerState::Open,
            Breaker::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct Observation {
    at: Instant,
    ok: bool,
    latency: Duration,
}

#[derive(Debug)]
struct EndpointState {
    breaker: Breaker,
    request_count: u64,
    success_count: u64,
    error_count: u64,
    timeout_count: u64,
    last_error: Option<String>,
    last_success_time: Option<Instant>,
    window: VecDeque<Observation>,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            breaker: Breaker::Closed {
                consecutive_failures: 0,
            },
            request_count: 0,
            success_count: 0,
            error_count: 0,
            timeout_count: 0,
            last_error: None,
            last_success_time: None,
            window: VecDeque::new(),
        }
    }

    fn trim_window(&mut self, horizon: Duration) {
        let now = Instant::now();
        while let Some(front) = self.window.front() {
            if now.duration_since(front.at) > horizon {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let errors = self.window.iter().filter(|o| !o.ok).count();
        errors as f64 / self.window.len() as f64
    }

    fn avg_latency(&self) -> Duration {
        if self.window.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.window.iter().map(|o| o.latency).sum();
        total / self.window.len() as u32
    }
}

/// Read-only snapshot of one endpoint's health counters.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub breaker_state: BreakerState,
    pub is_healthy: bool,
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub error_rate: f64,
    pub last_error: Option<String>,
    pub seconds_since_last_success: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError<E> {
    /// Every endpoint either has an open breaker or is saturated with probes.
    #[error("all endpoints unavailable")]
    AllEndpointsUnavailable,
    /// The final attempt on the last tried endpoint hit the request deadline.
    #[error("request deadline exceeded")]
    Timeout,
    #[error(transparent)]
    Upstream(E),
}

struct EndpointSlot<T> {
    label: String,
    resource: T,
    state: Mutex<EndpointState>,
}

/// A set of equivalent endpoints with selection, breakers and retry.
pub struct EndpointPool<T> {
    slots: Vec<EndpointSlot<T>>,
    config: PoolConfig,
    cursor: AtomicUsize,
}

impl<T: Clone> EndpointPool<T> {
    pub fn new(resources: Vec<(String, T)>, config: PoolConfig) -> Self {
        let slots = resources
            .into_iter()
            .map(|(label, resource)| EndpointSlot {
                label,
                resource,
                state: Mutex::new(EndpointState::new()),
            })
            .collect();
        Self {
            slots,
            config,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Runs `f` against the pool: selects an endpoint per the configured
    /// strategy, retries retryable errors with back-off, fails the endpoint
    /// over when its retries are exhausted, and fails fast on endpoints with
    /// an open breaker.
    pub async fn run<R, E, F, Fut>(&self, op: &str, f: F) -> Result<R, PoolError<E>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Retryable + std::error::Error,
    {
        let mut admitted_any = false;
        let mut last_error: Option<PoolError<E>> = None;

        for index in self.candidate_order() {
            if !self.try_admit(index) {
                continue;
            }
            admitted_any = true;
            match self.run_on_endpoint(index, op, &f).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let terminal =
                        matches!(&error, PoolError::Upstream(e) if !e.is_retryable());
                    if terminal {
                        // Not the endpoint's fault; no point asking another one.
                        return Err(error);
                    }
                    tracing::warn!(
                        op,
                        endpoint = %self.slots[index].label,
                        error = %error,
                        "endpoint exhausted, trying next"
                    );
                    last_error = Some(error);
                }
            }
        }

        if !admitted_any {
            return Err(PoolError::AllEndpointsUnavailable);
        }
        Err(last_error.unwrap_or(PoolError::AllEndpointsUnavailable))
    }

    /// Copy-out health snapshot for every endpoint.
    pub fn health(&self) -> Vec<EndpointHealth> {
        self.slots
            .iter()
            .map(|slot| {
                let mut state = slot.state.lock().expect("endpoint state lock");
                state.trim_window(self.config.health_window);
                let error_rate = state.error_rate();
                EndpointHealth {
                    endpoint: slot.label.clone(),
                    breaker_state: state.breaker.state(),
                    is_healthy: matches!(state.breaker, Breaker::Closed { .. })
                        && error_rate < self.config.error_rate_threshold,
                    request_count: state.request_count,
                    success_count: state.success_count,
                    error_count: state.error_count,
                    timeout_count: state.timeout_count,
                    error_rate,
                    last_error: state.last_error.clone(),
                    seconds_since_last_success: state
                        .last_success_time
                        .map(|at| Instant::now().duration_since(at).as_secs()),
                }
            })
            .collect()
    }

    async fn run_on_endpoint<R, E, F, Fut>(
        &self,
        index: usize,
        op: &str,
        f: &F,
    ) -> Result<R, PoolError<E>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Retryable + std::error::Error,
    {
        let slot = &self.slots[index];
        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let outcome =
                tokio::time::timeout(self.config.request_timeout, f(slot.resource.clone())).await;
            let latency = started.elapsed();

            match outcome {
                Ok(Ok(value)) => {
                    self.record_attempt(index, true, false, latency, None);
                    self.settle(index, true);
                    return Ok(value);
                }
                Ok(Err(error)) => {
                    let retryable = error.is_retryable();
                    self.record_attempt(index, false, false, latency, Some(error.to_string()));
                    if !retryable {
                        // A validation-style failure: the endpoint answered,
                        // it just did not like the request.
                        self.settle(index, true);
                        return Err(PoolError::Upstream(error));
                    }
                    if attempt >= self.config.retry_max {
                        self.settle(index, false);
                        return Err(PoolError::Upstream(error));
                    }
                    let delay = self.backoff_delay(attempt, error.is_rate_limited());
                    tracing::debug!(
                        op,
                        endpoint = %slot.label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after back-off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(_elapsed) => {
                    self.record_attempt(
                        index,
                        false,
                        true,
                        latency,
                        Some("request deadline exceeded".to_string()),
                    );
                    if attempt >= self.config.retry_max {
                        self.settle(index, false);
                        return Err(PoolError::Timeout);
                    }
                    tokio::time::sleep(self.backoff_delay(attempt, false)).await;
                    attempt += 1;
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32, rate_limited: bool) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let mut delay = self.config.retry_base_delay.saturating_mul(factor);
        if rate_limited {
            delay = delay.max(RATE_LIMIT_MIN_BACKOFF.saturating_mul(factor));
        }
        delay
    }

    /// Endpoint indices in the order selection wants them tried.
    fn candidate_order(&self) -> Vec<usize> {
        let n = self.slots.len();
        match self.config.strategy {
            SelectionStrategy::Failover => (0..n).collect(),
            SelectionStrategy::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n.max(1);
                (0..n).map(|offset| (start + offset) % n).collect()
            }
            SelectionStrategy::HealthBased => {
                let mut qualified: Vec<(usize, Duration)> = Vec::new();
                let mut fallback: Vec<(usize, f64)> = Vec::new();
                for (index, slot) in self.slots.iter().enumerate() {
                    let mut state = slot.state.lock().expect("endpoint state lock");
                    state.trim_window(self.config.health_window);
                    let rate = state.error_rate();
                    if rate < self.config.error_rate_threshold {
                        qualified.push((index, state.avg_latency()));
                    } else {
                        fallback.push((index, rate));
                    }
                }
                qualified.sort_by_key(|(_, latency)| *latency);
                fallback.sort_by(|a, b| a.1.total_cmp(&b.1));
                qualified
                    .into_iter()
                    .map(|(index, _)| index)
                    .chain(fallback.into_iter().map(|(index, _)| index))
                    .collect()
            }
        }
    }

    /// Admits a call through the endpoint's breaker, moving Open → Half-Open
    /// once the cooldown has passed.
    fn try_admit(&self, index: usize) -> bool {
        let mut state = self.slots[index].state.lock().expect("endpoint state lock");
        match &mut state.breaker {
            Breaker::Closed { .. } => true,
            Breaker::Open { until } => {
                if Instant::now() >= *until {
                    state.breaker = Breaker::HalfOpen {
                        probes_in_flight: 1,
                        consecutive_successes: 0,
                    };
                    true
                } else {
                    false
                }
            }
            Breaker::HalfOpen {
                probes_in_flight, ..
            } => {
                if *probes_in_flight < self.config.half_open_max_probes {
                    *probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Per-attempt counters and rolling-window bookkeeping.
    fn record_attempt(
        &self,
        index: usize,
        ok: bool,
        timed_out: bool,
        latency: Duration,
        error: Option<String>,
    ) {
        let mut state = self.slots[index].state.lock().expect("endpoint state lock");
        state.request_count += 1;
        if ok {
            state.success_count += 1;
            state.last_success_time = Some(Instant::now());
        } else {
            state.error_count += 1;
            if timed_out {
                state.timeout_count += 1;
            }
            state.last_error = error;
        }
        state.window.push_back(Observation {
            at: Instant::now(),
            ok,
            latency,
        });
        state.trim_window(self.config.health_window);
    }

    /// Breaker transition on the final outcome of one admitted call sequence.
    fn settle(&self, index: usize, ok: bool) {
        let slot = &self.slots[index];
        let mut state = slot.state.lock().expect("endpoint state lock");
        match &mut state.breaker {
            Breaker::Closed {
                consecutive_failures,
            } => {
                if ok {
                    *consecutive_failures = 0;
                } else {
                    *consecutive_failures += 1;
                    if *consecutive_failures >= self.config.failure_threshold {
                        tracing::warn!(endpoint = %slot.label, "circuit breaker opened");
                        state.breaker = Breaker::Open {
                            until: Instant::now() + self.config.cooldown,
                        };
                    }
                }
            }
            Breaker::Open { .. } => {}
            Breaker::HalfOpen {
                probes_in_flight,
                consecutive_successes,
            } => {
                if ok {
                    *consecutive_successes += 1;
                    *probes_in_flight = probes_in_flight.saturating_sub(1);
                    if *consecutive_successes >= self.config.half_open_success_threshold {
                        tracing::info!(endpoint = %slot.label, "circuit breaker closed");
                        state.breaker = Breaker::Closed {
                            consecutive_failures: 0,
                        };
                    }
                } else {
                    tracing::warn!(endpoint = %slot.label, "probe failed, circuit breaker re-opened");
                    state.breaker = Breaker::Open {
                        until: Instant::now() + self.config.cooldown,
                    };
                }
            }
        }
    }
}
