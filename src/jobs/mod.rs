//! Background job scheduling and monitoring.
//!
//! Every registered job runs on a fixed cadence inside an instrumented
//! wrapper: per-run deadline, panic capture, duration statistics, and a
//! status entry the health endpoints read. A sweeper flags runs that exceed
//! the stall threshold, and finished entries are pruned after the retention
//! window. One instance of a named job runs at a time; the schedule loop
//! does not tick again until the previous run returned.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// A schedulable unit of work. Implementations are expected to honor the
/// cancellation token they are handed; the wrapper aborts them at the
/// deadline regardless.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn run(&self, cancel: CancellationToken) -> Result<(), JobError>;
}

/// Adapter turning an async closure into a [`Job`].
pub struct FnJob<F>(pub F);

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    async fn run(&self, _cancel: CancellationToken) -> Result<(), JobError> {
        (self.0)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Success,
    Failed,
    Stalled,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub state: JobState,
    pub critical: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_type: Option<String>,
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub avg_duration_ms: Option<u64>,
    #[serde(skip)]
    total_duration_ms: u64,
    #[serde(skip)]
    started_instant: Option<Instant>,
    #[serde(skip)]
    finished_instant: Option<Instant>,
}

impl JobStatus {
    fn new(name: &str, critical: bool) -> Self {
        Self {
            name: name.to_string(),
            state: JobState::Running,
            critical,
            started_at: None,
            finished_at: None,
            last_success: None,
            last_error: None,
            error_type: None,
            runs: 0,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            min_duration_ms: None,
            max_duration_ms: None,
            avg_duration_ms: None,
            total_duration_ms: 0,
            started_instant: None,
            finished_instant: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// In-memory job status map behind a read-write lock. Readers get copies.
#[derive(Default)]
pub struct JobStatusStore {
    inner: RwLock<HashMap<String, JobStatus>>,
}

impl JobStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<JobStatus> {
        let inner = self.inner.read().expect("job status lock");
        let mut statuses: Vec<JobStatus> = inner.values().cloned().collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn running_count(&self) -> usize {
        let inner = self.inner.read().expect("job status lock");
        inner
            .values()
            .filter(|s| s.state == JobState::Running)
            .count()
    }

    fn is_running(&self, name: &str) -> bool {
        let inner = self.inner.read().expect("job status lock");
        inner
            .get(name)
            .map(|s| s.state == JobState::Running)
            .unwrap_or(false)
    }

    fn on_start(&self, name: &str, critical: bool) {
        let mut inner = self.inner.write().expect("job status lock");
        let entry = inner
            .entry(name.to_string())
            .or_insert_with(|| JobStatus::new(name, critical));
        entry.state = JobState::Running;
        entry.runs += 1;
        entry.started_at = Some(Utc::now());
        entry.started_instant = Some(Instant::now());
        entry.finished_at = None;
        entry.finished_instant = None;
    }

    fn on_finish(
        &self,
        name: &str,
        result: Result<(), String>,
        error_type: Option<&str>,
        duration: Duration,
    ) {
        let mut inner = self.inner.write().expect("job status lock");
        let Some(entry) = inner.get_mut(name) else {
            return;
        };
        let duration_ms = duration.as_millis() as u64;
        entry.finished_at = Some(Utc::now());
        entry.finished_instant = Some(Instant::now());
        entry.total_duration_ms += duration_ms;
        entry.min_duration_ms = Some(entry.min_duration_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        entry.max_duration_ms = Some(entry.max_duration_ms.map_or(duration_ms, |m| m.max(duration_ms)));
        match result {
            Ok(()) => {
                entry.state = JobState::Success;
                entry.successes += 1;
                entry.consecutive_failures = 0;
                entry.last_success = entry.finished_at;
                entry.last_error = None;
                entry.error_type = None;
            }
            Err(error) => {
                entry.state = JobState::Failed;
                entry.failures += 1;
                entry.consecutive_failures += 1;
                entry.last_error = Some(error);
                entry.error_type = error_type.map(str::to_string);
            }
        }
        let finished = entry.successes + entry.failures;
        if finished > 0 {
            entry.avg_duration_ms = Some(entry.total_duration_ms / finished);
        }
    }

    /// Flags running entries whose current run exceeds `threshold`.
    pub fn mark_stalled(&self, threshold: Duration) -> Vec<String> {
        let mut inner = self.inner.write().expect("job status lock");
        let now = Instant::now();
        let mut stalled = Vec::new();
        for entry in inner.values_mut() {
            if entry.state == JobState::Running {
                if let Some(started) = entry.started_instant {
                    if now.duration_since(started) > threshold {
                        entry.state = JobState::Stalled;
                        stalled.push(entry.name.clone());
                    }
                }
            }
        }
        stalled
    }

    /// Drops entries that finished more than `retention` ago. Running and
    /// stalled entries are kept.
    pub fn prune(&self, retention: Duration) {
        let mut inner = self.inner.write().expect("job status lock");
        let now = Instant::now();
        inner.retain(|_, entry| {
            if matches!(entry.state, JobState::Running | JobState::Stalled) {
                return true;
            }
            match entry.finished_instant {
                Some(finished) => now.duration_since(finished) <= retention,
                None => true,
            }
        });
    }

    /// Aggregate health per the `/health/jobs` contract: any stalled job or
    /// a critical job with three consecutive failures is unhealthy; any
    /// other failing job degrades the service.
    pub fn aggregate(&self) -> AggregateHealth {
        let inner = self.inner.read().expect("job status lock");
        let mut degraded = false;
        for entry in inner.values() {
            if entry.state == JobState::Stalled {
                return AggregateHealth::Unhealthy;
            }
            if entry.critical && entry.consecutive_failures >= 3 {
                return AggregateHealth::Unhealthy;
            }
            if entry.state == JobState::Failed || entry.consecutive_failures > 0 {
                degraded = true;
            }
        }
        if degraded {
            AggregateHealth::Degraded
        } else {
            AggregateHealth::Healthy
        }
    }
}

#[derive(Clone)]
pub struct JobSpec {
    pub name: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub critical: bool,
    /// Uptime-monitor webhook pinged (best-effort) after a successful run.
    pub uptime_webhook: Option<Url>,
    pub job: Arc<dyn Job>,
}

pub struct Scheduler {
    jobs: Vec<JobSpec>,
    status: Arc<JobStatusStore>,
    http: reqwest::Client,
    stalled_threshold: Duration,
    retention: Duration,
}

impl Scheduler {
    pub fn new(
        status: Arc<JobStatusStore>,
        stalled_threshold: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            jobs: Vec::new(),
            status,
            http: reqwest::Client::new(),
            stalled_threshold,
            retention,
        }
    }

    pub fn register(&mut self, spec: JobSpec) {
        self.jobs.push(spec);
    }

    /// Spawns one ticking task per job plus the stall sweeper and the
    /// retention pruner. All tasks exit when `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> TaskTracker {
        let tracker = TaskTracker::new();

        for spec in self.jobs.clone() {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                let mut ticker = tokio::time::interval(spec.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            scheduler.run_instrumented(&spec).await;
                        }
                    }
                }
            });
        }

        let sweeper = self.clone();
        let sweeper_cancel = cancel.clone();
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sweeper_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for name in sweeper.status.mark_stalled(sweeper.stalled_threshold) {
                            tracing::error!(job = %name, "job stalled");
                        }
                    }
                }
            }
        });

        let pruner = self.clone();
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => pruner.status.prune(pruner.retention),
                }
            }
        });

        tracker.close();
        tracker
    }

    /// Runs one job instance under its deadline, recording the outcome.
    pub(crate) async fn run_instrumented(&self, spec: &JobSpec) {
        if self.status.is_running(&spec.name) {
            tracing::warn!(job = %spec.name, "previous instance still running, skipping tick");
            return;
        }
        self.status.on_start(&spec.name, spec.critical);

        let job = spec.job.clone();
        let job_cancel = CancellationToken::new();
        let child_cancel = job_cancel.clone();
        let mut handle = tokio::spawn(async move { job.run(child_cancel).await });

        let started = Instant::now();
        let (result, error_type): (Result<(), String>, Option<&str>) = tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(())) => (Ok(()), None),
                Ok(Err(error)) => (Err(error.to_string()), Some("error")),
                Err(join_error) if join_error.is_panic() => {
                    let payload = join_error.into_panic();
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic payload".to_string());
                    (Err(format!("panic: {message}")), Some("panic"))
                }
                Err(join_error) => (Err(join_error.to_string()), Some("cancelled")),
            },
            _ = tokio::time::sleep(spec.timeout) => {
                job_cancel.cancel();
                handle.abort();
                (
                    Err(format!("exceeded {}s deadline", spec.timeout.as_secs())),
                    Some("timeout"),
                )
            }
        };
        let duration = started.elapsed();

        let succeeded = result.is_ok();
        match &result {
            Ok(()) => {
                tracing::debug!(job = %spec.name, duration_ms = duration.as_millis() as u64, "job finished");
            }
            Err(error) => {
                tracing::error!(job = %spec.name, error = %error, "job failed");
            }
        }
        self.status
            .on_finish(&spec.name, result, error_type, duration);

        if succeeded {
            if let Some(webhook) = &spec.uptime_webhook {
                let ping = self
                    .http
                    .get(webhook.clone())
                    .timeout(Duration::from_secs(3))
                    .send()
                    .await;
                if let Err(error) = ping {
                    tracing::warn!(job = %spec.name, error = %error, "uptime webhook ping failed");
                }
            }
        }
    }
}
