//! Per-stage timing metrics, counters, and the recent-error log.
//!
//! Stages record durations into bounded rings (last 1000 samples each);
//! snapshots expose count, avg, min, max, p95 and success rate. A
//! best-effort background tick logs a one-line summary; it can never fail a
//! request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Durations kept per stage.
const RING_CAPACITY: usize = 1000;

/// Error records kept system-wide.
const ERROR_LOG_CAPACITY: usize = 50;

#[derive(Debug, Default)]
struct StageRecord {
    /// Recent durations in ms, oldest first, bounded.
    durations_ms: Vec<f64>,
    successes: u64,
    errors: u64,
}

/// One captured failure, newest last.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub stage: String,
    pub kind: String,
    pub message: String,
    pub ts_ms: i64,
}

/// Aggregate view over one stage's ring.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StageSnapshot {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub success_rate: f64,
}

/// Full collector snapshot for `get_metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub success_rate: f64,
    pub stages: HashMap<String, StageSnapshot>,
    pub counters: HashMap<String, u64>,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Shared metrics collector. Cheap to clone via `Arc`.
pub struct Metrics {
    enabled: bool,
    started: Instant,
    stages: Mutex<HashMap<String, StageRecord>>,
    counters: Mutex<HashMap<String, u64>>,
    errors: Mutex<Vec<ErrorRecord>>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
}

impl Metrics {
    pub fn new(enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            enabled,
            started: Instant::now(),
            stages: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
        })
    }

    /// Start timing a stage. Record by dropping the returned timer; call
    /// [`StageTimer::succeed`] first if the stage completed cleanly.
    pub fn timer(self: &Arc<Self>, stage: &str) -> StageTimer {
        StageTimer {
            metrics: Arc::clone(self),
            stage: stage.to_string(),
            started: Instant::now(),
            success: false,
        }
    }

    /// Record one stage execution directly.
    pub fn record(&self, stage: &str, duration: Duration, success: bool) {
        if !self.enabled {
            return;
        }
        let mut stages = lock(&self.stages);
        let rec = stages.entry(stage.to_string()).or_default();
        if rec.durations_ms.len() >= RING_CAPACITY {
            rec.durations_ms.remove(0);
        }
        rec.durations_ms.push(duration.as_secs_f64() * 1000.0);
        if success {
            rec.successes += 1;
        } else {
            rec.errors += 1;
        }
    }

    /// Record a whole pipeline request outcome (for the system-wide rate).
    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Append to the bounded error log.
    pub fn record_error(&self, stage: &str, kind: &str, message: &str) {
        if !self.enabled {
            return;
        }
        let mut errors = lock(&self.errors);
        if errors.len() >= ERROR_LOG_CAPACITY {
            errors.remove(0);
        }
        errors.push(ErrorRecord {
            stage: stage.to_string(),
            kind: kind.to_string(),
            message: message.to_string(),
            ts_ms: chrono::Utc::now().timestamp_millis(),
        });
    }

    /// Bump a named counter (event drops, backpressure discards, ...).
    pub fn inc_counter(&self, name: &str) {
        if !self.enabled {
            return;
        }
        *lock(&self.counters).entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        lock(&self.counters).get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages = lock(&self.stages);
        let mut out = HashMap::with_capacity(stages.len());
        for (name, rec) in stages.iter() {
            out.insert(name.clone(), summarize(rec));
        }

        let total = self.total_requests.load(Ordering::Relaxed);
        let ok = self.successful_requests.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            total_requests: total,
            success_rate: if total == 0 { 1.0 } else { ok as f64 / total as f64 },
            stages: out,
            counters: lock(&self.counters).clone(),
            recent_errors: lock(&self.errors).clone(),
        }
    }

    /// Spawn the periodic summary logger. Best-effort; exits on cancel.
    pub fn spawn_log_tick(self: &Arc<Self>, interval_seconds: u64, cancel: CancellationToken) {
        if !self.enabled || interval_seconds == 0 {
            return;
        }
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(interval_seconds));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let snap = metrics.snapshot();
                        let e2e = snap.stages.get("e2e").cloned().unwrap_or_default();
                        info!(
                            uptime_s = snap.uptime_seconds,
                            requests = snap.total_requests,
                            success_rate = format!("{:.2}", snap.success_rate),
                            e2e_avg_ms = format!("{:.0}", e2e.avg_ms),
                            e2e_p95_ms = format!("{:.0}", e2e.p95_ms),
                            errors = snap.recent_errors.len(),
                            "metrics summary"
                        );
                    }
                }
            }
        });
    }
}

fn summarize(rec: &StageRecord) -> StageSnapshot {
    let count = rec.successes + rec.errors;
    if rec.durations_ms.is_empty() {
        return StageSnapshot {
            count,
            success_rate: if count == 0 { 1.0 } else { rec.successes as f64 / count as f64 },
            ..Default::default()
        };
    }
    let mut sorted = rec.durations_ms.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let sum: f64 = sorted.iter().sum();
    let p95_idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
    StageSnapshot {
        count,
        avg_ms: sum / sorted.len() as f64,
        min_ms: sorted[0],
        max_ms: sorted[sorted.len() - 1],
        p95_ms: sorted[p95_idx.min(sorted.len()) - 1],
        success_rate: rec.successes as f64 / count as f64,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Scope guard: measures from construction, records on drop. A timer
/// dropped without `succeed()` counts as an error.
pub struct StageTimer {
    metrics: Arc<Metrics>,
    stage: String,
    started: Instant,
    success: bool,
}

impl StageTimer {
    /// Mark the stage as completed successfully.
    pub fn succeed(&mut self) {
        self.success = true;
    }

    /// Elapsed time so far.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.metrics
            .record(&self.stage, self.started.elapsed(), self.success);
    }
}
