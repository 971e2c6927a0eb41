//! Per-stage counters and the periodic stats reporter.

use serde::Serialize;
use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{task::JoinHandle, time::interval_at};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Monotonic counters shared by all workers of one stage.
#[derive(Debug, Default)]
pub struct StageStats {
    items_in: AtomicU64,
    items_out: AtomicU64,
    errors: AtomicU64,
}

impl StageStats {
    pub fn record_in(&self) {
        self.items_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self) {
        self.items_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> StageCounters {
        StageCounters {
            items_in: self.items_in.load(Ordering::Relaxed),
            items_out: self.items_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounters {
    pub items_in: u64,
    pub items_out: u64,
    pub errors: u64,
}

/// Static description of a stage plus its live counters.
#[derive(Debug, Clone)]
pub struct StageInfo {
    pub num: usize,
    pub name: String,
    pub workers: usize,
    pub stats: Arc<StageStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub num: usize,
    pub name: String,
    pub workers: usize,
    #[serde(flatten)]
    pub counters: StageCounters,
    pub in_per_sec: f64,
    pub out_per_sec: f64,
}

/// Point-in-time view of every stage of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub elapsed_secs: f64,
    pub stages: Vec<StageSnapshot>,
}

impl StatsSnapshot {
    pub fn get(&self, name: &str) -> Option<&StageSnapshot> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Counters summed over all stages.
    pub fn totals(&self) -> StageCounters {
        self.stages
            .iter()
            .fold(StageCounters::default(), |acc, stage| StageCounters {
                items_in: acc.items_in + stage.counters.items_in,
                items_out: acc.items_out + stage.counters.items_out,
                errors: acc.errors + stage.counters.errors,
            })
    }
}

/// Read-only access to a run's counters. Cheap to clone, never blocks stages.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    stages: Arc<Vec<StageInfo>>,
    started: Arc<OnceLock<Instant>>,
}

impl StatsHandle {
    pub(crate) fn new(stages: Vec<StageInfo>, started: Arc<OnceLock<Instant>>) -> Self {
        Self {
            stages: Arc::new(stages),
            started,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started
            .get()
            .map(Instant::elapsed)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed_secs = self.elapsed().as_secs_f64();
        let rate = |count: u64| {
            if elapsed_secs > 0.0 {
                count as f64 / elapsed_secs
            } else {
                0.0
            }
        };

        StatsSnapshot {
            elapsed_secs,
            stages: self
                .stages
                .iter()
                .map(|info| {
                    let counters = info.stats.counters();
                    StageSnapshot {
                        num: info.num,
                        name: info.name.clone(),
                        workers: info.workers,
                        counters,
                        in_per_sec: rate(counters.items_in),
                        out_per_sec: rate(counters.items_out),
                    }
                })
                .collect(),
        }
    }
}

/// Logs per-stage throughput on an interval and once at the end.
pub struct StatsReporter {
    label: String,
    handle: StatsHandle,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(label: impl Into<String>, handle: StatsHandle, interval: Duration) -> Self {
        Self {
            label: label.into(),
            handle,
            interval,
        }
    }

    /// Report every `interval` until `stop` fires, then emit the final report.
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.interval.is_zero() {
                let start = tokio::time::Instant::now() + self.interval;
                let mut ticker = interval_at(start, self.interval);
                loop {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => self.report(false),
                    }
                }
            } else {
                stop.cancelled().await;
            }
            self.report(true);
        })
    }

    pub fn report(&self, last: bool) {
        let snapshot = self.handle.snapshot();
        for stage in &snapshot.stages {
            info!(
                run = %self.label,
                stage = %stage.name,
                num = stage.num,
                workers = stage.workers,
                items_in = stage.counters.items_in,
                items_out = stage.counters.items_out,
                errors = stage.counters.errors,
                in_per_sec = %format!("{:.2}", stage.in_per_sec),
                out_per_sec = %format!("{:.2}", stage.out_per_sec),
                final_report = last,
                "stage stats"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(num: usize, name: &str) -> StageInfo {
        StageInfo {
            num,
            name: name.into(),
            workers: 1,
            stats: Arc::new(StageStats::default()),
        }
    }

    #[test]
    fn snapshot_sums_counters() {
        let stages = vec![info(0, "list-source"), info(1, "finalize")];
        stages[0].stats.record_in();
        stages[0].stats.record_out();
        stages[1].stats.record_in();
        stages[1].stats.record_error();

        let handle = StatsHandle::new(stages, Arc::new(OnceLock::new()));
        let snapshot = handle.snapshot();

        assert_eq!(snapshot.elapsed_secs, 0.0);
        assert_eq!(snapshot.get("finalize").unwrap().counters.errors, 1);
        assert_eq!(
            snapshot.totals(),
            StageCounters {
                items_in: 2,
                items_out: 1,
                errors: 1
            }
        );
    }

    #[test]
    fn throughput_uses_elapsed_time() {
        let started = Arc::new(OnceLock::new());
        let _ = started.set(Instant::now() - Duration::from_secs(10));
        let stages = vec![info(0, "upload-object")];
        for _ in 0..20 {
            stages[0].stats.record_out();
        }

        let snapshot = StatsHandle::new(stages, started).snapshot();
        let out = snapshot.get("upload-object").unwrap().out_per_sec;
        assert!(out > 1.5 && out <= 2.0, "unexpected rate {out}");
    }
}
