// Run metrics
//
// Lock-free counters updated from pair tasks and logged once a run finishes.

use crate::error::StageKind;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters for one orchestrator.
///
/// Uses atomic operations so every pair task can record without locking.
#[derive(Debug)]
pub struct RunMetrics {
    /// Pairs that reached `Complete`
    pub pairs_completed: AtomicUsize,

    /// Pairs that ended `Failed` for any reason other than cancellation
    pub pairs_failed: AtomicUsize,

    /// Pairs stopped by a cancellation request
    pub pairs_cancelled: AtomicUsize,

    /// Stage invocations, successful or not
    pub stage_invocations: AtomicU64,

    /// Stage invocations that returned an error
    pub stage_failures: AtomicU64,

    /// Stage failures classified as timeouts
    pub stage_timeouts: AtomicU64,

    /// Cumulative stage wall time in milliseconds
    pub total_stage_time_ms: AtomicU64,

    /// Wall time per stage kind in milliseconds: comparison, diff detail, color
    stage_time_ms: [AtomicU64; 3],

    start_time: Instant,
}

fn stage_index(stage: StageKind) -> usize {
    match stage {
        StageKind::Comparison => 0,
        StageKind::DiffDetail => 1,
        StageKind::ColorApplication => 2,
    }
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            pairs_completed: AtomicUsize::new(0),
            pairs_failed: AtomicUsize::new(0),
            pairs_cancelled: AtomicUsize::new(0),
            stage_invocations: AtomicU64::new(0),
            stage_failures: AtomicU64::new(0),
            stage_timeouts: AtomicU64::new(0),
            total_stage_time_ms: AtomicU64::new(0),
            stage_time_ms: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            start_time: Instant::now(),
        }
    }

    pub fn record_pair_completed(&self) {
        self.pairs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pair_failed(&self) {
        self.pairs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pair_cancelled(&self) {
        self.pairs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one finished stage invocation.
    pub fn record_stage(
        &self,
        stage: StageKind,
        duration: Duration,
        failed: bool,
        timed_out: bool,
    ) {
        let ms = duration.as_millis() as u64;
        self.stage_invocations.fetch_add(1, Ordering::Relaxed);
        self.total_stage_time_ms.fetch_add(ms, Ordering::Relaxed);
        self.stage_time_ms[stage_index(stage)].fetch_add(ms, Ordering::Relaxed);
        if failed {
            self.stage_failures.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.stage_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stage_time(&self, stage: StageKind) -> Duration {
        Duration::from_millis(self.stage_time_ms[stage_index(stage)].load(Ordering::Relaxed))
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average stage time in milliseconds
    pub fn avg_stage_time_ms(&self) -> f64 {
        let total = self.total_stage_time_ms.load(Ordering::Relaxed);
        let count = self.stage_invocations.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("=== Run Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Pairs: {} complete, {} failed, {} cancelled",
            self.pairs_completed.load(Ordering::Relaxed),
            self.pairs_failed.load(Ordering::Relaxed),
            self.pairs_cancelled.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Stages: {} run, {} failed, {} timed out (avg: {:.2}ms per stage)",
            self.stage_invocations.load(Ordering::Relaxed),
            self.stage_failures.load(Ordering::Relaxed),
            self.stage_timeouts.load(Ordering::Relaxed),
            self.avg_stage_time_ms()
        );
        tracing::info!(
            "Stage time: comparison {:.2}s, diff {:.2}s, color {:.2}s",
            self.stage_time(StageKind::Comparison).as_secs_f64(),
            self.stage_time(StageKind::DiffDetail).as_secs_f64(),
            self.stage_time(StageKind::ColorApplication).as_secs_f64()
        );
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}
