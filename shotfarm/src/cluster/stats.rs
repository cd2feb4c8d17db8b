//! Task statistics for the worker pool

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters updated by every dispatched partition task
#[derive(Debug)]
pub struct TaskStats {
    /// Tasks that returned a result
    pub tasks_completed: AtomicU64,

    /// Tasks that returned an error or panicked
    pub tasks_failed: AtomicU64,

    /// Total task execution time (milliseconds)
    pub total_execution_time_ms: AtomicU64,

    /// Tasks currently executing
    pub active_tasks: AtomicU64,

    /// Values distributed with `scatter`
    pub broadcasts: AtomicU64,

    /// Start time for uptime tracking
    pub start_time: Instant,
}

impl Default for TaskStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStats {
    pub fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_execution_time_ms: AtomicU64::new(0),
            active_tasks: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a successful task
    pub fn record_success(&self, execution_time_ms: u64) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
    }

    /// Record a failed task
    pub fn record_failure(&self, execution_time_ms: u64) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start_task(&self) {
        self.active_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_task(&self) {
        self.active_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    /// Tasks processed (completed + failed)
    pub fn total_tasks(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed) + self.tasks_failed.load(Ordering::Relaxed)
    }

    /// Average execution time (milliseconds)
    pub fn avg_execution_time_ms(&self) -> f64 {
        let total_tasks = self.total_tasks();
        if total_tasks == 0 {
            return 0.0;
        }

        let total_time = self.total_execution_time_ms.load(Ordering::Relaxed);
        total_time as f64 / total_tasks as f64
    }

    /// Success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total_tasks = self.total_tasks();
        if total_tasks == 0 {
            return 0.0;
        }

        let completed = self.tasks_completed.load(Ordering::Relaxed);
        completed as f64 / total_tasks as f64
    }

    /// Print statistics summary
    pub fn print_summary(&self) {
        info!(
            total_tasks = self.total_tasks(),
            completed = self.tasks_completed.load(Ordering::Relaxed),
            failed = self.tasks_failed.load(Ordering::Relaxed),
            broadcasts = self.broadcasts.load(Ordering::Relaxed),
            avg_execution_time_ms = %format!("{:.2}", self.avg_execution_time_ms()),
            success_rate = %format!("{:.1}%", self.success_rate() * 100.0),
            uptime_s = self.start_time.elapsed().as_secs(),
            "Task statistics"
        );
    }
}

/// Concurrency gauge for one worker slot
#[derive(Debug, Default)]
pub struct SlotGauge {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl SlotGauge {
    pub fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of tasks seen running at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_stats() {
        let stats = TaskStats::new();
        assert_eq!(stats.success_rate(), 0.0);

        stats.record_success(100);
        stats.record_success(200);
        stats.record_failure(300);

        assert_eq!(stats.total_tasks(), 3);
        assert_eq!(stats.avg_execution_time_ms(), 200.0);
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_active_tasks() {
        let stats = TaskStats::new();
        stats.start_task();
        stats.start_task();
        stats.finish_task();
        assert_eq!(stats.active_tasks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_slot_gauge_peak() {
        let gauge = SlotGauge::default();
        gauge.enter();
        gauge.enter();
        gauge.exit();
        gauge.enter();
        gauge.exit();
        gauge.exit();
        assert_eq!(gauge.peak(), 2);
    }
}
