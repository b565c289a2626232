//! Sync metrics hooks.
//!
//! The shell may wire these counters into its telemetry; the engine calls
//! them and ships a no-op default.

use std::time::Duration;

/// Counters a sync driver reports into. All methods default to no-ops so
/// implementers only override what they care about.
pub trait SyncMetrics: Send + Sync {
    /// A sync cycle completed successfully.
    fn sync_succeeded(&self, _elapsed: Duration) {}

    /// A sync cycle failed.
    fn sync_failed(&self) {}

    /// A note reload exhausted its retries.
    fn reload_timed_out(&self) {}

    /// A full activity-log scan happened (watermark miss or first contact).
    fn full_scan(&self) {}

    /// How many peer log entries one cycle processed.
    fn entries_processed(&self, _count: usize) {}

    /// A stale entry was recorded.
    fn stale_recorded(&self) {}
}

/// The default metrics sink: counts nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl SyncMetrics for NoopMetrics {}
