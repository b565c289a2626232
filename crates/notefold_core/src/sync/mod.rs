//! Activity and deletion logging and sync.
//!
//! This tier advertises local CRDT writes (loggers) and consumes the other
//! instances' advertisements (sync consumers), maintaining per-peer
//! watermarks and surfacing stale gaps for the polling tier and the
//! operator.

mod activity_log;
mod activity_sync;
mod deletion_log;
mod deletion_sync;
pub mod line;
mod metrics;
mod stale;
mod watermarks;

pub use activity_log::{ActivityLogger, FLUSH_WINDOW};
pub use activity_sync::{ActivitySync, SkipStore, SyncCallbacks};
pub use deletion_log::DeletionLogger;
pub use deletion_sync::{DeletionCallbacks, DeletionSync};
pub use line::{ActivityEntry, ActivityKind, DeletionEntry};
pub use metrics::{NoopMetrics, SyncMetrics};
pub use stale::{StaleDiagnostic, StaleEntry, StaleTracker};
pub use watermarks::{Channel, WatermarkStore, WatermarkTable};
