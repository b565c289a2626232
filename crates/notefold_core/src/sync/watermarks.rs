//! Per-peer watermarks.
//!
//! A watermark is the last activity (or deletion) sequence this reader has
//! consumed from one peer writer. The table is in-memory on the hot path;
//! the SD manager persists it through a [`WatermarkStore`] periodically and
//! on clean shutdown so a restart doesn't reprocess the full history.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::Result;

/// Which log channel a watermark belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// `activity/` logs.
    Activity,
    /// `deleted/` logs.
    Deletion,
}

impl Channel {
    /// Stable string tag used by persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Activity => "activity",
            Channel::Deletion => "deletion",
        }
    }
}

/// Persistence seam for watermarks (implemented by the logical index).
pub trait WatermarkStore: Send + Sync {
    /// Load all persisted watermarks for one SD as
    /// `(channel_tag, writer_key, sequence)` triples.
    fn load_watermarks(&self, sd_id: &str) -> Result<Vec<(String, String, u64)>>;

    /// Persist one watermark.
    fn save_watermark(&self, sd_id: &str, channel: &str, writer: &str, seq: u64) -> Result<()>;
}

/// In-memory watermark table for one storage directory.
#[derive(Default)]
pub struct WatermarkTable {
    inner: Mutex<HashMap<(Channel, String), u64>>,
    dirty: AtomicBool,
}

impl WatermarkTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted state for an SD into a fresh table.
    pub fn load(store: &dyn WatermarkStore, sd_id: &str) -> Result<Self> {
        let table = Self::new();
        {
            let mut inner = table.inner.lock().unwrap();
            for (channel, writer, seq) in store.load_watermarks(sd_id)? {
                let channel = match channel.as_str() {
                    "deletion" => Channel::Deletion,
                    _ => Channel::Activity,
                };
                inner.insert((channel, writer), seq);
            }
        }
        Ok(table)
    }

    /// The last consumed sequence for a peer, or 0.
    pub fn get(&self, channel: Channel, writer: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .get(&(channel, writer.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Advance a peer's watermark. Never moves backwards.
    pub fn advance(&self, channel: Channel, writer: &str, seq: u64) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry((channel, writer.to_string())).or_insert(0);
        if seq > *entry {
            *entry = seq;
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    /// Persist the table if anything changed since the last persist.
    pub fn persist(&self, store: &dyn WatermarkStore, sd_id: &str) -> Result<()> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let snapshot: Vec<((Channel, String), u64)> = self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for ((channel, writer), seq) in snapshot {
            store.save_watermark(sd_id, channel.as_str(), &writer, seq)?;
        }
        Ok(())
    }
}
