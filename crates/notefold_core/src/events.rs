//! Domain events.
//!
//! External collaborators (shell, UI, RPC layer) observe the engine through
//! a broadcast bus of tagged events. Sync cycles collect all affected notes
//! before broadcasting, so observers see a set of events per cycle, not a
//! dribble.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::sync::StaleEntry;

/// Capacity of the broadcast channel. Slow receivers that fall further
/// behind than this start missing events (tokio broadcast semantics).
const EVENT_BUS_CAPACITY: usize = 1024;

/// Events emitted by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum NoteEvent {
    /// A note previously unknown to this instance appeared.
    Created {
        /// The new note.
        note_id: String,
        /// The SD it lives in.
        sd_id: String,
        /// Cached title at load time.
        title: String,
    },

    /// A known note's CRDT state changed.
    Updated {
        /// The updated note.
        note_id: String,
        /// The SD it lives in.
        sd_id: String,
        /// Full encoded CRDT state after the reload, for live editors.
        state: Vec<u8>,
    },

    /// A note's folder placement changed (metadata diff during reload).
    Moved {
        /// The moved note.
        note_id: String,
        /// The SD it lives in.
        sd_id: String,
        /// Previous folder, or None for the root.
        old_folder: Option<String>,
        /// New folder, or None for the root.
        new_folder: Option<String>,
    },

    /// A note was permanently deleted. Terminal: the note will not come
    /// back within this run.
    PermanentDeleted {
        /// The deleted note.
        note_id: String,
        /// The SD it lived in.
        sd_id: String,
    },

    /// The folder tree of an SD changed.
    FolderTreeChanged {
        /// The affected SD.
        sd_id: String,
    },

    /// A stale gap was recorded; operators may want to surface it.
    StaleSync {
        /// The affected SD.
        sd_id: String,
        /// The recorded gap.
        entry: StaleEntry,
    },
}

impl NoteEvent {
    /// The event type as a string, for logging and dispatch tables.
    pub fn event_type(&self) -> &'static str {
        match self {
            NoteEvent::Created { .. } => "note:created",
            NoteEvent::Updated { .. } => "note:updated",
            NoteEvent::Moved { .. } => "note:moved",
            NoteEvent::PermanentDeleted { .. } => "note:permanent-deleted",
            NoteEvent::FolderTreeChanged { .. } => "folders:changed",
            NoteEvent::StaleSync { .. } => "sync:stale",
        }
    }
}

/// Broadcast bus carrying [`NoteEvent`]s to external collaborators.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NoteEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<NoteEvent> {
        self.sender.subscribe()
    }

    /// Emit one event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: NoteEvent) {
        tracing::debug!("event: {}", event.event_type());
        let _ = self.sender.send(event);
    }

    /// Emit a batch collected by a sync cycle.
    pub fn emit_all(&self, events: impl IntoIterator<Item = NoteEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}
