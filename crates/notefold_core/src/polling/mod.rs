//! Priority-weighted polling group.
//!
//! Filesystem watchers are unreliable on networked filesystems and under
//! cloud-sync agents, so the engine also polls selected notes on a budget.
//! Each tick earns tokens from the configured poll rate; entries are drawn
//! in priority order, with a slice of every tick's capacity reserved for
//! the non-top classes so low-priority notes are never starved.
//!
//! The group is deliberately driven from outside ([`PollingGroup::tick`])
//! so tests control time; [`PollingGroup::spawn_driver`] wires it to a
//! tokio interval for production.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Polling configuration. The defaults are the tuned production values.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Token earn rate.
    pub poll_rate_per_minute: f64,
    /// Fraction of a token refunded when a poll finds changes.
    pub hit_rate_multiplier: f64,
    /// Token bucket capacity; bounds polls per second.
    pub max_burst_per_second: f64,
    /// Fraction of each tick's capacity reserved for non-top-priority
    /// classes.
    pub normal_priority_reserve: f64,
    /// How long a locally edited note stays in the recent-edit class.
    pub recent_edit_window: Duration,
    /// Period of the full-repoll sweep. Zero disables it.
    pub full_repoll_interval: Duration,
    /// How long a fast-path handoff entry is retried before aging out.
    pub fast_path_max_delay: Duration,
    /// Scheduler tick period.
    pub tick_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_rate_per_minute: 120.0,
            hit_rate_multiplier: 0.25,
            max_burst_per_second: 10.0,
            normal_priority_reserve: 0.20,
            recent_edit_window: Duration::from_secs(5 * 60),
            full_repoll_interval: Duration::from_secs(30 * 60),
            fast_path_max_delay: Duration::from_secs(60),
            tick_interval: Duration::from_millis(500),
        }
    }
}

/// Priority classes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PollPriority {
    /// An activity line was seen but the CRDT file wasn't visible yet.
    FastPathHandoff,
    /// The user edited this note locally within the recent-edit window.
    RecentEdit,
    /// Currently open in some UI window.
    Open,
    /// Visible in a list UI.
    InList,
    /// Periodic sweep entry.
    FullRepoll,
}

/// One scheduled poll target.
#[derive(Debug, Clone)]
struct PollEntry {
    sd_id: String,
    note_id: String,
    priority: PollPriority,
    enqueued_at: Instant,
    /// For fast-path entries: the (writer, seq) CRDT logs we're waiting on.
    expected: Vec<(String, u64)>,
}

/// Capability record the polling group drives syncs through.
#[derive(Clone)]
pub struct PollCallbacks {
    /// Run one sync cycle for an SD. Returns whether anything changed
    /// (a "hit", partially refunding the token).
    pub sync_sd: Arc<dyn Fn(&str) -> bool + Send + Sync>,

    /// Does `notes/<note>/logs/<writer>_<seq>.crdtlog` exist in the SD?
    pub check_log_exists: Arc<dyn Fn(&str, &str, &str, u64) -> bool + Send + Sync>,

    /// Every non-deleted note of every SD, as `(sd_id, note_id)`. Feeds the
    /// full-repoll sweep.
    pub list_all_notes: Arc<dyn Fn() -> Vec<(String, String)> + Send + Sync>,
}

/// The priority-weighted background poller. One per engine.
pub struct PollingGroup {
    config: PollConfig,
    callbacks: Mutex<PollCallbacks>,
    state: Mutex<GroupState>,
    shutdown: Notify,
}

struct GroupState {
    entries: Vec<PollEntry>,
    tokens: f64,
    last_tick: Option<Instant>,
    last_full_repoll: Option<Instant>,
}

impl PollingGroup {
    /// Create a group with the given configuration.
    pub fn new(config: PollConfig, callbacks: PollCallbacks) -> Self {
        Self {
            config,
            callbacks: Mutex::new(callbacks),
            state: Mutex::new(GroupState {
                entries: Vec::new(),
                tokens: 0.0,
                last_tick: None,
                last_full_repoll: None,
            }),
            shutdown: Notify::new(),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Replace the sync callback after construction. The engine wires
    /// itself in once the SD managers exist.
    pub fn set_sync_callback(&self, sync_sd: Arc<dyn Fn(&str) -> bool + Send + Sync>) {
        self.callbacks.lock().unwrap().sync_sd = sync_sd;
    }

    // ==================== Enqueueing ====================

    /// Enqueue a fast-path handoff: an activity line advertised CRDT logs we
    /// can't see yet.
    pub fn add_fast_path(&self, sd_id: &str, note_id: &str, expected: Vec<(String, u64)>) {
        self.add_entry(sd_id, note_id, PollPriority::FastPathHandoff, expected);
    }

    /// Record a local edit; the note is re-polled for the recent-edit
    /// window.
    pub fn mark_recent_edit(&self, sd_id: &str, note_id: &str) {
        self.remove_entry(sd_id, note_id, PollPriority::RecentEdit);
        self.add_entry(sd_id, note_id, PollPriority::RecentEdit, Vec::new());
    }

    /// Flag or unflag a note as open in a UI window.
    pub fn set_open(&self, sd_id: &str, note_id: &str, open: bool) {
        if open {
            self.add_entry(sd_id, note_id, PollPriority::Open, Vec::new());
        } else {
            self.remove_entry(sd_id, note_id, PollPriority::Open);
        }
    }

    /// Flag or unflag a note as visible in a list UI.
    pub fn set_in_list(&self, sd_id: &str, note_id: &str, in_list: bool) {
        if in_list {
            self.add_entry(sd_id, note_id, PollPriority::InList, Vec::new());
        } else {
            self.remove_entry(sd_id, note_id, PollPriority::InList);
        }
    }

    fn add_entry(&self, sd_id: &str, note_id: &str, priority: PollPriority, expected: Vec<(String, u64)>) {
        let mut state = self.state.lock().unwrap();
        if state
            .entries
            .iter()
            .any(|e| e.sd_id == sd_id && e.note_id == note_id && e.priority == priority)
        {
            return;
        }
        state.entries.push(PollEntry {
            sd_id: sd_id.to_string(),
            note_id: note_id.to_string(),
            priority,
            enqueued_at: Instant::now(),
            expected,
        });
    }

    fn remove_entry(&self, sd_id: &str, note_id: &str, priority: PollPriority) {
        self.state
            .lock()
            .unwrap()
            .entries
            .retain(|e| !(e.sd_id == sd_id && e.note_id == note_id && e.priority == priority));
    }

    /// Number of queued entries (all classes).
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ==================== Scheduling ====================

    /// Run one scheduler tick at `now`. Returns the `(sd, note)` pairs
    /// polled this tick.
    pub fn tick(&self, now: Instant) -> Vec<(String, String)> {
        let callbacks = self.callbacks.lock().unwrap().clone();
        let to_poll = {
            let mut state = self.state.lock().unwrap();

            // Earn tokens since the last tick, bounded by burst capacity.
            let elapsed = state
                .last_tick
                .map(|last| now.saturating_duration_since(last))
                .unwrap_or(self.config.tick_interval);
            state.last_tick = Some(now);
            state.tokens = (state.tokens
                + self.config.poll_rate_per_minute * elapsed.as_secs_f64() / 60.0)
                .min(self.config.max_burst_per_second);

            self.expire_entries(&mut state, &callbacks, now);
            self.maybe_full_repoll(&mut state, &callbacks, now);
            self.draw(&mut state)
        };

        let mut polled = Vec::new();
        for entry in &to_poll {
            let hit = (callbacks.sync_sd)(&entry.sd_id);
            if hit {
                let mut state = self.state.lock().unwrap();
                state.tokens = (state.tokens + self.config.hit_rate_multiplier)
                    .min(self.config.max_burst_per_second);
            }
            polled.push((entry.sd_id.clone(), entry.note_id.clone()));
        }
        polled
    }

    /// Drop entries whose exit criteria are met.
    fn expire_entries(&self, state: &mut GroupState, callbacks: &PollCallbacks, now: Instant) {
        let config = &self.config;
        state.entries.retain(|entry| {
            let age = now.saturating_duration_since(entry.enqueued_at);
            match entry.priority {
                PollPriority::FastPathHandoff => {
                    let satisfied = !entry.expected.is_empty()
                        && entry.expected.iter().all(|(writer, seq)| {
                            (callbacks.check_log_exists)(&entry.sd_id, &entry.note_id, writer, *seq)
                        });
                    !satisfied && age <= config.fast_path_max_delay
                }
                PollPriority::RecentEdit => age <= config.recent_edit_window,
                // Open/InList entries stay until explicitly unflagged.
                PollPriority::Open | PollPriority::InList => true,
                // FullRepoll entries are removed after their one poll (in draw).
                PollPriority::FullRepoll => true,
            }
        });
    }

    /// Enqueue the periodic full sweep when due.
    fn maybe_full_repoll(&self, state: &mut GroupState, callbacks: &PollCallbacks, now: Instant) {
        if self.config.full_repoll_interval.is_zero() {
            return;
        }
        let due = state
            .last_full_repoll
            .map(|last| now.saturating_duration_since(last) >= self.config.full_repoll_interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        state.last_full_repoll = Some(now);
        for (sd_id, note_id) in (callbacks.list_all_notes)() {
            if state
                .entries
                .iter()
                .any(|e| e.sd_id == sd_id && e.note_id == note_id && e.priority == PollPriority::FullRepoll)
            {
                continue;
            }
            state.entries.push(PollEntry {
                sd_id,
                note_id,
                priority: PollPriority::FullRepoll,
                enqueued_at: now,
                expected: Vec::new(),
            });
        }
    }

    /// Draw this tick's entries by priority, reserving part of the budget
    /// for the non-top classes.
    fn draw(&self, state: &mut GroupState) -> Vec<PollEntry> {
        let available = state.tokens.floor() as usize;
        if available == 0 || state.entries.is_empty() {
            return Vec::new();
        }

        // Stable order: priority class first, then FIFO.
        let mut order: Vec<usize> = (0..state.entries.len()).collect();
        order.sort_by(|&a, &b| {
            let (ea, eb) = (&state.entries[a], &state.entries[b]);
            ea.priority
                .cmp(&eb.priority)
                .then(ea.enqueued_at.cmp(&eb.enqueued_at))
        });

        let top_class = state.entries[order[0]].priority;
        let has_lower = state
            .entries
            .iter()
            .any(|e| e.priority != top_class);
        // Reserve a share for non-top classes only when both exist.
        let top_budget = if has_lower {
            let reserved = (available as f64 * self.config.normal_priority_reserve).ceil() as usize;
            available.saturating_sub(reserved).max(1)
        } else {
            available
        };

        let mut drawn_indices = Vec::new();
        let mut spent_top = 0usize;
        for &i in &order {
            if drawn_indices.len() >= available {
                break;
            }
            let entry = &state.entries[i];
            if entry.priority == top_class {
                if spent_top >= top_budget {
                    continue;
                }
                spent_top += 1;
            }
            drawn_indices.push(i);
        }

        state.tokens -= drawn_indices.len() as f64;

        // Remove one-shot entries (full-repoll) and collect the draw.
        let mut drawn = Vec::new();
        drawn_indices.sort_unstable();
        for &i in drawn_indices.iter().rev() {
            let entry = state.entries[i].clone();
            if entry.priority == PollPriority::FullRepoll {
                state.entries.remove(i);
            }
            drawn.push(entry);
        }
        drawn.reverse();
        drawn
    }

    // ==================== Driver ====================

    /// Spawn the tokio driver task. It ticks until [`PollingGroup::stop`] is
    /// called.
    pub fn spawn_driver(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let group = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(group.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        group.tick(Instant::now());
                    }
                    _ = group.shutdown.notified() => break,
                }
            }
        })
    }

    /// Stop the driver task.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        synced: Arc<StdMutex<Vec<String>>>,
        existing_logs: Arc<StdMutex<HashSet<(String, String, u64)>>>,
    }

    fn group_with(config: PollConfig) -> (Arc<PollingGroup>, Recorder) {
        let synced = Arc::new(StdMutex::new(Vec::new()));
        let existing_logs: Arc<StdMutex<HashSet<(String, String, u64)>>> =
            Arc::new(StdMutex::new(HashSet::new()));

        let synced_cb = synced.clone();
        let logs_cb = existing_logs.clone();
        let callbacks = PollCallbacks {
            sync_sd: Arc::new(move |sd: &str| {
                synced_cb.lock().unwrap().push(sd.to_string());
                false
            }),
            check_log_exists: Arc::new(move |_sd, note, writer, seq| {
                logs_cb
                    .lock()
                    .unwrap()
                    .contains(&(note.to_string(), writer.to_string(), seq))
            }),
            list_all_notes: Arc::new(Vec::new),
        };

        (
            Arc::new(PollingGroup::new(config, callbacks)),
            Recorder {
                synced,
                existing_logs,
            },
        )
    }

    fn test_config() -> PollConfig {
        PollConfig {
            full_repoll_interval: Duration::ZERO,
            ..PollConfig::default()
        }
    }

    #[test]
    fn test_tokens_bound_polls() {
        let (group, rec) = group_with(test_config());
        for i in 0..50 {
            group.set_open("sd-1", &format!("n-{i}"), true);
        }

        // One 500ms tick earns one token (120/min), so one poll happens.
        let t0 = Instant::now();
        group.tick(t0);
        let first = rec.synced.lock().unwrap().len();
        assert!(first <= 1, "earned at most one token, polled {first}");

        // A long idle period is capped at burst capacity (10).
        let polled = group.tick(t0 + Duration::from_secs(600));
        assert!(polled.len() <= 10, "burst cap exceeded: {}", polled.len());
    }

    #[test]
    fn test_fast_path_exits_when_expected_seen() {
        let (group, rec) = group_with(test_config());
        group.add_fast_path("sd-1", "n-1", vec![("peer".to_string(), 2)]);
        assert_eq!(group.len(), 1);

        // Expected log appears: entry drops out on the next tick.
        rec.existing_logs
            .lock()
            .unwrap()
            .insert(("n-1".to_string(), "peer".to_string(), 2));
        group.tick(Instant::now());
        assert!(group.is_empty());
    }

    #[test]
    fn test_fast_path_ages_out() {
        let (group, _rec) = group_with(test_config());
        group.add_fast_path("sd-1", "n-1", vec![("peer".to_string(), 2)]);

        let later = Instant::now() + Duration::from_secs(120);
        group.tick(later);
        assert!(group.is_empty(), "fast-path entry should age out after 60s");
    }

    #[test]
    fn test_open_entries_persist_until_unflagged() {
        let (group, _rec) = group_with(test_config());
        group.set_open("sd-1", "n-1", true);
        group.tick(Instant::now() + Duration::from_secs(3600));
        assert_eq!(group.len(), 1);
        group.set_open("sd-1", "n-1", false);
        assert!(group.is_empty());
    }

    #[test]
    fn test_reserve_prevents_starvation() {
        // Many fast-path entries (top class) must not consume the whole
        // budget while lower-priority entries wait.
        let (group, rec) = group_with(test_config());
        for i in 0..30 {
            group.add_fast_path("sd-top", &format!("n-{i}"), vec![("p".to_string(), 1)]);
        }
        group.set_open("sd-low", "n-low", true);

        // Earn a full burst of tokens (inside the fast-path age window).
        let t0 = Instant::now();
        group.tick(t0);
        let polled = group.tick(t0 + Duration::from_secs(50));

        assert!(
            polled.iter().any(|(sd, _)| sd == "sd-top"),
            "top class gets the bulk of the budget; polled: {polled:?}"
        );
        assert!(
            polled.iter().any(|(sd, _)| sd == "sd-low"),
            "reserved share must reach the lower class; polled: {polled:?}"
        );
        assert!(rec.synced.lock().unwrap().iter().any(|sd| sd == "sd-low"));
    }

    #[test]
    fn test_full_repoll_enqueues_every_note_once() {
        let config = PollConfig {
            full_repoll_interval: Duration::from_secs(1800),
            ..PollConfig::default()
        };
        let synced = Arc::new(StdMutex::new(Vec::new()));
        let synced_cb = synced.clone();
        let callbacks = PollCallbacks {
            sync_sd: Arc::new(move |sd: &str| {
                synced_cb.lock().unwrap().push(sd.to_string());
                false
            }),
            check_log_exists: Arc::new(|_, _, _, _| false),
            list_all_notes: Arc::new(|| {
                vec![
                    ("sd-1".to_string(), "n-1".to_string()),
                    ("sd-1".to_string(), "n-2".to_string()),
                ]
            }),
        };
        let group = PollingGroup::new(config, callbacks);

        let t0 = Instant::now();
        group.tick(t0);
        // Sweep entries are queued; they drain as tokens accrue and are
        // not re-added within the interval.
        group.tick(t0 + Duration::from_secs(30));
        group.tick(t0 + Duration::from_secs(60));
        assert!(group.len() <= 2);
        assert!(!synced.lock().unwrap().is_empty());
    }

    #[test]
    fn test_recent_edit_window_expiry() {
        let (group, _rec) = group_with(test_config());
        group.mark_recent_edit("sd-1", "n-1");
        assert_eq!(group.len(), 1);

        group.tick(Instant::now() + Duration::from_secs(6 * 60));
        assert!(group.is_empty());
    }
}
