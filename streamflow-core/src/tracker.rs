//! Per-channel update tracker.
//!
//! Persistent watermark of when each channel was last checked, which stream
//! IDs were seen, and when the last global sweep ran. The `needs_check` flag
//! is cleared only by [`UpdateTracker::mark_channel_checked`] — never when a
//! channel is merely enqueued, drained into a batch, or when a global sweep
//! begins.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::persist;

/// Watermark for one channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerRecord {
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_stream_count: usize,
    #[serde(default)]
    pub last_checked_stream_ids: Vec<i64>,
    #[serde(default)]
    pub needs_check: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TrackerState {
    #[serde(default)]
    channels: HashMap<i64, TrackerRecord>,
    #[serde(default)]
    last_global_check_at: Option<DateTime<Utc>>,
}

/// Persistent per-channel check watermarks plus the global-sweep timestamp
pub struct UpdateTracker {
    path: PathBuf,
    state: Mutex<TrackerState>,
}

impl UpdateTracker {
    /// Load the tracker from `path`, starting empty when the file is missing
    /// or corrupt.
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let state: TrackerState = persist::load_state(&path);
        if !state.channels.is_empty() {
            info!(count = state.channels.len(), "Loaded channel update tracker");
        }
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    fn save(&self, state: &TrackerState) {
        if let Err(err) = persist::save_state(&self.path, state) {
            warn!(path = %self.path.display(), error = %err, "Failed to save update tracker");
        }
    }

    /// Record that a channel's stream set changed (e.g. after an M3U
    /// refresh): sets `needs_check`, updates the stream count and the
    /// update timestamp. Leaves `last_checked_stream_ids` untouched so an
    /// incremental check can still tell new streams from known ones.
    pub fn mark_channel_updated(&self, channel_id: i64, stream_count: usize) {
        let mut state = self.state.lock();
        let record = state.channels.entry(channel_id).or_default();
        record.last_updated_at = Some(Utc::now());
        record.last_stream_count = stream_count;
        record.needs_check = true;
        self.save(&state);
        debug!(channel_id, stream_count, "Marked channel updated");
    }

    /// Batch variant of [`Self::mark_channel_updated`] with one durable write
    pub fn mark_channels_updated(&self, counts: &HashMap<i64, usize>) {
        if counts.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let now = Utc::now();
        for (&channel_id, &stream_count) in counts {
            let record = state.channels.entry(channel_id).or_default();
            record.last_updated_at = Some(now);
            record.last_stream_count = stream_count;
            record.needs_check = true;
        }
        self.save(&state);
        debug!(count = counts.len(), "Marked channels updated");
    }

    /// Record a completed check: clears `needs_check` and replaces the
    /// checked stream ID set. This is the only operation that clears the
    /// flag.
    pub fn mark_channel_checked(
        &self,
        channel_id: i64,
        stream_count: usize,
        checked_stream_ids: Vec<i64>,
    ) {
        let mut state = self.state.lock();
        let record = state.channels.entry(channel_id).or_default();
        record.last_checked_at = Some(Utc::now());
        record.last_stream_count = stream_count;
        record.last_checked_stream_ids = checked_stream_ids;
        record.needs_check = false;
        self.save(&state);
        debug!(channel_id, stream_count, "Marked channel checked");
    }

    /// Record that a global sweep ran. Only touches the global timestamp;
    /// every channel's `needs_check` keeps its value — queued is not checked.
    pub fn mark_global_check(&self) {
        let mut state = self.state.lock();
        state.last_global_check_at = Some(Utc::now());
        self.save(&state);
        info!("Marked global check");
    }

    #[must_use]
    pub fn last_global_check(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_global_check_at
    }

    /// IDs of all channels currently flagged as needing a check
    #[must_use]
    pub fn channels_needing_check(&self) -> Vec<i64> {
        let state = self.state.lock();
        let mut ids: Vec<i64> = state
            .channels
            .iter()
            .filter(|(_, record)| record.needs_check)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Up to `max` flagged channel IDs for one dirty-queue pass.
    ///
    /// Does **not** clear `needs_check`: the flag survives until the channel
    /// is actually checked, so a batch that never completes (guard active,
    /// queue full) is retried on a later pass.
    #[must_use]
    pub fn take_needing_check(&self, max: usize) -> Vec<i64> {
        let mut ids = self.channels_needing_check();
        ids.truncate(max);
        ids
    }

    #[must_use]
    pub fn needs_check(&self, channel_id: i64) -> bool {
        self.state
            .lock()
            .channels
            .get(&channel_id)
            .is_some_and(|record| record.needs_check)
    }

    /// Stream IDs recorded at the channel's last completed check;
    /// empty for channels never checked.
    #[must_use]
    pub fn checked_stream_ids(&self, channel_id: i64) -> Vec<i64> {
        self.state
            .lock()
            .channels
            .get(&channel_id)
            .map(|record| record.last_checked_stream_ids.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn record(&self, channel_id: i64) -> Option<TrackerRecord> {
        self.state.lock().channels.get(&channel_id).cloned()
    }
}
