//! Channel, group and account settings not owned by the upstream.
//!
//! Two persistent stores: per-channel/per-group matching+checking modes with
//! channel-overrides-group inheritance, and per-account priority modes with a
//! global fallback. Both are plain JSON files, written through on mutation.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::PriorityMode;
use crate::persist;

/// Whether a channel participates in matching or checking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Enabled,
    Disabled,
}

impl Mode {
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Where an effective setting came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingSource {
    Channel,
    Group,
    Default,
}

/// Explicit mode overrides for one channel or group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching_mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checking_mode: Option<Mode>,
}

/// Resolved settings for one channel, with provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectiveSettings {
    pub matching_mode: Mode,
    pub matching_source: SettingSource,
    pub checking_mode: Mode,
    pub checking_source: SettingSource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChannelSettingsState {
    #[serde(default)]
    channels: HashMap<i64, ModeSettings>,
    #[serde(default)]
    groups: HashMap<i64, ModeSettings>,
}

/// Persistent per-channel and per-group mode settings.
///
/// Resolution order: channel override, then group, then enabled.
pub struct ChannelSettingsStore {
    path: PathBuf,
    state: Mutex<ChannelSettingsState>,
}

impl ChannelSettingsStore {
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let state: ChannelSettingsState = persist::load_state(&path);
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    fn save(&self, state: &ChannelSettingsState) {
        if let Err(err) = persist::save_state(&self.path, state) {
            warn!(path = %self.path.display(), error = %err, "Failed to save channel settings");
        }
    }

    /// Set a channel's overrides; `None` leaves the current value in place
    pub fn set_channel_modes(
        &self,
        channel_id: i64,
        matching_mode: Option<Mode>,
        checking_mode: Option<Mode>,
    ) {
        let mut state = self.state.lock();
        let entry = state.channels.entry(channel_id).or_default();
        if let Some(mode) = matching_mode {
            entry.matching_mode = Some(mode);
        }
        if let Some(mode) = checking_mode {
            entry.checking_mode = Some(mode);
        }
        self.save(&state);
        debug!(channel_id, "Updated channel modes");
    }

    /// Set a group's overrides; `None` leaves the current value in place
    pub fn set_group_modes(
        &self,
        group_id: i64,
        matching_mode: Option<Mode>,
        checking_mode: Option<Mode>,
    ) {
        let mut state = self.state.lock();
        let entry = state.groups.entry(group_id).or_default();
        if let Some(mode) = matching_mode {
            entry.matching_mode = Some(mode);
        }
        if let Some(mode) = checking_mode {
            entry.checking_mode = Some(mode);
        }
        self.save(&state);
        debug!(group_id, "Updated group modes");
    }

    /// Resolve one channel's effective settings with provenance
    #[must_use]
    pub fn effective(&self, channel_id: i64, group_id: Option<i64>) -> EffectiveSettings {
        let state = self.state.lock();
        let channel = state.channels.get(&channel_id).copied().unwrap_or_default();
        let group = group_id
            .and_then(|id| state.groups.get(&id).copied())
            .unwrap_or_default();

        let (matching_mode, matching_source) = resolve(channel.matching_mode, group.matching_mode);
        let (checking_mode, checking_source) = resolve(channel.checking_mode, group.checking_mode);

        EffectiveSettings {
            matching_mode,
            matching_source,
            checking_mode,
            checking_source,
        }
    }

    #[must_use]
    pub fn is_checking_enabled(&self, channel_id: i64, group_id: Option<i64>) -> bool {
        self.effective(channel_id, group_id).checking_mode.is_enabled()
    }

    #[must_use]
    pub fn is_matching_enabled(&self, channel_id: i64, group_id: Option<i64>) -> bool {
        self.effective(channel_id, group_id).matching_mode.is_enabled()
    }
}

fn resolve(channel: Option<Mode>, group: Option<Mode>) -> (Mode, SettingSource) {
    if let Some(mode) = channel {
        (mode, SettingSource::Channel)
    } else if let Some(mode) = group {
        (mode, SettingSource::Group)
    } else {
        (Mode::Enabled, SettingSource::Default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PriorityModeState {
    #[serde(default)]
    accounts: HashMap<i64, PriorityMode>,
    #[serde(default = "default_global_mode")]
    global_priority_mode: PriorityMode,
}

const fn default_global_mode() -> PriorityMode {
    PriorityMode::Disabled
}

impl Default for PriorityModeState {
    fn default() -> Self {
        Self {
            accounts: HashMap::new(),
            global_priority_mode: default_global_mode(),
        }
    }
}

/// Persistent per-account priority modes with a global fallback.
///
/// An account without an explicit mode follows the global mode at lookup
/// time, so changing the global setting takes effect immediately for all
/// such accounts.
pub struct PriorityModeStore {
    path: PathBuf,
    state: Mutex<PriorityModeState>,
}

impl PriorityModeStore {
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let state: PriorityModeState = persist::load_state(&path);
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    fn save(&self, state: &PriorityModeState) {
        if let Err(err) = persist::save_state(&self.path, state) {
            warn!(path = %self.path.display(), error = %err, "Failed to save priority modes");
        }
    }

    /// Effective mode for an account: explicit override or global fallback
    #[must_use]
    pub fn effective_mode(&self, account_id: i64) -> PriorityMode {
        let state = self.state.lock();
        state
            .accounts
            .get(&account_id)
            .copied()
            .unwrap_or(state.global_priority_mode)
    }

    #[must_use]
    pub fn global_mode(&self) -> PriorityMode {
        self.state.lock().global_priority_mode
    }

    pub fn set_account_mode(&self, account_id: i64, mode: PriorityMode) {
        let mut state = self.state.lock();
        state.accounts.insert(account_id, mode);
        self.save(&state);
        debug!(account_id, mode = ?mode, "Set account priority mode");
    }

    /// Remove an account's override so it follows the global mode again
    pub fn clear_account_mode(&self, account_id: i64) {
        let mut state = self.state.lock();
        state.accounts.remove(&account_id);
        self.save(&state);
    }

    pub fn set_global_mode(&self, mode: PriorityMode) {
        let mut state = self.state.lock();
        state.global_priority_mode = mode;
        self.save(&state);
        debug!(mode = ?mode, "Set global priority mode");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_store() -> (tempfile::TempDir, ChannelSettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChannelSettingsStore::load(dir.path().join("channel_settings.json"));
        (dir, store)
    }

    fn priority_store() -> (tempfile::TempDir, PriorityModeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PriorityModeStore::load(dir.path().join("priority_modes.json"));
        (dir, store)
    }

    #[test]
    fn test_channel_override_beats_group() {
        let (_dir, store) = channel_store();
        store.set_group_modes(1, Some(Mode::Disabled), Some(Mode::Disabled));
        store.set_channel_modes(100, Some(Mode::Enabled), Some(Mode::Enabled));

        let effective = store.effective(100, Some(1));
        assert_eq!(effective.checking_mode, Mode::Enabled);
        assert_eq!(effective.checking_source, SettingSource::Channel);
        assert_eq!(effective.matching_source, SettingSource::Channel);
    }

    #[test]
    fn test_group_inheritance() {
        let (_dir, store) = channel_store();
        store.set_group_modes(2, Some(Mode::Disabled), Some(Mode::Disabled));

        let effective = store.effective(200, Some(2));
        assert_eq!(effective.checking_mode, Mode::Disabled);
        assert_eq!(effective.checking_source, SettingSource::Group);
        assert!(!store.is_checking_enabled(200, Some(2)));
    }

    #[test]
    fn test_defaults_without_group() {
        let (_dir, store) = channel_store();
        let effective = store.effective(300, None);
        assert_eq!(effective.checking_mode, Mode::Enabled);
        assert_eq!(effective.checking_source, SettingSource::Default);
        assert!(store.is_checking_enabled(300, None));
    }

    #[test]
    fn test_partial_override() {
        let (_dir, store) = channel_store();
        store.set_group_modes(3, Some(Mode::Disabled), Some(Mode::Disabled));
        store.set_channel_modes(400, Some(Mode::Enabled), None);

        let effective = store.effective(400, Some(3));
        assert_eq!(effective.matching_mode, Mode::Enabled);
        assert_eq!(effective.matching_source, SettingSource::Channel);
        assert_eq!(effective.checking_mode, Mode::Disabled);
        assert_eq!(effective.checking_source, SettingSource::Group);
    }

    #[test]
    fn test_channel_settings_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel_settings.json");
        {
            let store = ChannelSettingsStore::load(path.clone());
            store.set_channel_modes(5, None, Some(Mode::Disabled));
        }
        let reloaded = ChannelSettingsStore::load(path);
        assert!(!reloaded.is_checking_enabled(5, None));
    }

    #[test]
    fn test_priority_fallback_to_global() {
        let (_dir, store) = priority_store();
        assert_eq!(store.effective_mode(1), PriorityMode::Disabled);

        store.set_global_mode(PriorityMode::AllStreams);
        // Accounts without explicit modes follow the new global immediately
        assert_eq!(store.effective_mode(1), PriorityMode::AllStreams);
        assert_eq!(store.effective_mode(2), PriorityMode::AllStreams);
    }

    #[test]
    fn test_explicit_account_mode_overrides_global() {
        let (_dir, store) = priority_store();
        store.set_global_mode(PriorityMode::AllStreams);
        store.set_account_mode(1, PriorityMode::Disabled);

        assert_eq!(store.effective_mode(1), PriorityMode::Disabled);
        assert_eq!(store.effective_mode(2), PriorityMode::AllStreams);

        store.clear_account_mode(1);
        assert_eq!(store.effective_mode(1), PriorityMode::AllStreams);
    }

    #[test]
    fn test_mixed_modes() {
        let (_dir, store) = priority_store();
        store.set_global_mode(PriorityMode::AllStreams);
        store.set_account_mode(1, PriorityMode::Disabled);
        store.set_account_mode(2, PriorityMode::SameResolution);

        assert_eq!(store.effective_mode(1), PriorityMode::Disabled);
        assert_eq!(store.effective_mode(2), PriorityMode::SameResolution);
        assert_eq!(store.effective_mode(3), PriorityMode::AllStreams);
        assert_eq!(store.effective_mode(4), PriorityMode::AllStreams);
    }

    #[test]
    fn test_priority_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("priority_modes.json");
        {
            let store = PriorityModeStore::load(path.clone());
            store.set_global_mode(PriorityMode::SameResolution);
            store.set_account_mode(9, PriorityMode::AllStreams);
        }
        let reloaded = PriorityModeStore::load(path);
        assert_eq!(reloaded.global_mode(), PriorityMode::SameResolution);
        assert_eq!(reloaded.effective_mode(9), PriorityMode::AllStreams);
    }
}
