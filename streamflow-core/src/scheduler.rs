//! Scheduler loops and trigger surface.
//!
//! Three long-running loops share one `global_action_in_progress` guard:
//! workers draining the check queue (never gated by the guard, or a global
//! sweep could not drain its own queue), a cron loop firing the daily sweep,
//! and a dirty-queue loop feeding channels flagged by playlist refreshes.
//! All loops observe a single shutdown signal; in-flight checks get a grace
//! period to drain.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use dashmap::DashSet;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{CheckerSettings, GlobalCheckSchedule, PipelineMode, SettingsHandle};
use crate::limiter::ConcurrencyLimiter;
use crate::matcher::{self, PatternStore};
use crate::pipeline::ChannelCheckPipeline;
use crate::queue::{CheckQueue, QueueStatus};
use crate::registry::DeadStreamRegistry;
use crate::settings_store::ChannelSettingsStore;
use crate::tracker::UpdateTracker;
use crate::upstream::{DataCache, UpstreamApi};
use crate::Result;

/// Priority for cron-initiated sweep checks
const GLOBAL_SWEEP_PRIORITY: u32 = 10;
/// Priority for dirty-queue checks
const DIRTY_PRIORITY: u32 = 20;
/// Priority for manual single-channel checks (soonest)
const MANUAL_PRIORITY: u32 = 0;

/// How long a worker blocks on the queue before re-checking the shutdown flag
const WORKER_POLL: Duration = Duration::from_secs(1);
/// Dirty-queue fallback poll interval
const DIRTY_POLL: Duration = Duration::from_secs(5);
/// Cron loop wake interval
const CRON_POLL: Duration = Duration::from_secs(60);

/// Snapshot returned by [`CheckScheduler::status`]
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub queue: QueueStatus,
    pub in_progress_channels: Vec<i64>,
    pub last_global_check: Option<DateTime<Utc>>,
    pub global_action_in_progress: bool,
    /// At least one channel check is executing right now
    pub checking_channel: bool,
    /// The admin-facing "core is busy" flag
    pub stream_checking_mode: bool,
    pub pipeline_mode: PipelineMode,
}

/// Decide whether the cron loop should fire the daily sweep.
///
/// Fires when the schedule is enabled, the local clock matches the
/// configured hour:minute, and the last sweep was not on the current
/// calendar day.
#[must_use]
pub fn should_run_global_check(
    schedule: &GlobalCheckSchedule,
    now: DateTime<Local>,
    last_global_check: Option<DateTime<Utc>>,
) -> bool {
    if !schedule.enabled {
        return false;
    }
    if now.hour() != schedule.hour || now.minute() != schedule.minute {
        return false;
    }
    match last_global_check {
        None => true,
        Some(last) => {
            let last_local = last.with_timezone(&Local);
            (last_local.year(), last_local.ordinal()) != (now.year(), now.ordinal())
        }
    }
}

/// Clears the global-action flag when dropped, so the guard never stays set
/// after a sweep, even on an early return or panic.
struct GlobalActionGuard<'a>(&'a AtomicBool);

impl Drop for GlobalActionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The persistent background service driving all channel checks
pub struct CheckScheduler {
    queue: Arc<CheckQueue>,
    tracker: Arc<UpdateTracker>,
    pipeline: Arc<ChannelCheckPipeline>,
    cache: Arc<DataCache>,
    upstream: Arc<dyn UpstreamApi>,
    limiter: Arc<ConcurrencyLimiter>,
    registry: Arc<DeadStreamRegistry>,
    channel_settings: Arc<ChannelSettingsStore>,
    patterns: Arc<PatternStore>,
    settings: SettingsHandle,
    global_action_in_progress: AtomicBool,
    checking: AtomicUsize,
    force_check: DashSet<i64>,
    dirty_notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CheckScheduler {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        queue: Arc<CheckQueue>,
        tracker: Arc<UpdateTracker>,
        pipeline: Arc<ChannelCheckPipeline>,
        cache: Arc<DataCache>,
        upstream: Arc<dyn UpstreamApi>,
        limiter: Arc<ConcurrencyLimiter>,
        registry: Arc<DeadStreamRegistry>,
        channel_settings: Arc<ChannelSettingsStore>,
        patterns: Arc<PatternStore>,
        settings: SettingsHandle,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            tracker,
            pipeline,
            cache,
            upstream,
            limiter,
            registry,
            channel_settings,
            patterns,
            settings,
            global_action_in_progress: AtomicBool::new(false),
            checking: AtomicUsize::new(0),
            force_check: DashSet::new(),
            dirty_notify: Notify::new(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool, the cron loop and the dirty-queue loop
    pub fn start(self: &Arc<Self>) {
        let settings = self.settings.get();
        let mut handles = self.handles.lock();

        for worker_id in 0..settings.workers.max(1) {
            let scheduler = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                scheduler.worker_loop(worker_id, shutdown).await;
            }));
        }

        let scheduler = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            scheduler.cron_loop(shutdown).await;
        }));

        let scheduler = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            scheduler.dirty_loop(shutdown).await;
        }));

        info!(workers = settings.workers.max(1), "Stream check scheduler started");
    }

    /// Signal shutdown and wait up to the configured grace period for
    /// in-flight checks to drain; loops still running after that are
    /// aborted.
    pub async fn stop(&self) {
        info!("Stopping stream check scheduler");
        let _ = self.shutdown_tx.send(true);
        self.dirty_notify.notify_waiters();

        let grace = Duration::from_secs(self.settings.get().shutdown_grace_seconds);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());

        let drain = async {
            for handle in &handles {
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "Grace period elapsed, aborting remaining scheduler tasks"
            );
            for handle in &handles {
                handle.abort();
            }
        }
        info!("Stream check scheduler stopped");
    }

    // Loop 1: worker. The only loop not gated by the global-action guard.
    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "Worker loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.settings.get().pipeline_mode.is_disabled() {
                let _ = tokio::time::timeout(WORKER_POLL, shutdown.changed()).await;
                continue;
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                next = self.queue.next(WORKER_POLL) => next,
            };
            let Some(channel_id) = next else {
                continue;
            };

            let force = self.force_check.remove(&channel_id).is_some();
            self.checking.fetch_add(1, Ordering::SeqCst);

            // A panicking check must not kill the worker; run it in its own
            // task and absorb the join error.
            let pipeline = self.pipeline.clone();
            let result =
                tokio::spawn(async move { pipeline.check_channel(channel_id, force).await }).await;
            match result {
                Ok(Ok(outcome)) if outcome.skipped => {
                    debug!(worker_id, channel_id, "Channel check skipped");
                }
                Ok(Ok(outcome)) => {
                    debug!(
                        worker_id,
                        channel_id,
                        probed = outcome.probed,
                        dead = outcome.dead,
                        "Channel check complete"
                    );
                }
                Ok(Err(err)) => {
                    warn!(worker_id, channel_id, error = %err, "Channel check failed");
                }
                Err(err) => {
                    error!(worker_id, channel_id, error = %err, "Channel check panicked");
                }
            }

            self.checking.fetch_sub(1, Ordering::SeqCst);
            self.queue.mark_completed(channel_id);
        }
        debug!(worker_id, "Worker loop stopped");
    }

    // Loop 2: cron. Wakes every minute; fires the sweep at most once per
    // calendar day.
    async fn cron_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("Cron loop started");
        let mut ticker = tokio::time::interval(CRON_POLL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.cron_tick().await;
                }
            }
        }
        debug!("Cron loop stopped");
    }

    async fn cron_tick(&self) {
        let settings = self.settings.get();
        if settings.pipeline_mode.is_disabled() {
            return;
        }
        if self.global_action_in_progress.load(Ordering::SeqCst) {
            return;
        }
        if should_run_global_check(
            &settings.global_check_schedule,
            Local::now(),
            self.tracker.last_global_check(),
        ) {
            self.perform_global_action().await;
        }
    }

    /// The daily global sweep: refresh upstream data, refresh playlists,
    /// rediscover channel-stream associations, enqueue every eligible
    /// channel, and stamp the tracker. The guard is held for the duration
    /// and cleared on every exit path.
    pub async fn perform_global_action(&self) {
        if self.global_action_in_progress.swap(true, Ordering::SeqCst) {
            warn!("Global action already in progress, skipping");
            return;
        }
        let _guard = GlobalActionGuard(&self.global_action_in_progress);
        info!("Global action started");

        if let Err(err) = self.cache.refresh_all().await {
            warn!(error = %err, "Upstream data refresh failed, continuing with stale cache");
        }

        match self.cache.accounts().await {
            Ok(accounts) => {
                for account in accounts.iter() {
                    if let Err(err) = self.upstream.refresh_m3u_account(account.id).await {
                        warn!(account_id = account.id, error = %err, "Playlist refresh request failed");
                    }
                }
            }
            Err(err) => warn!(error = %err, "Could not list accounts for playlist refresh"),
        }
        // Associations may have changed with the refreshed playlists
        self.cache.invalidate_streams();
        self.cache.invalidate_channels();

        if let Err(err) = self.rematch_channels().await {
            warn!(error = %err, "Candidate rediscovery failed");
        }

        match self.enqueue_eligible_channels(GLOBAL_SWEEP_PRIORITY, false).await {
            Ok(enqueued) => info!(enqueued, "Global action enqueued channels"),
            Err(err) => warn!(error = %err, "Failed to enqueue channels for global action"),
        }

        self.tracker.mark_global_check();
        info!("Global action finished");
    }

    /// Re-run the candidate matcher for every channel with matching enabled
    async fn rematch_channels(&self) -> Result<usize> {
        let settings = self.settings.get();
        let channels = self.cache.channels().await?;
        let streams = self.cache.streams().await?;
        let mut updated = 0;

        for channel in channels.iter() {
            if !self
                .channel_settings
                .is_matching_enabled(channel.id, channel.channel_group_id)
            {
                continue;
            }
            let patterns = self.patterns.patterns_for(channel.id);
            if patterns.is_empty() {
                continue;
            }
            let matched: Vec<i64> = matcher::candidates(
                &channel.name,
                &patterns,
                &streams,
                None,
                settings.case_sensitive_matching,
            )
            .iter()
            .map(|stream| stream.id)
            .collect();

            if !matched.is_empty() && matched != channel.streams {
                match self
                    .upstream
                    .set_channel_streams(channel.id, matched.clone())
                    .await
                {
                    Ok(()) => {
                        self.cache.apply_channel_streams(channel.id, &matched).await;
                        updated += 1;
                    }
                    Err(err) => {
                        warn!(channel_id = channel.id, error = %err, "Failed to reassociate streams");
                    }
                }
            }
        }

        if updated > 0 {
            info!(updated, "Rediscovered channel stream associations");
        }
        Ok(updated)
    }

    /// Enqueue every channel whose effective checking mode is enabled.
    /// Channels in the completed set are made re-queueable first.
    async fn enqueue_eligible_channels(&self, priority: u32, force: bool) -> Result<usize> {
        let channels = self.cache.channels().await?;
        let mut added = 0;
        for channel in channels.iter() {
            if !self
                .channel_settings
                .is_checking_enabled(channel.id, channel.channel_group_id)
            {
                continue;
            }
            self.queue.remove_from_completed(channel.id);
            if force {
                self.force_check.insert(channel.id);
            }
            if self.queue.add(channel.id, priority) {
                added += 1;
            } else if force {
                self.force_check.remove(&channel.id);
            }
        }
        Ok(added)
    }

    // Loop 3: dirty-queue. Reacts to playlist-refresh signals; a no-op
    // while a global action is in progress.
    async fn dirty_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("Dirty-queue loop started");
        loop {
            let notified = self.dirty_notify.notified();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                () = notified => {
                    self.dirty_tick();
                }
                () = tokio::time::sleep(DIRTY_POLL) => {
                    self.dirty_tick();
                }
            }
        }
        debug!("Dirty-queue loop stopped");
    }

    /// One dirty-queue pass: drain flagged channels into the queue.
    /// `needs_check` is left set; it clears only when a check completes, so
    /// channels skipped here (guard active, queue full) are retried later.
    pub fn dirty_tick(&self) -> usize {
        let settings = self.settings.get();
        if settings.pipeline_mode.is_disabled() || !settings.queue.check_on_update {
            return 0;
        }
        if self.global_action_in_progress.load(Ordering::SeqCst) {
            debug!("Global action in progress, dirty-queue pass skipped");
            return 0;
        }

        let dirty = self
            .tracker
            .take_needing_check(settings.queue.max_channels_per_run);
        let mut added = 0;
        for channel_id in dirty {
            self.queue.remove_from_completed(channel_id);
            if self.queue.add(channel_id, DIRTY_PRIORITY) {
                added += 1;
            }
        }
        if added > 0 {
            debug!(added, "Dirty-queue pass enqueued channels");
        }
        added
    }

    /// Notification from the admin layer that the upstream refreshed its
    /// playlists: re-pull collections, flag channels whose stream set
    /// changed, and drop dead entries for vanished URLs.
    pub async fn playlist_refreshed(&self) -> Result<()> {
        self.cache.invalidate_streams();
        self.cache.invalidate_channels();

        let channels = self.cache.channels().await?;
        let current_urls = self.cache.all_stream_urls().await?;
        self.registry.cleanup(&current_urls);

        let mut counts: HashMap<i64, usize> = HashMap::new();
        for channel in channels.iter() {
            let current: HashSet<i64> = channel.streams.iter().copied().collect();
            let checked: HashSet<i64> = self
                .tracker
                .checked_stream_ids(channel.id)
                .into_iter()
                .collect();
            if current != checked {
                counts.insert(channel.id, channel.streams.len());
            }
        }
        if !counts.is_empty() {
            info!(channels = counts.len(), "Playlist refresh changed stream sets");
            self.tracker.mark_channels_updated(&counts);
        }

        self.dirty_notify.notify_one();
        Ok(())
    }

    /// Manual single-channel check: highest priority, force semantics,
    /// bypasses checking-mode eligibility.
    pub fn check_single_channel(&self, channel_id: i64) -> bool {
        self.queue.remove_from_completed(channel_id);
        self.force_check.insert(channel_id);
        let added = self.queue.add(channel_id, MANUAL_PRIORITY);
        if added {
            info!(channel_id, "Queued manual channel check");
        } else {
            self.force_check.remove(&channel_id);
            debug!(channel_id, "Manual check not queued (already tracked or queue full)");
        }
        added
    }

    /// Enqueue all eligible channels, as the sweep does, without the
    /// surrounding refresh steps
    pub async fn check_all_channels(&self, force: bool) -> Result<usize> {
        let added = self
            .enqueue_eligible_channels(GLOBAL_SWEEP_PRIORITY, force)
            .await?;
        info!(added, force, "Queued check for all eligible channels");
        Ok(added)
    }

    /// Replace the runtime settings; invalid updates are rejected with the
    /// previous settings retained. Concurrency limits are rebuilt when the
    /// update succeeds.
    pub async fn update_config(&self, settings: CheckerSettings) -> Result<()> {
        self.settings.update(settings)?;
        self.reload_limits().await
    }

    /// Rebuild the concurrency limiter from current settings and accounts.
    /// Also invoked when the M3U account set is reloaded.
    pub async fn reload_limits(&self) -> Result<()> {
        let settings = self.settings.get();
        let accounts = self.cache.accounts().await?;
        let global_limit = settings
            .concurrent_streams
            .enabled
            .then_some(settings.concurrent_streams.global_limit);
        self.limiter.reconfigure(global_limit, &accounts);
        Ok(())
    }

    /// Live proxy activity keyed by channel, for the admin status display.
    /// Channels with connected clients are the ones a probe would disturb.
    pub async fn proxy_activity(
        &self,
    ) -> Result<HashMap<String, crate::models::ProxyChannelStatus>> {
        self.upstream.proxy_status().await
    }

    /// Consistent snapshot of scheduler state
    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        let queue = self.queue.status();
        let global_action = self.global_action_in_progress.load(Ordering::SeqCst);
        let checking = self.checking.load(Ordering::SeqCst) > 0;
        let stream_checking_mode =
            global_action || checking || queue.queued > 0 || queue.in_progress > 0;

        SchedulerStatus {
            in_progress_channels: self.queue.in_progress_ids(),
            last_global_check: self.tracker.last_global_check(),
            global_action_in_progress: global_action,
            checking_channel: checking,
            stream_checking_mode,
            pipeline_mode: self.settings.get().pipeline_mode,
            queue,
        }
    }

    #[cfg(test)]
    fn set_global_action_flag(&self, value: bool) {
        self.global_action_in_progress.store(value, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckerSettings, PipelineMode};
    use crate::models::Channel;
    use crate::probe::ProbeExecutor;
    use crate::settings_store::{Mode, PriorityModeStore};
    use crate::upstream::MockUpstreamApi;
    use chrono::TimeZone;

    fn schedule(enabled: bool, hour: u32, minute: u32) -> GlobalCheckSchedule {
        GlobalCheckSchedule {
            enabled,
            hour,
            minute,
        }
    }

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_should_run_global_check_matching_minute_first_time() {
        assert!(should_run_global_check(
            &schedule(true, 3, 0),
            local(2026, 8, 1, 3, 0),
            None
        ));
    }

    #[test]
    fn test_should_run_global_check_disabled() {
        assert!(!should_run_global_check(
            &schedule(false, 3, 0),
            local(2026, 8, 1, 3, 0),
            None
        ));
    }

    #[test]
    fn test_should_run_global_check_wrong_minute() {
        assert!(!should_run_global_check(
            &schedule(true, 3, 0),
            local(2026, 8, 1, 3, 1),
            None
        ));
    }

    #[test]
    fn test_should_run_global_check_once_per_calendar_day() {
        let now = local(2026, 8, 1, 3, 0);
        // Last run 24h ago: fire
        let yesterday = (now - chrono::Duration::hours(24)).with_timezone(&Utc);
        assert!(should_run_global_check(&schedule(true, 3, 0), now, Some(yesterday)));
        // Already ran earlier on the same calendar day: do not fire again
        let earlier_today = local(2026, 8, 1, 3, 0).with_timezone(&Utc);
        assert!(!should_run_global_check(
            &schedule(true, 3, 0),
            now,
            Some(earlier_today)
        ));
    }

    struct TestRig {
        scheduler: Arc<CheckScheduler>,
        tracker: Arc<UpdateTracker>,
        queue: Arc<CheckQueue>,
        channel_settings: Arc<ChannelSettingsStore>,
        _dir: tempfile::TempDir,
    }

    fn rig_with_upstream(upstream: MockUpstreamApi) -> TestRig {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsHandle::new(CheckerSettings::default());
        let upstream: Arc<dyn UpstreamApi> = Arc::new(upstream);
        let cache = Arc::new(DataCache::new(upstream.clone()));
        let executor = Arc::new(ProbeExecutor::new(
            "/nonexistent/inspector".to_string(),
            "test".to_string(),
        ));
        let limiter = Arc::new(ConcurrencyLimiter::new(Some(2), &[]));
        let registry = Arc::new(DeadStreamRegistry::load(dir.path().join("dead.json")));
        let tracker = Arc::new(UpdateTracker::load(dir.path().join("tracker.json")));
        let channel_settings = Arc::new(ChannelSettingsStore::load(
            dir.path().join("channel_settings.json"),
        ));
        let priority_modes = Arc::new(PriorityModeStore::load(dir.path().join("priority.json")));
        let patterns = Arc::new(PatternStore::load(dir.path().join("patterns.json")));
        let queue = Arc::new(CheckQueue::new(100));

        let pipeline = Arc::new(ChannelCheckPipeline::new(
            upstream.clone(),
            cache.clone(),
            executor,
            limiter.clone(),
            registry.clone(),
            tracker.clone(),
            channel_settings.clone(),
            priority_modes,
            patterns.clone(),
            settings.clone(),
        ));
        let scheduler = Arc::new(CheckScheduler::new(
            queue.clone(),
            tracker.clone(),
            pipeline,
            cache,
            upstream,
            limiter,
            registry,
            channel_settings.clone(),
            patterns,
            settings,
        ));

        TestRig {
            scheduler,
            tracker,
            queue,
            channel_settings,
            _dir: dir,
        }
    }

    fn channels_upstream(channels: Vec<Channel>) -> MockUpstreamApi {
        let mut upstream = MockUpstreamApi::new();
        upstream
            .expect_list_channels()
            .returning(move || Ok(channels.clone()));
        upstream
    }

    #[test]
    fn test_dirty_tick_skipped_during_global_action_and_flag_preserved() {
        let rig = rig_with_upstream(MockUpstreamApi::new());
        rig.tracker.mark_channel_updated(1, 5);

        rig.scheduler.set_global_action_flag(true);
        assert_eq!(rig.scheduler.dirty_tick(), 0);
        assert_eq!(rig.queue.status().queued, 0);
        // The flag survived the skipped pass
        assert!(rig.tracker.needs_check(1));

        rig.scheduler.set_global_action_flag(false);
        assert_eq!(rig.scheduler.dirty_tick(), 1);
        assert_eq!(rig.queue.status().queued, 1);
    }

    #[test]
    fn test_dirty_tick_requeues_completed_channels() {
        let rig = rig_with_upstream(MockUpstreamApi::new());

        // Channel went through a full check cycle
        rig.queue.add(1, 10);
        rig.queue.try_next();
        rig.queue.mark_completed(1);
        rig.tracker.mark_channel_checked(1, 5, vec![101, 102]);

        // New streams arrive
        rig.tracker.mark_channel_updated(1, 7);
        assert_eq!(rig.scheduler.dirty_tick(), 1);
        assert_eq!(rig.queue.status().queued, 1);
        assert_eq!(rig.queue.status().completed, 0);
    }

    #[test]
    fn test_dirty_tick_noop_when_pipeline_disabled() {
        let rig = rig_with_upstream(MockUpstreamApi::new());
        rig.tracker.mark_channel_updated(1, 5);

        let mut settings = CheckerSettings::default();
        settings.pipeline_mode = PipelineMode::Disabled;
        rig.scheduler.settings.update(settings).unwrap();

        assert_eq!(rig.scheduler.dirty_tick(), 0);
    }

    #[test]
    fn test_check_single_channel_sets_force_and_priority() {
        let rig = rig_with_upstream(MockUpstreamApi::new());
        assert!(rig.scheduler.check_single_channel(16));
        assert!(rig.scheduler.force_check.contains(&16));
        // Highest priority: pops before a sweep-priority entry
        rig.queue.add(2, GLOBAL_SWEEP_PRIORITY);
        assert_eq!(rig.queue.try_next(), Some(16));
    }

    #[tokio::test]
    async fn test_check_all_respects_checking_mode_eligibility() {
        let channels = vec![
            Channel {
                id: 1,
                name: "A".to_string(),
                channel_group_id: None,
                streams: vec![],
            },
            Channel {
                id: 2,
                name: "B".to_string(),
                channel_group_id: Some(7),
                streams: vec![],
            },
            Channel {
                id: 3,
                name: "C".to_string(),
                channel_group_id: Some(7),
                streams: vec![],
            },
        ];
        let rig = rig_with_upstream(channels_upstream(channels));

        // Group 7 disabled, but channel 3 explicitly re-enabled
        rig.channel_settings
            .set_group_modes(7, None, Some(Mode::Disabled));
        rig.channel_settings
            .set_channel_modes(3, None, Some(Mode::Enabled));

        let added = rig.scheduler.check_all_channels(false).await.unwrap();
        assert_eq!(added, 2);

        assert_eq!(rig.queue.try_next(), Some(1));
        assert_eq!(rig.queue.try_next(), Some(3));
        assert_eq!(rig.queue.try_next(), None);
    }

    #[test]
    fn test_status_stream_checking_mode_composition() {
        let rig = rig_with_upstream(MockUpstreamApi::new());
        assert!(!rig.scheduler.status().stream_checking_mode);

        // Queue non-empty
        rig.queue.add(1, 10);
        assert!(rig.scheduler.status().stream_checking_mode);

        // In progress only
        rig.queue.try_next();
        let status = rig.scheduler.status();
        assert!(status.stream_checking_mode);
        assert_eq!(status.in_progress_channels, vec![1]);

        rig.queue.mark_completed(1);
        assert!(!rig.scheduler.status().stream_checking_mode);

        // Global action flag alone
        rig.scheduler.set_global_action_flag(true);
        let status = rig.scheduler.status();
        assert!(status.global_action_in_progress);
        assert!(status.stream_checking_mode);
        rig.scheduler.set_global_action_flag(false);
        assert!(!rig.scheduler.status().stream_checking_mode);
    }

    #[tokio::test]
    async fn test_update_config_rejects_invalid_and_keeps_previous() {
        let mut upstream = MockUpstreamApi::new();
        upstream.expect_list_m3u_accounts().returning(|| Ok(vec![]));
        let rig = rig_with_upstream(upstream);

        let mut bad = CheckerSettings::default();
        bad.queue.max_size = 0;
        assert!(rig.scheduler.update_config(bad).await.is_err());
        assert_eq!(rig.scheduler.settings.get(), CheckerSettings::default());

        let mut good = CheckerSettings::default();
        good.workers = 3;
        rig.scheduler.update_config(good.clone()).await.unwrap();
        assert_eq!(rig.scheduler.settings.get(), good);
    }

    #[tokio::test]
    async fn test_playlist_refreshed_flags_changed_channels() {
        let mut upstream = MockUpstreamApi::new();
        upstream.expect_list_channels().returning(|| {
            Ok(vec![
                Channel {
                    id: 1,
                    name: "A".to_string(),
                    channel_group_id: None,
                    streams: vec![101, 102, 104],
                },
                Channel {
                    id: 2,
                    name: "B".to_string(),
                    channel_group_id: None,
                    streams: vec![201],
                },
            ])
        });
        upstream.expect_list_streams().returning(|| Ok(vec![]));
        let rig = rig_with_upstream(upstream);

        // Channel 1 was checked with a different set; channel 2 matches
        rig.tracker.mark_channel_checked(1, 2, vec![101, 102]);
        rig.tracker.mark_channel_checked(2, 1, vec![201]);

        rig.scheduler.playlist_refreshed().await.unwrap();

        assert!(rig.tracker.needs_check(1));
        assert!(!rig.tracker.needs_check(2));
    }
}
