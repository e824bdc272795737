//! Service construction.
//!
//! Builds the full scheduler stack from a validated [`Config`]: persistent
//! stores from `state_dir`, the upstream client and cache, the probe
//! executor and limiter, the pipeline, and finally the scheduler. All
//! wiring is explicit; no component reaches for a global.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::config::{Config, SettingsHandle};
use crate::limiter::ConcurrencyLimiter;
use crate::matcher::PatternStore;
use crate::pipeline::ChannelCheckPipeline;
use crate::probe::ProbeExecutor;
use crate::queue::CheckQueue;
use crate::registry::DeadStreamRegistry;
use crate::scheduler::CheckScheduler;
use crate::settings_store::{ChannelSettingsStore, PriorityModeStore};
use crate::tracker::UpdateTracker;
use crate::upstream::{DataCache, UpstreamApi, UpstreamClient};
use crate::Result;

/// All long-lived services, fully wired
pub struct Services {
    pub settings: SettingsHandle,
    pub upstream: Arc<dyn UpstreamApi>,
    pub cache: Arc<DataCache>,
    pub queue: Arc<CheckQueue>,
    pub tracker: Arc<UpdateTracker>,
    pub registry: Arc<DeadStreamRegistry>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub channel_settings: Arc<ChannelSettingsStore>,
    pub priority_modes: Arc<PriorityModeStore>,
    pub patterns: Arc<PatternStore>,
    pub pipeline: Arc<ChannelCheckPipeline>,
    pub scheduler: Arc<CheckScheduler>,
}

/// Construct every service from configuration.
///
/// The check queue is volatile by design; channels flagged in the tracker
/// are re-queued by the first dirty-queue pass after startup.
pub fn init_services(config: &Config) -> Result<Services> {
    let state_dir = PathBuf::from(&config.state_dir);
    let settings = SettingsHandle::new(config.checker.clone());

    let upstream: Arc<dyn UpstreamApi> = Arc::new(UpstreamClient::new(&config.upstream)?);
    let cache = Arc::new(DataCache::new(upstream.clone()));

    let tracker = Arc::new(UpdateTracker::load(state_dir.join("channel_updates.json")));
    let registry = Arc::new(DeadStreamRegistry::load(state_dir.join("dead_streams.json")));
    let channel_settings = Arc::new(ChannelSettingsStore::load(
        state_dir.join("channel_settings.json"),
    ));
    let priority_modes = Arc::new(PriorityModeStore::load(state_dir.join("priority_modes.json")));
    let patterns = Arc::new(PatternStore::load(state_dir.join("channel_patterns.json")));

    let checker = config.checker.clone();
    let queue = Arc::new(CheckQueue::new(checker.queue.max_size));
    let global_limit = checker
        .concurrent_streams
        .enabled
        .then_some(checker.concurrent_streams.global_limit);
    // Account caps are applied on the first reload_limits() once the
    // account list has been fetched
    let limiter = Arc::new(ConcurrencyLimiter::new(global_limit, &[]));

    let executor = Arc::new(ProbeExecutor::new(
        checker.stream_analysis.inspector_path.clone(),
        config.upstream.user_agent.clone(),
    ));

    let pipeline = Arc::new(ChannelCheckPipeline::new(
        upstream.clone(),
        cache.clone(),
        executor,
        limiter.clone(),
        registry.clone(),
        tracker.clone(),
        channel_settings.clone(),
        priority_modes.clone(),
        patterns.clone(),
        settings.clone(),
    ));

    let scheduler = Arc::new(CheckScheduler::new(
        queue.clone(),
        tracker.clone(),
        pipeline.clone(),
        cache.clone(),
        upstream.clone(),
        limiter.clone(),
        registry.clone(),
        channel_settings.clone(),
        patterns.clone(),
        settings.clone(),
    ));

    info!(state_dir = %state_dir.display(), "Services initialized");

    Ok(Services {
        settings,
        upstream,
        cache,
        queue,
        tracker,
        registry,
        limiter,
        channel_settings,
        priority_modes,
        patterns,
        pipeline,
        scheduler,
    })
}
