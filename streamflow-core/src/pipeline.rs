//! Channel check pipeline.
//!
//! One invocation probes a channel's candidate streams, classifies dead
//! ones, ranks the survivors and pushes the results upstream. The hard
//! ordering rule: no upstream mutation happens until every probe in the
//! batch has returned.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::SettingsHandle;
use crate::limiter::ConcurrencyLimiter;
use crate::matcher::{self, PatternStore};
use crate::models::{M3uAccount, ProbeStatus, Stream, StreamStats, UrlRewrite};
use crate::probe::score::{base_score, score_streams, StreamQuality};
use crate::probe::{ProbeExecutor, ProbeSpec};
use crate::registry::DeadStreamRegistry;
use crate::settings_store::{ChannelSettingsStore, PriorityModeStore};
use crate::tracker::UpdateTracker;
use crate::upstream::{DataCache, UpstreamApi};
use crate::{Error, Result};

/// Result summary of one channel check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    pub channel_id: i64,
    /// Channel missing upstream or pipeline disabled
    pub skipped: bool,
    pub probed: usize,
    pub reused: usize,
    pub dead: usize,
    pub removed: usize,
}

/// Split a channel's current stream set into streams to probe and streams
/// whose stored stats are reused.
///
/// A force check (or `validate_existing`) probes everything; an incremental
/// check probes only streams not seen at the last completed check.
#[must_use]
pub fn partition_probe_set(
    current: &[i64],
    last_checked: &[i64],
    force: bool,
    validate_existing: bool,
) -> (Vec<i64>, Vec<i64>) {
    if force || validate_existing {
        return (current.to_vec(), Vec::new());
    }
    let checked: HashSet<i64> = last_checked.iter().copied().collect();
    let (reused, to_probe): (Vec<i64>, Vec<i64>) = current
        .iter()
        .copied()
        .partition(|id| checked.contains(id));
    (to_probe, reused)
}

/// Apply an account's URL rewrite to a probe URL. The stored URL is never
/// mutated; an uncompilable pattern falls back to the original URL.
#[must_use]
pub fn rewrite_probe_url(url: &str, rewrite: Option<&UrlRewrite>) -> String {
    let Some(rewrite) = rewrite else {
        return url.to_string();
    };
    match Regex::new(&rewrite.search) {
        Ok(regex) => regex.replace_all(url, rewrite.replace.as_str()).into_owned(),
        Err(err) => {
            warn!(pattern = %rewrite.search, error = %err, "Invalid URL rewrite pattern, probing original URL");
            url.to_string()
        }
    }
}

/// End-to-end checker for one channel
pub struct ChannelCheckPipeline {
    upstream: Arc<dyn UpstreamApi>,
    cache: Arc<DataCache>,
    executor: Arc<ProbeExecutor>,
    limiter: Arc<ConcurrencyLimiter>,
    registry: Arc<DeadStreamRegistry>,
    tracker: Arc<UpdateTracker>,
    channel_settings: Arc<ChannelSettingsStore>,
    priority_modes: Arc<PriorityModeStore>,
    patterns: Arc<PatternStore>,
    settings: SettingsHandle,
}

impl ChannelCheckPipeline {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        cache: Arc<DataCache>,
        executor: Arc<ProbeExecutor>,
        limiter: Arc<ConcurrencyLimiter>,
        registry: Arc<DeadStreamRegistry>,
        tracker: Arc<UpdateTracker>,
        channel_settings: Arc<ChannelSettingsStore>,
        priority_modes: Arc<PriorityModeStore>,
        patterns: Arc<PatternStore>,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            upstream,
            cache,
            executor,
            limiter,
            registry,
            tracker,
            channel_settings,
            priority_modes,
            patterns,
            settings,
        }
    }

    #[must_use]
    pub fn channel_settings(&self) -> &Arc<ChannelSettingsStore> {
        &self.channel_settings
    }

    /// Run the full check for one channel.
    ///
    /// Individual stream failures are absorbed into their stats; a missing
    /// channel is logged and reported as skipped. Only upstream read
    /// failures propagate as errors — the worker treats those as
    /// logged-and-completed too.
    pub async fn check_channel(&self, channel_id: i64, force: bool) -> Result<CheckOutcome> {
        let settings = self.settings.get();
        let Some(timings) = settings.pipeline_mode.probe_timings() else {
            return Ok(CheckOutcome {
                channel_id,
                skipped: true,
                ..CheckOutcome::default()
            });
        };

        // Step 1: resolve the channel
        let Some(mut channel) = self.cache.channel_by_id(channel_id).await? else {
            warn!(channel_id, "Channel not found upstream, skipping check");
            return Ok(CheckOutcome {
                channel_id,
                skipped: true,
                ..CheckOutcome::default()
            });
        };

        // Step 2: a force check wipes dead verdicts for the channel,
        // refreshes the owning playlists and reassociates candidates
        if force {
            if let Some(refreshed) = self.force_refresh(&channel).await? {
                channel = refreshed;
            }
        }

        let stream_map = self.cache.stream_map().await?;
        let accounts = self.cache.account_map().await?;

        let current_ids: Vec<i64> = channel
            .streams
            .iter()
            .copied()
            .filter(|id| {
                let known = stream_map.contains_key(id);
                if !known {
                    warn!(channel_id, stream_id = *id, "Channel references unknown stream");
                }
                known
            })
            .collect();

        // Step 3: decide which streams actually get probed
        let last_checked = self.tracker.checked_stream_ids(channel_id);
        let (to_probe, reused) = partition_probe_set(
            &current_ids,
            &last_checked,
            force,
            settings.validate_existing_streams,
        );

        // Steps 4-6: probe the batch, pre-marking known-dead URLs, and wait
        // for every probe to terminate before touching upstream state
        let (probed_stats, probed_count) = self
            .probe_batch(&to_probe, &stream_map, &accounts, &timings, &settings)
            .await;

        // Step 7: classify dead streams
        let mut dead_ids: HashSet<i64> = HashSet::new();
        if settings.dead_stream_handling.enabled {
            for (&stream_id, stats) in &probed_stats {
                if let Some(stream) = stream_map.get(&stream_id) {
                    if self.is_dead(stats, &settings.dead_stream_handling) {
                        self.registry.mark_dead(
                            &stream.url,
                            stream.id,
                            &stream.name,
                            Some(channel_id),
                        );
                        dead_ids.insert(stream_id);
                    }
                }
            }
        }

        let remove_dead = settings.dead_stream_handling.enabled
            && settings.dead_stream_handling.removal_enabled;

        // Step 8: score the survivors and push the new order
        let ranked = self.rank_streams(
            &current_ids,
            &dead_ids,
            &probed_stats,
            &stream_map,
            &accounts,
            remove_dead,
        );
        let removed = if remove_dead {
            current_ids.len() - ranked.len()
        } else {
            0
        };

        if ranked != current_ids {
            if let Err(err) = self
                .upstream
                .set_channel_streams(channel_id, ranked.clone())
                .await
            {
                warn!(channel_id, error = %err, "Failed to push stream order");
            } else {
                self.cache.apply_channel_streams(channel_id, &ranked).await;
            }
        }

        // Step 9: push merged stats for every probed stream
        for (&stream_id, stats) in &probed_stats {
            let existing = stream_map
                .get(&stream_id)
                .and_then(|stream| stream.stream_stats.as_ref());
            let merged = match stats.merge_into(existing) {
                Ok(merged) => merged,
                Err(err) => {
                    warn!(stream_id, error = %err, "Failed to merge stream stats");
                    continue;
                }
            };
            if let Err(err) = self.upstream.patch_stream_stats(stream_id, merged.clone()).await {
                warn!(stream_id, error = %err, "Failed to push stream stats");
            } else {
                self.cache.apply_stream_stats(stream_id, &merged).await;
            }
        }

        // Step 10: the check is complete; only now does needs_check clear
        self.tracker
            .mark_channel_checked(channel_id, current_ids.len(), current_ids.clone());

        // Step 11: give disabled channels that regained a working stream
        // their profile slot back
        if settings.empty_channels.disable_enabled {
            if let Err(err) = self.reenable_channels().await {
                warn!(error = %err, "Channel re-enablement pass failed");
            }
        }

        let outcome = CheckOutcome {
            channel_id,
            skipped: false,
            probed: probed_count,
            reused: reused.len(),
            dead: dead_ids.len(),
            removed,
        };
        info!(
            channel_id,
            probed = outcome.probed,
            reused = outcome.reused,
            dead = outcome.dead,
            removed = outcome.removed,
            "Channel check finished"
        );
        Ok(outcome)
    }

    /// Force-check preamble: clear dead verdicts, refresh owning playlists,
    /// reassociate candidates. Returns the re-resolved channel when the
    /// association may have changed.
    async fn force_refresh(&self, channel: &crate::models::Channel) -> Result<Option<crate::models::Channel>> {
        let stream_map = self.cache.stream_map().await?;
        let channel_urls: HashSet<String> = channel
            .streams
            .iter()
            .filter_map(|id| stream_map.get(id))
            .map(|stream| stream.url.clone())
            .collect();
        self.registry.clear_for_channel(&channel_urls);

        let owning_accounts: HashSet<i64> = channel
            .streams
            .iter()
            .filter_map(|id| stream_map.get(id))
            .filter_map(|stream| stream.m3u_account_id)
            .collect();
        for account_id in owning_accounts {
            if let Err(err) = self.upstream.refresh_m3u_account(account_id).await {
                warn!(account_id, error = %err, "Playlist refresh request failed");
            }
        }
        self.cache.invalidate_streams();
        self.cache.invalidate_channels();

        // Reassociate candidate streams by name
        let patterns = self.patterns.patterns_for(channel.id);
        if patterns.is_empty() {
            return self.cache.channel_by_id(channel.id).await;
        }
        let settings = self.settings.get();
        let streams = self.cache.streams().await?;
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
            debug!(
                channel_id = channel.id,
                candidates = matched.len(),
                "Reassociating candidate streams"
            );
            self.upstream
                .set_channel_streams(channel.id, matched.clone())
                .await?;
            self.cache.apply_channel_streams(channel.id, &matched).await;
        }
        self.cache.channel_by_id(channel.id).await
    }

    /// Probe a set of streams in parallel under the concurrency limiter,
    /// staggering submissions. Streams whose URL is already registered dead
    /// get a synthetic verdict without being probed. Returns once every
    /// probe has terminated.
    async fn probe_batch(
        &self,
        to_probe: &[i64],
        stream_map: &HashMap<i64, Stream>,
        accounts: &HashMap<i64, M3uAccount>,
        timings: &crate::config::ProbeTimings,
        settings: &crate::config::CheckerSettings,
    ) -> (HashMap<i64, StreamStats>, usize) {
        let mut results: HashMap<i64, StreamStats> = HashMap::new();
        let mut handles = Vec::new();
        let stagger = Duration::from_secs_f64(settings.concurrent_streams.stagger_delay.max(0.0));
        let spec = ProbeSpec {
            duration_secs: timings.duration_secs,
            timeout_secs: timings.timeout_secs,
            startup_buffer_secs: settings.stream_analysis.stream_startup_buffer,
            retries: settings.retries,
            retry_delay: Duration::from_secs_f64(settings.retry_delay_seconds.max(0.0)),
        };

        for &stream_id in to_probe {
            let Some(stream) = stream_map.get(&stream_id) else {
                continue;
            };

            if self.registry.is_dead(&stream.url) {
                debug!(stream_id, url = %stream.url, "Known dead, skipping probe");
                results.insert(stream_id, StreamStats::known_dead());
                continue;
            }

            let rewrite = stream
                .m3u_account_id
                .and_then(|id| accounts.get(&id))
                .and_then(|account| account.url_rewrite.clone());
            let probe_url = rewrite_probe_url(&stream.url, rewrite.as_ref());
            let account_id = stream.m3u_account_id;
            let limiter = self.limiter.clone();
            let executor = self.executor.clone();
            let spec = spec.clone();

            if !handles.is_empty() && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            handles.push((
                stream_id,
                tokio::spawn(async move {
                    let _permit = match limiter.acquire(account_id).await {
                        Ok(permit) => permit,
                        Err(err) => {
                            warn!(stream_id, error = %err, "Probe admission failed");
                            return StreamStats::failed(ProbeStatus::Error);
                        }
                    };
                    executor.probe(&probe_url, &spec).await
                }),
            ));
        }

        let probed_count = handles.len();
        let (ids, futures): (Vec<i64>, Vec<_>) = handles.into_iter().unzip();
        for (stream_id, joined) in ids.into_iter().zip(join_all(futures).await) {
            let stats = joined.unwrap_or_else(|err| {
                warn!(stream_id, error = %err, "Probe task panicked");
                StreamStats::failed(ProbeStatus::Error)
            });
            results.insert(stream_id, stats);
        }

        (results, probed_count)
    }

    fn is_dead(&self, stats: &StreamStats, config: &crate::config::DeadStreamConfig) -> bool {
        if !stats.status.is_ok() {
            return true;
        }
        let (width, height) = stats.dimensions();
        if width < config.min_resolution_width || height < config.min_resolution_height {
            return true;
        }
        if stats.ffmpeg_output_bitrate.unwrap_or(0.0) < config.min_bitrate_kbps {
            return true;
        }
        base_score(stats) < config.min_score
    }

    /// Order the channel's streams by descending score. Reused streams are
    /// scored from their stored stats; unparseable stored stats score zero
    /// but stay associated. Dead streams are dropped when removal is on,
    /// otherwise sink to the end of the order.
    fn rank_streams(
        &self,
        current_ids: &[i64],
        dead_ids: &HashSet<i64>,
        probed_stats: &HashMap<i64, StreamStats>,
        stream_map: &HashMap<i64, Stream>,
        accounts: &HashMap<i64, M3uAccount>,
        remove_dead: bool,
    ) -> Vec<i64> {
        let mut qualities = Vec::new();
        let mut dead_tail = Vec::new();

        for &stream_id in current_ids {
            if dead_ids.contains(&stream_id) {
                if !remove_dead {
                    dead_tail.push(stream_id);
                }
                continue;
            }
            let stats = probed_stats.get(&stream_id).cloned().or_else(|| {
                stream_map
                    .get(&stream_id)
                    .and_then(|stream| stream.stream_stats.as_ref())
                    .and_then(|value| serde_json::from_value(value.clone()).ok())
            });
            let Some(stats) = stats else {
                // Never probed and no stored stats: keep, score zero
                dead_tail.push(stream_id);
                continue;
            };
            if stats.status == ProbeStatus::Dead && remove_dead {
                continue;
            }

            let account = stream_map
                .get(&stream_id)
                .and_then(|stream| stream.m3u_account_id)
                .and_then(|id| accounts.get(&id));
            let priority = account.map_or(0, |account| account.priority);
            let priority_mode = match account {
                Some(account) => account
                    .priority_mode
                    .unwrap_or_else(|| self.priority_modes.effective_mode(account.id)),
                None => crate::models::PriorityMode::Disabled,
            };

            qualities.push(StreamQuality {
                stream_id,
                stats,
                priority,
                priority_mode,
            });
        }

        let mut scored = score_streams(&qualities);
        // Stable by construction: equal scores keep their association order
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut ranked: Vec<i64> = scored.into_iter().map(|s| s.stream_id).collect();
        ranked.extend(dead_tail);
        ranked
    }

    /// Re-enable channels in the tracked profile that are disabled but now
    /// own at least one non-dead stream. Returns (re-enabled, considered).
    pub async fn reenable_channels(&self) -> Result<(usize, usize)> {
        let settings = self.settings.get();
        if !settings.empty_channels.disable_enabled {
            return Ok((0, 0));
        }
        let Some(profile_id) = settings.empty_channels.profile_id else {
            return Ok((0, 0));
        };
        let Some(profile) = self.cache.profile_by_id(profile_id).await? else {
            return Err(Error::NotFound(format!("profile {profile_id}")));
        };

        let channels = self.cache.channels().await?;
        let stream_map = self.cache.stream_map().await?;
        let mut considered = 0;
        let mut enabled = 0;

        for membership in profile.channels.iter().filter(|entry| !entry.enabled) {
            let Some(channel) = channels
                .iter()
                .find(|channel| channel.id == membership.channel_id)
            else {
                continue;
            };
            if channel.streams.is_empty() {
                continue;
            }
            considered += 1;

            let has_working = channel
                .streams
                .iter()
                .filter_map(|id| stream_map.get(id))
                .any(|stream| !self.registry.is_dead(&stream.url));
            if !has_working {
                continue;
            }

            match self
                .upstream
                .set_profile_channel_enabled(profile_id, channel.id, true)
                .await
            {
                Ok(()) => {
                    info!(
                        channel_id = channel.id,
                        profile_id, "Re-enabled channel with working streams"
                    );
                    enabled += 1;
                }
                Err(err) => {
                    warn!(channel_id = channel.id, error = %err, "Failed to re-enable channel");
                }
            }
        }

        Ok((enabled, considered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_incremental_probes_only_new() {
        let (to_probe, reused) = partition_probe_set(
            &[101, 102, 103, 104, 105],
            &[101, 102, 103],
            false,
            false,
        );
        assert_eq!(to_probe, vec![104, 105]);
        assert_eq!(reused, vec![101, 102, 103]);
    }

    #[test]
    fn test_partition_force_probes_everything() {
        let (to_probe, reused) =
            partition_probe_set(&[101, 102, 103], &[101, 102, 103], true, false);
        assert_eq!(to_probe, vec![101, 102, 103]);
        assert!(reused.is_empty());
    }

    #[test]
    fn test_partition_validate_existing_probes_everything() {
        let (to_probe, reused) = partition_probe_set(&[101, 102], &[101, 102], false, true);
        assert_eq!(to_probe, vec![101, 102]);
        assert!(reused.is_empty());
    }

    #[test]
    fn test_partition_never_checked_channel() {
        let (to_probe, reused) = partition_probe_set(&[1, 2], &[], false, false);
        assert_eq!(to_probe, vec![1, 2]);
        assert!(reused.is_empty());
    }

    #[test]
    fn test_rewrite_probe_url_basic() {
        let rewrite = UrlRewrite {
            search: ":8080/".to_string(),
            replace: ":8888/".to_string(),
        };
        assert_eq!(
            rewrite_probe_url("http://example.com:8080/live/123/index.m3u8", Some(&rewrite)),
            "http://example.com:8888/live/123/index.m3u8"
        );
    }

    #[test]
    fn test_rewrite_probe_url_replaces_all_occurrences() {
        let rewrite = UrlRewrite {
            search: "server1".to_string(),
            replace: "server2".to_string(),
        };
        assert_eq!(
            rewrite_probe_url("http://server1.example.com/server1/stream", Some(&rewrite)),
            "http://server2.example.com/server2/stream"
        );
    }

    #[test]
    fn test_rewrite_probe_url_no_match_returns_original() {
        let rewrite = UrlRewrite {
            search: ":9999/".to_string(),
            replace: ":8888/".to_string(),
        };
        assert_eq!(
            rewrite_probe_url("http://example.com/stream", Some(&rewrite)),
            "http://example.com/stream"
        );
    }

    #[test]
    fn test_rewrite_probe_url_invalid_pattern_falls_back() {
        let rewrite = UrlRewrite {
            search: "[invalid(regex".to_string(),
            replace: "x".to_string(),
        };
        assert_eq!(
            rewrite_probe_url("http://example.com/stream", Some(&rewrite)),
            "http://example.com/stream"
        );
    }

    #[test]
    fn test_rewrite_probe_url_none_passthrough() {
        assert_eq!(
            rewrite_probe_url("http://example.com/stream", None),
            "http://example.com/stream"
        );
    }
}
