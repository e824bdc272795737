//! Cached view of upstream entity collections.
//!
//! Channels and streams change on every playlist refresh and use a short
//! TTL; groups, accounts and profiles are near-static and cached longer.
//! Concurrent cache misses for the same collection are collapsed into a
//! single upstream fetch. A global action invalidates and refetches
//! everything; a stream-stats PATCH is mirrored into the cached copy so
//! readers see what was written without a refetch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use tracing::{debug, info};

use crate::models::{Channel, ChannelGroup, ChannelProfile, M3uAccount, Stream};
use crate::upstream::UpstreamApi;
use crate::{Error, Result};

/// TTL for channels and streams
pub const VOLATILE_TTL: Duration = Duration::from_secs(300);
/// TTL for groups, accounts and profiles
pub const STABLE_TTL: Duration = Duration::from_secs(3600);

fn single_entry_cache<V>(ttl: Duration) -> Cache<(), V>
where
    V: Clone + Send + Sync + 'static,
{
    Cache::builder().max_capacity(1).time_to_live(ttl).build()
}

/// TTL'd snapshots of the upstream's entity collections
pub struct DataCache {
    upstream: Arc<dyn UpstreamApi>,
    channels: Cache<(), Arc<Vec<Channel>>>,
    groups: Cache<(), Arc<Vec<ChannelGroup>>>,
    streams: Cache<(), Arc<Vec<Stream>>>,
    accounts: Cache<(), Arc<Vec<M3uAccount>>>,
    profiles: Cache<(), Arc<Vec<ChannelProfile>>>,
}

impl DataCache {
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamApi>) -> Self {
        Self {
            upstream,
            channels: single_entry_cache(VOLATILE_TTL),
            groups: single_entry_cache(STABLE_TTL),
            streams: single_entry_cache(VOLATILE_TTL),
            accounts: single_entry_cache(STABLE_TTL),
            profiles: single_entry_cache(STABLE_TTL),
        }
    }

    pub async fn channels(&self) -> Result<Arc<Vec<Channel>>> {
        let upstream = self.upstream.clone();
        self.channels
            .try_get_with((), async move { upstream.list_channels().await.map(Arc::new) })
            .await
            .map_err(flatten_cache_error)
    }

    pub async fn channel_groups(&self) -> Result<Arc<Vec<ChannelGroup>>> {
        let upstream = self.upstream.clone();
        self.groups
            .try_get_with((), async move {
                upstream.list_channel_groups().await.map(Arc::new)
            })
            .await
            .map_err(flatten_cache_error)
    }

    pub async fn streams(&self) -> Result<Arc<Vec<Stream>>> {
        let upstream = self.upstream.clone();
        self.streams
            .try_get_with((), async move { upstream.list_streams().await.map(Arc::new) })
            .await
            .map_err(flatten_cache_error)
    }

    pub async fn accounts(&self) -> Result<Arc<Vec<M3uAccount>>> {
        let upstream = self.upstream.clone();
        self.accounts
            .try_get_with((), async move {
                upstream.list_m3u_accounts().await.map(Arc::new)
            })
            .await
            .map_err(flatten_cache_error)
    }

    pub async fn profiles(&self) -> Result<Arc<Vec<ChannelProfile>>> {
        let upstream = self.upstream.clone();
        self.profiles
            .try_get_with((), async move { upstream.list_profiles().await.map(Arc::new) })
            .await
            .map_err(flatten_cache_error)
    }

    pub async fn channel_by_id(&self, channel_id: i64) -> Result<Option<Channel>> {
        Ok(self
            .channels()
            .await?
            .iter()
            .find(|channel| channel.id == channel_id)
            .cloned())
    }

    pub async fn stream_map(&self) -> Result<HashMap<i64, Stream>> {
        Ok(self
            .streams()
            .await?
            .iter()
            .map(|stream| (stream.id, stream.clone()))
            .collect())
    }

    pub async fn account_map(&self) -> Result<HashMap<i64, M3uAccount>> {
        Ok(self
            .accounts()
            .await?
            .iter()
            .map(|account| (account.id, account.clone()))
            .collect())
    }

    pub async fn profile_by_id(&self, profile_id: i64) -> Result<Option<ChannelProfile>> {
        Ok(self
            .profiles()
            .await?
            .iter()
            .find(|profile| profile.id == profile_id)
            .cloned())
    }

    /// URLs of every stream currently known upstream
    pub async fn all_stream_urls(&self) -> Result<HashSet<String>> {
        Ok(self
            .streams()
            .await?
            .iter()
            .map(|stream| stream.url.clone())
            .collect())
    }

    pub fn invalidate_channels(&self) {
        self.channels.invalidate_all();
    }

    pub fn invalidate_streams(&self) {
        self.streams.invalidate_all();
    }

    pub fn invalidate_all(&self) {
        self.channels.invalidate_all();
        self.groups.invalidate_all();
        self.streams.invalidate_all();
        self.accounts.invalidate_all();
        self.profiles.invalidate_all();
        debug!("Invalidated all cached upstream collections");
    }

    /// Drop every snapshot and refetch eagerly. Used by the global action so
    /// the sweep sees fresh associations.
    pub async fn refresh_all(&self) -> Result<()> {
        self.invalidate_all();
        let channels = self.channels().await?;
        let streams = self.streams().await?;
        self.channel_groups().await?;
        self.accounts().await?;
        self.profiles().await?;
        info!(
            channels = channels.len(),
            streams = streams.len(),
            "Refreshed upstream data cache"
        );
        Ok(())
    }

    /// Mirror a stream-stats PATCH into the cached streams snapshot so the
    /// cache matches what upstream now stores.
    pub async fn apply_stream_stats(&self, stream_id: i64, stats: &Value) {
        if let Some(current) = self.streams.get(&()).await {
            let updated: Vec<Stream> = current
                .iter()
                .map(|stream| {
                    if stream.id == stream_id {
                        let mut stream = stream.clone();
                        stream.stream_stats = Some(stats.clone());
                        stream
                    } else {
                        stream.clone()
                    }
                })
                .collect();
            self.streams.insert((), Arc::new(updated)).await;
        }
    }

    /// Mirror a channel stream-association PATCH into the cached snapshot
    pub async fn apply_channel_streams(&self, channel_id: i64, stream_ids: &[i64]) {
        if let Some(current) = self.channels.get(&()).await {
            let updated: Vec<Channel> = current
                .iter()
                .map(|channel| {
                    if channel.id == channel_id {
                        let mut channel = channel.clone();
                        channel.streams = stream_ids.to_vec();
                        channel
                    } else {
                        channel.clone()
                    }
                })
                .collect();
            self.channels.insert((), Arc::new(updated)).await;
        }
    }
}

fn flatten_cache_error(err: Arc<Error>) -> Error {
    Error::Internal(format!("cached upstream fetch failed: {err}"))
}
