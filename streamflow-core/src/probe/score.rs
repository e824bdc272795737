//! Stream quality scoring.
//!
//! Pure functions over probe results. The base score rewards resolution,
//! framerate, bitrate and codec; an account priority bonus is layered on top
//! according to the account's effective priority mode. Streams whose probe
//! did not come back OK score zero regardless of any bonus.

use std::collections::HashMap;

use crate::models::{PriorityMode, StreamStats};

/// Input to the scorer: one stream with its resolved account attributes.
///
/// `priority_mode` must already be the *effective* mode — the account's
/// explicit setting or, when absent, the global default.
#[derive(Debug, Clone)]
pub struct StreamQuality {
    pub stream_id: i64,
    pub stats: StreamStats,
    pub priority: u8,
    pub priority_mode: PriorityMode,
}

/// A scored stream, ready for ranking
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredStream {
    pub stream_id: i64,
    pub score: f64,
}

/// Resolution component, by vertical line count
#[must_use]
pub fn resolution_score(width: u32, height: u32) -> f64 {
    if width == 0 || height == 0 {
        return 0.0;
    }
    match height {
        h if h >= 2160 => 400.0,
        h if h >= 1080 => 300.0,
        h if h >= 720 => 200.0,
        h if h >= 576 => 120.0,
        h if h >= 480 => 80.0,
        _ => 40.0,
    }
}

/// Framerate component
#[must_use]
pub fn fps_score(fps: f64) -> f64 {
    if fps >= 50.0 {
        60.0
    } else if fps >= 30.0 {
        50.0
    } else if fps >= 25.0 {
        40.0
    } else if fps > 0.0 {
        20.0
    } else {
        0.0
    }
}

/// Bitrate component: 25 points per Mbps, capped at 200
#[must_use]
pub fn bitrate_score(bitrate_kbps: Option<f64>) -> f64 {
    match bitrate_kbps {
        Some(kbps) if kbps > 0.0 => ((kbps / 1000.0) * 25.0).min(200.0),
        _ => 0.0,
    }
}

/// Video codec component: newer codecs compress better at equal bitrate
#[must_use]
pub fn codec_score(video_codec: &str) -> f64 {
    match video_codec.to_lowercase().as_str() {
        "av1" => 60.0,
        "h265" | "hevc" => 50.0,
        "h264" | "avc" => 40.0,
        "mpeg2video" | "mpeg2" => 10.0,
        "n/a" => 0.0,
        _ => 20.0,
    }
}

/// Base quality score; zero when the probe verdict is not OK
#[must_use]
pub fn base_score(stats: &StreamStats) -> f64 {
    if !stats.status.is_ok() {
        return 0.0;
    }
    let (width, height) = stats.dimensions();
    resolution_score(width, height)
        + fps_score(stats.source_fps)
        + bitrate_score(stats.ffmpeg_output_bitrate)
        + codec_score(&stats.video_codec)
}

const PRIORITY_BONUS_WEIGHT: f64 = 2.0;

/// Score a channel's batch of streams.
///
/// The priority bonus depends on the batch: `same_resolution` only applies
/// when at least one other stream in the batch shares the resolution bucket,
/// `all_streams` always applies, `disabled` never does.
#[must_use]
pub fn score_streams(items: &[StreamQuality]) -> Vec<ScoredStream> {
    let mut bucket_counts: HashMap<&str, usize> = HashMap::new();
    for item in items {
        *bucket_counts.entry(item.stats.resolution.as_str()).or_insert(0) += 1;
    }

    items
        .iter()
        .map(|item| {
            let base = base_score(&item.stats);
            if base <= 0.0 {
                return ScoredStream {
                    stream_id: item.stream_id,
                    score: 0.0,
                };
            }

            let bonus_applies = match item.priority_mode {
                PriorityMode::Disabled => false,
                PriorityMode::AllStreams => true,
                PriorityMode::SameResolution => {
                    bucket_counts
                        .get(item.stats.resolution.as_str())
                        .copied()
                        .unwrap_or(0)
                        > 1
                }
            };
            let bonus = if bonus_applies {
                f64::from(item.priority) * PRIORITY_BONUS_WEIGHT
            } else {
                0.0
            };

            ScoredStream {
                stream_id: item.stream_id,
                score: base + bonus,
            }
        })
        .collect()
}
