use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A concrete playable URL belonging to an M3U account.
///
/// `stream_stats` is kept as raw JSON: the upstream may store keys this core
/// does not know about, and PATCHes must preserve them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: i64,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub m3u_account_id: Option<i64>,
    #[serde(default)]
    pub stream_stats: Option<serde_json::Value>,
}

/// Probe verdict for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeStatus {
    #[serde(rename = "OK")]
    Ok,
    Timeout,
    Error,
    Dead,
}

impl ProbeStatus {
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Measured quality of one stream.
///
/// Every field is always present after a probe, whatever the outcome;
/// callers index into these without existence checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    /// "WxH", "0x0" when not detected
    pub resolution: String,
    pub source_fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    /// Effective bitrate in kbps, `null` when no detection method matched
    pub ffmpeg_output_bitrate: Option<f64>,
    pub status: ProbeStatus,
    pub probed_at: DateTime<Utc>,
}

impl StreamStats {
    /// A fully-populated record carrying a failure verdict
    #[must_use]
    pub fn failed(status: ProbeStatus) -> Self {
        Self {
            resolution: "0x0".to_string(),
            source_fps: 0.0,
            video_codec: "N/A".to_string(),
            audio_codec: "N/A".to_string(),
            ffmpeg_output_bitrate: None,
            status,
            probed_at: Utc::now(),
        }
    }

    /// A synthetic record for a stream already known to be dead
    #[must_use]
    pub fn known_dead() -> Self {
        Self::failed(ProbeStatus::Dead)
    }

    /// Parse the "WxH" resolution into (width, height); (0, 0) when unknown
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        parse_resolution(&self.resolution).unwrap_or((0, 0))
    }

    /// Merge these stats over an existing upstream `stream_stats` object,
    /// preserving keys the core does not own.
    pub fn merge_into(&self, existing: Option<&serde_json::Value>) -> crate::Result<serde_json::Value> {
        let mut merged = match existing {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        let own = serde_json::to_value(self)?;
        if let serde_json::Value::Object(own_map) = own {
            for (key, value) in own_map {
                merged.insert(key, value);
            }
        }
        Ok(serde_json::Value::Object(merged))
    }
}

/// Parse a "WxH" resolution string
#[must_use]
pub fn parse_resolution(resolution: &str) -> Option<(u32, u32)> {
    let (width, height) = resolution.split_once('x')?;
    Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
}
