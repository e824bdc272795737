use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// One active channel as reported by `GET /proxy/ts/status`.
///
/// The endpoint carries many fields this core does not interpret; they are
/// kept in `extra` so status displays can pass them through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyChannelStatus {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub stream_id: Option<i64>,
    #[serde(default)]
    pub m3u_profile_id: Option<i64>,
    #[serde(default)]
    pub client_count: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Parse a proxy status payload into a map keyed by `channel_id`.
///
/// Items without a `channel_id` are skipped; a malformed payload produces an
/// empty map, never an error.
#[must_use]
pub fn parse_proxy_status(payload: &Value) -> HashMap<String, ProxyChannelStatus> {
    let mut result = HashMap::new();

    let Some(channels) = payload.get("channels").and_then(Value::as_array) else {
        warn!("Proxy status payload has no channels array");
        return result;
    };

    for item in channels {
        let Some(channel_id) = item.get("channel_id") else {
            warn!("Skipping proxy status entry without channel_id");
            continue;
        };
        // channel_id may arrive as a string (UUID) or a number
        let key = match channel_id {
            Value::String(id) => id.clone(),
            Value::Number(id) => id.to_string(),
            _ => {
                warn!("Skipping proxy status entry with non-scalar channel_id");
                continue;
            }
        };
        match serde_json::from_value::<ProxyChannelStatus>(item.clone()) {
            Ok(status) => {
                result.insert(key, status);
            }
            Err(err) => {
                warn!(channel_id = %key, error = %err, "Failed to parse proxy status entry");
            }
        }
    }

    result
}
