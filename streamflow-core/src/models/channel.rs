use serde::{Deserialize, Serialize};

/// A logical TV channel owned by the upstream orchestrator.
///
/// The core only ever mutates the stream association order and the
/// per-profile enabled flag; everything else is read-only reference data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub channel_group_id: Option<i64>,
    /// Ordered candidate stream IDs
    #[serde(default)]
    pub streams: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub id: i64,
    pub name: String,
}

/// A channel's membership in a profile, with its enabled flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileChannel {
    pub channel_id: i64,
    pub enabled: bool,
}

/// An upstream profile grouping channels that can be toggled individually
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelProfile {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub channels: Vec<ProfileChannel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_deserializes_without_optional_fields() {
        let channel: Channel =
            serde_json::from_str(r#"{"id": 7, "name": "News HD"}"#).unwrap();
        assert_eq!(channel.id, 7);
        assert!(channel.channel_group_id.is_none());
        assert!(channel.streams.is_empty());
    }

    #[test]
    fn test_profile_round_trip() {
        let profile = ChannelProfile {
            id: 1,
            name: "default".to_string(),
            channels: vec![ProfileChannel {
                channel_id: 42,
                enabled: false,
            }],
        };
        let json = serde_json::to_string(&profile).unwrap();
        let parsed: ChannelProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, profile);
    }
}
