use serde::{Deserialize, Serialize};

/// How a stronger account priority influences stream ranking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    /// No bonus; quality alone decides
    Disabled,
    /// Bonus applied only among streams sharing a resolution bucket
    SameResolution,
    /// Bonus applied to every stream of the account
    AllStreams,
}

/// Search/replace pair applied to a stream URL before probing.
///
/// The stored URL is never mutated; the rewrite only affects the URL handed
/// to the media inspector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRewrite {
    pub search: String,
    pub replace: String,
}

/// An upstream playlist source with its concurrency cap and priority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct M3uAccount {
    pub id: i64,
    pub name: String,
    /// 0 means unlimited
    #[serde(default)]
    pub max_concurrent_streams: usize,
    /// 0-100; higher wins when a priority mode applies
    #[serde(default)]
    pub priority: u8,
    /// Explicit mode; `None` inherits the global default
    #[serde(default)]
    pub priority_mode: Option<PriorityMode>,
    #[serde(default)]
    pub url_rewrite: Option<UrlRewrite>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_mode_serde() {
        let mode: PriorityMode = serde_json::from_str("\"same_resolution\"").unwrap();
        assert_eq!(mode, PriorityMode::SameResolution);
        assert_eq!(
            serde_json::to_string(&PriorityMode::AllStreams).unwrap(),
            "\"all_streams\""
        );
    }

    #[test]
    fn test_account_defaults() {
        let account: M3uAccount =
            serde_json::from_str(r#"{"id": 3, "name": "provider-a"}"#).unwrap();
        assert_eq!(account.max_concurrent_streams, 0);
        assert_eq!(account.priority, 0);
        assert!(account.priority_mode.is_none());
        assert!(account.url_rewrite.is_none());
    }
}
