//! Candidate stream matcher.
//!
//! Channels carry regex patterns that select candidate streams by name from
//! the playlist pool. Patterns support a `CHANNEL_NAME` token which is
//! substituted as an escaped literal, never interpolated raw; whitespace runs
//! compile to `\s+` so spacing differences between playlists do not break a
//! match.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::models::Stream;
use crate::persist;
use crate::{Error, Result};

/// Token replaced by the escaped channel name
pub const CHANNEL_NAME_TOKEN: &str = "CHANNEL_NAME";

// The pattern is a literal; compilation cannot fail at runtime.
#[allow(clippy::unwrap_used)]
fn whitespace_run() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[ \t]+").unwrap())
}

/// Compile one matcher pattern for a channel.
///
/// Substitutes `CHANNEL_NAME` as a regex literal, converts whitespace runs
/// to `\s+`, and honors the case-sensitivity setting.
pub fn compile_pattern(pattern: &str, channel_name: &str, case_sensitive: bool) -> Result<Regex> {
    let substituted = pattern.replace(CHANNEL_NAME_TOKEN, &regex::escape(channel_name));
    let normalized = whitespace_run().replace_all(&substituted, r"\s+");

    RegexBuilder::new(&normalized)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|source| Error::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Select candidate streams for a channel by name.
///
/// `account_filter` restricts candidates to one M3U account. Invalid
/// patterns are skipped with a warning; a channel with no valid pattern
/// yields no candidates.
pub fn candidates<'a>(
    channel_name: &str,
    patterns: &[String],
    streams: &'a [Stream],
    account_filter: Option<i64>,
    case_sensitive: bool,
) -> Vec<&'a Stream> {
    let compiled: Vec<Regex> = patterns
        .iter()
        .filter_map(|pattern| {
            match compile_pattern(pattern, channel_name, case_sensitive) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(pattern = %pattern, error = %err, "Skipping invalid matcher pattern");
                    None
                }
            }
        })
        .collect();
    if compiled.is_empty() {
        return Vec::new();
    }

    streams
        .iter()
        .filter(|stream| {
            if let Some(account_id) = account_filter {
                if stream.m3u_account_id != Some(account_id) {
                    return false;
                }
            }
            compiled.iter().any(|regex| regex.is_match(&stream.name))
        })
        .collect()
}

/// Persistent per-channel matcher patterns
pub struct PatternStore {
    path: PathBuf,
    patterns: Mutex<HashMap<i64, Vec<String>>>,
}

impl PatternStore {
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let patterns: HashMap<i64, Vec<String>> = persist::load_state(&path);
        Self {
            path,
            patterns: Mutex::new(patterns),
        }
    }

    #[must_use]
    pub fn patterns_for(&self, channel_id: i64) -> Vec<String> {
        self.patterns
            .lock()
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace a channel's patterns. Every pattern must compile (checked
    /// against a placeholder name); on failure nothing is stored.
    pub fn set_patterns(&self, channel_id: i64, patterns: Vec<String>) -> Result<()> {
        for pattern in &patterns {
            compile_pattern(pattern, "placeholder", true)?;
        }
        let mut store = self.patterns.lock();
        if patterns.is_empty() {
            store.remove(&channel_id);
        } else {
            store.insert(channel_id, patterns);
        }
        if let Err(err) = persist::save_state(&self.path, &*store) {
            warn!(path = %self.path.display(), error = %err, "Failed to save pattern store");
        }
        debug!(channel_id, "Updated matcher patterns");
        Ok(())
    }

    #[must_use]
    pub fn all(&self) -> HashMap<i64, Vec<String>> {
        self.patterns.lock().clone()
    }
}
