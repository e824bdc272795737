//! Durable JSON state files.
//!
//! Every persistent subsystem (tracker, registry, settings stores) keeps its
//! state in one newline-indented JSON file, written through on each mutation.
//! A corrupt or missing file loads as the default value with a warning; the
//! next write replaces it.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::Result;

/// Load a state file, falling back to `T::default()` on absence or corruption
pub fn load_state<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return T::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(state) => state,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Corrupt state file, starting empty");
                T::default()
            }
        },
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Could not read state file, starting empty");
            T::default()
        }
    }
}

/// Write a state file, creating parent directories as needed
pub fn save_state<T>(path: &Path, state: &T) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(state)?;
    std::fs::write(path, contents)?;
    Ok(())
}
