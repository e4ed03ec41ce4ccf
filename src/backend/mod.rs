//! Built-in mountable backends.

pub mod memfs;
pub mod queuefs;
pub mod streamfs;

use crate::fs::{Error, Result};
use crate::plugin::{Config, MOUNT_PATH_KEY};

/// Structural config validation shared by the built-in plugins: every key
/// must be recognized, extra keys are rejected rather than silently dropped.
pub(crate) fn reject_unknown_keys(plugin: &str, config: &Config, known: &[&str]) -> Result<()> {
    for key in config.keys() {
        if key == MOUNT_PATH_KEY || known.contains(&key.as_str()) {
            continue;
        }
        return Err(Error::invalid_argument(
            "validate",
            plugin,
            format!("unrecognized config key '{}'", key),
        ));
    }
    Ok(())
}
