use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Policy knobs for an update.
///
/// The retry and restart bounds are policy, not invariants, so they live here
/// rather than as constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpliceConfig {
    /// Pause attempts before `CodeBusy` becomes final
    pub apply_retries: u32,
    /// Sleep between pause attempts
    pub retry_backoff_ms: u64,
    /// Matching passes across all sections before giving up
    pub restart_limit: u32,
    /// Initial debug verbosity (0-4) of new updates
    pub debug: u8,
    /// Name prefix of the threads driving the pause
    pub stop_helper_prefix: String,
    /// Decoder bitness (16, 32 or 64)
    pub bitness: u32,
}

impl Default for SpliceConfig {
    fn default() -> Self {
        Self {
            apply_retries: 5,
            retry_backoff_ms: 1000,
            restart_limit: 20,
            debug: 0,
            stop_helper_prefix: "kstop".to_string(),
            bitness: 64,
        }
    }
}

impl SpliceConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Returns true if `name` is the prefix followed by digits only
    pub fn is_stop_helper(&self, name: &str) -> bool {
        match name.strip_prefix(self.stop_helper_prefix.as_str()) {
            Some(rest) => rest.bytes().all(|b| b.is_ascii_digit()),
            None => false,
        }
    }
}
