//! Process-wide options that apply across all components.

use serde::{Deserialize, Serialize};

/// Global configuration shared by every component in one process.
///
/// # Examples
///
/// ```
/// use drover_core::config::GlobalConfig;
///
/// let config = GlobalConfig::default();
/// assert_eq!(config.max_concurrent_runs, None);
/// assert_eq!(config.poll_jitter_secs, 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Upper bound on component runs executing at the same time.
    ///
    /// `None` lets every component run as soon as it is scheduled.
    #[serde(default)]
    pub max_concurrent_runs: Option<usize>,

    /// Maximum random delay (seconds) added to start times and poll intervals,
    /// so components configured with the same interval do not fire together.
    #[serde(default)]
    pub poll_jitter_secs: u64,
}

impl GlobalConfig {
    /// Merge values from another GlobalConfig (last-write-wins for set values).
    pub fn merge_from(&mut self, other: Self) {
        if other.max_concurrent_runs.is_some() {
            self.max_concurrent_runs = other.max_concurrent_runs;
        }
        if other.poll_jitter_secs != 0 {
            self.poll_jitter_secs = other.poll_jitter_secs;
        }
    }
}
