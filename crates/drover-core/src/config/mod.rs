//! Configuration building blocks shared by drover components.

mod component_key;
mod global;
mod loader;
mod path;
mod vars;

pub use component_key::ComponentKey;
pub use global::GlobalConfig;
pub use loader::{Mergeable, load_from_paths};
pub use path::{CliArgs, ConfigPath, is_yaml_file};
pub use vars::{InterpolationResult, interpolate};

use serde::{Deserialize, Serialize};

/// Metrics configuration for the Prometheus endpoint.
///
/// The endpoint is off unless an address is given; one-shot runs usually
/// finish before anything could scrape them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP listener (e.g. "0.0.0.0:9090").
    #[serde(default)]
    pub address: Option<String>,
}

impl MetricsConfig {
    /// Merge values from another MetricsConfig (last-write-wins).
    pub fn merge_from(&mut self, other: Self) {
        if other.address.is_some() {
            self.address = other.address;
        }
    }
}
