use serde::{Deserialize, Serialize};
use std::path::Path;

use super::constants::DEFAULT_BLOCK_SIZE;
use super::error::ConfigError;
use super::ring_item::TimestampPolicy;

/// Structure representing the event builder configuration. Contains the
/// correlation and tagging parameters.
/// Configs are serializable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Coincidence window in timestamp ticks
    pub coincidence_window: u64,
    /// How built events are stamped from their fragments
    pub timestamp_policy: TimestampPolicy,
    /// Source id assigned to items arriving without a body header
    pub default_source_id: u32,
    /// Restart the ordering epoch (last known timestamp to 0) at BEGIN_RUN
    pub reset_timestamp_on_begin: bool,
    /// Read block size for the tagger's item reader
    pub block_size: usize,
    /// Source ids the correlator should wait for even before their first
    /// fragment. Empty means discover sources as they appear.
    pub expected_sources: Vec<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coincidence_window: 100,
            timestamp_policy: TimestampPolicy::Earliest,
            default_source_id: 0,
            reset_timestamp_on_begin: true,
            block_size: DEFAULT_BLOCK_SIZE,
            expected_sources: Vec::new(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    pub fn is_block_size_valid(&self) -> bool {
        self.block_size >= super::constants::RING_HEADER_SIZE
    }
}
