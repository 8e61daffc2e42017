//! Node configuration.
//!
//! [`NodeConfig`] groups the Dandelion++ timing policy, pool limits, and
//! dependent-chain caps. Every field has a default, so an empty source is a
//! valid configuration. [`NodeConfig::load`] layers an optional TOML file
//! under `PETAL_` environment variables (`__` separates nested keys, e.g.
//! `PETAL_DANDELION__FLUFF_PROBABILITY=0`), then validates the result.

use std::collections::HashMap;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use petal_core::constants::{
    DEFAULT_AGGREGATION_OUTPUTS, DEFAULT_AGGREGATION_TIME_MS, DEFAULT_BLOCK_SIZE_BUDGET,
    DEFAULT_FLUFF_PROBABILITY, DEFAULT_MAX_MERGED_SIZE, DEFAULT_OUTDATED_RETENTION,
    DEFAULT_SIZE_CORRECTION, DEFAULT_STEM_TIMEOUT_MAX_MS, DEFAULT_STEM_TIMEOUT_MIN_MS,
};
use petal_pool::DependentLimits;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Stem relay timing and aggregation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DandelionConfig {
    /// Lower bound of the randomized embargo after forwarding.
    pub stem_timeout_min_ms: u64,
    /// Upper bound of the randomized embargo after forwarding.
    pub stem_timeout_max_ms: u64,
    /// How long a new stem transaction waits for merge partners. Zero
    /// disables aggregation.
    pub aggregation_time_ms: u64,
    /// Output count at which an aggregating transaction stops merging.
    pub aggregation_outputs: usize,
    /// Chance, out of 65535, that a relay decision fluffs. `u16::MAX`
    /// always fluffs.
    pub fluff_probability: u16,
    /// Cap on the corrected size of a merged transaction.
    pub max_merged_size: u32,
}

impl Default for DandelionConfig {
    fn default() -> Self {
        Self {
            stem_timeout_min_ms: DEFAULT_STEM_TIMEOUT_MIN_MS,
            stem_timeout_max_ms: DEFAULT_STEM_TIMEOUT_MAX_MS,
            aggregation_time_ms: DEFAULT_AGGREGATION_TIME_MS,
            aggregation_outputs: DEFAULT_AGGREGATION_OUTPUTS,
            fluff_probability: DEFAULT_FLUFF_PROBABILITY,
            max_merged_size: DEFAULT_MAX_MERGED_SIZE,
        }
    }
}

impl DandelionConfig {
    pub fn aggregation_enabled(&self) -> bool {
        self.aggregation_time_ms > 0
    }
}

/// Fluff pool limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolLimits {
    /// Bytes added to every measured transaction size.
    pub size_correction: u32,
    /// Blocks an outdated transaction is kept before it is purged.
    pub outdated_retention: u64,
    /// Serialized-size budget for block candidate selection.
    pub block_size_budget: u32,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            size_correction: DEFAULT_SIZE_CORRECTION,
            outdated_retention: DEFAULT_OUTDATED_RETENTION,
            block_size_budget: DEFAULT_BLOCK_SIZE_BUDGET,
        }
    }
}

/// Configuration for one relay node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub dandelion: DandelionConfig,
    pub limits: PoolLimits,
    pub dependent: DependentLimits,
    /// Seed for the relay's random decisions. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
    /// Log level filter string (e.g. "info", "petal_node=debug").
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            dandelion: DandelionConfig::default(),
            limits: PoolLimits::default(),
            dependent: DependentLimits::default(),
            rng_seed: None,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load from an optional TOML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load), reading `PETAL_*` variables from `env`
    /// instead of the process environment when given.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("PETAL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dandelion;
        if d.stem_timeout_min_ms > d.stem_timeout_max_ms {
            return Err(ConfigError::invalid(
                "dandelion.stem_timeout_min_ms",
                format!("{} exceeds max {}", d.stem_timeout_min_ms, d.stem_timeout_max_ms),
            ));
        }
        if d.aggregation_enabled() && d.aggregation_outputs == 0 {
            return Err(ConfigError::invalid("dandelion.aggregation_outputs", "must be positive"));
        }
        if d.max_merged_size == 0 {
            return Err(ConfigError::invalid("dandelion.max_merged_size", "must be positive"));
        }
        if self.limits.block_size_budget == 0 {
            return Err(ConfigError::invalid("limits.block_size_budget", "must be positive"));
        }
        if self.dependent.max_depth == 0 {
            return Err(ConfigError::invalid("dependent.max_depth", "must be positive"));
        }
        Ok(())
    }
}
