// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, fmt::Display, str::FromStr};

use educe::Educe;

use crate::{MergeError, Result};

mod options;
pub use options::*;

/// How the merge picks the minimal row among the source heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Compare the head of every source on each row. Cheap for small fan-in.
    #[default]
    LinearScan,
    /// Keep the source heads in a quaternary min-heap.
    Heap,
    /// Linear scan up to `heap_fan_in_threshold` sources, heap above it.
    Auto,
}

impl FromStr for MergeStrategy {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" | "linear_scan" => Ok(MergeStrategy::LinearScan),
            "heap" => Ok(MergeStrategy::Heap),
            "auto" => Ok(MergeStrategy::Auto),
            other => Err(MergeError::Config(format!("unknown merge strategy `{other}`"))),
        }
    }
}

impl Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStrategy::LinearScan => write!(f, "linear"),
            MergeStrategy::Heap => write!(f, "heap"),
            MergeStrategy::Auto => write!(f, "auto"),
        }
    }
}

/// Configuration for the exchange merge.
#[derive(Educe, Debug, Clone)]
#[educe(Default)]
pub struct MergeConfig {
    /// Maximum number of rows per output page
    #[educe(Default = 8192)]
    pub(crate) batch_size: usize,
    /// Maximum estimated size in bytes of an output page
    #[educe(Default = 1024 * 1024)]
    pub(crate) max_page_bytes: usize,
    /// Minimum selection strategy
    pub(crate) merge_strategy: MergeStrategy,
    /// Fan-in above which `MergeStrategy::Auto` uses the heap
    #[educe(Default = 16)]
    pub(crate) heap_fan_in_threshold: usize,
    /// Additional configuration options
    pub(crate) options: HashMap<String, String>,
}

impl MergeConfig {
    /// Returns a builder for MergeConfig
    pub fn builder() -> MergeConfigBuilder {
        MergeConfigBuilder::new()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_page_bytes(&self) -> usize {
        self.max_page_bytes
    }

    pub fn merge_strategy(&self) -> MergeStrategy {
        self.merge_strategy
    }

    pub fn heap_fan_in_threshold(&self) -> usize {
        self.heap_fan_in_threshold
    }

    /// Returns the value of a configuration option by key
    pub fn option(&self, key: &str) -> Option<&String> {
        self.options.get(key)
    }

    /// Resolves `Auto` against the actual number of sources.
    pub fn effective_strategy(&self, fan_in: usize) -> MergeStrategy {
        match self.merge_strategy {
            MergeStrategy::Auto if fan_in > self.heap_fan_in_threshold => MergeStrategy::Heap,
            MergeStrategy::Auto => MergeStrategy::LinearScan,
            strategy => strategy,
        }
    }
}

/// Builder for MergeConfig
#[derive(Debug, Default, Clone)]
pub struct MergeConfigBuilder {
    config: MergeConfig,
}

impl MergeConfigBuilder {
    pub fn new() -> Self {
        MergeConfigBuilder {
            config: MergeConfig::default(),
        }
    }

    /// Sets the maximum number of rows per output page
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Sets the maximum estimated size in bytes of an output page
    pub fn with_max_page_bytes(mut self, max_page_bytes: usize) -> Self {
        self.config.max_page_bytes = max_page_bytes;
        self
    }

    /// Sets the minimum selection strategy
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.config.merge_strategy = strategy;
        self
    }

    /// Sets the fan-in above which `MergeStrategy::Auto` switches to the heap
    pub fn with_heap_fan_in_threshold(mut self, threshold: usize) -> Self {
        self.config.heap_fan_in_threshold = threshold;
        self
    }

    /// Adds an option
    ///
    /// Known keys (see `OPTION_KEY_*`) override the typed settings when the
    /// config is built.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.options.insert(key.into(), value.into());
        self
    }

    /// Builds the MergeConfig, applying string options and validating limits.
    pub fn build(self) -> Result<MergeConfig> {
        let mut config = self.config;
        if let Some(value) = config.options.get(OPTION_KEY_BATCH_SIZE) {
            config.batch_size = parse_option(OPTION_KEY_BATCH_SIZE, value)?;
        }
        if let Some(value) = config.options.get(OPTION_KEY_MAX_PAGE_BYTES) {
            config.max_page_bytes = parse_option(OPTION_KEY_MAX_PAGE_BYTES, value)?;
        }
        if let Some(value) = config.options.get(OPTION_KEY_MERGE_STRATEGY) {
            config.merge_strategy = value.parse()?;
        }
        if let Some(value) = config.options.get(OPTION_KEY_HEAP_FAN_IN_THRESHOLD) {
            config.heap_fan_in_threshold = parse_option(OPTION_KEY_HEAP_FAN_IN_THRESHOLD, value)?;
        }

        if config.batch_size == 0 {
            return Err(MergeError::Config("batch_size must be positive".into()));
        }
        if config.max_page_bytes == 0 {
            return Err(MergeError::Config("max_page_bytes must be positive".into()));
        }
        Ok(config)
    }
}

impl From<MergeConfig> for MergeConfigBuilder {
    fn from(val: MergeConfig) -> Self {
        MergeConfigBuilder { config: val }
    }
}

fn parse_option(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| MergeError::Config(format!("option `{key}`=`{value}`: {e}")))
}
