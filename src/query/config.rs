//! Engine limits and polling policy.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{PinError, Result};

/// Limits applied while building and running operator trees.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryConfig {
    /// Upper bound on operators created by one build.
    pub max_operators: usize,
    /// Identities a hash join build side may hold.
    pub dedup_limit: usize,
    /// Records a merge join duplicate-key group may buffer.
    pub spill_limit: usize,
    /// Rows a Sort operator may buffer.
    pub sort_limit: usize,
    /// Iterations between abort flag polls in long loops.
    pub abort_poll_interval: u32,
    /// Upper bound on any path segment's repetition count.
    pub max_path_depth: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_operators: 64,
            dedup_limit: 1 << 20,
            spill_limit: 1 << 16,
            sort_limit: 1 << 20,
            abort_poll_interval: 256,
            max_path_depth: 64,
        }
    }
}

impl QueryConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: QueryConfig =
            toml::from_str(text).map_err(|err| PinError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), ?config, "query.config.loaded");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_operators == 0 {
            return Err(PinError::Config("max_operators must be positive".into()));
        }
        if self.abort_poll_interval == 0 {
            return Err(PinError::Config(
                "abort_poll_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Sets [`QueryConfig::max_operators`].
    pub fn with_max_operators(mut self, limit: usize) -> Self {
        self.max_operators = limit;
        self
    }

    /// Sets [`QueryConfig::dedup_limit`].
    pub fn with_dedup_limit(mut self, limit: usize) -> Self {
        self.dedup_limit = limit;
        self
    }

    /// Sets [`QueryConfig::spill_limit`].
    pub fn with_spill_limit(mut self, limit: usize) -> Self {
        self.spill_limit = limit;
        self
    }

    /// Sets [`QueryConfig::sort_limit`].
    pub fn with_sort_limit(mut self, limit: usize) -> Self {
        self.sort_limit = limit;
        self
    }

    /// Sets [`QueryConfig::abort_poll_interval`]; zero is clamped to one.
    pub fn with_abort_poll_interval(mut self, every: u32) -> Self {
        self.abort_poll_interval = every.max(1);
        self
    }

    /// Sets [`QueryConfig::max_path_depth`].
    pub fn with_max_path_depth(mut self, depth: u32) -> Self {
        self.max_path_depth = depth;
        self
    }
}
