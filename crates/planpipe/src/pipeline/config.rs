use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{load_rule_set, resolve_path, Config, TimeoutConfig};
use crate::document::Stage;
use crate::error::ConfigError;
use crate::normalize::RuleSet;

use super::retry::RetryPolicy;

/// Wall-clock budget for one attempt of each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub extract: Duration,
    pub normalize: Duration,
    pub store: Duration,
}

impl StageTimeouts {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            extract: Duration::from_secs(config.extract_secs),
            normalize: Duration::from_secs(config.normalize_secs),
            store: Duration::from_secs(config.store_secs),
        }
    }

    /// The same budget for every stage.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            extract: timeout,
            normalize: timeout,
            store: timeout,
        }
    }

    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Ingest | Stage::Extract => self.extract,
            Stage::Normalize => self.normalize,
            Stage::Store => self.store,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

/// Validated settings shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub output_directory: PathBuf,
    pub timeouts: StageTimeouts,
    pub retry: RetryPolicy,
    pub rule_set: Arc<RuleSet>,
    pub allow_warnings: bool,
}

impl PipelineConfig {
    /// Resolves paths against the config file and loads the rule set.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let rule_set = load_rule_set(config)?;

        Ok(Self {
            worker_count: config.worker_count.max(1),
            output_directory: resolve_path(config, &config.output_directory),
            timeouts: StageTimeouts::from_config(&config.timeouts),
            retry: RetryPolicy::from_config(&config.retry),
            rule_set: Arc::new(rule_set),
            allow_warnings: config.normalization.allow_warnings,
        })
    }
}
