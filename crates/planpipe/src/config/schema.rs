use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::normalize::{NormalizationRule, ValidationRule};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_output_directory")]
    pub output_directory: String,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub normalization: NormalizationConfig,
    /// Directory of the file this config was loaded from; relative paths
    /// inside the config resolve against it.
    #[serde(skip)]
    pub base_directory: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            worker_count: default_worker_count(),
            output_directory: default_output_directory(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            normalization: NormalizationConfig::default(),
            base_directory: None,
        }
    }
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_output_directory() -> String {
    "records".to_string()
}

/// Per-stage wall-clock budgets. A stage that overruns counts as a
/// transient failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_extract_secs")]
    pub extract_secs: u64,
    #[serde(default = "default_normalize_secs")]
    pub normalize_secs: u64,
    #[serde(default = "default_store_secs")]
    pub store_secs: u64,
}

fn default_extract_secs() -> u64 {
    300
}

fn default_normalize_secs() -> u64 {
    30
}

fn default_store_secs() -> u64 {
    60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            extract_secs: default_extract_secs(),
            normalize_secs: default_normalize_secs(),
            store_secs: default_store_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the delay added or removed at random.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationConfig {
    /// Rule file (YAML or JSON). Mutually exclusive with inline rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<NormalizationRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<ValidationRule>,
    /// Keep records whose only validation errors are non-fatal.
    #[serde(default = "default_true")]
    pub allow_warnings: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            rules: Vec::new(),
            validations: Vec::new(),
            allow_warnings: true,
        }
    }
}

impl NormalizationConfig {
    pub fn has_inline_rules(&self) -> bool {
        !self.rules.is_empty() || !self.validations.is_empty()
    }
}
