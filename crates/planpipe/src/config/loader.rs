use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::normalize::RuleSet;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut config = load_config_from_str(&content)?;
    config.base_directory = path.parent().map(Path::to_path_buf);
    Ok(config)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Resolves `path` against the directory the config was loaded from.
pub fn resolve_path(config: &Config, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    match &config.base_directory {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
    }
}

/// The rule set named by the config: the rule file if one is configured,
/// otherwise the inline rules.
pub fn load_rule_set(config: &Config) -> Result<RuleSet, ConfigError> {
    let normalization = &config.normalization;
    let rule_set = match &normalization.rules_path {
        Some(rules_path) => RuleSet::load(resolve_path(config, rules_path))?,
        None => RuleSet {
            rules: normalization.rules.clone(),
            validations: normalization.validations.clone(),
        },
    };

    rule_set.validate()?;
    Ok(rule_set)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "retry.max_attempts must be at least 1".to_string(),
        });
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(ConfigError::Validation {
            message: format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                retry.base_delay_ms, retry.max_delay_ms
            ),
        });
    }
    if !(0.0..1.0).contains(&retry.jitter) {
        return Err(ConfigError::Validation {
            message: format!("retry.jitter must be in [0, 1), got {}", retry.jitter),
        });
    }

    let timeouts = &config.timeouts;
    if timeouts.extract_secs == 0 || timeouts.normalize_secs == 0 || timeouts.store_secs == 0 {
        return Err(ConfigError::Validation {
            message: "stage timeouts must be at least one second".to_string(),
        });
    }

    let normalization = &config.normalization;
    if normalization.rules_path.is_some() && normalization.has_inline_rules() {
        return Err(ConfigError::Validation {
            message: "normalization.rules_path and inline rules are mutually exclusive"
                .to_string(),
        });
    }

    if normalization.has_inline_rules() {
        RuleSet {
            rules: normalization.rules.clone(),
            validations: normalization.validations.clone(),
        }
        .validate()?;
    }

    Ok(())
}
