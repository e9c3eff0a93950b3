pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str, load_rule_set, resolve_path};
pub use schema::{Config, NormalizationConfig, RetryConfig, TimeoutConfig};
