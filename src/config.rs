//! Configuration management for Brute Guard.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{BruteGuardError, Result};
use crate::guard::policy::{
    Policy, DEFAULT_FREE_RETRIES, DEFAULT_MAX_WAIT_MS, DEFAULT_MIN_WAIT_MS,
};
use crate::guard::response::FailureMode;

/// Prefix for environment overrides, e.g. `BRUTE_GUARD__POLICY__FREE_RETRIES=5`.
pub const ENV_PREFIX: &str = "BRUTE_GUARD";

/// Main configuration for Brute Guard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Escalation policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Attempt store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Escalation policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Limiter name; drawn from the default name sequence when unset
    #[serde(default)]
    pub name: Option<String>,

    /// Attempts allowed before any delay applies
    #[serde(default = "default_free_retries")]
    pub free_retries: u64,

    /// First delay in milliseconds
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,

    /// Largest delay in milliseconds
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Window lifetime in seconds; derived from the schedule when unset, 0 disables expiry
    #[serde(default)]
    pub lifetime_secs: Option<u64>,

    /// Restart the window's expiry clock on every admitted attempt
    #[serde(default = "default_true")]
    pub refresh_lifetime_on_attempt: bool,

    /// Default answer for denied attempts
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Hand out reset handles with each outcome
    #[serde(default = "default_true")]
    pub attach_reset: bool,

    /// Use the store's atomic increment when available
    #[serde(default = "default_true")]
    pub prefer_atomic: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            name: None,
            free_retries: default_free_retries(),
            min_wait_ms: default_min_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            lifetime_secs: None,
            refresh_lifetime_on_attempt: true,
            failure_mode: FailureMode::default(),
            attach_reset: true,
            prefer_atomic: true,
        }
    }
}

impl PolicyConfig {
    /// Validate the numeric bounds and build the policy.
    pub fn to_policy(&self) -> Result<Policy> {
        Policy::new(
            self.free_retries,
            self.min_wait_ms,
            self.max_wait_ms,
            self.lifetime_secs,
            self.refresh_lifetime_on_attempt,
        )
    }
}

fn default_free_retries() -> u64 {
    DEFAULT_FREE_RETRIES
}

fn default_min_wait_ms() -> u64 {
    DEFAULT_MIN_WAIT_MS
}

fn default_max_wait_ms() -> u64 {
    DEFAULT_MAX_WAIT_MS
}

fn default_true() -> bool {
    true
}

/// Attempt store configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Prefix prepended to every store key
    #[serde(default)]
    pub prefix: String,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GuardConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| BruteGuardError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load an optional file layered under `BRUTE_GUARD__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| BruteGuardError::Config(e.to_string()))
    }

    /// Check that the policy section describes a valid policy.
    pub fn validate(&self) -> Result<()> {
        self.policy.to_policy().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GuardConfig::default();
        assert_eq!(config.policy.free_retries, 2);
        assert_eq!(config.policy.min_wait_ms, 500);
        assert_eq!(config.policy.max_wait_ms, 900_000);
        assert_eq!(config.policy.lifetime_secs, None);
        assert!(config.policy.refresh_lifetime_on_attempt);
        assert!(config.policy.attach_reset);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
policy:
  name: login
  free_retries: 5
  max_wait_ms: 60000
  lifetime_secs: 0
  refresh_lifetime_on_attempt: false
  failure_mode: forbidden
store:
  prefix: "bg:"
"#;
        let config = GuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.policy.name.as_deref(), Some("login"));
        assert_eq!(config.policy.free_retries, 5);
        assert_eq!(config.policy.min_wait_ms, 500);
        assert_eq!(config.policy.max_wait_ms, 60_000);
        assert_eq!(config.policy.lifetime_secs, Some(0));
        assert!(!config.policy.refresh_lifetime_on_attempt);
        assert_eq!(config.policy.failure_mode, FailureMode::Forbidden);
        assert_eq!(config.store.prefix, "bg:");

        let policy = config.policy.to_policy().unwrap();
        assert_eq!(policy.lifetime_secs(), 0);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = GuardConfig::from_yaml("{}").unwrap();
        assert_eq!(config, GuardConfig::default());
    }

    #[test]
    fn test_invalid_bounds_fail_validation() {
        let yaml = r#"
policy:
  min_wait_ms: 5000
  max_wait_ms: 1000
"#;
        let config = GuardConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(BruteGuardError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            GuardConfig::from_yaml("policy: [1, 2"),
            Err(BruteGuardError::Config(_))
        ));
    }

    #[test]
    fn test_load_without_file_gives_defaults() {
        let config = GuardConfig::load(None).unwrap();
        assert_eq!(config.policy.min_wait_ms, 500);
    }

    #[test]
    fn test_load_reads_the_given_file() {
        let path = std::env::temp_dir().join(format!("brute-guard-load-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "policy:\n  name: login\n  free_retries: 0\n  max_wait_ms: 1000\n  failure_mode: mark\nlogging:\n  json: true\n",
        )
        .unwrap();

        let loaded = GuardConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.policy.name.as_deref(), Some("login"));
        assert_eq!(config.policy.free_retries, 0);
        assert_eq!(config.policy.min_wait_ms, 500);
        assert_eq!(config.policy.max_wait_ms, 1000);
        assert_eq!(config.policy.failure_mode, FailureMode::Mark);
        assert!(config.logging.json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("brute-guard-does-not-exist.yaml");
        assert!(matches!(
            GuardConfig::load(Some(&path)),
            Err(BruteGuardError::Config(_))
        ));
    }
}
