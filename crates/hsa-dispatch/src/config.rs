//! Dispatch configuration.
//!
//! Loads [`DispatchConfig`] from TOML with environment variable overrides via
//! `HSA_DISPATCH_*` prefixed variables.

use crate::packet::FenceScope;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_QUEUE_SIZE: &str = "HSA_DISPATCH_QUEUE_SIZE";
pub const ENV_WAIT_TIMEOUT_MS: &str = "HSA_DISPATCH_WAIT_TIMEOUT_MS";
pub const ENV_KERNEL_NAME: &str = "HSA_DISPATCH_KERNEL_NAME";
pub const ENV_FENCE_SCOPE: &str = "HSA_DISPATCH_FENCE_SCOPE";
pub const ENV_BARRIER: &str = "HSA_DISPATCH_BARRIER";

/// Largest queue the harness will request.
pub const MAX_QUEUE_SIZE: u32 = 1 << 17;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Queue size in packets; unset means the agent's maximum.
    /// Override: `HSA_DISPATCH_QUEUE_SIZE`
    pub queue_size: Option<u32>,

    /// Completion wait bound in milliseconds; unset blocks indefinitely.
    /// Override: `HSA_DISPATCH_WAIT_TIMEOUT_MS` (`0` or `none` clears it)
    pub wait_timeout_ms: Option<u64>,

    /// Kernel symbol resolved from the executable.
    /// Override: `HSA_DISPATCH_KERNEL_NAME`
    pub kernel_name: String,

    /// Acquire/release fence scope of the dispatch packet.
    /// Override: `HSA_DISPATCH_FENCE_SCOPE`
    pub fence_scope: FenceScope,

    /// Set the packet barrier bit.
    /// Override: `HSA_DISPATCH_BARRIER`
    pub barrier: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_size: None,
            wait_timeout_ms: None,
            kernel_name: "hello_world".to_string(),
            fence_scope: FenceScope::System,
            barrier: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

fn env_error(key: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::EnvOverride { key: key.into(), value: value.into(), reason: reason.to_string() }
}

impl DispatchConfig {
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).expect("default config should serialize")
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: DispatchConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_queue_size(mut self, size: u32) -> Self {
        self.queue_size = Some(size);
        self
    }

    pub fn with_kernel_name(mut self, name: impl Into<String>) -> Self {
        self.kernel_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(size) = self.queue_size {
            if size == 0 || !size.is_power_of_two() {
                return Err(ConfigError::Validation(format!(
                    "queue_size must be a non-zero power of two, got {size}"
                )));
            }
            if size > MAX_QUEUE_SIZE {
                return Err(ConfigError::Validation(format!(
                    "queue_size must be <= {MAX_QUEUE_SIZE}, got {size}"
                )));
            }
        }
        if self.wait_timeout_ms == Some(0) {
            return Err(ConfigError::Validation(
                "wait_timeout_ms must be > 0 (omit it to wait indefinitely)".into(),
            ));
        }
        if self.kernel_name.is_empty() {
            return Err(ConfigError::Validation("kernel_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var(ENV_QUEUE_SIZE) {
            self.queue_size =
                Some(val.parse::<u32>().map_err(|e| env_error(ENV_QUEUE_SIZE, &val, e))?);
        }

        if let Ok(val) = std::env::var(ENV_WAIT_TIMEOUT_MS) {
            self.wait_timeout_ms = match val.as_str() {
                "" | "0" | "none" => None,
                v => Some(v.parse::<u64>().map_err(|e| env_error(ENV_WAIT_TIMEOUT_MS, &val, e))?),
            };
        }

        if let Ok(val) = std::env::var(ENV_KERNEL_NAME) {
            self.kernel_name = val;
        }

        if let Ok(val) = std::env::var(ENV_FENCE_SCOPE) {
            self.fence_scope =
                val.parse::<FenceScope>().map_err(|reason| env_error(ENV_FENCE_SCOPE, &val, reason))?;
        }

        if let Ok(val) = std::env::var(ENV_BARRIER) {
            self.barrier = matches!(val.as_str(), "1" | "true" | "yes");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_VARS: [&str; 5] =
        [ENV_QUEUE_SIZE, ENV_WAIT_TIMEOUT_MS, ENV_KERNEL_NAME, ENV_FENCE_SCOPE, ENV_BARRIER];

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        ALL_VARS.iter().map(|k| (*k, None)).collect()
    }

    #[test]
    fn test_default_config_is_valid() {
        let cfg = DispatchConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.wait_timeout(), None);
    }

    #[test]
    #[serial(hsa_dispatch_env)]
    fn test_default_toml_round_trips() {
        temp_env::with_vars(cleared(), || {
            let cfg = DispatchConfig::from_toml(&DispatchConfig::default_toml()).unwrap();
            assert_eq!(cfg, DispatchConfig::default());
        });
    }

    #[test]
    #[serial(hsa_dispatch_env)]
    fn test_from_toml_full() {
        let toml_str = r#"
queue_size = 64
wait_timeout_ms = 2500
kernel_name = "vector_copy"
fence_scope = "agent"
barrier = false
"#;
        temp_env::with_vars(cleared(), || {
            let cfg = DispatchConfig::from_toml(toml_str).unwrap();
            assert_eq!(cfg.queue_size, Some(64));
            assert_eq!(cfg.wait_timeout(), Some(Duration::from_millis(2500)));
            assert_eq!(cfg.kernel_name, "vector_copy");
            assert_eq!(cfg.fence_scope, FenceScope::Agent);
            assert!(!cfg.barrier);
        });
    }

    #[test]
    #[serial(hsa_dispatch_env)]
    fn test_partial_toml_uses_defaults() {
        temp_env::with_vars(cleared(), || {
            let cfg = DispatchConfig::from_toml("queue_size = 16\n").unwrap();
            assert_eq!(cfg.queue_size, Some(16));
            assert_eq!(cfg.kernel_name, "hello_world");
            assert!(cfg.barrier);
        });
    }

    #[test]
    fn test_validation_queue_size_not_power_of_two() {
        let cfg = DispatchConfig { queue_size: Some(100), ..Default::default() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_validation_queue_size_too_large() {
        let cfg = DispatchConfig { queue_size: Some(1 << 20), ..Default::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("<="));
    }

    #[test]
    fn test_validation_zero_timeout() {
        let cfg = DispatchConfig { wait_timeout_ms: Some(0), ..Default::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("wait_timeout_ms"));
    }

    #[test]
    fn test_validation_empty_kernel_name() {
        let cfg = DispatchConfig::default().with_kernel_name("");
        assert!(cfg.validate().unwrap_err().to_string().contains("must not be empty"));
    }

    #[test]
    #[serial(hsa_dispatch_env)]
    fn test_env_override_multiple_fields() {
        temp_env::with_vars(
            [
                (ENV_QUEUE_SIZE, Some("32")),
                (ENV_WAIT_TIMEOUT_MS, Some("750")),
                (ENV_KERNEL_NAME, Some("fill")),
                (ENV_FENCE_SCOPE, Some("none")),
                (ENV_BARRIER, Some("0")),
            ],
            || {
                let cfg = DispatchConfig::from_env().unwrap();
                assert_eq!(cfg.queue_size, Some(32));
                assert_eq!(cfg.wait_timeout_ms, Some(750));
                assert_eq!(cfg.kernel_name, "fill");
                assert_eq!(cfg.fence_scope, FenceScope::None);
                assert!(!cfg.barrier);
            },
        );
    }

    #[test]
    #[serial(hsa_dispatch_env)]
    fn test_env_timeout_none_clears_toml_value() {
        let mut vars = cleared();
        vars[1] = (ENV_WAIT_TIMEOUT_MS, Some("none"));
        temp_env::with_vars(vars, || {
            let cfg = DispatchConfig::from_toml("wait_timeout_ms = 10\n").unwrap();
            assert_eq!(cfg.wait_timeout_ms, None);
        });
    }

    #[test]
    #[serial(hsa_dispatch_env)]
    fn test_env_override_rejects_garbage() {
        let mut vars = cleared();
        vars[0] = (ENV_QUEUE_SIZE, Some("lots"));
        temp_env::with_vars(vars, || {
            let err = DispatchConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::EnvOverride { ref key, .. } if key == ENV_QUEUE_SIZE));
        });
    }

    #[test]
    #[serial(hsa_dispatch_env)]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.toml");
        std::fs::write(&path, "kernel_name = \"saxpy\"\n").unwrap();
        temp_env::with_vars(cleared(), || {
            let cfg = DispatchConfig::load(&path).unwrap();
            assert_eq!(cfg.kernel_name, "saxpy");
        });
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DispatchConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
