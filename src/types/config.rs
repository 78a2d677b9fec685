//! Configuration structures.
//!
//! Kernel configuration is loaded from a YAML (or JSON) file with `PERSONA_*`
//! environment overrides. Every section has defaults, so an empty file or no
//! file at all yields a runnable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::kernel::RateLimitConfig;
use crate::types::{Error, Result};

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Filesystem layout.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Scheduler timing.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Model endpoint defaults.
    #[serde(default)]
    pub model: ModelConfig,

    /// Default admission-control bucket for LLM calls.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Prompt sanitizer limits.
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
}

/// Filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding one `<identity>/identity.yaml` per identity.
    pub identities_dir: PathBuf,

    /// Root for per-identity, per-plugin data directories.
    pub data_root: PathBuf,

    /// Root for per-identity logs and the audit trail.
    pub log_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            identities_dir: PathBuf::from("identities"),
            data_root: PathBuf::from("data"),
            log_root: PathBuf::from("logs"),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Scheduler timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long `stop()` waits for task loops to observe cancellation.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Upper bound for a single execution of a task. Exceeding it counts as a
    /// failed execution; the loop keeps its schedule.
    #[serde(with = "humantime_serde")]
    pub tick_timeout: Duration,

    /// Grace period for each plugin's teardown during shutdown.
    #[serde(with = "humantime_serde")]
    pub teardown_timeout: Duration,

    /// How long shutdown waits for in-flight model invocations to write
    /// their audit records before the model client and audit sink close.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            tick_timeout: Duration::from_secs(300),
            teardown_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(60),
        }
    }
}

/// Model endpoint defaults (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,

    /// Model name sent with each request.
    pub model: String,

    /// Secret key looked up through the identity's secrets provider.
    pub api_key_secret: String,

    /// Per-request transport timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Default output token cap.
    pub max_output_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4.1-mini".to_string(),
            api_key_secret: "llm_api_key".to_string(),
            request_timeout: Duration::from_secs(60),
            max_output_tokens: 1000,
        }
    }
}

/// Prompt sanitizer limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizerConfig {
    /// Maximum characters kept per message.
    pub max_message_chars: usize,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 8_000,
        }
    }
}

impl Config {
    /// Load config from a YAML/JSON file, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let mut config: Config = if content.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus env overrides, for running without a config file.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("PERSONA_IDENTITIES_DIR") {
            self.paths.identities_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("PERSONA_DATA_DIR") {
            self.paths.data_root = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("PERSONA_LOG_DIR") {
            self.paths.log_root = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("PERSONA_MODEL_BASE_URL") {
            self.model.base_url = url;
        }
        if let Ok(model) = std::env::var("PERSONA_MODEL") {
            self.model.model = model;
        }
        if let Ok(format) = std::env::var("PERSONA_LOG_FORMAT") {
            self.observability.json_logs = format.eq_ignore_ascii_case("json");
        }
    }

    /// Reject values the kernel cannot run with.
    pub fn validate(&self) -> Result<()> {
        use crate::validation::{validate_non_empty, validate_non_zero_duration};

        let durations = [
            (self.scheduler.stop_timeout, "scheduler.stop_timeout"),
            (self.scheduler.tick_timeout, "scheduler.tick_timeout"),
            (self.scheduler.teardown_timeout, "scheduler.teardown_timeout"),
            (self.scheduler.drain_timeout, "scheduler.drain_timeout"),
            (self.model.request_timeout, "model.request_timeout"),
        ];
        validate_non_empty(&self.model.base_url, "model.base_url")
            .and_then(|_| validate_non_empty(&self.model.model, "model.model"))
            .and_then(|_| self.rate_limit.validate())
            .and_then(|_| {
                durations
                    .iter()
                    .try_for_each(|(d, field)| validate_non_zero_duration(*d, field))
            })
            .map_err(|e| Error::config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_empty_file_uses_defaults() {
        let tmp = NamedTempFile::new().unwrap();
        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config.scheduler.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.sanitizer.max_message_chars, 8_000);
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(
            tmp,
            "scheduler:\n  stop_timeout: 3s\n  tick_timeout: 1m\n  teardown_timeout: 2s\nrate_limit:\n  capacity: 5\n  refill_per_second: 0.5"
        )
        .unwrap();

        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config.scheduler.stop_timeout, Duration::from_secs(3));
        assert_eq!(config.scheduler.tick_timeout, Duration::from_secs(60));
        assert_eq!(config.rate_limit.capacity, 5.0);
        assert_eq!(config.model.max_output_tokens, 1000);
    }

    #[test]
    fn test_invalid_rate_limit_rejected() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "rate_limit:\n  capacity: 0\n  refill_per_second: 1").unwrap();
        let err = Config::load(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        for field in ["tick_timeout", "teardown_timeout", "drain_timeout"] {
            let mut tmp = NamedTempFile::new().unwrap();
            writeln!(tmp, "scheduler:\n  {}: 0s", field).unwrap();
            let err = Config::load(tmp.path()).unwrap_err();
            assert!(
                err.to_string().contains(&format!("scheduler.{}", field)),
                "unexpected error for {}: {}",
                field,
                err
            );
        }
    }

    #[test]
    fn test_scheduler_section_fills_missing_fields() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "scheduler:\n  tick_timeout: 45s").unwrap();
        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config.scheduler.tick_timeout, Duration::from_secs(45));
        assert_eq!(config.scheduler.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.scheduler.drain_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(err.is_fatal());
    }
}
