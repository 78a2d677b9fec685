//! Per-identity configuration.
//!
//! Each identity lives in `<identities_dir>/<name>/identity.yaml`. The file is
//! read once at setup and shared immutably with the pipeline and plugins.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::kernel::RateLimitConfig;
use crate::types::{Error, IdentityName, Result};
use crate::validation::{
    validate_hour, validate_non_empty, validate_non_zero_duration, validate_unique,
};

/// File name looked up inside each identity directory.
pub const IDENTITY_FILE: &str = "identity.yaml";

fn default_poll_interval() -> Duration {
    Duration::from_secs(300)
}

/// Quiet-hours window in local time; `start_hour == end_hour` disables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHoursConfig {
    pub start_hour: u32,
    pub end_hour: u32,
}

/// Per-identity overrides of the kernel's model defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOverride {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key_secret: Option<String>,
    pub max_output_tokens: Option<u32>,
}

/// Immutable configuration for one identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Filled from the directory name when omitted.
    #[serde(default)]
    pub name: String,

    /// How often each plugin ticks.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Plugins to load, in registration order.
    #[serde(default)]
    pub plugins: Vec<String>,

    /// User IDs with admin rights over this identity.
    #[serde(default)]
    pub admin_ids: Vec<String>,

    /// Lines shown instead of a blocked reply.
    #[serde(default)]
    pub deflections: Vec<String>,

    #[serde(default)]
    pub quiet_hours: Option<QuietHoursConfig>,

    /// Overrides the kernel's default LLM bucket.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Phrases removed from model output.
    #[serde(default)]
    pub banned_phrases: Vec<String>,

    /// Vocabulary swaps applied to model output.
    #[serde(default)]
    pub substitutions: BTreeMap<String, String>,

    /// Extra pre-flight rejection patterns.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,

    #[serde(default)]
    pub model: ModelOverride,

    /// Free-form settings keyed by plugin name.
    #[serde(default)]
    pub plugin_settings: HashMap<String, serde_json::Value>,
}

impl IdentityConfig {
    /// Minimal config, mostly for tests and embedding.
    pub fn new(name: impl Into<String>, plugins: Vec<String>) -> Self {
        Self {
            name: name.into(),
            poll_interval: default_poll_interval(),
            plugins,
            admin_ids: Vec::new(),
            deflections: Vec::new(),
            quiet_hours: None,
            rate_limit: None,
            banned_phrases: Vec::new(),
            substitutions: BTreeMap::new(),
            blocked_patterns: Vec::new(),
            model: ModelOverride::default(),
            plugin_settings: HashMap::new(),
        }
    }

    pub fn identity_name(&self) -> Result<IdentityName> {
        IdentityName::from_string(self.name.clone()).map_err(Error::validation)
    }

    /// Settings block for `plugin`, if any.
    pub fn plugin_settings(&self, plugin: &str) -> Option<&serde_json::Value> {
        self.plugin_settings.get(plugin)
    }

    pub fn validate(&self) -> Result<()> {
        validate_non_empty(&self.name, "name")?;
        if self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(Error::validation(format!(
                "name '{}' must be a single path segment",
                self.name
            )));
        }
        validate_non_zero_duration(self.poll_interval, "poll_interval")?;
        if self.plugins.is_empty() {
            return Err(Error::validation("plugins cannot be empty"));
        }
        for plugin in &self.plugins {
            validate_non_empty(plugin, "plugins[]")?;
        }
        validate_unique(&self.plugins, "plugins")?;
        if let Some(q) = &self.quiet_hours {
            validate_hour(q.start_hour, "quiet_hours.start_hour")?;
            validate_hour(q.end_hour, "quiet_hours.end_hour")?;
        }
        if let Some(rl) = &self.rate_limit {
            rl.validate()?;
        }
        Ok(())
    }
}

/// Source of identity configuration.
#[async_trait]
pub trait IdentityLoader: Send + Sync {
    async fn load(&self, name: &str) -> Result<IdentityConfig>;
}

/// Reads `<root>/<name>/identity.yaml`.
#[derive(Debug, Clone)]
pub struct FileIdentityLoader {
    root: PathBuf,
}

impl FileIdentityLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name).join(IDENTITY_FILE)
    }

    /// Parse and validate an identity file, naming it after its directory
    /// when the file does not say.
    pub fn parse(path: &Path, dir_name: &str) -> Result<IdentityConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::not_found(format!("identity file {}", path.display()))
            }
            _ => Error::config(format!("failed to read {}: {}", path.display(), e)),
        })?;
        let mut config: IdentityConfig = serde_yaml::from_str(&content)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;

        if config.name.trim().is_empty() {
            config.name = dir_name.to_string();
        } else if config.name != dir_name {
            return Err(Error::validation(format!(
                "identity file {} declares name '{}' but lives in '{}'",
                path.display(),
                config.name,
                dir_name
            )));
        }
        config.validate()?;
        Ok(config)
    }
}

#[async_trait]
impl IdentityLoader for FileIdentityLoader {
    async fn load(&self, name: &str) -> Result<IdentityConfig> {
        validate_non_empty(name, "identity")?;
        let path = self.path_for(name);
        let dir_name = name.to_string();
        let config = tokio::task::spawn_blocking(move || Self::parse(&path, &dir_name))
            .await
            .map_err(|e| Error::internal(format!("identity load task failed: {}", e)))??;
        tracing::info!(
            "identity_loaded: name={}, plugins={:?}, poll_interval={:?}",
            config.name,
            config.plugins,
            config.poll_interval
        );
        Ok(config)
    }
}

/// Serves a fixed set of identities from memory.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityLoader {
    identities: HashMap<String, IdentityConfig>,
}

impl StaticIdentityLoader {
    pub fn new(identities: impl IntoIterator<Item = IdentityConfig>) -> Self {
        Self {
            identities: identities
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }
}

#[async_trait]
impl IdentityLoader for StaticIdentityLoader {
    async fn load(&self, name: &str) -> Result<IdentityConfig> {
        let config = self
            .identities
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("identity '{}'", name)))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write_identity(root: &Path, name: &str, body: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(IDENTITY_FILE), body).unwrap();
    }

    #[tokio::test]
    async fn test_load_full_identity() {
        let tmp = TempDir::new().unwrap();
        write_identity(
            tmp.path(),
            "coral",
            r#"
poll_interval: 90s
plugins: [heartbeat, journal]
admin_ids: ["u-1"]
deflections: ["Nice try."]
quiet_hours: { start_hour: 23, end_hour: 7 }
rate_limit: { capacity: 3, refill_per_second: 0.1 }
banned_phrases: ["as an AI"]
substitutions: { awesome: fine }
plugin_settings:
  journal:
    prompt: "Write about the reef."
"#,
        );

        let config = FileIdentityLoader::new(tmp.path()).load("coral").await.unwrap();
        assert_eq!(config.name, "coral");
        assert_eq!(config.poll_interval, Duration::from_secs(90));
        assert_eq!(config.plugins, vec!["heartbeat", "journal"]);
        assert_eq!(
            config.quiet_hours,
            Some(QuietHoursConfig {
                start_hour: 23,
                end_hour: 7
            })
        );
        assert_eq!(config.rate_limit.unwrap().capacity, 3.0);
        assert_eq!(config.substitutions["awesome"], "fine");
        assert_eq!(
            config.plugin_settings("journal").unwrap()["prompt"],
            "Write about the reef."
        );
    }

    #[tokio::test]
    async fn test_defaults_fill_missing_fields() {
        let tmp = TempDir::new().unwrap();
        write_identity(tmp.path(), "kelp", "plugins: [heartbeat]\n");
        let config = FileIdentityLoader::new(tmp.path()).load("kelp").await.unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(300));
        assert!(config.quiet_hours.is_none());
        assert!(config.rate_limit.is_none());
    }

    #[tokio::test]
    async fn test_missing_identity_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = FileIdentityLoader::new(tmp.path()).load("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_identities_rejected() {
        let tmp = TempDir::new().unwrap();
        let loader = FileIdentityLoader::new(tmp.path());

        write_identity(tmp.path(), "empty", "plugins: []\n");
        assert!(matches!(loader.load("empty").await, Err(Error::Validation(_))));

        write_identity(tmp.path(), "dup", "plugins: [a, a]\n");
        assert!(loader.load("dup").await.is_err());

        write_identity(
            tmp.path(),
            "late",
            "plugins: [a]\nquiet_hours: { start_hour: 25, end_hour: 3 }\n",
        );
        assert!(loader.load("late").await.is_err());

        write_identity(tmp.path(), "liar", "name: other\nplugins: [a]\n");
        assert!(loader.load("liar").await.is_err());

        write_identity(tmp.path(), "broken", "plugins: [a\n");
        assert!(matches!(loader.load("broken").await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_static_loader() {
        let loader = StaticIdentityLoader::new(vec![IdentityConfig::new(
            "coral",
            vec!["heartbeat".into()],
        )]);
        assert!(loader.load("coral").await.is_ok());
        assert!(matches!(loader.load("kelp").await, Err(Error::NotFound(_))));
    }
}
