//! Plugin contract and the capabilities handed to each plugin.
//!
//! The orchestrator only ever touches a plugin through [`Plugin`]: `setup`
//! once, `tick` on every poll interval, `teardown` once on shutdown. All a
//! plugin may use is in its [`PluginContext`], built by the orchestrator
//! before that plugin's setup. The context exposes the model only through the
//! safe invocation pipeline.

pub mod capabilities;

pub use capabilities::{
    AdminPermissions, EnvSecretsProvider, PermissionChecker, QuietHours, QuietHoursWindow,
    SecretsProvider, StaticSecretsProvider,
};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::bus::EventBus;
use crate::identity::IdentityConfig;
use crate::kernel::Scheduler;
use crate::pipeline::{AuditRecord, AuditSink, ChatRequest, GateResult, SafeInvocationPipeline};
use crate::types::{Error, IdentityName, PluginName, Result};

/// A behavior module.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Disruptive plugins are not ticked during quiet hours.
    fn is_disruptive(&self) -> bool {
        false
    }

    /// Failure excludes the plugin from this run.
    async fn setup(&self, ctx: &PluginContext) -> Result<()>;

    async fn tick(&self, ctx: &PluginContext) -> Result<()>;

    async fn teardown(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }
}

/// Capabilities of one plugin instance. Cheap to clone.
#[derive(Clone)]
pub struct PluginContext {
    identity: Arc<IdentityConfig>,
    identity_name: IdentityName,
    plugin: PluginName,
    data_dir: PathBuf,
    log_dir: PathBuf,
    bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    audit: Arc<dyn AuditSink>,
    quiet_hours: Arc<dyn QuietHours>,
    pipeline: Arc<SafeInvocationPipeline>,
    secrets: Arc<dyn SecretsProvider>,
    permissions: Arc<dyn PermissionChecker>,
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("identity", &self.identity_name)
            .field("plugin", &self.plugin)
            .field("data_dir", &self.data_dir)
            .field("log_dir", &self.log_dir)
            .finish_non_exhaustive()
    }
}

/// Shared collaborators a context is cut from.
#[derive(Clone)]
pub(crate) struct ContextParts {
    pub identity: Arc<IdentityConfig>,
    pub identity_name: IdentityName,
    pub data_root: PathBuf,
    pub log_dir: PathBuf,
    pub bus: Arc<EventBus>,
    pub scheduler: Arc<Scheduler>,
    pub audit: Arc<dyn AuditSink>,
    pub quiet_hours: Arc<dyn QuietHours>,
    pub pipeline: Arc<SafeInvocationPipeline>,
    pub secrets: Arc<dyn SecretsProvider>,
    pub permissions: Arc<dyn PermissionChecker>,
}

impl ContextParts {
    /// Build a context for `plugin`, creating its data directory.
    pub(crate) async fn context_for(&self, plugin: PluginName) -> Result<PluginContext> {
        let data_dir = self.data_root.join(plugin.as_str());
        tokio::fs::create_dir_all(&data_dir).await?;
        Ok(PluginContext {
            identity: self.identity.clone(),
            identity_name: self.identity_name.clone(),
            plugin,
            data_dir,
            log_dir: self.log_dir.clone(),
            bus: self.bus.clone(),
            scheduler: self.scheduler.clone(),
            audit: self.audit.clone(),
            quiet_hours: self.quiet_hours.clone(),
            pipeline: self.pipeline.clone(),
            secrets: self.secrets.clone(),
            permissions: self.permissions.clone(),
        })
    }
}

impl PluginContext {
    pub fn identity(&self) -> &IdentityConfig {
        &self.identity
    }

    pub fn identity_name(&self) -> &IdentityName {
        &self.identity_name
    }

    pub fn plugin_name(&self) -> &PluginName {
        &self.plugin
    }

    /// Private directory for this plugin's files.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The identity's log directory.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn is_quiet_hours(&self) -> bool {
        self.quiet_hours.is_quiet_hours()
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.permissions.is_admin(user_id)
    }

    /// Secret scoped to this identity.
    pub fn secret(&self, key: &str) -> Option<String> {
        self.secrets.get(self.identity_name.as_str(), key)
    }

    /// Settings block for this plugin from the identity file.
    pub fn settings(&self) -> Option<&serde_json::Value> {
        self.identity.plugin_settings(self.plugin.as_str())
    }

    /// Invoke the model through the safe invocation pipeline.
    pub async fn chat(&self, request: ChatRequest) -> GateResult {
        self.pipeline.chat(request).await
    }

    pub async fn model_health(&self) -> bool {
        self.pipeline.model_health().await
    }

    /// Append an audit record tagged with this plugin.
    pub async fn audit(&self, record: AuditRecord) {
        let record = record
            .field("identity", self.identity_name.as_str())
            .field("plugin", self.plugin.as_str());
        self.audit.log(record).await;
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Builds a fresh plugin instance for an identity.
pub type PluginFactory = Arc<dyn Fn(&IdentityConfig) -> Result<Arc<dyn Plugin>> + Send + Sync>;

/// Name → factory map. Safe to extend while running.
#[derive(Default)]
pub struct PluginRegistry {
    factories: RwLock<BTreeMap<String, PluginFactory>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the plugins shipped in this crate.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::plugins::register_builtins(&registry);
        registry
    }

    /// Register `factory` under `name`; returns `true` if it replaced one.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> bool
    where
        F: Fn(&IdentityConfig) -> Result<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(factory))
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Instantiate `name` for `identity`.
    pub fn create(&self, name: &str, identity: &IdentityConfig) -> Result<Arc<dyn Plugin>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("plugin '{}' is not registered", name)))?;
        factory(identity)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Context construction for plugin unit tests.

    use super::*;
    use crate::pipeline::{MemoryAuditSink, ModelClient};
    use crate::types::SchedulerConfig;

    pub(crate) struct Harness {
        pub ctx: PluginContext,
        pub audit: Arc<MemoryAuditSink>,
        pub bus: Arc<EventBus>,
        pub _tmp: tempfile::TempDir,
    }

    pub(crate) async fn harness(
        identity: IdentityConfig,
        plugin: &str,
        model: Arc<dyn ModelClient>,
    ) -> Harness {
        let tmp = tempfile::TempDir::new().unwrap();
        let identity_name = identity.identity_name().unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let bus = Arc::new(EventBus::new());
        let pipeline = Arc::new(
            SafeInvocationPipeline::builder(identity_name.clone(), model, audit.clone()).build(),
        );
        let parts = ContextParts {
            permissions: Arc::new(AdminPermissions::new(identity.admin_ids.clone())),
            identity: Arc::new(identity),
            identity_name,
            data_root: tmp.path().join("data"),
            log_dir: tmp.path().join("logs"),
            bus: bus.clone(),
            scheduler: Arc::new(Scheduler::new(SchedulerConfig::default())),
            audit: audit.clone(),
            quiet_hours: Arc::new(QuietHoursWindow::disabled()),
            pipeline,
            secrets: Arc::new(StaticSecretsProvider::new()),
        };
        let ctx = parts
            .context_for(PluginName::from_string(plugin.to_string()).unwrap())
            .await
            .unwrap();
        Harness {
            ctx,
            audit,
            bus,
            _tmp: tmp,
        }
    }
}
