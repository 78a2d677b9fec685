//! Orchestrator - owns one identity's process lifecycle.
//!
//! Setup builds the collaborators in dependency order (identity → audit →
//! model → admission → pipeline), then loads each configured plugin with a
//! fresh context. A plugin that fails to load is audited and skipped; only
//! "nothing loaded at all" is fatal.
//!
//! `run` registers one scheduler task per active plugin and blocks until the
//! scheduler is stopped. `stop` is idempotent: exactly one caller performs
//! the teardown, every other caller waits until the state is STOPPED.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{Lifecycle, LifecycleState};
use super::rate_limiter::RateLimiter;
use super::recovery::with_recovery_async;
use super::scheduler::{task_fn, Scheduler, TaskStats};
use crate::bus::{BusStats, EventBus};
use crate::identity::{FileIdentityLoader, IdentityConfig, IdentityLoader};
use crate::pipeline::{
    AuditRecord, AuditSink, BasicSanitizer, HttpModelClient, JsonlAuditSink, KeywordPreflight,
    ModelClient, PhraseFilter, SafeInvocationPipeline,
};
use crate::plugin::capabilities::{
    AdminPermissions, EnvSecretsProvider, QuietHours, QuietHoursWindow, SecretsProvider,
};
use crate::plugin::{ContextParts, Plugin, PluginContext, PluginRegistry};
use crate::types::{Config, Error, IdentityName, ModelConfig, PluginName, Result};

/// Audit category for lifecycle records.
pub const AUDIT_CATEGORY: &str = "lifecycle";
/// Audit event for a plugin that failed to load.
pub const PLUGIN_LOAD_FAILED: &str = "plugin_load_failed";
/// Audit event for a plugin whose teardown failed.
pub const PLUGIN_TEARDOWN_FAILED: &str = "plugin_teardown_failed";
/// Audit event for the model health check during setup.
pub const MODEL_HEALTH_CHECK: &str = "model_health_check";

/// Audit file name inside the identity's log directory.
pub const AUDIT_FILE: &str = "audit.jsonl";

struct ActivePlugin {
    plugin: Arc<dyn Plugin>,
    ctx: PluginContext,
}

/// Collaborators created during setup and released during stop.
struct Runtime {
    identity: Arc<IdentityConfig>,
    audit: Arc<dyn AuditSink>,
    model: Arc<dyn ModelClient>,
    pipeline: Arc<SafeInvocationPipeline>,
}

/// Point-in-time view of an orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub identity: String,
    pub state: LifecycleState,
    pub active_plugins: Vec<String>,
    pub tasks: Vec<TaskStats>,
    pub bus: BusStats,
}

/// Configures an [`Orchestrator`]. Anything not supplied is built from the
/// kernel config during setup.
pub struct OrchestratorBuilder {
    identity: String,
    config: Config,
    loader: Option<Arc<dyn IdentityLoader>>,
    registry: Option<Arc<PluginRegistry>>,
    secrets: Option<Arc<dyn SecretsProvider>>,
    model: Option<Arc<dyn ModelClient>>,
    audit: Option<Arc<dyn AuditSink>>,
    quiet_hours: Option<Arc<dyn QuietHours>>,
    handle_signals: bool,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("identity", &self.identity)
            .field("handle_signals", &self.handle_signals)
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    pub fn new(identity: impl Into<String>, config: Config) -> Self {
        Self {
            identity: identity.into(),
            config,
            loader: None,
            registry: None,
            secrets: None,
            model: None,
            audit: None,
            quiet_hours: None,
            handle_signals: true,
        }
    }

    pub fn identity_loader(mut self, loader: Arc<dyn IdentityLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn secrets(mut self, secrets: Arc<dyn SecretsProvider>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn model_client(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn quiet_hours(mut self, quiet_hours: Arc<dyn QuietHours>) -> Self {
        self.quiet_hours = Some(quiet_hours);
        self
    }

    /// Install SIGINT/SIGTERM handlers in `run` (default `true`).
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn build(self) -> Result<Arc<Orchestrator>> {
        let identity = IdentityName::from_string(self.identity).map_err(Error::validation)?;
        self.config.validate()?;
        let loader = self.loader.unwrap_or_else(|| {
            Arc::new(FileIdentityLoader::new(
                self.config.paths.identities_dir.clone(),
            ))
        });
        let scheduler = Arc::new(Scheduler::new(self.config.scheduler.clone()));
        Ok(Arc::new(Orchestrator {
            identity,
            config: self.config,
            loader,
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(PluginRegistry::with_builtins())),
            secrets: self
                .secrets
                .unwrap_or_else(|| Arc::new(EnvSecretsProvider)),
            model_override: self.model,
            audit_override: self.audit,
            quiet_hours_override: self.quiet_hours,
            handle_signals: self.handle_signals,
            lifecycle: Lifecycle::new(),
            bus: Arc::new(EventBus::new()),
            scheduler,
            shutdown: CancellationToken::new(),
            runtime: OnceLock::new(),
            active: Mutex::new(Vec::new()),
        }))
    }
}

/// Owns the lifecycle of one identity.
pub struct Orchestrator {
    identity: IdentityName,
    config: Config,
    loader: Arc<dyn IdentityLoader>,
    registry: Arc<PluginRegistry>,
    secrets: Arc<dyn SecretsProvider>,
    model_override: Option<Arc<dyn ModelClient>>,
    audit_override: Option<Arc<dyn AuditSink>>,
    quiet_hours_override: Option<Arc<dyn QuietHours>>,
    handle_signals: bool,

    lifecycle: Lifecycle,
    bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    /// Cancelled when stop begins; refuses new model invocations.
    shutdown: CancellationToken,
    runtime: OnceLock<Runtime>,
    /// Held for the whole of setup so a concurrent stop waits for it.
    active: Mutex<Vec<ActivePlugin>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("identity", &self.identity)
            .field("state", &self.lifecycle.current())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder(identity: impl Into<String>, config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder::new(identity, config)
    }

    pub fn identity(&self) -> &IdentityName {
        &self.identity
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// INIT → SETUP: build collaborators and load plugins.
    pub async fn setup(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        self.lifecycle.transition(LifecycleState::Setup)?;
        tracing::info!("orchestrator_setup_started: identity={}", self.identity);

        let identity = Arc::new(self.loader.load(self.identity.as_str()).await?);
        if identity.name != self.identity.as_str() {
            return Err(Error::validation(format!(
                "loader returned identity '{}' for '{}'",
                identity.name, self.identity
            )));
        }

        let log_dir = self.config.paths.log_root.join(self.identity.as_str());
        let data_root = self.config.paths.data_root.join(self.identity.as_str());
        tokio::fs::create_dir_all(&log_dir).await?;
        tokio::fs::create_dir_all(&data_root).await?;

        let audit: Arc<dyn AuditSink> = match &self.audit_override {
            Some(audit) => audit.clone(),
            None => Arc::new(JsonlAuditSink::open(log_dir.join(AUDIT_FILE)).await?),
        };
        let model: Arc<dyn ModelClient> = match &self.model_override {
            Some(model) => model.clone(),
            None => Arc::new(self.build_model_client(&identity)?),
        };

        let limiter = Arc::new(RateLimiter::new(Some(
            identity.rate_limit.unwrap_or(self.config.rate_limit),
        )));
        let pipeline = Arc::new(
            SafeInvocationPipeline::builder(self.identity.clone(), model.clone(), audit.clone())
                .sanitizer(Arc::new(BasicSanitizer::new(
                    self.config.sanitizer.max_message_chars,
                )))
                .rate_limiter(limiter)
                .preflight(Arc::new(
                    KeywordPreflight::new(identity.deflections.clone())
                        .with_patterns(identity.blocked_patterns.clone()),
                ))
                .output_filter(Arc::new(PhraseFilter::new(
                    identity.banned_phrases.clone(),
                    identity.substitutions.clone(),
                    identity.deflections.clone(),
                )))
                .shutdown_token(self.shutdown.clone())
                .model_timeout(self.config.model.request_timeout)
                .build(),
        );

        // Set before any fallible plugin work so stop() can always release these.
        let _ = self.runtime.set(Runtime {
            identity: identity.clone(),
            audit: audit.clone(),
            model: model.clone(),
            pipeline: pipeline.clone(),
        });

        self.check_model_health(&model, &audit).await;

        let parts = ContextParts {
            identity: identity.clone(),
            identity_name: self.identity.clone(),
            data_root,
            log_dir,
            bus: self.bus.clone(),
            scheduler: self.scheduler.clone(),
            audit: audit.clone(),
            quiet_hours: self
                .quiet_hours_override
                .clone()
                .unwrap_or_else(|| Arc::new(QuietHoursWindow::from(identity.quiet_hours))),
            pipeline,
            secrets: self.secrets.clone(),
            permissions: Arc::new(AdminPermissions::new(identity.admin_ids.clone())),
        };

        for name in &identity.plugins {
            match self.load_plugin(name, &identity, &parts).await {
                Ok(loaded) => {
                    tracing::info!("plugin_loaded: identity={}, plugin={}", self.identity, name);
                    active.push(loaded);
                }
                Err(e) => {
                    tracing::warn!(
                        "plugin_setup_failed: identity={}, plugin={}, error={}",
                        self.identity,
                        name,
                        e
                    );
                    audit
                        .log(
                            AuditRecord::new(PLUGIN_LOAD_FAILED, AUDIT_CATEGORY)
                                .success(false)
                                .field("identity", self.identity.as_str())
                                .field("plugin", name.as_str())
                                .field("error", e.to_string()),
                        )
                        .await;
                }
            }
        }

        if active.is_empty() {
            tracing::error!("orchestrator_no_active_plugins: identity={}", self.identity);
            return Err(Error::NoActivePlugins(self.identity.to_string()));
        }
        tracing::info!(
            "orchestrator_setup_complete: identity={}, active_plugins={}",
            self.identity,
            active.len()
        );
        Ok(())
    }

    fn build_model_client(&self, identity: &IdentityConfig) -> Result<HttpModelClient> {
        let defaults = &self.config.model;
        let overrides = &identity.model;
        let config = ModelConfig {
            base_url: overrides
                .base_url
                .clone()
                .unwrap_or_else(|| defaults.base_url.clone()),
            model: overrides
                .model
                .clone()
                .unwrap_or_else(|| defaults.model.clone()),
            api_key_secret: overrides
                .api_key_secret
                .clone()
                .unwrap_or_else(|| defaults.api_key_secret.clone()),
            request_timeout: defaults.request_timeout,
            max_output_tokens: overrides
                .max_output_tokens
                .unwrap_or(defaults.max_output_tokens),
        };
        let api_key = self
            .secrets
            .get(self.identity.as_str(), &config.api_key_secret);
        if api_key.is_none() {
            tracing::warn!(
                "model_api_key_missing: identity={}, secret={}",
                self.identity,
                config.api_key_secret
            );
        }
        HttpModelClient::new(&config, api_key)
    }

    async fn check_model_health(&self, model: &Arc<dyn ModelClient>, audit: &Arc<dyn AuditSink>) {
        let started = tokio::time::Instant::now();
        let healthy = model.health_check().await;
        if !healthy {
            tracing::warn!("model_unhealthy: identity={}", self.identity);
        }
        audit
            .log(
                AuditRecord::new(MODEL_HEALTH_CHECK, AUDIT_CATEGORY)
                    .success(healthy)
                    .duration(started.elapsed())
                    .field("identity", self.identity.as_str()),
            )
            .await;
    }

    async fn load_plugin(
        &self,
        name: &str,
        identity: &IdentityConfig,
        parts: &ContextParts,
    ) -> Result<ActivePlugin> {
        let plugin_name = PluginName::from_string(name.to_string()).map_err(Error::validation)?;
        let plugin = self
            .registry
            .create(name, identity)
            .map_err(|e| Error::plugin_setup(name, e))?;
        let ctx = parts
            .context_for(plugin_name)
            .await
            .map_err(|e| Error::plugin_setup(name, e))?;
        with_recovery_async(plugin.setup(&ctx), &format!("{}.setup", name))
            .await
            .map_err(|e| match e {
                Error::PluginSetup { .. } => e,
                other => Error::plugin_setup(name, other),
            })?;
        Ok(ActivePlugin { plugin, ctx })
    }

    // =========================================================================
    // Run
    // =========================================================================

    /// Set up, then drive every active plugin until stopped.
    ///
    /// Returns `Ok(())` on clean shutdown. Setup failures are returned after
    /// the partial setup has been torn down.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.setup().await {
            tracing::error!("orchestrator_setup_failed: identity={}, error={}", self.identity, e);
            self.stop().await;
            return Err(e);
        }

        if let Err(e) = self.lifecycle.transition(LifecycleState::Running) {
            if self.lifecycle.current().is_shutting_down() {
                // stop() raced setup; it owns the teardown.
                self.lifecycle
                    .wait_for(|s| s == LifecycleState::Stopped)
                    .await;
                return Ok(());
            }
            self.stop().await;
            return Err(e);
        }

        let signals_done = CancellationToken::new();
        if self.handle_signals {
            let this = self.clone();
            let done = signals_done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown_signal() => {
                        tracing::info!("shutdown_signal_received: identity={}", this.identity);
                        this.stop().await;
                    }
                    _ = done.cancelled() => {}
                }
            });
        }

        let result = self.register_ticks().await;
        let result = match result {
            Ok(()) => {
                tracing::info!("orchestrator_running: identity={}", self.identity);
                self.scheduler.start().await
            }
            Err(e) => Err(e),
        };

        self.stop().await;
        signals_done.cancel();
        result
    }

    async fn register_ticks(&self) -> Result<()> {
        let poll_interval = self
            .runtime
            .get()
            .map(|r| r.identity.poll_interval)
            .unwrap_or(Duration::from_secs(300));
        let active = self.active.lock().await;
        for entry in active.iter() {
            let plugin = entry.plugin.clone();
            let ctx = entry.ctx.clone();
            let task_name = format!("{}:{}", self.identity, ctx.plugin_name());
            self.scheduler.add(
                task_name,
                task_fn(move || {
                    let plugin = plugin.clone();
                    let ctx = ctx.clone();
                    async move {
                        if plugin.is_disruptive() && ctx.is_quiet_hours() {
                            tracing::debug!(
                                "tick_skipped_quiet_hours: identity={}, plugin={}",
                                ctx.identity_name(),
                                ctx.plugin_name()
                            );
                            return Ok(());
                        }
                        plugin.tick(&ctx).await
                    }
                }),
                poll_interval,
                true,
            )?;
        }
        Ok(())
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Ordered, failure-tolerant shutdown. Safe to call concurrently and
    /// repeatedly; returns once the orchestrator is STOPPED.
    pub async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            tracing::debug!("orchestrator_already_stopping: identity={}", self.identity);
            self.lifecycle
                .wait_for(|s| s == LifecycleState::Stopped)
                .await;
            return;
        }
        tracing::info!("orchestrator_stopping: identity={}", self.identity);

        self.shutdown.cancel();
        self.scheduler.stop().await;

        let plugins: Vec<ActivePlugin> = std::mem::take(&mut *self.active.lock().await);
        for entry in plugins.iter().rev() {
            self.teardown_plugin(entry).await;
        }

        if let Some(runtime) = self.runtime.get() {
            // Detached ticks may still be inside a model call.
            runtime
                .pipeline
                .drain(self.config.scheduler.drain_timeout)
                .await;
            runtime.model.close().await;
            runtime.audit.flush().await;
            runtime.audit.close().await;
        }
        self.bus.clear().await;

        if let Err(e) = self.lifecycle.transition(LifecycleState::Stopped) {
            tracing::error!("orchestrator_stop_transition_failed: {}", e);
        }
        tracing::info!("orchestrator_stopped: identity={}", self.identity);
    }

    async fn teardown_plugin(&self, entry: &ActivePlugin) {
        let name = entry.ctx.plugin_name().to_string();
        let timeout = self.config.scheduler.teardown_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            with_recovery_async(entry.plugin.teardown(&entry.ctx), &format!("{}.teardown", name)),
        )
        .await
        .unwrap_or_else(|_| Err(Error::timeout(format!("teardown exceeded {:?}", timeout))));

        if let Err(e) = outcome {
            let err = Error::plugin_teardown(&name, e);
            tracing::error!("plugin_teardown_failed: identity={}, {}", self.identity, err);
            if let Some(runtime) = self.runtime.get() {
                runtime
                    .audit
                    .log(
                        AuditRecord::new(PLUGIN_TEARDOWN_FAILED, AUDIT_CATEGORY)
                            .success(false)
                            .field("identity", self.identity.as_str())
                            .field("plugin", name.as_str())
                            .field("error", err.to_string()),
                    )
                    .await;
            }
        } else {
            tracing::debug!("plugin_torn_down: identity={}, plugin={}", self.identity, name);
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Names of plugins that passed setup, in registration order.
    pub async fn active_plugins(&self) -> Vec<String> {
        self.active
            .lock()
            .await
            .iter()
            .map(|p| p.ctx.plugin_name().to_string())
            .collect()
    }

    pub async fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            identity: self.identity.to_string(),
            state: self.lifecycle.current(),
            active_plugins: self.active_plugins().await,
            tasks: self.scheduler.stats(),
            bus: self.bus.get_stats().await,
        }
    }

    /// Directory holding this identity's audit trail and logs.
    pub fn log_dir(&self) -> PathBuf {
        self.config.paths.log_root.join(self.identity.as_str())
    }
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("signal_handler_failed: signal=SIGINT, error={}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("signal_handler_failed: signal=SIGTERM, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentityLoader;
    use crate::pipeline::model::MockModelClient;
    use crate::pipeline::MemoryAuditSink;
    use crate::types::SchedulerConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Counters {
        setups: AtomicUsize,
        ticks: AtomicUsize,
        teardowns: AtomicUsize,
    }

    struct RecordingPlugin {
        name: String,
        counters: Arc<Counters>,
        fail_setup: bool,
        fail_teardown: bool,
        disruptive: bool,
        order: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            &self.name
        }
        fn is_disruptive(&self) -> bool {
            self.disruptive
        }
        async fn setup(&self, _ctx: &PluginContext) -> Result<()> {
            self.counters.setups.fetch_add(1, Ordering::SeqCst);
            if self.fail_setup {
                return Err(Error::internal("credentials rejected"));
            }
            Ok(())
        }
        async fn tick(&self, _ctx: &PluginContext) -> Result<()> {
            self.counters.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn teardown(&self, _ctx: &PluginContext) -> Result<()> {
            self.counters.teardowns.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.name.clone());
            if self.fail_teardown {
                return Err(Error::internal("socket already closed"));
            }
            Ok(())
        }
    }

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        audit: Arc<MemoryAuditSink>,
        by_plugin: std::collections::HashMap<String, Arc<Counters>>,
        order: Arc<std::sync::Mutex<Vec<String>>>,
        _tmp: TempDir,
    }

    #[derive(Clone, Copy, Default)]
    struct Behavior {
        fail_setup: bool,
        fail_teardown: bool,
        disruptive: bool,
    }

    fn fixture(plugins: &[(&str, Behavior)], quiet: bool) -> Fixture {
        fixture_with(plugins, &[], quiet)
    }

    /// `unregistered` names are listed in the identity but absent from the registry.
    fn fixture_with(plugins: &[(&str, Behavior)], unregistered: &[&str], quiet: bool) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.data_root = tmp.path().join("data");
        config.paths.log_root = tmp.path().join("logs");
        config.scheduler = SchedulerConfig {
            stop_timeout: Duration::from_secs(1),
            tick_timeout: Duration::from_secs(5),
            teardown_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(1),
        };

        let registry = Arc::new(PluginRegistry::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut by_plugin = std::collections::HashMap::new();
        for (name, behavior) in plugins {
            let counters = Arc::new(Counters::default());
            by_plugin.insert(name.to_string(), counters.clone());
            let name = name.to_string();
            let behavior = *behavior;
            let order = order.clone();
            registry.register(name.clone(), move |_| {
                Ok(Arc::new(RecordingPlugin {
                    name: name.clone(),
                    counters: counters.clone(),
                    fail_setup: behavior.fail_setup,
                    fail_teardown: behavior.fail_teardown,
                    disruptive: behavior.disruptive,
                    order: order.clone(),
                }) as Arc<dyn Plugin>)
            });
        }

        let mut identity = IdentityConfig::new(
            "coral",
            plugins
                .iter()
                .map(|(n, _)| n.to_string())
                .chain(unregistered.iter().map(|n| n.to_string()))
                .collect(),
        );
        identity.poll_interval = Duration::from_secs(1);

        let mut model = MockModelClient::new();
        model.expect_health_check().returning(|| true);
        model.expect_close().times(1).returning(|| ());

        let audit = Arc::new(MemoryAuditSink::new());
        let orchestrator = Orchestrator::builder("coral", config)
            .identity_loader(Arc::new(StaticIdentityLoader::new(vec![identity])))
            .registry(registry)
            .model_client(Arc::new(model))
            .audit_sink(audit.clone())
            .quiet_hours(Arc::new(if quiet {
                QuietHoursWindow::new(0, 24)
            } else {
                QuietHoursWindow::disabled()
            }))
            .handle_signals(false)
            .build()
            .unwrap();

        Fixture {
            orchestrator,
            audit,
            by_plugin,
            order,
            _tmp: tmp,
        }
    }

    #[tokio::test]
    async fn test_failed_plugin_is_skipped_and_audited() {
        let f = fixture(
            &[
                ("a", Behavior { fail_setup: true, ..Behavior::default() }),
                ("b", Behavior::default()),
            ],
            false,
        );
        f.orchestrator.setup().await.unwrap();

        assert_eq!(f.orchestrator.active_plugins().await, vec!["b".to_string()]);
        let failures = f.audit.events(PLUGIN_LOAD_FAILED);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].field_str("plugin"), Some("a"));
        assert!(failures[0].field_str("error").unwrap().contains("credentials rejected"));

        f.orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_plugin_counts_as_load_failure() {
        let f = fixture_with(&[("b", Behavior::default())], &["ghost"], false);
        f.orchestrator.setup().await.unwrap();

        assert_eq!(f.orchestrator.active_plugins().await, vec!["b".to_string()]);
        let failures = f.audit.events(PLUGIN_LOAD_FAILED);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].field_str("plugin"), Some("ghost"));
        assert!(failures[0].field_str("error").unwrap().contains("not registered"));
        f.orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_zero_plugins_is_fatal_and_never_runs() {
        let f = fixture(&[("a", Behavior { fail_setup: true, ..Behavior::default() })], false);
        let err = f.orchestrator.run().await.unwrap_err();

        assert!(matches!(err, Error::NoActivePlugins(_)));
        assert!(err.is_fatal());
        assert_eq!(f.orchestrator.state(), LifecycleState::Stopped);
        assert_eq!(f.by_plugin["a"].ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_twice_tears_down_once_in_reverse_order() {
        let f = fixture(
            &[
                ("first", Behavior::default()),
                ("second", Behavior { fail_teardown: true, ..Behavior::default() }),
                ("third", Behavior::default()),
            ],
            false,
        );
        f.orchestrator.setup().await.unwrap();

        tokio::join!(f.orchestrator.stop(), f.orchestrator.stop());
        f.orchestrator.stop().await;

        assert_eq!(f.orchestrator.state(), LifecycleState::Stopped);
        assert_eq!(
            *f.order.lock().unwrap(),
            vec!["third".to_string(), "second".to_string(), "first".to_string()]
        );
        for counters in f.by_plugin.values() {
            assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
        }
        assert_eq!(f.audit.events(PLUGIN_TEARDOWN_FAILED).len(), 1);
        assert!(f.audit.is_closed());
        assert!(f.audit.flush_count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_stopped() {
        let f = fixture(
            &[
                ("a", Behavior::default()),
                ("loud", Behavior { disruptive: true, ..Behavior::default() }),
            ],
            false,
        );
        let runner = {
            let orchestrator = f.orchestrator.clone();
            tokio::spawn(async move { orchestrator.run().await })
        };

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(f.orchestrator.state(), LifecycleState::Running);
        let status = f.orchestrator.status().await;
        assert_eq!(status.tasks.len(), 2);
        assert!(status.tasks.iter().any(|t| t.name == "coral:a"));

        f.orchestrator.stop().await;
        runner.await.unwrap().unwrap();

        let ticks = f.by_plugin["a"].ticks.load(Ordering::SeqCst);
        assert!((3..=5).contains(&ticks), "ticked {} times", ticks);
        // Disruptive, but outside quiet hours.
        assert!(f.by_plugin["loud"].ticks.load(Ordering::SeqCst) >= 3);
        assert_eq!(f.orchestrator.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disruptive_plugins_skip_quiet_hours() {
        let f = fixture(
            &[("calm", Behavior::default()), ("loud", Behavior { disruptive: true, ..Behavior::default() })],
            true,
        );
        let runner = {
            let orchestrator = f.orchestrator.clone();
            tokio::spawn(async move { orchestrator.run().await })
        };
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        f.orchestrator.stop().await;
        runner.await.unwrap().unwrap();

        assert!(f.by_plugin["calm"].ticks.load(Ordering::SeqCst) >= 2);
        assert_eq!(f.by_plugin["loud"].ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_model_health_is_audited() {
        let f = fixture(&[("a", Behavior::default())], false);
        f.orchestrator.setup().await.unwrap();
        let checks = f.audit.events(MODEL_HEALTH_CHECK);
        assert_eq!(checks.len(), 1);
        assert!(checks[0].success);
        f.orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_setup_twice_is_rejected() {
        let f = fixture(&[("a", Behavior::default())], false);
        f.orchestrator.setup().await.unwrap();
        assert!(matches!(
            f.orchestrator.setup().await,
            Err(Error::StateTransition(_))
        ));
        f.orchestrator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_in_flight_invocation_before_closing_audit() {
        use crate::pipeline::{
            ChatMessage, ChatOptions, ChatRequest, ModelError, ModelResponse, AUDIT_EVENT,
        };
        use std::sync::atomic::AtomicBool;

        /// Answers after three seconds; remembers whether it was closed mid-call.
        #[derive(Default)]
        struct Slow {
            closed: AtomicBool,
            closed_mid_call: AtomicBool,
        }

        #[async_trait]
        impl ModelClient for Slow {
            async fn chat(
                &self,
                _: &[ChatMessage],
                _: &ChatOptions,
            ) -> std::result::Result<ModelResponse, ModelError> {
                tokio::time::sleep(Duration::from_secs(3)).await;
                if self.closed.load(Ordering::SeqCst) {
                    self.closed_mid_call.store(true, Ordering::SeqCst);
                }
                Ok(ModelResponse {
                    content: "low tide".into(),
                    model: "slow".into(),
                    usage: None,
                })
            }
            async fn health_check(&self) -> bool {
                true
            }
            async fn close(&self) {
                self.closed.store(true, Ordering::SeqCst);
            }
        }

        struct Asker;

        #[async_trait]
        impl Plugin for Asker {
            fn name(&self) -> &str {
                "asker"
            }
            async fn setup(&self, _ctx: &PluginContext) -> Result<()> {
                Ok(())
            }
            async fn tick(&self, ctx: &PluginContext) -> Result<()> {
                ctx.chat(ChatRequest::new("coral", "reply", vec![ChatMessage::user("hi")]))
                    .await;
                Ok(())
            }
        }

        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.data_root = tmp.path().join("data");
        config.paths.log_root = tmp.path().join("logs");
        config.scheduler = SchedulerConfig {
            stop_timeout: Duration::from_secs(1),
            tick_timeout: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(10),
        };
        let registry = Arc::new(PluginRegistry::new());
        registry.register("asker", |_| Ok(Arc::new(Asker) as Arc<dyn Plugin>));
        let model = Arc::new(Slow::default());
        let audit = Arc::new(MemoryAuditSink::new());
        let orchestrator = Orchestrator::builder("coral", config)
            .identity_loader(Arc::new(StaticIdentityLoader::new(vec![IdentityConfig::new(
                "coral",
                vec!["asker".into()],
            )])))
            .registry(registry)
            .model_client(model.clone())
            .audit_sink(audit.clone())
            .quiet_hours(Arc::new(QuietHoursWindow::disabled()))
            .handle_signals(false)
            .build()
            .unwrap();

        let runner = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(audit.events(AUDIT_EVENT).is_empty());

        orchestrator.stop().await;
        runner.await.unwrap().unwrap();

        let invocations = audit.events(AUDIT_EVENT);
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].success);
        assert!(!model.closed_mid_call.load(Ordering::SeqCst));
        assert!(model.closed.load(Ordering::SeqCst));
        assert!(audit.is_closed());
    }
}
