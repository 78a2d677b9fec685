//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Failures that the kernel contains at a
//! boundary (a plugin, a task, an event handler) are still expressed with these
//! variants; they are logged there instead of being propagated.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the persona kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors (bad identity file, bad config values).
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (unknown identity, unknown plugin).
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    /// Invalid lifecycle transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// A plugin's setup failed. Recovered by the orchestrator.
    #[error("plugin '{plugin}' setup failed: {reason}")]
    PluginSetup { plugin: String, reason: String },

    /// A plugin's teardown failed. Logged, never propagated.
    #[error("plugin '{plugin}' teardown failed: {reason}")]
    PluginTeardown { plugin: String, reason: String },

    /// A scheduled task returned an error or panicked.
    #[error("task '{task}' failed: {reason}")]
    TaskExecution { task: String, reason: String },

    /// Setup finished with nothing to run. The only fatal kernel error.
    #[error("no plugins active for identity '{0}'")]
    NoActivePlugins(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// JSON serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse errors (identity and kernel config files).
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn plugin_setup(plugin: impl Into<String>, reason: impl ToString) -> Self {
        Self::PluginSetup {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    pub fn plugin_teardown(plugin: impl Into<String>, reason: impl ToString) -> Self {
        Self::PluginTeardown {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    pub fn task_execution(task: impl Into<String>, reason: impl ToString) -> Self {
        Self::TaskExecution {
            task: task.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NoActivePlugins(_) | Error::Config(_))
    }
}
