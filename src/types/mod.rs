//! Core types for the persona kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (IdentityName, PluginName, InvocationId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Kernel configuration (paths, scheduler, model, limits)

mod config;
mod errors;
mod ids;

pub use config::{
    Config, ModelConfig, ObservabilityConfig, PathsConfig, SanitizerConfig, SchedulerConfig,
};
pub use errors::{Error, Result};
pub use ids::{IdentityName, InvocationId, PluginName};
