//! # Persona Kernel - Agent Runtime
//!
//! Runs one autonomous identity ("persona") built from pluggable behavior
//! modules. The kernel provides:
//! - Process lifecycle with an explicit state machine
//! - A cooperative interval scheduler that drives plugin ticks
//! - An in-process event bus for fire-and-forget notifications
//! - The plugin contract and the capability context handed to plugins
//! - The safe invocation pipeline every model call must pass through
//! - Token-bucket admission control
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────────────────────────────┐
//!   run <identity> →  │             Orchestrator             │
//!                     │  ┌───────────┐      ┌─────────────┐  │
//!                     │  │ Lifecycle │      │  Scheduler  │──┼──→ plugin.tick(ctx)
//!                     │  └───────────┘      └─────────────┘  │
//!                     │  ┌───────────┐      ┌─────────────┐  │
//!                     │  │ Event Bus │      │  Pipeline   │──┼──→ model
//!                     │  └───────────┘      └─────────────┘  │
//!                     └──────────────────────────────────────┘
//! ```
//!
//! Plugins never hold a model client: their context exposes the model only
//! through [`pipeline::SafeInvocationPipeline`].

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod bus;
pub mod identity;
pub mod kernel;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod types;

// Internal utilities
pub mod observability;
pub mod validation;

pub use kernel::{Orchestrator, OrchestratorBuilder};
pub use types::{Config, Error, Result};
