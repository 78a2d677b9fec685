//! Kernel - lifecycle, scheduling and admission control.
//!
//! The `Orchestrator` owns one identity's process: it builds the collaborators
//! in dependency order, loads plugins, drives their ticks through the
//! `Scheduler` and tears everything down in reverse on stop. The other
//! subsystems are plain structs shared behind `Arc`s, not separate actors.

pub mod lifecycle;
pub mod orchestrator;
pub mod rate_limiter;
pub mod recovery;
pub mod scheduler;

pub use lifecycle::{Lifecycle, LifecycleState};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorStatus};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use scheduler::{task_fn, Scheduler, TaskFn, TaskStats};
