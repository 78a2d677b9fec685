//! Plugins shipped with the kernel.

pub mod heartbeat;
pub mod journal;

pub use heartbeat::HeartbeatPlugin;
pub use journal::JournalPlugin;

use std::sync::Arc;

use crate::plugin::{Plugin, PluginRegistry};

/// Register every built-in plugin under its canonical name.
pub fn register_builtins(registry: &PluginRegistry) {
    registry.register(heartbeat::NAME, |_| {
        Ok(Arc::new(HeartbeatPlugin::new()) as Arc<dyn Plugin>)
    });
    registry.register(journal::NAME, |identity| {
        Ok(Arc::new(JournalPlugin::from_identity(identity)?) as Arc<dyn Plugin>)
    });
}
