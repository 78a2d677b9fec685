//! Emits a `heartbeat` event on every tick.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::plugin::{Plugin, PluginContext};
use crate::types::Result;

pub const NAME: &str = "heartbeat";
pub const EVENT: &str = "heartbeat";

#[derive(Debug, Default)]
pub struct HeartbeatPlugin {
    beats: AtomicU64,
}

impl HeartbeatPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Plugin for HeartbeatPlugin {
    fn name(&self) -> &str {
        NAME
    }

    async fn setup(&self, ctx: &PluginContext) -> Result<()> {
        tracing::debug!("heartbeat_ready: identity={}", ctx.identity_name());
        Ok(())
    }

    async fn tick(&self, ctx: &PluginContext) -> Result<()> {
        let beat = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        let delivered = ctx
            .bus()
            .emit(
                EVENT,
                json!({
                    "identity": ctx.identity_name().as_str(),
                    "beat": beat,
                    "quiet_hours": ctx.is_quiet_hours(),
                }),
            )
            .await;
        tracing::trace!("heartbeat: beat={}, delivered={}", beat, delivered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler_fn;
    use crate::identity::IdentityConfig;
    use crate::pipeline::model::MockModelClient;
    use crate::plugin::testing::harness;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_tick_emits_numbered_heartbeats() {
        let identity = IdentityConfig::new("coral", vec![NAME.into()]);
        let h = harness(identity, NAME, Arc::new(MockModelClient::new())).await;

        let beats = Arc::new(Mutex::new(Vec::new()));
        {
            let beats = beats.clone();
            h.bus
                .subscribe(
                    EVENT,
                    handler_fn(move |event| {
                        let beats = beats.clone();
                        async move {
                            beats.lock().unwrap().push(event.data["beat"].as_u64().unwrap());
                            Ok(())
                        }
                    }),
                )
                .await;
        }

        let plugin = HeartbeatPlugin::new();
        plugin.setup(&h.ctx).await.unwrap();
        plugin.tick(&h.ctx).await.unwrap();
        plugin.tick(&h.ctx).await.unwrap();

        assert_eq!(*beats.lock().unwrap(), vec![1, 2]);
        assert_eq!(plugin.beats(), 2);
    }
}
