//! Asks the model for a short journal entry and appends it to a file.
//!
//! Disruptive: skipped during quiet hours. Blocked invocations are not errors;
//! the tick just writes nothing.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

use crate::identity::IdentityConfig;
use crate::pipeline::{ChatMessage, ChatOptions, ChatRequest, GateResult};
use crate::plugin::{Plugin, PluginContext};
use crate::types::{Error, Result};

pub const NAME: &str = "journal";
pub const FILE_NAME: &str = "journal.jsonl";
pub const EVENT_WRITTEN: &str = "journal_entry_written";
pub const INTENT: &str = "journal_entry";

/// `plugin_settings.journal` in the identity file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalSettings {
    pub prompt: String,
    pub max_tokens: u32,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            prompt: "Write a two-sentence journal entry about your day.".to_string(),
            max_tokens: 200,
        }
    }
}

/// One line of the journal file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub written_at: chrono::DateTime<Utc>,
    pub invocation_id: String,
    pub text: String,
}

#[derive(Debug)]
pub struct JournalPlugin {
    settings: JournalSettings,
    path: Mutex<Option<PathBuf>>,
}

impl JournalPlugin {
    pub fn new(settings: JournalSettings) -> Self {
        Self {
            settings,
            path: Mutex::new(None),
        }
    }

    pub fn from_identity(identity: &IdentityConfig) -> Result<Self> {
        let settings = match identity.plugin_settings(NAME) {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                Error::validation(format!("plugin_settings.{}: {}", NAME, e))
            })?,
            None => JournalSettings::default(),
        };
        Ok(Self::new(settings))
    }

    fn path(&self) -> Result<PathBuf> {
        self.path
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::internal("journal used before setup"))
    }

    async fn append(&self, entry: &JournalEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path()?)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Plugin for JournalPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn is_disruptive(&self) -> bool {
        true
    }

    async fn setup(&self, ctx: &PluginContext) -> Result<()> {
        let path = ctx.data_dir().join(FILE_NAME);
        // Fail setup now rather than on the first tick if the file is unwritable.
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::plugin_setup(NAME, format!("{}: {}", path.display(), e)))?;
        *self
            .path
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(path);
        Ok(())
    }

    async fn tick(&self, ctx: &PluginContext) -> Result<()> {
        let identity = ctx.identity_name().as_str();
        let request = ChatRequest::new(
            identity,
            INTENT,
            vec![
                ChatMessage::system(format!("You are {}. Keep it short.", identity)),
                ChatMessage::user(self.settings.prompt.clone()),
            ],
        )
        .with_metadata("plugin", NAME)
        .with_options(ChatOptions {
            max_tokens: Some(self.settings.max_tokens),
            ..ChatOptions::default()
        });

        match ctx.chat(request).await {
            GateResult::Allowed {
                invocation_id,
                response,
            } => {
                let entry = JournalEntry {
                    written_at: Utc::now(),
                    invocation_id: invocation_id.to_string(),
                    text: response.content,
                };
                self.append(&entry).await?;
                ctx.bus()
                    .emit(
                        EVENT_WRITTEN,
                        json!({ "identity": identity, "invocation_id": entry.invocation_id }),
                    )
                    .await;
                Ok(())
            }
            GateResult::Blocked { reason, .. } => {
                tracing::info!("journal_entry_skipped: identity={}, reason={}", identity, reason);
                Ok(())
            }
        }
    }
}
