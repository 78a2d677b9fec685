//! Append-only audit trail.
//!
//! Every model invocation and every plugin load failure produces one
//! `AuditRecord`. Sinks never return errors: a write failure is logged and the
//! record is dropped, so auditing can never take the caller down with it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::types::Result;

/// A single immutable audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub category: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl AuditRecord {
    pub fn new(event: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            category: category.into(),
            success: true,
            duration_ms: 0,
            fields: serde_json::Map::new(),
        }
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Field lookup as a string, for assertions and filters.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append a record. Never fails.
    async fn log(&self, record: AuditRecord);

    async fn flush(&self);

    /// Flush and release resources. Records logged afterwards are dropped.
    async fn close(&self);
}

// =============================================================================
// JSON-lines file sink
// =============================================================================

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<tokio::fs::File>>>,
}

impl JsonlAuditSink {
    /// Open (or create) `path` for appending, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn log(&self, record: AuditRecord) {
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("audit_serialize_failed: event={}, error={}", record.event, e);
                return;
            }
        };
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            tracing::warn!("audit_sink_closed: dropped event={}", record.event);
            return;
        };
        if let Err(e) = writer.write_all(&line).await {
            tracing::error!(
                "audit_write_failed: path={}, event={}, error={}",
                self.path.display(),
                record.event,
                e
            );
        }
    }

    async fn flush(&self) {
        if let Some(writer) = self.writer.lock().await.as_mut() {
            if let Err(e) = writer.flush().await {
                tracing::error!("audit_flush_failed: path={}, error={}", self.path.display(), e);
            }
        }
    }

    async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.flush().await {
                tracing::error!("audit_flush_failed: path={}, error={}", self.path.display(), e);
            }
            if let Err(e) = writer.get_mut().sync_all().await {
                tracing::warn!("audit_sync_failed: path={}, error={}", self.path.display(), e);
            }
        }
    }
}

// =============================================================================
// In-memory sink
// =============================================================================

/// Keeps records in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: StdMutex<Vec<AuditRecord>>,
    flushes: StdMutex<usize>,
    closed: StdMutex<bool>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records with the given event name.
    pub fn events(&self, event: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.event == event)
            .collect()
    }

    pub fn flush_count(&self) -> usize {
        *self.flushes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log(&self, record: AuditRecord) {
        if self.is_closed() {
            return;
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    async fn flush(&self) {
        *self.flushes.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    async fn close(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coral").join("audit.jsonl");

        let sink = JsonlAuditSink::open(&path).await.unwrap();
        sink.log(AuditRecord::new("llm_invocation", "llm").field("caller", "coral"))
            .await;
        sink.log(
            AuditRecord::new("plugin_load_failed", "plugin")
                .success(false)
                .field("plugin", "mailer"),
        )
        .await;
        sink.close().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].field_str("caller"), Some("coral"));
        assert_eq!(lines[1].event, "plugin_load_failed");
        assert!(!lines[1].success);
    }

    #[tokio::test]
    async fn test_jsonl_sink_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");

        for _ in 0..2 {
            let sink = JsonlAuditSink::open(&path).await.unwrap();
            sink.log(AuditRecord::new("e", "c")).await;
            sink.close().await;
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_log_after_close_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::open(&path).await.unwrap();
        sink.close().await;
        sink.log(AuditRecord::new("late", "c")).await;
        sink.flush().await;

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        let memory = MemoryAuditSink::new();
        memory.close().await;
        memory.log(AuditRecord::new("late", "c")).await;
        assert!(memory.records().is_empty());
    }

    #[test]
    fn test_duration_is_recorded_in_millis() {
        let record = AuditRecord::new("e", "c").duration(Duration::from_millis(1_250));
        assert_eq!(record.duration_ms, 1_250);
    }
}
