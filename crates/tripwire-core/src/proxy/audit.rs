//! Append-only audit log of guardrail matches.
//!
//! Relays hand records to an [`AuditSink`]; one writer task appends them to
//! `audit.jsonl`, one JSON object per line. Every record is also emitted as
//! a `tracing` event.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tripwire_guard::{Direction, RuleAction};

use crate::error::Result;

/// Records buffered between relays and the writer.
const AUDIT_CHANNEL_CAPACITY: usize = 1024;

/// One matched rule on one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the message was seen.
    pub timestamp: DateTime<Utc>,
    /// Relay connection the message belongs to.
    pub session_id: String,
    /// Client of the intercepted server.
    pub client: String,
    /// Intercepted server.
    pub server: String,
    /// Which way the message travelled.
    pub direction: Direction,
    /// JSON-RPC id, if the message had one.
    pub message_id: Option<Value>,
    /// JSON-RPC method, if the message had one.
    pub method: Option<String>,
    /// Tool involved, if any.
    pub tool: Option<String>,
    /// Matching rule.
    pub rule_id: String,
    /// What the rule did.
    pub action: RuleAction,
    /// What matched.
    pub detail: String,
}

/// Cloneable handle for submitting records.
#[derive(Debug, Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditSink {
    /// Submits a record. Waits if the writer is behind.
    pub async fn record(&self, record: AuditRecord) {
        match record.action {
            RuleAction::Block => warn!(
                client = %record.client,
                server = %record.server,
                direction = %record.direction,
                rule = %record.rule_id,
                tool = record.tool.as_deref().unwrap_or("-"),
                "guardrail blocked message"
            ),
            RuleAction::Log => info!(
                client = %record.client,
                server = %record.server,
                direction = %record.direction,
                rule = %record.rule_id,
                tool = record.tool.as_deref().unwrap_or("-"),
                "guardrail matched"
            ),
        }
        if self.tx.send(record).await.is_err() {
            warn!("audit writer has stopped; record dropped");
        }
    }
}

/// The audit file and its writer task.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    tx: mpsc::Sender<AuditRecord>,
    writer: JoinHandle<()>,
}

impl AuditLog {
    /// Opens `path` for appending, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let (tx, mut rx) = mpsc::channel::<AuditRecord>(AUDIT_CHANNEL_CAPACITY);
        let log_path = path.display().to_string();
        let writer = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let mut line = match serde_json::to_vec(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "unserializable audit record");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = file.write_all(&line).await {
                    warn!(path = %log_path, error = %e, "audit write failed");
                }
            }
            if let Err(e) = file.flush().await {
                warn!(path = %log_path, error = %e, "audit flush failed");
            }
        });

        Ok(Self {
            path: path.to_path_buf(),
            tx,
            writer,
        })
    }

    /// Location of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A handle for relays.
    pub fn sink(&self) -> AuditSink {
        AuditSink {
            tx: self.tx.clone(),
        }
    }

    /// Waits until every record submitted so far is written.
    ///
    /// Sinks still held elsewhere keep the writer alive; drop them first.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.writer.await {
            warn!(error = %e, "audit writer task failed");
        }
    }
}

/// Reads every record of an audit file.
pub async fn read_audit_log(path: &Path) -> Result<Vec<AuditRecord>> {
    let text = tokio::fs::read_to_string(path).await?;
    let mut records = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(action: RuleAction) -> AuditRecord {
        AuditRecord {
            timestamp: Utc::now(),
            session_id: "s".into(),
            client: "cursor".into(),
            server: "notes".into(),
            direction: Direction::Request,
            message_id: Some(json!(7)),
            method: Some("tools/call".into()),
            tool: Some("save".into()),
            rule_id: "cursor-notes-secrets-default".into(),
            action,
            detail: "aws access key".into(),
        }
    }

    #[tokio::test]
    async fn test_records_are_appended_as_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/audit.jsonl");

        let log = AuditLog::open(&path).await.unwrap();
        let sink = log.sink();
        sink.record(record(RuleAction::Log)).await;
        sink.record(record(RuleAction::Block)).await;
        drop(sink);
        log.close().await;

        let records = read_audit_log(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].action, RuleAction::Block);

        let raw = std::fs::read_to_string(&path).unwrap();
        let first: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first["direction"], "request");
        assert_eq!(first["action"], "log");
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        for _ in 0..2 {
            let log = AuditLog::open(&path).await.unwrap();
            log.sink().record(record(RuleAction::Log)).await;
            log.close().await;
        }
        assert_eq!(read_audit_log(&path).await.unwrap().len(), 2);
    }
}
