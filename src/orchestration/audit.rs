//! Durable record of coordinator decisions.
//!
//! `AuditSink` is fire-and-forget: `record` spawns the write and returns
//! immediately, so scheduling and scaling never wait on persistence. Failed
//! writes are logged and surfaced on a diagnostics channel instead of being
//! dropped.

use crate::error::{Error, Result};
use crate::{hlog_debug, hlog_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub kind: String,
    pub summary: String,
    pub details: serde_json::Value,
    pub tags: Vec<String>,
    pub tenant: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(kind: &str, summary: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            summary: summary.into(),
            details,
            tags: Vec::new(),
            tenant: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Long-term storage for audit records.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn log_event(&self, record: &AuditRecord) -> Result<()>;
}

/// Append-only JSON lines file.
pub struct JsonlAuditLog {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back, skipping lines that do not parse.
    pub async fn read_all(&self) -> Result<Vec<AuditRecord>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn log_event(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        // Whole-line appends from concurrent writers must not interleave.
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-process log, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
    fail: AtomicBool,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn records_of_kind(&self, kind: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn log_event(&self, record: &AuditRecord) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Persistence("memory store unavailable".to_string()));
        }
        self.records
            .lock()
            .map_err(|_| Error::Persistence("memory store poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }
}

/// A write that did not make it to the audit log.
#[derive(Debug, Clone)]
pub struct AuditFailure {
    pub kind: String,
    pub summary: String,
    pub error: String,
}

/// Non-blocking front end to an `AuditLog`.
#[derive(Clone)]
pub struct AuditSink {
    log: Arc<dyn AuditLog>,
    pending: Arc<Mutex<JoinSet<()>>>,
    diag_tx: Sender<AuditFailure>,
    diag_rx: Receiver<AuditFailure>,
}

impl AuditSink {
    pub fn new(log: Arc<dyn AuditLog>) -> Self {
        let (diag_tx, diag_rx) = crossbeam_channel::unbounded();
        Self {
            log,
            pending: Arc::new(Mutex::new(JoinSet::new())),
            diag_tx,
            diag_rx,
        }
    }

    /// Persist `record` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn record(&self, record: AuditRecord) {
        hlog_debug!("audit {} {}", record.kind, record.summary);
        let log = Arc::clone(&self.log);
        let diag_tx = self.diag_tx.clone();
        let write = async move {
            if let Err(e) = log.log_event(&record).await {
                hlog_error!("Audit write failed for {}: {}", record.kind, e);
                let _ = diag_tx.send(AuditFailure {
                    kind: record.kind,
                    summary: record.summary,
                    error: e.to_string(),
                });
            }
        };

        match self.pending.lock() {
            Ok(mut pending) => {
                // Reap finished writes so the set does not grow without bound.
                while pending.try_join_next().is_some() {}
                pending.spawn(write);
            }
            Err(_) => {
                tokio::spawn(write);
            }
        }
    }

    /// Wait for every write issued so far.
    pub async fn flush(&self) {
        loop {
            let next = match self.pending.lock() {
                Ok(mut pending) => pending.try_join_next(),
                Err(_) => return,
            };
            match next {
                Some(_) => continue,
                None => {
                    let empty = self.pending.lock().map(|p| p.is_empty()).unwrap_or(true);
                    if empty {
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
            }
        }
    }

    /// Receiver for failed writes. Clones share one queue.
    pub fn diagnostics(&self) -> Receiver<AuditFailure> {
        self.diag_rx.clone()
    }
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink")
            .field("failures_queued", &self.diag_rx.len())
            .finish()
    }
}
