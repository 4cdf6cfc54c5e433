//! Append-only execution log shared by every producer in the engine.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

use sheetsync_core::{LogEntry, Severity};
use tracing::{error, info, warn};

/// Newest-first sequence of [`LogEntry`] values. Cloning shares the same log.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    entries: Arc<RwLock<VecDeque<LogEntry>>>,
}

impl ExecutionLog {
    pub fn record(&self, severity: Severity, message: impl Into<String>, job_id: Option<&str>) -> LogEntry {
        let entry = LogEntry::new(severity, message, job_id);
        let job = job_id.unwrap_or("-");
        match severity {
            Severity::Error => error!(job_id = job, "{}", entry.message),
            Severity::Warning => warn!(job_id = job, "{}", entry.message),
            Severity::Info | Severity::Success => info!(job_id = job, ?severity, "{}", entry.message),
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(entry.clone());
        entry
    }

    pub fn info(&self, job_id: Option<&str>, message: impl Into<String>) -> LogEntry {
        self.record(Severity::Info, message, job_id)
    }

    pub fn success(&self, job_id: Option<&str>, message: impl Into<String>) -> LogEntry {
        self.record(Severity::Success, message, job_id)
    }

    pub fn warning(&self, job_id: Option<&str>, message: impl Into<String>) -> LogEntry {
        self.record(Severity::Warning, message, job_id)
    }

    pub fn error(&self, job_id: Option<&str>, message: impl Into<String>) -> LogEntry {
        self.record(Severity::Error, message, job_id)
    }

    /// Up to `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.recent(usize::MAX)
    }

    pub fn for_job(&self, job_id: &str) -> Vec<LogEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.job_id.as_deref() == Some(job_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
