//! Sync engine: job registry, source/destination evaluation, write dispatch and the
//! slot-driven scheduler.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sheetsync_core::{parse_schedule, Job, JobKind, SlotParseError};
use sheetsync_fetch::{default_strategies, FetchConfig, FetchError, Route};
use thiserror::Error;
use tracing::warn;

pub mod clock;
pub mod evaluator;
pub mod log;
pub mod scheduler;
pub mod state;
pub mod writer;

pub use clock::{Clock, LocalClock, ManualClock};
pub use evaluator::{Decision, Evaluator, FeedSource};
pub use log::ExecutionLog;
pub use scheduler::{due_slots, ExecutionRecord, JobRunner, SlotBook, SyncEngine, DEFAULT_SLOT_HISTORY};
pub use state::{JobStatus, SchedulerState};
pub use writer::{RowWriter, SimulatedWriter, WebhookWriter, WriteAck, WriteError};

pub const CRATE_NAME: &str = "sheetsync-sync";

pub const DEFAULT_TICK_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("source feed returned no data rows ({url})")]
    EmptySourceData { url: String },
    #[error("key column `{column}` is missing or empty in the latest source row; columns present: [{}]", .available.join(", "))]
    MissingKeyColumn { column: String, available: Vec<String> },
    #[error("write failed: {0}")]
    Write(#[from] WriteError),
    #[error("run-all is disabled while automatic mode is on")]
    RunAllDisallowed,
    #[error("unknown job `{0}`")]
    UnknownJob(String),
    #[error("job `{0}` is already running")]
    AlreadyRunning(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing job registry: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate job id `{0}`")]
    DuplicateJobId(String),
    #[error("job `{job_id}`: `{field}` must not be empty")]
    EmptyField { job_id: String, field: &'static str },
    #[error("job `{job_id}`: {source}")]
    InvalidSchedule {
        job_id: String,
        source: SlotParseError,
    },
}

/// YAML job registry, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRegistry {
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: JobKind,
    pub source_url: String,
    pub destination_url: String,
    pub key_column: String,
    /// `"HH:MM"` or `"HH:MM & HH:MM"`; omitted for manual-only jobs.
    #[serde(default)]
    pub schedule: Option<String>,
}

impl JobRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Validate every entry and produce the immutable job list.
    pub fn into_jobs(self) -> Result<Vec<Job>, ConfigError> {
        let mut seen = HashSet::new();
        let mut jobs = Vec::with_capacity(self.jobs.len());
        for cfg in self.jobs {
            if cfg.id.trim().is_empty() {
                return Err(ConfigError::EmptyField {
                    job_id: cfg.name,
                    field: "id",
                });
            }
            if !seen.insert(cfg.id.clone()) {
                return Err(ConfigError::DuplicateJobId(cfg.id));
            }
            for (field, value) in [
                ("source_url", &cfg.source_url),
                ("destination_url", &cfg.destination_url),
                ("key_column", &cfg.key_column),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::EmptyField {
                        job_id: cfg.id,
                        field,
                    });
                }
            }
            let slots = match parse_schedule(cfg.schedule.as_deref().unwrap_or_default()) {
                Ok(slots) => slots,
                Err(source) => {
                    return Err(ConfigError::InvalidSchedule {
                        job_id: cfg.id,
                        source,
                    })
                }
            };
            jobs.push(Job {
                id: cfg.id,
                name: cfg.name,
                description: cfg.description,
                kind: cfg.kind,
                source_url: cfg.source_url,
                destination_url: cfg.destination_url,
                key_column: cfg.key_column,
                slots,
            });
        }
        Ok(jobs)
    }
}

/// Load and validate the registry at `path`.
pub fn load_jobs(path: impl AsRef<Path>) -> Result<Vec<Job>, ConfigError> {
    JobRegistry::load(path)?.into_jobs()
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub jobs_file: PathBuf,
    pub auto_mode: bool,
    pub tick_interval: Duration,
    pub write_delay: Duration,
    pub write_webhook: Option<String>,
    pub user_agent: String,
    pub slot_history: usize,
    pub web_port: u16,
    pub fetch: FetchConfig,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let tick_secs = match parse_u64("SHEETSYNC_TICK_SECS") {
            Some(secs) if (1..60).contains(&secs) => secs,
            Some(secs) => {
                warn!(secs, "tick interval must be under one minute; using default");
                DEFAULT_TICK_SECS
            }
            None => DEFAULT_TICK_SECS,
        };

        let user_agent = lookup("SHEETSYNC_USER_AGENT").unwrap_or_else(|| "sheetsync/0.1".to_string());

        let mut strategies = default_strategies();
        for (index, key) in [
            "SHEETSYNC_RELAY_PRIMARY",
            "SHEETSYNC_RELAY_ENVELOPE",
            "SHEETSYNC_RELAY_FALLBACK",
        ]
        .into_iter()
        .enumerate()
        {
            if let (Some(base), Some(Route::Relay { base_url, .. })) =
                (lookup(key), strategies.get_mut(index).map(|s| &mut s.route))
            {
                *base_url = base;
            }
        }

        Self {
            jobs_file: lookup("SHEETSYNC_JOBS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("jobs.yaml")),
            auto_mode: lookup("SHEETSYNC_AUTO_MODE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            tick_interval: Duration::from_secs(tick_secs),
            write_delay: Duration::from_millis(parse_u64("SHEETSYNC_WRITE_DELAY_MS").unwrap_or(1500)),
            write_webhook: lookup("SHEETSYNC_WRITE_WEBHOOK").filter(|v| !v.trim().is_empty()),
            slot_history: parse_u64("SHEETSYNC_SLOT_HISTORY")
                .map(|n| n.max(1) as usize)
                .unwrap_or(DEFAULT_SLOT_HISTORY),
            web_port: lookup("SHEETSYNC_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            fetch: FetchConfig {
                user_agent: Some(user_agent.clone()),
                strategies,
            },
            user_agent,
        }
    }
}
