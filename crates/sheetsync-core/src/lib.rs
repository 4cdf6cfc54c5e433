//! Core domain model for SheetSync: jobs, schedule slots, decoded rows and run bookkeeping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sheetsync-core";

/// One decoded record: column name to cell value, in header order.
pub type Row = IndexMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotParseError {
    #[error("schedule slot `{0}` is not in HH:MM form")]
    Format(String),
    #[error("schedule slot `{0}` is outside 00:00..=23:59")]
    OutOfRange(String),
}

/// A time of day (minute precision) at which a job is eligible to auto-fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScheduleSlot {
    hour: u8,
    minute: u8,
}

impl ScheduleSlot {
    pub fn new(hour: u8, minute: u8) -> Result<Self, SlotParseError> {
        if hour > 23 || minute > 59 {
            return Err(SlotParseError::OutOfRange(format!("{hour:02}:{minute:02}")));
        }
        Ok(Self { hour, minute })
    }

    /// The slot containing `at`, i.e. `at` truncated to the minute.
    pub fn containing(at: NaiveDateTime) -> Self {
        Self {
            hour: at.hour() as u8,
            minute: at.minute() as u8,
        }
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn matches(&self, at: NaiveDateTime) -> bool {
        *self == Self::containing(at)
    }
}

impl FromStr for ScheduleSlot {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bytes = trimmed.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return Err(SlotParseError::Format(trimmed.to_string()));
        }
        let (hh, mm) = (&trimmed[..2], &trimmed[3..]);
        if !hh.bytes().chain(mm.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(SlotParseError::Format(trimmed.to_string()));
        }
        let hour: u8 = hh.parse().map_err(|_| SlotParseError::Format(trimmed.to_string()))?;
        let minute: u8 = mm.parse().map_err(|_| SlotParseError::Format(trimmed.to_string()))?;
        Self::new(hour, minute).map_err(|_| SlotParseError::OutOfRange(trimmed.to_string()))
    }
}

impl TryFrom<String> for ScheduleSlot {
    type Error = SlotParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScheduleSlot> for String {
    fn from(slot: ScheduleSlot) -> Self {
        slot.to_string()
    }
}

impl fmt::Display for ScheduleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Parse a schedule expression such as `"14:00 & 06:00"` into its slots.
///
/// Empty expressions yield no slots (manual-only job). Repeated slots are kept once,
/// in first-seen order.
pub fn parse_schedule(expr: &str) -> Result<Vec<ScheduleSlot>, SlotParseError> {
    let mut slots: Vec<ScheduleSlot> = Vec::new();
    for part in expr.split('&').map(str::trim).filter(|p| !p.is_empty()) {
        let slot: ScheduleSlot = part.parse()?;
        if !slots.contains(&slot) {
            slots.push(slot);
        }
    }
    Ok(slots)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    #[default]
    Stock,
    Global,
}

/// Static synchronization unit: where to read, where to compare, and when to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: JobKind,
    pub source_url: String,
    pub destination_url: String,
    /// Column compared between source and destination to detect already-synced data.
    pub key_column: String,
    #[serde(default)]
    pub slots: Vec<ScheduleSlot>,
}

impl Job {
    /// Slots rendered back into the `"HH:MM & HH:MM"` form.
    pub fn schedule_label(&self) -> String {
        self.slots
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" & ")
    }
}

/// Last-known run status of a job. Terminal states persist until the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunState {
    #[default]
    Idle,
    Checking,
    Syncing,
    Success,
    Skipped,
    Error,
}

impl JobRunState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Checking | Self::Syncing)
    }
}

impl fmt::Display for JobRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Automatic,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("manual"),
            Self::Automatic => f.write_str("scheduled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Immutable execution log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub severity: Severity,
    pub job_id: Option<String>,
}

impl LogEntry {
    pub fn new(severity: Severity, message: impl Into<String>, job_id: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            message: message.into(),
            severity,
            job_id: job_id.map(str::to_string),
        }
    }
}
