use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sheetsync_core::{JobRunState, ScheduleSlot};

use crate::log::ExecutionLog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub state: JobRunState,
    /// Completion time of the most recent run (success, skip or error).
    pub last_run: Option<DateTime<Utc>>,
}

/// Per-job run status, the execution log and the last observed tick.
#[derive(Debug, Default)]
pub struct SchedulerState {
    jobs: RwLock<HashMap<String, JobStatus>>,
    last_tick: RwLock<Option<ScheduleSlot>>,
    log: ExecutionLog,
}

impl SchedulerState {
    pub fn new(log: ExecutionLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn log(&self) -> &ExecutionLog {
        &self.log
    }

    pub fn status(&self, job_id: &str) -> JobStatus {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
            .unwrap_or(JobStatus {
                state: JobRunState::Idle,
                last_run: None,
            })
    }

    pub fn run_state(&self, job_id: &str) -> JobRunState {
        self.status(job_id).state
    }

    /// Move a job into an in-progress state; `last_run` is left alone.
    pub fn set_state(&self, job_id: &str, state: JobRunState) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.entry(job_id.to_string())
            .or_insert(JobStatus {
                state,
                last_run: None,
            })
            .state = state;
    }

    /// Move a job to `Checking` unless it is already checking or syncing.
    pub fn try_begin(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let status = jobs.entry(job_id.to_string()).or_insert(JobStatus {
            state: JobRunState::Idle,
            last_run: None,
        });
        if status.state.is_in_flight() {
            return false;
        }
        status.state = JobRunState::Checking;
        true
    }

    /// Record a run's terminal state and stamp its completion time.
    pub fn finish(&self, job_id: &str, state: JobRunState) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.insert(
            job_id.to_string(),
            JobStatus {
                state,
                last_run: Some(Utc::now()),
            },
        );
    }

    pub fn record_tick(&self, slot: ScheduleSlot) {
        *self.last_tick.write().unwrap_or_else(PoisonError::into_inner) = Some(slot);
    }

    pub fn last_tick(&self) -> Option<ScheduleSlot> {
        *self.last_tick.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_jobs_are_idle() {
        let state = SchedulerState::default();
        assert_eq!(state.run_state("job-a"), JobRunState::Idle);
        assert!(state.status("job-a").last_run.is_none());
    }

    #[test]
    fn terminal_state_persists_until_next_run() {
        let state = SchedulerState::default();
        state.set_state("job-a", JobRunState::Checking);
        assert!(state.status("job-a").last_run.is_none());

        state.finish("job-a", JobRunState::Skipped);
        let first = state.status("job-a");
        assert_eq!(first.state, JobRunState::Skipped);
        assert!(first.last_run.is_some());

        state.set_state("job-a", JobRunState::Checking);
        let running = state.status("job-a");
        assert_eq!(running.state, JobRunState::Checking);
        assert_eq!(running.last_run, first.last_run);
    }

    #[test]
    fn try_begin_refuses_jobs_in_flight() {
        let state = SchedulerState::default();
        assert!(state.try_begin("job-a"));
        assert_eq!(state.run_state("job-a"), JobRunState::Checking);
        assert!(!state.try_begin("job-a"));

        state.set_state("job-a", JobRunState::Syncing);
        assert!(!state.try_begin("job-a"));

        state.finish("job-a", JobRunState::Success);
        assert!(state.try_begin("job-a"));
    }

    #[test]
    fn last_tick_is_tracked() {
        let state = SchedulerState::default();
        assert!(state.last_tick().is_none());
        let slot: ScheduleSlot = "06:00".parse().unwrap();
        state.record_tick(slot);
        assert_eq!(state.last_tick(), Some(slot));
    }
}
