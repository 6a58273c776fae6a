//! Completed-interval records and the queries built on top of them.
//!
//! The timer only ever calls `SessionRecorder::record_completed_session`.
//! Everything else here (daily totals, pomodoro counts, retention) is derived
//! from the stored records and serves the IPC layer.

use chrono::{DateTime, Duration, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tomate_ipc::{DailyStats, SessionKind, SessionSummary};

pub type RecordId = u64;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("session must end after it starts (start {start}, end {end})")]
    InvalidDuration {
        start: DateTime<Local>,
        end: DateTime<Local>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session storage unavailable: {0}")]
    Unavailable(String),
}

/// A finished interval as the timer reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub kind: SessionKind,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub linked_task_id: Option<i64>,
}

impl NewSession {
    pub fn duration_seconds(&self) -> f64 {
        seconds_f64(self.end_time - self.start_time)
    }

    fn validate(&self) -> Result<(), RecorderError> {
        if self.end_time <= self.start_time {
            return Err(RecorderError::InvalidDuration {
                start: self.start_time,
                end: self.end_time,
            });
        }
        Ok(())
    }

    pub fn into_record(self, id: RecordId) -> Result<CompletedSession, RecorderError> {
        self.validate()?;
        Ok(CompletedSession {
            id,
            kind: self.kind,
            duration_seconds: self.duration_seconds(),
            start_time: self.start_time,
            end_time: self.end_time,
            linked_task_id: self.linked_task_id,
        })
    }
}

/// Stored record; never updated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedSession {
    pub id: RecordId,
    pub kind: SessionKind,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub duration_seconds: f64,
    pub linked_task_id: Option<i64>,
}

impl From<&CompletedSession> for SessionSummary {
    fn from(session: &CompletedSession) -> Self {
        SessionSummary {
            id: session.id,
            kind: session.kind,
            start_time: session.start_time,
            end_time: session.end_time,
            duration_seconds: session.duration_seconds,
            task_id: session.linked_task_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatistics {
    pub session_count: usize,
    pub total_seconds: f64,
    pub completed_pomodoros: u32,
}

/// Sink the timer writes finished intervals to.
pub trait SessionRecorder: Send + Sync {
    fn record_completed_session(&self, session: &NewSession) -> Result<RecordId, RecorderError>;
}

/// Read side of a session store.
pub trait SessionHistory: SessionRecorder {
    /// All records, oldest first.
    fn sessions(&self) -> Result<Vec<CompletedSession>, RecorderError>;

    /// Deletes records that started before `cutoff`; returns how many went.
    fn purge_started_before(&self, cutoff: DateTime<Local>) -> Result<usize, RecorderError>;

    fn recent(&self, limit: usize) -> Result<Vec<CompletedSession>, RecorderError> {
        let mut sessions = self.sessions()?;
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        sessions.truncate(limit);
        Ok(sessions)
    }

    /// Aggregate over sessions starting in `[from, to)`.
    fn statistics(
        &self,
        from: DateTime<Local>,
        to: DateTime<Local>,
    ) -> Result<SessionStatistics, RecorderError> {
        let sessions = self.sessions()?;
        Ok(sessions
            .iter()
            .filter(|s| s.start_time >= from && s.start_time < to)
            .fold(SessionStatistics::default(), |mut stats, s| {
                stats.session_count += 1;
                stats.total_seconds += s.duration_seconds;
                if s.kind == SessionKind::Work {
                    stats.completed_pomodoros += 1;
                }
                stats
            }))
    }

    fn daily_stats(&self, day: NaiveDate) -> Result<DailyStats, RecorderError> {
        let sessions = self.sessions()?;
        Ok(summarize_day(day, &sessions))
    }

    /// One entry per day for the `days` days ending with `today`, oldest first.
    fn daily_range(&self, today: NaiveDate, days: u32) -> Result<Vec<DailyStats>, RecorderError> {
        let sessions = self.sessions()?;
        Ok((0..days)
            .rev()
            .filter_map(|back| today.checked_sub_signed(Duration::days(i64::from(back))))
            .map(|day| summarize_day(day, &sessions))
            .collect())
    }

    /// A cutoff before the earliest representable time purges nothing.
    fn purge_older_than(&self, days: u32, now: DateTime<Local>) -> Result<usize, RecorderError> {
        match now.checked_sub_signed(Duration::days(i64::from(days))) {
            Some(cutoff) => self.purge_started_before(cutoff),
            None => Ok(0),
        }
    }
}

fn summarize_day(day: NaiveDate, sessions: &[CompletedSession]) -> DailyStats {
    sessions
        .iter()
        .filter(|s| s.start_time.date_naive() == day)
        .fold(
            DailyStats {
                day,
                sessions: 0,
                pomodoros: 0,
                focus_seconds: 0.0,
                break_seconds: 0.0,
            },
            |mut stats, s| {
                stats.sessions += 1;
                if s.kind.is_break() {
                    stats.break_seconds += s.duration_seconds;
                } else {
                    stats.pomodoros += 1;
                    stats.focus_seconds += s.duration_seconds;
                }
                stats
            },
        )
}

pub(crate) fn seconds_f64(duration: Duration) -> f64 {
    match duration.num_microseconds() {
        Some(micros) => micros as f64 / 1_000_000.0,
        None => duration.num_milliseconds() as f64 / 1_000.0,
    }
}

/// Volatile store, used with `--ephemeral` and in tests.
#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<(RecordId, Vec<CompletedSession>)>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRecorder for MemorySessionStore {
    fn record_completed_session(&self, session: &NewSession) -> Result<RecordId, RecorderError> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = records.0 + 1;
        let record = session.clone().into_record(id)?;
        records.0 = id;
        records.1.push(record);
        Ok(id)
    }
}

impl SessionHistory for MemorySessionStore {
    fn sessions(&self) -> Result<Vec<CompletedSession>, RecorderError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .1
            .clone())
    }

    fn purge_started_before(&self, cutoff: DateTime<Local>) -> Result<usize, RecorderError> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = records.1.len();
        records.1.retain(|s| s.start_time >= cutoff);
        Ok(before - records.1.len())
    }
}
