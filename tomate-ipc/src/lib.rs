//! Inter-process communication between tomate and tomatectl
//!
//! We use Unix domain sockets for local IPC - they're fast, secure,
//! and perfect for this use case. Every message is one line of JSON.

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Commands that tomatectl can send to tomate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Stop,
    /// Begin the next interval, completing the current one if it is active
    Next,
    Status,
    Link { task_id: Option<i64> },
    Stats { days: u32 },
    Recent { limit: usize },
    Purge { days: u32 },
    Reload,
}

/// Responses from tomate back to tomatectl
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Status(TimerStatus),
    Stats(Vec<DailyStats>),
    Sessions(Vec<SessionSummary>),
    Purged(usize),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerStatus {
    pub state: TimerState,
    pub kind: SessionKind,
    pub remaining: u64, // seconds
    pub total: u64,     // seconds
    pub pomodoros: u32,
    pub can_reset: bool,
    pub task_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerState {
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    Work,
    ShortBreak,
    LongBreak,
}

impl SessionKind {
    pub fn label(&self) -> &'static str {
        match self {
            SessionKind::Work => "Work",
            SessionKind::ShortBreak => "Short break",
            SessionKind::LongBreak => "Long break",
        }
    }

    pub fn is_break(&self) -> bool {
        !matches!(self, SessionKind::Work)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-day aggregate derived from recorded sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub day: NaiveDate,
    pub sessions: usize,
    pub pomodoros: u32,
    pub focus_seconds: f64,
    pub break_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: u64,
    pub kind: SessionKind,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub duration_seconds: f64,
    pub task_id: Option<i64>,
}

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection refused - is tomate running?")]
    ConnectionRefused,
}

pub const SOCKET_PATH: &str = "/tmp/tomate.sock";
