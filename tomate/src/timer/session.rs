//! The timer's state and its transitions, free of locking and threads.
//!
//! `Timer` owns one `TimerSession` behind a mutex and drives it from both the
//! control calls and the background ticker. Every method here is a plain state
//! change; invalid transitions return `false` and leave the session untouched.

use crate::config::TimerConfig;
use chrono::{DateTime, Duration, Local};
use tomate_ipc::{SessionKind, TimerState, TimerStatus};

#[derive(Debug, Clone)]
pub struct TimerSession {
    pub kind: SessionKind,
    pub state: TimerState,
    pub total: Duration,
    pub remaining: Duration,
    pub last_tick: Option<DateTime<Local>>,
    pub pomodoro_count: u32,
    pub can_reset: bool,
    /// When the current interval first started running
    pub interval_started_at: Option<DateTime<Local>>,
    pub linked_task: Option<i64>,
}

/// What a finished interval leaves behind for the completion effects.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub finished: SessionKind,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: DateTime<Local>,
    pub linked_task: Option<i64>,
    pub next: SessionKind,
}

/// Point-in-time copy handed to observers and the IPC layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerSnapshot {
    pub state: TimerState,
    pub kind: SessionKind,
    pub remaining: Duration,
    pub total: Duration,
    pub pomodoro_count: u32,
    pub can_reset: bool,
    pub linked_task: Option<i64>,
}

impl TimerSnapshot {
    /// Whole seconds left, rounded up so a display never shows 00:00 early.
    pub fn remaining_secs(&self) -> u64 {
        let millis = self.remaining.num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

impl From<&TimerSnapshot> for TimerStatus {
    fn from(snapshot: &TimerSnapshot) -> Self {
        TimerStatus {
            state: snapshot.state,
            kind: snapshot.kind,
            remaining: snapshot.remaining_secs(),
            total: snapshot.total.num_seconds().max(0) as u64,
            pomodoros: snapshot.pomodoro_count,
            can_reset: snapshot.can_reset,
            task_id: snapshot.linked_task,
        }
    }
}

impl TimerSession {
    pub fn new(config: &TimerConfig) -> Self {
        let total = config.duration_for(SessionKind::Work);
        Self {
            kind: SessionKind::Work,
            state: TimerState::Idle,
            total,
            remaining: total,
            last_tick: None,
            pomodoro_count: 0,
            can_reset: false,
            interval_started_at: None,
            linked_task: None,
        }
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            state: self.state,
            kind: self.kind,
            remaining: self.remaining,
            total: self.total,
            pomodoro_count: self.pomodoro_count,
            can_reset: self.can_reset,
            linked_task: self.linked_task,
        }
    }

    pub fn start(&mut self, now: DateTime<Local>) -> bool {
        if self.state != TimerState::Idle {
            return false;
        }
        self.state = TimerState::Running;
        self.last_tick = Some(now);
        self.can_reset = false;
        self.interval_started_at.get_or_insert(now);
        true
    }

    pub fn pause(&mut self, now: DateTime<Local>) -> bool {
        if self.state != TimerState::Running {
            return false;
        }
        self.advance(now);
        self.state = TimerState::Paused;
        self.last_tick = None;
        self.can_reset = true;
        true
    }

    pub fn resume(&mut self, now: DateTime<Local>) -> bool {
        if self.state != TimerState::Paused {
            return false;
        }
        self.state = TimerState::Running;
        self.last_tick = Some(now);
        self.can_reset = false;
        true
    }

    /// Back to a fresh WORK interval. Only allowed from a deliberate pause.
    pub fn reset(&mut self, config: &TimerConfig) -> bool {
        if !self.can_reset {
            return false;
        }
        self.state = TimerState::Idle;
        self.load_interval(SessionKind::Work, config);
        self.linked_task = None;
        true
    }

    /// Moves `remaining` forward by the wall-clock time since the last tick.
    ///
    /// Returns the time consumed. A clock that stepped backwards consumes
    /// nothing; the new reading becomes the reference for the next tick.
    pub fn advance(&mut self, now: DateTime<Local>) -> Duration {
        if self.state != TimerState::Running {
            return Duration::zero();
        }
        let Some(last) = self.last_tick.replace(now) else {
            return Duration::zero();
        };
        let delta = (now - last).max(Duration::zero());
        let consumed = delta.min(self.remaining);
        self.remaining -= consumed;
        consumed
    }

    pub fn is_expired(&self) -> bool {
        self.state == TimerState::Running && self.remaining <= Duration::zero()
    }

    /// Closes the current interval and loads the next one.
    ///
    /// The next interval is left IDLE under manual switching, otherwise it is
    /// already RUNNING from `now`.
    /// Time that elapsed past the end of the finished interval is not carried
    /// into the next one.
    pub fn complete(&mut self, now: DateTime<Local>, config: &TimerConfig) -> Completion {
        let finished = self.kind;
        let started_at = self.interval_started_at.take();
        let next = match finished {
            SessionKind::Work => {
                self.pomodoro_count += 1;
                let cadence = config.pomodoros_before_long_break.max(1);
                if self.pomodoro_count % cadence == 0 {
                    SessionKind::LongBreak
                } else {
                    SessionKind::ShortBreak
                }
            }
            SessionKind::ShortBreak | SessionKind::LongBreak => SessionKind::Work,
        };

        self.load_interval(next, config);
        if config.manual_session_switch {
            self.state = TimerState::Idle;
        } else {
            self.state = TimerState::Running;
            self.last_tick = Some(now);
            self.interval_started_at = Some(now);
        }

        Completion {
            finished,
            started_at,
            ended_at: now,
            linked_task: self.linked_task,
            next,
        }
    }

    /// Applies new durations. Only an interval that has not begun is resized.
    pub fn apply_config(&mut self, config: &TimerConfig) {
        let untouched = self.state == TimerState::Idle
            && self.interval_started_at.is_none()
            && self.remaining == self.total;
        if untouched {
            self.total = config.duration_for(self.kind);
            self.remaining = self.total;
        }
    }

    pub fn force_idle(&mut self) {
        self.state = TimerState::Idle;
        self.last_tick = None;
        self.can_reset = false;
    }

    fn load_interval(&mut self, kind: SessionKind, config: &TimerConfig) {
        self.kind = kind;
        self.total = config.duration_for(kind);
        self.remaining = self.total;
        self.last_tick = None;
        self.can_reset = false;
        self.interval_started_at = None;
    }
}
