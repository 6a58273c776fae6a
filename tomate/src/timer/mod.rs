//! Pomodoro timer engine.
//!
//! `session` holds the state machine, `engine` runs it against a clock with a
//! background ticker, and `effects` performs what a finished interval leaves
//! behind (notification, session record).

mod effects;
mod engine;
pub mod session;

pub use engine::{Timer, TimerError};
pub use session::{Completion, TimerSession, TimerSnapshot};
