//! Pomodoro timer daemon: the timer engine and the pieces around it.

pub mod clock;
pub mod config;
pub mod ipc;
pub mod notify;
mod observer;
pub mod persistence;
pub mod recorder;
pub mod timer;

pub use observer::ObserverId;
