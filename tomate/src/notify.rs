//! Desktop notifications for finished intervals.

use tomate_ipc::SessionKind;
use tracing::{info, warn};

/// Fire-and-forget notification channel.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Shows notifications through the platform's notification daemon.
pub struct DesktopNotifier;

impl NotificationSink for DesktopNotifier {
    fn notify(&self, title: &str, message: &str) {
        if let Err(e) = notify_rust::Notification::new()
            .summary(title)
            .body(message)
            .appname("tomate")
            .show()
        {
            warn!("Failed to send notification: {}", e);
        }
    }
}

/// Writes notifications to the log only; for headless runs.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        info!(title, message, "notification");
    }
}

pub fn completion_message(kind: SessionKind) -> (String, String) {
    let body = match kind {
        SessionKind::Work => "Work interval finished. Time for a break.",
        SessionKind::ShortBreak | SessionKind::LongBreak => "Break is over. Back to work.",
    };
    (format!("{} complete", kind.label()), body.to_string())
}
