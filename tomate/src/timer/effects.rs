//! Side effects of a finished interval, run off the tick path.
//!
//! Completions are queued in order on an unbounded channel and handled by a
//! single worker, so the countdown never waits on the notification daemon or
//! the session store. Failures are logged and dropped.

use super::session::Completion;
use crate::notify::{completion_message, NotificationSink};
use crate::recorder::{NewSession, SessionRecorder};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) struct CompletionJob {
    pub completion: Completion,
    pub notify: bool,
}

pub(crate) async fn run_worker(
    mut jobs: mpsc::UnboundedReceiver<CompletionJob>,
    recorder: Arc<dyn SessionRecorder>,
    notifier: Arc<dyn NotificationSink>,
) {
    while let Some(job) = jobs.recv().await {
        let recorder = recorder.clone();
        let notifier = notifier.clone();
        // both sinks may block on I/O
        let handled = tokio::task::spawn_blocking(move || handle(job, &*recorder, &*notifier)).await;
        if let Err(err) = handled {
            warn!(%err, "completion handler failed");
        }
    }
    debug!("completion worker stopped");
}

fn handle(job: CompletionJob, recorder: &dyn SessionRecorder, notifier: &dyn NotificationSink) {
    let completion = job.completion;
    if job.notify {
        let (title, message) = completion_message(completion.finished);
        notifier.notify(&title, &message);
    }

    let Some(start_time) = completion.started_at else {
        warn!(kind = %completion.finished, "interval finished without a start time; not recorded");
        return;
    };
    let session = NewSession {
        kind: completion.finished,
        start_time,
        end_time: completion.ended_at,
        linked_task_id: completion.linked_task,
    };
    match recorder.record_completed_session(&session) {
        Ok(id) => debug!(id, kind = %session.kind, "interval recorded"),
        Err(err) => warn!(%err, kind = %session.kind, "failed to record interval"),
    }
}
