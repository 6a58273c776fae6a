//! The running timer: locking, the supervised ticker and observers.
//!
//! All state lives in one `TimerSession` behind a mutex. Control calls and
//! the background ticker both go through `Inner::transition`, so transitions
//! are totally ordered. Each change takes a ticket under the state lock and
//! observers are called in ticket order after the lock is released, so a
//! callback may read the timer while other threads keep transitioning.
//!
//! Lock order is ticker slot, then state, then observers / completion queue /
//! delivery turn.

use super::effects::{run_worker, CompletionJob};
use super::session::{TimerSession, TimerSnapshot};
use crate::clock::Clock;
use crate::config::{SettingKey, Settings, TimerConfig};
use crate::notify::NotificationSink;
use crate::observer::{ObserverId, ObserverList};
use crate::recorder::SessionRecorder;
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tomate_ipc::TimerState;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum TimerError {
    #[error("the timer must be created inside a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

type Observer = dyn Fn(&TimerSnapshot) + Send + Sync;

struct Core {
    session: TimerSession,
    config: TimerConfig,
    /// Next delivery ticket to hand out.
    issued: u64,
}

/// Whose turn it is to call the observers.
#[derive(Default)]
struct Delivery {
    next: u64,
    running_on: Option<ThreadId>,
}

/// Holds the delivery turn; passes it on when dropped, even if an observer
/// panicked.
struct Turn<'a> {
    inner: &'a Inner,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut delivery = lock(&self.inner.delivery);
        delivery.next += 1;
        delivery.running_on = None;
        self.inner.delivered.notify_all();
    }
}

struct Ticker {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    core: Mutex<Core>,
    observers: Mutex<ObserverList<Observer>>,
    delivery: Mutex<Delivery>,
    delivered: Condvar,
    clock: Arc<dyn Clock>,
    jobs: Mutex<Option<mpsc::UnboundedSender<CompletionJob>>>,
    ticker: Mutex<Option<Ticker>>,
    runtime: Handle,
    generations: AtomicU64,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    /// Runs `f` under the state lock and, if it reports a change, hands the
    /// resulting snapshot to every observer in transition order.
    fn transition<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Core) -> bool,
    {
        let mut core = lock(&self.core);
        if self.closed.load(Ordering::SeqCst) || !f(&mut core) {
            return false;
        }
        let snapshot = core.session.snapshot();
        let ticket = core.issued;
        core.issued += 1;
        let observers: Vec<Arc<Observer>> = lock(&self.observers).iter().cloned().collect();
        drop(core);

        let _turn = self.wait_turn(ticket);
        for observer in &observers {
            observer(&snapshot);
        }
        true
    }

    fn wait_turn(&self, ticket: u64) -> Turn<'_> {
        let mut delivery = lock(&self.delivery);
        while delivery.next != ticket {
            delivery = self
                .delivered
                .wait(delivery)
                .unwrap_or_else(PoisonError::into_inner);
        }
        delivery.running_on = Some(thread::current().id());
        Turn { inner: self }
    }

    /// Refuses every later transition and waits until observers have heard
    /// about the ones already made. Called from inside an observer it only
    /// waits for the deliveries queued before the current one.
    fn close(&self) {
        let issued = {
            let core = lock(&self.core);
            self.closed.store(true, Ordering::SeqCst);
            core.issued
        };
        let mut delivery = lock(&self.delivery);
        while delivery.next < issued && delivery.running_on != Some(thread::current().id()) {
            delivery = self
                .delivered
                .wait(delivery)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn now(&self) -> DateTime<Local> {
        self.clock.now()
    }

    fn tick(&self) {
        self.transition(|core| {
            if core.session.state != TimerState::Running {
                return false;
            }
            let shown = core.session.snapshot().remaining_secs();
            let now = self.now();
            core.session.advance(now);
            if core.session.is_expired() {
                self.finish_interval(core, now);
                return true;
            }
            // observers only hear about whole-second changes
            core.session.snapshot().remaining_secs() != shown
        });
    }

    fn finish_interval(&self, core: &mut Core, now: DateTime<Local>) {
        let completion = core.session.complete(now, &core.config);
        info!(
            finished = %completion.finished,
            next = %completion.next,
            pomodoros = core.session.pomodoro_count,
            auto_advance = !core.config.manual_session_switch,
            "interval complete"
        );
        let job = CompletionJob {
            completion,
            notify: core.config.notifications_enabled,
        };
        match lock(&self.jobs).as_ref() {
            Some(jobs) => {
                if jobs.send(job).is_err() {
                    warn!("completion worker is gone; interval not recorded");
                }
            }
            None => warn!("timer is shutting down; interval not recorded"),
        }
    }

    fn update_settings(&self, config: TimerConfig) {
        let config = config.sanitized();
        self.transition(|core| {
            let before = core.session.snapshot();
            core.config = config;
            core.session.apply_config(&core.config);
            core.session.snapshot() != before
        });
    }

    fn tick_interval(&self) -> std::time::Duration {
        lock(&self.core).config.tick_interval()
    }

    fn ensure_ticker(self: &Arc<Self>) {
        let mut slot = lock(&self.ticker);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if slot.as_ref().is_some_and(|ticker| !ticker.handle.is_finished()) {
            return;
        }
        let max_restarts = lock(&self.core).config.max_ticker_restarts;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let handle = self
            .runtime
            .spawn(supervise(self.clone(), cancel.clone(), generation, max_restarts));
        *slot = Some(Ticker {
            generation,
            cancel,
            handle,
        });
        debug!(generation, "ticker spawned");
    }

    /// Clears the ticker slot if the timer is idle, so the next start spawns
    /// a fresh ticker. Returns whether the calling ticker should exit.
    fn retire_if_idle(&self, generation: u64) -> bool {
        let mut slot = lock(&self.ticker);
        if lock(&self.core).session.state != TimerState::Idle {
            return false;
        }
        if slot.as_ref().is_some_and(|ticker| ticker.generation == generation) {
            slot.take();
        }
        debug!(generation, "timer idle; ticker exiting");
        true
    }

    /// The countdown cannot be kept alive: stop claiming to run.
    fn give_up(&self) {
        let mut slot = lock(&self.ticker);
        slot.take();
        self.transition(|core| {
            if core.session.state == TimerState::Idle {
                return false;
            }
            core.session.force_idle();
            true
        });
    }
}

async fn tick_loop(inner: Arc<Inner>, cancel: CancellationToken, generation: u64) {
    loop {
        let interval = inner.tick_interval();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                inner.tick();
                if inner.retire_if_idle(generation) {
                    break;
                }
            }
        }
    }
}

async fn supervise(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    generation: u64,
    max_restarts: u32,
) {
    let mut restarts = 0;
    loop {
        let run = tokio::spawn(tick_loop(inner.clone(), cancel.clone(), generation));
        match run.await {
            Ok(()) => break,
            Err(err) if err.is_panic() && !cancel.is_cancelled() => {
                if restarts >= max_restarts {
                    error!(restarts, "tick loop keeps failing; stopping the timer");
                    inner.give_up();
                    break;
                }
                restarts += 1;
                error!(restarts, "tick loop panicked; restarting");
            }
            Err(err) => {
                debug!(%err, "tick loop ended");
                break;
            }
        }
    }
}

/// Pomodoro timer engine.
///
/// Invalid transitions (pausing an idle timer, stopping a running one, ...)
/// are ignored. Must be created inside a tokio runtime; the control methods
/// themselves are synchronous and may be called from any thread.
pub struct Timer {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(
        config: TimerConfig,
        clock: Arc<dyn Clock>,
        recorder: Arc<dyn SessionRecorder>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, TimerError> {
        let runtime = Handle::try_current()?;
        let config = config.sanitized();
        let (jobs, queue) = mpsc::unbounded_channel();
        let worker = runtime.spawn(run_worker(queue, recorder, notifier));

        let inner = Arc::new(Inner {
            core: Mutex::new(Core {
                session: TimerSession::new(&config),
                config,
                issued: 0,
            }),
            observers: Mutex::new(ObserverList::new()),
            delivery: Mutex::new(Delivery::default()),
            delivered: Condvar::new(),
            clock,
            jobs: Mutex::new(Some(jobs)),
            ticker: Mutex::new(None),
            runtime,
            generations: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn start(&self) {
        let inner = &self.inner;
        let started = inner.transition(|core| {
            let started = core.session.start(inner.now());
            if started {
                info!(kind = %core.session.kind, remaining = core.session.remaining.num_seconds(), "timer started");
            }
            started
        });
        if started {
            inner.ensure_ticker();
        }
    }

    pub fn pause(&self) {
        let inner = &self.inner;
        inner.transition(|core| {
            let paused = core.session.pause(inner.now());
            if paused {
                info!(kind = %core.session.kind, remaining = core.session.remaining.num_seconds(), "timer paused");
            }
            paused
        });
    }

    pub fn resume(&self) {
        let inner = &self.inner;
        inner.transition(|core| {
            let resumed = core.session.resume(inner.now());
            if resumed {
                info!(kind = %core.session.kind, "timer resumed");
            }
            resumed
        });
    }

    /// Discards the paused interval and returns to a fresh WORK interval.
    pub fn stop(&self) {
        self.inner.transition(|core| {
            let reset = core.session.reset(&core.config);
            if reset {
                info!("timer reset");
            }
            reset
        });
    }

    /// Starts the pending interval when idle; otherwise finishes the current
    /// interval now, exactly as if it had run out.
    pub fn start_next_session(&self) {
        let inner = &self.inner;
        let changed = inner.transition(|core| match core.session.state {
            TimerState::Idle => core.session.start(inner.now()),
            TimerState::Running | TimerState::Paused => {
                let now = inner.now();
                core.session.advance(now);
                inner.finish_interval(core, now);
                true
            }
        });
        if changed && self.is_running() {
            inner.ensure_ticker();
        }
    }

    /// Applies the wall-clock time elapsed since the last tick. The
    /// background ticker calls this on every wake.
    pub fn tick(&self) {
        self.inner.tick();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.core).session.state == TimerState::Running
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        lock(&self.inner.core).session.snapshot()
    }

    pub fn config(&self) -> TimerConfig {
        lock(&self.inner.core).config.clone()
    }

    /// Attaches (or detaches) a task to the current and following intervals.
    pub fn link_task(&self, task_id: Option<i64>) {
        self.inner.transition(|core| {
            if core.session.linked_task == task_id {
                return false;
            }
            core.session.linked_task = task_id;
            true
        });
    }

    /// New durations take effect from the next interval of that kind; an
    /// interval that has not started yet is resized right away.
    pub fn update_settings(&self, config: TimerConfig) {
        self.inner.update_settings(config);
    }

    /// Keeps this timer in step with `settings` from now on.
    pub fn follow(&self, settings: &Settings) -> Vec<ObserverId> {
        let timer = Arc::downgrade(&self.inner);
        SettingKey::ALL
            .into_iter()
            .map(|key| {
                let timer = timer.clone();
                settings.on_change(key, move |key, value| {
                    let Some(inner) = timer.upgrade() else {
                        return;
                    };
                    let mut config = lock(&inner.core).config.clone();
                    match config.set(key, *value) {
                        Ok(()) => {
                            debug!(%key, ?value, "setting changed");
                            inner.update_settings(config);
                        }
                        Err(err) => warn!(%err, "ignoring setting change"),
                    }
                })
            })
            .collect()
    }

    /// Observers run on the thread that caused the transition, one at a time
    /// and in transition order. They may read the timer but must not call its
    /// control or observer methods.
    pub fn add_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&TimerSnapshot) + Send + Sync + 'static,
    {
        lock(&self.inner.observers).add(Arc::new(observer))
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        lock(&self.inner.observers).remove(id)
    }

    /// Stops the ticker and waits for it, then flushes pending completions.
    /// The timer ignores every control call afterwards.
    pub async fn shutdown(&self) {
        let ticker = {
            let mut slot = lock(&self.inner.ticker);
            self.inner.close();
            slot.take()
        };
        if let Some(ticker) = ticker {
            ticker.cancel.cancel();
            if let Err(err) = ticker.handle.await {
                warn!(%err, "ticker did not stop cleanly");
            }
        }

        // dropping the sender lets the worker drain and exit
        lock(&self.inner.jobs).take();
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(%err, "completion worker did not stop cleanly");
            }
        }
        info!("timer shut down");
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let mut slot = lock(&self.inner.ticker);
        self.inner.close();
        if let Some(ticker) = slot.take() {
            ticker.cancel.cancel();
        }
        drop(slot);
        lock(&self.inner.jobs).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::NotificationSink;
    use crate::recorder::{MemorySessionStore, NewSession, RecordId, RecorderError, SessionHistory};
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::AtomicU32;
    use tomate_ipc::SessionKind;

    #[derive(Default)]
    struct Notes(Mutex<Vec<String>>);

    impl NotificationSink for Notes {
        fn notify(&self, title: &str, _message: &str) {
            self.0.lock().unwrap().push(title.to_string());
        }
    }

    struct BrokenStore;

    impl SessionRecorder for BrokenStore {
        fn record_completed_session(&self, _: &NewSession) -> Result<RecordId, RecorderError> {
            Err(RecorderError::Unavailable("disk on fire".into()))
        }
    }

    /// Panics on `now()` while armed.
    struct FlakyClock {
        inner: ManualClock,
        panics_left: AtomicU32,
    }

    impl Clock for FlakyClock {
        fn now(&self) -> DateTime<Local> {
            if self.panics_left.load(Ordering::SeqCst) > 0 {
                self.panics_left.fetch_sub(1, Ordering::SeqCst);
                panic!("clock exploded");
            }
            self.inner.now()
        }
    }

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn quiet_config() -> TimerConfig {
        TimerConfig {
            work_time: 60,
            short_break: 10,
            long_break: 30,
            pomodoros_before_long_break: 4,
            notifications_enabled: true,
            // the background ticker never wakes on its own in these tests
            tick_interval_ms: 3_600_000,
            ..TimerConfig::default()
        }
    }

    struct Rig {
        timer: Timer,
        clock: ManualClock,
        store: Arc<MemorySessionStore>,
        notes: Arc<Notes>,
    }

    fn rig(config: TimerConfig) -> Rig {
        let clock = ManualClock::new(t0());
        let store = Arc::new(MemorySessionStore::new());
        let notes = Arc::new(Notes::default());
        let timer = Timer::new(
            config,
            Arc::new(clock.clone()),
            store.clone(),
            notes.clone(),
        )
        .unwrap();
        Rig {
            timer,
            clock,
            store,
            notes,
        }
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let rig = rig(quiet_config());
        rig.timer.start();
        rig.clock.advance(Duration::seconds(5));
        rig.timer.start();
        rig.timer.tick();

        let snapshot = rig.timer.snapshot();
        assert_eq!(snapshot.state, TimerState::Running);
        assert_eq!(snapshot.remaining, Duration::seconds(55));

        let first = lock(&rig.timer.inner.ticker).as_ref().map(|t| t.generation);
        rig.timer.pause();
        rig.timer.resume();
        rig.timer.start();
        let second = lock(&rig.timer.inner.ticker).as_ref().map(|t| t.generation);
        assert_eq!(first, Some(1));
        assert_eq!(first, second);
        rig.timer.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_transitions_are_ignored() {
        let rig = rig(quiet_config());
        let before = rig.timer.snapshot();
        rig.timer.pause();
        rig.timer.resume();
        rig.timer.stop();
        assert_eq!(rig.timer.snapshot(), before);

        rig.timer.start();
        rig.timer.stop();
        assert!(rig.timer.is_running());
        assert!(!rig.timer.snapshot().can_reset);
        rig.timer.shutdown().await;
    }

    #[tokio::test]
    async fn pause_resume_without_elapsed_time_keeps_remaining() {
        let rig = rig(quiet_config());
        rig.timer.start();
        rig.clock.advance(Duration::milliseconds(2_250));
        rig.timer.tick();
        let before = rig.timer.snapshot().remaining;

        rig.timer.pause();
        assert!(rig.timer.snapshot().can_reset);
        rig.timer.resume();
        assert!(!rig.timer.snapshot().can_reset);
        assert_eq!(rig.timer.snapshot().remaining, before);
        rig.timer.shutdown().await;
    }

    #[tokio::test]
    async fn stop_from_pause_returns_to_work() {
        let rig = rig(quiet_config());
        rig.timer.start();
        rig.clock.advance(Duration::seconds(60));
        rig.timer.tick();
        assert_eq!(rig.timer.snapshot().kind, SessionKind::ShortBreak);

        rig.timer.pause();
        rig.timer.stop();
        let snapshot = rig.timer.snapshot();
        assert_eq!(snapshot.state, TimerState::Idle);
        assert_eq!(snapshot.kind, SessionKind::Work);
        assert_eq!(snapshot.remaining, Duration::seconds(60));
        assert!(!snapshot.can_reset);
        rig.timer.shutdown().await;
    }

    #[tokio::test]
    async fn observers_see_transitions_in_order() {
        let rig = rig(quiet_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let id = rig.timer.add_observer(move |snapshot| {
            log.lock().unwrap().push((snapshot.state, snapshot.kind, snapshot.can_reset));
        });

        rig.timer.start();
        rig.timer.pause();
        rig.timer.resume();
        rig.clock.advance(Duration::seconds(60));
        rig.timer.tick();
        assert!(rig.timer.remove_observer(id));
        rig.timer.pause();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (TimerState::Running, SessionKind::Work, false),
                (TimerState::Paused, SessionKind::Work, true),
                (TimerState::Running, SessionKind::Work, false),
                (TimerState::Running, SessionKind::ShortBreak, false),
            ]
        );
        rig.timer.shutdown().await;
    }

    #[tokio::test]
    async fn observers_may_read_the_timer() {
        let rig = rig(quiet_config());
        let timer = Arc::new(rig.timer);
        let reader = Arc::downgrade(&timer);
        let states = Arc::new(Mutex::new(Vec::new()));
        let log = states.clone();
        timer.add_observer(move |_| {
            if let Some(timer) = reader.upgrade() {
                log.lock().unwrap().push(timer.is_running());
            }
        });

        timer.start();
        timer.pause();
        assert_eq!(*states.lock().unwrap(), vec![true, false]);
        timer.shutdown().await;
    }

    #[tokio::test]
    async fn completion_notifies_and_records_actual_duration() {
        let rig = rig(TimerConfig {
            work_time: 1500,
            ..quiet_config()
        });
        rig.timer.link_task(Some(42));
        rig.timer.start();
        rig.clock.advance(Duration::milliseconds(1_500_200));
        rig.timer.tick();
        rig.timer.shutdown().await;

        let sessions = rig.store.sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].kind, SessionKind::Work);
        assert!((sessions[0].duration_seconds - 1500.2).abs() < 1e-6);
        assert_eq!(sessions[0].linked_task_id, Some(42));
        assert_eq!(*rig.notes.0.lock().unwrap(), vec!["Work complete".to_string()]);
    }

    #[tokio::test]
    async fn disabled_notifications_still_record() {
        let rig = rig(TimerConfig {
            notifications_enabled: false,
            ..quiet_config()
        });
        rig.timer.start();
        rig.clock.advance(Duration::seconds(61));
        rig.timer.tick();
        rig.timer.shutdown().await;

        assert!(rig.notes.0.lock().unwrap().is_empty());
        assert_eq!(rig.store.sessions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn storage_failure_does_not_stop_the_timer() {
        let clock = ManualClock::new(t0());
        let timer = Timer::new(
            quiet_config(),
            Arc::new(clock.clone()),
            Arc::new(BrokenStore),
            Arc::new(Notes::default()),
        )
        .unwrap();

        timer.start();
        clock.advance(Duration::seconds(60));
        timer.tick();
        clock.advance(Duration::seconds(10));
        timer.tick();

        let snapshot = timer.snapshot();
        assert_eq!(snapshot.kind, SessionKind::Work);
        assert_eq!(snapshot.state, TimerState::Running);
        assert_eq!(snapshot.pomodoro_count, 1);
        timer.shutdown().await;
    }

    #[tokio::test]
    async fn next_session_skips_ahead_and_records_the_partial_interval() {
        let rig = rig(quiet_config());
        rig.timer.start();
        rig.clock.advance(Duration::seconds(20));
        rig.timer.start_next_session();

        let snapshot = rig.timer.snapshot();
        assert_eq!(snapshot.kind, SessionKind::ShortBreak);
        assert_eq!(snapshot.state, TimerState::Running);
        assert_eq!(snapshot.pomodoro_count, 1);
        rig.timer.shutdown().await;

        let sessions = rig.store.sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].duration_seconds, 20.0);
    }

    #[tokio::test]
    async fn settings_change_applies_to_next_interval() {
        let rig = rig(quiet_config());
        let settings = Settings::new(quiet_config());
        rig.timer.follow(&settings);

        rig.timer.start();
        settings
            .set(SettingKey::WorkTime, crate::config::SettingValue::Number(120))
            .unwrap();
        assert_eq!(rig.timer.snapshot().total, Duration::seconds(60));
        assert_eq!(rig.timer.config().work_time, 120);

        rig.clock.advance(Duration::seconds(60));
        rig.timer.tick();
        rig.clock.advance(Duration::seconds(10));
        rig.timer.tick();
        let snapshot = rig.timer.snapshot();
        assert_eq!(snapshot.kind, SessionKind::Work);
        assert_eq!(snapshot.total, Duration::seconds(120));
        rig.timer.shutdown().await;
    }

    #[tokio::test]
    async fn idle_timer_picks_up_new_work_time_immediately() {
        let rig = rig(quiet_config());
        rig.timer.update_settings(TimerConfig {
            work_time: 90,
            ..quiet_config()
        });
        assert_eq!(rig.timer.snapshot().remaining, Duration::seconds(90));
        rig.timer.shutdown().await;
    }

    #[tokio::test]
    async fn background_ticker_follows_the_clock() {
        let rig = rig(TimerConfig {
            tick_interval_ms: 5,
            ..quiet_config()
        });
        rig.timer.start();
        rig.clock.advance(Duration::seconds(30));

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while rig.timer.snapshot().remaining != Duration::seconds(30) {
            assert!(tokio::time::Instant::now() < deadline, "ticker never ran");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        rig.timer.shutdown().await;
    }

    #[tokio::test]
    async fn no_ticks_after_shutdown() {
        let rig = rig(TimerConfig {
            tick_interval_ms: 5,
            ..quiet_config()
        });
        rig.timer.start();
        rig.timer.shutdown().await;
        assert!(lock(&rig.timer.inner.ticker).is_none());

        let before = rig.timer.snapshot();
        rig.clock.advance(Duration::seconds(30));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(rig.timer.snapshot(), before);

        // control calls are inert once shut down
        rig.timer.pause();
        assert_eq!(rig.timer.snapshot(), before);
    }

    #[tokio::test]
    async fn panicking_tick_loop_is_restarted() {
        let clock = ManualClock::new(t0());
        let flaky = Arc::new(FlakyClock {
            inner: clock.clone(),
            panics_left: AtomicU32::new(0),
        });
        let timer = Timer::new(
            TimerConfig {
                tick_interval_ms: 5,
                max_ticker_restarts: 3,
                ..quiet_config()
            },
            flaky.clone(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(Notes::default()),
        )
        .unwrap();

        timer.start();
        flaky.panics_left.store(2, Ordering::SeqCst);
        clock.advance(Duration::seconds(10));

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while timer.snapshot().remaining != Duration::seconds(50) {
            assert!(tokio::time::Instant::now() < deadline, "ticker was not restarted");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(timer.is_running());
        timer.shutdown().await;
    }

    #[tokio::test]
    async fn dead_tick_loop_forces_idle() {
        let clock = ManualClock::new(t0());
        let flaky = Arc::new(FlakyClock {
            inner: clock.clone(),
            panics_left: AtomicU32::new(0),
        });
        let timer = Timer::new(
            TimerConfig {
                tick_interval_ms: 5,
                max_ticker_restarts: 1,
                ..quiet_config()
            },
            flaky.clone(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(Notes::default()),
        )
        .unwrap();

        timer.start();
        flaky.panics_left.store(u32::MAX, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while timer.is_running() {
            assert!(tokio::time::Instant::now() < deadline, "timer still claims to run");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(timer.snapshot().state, TimerState::Idle);
        assert!(lock(&timer.inner.ticker).is_none());

        // a later start brings up a fresh ticker
        flaky.panics_left.store(0, Ordering::SeqCst);
        timer.start();
        assert!(timer.is_running());
        assert!(lock(&timer.inner.ticker).is_some());
        timer.shutdown().await;
    }

    #[tokio::test]
    async fn ticker_exits_once_idle_and_returns_on_start() {
        let rig = rig(TimerConfig {
            work_time: 1,
            tick_interval_ms: 2,
            manual_session_switch: true,
            ..quiet_config()
        });
        rig.timer.start();
        rig.clock.advance(Duration::seconds(1));

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while lock(&rig.timer.inner.ticker).is_some() {
            assert!(tokio::time::Instant::now() < deadline, "idle ticker kept running");
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(rig.timer.snapshot().state, TimerState::Idle);
        assert_eq!(rig.timer.snapshot().kind, SessionKind::ShortBreak);

        rig.timer.start_next_session();
        let generation = lock(&rig.timer.inner.ticker).as_ref().map(|t| t.generation);
        assert_eq!(generation, Some(2));
        rig.timer.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn observers_reading_the_timer_do_not_block_other_threads() {
        let rig = rig(quiet_config());
        let timer = Arc::new(rig.timer);
        let reader = Arc::downgrade(&timer);
        timer.add_observer(move |_| {
            std::thread::sleep(std::time::Duration::from_millis(1));
            if let Some(timer) = reader.upgrade() {
                let _ = timer.snapshot();
            }
        });
        timer.start();

        let pauser = {
            let timer = timer.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    timer.pause();
                    timer.resume();
                }
            })
        };
        let linker = {
            let timer = timer.clone();
            std::thread::spawn(move || {
                for task in 0..200 {
                    timer.link_task(Some(task));
                }
            })
        };

        let joined = tokio::task::spawn_blocking(move || pauser.join().is_ok() && linker.join().is_ok());
        let finished = tokio::time::timeout(std::time::Duration::from_secs(10), joined).await;
        assert!(matches!(finished, Ok(Ok(true))), "control threads got stuck");
        assert_eq!(timer.snapshot().linked_task, Some(199));
        timer.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ticker_and_control_calls_keep_the_invariants() {
        let rig = rig(TimerConfig {
            work_time: 2,
            short_break: 1,
            long_break: 1,
            tick_interval_ms: 1,
            ..quiet_config()
        });
        let timer = Arc::new(rig.timer);
        let reader = Arc::downgrade(&timer);
        let heard = Arc::new(AtomicU32::new(0));
        let broken = Arc::new(Mutex::new(Vec::new()));
        {
            let heard = heard.clone();
            let broken = broken.clone();
            timer.add_observer(move |snapshot| {
                heard.fetch_add(1, Ordering::SeqCst);
                let in_range = snapshot.remaining >= Duration::zero() && snapshot.remaining <= snapshot.total;
                let reset_only_when_paused = !snapshot.can_reset || snapshot.state == TimerState::Paused;
                if !in_range || !reset_only_when_paused {
                    broken.lock().unwrap().push(snapshot.clone());
                }
                if let Some(timer) = reader.upgrade() {
                    let _ = timer.is_running();
                }
            });
        }
        timer.start();

        let control = {
            let timer = timer.clone();
            std::thread::spawn(move || {
                for round in 0..200 {
                    timer.pause();
                    if round % 10 == 0 {
                        timer.stop();
                        timer.start();
                    } else {
                        timer.resume();
                    }
                    std::thread::sleep(std::time::Duration::from_micros(200));
                }
            })
        };
        let clock = rig.clock.clone();
        let hands = std::thread::spawn(move || {
            for _ in 0..200 {
                clock.advance_millis(50);
                std::thread::sleep(std::time::Duration::from_micros(300));
            }
        });

        let joined = tokio::task::spawn_blocking(move || control.join().is_ok() && hands.join().is_ok());
        let finished = tokio::time::timeout(std::time::Duration::from_secs(10), joined).await;
        assert!(matches!(finished, Ok(Ok(true))), "threads got stuck");
        timer.shutdown().await;

        assert!(heard.load(Ordering::SeqCst) > 0);
        let broken = broken.lock().unwrap();
        assert!(broken.is_empty(), "{broken:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_timer_stays_silent() {
        let rig = rig(TimerConfig {
            tick_interval_ms: 1,
            ..quiet_config()
        });
        let heard = Arc::new(AtomicU32::new(0));
        let count = heard.clone();
        rig.timer.add_observer(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        rig.timer.start();
        for _ in 0..20 {
            rig.clock.advance(Duration::seconds(1));
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        drop(rig.timer);
        let after_drop = heard.load(Ordering::SeqCst);
        assert!(after_drop > 0);

        rig.clock.advance(Duration::seconds(5));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(heard.load(Ordering::SeqCst), after_drop);
    }
}
