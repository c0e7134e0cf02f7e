// Real-time endpoint threads. Each endpoint owns exactly one of these;
// the server only ever talks to them through their locked state and the
// work/param condvar handshake, which lives in ThreadCore so the playback
// and record flavors share one lifecycle protocol.

pub mod playback;
pub mod record;

pub use playback::{PlaybackKind, PlaybackThread};
pub use record::RecordThread;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, TryLockResult};
use std::time::Duration;

use crate::audio::events::PendingEvent;
use crate::audio::params::ParameterMap;
use crate::audio::types::{AudioError, AudioResult, SILENT_MODE_ENV};

/// The queues the common lifecycle machinery needs out of a thread's locked
/// state.
pub(crate) trait ThreadState {
    fn new_parameters(&mut self) -> &mut VecDeque<ParameterMap>;
    fn param_status(&mut self) -> &mut Option<AudioResult<()>>;
    fn config_events(&mut self) -> &mut VecDeque<PendingEvent>;
}

/// Common endpoint-thread lifecycle: the state lock, the work/param condvar
/// pair, the config-event queue and the exit protocol. A caller queues a
/// parameter change, signals the work condvar and waits on the param
/// condvar; the loop applies the change, answers, then parks on the work
/// condvar until the status has been consumed.
pub(crate) struct ThreadCore<S> {
    state: Mutex<S>,
    work_cv: Condvar,
    param_cv: Condvar,
    exit_pending: AtomicBool,
}

impl<S: ThreadState> ThreadCore<S> {
    pub fn new(state: S) -> Self {
        ThreadCore {
            state: Mutex::new(state),
            work_cv: Condvar::new(),
            param_cv: Condvar::new(),
            exit_pending: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Non-blocking lock for diagnostics paths.
    pub fn try_lock(&self) -> TryLockResult<MutexGuard<'_, S>> {
        self.state.try_lock()
    }

    pub fn notify_work(&self) {
        self.work_cv.notify_all();
    }

    /// Park the loop until there is something to do.
    pub fn wait_for_work<'a>(&'a self, guard: MutexGuard<'a, S>) -> MutexGuard<'a, S> {
        self.work_cv.wait(guard).unwrap_or_else(|p| p.into_inner())
    }

    pub fn exit_pending(&self) -> bool {
        self.exit_pending.load(Ordering::Acquire)
    }

    /// Flag the loop for exit and wake it. The loop flushes its state,
    /// emits a final closed event and returns.
    pub fn request_exit(&self) {
        self.exit_pending.store(true, Ordering::Release);
        let _st = self.lock();
        self.work_cv.notify_all();
    }

    /// Caller side of the parameter handshake; blocks until the loop has
    /// applied the change (or the thread is going away).
    pub fn set_parameters(&self, params: ParameterMap) -> AudioResult<()> {
        let mut st = self.lock();
        st.new_parameters().push_back(params);
        self.work_cv.notify_all();
        loop {
            if self.exit_pending() {
                return Err(AudioError::InvalidOperation);
            }
            let (guard, _timeout) = self
                .param_cv
                .wait_timeout(st, Duration::from_millis(100))
                .unwrap_or_else(|p| p.into_inner());
            st = guard;
            if let Some(status) = st.param_status().take() {
                self.work_cv.notify_all();
                return status;
            }
        }
    }

    /// Loop side of the handshake: publish the status, wake the caller,
    /// then park until the caller has taken it.
    pub fn answer_parameters<'a>(
        &'a self,
        mut guard: MutexGuard<'a, S>,
        status: AudioResult<()>,
    ) -> MutexGuard<'a, S> {
        *guard.param_status() = Some(status);
        self.param_cv.notify_all();
        while guard.param_status().is_some() {
            guard = self.work_cv.wait(guard).unwrap_or_else(|p| p.into_inner());
        }
        guard
    }

    /// Queue a config event for the loop to dispatch.
    pub fn send_config_event(&self, event: PendingEvent) {
        let mut st = self.lock();
        st.config_events().push_back(event);
        self.work_cv.notify_all();
    }

    /// Pop one queued event together with a state snapshot taken under the
    /// lock; the caller dispatches with the lock released to keep the
    /// server/thread rank intact.
    pub fn pop_config_event<R>(&self, snapshot: impl FnOnce(&S) -> R) -> Option<(PendingEvent, R)> {
        let mut st = self.lock();
        let event = st.config_events().pop_front()?;
        let payload = snapshot(&st);
        Some((event, payload))
    }
}

/// One-shot policy hook checked on the first wake after standby: a set
/// silent-mode environment variable asserts master mute.
pub(crate) fn silent_mode_requested() -> bool {
    match std::env::var(SILENT_MODE_ENV) {
        Ok(v) => !v.is_empty() && v != "0",
        Err(_) => false,
    }
}
