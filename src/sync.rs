//! Shared state between the acquisition loop and the behavior state machine.
//!
//! Every field the two threads exchange lives in one [`SyncState`] behind a
//! `parking_lot` mutex with a condvar for wakeups. The acquisition loop opens
//! a *sync window* once per block; transitions guarded by
//! [`Guard::SyncWindow`](crate::behavior::protocol::Guard::SyncWindow) only
//! commit while a window is open, and the loop samples the phase under the
//! same lock, so no block is ever labelled with a half-committed phase.
//!
//! Closing a window hands off to the machine: if the machine is parked
//! waiting only for the window, the closer waits (bounded by the handshake
//! timeout) until the machine has evaluated with the window open. A slow or
//! stuck machine therefore never stalls the master clock by more than the
//! timeout.

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::behavior::phase::{BehaviorPhase, PhaseRecord, PhaseSet, PhaseTiming};

/// Wall-clock origin of a session. All phase timestamps are seconds since it.
#[derive(Debug, Clone, Copy)]
pub struct SessionEpoch {
    origin: Instant,
}

impl SessionEpoch {
    /// Epoch starting now.
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Seconds elapsed since the epoch.
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Instant corresponding to `secs` after the epoch.
    pub fn instant_at(&self, secs: f64) -> Instant {
        self.origin + Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Mutable state guarded by [`SessionSync`].
#[derive(Debug)]
pub(crate) struct SyncState {
    pub(crate) window_open: bool,
    pub(crate) window_epoch: u64,
    pub(crate) machine_seen_epoch: u64,
    pub(crate) machine_awaiting_sync: bool,
    pub(crate) hold_open: bool,
    pub(crate) phase: BehaviorPhase,
    pub(crate) timing: PhaseTiming,
    pub(crate) completed: PhaseSet,
    pub(crate) run_requested: bool,
    pub(crate) saving_complete: bool,
    pub(crate) trials_completed: u32,
    pub(crate) rewards_delivered: u64,
    pub(crate) history: Vec<PhaseRecord>,
}

impl SyncState {
    fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            phase: self.phase,
            timing: self.timing,
            completed: self.completed,
            run_requested: self.run_requested,
            saving_complete: self.saving_complete,
            trials_completed: self.trials_completed,
            rewards_delivered: self.rewards_delivered,
            window_epoch: self.window_epoch,
        }
    }
}

/// Consistent copy of the shared state taken under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SyncSnapshot {
    /// Current phase.
    pub phase: BehaviorPhase,
    /// Timing of the current phase.
    pub timing: PhaseTiming,
    /// Phases whose exit condition has been met.
    #[serde(skip)]
    pub completed: PhaseSet,
    /// Whether the run has been requested.
    pub run_requested: bool,
    /// Whether the flush has finished.
    pub saving_complete: bool,
    /// Preference trials completed so far.
    pub trials_completed: u32,
    /// Rewards counted so far.
    pub rewards_delivered: u64,
    /// Number of windows opened so far.
    pub window_epoch: u64,
}

/// Synchronization point between acquisition and behavior.
#[derive(Debug)]
pub struct SessionSync {
    state: Mutex<SyncState>,
    changed: Condvar,
    epoch: SessionEpoch,
    handshake_timeout: Duration,
}

impl SessionSync {
    /// New sync state in `initial` phase.
    pub fn new(initial: BehaviorPhase, handshake_timeout: Duration) -> Self {
        let epoch = SessionEpoch::start();
        Self {
            state: Mutex::new(SyncState {
                window_open: false,
                window_epoch: 0,
                machine_seen_epoch: 0,
                machine_awaiting_sync: false,
                hold_open: false,
                phase: initial,
                timing: PhaseTiming::enter(0.0, None),
                completed: PhaseSet::new(),
                run_requested: false,
                saving_complete: false,
                trials_completed: 0,
                rewards_delivered: 0,
                history: Vec::new(),
            }),
            changed: Condvar::new(),
            epoch,
            handshake_timeout,
        }
    }

    /// Session clock shared by both threads.
    pub fn epoch(&self) -> &SessionEpoch {
        &self.epoch
    }

    /// Seconds since session start.
    pub fn now(&self) -> f64 {
        self.epoch.now()
    }

    /// Open a sync window. The window closes when the returned guard drops.
    pub fn open_window(&self) -> SyncWindow<'_> {
        let epoch = {
            let mut state = self.state.lock();
            state.window_open = true;
            state.window_epoch += 1;
            state.window_epoch
        };
        self.changed.notify_all();
        SyncWindow { sync: self, epoch }
    }

    fn close_window(&self, epoch: u64) {
        let deadline = Instant::now() + self.handshake_timeout;
        let mut state = self.state.lock();
        while state.machine_awaiting_sync && state.machine_seen_epoch < epoch {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                tracing::trace!(epoch, "Sync handshake timed out");
                break;
            }
        }
        state.window_open = false;
    }

    /// Keep the window permanently open, for running the machine without acquisition.
    pub fn hold_open(&self) {
        self.state.lock().hold_open = true;
        self.changed.notify_all();
    }

    /// Allow the machine to leave `Setup`.
    pub fn request_run(&self) {
        self.state.lock().run_requested = true;
        self.changed.notify_all();
    }

    /// Signal that the session flush has finished.
    pub fn mark_saving_complete(&self) {
        self.state.lock().saving_complete = true;
        self.changed.notify_all();
    }

    /// Add rewards counted by the acquisition loop. Returns the running total.
    pub fn record_rewards(&self, rewards: u64) -> u64 {
        let total = {
            let mut state = self.state.lock();
            state.rewards_delivered += rewards;
            state.rewards_delivered
        };
        self.changed.notify_all();
        total
    }

    /// Copy of the shared state.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.state.lock().snapshot()
    }

    /// Phases entered so far, in order.
    pub fn history(&self) -> Vec<PhaseRecord> {
        self.state.lock().history.clone()
    }

    /// Current phase.
    pub fn phase(&self) -> BehaviorPhase {
        self.state.lock().phase
    }

    /// Block until `phase` is current or `timeout` elapses. Returns whether it was reached.
    pub fn wait_for_phase(&self, phase: BehaviorPhase, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.phase != phase {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.phase == phase;
            }
        }
        true
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock()
    }

    pub(crate) fn wait_until(&self, state: &mut MutexGuard<'_, SyncState>, deadline: Instant) {
        let _ = self.changed.wait_until(state, deadline);
    }

    pub(crate) fn notify(&self) {
        self.changed.notify_all();
    }
}

/// An open sync window. Dropping it closes the window.
#[must_use = "the window closes as soon as the guard is dropped"]
pub struct SyncWindow<'a> {
    sync: &'a SessionSync,
    epoch: u64,
}

impl SyncWindow<'_> {
    /// Sample the shared state while the window is open.
    pub fn observe(&self) -> SyncSnapshot {
        self.sync.snapshot()
    }

    /// Sequence number of this window.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for SyncWindow<'_> {
    fn drop(&mut self) {
        self.sync.close_window(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn window_opens_and_closes_with_guard() {
        let sync = SessionSync::new(BehaviorPhase::Setup, Duration::from_millis(1));
        {
            let window = sync.open_window();
            assert_eq!(window.epoch(), 1);
            assert!(sync.lock().window_open);
            assert_eq!(window.observe().window_epoch, 1);
        }
        assert!(!sync.lock().window_open);

        let _second = sync.open_window();
        assert_eq!(sync.snapshot().window_epoch, 2);
    }

    #[test]
    fn close_is_bounded_when_machine_never_answers() {
        let sync = SessionSync::new(BehaviorPhase::Setup, Duration::from_millis(20));
        sync.lock().machine_awaiting_sync = true;

        let started = Instant::now();
        drop(sync.open_window());
        let waited = started.elapsed();

        assert!(waited >= Duration::from_millis(20));
        assert!(waited < Duration::from_secs(1));
    }

    #[test]
    fn close_returns_once_machine_has_seen_window() {
        let sync = Arc::new(SessionSync::new(BehaviorPhase::Setup, Duration::from_secs(5)));
        sync.lock().machine_awaiting_sync = true;

        let window = sync.open_window();
        let responder = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                let mut state = sync.lock();
                state.machine_seen_epoch = state.window_epoch;
                state.machine_awaiting_sync = false;
                drop(state);
                sync.notify();
            })
        };

        let started = Instant::now();
        drop(window);
        responder.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_for_phase_times_out() {
        let sync = SessionSync::new(BehaviorPhase::Setup, Duration::from_millis(1));
        assert!(sync.wait_for_phase(BehaviorPhase::Setup, Duration::ZERO));
        assert!(!sync.wait_for_phase(BehaviorPhase::End, Duration::from_millis(10)));
    }

    #[test]
    fn flags_are_visible_in_snapshot() {
        let sync = SessionSync::new(BehaviorPhase::Setup, Duration::from_millis(1));
        sync.request_run();
        sync.mark_saving_complete();
        let snap = sync.snapshot();
        assert!(snap.run_requested);
        assert!(snap.saving_complete);
        assert_eq!(snap.phase, BehaviorPhase::Setup);
    }

    #[test]
    fn rewards_accumulate() {
        let sync = SessionSync::new(BehaviorPhase::Training, Duration::from_millis(1));
        assert_eq!(sync.record_rewards(2), 2);
        assert_eq!(sync.record_rewards(0), 2);
        assert_eq!(sync.record_rewards(3), 5);
        assert_eq!(sync.snapshot().rewards_delivered, 5);
    }
}
