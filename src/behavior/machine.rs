//! The behavioral state machine thread.
//!
//! The machine evaluates its protocol under the [`SessionSync`] lock and
//! sleeps on the shared condvar between evaluations, waking when a sync
//! window opens, a flag changes, the current stage ends, or `tick` elapses
//! (whichever comes first). It never busy-waits.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::behavior::phase::{BehaviorPhase, PhaseRecord, PhaseTiming};
use crate::behavior::protocol::{Dispatch, GuardContext, Protocol, Transition};
use crate::config::ProtocolConfig;
use crate::error::{DaqError, DaqResult};
use crate::sync::{SessionSync, SyncState};

/// How the machine thread finished.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineExit {
    /// Reached `End`.
    Completed {
        /// Every phase entered, in order.
        history: Vec<PhaseRecord>,
    },
    /// Stopped by the cancellation token.
    Cancelled {
        /// Phase current at cancellation.
        phase: BehaviorPhase,
        /// Every phase entered, in order.
        history: Vec<PhaseRecord>,
    },
}

impl MachineExit {
    /// Phase history.
    pub fn history(&self) -> &[PhaseRecord] {
        match self {
            MachineExit::Completed { history } | MachineExit::Cancelled { history, .. } => history,
        }
    }

    /// Phases entered, in order.
    pub fn phases(&self) -> Vec<BehaviorPhase> {
        self.history().iter().map(|r| r.phase).collect()
    }

    /// Whether `End` was reached.
    pub fn is_completed(&self) -> bool {
        matches!(self, MachineExit::Completed { .. })
    }
}

/// Runs a [`Protocol`] against the shared sync state.
pub struct BehaviorStateMachine {
    protocol: Protocol,
    sync: Arc<SessionSync>,
    cancel: CancellationToken,
    tick: Duration,
}

impl BehaviorStateMachine {
    /// Build the machine for `config`.
    ///
    /// Fails with `InvalidConfiguration` if the protocol does not validate.
    pub fn new(
        config: &ProtocolConfig,
        sync: Arc<SessionSync>,
        cancel: CancellationToken,
    ) -> DaqResult<Self> {
        let protocol = Protocol::from_config(config)?;
        Ok(Self::with_protocol(protocol, sync, cancel, config.tick))
    }

    /// Build the machine for an already validated protocol.
    pub fn with_protocol(
        protocol: Protocol,
        sync: Arc<SessionSync>,
        cancel: CancellationToken,
        tick: Duration,
    ) -> Self {
        Self {
            protocol,
            sync,
            cancel,
            tick: tick.max(Duration::from_millis(1)),
        }
    }

    /// The protocol being run.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Run on a dedicated thread named `behavior`.
    pub fn spawn(self) -> DaqResult<JoinHandle<MachineExit>> {
        thread::Builder::new()
            .name("behavior".to_string())
            .spawn(move || self.run())
            .map_err(|e| DaqError::Thread(format!("failed to spawn behavior thread: {e}")))
    }

    /// Run on the current thread until `End` or cancellation.
    pub fn run(self) -> MachineExit {
        let sync = Arc::clone(&self.sync);
        let mut state = sync.lock();

        if state.history.is_empty() {
            let record = PhaseRecord {
                phase: state.phase,
                timing: state.timing,
                trigger: "initial".to_string(),
                exited_at: None,
            };
            state.history.push(record);
        }
        info!(protocol = self.protocol.name(), phase = %state.phase, "Behavior machine started");

        loop {
            if self.cancel.is_cancelled() {
                let phase = state.phase;
                info!(%phase, "Behavior machine cancelled");
                state.machine_awaiting_sync = false;
                let history = state.history.clone();
                drop(state);
                sync.notify();
                return MachineExit::Cancelled { phase, history };
            }

            if state.phase.is_terminal() {
                state.run_requested = false;
                state.machine_awaiting_sync = false;
                let history = state.history.clone();
                drop(state);
                sync.notify();
                info!("Behavior machine reached End");
                return MachineExit::Completed { history };
            }

            let now = sync.now();
            if state.window_open {
                state.machine_seen_epoch = state.window_epoch;
            }
            let ctx = GuardContext {
                now,
                timing: state.timing,
                sync_open: state.window_open || state.hold_open,
                run_requested: state.run_requested,
                saving_complete: state.saving_complete,
                trials_completed: state.trials_completed,
                rewards_delivered: state.rewards_delivered,
            };

            let deadline = match self.protocol.dispatch(state.phase, &ctx) {
                Dispatch::Fire(transition) => {
                    commit(&self.protocol, &mut state, transition, now);
                    state.machine_awaiting_sync = false;
                    sync.notify();
                    continue;
                }
                Dispatch::AwaitingSync => {
                    state.machine_awaiting_sync = true;
                    sync.notify();
                    Instant::now() + self.tick
                }
                Dispatch::Idle => {
                    state.machine_awaiting_sync = false;
                    sync.notify();
                    let tick = Instant::now() + self.tick;
                    match state.timing.end {
                        Some(end) if end > now => tick.min(sync.epoch().instant_at(end)),
                        _ => tick,
                    }
                }
            };
            sync.wait_until(&mut state, deadline);
        }
    }
}

fn commit(
    protocol: &Protocol,
    state: &mut SyncState,
    transition: &Transition,
    now: f64,
) {
    let source = transition.source;
    let dest = transition.dest;

    state.completed.insert(source);
    if source == BehaviorPhase::PreferenceTest {
        state.trials_completed += 1;
    }
    if let Some(last) = state.history.last_mut() {
        last.exited_at = Some(now);
    }

    debug_assert!(
        protocol.may_revisit(dest) || state.history.iter().all(|r| r.phase != dest),
        "{dest} re-entered outside a cyclic sub-loop"
    );

    let timing = PhaseTiming::enter(now, protocol.duration(dest).map(|d| d.as_secs_f64()));
    state.phase = dest;
    state.timing = timing;
    state.history.push(PhaseRecord {
        phase: dest,
        timing,
        trigger: transition.trigger.to_string(),
        exited_at: None,
    });

    info!(
        trigger = transition.trigger,
        from = %source,
        to = %dest,
        at = format_args!("{now:.3}"),
        trials = state.trials_completed,
        "Phase transition"
    );
    debug!(planned_end = ?timing.end, "Entered phase");
}
