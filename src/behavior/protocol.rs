//! Behavioral protocols as declarative transition tables.
//!
//! A protocol is a list of `(source, trigger, guards, destination)` rows plus
//! the duration of every timed phase. One dispatcher evaluates the rows for
//! the current phase in declaration order and fires the first one whose
//! guards all hold.

use std::time::Duration;

use crate::behavior::phase::{check_stage_time, BehaviorPhase, PhaseTiming};
use crate::config::{ProtocolConfig, ProtocolKind, SwapAction};
use crate::error::{DaqError, DaqResult};

/// Condition attached to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// A sync window is open (the acquisition loop is inside a block).
    SyncWindow,
    /// The current timed phase has reached its planned end.
    StageElapsed,
    /// The run has been requested.
    RunRequested,
    /// The session flush has finished.
    SavingComplete,
    /// More preference trials are due.
    TrialsRemaining,
    /// Every preference trial has been run.
    TrialsExhausted,
    /// The manipulation before the next trial is this one.
    NextSwap(SwapAction),
    /// The reward limit has been delivered.
    IntakeReached,
}

/// Inputs the guards are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext {
    /// Seconds since session start.
    pub now: f64,
    /// Timing of the current phase.
    pub timing: PhaseTiming,
    /// Whether a sync window is open.
    pub sync_open: bool,
    /// Whether the run has been requested.
    pub run_requested: bool,
    /// Whether the flush has finished.
    pub saving_complete: bool,
    /// Preference trials completed so far.
    pub trials_completed: u32,
    /// Rewards counted by the acquisition loop so far.
    pub rewards_delivered: u64,
}

/// One row of the transition table.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Name of the transition, recorded in the phase history.
    pub trigger: &'static str,
    /// Phase the transition leaves.
    pub source: BehaviorPhase,
    /// Phase the transition enters.
    pub dest: BehaviorPhase,
    /// Conditions that must all hold.
    pub guards: Vec<Guard>,
}

impl Transition {
    fn new(
        trigger: &'static str,
        source: BehaviorPhase,
        dest: BehaviorPhase,
        guards: &[Guard],
    ) -> Self {
        Self {
            trigger,
            source,
            dest,
            guards: guards.to_vec(),
        }
    }
}

/// Result of evaluating the table for the current phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dispatch<'a> {
    /// Every guard of this transition holds.
    Fire(&'a Transition),
    /// A transition would fire if a sync window were open.
    AwaitingSync,
    /// Nothing can fire yet.
    Idle,
}

/// A validated behavioral protocol.
#[derive(Debug, Clone)]
pub struct Protocol {
    name: &'static str,
    kind: ProtocolKind,
    transitions: Vec<Transition>,
    durations: Vec<(BehaviorPhase, Duration)>,
    cyclic: Vec<BehaviorPhase>,
    num_trials: u32,
    swap_order: Vec<SwapAction>,
    rewards_allowed: u64,
}

use BehaviorPhase::*;
use Guard::*;

impl Protocol {
    /// Build and validate the protocol selected by `config`.
    pub fn from_config(config: &ProtocolConfig) -> DaqResult<Self> {
        let protocol = match config.kind {
            ProtocolKind::Minimal => Self::minimal(config),
            ProtocolKind::BurrowPreference => Self::burrow_preference(config),
            ProtocolKind::SucrosePreference => Self::sucrose_preference(config),
            ProtocolKind::LickTraining => Self::lick_training(config),
        };
        protocol.validate()?;
        Ok(protocol)
    }

    fn minimal(config: &ProtocolConfig) -> Self {
        Self {
            name: "minimal",
            kind: ProtocolKind::Minimal,
            transitions: vec![
                Transition::new("start_behavior", Setup, Habituation, &[RunRequested, SyncWindow]),
                Transition::new(
                    "graduate_habituation",
                    Habituation,
                    PreferenceTest,
                    &[StageElapsed, SyncWindow],
                ),
                Transition::new(
                    "graduate_preference",
                    PreferenceTest,
                    Saving,
                    &[StageElapsed, SyncWindow],
                ),
                Transition::new("finished_saving", Saving, End, &[SavingComplete]),
            ],
            durations: vec![
                (Habituation, config.habituation_duration),
                (PreferenceTest, config.behavior_duration),
            ],
            cyclic: Vec::new(),
            num_trials: 1,
            swap_order: Vec::new(),
            rewards_allowed: config.rewards_allowed,
        }
    }

    fn burrow_preference(config: &ProtocolConfig) -> Self {
        Self {
            name: "burrow_preference",
            kind: ProtocolKind::BurrowPreference,
            transitions: vec![
                Transition::new("start_behavior", Setup, Retract, &[RunRequested, SyncWindow]),
                Transition::new(
                    "graduate_retraction",
                    Retract,
                    Habituation,
                    &[StageElapsed, SyncWindow],
                ),
                Transition::new(
                    "graduate_habituation",
                    Habituation,
                    Release,
                    &[StageElapsed, SyncWindow],
                ),
                Transition::new(
                    "graduate_release",
                    Release,
                    PreferenceTest,
                    &[StageElapsed, SyncWindow],
                ),
                Transition::new(
                    "graduate_preference",
                    PreferenceTest,
                    Saving,
                    &[StageElapsed, SyncWindow],
                ),
                Transition::new("finished_saving", Saving, End, &[SavingComplete]),
            ],
            durations: vec![
                (Retract, config.retract_duration),
                (Habituation, config.habituation_duration),
                (Release, config.release_duration),
                (PreferenceTest, config.behavior_duration),
            ],
            cyclic: Vec::new(),
            num_trials: 1,
            swap_order: Vec::new(),
            rewards_allowed: config.rewards_allowed,
        }
    }

    fn lick_training(config: &ProtocolConfig) -> Self {
        Self {
            name: "lick_training",
            kind: ProtocolKind::LickTraining,
            transitions: vec![
                Transition::new("start_training", Setup, Training, &[RunRequested, SyncWindow]),
                Transition::new("intake_reached", Training, Saving, &[IntakeReached, SyncWindow]),
                Transition::new("finished_saving", Saving, End, &[SavingComplete]),
            ],
            durations: Vec::new(),
            cyclic: Vec::new(),
            num_trials: 1,
            swap_order: Vec::new(),
            rewards_allowed: config.rewards_allowed,
        }
    }

    fn sucrose_preference(config: &ProtocolConfig) -> Self {
        let mut protocol = Self::burrow_preference(config);
        protocol.name = "sucrose_preference";
        protocol.kind = ProtocolKind::SucrosePreference;
        protocol.num_trials = config.num_trials;
        protocol.swap_order = config.swap_order.clone();
        protocol.cyclic = vec![PreferenceTest, Swapping, Rotating, Deceiving];

        // replace the single preference exit with the trial loop
        protocol
            .transitions
            .retain(|t| t.source != PreferenceTest);
        let saving = protocol.transitions.len() - 1;
        protocol.transitions.splice(
            saving..saving,
            [
                Transition::new(
                    "graduate_preference",
                    PreferenceTest,
                    Swapping,
                    &[StageElapsed, SyncWindow],
                ),
                Transition::new(
                    "swapping_to_saving",
                    Swapping,
                    Saving,
                    &[StageElapsed, TrialsExhausted, SyncWindow],
                ),
                Transition::new(
                    "swapping_to_rotating",
                    Swapping,
                    Rotating,
                    &[StageElapsed, TrialsRemaining, NextSwap(SwapAction::Rotate), SyncWindow],
                ),
                Transition::new(
                    "swapping_to_deceiving",
                    Swapping,
                    Deceiving,
                    &[StageElapsed, TrialsRemaining, NextSwap(SwapAction::Deceive), SyncWindow],
                ),
                Transition::new(
                    "rotating_to_preference",
                    Rotating,
                    PreferenceTest,
                    &[StageElapsed, SyncWindow],
                ),
                Transition::new(
                    "deceiving_to_preference",
                    Deceiving,
                    PreferenceTest,
                    &[StageElapsed, SyncWindow],
                ),
            ],
        );
        protocol.durations.extend([
            (Swapping, config.swap_duration),
            (Rotating, config.rotate_duration),
            (Deceiving, config.deceive_duration),
        ]);
        protocol
    }

    /// Check structural and configuration invariants.
    pub fn validate(&self) -> DaqResult<()> {
        for (phase, duration) in &self.durations {
            if duration.is_zero() {
                return Err(DaqError::InvalidConfiguration(format!(
                    "{} duration must be positive for protocol {}",
                    phase, self.name
                )));
            }
        }

        if self.kind == ProtocolKind::SucrosePreference {
            if self.num_trials == 0 {
                return Err(DaqError::InvalidConfiguration(
                    "num_trials must be at least 1".into(),
                ));
            }
            let expected = (self.num_trials - 1) as usize;
            if self.swap_order.len() != expected {
                return Err(DaqError::InvalidConfiguration(format!(
                    "swap_order has {} entries but {} trials need {}",
                    self.swap_order.len(),
                    self.num_trials,
                    expected
                )));
            }
        }

        if self.kind == ProtocolKind::LickTraining && self.rewards_allowed == 0 {
            return Err(DaqError::InvalidConfiguration(
                "rewards_allowed must be at least 1".into(),
            ));
        }

        if self.transitions.iter().any(|t| t.source == End) {
            return Err(DaqError::InvalidConfiguration(
                "End must be terminal".into(),
            ));
        }
        if !self.transitions.iter().any(|t| t.dest == End) {
            return Err(DaqError::InvalidConfiguration(format!(
                "protocol {} never reaches End",
                self.name
            )));
        }
        for t in &self.transitions {
            if t.guards.contains(&StageElapsed) && self.duration(t.source).is_none() {
                return Err(DaqError::InvalidConfiguration(format!(
                    "{} waits on elapsed time but {} has no duration",
                    t.trigger, t.source
                )));
            }
        }
        Ok(())
    }

    /// Protocol name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Protocol variant.
    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    /// Phase the machine starts in.
    pub fn initial(&self) -> BehaviorPhase {
        Setup
    }

    /// Transition table in evaluation order.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Planned length of a timed phase.
    pub fn duration(&self, phase: BehaviorPhase) -> Option<Duration> {
        self.durations
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, d)| *d)
    }

    /// Whether the protocol contains a repeating sub-loop.
    pub fn is_cyclic(&self) -> bool {
        !self.cyclic.is_empty()
    }

    /// Whether `phase` may be entered more than once.
    pub fn may_revisit(&self, phase: BehaviorPhase) -> bool {
        self.cyclic.contains(&phase)
    }

    /// Number of preference trials.
    pub fn num_trials(&self) -> u32 {
        self.num_trials
    }

    /// Rewards after which lick training ends.
    pub fn rewards_allowed(&self) -> u64 {
        self.rewards_allowed
    }

    /// Manipulation due before the next trial, given the trials completed so far.
    pub fn next_swap(&self, trials_completed: u32) -> Option<SwapAction> {
        let index = trials_completed.checked_sub(1)? as usize;
        self.swap_order.get(index).copied()
    }

    /// Lower bound on session length (every timed phase once, trials repeated).
    pub fn estimated_duration(&self) -> Duration {
        let mut total: Duration = self
            .durations
            .iter()
            .filter(|(p, _)| !self.may_revisit(*p))
            .map(|(_, d)| *d)
            .sum();
        if self.is_cyclic() {
            let trials = self.num_trials;
            total += self.duration(PreferenceTest).unwrap_or_default() * trials;
            total += self.duration(Swapping).unwrap_or_default() * trials;
            total += self
                .swap_order
                .iter()
                .map(|swap| match swap {
                    SwapAction::Rotate => self.duration(Rotating).unwrap_or_default(),
                    SwapAction::Deceive => self.duration(Deceiving).unwrap_or_default(),
                })
                .sum::<Duration>();
        }
        total
    }

    /// Evaluate the table for `phase`.
    pub fn dispatch(&self, phase: BehaviorPhase, ctx: &GuardContext) -> Dispatch<'_> {
        let mut awaiting_sync = false;
        for transition in self.transitions.iter().filter(|t| t.source == phase) {
            let blocked: Vec<Guard> = transition
                .guards
                .iter()
                .copied()
                .filter(|guard| !self.holds(*guard, ctx))
                .collect();
            match blocked.as_slice() {
                [] => return Dispatch::Fire(transition),
                [SyncWindow] => awaiting_sync = true,
                _ => {}
            }
        }
        if awaiting_sync {
            Dispatch::AwaitingSync
        } else {
            Dispatch::Idle
        }
    }

    fn holds(&self, guard: Guard, ctx: &GuardContext) -> bool {
        match guard {
            SyncWindow => ctx.sync_open,
            StageElapsed => ctx
                .timing
                .end
                .map_or(false, |end| check_stage_time(ctx.now, end)),
            RunRequested => ctx.run_requested,
            SavingComplete => ctx.saving_complete,
            TrialsRemaining => ctx.trials_completed < self.num_trials,
            TrialsExhausted => ctx.trials_completed >= self.num_trials,
            NextSwap(action) => self.next_swap(ctx.trials_completed) == Some(action),
            IntakeReached => ctx.rewards_delivered >= self.rewards_allowed,
        }
    }
}
