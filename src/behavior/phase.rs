//! Behavioral phases and their timing records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DaqError;

/// A named stage of a behavioral protocol.
///
/// Protocols use a subset of these. `End` is terminal in every protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BehaviorPhase {
    /// Waiting for the run to be requested.
    Setup,
    /// Lick spouts / burrow retracted before habituation.
    Retract,
    /// Animal habituates to the apparatus.
    Habituation,
    /// Apparatus released to the animal.
    Release,
    /// Preference measurement.
    PreferenceTest,
    /// Between preference trials.
    Swapping,
    /// Spouts physically rotated.
    Rotating,
    /// Sham manipulation with the same timing as `Rotating`.
    Deceiving,
    /// Reward spouts armed; runs until the intake limit is reached.
    Training,
    /// Session data is being flushed.
    Saving,
    /// Terminal.
    End,
}

impl BehaviorPhase {
    /// Every phase, in declaration order.
    pub const ALL: [BehaviorPhase; 11] = [
        BehaviorPhase::Setup,
        BehaviorPhase::Retract,
        BehaviorPhase::Habituation,
        BehaviorPhase::Release,
        BehaviorPhase::PreferenceTest,
        BehaviorPhase::Swapping,
        BehaviorPhase::Rotating,
        BehaviorPhase::Deceiving,
        BehaviorPhase::Training,
        BehaviorPhase::Saving,
        BehaviorPhase::End,
    ];

    /// Label stored alongside every acquired block.
    pub fn as_str(&self) -> &'static str {
        match self {
            BehaviorPhase::Setup => "Setup",
            BehaviorPhase::Retract => "Retract",
            BehaviorPhase::Habituation => "Habituation",
            BehaviorPhase::Release => "Release",
            BehaviorPhase::PreferenceTest => "PreferenceTest",
            BehaviorPhase::Swapping => "Swapping",
            BehaviorPhase::Rotating => "Rotating",
            BehaviorPhase::Deceiving => "Deceiving",
            BehaviorPhase::Training => "Training",
            BehaviorPhase::Saving => "Saving",
            BehaviorPhase::End => "End",
        }
    }

    /// Whether the protocol stops here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BehaviorPhase::End)
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl fmt::Display for BehaviorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BehaviorPhase {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BehaviorPhase::ALL
            .iter()
            .copied()
            .find(|phase| phase.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DaqError::InvalidConfiguration(format!("Unknown phase '{s}'")))
    }
}

/// Set of phases whose exit condition has been met at least once.
///
/// Replaces the per-phase `*_complete` booleans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseSet(u16);

impl PhaseSet {
    /// Empty set.
    pub fn new() -> Self {
        Self(0)
    }

    /// Adds a phase.
    pub fn insert(&mut self, phase: BehaviorPhase) {
        self.0 |= phase.bit();
    }

    /// Membership test.
    pub fn contains(&self, phase: BehaviorPhase) -> bool {
        self.0 & phase.bit() != 0
    }

    /// Phases in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = BehaviorPhase> + '_ {
        BehaviorPhase::ALL.into_iter().filter(|p| self.contains(*p))
    }
}

/// Start/end timestamps of the active phase, in seconds since session start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    /// When the phase was entered.
    pub start: f64,
    /// Planned end for timed phases.
    pub end: Option<f64>,
}

impl PhaseTiming {
    /// Timing for a phase entered at `now`, optionally lasting `duration_secs`.
    pub fn enter(now: f64, duration_secs: Option<f64>) -> Self {
        Self {
            start: now,
            end: duration_secs.map(|d| now + d),
        }
    }

    /// Percent of the timed phase elapsed at `now`; `None` for untimed phases.
    pub fn percent_complete(&self, now: f64) -> Option<f64> {
        self.end
            .map(|end| (now - self.start) / (end - self.start) * 100.0)
    }
}

/// One entry of the phase history kept by the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Phase that was entered.
    pub phase: BehaviorPhase,
    /// Timing set by the entry action.
    pub timing: PhaseTiming,
    /// Trigger of the transition that entered the phase.
    pub trigger: String,
    /// When the phase was left, if it was.
    pub exited_at: Option<f64>,
}

impl PhaseRecord {
    /// Planned duration (`end - start`) for timed phases.
    pub fn planned_duration(&self) -> Option<f64> {
        self.timing.end.map(|end| end - self.timing.start)
    }

    /// Actual time spent in the phase, once it has been left.
    pub fn actual_duration(&self) -> Option<f64> {
        self.exited_at.map(|exit| exit - self.timing.start)
    }
}

/// Returns true once `now` has reached `end` (inclusive).
pub fn check_stage_time(now: f64, end: f64) -> bool {
    now >= end
}
