//! Behavioral protocol: phases, transition tables and the state machine thread.

pub mod machine;
pub mod phase;
pub mod protocol;

pub use machine::{BehaviorStateMachine, MachineExit};
pub use phase::{check_stage_time, BehaviorPhase, PhaseRecord, PhaseSet, PhaseTiming};
pub use protocol::{Dispatch, Guard, GuardContext, Protocol, Transition};
