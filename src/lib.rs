//! # behavior_daq
//!
//! Synchronizes fixed-period multichannel data acquisition with an
//! independently running behavioral protocol, so every acquired block is
//! labelled with the behavioral phase it was recorded in and camera frames
//! can be aligned to the same blocks.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: sample blocks, session buffers, the block clock and the
//!   per-block callback.
//! - **`behavior`**: phases, protocol transition tables and the state machine thread.
//! - **`sync`**: the critical section shared by acquisition and behavior.
//! - **`camera`**: boundary adapter to behavioral cameras.
//! - **`hardware`**: the DAQ driver trait and a mock card.
//! - **`storage`**: session storage backends.
//! - **`flush`**: the one-shot end-of-session flush.
//! - **`session`**: the orchestrator tying it all together.
//! - **`config`**: figment-layered rig configuration.
//! - **`tracing_setup`**: logging initialisation.
//! - **`error`**: the crate error type.

pub mod acquisition;
pub mod behavior;
pub mod camera;
pub mod config;
pub mod error;
pub mod flush;
pub mod hardware;
pub mod session;
pub mod storage;
pub mod sync;
pub mod tracing_setup;

pub use error::{DaqError, DaqResult};
pub use session::{Session, SessionBuilder, SessionOutcome, SessionReport};
