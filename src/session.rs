//! Session orchestration.
//!
//! A [`Session`] owns one run of a protocol on one rig:
//!
//! 1. validate the configuration and build the protocol,
//! 2. arm the hardware (failure here is fatal and nothing else starts),
//! 3. spawn the behavior machine and request the run,
//! 4. drive the acquisition loop on a dedicated `acquisition` thread until
//!    it observes `Saving` or the session is cancelled,
//! 5. flush on the calling thread, which lets the machine reach `End`,
//! 6. join the machine and report.
//!
//! Cancellation stops acquisition, still flushes what was collected with
//! outcome `cancelled`, and lets the machine exit wherever it is. A fatal
//! acquisition error (a lost device) does the same with outcome `failed`
//! and then returns the error.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Local;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::acquisition::{AcquisitionLoop, BlockClock, BlockOutcome, Progress};
use crate::behavior::machine::{BehaviorStateMachine, MachineExit};
use crate::behavior::phase::PhaseRecord;
use crate::behavior::protocol::Protocol;
use crate::camera::{CameraRecorder, CameraSync};
use crate::config::RigConfig;
use crate::error::{DaqError, DaqResult};
use crate::flush::{FlushContext, FlushReport, SessionFlush};
use crate::hardware::DaqDriver;
use crate::storage::SessionStorage;
use crate::sync::SessionSync;

/// How the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The protocol reached `Saving` and the flush ran.
    Completed,
    /// Cancelled before `Saving`; whatever was collected was flushed.
    Cancelled,
    /// Acquisition failed; whatever was collected was flushed.
    Failed,
}

/// Summary of a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// Unique session id.
    pub session_id: Uuid,
    /// How the session ended.
    pub outcome: SessionOutcome,
    /// Acquisition callbacks performed.
    pub sequence: u64,
    /// Blocks stored.
    pub blocks_stored: usize,
    /// Reads that failed and were skipped.
    pub blocks_skipped: usize,
    /// Output writes that failed.
    pub write_failures: u64,
    /// Rewards counted on the monitor lines.
    pub rewards_delivered: u64,
    /// Whether the behavior machine reached `End`.
    pub machine_completed: bool,
    /// Every phase entered.
    pub phase_history: Vec<PhaseRecord>,
    /// What the flush wrote.
    pub flush: FlushReport,
}

/// Builder for [`Session`].
pub struct SessionBuilder<D, S> {
    config: RigConfig,
    driver: D,
    storage: S,
    cameras: Vec<Box<dyn CameraRecorder>>,
    cancel: CancellationToken,
}

impl<D, S> SessionBuilder<D, S>
where
    D: DaqDriver + 'static,
    S: SessionStorage,
{
    /// Start building a session for `config` over `driver` and `storage`.
    pub fn new(config: RigConfig, driver: D, storage: S) -> Self {
        Self {
            config,
            driver,
            storage,
            cameras: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a camera. Only used when `camera.enabled` is set.
    pub fn with_camera(mut self, camera: impl CameraRecorder + 'static) -> Self {
        self.cameras.push(Box::new(camera));
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate everything and assemble the session. Nothing touches hardware yet.
    pub fn build(self) -> DaqResult<Session<D, S>> {
        self.config.validate()?;
        let protocol = Protocol::from_config(&self.config.protocol)?;

        let sync = Arc::new(SessionSync::new(
            protocol.initial(),
            self.config.acquisition.sync_handshake_timeout,
        ));
        let camera = CameraSync::new(&self.config.camera, self.cameras);

        let expected = self
            .config
            .acquisition
            .expected_duration
            .unwrap_or_else(|| protocol.estimated_duration());
        let period = self.config.hardware.period().as_secs_f64();
        let slack = self.config.hardware.buffers_per_second()? as usize;
        let expected_blocks = (expected.as_secs_f64() / period).ceil() as usize + slack;

        let acquisition = AcquisitionLoop::new(
            self.driver,
            &self.config,
            Arc::clone(&sync),
            camera,
            self.cancel.clone(),
            expected_blocks,
        )?;
        let progress = acquisition.subscribe();

        info!(
            protocol = protocol.name(),
            animal_id = %self.config.session.animal_id,
            expected_blocks,
            "Session built"
        );

        Ok(Session {
            id: Uuid::new_v4(),
            config: self.config,
            protocol,
            sync,
            cancel: self.cancel,
            acquisition,
            storage: self.storage,
            flush: SessionFlush::new(),
            progress,
        })
    }
}

/// One configured session, ready to run.
pub struct Session<D: DaqDriver, S> {
    id: Uuid,
    config: RigConfig,
    protocol: Protocol,
    sync: Arc<SessionSync>,
    cancel: CancellationToken,
    acquisition: AcquisitionLoop<D>,
    storage: S,
    flush: SessionFlush,
    progress: watch::Receiver<Option<Progress>>,
}

impl<D, S> Session<D, S>
where
    D: DaqDriver + 'static,
    S: SessionStorage,
{
    /// Session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Token that cancels the session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shared sync state, for observing the current phase.
    pub fn sync(&self) -> Arc<SessionSync> {
        Arc::clone(&self.sync)
    }

    /// Progress updates published by the acquisition loop.
    pub fn progress(&self) -> watch::Receiver<Option<Progress>> {
        self.progress.clone()
    }

    /// Run the session to completion on the calling thread. Blocks.
    pub fn run(self) -> DaqResult<SessionReport> {
        let Session {
            id,
            config,
            protocol,
            sync,
            cancel,
            mut acquisition,
            mut storage,
            flush,
            progress: _,
        } = self;
        let span = info_span!("session", %id, protocol = protocol.name());
        let _enter = span.enter();
        let started_at = Local::now();

        if let Err(e) = acquisition.arm() {
            error!(error = %e, "Failed to arm hardware");
            let mut parts = acquisition.into_parts();
            if let Err(release) = parts.driver.release() {
                warn!(error = %release, "Driver release failed");
            }
            return Err(e);
        }

        let protocol_name = protocol.name();
        let machine =
            BehaviorStateMachine::with_protocol(protocol, Arc::clone(&sync), cancel.clone(), config.protocol.tick)
                .spawn()?;
        sync.request_run();

        let mut clock = BlockClock::new(acquisition.period());
        let acquisition_thread = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || acquisition.run(&mut clock));
        let acquisition_thread = match acquisition_thread {
            Ok(handle) => handle,
            Err(e) => {
                cancel.cancel();
                join_machine(machine);
                return Err(DaqError::Thread(format!("failed to spawn acquisition thread: {e}")));
            }
        };

        let (result, mut parts) = match acquisition_thread.join() {
            Ok(done) => done,
            Err(_) => {
                error!("Acquisition thread panicked");
                cancel.cancel();
                join_machine(machine);
                return Err(DaqError::Thread("acquisition thread panicked".to_string()));
            }
        };

        let (outcome, failure) = match result {
            Ok(BlockOutcome::SavingReached) => (SessionOutcome::Completed, None),
            Ok(_) => (SessionOutcome::Cancelled, None),
            Err(e) => (SessionOutcome::Failed, Some(e)),
        };
        match &failure {
            Some(e) => {
                error!(error = %e, sequence = parts.sequence, "Acquisition failed; saving partial data");
                cancel.cancel();
            }
            None if outcome == SessionOutcome::Cancelled => {
                warn!(sequence = parts.sequence, "Session cancelled; saving partial data");
                cancel.cancel();
            }
            None => {}
        }

        let ctx = FlushContext {
            session_id: id,
            started_at,
            config: &config,
            protocol: protocol_name,
            outcome,
        };
        let flushed = flush.perform(&mut parts, &mut storage, &sync, &ctx);
        if flushed.is_err() {
            // the machine waits in Saving for a flush that will never complete
            cancel.cancel();
        }

        let exit = join_machine(machine);
        if let Some(e) = failure {
            if let Err(flush_err) = &flushed {
                error!(error = %flush_err, "Partial save after acquisition failure also failed");
            }
            return Err(e);
        }
        let exit = exit.ok_or_else(|| DaqError::Thread("behavior thread panicked".to_string()))?;
        let flush_report = flushed?;

        let report = SessionReport {
            session_id: id,
            outcome,
            sequence: parts.sequence,
            blocks_stored: parts.buffers.blocks_stored(),
            blocks_skipped: parts.buffers.skipped().len(),
            write_failures: parts.write_failures,
            rewards_delivered: parts.rewards_delivered,
            machine_completed: exit.is_completed(),
            phase_history: match exit {
                MachineExit::Completed { history } | MachineExit::Cancelled { history, .. } => history,
            },
            flush: flush_report,
        };
        info!(
            outcome = ?report.outcome,
            sequence = report.sequence,
            stored = report.blocks_stored,
            skipped = report.blocks_skipped,
            write_failures = report.write_failures,
            rewards = report.rewards_delivered,
            "Session finished"
        );
        Ok(report)
    }
}

fn join_machine(handle: JoinHandle<MachineExit>) -> Option<MachineExit> {
    match handle.join() {
        Ok(exit) => Some(exit),
        Err(_) => {
            error!("Behavior thread panicked");
            None
        }
    }
}
