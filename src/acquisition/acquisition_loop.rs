//! The per-block acquisition callback.
//!
//! Each invocation opens a sync window, reads one analog and one digital
//! block, counts rewards, samples the behavioral phase under the sync lock,
//! stores the block labelled with that phase, publishes progress, tags the
//! cameras and closes the window. A failed read is logged and recorded as a
//! gap; the sequence number still advances so the master clock never stalls.
//! Output writes are fire-and-forget: a failed write is logged and counted.
//! Only a lost device ends the loop with an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acquisition::block::{AnalogBlock, DigitalBlock, SampleBlock};
use crate::acquisition::buffers::AccumulationBuffers;
use crate::acquisition::clock::BlockClock;
use crate::acquisition::rewards::RewardCounter;
use crate::behavior::phase::BehaviorPhase;
use crate::camera::CameraSync;
use crate::config::{PhaseOutput, RigConfig};
use crate::error::{DaqError, DaqResult, HardwareReadError};
use crate::hardware::{start_failure, DaqDriver};
use crate::sync::SessionSync;

/// Progress through the current timed phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    /// Phase being timed.
    pub phase: BehaviorPhase,
    /// `(now - start) / (end - start) * 100`, unclamped.
    pub percent: f64,
    /// Sequence number of the block that published it.
    pub sequence: u64,
}

/// What the loop should do after a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOutcome {
    /// Keep acquiring.
    Continue,
    /// `Saving` was observed; acquisition stops and the session flushes.
    SavingReached,
    /// The cancellation token fired.
    Cancelled,
}

/// Everything the loop owned, handed back once it stops.
pub struct AcquisitionParts<D> {
    /// The driver, still started.
    pub driver: D,
    /// Camera sync, recording state intact.
    pub camera: CameraSync,
    /// Accumulated data.
    pub buffers: AccumulationBuffers,
    /// Invocations performed.
    pub sequence: u64,
    /// Reads that failed.
    pub read_failures: u64,
    /// Output writes that failed.
    pub write_failures: u64,
    /// Rewards counted on the monitor lines.
    pub rewards_delivered: u64,
}

/// Per-block acquisition over a [`DaqDriver`].
pub struct AcquisitionLoop<D: DaqDriver> {
    driver: D,
    device: String,
    sync: Arc<SessionSync>,
    camera: CameraSync,
    buffers: AccumulationBuffers,
    cancel: CancellationToken,
    progress: watch::Sender<Option<Progress>>,
    samples_per_block: usize,
    period: Duration,
    progress_period: u64,
    phase_outputs: Vec<PhaseOutput>,
    gate_row: Option<usize>,
    gate_driver_line: Option<u32>,
    trial_flag_line: Option<u32>,
    trial_flag: Option<bool>,
    rewards: RewardCounter,
    sequence: u64,
    read_failures: u64,
    write_failures: u64,
    last_phase: Option<BehaviorPhase>,
}

impl<D: DaqDriver> AcquisitionLoop<D> {
    /// Loop for `config`'s hardware layout, with buffers sized for `expected_blocks`.
    pub fn new(
        driver: D,
        config: &RigConfig,
        sync: Arc<SessionSync>,
        camera: CameraSync,
        cancel: CancellationToken,
        expected_blocks: usize,
    ) -> DaqResult<Self> {
        let hardware = &config.hardware;
        let samples_per_block = hardware.buffer_size()?;
        let buffers = AccumulationBuffers::with_capacity(
            hardware.analog_inputs.len(),
            hardware.digital_inputs.len(),
            samples_per_block,
            expected_blocks,
        );
        let (progress, _) = watch::channel(None);
        let mut phase_outputs = config.protocol.phase_outputs.clone();
        phase_outputs.extend(config.rewards.driver_outputs());

        Ok(Self {
            driver,
            device: hardware.device.clone(),
            sync,
            camera,
            buffers,
            cancel,
            progress,
            samples_per_block,
            period: hardware.period(),
            progress_period: config.acquisition.progress_period_blocks.max(1),
            phase_outputs,
            gate_row: hardware.gate_input,
            gate_driver_line: hardware.gate_driver_line,
            trial_flag_line: hardware.trial_flag_line,
            trial_flag: None,
            rewards: RewardCounter::new(&config.rewards, hardware.sampling_rate_hz),
            sequence: 0,
            read_failures: 0,
            write_failures: 0,
            last_phase: None,
        })
    }

    /// Receiver for progress updates.
    pub fn subscribe(&self) -> watch::Receiver<Option<Progress>> {
        self.progress.subscribe()
    }

    /// Block period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Invocations so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Accumulated data so far.
    pub fn buffers(&self) -> &AccumulationBuffers {
        &self.buffers
    }

    /// Start the driver and put the outputs in their idle state.
    ///
    /// Gate driver high, trial flag low. Any failure is a `HardwareConfig`
    /// error and acquisition must not begin.
    pub fn arm(&mut self) -> DaqResult<()> {
        self.driver.start().map_err(start_failure)?;
        if let Some(line) = self.gate_driver_line {
            self.driver.write_digital_line(line, true).map_err(start_failure)?;
        }
        if let Some(line) = self.trial_flag_line {
            self.driver.write_digital_line(line, false).map_err(start_failure)?;
            self.trial_flag = Some(false);
        }
        info!(
            device = %self.device,
            samples_per_block = self.samples_per_block,
            period = ?self.period,
            "Acquisition armed"
        );
        Ok(())
    }

    /// Output writes that failed so far.
    pub fn write_failures(&self) -> u64 {
        self.write_failures
    }

    /// Handle one block. Called once per period by the clock.
    ///
    /// Returns an error only when the device is lost. That block is still
    /// recorded as a gap and the window is closed first.
    pub fn on_block_ready(&mut self) -> DaqResult<BlockOutcome> {
        let started = Instant::now();
        if self.cancel.is_cancelled() {
            return Ok(BlockOutcome::Cancelled);
        }

        let sync = Arc::clone(&self.sync);
        let window = sync.open_window();
        let read = self.read_block();
        self.sequence += 1;
        let sequence = self.sequence;

        if let Ok((_, digital)) = &read {
            let rewards = self.rewards.count(digital);
            if rewards > 0 {
                let total = sync.record_rewards(rewards);
                debug!(sequence, rewards, total, "Rewards delivered");
            }
        }

        let observed = window.observe();
        let mut outcome = BlockOutcome::Continue;
        if self.last_phase != Some(observed.phase) {
            self.enter_phase(observed.phase, sequence);
            if observed.phase == BehaviorPhase::Saving {
                outcome = BlockOutcome::SavingReached;
            }
        }

        let mut fatal = None;
        match read {
            Ok((analog, digital)) => {
                self.mirror_gate(&digital);
                let block = SampleBlock {
                    analog,
                    digital,
                    sequence_number: sequence,
                    phase: observed.phase,
                };
                if let Err(e) = self.buffers.append(&block) {
                    self.skip(sequence, &e);
                }
            }
            Err(e) => {
                self.skip(sequence, &e);
                let err = DaqError::from(e);
                if !err.is_recoverable() {
                    fatal = Some(err);
                }
            }
        }

        if sequence % self.progress_period == 0 {
            if let Some(percent) = observed.timing.percent_complete(sync.now()) {
                self.progress.send_replace(Some(Progress {
                    phase: observed.phase,
                    percent,
                    sequence,
                }));
            }
        }

        self.camera
            .on_block(observed.phase, observed.completed, sequence - 1);
        drop(window);

        let elapsed = started.elapsed();
        self.buffers.record_catch_time(elapsed.as_secs_f64() * 1000.0);
        if elapsed > self.period {
            warn!(sequence, ?elapsed, period = ?self.period, "Acquisition callback overran its period");
        }
        if let Some(err) = fatal {
            error!(sequence, error = %err, "Acquisition cannot continue");
            return Err(err);
        }
        Ok(outcome)
    }

    /// Drive `on_block_ready` from `clock` until `Saving`, cancellation or a fatal error.
    ///
    /// The owned resources are always handed back so the caller can release
    /// the hardware whatever the outcome.
    pub fn run(mut self, clock: &mut BlockClock) -> (DaqResult<BlockOutcome>, AcquisitionParts<D>) {
        let result = loop {
            if !clock.wait(&self.cancel) {
                break Ok(BlockOutcome::Cancelled);
            }
            match self.on_block_ready() {
                Ok(BlockOutcome::Continue) => {}
                other => break other,
            }
        };
        info!(
            sequence = self.sequence,
            stored = self.buffers.blocks_stored(),
            skipped = self.read_failures,
            write_failures = self.write_failures,
            rewards = self.rewards.delivered(),
            overruns = clock.overruns(),
            "Acquisition stopped"
        );
        (result, self.into_parts())
    }

    /// Hand back the owned resources.
    pub fn into_parts(self) -> AcquisitionParts<D> {
        AcquisitionParts {
            driver: self.driver,
            camera: self.camera,
            buffers: self.buffers,
            sequence: self.sequence,
            read_failures: self.read_failures,
            write_failures: self.write_failures,
            rewards_delivered: self.rewards.delivered(),
        }
    }

    fn read_block(&mut self) -> Result<(AnalogBlock, DigitalBlock), HardwareReadError> {
        let analog = self.driver.read_analog_block(self.samples_per_block)?;
        let digital = self.driver.read_digital_block(self.samples_per_block)?;
        Ok((analog, digital))
    }

    fn skip(&mut self, sequence: u64, error: &HardwareReadError) {
        warn!(sequence, %error, "Skipping block");
        self.read_failures += 1;
        self.buffers.record_gap(sequence);
    }

    fn enter_phase(&mut self, phase: BehaviorPhase, sequence: u64) {
        info!(%phase, sequence, "Acquisition observed phase");
        self.last_phase = Some(phase);
        for output in self.phase_outputs.iter().filter(|o| o.phase == phase) {
            debug!(%phase, command = ?output.command, "Issuing phase output");
            if let Err(e) = self.driver.execute(&output.command) {
                warn!(%phase, command = ?output.command, error = %e, "Phase output write failed");
                self.write_failures += 1;
            }
        }
    }

    /// Open-collector gate input: low for the whole block means the gate was crossed.
    ///
    /// A failed flag write leaves the recorded flag unchanged so the next
    /// block tries again.
    fn mirror_gate(&mut self, digital: &DigitalBlock) {
        let (Some(row), Some(line)) = (self.gate_row, self.trial_flag_line) else {
            return;
        };
        let Some(level) = digital.line_max(row) else {
            return;
        };
        let flag = level == 0;
        if self.trial_flag != Some(flag) {
            debug!(flag, sequence = self.sequence, "Trial flag changed");
            match self.driver.write_digital_line(line, flag) {
                Ok(()) => self.trial_flag = Some(flag),
                Err(e) => {
                    warn!(flag, sequence = self.sequence, error = %e, "Trial flag write failed");
                    self.write_failures += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{MockDaq, OutputCommand};

    fn rig() -> RigConfig {
        let mut config = RigConfig::default();
        config.hardware.sampling_rate_hz = 1000;
        config.hardware.buffer_time_ms = 10;
        config
    }

    fn acquisition(daq: MockDaq, config: &RigConfig) -> (AcquisitionLoop<MockDaq>, Arc<SessionSync>) {
        let sync = Arc::new(SessionSync::new(BehaviorPhase::Setup, Duration::from_millis(1)));
        let acq = AcquisitionLoop::new(
            daq,
            config,
            Arc::clone(&sync),
            CameraSync::disabled(),
            CancellationToken::new(),
            16,
        )
        .unwrap();
        (acq, sync)
    }

    #[test]
    fn failed_reads_advance_sequence_and_leave_gaps() {
        let config = rig();
        let daq = MockDaq::from_config(&config.hardware).with_failing_reads([2, 4]);
        let (mut acq, _sync) = acquisition(daq, &config);
        acq.arm().unwrap();

        for _ in 0..5 {
            assert_eq!(acq.on_block_ready().unwrap(), BlockOutcome::Continue);
        }
        let parts = acq.into_parts();
        assert_eq!(parts.sequence, 5);
        assert_eq!(parts.read_failures, 2);
        assert_eq!(parts.buffers.blocks_stored(), 3);
        assert_eq!(parts.buffers.skipped(), &[2, 4]);
        assert_eq!(parts.buffers.block_sequence(), &[1, 3, 5]);
        assert_eq!(parts.buffers.catch_times_ms().len(), 5);
    }

    #[test]
    fn arm_sets_idle_outputs() {
        let config = rig();
        let daq = MockDaq::from_config(&config.hardware);
        let handle = daq.handle();
        let (mut acq, _sync) = acquisition(daq, &config);
        acq.arm().unwrap();

        assert!(handle.started());
        assert_eq!(handle.last_digital(5), Some(true));
        assert_eq!(handle.last_digital(7), Some(false));
    }

    #[test]
    fn failed_start_is_fatal() {
        let config = rig();
        let daq = MockDaq::from_config(&config.hardware).with_failing_start();
        let (mut acq, _sync) = acquisition(daq, &config);
        assert!(matches!(acq.arm(), Err(crate::error::DaqError::HardwareConfig(_))));
    }

    #[test]
    fn open_gate_raises_trial_flag() {
        let config = rig();
        let daq = MockDaq::from_config(&config.hardware).with_gate_open_on([2]);
        let handle = daq.handle();
        let (mut acq, _sync) = acquisition(daq, &config);
        acq.arm().unwrap();

        acq.on_block_ready().unwrap();
        assert_eq!(handle.last_digital(7), Some(false));
        acq.on_block_ready().unwrap();
        assert_eq!(handle.last_digital(7), Some(true));
        acq.on_block_ready().unwrap();
        assert_eq!(handle.last_digital(7), Some(false));
    }

    #[test]
    fn failed_flag_write_is_retried_next_block() {
        let config = rig();
        // writes 1 and 2 are arm, 3 is the first flag change
        let daq = MockDaq::from_config(&config.hardware)
            .with_gate_open_on([2, 3])
            .with_failing_digital_writes([3]);
        let handle = daq.handle();
        let (mut acq, _sync) = acquisition(daq, &config);
        acq.arm().unwrap();

        for _ in 0..4 {
            assert_eq!(acq.on_block_ready().unwrap(), BlockOutcome::Continue);
        }
        assert_eq!(acq.write_failures(), 1);
        assert_eq!(acq.buffers().blocks_stored(), 4);
        assert_eq!(handle.digital_writes(), vec![(5, true), (7, false), (7, true), (7, false)]);
    }

    #[test]
    fn failed_phase_output_does_not_drop_the_block() {
        let mut config = rig();
        config.protocol.phase_outputs.push(PhaseOutput {
            phase: BehaviorPhase::Setup,
            command: OutputCommand::Digital { line: 3, value: true },
        });
        let daq = MockDaq::from_config(&config.hardware).with_failing_digital_writes([3]);
        let (mut acq, _sync) = acquisition(daq, &config);
        acq.arm().unwrap();

        assert_eq!(acq.on_block_ready().unwrap(), BlockOutcome::Continue);
        let parts = acq.into_parts();
        assert_eq!(parts.write_failures, 1);
        assert_eq!(parts.buffers.blocks_stored(), 1);
        assert!(parts.buffers.skipped().is_empty());
    }

    #[test]
    fn lost_device_is_a_gap_then_an_error() {
        let config = rig();
        let daq = MockDaq::from_config(&config.hardware).with_device_lost_at(3);
        let (mut acq, sync) = acquisition(daq, &config);
        acq.arm().unwrap();

        acq.on_block_ready().unwrap();
        acq.on_block_ready().unwrap();
        let err = acq.on_block_ready().unwrap_err();
        assert!(matches!(
            err,
            crate::error::DaqError::HardwareRead(HardwareReadError::DeviceLost(_))
        ));
        assert_eq!(acq.sequence(), 3);
        assert_eq!(acq.buffers().skipped(), &[3]);
        assert!(!sync.lock().window_open);
    }

    #[test]
    fn rewards_are_shared_with_the_machine() {
        let mut config = rig();
        config.rewards.water_delivery_input = Some(2);
        config.rewards.sucrose_delivery_input = None;
        config.rewards.water_reward_duration = Duration::from_millis(2);
        let daq = MockDaq::from_config(&config.hardware).with_reward_pulse(2, 5);
        let (mut acq, sync) = acquisition(daq, &config);
        acq.arm().unwrap();

        for _ in 0..3 {
            acq.on_block_ready().unwrap();
        }
        assert_eq!(sync.snapshot().rewards_delivered, 6);
        assert_eq!(acq.into_parts().rewards_delivered, 6);
    }

    #[test]
    fn reward_drivers_switch_with_training() {
        let mut config = rig();
        config.rewards.water_driver_line = Some(2);
        config.rewards.sucrose_driver_line = Some(4);
        let daq = MockDaq::from_config(&config.hardware);
        let handle = daq.handle();
        let (mut acq, sync) = acquisition(daq, &config);
        acq.arm().unwrap();

        sync.lock().phase = BehaviorPhase::Training;
        acq.on_block_ready().unwrap();
        assert_eq!(handle.last_digital(2), Some(true));
        assert_eq!(handle.last_digital(4), Some(true));

        sync.lock().phase = BehaviorPhase::Saving;
        acq.on_block_ready().unwrap();
        assert_eq!(handle.last_digital(2), Some(false));
        assert_eq!(handle.last_digital(4), Some(false));
    }

    #[test]
    fn phase_outputs_fire_once_on_entry() {
        let mut config = rig();
        config.protocol.phase_outputs.push(PhaseOutput {
            phase: BehaviorPhase::Setup,
            command: OutputCommand::Analog {
                channel: 0,
                value: 4.5,
            },
        });
        let daq = MockDaq::from_config(&config.hardware);
        let handle = daq.handle();
        let (mut acq, _sync) = acquisition(daq, &config);
        acq.arm().unwrap();

        acq.on_block_ready().unwrap();
        acq.on_block_ready().unwrap();
        assert_eq!(handle.analog_writes(), vec![(0, 4.5)]);
    }

    #[test]
    fn saving_stops_the_loop_and_is_stored() {
        let config = rig();
        let daq = MockDaq::from_config(&config.hardware);
        let (mut acq, sync) = acquisition(daq, &config);
        acq.arm().unwrap();

        assert_eq!(acq.on_block_ready().unwrap(), BlockOutcome::Continue);
        sync.lock().phase = BehaviorPhase::Saving;
        assert_eq!(acq.on_block_ready().unwrap(), BlockOutcome::SavingReached);
        assert_eq!(
            acq.buffers().phase_labels(),
            &[BehaviorPhase::Setup, BehaviorPhase::Saving]
        );
    }

    #[test]
    fn progress_is_published_for_timed_phases() {
        let config = rig();
        let daq = MockDaq::from_config(&config.hardware);
        let (mut acq, sync) = acquisition(daq, &config);
        let progress = acq.subscribe();
        acq.arm().unwrap();

        acq.on_block_ready().unwrap();
        assert!(progress.borrow().is_none());

        {
            let mut state = sync.lock();
            state.phase = BehaviorPhase::Habituation;
            state.timing = crate::behavior::phase::PhaseTiming::enter(sync.now(), Some(100.0));
        }
        acq.on_block_ready().unwrap();
        let update = (*progress.borrow()).expect("progress published");
        assert_eq!(update.phase, BehaviorPhase::Habituation);
        assert_eq!(update.sequence, 2);
        assert!(update.percent >= 0.0 && update.percent < 1.0);
    }

    #[test]
    fn cancelled_token_stops_before_reading() {
        let config = rig();
        let daq = MockDaq::from_config(&config.hardware);
        let handle = daq.handle();
        let sync = Arc::new(SessionSync::new(BehaviorPhase::Setup, Duration::from_millis(1)));
        let cancel = CancellationToken::new();
        let mut acq = AcquisitionLoop::new(
            daq,
            &config,
            sync,
            CameraSync::disabled(),
            cancel.clone(),
            4,
        )
        .unwrap();
        acq.arm().unwrap();
        cancel.cancel();

        assert_eq!(acq.on_block_ready().unwrap(), BlockOutcome::Cancelled);
        assert_eq!(handle.analog_reads(), 0);
        assert_eq!(acq.sequence(), 0);
    }
}
