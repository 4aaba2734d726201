//! Rig configuration using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults (the standard burrow rig)
//! 2. A TOML file
//! 3. Environment variables prefixed with `BEHAVIOR_DAQ_` (nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use behavior_daq::config::RigConfig;
//!
//! let config = RigConfig::load_from("config/default.toml")?;
//! config.validate()?;
//! println!("Samples per block: {}", config.hardware.buffer_size()?);
//! # Ok::<(), behavior_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::behavior::phase::BehaviorPhase;
use crate::error::{DaqError, DaqResult};
use crate::hardware::OutputCommand;

/// Top-level configuration for one session on one rig.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Session identity and output location
    pub session: SessionSettings,
    /// DAQ card layout and timing
    pub hardware: HardwareConfig,
    /// Behavioral protocol selection and phase durations
    pub protocol: ProtocolConfig,
    /// Acquisition loop tuning
    pub acquisition: AcquisitionSettings,
    /// Behavioral camera synchronization
    pub camera: CameraConfig,
    /// Reward delivery monitoring
    pub rewards: RewardConfig,
}

/// Session identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Animal identifier; names the session directory
    pub animal_id: String,
    /// Directory under which session directories are created
    pub data_root: PathBuf,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            animal_id: "ATest".to_string(),
            data_root: PathBuf::from("data"),
            log_level: "info".to_string(),
        }
    }
}

/// A named hardware channel or line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Channel or line number on the device
    pub id: u32,
    /// Human-readable role, stored as the column label
    pub name: String,
}

impl ChannelSpec {
    /// Convenience constructor.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// DAQ card layout and sample clock.
///
/// The analog input task is the master clock: one block of
/// `buffer_size()` samples per channel is delivered every `period()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Device name passed to the driver
    pub device: String,
    /// Driver read timeout
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Sample clock (Hz)
    pub sampling_rate_hz: u32,
    /// Length of one block (ms)
    pub buffer_time_ms: u32,
    /// Analog input channels, in block row order
    pub analog_inputs: Vec<ChannelSpec>,
    /// Input voltage range (V)
    pub analog_voltage_range: [f64; 2],
    /// Digital input lines, in block row order
    pub digital_inputs: Vec<ChannelSpec>,
    /// Row of `digital_inputs` carrying the gate sensor
    pub gate_input: Option<usize>,
    /// Output line driving the gate's open collector
    pub gate_driver_line: Option<u32>,
    /// Output line flagging a gate crossing
    pub trial_flag_line: Option<u32>,
    /// Analog output commanding the motor
    pub motor_channel: Option<u32>,
    /// Motor command range (V)
    pub motor_voltage_range: [f64; 2],
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            device: "BurrowDAQ".to_string(),
            read_timeout: Duration::from_secs(10),
            sampling_rate_hz: 1000,
            buffer_time_ms: 100,
            analog_inputs: vec![
                ChannelSpec::new(0, "imaging_sync"),
                ChannelSpec::new(1, "motor_position"),
                ChannelSpec::new(2, "force"),
                ChannelSpec::new(3, "reserved"),
            ],
            analog_voltage_range: [-10.0, 10.0],
            digital_inputs: vec![
                ChannelSpec::new(0, "gate"),
                ChannelSpec::new(1, "sucrose_reward"),
                ChannelSpec::new(2, "water_reward"),
                ChannelSpec::new(3, "licking_sucrose"),
                ChannelSpec::new(4, "licking_water"),
            ],
            gate_input: Some(0),
            gate_driver_line: Some(5),
            trial_flag_line: Some(7),
            motor_channel: Some(0),
            motor_voltage_range: [0.001, 4.999],
        }
    }
}

impl HardwareConfig {
    /// Samples per channel in one block.
    pub fn buffer_size(&self) -> DaqResult<usize> {
        let total = u64::from(self.sampling_rate_hz) * u64::from(self.buffer_time_ms);
        if self.buffer_time_ms == 0 || total % 1000 != 0 || total == 0 {
            return Err(DaqError::HardwareConfig(format!(
                "{} Hz over {} ms is not a whole number of samples per block",
                self.sampling_rate_hz, self.buffer_time_ms
            )));
        }
        Ok((total / 1000) as usize)
    }

    /// Blocks delivered each second.
    pub fn buffers_per_second(&self) -> DaqResult<u32> {
        if self.buffer_time_ms == 0 || 1000 % self.buffer_time_ms != 0 {
            return Err(DaqError::HardwareConfig(format!(
                "buffer time {} ms does not divide one second",
                self.buffer_time_ms
            )));
        }
        Ok(1000 / self.buffer_time_ms)
    }

    /// Block period (`buffer_size / sampling_rate`).
    pub fn period(&self) -> Duration {
        Duration::from_millis(u64::from(self.buffer_time_ms))
    }

    /// Check layout and timing.
    pub fn validate(&self) -> DaqResult<()> {
        if self.sampling_rate_hz == 0 {
            return Err(DaqError::HardwareConfig("sampling rate must be positive".into()));
        }
        self.buffer_size()?;
        self.buffers_per_second()?;

        if self.analog_inputs.is_empty() {
            return Err(DaqError::HardwareConfig(
                "at least one analog input is required (it is the master clock)".into(),
            ));
        }
        check_unique_ids("analog input", &self.analog_inputs)?;
        check_unique_ids("digital input", &self.digital_inputs)?;

        if let Some(row) = self.gate_input {
            if row >= self.digital_inputs.len() {
                return Err(DaqError::HardwareConfig(format!(
                    "gate_input row {row} is outside the {} digital inputs",
                    self.digital_inputs.len()
                )));
            }
        }

        for (label, range) in [
            ("analog_voltage_range", self.analog_voltage_range),
            ("motor_voltage_range", self.motor_voltage_range),
        ] {
            if !(range[0] < range[1]) {
                return Err(DaqError::HardwareConfig(format!(
                    "{label} [{}, {}] is empty",
                    range[0], range[1]
                )));
            }
        }
        Ok(())
    }

    /// Column labels for the analog series.
    pub fn analog_labels(&self) -> Vec<String> {
        self.analog_inputs.iter().map(|c| c.name.clone()).collect()
    }

    /// Column labels for the digital series.
    pub fn digital_labels(&self) -> Vec<String> {
        self.digital_inputs.iter().map(|c| c.name.clone()).collect()
    }
}

fn check_unique_ids(kind: &str, channels: &[ChannelSpec]) -> DaqResult<()> {
    let mut seen = HashSet::new();
    for channel in channels {
        if !seen.insert(channel.id) {
            return Err(DaqError::HardwareConfig(format!(
                "duplicate {kind} id {}",
                channel.id
            )));
        }
    }
    Ok(())
}

/// Which protocol variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Setup → Habituation → PreferenceTest → Saving → End
    Minimal,
    /// Adds retraction and release around habituation
    #[default]
    BurrowPreference,
    /// Repeated preference trials separated by spout swaps
    SucrosePreference,
    /// Setup → Training until the reward limit → Saving → End
    LickTraining,
}

/// Manipulation applied between two sucrose preference trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapAction {
    /// Physically swap the spouts
    Rotate,
    /// Sham swap with identical timing
    Deceive,
}

/// A command issued by the acquisition loop when a phase is first observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutput {
    /// Phase whose entry triggers the command
    pub phase: BehaviorPhase,
    /// Output to drive
    pub command: OutputCommand,
}

/// Protocol selection and phase durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Protocol variant
    pub kind: ProtocolKind,
    /// Habituation length
    #[serde(with = "humantime_serde")]
    pub habituation_duration: Duration,
    /// Preference test length (per trial for the sucrose protocol)
    #[serde(with = "humantime_serde")]
    pub behavior_duration: Duration,
    /// Retraction length
    #[serde(with = "humantime_serde")]
    pub retract_duration: Duration,
    /// Release length
    #[serde(with = "humantime_serde")]
    pub release_duration: Duration,
    /// Pause after each trial before the spout manipulation
    #[serde(with = "humantime_serde")]
    pub swap_duration: Duration,
    /// Spout rotation length
    #[serde(with = "humantime_serde")]
    pub rotate_duration: Duration,
    /// Sham rotation length
    #[serde(with = "humantime_serde")]
    pub deceive_duration: Duration,
    /// Number of preference trials (sucrose protocol)
    pub num_trials: u32,
    /// Manipulation before trials 2..=num_trials
    pub swap_order: Vec<SwapAction>,
    /// Upper bound on how long the state machine sleeps between evaluations
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// Output commands issued when a phase is first observed
    pub phase_outputs: Vec<PhaseOutput>,
    /// Rewards delivered before lick training ends
    pub rewards_allowed: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            kind: ProtocolKind::default(),
            habituation_duration: Duration::from_secs(5),
            behavior_duration: Duration::from_secs(5),
            retract_duration: Duration::from_secs(5),
            release_duration: Duration::from_secs(5),
            swap_duration: Duration::from_secs(5),
            rotate_duration: Duration::from_secs(5),
            deceive_duration: Duration::from_secs(5),
            num_trials: 4,
            swap_order: vec![SwapAction::Rotate, SwapAction::Deceive, SwapAction::Rotate],
            tick: Duration::from_millis(10),
            phase_outputs: Vec::new(),
            // 1 mL at 3.8 uL per reward
            rewards_allowed: 263,
        }
    }
}

impl ProtocolConfig {
    /// Config for the minimal protocol with the given habituation and test lengths.
    pub fn minimal(habituation: Duration, behavior: Duration) -> Self {
        Self {
            kind: ProtocolKind::Minimal,
            habituation_duration: habituation,
            behavior_duration: behavior,
            ..Default::default()
        }
    }

    /// Config for lick training ending after `rewards_allowed` rewards.
    pub fn lick_training(rewards_allowed: u64) -> Self {
        Self {
            kind: ProtocolKind::LickTraining,
            rewards_allowed,
            ..Default::default()
        }
    }
}

/// Acquisition loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Publish progress every N blocks
    pub progress_period_blocks: u64,
    /// Longest the loop waits for the state machine to see a sync window
    #[serde(with = "humantime_serde")]
    pub sync_handshake_timeout: Duration,
    /// Session length used to pre-size the buffers; estimated from the protocol when unset
    #[serde(with = "humantime_serde")]
    pub expected_duration: Option<Duration>,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            progress_period_blocks: 1,
            sync_handshake_timeout: Duration::from_millis(5),
            expected_duration: None,
        }
    }
}

/// Behavioral camera synchronization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Whether camera sync runs at all
    pub enabled: bool,
    /// Recording starts when this phase is first completed
    pub record_after: BehaviorPhase,
    /// Longest the flush waits for every camera to report flushed
    #[serde(with = "humantime_serde")]
    pub flush_timeout: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            record_after: BehaviorPhase::Habituation,
            flush_timeout: Duration::from_secs(30),
        }
    }
}

/// Reward valves: the monitor lines that go high while a valve is open, and
/// the driver lines that arm the valves during `Training`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Row of `digital_inputs` monitoring the water valve
    pub water_delivery_input: Option<usize>,
    /// Row of `digital_inputs` monitoring the sucrose valve
    pub sucrose_delivery_input: Option<usize>,
    /// Valve opening time of one water reward
    #[serde(with = "humantime_serde")]
    pub water_reward_duration: Duration,
    /// Valve opening time of one sucrose reward
    #[serde(with = "humantime_serde")]
    pub sucrose_reward_duration: Duration,
    /// Liquid per reward (uL)
    pub reward_volume_ul: f64,
    /// Output line arming the water valve driver
    pub water_driver_line: Option<u32>,
    /// Output line arming the sucrose valve driver
    pub sucrose_driver_line: Option<u32>,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            water_delivery_input: Some(2),
            sucrose_delivery_input: Some(1),
            water_reward_duration: Duration::from_millis(14),
            sucrose_reward_duration: Duration::from_millis(13),
            reward_volume_ul: 3.8,
            water_driver_line: None,
            sucrose_driver_line: None,
        }
    }
}

impl RewardConfig {
    /// Monitor rows with the valve opening time of one reward on each.
    pub fn delivery_inputs(&self) -> Vec<(usize, Duration)> {
        [
            (self.water_delivery_input, self.water_reward_duration),
            (self.sucrose_delivery_input, self.sucrose_reward_duration),
        ]
        .into_iter()
        .filter_map(|(row, duration)| row.map(|row| (row, duration)))
        .collect()
    }

    /// Valve drivers go high on entering `Training` and low again on `Saving`.
    pub fn driver_outputs(&self) -> Vec<PhaseOutput> {
        [self.water_driver_line, self.sucrose_driver_line]
            .into_iter()
            .flatten()
            .flat_map(|line| {
                [
                    PhaseOutput {
                        phase: BehaviorPhase::Training,
                        command: OutputCommand::Digital { line, value: true },
                    },
                    PhaseOutput {
                        phase: BehaviorPhase::Saving,
                        command: OutputCommand::Digital { line, value: false },
                    },
                ]
            })
            .collect()
    }

    /// Liquid dispensed by `rewards` rewards (mL).
    pub fn intake_ml(&self, rewards: u64) -> f64 {
        rewards as f64 * self.reward_volume_ul / 1000.0
    }

    fn validate(&self, hardware: &HardwareConfig) -> DaqResult<()> {
        for (row, duration) in self.delivery_inputs() {
            if row >= hardware.digital_inputs.len() {
                return Err(DaqError::HardwareConfig(format!(
                    "reward delivery row {row} is outside the {} digital inputs",
                    hardware.digital_inputs.len()
                )));
            }
            if duration.is_zero() {
                return Err(DaqError::InvalidConfiguration(
                    "reward durations must be positive".into(),
                ));
            }
        }
        if !(self.reward_volume_ul.is_finite() && self.reward_volume_ul > 0.0) {
            return Err(DaqError::InvalidConfiguration(format!(
                "reward_volume_ul must be positive, got {}",
                self.reward_volume_ul
            )));
        }
        Ok(())
    }
}

impl RigConfig {
    /// Load configuration from a TOML file layered over defaults and the environment.
    ///
    /// Environment variables override the file, e.g.
    /// `BEHAVIOR_DAQ_SESSION__ANIMAL_ID=M042`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        Ok(Self::figment()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEHAVIOR_DAQ_").split("__"))
            .extract()?)
    }

    /// Parse configuration from a TOML string layered over defaults.
    pub fn from_toml_str(toml: &str) -> DaqResult<Self> {
        Ok(Self::figment().merge(Toml::string(toml)).extract()?)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(RigConfig::default()))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> DaqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.session.log_level.to_lowercase().as_str()) {
            return Err(DaqError::InvalidConfiguration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.session.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.session.animal_id.trim().is_empty() {
            return Err(DaqError::InvalidConfiguration(
                "animal_id must not be empty".into(),
            ));
        }

        if self.acquisition.progress_period_blocks == 0 {
            return Err(DaqError::InvalidConfiguration(
                "progress_period_blocks must be at least 1".into(),
            ));
        }

        self.hardware.validate()?;
        self.rewards.validate(&self.hardware)?;
        if self.protocol.kind == ProtocolKind::LickTraining
            && self.rewards.delivery_inputs().is_empty()
        {
            return Err(DaqError::InvalidConfiguration(
                "lick training needs at least one reward delivery input".into(),
            ));
        }

        for output in &self.protocol.phase_outputs {
            if let OutputCommand::Analog { channel, value } = output.command {
                if Some(channel) == self.hardware.motor_channel {
                    let [lo, hi] = self.hardware.motor_voltage_range;
                    if value < lo || value > hi {
                        return Err(DaqError::InvalidConfiguration(format!(
                            "motor command {value} V for {} is outside [{lo}, {hi}]",
                            output.phase
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
