//! Mock DAQ Implementation
//!
//! Simulated acquisition card for testing without physical hardware.
//!
//! - Analog inputs return uniform noise inside the configured voltage range.
//! - Digital inputs return random bits, except the gate line which reads high
//!   (closed) unless the read is listed in `gate_open_reads`.
//! - Rows given a reward pulse read high for that many samples at the start
//!   of every block and low after.
//! - Reads listed in `failing_reads` return a timeout; from the read given to
//!   `with_device_lost_at` on, every read reports the device lost.
//! - Digital writes listed in `failing_digital_writes` return an error.
//!
//! Read indices are 1-based and count analog reads, so they line up with the
//! acquisition loop's sequence numbers. Write indices are 1-based and count
//! every `write_digital_line` call, including the ones made by `arm`.
//!
//! Every write and lifecycle call is recorded and can be inspected through a
//! [`MockDaqHandle`] after the driver has been moved into a session.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::acquisition::block::{AnalogBlock, DigitalBlock};
use crate::config::HardwareConfig;
use crate::error::{DaqError, DaqResult, HardwareReadError};
use crate::hardware::DaqDriver;

#[derive(Debug, Default)]
struct MockLog {
    started: bool,
    stopped: bool,
    released: bool,
    analog_reads: u64,
    digital_write_calls: u64,
    digital_writes: Vec<(u32, bool)>,
    analog_writes: Vec<(u32, f64)>,
}

/// Shared view of what a [`MockDaq`] has been asked to do.
#[derive(Debug, Clone)]
pub struct MockDaqHandle {
    log: Arc<Mutex<MockLog>>,
}

impl MockDaqHandle {
    /// Whether `start` succeeded.
    pub fn started(&self) -> bool {
        self.log.lock().started
    }

    /// Whether `stop` was called.
    pub fn stopped(&self) -> bool {
        self.log.lock().stopped
    }

    /// Whether `release` was called.
    pub fn released(&self) -> bool {
        self.log.lock().released
    }

    /// Analog reads attempted so far.
    pub fn analog_reads(&self) -> u64 {
        self.log.lock().analog_reads
    }

    /// `write_digital_line` calls so far, failed ones included.
    pub fn digital_write_calls(&self) -> u64 {
        self.log.lock().digital_write_calls
    }

    /// Digital writes that succeeded, in call order.
    pub fn digital_writes(&self) -> Vec<(u32, bool)> {
        self.log.lock().digital_writes.clone()
    }

    /// Analog writes in call order.
    pub fn analog_writes(&self) -> Vec<(u32, f64)> {
        self.log.lock().analog_writes.clone()
    }

    /// Last value written to a digital line.
    pub fn last_digital(&self, line: u32) -> Option<bool> {
        self.log
            .lock()
            .digital_writes
            .iter()
            .rev()
            .find(|(l, _)| *l == line)
            .map(|(_, v)| *v)
    }
}

/// Simulated acquisition card.
pub struct MockDaq {
    analog_channels: usize,
    digital_lines: usize,
    voltage_range: [f64; 2],
    read_timeout: Duration,
    gate_row: Option<usize>,
    failing_reads: HashSet<u64>,
    lost_from_read: Option<u64>,
    gate_open_reads: HashSet<u64>,
    reward_pulses: HashMap<usize, usize>,
    failing_digital_writes: HashSet<u64>,
    fail_start: bool,
    rng: StdRng,
    log: Arc<Mutex<MockLog>>,
}

impl MockDaq {
    /// Mock with the given number of analog channels and digital lines.
    pub fn new(analog_channels: usize, digital_lines: usize) -> Self {
        Self {
            analog_channels,
            digital_lines,
            voltage_range: [-10.0, 10.0],
            read_timeout: Duration::from_secs(10),
            gate_row: None,
            failing_reads: HashSet::new(),
            lost_from_read: None,
            gate_open_reads: HashSet::new(),
            reward_pulses: HashMap::new(),
            failing_digital_writes: HashSet::new(),
            fail_start: false,
            rng: StdRng::seed_from_u64(0x0b5e_55ed),
            log: Arc::new(Mutex::new(MockLog::default())),
        }
    }

    /// Mock matching a rig's channel layout.
    pub fn from_config(config: &HardwareConfig) -> Self {
        let mut daq = Self::new(config.analog_inputs.len(), config.digital_inputs.len());
        daq.voltage_range = config.analog_voltage_range;
        daq.read_timeout = config.read_timeout;
        daq.gate_row = config.gate_input;
        daq
    }

    /// Make the given 1-based reads time out.
    pub fn with_failing_reads(mut self, reads: impl IntoIterator<Item = u64>) -> Self {
        self.failing_reads.extend(reads);
        self
    }

    /// Make the gate line read low (open) during the given 1-based reads.
    pub fn with_gate_open_on(mut self, reads: impl IntoIterator<Item = u64>) -> Self {
        self.gate_open_reads.extend(reads);
        self
    }

    /// Make `start` fail.
    pub fn with_failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Report the device lost from the given 1-based read on.
    pub fn with_device_lost_at(mut self, read: u64) -> Self {
        self.lost_from_read = Some(read);
        self
    }

    /// Make digital row `row` read `high_samples` high samples per block.
    pub fn with_reward_pulse(mut self, row: usize, high_samples: usize) -> Self {
        self.reward_pulses.insert(row, high_samples);
        self
    }

    /// Make the given 1-based `write_digital_line` calls fail.
    pub fn with_failing_digital_writes(mut self, calls: impl IntoIterator<Item = u64>) -> Self {
        self.failing_digital_writes.extend(calls);
        self
    }

    /// Handle for inspecting calls after the driver is moved.
    pub fn handle(&self) -> MockDaqHandle {
        MockDaqHandle {
            log: Arc::clone(&self.log),
        }
    }

    fn current_read(&self) -> u64 {
        self.log.lock().analog_reads
    }
}

impl DaqDriver for MockDaq {
    fn start(&mut self) -> DaqResult<()> {
        if self.fail_start {
            return Err(DaqError::HardwareConfig(
                "mock device refused to start".to_string(),
            ));
        }
        self.log.lock().started = true;
        tracing::debug!(
            analog = self.analog_channels,
            digital = self.digital_lines,
            "MockDaq started"
        );
        Ok(())
    }

    fn read_analog_block(&mut self, samples: usize) -> Result<AnalogBlock, HardwareReadError> {
        let read = {
            let mut log = self.log.lock();
            log.analog_reads += 1;
            log.analog_reads
        };
        if self.lost_from_read.is_some_and(|lost| read >= lost) {
            return Err(HardwareReadError::DeviceLost(
                "mock device disconnected".to_string(),
            ));
        }
        if self.failing_reads.contains(&read) {
            return Err(HardwareReadError::Timeout {
                requested: samples,
                timeout: self.read_timeout,
            });
        }

        let [lo, hi] = self.voltage_range;
        let data = (0..self.analog_channels * samples)
            .map(|_| self.rng.gen_range(lo..hi))
            .collect();
        AnalogBlock::from_vec(self.analog_channels, samples, data)
    }

    fn read_digital_block(&mut self, samples: usize) -> Result<DigitalBlock, HardwareReadError> {
        let read = self.current_read();
        let gate_open = self.gate_open_reads.contains(&read);

        let mut data = Vec::with_capacity(self.digital_lines * samples);
        for row in 0..self.digital_lines {
            if Some(row) == self.gate_row {
                let level = u8::from(!gate_open);
                data.extend(std::iter::repeat(level).take(samples));
            } else if let Some(&high) = self.reward_pulses.get(&row) {
                data.extend((0..samples).map(|i| u8::from(i < high)));
            } else {
                data.extend((0..samples).map(|_| u8::from(self.rng.gen_bool(0.5))));
            }
        }
        DigitalBlock::from_vec(self.digital_lines, samples, data)
    }

    fn write_digital_line(&mut self, line: u32, value: bool) -> DaqResult<()> {
        let mut log = self.log.lock();
        log.digital_write_calls += 1;
        if self.failing_digital_writes.contains(&log.digital_write_calls) {
            return Err(DaqError::HardwareWrite(format!(
                "mock write to line {line} failed"
            )));
        }
        log.digital_writes.push((line, value));
        Ok(())
    }

    fn write_analog_value(&mut self, channel: u32, value: f64) -> DaqResult<()> {
        self.log.lock().analog_writes.push((channel, value));
        Ok(())
    }

    fn stop(&mut self) -> DaqResult<()> {
        self.log.lock().stopped = true;
        Ok(())
    }

    fn release(&mut self) -> DaqResult<()> {
        self.log.lock().released = true;
        tracing::debug!("MockDaq released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_reads_are_one_based() {
        let mut daq = MockDaq::new(2, 1).with_failing_reads([2]);
        assert!(daq.read_analog_block(10).is_ok());
        assert!(matches!(
            daq.read_analog_block(10),
            Err(HardwareReadError::Timeout { requested: 10, .. })
        ));
        assert!(daq.read_analog_block(10).is_ok());
        assert_eq!(daq.handle().analog_reads(), 3);
    }

    #[test]
    fn analog_noise_stays_in_range() {
        let mut daq = MockDaq::from_config(&HardwareConfig::default());
        let block = daq.read_analog_block(100).unwrap();
        assert_eq!(block.channels(), 4);
        assert!(block.rows().flatten().all(|v| (-10.0..10.0).contains(v)));
    }

    #[test]
    fn gate_reads_low_only_when_opened() {
        let mut daq = MockDaq::from_config(&HardwareConfig::default()).with_gate_open_on([2]);
        daq.read_analog_block(5).unwrap();
        let closed = daq.read_digital_block(5).unwrap();
        assert_eq!(closed.line_max(0), Some(1));

        daq.read_analog_block(5).unwrap();
        let open = daq.read_digital_block(5).unwrap();
        assert_eq!(open.line_max(0), Some(0));
    }

    #[test]
    fn handle_sees_lifecycle() {
        let mut daq = MockDaq::new(1, 1);
        let handle = daq.handle();
        daq.start().unwrap();
        daq.write_digital_line(5, true).unwrap();
        daq.stop().unwrap();
        daq.release().unwrap();
        assert!(handle.started() && handle.stopped() && handle.released());
        assert_eq!(handle.last_digital(5), Some(true));
    }

    #[test]
    fn device_lost_sticks() {
        let mut daq = MockDaq::new(1, 1).with_device_lost_at(2);
        assert!(daq.read_analog_block(4).is_ok());
        assert!(matches!(daq.read_analog_block(4), Err(HardwareReadError::DeviceLost(_))));
        assert!(matches!(daq.read_analog_block(4), Err(HardwareReadError::DeviceLost(_))));
    }

    #[test]
    fn reward_pulse_is_deterministic() {
        let mut daq = MockDaq::new(1, 3).with_reward_pulse(2, 3);
        daq.read_analog_block(10).unwrap();
        let block = daq.read_digital_block(10).unwrap();
        assert_eq!(block.channel(2), &[1, 1, 1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn failing_write_is_not_recorded() {
        let mut daq = MockDaq::new(1, 1).with_failing_digital_writes([2]);
        let handle = daq.handle();
        daq.write_digital_line(7, false).unwrap();
        assert!(daq.write_digital_line(7, true).is_err());
        daq.write_digital_line(7, true).unwrap();
        assert_eq!(handle.digital_write_calls(), 3);
        assert_eq!(handle.digital_writes(), vec![(7, false), (7, true)]);
    }

    #[test]
    fn failing_start_is_a_config_error() {
        let mut daq = MockDaq::new(1, 1).with_failing_start();
        assert!(matches!(daq.start(), Err(DaqError::HardwareConfig(_))));
    }
}
