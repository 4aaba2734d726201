//! Hardware boundary.
//!
//! The vendor DAQ driver is consumed only through [`DaqDriver`]. The
//! acquisition thread owns the driver for the whole session; once the loop
//! stops, ownership moves to the flush, which stops and releases it.
//!
//! Block reads return [`HardwareReadError`] so the loop can absorb a single
//! late or malformed block without tearing down the session. Output writes
//! made during acquisition are logged and counted, never fatal. Start, stop
//! and release failures are fatal and use [`DaqError`].

pub mod mock;

pub use mock::{MockDaq, MockDaqHandle};

use serde::{Deserialize, Serialize};

use crate::acquisition::block::{AnalogBlock, DigitalBlock};
use crate::error::{DaqError, DaqResult, HardwareReadError};

/// A single output write issued by the acquisition loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputCommand {
    /// Drive a digital output line.
    Digital {
        /// Line number.
        line: u32,
        /// High when true.
        value: bool,
    },
    /// Set an analog output.
    Analog {
        /// Output channel.
        channel: u32,
        /// Voltage (V).
        value: f64,
    },
}

/// Multichannel acquisition card with a hardware sample clock.
///
/// Implementations are driven from a dedicated thread and must not block for
/// longer than their configured read timeout.
pub trait DaqDriver: Send {
    /// Configure tasks and start the sample clock.
    fn start(&mut self) -> DaqResult<()>;

    /// Read `samples` samples from every analog input, channel-major.
    fn read_analog_block(&mut self, samples: usize) -> Result<AnalogBlock, HardwareReadError>;

    /// Read `samples` samples from every digital input line, channel-major.
    fn read_digital_block(&mut self, samples: usize) -> Result<DigitalBlock, HardwareReadError>;

    /// Drive one digital output line.
    fn write_digital_line(&mut self, line: u32, value: bool) -> DaqResult<()>;

    /// Set one analog output.
    fn write_analog_value(&mut self, channel: u32, value: f64) -> DaqResult<()>;

    /// Stop every running task.
    fn stop(&mut self) -> DaqResult<()>;

    /// Release device handles. Called once, after `stop`.
    fn release(&mut self) -> DaqResult<()>;

    /// Dispatch an [`OutputCommand`] to the matching write.
    fn execute(&mut self, command: &OutputCommand) -> DaqResult<()> {
        match *command {
            OutputCommand::Digital { line, value } => self.write_digital_line(line, value),
            OutputCommand::Analog { channel, value } => self.write_analog_value(channel, value),
        }
    }
}

impl<D: DaqDriver + ?Sized> DaqDriver for Box<D> {
    fn start(&mut self) -> DaqResult<()> {
        (**self).start()
    }

    fn read_analog_block(&mut self, samples: usize) -> Result<AnalogBlock, HardwareReadError> {
        (**self).read_analog_block(samples)
    }

    fn read_digital_block(&mut self, samples: usize) -> Result<DigitalBlock, HardwareReadError> {
        (**self).read_digital_block(samples)
    }

    fn write_digital_line(&mut self, line: u32, value: bool) -> DaqResult<()> {
        (**self).write_digital_line(line, value)
    }

    fn write_analog_value(&mut self, channel: u32, value: f64) -> DaqResult<()> {
        (**self).write_analog_value(channel, value)
    }

    fn stop(&mut self) -> DaqResult<()> {
        (**self).stop()
    }

    fn release(&mut self) -> DaqResult<()> {
        (**self).release()
    }
}

/// Wraps a start-time failure so it is always reported as a configuration error.
pub(crate) fn start_failure(err: DaqError) -> DaqError {
    match err {
        DaqError::HardwareConfig(_) => err,
        other => DaqError::HardwareConfig(other.to_string()),
    }
}
