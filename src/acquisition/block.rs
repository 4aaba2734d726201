//! Fixed-size blocks of samples as delivered by the driver.

use crate::behavior::phase::BehaviorPhase;
use crate::error::HardwareReadError;

/// `channels × samples` values stored channel-major in one allocation.
///
/// Row `i` is `data[i * samples..(i + 1) * samples]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBlock<T> {
    channels: usize,
    samples: usize,
    data: Vec<T>,
}

/// Analog voltages (V).
pub type AnalogBlock = ChannelBlock<f64>;

/// Digital line states, 0 or 1.
pub type DigitalBlock = ChannelBlock<u8>;

impl<T: Copy + Default> ChannelBlock<T> {
    /// Wraps driver output, checking its length against the requested shape.
    pub fn from_vec(channels: usize, samples: usize, data: Vec<T>) -> Result<Self, HardwareReadError> {
        let expected = channels * samples;
        if data.len() != expected {
            return Err(HardwareReadError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            channels,
            samples,
            data,
        })
    }

    /// Block filled with `T::default()`.
    pub fn zeros(channels: usize, samples: usize) -> Self {
        Self {
            channels,
            samples,
            data: vec![T::default(); channels * samples],
        }
    }

    /// Number of rows.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples per row.
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// One row of the block.
    ///
    /// # Panics
    /// If `index >= self.channels()`.
    pub fn channel(&self, index: usize) -> &[T] {
        let start = index * self.samples;
        &self.data[start..start + self.samples]
    }

    /// Rows in order.
    pub fn rows(&self) -> impl Iterator<Item = &[T]> + '_ {
        // chunks_exact(0) panics; an empty block has no rows to yield anyway
        let size = self.samples.max(1);
        self.data.chunks_exact(size).take(self.channels)
    }
}

impl DigitalBlock {
    /// Maximum of a line over the block; `None` if the row does not exist.
    pub fn line_max(&self, row: usize) -> Option<u8> {
        if row >= self.channels {
            return None;
        }
        Some(self.channel(row).iter().copied().max().unwrap_or(0))
    }
}

/// One acquired block, labelled with the phase observed while it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    /// Analog channels.
    pub analog: AnalogBlock,
    /// Digital lines.
    pub digital: DigitalBlock,
    /// 1-based invocation count at which this block was read.
    pub sequence_number: u64,
    /// Phase observed during the callback that read it.
    pub phase: BehaviorPhase,
}

impl SampleBlock {
    /// Samples per channel.
    pub fn samples(&self) -> usize {
        self.analog.samples()
    }
}
