//! Session-long accumulation of acquired blocks.

use crate::acquisition::block::SampleBlock;
use crate::behavior::phase::BehaviorPhase;
use crate::error::HardwareReadError;

/// Growing per-channel buffers for one session.
///
/// Owned by the acquisition thread while the session runs and handed to the
/// flush once acquisition has stopped. Appends are amortized O(samples); the
/// vectors are pre-sized from the expected session length so a normal run
/// does not reallocate.
#[derive(Debug, Clone)]
pub struct AccumulationBuffers {
    samples_per_block: usize,
    analog: Vec<Vec<f64>>,
    digital: Vec<Vec<u8>>,
    phase_labels: Vec<BehaviorPhase>,
    block_sequence: Vec<u64>,
    skipped: Vec<u64>,
    catch_times_ms: Vec<f64>,
}

impl AccumulationBuffers {
    /// Buffers for `analog_channels` and `digital_lines`, sized for `expected_blocks`.
    pub fn with_capacity(
        analog_channels: usize,
        digital_lines: usize,
        samples_per_block: usize,
        expected_blocks: usize,
    ) -> Self {
        let samples = samples_per_block * expected_blocks;
        Self {
            samples_per_block,
            analog: (0..analog_channels).map(|_| Vec::with_capacity(samples)).collect(),
            digital: (0..digital_lines).map(|_| Vec::with_capacity(samples)).collect(),
            phase_labels: Vec::with_capacity(expected_blocks),
            block_sequence: Vec::with_capacity(expected_blocks),
            skipped: Vec::new(),
            catch_times_ms: Vec::with_capacity(expected_blocks),
        }
    }

    /// Append a block along the time axis.
    ///
    /// The block must match the configured channel counts and block length.
    pub fn append(&mut self, block: &SampleBlock) -> Result<(), HardwareReadError> {
        let expected_analog = self.analog.len() * self.samples_per_block;
        let expected_digital = self.digital.len() * self.samples_per_block;
        if block.analog.channels() != self.analog.len() || block.samples() != self.samples_per_block {
            return Err(HardwareReadError::ShapeMismatch {
                expected: expected_analog,
                actual: block.analog.channels() * block.analog.samples(),
            });
        }
        if block.digital.channels() != self.digital.len()
            || block.digital.samples() != self.samples_per_block
        {
            return Err(HardwareReadError::ShapeMismatch {
                expected: expected_digital,
                actual: block.digital.channels() * block.digital.samples(),
            });
        }

        for (column, row) in self.analog.iter_mut().zip(block.analog.rows()) {
            column.extend_from_slice(row);
        }
        for (column, row) in self.digital.iter_mut().zip(block.digital.rows()) {
            column.extend_from_slice(row);
        }
        self.phase_labels.push(block.phase);
        self.block_sequence.push(block.sequence_number);
        Ok(())
    }

    /// Record a sequence number whose block was never stored.
    pub fn record_gap(&mut self, sequence_number: u64) {
        self.skipped.push(sequence_number);
    }

    /// Record how long one callback took, in milliseconds.
    pub fn record_catch_time(&mut self, millis: f64) {
        self.catch_times_ms.push(millis);
    }

    /// Blocks stored.
    pub fn blocks_stored(&self) -> usize {
        self.block_sequence.len()
    }

    /// Samples per channel stored.
    pub fn samples_per_channel(&self) -> usize {
        self.blocks_stored() * self.samples_per_block
    }

    /// Samples per channel in one block.
    pub fn samples_per_block(&self) -> usize {
        self.samples_per_block
    }

    /// Analog columns, one per channel.
    pub fn analog(&self) -> &[Vec<f64>] {
        &self.analog
    }

    /// Digital columns, one per line.
    pub fn digital(&self) -> &[Vec<u8>] {
        &self.digital
    }

    /// Phase label of every stored block.
    pub fn phase_labels(&self) -> &[BehaviorPhase] {
        &self.phase_labels
    }

    /// Sequence number of every stored block.
    pub fn block_sequence(&self) -> &[u64] {
        &self.block_sequence
    }

    /// Sequence numbers of failed reads.
    pub fn skipped(&self) -> &[u64] {
        &self.skipped
    }

    /// Callback latencies in milliseconds, one per invocation.
    pub fn catch_times_ms(&self) -> &[f64] {
        &self.catch_times_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::block::{AnalogBlock, DigitalBlock};

    fn block(seq: u64, phase: BehaviorPhase, fill: f64) -> SampleBlock {
        SampleBlock {
            analog: AnalogBlock::from_vec(2, 3, vec![fill; 6]).unwrap(),
            digital: DigitalBlock::zeros(1, 3),
            sequence_number: seq,
            phase,
        }
    }

    #[test]
    fn append_grows_every_channel_along_time() {
        let mut buffers = AccumulationBuffers::with_capacity(2, 1, 3, 4);
        buffers.append(&block(1, BehaviorPhase::Setup, 1.0)).unwrap();
        buffers.append(&block(2, BehaviorPhase::Habituation, 2.0)).unwrap();

        assert_eq!(buffers.blocks_stored(), 2);
        assert_eq!(buffers.samples_per_channel(), 6);
        assert_eq!(buffers.analog()[1], vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert_eq!(buffers.digital()[0].len(), 6);
        assert_eq!(
            buffers.phase_labels(),
            &[BehaviorPhase::Setup, BehaviorPhase::Habituation]
        );
        assert_eq!(buffers.block_sequence(), &[1, 2]);
    }

    #[test]
    fn gaps_are_kept_apart_from_stored_blocks() {
        let mut buffers = AccumulationBuffers::with_capacity(2, 1, 3, 4);
        buffers.append(&block(1, BehaviorPhase::Setup, 0.0)).unwrap();
        buffers.record_gap(2);
        buffers.append(&block(3, BehaviorPhase::Setup, 0.0)).unwrap();

        assert_eq!(buffers.blocks_stored(), 2);
        assert_eq!(buffers.skipped(), &[2]);
        assert_eq!(buffers.block_sequence(), &[1, 3]);
    }

    #[test]
    fn mismatched_block_is_rejected_without_partial_append() {
        let mut buffers = AccumulationBuffers::with_capacity(3, 1, 3, 4);
        assert!(buffers.append(&block(1, BehaviorPhase::Setup, 0.0)).is_err());
        assert_eq!(buffers.blocks_stored(), 0);
        assert!(buffers.analog().iter().all(Vec::is_empty));
    }

    #[test]
    fn presizing_avoids_reallocation() {
        let mut buffers = AccumulationBuffers::with_capacity(2, 1, 3, 10);
        let capacity = buffers.analog()[0].capacity();
        for seq in 1..=10 {
            buffers.append(&block(seq, BehaviorPhase::Setup, 0.0)).unwrap();
        }
        assert_eq!(buffers.analog()[0].capacity(), capacity);
    }
}
