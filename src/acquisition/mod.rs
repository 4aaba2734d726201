//! Block acquisition: sample blocks, session buffers, the block clock, reward
//! counting and the per-block callback.

pub mod acquisition_loop;
pub mod block;
pub mod buffers;
pub mod clock;
pub mod rewards;

pub use acquisition_loop::{AcquisitionLoop, AcquisitionParts, BlockOutcome, Progress};
pub use block::{AnalogBlock, ChannelBlock, DigitalBlock, SampleBlock};
pub use buffers::AccumulationBuffers;
pub use clock::BlockClock;
pub use rewards::RewardCounter;
