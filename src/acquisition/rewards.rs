//! Reward counting from the valve monitor lines.
//!
//! A monitor line reads high while its valve is open, so the number of
//! rewards in a block is the number of high samples divided by the samples
//! one reward keeps the valve open, rounded down. Each block is counted on
//! its own.

use std::time::Duration;

use crate::acquisition::block::DigitalBlock;
use crate::config::RewardConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MonitorLine {
    row: usize,
    samples_per_reward: u64,
}

/// Counts rewards delivered on every configured monitor line.
#[derive(Debug, Clone, Default)]
pub struct RewardCounter {
    lines: Vec<MonitorLine>,
    delivered: u64,
}

impl RewardCounter {
    /// Counter for the monitor rows in `config` sampled at `sampling_rate_hz`.
    pub fn new(config: &RewardConfig, sampling_rate_hz: u32) -> Self {
        let lines = config
            .delivery_inputs()
            .into_iter()
            .map(|(row, duration)| MonitorLine {
                row,
                samples_per_reward: reward_samples(duration, sampling_rate_hz),
            })
            .collect();
        Self {
            lines,
            delivered: 0,
        }
    }

    /// Whether any monitor line is configured.
    pub fn is_enabled(&self) -> bool {
        !self.lines.is_empty()
    }

    /// Rewards in `digital`, added to the running total.
    pub fn count(&mut self, digital: &DigitalBlock) -> u64 {
        let rewards: u64 = self
            .lines
            .iter()
            .filter(|line| line.row < digital.channels())
            .map(|line| {
                let high: u64 = digital.channel(line.row).iter().map(|&v| u64::from(v)).sum();
                high / line.samples_per_reward
            })
            .sum();
        self.delivered += rewards;
        rewards
    }

    /// Rewards counted so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

fn reward_samples(duration: Duration, sampling_rate_hz: u32) -> u64 {
    let samples = (duration.as_secs_f64() * f64::from(sampling_rate_hz)).round() as u64;
    samples.max(1)
}
