//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use behavior_daq::config::{ProtocolConfig, ProtocolKind, RigConfig, SwapAction};

/// 1 kHz, 10 ms blocks: fast enough for tests, same code paths as the rig.
pub fn fast_rig() -> RigConfig {
    let mut config = RigConfig::default();
    config.session.animal_id = "MTest".to_string();
    config.hardware.sampling_rate_hz = 1000;
    config.hardware.buffer_time_ms = 10;
    config.acquisition.progress_period_blocks = 1;
    config.protocol.tick = Duration::from_millis(5);
    config
}

pub fn minimal_rig(habituation_ms: u64, behavior_ms: u64) -> RigConfig {
    let mut config = fast_rig();
    config.protocol = ProtocolConfig {
        tick: Duration::from_millis(5),
        ..ProtocolConfig::minimal(
            Duration::from_millis(habituation_ms),
            Duration::from_millis(behavior_ms),
        )
    };
    config
}

pub fn burrow_rig(phase_ms: u64) -> RigConfig {
    let mut config = fast_rig();
    let phase = Duration::from_millis(phase_ms);
    config.protocol.kind = ProtocolKind::BurrowPreference;
    config.protocol.retract_duration = phase;
    config.protocol.habituation_duration = phase;
    config.protocol.release_duration = phase;
    config.protocol.behavior_duration = phase;
    config
}

pub fn sucrose_rig(phase_ms: u64, swap_order: Vec<SwapAction>) -> RigConfig {
    let mut config = burrow_rig(phase_ms);
    let phase = Duration::from_millis(phase_ms);
    config.protocol.kind = ProtocolKind::SucrosePreference;
    config.protocol.num_trials = swap_order.len() as u32 + 1;
    config.protocol.swap_order = swap_order;
    config.protocol.swap_duration = phase;
    config.protocol.rotate_duration = phase;
    config.protocol.deceive_duration = phase;
    config
}

/// Lick training with 2 ms rewards on both monitor lines and both valve drivers wired.
pub fn lick_rig(rewards_allowed: u64) -> RigConfig {
    let mut config = fast_rig();
    config.protocol = ProtocolConfig {
        tick: Duration::from_millis(5),
        ..ProtocolConfig::lick_training(rewards_allowed)
    };
    config.rewards.water_delivery_input = Some(2);
    config.rewards.sucrose_delivery_input = Some(1);
    config.rewards.water_reward_duration = Duration::from_millis(2);
    config.rewards.sucrose_reward_duration = Duration::from_millis(2);
    config.rewards.water_driver_line = Some(2);
    config.rewards.sucrose_driver_line = Some(3);
    config
}
