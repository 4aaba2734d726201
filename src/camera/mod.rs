//! Behavioral camera synchronization.
//!
//! Cameras run their own capture loops; the rig only tells them when to
//! record, which phase and buffer each frame belongs to, and when to write
//! their data out. [`CameraSync`] is the boundary adapter used by the
//! acquisition loop and the session flush. When sync is disabled it never
//! touches a camera.

pub mod mock;

pub use mock::{MockCamera, MockCameraHandle};

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::behavior::phase::{BehaviorPhase, PhaseSet};
use crate::config::CameraConfig;
use crate::error::{DaqError, DaqResult};

/// A camera recorder driven by the rig.
pub trait CameraRecorder: Send {
    /// Identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Start or stop keeping frames.
    fn set_recording(&mut self, recording: bool);

    /// Label subsequent frames with the current phase and 0-based buffer index.
    fn tag(&mut self, phase: BehaviorPhase, buffer_index: u64);

    /// Ask the camera to write out everything it has recorded.
    fn request_flush(&mut self);

    /// Whether all recorded data has been written.
    fn is_flushed(&self) -> bool;
}

const FLUSH_POLL_START: Duration = Duration::from_millis(1);
const FLUSH_POLL_MAX: Duration = Duration::from_millis(50);

/// Coordinates every camera on the rig.
pub struct CameraSync {
    enabled: bool,
    record_after: BehaviorPhase,
    flush_timeout: Duration,
    recording: bool,
    cameras: Vec<Box<dyn CameraRecorder>>,
}

impl CameraSync {
    /// Camera sync that never calls a camera.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            record_after: BehaviorPhase::Habituation,
            flush_timeout: Duration::ZERO,
            recording: false,
            cameras: Vec::new(),
        }
    }

    /// Camera sync over `cameras`, honouring `config.enabled`.
    pub fn new(config: &CameraConfig, cameras: Vec<Box<dyn CameraRecorder>>) -> Self {
        if config.enabled && cameras.is_empty() {
            warn!("Camera sync enabled but no cameras attached");
        }
        Self {
            enabled: config.enabled,
            record_after: config.record_after,
            flush_timeout: config.flush_timeout,
            recording: false,
            cameras,
        }
    }

    /// Whether camera sync is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether cameras are currently told to record.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Switch recording. Forwarded to the cameras only when the value changes.
    pub fn set_recording(&mut self, recording: bool) {
        if !self.enabled || self.recording == recording {
            return;
        }
        self.recording = recording;
        for camera in &mut self.cameras {
            camera.set_recording(recording);
        }
        info!(recording, "Camera recording switched");
    }

    /// Tag every camera with the current phase and buffer.
    pub fn tag(&mut self, phase: BehaviorPhase, buffer_index: u64) {
        if !self.enabled {
            return;
        }
        for camera in &mut self.cameras {
            camera.tag(phase, buffer_index);
        }
    }

    /// Per-block update: start recording once the trigger phase has completed, then tag.
    pub fn on_block(&mut self, phase: BehaviorPhase, completed: PhaseSet, buffer_index: u64) {
        if !self.enabled {
            return;
        }
        if !self.recording && completed.contains(self.record_after) {
            self.set_recording(true);
        }
        self.tag(phase, buffer_index);
    }

    /// Stop recording and wait until every camera reports its data flushed.
    ///
    /// Polls with exponential backoff; fails with `CameraTimeout` naming the
    /// first camera still unflushed after `flush_timeout`.
    pub fn flush(&mut self) -> DaqResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.set_recording(false);
        for camera in &mut self.cameras {
            camera.request_flush();
        }

        let started = Instant::now();
        let mut poll = FLUSH_POLL_START;
        loop {
            let pending = self.cameras.iter().find(|c| !c.is_flushed());
            let Some(camera) = pending else {
                debug!(waited = ?started.elapsed(), "Cameras flushed");
                return Ok(());
            };

            let waited = started.elapsed();
            if waited >= self.flush_timeout {
                warn!(camera = camera.name(), ?waited, "Camera flush timed out");
                return Err(DaqError::CameraTimeout {
                    camera: camera.name().to_string(),
                    waited,
                });
            }
            thread::sleep(poll.min(self.flush_timeout - waited));
            poll = (poll * 2).min(FLUSH_POLL_MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(timeout: Duration) -> CameraConfig {
        CameraConfig {
            enabled: true,
            record_after: BehaviorPhase::Habituation,
            flush_timeout: timeout,
        }
    }

    #[test]
    fn disabled_sync_never_calls_cameras() {
        let camera = MockCamera::new("cam_0");
        let handle = camera.handle();
        let mut sync = CameraSync::new(&CameraConfig::default(), vec![Box::new(camera)]);

        let mut completed = PhaseSet::new();
        completed.insert(BehaviorPhase::Habituation);
        sync.on_block(BehaviorPhase::Release, completed, 3);
        sync.set_recording(true);
        sync.flush().unwrap();

        assert_eq!(handle.total_calls(), 0);
    }

    #[test]
    fn recording_switch_is_idempotent() {
        let camera = MockCamera::new("cam_0");
        let handle = camera.handle();
        let mut sync = CameraSync::new(&enabled(Duration::from_secs(1)), vec![Box::new(camera)]);

        sync.set_recording(true);
        sync.set_recording(true);
        sync.set_recording(false);
        assert_eq!(handle.recording_changes(), 2);
    }

    #[test]
    fn recording_starts_after_trigger_phase() {
        let camera = MockCamera::new("cam_0");
        let handle = camera.handle();
        let mut sync = CameraSync::new(&enabled(Duration::from_secs(1)), vec![Box::new(camera)]);

        sync.on_block(BehaviorPhase::Habituation, PhaseSet::new(), 0);
        assert!(!handle.is_recording());

        let mut completed = PhaseSet::new();
        completed.insert(BehaviorPhase::Habituation);
        sync.on_block(BehaviorPhase::Release, completed, 1);
        sync.on_block(BehaviorPhase::Release, completed, 2);
        assert!(handle.is_recording());
        assert_eq!(handle.recording_changes(), 1);
        assert_eq!(handle.last_tag(), Some((BehaviorPhase::Release, 2)));
    }

    #[test]
    fn flush_waits_for_slow_camera() {
        let camera = MockCamera::new("cam_0").with_flush_delay(Duration::from_millis(20));
        let handle = camera.handle();
        let mut sync = CameraSync::new(&enabled(Duration::from_secs(2)), vec![Box::new(camera)]);
        sync.set_recording(true);

        sync.flush().unwrap();
        assert!(!handle.is_recording());
        assert_eq!(handle.flush_requests(), 1);
    }

    #[test]
    fn flush_times_out_on_stuck_camera() {
        let good = MockCamera::new("cam_0");
        let stuck = MockCamera::new("cam_1").never_flush();
        let mut sync = CameraSync::new(
            &enabled(Duration::from_millis(30)),
            vec![Box::new(good), Box::new(stuck)],
        );

        match sync.flush() {
            Err(DaqError::CameraTimeout { camera, waited }) => {
                assert_eq!(camera, "cam_1");
                assert!(waited >= Duration::from_millis(30));
            }
            other => panic!("expected camera timeout, got {other:?}"),
        }
    }
}
