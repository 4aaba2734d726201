//! Mock camera recorder.
//!
//! Counts every call and reports flushed a fixed delay after the flush
//! request, or never.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::behavior::phase::BehaviorPhase;
use crate::camera::CameraRecorder;

#[derive(Debug, Default)]
struct CameraLog {
    recording: bool,
    recording_changes: u64,
    tags: u64,
    last_tag: Option<(BehaviorPhase, u64)>,
    flush_requests: u64,
    flushed_polls: u64,
}

/// Shared view of what a [`MockCamera`] has been asked to do.
#[derive(Debug, Clone)]
pub struct MockCameraHandle {
    log: Arc<Mutex<CameraLog>>,
}

impl MockCameraHandle {
    /// Current recording state.
    pub fn is_recording(&self) -> bool {
        self.log.lock().recording
    }

    /// Number of `set_recording` calls.
    pub fn recording_changes(&self) -> u64 {
        self.log.lock().recording_changes
    }

    /// Number of `tag` calls.
    pub fn tags(&self) -> u64 {
        self.log.lock().tags
    }

    /// Most recent tag.
    pub fn last_tag(&self) -> Option<(BehaviorPhase, u64)> {
        self.log.lock().last_tag
    }

    /// Number of `request_flush` calls.
    pub fn flush_requests(&self) -> u64 {
        self.log.lock().flush_requests
    }

    /// Calls of any kind.
    pub fn total_calls(&self) -> u64 {
        let log = self.log.lock();
        log.recording_changes + log.tags + log.flush_requests + log.flushed_polls
    }
}

/// In-memory camera.
pub struct MockCamera {
    name: String,
    flush_delay: Option<Duration>,
    flush_requested_at: Option<Instant>,
    log: Arc<Mutex<CameraLog>>,
}

impl MockCamera {
    /// Camera that flushes immediately.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flush_delay: Some(Duration::ZERO),
            flush_requested_at: None,
            log: Arc::new(Mutex::new(CameraLog::default())),
        }
    }

    /// Report flushed `delay` after the request.
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = Some(delay);
        self
    }

    /// Never report flushed.
    pub fn never_flush(mut self) -> Self {
        self.flush_delay = None;
        self
    }

    /// Handle for inspecting calls after the camera is moved.
    pub fn handle(&self) -> MockCameraHandle {
        MockCameraHandle {
            log: Arc::clone(&self.log),
        }
    }
}

impl CameraRecorder for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_recording(&mut self, recording: bool) {
        let mut log = self.log.lock();
        log.recording = recording;
        log.recording_changes += 1;
    }

    fn tag(&mut self, phase: BehaviorPhase, buffer_index: u64) {
        let mut log = self.log.lock();
        log.tags += 1;
        log.last_tag = Some((phase, buffer_index));
    }

    fn request_flush(&mut self) {
        self.log.lock().flush_requests += 1;
        self.flush_requested_at = Some(Instant::now());
    }

    fn is_flushed(&self) -> bool {
        self.log.lock().flushed_polls += 1;
        match (self.flush_requested_at, self.flush_delay) {
            (Some(at), Some(delay)) => at.elapsed() >= delay,
            _ => false,
        }
    }
}
