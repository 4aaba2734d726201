//! End-of-session flush.
//!
//! Runs exactly once per session, after acquisition has stopped: stop the
//! driver, write every series and object, flush the cameras, mark saving
//! complete, release the driver. The hardware is released whatever happens;
//! saving is only marked complete when everything was written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::acquisition::AcquisitionParts;
use crate::config::RigConfig;
use crate::error::{DaqError, DaqResult};
use crate::hardware::DaqDriver;
use crate::session::SessionOutcome;
use crate::storage::{Column, Series, SessionStorage};
use crate::sync::SessionSync;

/// Identity and outcome of the session being flushed.
#[derive(Debug, Clone)]
pub struct FlushContext<'a> {
    /// Unique session id.
    pub session_id: Uuid,
    /// Wall-clock start of the session.
    pub started_at: DateTime<Local>,
    /// Rig configuration used for the session.
    pub config: &'a RigConfig,
    /// Protocol that was run.
    pub protocol: &'a str,
    /// How acquisition ended.
    pub outcome: SessionOutcome,
}

/// What the flush wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlushReport {
    /// Storage location.
    pub location: String,
    /// Names written, in order.
    pub written: Vec<String>,
    /// Whether the cameras were flushed.
    pub cameras_flushed: bool,
    /// Time spent flushing.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// One-shot session flush.
#[derive(Debug, Default)]
pub struct SessionFlush {
    performed: AtomicBool,
}

impl SessionFlush {
    /// A flush that has not run yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the flush has been invoked.
    pub fn is_performed(&self) -> bool {
        self.performed.load(Ordering::Acquire)
    }

    /// Persist the session. A second call returns `FlushAlreadyPerformed`.
    #[instrument(skip_all, fields(session = %ctx.session_id, outcome = ?ctx.outcome))]
    pub fn perform<D, S>(
        &self,
        parts: &mut AcquisitionParts<D>,
        storage: &mut S,
        sync: &SessionSync,
        ctx: &FlushContext<'_>,
    ) -> DaqResult<FlushReport>
    where
        D: DaqDriver,
        S: SessionStorage + ?Sized,
    {
        if self.performed.swap(true, Ordering::AcqRel) {
            return Err(DaqError::FlushAlreadyPerformed);
        }
        let started = Instant::now();
        info!(location = %storage.location(), "Flushing session");

        let stopped = parts.driver.stop();
        let written = stopped.and_then(|()| write_all(parts, storage, sync, ctx));
        let flushed = written.and_then(|written| {
            parts.camera.flush()?;
            Ok(written)
        });

        if flushed.is_ok() {
            sync.mark_saving_complete();
        }
        let released = parts.driver.release();

        let written = match flushed {
            Ok(written) => written,
            Err(e) => {
                error!(error = %e, "Session flush failed");
                if let Err(release_err) = released {
                    error!(error = %release_err, "Driver release failed after flush error");
                }
                return Err(e);
            }
        };
        released?;

        let report = FlushReport {
            location: storage.location(),
            written,
            cameras_flushed: parts.camera.is_enabled(),
            elapsed: started.elapsed(),
        };
        info!(elapsed = ?report.elapsed, items = report.written.len(), "Session flushed");
        Ok(report)
    }
}

fn write_all<D, S>(
    parts: &AcquisitionParts<D>,
    storage: &mut S,
    sync: &SessionSync,
    ctx: &FlushContext<'_>,
) -> DaqResult<Vec<String>>
where
    S: SessionStorage + ?Sized,
{
    let buffers = &parts.buffers;
    let hardware = &ctx.config.hardware;
    let mut written = Vec::new();

    let analog = hardware
        .analog_labels()
        .into_iter()
        .zip(buffers.analog())
        .fold(Series::new(), |s, (label, column)| s.with_column(label, Column::F64(column)));
    put(storage, &mut written, "analog", analog)?;

    let digital = hardware
        .digital_labels()
        .into_iter()
        .zip(buffers.digital())
        .fold(Series::new(), |s, (label, column)| s.with_column(label, Column::U8(column)));
    put(storage, &mut written, "digital", digital)?;

    let labels = buffers.phase_labels().iter().map(|p| p.as_str()).collect();
    put(storage, &mut written, "phase_labels", Series::single("phase", Column::Text(labels)))?;
    put(
        storage,
        &mut written,
        "block_sequence",
        Series::single("sequence", Column::U64(buffers.block_sequence())),
    )?;
    put(
        storage,
        &mut written,
        "skipped_blocks",
        Series::single("sequence", Column::U64(buffers.skipped())),
    )?;
    put(
        storage,
        &mut written,
        "daq_catch_times",
        Series::single("latency_ms", Column::F64(buffers.catch_times_ms())),
    )?;

    let snapshot = sync.snapshot();
    let objects = [
        (
            "behavior_config",
            json!({
                "protocol": ctx.protocol,
                "animal_id": ctx.config.session.animal_id,
                "settings": to_json(&ctx.config.protocol)?,
            }),
        ),
        (
            "hardware_config",
            json!({
                "buffer_size": hardware.buffer_size()?,
                "buffers_per_second": hardware.buffers_per_second()?,
                "settings": to_json(hardware)?,
            }),
        ),
        ("phase_log", to_json(&sync.history())?),
        (
            "session_summary",
            json!({
                "session_id": ctx.session_id,
                "animal_id": ctx.config.session.animal_id,
                "protocol": ctx.protocol,
                "outcome": ctx.outcome,
                "started_at": ctx.started_at.to_rfc3339(),
                "flushed_at": Local::now().to_rfc3339(),
                "sequence": parts.sequence,
                "blocks_stored": buffers.blocks_stored(),
                "blocks_skipped": buffers.skipped().len(),
                "samples_per_channel": buffers.samples_per_channel(),
                "sampling_rate_hz": hardware.sampling_rate_hz,
                "final_phase": snapshot.phase,
                "trials_completed": snapshot.trials_completed,
                "write_failures": parts.write_failures,
                "rewards_delivered": parts.rewards_delivered,
                "intake_ml": ctx.config.rewards.intake_ml(parts.rewards_delivered),
            }),
        ),
    ];
    for (name, object) in objects {
        storage.write_object(name, &object)?;
        written.push(name.to_string());
    }
    Ok(written)
}

fn put<S: SessionStorage + ?Sized>(
    storage: &mut S,
    written: &mut Vec<String>,
    name: &str,
    series: Series<'_>,
) -> DaqResult<()> {
    storage.write_series(name, &series)?;
    written.push(name.to_string());
    Ok(())
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> DaqResult<serde_json::Value> {
    serde_json::to_value(value).map_err(DaqError::serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AccumulationBuffers;
    use crate::behavior::phase::BehaviorPhase;
    use crate::camera::{CameraSync, MockCamera};
    use crate::config::CameraConfig;
    use crate::hardware::{MockDaq, MockDaqHandle};
    use crate::storage::MemoryStorage;

    fn parts(camera: CameraSync) -> (AcquisitionParts<MockDaq>, MockDaqHandle) {
        let daq = MockDaq::new(4, 5);
        let handle = daq.handle();
        let mut buffers = AccumulationBuffers::with_capacity(4, 5, 10, 2);
        buffers.record_gap(1);
        (
            AcquisitionParts {
                driver: daq,
                camera,
                buffers,
                sequence: 1,
                read_failures: 1,
                write_failures: 0,
                rewards_delivered: 10,
            },
            handle,
        )
    }

    fn ctx(config: &RigConfig) -> FlushContext<'_> {
        FlushContext {
            session_id: Uuid::new_v4(),
            started_at: Local::now(),
            config,
            protocol: "burrow_preference",
            outcome: SessionOutcome::Completed,
        }
    }

    #[test]
    fn writes_every_item_then_marks_saving_complete() {
        let config = RigConfig::default();
        let sync = SessionSync::new(BehaviorPhase::Saving, Duration::from_millis(1));
        let (mut parts, handle) = parts(CameraSync::disabled());
        let storage = MemoryStorage::new();

        let report = SessionFlush::new()
            .perform(&mut parts, &mut storage.clone(), &sync, &ctx(&config))
            .unwrap();

        assert_eq!(
            report.written,
            vec![
                "analog",
                "digital",
                "phase_labels",
                "block_sequence",
                "skipped_blocks",
                "daq_catch_times",
                "behavior_config",
                "hardware_config",
                "phase_log",
                "session_summary",
            ]
        );
        assert_eq!(storage.series("analog").unwrap().labels.len(), 4);
        assert_eq!(storage.series("skipped_blocks").unwrap().rows(), 1);
        let summary = storage.object("session_summary").unwrap();
        assert_eq!(summary["outcome"], "completed");
        assert_eq!(summary["rewards_delivered"], 10);
        assert!((summary["intake_ml"].as_f64().unwrap() - 0.038).abs() < 1e-9);
        assert!(sync.snapshot().saving_complete);
        assert!(handle.stopped() && handle.released());
    }

    #[test]
    fn second_flush_is_rejected() {
        let config = RigConfig::default();
        let sync = SessionSync::new(BehaviorPhase::Saving, Duration::from_millis(1));
        let (mut parts, _) = parts(CameraSync::disabled());
        let mut storage = MemoryStorage::new();
        let flush = SessionFlush::new();

        flush.perform(&mut parts, &mut storage, &sync, &ctx(&config)).unwrap();
        assert!(flush.is_performed());
        assert!(matches!(
            flush.perform(&mut parts, &mut storage, &sync, &ctx(&config)),
            Err(DaqError::FlushAlreadyPerformed)
        ));
    }

    #[test]
    fn storage_failure_releases_hardware_without_completing() {
        let config = RigConfig::default();
        let sync = SessionSync::new(BehaviorPhase::Saving, Duration::from_millis(1));
        let (mut parts, handle) = parts(CameraSync::disabled());
        let mut storage = MemoryStorage::new().failing_on("digital");

        let err = SessionFlush::new()
            .perform(&mut parts, &mut storage, &sync, &ctx(&config))
            .unwrap_err();
        assert!(matches!(err, DaqError::Serialization(_)));
        assert!(!sync.snapshot().saving_complete);
        assert!(handle.released());
    }

    #[test]
    fn camera_timeout_is_reported() {
        let config = RigConfig::default();
        let sync = SessionSync::new(BehaviorPhase::Saving, Duration::from_millis(1));
        let camera = CameraSync::new(
            &CameraConfig {
                enabled: true,
                flush_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            vec![Box::new(MockCamera::new("cam_0").never_flush())],
        );
        let (mut parts, handle) = parts(camera);
        let mut storage = MemoryStorage::new();

        let err = SessionFlush::new()
            .perform(&mut parts, &mut storage, &sync, &ctx(&config))
            .unwrap_err();
        assert!(matches!(err, DaqError::CameraTimeout { .. }));
        assert!(!sync.snapshot().saving_complete);
        assert!(handle.released());
        // data was written before the camera wait
        assert!(storage.series("analog").is_some());
    }
}
