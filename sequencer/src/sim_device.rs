//! Simulated camera
//!
//! In-process stand-in for the native driver. Exposures sleep for a scaled
//! duration and write a small placeholder frame to each output path. Every call
//! is recorded so a session can be inspected afterwards.

use crate::device_ops::{
    DeviceError, DeviceOps, DeviceResult, Dimensions, ExposureState, ExposureStatus,
    MechanismKind, SlidePosition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// One recorded device call
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    ConfigureDimensions(Dimensions),
    MoveFilterWheel(u32),
    MoveMechanism(MechanismKind, SlidePosition),
    Expose {
        open_shutter: bool,
        duration_ms: u64,
        output_paths: Vec<PathBuf>,
    },
    AbortExposure,
    AbortMotion,
}

#[derive(Default)]
struct SimState {
    dimensions: Option<Dimensions>,
    filter_position: Option<u32>,
    slides: HashMap<MechanismKind, SlidePosition>,
    exposure: ExposureStatus,
    exposure_started: Option<Instant>,
    calls: Vec<DeviceCall>,
}

pub struct SimulatedCamera {
    state: Mutex<SimState>,
    abort: Notify,
    time_scale: f64,
    temperature_c: f64,
}

impl SimulatedCamera {
    /// `time_scale` is the fraction of each requested exposure actually slept
    pub fn new(time_scale: f64) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            abort: Notify::new(),
            time_scale: time_scale.max(0.0),
            temperature_c: -100.0,
        }
    }

    /// Every call made so far, oldest first
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn dimensions(&self) -> Option<Dimensions> {
        self.with_state(|s| s.dimensions.clone())
    }

    pub fn slide(&self, kind: MechanismKind) -> Option<SlidePosition> {
        self.with_state(|s| s.slides.get(&kind).copied())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn record(&self, call: DeviceCall) {
        self.with_state(|s| s.calls.push(call));
    }

    fn finish_exposure(&self) {
        self.with_state(|s| {
            s.exposure.state = ExposureState::Idle;
            s.exposure_started = None;
        });
    }

    fn placeholder_frame(&self, open_shutter: bool, duration_ms: u64) -> String {
        let dims = self.dimensions();
        let (cols, rows, bin) = dims
            .map(|d| (d.columns / d.x_bin.max(1), d.rows / d.y_bin.max(1), d.x_bin))
            .unwrap_or((0, 0, 1));
        format!(
            "SIMPLE  = T\nNAXIS1  = {}\nNAXIS2  = {}\nCCDXBIN = {}\nEXPTIME = {:.3}\nSHUTTER = {}\nDATE    = {}\nEND\n",
            cols,
            rows,
            bin,
            duration_ms as f64 / 1000.0,
            if open_shutter { "OPEN" } else { "CLOSED" },
            Utc::now().to_rfc3339(),
        )
    }
}

#[async_trait]
impl DeviceOps for SimulatedCamera {
    async fn configure_dimensions(&self, dimensions: &Dimensions) -> DeviceResult<()> {
        if dimensions.x_bin == 0 || dimensions.y_bin == 0 {
            return Err(DeviceError::InvalidParameter("binning must be non-zero".to_string()));
        }
        self.with_state(|s| {
            s.dimensions = Some(dimensions.clone());
            s.calls.push(DeviceCall::ConfigureDimensions(dimensions.clone()));
        });
        Ok(())
    }

    async fn move_filter_wheel(&self, position: u32) -> DeviceResult<()> {
        self.with_state(|s| {
            s.filter_position = Some(position);
            s.calls.push(DeviceCall::MoveFilterWheel(position));
        });
        Ok(())
    }

    async fn move_mechanism(&self, kind: MechanismKind, position: SlidePosition) -> DeviceResult<()> {
        self.with_state(|s| {
            s.slides.insert(kind, position);
            s.calls.push(DeviceCall::MoveMechanism(kind, position));
        });
        Ok(())
    }

    async fn filter_wheel_position(&self) -> DeviceResult<Option<u32>> {
        Ok(self.with_state(|s| s.filter_position))
    }

    async fn abort_motion(&self) -> DeviceResult<()> {
        self.record(DeviceCall::AbortMotion);
        Ok(())
    }

    async fn expose(
        &self,
        open_shutter: bool,
        start_time: Option<DateTime<Utc>>,
        duration_ms: u64,
        output_paths: &[PathBuf],
    ) -> DeviceResult<()> {
        if output_paths.is_empty() {
            return Err(DeviceError::InvalidParameter("no output path given".to_string()));
        }

        // Register for abort before the exposure becomes visible as in progress,
        // so an abort arriving in between is not lost.
        let aborted = self.abort.notified();
        tokio::pin!(aborted);
        aborted.as_mut().enable();

        self.with_state(|s| {
            s.calls.push(DeviceCall::Expose {
                open_shutter,
                duration_ms,
                output_paths: output_paths.to_vec(),
            });
            s.exposure = ExposureStatus {
                state: ExposureState::Exposing,
                elapsed_ms: 0,
                length_ms: duration_ms,
            };
            s.exposure_started = Some(Instant::now());
        });

        let mut wait = Duration::from_secs_f64(duration_ms as f64 / 1000.0 * self.time_scale);
        if let Some(start) = start_time {
            if let Ok(delay) = (start - Utc::now()).to_std() {
                wait += delay;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = &mut aborted => {
                self.finish_exposure();
                tracing::info!("Simulated exposure aborted");
                return Err(DeviceError::Aborted("exposure aborted".to_string()));
            }
        }

        self.with_state(|s| s.exposure.state = ExposureState::Reading);
        let frame = self.placeholder_frame(open_shutter, duration_ms);
        for path in output_paths {
            if let Err(e) = tokio::fs::write(path, frame.as_bytes()).await {
                self.finish_exposure();
                return Err(DeviceError::Io(format!("{}: {}", path.display(), e)));
            }
        }
        self.finish_exposure();
        Ok(())
    }

    async fn abort_exposure(&self) -> DeviceResult<()> {
        let in_progress = self.with_state(|s| {
            s.calls.push(DeviceCall::AbortExposure);
            if s.exposure.in_progress() {
                s.exposure.state = ExposureState::Aborting;
                true
            } else {
                false
            }
        });
        if in_progress {
            self.abort.notify_waiters();
        }
        Ok(())
    }

    async fn current_exposure_status(&self) -> DeviceResult<ExposureStatus> {
        Ok(self.with_state(|s| {
            let mut status = s.exposure;
            if let Some(started) = s.exposure_started {
                status.elapsed_ms = started.elapsed().as_millis() as u64;
            }
            status
        }))
    }

    async fn current_temperature(&self) -> DeviceResult<f64> {
        Ok(self.temperature_c)
    }
}
