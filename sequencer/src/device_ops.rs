//! Device Operations Trait
//!
//! This module defines the camera and mechanism interface the core drives.
//! The native driver sits behind [`DeviceOps`]; the core never talks to the
//! hardware any other way.
//!
//! The detector is a single-owner resource. Heavy commands take a
//! [`DeviceLease`] from the [`DeviceHandle`] for their whole lifetime, and a
//! second heavy command arriving while the lease is held fails immediately
//! instead of issuing conflicting calls. Interrupt-class code reaches the
//! device through [`DeviceHandle::ops`] and limits itself to status and abort.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Error type for device operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("Device busy: held by {0}")]
    Busy(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Failed to write frame: {0}")]
    Io(String),
}

/// Readout amplifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amplifier {
    #[default]
    BottomLeft,
    BottomRight,
    TopLeft,
    TopRight,
    All,
}

/// Readout window in unbinned detector pixels, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub x_start: u32,
    pub y_start: u32,
    pub x_end: u32,
    pub y_end: u32,
}

/// Up to four readout windows are supported, selected by `window_flags` bits
pub const MAX_WINDOWS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub columns: u32,
    pub rows: u32,
    pub x_bin: u32,
    pub y_bin: u32,
    pub amplifier: Amplifier,
    pub window_flags: u8,
    pub windows: Vec<Window>,
}

impl Dimensions {
    /// Full frame readout at the given binning
    pub fn full_frame(columns: u32, rows: u32, binning: u32, amplifier: Amplifier) -> Self {
        Self {
            columns,
            rows,
            x_bin: binning,
            y_bin: binning,
            amplifier,
            window_flags: 0,
            windows: Vec::new(),
        }
    }
}

/// Filter slides in front of the wheel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
    LowerSlide,
    UpperSlide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidePosition {
    #[default]
    Stowed,
    Deployed,
}

impl SlidePosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlidePosition::Stowed => "stowed",
            SlidePosition::Deployed => "deployed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureState {
    #[default]
    Idle,
    Exposing,
    Reading,
    Aborting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExposureStatus {
    pub state: ExposureState,
    pub elapsed_ms: u64,
    pub length_ms: u64,
}

impl ExposureStatus {
    /// True while an exposure or its readout is in progress
    pub fn in_progress(&self) -> bool {
        matches!(self.state, ExposureState::Exposing | ExposureState::Reading)
    }
}

/// Trait defining the camera and mechanism operations the core needs
///
/// Implementations wrapping a blocking native library should run those calls
/// through `tokio::task::spawn_blocking`, so the runtime stays free to serve
/// ABORT and GET_STATUS connections while an exposure is running.
#[async_trait]
pub trait DeviceOps: Send + Sync {
    // =========================================================================
    // DETECTOR SETUP
    // =========================================================================

    /// Set readout dimensions, binning, amplifier and windows
    async fn configure_dimensions(&self, dimensions: &Dimensions) -> DeviceResult<()>;

    // =========================================================================
    // MECHANISMS
    // =========================================================================

    /// Move the filter wheel to a position (blocks until in position)
    async fn move_filter_wheel(&self, position: u32) -> DeviceResult<()>;

    /// Move one of the filter slides
    async fn move_mechanism(&self, kind: MechanismKind, position: SlidePosition) -> DeviceResult<()>;

    /// Current filter wheel position, if known
    async fn filter_wheel_position(&self) -> DeviceResult<Option<u32>>;

    /// Stop any mechanism motion in progress
    async fn abort_motion(&self) -> DeviceResult<()>;

    // =========================================================================
    // EXPOSURES
    // =========================================================================

    /// Take an exposure and write it to every output path.
    ///
    /// `start_time` of `None` starts immediately. Returns once the frame has
    /// been read out and written.
    async fn expose(
        &self,
        open_shutter: bool,
        start_time: Option<DateTime<Utc>>,
        duration_ms: u64,
        output_paths: &[PathBuf],
    ) -> DeviceResult<()>;

    /// Abort the exposure in progress; the pending `expose` call returns an error
    async fn abort_exposure(&self) -> DeviceResult<()>;

    async fn current_exposure_status(&self) -> DeviceResult<ExposureStatus>;

    // =========================================================================
    // STATUS
    // =========================================================================

    /// CCD temperature in degrees Celsius
    async fn current_temperature(&self) -> DeviceResult<f64>;
}

pub type SharedDeviceOps = Arc<dyn DeviceOps>;

/// Owner of the single device and its exclusive lease
#[derive(Clone)]
pub struct DeviceHandle {
    ops: SharedDeviceOps,
    lease: Arc<tokio::sync::Mutex<()>>,
    holder: Arc<Mutex<Option<String>>>,
}

impl DeviceHandle {
    pub fn new(ops: SharedDeviceOps) -> Self {
        Self {
            ops,
            lease: Arc::new(tokio::sync::Mutex::new(())),
            holder: Arc::new(Mutex::new(None)),
        }
    }

    /// Unleased access, for status queries and abort primitives only
    pub fn ops(&self) -> &SharedDeviceOps {
        &self.ops
    }

    /// Take the exclusive lease, failing at once if another command holds it
    pub fn try_lease(&self, holder: &str) -> DeviceResult<DeviceLease> {
        let guard = match self.lease.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                let current = self
                    .holder
                    .lock()
                    .ok()
                    .and_then(|h| h.clone())
                    .unwrap_or_else(|| "another command".to_string());
                return Err(DeviceError::Busy(current));
            }
        };
        if let Ok(mut h) = self.holder.lock() {
            *h = Some(holder.to_string());
        }
        tracing::debug!("Device lease taken by {}", holder);
        Ok(DeviceLease {
            ops: self.ops.clone(),
            holder: self.holder.clone(),
            _guard: guard,
        })
    }

    /// Name of the current lease holder, if any
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().ok().and_then(|h| h.clone())
    }
}

/// Exclusive access to the device for one heavy command
pub struct DeviceLease {
    ops: SharedDeviceOps,
    holder: Arc<Mutex<Option<String>>>,
    _guard: OwnedMutexGuard<()>,
}

impl Deref for DeviceLease {
    type Target = dyn DeviceOps;

    fn deref(&self) -> &Self::Target {
        self.ops.as_ref()
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Ok(mut h) = self.holder.lock() {
            *h = None;
        }
    }
}
