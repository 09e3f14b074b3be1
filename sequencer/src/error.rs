//! Command failure taxonomy
//!
//! Failures are handled where they are detected: a handler returns a
//! [`SequencerError`], the execution unit turns it into a failed completion and
//! the connection closes normally. Error numbers are namespaced by the command
//! that raised them, `command base + failure offset`, so the same failure kind
//! reads as 1901 from ACQUIRE and 2301 from TWILIGHT_CALIBRATE.

use crate::device_ops::DeviceError;
use crate::dispatcher::CommandKind;
use crate::ledger::LedgerError;
use crate::peer::PeerKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequencerError {
    // =========================================================================
    // Operator and resource errors
    // =========================================================================

    #[error("Command aborted")]
    Aborted,

    #[error("Device busy: held by {0}")]
    DeviceBusy(String),

    #[error("Device error: {0}")]
    Device(DeviceError),

    #[error("{peer} request failed ({error_number}): {message}")]
    Peer {
        peer: PeerKind,
        error_number: i32,
        message: String,
    },

    #[error("File error: {0}")]
    File(String),

    #[error("Calibration ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Parameter and configuration errors
    // =========================================================================

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Illegal binning and windowing: binning {binning} with window flags {window_flags:#x}")]
    IllegalBinningAndWindowing { binning: u32, window_flags: u8 },

    #[error("Unsupported command: {0}")]
    Unsupported(String),

    // =========================================================================
    // Convergence and validation errors
    // =========================================================================

    #[error("Failed to converge after {attempts} attempts (last offset {last_offset_arcsec:.2}\")")]
    IterationCapExceeded { attempts: u32, last_offset_arcsec: f64 },

    #[error("Reduction returned no world coordinate fit for {0}")]
    MissingWcs(String),

    #[error("Degenerate focus fit: {0}")]
    DegenerateFit(String),

    #[error("Best focus {best_mm:.3}mm outside scanned range {low_mm:.3}..{high_mm:.3}mm")]
    FocusOutOfRange { best_mm: f64, low_mm: f64, high_mm: f64 },

    #[error("Implausible focus fit: {0}")]
    ImplausibleFit(String),
}

impl From<DeviceError> for SequencerError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Aborted(_) => SequencerError::Aborted,
            DeviceError::Busy(holder) => SequencerError::DeviceBusy(holder),
            other => SequencerError::Device(other),
        }
    }
}

impl SequencerError {
    /// Offset of this failure kind inside a command's error namespace
    pub fn offset(&self) -> i32 {
        match self {
            SequencerError::Aborted => 1,
            SequencerError::InvalidParameter(_) => 2,
            SequencerError::Config(_) => 3,
            SequencerError::DeviceBusy(_) => 4,
            SequencerError::Device(_) => 5,
            SequencerError::File(_) => 6,
            SequencerError::Ledger(_) => 7,
            SequencerError::Internal(_) => 9,
            SequencerError::IllegalBinningAndWindowing { .. } => 11,
            SequencerError::IterationCapExceeded { .. } => 20,
            SequencerError::MissingWcs(_) => 21,
            SequencerError::DegenerateFit(_) => 30,
            SequencerError::FocusOutOfRange { .. } => 31,
            SequencerError::ImplausibleFit(_) => 32,
            SequencerError::Peer { peer, .. } => 40 + peer.index(),
            SequencerError::Unsupported(_) => 1,
        }
    }

    /// Error number reported in the completion of a `kind` command
    pub fn error_number(&self, kind: CommandKind) -> i32 {
        kind.error_base() + self.offset()
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, SequencerError::Aborted)
    }
}

impl From<std::io::Error> for SequencerError {
    fn from(err: std::io::Error) -> Self {
        SequencerError::File(err.to_string())
    }
}
