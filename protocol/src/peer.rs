//! Typed payloads for the instrument's outbound peer commands
//!
//! Peers speak the same framing as the instrument itself; these types give the
//! `params` and `result` fields of those exchanges a fixed shape.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A request understood by one of the peers
pub trait PeerCommand: Serialize {
    /// Raw type name written into [`crate::Command::kind`]
    const KIND: &'static str;
    /// Shape of the completion's result payload
    type Reply: DeserializeOwned;
}

/// Reply for commands that carry no payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoReply;

// =============================================================================
// POINTING
// =============================================================================

/// Offset the telescope from its base position.
///
/// Not additive: each request replaces the previous offset, so the caller
/// resends its running total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffsetRaDec {
    /// Offset along RA on the sky (already scaled by cos(dec))
    pub ra_arcsec: f64,
    pub dec_arcsec: f64,
}

impl PeerCommand for OffsetRaDec {
    const KIND: &'static str = "OFFSET_RA_DEC";
    type Reply = NoReply;
}

/// Move the telescope in the instrument frame.
///
/// Cumulative: each request adds to the offsets already applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffsetXy {
    pub x_arcsec: f64,
    pub y_arcsec: f64,
}

impl PeerCommand for OffsetXy {
    const KIND: &'static str = "OFFSET_X_Y";
    type Reply = NoReply;
}

/// Set the telescope focus to an absolute position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetFocus {
    pub focus_mm: f64,
}

impl PeerCommand for SetFocus {
    const KIND: &'static str = "SET_FOCUS";
    type Reply = NoReply;
}

// =============================================================================
// BEAM STEERING
// =============================================================================

/// Apply the instrument's focus offset for the current optical configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusOffset {
    pub instrument: String,
    pub offset_mm: f64,
}

impl PeerCommand for FocusOffset {
    const KIND: &'static str = "FOCUS_OFFSET";
    type Reply = NoReply;
}

// =============================================================================
// REDUCTION PIPELINE
// =============================================================================

/// Reduce a science/acquisition frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceExpose {
    pub filename: String,
    /// Ask the pipeline for a world coordinate fit
    pub wcs_fit: bool,
}

impl PeerCommand for ReduceExpose {
    const KIND: &'static str = "REDUCE_EXPOSE";
    type Reply = ReducedExposure;
}

/// Gnomonic world coordinate solution, FITS conventions (1-based pixels)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WcsSolution {
    pub crval1_deg: f64,
    pub crval2_deg: f64,
    pub crpix1: f64,
    pub crpix2: f64,
    pub cd1_1: f64,
    pub cd1_2: f64,
    pub cd2_1: f64,
    pub cd2_2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedExposure {
    /// Name of the reduced output frame
    pub filename: String,
    /// Integrated counts of the brightest object
    pub counts: f64,
    /// Seeing in arcseconds
    pub seeing_arcsec: f64,
    /// Pixel position of the brightest object
    pub x_pix: f64,
    pub y_pix: f64,
    #[serde(default)]
    pub wcs: Option<WcsSolution>,
}

/// Reduce a calibration (flat) frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceCalibrate {
    pub filename: String,
}

impl PeerCommand for ReduceCalibrate {
    const KIND: &'static str = "REDUCE_CALIBRATE";
    type Reply = ReducedCalibration;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedCalibration {
    pub filename: String,
    pub mean_counts: f64,
    pub peak_counts: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Completion;
    use serde_json::json;

    #[test]
    fn test_no_reply_decodes_from_missing_result() {
        let done = Completion::success("1", None);
        let reply: NoReply = done.decode_result().unwrap();
        assert_eq!(reply, NoReply);
    }

    #[test]
    fn test_reduced_exposure_without_wcs() {
        let done = Completion::success(
            "1",
            Some(json!({
                "filename": "k_a_20261018_1_1_1_1.fits",
                "counts": 1200.0,
                "seeing_arcsec": 1.4,
                "x_pix": 512.0,
                "y_pix": 490.5
            })),
        );
        let reply: ReducedExposure = done.decode_result().unwrap();
        assert!(reply.wcs.is_none());
        assert_eq!(reply.y_pix, 490.5);
    }
}
