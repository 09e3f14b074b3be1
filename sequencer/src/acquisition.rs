//! Acquisition Engine
//!
//! Closed-loop positioning: take a short frame, have the pipeline reduce it,
//! work out how far the target is from where it should be on the detector and
//! move the telescope, until the error drops under the threshold.
//!
//! The two modes drive the pointing peer differently and this must stay so:
//! sky-coordinate mode resends its running total as an absolute offset,
//! centroid mode sends each correction as a delta that the telescope adds up.

use crate::astrometry::{pixel_to_sky, sky_offset, SkyOffset, SkyPosition};
use crate::context::UnitContext;
use crate::device_ops::Dimensions;
use crate::error::SequencerError;
use crate::filenames::ExposureCode;
use crate::peer::PeerKind;
use kestrel_protocol::peer::{OffsetRaDec, OffsetXy, ReduceExpose, ReducedExposure};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Nothing to do
    None,
    /// Fit world coordinates and move the target sky position onto the pixel
    Wcs,
    /// Drag the brightest object onto the pixel
    Brightest,
}

/// Loop state for one ACQUIRE
#[derive(Debug, Clone)]
pub struct AcquisitionState {
    pub mode: AcquisitionMode,
    /// Required in sky-coordinate mode
    pub target_sky: Option<SkyPosition>,
    /// Binned pixel the target should land on
    pub target_pixel: (f64, f64),
    pub threshold_arcsec: f64,
    pub exposure_ms: u64,
    pub binning: u32,
    /// Sky-coordinate mode only: the absolute offset last sent
    pub cumulative: SkyOffset,
    pub attempts: u32,
    pub offsets_issued: u32,
    pub max_offset_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionReport {
    pub mode: AcquisitionMode,
    pub attempts: u32,
    pub offsets_issued: u32,
    pub final_offset_arcsec: f64,
    pub total_ra_offset_arcsec: f64,
    pub total_dec_offset_arcsec: f64,
    pub last_filename: Option<String>,
}

impl AcquisitionState {
    fn report(&self, final_offset_arcsec: f64, last_filename: Option<String>) -> AcquisitionReport {
        AcquisitionReport {
            mode: self.mode,
            attempts: self.attempts,
            offsets_issued: self.offsets_issued,
            final_offset_arcsec,
            total_ra_offset_arcsec: self.cumulative.ra_arcsec,
            total_dec_offset_arcsec: self.cumulative.dec_arcsec,
            last_filename,
        }
    }

    /// Correction that moves the target onto the target pixel, in arcseconds
    fn measure(&self, reduced: &ReducedExposure, plate_scale: f64) -> Result<SkyOffset, SequencerError> {
        match self.mode {
            AcquisitionMode::Wcs => {
                let wcs = reduced
                    .wcs
                    .as_ref()
                    .ok_or_else(|| SequencerError::MissingWcs(reduced.filename.clone()))?;
                let target = self
                    .target_sky
                    .ok_or_else(|| SequencerError::InvalidParameter("no target sky position".to_string()))?;
                let current = pixel_to_sky(wcs, self.target_pixel.0, self.target_pixel.1);
                Ok(sky_offset(current, target))
            }
            AcquisitionMode::Brightest => Ok(SkyOffset {
                ra_arcsec: (self.target_pixel.0 - reduced.x_pix) * plate_scale,
                dec_arcsec: (self.target_pixel.1 - reduced.y_pix) * plate_scale,
            }),
            AcquisitionMode::None => Ok(SkyOffset::default()),
        }
    }
}

/// Run the acquisition loop until convergence, the iteration cap or an abort
pub async fn acquire(ctx: &UnitContext<'_>, state: &mut AcquisitionState) -> Result<AcquisitionReport, SequencerError> {
    if state.mode == AcquisitionMode::None {
        tracing::info!("Acquisition mode NONE, nothing to do");
        return Ok(state.report(0.0, None));
    }

    let config = ctx.config();
    let dims = Dimensions::full_frame(
        config.detector.columns,
        config.detector.rows,
        state.binning,
        config.detector.amplifier,
    );
    ctx.device().configure_dimensions(&dims).await?;
    ctx.check_abort()?;

    let plate_scale = config.binned_plate_scale(state.binning);
    let multrun = ctx.next_multrun().await;
    tracing::info!(
        "Starting {:?} acquisition (multrun {}) onto pixel ({:.1}, {:.1}), threshold {:.2}\"",
        state.mode,
        multrun,
        state.target_pixel.0,
        state.target_pixel.1,
        state.threshold_arcsec
    );

    loop {
        state.attempts += 1;
        ctx.acknowledge(ctx.frame_deadline_ms(state.exposure_ms));

        let path = ctx.next_filename(ExposureCode::Acquire).await;
        ctx.expose(true, state.exposure_ms, &path).await?;

        let filename = path.to_string_lossy().to_string();
        let reduced = ctx
            .peer(
                PeerKind::Pipeline,
                &ReduceExpose {
                    filename: filename.clone(),
                    wcs_fit: state.mode == AcquisitionMode::Wcs,
                },
            )
            .await?;

        let offset = state.measure(&reduced, plate_scale)?;
        let magnitude = offset.magnitude();
        tracing::info!(
            "Acquisition attempt {}: offset {:.2}\" ({:.2}\", {:.2}\")",
            state.attempts,
            magnitude,
            offset.ra_arcsec,
            offset.dec_arcsec
        );

        if magnitude < state.threshold_arcsec {
            tracing::info!("Acquired after {} attempts", state.attempts);
            return Ok(state.report(magnitude, Some(filename)));
        }
        if state.offsets_issued >= state.max_offset_count {
            tracing::warn!(
                "Acquisition did not converge: {} offsets issued, still {:.2}\" off",
                state.offsets_issued,
                magnitude
            );
            return Err(SequencerError::IterationCapExceeded {
                attempts: state.attempts,
                last_offset_arcsec: magnitude,
            });
        }

        match state.mode {
            AcquisitionMode::Wcs => {
                state.cumulative += offset;
                ctx.peer(
                    PeerKind::Pointing,
                    &OffsetRaDec {
                        ra_arcsec: state.cumulative.ra_arcsec,
                        dec_arcsec: state.cumulative.dec_arcsec,
                    },
                )
                .await?;
            }
            AcquisitionMode::Brightest => {
                state.cumulative += offset;
                ctx.peer(
                    PeerKind::Pointing,
                    &OffsetXy {
                        x_arcsec: offset.ra_arcsec,
                        y_arcsec: offset.dec_arcsec,
                    },
                )
                .await?;
            }
            AcquisitionMode::None => {}
        }
        state.offsets_issued += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::CommandKind;
    use crate::sim_device::DeviceCall;
    use crate::test_support::{default_reply, evening, instant_rig, reduced_exposure};
    use approx::assert_abs_diff_eq;
    use kestrel_protocol::peer::WcsSolution;
    use kestrel_protocol::Completion;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    fn wcs() -> WcsSolution {
        WcsSolution {
            crval1_deg: 150.0,
            crval2_deg: 30.0,
            crpix1: 512.0,
            crpix2: 512.0,
            cd1_1: -1.0 / 3600.0,
            cd1_2: 0.0,
            cd2_1: 0.0,
            cd2_2: 1.0 / 3600.0,
        }
    }

    fn wcs_reply(_: PeerKind, command: &kestrel_protocol::Command) -> Completion {
        if command.kind == "REDUCE_EXPOSE" {
            let mut reduced = reduced_exposure("frame.fits", 0.0, 0.0, 1.0);
            reduced.wcs = Some(wcs());
            return Completion::success(&command.id, Some(serde_json::to_value(reduced).unwrap()));
        }
        Completion::success(&command.id, None)
    }

    fn state(mode: AcquisitionMode, target_dec_offset_arcsec: f64) -> AcquisitionState {
        AcquisitionState {
            mode,
            target_sky: Some(SkyPosition {
                ra_deg: 150.0,
                dec_deg: 30.0 + target_dec_offset_arcsec / 3600.0,
            }),
            target_pixel: (512.0, 512.0),
            threshold_arcsec: 1.0,
            exposure_ms: 1_000,
            binning: 2,
            cumulative: SkyOffset::default(),
            attempts: 0,
            offsets_issued: 0,
            max_offset_count: 3,
        }
    }

    fn exposures(calls: &[DeviceCall]) -> usize {
        calls.iter().filter(|c| matches!(c, DeviceCall::Expose { .. })).count()
    }

    #[tokio::test]
    async fn test_none_mode_takes_no_exposures() {
        let rig = instant_rig(evening(), |_| {}, default_reply);
        let (ctx, _acks) = rig.context(CommandKind::Acquire);
        let report = acquire(&ctx, &mut state(AcquisitionMode::None, 0.0)).await.unwrap();
        assert_eq!(report.attempts, 0);
        assert!(rig.camera.calls().is_empty());
    }

    #[tokio::test]
    async fn test_wcs_converges_in_one_iteration_when_on_target() {
        let rig = instant_rig(evening(), |_| {}, wcs_reply);
        let (ctx, _acks) = rig.context(CommandKind::Acquire);

        let report = acquire(&ctx, &mut state(AcquisitionMode::Wcs, 0.0)).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.offsets_issued, 0);
        assert_eq!(exposures(&rig.camera.calls()), 1);
        assert!(rig.peers.sent("OFFSET_RA_DEC").is_empty());
        assert_eq!(rig.peers.sent("REDUCE_EXPOSE")[0]["wcs_fit"], true);
    }

    #[tokio::test]
    async fn test_brightest_converges_in_one_iteration_when_on_target() {
        let rig = instant_rig(evening(), |_| {}, default_reply);
        let (ctx, _acks) = rig.context(CommandKind::Acquire);

        let report = acquire(&ctx, &mut state(AcquisitionMode::Brightest, 0.0)).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert!(rig.peers.sent("OFFSET_X_Y").is_empty());
    }

    #[tokio::test]
    async fn test_wcs_offsets_are_resent_as_running_totals() {
        let rig = instant_rig(evening(), |_| {}, wcs_reply);
        let (ctx, _acks) = rig.context(CommandKind::Acquire);

        let err = acquire(&ctx, &mut state(AcquisitionMode::Wcs, 10.0)).await.unwrap_err();
        match err {
            SequencerError::IterationCapExceeded { attempts, last_offset_arcsec } => {
                assert_eq!(attempts, 4);
                assert_abs_diff_eq!(last_offset_arcsec, 10.0, epsilon = 1e-6);
            }
            other => panic!("unexpected error {}", other),
        }
        assert_eq!(exposures(&rig.camera.calls()), 4);

        let sent = rig.peers.sent("OFFSET_RA_DEC");
        assert_eq!(sent.len(), 3);
        for (i, params) in sent.iter().enumerate() {
            let expected = 10.0 * (i + 1) as f64;
            assert_abs_diff_eq!(params["dec_arcsec"].as_f64().unwrap(), expected, epsilon = 1e-6);
        }
    }

    #[tokio::test]
    async fn test_brightest_offsets_are_per_call_deltas() {
        // star 12 binned pixels left of target, 0.3"/pixel at bin 2
        let rig = instant_rig(evening(), |_| {}, |_, command: &kestrel_protocol::Command| {
            if command.kind == "REDUCE_EXPOSE" {
                let reduced = reduced_exposure("frame.fits", 500.0, 512.0, 1.0);
                return Completion::success(&command.id, Some(serde_json::to_value(reduced).unwrap()));
            }
            Completion::success(&command.id, None)
        });
        let (ctx, _acks) = rig.context(CommandKind::Acquire);

        let err = acquire(&ctx, &mut state(AcquisitionMode::Brightest, 0.0)).await.unwrap_err();
        assert!(matches!(err, SequencerError::IterationCapExceeded { attempts: 4, .. }));

        let sent = rig.peers.sent("OFFSET_X_Y");
        assert_eq!(sent.len(), 3);
        for params in sent {
            assert_abs_diff_eq!(params["x_arcsec"].as_f64().unwrap(), 3.6, epsilon = 1e-9);
            assert_abs_diff_eq!(params["y_arcsec"].as_f64().unwrap(), 0.0, epsilon = 1e-9);
        }
        assert!(rig.peers.sent("REDUCE_EXPOSE").iter().all(|p| p["wcs_fit"] == false));
    }

    #[tokio::test]
    async fn test_missing_wcs_fails() {
        let rig = instant_rig(evening(), |_| {}, default_reply);
        let (ctx, _acks) = rig.context(CommandKind::Acquire);
        let err = acquire(&ctx, &mut state(AcquisitionMode::Wcs, 0.0)).await.unwrap_err();
        assert!(matches!(err, SequencerError::MissingWcs(_)));
    }

    #[tokio::test]
    async fn test_abort_during_reduction_fails_with_aborted() {
        let token: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        let trigger = token.clone();
        let rig = instant_rig(evening(), |_| {}, move |peer, command: &kestrel_protocol::Command| {
            if command.kind == "REDUCE_EXPOSE" {
                if let Some(t) = trigger.lock().unwrap().as_ref() {
                    t.cancel();
                }
            }
            default_reply(peer, command)
        });
        let (ctx, _acks) = rig.context(CommandKind::Acquire);
        *token.lock().unwrap() = Some(ctx.abort_token().clone());

        let err = acquire(&ctx, &mut state(AcquisitionMode::Brightest, 0.0)).await.unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(err.error_number(CommandKind::Acquire), 1901);
    }

    #[tokio::test]
    async fn test_progress_acknowledged_per_attempt() {
        let rig = instant_rig(evening(), |_| {}, wcs_reply);
        let (ctx, mut acks) = rig.context(CommandKind::Acquire);
        let _ = acquire(&ctx, &mut state(AcquisitionMode::Wcs, 10.0)).await;
        let mut count = 0;
        while acks.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 4);
    }
}
