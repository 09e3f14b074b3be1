//! ACQUIRE: put a target on a chosen detector pixel

use super::{to_result, CommandHandler};
use crate::acquisition::{acquire, AcquisitionMode, AcquisitionState};
use crate::astrometry::{SkyOffset, SkyPosition};
use crate::config::InstrumentConfig;
use crate::context::UnitContext;
use crate::dispatcher::CommandKind;
use crate::error::SequencerError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct AcquireParams {
    pub mode: AcquisitionMode,
    #[serde(default)]
    pub ra_deg: Option<f64>,
    #[serde(default)]
    pub dec_deg: Option<f64>,
    /// Binned pixel to acquire onto, the frame centre by default
    #[serde(default)]
    pub x_pix: Option<f64>,
    #[serde(default)]
    pub y_pix: Option<f64>,
    #[serde(default)]
    pub threshold_arcsec: Option<f64>,
}

pub struct AcquireHandler {
    params: AcquireParams,
}

impl AcquireHandler {
    pub fn new(params: AcquireParams) -> Self {
        Self { params }
    }

    fn initial_state(&self, config: &InstrumentConfig) -> Result<AcquisitionState, SequencerError> {
        let p = &self.params;
        let acquire = &config.acquire;
        let binning = acquire.binning.max(1);

        let target_sky = match (p.ra_deg, p.dec_deg) {
            (Some(ra_deg), Some(dec_deg)) => Some(SkyPosition { ra_deg, dec_deg }),
            _ => None,
        };
        if p.mode == AcquisitionMode::Wcs && target_sky.is_none() {
            return Err(SequencerError::InvalidParameter(
                "WCS acquisition needs ra_deg and dec_deg".to_string(),
            ));
        }

        let centre = (
            config.detector.columns as f64 / binning as f64 / 2.0,
            config.detector.rows as f64 / binning as f64 / 2.0,
        );
        let default_threshold = match p.mode {
            AcquisitionMode::Brightest => acquire.brightest_threshold_arcsec,
            _ => acquire.wcs_threshold_arcsec,
        };

        Ok(AcquisitionState {
            mode: p.mode,
            target_sky,
            target_pixel: (p.x_pix.unwrap_or(centre.0), p.y_pix.unwrap_or(centre.1)),
            threshold_arcsec: p.threshold_arcsec.unwrap_or(default_threshold),
            exposure_ms: acquire.exposure_ms,
            binning,
            cumulative: SkyOffset::default(),
            attempts: 0,
            offsets_issued: 0,
            max_offset_count: acquire.max_offset_count,
        })
    }
}

#[async_trait]
impl CommandHandler for AcquireHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::Acquire
    }

    fn initial_ack_ms(&self, config: &InstrumentConfig) -> u64 {
        config
            .detector
            .clamp_exposure_ms(config.acquire.exposure_ms)
            .saturating_add(config.server.readout_ms)
            .saturating_add(config.server.acknowledge_margin_ms)
    }

    async fn execute(&self, ctx: &UnitContext<'_>) -> Result<Option<Value>, SequencerError> {
        let mut state = self.initial_state(ctx.config())?;
        let report = acquire(ctx, &mut state).await?;
        to_result(&report)
    }
}
