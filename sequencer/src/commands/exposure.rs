//! MULTRUN, MULTBIAS and MULTDARK
//!
//! Each command opens a new multrun and takes `count` frames into it,
//! acknowledging before every frame and checking for abort after it.

use super::{check_requested_ms, to_result, CommandHandler};
use crate::config::InstrumentConfig;
use crate::context::UnitContext;
use crate::dispatcher::CommandKind;
use crate::error::SequencerError;
use crate::filenames::ExposureCode;
use crate::peer::PeerKind;
use async_trait::async_trait;
use kestrel_protocol::peer::{ReduceExpose, ReducedExposure};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct MultrunParams {
    pub exposure_ms: u64,
    pub count: u32,
    /// Frames of a photometric standard
    #[serde(default)]
    pub standard: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultbiasParams {
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultdarkParams {
    pub exposure_ms: u64,
    pub count: u32,
}

#[derive(Debug, Default, Serialize)]
struct SeriesResult {
    multrun: u32,
    filenames: Vec<String>,
    /// Last pipeline reduction, MULTRUN only
    #[serde(skip_serializing_if = "Option::is_none")]
    reduced: Option<ReducedExposure>,
}

fn series_deadline(config: &InstrumentConfig, exposure_ms: u64, count: u32) -> u64 {
    config
        .detector
        .clamp_exposure_ms(exposure_ms)
        .saturating_add(config.server.readout_ms)
        .saturating_mul(count as u64)
        .saturating_add(config.server.acknowledge_margin_ms)
}

/// Take `count` frames of one type, reducing each if `reduce` is set
async fn take_series(
    ctx: &UnitContext<'_>,
    code: ExposureCode,
    open_shutter: bool,
    exposure_ms: u64,
    count: u32,
    reduce: bool,
) -> Result<SeriesResult, SequencerError> {
    if count == 0 {
        return Err(SequencerError::InvalidParameter("count must be at least 1".to_string()));
    }

    let mut result = SeriesResult {
        multrun: ctx.next_multrun().await,
        ..SeriesResult::default()
    };
    tracing::info!(
        "Starting multrun {}: {} x {}ms ({:?})",
        result.multrun,
        count,
        exposure_ms,
        code
    );

    for frame in 0..count {
        ctx.acknowledge(ctx.frame_deadline_ms(exposure_ms));
        let path = ctx.next_filename(code).await;
        ctx.expose(open_shutter, exposure_ms, &path).await?;
        let filename = path.to_string_lossy().to_string();

        if reduce {
            let reduced = ctx
                .peer(
                    PeerKind::Pipeline,
                    &ReduceExpose {
                        filename: filename.clone(),
                        wcs_fit: false,
                    },
                )
                .await?;
            tracing::debug!(
                "Frame {}/{} reduced: counts {:.0}, seeing {:.2}\"",
                frame + 1,
                count,
                reduced.counts,
                reduced.seeing_arcsec
            );
            result.reduced = Some(reduced);
        }
        result.filenames.push(filename);
        ctx.check_abort()?;
    }
    Ok(result)
}

pub struct MultrunHandler {
    params: MultrunParams,
}

impl MultrunHandler {
    pub fn new(params: MultrunParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl CommandHandler for MultrunHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::Multrun
    }

    fn check_params(&self) -> Result<(), SequencerError> {
        check_requested_ms("exposure_ms", self.params.exposure_ms)
    }

    fn initial_ack_ms(&self, config: &InstrumentConfig) -> u64 {
        series_deadline(config, self.params.exposure_ms, self.params.count)
    }

    async fn execute(&self, ctx: &UnitContext<'_>) -> Result<Option<Value>, SequencerError> {
        let code = if self.params.standard {
            ExposureCode::Standard
        } else {
            ExposureCode::Exposure
        };
        let result = take_series(ctx, code, true, self.params.exposure_ms, self.params.count, true).await?;
        to_result(&result)
    }
}

pub struct MultbiasHandler {
    params: MultbiasParams,
}

impl MultbiasHandler {
    pub fn new(params: MultbiasParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl CommandHandler for MultbiasHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::Multbias
    }

    fn initial_ack_ms(&self, config: &InstrumentConfig) -> u64 {
        series_deadline(config, 0, self.params.count)
    }

    async fn execute(&self, ctx: &UnitContext<'_>) -> Result<Option<Value>, SequencerError> {
        let result = take_series(ctx, ExposureCode::Bias, false, 0, self.params.count, false).await?;
        to_result(&result)
    }
}

pub struct MultdarkHandler {
    params: MultdarkParams,
}

impl MultdarkHandler {
    pub fn new(params: MultdarkParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl CommandHandler for MultdarkHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::Multdark
    }

    fn check_params(&self) -> Result<(), SequencerError> {
        check_requested_ms("exposure_ms", self.params.exposure_ms)
    }

    fn initial_ack_ms(&self, config: &InstrumentConfig) -> u64 {
        series_deadline(config, self.params.exposure_ms, self.params.count)
    }

    async fn execute(&self, ctx: &UnitContext<'_>) -> Result<Option<Value>, SequencerError> {
        let result = take_series(
            ctx,
            ExposureCode::Dark,
            false,
            self.params.exposure_ms,
            self.params.count,
            false,
        )
        .await?;
        to_result(&result)
    }
}
