//! CONFIG: set binning, windows, filter and slides

use super::{to_result, CommandHandler};
use crate::context::UnitContext;
use crate::device_ops::{Amplifier, Dimensions, MechanismKind, SlidePosition, Window, MAX_WINDOWS};
use crate::dispatcher::CommandKind;
use crate::error::SequencerError;
use crate::peer::PeerKind;
use async_trait::async_trait;
use kestrel_protocol::peer::FocusOffset;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigParams {
    pub binning: u32,
    #[serde(default)]
    pub window_flags: u8,
    #[serde(default)]
    pub windows: Vec<Window>,
    pub filter: String,
    #[serde(default)]
    pub lower_slide: SlidePosition,
    #[serde(default)]
    pub upper_slide: SlidePosition,
    #[serde(default)]
    pub amplifier: Option<Amplifier>,
}

#[derive(Debug, Serialize)]
struct ConfigResult {
    binning: u32,
    window_flags: u8,
    filter: String,
    filter_position: u32,
}

pub struct ConfigHandler {
    params: ConfigParams,
}

impl ConfigHandler {
    pub fn new(params: ConfigParams) -> Self {
        Self { params }
    }

    /// Check the request against the detector before touching any hardware
    fn validate(&self, columns: u32, rows: u32, max_binning: u32) -> Result<(), SequencerError> {
        let p = &self.params;
        if p.binning == 0 || p.binning > max_binning {
            return Err(SequencerError::InvalidParameter(format!(
                "binning {} outside 1..={}",
                p.binning, max_binning
            )));
        }
        if p.window_flags != 0 && p.binning > 1 {
            return Err(SequencerError::IllegalBinningAndWindowing {
                binning: p.binning,
                window_flags: p.window_flags,
            });
        }
        if p.windows.len() > MAX_WINDOWS {
            return Err(SequencerError::InvalidParameter(format!(
                "{} windows given, at most {} supported",
                p.windows.len(),
                MAX_WINDOWS
            )));
        }
        for bit in 0..8 {
            if p.window_flags & (1 << bit) == 0 {
                continue;
            }
            let window = p.windows.get(bit).ok_or_else(|| {
                SequencerError::InvalidParameter(format!("window {} enabled but not defined", bit + 1))
            })?;
            if window.x_start == 0
                || window.y_start == 0
                || window.x_start > window.x_end
                || window.y_start > window.y_end
                || window.x_end > columns
                || window.y_end > rows
            {
                return Err(SequencerError::InvalidParameter(format!(
                    "window {} ({},{})-({},{}) outside the {}x{} detector",
                    bit + 1,
                    window.x_start,
                    window.y_start,
                    window.x_end,
                    window.y_end,
                    columns,
                    rows
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for ConfigHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::Config
    }

    async fn execute(&self, ctx: &UnitContext<'_>) -> Result<Option<Value>, SequencerError> {
        let config = ctx.config();
        let detector = &config.detector;
        let p = &self.params;

        self.validate(detector.columns, detector.rows, detector.max_binning)?;
        let filter_position = *config
            .filters
            .get(&p.filter)
            .ok_or_else(|| SequencerError::InvalidParameter(format!("unknown filter '{}'", p.filter)))?;

        let dims = Dimensions {
            columns: detector.columns,
            rows: detector.rows,
            x_bin: p.binning,
            y_bin: p.binning,
            amplifier: p.amplifier.unwrap_or(detector.amplifier),
            window_flags: p.window_flags,
            windows: p.windows.clone(),
        };

        let device = ctx.device();
        device.configure_dimensions(&dims).await?;
        ctx.check_abort()?;
        device.move_filter_wheel(filter_position).await?;
        device.move_mechanism(MechanismKind::LowerSlide, p.lower_slide).await?;
        device.move_mechanism(MechanismKind::UpperSlide, p.upper_slide).await?;
        ctx.check_abort()?;

        ctx.peer(
            PeerKind::BeamSteering,
            &FocusOffset {
                instrument: config.server.instrument_name.clone(),
                offset_mm: detector.focus_offset_mm,
            },
        )
        .await?;

        tracing::info!(
            "Configured binning {} window flags {:#x} filter {} ({})",
            p.binning,
            p.window_flags,
            p.filter,
            filter_position
        );
        to_result(&ConfigResult {
            binning: p.binning,
            window_flags: p.window_flags,
            filter: p.filter.clone(),
            filter_position,
        })
    }
}
