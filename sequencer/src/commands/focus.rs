//! FOCUS: scan the telescope focus and settle on the best position

use super::{check_requested_ms, to_result, CommandHandler};
use crate::config::InstrumentConfig;
use crate::context::UnitContext;
use crate::dispatcher::CommandKind;
use crate::error::SequencerError;
use crate::focus::{run_focus, FocusRequest};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct FocusParams {
    pub start_mm: f64,
    pub end_mm: f64,
    pub step_mm: f64,
    #[serde(default)]
    pub exposure_ms: Option<u64>,
}

pub struct FocusHandler {
    params: FocusParams,
}

impl FocusHandler {
    pub fn new(params: FocusParams) -> Self {
        Self { params }
    }

    fn request(&self, config: &InstrumentConfig) -> FocusRequest {
        FocusRequest {
            start_mm: self.params.start_mm,
            end_mm: self.params.end_mm,
            step_mm: self.params.step_mm,
            exposure_ms: self.params.exposure_ms.unwrap_or(config.focus.exposure_ms),
        }
    }
}

#[async_trait]
impl CommandHandler for FocusHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::Focus
    }

    fn check_params(&self) -> Result<(), SequencerError> {
        match self.params.exposure_ms {
            Some(exposure_ms) => check_requested_ms("exposure_ms", exposure_ms),
            None => Ok(()),
        }
    }

    fn initial_ack_ms(&self, config: &InstrumentConfig) -> u64 {
        let request = self.request(config);
        // a bad range is reported by execute, so one frame is enough here
        let steps = request.positions().map(|p| p.len() as u64).unwrap_or(1);
        request.scan_deadline_ms(config, steps)
    }

    async fn execute(&self, ctx: &UnitContext<'_>) -> Result<Option<Value>, SequencerError> {
        let report = run_focus(ctx, &self.request(ctx.config())).await?;
        to_result(&report)
    }
}
