//! TWILIGHT_CALIBRATE

use super::{check_requested_ms, to_result, CommandHandler};
use crate::config::InstrumentConfig;
use crate::context::UnitContext;
use crate::dispatcher::CommandKind;
use crate::error::SequencerError;
use crate::twilight::run_twilight;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct TwilightParams {
    /// Time the run may take before it must complete
    pub time_to_complete_ms: u64,
}

pub struct TwilightCalibrateHandler {
    params: TwilightParams,
}

impl TwilightCalibrateHandler {
    pub fn new(params: TwilightParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl CommandHandler for TwilightCalibrateHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::TwilightCalibrate
    }

    fn check_params(&self) -> Result<(), SequencerError> {
        check_requested_ms("time_to_complete_ms", self.params.time_to_complete_ms)
    }

    fn initial_ack_ms(&self, config: &InstrumentConfig) -> u64 {
        self.params
            .time_to_complete_ms
            .saturating_add(config.server.acknowledge_margin_ms)
    }

    async fn execute(&self, ctx: &UnitContext<'_>) -> Result<Option<Value>, SequencerError> {
        if self.params.time_to_complete_ms == 0 {
            return Err(SequencerError::InvalidParameter(
                "time_to_complete_ms must be positive".to_string(),
            ));
        }
        let report = run_twilight(ctx, self.params.time_to_complete_ms).await?;
        to_result(&report)
    }
}
