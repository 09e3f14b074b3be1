//! ABORT and GET_STATUS
//!
//! Both run without the device lease. They read state and call abort
//! primitives but never issue device calls that could conflict with the
//! command holding the lease.

use super::{to_result, CommandHandler};
use crate::context::UnitContext;
use crate::device_ops::ExposureStatus;
use crate::dispatcher::CommandKind;
use crate::error::SequencerError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

pub struct AbortHandler;

#[async_trait]
impl CommandHandler for AbortHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::Abort
    }

    async fn execute(&self, ctx: &UnitContext<'_>) -> Result<Option<Value>, SequencerError> {
        let report = ctx.state.coordinator.request_abort().await;
        to_result(&report)
    }
}

#[derive(Debug, Serialize)]
struct CurrentCommand {
    id: String,
    kind: &'static str,
    running_ms: i64,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    instrument: String,
    uptime_ms: i64,
    current_command: Option<CurrentCommand>,
    exposure: ExposureStatus,
    temperature_c: Option<f64>,
    filter_position: Option<u32>,
    multrun: u32,
}

pub struct GetStatusHandler;

#[async_trait]
impl CommandHandler for GetStatusHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::GetStatus
    }

    async fn execute(&self, ctx: &UnitContext<'_>) -> Result<Option<Value>, SequencerError> {
        let now = ctx.now();
        let device = ctx.device();

        let exposure = device.current_exposure_status().await?;
        let temperature_c = match device.current_temperature().await {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!("Temperature unavailable: {}", e);
                None
            }
        };
        let filter_position = device.filter_wheel_position().await.unwrap_or_else(|e| {
            tracing::warn!("Filter position unavailable: {}", e);
            None
        });

        let report = StatusReport {
            instrument: ctx.config().server.instrument_name.clone(),
            uptime_ms: (now - ctx.state.started).num_milliseconds(),
            current_command: ctx.state.coordinator.current().map(|unit| CurrentCommand {
                id: unit.command_id,
                kind: unit.kind.name(),
                running_ms: (now - unit.started).num_milliseconds(),
            }),
            exposure,
            temperature_c,
            filter_position,
            multrun: ctx.state.filenames.lock().await.multrun(),
        };
        to_result(&report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::ActiveUnit;
    use crate::test_support::{default_reply, evening, instant_rig};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_status_reports_current_command() {
        let rig = instant_rig(evening(), |_| {}, default_reply);
        let token = CancellationToken::new();
        let _guard = rig.state.coordinator.register(ActiveUnit {
            unit_id: 9,
            command_id: "m7".to_string(),
            kind: CommandKind::Multrun,
            token,
            started: evening(),
        });
        rig.clock.advance_ms(1_500);

        let (ctx, _acks) = rig.context(CommandKind::GetStatus);
        let result = GetStatusHandler.execute(&ctx).await.unwrap().unwrap();
        assert_eq!(result["instrument"], "KESTREL");
        assert_eq!(result["current_command"]["id"], "m7");
        assert_eq!(result["current_command"]["kind"], "MULTRUN");
        assert_eq!(result["current_command"]["running_ms"], 1_500);
        assert_eq!(result["exposure"]["state"], "idle");
        assert_eq!(result["temperature_c"], -100.0);
    }

    #[tokio::test]
    async fn test_abort_flags_current_command() {
        let rig = instant_rig(evening(), |_| {}, default_reply);
        let token = CancellationToken::new();
        let _guard = rig.state.coordinator.register(ActiveUnit {
            unit_id: 3,
            command_id: "t1".to_string(),
            kind: CommandKind::TwilightCalibrate,
            token: token.clone(),
            started: evening(),
        });

        let (ctx, _acks) = rig.context(CommandKind::Abort);
        let result = AbortHandler.execute(&ctx).await.unwrap().unwrap();
        assert!(token.is_cancelled());
        assert_eq!(result["aborted_id"], "t1");
        assert_eq!(result["aborted_kind"], "TWILIGHT_CALIBRATE");
    }
}
