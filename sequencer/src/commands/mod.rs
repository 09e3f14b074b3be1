//! Command handlers
//!
//! One handler type per command kind. The dispatcher builds a fresh handler
//! for every command, holding that command's decoded parameters.

mod acquire;
mod config;
mod exposure;
mod focus;
mod interrupt;
mod twilight;

pub use acquire::{AcquireHandler, AcquireParams};
pub use config::{ConfigHandler, ConfigParams};
pub use exposure::{
    MultbiasHandler, MultbiasParams, MultdarkHandler, MultdarkParams, MultrunHandler, MultrunParams,
};
pub use focus::{FocusHandler, FocusParams};
pub use interrupt::{AbortHandler, GetStatusHandler};
pub use twilight::{TwilightCalibrateHandler, TwilightParams};

use crate::config::InstrumentConfig;
use crate::context::UnitContext;
use crate::dispatcher::CommandKind;
use crate::error::SequencerError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Longest exposure or time budget a client may ask for, one day
pub const MAX_REQUESTED_MS: u64 = 86_400_000;

/// Reject a client supplied duration above [`MAX_REQUESTED_MS`]
pub(crate) fn check_requested_ms(name: &str, value_ms: u64) -> Result<(), SequencerError> {
    if value_ms > MAX_REQUESTED_MS {
        return Err(SequencerError::InvalidParameter(format!(
            "{} {}ms exceeds the {}ms limit",
            name, value_ms, MAX_REQUESTED_MS
        )));
    }
    Ok(())
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn kind(&self) -> CommandKind;

    /// Range checks on the decoded parameters, run before anything is acknowledged
    fn check_params(&self) -> Result<(), SequencerError> {
        Ok(())
    }

    /// Deadline carried by the first acknowledge
    fn initial_ack_ms(&self, config: &InstrumentConfig) -> u64 {
        config.server.acknowledge_margin_ms
    }

    /// Run the command; the returned value becomes the completion's result
    async fn execute(&self, ctx: &UnitContext<'_>) -> Result<Option<Value>, SequencerError>;
}

/// Serialize a handler result into the completion payload
pub(crate) fn to_result<T: Serialize>(value: &T) -> Result<Option<Value>, SequencerError> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| SequencerError::Internal(format!("failed to encode result: {}", e)))
}

/// Answers any command name the dispatcher does not know
pub struct UnsupportedHandler {
    name: String,
}

impl UnsupportedHandler {
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

#[async_trait]
impl CommandHandler for UnsupportedHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::Unsupported
    }

    async fn execute(&self, _ctx: &UnitContext<'_>) -> Result<Option<Value>, SequencerError> {
        Err(SequencerError::Unsupported(self.name.clone()))
    }
}
