//! Command Dispatcher
//!
//! The command set is closed: raw type names resolve to a [`CommandKind`] with
//! a plain match, and each kind has exactly one handler. Unknown names resolve
//! to [`CommandKind::Unsupported`], whose handler fails the command without
//! touching the connection or the server.

use crate::commands::{
    AbortHandler, AcquireHandler, CommandHandler, ConfigHandler, FocusHandler, GetStatusHandler,
    MultbiasHandler, MultdarkHandler, MultrunHandler, TwilightCalibrateHandler, UnsupportedHandler,
};
use crate::error::SequencerError;
use kestrel_protocol::Command;
use serde::de::DeserializeOwned;

/// Error base for failures raised by the server itself rather than a handler
pub const SERVER_ERROR_BASE: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Abort,
    GetStatus,
    Config,
    Multrun,
    Multbias,
    Multdark,
    Acquire,
    TwilightCalibrate,
    Focus,
    Unsupported,
}

impl CommandKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "ABORT" => CommandKind::Abort,
            "GET_STATUS" => CommandKind::GetStatus,
            "CONFIG" => CommandKind::Config,
            "MULTRUN" => CommandKind::Multrun,
            "MULTBIAS" => CommandKind::Multbias,
            "MULTDARK" => CommandKind::Multdark,
            "ACQUIRE" => CommandKind::Acquire,
            "TWILIGHT_CALIBRATE" => CommandKind::TwilightCalibrate,
            "FOCUS" => CommandKind::Focus,
            _ => CommandKind::Unsupported,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Abort => "ABORT",
            CommandKind::GetStatus => "GET_STATUS",
            CommandKind::Config => "CONFIG",
            CommandKind::Multrun => "MULTRUN",
            CommandKind::Multbias => "MULTBIAS",
            CommandKind::Multdark => "MULTDARK",
            CommandKind::Acquire => "ACQUIRE",
            CommandKind::TwilightCalibrate => "TWILIGHT_CALIBRATE",
            CommandKind::Focus => "FOCUS",
            CommandKind::Unsupported => "UNSUPPORTED",
        }
    }

    /// Interrupt commands run without the device lease and never become current
    pub fn is_interrupt(&self) -> bool {
        matches!(self, CommandKind::Abort | CommandKind::GetStatus)
    }

    pub fn error_base(&self) -> i32 {
        match self {
            CommandKind::Abort => 600,
            CommandKind::GetStatus => 700,
            CommandKind::Config => 800,
            CommandKind::Multrun => 1200,
            CommandKind::Multbias => 1300,
            CommandKind::Multdark => 1400,
            CommandKind::Acquire => 1900,
            CommandKind::TwilightCalibrate => 2300,
            CommandKind::Focus => 2600,
            CommandKind::Unsupported => 0,
        }
    }
}

fn params<T: DeserializeOwned>(command: &Command) -> Result<T, SequencerError> {
    serde_json::from_value(command.params.clone()).map_err(|e| {
        SequencerError::InvalidParameter(format!("{} parameters: {}", command.kind, e))
    })
}

/// Resolve a command to a fresh handler holding its decoded parameters
pub fn dispatch(command: &Command) -> Result<Box<dyn CommandHandler>, SequencerError> {
    let handler: Box<dyn CommandHandler> = match CommandKind::from_name(&command.kind) {
        CommandKind::Abort => Box::new(AbortHandler),
        CommandKind::GetStatus => Box::new(GetStatusHandler),
        CommandKind::Config => Box::new(ConfigHandler::new(params(command)?)),
        CommandKind::Multrun => Box::new(MultrunHandler::new(params(command)?)),
        CommandKind::Multbias => Box::new(MultbiasHandler::new(params(command)?)),
        CommandKind::Multdark => Box::new(MultdarkHandler::new(params(command)?)),
        CommandKind::Acquire => Box::new(AcquireHandler::new(params(command)?)),
        CommandKind::TwilightCalibrate => Box::new(TwilightCalibrateHandler::new(params(command)?)),
        CommandKind::Focus => Box::new(FocusHandler::new(params(command)?)),
        CommandKind::Unsupported => Box::new(UnsupportedHandler::new(command.kind.clone())),
    };
    handler.check_params()?;
    Ok(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_names_round_trip() {
        for kind in [
            CommandKind::Abort,
            CommandKind::GetStatus,
            CommandKind::Config,
            CommandKind::Multrun,
            CommandKind::Multbias,
            CommandKind::Multdark,
            CommandKind::Acquire,
            CommandKind::TwilightCalibrate,
            CommandKind::Focus,
        ] {
            assert_eq!(CommandKind::from_name(kind.name()), kind);
        }
    }

    #[test]
    fn test_unknown_name_gets_unsupported_handler() {
        let command = Command::new("1", "REBOOT", json!(null));
        let handler = dispatch(&command).unwrap();
        assert_eq!(handler.kind(), CommandKind::Unsupported);
    }

    #[test]
    fn test_only_abort_and_status_are_interrupts() {
        assert!(CommandKind::Abort.is_interrupt());
        assert!(CommandKind::GetStatus.is_interrupt());
        assert!(!CommandKind::Multrun.is_interrupt());
        assert!(!CommandKind::Unsupported.is_interrupt());
    }

    #[test]
    fn test_bad_parameters_are_invalid_parameter() {
        let command = Command::new("1", "MULTRUN", json!({"exposure_ms": "long"}));
        match dispatch(&command) {
            Err(SequencerError::InvalidParameter(msg)) => assert!(msg.contains("MULTRUN")),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("bad parameters accepted"),
        }
    }

    #[test]
    fn test_out_of_range_durations_rejected_at_decode() {
        for (kind, params) in [
            ("MULTRUN", json!({"exposure_ms": u64::MAX, "count": 1})),
            ("MULTDARK", json!({"exposure_ms": u64::MAX, "count": 2})),
            ("TWILIGHT_CALIBRATE", json!({"time_to_complete_ms": u64::MAX})),
            ("FOCUS", json!({"start_mm": 0.0, "end_mm": 1.0, "step_mm": 0.5, "exposure_ms": u64::MAX})),
        ] {
            let command = Command::new("1", kind, params);
            assert!(
                matches!(dispatch(&command), Err(SequencerError::InvalidParameter(_))),
                "{} accepted an out of range duration",
                kind
            );
        }
    }

    #[test]
    fn test_acquire_parameters_decode() {
        let command = Command::new("1", "ACQUIRE", json!({"mode": "none"}));
        let handler = dispatch(&command).unwrap();
        assert_eq!(handler.kind(), CommandKind::Acquire);
    }
}
