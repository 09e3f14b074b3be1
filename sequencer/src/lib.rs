//! Kestrel Instrument Sequencer
//!
//! Command handling core for the Kestrel CCD camera. Clients connect over TCP
//! and send one command per connection; each connection runs as its own unit,
//! heavy commands take an exclusive lease on the detector, and ABORT /
//! GET_STATUS are always served alongside them.
//!
//! ## Commands
//!
//! - CONFIG, MULTRUN, MULTBIAS, MULTDARK
//! - ACQUIRE (sky-coordinate or brightest-object mode)
//! - TWILIGHT_CALIBRATE with a persisted completion ledger
//! - FOCUS (parabolic fit over a focus scan)
//! - ABORT, GET_STATUS

pub mod abort;
pub mod acquisition;
pub mod astrometry;
pub mod clock;
pub mod commands;
pub mod config;
pub mod context;
pub mod device_ops;
pub mod dispatcher;
pub mod error;
pub mod filenames;
pub mod focus;
pub mod ledger;
pub mod peer;
pub mod server;
pub mod sim_device;
pub mod state;
pub mod twilight;
pub mod unit;

#[cfg(test)]
mod test_support;

pub use abort::{AbortCoordinator, AbortReport, ActiveUnit};
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::{ConfigError, InstrumentConfig};
pub use device_ops::{DeviceError, DeviceHandle, DeviceOps, SharedDeviceOps};
pub use dispatcher::{dispatch, CommandKind};
pub use error::SequencerError;
pub use ledger::{CalibrationLedger, JsonLedgerStore, LedgerError, LedgerStore, MemoryLedgerStore, TaskSignature};
pub use peer::{PeerError, PeerGateway, PeerKind, SharedPeerGateway, TcpPeerGateway};
pub use server::Server;
pub use sim_device::SimulatedCamera;
pub use state::{InstrumentState, SharedState};
