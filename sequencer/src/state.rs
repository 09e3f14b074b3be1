//! Shared instrument state
//!
//! One [`InstrumentState`] lives for the whole server and is shared by every
//! execution unit.

use crate::abort::AbortCoordinator;
use crate::clock::SharedClock;
use crate::config::InstrumentConfig;
use crate::device_ops::{DeviceHandle, SharedDeviceOps};
use crate::filenames::FrameFilenames;
use crate::ledger::LedgerStore;
use crate::peer::SharedPeerGateway;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct InstrumentState {
    pub config: InstrumentConfig,
    /// The single device and its exclusive lease
    pub device: DeviceHandle,
    pub peers: SharedPeerGateway,
    pub coordinator: Arc<AbortCoordinator>,
    pub ledger: Arc<dyn LedgerStore>,
    pub clock: SharedClock,
    pub filenames: Mutex<FrameFilenames>,
    pub started: DateTime<Utc>,
    next_unit_id: AtomicU64,
}

pub type SharedState = Arc<InstrumentState>;

impl InstrumentState {
    /// Build the state, resuming frame numbering from the data directory
    pub fn new(
        config: InstrumentConfig,
        device: SharedDeviceOps,
        peers: SharedPeerGateway,
        ledger: Arc<dyn LedgerStore>,
        clock: SharedClock,
    ) -> std::io::Result<Self> {
        let now = clock.now();
        let filenames = FrameFilenames::resume(
            config.files.instrument_code.clone(),
            config.files.data_dir.clone(),
            now,
        )?;
        Ok(Self {
            device: DeviceHandle::new(device.clone()),
            coordinator: Arc::new(AbortCoordinator::new(device)),
            filenames: Mutex::new(filenames),
            started: now,
            next_unit_id: AtomicU64::new(1),
            config,
            peers,
            ledger,
            clock,
        })
    }

    pub fn next_unit_id(&self) -> u64 {
        self.next_unit_id.fetch_add(1, Ordering::Relaxed)
    }
}
