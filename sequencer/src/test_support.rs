//! Shared fixtures for unit tests

use crate::clock::Clock;
use crate::config::{
    CalibrationTaskConfig, CountThresholds, InstrumentConfig, TelescopeOffset,
};
use crate::context::{Acknowledger, UnitContext};
use crate::device_ops::{
    DeviceOps, DeviceResult, Dimensions, ExposureStatus, MechanismKind, SlidePosition,
};
use crate::dispatcher::CommandKind;
use crate::ledger::MemoryLedgerStore;
use crate::peer::{PeerError, PeerGateway, PeerKind};
use crate::sim_device::SimulatedCamera;
use crate::state::InstrumentState;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use kestrel_protocol::peer::{ReducedCalibration, ReducedExposure};
use kestrel_protocol::{Acknowledge, Command, Completion};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 19:00 UTC, a dusk run
pub fn evening() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 14, 19, 0, 0).unwrap()
}

/// 05:00 UTC, a dawn run
pub fn morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 5, 0, 0).unwrap()
}

pub fn test_config(data_dir: &Path) -> InstrumentConfig {
    let mut config = InstrumentConfig::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.acknowledge_margin_ms = 1_000;
    config.server.readout_ms = 100;
    config.peers.poll_interval_ms = 10;
    config.peers.beam_steering.enabled = false;
    config.files.data_dir = data_dir.to_path_buf();
    config.filters.insert("SDSS-R".to_string(), 3);
    config.filters.insert("SDSS-G".to_string(), 2);
    config.filters.insert("Bessell-B".to_string(), 1);
    config.acquire.exposure_ms = 1_000;
    config.acquire.max_offset_count = 3;

    let tw = &mut config.twilight;
    tw.min_exposure_ms = 1_000;
    tw.max_exposure_ms = 60_000;
    tw.frame_overhead_ms = 1_000;
    tw.ledger_path = data_dir.join("ledger.json");
    tw.counts = vec![
        CountThresholds { binning: 1, min: 10_000.0, best: 30_000.0, max: 50_000.0 },
        CountThresholds { binning: 2, min: 10_000.0, best: 30_000.0, max: 50_000.0 },
    ];
    tw.offsets = vec![
        TelescopeOffset { ra_arcsec: 20.0, dec_arcsec: 20.0 },
        TelescopeOffset { ra_arcsec: -20.0, dec_arcsec: -20.0 },
    ];
    config
}

pub fn task(binning: u32, filter: &str, sensitivity: f64) -> CalibrationTaskConfig {
    CalibrationTaskConfig {
        binning,
        filter: filter.to_string(),
        lower_slide: SlidePosition::Stowed,
        upper_slide: SlidePosition::Stowed,
        sensitivity,
        frequency_ms: 3_600_000,
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance_ms(&self, ms: u64) {
        *self.now.lock().unwrap() += Duration::milliseconds(ms as i64);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Simulated camera whose exposures advance a manual clock
pub struct ClockedCamera {
    pub inner: Arc<SimulatedCamera>,
    clock: Arc<ManualClock>,
}

#[async_trait]
impl DeviceOps for ClockedCamera {
    async fn configure_dimensions(&self, dimensions: &Dimensions) -> DeviceResult<()> {
        self.inner.configure_dimensions(dimensions).await
    }

    async fn move_filter_wheel(&self, position: u32) -> DeviceResult<()> {
        self.inner.move_filter_wheel(position).await
    }

    async fn move_mechanism(&self, kind: MechanismKind, position: SlidePosition) -> DeviceResult<()> {
        self.inner.move_mechanism(kind, position).await
    }

    async fn filter_wheel_position(&self) -> DeviceResult<Option<u32>> {
        self.inner.filter_wheel_position().await
    }

    async fn abort_motion(&self) -> DeviceResult<()> {
        self.inner.abort_motion().await
    }

    async fn expose(
        &self,
        open_shutter: bool,
        start_time: Option<DateTime<Utc>>,
        duration_ms: u64,
        output_paths: &[PathBuf],
    ) -> DeviceResult<()> {
        self.inner
            .expose(open_shutter, start_time, duration_ms, output_paths)
            .await?;
        self.clock.advance_ms(duration_ms);
        Ok(())
    }

    async fn abort_exposure(&self) -> DeviceResult<()> {
        self.inner.abort_exposure().await
    }

    async fn current_exposure_status(&self) -> DeviceResult<ExposureStatus> {
        self.inner.current_exposure_status().await
    }

    async fn current_temperature(&self) -> DeviceResult<f64> {
        self.inner.current_temperature().await
    }
}

type Responder = Box<dyn Fn(PeerKind, &Command) -> Completion + Send + Sync>;

/// Peer gateway answering from a closure and recording every request
pub struct ScriptedPeers {
    responder: Responder,
    sent: Mutex<Vec<(PeerKind, Command)>>,
}

impl ScriptedPeers {
    pub fn new(responder: impl Fn(PeerKind, &Command) -> Completion + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Parameters of every request of the given kind, oldest first
    pub fn sent(&self, kind: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.kind == kind)
            .map(|(_, c)| c.params.clone())
            .collect()
    }

    pub fn sent_kinds(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, c)| c.kind.clone()).collect()
    }
}

#[async_trait]
impl PeerGateway for ScriptedPeers {
    async fn send(
        &self,
        peer: PeerKind,
        command: Command,
        abort: &CancellationToken,
        check_abort: bool,
    ) -> Completion {
        self.sent.lock().unwrap().push((peer, command.clone()));
        if check_abort && abort.is_cancelled() {
            return PeerError::Aborted.into_completion(peer, &command.id);
        }
        (self.responder)(peer, &command)
    }
}

pub fn reduced_exposure(filename: &str, x_pix: f64, y_pix: f64, seeing_arcsec: f64) -> ReducedExposure {
    ReducedExposure {
        filename: filename.to_string(),
        counts: 1_000.0,
        seeing_arcsec,
        x_pix,
        y_pix,
        wcs: None,
    }
}

fn filename_param(command: &Command) -> String {
    command.params["filename"].as_str().unwrap_or_default().to_string()
}

/// Pipeline replies: star at (512, 512), 30000 mean counts on flats
pub fn default_reply(_peer: PeerKind, command: &Command) -> Completion {
    let result = match command.kind.as_str() {
        "REDUCE_EXPOSE" => serde_json::to_value(reduced_exposure(&filename_param(command), 512.0, 512.0, 1.2)).unwrap(),
        "REDUCE_CALIBRATE" => serde_json::to_value(ReducedCalibration {
            filename: filename_param(command),
            mean_counts: 30_000.0,
            peak_counts: 40_000.0,
        })
        .unwrap(),
        _ => Value::Null,
    };
    Completion::success(&command.id, Some(result))
}

/// Everything a test needs around an [`InstrumentState`]
pub struct TestRig {
    pub state: Arc<InstrumentState>,
    pub camera: Arc<SimulatedCamera>,
    pub peers: Arc<ScriptedPeers>,
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<MemoryLedgerStore>,
    pub dir: tempfile::TempDir,
}

impl TestRig {
    pub fn build(
        time_scale: f64,
        now: DateTime<Utc>,
        configure: impl FnOnce(&mut InstrumentConfig),
        responder: impl Fn(PeerKind, &Command) -> Completion + Send + Sync + 'static,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        configure(&mut config);

        let camera = Arc::new(SimulatedCamera::new(time_scale));
        let clock = Arc::new(ManualClock::new(now));
        let device = Arc::new(ClockedCamera {
            inner: camera.clone(),
            clock: clock.clone(),
        });
        let peers = Arc::new(ScriptedPeers::new(responder));
        let ledger = Arc::new(MemoryLedgerStore::default());

        let state = InstrumentState::new(config, device, peers.clone(), ledger.clone(), clock.clone()).unwrap();
        Self {
            state: Arc::new(state),
            camera,
            peers,
            clock,
            ledger,
            dir,
        }
    }

    /// A context for calling engines directly, with the unleased device
    pub fn context(&self, kind: CommandKind) -> (UnitContext<'_>, mpsc::UnboundedReceiver<Acknowledge>) {
        let (acks, rx) = Acknowledger::channel("test");
        let ctx = UnitContext::new(
            &self.state,
            self.state.device.ops().as_ref(),
            "test",
            kind,
            CancellationToken::new(),
            acks,
        );
        (ctx, rx)
    }
}

/// Real-time camera and default peer replies, for server tests
pub fn test_state() -> TestRig {
    TestRig::build(1.0, evening(), |_| {}, default_reply)
}

/// Instant exposures, for engine tests
pub fn instant_rig(
    now: DateTime<Utc>,
    configure: impl FnOnce(&mut InstrumentConfig),
    responder: impl Fn(PeerKind, &Command) -> Completion + Send + Sync + 'static,
) -> TestRig {
    TestRig::build(0.0, now, configure, responder)
}
