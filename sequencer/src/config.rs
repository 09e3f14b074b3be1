//! Instrument configuration
//!
//! Loaded once at startup from a TOML file and handed to the core by value.
//! Every section has defaults so a minimal file only needs the values that
//! differ between installations.

use crate::device_ops::{Amplifier, SlidePosition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TOML config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub server: ServerConfig,
    pub peers: PeersConfig,
    pub detector: DetectorConfig,
    /// Filter name to filter wheel position
    pub filters: BTreeMap<String, u32>,
    pub files: FilesConfig,
    pub acquire: AcquireConfig,
    pub twilight: TwilightConfig,
    pub focus: FocusConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub instrument_name: String,
    /// Deadline margin added to every acknowledge
    pub acknowledge_margin_ms: u64,
    /// Time to read the detector out after an exposure
    pub readout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8472,
            instrument_name: "KESTREL".to_string(),
            acknowledge_margin_ms: 20_000,
            readout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerEndpoint {
    pub address: String,
    pub port: u16,
    /// Only honoured for the beam-steering peer
    pub enabled: bool,
}

impl PeerEndpoint {
    fn local(port: u16) -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port,
            enabled: true,
        }
    }
}

impl Default for PeerEndpoint {
    fn default() -> Self {
        Self::local(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// How often a blocked peer call checks its abort flag
    pub poll_interval_ms: u64,
    /// Longest wait for the offset reset sent while unwinding a command
    pub reset_timeout_ms: u64,
    pub pointing: PeerEndpoint,
    pub beam_steering: PeerEndpoint,
    pub pipeline: PeerEndpoint,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            reset_timeout_ms: 5_000,
            pointing: PeerEndpoint::local(13021),
            beam_steering: PeerEndpoint::local(6683),
            pipeline: PeerEndpoint::local(6880),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub columns: u32,
    pub rows: u32,
    /// Unbinned plate scale in arcseconds per pixel
    pub plate_scale_arcsec: f64,
    pub max_binning: u32,
    pub amplifier: Amplifier,
    /// Focus offset sent to beam-steering after each CONFIG
    pub focus_offset_mm: f64,
    /// Drive the in-process simulated camera instead of a native driver
    pub simulate: bool,
    /// Simulated exposure wall time as a fraction of the requested length
    pub simulate_time_scale: f64,
    /// Bounds every exposure is clamped to before reaching the camera
    pub min_exposure_ms: u64,
    pub max_exposure_ms: u64,
}

impl DetectorConfig {
    pub fn clamp_exposure_ms(&self, requested_ms: u64) -> u64 {
        requested_ms.clamp(self.min_exposure_ms, self.max_exposure_ms)
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            columns: 4096,
            rows: 4112,
            plate_scale_arcsec: 0.15,
            max_binning: 4,
            amplifier: Amplifier::BottomLeft,
            focus_offset_mm: 0.0,
            simulate: true,
            simulate_time_scale: 1.0,
            min_exposure_ms: 0,
            max_exposure_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub data_dir: PathBuf,
    /// Single letter prefix of every frame filename
    pub instrument_code: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/kestrel/data"),
            instrument_code: "k".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquireConfig {
    pub exposure_ms: u64,
    pub binning: u32,
    /// Offsets that may be issued before acquisition gives up
    pub max_offset_count: u32,
    pub wcs_threshold_arcsec: f64,
    pub brightest_threshold_arcsec: f64,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            exposure_ms: 10_000,
            binning: 2,
            max_offset_count: 5,
            wcs_threshold_arcsec: 1.0,
            brightest_threshold_arcsec: 1.0,
        }
    }
}

/// Per-binning mean count thresholds for twilight flats
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CountThresholds {
    pub binning: u32,
    pub min: f64,
    pub best: f64,
    pub max: f64,
}

/// One candidate twilight flat configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTaskConfig {
    pub binning: u32,
    pub filter: String,
    #[serde(default)]
    pub lower_slide: SlidePosition,
    #[serde(default)]
    pub upper_slide: SlidePosition,
    /// Relative light sensitivity of this configuration
    pub sensitivity: f64,
    /// Minimum time between completed runs of this task
    pub frequency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelescopeOffset {
    pub ra_arcsec: f64,
    pub dec_arcsec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwilightConfig {
    pub min_exposure_ms: u64,
    pub max_exposure_ms: u64,
    /// Readout, reduction and mechanism overhead per frame
    pub frame_overhead_ms: u64,
    pub ledger_path: PathBuf,
    /// Scratch frame name inside the data directory
    pub scratch_name: String,
    /// UTC hour from which a run is treated as dusk
    pub dusk_from_hour: u32,
    pub counts: Vec<CountThresholds>,
    pub sunset: Vec<CalibrationTaskConfig>,
    pub sunrise: Vec<CalibrationTaskConfig>,
    pub offsets: Vec<TelescopeOffset>,
}

impl Default for TwilightConfig {
    fn default() -> Self {
        Self {
            min_exposure_ms: 1_000,
            max_exposure_ms: 60_000,
            frame_overhead_ms: 15_000,
            ledger_path: PathBuf::from("/var/lib/kestrel/twilight_ledger.json"),
            scratch_name: "twilight_calibrate.fits".to_string(),
            dusk_from_hour: 12,
            counts: Vec::new(),
            sunset: Vec::new(),
            sunrise: Vec::new(),
            offsets: vec![TelescopeOffset::default()],
        }
    }
}

impl TwilightConfig {
    pub fn thresholds(&self, binning: u32) -> Option<&CountThresholds> {
        self.counts.iter().find(|c| c.binning == binning)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    pub exposure_ms: u64,
    pub binning: u32,
    pub refinement_passes: u32,
    /// Best-focus seeing above this is rejected as implausible
    pub max_sensible_seeing_arcsec: f64,
    /// Smallest curvature, in normalised focus units, accepted as a real minimum
    pub min_curvature: f64,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            exposure_ms: 5_000,
            binning: 2,
            refinement_passes: 32,
            max_sensible_seeing_arcsec: 10.0,
            min_curvature: 1e-3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl InstrumentConfig {
    /// Load and validate a TOML config file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        tracing::info!("Loaded instrument configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.detector.columns == 0 || self.detector.rows == 0 {
            return invalid("detector dimensions must be non-zero".to_string());
        }
        if self.detector.plate_scale_arcsec <= 0.0 {
            return invalid("detector.plate_scale_arcsec must be positive".to_string());
        }
        if self.detector.max_binning == 0 {
            return invalid("detector.max_binning must be at least 1".to_string());
        }
        if self.detector.min_exposure_ms > self.detector.max_exposure_ms {
            return invalid(format!(
                "detector exposure range {}..{}ms is empty",
                self.detector.min_exposure_ms, self.detector.max_exposure_ms
            ));
        }
        for (name, endpoint) in [
            ("pointing", &self.peers.pointing),
            ("pipeline", &self.peers.pipeline),
        ] {
            if !endpoint.enabled {
                return invalid(format!("peers.{} cannot be disabled", name));
            }
            if endpoint.port == 0 {
                return invalid(format!("peers.{}.port must be set", name));
            }
        }
        if self.peers.beam_steering.enabled && self.peers.beam_steering.port == 0 {
            return invalid("peers.beam_steering.port must be set when enabled".to_string());
        }
        if self.peers.poll_interval_ms == 0 {
            return invalid("peers.poll_interval_ms must be positive".to_string());
        }
        if self.peers.reset_timeout_ms == 0 {
            return invalid("peers.reset_timeout_ms must be positive".to_string());
        }

        for (name, binning) in [("acquire", self.acquire.binning), ("focus", self.focus.binning)] {
            if binning == 0 || binning > self.detector.max_binning {
                return invalid(format!(
                    "{}.binning {} outside 1..={}",
                    name, binning, self.detector.max_binning
                ));
            }
        }
        if self.focus.refinement_passes == 0 {
            return invalid("focus.refinement_passes must be at least 1".to_string());
        }

        let tw = &self.twilight;
        if tw.min_exposure_ms == 0 || tw.min_exposure_ms > tw.max_exposure_ms {
            return invalid(format!(
                "twilight exposure range {}..{}ms is empty",
                tw.min_exposure_ms, tw.max_exposure_ms
            ));
        }
        if tw.min_exposure_ms < self.detector.min_exposure_ms || tw.max_exposure_ms > self.detector.max_exposure_ms {
            return invalid(format!(
                "twilight exposure range {}..{}ms must lie inside the detector range {}..{}ms",
                tw.min_exposure_ms, tw.max_exposure_ms, self.detector.min_exposure_ms, self.detector.max_exposure_ms
            ));
        }
        for counts in &tw.counts {
            if !(counts.min < counts.best && counts.best < counts.max) {
                return invalid(format!(
                    "twilight counts for binning {} must satisfy min < best < max",
                    counts.binning
                ));
            }
        }
        if tw.offsets.is_empty() {
            return invalid("twilight.offsets needs at least one entry".to_string());
        }
        for task in tw.sunset.iter().chain(tw.sunrise.iter()) {
            if tw.thresholds(task.binning).is_none() {
                return invalid(format!("no twilight counts for binning {}", task.binning));
            }
            if task.binning == 0 || task.binning > self.detector.max_binning {
                return invalid(format!("twilight task binning {} out of range", task.binning));
            }
            if !self.filters.contains_key(&task.filter) {
                return invalid(format!("twilight task uses unknown filter '{}'", task.filter));
            }
            if task.sensitivity <= 0.0 {
                return invalid(format!(
                    "twilight task '{}' sensitivity must be positive",
                    task.filter
                ));
            }
            if i64::try_from(task.frequency_ms).is_err() {
                return invalid(format!(
                    "twilight task '{}' frequency_ms {} is out of range",
                    task.filter, task.frequency_ms
                ));
            }
        }
        if tw.dusk_from_hour > 23 {
            return invalid("twilight.dusk_from_hour must be 0..=23".to_string());
        }

        Ok(())
    }

    /// Unbinned plate scale multiplied by binning
    pub fn binned_plate_scale(&self, binning: u32) -> f64 {
        self.detector.plate_scale_arcsec * binning as f64
    }
}
