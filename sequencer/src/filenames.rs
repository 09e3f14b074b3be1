//! Frame filename generation
//!
//! Frames are named `<code>_<type>_<yyyymmdd>_<multrun>_<run>_<window>_<pipeline>.fits`.
//! The date is the night the frame belongs to: anything before midday UTC is
//! counted against the previous evening. Multrun numbers restart every night and
//! runs restart with every multrun.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use std::path::PathBuf;

/// Frame type letter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureCode {
    Exposure,
    Bias,
    Dark,
    SkyFlat,
    Acquire,
    Focus,
    Standard,
}

impl ExposureCode {
    pub fn letter(&self) -> char {
        match self {
            ExposureCode::Exposure => 'e',
            ExposureCode::Bias => 'b',
            ExposureCode::Dark => 'd',
            ExposureCode::SkyFlat => 'f',
            ExposureCode::Acquire => 'a',
            ExposureCode::Focus => 'q',
            ExposureCode::Standard => 's',
        }
    }
}

/// Night a timestamp belongs to
pub fn night_date(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    if now.hour() < 12 {
        today - Duration::days(1)
    } else {
        today
    }
}

pub struct FrameFilenames {
    instrument_code: String,
    data_dir: PathBuf,
    night: NaiveDate,
    multrun: u32,
    run: u32,
}

impl FrameFilenames {
    pub fn new(instrument_code: impl Into<String>, data_dir: impl Into<PathBuf>, now: DateTime<Utc>) -> Self {
        Self {
            instrument_code: instrument_code.into(),
            data_dir: data_dir.into(),
            night: night_date(now),
            multrun: 0,
            run: 0,
        }
    }

    /// Continue numbering after the highest multrun already on disk for tonight
    pub fn resume(
        instrument_code: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        now: DateTime<Utc>,
    ) -> std::io::Result<Self> {
        let mut names = Self::new(instrument_code, data_dir, now);
        let entries = match std::fs::read_dir(&names.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(multrun) = names.parse_multrun(&entry.file_name().to_string_lossy()) {
                names.multrun = names.multrun.max(multrun);
            }
        }
        if names.multrun > 0 {
            tracing::info!(
                "Resuming frame numbering for night {} after multrun {}",
                names.night.format("%Y%m%d"),
                names.multrun
            );
        }
        Ok(names)
    }

    fn parse_multrun(&self, name: &str) -> Option<u32> {
        let stem = name.strip_suffix(".fits")?;
        let mut fields = stem.split('_');
        if fields.next()? != self.instrument_code {
            return None;
        }
        fields.next()?;
        if fields.next()? != self.night.format("%Y%m%d").to_string() {
            return None;
        }
        fields.next()?.parse().ok()
    }

    pub fn multrun(&self) -> u32 {
        self.multrun
    }

    /// Start a new multrun, rolling the numbering over at the night boundary
    pub fn next_multrun(&mut self, now: DateTime<Utc>) -> u32 {
        let night = night_date(now);
        if night != self.night {
            self.night = night;
            self.multrun = 0;
        }
        self.multrun += 1;
        self.run = 0;
        self.multrun
    }

    /// Path of the next raw frame in the current multrun
    pub fn next_run(&mut self, code: ExposureCode) -> PathBuf {
        self.run += 1;
        self.path(code, self.multrun, self.run, 0)
    }

    pub fn path(&self, code: ExposureCode, multrun: u32, run: u32, window: u32) -> PathBuf {
        self.data_dir.join(format!(
            "{}_{}_{}_{}_{}_{}_0.fits",
            self.instrument_code,
            code.letter(),
            self.night.format("%Y%m%d"),
            multrun,
            run,
            window
        ))
    }
}
