//! Persisted Calibration Ledger
//!
//! Remembers when each twilight calibration task last completed, keyed by the
//! task's binning, slide and filter signature. The scheduler loads it at the
//! start of a run and saves it straight after every fully completed task.

use crate::config::CalibrationTaskConfig;
use crate::device_ops::SlidePosition;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Ledger {path} is not valid: {message}")]
    Format { path: PathBuf, message: String },
}

/// Ledger key of one calibration task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskSignature(String);

impl TaskSignature {
    pub fn new(binning: u32, lower: SlidePosition, upper: SlidePosition, filter: &str) -> Self {
        Self(format!(
            "bin{}.lower-{}.upper-{}.filter-{}",
            binning,
            lower.as_str(),
            upper.as_str(),
            filter
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&CalibrationTaskConfig> for TaskSignature {
    fn from(task: &CalibrationTaskConfig) -> Self {
        Self::new(task.binning, task.lower_slide, task.upper_slide, &task.filter)
    }
}

impl fmt::Display for TaskSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task signature to last completion time, UTC milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationLedger {
    entries: BTreeMap<String, i64>,
}

impl CalibrationLedger {
    pub fn last_completed(&self, signature: &TaskSignature) -> Option<DateTime<Utc>> {
        self.entries
            .get(signature.as_str())
            .and_then(|ms| Utc.timestamp_millis_opt(*ms).single())
    }

    pub fn record(&mut self, signature: &TaskSignature, at: DateTime<Utc>) {
        self.entries.insert(signature.as_str().to_string(), at.timestamp_millis());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Durable storage for the ledger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load(&self) -> Result<CalibrationLedger, LedgerError>;

    async fn save(&self, ledger: &CalibrationLedger) -> Result<(), LedgerError>;
}

/// Ledger kept as a JSON object on disk
pub struct JsonLedgerStore {
    path: PathBuf,
}

impl JsonLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl LedgerStore for JsonLedgerStore {
    async fn load(&self) -> Result<CalibrationLedger, LedgerError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No calibration ledger at {}, starting empty", self.path.display());
                return Ok(CalibrationLedger::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_str(&content).map_err(|e| LedgerError::Format {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    async fn save(&self, ledger: &CalibrationLedger) -> Result<(), LedgerError> {
        let body = serde_json::to_string_pretty(ledger).map_err(|e| LedgerError::Format {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        // Write beside the target and rename over it, so readers only ever
        // see the old or the new ledger.
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
            }
        }
        tokio::fs::write(&tmp_path, body).await.map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| self.io_error(e))?;

        tracing::debug!("Saved calibration ledger ({} tasks) to {}", ledger.len(), self.path.display());
        Ok(())
    }
}

/// In-memory ledger, counting saves
#[derive(Default)]
pub struct MemoryLedgerStore {
    ledger: Mutex<CalibrationLedger>,
    saves: Mutex<usize>,
}

impl MemoryLedgerStore {
    pub fn new(ledger: CalibrationLedger) -> Self {
        Self {
            ledger: Mutex::new(ledger),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> CalibrationLedger {
        self.ledger.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|s| *s).unwrap_or(0)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load(&self) -> Result<CalibrationLedger, LedgerError> {
        Ok(self.snapshot())
    }

    async fn save(&self, ledger: &CalibrationLedger) -> Result<(), LedgerError> {
        if let Ok(mut stored) = self.ledger.lock() {
            *stored = ledger.clone();
        }
        if let Ok(mut saves) = self.saves.lock() {
            *saves += 1;
        }
        Ok(())
    }
}
