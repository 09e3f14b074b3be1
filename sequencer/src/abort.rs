//! Abort Coordinator
//!
//! Process-wide record of the one ordinary command currently executing. An
//! ABORT arriving on another connection cancels that command's token and pokes
//! the device's own abort primitives; the running command notices at its next
//! poll point and unwinds with the aborted error.

use crate::device_ops::SharedDeviceOps;
use crate::dispatcher::CommandKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// The registered executing unit
#[derive(Debug, Clone)]
pub struct ActiveUnit {
    pub unit_id: u64,
    pub command_id: String,
    pub kind: CommandKind,
    pub token: CancellationToken,
    pub started: DateTime<Utc>,
}

/// What an abort request found and did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AbortReport {
    /// Id of the command that was flagged, if one was running
    pub aborted_id: Option<String>,
    pub aborted_kind: Option<String>,
    pub exposure_aborted: bool,
    pub motion_aborted: bool,
}

pub struct AbortCoordinator {
    current: Mutex<Option<ActiveUnit>>,
    device: SharedDeviceOps,
}

impl AbortCoordinator {
    pub fn new(device: SharedDeviceOps) -> Self {
        Self {
            current: Mutex::new(None),
            device,
        }
    }

    /// Make `unit` the current unit until the returned guard is dropped
    pub fn register(self: &Arc<Self>, unit: ActiveUnit) -> ActiveUnitGuard {
        let unit_id = unit.unit_id;
        tracing::debug!("Unit {} ({} {}) is now current", unit_id, unit.kind.name(), unit.command_id);
        if let Ok(mut current) = self.current.lock() {
            if let Some(previous) = current.replace(unit) {
                tracing::warn!("Unit {} replaced unit {} as current", unit_id, previous.unit_id);
            }
        }
        ActiveUnitGuard {
            coordinator: self.clone(),
            unit_id,
        }
    }

    pub fn current(&self) -> Option<ActiveUnit> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    fn clear(&self, unit_id: u64) {
        if let Ok(mut current) = self.current.lock() {
            if current.as_ref().map(|u| u.unit_id) == Some(unit_id) {
                *current = None;
            }
        }
    }

    /// Flag the current unit and stop whatever the device is doing for it
    pub async fn request_abort(&self) -> AbortReport {
        let mut report = AbortReport::default();

        let active = self.current();
        match &active {
            Some(unit) => {
                tracing::warn!("Aborting {} {} (unit {})", unit.kind.name(), unit.command_id, unit.unit_id);
                unit.token.cancel();
                report.aborted_id = Some(unit.command_id.clone());
                report.aborted_kind = Some(unit.kind.name().to_string());
            }
            None => tracing::info!("Abort requested with no command running"),
        }

        match self.device.current_exposure_status().await {
            Ok(status) if status.in_progress() => match self.device.abort_exposure().await {
                Ok(()) => report.exposure_aborted = true,
                Err(e) => tracing::warn!("Failed to abort exposure: {}", e),
            },
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not read exposure status during abort: {}", e),
        }

        if active.is_some() {
            match self.device.abort_motion().await {
                Ok(()) => report.motion_aborted = true,
                Err(e) => tracing::warn!("Failed to abort mechanism motion: {}", e),
            }
        }

        report
    }
}

/// Clears the current unit on drop, unless another unit has replaced it
pub struct ActiveUnitGuard {
    coordinator: Arc<AbortCoordinator>,
    unit_id: u64,
}

impl Drop for ActiveUnitGuard {
    fn drop(&mut self) {
        self.coordinator.clear(self.unit_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_ops::DeviceOps;
    use crate::sim_device::{DeviceCall, SimulatedCamera};
    use std::time::Duration;

    fn unit(id: u64, token: CancellationToken) -> ActiveUnit {
        ActiveUnit {
            unit_id: id,
            command_id: format!("cmd-{}", id),
            kind: CommandKind::Multrun,
            token,
            started: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_abort_without_unit_is_a_no_op() {
        let camera = Arc::new(SimulatedCamera::new(0.0));
        let coordinator = AbortCoordinator::new(camera.clone());
        let report = coordinator.request_abort().await;
        assert_eq!(report, AbortReport::default());
        assert!(camera.calls().is_empty());
    }

    #[tokio::test]
    async fn test_abort_cancels_current_unit_and_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(SimulatedCamera::new(1.0));
        let coordinator = Arc::new(AbortCoordinator::new(camera.clone()));
        let token = CancellationToken::new();
        let _guard = coordinator.register(unit(1, token.clone()));

        let exposing = {
            let camera = camera.clone();
            let path = dir.path().join("x.fits");
            tokio::spawn(async move { camera.expose(true, None, 60_000, &[path]).await })
        };
        for _ in 0..100 {
            if camera.current_exposure_status().await.unwrap().in_progress() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = coordinator.request_abort().await;
        assert!(token.is_cancelled());
        assert_eq!(report.aborted_id.as_deref(), Some("cmd-1"));
        assert!(report.exposure_aborted);
        assert!(report.motion_aborted);
        assert!(exposing.await.unwrap().is_err());
        assert!(camera.calls().contains(&DeviceCall::AbortMotion));
    }

    #[tokio::test]
    async fn test_guard_clears_only_its_own_unit() {
        let camera = Arc::new(SimulatedCamera::new(0.0));
        let coordinator = Arc::new(AbortCoordinator::new(camera));

        let first = coordinator.register(unit(1, CancellationToken::new()));
        let _second = coordinator.register(unit(2, CancellationToken::new()));
        drop(first);
        assert_eq!(coordinator.current().map(|u| u.unit_id), Some(2));
    }
}
