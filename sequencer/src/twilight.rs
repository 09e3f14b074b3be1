//! Twilight Scheduler
//!
//! Takes sky flats while twilight lasts. Tasks are tried in priority order,
//! skipping any completed more recently than its frequency allows. The running
//! exposure length follows the sky: it is carried from task to task (scaled
//! for sensitivity and binning) and corrected toward the best count level after
//! every rejected frame.
//!
//! At dusk the sky darkens, so a run seeds at the minimum exposure and stops
//! once a frame would need more than the maximum. At dawn it is the other way
//! round.

use crate::config::{CalibrationTaskConfig, CountThresholds, TelescopeOffset};
use crate::context::UnitContext;
use crate::device_ops::{Dimensions, MechanismKind};
use crate::error::SequencerError;
use crate::filenames::ExposureCode;
use crate::ledger::{CalibrationLedger, TaskSignature};
use crate::peer::PeerKind;
use chrono::{DateTime, Duration, Timelike, Utc};
use kestrel_protocol::peer::{OffsetRaDec, ReduceCalibrate};
use serde::Serialize;
use std::path::PathBuf;

/// Milliseconds as a chrono duration, `None` if out of range
fn millis(ms: u64) -> Option<Duration> {
    i64::try_from(ms).ok().and_then(Duration::try_milliseconds)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TwilightDirection {
    Dusk,
    Dawn,
}

impl TwilightDirection {
    pub fn at(now: DateTime<Utc>, dusk_from_hour: u32) -> Self {
        if now.hour() >= dusk_from_hour {
            TwilightDirection::Dusk
        } else {
            TwilightDirection::Dawn
        }
    }
}

/// Classification of a flat against its binning's count thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameState {
    Underexposed,
    Ok,
    Overexposed,
}

pub fn classify(mean_counts: f64, thresholds: &CountThresholds) -> FrameState {
    if mean_counts < thresholds.min {
        FrameState::Underexposed
    } else if mean_counts > thresholds.max {
        FrameState::Overexposed
    } else {
        FrameState::Ok
    }
}

/// Exposure length and outcome of the previous frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub exposure_ms: u64,
    pub state: FrameState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TasksExhausted,
    BudgetExhausted,
    /// Dusk, and a frame would need more than the maximum exposure
    SkyTooDark,
    /// Dawn, and a frame would need less than the minimum exposure
    SkyTooBright,
}

/// What to do with a requested exposure length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureDecision {
    Use(u64),
    /// Clamping was refused: the same bound was just tried and rejected
    AbandonTask,
    StopRun(StopReason),
}

/// Bring a requested exposure into `[min_ms, max_ms]`.
///
/// Crossing the bound the sky is moving away from ends the run. Crossing the
/// other bound clamps to it, unless the previous attempt was already at that
/// bound and was not accepted.
pub fn clamp_exposure(
    requested_ms: f64,
    direction: TwilightDirection,
    min_ms: u64,
    max_ms: u64,
    last: Option<Attempt>,
) -> ExposureDecision {
    let refused = |bound: u64| {
        last.map(|a| a.exposure_ms == bound && a.state != FrameState::Ok)
            .unwrap_or(false)
    };

    if requested_ms < min_ms as f64 {
        match direction {
            TwilightDirection::Dawn => ExposureDecision::StopRun(StopReason::SkyTooBright),
            TwilightDirection::Dusk if refused(min_ms) => ExposureDecision::AbandonTask,
            TwilightDirection::Dusk => ExposureDecision::Use(min_ms),
        }
    } else if requested_ms > max_ms as f64 {
        match direction {
            TwilightDirection::Dusk => ExposureDecision::StopRun(StopReason::SkyTooDark),
            TwilightDirection::Dawn if refused(max_ms) => ExposureDecision::AbandonTask,
            TwilightDirection::Dawn => ExposureDecision::Use(max_ms),
        }
    } else {
        ExposureDecision::Use(requested_ms.round() as u64)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TwilightReport {
    pub direction: Option<TwilightDirection>,
    pub frames: Vec<String>,
    pub completed_tasks: Vec<String>,
    pub skipped_tasks: Vec<String>,
    pub abandoned_tasks: Vec<String>,
    pub stop_reason: Option<StopReason>,
}

enum TaskOutcome {
    Completed,
    Abandoned,
    Stop(StopReason),
}

struct TwilightRun<'c, 'a> {
    ctx: &'c UnitContext<'a>,
    direction: TwilightDirection,
    deadline: DateTime<Utc>,
    ledger: CalibrationLedger,
    scratch: PathBuf,
    exposure_ms: u64,
    /// Sensitivity and binning the running exposure was last tuned for
    reference: Option<(f64, u32)>,
    report: TwilightReport,
}

/// Run one TWILIGHT_CALIBRATE invocation within `time_to_complete_ms`
pub async fn run_twilight(ctx: &UnitContext<'_>, time_to_complete_ms: u64) -> Result<TwilightReport, SequencerError> {
    let config = &ctx.config().twilight;
    let now = ctx.now();
    let deadline = millis(time_to_complete_ms)
        .and_then(|budget| now.checked_add_signed(budget))
        .ok_or_else(|| {
            SequencerError::InvalidParameter(format!("time_to_complete_ms {} out of range", time_to_complete_ms))
        })?;
    let direction = TwilightDirection::at(now, config.dusk_from_hour);
    let ledger = ctx.state.ledger.load().await?;

    let mut run = TwilightRun {
        ctx,
        direction,
        deadline,
        ledger,
        scratch: ctx.config().files.data_dir.join(&config.scratch_name),
        exposure_ms: match direction {
            TwilightDirection::Dusk => config.min_exposure_ms,
            TwilightDirection::Dawn => config.max_exposure_ms,
        },
        reference: None,
        report: TwilightReport {
            direction: Some(direction),
            ..TwilightReport::default()
        },
    };
    tracing::info!(
        "Starting {:?} twilight calibration, budget {}ms, seed exposure {}ms",
        direction,
        time_to_complete_ms,
        run.exposure_ms
    );

    let result = run.execute().await;
    run.cleanup().await;
    result?;

    tracing::info!(
        "Twilight calibration finished ({:?}): {} frames, {} tasks completed",
        run.report.stop_reason,
        run.report.frames.len(),
        run.report.completed_tasks.len()
    );
    Ok(run.report)
}

impl TwilightRun<'_, '_> {
    async fn execute(&mut self) -> Result<(), SequencerError> {
        let config = &self.ctx.config().twilight;
        let tasks = match self.direction {
            TwilightDirection::Dusk => &config.sunset,
            TwilightDirection::Dawn => &config.sunrise,
        };

        for task in tasks {
            self.ctx.check_abort()?;
            let signature = TaskSignature::from(task);

            let now = self.ctx.now();
            if let Some(last) = self.ledger.last_completed(&signature) {
                // a frequency too large to represent never comes due again
                let due = millis(task.frequency_ms).is_some_and(|frequency| now - last >= frequency);
                if !due {
                    tracing::info!("Skipping {}: completed at {}", signature, last);
                    self.report.skipped_tasks.push(signature.to_string());
                    continue;
                }
            }

            match self.run_task(task, &signature).await? {
                TaskOutcome::Completed => {
                    self.ledger.record(&signature, self.ctx.now());
                    self.ctx.state.ledger.save(&self.ledger).await?;
                    tracing::info!("Completed {}", signature);
                    self.report.completed_tasks.push(signature.to_string());
                }
                TaskOutcome::Abandoned => {
                    tracing::warn!("Abandoned {}", signature);
                    self.report.abandoned_tasks.push(signature.to_string());
                }
                TaskOutcome::Stop(reason) => {
                    tracing::info!("Stopping twilight calibration during {}: {:?}", signature, reason);
                    self.report.stop_reason = Some(reason);
                    return Ok(());
                }
            }
        }

        self.report.stop_reason = Some(StopReason::TasksExhausted);
        Ok(())
    }

    /// Exposure that lands `now` plus overhead past the deadline
    fn over_budget(&self, exposure_ms: u64, frames: usize) -> bool {
        let overhead = self.ctx.config().twilight.frame_overhead_ms;
        let needed = exposure_ms.saturating_add(overhead).saturating_mul(frames as u64);
        match millis(needed).and_then(|d| self.ctx.now().checked_add_signed(d)) {
            Some(done) => done > self.deadline,
            None => true,
        }
    }

    async fn run_task(
        &mut self,
        task: &CalibrationTaskConfig,
        signature: &TaskSignature,
    ) -> Result<TaskOutcome, SequencerError> {
        let config = self.ctx.config();
        let twilight = &config.twilight;
        let thresholds = *twilight.thresholds(task.binning).ok_or_else(|| {
            SequencerError::Config(format!("no twilight counts for binning {}", task.binning))
        })?;

        if let Some((sensitivity, binning)) = self.reference {
            let bin_ratio = binning as f64 / task.binning as f64;
            let requested = self.exposure_ms as f64 * (sensitivity / task.sensitivity) * bin_ratio * bin_ratio;
            match clamp_exposure(requested, self.direction, twilight.min_exposure_ms, twilight.max_exposure_ms, None) {
                ExposureDecision::Use(ms) => self.exposure_ms = ms,
                ExposureDecision::AbandonTask => return Ok(TaskOutcome::Abandoned),
                ExposureDecision::StopRun(reason) => return Ok(TaskOutcome::Stop(reason)),
            }
        }
        self.reference = Some((task.sensitivity, task.binning));

        if self.over_budget(self.exposure_ms, twilight.offsets.len()) {
            return Ok(TaskOutcome::Stop(StopReason::BudgetExhausted));
        }

        tracing::info!("Starting {} at {}ms", signature, self.exposure_ms);
        self.configure(task).await?;
        self.ctx.next_multrun().await;

        let mut accepted = 0;
        let mut last: Option<Attempt> = None;
        for offset in &twilight.offsets {
            match self.take_offset(offset, &thresholds, &mut last).await? {
                None => accepted += 1,
                Some(outcome) => return Ok(outcome),
            }
        }

        if accepted == twilight.offsets.len() {
            Ok(TaskOutcome::Completed)
        } else {
            Ok(TaskOutcome::Abandoned)
        }
    }

    async fn configure(&self, task: &CalibrationTaskConfig) -> Result<(), SequencerError> {
        let config = self.ctx.config();
        let position = *config.filters.get(&task.filter).ok_or_else(|| {
            SequencerError::Config(format!("unknown filter '{}'", task.filter))
        })?;
        let device = self.ctx.device();

        let dims = Dimensions::full_frame(
            config.detector.columns,
            config.detector.rows,
            task.binning,
            config.detector.amplifier,
        );
        device.configure_dimensions(&dims).await?;
        device.move_filter_wheel(position).await?;
        device.move_mechanism(MechanismKind::LowerSlide, task.lower_slide).await?;
        device.move_mechanism(MechanismKind::UpperSlide, task.upper_slide).await?;
        self.ctx.check_abort()
    }

    /// Retry one telescope offset until a frame is accepted.
    ///
    /// Returns `None` once a frame was accepted, or the outcome that ends the task.
    async fn take_offset(
        &mut self,
        offset: &TelescopeOffset,
        thresholds: &CountThresholds,
        last: &mut Option<Attempt>,
    ) -> Result<Option<TaskOutcome>, SequencerError> {
        let config = self.ctx.config();
        let twilight = &config.twilight;

        self.ctx
            .peer(
                PeerKind::Pointing,
                &OffsetRaDec {
                    ra_arcsec: offset.ra_arcsec,
                    dec_arcsec: offset.dec_arcsec,
                },
            )
            .await?;

        loop {
            if self.over_budget(self.exposure_ms, 1) {
                return Ok(Some(TaskOutcome::Stop(StopReason::BudgetExhausted)));
            }
            self.ctx.acknowledge(
                self.exposure_ms
                    .saturating_add(twilight.frame_overhead_ms)
                    .saturating_add(config.server.acknowledge_margin_ms),
            );

            self.ctx.expose(true, self.exposure_ms, &self.scratch).await?;
            let reduced = self
                .ctx
                .peer(
                    PeerKind::Pipeline,
                    &ReduceCalibrate {
                        filename: self.scratch.to_string_lossy().to_string(),
                    },
                )
                .await?;

            let state = classify(reduced.mean_counts, thresholds);
            tracing::info!(
                "Flat at {}ms: mean {:.0} counts ({:?})",
                self.exposure_ms,
                reduced.mean_counts,
                state
            );
            *last = Some(Attempt {
                exposure_ms: self.exposure_ms,
                state,
            });

            if state == FrameState::Ok {
                let path = self.ctx.next_filename(ExposureCode::SkyFlat).await;
                tokio::fs::rename(&self.scratch, &path).await?;
                self.report.frames.push(path.to_string_lossy().to_string());
                return Ok(None);
            }

            self.discard_scratch().await;
            let requested = if reduced.mean_counts > 0.0 {
                self.exposure_ms as f64 * thresholds.best / reduced.mean_counts
            } else {
                f64::INFINITY
            };
            match clamp_exposure(
                requested,
                self.direction,
                twilight.min_exposure_ms,
                twilight.max_exposure_ms,
                *last,
            ) {
                ExposureDecision::Use(ms) => self.exposure_ms = ms,
                ExposureDecision::AbandonTask => return Ok(Some(TaskOutcome::Abandoned)),
                ExposureDecision::StopRun(reason) => return Ok(Some(TaskOutcome::Stop(reason))),
            }
        }
    }

    async fn discard_scratch(&self) {
        match tokio::fs::remove_file(&self.scratch).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.scratch.display(), e),
        }
    }

    /// Return the telescope to its base position and drop any scratch frame.
    ///
    /// The reset is sent even after an abort, so it is bounded by
    /// `peers.reset_timeout_ms` instead of the abort token.
    async fn cleanup(&self) {
        self.discard_scratch().await;
        let reset = OffsetRaDec {
            ra_arcsec: 0.0,
            dec_arcsec: 0.0,
        };
        let limit = std::time::Duration::from_millis(self.ctx.config().peers.reset_timeout_ms);
        match tokio::time::timeout(limit, self.ctx.peer_unchecked(PeerKind::Pointing, &reset)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!("Failed to reset telescope offset after twilight calibration: {}", e);
            }
            Err(_) => {
                tracing::warn!(
                    "Telescope offset reset timed out after {}ms, leaving the offset in place",
                    limit.as_millis()
                );
            }
        }
    }
}
