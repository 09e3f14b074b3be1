//! Focus Search
//!
//! Steps the telescope focus across a range, measures seeing at every step and
//! fits a parabola to the curve. The vertex is the best focus.

use crate::config::InstrumentConfig;
use crate::context::UnitContext;
use crate::device_ops::Dimensions;
use crate::error::SequencerError;
use crate::filenames::ExposureCode;
use crate::peer::PeerKind;
use kestrel_protocol::peer::{ReduceExpose, SetFocus};
use serde::Serialize;

/// Most focus positions a single search will visit
pub const MAX_FOCUS_STEPS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FocusSample {
    pub position_mm: f64,
    pub seeing_arcsec: f64,
}

/// `seeing = a·x² + b·x + c`, x in millimetres
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParabolaFit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub best_focus_mm: f64,
    pub predicted_seeing_arcsec: f64,
    pub rms_arcsec: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct FocusRequest {
    pub start_mm: f64,
    pub end_mm: f64,
    pub step_mm: f64,
    pub exposure_ms: u64,
}

impl FocusRequest {
    /// Focus positions from start to end, both inclusive
    pub fn positions(&self) -> Result<Vec<f64>, SequencerError> {
        if !(self.step_mm > 0.0) || !self.start_mm.is_finite() || !self.end_mm.is_finite() {
            return Err(SequencerError::InvalidParameter(format!(
                "focus step {}mm must be positive",
                self.step_mm
            )));
        }
        let span = (self.end_mm - self.start_mm).abs();
        let steps = (span / self.step_mm + 1e-9).floor() as usize + 1;
        if steps < 3 {
            return Err(SequencerError::InvalidParameter(format!(
                "focus range {}..{}mm at {}mm gives {} positions, need at least 3",
                self.start_mm, self.end_mm, self.step_mm, steps
            )));
        }
        if steps > MAX_FOCUS_STEPS {
            return Err(SequencerError::InvalidParameter(format!(
                "focus range needs {} positions, at most {} allowed",
                steps, MAX_FOCUS_STEPS
            )));
        }
        let sign = if self.end_mm >= self.start_mm { 1.0 } else { -1.0 };
        Ok((0..steps)
            .map(|i| self.start_mm + sign * self.step_mm * i as f64)
            .collect())
    }

    /// Time to take `frames` more focus frames, plus the acknowledge margin
    pub fn scan_deadline_ms(&self, config: &InstrumentConfig, frames: u64) -> u64 {
        config
            .detector
            .clamp_exposure_ms(self.exposure_ms)
            .saturating_add(config.server.readout_ms)
            .saturating_mul(frames)
            .saturating_add(config.server.acknowledge_margin_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FocusReport {
    pub best_focus_mm: f64,
    pub predicted_seeing_arcsec: f64,
    pub fit: ParabolaFit,
    pub samples: Vec<FocusSample>,
}

fn sum_squared_residuals(points: &[(f64, f64)], a: f64, b: f64, c: f64) -> f64 {
    points
        .iter()
        .map(|(x, y)| {
            let r = y - (a * x * x + b * x + c);
            r * r
        })
        .sum()
}

/// Power sums of the normal equations for `y = a·x² + b·x + c`
struct NormalSums {
    n: f64,
    x: f64,
    x2: f64,
    x3: f64,
    x4: f64,
    y: f64,
    xy: f64,
    x2y: f64,
}

impl NormalSums {
    fn new(points: &[(f64, f64)]) -> Self {
        let mut sums = NormalSums {
            n: points.len() as f64,
            x: 0.0,
            x2: 0.0,
            x3: 0.0,
            x4: 0.0,
            y: 0.0,
            xy: 0.0,
            x2y: 0.0,
        };
        for (x, y) in points {
            let x2 = x * x;
            sums.x += x;
            sums.x2 += x2;
            sums.x3 += x2 * x;
            sums.x4 += x2 * x2;
            sums.y += y;
            sums.xy += x * y;
            sums.x2y += x2 * y;
        }
        sums
    }

    /// Zero when the samples cannot pin down all three coefficients
    fn determinant(&self) -> f64 {
        self.n * (self.x2 * self.x4 - self.x3 * self.x3) - self.x * (self.x * self.x4 - self.x2 * self.x3)
            + self.x2 * (self.x * self.x3 - self.x2 * self.x2)
    }

    /// One refinement pass: each coefficient in turn moves to the value that
    /// minimises the squared residuals with the other two held fixed
    fn refine(&self, (a, b, c): (f64, f64, f64)) -> (f64, f64, f64) {
        let a = (self.x2y - b * self.x3 - c * self.x2) / self.x4;
        let b = (self.xy - a * self.x3 - c * self.x) / self.x2;
        let c = (self.y - a * self.x2 - b * self.x) / self.n;
        (a, b, c)
    }
}

/// Parabola through the lowest sample and its two neighbours.
///
/// `points` must be sorted by position. Falls back to a flat line at the mean
/// if the three positions do not determine a curve.
fn three_point_seed(points: &[(f64, f64)]) -> (f64, f64, f64) {
    let lowest = points
        .iter()
        .enumerate()
        .min_by(|(_, p), (_, q)| p.1.total_cmp(&q.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let first = lowest.saturating_sub(1).min(points.len().saturating_sub(3));
    let mean = points.iter().map(|p| p.1).sum::<f64>() / points.len().max(1) as f64;
    let (x0, y0, x1, y1, x2, y2) = match &points[first..] {
        [p0, p1, p2, ..] => (p0.0, p0.1, p1.0, p1.1, p2.0, p2.1),
        _ => return (0.0, 0.0, mean),
    };

    let d = (x0 - x1) * (x0 - x2) * (x1 - x2);
    if d.abs() < 1e-12 {
        return (0.0, 0.0, mean);
    }
    let a = (x2 * (y1 - y0) + x1 * (y0 - y2) + x0 * (y2 - y1)) / d;
    let b = (x2 * x2 * (y0 - y1) + x1 * x1 * (y2 - y0) + x0 * x0 * (y1 - y2)) / d;
    let c = (x1 * x2 * (x1 - x2) * y0 + x2 * x0 * (x2 - x0) * y1 + x0 * x1 * (x0 - x1) * y2) / d;
    (a, b, c)
}

/// Fit a parabola to the samples and locate its minimum.
///
/// Positions are centred and scaled to -1..1 before fitting, so
/// `min_curvature` is in seeing units over half the scanned range. The search
/// starts from the parabola through the best sample and its neighbours and
/// runs `passes` refinement passes toward the least-squares fit.
pub fn fit_parabola(
    samples: &[FocusSample],
    passes: u32,
    min_curvature: f64,
    max_sensible_seeing: f64,
) -> Result<ParabolaFit, SequencerError> {
    if samples.len() < 3 {
        return Err(SequencerError::DegenerateFit(format!(
            "need at least 3 samples, have {}",
            samples.len()
        )));
    }

    let low = samples.iter().map(|s| s.position_mm).fold(f64::INFINITY, f64::min);
    let high = samples.iter().map(|s| s.position_mm).fold(f64::NEG_INFINITY, f64::max);
    let centre = (low + high) / 2.0;
    let scale = (high - low) / 2.0;
    if !(scale > 0.0) {
        return Err(SequencerError::DegenerateFit("all samples at one focus position".to_string()));
    }

    let mut points: Vec<(f64, f64)> = samples
        .iter()
        .map(|s| ((s.position_mm - centre) / scale, s.seeing_arcsec))
        .collect();
    points.sort_by(|p, q| p.0.total_cmp(&q.0));

    let sums = NormalSums::new(&points);
    if sums.determinant().abs() < 1e-12 {
        return Err(SequencerError::DegenerateFit("singular normal equations".to_string()));
    }

    let mut coefficients = three_point_seed(&points);
    for _ in 0..passes {
        coefficients = sums.refine(coefficients);
    }
    let (a, b, c) = coefficients;
    let sse = sum_squared_residuals(&points, a, b, c);

    if !a.is_finite() || a.abs() < min_curvature {
        return Err(SequencerError::DegenerateFit(format!(
            "curvature {:.3e} below {:.1e}",
            a, min_curvature
        )));
    }
    if a < 0.0 {
        return Err(SequencerError::ImplausibleFit(
            "fitted curve has a maximum, not a minimum".to_string(),
        ));
    }

    let vertex = -b / (2.0 * a);
    let best_focus_mm = centre + vertex * scale;
    if best_focus_mm < low || best_focus_mm > high {
        return Err(SequencerError::FocusOutOfRange {
            best_mm: best_focus_mm,
            low_mm: low,
            high_mm: high,
        });
    }

    let predicted = a * vertex * vertex + b * vertex + c;
    if !(predicted > 0.0 && predicted <= max_sensible_seeing) {
        return Err(SequencerError::ImplausibleFit(format!(
            "predicted seeing {:.2}\" at best focus",
            predicted
        )));
    }

    // back to millimetres
    let a_mm = a / (scale * scale);
    let b_mm = b / scale - 2.0 * a * centre / (scale * scale);
    let c_mm = a * centre * centre / (scale * scale) - b * centre / scale + c;

    Ok(ParabolaFit {
        a: a_mm,
        b: b_mm,
        c: c_mm,
        best_focus_mm,
        predicted_seeing_arcsec: predicted,
        rms_arcsec: (sse / points.len() as f64).sqrt(),
    })
}

/// Scan the focus range, fit the curve and leave the telescope at best focus
pub async fn run_focus(ctx: &UnitContext<'_>, request: &FocusRequest) -> Result<FocusReport, SequencerError> {
    let positions = request.positions()?;
    let config = ctx.config();
    let focus = &config.focus;

    let dims = Dimensions::full_frame(
        config.detector.columns,
        config.detector.rows,
        focus.binning,
        config.detector.amplifier,
    );
    ctx.device().configure_dimensions(&dims).await?;
    let multrun = ctx.next_multrun().await;
    tracing::info!(
        "Focus search over {} positions {:.3}..{:.3}mm (multrun {})",
        positions.len(),
        request.start_mm,
        request.end_mm,
        multrun
    );

    let mut samples = Vec::with_capacity(positions.len());
    for (index, position) in positions.iter().enumerate() {
        let remaining = (positions.len() - index) as u64;
        ctx.acknowledge(request.scan_deadline_ms(config, remaining));

        ctx.peer(PeerKind::Pointing, &SetFocus { focus_mm: *position }).await?;
        let path = ctx.next_filename(ExposureCode::Focus).await;
        ctx.expose(true, request.exposure_ms, &path).await?;
        let reduced = ctx
            .peer(
                PeerKind::Pipeline,
                &ReduceExpose {
                    filename: path.to_string_lossy().to_string(),
                    wcs_fit: false,
                },
            )
            .await?;

        if reduced.seeing_arcsec > 0.0 && reduced.seeing_arcsec.is_finite() {
            tracing::info!("Focus {:.3}mm: seeing {:.2}\"", position, reduced.seeing_arcsec);
            samples.push(FocusSample {
                position_mm: *position,
                seeing_arcsec: reduced.seeing_arcsec,
            });
        } else {
            tracing::warn!("Focus {:.3}mm: no usable seeing measurement", position);
        }
    }

    let fit = fit_parabola(
        &samples,
        focus.refinement_passes,
        focus.min_curvature,
        focus.max_sensible_seeing_arcsec,
    )?;
    tracing::info!(
        "Best focus {:.3}mm, predicted seeing {:.2}\" (rms {:.3}\")",
        fit.best_focus_mm,
        fit.predicted_seeing_arcsec,
        fit.rms_arcsec
    );

    ctx.peer(PeerKind::Pointing, &SetFocus { focus_mm: fit.best_focus_mm }).await?;

    Ok(FocusReport {
        best_focus_mm: fit.best_focus_mm,
        predicted_seeing_arcsec: fit.predicted_seeing_arcsec,
        fit,
        samples,
    })
}
