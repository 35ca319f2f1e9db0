//! Substrate calibration experiments.
//!
//! Max calibration irrigates in bounded shots and waits for the moisture
//! reading to settle after each one, stopping once successive stabilized
//! readings plateau. Min calibration just watches a dryback window and keeps
//! the lowest reading plus a safety margin. Either result is stored as a
//! per-phase override that the preset resolution picks up immediately.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CalibrationConfig;
use crate::error::{ControlError, ControlResult};
use crate::model::Phase;
use crate::notice::{CalibrationKind, Notice};
use crate::pump::Operation;
use crate::room::RoomContext;

/// Readings that must agree before a value counts as stabilized.
const STABILITY_WINDOW: usize = 3;

/// Mean of the last three readings when all of them lie within
/// `tolerance_pct` percent of that mean.
pub fn stable_mean(readings: &[f64], tolerance_pct: f64) -> Option<f64> {
    let tail = readings.get(readings.len().checked_sub(STABILITY_WINDOW)?..)?;
    let mean = tail.iter().sum::<f64>() / tail.len() as f64;
    if mean <= 0.0 {
        return None;
    }
    let worst = tail
        .iter()
        .map(|r| (r - mean).abs() / mean * 100.0)
        .fold(0.0, f64::max);
    (worst < tolerance_pct).then_some(mean)
}

/// Percent increase from `prev` to `last` is below `tolerance_pct`.
pub fn plateaued(prev: f64, last: f64, tolerance_pct: f64) -> bool {
    if prev <= 0.0 {
        return false;
    }
    (last - prev) * 100.0 / prev < tolerance_pct
}

pub fn usable_min(observed_min: f64, safety_margin: f64) -> f64 {
    observed_min * (1.0 + safety_margin)
}

/// One max-calibration experiment.
#[derive(Debug, Clone)]
pub struct CalibrationRun {
    pub phase: Phase,
    /// Stabilized readings, one per successful attempt.
    pub readings: Vec<f64>,
    pub attempts: u32,
    pub stability_tolerance: f64,
}

impl CalibrationRun {
    pub fn new(phase: Phase, stability_tolerance: f64) -> Self {
        Self {
            phase,
            readings: Vec::new(),
            attempts: 0,
            stability_tolerance,
        }
    }

    pub fn plateaued(&self) -> bool {
        match self.readings.as_slice() {
            [.., prev, last] => plateaued(*prev, *last, self.stability_tolerance),
            _ => false,
        }
    }

    /// Last reading on a plateau, otherwise the best one observed.
    pub fn result(&self) -> Option<f64> {
        if self.plateaued() {
            return self.readings.last().copied();
        }
        self.readings.iter().copied().reduce(f64::max)
    }
}

// ---------------------------------------------------------------------------
// Runners
// ---------------------------------------------------------------------------

/// Run one calibration and report failures as notices. A stop through
/// `op` is returned silently; the caller decides what a stop means.
pub async fn run(
    ctx: Arc<RoomContext>,
    op: Operation,
    kind: CalibrationKind,
    phase: Phase,
) -> ControlResult<f64> {
    let result = match kind {
        CalibrationKind::Max => run_max(&ctx, &op, phase).await,
        CalibrationKind::Min => run_min(&ctx, &op, phase).await,
    };
    let reason = match &result {
        Ok(_) => return result,
        Err(ControlError::Cancelled) if op.is_cancelled() => return result,
        // Only a shot can be cancelled without the calibration itself.
        Err(ControlError::Cancelled) => "shot preempted by another pump operation".to_string(),
        Err(e) => e.to_string(),
    };
    warn!(room = %ctx.room_id, calibration = ?kind, %phase, %reason, "calibration failed");
    ctx.notify(Notice::CalibrationFailed {
        calibration: kind,
        phase,
        reason,
    });
    result
}

pub async fn run_max(ctx: &RoomContext, op: &Operation, phase: Phase) -> ControlResult<f64> {
    let cfg = &ctx.calibration;
    if ctx.devices.is_empty() {
        return Err(ControlError::Configuration(format!(
            "room '{}' has no pump devices",
            ctx.room_id
        )));
    }
    info!(room = %ctx.room_id, %phase, max_attempts = cfg.max_attempts, "max calibration started");

    let shot = Duration::from_secs(cfg.shot_duration_sec);
    let mut run = CalibrationRun::new(phase, cfg.stability_tolerance);
    for attempt in 1..=cfg.max_attempts {
        run.attempts = attempt;
        ctx.executor
            .irrigate(&op.child(), &ctx.devices, shot, "calibration shot")
            .await?;

        match stabilize(ctx, op, cfg).await {
            Ok(reading) => {
                debug!(room = %ctx.room_id, attempt, reading, "stabilized reading");
                run.readings.push(reading);
                ctx.notify(Notice::CalibrationProgress {
                    calibration: CalibrationKind::Max,
                    phase,
                    attempt,
                    reading,
                });
                if run.plateaued() {
                    break;
                }
            }
            Err(ControlError::CalibrationTimeout { timeout_sec }) => {
                warn!(room = %ctx.room_id, attempt, timeout_sec, "reading did not stabilize, attempt aborted");
            }
            Err(e) => return Err(e),
        }
    }

    let value = run.result().ok_or(ControlError::CalibrationTimeout {
        timeout_sec: cfg.stabilization_timeout_sec,
    })?;
    ctx.update(|s| s.overrides.set_max(phase, value));
    info!(room = %ctx.room_id, %phase, vwc_max = value, attempts = run.attempts, "max calibration completed");
    ctx.notify(Notice::CalibrationCompleted {
        calibration: CalibrationKind::Max,
        phase,
        value,
        readings: run.readings.len(),
        attempts: run.attempts,
    });
    Ok(value)
}

/// Poll until the last readings agree or the stabilization timeout passes.
async fn stabilize(ctx: &RoomContext, op: &Operation, cfg: &CalibrationConfig) -> ControlResult<f64> {
    let poll = Duration::from_secs(cfg.poll_interval_sec);
    let timeout = Duration::from_secs(cfg.stabilization_timeout_sec);
    let started = Instant::now();
    let mut window = Vec::new();

    while started.elapsed() < timeout {
        op.sleep(poll).await?;
        let Some(vwc) = ctx.sensors().moisture() else {
            continue;
        };
        window.push(vwc);
        if let Some(mean) = stable_mean(&window, cfg.stability_tolerance) {
            return Ok(mean);
        }
    }
    Err(ControlError::CalibrationTimeout {
        timeout_sec: cfg.stabilization_timeout_sec,
    })
}

pub async fn run_min(ctx: &RoomContext, op: &Operation, phase: Phase) -> ControlResult<f64> {
    let cfg = &ctx.calibration;
    let poll = Duration::from_secs(cfg.poll_interval_sec);
    let window = Duration::from_secs(cfg.dryback_window_sec);
    info!(room = %ctx.room_id, %phase, window_sec = cfg.dryback_window_sec, "min calibration started");

    let started = Instant::now();
    let mut lowest: Option<f64> = None;
    let mut readings = 0usize;
    let mut polls = 0u32;
    while started.elapsed() < window {
        op.sleep(poll).await?;
        polls += 1;
        let Some(vwc) = ctx.sensors().moisture() else {
            continue;
        };
        readings += 1;
        if lowest.map_or(true, |low| vwc < low) {
            lowest = Some(vwc);
            ctx.notify(Notice::CalibrationProgress {
                calibration: CalibrationKind::Min,
                phase,
                attempt: polls,
                reading: vwc,
            });
        }
    }

    let observed = lowest.ok_or_else(|| ControlError::SensorUnavailable(ctx.room_id.clone()))?;
    let value = usable_min(observed, cfg.min_safety_margin);
    ctx.update(|s| s.overrides.set_min(phase, value));
    info!(room = %ctx.room_id, %phase, observed, vwc_min = value, "min calibration completed");
    ctx.notify(Notice::CalibrationCompleted {
        calibration: CalibrationKind::Min,
        phase,
        value,
        readings,
        attempts: 1,
    });
    Ok(value)
}

// ===========================================================================
// Tests
// ===========================================================================
