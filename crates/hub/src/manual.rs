//! Manual mode: the operator pins a phase and the room follows a fixed shot
//! schedule instead of the automatic decision engine.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ManualConfig;
use crate::error::{ControlError, ControlResult};
use crate::model::Phase;
use crate::notice::Notice;
use crate::pump::Operation;
use crate::room::RoomContext;
use crate::sensor::SensorAverage;

/// Fraction of `vwc_min` below which a shot fires regardless of schedule.
const EMERGENCY_FRACTION: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualShot {
    Scheduled,
    Emergency,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManualTick {
    pub shot: Option<ManualShot>,
    /// Measured EC that just drifted outside tolerance.
    pub ec_deviation: Option<f64>,
}

/// Shot bookkeeping for one manual cycle window.
#[derive(Debug, Clone)]
pub struct ManualSchedule {
    window_started: Instant,
    shots_in_window: u32,
    last_shot_at: Option<Instant>,
    ec_out_of_band: bool,
}

impl ManualSchedule {
    pub fn new(now: Instant, shots_in_window: u32) -> Self {
        Self {
            window_started: now,
            shots_in_window,
            last_shot_at: None,
            ec_out_of_band: false,
        }
    }

    pub fn shots_in_window(&self) -> u32 {
        self.shots_in_window
    }

    pub fn decide(&mut self, now: Instant, avg: SensorAverage, cfg: &ManualConfig) -> ManualTick {
        let mut tick = ManualTick::default();

        if now.saturating_duration_since(self.window_started) >= Duration::from_secs(cfg.cycle_window_sec) {
            self.window_started = now;
            self.shots_in_window = 0;
        }

        if let Some(ec) = avg.ec {
            let out = (ec - cfg.ec_target).abs() > cfg.ec_tolerance;
            if out && !self.ec_out_of_band {
                tick.ec_deviation = Some(ec);
            }
            self.ec_out_of_band = out;
        }

        // Emergency shots do not count toward the window.
        if avg
            .moisture()
            .is_some_and(|vwc| vwc < cfg.vwc_min * EMERGENCY_FRACTION)
        {
            tick.shot = Some(ManualShot::Emergency);
            return tick;
        }

        let interval = Duration::from_secs(cfg.shot_interval_sec);
        let due = self
            .last_shot_at
            .map_or(true, |at| now.saturating_duration_since(at) >= interval);
        if due && self.shots_in_window < cfg.shot_count {
            self.shots_in_window += 1;
            self.last_shot_at = Some(now);
            tick.shot = Some(ManualShot::Scheduled);
        }
        tick
    }
}

/// Run the manual schedule for `phase` until cancelled.
pub async fn run_manual(ctx: Arc<RoomContext>, op: Operation, phase: Phase) -> ControlResult<()> {
    let cfg = ctx.manual.clone().ok_or_else(|| {
        ControlError::Configuration(format!("room '{}' has no manual settings", ctx.room_id))
    })?;
    cfg.check()?;
    if ctx.devices.is_empty() {
        return Err(ControlError::Configuration(format!(
            "room '{}' has no pump devices",
            ctx.room_id
        )));
    }

    info!(
        room = %ctx.room_id,
        %phase,
        shots = cfg.shot_count,
        interval_sec = cfg.shot_interval_sec,
        "manual cycle started"
    );

    let poll = Duration::from_secs(cfg.poll_interval_sec);
    let mut schedule = ManualSchedule::new(Instant::now(), ctx.snapshot().manual_shots);
    loop {
        match manual_tick(&ctx, &op, phase, &cfg, &mut schedule).await {
            Ok(()) => {}
            Err(ControlError::Cancelled) => return Err(ControlError::Cancelled),
            Err(e) => {
                ctx.emergency_stop(&format!("manual cycle failed: {e}"));
                return Err(e);
            }
        }
        op.sleep(poll).await?;
    }
}

async fn manual_tick(
    ctx: &RoomContext,
    op: &Operation,
    phase: Phase,
    cfg: &ManualConfig,
    schedule: &mut ManualSchedule,
) -> ControlResult<()> {
    let tick = schedule.decide(Instant::now(), ctx.sensors(), cfg);

    if let Some(ec) = tick.ec_deviation {
        warn!(room = %ctx.room_id, ec, target = cfg.ec_target, "EC outside manual tolerance");
        ctx.notify(Notice::EcTargetChanged {
            phase,
            target: cfg.ec_target,
            reason: format!(
                "measured EC {ec:.2} deviates from target by more than {:.2}",
                cfg.ec_tolerance
            ),
        });
    }

    let Some(shot) = tick.shot else {
        return Ok(());
    };
    let reason = match shot {
        ManualShot::Scheduled => "manual scheduled shot",
        ManualShot::Emergency => "manual emergency shot",
    };
    let shot_op = op.child();
    match ctx
        .executor
        .irrigate(&shot_op, &ctx.devices, Duration::from_secs(cfg.shot_duration_sec), reason)
        .await
    {
        Ok(()) => {}
        Err(ControlError::Cancelled) if !op.is_cancelled() => {
            info!(room = %ctx.room_id, %phase, "manual shot preempted");
            return Ok(());
        }
        Err(e) => return Err(e),
    }
    let shots = schedule.shots_in_window();
    ctx.update(|s| {
        s.manual_shots = shots;
        s.last_irrigation = Some(time::OffsetDateTime::now_utc().unix_timestamp());
    });
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationKind;
    use crate::persist::{MemoryStore, StateStore};
    use crate::pump::tests::RecordingDriver;
    use crate::room::tests::{context_with, FakeInputs};

    fn settings() -> ManualConfig {
        ManualConfig {
            shot_count: 2,
            shot_interval_sec: 600,
            shot_duration_sec: 60,
            ec_target: 3.0,
            vwc_min: 55.0,
            cycle_window_sec: 3600,
            poll_interval_sec: 30,
            ec_tolerance: 0.2,
        }
    }

    fn avg(vwc: f64, ec: f64) -> SensorAverage {
        SensorAverage {
            vwc: Some(vwc),
            ec: Some(ec),
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn schedule_caps_shots_per_window_and_resets() {
        let cfg = settings();
        let t0 = Instant::now();
        let mut s = ManualSchedule::new(t0, 0);

        assert_eq!(s.decide(t0, avg(60.0, 3.0), &cfg).shot, Some(ManualShot::Scheduled));
        assert_eq!(s.decide(t0 + secs(300), avg(60.0, 3.0), &cfg).shot, None);
        assert_eq!(s.decide(t0 + secs(600), avg(60.0, 3.0), &cfg).shot, Some(ManualShot::Scheduled));
        // Count reached for this window.
        assert_eq!(s.decide(t0 + secs(1200), avg(60.0, 3.0), &cfg).shot, None);
        assert_eq!(s.shots_in_window(), 2);
        // Window elapsed.
        assert_eq!(s.decide(t0 + secs(3600), avg(60.0, 3.0), &cfg).shot, Some(ManualShot::Scheduled));
        assert_eq!(s.shots_in_window(), 1);
    }

    #[test]
    fn emergency_shot_ignores_schedule_and_is_not_counted() {
        let cfg = settings();
        let t0 = Instant::now();
        let mut s = ManualSchedule::new(t0, 0);
        s.decide(t0, avg(60.0, 3.0), &cfg);

        // 49 < 55 * 0.9
        let tick = s.decide(t0 + secs(30), avg(49.0, 3.0), &cfg);
        assert_eq!(tick.shot, Some(ManualShot::Emergency));
        assert_eq!(s.shots_in_window(), 1);

        // 50 is above the emergency floor.
        assert_eq!(s.decide(t0 + secs(60), avg(50.0, 3.0), &cfg).shot, None);
    }

    #[test]
    fn ec_deviation_reported_once_per_excursion() {
        let cfg = settings();
        let t0 = Instant::now();
        let mut s = ManualSchedule::new(t0, 2);

        assert_eq!(s.decide(t0, avg(60.0, 3.1), &cfg).ec_deviation, None);
        assert_eq!(s.decide(t0, avg(60.0, 3.4), &cfg).ec_deviation, Some(3.4));
        assert_eq!(s.decide(t0, avg(60.0, 3.5), &cfg).ec_deviation, None);
        assert_eq!(s.decide(t0, avg(60.0, 3.0), &cfg).ec_deviation, None);
        assert_eq!(s.decide(t0, avg(60.0, 2.7), &cfg).ec_deviation, Some(2.7));
    }

    #[tokio::test]
    async fn invalid_settings_do_not_start() {
        let driver = Arc::new(RecordingDriver::default());
        let room = |manual: Option<ManualConfig>| {
            let mut ctx = context_with(
                Arc::new(FakeInputs::default()),
                driver.clone(),
                Arc::new(MemoryStore::new()),
            );
            ctx.manual = manual;
            Arc::new(ctx)
        };
        let op = Operation::new(OperationKind::CropSteering);

        let err = run_manual(room(None), op.clone(), Phase::P2Maintenance)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Configuration(_)));

        let zero_count = ManualConfig {
            shot_count: 0,
            ..settings()
        };
        let err = run_manual(room(Some(zero_count)), op, Phase::P2Maintenance)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("shot_count"));
        assert!(driver.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_cycle_fires_configured_shots() {
        let inputs = Arc::new(FakeInputs::default());
        inputs.set_vwc(60.0);
        inputs.set_ec(3.0);
        let driver = Arc::new(RecordingDriver::default());
        let store = Arc::new(MemoryStore::new());
        let mut ctx = context_with(inputs, driver.clone(), store.clone());
        ctx.manual = Some(settings());

        let op = Operation::new(OperationKind::CropSteering);
        let task = tokio::spawn(run_manual(Arc::new(ctx), op.clone(), Phase::P2Maintenance));

        tokio::time::sleep(secs(1500)).await;
        op.cancel();
        assert!(matches!(task.await.unwrap(), Err(ControlError::Cancelled)));

        assert_eq!(store.irrigations().len(), 2);
        assert_eq!(store.load("r1").manual_shots, 2);
        assert!(!driver.is_on("p1"));
    }
}
