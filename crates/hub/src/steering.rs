//! Automatic crop steering: the phase state machine and the loop that drives
//! it once per block-check interval.
//!
//! ```text
//!  P0 monitoring ──[vwc < min]──▶ P1 saturation ──[max reached | stalled | attempts]──▶ P2 maintenance
//!        ▲                                                                                  │
//!        └──────────[lights on]────────── P3 night dryback ◀──────────[lights off]──────────┘
//! ```
//!
//! [`PhaseMachine`] is a pure decision engine: it takes one averaged sensor
//! reading plus the resolved preset and returns a [`Decision`]. The loop in
//! [`run_automatic`] applies decisions (notices, persistence, irrigation).
//! A transition always ends the tick; dosing waits for the next one.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SteeringConfig;
use crate::error::{ControlError, ControlResult};
use crate::model::Phase;
use crate::notice::Notice;
use crate::persist::RoomSnapshot;
use crate::preset::PhasePreset;
use crate::pump::Operation;
use crate::room::RoomContext;

/// Smallest EC change worth reporting.
const EC_EPSILON: f64 = 1e-6;

/// Percent drop of `vwc` from the night-start reference.
pub fn dryback_percent(start_night_vwc: f64, vwc: f64) -> f64 {
    if start_night_vwc <= 0.0 {
        return 0.0;
    }
    (start_night_vwc - vwc) * 100.0 / start_night_vwc
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotKind {
    Saturation,
    Maintenance,
    Emergency,
}

impl ShotKind {
    pub fn reason(self) -> &'static str {
        match self {
            Self::Saturation => "P1 saturation shot",
            Self::Maintenance => "P2 maintenance shot",
            Self::Emergency => "P3 emergency shot",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shot {
    pub kind: ShotKind,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EcChange {
    pub target: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub transition: Option<Transition>,
    pub shot: Option<Shot>,
    pub ec_change: Option<EcChange>,
    /// Saturation ended without reaching the preset maximum; this reading
    /// is the substrate's practical maximum.
    pub calibrated_max: Option<f64>,
    /// Wake earlier than the block-check interval.
    pub next_check: Option<Duration>,
}

pub struct CycleInput<'a> {
    pub now: Instant,
    pub vwc: f64,
    pub light_on: Option<bool>,
    pub preset: &'a PhasePreset,
}

// ---------------------------------------------------------------------------
// PhaseMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct ShotTracker {
    shots: u32,
    stagnant: u32,
    last_shot_vwc: Option<f64>,
    last_shot_at: Option<Instant>,
}

impl ShotTracker {
    /// Time left until `wait` has passed since the last shot.
    fn remaining(&self, now: Instant, wait: Duration) -> Option<Duration> {
        let at = self.last_shot_at?;
        let elapsed = now.saturating_duration_since(at);
        (elapsed < wait).then(|| wait - elapsed)
    }

    fn fire(&mut self, now: Instant, vwc: f64) {
        self.shots += 1;
        self.last_shot_vwc = Some(vwc);
        self.last_shot_at = Some(now);
    }
}

#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: Phase,
    start_night_vwc: Option<f64>,
    ec_target: Option<f64>,
    shots: ShotTracker,
}

impl PhaseMachine {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            start_night_vwc: None,
            ec_target: None,
            shots: ShotTracker::default(),
        }
    }

    /// Pick the physically plausible phase to resume in after a (re)start.
    /// Returns the machine and a human-readable reason.
    pub fn initial(
        vwc: Option<f64>,
        light_on: Option<bool>,
        persisted: &RoomSnapshot,
        preset_for: impl Fn(Phase) -> PhasePreset,
        cfg: &SteeringConfig,
    ) -> (Self, String) {
        let mut machine = Self::new(persisted.phase);
        machine.ec_target = persisted.ec_target;

        let Some(vwc) = vwc else {
            machine.start_night_vwc = persisted.start_night_vwc;
            if persisted.phase == Phase::P1Saturation {
                machine.shots.shots = persisted.p1_shots;
            }
            return (machine, "no sensor data at start, resuming persisted phase".to_string());
        };

        let (phase, reason) = if light_on == Some(false) {
            (Phase::P3NightDryback, format!("lights off at start (vwc {vwc:.1})"))
        } else {
            let hold = preset_for(Phase::P2Maintenance).vwc_max * cfg.hold_percentage;
            let dry = preset_for(Phase::P0Monitoring).vwc_min;
            if vwc >= hold {
                (Phase::P2Maintenance, format!("near saturation at start (vwc {vwc:.1} >= {hold:.1})"))
            } else if vwc < dry {
                (Phase::P1Saturation, format!("dry at start (vwc {vwc:.1} < min {dry:.1})"))
            } else {
                (Phase::P0Monitoring, format!("moist at start (vwc {vwc:.1})"))
            }
        };

        machine.phase = phase;
        match phase {
            Phase::P3NightDryback => {
                machine.start_night_vwc = match (persisted.phase, persisted.start_night_vwc) {
                    (Phase::P3NightDryback, Some(start)) => Some(start),
                    _ => Some(vwc),
                };
            }
            Phase::P1Saturation if persisted.phase == Phase::P1Saturation => {
                machine.shots.shots = persisted.p1_shots;
            }
            _ => {}
        }
        (machine, reason)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn start_night_vwc(&self) -> Option<f64> {
        self.start_night_vwc
    }

    pub fn ec_target(&self) -> Option<f64> {
        self.ec_target
    }

    /// Copy the persisted parts of the machine into `snapshot`.
    pub fn store_into(&self, snapshot: &mut RoomSnapshot) {
        snapshot.phase = self.phase;
        snapshot.start_night_vwc = self.start_night_vwc;
        snapshot.ec_target = self.ec_target;
        snapshot.p1_shots = if self.phase == Phase::P1Saturation {
            self.shots.shots
        } else {
            0
        };
    }

    pub fn step(&mut self, input: &CycleInput<'_>, cfg: &SteeringConfig) -> Decision {
        match self.phase {
            Phase::P0Monitoring => self.monitoring(input),
            Phase::P1Saturation => self.saturation(input, cfg),
            Phase::P2Maintenance => self.maintenance(input, cfg),
            Phase::P3NightDryback => self.night_dryback(input, cfg),
        }
    }

    fn advance(&mut self, reason: String) -> Decision {
        let from = self.phase;
        let to = from.successor();
        self.phase = to;
        self.shots = ShotTracker::default();
        if to == Phase::P0Monitoring {
            self.start_night_vwc = None;
        }
        Decision {
            transition: Some(Transition { from, to, reason }),
            ..Default::default()
        }
    }

    fn monitoring(&mut self, input: &CycleInput<'_>) -> Decision {
        let (vwc, min) = (input.vwc, input.preset.vwc_min);
        if vwc < min {
            return self.advance(format!("vwc {vwc:.1} below min {min:.1}"));
        }
        Decision::default()
    }

    fn saturation(&mut self, input: &CycleInput<'_>, cfg: &SteeringConfig) -> Decision {
        let p = input.preset;
        let vwc = input.vwc;

        if vwc >= p.vwc_max {
            return self.advance(format!("vwc {vwc:.1} reached max {:.1}", p.vwc_max));
        }

        let wait = p.wait_between();
        if let Some(remaining) = self.shots.remaining(input.now, wait) {
            return Decision {
                next_check: Some(remaining),
                ..Default::default()
            };
        }

        if let Some(prev) = self.shots.last_shot_vwc {
            if vwc - prev < cfg.stagnation_delta {
                self.shots.stagnant += 1;
            } else {
                self.shots.stagnant = 0;
            }
        }

        let shots = self.shots.shots;
        if shots >= cfg.stagnation_shots && self.shots.stagnant >= cfg.stagnation_shots {
            let mut d = self.advance(format!(
                "saturation stalled at vwc {vwc:.1} after {shots} shots"
            ));
            d.calibrated_max = Some(vwc);
            return d;
        }
        if p.max_attempts > 0 && shots >= p.max_attempts {
            let mut d = self.advance(format!(
                "max attempts ({}) reached at vwc {vwc:.1}",
                p.max_attempts
            ));
            d.calibrated_max = Some(vwc);
            return d;
        }

        self.shots.fire(input.now, vwc);
        Decision {
            shot: Some(Shot {
                kind: ShotKind::Saturation,
                duration: p.irrigation_duration(),
            }),
            next_check: (!wait.is_zero()).then_some(wait),
            ..Default::default()
        }
    }

    fn maintenance(&mut self, input: &CycleInput<'_>, cfg: &SteeringConfig) -> Decision {
        let p = input.preset;
        let vwc = input.vwc;

        if input.light_on == Some(false) {
            let d = self.advance(format!("lights off, dryback starts at vwc {vwc:.1}"));
            self.start_night_vwc = Some(vwc);
            return d;
        }

        let threshold = p.vwc_max * cfg.hold_percentage;
        if vwc < threshold && self.shots.remaining(input.now, p.wait_between()).is_none() {
            self.shots.fire(input.now, vwc);
            return Decision {
                shot: Some(Shot {
                    kind: ShotKind::Maintenance,
                    duration: p.irrigation_duration(),
                }),
                ..Default::default()
            };
        }
        Decision::default()
    }

    fn night_dryback(&mut self, input: &CycleInput<'_>, cfg: &SteeringConfig) -> Decision {
        let p = input.preset;
        let vwc = input.vwc;

        if input.light_on == Some(true) {
            return self.advance("lights on".to_string());
        }

        let start = *self.start_night_vwc.get_or_insert(vwc);
        let dryback = dryback_percent(start, vwc);
        let mut d = Decision::default();

        // EC steering and the emergency check are independent; both may fire.
        let current = self.ec_target.unwrap_or(p.ec_target);
        let nudge = if dryback < p.dryback_min {
            Some((
                (current + cfg.ec_nudge_step).min(p.ec_max),
                format!("dryback {dryback:.1}% below {:.1}%", p.dryback_min),
            ))
        } else if dryback > p.dryback_max {
            Some((
                (current - cfg.ec_nudge_step).max(p.ec_min),
                format!("dryback {dryback:.1}% above {:.1}%", p.dryback_max),
            ))
        } else {
            None
        };
        if let Some((target, reason)) = nudge {
            if (target - current).abs() > EC_EPSILON {
                self.ec_target = Some(target);
                d.ec_change = Some(EcChange { target, reason });
            }
        }

        let floor = p.vwc_max * p.emergency_threshold;
        if vwc < floor {
            d.shot = Some(Shot {
                kind: ShotKind::Emergency,
                duration: p.irrigation_duration(),
            });
        }
        d
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Run automatic steering until cancelled. Any cycle failure forces every
/// pump off before the error is returned to the supervisor.
pub async fn run_automatic(ctx: Arc<RoomContext>, op: Operation) -> ControlResult<()> {
    if ctx.devices.is_empty() {
        return Err(ControlError::Configuration(format!(
            "room '{}' has no pump devices",
            ctx.room_id
        )));
    }

    let persisted = ctx.snapshot();
    let (mut machine, reason) = PhaseMachine::initial(
        ctx.sensors().moisture(),
        ctx.light_on(),
        &persisted,
        |phase| ctx.preset(phase),
        &ctx.steering,
    );
    info!(room = %ctx.room_id, phase = %machine.phase(), %reason, "automatic steering started");
    if machine.phase() != persisted.phase {
        ctx.notify(Notice::PhaseTransition {
            from: persisted.phase,
            to: machine.phase(),
            reason,
        });
    }
    ctx.update(|s| machine.store_into(s));

    loop {
        let wait = match run_cycle(&ctx, &op, &mut machine).await {
            Ok(wait) => wait,
            Err(ControlError::Cancelled) => return Err(ControlError::Cancelled),
            Err(e) => {
                ctx.emergency_stop(&format!("steering cycle failed: {e}"));
                return Err(e);
            }
        };
        op.sleep(wait).await?;
    }
}

/// One tick. Returns how long to sleep before the next one.
async fn run_cycle(
    ctx: &RoomContext,
    op: &Operation,
    machine: &mut PhaseMachine,
) -> ControlResult<Duration> {
    let interval = ctx.steering.block_check_interval();

    let Some(vwc) = ctx.sensors().moisture() else {
        debug!(room = %ctx.room_id, "no sensor data, skipping cycle");
        return Ok(interval);
    };

    let phase = machine.phase();
    let preset = ctx.preset(phase);
    let input = CycleInput {
        now: Instant::now(),
        vwc,
        light_on: ctx.light_on(),
        preset: &preset,
    };
    let decision = machine.step(&input, &ctx.steering);

    if let Some(max) = decision.calibrated_max {
        info!(room = %ctx.room_id, vwc_max = max, "saturation max recorded");
        ctx.update(|s| s.overrides.set_max(Phase::P1Saturation, max));
    }
    if let Some(t) = &decision.transition {
        info!(room = %ctx.room_id, from = %t.from, to = %t.to, reason = %t.reason, "phase transition");
        ctx.notify(Notice::PhaseTransition {
            from: t.from,
            to: t.to,
            reason: t.reason.clone(),
        });
    }
    if let Some(ec) = &decision.ec_change {
        info!(room = %ctx.room_id, target = ec.target, reason = %ec.reason, "EC target nudged");
        ctx.notify(Notice::EcTargetChanged {
            phase,
            target: ec.target,
            reason: ec.reason.clone(),
        });
    }
    ctx.update(|s| machine.store_into(s));

    if let Some(shot) = &decision.shot {
        let shot_op = op.child();
        match ctx
            .executor
            .irrigate(&shot_op, &ctx.devices, shot.duration, shot.kind.reason())
            .await
        {
            Ok(()) => ctx.record_irrigation(),
            Err(ControlError::Cancelled) if !op.is_cancelled() => {
                info!(room = %ctx.room_id, %phase, "shot preempted, steering continues");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(decision
        .next_check
        .map_or(interval, |next| next.min(interval)))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationKind;
    use crate::persist::{MemoryStore, StateStore};
    use crate::preset::{self, CalibrationOverrides, GrowthInfo};
    use crate::pump::tests::RecordingDriver;
    use crate::pump::PumpDriver;
    use crate::room::tests::{context_with, FakeInputs};
    use crate::sensor::RoomInputs;
    use std::sync::Mutex;

    fn cfg() -> SteeringConfig {
        SteeringConfig::default()
    }

    fn base(phase: Phase) -> PhasePreset {
        preset::resolve(phase, GrowthInfo::default(), &CalibrationOverrides::default())
    }

    fn input(now: Instant, vwc: f64, light_on: Option<bool>, preset: &PhasePreset) -> CycleInput<'_> {
        CycleInput {
            now,
            vwc,
            light_on,
            preset,
        }
    }

    fn initial(vwc: Option<f64>, light: Option<bool>, persisted: &RoomSnapshot) -> PhaseMachine {
        PhaseMachine::initial(vwc, light, persisted, base, &cfg()).0
    }

    // -- Dryback -------------------------------------------------------------

    #[test]
    fn dryback_from_sixty_to_fifty_four_is_ten_percent() {
        assert_eq!(dryback_percent(60.0, 54.0), 10.0);
        assert_eq!(dryback_percent(0.0, 54.0), 0.0);
    }

    // -- Initial phase -------------------------------------------------------

    #[test]
    fn initial_phase_follows_light_and_moisture() {
        let none = RoomSnapshot::default();
        assert_eq!(initial(Some(50.0), Some(true), &none).phase(), Phase::P1Saturation);
        assert_eq!(initial(Some(60.0), Some(true), &none).phase(), Phase::P0Monitoring);
        // 68 * 0.95 = 64.6
        assert_eq!(initial(Some(65.0), Some(true), &none).phase(), Phase::P2Maintenance);
        // Unknown light is treated as day.
        assert_eq!(initial(Some(50.0), None, &none).phase(), Phase::P1Saturation);

        let night = initial(Some(62.0), Some(false), &none);
        assert_eq!(night.phase(), Phase::P3NightDryback);
        assert_eq!(night.start_night_vwc(), Some(62.0));
    }

    #[test]
    fn restart_at_night_keeps_persisted_night_start() {
        let persisted = RoomSnapshot {
            phase: Phase::P3NightDryback,
            start_night_vwc: Some(66.0),
            ..Default::default()
        };
        let m = initial(Some(61.0), Some(false), &persisted);
        assert_eq!(m.start_night_vwc(), Some(66.0));
    }

    #[test]
    fn restart_without_data_resumes_persisted_phase() {
        let persisted = RoomSnapshot {
            phase: Phase::P1Saturation,
            p1_shots: 4,
            ..Default::default()
        };
        let m = initial(None, Some(true), &persisted);
        assert_eq!(m.phase(), Phase::P1Saturation);
        assert_eq!(m.shots.shots, 4);
    }

    // -- P0 ------------------------------------------------------------------

    #[test]
    fn monitoring_moves_to_saturation_only_below_min() {
        let p = base(Phase::P0Monitoring);
        let now = Instant::now();
        let mut m = PhaseMachine::new(Phase::P0Monitoring);

        assert_eq!(m.step(&input(now, 56.0, Some(true), &p), &cfg()), Decision::default());
        let d = m.step(&input(now, 54.9, Some(true), &p), &cfg());
        let t = d.transition.unwrap();
        assert_eq!((t.from, t.to), (Phase::P0Monitoring, Phase::P1Saturation));
        assert!(d.shot.is_none(), "transition must short-circuit dosing");
    }

    // -- P1 ------------------------------------------------------------------

    #[test]
    fn saturation_reaching_max_moves_to_maintenance() {
        let p = base(Phase::P1Saturation);
        let mut m = PhaseMachine::new(Phase::P1Saturation);
        let d = m.step(&input(Instant::now(), 68.0, Some(true), &p), &cfg());
        assert_eq!(d.transition.unwrap().to, Phase::P2Maintenance);
        assert_eq!(d.calibrated_max, None);
    }

    #[test]
    fn saturation_spaces_shots_by_wait_between() {
        let p = base(Phase::P1Saturation);
        let t0 = Instant::now();
        let mut m = PhaseMachine::new(Phase::P1Saturation);

        let d = m.step(&input(t0, 50.0, Some(true), &p), &cfg());
        assert_eq!(d.shot.as_ref().unwrap().kind, ShotKind::Saturation);
        assert_eq!(d.shot.unwrap().duration, Duration::from_secs(60));
        assert_eq!(d.next_check, Some(Duration::from_secs(300)));

        let d = m.step(&input(t0 + Duration::from_secs(120), 53.0, Some(true), &p), &cfg());
        assert!(d.shot.is_none());
        assert_eq!(d.next_check, Some(Duration::from_secs(180)));

        let d = m.step(&input(t0 + Duration::from_secs(300), 54.0, Some(true), &p), &cfg());
        assert!(d.shot.is_some());
    }

    #[test]
    fn saturation_stagnation_records_max_and_moves_on() {
        let p = base(Phase::P1Saturation);
        let wait = p.wait_between();
        let t0 = Instant::now();
        let mut m = PhaseMachine::new(Phase::P1Saturation);

        // Three shots, each gaining less than 0.5.
        let readings = [50.0, 50.2, 50.4];
        for (i, vwc) in readings.iter().enumerate() {
            let d = m.step(&input(t0 + wait * i as u32, *vwc, Some(true), &p), &cfg());
            assert!(d.shot.is_some(), "shot {i} should fire");
        }
        let d = m.step(&input(t0 + wait * 3, 50.6, Some(true), &p), &cfg());
        let t = d.transition.expect("stagnation should transition");
        assert_eq!(t.to, Phase::P2Maintenance);
        assert_eq!(d.calibrated_max, Some(50.6));
        assert!(d.shot.is_none());
    }

    #[test]
    fn saturation_progress_resets_stagnation_counter() {
        let p = base(Phase::P1Saturation);
        let wait = p.wait_between();
        let t0 = Instant::now();
        let mut m = PhaseMachine::new(Phase::P1Saturation);

        for (i, vwc) in [50.0, 50.1, 50.2, 53.0, 53.1].iter().enumerate() {
            let d = m.step(&input(t0 + wait * i as u32, *vwc, Some(true), &p), &cfg());
            assert!(d.transition.is_none(), "reading {i} must not transition");
        }
    }

    #[test]
    fn saturation_gives_up_after_max_attempts() {
        let p = base(Phase::P1Saturation);
        let wait = p.wait_between();
        let t0 = Instant::now();
        let mut m = PhaseMachine::new(Phase::P1Saturation);

        let mut vwc = 40.0;
        for i in 0..p.max_attempts {
            let d = m.step(&input(t0 + wait * i, vwc, Some(true), &p), &cfg());
            assert!(d.shot.is_some());
            vwc += 1.0;
        }
        let d = m.step(&input(t0 + wait * p.max_attempts, vwc, Some(true), &p), &cfg());
        assert_eq!(d.transition.unwrap().to, Phase::P2Maintenance);
        assert_eq!(d.calibrated_max, Some(vwc));
    }

    // -- P2 ------------------------------------------------------------------

    #[test]
    fn maintenance_tops_up_below_hold_threshold() {
        let p = base(Phase::P2Maintenance);
        let t0 = Instant::now();
        let mut m = PhaseMachine::new(Phase::P2Maintenance);

        assert!(m.step(&input(t0, 65.0, Some(true), &p), &cfg()).shot.is_none());
        let d = m.step(&input(t0, 64.0, Some(true), &p), &cfg());
        assert_eq!(d.shot.unwrap().kind, ShotKind::Maintenance);
        // Still inside wait_between.
        let d = m.step(&input(t0 + Duration::from_secs(120), 63.0, Some(true), &p), &cfg());
        assert!(d.shot.is_none());
    }

    #[test]
    fn maintenance_lights_off_starts_dryback_without_dosing() {
        let p = base(Phase::P2Maintenance);
        let mut m = PhaseMachine::new(Phase::P2Maintenance);
        let d = m.step(&input(Instant::now(), 60.0, Some(false), &p), &cfg());
        assert_eq!(d.transition.unwrap().to, Phase::P3NightDryback);
        assert!(d.shot.is_none());
        assert_eq!(m.start_night_vwc(), Some(60.0));
    }

    // -- P3 ------------------------------------------------------------------

    fn night_machine(start: f64) -> PhaseMachine {
        let mut m = PhaseMachine::new(Phase::P3NightDryback);
        m.start_night_vwc = Some(start);
        m
    }

    #[test]
    fn shallow_dryback_raises_ec() {
        let p = base(Phase::P3NightDryback);
        let mut m = night_machine(68.0);
        // 2.9% dryback < 8%
        let d = m.step(&input(Instant::now(), 66.0, Some(false), &p), &cfg());
        let ec = d.ec_change.unwrap();
        assert!((ec.target - 3.3).abs() < 1e-9);
        assert!(d.shot.is_none());
    }

    #[test]
    fn deep_dryback_lowers_ec_and_fires_emergency_in_same_cycle() {
        let p = base(Phase::P3NightDryback);
        let mut m = night_machine(68.0);
        // 20.6% dryback > 12%, and 54 < 68 * 0.9
        let d = m.step(&input(Instant::now(), 54.0, Some(false), &p), &cfg());
        assert!((d.ec_change.unwrap().target - 3.1).abs() < 1e-9);
        assert_eq!(d.shot.unwrap().kind, ShotKind::Emergency);
        assert!(d.transition.is_none());
    }

    #[test]
    fn ec_target_is_clamped_to_preset_bounds() {
        let p = base(Phase::P3NightDryback);
        let mut m = night_machine(68.0);
        m.ec_target = Some(p.ec_max);
        let d = m.step(&input(Instant::now(), 67.0, Some(false), &p), &cfg());
        assert!(d.ec_change.is_none());
        assert_eq!(m.ec_target(), Some(p.ec_max));
    }

    #[test]
    fn dryback_in_band_leaves_ec_alone() {
        let p = base(Phase::P3NightDryback);
        let mut m = night_machine(70.0);
        // 10% dryback, 63 >= 61.2 emergency floor
        let d = m.step(&input(Instant::now(), 63.0, Some(false), &p), &cfg());
        assert_eq!(d, Decision::default());
    }

    #[test]
    fn lights_on_ends_night_and_clears_reference() {
        let p = base(Phase::P3NightDryback);
        let mut m = night_machine(66.0);
        let d = m.step(&input(Instant::now(), 55.0, Some(true), &p), &cfg());
        assert_eq!(d.transition.unwrap().to, Phase::P0Monitoring);
        assert!(d.shot.is_none(), "transition wins over emergency shot");
        assert_eq!(m.start_night_vwc(), None);
    }

    // -- Monotonicity ----------------------------------------------------------

    #[test]
    fn transitions_only_follow_the_documented_cycle() {
        // Small LCG so the sequence is deterministic.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as f64 / (1u64 << 31) as f64
        };

        let mut m = PhaseMachine::new(Phase::P0Monitoring);
        let mut now = Instant::now();
        let mut transitions = 0;
        for _ in 0..5000 {
            now += Duration::from_secs(120);
            let vwc = 40.0 + next() * 35.0;
            let light = match (next() * 3.0) as u32 {
                0 => Some(false),
                1 => Some(true),
                _ => None,
            };
            let p = base(m.phase());
            let before = m.phase();
            let d = m.step(&input(now, vwc, light, &p), &cfg());
            match d.transition {
                Some(t) => {
                    transitions += 1;
                    assert_eq!(t.from, before);
                    assert_eq!(t.to, before.successor());
                    assert_eq!(m.phase(), t.to);
                    assert!(d.shot.is_none() && d.ec_change.is_none());
                }
                None => assert_eq!(m.phase(), before),
            }
        }
        assert!(transitions > 10, "sequence should exercise transitions");
    }

    // -- Loop ----------------------------------------------------------------

    /// Pump driver that wets the substrate a fixed amount per shot.
    struct WettingDriver {
        inputs: Arc<FakeInputs>,
        gain: f64,
        shots: Mutex<Vec<Instant>>,
        inner: RecordingDriver,
    }

    impl PumpDriver for WettingDriver {
        fn set(&self, device: &str, on: bool) -> ControlResult<()> {
            if on {
                let vwc = self.inputs.average("r1").vwc.unwrap_or_default();
                self.inputs.set_vwc(vwc + self.gain);
                self.shots.lock().unwrap().push(Instant::now());
            }
            self.inner.set(device, on)
        }
    }

    async fn wait_for_phase(store: &MemoryStore, phase: Phase) {
        while store.load("r1").phase != phase {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_saturate_maintain_and_dry_back() {
        let inputs = Arc::new(FakeInputs::default());
        inputs.set_vwc(50.0);
        inputs.set_light(true);
        let driver = Arc::new(WettingDriver {
            inputs: inputs.clone(),
            gain: 5.0,
            shots: Mutex::new(Vec::new()),
            inner: RecordingDriver::default(),
        });
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(context_with(inputs.clone(), driver.clone(), store.clone()));
        let mut notices = ctx.notifier.subscribe();

        let op = Operation::new(OperationKind::CropSteering);
        let task = tokio::spawn(run_automatic(ctx.clone(), op.clone()));

        // Starts in P1 (light on, 50 < 55), not P0.
        let first = notices.recv().await.unwrap();
        assert!(matches!(
            first.notice,
            Notice::PhaseTransition {
                from: Phase::P0Monitoring,
                to: Phase::P1Saturation,
                ..
            }
        ));

        wait_for_phase(&store, Phase::P2Maintenance).await;
        // 50 -> 55 -> 60 -> 65 -> 70 >= 68
        let shots = driver.shots.lock().unwrap().clone();
        assert_eq!(shots.len(), 4);
        for pair in shots.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(300));
        }
        assert_eq!(store.load("r1").overrides, CalibrationOverrides::default());

        inputs.set_light(false);
        wait_for_phase(&store, Phase::P3NightDryback).await;
        assert_eq!(store.load("r1").start_night_vwc, Some(70.0));

        op.cancel();
        assert!(matches!(task.await.unwrap(), Err(ControlError::Cancelled)));
        assert!(ctx.arbitrator.snapshot().is_empty());
        assert!(!driver.inner.is_on("p1"));
        assert_eq!(store.irrigations().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_sensor_data_skips_the_cycle() {
        let inputs = Arc::new(FakeInputs::default());
        inputs.set_light(true);
        let driver = Arc::new(RecordingDriver::default());
        let store = Arc::new(MemoryStore::new());
        store
            .save(
                "r1",
                &RoomSnapshot {
                    phase: Phase::P1Saturation,
                    ..Default::default()
                },
            )
            .unwrap();
        let ctx = context_with(inputs.clone(), driver.clone(), store.clone());
        let op = Operation::new(OperationKind::CropSteering);
        let mut m = PhaseMachine::new(Phase::P1Saturation);

        let wait = run_cycle(&ctx, &op, &mut m).await.unwrap();
        assert_eq!(wait, Duration::from_secs(120));
        assert_eq!(m.phase(), Phase::P1Saturation);
        assert!(driver.commands().is_empty());

        // A zero average is "no data", not "bone dry".
        inputs.set_vwc(0.0);
        run_cycle(&ctx, &op, &mut m).await.unwrap();
        assert!(driver.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pump_fault_triggers_emergency_stop() {
        let inputs = Arc::new(FakeInputs::default());
        inputs.set_vwc(50.0);
        inputs.set_light(true);
        let driver = Arc::new(RecordingDriver::default());
        *driver.fail_on.lock().unwrap() = Some("p1".into());
        let ctx = Arc::new(context_with(
            inputs,
            driver.clone(),
            Arc::new(MemoryStore::new()),
        ));
        let mut notices = ctx.notifier.subscribe();

        let op = Operation::new(OperationKind::CropSteering);
        let err = run_automatic(ctx.clone(), op).await.unwrap_err();
        assert!(matches!(err, ControlError::Pump { .. }));
        assert!(ctx.arbitrator.snapshot().is_empty());
        assert!(!driver.is_on("p1"));

        let mut saw_stop = false;
        while let Ok(n) = notices.try_recv() {
            saw_stop |= matches!(n.notice, Notice::EmergencyStop { .. });
        }
        assert!(saw_stop);
    }

    #[tokio::test]
    async fn automatic_without_pumps_is_a_configuration_error() {
        let mut ctx = context_with(
            Arc::new(FakeInputs::default()),
            Arc::new(RecordingDriver::default()),
            Arc::new(MemoryStore::new()),
        );
        ctx.devices.clear();
        let err = run_automatic(Arc::new(ctx), Operation::new(OperationKind::CropSteering))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Configuration(_)));
    }
}
