//! TOML config file loading and validation: steering tunables, calibration
//! parameters, and the rooms with their pump devices.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ControlError, ControlResult};
use crate::preset::{GrowthInfo, GrowthStage};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub steering: SteeringConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub rooms: Vec<RoomEntry>,
}

/// Tunables of the automatic steering cycle. The stagnation and dryback
/// numbers are empirical, so they live here rather than in code.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SteeringConfig {
    pub block_check_interval_sec: u64,
    /// P2 irrigates below `effective_max * hold_percentage`.
    pub hold_percentage: f64,
    /// Consecutive low-gain P1 shots before saturation counts as stalled.
    pub stagnation_shots: u32,
    /// VWC gain per shot below which a shot counts as stagnant.
    pub stagnation_delta: f64,
    pub ec_nudge_step: f64,
    /// Replace the preset dryback bounds when set.
    pub dryback_min_percent: Option<f64>,
    pub dryback_max_percent: Option<f64>,
    /// Grace given to a cancelled operation before forced cleanup.
    pub cancel_grace_sec: u64,
}

impl Default for SteeringConfig {
    fn default() -> Self {
        Self {
            block_check_interval_sec: 120,
            hold_percentage: 0.95,
            stagnation_shots: 3,
            stagnation_delta: 0.5,
            ec_nudge_step: 0.1,
            dryback_min_percent: None,
            dryback_max_percent: None,
            cancel_grace_sec: 5,
        }
    }
}

impl SteeringConfig {
    pub fn block_check_interval(&self) -> Duration {
        Duration::from_secs(self.block_check_interval_sec)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_sec)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub max_attempts: u32,
    pub shot_duration_sec: u64,
    pub poll_interval_sec: u64,
    pub stabilization_timeout_sec: u64,
    /// Percent.
    pub stability_tolerance: f64,
    pub dryback_window_sec: u64,
    /// Fraction added on top of the observed minimum.
    pub min_safety_margin: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            shot_duration_sec: 30,
            poll_interval_sec: 30,
            stabilization_timeout_sec: 900,
            stability_tolerance: 2.0,
            dryback_window_sec: 3600,
            min_safety_margin: 0.10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomEntry {
    pub room_id: String,
    #[serde(default)]
    pub name: String,
    pub pump_devices: Vec<String>,
    #[serde(default)]
    pub growth_stage: GrowthStage,
    #[serde(default = "default_generative_week")]
    pub generative_week: u32,
    #[serde(default)]
    pub manual: Option<ManualConfig>,
}

fn default_generative_week() -> u32 {
    GrowthInfo::default().week
}

impl RoomEntry {
    pub fn growth(&self) -> GrowthInfo {
        GrowthInfo {
            stage: self.growth_stage,
            week: self.generative_week,
        }
    }
}

/// Operator settings for manual mode, used verbatim.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManualConfig {
    pub shot_count: u32,
    pub shot_interval_sec: u64,
    pub shot_duration_sec: u64,
    pub ec_target: f64,
    pub vwc_min: f64,
    #[serde(default = "default_cycle_window_sec")]
    pub cycle_window_sec: u64,
    #[serde(default = "default_manual_poll_sec")]
    pub poll_interval_sec: u64,
    #[serde(default = "default_ec_tolerance")]
    pub ec_tolerance: f64,
}

fn default_cycle_window_sec() -> u64 {
    3600
}

fn default_manual_poll_sec() -> u64 {
    30
}

fn default_ec_tolerance() -> f64 {
    0.2
}

impl ManualConfig {
    /// Checked again when the manual cycle starts; the file may be fine
    /// while a room still lacks settings.
    pub fn check(&self) -> ControlResult<()> {
        let mut problems = Vec::new();
        if self.shot_count == 0 {
            problems.push("shot_count must be positive");
        }
        if self.shot_interval_sec == 0 {
            problems.push("shot_interval_sec must be positive");
        }
        if self.shot_duration_sec == 0 {
            problems.push("shot_duration_sec must be positive");
        }
        if self.shot_duration_sec >= self.shot_interval_sec && self.shot_interval_sec > 0 {
            problems.push("shot_duration_sec must be shorter than shot_interval_sec");
        }
        if self.poll_interval_sec == 0 {
            problems.push("poll_interval_sec must be positive");
        }
        if self.cycle_window_sec < self.shot_interval_sec {
            problems.push("cycle_window_sec must cover at least one shot interval");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ControlError::Configuration(problems.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_steering(&mut errors);
        self.validate_calibration(&mut errors);
        self.validate_rooms(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_steering(&self, errors: &mut Vec<String>) {
        let s = &self.steering;
        if s.block_check_interval_sec == 0 {
            errors.push("steering: block_check_interval_sec must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&s.hold_percentage) || s.hold_percentage == 0.0 {
            errors.push(format!(
                "steering: hold_percentage {} out of range (0.0, 1.0]",
                s.hold_percentage
            ));
        }
        if s.stagnation_shots == 0 {
            errors.push("steering: stagnation_shots must be positive".to_string());
        }
        if s.stagnation_delta < 0.0 {
            errors.push(format!(
                "steering: stagnation_delta must not be negative, got {}",
                s.stagnation_delta
            ));
        }
        if s.ec_nudge_step <= 0.0 {
            errors.push(format!(
                "steering: ec_nudge_step must be positive, got {}",
                s.ec_nudge_step
            ));
        }
        if let (Some(min), Some(max)) = (s.dryback_min_percent, s.dryback_max_percent) {
            if min >= max {
                errors.push(format!(
                    "steering: dryback_min_percent ({min}) must be below dryback_max_percent ({max})"
                ));
            }
        }
        if s.cancel_grace_sec == 0 {
            errors.push("steering: cancel_grace_sec must be positive".to_string());
        }
    }

    fn validate_calibration(&self, errors: &mut Vec<String>) {
        let c = &self.calibration;
        if c.max_attempts == 0 {
            errors.push("calibration: max_attempts must be positive".to_string());
        }
        if c.shot_duration_sec == 0 {
            errors.push("calibration: shot_duration_sec must be positive".to_string());
        }
        if c.poll_interval_sec == 0 {
            errors.push("calibration: poll_interval_sec must be positive".to_string());
        }
        if c.stabilization_timeout_sec < c.poll_interval_sec.saturating_mul(3) {
            errors.push(format!(
                "calibration: stabilization_timeout_sec ({}) must allow at least 3 polls of {}s",
                c.stabilization_timeout_sec, c.poll_interval_sec
            ));
        }
        if c.stability_tolerance <= 0.0 {
            errors.push(format!(
                "calibration: stability_tolerance must be positive, got {}",
                c.stability_tolerance
            ));
        }
        if c.dryback_window_sec < c.poll_interval_sec {
            errors.push("calibration: dryback_window_sec shorter than poll_interval_sec".to_string());
        }
        if !(0.0..1.0).contains(&c.min_safety_margin) {
            errors.push(format!(
                "calibration: min_safety_margin {} out of range [0.0, 1.0)",
                c.min_safety_margin
            ));
        }
    }

    fn validate_rooms(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, r) in self.rooms.iter().enumerate() {
            let ctx = || {
                if r.room_id.is_empty() {
                    format!("rooms[{i}]")
                } else {
                    format!("room '{}'", r.room_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if r.room_id.trim().is_empty() {
                errors.push(format!("{}: room_id is empty", ctx()));
            } else if r.room_id.contains(['/', '+', '#']) {
                errors.push(format!("{}: room_id must not contain MQTT wildcards or '/'", ctx()));
            } else if !seen_ids.insert(&r.room_id) {
                errors.push(format!("{}: duplicate room_id", ctx()));
            }

            // ── Pumps ───────────────────────────────────────────
            if r.pump_devices.is_empty() {
                errors.push(format!("{}: no pump devices configured", ctx()));
            }
            let mut seen_devices: HashSet<&str> = HashSet::new();
            for d in &r.pump_devices {
                if d.trim().is_empty() {
                    errors.push(format!("{}: pump device id is empty", ctx()));
                } else if !seen_devices.insert(d) {
                    errors.push(format!("{}: pump device '{d}' listed twice", ctx()));
                }
            }

            // ── Manual settings ─────────────────────────────────
            if let Some(m) = &r.manual {
                if let Err(e) = m.check() {
                    errors.push(format!("{}: manual: {e}", ctx()));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_manual() -> ManualConfig {
        ManualConfig {
            shot_count: 4,
            shot_interval_sec: 900,
            shot_duration_sec: 45,
            ec_target: 3.0,
            vwc_min: 55.0,
            cycle_window_sec: 3600,
            poll_interval_sec: 30,
            ec_tolerance: 0.2,
        }
    }

    fn valid_room() -> RoomEntry {
        RoomEntry {
            room_id: "flower-1".into(),
            name: "Flower 1".into(),
            pump_devices: vec!["pump-a".into(), "pump-b".into()],
            growth_stage: GrowthStage::Generative,
            generative_week: 4,
            manual: Some(valid_manual()),
        }
    }

    fn valid_config() -> Config {
        Config {
            rooms: vec![valid_room()],
            ..Default::default()
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[steering]
block_check_interval_sec = 60
stagnation_delta = 0.3

[calibration]
stability_tolerance = 1.5

[[rooms]]
room_id = "flower-1"
name = "Flower 1"
pump_devices = ["pump-a"]
growth_stage = "vegetative"

[rooms.manual]
shot_count = 3
shot_interval_sec = 600
shot_duration_sec = 30
ec_target = 2.8
vwc_min = 52.0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.steering.block_check_interval_sec, 60);
        assert_eq!(config.steering.stagnation_delta, 0.3);
        // Unspecified fields keep their defaults.
        assert_eq!(config.steering.stagnation_shots, 3);
        assert_eq!(config.steering.hold_percentage, 0.95);
        assert_eq!(config.calibration.stability_tolerance, 1.5);
        assert_eq!(config.calibration.max_attempts, 8);

        let room = &config.rooms[0];
        assert_eq!(room.growth().stage, GrowthStage::Vegetative);
        assert_eq!(room.generative_week, 4);
        let manual = room.manual.as_ref().unwrap();
        assert_eq!(manual.cycle_window_sec, 3600);
        assert_eq!(manual.ec_tolerance, 0.2);
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.rooms.is_empty());
        assert_eq!(config.steering.block_check_interval_sec, 120);
        config.validate().unwrap();
    }

    // -- Validation: rooms ------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn room_without_pumps_rejected() {
        let mut cfg = valid_config();
        cfg.rooms[0].pump_devices.clear();
        assert_validation_err(&cfg, "no pump devices configured");
    }

    #[test]
    fn duplicate_room_rejected() {
        let mut cfg = valid_config();
        cfg.rooms.push(valid_room());
        assert_validation_err(&cfg, "duplicate room_id");
    }

    #[test]
    fn room_id_with_topic_separator_rejected() {
        let mut cfg = valid_config();
        cfg.rooms[0].room_id = "a/b".into();
        assert_validation_err(&cfg, "must not contain MQTT wildcards");
    }

    #[test]
    fn duplicate_pump_device_rejected() {
        let mut cfg = valid_config();
        cfg.rooms[0].pump_devices = vec!["pump-a".into(), "pump-a".into()];
        assert_validation_err(&cfg, "listed twice");
    }

    // -- Validation: manual -----------------------------------------------

    #[test]
    fn manual_zero_shot_count_rejected() {
        let mut cfg = valid_config();
        cfg.rooms[0].manual.as_mut().unwrap().shot_count = 0;
        assert_validation_err(&cfg, "shot_count must be positive");
    }

    #[test]
    fn manual_duration_longer_than_interval_rejected() {
        let m = ManualConfig {
            shot_duration_sec: 900,
            ..valid_manual()
        };
        let err = m.check().unwrap_err();
        assert!(err.to_string().contains("shorter than shot_interval_sec"));
    }

    // -- Validation: tunables ---------------------------------------------

    #[test]
    fn hold_percentage_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.steering.hold_percentage = 1.2;
        assert_validation_err(&cfg, "hold_percentage");
    }

    #[test]
    fn inverted_dryback_bounds_rejected() {
        let mut cfg = valid_config();
        cfg.steering.dryback_min_percent = Some(12.0);
        cfg.steering.dryback_max_percent = Some(8.0);
        assert_validation_err(&cfg, "dryback_min_percent");
    }

    #[test]
    fn stabilization_timeout_too_short_rejected() {
        let mut cfg = valid_config();
        cfg.calibration.stabilization_timeout_sec = 60;
        assert_validation_err(&cfg, "at least 3 polls");
    }

    #[test]
    fn huge_poll_interval_is_rejected_not_overflowed() {
        let mut cfg = valid_config();
        cfg.calibration.poll_interval_sec = u64::MAX;
        assert_validation_err(&cfg, "at least 3 polls");
    }

    #[test]
    fn every_violation_is_reported() {
        let mut cfg = valid_config();
        cfg.rooms[0].pump_devices.clear();
        cfg.steering.stagnation_shots = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("2 errors"), "got: {msg}");
    }
}
