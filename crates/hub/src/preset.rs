//! Phase presets: a static base table, growth-stage adjustments, and
//! calibration overrides layered on top. Every function here is pure; the
//! base table is never mutated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::model::Phase;

// ---------------------------------------------------------------------------
// PhasePreset
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhasePreset {
    pub vwc_target: f64,
    pub vwc_min: f64,
    pub vwc_max: f64,

    pub ec_target: f64,
    pub ec_min: f64,
    pub ec_max: f64,

    pub irrigation_duration_sec: u64,
    pub max_attempts: u32,
    pub wait_between_sec: u64,

    /// Percent drop from the night-start moisture.
    pub dryback_target: f64,
    pub dryback_min: f64,
    pub dryback_max: f64,

    /// Fraction of the effective maximum below which an emergency shot fires.
    pub emergency_threshold: f64,
}

impl PhasePreset {
    pub fn irrigation_duration(&self) -> Duration {
        Duration::from_secs(self.irrigation_duration_sec)
    }

    pub fn wait_between(&self) -> Duration {
        Duration::from_secs(self.wait_between_sec)
    }
}

const BASE_PRESETS: [PhasePreset; 4] = [
    // P0: monitoring
    PhasePreset {
        vwc_target: 60.0,
        vwc_min: 55.0,
        vwc_max: 68.0,
        ec_target: 3.0,
        ec_min: 2.5,
        ec_max: 3.5,
        irrigation_duration_sec: 30,
        max_attempts: 0,
        wait_between_sec: 0,
        dryback_target: 10.0,
        dryback_min: 8.0,
        dryback_max: 12.0,
        emergency_threshold: 0.90,
    },
    // P1: saturation
    PhasePreset {
        vwc_target: 68.0,
        vwc_min: 55.0,
        vwc_max: 68.0,
        ec_target: 3.0,
        ec_min: 2.5,
        ec_max: 3.5,
        irrigation_duration_sec: 60,
        max_attempts: 10,
        wait_between_sec: 300,
        dryback_target: 10.0,
        dryback_min: 8.0,
        dryback_max: 12.0,
        emergency_threshold: 0.90,
    },
    // P2: maintenance
    PhasePreset {
        vwc_target: 65.0,
        vwc_min: 60.0,
        vwc_max: 68.0,
        ec_target: 3.0,
        ec_min: 2.5,
        ec_max: 3.5,
        irrigation_duration_sec: 20,
        max_attempts: 0,
        wait_between_sec: 600,
        dryback_target: 10.0,
        dryback_min: 8.0,
        dryback_max: 12.0,
        emergency_threshold: 0.90,
    },
    // P3: night dryback
    PhasePreset {
        vwc_target: 58.0,
        vwc_min: 50.0,
        vwc_max: 68.0,
        ec_target: 3.2,
        ec_min: 2.5,
        ec_max: 4.0,
        irrigation_duration_sec: 20,
        max_attempts: 0,
        wait_between_sec: 0,
        dryback_target: 10.0,
        dryback_min: 8.0,
        dryback_max: 12.0,
        emergency_threshold: 0.90,
    },
];

pub fn base(phase: Phase) -> &'static PhasePreset {
    &BASE_PRESETS[phase.index()]
}

// ---------------------------------------------------------------------------
// Growth adjustment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthStage {
    Vegetative,
    #[default]
    Generative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowthInfo {
    pub stage: GrowthStage,
    /// Week since flip to generative; ignored while vegetative.
    #[serde(default)]
    pub week: u32,
}

impl Default for GrowthInfo {
    fn default() -> Self {
        Self {
            stage: GrowthStage::Generative,
            week: 4,
        }
    }
}

/// Offsets added to the VWC, dryback and EC fields of a base preset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthAdjustment {
    pub vwc: f64,
    pub dryback: f64,
    pub ec: f64,
}

impl GrowthAdjustment {
    pub const NONE: GrowthAdjustment = GrowthAdjustment {
        vwc: 0.0,
        dryback: 0.0,
        ec: 0.0,
    };

    pub fn for_growth(growth: GrowthInfo) -> Self {
        match (growth.stage, growth.week) {
            // Wetter, softer steering while building structure.
            (GrowthStage::Vegetative, _) => Self {
                vwc: 2.0,
                dryback: -2.0,
                ec: -0.3,
            },
            // Stretch: push generative signals.
            (GrowthStage::Generative, 0..=3) => Self {
                vwc: -1.0,
                dryback: 2.0,
                ec: 0.2,
            },
            (GrowthStage::Generative, 4..=6) => Self::NONE,
            // Ripening.
            (GrowthStage::Generative, _) => Self {
                vwc: -2.0,
                dryback: 3.0,
                ec: 0.4,
            },
        }
    }
}

pub fn adjust(preset: &PhasePreset, adj: GrowthAdjustment) -> PhasePreset {
    PhasePreset {
        vwc_target: preset.vwc_target + adj.vwc,
        vwc_min: preset.vwc_min + adj.vwc,
        vwc_max: preset.vwc_max + adj.vwc,
        ec_target: preset.ec_target + adj.ec,
        ec_min: preset.ec_min + adj.ec,
        ec_max: preset.ec_max + adj.ec,
        dryback_target: preset.dryback_target + adj.dryback,
        dryback_min: preset.dryback_min + adj.dryback,
        dryback_max: preset.dryback_max + adj.dryback,
        ..*preset
    }
}

// ---------------------------------------------------------------------------
// Calibration overrides
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOverride {
    #[serde(default)]
    pub vwc_max: Option<f64>,
    #[serde(default)]
    pub vwc_min: Option<f64>,
}

/// Discovered substrate bounds keyed by phase. A phase without its own
/// maximum inherits the one found during saturation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationOverrides(BTreeMap<Phase, CalibrationOverride>);

impl CalibrationOverrides {
    pub fn vwc_max_for(&self, phase: Phase) -> Option<f64> {
        self.0
            .get(&phase)
            .and_then(|o| o.vwc_max)
            .or_else(|| self.0.get(&Phase::P1Saturation).and_then(|o| o.vwc_max))
    }

    pub fn vwc_min_for(&self, phase: Phase) -> Option<f64> {
        self.0.get(&phase).and_then(|o| o.vwc_min)
    }

    pub fn set_max(&mut self, phase: Phase, value: f64) {
        self.0.entry(phase).or_default().vwc_max = Some(value);
    }

    pub fn set_min(&mut self, phase: Phase, value: f64) {
        self.0.entry(phase).or_default().vwc_min = Some(value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Preset for `phase` as the steering cycle should use it: base table, plus
/// growth adjustment, with calibrated bounds taking precedence.
pub fn resolve(phase: Phase, growth: GrowthInfo, overrides: &CalibrationOverrides) -> PhasePreset {
    let mut preset = adjust(base(phase), GrowthAdjustment::for_growth(growth));

    if let Some(max) = overrides.vwc_max_for(phase) {
        preset.vwc_max = max;
        preset.vwc_target = preset.vwc_target.min(max);
    }
    if let Some(min) = overrides.vwc_min_for(phase) {
        preset.vwc_min = min;
    }

    preset
}

// ===========================================================================
// Tests
// ===========================================================================
