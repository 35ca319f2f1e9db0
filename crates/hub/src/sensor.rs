//! Latest raw per-entity readings for each room, plus the light status and
//! growth stage the steering cycle needs. Averages are recomputed on every
//! read; entities reporting something non-numeric simply drop out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::preset::GrowthInfo;

// ---------------------------------------------------------------------------
// SensorAverage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorAverage {
    pub vwc: Option<f64>,
    pub ec: Option<f64>,
}

impl SensorAverage {
    /// Moisture usable for control decisions. A reading of exactly `0` means
    /// the aggregate has no data, not that the substrate is bone dry.
    pub fn moisture(&self) -> Option<f64> {
        self.vwc.filter(|v| *v != 0.0)
    }
}

/// Interpret a raw entity state as a number. Accepts JSON numbers and
/// numeric strings; anything else (`"unavailable"`, `null`, NaN) is `None`.
pub fn numeric(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// Arithmetic mean of the numeric values; `None` when none are usable.
pub fn mean<'a>(values: impl IntoIterator<Item = &'a Value>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .filter_map(numeric)
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

fn parse_light(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" | "day" => Some(true),
            "off" | "false" | "0" | "night" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Wire snapshot
// ---------------------------------------------------------------------------

/// One `tele/<room>/sensors` payload. Entities not mentioned keep their
/// previous value.
#[derive(Debug, Default, Deserialize)]
pub struct SensorSnapshot {
    #[serde(default)]
    pub vwc: HashMap<String, Value>,
    #[serde(default)]
    pub ec: HashMap<String, Value>,
    #[serde(default)]
    pub light: Option<Value>,
}

// ---------------------------------------------------------------------------
// Inputs contract
// ---------------------------------------------------------------------------

/// What a room task reads from the outside world.
pub trait RoomInputs: Send + Sync {
    fn average(&self, room: &str) -> SensorAverage;

    /// `None` while the light state is unknown.
    fn light_on(&self, room: &str) -> Option<bool>;

    fn growth(&self, room: &str) -> GrowthInfo;
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RoomReadings {
    vwc: HashMap<String, Value>,
    ec: HashMap<String, Value>,
    light: Option<bool>,
    growth: Option<GrowthInfo>,
}

#[derive(Debug, Default)]
pub struct SensorAggregator {
    rooms: RwLock<HashMap<String, RoomReadings>>,
}

impl SensorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RoomReadings>> {
        self.rooms.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RoomReadings>> {
        self.rooms.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn apply_snapshot(&self, room: &str, snapshot: SensorSnapshot) {
        let mut rooms = self.write();
        let entry = rooms.entry(room.to_string()).or_default();
        entry.vwc.extend(snapshot.vwc);
        entry.ec.extend(snapshot.ec);
        if let Some(light) = snapshot.light.as_ref() {
            match parse_light(light) {
                Some(on) => entry.light = Some(on),
                None => tracing::debug!(room = %room, ?light, "ignoring unparseable light state"),
            }
        }
    }

    pub fn set_growth(&self, room: &str, growth: GrowthInfo) {
        self.write().entry(room.to_string()).or_default().growth = Some(growth);
    }
}

impl RoomInputs for SensorAggregator {
    fn average(&self, room: &str) -> SensorAverage {
        let rooms = self.read();
        match rooms.get(room) {
            Some(r) => SensorAverage {
                vwc: mean(r.vwc.values()),
                ec: mean(r.ec.values()),
            },
            None => SensorAverage::default(),
        }
    }

    fn light_on(&self, room: &str) -> Option<bool> {
        self.read().get(room).and_then(|r| r.light)
    }

    fn growth(&self, room: &str) -> GrowthInfo {
        self.read()
            .get(room)
            .and_then(|r| r.growth)
            .unwrap_or_default()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
