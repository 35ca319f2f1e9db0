//! Everything a room task needs, bundled once per room and shared by `Arc`.

use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, warn};

use crate::config::{CalibrationConfig, ManualConfig, SteeringConfig};
use crate::model::Phase;
use crate::notice::{Notice, Notifier};
use crate::persist::{RoomSnapshot, StateStore};
use crate::preset::{self, PhasePreset};
use crate::pump::{IrrigationExecutor, PumpArbitrator};
use crate::sensor::{RoomInputs, SensorAverage};

pub struct RoomContext {
    pub room_id: String,
    pub devices: Vec<String>,
    pub inputs: Arc<dyn RoomInputs>,
    pub arbitrator: Arc<PumpArbitrator>,
    pub executor: IrrigationExecutor,
    pub store: Arc<dyn StateStore>,
    pub notifier: Notifier,
    pub steering: SteeringConfig,
    pub calibration: CalibrationConfig,
    pub manual: Option<ManualConfig>,
}

impl RoomContext {
    pub fn sensors(&self) -> SensorAverage {
        self.inputs.average(&self.room_id)
    }

    pub fn light_on(&self) -> Option<bool> {
        self.inputs.light_on(&self.room_id)
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.store.load(&self.room_id)
    }

    /// Read-modify-write the persisted snapshot. Store failures are logged;
    /// control keeps running on the in-memory view.
    pub fn update(&self, f: impl FnOnce(&mut RoomSnapshot)) -> RoomSnapshot {
        let mut snapshot = self.store.load(&self.room_id);
        f(&mut snapshot);
        if let Err(e) = self.store.save(&self.room_id, &snapshot) {
            warn!(room = %self.room_id, "failed to persist room state: {e}");
        }
        snapshot
    }

    pub fn record_irrigation(&self) {
        self.update(|s| s.last_irrigation = Some(OffsetDateTime::now_utc().unix_timestamp()));
    }

    /// Preset for `phase` with growth adjustment, calibration overrides and
    /// configured dryback bounds applied.
    pub fn preset(&self, phase: Phase) -> PhasePreset {
        let snapshot = self.store.load(&self.room_id);
        let mut p = preset::resolve(phase, self.inputs.growth(&self.room_id), &snapshot.overrides);
        if let Some(min) = self.steering.dryback_min_percent {
            p.dryback_min = min;
        }
        if let Some(max) = self.steering.dryback_max_percent {
            p.dryback_max = max;
        }
        p
    }

    pub fn notify(&self, notice: Notice) {
        self.notifier.emit(&self.room_id, notice);
    }

    /// Force every pump in the room off and clear the registry.
    pub fn emergency_stop(&self, reason: &str) {
        error!(room = %self.room_id, reason, "emergency stop");
        self.arbitrator.emergency_cleanup();
        self.arbitrator.force_off(&self.devices);
        self.notify(Notice::EmergencyStop {
            reason: reason.to_string(),
        });
    }
}
