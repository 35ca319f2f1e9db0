//! Operator-facing notices produced by the control core. Room tasks publish
//! into a broadcast channel; `main` fans them out to the event log, MQTT and
//! the tracing output.

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::model::{IrrigationMode, OperationKind, Phase};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationKind {
    Max,
    Min,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    ModeChanged {
        mode: IrrigationMode,
    },
    IrrigationStarted {
        kind: OperationKind,
        devices: Vec<String>,
        duration_sec: u64,
        reason: String,
    },
    IrrigationStopped {
        kind: OperationKind,
        devices: Vec<String>,
        cancelled: bool,
    },
    PhaseTransition {
        from: Phase,
        to: Phase,
        reason: String,
    },
    EcTargetChanged {
        phase: Phase,
        target: f64,
        reason: String,
    },
    CalibrationProgress {
        calibration: CalibrationKind,
        phase: Phase,
        attempt: u32,
        reading: f64,
    },
    CalibrationCompleted {
        calibration: CalibrationKind,
        phase: Phase,
        value: f64,
        readings: usize,
        attempts: u32,
    },
    CalibrationFailed {
        calibration: CalibrationKind,
        phase: Phase,
        reason: String,
    },
    EmergencyStop {
        reason: String,
    },
    ConfigurationError {
        detail: String,
    },
    OperationFailed {
        kind: OperationKind,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomNotice {
    pub room: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    #[serde(flatten)]
    pub notice: Notice,
}

impl RoomNotice {
    pub fn summary(&self) -> String {
        let room = &self.room;
        match &self.notice {
            Notice::ModeChanged { mode } => format!("{room}: mode -> {mode}"),
            Notice::IrrigationStarted {
                kind,
                devices,
                duration_sec,
                reason,
            } => format!(
                "{room}: {kind} irrigation on [{}] for {duration_sec}s ({reason})",
                devices.join(", ")
            ),
            Notice::IrrigationStopped {
                kind,
                devices,
                cancelled,
            } => format!(
                "{room}: {kind} irrigation off [{}]{}",
                devices.join(", "),
                if *cancelled { " (cancelled)" } else { "" }
            ),
            Notice::PhaseTransition { from, to, reason } => {
                format!("{room}: {from} -> {to} ({reason})")
            }
            Notice::EcTargetChanged {
                phase,
                target,
                reason,
            } => format!("{room}: EC target {target:.2} in {phase} ({reason})"),
            Notice::CalibrationProgress {
                calibration,
                attempt,
                reading,
                ..
            } => format!("{room}: {calibration:?} calibration attempt {attempt} read {reading:.1}"),
            Notice::CalibrationCompleted {
                calibration,
                phase,
                value,
                readings,
                attempts,
            } => format!(
                "{room}: {calibration:?} calibration for {phase} -> {value:.1} ({readings} readings, {attempts} attempts)"
            ),
            Notice::CalibrationFailed {
                calibration,
                phase,
                reason,
            } => format!("{room}: {calibration:?} calibration for {phase} failed: {reason}"),
            Notice::EmergencyStop { reason } => format!("{room}: EMERGENCY STOP ({reason})"),
            Notice::ConfigurationError { detail } => format!("{room}: configuration error: {detail}"),
            Notice::OperationFailed { kind, reason } => format!("{room}: {kind} request failed: {reason}"),
        }
    }
}

/// Cloneable sending half handed to every room task.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<RoomNotice>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomNotice> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; a notice with no subscribers is dropped.
    pub fn emit(&self, room: &str, notice: Notice) {
        let _ = self.tx.send(RoomNotice {
            room: room.to_string(),
            ts: OffsetDateTime::now_utc(),
            notice,
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
