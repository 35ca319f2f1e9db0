//! Per-room supervisor actor.
//!
//! Owns the room's task slots and is the only place tasks are started or
//! stopped:
//!
//! ```text
//!  primary      automatic steering | manual cycle   (at most one)
//!  calibration  max | min experiment                (at most one, pauses primary)
//!  operations   ad-hoc hydro / retrieve / watering / feeding requests
//! ```
//!
//! Commands arrive on an unbounded mailbox ([`RoomHandle`]). Stopping a task
//! cancels its token, waits out the grace period, and falls back to abort
//! plus emergency cleanup. After every stop any registration the task still
//! holds is released.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::calibration;
use crate::error::{ControlError, ControlResult};
use crate::manual;
use crate::model::{IrrigationMode, OperationKind, Phase};
use crate::notice::{CalibrationKind, Notice};
use crate::pump::Operation;
use crate::room::RoomContext;
use crate::steering;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationAction {
    StartMax,
    StartMin,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CalibrationCommand {
    pub action: CalibrationAction,
    #[serde(default = "default_calibration_phase")]
    pub phase: Phase,
}

fn default_calibration_phase() -> Phase {
    Phase::P1Saturation
}

/// Pump run requested by another subsystem.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OperationRequest {
    /// Empty means every pump in the room.
    #[serde(default)]
    pub devices: Vec<String>,
    pub duration_sec: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Primary,
    Calibration,
    Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorStatus {
    pub mode: IrrigationMode,
    pub primary_running: bool,
    pub calibrating: bool,
    pub operations: usize,
}

#[derive(Debug)]
pub enum RoomCommand {
    SetMode(IrrigationMode),
    Calibration(CalibrationCommand),
    RunOperation(OperationKind, OperationRequest),
    TaskFinished {
        slot: Slot,
        op_id: u64,
        error: Option<ControlError>,
    },
    Status(oneshot::Sender<SupervisorStatus>),
    Shutdown,
}

/// Cloneable sending side of a room's mailbox.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Returns `false` once the supervisor has exited.
    pub fn send(&self, cmd: RoomCommand) -> bool {
        self.tx.send(cmd).is_ok()
    }

    pub fn set_mode(&self, mode: IrrigationMode) -> bool {
        self.send(RoomCommand::SetMode(mode))
    }

    pub async fn status(&self) -> Option<SupervisorStatus> {
        let (tx, rx) = oneshot::channel();
        if !self.send(RoomCommand::Status(tx)) {
            return None;
        }
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        self.send(RoomCommand::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct RunningTask {
    op: Operation,
    handle: JoinHandle<()>,
}

pub struct RoomSupervisor {
    ctx: Arc<RoomContext>,
    tx: mpsc::UnboundedSender<RoomCommand>,
    mode: IrrigationMode,
    primary: Option<RunningTask>,
    calibration: Option<RunningTask>,
    calibration_kind: CalibrationKind,
    operations: HashMap<u64, RunningTask>,
}

/// Start the supervisor for `ctx`, resuming its persisted mode.
pub fn spawn(ctx: Arc<RoomContext>) -> (RoomHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = RoomHandle {
        room_id: ctx.room_id.clone(),
        tx: tx.clone(),
    };
    let supervisor = RoomSupervisor {
        ctx,
        tx,
        mode: IrrigationMode::Disabled,
        primary: None,
        calibration: None,
        calibration_kind: CalibrationKind::Max,
        operations: HashMap::new(),
    };
    (handle, tokio::spawn(supervisor.run(rx)))
}

impl RoomSupervisor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        self.mode = self.ctx.snapshot().mode;
        info!(room = %self.ctx.room_id, mode = %self.mode, "room supervisor started");
        self.start_primary();

        while let Some(cmd) = rx.recv().await {
            match cmd {
                RoomCommand::SetMode(mode) => self.set_mode(mode).await,
                RoomCommand::Calibration(cmd) => self.calibration_command(cmd).await,
                RoomCommand::RunOperation(kind, req) => self.run_operation(kind, req),
                RoomCommand::TaskFinished { slot, op_id, error } => {
                    self.task_finished(slot, op_id, error)
                }
                RoomCommand::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                RoomCommand::Shutdown => break,
            }
        }

        self.shutdown().await;
        info!(room = %self.ctx.room_id, "room supervisor stopped");
    }

    fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            mode: self.mode,
            primary_running: self.primary.is_some(),
            calibrating: self.calibration.is_some(),
            operations: self.operations.len(),
        }
    }

    fn spawn_task<F>(&self, slot: Slot, op: Operation, task: F) -> RunningTask
    where
        F: Future<Output = ControlResult<()>> + Send + 'static,
    {
        let tx = self.tx.clone();
        let op_id = op.id();
        let handle = tokio::spawn(async move {
            let error = task.await.err();
            let _ = tx.send(RoomCommand::TaskFinished { slot, op_id, error });
        });
        RunningTask { op, handle }
    }

    // -- Mode ---------------------------------------------------------------

    async fn set_mode(&mut self, mode: IrrigationMode) {
        info!(room = %self.ctx.room_id, from = %self.mode, to = %mode, "mode change");

        self.stop(Slot::Calibration).await;
        self.stop(Slot::Primary).await;
        self.stop_operations().await;
        // Whatever is left was not started by this supervisor.
        if let Err(e) = self.ctx.arbitrator.cancel_all().await {
            self.ctx.notify(Notice::EmergencyStop {
                reason: format!("mode change: {e}"),
            });
        }

        self.mode = mode;
        self.ctx.update(|s| s.mode = mode);
        self.ctx.notify(Notice::ModeChanged { mode });
        self.start_primary();
    }

    fn start_primary(&mut self) {
        if self.primary.is_some() || self.calibration.is_some() {
            return;
        }
        let op = Operation::new(OperationKind::CropSteering);
        let task = match self.mode {
            IrrigationMode::Automatic => self.spawn_task(
                Slot::Primary,
                op.clone(),
                steering::run_automatic(self.ctx.clone(), op),
            ),
            IrrigationMode::Manual(phase) => self.spawn_task(
                Slot::Primary,
                op.clone(),
                manual::run_manual(self.ctx.clone(), op, phase),
            ),
            IrrigationMode::Disabled | IrrigationMode::Config => return,
        };
        debug!(room = %self.ctx.room_id, operation = task.op.id(), mode = %self.mode, "primary task started");
        self.primary = Some(task);
    }

    // -- Calibration ----------------------------------------------------------

    async fn calibration_command(&mut self, cmd: CalibrationCommand) {
        let kind = match cmd.action {
            CalibrationAction::StartMax => CalibrationKind::Max,
            CalibrationAction::StartMin => CalibrationKind::Min,
            CalibrationAction::Stop => {
                if self.calibration.is_some() {
                    self.stop(Slot::Calibration).await;
                    info!(room = %self.ctx.room_id, "calibration stopped by operator");
                    self.ctx.notify(Notice::CalibrationFailed {
                        calibration: self.calibration_kind,
                        phase: cmd.phase,
                        reason: "stopped by operator".to_string(),
                    });
                    self.start_primary();
                }
                return;
            }
        };

        let rejection = if self.mode != IrrigationMode::Automatic {
            Some(format!("calibration requires automatic mode (current: {})", self.mode))
        } else if self.calibration.is_some() {
            Some("a calibration is already running".to_string())
        } else {
            None
        };
        if let Some(reason) = rejection {
            warn!(room = %self.ctx.room_id, %reason, "calibration rejected");
            self.ctx.notify(Notice::CalibrationFailed {
                calibration: kind,
                phase: cmd.phase,
                reason,
            });
            return;
        }

        // Never concurrent with the automatic loop.
        self.stop(Slot::Primary).await;

        let op = Operation::new(OperationKind::CropSteering);
        let ctx = self.ctx.clone();
        let phase = cmd.phase;
        let run_op = op.clone();
        let task = self.spawn_task(Slot::Calibration, op, async move {
            calibration::run(ctx, run_op, kind, phase).await.map(|_| ())
        });
        info!(room = %self.ctx.room_id, calibration = ?kind, %phase, "calibration started");
        self.calibration = Some(task);
        self.calibration_kind = kind;
    }

    // -- Ad-hoc operations ----------------------------------------------------

    fn run_operation(&mut self, kind: OperationKind, req: OperationRequest) {
        let devices = if req.devices.is_empty() {
            self.ctx.devices.clone()
        } else {
            req.devices
        };
        let duration = Duration::from_secs(req.duration_sec);
        let op = Operation::new(kind);
        let executor = self.ctx.executor.clone();
        let run_op = op.clone();
        let task = self.spawn_task(Slot::Operation, op, async move {
            executor
                .irrigate(&run_op, &devices, duration, &format!("{kind} request"))
                .await
        });
        self.operations.insert(task.op.id(), task);
    }

    async fn stop_operations(&mut self) {
        let ops: Vec<RunningTask> = self.operations.drain().map(|(_, t)| t).collect();
        for task in ops {
            self.stop_task(task).await;
        }
    }

    // -- Task lifecycle -------------------------------------------------------

    fn task_finished(&mut self, slot: Slot, op_id: u64, error: Option<ControlError>) {
        let finished = match slot {
            Slot::Primary => take_if(&mut self.primary, op_id),
            Slot::Calibration => take_if(&mut self.calibration, op_id),
            Slot::Operation => self.operations.remove(&op_id),
        };
        // Already stopped and reaped by `stop`.
        let Some(finished) = finished else {
            return;
        };
        self.ctx.arbitrator.release_operation(op_id);

        match error {
            None => debug!(room = %self.ctx.room_id, operation = op_id, ?slot, "task finished"),
            Some(ControlError::Cancelled) if slot == Slot::Primary => {
                // Only `stop` cancels the loop itself, and it reaps the slot first.
                warn!(room = %self.ctx.room_id, operation = op_id, mode = %self.mode, "primary task cancelled from outside, restarting");
                self.start_primary();
            }
            Some(ControlError::Cancelled) => {
                debug!(room = %self.ctx.room_id, operation = op_id, ?slot, "task cancelled")
            }
            Some(ControlError::Configuration(detail)) => {
                error!(room = %self.ctx.room_id, ?slot, %detail, "task refused to start");
                self.ctx.notify(Notice::ConfigurationError { detail });
            }
            Some(e) if e.is_operator_facing() => {
                error!(room = %self.ctx.room_id, ?slot, "task failed: {e}");
                // Primary loops and calibrations report their own failures.
                if slot == Slot::Operation {
                    self.ctx.notify(Notice::OperationFailed {
                        kind: finished.op.kind(),
                        reason: e.to_string(),
                    });
                }
            }
            Some(e) => warn!(room = %self.ctx.room_id, ?slot, "task ended: {e}"),
        }

        if slot == Slot::Calibration {
            self.start_primary();
        }
    }

    async fn stop(&mut self, slot: Slot) {
        let task = match slot {
            Slot::Primary => self.primary.take(),
            Slot::Calibration => self.calibration.take(),
            Slot::Operation => None,
        };
        if let Some(task) = task {
            self.stop_task(task).await;
        }
    }

    /// Soft cancel, then hard cleanup if the task overruns the grace period.
    async fn stop_task(&self, mut task: RunningTask) {
        let op_id = task.op.id();
        task.op.cancel();
        let grace = self.ctx.steering.cancel_grace();
        if tokio::time::timeout(grace, &mut task.handle).await.is_err() {
            warn!(room = %self.ctx.room_id, operation = op_id, "task ignored cancellation, aborting");
            task.handle.abort();
            let devices = self.ctx.arbitrator.emergency_cleanup();
            self.ctx.notify(Notice::EmergencyStop {
                reason: format!(
                    "operation {op_id} did not stop within {}s, forced off: [{}]",
                    grace.as_secs(),
                    devices.join(", ")
                ),
            });
        }
        self.ctx.arbitrator.release_operation(op_id);
    }

    async fn shutdown(&mut self) {
        self.stop(Slot::Calibration).await;
        self.stop(Slot::Primary).await;
        self.stop_operations().await;
        if let Err(e) = self.ctx.arbitrator.cancel_all().await {
            warn!(room = %self.ctx.room_id, "shutdown cleanup: {e}");
        }
        self.ctx.arbitrator.force_off(&self.ctx.devices);
    }
}

fn take_if(slot: &mut Option<RunningTask>, op_id: u64) -> Option<RunningTask> {
    if slot.as_ref().is_some_and(|t| t.op.id() == op_id) {
        slot.take()
    } else {
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
