//! Pump arbitration and the irrigation executor.
//!
//! Every physical pump device in a room is shared by several subsystems
//! (crop steering, hydro, plant watering, nutrient feeding, retrieval). The
//! [`PumpArbitrator`] owns the table of which operation currently drives
//! which device and is the only writer of that table. Before an operation
//! may switch a device on it goes through [`PumpArbitrator::acquire`], which
//! cancels incompatible holders and waits for them to switch off.
//!
//! ```text
//!  acquire(dev, op) ──▶ conflicting holder? ──no──▶ register ──▶ ON
//!                           │yes
//!                           ▼
//!                      cancel holder ──▶ holder releases (OFF + unregister)
//!                           │ grace exceeded
//!                           ▼
//!                      emergency cleanup (OFF everything, clear table)
//! ```

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::model::OperationKind;
use crate::notice::{Notice, Notifier};
use crate::persist::{IrrigationRecord, StateStore};

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A cancellable unit of pump work. Clones share the same cancellation token.
#[derive(Debug, Clone)]
pub struct Operation {
    id: u64,
    kind: OperationKind,
    token: CancellationToken,
}

impl Operation {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            token: CancellationToken::new(),
        }
    }

    /// A new operation of the same kind, cancelled along with `self` but
    /// cancellable on its own. Loops run each shot under a child so that
    /// preempting the shot leaves the loop running.
    pub fn child(&self) -> Self {
        Self {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            kind: self.kind,
            token: self.token.child_token(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Sleep unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> ControlResult<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ControlError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver seam
// ---------------------------------------------------------------------------

/// Pump on/off command channel. "off" must be idempotent.
pub trait PumpDriver: Send + Sync {
    fn set(&self, device: &str, on: bool) -> ControlResult<()>;
}

// ---------------------------------------------------------------------------
// Compatibility policy
// ---------------------------------------------------------------------------

/// Kinds that may share a device with an operation of `kind`.
pub fn compatible_kinds(kind: OperationKind) -> &'static [OperationKind] {
    use OperationKind::*;
    match kind {
        Retrieve => &[Hydro, Retrieve, CropSteering, PlantWatering, FeedNutrients],
        Hydro | CropSteering | PlantWatering | FeedNutrients => &[Retrieve],
    }
}

pub fn kinds_compatible(new: OperationKind, current: OperationKind) -> bool {
    compatible_kinds(new).contains(&current)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PumpRegistration {
    pub device_id: String,
    pub operation: Operation,
    pub started_at: OffsetDateTime,
}

/// Serializable view of a registration for the status API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationView {
    pub device_id: String,
    pub operation_id: u64,
    pub kind: OperationKind,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

type Registry = HashMap<String, Vec<PumpRegistration>>;

fn holds_any(reg: &Registry, op_id: u64) -> bool {
    reg.values()
        .any(|regs| regs.iter().any(|r| r.operation.id() == op_id))
}

/// Remove `op_id` from `device`. Returns `Some(idle)` when something was
/// removed, where `idle` means no other operation still holds the device.
fn remove_locked(reg: &mut Registry, device: &str, op_id: u64) -> Option<bool> {
    let regs = reg.get_mut(device)?;
    let before = regs.len();
    regs.retain(|r| r.operation.id() != op_id);
    if regs.len() == before {
        return None;
    }
    let idle = regs.is_empty();
    if idle {
        reg.remove(device);
    }
    Some(idle)
}

pub struct PumpArbitrator {
    room: String,
    driver: Arc<dyn PumpDriver>,
    grace: Duration,
    registry: Mutex<Registry>,
    changed: Notify,
    admission: tokio::sync::Mutex<()>,
}

impl PumpArbitrator {
    pub fn new(room: impl Into<String>, driver: Arc<dyn PumpDriver>, grace: Duration) -> Self {
        Self {
            room: room.into(),
            driver,
            grace,
            registry: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue an on/off command. Failed "off" commands are logged, never fatal.
    pub fn switch(&self, device: &str, on: bool) -> ControlResult<()> {
        match self.driver.set(device, on) {
            Ok(()) => {
                debug!(room = %self.room, device = %device, on, "pump command sent");
                Ok(())
            }
            Err(e) if !on => {
                error!(room = %self.room, device = %device, "pump OFF failed: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn register(&self, device: &str, op: &Operation) {
        {
            let mut reg = self.lock();
            let regs = reg.entry(device.to_string()).or_default();
            if !regs.iter().any(|r| r.operation.id() == op.id()) {
                regs.push(PumpRegistration {
                    device_id: device.to_string(),
                    operation: op.clone(),
                    started_at: OffsetDateTime::now_utc(),
                });
            }
        }
        self.changed.notify_waiters();
    }

    /// Drop `op`'s registration on `device` without touching the pump.
    /// Returns `true` when a registration was removed.
    pub fn unregister(&self, device: &str, op_id: u64) -> bool {
        let removed = remove_locked(&mut self.lock(), device, op_id).is_some();
        if removed {
            self.changed.notify_waiters();
        }
        removed
    }

    /// Unregister and switch the device off unless another operation still
    /// holds it. Both happen under the registry lock so a new holder cannot
    /// slip in between.
    pub fn release(&self, device: &str, op_id: u64) {
        {
            let mut reg = self.lock();
            let idle = match remove_locked(&mut reg, device, op_id) {
                Some(idle) => idle,
                // Already gone (forced cleanup); only a new holder keeps it on.
                None => !reg.contains_key(device),
            };
            if idle {
                let _ = self.switch(device, false);
            } else {
                debug!(room = %self.room, device = %device, "device still shared, leaving ON");
            }
        }
        self.changed.notify_waiters();
    }

    /// Release every device `op_id` still holds.
    pub fn release_operation(&self, op_id: u64) {
        let devices: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, regs)| regs.iter().any(|r| r.operation.id() == op_id))
            .map(|(d, _)| d.clone())
            .collect();
        for device in devices {
            warn!(room = %self.room, device = %device, operation = op_id, "releasing orphaned registration");
            self.release(&device, op_id);
        }
    }

    pub fn is_compatible(&self, device: &str, kind: OperationKind) -> bool {
        self.lock().get(device).map_or(true, |regs| {
            regs.iter()
                .all(|r| kinds_compatible(kind, r.operation.kind()))
        })
    }

    pub fn holds(&self, device: &str, op_id: u64) -> bool {
        self.lock()
            .get(device)
            .is_some_and(|regs| regs.iter().any(|r| r.operation.id() == op_id))
    }

    pub fn snapshot(&self) -> Vec<RegistrationView> {
        let mut views: Vec<RegistrationView> = self
            .lock()
            .values()
            .flatten()
            .map(|r| RegistrationView {
                device_id: r.device_id.clone(),
                operation_id: r.operation.id(),
                kind: r.operation.kind(),
                started_at: r.started_at,
            })
            .collect();
        views.sort_by(|a, b| {
            a.device_id
                .cmp(&b.device_id)
                .then(a.operation_id.cmp(&b.operation_id))
        });
        views
    }

    /// Wait (bounded by the grace period) until `done` holds for the registry.
    async fn settle(&self, done: impl Fn(&Registry) -> bool) -> bool {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                let finished = {
                    let reg = self.lock();
                    done(&reg)
                };
                if finished {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(self.grace, wait).await.is_ok()
    }

    /// Cancel every operation on `device` that is incompatible with `op`.
    /// Retrieval is never preempted. Returns once the victims have released
    /// their devices, or after forced cleanup if they overran the grace.
    pub async fn cancel_conflicting(&self, device: &str, op: &Operation) -> ControlResult<()> {
        let victims: Vec<Operation> = self
            .lock()
            .get(device)
            .into_iter()
            .flatten()
            .map(|r| &r.operation)
            .filter(|o| o.id() != op.id())
            .filter(|o| o.kind() != OperationKind::Retrieve)
            .filter(|o| !kinds_compatible(op.kind(), o.kind()))
            .cloned()
            .collect();

        for victim in victims {
            info!(
                room = %self.room,
                device = %device,
                victim = victim.id(),
                victim_kind = %victim.kind(),
                new_kind = %op.kind(),
                "cancelling conflicting pump operation"
            );
            victim.cancel();
            let id = victim.id();
            if !self.settle(|reg| !holds_any(reg, id)).await {
                warn!(room = %self.room, operation = id, "cancellation grace exceeded, forcing cleanup");
                self.emergency_cleanup();
                return Err(ControlError::CancellationFailure {
                    operation: id,
                    grace_ms: self.grace.as_millis(),
                });
            }
        }
        Ok(())
    }

    /// Arbitrate and register `op` on `device`. Admission is serialized so
    /// two operations cannot pass the compatibility check at the same time.
    pub async fn acquire(&self, device: &str, op: &Operation) -> ControlResult<()> {
        let _admission = self.admission.lock().await;
        if op.is_cancelled() {
            return Err(ControlError::Cancelled);
        }
        match self.cancel_conflicting(device, op).await {
            // Forced cleanup already switched everything off.
            Ok(()) | Err(ControlError::CancellationFailure { .. }) => {}
            Err(e) => return Err(e),
        }
        self.register(device, op);
        Ok(())
    }

    /// Cancel every tracked operation regardless of kind, for mode switches.
    pub async fn cancel_all(&self) -> ControlResult<()> {
        let ids: HashSet<u64> = {
            let reg = self.lock();
            reg.values()
                .flatten()
                .map(|r| {
                    r.operation.cancel();
                    r.operation.id()
                })
                .collect()
        };
        if ids.is_empty() {
            return Ok(());
        }

        info!(room = %self.room, operations = ids.len(), "cancelling all pump operations");
        if self.settle(|reg| !ids.iter().any(|id| holds_any(reg, *id))).await {
            return Ok(());
        }

        let stuck = {
            let reg = self.lock();
            ids.iter().copied().find(|id| holds_any(&reg, *id)).unwrap_or_default()
        };
        warn!(room = %self.room, operation = stuck, "cancellation grace exceeded, forcing cleanup");
        self.emergency_cleanup();
        Err(ControlError::CancellationFailure {
            operation: stuck,
            grace_ms: self.grace.as_millis(),
        })
    }

    /// Crude but safe: cancel every holder, force OFF on every registered
    /// device and clear the table. Returns the devices switched off.
    pub fn emergency_cleanup(&self) -> Vec<String> {
        let mut devices: Vec<String> = {
            let mut reg = self.lock();
            for r in reg.values().flatten() {
                r.operation.cancel();
            }
            let devices: Vec<String> = reg.keys().cloned().collect();
            for device in &devices {
                let _ = self.switch(device, false);
            }
            reg.clear();
            devices
        };
        self.changed.notify_waiters();
        devices.sort();
        if !devices.is_empty() {
            warn!(room = %self.room, ?devices, "emergency cleanup forced pumps off");
        }
        devices
    }

    /// Issue OFF to `devices` whether or not anything holds them.
    pub fn force_off(&self, devices: &[String]) {
        for device in devices {
            let _ = self.switch(device, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Irrigation executor
// ---------------------------------------------------------------------------

/// Releases every acquired device when dropped, so an aborted or cancelled
/// shot never leaves a pump running or a registration behind.
struct ShotGuard<'a> {
    arbitrator: &'a PumpArbitrator,
    op_id: u64,
    devices: Vec<String>,
}

impl Drop for ShotGuard<'_> {
    fn drop(&mut self) {
        for device in &self.devices {
            self.arbitrator.release(device, self.op_id);
        }
    }
}

#[derive(Clone)]
pub struct IrrigationExecutor {
    room: String,
    arbitrator: Arc<PumpArbitrator>,
    notifier: Notifier,
    store: Arc<dyn StateStore>,
}

impl IrrigationExecutor {
    pub fn new(
        room: impl Into<String>,
        arbitrator: Arc<PumpArbitrator>,
        notifier: Notifier,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            room: room.into(),
            arbitrator,
            notifier,
            store,
        }
    }

    /// Run `devices` for `duration` on behalf of `op`:
    /// acquire → ON → wait → OFF → unregister. OFF is issued on every exit
    /// path, including cancellation mid-wait.
    pub async fn irrigate(
        &self,
        op: &Operation,
        devices: &[String],
        duration: Duration,
        reason: &str,
    ) -> ControlResult<()> {
        if devices.is_empty() {
            return Err(ControlError::Configuration(
                "no valid pump devices for irrigation".to_string(),
            ));
        }
        if duration.is_zero() {
            return Err(ControlError::Configuration(
                "irrigation duration must be positive".to_string(),
            ));
        }

        let mut guard = ShotGuard {
            arbitrator: &self.arbitrator,
            op_id: op.id(),
            devices: Vec::with_capacity(devices.len()),
        };
        for device in devices {
            self.arbitrator.acquire(device, op).await?;
            guard.devices.push(device.clone());
        }
        if op.is_cancelled() {
            return Err(ControlError::Cancelled);
        }
        for device in devices {
            self.arbitrator.switch(device, true)?;
        }

        let started_at = OffsetDateTime::now_utc();
        info!(
            room = %self.room,
            kind = %op.kind(),
            ?devices,
            duration_sec = duration.as_secs(),
            reason,
            "irrigation started"
        );
        self.notifier.emit(
            &self.room,
            Notice::IrrigationStarted {
                kind: op.kind(),
                devices: devices.to_vec(),
                duration_sec: duration.as_secs(),
                reason: reason.to_string(),
            },
        );

        let outcome = op.sleep(duration).await;
        drop(guard);

        let cancelled = outcome.is_err();
        info!(room = %self.room, kind = %op.kind(), cancelled, "irrigation stopped");
        self.notifier.emit(
            &self.room,
            Notice::IrrigationStopped {
                kind: op.kind(),
                devices: devices.to_vec(),
                cancelled,
            },
        );
        if let Err(e) = self.store.log_irrigation(IrrigationRecord {
            room_id: self.room.clone(),
            kind: op.kind(),
            devices: devices.to_vec(),
            started_at: started_at.unix_timestamp(),
            duration_sec: duration.as_secs() as i64,
            reason: reason.to_string(),
            cancelled,
        }) {
            warn!(room = %self.room, "failed to log irrigation: {e}");
        }

        outcome
    }
}

// ===========================================================================
// Tests
// ===========================================================================
