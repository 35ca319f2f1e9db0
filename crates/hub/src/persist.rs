//! Persisted per-room state as the control core sees it. The core only
//! talks to [`StateStore`]; the SQLite-backed [`DbStore`] keeps an in-memory
//! cache and writes behind through a background task so room tasks never
//! wait on disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::db::Db;
use crate::error::{ControlError, ControlResult};
use crate::model::{IrrigationMode, OperationKind, Phase};
use crate::preset::CalibrationOverrides;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    #[serde(default)]
    pub mode: IrrigationMode,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub start_night_vwc: Option<f64>,
    #[serde(default)]
    pub ec_target: Option<f64>,
    #[serde(default)]
    pub overrides: CalibrationOverrides,
    #[serde(default)]
    pub p1_shots: u32,
    #[serde(default)]
    pub manual_shots: u32,
    /// Unix seconds.
    #[serde(default)]
    pub last_irrigation: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationRecord {
    pub room_id: String,
    pub kind: OperationKind,
    pub devices: Vec<String>,
    /// Unix seconds.
    pub started_at: i64,
    pub duration_sec: i64,
    pub reason: String,
    pub cancelled: bool,
}

pub trait StateStore: Send + Sync {
    /// Missing rooms load as the default snapshot.
    fn load(&self, room: &str) -> RoomSnapshot;

    fn save(&self, room: &str, snapshot: &RoomSnapshot) -> ControlResult<()>;

    fn log_irrigation(&self, record: IrrigationRecord) -> ControlResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<String, RoomSnapshot>>,
    log: Mutex<Vec<IrrigationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn irrigations(&self) -> Vec<IrrigationRecord> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, room: &str) -> RoomSnapshot {
        self.rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    fn save(&self, room: &str, snapshot: &RoomSnapshot) -> ControlResult<()> {
        self.rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(room.to_string(), snapshot.clone());
        Ok(())
    }

    fn log_irrigation(&self, record: IrrigationRecord) -> ControlResult<()> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite write-behind store
// ---------------------------------------------------------------------------

enum StoreWrite {
    Snapshot { room: String, json: String },
    Irrigation(IrrigationRecord),
}

pub struct DbStore {
    cache: Mutex<HashMap<String, RoomSnapshot>>,
    tx: mpsc::UnboundedSender<StoreWrite>,
}

impl DbStore {
    /// Load every persisted room and start the writer task. The writer exits
    /// once the store is dropped and the queue is drained.
    pub async fn open(db: Db) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let mut cache = HashMap::new();
        for (room, json) in db.load_room_states().await? {
            match serde_json::from_str::<RoomSnapshot>(&json) {
                Ok(snapshot) => {
                    cache.insert(room, snapshot);
                }
                Err(e) => error!(room = %room, "discarding unreadable room state: {e}"),
            }
        }
        info!(rooms = cache.len(), "room state loaded");

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_behind(db, rx));

        Ok((
            Self {
                cache: Mutex::new(cache),
                tx,
            },
            writer,
        ))
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, RoomSnapshot>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, write: StoreWrite) -> ControlResult<()> {
        self.tx
            .send(write)
            .map_err(|_| ControlError::Store("state writer has stopped".to_string()))
    }
}

impl StateStore for DbStore {
    fn load(&self, room: &str) -> RoomSnapshot {
        self.cache().get(room).cloned().unwrap_or_default()
    }

    fn save(&self, room: &str, snapshot: &RoomSnapshot) -> ControlResult<()> {
        let json = serde_json::to_string(snapshot).map_err(|e| ControlError::Store(e.to_string()))?;
        self.cache().insert(room.to_string(), snapshot.clone());
        self.enqueue(StoreWrite::Snapshot {
            room: room.to_string(),
            json,
        })
    }

    fn log_irrigation(&self, record: IrrigationRecord) -> ControlResult<()> {
        self.enqueue(StoreWrite::Irrigation(record))
    }
}

async fn write_behind(db: Db, mut rx: mpsc::UnboundedReceiver<StoreWrite>) {
    while let Some(write) = rx.recv().await {
        let result = match &write {
            StoreWrite::Snapshot { room, json } => db.save_room_state(room, json).await,
            StoreWrite::Irrigation(record) => db.insert_irrigation(record).await,
        };
        // Best-effort: a failed write is logged, the next snapshot supersedes it.
        if let Err(e) = result {
            error!("db write failed: {e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_defaults_unknown_rooms() {
        let store = MemoryStore::new();
        assert_eq!(store.load("r1"), RoomSnapshot::default());
        let snap = RoomSnapshot {
            phase: Phase::P2Maintenance,
            ..Default::default()
        };
        store.save("r1", &snap).unwrap();
        assert_eq!(store.load("r1").phase, Phase::P2Maintenance);
    }

    #[test]
    fn snapshot_tolerates_missing_fields() {
        let snap: RoomSnapshot = serde_json::from_str(r#"{"phase":"p3"}"#).unwrap();
        assert_eq!(snap.phase, Phase::P3NightDryback);
        assert_eq!(snap.mode, IrrigationMode::Disabled);
        assert!(snap.overrides.is_empty());
    }

    #[tokio::test]
    async fn db_store_round_trips_through_sqlite() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let mut snap = RoomSnapshot {
            mode: IrrigationMode::Automatic,
            phase: Phase::P3NightDryback,
            start_night_vwc: Some(61.5),
            ..Default::default()
        };
        snap.overrides.set_max(Phase::P1Saturation, 66.2);

        {
            let (store, writer) = DbStore::open(db.clone()).await.unwrap();
            store.save("r1", &snap).unwrap();
            assert_eq!(store.load("r1"), snap);
            drop(store);
            writer.await.unwrap();
        }

        let (reopened, _writer) = DbStore::open(db).await.unwrap();
        assert_eq!(reopened.load("r1"), snap);
    }
}
