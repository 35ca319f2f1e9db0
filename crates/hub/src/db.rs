use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::persist::IrrigationRecord;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IrrigationLogRow {
    pub ts_start: i64,
    pub kind: String,
    pub devices: String,
    pub duration_sec: i64,
    pub reason: String,
    pub cancelled: bool,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/cropsteer/hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database, so pin the
        // pool to a single long-lived connection there.
        let in_memory = db_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Room state
    // ----------------------------

    /// All persisted `(room_id, state_json)` pairs.
    pub async fn load_room_states(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT room_id, state_json FROM room_state ORDER BY room_id")
            .fetch_all(&self.pool)
            .await
            .context("load_room_states failed")?;

        rows.into_iter()
            .map(|r| Ok((r.try_get("room_id")?, r.try_get("state_json")?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("load_room_states: bad row")
    }

    pub async fn save_room_state(&self, room_id: &str, state_json: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO room_state (room_id, state_json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(room_id) DO UPDATE SET
              state_json=excluded.state_json,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(room_id)
        .bind(state_json)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("save_room_state failed for room '{room_id}'"))?;
        Ok(())
    }

    // ----------------------------
    // Irrigation log
    // ----------------------------

    pub async fn insert_irrigation(&self, r: &IrrigationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO irrigation_log
              (ts_start, room_id, kind, devices, duration_sec, reason, cancelled)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.started_at)
        .bind(&r.room_id)
        .bind(r.kind.as_str())
        .bind(r.devices.join(","))
        .bind(r.duration_sec)
        .bind(&r.reason)
        .bind(r.cancelled)
        .execute(&self.pool)
        .await
        .context("insert_irrigation failed")?;
        Ok(())
    }

    /// Most recent irrigations for a room, newest first.
    pub async fn recent_irrigations(&self, room_id: &str, limit: i64) -> Result<Vec<IrrigationLogRow>> {
        let rows = sqlx::query(
            r#"
            SELECT ts_start, kind, devices, duration_sec, reason, cancelled
            FROM irrigation_log
            WHERE room_id = ?
            ORDER BY ts_start DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_irrigations failed")?;

        rows.into_iter()
            .map(|r| {
                Ok(IrrigationLogRow {
                    ts_start: r.try_get("ts_start")?,
                    kind: r.try_get("kind")?,
                    devices: r.try_get("devices")?,
                    duration_sec: r.try_get("duration_sec")?,
                    reason: r.try_get("reason")?,
                    cancelled: r.try_get("cancelled")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("recent_irrigations: bad row")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
