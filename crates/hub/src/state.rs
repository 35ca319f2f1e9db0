use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::notice::RoomNotice;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Process-level view for the status API. Room state lives with the rooms.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Notice,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn record_notice(&mut self, notice: &RoomNotice) {
        self.push_event(Some(notice.room.clone()), EventKind::Notice, notice.summary());
    }

    /// Record an accepted operator or subsystem command.
    pub fn record_command(&mut self, room: &str, detail: String) {
        self.push_event(Some(room.to_string()), EventKind::Command, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(None, EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(None, EventKind::System, detail);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Newest first.
    pub fn recent_events(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }

    fn push_event(&mut self, room: Option<String>, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            room,
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
