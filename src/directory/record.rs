//! Room Records
//!
//! The JSON value stored under each room code. Readers are lenient: optional
//! fields fall back to defaults and rows that cannot be understood are skipped
//! rather than failing the whole listing.

use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::core::room_code::RoomCode;

/// Whether a room is open for joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    /// Host is alone and accepting a guest.
    Waiting,
    /// A guest is attached.
    Playing,
}

/// One advertised room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    /// Directory key.
    pub room_code: RoomCode,
    /// Cosmetic name chosen by the host.
    #[serde(default)]
    pub display_name: String,
    /// Cosmetic colour chosen by the host.
    #[serde(default)]
    pub accent_color: String,
    /// Waiting or playing.
    pub status: RoomStatus,
    /// Last heartbeat, epoch milliseconds.
    pub last_seen: i64,
    /// Creation time, epoch milliseconds.
    #[serde(default)]
    pub created_at: i64,
    /// WebSocket URL the host accepts guests on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl RoomRecord {
    /// A fresh `Waiting` record stamped at `now_ms`.
    pub fn waiting(
        room_code: RoomCode,
        display_name: impl Into<String>,
        accent_color: impl Into<String>,
        endpoint: Option<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            room_code,
            display_name: display_name.into(),
            accent_color: accent_color.into(),
            status: RoomStatus::Waiting,
            last_seen: now_ms,
            created_at: now_ms,
            endpoint,
        }
    }

    /// `true` while the last heartbeat is younger than `window_ms`. A
    /// heartbeat stamped more than a window in the future is not live either.
    pub fn is_live(&self, now_ms: i64, window_ms: i64) -> bool {
        let elapsed = now_ms.saturating_sub(self.last_seen);
        elapsed < window_ms && elapsed > window_ms.saturating_neg()
    }

    /// Milliseconds since creation.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.created_at)
    }

    /// Overwrite the fields present in `patch`.
    pub fn apply_patch(&mut self, patch: &RoomPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(last_seen) = patch.last_seen {
            self.last_seen = last_seen;
        }
    }

    /// Parse one row, `None` when required fields are missing or malformed.
    pub fn from_value_lenient(value: serde_json::Value) -> Option<Self> {
        match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Skipping malformed room record: {}", e);
                None
            }
        }
    }

    /// Parse a JSON array of rows, skipping the ones that do not parse.
    pub fn parse_rows(text: &str) -> Vec<Self> {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::Array(rows)) => {
                rows.into_iter().filter_map(Self::from_value_lenient).collect()
            }
            Ok(_) => {
                debug!("Room list is not an array, treating as empty");
                Vec::new()
            }
            Err(e) => {
                debug!("Room list is not valid JSON ({}), treating as empty", e);
                Vec::new()
            }
        }
    }
}

/// Partial update. Each present field group overwrites, last write wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPatch {
    /// New status.
    pub status: Option<RoomStatus>,
    /// New heartbeat time.
    pub last_seen: Option<i64>,
}

impl RoomPatch {
    /// Heartbeat patch: refresh `lastSeen` and restate the status.
    pub fn heartbeat(status: RoomStatus, now_ms: i64) -> Self {
        Self {
            status: Some(status),
            last_seen: Some(now_ms),
        }
    }
}
