//! Recent Rooms
//!
//! Rooms this client hosted or joined, kept so a guest can find its way back
//! to a host after the process restarts. Stored either in memory or as a JSON
//! array on disk, written through a temporary file and a rename.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use serde::{Serialize, Deserialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::room_code::RoomCode;
use crate::directory::DirectoryError;
use crate::network::session::Role;

/// Entries kept; the oldest are dropped first.
pub const MAX_RECENT: usize = 20;

/// One remembered room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentRoom {
    /// Room code.
    pub room_code: RoomCode,
    /// Whether this client hosted or joined.
    pub role: Role,
    /// Endpoint the host accepts guests on.
    pub endpoint: String,
    /// Host's display name, when known.
    #[serde(default)]
    pub display_name: String,
    /// When the entry was written, epoch milliseconds.
    #[serde(default)]
    pub joined_at: i64,
}

/// Per-client list of hosted and joined rooms, newest last.
#[derive(Debug)]
pub struct RecentRooms {
    path: Option<PathBuf>,
    entries: Mutex<Vec<RecentRoom>>,
}

impl RecentRooms {
    /// Keep the list in memory only.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Persist to `path` when given, otherwise keep in memory.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Every entry, oldest first.
    pub async fn list(&self) -> Result<Vec<RecentRoom>, DirectoryError> {
        let mut entries = self.entries.lock().await;
        self.reload(&mut entries).await?;
        Ok(entries.clone())
    }

    /// Entry for `code`.
    pub async fn get(&self, code: &RoomCode) -> Result<Option<RecentRoom>, DirectoryError> {
        Ok(self.list().await?.into_iter().find(|r| &r.room_code == code))
    }

    /// Add or replace the entry for `room.room_code`.
    pub async fn remember(&self, room: RecentRoom) -> Result<(), DirectoryError> {
        let mut entries = self.entries.lock().await;
        self.reload(&mut entries).await?;
        entries.retain(|r| r.room_code != room.room_code);
        entries.push(room);
        if entries.len() > MAX_RECENT {
            let excess = entries.len() - MAX_RECENT;
            entries.drain(..excess);
        }
        self.store(&entries).await
    }

    /// Drop the entry for `code`. Forgetting an unknown room succeeds.
    pub async fn forget(&self, code: &RoomCode) -> Result<(), DirectoryError> {
        let mut entries = self.entries.lock().await;
        self.reload(&mut entries).await?;
        let before = entries.len();
        entries.retain(|r| &r.room_code != code);
        if entries.len() == before {
            return Ok(());
        }
        self.store(&entries).await
    }

    async fn reload(&self, entries: &mut Vec<RecentRoom>) -> Result<(), DirectoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        *entries = match tokio::fs::read_to_string(path).await {
            Ok(text) => parse_entries(&text),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(())
    }

    async fn store(&self, entries: &[RecentRoom]) -> Result<(), DirectoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %path.display(), entries = entries.len(), "Recent rooms written");
        Ok(())
    }
}

fn parse_entries(text: &str) -> Vec<RecentRoom> {
    match serde_json::from_str::<Vec<serde_json::Value>>(text) {
        Ok(rows) => rows
            .into_iter()
            .filter_map(|row| serde_json::from_value(row).ok())
            .collect(),
        Err(e) => {
            debug!("Recent rooms file unreadable ({}), starting empty", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(code: &str, role: Role) -> RecentRoom {
        RecentRoom {
            room_code: RoomCode::parse(code).unwrap(),
            role,
            endpoint: "ws://127.0.0.1:9".into(),
            display_name: "friendly".into(),
            joined_at: 1_000,
        }
    }

    #[tokio::test]
    async fn test_remember_replaces_same_code() {
        let recent = RecentRooms::in_memory();
        recent.remember(entry("ABC123", Role::Host)).await.unwrap();
        recent.remember(entry("XYZ789", Role::Guest)).await.unwrap();
        recent.remember(entry("ABC123", Role::Guest)).await.unwrap();

        let list = recent.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].room_code.as_str(), "ABC123");
        assert_eq!(list[1].role, Role::Guest);

        recent.forget(&RoomCode::parse("ABC123").unwrap()).await.unwrap();
        recent.forget(&RoomCode::parse("ABC123").unwrap()).await.unwrap();
        assert_eq!(recent.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oldest_entries_dropped() {
        let recent = RecentRooms::in_memory();
        for i in 0..(MAX_RECENT + 3) {
            recent.remember(entry(&format!("ROOM{i:02}"), Role::Guest)).await.unwrap();
        }
        let list = recent.list().await.unwrap();
        assert_eq!(list.len(), MAX_RECENT);
        assert_eq!(list[0].room_code.as_str(), "ROOM03");
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("recent.json");

        let first = RecentRooms::new(Some(path.clone()));
        first.remember(entry("ABC123", Role::Guest)).await.unwrap();

        let second = RecentRooms::new(Some(path.clone()));
        let found = second.get(&RoomCode::parse("abc123").unwrap()).await.unwrap().unwrap();
        assert_eq!(found.role, Role::Guest);
        assert_eq!(found.endpoint, "ws://127.0.0.1:9");
        assert_eq!(second.path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_bad_rows_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recent.json");
        tokio::fs::write(
            &path,
            r#"[{"roomCode":"ABC123","role":"guest","endpoint":"ws://h:1"},{"roomCode":"ABC124"},7]"#,
        )
        .await
        .unwrap();

        let recent = RecentRooms::new(Some(path.clone()));
        assert_eq!(recent.list().await.unwrap().len(), 1);

        tokio::fs::write(&path, "garbage").await.unwrap();
        assert!(recent.list().await.unwrap().is_empty());
    }
}
