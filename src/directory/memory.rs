//! In-Process Directory
//!
//! Rooms held in a `BTreeMap` for sorted iteration. Clones share storage, so
//! several clients in one process discover each other through it.

use std::collections::BTreeMap;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::room_code::RoomCode;
use super::{Directory, DirectoryError, RoomPatch, RoomPredicate, RoomRecord};

/// Shared in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    rooms: Arc<RwLock<BTreeMap<RoomCode, RoomRecord>>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, live or not.
    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// `true` when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn put(&self, record: RoomRecord) -> Result<(), DirectoryError> {
        let mut rooms = self.rooms.write().await;
        rooms.insert(record.room_code.clone(), record);
        Ok(())
    }

    async fn get(&self, code: &RoomCode) -> Result<Option<RoomRecord>, DirectoryError> {
        let rooms = self.rooms.read().await;
        Ok(rooms.get(code).cloned())
    }

    async fn list_where(&self, predicate: RoomPredicate<'_>) -> Result<Vec<RoomRecord>, DirectoryError> {
        let rooms = self.rooms.read().await;
        Ok(rooms.values().filter(|&r| predicate(r)).cloned().collect())
    }

    async fn delete(&self, code: &RoomCode) -> Result<(), DirectoryError> {
        let mut rooms = self.rooms.write().await;
        rooms.remove(code);
        Ok(())
    }

    async fn patch(&self, code: &RoomCode, patch: RoomPatch) -> Result<bool, DirectoryError> {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(code) {
            Some(record) => {
                record.apply_patch(&patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<(), DirectoryError> {
        self.rooms.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RoomStatus;

    fn record(code: &str, now: i64) -> RoomRecord {
        RoomRecord::waiting(RoomCode::parse(code).unwrap(), "match", "blue", None, now)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = MemoryDirectory::new();
        let rec = record("ABC123", 10);
        dir.put(rec.clone()).await.unwrap();

        assert_eq!(dir.get(&rec.room_code).await.unwrap(), Some(rec.clone()));

        dir.delete(&rec.room_code).await.unwrap();
        assert_eq!(dir.get(&rec.room_code).await.unwrap(), None);

        // Idempotent
        dir.delete(&rec.room_code).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_where_filters() {
        let dir = MemoryDirectory::new();
        dir.put(record("AAAAA1", 10)).await.unwrap();
        let mut playing = record("AAAAA2", 10);
        playing.status = RoomStatus::Playing;
        dir.put(playing).await.unwrap();

        let waiting = dir.list_where(&|r| r.status == RoomStatus::Waiting).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].room_code.as_str(), "AAAAA1");
    }

    #[tokio::test]
    async fn test_patch_missing_returns_false() {
        let dir = MemoryDirectory::new();
        let code = RoomCode::parse("ABC123").unwrap();
        let applied = dir.patch(&code, RoomPatch::heartbeat(RoomStatus::Waiting, 5)).await.unwrap();
        assert!(!applied);
        assert!(dir.is_empty().await);
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let a = MemoryDirectory::new();
        let b = a.clone();
        a.put(record("ABC123", 1)).await.unwrap();
        assert_eq!(b.len().await, 1);

        b.clear().await.unwrap();
        assert!(a.is_empty().await);
    }
}
