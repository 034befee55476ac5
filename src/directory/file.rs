//! File-Backed Directory
//!
//! One JSON array on disk shared by every client on the machine. Each
//! operation is a read-modify-write of the whole file; the write goes to a
//! temporary file that is renamed over the original. Writers in different
//! processes still race and the last rename wins.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::room_code::RoomCode;
use super::{Directory, DirectoryError, RoomPatch, RoomPredicate, RoomRecord};

/// Directory stored in a JSON file.
#[derive(Debug)]
pub struct FileDirectory {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileDirectory {
    /// Use `path` as the room list. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Location of the room list.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_rows(&self) -> Result<Vec<RoomRecord>, DirectoryError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(RoomRecord::parse_rows(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_rows(&self, rows: &[RoomRecord]) -> Result<(), DirectoryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(rows)?;
        let tmp = self
            .path
            .with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %self.path.display(), rows = rows.len(), "Room list written");
        Ok(())
    }
}

#[async_trait]
impl Directory for FileDirectory {
    async fn put(&self, record: RoomRecord) -> Result<(), DirectoryError> {
        let _guard = self.lock.lock().await;
        let mut rows = self.read_rows().await?;
        rows.retain(|r| r.room_code != record.room_code);
        rows.push(record);
        self.write_rows(&rows).await
    }

    async fn get(&self, code: &RoomCode) -> Result<Option<RoomRecord>, DirectoryError> {
        let rows = self.read_rows().await?;
        Ok(rows.into_iter().find(|r| &r.room_code == code))
    }

    async fn list_where(&self, predicate: RoomPredicate<'_>) -> Result<Vec<RoomRecord>, DirectoryError> {
        let rows = self.read_rows().await?;
        Ok(rows.into_iter().filter(|r| predicate(r)).collect())
    }

    async fn delete(&self, code: &RoomCode) -> Result<(), DirectoryError> {
        let _guard = self.lock.lock().await;
        let mut rows = self.read_rows().await?;
        let before = rows.len();
        rows.retain(|r| &r.room_code != code);
        if rows.len() == before {
            return Ok(());
        }
        self.write_rows(&rows).await
    }

    async fn patch(&self, code: &RoomCode, patch: RoomPatch) -> Result<bool, DirectoryError> {
        let _guard = self.lock.lock().await;
        let mut rows = self.read_rows().await?;
        match rows.iter_mut().find(|r| &r.room_code == code) {
            Some(record) => record.apply_patch(&patch),
            None => return Ok(false),
        }
        self.write_rows(&rows).await?;
        Ok(true)
    }

    async fn clear(&self) -> Result<(), DirectoryError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
