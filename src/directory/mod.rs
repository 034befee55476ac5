//! Directory Service
//!
//! Shared, eventually-consistent registry of open rooms. Used only for
//! discovery; gameplay traffic never touches it.
//!
//! Operations are not transactional: concurrent patches race and the last
//! write wins per field group. Every failure is reported as
//! [`DirectoryError`] and callers treat it as "temporarily unavailable".

pub mod file;
pub mod memory;
pub mod record;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use async_trait::async_trait;
use thiserror::Error;

use crate::core::room_code::RoomCode;

pub use file::FileDirectory;
pub use memory::MemoryDirectory;
pub use record::{RoomPatch, RoomRecord, RoomStatus};

/// Filter passed to [`Directory::list_where`].
pub type RoomPredicate<'a> = &'a (dyn Fn(&RoomRecord) -> bool + Send + Sync);

/// Directory failures.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Backend could not be reached or refused the request.
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    /// Backing storage I/O failed.
    #[error("Directory I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be encoded.
    #[error("Directory serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value registry of rooms keyed by room code.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Insert or replace the record stored under `record.room_code`.
    async fn put(&self, record: RoomRecord) -> Result<(), DirectoryError>;

    /// Fetch one record.
    async fn get(&self, code: &RoomCode) -> Result<Option<RoomRecord>, DirectoryError>;

    /// Every record matching `predicate`.
    async fn list_where(&self, predicate: RoomPredicate<'_>) -> Result<Vec<RoomRecord>, DirectoryError>;

    /// Remove a record. Deleting an absent record succeeds.
    async fn delete(&self, code: &RoomCode) -> Result<(), DirectoryError>;

    /// Overwrite the fields present in `patch`. Returns `false` when the
    /// record does not exist; a patch never creates a record.
    async fn patch(&self, code: &RoomCode, patch: RoomPatch) -> Result<bool, DirectoryError>;

    /// Remove every record.
    async fn clear(&self) -> Result<(), DirectoryError>;
}

/// Which backend a client uses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DirectoryBackend {
    /// In-process map, shared only by clients in the same process.
    #[default]
    Memory,
    /// JSON file shared by every client that can read the path.
    File(PathBuf),
}

impl DirectoryBackend {
    /// Construct the backend.
    pub fn open(&self) -> Arc<dyn Directory> {
        match self {
            DirectoryBackend::Memory => Arc::new(MemoryDirectory::new()),
            DirectoryBackend::File(path) => Arc::new(FileDirectory::new(path.clone())),
        }
    }
}

impl FromStr for DirectoryBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("memory") {
            return Ok(DirectoryBackend::Memory);
        }
        match s.strip_prefix("file:") {
            Some(path) if !path.is_empty() => Ok(DirectoryBackend::File(PathBuf::from(path))),
            _ => Err(format!("unknown directory backend '{s}', expected 'memory' or 'file:<path>'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("memory".parse::<DirectoryBackend>(), Ok(DirectoryBackend::Memory));
        assert_eq!(
            "file:/tmp/rooms.json".parse::<DirectoryBackend>(),
            Ok(DirectoryBackend::File(PathBuf::from("/tmp/rooms.json")))
        );
        assert!("file:".parse::<DirectoryBackend>().is_err());
        assert!("redis".parse::<DirectoryBackend>().is_err());
    }
}
