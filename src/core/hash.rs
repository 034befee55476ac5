//! Board State Hashing
//!
//! Deterministic hashing of the synchronized board for:
//! - Duplicate delivery detection
//! - Cross-peer convergence checks
//! - Log correlation

use sha2::{Sha256, Digest};

use super::board::{Coord, Side};

/// Hash output type (256 bits / 32 bytes)
pub type BoardDigest = [u8; 32];

/// Deterministic hasher for board state.
///
/// Wraps SHA-256 with helpers for board types.
/// Order of updates is critical for determinism.
pub struct BoardHasher {
    hasher: Sha256,
}

impl BoardHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for a board state.
    pub fn for_board_state() -> Self {
        Self::new(b"PEER_CHESS_BOARD_V1")
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a side.
    #[inline]
    pub fn update_side(&mut self, side: Side) {
        self.update_u8(match side {
            Side::White => 0,
            Side::Black => 1,
        });
    }

    /// Update with a coordinate.
    #[inline]
    pub fn update_coord(&mut self, coord: Coord) {
        self.update_u8(coord.row() as u8);
        self.update_u8(coord.col() as u8);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> BoardDigest {
        self.hasher.finalize().into()
    }
}

/// Short hex prefix of a digest, for logs.
pub fn short_hex(digest: &BoardDigest) -> String {
    hex::encode(&digest[..4])
}
