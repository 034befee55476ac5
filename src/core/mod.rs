//! Core Primitives
//!
//! I/O-free building blocks shared by every layer.
//! Everything here is deterministic except the system clock.

pub mod board;
pub mod clock;
pub mod hash;
pub mod room_code;

pub use board::{BoardState, Coord, MoveRecord, MoveRejection, Piece, PieceKind, Side, Square};
pub use clock::{Clock, ManualClock, SystemClock};
pub use hash::BoardDigest;
pub use room_code::{RoomCode, RoomCodeError};
