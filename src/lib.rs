//! # Peer Chess
//!
//! Two-party chess sessions without a server-held source of truth: rooms are
//! discovered through a shared directory, the two peers talk over a direct
//! WebSocket channel, and each side keeps the board in sync by exchanging the
//! full state after every move.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        PEER CHESS                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── board.rs    - Board, moves, structural rules, replay    │
//! │  ├── hash.rs     - Board digests                             │
//! │  ├── room_code.rs- Shareable room codes                      │
//! │  └── clock.rs    - Wall clock and manual test clock          │
//! │                                                              │
//! │  directory/      - Room discovery                            │
//! │  ├── record.rs   - Room records and lenient parsing          │
//! │  ├── memory.rs   - In-process backend                        │
//! │  └── file.rs     - Shared JSON file backend                  │
//! │                                                              │
//! │  network/        - Peers (non-deterministic)                 │
//! │  ├── protocol.rs - Peer message envelope                     │
//! │  ├── connection.rs - Direct channel, capacity one            │
//! │  ├── registrar.rs  - Hosting, heartbeat, expiry, discovery   │
//! │  ├── recent.rs   - Rooms this client hosted or joined        │
//! │  ├── sync.rs     - Turn gate and last-writer-wins state      │
//! │  └── session.rs  - Lobby, session lifecycle, notifications   │
//! │                                                              │
//! │  config.rs       - Client configuration                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! `BoardState::cells` is always the fold of `history` over the initial
//! position. Only the side to move can change the board, a refused move is
//! never sent, and an inbound board replaces the local one wholesale, so the
//! two peers converge as soon as one message gets through.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod directory;
pub mod network;

// Re-export commonly used types
pub use config::{ClientConfig, ConfigError};
pub use core::board::{BoardState, Coord, MoveRecord, MoveRejection, Side};
pub use core::room_code::RoomCode;
pub use directory::{Directory, DirectoryBackend, RoomRecord, RoomStatus};
pub use network::{ConnectionState, Lobby, MoveOutcome, Notification, Role, Session, SessionError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
