//! Network Layer
//!
//! Peer transport, room advertisement and board synchronization.
//! This layer is **non-deterministic**; board rules live in `core/`.

pub mod connection;
pub mod protocol;
pub mod recent;
pub mod registrar;
pub mod session;
pub mod sync;

pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState,
};
pub use protocol::{PeerMessage, RejectReason};
pub use recent::{RecentRoom, RecentRooms};
pub use registrar::{JoinTarget, RegistrarConfig, SessionRegistrar, SessionToken};
pub use session::{Lobby, Notification, Role, Session, SessionError};
pub use sync::{MoveOutcome, PeerSender, RemoteApply, StateSynchronizer};
