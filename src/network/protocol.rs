//! Protocol Messages
//!
//! Wire format exchanged between the two peers over the WebSocket channel.
//! All messages are JSON text frames tagged by `kind`.
//!
//! Gameplay only ever carries the full board (`state`). The `join` /
//! `welcome` / `rejected` exchange is a handshake that gates the channel
//! before it counts as open; it has no effect on the board.

use serde::{Serialize, Deserialize};

use crate::core::board::BoardState;
use crate::core::room_code::RoomCode;

/// Messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Guest asks to attach to a room.
    Join {
        /// Room the guest dialed.
        #[serde(rename = "roomCode")]
        room_code: RoomCode,
    },

    /// Host accepted the guest.
    Welcome {
        /// Room the guest is now attached to.
        #[serde(rename = "roomCode")]
        room_code: RoomCode,
    },

    /// Host refused the guest.
    Rejected {
        /// Why.
        reason: RejectReason,
    },

    /// Full synchronized board.
    State {
        /// Cumulative state after the sender's latest change.
        board: BoardState,
    },
}

/// Reasons a host refuses a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// A guest is already attached.
    RoomFull,
    /// The guest asked for a different room than this endpoint hosts.
    WrongRoom,
}

impl PeerMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Join { .. } => "join",
            PeerMessage::Welcome { .. } => "welcome",
            PeerMessage::Rejected { .. } => "rejected",
            PeerMessage::State { .. } => "state",
        }
    }
}
