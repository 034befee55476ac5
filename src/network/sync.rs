//! State Synchronizer
//!
//! Owns the board for the current session. A local move is checked against
//! the turn gate, applied, and the whole resulting board is sent to the peer.
//! An inbound board replaces the local one wholesale (last writer wins).
//!
//! Turns alternate and a rejected move never goes out, so the two sides never
//! write concurrently. A lost message is healed by the next one, which carries
//! the cumulative state; a duplicated one is detected by digest and dropped.

use tracing::{debug, info, warn};

use crate::core::board::{BoardState, Coord, MoveRecord, MoveRejection, Side};
use crate::core::hash::{short_hex, BoardDigest};
use crate::network::connection::ConnectionHandle;
use crate::network::protocol::PeerMessage;

/// Outbound side of the synchronizer.
pub trait PeerSender: Send + Sync {
    /// Send the full board. Returns `false` when it could not be queued.
    fn send_state(&self, board: &BoardState) -> bool;
}

impl PeerSender for ConnectionHandle {
    fn send_state(&self, board: &BoardState) -> bool {
        self.send(PeerMessage::State { board: board.clone() })
    }
}

/// Result of a local move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Applied and sent.
    Accepted(MoveRecord),
    /// Refused; nothing changed and nothing was sent.
    Rejected(MoveRejection),
}

impl MoveOutcome {
    /// `true` for [`MoveOutcome::Accepted`].
    pub fn is_accepted(&self) -> bool {
        matches!(self, MoveOutcome::Accepted(_))
    }
}

/// Result of an inbound board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Replaced the local board.
    Applied,
    /// Identical to the local board; nothing changed.
    Duplicate,
    /// History does not reproduce the cells; dropped.
    Ignored,
}

/// Board owner for one session.
pub struct StateSynchronizer<P: PeerSender> {
    local_side: Side,
    board: BoardState,
    digest: BoardDigest,
    peer: P,
}

impl<P: PeerSender> StateSynchronizer<P> {
    /// Start from the initial position.
    pub fn new(local_side: Side, peer: P) -> Self {
        let board = BoardState::initial();
        let digest = board.digest();
        Self {
            local_side,
            board,
            digest,
            peer,
        }
    }

    /// Reset to the initial position, White to move, empty history.
    pub fn initialize_as_host(&mut self) -> &BoardState {
        self.board = BoardState::initial();
        self.digest = self.board.digest();
        &self.board
    }

    /// Side this client plays.
    pub fn local_side(&self) -> Side {
        self.local_side
    }

    /// Current board.
    pub fn board(&self) -> &BoardState {
        &self.board
    }

    /// Digest of the current board.
    pub fn digest(&self) -> BoardDigest {
        self.digest
    }

    /// `true` when the local side is to move.
    pub fn is_local_turn(&self) -> bool {
        self.board.to_move == self.local_side
    }

    /// Outbound sender.
    pub fn peer(&self) -> &P {
        &self.peer
    }

    /// Move a local piece. On acceptance the full board goes to the peer.
    pub fn apply_local_move(&mut self, from: Coord, to: Coord) -> MoveOutcome {
        let record = match self.board.apply_move(from, to, self.local_side) {
            Ok(record) => record,
            Err(reason) => {
                debug!(side = %self.local_side, "Move {} -> {} rejected: {}", from, to, reason);
                return MoveOutcome::Rejected(reason);
            }
        };
        self.digest = self.board.digest();
        info!(seq = record.seq, digest = %short_hex(&self.digest), "Move accepted: {}", record);

        if !self.peer.send_state(&self.board) {
            // Next successful send carries the cumulative state
            debug!("Peer not connected, move held locally");
        }
        MoveOutcome::Accepted(record)
    }

    /// Replace the local board with the peer's.
    pub fn apply_remote_state(&mut self, incoming: BoardState) -> RemoteApply {
        let digest = incoming.digest();
        if digest == self.digest {
            debug!("Duplicate remote state {}", short_hex(&digest));
            return RemoteApply::Duplicate;
        }
        if !incoming.is_consistent() {
            warn!(
                moves = incoming.history.len(),
                "Ignoring remote state whose history does not reproduce its board"
            );
            return RemoteApply::Ignored;
        }
        if incoming.history.len() < self.board.history.len() {
            warn!(
                local = self.board.history.len(),
                remote = incoming.history.len(),
                "Remote state is behind local history, applying anyway"
            );
        }

        self.board = incoming;
        self.digest = digest;
        info!(
            moves = self.board.history.len(),
            to_move = %self.board.to_move,
            digest = %short_hex(&self.digest),
            "Remote state applied"
        );
        RemoteApply::Applied
    }

    /// Send the current board unconditionally. Used by the host when a
    /// guest (re)attaches.
    pub fn resync(&self) -> bool {
        debug!(digest = %short_hex(&self.digest), "Resending board to peer");
        self.peer.send_state(&self.board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::board::MAX_SEQ;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingPeer {
        sent: Arc<Mutex<Vec<BoardState>>>,
        connected: bool,
    }

    impl RecordingPeer {
        fn connected() -> Self {
            Self { sent: Arc::default(), connected: true }
        }

        fn sent(&self) -> Vec<BoardState> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl PeerSender for RecordingPeer {
        fn send_state(&self, board: &BoardState) -> bool {
            if self.connected {
                self.sent.lock().unwrap().push(board.clone());
            }
            self.connected
        }
    }

    fn at(row: u8, col: u8) -> Coord {
        Coord::new(row, col).unwrap()
    }

    #[test]
    fn test_host_move_is_sent_in_full() {
        let peer = RecordingPeer::connected();
        let mut host = StateSynchronizer::new(Side::White, peer.clone());
        assert_eq!(host.board().to_move, Side::White);

        let outcome = host.apply_local_move(at(6, 4), at(4, 4));
        assert!(outcome.is_accepted());

        let sent = peer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0], host.board());
        assert_eq!(sent[0].to_move, Side::Black);
        assert_eq!(sent[0].history.len(), 1);
    }

    #[test]
    fn test_rejected_move_is_not_sent() {
        let peer = RecordingPeer::connected();
        let mut guest = StateSynchronizer::new(Side::Black, peer.clone());

        // Black piece, but White to move
        let outcome = guest.apply_local_move(at(1, 3), at(3, 3));
        assert_eq!(outcome, MoveOutcome::Rejected(MoveRejection::NotYourTurn));
        assert!(peer.sent().is_empty());
        assert_eq!(guest.board(), &BoardState::initial());
    }

    #[test]
    fn test_second_rapid_move_is_not_your_turn() {
        let peer = RecordingPeer::connected();
        let mut host = StateSynchronizer::new(Side::White, peer.clone());

        assert!(host.apply_local_move(at(6, 4), at(4, 4)).is_accepted());
        let second = host.apply_local_move(at(6, 3), at(4, 3));
        assert_eq!(second, MoveOutcome::Rejected(MoveRejection::NotYourTurn));
        assert_eq!(second_reason(second), "not your turn");
        assert_eq!(peer.sent().len(), 1);
    }

    fn second_reason(outcome: MoveOutcome) -> String {
        match outcome {
            MoveOutcome::Rejected(reason) => reason.to_string(),
            MoveOutcome::Accepted(_) => String::new(),
        }
    }

    #[test]
    fn test_remote_state_replaces_and_dedupes() {
        let mut host = StateSynchronizer::new(Side::White, RecordingPeer::connected());
        let mut guest = StateSynchronizer::new(Side::Black, RecordingPeer::connected());

        host.apply_local_move(at(6, 4), at(4, 4));
        assert_eq!(guest.apply_remote_state(host.board().clone()), RemoteApply::Applied);
        assert_eq!(guest.board().to_move, Side::Black);
        assert!(guest.board().piece_at(at(4, 4)).is_some());
        assert!(guest.board().piece_at(at(6, 4)).is_none());

        assert_eq!(guest.apply_remote_state(host.board().clone()), RemoteApply::Duplicate);
        assert_eq!(guest.digest(), host.digest());
    }

    #[test]
    fn test_inconsistent_remote_state_ignored() {
        let mut guest = StateSynchronizer::new(Side::Black, RecordingPeer::connected());
        let mut forged = BoardState::initial();
        forged.cells[4][4] = forged.cells[6][4].take();
        // No history to explain the moved pawn

        assert_eq!(guest.apply_remote_state(forged), RemoteApply::Ignored);
        assert_eq!(guest.board(), &BoardState::initial());
    }

    #[test]
    fn test_remote_state_at_sequence_limit_never_panics() {
        let mut host = StateSynchronizer::new(Side::White, RecordingPeer::connected());
        host.apply_local_move(at(6, 4), at(4, 4));

        // Unfollowable sequence number: dropped as inconsistent
        let mut overflowing = host.board().clone();
        overflowing.history[0].seq = u64::MAX;
        let peer = RecordingPeer::connected();
        let mut guest = StateSynchronizer::new(Side::Black, peer.clone());
        assert_eq!(guest.apply_remote_state(overflowing), RemoteApply::Ignored);
        assert_eq!(guest.board(), &BoardState::initial());

        // Last usable number: applied, but the log cannot grow
        let mut saturated = host.board().clone();
        saturated.history[0].seq = MAX_SEQ;
        assert_eq!(guest.apply_remote_state(saturated.clone()), RemoteApply::Applied);
        assert_eq!(
            guest.apply_local_move(at(1, 4), at(3, 4)),
            MoveOutcome::Rejected(MoveRejection::LogFull)
        );
        assert_eq!(guest.board(), &saturated);
        assert!(peer.sent().is_empty());
    }

    #[test]
    fn test_stale_remote_state_still_applied() {
        let mut host = StateSynchronizer::new(Side::White, RecordingPeer::connected());
        host.apply_local_move(at(6, 4), at(4, 4));
        let after_one = host.board().clone();

        let mut guest = StateSynchronizer::new(Side::Black, RecordingPeer::connected());
        guest.apply_remote_state(after_one);
        guest.apply_local_move(at(1, 4), at(3, 4));

        // Last writer wins even when it is behind
        assert_eq!(guest.apply_remote_state(BoardState::initial()), RemoteApply::Applied);
        assert_eq!(guest.board(), &BoardState::initial());
    }

    #[test]
    fn test_disconnected_move_kept_locally_and_resynced() {
        let offline = RecordingPeer::default();
        let mut host = StateSynchronizer::new(Side::White, offline.clone());
        assert!(host.apply_local_move(at(6, 4), at(4, 4)).is_accepted());
        assert!(offline.sent().is_empty());
        assert!(!host.resync());

        let online = RecordingPeer::connected();
        let mut host2 = StateSynchronizer::new(Side::White, online.clone());
        host2.apply_remote_state(host.board().clone());
        assert!(host2.resync());
        assert_eq!(online.sent(), vec![host.board().clone()]);
    }

    #[test]
    fn test_initialize_as_host_resets() {
        let mut host = StateSynchronizer::new(Side::White, RecordingPeer::connected());
        host.apply_local_move(at(6, 4), at(4, 4));
        let board = host.initialize_as_host().clone();
        assert_eq!(board, BoardState::initial());
        assert_eq!(host.digest(), BoardState::initial().digest());
        assert!(host.is_local_turn());
    }

    fn arb_coord() -> impl Strategy<Value = Coord> {
        (0u8..8, 0u8..8).prop_map(|(r, c)| Coord::new(r, c).unwrap())
    }

    proptest! {
        #[test]
        fn prop_out_of_turn_always_rejected(
            opening in proptest::collection::vec((arb_coord(), arb_coord()), 0..12),
            from in arb_coord(),
            to in arb_coord(),
        ) {
            // Drive the board to an arbitrary reachable position
            let mut board = BoardState::initial();
            for (f, t) in opening {
                let mover = board.to_move;
                let _ = board.apply_move(f, t, mover);
            }
            let waiting_side = !board.to_move;

            let peer = RecordingPeer::connected();
            let mut sync = StateSynchronizer::new(waiting_side, peer.clone());
            sync.apply_remote_state(board.clone());

            let outcome = sync.apply_local_move(from, to);
            prop_assert!(!outcome.is_accepted());
            prop_assert_eq!(sync.board(), &board);
            prop_assert!(peer.sent().is_empty());
        }

        #[test]
        fn prop_remote_apply_idempotent(
            moves in proptest::collection::vec((arb_coord(), arb_coord()), 0..12),
        ) {
            let mut source = StateSynchronizer::new(Side::White, RecordingPeer::connected());
            for (f, t) in moves {
                let side = source.board().to_move;
                source.local_side = side;
                source.apply_local_move(f, t);
            }
            let incoming = source.board().clone();

            let mut once = StateSynchronizer::new(Side::Black, RecordingPeer::connected());
            once.apply_remote_state(incoming.clone());

            let mut twice = StateSynchronizer::new(Side::Black, RecordingPeer::connected());
            twice.apply_remote_state(incoming.clone());
            let second = twice.apply_remote_state(incoming);

            prop_assert_eq!(second, RemoteApply::Duplicate);
            prop_assert_eq!(once.board(), twice.board());
            prop_assert_eq!(once.digest(), twice.digest());
        }
    }
}
