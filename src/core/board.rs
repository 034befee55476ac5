//! Board State Definitions
//!
//! The synchronized payload shared by both peers: an 8x8 matrix of squares,
//! the side to move and the append-only move log.
//!
//! Only structural rules are enforced here (non-empty source, no self-capture,
//! source differs from destination). Chess legality is not modelled.

use std::fmt;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::hash::{BoardDigest, BoardHasher};

/// Board edge length.
pub const BOARD_SIZE: usize = 8;

/// Highest sequence number a move may carry.
pub const MAX_SEQ: u64 = u64::MAX - 1;

// =============================================================================
// SIDE
// =============================================================================

/// One of the two participants. White is the first-moving side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// First-moving side, taken by the host.
    White,
    /// Second side, taken by the guest.
    Black,
}

impl Side {
    /// The other side.
    #[inline]
    pub const fn opponent(self) -> Self {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }
}

impl std::ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        self.opponent()
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::White => write!(f, "white"),
            Side::Black => write!(f, "black"),
        }
    }
}

// =============================================================================
// PIECES
// =============================================================================

/// The six piece kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PieceKind {
    /// Pawn.
    Pawn = 0,
    /// Knight.
    Knight = 1,
    /// Bishop.
    Bishop = 2,
    /// Rook.
    Rook = 3,
    /// Queen.
    Queen = 4,
    /// King.
    King = 5,
}

/// A piece standing on a square.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Piece {
    /// What the piece is.
    pub kind: PieceKind,
    /// Who owns it.
    pub side: Side,
}

impl Piece {
    /// Create a piece.
    pub const fn new(kind: PieceKind, side: Side) -> Self {
        Self { kind, side }
    }
}

/// A board cell: empty or occupied.
pub type Square = Option<Piece>;

/// Row-major cell matrix. Row 0 is Black's back rank.
pub type Cells = [[Square; BOARD_SIZE]; BOARD_SIZE];

const BACK_RANK: [PieceKind; BOARD_SIZE] = [
    PieceKind::Rook,
    PieceKind::Knight,
    PieceKind::Bishop,
    PieceKind::Queen,
    PieceKind::King,
    PieceKind::Bishop,
    PieceKind::Knight,
    PieceKind::Rook,
];

// =============================================================================
// COORDINATES
// =============================================================================

/// A square address, always inside the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCoord")]
pub struct Coord {
    row: u8,
    col: u8,
}

#[derive(Deserialize)]
struct RawCoord {
    row: u8,
    col: u8,
}

impl TryFrom<RawCoord> for Coord {
    type Error = String;

    fn try_from(raw: RawCoord) -> Result<Self, Self::Error> {
        Coord::new(raw.row, raw.col)
            .ok_or_else(|| format!("coordinate ({}, {}) is off the board", raw.row, raw.col))
    }
}

impl Coord {
    /// Create a coordinate, `None` when off the board.
    pub fn new(row: u8, col: u8) -> Option<Self> {
        if (row as usize) < BOARD_SIZE && (col as usize) < BOARD_SIZE {
            Some(Self { row, col })
        } else {
            None
        }
    }

    /// Row index (0 = Black's back rank).
    #[inline]
    pub fn row(self) -> usize {
        self.row as usize
    }

    /// Column index (0 = file a).
    #[inline]
    pub fn col(self) -> usize {
        self.col as usize
    }

    /// Algebraic name, e.g. `(6, 4)` is `e2`.
    pub fn algebraic(self) -> String {
        let file = (b'a' + self.col) as char;
        let rank = BOARD_SIZE - self.row();
        format!("{file}{rank}")
    }

    /// Parse an algebraic name such as `e2`.
    pub fn from_algebraic(name: &str) -> Option<Self> {
        let mut chars = name.chars();
        let file = chars.next()?.to_ascii_lowercase();
        let rank = chars.next()?.to_digit(10)?;
        if chars.next().is_some() || !('a'..='h').contains(&file) || !(1..=8).contains(&rank) {
            return None;
        }
        Coord::new((BOARD_SIZE as u32 - rank) as u8, file as u8 - b'a')
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.algebraic())
    }
}

// =============================================================================
// MOVES
// =============================================================================

/// One entry of the move log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    /// Source square.
    pub from: Coord,
    /// Destination square.
    pub to: Coord,
    /// Side that made the move.
    pub mover: Side,
    /// Strictly increasing per session.
    pub seq: u64,
}

impl fmt::Display for MoveRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} → {}", self.mover, self.from, self.to)
    }
}

/// Why a move was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveRejection {
    /// Source and destination are the same square.
    #[error("source and destination are the same square")]
    SameSquare,

    /// Nothing stands on the source square.
    #[error("source square is empty")]
    EmptySource,

    /// The source piece belongs to the other side.
    #[error("not your piece")]
    NotYourPiece,

    /// The other side is to move.
    #[error("not your turn")]
    NotYourTurn,

    /// The destination holds a piece of the moving side.
    #[error("cannot capture your own piece")]
    SelfCapture,

    /// The move log has no sequence number left to hand out.
    #[error("move log is full")]
    LogFull,
}

/// Why a move log could not be folded into a board.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    /// Sequence numbers went backwards or repeated.
    #[error("move {index} has seq {seq}, not greater than {previous}")]
    SequenceNotIncreasing {
        /// Position in the history.
        index: usize,
        /// Offending sequence number.
        seq: u64,
        /// Sequence number of the previous move.
        previous: u64,
    },

    /// A move broke a structural rule.
    #[error("move {index} ({record}) rejected: {reason}")]
    Rejected {
        /// Position in the history.
        index: usize,
        /// The rejected record.
        record: MoveRecord,
        /// Rule that was broken.
        reason: MoveRejection,
    },
}

// =============================================================================
// BOARD STATE
// =============================================================================

/// The full synchronized state of one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardState {
    /// Cell matrix.
    pub cells: Cells,
    /// Side whose turn it is.
    pub to_move: Side,
    /// Every move applied since the initial position.
    pub history: Vec<MoveRecord>,
}

impl Default for BoardState {
    fn default() -> Self {
        Self::initial()
    }
}

impl BoardState {
    /// Canonical starting position, White to move.
    pub fn initial() -> Self {
        let mut cells: Cells = [[None; BOARD_SIZE]; BOARD_SIZE];
        for (col, kind) in BACK_RANK.iter().enumerate() {
            cells[0][col] = Some(Piece::new(*kind, Side::Black));
            cells[1][col] = Some(Piece::new(PieceKind::Pawn, Side::Black));
            cells[6][col] = Some(Piece::new(PieceKind::Pawn, Side::White));
            cells[7][col] = Some(Piece::new(*kind, Side::White));
        }
        Self {
            cells,
            to_move: Side::White,
            history: Vec::new(),
        }
    }

    /// Piece on a square.
    #[inline]
    pub fn piece_at(&self, at: Coord) -> Square {
        self.cells[at.row()][at.col()]
    }

    /// Sequence number the next move will carry, `None` once the log is full.
    pub fn next_seq(&self) -> Option<u64> {
        match self.history.last() {
            Some(last) => last.seq.checked_add(1).filter(|seq| *seq <= MAX_SEQ),
            None => Some(1),
        }
    }

    /// Check the structural rules for `mover` moving `from` to `to`.
    pub fn check_move(&self, from: Coord, to: Coord, mover: Side) -> Result<(), MoveRejection> {
        if from == to {
            return Err(MoveRejection::SameSquare);
        }
        let piece = self.piece_at(from).ok_or(MoveRejection::EmptySource)?;
        if piece.side != mover {
            return Err(MoveRejection::NotYourPiece);
        }
        if self.to_move != mover {
            return Err(MoveRejection::NotYourTurn);
        }
        if matches!(self.piece_at(to), Some(target) if target.side == mover) {
            return Err(MoveRejection::SelfCapture);
        }
        Ok(())
    }

    /// Apply a move for `mover`, appending it to the history and flipping the turn.
    pub fn apply_move(&mut self, from: Coord, to: Coord, mover: Side) -> Result<MoveRecord, MoveRejection> {
        self.check_move(from, to, mover)?;
        let record = MoveRecord {
            from,
            to,
            mover,
            seq: self.next_seq().ok_or(MoveRejection::LogFull)?,
        };
        self.apply_record(record)?;
        Ok(record)
    }

    fn apply_record(&mut self, record: MoveRecord) -> Result<(), MoveRejection> {
        self.check_move(record.from, record.to, record.mover)?;
        let piece = self.cells[record.from.row()][record.from.col()].take();
        self.cells[record.to.row()][record.to.col()] = piece;
        self.to_move = !self.to_move;
        self.history.push(record);
        Ok(())
    }

    /// Fold a move log over the initial position.
    pub fn replay(history: &[MoveRecord]) -> Result<Self, ReplayError> {
        let mut state = Self::initial();
        let mut previous = 0;
        for (index, record) in history.iter().enumerate() {
            if record.seq <= previous {
                return Err(ReplayError::SequenceNotIncreasing {
                    index,
                    seq: record.seq,
                    previous,
                });
            }
            if record.seq > MAX_SEQ {
                return Err(ReplayError::Rejected {
                    index,
                    record: *record,
                    reason: MoveRejection::LogFull,
                });
            }
            previous = record.seq;
            state
                .apply_record(*record)
                .map_err(|reason| ReplayError::Rejected { index, record: *record, reason })?;
        }
        Ok(state)
    }

    /// `true` when replaying the history reproduces the cells and the turn.
    pub fn is_consistent(&self) -> bool {
        match Self::replay(&self.history) {
            Ok(replayed) => replayed.cells == self.cells && replayed.to_move == self.to_move,
            Err(_) => false,
        }
    }

    /// Number of occupied squares.
    pub fn piece_count(&self) -> usize {
        self.cells.iter().flatten().filter(|sq| sq.is_some()).count()
    }

    /// Domain-separated SHA-256 over cells, turn and history.
    pub fn digest(&self) -> BoardDigest {
        let mut hasher = BoardHasher::for_board_state();
        for square in self.cells.iter().flatten() {
            match square {
                Some(piece) => {
                    hasher.update_u8(1);
                    hasher.update_u8(piece.kind as u8);
                    hasher.update_side(piece.side);
                }
                None => hasher.update_u8(0),
            }
        }
        hasher.update_side(self.to_move);
        hasher.update_u64(self.history.len() as u64);
        for record in &self.history {
            hasher.update_coord(record.from);
            hasher.update_coord(record.to);
            hasher.update_side(record.mover);
            hasher.update_u64(record.seq);
        }
        hasher.finalize()
    }
}
