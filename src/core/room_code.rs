//! Room Codes
//!
//! Short, case-insensitive identifiers shared out of band (read aloud or typed)
//! and used as the directory key for a room.

use std::fmt;
use std::str::FromStr;
use rand::Rng;
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Alphabet for generated codes.
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of generated codes (36^6, about 31 bits).
pub const GENERATED_LEN: usize = 6;

/// Shortest accepted code.
pub const MIN_LEN: usize = 5;

/// Longest accepted code.
pub const MAX_LEN: usize = 8;

/// Room code parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomCodeError {
    /// Wrong number of characters.
    #[error("room code must be 5-8 characters, got {0}")]
    BadLength(usize),

    /// Contains something other than ASCII letters and digits.
    #[error("room code may only contain letters and digits")]
    BadCharacter,
}

/// Normalized (upper-case) room code.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a fresh random code.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..GENERATED_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Parse user input, ignoring case and surrounding whitespace.
    pub fn parse(input: &str) -> Result<Self, RoomCodeError> {
        let trimmed = input.trim();
        let len = trimmed.chars().count();
        if !(MIN_LEN..=MAX_LEN).contains(&len) {
            return Err(RoomCodeError::BadLength(len));
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RoomCodeError::BadCharacter);
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// The normalized code.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = RoomCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
