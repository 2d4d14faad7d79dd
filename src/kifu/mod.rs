//! Kifu domain model.
//!
//! A kifu is one recorded shogi game: a root record plus an ordered list of
//! steps. Step 0 is the start position, steps 1..=N are one per move.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque version token of a stored root record.
///
/// Tokens are compared for equality only. A fresh token is minted on every
/// successful root write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    /// Mint a new, unique version token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Version {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Version {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Root record of a game recording.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Kifu {
    pub owner_id: String,
    pub kifu_id: String,
    /// Creation time, unix seconds.
    pub created_ts: i64,
    /// Game start time, unix seconds.
    pub start_ts: i64,
    pub end_ts: Option<i64>,
    /// SFEN of the position reached by the final recorded move.
    pub position: String,
    /// Number of move steps (seq 1..=step_count) stored with this root.
    pub step_count: u32,
    pub handicap: String,
    pub game_name: String,
    pub first_players: Vec<String>,
    pub second_players: Vec<String>,
    pub note: String,
}

/// Board square, both coordinates in 1..=9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pos {
    pub x: u8,
    pub y: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Piece {
    #[default]
    Null,
    Gyoku,
    Hisha,
    Ryu,
    Kaku,
    Uma,
    Kin,
    Gin,
    NariGin,
    Kei,
    NariKei,
    Kyou,
    NariKyou,
    Fu,
    To,
}

impl Piece {
    const ALL: [Piece; 15] = [
        Piece::Null,
        Piece::Gyoku,
        Piece::Hisha,
        Piece::Ryu,
        Piece::Kaku,
        Piece::Uma,
        Piece::Kin,
        Piece::Gin,
        Piece::NariGin,
        Piece::Kei,
        Piece::NariKei,
        Piece::Kyou,
        Piece::NariKyou,
        Piece::Fu,
        Piece::To,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

/// Terminal status of a step. Everything but `NotFinished` ends the game.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishedStatus {
    #[default]
    NotFinished,
    Suspend,
    Surrender,
    Draw,
    RepetitionDraw,
    Checkmate,
    OverTimeLimit,
    FoulLoss,
    FoulWin,
    NyugyokuWin,
}

impl FinishedStatus {
    const ALL: [FinishedStatus; 10] = [
        FinishedStatus::NotFinished,
        FinishedStatus::Suspend,
        FinishedStatus::Surrender,
        FinishedStatus::Draw,
        FinishedStatus::RepetitionDraw,
        FinishedStatus::Checkmate,
        FinishedStatus::OverTimeLimit,
        FinishedStatus::FoulLoss,
        FinishedStatus::FoulWin,
        FinishedStatus::NyugyokuWin,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

/// One move (or the start position) of a kifu.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    pub owner_id: String,
    pub kifu_id: String,
    pub seq: u32,
    /// SFEN of the position after this step.
    pub position: String,
    pub src: Option<Pos>,
    pub dst: Option<Pos>,
    pub piece: Piece,
    pub promoted: bool,
    pub drop: bool,
    pub captured: Piece,
    pub finished_status: FinishedStatus,
    /// Elapsed game time at this step, seconds.
    pub timestamp_sec: u32,
    pub thinking_sec: u32,
    pub notes: Vec<String>,
}

/// A stored kifu that ended in a given position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KifuSignature {
    pub owner_id: String,
    pub kifu_id: String,
}

impl fmt::Display for KifuSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_id, self.kifu_id)
    }
}

/// A kifu that reached a searched position, with the steps that followed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamePosition {
    pub owner_id: String,
    pub kifu_id: String,
    /// Seq at which the position was reached.
    pub seq: u32,
    /// Steps `seq..seq + num_step`, ascending.
    pub steps: Vec<Step>,
}
