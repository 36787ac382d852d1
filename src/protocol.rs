use serde::{Deserialize, Serialize};

use crate::common::Position;
use crate::store::CellRecord;

/// Everything a client may send. The set is closed; decoding happens in one
/// place and the dispatcher matches exhaustively.
///
/// Click and flag coordinates must be integers already on the map; the
/// deserializer rejects fractional values outright and the dispatcher
/// bounds-checks the rest. Cursor updates accept any finite numeric pair and
/// are clamped by the registry.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "clickCell")]
    ClickCell { x: i64, y: i64 },
    #[serde(rename = "flagCell")]
    FlagCell { x: i64, y: i64 },
    #[serde(rename = "updatePosition")]
    UpdatePosition { x: f64, y: f64 },
}

impl ClientMessage {
    /// Message kinds the server understands, used to tell an unknown kind
    /// (logged and dropped) from a malformed payload (answered with an
    /// error frame).
    pub const KNOWN_KINDS: [&'static str; 3] = ["clickCell", "flagCell", "updatePosition"];
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "initialState", rename_all = "camelCase")]
    InitialState {
        player_id: String,
        score: i64,
        map_chunk: MapChunk,
        players: Vec<PlayerView>,
        #[serde(rename = "self")]
        self_position: CursorView,
    },
    #[serde(rename = "mapUpdate")]
    MapUpdate { cells: Vec<CellView> },
    #[serde(rename = "playerJoined")]
    PlayerJoined { id: String, x: u32, y: u32 },
    #[serde(rename = "playerLeft")]
    PlayerLeft { id: String },
    #[serde(rename = "playerPositionUpdate")]
    PlayerPositionUpdate { players: Vec<PlayerView> },
    #[serde(rename = "scoreUpdate")]
    ScoreUpdate { score: i64 },
    #[serde(rename = "playerPenalty", rename_all = "camelCase")]
    PlayerPenalty { score: i64, stun_duration_ms: u64 },
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MapChunk {
    pub cells: Vec<CellView>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlayerView {
    pub id: String,
    pub x: u32,
    pub y: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CursorView {
    pub x: u32,
    pub y: u32,
}

impl From<Position> for CursorView {
    fn from(pos: Position) -> Self {
        CursorView {
            x: pos.x(),
            y: pos.y(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CellState {
    Hidden,
    Revealed,
    Flagged,
    Mine,
}

/// One cell as the client sees it. `value` carries the adjacency count for a
/// safe revealed cell, `-1` for a revealed mine, and null otherwise; clients
/// merge these last-writer-wins keyed on `(x, y)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CellView {
    pub x: u32,
    pub y: u32,
    pub state: CellState,
    pub value: Option<i8>,
}

impl CellView {
    pub fn hidden(pos: Position) -> Self {
        CellView {
            x: pos.x(),
            y: pos.y(),
            state: CellState::Hidden,
            value: None,
        }
    }

    pub fn flagged(pos: Position) -> Self {
        CellView {
            x: pos.x(),
            y: pos.y(),
            state: CellState::Flagged,
            value: None,
        }
    }

    pub fn revealed(pos: Position, adjacent: u8) -> Self {
        CellView {
            x: pos.x(),
            y: pos.y(),
            state: CellState::Revealed,
            value: Some(adjacent as i8),
        }
    }

    pub fn mine(pos: Position) -> Self {
        CellView {
            x: pos.x(),
            y: pos.y(),
            state: CellState::Mine,
            value: Some(-1),
        }
    }

    pub fn from_record(record: &CellRecord) -> Self {
        let pos = Position(record.x, record.y);
        if record.revealed {
            if record.is_mine {
                CellView::mine(pos)
            } else {
                CellView::revealed(pos, record.adjacent_mines.unwrap_or(0))
            }
        } else if record.flagged {
            CellView::flagged(pos)
        } else {
            CellView::hidden(pos)
        }
    }
}
