use std::collections::{HashSet, VecDeque};

use crate::common::Position;
use crate::oracle::MineOracle;
use crate::protocol::CellView;
use crate::store::{Store, StoreError};

/// Score change for stepping on a mine.
pub const MINE_PENALTY: i64 = -50;
/// How long the client keeps the offender frozen after a mine hit.
pub const STUN_MS: u64 = 3000;

/// Result of a reveal request. `score` is the persisted total after the
/// action, not the delta, so cached copies cannot drift from the database.
#[derive(Debug, Clone, PartialEq)]
pub enum RevealOutcome {
    /// The cell was already revealed or flagged, or another player finished
    /// the work first. Nothing changed, nothing to broadcast.
    Ignored,
    MineHit {
        score: i64,
        stun_ms: u64,
        cells: Vec<CellView>,
    },
    Safe {
        score: i64,
        cells: Vec<CellView>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlagOutcome {
    Ignored,
    Flagged(CellView),
    Unflagged(CellView),
}

/// The rules of the shared board: reveal with flood fill, flag toggling, and
/// the scoring that goes with them. Consults the oracle for the hidden truth
/// and the store for what players have already done to it.
#[derive(Clone)]
pub struct Engine {
    store: Store,
    oracle: MineOracle,
}

impl Engine {
    pub fn new(store: Store, oracle: MineOracle) -> Self {
        Engine { store, oracle }
    }

    pub async fn reveal(
        &self,
        player_id: &str,
        pos: Position,
    ) -> Result<RevealOutcome, StoreError> {
        if let Some(cell) = self.store.get_cell(pos).await? {
            if cell.revealed || cell.flagged {
                return Ok(RevealOutcome::Ignored);
            }
        }

        if self.oracle.is_mine(pos) {
            // The mine record lands before the score so a crash in between
            // leaves the world consistent with what the player saw.
            self.store.upsert_revealed(pos, true, None).await?;
            let score = self.store.add_to_player_score(player_id, MINE_PENALTY).await?;
            return Ok(RevealOutcome::MineHit {
                score,
                stun_ms: STUN_MS,
                cells: vec![CellView::mine(pos)],
            });
        }

        let opened = self.flood_from(pos).await?;
        if opened.is_empty() {
            // Lost the race to another revealer.
            log::debug!("reveal at ({}, {}) found nothing left to open", pos.x(), pos.y());
            return Ok(RevealOutcome::Ignored);
        }

        for &(cell, adjacent) in &opened {
            self.store.upsert_revealed(cell, false, Some(adjacent)).await?;
        }
        let score = self
            .store
            .add_to_player_score(player_id, opened.len() as i64)
            .await?;
        Ok(RevealOutcome::Safe {
            score,
            cells: opened
                .into_iter()
                .map(|(cell, adjacent)| CellView::revealed(cell, adjacent))
                .collect(),
        })
    }

    /// Walks outward from `origin` across zero-adjacency cells. Every pop
    /// re-checks persistence because another player may have revealed or
    /// flagged the cell since it was enqueued; flags and existing reveals
    /// bound the walk. Wrapping keeps every visited key on the map, and the
    /// visited set caps the walk at the board size.
    async fn flood_from(&self, origin: Position) -> Result<Vec<(Position, u8)>, StoreError> {
        let mut queue = VecDeque::from([origin]);
        let mut visited = HashSet::from([origin]);
        let mut opened = Vec::new();

        while let Some(current) = queue.pop_front() {
            if let Some(cell) = self.store.get_cell(current).await? {
                if cell.revealed || cell.flagged {
                    continue;
                }
            }
            let adjacent = self.oracle.adjacent_mines(current);
            opened.push((current, adjacent));
            if adjacent != 0 {
                continue;
            }
            for neighbor in current.iter_neighbors() {
                if !visited.insert(neighbor) {
                    continue;
                }
                let blocked = match self.store.get_cell(neighbor).await? {
                    Some(cell) => cell.revealed || cell.flagged,
                    None => false,
                };
                if !blocked {
                    queue.push_back(neighbor);
                }
            }
        }
        Ok(opened)
    }

    pub async fn toggle_flag(&self, pos: Position) -> Result<FlagOutcome, StoreError> {
        match self.store.get_cell(pos).await? {
            Some(cell) if cell.revealed => Ok(FlagOutcome::Ignored),
            Some(cell) if cell.flagged => {
                self.store.set_flag(pos, false).await?;
                Ok(FlagOutcome::Unflagged(CellView::hidden(pos)))
            }
            _ => {
                self.store.set_flag(pos, true).await?;
                Ok(FlagOutcome::Flagged(CellView::flagged(pos)))
            }
        }
    }
}
