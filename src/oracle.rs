use sha2::{Digest, Sha256};

use crate::common::{Position, MAP_HEIGHT, MAP_WIDTH};

/// Fraction of cells that hold a mine.
pub const MINE_DENSITY: f64 = 0.15;

/// Pure, deterministic mine predicate. The whole ~410k-cell field is implied
/// by the seed; nothing is ever generated or stored up front, and changing
/// the seed regenerates the world.
#[derive(Clone, Debug)]
pub struct MineOracle {
    seed: String,
    density: f64,
}

impl MineOracle {
    pub fn new(seed: impl Into<String>) -> Self {
        MineOracle {
            seed: seed.into(),
            density: MINE_DENSITY,
        }
    }

    /// Whether the cell at `pos` holds a mine. The digest of
    /// `seed:x,y` is truncated to its first 8 bytes, read big-endian, and
    /// compared against the density as a fraction of the u64 range.
    pub fn is_mine(&self, pos: Position) -> bool {
        if pos.x() >= MAP_WIDTH || pos.y() >= MAP_HEIGHT {
            log::warn!("mine query off the map at ({}, {})", pos.x(), pos.y());
            return false;
        }
        let digest = Sha256::digest(format!("{}:{},{}", self.seed, pos.x(), pos.y()).as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let h = u64::from_be_bytes(bytes);
        (h as f64) / 2f64.powi(64) < self.density
    }

    /// Number of mines among the eight wrapped neighbours of `pos`.
    pub fn adjacent_mines(&self, pos: Position) -> u8 {
        if pos.x() >= MAP_WIDTH || pos.y() >= MAP_HEIGHT {
            log::warn!("adjacency query off the map at ({}, {})", pos.x(), pos.y());
            return 0;
        }
        pos.iter_neighbors().filter(|&n| self.is_mine(n)).count() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "TEST_SEED_A1B2C3D4";

    #[test]
    fn is_mine_is_deterministic() {
        let oracle = MineOracle::new(SEED);
        let other = MineOracle::new(SEED);

        for y in 0..32 {
            for x in 0..32 {
                let pos = Position(x, y);
                assert_eq!(oracle.is_mine(pos), other.is_mine(pos));
            }
        }
    }

    #[test]
    fn different_seeds_disagree_somewhere() {
        let a = MineOracle::new(SEED);
        let b = MineOracle::new("ANOTHER_SEED_9876");

        let disagreement = (0..64u32).flat_map(|y| (0..64u32).map(move |x| Position(x, y)))
            .any(|pos| a.is_mine(pos) != b.is_mine(pos));
        assert!(disagreement);
    }

    #[test]
    fn density_is_roughly_honored() {
        let oracle = MineOracle::new(SEED);

        let sample = 128 * 128;
        let mines = (0..128u32)
            .flat_map(|y| (0..128u32).map(move |x| Position(x, y)))
            .filter(|&pos| oracle.is_mine(pos))
            .count();
        let rate = mines as f64 / sample as f64;
        assert!((0.10..0.20).contains(&rate), "mine rate {rate} out of band");
    }

    #[test]
    fn adjacency_matches_manual_neighbor_sum() {
        let oracle = MineOracle::new(SEED);

        for y in 0..16 {
            for x in 0..16 {
                let pos = Position(x, y);
                let expected = pos.iter_neighbors().filter(|&n| oracle.is_mine(n)).count() as u8;
                assert_eq!(oracle.adjacent_mines(pos), expected);
            }
        }
    }

    #[test]
    fn adjacency_counts_across_the_seam() {
        let oracle = MineOracle::new(SEED);

        let expected = Position(0, 0)
            .iter_neighbors()
            .filter(|&n| oracle.is_mine(n))
            .count() as u8;
        assert_eq!(oracle.adjacent_mines(Position(0, 0)), expected);
        assert!(Position(0, 0)
            .iter_neighbors()
            .any(|n| n == Position(MAP_WIDTH - 1, MAP_HEIGHT - 1)));
    }

    #[test]
    fn out_of_range_queries_are_inert() {
        let oracle = MineOracle::new(SEED);

        assert!(!oracle.is_mine(Position(MAP_WIDTH, 0)));
        assert_eq!(oracle.adjacent_mines(Position(0, MAP_HEIGHT)), 0);
    }
}
