use serde::{Deserialize, Serialize};

/// Width of the world in cells. The map wraps at this edge.
pub const MAP_WIDTH: u32 = 640;
/// Height of the world in cells. The map wraps at this edge.
pub const MAP_HEIGHT: u32 = 640;

/// Half-extent of a player's area of interest along the X axis.
pub const VIEW_RADIUS_X: u32 = 30;
/// Half-extent of a player's area of interest along the Y axis.
pub const VIEW_RADIUS_Y: u32 = 20;

#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug, Serialize, Deserialize)]
pub struct Position(pub u32, pub u32);

impl Position {
    /// Midpoint of the map, used as the cursor for freshly joined sessions.
    pub fn center() -> Self {
        Position(MAP_WIDTH / 2, MAP_HEIGHT / 2)
    }

    pub fn x(self) -> u32 {
        self.0
    }

    pub fn y(self) -> u32 {
        self.1
    }

    /// Accepts a coordinate pair only if it already lies on the map.
    pub fn checked(x: i64, y: i64) -> Option<Self> {
        (x >= 0 && x < MAP_WIDTH as i64 && y >= 0 && y < MAP_HEIGHT as i64)
            .then(|| Position(x as u32, y as u32))
    }

    /// Pins an arbitrary numeric coordinate pair onto the map. Non-finite
    /// input collapses to zero rather than escaping the grid.
    pub fn clamped(x: f64, y: f64) -> Self {
        let x = x.floor().max(0.0).min((MAP_WIDTH - 1) as f64);
        let y = y.floor().max(0.0).min((MAP_HEIGHT - 1) as f64);
        Position(x as u32, y as u32)
    }

    /// The eight neighbours of this cell under toroidal wrapping. Every cell
    /// has exactly eight; corners wrap to the opposite edges.
    pub fn iter_neighbors(self) -> impl Iterator<Item = Position> {
        const OFFSETS: [(i64, i64); 8] = [
            (-1, -1),
            (-1, 0),
            (-1, 1),
            (0, -1),
            (0, 1),
            (1, -1),
            (1, 0),
            (1, 1),
        ];
        let Position(x, y) = self;
        OFFSETS.into_iter().map(move |(dx, dy)| {
            let nx = (x as i64 + dx).rem_euclid(MAP_WIDTH as i64) as u32;
            let ny = (y as i64 + dy).rem_euclid(MAP_HEIGHT as i64) as u32;
            Position(nx, ny)
        })
    }
}

/// A rectangle on the torus. When `x_min > x_max` the X interval wraps
/// around the seam, and likewise for Y; both the registry's cursor test and
/// the store's SQL predicate interpret it the same way.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub x_min: u32,
    pub x_max: u32,
    pub y_min: u32,
    pub y_max: u32,
}

impl Region {
    pub fn new(x_min: u32, x_max: u32, y_min: u32, y_max: u32) -> Self {
        Region {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    /// The area of interest centred on `center`, one view radius out in each
    /// direction, wrapped onto the map.
    pub fn viewport(center: Position) -> Self {
        let wrap_x = |v: i64| v.rem_euclid(MAP_WIDTH as i64) as u32;
        let wrap_y = |v: i64| v.rem_euclid(MAP_HEIGHT as i64) as u32;
        let x = center.x() as i64;
        let y = center.y() as i64;
        Region::new(
            wrap_x(x - VIEW_RADIUS_X as i64),
            wrap_x(x + VIEW_RADIUS_X as i64),
            wrap_y(y - VIEW_RADIUS_Y as i64),
            wrap_y(y + VIEW_RADIUS_Y as i64),
        )
    }

    pub fn contains(&self, pos: Position) -> bool {
        span_contains(self.x_min, self.x_max, pos.x())
            && span_contains(self.y_min, self.y_max, pos.y())
    }
}

fn span_contains(min: u32, max: u32, v: u32) -> bool {
    if min <= max {
        min <= v && v <= max
    } else {
        v >= min || v <= max
    }
}
