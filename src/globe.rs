// Geographic tile index binding aircraft to regional buckets.
//
// A fixed table of hand-authored rectangles covers the busy regions; the
// rest of the globe falls into a uniform grid. The first 1000 indices are
// reserved for the special rectangles.

use std::collections::HashSet;
use std::sync::Mutex;

pub const GLOBE_INDEX_GRID: i32 = 3;
pub const GLOBE_LAT_MULT: i32 = 121;
pub const GLOBE_SPECIAL_INDEX: usize = 30;
pub const GLOBE_MAX_INDEX: i32 = 61 * GLOBE_LAT_MULT + 121 + 1000;

/// One special rectangle: (south, west, north, east), degrees.
/// west > east indicates a wrap across the antimeridian.
#[derive(Debug, Clone, Copy)]
pub struct Tile {
    pub south: i32,
    pub west: i32,
    pub north: i32,
    pub east: i32,
}

/// The hand-authored region set. Order matters: first hit wins.
pub const SPECIAL_TILES: &[Tile] = &[
    // Arctic
    Tile { south: 60, west: -130, north: 90, east: 150 },
    // North Pacific
    Tile { south: 10, west: 150, north: 90, east: -130 },
    // Northern Canada
    Tile { south: 50, west: -130, north: 60, east: -70 },
    // Northwest USA
    Tile { south: 40, west: -130, north: 50, east: -100 },
    // West Russia
    Tile { south: 40, west: 20, north: 60, east: 50 },
    // Central Russia
    Tile { south: 30, west: 50, north: 60, east: 90 },
    // East Russia
    Tile { south: 30, west: 90, north: 60, east: 120 },
    // Koreas and Japan and some Russia
    Tile { south: 30, west: 120, north: 60, east: 150 },
    // Persian Gulf / Arabian Sea
    Tile { south: 10, west: 50, north: 30, east: 70 },
    // India
    Tile { south: 10, west: 70, north: 30, east: 90 },
    // South China
    Tile { south: 10, west: 90, north: 30, east: 110 },
    Tile { south: 10, west: 110, north: 30, east: 150 },
    // South Atlantic and Indian Ocean
    Tile { south: -90, west: -40, north: 10, east: 110 },
    // Australia
    Tile { south: -90, west: 110, north: 10, east: 160 },
    // South Pacific and NZ
    Tile { south: -90, west: 160, north: 10, east: -90 },
    // North South America
    Tile { south: -10, west: -90, north: 10, east: -40 },
    // South South America
    Tile { south: -90, west: -90, north: -10, east: -40 },
    // Guatemala / Mexico
    Tile { south: 10, west: -130, north: 30, east: -90 },
    // Cuba / Haiti / Honduras
    Tile { south: 10, west: -90, north: 20, east: -70 },
    // North Africa
    Tile { south: 10, west: -10, north: 40, east: 30 },
    // Middle East
    Tile { south: 10, west: 30, north: 40, east: 50 },
    // North Atlantic
    Tile { south: 10, west: -70, north: 60, east: -10 },
];

/// Map a position to its tile index. Quantizes to the grid, tests the
/// special rectangles in order, then falls back to the uniform grid with
/// the first 1000 ids reserved.
pub fn globe_index(lat_in: f64, lon_in: f64) -> i32 {
    let grid = GLOBE_INDEX_GRID;
    let lat = grid * (((lat_in + 90.0) / grid as f64) as i32) - 90;
    let lon = grid * (((lon_in + 180.0) / grid as f64) as i32) - 180;

    for (i, tile) in SPECIAL_TILES.iter().enumerate() {
        if lat >= tile.south && lat < tile.north {
            if tile.west < tile.east && lon >= tile.west && lon < tile.east {
                return i as i32;
            }
            if tile.west > tile.east && (lon >= tile.west || lon < tile.east) {
                return i as i32;
            }
        }
    }

    let i = (lat + 90) / grid;
    let j = (lon + 180) / grid;

    i * GLOBE_LAT_MULT + j + 1000
}

/// Re-derive the index from a grid index's cell origin. Stable for every
/// index globe_index produces for positions outside the special set.
pub fn globe_index_index(index: i32) -> i32 {
    let lat = (((index - 1000) / GLOBE_LAT_MULT) * GLOBE_INDEX_GRID - 90) as f64;
    let lon = (((index - 1000) % GLOBE_LAT_MULT) * GLOBE_INDEX_GRID - 180) as f64;
    globe_index(lat, lon)
}

/// Bounding box of a tile, (south, west, north, east) degrees.
pub fn tile_bbox(index: i32) -> (f64, f64, f64, f64) {
    if (index as usize) < SPECIAL_TILES.len() {
        let t = SPECIAL_TILES[index as usize];
        return (t.south as f64, t.west as f64, t.north as f64, t.east as f64);
    }
    let lat = ((index - 1000) / GLOBE_LAT_MULT) * GLOBE_INDEX_GRID - 90;
    let lon = ((index - 1000) % GLOBE_LAT_MULT) * GLOBE_INDEX_GRID - 180;
    (
        lat as f64,
        lon as f64,
        (lat + GLOBE_INDEX_GRID) as f64,
        (lon + GLOBE_INDEX_GRID) as f64,
    )
}

/// Per-tile membership lists. Every aircraft with a reliable position is
/// in exactly one list; the aircraft record stores which.
pub struct TileLists {
    tiles: Vec<Mutex<HashSet<u32>>>,
}

pub const TILE_NONE: i32 = -5;

impl TileLists {
    pub fn new() -> Self {
        let mut tiles = Vec::with_capacity(GLOBE_MAX_INDEX as usize + 1);
        for _ in 0..=GLOBE_MAX_INDEX {
            tiles.push(Mutex::new(HashSet::new()));
        }
        TileLists { tiles }
    }

    /// Move an aircraft between tile lists. Pass TILE_NONE to unlink.
    /// Returns the new index.
    pub fn relink(&self, addr: u32, old_index: i32, new_index: i32) -> i32 {
        if old_index == new_index {
            return new_index;
        }
        if old_index >= 0 && (old_index as usize) < self.tiles.len() {
            self.tiles[old_index as usize].lock().unwrap().remove(&addr);
        }
        if new_index >= 0 && (new_index as usize) < self.tiles.len() {
            self.tiles[new_index as usize].lock().unwrap().insert(addr);
        }
        new_index
    }

    /// Snapshot of one tile's member addresses.
    pub fn members(&self, index: i32) -> Vec<u32> {
        if index < 0 || index as usize >= self.tiles.len() {
            return Vec::new();
        }
        self.tiles[index as usize].lock().unwrap().iter().copied().collect()
    }

    /// Indices of tiles that currently have members.
    pub fn active_tiles(&self) -> Vec<i32> {
        let mut out = Vec::new();
        for (i, t) in self.tiles.iter().enumerate() {
            if !t.lock().unwrap().is_empty() {
                out.push(i as i32);
            }
        }
        out
    }

    pub fn contains(&self, index: i32, addr: u32) -> bool {
        if index < 0 || index as usize >= self.tiles.len() {
            return false;
        }
        self.tiles[index as usize].lock().unwrap().contains(&addr)
    }
}

impl Default for TileLists {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_tile_hit() {
        // central Europe is not in the special set (falls to the grid)
        let idx = globe_index(48.0, 8.0);
        assert!(idx >= 1000, "Europe grid tile, got {}", idx);

        // India special rectangle
        let idx = globe_index(20.0, 78.0);
        assert_eq!(idx, 9);
    }

    #[test]
    fn test_antimeridian_wrap() {
        // North Pacific tile spans 150E..130W
        let east_side = globe_index(40.0, 170.0);
        let west_side = globe_index(40.0, -170.0);
        assert_eq!(east_side, 1);
        assert_eq!(west_side, 1);
        // longitude just east of the wrap boundary is not in it
        assert_ne!(globe_index(40.0, -120.0), 1);
    }

    #[test]
    fn test_grid_index_inverse() {
        for &(lat, lon) in &[(48.0, 8.0), (47.99, 7.85), (-35.0, -58.0), (62.0, 10.0)] {
            let idx = globe_index(lat, lon);
            if idx >= 1000 {
                assert_eq!(globe_index_index(idx), idx, "at {} {}", lat, lon);
            }
        }
    }

    #[test]
    fn test_first_hit_wins() {
        // Arctic (index 0) overlaps the North Pacific rectangle above 60N
        assert_eq!(globe_index(70.0, 160.0), 1); // 160E is outside -130..150
        assert_eq!(globe_index(70.0, 0.0), 0);
    }

    #[test]
    fn test_tile_lists_exactly_one() {
        let lists = TileLists::new();
        let a = globe_index(48.0, 8.0);
        let b = globe_index(20.0, 78.0);

        let cur = lists.relink(0x4b1803, TILE_NONE, a);
        assert!(lists.contains(cur, 0x4b1803));

        let cur = lists.relink(0x4b1803, cur, b);
        assert!(lists.contains(cur, 0x4b1803));
        assert!(!lists.contains(a, 0x4b1803));

        let cur = lists.relink(0x4b1803, cur, TILE_NONE);
        assert_eq!(cur, TILE_NONE);
        assert!(!lists.contains(b, 0x4b1803));
    }

    #[test]
    fn test_max_index_bound() {
        assert!(globe_index(90.0, 180.0) <= GLOBE_MAX_INDEX);
        assert!(globe_index(-90.0, -180.0) <= GLOBE_MAX_INDEX);
    }
}
