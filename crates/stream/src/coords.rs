//! World position → cell → grid conversion.
//!
//! A map is `MAX_NUMBER_OF_GRIDS` × `MAX_NUMBER_OF_GRIDS` grids, each grid is
//! `MAX_NUMBER_OF_CELLS` × `MAX_NUMBER_OF_CELLS` cells. World coordinate 0 sits
//! on the boundary between grid 31 and grid 32 on both axes.

use serde::{Deserialize, Serialize};

pub const MAX_NUMBER_OF_GRIDS: u32 = 64;
pub const SIZE_OF_GRIDS: f32 = 533.333_33;
pub const CENTER_GRID_ID: u32 = MAX_NUMBER_OF_GRIDS / 2;
pub const CENTER_GRID_OFFSET: f32 = SIZE_OF_GRIDS / 2.0;

pub const MAX_NUMBER_OF_CELLS: u32 = 8;
pub const SIZE_OF_GRID_CELL: f32 = SIZE_OF_GRIDS / MAX_NUMBER_OF_CELLS as f32;
pub const CENTER_GRID_CELL_ID: u32 = MAX_NUMBER_OF_CELLS * MAX_NUMBER_OF_GRIDS / 2;
pub const CENTER_GRID_CELL_OFFSET: f32 = SIZE_OF_GRID_CELL / 2.0;

pub const TOTAL_NUMBER_OF_CELLS_PER_MAP: u32 = MAX_NUMBER_OF_GRIDS * MAX_NUMBER_OF_CELLS;

pub const MAP_RESOLUTION: usize = 128;
pub const MAP_SIZE: f32 = SIZE_OF_GRIDS * MAX_NUMBER_OF_GRIDS as f32;
pub const MAP_HALFSIZE: f32 = MAP_SIZE / 2.0;

/// Errors from coordinate validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordError {
    #[error("world position ({x}, {y}) lies outside the map")]
    OutOfBounds { x: f32, y: f32 },
    #[error("cell [{x}, {y}] is outside 0..{TOTAL_NUMBER_OF_CELLS_PER_MAP}")]
    InvalidCell { x: u32, y: u32 },
    #[error("grid [{x}, {y}] is outside 0..{MAX_NUMBER_OF_GRIDS}")]
    InvalidGrid { x: u32, y: u32 },
}

/// Raw (unclamped) coordinate along one axis, or `None` when outside `0..limit`.
fn compute_axis(value: f32, center_offset: f32, size: f32, center_id: u32, limit: u32) -> Option<u32> {
    let offset = (f64::from(value) - f64::from(center_offset)) / f64::from(size);
    let raw = (offset + f64::from(center_id) + 0.5).floor();
    if !raw.is_finite() || raw < 0.0 || raw >= f64::from(limit) {
        return None;
    }
    Some(raw as u32)
}

/// Same as [`compute_axis`] but clamped into `0..limit`.
fn compute_axis_clamped(value: f32, center_offset: f32, size: f32, center_id: u32, limit: u32) -> u32 {
    let offset = (f64::from(value) - f64::from(center_offset)) / f64::from(size);
    let raw = (offset + f64::from(center_id) + 0.5).floor();
    if raw.is_nan() || raw < 0.0 {
        0
    } else if raw >= f64::from(limit) {
        limit - 1
    } else {
        raw as u32
    }
}

/// Global cell coordinate, validated to lie inside the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    x: u32,
    y: u32,
}

impl CellCoord {
    pub fn new(x: u32, y: u32) -> Result<Self, CoordError> {
        if x >= TOTAL_NUMBER_OF_CELLS_PER_MAP || y >= TOTAL_NUMBER_OF_CELLS_PER_MAP {
            return Err(CoordError::InvalidCell { x, y });
        }
        Ok(Self { x, y })
    }

    /// The cell containing world position `(x, y)`.
    pub fn from_world(x: f32, y: f32) -> Result<Self, CoordError> {
        let cx = compute_axis(
            x,
            CENTER_GRID_CELL_OFFSET,
            SIZE_OF_GRID_CELL,
            CENTER_GRID_CELL_ID,
            TOTAL_NUMBER_OF_CELLS_PER_MAP,
        );
        let cy = compute_axis(
            y,
            CENTER_GRID_CELL_OFFSET,
            SIZE_OF_GRID_CELL,
            CENTER_GRID_CELL_ID,
            TOTAL_NUMBER_OF_CELLS_PER_MAP,
        );
        match (cx, cy) {
            (Some(x_val), Some(y_val)) => Ok(Self { x: x_val, y: y_val }),
            _ => Err(CoordError::OutOfBounds { x, y }),
        }
    }

    /// Like [`CellCoord::from_world`] but clamps to the map edge instead of failing.
    pub fn from_world_clamped(x: f32, y: f32) -> Self {
        Self {
            x: compute_axis_clamped(
                x,
                CENTER_GRID_CELL_OFFSET,
                SIZE_OF_GRID_CELL,
                CENTER_GRID_CELL_ID,
                TOTAL_NUMBER_OF_CELLS_PER_MAP,
            ),
            y: compute_axis_clamped(
                y,
                CENTER_GRID_CELL_OFFSET,
                SIZE_OF_GRID_CELL,
                CENTER_GRID_CELL_ID,
                TOTAL_NUMBER_OF_CELLS_PER_MAP,
            ),
        }
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn grid(&self) -> GridCoord {
        GridCoord {
            x: self.x / MAX_NUMBER_OF_CELLS,
            y: self.y / MAX_NUMBER_OF_CELLS,
        }
    }

    /// Column of this cell inside its grid.
    pub fn local_x(&self) -> u32 {
        self.x % MAX_NUMBER_OF_CELLS
    }

    /// Row of this cell inside its grid.
    pub fn local_y(&self) -> u32 {
        self.y % MAX_NUMBER_OF_CELLS
    }

    /// Dense id, unique per map: `y * TOTAL_NUMBER_OF_CELLS_PER_MAP + x`.
    pub fn id(&self) -> u32 {
        self.y * TOTAL_NUMBER_OF_CELLS_PER_MAP + self.x
    }

    pub fn same_grid(&self, other: &CellCoord) -> bool {
        self.grid() == other.grid()
    }
}

impl std::fmt::Display for CellCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let grid = self.grid();
        write!(
            f,
            "grid[{},{}]cell[{},{}]",
            grid.x(),
            grid.y(),
            self.local_x(),
            self.local_y()
        )
    }
}

/// Grid coordinate, validated to lie inside the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCoord {
    x: u32,
    y: u32,
}

impl GridCoord {
    pub fn new(x: u32, y: u32) -> Result<Self, CoordError> {
        if x >= MAX_NUMBER_OF_GRIDS || y >= MAX_NUMBER_OF_GRIDS {
            return Err(CoordError::InvalidGrid { x, y });
        }
        Ok(Self { x, y })
    }

    pub fn from_world(x: f32, y: f32) -> Result<Self, CoordError> {
        let gx = compute_axis(x, CENTER_GRID_OFFSET, SIZE_OF_GRIDS, CENTER_GRID_ID, MAX_NUMBER_OF_GRIDS);
        let gy = compute_axis(y, CENTER_GRID_OFFSET, SIZE_OF_GRIDS, CENTER_GRID_ID, MAX_NUMBER_OF_GRIDS);
        match (gx, gy) {
            (Some(x_val), Some(y_val)) => Ok(Self { x: x_val, y: y_val }),
            _ => Err(CoordError::OutOfBounds { x, y }),
        }
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    /// Dense index into a `MAX_NUMBER_OF_GRIDS²` array.
    pub fn index(&self) -> usize {
        (self.x * MAX_NUMBER_OF_GRIDS + self.y) as usize
    }

    /// Terrain assets are indexed mirrored: grid (x, y) reads file tile (63-x, 63-y).
    pub fn terrain_tile(&self) -> (u32, u32) {
        (
            MAX_NUMBER_OF_GRIDS - 1 - self.x,
            MAX_NUMBER_OF_GRIDS - 1 - self.y,
        )
    }

    /// All cells belonging to this grid.
    pub fn cells(&self) -> CellArea {
        let low = CellCoord {
            x: self.x * MAX_NUMBER_OF_CELLS,
            y: self.y * MAX_NUMBER_OF_CELLS,
        };
        let high = CellCoord {
            x: low.x + MAX_NUMBER_OF_CELLS - 1,
            y: low.y + MAX_NUMBER_OF_CELLS - 1,
        };
        CellArea { low, high }
    }

    /// Every grid coordinate of a map, in index order.
    pub fn all() -> impl Iterator<Item = GridCoord> {
        (0..MAX_NUMBER_OF_GRIDS)
            .flat_map(|x| (0..MAX_NUMBER_OF_GRIDS).map(move |y| GridCoord { x, y }))
    }
}

impl std::fmt::Display for GridCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "grid[{},{}]", self.x, self.y)
    }
}

/// Inclusive rectangle of cells, always clamped to the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellArea {
    low: CellCoord,
    high: CellCoord,
}

impl CellArea {
    /// Cells that can contain anything within `radius` of `(x, y)`.
    ///
    /// A non-positive radius yields just the cell under the point.
    pub fn around(x: f32, y: f32, radius: f32) -> Self {
        if radius <= 0.0 {
            let center = CellCoord::from_world_clamped(x, y);
            return Self {
                low: center,
                high: center,
            };
        }
        Self {
            low: CellCoord::from_world_clamped(x - radius, y - radius),
            high: CellCoord::from_world_clamped(x + radius, y + radius),
        }
    }

    pub fn single(cell: CellCoord) -> Self {
        Self {
            low: cell,
            high: cell,
        }
    }

    /// Grow by `n` cells on every side, clamped to the map.
    pub fn expanded(&self, n: u32) -> Self {
        let max = TOTAL_NUMBER_OF_CELLS_PER_MAP - 1;
        Self {
            low: CellCoord {
                x: self.low.x.saturating_sub(n),
                y: self.low.y.saturating_sub(n),
            },
            high: CellCoord {
                x: self.high.x.saturating_add(n).min(max),
                y: self.high.y.saturating_add(n).min(max),
            },
        }
    }

    pub fn low(&self) -> CellCoord {
        self.low
    }

    pub fn high(&self) -> CellCoord {
        self.high
    }

    pub fn contains(&self, cell: CellCoord) -> bool {
        (self.low.x..=self.high.x).contains(&cell.x) && (self.low.y..=self.high.y).contains(&cell.y)
    }

    pub fn cell_count(&self) -> usize {
        ((self.high.x - self.low.x + 1) * (self.high.y - self.low.y + 1)) as usize
    }

    /// Cells column by column (x outer, y inner).
    pub fn iter(&self) -> impl Iterator<Item = CellCoord> + use<> {
        let (low, high) = (self.low, self.high);
        (low.x..=high.x).flat_map(move |x| (low.y..=high.y).map(move |y| CellCoord { x, y }))
    }

    /// Distinct grids touched by this area.
    pub fn grids(&self) -> impl Iterator<Item = GridCoord> + use<> {
        let (low, high) = (self.low.grid(), self.high.grid());
        (low.x..=high.x).flat_map(move |x| (low.y..=high.y).map(move |y| GridCoord { x, y }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_sits_on_center_grid_boundary() {
        let grid = GridCoord::from_world(1.0, 1.0).unwrap();
        assert_eq!((grid.x(), grid.y()), (CENTER_GRID_ID, CENTER_GRID_ID));
        let grid = GridCoord::from_world(-1.0, -1.0).unwrap();
        assert_eq!((grid.x(), grid.y()), (CENTER_GRID_ID - 1, CENTER_GRID_ID - 1));
    }

    #[test]
    fn cell_grid_agrees_with_direct_grid_computation() {
        let samples = [
            (0.5, 0.5),
            (-17000.0, 16999.0),
            (1234.5, -987.25),
            (SIZE_OF_GRIDS * 3.0 + 0.1, -SIZE_OF_GRIDS * 5.0 - 0.1),
        ];
        for (x, y) in samples {
            let cell = CellCoord::from_world(x, y).unwrap();
            assert_eq!(cell.grid(), GridCoord::from_world(x, y).unwrap(), "at ({x}, {y})");
        }
    }

    #[test]
    fn computation_is_idempotent() {
        let a = CellCoord::from_world(4321.0, -222.0).unwrap();
        let b = CellCoord::from_world(4321.0, -222.0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.grid(), b.grid());
    }

    #[test]
    fn adjacent_cells_differ_by_one_on_one_axis() {
        let a = CellCoord::from_world(10.0, 10.0).unwrap();
        let b = CellCoord::from_world(10.0 + SIZE_OF_GRID_CELL, 10.0).unwrap();
        assert_eq!(b.x(), a.x() + 1);
        assert_eq!(b.y(), a.y());
    }

    #[test]
    fn outside_positions_are_rejected_not_clamped() {
        assert!(CellCoord::from_world(MAP_HALFSIZE + 10.0, 0.0).is_err());
        assert!(CellCoord::from_world(0.0, -MAP_HALFSIZE - 10.0).is_err());
        assert!(CellCoord::from_world(f32::NAN, 0.0).is_err());
        assert!(GridCoord::new(MAX_NUMBER_OF_GRIDS, 0).is_err());
        assert!(CellCoord::new(0, TOTAL_NUMBER_OF_CELLS_PER_MAP).is_err());
    }

    #[test]
    fn local_cell_and_id() {
        let cell = CellCoord::new(259, 3).unwrap();
        assert_eq!(cell.grid(), GridCoord::new(32, 0).unwrap());
        assert_eq!((cell.local_x(), cell.local_y()), (3, 3));
        assert_eq!(cell.id(), 3 * TOTAL_NUMBER_OF_CELLS_PER_MAP + 259);
    }

    #[test]
    fn terrain_tile_is_mirrored() {
        let grid = GridCoord::new(30, 31).unwrap();
        assert_eq!(grid.terrain_tile(), (33, 32));
    }

    #[test]
    fn area_around_point_is_clamped_to_map() {
        let area = CellArea::around(MAP_HALFSIZE - 1.0, MAP_HALFSIZE - 1.0, 500.0);
        assert_eq!(area.high().x(), TOTAL_NUMBER_OF_CELLS_PER_MAP - 1);
        assert_eq!(area.high().y(), TOTAL_NUMBER_OF_CELLS_PER_MAP - 1);
        assert!(area.low().x() < area.high().x());
    }

    #[test]
    fn area_with_zero_radius_is_single_cell() {
        let area = CellArea::around(100.0, 100.0, 0.0);
        assert_eq!(area.cell_count(), 1);
        assert_eq!(area.low(), CellCoord::from_world(100.0, 100.0).unwrap());
    }

    #[test]
    fn area_iterates_every_cell_once() {
        let area = CellArea::single(CellCoord::new(10, 10).unwrap()).expanded(1);
        let cells: Vec<_> = area.iter().collect();
        assert_eq!(cells.len(), 9);
        assert_eq!(area.cell_count(), 9);
        assert!(cells.iter().all(|c| area.contains(*c)));
    }

    #[test]
    fn expanded_area_saturates_at_zero() {
        let area = CellArea::single(CellCoord::new(0, 1).unwrap()).expanded(3);
        assert_eq!(area.low().x(), 0);
        assert_eq!(area.low().y(), 0);
        assert_eq!(area.high().x(), 3);
        assert_eq!(area.high().y(), 4);
    }

    #[test]
    fn grid_cells_cover_exactly_the_grid() {
        let grid = GridCoord::new(5, 6).unwrap();
        let area = grid.cells();
        assert_eq!(area.cell_count(), (MAX_NUMBER_OF_CELLS * MAX_NUMBER_OF_CELLS) as usize);
        assert!(area.iter().all(|c| c.grid() == grid));
        assert_eq!(area.grids().collect::<Vec<_>>(), vec![grid]);
    }
}
