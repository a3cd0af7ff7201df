//! Spatial partition of a map: coordinates, cell areas, grid lifecycle state.
//!
//! # Invariants
//! - A world position maps to at most one cell; cells outside the map are rejected.
//! - A cell's grid is always `cell / MAX_NUMBER_OF_CELLS` on both axes.
//! - Areas are clamped to the map and never empty.

mod coords;
mod state;
mod timer;

pub use coords::{
    CENTER_GRID_CELL_ID, CENTER_GRID_CELL_OFFSET, CENTER_GRID_ID, CENTER_GRID_OFFSET, CellArea,
    CellCoord, CoordError, GridCoord, MAP_HALFSIZE, MAP_RESOLUTION, MAP_SIZE, MAX_NUMBER_OF_CELLS,
    MAX_NUMBER_OF_GRIDS, SIZE_OF_GRID_CELL, SIZE_OF_GRIDS, TOTAL_NUMBER_OF_CELLS_PER_MAP,
};
pub use state::{CellMarks, GridState};
pub use timer::{TickTimer, TimeTracker};
