//! Grid containers: an 8×8 block of cells, a lifecycle state and the
//! keep-loaded locks.

use std::collections::BTreeSet;
use std::sync::Arc;

use worldgrid_common::ObjectGuid;
use worldgrid_stream::{CellCoord, GridCoord, GridState, MAX_NUMBER_OF_CELLS, TimeTracker};
use worldgrid_terrain::TerrainPage;

const CELLS_PER_GRID: usize = (MAX_NUMBER_OF_CELLS * MAX_NUMBER_OF_CELLS) as usize;

/// Expiry timer and unload locks of one grid.
#[derive(Debug, Clone)]
pub struct GridInfo {
    timer: TimeTracker,
    unload_explicit_lock: bool,
    unload_active_lock: u32,
}

impl GridInfo {
    pub fn new(expiry_ms: u64, unload: bool) -> Self {
        Self {
            timer: TimeTracker::new(expiry_ms),
            unload_explicit_lock: !unload,
            unload_active_lock: 0,
        }
    }

    pub fn timer(&self) -> &TimeTracker {
        &self.timer
    }

    pub fn update_timer(&mut self, diff_ms: u64) {
        self.timer.update(diff_ms);
    }

    pub fn reset_timer(&mut self, expiry_ms: u64) {
        self.timer.reset(expiry_ms);
    }

    pub fn explicit_lock(&self) -> bool {
        self.unload_explicit_lock
    }

    pub fn active_lock_count(&self) -> u32 {
        self.unload_active_lock
    }

    /// Whether either local lock keeps the grid loaded.
    pub fn unload_lock(&self) -> bool {
        self.unload_explicit_lock || self.unload_active_lock > 0
    }

    pub fn set_unload_explicit_lock(&mut self, on: bool) {
        self.unload_explicit_lock = on;
    }

    pub fn inc_unload_active_lock(&mut self) {
        self.unload_active_lock += 1;
    }

    pub fn dec_unload_active_lock(&mut self) {
        if self.unload_active_lock == 0 {
            tracing::error!("grid active lock released more often than taken");
            return;
        }
        self.unload_active_lock -= 1;
    }
}

/// One loaded grid of a map.
#[derive(Debug)]
pub struct NGrid {
    coord: GridCoord,
    state: GridState,
    info: GridInfo,
    objects_loaded: bool,
    cells: Vec<BTreeSet<ObjectGuid>>,
    terrain: Arc<TerrainPage>,
}

impl NGrid {
    pub fn new(coord: GridCoord, expiry_ms: u64, unload: bool, terrain: Arc<TerrainPage>) -> Self {
        Self {
            coord,
            state: GridState::Invalid,
            info: GridInfo::new(expiry_ms, unload),
            objects_loaded: false,
            cells: vec![BTreeSet::new(); CELLS_PER_GRID],
            terrain,
        }
    }

    pub fn coord(&self) -> GridCoord {
        self.coord
    }

    pub fn state(&self) -> GridState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: GridState) {
        self.state = state;
    }

    pub fn info(&self) -> &GridInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut GridInfo {
        &mut self.info
    }

    /// Whether spawn data has been populated this load cycle.
    pub fn is_objects_loaded(&self) -> bool {
        self.objects_loaded
    }

    pub(crate) fn set_objects_loaded(&mut self, loaded: bool) {
        self.objects_loaded = loaded;
    }

    pub fn terrain(&self) -> &Arc<TerrainPage> {
        &self.terrain
    }

    fn slot(&self, cell: CellCoord) -> Option<usize> {
        if cell.grid() != self.coord {
            tracing::error!(
                grid_x = self.coord.x(),
                grid_y = self.coord.y(),
                cell_x = cell.x(),
                cell_y = cell.y(),
                "cell does not belong to this grid"
            );
            debug_assert!(false, "cell outside grid");
            return None;
        }
        Some((cell.local_y() * MAX_NUMBER_OF_CELLS + cell.local_x()) as usize)
    }

    pub(crate) fn add_object(&mut self, cell: CellCoord, guid: ObjectGuid) -> bool {
        match self.slot(cell) {
            Some(i) => self.cells[i].insert(guid),
            None => false,
        }
    }

    pub(crate) fn remove_object(&mut self, cell: CellCoord, guid: ObjectGuid) -> bool {
        match self.slot(cell) {
            Some(i) => self.cells[i].remove(&guid),
            None => false,
        }
    }

    pub fn cell_objects(&self, cell: CellCoord) -> impl Iterator<Item = ObjectGuid> + '_ {
        let slot = if cell.grid() == self.coord {
            Some((cell.local_y() * MAX_NUMBER_OF_CELLS + cell.local_x()) as usize)
        } else {
            None
        };
        slot.into_iter()
            .flat_map(move |i| self.cells[i].iter().copied())
    }

    pub fn contains(&self, cell: CellCoord, guid: ObjectGuid) -> bool {
        self.cell_objects(cell).any(|g| g == guid)
    }

    /// Every object in the grid, cell by cell.
    pub fn objects(&self) -> impl Iterator<Item = ObjectGuid> + '_ {
        self.cells.iter().flat_map(|c| c.iter().copied())
    }

    pub fn object_count(&self) -> usize {
        self.cells.iter().map(BTreeSet::len).sum()
    }
}
