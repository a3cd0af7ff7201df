use serde::{Deserialize, Serialize};

use crate::coords::{CellCoord, TOTAL_NUMBER_OF_CELLS_PER_MAP};

/// Lifecycle state of a loaded grid.
///
/// Active grids are near players or active objects. Idle grids have been
/// quiet for one full expiry and are about to be scheduled for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GridState {
    #[default]
    Invalid,
    Active,
    Idle,
    Removal,
}

impl GridState {
    pub const COUNT: usize = 4;
    pub const ALL: [GridState; Self::COUNT] = [
        GridState::Invalid,
        GridState::Active,
        GridState::Idle,
        GridState::Removal,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

const MARK_WORDS: usize =
    (TOTAL_NUMBER_OF_CELLS_PER_MAP as usize * TOTAL_NUMBER_OF_CELLS_PER_MAP as usize) / 64;

/// One bit per cell of a map: which cells were already visited this tick.
pub struct CellMarks {
    bits: Box<[u64]>,
}

impl CellMarks {
    pub fn new() -> Self {
        Self {
            bits: vec![0u64; MARK_WORDS].into_boxed_slice(),
        }
    }

    pub fn reset(&mut self) {
        self.bits.fill(0);
    }

    pub fn is_marked(&self, cell: CellCoord) -> bool {
        let id = cell.id() as usize;
        self.bits[id / 64] & (1 << (id % 64)) != 0
    }

    /// Mark `cell`; returns `false` if it was already marked.
    pub fn mark(&mut self, cell: CellCoord) -> bool {
        let id = cell.id() as usize;
        let word = &mut self.bits[id / 64];
        let bit = 1u64 << (id % 64);
        let fresh = *word & bit == 0;
        *word |= bit;
        fresh
    }

    pub fn marked_count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl Default for CellMarks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CellMarks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellMarks")
            .field("marked", &self.marked_count())
            .finish()
    }
}
