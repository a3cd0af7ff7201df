use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::page::VMAP_INVALID_HEIGHT_VALUE;

/// Outcome of asking the collision layer to load a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmapLoadResult {
    Ok,
    Error,
    Ignored,
}

/// Line-of-sight / collision-geometry service keyed by (map, tile x, tile y).
///
/// Loads and unloads are issued when a terrain page enters or leaves the
/// shared store, once per page however many maps share it. Failures are
/// logged by the caller and never block the simulation.
pub trait CollisionManager: Send + Sync {
    fn is_loading_enabled(&self) -> bool;

    fn is_height_enabled(&self) -> bool;

    fn load_map(&self, base_dir: &Path, map_id: u32, tile_x: u32, tile_y: u32) -> VmapLoadResult;

    fn unload_map(&self, map_id: u32, tile_x: u32, tile_y: u32);

    fn exists_map(&self, base_dir: &Path, map_id: u32, tile_x: u32, tile_y: u32) -> bool;

    /// Nearest collision surface at or below `z`, or [`VMAP_INVALID_HEIGHT_VALUE`].
    fn height(&self, map_id: u32, x: f32, y: f32, z: f32) -> f32;
}

/// Collision layer that has nothing loaded and answers every height query as invalid.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCollision;

impl CollisionManager for NullCollision {
    fn is_loading_enabled(&self) -> bool {
        false
    }

    fn is_height_enabled(&self) -> bool {
        false
    }

    fn load_map(&self, _base_dir: &Path, _map_id: u32, _tile_x: u32, _tile_y: u32) -> VmapLoadResult {
        VmapLoadResult::Ignored
    }

    fn unload_map(&self, _map_id: u32, _tile_x: u32, _tile_y: u32) {}

    fn exists_map(&self, _base_dir: &Path, _map_id: u32, _tile_x: u32, _tile_y: u32) -> bool {
        true
    }

    fn height(&self, _map_id: u32, _x: f32, _y: f32, _z: f32) -> f32 {
        VMAP_INVALID_HEIGHT_VALUE
    }
}

/// Collision double that tracks loaded tiles and reports a single floor height.
#[derive(Debug)]
pub struct FlatCollision {
    floor: Option<f32>,
    loaded: Mutex<BTreeSet<(u32, u32, u32)>>,
    load_calls: AtomicUsize,
}

impl FlatCollision {
    /// `floor` of `None` means no geometry anywhere.
    pub fn new(floor: Option<f32>) -> Self {
        Self {
            floor,
            loaded: Mutex::new(BTreeSet::new()),
            load_calls: AtomicUsize::new(0),
        }
    }

    pub fn is_loaded(&self, map_id: u32, tile_x: u32, tile_y: u32) -> bool {
        self.loaded.lock().contains(&(map_id, tile_x, tile_y))
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().len()
    }

    /// Total `load_map` calls seen, including repeats for a loaded tile.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::Relaxed)
    }
}

impl CollisionManager for FlatCollision {
    fn is_loading_enabled(&self) -> bool {
        true
    }

    fn is_height_enabled(&self) -> bool {
        true
    }

    fn load_map(&self, _base_dir: &Path, map_id: u32, tile_x: u32, tile_y: u32) -> VmapLoadResult {
        self.load_calls.fetch_add(1, Ordering::Relaxed);
        self.loaded.lock().insert((map_id, tile_x, tile_y));
        VmapLoadResult::Ok
    }

    fn unload_map(&self, map_id: u32, tile_x: u32, tile_y: u32) {
        self.loaded.lock().remove(&(map_id, tile_x, tile_y));
    }

    fn exists_map(&self, _base_dir: &Path, _map_id: u32, _tile_x: u32, _tile_y: u32) -> bool {
        true
    }

    fn height(&self, _map_id: u32, _x: f32, _y: f32, z: f32) -> f32 {
        match self.floor {
            Some(floor) if floor <= z => floor,
            _ => VMAP_INVALID_HEIGHT_VALUE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_collision_has_no_heights() {
        let c = NullCollision;
        assert_eq!(c.height(0, 1.0, 2.0, 3.0), VMAP_INVALID_HEIGHT_VALUE);
        assert_eq!(c.load_map(Path::new("."), 0, 1, 1), VmapLoadResult::Ignored);
    }

    #[test]
    fn flat_collision_tracks_tiles() {
        let c = FlatCollision::new(Some(5.0));
        c.load_map(Path::new("."), 1, 2, 3);
        assert!(c.is_loaded(1, 2, 3));
        c.unload_map(1, 2, 3);
        assert_eq!(c.loaded_count(), 0);
        assert_eq!(c.height(1, 0.0, 0.0, 10.0), 5.0);
        assert_eq!(c.height(1, 0.0, 0.0, 4.0), VMAP_INVALID_HEIGHT_VALUE);
    }
}
