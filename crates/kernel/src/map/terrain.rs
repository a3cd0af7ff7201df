//! Height, area and liquid queries against the map's terrain pages.
//!
//! Queries never create grids: they read the page of a created grid, or a
//! page some other map of the same world already holds.

use std::sync::Arc;

use worldgrid_stream::GridCoord;
use worldgrid_terrain::{
    INVALID_HEIGHT, LiquidData, LiquidStatus, MAP_ALL_LIQUIDS, MAP_LIQUID_TYPE_OCEAN, MAP_LIQUID_TYPE_WATER,
    MAX_HEIGHT, TerrainPage, VMAP_INVALID_HEIGHT_VALUE,
};

use super::Map;
use crate::context::SimContext;

impl Map {
    fn terrain_page(&self, ctx: &SimContext, x: f32, y: f32) -> Option<Arc<TerrainPage>> {
        let coord = GridCoord::from_world(x, y).ok()?;
        match self.grid(coord) {
            Some(grid) => Some(Arc::clone(grid.terrain())),
            None => ctx.terrain.get(self.terrain_key(coord)),
        }
    }

    /// Floor height at `(x, y)` below `z`.
    ///
    /// Terrain answers when the point is not more than 2 units under its
    /// surface; the collision layer, when enabled and `use_vmaps` is set,
    /// answers for the closest floor at or below `z + 2`. When both answer,
    /// the collision floor wins if the point is under the terrain, the floor
    /// is above the terrain, or the floor is closer to `z`.
    pub fn height(&self, ctx: &SimContext, x: f32, y: f32, z: f32, use_vmaps: bool) -> f32 {
        let map_height = match self.terrain_page(ctx, x, y) {
            Some(page) => {
                let surface = page.height(x, y);
                if z + 2.0 > surface { surface } else { VMAP_INVALID_HEIGHT_VALUE }
            }
            None => VMAP_INVALID_HEIGHT_VALUE,
        };

        let vmap_height = if use_vmaps && ctx.config.vmap_height_enabled && ctx.collision.is_height_enabled() {
            ctx.collision.height(self.id, x, y, z + 2.0)
        } else {
            VMAP_INVALID_HEIGHT_VALUE
        };

        if vmap_height > INVALID_HEIGHT {
            if map_height > INVALID_HEIGHT {
                if z < map_height || vmap_height > map_height || (map_height - z).abs() > (vmap_height - z).abs() {
                    vmap_height
                } else {
                    map_height
                }
            } else {
                vmap_height
            }
        } else if !use_vmaps {
            map_height
        } else if map_height > INVALID_HEIGHT && (z < map_height + 2.0 || z == MAX_HEIGHT) {
            map_height
        } else {
            VMAP_INVALID_HEIGHT_VALUE
        }
    }

    /// Area exploration flag; the map's default where no page is present.
    pub fn area_flag(&self, ctx: &SimContext, x: f32, y: f32) -> u16 {
        match self.terrain_page(ctx, x, y) {
            Some(page) => page.area(x, y),
            None => self.entry.default_area_flag,
        }
    }

    pub fn terrain_type(&self, ctx: &SimContext, x: f32, y: f32) -> u8 {
        self.terrain_page(ctx, x, y).map_or(0, |page| page.terrain_type(x, y))
    }

    pub fn liquid_status(
        &self,
        ctx: &SimContext,
        x: f32,
        y: f32,
        z: f32,
        required_type: u8,
    ) -> (LiquidStatus, Option<LiquidData>) {
        match self.terrain_page(ctx, x, y) {
            Some(page) => page.liquid_status(x, y, z, required_type),
            None => (LiquidStatus::NoWater, None),
        }
    }

    pub fn water_level(&self, ctx: &SimContext, x: f32, y: f32) -> f32 {
        self.terrain_page(ctx, x, y).map_or(0.0, |page| page.liquid_level(x, y))
    }

    /// Deep enough liquid to swim in.
    pub fn is_in_water(&self, ctx: &SimContext, x: f32, y: f32, z: f32) -> bool {
        match self.liquid_status(ctx, x, y, z, MAP_ALL_LIQUIDS) {
            (LiquidStatus::NoWater, _) | (_, None) => false,
            (_, Some(liquid)) => liquid.level - liquid.depth_level > 2.0,
        }
    }

    pub fn is_under_water(&self, ctx: &SimContext, x: f32, y: f32, z: f32) -> bool {
        self.liquid_status(ctx, x, y, z, MAP_LIQUID_TYPE_WATER | MAP_LIQUID_TYPE_OCEAN)
            .0
            .is_under_water()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use worldgrid_common::Difficulty;
    use worldgrid_terrain::FlatCollision;
    use worldgrid_terrain::format::MapFileBuilder;

    use super::super::test_support::*;
    use super::*;
    use crate::config::WorldConfig;
    use crate::object::WorldObject;

    fn world(dir: &std::path::Path, floor: Option<f32>) -> SimContext {
        let config = WorldConfig {
            data_path: dir.to_path_buf(),
            vmap_enabled: true,
            vmap_height_enabled: true,
            ..WorldConfig::default()
        };
        SimContext::new(config).with_collision(Arc::new(FlatCollision::new(floor)))
    }

    fn write_flat_page(ctx: &SimContext, coord: GridCoord, height: f32) {
        let (tile_x, tile_y) = coord.terrain_tile();
        let path = ctx
            .terrain
            .loader()
            .map_file_path(worldgrid_terrain::TerrainKey::new(0, tile_x, tile_y));
        MapFileBuilder::flat(1, height).write_to(path).unwrap();
    }

    #[test]
    fn terrain_height_answers_above_the_surface() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = world(dir.path(), None);
        let coord = GridCoord::new(32, 32).unwrap();
        write_flat_page(&ctx, coord, 10.0);
        let mut map = Map::new(&ctx, &continent(), 0, Difficulty::REGULAR);
        let (x, y) = point_in(32, 32, 2, 2);
        map.add(&ctx, WorldObject::player(1, "Ana", at(0, (x, y)))).unwrap();

        assert_eq!(map.height(&ctx, x, y, 20.0, false), 10.0);
        assert_eq!(map.height(&ctx, x, y, 5.0, false), VMAP_INVALID_HEIGHT_VALUE);
        assert_eq!(map.height(&ctx, x, y, MAX_HEIGHT, true), 10.0);
    }

    #[test]
    fn collision_floor_above_terrain_wins() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = world(dir.path(), Some(15.0));
        let coord = GridCoord::new(32, 32).unwrap();
        write_flat_page(&ctx, coord, 10.0);
        let mut map = Map::new(&ctx, &continent(), 0, Difficulty::REGULAR);
        let (x, y) = point_in(32, 32, 2, 2);
        map.add(&ctx, WorldObject::player(1, "Ana", at(0, (x, y)))).unwrap();

        assert_eq!(map.height(&ctx, x, y, 20.0, true), 15.0);
        // Too low for the floor: terrain only.
        assert_eq!(map.height(&ctx, x, y, 11.0, true), 10.0);
    }

    #[test]
    fn grid_creation_loads_collision_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let collision = Arc::new(FlatCollision::new(None));
        let ctx = world(dir.path(), None).with_collision(collision.clone());
        let mut map = Map::new(&ctx, &continent(), 0, Difficulty::REGULAR);
        let coord = GridCoord::new(32, 32).unwrap();
        map.ensure_grid_created(&ctx, coord);
        assert!(collision.is_loaded(0, 31, 31));
        map.unload_grid(&ctx, coord, true);
        assert_eq!(collision.loaded_count(), 0);
    }

    #[test]
    fn shared_page_loads_collision_once() {
        let dir = tempfile::tempdir().unwrap();
        let collision = Arc::new(FlatCollision::new(None));
        let ctx = world(dir.path(), None).with_collision(collision.clone());
        let entry = dungeon(5);
        let mut instance = Map::new(&ctx, &entry, 3, Difficulty::REGULAR);
        let mut base = Map::new(&ctx, &entry, 0, Difficulty::REGULAR);
        let coord = GridCoord::new(32, 32).unwrap();

        instance.ensure_grid_created(&ctx, coord);
        base.ensure_grid_created(&ctx, coord);
        assert_eq!(collision.load_calls(), 1);

        assert!(base.unload_grid(&ctx, coord, true));
        assert!(collision.is_loaded(entry.id, 31, 31));
        assert!(instance.unload_grid(&ctx, coord, true));
        assert_eq!(collision.loaded_count(), 0);
    }

    #[test]
    fn missing_pages_fall_back_to_defaults() {
        let h = harness(WorldConfig::default());
        let mut entry = continent();
        entry.default_area_flag = 12;
        let map = Map::new(&h.ctx, &entry, 0, Difficulty::REGULAR);
        let (x, y) = point_in(32, 32, 0, 0);
        assert_eq!(map.area_flag(&h.ctx, x, y), 12);
        assert_eq!(map.terrain_type(&h.ctx, x, y), 0);
        assert_eq!(map.water_level(&h.ctx, x, y), 0.0);
        assert!(!map.is_in_water(&h.ctx, x, y, 0.0));
        assert!(!map.is_under_water(&h.ctx, x, y, 0.0));
    }
}
