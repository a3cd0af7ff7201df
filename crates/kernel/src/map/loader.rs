//! Populating grids from spawn data and evacuating them on unload.

use worldgrid_common::{ObjectGuid, WorldPosition};
use worldgrid_stream::{CellCoord, GridCoord};

use super::{Map, MapEvent, TransferReason};
use crate::context::SimContext;
use crate::object::{Activatable, GridMember, ObjectKind, Positioned, WorldObject};
use crate::persistence::RespawnKind;

impl Map {
    /// Create the grid under `cell` if needed and populate it from spawn data
    /// once per load cycle. Returns whether this call did the populating.
    pub fn ensure_grid_loaded(&mut self, ctx: &SimContext, cell: CellCoord) -> bool {
        let coord = cell.grid();
        self.ensure_grid_created(ctx, coord);
        let Some(grid) = self.grid_mut(coord) else {
            return false;
        };
        if grid.is_objects_loaded() {
            return false;
        }
        // Set first so objects placed while loading do not re-enter the loader.
        grid.set_objects_loaded(true);
        let loaded = self.load_grid_objects(ctx, coord);
        tracing::debug!(map = self.id, instance = self.instance_id, %coord, objects = loaded, "grid loaded");
        self.record(MapEvent::GridLoaded { grid: coord, objects: loaded });
        true
    }

    fn load_grid_objects(&mut self, ctx: &SimContext, coord: GridCoord) -> usize {
        let now = ctx.now_secs();
        let mut loaded = 0;
        for record in ctx.spawns.spawns(self.id, self.difficulty, coord) {
            let mut obj = record.instantiate(self.id, self.instance_id);
            let dead_until = match obj.kind() {
                ObjectKind::Creature(c) => ctx.persistence.respawn_time(RespawnKind::Creature, c.db_guid, self.instance_id),
                ObjectKind::GameObject(g) => {
                    ctx.persistence.respawn_time(RespawnKind::GameObject, g.db_guid, self.instance_id)
                }
                _ => 0,
            };
            if dead_until > now {
                match obj.kind_mut() {
                    ObjectKind::Creature(c) => {
                        c.alive = false;
                        c.respawn_at = dead_until;
                    }
                    ObjectKind::GameObject(g) => {
                        g.spawned = false;
                        g.respawn_at = dead_until;
                    }
                    _ => {}
                }
            }
            if self.place_loaded(obj, coord) {
                loaded += 1;
            }
        }
        for corpse in ctx.spawns.corpses(self.id, self.instance_id, coord) {
            let position = WorldPosition {
                map_id: self.id,
                instance_id: self.instance_id,
                ..corpse.position
            };
            if self.place_loaded(WorldObject::corpse(corpse.low, corpse.owner, position), coord) {
                loaded += 1;
            }
        }
        loaded
    }

    /// Insert an object read by the loader. Loaded objects skip visibility
    /// work; the players that caused the load pick them up on their next
    /// visibility pass.
    fn place_loaded(&mut self, mut obj: WorldObject, coord: GridCoord) -> bool {
        let guid = obj.guid();
        let cell = match obj.computed_cell() {
            Ok(cell) if cell.grid() == coord => cell,
            _ => {
                tracing::error!(map = self.id, %guid, %coord, "spawn record lies outside the grid it was loaded for");
                return false;
            }
        };
        if self.objects.contains_key(&guid) {
            tracing::warn!(map = self.id, %guid, "spawn already present, skipping");
            return false;
        }
        obj.set_in_world(true);
        let active = obj.is_active();
        if let Some(script) = self.instance_script.as_mut() {
            script.on_object_create(&obj);
        }
        self.objects.insert(guid, obj);
        self.attach(guid, cell);
        if active {
            self.add_to_active(guid);
        }
        true
    }

    /// Evacuate and free one grid.
    ///
    /// Without `force` the unload is refused while an unload lock is held or
    /// a player or active object is within sight of the grid. Creatures that strayed from another grid
    /// are sent back to their respawn point first.
    pub fn unload_grid(&mut self, ctx: &SimContext, coord: GridCoord, force: bool) -> bool {
        if !self.is_grid_created(coord) {
            return true;
        }
        if !force && (self.grid_unload_lock(ctx, coord) || self.active_objects_near_grid(coord)) {
            return false;
        }
        let _span = tracing::info_span!("grid_unload", map = self.id, instance = self.instance_id, %coord).entered();

        self.remove_all_objects_in_remove_list(ctx);
        self.move_all_creatures_to_respawn(ctx, coord);
        self.remove_all_objects_in_remove_list(ctx);

        let residents: Vec<ObjectGuid> = self.grid(coord).map(|g| g.objects().collect()).unwrap_or_default();
        for guid in residents {
            if self.players.contains(&guid) {
                let home = self.objects.get(&guid).and_then(|p| p.as_player()).map(|p| p.homebind);
                if let Some(home) = home {
                    tracing::warn!(%guid, "player evicted by forced grid unload");
                    self.transfer_player(ctx, guid, home, TransferReason::Evicted);
                }
            } else {
                self.remove(ctx, guid, true);
            }
        }

        if let Some(grid) = self.grid(coord) {
            if grid.object_count() != 0 {
                tracing::error!(objects = grid.object_count(), "grid still populated after evacuation");
                debug_assert!(false, "grid not empty at unload");
            }
        }
        self.grids[coord.index()] = None;

        let key = self.terrain_key(coord);
        let dropped = if self.is_base_map() {
            ctx.terrain.unload(key)
        } else {
            ctx.terrain.release_shared(key)
        };
        if dropped && super::vmap_loading(ctx) {
            ctx.collision.unload_map(self.id, key.tile_x, key.tile_y);
        }
        tracing::debug!("grid unloaded");
        self.record(MapEvent::GridUnloaded(coord));
        true
    }

    /// Force-unload every grid.
    pub fn unload_all_grids(&mut self, ctx: &SimContext) {
        let coords: Vec<GridCoord> = self.grids().map(|g| g.coord()).collect();
        for coord in coords {
            self.unload_grid(ctx, coord, true);
        }
    }

    /// Send creatures in `coord` whose respawn point lies in another grid
    /// back there, or queue them for removal when that grid is not loaded.
    fn move_all_creatures_to_respawn(&mut self, ctx: &SimContext, coord: GridCoord) {
        let strays: Vec<ObjectGuid> = self
            .grid(coord)
            .into_iter()
            .flat_map(|g| g.objects())
            .filter(|guid| {
                self.objects.get(guid).and_then(WorldObject::respawn_position).is_some_and(|home| {
                    GridCoord::from_world(home.x(), home.y()).is_ok_and(|home_grid| home_grid != coord)
                })
            })
            .collect();
        for guid in strays {
            if !self.respawn_relocation(ctx, guid) {
                self.add_object_to_remove_list(guid);
            }
        }
    }

    /// Kill a spawned creature and hold it invisible until its respawn time.
    pub(super) fn despawn_until_respawn(&mut self, ctx: &SimContext, guid: ObjectGuid) {
        let now = ctx.now_secs();
        let Some(obj) = self.objects.get_mut(&guid) else {
            return;
        };
        let Some(c) = obj.as_creature_mut() else {
            return;
        };
        c.alive = false;
        c.in_combat = false;
        c.summon_timer = None;
        c.despawn_timer = None;
        c.respawn_at = now + u64::from(c.respawn_delay_secs.max(1));
        tracing::debug!(map = self.id, %guid, respawn_at = c.respawn_at, "creature despawned");
        if ctx.config.save_respawn_time_immediately {
            let obj = &self.objects[&guid];
            self.save_respawn_time(ctx, obj);
        }
        self.update_object_visibility(ctx, guid);
    }

    /// Bring a dead creature or unspawned game object back.
    pub(super) fn respawn_now(ctx: &SimContext, instance_id: u32, obj: &mut WorldObject) {
        let kind = match obj.kind_mut() {
            ObjectKind::Creature(c) => {
                c.alive = true;
                c.respawn_at = 0;
                (RespawnKind::Creature, c.db_guid)
            }
            ObjectKind::GameObject(g) => {
                g.spawned = true;
                g.respawn_at = 0;
                (RespawnKind::GameObject, g.db_guid)
            }
            _ => return,
        };
        tracing::debug!(guid = %obj.guid(), "respawned");
        if let Err(e) = ctx.persistence.save_respawn_time(kind.0, kind.1, instance_id, 0) {
            tracing::error!(guid = %obj.guid(), error = %e, "failed to clear respawn time");
        }
    }

    /// Write a pending respawn time of a spawned object.
    pub(super) fn save_respawn_time(&self, ctx: &SimContext, obj: &WorldObject) {
        let (kind, db_guid) = match obj.kind() {
            ObjectKind::Creature(c) if c.db_guid != 0 && !c.pet => (RespawnKind::Creature, c.db_guid),
            ObjectKind::GameObject(g) if g.db_guid != 0 => (RespawnKind::GameObject, g.db_guid),
            _ => return,
        };
        let at = obj.respawn_at();
        if at <= ctx.now_secs() {
            return;
        }
        if let Err(e) = ctx.persistence.save_respawn_time(kind, db_guid, self.instance_id, at) {
            tracing::error!(map = self.id, guid = %obj.guid(), error = %e, "failed to save respawn time");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use worldgrid_common::Difficulty;
    use worldgrid_stream::GridState;

    use super::super::test_support::*;
    use crate::config::WorldConfig;
    use crate::context::{GameClock, SpawnRecord, StaticSpawns};
    use crate::map::Map;
    use crate::object::WorldObject;
    use crate::persistence::{MemoryPersistence, Persistence, RespawnKind};

    use super::*;

    fn spawns() -> StaticSpawns {
        StaticSpawns::new()
            .with_spawn(
                Difficulty::REGULAR,
                SpawnRecord::Creature {
                    db_guid: 100,
                    entry: 40,
                    position: at(0, point_in(30, 30, 2, 2)),
                    respawn_delay_secs: 60,
                    active: false,
                },
            )
            .with_spawn(
                Difficulty::REGULAR,
                SpawnRecord::Creature {
                    db_guid: 101,
                    entry: 40,
                    position: at(0, point_in(30, 30, 6, 6)),
                    respawn_delay_secs: 60,
                    active: false,
                },
            )
    }

    #[test]
    fn grid_loads_spawns_once() {
        let h = harness(WorldConfig::default());
        let ctx = h.ctx.clone().with_spawns(Arc::new(spawns()));
        let mut map = Map::new(&ctx, &continent(), 0, Difficulty::REGULAR);
        let cell = CellCoord::from_world(point_in(30, 30, 0, 0).0, point_in(30, 30, 0, 0).1).unwrap();
        assert!(map.ensure_grid_loaded(&ctx, cell));
        assert!(!map.ensure_grid_loaded(&ctx, cell));
        assert_eq!(map.object_count(), 2);
        assert!(map.is_grid_loaded(cell.grid()));
    }

    #[test]
    fn dead_spawns_load_invisible() {
        let h = harness(WorldConfig::default());
        let persistence = Arc::new(MemoryPersistence::new());
        persistence.save_respawn_time(RespawnKind::Creature, 100, 0, 5_000).unwrap();
        let ctx = h.ctx.clone().with_spawns(Arc::new(spawns())).with_persistence(persistence);
        let mut map = Map::new(&ctx, &continent(), 0, Difficulty::REGULAR);
        let (x, y) = point_in(30, 30, 2, 2);
        map.ensure_grid_loaded(&ctx, CellCoord::from_world(x, y).unwrap());
        let dead = map.objects().find(|o| o.db_guid() == 100).unwrap();
        assert!(!dead.is_alive());
        assert_eq!(dead.respawn_at(), 5_000);
    }

    #[test]
    fn locked_grid_refuses_unforced_unload() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let home = point_in(30, 30, 1, 1);
        map.load_grid(&h.ctx, CellCoord::from_world(home.0, home.1).unwrap(), true);
        let coord = GridCoord::new(30, 30).unwrap();
        assert!(map.grid_unload_lock(&h.ctx, coord));

        // The state handlers never unload a locked grid.
        for _ in 0..4 {
            map.update(&h.ctx, 400_000);
        }
        assert!(map.is_grid_created(coord));

        assert!(!map.active_objects_near_grid(coord));
        assert!(!map.unload_grid(&h.ctx, coord, false));
        assert!(map.is_grid_created(coord));
        assert!(map.unload_grid(&h.ctx, coord, true));
    }

    #[test]
    fn active_lock_alone_refuses_unforced_unload() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let spot = point_in(30, 30, 1, 1);
        map.load_grid(&h.ctx, CellCoord::from_world(spot.0, spot.1).unwrap(), false);
        let coord = GridCoord::new(30, 30).unwrap();
        assert!(!map.grid_unload_lock(&h.ctx, coord));

        map.grid_mut(coord).unwrap().info_mut().inc_unload_active_lock();
        assert!(!map.grid(coord).unwrap().info().explicit_lock());
        assert!(map.grid_unload_lock(&h.ctx, coord));
        assert!(!map.active_objects_near_grid(coord));
        assert!(!map.unload_grid(&h.ctx, coord, false));
        assert!(map.is_grid_created(coord));

        map.grid_mut(coord).unwrap().info_mut().dec_unload_active_lock();
        assert!(map.unload_grid(&h.ctx, coord, false));
        assert!(!map.is_grid_created(coord));
    }

    #[test]
    fn far_away_active_creature_pins_its_respawn_grid() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let creature = WorldObject::spawned_creature(10, 3, at(0, point_in(30, 30, 1, 1))).with_active(true);
        let guid = creature.guid();
        map.add(&h.ctx, creature).unwrap();
        let home = GridCoord::new(30, 30).unwrap();

        // Walk it six grids away; its respawn point stays behind.
        let (x, y) = point_in(36, 36, 4, 4);
        map.relocate(&h.ctx, guid, x, y, 0.0, 0.0).unwrap();
        assert_eq!(map.object(guid).unwrap().computed_cell().unwrap().grid(), GridCoord::new(36, 36).unwrap());
        assert!(!map.active_objects_near_grid(home));
        assert_eq!(map.grid(home).unwrap().info().active_lock_count(), 1);

        // Plenty of expiries pass; the state handlers must leave the home grid alone.
        for _ in 0..8 {
            map.update(&h.ctx, 400_000);
        }
        assert!(map.is_grid_created(home));
        assert!(!map.unload_grid(&h.ctx, home, false));

        map.set_active(guid, false).unwrap();
        assert!(!map.grid_unload_lock(&h.ctx, home));
        assert!(map.unload_grid(&h.ctx, home, false));
    }

    #[test]
    fn unload_refused_while_player_nearby() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        map.add(&h.ctx, WorldObject::player(1, "Ana", at(0, point_in(30, 30, 4, 4)))).unwrap();
        let coord = GridCoord::new(30, 30).unwrap();
        assert!(!map.unload_grid(&h.ctx, coord, false));
        assert_eq!(map.grid(coord).unwrap().state(), GridState::Active);
    }

    #[test]
    fn forced_unload_evicts_players_and_frees_the_page() {
        let h = harness(WorldConfig::default());
        let ctx = h.ctx.clone().with_spawns(Arc::new(spawns()));
        let mut map = Map::new(&ctx, &continent(), 0, Difficulty::REGULAR);
        let player = WorldObject::player(1, "Ana", at(0, point_in(30, 30, 4, 4)));
        let guid = player.guid();
        map.add(&ctx, player).unwrap();
        let coord = GridCoord::new(30, 30).unwrap();
        let key = map.terrain_key(coord);
        assert!(ctx.terrain.is_loaded(key));

        assert!(map.unload_grid(&ctx, coord, true));
        assert!(!map.is_grid_created(coord));
        assert_eq!(map.object_count(), 0);
        assert!(!ctx.terrain.is_loaded(key));
        let transfers = map.take_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].player.guid(), guid);
        assert_eq!(transfers[0].reason, TransferReason::Evicted);
    }

    #[test]
    fn base_page_stays_while_an_instance_shares_it() {
        let h = harness(WorldConfig::default());
        let entry = dungeon(5);
        let mut base = Map::new(&h.ctx, &entry, 0, Difficulty::REGULAR);
        let mut instance = Map::new(&h.ctx, &entry, 3, Difficulty::REGULAR);
        let coord = GridCoord::new(32, 32).unwrap();
        base.ensure_grid_created(&h.ctx, coord);
        instance.ensure_grid_created(&h.ctx, coord);
        assert!(base.grid_unload_lock(&h.ctx, coord));
        assert!(!base.unload_grid(&h.ctx, coord, false));

        assert!(instance.unload_grid(&h.ctx, coord, false));
        assert!(!base.grid_unload_lock(&h.ctx, coord));
        assert!(base.unload_grid(&h.ctx, coord, false));
        assert!(!h.ctx.terrain.is_loaded(base.terrain_key(coord)));
    }

    #[test]
    fn despawned_creature_respawns_after_its_delay() {
        let h = harness(WorldConfig::default());
        let ctx = h.ctx.clone().with_spawns(Arc::new(spawns()));
        let mut map = Map::new(&ctx, &continent(), 0, Difficulty::REGULAR);
        let player = WorldObject::player(1, "Ana", at(0, point_in(30, 30, 2, 3)));
        map.add(&ctx, player).unwrap();
        let guid = map.objects().find(|o| o.db_guid() == 100).unwrap().guid();

        map.despawn_until_respawn(&ctx, guid);
        assert!(!map.object(guid).unwrap().is_alive());
        assert_eq!(
            ctx.persistence.respawn_time(RespawnKind::Creature, 100, 0),
            h.clock.now_secs() + 60
        );

        h.clock.advance(61);
        map.update(&ctx, 100);
        assert!(map.object(guid).unwrap().is_alive());
        assert_eq!(ctx.persistence.respawn_time(RespawnKind::Creature, 100, 0), 0);
    }
}
