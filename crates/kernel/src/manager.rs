//! Owns every live map: creates continents and instance copies on demand,
//! drives their updates, moves players between them and discards instances
//! whose unload countdown ran out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use worldgrid_common::Difficulty;
use worldgrid_stream::TickTimer;

use crate::context::SimContext;
use crate::error::{MapError, Rejected};
use crate::map::{Map, MapKind, Transfer};
use crate::message::{ClientMessage, TransferAbortReason};
use crate::object::WorldObject;

const TICK_HISTORY: usize = 64;

/// A map behind its guard. Structural changes (adds, removals, grid
/// creation, admission) happen with the guard held.
pub type SharedMap = Arc<Mutex<Map>>;

/// Tick duration statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickStats {
    pub ticks: u64,
    pub last: Duration,
    pub average: Duration,
    pub max: Duration,
}

pub struct MapManager {
    ctx: SimContext,
    maps: BTreeMap<(u32, u32), SharedMap>,
    ticks: u64,
    last_tick: Duration,
    timings: TickTimer,
}

impl MapManager {
    pub fn new(ctx: SimContext) -> Self {
        Self {
            ctx,
            maps: BTreeMap::new(),
            ticks: 0,
            last_tick: Duration::ZERO,
            timings: TickTimer::new(TICK_HISTORY),
        }
    }

    pub fn context(&self) -> &SimContext {
        &self.ctx
    }

    pub fn map_count(&self) -> usize {
        self.maps.len()
    }

    pub fn instance_count(&self) -> usize {
        self.maps.keys().filter(|(_, instance)| *instance != 0).count()
    }

    pub fn find_map(&self, map_id: u32, instance_id: u32) -> Option<SharedMap> {
        self.maps.get(&(map_id, instance_id)).cloned()
    }

    /// The continent copy of `map_id`, created on first use.
    pub fn base_map(&mut self, map_id: u32) -> Result<SharedMap, MapError> {
        if let Some(map) = self.find_map(map_id, 0) {
            return Ok(map);
        }
        let entry = self
            .ctx
            .config
            .map_entry(map_id)
            .ok_or(MapError::UnknownMap { map_id, instance_id: 0 })?;
        if entry.map_type.instanceable() {
            tracing::debug!(map = map_id, "base copy of an instanceable map");
        }
        let map = Arc::new(Mutex::new(Map::new(&self.ctx, entry, 0, Difficulty::REGULAR)));
        self.maps.insert((map_id, 0), Arc::clone(&map));
        tracing::info!(map = map_id, name = %entry.name, "continent created");
        Ok(map)
    }

    /// A fresh instance copy with a new instance id.
    pub fn create_instance(&mut self, map_id: u32, difficulty: Difficulty) -> Result<(u32, SharedMap), MapError> {
        let instance_id = self.ctx.guids.next_instance_id();
        let map = self.instantiate(map_id, instance_id, difficulty, false)?;
        Ok((instance_id, map))
    }

    /// Bring back an instance that has a save, restoring its script data.
    pub fn load_instance(&mut self, map_id: u32, instance_id: u32) -> Result<SharedMap, MapError> {
        if let Some(map) = self.find_map(map_id, instance_id) {
            return Ok(map);
        }
        let difficulty = self
            .ctx
            .persistence
            .instance_save(instance_id)
            .filter(|save| save.map_id == map_id)
            .map(|save| save.difficulty)
            .ok_or(MapError::UnknownMap { map_id, instance_id })?;
        self.instantiate(map_id, instance_id, difficulty, true)
    }

    fn instantiate(
        &mut self,
        map_id: u32,
        instance_id: u32,
        difficulty: Difficulty,
        load: bool,
    ) -> Result<SharedMap, MapError> {
        let unknown = MapError::UnknownMap { map_id, instance_id };
        let entry = self.ctx.config.map_entry(map_id).ok_or(unknown.clone())?;
        if !entry.map_type.instanceable() || instance_id == 0 {
            return Err(unknown);
        }
        let mut map = Map::new(&self.ctx, entry, instance_id, difficulty);
        if map.is_dungeon() {
            map.create_instance_data(&self.ctx, load);
        }
        tracing::info!(map = map_id, instance = instance_id, ?difficulty, load, "instance created");
        let map = Arc::new(Mutex::new(map));
        self.maps.insert((map_id, instance_id), Arc::clone(&map));
        Ok(map)
    }

    /// The copy `player` should enter for its current position: the
    /// continent, its assigned battleground, or the dungeon copy it or its
    /// group is bound to (a new one when unbound).
    pub fn map_for_player(&mut self, player: &WorldObject, difficulty: Difficulty) -> Result<SharedMap, MapError> {
        let map_id = player.map_id();
        let requested = player.instance_id();
        if requested != 0 {
            if let Some(map) = self.find_map(map_id, requested) {
                return Ok(map);
            }
        }
        let entry = self
            .ctx
            .config
            .map_entry(map_id)
            .ok_or(MapError::UnknownMap { map_id, instance_id: requested })?;
        if !entry.map_type.instanceable() {
            return self.base_map(map_id);
        }
        let data = player.as_player();
        if entry.map_type.is_battleground_or_arena() {
            let instance_id = data.map_or(0, |p| p.battleground_id);
            return self
                .find_map(map_id, instance_id)
                .ok_or(MapError::UnknownMap { map_id, instance_id });
        }

        let group_bind = data
            .and_then(|p| p.group)
            .and_then(|g| self.ctx.persistence.group_bind(g, map_id, difficulty));
        let bind = group_bind.or_else(|| self.ctx.persistence.player_bind(player.guid(), map_id, difficulty));
        match bind {
            Some(bind) => self.load_instance(map_id, bind.instance_id),
            None => self.create_instance(map_id, difficulty).map(|(_, map)| map),
        }
    }

    /// Put `player` on the map its position names. A missing map is reported
    /// to the player as not found.
    pub fn enter(&mut self, player: WorldObject, difficulty: Difficulty) -> Result<(), Rejected> {
        let map = match self.map_for_player(&player, difficulty) {
            Ok(map) => map,
            Err(reason) => {
                tracing::info!(guid = %player.guid(), map = player.map_id(), %reason, "no map to enter");
                self.ctx.send(
                    player.guid(),
                    &ClientMessage::TransferAborted {
                        map_id: player.map_id(),
                        reason: TransferAbortReason::NotFound,
                    },
                );
                return Err(Rejected::new(reason, player));
            }
        };
        map.lock().add(&self.ctx, player)
    }

    /// Advance every map by `diff_ms`, then settle player transfers and
    /// discard instances whose unload countdown ran out. Returns players
    /// that could not be placed at their destination.
    ///
    /// Each map's guard is held only while that map ticks and is released
    /// before the next one. Session threads holding a [`SharedMap`] from
    /// [`MapManager::find_map`] reach the same `Map` through that guard, so
    /// their add/remove/relocate calls land between ticks of that map.
    pub fn update(&mut self, diff_ms: u32) -> Vec<Rejected> {
        let _span = tracing::info_span!("world_update", diff_ms).entered();
        let started = Instant::now();

        let mut transfers: Vec<Transfer> = Vec::new();
        let mut expired = Vec::new();
        for (key, map) in &self.maps {
            let mut map = map.lock();
            map.update(&self.ctx, diff_ms);
            transfers.extend(map.take_transfers());
            if key.1 != 0 && map.can_unload(diff_ms) {
                expired.push(*key);
            }
        }
        for key in expired {
            transfers.extend(self.discard(key));
        }

        let mut failed = Vec::new();
        for transfer in transfers {
            if let Err(rejected) = self.settle(transfer) {
                failed.push(rejected);
            }
        }

        self.last_tick = started.elapsed();
        self.timings.record(self.last_tick);
        self.ticks += 1;
        failed
    }

    fn settle(&mut self, transfer: Transfer) -> Result<(), Rejected> {
        let Transfer {
            mut player,
            destination,
            reason,
        } = transfer;
        tracing::debug!(guid = %player.guid(), to = destination.map_id, ?reason, "transferring player");
        player.place_at(destination);
        self.enter(player, Difficulty::REGULAR)
    }

    /// Empty and drop one map. Players still inside come back as transfers.
    fn discard(&mut self, key: (u32, u32)) -> Vec<Transfer> {
        let Some(map) = self.maps.remove(&key) else {
            return Vec::new();
        };
        let mut map = map.lock();
        map.unload_all(&self.ctx);
        let reset = matches!(map.kind(), MapKind::Instance(state) if state.reset_after_unload);
        if reset {
            if let Err(e) = self.ctx.persistence.delete_instance(key.1) {
                tracing::error!(instance = key.1, error = %e, "failed to purge instance data");
            }
        } else {
            map.save_instance_data(&self.ctx);
        }
        tracing::info!(map = key.0, instance = key.1, reset, "map discarded");
        map.take_transfers()
    }

    /// Drop every map. Players still inside are lost with their maps.
    pub fn unload_all(&mut self) {
        let keys: Vec<(u32, u32)> = self.maps.keys().copied().collect();
        for key in keys {
            let stranded = self.discard(key);
            if !stranded.is_empty() {
                tracing::warn!(map = key.0, instance = key.1, players = stranded.len(), "players dropped at shutdown");
            }
        }
    }

    pub fn tick_stats(&self) -> TickStats {
        TickStats {
            ticks: self.ticks,
            last: self.last_tick,
            average: self.timings.average(),
            max: self.timings.max(),
        }
    }
}

impl std::fmt::Debug for MapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapManager")
            .field("maps", &self.maps.keys().collect::<Vec<_>>())
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use worldgrid_common::{GroupId, ObjectGuid, WorldPosition};
    use worldgrid_stream::{GridCoord, SIZE_OF_GRIDS, SIZE_OF_GRID_CELL};

    use super::*;
    use crate::config::{MapEntry, MapType, WorldConfig};
    use crate::context::{ManualClock, RecordingSessions};
    use crate::map::ResetMethod;

    struct World {
        manager: MapManager,
        sessions: Arc<RecordingSessions>,
    }

    fn world(unload_delay_ms: u32) -> World {
        let config = WorldConfig {
            data_path: std::env::temp_dir().join("worldgrid-no-terrain"),
            instance_unload_delay_ms: unload_delay_ms,
            maps: vec![
                MapEntry::new(0, "Eastern Kingdoms", MapType::Common),
                MapEntry::new(36, "Deadmines", MapType::Dungeon).with_difficulty(5, 0),
                MapEntry::new(489, "Warsong Gulch", MapType::Battleground),
            ],
            ..WorldConfig::default()
        };
        let sessions = Arc::new(RecordingSessions::new());
        let ctx = SimContext::new(config)
            .with_sessions(sessions.clone())
            .with_clock(Arc::new(ManualClock::new(1_000)));
        World {
            manager: MapManager::new(ctx),
            sessions,
        }
    }

    fn spot(map_id: u32, gx: u32, gy: u32) -> WorldPosition {
        let coord = GridCoord::new(gx, gy).unwrap();
        let origin = |g: u32| (g as f32 - 32.0) * SIZE_OF_GRIDS + SIZE_OF_GRID_CELL / 2.0;
        WorldPosition::new(map_id, 0, origin(coord.x()), origin(coord.y()), 0.0, 0.0)
    }

    fn player(low: u32, at: WorldPosition) -> WorldObject {
        let mut p = WorldObject::player(low, format!("p{low}"), at);
        p.as_player_mut().unwrap().homebind = spot(0, 30, 30);
        p
    }

    #[test]
    fn continent_is_created_on_first_entry() {
        let mut w = world(5_000);
        w.manager.enter(player(1, spot(0, 30, 30)), Difficulty::REGULAR).unwrap();
        let map = w.manager.find_map(0, 0).unwrap();
        assert!(map.lock().have_players());
        assert_eq!(w.manager.instance_count(), 0);
    }

    #[test]
    fn unknown_map_is_reported_as_not_found() {
        let mut w = world(5_000);
        let p = player(1, spot(999, 30, 30));
        let guid = p.guid();
        let rejected = w.manager.enter(p, Difficulty::REGULAR).unwrap_err();
        assert_eq!(rejected.reason, MapError::UnknownMap { map_id: 999, instance_id: 0 });
        assert_eq!(rejected.into_object().guid(), guid);
        assert!(w.sessions.sent_to(guid).contains(&ClientMessage::TransferAborted {
            map_id: 999,
            reason: TransferAbortReason::NotFound,
        }));
    }

    #[test]
    fn bound_player_returns_to_the_same_copy() {
        let mut w = world(5_000);
        let p = player(1, spot(36, 32, 32));
        let guid = p.guid();
        w.manager.enter(p, Difficulty::REGULAR).unwrap();
        assert_eq!(w.manager.instance_count(), 1);
        let (&(_, instance_id), map) = w.manager.maps.iter().find(|(k, _)| k.1 != 0).unwrap();
        let map = Arc::clone(map);

        let mut back = map.lock().remove(w.manager.context(), guid, false).unwrap();
        back.set_map(36, 0);
        w.manager.enter(back, Difficulty::REGULAR).unwrap();
        assert_eq!(w.manager.instance_count(), 1);
        assert!(w.manager.find_map(36, instance_id).unwrap().lock().have_players());
    }

    #[test]
    fn grouped_players_share_a_copy() {
        let mut w = world(5_000);
        for low in 1..=2 {
            let mut p = player(low, spot(36, 32, 32));
            p.as_player_mut().unwrap().group = Some(GroupId(4));
            w.manager.enter(p, Difficulty::REGULAR).unwrap();
        }
        assert_eq!(w.manager.instance_count(), 1);
    }

    #[test]
    fn full_copy_hands_back_an_untouched_player() {
        let mut w = world(5_000);
        for low in 1..=5 {
            let mut p = player(low, spot(36, 32, 32));
            p.as_player_mut().unwrap().group = Some(GroupId(4));
            w.manager.enter(p, Difficulty::REGULAR).unwrap();
        }
        let mut late = player(6, spot(36, 32, 32));
        late.as_player_mut().unwrap().group = Some(GroupId(4));
        let rejected = w.manager.enter(late, Difficulty::REGULAR).unwrap_err();
        assert!(matches!(
            rejected.reason,
            MapError::Admission(crate::error::AdmissionError::MaxPlayers { max_players: 5 })
        ));
        let late = rejected.into_object();
        assert_eq!((late.map_id(), late.instance_id()), (36, 0));
        assert!(!late.is_in_world());
    }

    #[test]
    fn empty_instance_is_discarded_after_its_delay() {
        let mut w = world(5_000);
        let p = player(1, spot(36, 32, 32));
        let guid = p.guid();
        w.manager.enter(p, Difficulty::REGULAR).unwrap();
        let (&key, map) = w.manager.maps.iter().find(|(k, _)| k.1 != 0).unwrap();
        let map = Arc::clone(map);
        map.lock().remove(w.manager.context(), guid, true);

        w.manager.update(4_000);
        assert!(w.manager.find_map(key.0, key.1).is_some());
        w.manager.update(1_000);
        assert!(w.manager.find_map(key.0, key.1).is_none());
        // Not reset: the save survives for the bound player.
        assert!(w.manager.context().persistence.instance_save(key.1).is_some());
    }

    #[test]
    fn reset_instance_is_purged_on_discard() {
        let mut w = world(5_000);
        let (instance_id, map) = w.manager.create_instance(36, Difficulty::REGULAR).unwrap();
        let p = player(1, spot(36, 32, 32));
        let guid = p.guid();
        {
            let mut map = map.lock();
            let mut p = p;
            p.set_map(36, instance_id);
            map.add(w.manager.context(), p).unwrap();
            map.remove(w.manager.context(), guid, true);
            assert!(map.reset(w.manager.context(), ResetMethod::All));
        }
        w.manager.update(1);
        assert!(w.manager.find_map(36, instance_id).is_none());
        let ctx = w.manager.context();
        assert!(ctx.persistence.instance_save(instance_id).is_none());
        assert!(ctx.persistence.player_bind(guid, 36, Difficulty::REGULAR).is_none());
    }

    #[test]
    fn transfers_land_on_the_destination_map() {
        let mut w = world(5_000);
        w.manager.base_map(0).unwrap();
        let p = player(1, spot(0, 30, 30));
        let guid = p.guid();
        w.manager.enter(p, Difficulty::REGULAR).unwrap();
        {
            let base = w.manager.find_map(0, 0).unwrap();
            let mut base = base.lock();
            let ctx = w.manager.context().clone();
            base.transfer_player(&ctx, guid, spot(1, 30, 30), crate::map::TransferReason::Teleport);
        }
        // Map 1 is not in the catalog: the player comes back rejected.
        let failed = w.manager.update(100);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].object.guid(), guid);
        assert!(!w.manager.find_map(0, 0).unwrap().lock().have_players());

        let mut p = failed.into_iter().next().unwrap().into_object();
        p.place_at(spot(36, 32, 32));
        w.manager.enter(p, Difficulty::REGULAR).unwrap();
        assert_eq!(w.manager.instance_count(), 1);
    }

    #[test]
    fn battleground_needs_an_existing_copy() {
        let mut w = world(5_000);
        let mut p = player(1, spot(489, 32, 32));
        p.as_player_mut().unwrap().battleground_id = 77;
        let rejected = w.manager.enter(p, Difficulty::REGULAR).unwrap_err();
        assert_eq!(rejected.reason, MapError::UnknownMap { map_id: 489, instance_id: 77 });

        let (instance_id, bg) = w.manager.create_instance(489, Difficulty::REGULAR).unwrap();
        let mut p = rejected.into_object();
        p.as_player_mut().unwrap().battleground_id = instance_id;
        w.manager.enter(p, Difficulty::REGULAR).unwrap();
        assert!(bg.lock().have_players());

        // Unloading sends the player home through the transfer queue.
        bg.lock().set_unload();
        let failed = w.manager.update(1);
        assert!(failed.is_empty());
        assert!(w.manager.find_map(489, instance_id).is_none());
        assert!(w.manager.find_map(0, 0).unwrap().lock().players().any(|g| g == ObjectGuid::player(1)));
    }

    #[test]
    fn map_guards_are_free_between_ticks() {
        let mut w = world(5_000);
        w.manager.enter(player(1, spot(0, 30, 30)), Difficulty::REGULAR).unwrap();
        let shared = w.manager.find_map(0, 0).unwrap();
        w.manager.update(100);

        // A session thread can lock the map and move its player between ticks.
        {
            let mut map = shared.try_lock().expect("guard released after the tick");
            let guid = ObjectGuid::player(1);
            let to = spot(0, 30, 30);
            map.relocate(w.manager.context(), guid, to.x() + 5.0, to.y(), 0.0, 0.0).unwrap();
        }
        w.manager.update(100);
        assert!(shared.try_lock().is_some());
        assert_eq!(w.manager.tick_stats().ticks, 2);
    }

    #[test]
    fn shutdown_drops_every_map_and_counts_ticks() {
        let mut w = world(5_000);
        w.manager.enter(player(1, spot(0, 30, 30)), Difficulty::REGULAR).unwrap();
        w.manager.create_instance(36, Difficulty::REGULAR).unwrap();
        w.manager.update(100);
        w.manager.update(100);
        assert_eq!(w.manager.tick_stats().ticks, 2);
        w.manager.unload_all();
        assert_eq!(w.manager.map_count(), 0);
    }
}
