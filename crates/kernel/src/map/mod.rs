//! One live world instance: its grids, its objects and the per-tick update.
//!
//! Objects live in an arena keyed by guid; grid cells only hold guids. Every
//! structural change goes through `&mut Map`, so whoever owns the map (the
//! [`crate::MapManager`] wraps each one in a mutex) serializes grid creation,
//! admission and tick traversal.

mod grid_states;
mod instance;
mod loader;
mod scripts;
mod terrain;
mod visibility;

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use worldgrid_common::{Difficulty, HighGuid, ObjectGuid, WorldPosition};
use worldgrid_stream::{
    CellArea, CellCoord, CellMarks, GridCoord, GridState, MAX_NUMBER_OF_CELLS, MAX_NUMBER_OF_GRIDS,
    SIZE_OF_GRID_CELL,
};
use worldgrid_terrain::{PageLoad, TerrainKey, VmapLoadResult};

use crate::config::{MapEntry, MapType};
use crate::context::{InstanceScript, SimContext};
use crate::error::{MapError, Rejected};
use crate::grid::NGrid;
use crate::message::ClientMessage;
use crate::object::{Activatable, GridMember, Positioned, WorldObject};

pub use instance::{InstanceState, ResetMethod};
pub use scripts::ScheduledAction;

/// What flavour of map this is.
#[derive(Debug)]
pub enum MapKind {
    /// A shared world copy, or the base copy of an instanceable map.
    Continent,
    /// A dungeon or raid copy.
    Instance(InstanceState),
    /// A battleground or arena copy.
    Battleground,
}

/// How a relocation request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    Moved,
    /// The destination grid was not loaded; the object went back to its respawn point.
    Redirected,
    /// Neither destination nor respawn grid was loaded; the object will be removed.
    QueuedForRemoval,
}

/// Why a player left this map for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferReason {
    Teleport,
    Homebind,
    BattlegroundExit,
    /// The player's grid was force-unloaded under them.
    Evicted,
}

/// A player removed from this map and on the way to another.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub player: WorldObject,
    pub destination: WorldPosition,
    pub reason: TransferReason,
}

/// Structural changes, recorded when event recording is on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MapEvent {
    GridCreated(GridCoord),
    GridLoaded { grid: GridCoord, objects: usize },
    GridStateChanged { grid: GridCoord, from: GridState, to: GridState },
    GridUnloaded(GridCoord),
    ObjectAdded(ObjectGuid),
    ObjectRemoved(ObjectGuid),
    ObjectMoved { guid: ObjectGuid, from: CellCoord, to: CellCoord },
    ObjectRedirected(ObjectGuid),
    ScriptExecuted { script_id: u32, command: u32 },
    PlayerTransferred { guid: ObjectGuid, reason: TransferReason },
}

#[derive(Debug, Clone, Copy)]
struct LocalGuids {
    dynamic_object: u32,
    pet: u32,
    vehicle: u32,
}

impl Default for LocalGuids {
    fn default() -> Self {
        Self {
            dynamic_object: 1,
            pet: 1,
            vehicle: 1,
        }
    }
}

pub struct Map {
    id: u32,
    instance_id: u32,
    difficulty: Difficulty,
    entry: MapEntry,
    kind: MapKind,
    visibility_distance: f32,
    grid_expiry_ms: u64,
    grids: Vec<Option<Box<NGrid>>>,
    objects: BTreeMap<ObjectGuid, WorldObject>,
    players: BTreeSet<ObjectGuid>,
    active_non_players: BTreeSet<ObjectGuid>,
    marks: CellMarks,
    remove_list: BTreeSet<ObjectGuid>,
    pending_updates: BTreeSet<ObjectGuid>,
    scripts: BTreeMap<(u64, u64), ScheduledAction>,
    script_seq: u64,
    transfers: Vec<Transfer>,
    instance_script: Option<Box<dyn InstanceScript>>,
    local_guids: LocalGuids,
    unload_timer: u32,
    record_events: bool,
    events: Vec<MapEvent>,
}

impl Map {
    pub fn new(ctx: &SimContext, entry: &MapEntry, instance_id: u32, difficulty: Difficulty) -> Self {
        let kind = if instance_id == 0 {
            MapKind::Continent
        } else {
            match entry.map_type {
                MapType::Dungeon | MapType::Raid => MapKind::Instance(InstanceState::default()),
                MapType::Battleground | MapType::Arena => MapKind::Battleground,
                MapType::Common => {
                    tracing::warn!(map = entry.id, instance_id, "instance of a non-instanceable map");
                    MapKind::Continent
                }
            }
        };
        let visibility_distance = match kind {
            MapKind::Continent => ctx.config.visibility.continents,
            _ => ctx.config.visibility_for(entry.map_type),
        };
        // Instances start counting down at creation so an unused copy goes away.
        let unload_timer = match kind {
            MapKind::Instance(_) => ctx.config.instance_unload_delay(),
            _ => 0,
        };
        let grid_count = (MAX_NUMBER_OF_GRIDS * MAX_NUMBER_OF_GRIDS) as usize;
        tracing::debug!(map = entry.id, instance_id, ?difficulty, "map created");
        Self {
            id: entry.id,
            instance_id,
            difficulty,
            entry: entry.clone(),
            kind,
            visibility_distance,
            grid_expiry_ms: u64::from(ctx.config.grid_clean_up_delay_ms),
            grids: (0..grid_count).map(|_| None).collect(),
            objects: BTreeMap::new(),
            players: BTreeSet::new(),
            active_non_players: BTreeSet::new(),
            marks: CellMarks::new(),
            remove_list: BTreeSet::new(),
            pending_updates: BTreeSet::new(),
            scripts: BTreeMap::new(),
            script_seq: 0,
            transfers: Vec::new(),
            instance_script: None,
            local_guids: LocalGuids::default(),
            unload_timer,
            record_events: false,
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn difficulty(&self) -> Difficulty {
        self.difficulty
    }

    pub fn entry(&self) -> &MapEntry {
        &self.entry
    }

    pub fn kind(&self) -> &MapKind {
        &self.kind
    }

    /// The instance-0 copy that owns terrain pages outright.
    pub fn is_base_map(&self) -> bool {
        self.instance_id == 0
    }

    pub fn is_dungeon(&self) -> bool {
        matches!(self.kind, MapKind::Instance(_)) && self.entry.map_type.is_dungeon()
    }

    pub fn is_battleground_or_arena(&self) -> bool {
        matches!(self.kind, MapKind::Battleground)
    }

    pub fn visibility_distance(&self) -> f32 {
        self.visibility_distance
    }

    pub fn object(&self, guid: ObjectGuid) -> Option<&WorldObject> {
        self.objects.get(&guid)
    }

    pub fn objects(&self) -> impl Iterator<Item = &WorldObject> {
        self.objects.values()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn players(&self) -> impl Iterator<Item = ObjectGuid> + '_ {
        self.players.iter().copied()
    }

    pub fn have_players(&self) -> bool {
        !self.players.is_empty()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn players_count_except_gms(&self) -> u32 {
        self.players
            .iter()
            .filter_map(|g| self.objects.get(g))
            .filter(|p| !p.is_game_master())
            .count() as u32
    }

    pub fn is_active_object(&self, guid: ObjectGuid) -> bool {
        self.active_non_players.contains(&guid)
    }

    pub fn is_queued_for_removal(&self, guid: ObjectGuid) -> bool {
        self.remove_list.contains(&guid)
    }

    // --- grids -------------------------------------------------------------

    pub fn grid(&self, coord: GridCoord) -> Option<&NGrid> {
        self.grids[coord.index()].as_deref()
    }

    fn grid_mut(&mut self, coord: GridCoord) -> Option<&mut NGrid> {
        self.grids[coord.index()].as_deref_mut()
    }

    pub fn grids(&self) -> impl Iterator<Item = &NGrid> {
        self.grids.iter().filter_map(|g| g.as_deref())
    }

    pub fn created_grid_count(&self) -> usize {
        self.grids().count()
    }

    pub fn is_grid_created(&self, coord: GridCoord) -> bool {
        self.grid(coord).is_some()
    }

    /// Created and populated from spawn data.
    pub fn is_grid_loaded(&self, coord: GridCoord) -> bool {
        self.grid(coord).is_some_and(NGrid::is_objects_loaded)
    }

    fn terrain_key(&self, coord: GridCoord) -> TerrainKey {
        let (tile_x, tile_y) = coord.terrain_tile();
        TerrainKey::new(self.id, tile_x, tile_y)
    }

    /// Allocate the grid if absent and bind its terrain page. Returns whether
    /// a grid was created.
    pub fn ensure_grid_created(&mut self, ctx: &SimContext, coord: GridCoord) -> bool {
        if self.is_grid_created(coord) {
            return false;
        }
        let key = self.terrain_key(coord);
        let PageLoad { page, created } = if self.is_base_map() {
            ctx.terrain.load(key, false)
        } else {
            ctx.terrain.acquire_shared(key)
        };
        if created && vmap_loading(ctx) {
            let vmaps = ctx.terrain.loader().vmaps_dir();
            match ctx.collision.load_map(&vmaps, self.id, key.tile_x, key.tile_y) {
                VmapLoadResult::Ok => tracing::debug!(%key, "collision tile loaded"),
                VmapLoadResult::Error => tracing::warn!(%key, "could not load collision tile"),
                VmapLoadResult::Ignored => {}
            }
        }
        let mut grid = NGrid::new(coord, self.grid_expiry_ms, ctx.config.grid_unload, page);
        grid.set_state(GridState::Idle);
        self.grids[coord.index()] = Some(Box::new(grid));
        tracing::debug!(map = self.id, instance = self.instance_id, %coord, "grid created");
        self.record(MapEvent::GridCreated(coord));
        true
    }

    /// Make sure the grid under `cell` exists and is populated; forces it
    /// `Active` when this call did the populating.
    pub fn ensure_grid_loaded_at_enter(&mut self, ctx: &SimContext, cell: CellCoord) -> bool {
        if !self.ensure_grid_loaded(ctx, cell) {
            return false;
        }
        let coord = cell.grid();
        tracing::debug!(map = self.id, %cell, "entering object triggered grid load");
        self.reset_grid_expiry(coord, 0.1);
        self.set_grid_state(coord, GridState::Active);
        true
    }

    /// Load the grid under `cell`; with `no_unload` it stays loaded until
    /// the map goes away.
    pub fn load_grid(&mut self, ctx: &SimContext, cell: CellCoord, no_unload: bool) {
        self.ensure_grid_loaded(ctx, cell);
        if no_unload {
            if let Some(grid) = self.grid_mut(cell.grid()) {
                grid.info_mut().set_unload_explicit_lock(true);
            }
        }
    }

    fn reset_grid_expiry(&mut self, coord: GridCoord, factor: f32) {
        let expiry = (self.grid_expiry_ms as f32 * factor) as u64;
        if let Some(grid) = self.grid_mut(coord) {
            grid.info_mut().reset_timer(expiry);
        }
    }

    fn set_grid_state(&mut self, coord: GridCoord, to: GridState) {
        let Some(grid) = self.grid_mut(coord) else {
            return;
        };
        let from = grid.state();
        if from == to {
            return;
        }
        grid.set_state(to);
        self.record(MapEvent::GridStateChanged { grid: coord, from, to });
    }

    /// Whether anything keeps the grid from unloading: the explicit lock, an
    /// active object pinning its respawn grid, or instances sharing the page.
    pub fn grid_unload_lock(&self, ctx: &SimContext, coord: GridCoord) -> bool {
        let Some(grid) = self.grid(coord) else {
            return false;
        };
        grid.info().unload_lock()
            || (self.is_base_map() && ctx.terrain.instance_refs(self.terrain_key(coord)) > 0)
    }

    /// Whether a player or active object stands within sight of the grid.
    pub fn active_objects_near_grid(&self, coord: GridCoord) -> bool {
        let cell_range = (self.visibility_distance / SIZE_OF_GRID_CELL).ceil() as u32 + 1;
        let min_x = (coord.x() * MAX_NUMBER_OF_CELLS).saturating_sub(cell_range);
        let min_y = (coord.y() * MAX_NUMBER_OF_CELLS).saturating_sub(cell_range);
        let max_x = coord.x() * MAX_NUMBER_OF_CELLS + MAX_NUMBER_OF_CELLS + cell_range;
        let max_y = coord.y() * MAX_NUMBER_OF_CELLS + MAX_NUMBER_OF_CELLS + cell_range;
        self.players
            .iter()
            .chain(self.active_non_players.iter())
            .filter_map(|g| self.objects.get(g))
            .filter_map(|obj| obj.computed_cell().ok())
            .any(|c| (min_x..=max_x).contains(&c.x()) && (min_y..=max_y).contains(&c.y()))
    }

    /// Whether a player or active object stands inside the grid itself.
    fn active_objects_in_grid(&self, coord: GridCoord) -> bool {
        self.players
            .iter()
            .chain(self.active_non_players.iter())
            .filter_map(|g| self.objects.get(g))
            .any(|obj| obj.current_cell().is_some_and(|c| c.grid() == coord))
    }

    // --- membership --------------------------------------------------------

    fn attach(&mut self, guid: ObjectGuid, cell: CellCoord) {
        let Some(grid) = self.grids[cell.grid().index()].as_deref_mut() else {
            tracing::error!(map = self.id, %guid, %cell, "attaching object to a grid that does not exist");
            debug_assert!(false, "attach to missing grid");
            return;
        };
        grid.add_object(cell, guid);
        if let Some(obj) = self.objects.get_mut(&guid) {
            obj.set_current_cell(Some(cell));
        }
    }

    fn detach(&mut self, guid: ObjectGuid) -> Option<CellCoord> {
        let obj = self.objects.get_mut(&guid)?;
        let cell = obj.current_cell()?;
        obj.set_current_cell(None);
        if let Some(grid) = self.grids[cell.grid().index()].as_deref_mut() {
            grid.remove_object(cell, guid);
        }
        Some(cell)
    }

    fn move_to_cell(&mut self, guid: ObjectGuid, to: CellCoord) {
        if let Some(from) = self.detach(guid) {
            if from != to {
                self.record(MapEvent::ObjectMoved { guid, from, to });
            }
        }
        self.attach(guid, to);
    }

    /// Place an object on the map.
    ///
    /// Rejected objects are handed back untouched. Positions outside the map
    /// are refused before any admission bookkeeping happens.
    pub fn add(&mut self, ctx: &SimContext, mut obj: WorldObject) -> Result<(), Rejected> {
        let guid = obj.guid();
        if obj.map_id() != self.id {
            let reason = MapError::WrongMap {
                guid,
                map_id: obj.map_id(),
                instance_id: obj.instance_id(),
            };
            return Err(Rejected::new(reason, obj));
        }
        let cell = match obj.computed_cell() {
            Ok(cell) => cell,
            Err(err) => {
                tracing::error!(
                    map = self.id,
                    %guid,
                    x = obj.position().x(),
                    y = obj.position().y(),
                    "object has invalid coordinates"
                );
                return Err(Rejected::new(err, obj));
            }
        };
        if self.objects.contains_key(&guid) {
            return Err(Rejected::new(MapError::DuplicateObject(guid), obj));
        }
        if obj.is_player() {
            if let Err(reason) = self.admit_player(ctx, &mut obj) {
                tracing::info!(map = self.id, instance = self.instance_id, %guid, %reason, "player refused");
                return Err(Rejected::new(reason, obj));
            }
            obj.set_map(self.id, self.instance_id);
            self.add_player_to_grid(ctx, obj, cell);
            self.after_player_added(ctx, guid);
        } else {
            obj.set_map(self.id, self.instance_id);
            self.add_object_to_grid(ctx, obj, cell);
        }
        debug_assert!(self.check_grid_integrity(guid));
        Ok(())
    }

    fn add_player_to_grid(&mut self, ctx: &SimContext, mut player: WorldObject, cell: CellCoord) {
        let guid = player.guid();
        player.set_in_world(true);
        self.objects.insert(guid, player);
        self.players.insert(guid);
        self.ensure_grid_loaded_at_enter(ctx, cell);
        self.attach(guid, cell);
        ctx.send(
            guid,
            &ClientMessage::InitSelf {
                map_id: self.id,
                instance_id: self.instance_id,
            },
        );
        self.update_object_visibility(ctx, guid);
        self.update_visible_for_player(ctx, guid);
        tracing::debug!(map = self.id, instance = self.instance_id, %guid, %cell, "player entered map");
        self.record(MapEvent::ObjectAdded(guid));
    }

    fn add_object_to_grid(&mut self, ctx: &SimContext, mut obj: WorldObject, cell: CellCoord) {
        let guid = obj.guid();
        let active = obj.is_active();
        if active {
            self.ensure_grid_loaded_at_enter(ctx, cell);
        } else {
            self.ensure_grid_created(ctx, cell.grid());
        }
        obj.set_in_world(true);
        if let Some(script) = self.instance_script.as_mut() {
            script.on_object_create(&obj);
        }
        self.objects.insert(guid, obj);
        self.attach(guid, cell);
        if active {
            self.add_to_active(guid);
        }
        tracing::debug!(map = self.id, %guid, %cell, "object entered grid");
        self.update_object_visibility(ctx, guid);
        if let Some(obj) = self.objects.get_mut(&guid) {
            obj.set_need_notify();
        }
        self.record(MapEvent::ObjectAdded(guid));
    }

    /// Take an object off the map.
    ///
    /// With `destroy` the object is dropped and `None` returned; otherwise it
    /// is handed back out of world, ready to be added elsewhere.
    pub fn remove(&mut self, ctx: &SimContext, guid: ObjectGuid, destroy: bool) -> Option<WorldObject> {
        if !self.objects.contains_key(&guid) {
            return None;
        }
        let is_player = self.players.contains(&guid);
        if is_player {
            self.before_player_removed(ctx, guid);
        }
        if self.active_non_players.contains(&guid) {
            self.remove_from_active(guid);
        }
        self.detach(guid);
        self.forget_visibility(ctx, guid);
        self.players.remove(&guid);
        self.remove_list.remove(&guid);
        self.pending_updates.remove(&guid);
        let mut obj = self.objects.remove(&guid)?;
        obj.set_in_world(false);
        if let Some(visible) = obj.visible_mut() {
            visible.clear();
        }
        if is_player {
            self.after_player_removed(ctx);
        }
        tracing::debug!(map = self.id, instance = self.instance_id, %guid, destroy, "object removed");
        self.record(MapEvent::ObjectRemoved(guid));
        if destroy {
            if !ctx.config.save_respawn_time_immediately {
                self.save_respawn_time(ctx, &obj);
            }
            None
        } else {
            Some(obj)
        }
    }

    /// Move an object, keeping its cell membership in step with its position.
    pub fn relocate(
        &mut self,
        ctx: &SimContext,
        guid: ObjectGuid,
        x: f32,
        y: f32,
        z: f32,
        orientation: f32,
    ) -> Result<Relocation, MapError> {
        let obj = self.objects.get(&guid).ok_or(MapError::UnknownObject(guid))?;
        let new_cell = CellCoord::from_world(x, y).inspect_err(|_| {
            tracing::error!(map = self.id, %guid, x, y, "relocation to invalid coordinates");
        })?;
        let Some(old_cell) = obj.current_cell() else {
            return Err(MapError::UnknownObject(guid));
        };
        debug_assert!(self.check_grid_integrity(guid));
        let outcome = if obj.is_player() {
            self.player_relocation(ctx, guid, old_cell, new_cell, x, y, z, orientation);
            Relocation::Moved
        } else {
            self.object_relocation(ctx, guid, old_cell, new_cell, x, y, z, orientation)
        };
        debug_assert!(self.check_grid_integrity(guid));
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn player_relocation(
        &mut self,
        ctx: &SimContext,
        guid: ObjectGuid,
        old_cell: CellCoord,
        new_cell: CellCoord,
        x: f32,
        y: f32,
        z: f32,
        orientation: f32,
    ) {
        if let Some(player) = self.objects.get_mut(&guid) {
            player.relocate(x, y, z, orientation);
        }
        if old_cell != new_cell {
            tracing::trace!(map = self.id, %guid, from = %old_cell, to = %new_cell, "player changed cell");
            if !old_cell.same_grid(&new_cell) {
                self.ensure_grid_loaded_at_enter(ctx, new_cell);
            }
            self.move_to_cell(guid, new_cell);
        }
        self.update_object_visibility(ctx, guid);
        self.update_visible_for_player(ctx, guid);

        let new_grid = new_cell.grid();
        if old_cell != new_cell && self.grid(new_grid).is_some_and(|g| g.state() != GridState::Active) {
            self.reset_grid_expiry(new_grid, 0.1);
            self.set_grid_state(new_grid, GridState::Active);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn object_relocation(
        &mut self,
        ctx: &SimContext,
        guid: ObjectGuid,
        old_cell: CellCoord,
        new_cell: CellCoord,
        x: f32,
        y: f32,
        z: f32,
        orientation: f32,
    ) -> Relocation {
        if old_cell == new_cell || self.object_cell_relocation(ctx, guid, old_cell, new_cell) {
            if let Some(obj) = self.objects.get_mut(&guid) {
                obj.relocate(x, y, z, orientation);
                obj.set_need_notify();
            }
            return Relocation::Moved;
        }
        if self.respawn_relocation(ctx, guid) {
            self.record(MapEvent::ObjectRedirected(guid));
            return Relocation::Redirected;
        }
        tracing::debug!(map = self.id, %guid, "cannot move to unloaded respawn grid, removing");
        self.add_object_to_remove_list(guid);
        Relocation::QueuedForRemoval
    }

    /// Move cell membership for a non-player. Fails only when the
    /// destination is another grid that is not loaded and the object is not
    /// active.
    fn object_cell_relocation(
        &mut self,
        ctx: &SimContext,
        guid: ObjectGuid,
        old_cell: CellCoord,
        new_cell: CellCoord,
    ) -> bool {
        if old_cell.same_grid(&new_cell) {
            if old_cell != new_cell {
                self.move_to_cell(guid, new_cell);
            }
            return true;
        }
        let active = self.objects.get(&guid).is_some_and(|o| o.is_active());
        if active {
            self.ensure_grid_loaded_at_enter(ctx, new_cell);
            self.move_to_cell(guid, new_cell);
            return true;
        }
        if self.is_grid_loaded(new_cell.grid()) {
            self.move_to_cell(guid, new_cell);
            return true;
        }
        tracing::debug!(map = self.id, %guid, from = %old_cell, to = %new_cell, "move into unloaded grid refused");
        false
    }

    /// Send a creature back to its respawn point. Fails when it has none or
    /// the respawn grid is not loaded either.
    fn respawn_relocation(&mut self, ctx: &SimContext, guid: ObjectGuid) -> bool {
        let Some(obj) = self.objects.get_mut(&guid) else {
            return false;
        };
        let Some(respawn) = obj.respawn_position() else {
            return false;
        };
        let Ok(resp_cell) = CellCoord::from_world(respawn.x(), respawn.y()) else {
            return false;
        };
        let Some(old_cell) = obj.current_cell() else {
            return false;
        };
        obj.combat_stop();
        if !self.object_cell_relocation(ctx, guid, old_cell, resp_cell) {
            return false;
        }
        if let Some(obj) = self.objects.get_mut(&guid) {
            obj.relocate(respawn.x(), respawn.y(), respawn.z(), respawn.orientation);
            obj.set_need_notify();
        }
        true
    }

    /// Tracked cell agrees with the computed one. Logs the mismatch.
    pub fn check_grid_integrity(&self, guid: ObjectGuid) -> bool {
        let Some(obj) = self.objects.get(&guid) else {
            return true;
        };
        if obj.cell_consistent() {
            return true;
        }
        tracing::error!(
            map = self.id,
            %guid,
            x = obj.position().x(),
            y = obj.position().y(),
            tracked = ?obj.current_cell(),
            "object tracked in the wrong cell"
        );
        false
    }

    /// Toggle the always-simulated flag of an object on the map.
    pub fn set_active(&mut self, guid: ObjectGuid, active: bool) -> Result<(), MapError> {
        let obj = self.objects.get_mut(&guid).ok_or(MapError::UnknownObject(guid))?;
        if obj.is_active() == active {
            return Ok(());
        }
        if obj.is_player() {
            obj.set_active(active);
            return Ok(());
        }
        if active {
            obj.set_active(true);
            self.add_to_active(guid);
        } else {
            self.remove_from_active(guid);
            if let Some(obj) = self.objects.get_mut(&guid) {
                obj.set_active(false);
            }
        }
        Ok(())
    }

    /// Register an active non-player. Spawned creatures also pin their
    /// respawn grid so it cannot unload and reload a clone.
    fn add_to_active(&mut self, guid: ObjectGuid) {
        self.active_non_players.insert(guid);
        let Some(obj) = self.objects.get(&guid) else {
            return;
        };
        if !obj.pins_respawn_grid() {
            return;
        }
        let Some(respawn) = obj.respawn_position() else {
            return;
        };
        match GridCoord::from_world(respawn.x(), respawn.y()) {
            Ok(coord) if self.is_grid_created(coord) => {
                if let Some(grid) = self.grid_mut(coord) {
                    grid.info_mut().inc_unload_active_lock();
                }
            }
            _ => tracing::error!(map = self.id, %guid, "active creature added but its spawn grid is not loaded"),
        }
    }

    fn remove_from_active(&mut self, guid: ObjectGuid) {
        self.active_non_players.remove(&guid);
        let Some(obj) = self.objects.get(&guid) else {
            return;
        };
        if !obj.pins_respawn_grid() {
            return;
        }
        let Some(respawn) = obj.respawn_position() else {
            return;
        };
        match GridCoord::from_world(respawn.x(), respawn.y()) {
            Ok(coord) if self.is_grid_created(coord) => {
                if let Some(grid) = self.grid_mut(coord) {
                    grid.info_mut().dec_unload_active_lock();
                }
            }
            _ => tracing::error!(map = self.id, %guid, "active creature removed but its spawn grid is not loaded"),
        }
    }

    // --- deferred removal --------------------------------------------------

    /// Queue a non-player for removal at the next flush.
    pub fn add_object_to_remove_list(&mut self, guid: ObjectGuid) {
        match self.objects.get(&guid) {
            Some(obj) if obj.is_player() => {
                tracing::error!(map = self.id, %guid, "players cannot be queued for removal");
            }
            Some(_) => {
                self.remove_list.insert(guid);
            }
            None => tracing::error!(map = self.id, %guid, "queued object is not on this map"),
        }
    }

    pub fn remove_all_objects_in_remove_list(&mut self, ctx: &SimContext) {
        while let Some(guid) = self.remove_list.pop_first() {
            self.remove(ctx, guid, true);
        }
    }

    // --- tick --------------------------------------------------------------

    /// Advance the map by `diff_ms`.
    ///
    /// Order: players, cells around players, cells around active objects,
    /// client update flush, removal flush, grid state handlers, scripts,
    /// instance script.
    pub fn update(&mut self, ctx: &SimContext, diff_ms: u32) {
        let _span = tracing::info_span!("map_update", map = self.id, instance = self.instance_id).entered();

        let players: Vec<ObjectGuid> = self.players.iter().copied().collect();
        for guid in &players {
            if let Some(player) = self.objects.get_mut(guid) {
                if player.is_in_world() {
                    ctx.rules.update_player(player, diff_ms);
                }
            }
        }

        self.marks.reset();
        for guid in &players {
            let Some(player) = self.objects.get(guid) else {
                continue;
            };
            if CellCoord::from_world(player.position().x(), player.position().y()).is_err() {
                continue;
            }
            let area = CellArea::around(player.position().x(), player.position().y(), self.visibility_distance);
            self.visit_area(ctx, area, diff_ms);
        }

        let actives: Vec<ObjectGuid> = self.active_non_players.iter().copied().collect();
        for guid in actives {
            let Some(obj) = self.objects.get(&guid) else {
                continue;
            };
            if !obj.is_in_world() {
                continue;
            }
            let Ok(cell) = obj.computed_cell() else {
                continue;
            };
            self.visit_area(ctx, CellArea::single(cell).expanded(1), diff_ms);
        }

        self.send_object_updates(ctx);
        self.remove_all_objects_in_remove_list(ctx);

        // Battlegrounds place objects by hand that a grid reload would not restore.
        if !self.is_battleground_or_arena() {
            self.update_grid_states(ctx, diff_ms);
        }

        if !self.scripts.is_empty() {
            self.scripts_process(ctx);
        }

        self.update_instance_script(diff_ms);
    }

    fn visit_area(&mut self, ctx: &SimContext, area: CellArea, diff_ms: u32) {
        for cell in area.iter() {
            if self.marks.mark(cell) {
                self.visit_cell(ctx, cell, diff_ms);
            }
        }
    }

    fn visit_cell(&mut self, ctx: &SimContext, cell: CellCoord, diff_ms: u32) {
        let Some(grid) = self.grid(cell.grid()) else {
            return;
        };
        if !grid.is_objects_loaded() {
            return;
        }
        let guids: Vec<ObjectGuid> = grid.cell_objects(cell).collect();
        for guid in guids {
            if !self.players.contains(&guid) {
                self.update_object(ctx, guid, diff_ms);
            }
        }
    }

    fn update_object(&mut self, ctx: &SimContext, guid: ObjectGuid, diff_ms: u32) {
        let now = ctx.now_secs();
        let Some(obj) = self.objects.get_mut(&guid) else {
            return;
        };
        if !obj.is_in_world() {
            return;
        }
        let mut outcome = obj.update_timers(diff_ms);
        ctx.rules.update_object(obj, diff_ms);

        let respawn_at = obj.respawn_at();
        if respawn_at != 0 && now >= respawn_at {
            Self::respawn_now(ctx, self.instance_id, obj);
            outcome.visibility_changed = true;
        }
        let notify = obj.take_need_notify();
        let spawned_creature = obj.as_creature().is_some_and(|c| c.db_guid != 0 && !c.pet);

        if outcome.fields_changed {
            self.pending_updates.insert(guid);
        }
        if outcome.despawn {
            if spawned_creature {
                self.despawn_until_respawn(ctx, guid);
            } else {
                self.add_object_to_remove_list(guid);
            }
        } else if outcome.visibility_changed || notify {
            self.update_object_visibility(ctx, guid);
        }
    }

    /// Flush batched field changes to every player that can see them.
    pub fn send_object_updates(&mut self, ctx: &SimContext) {
        if self.pending_updates.is_empty() {
            return;
        }
        let changed = std::mem::take(&mut self.pending_updates);
        let mut per_player: BTreeMap<ObjectGuid, Vec<ObjectGuid>> = BTreeMap::new();
        for player in &self.players {
            let Some(p) = self.objects.get(player) else {
                continue;
            };
            let guids: Vec<ObjectGuid> = changed
                .iter()
                .copied()
                .filter(|g| *g == *player || p.can_see_object(*g))
                .collect();
            if !guids.is_empty() {
                per_player.insert(*player, guids);
            }
        }
        for (player, guids) in per_player {
            ctx.send(player, &ClientMessage::ObjectUpdates { guids });
        }
    }

    pub(crate) fn mark_changed(&mut self, guid: ObjectGuid) {
        if self.objects.contains_key(&guid) {
            self.pending_updates.insert(guid);
        }
    }

    // --- misc --------------------------------------------------------------

    /// Next map-local low guid for kinds whose ids are unique per map only.
    pub fn generate_local_low_guid(&mut self, high: HighGuid) -> Option<u32> {
        let counter = match high {
            HighGuid::DynamicObject => &mut self.local_guids.dynamic_object,
            HighGuid::Pet => &mut self.local_guids.pet,
            HighGuid::Vehicle => &mut self.local_guids.vehicle,
            _ => {
                tracing::error!(?high, "no map-local guid counter for this kind");
                return None;
            }
        };
        let low = *counter;
        *counter = counter.checked_add(1)?;
        Some(low)
    }

    /// Players that left for another map since the last call.
    pub fn take_transfers(&mut self) -> Vec<Transfer> {
        std::mem::take(&mut self.transfers)
    }

    /// Take a player off this map and queue it for `destination`.
    pub(crate) fn transfer_player(
        &mut self,
        ctx: &SimContext,
        guid: ObjectGuid,
        destination: WorldPosition,
        reason: TransferReason,
    ) {
        if let Some(player) = self.remove(ctx, guid, false) {
            tracing::debug!(map = self.id, %guid, ?reason, to = destination.map_id, "player leaving map");
            self.record(MapEvent::PlayerTransferred { guid, reason });
            self.transfers.push(Transfer {
                player,
                destination,
                reason,
            });
        }
    }

    pub fn set_event_recording(&mut self, on: bool) {
        self.record_events = on;
    }

    pub fn events(&self) -> &[MapEvent] {
        &self.events
    }

    pub fn drain_events(&mut self) -> Vec<MapEvent> {
        std::mem::take(&mut self.events)
    }

    fn record(&mut self, event: MapEvent) {
        if self.record_events {
            self.events.push(event);
        }
    }
}

fn vmap_loading(ctx: &SimContext) -> bool {
    ctx.config.vmap_enabled && ctx.collision.is_loading_enabled()
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("kind", &self.kind)
            .field("grids", &self.created_grid_count())
            .field("objects", &self.objects.len())
            .field("players", &self.players.len())
            .finish_non_exhaustive()
    }
}
