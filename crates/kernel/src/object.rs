//! Live objects and their per-kind data.
//!
//! Every object placed on a map is a [`WorldObject`]: a guid, a position,
//! grid membership and an [`ObjectKind`] tag carrying kind-specific state.
//! Map code dispatches on the tag instead of on concrete types.

use std::collections::BTreeSet;

use worldgrid_common::{GroupId, HighGuid, ObjectGuid, Team, TypeId, WorldPosition};
use worldgrid_stream::{CellCoord, CoordError, TimeTracker};

/// Fields at or below this index (guid, type, entry) are not script-writable.
pub const OBJECT_FIELD_ENTRY: u32 = 3;

const PLAYER_VALUES: usize = 1326;
const UNIT_VALUES: usize = 148;
const GAMEOBJECT_VALUES: usize = 18;
const DYNAMICOBJECT_VALUES: usize = 12;
const CORPSE_VALUES: usize = 36;

/// Something with a world position.
pub trait Positioned {
    fn position(&self) -> &WorldPosition;

    /// The cell the current position falls in.
    fn computed_cell(&self) -> Result<CellCoord, CoordError> {
        let pos = self.position();
        CellCoord::from_world(pos.x(), pos.y())
    }
}

/// Something that can sit in a grid cell.
pub trait GridMember: Positioned {
    fn current_cell(&self) -> Option<CellCoord>;

    /// Tracked cell agrees with the position (or the object is detached).
    fn cell_consistent(&self) -> bool {
        match self.current_cell() {
            Some(cell) => self.computed_cell() == Ok(cell),
            None => true,
        }
    }
}

/// Something that can keep grids alive regardless of player distance.
pub trait Activatable {
    fn is_active(&self) -> bool;

    /// Whether this object holds the active-object lock on its respawn grid.
    fn pins_respawn_grid(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerData {
    pub name: String,
    pub game_master: bool,
    pub team: Team,
    pub group: Option<GroupId>,
    pub homebind: WorldPosition,
    /// Battleground instance this player is queued into, 0 for none.
    pub battleground_id: u32,
    pub battleground_entry_point: Option<WorldPosition>,
    /// Cleared when a global instance reset sends the player home.
    pub instance_valid: bool,
    pub(crate) visible: BTreeSet<ObjectGuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatureData {
    pub entry: u32,
    /// Spawn table id, 0 for creatures not loaded from spawn data.
    pub db_guid: u32,
    pub(crate) respawn_position: WorldPosition,
    pub respawn_delay_secs: u32,
    pub pet: bool,
    pub alive: bool,
    pub in_combat: bool,
    pub emote_state: u32,
    /// Game time a dead creature comes back, 0 while alive.
    pub respawn_at: u64,
    pub(crate) need_notify: bool,
    pub(crate) summon_timer: Option<TimeTracker>,
    pub(crate) despawn_timer: Option<TimeTracker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameObjectType {
    Door,
    Button,
    Chest,
    Trap,
    FishingNode,
    Generic,
}

/// Door and button state. `Ready` is closed / unpressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GoState {
    Active,
    Ready,
}

impl GoState {
    fn toggled(self) -> Self {
        match self {
            GoState::Active => GoState::Ready,
            GoState::Ready => GoState::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameObjectData {
    pub entry: u32,
    pub db_guid: u32,
    pub go_type: GameObjectType,
    pub state: GoState,
    pub spawned: bool,
    pub respawn_delay_secs: u32,
    /// Game time an unspawned object comes back, 0 when not scheduled.
    pub respawn_at: u64,
    pub(crate) revert_timer: Option<TimeTracker>,
    pub(crate) despawn_timer: Option<TimeTracker>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DynamicObjectData {
    pub caster: ObjectGuid,
    pub spell_id: u32,
    pub radius: f32,
    pub(crate) duration: TimeTracker,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorpseData {
    pub owner: ObjectGuid,
    pub bones: bool,
}

/// Kind tag plus kind-specific state.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    Player(PlayerData),
    Creature(CreatureData),
    GameObject(GameObjectData),
    DynamicObject(DynamicObjectData),
    Corpse(CorpseData),
}

/// What a per-tick timer update asks the map to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TimerOutcome {
    pub despawn: bool,
    pub fields_changed: bool,
    pub visibility_changed: bool,
}

/// A live object that can be placed on a map.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldObject {
    guid: ObjectGuid,
    position: WorldPosition,
    active: bool,
    in_world: bool,
    cell: Option<CellCoord>,
    values: Vec<u32>,
    kind: ObjectKind,
}

impl WorldObject {
    fn with_kind(guid: ObjectGuid, position: WorldPosition, values: usize, kind: ObjectKind) -> Self {
        let mut values = vec![0u32; values];
        values[0] = guid.raw() as u32;
        values[1] = (guid.raw() >> 32) as u32;
        values[OBJECT_FIELD_ENTRY as usize] = guid.entry();
        Self {
            guid,
            position,
            active: false,
            in_world: false,
            cell: None,
            values,
            kind,
        }
    }

    pub fn player(low: u32, name: impl Into<String>, position: WorldPosition) -> Self {
        Self::with_kind(
            ObjectGuid::player(low),
            position,
            PLAYER_VALUES,
            ObjectKind::Player(PlayerData {
                name: name.into(),
                game_master: false,
                team: Team::default(),
                group: None,
                homebind: position,
                battleground_id: 0,
                battleground_entry_point: None,
                instance_valid: true,
                visible: BTreeSet::new(),
            }),
        )
    }

    /// A creature not backed by spawn data.
    pub fn creature(entry: u32, low: u32, position: WorldPosition) -> Self {
        Self::with_kind(
            ObjectGuid::new(HighGuid::Unit, entry, low),
            position,
            UNIT_VALUES,
            ObjectKind::Creature(CreatureData {
                entry,
                db_guid: 0,
                respawn_position: position,
                respawn_delay_secs: 0,
                pet: false,
                alive: true,
                in_combat: false,
                emote_state: 0,
                respawn_at: 0,
                need_notify: false,
                summon_timer: None,
                despawn_timer: None,
            }),
        )
    }

    /// A creature loaded from spawn row `db_guid`; it respawns where it was placed.
    pub fn spawned_creature(entry: u32, db_guid: u32, position: WorldPosition) -> Self {
        let mut creature = Self::creature(entry, db_guid, position);
        if let ObjectKind::Creature(data) = &mut creature.kind {
            data.db_guid = db_guid;
        }
        creature
    }

    pub fn pet(entry: u32, low: u32, position: WorldPosition) -> Self {
        let mut pet = Self::creature(entry, low, position);
        pet.guid = ObjectGuid::new(HighGuid::Pet, entry, low);
        if let ObjectKind::Creature(data) = &mut pet.kind {
            data.pet = true;
        }
        pet
    }

    pub fn game_object(
        entry: u32,
        low: u32,
        go_type: GameObjectType,
        position: WorldPosition,
    ) -> Self {
        Self::with_kind(
            ObjectGuid::new(HighGuid::GameObject, entry, low),
            position,
            GAMEOBJECT_VALUES,
            ObjectKind::GameObject(GameObjectData {
                entry,
                db_guid: 0,
                go_type,
                state: GoState::Ready,
                spawned: true,
                respawn_delay_secs: 0,
                respawn_at: 0,
                revert_timer: None,
                despawn_timer: None,
            }),
        )
    }

    pub fn spawned_game_object(
        entry: u32,
        db_guid: u32,
        go_type: GameObjectType,
        position: WorldPosition,
    ) -> Self {
        let mut go = Self::game_object(entry, db_guid, go_type, position);
        if let ObjectKind::GameObject(data) = &mut go.kind {
            data.db_guid = db_guid;
        }
        go
    }

    pub fn dynamic_object(
        low: u32,
        caster: ObjectGuid,
        spell_id: u32,
        radius: f32,
        duration_ms: u32,
        position: WorldPosition,
    ) -> Self {
        Self::with_kind(
            ObjectGuid::new(HighGuid::DynamicObject, 0, low),
            position,
            DYNAMICOBJECT_VALUES,
            ObjectKind::DynamicObject(DynamicObjectData {
                caster,
                spell_id,
                radius,
                duration: TimeTracker::new(u64::from(duration_ms)),
            }),
        )
    }

    pub fn corpse(low: u32, owner: ObjectGuid, position: WorldPosition) -> Self {
        Self::with_kind(
            ObjectGuid::new(HighGuid::Corpse, 0, low),
            position,
            CORPSE_VALUES,
            ObjectKind::Corpse(CorpseData {
                owner,
                bones: false,
            }),
        )
    }

    /// Mark as always simulated, regardless of player distance.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn guid(&self) -> ObjectGuid {
        self.guid
    }

    pub fn type_id(&self) -> TypeId {
        match &self.kind {
            ObjectKind::Player(_) => TypeId::Player,
            ObjectKind::Creature(_) => TypeId::Unit,
            ObjectKind::GameObject(_) => TypeId::GameObject,
            ObjectKind::DynamicObject(_) => TypeId::DynamicObject,
            ObjectKind::Corpse(_) => TypeId::Corpse,
        }
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut ObjectKind {
        &mut self.kind
    }

    pub fn map_id(&self) -> u32 {
        self.position.map_id
    }

    pub fn instance_id(&self) -> u32 {
        self.position.instance_id
    }

    pub fn is_in_world(&self) -> bool {
        self.in_world
    }

    pub fn is_player(&self) -> bool {
        matches!(self.kind, ObjectKind::Player(_))
    }

    pub fn is_creature(&self) -> bool {
        matches!(self.kind, ObjectKind::Creature(_))
    }

    pub fn is_game_master(&self) -> bool {
        matches!(&self.kind, ObjectKind::Player(p) if p.game_master)
    }

    /// Players are always alive here; death is rule content.
    pub fn is_alive(&self) -> bool {
        match &self.kind {
            ObjectKind::Creature(c) => c.alive,
            _ => true,
        }
    }

    pub fn as_player(&self) -> Option<&PlayerData> {
        match &self.kind {
            ObjectKind::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_player_mut(&mut self) -> Option<&mut PlayerData> {
        match &mut self.kind {
            ObjectKind::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_creature(&self) -> Option<&CreatureData> {
        match &self.kind {
            ObjectKind::Creature(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_creature_mut(&mut self) -> Option<&mut CreatureData> {
        match &mut self.kind {
            ObjectKind::Creature(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_game_object(&self) -> Option<&GameObjectData> {
        match &self.kind {
            ObjectKind::GameObject(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_game_object_mut(&mut self) -> Option<&mut GameObjectData> {
        match &mut self.kind {
            ObjectKind::GameObject(g) => Some(g),
            _ => None,
        }
    }

    /// Spawn row id for creatures and game objects loaded from spawn data.
    pub fn db_guid(&self) -> u32 {
        match &self.kind {
            ObjectKind::Creature(c) => c.db_guid,
            ObjectKind::GameObject(g) => g.db_guid,
            _ => 0,
        }
    }

    /// Where a creature goes back to when it cannot follow a move.
    pub fn respawn_position(&self) -> Option<WorldPosition> {
        self.as_creature().map(|c| c.respawn_position)
    }

    /// Whether players may be shown this object at all.
    ///
    /// Dead creatures have had their corpse removed and wait for respawn.
    pub fn is_visible_to_players(&self) -> bool {
        match &self.kind {
            ObjectKind::GameObject(g) => g.spawned,
            ObjectKind::Creature(c) => c.alive,
            _ => true,
        }
    }

    /// Game time at which a dead spawn comes back, 0 when none is pending.
    pub fn respawn_at(&self) -> u64 {
        match &self.kind {
            ObjectKind::Creature(c) => c.respawn_at,
            ObjectKind::GameObject(g) => g.respawn_at,
            _ => 0,
        }
    }

    /// The client-visible set of a player, empty for other kinds.
    pub fn visible_objects(&self) -> impl Iterator<Item = ObjectGuid> + '_ {
        self.as_player().into_iter().flat_map(|p| p.visible.iter().copied())
    }

    pub fn can_see_object(&self, guid: ObjectGuid) -> bool {
        self.as_player().is_some_and(|p| p.visible.contains(&guid))
    }

    pub fn values_count(&self) -> u32 {
        self.values.len() as u32
    }

    pub fn value(&self, index: u32) -> Option<u32> {
        self.values.get(index as usize).copied()
    }

    /// Whether `index` is a field scripts may write.
    pub fn is_writable_field(&self, index: u32) -> bool {
        index > OBJECT_FIELD_ENTRY && index < self.values_count()
    }

    pub(crate) fn set_value(&mut self, index: u32, value: u32) -> bool {
        match self.values.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_flag(&mut self, index: u32, flags: u32) -> bool {
        match self.values.get_mut(index as usize) {
            Some(slot) => {
                *slot |= flags;
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_flag(&mut self, index: u32, flags: u32) -> bool {
        match self.values.get_mut(index as usize) {
            Some(slot) => {
                *slot &= !flags;
                true
            }
            None => false,
        }
    }

    pub(crate) fn relocate(&mut self, x: f32, y: f32, z: f32, orientation: f32) {
        self.position = self.position.moved_to(x, y, z, orientation);
    }

    /// Move an object that is on no map. Placed objects move through their map.
    pub fn place_at(&mut self, destination: WorldPosition) -> bool {
        if self.in_world {
            return false;
        }
        self.position = destination;
        true
    }

    pub(crate) fn set_map(&mut self, map_id: u32, instance_id: u32) {
        self.position.map_id = map_id;
        self.position.instance_id = instance_id;
    }

    pub(crate) fn set_in_world(&mut self, in_world: bool) {
        self.in_world = in_world;
    }

    pub(crate) fn set_current_cell(&mut self, cell: Option<CellCoord>) {
        self.cell = cell;
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub(crate) fn visible_mut(&mut self) -> Option<&mut BTreeSet<ObjectGuid>> {
        self.as_player_mut().map(|p| &mut p.visible)
    }

    pub(crate) fn set_need_notify(&mut self) {
        if let Some(c) = self.as_creature_mut() {
            c.need_notify = true;
        }
    }

    pub(crate) fn take_need_notify(&mut self) -> bool {
        match self.as_creature_mut() {
            Some(c) => std::mem::take(&mut c.need_notify),
            None => false,
        }
    }

    pub(crate) fn combat_stop(&mut self) {
        if let Some(c) = self.as_creature_mut() {
            c.in_combat = false;
        }
    }

    /// Despawn after `delay_ms`; zero means at the next removal pass.
    pub(crate) fn forced_despawn(&mut self, delay_ms: u32) {
        if let Some(c) = self.as_creature_mut() {
            c.despawn_timer = Some(TimeTracker::new(u64::from(delay_ms)));
        }
    }

    /// Despawn after `duration_ms`, or as soon as the creature dies.
    pub(crate) fn set_timed_or_dead_despawn(&mut self, duration_ms: u32) {
        if let Some(c) = self.as_creature_mut() {
            c.summon_timer = Some(TimeTracker::new(u64::from(duration_ms)));
        }
    }

    /// Toggle a door or button, reverting after `restore_secs`.
    ///
    /// Returns false when the object is already mid-use.
    pub(crate) fn use_door_or_button(&mut self, restore_secs: u32) -> bool {
        let Some(go) = self.as_game_object_mut() else {
            return false;
        };
        if go.revert_timer.is_some() {
            return false;
        }
        go.state = go.state.toggled();
        go.revert_timer = Some(TimeTracker::new(u64::from(restore_secs) * 1000));
        true
    }

    /// Spawn an unspawned game object for `despawn_secs`.
    pub(crate) fn respawn_for(&mut self, despawn_secs: u32) -> bool {
        let Some(go) = self.as_game_object_mut() else {
            return false;
        };
        if go.spawned {
            return false;
        }
        go.spawned = true;
        go.despawn_timer = Some(TimeTracker::new(u64::from(despawn_secs) * 1000));
        true
    }

    /// Advance per-object timers by `diff_ms`.
    pub(crate) fn update_timers(&mut self, diff_ms: u32) -> TimerOutcome {
        let diff = u64::from(diff_ms);
        let mut outcome = TimerOutcome::default();
        match &mut self.kind {
            ObjectKind::Creature(c) => {
                if let Some(timer) = &mut c.despawn_timer {
                    timer.update(diff);
                    if timer.passed() {
                        outcome.despawn = true;
                    }
                }
                if let Some(timer) = &mut c.summon_timer {
                    timer.update(diff);
                    if timer.passed() || !c.alive {
                        outcome.despawn = true;
                    }
                }
            }
            ObjectKind::GameObject(g) => {
                if let Some(timer) = &mut g.revert_timer {
                    timer.update(diff);
                    if timer.passed() {
                        g.state = g.state.toggled();
                        g.revert_timer = None;
                        outcome.fields_changed = true;
                    }
                }
                if let Some(timer) = &mut g.despawn_timer {
                    timer.update(diff);
                    if timer.passed() {
                        g.spawned = false;
                        g.despawn_timer = None;
                        outcome.visibility_changed = true;
                    }
                }
            }
            ObjectKind::DynamicObject(d) => {
                d.duration.update(diff);
                if d.duration.passed() {
                    outcome.despawn = true;
                }
            }
            ObjectKind::Player(_) | ObjectKind::Corpse(_) => {}
        }
        outcome
    }
}

impl Positioned for WorldObject {
    fn position(&self) -> &WorldPosition {
        &self.position
    }
}

impl GridMember for WorldObject {
    fn current_cell(&self) -> Option<CellCoord> {
        self.cell
    }
}

impl Activatable for WorldObject {
    fn is_active(&self) -> bool {
        self.active
    }

    fn pins_respawn_grid(&self) -> bool {
        match &self.kind {
            ObjectKind::Creature(c) => self.active && !c.pet && c.db_guid != 0,
            _ => false,
        }
    }
}
