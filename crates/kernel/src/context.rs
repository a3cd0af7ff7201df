//! The simulation context: configuration plus every collaborator the map
//! layer calls out to. Passed into each map operation instead of globals.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use worldgrid_common::{Difficulty, GroupId, HighGuid, ObjectGuid, WorldPosition};
use worldgrid_stream::GridCoord;
use worldgrid_terrain::{CollisionManager, NullCollision, TerrainLoader, TerrainStore};

use crate::config::WorldConfig;
use crate::message::ClientMessage;
use crate::object::{GameObjectType, WorldObject};
use crate::persistence::{MemoryPersistence, Persistence};
use crate::script::ScriptLibrary;

/// Delivers messages to player sessions.
pub trait SessionSink: Send + Sync {
    fn send(&self, player: ObjectGuid, message: &ClientMessage);
}

/// Drops every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSessions;

impl SessionSink for NullSessions {
    fn send(&self, _player: ObjectGuid, _message: &ClientMessage) {}
}

/// Keeps every message in send order.
#[derive(Debug, Default)]
pub struct RecordingSessions {
    sent: Mutex<Vec<(ObjectGuid, ClientMessage)>>,
}

impl RecordingSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(ObjectGuid, ClientMessage)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, player: ObjectGuid) -> Vec<ClientMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| *to == player)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn take(&self) -> Vec<(ObjectGuid, ClientMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl SessionSink for RecordingSessions {
    fn send(&self, player: ObjectGuid, message: &ClientMessage) {
        self.sent.lock().push((player, message.clone()));
    }
}

/// One row of spawn data.
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnRecord {
    Creature {
        db_guid: u32,
        entry: u32,
        position: WorldPosition,
        respawn_delay_secs: u32,
        active: bool,
    },
    GameObject {
        db_guid: u32,
        entry: u32,
        go_type: GameObjectType,
        position: WorldPosition,
        respawn_delay_secs: u32,
        /// False for objects that only appear when scripted.
        spawned: bool,
    },
}

impl SpawnRecord {
    pub fn position(&self) -> &WorldPosition {
        match self {
            SpawnRecord::Creature { position, .. } | SpawnRecord::GameObject { position, .. } => {
                position
            }
        }
    }

    /// Build the live object, tagged with the map it is loaded into.
    pub fn instantiate(&self, map_id: u32, instance_id: u32) -> WorldObject {
        match *self {
            SpawnRecord::Creature {
                db_guid,
                entry,
                position,
                respawn_delay_secs,
                active,
            } => {
                let position = WorldPosition { map_id, instance_id, ..position };
                let mut creature =
                    WorldObject::spawned_creature(entry, db_guid, position).with_active(active);
                if let Some(c) = creature.as_creature_mut() {
                    c.respawn_delay_secs = respawn_delay_secs;
                }
                creature
            }
            SpawnRecord::GameObject {
                db_guid,
                entry,
                go_type,
                position,
                respawn_delay_secs,
                spawned,
            } => {
                let position = WorldPosition { map_id, instance_id, ..position };
                let mut go = WorldObject::spawned_game_object(entry, db_guid, go_type, position);
                if let Some(g) = go.as_game_object_mut() {
                    g.spawned = spawned;
                    g.respawn_delay_secs = respawn_delay_secs;
                }
                go
            }
        }
    }
}

/// A persisted corpse waiting for its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpseRecord {
    pub low: u32,
    pub owner: ObjectGuid,
    pub position: WorldPosition,
}

/// Where the grid loader reads spawn data from.
pub trait SpawnSource: Send + Sync {
    fn spawns(&self, map_id: u32, difficulty: Difficulty, grid: GridCoord) -> Vec<SpawnRecord>;

    fn corpses(&self, map_id: u32, instance_id: u32, grid: GridCoord) -> Vec<CorpseRecord>;
}

/// Spawn data held in memory, indexed by grid.
#[derive(Debug, Default, Clone)]
pub struct StaticSpawns {
    spawns: Vec<(Difficulty, SpawnRecord)>,
    corpses: Vec<CorpseRecord>,
}

impl StaticSpawns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spawn(mut self, difficulty: Difficulty, record: SpawnRecord) -> Self {
        self.spawns.push((difficulty, record));
        self
    }

    pub fn with_corpse(mut self, corpse: CorpseRecord) -> Self {
        self.corpses.push(corpse);
        self
    }

    pub fn len(&self) -> usize {
        self.spawns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spawns.is_empty()
    }
}

fn in_grid(position: &WorldPosition, grid: GridCoord) -> bool {
    GridCoord::from_world(position.x(), position.y()) == Ok(grid)
}

impl SpawnSource for StaticSpawns {
    fn spawns(&self, map_id: u32, difficulty: Difficulty, grid: GridCoord) -> Vec<SpawnRecord> {
        self.spawns
            .iter()
            .filter(|(diff, record)| {
                *diff == difficulty
                    && record.position().map_id == map_id
                    && in_grid(record.position(), grid)
            })
            .map(|(_, record)| record.clone())
            .collect()
    }

    fn corpses(&self, map_id: u32, instance_id: u32, grid: GridCoord) -> Vec<CorpseRecord> {
        self.corpses
            .iter()
            .filter(|c| {
                c.position.map_id == map_id
                    && c.position.instance_id == instance_id
                    && in_grid(&c.position, grid)
            })
            .cloned()
            .collect()
    }
}

/// Per-instance script content (boss state, doors, encounter progress).
pub trait InstanceScript: Send {
    fn initialize(&mut self) {}

    fn load(&mut self, _data: &str) {}

    /// Serialized state to persist, or `None` when there is nothing to keep.
    fn save(&self) -> Option<String> {
        None
    }

    fn update(&mut self, _diff_ms: u32) {}

    fn on_player_enter(&mut self, _player: ObjectGuid) {}

    fn on_object_create(&mut self, _object: &WorldObject) {}

    fn is_encounter_in_progress(&self) -> bool {
        false
    }
}

/// Game rule content. Every hook defaults to doing nothing.
pub trait GameRules: Send + Sync {
    fn update_player(&self, _player: &mut WorldObject, _diff_ms: u32) {}

    fn update_object(&self, _object: &mut WorldObject, _diff_ms: u32) {}

    /// Whether `group` is fighting inside `instance_id`; blocks new entries.
    fn group_in_combat_with_instance(&self, _group: GroupId, _instance_id: u32) -> bool {
        false
    }

    fn group_leader(&self, _group: GroupId) -> Option<ObjectGuid> {
        None
    }

    fn kill_credit(&self, _player: ObjectGuid, _creature_entry: u32, _group: bool) {}

    fn area_explored(&self, _player: ObjectGuid, _quest_id: u32) {}

    fn fail_quest(&self, _player: ObjectGuid, _quest_id: u32) {}

    fn cast_spell(&self, _caster: ObjectGuid, _target: ObjectGuid, _spell_id: u32, _triggered: bool) {}

    fn remove_auras(&self, _target: ObjectGuid, _spell_id: u32) {}

    /// Whether the item fit in the player's bags.
    fn create_item(&self, _player: ObjectGuid, _item_entry: u32, _count: u32) -> bool {
        true
    }

    fn use_object(&self, _user: ObjectGuid, _object: ObjectGuid) {}

    fn create_instance_script(&self, _script_id: u32, _map_id: u32) -> Option<Box<dyn InstanceScript>> {
        None
    }
}

/// Rules that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRules;

impl GameRules for DefaultRules {}

/// Game time in whole seconds.
pub trait GameClock: Send + Sync {
    fn now_secs(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl GameClock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_secs: u64) -> Self {
        Self {
            now: AtomicU64::new(start_secs),
        }
    }

    pub fn set(&self, secs: u64) {
        self.now.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl GameClock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// World-wide low guid counters for kinds that are unique across maps.
#[derive(Debug)]
pub struct GuidGenerator {
    creature: AtomicU32,
    game_object: AtomicU32,
    corpse: AtomicU32,
    instance: AtomicU32,
}

impl Default for GuidGenerator {
    fn default() -> Self {
        Self {
            creature: AtomicU32::new(1),
            game_object: AtomicU32::new(1),
            corpse: AtomicU32::new(1),
            instance: AtomicU32::new(1),
        }
    }
}

impl GuidGenerator {
    /// Start counters above ids already used by loaded spawn data.
    pub fn starting_at(first_low: u32) -> Self {
        let start = first_low.max(1);
        Self {
            creature: AtomicU32::new(start),
            game_object: AtomicU32::new(start),
            corpse: AtomicU32::new(start),
            instance: AtomicU32::new(1),
        }
    }

    /// Next low guid for `high`, or `None` for kinds generated per map.
    pub fn next(&self, high: HighGuid) -> Option<u32> {
        let counter = match high {
            HighGuid::Unit => &self.creature,
            HighGuid::GameObject => &self.game_object,
            HighGuid::Corpse => &self.corpse,
            _ => return None,
        };
        Some(counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_instance_id(&self) -> u32 {
        self.instance.fetch_add(1, Ordering::Relaxed)
    }
}

/// Configuration and collaborators for one world.
#[derive(Clone)]
pub struct SimContext {
    pub config: Arc<WorldConfig>,
    pub terrain: Arc<TerrainStore>,
    pub collision: Arc<dyn CollisionManager>,
    pub sessions: Arc<dyn SessionSink>,
    pub persistence: Arc<dyn Persistence>,
    pub spawns: Arc<dyn SpawnSource>,
    pub rules: Arc<dyn GameRules>,
    pub scripts: Arc<ScriptLibrary>,
    pub clock: Arc<dyn GameClock>,
    pub guids: Arc<GuidGenerator>,
    scheduled_scripts: Arc<AtomicUsize>,
}

impl SimContext {
    /// A context with inert collaborators: no sessions, in-memory storage,
    /// no spawns, default rules and the system clock.
    pub fn new(config: WorldConfig) -> Self {
        let loader = TerrainLoader::new(
            config.data_path.clone(),
            config.accepted_client_builds.clone(),
        );
        Self {
            config: Arc::new(config),
            terrain: Arc::new(TerrainStore::new(loader)),
            collision: Arc::new(NullCollision),
            sessions: Arc::new(NullSessions),
            persistence: Arc::new(MemoryPersistence::new()),
            spawns: Arc::new(StaticSpawns::new()),
            rules: Arc::new(DefaultRules),
            scripts: Arc::new(ScriptLibrary::new()),
            clock: Arc::new(SystemClock),
            guids: Arc::new(GuidGenerator::default()),
            scheduled_scripts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_collision(mut self, collision: Arc<dyn CollisionManager>) -> Self {
        self.collision = collision;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionSink>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_spawns(mut self, spawns: Arc<dyn SpawnSource>) -> Self {
        self.spawns = spawns;
        self
    }

    pub fn with_rules(mut self, rules: Arc<dyn GameRules>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_scripts(mut self, scripts: Arc<ScriptLibrary>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn GameClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_guids(mut self, guids: Arc<GuidGenerator>) -> Self {
        self.guids = guids;
        self
    }

    pub fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }

    pub fn send(&self, player: ObjectGuid, message: &ClientMessage) {
        self.sessions.send(player, message);
    }

    /// Script steps queued on every map of this world.
    pub fn scheduled_script_count(&self) -> usize {
        self.scheduled_scripts.load(Ordering::Relaxed)
    }

    pub(crate) fn increase_scheduled_scripts(&self) {
        self.scheduled_scripts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrease_scheduled_scripts(&self, count: usize) {
        let _ = self
            .scheduled_scripts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(count))
            });
    }
}

impl std::fmt::Debug for SimContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimContext")
            .field("config", &self.config)
            .field("scheduled_scripts", &self.scheduled_script_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(x: f32, y: f32) -> WorldPosition {
        WorldPosition::new(0, 0, x, y, 0.0, 0.0)
    }

    #[test]
    fn static_spawns_filter_by_grid_and_difficulty() {
        let spawns = StaticSpawns::new()
            .with_spawn(
                Difficulty::REGULAR,
                SpawnRecord::Creature {
                    db_guid: 1,
                    entry: 10,
                    position: pos(10.0, 10.0),
                    respawn_delay_secs: 60,
                    active: false,
                },
            )
            .with_spawn(
                Difficulty(1),
                SpawnRecord::Creature {
                    db_guid: 2,
                    entry: 10,
                    position: pos(10.0, 10.0),
                    respawn_delay_secs: 60,
                    active: false,
                },
            );
        let grid = GridCoord::from_world(10.0, 10.0).unwrap();
        let other = GridCoord::from_world(1000.0, 1000.0).unwrap();
        assert_eq!(spawns.spawns(0, Difficulty::REGULAR, grid).len(), 1);
        assert_eq!(spawns.spawns(0, Difficulty::REGULAR, other).len(), 0);
        assert_eq!(spawns.spawns(1, Difficulty::REGULAR, grid).len(), 0);
    }

    #[test]
    fn instantiated_spawn_takes_the_target_instance() {
        let record = SpawnRecord::GameObject {
            db_guid: 4,
            entry: 20,
            go_type: GameObjectType::Door,
            position: pos(1.0, 1.0),
            respawn_delay_secs: 0,
            spawned: false,
        };
        let go = record.instantiate(36, 9);
        assert_eq!(go.instance_id(), 9);
        assert_eq!(go.db_guid(), 4);
        assert!(!go.is_visible_to_players());
    }

    #[test]
    fn per_map_guid_kinds_are_not_generated_globally() {
        let guids = GuidGenerator::starting_at(100);
        assert_eq!(guids.next(HighGuid::Unit), Some(100));
        assert_eq!(guids.next(HighGuid::Unit), Some(101));
        assert_eq!(guids.next(HighGuid::Pet), None);
    }

    #[test]
    fn scheduled_counter_never_underflows() {
        let ctx = SimContext::new(WorldConfig::default());
        ctx.increase_scheduled_scripts();
        ctx.decrease_scheduled_scripts(3);
        assert_eq!(ctx.scheduled_script_count(), 0);
    }

    #[test]
    fn recording_sessions_filter_by_player() {
        let sessions = RecordingSessions::new();
        let a = ObjectGuid::player(1);
        let b = ObjectGuid::player(2);
        sessions.send(a, &ClientMessage::InstanceSaveCreated);
        sessions.send(b, &ClientMessage::InstanceResetFailed { map_id: 1 });
        assert_eq!(sessions.sent_to(a), vec![ClientMessage::InstanceSaveCreated]);
        assert_eq!(sessions.take().len(), 2);
        assert!(sessions.sent().is_empty());
    }
}
