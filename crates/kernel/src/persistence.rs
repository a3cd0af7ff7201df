//! The persistence interface and an in-memory backend.
//!
//! The map layer treats every call here as a remote operation that may fail
//! independently of map state: failures are logged by the caller and never
//! roll back in-memory changes.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use worldgrid_common::{Difficulty, GroupId, ObjectGuid};

use crate::error::PersistenceError;

/// Persisted record of one dungeon instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSave {
    pub instance_id: u32,
    pub map_id: u32,
    pub difficulty: Difficulty,
    /// Game time (seconds) of the next scheduled reset, 0 when none.
    pub reset_time: u64,
    /// Cleared once a boss kill binds players permanently.
    pub can_reset: bool,
}

/// A player's or group's tie to an instance save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceBind {
    pub instance_id: u32,
    pub permanent: bool,
}

/// A planned reset of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetEvent {
    pub map_id: u32,
    pub difficulty: Difficulty,
    pub instance_id: u32,
    pub at_secs: u64,
}

/// Which spawn table a respawn record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RespawnKind {
    Creature,
    GameObject,
}

type BindKey = (u64, u32, Difficulty);
type RespawnKey = (RespawnKind, u32, u32);

/// Every record the persistence interface manages.
///
/// Backends wrap this and decide when to write it out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceState {
    pub saves: BTreeMap<u32, InstanceSave>,
    pub player_binds: BTreeMap<BindKey, InstanceBind>,
    pub group_binds: BTreeMap<BindKey, InstanceBind>,
    pub instance_data: BTreeMap<u32, String>,
    pub respawn_times: BTreeMap<RespawnKey, u64>,
    pub resets: BTreeMap<u32, ResetEvent>,
}

impl PersistenceState {
    pub fn add_instance_save(&mut self, save: InstanceSave) {
        self.saves.insert(save.instance_id, save);
    }

    /// Drop an instance save together with every record that refers to it.
    pub fn delete_instance(&mut self, instance_id: u32) {
        self.saves.remove(&instance_id);
        self.instance_data.remove(&instance_id);
        self.resets.remove(&instance_id);
        self.respawn_times.retain(|(_, _, inst), _| *inst != instance_id);
        self.player_binds.retain(|_, bind| bind.instance_id != instance_id);
        self.group_binds.retain(|_, bind| bind.instance_id != instance_id);
    }

    pub fn bind_player(
        &mut self,
        player: ObjectGuid,
        map_id: u32,
        difficulty: Difficulty,
        bind: InstanceBind,
    ) -> Result<(), PersistenceError> {
        if !self.saves.contains_key(&bind.instance_id) {
            return Err(PersistenceError::MissingSave(bind.instance_id));
        }
        self.player_binds
            .insert((player.raw(), map_id, difficulty), bind);
        Ok(())
    }

    pub fn unbind_player(&mut self, player: ObjectGuid, map_id: u32, difficulty: Difficulty) {
        self.player_binds.remove(&(player.raw(), map_id, difficulty));
    }

    pub fn bind_group(
        &mut self,
        group: GroupId,
        map_id: u32,
        difficulty: Difficulty,
        bind: InstanceBind,
    ) -> Result<(), PersistenceError> {
        if !self.saves.contains_key(&bind.instance_id) {
            return Err(PersistenceError::MissingSave(bind.instance_id));
        }
        self.group_binds
            .insert((u64::from(group.0), map_id, difficulty), bind);
        Ok(())
    }

    pub fn save_respawn_time(&mut self, kind: RespawnKind, db_guid: u32, instance_id: u32, at_secs: u64) {
        let key = (kind, db_guid, instance_id);
        if at_secs == 0 {
            self.respawn_times.remove(&key);
        } else {
            self.respawn_times.insert(key, at_secs);
        }
    }

    pub fn delete_respawn_times(&mut self, instance_id: u32) {
        self.respawn_times.retain(|(_, _, inst), _| *inst != instance_id);
    }
}

/// Storage operations the map layer depends on.
pub trait Persistence: Send + Sync {
    fn instance_save(&self, instance_id: u32) -> Option<InstanceSave>;

    fn add_instance_save(&self, save: InstanceSave) -> Result<(), PersistenceError>;

    /// Remove an instance save and all binds, script data and respawn times of it.
    fn delete_instance(&self, instance_id: u32) -> Result<(), PersistenceError>;

    fn player_bind(&self, player: ObjectGuid, map_id: u32, difficulty: Difficulty) -> Option<InstanceBind>;

    fn bind_player(
        &self,
        player: ObjectGuid,
        map_id: u32,
        difficulty: Difficulty,
        bind: InstanceBind,
    ) -> Result<(), PersistenceError>;

    fn unbind_player(&self, player: ObjectGuid, map_id: u32, difficulty: Difficulty) -> Result<(), PersistenceError>;

    fn group_bind(&self, group: GroupId, map_id: u32, difficulty: Difficulty) -> Option<InstanceBind>;

    fn bind_group(
        &self,
        group: GroupId,
        map_id: u32,
        difficulty: Difficulty,
        bind: InstanceBind,
    ) -> Result<(), PersistenceError>;

    fn load_instance_data(&self, instance_id: u32) -> Option<String>;

    fn save_instance_data(&self, instance_id: u32, data: &str) -> Result<(), PersistenceError>;

    /// Game time at which a spawn may come back; 0 when it is not dead.
    fn respawn_time(&self, kind: RespawnKind, db_guid: u32, instance_id: u32) -> u64;

    /// Record a respawn time; 0 clears the record.
    fn save_respawn_time(
        &self,
        kind: RespawnKind,
        db_guid: u32,
        instance_id: u32,
        at_secs: u64,
    ) -> Result<(), PersistenceError>;

    fn delete_respawn_times(&self, instance_id: u32) -> Result<(), PersistenceError>;

    fn schedule_reset(&self, event: ResetEvent) -> Result<(), PersistenceError>;

    fn cancel_reset(&self, instance_id: u32) -> Result<(), PersistenceError>;
}

/// Persistence kept in process memory. Used by tests and headless runs.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<PersistenceState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything stored so far.
    pub fn snapshot(&self) -> PersistenceState {
        self.state.lock().clone()
    }
}

impl Persistence for MemoryPersistence {
    fn instance_save(&self, instance_id: u32) -> Option<InstanceSave> {
        self.state.lock().saves.get(&instance_id).cloned()
    }

    fn add_instance_save(&self, save: InstanceSave) -> Result<(), PersistenceError> {
        self.state.lock().add_instance_save(save);
        Ok(())
    }

    fn delete_instance(&self, instance_id: u32) -> Result<(), PersistenceError> {
        self.state.lock().delete_instance(instance_id);
        Ok(())
    }

    fn player_bind(&self, player: ObjectGuid, map_id: u32, difficulty: Difficulty) -> Option<InstanceBind> {
        self.state
            .lock()
            .player_binds
            .get(&(player.raw(), map_id, difficulty))
            .copied()
    }

    fn bind_player(
        &self,
        player: ObjectGuid,
        map_id: u32,
        difficulty: Difficulty,
        bind: InstanceBind,
    ) -> Result<(), PersistenceError> {
        self.state.lock().bind_player(player, map_id, difficulty, bind)
    }

    fn unbind_player(&self, player: ObjectGuid, map_id: u32, difficulty: Difficulty) -> Result<(), PersistenceError> {
        self.state.lock().unbind_player(player, map_id, difficulty);
        Ok(())
    }

    fn group_bind(&self, group: GroupId, map_id: u32, difficulty: Difficulty) -> Option<InstanceBind> {
        self.state
            .lock()
            .group_binds
            .get(&(u64::from(group.0), map_id, difficulty))
            .copied()
    }

    fn bind_group(
        &self,
        group: GroupId,
        map_id: u32,
        difficulty: Difficulty,
        bind: InstanceBind,
    ) -> Result<(), PersistenceError> {
        self.state.lock().bind_group(group, map_id, difficulty, bind)
    }

    fn load_instance_data(&self, instance_id: u32) -> Option<String> {
        self.state.lock().instance_data.get(&instance_id).cloned()
    }

    fn save_instance_data(&self, instance_id: u32, data: &str) -> Result<(), PersistenceError> {
        self.state
            .lock()
            .instance_data
            .insert(instance_id, data.to_string());
        Ok(())
    }

    fn respawn_time(&self, kind: RespawnKind, db_guid: u32, instance_id: u32) -> u64 {
        self.state
            .lock()
            .respawn_times
            .get(&(kind, db_guid, instance_id))
            .copied()
            .unwrap_or(0)
    }

    fn save_respawn_time(
        &self,
        kind: RespawnKind,
        db_guid: u32,
        instance_id: u32,
        at_secs: u64,
    ) -> Result<(), PersistenceError> {
        self.state
            .lock()
            .save_respawn_time(kind, db_guid, instance_id, at_secs);
        Ok(())
    }

    fn delete_respawn_times(&self, instance_id: u32) -> Result<(), PersistenceError> {
        self.state.lock().delete_respawn_times(instance_id);
        Ok(())
    }

    fn schedule_reset(&self, event: ResetEvent) -> Result<(), PersistenceError> {
        self.state.lock().resets.insert(event.instance_id, event);
        Ok(())
    }

    fn cancel_reset(&self, instance_id: u32) -> Result<(), PersistenceError> {
        self.state.lock().resets.remove(&instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn save(instance_id: u32) -> InstanceSave {
        InstanceSave {
            instance_id,
            map_id: 36,
            difficulty: Difficulty::REGULAR,
            reset_time: 0,
            can_reset: true,
        }
    }

    #[test]
    fn binding_requires_a_save() {
        let store = MemoryPersistence::new();
        let player = ObjectGuid::player(1);
        let bind = InstanceBind {
            instance_id: 5,
            permanent: false,
        };
        assert_eq!(
            store.bind_player(player, 36, Difficulty::REGULAR, bind),
            Err(PersistenceError::MissingSave(5))
        );
        store.add_instance_save(save(5)).unwrap();
        store.bind_player(player, 36, Difficulty::REGULAR, bind).unwrap();
        assert_eq!(store.player_bind(player, 36, Difficulty::REGULAR), Some(bind));
        assert_eq!(store.player_bind(player, 36, Difficulty(1)), None);
    }

    #[test]
    fn zero_respawn_time_clears_the_record() {
        let store = MemoryPersistence::new();
        store.save_respawn_time(RespawnKind::Creature, 10, 0, 500).unwrap();
        assert_eq!(store.respawn_time(RespawnKind::Creature, 10, 0), 500);
        assert_eq!(store.respawn_time(RespawnKind::GameObject, 10, 0), 0);
        store.save_respawn_time(RespawnKind::Creature, 10, 0, 0).unwrap();
        assert_eq!(store.respawn_time(RespawnKind::Creature, 10, 0), 0);
    }

    #[test]
    fn deleting_an_instance_drops_everything_tied_to_it() {
        let store = MemoryPersistence::new();
        store.add_instance_save(save(5)).unwrap();
        store.add_instance_save(save(6)).unwrap();
        let bind = InstanceBind {
            instance_id: 5,
            permanent: true,
        };
        store
            .bind_group(GroupId(1), 36, Difficulty::REGULAR, bind)
            .unwrap();
        store.save_instance_data(5, "boss=done").unwrap();
        store.save_respawn_time(RespawnKind::Creature, 1, 5, 100).unwrap();
        store.save_respawn_time(RespawnKind::Creature, 1, 6, 100).unwrap();

        store.delete_instance(5).unwrap();

        let state = store.snapshot();
        assert!(!state.saves.contains_key(&5));
        assert!(state.saves.contains_key(&6));
        assert!(state.group_binds.is_empty());
        assert!(state.instance_data.is_empty());
        assert_eq!(store.respawn_time(RespawnKind::Creature, 1, 6), 100);
    }
}
