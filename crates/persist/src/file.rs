use std::path::Path;

use parking_lot::Mutex;
use worldgrid_common::{Difficulty, GroupId, ObjectGuid};
use worldgrid_kernel::{
    InstanceBind, InstanceSave, Persistence, PersistenceError, PersistenceState, ResetEvent, RespawnKind,
};

use crate::journal::Mutation;
use crate::store::{StateStore, StoreError};

/// Journal segments written before the state is folded into a snapshot.
const DEFAULT_SNAPSHOT_INTERVAL: u32 = 64;

struct Inner {
    store: StateStore,
    state: PersistenceState,
    pending: Vec<Mutation>,
}

/// [`Persistence`] backed by a [`StateStore`] directory.
///
/// Reads are served from memory. Mutations are applied in memory and queued;
/// [`FilePersistence::flush`] writes the queue as one journal segment. With
/// write-through enabled every mutation is flushed immediately.
pub struct FilePersistence {
    inner: Mutex<Inner>,
    write_through: bool,
    snapshot_interval: u32,
}

impl FilePersistence {
    /// Open a store, verify its hash chain and rebuild the state.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = StateStore::open(path)?;
        store.verify_integrity()?;
        let state = store.load_latest()?;
        tracing::info!(
            root = %store.root().display(),
            saves = state.saves.len(),
            player_binds = state.player_binds.len(),
            respawns = state.respawn_times.len(),
            "map storage loaded"
        );
        Ok(Self {
            inner: Mutex::new(Inner {
                store,
                state,
                pending: Vec::new(),
            }),
            write_through: true,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        })
    }

    /// Queue mutations until [`flush`](Self::flush) instead of writing each one.
    pub fn buffered(mut self) -> Self {
        self.write_through = false;
        self
    }

    pub fn with_snapshot_interval(mut self, segments: u32) -> Self {
        self.snapshot_interval = segments.max(1);
        self
    }

    /// Write queued mutations, then snapshot once enough segments piled up.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        Self::flush_locked(&mut inner, self.snapshot_interval)
    }

    /// Fold the current state into a snapshot regardless of the interval.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        Self::flush_locked(&mut inner, u32::MAX)?;
        let Inner { store, state, .. } = &mut *inner;
        store.take_snapshot(state)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Copy of everything stored so far, flushed or not.
    pub fn snapshot(&self) -> PersistenceState {
        self.inner.lock().state.clone()
    }

    fn flush_locked(inner: &mut Inner, snapshot_interval: u32) -> Result<(), StoreError> {
        if inner.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut inner.pending);
        if let Err(e) = inner.store.append_journal(&pending) {
            inner.pending = pending;
            return Err(e);
        }
        if inner.store.segments_since_snapshot() >= snapshot_interval {
            let Inner { store, state, .. } = inner;
            store.take_snapshot(state)?;
            tracing::debug!(snapshot = store.meta().snapshot_count, "map storage snapshot taken");
        }
        Ok(())
    }

    fn mutate(&self, mutation: Mutation) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock();
        mutation.apply(&mut inner.state)?;
        inner.pending.push(mutation);
        if self.write_through {
            Self::flush_locked(&mut inner, self.snapshot_interval)
                .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FilePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FilePersistence")
            .field("root", &inner.store.root())
            .field("pending", &inner.pending.len())
            .field("write_through", &self.write_through)
            .finish()
    }
}

impl Persistence for FilePersistence {
    fn instance_save(&self, instance_id: u32) -> Option<InstanceSave> {
        self.inner.lock().state.saves.get(&instance_id).cloned()
    }

    fn add_instance_save(&self, save: InstanceSave) -> Result<(), PersistenceError> {
        self.mutate(Mutation::AddSave(save))
    }

    fn delete_instance(&self, instance_id: u32) -> Result<(), PersistenceError> {
        self.mutate(Mutation::DeleteInstance(instance_id))
    }

    fn player_bind(&self, player: ObjectGuid, map_id: u32, difficulty: Difficulty) -> Option<InstanceBind> {
        self.inner
            .lock()
            .state
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
        self.mutate(Mutation::BindPlayer {
            player,
            map_id,
            difficulty,
            bind,
        })
    }

    fn unbind_player(&self, player: ObjectGuid, map_id: u32, difficulty: Difficulty) -> Result<(), PersistenceError> {
        self.mutate(Mutation::UnbindPlayer {
            player,
            map_id,
            difficulty,
        })
    }

    fn group_bind(&self, group: GroupId, map_id: u32, difficulty: Difficulty) -> Option<InstanceBind> {
        self.inner
            .lock()
            .state
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
        self.mutate(Mutation::BindGroup {
            group,
            map_id,
            difficulty,
            bind,
        })
    }

    fn load_instance_data(&self, instance_id: u32) -> Option<String> {
        self.inner.lock().state.instance_data.get(&instance_id).cloned()
    }

    fn save_instance_data(&self, instance_id: u32, data: &str) -> Result<(), PersistenceError> {
        self.mutate(Mutation::InstanceData {
            instance_id,
            data: data.to_string(),
        })
    }

    fn respawn_time(&self, kind: RespawnKind, db_guid: u32, instance_id: u32) -> u64 {
        self.inner
            .lock()
            .state
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
        self.mutate(Mutation::RespawnTime {
            kind,
            db_guid,
            instance_id,
            at_secs,
        })
    }

    fn delete_respawn_times(&self, instance_id: u32) -> Result<(), PersistenceError> {
        self.mutate(Mutation::DeleteRespawnTimes(instance_id))
    }

    fn schedule_reset(&self, event: ResetEvent) -> Result<(), PersistenceError> {
        self.mutate(Mutation::ScheduleReset(event))
    }

    fn cancel_reset(&self, instance_id: u32) -> Result<(), PersistenceError> {
        self.mutate(Mutation::CancelReset(instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn save(id: u32) -> InstanceSave {
        InstanceSave {
            instance_id: id,
            map_id: 36,
            difficulty: Difficulty::REGULAR,
            reset_time: 7200,
            can_reset: true,
        }
    }

    fn temp_bind(instance_id: u32) -> InstanceBind {
        InstanceBind {
            instance_id,
            permanent: false,
        }
    }

    #[test]
    fn reopen_preserves_binds_and_respawns() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("maps");
        let player = ObjectGuid::player(3);
        {
            let store = FilePersistence::open(&path).unwrap();
            store.add_instance_save(save(5)).unwrap();
            store.bind_player(player, 36, Difficulty::REGULAR, temp_bind(5)).unwrap();
            store.bind_group(GroupId(1), 36, Difficulty::REGULAR, temp_bind(5)).unwrap();
            store.save_respawn_time(RespawnKind::Creature, 12, 5, 3600).unwrap();
            store.save_instance_data(5, "false|true|").unwrap();
        }

        let store = FilePersistence::open(&path).unwrap();
        assert_eq!(store.instance_save(5), Some(save(5)));
        assert_eq!(store.player_bind(player, 36, Difficulty::REGULAR), Some(temp_bind(5)));
        assert_eq!(store.group_bind(GroupId(1), 36, Difficulty::REGULAR), Some(temp_bind(5)));
        assert_eq!(store.respawn_time(RespawnKind::Creature, 12, 5), 3600);
        assert_eq!(store.load_instance_data(5).as_deref(), Some("false|true|"));
    }

    #[test]
    fn missing_save_is_not_journaled() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilePersistence::open(tmp.path().join("maps")).unwrap().buffered();
        let err = store
            .bind_player(ObjectGuid::player(1), 36, Difficulty::REGULAR, temp_bind(9))
            .unwrap_err();
        assert_eq!(err, PersistenceError::MissingSave(9));
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn buffered_writes_need_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("maps");
        let store = FilePersistence::open(&path).unwrap().buffered();
        store.add_instance_save(save(2)).unwrap();
        store.schedule_reset(ResetEvent {
            map_id: 36,
            difficulty: Difficulty::REGULAR,
            instance_id: 2,
            at_secs: 7200,
        })
        .unwrap();
        assert_eq!(store.pending_len(), 2);
        assert!(FilePersistence::open(&path).unwrap().instance_save(2).is_none());

        store.flush().unwrap();
        assert_eq!(store.pending_len(), 0);
        let reopened = FilePersistence::open(&path).unwrap();
        assert_eq!(reopened.snapshot().resets[&2].at_secs, 7200);
    }

    #[test]
    fn snapshot_interval_folds_journal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("maps");
        let store = FilePersistence::open(&path).unwrap().with_snapshot_interval(2);
        store.add_instance_save(save(1)).unwrap();
        store.add_instance_save(save(2)).unwrap();
        store.delete_instance(1).unwrap();

        let reopened = FilePersistence::open(&path).unwrap();
        assert_eq!(reopened.snapshot(), store.snapshot());
        assert!(reopened.instance_save(1).is_none());
        assert!(reopened.instance_save(2).is_some());
    }

    #[test]
    fn checkpoint_then_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("maps");
        let store = FilePersistence::open(&path).unwrap().buffered();
        store.add_instance_save(save(4)).unwrap();
        store.save_respawn_time(RespawnKind::GameObject, 3, 4, 50).unwrap();
        store.delete_respawn_times(4).unwrap();
        store.checkpoint().unwrap();

        let reopened = FilePersistence::open(&path).unwrap();
        assert_eq!(reopened.respawn_time(RespawnKind::GameObject, 3, 4), 0);
        assert_eq!(reopened.snapshot(), store.snapshot());
    }

    #[test]
    fn dungeon_entry_binds_are_durable() {
        use std::sync::Arc;
        use worldgrid_common::WorldPosition;
        use worldgrid_kernel::{MapEntry, MapManager, MapType, SimContext, WorldConfig, WorldObject};

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("maps");
        let player = ObjectGuid::player(8);
        {
            let persistence = Arc::new(FilePersistence::open(&path).unwrap());
            let config = WorldConfig {
                data_path: tmp.path().join("no-terrain"),
                maps: vec![MapEntry::new(36, "Deadmines", MapType::Dungeon).with_difficulty(5, 0)],
                ..WorldConfig::default()
            };
            let mut manager = MapManager::new(SimContext::new(config).with_persistence(persistence));
            let at = WorldPosition::new(36, 0, 10.0, 10.0, 0.0, 0.0);
            manager
                .enter(WorldObject::player(8, "p8".to_string(), at), Difficulty::REGULAR)
                .unwrap();
            assert_eq!(manager.instance_count(), 1);
        }

        let reopened = FilePersistence::open(&path).unwrap();
        let bind = reopened.player_bind(player, 36, Difficulty::REGULAR).unwrap();
        assert_eq!(reopened.instance_save(bind.instance_id).unwrap().map_id, 36);
    }
}
