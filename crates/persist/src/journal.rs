use serde::{Deserialize, Serialize};
use worldgrid_common::{Difficulty, GroupId, ObjectGuid};
use worldgrid_kernel::{InstanceBind, InstanceSave, PersistenceError, PersistenceState, ResetEvent, RespawnKind};

/// One change to the stored state, as written to a journal segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    AddSave(InstanceSave),
    DeleteInstance(u32),
    BindPlayer {
        player: ObjectGuid,
        map_id: u32,
        difficulty: Difficulty,
        bind: InstanceBind,
    },
    UnbindPlayer {
        player: ObjectGuid,
        map_id: u32,
        difficulty: Difficulty,
    },
    BindGroup {
        group: GroupId,
        map_id: u32,
        difficulty: Difficulty,
        bind: InstanceBind,
    },
    InstanceData {
        instance_id: u32,
        data: String,
    },
    RespawnTime {
        kind: RespawnKind,
        db_guid: u32,
        instance_id: u32,
        at_secs: u64,
    },
    DeleteRespawnTimes(u32),
    ScheduleReset(ResetEvent),
    CancelReset(u32),
}

impl Mutation {
    /// Apply the change. Binds fail when their save is missing, leaving the
    /// state untouched.
    pub fn apply(&self, state: &mut PersistenceState) -> Result<(), PersistenceError> {
        match self {
            Mutation::AddSave(save) => state.add_instance_save(save.clone()),
            Mutation::DeleteInstance(id) => state.delete_instance(*id),
            Mutation::BindPlayer {
                player,
                map_id,
                difficulty,
                bind,
            } => state.bind_player(*player, *map_id, *difficulty, *bind)?,
            Mutation::UnbindPlayer {
                player,
                map_id,
                difficulty,
            } => state.unbind_player(*player, *map_id, *difficulty),
            Mutation::BindGroup {
                group,
                map_id,
                difficulty,
                bind,
            } => state.bind_group(*group, *map_id, *difficulty, *bind)?,
            Mutation::InstanceData { instance_id, data } => {
                state.instance_data.insert(*instance_id, data.clone());
            }
            Mutation::RespawnTime {
                kind,
                db_guid,
                instance_id,
                at_secs,
            } => state.save_respawn_time(*kind, *db_guid, *instance_id, *at_secs),
            Mutation::DeleteRespawnTimes(id) => state.delete_respawn_times(*id),
            Mutation::ScheduleReset(event) => {
                state.resets.insert(event.instance_id, *event);
            }
            Mutation::CancelReset(id) => {
                state.resets.remove(id);
            }
        }
        Ok(())
    }
}

/// Apply a journal segment in order.
pub fn replay(state: &mut PersistenceState, mutations: &[Mutation]) -> Result<(), PersistenceError> {
    for mutation in mutations {
        mutation.apply(state)?;
    }
    Ok(())
}
