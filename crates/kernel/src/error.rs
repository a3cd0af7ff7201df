use worldgrid_common::ObjectGuid;
use worldgrid_stream::CoordError;

use crate::object::WorldObject;

/// Errors from structural map operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error(transparent)]
    Coord(#[from] CoordError),
    #[error("object {0} is not on this map")]
    UnknownObject(ObjectGuid),
    #[error("object {0} is already on this map")]
    DuplicateObject(ObjectGuid),
    #[error("object {guid} belongs to map {map_id} instance {instance_id}")]
    WrongMap {
        guid: ObjectGuid,
        map_id: u32,
        instance_id: u32,
    },
    #[error("map {map_id} instance {instance_id} does not exist")]
    UnknownMap { map_id: u32, instance_id: u32 },
    #[error("grid data for {0} is not loaded")]
    GridNotLoaded(worldgrid_stream::GridCoord),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

/// Why a player was refused entry to an instance or battleground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("player is already on this map")]
    AlreadyInMap,
    #[error("instance is full ({max_players} players)")]
    MaxPlayers { max_players: u32 },
    #[error("group is in combat inside this instance")]
    ZoneInCombat,
    #[error("player is permanently bound to instance {bound_instance}")]
    BoundElsewhere { bound_instance: u32 },
    #[error("group is bound to instance {bound_instance}")]
    GroupBoundElsewhere { bound_instance: u32 },
    #[error("player is not assigned to battleground {instance_id}")]
    NotInBattleground { instance_id: u32 },
}

/// An object handed to the map that the map refused. The caller gets it back.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct Rejected {
    pub reason: MapError,
    pub object: Box<WorldObject>,
}

impl Rejected {
    pub fn new(reason: impl Into<MapError>, object: WorldObject) -> Self {
        Self {
            reason: reason.into(),
            object: Box::new(object),
        }
    }

    pub fn into_object(self) -> WorldObject {
        *self.object
    }
}

/// Failures reported by a [`crate::Persistence`] backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("no instance save for instance {0}")]
    MissingSave(u32),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// Errors from loading a [`crate::WorldConfig`] or script library.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("duplicate map id {0} in catalog")]
    DuplicateMap(u32),
}
