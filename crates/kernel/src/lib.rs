//! World Grid Kernel: partitioned world maps, grid lifecycle, instance
//! specializations and the delayed script scheduler.
//!
//! # Invariants
//! - An object on a map sits in exactly one cell of a loaded grid, the cell
//!   its position falls in.
//! - A grid is only unloaded when no unload lock holds it and no active
//!   object is in or near it, unless the unload is forced.
//! - Rejected objects are handed back to the caller unchanged.
//! - Every collaborator (terrain, sessions, storage, rules, clock) is reached
//!   through [`SimContext`]; there is no global state.

pub mod config;
pub mod context;
pub mod error;
pub mod grid;
pub mod manager;
pub mod map;
pub mod message;
pub mod object;
pub mod persistence;
pub mod script;

pub use config::{MapDifficulty, MapEntry, MapType, WorldConfig};
pub use context::{
    CorpseRecord, DefaultRules, GameClock, GameRules, GuidGenerator, InstanceScript, ManualClock, NullSessions,
    RecordingSessions, SessionSink, SimContext, SpawnRecord, SpawnSource, StaticSpawns, SystemClock,
};
pub use error::{AdmissionError, ConfigError, MapError, PersistenceError, Rejected};
pub use grid::NGrid;
pub use manager::{MapManager, SharedMap, TickStats};
pub use map::{InstanceState, Map, MapEvent, MapKind, Relocation, ResetMethod, Transfer, TransferReason};
pub use message::{ChatType, ClientMessage, TransferAbortReason};
pub use object::{GameObjectType, GoState, ObjectKind, WorldObject};
pub use persistence::{
    InstanceBind, InstanceSave, MemoryPersistence, Persistence, PersistenceState, ResetEvent, RespawnKind,
};
pub use script::{ScriptCommand, ScriptInfo, ScriptLibrary, ScriptSet};
