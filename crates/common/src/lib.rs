//! Shared identifiers and positions used by every worldgrid crate.

mod guid;
mod types;

pub use guid::{HighGuid, ObjectGuid, TypeId};
pub use types::{Difficulty, GroupId, Team, WorldPosition};
