use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Where an object stands: map, instance, coordinates and facing.
///
/// Instance id 0 is the shared continent copy of a map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldPosition {
    pub map_id: u32,
    pub instance_id: u32,
    pub position: Vec3,
    pub orientation: f32,
}

impl WorldPosition {
    pub fn new(map_id: u32, instance_id: u32, x: f32, y: f32, z: f32, orientation: f32) -> Self {
        Self {
            map_id,
            instance_id,
            position: Vec3::new(x, y, z),
            orientation,
        }
    }

    pub fn x(&self) -> f32 {
        self.position.x
    }

    pub fn y(&self) -> f32 {
        self.position.y
    }

    pub fn z(&self) -> f32 {
        self.position.z
    }

    /// Same map and instance, different coordinates.
    pub fn moved_to(&self, x: f32, y: f32, z: f32, orientation: f32) -> Self {
        Self {
            position: Vec3::new(x, y, z),
            orientation,
            ..*self
        }
    }

    /// Planar distance, ignoring height.
    pub fn distance_2d(&self, other: &WorldPosition) -> f32 {
        self.position.truncate().distance(other.position.truncate())
    }

    pub fn distance(&self, other: &WorldPosition) -> f32 {
        self.position.distance(other.position)
    }
}

impl Default for WorldPosition {
    fn default() -> Self {
        Self {
            map_id: 0,
            instance_id: 0,
            position: Vec3::ZERO,
            orientation: 0.0,
        }
    }
}

/// Faction side of a player, used by team-only broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Team {
    #[default]
    Alliance,
    Horde,
}

/// Identifier of a player group (party or raid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

/// Dungeon difficulty / spawn mode. 0 is the regular difficulty.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Difficulty(pub u8);

impl Difficulty {
    pub const REGULAR: Difficulty = Difficulty(0);

    pub fn is_regular(self) -> bool {
        self.0 == 0
    }
}
