//! World configuration and the map catalog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use worldgrid_common::Difficulty;

use crate::error::ConfigError;

/// Instance maps never unload sooner than this many milliseconds.
pub const MIN_UNLOAD_DELAY: u32 = 1;

/// What kind of world a map entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapType {
    #[default]
    Common,
    Dungeon,
    Raid,
    Battleground,
    Arena,
}

impl MapType {
    pub fn is_dungeon(self) -> bool {
        matches!(self, MapType::Dungeon | MapType::Raid)
    }

    pub fn is_raid(self) -> bool {
        self == MapType::Raid
    }

    pub fn is_battleground_or_arena(self) -> bool {
        matches!(self, MapType::Battleground | MapType::Arena)
    }

    /// Dungeons, raids, battlegrounds and arenas all get private copies.
    pub fn instanceable(self) -> bool {
        self != MapType::Common
    }
}

/// Per-difficulty limits of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapDifficulty {
    pub max_players: u32,
    pub reset_time_secs: u32,
}

/// One entry of the map catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub map_type: MapType,
    /// Indexed by difficulty; index 0 is the regular difficulty.
    #[serde(default)]
    pub difficulties: Vec<MapDifficulty>,
    /// Area flag used where no terrain page answers.
    #[serde(default)]
    pub default_area_flag: u16,
    #[serde(default)]
    pub instance_script: Option<u32>,
}

impl MapEntry {
    pub fn new(id: u32, name: impl Into<String>, map_type: MapType) -> Self {
        Self {
            id,
            name: name.into(),
            map_type,
            difficulties: Vec::new(),
            default_area_flag: 0,
            instance_script: None,
        }
    }

    pub fn with_difficulty(mut self, max_players: u32, reset_time_secs: u32) -> Self {
        self.difficulties.push(MapDifficulty {
            max_players,
            reset_time_secs,
        });
        self
    }

    pub fn difficulty(&self, difficulty: Difficulty) -> Option<&MapDifficulty> {
        self.difficulties.get(usize::from(difficulty.0))
    }

    /// Player cap for `difficulty`.
    ///
    /// Non-regular difficulties that list zero players fall back to the
    /// regular cap. Unknown difficulties allow nobody.
    pub fn max_players(&self, difficulty: Difficulty) -> u32 {
        match self.difficulty(difficulty) {
            Some(diff) if diff.max_players != 0 || difficulty.is_regular() => diff.max_players,
            Some(_) => self
                .difficulty(Difficulty::REGULAR)
                .map_or(0, |regular| regular.max_players),
            None => 0,
        }
    }

    pub fn max_reset_delay(&self, difficulty: Difficulty) -> u32 {
        self.difficulty(difficulty).map_or(0, |d| d.reset_time_secs)
    }

    /// Raids and non-regular dungeon difficulties reset on a global schedule.
    pub fn is_raid_or_heroic_dungeon(&self, difficulty: Difficulty) -> bool {
        self.map_type.is_raid() || (self.map_type.is_dungeon() && !difficulty.is_regular())
    }
}

/// How far objects can be seen, by map kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    pub continents: f32,
    pub instances: f32,
    pub battlegrounds: f32,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            continents: 90.0,
            instances: 120.0,
            battlegrounds: 180.0,
        }
    }
}

/// Chat listen ranges in yards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenRanges {
    pub say: f32,
    pub yell: f32,
    pub text_emote: f32,
}

impl Default for ListenRanges {
    fn default() -> Self {
        Self {
            say: 25.0,
            yell: 300.0,
            text_emote: 25.0,
        }
    }
}

/// Everything the map layer reads from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Terrain assets live in `<data_path>/maps`, collision assets in `<data_path>/vmaps`.
    pub data_path: PathBuf,
    /// Client build tokens accepted in terrain files. Empty accepts any.
    pub accepted_client_builds: Vec<u32>,
    /// When false every grid is pinned with the explicit unload lock.
    pub grid_unload: bool,
    pub grid_clean_up_delay_ms: u32,
    pub instance_unload_delay_ms: u32,
    pub visibility: VisibilityConfig,
    pub listen_range: ListenRanges,
    /// Respawn times are written when they change rather than at removal.
    pub save_respawn_time_immediately: bool,
    pub vmap_enabled: bool,
    pub vmap_height_enabled: bool,
    pub maps: Vec<MapEntry>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data"),
            accepted_client_builds: Vec::new(),
            grid_unload: true,
            grid_clean_up_delay_ms: 300_000,
            instance_unload_delay_ms: 1_800_000,
            visibility: VisibilityConfig::default(),
            listen_range: ListenRanges::default(),
            save_respawn_time_immediately: true,
            vmap_enabled: false,
            vmap_height_enabled: false,
            maps: Vec::new(),
        }
    }
}

impl WorldConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml(&text)?,
            Some("json") => Self::from_json(&text)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                ));
            }
        };
        tracing::info!(path = %path.display(), maps = config.maps.len(), "loaded world config");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Catalog sanity: map ids must be unique.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeMap::new();
        for entry in &self.maps {
            if seen.insert(entry.id, ()).is_some() {
                return Err(ConfigError::DuplicateMap(entry.id));
            }
        }
        Ok(())
    }

    pub fn map_entry(&self, map_id: u32) -> Option<&MapEntry> {
        self.maps.iter().find(|m| m.id == map_id)
    }

    /// Instance unload delay, never below [`MIN_UNLOAD_DELAY`].
    pub fn instance_unload_delay(&self) -> u32 {
        self.instance_unload_delay_ms.max(MIN_UNLOAD_DELAY)
    }

    pub fn visibility_for(&self, map_type: MapType) -> f32 {
        match map_type {
            MapType::Common => self.visibility.continents,
            MapType::Dungeon | MapType::Raid => self.visibility.instances,
            MapType::Battleground | MapType::Arena => self.visibility.battlegrounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = WorldConfig::default();
        assert!(config.grid_unload);
        assert_eq!(config.grid_clean_up_delay_ms, 300_000);
        assert_eq!(config.visibility.continents, 90.0);
        assert_eq!(config.listen_range.yell, 300.0);
    }

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let yaml = r#"
data_path: /srv/world
grid_unload: false
maps:
  - id: 0
    name: Eastern Kingdoms
  - id: 36
    name: Deadmines
    map_type: dungeon
    difficulties:
      - { max_players: 5, reset_time_secs: 0 }
"#;
        let config = WorldConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.data_path, PathBuf::from("/srv/world"));
        assert!(!config.grid_unload);
        assert_eq!(config.instance_unload_delay_ms, 1_800_000);
        let deadmines = config.map_entry(36).unwrap();
        assert_eq!(deadmines.map_type, MapType::Dungeon);
        assert_eq!(deadmines.max_players(Difficulty::REGULAR), 5);
    }

    #[test]
    fn json_config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.json");
        std::fs::write(&path, r#"{ "grid_clean_up_delay_ms": 1000, "maps": [{ "id": 1 }] }"#)
            .unwrap();
        let config = WorldConfig::load(&path).unwrap();
        assert_eq!(config.grid_clean_up_delay_ms, 1000);
        assert_eq!(config.maps.len(), 1);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.toml");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            WorldConfig::load(&path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn duplicate_map_ids_are_rejected() {
        let json = r#"{ "maps": [{ "id": 1 }, { "id": 1 }] }"#;
        assert!(matches!(
            WorldConfig::from_json(json),
            Err(ConfigError::DuplicateMap(1))
        ));
    }

    #[test]
    fn heroic_without_cap_falls_back_to_regular() {
        let entry = MapEntry::new(540, "Shattered Halls", MapType::Dungeon)
            .with_difficulty(5, 0)
            .with_difficulty(0, 86_400);
        assert_eq!(entry.max_players(Difficulty(1)), 5);
        assert_eq!(entry.max_players(Difficulty(2)), 0);
        assert_eq!(entry.max_reset_delay(Difficulty(1)), 86_400);
        assert!(entry.is_raid_or_heroic_dungeon(Difficulty(1)));
        assert!(!entry.is_raid_or_heroic_dungeon(Difficulty::REGULAR));
    }

    #[test]
    fn instance_unload_delay_has_a_floor() {
        let config = WorldConfig {
            instance_unload_delay_ms: 0,
            ..WorldConfig::default()
        };
        assert_eq!(config.instance_unload_delay(), MIN_UNLOAD_DELAY);
    }
}
