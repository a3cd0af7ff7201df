//! Static script data: commands, their parameters, and the library of
//! script sets keyed by trigger id.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Script command tags, numbered as they appear in script data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptCommand {
    Talk,
    Emote,
    FieldSet,
    MoveTo,
    FlagSet,
    FlagRemove,
    TeleportTo,
    QuestExplored,
    KillCredit,
    RespawnGameObject,
    TempSummonCreature,
    OpenDoor,
    CloseDoor,
    ActivateObject,
    RemoveAura,
    CastSpell,
    PlaySound,
    CreateItem,
    DespawnSelf,
}

impl ScriptCommand {
    pub fn from_tag(tag: u32) -> Option<Self> {
        use ScriptCommand::*;
        const ALL: [ScriptCommand; 19] = [
            Talk,
            Emote,
            FieldSet,
            MoveTo,
            FlagSet,
            FlagRemove,
            TeleportTo,
            QuestExplored,
            KillCredit,
            RespawnGameObject,
            TempSummonCreature,
            OpenDoor,
            CloseDoor,
            ActivateObject,
            RemoveAura,
            CastSpell,
            PlaySound,
            CreateItem,
            DespawnSelf,
        ];
        ALL.get(tag as usize).copied()
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// Which table a script belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptSet {
    QuestStart,
    QuestEnd,
    Spell,
    GameObject,
    Event,
    Waypoint,
}

/// One static script step.
///
/// The generic `datalong*` fields mean different things per command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptInfo {
    pub id: u32,
    /// Seconds after the trigger.
    pub delay: u32,
    /// Raw command tag; unknown tags are reported when the step runs.
    pub command: u32,
    pub datalong: u32,
    pub datalong2: u32,
    pub datalong3: u32,
    pub dataint: i32,
    pub data_flags: u32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub o: f32,
}

impl ScriptInfo {
    pub fn new(id: u32, command: ScriptCommand) -> Self {
        Self {
            id,
            command: command.tag(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: u32) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_data(mut self, datalong: u32, datalong2: u32, datalong3: u32) -> Self {
        self.datalong = datalong;
        self.datalong2 = datalong2;
        self.datalong3 = datalong3;
        self
    }

    pub fn with_dataint(mut self, dataint: i32) -> Self {
        self.dataint = dataint;
        self
    }

    pub fn with_position(mut self, x: f32, y: f32, z: f32, o: f32) -> Self {
        self.x = x;
        self.y = y;
        self.z = z;
        self.o = o;
        self
    }

    pub fn command(&self) -> Option<ScriptCommand> {
        ScriptCommand::from_tag(self.command)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ScriptFile {
    #[serde(default)]
    sets: BTreeMap<ScriptSet, Vec<ScriptInfo>>,
}

/// All static scripts, grouped by set and trigger id.
#[derive(Debug, Clone, Default)]
pub struct ScriptLibrary {
    sets: BTreeMap<ScriptSet, BTreeMap<u32, Vec<Arc<ScriptInfo>>>>,
}

impl ScriptLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, set: ScriptSet, info: ScriptInfo) {
        let steps = self
            .sets
            .entry(set)
            .or_default()
            .entry(info.id)
            .or_default();
        steps.push(Arc::new(info));
        steps.sort_by_key(|s| s.delay);
    }

    /// Steps registered for `id`, earliest first.
    pub fn steps(&self, set: ScriptSet, id: u32) -> Option<&[Arc<ScriptInfo>]> {
        self.sets
            .get(&set)
            .and_then(|by_id| by_id.get(&id))
            .map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.sets.values().flat_map(|m| m.values()).map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a `sets:` document from a `.yaml`/`.yml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let file: ScriptFile = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => serde_yaml::from_str(&text)?,
            Some("json") => serde_json::from_str(&text)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                ));
            }
        };
        let mut library = Self::new();
        for (set, steps) in file.sets {
            for step in steps {
                if step.command().is_none() {
                    tracing::warn!(id = step.id, command = step.command, "script step with unknown command");
                }
                library.insert(set, step);
            }
        }
        tracing::info!(path = %path.display(), steps = library.len(), "loaded script library");
        Ok(library)
    }
}
