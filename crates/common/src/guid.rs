use serde::{Deserialize, Serialize};

/// High part of an object guid. Encodes which kind of object the guid names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HighGuid {
    Player,
    Item,
    GameObject,
    Transport,
    Unit,
    Pet,
    Vehicle,
    DynamicObject,
    Corpse,
    MoTransport,
}

impl HighGuid {
    pub const fn raw(self) -> u16 {
        match self {
            HighGuid::Player => 0x0000,
            HighGuid::Item => 0x4000,
            HighGuid::GameObject => 0xF110,
            HighGuid::Transport => 0xF120,
            HighGuid::Unit => 0xF130,
            HighGuid::Pet => 0xF140,
            HighGuid::Vehicle => 0xF150,
            HighGuid::DynamicObject => 0xF100,
            HighGuid::Corpse => 0xF101,
            HighGuid::MoTransport => 0x1FC0,
        }
    }

    pub const fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x0000 => HighGuid::Player,
            0x4000 => HighGuid::Item,
            0xF110 => HighGuid::GameObject,
            0xF120 => HighGuid::Transport,
            0xF130 => HighGuid::Unit,
            0xF140 => HighGuid::Pet,
            0xF150 => HighGuid::Vehicle,
            0xF100 => HighGuid::DynamicObject,
            0xF101 => HighGuid::Corpse,
            0x1FC0 => HighGuid::MoTransport,
            _ => return None,
        })
    }

    /// Whether guids of this kind carry an entry id in bits 24..48.
    pub const fn has_entry(self) -> bool {
        matches!(
            self,
            HighGuid::GameObject
                | HighGuid::Transport
                | HighGuid::Unit
                | HighGuid::Pet
                | HighGuid::Vehicle
                | HighGuid::MoTransport
        )
    }
}

/// Coarse object type used for capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeId {
    Item,
    Unit,
    Player,
    GameObject,
    DynamicObject,
    Corpse,
}

impl TypeId {
    /// Units and players both count as units for script checks.
    pub fn is_unit(self) -> bool {
        matches!(self, TypeId::Unit | TypeId::Player)
    }
}

/// Unique identifier of a live object.
///
/// Layout: `high:16 | entry:24 | low:24` for kinds with an entry, otherwise
/// `high:16 | low:48` with the low part limited to 32 bits.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ObjectGuid(pub u64);

impl ObjectGuid {
    pub const EMPTY: ObjectGuid = ObjectGuid(0);

    pub fn new(high: HighGuid, entry: u32, low: u32) -> Self {
        let raw = if high.has_entry() {
            ((high.raw() as u64) << 48) | (((entry & 0x00FF_FFFF) as u64) << 24) | (low & 0x00FF_FFFF) as u64
        } else {
            ((high.raw() as u64) << 48) | low as u64
        };
        Self(raw)
    }

    pub fn player(low: u32) -> Self {
        Self::new(HighGuid::Player, 0, low)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn high(self) -> Option<HighGuid> {
        HighGuid::from_raw((self.0 >> 48) as u16)
    }

    pub fn entry(self) -> u32 {
        match self.high() {
            Some(h) if h.has_entry() => ((self.0 >> 24) & 0x00FF_FFFF) as u32,
            _ => 0,
        }
    }

    pub fn low(self) -> u32 {
        match self.high() {
            Some(h) if h.has_entry() => (self.0 & 0x00FF_FFFF) as u32,
            _ => (self.0 & 0xFFFF_FFFF) as u32,
        }
    }

    pub fn is_player(self) -> bool {
        !self.is_empty() && self.high() == Some(HighGuid::Player)
    }

    pub fn type_id(self) -> Option<TypeId> {
        if self.is_empty() {
            return None;
        }
        Some(match self.high()? {
            HighGuid::Player => TypeId::Player,
            HighGuid::Item => TypeId::Item,
            HighGuid::GameObject | HighGuid::Transport | HighGuid::MoTransport => {
                TypeId::GameObject
            }
            HighGuid::Unit | HighGuid::Pet | HighGuid::Vehicle => TypeId::Unit,
            HighGuid::DynamicObject => TypeId::DynamicObject,
            HighGuid::Corpse => TypeId::Corpse,
        })
    }
}

impl std::fmt::Display for ObjectGuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.high() {
            Some(high) if high.has_entry() => {
                write!(f, "{high:?}(entry {}, low {})", self.entry(), self.low())
            }
            Some(high) => write!(f, "{high:?}({})", self.low()),
            None => write!(f, "Guid({:#x})", self.0),
        }
    }
}
