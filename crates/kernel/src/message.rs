use serde::{Deserialize, Serialize};
use worldgrid_common::{Difficulty, ObjectGuid};

/// Chat channel of a scripted line, by its numeric tag in script data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatType {
    Say,
    Yell,
    TextEmote,
    BossEmote,
    Whisper,
    BossWhisper,
    ZoneYell,
}

impl ChatType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => ChatType::Say,
            1 => ChatType::Yell,
            2 => ChatType::TextEmote,
            3 => ChatType::BossEmote,
            4 => ChatType::Whisper,
            5 => ChatType::BossWhisper,
            6 => ChatType::ZoneYell,
            _ => return None,
        })
    }
}

/// Why a transfer into a map was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferAbortReason {
    MaxPlayers,
    ZoneInCombat,
    NotFound,
}

/// Semantic messages the map layer sends to player sessions.
///
/// Wire encoding belongs to the session layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Sent to a player entering a map: its own object.
    InitSelf {
        map_id: u32,
        instance_id: u32,
    },
    CreateObject {
        guid: ObjectGuid,
    },
    DestroyObject {
        guid: ObjectGuid,
    },
    /// Batched field changes of objects the receiver can see.
    ObjectUpdates {
        guids: Vec<ObjectGuid>,
    },
    Chat {
        chat_type: ChatType,
        speaker: ObjectGuid,
        text_id: i32,
        target: ObjectGuid,
    },
    Emote {
        source: ObjectGuid,
        emote_id: u32,
    },
    PlaySound {
        source: ObjectGuid,
        sound_id: u32,
        distance_dependent: bool,
    },
    MonsterMove {
        mover: ObjectGuid,
        x: f32,
        y: f32,
        z: f32,
        time_ms: u32,
    },
    TransferAborted {
        map_id: u32,
        reason: TransferAbortReason,
    },
    InstanceSaveCreated,
    InstanceResetWarning {
        map_id: u32,
        difficulty: Difficulty,
        time_left_secs: u32,
    },
    InstanceResetFailed {
        map_id: u32,
    },
    NewItem {
        item_entry: u32,
        count: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_tags_follow_script_numbering() {
        assert_eq!(ChatType::from_tag(0), Some(ChatType::Say));
        assert_eq!(ChatType::from_tag(4), Some(ChatType::Whisper));
        assert_eq!(ChatType::from_tag(6), Some(ChatType::ZoneYell));
        assert_eq!(ChatType::from_tag(7), None);
    }
}
