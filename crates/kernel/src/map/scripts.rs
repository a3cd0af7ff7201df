//! Delayed script actions: a time-ordered queue of static script steps bound
//! to the objects that triggered them, drained every map update.

use std::sync::Arc;

use worldgrid_common::{HighGuid, ObjectGuid, TypeId, WorldPosition};
use worldgrid_stream::CellArea;

use super::{Map, MapEvent, TransferReason};
use crate::context::SimContext;
use crate::message::{ChatType, ClientMessage};
use crate::object::{GameObjectType, GoState, Positioned, WorldObject};
use crate::script::{ScriptCommand, ScriptInfo, ScriptSet};

/// Talk: a player target speaks instead of a non-player source.
const TALK_TARGET_PLAYER_AS_SOURCE: u32 = 0x01;
/// Talk: address the original source.
const TALK_ORIGINAL_SOURCE_AS_TARGET: u32 = 0x02;
/// Talk: address the buddy instead of letting it speak.
const TALK_BUDDY_AS_TARGET: u32 = 0x04;

const MIN_GAMEOBJECT_DESPAWN_SECS: u32 = 5;
const MIN_DOOR_RESTORE_SECS: u32 = 15;

/// A script step waiting for its time, with the objects it runs against.
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    pub script: Arc<ScriptInfo>,
    pub source: ObjectGuid,
    pub target: Option<ObjectGuid>,
}

impl Map {
    /// Queue every step of script `id` from `set`. Steps without delay run
    /// before this returns.
    pub fn scripts_start(
        &mut self,
        ctx: &SimContext,
        set: ScriptSet,
        id: u32,
        source: ObjectGuid,
        target: Option<ObjectGuid>,
    ) {
        let Some(steps) = ctx.scripts.steps(set, id) else {
            return;
        };
        let now = ctx.now_secs();
        let mut immediate = false;
        for step in steps {
            immediate |= step.delay == 0;
            self.schedule(ctx, now + u64::from(step.delay), Arc::clone(step), source, target);
        }
        if immediate {
            self.scripts_process(ctx);
        }
    }

    /// Queue a single step `delay_secs` from now.
    pub fn script_command_start(
        &mut self,
        ctx: &SimContext,
        script: Arc<ScriptInfo>,
        delay_secs: u32,
        source: ObjectGuid,
        target: Option<ObjectGuid>,
    ) {
        self.schedule(ctx, ctx.now_secs() + u64::from(delay_secs), script, source, target);
        if delay_secs == 0 {
            self.scripts_process(ctx);
        }
    }

    fn schedule(
        &mut self,
        ctx: &SimContext,
        at_secs: u64,
        script: Arc<ScriptInfo>,
        source: ObjectGuid,
        target: Option<ObjectGuid>,
    ) {
        self.script_seq += 1;
        self.scripts.insert(
            (at_secs, self.script_seq),
            ScheduledAction { script, source, target },
        );
        ctx.increase_scheduled_scripts();
    }

    pub fn scheduled_script_count(&self) -> usize {
        self.scripts.len()
    }

    /// Drop every queued step without running it.
    pub(super) fn clear_scripts(&mut self, ctx: &SimContext) {
        ctx.decrease_scheduled_scripts(self.scripts.len());
        self.scripts.clear();
    }

    /// Run every step whose time has come, earliest first. Steps may queue
    /// further steps; those due now run in the same pass.
    pub(super) fn scripts_process(&mut self, ctx: &SimContext) {
        let now = ctx.now_secs();
        while let Some(entry) = self.scripts.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let action = entry.remove();
            ctx.decrease_scheduled_scripts(1);

            let source = self.resolve_script_object(action.source);
            let target = action.target.and_then(|t| self.resolve_script_object(t));
            let step = &action.script;
            match step.command() {
                Some(command) => {
                    self.run_command(ctx, command, step, source, target);
                    self.record(MapEvent::ScriptExecuted {
                        script_id: step.id,
                        command: step.command,
                    });
                }
                None => {
                    tracing::error!(command = step.command, script_id = step.id, "unknown script command");
                }
            }
        }
    }

    /// The in-world object behind a queued guid. Objects that left the map
    /// since the step was queued come back as `None`.
    fn resolve_script_object(&self, guid: ObjectGuid) -> Option<ObjectGuid> {
        if guid.is_empty() {
            return None;
        }
        match guid.high() {
            Some(
                HighGuid::Player
                | HighGuid::Unit
                | HighGuid::Pet
                | HighGuid::Vehicle
                | HighGuid::GameObject
                | HighGuid::Corpse,
            ) => {}
            Some(HighGuid::Item) => {
                tracing::debug!(%guid, "item script sources are not tracked by the map");
                return None;
            }
            other => {
                tracing::error!(%guid, high = ?other, "script object with unsupported high guid");
                return None;
            }
        }
        self.objects.get(&guid).filter(|o| o.is_in_world()).map(WorldObject::guid)
    }

    fn type_of(&self, guid: Option<ObjectGuid>) -> Option<TypeId> {
        guid.and_then(|g| self.objects.get(&g)).map(WorldObject::type_id)
    }

    fn position_of(&self, guid: ObjectGuid) -> Option<WorldPosition> {
        self.objects.get(&guid).map(|o| *o.position())
    }

    /// Closest object within `radius` of `center` matching `wanted`, among
    /// loaded grids only.
    fn nearest_object(
        &self,
        center: ObjectGuid,
        radius: f32,
        wanted: impl Fn(&WorldObject) -> bool,
    ) -> Option<ObjectGuid> {
        let origin = self.position_of(center)?;
        let area = CellArea::around(origin.x(), origin.y(), radius);
        let mut best: Option<(f32, ObjectGuid)> = None;
        for cell in area.iter() {
            let Some(grid) = self.grid(cell.grid()).filter(|g| g.is_objects_loaded()) else {
                continue;
            };
            for guid in grid.cell_objects(cell) {
                if guid == center {
                    continue;
                }
                let Some(obj) = self.objects.get(&guid) else {
                    continue;
                };
                let dist = obj.position().distance(&origin);
                if dist <= radius && wanted(obj) && best.is_none_or(|(d, _)| dist < d) {
                    best = Some((dist, guid));
                }
            }
        }
        best.map(|(_, guid)| guid)
    }

    /// The target when it is a player, else the source when that is one.
    fn player_of(&self, source: Option<ObjectGuid>, target: Option<ObjectGuid>) -> Option<ObjectGuid> {
        if self.type_of(target) == Some(TypeId::Player) {
            target
        } else if self.type_of(source) == Some(TypeId::Player) {
            source
        } else {
            None
        }
    }

    fn run_command(
        &mut self,
        ctx: &SimContext,
        command: ScriptCommand,
        step: &ScriptInfo,
        source: Option<ObjectGuid>,
        target: Option<ObjectGuid>,
    ) {
        let id = step.id;
        match command {
            ScriptCommand::Talk => self.script_talk(ctx, step, source, target),
            ScriptCommand::Emote => {
                let Some(source) = source.filter(|_| self.type_of(source) == Some(TypeId::Unit)) else {
                    tracing::error!(script_id = id, "emote needs a creature source");
                    return;
                };
                let emote = ClientMessage::Emote {
                    source,
                    emote_id: step.datalong,
                };
                self.message_broadcast(ctx, source, &emote, true);
            }
            ScriptCommand::FieldSet | ScriptCommand::FlagSet | ScriptCommand::FlagRemove => {
                let Some(source) = source else {
                    tracing::error!(script_id = id, ?command, "field change with no source");
                    return;
                };
                let Some(obj) = self.objects.get_mut(&source) else {
                    return;
                };
                if !obj.is_writable_field(step.datalong) {
                    tracing::error!(
                        script_id = id,
                        field = step.datalong,
                        max = obj.values_count(),
                        "script writes a protected or missing field"
                    );
                    return;
                }
                let changed = match command {
                    ScriptCommand::FieldSet => obj.set_value(step.datalong, step.datalong2),
                    ScriptCommand::FlagSet => obj.set_flag(step.datalong, step.datalong2),
                    _ => obj.remove_flag(step.datalong, step.datalong2),
                };
                if changed {
                    self.mark_changed(source);
                }
            }
            ScriptCommand::MoveTo => {
                let Some(source) = source.filter(|_| self.type_of(source) == Some(TypeId::Unit)) else {
                    tracing::error!(script_id = id, "move needs a creature source");
                    return;
                };
                let o = self.position_of(source).map_or(0.0, |p| p.orientation);
                if let Err(e) = self.relocate(ctx, source, step.x, step.y, step.z, o) {
                    tracing::error!(script_id = id, error = %e, "scripted move failed");
                    return;
                }
                let movement = ClientMessage::MonsterMove {
                    mover: source,
                    x: step.x,
                    y: step.y,
                    z: step.z,
                    time_ms: step.datalong2,
                };
                self.message_broadcast(ctx, source, &movement, true);
            }
            ScriptCommand::TeleportTo => {
                let Some(player) = self.player_of(source, target) else {
                    tracing::error!(script_id = id, "teleport needs a player source or target");
                    return;
                };
                if step.datalong == self.id {
                    if let Err(e) = self.relocate(ctx, player, step.x, step.y, step.z, step.o) {
                        tracing::error!(script_id = id, error = %e, "scripted teleport failed");
                    }
                } else {
                    let destination = WorldPosition::new(step.datalong, 0, step.x, step.y, step.z, step.o);
                    self.transfer_player(ctx, player, destination, TransferReason::Teleport);
                }
            }
            ScriptCommand::QuestExplored => self.script_quest_explored(ctx, step, source, target),
            ScriptCommand::KillCredit => {
                let Some(player) = self.player_of(source, target) else {
                    tracing::error!(script_id = id, "kill credit needs a player source or target");
                    return;
                };
                ctx.rules.kill_credit(player, step.datalong, step.datalong2 != 0);
            }
            ScriptCommand::RespawnGameObject => self.script_respawn_game_object(ctx, step, source),
            ScriptCommand::TempSummonCreature => self.script_summon(ctx, step, source),
            ScriptCommand::OpenDoor | ScriptCommand::CloseDoor => {
                self.script_door(ctx, step, command == ScriptCommand::OpenDoor, source, target)
            }
            ScriptCommand::ActivateObject => {
                if !self.type_of(source).is_some_and(TypeId::is_unit) {
                    tracing::error!(script_id = id, "activate object needs a unit source");
                    return;
                }
                if self.type_of(target) != Some(TypeId::GameObject) {
                    tracing::error!(script_id = id, "activate object needs a game object target");
                    return;
                }
                if let (Some(user), Some(object)) = (source, target) {
                    ctx.rules.use_object(user, object);
                }
            }
            ScriptCommand::RemoveAura => {
                let on_source = step.datalong2 != 0;
                let subject = if on_source { source } else { target };
                match subject.filter(|_| self.type_of(subject).is_some_and(TypeId::is_unit)) {
                    Some(unit) => ctx.rules.remove_auras(unit, step.datalong),
                    None => tracing::error!(script_id = id, on_source, "remove aura needs a unit"),
                }
            }
            ScriptCommand::CastSpell => {
                if source.is_none() {
                    tracing::error!(script_id = id, "cast needs a source");
                    return;
                }
                let victim = if step.datalong2 & 0x01 != 0 { source } else { target };
                let caster = if step.datalong2 & 0x02 != 0 { target } else { source };
                let unit = |g: Option<ObjectGuid>| g.filter(|_| self.type_of(g).is_some_and(TypeId::is_unit));
                match (unit(caster), unit(victim)) {
                    (Some(caster), Some(victim)) => ctx.rules.cast_spell(caster, victim, step.datalong, false),
                    _ => tracing::error!(script_id = id, flags = step.datalong2, "cast needs unit caster and target"),
                }
            }
            ScriptCommand::PlaySound => {
                let Some(source) = source else {
                    tracing::error!(script_id = id, "sound needs a source");
                    return;
                };
                let listener = if step.datalong2 & 0x01 != 0 {
                    if self.type_of(target) != Some(TypeId::Player) {
                        tracing::error!(script_id = id, "targeted sound needs a player target");
                        return;
                    }
                    target
                } else {
                    None
                };
                let sound = ClientMessage::PlaySound {
                    source,
                    sound_id: step.datalong,
                    distance_dependent: step.datalong2 & 0x02 != 0,
                };
                match listener {
                    Some(player) => ctx.send(player, &sound),
                    None => self.message_broadcast(ctx, source, &sound, true),
                }
            }
            ScriptCommand::CreateItem => {
                let Some(player) = self.player_of(source, target) else {
                    tracing::error!(script_id = id, "create item needs a player source or target");
                    return;
                };
                if ctx.rules.create_item(player, step.datalong, step.datalong2) {
                    ctx.send(
                        player,
                        &ClientMessage::NewItem {
                            item_entry: step.datalong,
                            count: step.datalong2,
                        },
                    );
                }
            }
            ScriptCommand::DespawnSelf => {
                let creature = if self.type_of(target) == Some(TypeId::Unit) {
                    target
                } else if self.type_of(source) == Some(TypeId::Unit) {
                    source
                } else {
                    None
                };
                match creature.and_then(|c| self.objects.get_mut(&c)) {
                    Some(obj) => obj.forced_despawn(step.datalong),
                    None => tracing::error!(script_id = id, "despawn needs a creature source or target"),
                }
            }
        }
    }

    fn script_talk(
        &mut self,
        ctx: &SimContext,
        step: &ScriptInfo,
        source: Option<ObjectGuid>,
        target: Option<ObjectGuid>,
    ) {
        let Some(source) = source else {
            tracing::error!(script_id = step.id, "talk with no source");
            return;
        };
        let mut speaker = source;
        let mut target = target;
        let flags = step.data_flags;
        if flags & TALK_TARGET_PLAYER_AS_SOURCE != 0
            && self.type_of(target) == Some(TypeId::Player)
            && self.type_of(Some(source)) != Some(TypeId::Player)
        {
            if let Some(t) = target {
                speaker = t;
            }
        }

        if step.datalong2 != 0 {
            let buddy = self.nearest_object(speaker, step.datalong3 as f32, |o| {
                o.as_creature().is_some_and(|c| c.entry == step.datalong2 && c.alive)
            });
            if let Some(buddy) = buddy {
                if flags & TALK_BUDDY_AS_TARGET != 0 {
                    target = Some(buddy);
                } else if flags & TALK_TARGET_PLAYER_AS_SOURCE == 0 {
                    speaker = buddy;
                }
            }
        }
        if flags & TALK_ORIGINAL_SOURCE_AS_TARGET != 0 {
            target = Some(source);
        }

        let Some(chat_type) = ChatType::from_tag(step.datalong) else {
            tracing::error!(script_id = step.id, chat_type = step.datalong, "unknown chat type");
            return;
        };
        let message = ClientMessage::Chat {
            chat_type,
            speaker,
            text_id: step.dataint,
            target: target.unwrap_or(ObjectGuid::EMPTY),
        };
        let ranges = &ctx.config.listen_range;
        match chat_type {
            ChatType::Say => self.message_dist_broadcast(ctx, speaker, &message, ranges.say, true, false),
            ChatType::Yell | ChatType::BossEmote => {
                self.message_dist_broadcast(ctx, speaker, &message, ranges.yell, true, false)
            }
            ChatType::TextEmote => {
                self.message_dist_broadcast(ctx, speaker, &message, ranges.text_emote, true, false)
            }
            ChatType::Whisper | ChatType::BossWhisper => match target {
                Some(player) if player.is_player() => ctx.send(player, &message),
                _ => tracing::error!(script_id = step.id, "whisper without a player target"),
            },
            ChatType::ZoneYell => self.send_to_players(ctx, &message),
        }
    }

    fn script_quest_explored(
        &mut self,
        ctx: &SimContext,
        step: &ScriptInfo,
        source: Option<ObjectGuid>,
        target: Option<ObjectGuid>,
    ) {
        let (Some(source), Some(target)) = (source, target) else {
            tracing::error!(script_id = step.id, "quest explored needs source and target");
            return;
        };
        let world_like = |t: Option<TypeId>| matches!(t, Some(TypeId::Unit | TypeId::GameObject | TypeId::Player));
        let (thing, player) = if self.type_of(Some(target)) == Some(TypeId::Player) {
            if !world_like(self.type_of(Some(source))) {
                tracing::error!(script_id = step.id, "quest explored source is not a world object");
                return;
            }
            (source, target)
        } else {
            if !world_like(self.type_of(Some(target))) {
                tracing::error!(script_id = step.id, "quest explored target is not a world object");
                return;
            }
            if self.type_of(Some(source)) != Some(TypeId::Player) {
                tracing::error!(script_id = step.id, "quest explored needs a player");
                return;
            }
            (target, source)
        };
        let (Some(thing_obj), Some(player_pos)) = (self.objects.get(&thing), self.position_of(player)) else {
            return;
        };
        let alive = thing_obj.type_id() != TypeId::Unit || thing_obj.is_alive();
        let near = step.datalong2 == 0 || thing_obj.position().distance(&player_pos) <= step.datalong2 as f32;
        if alive && near {
            ctx.rules.area_explored(player, step.datalong);
        } else {
            ctx.rules.fail_quest(player, step.datalong);
        }
    }

    fn script_respawn_game_object(&mut self, ctx: &SimContext, step: &ScriptInfo, source: Option<ObjectGuid>) {
        if step.datalong == 0 {
            tracing::error!(script_id = step.id, "respawn game object without a spawn id");
            return;
        }
        let Some(source) = source else {
            tracing::error!(script_id = step.id, "respawn game object with no source");
            return;
        };
        let db_guid = step.datalong;
        let found = self.nearest_object(source, self.visibility_distance, |o| {
            o.as_game_object().is_some_and(|g| g.db_guid == db_guid)
        });
        let Some(go) = found else {
            tracing::error!(script_id = step.id, db_guid, "game object to respawn not found");
            return;
        };
        let go_type = self.objects.get(&go).and_then(|o| o.as_game_object()).map(|g| g.go_type);
        if matches!(
            go_type,
            Some(GameObjectType::FishingNode | GameObjectType::Door | GameObjectType::Button | GameObjectType::Trap)
        ) {
            tracing::error!(script_id = step.id, db_guid, ?go_type, "game object type cannot be respawned by script");
            return;
        }
        let despawn_secs = step.datalong2.max(MIN_GAMEOBJECT_DESPAWN_SECS);
        let spawned = self.objects.get_mut(&go).is_some_and(|o| o.respawn_for(despawn_secs));
        if spawned {
            self.update_object_visibility(ctx, go);
        }
    }

    fn script_summon(&mut self, ctx: &SimContext, step: &ScriptInfo, source: Option<ObjectGuid>) {
        if step.datalong == 0 {
            tracing::error!(script_id = step.id, "summon without a creature entry");
            return;
        }
        if source.is_none() {
            tracing::error!(script_id = step.id, "summon with no summoner");
            return;
        }
        let Some(low) = ctx.guids.next(HighGuid::Unit) else {
            return;
        };
        let position = WorldPosition::new(self.id, self.instance_id, step.x, step.y, step.z, step.o);
        let mut creature = WorldObject::creature(step.datalong, low, position);
        creature.set_timed_or_dead_despawn(step.datalong2);
        if let Err(rejected) = self.add(ctx, creature) {
            tracing::error!(script_id = step.id, entry = step.datalong, reason = %rejected.reason, "summon failed");
        }
    }

    fn script_door(
        &mut self,
        ctx: &SimContext,
        step: &ScriptInfo,
        open: bool,
        source: Option<ObjectGuid>,
        target: Option<ObjectGuid>,
    ) {
        if step.datalong == 0 {
            tracing::error!(script_id = step.id, open, "door command without a door");
            return;
        }
        let Some(caster) = source.filter(|_| self.type_of(source).is_some_and(TypeId::is_unit)) else {
            tracing::error!(script_id = step.id, open, "door command needs a unit source");
            return;
        };
        let db_guid = step.datalong;
        let found = self.nearest_object(caster, self.visibility_distance, |o| {
            o.as_game_object().is_some_and(|g| g.db_guid == db_guid)
        });
        let Some(door) = found else {
            tracing::error!(script_id = step.id, db_guid, "door not found");
            return;
        };
        let Some(state) = self.objects.get(&door).and_then(|o| o.as_game_object()).and_then(|g| {
            (g.go_type == GameObjectType::Door).then_some(g.state)
        }) else {
            tracing::error!(script_id = step.id, db_guid, "door command on a non-door");
            return;
        };
        // Ready is closed.
        if (state == GoState::Ready) != open {
            return;
        }
        let restore_secs = step.datalong2.max(MIN_DOOR_RESTORE_SECS);
        if self.objects.get_mut(&door).is_some_and(|d| d.use_door_or_button(restore_secs)) {
            self.mark_changed(door);
        }
        let button = target.filter(|t| {
            self.objects
                .get(t)
                .and_then(WorldObject::as_game_object)
                .is_some_and(|g| g.go_type == GameObjectType::Button)
        });
        if let Some(button) = button {
            if self.objects.get_mut(&button).is_some_and(|b| b.use_door_or_button(restore_secs)) {
                self.mark_changed(button);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use worldgrid_common::Difficulty;

    use super::super::test_support::*;
    use super::*;
    use crate::config::WorldConfig;
    use crate::context::SimContext;
    use crate::script::ScriptLibrary;

    fn with_library(h: &Harness, library: ScriptLibrary) -> SimContext {
        h.ctx.clone().with_scripts(Arc::new(library))
    }

    fn say(id: u32, delay: u32, text: i32) -> ScriptInfo {
        ScriptInfo::new(id, ScriptCommand::Talk).with_delay(delay).with_dataint(text)
    }

    fn heard(h: &Harness, player: ObjectGuid) -> Vec<i32> {
        h.sessions
            .sent_to(player)
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Chat { text_id, .. } => Some(text_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn delayed_steps_wait_for_their_time() {
        let h = harness(WorldConfig::default());
        let mut library = ScriptLibrary::new();
        library.insert(ScriptSet::Event, say(7, 0, 100));
        library.insert(ScriptSet::Event, say(7, 5, 101));
        let ctx = with_library(&h, library);

        let mut map = Map::new(&ctx, &continent(), 0, Difficulty::REGULAR);
        let here = point_in(30, 30, 3, 3);
        let player = WorldObject::player(1, "Ana", at(0, here));
        let listener = player.guid();
        map.add(&ctx, player).unwrap();
        let npc = WorldObject::creature(50, 1, at(0, here));
        let speaker = npc.guid();
        map.add(&ctx, npc).unwrap();

        map.scripts_start(&ctx, ScriptSet::Event, 7, speaker, None);
        assert_eq!(heard(&h, listener), vec![100]);
        assert_eq!(map.scheduled_script_count(), 1);
        assert_eq!(ctx.scheduled_script_count(), 1);

        h.clock.advance(4);
        map.update(&ctx, 100);
        assert_eq!(heard(&h, listener), vec![100]);

        h.clock.advance(1);
        map.update(&ctx, 100);
        assert_eq!(heard(&h, listener), vec![100, 101]);
        assert_eq!(map.scheduled_script_count(), 0);
        assert_eq!(ctx.scheduled_script_count(), 0);
    }

    #[test]
    fn vanished_source_is_skipped() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let here = point_in(30, 30, 3, 3);
        let player = WorldObject::player(1, "Ana", at(0, here));
        let listener = player.guid();
        map.add(&h.ctx, player).unwrap();
        let npc = WorldObject::creature(50, 1, at(0, here));
        let speaker = npc.guid();
        map.add(&h.ctx, npc).unwrap();

        map.script_command_start(&h.ctx, Arc::new(say(1, 0, 5)), 3, speaker, None);
        map.remove(&h.ctx, speaker, true);
        h.clock.advance(3);
        map.update(&h.ctx, 100);
        assert!(heard(&h, listener).is_empty());
        assert_eq!(map.scheduled_script_count(), 0);
    }

    #[test]
    fn unknown_commands_are_dropped() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        map.set_event_recording(true);
        let npc = WorldObject::creature(50, 1, at(0, point_in(30, 30, 3, 3)));
        let speaker = npc.guid();
        map.add(&h.ctx, npc).unwrap();
        let bogus = ScriptInfo {
            id: 9,
            command: 200,
            ..ScriptInfo::default()
        };
        map.script_command_start(&h.ctx, Arc::new(bogus), 0, speaker, None);
        assert_eq!(map.scheduled_script_count(), 0);
        assert!(!map.events().iter().any(|e| matches!(e, MapEvent::ScriptExecuted { .. })));
    }

    #[test]
    fn whisper_reaches_only_its_target() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let here = point_in(30, 30, 3, 3);
        let a = WorldObject::player(1, "Ana", at(0, here));
        let b = WorldObject::player(2, "Bo", at(0, here));
        let (ga, gb) = (a.guid(), b.guid());
        map.add(&h.ctx, a).unwrap();
        map.add(&h.ctx, b).unwrap();
        let npc = WorldObject::creature(50, 1, at(0, here));
        let speaker = npc.guid();
        map.add(&h.ctx, npc).unwrap();

        let whisper = say(1, 0, 42).with_data(4, 0, 0);
        map.script_command_start(&h.ctx, Arc::new(whisper), 0, speaker, Some(gb));
        assert!(heard(&h, ga).is_empty());
        assert_eq!(heard(&h, gb), vec![42]);
    }

    #[test]
    fn buddy_speaks_for_the_source() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let here = point_in(30, 30, 3, 3);
        let player = WorldObject::player(1, "Ana", at(0, here));
        let listener = player.guid();
        map.add(&h.ctx, player).unwrap();
        let npc = WorldObject::creature(50, 1, at(0, here));
        let buddy = WorldObject::creature(60, 2, at(0, here));
        let (gn, gbuddy) = (npc.guid(), buddy.guid());
        map.add(&h.ctx, npc).unwrap();
        map.add(&h.ctx, buddy).unwrap();

        let line = say(1, 0, 3).with_data(0, 60, 20);
        map.script_command_start(&h.ctx, Arc::new(line), 0, gn, None);
        let speakers: Vec<ObjectGuid> = h
            .sessions
            .sent_to(listener)
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Chat { speaker, .. } => Some(speaker),
                _ => None,
            })
            .collect();
        assert_eq!(speakers, vec![gbuddy]);
    }

    #[test]
    fn field_set_refuses_protected_fields() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let npc = WorldObject::creature(50, 1, at(0, point_in(30, 30, 3, 3)));
        let guid = npc.guid();
        map.add(&h.ctx, npc).unwrap();

        let set = ScriptInfo::new(1, ScriptCommand::FieldSet).with_data(10, 77, 0);
        map.script_command_start(&h.ctx, Arc::new(set), 0, guid, None);
        assert_eq!(map.object(guid).unwrap().value(10), Some(77));

        let entry = ScriptInfo::new(1, ScriptCommand::FieldSet).with_data(3, 77, 0);
        map.script_command_start(&h.ctx, Arc::new(entry), 0, guid, None);
        assert_eq!(map.object(guid).unwrap().value(3), Some(50));
    }

    #[test]
    fn door_opens_then_ignores_a_second_open() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let here = point_in(30, 30, 3, 3);
        map.add(&h.ctx, WorldObject::player(1, "Ana", at(0, here))).unwrap();
        let npc = WorldObject::creature(50, 1, at(0, here));
        let caster = npc.guid();
        map.add(&h.ctx, npc).unwrap();
        let door = WorldObject::spawned_game_object(900, 31, GameObjectType::Door, at(0, here));
        let gdoor = door.guid();
        map.add(&h.ctx, door).unwrap();

        let open = Arc::new(ScriptInfo::new(1, ScriptCommand::OpenDoor).with_data(31, 0, 0));
        map.script_command_start(&h.ctx, Arc::clone(&open), 0, caster, None);
        let state = |map: &Map| map.object(gdoor).unwrap().as_game_object().unwrap().state;
        assert_eq!(state(&map), GoState::Active);
        map.script_command_start(&h.ctx, open, 0, caster, None);
        assert_eq!(state(&map), GoState::Active);

        // Reverts after the minimum restore time.
        map.update(&h.ctx, MIN_DOOR_RESTORE_SECS * 1000);
        assert_eq!(state(&map), GoState::Ready);
    }

    #[test]
    fn summoned_creature_despawns_after_its_duration() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let (x, y) = point_in(30, 30, 3, 3);
        let player = WorldObject::player(1, "Ana", at(0, (x, y)));
        let summoner = player.guid();
        map.add(&h.ctx, player).unwrap();

        let summon = ScriptInfo::new(1, ScriptCommand::TempSummonCreature)
            .with_data(70, 2_000, 0)
            .with_position(x + 1.0, y, 0.0, 0.0);
        map.script_command_start(&h.ctx, Arc::new(summon), 0, summoner, None);
        assert_eq!(map.object_count(), 2);

        map.update(&h.ctx, 2_000);
        map.update(&h.ctx, 100);
        assert_eq!(map.object_count(), 1);
    }

    #[test]
    fn teleport_elsewhere_queues_a_transfer() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let player = WorldObject::player(1, "Ana", at(0, point_in(30, 30, 3, 3)));
        let guid = player.guid();
        map.add(&h.ctx, player).unwrap();

        let port = ScriptInfo::new(1, ScriptCommand::TeleportTo)
            .with_data(1, 0, 0)
            .with_position(10.0, 20.0, 30.0, 0.0);
        map.script_command_start(&h.ctx, Arc::new(port), 0, guid, None);
        assert!(!map.have_players());
        let transfers = map.take_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].destination.map_id, 1);
        assert_eq!(transfers[0].reason, TransferReason::Teleport);
    }

    #[test]
    fn unloading_clears_the_queue() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let npc = WorldObject::creature(50, 1, at(0, point_in(30, 30, 3, 3)));
        let guid = npc.guid();
        map.add(&h.ctx, npc).unwrap();
        map.script_command_start(&h.ctx, Arc::new(say(1, 10, 1)), 10, guid, None);
        map.script_command_start(&h.ctx, Arc::new(say(1, 20, 2)), 20, guid, None);
        assert_eq!(h.ctx.scheduled_script_count(), 2);
        map.unload_all(&h.ctx);
        assert_eq!(map.scheduled_script_count(), 0);
        assert_eq!(h.ctx.scheduled_script_count(), 0);
    }
}
