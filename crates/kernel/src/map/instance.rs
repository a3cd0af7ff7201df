//! Dungeon and battleground behaviour layered over the base map: admission,
//! instance binds, script data, resets and the unload countdown.

use worldgrid_common::{GroupId, ObjectGuid, WorldPosition};

use super::{Map, MapKind, TransferReason};
use crate::config::MIN_UNLOAD_DELAY;
use crate::context::SimContext;
use crate::error::{AdmissionError, MapError};
use crate::message::{ClientMessage, TransferAbortReason};
use crate::object::WorldObject;
use crate::persistence::{InstanceBind, InstanceSave, ResetEvent};

/// Normal dungeons nobody fought in reset this long after creation.
const NORMAL_INSTANCE_RESET_SECS: u64 = 2 * 60 * 60;

/// Dungeon-only bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct InstanceState {
    /// Purge persisted respawn data once the map is discarded.
    pub reset_after_unload: bool,
    /// Discard the map as soon as the last player leaves.
    pub unload_when_empty: bool,
    pub script_id: Option<u32>,
}

/// How an instance reset was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMethod {
    /// A player asked to reset all their instances.
    All,
    ChangeDifficulty,
    /// Scheduled reset of a raid or heroic dungeon.
    Global,
}

/// Bind changes decided during admission, applied only once every check passed.
#[derive(Debug, Default)]
struct BindPlan {
    create_save: Option<InstanceSave>,
    unbind_player: bool,
    bind_player: Option<InstanceBind>,
    bind_group: Option<(GroupId, InstanceBind)>,
    notify_save_created: bool,
}

impl Map {
    fn instance_state_mut(&mut self) -> Option<&mut InstanceState> {
        match &mut self.kind {
            MapKind::Instance(state) => Some(state),
            _ => None,
        }
    }

    pub fn instance_state(&self) -> Option<&InstanceState> {
        match &self.kind {
            MapKind::Instance(state) => Some(state),
            _ => None,
        }
    }

    /// Remaining unload countdown in milliseconds, 0 when not counting.
    pub fn unload_timer(&self) -> u32 {
        self.unload_timer
    }

    /// Whether `player` may enter. Rejections are also sent to the player's
    /// session.
    pub fn can_enter(&self, ctx: &SimContext, player: &WorldObject) -> Result<(), AdmissionError> {
        let guid = player.guid();
        let Some(data) = player.as_player() else {
            return Ok(());
        };
        match &self.kind {
            MapKind::Continent => Ok(()),
            MapKind::Battleground => {
                if data.battleground_id != self.instance_id {
                    tracing::error!(map = self.id, instance = self.instance_id, %guid, "player not assigned to this battleground");
                    return Err(AdmissionError::NotInBattleground {
                        instance_id: self.instance_id,
                    });
                }
                Ok(())
            }
            MapKind::Instance(_) => {
                if self.players.contains(&guid) {
                    tracing::error!(map = self.id, instance = self.instance_id, %guid, "player already in map");
                    return Err(AdmissionError::AlreadyInMap);
                }
                let max_players = self.entry.max_players(self.difficulty);
                if !data.game_master && self.players_count_except_gms() >= max_players {
                    tracing::info!(map = self.id, instance = self.instance_id, max_players, "instance full");
                    ctx.send(
                        guid,
                        &ClientMessage::TransferAborted {
                            map_id: self.id,
                            reason: TransferAbortReason::MaxPlayers,
                        },
                    );
                    return Err(AdmissionError::MaxPlayers { max_players });
                }
                if let Some(group) = data.group {
                    if ctx.rules.group_in_combat_with_instance(group, self.instance_id) {
                        ctx.send(
                            guid,
                            &ClientMessage::TransferAborted {
                                map_id: self.id,
                                reason: TransferAbortReason::ZoneInCombat,
                            },
                        );
                        return Err(AdmissionError::ZoneInCombat);
                    }
                }
                Ok(())
            }
        }
    }

    /// Admission checks plus the bind bookkeeping that goes with entering.
    /// Nothing is changed unless every check passes.
    pub(super) fn admit_player(&mut self, ctx: &SimContext, player: &mut WorldObject) -> Result<(), MapError> {
        self.can_enter(ctx, player)?;
        match self.kind {
            MapKind::Continent => Ok(()),
            MapKind::Battleground => {
                if let Some(data) = player.as_player_mut() {
                    data.instance_valid = true;
                }
                Ok(())
            }
            MapKind::Instance(_) => {
                if self.is_dungeon() {
                    let plan = self.plan_binds(ctx, player)?;
                    self.apply_binds(ctx, player.guid(), plan);
                }
                // Scheduled while empty; entering cancels it.
                self.set_reset_schedule(ctx, false);
                self.unload_timer = 0;
                if let Some(state) = self.instance_state_mut() {
                    state.reset_after_unload = false;
                    state.unload_when_empty = false;
                }
                Ok(())
            }
        }
    }

    fn new_save(&self, ctx: &SimContext) -> InstanceSave {
        let reset_time = if self.entry.is_raid_or_heroic_dungeon(self.difficulty) {
            ctx.now_secs() + u64::from(self.entry.max_reset_delay(self.difficulty))
        } else {
            ctx.now_secs() + NORMAL_INSTANCE_RESET_SECS
        };
        InstanceSave {
            instance_id: self.instance_id,
            map_id: self.id,
            difficulty: self.difficulty,
            reset_time,
            can_reset: true,
        }
    }

    fn plan_binds(&self, ctx: &SimContext, player: &WorldObject) -> Result<BindPlan, AdmissionError> {
        let guid = player.guid();
        let group = player.as_player().and_then(|p| p.group);
        let mut plan = BindPlan::default();
        if ctx.persistence.instance_save(self.instance_id).is_none() {
            plan.create_save = Some(self.new_save(ctx));
        }

        let player_bind = ctx.persistence.player_bind(guid, self.id, self.difficulty);
        if let Some(bind) = player_bind {
            if bind.permanent && bind.instance_id != self.instance_id {
                tracing::info!(%guid, bound = bind.instance_id, instance = self.instance_id, "player permanently bound elsewhere");
                return Err(AdmissionError::BoundElsewhere {
                    bound_instance: bind.instance_id,
                });
            }
        }

        let Some(group) = group else {
            if player_bind.is_none() {
                plan.bind_player = Some(InstanceBind {
                    instance_id: self.instance_id,
                    permanent: false,
                });
            }
            return Ok(plan);
        };

        if player_bind.is_some_and(|b| !b.permanent) {
            tracing::error!(%guid, "grouped player still holds a solo bind, dropping it");
            plan.unbind_player = true;
        }
        match ctx.persistence.group_bind(group, self.id, self.difficulty) {
            None => {
                plan.bind_group = Some((
                    group,
                    InstanceBind {
                        instance_id: self.instance_id,
                        permanent: false,
                    },
                ));
            }
            Some(bind) if bind.instance_id != self.instance_id => {
                tracing::info!(%guid, bound = bind.instance_id, instance = self.instance_id, "group bound elsewhere");
                return Err(AdmissionError::GroupBoundElsewhere {
                    bound_instance: bind.instance_id,
                });
            }
            Some(bind) => {
                // A permanent group bind carries over to every member who enters.
                if bind.permanent && !player_bind.is_some_and(|b| b.permanent) {
                    plan.bind_player = Some(InstanceBind {
                        instance_id: self.instance_id,
                        permanent: true,
                    });
                    plan.notify_save_created = true;
                }
            }
        }
        Ok(plan)
    }

    fn apply_binds(&self, ctx: &SimContext, player: ObjectGuid, plan: BindPlan) {
        let report = |what: &str, result: Result<(), crate::error::PersistenceError>| {
            if let Err(e) = result {
                tracing::error!(instance = self.instance_id, %player, error = %e, "{what} failed");
            }
        };
        if let Some(save) = plan.create_save {
            report("creating instance save", ctx.persistence.add_instance_save(save));
        }
        if plan.unbind_player {
            report("dropping solo bind", ctx.persistence.unbind_player(player, self.id, self.difficulty));
        }
        if let Some((group, bind)) = plan.bind_group {
            report("binding group", ctx.persistence.bind_group(group, self.id, self.difficulty, bind));
        }
        if let Some(bind) = plan.bind_player {
            report("binding player", ctx.persistence.bind_player(player, self.id, self.difficulty, bind));
        }
        if plan.notify_save_created {
            ctx.send(player, &ClientMessage::InstanceSaveCreated);
        }
    }

    pub(super) fn after_player_added(&mut self, _ctx: &SimContext, guid: ObjectGuid) {
        if let Some(script) = self.instance_script.as_mut() {
            script.on_player_enter(guid);
        }
    }

    pub(super) fn before_player_removed(&mut self, ctx: &SimContext, guid: ObjectGuid) {
        let Some(state) = self.instance_state() else {
            return;
        };
        if self.unload_timer == 0 && self.players.len() == 1 && self.players.contains(&guid) {
            self.unload_timer = if state.unload_when_empty {
                MIN_UNLOAD_DELAY
            } else {
                ctx.config.instance_unload_delay()
            };
            tracing::debug!(map = self.id, instance = self.instance_id, delay_ms = self.unload_timer, "last player leaving");
        }
    }

    pub(super) fn after_player_removed(&mut self, ctx: &SimContext) {
        if matches!(self.kind, MapKind::Instance(_)) {
            self.set_reset_schedule(ctx, true);
        }
    }

    /// Build the instance script and feed it stored data (`load`) or a fresh start.
    pub fn create_instance_data(&mut self, ctx: &SimContext, load: bool) {
        if self.instance_script.is_some() {
            return;
        }
        let Some(script_id) = self.entry.instance_script else {
            return;
        };
        if let Some(state) = self.instance_state_mut() {
            state.script_id = Some(script_id);
        }
        let Some(mut script) = ctx.rules.create_instance_script(script_id, self.id) else {
            tracing::warn!(map = self.id, script_id, "no instance script registered");
            return;
        };
        let stored = if load {
            ctx.persistence.load_instance_data(self.instance_id)
        } else {
            None
        };
        match stored {
            Some(data) if !data.is_empty() => {
                tracing::debug!(map = self.id, instance = self.instance_id, "loading instance script data");
                script.load(&data);
            }
            _ => script.initialize(),
        }
        self.instance_script = Some(script);
    }

    pub fn save_instance_data(&self, ctx: &SimContext) {
        let Some(data) = self.instance_script.as_ref().and_then(|s| s.save()) else {
            return;
        };
        if let Err(e) = ctx.persistence.save_instance_data(self.instance_id, &data) {
            tracing::error!(instance = self.instance_id, error = %e, "failed to save instance data");
        }
    }

    pub fn is_encounter_in_progress(&self) -> bool {
        self.instance_script.as_ref().is_some_and(|s| s.is_encounter_in_progress())
    }

    pub(super) fn update_instance_script(&mut self, diff_ms: u32) {
        if let Some(script) = self.instance_script.as_mut() {
            script.update(diff_ms);
        }
    }

    /// Request a reset. Occupied instances are emptied first (or refuse, for
    /// [`ResetMethod::All`]); empty ones unload on the next manager pass.
    /// Returns whether the instance was empty.
    pub fn reset(&mut self, ctx: &SimContext, method: ResetMethod) -> bool {
        if !matches!(self.kind, MapKind::Instance(_)) {
            return !self.have_players();
        }
        if self.have_players() {
            if method == ResetMethod::All {
                self.send_to_players(ctx, &ClientMessage::InstanceResetFailed { map_id: self.id });
            } else {
                if method == ResetMethod::Global {
                    for guid in &self.players {
                        if let Some(p) = self.objects.get_mut(guid).and_then(WorldObject::as_player_mut) {
                            p.instance_valid = false;
                        }
                    }
                }
                if let Some(state) = self.instance_state_mut() {
                    state.unload_when_empty = true;
                    state.reset_after_unload = true;
                }
            }
        } else {
            self.unload_timer = MIN_UNLOAD_DELAY;
            if let Some(state) = self.instance_state_mut() {
                state.reset_after_unload = true;
            }
        }
        !self.have_players()
    }

    /// Permanently bind everyone inside, e.g. after a boss kill by `killer`.
    /// The killer's group is bound too when its leader is inside.
    pub fn perm_bind_all_players(&self, ctx: &SimContext, killer: ObjectGuid) {
        if !self.is_dungeon() {
            return;
        }
        if ctx.persistence.instance_save(self.instance_id).is_none() {
            tracing::error!(map = self.id, instance = self.instance_id, "no instance save to bind to");
            return;
        }
        let group = self.objects.get(&killer).and_then(|k| k.as_player()).and_then(|p| p.group);
        let leader = group.and_then(|g| ctx.rules.group_leader(g));
        let perm = InstanceBind {
            instance_id: self.instance_id,
            permanent: true,
        };
        for guid in &self.players {
            let bound = ctx.persistence.player_bind(*guid, self.id, self.difficulty);
            if !bound.is_some_and(|b| b.permanent) {
                if let Err(e) = ctx.persistence.bind_player(*guid, self.id, self.difficulty, perm) {
                    tracing::error!(%guid, error = %e, "permanent bind failed");
                    continue;
                }
                ctx.send(*guid, &ClientMessage::InstanceSaveCreated);
            }
            if let (Some(group), Some(leader)) = (group, leader) {
                if leader == *guid {
                    if let Err(e) = ctx.persistence.bind_group(group, self.id, self.difficulty, perm) {
                        tracing::error!(?group, error = %e, "permanent group bind failed");
                    }
                }
            }
        }
    }

    pub fn send_reset_warnings(&self, ctx: &SimContext, time_left_secs: u32) {
        self.send_to_players(
            ctx,
            &ClientMessage::InstanceResetWarning {
                map_id: self.id,
                difficulty: self.difficulty,
                time_left_secs,
            },
        );
    }

    /// Normal dungeons reset on their own only while empty.
    pub fn set_reset_schedule(&self, ctx: &SimContext, on: bool) {
        if !self.is_dungeon() || self.have_players() || self.entry.is_raid_or_heroic_dungeon(self.difficulty) {
            return;
        }
        let Some(save) = ctx.persistence.instance_save(self.instance_id) else {
            tracing::error!(map = self.id, instance = self.instance_id, on, "cannot change reset schedule, no save");
            return;
        };
        let result = if on {
            ctx.persistence.schedule_reset(ResetEvent {
                map_id: self.id,
                difficulty: self.difficulty,
                instance_id: self.instance_id,
                at_secs: save.reset_time,
            })
        } else {
            ctx.persistence.cancel_reset(self.instance_id)
        };
        if let Err(e) = result {
            tracing::error!(instance = self.instance_id, error = %e, "reset schedule change failed");
        }
    }

    /// Battlegrounds unload on the next manager pass once this is called.
    pub fn set_unload(&mut self) {
        self.unload_timer = MIN_UNLOAD_DELAY;
    }

    /// Count the unload timer down; true once it runs out.
    pub fn can_unload(&mut self, diff_ms: u32) -> bool {
        if self.unload_timer == 0 {
            return false;
        }
        if self.unload_timer <= diff_ms {
            return true;
        }
        self.unload_timer -= diff_ms;
        false
    }

    /// Empty the map before it is discarded. Remaining players leave through
    /// the transfer queue: home for dungeons and continents, the entry point
    /// for battlegrounds.
    pub fn unload_all(&mut self, ctx: &SimContext) {
        let players: Vec<ObjectGuid> = self.players.iter().copied().collect();
        if !players.is_empty() && matches!(self.kind, MapKind::Instance(_)) {
            tracing::error!(map = self.id, instance = self.instance_id, count = players.len(), "players still inside at unload");
        }
        for guid in players {
            let Some(data) = self.objects.get(&guid).and_then(WorldObject::as_player) else {
                continue;
            };
            let (destination, reason): (WorldPosition, TransferReason) = match self.kind {
                MapKind::Battleground => (
                    data.battleground_entry_point.unwrap_or(data.homebind),
                    TransferReason::BattlegroundExit,
                ),
                _ => (data.homebind, TransferReason::Homebind),
            };
            self.transfer_player(ctx, guid, destination, reason);
        }

        if self.instance_state().is_some_and(|s| s.reset_after_unload) {
            if let Err(e) = ctx.persistence.delete_respawn_times(self.instance_id) {
                tracing::error!(instance = self.instance_id, error = %e, "failed to delete respawn times");
            }
        }
        self.unload_all_grids(ctx);
        self.clear_scripts(ctx);
    }
}
