//! Client-visible sets and message fan-out.

use std::collections::BTreeSet;

use worldgrid_common::ObjectGuid;
use worldgrid_stream::CellArea;

use super::Map;
use crate::context::SimContext;
use crate::message::ClientMessage;
use crate::object::Positioned;

impl Map {
    /// Recompute which players see `guid` after it appeared, moved or changed.
    pub(super) fn update_object_visibility(&mut self, ctx: &SimContext, guid: ObjectGuid) {
        let Some(obj) = self.objects.get(&guid) else {
            return;
        };
        let pos = *obj.position();
        let shown = obj.is_in_world() && obj.is_visible_to_players();
        let range = self.visibility_distance;

        for player in &self.players {
            if *player == guid {
                continue;
            }
            let Some(p) = self.objects.get_mut(player) else {
                continue;
            };
            let in_range = shown && p.position().distance_2d(&pos) <= range;
            let Some(visible) = p.visible_mut() else {
                continue;
            };
            if in_range {
                if visible.insert(guid) {
                    ctx.send(*player, &ClientMessage::CreateObject { guid });
                }
            } else if visible.remove(&guid) {
                ctx.send(*player, &ClientMessage::DestroyObject { guid });
            }
        }
    }

    /// Recompute what the player `guid` sees around itself.
    pub(super) fn update_visible_for_player(&mut self, ctx: &SimContext, guid: ObjectGuid) {
        let Some(player) = self.objects.get(&guid) else {
            return;
        };
        let pos = *player.position();
        let range = self.visibility_distance;
        let area = CellArea::around(pos.x(), pos.y(), range);

        let mut now_visible = BTreeSet::new();
        for coord in area.grids() {
            let Some(grid) = self.grid(coord) else {
                continue;
            };
            for cell in area.iter().filter(|c| c.grid() == coord) {
                for other in grid.cell_objects(cell) {
                    if other == guid {
                        continue;
                    }
                    let Some(obj) = self.objects.get(&other) else {
                        continue;
                    };
                    if obj.is_visible_to_players() && obj.position().distance_2d(&pos) <= range {
                        now_visible.insert(other);
                    }
                }
            }
        }

        let Some(visible) = self.objects.get_mut(&guid).and_then(|p| p.visible_mut()) else {
            return;
        };
        let gone: Vec<ObjectGuid> = visible.difference(&now_visible).copied().collect();
        let new: Vec<ObjectGuid> = now_visible.difference(visible).copied().collect();
        *visible = now_visible;
        for other in gone {
            ctx.send(guid, &ClientMessage::DestroyObject { guid: other });
        }
        for other in new {
            ctx.send(guid, &ClientMessage::CreateObject { guid: other });
        }
    }

    /// Drop `guid` from every visible set, telling the clients.
    pub(super) fn forget_visibility(&mut self, ctx: &SimContext, guid: ObjectGuid) {
        for player in &self.players {
            let Some(visible) = self.objects.get_mut(player).and_then(|p| p.visible_mut()) else {
                continue;
            };
            if visible.remove(&guid) {
                ctx.send(*player, &ClientMessage::DestroyObject { guid });
            }
        }
    }

    /// Send to every player that sees `source`, and to `source` itself when
    /// `to_self` is set and it is a player.
    pub fn message_broadcast(&self, ctx: &SimContext, source: ObjectGuid, message: &ClientMessage, to_self: bool) {
        for player in &self.players {
            let Some(p) = self.objects.get(player) else {
                continue;
            };
            if (*player == source && to_self) || (*player != source && p.can_see_object(source)) {
                ctx.send(*player, message);
            }
        }
    }

    /// Send to every player within `distance` of `source`.
    pub fn message_dist_broadcast(
        &self,
        ctx: &SimContext,
        source: ObjectGuid,
        message: &ClientMessage,
        distance: f32,
        to_self: bool,
        own_team_only: bool,
    ) {
        let Some(src) = self.objects.get(&source) else {
            return;
        };
        let team = src.as_player().map(|p| p.team);
        for player in &self.players {
            if *player == source {
                if to_self {
                    ctx.send(source, message);
                }
                continue;
            }
            let Some(p) = self.objects.get(player) else {
                continue;
            };
            if p.position().distance(src.position()) > distance {
                continue;
            }
            if own_team_only && team.is_some() && p.as_player().map(|d| d.team) != team {
                continue;
            }
            ctx.send(*player, message);
        }
    }

    /// Send to every player on the map.
    pub fn send_to_players(&self, ctx: &SimContext, message: &ClientMessage) {
        for player in &self.players {
            ctx.send(*player, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use worldgrid_common::{Difficulty, Team};

    use super::super::test_support::*;
    use super::*;
    use crate::config::WorldConfig;
    use crate::object::WorldObject;

    #[test]
    fn players_see_nearby_objects_and_lose_removed_ones() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let here = point_in(30, 30, 3, 3);
        let player = WorldObject::player(1, "Ana", at(0, here));
        let pguid = player.guid();
        map.add(&h.ctx, player).unwrap();
        let creature = WorldObject::creature(10, 1, at(0, here));
        let cguid = creature.guid();
        map.add(&h.ctx, creature).unwrap();
        assert!(map.object(pguid).unwrap().can_see_object(cguid));
        assert!(h.sessions.sent_to(pguid).contains(&ClientMessage::CreateObject { guid: cguid }));

        map.remove(&h.ctx, cguid, true);
        assert!(!map.object(pguid).unwrap().can_see_object(cguid));
        assert!(h.sessions.sent_to(pguid).contains(&ClientMessage::DestroyObject { guid: cguid }));
    }

    #[test]
    fn moving_out_of_range_destroys_on_the_client() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let player = WorldObject::player(1, "Ana", at(0, point_in(30, 30, 0, 0)));
        let pguid = player.guid();
        map.add(&h.ctx, player).unwrap();
        let creature = WorldObject::creature(10, 1, at(0, point_in(30, 30, 0, 1)));
        let cguid = creature.guid();
        map.add(&h.ctx, creature).unwrap();
        assert!(map.object(pguid).unwrap().can_see_object(cguid));

        let (x, y) = point_in(30, 30, 7, 7);
        map.relocate(&h.ctx, pguid, x, y, 0.0, 0.0).unwrap();
        assert!(!map.object(pguid).unwrap().can_see_object(cguid));
    }

    #[test]
    fn players_see_each_other() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let here = point_in(30, 30, 3, 3);
        let a = WorldObject::player(1, "Ana", at(0, here));
        let b = WorldObject::player(2, "Bo", at(0, here));
        let (ga, gb) = (a.guid(), b.guid());
        map.add(&h.ctx, a).unwrap();
        map.add(&h.ctx, b).unwrap();
        assert!(map.object(ga).unwrap().can_see_object(gb));
        assert!(map.object(gb).unwrap().can_see_object(ga));
    }

    #[test]
    fn distance_broadcast_respects_team() {
        let h = harness(WorldConfig::default());
        let mut map = Map::new(&h.ctx, &continent(), 0, Difficulty::REGULAR);
        let here = point_in(30, 30, 3, 3);
        let speaker = WorldObject::player(1, "Ana", at(0, here));
        let mut enemy = WorldObject::player(2, "Bo", at(0, here));
        enemy.as_player_mut().unwrap().team = Team::Horde;
        let ally = WorldObject::player(3, "Cy", at(0, here));
        let (gs, ge, ga) = (speaker.guid(), enemy.guid(), ally.guid());
        for p in [speaker, enemy, ally] {
            map.add(&h.ctx, p).unwrap();
        }
        h.sessions.take();

        let msg = ClientMessage::Emote { source: gs, emote_id: 4 };
        map.message_dist_broadcast(&h.ctx, gs, &msg, 25.0, false, true);
        assert_eq!(h.sessions.sent_to(ga), vec![msg.clone()]);
        assert!(h.sessions.sent_to(ge).is_empty());
        assert!(h.sessions.sent_to(gs).is_empty());

        h.sessions.take();
        map.send_to_players(&h.ctx, &msg);
        assert_eq!(h.sessions.sent().len(), 3);
    }
}
