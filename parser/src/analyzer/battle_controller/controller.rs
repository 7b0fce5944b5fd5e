//! The battle controller: folds dispatched packet events into live entity
//! state and, on every countdown tick, seals an immutable snapshot into the
//! timeline.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::bitfield::{MINIMAP_PACK, decode_fixed_fields};
use crate::dispatch::{Dispatcher, PacketContext, PacketDecoder};
use crate::packet::{
    ControlPointState, DAMAGE_STATS_AGRO, DAMAGE_STATS_ENEMY, DAMAGE_STATS_SPOT, EntityKind,
    MethodCall, MethodCallKind, PlayerState, PropertyValue, PropertyValueKind,
};
use crate::types::{AccountId, EntityId, GameClock, Relation, Version};
use crate::{ReplayFile, ReplayMeta, Result};

use super::model::{
    AchievementRecord, Capture, CaptureRelation, ChatMessage, Death, MatchInfo, Plane, Player,
    ReplayModel, RibbonCounts, Score, Ship, Snapshot, Ward, Weather, format_mmss,
};
use super::timeline::Timeline;

/// Countdown updates discarded as startup noise before the first snapshot.
const TICKS_IGNORED: u32 = 31;

/// Controller lifecycle. `Idle` until the arena roster arrives, then
/// `Accumulating` between ticks, `Finished` after the battle-end packet or
/// the end of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerPhase {
    Idle,
    Accumulating,
    Finished,
}

/// Terminal battle outcome, when the recording saw one.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BattleResult {
    pub winner_team_id: i64,
    pub victory_type: i64,
}

pub struct BattleController {
    version: Version,
    phase: ControllerPhase,
    match_info: MatchInfo,
    arena_id: i64,
    owner_entity: Option<EntityId>,

    players: BTreeMap<AccountId, Player>,
    ships: BTreeMap<EntityId, Ship>,
    planes: BTreeMap<u64, Plane>,
    wards: BTreeMap<u64, Ward>,
    weather: Weather,

    control_points: Vec<ControlPointState>,
    team_scores: BTreeMap<i64, i64>,
    team_win_score: i64,

    ribbons: BTreeMap<u64, BTreeMap<i64, u32>>,
    achievements: BTreeMap<u64, BTreeMap<i64, u32>>,
    damage_enemy: BTreeMap<(i64, i64), f64>,
    damage_agro: BTreeMap<(i64, i64), f64>,
    damage_spot: BTreeMap<(i64, i64), f64>,

    deaths: Vec<Death>,
    chat: Vec<ChatMessage>,
    timeline: Timeline,

    time_left: i64,
    tick_skip: u32,
    clock: GameClock,
    start_clock: Option<GameClock>,
    owner_kill_times: Vec<f32>,
    battle_result: Option<BattleResult>,
}

impl BattleController {
    pub fn new(meta: &ReplayMeta) -> Self {
        Self {
            version: meta.version(),
            phase: ControllerPhase::Idle,
            match_info: MatchInfo {
                map_name: meta.bare_map_name().to_string(),
                battle_type: meta.game_mode,
                match_group: meta.match_group.clone(),
                ..MatchInfo::default()
            },
            arena_id: 0,
            owner_entity: None,
            players: BTreeMap::new(),
            ships: BTreeMap::new(),
            planes: BTreeMap::new(),
            wards: BTreeMap::new(),
            weather: Weather::default(),
            control_points: Vec::new(),
            team_scores: BTreeMap::new(),
            team_win_score: 0,
            ribbons: BTreeMap::new(),
            achievements: BTreeMap::new(),
            damage_enemy: BTreeMap::new(),
            damage_agro: BTreeMap::new(),
            damage_spot: BTreeMap::new(),
            deaths: Vec::new(),
            chat: Vec::new(),
            timeline: Timeline::new(),
            time_left: 0,
            tick_skip: 0,
            clock: GameClock(0.0),
            start_clock: None,
            owner_kill_times: Vec::new(),
            battle_result: None,
        }
    }

    /// Builds the dispatcher wiring every handled (entity, event) pair to
    /// this controller.
    pub fn dispatcher() -> Dispatcher<Self> {
        use EntityKind::{Avatar, BattleLogic, Vehicle};

        let mut d = Dispatcher::new();
        d.on_clock(|ctrl: &mut Self, clock| ctrl.clock = clock);
        d.on_player_entered(|ctrl: &mut Self, entity_id| {
            ctrl.owner_entity = Some(entity_id);
        });

        d.on_method(Avatar, MethodCallKind::OnArenaStateReceived, Self::handle_arena_state);
        d.on_method(Avatar, MethodCallKind::OnGameRoomStateChanged, Self::handle_room_state);
        d.on_method(
            Avatar,
            MethodCallKind::OnNewPlayerSpawnedInBattle,
            Self::handle_player_spawned,
        );
        d.on_method(Avatar, MethodCallKind::ReceiveVehicleDeath, Self::handle_vehicle_death);
        d.on_method(Avatar, MethodCallKind::OnRibbon, Self::handle_ribbon);
        d.on_method(Avatar, MethodCallKind::OnAchievementEarned, Self::handle_achievement);
        d.on_method(Avatar, MethodCallKind::ReceiveDamageStat, Self::handle_damage_stat);
        d.on_method(
            Avatar,
            MethodCallKind::UpdateMinimapVisionInfo,
            Self::handle_minimap_vision,
        );
        d.on_method(Avatar, MethodCallKind::AddSquadron, Self::handle_add_squadron);
        d.on_method(Avatar, MethodCallKind::UpdateSquadron, Self::handle_update_squadron);
        d.on_method(Avatar, MethodCallKind::RemoveSquadron, Self::handle_remove_squadron);
        d.on_method(Avatar, MethodCallKind::WardAdded, Self::handle_ward_added);
        d.on_method(Avatar, MethodCallKind::WardRemoved, Self::handle_ward_removed);
        d.on_method(Avatar, MethodCallKind::OnChatMessage, Self::handle_chat);
        d.on_method(Avatar, MethodCallKind::OnBattleEnd, Self::handle_battle_end);

        d.on_property(Avatar, PropertyValueKind::WeatherParams, Self::handle_weather);
        d.on_property(Vehicle, PropertyValueKind::Health, Self::handle_health);
        d.on_property(Vehicle, PropertyValueKind::MaxHealth, Self::handle_max_health);
        d.on_property(Vehicle, PropertyValueKind::IsAlive, Self::handle_is_alive);
        d.on_property(BattleLogic, PropertyValueKind::TimeLeft, Self::handle_time_left);
        d.on_property(
            BattleLogic,
            PropertyValueKind::ControlPoints,
            Self::handle_control_points,
        );
        d.on_property(BattleLogic, PropertyValueKind::TeamsScore, Self::handle_teams_score);
        d.on_property(BattleLogic, PropertyValueKind::TeamWinScore, Self::handle_team_win_score);
        d
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn battle_result(&self) -> Option<&BattleResult> {
        self.battle_result.as_ref()
    }

    // ---- roster ----

    fn handle_arena_state(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::OnArenaStateReceived {
            arena_id,
            players_states,
            ..
        } = call
        else {
            return;
        };

        ctrl.arena_id = *arena_id;

        let Some(owner_entity) = ctrl.owner_entity else {
            warn!("arena state received before the recording player entered the world");
            return;
        };
        let Some(owner) = players_states
            .iter()
            .find(|p| p.avatar_id.raw() == owner_entity.raw() as u64)
        else {
            warn!("recording player missing from arena roster");
            return;
        };

        ctrl.match_info.arena_id = *arena_id;
        ctrl.match_info.owner_avatar_id = owner.avatar_id;
        ctrl.match_info.owner_vehicle_id = owner.vehicle_id;
        ctrl.match_info.owner_team = owner.team_id;
        ctrl.match_info.owner_realm = owner.realm.clone();

        for state in players_states {
            ctrl.upsert_participant(state, true);
        }
        ctrl.phase = ControllerPhase::Accumulating;
        debug!(players = players_states.len(), "arena roster received");
    }

    fn handle_room_state(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::OnGameRoomStateChanged { players_data } = call else {
            return;
        };
        for state in players_data {
            ctrl.upsert_participant(state, false);
        }
    }

    fn handle_player_spawned(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::OnNewPlayerSpawnedInBattle { players_states } = call else {
            return;
        };
        for state in players_states {
            ctrl.upsert_participant(state, false);
        }
    }

    /// Creates the Player and its paired Ship. Relation is computed once
    /// from the roster; a later roster packet only re-describes an entity
    /// when `replace` is set (the initial arena state).
    fn upsert_participant(&mut self, state: &PlayerState, replace: bool) {
        let is_owner = state.avatar_id == self.match_info.owner_avatar_id;
        let relation =
            Relation::from_teams(state.team_id, self.match_info.owner_team, is_owner);

        let player = Player {
            avatar_id: state.avatar_id,
            account_id: state.account_db_id,
            vehicle_id: state.vehicle_id,
            ship_params_id: state.ship_params_id,
            realm: state.realm.clone(),
            bot: state.is_bot,
            name: state.name.clone(),
            clan_tag: state.clan_tag.clone(),
            clan_color: state.clan_color,
            relation,
        };
        let ship = Ship::new(
            state.avatar_id,
            state.vehicle_id,
            state.ship_params_id,
            relation,
            is_owner,
            state.max_health,
        );

        if replace {
            self.players.insert(state.avatar_id, player);
            self.ships.insert(state.vehicle_id, ship);
        } else {
            self.players.entry(state.avatar_id).or_insert(player);
            self.ships.entry(state.vehicle_id).or_insert(ship);
        }
    }

    // ---- minimap vision ----

    fn handle_minimap_vision(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::UpdateMinimapVisionInfo { ships, .. } = call else {
            return;
        };
        for diff in ships {
            let decoded = decode_fixed_fields(diff.packed as u64, &MINIMAP_PACK);
            let Some(ship) = ctrl.ships.get_mut(&diff.vehicle_id) else {
                trace!(vehicle = %diff.vehicle_id, "vision diff for unknown vehicle");
                continue;
            };
            ship.apply_vision(decoded.values[0], decoded.values[1], decoded.values[2]);
        }
    }

    // ---- squadrons ----

    fn handle_add_squadron(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::AddSquadron {
            squadron,
            squadron_id,
            team_id,
            params_id,
            x,
            y,
        } = call
        else {
            return;
        };

        let is_ally = *team_id == ctrl.match_info.owner_team;
        let is_owner = EntityId(squadron.owner_id) == ctrl.match_info.owner_vehicle_id;
        let relation = if is_owner {
            Relation::Own
        } else if is_ally {
            Relation::Ally
        } else {
            Relation::Enemy
        };

        let mut plane = Plane::new(*squadron_id, *squadron, *params_id, relation);
        plane.set_position(*x, *y);
        ctrl.planes.insert(*squadron_id, plane);
    }

    fn handle_update_squadron(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::UpdateSquadron { squadron_id, x, y } = call else {
            return;
        };
        if let Some(plane) = ctrl.planes.get_mut(squadron_id) {
            plane.set_position(*x, *y);
        }
    }

    fn handle_remove_squadron(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::RemoveSquadron { squadron_id } = call else {
            return;
        };
        ctrl.planes.remove(squadron_id);
    }

    // ---- wards ----

    fn handle_ward_added(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::WardAdded {
            plane_id,
            x,
            y,
            radius,
            duration,
            team_id,
            vehicle_id,
        } = call
        else {
            return;
        };
        let relation = if *team_id == ctrl.match_info.owner_team {
            Relation::Ally
        } else {
            Relation::Enemy
        };
        ctrl.wards.insert(
            *plane_id,
            Ward {
                plane_id: *plane_id,
                vehicle_id: *vehicle_id,
                relation,
                x: x.round() as i32,
                y: y.round() as i32,
                radius: radius.round() as i32,
                duration: duration.round() as i32,
            },
        );
    }

    fn handle_ward_removed(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::WardRemoved { plane_id } = call else {
            return;
        };
        ctrl.wards.remove(plane_id);
    }

    // ---- vehicle properties ----

    fn handle_health(ctrl: &mut Self, ctx: &PacketContext, value: &PropertyValue) {
        let PropertyValue::Health(health) = value else {
            return;
        };
        // Lifecycle and property packets race; a vehicle we have not seen
        // in the roster yet is expected.
        if let Some(ship) = ctrl.ships.get_mut(&ctx.entity_id) {
            ship.health = health.round() as i64;
        }
    }

    fn handle_max_health(ctrl: &mut Self, ctx: &PacketContext, value: &PropertyValue) {
        let PropertyValue::MaxHealth(max_health) = value else {
            return;
        };
        if let Some(ship) = ctrl.ships.get_mut(&ctx.entity_id) {
            ship.health_max = max_health.round() as i64;
        }
    }

    fn handle_is_alive(ctrl: &mut Self, ctx: &PacketContext, value: &PropertyValue) {
        let PropertyValue::IsAlive(is_alive) = value else {
            return;
        };
        if let Some(ship) = ctrl.ships.get_mut(&ctx.entity_id) {
            ship.is_alive = *is_alive;
        }
    }

    fn handle_weather(ctrl: &mut Self, _ctx: &PacketContext, value: &PropertyValue) {
        let PropertyValue::WeatherParams {
            ship_vision_distance,
            plane_vision_distance,
        } = value
        else {
            return;
        };
        ctrl.weather = Weather {
            vision_distance_ship: *ship_vision_distance,
            vision_distance_plane: *plane_vision_distance,
        };
    }

    // ---- battle logic state ----

    fn handle_control_points(ctrl: &mut Self, _ctx: &PacketContext, value: &PropertyValue) {
        let PropertyValue::ControlPoints(points) = value else {
            return;
        };
        ctrl.control_points = points.clone();
    }

    fn handle_teams_score(ctrl: &mut Self, _ctx: &PacketContext, value: &PropertyValue) {
        let PropertyValue::TeamsScore(entries) = value else {
            return;
        };
        for entry in entries {
            ctrl.team_scores.insert(entry.team_id, entry.score);
        }
    }

    fn handle_team_win_score(ctrl: &mut Self, _ctx: &PacketContext, value: &PropertyValue) {
        let PropertyValue::TeamWinScore(win_score) = value else {
            return;
        };
        ctrl.team_win_score = *win_score;
    }

    // ---- the tick driver ----

    fn handle_time_left(ctrl: &mut Self, ctx: &PacketContext, value: &PropertyValue) {
        let PropertyValue::TimeLeft(time_left) = value else {
            return;
        };
        ctrl.time_left = *time_left;

        if ctrl.tick_skip < TICKS_IGNORED {
            ctrl.tick_skip += 1;
            return;
        }
        if ctrl.start_clock.is_none() {
            ctrl.start_clock = Some(ctx.clock);
        }
        ctrl.seal_snapshot();
    }

    fn seal_snapshot(&mut self) {
        let owner_team = self.match_info.owner_team;

        let mut score = Score {
            win_score: self.team_win_score,
            ..Score::default()
        };
        for (&team_id, &team_score) in &self.team_scores {
            if team_id == owner_team {
                score.ally_score = team_score;
            } else {
                score.enemy_score = team_score;
            }
        }

        let captures = self
            .control_points
            .iter()
            .enumerate()
            .map(|(idx, cp)| {
                let relation = if cp.team_id == owner_team && cp.team_id != -1 {
                    CaptureRelation::Ally
                } else if cp.team_id != owner_team && cp.team_id != -1 {
                    CaptureRelation::Enemy
                } else {
                    CaptureRelation::Neutral
                };
                Capture {
                    id: idx,
                    x: cp.x,
                    y: cp.y,
                    radius: cp.radius,
                    inner_radius: cp.inner_radius,
                    team_id: cp.team_id,
                    relation,
                    both_inside: cp.both_inside,
                    has_invaders: cp.has_invaders,
                    invader_team: cp.invader_team,
                    progress_percent: cp.progress,
                    progress_total: cp.progress_total,
                }
            })
            .collect();

        let owner_key = self.match_info.owner_avatar_id.raw();
        let ribbons = self
            .ribbons
            .get(&owner_key)
            .map(RibbonCounts::from_counter)
            .unwrap_or_default();
        let achievements = self
            .achievements
            .get(&owner_key)
            .map(|counter| {
                counter
                    .iter()
                    .map(|(&id, &count)| AchievementRecord { id, count })
                    .collect()
            })
            .unwrap_or_default();

        let snapshot = Snapshot {
            time_label: format_mmss(self.time_left),
            ships: self.ships.clone(),
            planes: self.planes.clone(),
            wards: self.wards.clone(),
            captures,
            deaths: self.deaths.iter().rev().cloned().collect(),
            damage: sum_damage(&self.damage_enemy),
            damage_potential: sum_damage(&self.damage_agro),
            damage_spotting: sum_damage(&self.damage_spot),
            ribbons,
            achievements,
            score,
            weather: self.weather,
        };

        self.timeline.push(self.time_left, snapshot);
    }

    // ---- owner-attributed counters ----

    fn handle_ribbon(ctrl: &mut Self, ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::OnRibbon { ribbon_id } = call else {
            return;
        };
        *ctrl
            .ribbons
            .entry(ctx.entity_id.raw() as u64)
            .or_default()
            .entry(*ribbon_id)
            .or_insert(0) += 1;
    }

    fn handle_achievement(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::OnAchievementEarned {
            avatar_id,
            achievement_id,
        } = call
        else {
            return;
        };
        *ctrl
            .achievements
            .entry(avatar_id.raw())
            .or_default()
            .entry(*achievement_id)
            .or_insert(0) += 1;
    }

    fn handle_damage_stat(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::ReceiveDamageStat { stats } = call else {
            return;
        };
        for entry in stats {
            let key = (entry.damage_type, entry.category);
            match entry.category {
                DAMAGE_STATS_ENEMY => {
                    ctrl.damage_enemy.insert(key, entry.damage);
                }
                DAMAGE_STATS_AGRO => {
                    ctrl.damage_agro.insert(key, entry.damage);
                }
                DAMAGE_STATS_SPOT => {
                    ctrl.damage_spot.insert(key, entry.damage);
                }
                other => {
                    trace!(category = other, "unclassified damage stat");
                }
            }
        }
    }

    // ---- kills / chat / end ----

    fn handle_vehicle_death(ctrl: &mut Self, ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::ReceiveVehicleDeath {
            killed_vehicle_id,
            fragger_vehicle_id,
            death_type,
        } = call
        else {
            return;
        };

        if *fragger_vehicle_id == ctrl.match_info.owner_vehicle_id {
            let start = ctrl.start_clock.unwrap_or(ctx.clock);
            ctrl.owner_kill_times.push(ctx.clock - start);
        }

        let killer = ctrl
            .ships
            .get(fragger_vehicle_id)
            .and_then(|ship| ctrl.players.get(&ship.avatar_id));
        let killed = ctrl
            .ships
            .get(killed_vehicle_id)
            .and_then(|ship| ctrl.players.get(&ship.avatar_id));
        let (Some(killer), Some(killed)) = (killer, killed) else {
            warn!(
                killed = %killed_vehicle_id,
                fragger = %fragger_vehicle_id,
                "death event for unknown vehicle"
            );
            return;
        };

        let death = Death {
            time: format_mmss(ctrl.time_left),
            killer_name: killer.tagged_name(),
            killer_avatar_id: killer.avatar_id,
            killer_vehicle_id: killer.vehicle_id,
            killed_name: killed.tagged_name(),
            killed_avatar_id: killed.avatar_id,
            killed_vehicle_id: killed.vehicle_id,
            death_type: *death_type,
        };
        ctrl.deaths.push(death);
    }

    fn handle_chat(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::OnChatMessage {
            sender_id,
            audience,
            message,
        } = call
        else {
            return;
        };
        if *sender_id == -1 {
            return;
        }
        let Some(player) = ctrl.players.get(&AccountId::from(*sender_id)) else {
            return;
        };
        ctrl.chat.push(ChatMessage {
            remaining_time: ctrl.time_left,
            clan: player.clan_tag.clone(),
            clan_color: player.clan_color,
            name: player.name.clone(),
            relation: player.relation,
            message: message.clone(),
            audience: audience.clone(),
        });
    }

    fn handle_battle_end(ctrl: &mut Self, _ctx: &PacketContext, call: &MethodCall) {
        let MethodCall::OnBattleEnd {
            winning_team,
            victory_type,
        } = call
        else {
            return;
        };
        ctrl.battle_result = Some(BattleResult {
            winner_team_id: *winning_team,
            victory_type: *victory_type,
        });
        ctrl.phase = ControllerPhase::Finished;
    }

    /// Consumes the controller into the final model.
    pub fn build_model(mut self) -> ReplayModel {
        self.phase = ControllerPhase::Finished;
        ReplayModel {
            arena_id: self.arena_id,
            version: self.version,
            match_info: self.match_info,
            players: self.players,
            timeline: self.timeline,
            chat: self.chat,
            owner_kill_times: self.owner_kill_times,
        }
    }
}

fn sum_damage(map: &BTreeMap<(i64, i64), f64>) -> i64 {
    map.values().map(|damage| damage.round() as i64).sum()
}

/// Decodes a parsed replay end-to-end into a [`ReplayModel`].
pub fn decode_replay(replay: &ReplayFile) -> Result<ReplayModel> {
    let mut controller = BattleController::new(&replay.meta);
    let mut decoder = PacketDecoder::new(replay.meta.version(), BattleController::dispatcher())?;
    decoder.decode_all(&replay.packet_data, &mut controller)?;
    debug!(
        packets = decoder.stats.packets,
        dispatched = decoder.stats.dispatched,
        skipped = decoder.stats.skipped,
        ticks = controller.timeline().len(),
        "decode finished"
    );
    Ok(controller.build_model())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MinimapDiff, TeamScoreEntry};
    use crate::types::GameParamId;

    fn meta() -> ReplayMeta {
        ReplayMeta {
            client_version_from_exe: "0,12,8,0".into(),
            game_mode: 11,
            match_group: "pvp".into(),
            map_name: "spaces/17_NA_fault_line".into(),
            player_name: "Owner".into(),
            duration: 1200.0,
            ..ReplayMeta::default()
        }
    }

    fn player_state(avatar: u64, vehicle: u32, team: i64, name: &str) -> PlayerState {
        PlayerState {
            avatar_id: AccountId(avatar),
            account_db_id: AccountId(avatar + 1000),
            vehicle_id: EntityId(vehicle),
            ship_params_id: GameParamId(4_000_000 + vehicle),
            realm: "eu".into(),
            is_bot: false,
            name: name.into(),
            clan_tag: String::new(),
            clan_color: 0,
            team_id: team,
            max_health: 30_000,
        }
    }

    fn ctx(entity: u32, clock: f32) -> PacketContext {
        PacketContext {
            entity_id: EntityId(entity),
            clock: GameClock(clock),
        }
    }

    struct Harness {
        ctrl: BattleController,
        dispatcher: Dispatcher<BattleController>,
    }

    impl Harness {
        fn new() -> Self {
            let mut harness = Harness {
                ctrl: BattleController::new(&meta()),
                dispatcher: BattleController::dispatcher(),
            };
            harness.ctrl.owner_entity = Some(EntityId(1));
            harness.method(
                1,
                0.0,
                MethodCall::OnArenaStateReceived {
                    arena_id: 777,
                    team_build_type_id: 0,
                    players_states: vec![
                        player_state(1, 100, 0, "Owner"),
                        player_state(2, 101, 0, "Friend"),
                        player_state(3, 102, 1, "Foe"),
                    ],
                },
            );
            harness
        }

        fn method(&mut self, entity: u32, clock: f32, call: MethodCall) {
            self.dispatcher.dispatch_method(
                &mut self.ctrl,
                EntityKind::Avatar,
                &ctx(entity, clock),
                &call,
            );
        }

        fn property(&mut self, kind: EntityKind, entity: u32, clock: f32, value: PropertyValue) {
            self.dispatcher
                .dispatch_property(&mut self.ctrl, kind, &ctx(entity, clock), &value);
        }

        /// Burns through the startup-noise window and seals one snapshot.
        fn tick(&mut self, time_left: i64, clock: f32) {
            while self.ctrl.tick_skip < TICKS_IGNORED {
                self.property(
                    EntityKind::BattleLogic,
                    50,
                    clock,
                    PropertyValue::TimeLeft(time_left + 1),
                );
            }
            self.property(
                EntityKind::BattleLogic,
                50,
                clock,
                PropertyValue::TimeLeft(time_left),
            );
        }
    }

    fn pack_vision(x: f64, y: f64, yaw: f64) -> u32 {
        let quant = |value: f64, min: f64, max: f64, bits: u32| -> u64 {
            let levels = ((1u64 << bits) - 1) as f64;
            ((value + min.abs()) / (min.abs() + max.abs()) * levels).round() as u64
        };
        let px = quant(x, -2500.0, 2500.0, 11);
        let py = quant(y, -2500.0, 2500.0, 11);
        let pyaw = quant(yaw, -std::f64::consts::PI, std::f64::consts::PI, 8);
        (px | (py << 11) | (pyaw << 22)) as u32
    }

    #[test]
    fn roster_creates_players_and_ships() {
        let harness = Harness::new();
        let ctrl = &harness.ctrl;

        assert_eq!(ctrl.phase(), ControllerPhase::Accumulating);
        assert_eq!(ctrl.match_info.owner_team, 0);
        assert_eq!(ctrl.match_info.owner_vehicle_id, EntityId(100));
        assert_eq!(ctrl.players[&AccountId(1)].relation, Relation::Own);
        assert_eq!(ctrl.players[&AccountId(2)].relation, Relation::Ally);
        assert_eq!(ctrl.players[&AccountId(3)].relation, Relation::Enemy);
        assert!(ctrl.ships[&EntityId(100)].is_owner);
        assert_eq!(ctrl.ships[&EntityId(102)].relation, Relation::Enemy);
    }

    #[test]
    fn room_state_never_redescribes_existing_entities() {
        let mut harness = Harness::new();
        let mut changed = player_state(2, 101, 1, "Renamed");
        changed.clan_tag = "NEW".into();
        harness.method(
            1,
            5.0,
            MethodCall::OnGameRoomStateChanged {
                players_data: vec![changed, player_state(4, 103, 1, "Late")],
            },
        );

        let ctrl = &harness.ctrl;
        // existing player untouched
        assert_eq!(ctrl.players[&AccountId(2)].name, "Friend");
        assert_eq!(ctrl.players[&AccountId(2)].relation, Relation::Ally);
        // newcomer added with computed relation
        assert_eq!(ctrl.players[&AccountId(4)].relation, Relation::Enemy);
        assert!(ctrl.ships.contains_key(&EntityId(103)));
    }

    #[test]
    fn startup_ticks_are_ignored() {
        let mut harness = Harness::new();
        for _ in 0..TICKS_IGNORED {
            harness.property(
                EntityKind::BattleLogic,
                50,
                10.0,
                PropertyValue::TimeLeft(1200),
            );
        }
        assert!(harness.ctrl.timeline().is_empty());

        harness.property(
            EntityKind::BattleLogic,
            50,
            11.0,
            PropertyValue::TimeLeft(1199),
        );
        assert_eq!(harness.ctrl.timeline().len(), 1);
        let entry = harness.ctrl.timeline().first().unwrap();
        assert_eq!(entry.remaining, 1199);
        assert_eq!(entry.snapshot.time_label, "19:59");
        assert_eq!(entry.snapshot.ships.len(), 3);
    }

    #[test]
    fn vision_diffs_update_ships_with_fog_fallback() {
        let mut harness = Harness::new();
        harness.method(
            1,
            20.0,
            MethodCall::UpdateMinimapVisionInfo {
                ships: vec![MinimapDiff {
                    vehicle_id: EntityId(102),
                    packed: pack_vision(800.0, -600.0, 0.5),
                }],
                buildings: vec![],
            },
        );

        {
            let ship = &harness.ctrl.ships[&EntityId(102)];
            assert!(ship.is_visible());
            assert!((ship.x() - 800).abs() <= 2);
            assert!((ship.y() + 600).abs() <= 2);
        }

        let seen_x = harness.ctrl.ships[&EntityId(102)].x();
        harness.method(
            1,
            21.0,
            MethodCall::UpdateMinimapVisionInfo {
                ships: vec![MinimapDiff {
                    vehicle_id: EntityId(102),
                    packed: pack_vision(-2500.0, -2500.0, -std::f64::consts::PI),
                }],
                buildings: vec![],
            },
        );
        let ship = &harness.ctrl.ships[&EntityId(102)];
        assert!(!ship.is_visible());
        assert_eq!(ship.x(), seen_x);
    }

    #[test]
    fn snapshot_carries_captures_and_score() {
        let mut harness = Harness::new();
        harness.property(
            EntityKind::BattleLogic,
            50,
            30.0,
            PropertyValue::ControlPoints(vec![
                ControlPointState {
                    x: 100.0,
                    y: 100.0,
                    radius: 120.0,
                    inner_radius: 60.0,
                    team_id: 0,
                    invader_team: -1,
                    has_invaders: false,
                    both_inside: false,
                    progress: 0.0,
                    progress_total: 180.0,
                },
                ControlPointState {
                    x: -100.0,
                    y: -100.0,
                    radius: 120.0,
                    inner_radius: 60.0,
                    team_id: -1,
                    invader_team: -1,
                    has_invaders: false,
                    both_inside: false,
                    progress: 0.25,
                    progress_total: -1.0,
                },
            ]),
        );
        harness.property(
            EntityKind::BattleLogic,
            50,
            30.0,
            PropertyValue::TeamsScore(vec![
                TeamScoreEntry {
                    team_id: 0,
                    score: 450,
                },
                TeamScoreEntry {
                    team_id: 1,
                    score: 321,
                },
            ]),
        );
        harness.property(
            EntityKind::BattleLogic,
            50,
            30.0,
            PropertyValue::TeamWinScore(1000),
        );
        harness.tick(1100, 31.0);

        let snapshot = &harness.ctrl.timeline().last().unwrap().snapshot;
        assert_eq!(snapshot.score.ally_score, 450);
        assert_eq!(snapshot.score.enemy_score, 321);
        assert_eq!(snapshot.score.win_score, 1000);
        assert_eq!(snapshot.captures.len(), 2);
        assert_eq!(snapshot.captures[0].relation, CaptureRelation::Ally);
        assert_eq!(snapshot.captures[1].relation, CaptureRelation::Neutral);
        assert_eq!(snapshot.captures[0].progress_total, 180.0);
    }

    #[test]
    fn owner_kill_records_elapsed_time() {
        let mut harness = Harness::new();
        harness.tick(1150, 40.0); // establishes battle start at clock 40

        harness.method(
            1,
            100.0,
            MethodCall::ReceiveVehicleDeath {
                killed_vehicle_id: EntityId(102),
                fragger_vehicle_id: EntityId(100),
                death_type: 2,
            },
        );

        let ctrl = &harness.ctrl;
        assert_eq!(ctrl.owner_kill_times.len(), 1);
        assert!((ctrl.owner_kill_times[0] - 60.0).abs() < 0.01);
        assert_eq!(ctrl.deaths.len(), 1);
        assert_eq!(ctrl.deaths[0].killer_name, "Owner");
        assert_eq!(ctrl.deaths[0].killed_name, "Foe");

        // the next snapshot sees the kill log newest-first
        harness.property(
            EntityKind::BattleLogic,
            50,
            101.0,
            PropertyValue::TimeLeft(1090),
        );
        let snapshot = &harness.ctrl.timeline().last().unwrap().snapshot;
        assert_eq!(snapshot.deaths.len(), 1);
    }

    #[test]
    fn death_for_unknown_vehicle_fails_soft() {
        let mut harness = Harness::new();
        harness.method(
            1,
            50.0,
            MethodCall::ReceiveVehicleDeath {
                killed_vehicle_id: EntityId(999),
                fragger_vehicle_id: EntityId(998),
                death_type: 2,
            },
        );
        assert!(harness.ctrl.deaths.is_empty());
    }

    #[test]
    fn chat_messages_accumulate_outside_timeline() {
        let mut harness = Harness::new();
        harness.ctrl.time_left = 1000;
        harness.method(
            1,
            60.0,
            MethodCall::OnChatMessage {
                sender_id: 3,
                audience: "battle_common".into(),
                message: "gl hf".into(),
            },
        );
        // unknown sender is dropped
        harness.method(
            1,
            61.0,
            MethodCall::OnChatMessage {
                sender_id: 42,
                audience: "battle_common".into(),
                message: "???".into(),
            },
        );

        let ctrl = &harness.ctrl;
        assert_eq!(ctrl.chat.len(), 1);
        assert_eq!(ctrl.chat[0].name, "Foe");
        assert_eq!(ctrl.chat[0].relation, Relation::Enemy);
        assert_eq!(ctrl.chat[0].remaining_time, 1000);
    }

    #[test]
    fn health_for_unknown_vehicle_is_ignored() {
        let mut harness = Harness::new();
        harness.property(
            EntityKind::Vehicle,
            999,
            10.0,
            PropertyValue::Health(5000.0),
        );
        harness.property(EntityKind::Vehicle, 102, 10.0, PropertyValue::Health(5000.0));
        assert_eq!(harness.ctrl.ships[&EntityId(102)].health, 5000);
    }

    #[test]
    fn battle_end_finishes_the_controller() {
        let mut harness = Harness::new();
        harness.method(
            1,
            900.0,
            MethodCall::OnBattleEnd {
                winning_team: 0,
                victory_type: 1,
            },
        );
        assert_eq!(harness.ctrl.phase(), ControllerPhase::Finished);
        let model = harness.ctrl.build_model();
        assert_eq!(model.arena_id, 777);
        assert_eq!(model.match_info.battle_type, 11);
        assert_eq!(model.match_info.map_name, "17_NA_fault_line");
    }

    #[test]
    fn damage_stats_classify_by_category() {
        let mut harness = Harness::new();
        harness.method(
            1,
            70.0,
            MethodCall::ReceiveDamageStat {
                stats: vec![
                    crate::packet::DamageStatEntry {
                        damage_type: 0,
                        category: DAMAGE_STATS_ENEMY,
                        hits: 12.0,
                        damage: 15_432.4,
                    },
                    crate::packet::DamageStatEntry {
                        damage_type: 0,
                        category: DAMAGE_STATS_AGRO,
                        hits: 1.0,
                        damage: 250_000.0,
                    },
                    crate::packet::DamageStatEntry {
                        damage_type: 1,
                        category: DAMAGE_STATS_SPOT,
                        hits: 3.0,
                        damage: 8_000.6,
                    },
                ],
            },
        );
        harness.tick(1100, 71.0);

        let snapshot = &harness.ctrl.timeline().last().unwrap().snapshot;
        assert_eq!(snapshot.damage, 15_432);
        assert_eq!(snapshot.damage_potential, 250_000);
        assert_eq!(snapshot.damage_spotting, 8_001);
    }
}
