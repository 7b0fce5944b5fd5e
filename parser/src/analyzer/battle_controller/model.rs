//! The replay data model shared between the battle controller and the
//! renderer. Everything here is value-like: mutation only happens inside the
//! controller while building the next snapshot, never after a snapshot is
//! sealed into the timeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bitfield::{SquadronId, SquadronPurpose};
use crate::types::{AccountId, EntityId, GameParamId, Relation, Version};

use super::timeline::Timeline;

/// World coordinate meaning "not currently visible" on the minimap.
pub const COORD_SENTINEL: i32 = -2500;
/// Yaw (degrees) counterpart of [`COORD_SENTINEL`].
pub const YAW_SENTINEL: i32 = -180;

/// Battle-level facts established once at battle start.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MatchInfo {
    pub arena_id: i64,
    pub map_name: String,
    pub owner_avatar_id: AccountId,
    pub owner_vehicle_id: EntityId,
    pub owner_team: i64,
    pub owner_realm: String,
    pub battle_type: i32,
    pub match_group: String,
}

/// One battle participant.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Player {
    pub avatar_id: AccountId,
    pub account_id: AccountId,
    pub vehicle_id: EntityId,
    pub ship_params_id: GameParamId,
    pub realm: String,
    pub bot: bool,
    pub name: String,
    pub clan_tag: String,
    pub clan_color: i64,
    pub relation: Relation,
}

impl Player {
    /// `[CLAN]Name`, or just the name for clanless players.
    pub fn tagged_name(&self) -> String {
        if self.clan_tag.is_empty() {
            self.name.clone()
        } else {
            format!("[{}]{}", self.clan_tag, self.name)
        }
    }
}

/// A coordinate with an explicit last-known fallback. `current` is `None`
/// while the sentinel is being reported; `last_known` only advances on
/// non-sentinel writes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackedCoord {
    current: Option<i32>,
    last_known: i32,
}

impl TrackedCoord {
    fn new() -> Self {
        Self {
            current: None,
            last_known: COORD_SENTINEL,
        }
    }

    fn set(&mut self, value: i32) {
        if value == COORD_SENTINEL {
            self.current = None;
        } else {
            self.current = Some(value);
            self.last_known = value;
        }
    }

    fn current(&self) -> Option<i32> {
        self.current
    }

    fn last_known(&self) -> i32 {
        self.last_known
    }
}

/// Yaw keeps its raw value even at the sentinel; only the last-known side is
/// gated, and visibility is decided by the coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackedYaw {
    current: i32,
    last_known: i32,
}

impl TrackedYaw {
    fn new() -> Self {
        Self {
            current: YAW_SENTINEL,
            last_known: YAW_SENTINEL,
        }
    }

    fn set(&mut self, value: i32) {
        self.current = value;
        if value != YAW_SENTINEL {
            self.last_known = value;
        }
    }
}

/// A ship on the minimap. Ships persist for the whole battle, dead or alive;
/// the position accessors implement the fog-of-war contract: while the ship
/// is not visible they transparently fall back to the last value observed
/// while it was visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ship {
    pub avatar_id: AccountId,
    pub vehicle_id: EntityId,
    pub ship_params_id: GameParamId,
    pub relation: Relation,
    pub is_alive: bool,
    pub is_owner: bool,
    pub health: i64,
    pub health_max: i64,
    x: TrackedCoord,
    y: TrackedCoord,
    yaw: TrackedYaw,
}

impl Ship {
    pub fn new(
        avatar_id: AccountId,
        vehicle_id: EntityId,
        ship_params_id: GameParamId,
        relation: Relation,
        is_owner: bool,
        health_max: i64,
    ) -> Self {
        Self {
            avatar_id,
            vehicle_id,
            ship_params_id,
            relation,
            is_alive: true,
            is_owner,
            health: 0,
            health_max,
            x: TrackedCoord::new(),
            y: TrackedCoord::new(),
            yaw: TrackedYaw::new(),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.x.current().is_some() && self.y.current().is_some()
    }

    pub fn x(&self) -> i32 {
        match self.x.current() {
            Some(v) if self.is_visible() => v,
            _ => self.x.last_known(),
        }
    }

    pub fn y(&self) -> i32 {
        match self.y.current() {
            Some(v) if self.is_visible() => v,
            _ => self.y.last_known(),
        }
    }

    pub fn yaw(&self) -> i32 {
        if self.is_visible() {
            self.yaw.current
        } else {
            self.yaw.last_known
        }
    }

    /// Applies a decoded minimap vision triple: world x/y and yaw in radians.
    pub fn apply_vision(&mut self, x: f64, y: f64, yaw_radians: f64) {
        self.x.set(x.round() as i32);
        self.y.set(y.round() as i32);
        self.yaw.set(yaw_radians.to_degrees().round() as i32);
    }
}

/// An aircraft squadron marker. Unlike ships, planes are removed outright
/// when their squadron despawns; there is no last-known fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plane {
    pub squadron_id: u64,
    pub owner_id: u32,
    pub plane_params_id: GameParamId,
    pub squadron_index: u8,
    pub purpose: SquadronPurpose,
    pub sorties: u8,
    pub relation: Relation,
    pub x: i32,
    pub y: i32,
}

impl Plane {
    pub fn new(squadron_id: u64, id: SquadronId, params_id: GameParamId, relation: Relation) -> Self {
        Self {
            squadron_id,
            owner_id: id.owner_id,
            plane_params_id: params_id,
            squadron_index: id.squadron_index,
            purpose: id.purpose,
            sorties: id.sortie_counter,
            relation,
            x: 0,
            y: 0,
        }
    }

    pub fn set_position(&mut self, x: f32, y: f32) {
        self.x = x.round() as i32;
        self.y = y.round() as i32;
    }
}

/// A timed area-denial marker (fighter patrol). Duration is descriptive: the
/// controller never expires wards on its own, removal is event-driven.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ward {
    pub plane_id: u64,
    pub vehicle_id: EntityId,
    pub relation: Relation,
    pub x: i32,
    pub y: i32,
    pub radius: i32,
    pub duration: i32,
}

/// Zone ownership from the camera owner's viewpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureRelation {
    Ally,
    Enemy,
    Neutral,
}

/// A capture zone at one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub id: usize,
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub inner_radius: f32,
    pub team_id: i64,
    pub relation: CaptureRelation,
    pub both_inside: bool,
    pub has_invaders: bool,
    pub invader_team: i64,
    /// Capture fraction for domination-style zones.
    pub progress_percent: f64,
    /// Remaining raw progress for countdown-style zones, -1 when absent.
    pub progress_total: f64,
}

/// Per-tick ribbon counters for the camera owner, grouped the way the HUD
/// groups them.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RibbonCounts {
    pub torpedo_hit: u32,
    pub ship_aircraft_kill: u32,
    pub plane_aircraft_kill: u32,
    pub crit: u32,
    pub frag: u32,
    pub fire: u32,
    pub flooding: u32,
    pub citadel: u32,
    pub defended: u32,
    pub captured: u32,
    pub assist: u32,
    pub secondary: u32,
    pub spotted: u32,
    pub main: u32,
    pub bomb: u32,
    pub rocket: u32,
}

impl RibbonCounts {
    /// Folds raw per-ribbon-id counters into display counters. Main battery,
    /// rocket, and bomb hits each collapse several ribbon ids.
    pub fn from_counter(counter: &BTreeMap<i64, u32>) -> Self {
        let mut out = RibbonCounts::default();
        for (&ribbon_id, &count) in counter {
            match ribbon_id {
                14 | 15 | 16 | 17 | 28 => out.main += count,
                25 | 26 | 30 | 34 | 35 => out.rocket += count,
                20 | 21 | 23 => out.bomb += count,
                1 => out.torpedo_hit = count,
                3 => out.ship_aircraft_kill = count,
                27 => out.plane_aircraft_kill = count,
                4 => out.crit = count,
                5 => out.frag = count,
                6 => out.fire = count,
                7 => out.flooding = count,
                8 => out.citadel = count,
                9 => out.defended = count,
                10 => out.captured = count,
                11 => out.assist = count,
                13 => out.secondary = count,
                19 => out.spotted = count,
                _ => {}
            }
        }
        out
    }

    /// Non-zero counters as (name, count) pairs, in display order.
    pub fn non_zero(&self) -> Vec<(&'static str, u32)> {
        [
            ("torpedo_hit", self.torpedo_hit),
            ("ship_aircraft_kill", self.ship_aircraft_kill),
            ("plane_aircraft_kill", self.plane_aircraft_kill),
            ("crit", self.crit),
            ("frag", self.frag),
            ("fire", self.fire),
            ("flooding", self.flooding),
            ("citadel", self.citadel),
            ("defended", self.defended),
            ("captured", self.captured),
            ("assist", self.assist),
            ("secondary", self.secondary),
            ("spotted", self.spotted),
            ("main", self.main),
            ("bomb", self.bomb),
            ("rocket", self.rocket),
        ]
        .into_iter()
        .filter(|(_, v)| *v > 0)
        .collect()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchievementRecord {
    pub id: i64,
    pub count: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub ally_score: i64,
    pub enemy_score: i64,
    pub win_score: i64,
}

/// Vision-distance overrides; 0 means no override.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    pub vision_distance_ship: f32,
    pub vision_distance_plane: f32,
}

/// One kill-log entry, attributed at the moment it happened.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Death {
    /// Remaining battle time at the kill, formatted `MM:SS`.
    pub time: String,
    pub killer_name: String,
    pub killer_avatar_id: AccountId,
    pub killer_vehicle_id: EntityId,
    pub killed_name: String,
    pub killed_avatar_id: AccountId,
    pub killed_vehicle_id: EntityId,
    pub death_type: u32,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Remaining battle time when the message was sent.
    pub remaining_time: i64,
    pub clan: String,
    pub clan_color: i64,
    pub name: String,
    pub relation: Relation,
    pub message: String,
    pub audience: String,
}

/// One sealed simulation tick. Immutable once appended to the timeline.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Remaining battle time, formatted `MM:SS`.
    pub time_label: String,
    pub ships: BTreeMap<EntityId, Ship>,
    pub planes: BTreeMap<u64, Plane>,
    pub wards: BTreeMap<u64, Ward>,
    pub captures: Vec<Capture>,
    /// Kill log so far, newest first.
    pub deaths: Vec<Death>,
    pub damage: i64,
    pub damage_potential: i64,
    pub damage_spotting: i64,
    pub ribbons: RibbonCounts,
    pub achievements: Vec<AchievementRecord>,
    pub score: Score,
    pub weather: Weather,
}

impl Default for Ship {
    fn default() -> Self {
        Ship::new(
            AccountId::default(),
            EntityId::default(),
            GameParamId::default(),
            Relation::Ally,
            false,
            0,
        )
    }
}

/// The full reconstructed battle.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReplayModel {
    pub arena_id: i64,
    pub version: Version,
    pub match_info: MatchInfo,
    pub players: BTreeMap<AccountId, Player>,
    pub timeline: Timeline,
    pub chat: Vec<ChatMessage>,
    /// Elapsed seconds (since battle start) of each kill scored by the
    /// camera owner's own vehicle.
    pub owner_kill_times: Vec<f32>,
}

/// `MM:SS` rendering of a non-negative second count.
pub fn format_mmss(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ship() -> Ship {
        Ship::new(
            AccountId(1),
            EntityId(100),
            GameParamId(4000),
            Relation::Enemy,
            false,
            20_000,
        )
    }

    #[test]
    fn fog_of_war_fallback() {
        let mut ship = ship();
        assert!(!ship.is_visible());

        ship.apply_vision(120.0, -340.0, 1.0);
        assert!(ship.is_visible());
        assert_eq!(ship.x(), 120);
        assert_eq!(ship.y(), -340);
        assert_eq!(ship.yaw(), 57);

        // visibility lost: accessors must return the last observed values
        ship.apply_vision(-2500.0, -2500.0, -std::f64::consts::PI);
        assert!(!ship.is_visible());
        assert_eq!(ship.x(), 120);
        assert_eq!(ship.y(), -340);
        assert_eq!(ship.yaw(), 57);

        // reappearing updates both current and last-known
        ship.apply_vision(200.0, 250.0, 0.0);
        assert!(ship.is_visible());
        assert_eq!(ship.x(), 200);
        assert_eq!(ship.yaw(), 0);
    }

    #[test]
    fn yaw_sentinel_only_gates_last_known() {
        let mut ship = ship();
        ship.apply_vision(10.0, 10.0, 1.0);
        // yaw hits its sentinel while the ship stays visible
        ship.apply_vision(10.0, 10.0, (-180.0f64).to_radians());
        assert!(ship.is_visible());
        assert_eq!(ship.yaw(), -180);

        // once hidden, the last non-sentinel yaw wins
        ship.apply_vision(-2500.0, -2500.0, (-180.0f64).to_radians());
        assert_eq!(ship.yaw(), 57);
    }

    #[test]
    fn ribbon_grouping() {
        let mut counter = BTreeMap::new();
        counter.insert(14i64, 3u32); // main battery
        counter.insert(17, 2); // main battery
        counter.insert(25, 4); // rocket
        counter.insert(5, 1); // frag
        counter.insert(999, 7); // unknown id is dropped

        let ribbons = RibbonCounts::from_counter(&counter);
        assert_eq!(ribbons.main, 5);
        assert_eq!(ribbons.rocket, 4);
        assert_eq!(ribbons.frag, 1);

        let non_zero = ribbons.non_zero();
        assert!(non_zero.contains(&("main", 5)));
        assert!(non_zero.contains(&("frag", 1)));
        assert_eq!(non_zero.len(), 3);
    }

    #[test]
    fn mmss_formatting() {
        assert_eq!(format_mmss(0), "00:00");
        assert_eq!(format_mmss(61), "01:01");
        assert_eq!(format_mmss(1199), "19:59");
        assert_eq!(format_mmss(-5), "00:00");
    }

    #[test]
    fn tagged_names() {
        let mut player = Player {
            name: "Nelson".into(),
            ..Player::default()
        };
        assert_eq!(player.tagged_name(), "Nelson");
        player.clan_tag = "FLEET".into();
        assert_eq!(player.tagged_name(), "[FLEET]Nelson");
    }
}
