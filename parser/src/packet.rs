//! Packet framing and payload decode.
//!
//! The stream is a sequence of `{ size, kind, clock, payload }` frames.
//! Lifecycle frames create and destroy typed entities; method and property
//! frames are resolved against the entity's declared spec and decoded into
//! the typed [`MethodCall`] / [`PropertyValue`] payloads consumed by the
//! dispatch layer. Anything outside the supported schema decodes to `None`
//! and is skipped by the caller.

use std::collections::BTreeMap;

use kinded::Kinded;
use nom::bytes::complete::take;
use nom::multi::count;
use nom::number::complete::{le_f32, le_i8, le_i32, le_i64, le_u8, le_u16, le_u32, le_u64};
use serde::{Deserialize, Serialize};
use strum_macros::EnumString;
use tracing::warn;

use crate::bitfield::{SquadronId, decode_plane_id};
use crate::types::{AccountId, EntityId, GameClock, GameParamId, Version};
use crate::{Error, IResult, Result};

/// Frame kind codes.
pub const PACKET_BASE_PLAYER_CREATE: u32 = 0x0;
pub const PACKET_ENTITY_LEAVE: u32 = 0x4;
pub const PACKET_ENTITY_CREATE: u32 = 0x5;
pub const PACKET_ENTITY_PROPERTY: u32 = 0x7;
pub const PACKET_ENTITY_METHOD: u32 = 0x8;

/// Entity kinds the decoder resolves packets against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Serialize, Deserialize)]
pub enum EntityKind {
    Avatar,
    Vehicle,
    BattleLogic,
}

/// Declared spec for one entity kind: ordered method and property name
/// tables. Method/property indices on the wire index into these tables.
#[derive(Debug)]
pub struct EntitySpec {
    pub kind: EntityKind,
    pub methods: &'static [&'static str],
    pub properties: &'static [&'static str],
}

static AVATAR_METHODS: &[&str] = &[
    "onArenaStateReceived",
    "onGameRoomStateChanged",
    "onNewPlayerSpawnedInBattle",
    "receiveVehicleDeath",
    "onRibbon",
    "onAchievementEarned",
    "receiveDamageStat",
    "updateMinimapVisionInfo",
    "receive_addMinimapSquadron",
    "receive_updateMinimapSquadron",
    "receive_removeMinimapSquadron",
    "receive_wardAdded",
    "receive_wardRemoved",
    "onChatMessage",
    "onBattleEnd",
];

static AVATAR_PROPERTIES: &[&str] = &["weatherParams"];

static VEHICLE_PROPERTIES: &[&str] = &["health", "maxHealth", "isAlive"];

static BATTLE_LOGIC_PROPERTIES: &[&str] =
    &["timeLeft", "controlPoints", "teamsScore", "teamWinScore"];

static ENTITY_SPECS: &[EntitySpec] = &[
    EntitySpec {
        kind: EntityKind::Avatar,
        methods: AVATAR_METHODS,
        properties: AVATAR_PROPERTIES,
    },
    EntitySpec {
        kind: EntityKind::Vehicle,
        methods: &[],
        properties: VEHICLE_PROPERTIES,
    },
    EntitySpec {
        kind: EntityKind::BattleLogic,
        methods: &[],
        properties: BATTLE_LOGIC_PROPERTIES,
    },
];

static MIN_SUPPORTED: Version = Version {
    major: 0,
    minor: 10,
    patch: 0,
    build: 0,
};

/// Resolves the entity spec tables for a client version. `None` means the
/// version predates the supported packet schema and the replay cannot be
/// decoded.
pub fn entity_specs(version: &Version) -> Option<&'static [EntitySpec]> {
    if version.is_at_least(&MIN_SUPPORTED) {
        Some(ENTITY_SPECS)
    } else {
        None
    }
}

/// A framed packet, payload not yet decoded.
#[derive(Debug)]
pub struct RawPacket<'a> {
    pub kind: u32,
    pub clock: GameClock,
    pub payload: &'a [u8],
}

pub fn parse_raw_packet(i: &[u8]) -> IResult<&[u8], RawPacket<'_>> {
    let (i, size) = le_u32(i)?;
    let (i, kind) = le_u32(i)?;
    let (i, clock) = le_f32(i)?;
    let (i, payload) = take(size as usize)(i)?;
    Ok((
        i,
        RawPacket {
            kind,
            clock: GameClock(clock),
            payload,
        },
    ))
}

#[derive(Debug)]
pub struct EntityCreateBody {
    pub entity_id: EntityId,
    pub spec_index: u16,
}

pub fn parse_entity_create(i: &[u8]) -> IResult<&[u8], EntityCreateBody> {
    let (i, entity_id) = le_u32(i)?;
    let (i, spec_index) = le_u16(i)?;
    Ok((
        i,
        EntityCreateBody {
            entity_id: EntityId(entity_id),
            spec_index,
        },
    ))
}

pub fn parse_entity_id(i: &[u8]) -> IResult<&[u8], EntityId> {
    let (i, entity_id) = le_u32(i)?;
    Ok((i, EntityId(entity_id)))
}

#[derive(Debug)]
pub struct EntityEventBody<'a> {
    pub entity_id: EntityId,
    pub index: u32,
    pub args: &'a [u8],
}

/// Shared body layout for method and property frames:
/// `{ entity_id, table_index, size, args }`.
pub fn parse_entity_event(i: &[u8]) -> IResult<&[u8], EntityEventBody<'_>> {
    let (i, entity_id) = le_u32(i)?;
    let (i, index) = le_u32(i)?;
    let (i, size) = le_u32(i)?;
    let (i, args) = take(size as usize)(i)?;
    Ok((
        i,
        EntityEventBody {
            entity_id: EntityId(entity_id),
            index,
            args,
        },
    ))
}

/// A single decoded RPC argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Int8(i8),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    String(String),
    Blob(Vec<u8>),
}

impl ArgValue {
    pub fn uint_8_ref(&self) -> Option<&u8> {
        match self {
            ArgValue::Uint8(v) => Some(v),
            _ => None,
        }
    }

    pub fn uint_32_ref(&self) -> Option<&u32> {
        match self {
            ArgValue::Uint32(v) => Some(v),
            _ => None,
        }
    }

    pub fn uint_64_ref(&self) -> Option<&u64> {
        match self {
            ArgValue::Uint64(v) => Some(v),
            _ => None,
        }
    }

    pub fn int_8_ref(&self) -> Option<&i8> {
        match self {
            ArgValue::Int8(v) => Some(v),
            _ => None,
        }
    }

    pub fn int_32_ref(&self) -> Option<&i32> {
        match self {
            ArgValue::Int32(v) => Some(v),
            _ => None,
        }
    }

    pub fn int_64_ref(&self) -> Option<&i64> {
        match self {
            ArgValue::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn float_32_ref(&self) -> Option<&f32> {
        match self {
            ArgValue::Float32(v) => Some(v),
            _ => None,
        }
    }

    pub fn string_ref(&self) -> Option<&String> {
        match self {
            ArgValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn blob_ref(&self) -> Option<&Vec<u8>> {
        match self {
            ArgValue::Blob(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ArgType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int32,
    Int64,
    Float32,
    String,
    Blob,
}

/// Length-prefixed string/blob: one byte, with 0xFF escaping to a u16 length
/// plus a pad byte.
fn parse_len(i: &[u8]) -> IResult<&[u8], usize> {
    let (i, short) = le_u8(i)?;
    if short != 0xFF {
        return Ok((i, short as usize));
    }
    let (i, long) = le_u16(i)?;
    let (i, _pad) = le_u8(i)?;
    Ok((i, long as usize))
}

fn parse_blob(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (i, len) = parse_len(i)?;
    let (i, data) = take(len)(i)?;
    Ok((i, data.to_vec()))
}

fn parse_arg(i: &[u8], ty: ArgType) -> IResult<&[u8], ArgValue> {
    match ty {
        ArgType::Uint8 => le_u8(i).map(|(i, v)| (i, ArgValue::Uint8(v))),
        ArgType::Uint16 => le_u16(i).map(|(i, v)| (i, ArgValue::Uint16(v))),
        ArgType::Uint32 => le_u32(i).map(|(i, v)| (i, ArgValue::Uint32(v))),
        ArgType::Uint64 => le_u64(i).map(|(i, v)| (i, ArgValue::Uint64(v))),
        ArgType::Int8 => le_i8(i).map(|(i, v)| (i, ArgValue::Int8(v))),
        ArgType::Int32 => le_i32(i).map(|(i, v)| (i, ArgValue::Int32(v))),
        ArgType::Int64 => le_i64(i).map(|(i, v)| (i, ArgValue::Int64(v))),
        ArgType::Float32 => le_f32(i).map(|(i, v)| (i, ArgValue::Float32(v))),
        ArgType::String => {
            let (i, data) = parse_blob(i)?;
            Ok((i, ArgValue::String(String::from_utf8_lossy(&data).into_owned())))
        }
        ArgType::Blob => parse_blob(i).map(|(i, v)| (i, ArgValue::Blob(v))),
    }
}

fn parse_args<'a>(mut i: &'a [u8], signature: &[ArgType]) -> IResult<&'a [u8], Vec<ArgValue>> {
    let mut out = Vec::with_capacity(signature.len());
    for ty in signature {
        let (rest, value) = parse_arg(i, *ty)?;
        out.push(value);
        i = rest;
    }
    Ok((i, out))
}

/// One entry of a minimap vision diff: which vehicle, and the packed
/// (x, y, yaw) word.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MinimapDiff {
    pub vehicle_id: EntityId,
    pub packed: u32,
}

fn parse_minimap_diffs(i: &[u8]) -> IResult<&[u8], Vec<MinimapDiff>> {
    let (i, n) = le_u8(i)?;
    count(
        |i| {
            let (i, vehicle_id) = le_u32(i)?;
            let (i, packed) = le_u32(i)?;
            Ok((
                i,
                MinimapDiff {
                    vehicle_id: EntityId(vehicle_id),
                    packed,
                },
            ))
        },
        n as usize,
    )(i)
}

/// One accumulated damage statistic: (damage type, category) with hit count
/// and total damage.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DamageStatEntry {
    pub damage_type: i64,
    pub category: i64,
    pub hits: f64,
    pub damage: f64,
}

/// Damage stat categories, matching the client's constants.
pub const DAMAGE_STATS_ENEMY: i64 = 0;
pub const DAMAGE_STATS_ALLY: i64 = 1;
pub const DAMAGE_STATS_SPOT: i64 = 2;
pub const DAMAGE_STATS_AGRO: i64 = 3;

/// Per-player roster entry decoded from a pickled player-state blob.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PlayerState {
    pub avatar_id: AccountId,
    pub account_db_id: AccountId,
    pub vehicle_id: EntityId,
    pub ship_params_id: GameParamId,
    pub realm: String,
    pub is_bot: bool,
    pub name: String,
    pub clan_tag: String,
    pub clan_color: i64,
    pub team_id: i64,
    pub max_health: i64,
}

/// A decoded entity method call.
#[derive(Debug, Clone, Kinded)]
#[kinded(derive(Hash))]
pub enum MethodCall {
    OnArenaStateReceived {
        arena_id: i64,
        team_build_type_id: i64,
        players_states: Vec<PlayerState>,
    },
    OnGameRoomStateChanged {
        players_data: Vec<PlayerState>,
    },
    OnNewPlayerSpawnedInBattle {
        players_states: Vec<PlayerState>,
    },
    ReceiveVehicleDeath {
        killed_vehicle_id: EntityId,
        fragger_vehicle_id: EntityId,
        death_type: u32,
    },
    OnRibbon {
        ribbon_id: i64,
    },
    OnAchievementEarned {
        avatar_id: AccountId,
        achievement_id: i64,
    },
    ReceiveDamageStat {
        stats: Vec<DamageStatEntry>,
    },
    UpdateMinimapVisionInfo {
        ships: Vec<MinimapDiff>,
        buildings: Vec<MinimapDiff>,
    },
    AddSquadron {
        squadron: SquadronId,
        squadron_id: u64,
        team_id: i64,
        params_id: GameParamId,
        x: f32,
        y: f32,
    },
    UpdateSquadron {
        squadron_id: u64,
        x: f32,
        y: f32,
    },
    RemoveSquadron {
        squadron_id: u64,
    },
    WardAdded {
        plane_id: u64,
        x: f32,
        y: f32,
        radius: f32,
        duration: f32,
        team_id: i64,
        vehicle_id: EntityId,
    },
    WardRemoved {
        plane_id: u64,
    },
    OnChatMessage {
        sender_id: i64,
        audience: String,
        message: String,
    },
    OnBattleEnd {
        winning_team: i64,
        victory_type: i64,
    },
}

/// State of one capture zone as exposed by the battle-logic entity.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ControlPointState {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub inner_radius: f32,
    pub team_id: i64,
    pub invader_team: i64,
    pub has_invaders: bool,
    pub both_inside: bool,
    /// Domination-style capture fraction in [0, 1].
    pub progress: f64,
    /// Remaining raw progress for countdown-style modes, -1 when absent.
    pub progress_total: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TeamScoreEntry {
    pub team_id: i64,
    pub score: i64,
}

/// A decoded entity property change.
#[derive(Debug, Clone, Kinded)]
#[kinded(derive(Hash))]
pub enum PropertyValue {
    Health(f32),
    MaxHealth(f32),
    IsAlive(bool),
    WeatherParams {
        ship_vision_distance: f32,
        plane_vision_distance: f32,
    },
    TimeLeft(i64),
    ControlPoints(Vec<ControlPointState>),
    TeamsScore(Vec<TeamScoreEntry>),
    TeamWinScore(i64),
}

fn corrupt_args(name: &str) -> Error {
    Error::corrupt(format!("malformed arguments for {name}"))
}

fn parse_arena_state(i: &[u8]) -> IResult<&[u8], (i64, i64, Vec<u8>)> {
    let (i, arena_id) = le_i64(i)?;
    let (i, team_build_type_id) = le_i64(i)?;
    let (i, blob) = parse_blob(i)?;
    Ok((i, (arena_id, team_build_type_id, blob)))
}

fn parse_vision_args(i: &[u8]) -> IResult<&[u8], (Vec<MinimapDiff>, Vec<MinimapDiff>)> {
    let (i, ships) = parse_minimap_diffs(i)?;
    let (i, buildings) = parse_minimap_diffs(i)?;
    Ok((i, (ships, buildings)))
}

fn finish<T>(name: &str, parsed: IResult<&[u8], T>) -> Result<T> {
    match parsed {
        Ok((_, v)) => Ok(v),
        Err(_) => Err(corrupt_args(name)),
    }
}

/// Decodes a method call against the declared schema. `Ok(None)` means the
/// method is known but carries nothing the battle model consumes.
pub fn decode_method_call(
    kind: EntityKind,
    name: &str,
    args: &[u8],
    version: &Version,
) -> Result<Option<MethodCall>> {
    if kind != EntityKind::Avatar {
        return Ok(None);
    }

    let call = match name {
        "onArenaStateReceived" => {
            let (arena_id, team_build_type_id, blob) = finish(name, parse_arena_state(args))?;
            MethodCall::OnArenaStateReceived {
                arena_id,
                team_build_type_id,
                players_states: parse_player_states(&blob, version)?,
            }
        }
        "onGameRoomStateChanged" => {
            let blob = finish(name, parse_blob(args))?;
            MethodCall::OnGameRoomStateChanged {
                players_data: parse_player_states(&blob, version)?,
            }
        }
        "onNewPlayerSpawnedInBattle" => {
            let blob = finish(name, parse_blob(args))?;
            MethodCall::OnNewPlayerSpawnedInBattle {
                players_states: parse_player_states(&blob, version)?,
            }
        }
        "receiveVehicleDeath" => {
            let values = finish(
                name,
                parse_args(args, &[ArgType::Uint32, ArgType::Uint32, ArgType::Uint32]),
            )?;
            MethodCall::ReceiveVehicleDeath {
                killed_vehicle_id: EntityId(*values[0].uint_32_ref().ok_or_else(|| corrupt_args(name))?),
                fragger_vehicle_id: EntityId(*values[1].uint_32_ref().ok_or_else(|| corrupt_args(name))?),
                death_type: *values[2].uint_32_ref().ok_or_else(|| corrupt_args(name))?,
            }
        }
        "onRibbon" => {
            let values = finish(name, parse_args(args, &[ArgType::Int32]))?;
            MethodCall::OnRibbon {
                ribbon_id: *values[0].int_32_ref().ok_or_else(|| corrupt_args(name))? as i64,
            }
        }
        "onAchievementEarned" => {
            let values = finish(name, parse_args(args, &[ArgType::Uint32, ArgType::Uint32]))?;
            MethodCall::OnAchievementEarned {
                avatar_id: AccountId::from(*values[0].uint_32_ref().ok_or_else(|| corrupt_args(name))?),
                achievement_id: *values[1].uint_32_ref().ok_or_else(|| corrupt_args(name))? as i64,
            }
        }
        "receiveDamageStat" => {
            let blob = finish(name, parse_blob(args))?;
            MethodCall::ReceiveDamageStat {
                stats: parse_damage_stats(&blob)?,
            }
        }
        "updateMinimapVisionInfo" => {
            let (ships, buildings) = finish(name, parse_vision_args(args))?;
            MethodCall::UpdateMinimapVisionInfo { ships, buildings }
        }
        "receive_addMinimapSquadron" => {
            let values = finish(
                name,
                parse_args(
                    args,
                    &[
                        ArgType::Uint64,
                        ArgType::Int8,
                        ArgType::Uint32,
                        ArgType::Float32,
                        ArgType::Float32,
                    ],
                ),
            )?;
            let squadron_id = *values[0].uint_64_ref().ok_or_else(|| corrupt_args(name))?;
            MethodCall::AddSquadron {
                squadron: decode_plane_id(squadron_id),
                squadron_id,
                team_id: *values[1].int_8_ref().ok_or_else(|| corrupt_args(name))? as i64,
                params_id: GameParamId(*values[2].uint_32_ref().ok_or_else(|| corrupt_args(name))?),
                x: *values[3].float_32_ref().ok_or_else(|| corrupt_args(name))?,
                y: *values[4].float_32_ref().ok_or_else(|| corrupt_args(name))?,
            }
        }
        "receive_updateMinimapSquadron" => {
            let values = finish(
                name,
                parse_args(args, &[ArgType::Uint64, ArgType::Float32, ArgType::Float32]),
            )?;
            MethodCall::UpdateSquadron {
                squadron_id: *values[0].uint_64_ref().ok_or_else(|| corrupt_args(name))?,
                x: *values[1].float_32_ref().ok_or_else(|| corrupt_args(name))?,
                y: *values[2].float_32_ref().ok_or_else(|| corrupt_args(name))?,
            }
        }
        "receive_removeMinimapSquadron" => {
            let values = finish(name, parse_args(args, &[ArgType::Uint64]))?;
            MethodCall::RemoveSquadron {
                squadron_id: *values[0].uint_64_ref().ok_or_else(|| corrupt_args(name))?,
            }
        }
        "receive_wardAdded" => {
            let values = finish(
                name,
                parse_args(
                    args,
                    &[
                        ArgType::Uint64,
                        ArgType::Float32,
                        ArgType::Float32,
                        ArgType::Float32,
                        ArgType::Float32,
                        ArgType::Float32,
                        ArgType::Int8,
                        ArgType::Uint32,
                    ],
                ),
            )?;
            // Position on the wire is a 3-vector; the height component is
            // meaningless on the minimap.
            MethodCall::WardAdded {
                plane_id: *values[0].uint_64_ref().ok_or_else(|| corrupt_args(name))?,
                x: *values[1].float_32_ref().ok_or_else(|| corrupt_args(name))?,
                y: *values[3].float_32_ref().ok_or_else(|| corrupt_args(name))?,
                radius: *values[4].float_32_ref().ok_or_else(|| corrupt_args(name))?,
                duration: *values[5].float_32_ref().ok_or_else(|| corrupt_args(name))?,
                team_id: *values[6].int_8_ref().ok_or_else(|| corrupt_args(name))? as i64,
                vehicle_id: EntityId(*values[7].uint_32_ref().ok_or_else(|| corrupt_args(name))?),
            }
        }
        "receive_wardRemoved" => {
            let values = finish(name, parse_args(args, &[ArgType::Uint64]))?;
            MethodCall::WardRemoved {
                plane_id: *values[0].uint_64_ref().ok_or_else(|| corrupt_args(name))?,
            }
        }
        "onChatMessage" => {
            let values = finish(
                name,
                parse_args(args, &[ArgType::Int64, ArgType::String, ArgType::String]),
            )?;
            MethodCall::OnChatMessage {
                sender_id: *values[0].int_64_ref().ok_or_else(|| corrupt_args(name))?,
                audience: values[1].string_ref().ok_or_else(|| corrupt_args(name))?.clone(),
                message: values[2].string_ref().ok_or_else(|| corrupt_args(name))?.clone(),
            }
        }
        "onBattleEnd" => {
            let values = finish(name, parse_args(args, &[ArgType::Int8, ArgType::Uint8]))?;
            MethodCall::OnBattleEnd {
                winning_team: *values[0].int_8_ref().ok_or_else(|| corrupt_args(name))? as i64,
                victory_type: *values[1].uint_8_ref().ok_or_else(|| corrupt_args(name))? as i64,
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(call))
}

fn parse_control_points(i: &[u8]) -> IResult<&[u8], Vec<ControlPointState>> {
    let (i, n) = le_u8(i)?;
    count(
        |i| {
            let (i, x) = le_f32(i)?;
            let (i, y) = le_f32(i)?;
            let (i, radius) = le_f32(i)?;
            let (i, inner_radius) = le_f32(i)?;
            let (i, team_id) = le_i8(i)?;
            let (i, invader_team) = le_i8(i)?;
            let (i, has_invaders) = le_u8(i)?;
            let (i, both_inside) = le_u8(i)?;
            let (i, progress) = le_f32(i)?;
            let (i, progress_total) = le_f32(i)?;
            Ok((
                i,
                ControlPointState {
                    x,
                    y,
                    radius,
                    inner_radius,
                    team_id: team_id as i64,
                    invader_team: invader_team as i64,
                    has_invaders: has_invaders != 0,
                    both_inside: both_inside != 0,
                    progress: progress as f64,
                    progress_total: progress_total as f64,
                },
            ))
        },
        n as usize,
    )(i)
}

fn parse_team_scores(i: &[u8]) -> IResult<&[u8], Vec<TeamScoreEntry>> {
    let (i, n) = le_u8(i)?;
    count(
        |i| {
            let (i, team_id) = le_i8(i)?;
            let (i, score) = le_i32(i)?;
            Ok((
                i,
                TeamScoreEntry {
                    team_id: team_id as i64,
                    score: score as i64,
                },
            ))
        },
        n as usize,
    )(i)
}

/// Decodes a property change against the declared schema. `Ok(None)` means
/// the property is outside the supported set.
pub fn decode_property(kind: EntityKind, name: &str, args: &[u8]) -> Result<Option<PropertyValue>> {
    let value = match (kind, name) {
        (EntityKind::Vehicle, "health") => {
            let values = finish(name, parse_args(args, &[ArgType::Float32]))?;
            PropertyValue::Health(*values[0].float_32_ref().ok_or_else(|| corrupt_args(name))?)
        }
        (EntityKind::Vehicle, "maxHealth") => {
            let values = finish(name, parse_args(args, &[ArgType::Float32]))?;
            PropertyValue::MaxHealth(*values[0].float_32_ref().ok_or_else(|| corrupt_args(name))?)
        }
        (EntityKind::Vehicle, "isAlive") => {
            let values = finish(name, parse_args(args, &[ArgType::Uint8]))?;
            PropertyValue::IsAlive(*values[0].uint_8_ref().ok_or_else(|| corrupt_args(name))? != 0)
        }
        (EntityKind::Avatar, "weatherParams") => {
            let values = finish(name, parse_args(args, &[ArgType::Float32, ArgType::Float32]))?;
            PropertyValue::WeatherParams {
                ship_vision_distance: *values[0].float_32_ref().ok_or_else(|| corrupt_args(name))?,
                plane_vision_distance: *values[1].float_32_ref().ok_or_else(|| corrupt_args(name))?,
            }
        }
        (EntityKind::BattleLogic, "timeLeft") => {
            let values = finish(name, parse_args(args, &[ArgType::Int32]))?;
            PropertyValue::TimeLeft(*values[0].int_32_ref().ok_or_else(|| corrupt_args(name))? as i64)
        }
        (EntityKind::BattleLogic, "controlPoints") => {
            PropertyValue::ControlPoints(finish(name, parse_control_points(args))?)
        }
        (EntityKind::BattleLogic, "teamsScore") => {
            PropertyValue::TeamsScore(finish(name, parse_team_scores(args))?)
        }
        (EntityKind::BattleLogic, "teamWinScore") => {
            let values = finish(name, parse_args(args, &[ArgType::Int32]))?;
            PropertyValue::TeamWinScore(*values[0].int_32_ref().ok_or_else(|| corrupt_args(name))? as i64)
        }
        _ => return Ok(None),
    };

    Ok(Some(value))
}

// Roster blobs are Python pickle documents: a list of per-player dicts. On
// newer clients the dict keys are small integers indexing a fixed field
// table; the table layout changed across client versions.

struct RosterKeys {
    account_db_id: i64,
    avatar_id: i64,
    clan_color: i64,
    clan_tag: i64,
    is_bot: i64,
    max_health: i64,
    name: i64,
    realm: i64,
    ship_id: i64,
    ship_params_id: i64,
    team_id: i64,
}

fn roster_keys(version: &Version) -> RosterKeys {
    if version.is_at_least(&Version::from_client_exe("0,12,8,0")) {
        RosterKeys {
            account_db_id: 0,
            avatar_id: 2,
            clan_color: 4,
            clan_tag: 6,
            is_bot: 15,
            max_health: 24,
            name: 25,
            realm: 30,
            ship_id: 33,
            ship_params_id: 34,
            team_id: 36,
        }
    } else if version.is_at_least(&Version::from_client_exe("0,10,9,0")) {
        // 0.10.9 inserted fields at 0x1 and 0x1F
        RosterKeys {
            account_db_id: 0,
            avatar_id: 0x2,
            clan_color: 0x5,
            clan_tag: 0x6,
            is_bot: 0xF,
            max_health: 0x17,
            name: 0x18,
            realm: 0x1E,
            ship_id: 0x20,
            ship_params_id: 0x21,
            team_id: 0x23,
        }
    } else {
        // 0.10.0 .. 0.10.8
        RosterKeys {
            account_db_id: 0,
            avatar_id: 0x1,
            clan_color: 0x4,
            clan_tag: 0x5,
            is_bot: 0xE,
            max_health: 0x16,
            name: 0x17,
            realm: 0x1D,
            ship_id: 0x1E,
            ship_params_id: 0x1F,
            team_id: 0x21,
        }
    }
}

fn dict_value<'a>(
    dict: &'a BTreeMap<pickled::HashableValue, pickled::Value>,
    key: i64,
) -> Option<&'a pickled::Value> {
    dict.get(&pickled::HashableValue::I64(key))
}

fn value_i64(value: Option<&pickled::Value>) -> Option<i64> {
    match value? {
        pickled::Value::I64(v) => Some(*v),
        pickled::Value::Bool(v) => Some(*v as i64),
        pickled::Value::F64(v) => Some(*v as i64),
        _ => None,
    }
}

fn value_string(value: Option<&pickled::Value>) -> Option<String> {
    match value? {
        pickled::Value::String(s) => Some(s.clone()),
        pickled::Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        _ => None,
    }
}

/// Decodes a pickled roster blob into player states. Entries that do not
/// look like player dicts are skipped with a warning rather than failing
/// the packet.
pub fn parse_player_states(blob: &[u8], version: &Version) -> Result<Vec<PlayerState>> {
    let value = pickled::value_from_slice(blob, pickled::DeOptions::new())
        .map_err(|e| Error::corrupt(format!("roster pickle: {e}")))?;

    let entries = match value {
        pickled::Value::List(entries) => entries,
        pickled::Value::Tuple(entries) => entries,
        other => {
            return Err(Error::corrupt(format!(
                "roster pickle has unexpected shape: {other:?}"
            )));
        }
    };

    let keys = roster_keys(version);
    let mut players = Vec::with_capacity(entries.len());
    for entry in &entries {
        let dict = match entry {
            pickled::Value::Dict(dict) => dict,
            other => {
                warn!("skipping non-dict roster entry: {other:?}");
                continue;
            }
        };

        let Some(avatar_id) = value_i64(dict_value(dict, keys.avatar_id)) else {
            warn!("roster entry without avatar id");
            continue;
        };

        players.push(PlayerState {
            avatar_id: AccountId::from(avatar_id),
            account_db_id: AccountId::from(
                value_i64(dict_value(dict, keys.account_db_id)).unwrap_or(0),
            ),
            vehicle_id: EntityId::from(value_i64(dict_value(dict, keys.ship_id)).unwrap_or(0)),
            ship_params_id: GameParamId::from(
                value_i64(dict_value(dict, keys.ship_params_id)).unwrap_or(0),
            ),
            realm: value_string(dict_value(dict, keys.realm)).unwrap_or_default(),
            is_bot: value_i64(dict_value(dict, keys.is_bot)).unwrap_or(0) != 0,
            name: value_string(dict_value(dict, keys.name)).unwrap_or_default(),
            clan_tag: value_string(dict_value(dict, keys.clan_tag)).unwrap_or_default(),
            clan_color: value_i64(dict_value(dict, keys.clan_color)).unwrap_or(0),
            team_id: value_i64(dict_value(dict, keys.team_id)).unwrap_or(0),
            max_health: value_i64(dict_value(dict, keys.max_health)).unwrap_or(0),
        });
    }

    Ok(players)
}

/// Decodes a pickled damage-stat blob: a dict keyed by (type, category)
/// tuples with (hits, damage) values.
pub fn parse_damage_stats(blob: &[u8]) -> Result<Vec<DamageStatEntry>> {
    let value = pickled::value_from_slice(blob, pickled::DeOptions::new())
        .map_err(|e| Error::corrupt(format!("damage stat pickle: {e}")))?;

    let dict = match value {
        pickled::Value::Dict(dict) => dict,
        other => {
            return Err(Error::corrupt(format!(
                "damage stats have unexpected shape: {other:?}"
            )));
        }
    };

    let mut stats = Vec::with_capacity(dict.len());
    for (key, value) in &dict {
        let pickled::HashableValue::Tuple(key_parts) = key else {
            continue;
        };
        if key_parts.len() != 2 {
            continue;
        }
        let (pickled::HashableValue::I64(damage_type), pickled::HashableValue::I64(category)) =
            (&key_parts[0], &key_parts[1])
        else {
            continue;
        };

        let parts: Vec<f64> = match value {
            pickled::Value::List(items) | pickled::Value::Tuple(items) => items
                .iter()
                .filter_map(|item| match item {
                    pickled::Value::I64(v) => Some(*v as f64),
                    pickled::Value::F64(v) => Some(*v),
                    _ => None,
                })
                .collect(),
            _ => continue,
        };
        if parts.len() != 2 {
            continue;
        }

        stats.push(DamageStatEntry {
            damage_type: *damage_type,
            category: *category,
            hits: parts[0],
            damage: parts[1],
        });
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_packet_framing() {
        let mut data = Vec::new();
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&PACKET_ENTITY_LEAVE.to_le_bytes());
        data.extend_from_slice(&12.5f32.to_le_bytes());
        data.extend_from_slice(&77u32.to_le_bytes());
        // trailing bytes belong to the next frame
        data.extend_from_slice(&[0xAA]);

        let (rest, packet) = parse_raw_packet(&data).unwrap();
        assert_eq!(packet.kind, PACKET_ENTITY_LEAVE);
        assert_eq!(packet.clock.seconds(), 12.5);
        assert_eq!(packet.payload, &77u32.to_le_bytes());
        assert_eq!(rest, &[0xAA]);
    }

    #[test]
    fn long_form_blob_length() {
        let mut data = vec![0xFF];
        data.extend_from_slice(&300u16.to_le_bytes());
        data.push(0x00);
        data.extend(std::iter::repeat(0x42u8).take(300));

        let (rest, blob) = parse_blob(&data).unwrap();
        assert!(rest.is_empty());
        assert_eq!(blob.len(), 300);
    }

    #[test]
    fn minimap_vision_args_decode() {
        let mut args = Vec::new();
        args.push(2u8);
        args.extend_from_slice(&100u32.to_le_bytes());
        args.extend_from_slice(&0x1234u32.to_le_bytes());
        args.extend_from_slice(&101u32.to_le_bytes());
        args.extend_from_slice(&0x5678u32.to_le_bytes());
        args.push(0u8);

        let call = decode_method_call(
            EntityKind::Avatar,
            "updateMinimapVisionInfo",
            &args,
            &Version::from_client_exe("0,12,8,0"),
        )
        .unwrap()
        .unwrap();

        let MethodCall::UpdateMinimapVisionInfo { ships, buildings } = call else {
            panic!("wrong payload decoded");
        };
        assert_eq!(ships.len(), 2);
        assert!(buildings.is_empty());
        assert_eq!(ships[0].vehicle_id, EntityId(100));
        assert_eq!(ships[1].packed, 0x5678);
    }

    #[test]
    fn unknown_method_is_skipped() {
        let decoded = decode_method_call(
            EntityKind::Vehicle,
            "onArenaStateReceived",
            &[],
            &Version::from_client_exe("0,12,8,0"),
        )
        .unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn property_decode() {
        let value = decode_property(EntityKind::Vehicle, "health", &512.0f32.to_le_bytes())
            .unwrap()
            .unwrap();
        let PropertyValue::Health(health) = value else {
            panic!("wrong property decoded");
        };
        assert_eq!(health, 512.0);

        assert!(
            decode_property(EntityKind::Avatar, "health", &512.0f32.to_le_bytes())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn specs_gate_on_version() {
        assert!(entity_specs(&Version::from_client_exe("0,10,9,0")).is_some());
        assert!(entity_specs(&Version::from_client_exe("0,9,9,1")).is_none());
    }

    #[test]
    fn roster_pickle_decode() {
        use pickled::{HashableValue, SerOptions, Value};

        // 0.12.8+ key table: avatarId=2, name=25, shipId=33, teamId=36
        let mut dict = BTreeMap::new();
        dict.insert(HashableValue::I64(0), Value::I64(1_000_077));
        dict.insert(HashableValue::I64(2), Value::I64(77));
        dict.insert(HashableValue::I64(6), Value::String("FLEET".into()));
        dict.insert(HashableValue::I64(25), Value::String("Captain".into()));
        dict.insert(HashableValue::I64(33), Value::I64(501));
        dict.insert(HashableValue::I64(36), Value::I64(1));
        let blob = pickled::value_to_vec(
            &Value::List(vec![Value::Dict(dict), Value::I64(9)]),
            SerOptions::new(),
        )
        .unwrap();

        let players =
            parse_player_states(&blob, &Version::from_client_exe("0,12,8,0")).unwrap();
        // the stray non-dict entry is skipped, the real one decoded
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].avatar_id, AccountId(77));
        assert_eq!(players[0].account_db_id, AccountId(1_000_077));
        assert_eq!(players[0].name, "Captain");
        assert_eq!(players[0].clan_tag, "FLEET");
        assert_eq!(players[0].vehicle_id, EntityId(501));
        assert_eq!(players[0].team_id, 1);
    }

    #[test]
    fn damage_stat_pickle_decode() {
        use pickled::{HashableValue, SerOptions, Value};

        let mut dict = BTreeMap::new();
        dict.insert(
            HashableValue::Tuple(vec![HashableValue::I64(0), HashableValue::I64(0)]),
            Value::Tuple(vec![Value::I64(12), Value::F64(15_432.4)]),
        );
        let blob =
            pickled::value_to_vec(&Value::Dict(dict), SerOptions::new()).unwrap();

        let stats = parse_damage_stats(&blob).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].damage_type, 0);
        assert_eq!(stats[0].category, DAMAGE_STATS_ENEMY);
        assert!((stats[0].damage - 15_432.4).abs() < 1e-9);
    }
}
