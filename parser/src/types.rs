use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-replay-session entity identifier for game objects (avatars, vehicles,
/// the battle-logic singleton). The wire format is u32 but some packet types
/// use i32 or i64.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u32);

impl EntityId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for EntityId {
    fn from(v: u32) -> Self {
        EntityId(v)
    }
}

impl From<i32> for EntityId {
    fn from(v: i32) -> Self {
        EntityId(v as u32)
    }
}

impl From<i64> for EntityId {
    fn from(v: i64) -> Self {
        EntityId(v as u32)
    }
}

/// A persistent player account identifier (avatar id, account db id).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl AccountId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for AccountId {
    fn from(v: u32) -> Self {
        AccountId(v as u64)
    }
}

impl From<i32> for AccountId {
    fn from(v: i32) -> Self {
        AccountId(v as u64)
    }
}

impl From<i64> for AccountId {
    fn from(v: i64) -> Self {
        AccountId(v as u64)
    }
}

/// A game parameter type identifier (ships, planes, equipment).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameParamId(pub u32);

impl GameParamId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for GameParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for GameParamId {
    fn from(v: u32) -> Self {
        GameParamId(v)
    }
}

impl From<u64> for GameParamId {
    fn from(v: u64) -> Self {
        GameParamId(v as u32)
    }
}

impl From<i64> for GameParamId {
    fn from(v: i64) -> Self {
        GameParamId(v as u32)
    }
}

/// A game clock value in seconds since the replay started recording.
#[derive(Debug, Default, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct GameClock(pub f32);

impl GameClock {
    pub fn seconds(self) -> f32 {
        self.0
    }
}

impl fmt::Display for GameClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}s", self.0)
    }
}

impl std::ops::Sub for GameClock {
    type Output = f32;
    fn sub(self, rhs: GameClock) -> f32 {
        self.0 - rhs.0
    }
}

/// Viewpoint-relative classification of an entity: the recording player
/// themselves, a teammate, or an opponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relation {
    Own,
    Ally,
    Enemy,
}

impl Relation {
    /// Wire encoding: -1 self, 0 ally, 1 enemy.
    pub fn new(raw: i64) -> Self {
        match raw {
            -1 => Relation::Own,
            0 => Relation::Ally,
            _ => Relation::Enemy,
        }
    }

    pub fn from_teams(team_id: i64, owner_team: i64, is_owner: bool) -> Self {
        if is_owner {
            Relation::Own
        } else if team_id == owner_team {
            Relation::Ally
        } else {
            Relation::Enemy
        }
    }

    pub fn raw(self) -> i64 {
        match self {
            Relation::Own => -1,
            Relation::Ally => 0,
            Relation::Enemy => 1,
        }
    }

    pub fn is_self(self) -> bool {
        self == Relation::Own
    }

    pub fn is_ally(self) -> bool {
        self == Relation::Ally
    }

    pub fn is_enemy(self) -> bool {
        self == Relation::Enemy
    }
}

impl Default for Relation {
    fn default() -> Self {
        Relation::Ally
    }
}

/// Client version parsed from the `clientVersionFromExe` metadata field,
/// e.g. `"0,10,9,0"`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl Version {
    pub fn from_client_exe(raw: &str) -> Self {
        let mut parts = raw
            .split(&[',', '.'][..])
            .map(|p| p.trim().parse::<u32>().unwrap_or(0));
        Version {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
            build: parts.next().unwrap_or(0),
        }
    }

    pub fn is_at_least(&self, other: &Version) -> bool {
        (self.major, self.minor, self.patch, self.build)
            >= (other.major, other.minor, other.patch, other.build)
    }

    /// Three-component directory name used to select a resource bundle,
    /// e.g. `0_10_9`.
    pub fn bundle_dir(&self) -> String {
        format!("{}_{}_{}", self.major, self.minor, self.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Battle-type codes the render pipeline understands.
pub const SUPPORTED_BATTLE_TYPES: [i32; 5] = [7, 11, 14, 15, 16];

/// Battle types whose capture zones use the resizable disc + diamond style
/// and percent-based progress.
pub const DOMINATION_BATTLE_TYPES: [i32; 3] = [7, 11, 15];

/// The "arena" special battle type: no score bar and no capture overlay.
pub const BATTLE_TYPE_ARENA: i32 = 14;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_from_client_exe() {
        let v = Version::from_client_exe("0,10,9,0");
        assert_eq!(
            v,
            Version {
                major: 0,
                minor: 10,
                patch: 9,
                build: 0
            }
        );
        assert_eq!(v.bundle_dir(), "0_10_9");
        assert_eq!(v.to_string(), "0.10.9");
    }

    #[test]
    fn version_ordering() {
        let old = Version::from_client_exe("0,10,7,0");
        let new = Version::from_client_exe("0,12,8,0");
        assert!(new.is_at_least(&old));
        assert!(!old.is_at_least(&new));
        assert!(new.is_at_least(&new));
    }

    #[test]
    fn relation_wire_roundtrip() {
        assert_eq!(Relation::new(-1), Relation::Own);
        assert_eq!(Relation::new(0), Relation::Ally);
        assert_eq!(Relation::new(1), Relation::Enemy);
        assert_eq!(Relation::Own.raw(), -1);
        assert!(Relation::Own.is_self());
        assert!(!Relation::Enemy.is_ally());
    }

    #[test]
    fn relation_from_teams() {
        assert_eq!(Relation::from_teams(0, 0, true), Relation::Own);
        assert_eq!(Relation::from_teams(0, 0, false), Relation::Ally);
        assert_eq!(Relation::from_teams(1, 0, false), Relation::Enemy);
    }
}
