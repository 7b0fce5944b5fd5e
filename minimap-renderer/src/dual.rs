//! Merging two recordings of the same battle into one fog-of-war-consistent
//! view.
//!
//! The two timelines are driven in lockstep up to the shorter length. Each
//! side publishes the ships it can detect into a shared table keyed by
//! account id; before drawing, each side folds the other side's sightings
//! back in. The enemy-perspective side renders entity layers only, and the
//! two frames are alpha-composited into one output.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;
use image::RgbaImage;
use tracing::debug;

use warships_replays::analyzer::battle_controller::ReplayModel;

use crate::assets::ResourceBundle;
use crate::drawing;
use crate::job::ProgressSink;
use crate::renderer::{RenderEngine, RenderOptions, RenderRole};
use crate::video::VideoEncoder;
use crate::{DUAL_FPS, DUAL_QUALITY, PANEL_HEIGHT, PANEL_WIDTH, RenderError, RenderJobError};

/// What one side knows about a ship at the current tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedFact {
    pub in_range: bool,
    pub health: i64,
}

/// Cross-side visibility/health table, keyed by account id. Both engines
/// hold the same handle; writes from one side are immediately visible to
/// the other within the same tick.
#[derive(Clone, Default, Debug)]
pub struct SharedVision {
    inner: Rc<RefCell<HashMap<u64, SharedFact>>>,
}

impl SharedVision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, account_id: u64, fact: SharedFact) {
        self.inner.borrow_mut().insert(account_id, fact);
    }

    pub fn get(&self, account_id: u64) -> Option<SharedFact> {
        self.inner.borrow().get(&account_id).copied()
    }
}

/// Drives the two per-side engines and composites their frames.
#[derive(Debug)]
pub struct DualMergeEngine {
    side_a: RenderEngine,
    side_b: RenderEngine,
}

impl DualMergeEngine {
    /// Both replays must record the same arena; this is checked before any
    /// frame work begins.
    pub fn new(
        model_a: ReplayModel,
        model_b: ReplayModel,
        bundle_a: ResourceBundle,
        bundle_b: ResourceBundle,
    ) -> Result<Self, RenderJobError> {
        if model_a.arena_id != model_b.arena_id {
            return Err(RenderJobError::ArenaIdMismatch(
                model_a.arena_id,
                model_b.arena_id,
            ));
        }

        let share = SharedVision::new();
        let options = RenderOptions {
            fps: DUAL_FPS,
            quality: DUAL_QUALITY,
            show_logs: false,
            fast_forward: false,
            kill_highlight: false,
        };

        let side_a = RenderEngine::new(
            model_a,
            bundle_a,
            options.clone(),
            RenderRole::DualFriendly,
            Some(share.clone()),
        )?;
        let side_b = RenderEngine::new(
            model_b,
            bundle_b,
            options,
            RenderRole::DualEnemy,
            Some(share),
        )?;

        Ok(Self { side_a, side_b })
    }

    /// Lockstep length: the shorter of the two timelines.
    pub fn total_frames(&self) -> usize {
        self.side_a.total_frames().min(self.side_b.total_frames())
    }

    /// One merged frame: side A first (it publishes its sightings), then
    /// side B composited on top.
    pub fn render_frame(&mut self, index: usize) -> RgbaImage {
        let mut merged = self.side_a.render_frame(index);
        let overlay = self.side_b.render_frame(index);
        drawing::overlay_image(&mut merged, &overlay, 0, 0);
        merged
    }

    pub fn render(&mut self, sink: &dyn ProgressSink) -> Result<Bytes, RenderError> {
        let total = self.total_frames();
        if total == 0 {
            return Err(RenderError::EmptyTimeline);
        }
        debug!(total, "dual merge render starting");

        let mut encoder = VideoEncoder::new(PANEL_WIDTH, PANEL_HEIGHT, DUAL_FPS, DUAL_QUALITY)?;
        for index in 0..total {
            let frame = self.render_frame(index);
            encoder.push_frame(&frame)?;
            sink.progress((index + 1) as f64 / total as f64);
        }
        Ok(encoder.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use warships_replays::analyzer::battle_controller::{
        MatchInfo, Player, Ship, Snapshot, Timeline,
    };
    use warships_replays::types::{AccountId, EntityId, GameParamId, Relation};

    /// A two-player model from one side's perspective. `own_avatar` is this
    /// recording's camera owner; the other player is the opponent.
    fn side_model(arena_id: i64, own_avatar: u64, other_avatar: u64) -> ReplayModel {
        let mut players = BTreeMap::new();
        for (avatar, relation) in [(own_avatar, Relation::Own), (other_avatar, Relation::Enemy)] {
            players.insert(
                AccountId(avatar),
                Player {
                    avatar_id: AccountId(avatar),
                    account_id: AccountId(avatar + 9000),
                    vehicle_id: EntityId(avatar as u32 + 100),
                    ship_params_id: GameParamId(avatar as u32 + 400),
                    name: format!("captain{avatar}"),
                    relation,
                    ..Player::default()
                },
            );
        }

        let mut snapshot = Snapshot::default();
        let mut ships = BTreeMap::new();
        for (avatar, relation) in [(own_avatar, Relation::Own), (other_avatar, Relation::Enemy)] {
            let mut ship = Ship::new(
                AccountId(avatar),
                EntityId(avatar as u32 + 100),
                GameParamId(avatar as u32 + 400),
                relation,
                relation.is_self(),
                10_000,
            );
            ship.apply_vision(0.0, 0.0, 0.0);
            ship.health = 10_000;
            ships.insert(EntityId(avatar as u32 + 100), ship);
        }
        snapshot.ships = ships;

        let mut timeline = Timeline::new();
        timeline.push(1100, snapshot.clone());
        timeline.push(1099, snapshot);

        ReplayModel {
            arena_id,
            match_info: MatchInfo {
                arena_id,
                owner_avatar_id: AccountId(own_avatar),
                owner_vehicle_id: EntityId(own_avatar as u32 + 100),
                owner_team: 0,
                battle_type: 16,
                map_name: "17_NA_fault_line".into(),
                ..MatchInfo::default()
            },
            players,
            timeline,
            ..ReplayModel::default()
        }
    }

    #[test]
    fn mismatched_arena_ids_fail_before_rendering() {
        let err = DualMergeEngine::new(
            side_model(1, 1, 2),
            side_model(2, 2, 1),
            ResourceBundle::fallback(),
            ResourceBundle::fallback(),
        )
        .unwrap_err();
        assert!(matches!(err, RenderJobError::ArenaIdMismatch(1, 2)));
    }

    #[test]
    fn one_sided_detection_is_shared() {
        let share = SharedVision::new();
        let side_a = RenderEngine::new(
            side_model(7, 1, 2),
            ResourceBundle::fallback(),
            RenderOptions::default(),
            RenderRole::DualFriendly,
            Some(share.clone()),
        )
        .unwrap();
        let side_b = RenderEngine::new(
            side_model(7, 2, 1),
            ResourceBundle::fallback(),
            RenderOptions::default(),
            RenderRole::DualEnemy,
            Some(share.clone()),
        )
        .unwrap();

        // player 2's ship as seen from side A (an enemy there): detected,
        // with the health side A observed
        let mut ship_on_a = Ship::new(
            AccountId(2),
            EntityId(102),
            GameParamId(402),
            Relation::Enemy,
            false,
            10_000,
        );
        ship_on_a.apply_vision(10.0, 10.0, 0.0);
        ship_on_a.health = 4_321;

        let (in_range_a, _) = side_a.share_visibility(&ship_on_a, true);
        assert!(in_range_a);
        // account id of player 2 is 9002 on both sides
        assert_eq!(
            share.get(9002),
            Some(SharedFact {
                in_range: true,
                health: 4_321
            })
        );

        // the same ship on side B (its own camera): locally undetected, but
        // side A's sighting carries over, health preferring the fresh value
        let mut ship_on_b = Ship::new(
            AccountId(2),
            EntityId(102),
            GameParamId(402),
            Relation::Own,
            true,
            10_000,
        );
        ship_on_b.apply_vision(10.0, 10.0, 0.0);
        ship_on_b.health = 0;

        let (in_range_b, health_b) = side_b.share_visibility(&ship_on_b, false);
        assert!(in_range_b);
        assert_eq!(health_b, 4_321);
    }

    #[test]
    fn lockstep_stops_at_shorter_timeline() {
        let mut long_side = side_model(5, 1, 2);
        let extra = long_side.timeline.first().unwrap().snapshot.clone();
        long_side.timeline.push(1098, extra);

        let engine = DualMergeEngine::new(
            long_side,
            side_model(5, 2, 1),
            ResourceBundle::fallback(),
            ResourceBundle::fallback(),
        )
        .unwrap();
        assert_eq!(engine.total_frames(), 2);
    }

    #[test]
    fn merged_frame_has_single_canvas_size() {
        let mut engine = DualMergeEngine::new(
            side_model(9, 1, 2),
            side_model(9, 2, 1),
            ResourceBundle::fallback(),
            ResourceBundle::fallback(),
        )
        .unwrap();
        let frame = engine.render_frame(0);
        assert_eq!(frame.dimensions(), (PANEL_WIDTH, PANEL_HEIGHT));
    }
}
