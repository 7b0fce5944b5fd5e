//! Frame composition: folds one snapshot at a time into a composited RGBA
//! frame via per-layer generators, then streams frames into the video
//! encoder.

use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;
use convert_case::{Case, Casing};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use tracing::{debug, warn};

use warships_replays::analyzer::battle_controller::{
    Capture, CaptureRelation, Death, Plane, ReplayModel, RibbonCounts, Score, Ship, Snapshot,
    Weather, format_mmss,
};
use warships_replays::bitfield::SquadronPurpose;
use warships_replays::types::{BATTLE_TYPE_ARENA, DOMINATION_BATTLE_TYPES, Relation};

use crate::assets::{MapAssets, ResourceBundle, ShipInfo};
use crate::cache::{FrameCache, cache_key, hash_f64};
use crate::drawing::{
    self, COLOR_ALLY, COLOR_DEAD, COLOR_ENEMY, COLOR_NEUTRAL, COLOR_OWN, COLOR_TEXT,
};
use crate::dual::{SharedFact, SharedVision};
use crate::video::{self, VideoEncoder};
use crate::{
    AIRCRAFT_VIEW_CAP_KM, CACHE_MAX_GENERATIONS, DEFAULT_SHIP_VISION_DISTANCE, FREEZE_FRAMES,
    KM_PER_WORLD_UNIT, LEGEND_OFFSET, MINIMAP_PASTE_Y, PANEL_HEIGHT, PANEL_WIDTH, RenderError,
    job::ProgressSink,
};

/// Ship tiers as displayed in the kill log.
const TIERS: [&str; 11] = [
    "I", "II", "III", "IV", "V", "VI", "VII", "VIII", "IX", "X", "XI",
];

/// Configurable rendering options.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub fps: u32,
    /// Encoder quality, 1..=10.
    pub quality: u8,
    /// Extended side panel with damage/ribbon/achievement/death logs.
    pub show_logs: bool,
    /// Fixed-60fps novelty mode with background music.
    pub fast_forward: bool,
    /// Post-process audio synced to the first kill by the camera owner.
    pub kill_highlight: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            fps: 30,
            quality: 5,
            show_logs: false,
            fast_forward: false,
            kill_highlight: false,
        }
    }
}

impl RenderOptions {
    pub fn effective_fps(&self) -> u32 {
        if self.fast_forward { 60 } else { self.fps }
    }
}

/// Which perspective this engine renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderRole {
    Single,
    /// The friendly side of a dual merge: full overlay, own team only.
    DualFriendly,
    /// The enemy side of a dual merge: entity layers only, no HUD, so the
    /// merged frame carries exactly one HUD.
    DualEnemy,
}

impl RenderRole {
    pub fn is_dual(self) -> bool {
        !matches!(self, RenderRole::Single)
    }

    fn tag(self) -> u8 {
        match self {
            RenderRole::Single => 0,
            RenderRole::DualFriendly => 1,
            RenderRole::DualEnemy => 2,
        }
    }
}

#[derive(Debug)]
pub struct RenderEngine {
    model: ReplayModel,
    options: RenderOptions,
    role: RenderRole,
    bundle: ResourceBundle,
    map: MapAssets,
    cache: FrameCache,
    share: Option<SharedVision>,

    ship_display: HashMap<u32, ShipInfo>,
    holders: HashMap<u32, Rc<RgbaImage>>,
    cap_initial_totals: HashMap<usize, f64>,

    // camera-owner view anchors, updated as layers iterate
    player_x: i32,
    player_y: i32,
    player_alive: bool,
    plane_x: i32,
    plane_y: i32,
    view_range_km: f64,
    weather: Weather,

    ally_cap_time: String,
    enemy_cap_time: String,
    logs_y: i64,
}

impl RenderEngine {
    pub fn new(
        model: ReplayModel,
        bundle: ResourceBundle,
        options: RenderOptions,
        role: RenderRole,
        share: Option<SharedVision>,
    ) -> Result<Self, RenderError> {
        if model.timeline.is_empty() {
            return Err(RenderError::EmptyTimeline);
        }

        let map = bundle.load_map(
            &model.match_info.map_name,
            options.show_logs && role == RenderRole::Single,
            role == RenderRole::DualEnemy,
        );

        let mut ship_display = HashMap::new();
        let mut holders = HashMap::new();
        for player in model.players.values() {
            let info = bundle
                .ship_info(player.ship_params_id)
                .cloned()
                .unwrap_or_default();
            let holder_color = match role {
                RenderRole::DualFriendly => COLOR_ALLY,
                RenderRole::DualEnemy => COLOR_ENEMY,
                RenderRole::Single => match player.relation {
                    Relation::Own => COLOR_OWN,
                    Relation::Ally => COLOR_ALLY,
                    Relation::Enemy => COLOR_ENEMY,
                },
            };
            holders.insert(
                player.vehicle_id.raw(),
                Rc::new(drawing::generate_holder(
                    bundle.font(),
                    &info.name,
                    holder_color,
                )),
            );
            ship_display.insert(player.ship_params_id.raw(), info);
        }

        // player initial position and view range, and the capture zones'
        // initial maximum progress: both come from the first tick and are
        // reused for the whole battle
        let first = &model.timeline.first().expect("timeline is non-empty").snapshot;
        let mut player_x = 0;
        let mut player_y = 0;
        let mut view_range_km = ShipInfo::default().visibility_coef;
        for ship in first.ships.values() {
            if ship.vehicle_id == model.match_info.owner_vehicle_id {
                player_x = ship.x();
                player_y = ship.y();
                if let Some(info) = ship_display.get(&ship.ship_params_id.raw()) {
                    view_range_km = info.visibility_coef;
                }
                break;
            }
        }
        let cap_initial_totals = first
            .captures
            .iter()
            .map(|cap| (cap.id, cap.progress_total))
            .collect();

        Ok(Self {
            model,
            options,
            role,
            bundle,
            map,
            cache: FrameCache::new(CACHE_MAX_GENERATIONS),
            share,
            ship_display,
            holders,
            cap_initial_totals,
            player_x,
            player_y,
            player_alive: true,
            plane_x: 0,
            plane_y: 0,
            view_range_km,
            weather: Weather::default(),
            ally_cap_time: "99:99".to_string(),
            enemy_cap_time: "99:99".to_string(),
            logs_y: 110,
        })
    }

    pub fn arena_id(&self) -> i64 {
        self.model.arena_id
    }

    pub fn total_frames(&self) -> usize {
        self.model.timeline.len()
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        (self.map.panel.width(), self.map.panel.height())
    }

    fn draws_score_overlay(&self) -> bool {
        self.model.match_info.battle_type != BATTLE_TYPE_ARENA
            && self.role != RenderRole::DualEnemy
    }

    /// Composes the frame for one snapshot index.
    pub fn render_frame(&mut self, index: usize) -> RgbaImage {
        let snap = self
            .model
            .timeline
            .get(index)
            .expect("snapshot index out of range")
            .snapshot
            .clone();
        self.weather = snap.weather;

        let mut minimap = self.map.minimap.clone();
        let mut panel = self.map.panel.clone();

        if self.role != RenderRole::DualEnemy {
            drawing::draw_text(
                &mut panel,
                self.bundle.font(),
                18.0,
                5,
                5,
                COLOR_TEXT,
                &snap.time_label,
            );
        }

        if self.draws_score_overlay() {
            if let Some(score) = self.generate_score(&snap.score) {
                drawing::overlay_image(&mut panel, &score, 50, 12);
            }
            if let Some(timer) = self.generate_score_timer(&snap.score, &snap.captures) {
                let x = PANEL_WIDTH as i64 - timer.width() as i64 - 5;
                drawing::overlay_image(&mut panel, &timer, x, 5);
            }
        }

        if self.role == RenderRole::Single {
            if let Some(weather) = self.generate_weather() {
                drawing::overlay_image(&mut panel, &weather, 5, 25);
            }
            if self.options.show_logs {
                self.compose_logs(&snap, &mut panel);
            }
        }

        // captures first so every later layer sits above them
        if self.role != RenderRole::DualEnemy {
            self.layer_caps(&snap, &mut minimap);
        }
        self.layer_wards(&snap, &mut minimap);
        self.layer_ships(&snap, &mut minimap);
        self.layer_planes(&snap, &mut minimap);

        drawing::overlay_image(&mut panel, &minimap, 0, MINIMAP_PASTE_Y);
        self.cache.advance();
        panel
    }

    /// Renders the whole timeline into an encoded video.
    pub fn render(&mut self, sink: &dyn ProgressSink) -> Result<Bytes, RenderError> {
        let total = self.total_frames();
        let (width, height) = self.canvas_size();
        let mut encoder = VideoEncoder::new(
            width,
            height,
            self.options.effective_fps(),
            self.options.quality,
        )?;

        for index in 0..total {
            let frame = self.render_frame(index);
            if index + 1 == total {
                // freeze-frame the final state before closing
                for _ in 0..FREEZE_FRAMES {
                    encoder.push_frame(&frame)?;
                }
            } else {
                encoder.push_frame(&frame)?;
            }
            sink.progress((index + 1) as f64 / total as f64);
        }

        let mut video = encoder.finish()?;

        // audio post-processing is best-effort: a failure never invalidates
        // the finished render
        if self.options.fast_forward {
            if let Some(bgm) = self.bundle.audio_path("bgm.mp3") {
                match video::mux_audio_track(&video, &bgm) {
                    Some(with_audio) => video = with_audio,
                    None => warn!("background music mux failed; keeping silent video"),
                }
            }
        }
        if self.options.kill_highlight {
            if let Some(&first_kill) = self.model.owner_kill_times.first() {
                let kill_video_secs = first_kill / self.options.effective_fps() as f32;
                let tracks = (
                    self.bundle.audio_path("doom.mp3"),
                    self.bundle.audio_path("elevator.mp3"),
                );
                if let (Some(drop_track), Some(lead_track)) = tracks {
                    match video::mix_kill_audio(&video, kill_video_secs, &drop_track, &lead_track) {
                        Some(highlighted) => video = highlighted,
                        None => warn!("kill highlight mix failed; keeping original audio"),
                    }
                }
            }
        }

        debug!(frames = total, bytes = video.len(), "render finished");
        Ok(video)
    }

    // ---- ship layer ----

    fn layer_ships(&mut self, snap: &Snapshot, minimap: &mut RgbaImage) {
        let mut ships: Vec<&Ship> = snap.ships.values().collect();
        // dead and hidden ships first; visible, living ships draw on top
        ships.sort_by_key(|s| (s.is_alive, s.is_visible()));

        for ship in ships {
            if ship.is_owner {
                self.player_x = ship.x();
                self.player_y = ship.y();
                self.player_alive = ship.is_alive;
            }
            if let Some((img, (x, y))) = self.generate_ship(ship) {
                drawing::paste_centered(minimap, &img, x + LEGEND_OFFSET, y + LEGEND_OFFSET);
            }
        }
    }

    fn generate_ship(&mut self, ship: &Ship) -> Option<(Rc<RgbaImage>, (i64, i64))> {
        let (x, y) = self.map.transform.to_canvas(ship.x(), ship.y());

        let in_range = self.ship_in_detection_range(ship);
        let (in_range, health) = self.share_visibility(ship, in_range);

        if self.role.is_dual() && ship.relation.is_enemy() {
            return None;
        }

        let key = cache_key(
            "ship",
            (
                ship.vehicle_id.raw(),
                ship.x(),
                ship.y(),
                ship.yaw(),
                ship.is_alive,
                ship.is_visible(),
                in_range,
                health,
                ship.health_max,
                ship.relation.raw(),
                self.role.tag(),
            ),
        );
        if let Some(img) = self.cache.get(key) {
            return Some((img, (x, y)));
        }

        let info = self
            .ship_display
            .get(&ship.ship_params_id.raw())
            .cloned()
            .unwrap_or_default();
        let img = Rc::new(self.compose_ship(ship, &info, in_range, health));
        self.cache.insert(key, Rc::clone(&img));
        Some((img, (x, y)))
    }

    /// View-range gating: within the owner's ship detection radius, within
    /// the capped aircraft detection radius of the owner's plane, or the
    /// owner is dead (everything revealed).
    pub(crate) fn ship_in_detection_range(&self, ship: &Ship) -> bool {
        let dist_km = f64::hypot(
            (ship.x() - self.player_x) as f64,
            (ship.y() - self.player_y) as f64,
        ) * KM_PER_WORLD_UNIT;
        let dist_plane_km = f64::hypot(
            (ship.x() - self.plane_x) as f64,
            (ship.y() - self.plane_y) as f64,
        ) * KM_PER_WORLD_UNIT;

        let ship_view = if self.weather.vision_distance_ship != 0.0 {
            let weather_km = self.weather.vision_distance_ship as f64 * KM_PER_WORLD_UNIT;
            weather_km.min(self.view_range_km)
        } else {
            self.view_range_km
        };
        let plane_view = if self.weather.vision_distance_plane != 0.0 {
            let weather_km = self.weather.vision_distance_plane as f64 * KM_PER_WORLD_UNIT;
            weather_km.min(AIRCRAFT_VIEW_CAP_KM)
        } else {
            AIRCRAFT_VIEW_CAP_KM
        };

        dist_km <= ship_view || dist_plane_km <= plane_view || !self.player_alive
    }

    /// Dual mode: publish what this side can see, then fold in what the
    /// other side saw. Visibility is ORed, the freshest known health wins.
    pub(crate) fn share_visibility(&self, ship: &Ship, in_range: bool) -> (bool, i64) {
        let mut in_range = in_range;
        let mut health = ship.health;
        let Some(share) = &self.share else {
            return (in_range, health);
        };
        let Some(player) = self.model.players.get(&ship.avatar_id) else {
            return (in_range, health);
        };

        let account = player.account_id.raw();
        if in_range {
            share.publish(account, SharedFact { in_range, health });
        }
        if let Some(fact) = share.get(account) {
            in_range = in_range || fact.in_range;
            if fact.health != 0 {
                health = fact.health;
            }
        }
        (in_range, health)
    }

    fn compose_ship(&self, ship: &Ship, info: &ShipInfo, in_range: bool, health: i64) -> RgbaImage {
        let icon = self.ship_icon(ship, &info.species, in_range);
        let rotated = drawing::rotate_expand(&icon, -(ship.yaw() as f32));

        if !ship.is_alive {
            return rotated;
        }

        let mut holder = self
            .holders
            .get(&ship.vehicle_id.raw())
            .map(|h| h.as_ref().clone())
            .unwrap_or_else(|| RgbaImage::new(100, 80));
        let holder_cx = holder.width() as i64 / 2;
        let holder_cy = holder.height() as i64 / 2;
        drawing::paste_centered(
            &mut holder,
            &rotated,
            holder_cx,
            holder_cy,
        );

        if ship.is_visible() && in_range {
            let bar_color = if self.role == RenderRole::DualEnemy {
                COLOR_ENEMY
            } else {
                match ship.relation {
                    Relation::Enemy => COLOR_ENEMY,
                    _ => COLOR_ALLY,
                }
            };
            drawing::draw_health_bar(&mut holder, health, ship.health_max, bar_color);
        }
        holder
    }

    fn relation_dir(&self, relation: Relation) -> &'static str {
        match self.role {
            RenderRole::DualFriendly => "ally",
            RenderRole::DualEnemy => "enemy",
            RenderRole::Single => match relation {
                Relation::Own => "own",
                Relation::Ally => "ally",
                Relation::Enemy => "enemy",
            },
        }
    }

    fn ship_icon(&self, ship: &Ship, species: &str, in_range: bool) -> RgbaImage {
        // icon key: (alive, visible, species, relation, in-range)
        let (dir, file): (String, String) =
            if self.role == RenderRole::Single && ship.relation.is_self() {
                let state = if ship.is_alive { "alive" } else { "dead" };
                ("own".to_string(), state.to_string())
            } else if !ship.is_alive {
                ("dead".to_string(), species.to_string())
            } else if !ship.is_visible() {
                ("hidden".to_string(), species.to_string())
            } else if in_range {
                (self.relation_dir(ship.relation).to_string(), species.to_string())
            } else {
                (
                    format!("outside/{}", self.relation_dir(ship.relation)),
                    species.to_string(),
                )
            };

        if let Some(icon) = self.bundle.load_icon(&format!("ship_icons/{dir}/{file}")) {
            return icon.as_ref().clone();
        }

        // procedural fallback
        let color = match self.role {
            RenderRole::DualFriendly => COLOR_ALLY,
            RenderRole::DualEnemy => COLOR_ENEMY,
            RenderRole::Single => match ship.relation {
                Relation::Own => COLOR_OWN,
                Relation::Ally => COLOR_ALLY,
                Relation::Enemy => COLOR_ENEMY,
            },
        };
        if !ship.is_alive {
            drawing::filled_circle(16, COLOR_DEAD)
        } else if !ship.is_visible() {
            drawing::ring(16, COLOR_DEAD, 2.0)
        } else if in_range {
            drawing::filled_circle(18, color)
        } else {
            drawing::ring(18, color, 2.0)
        }
    }

    // ---- plane layer ----

    fn layer_planes(&mut self, snap: &Snapshot, minimap: &mut RgbaImage) {
        for plane in snap.planes.values() {
            let (x, y) = self.map.transform.to_canvas(plane.x, plane.y);

            // the owner's own main squadron anchors aircraft vision
            if plane.relation.is_self() && plane.purpose == SquadronPurpose::Main {
                self.plane_x = plane.x;
                self.plane_y = plane.y;
            }
            if self.role.is_dual() && plane.relation.is_enemy() {
                continue;
            }

            let key = cache_key(
                "plane",
                (
                    plane.plane_params_id.raw(),
                    plane.purpose.code(),
                    plane.relation.raw(),
                    self.role.tag(),
                ),
            );
            let img = match self.cache.get(key) {
                Some(img) => img,
                None => {
                    let img = Rc::new(self.plane_icon(plane));
                    self.cache.insert(key, Rc::clone(&img));
                    img
                }
            };
            drawing::paste_centered(minimap, &img, x + LEGEND_OFFSET, y + LEGEND_OFFSET);
        }
    }

    fn plane_icon(&self, plane: &Plane) -> RgbaImage {
        let info = self
            .bundle
            .plane_info(plane.plane_params_id)
            .cloned()
            .unwrap_or_default();
        let ammo = info.ammo_type.to_case(Case::Snake);

        let dir = match self.relation_dir(plane.relation) {
            "own" => "ally",
            other => other,
        };
        let file = match plane.purpose.code() {
            0 | 1 => {
                if info.species == "Dive" {
                    format!("Dive_{ammo}")
                } else {
                    info.species.clone()
                }
            }
            2 | 3 => "Cap".to_string(),
            6 => format!("Airstrike_{ammo}"),
            _ => "Scout".to_string(),
        };

        let base = self
            .bundle
            .load_icon(&format!("plane_icons/{dir}/{file}"))
            .map(|icon| icon.as_ref().clone())
            .unwrap_or_else(|| {
                let color = if dir == "enemy" { COLOR_ENEMY } else { COLOR_ALLY };
                drawing::filled_circle(8, color)
            });

        // recalled squadrons fade out
        if plane.purpose == SquadronPurpose::PostAttack {
            drawing::with_opacity(&base, 0.25)
        } else {
            base
        }
    }

    // ---- ward layer ----

    fn layer_wards(&mut self, snap: &Snapshot, minimap: &mut RgbaImage) {
        for ward in snap.wards.values() {
            if self.role.is_dual() && ward.relation.is_enemy() {
                continue;
            }
            let radius = if ward.radius > 0 { ward.radius } else { 60 };
            let (x, y) = self.map.transform.to_canvas(ward.x, ward.y);
            let diameter =
                (self.map.transform.scaled_radius(radius as f64) * 2.0 + 2.0).round() as u32;

            let name = if self.role == RenderRole::DualEnemy || ward.relation.is_enemy() {
                "ward_enemy"
            } else {
                "ward_ally"
            };
            let key = cache_key("ward", (name, diameter));
            let img = match self.cache.get(key) {
                Some(img) => img,
                None => {
                    let img = Rc::new(self.ward_image(name, diameter));
                    self.cache.insert(key, Rc::clone(&img));
                    img
                }
            };
            drawing::paste_centered(minimap, &img, x + LEGEND_OFFSET, y + LEGEND_OFFSET);
        }
    }

    fn ward_image(&self, name: &str, diameter: u32) -> RgbaImage {
        if let Some(icon) = self.bundle.load_icon(name) {
            return image::imageops::resize(
                icon.as_ref(),
                diameter.max(2),
                diameter.max(2),
                image::imageops::FilterType::Lanczos3,
            );
        }
        let color = if name == "ward_enemy" { COLOR_ENEMY } else { COLOR_ALLY };
        let mut img = drawing::filled_circle(diameter.max(2), Rgba([color[0], color[1], color[2], 0x30]));
        let outline = drawing::ring(diameter.max(2), color, 2.0);
        drawing::overlay_image(&mut img, &outline, 0, 0);
        img
    }

    // ---- capture layer ----

    fn layer_caps(&mut self, snap: &Snapshot, minimap: &mut RgbaImage) {
        if self.model.match_info.battle_type == BATTLE_TYPE_ARENA {
            return;
        }
        for cap in &snap.captures {
            if let Some((img, (x, y))) = self.generate_cap(cap) {
                drawing::paste_centered(minimap, &img, x + LEGEND_OFFSET, y + LEGEND_OFFSET);
            }
        }
    }

    fn cap_relation_color(relation: CaptureRelation) -> Rgba<u8> {
        match relation {
            CaptureRelation::Ally => COLOR_ALLY,
            CaptureRelation::Enemy => COLOR_ENEMY,
            CaptureRelation::Neutral => COLOR_NEUTRAL,
        }
    }

    /// Remaining-progress semantics: countdown-style zones measure against
    /// the zone's initial maximum captured at battle start (the raw total is
    /// noisy mid-battle); domination-style zones use the percent directly.
    pub(crate) fn cap_progress_value(&self, cap: &Capture) -> f64 {
        if cap.progress_total != -1.0 {
            let initial = self
                .cap_initial_totals
                .get(&cap.id)
                .copied()
                .unwrap_or(cap.progress_total);
            if initial <= 0.0 {
                return 0.0;
            }
            ((1.0 - cap.progress_total / initial) * 10.0).round() / 10.0
        } else {
            (cap.progress_percent * 100.0).round() / 100.0
        }
    }

    fn generate_cap(&mut self, cap: &Capture) -> Option<(Rc<RgbaImage>, (i64, i64))> {
        let progress_val = self.cap_progress_value(cap);
        let (x, y) = self
            .map
            .transform
            .to_canvas(cap.x.round() as i32, cap.y.round() as i32);

        let own_team = self.model.match_info.owner_team;
        let base_color = Self::cap_relation_color(cap.relation);
        let invading = cap.has_invaders && cap.invader_team != -1;
        let domination =
            DOMINATION_BATTLE_TYPES.contains(&self.model.match_info.battle_type);

        let key = cache_key(
            "cap",
            (
                cap.id,
                cap.team_id,
                cap.invader_team,
                invading,
                domination,
                hash_f64(progress_val),
                hash_f64(cap.radius as f64),
            ),
        );
        if let Some(img) = self.cache.get(key) {
            return Some((img, (x, y)));
        }

        let img = if domination {
            let radius = self.map.transform.scaled_radius(cap.radius as f64);
            let size = ((radius * 2.0).round() as u32).max(8);

            let mut area = self.cap_area_image(cap.relation, size);
            let marker_size = (size / 3).max(4);
            let marker = if invading {
                let fg_color = if cap.invader_team == own_team {
                    COLOR_ALLY
                } else {
                    COLOR_ENEMY
                };
                let bg = self.cap_marker_image(base_color, marker_size);
                let fg = self.cap_marker_image(fg_color, marker_size);
                drawing::angular_wipe(&bg, &fg, progress_val as f32)
            } else {
                self.cap_marker_image(base_color, marker_size)
            };
            drawing::paste_centered(&mut area, &marker, size as i64 / 2, size as i64 / 2);
            area
        } else {
            let radius = (self.map.transform.scaled_radius(cap.radius as f64).round() as u32).max(6);
            let inner =
                self.map.transform.scaled_radius(cap.inner_radius as f64).round() as u32;

            let (to_color, progress) = if invading && progress_val > 0.0 {
                let color = if cap.invader_team == own_team {
                    COLOR_ALLY
                } else {
                    COLOR_ENEMY
                };
                (color, progress_val)
            } else {
                (base_color, 1.0)
            };
            drawing::torus(base_color, to_color, radius, inner, progress as f32)
        };

        let img = Rc::new(img);
        self.cache.insert(key, Rc::clone(&img));
        Some((img, (x, y)))
    }

    fn cap_area_image(&self, relation: CaptureRelation, size: u32) -> RgbaImage {
        let name = match relation {
            CaptureRelation::Ally => "cap_ally",
            CaptureRelation::Enemy => "cap_enemy",
            CaptureRelation::Neutral => "cap_neutral",
        };
        if let Some(icon) = self.bundle.load_icon(name) {
            return image::imageops::resize(
                icon.as_ref(),
                size,
                size,
                image::imageops::FilterType::Lanczos3,
            );
        }
        let color = Self::cap_relation_color(relation);
        let mut area =
            drawing::filled_circle(size, Rgba([color[0], color[1], color[2], 0x33]));
        let outline = drawing::ring(size, color, 2.0);
        drawing::overlay_image(&mut area, &outline, 0, 0);
        area
    }

    fn cap_marker_image(&self, color: Rgba<u8>, size: u32) -> RgbaImage {
        if let Some(template) = self.bundle.load_icon("cap_normal") {
            let mut marker = image::imageops::resize(
                template.as_ref(),
                size,
                size,
                image::imageops::FilterType::Lanczos3,
            );
            drawing::replace_color(&mut marker, Rgba([0, 0, 0, 0xFF]), color);
            return marker;
        }
        drawing::diamond(size, color)
    }

    // ---- score / timer / weather ----

    fn generate_score(&mut self, score: &Score) -> Option<Rc<RgbaImage>> {
        if score.win_score <= 0 {
            return None;
        }
        let key = cache_key(
            "score",
            (score.ally_score, score.enemy_score, score.win_score),
        );
        if let Some(img) = self.cache.get(key) {
            return Some(img);
        }

        let mut img = RgbaImage::from_pixel(700, 50, self.map.bg_color);
        let mid = 350i64;
        let mid_space = 50i64;
        let bar_height = 30u32;

        let ally_w = (mid as f64 * score.ally_score as f64 / score.win_score as f64).round() as i64;
        let enemy_w =
            (mid as f64 * score.enemy_score as f64 / score.win_score as f64).round() as i64;

        draw_hollow_rect_mut(
            &mut img,
            Rect::at(0, 0).of_size((mid - mid_space) as u32 + 1, bar_height + 1),
            COLOR_ALLY,
        );
        if ally_w - mid_space > 0 {
            draw_filled_rect_mut(
                &mut img,
                Rect::at(0, 0).of_size((ally_w - mid_space) as u32, bar_height + 1),
                COLOR_ALLY,
            );
        }
        draw_hollow_rect_mut(
            &mut img,
            Rect::at((mid + mid_space) as i32, 0)
                .of_size((mid - mid_space) as u32, bar_height + 1),
            COLOR_ENEMY,
        );
        if enemy_w - mid_space > 0 {
            draw_filled_rect_mut(
                &mut img,
                Rect::at((mid + mid_space) as i32, 0)
                    .of_size((enemy_w - mid_space) as u32, bar_height + 1),
                COLOR_ENEMY,
            );
        }

        if let Some(font) = self.bundle.font() {
            let size = 23.0;
            let ally_text = score.ally_score.to_string();
            let enemy_text = score.enemy_score.to_string();
            let ally_w_px = drawing::text_width(font, size, &ally_text);
            let sep_w_px = drawing::text_width(font, size, ":");
            drawing::draw_text(
                &mut img,
                Some(font),
                size,
                mid - ally_w_px.round() as i64 - 8,
                0,
                COLOR_TEXT,
                &ally_text,
            );
            drawing::draw_text(&mut img, Some(font), size, mid + 8, 0, COLOR_TEXT, &enemy_text);
            drawing::draw_text(
                &mut img,
                Some(font),
                size,
                mid - (sep_w_px / 2.0).round() as i64,
                0,
                COLOR_TEXT,
                ":",
            );
        }

        let img = Rc::new(img);
        self.cache.insert(key, Rc::clone(&img));
        Some(img)
    }

    /// Projected time-to-win per side from per-battle-type capture-rate
    /// constants. The constants are empirical; they are preserved as-is.
    fn generate_score_timer(&mut self, score: &Score, caps: &[Capture]) -> Option<Rc<RgbaImage>> {
        let (rate, score_tick): (i64, i64) = match self.model.match_info.battle_type {
            16 => (5, 5),
            15 => (10, 2),
            1 => (2, 6),
            _ => {
                if caps.len() <= 3 {
                    (3, 5)
                } else {
                    (4, 9)
                }
            }
        };

        let mut ally_caps = 0i64;
        let mut enemy_caps = 0i64;
        for cap in caps {
            // contested zones generate no points
            if cap.both_inside {
                continue;
            }
            match cap.relation {
                CaptureRelation::Ally => ally_caps += 1,
                CaptureRelation::Enemy => enemy_caps += 1,
                CaptureRelation::Neutral => {}
            }
        }

        if ally_caps > 0 {
            let per_sec = (ally_caps * rate) as f64 / score_tick as f64;
            let remaining = (score.win_score - score.ally_score).max(0) as f64;
            self.ally_cap_time = format_mmss((remaining / per_sec).round() as i64);
        }
        if enemy_caps > 0 {
            let per_sec = (enemy_caps * rate) as f64 / score_tick as f64;
            let remaining = (score.win_score - score.enemy_score).max(0) as f64;
            self.enemy_cap_time = format_mmss((remaining / per_sec).round() as i64);
        }

        let key = cache_key(
            "score_timer",
            (self.ally_cap_time.clone(), self.enemy_cap_time.clone()),
        );
        if let Some(img) = self.cache.get(key) {
            return Some(img);
        }

        let mut img = RgbaImage::from_pixel(41, 42, self.map.bg_color);
        let font = self.bundle.font();
        drawing::draw_text(&mut img, font, 18.0, 0, 0, COLOR_ALLY, &self.ally_cap_time.clone());
        drawing::draw_text(
            &mut img,
            font,
            18.0,
            0,
            18,
            COLOR_ENEMY,
            &self.enemy_cap_time.clone(),
        );

        let img = Rc::new(img);
        self.cache.insert(key, Rc::clone(&img));
        Some(img)
    }

    fn generate_weather(&mut self) -> Option<Rc<RgbaImage>> {
        let vision = self.weather.vision_distance_ship;
        if vision == 0.0 || vision == DEFAULT_SHIP_VISION_DISTANCE {
            return None;
        }
        let key = cache_key("weather", vision.to_bits());
        if let Some(img) = self.cache.get(key) {
            return Some(img);
        }

        let mut img = RgbaImage::from_pixel(41, 21, self.map.bg_color);
        let icon = self
            .bundle
            .load_icon("cyclone")
            .map(|icon| {
                image::imageops::resize(
                    icon.as_ref(),
                    21,
                    21,
                    image::imageops::FilterType::Lanczos3,
                )
            })
            .unwrap_or_else(|| drawing::ring(18, COLOR_NEUTRAL, 2.0));
        drawing::overlay_image(&mut img, &icon, 0, (21 - icon.height() as i64) / 2);

        let label = format!("{:02}", (vision as f64 * KM_PER_WORLD_UNIT).round() as i64);
        drawing::draw_text(
            &mut img,
            self.bundle.font(),
            18.0,
            icon.width() as i64 + 3,
            0,
            COLOR_TEXT,
            &label,
        );

        let img = Rc::new(img);
        self.cache.insert(key, Rc::clone(&img));
        Some(img)
    }

    // ---- extended log panel ----

    fn compose_logs(&mut self, snap: &Snapshot, panel: &mut RgbaImage) {
        if let Some(damage) = self.generate_damage(snap.damage, snap.damage_potential, snap.damage_spotting) {
            drawing::overlay_image(panel, &damage, 810, 5);
        }

        self.logs_y = 110;
        if let Some(ribbons) = self.generate_ribbons(&snap.ribbons) {
            self.logs_y = 110 + ribbons.height() as i64;
            drawing::overlay_image(panel, &ribbons, 810, 110);
        }
        if let Some(achievements) = self.generate_achievements(snap) {
            let y = self.logs_y;
            drawing::overlay_image(panel, &achievements, 810, y);
        }
        if let Some(deaths) = self.generate_death_log(&snap.deaths) {
            let y = PANEL_HEIGHT as i64 - deaths.height() as i64;
            drawing::overlay_image(panel, &deaths, 810, y);
        }
    }

    fn generate_damage(&mut self, damage: i64, potential: i64, spotting: i64) -> Option<Rc<RgbaImage>> {
        let key = cache_key("damage", (damage, potential, spotting));
        if let Some(img) = self.cache.get(key) {
            return Some(img);
        }

        let mut img = RgbaImage::from_pixel(490, 110, self.map.bg_color);
        if let Some(font) = self.bundle.font() {
            let size = 32.0;
            let row_height = drawing::text_height(font, size) - 5.0;
            let rows = [
                ("DAMAGE DEALT", damage),
                ("POTENTIAL", potential),
                ("SPOTTING", spotting),
            ];
            for (idx, (label, value)) in rows.iter().enumerate() {
                let y = (idx as f32 * row_height) as i64;
                drawing::draw_text(&mut img, Some(font), size, 0, y, COLOR_TEXT, label);
                let value_text = format_thousands(*value);
                let x = 490 - drawing::text_width(font, size, &value_text).round() as i64 - 10;
                drawing::draw_text(&mut img, Some(font), size, x, y, COLOR_TEXT, &value_text);
            }
        }

        let img = Rc::new(img);
        self.cache.insert(key, Rc::clone(&img));
        Some(img)
    }

    fn generate_ribbons(&mut self, ribbons: &RibbonCounts) -> Option<Rc<RgbaImage>> {
        let non_zero = ribbons.non_zero();
        if non_zero.is_empty() {
            return None;
        }
        let key = cache_key("ribbons", &non_zero);
        if let Some(img) = self.cache.get(key) {
            return Some(img);
        }

        // ribbon art is 133x51, three per row
        let rows = non_zero.len().div_ceil(3);
        let mut img = RgbaImage::from_pixel(490, (rows * (51 + 10)) as u32, self.map.bg_color);
        let mut cx = 0i64;
        let mut cy = 0i64;
        for (idx, (name, count)) in non_zero.iter().enumerate() {
            let ribbon = self.ribbon_image(name, *count);
            drawing::overlay_image(&mut img, &ribbon, cx, cy);
            cx += ribbon.width() as i64 + 40;
            if (idx + 1) % 3 == 0 {
                cy += 51 + 10;
                cx = 0;
            }
        }

        let img = Rc::new(img);
        self.cache.insert(key, Rc::clone(&img));
        Some(img)
    }

    fn ribbon_image(&self, name: &str, count: u32) -> RgbaImage {
        let mut base = self
            .bundle
            .load_icon(&format!("ribbons/{name}"))
            .map(|icon| icon.as_ref().clone())
            .unwrap_or_else(|| RgbaImage::from_pixel(133, 51, Rgba([0x20, 0x28, 0x30, 0xC0])));
        if let Some(font) = self.bundle.font() {
            let text = format!("x{count}");
            let size = 23.0;
            let x = base.width() as i64 - drawing::text_width(font, size, &text).round() as i64 - 4;
            let y = base.height() as i64 - drawing::text_height(font, size).round() as i64 - 3;
            drawing::draw_text(&mut base, Some(font), size, x, y, COLOR_TEXT, &text);
        }
        base
    }

    fn generate_achievements(&mut self, snap: &Snapshot) -> Option<Rc<RgbaImage>> {
        if snap.achievements.is_empty() {
            return None;
        }
        let key = cache_key(
            "achievements",
            snap.achievements
                .iter()
                .map(|a| (a.id, a.count))
                .collect::<Vec<_>>(),
        );
        if let Some(img) = self.cache.get(key) {
            return Some(img);
        }

        // achievement art is 81x81, six per row
        let count = snap.achievements.len();
        let rows = count.div_ceil(6);
        let width = 81 * count.min(6) as u32;
        let mut img = RgbaImage::new(width, 81 * rows as u32);
        let mut cx = 0i64;
        let mut cy = 0i64;
        for (idx, achievement) in snap.achievements.iter().enumerate() {
            let art = self.achievement_image(achievement.id, achievement.count);
            drawing::overlay_image(&mut img, &art, cx, cy);
            cx += art.width() as i64;
            if (idx + 1) % 6 == 0 {
                cy += 81;
                cx = 0;
            }
        }

        let img = Rc::new(img);
        self.cache.insert(key, Rc::clone(&img));
        Some(img)
    }

    fn achievement_image(&self, id: i64, count: u32) -> RgbaImage {
        let mut base = self
            .bundle
            .load_icon(&format!("achievements/{id}"))
            .map(|icon| icon.as_ref().clone())
            .unwrap_or_else(|| RgbaImage::from_pixel(81, 81, Rgba([0x30, 0x30, 0x20, 0xC0])));
        // only annotate repeats
        if count > 1 {
            if let Some(font) = self.bundle.font() {
                let text = format!("x{count}");
                let size = 23.0;
                let x =
                    base.width() as i64 - drawing::text_width(font, size, &text).round() as i64 - 5;
                let y = base.height() as i64 - drawing::text_height(font, size).round() as i64 - 3;
                drawing::draw_text(&mut base, Some(font), size, x, y, COLOR_TEXT, &text);
            }
        }
        base
    }

    fn generate_death_log(&mut self, deaths: &[Death]) -> Option<Rc<RgbaImage>> {
        if deaths.is_empty() {
            return None;
        }
        let font = self.bundle.font()?;
        let recent: Vec<&Death> = deaths.iter().take(6).collect();
        let key = cache_key(
            "death_log",
            recent
                .iter()
                .map(|d| (d.killer_vehicle_id.raw(), d.killed_vehicle_id.raw(), &d.time))
                .collect::<Vec<_>>(),
        );
        if let Some(img) = self.cache.get(key) {
            return Some(img);
        }

        let size = 12.0;
        let line_height = 21u32;
        let mut lines = Vec::with_capacity(recent.len());
        for death in &recent {
            let killer = self.model.players.get(&death.killer_avatar_id);
            let killed = self.model.players.get(&death.killed_avatar_id);
            let (Some(killer), Some(killed)) = (killer, killed) else {
                continue;
            };

            let killer_info = self
                .ship_display
                .get(&killer.ship_params_id.raw())
                .cloned()
                .unwrap_or_default();
            let killed_info = self
                .ship_display
                .get(&killed.ship_params_id.raw())
                .cloned()
                .unwrap_or_default();

            let killer_color = relation_text_color(killer.relation);
            let killed_color = relation_text_color(killed.relation);

            let tier = |level: u8| TIERS[(level.clamp(1, 11) - 1) as usize];
            let killer_ship = format!("{} {}", tier(killer_info.level), killer_info.name);
            let killed_ship = format!("{} {}", tier(killed_info.level), killed_info.name);

            let death_icon = self.death_icon(death.death_type as i64);

            let killer_name = drawing::trim_to_width(font, size, &death.killer_name, 120.0);
            let killed_name = drawing::trim_to_width(font, size, &death.killed_name, 120.0);

            let mut width = 0f32;
            let spacer = 4f32;
            for text in [killer_name, &killer_ship, killed_name, &killed_ship] {
                width += drawing::text_width(font, size, text) + spacer;
            }
            width += death_icon.width() as f32 + spacer;

            let mut line = RgbaImage::new((width.ceil() as u32).max(1), line_height);
            let mut x = 0i64;
            for (text, color) in [(killer_name, killer_color), (killer_ship.as_str(), killer_color)]
            {
                drawing::draw_text(&mut line, Some(font), size, x, 0, color, text);
                x += drawing::text_width(font, size, text).round() as i64 + spacer as i64;
            }
            drawing::overlay_image(&mut line, &death_icon, x, 0);
            x += death_icon.width() as i64 + spacer as i64;
            for (text, color) in [(killed_name, killed_color), (killed_ship.as_str(), killed_color)]
            {
                drawing::draw_text(&mut line, Some(font), size, x, 0, color, text);
                x += drawing::text_width(font, size, text).round() as i64 + spacer as i64;
            }
            lines.push(line);
        }
        if lines.is_empty() {
            return None;
        }

        let width = lines.iter().map(|l| l.width()).max().unwrap_or(1);
        let mut img = RgbaImage::from_pixel(
            width,
            line_height * lines.len() as u32,
            self.map.bg_color,
        );
        // newest entry at the bottom
        let mut y = img.height() as i64;
        for line in &lines {
            y -= line_height as i64;
            drawing::overlay_image(&mut img, line, 0, y);
        }

        let img = Rc::new(img);
        self.cache.insert(key, Rc::clone(&img));
        Some(img)
    }

    fn death_icon(&self, death_type: i64) -> RgbaImage {
        let icon_name = self
            .bundle
            .death_type(death_type)
            .map(|info| info.icon.clone())
            .unwrap_or_else(|| "frags".to_string());
        self.bundle
            .load_icon(&format!("frag_icons/{icon_name}"))
            .or_else(|| self.bundle.load_icon("frag_icons/frags"))
            .map(|icon| icon.as_ref().clone())
            .unwrap_or_else(|| drawing::filled_circle(14, COLOR_DEAD))
    }
}

fn relation_text_color(relation: Relation) -> Rgba<u8> {
    match relation {
        Relation::Enemy => COLOR_ENEMY,
        _ => COLOR_ALLY,
    }
}

/// `1234567` -> `1 234 567`.
fn format_thousands(value: i64) -> String {
    let raw = value.abs().to_string();
    let mut out = String::with_capacity(raw.len() + raw.len() / 3);
    let offset = raw.len() % 3;
    for (idx, c) in raw.chars().enumerate() {
        if idx != 0 && (idx + 3 - offset) % 3 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    if value < 0 {
        format!("-{out}")
    } else {
        out
    }
}
