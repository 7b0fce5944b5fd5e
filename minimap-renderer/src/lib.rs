pub mod assets;
pub mod cache;
pub mod config;
pub mod drawing;
pub mod dual;
mod error;
pub mod job;
pub mod map_data;
pub mod renderer;
pub mod video;

pub use error::*;

/// Edge length of the minimap island image in pixels.
pub const MAP_IMAGE_SIZE: u32 = 760;
/// Border around the map image reserved for the grid legends. Entity
/// positions are offset by this amount when pasted onto the map canvas.
pub const LEGEND_OFFSET: i64 = 20;
/// Full map canvas edge: map image plus legend borders.
pub const MAP_CANVAS_SIZE: u32 = 800;
/// Info panel dimensions. The map canvas is pasted at (0, 50).
pub const PANEL_WIDTH: u32 = 800;
pub const PANEL_HEIGHT: u32 = 850;
/// Panel width with the extended log panel enabled.
pub const PANEL_WIDTH_WITH_LOGS: u32 = 1300;
/// Vertical offset of the map canvas inside the info panel.
pub const MINIMAP_PASTE_Y: i64 = 50;
/// The final snapshot is repeated this many times before the encoder closes.
pub const FREEZE_FRAMES: usize = 60;
/// World units to kilometers.
pub const KM_PER_WORLD_UNIT: f64 = 0.03;
/// Hard cap on aircraft detection range in km, before weather reductions.
pub const AIRCRAFT_VIEW_CAP_KM: f64 = 15.0;
/// Ship vision distance reported when no weather is active; the weather
/// indicator is suppressed at this value.
pub const DEFAULT_SHIP_VISION_DISTANCE: f32 = 2000.0;
/// Cache entries expire after this many frame iterations.
pub const CACHE_MAX_GENERATIONS: u64 = 10;
/// Dual-merge renders use a fixed frame rate and quality.
pub const DUAL_FPS: u32 = 30;
pub const DUAL_QUALITY: u8 = 9;
