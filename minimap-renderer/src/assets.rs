//! Versioned resource bundles.
//!
//! Rendering assets (map images, icon art, fonts, ship/plane/death info
//! tables) ship per client version under `<assets_root>/<major_minor_patch>/`.
//! A missing bundle directory is the user-facing "version not supported"
//! condition. Within a resolved bundle every individual asset is optional:
//! missing art degrades to procedural fallbacks, a missing font skips text.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use ab_glyph::FontVec;
use image::{Rgba, RgbaImage};
use serde::Deserialize;
use tracing::{debug, warn};

use warships_replays::types::{GameParamId, Version};

use crate::map_data::{MapTransform, parse_space_settings};
use crate::{
    LEGEND_OFFSET, MAP_IMAGE_SIZE, MAP_CANVAS_SIZE, PANEL_HEIGHT, PANEL_WIDTH,
    PANEL_WIDTH_WITH_LOGS, RenderJobError, drawing,
};

/// Space size assumed when a map has no `space.settings`.
pub const DEFAULT_MAP_SPACE: f64 = 2400.0;
/// Rasterization edge for SVG icon art.
pub const SVG_ICON_SIZE: u32 = 60;

const NAVY_BACKGROUND: Rgba<u8> = Rgba([0x1A, 0x28, 0x3A, 0xFF]);

#[derive(Debug, Clone, Deserialize)]
pub struct ShipInfo {
    pub name: String,
    pub species: String,
    pub level: u8,
    pub visibility_coef: f64,
}

impl Default for ShipInfo {
    fn default() -> Self {
        Self {
            name: "Unknown".into(),
            species: "Cruiser".into(),
            level: 5,
            visibility_coef: 12.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaneInfo {
    pub species: String,
    pub ammo_type: String,
}

impl Default for PlaneInfo {
    fn default() -> Self {
        Self {
            species: "Fighter".into(),
            ammo_type: "he".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeathTypeInfo {
    pub icon: String,
    pub name: String,
}

/// Prepared backgrounds and the coordinate transform for one map.
#[derive(Debug)]
pub struct MapAssets {
    pub minimap: RgbaImage,
    pub panel: RgbaImage,
    pub transform: MapTransform,
    pub bg_color: Rgba<u8>,
}

#[derive(Debug)]
pub struct ResourceBundle {
    root: Option<PathBuf>,
    ship_info: HashMap<u32, ShipInfo>,
    plane_info: HashMap<u32, PlaneInfo>,
    death_types: HashMap<i64, DeathTypeInfo>,
    font: Option<FontVec>,
    icons: RefCell<HashMap<String, Option<Rc<RgbaImage>>>>,
}

impl ResourceBundle {
    /// Resolves the bundle for a client version. The bundle directory must
    /// exist; everything inside it is best-effort.
    pub fn resolve(assets_root: &Path, version: &Version) -> Result<Self, RenderJobError> {
        let root = assets_root.join(version.bundle_dir());
        if !root.is_dir() {
            return Err(RenderJobError::VersionNotSupported(version.to_string()));
        }
        debug!(bundle = %root.display(), "resolved resource bundle");

        let ship_info = load_keyed_json::<ShipInfo>(&root.join("info_ship.json"));
        let plane_info = load_keyed_json::<PlaneInfo>(&root.join("info_planes.json"));
        let death_types = load_keyed_json::<DeathTypeInfo>(&root.join("info_death.json"))
            .into_iter()
            .map(|(k, v)| (k as i64, v))
            .collect();

        let font = std::fs::read(root.join("warhelios_bold.ttf"))
            .ok()
            .and_then(|data| FontVec::try_from_vec(data).ok());
        if font.is_none() {
            warn!("bundle has no font; text layers will be skipped");
        }

        Ok(Self {
            root: Some(root),
            ship_info,
            plane_info,
            death_types,
            font,
            icons: RefCell::new(HashMap::new()),
        })
    }

    /// An empty bundle: every icon falls back to procedural art and text is
    /// skipped. Used by tests and the `--no-assets` CLI path.
    pub fn fallback() -> Self {
        Self {
            root: None,
            ship_info: HashMap::new(),
            plane_info: HashMap::new(),
            death_types: HashMap::new(),
            font: None,
            icons: RefCell::new(HashMap::new()),
        }
    }

    pub fn font(&self) -> Option<&FontVec> {
        self.font.as_ref()
    }

    pub fn ship_info(&self, params_id: GameParamId) -> Option<&ShipInfo> {
        self.ship_info.get(&params_id.raw())
    }

    pub fn plane_info(&self, params_id: GameParamId) -> Option<&PlaneInfo> {
        self.plane_info.get(&params_id.raw())
    }

    pub fn death_type(&self, death_type: i64) -> Option<&DeathTypeInfo> {
        self.death_types.get(&death_type)
    }

    /// Absolute path of an audio asset, when the bundle ships it.
    pub fn audio_path(&self, name: &str) -> Option<PathBuf> {
        let path = self.root.as_ref()?.join(name);
        path.is_file().then_some(path)
    }

    /// Loads an icon by bundle-relative stem, trying `.png` then `.svg`.
    /// Results (including misses) are memoized for the bundle's lifetime.
    pub fn load_icon(&self, stem: &str) -> Option<Rc<RgbaImage>> {
        if let Some(cached) = self.icons.borrow().get(stem) {
            return cached.clone();
        }
        let loaded = self.load_icon_uncached(stem);
        self.icons
            .borrow_mut()
            .insert(stem.to_string(), loaded.clone());
        loaded
    }

    fn load_icon_uncached(&self, stem: &str) -> Option<Rc<RgbaImage>> {
        let root = self.root.as_ref()?;
        let png = root.join(format!("{stem}.png"));
        if let Ok(data) = std::fs::read(&png) {
            match image::load_from_memory(&data) {
                Ok(img) => return Some(Rc::new(img.to_rgba8())),
                Err(e) => warn!(path = %png.display(), "unreadable icon: {e}"),
            }
        }
        let svg = root.join(format!("{stem}.svg"));
        if let Ok(data) = std::fs::read(&svg) {
            if let Some(img) = rasterize_svg(&data, SVG_ICON_SIZE) {
                return Some(Rc::new(img));
            }
            warn!(path = %svg.display(), "unreadable svg icon");
        }
        None
    }

    fn read_space_settings(&self, map_name: &str) -> Option<(f64, f64)> {
        let root = self.root.as_ref()?;
        for candidate in [
            root.join(format!("spaces/{map_name}/space.settings")),
            root.join(format!("spaces/s{map_name}/space.settings")),
        ] {
            if let Ok(content) = std::fs::read_to_string(&candidate) {
                return parse_space_settings(&content);
            }
        }
        None
    }

    /// Builds the pre-rendered backgrounds for a map: water + grid legends +
    /// island composite, and the info panel the map canvas is pasted onto.
    ///
    /// `transparent` produces empty canvases for the enemy side of a dual
    /// render, which only contributes entity layers to the merged frame.
    pub fn load_map(&self, map_name: &str, with_logs: bool, transparent: bool) -> MapAssets {
        let (space_w, space_h) = self
            .read_space_settings(map_name)
            .unwrap_or((DEFAULT_MAP_SPACE, DEFAULT_MAP_SPACE));
        let transform = MapTransform::from_space_size(space_w, space_h);

        if transparent {
            return MapAssets {
                minimap: RgbaImage::new(MAP_CANVAS_SIZE, MAP_CANVAS_SIZE),
                panel: RgbaImage::new(PANEL_WIDTH, PANEL_HEIGHT),
                transform,
                bg_color: Rgba([0, 0, 0, 0]),
            };
        }

        let water = self.load_icon(&format!("spaces/{map_name}/minimap_water"));
        let island = self.load_icon(&format!("spaces/{map_name}/minimap"));
        let legends = self.load_icon("minimap_grid_legends");

        let bg_color = water
            .as_ref()
            .filter(|img| img.width() > 10 && img.height() > 10)
            .map(|img| *img.get_pixel(10, 10))
            .unwrap_or(NAVY_BACKGROUND);

        let mut minimap = RgbaImage::from_pixel(MAP_CANVAS_SIZE, MAP_CANVAS_SIZE, bg_color);
        if let Some(water) = &water {
            let resized = image::imageops::resize(
                water.as_ref(),
                MAP_CANVAS_SIZE,
                MAP_CANVAS_SIZE,
                image::imageops::FilterType::Lanczos3,
            );
            drawing::overlay_image(&mut minimap, &resized, 0, 0);
        }
        if let Some(legends) = &legends {
            drawing::overlay_image(&mut minimap, legends, 0, 0);
        }
        let grid = drawing::draw_grid(MAP_IMAGE_SIZE);
        drawing::overlay_image(&mut minimap, &grid, LEGEND_OFFSET, LEGEND_OFFSET);
        if let Some(island) = &island {
            let resized = if island.dimensions() == (MAP_IMAGE_SIZE, MAP_IMAGE_SIZE) {
                island.as_ref().clone()
            } else {
                image::imageops::resize(
                    island.as_ref(),
                    MAP_IMAGE_SIZE,
                    MAP_IMAGE_SIZE,
                    image::imageops::FilterType::Lanczos3,
                )
            };
            drawing::overlay_image(&mut minimap, &resized, LEGEND_OFFSET, LEGEND_OFFSET);
        }

        let panel_width = if with_logs {
            PANEL_WIDTH_WITH_LOGS
        } else {
            PANEL_WIDTH
        };
        let panel = RgbaImage::from_pixel(panel_width, PANEL_HEIGHT, bg_color);

        MapAssets {
            minimap,
            panel,
            transform,
            bg_color,
        }
    }
}

fn load_keyed_json<T: for<'de> Deserialize<'de>>(path: &Path) -> HashMap<u32, T> {
    let Ok(data) = std::fs::read(path) else {
        warn!(path = %path.display(), "bundle info table missing");
        return HashMap::new();
    };
    let parsed: Result<HashMap<String, T>, _> = serde_json::from_slice(&data);
    match parsed {
        Ok(map) => map
            .into_iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|k| (k, v)))
            .collect(),
        Err(e) => {
            warn!(path = %path.display(), "bundle info table unreadable: {e}");
            HashMap::new()
        }
    }
}

/// Rasterizes an SVG byte buffer to a square RGBA image, centered and
/// aspect-preserving.
pub fn rasterize_svg(svg_data: &[u8], size: u32) -> Option<RgbaImage> {
    let opt = resvg::usvg::Options::default();
    let tree = resvg::usvg::Tree::from_data(svg_data, &opt).ok()?;

    let tree_size = tree.size();
    let sx = size as f32 / tree_size.width();
    let sy = size as f32 / tree_size.height();
    let scale = sx.min(sy);

    let mut pixmap = tiny_skia::Pixmap::new(size, size)?;
    let offset_x = (size as f32 - tree_size.width() * scale) / 2.0;
    let offset_y = (size as f32 - tree_size.height() * scale) / 2.0;
    let transform =
        tiny_skia::Transform::from_translate(offset_x, offset_y).post_scale(scale, scale);

    resvg::render(&tree, transform, &mut pixmap.as_mut());

    let data = pixmap.data().to_vec();
    RgbaImage::from_raw(size, size, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bundle_is_version_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let version = Version::from_client_exe("0,9,9,1");
        let err = ResourceBundle::resolve(dir.path(), &version).unwrap_err();
        assert!(matches!(err, RenderJobError::VersionNotSupported(v) if v == "0.9.9"));
    }

    #[test]
    fn present_bundle_resolves_with_partial_contents() {
        let dir = tempfile::tempdir().unwrap();
        let bundle_dir = dir.path().join("0_10_9");
        std::fs::create_dir_all(&bundle_dir).unwrap();
        std::fs::write(
            bundle_dir.join("info_ship.json"),
            r#"{"4289510224": {"name": "Gearing", "species": "Destroyer", "level": 10, "visibility_coef": 7.6}}"#,
        )
        .unwrap();

        let bundle =
            ResourceBundle::resolve(dir.path(), &Version::from_client_exe("0,10,9,0")).unwrap();
        let info = bundle.ship_info(GameParamId(4289510224)).unwrap();
        assert_eq!(info.species, "Destroyer");
        assert!(bundle.plane_info(GameParamId(1)).is_none());
        assert!(bundle.load_icon("ship_icons/ally/Destroyer").is_none());
    }

    #[test]
    fn fallback_map_assets_are_complete() {
        let bundle = ResourceBundle::fallback();
        let map = bundle.load_map("17_NA_fault_line", false, false);
        assert_eq!(map.minimap.dimensions(), (MAP_CANVAS_SIZE, MAP_CANVAS_SIZE));
        assert_eq!(map.panel.dimensions(), (PANEL_WIDTH, PANEL_HEIGHT));
        assert_eq!(map.bg_color, NAVY_BACKGROUND);
    }

    #[test]
    fn transparent_map_assets_for_dual_enemy() {
        let bundle = ResourceBundle::fallback();
        let map = bundle.load_map("17_NA_fault_line", false, true);
        assert_eq!(map.panel.get_pixel(0, 0)[3], 0);
    }

    #[test]
    fn logs_panel_is_wider() {
        let bundle = ResourceBundle::fallback();
        let map = bundle.load_map("x", true, false);
        assert_eq!(map.panel.width(), PANEL_WIDTH_WITH_LOGS);
    }
}
