use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::renderer::RenderOptions;

/// Renderer configuration, loadable from a TOML file.
///
/// All fields default to their standard values. CLI flags override config
/// file values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Output frame rate (one snapshot per frame).
    pub fps: u32,
    /// Encoder quality, 1..=10.
    pub quality: u8,
    /// Render the extended damage/ribbon/achievement/death log panel.
    pub logs: bool,
    /// Fixed-60fps novelty mode with background music.
    pub fast_forward: bool,
    /// Sync audio to the first kill by the camera owner.
    pub kill_highlight: bool,
    /// Directory holding per-version resource bundles.
    pub assets_root: PathBuf,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            quality: 5,
            logs: false,
            fast_forward: false,
            kill_highlight: false,
            assets_root: PathBuf::from("bundles"),
        }
    }
}

impl RendererConfig {
    /// Load config from a TOML file.
    #[cfg(feature = "bin")]
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Convert into RenderOptions for the engine.
    pub fn into_render_options(self) -> RenderOptions {
        RenderOptions {
            fps: self.fps,
            quality: self.quality,
            show_logs: self.logs,
            fast_forward: self.fast_forward,
            kill_highlight: self.kill_highlight,
        }
    }

    /// Generate a commented default TOML config string.
    pub fn generate_default_toml() -> String {
        r#"# Minimap Renderer Configuration
# Place this file as minimap_renderer.toml next to the executable,
# or specify with --config <path>.

# Output frame rate (each battle tick becomes one frame)
fps = 30

# Encoder quality, 1-10
quality = 5

# Render the extended damage/ribbon/achievement/death log panel
logs = false

# Fixed-60fps novelty mode with background music
fast_forward = false

# Sync audio to the first kill scored by the recording player
kill_highlight = false

# Directory holding per-version resource bundles
assets_root = "bundles"
"#
        .to_string()
    }

    /// Apply CLI flag overrides.
    #[cfg(feature = "bin")]
    pub fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) {
        if let Some(fps) = matches.value_of("FPS").and_then(|v| v.parse().ok()) {
            self.fps = fps;
        }
        if let Some(quality) = matches.value_of("QUALITY").and_then(|v| v.parse().ok()) {
            self.quality = quality;
        }
        if matches.is_present("LOGS") {
            self.logs = true;
        }
        if matches.is_present("FAST_FORWARD") {
            self.fast_forward = true;
        }
        if matches.is_present("KILL_HIGHLIGHT") {
            self.kill_highlight = true;
        }
        if let Some(assets) = matches.value_of("ASSETS") {
            self.assets_root = PathBuf::from(assets);
        }
    }
}
