//! World-to-canvas coordinate conversion and `space.settings` parsing.

use crate::MAP_IMAGE_SIZE;

/// Scale factors from world units to map-image pixels. World origin is the
/// map center; the canvas origin is the top-left of the 800px map canvas
/// (legend borders included at paste time, not here).
#[derive(Debug, Clone, Copy)]
pub struct MapTransform {
    pub scale_x: f64,
    pub scale_y: f64,
}

impl MapTransform {
    pub fn from_space_size(width: f64, height: f64) -> Self {
        Self {
            scale_x: MAP_IMAGE_SIZE as f64 / width,
            scale_y: MAP_IMAGE_SIZE as f64 / height,
        }
    }

    /// World (x, y) to canvas pixels. The world y axis points north, the
    /// canvas y axis points down.
    pub fn to_canvas(&self, x: i32, y: i32) -> (i64, i64) {
        let px = (x as f64 * self.scale_x + 400.0).round() as i64;
        let py = (-y as f64 * self.scale_y + 400.0).round() as i64;
        (px, py)
    }

    pub fn scaled_radius(&self, radius: f64) -> f64 {
        radius * (self.scale_x + self.scale_y) / 2.0
    }
}

/// Playable space dimensions from a `space.settings` document. Bounds are
/// chunk indices; two chunks on every edge are out of bounds.
pub fn parse_space_settings(xml: &str) -> Option<(f64, f64)> {
    let doc = roxmltree::Document::parse(xml).ok()?;

    let bounds = doc.descendants().find(|n| n.has_tag_name("bounds"))?;
    let read = |name: &str| -> Option<i64> {
        if let Some(v) = bounds.attribute(name) {
            return v.trim().parse().ok();
        }
        bounds
            .children()
            .find(|c| c.has_tag_name(name))
            .and_then(|c| c.text())
            .and_then(|t| t.trim().parse().ok())
    };

    let min_x = read("minX")?;
    let max_x = read("maxX")?;
    let min_y = read("minY")?;
    let max_y = read("maxY")?;

    let chunk_size: f64 = doc
        .descendants()
        .find(|n| n.has_tag_name("chunkSize"))
        .and_then(|n| n.text())
        .and_then(|t| t.trim().parse().ok())
        .unwrap_or(100.0);

    let width = (max_x - min_x + 1) as f64 * chunk_size - 4.0 * chunk_size;
    let height = (max_y - min_y + 1) as f64 * chunk_size - 4.0 * chunk_size;
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_centers_origin() {
        let transform = MapTransform::from_space_size(1520.0, 1520.0);
        assert_eq!(transform.to_canvas(0, 0), (400, 400));
        // north is up on the canvas
        let (_, py) = transform.to_canvas(0, 700);
        assert!(py < 400);
        let (px, _) = transform.to_canvas(700, 0);
        assert!(px > 400);
    }

    #[test]
    fn space_settings_attribute_form() {
        let xml = r#"<space.settings>
            <bounds minX="-4" maxX="4" minY="-4" maxY="4"/>
            <chunkSize>100.0</chunkSize>
        </space.settings>"#;
        let (w, h) = parse_space_settings(xml).unwrap();
        assert_eq!(w, 500.0);
        assert_eq!(h, 500.0);
    }

    #[test]
    fn space_settings_element_form_defaults_chunk_size() {
        let xml = r#"<space.settings>
            <bounds><minX>-10</minX><maxX>9</maxX><minY>-10</minY><maxY>9</maxY></bounds>
        </space.settings>"#;
        let (w, _) = parse_space_settings(xml).unwrap();
        assert_eq!(w, 1600.0);
    }
}
