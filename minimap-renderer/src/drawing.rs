//! Pixel-level drawing helpers: alpha composition, procedural shapes for
//! missing bundle art, icon rotation, text, and the HUD primitives shared by
//! the layer generators.

use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use image::{Rgba, RgbaImage, imageops};
use imageproc::drawing::draw_text_mut;
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};

pub const COLOR_ALLY: Rgba<u8> = Rgba([0x4C, 0xE8, 0xAA, 0xFF]);
pub const COLOR_ENEMY: Rgba<u8> = Rgba([0xFE, 0x4D, 0x2A, 0xFF]);
pub const COLOR_NEUTRAL: Rgba<u8> = Rgba([0xFF, 0xFF, 0xFF, 0xFF]);
pub const COLOR_OWN: Rgba<u8> = Rgba([0xFF, 0xFF, 0xFF, 0xFF]);
pub const COLOR_TEXT: Rgba<u8> = Rgba([0xFF, 0xFF, 0xFF, 0xFF]);
pub const COLOR_HP_OUTLINE: Rgba<u8> = Rgba([0x80, 0x80, 0x80, 0xFF]);
pub const COLOR_DEAD: Rgba<u8> = Rgba([0x80, 0x80, 0x80, 0xFF]);
pub const COLOR_GRID: Rgba<u8> = Rgba([0xFF, 0xFF, 0xFF, 0x40]);

/// Alpha-composites `img` over `canvas` with its top-left at (x, y).
/// Coordinates may be negative; clipping is handled by `imageops`.
pub fn overlay_image(canvas: &mut RgbaImage, img: &RgbaImage, x: i64, y: i64) {
    imageops::overlay(canvas, img, x, y);
}

/// Alpha-composites `img` over `canvas` centered on (cx, cy).
pub fn paste_centered(canvas: &mut RgbaImage, img: &RgbaImage, cx: i64, cy: i64) {
    overlay_image(
        canvas,
        img,
        cx - img.width() as i64 / 2,
        cy - img.height() as i64 / 2,
    );
}

/// Rotates counter-clockwise by `degrees`, expanding the output so nothing
/// is clipped.
pub fn rotate_expand(img: &RgbaImage, degrees: f32) -> RgbaImage {
    let (w, h) = img.dimensions();
    let diagonal = ((w * w + h * h) as f32).sqrt().ceil() as u32;
    let mut padded = RgbaImage::new(diagonal, diagonal);
    overlay_image(
        &mut padded,
        img,
        ((diagonal - w) / 2) as i64,
        ((diagonal - h) / 2) as i64,
    );
    // rotate_about_center's positive angle is clockwise in image
    // coordinates, so negate for a counter-clockwise convention.
    rotate_about_center(
        &padded,
        -degrees.to_radians(),
        Interpolation::Bicubic,
        Rgba([0, 0, 0, 0]),
    )
}

/// Multiplies the alpha channel by `opacity`.
pub fn with_opacity(img: &RgbaImage, opacity: f32) -> RgbaImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        pixel[3] = (pixel[3] as f32 * opacity.clamp(0.0, 1.0)) as u8;
    }
    out
}

/// Exact-match color replacement, alpha preserved. Only meaningful on
/// un-antialiased template art.
pub fn replace_color(img: &mut RgbaImage, from: Rgba<u8>, to: Rgba<u8>) {
    for pixel in img.pixels_mut() {
        if pixel[0] == from[0] && pixel[1] == from[1] && pixel[2] == from[2] {
            pixel[0] = to[0];
            pixel[1] = to[1];
            pixel[2] = to[2];
        }
    }
}

fn supersampled(diameter: u32, draw: impl Fn(f32, f32) -> Option<Rgba<u8>>) -> RgbaImage {
    const FACTOR: u32 = 4;
    let big = diameter.max(1) * FACTOR;
    let mut img = RgbaImage::new(big, big);
    let center = big as f32 / 2.0;
    for y in 0..big {
        for x in 0..big {
            let dx = (x as f32 + 0.5 - center) / FACTOR as f32;
            let dy = (y as f32 + 0.5 - center) / FACTOR as f32;
            if let Some(color) = draw(dx, dy) {
                img.put_pixel(x, y, color);
            }
        }
    }
    imageops::resize(
        &img,
        diameter.max(1),
        diameter.max(1),
        imageops::FilterType::Lanczos3,
    )
}

pub fn filled_circle(diameter: u32, color: Rgba<u8>) -> RgbaImage {
    let radius = diameter as f32 / 2.0;
    supersampled(diameter, |dx, dy| {
        if dx * dx + dy * dy <= radius * radius {
            Some(color)
        } else {
            None
        }
    })
}

pub fn ring(diameter: u32, color: Rgba<u8>, width: f32) -> RgbaImage {
    let radius = diameter as f32 / 2.0;
    let inner = (radius - width).max(0.0);
    supersampled(diameter, |dx, dy| {
        let d2 = dx * dx + dy * dy;
        if d2 <= radius * radius && d2 >= inner * inner {
            Some(color)
        } else {
            None
        }
    })
}

/// Filled diamond (rotated square), used as the fallback capture-progress
/// marker when the bundle has no template art.
pub fn diamond(size: u32, color: Rgba<u8>) -> RgbaImage {
    let half = size as f32 / 2.0;
    supersampled(size, |dx, dy| {
        if dx.abs() + dy.abs() <= half {
            Some(color)
        } else {
            None
        }
    })
}

/// Angle of (dx, dy) measured clockwise from 12 o'clock, in [0, 1).
fn wipe_fraction(dx: f32, dy: f32) -> f32 {
    let angle = dx.atan2(-dy); // 0 at 12 o'clock, increasing clockwise
    let frac = angle / (2.0 * std::f32::consts::PI);
    if frac < 0.0 { frac + 1.0 } else { frac }
}

/// Per-pixel angular blend of two equally sized images: pixels inside the
/// clockwise wipe (starting at 12 o'clock) come from `fg`, the rest from
/// `bg`.
pub fn angular_wipe(bg: &RgbaImage, fg: &RgbaImage, progress: f32) -> RgbaImage {
    let mut out = bg.clone();
    if progress <= 0.0 {
        return out;
    }
    let cx = bg.width() as f32 / 2.0;
    let cy = bg.height() as f32 / 2.0;
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - cx;
        let dy = y as f32 + 0.5 - cy;
        if wipe_fraction(dx, dy) <= progress {
            *pixel = *fg.get_pixel(x, y);
        }
    }
    out
}

/// The concentric-ring capture zone: a 4px outline in the owning color, a
/// translucent interior with an angular progress wipe from `from` to `to`,
/// and a transparent hole at the inner radius.
pub fn torus(
    from: Rgba<u8>,
    to: Rgba<u8>,
    outer_radius: u32,
    inner_radius: u32,
    progress: f32,
) -> RgbaImage {
    let outer = outer_radius as f32;
    let inner = inner_radius as f32;
    let outline_width = 4.0;
    let half_from = Rgba([from[0], from[1], from[2], 0x80]);
    let half_to = Rgba([to[0], to[1], to[2], 0x80]);

    supersampled(outer_radius * 2, move |dx, dy| {
        let d2 = dx * dx + dy * dy;
        if d2 > outer * outer {
            return None;
        }
        if d2 >= (outer - outline_width) * (outer - outline_width) {
            return Some(from);
        }
        if inner > 0.0 && d2 < inner * inner {
            return None;
        }
        if progress > 0.0 {
            if wipe_fraction(dx, dy) <= progress {
                Some(half_to)
            } else {
                Some(half_from)
            }
        } else {
            Some(from)
        }
    })
}

/// A-J / 1-10 grid overlay at the map image size.
pub fn draw_grid(size: u32) -> RgbaImage {
    let mut img = RgbaImage::new(size, size);
    let cell = (size as f32 / 10.0).round() as u32;
    for line in (0..size).step_by(cell.max(1) as usize) {
        for p in 0..size {
            img.put_pixel(line, p, COLOR_GRID);
            img.put_pixel(p, line, COLOR_GRID);
        }
    }
    for p in 0..size {
        img.put_pixel(size - 1, p, COLOR_GRID);
        img.put_pixel(p, size - 1, COLOR_GRID);
    }
    img
}

/// Measured advance width of `text` at `size` pixels.
pub fn text_width(font: &FontVec, size: f32, text: &str) -> f32 {
    let scaled = font.as_scaled(PxScale::from(size));
    text.chars().map(|c| scaled.h_advance(font.glyph_id(c))).sum()
}

pub fn text_height(font: &FontVec, size: f32) -> f32 {
    font.as_scaled(PxScale::from(size)).height()
}

/// Draws text if a font is available; silently a no-op otherwise, so a
/// bundle without fonts degrades to icon-only output instead of failing.
pub fn draw_text(
    canvas: &mut RgbaImage,
    font: Option<&FontVec>,
    size: f32,
    x: i64,
    y: i64,
    color: Rgba<u8>,
    text: &str,
) {
    let Some(font) = font else { return };
    draw_text_mut(
        canvas,
        color,
        x as i32,
        y as i32,
        PxScale::from(size),
        font,
        text,
    );
}

/// Truncates `text` so it fits within `max_width` pixels at `size`.
pub fn trim_to_width<'a>(font: &FontVec, size: f32, text: &'a str, max_width: f32) -> &'a str {
    if text_width(font, size, text) <= max_width {
        return text;
    }
    let mut end = text.len();
    while end > 0 {
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        if text_width(font, size, &text[..end]) <= max_width {
            return &text[..end];
        }
        end = end.saturating_sub(1);
    }
    ""
}

/// The 100x80 name holder a living ship icon is composed into: the name
/// sits near the bottom, the icon is pasted centered later.
pub fn generate_holder(font: Option<&FontVec>, text: &str, color: Rgba<u8>) -> RgbaImage {
    let mut holder = RgbaImage::new(100, 80);
    if let Some(font) = font {
        let size = 12.0;
        let width = text_width(font, size, text);
        let height = text_height(font, size);
        let x = (50.0 - width / 2.0).round() as i64;
        let y = (80.0 - height - 16.0).round() as i64;
        draw_text(&mut holder, Some(font), size, x, y, color, text);
    }
    holder
}

/// Health bar drawn onto a ship holder: full-width gray outline, filled
/// portion colored by relation. Zero health renders as full, matching the
/// pre-first-damage state of the wire data.
pub fn draw_health_bar(holder: &mut RgbaImage, health: i64, health_max: i64, color: Rgba<u8>) {
    if health_max <= 0 {
        return;
    }
    let bar_width = 50i64;
    let bar_height = 4i64;
    let bar_y = 65i64;
    let x0 = holder.width() as i64 / 2 - bar_width / 2;

    let health = if health > 0 { health } else { health_max };
    let filled = (bar_width as f64 * (health as f64 / health_max as f64)).round() as i64;

    for x in x0..x0 + bar_width {
        for y in bar_y..bar_y + bar_height {
            if x < 0 || y < 0 || x >= holder.width() as i64 || y >= holder.height() as i64 {
                continue;
            }
            let on_edge =
                x == x0 || x == x0 + bar_width - 1 || y == bar_y || y == bar_y + bar_height - 1;
            if x - x0 < filled {
                holder.put_pixel(x as u32, y as u32, color);
            } else if on_edge {
                holder.put_pixel(x as u32, y as u32, COLOR_HP_OUTLINE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paste_centered_clips_gracefully() {
        let mut canvas = RgbaImage::new(20, 20);
        let dot = filled_circle(6, COLOR_ENEMY);
        paste_centered(&mut canvas, &dot, -2, -2);
        paste_centered(&mut canvas, &dot, 10, 10);
        assert!(canvas.get_pixel(10, 10)[3] > 0);
    }

    #[test]
    fn rotate_expand_preserves_content() {
        let mut img = RgbaImage::new(10, 4);
        for pixel in img.pixels_mut() {
            *pixel = COLOR_ALLY;
        }
        let rotated = rotate_expand(&img, 90.0);
        assert!(rotated.width() >= 10 && rotated.height() >= 10);
        let opaque = rotated.pixels().filter(|p| p[3] > 128).count();
        assert!(opaque >= 30, "rotation lost most pixels: {opaque}");
    }

    #[test]
    fn angular_wipe_half() {
        let bg = filled_circle(40, COLOR_ALLY);
        let fg = filled_circle(40, COLOR_ENEMY);
        let wiped = angular_wipe(&bg, &fg, 0.5);
        // right half is fg (clockwise from 12 o'clock), left half bg
        assert_eq!(wiped.get_pixel(30, 20), &COLOR_ENEMY);
        assert_eq!(wiped.get_pixel(8, 20), &COLOR_ALLY);
    }

    #[test]
    fn opacity_scales_alpha_only() {
        let img = filled_circle(8, COLOR_ENEMY);
        let faded = with_opacity(&img, 0.25);
        let center = faded.get_pixel(4, 4);
        assert_eq!(center[0], COLOR_ENEMY[0]);
        assert!(center[3] < 80);
    }

    #[test]
    fn health_bar_full_when_untouched() {
        let mut holder = RgbaImage::new(100, 80);
        draw_health_bar(&mut holder, 0, 10_000, COLOR_ALLY);
        // the leftmost bar pixel is filled even though health is unset
        assert_eq!(holder.get_pixel(25, 66), &COLOR_ALLY);
        assert_eq!(holder.get_pixel(74, 66), &COLOR_ALLY);
    }

    #[test]
    fn health_bar_partial_fill() {
        let mut holder = RgbaImage::new(100, 80);
        draw_health_bar(&mut holder, 5_000, 10_000, COLOR_ENEMY);
        assert_eq!(holder.get_pixel(26, 66), &COLOR_ENEMY);
        // beyond the midpoint only the outline remains
        assert_eq!(holder.get_pixel(70, 66)[3], 0);
        assert_eq!(holder.get_pixel(74, 65), &COLOR_HP_OUTLINE);
    }

}
