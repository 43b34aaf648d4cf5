//! Perceptual frame comparison
//!
//! Two frames are compared pixel by pixel in YIQ space; a pixel counts as
//! different when its weighted color delta exceeds the tolerance. The result
//! is the percentage of differing pixels over the union of both frames, so
//! frames of different sizes never compare as identical.

use crate::error::Result;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

/// Largest possible YIQ delta between two opaque colors
const MAX_YIQ_DELTA: f64 = 35215.0;

/// Decode PNG bytes into an RGBA buffer
pub fn decode_png(bytes: &[u8]) -> Result<RgbaImage> {
    let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
    Ok(img.to_rgba8())
}

/// Encode an RGBA buffer as PNG bytes
pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img.clone()).write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// A fully white opaque frame, what an empty document paints.
pub fn blank_frame(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]))
}

/// Percentage (0.0 - 100.0) of pixels that differ beyond `tolerance`.
///
/// `tolerance` is on the 0.0 - 1.0 scale; 0.1 ignores anti-aliasing noise and
/// sub-perceptual color shifts.
pub fn diff_percent(a: &RgbaImage, b: &RgbaImage, tolerance: f64) -> f64 {
    let width = a.width().max(b.width());
    let height = a.height().max(b.height());
    let total = u64::from(width) * u64::from(height);
    if total == 0 {
        return 0.0;
    }

    let max_delta = MAX_YIQ_DELTA * tolerance * tolerance;
    let overlap_w = a.width().min(b.width());
    let overlap_h = a.height().min(b.height());

    let mut different = total - u64::from(overlap_w) * u64::from(overlap_h);
    for y in 0..overlap_h {
        for x in 0..overlap_w {
            if color_delta(a.get_pixel(x, y), b.get_pixel(x, y)) > max_delta {
                different += 1;
            }
        }
    }

    different as f64 * 100.0 / total as f64
}

// Blend against white so transparent pixels compare like the page background.
fn blend(channel: u8, alpha: f64) -> f64 {
    255.0 + (f64::from(channel) - 255.0) * alpha
}

fn yiq(px: &Rgba<u8>) -> (f64, f64, f64) {
    let alpha = f64::from(px[3]) / 255.0;
    let r = blend(px[0], alpha);
    let g = blend(px[1], alpha);
    let b = blend(px[2], alpha);
    (
        r * 0.298_895_31 + g * 0.586_622_47 + b * 0.114_482_23,
        r * 0.595_977_99 - g * 0.274_176_10 - b * 0.321_801_89,
        r * 0.211_470_17 - g * 0.522_617_11 + b * 0.311_146_94,
    )
}

fn color_delta(a: &Rgba<u8>, b: &Rgba<u8>) -> f64 {
    if a == b {
        return 0.0;
    }
    let (y1, i1, q1) = yiq(a);
    let (y2, i2, q2) = yiq(b);
    let (dy, di, dq) = (y1 - y2, i1 - i2, q1 - q2);
    0.5053 * dy * dy + 0.299 * di * di + 0.1957 * dq * dq
}
