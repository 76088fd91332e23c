//! Image decoding and size reconciliation.
//!
//! Everything here operates on owned RGBA buffers; engine adapters borrow
//! the normalized frames and never touch the originals.

use std::path::Path;

use image::imageops::FilterType;
use image::{Rgba, RgbaImage};

use crate::config::SizeNormalization;
use crate::error::{Result, VrtError};

/// Fill color for padded regions: neutral gray, fully opaque.
pub const PAD_FILL: Rgba<u8> = Rgba([128, 128, 128, 255]);

/// Decode a PNG from disk into an RGBA buffer.
pub fn decode_png(path: &Path) -> Result<RgbaImage> {
    let img = image::open(path).map_err(|e| {
        VrtError::Decode(format!("{}: {e}", path.display()))
    })?;
    Ok(img.to_rgba8())
}

/// Encode an RGBA buffer as PNG at `path`.
pub fn write_png(img: &RgbaImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    img.save(path)
        .map_err(|e| VrtError::Io(format!("{}: {e}", path.display())))
}

/// Grow `img` to `(width, height)`, placing the original at the origin
/// and filling the gap with [`PAD_FILL`]. A no-op when already at size.
pub fn pad(img: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if img.width() == width && img.height() == height {
        return img.clone();
    }
    let mut out = RgbaImage::from_pixel(width, height, PAD_FILL);
    for (x, y, pixel) in img.enumerate_pixels() {
        if x < width && y < height {
            out.put_pixel(x, y, *pixel);
        }
    }
    out
}

/// Keep the top-left `(width, height)` region of `img`.
pub fn crop(img: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if img.width() == width && img.height() == height {
        return img.clone();
    }
    let width = width.min(img.width());
    let height = height.min(img.height());
    let mut out = RgbaImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            out.put_pixel(x, y, *img.get_pixel(x, y));
        }
    }
    out
}

/// Nearest-neighbor resize, used for diff normalization where new colors
/// must not be invented.
pub fn resize_nearest(img: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if img.width() == width && img.height() == height {
        return img.clone();
    }
    image::imageops::resize(img, width, height, FilterType::Nearest)
}

/// Bilinear resize, used for AI payloads and SSIM downscaling.
pub fn resize_bilinear(img: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if img.width() == width && img.height() == height {
        return img.clone();
    }
    image::imageops::resize(img, width, height, FilterType::Triangle)
}

/// Downscale so neither side exceeds `max_dim`, preserving aspect ratio.
/// Returns a clone when already within bounds.
pub fn downscale_to_fit(img: &RgbaImage, max_dim: u32) -> RgbaImage {
    let (w, h) = img.dimensions();
    if w <= max_dim && h <= max_dim {
        return img.clone();
    }
    let scale = max_dim as f64 / w.max(h) as f64;
    let nw = ((w as f64 * scale).round() as u32).max(1);
    let nh = ((h as f64 * scale).round() as u32).max(1);
    resize_bilinear(img, nw, nh)
}

/// Bring two images onto a common frame per the configured policy.
/// Returns the normalized pair plus the target dimensions.
pub fn normalize_pair(
    a: &RgbaImage,
    b: &RgbaImage,
    mode: SizeNormalization,
) -> (RgbaImage, RgbaImage, (u32, u32)) {
    let (aw, ah) = a.dimensions();
    let (bw, bh) = b.dimensions();
    match mode {
        SizeNormalization::Pad => {
            let w = aw.max(bw);
            let h = ah.max(bh);
            (pad(a, w, h), pad(b, w, h), (w, h))
        }
        SizeNormalization::Crop => {
            let w = aw.min(bw);
            let h = ah.min(bh);
            (crop(a, w, h), crop(b, w, h), (w, h))
        }
        SizeNormalization::Resize => {
            let w = aw.min(bw);
            let h = ah.min(bh);
            (resize_nearest(a, w, h), resize_nearest(b, w, h), (w, h))
        }
    }
}

/// Trim blank trailing rows from the taller of a pair.
///
/// Trims only when every extra row is pixel-uniform with its own first
/// pixel; page-length changes that append real content are left alone.
/// Returns the (possibly trimmed) pair.
pub fn trim_uniform_trailing_rows(a: RgbaImage, b: RgbaImage) -> (RgbaImage, RgbaImage) {
    let (ah, bh) = (a.height(), b.height());
    if ah == bh || a.width() != b.width() {
        return (a, b);
    }
    if ah > bh {
        match trim_to(&a, bh) {
            Some(trimmed) => (trimmed, b),
            None => (a, b),
        }
    } else {
        match trim_to(&b, ah) {
            Some(trimmed) => (a, trimmed),
            None => (a, b),
        }
    }
}

fn trim_to(img: &RgbaImage, target_height: u32) -> Option<RgbaImage> {
    for y in target_height..img.height() {
        let first = img.get_pixel(0, y);
        for x in 0..img.width() {
            if img.get_pixel(x, y) != first {
                return None;
            }
        }
    }
    Some(crop(img, img.width(), target_height))
}

/// Parse `#RRGGBB` into RGB bytes. Every byte must be valid hex.
pub fn parse_hex_color(raw: &str) -> Option<[u8; 3]> {
    let hex = raw.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some([r, g, b])
}

/// Diff pixel count as a percentage of total pixels. Zero-pixel frames
/// yield zero rather than NaN.
pub fn calculate_diff_percentage(diff_pixels: u64, total_pixels: u64) -> f64 {
    if total_pixels == 0 {
        0.0
    } else {
        (diff_pixels as f64 / total_pixels as f64) * 100.0
    }
}

/// Stable placeholder written when a capture fails, so the comparator's
/// dataset stays complete. Solid white at the requested viewport.
pub fn blank_placeholder(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_pixel(width.max(1), height.max(1), Rgba([255, 255, 255, 255]))
}
