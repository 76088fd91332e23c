//! Pixel-level diff with perceptual color distance and anti-aliasing
//! detection.
//!
//! Colors are compared in YIQ space after alpha-blending onto white;
//! pixels whose delta stays under `35215 * threshold^2` count as equal.
//! When anti-aliasing tolerance is on, artifacts along edges are drawn in
//! a separate color and excluded from the diff count.

use std::path::Path;

use image::{Rgba, RgbaImage};

use super::{EngineKind, EngineOptions, EngineResult};
use crate::image_ops;

const AA_COLOR: [u8; 3] = [255, 255, 0];

#[derive(Debug)]
pub struct PixelmatchOutcome {
    pub diff_pixels: u64,
    pub diff_image: RgbaImage,
}

/// Diff two equally-sized RGBA buffers, producing the count of differing
/// pixels and the highlighted diff image.
///
/// Panics are impossible for equal dimensions; callers normalize first.
pub fn diff_buffers(
    baseline: &RgbaImage,
    test: &RgbaImage,
    options: &EngineOptions,
) -> PixelmatchOutcome {
    debug_assert_eq!(baseline.dimensions(), test.dimensions());
    let (width, height) = baseline.dimensions();
    let mut diff_image = RgbaImage::new(width, height);
    let include_aa = !options.anti_aliasing;
    let max_delta = 35215.0 * options.threshold * options.threshold;
    let mut diff_pixels = 0u64;

    for y in 0..height {
        for x in 0..width {
            let a = baseline.get_pixel(x, y);
            let b = test.get_pixel(x, y);

            if a == b {
                draw_gray(&mut diff_image, x, y, a.0, options.alpha);
                continue;
            }

            let delta = color_delta(a.0, b.0, false).abs();
            if delta > max_delta {
                let is_aa = !include_aa
                    && (antialiased(baseline, x, y, test) || antialiased(test, x, y, baseline));
                if is_aa {
                    put_rgb(&mut diff_image, x, y, AA_COLOR);
                } else {
                    put_rgb(&mut diff_image, x, y, options.diff_color);
                    diff_pixels += 1;
                }
            } else {
                draw_gray(&mut diff_image, x, y, a.0, options.alpha);
            }
        }
    }

    PixelmatchOutcome {
        diff_pixels,
        diff_image,
    }
}

/// Adapter entry: decode, normalize, diff, write `<prefix>-pixelmatch.png`.
pub fn compare(
    baseline_path: &Path,
    test_path: &Path,
    diff_prefix: &Path,
    options: &EngineOptions,
) -> EngineResult {
    let kind = EngineKind::Pixelmatch;
    let baseline = match image_ops::decode_png(baseline_path) {
        Ok(img) => img,
        Err(e) => return EngineResult::failure(kind, e.to_string()),
    };
    let test = match image_ops::decode_png(test_path) {
        Ok(img) => img,
        Err(e) => return EngineResult::failure(kind, e.to_string()),
    };

    let (baseline, test, (w, h)) =
        image_ops::normalize_pair(&baseline, &test, options.size_normalization);
    let outcome = diff_buffers(&baseline, &test, options);
    let total = w as u64 * h as u64;
    let diff_percent = image_ops::calculate_diff_percentage(outcome.diff_pixels, total);

    let diff_path = side_file(diff_prefix, "pixelmatch");
    if let Err(e) = image_ops::write_png(&outcome.diff_image, &diff_path) {
        return EngineResult::failure(kind, e.to_string());
    }

    EngineResult {
        engine: kind,
        similarity: (1.0 - diff_percent / 100.0).max(0.0),
        diff_percent,
        diff_pixels: Some(outcome.diff_pixels),
        diff_image_path: Some(diff_path),
        error: None,
    }
}

pub(super) fn side_file(diff_prefix: &Path, engine: &str) -> std::path::PathBuf {
    let mut name = diff_prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(stripped) = name.strip_suffix(".png") {
        name = stripped.to_string();
    }
    diff_prefix.with_file_name(format!("{name}-{engine}.png"))
}

fn put_rgb(img: &mut RgbaImage, x: u32, y: u32, rgb: [u8; 3]) {
    img.put_pixel(x, y, Rgba([rgb[0], rgb[1], rgb[2], 255]));
}

fn draw_gray(img: &mut RgbaImage, x: u32, y: u32, px: [u8; 4], alpha: f64) {
    let y_lum = rgb2y(blend_to_white(px));
    let val = (255.0 + (y_lum - 255.0) * alpha * px[3] as f64 / 255.0)
        .clamp(0.0, 255.0) as u8;
    img.put_pixel(x, y, Rgba([val, val, val, 255]));
}

fn blend_to_white(px: [u8; 4]) -> [f64; 3] {
    let a = px[3] as f64 / 255.0;
    let blend = |c: u8| 255.0 + (c as f64 - 255.0) * a;
    [blend(px[0]), blend(px[1]), blend(px[2])]
}

fn rgb2y([r, g, b]: [f64; 3]) -> f64 {
    r * 0.298_895_31 + g * 0.586_622_47 + b * 0.114_482_23
}

fn rgb2i([r, g, b]: [f64; 3]) -> f64 {
    r * 0.595_977_99 - g * 0.274_176_10 - b * 0.321_801_89
}

fn rgb2q([r, g, b]: [f64; 3]) -> f64 {
    r * 0.211_470_17 - g * 0.522_617_11 + b * 0.311_146_94
}

/// Perceptual distance between two pixels; negative when the first pixel
/// is darker (the sign matters only for anti-aliasing detection).
fn color_delta(p1: [u8; 4], p2: [u8; 4], y_only: bool) -> f64 {
    if p1 == p2 {
        return 0.0;
    }
    let c1 = blend_to_white(p1);
    let c2 = blend_to_white(p2);

    let y1 = rgb2y(c1);
    let y2 = rgb2y(c2);
    let y = y1 - y2;
    if y_only {
        return y;
    }

    let i = rgb2i(c1) - rgb2i(c2);
    let q = rgb2q(c1) - rgb2q(c2);
    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;
    if y1 > y2 {
        -delta
    } else {
        delta
    }
}

/// Check whether `(x, y)` in `img` looks like an anti-aliasing artifact:
/// it sits on a luminance gradient whose extremes have many identical
/// siblings in both images.
fn antialiased(img: &RgbaImage, x: u32, y: u32, other: &RgbaImage) -> bool {
    let (width, height) = img.dimensions();
    let x0 = x.saturating_sub(1);
    let y0 = y.saturating_sub(1);
    let x2 = (x + 1).min(width - 1);
    let y2 = (y + 1).min(height - 1);
    let center = img.get_pixel(x, y).0;

    let mut zeroes: u32 = if x == x0 || x == x2 || y == y0 || y == y2 {
        1
    } else {
        0
    };
    let mut min = 0.0f64;
    let mut max = 0.0f64;
    let mut min_pos = (x, y);
    let mut max_pos = (x, y);

    for ny in y0..=y2 {
        for nx in x0..=x2 {
            if nx == x && ny == y {
                continue;
            }
            let delta = color_delta(center, img.get_pixel(nx, ny).0, true);
            if delta == 0.0 {
                zeroes += 1;
                if zeroes > 2 {
                    return false;
                }
            } else if delta < min {
                min = delta;
                min_pos = (nx, ny);
            } else if delta > max {
                max = delta;
                max_pos = (nx, ny);
            }
        }
    }

    if min == 0.0 || max == 0.0 {
        return false;
    }

    (has_many_siblings(img, min_pos.0, min_pos.1)
        && has_many_siblings(other, min_pos.0, min_pos.1))
        || (has_many_siblings(img, max_pos.0, max_pos.1)
            && has_many_siblings(other, max_pos.0, max_pos.1))
}

/// Whether a pixel has 3+ adjacent pixels of exactly the same color.
fn has_many_siblings(img: &RgbaImage, x: u32, y: u32) -> bool {
    let (width, height) = img.dimensions();
    let x0 = x.saturating_sub(1);
    let y0 = y.saturating_sub(1);
    let x2 = (x + 1).min(width - 1);
    let y2 = (y + 1).min(height - 1);
    let center = img.get_pixel(x, y);

    let mut zeroes: u32 = if x == x0 || x == x2 || y == y0 || y == y2 {
        1
    } else {
        0
    };
    for ny in y0..=y2 {
        for nx in x0..=x2 {
            if nx == x && ny == y {
                continue;
            }
            if img.get_pixel(nx, ny) == center {
                zeroes += 1;
                if zeroes > 2 {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, px: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(px))
    }

    #[test]
    fn identical_images_have_zero_diff() {
        let img = solid(50, 50, [120, 130, 140, 255]);
        let outcome = diff_buffers(&img, &img, &EngineOptions::default());
        assert_eq!(outcome.diff_pixels, 0);
    }

    #[test]
    fn single_black_pixel_counts_once() {
        let baseline = solid(100, 100, [255, 255, 255, 255]);
        let mut test = baseline.clone();
        test.put_pixel(0, 0, Rgba([0, 0, 0, 255]));

        let outcome = diff_buffers(&baseline, &test, &EngineOptions::default());
        assert_eq!(outcome.diff_pixels, 1);
        // Diff pixel rendered in the highlight color.
        assert_eq!(outcome.diff_image.get_pixel(0, 0).0, [255, 0, 0, 255]);
    }

    #[test]
    fn sub_threshold_delta_not_counted() {
        let baseline = solid(10, 10, [100, 100, 100, 255]);
        let test = solid(10, 10, [101, 100, 100, 255]);
        let outcome = diff_buffers(&baseline, &test, &EngineOptions::default());
        assert_eq!(outcome.diff_pixels, 0);
    }

    #[test]
    fn adapter_writes_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let baseline_path = dir.path().join("a.png");
        let test_path = dir.path().join("b.png");
        solid(20, 20, [255, 255, 255, 255])
            .save(&baseline_path)
            .unwrap();
        let mut test = solid(20, 20, [255, 255, 255, 255]);
        test.put_pixel(3, 3, Rgba([0, 0, 0, 255]));
        test.save(&test_path).unwrap();

        let prefix = dir.path().join("pair.png");
        let result = compare(&baseline_path, &test_path, &prefix, &EngineOptions::default());
        assert!(result.is_ok(), "{:?}", result.error);
        assert_eq!(result.diff_pixels, Some(1));
        assert!(dir.path().join("pair-pixelmatch.png").exists());
    }

    #[test]
    fn missing_file_becomes_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let result = compare(
            &dir.path().join("nope.png"),
            &dir.path().join("also-nope.png"),
            &dir.path().join("pair.png"),
            &EngineOptions::default(),
        );
        assert!(result.error.is_some());
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn side_file_naming() {
        let path = side_file(Path::new("out/diffs/pair.png"), "pixelmatch");
        assert_eq!(path, Path::new("out/diffs/pair-pixelmatch.png"));
    }
}
