//! 64-bit perceptual hash adapter.
//!
//! Images are reduced to 32×32 grayscale, transformed with a 2D DCT-II,
//! and the lowest 8×8 frequencies (minus the DC term) are thresholded
//! against their median. Similarity is `1 - hamming/64`, which makes the
//! engine robust to uniform shifts in brightness and compression noise.

use std::path::Path;

use image::GrayImage;

use super::{EngineKind, EngineOptions, EngineResult};
use crate::image_ops;

const HASH_INPUT: u32 = 32;
const HASH_GRID: usize = 8;
pub const HASH_BITS: u32 = 64;

pub fn compare(
    baseline_path: &Path,
    test_path: &Path,
    _diff_prefix: &Path,
    _options: &EngineOptions,
) -> EngineResult {
    let kind = EngineKind::Phash;
    let baseline = match hash_file(baseline_path) {
        Ok(hash) => hash,
        Err(e) => return EngineResult::failure(kind, e),
    };
    let test = match hash_file(test_path) {
        Ok(hash) => hash,
        Err(e) => return EngineResult::failure(kind, e),
    };

    let distance = hamming_distance(baseline, test);
    let similarity = 1.0 - distance as f64 / HASH_BITS as f64;
    EngineResult {
        engine: kind,
        similarity,
        diff_percent: (1.0 - similarity) * 100.0,
        diff_pixels: None,
        diff_image_path: None,
        error: None,
    }
}

fn hash_file(path: &Path) -> Result<u64, String> {
    let img = image_ops::decode_png(path).map_err(|e| e.to_string())?;
    let small = image_ops::resize_bilinear(&img, HASH_INPUT, HASH_INPUT);
    Ok(perceptual_hash(&image::imageops::grayscale(&small)))
}

/// Hash a 32×32 grayscale tile into 64 bits.
pub fn perceptual_hash(gray: &GrayImage) -> u64 {
    debug_assert_eq!(gray.dimensions(), (HASH_INPUT, HASH_INPUT));
    let n = HASH_INPUT as usize;
    let mut signal = vec![0.0f64; n * n];
    for (x, y, px) in gray.enumerate_pixels() {
        signal[y as usize * n + x as usize] = px.0[0] as f64;
    }

    let spectrum = dct_2d(&signal, n);

    // Lowest 8×8 block carries the structural signature; the DC term is
    // dropped so overall brightness does not dominate.
    let mut coefficients = Vec::with_capacity(HASH_GRID * HASH_GRID - 1);
    for v in 0..HASH_GRID {
        for u in 0..HASH_GRID {
            if u == 0 && v == 0 {
                continue;
            }
            coefficients.push(spectrum[v * n + u]);
        }
    }

    let median = median_of(&coefficients);
    let mut hash = 0u64;
    for (bit, &coefficient) in coefficients.iter().enumerate() {
        if coefficient > median {
            hash |= 1 << bit;
        }
    }
    // 63 frequency bits; the DC slot stays zero.
    hash
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

fn dct_2d(signal: &[f64], n: usize) -> Vec<f64> {
    // Separable DCT-II: rows first, then columns.
    let mut rows = vec![0.0f64; n * n];
    for y in 0..n {
        let row = &signal[y * n..(y + 1) * n];
        let transformed = dct_1d(row);
        rows[y * n..(y + 1) * n].copy_from_slice(&transformed);
    }

    let mut out = vec![0.0f64; n * n];
    let mut column = vec![0.0f64; n];
    for x in 0..n {
        for y in 0..n {
            column[y] = rows[y * n + x];
        }
        let transformed = dct_1d(&column);
        for y in 0..n {
            out[y * n + x] = transformed[y];
        }
    }
    out
}

fn dct_1d(input: &[f64]) -> Vec<f64> {
    let n = input.len();
    let mut out = vec![0.0f64; n];
    let factor = std::f64::consts::PI / n as f64;
    for (k, slot) in out.iter_mut().enumerate() {
        let mut sum = 0.0;
        for (i, &value) in input.iter().enumerate() {
            sum += value * ((i as f64 + 0.5) * k as f64 * factor).cos();
        }
        *slot = sum;
    }
    out
}

fn median_of(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba, RgbaImage};

    fn gradient_tile() -> GrayImage {
        GrayImage::from_fn(HASH_INPUT, HASH_INPUT, |x, y| Luma([((x * 4 + y * 3) % 256) as u8]))
    }

    #[test]
    fn hash_is_deterministic() {
        let tile = gradient_tile();
        assert_eq!(perceptual_hash(&tile), perceptual_hash(&tile));
    }

    #[test]
    fn hash_survives_brightness_shift() {
        let tile = gradient_tile();
        let brighter = GrayImage::from_fn(HASH_INPUT, HASH_INPUT, |x, y| {
            Luma([tile.get_pixel(x, y).0[0].saturating_add(20)])
        });
        let distance = hamming_distance(perceptual_hash(&tile), perceptual_hash(&brighter));
        assert!(distance <= 6, "distance {distance}");
    }

    #[test]
    fn distinct_structures_hash_apart() {
        let horizontal = GrayImage::from_fn(HASH_INPUT, HASH_INPUT, |_, y| {
            Luma([if y < HASH_INPUT / 2 { 0 } else { 255 }])
        });
        let vertical = GrayImage::from_fn(HASH_INPUT, HASH_INPUT, |x, _| {
            Luma([if x < HASH_INPUT / 2 { 0 } else { 255 }])
        });
        let distance =
            hamming_distance(perceptual_hash(&horizontal), perceptual_hash(&vertical));
        assert!(distance > 10, "distance {distance}");
    }

    #[test]
    fn adapter_scores_identical_files_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        let img = RgbaImage::from_fn(64, 64, |x, y| {
            Rgba([(x * 3) as u8, (y * 3) as u8, 90, 255])
        });
        img.save(&a).unwrap();
        img.save(&b).unwrap();

        let result = compare(&a, &b, &dir.path().join("pair.png"), &EngineOptions::default());
        assert!(result.is_ok());
        assert_eq!(result.similarity, 1.0);
        assert_eq!(result.diff_percent, 0.0);
    }
}
