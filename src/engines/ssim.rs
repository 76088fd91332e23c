//! Structural similarity adapter.
//!
//! Pads the pair to a common frame, downscales very large captures, and
//! scores grayscale MSSIM via the `image-compare` crate.

use std::path::Path;

use image_compare::Algorithm;

use super::{EngineKind, EngineOptions, EngineResult};
use crate::image_ops;

/// Captures with a side beyond this are downscaled before scoring; MSSIM
/// windows carry no extra information at full-page resolutions.
const DOWNSCALE_LIMIT: u32 = 3000;

pub fn compare(
    baseline_path: &Path,
    test_path: &Path,
    _diff_prefix: &Path,
    _options: &EngineOptions,
) -> EngineResult {
    let kind = EngineKind::Ssim;
    let baseline = match image_ops::decode_png(baseline_path) {
        Ok(img) => img,
        Err(e) => return EngineResult::failure(kind, e.to_string()),
    };
    let test = match image_ops::decode_png(test_path) {
        Ok(img) => img,
        Err(e) => return EngineResult::failure(kind, e.to_string()),
    };

    let width = baseline.width().max(test.width());
    let height = baseline.height().max(test.height());
    let mut baseline = image_ops::pad(&baseline, width, height);
    let mut test = image_ops::pad(&test, width, height);

    if width > DOWNSCALE_LIMIT || height > DOWNSCALE_LIMIT {
        baseline = image_ops::downscale_to_fit(&baseline, DOWNSCALE_LIMIT);
        test = image_ops::downscale_to_fit(&test, DOWNSCALE_LIMIT);
    }

    let gray_baseline = image::imageops::grayscale(&baseline);
    let gray_test = image::imageops::grayscale(&test);

    match image_compare::gray_similarity_structure(
        &Algorithm::MSSIMSimple,
        &gray_baseline,
        &gray_test,
    ) {
        Ok(similarity) => {
            let score = similarity.score.clamp(0.0, 1.0);
            EngineResult {
                engine: kind,
                similarity: score,
                diff_percent: (1.0 - score) * 100.0,
                diff_pixels: None,
                diff_image_path: None,
                error: None,
            }
        }
        Err(e) => EngineResult::failure(kind, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn write_solid(path: &Path, w: u32, h: u32, px: [u8; 4]) {
        RgbaImage::from_pixel(w, h, Rgba(px)).save(path).unwrap();
    }

    #[test]
    fn identical_images_score_one() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        write_solid(&a, 64, 64, [200, 10, 10, 255]);
        write_solid(&b, 64, 64, [200, 10, 10, 255]);

        let result = compare(&a, &b, &dir.path().join("pair.png"), &EngineOptions::default());
        assert!(result.is_ok(), "{:?}", result.error);
        assert!(result.similarity > 0.999, "score {}", result.similarity);
        assert!(result.diff_percent < 0.1);
    }

    #[test]
    fn contrasting_images_score_low() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        write_solid(&a, 64, 64, [255, 255, 255, 255]);
        write_solid(&b, 64, 64, [0, 0, 0, 255]);

        let result = compare(&a, &b, &dir.path().join("pair.png"), &EngineOptions::default());
        assert!(result.is_ok(), "{:?}", result.error);
        assert!(result.similarity < 0.5, "score {}", result.similarity);
    }

    #[test]
    fn mismatched_sizes_are_padded_not_errored() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        write_solid(&a, 64, 48, [128, 128, 128, 255]);
        write_solid(&b, 48, 64, [128, 128, 128, 255]);

        let result = compare(&a, &b, &dir.path().join("pair.png"), &EngineOptions::default());
        assert!(result.is_ok(), "{:?}", result.error);
    }
}
