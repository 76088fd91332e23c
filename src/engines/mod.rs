//! Engine adapters.
//!
//! Every engine implements the same contract: compare two PNGs on disk,
//! return an [`EngineResult`]. Failures are folded into the result's
//! `error` field so one broken engine never takes down a comparison.

pub mod odiff;
pub mod phash;
pub mod pixelmatch;
pub mod ssim;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::AbortSignal;
use crate::config::SizeNormalization;

/// The diff engines known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Pixelmatch,
    Odiff,
    Ssim,
    Phash,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Pixelmatch => "pixelmatch",
            EngineKind::Odiff => "odiff",
            EngineKind::Ssim => "ssim",
            EngineKind::Phash => "phash",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one engine over one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResult {
    pub engine: EngineKind,
    /// Agreement in `[0, 1]`; 1 means identical under this engine.
    pub similarity: f64,
    pub diff_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_pixels: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_image_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineResult {
    pub fn failure(engine: EngineKind, message: impl Into<String>) -> Self {
        Self {
            engine,
            similarity: 0.0,
            diff_percent: 0.0,
            diff_pixels: None,
            diff_image_path: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Shared knobs handed to every adapter.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Per-pixel sensitivity in `[0, 1]`.
    pub threshold: f64,
    /// Tolerate anti-aliasing artifacts in the pixel pass.
    pub anti_aliasing: bool,
    /// Background blend factor for unchanged pixels in diff output.
    pub alpha: f64,
    /// RGB highlight for differing pixels.
    pub diff_color: [u8; 3],
    pub size_normalization: SizeNormalization,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            anti_aliasing: true,
            alpha: 0.1,
            diff_color: [255, 0, 0],
            size_normalization: SizeNormalization::Pad,
        }
    }
}

/// Run the requested secondary engines concurrently over one pair.
///
/// The inline pixel pass already ran by the time this is called, so
/// `kinds` normally excludes `Pixelmatch`. odiff is silently dropped when
/// its binary cannot be located. Results come back in `kinds` order.
pub async fn run_secondary_engines(
    baseline: &Path,
    test: &Path,
    diff_prefix: &Path,
    kinds: &[EngineKind],
    options: &EngineOptions,
    abort: &AbortSignal,
) -> Vec<EngineResult> {
    let mut futures = Vec::new();
    for &kind in kinds {
        if kind == EngineKind::Odiff && odiff::resolved_binary().is_none() {
            debug!("odiff binary not found, skipping engine");
            continue;
        }
        let baseline = baseline.to_path_buf();
        let test = test.to_path_buf();
        let prefix = diff_prefix.to_path_buf();
        let options = options.clone();
        let abort = abort.clone();
        futures.push(async move {
            if abort.is_aborted() {
                return EngineResult::failure(kind, "aborted");
            }
            run_one(kind, &baseline, &test, &prefix, &options).await
        });
    }
    futures::future::join_all(futures).await
}

async fn run_one(
    kind: EngineKind,
    baseline: &Path,
    test: &Path,
    diff_prefix: &Path,
    options: &EngineOptions,
) -> EngineResult {
    match kind {
        EngineKind::Odiff => odiff::compare(baseline, test, diff_prefix, options).await,
        EngineKind::Pixelmatch => {
            run_blocking(kind, baseline, test, diff_prefix, options, pixelmatch::compare).await
        }
        EngineKind::Ssim => {
            run_blocking(kind, baseline, test, diff_prefix, options, ssim::compare).await
        }
        EngineKind::Phash => {
            run_blocking(kind, baseline, test, diff_prefix, options, phash::compare).await
        }
    }
}

/// Pixel loops run on the blocking pool so they never hold up the
/// scheduler; a panicked engine task becomes an error result.
async fn run_blocking(
    kind: EngineKind,
    baseline: &Path,
    test: &Path,
    diff_prefix: &Path,
    options: &EngineOptions,
    f: fn(&Path, &Path, &Path, &EngineOptions) -> EngineResult,
) -> EngineResult {
    let baseline = baseline.to_path_buf();
    let test = test.to_path_buf();
    let prefix = diff_prefix.to_path_buf();
    let options = options.clone();
    match tokio::task::spawn_blocking(move || f(&baseline, &test, &prefix, &options)).await {
        Ok(result) => result,
        Err(e) => EngineResult::failure(kind, format!("engine task panicked: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_result_zeroes_scores() {
        let result = EngineResult::failure(EngineKind::Ssim, "boom");
        assert_eq!(result.similarity, 0.0);
        assert_eq!(result.diff_percent, 0.0);
        assert!(!result.is_ok());
    }

    #[test]
    fn engine_kind_serde_is_lowercase() {
        let json = serde_json::to_string(&EngineKind::Pixelmatch).unwrap();
        assert_eq!(json, "\"pixelmatch\"");
        let parsed: EngineKind = serde_json::from_str("\"phash\"").unwrap();
        assert_eq!(parsed, EngineKind::Phash);
        assert!(serde_json::from_str::<EngineKind>("\"magic\"").is_err());
    }
}
