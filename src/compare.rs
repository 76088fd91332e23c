//! Single-pair comparator.
//!
//! Owns the decoded buffers for the lifetime of one baseline/test pair:
//! normalizes sizes, runs the inline pixel pass, fans out to the
//! secondary engines, consults the DOM differ and produces the tagged
//! [`ComparisonResult`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::AbortSignal;
use crate::config::{
    AiConfig, ConfidenceThresholds, EnginesConfig, SizeMismatchHandling, SizeNormalization,
    VrtConfig,
};
use crate::dom::DomSnapshot;
use crate::dom_diff::{self, DomDiffResult};
use crate::engines::{self, EngineKind, EngineOptions, EngineResult};
use crate::error::VrtError;
use crate::image_ops;
use crate::score::{
    self, AutoAction, AutoRule, ConfidenceInputs, ConfidenceScore, RuleContext, Severity,
    UnifiedConfidence,
};
use crate::vision::{self, AiAnalysis, VisionProvider};

/// Pages whose larger original dimension reaches this are "tall": pixel
/// count tolerances are disabled for them so a large page cannot absorb a
/// real regression inside an absolute pixel budget.
pub const TALL_PAGE_MIN_DIM: u32 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchReason {
    Exact,
    Tolerance,
}

/// Outcome of comparing one baseline/test pair.
///
/// Every variant carries both paths, even when one file is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum ComparisonResult {
    Match {
        baseline: PathBuf,
        test: PathBuf,
        pixel_diff: u64,
        diff_percentage: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssim: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phash: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff_path: Option<PathBuf>,
        match_reason: MatchReason,
    },
    Diff {
        baseline: PathBuf,
        test: PathBuf,
        pixel_diff: u64,
        diff_percentage: f64,
        diff_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssim: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phash: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_mismatch_error: Option<String>,
        engine_results: Vec<EngineResult>,
        unified_confidence: UnifiedConfidence,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dom_diff: Option<DomDiffResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ai_analysis: Option<AiAnalysis>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<ConfidenceScore>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_action: Option<AutoAction>,
    },
    NoBaseline {
        baseline: PathBuf,
        test: PathBuf,
    },
    NoTest {
        baseline: PathBuf,
        test: PathBuf,
    },
    Error {
        baseline: PathBuf,
        test: PathBuf,
        error: String,
    },
}

impl ComparisonResult {
    pub fn is_match(&self) -> bool {
        matches!(self, ComparisonResult::Match { .. })
    }

    pub fn is_diff(&self) -> bool {
        matches!(self, ComparisonResult::Diff { .. })
    }

    pub fn baseline(&self) -> &Path {
        match self {
            ComparisonResult::Match { baseline, .. }
            | ComparisonResult::Diff { baseline, .. }
            | ComparisonResult::NoBaseline { baseline, .. }
            | ComparisonResult::NoTest { baseline, .. }
            | ComparisonResult::Error { baseline, .. } => baseline,
        }
    }

    pub fn test(&self) -> &Path {
        match self {
            ComparisonResult::Match { test, .. }
            | ComparisonResult::Diff { test, .. }
            | ComparisonResult::NoBaseline { test, .. }
            | ComparisonResult::NoTest { test, .. }
            | ComparisonResult::Error { test, .. } => test,
        }
    }

    /// Differing pixel count; missing-file and error results report zero.
    pub fn pixel_diff(&self) -> u64 {
        match self {
            ComparisonResult::Match { pixel_diff, .. }
            | ComparisonResult::Diff { pixel_diff, .. } => *pixel_diff,
            _ => 0,
        }
    }

    pub fn diff_percentage(&self) -> f64 {
        match self {
            ComparisonResult::Match {
                diff_percentage, ..
            }
            | ComparisonResult::Diff {
                diff_percentage, ..
            } => *diff_percentage,
            _ => 0.0,
        }
    }

    pub fn has_phash(&self) -> bool {
        matches!(
            self,
            ComparisonResult::Match { phash: Some(_), .. }
                | ComparisonResult::Diff { phash: Some(_), .. }
        )
    }

    pub fn has_ai_analysis(&self) -> bool {
        matches!(
            self,
            ComparisonResult::Diff {
                ai_analysis: Some(_),
                ..
            }
        )
    }
}

/// AI triage wiring: config plus the deployment's provider.
#[derive(Clone)]
pub struct AiTriage {
    pub config: AiConfig,
    pub provider: Arc<dyn VisionProvider>,
}

/// Per-pair comparison settings.
#[derive(Debug, Clone)]
pub struct CompareOptions {
    pub threshold: f64,
    pub diff_color: [u8; 3],
    pub anti_aliasing: bool,
    pub compute_phash: bool,
    pub keep_diff_on_match: bool,
    pub size_normalization: SizeNormalization,
    pub size_mismatch_handling: SizeMismatchHandling,
    /// Diff percentage at or below this still matches.
    pub max_diff_percentage: Option<f64>,
    /// Absolute pixel budget; ignored for tall pages.
    pub max_diff_pixels: Option<u64>,
    pub baseline_snapshot: Option<DomSnapshot>,
    pub test_snapshot: Option<DomSnapshot>,
    pub engines: EnginesConfig,
    pub confidence_thresholds: ConfidenceThresholds,
    pub auto_rules: Vec<AutoRule>,
    /// Human-readable pair label, used for logging and AI prompts.
    pub label: String,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            diff_color: [255, 0, 0],
            anti_aliasing: true,
            compute_phash: true,
            keep_diff_on_match: false,
            size_normalization: SizeNormalization::Pad,
            size_mismatch_handling: SizeMismatchHandling::Strict,
            max_diff_percentage: None,
            max_diff_pixels: None,
            baseline_snapshot: None,
            test_snapshot: None,
            engines: EnginesConfig::default(),
            confidence_thresholds: ConfidenceThresholds::default(),
            auto_rules: Vec::new(),
            label: String::new(),
        }
    }
}

impl CompareOptions {
    /// Project-level defaults; callers layer per-pair settings on top.
    pub fn from_config(config: &VrtConfig) -> Self {
        let mut engines = config.engines.clone();
        if config.quick_mode {
            engines.odiff = false;
            engines.ssim = false;
            engines.phash = false;
        }
        Self {
            threshold: config.threshold,
            diff_color: image_ops::parse_hex_color(&config.diff_color).unwrap_or([255, 0, 0]),
            anti_aliasing: config.engines.anti_aliasing,
            compute_phash: engines.phash,
            keep_diff_on_match: config.keep_diff_on_match,
            max_diff_percentage: config.diff_threshold,
            engines,
            confidence_thresholds: config.confidence_thresholds,
            auto_rules: config.auto_rules.clone(),
            ..Default::default()
        }
    }

    fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            threshold: self.threshold,
            anti_aliasing: self.anti_aliasing,
            alpha: 0.1,
            diff_color: self.diff_color,
            size_normalization: self.size_normalization,
        }
    }
}

struct PixelPhase {
    pixel_diff: u64,
    diff_percentage: f64,
    size_mismatch: Option<String>,
    tall_page: bool,
}

/// Compare one pair per the configured policy.
pub async fn compare_pair(
    baseline_path: &Path,
    test_path: &Path,
    diff_path: &Path,
    options: &CompareOptions,
    ai: Option<&AiTriage>,
    abort: &AbortSignal,
) -> ComparisonResult {
    let baseline = baseline_path.to_path_buf();
    let test = test_path.to_path_buf();

    if !baseline.is_file() {
        return ComparisonResult::NoBaseline { baseline, test };
    }
    if !test.is_file() {
        return ComparisonResult::NoTest { baseline, test };
    }
    if abort.is_aborted() {
        return ComparisonResult::Error {
            baseline,
            test,
            error: "aborted".to_string(),
        };
    }

    let phase = {
        let baseline = baseline.clone();
        let test = test.clone();
        let diff_path = diff_path.to_path_buf();
        let engine_options = options.engine_options();
        let mode = options.size_normalization;
        tokio::task::spawn_blocking(move || {
            run_pixel_phase(&baseline, &test, &diff_path, &engine_options, mode)
        })
        .await
    };

    let phase = match phase {
        Ok(Ok(phase)) => phase,
        Ok(Err(e)) => {
            return ComparisonResult::Error {
                baseline,
                test,
                error: e.to_string(),
            }
        }
        Err(e) => {
            return ComparisonResult::Error {
                baseline,
                test,
                error: format!("comparison task panicked: {e}"),
            }
        }
    };

    let within_pct = options
        .max_diff_percentage
        .is_some_and(|max| phase.diff_percentage <= max);
    let within_pixels = !phase.tall_page
        && options
            .max_diff_pixels
            .is_some_and(|max| phase.pixel_diff <= max);
    let strict_mismatch = phase.size_mismatch.is_some()
        && options.size_mismatch_handling == SizeMismatchHandling::Strict;
    let pixel_match =
        (phase.pixel_diff == 0 || within_pct || within_pixels) && !strict_mismatch;

    // Semantic layer: text is never an invisible regression, so a DOM
    // text change promotes a pixel-level match to a diff.
    let dom_diff = match (&options.baseline_snapshot, &options.test_snapshot) {
        (Some(baseline_snapshot), Some(test_snapshot)) => {
            Some(dom_diff::diff_snapshots(baseline_snapshot, test_snapshot))
        }
        _ => None,
    };
    let text_changes = dom_diff
        .as_ref()
        .map(|d| d.summary.text_changed)
        .unwrap_or(0);

    if pixel_match && text_changes == 0 {
        return finish_match(baseline, test, diff_path, phase, options).await;
    }
    if pixel_match {
        debug!(
            "{}: pixel match promoted to diff by {} DOM text change(s)",
            options.label, text_changes
        );
    }

    finish_diff(baseline, test, diff_path, phase, dom_diff, options, ai, abort).await
}

fn run_pixel_phase(
    baseline_path: &Path,
    test_path: &Path,
    diff_path: &Path,
    engine_options: &EngineOptions,
    mode: SizeNormalization,
) -> Result<PixelPhase, VrtError> {
    let baseline = image_ops::decode_png(baseline_path)?;
    let test = image_ops::decode_png(test_path)?;

    let original_max = baseline
        .width()
        .max(baseline.height())
        .max(test.width())
        .max(test.height());
    let tall_page = original_max >= TALL_PAGE_MIN_DIM;

    // Page-length whitespace is trimmed before any policy kicks in; a
    // pair the trim fully reconciles does not count as a size mismatch.
    let (baseline, test) = image_ops::trim_uniform_trailing_rows(baseline, test);
    let size_mismatch = (baseline.dimensions() != test.dimensions()).then(|| {
        format!(
            "size mismatch: baseline {}x{}, test {}x{}",
            baseline.width(),
            baseline.height(),
            test.width(),
            test.height()
        )
    });
    let (baseline, test, (width, height)) = if baseline.dimensions() == test.dimensions() {
        let dims = baseline.dimensions();
        (baseline, test, dims)
    } else {
        image_ops::normalize_pair(&baseline, &test, mode)
    };

    let outcome = engines::pixelmatch::diff_buffers(&baseline, &test, engine_options);
    image_ops::write_png(&outcome.diff_image, diff_path)?;

    let total = width as u64 * height as u64;
    Ok(PixelPhase {
        pixel_diff: outcome.diff_pixels,
        diff_percentage: image_ops::calculate_diff_percentage(outcome.diff_pixels, total),
        size_mismatch,
        tall_page,
    })
}

async fn finish_match(
    baseline: PathBuf,
    test: PathBuf,
    diff_path: &Path,
    phase: PixelPhase,
    options: &CompareOptions,
) -> ComparisonResult {
    let match_reason = if phase.pixel_diff == 0 && phase.size_mismatch.is_none() {
        MatchReason::Exact
    } else {
        MatchReason::Tolerance
    };

    // An exact match is SSIM 1 by definition; under tolerance the score
    // is unknown without running the engine, so it stays unset.
    let ssim = (match_reason == MatchReason::Exact).then_some(1.0);

    let phash = if options.compute_phash {
        let result = engines::phash::compare(
            &baseline,
            &test,
            diff_path,
            &options.engine_options(),
        );
        result.is_ok().then_some(result.similarity)
    } else {
        None
    };

    let kept_diff = if options.keep_diff_on_match {
        Some(diff_path.to_path_buf())
    } else {
        match tokio::fs::remove_file(diff_path).await {
            Ok(()) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("failed to remove diff {}: {e}", diff_path.display());
                None
            }
        }
    };

    ComparisonResult::Match {
        baseline,
        test,
        pixel_diff: phase.pixel_diff,
        diff_percentage: phase.diff_percentage,
        ssim,
        phash,
        diff_path: kept_diff,
        match_reason,
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish_diff(
    baseline: PathBuf,
    test: PathBuf,
    diff_path: &Path,
    phase: PixelPhase,
    dom_diff: Option<DomDiffResult>,
    options: &CompareOptions,
    ai: Option<&AiTriage>,
    abort: &AbortSignal,
) -> ComparisonResult {
    let mut engine_results = vec![EngineResult {
        engine: EngineKind::Pixelmatch,
        similarity: (1.0 - phase.diff_percentage / 100.0).max(0.0),
        diff_percent: phase.diff_percentage,
        diff_pixels: Some(phase.pixel_diff),
        diff_image_path: Some(diff_path.to_path_buf()),
        error: None,
    }];

    let mut kinds = Vec::new();
    if options.engines.odiff {
        kinds.push(EngineKind::Odiff);
    }
    if options.engines.ssim {
        kinds.push(EngineKind::Ssim);
    }
    if options.engines.phash {
        kinds.push(EngineKind::Phash);
    }
    engine_results.extend(
        engines::run_secondary_engines(
            &baseline,
            &test,
            diff_path,
            &kinds,
            &options.engine_options(),
            abort,
        )
        .await,
    );

    let ssim = engine_score(&engine_results, EngineKind::Ssim);
    let phash = engine_score(&engine_results, EngineKind::Phash);
    let unified = score::unified_confidence(&engine_results, &options.engines);

    let ai_analysis = match ai {
        Some(triage) if triage.config.enabled => {
            vision::triage_pair(
                triage.provider.as_ref(),
                &triage.config,
                &options.label,
                &baseline,
                &test,
                Some(diff_path),
                phase.diff_percentage,
                abort,
            )
            .await
        }
        _ => None,
    };

    let dom_category = dom_diff.as_ref().and_then(|d| d.category);
    let dom_text_changes = dom_diff
        .as_ref()
        .map(|d| d.summary.text_changed)
        .unwrap_or(0);

    let confidence = score::weighted_confidence(
        &ConfidenceInputs {
            ssim,
            phash,
            pixel_diff_pct: phase.diff_percentage,
            ai: ai_analysis.as_ref().map(AiAnalysis::signals),
            dom_category,
            dom_text_changes,
        },
        &options.confidence_thresholds,
    );

    let severity = ai_analysis
        .as_ref()
        .map(|a| a.severity)
        .or_else(|| {
            dom_diff
                .as_ref()
                .and_then(|d| d.findings.iter().map(|f| f.severity).max())
        });
    let category = ai_analysis
        .as_ref()
        .map(|a| a.category)
        .or(dom_category);

    let auto_action = score::evaluate_rules(
        &options.auto_rules,
        &RuleContext {
            category,
            severity: severity.or(Some(Severity::Info)),
            confidence: confidence.score,
            pixel_diff_pct: phase.diff_percentage,
            ssim,
            phash,
            dom_text_changes,
        },
    );

    ComparisonResult::Diff {
        baseline,
        test,
        pixel_diff: phase.pixel_diff,
        diff_percentage: phase.diff_percentage,
        diff_path: diff_path.to_path_buf(),
        ssim,
        phash,
        size_mismatch_error: phase.size_mismatch.filter(|_| {
            options.size_mismatch_handling == SizeMismatchHandling::Strict
        }),
        engine_results,
        unified_confidence: unified,
        dom_diff,
        ai_analysis,
        confidence: Some(confidence),
        auto_action,
    }
}

fn engine_score(results: &[EngineResult], kind: EngineKind) -> Option<f64> {
    results
        .iter()
        .find(|r| r.engine == kind && r.is_ok())
        .map(|r| r.similarity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn write_solid(path: &Path, w: u32, h: u32, px: [u8; 4]) {
        RgbaImage::from_pixel(w, h, Rgba(px)).save(path).unwrap();
    }

    fn fast_options() -> CompareOptions {
        let mut options = CompareOptions::default();
        options.engines.odiff = false;
        options
    }

    #[tokio::test]
    async fn identical_pair_matches_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = dir.path().join("base.png");
        let test = dir.path().join("test.png");
        let diff = dir.path().join("diff.png");
        write_solid(&baseline, 50, 50, [17, 34, 51, 255]);
        write_solid(&test, 50, 50, [17, 34, 51, 255]);

        let result = compare_pair(
            &baseline,
            &test,
            &diff,
            &fast_options(),
            None,
            &AbortSignal::new(),
        )
        .await;

        match result {
            ComparisonResult::Match {
                pixel_diff,
                diff_percentage,
                ssim,
                match_reason,
                diff_path,
                ..
            } => {
                assert_eq!(pixel_diff, 0);
                assert_eq!(diff_percentage, 0.0);
                assert_eq!(ssim, Some(1.0));
                assert_eq!(match_reason, MatchReason::Exact);
                assert!(diff_path.is_none());
                assert!(!diff.exists(), "diff file should be cleaned up");
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_pixel_diff_reported() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = dir.path().join("base.png");
        let test = dir.path().join("test.png");
        let diff = dir.path().join("diff.png");
        write_solid(&baseline, 100, 100, [255, 255, 255, 255]);
        let mut img = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255]));
        img.put_pixel(0, 0, Rgba([0, 0, 0, 255]));
        img.save(&test).unwrap();

        let result = compare_pair(
            &baseline,
            &test,
            &diff,
            &fast_options(),
            None,
            &AbortSignal::new(),
        )
        .await;

        match result {
            ComparisonResult::Diff {
                pixel_diff,
                diff_percentage,
                engine_results,
                unified_confidence,
                ..
            } => {
                assert_eq!(pixel_diff, 1);
                assert!((diff_percentage - 0.01).abs() < 1e-9);
                let kinds: Vec<EngineKind> =
                    engine_results.iter().map(|r| r.engine).collect();
                assert!(kinds.contains(&EngineKind::Pixelmatch));
                assert!(kinds.contains(&EngineKind::Ssim));
                assert_eq!(unified_confidence.verdict, score::UnifiedVerdict::Pass);
                assert!(diff.exists());
            }
            other => panic!("expected diff, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tall_page_ignores_pixel_budget() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = dir.path().join("base.png");
        let test = dir.path().join("test.png");
        let diff = dir.path().join("diff.png");
        write_solid(&baseline, 10, 4000, [255, 255, 255, 255]);
        let mut img = RgbaImage::from_pixel(10, 4000, Rgba([255, 255, 255, 255]));
        img.put_pixel(5, 2000, Rgba([0, 0, 0, 255]));
        img.save(&test).unwrap();

        let mut options = fast_options();
        options.engines.ssim = false;
        options.engines.phash = false;
        options.max_diff_pixels = Some(1);

        let result = compare_pair(&baseline, &test, &diff, &options, None, &AbortSignal::new())
            .await;
        assert!(result.is_diff(), "tolerance must be disabled: {result:?}");
    }

    #[tokio::test]
    async fn short_page_pixel_budget_matches() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = dir.path().join("base.png");
        let test = dir.path().join("test.png");
        let diff = dir.path().join("diff.png");
        write_solid(&baseline, 50, 50, [255, 255, 255, 255]);
        let mut img = RgbaImage::from_pixel(50, 50, Rgba([255, 255, 255, 255]));
        img.put_pixel(10, 10, Rgba([0, 0, 0, 255]));
        img.save(&test).unwrap();

        let mut options = fast_options();
        options.max_diff_pixels = Some(1);

        let result = compare_pair(&baseline, &test, &diff, &options, None, &AbortSignal::new())
            .await;
        match result {
            ComparisonResult::Match {
                pixel_diff,
                match_reason,
                ssim,
                ..
            } => {
                assert_eq!(pixel_diff, 1);
                assert_eq!(match_reason, MatchReason::Tolerance);
                assert_eq!(ssim, None);
            }
            other => panic!("expected tolerance match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn trailing_whitespace_trimmed_to_match() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = dir.path().join("base.png");
        let test = dir.path().join("test.png");
        let diff = dir.path().join("diff.png");
        write_solid(&baseline, 10, 10, [255, 255, 255, 255]);
        write_solid(&test, 10, 12, [255, 255, 255, 255]);

        // Default (strict) handling: the trim reconciles the pair before
        // the mismatch policy sees it.
        let result = compare_pair(
            &baseline,
            &test,
            &diff,
            &fast_options(),
            None,
            &AbortSignal::new(),
        )
        .await;
        match result {
            ComparisonResult::Match { match_reason, .. } => {
                assert_eq!(match_reason, MatchReason::Exact);
            }
            other => panic!("expected trim + match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn strict_size_mismatch_forces_diff() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = dir.path().join("base.png");
        let test = dir.path().join("test.png");
        let diff = dir.path().join("diff.png");
        write_solid(&baseline, 10, 10, [255, 255, 255, 255]);
        // Wider, so the trailing-row trim cannot reconcile the pair.
        write_solid(&test, 12, 10, [255, 255, 255, 255]);

        let result = compare_pair(
            &baseline,
            &test,
            &diff,
            &fast_options(),
            None,
            &AbortSignal::new(),
        )
        .await;
        match result {
            ComparisonResult::Diff {
                size_mismatch_error,
                ..
            } => assert!(size_mismatch_error.is_some()),
            other => panic!("expected diff, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_files_reported_as_variants() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = dir.path().join("base.png");
        let test = dir.path().join("test.png");
        let diff = dir.path().join("diff.png");

        let result = compare_pair(
            &baseline,
            &test,
            &diff,
            &fast_options(),
            None,
            &AbortSignal::new(),
        )
        .await;
        assert!(matches!(result, ComparisonResult::NoBaseline { .. }));
        assert_eq!(result.pixel_diff(), 0);
        assert_eq!(result.diff_percentage(), 0.0);

        write_solid(&baseline, 5, 5, [0, 0, 0, 255]);
        let result = compare_pair(
            &baseline,
            &test,
            &diff,
            &fast_options(),
            None,
            &AbortSignal::new(),
        )
        .await;
        assert!(matches!(result, ComparisonResult::NoTest { .. }));
    }

    #[tokio::test]
    async fn dom_text_change_promotes_match_to_diff() {
        use crate::dom::{DomElement, ElementBox, ElementStyles, SizePair};

        let dir = tempfile::tempdir().unwrap();
        let baseline = dir.path().join("base.png");
        let test = dir.path().join("test.png");
        let diff = dir.path().join("diff.png");
        write_solid(&baseline, 30, 30, [250, 250, 250, 255]);
        write_solid(&test, 30, 30, [250, 250, 250, 255]);

        let make_snapshot = |text: &str| {
            DomSnapshot::new(
                SizePair { w: 30.0, h: 30.0 },
                SizePair { w: 30.0, h: 30.0 },
                vec![DomElement {
                    path: "body > h1".to_string(),
                    tag: "h1".to_string(),
                    bounds: ElementBox {
                        x: 0.0,
                        y: 0.0,
                        w: 30.0,
                        h: 10.0,
                    },
                    styles: ElementStyles::default(),
                    text: Some(text.to_string()),
                    id: None,
                    test_id: None,
                    children: Vec::new(),
                }],
            )
        };

        let mut options = fast_options();
        options.baseline_snapshot = Some(make_snapshot("Old CTA"));
        options.test_snapshot = Some(make_snapshot("New CTA"));

        let result = compare_pair(&baseline, &test, &diff, &options, None, &AbortSignal::new())
            .await;
        match result {
            ComparisonResult::Diff {
                pixel_diff,
                dom_diff: Some(dom),
                ..
            } => {
                assert_eq!(pixel_diff, 0);
                assert_eq!(dom.summary.text_changed, 1);
            }
            other => panic!("expected promoted diff, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auto_approve_rule_fires_on_clean_cosmetic_diff() {
        use crate::score::{AutoRule, ChangeCategory};

        let dir = tempfile::tempdir().unwrap();
        let baseline = dir.path().join("base.png");
        let test = dir.path().join("test.png");
        let diff = dir.path().join("diff.png");
        write_solid(&baseline, 40, 40, [255, 255, 255, 255]);
        let mut img = RgbaImage::from_pixel(40, 40, Rgba([255, 255, 255, 255]));
        img.put_pixel(0, 0, Rgba([0, 0, 0, 255]));
        img.save(&test).unwrap();

        struct CosmeticProvider;
        #[async_trait::async_trait]
        impl VisionProvider for CosmeticProvider {
            async fn analyze(
                &self,
                _request: &crate::vision::VisionRequest,
            ) -> crate::error::Result<crate::vision::VisionResponse> {
                Ok(crate::vision::VisionResponse {
                    text: "{\"category\": \"cosmetic\", \"severity\": \"info\", \
                           \"confidence\": 0.9, \"recommendation\": \"approve\"}"
                        .to_string(),
                    tokens_used: None,
                })
            }
        }

        let mut options = fast_options();
        options.auto_rules = vec![AutoRule {
            name: None,
            categories: Some(vec![ChangeCategory::Cosmetic]),
            max_severity: Some(Severity::Info),
            min_confidence: Some(0.85),
            max_pixel_diff: None,
            min_ssim: None,
            min_phash: None,
            max_dom_text_changes: Some(0),
            action: AutoAction::Approve,
        }];

        let triage = AiTriage {
            config: AiConfig {
                enabled: true,
                ..Default::default()
            },
            provider: Arc::new(CosmeticProvider),
        };

        let result = compare_pair(
            &baseline,
            &test,
            &diff,
            &options,
            Some(&triage),
            &AbortSignal::new(),
        )
        .await;
        match result {
            ComparisonResult::Diff {
                auto_action,
                ai_analysis,
                ..
            } => {
                assert!(ai_analysis.is_some());
                assert_eq!(auto_action, Some(AutoAction::Approve));
            }
            other => panic!("expected diff, got {other:?}"),
        }
    }
}
