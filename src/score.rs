//! Confidence scoring and auto-actions.
//!
//! Two scores exist side by side: the *unified* confidence is pure
//! multi-engine agreement (0..=100), while the *weighted* confidence is
//! the user-facing verdict that additionally folds in AI triage and the
//! change category. Auto-actions are decided by a first-match rule list.

use serde::{Deserialize, Serialize};

use crate::config::{ConfidenceThresholds, EnginesConfig};
use crate::engines::{EngineKind, EngineResult};

/// Kind of change a diff represents, inferred from DOM findings or AI
/// triage. Parsing rejects unknown values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCategory {
    Cosmetic,
    Noise,
    ContentChange,
    LayoutShift,
    Regression,
}

impl ChangeCategory {
    /// Additive score adjustment, applied before clamping to `[0, 1]`.
    pub fn score_adjustment(&self) -> f64 {
        match self {
            ChangeCategory::Cosmetic => 0.15,
            ChangeCategory::Noise => 0.20,
            ChangeCategory::ContentChange => -0.05,
            ChangeCategory::LayoutShift => -0.10,
            ChangeCategory::Regression => -0.25,
        }
    }
}

/// Finding/analysis severity ladder. Ordering is significant: rules
/// compare against a maximum severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Multi-engine agreement verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnifiedVerdict {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedConfidence {
    /// Rounded weighted agreement in 0..=100.
    pub score: u32,
    pub verdict: UnifiedVerdict,
    /// Engines that contributed (errored engines are excluded).
    pub engines_used: Vec<EngineKind>,
}

fn engine_weight(kind: EngineKind) -> f64 {
    match kind {
        EngineKind::Pixelmatch => 0.30,
        EngineKind::Odiff => 0.30,
        EngineKind::Ssim => 0.25,
        EngineKind::Phash => 0.15,
    }
}

/// Weighted agreement over the non-errored engines, renormalized so a
/// failed engine redistributes its weight instead of dragging the score.
pub fn unified_confidence(
    results: &[EngineResult],
    engines: &EnginesConfig,
) -> UnifiedConfidence {
    let mut weight_sum = 0.0;
    let mut weighted = 0.0;
    let mut used = Vec::new();

    for result in results.iter().filter(|r| r.is_ok()) {
        let w = engine_weight(result.engine);
        weight_sum += w;
        weighted += w * result.similarity.clamp(0.0, 1.0);
        used.push(result.engine);
    }

    let score = if weight_sum > 0.0 {
        (weighted / weight_sum * 100.0).round() as u32
    } else {
        0
    };

    let verdict = if score >= engines.unified_pass {
        UnifiedVerdict::Pass
    } else if score >= engines.unified_warn {
        UnifiedVerdict::Warn
    } else {
        UnifiedVerdict::Fail
    };

    UnifiedConfidence {
        score,
        verdict,
        engines_used: used,
    }
}

/// AI recommendation vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiRecommendation {
    Approve,
    Review,
    Reject,
}

/// Signals extracted from an AI triage pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AiSignals {
    pub confidence: f64,
    pub recommendation: AiRecommendation,
    pub category: Option<ChangeCategory>,
}

/// Inputs to the user-facing weighted confidence.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceInputs {
    pub ssim: Option<f64>,
    pub phash: Option<f64>,
    pub pixel_diff_pct: f64,
    pub ai: Option<AiSignals>,
    pub dom_category: Option<ChangeCategory>,
    pub dom_text_changes: usize,
}

impl ConfidenceInputs {
    fn category(&self) -> Option<ChangeCategory> {
        self.ai.and_then(|ai| ai.category).or(self.dom_category)
    }
}

/// Verdict buckets for the weighted confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfidenceVerdict {
    Fail,
    LikelyFail,
    NeedsReview,
    LikelyPass,
    Pass,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub score: f64,
    pub verdict: ConfidenceVerdict,
}

fn bucket(score: f64, thresholds: &ConfidenceThresholds) -> ConfidenceVerdict {
    if score >= thresholds.pass {
        ConfidenceVerdict::Pass
    } else if score >= thresholds.likely_pass {
        ConfidenceVerdict::LikelyPass
    } else if score >= thresholds.needs_review {
        ConfidenceVerdict::NeedsReview
    } else if score >= thresholds.likely_fail {
        ConfidenceVerdict::LikelyFail
    } else {
        ConfidenceVerdict::Fail
    }
}

/// Compute the user-facing confidence.
///
/// Components are weighted `ssim 0.25 / phash 0.20 / pixel 0.15 / ai 0.40`
/// when AI signals are present and `0.45 / 0.30 / 0.25` without; missing
/// engine scores renormalize the remainder. The change category shifts
/// the base score, and DOM text changes cap it so textual regressions can
/// never auto-pass.
pub fn weighted_confidence(
    inputs: &ConfidenceInputs,
    thresholds: &ConfidenceThresholds,
) -> ConfidenceScore {
    let pixel_score = (-inputs.pixel_diff_pct / 10.0).exp();

    let (w_ssim, w_phash, w_pixel, w_ai) = if inputs.ai.is_some() {
        (0.25, 0.20, 0.15, 0.40)
    } else {
        (0.45, 0.30, 0.25, 0.0)
    };

    let mut weight_sum = 0.0;
    let mut weighted = 0.0;
    if let Some(ssim) = inputs.ssim {
        weight_sum += w_ssim;
        weighted += w_ssim * ssim.clamp(0.0, 1.0);
    }
    if let Some(phash) = inputs.phash {
        weight_sum += w_phash;
        weighted += w_phash * phash.clamp(0.0, 1.0);
    }
    weight_sum += w_pixel;
    weighted += w_pixel * pixel_score.clamp(0.0, 1.0);

    if let Some(ai) = inputs.ai {
        let adjustment = match ai.recommendation {
            AiRecommendation::Approve => 0.10,
            AiRecommendation::Reject => -0.20,
            AiRecommendation::Review => 0.0,
        };
        let ai_score = (ai.confidence + adjustment).clamp(0.0, 1.0);
        weight_sum += w_ai;
        weighted += w_ai * ai_score;
    }

    let mut score = if weight_sum > 0.0 {
        weighted / weight_sum
    } else {
        0.0
    };

    if let Some(category) = inputs.category() {
        score = (score + category.score_adjustment()).clamp(0.0, 1.0);
    }

    // Text changes are never invisible regressions: cap the score below
    // the auto-pass buckets.
    if inputs.dom_text_changes >= 5 {
        score = score.min((thresholds.needs_review - 0.01).max(0.0));
    } else if inputs.dom_text_changes >= 1 {
        score = score.min((thresholds.likely_pass - 0.01).max(0.0));
    }

    let score = score.clamp(0.0, 1.0);
    ConfidenceScore {
        score,
        verdict: bucket(score, thresholds),
    }
}

/// Automatic disposition of a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoAction {
    Approve,
    Flag,
    Reject,
}

/// One auto-action rule; all present conditions must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct AutoRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub categories: Option<Vec<ChangeCategory>>,
    #[serde(default)]
    pub max_severity: Option<Severity>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    /// Upper bound on the pixel diff percentage.
    #[serde(default)]
    pub max_pixel_diff: Option<f64>,
    #[serde(default)]
    pub min_ssim: Option<f64>,
    #[serde(default)]
    pub min_phash: Option<f64>,
    #[serde(default)]
    pub max_dom_text_changes: Option<usize>,
    pub action: AutoAction,
}

/// Signals a rule is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    pub category: Option<ChangeCategory>,
    pub severity: Option<Severity>,
    pub confidence: f64,
    pub pixel_diff_pct: f64,
    pub ssim: Option<f64>,
    pub phash: Option<f64>,
    pub dom_text_changes: usize,
}

impl AutoRule {
    fn matches(&self, ctx: &RuleContext) -> bool {
        if let Some(categories) = &self.categories {
            match ctx.category {
                Some(category) if categories.contains(&category) => {}
                _ => return false,
            }
        }
        if let Some(max) = self.max_severity {
            if ctx.severity.unwrap_or(Severity::Info) > max {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if ctx.confidence < min {
                return false;
            }
        }
        if let Some(max) = self.max_pixel_diff {
            if ctx.pixel_diff_pct > max {
                return false;
            }
        }
        if let Some(min) = self.min_ssim {
            if !ctx.ssim.is_some_and(|s| s >= min) {
                return false;
            }
        }
        if let Some(min) = self.min_phash {
            if !ctx.phash.is_some_and(|p| p >= min) {
                return false;
            }
        }
        if let Some(max) = self.max_dom_text_changes {
            if ctx.dom_text_changes > max {
                return false;
            }
        }
        true
    }
}

/// First matching rule wins; no match means no automatic disposition.
pub fn evaluate_rules(rules: &[AutoRule], ctx: &RuleContext) -> Option<AutoAction> {
    rules.iter().find(|rule| rule.matches(ctx)).map(|r| r.action)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(kind: EngineKind, similarity: f64) -> EngineResult {
        EngineResult {
            engine: kind,
            similarity,
            diff_percent: (1.0 - similarity) * 100.0,
            diff_pixels: None,
            diff_image_path: None,
            error: None,
        }
    }

    #[test]
    fn unified_score_uses_weights() {
        let results = vec![
            engine(EngineKind::Pixelmatch, 1.0),
            engine(EngineKind::Ssim, 1.0),
            engine(EngineKind::Phash, 1.0),
        ];
        let unified = unified_confidence(&results, &EnginesConfig::default());
        assert_eq!(unified.score, 100);
        assert_eq!(unified.verdict, UnifiedVerdict::Pass);
        assert_eq!(unified.engines_used.len(), 3);
    }

    #[test]
    fn unified_score_renormalizes_around_errors() {
        let results = vec![
            engine(EngineKind::Pixelmatch, 0.8),
            EngineResult::failure(EngineKind::Odiff, "binary not found"),
            engine(EngineKind::Ssim, 0.8),
        ];
        let unified = unified_confidence(&results, &EnginesConfig::default());
        // 0.8 across all usable weight, independent of the failed engine.
        assert_eq!(unified.score, 80);
        assert_eq!(unified.verdict, UnifiedVerdict::Warn);
        assert!(!unified.engines_used.contains(&EngineKind::Odiff));
    }

    #[test]
    fn unified_score_with_no_engines_fails() {
        let unified = unified_confidence(&[], &EnginesConfig::default());
        assert_eq!(unified.score, 0);
        assert_eq!(unified.verdict, UnifiedVerdict::Fail);
    }

    #[test]
    fn weighted_confidence_perfect_signals_pass() {
        let inputs = ConfidenceInputs {
            ssim: Some(1.0),
            phash: Some(1.0),
            pixel_diff_pct: 0.0,
            ..Default::default()
        };
        let result = weighted_confidence(&inputs, &ConfidenceThresholds::default());
        assert!(result.score > 0.99);
        assert_eq!(result.verdict, ConfidenceVerdict::Pass);
    }

    #[test]
    fn weighted_confidence_is_monotone_in_pixel_diff() {
        let thresholds = ConfidenceThresholds::default();
        let mut previous = f64::MAX;
        for pct in [0.0, 0.5, 2.0, 10.0, 40.0, 100.0] {
            let inputs = ConfidenceInputs {
                ssim: Some(0.9),
                phash: Some(0.9),
                pixel_diff_pct: pct,
                ..Default::default()
            };
            let result = weighted_confidence(&inputs, &thresholds);
            assert!((0.0..=1.0).contains(&result.score));
            assert!(result.score <= previous);
            previous = result.score;
        }
    }

    #[test]
    fn ai_recommendation_shifts_score() {
        let thresholds = ConfidenceThresholds::default();
        let base = ConfidenceInputs {
            ssim: Some(0.8),
            phash: Some(0.8),
            pixel_diff_pct: 2.0,
            ..Default::default()
        };
        let approve = ConfidenceInputs {
            ai: Some(AiSignals {
                confidence: 0.8,
                recommendation: AiRecommendation::Approve,
                category: None,
            }),
            ..base.clone()
        };
        let reject = ConfidenceInputs {
            ai: Some(AiSignals {
                confidence: 0.8,
                recommendation: AiRecommendation::Reject,
                category: None,
            }),
            ..base
        };
        let approved = weighted_confidence(&approve, &thresholds);
        let rejected = weighted_confidence(&reject, &thresholds);
        assert!(approved.score > rejected.score);
    }

    #[test]
    fn category_adjustment_clamps() {
        let thresholds = ConfidenceThresholds::default();
        let inputs = ConfidenceInputs {
            ssim: Some(1.0),
            phash: Some(1.0),
            pixel_diff_pct: 0.0,
            dom_category: Some(ChangeCategory::Noise),
            ..Default::default()
        };
        let result = weighted_confidence(&inputs, &thresholds);
        assert!(result.score <= 1.0);
    }

    #[test]
    fn text_change_caps_hold() {
        let thresholds = ConfidenceThresholds::default();
        let one_change = ConfidenceInputs {
            ssim: Some(1.0),
            phash: Some(1.0),
            pixel_diff_pct: 0.0,
            dom_text_changes: 1,
            ..Default::default()
        };
        let result = weighted_confidence(&one_change, &thresholds);
        assert!(result.score <= thresholds.likely_pass - 0.01 + 1e-9);
        assert!(result.verdict < ConfidenceVerdict::LikelyPass);

        let many_changes = ConfidenceInputs {
            dom_text_changes: 5,
            ..one_change
        };
        let result = weighted_confidence(&many_changes, &thresholds);
        assert!(result.score <= thresholds.needs_review - 0.01 + 1e-9);
    }

    #[test]
    fn verdict_is_monotone_in_score() {
        let thresholds = ConfidenceThresholds::default();
        let mut last = ConfidenceVerdict::Fail;
        for step in 0..=100 {
            let score = step as f64 / 100.0;
            let verdict = bucket(score, &thresholds);
            assert!(verdict >= last, "verdict regressed at {score}");
            last = verdict;
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            AutoRule {
                name: Some("approve-cosmetic".to_string()),
                categories: Some(vec![ChangeCategory::Cosmetic]),
                max_severity: Some(Severity::Info),
                min_confidence: Some(0.85),
                max_pixel_diff: None,
                min_ssim: None,
                min_phash: None,
                max_dom_text_changes: Some(0),
                action: AutoAction::Approve,
            },
            AutoRule {
                name: Some("flag-everything".to_string()),
                categories: None,
                max_severity: None,
                min_confidence: None,
                max_pixel_diff: None,
                min_ssim: None,
                min_phash: None,
                max_dom_text_changes: None,
                action: AutoAction::Flag,
            },
        ];

        let ctx = RuleContext {
            category: Some(ChangeCategory::Cosmetic),
            severity: Some(Severity::Info),
            confidence: 0.9,
            dom_text_changes: 0,
            ..Default::default()
        };
        assert_eq!(evaluate_rules(&rules, &ctx), Some(AutoAction::Approve));

        let noisy = RuleContext {
            severity: Some(Severity::Critical),
            ..ctx
        };
        assert_eq!(evaluate_rules(&rules, &noisy), Some(AutoAction::Flag));
    }

    #[test]
    fn rule_requiring_missing_engine_score_does_not_match() {
        let rules = vec![AutoRule {
            name: None,
            categories: None,
            max_severity: None,
            min_confidence: None,
            max_pixel_diff: None,
            min_ssim: Some(0.9),
            min_phash: None,
            max_dom_text_changes: None,
            action: AutoAction::Approve,
        }];
        let ctx = RuleContext::default();
        assert_eq!(evaluate_rules(&rules, &ctx), None);
    }

    #[test]
    fn category_parsing_rejects_unknown() {
        assert!(serde_json::from_str::<ChangeCategory>("\"cosmetic\"").is_ok());
        assert!(serde_json::from_str::<ChangeCategory>("\"content_change\"").is_ok());
        assert!(serde_json::from_str::<ChangeCategory>("\"mystery\"").is_err());
    }
}
