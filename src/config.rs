//! Configuration management with serde serialization/deserialization
//!
//! All configuration records for the engine: scenario declarations,
//! browser/viewport matrices, engine toggles, AI triage settings and the
//! cross-compare matrix. Parsing supplies defaults; unknown keys are
//! rejected; `VrtConfig::validate` collects every failing path before
//! reporting.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::VrtError;
use crate::image_ops::parse_hex_color;

/// Main configuration structure for a visual regression project.
///
/// Controls capture matrices (browsers × viewports × scenarios), pixel
/// sensitivity, engine selection, AI triage, and the cross-compare setup.
///
/// # Examples
///
/// ```rust
/// use vrt_engine::{Scenario, VrtConfig};
///
/// let config = VrtConfig {
///     scenarios: vec![Scenario::new("home", "https://example.com")],
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct VrtConfig {
    /// Directory holding approved baseline images.
    #[serde(default = "default_baseline_dir")]
    pub baseline_dir: PathBuf,

    /// Directory receiving fresh captures, diffs and run records.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Browsers (and optional engine versions) to capture under.
    #[serde(default = "default_browsers")]
    pub browsers: Vec<BrowserSpec>,

    /// Viewports to capture under.
    #[serde(default = "default_viewports")]
    pub viewports: Vec<Viewport>,

    /// Per-pixel sensitivity for the pixel engines, in `[0, 1]`.
    ///
    /// Lower values flag smaller per-pixel color deltas.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Highlight color for diff images, `#RRGGBB`.
    #[serde(default = "default_diff_color")]
    pub diff_color: String,

    /// Inject global CSS to freeze animations and transitions.
    #[serde(default = "default_true")]
    pub disable_animations: bool,

    /// Global tolerance: a pair whose diff percentage stays at or below
    /// this value still counts as a match. Scenarios may override.
    #[serde(default)]
    pub diff_threshold: Option<f64>,

    /// Parallel tasks per capture group and per compare batch, `1..=20`.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Run only the inline pixel pass; skip secondary engines, DOM
    /// diffing and AI triage.
    #[serde(default)]
    pub quick_mode: bool,

    /// Declared scenarios. At least one is required.
    pub scenarios: Vec<Scenario>,

    /// Defaults merged into every scenario before planning.
    #[serde(default)]
    pub scenario_defaults: Option<ScenarioDefaults>,

    /// AI vision triage settings.
    #[serde(default)]
    pub ai: AiConfig,

    /// Engine selection and unified-score thresholds.
    #[serde(default)]
    pub engines: EnginesConfig,

    /// Cross-compare matrix.
    #[serde(default)]
    pub cross_compare: CrossCompareConfig,

    /// Auto-derived tolerance caps from the acceptance history.
    #[serde(default)]
    pub auto_threshold: AutoThresholdConfig,

    /// Bucket boundaries for the user-facing confidence verdict.
    #[serde(default)]
    pub confidence_thresholds: ConfidenceThresholds,

    /// Auto-action rules, evaluated top to bottom; first match wins.
    #[serde(default)]
    pub auto_rules: Vec<crate::score::AutoRule>,

    /// DOM snapshot capture settings.
    #[serde(default)]
    pub dom_snapshot: SnapshotConfig,

    /// Keep the diff image even when the pair matches.
    #[serde(default)]
    pub keep_diff_on_match: bool,
}

impl Default for VrtConfig {
    fn default() -> Self {
        Self {
            baseline_dir: default_baseline_dir(),
            output_dir: default_output_dir(),
            browsers: default_browsers(),
            viewports: default_viewports(),
            threshold: default_threshold(),
            diff_color: default_diff_color(),
            disable_animations: true,
            diff_threshold: None,
            concurrency: default_concurrency(),
            quick_mode: false,
            scenarios: Vec::new(),
            scenario_defaults: None,
            ai: AiConfig::default(),
            engines: EnginesConfig::default(),
            cross_compare: CrossCompareConfig::default(),
            auto_threshold: AutoThresholdConfig::default(),
            confidence_thresholds: ConfidenceThresholds::default(),
            auto_rules: Vec::new(),
            dom_snapshot: SnapshotConfig::default(),
            keep_diff_on_match: false,
        }
    }
}

impl VrtConfig {
    /// Parse a config from JSON, rejecting unknown keys.
    pub fn from_json_str(raw: &str) -> Result<Self, VrtError> {
        let config: VrtConfig = serde_json::from_str(raw)
            .map_err(|e| VrtError::Config {
                issues: vec![e.to_string()],
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate ranges and referential consistency, collecting every
    /// failing path instead of stopping at the first.
    pub fn validate(&self) -> Result<(), VrtError> {
        let mut issues = Vec::new();

        if !(0.0..=1.0).contains(&self.threshold) {
            issues.push(format!(
                "threshold: must be within 0..=1, got {}",
                self.threshold
            ));
        }
        if !(1..=20).contains(&self.concurrency) {
            issues.push(format!(
                "concurrency: must be within 1..=20, got {}",
                self.concurrency
            ));
        }
        if parse_hex_color(&self.diff_color).is_none() {
            issues.push(format!(
                "diff_color: expected #RRGGBB, got {:?}",
                self.diff_color
            ));
        }
        if let Some(pct) = self.diff_threshold {
            if !(0.0..=100.0).contains(&pct) {
                issues.push(format!(
                    "diff_threshold: must be within 0..=100, got {pct}"
                ));
            }
        }
        if self.scenarios.is_empty() {
            issues.push("scenarios: at least one scenario is required".to_string());
        }
        if self.browsers.is_empty() {
            issues.push("browsers: at least one browser is required".to_string());
        }
        if self.viewports.is_empty() {
            issues.push("viewports: at least one viewport is required".to_string());
        }

        let mut seen_names = std::collections::HashSet::new();
        for (idx, scenario) in self.scenarios.iter().enumerate() {
            let path = format!("scenarios[{idx}]");
            if scenario.name.trim().is_empty() {
                issues.push(format!("{path}.name: must not be empty"));
            } else if !seen_names.insert(scenario.name.clone()) {
                issues.push(format!(
                    "{path}.name: duplicate scenario name {:?}",
                    scenario.name
                ));
            }
            if url::Url::parse(&scenario.url).is_err() {
                issues.push(format!("{path}.url: invalid URL {:?}", scenario.url));
            }
            if let Some(pct) = scenario.diff_threshold {
                if !(0.0..=100.0).contains(&pct) {
                    issues.push(format!(
                        "{path}.diff_threshold: must be within 0..=100, got {pct}"
                    ));
                }
            }
        }

        for (idx, viewport) in self.viewports.iter().enumerate() {
            if viewport.width == 0 || viewport.height == 0 {
                issues.push(format!(
                    "viewports[{idx}]: dimensions must be non-zero, got {}x{}",
                    viewport.width, viewport.height
                ));
            }
            if viewport.name.trim().is_empty() {
                issues.push(format!("viewports[{idx}].name: must not be empty"));
            }
        }

        if !(0.0..1.0).contains(&self.auto_threshold.percentile) {
            issues.push(format!(
                "auto_threshold.percentile: must be within 0..1, got {}",
                self.auto_threshold.percentile
            ));
        }

        for (idx, pair) in self.cross_compare.pairs.iter().enumerate() {
            if crate::cross::PairKey::parse(pair).is_none() {
                issues.push(format!(
                    "cross_compare.pairs[{idx}]: expected \"<browser>@<ver> vs <browser>@<ver>\", got {pair:?}"
                ));
            }
        }

        let ct = &self.confidence_thresholds;
        if !(ct.likely_fail <= ct.needs_review
            && ct.needs_review <= ct.likely_pass
            && ct.likely_pass <= ct.pass)
        {
            issues.push(
                "confidence_thresholds: buckets must be ordered likely_fail <= needs_review <= likely_pass <= pass"
                    .to_string(),
            );
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(VrtError::Config { issues })
        }
    }
}

/// Browser engine backing a capture group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserEngine {
    Chromium,
    Webkit,
}

impl BrowserEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserEngine::Chromium => "chromium",
            BrowserEngine::Webkit => "webkit",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "chromium" => Some(BrowserEngine::Chromium),
            "webkit" => Some(BrowserEngine::Webkit),
            _ => None,
        }
    }
}

/// A browser plus an optional pinned engine version.
///
/// Display key is `<name>` or `<name>-v<version>`, which is also the
/// form embedded into screenshot filenames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BrowserSpec {
    pub engine: BrowserEngine,
    #[serde(default)]
    pub version: Option<String>,
}

impl BrowserSpec {
    pub fn new(engine: BrowserEngine) -> Self {
        Self {
            engine,
            version: None,
        }
    }

    pub fn versioned(engine: BrowserEngine, version: impl Into<String>) -> Self {
        Self {
            engine,
            version: Some(version.into()),
        }
    }

    pub fn display_key(&self) -> String {
        match &self.version {
            Some(v) => format!("{}-v{}", self.engine.as_str(), v),
            None => self.engine.as_str().to_string(),
        }
    }
}

/// Viewport in CSS pixels.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Viewport {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
        }
    }
}

/// Page readiness event to wait for before manipulating the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitFor {
    #[default]
    Load,
    Domcontentloaded,
    Networkidle,
}

/// A declared capture scenario: a stable name, a target URL and the
/// pre-screenshot manipulations applied to the page.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct Scenario {
    pub name: String,
    pub url: String,

    /// Unset falls back to the scenario defaults, then to `load`.
    #[serde(default)]
    pub wait_for: Option<WaitFor>,

    /// Wait for this selector to appear before capturing.
    #[serde(default)]
    pub wait_for_selector: Option<String>,

    #[serde(default)]
    pub wait_for_timeout_ms: Option<u64>,

    /// Extra settle time after interactions, in milliseconds.
    #[serde(default)]
    pub post_interaction_wait_ms: Option<u64>,

    /// JavaScript executed in the page before the screenshot.
    #[serde(default)]
    pub before_screenshot: Option<String>,

    /// Clip the capture to this element instead of the viewport.
    #[serde(default)]
    pub selector: Option<String>,

    #[serde(default)]
    pub full_page: Option<bool>,

    /// Selectors forced to `visibility: hidden` (layout preserved).
    #[serde(default)]
    pub hide_selectors: Vec<String>,

    /// Selectors forced to `display: none` (removed from layout).
    #[serde(default)]
    pub remove_selectors: Vec<String>,

    /// Requests whose URL contains any of these substrings are blocked.
    #[serde(default)]
    pub block_urls: Vec<String>,

    /// Per-scenario override of the global diff percentage tolerance.
    #[serde(default)]
    pub diff_threshold: Option<f64>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            wait_for: None,
            wait_for_selector: None,
            wait_for_timeout_ms: None,
            post_interaction_wait_ms: None,
            before_screenshot: None,
            selector: None,
            full_page: None,
            hide_selectors: Vec::new(),
            remove_selectors: Vec::new(),
            block_urls: Vec::new(),
            diff_threshold: None,
        }
    }
}

/// Project-wide scenario defaults, merged by the planner.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct ScenarioDefaults {
    #[serde(default)]
    pub wait_for: Option<WaitFor>,
    #[serde(default)]
    pub wait_for_selector: Option<String>,
    #[serde(default)]
    pub wait_for_timeout_ms: Option<u64>,
    #[serde(default)]
    pub post_interaction_wait_ms: Option<u64>,
    #[serde(default)]
    pub before_screenshot: Option<String>,
    #[serde(default)]
    pub full_page: Option<bool>,
    #[serde(default)]
    pub hide_selectors: Vec<String>,
    #[serde(default)]
    pub remove_selectors: Vec<String>,
    #[serde(default)]
    pub block_urls: Vec<String>,
    #[serde(default)]
    pub diff_threshold: Option<f64>,
}

/// How two differently-sized images are brought onto a common frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeNormalization {
    /// Grow both to `(max, max)`; the gap is filled with neutral gray.
    #[default]
    Pad,
    /// Shrink both to `(min, min)` by nearest-neighbor resampling.
    Resize,
    /// Keep the top-left `(min, min)` region of both.
    Crop,
}

/// Whether a pre-normalization size mismatch forces a non-match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeMismatchHandling {
    #[default]
    Strict,
    Ignore,
}

/// Engine selection plus thresholds for the unified multi-engine score.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct EnginesConfig {
    #[serde(default = "default_true")]
    pub pixelmatch: bool,
    #[serde(default = "default_true")]
    pub odiff: bool,
    #[serde(default = "default_true")]
    pub ssim: bool,
    #[serde(default = "default_true")]
    pub phash: bool,

    /// Unified score at or above this is a `pass` (0..=100).
    #[serde(default = "default_unified_pass")]
    pub unified_pass: u32,
    /// Unified score at or above this (but below pass) is a `warn`.
    #[serde(default = "default_unified_warn")]
    pub unified_warn: u32,

    /// Anti-aliasing tolerance for the pixel pass. When true, pixels
    /// classified as anti-aliasing artifacts are not counted.
    #[serde(default = "default_true")]
    pub anti_aliasing: bool,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            pixelmatch: true,
            odiff: true,
            ssim: true,
            phash: true,
            unified_pass: default_unified_pass(),
            unified_warn: default_unified_warn(),
            anti_aliasing: true,
        }
    }
}

/// Which AI vision backend a deployment wires in. The SDKs themselves
/// live outside the engine; this carries the variant tag plus the
/// provider-specific knobs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum VisionProviderConfig {
    OpenAi {
        #[serde(default)]
        base_url: Option<String>,
    },
    Anthropic {
        #[serde(default)]
        base_url: Option<String>,
    },
    Google {},
    OpenRouter {
        #[serde(default)]
        site_url: Option<String>,
    },
}

/// AI triage settings. Disabled by default; when enabled the scorer
/// folds the provider's analysis into the weighted confidence.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub provider: Option<VisionProviderConfig>,
    #[serde(default = "default_ai_model")]
    pub model: String,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_ai_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: None,
            model: default_ai_model(),
            timeout_ms: default_ai_timeout_ms(),
        }
    }
}

/// Cross-compare matrix: explicit browser-version pairs plus the size
/// reconciliation used when versions render at different heights.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct CrossCompareConfig {
    /// Pair descriptors, e.g. `"chromium@130 vs chromium@120"`.
    #[serde(default)]
    pub pairs: Vec<String>,
    #[serde(default)]
    pub size_normalization: SizeNormalization,
    #[serde(default = "default_cross_mismatch")]
    pub mismatch: SizeMismatchHandling,
}

impl Default for CrossCompareConfig {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            size_normalization: SizeNormalization::default(),
            mismatch: default_cross_mismatch(),
        }
    }
}

/// Auto-threshold derivation from the acceptance ledger.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct AutoThresholdConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_percentile")]
    pub percentile: f64,
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: usize,
}

impl Default for AutoThresholdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            percentile: default_percentile(),
            min_sample_size: default_min_sample_size(),
        }
    }
}

/// Bucket boundaries for the user-facing confidence verdict.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct ConfidenceThresholds {
    #[serde(default = "default_ct_pass")]
    pub pass: f64,
    #[serde(default = "default_ct_likely_pass")]
    pub likely_pass: f64,
    #[serde(default = "default_ct_needs_review")]
    pub needs_review: f64,
    #[serde(default = "default_ct_likely_fail")]
    pub likely_fail: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            pass: default_ct_pass(),
            likely_pass: default_ct_likely_pass(),
            needs_review: default_ct_needs_review(),
            likely_fail: default_ct_likely_fail(),
        }
    }
}

/// DOM snapshot capture settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct SnapshotConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_elements: default_max_elements(),
        }
    }
}

fn default_baseline_dir() -> PathBuf {
    PathBuf::from(".vrt/baselines")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".vrt/output")
}

fn default_browsers() -> Vec<BrowserSpec> {
    vec![BrowserSpec::new(BrowserEngine::Chromium)]
}

fn default_viewports() -> Vec<Viewport> {
    vec![Viewport::new("desktop", 1280, 720)]
}

fn default_threshold() -> f64 {
    0.1
}

fn default_diff_color() -> String {
    "#ff0000".to_string()
}

fn default_concurrency() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_unified_pass() -> u32 {
    95
}

fn default_unified_warn() -> u32 {
    80
}

fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_ai_timeout_ms() -> u64 {
    45_000
}

fn default_cross_mismatch() -> SizeMismatchHandling {
    SizeMismatchHandling::Ignore
}

fn default_percentile() -> f64 {
    0.95
}

fn default_min_sample_size() -> usize {
    5
}

fn default_ct_pass() -> f64 {
    0.9
}

fn default_ct_likely_pass() -> f64 {
    0.75
}

fn default_ct_needs_review() -> f64 {
    0.5
}

fn default_ct_likely_fail() -> f64 {
    0.3
}

fn default_max_elements() -> usize {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> VrtConfig {
        VrtConfig {
            scenarios: vec![Scenario::new("home", "https://example.com")],
            ..Default::default()
        }
    }

    #[test]
    fn default_config_with_scenario_validates() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn empty_scenarios_rejected() {
        let config = VrtConfig::default();
        let err = config.validate().unwrap_err();
        match err {
            VrtError::Config { issues } => {
                assert!(issues.iter().any(|i| i.starts_with("scenarios:")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn validation_collects_multiple_issues() {
        let mut config = valid_config();
        config.threshold = 4.0;
        config.concurrency = 0;
        config.diff_color = "red".to_string();
        let err = config.validate().unwrap_err();
        match err {
            VrtError::Config { issues } => assert!(issues.len() >= 3, "{issues:?}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_keys_rejected() {
        let raw = r#"{"scenarios": [{"name": "a", "url": "https://x.dev"}], "bogus": 1}"#;
        assert!(VrtConfig::from_json_str(raw).is_err());
    }

    #[test]
    fn unknown_wait_for_rejected() {
        let raw = r#"{"scenarios": [{"name": "a", "url": "https://x.dev", "wait_for": "idle"}]}"#;
        assert!(VrtConfig::from_json_str(raw).is_err());
    }

    #[test]
    fn browser_display_key() {
        let plain = BrowserSpec::new(BrowserEngine::Chromium);
        assert_eq!(plain.display_key(), "chromium");

        let pinned = BrowserSpec::versioned(BrowserEngine::Webkit, "17.4");
        assert_eq!(pinned.display_key(), "webkit-v17.4");
    }

    #[test]
    fn bad_cross_pair_reported() {
        let mut config = valid_config();
        config.cross_compare.pairs = vec!["chromium@130".to_string()];
        let err = config.validate().unwrap_err();
        match err {
            VrtError::Config { issues } => {
                assert!(issues.iter().any(|i| i.contains("cross_compare.pairs[0]")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
