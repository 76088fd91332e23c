//! Cross-compare engine.
//!
//! Compares captures of the same scenario/viewport across configured
//! browser-version pairs. Each pair keeps its own `results.json` with an
//! embedded acceptance ledger; re-running a pair preserves acceptances of
//! unchanged items and recreates any deleted diff artifacts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::cancel::AbortSignal;
use crate::compare::{self, AiTriage, CompareOptions, ComparisonResult};
use crate::config::{BrowserEngine, BrowserSpec, VrtConfig};
use crate::error::{Result, VrtError};
use crate::paths;
use crate::vision::AiAnalysis;

/// Stable identifier of one cross-compare axis pair, e.g.
/// `chromium@130 vs chromium@120`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub left: BrowserSpec,
    pub right: BrowserSpec,
}

impl PairKey {
    /// Parse `"<browser>[@<version>] vs <browser>[@<version>]"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (left, right) = raw.split_once(" vs ")?;
        Some(Self {
            left: parse_side(left.trim())?,
            right: parse_side(right.trim())?,
        })
    }

    pub fn display(&self) -> String {
        format!("{} vs {}", side_display(&self.left), side_display(&self.right))
    }

    /// Directory name under `cross-reports/`.
    pub fn dir_name(&self) -> String {
        paths::sanitize_name(&self.display())
    }
}

fn parse_side(raw: &str) -> Option<BrowserSpec> {
    match raw.split_once('@') {
        Some((engine, version)) if !version.is_empty() => Some(BrowserSpec {
            engine: BrowserEngine::parse(engine)?,
            version: Some(version.to_string()),
        }),
        Some(_) => None,
        None => Some(BrowserSpec {
            engine: BrowserEngine::parse(raw)?,
            version: None,
        }),
    }
}

fn side_display(spec: &BrowserSpec) -> String {
    match &spec.version {
        Some(version) => format!("{}@{}", spec.engine.as_str(), version),
        None => spec.engine.as_str().to_string(),
    }
}

/// One scenario/viewport entry in a pair's result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CrossItem {
    pub item_key: String,
    pub scenario: String,
    pub viewport: String,
    pub baseline: PathBuf,
    pub test: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<PathBuf>,
    #[serde(rename = "match")]
    pub is_match: bool,
    pub diff_percentage: f64,
    pub pixel_diff: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssim: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flagged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_analysis: Option<AiAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// On-disk shape of a pair's `results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CrossResults {
    pub pair: String,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<CrossItem>,
}

impl CrossResults {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VrtError::Io(format!("{}: {e}", path.display()))),
        }
    }
}

/// Result of re-running one pair.
#[derive(Debug, Clone)]
pub struct CrossReport {
    pub pair: PairKey,
    pub results_path: PathBuf,
    pub items: Vec<CrossItem>,
}

pub fn item_key(scenario: &str, viewport: &str) -> String {
    format!("{scenario}__{viewport}")
}

fn pair_dir(output_dir: &Path, pair: &PairKey) -> PathBuf {
    output_dir.join("cross-reports").join(pair.dir_name())
}

pub fn results_path(output_dir: &Path, pair: &PairKey) -> PathBuf {
    pair_dir(output_dir, pair).join("results.json")
}

/// Run the configured (or explicitly passed) pairs over every
/// scenario × viewport.
pub async fn run_cross_compare(
    config: &VrtConfig,
    pairs: Option<&[String]>,
    ai: Option<&AiTriage>,
    abort: &AbortSignal,
) -> Result<Vec<CrossReport>> {
    let raw_pairs = match pairs {
        Some(explicit) if !explicit.is_empty() => explicit,
        _ => &config.cross_compare.pairs,
    };

    let mut parsed = Vec::new();
    for raw in raw_pairs {
        let pair = PairKey::parse(raw).ok_or_else(|| {
            VrtError::config(format!("cross_compare: unparsable pair {raw:?}"))
        })?;
        parsed.push(pair);
    }

    let mut reports = Vec::new();
    for pair in parsed {
        if abort.is_aborted() {
            return Err(VrtError::Aborted);
        }
        reports.push(run_pair(config, &pair, ai, abort).await?);
    }
    Ok(reports)
}

async fn run_pair(
    config: &VrtConfig,
    pair: &PairKey,
    ai: Option<&AiTriage>,
    abort: &AbortSignal,
) -> Result<CrossReport> {
    let dir = pair_dir(&config.output_dir, pair);
    let results_file = dir.join("results.json");
    let previous = CrossResults::load(&results_file)?;

    info!("cross-comparing {}", pair.display());

    let mut options = CompareOptions::from_config(config);
    options.size_normalization = config.cross_compare.size_normalization;
    options.size_mismatch_handling = config.cross_compare.mismatch;

    // One comparison job per scenario × viewport, in config order.
    let semaphore = Arc::new(Semaphore::new(config.concurrency));
    let mut tasks = Vec::new();
    for scenario in &config.scenarios {
        for viewport in &config.viewports {
            let key = item_key(&scenario.name, &viewport.name);
            let baseline = config.output_dir.join(paths::screenshot_file_name(
                &scenario.name,
                pair.left.engine,
                pair.left.version.as_deref(),
                &viewport.name,
            ));
            let test = config.output_dir.join(paths::screenshot_file_name(
                &scenario.name,
                pair.right.engine,
                pair.right.version.as_deref(),
                &viewport.name,
            ));
            let diff = dir.join("diffs").join(format!("{}.png", paths::sanitize_name(&key)));

            let mut options = options.clone();
            options.max_diff_percentage = scenario
                .diff_threshold
                .or(config.diff_threshold);
            options.label = format!("{} ({}) {}", scenario.name, viewport.name, pair.display());

            let semaphore = semaphore.clone();
            let abort = abort.clone();
            let ai = ai.cloned();
            let scenario_name = scenario.name.clone();
            let viewport_name = viewport.name.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| VrtError::CaptureFailure(e.to_string()))?;
                let result =
                    compare::compare_pair(&baseline, &test, &diff, &options, ai.as_ref(), &abort)
                        .await;
                Ok::<CrossItem, VrtError>(item_from_result(
                    key,
                    scenario_name,
                    viewport_name,
                    result,
                ))
            }));
        }
    }

    let mut items = Vec::with_capacity(tasks.len());
    for task in tasks {
        let item = task
            .await
            .map_err(|e| VrtError::CaptureFailure(format!("compare task panicked: {e}")))??;
        items.push(item);
    }

    // Carry acceptances/flags of unchanged item keys across reruns and
    // keep the previous item order stable, appending newcomers.
    if let Some(previous) = &previous {
        let previous_by_key: HashMap<&str, &CrossItem> = previous
            .items
            .iter()
            .map(|item| (item.item_key.as_str(), item))
            .collect();
        for item in &mut items {
            if let Some(old) = previous_by_key.get(item.item_key.as_str()) {
                item.accepted = old.accepted;
                item.accepted_at = old.accepted_at;
                item.flagged = old.flagged;
            }
        }

        let mut ordered = Vec::with_capacity(items.len());
        let mut by_key: HashMap<String, CrossItem> = items
            .into_iter()
            .map(|item| (item.item_key.clone(), item))
            .collect();
        for old in &previous.items {
            if let Some(item) = by_key.remove(&old.item_key) {
                ordered.push(item);
            }
        }
        let mut appended: Vec<CrossItem> = by_key.into_values().collect();
        appended.sort_by(|a, b| a.item_key.cmp(&b.item_key));
        ordered.extend(appended);
        items = ordered;
    }

    let results = CrossResults {
        pair: pair.display(),
        updated_at: Utc::now(),
        items,
    };
    paths::write_json_atomic(&results_file, &results)?;

    Ok(CrossReport {
        pair: pair.clone(),
        results_path: results_file,
        items: results.items,
    })
}

fn item_from_result(
    item_key: String,
    scenario: String,
    viewport: String,
    result: ComparisonResult,
) -> CrossItem {
    let mut item = CrossItem {
        item_key,
        scenario,
        viewport,
        baseline: result.baseline().to_path_buf(),
        test: result.test().to_path_buf(),
        diff: None,
        is_match: result.is_match(),
        diff_percentage: result.diff_percentage(),
        pixel_diff: result.pixel_diff(),
        ssim: None,
        accepted: None,
        accepted_at: None,
        flagged: None,
        ai_analysis: None,
        error: None,
    };
    match result {
        ComparisonResult::Match { ssim, .. } => {
            item.ssim = ssim;
        }
        ComparisonResult::Diff {
            diff_path,
            ssim,
            ai_analysis,
            ..
        } => {
            item.diff = Some(diff_path);
            item.ssim = ssim;
            item.ai_analysis = ai_analysis;
        }
        ComparisonResult::NoBaseline { baseline, .. } => {
            item.error = Some(format!("missing capture: {}", baseline.display()));
        }
        ComparisonResult::NoTest { test, .. } => {
            item.error = Some(format!("missing capture: {}", test.display()));
        }
        ComparisonResult::Error { error, .. } => {
            item.error = Some(error);
        }
    }
    item
}

/// Record acceptance of one item inside the pair's own results file.
pub async fn accept_item(
    output_dir: &Path,
    pair: &PairKey,
    key: &str,
    accepted: bool,
) -> Result<bool> {
    update_item(output_dir, pair, key, |item| {
        item.accepted = Some(accepted);
        item.accepted_at = accepted.then(Utc::now);
    })
    .await
}

/// Toggle the flag on one item.
pub async fn flag_item(
    output_dir: &Path,
    pair: &PairKey,
    key: &str,
    flagged: bool,
) -> Result<bool> {
    update_item(output_dir, pair, key, |item| {
        item.flagged = Some(flagged);
    })
    .await
}

async fn update_item(
    output_dir: &Path,
    pair: &PairKey,
    key: &str,
    mutate: impl FnOnce(&mut CrossItem),
) -> Result<bool> {
    let lock = crate::store::project_write_lock(output_dir);
    let _guard = lock.lock().await;

    let path = results_path(output_dir, pair);
    let Some(mut results) = CrossResults::load(&path)? else {
        warn!("no cross results at {}", path.display());
        return Ok(false);
    };
    let Some(item) = results.items.iter_mut().find(|i| i.item_key == key) else {
        return Ok(false);
    };
    mutate(item);
    results.updated_at = Utc::now();
    paths::write_json_atomic(&path, &results)?;
    Ok(true)
}
