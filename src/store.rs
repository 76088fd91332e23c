//! Acceptance ledger and auto-threshold derivation.
//!
//! The ledger (`acceptances.json`) is an ordered sequence keyed by
//! filename, last write wins in place. Writes go through a per-project
//! write lock and an atomic temp-file-then-rename; reads are lock-free.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::AutoThresholdConfig;
use crate::error::{Result, VrtError};
use crate::paths::{self, parse_screenshot_name};

/// Which side of a comparison an acceptance was recorded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Baseline,
    Test,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComparedAgainst {
    pub filename: String,
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceptanceMetrics {
    pub diff_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_diff: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssim: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phash: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceptanceSignals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<String>,
}

/// Recorded approval of a test image, with a metrics snapshot. Created
/// by explicit approve, destroyed only by explicit revoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Acceptance {
    pub filename: String,
    pub accepted_at: DateTime<Utc>,
    pub compared_against: ComparedAgainst,
    pub metrics: AcceptanceMetrics,
    #[serde(default)]
    pub signals: AcceptanceSignals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceLedger {
    pub acceptances: Vec<Acceptance>,
}

impl AcceptanceLedger {
    /// Insert or replace in place, keyed by filename.
    pub fn upsert(&mut self, acceptance: Acceptance) {
        match self
            .acceptances
            .iter_mut()
            .find(|a| a.filename == acceptance.filename)
        {
            Some(slot) => *slot = acceptance,
            None => self.acceptances.push(acceptance),
        }
    }

    pub fn remove(&mut self, filename: &str) -> Option<Acceptance> {
        let idx = self.acceptances.iter().position(|a| a.filename == filename)?;
        Some(self.acceptances.remove(idx))
    }

    pub fn get(&self, filename: &str) -> Option<&Acceptance> {
        self.acceptances.iter().find(|a| a.filename == filename)
    }
}

/// Per-project write locks; reads never take them.
pub(crate) fn project_write_lock(project_dir: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<DashMap<PathBuf, Arc<Mutex<()>>>> = OnceLock::new();
    LOCKS
        .get_or_init(DashMap::new)
        .entry(project_dir.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Acceptance store rooted at a project directory (the `.vrt` dir).
#[derive(Debug, Clone)]
pub struct AcceptanceStore {
    project_dir: PathBuf,
}

impl AcceptanceStore {
    pub const FILE_NAME: &'static str = "acceptances.json";

    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.project_dir.join(Self::FILE_NAME)
    }

    /// Lock-free read; a missing ledger is empty.
    pub fn load(&self) -> Result<AcceptanceLedger> {
        match std::fs::read_to_string(self.ledger_path()) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(AcceptanceLedger::default())
            }
            Err(e) => Err(VrtError::Io(e.to_string())),
        }
    }

    /// Record an approval and atomically promote the test image to the
    /// baseline directory.
    pub async fn approve(
        &self,
        acceptance: Acceptance,
        test_image: &Path,
        baseline_dir: &Path,
    ) -> Result<()> {
        let lock = project_write_lock(&self.project_dir);
        let _guard = lock.lock().await;

        let mut ledger = self.load()?;
        let filename = acceptance.filename.clone();
        ledger.upsert(acceptance);
        paths::write_json_atomic(&self.ledger_path(), &ledger)?;

        promote_to_baseline(test_image, &baseline_dir.join(&filename))?;
        info!("approved {filename}");
        Ok(())
    }

    /// Remove an acceptance record. The baseline file is left alone;
    /// revocation withdraws approval, it does not rewrite history.
    pub async fn revoke(&self, filename: &str) -> Result<bool> {
        let lock = project_write_lock(&self.project_dir);
        let _guard = lock.lock().await;

        let mut ledger = self.load()?;
        let removed = ledger.remove(filename).is_some();
        if removed {
            paths::write_json_atomic(&self.ledger_path(), &ledger)?;
            info!("revoked acceptance of {filename}");
        }
        Ok(removed)
    }
}

/// Copy a test capture over its baseline via temp-then-rename in the
/// target directory.
fn promote_to_baseline(test_image: &Path, baseline_path: &Path) -> Result<()> {
    let parent = baseline_path
        .parent()
        .ok_or_else(|| VrtError::Io("baseline path has no parent".to_string()))?;
    std::fs::create_dir_all(parent)?;

    let bytes = std::fs::read(test_image)
        .map_err(|e| VrtError::Io(format!("{}: {e}", test_image.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, &bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(baseline_path)
        .map_err(|e| VrtError::Io(format!("{}: {}", baseline_path.display(), e.error)))?;
    Ok(())
}

/// Derived tolerance caps for one `scenario::viewport` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoThresholdCap {
    pub sample_size: usize,
    pub p95_diff_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95_pixel_diff: Option<u64>,
    pub pixel_sample_size: usize,
}

/// Group key for an acceptance: recorded signals first, parsed filename
/// as fallback. `None` when neither identifies the pair.
fn group_key(acceptance: &Acceptance) -> Option<String> {
    let (scenario, viewport) = match (
        &acceptance.signals.scenario,
        &acceptance.signals.viewport,
    ) {
        (Some(scenario), Some(viewport)) => (scenario.clone(), viewport.clone()),
        _ => {
            let parsed = parse_screenshot_name(&acceptance.filename)?;
            (parsed.scenario, parsed.viewport)
        }
    };
    Some(format!("{scenario}::{viewport}"))
}

/// Derive per-group percentile caps from the acceptance history. Groups
/// with fewer than `min_sample_size` samples are discarded.
pub fn compute_auto_threshold_caps(
    acceptances: &[Acceptance],
    config: &AutoThresholdConfig,
) -> HashMap<String, AutoThresholdCap> {
    let mut groups: HashMap<String, Vec<&Acceptance>> = HashMap::new();
    for acceptance in acceptances {
        if let Some(key) = group_key(acceptance) {
            groups.entry(key).or_default().push(acceptance);
        }
    }

    groups
        .into_iter()
        .filter(|(_, samples)| samples.len() >= config.min_sample_size)
        .map(|(key, samples)| {
            let mut percentages: Vec<f64> =
                samples.iter().map(|a| a.metrics.diff_percentage).collect();
            percentages.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let mut pixels: Vec<f64> = samples
                .iter()
                .filter_map(|a| a.metrics.pixel_diff)
                .map(|p| p as f64)
                .collect();
            pixels.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let cap = AutoThresholdCap {
                sample_size: samples.len(),
                p95_diff_percentage: percentile(&percentages, config.percentile),
                p95_pixel_diff: (!pixels.is_empty())
                    .then(|| percentile(&pixels, config.percentile).round() as u64),
                pixel_sample_size: pixels.len(),
            };
            (key, cap)
        })
        .collect()
}

/// P-th percentile with linear interpolation on the sorted sample.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
    }
}
