//! Public façade orchestrating the full pipeline.
//!
//! `VrtService` owns the validated configuration plus the deployment's
//! capture and vision capabilities, and exposes the three entry points:
//! [`VrtService::run_test_job`], [`VrtService::compare_pair`] and
//! [`VrtService::run_cross_compare`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::cancel::AbortSignal;
use crate::compare::{self, AiTriage, CompareOptions, ComparisonResult};
use crate::config::VrtConfig;
use crate::cross::{self, CrossReport};
use crate::dom::DomSnapshot;
use crate::error::{Result, VrtError};
use crate::metrics::Metrics;
use crate::orchestrator::{
    self, CaptureSettings, CaptureWorker, Phase, Progress, ProgressFn, TaskCaptureResult,
};
use crate::paths::{self, ImageRecord, MetadataSidecar};
use crate::planner;
use crate::store::{self, AcceptanceStore, AutoThresholdCap};
use crate::vision::VisionProvider;

/// Per-job options layered on top of the project configuration.
#[derive(Clone, Default)]
pub struct TestJobOptions {
    /// Run only these scenario names; empty or unset runs everything.
    pub scenario_filter: Option<Vec<String>>,
    pub progress: Option<ProgressFn>,
    pub abort: AbortSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Aborted,
}

/// Aggregate outcome of one test job.
#[derive(Debug, Clone)]
pub struct TestJobReport {
    pub status: JobStatus,
    /// One result per planned task, in planner order.
    pub results: Vec<ComparisonResult>,
    /// Capture failures attached to their screenshot filename.
    pub capture_failures: Vec<(String, String)>,
    pub matched: usize,
    pub diffs: usize,
    pub missing_baselines: usize,
    pub errors: usize,
    pub elapsed_seconds: f64,
}

pub struct VrtService {
    config: VrtConfig,
    worker: Arc<dyn CaptureWorker>,
    vision: Option<Arc<dyn VisionProvider>>,
    acceptances: AcceptanceStore,
    metrics: Metrics,
}

impl VrtService {
    /// Validate the configuration and assemble the service.
    pub fn new(config: VrtConfig, worker: Arc<dyn CaptureWorker>) -> Result<Self> {
        config.validate()?;
        let acceptances = AcceptanceStore::new(project_dir(&config));
        Ok(Self {
            config,
            worker,
            vision: None,
            acceptances,
            metrics: Metrics::new(),
        })
    }

    /// Attach an AI vision backend; triage only runs when the config
    /// also enables it.
    pub fn with_vision(mut self, provider: Arc<dyn VisionProvider>) -> Self {
        self.vision = Some(provider);
        self
    }

    pub fn config(&self) -> &VrtConfig {
        &self.config
    }

    pub fn acceptance_store(&self) -> &AcceptanceStore {
        &self.acceptances
    }

    fn ai_triage(&self) -> Option<AiTriage> {
        if !self.config.ai.enabled || self.config.quick_mode {
            return None;
        }
        let provider = self.vision.clone()?;
        Some(AiTriage {
            config: self.config.ai.clone(),
            provider,
        })
    }

    /// Capture the whole scenario × browser × viewport matrix and compare
    /// every capture against its baseline.
    pub async fn run_test_job(&self, options: TestJobOptions) -> Result<TestJobReport> {
        let started = Instant::now();

        let scenarios = planner::filter_scenarios(
            &self.config.scenarios,
            options.scenario_filter.as_deref(),
        );
        if scenarios.is_empty() {
            return Err(VrtError::config("no scenarios selected"));
        }

        let groups = planner::group_tasks_by_browser(
            &scenarios,
            &self.config.browsers,
            &self.config.viewports,
            self.config.scenario_defaults.as_ref(),
        );

        let (groups, missing) = planner::partition_groups_by_image_availability(groups, |g| {
            self.worker.has_image(g.browser.engine, g.browser.version.as_deref())
        });
        if !missing.is_empty() {
            return Err(VrtError::HardImageMismatch { missing });
        }

        let settings = CaptureSettings {
            output_dir: self.config.output_dir.clone(),
            concurrency: self.config.concurrency,
            disable_animations: self.config.disable_animations,
            dom_snapshot: self.config.dom_snapshot.clone(),
            progress: options.progress.clone(),
        };
        let captures =
            orchestrator::run_capture(&groups, self.worker.as_ref(), &settings, &options.abort)
                .await?;

        self.write_sidecar(&captures)?;

        let caps = if self.config.auto_threshold.enabled {
            let ledger = self.acceptances.load()?;
            store::compute_auto_threshold_caps(&ledger.acceptances, &self.config.auto_threshold)
        } else {
            Default::default()
        };

        let results = self
            .compare_captures(&captures, &caps, &options)
            .await?;

        let report_path = self.config.output_dir.join("results.json");
        paths::write_json_atomic(&report_path, &results)?;

        if let Some(progress) = &options.progress {
            progress(Progress {
                phase: Phase::Done,
                completed: results.len(),
                total: results.len(),
            });
        }

        let capture_failures: Vec<(String, String)> = captures
            .iter()
            .filter_map(|c| {
                c.error
                    .as_ref()
                    .map(|e| (c.task.file_name(), e.clone()))
            })
            .collect();
        for _ in &capture_failures {
            self.metrics.record_capture_failure();
        }
        self.metrics
            .record_compare_duration(started.elapsed().as_secs_f64());

        let mut report = TestJobReport {
            status: if options.abort.is_aborted() {
                JobStatus::Aborted
            } else {
                JobStatus::Completed
            },
            matched: results.iter().filter(|r| r.is_match()).count(),
            diffs: results.iter().filter(|r| r.is_diff()).count(),
            missing_baselines: results
                .iter()
                .filter(|r| matches!(r, ComparisonResult::NoBaseline { .. }))
                .count(),
            errors: results
                .iter()
                .filter(|r| matches!(r, ComparisonResult::Error { .. }))
                .count(),
            elapsed_seconds: started.elapsed().as_secs_f64(),
            results,
            capture_failures,
        };
        // Missing tests are rare (worker placeholders cover failures) but
        // count as errors for reporting purposes.
        report.errors += report
            .results
            .iter()
            .filter(|r| matches!(r, ComparisonResult::NoTest { .. }))
            .count();

        info!(
            "test job {:?}: {} matched, {} diffs, {} new, {} errors in {:.1}s",
            report.status,
            report.matched,
            report.diffs,
            report.missing_baselines,
            report.errors,
            report.elapsed_seconds
        );
        Ok(report)
    }

    async fn compare_captures(
        &self,
        captures: &[TaskCaptureResult],
        caps: &std::collections::HashMap<String, AutoThresholdCap>,
        options: &TestJobOptions,
    ) -> Result<Vec<ComparisonResult>> {
        let total = captures.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let ai = self.ai_triage();

        let mut handles = Vec::with_capacity(total);
        for capture in captures {
            let file_name = capture.task.file_name();
            let baseline_path = self.config.baseline_dir.join(&file_name);
            let test_path = capture.screenshot_path.clone();
            let diff_path = paths::diff_path(&self.config.output_dir, &file_name);
            let compare_options = self.pair_options(capture, &baseline_path, caps);
            let aborted_capture = capture.is_aborted();

            let semaphore = semaphore.clone();
            let abort = options.abort.clone();
            let progress = options.progress.clone();
            let completed = completed.clone();
            let ai = ai.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| VrtError::Io(e.to_string()))?;
                let result = if aborted_capture || abort.is_aborted() {
                    ComparisonResult::Error {
                        baseline: baseline_path,
                        test: test_path,
                        error: "aborted".to_string(),
                    }
                } else {
                    compare::compare_pair(
                        &baseline_path,
                        &test_path,
                        &diff_path,
                        &compare_options,
                        ai.as_ref(),
                        &abort,
                    )
                    .await
                };

                if let Some(progress) = progress {
                    progress(Progress {
                        phase: Phase::Comparing,
                        completed: completed.fetch_add(1, Ordering::Relaxed) + 1,
                        total,
                    });
                }
                Ok::<ComparisonResult, VrtError>(result)
            }));
        }

        let mut results = Vec::with_capacity(total);
        for handle in handles {
            let result = handle
                .await
                .map_err(|e| VrtError::Io(format!("compare task panicked: {e}")))??;
            self.metrics.record_comparison(&result);
            results.push(result);
        }
        Ok(results)
    }

    fn pair_options(
        &self,
        capture: &TaskCaptureResult,
        baseline_path: &Path,
        caps: &std::collections::HashMap<String, AutoThresholdCap>,
    ) -> CompareOptions {
        let task = &capture.task;
        let mut options = CompareOptions::from_config(&self.config);
        options.label = format!("{} ({})", task.scenario.name, task.viewport.name);
        options.max_diff_percentage = task
            .scenario
            .diff_threshold
            .or(self.config.diff_threshold);

        // Explicit tolerances win; history-derived caps only fill gaps.
        if options.max_diff_percentage.is_none() || options.max_diff_pixels.is_none() {
            let key = format!("{}::{}", task.scenario.name, task.viewport.name);
            if let Some(cap) = caps.get(&key) {
                if options.max_diff_percentage.is_none() {
                    options.max_diff_percentage = Some(cap.p95_diff_percentage);
                }
                if options.max_diff_pixels.is_none() {
                    options.max_diff_pixels = cap.p95_pixel_diff;
                }
            }
        }

        if !self.config.quick_mode {
            // A worker may have written the sibling without reporting it.
            let test_sidecar = capture
                .snapshot_path
                .clone()
                .unwrap_or_else(|| paths::snapshot_sibling(&capture.screenshot_path));
            options.test_snapshot = load_snapshot(&test_sidecar);
            options.baseline_snapshot =
                load_snapshot(&paths::snapshot_sibling(baseline_path));
        }
        options
    }

    /// Compare one explicit pair with project defaults.
    pub async fn compare_pair(
        &self,
        baseline: &Path,
        test: &Path,
        diff: &Path,
        abort: &AbortSignal,
    ) -> ComparisonResult {
        let mut options = CompareOptions::from_config(&self.config);
        options.label = test
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        compare::compare_pair(baseline, test, diff, &options, self.ai_triage().as_ref(), abort)
            .await
    }

    /// Run the configured cross-compare matrix.
    pub async fn run_cross_compare(
        &self,
        pairs: Option<&[String]>,
        abort: &AbortSignal,
    ) -> Result<Vec<CrossReport>> {
        cross::run_cross_compare(&self.config, pairs, self.ai_triage().as_ref(), abort).await
    }

    /// Approve a compared pair: record the acceptance and promote the
    /// test capture to the baseline directory.
    pub async fn approve_result(
        &self,
        result: &ComparisonResult,
        reason: Option<String>,
    ) -> Result<()> {
        let test = result.test();
        let filename = test
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| VrtError::Io(format!("no filename in {}", test.display())))?;
        let parsed = paths::parse_screenshot_name(&filename);
        let (ssim, phash) = match result {
            ComparisonResult::Match { ssim, phash, .. }
            | ComparisonResult::Diff { ssim, phash, .. } => (*ssim, *phash),
            _ => (None, None),
        };

        let acceptance = store::Acceptance {
            filename: filename.clone(),
            accepted_at: chrono::Utc::now(),
            compared_against: store::ComparedAgainst {
                filename: result
                    .baseline()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| filename.clone()),
                kind: store::ReferenceKind::Baseline,
            },
            metrics: store::AcceptanceMetrics {
                diff_percentage: result.diff_percentage(),
                pixel_diff: Some(result.pixel_diff()),
                ssim,
                phash,
            },
            signals: store::AcceptanceSignals {
                scenario: parsed.as_ref().map(|p| p.scenario.clone()),
                viewport: parsed.as_ref().map(|p| p.viewport.clone()),
            },
            reason,
        };
        self.acceptances
            .approve(acceptance, test, &self.config.baseline_dir)
            .await
    }

    fn write_sidecar(&self, captures: &[TaskCaptureResult]) -> Result<()> {
        let mut sidecar = MetadataSidecar::new();
        for capture in captures {
            let task = &capture.task;
            sidecar.insert(ImageRecord {
                filename: task.file_name(),
                scenario: task.scenario.name.clone(),
                browser: task.browser.engine.as_str().to_string(),
                version: task.browser.version.clone(),
                viewport: task.viewport.name.clone(),
            });
        }
        sidecar.save(&self.config.output_dir)
    }
}

/// The project directory holding the ledger, one level above the
/// baseline directory.
fn project_dir(config: &VrtConfig) -> PathBuf {
    config
        .baseline_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.baseline_dir.clone())
}

fn load_snapshot(path: &Path) -> Option<DomSnapshot> {
    if !path.is_file() {
        return None;
    }
    match DomSnapshot::load(path) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("ignoring unreadable snapshot {}: {e}", path.display());
            None
        }
    }
}

/// Install a global tracing subscriber. Embedders that bring their own
/// subscriber skip this; calling it twice is harmless.
pub fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}
