//! Capture orchestration.
//!
//! The concrete sandboxed browser driver lives outside the engine; it is
//! modeled as the [`CaptureWorker`] capability. The orchestrator plans
//! one batch per browser engine, dispatches the batches sequentially to
//! keep container pressure bounded, streams outcomes back over a
//! channel, and guarantees a screenshot file exists for every task even
//! when its capture failed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cancel::AbortSignal;
use crate::config::{BrowserEngine, Scenario, SnapshotConfig, Viewport};
use crate::error::Result;
use crate::image_ops;
use crate::paths;
use crate::planner::{ScreenshotTask, TaskGroup};

/// Per-task capture instruction inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CaptureTaskSpec {
    pub task_id: String,
    pub scenario: Scenario,
    pub viewport: Viewport,
    pub disable_animations: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_snapshot: Option<SnapshotCapture>,
    /// Target file inside the output directory.
    pub screenshot_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCapture {
    pub max_elements: usize,
}

/// One batch handed to a capture worker: a full engine group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CaptureBatch {
    pub engine: BrowserEngine,
    pub engine_display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub concurrency: usize,
    pub output_dir: PathBuf,
    pub tasks: Vec<CaptureTaskSpec>,
}

/// Worker-reported outcome for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CaptureOutcome {
    Ok {
        screenshot_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot_path: Option<PathBuf>,
    },
    Err {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureEvent {
    pub task_id: String,
    pub outcome: CaptureOutcome,
}

/// Aggregate record a process-backed worker writes to
/// `<output_dir>/batch-results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResults {
    pub browser: String,
    #[serde(rename = "totalTasks")]
    pub total_tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_seconds: f64,
    pub results: Vec<TaskRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskRecord {
    pub task_id: String,
    pub outcome: CaptureOutcome,
}

/// Capability implemented by capture backends.
///
/// The worker owns per-task parallelism up to `batch.concurrency` and
/// guarantees: animations frozen via global CSS when requested, hide
/// selectors become `visibility: hidden` while remove selectors become
/// `display: none`, URL blocking by substring, element-clipped capture
/// when a selector is present (a missing element is a fatal task error),
/// a 30s page-load and 10s selector-wait timeout, and a best-effort
/// capture emitted even after an error.
#[async_trait]
pub trait CaptureWorker: Send + Sync {
    async fn run_batch(
        &self,
        batch: CaptureBatch,
        events: mpsc::Sender<CaptureEvent>,
        abort: AbortSignal,
    ) -> Result<()>;

    /// Pre-flight: whether a capture image/driver exists for the engine.
    fn has_image(&self, engine: BrowserEngine, version: Option<&str>) -> bool {
        let _ = (engine, version);
        true
    }
}

/// Stdout progress line grammar emitted by process-backed workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLine {
    Start,
    Ok { task_id: String, file: String },
    Fail { task_id: String, message: String },
    Captured { task_id: String, file: String },
    Skip { task_id: String, message: String },
}

/// Parse one worker stdout line; unknown lines return `None`.
pub fn parse_worker_line(line: &str) -> Option<WorkerLine> {
    let line = line.trim();
    if line == "[START]" {
        return Some(WorkerLine::Start);
    }
    if let Some(rest) = line.strip_prefix("[OK] ") {
        let (task_id, file) = rest.split_once(" -> ")?;
        return Some(WorkerLine::Ok {
            task_id: task_id.trim().to_string(),
            file: file.trim().to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("[FAIL] ") {
        let (task_id, message) = rest.split_once(": ")?;
        return Some(WorkerLine::Fail {
            task_id: task_id.trim().to_string(),
            message: message.trim().to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("[CAPTURED] ") {
        let (task_id, file) = rest.split_once(" -> ")?;
        let file = file.trim().trim_end_matches("(after error)").trim();
        return Some(WorkerLine::Captured {
            task_id: task_id.trim().to_string(),
            file: file.to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("[SKIP] ") {
        let (task_id, message) = rest.split_once(": ")?;
        return Some(WorkerLine::Skip {
            task_id: task_id.trim().to_string(),
            message: message.trim().to_string(),
        });
    }
    None
}

/// Run phase reported through the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Capturing,
    Comparing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub phase: Phase,
    pub completed: usize,
    pub total: usize,
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Capture outcome for one planned task, in planner order.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCaptureResult {
    pub task: ScreenshotTask,
    pub screenshot_path: PathBuf,
    pub snapshot_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl TaskCaptureResult {
    pub fn is_aborted(&self) -> bool {
        self.error.as_deref() == Some("aborted")
    }
}

/// Capture settings carried across groups.
#[derive(Clone)]
pub struct CaptureSettings {
    pub output_dir: PathBuf,
    pub concurrency: usize,
    pub disable_animations: bool,
    pub dom_snapshot: SnapshotConfig,
    pub progress: Option<ProgressFn>,
}

/// Dispatch every group to the worker, one group at a time.
///
/// Individual task failures are attached to their results and a blank
/// placeholder is written so every planned task has a screenshot file.
/// Abortion between groups (or mid-batch) marks the remaining tasks with
/// an `aborted` error. The temporary staging directory is removed after
/// all groups, whatever happened.
pub async fn run_capture(
    groups: &[TaskGroup],
    worker: &dyn CaptureWorker,
    settings: &CaptureSettings,
    abort: &AbortSignal,
) -> Result<Vec<TaskCaptureResult>> {
    tokio::fs::create_dir_all(&settings.output_dir).await?;
    let staging = settings
        .output_dir
        .join(format!(".staging-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&staging).await?;

    let outcome = run_groups(groups, worker, settings, abort).await;

    if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
        warn!("failed to remove staging dir {}: {e}", staging.display());
    }
    outcome
}

async fn run_groups(
    groups: &[TaskGroup],
    worker: &dyn CaptureWorker,
    settings: &CaptureSettings,
    abort: &AbortSignal,
) -> Result<Vec<TaskCaptureResult>> {
    let mut results = Vec::new();

    for group in groups {
        if abort.is_aborted() {
            results.extend(group.tasks.iter().map(|task| aborted_result(task, settings)));
            continue;
        }

        info!(
            "capturing group {} ({} tasks, concurrency {})",
            group.display_key(),
            group.tasks.len(),
            settings.concurrency
        );
        let outcomes = run_group(group, worker, settings, abort).await?;
        results.extend(outcomes);
    }
    Ok(results)
}

fn aborted_result(task: &ScreenshotTask, settings: &CaptureSettings) -> TaskCaptureResult {
    TaskCaptureResult {
        task: task.clone(),
        screenshot_path: settings.output_dir.join(task.file_name()),
        snapshot_path: None,
        error: Some("aborted".to_string()),
    }
}

async fn run_group(
    group: &TaskGroup,
    worker: &dyn CaptureWorker,
    settings: &CaptureSettings,
    abort: &AbortSignal,
) -> Result<Vec<TaskCaptureResult>> {
    let batch = CaptureBatch {
        engine: group.browser.engine,
        engine_display_name: group.display_key(),
        version: group.browser.version.clone(),
        concurrency: settings.concurrency,
        output_dir: settings.output_dir.clone(),
        tasks: group
            .tasks
            .iter()
            .map(|task| CaptureTaskSpec {
                task_id: task.task_id(),
                scenario: task.scenario.clone(),
                viewport: task.viewport.clone(),
                disable_animations: settings.disable_animations,
                capture_snapshot: settings.dom_snapshot.enabled.then(|| SnapshotCapture {
                    max_elements: settings.dom_snapshot.max_elements,
                }),
                screenshot_file: task.file_name(),
            })
            .collect(),
    };

    // Bounded channel: a slow consumer back-pressures the worker.
    let (tx, mut rx) = mpsc::channel::<CaptureEvent>(64);
    let total = group.tasks.len();

    let worker_future = worker.run_batch(batch, tx, abort.clone());
    tokio::pin!(worker_future);

    let mut outcomes: HashMap<String, CaptureOutcome> = HashMap::new();
    let mut completed = 0usize;
    let mut worker_result: Option<Result<()>> = None;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        completed += 1;
                        if let Some(progress) = &settings.progress {
                            progress(Progress {
                                phase: Phase::Capturing,
                                completed,
                                total,
                            });
                        }
                        outcomes.insert(event.task_id, event.outcome);
                    }
                    // Sender dropped: worker is done emitting.
                    None => {
                        if worker_result.is_none() {
                            worker_result = Some(worker_future.await);
                        }
                        break;
                    }
                }
            }
            result = &mut worker_future, if worker_result.is_none() => {
                worker_result = Some(result);
                // Drain whatever is still buffered.
                while let Some(event) = rx.recv().await {
                    completed += 1;
                    outcomes.insert(event.task_id, event.outcome);
                }
                break;
            }
        }
    }

    if let Some(Err(e)) = worker_result {
        if e.is_fatal() {
            return Err(e);
        }
        warn!("capture worker for {} failed: {e}", group.display_key());
    }

    let mut results = Vec::with_capacity(group.tasks.len());
    for task in &group.tasks {
        let expected = settings.output_dir.join(task.file_name());
        let result = match outcomes.remove(&task.task_id()) {
            Some(CaptureOutcome::Ok {
                screenshot_path,
                snapshot_path,
            }) => TaskCaptureResult {
                task: task.clone(),
                screenshot_path,
                snapshot_path,
                error: None,
            },
            Some(CaptureOutcome::Err { message }) => {
                ensure_placeholder(&expected, &task.viewport);
                TaskCaptureResult {
                    task: task.clone(),
                    screenshot_path: expected,
                    snapshot_path: None,
                    error: Some(message),
                }
            }
            None if abort.is_aborted() => aborted_result(task, settings),
            None => {
                ensure_placeholder(&expected, &task.viewport);
                TaskCaptureResult {
                    task: task.clone(),
                    screenshot_path: expected,
                    snapshot_path: None,
                    error: Some("no outcome reported by capture worker".to_string()),
                }
            }
        };
        results.push(result);
    }
    Ok(results)
}

/// Write the stable blank capture when none exists for the task.
fn ensure_placeholder(path: &Path, viewport: &Viewport) {
    if path.is_file() {
        return;
    }
    let placeholder = image_ops::blank_placeholder(viewport.width, viewport.height);
    if let Err(e) = image_ops::write_png(&placeholder, path) {
        warn!("failed to write placeholder {}: {e}", path.display());
    }
}

/// Locate the DOM snapshot sibling for a captured screenshot, if the
/// worker produced one.
pub fn existing_snapshot(screenshot: &Path) -> Option<PathBuf> {
    let sibling = paths::snapshot_sibling(screenshot);
    sibling.is_file().then_some(sibling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrowserSpec;
    use crate::planner;

    struct ScriptedWorker {
        /// Task ids to fail with the given message.
        failures: HashMap<String, String>,
    }

    #[async_trait]
    impl CaptureWorker for ScriptedWorker {
        async fn run_batch(
            &self,
            batch: CaptureBatch,
            events: mpsc::Sender<CaptureEvent>,
            _abort: AbortSignal,
        ) -> Result<()> {
            for task in &batch.tasks {
                let outcome = match self.failures.get(&task.task_id) {
                    Some(message) => CaptureOutcome::Err {
                        message: message.clone(),
                    },
                    None => {
                        let path = batch.output_dir.join(&task.screenshot_file);
                        image_ops::write_png(
                            &image_ops::blank_placeholder(4, 4),
                            &path,
                        )?;
                        CaptureOutcome::Ok {
                            screenshot_path: path,
                            snapshot_path: None,
                        }
                    }
                };
                events
                    .send(CaptureEvent {
                        task_id: task.task_id.clone(),
                        outcome,
                    })
                    .await
                    .map_err(|e| crate::error::VrtError::CaptureFailure(e.to_string()))?;
            }
            Ok(())
        }
    }

    fn plan_one_group() -> Vec<TaskGroup> {
        let scenarios = vec![
            Scenario::new("home", "https://example.com"),
            Scenario::new("about", "https://example.com/about"),
        ];
        let browsers = vec![BrowserSpec::new(BrowserEngine::Chromium)];
        let viewports = vec![Viewport::new("desktop", 1280, 720)];
        planner::group_tasks_by_browser(&scenarios, &browsers, &viewports, None)
    }

    fn settings(output_dir: PathBuf) -> CaptureSettings {
        CaptureSettings {
            output_dir,
            concurrency: 2,
            disable_animations: true,
            dom_snapshot: SnapshotConfig::default(),
            progress: None,
        }
    }

    #[tokio::test]
    async fn capture_preserves_planner_order() {
        let dir = tempfile::tempdir().unwrap();
        let worker = ScriptedWorker {
            failures: HashMap::new(),
        };
        let results = run_capture(
            &plan_one_group(),
            &worker,
            &settings(dir.path().to_path_buf()),
            &AbortSignal::new(),
        )
        .await
        .unwrap();

        let names: Vec<&str> = results
            .iter()
            .map(|r| r.task.scenario.name.as_str())
            .collect();
        assert_eq!(names, vec!["home", "about"]);
        assert!(results.iter().all(|r| r.error.is_none()));
        assert!(results.iter().all(|r| r.screenshot_path.is_file()));
    }

    #[tokio::test]
    async fn failed_task_gets_placeholder_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut failures = HashMap::new();
        failures.insert(
            "home|chromium|desktop".to_string(),
            "net::ERR_CONNECTION_REFUSED".to_string(),
        );
        let worker = ScriptedWorker { failures };

        let results = run_capture(
            &plan_one_group(),
            &worker,
            &settings(dir.path().to_path_buf()),
            &AbortSignal::new(),
        )
        .await
        .unwrap();

        let failed = &results[0];
        assert_eq!(
            failed.error.as_deref(),
            Some("net::ERR_CONNECTION_REFUSED")
        );
        assert!(
            failed.screenshot_path.is_file(),
            "placeholder must exist for the comparator"
        );
        assert!(results[1].error.is_none());
    }

    #[tokio::test]
    async fn abort_before_group_marks_tasks_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let worker = ScriptedWorker {
            failures: HashMap::new(),
        };
        let abort = AbortSignal::new();
        abort.abort();

        let results = run_capture(
            &plan_one_group(),
            &worker,
            &settings(dir.path().to_path_buf()),
            &abort,
        )
        .await
        .unwrap();
        assert!(results.iter().all(TaskCaptureResult::is_aborted));
    }

    #[tokio::test]
    async fn staging_dir_removed_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let worker = ScriptedWorker {
            failures: HashMap::new(),
        };
        run_capture(
            &plan_one_group(),
            &worker,
            &settings(dir.path().to_path_buf()),
            &AbortSignal::new(),
        )
        .await
        .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn worker_line_grammar() {
        assert_eq!(parse_worker_line("[START]"), Some(WorkerLine::Start));
        assert_eq!(
            parse_worker_line("[OK] home|chromium|desktop -> home_chromium_desktop.png"),
            Some(WorkerLine::Ok {
                task_id: "home|chromium|desktop".to_string(),
                file: "home_chromium_desktop.png".to_string(),
            })
        );
        assert_eq!(
            parse_worker_line("[FAIL] home|chromium|desktop: timeout waiting for selector"),
            Some(WorkerLine::Fail {
                task_id: "home|chromium|desktop".to_string(),
                message: "timeout waiting for selector".to_string(),
            })
        );
        assert_eq!(
            parse_worker_line(
                "[CAPTURED] home|chromium|desktop -> home_chromium_desktop.png (after error)"
            ),
            Some(WorkerLine::Captured {
                task_id: "home|chromium|desktop".to_string(),
                file: "home_chromium_desktop.png".to_string(),
            })
        );
        assert_eq!(
            parse_worker_line("[SKIP] about|chromium|desktop: filtered out"),
            Some(WorkerLine::Skip {
                task_id: "about|chromium|desktop".to_string(),
                message: "filtered out".to_string(),
            })
        );
        assert_eq!(parse_worker_line("random noise"), None);
    }

    #[test]
    fn batch_results_json_shape() {
        let record = BatchResults {
            browser: "chromium".to_string(),
            total_tasks: 2,
            succeeded: 1,
            failed: 1,
            elapsed_seconds: 12.5,
            results: vec![],
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("totalTasks").is_some());
        assert!(json.get("elapsed_seconds").is_some());
    }
}
