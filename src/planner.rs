//! Task planning.
//!
//! Pure functions: merge scenario defaults, expand the scenario ×
//! browser × viewport matrix, group tasks per capture engine and filter
//! by name. Two calls with equal inputs return structurally equal
//! outputs; nothing here touches the filesystem.

use std::collections::HashSet;

use crate::config::{BrowserSpec, Scenario, ScenarioDefaults, Viewport};
use crate::paths;

/// One planned capture: a merged scenario under a browser and viewport.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenshotTask {
    pub scenario: Scenario,
    pub browser: BrowserSpec,
    pub viewport: Viewport,
}

impl ScreenshotTask {
    /// Derived screenshot filename per the sanitizing schema.
    pub fn file_name(&self) -> String {
        paths::screenshot_file_name(
            &self.scenario.name,
            self.browser.engine,
            self.browser.version.as_deref(),
            &self.viewport.name,
        )
    }

    /// Stable id used in worker protocol lines.
    pub fn task_id(&self) -> String {
        format!("{}|{}|{}", self.scenario.name, self.browser.display_key(), self.viewport.name)
    }
}

/// Tasks for one browser engine, dispatched as a single worker batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskGroup {
    pub browser: BrowserSpec,
    pub tasks: Vec<ScreenshotTask>,
}

impl TaskGroup {
    pub fn display_key(&self) -> String {
        self.browser.display_key()
    }
}

/// Merge project defaults into a scenario.
///
/// Scalars: the scenario wins when set. Arrays: defaults then scenario,
/// deduplicated preserving first occurrence. `before_screenshot`
/// snippets are sequenced (defaults run to completion first).
pub fn merge_scenario_defaults(
    scenario: &Scenario,
    defaults: Option<&ScenarioDefaults>,
) -> Scenario {
    let Some(defaults) = defaults else {
        return scenario.clone();
    };

    let mut merged = scenario.clone();
    merged.wait_for = scenario.wait_for.or(defaults.wait_for);
    merged.wait_for_selector = scenario
        .wait_for_selector
        .clone()
        .or_else(|| defaults.wait_for_selector.clone());
    merged.wait_for_timeout_ms = scenario.wait_for_timeout_ms.or(defaults.wait_for_timeout_ms);
    merged.post_interaction_wait_ms = scenario
        .post_interaction_wait_ms
        .or(defaults.post_interaction_wait_ms);
    merged.full_page = scenario.full_page.or(defaults.full_page);
    merged.diff_threshold = scenario.diff_threshold.or(defaults.diff_threshold);
    merged.before_screenshot = combine_before_screenshot(
        defaults.before_screenshot.as_deref(),
        scenario.before_screenshot.as_deref(),
    );
    merged.hide_selectors = concat_dedup(&defaults.hide_selectors, &scenario.hide_selectors);
    merged.remove_selectors =
        concat_dedup(&defaults.remove_selectors, &scenario.remove_selectors);
    merged.block_urls = concat_dedup(&defaults.block_urls, &scenario.block_urls);
    merged
}

fn concat_dedup(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    first
        .iter()
        .chain(second.iter())
        .filter(|item| seen.insert((*item).clone()))
        .cloned()
        .collect()
}

/// Sequence two page snippets: run the defaults snippet to completion,
/// then the scenario snippet, inside one asynchronous wrapper.
pub fn combine_before_screenshot(
    defaults: Option<&str>,
    scenario: Option<&str>,
) -> Option<String> {
    match (defaults, scenario) {
        (None, None) => None,
        (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
        (Some(defaults), Some(scenario)) => Some(format!(
            "(async () => {{\n{defaults}\n}})().then(async () => {{\n{scenario}\n}})"
        )),
    }
}

/// Expand the matrix and group per browser display key, preserving
/// configuration order on every axis.
pub fn group_tasks_by_browser(
    scenarios: &[Scenario],
    browsers: &[BrowserSpec],
    viewports: &[Viewport],
    defaults: Option<&ScenarioDefaults>,
) -> Vec<TaskGroup> {
    let merged: Vec<Scenario> = scenarios
        .iter()
        .map(|s| merge_scenario_defaults(s, defaults))
        .collect();

    browsers
        .iter()
        .map(|browser| TaskGroup {
            browser: browser.clone(),
            tasks: merged
                .iter()
                .flat_map(|scenario| {
                    viewports.iter().map(move |viewport| ScreenshotTask {
                        scenario: scenario.clone(),
                        browser: browser.clone(),
                        viewport: viewport.clone(),
                    })
                })
                .collect(),
        })
        .collect()
}

/// Keep scenarios whose name is in `names`, preserving original order.
/// An empty or unset filter keeps everything.
pub fn filter_scenarios(scenarios: &[Scenario], names: Option<&[String]>) -> Vec<Scenario> {
    match names {
        None => scenarios.to_vec(),
        Some(names) if names.is_empty() => scenarios.to_vec(),
        Some(names) => scenarios
            .iter()
            .filter(|s| names.iter().any(|n| n == &s.name))
            .cloned()
            .collect(),
    }
}

/// Split groups into runnable ones and the display keys whose capture
/// image is unavailable. A non-empty second half is a hard error for the
/// caller.
pub fn partition_groups_by_image_availability(
    groups: Vec<TaskGroup>,
    has_image: impl Fn(&TaskGroup) -> bool,
) -> (Vec<TaskGroup>, Vec<String>) {
    let mut runnable = Vec::new();
    let mut missing = Vec::new();
    for group in groups {
        if has_image(&group) {
            runnable.push(group);
        } else {
            missing.push(group.display_key());
        }
    }
    (runnable, missing)
}
