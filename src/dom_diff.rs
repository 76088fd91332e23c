//! DOM snapshot diffing.
//!
//! Matches elements across two snapshots (stable key first, quantized
//! geometry as fallback), emits typed findings for text, layout and style
//! changes, and classifies the whole diff into a change category for the
//! scorer. This is the semantic layer the pixel engines cannot see.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dom::{DomElement, DomSnapshot};
use crate::score::{ChangeCategory, Severity};

/// Box movement below this many CSS pixels is ignored entirely.
const MOVE_EPSILON_PX: f64 = 2.0;
/// Geometry fallback matching quantizes coordinates to this cell size.
const MATCH_CELL_PX: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    TextChanged,
    TextMoved,
    LayoutShift,
    SpacingChange,
    BackgroundChange,
    StyleChange,
    ElementAdded,
    ElementRemoved,
}

/// One semantic difference between the snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomFinding {
    pub kind: FindingKind,
    pub severity: Severity,
    /// Selector path of the affected element (test side when present).
    pub path: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

/// Counts per finding kind plus the matched-unchanged tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomDiffSummary {
    pub text_changed: usize,
    pub text_moved: usize,
    pub layout_shift: usize,
    pub spacing_change: usize,
    pub background_change: usize,
    pub style_change: usize,
    pub element_added: usize,
    pub element_removed: usize,
    pub unchanged: usize,
}

impl DomDiffSummary {
    pub fn total_findings(&self) -> usize {
        self.text_changed
            + self.text_moved
            + self.layout_shift
            + self.spacing_change
            + self.background_change
            + self.style_change
            + self.element_added
            + self.element_removed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomDiffResult {
    pub findings: Vec<DomFinding>,
    pub summary: DomDiffSummary,
    /// `unchanged / max(|baseline|, |test|, 1)`.
    pub similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ChangeCategory>,
}

/// Stable identity of an element: test id, then id, then selector path.
fn stable_key(element: &DomElement) -> String {
    if let Some(test_id) = element.test_id.as_deref().filter(|s| !s.is_empty()) {
        return format!("testid:{test_id}");
    }
    if let Some(id) = element.id.as_deref().filter(|s| !s.is_empty()) {
        return format!("id:{id}");
    }
    format!("path:{}", element.path)
}

/// Quantized geometry key used when no stable key matches.
fn geometry_key(element: &DomElement) -> (String, i64, i64) {
    (
        element.tag.clone(),
        (element.bounds.x / MATCH_CELL_PX).round() as i64,
        (element.bounds.y / MATCH_CELL_PX).round() as i64,
    )
}

fn movement_severity(delta: f64) -> Severity {
    if delta > 20.0 {
        Severity::Critical
    } else if delta > 5.0 {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// Diff two snapshots into typed findings.
pub fn diff_snapshots(baseline: &DomSnapshot, test: &DomSnapshot) -> DomDiffResult {
    let mut matched: Vec<(usize, usize)> = Vec::new();
    let mut baseline_taken = vec![false; baseline.elements.len()];
    let mut test_taken = vec![false; test.elements.len()];

    // Pass 1: stable keys.
    let mut by_key: HashMap<String, usize> = HashMap::new();
    for (idx, element) in baseline.elements.iter().enumerate() {
        by_key.entry(stable_key(element)).or_insert(idx);
    }
    for (test_idx, element) in test.elements.iter().enumerate() {
        if let Some(&baseline_idx) = by_key.get(&stable_key(element)) {
            if !baseline_taken[baseline_idx] {
                baseline_taken[baseline_idx] = true;
                test_taken[test_idx] = true;
                matched.push((baseline_idx, test_idx));
            }
        }
    }

    // Pass 2: quantized geometry, same tag only.
    let mut by_geometry: HashMap<(String, i64, i64), Vec<usize>> = HashMap::new();
    for (idx, element) in baseline.elements.iter().enumerate() {
        if !baseline_taken[idx] {
            by_geometry.entry(geometry_key(element)).or_default().push(idx);
        }
    }
    for (test_idx, element) in test.elements.iter().enumerate() {
        if test_taken[test_idx] {
            continue;
        }
        if let Some(candidates) = by_geometry.get_mut(&geometry_key(element)) {
            while let Some(baseline_idx) = candidates.pop() {
                if !baseline_taken[baseline_idx] {
                    baseline_taken[baseline_idx] = true;
                    test_taken[test_idx] = true;
                    matched.push((baseline_idx, test_idx));
                    break;
                }
            }
        }
    }

    let mut findings = Vec::new();
    let mut summary = DomDiffSummary::default();

    for &(baseline_idx, test_idx) in &matched {
        let before = findings.len();
        diff_pair(
            &baseline.elements[baseline_idx],
            &test.elements[test_idx],
            &mut findings,
            &mut summary,
        );
        if findings.len() == before {
            summary.unchanged += 1;
        }
    }

    for (idx, element) in test.elements.iter().enumerate() {
        if !test_taken[idx] {
            let severity = if element.bounds.intersects_viewport(test.viewport) {
                Severity::Critical
            } else {
                Severity::Warning
            };
            summary.element_added += 1;
            findings.push(DomFinding {
                kind: FindingKind::ElementAdded,
                severity,
                path: element.path.clone(),
                detail: format!("element <{}> added", element.tag),
                before: None,
                after: element.text.clone(),
            });
        }
    }

    for (idx, element) in baseline.elements.iter().enumerate() {
        if !baseline_taken[idx] {
            let severity = if element.bounds.intersects_viewport(baseline.viewport) {
                Severity::Critical
            } else {
                Severity::Warning
            };
            summary.element_removed += 1;
            findings.push(DomFinding {
                kind: FindingKind::ElementRemoved,
                severity,
                path: element.path.clone(),
                detail: format!("element <{}> removed", element.tag),
                before: element.text.clone(),
                after: None,
            });
        }
    }

    let denominator = baseline.elements.len().max(test.elements.len()).max(1);
    let similarity = summary.unchanged as f64 / denominator as f64;
    let category = classify(&summary, &findings);

    DomDiffResult {
        findings,
        summary,
        similarity,
        category,
    }
}

fn diff_pair(
    baseline: &DomElement,
    test: &DomElement,
    findings: &mut Vec<DomFinding>,
    summary: &mut DomDiffSummary,
) {
    let text_equal = baseline.text == test.text;
    if !text_equal {
        summary.text_changed += 1;
        findings.push(DomFinding {
            kind: FindingKind::TextChanged,
            severity: Severity::Warning,
            path: test.path.clone(),
            detail: "text content changed".to_string(),
            before: baseline.text.clone(),
            after: test.text.clone(),
        });
    }

    let dx = (baseline.bounds.x - test.bounds.x).abs();
    let dy = (baseline.bounds.y - test.bounds.y).abs();
    let dw = (baseline.bounds.w - test.bounds.w).abs();
    let dh = (baseline.bounds.h - test.bounds.h).abs();
    let movement = dx.max(dy).max(dw).max(dh);

    if movement > MOVE_EPSILON_PX {
        let severity = movement_severity(movement);
        let has_text = text_equal && test.text.as_deref().is_some_and(|t| !t.is_empty());
        let kind = if has_text {
            summary.text_moved += 1;
            FindingKind::TextMoved
        } else {
            summary.layout_shift += 1;
            FindingKind::LayoutShift
        };
        findings.push(DomFinding {
            kind,
            severity,
            path: test.path.clone(),
            detail: format!("box moved by {movement:.1}px"),
            before: Some(format!(
                "{:.0},{:.0} {:.0}x{:.0}",
                baseline.bounds.x, baseline.bounds.y, baseline.bounds.w, baseline.bounds.h
            )),
            after: Some(format!(
                "{:.0},{:.0} {:.0}x{:.0}",
                test.bounds.x, test.bounds.y, test.bounds.w, test.bounds.h
            )),
        });
    }

    let spacing = [
        ("padding", &baseline.styles.padding, &test.styles.padding),
        ("margin", &baseline.styles.margin, &test.styles.margin),
    ];
    for (property, before, after) in spacing {
        if before != after {
            summary.spacing_change += 1;
            findings.push(DomFinding {
                kind: FindingKind::SpacingChange,
                severity: Severity::Info,
                path: test.path.clone(),
                detail: format!("{property} changed"),
                before: (*before).clone(),
                after: (*after).clone(),
            });
        }
    }

    if baseline.styles.background_color != test.styles.background_color {
        summary.background_change += 1;
        findings.push(DomFinding {
            kind: FindingKind::BackgroundChange,
            severity: Severity::Info,
            path: test.path.clone(),
            detail: "background color changed".to_string(),
            before: baseline.styles.background_color.clone(),
            after: test.styles.background_color.clone(),
        });
    }

    let tracked = [
        ("color", &baseline.styles.color, &test.styles.color),
        ("font-size", &baseline.styles.font_size, &test.styles.font_size),
        (
            "font-family",
            &baseline.styles.font_family,
            &test.styles.font_family,
        ),
        (
            "font-weight",
            &baseline.styles.font_weight,
            &test.styles.font_weight,
        ),
        (
            "line-height",
            &baseline.styles.line_height,
            &test.styles.line_height,
        ),
        (
            "border-width",
            &baseline.styles.border_width,
            &test.styles.border_width,
        ),
        (
            "border-color",
            &baseline.styles.border_color,
            &test.styles.border_color,
        ),
        ("display", &baseline.styles.display, &test.styles.display),
        ("position", &baseline.styles.position, &test.styles.position),
        ("opacity", &baseline.styles.opacity, &test.styles.opacity),
    ];
    for (property, before, after) in tracked {
        if before != after {
            // Display and position swaps restructure layout; the rest are
            // paint-only.
            let severity = if property == "display" || property == "position" {
                Severity::Warning
            } else {
                Severity::Info
            };
            summary.style_change += 1;
            findings.push(DomFinding {
                kind: FindingKind::StyleChange,
                severity,
                path: test.path.clone(),
                detail: format!("{property} changed"),
                before: (*before).clone(),
                after: (*after).clone(),
            });
        }
    }
}

/// Map the finding set to a change category for the scorer.
fn classify(summary: &DomDiffSummary, findings: &[DomFinding]) -> Option<ChangeCategory> {
    if summary.total_findings() == 0 {
        return None;
    }
    if findings.iter().any(|f| f.severity == Severity::Critical) {
        return Some(ChangeCategory::Regression);
    }
    if summary.text_changed > 0 || summary.element_added + summary.element_removed > 0 {
        return Some(ChangeCategory::ContentChange);
    }
    let moved = summary.text_moved + summary.layout_shift + summary.spacing_change;
    if moved > 0 {
        let only_info = findings.iter().all(|f| f.severity == Severity::Info);
        return Some(if only_info {
            ChangeCategory::Noise
        } else {
            ChangeCategory::LayoutShift
        });
    }
    Some(ChangeCategory::Cosmetic)
}
