//! DOM snapshot model.
//!
//! Snapshots are captured by the browser worker as a flat element arena
//! with integer child indices, and that array stays the canonical on-disk
//! form. Parent navigation, when needed, comes from a reverse index built
//! once per snapshot.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VrtError};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizePair {
    pub w: f64,
    pub h: f64,
}

/// Element geometry in CSS pixels, relative to the page origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl ElementBox {
    /// Whether any part of the box lies inside the viewport rectangle.
    pub fn intersects_viewport(&self, viewport: SizePair) -> bool {
        self.x < viewport.w && self.y < viewport.h && self.x + self.w > 0.0 && self.y + self.h > 0.0
    }
}

/// Computed style subset tracked by the differ.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementStyles {
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub background_color: Option<String>,
    #[serde(default)]
    pub font_size: Option<String>,
    #[serde(default)]
    pub font_family: Option<String>,
    #[serde(default)]
    pub font_weight: Option<String>,
    #[serde(default)]
    pub line_height: Option<String>,
    #[serde(default)]
    pub padding: Option<String>,
    #[serde(default)]
    pub margin: Option<String>,
    #[serde(default)]
    pub border_width: Option<String>,
    #[serde(default)]
    pub border_color: Option<String>,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub opacity: Option<String>,
}

/// One element in the arena. `children` are indices into
/// [`DomSnapshot::elements`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomElement {
    /// CSS-like selector path from the root.
    pub path: String,
    pub tag: String,
    #[serde(rename = "box")]
    pub bounds: ElementBox,
    #[serde(default)]
    pub styles: ElementStyles,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub test_id: Option<String>,
    #[serde(default)]
    pub children: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomSnapshot {
    pub version: u32,
    pub viewport: SizePair,
    pub scroll_size: SizePair,
    pub elements: Vec<DomElement>,
    pub captured_at: DateTime<Utc>,
}

impl DomSnapshot {
    pub fn new(viewport: SizePair, scroll_size: SizePair, elements: Vec<DomElement>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            viewport,
            scroll_size,
            elements,
            captured_at: Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| VrtError::Io(format!("{}: {e}", path.display())))?;
        let snapshot: DomSnapshot = serde_json::from_str(&raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(VrtError::Serialization(format!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                path.display()
            )));
        }
        Ok(snapshot)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::paths::write_json_atomic(path, self)
    }

    /// Build the parent index for the arena: `result[i]` is the index of
    /// the element whose `children` contains `i`.
    pub fn parent_index(&self) -> Vec<Option<usize>> {
        let mut parents = vec![None; self.elements.len()];
        for (idx, element) in self.elements.iter().enumerate() {
            for &child in &element.children {
                if child < parents.len() {
                    parents[child] = Some(idx);
                }
            }
        }
        parents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(path: &str, tag: &str) -> DomElement {
        DomElement {
            path: path.to_string(),
            tag: tag.to_string(),
            bounds: ElementBox {
                x: 0.0,
                y: 0.0,
                w: 10.0,
                h: 10.0,
            },
            styles: ElementStyles::default(),
            text: None,
            id: None,
            test_id: None,
            children: Vec::new(),
        }
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.snapshot.json");

        let mut root = element("body", "body");
        root.children = vec![1];
        let snapshot = DomSnapshot::new(
            SizePair { w: 1280.0, h: 720.0 },
            SizePair { w: 1280.0, h: 2400.0 },
            vec![root, element("body > h1", "h1")],
        );
        snapshot.save(&path).unwrap();

        let loaded = DomSnapshot::load(&path).unwrap();
        assert_eq!(loaded.elements, snapshot.elements);
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
    }

    #[test]
    fn unsupported_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.snapshot.json");
        let mut snapshot = DomSnapshot::new(
            SizePair { w: 1.0, h: 1.0 },
            SizePair { w: 1.0, h: 1.0 },
            vec![],
        );
        snapshot.version = 7;
        crate::paths::write_json_atomic(&path, &snapshot).unwrap();
        assert!(DomSnapshot::load(&path).is_err());
    }

    #[test]
    fn parent_index_inverts_children() {
        let mut root = element("body", "body");
        root.children = vec![1, 2];
        let mut section = element("body > div", "div");
        section.children = vec![3];
        let snapshot = DomSnapshot::new(
            SizePair { w: 1.0, h: 1.0 },
            SizePair { w: 1.0, h: 1.0 },
            vec![
                root,
                section,
                element("body > p", "p"),
                element("body > div > span", "span"),
            ],
        );

        let parents = snapshot.parent_index();
        assert_eq!(parents, vec![None, Some(0), Some(0), Some(1)]);
    }

    #[test]
    fn viewport_intersection() {
        let viewport = SizePair { w: 100.0, h: 100.0 };
        let inside = ElementBox {
            x: 10.0,
            y: 10.0,
            w: 5.0,
            h: 5.0,
        };
        let below_fold = ElementBox {
            x: 0.0,
            y: 500.0,
            w: 50.0,
            h: 50.0,
        };
        assert!(inside.intersects_viewport(viewport));
        assert!(!below_fold.intersects_viewport(viewport));
    }
}
