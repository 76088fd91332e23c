//! Filename schema, sanitization and metadata sidecars.
//!
//! Screenshot files are named `<scenario>_<browser>[-v<version>]_<viewport>.png`
//! and the parser inverts that mapping so attributes survive even when the
//! metadata sidecar is missing or incompatible.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BrowserEngine;
use crate::error::{Result, VrtError};

pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Sanitize a scenario or viewport name for use in filenames.
///
/// Path separators become `-`, reserved characters and whitespace become
/// `_`, runs collapse, and separators are trimmed from the ends. The
/// function is idempotent.
pub fn sanitize_name(input: &str) -> String {
    let mapped: String = input
        .chars()
        .map(|c| match c {
            '/' | '\\' => '-',
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_whitespace() => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let mut collapsed = String::with_capacity(mapped.len());
    let mut last: Option<char> = None;
    for c in mapped.chars() {
        if (c == '-' || c == '_') && last == Some(c) {
            continue;
        }
        collapsed.push(c);
        last = Some(c);
    }

    collapsed
        .trim_matches(|c| c == '-' || c == '_')
        .to_string()
}

/// Build the screenshot filename for one task.
pub fn screenshot_file_name(
    scenario: &str,
    browser: BrowserEngine,
    version: Option<&str>,
    viewport: &str,
) -> String {
    let browser_key = match version {
        Some(v) => format!("{}-v{}", browser.as_str(), v),
        None => browser.as_str().to_string(),
    };
    format!(
        "{}_{}_{}.png",
        sanitize_name(scenario),
        browser_key,
        sanitize_name(viewport)
    )
}

/// Attributes recovered from a screenshot filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedScreenshotName {
    pub scenario: String,
    pub browser: BrowserEngine,
    pub version: Option<String>,
    pub viewport: String,
}

/// Invert [`screenshot_file_name`]: locate the browser segment, treat
/// everything before it as the scenario and everything after as the
/// viewport. Returns `None` when no browser segment is present.
pub fn parse_screenshot_name(file_name: &str) -> Option<ParsedScreenshotName> {
    let stem = file_name.strip_suffix(".png")?;
    let segments: Vec<&str> = stem.split('_').collect();

    for (idx, segment) in segments.iter().enumerate() {
        if let Some((browser, version)) = parse_browser_segment(segment) {
            if idx == 0 || idx == segments.len() - 1 {
                continue; // scenario and viewport must both be non-empty
            }
            return Some(ParsedScreenshotName {
                scenario: segments[..idx].join("_"),
                browser,
                version,
                viewport: segments[idx + 1..].join("_"),
            });
        }
    }
    None
}

fn parse_browser_segment(segment: &str) -> Option<(BrowserEngine, Option<String>)> {
    for engine in [BrowserEngine::Chromium, BrowserEngine::Webkit] {
        let name = engine.as_str();
        if segment == name {
            return Some((engine, None));
        }
        if let Some(rest) = segment.strip_prefix(name) {
            if let Some(version) = rest.strip_prefix("-v") {
                if is_version(version) {
                    return Some((engine, Some(version.to_string())));
                }
            }
        }
    }
    None
}

/// Version strings match `\d+(\.\d+)*`.
fn is_version(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// DOM snapshot sibling for a screenshot: same base, `.snapshot.json`.
pub fn snapshot_sibling(screenshot: &Path) -> PathBuf {
    let mut path = screenshot.to_path_buf();
    path.set_extension("snapshot.json");
    path
}

/// Diff image path inside the output directory for a screenshot filename.
pub fn diff_path(output_dir: &Path, file_name: &str) -> PathBuf {
    output_dir.join("diffs").join(file_name)
}

/// Serialize `value` to `path` atomically: write to a temp file in the
/// same directory, fsync, rename over the target.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| VrtError::Io(format!("{}: {}", path.display(), e.error)))?;
    Ok(())
}

/// One image entry in the metadata sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageRecord {
    pub filename: String,
    pub scenario: String,
    pub browser: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub viewport: String,
}

/// Per-directory metadata sidecar (`metadata.json`).
///
/// Readers accept a missing file; a schema-version mismatch makes every
/// lookup fall back to filename parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSidecar {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub images: BTreeMap<String, ImageRecord>,
}

impl MetadataSidecar {
    pub const FILE_NAME: &'static str = "metadata.json";

    pub fn new() -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            generated_at: Utc::now(),
            images: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, record: ImageRecord) {
        self.images.insert(record.filename.clone(), record);
    }

    /// Load the sidecar from `dir`, returning an empty one when absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(Self::FILE_NAME);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(VrtError::Io(format!("{}: {e}", path.display()))),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        write_json_atomic(&dir.join(Self::FILE_NAME), self)
    }

    fn is_compatible(&self) -> bool {
        self.schema_version == METADATA_SCHEMA_VERSION
    }

    /// Attributes for a filename: sidecar record when compatible, else
    /// the filename parser.
    pub fn resolve(&self, file_name: &str) -> Option<ParsedScreenshotName> {
        if self.is_compatible() {
            if let Some(record) = self.images.get(file_name) {
                if let Some(browser) = BrowserEngine::parse(&record.browser) {
                    return Some(ParsedScreenshotName {
                        scenario: record.scenario.clone(),
                        browser,
                        version: record.version.clone(),
                        viewport: record.viewport.clone(),
                    });
                }
            }
        }
        parse_screenshot_name(file_name)
    }
}

impl Default for MetadataSidecar {
    fn default() -> Self {
        Self::new()
    }
}
