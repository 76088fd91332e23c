//! odiff subprocess adapter.
//!
//! The binary is located once per process (env override, bundled
//! platform binary, a binary next to the executable, then `PATH`) and the
//! resolved path is reused for every comparison. A missing binary is not
//! an error; the engine is skipped upstream.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tokio::process::Command;
use tracing::debug;

use super::pixelmatch::side_file;
use super::{EngineKind, EngineOptions, EngineResult};

pub const BINARY_ENV: &str = "VRT_ODIFF_BINARY";

const EXIT_LAYOUT_DIFF: i32 = 21;
const EXIT_PIXEL_DIFF: i32 = 22;

static RESOLVED: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Resolved odiff binary, if any. First call walks the lookup order;
/// later calls read the cached answer.
pub fn resolved_binary() -> Option<&'static Path> {
    RESOLVED
        .get_or_init(|| {
            let found = locate_binary();
            match &found {
                Some(path) => debug!("odiff binary resolved to {}", path.display()),
                None => debug!("no odiff binary found"),
            }
            found
        })
        .as_deref()
}

fn locate_binary() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(BINARY_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Some(path);
        }
    }

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf));

    if let (Some(dir), Some(key)) = (&exe_dir, platform_key()) {
        let bundled = dir.join("odiff-bin").join(key);
        if bundled.is_file() {
            return Some(bundled);
        }
    }

    if let Some(dir) = &exe_dir {
        let linked = dir.join(binary_name());
        if linked.is_file() {
            return Some(linked);
        }
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary_name()))
        .find(|candidate| candidate.is_file())
}

fn binary_name() -> &'static str {
    if cfg!(windows) {
        "odiff.exe"
    } else {
        "odiff"
    }
}

fn platform_key() -> Option<&'static str> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "x86_64") => Some("odiff-linux-x64"),
        ("linux", "aarch64") => Some("odiff-linux-arm64"),
        ("macos", "x86_64") => Some("odiff-macos-x64"),
        ("macos", "aarch64") => Some("odiff-macos-arm64"),
        ("windows", "x86_64") => Some("odiff-windows-x64.exe"),
        _ => None,
    }
}

/// Run odiff over the pair, writing its diff to `<prefix>-odiff.png`.
pub async fn compare(
    baseline_path: &Path,
    test_path: &Path,
    diff_prefix: &Path,
    options: &EngineOptions,
) -> EngineResult {
    let kind = EngineKind::Odiff;
    let Some(binary) = resolved_binary() else {
        return EngineResult::failure(kind, "binary not found");
    };
    for path in [baseline_path, test_path] {
        if !path.is_file() {
            return EngineResult::failure(kind, format!("file not found: {}", path.display()));
        }
    }

    let diff_path = side_file(diff_prefix, "odiff");
    if let Some(parent) = diff_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return EngineResult::failure(kind, e.to_string());
        }
    }

    let output = Command::new(binary)
        .arg(baseline_path)
        .arg(test_path)
        .arg(&diff_path)
        .arg("--parsable-stdout")
        .arg(format!("--threshold={}", options.threshold))
        .output()
        .await;

    let output = match output {
        Ok(out) => out,
        Err(e) => return EngineResult::failure(kind, format!("spawn failed: {e}")),
    };

    match output.status.code() {
        Some(0) => EngineResult {
            engine: kind,
            similarity: 1.0,
            diff_percent: 0.0,
            diff_pixels: Some(0),
            diff_image_path: None,
            error: None,
        },
        Some(EXIT_PIXEL_DIFF) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            match parse_parsable_stdout(&stdout) {
                Some((diff_pixels, diff_percent)) => EngineResult {
                    engine: kind,
                    similarity: (1.0 - diff_percent / 100.0).max(0.0),
                    diff_percent,
                    diff_pixels: Some(diff_pixels),
                    diff_image_path: Some(diff_path),
                    error: None,
                },
                None => EngineResult::failure(
                    kind,
                    format!("unparsable odiff output: {:?}", stdout.trim()),
                ),
            }
        }
        Some(EXIT_LAYOUT_DIFF) => EngineResult::failure(kind, "Layout differs"),
        code => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            EngineResult::failure(
                kind,
                format!("exit status {:?}: {}", code, stderr.trim()),
            )
        }
    }
}

/// `--parsable-stdout` emits `<diffCount>;<diffPercentage>`.
fn parse_parsable_stdout(stdout: &str) -> Option<(u64, f64)> {
    let line = stdout.lines().find(|l| l.contains(';'))?;
    let (count, percent) = line.trim().split_once(';')?;
    Some((count.parse().ok()?, percent.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_parsable_stdout() {
        assert_eq!(parse_parsable_stdout("125;0.0221"), Some((125, 0.0221)));
        assert_eq!(
            parse_parsable_stdout("noise\n3;12.5\n"),
            Some((3, 12.5))
        );
        assert_eq!(parse_parsable_stdout(""), None);
        assert_eq!(parse_parsable_stdout("garbage"), None);
    }

    #[test]
    fn missing_binary_is_not_resolved_from_bad_env() {
        // An env path that does not exist must not be accepted.
        std::env::set_var(BINARY_ENV, "/definitely/not/a/real/odiff");
        assert!(locate_binary()
            .map(|p| p != std::path::Path::new("/definitely/not/a/real/odiff"))
            .unwrap_or(true));
        std::env::remove_var(BINARY_ENV);
    }
}
