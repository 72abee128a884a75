//! Browser executable discovery and version detection.
//!
//! Lookup order: explicit override, then `PATH`, then a per-platform list of
//! well-known install locations.

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Maximum time `<exe> --version` may take.
pub const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// First major version that understands `--headless=new`.
pub const NEW_HEADLESS_MIN_MAJOR: u32 = 112;

/// First dotted version number in `--version` output.
static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\.\d+(?:\.\d+)*\b").expect("valid version pattern"));

/// Command names searched on `PATH`, in preference order.
#[cfg(target_os = "windows")]
const PATH_NAMES: &[&str] = &["chrome.exe", "msedge.exe", "chromium.exe", "brave.exe"];

/// Command names searched on `PATH`, in preference order.
#[cfg(not(target_os = "windows"))]
const PATH_NAMES: &[&str] = &[
    "google-chrome-stable",
    "google-chrome",
    "chromium-browser",
    "chromium",
    "brave-browser",
    "microsoft-edge",
];

// ============================================================================
// Discovery
// ============================================================================

/// Returns the platform name used in error messages.
#[inline]
#[must_use]
pub fn platform() -> &'static str {
    std::env::consts::OS
}

/// Well-known install locations for the current platform.
#[must_use]
pub fn well_known_locations() -> Vec<PathBuf> {
    if cfg!(target_os = "macos") {
        [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ]
        .into_iter()
        .map(PathBuf::from)
        .collect()
    } else if cfg!(target_os = "windows") {
        windows_locations()
    } else {
        [
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium-browser",
            "/usr/bin/chromium",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
        .into_iter()
        .map(PathBuf::from)
        .collect()
    }
}

fn windows_locations() -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"]
        .into_iter()
        .filter_map(|key| std::env::var_os(key).map(PathBuf::from))
        .collect();
    if roots.is_empty() {
        roots.push(PathBuf::from(r"C:\Program Files"));
        roots.push(PathBuf::from(r"C:\Program Files (x86)"));
    }

    let suffixes: &[&[&str]] = &[
        &["Google", "Chrome", "Application", "chrome.exe"],
        &["Chromium", "Application", "chrome.exe"],
        &["Microsoft", "Edge", "Application", "msedge.exe"],
    ];

    roots
        .iter()
        .flat_map(|root| {
            suffixes
                .iter()
                .map(move |suffix| suffix.iter().fold(root.clone(), |path, part| path.join(part)))
        })
        .collect()
}

/// Locates the browser executable.
///
/// An override that does not exist is an error; it never falls back to
/// discovery.
///
/// # Errors
///
/// Returns [`Error::ExecutableNotFound`] listing every place searched.
pub fn find_executable(override_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        if path.is_file() {
            debug!(path = %path.display(), "Using executable override");
            return Ok(path.to_path_buf());
        }
        return Err(Error::executable_not_found(platform(), vec![path.to_path_buf()]));
    }

    let mut searched = Vec::new();

    for name in PATH_NAMES {
        match which::which(name) {
            Ok(path) => {
                debug!(path = %path.display(), "Found executable on PATH");
                return Ok(path);
            }
            Err(_) => searched.push(PathBuf::from(format!("$PATH/{name}"))),
        }
    }

    for path in well_known_locations() {
        if path.is_file() {
            debug!(path = %path.display(), "Found executable at well-known location");
            return Ok(path);
        }
        searched.push(path);
    }

    Err(Error::executable_not_found(platform(), searched))
}

// ============================================================================
// Version
// ============================================================================

/// Extracts the major version from `--version` output.
///
/// `"Google Chrome 126.0.6478.126"` yields `126`.
#[must_use]
pub fn parse_major_version(output: &str) -> Option<u32> {
    VERSION_PATTERN.captures(output)?.get(1)?.as_str().parse().ok()
}

/// Runs `<exe> --version` and returns the major version, if recognisable.
pub async fn detect_version(executable: &Path) -> Option<u32> {
    let output = Command::new(executable)
        .arg("--version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match timeout(VERSION_TIMEOUT, output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!(path = %executable.display(), error = %e, "Version query failed");
            return None;
        }
        Err(_) => {
            debug!(path = %executable.display(), "Version query timed out");
            return None;
        }
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let major = parse_major_version(&text);
    trace!(output = %text.trim(), ?major, "Version detected");
    major
}

/// Chooses the headless flag spelling for a major version.
#[inline]
#[must_use]
pub fn headless_flag(major: Option<u32>) -> &'static str {
    match major {
        Some(major) if major >= NEW_HEADLESS_MIN_MAJOR => "--headless=new",
        _ => "--headless",
    }
}

// ============================================================================
// Tests
// ============================================================================
