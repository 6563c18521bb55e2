//! External tool discovery and the version capability probe.

use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Preferred installation paths, checked in order. Package managers install
/// newer builds here; the first existing match wins.
pub const CANDIDATE_PATHS: [&str; 3] = [
    "/opt/homebrew/bin/rsync",
    "/usr/local/bin/rsync",
    "/opt/local/bin/rsync",
];

/// System default used when no candidate exists.
pub const SYSTEM_DEFAULT_PATH: &str = "/usr/bin/rsync";

/// Locate the tool executable.
pub fn locate_tool() -> PathBuf {
    for candidate in CANDIDATE_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            return path.to_path_buf();
        }
    }
    PathBuf::from(SYSTEM_DEFAULT_PATH)
}

/// What the probed tool build supports for live progress.
#[derive(Debug, Clone)]
pub struct ToolCapabilities {
    /// First line of the tool's version banner, kept for logging.
    pub version_line: String,
    /// Whether the structured progress protocol is available. Legacy builds
    /// only offer a bare percentage.
    pub structured_progress: bool,
}

impl ToolCapabilities {
    pub fn legacy() -> Self {
        Self {
            version_line: String::new(),
            structured_progress: false,
        }
    }
}

/// Run the tool's version query and classify its progress support. The
/// orchestrator caches the result for the process lifetime; a probe failure
/// degrades to legacy progress rather than failing the run.
pub async fn probe_capabilities(executable: &Path) -> ToolCapabilities {
    let output = match Command::new(executable).arg("--version").output().await {
        Ok(output) => output,
        Err(err) => {
            log::warn!(
                "version probe of {} failed (assuming legacy progress): {err}",
                executable.display()
            );
            return ToolCapabilities::legacy();
        }
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let first_line = text.lines().next().unwrap_or("").trim().to_string();
    let structured = banner_supports_structured(&first_line);
    log::debug!(
        "tool banner '{}' -> structured progress: {}",
        first_line,
        structured
    );
    ToolCapabilities {
        version_line: first_line,
        structured_progress: structured,
    }
}

/// A major version of 3 or newer carries the structured progress protocol.
/// The banner's first numeric token is the version marker.
pub fn banner_supports_structured(first_line: &str) -> bool {
    first_line
        .split_whitespace()
        .find(|token| token.starts_with(|c: char| c.is_ascii_digit()))
        .and_then(|token| token.split('.').next())
        .and_then(|major| major.parse::<u32>().ok())
        .is_some_and(|major| major >= 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modern_banner_is_structured() {
        assert!(banner_supports_structured(
            "rsync  version 3.2.7  protocol version 31"
        ));
        assert!(banner_supports_structured(
            "rsync  version 3.4.1  protocol version 32"
        ));
    }

    #[test]
    fn legacy_banner_is_not() {
        assert!(!banner_supports_structured(
            "rsync  version 2.6.9  protocol version 29"
        ));
        assert!(!banner_supports_structured(""));
        assert!(!banner_supports_structured("no digits here"));
    }

    #[test]
    fn locate_falls_back_to_system_default() {
        // None of the preferred paths exist in a build sandbox.
        let path = locate_tool();
        assert!(
            CANDIDATE_PATHS.iter().any(|c| Path::new(c) == path)
                || path == Path::new(SYSTEM_DEFAULT_PATH)
        );
    }
}
