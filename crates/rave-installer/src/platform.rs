//! Platform identification
//!
//! Plans and prerequisite probes are keyed by a small closed set of platforms.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Supported platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    /// Apple silicon macOS
    #[serde(rename = "macos-arm64")]
    MacosArm64,
    /// Intel macOS
    #[serde(rename = "macos-x64")]
    MacosX64,
    /// Linux (any architecture)
    #[serde(rename = "linux")]
    Linux,
    /// Windows (any architecture)
    #[serde(rename = "windows")]
    Windows,
}

impl Platform {
    /// Every platform, in a stable order
    pub const ALL: [Platform; 4] = [
        Platform::MacosArm64,
        Platform::MacosX64,
        Platform::Linux,
        Platform::Windows,
    ];

    /// Platform of the running binary, if supported
    #[must_use]
    pub fn detect() -> Option<Self> {
        Self::from_os_arch(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Map `std::env::consts` style names to a platform
    #[must_use]
    pub fn from_os_arch(os: &str, arch: &str) -> Option<Self> {
        match (os, arch) {
            ("macos", "aarch64") => Some(Self::MacosArm64),
            ("macos", _) => Some(Self::MacosX64),
            ("linux", _) => Some(Self::Linux),
            ("windows", _) => Some(Self::Windows),
            _ => None,
        }
    }

    /// Identifier used in plan file names and cache keys
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MacosArm64 => "macos-arm64",
            Self::MacosX64 => "macos-x64",
            Self::Linux => "linux",
            Self::Windows => "windows",
        }
    }

    /// Whether this is a macOS variant
    #[must_use]
    pub fn is_macos(self) -> bool {
        matches!(self, Self::MacosArm64 | Self::MacosX64)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown platform: {s}"))
    }
}

/// Operating system release string for cache keys
///
/// Falls back to `unknown` when the release command fails.
pub async fn os_release(platform: Platform) -> String {
    let (program, args): (&str, &[&str]) = match platform {
        Platform::MacosArm64 | Platform::MacosX64 => ("sw_vers", &["-productVersion"]),
        Platform::Linux => ("uname", &["-r"]),
        Platform::Windows => ("cmd", &["/C", "ver"]),
    };

    let run = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(Duration::from_secs(5), run).await {
        Ok(Ok(output)) if output.status.success() => {
            let release = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if release.is_empty() {
                "unknown".to_string()
            } else {
                release
            }
        }
        other => {
            debug!(%platform, failed = ?other.map(|r| r.map(|o| o.status)), "os release unavailable");
            "unknown".to_string()
        }
    }
}
