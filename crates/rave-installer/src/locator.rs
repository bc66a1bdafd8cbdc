//! Interpreter runtime discovery

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// A resolved interpreter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Executable path
    pub path: PathBuf,
    /// First line of `--version` output, if it ran
    pub version: Option<String>,
}

/// Supplies the interpreter used by script steps and interpreter sessions
#[async_trait]
pub trait RuntimeLocator: Send + Sync {
    /// Resolve the interpreter, or `None` if it is not installed
    async fn locate(&self) -> Option<RuntimeInfo>;
}

/// Searches configured directories, then `PATH`
#[derive(Debug, Clone)]
pub struct PathRuntimeLocator {
    binary: String,
    extra_dirs: Vec<PathBuf>,
    path_var: Option<std::ffi::OsString>,
}

impl PathRuntimeLocator {
    /// Locator for `binary` (e.g. `Rscript`)
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_dirs: Vec::new(),
            path_var: std::env::var_os("PATH"),
        }
    }

    /// Search these directories before `PATH`
    #[must_use]
    pub fn with_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.extra_dirs.extend(dirs);
        self
    }

    /// Override the `PATH` value searched
    #[must_use]
    pub fn with_path_var(mut self, path: impl Into<std::ffi::OsString>) -> Self {
        self.path_var = Some(path.into());
        self
    }

    fn candidates(&self) -> Vec<PathBuf> {
        let mut names = vec![self.binary.clone()];
        if cfg!(windows) && Path::new(&self.binary).extension().is_none() {
            names.insert(0, format!("{}.exe", self.binary));
        }

        let path_dirs = self
            .path_var
            .as_ref()
            .map(|p| std::env::split_paths(p).collect::<Vec<_>>())
            .unwrap_or_default();

        self.extra_dirs
            .iter()
            .chain(path_dirs.iter())
            .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
            .collect()
    }

    /// First existing candidate file
    #[must_use]
    pub fn find(&self) -> Option<PathBuf> {
        self.candidates().into_iter().find(|p| p.is_file())
    }
}

#[async_trait]
impl RuntimeLocator for PathRuntimeLocator {
    async fn locate(&self) -> Option<RuntimeInfo> {
        let path = self.find()?;
        let version = read_version(&path).await;
        debug!(path = %path.display(), ?version, "runtime located");
        Some(RuntimeInfo { path, version })
    }
}

/// A fixed runtime, or none
#[derive(Debug, Clone, Default)]
pub struct FixedRuntimeLocator(pub Option<RuntimeInfo>);

#[async_trait]
impl RuntimeLocator for FixedRuntimeLocator {
    async fn locate(&self) -> Option<RuntimeInfo> {
        self.0.clone()
    }
}

async fn read_version(path: &Path) -> Option<String> {
    let run = tokio::process::Command::new(path)
        .arg("--version")
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(Duration::from_secs(10), run).await.ok()?.ok()?;
    // R prints its version banner on stderr.
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    String::from_utf8_lossy(&text)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_dirs_are_searched_first() {
        let preferred = tempfile::tempdir().unwrap();
        let fallback = tempfile::tempdir().unwrap();
        std::fs::write(preferred.path().join("Rscript"), "").unwrap();
        std::fs::write(fallback.path().join("Rscript"), "").unwrap();

        let locator = PathRuntimeLocator::new("Rscript")
            .with_dirs([preferred.path().to_path_buf()])
            .with_path_var(fallback.path().as_os_str());

        assert_eq!(locator.find(), Some(preferred.path().join("Rscript")));
    }

    #[test]
    fn missing_binary_is_none() {
        let empty = tempfile::tempdir().unwrap();
        let locator =
            PathRuntimeLocator::new("definitely-not-installed").with_path_var(empty.path().as_os_str());
        assert_eq!(locator.find(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn locate_reads_version_line() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fake-r");
        std::fs::write(&bin, "#!/bin/sh\necho 'R version 4.4.1 (2024-06-14)'\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let info = PathRuntimeLocator::new("fake-r")
            .with_path_var(dir.path().as_os_str())
            .locate()
            .await
            .unwrap();
        assert_eq!(info.path, bin);
        assert_eq!(info.version.as_deref(), Some("R version 4.4.1 (2024-06-14)"));
    }
}
