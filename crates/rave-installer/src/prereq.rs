//! Prerequisite checks and remediation plans
//!
//! Each platform has a fixed list of probes: package manager, native
//! libraries, the R runtime, its companion package and an optional IDE. Every
//! probe is an external command bounded by a short timeout; they run
//! concurrently and fold into an ordered [`PrereqReport`].
//!
//! A report that passed is cached under `prereq:<platform>:<os release>` for a
//! fixed window, so an OS upgrade invalidates it. Failing reports are never
//! cached.

use crate::cache::CacheStore;
use crate::platform::{self, Platform};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rave_session::{ExecOptions, ShellOptions, ShellSessions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Whether a prerequisite is present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrereqStatus {
    /// Probe succeeded
    Installed,
    /// Probe failed, errored or timed out
    Pending,
}

/// Definition of one probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    /// Stable id
    pub id: String,
    /// Short label
    pub label: String,
    /// What the prerequisite is for
    pub description: String,
    /// Command that exits 0 when satisfied
    pub probe: String,
    /// Missing it fails the check
    pub required: bool,
    /// Command that installs it, if scriptable
    pub install_command: Option<String>,
    /// Instructions when it must be installed by hand
    pub manual_instructions: Option<String>,
}

impl ProbeSpec {
    fn new(id: &str, label: &str, description: &str, probe: &str, required: bool) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            probe: probe.to_string(),
            required,
            install_command: None,
            manual_instructions: None,
        }
    }

    fn install(mut self, command: &str) -> Self {
        self.install_command = Some(command.to_string());
        self
    }

    fn manual(mut self, instructions: &str) -> Self {
        self.manual_instructions = Some(instructions.to_string());
        self
    }
}

/// One checked prerequisite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrereqItem {
    /// Probe id
    pub id: String,
    /// Short label
    pub label: String,
    /// Result
    pub status: PrereqStatus,
    /// Missing it fails the check
    pub required: bool,
    /// Command that installs it
    pub install_command: Option<String>,
    /// Instructions when it must be installed by hand
    pub manual_instructions: Option<String>,
    /// What the prerequisite is for
    pub description: String,
    /// First line of probe output (usually a version)
    pub detail: Option<String>,
}

/// Ordered remediation plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrereqReport {
    /// Platform checked
    pub platform: Platform,
    /// OS release used in the cache key
    pub os_release: String,
    /// No required item is pending
    pub passed: bool,
    /// Items in probe order
    pub items: Vec<PrereqItem>,
    /// When the probes ran
    pub checked_at: DateTime<Utc>,
    /// Served from cache
    #[serde(default)]
    pub from_cache: bool,
}

impl PrereqReport {
    /// Items still to install, in order
    pub fn pending(&self) -> impl Iterator<Item = &PrereqItem> {
        self.items
            .iter()
            .filter(|i| i.status == PrereqStatus::Pending)
    }

    /// Required items still to install
    pub fn blocking(&self) -> impl Iterator<Item = &PrereqItem> {
        self.pending().filter(|i| i.required)
    }
}

/// Outcome of a single probe command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Exited 0 within the timeout
    pub success: bool,
    /// Captured stdout
    pub output: String,
}

/// Runs probe commands
#[async_trait]
pub trait CommandProbe: Send + Sync {
    /// Run `command`; failures and timeouts are unsuccessful outcomes
    async fn run(&self, command: &str, timeout: Duration) -> ProbeOutcome;
}

/// Probes through ephemeral shell sessions
#[derive(Debug, Clone)]
pub struct SessionProbe {
    shells: Arc<ShellSessions>,
}

impl SessionProbe {
    /// Create probe runner
    #[must_use]
    pub fn new(shells: Arc<ShellSessions>) -> Self {
        Self { shells }
    }
}

#[async_trait]
impl CommandProbe for SessionProbe {
    async fn run(&self, command: &str, timeout: Duration) -> ProbeOutcome {
        let session_id = format!("probe-{}", Uuid::new_v4().simple());
        if let Err(e) = self.shells.create(&session_id, ShellOptions::default()) {
            warn!(error = %e, "could not create probe session");
            return ProbeOutcome {
                success: false,
                output: String::new(),
            };
        }
        let result = self
            .shells
            .execute(&session_id, command, ExecOptions::default().with_timeout(timeout))
            .await;
        self.shells.terminate(&session_id);

        match result {
            Ok(outcome) => ProbeOutcome {
                success: outcome.success,
                output: outcome.output,
            },
            Err(e) => {
                warn!(command, error = %e, "probe could not run");
                ProbeOutcome {
                    success: false,
                    output: String::new(),
                }
            }
        }
    }
}

/// Built-in probe list for a platform
#[must_use]
pub fn default_probes(platform: Platform) -> Vec<ProbeSpec> {
    const COMPANION: &str = "Rscript -e \"quit(status = if (requireNamespace('ravemanager', quietly = TRUE)) 0 else 1)\"";
    const COMPANION_INSTALL: &str = "Rscript -e \"install.packages('ravemanager', repos = 'https://rave-ieeg.r-universe.dev')\"";

    match platform {
        Platform::MacosArm64 | Platform::MacosX64 => vec![
            ProbeSpec::new("homebrew", "Homebrew", "Package manager used to install native libraries", "brew --version", true)
                .manual("Open Terminal and run the installer from https://brew.sh, then restart this installer"),
            ProbeSpec::new("xcode-clt", "Xcode Command Line Tools", "Compilers for building R packages", "xcode-select -p", true)
                .install("xcode-select --install"),
            ProbeSpec::new("native-libs", "Native libraries", "Libraries linked by compiled R packages", "brew list --versions pkg-config libgit2 hdf5 fftw", true)
                .install("brew install pkg-config libgit2 hdf5 fftw"),
            ProbeSpec::new("r", "R", "The R runtime", "Rscript --version", true)
                .manual("Download and install the R package for macOS from https://cran.r-project.org/bin/macosx/"),
            ProbeSpec::new("ravemanager", "ravemanager", "Companion R package that manages RAVE", COMPANION, true)
                .install(COMPANION_INSTALL),
            ProbeSpec::new("rstudio", "RStudio", "Recommended IDE", "test -d /Applications/RStudio.app", false)
                .install("brew install --cask rstudio"),
        ],
        Platform::Linux => vec![
            ProbeSpec::new("package-manager", "Package manager", "apt, dnf or yum for system packages", "command -v apt-get || command -v dnf || command -v yum", true)
                .manual("Install packages with your distribution's package manager"),
            ProbeSpec::new("native-libs", "Native libraries", "Libraries linked by compiled R packages", "pkg-config --exists libcurl openssl libxml-2.0 hdf5 fftw3", true)
                .install("sudo apt-get install -y libcurl4-openssl-dev libssl-dev libxml2-dev libhdf5-dev libfftw3-dev"),
            ProbeSpec::new("r", "R", "The R runtime", "Rscript --version", true)
                .install("sudo apt-get install -y r-base r-base-dev"),
            ProbeSpec::new("ravemanager", "ravemanager", "Companion R package that manages RAVE", COMPANION, true)
                .install(COMPANION_INSTALL),
            ProbeSpec::new("rstudio", "RStudio", "Recommended IDE", "command -v rstudio", false)
                .manual("Download RStudio Desktop from https://posit.co/download/rstudio-desktop/"),
        ],
        Platform::Windows => vec![
            ProbeSpec::new("winget", "winget", "Windows package manager", "winget --version", true)
                .manual("Install App Installer from the Microsoft Store"),
            ProbeSpec::new("r", "R", "The R runtime", "where Rscript", true)
                .install("winget install --id RProject.R -e"),
            ProbeSpec::new("rtools", "Rtools", "Toolchain for building R packages", "where make", true)
                .install("winget install --id RProject.Rtools -e"),
            ProbeSpec::new("ravemanager", "ravemanager", "Companion R package that manages RAVE", COMPANION, true)
                .install(COMPANION_INSTALL),
            ProbeSpec::new("rstudio", "RStudio", "Recommended IDE", "where rstudio", false)
                .install("winget install --id Posit.RStudio -e"),
        ],
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedReport {
    cached_at: DateTime<Utc>,
    report: PrereqReport,
}

/// Runs the probe list and manages the report cache
pub struct PrereqChecker {
    platform: Platform,
    probes: Vec<ProbeSpec>,
    runner: Arc<dyn CommandProbe>,
    cache: Arc<dyn CacheStore>,
    probe_timeout: Duration,
    ttl: Duration,
    os_release: Option<String>,
}

impl std::fmt::Debug for PrereqChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrereqChecker")
            .field("platform", &self.platform)
            .field("probes", &self.probes.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl PrereqChecker {
    /// Checker with the built-in probes for `platform`
    #[must_use]
    pub fn new(platform: Platform, runner: Arc<dyn CommandProbe>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            platform,
            probes: default_probes(platform),
            runner,
            cache,
            probe_timeout: Duration::from_secs(15),
            ttl: Duration::from_secs(86_400),
            os_release: None,
        }
    }

    /// Replace the probe list
    #[must_use]
    pub fn with_probes(mut self, probes: Vec<ProbeSpec>) -> Self {
        self.probes = probes;
        self
    }

    /// Per-probe timeout
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Cache lifetime for passing reports
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Fixed OS release instead of asking the system
    #[must_use]
    pub fn with_os_release(mut self, release: impl Into<String>) -> Self {
        self.os_release = Some(release.into());
        self
    }

    /// Cache key for an OS release
    #[must_use]
    pub fn cache_key(&self, os_release: &str) -> String {
        format!("prereq:{}:{os_release}", self.platform)
    }

    /// Run the check, consulting the cache unless `use_cache` is false
    #[instrument(skip(self), fields(platform = %self.platform))]
    pub async fn check(&self, use_cache: bool) -> PrereqReport {
        let os_release = match &self.os_release {
            Some(release) => release.clone(),
            None => platform::os_release(self.platform).await,
        };
        let key = self.cache_key(&os_release);

        if use_cache {
            if let Some(report) = self.cached(&key).await {
                info!(%key, "prerequisites served from cache");
                return report;
            }
        }

        let outcomes = join_all(
            self.probes
                .iter()
                .map(|spec| self.runner.run(&spec.probe, self.probe_timeout)),
        )
        .await;

        let items: Vec<PrereqItem> = self
            .probes
            .iter()
            .zip(outcomes)
            .map(|(spec, outcome)| {
                debug!(probe = %spec.id, installed = outcome.success, "probe finished");
                PrereqItem {
                    id: spec.id.clone(),
                    label: spec.label.clone(),
                    status: if outcome.success {
                        PrereqStatus::Installed
                    } else {
                        PrereqStatus::Pending
                    },
                    required: spec.required,
                    install_command: spec.install_command.clone(),
                    manual_instructions: spec.manual_instructions.clone(),
                    description: spec.description.clone(),
                    detail: outcome
                        .output
                        .lines()
                        .map(str::trim)
                        .find(|l| !l.is_empty())
                        .map(str::to_string),
                }
            })
            .collect();

        let passed = !items
            .iter()
            .any(|i| i.required && i.status == PrereqStatus::Pending);
        let report = PrereqReport {
            platform: self.platform,
            os_release,
            passed,
            items,
            checked_at: Utc::now(),
            from_cache: false,
        };
        info!(passed, pending = report.pending().count(), "prerequisites checked");

        if passed {
            self.store(&key, &report).await;
        } else if let Err(e) = self.cache.remove(&key).await {
            warn!(%key, error = %e, "could not clear stale prerequisite cache");
        }
        report
    }

    async fn cached(&self, key: &str) -> Option<PrereqReport> {
        let value = match self.cache.get(key).await {
            Ok(value) => value?,
            Err(e) => {
                warn!(%key, error = %e, "prerequisite cache unreadable");
                return None;
            }
        };
        let cached: CachedReport = match serde_json::from_value(value) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(%key, error = %e, "prerequisite cache record malformed");
                return None;
            }
        };

        let age = Utc::now().signed_duration_since(cached.cached_at);
        let fresh = age
            .to_std()
            .map(|age| age < self.ttl)
            .unwrap_or(false);
        if !fresh || !cached.report.passed {
            debug!(%key, "prerequisite cache record expired");
            return None;
        }

        let mut report = cached.report;
        report.from_cache = true;
        Some(report)
    }

    async fn store(&self, key: &str, report: &PrereqReport) {
        let record = CachedReport {
            cached_at: Utc::now(),
            report: report.clone(),
        };
        let result = match serde_json::to_value(&record) {
            Ok(value) => self.cache.set(key, value).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(%key, error = %e, "could not cache prerequisite report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Answers from a table; counts invocations
    #[derive(Default)]
    struct TableProbe {
        answers: Mutex<HashMap<String, bool>>,
        calls: Mutex<usize>,
    }

    impl TableProbe {
        fn set(&self, command: &str, ok: bool) {
            self.answers.lock().insert(command.to_string(), ok);
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl CommandProbe for TableProbe {
        async fn run(&self, command: &str, _timeout: Duration) -> ProbeOutcome {
            *self.calls.lock() += 1;
            let success = self.answers.lock().get(command).copied().unwrap_or(false);
            ProbeOutcome {
                success,
                output: if success { "v1.0\n".into() } else { String::new() },
            }
        }
    }

    fn probes() -> Vec<ProbeSpec> {
        vec![
            ProbeSpec::new("pm", "pm", "", "has-pm", true),
            ProbeSpec::new("ide", "ide", "", "has-ide", false).install("get-ide"),
        ]
    }

    fn checker(runner: Arc<TableProbe>, cache: Arc<MemoryCacheStore>) -> PrereqChecker {
        PrereqChecker::new(Platform::Linux, runner, cache)
            .with_probes(probes())
            .with_os_release("6.1.0")
    }

    #[tokio::test]
    async fn optional_pending_item_still_passes() {
        let runner = Arc::new(TableProbe::default());
        runner.set("has-pm", true);
        let report = checker(runner, Arc::new(MemoryCacheStore::default()))
            .check(true)
            .await;

        assert!(report.passed);
        assert_eq!(report.items[0].status, PrereqStatus::Installed);
        assert_eq!(report.items[0].detail.as_deref(), Some("v1.0"));
        let pending: Vec<_> = report.pending().map(|i| i.id.as_str()).collect();
        assert_eq!(pending, vec!["ide"]);
        assert_eq!(report.blocking().count(), 0);
    }

    #[tokio::test]
    async fn passing_report_is_cached() {
        let runner = Arc::new(TableProbe::default());
        runner.set("has-pm", true);
        let cache = Arc::new(MemoryCacheStore::default());
        let checker = checker(runner.clone(), cache);

        let first = checker.check(true).await;
        assert!(!first.from_cache);
        assert_eq!(runner.calls(), 2);

        let second = checker.check(true).await;
        assert!(second.from_cache);
        assert_eq!(runner.calls(), 2);

        let bypass = checker.check(false).await;
        assert!(!bypass.from_cache);
        assert_eq!(runner.calls(), 4);
    }

    #[tokio::test]
    async fn failing_report_is_always_rechecked() {
        let runner = Arc::new(TableProbe::default());
        let cache = Arc::new(MemoryCacheStore::default());
        let checker = checker(runner.clone(), cache);

        let first = checker.check(true).await;
        assert!(!first.passed);
        assert_eq!(first.blocking().next().map(|i| i.id.as_str()), Some("pm"));

        runner.set("has-pm", true);
        let second = checker.check(true).await;
        assert!(second.passed);
        assert!(!second.from_cache);
    }

    #[tokio::test]
    async fn expired_record_is_ignored() {
        let runner = Arc::new(TableProbe::default());
        runner.set("has-pm", true);
        let cache = Arc::new(MemoryCacheStore::default());
        let checker = checker(runner.clone(), cache).with_ttl(Duration::ZERO);

        checker.check(true).await;
        let again = checker.check(true).await;
        assert!(!again.from_cache);
        assert_eq!(runner.calls(), 4);
    }

    #[tokio::test]
    async fn os_upgrade_changes_cache_key() {
        let runner = Arc::new(TableProbe::default());
        runner.set("has-pm", true);
        let cache = Arc::new(MemoryCacheStore::default());

        checker(runner.clone(), cache.clone()).check(true).await;
        let upgraded = checker(runner, cache).with_os_release("6.2.0").check(true).await;
        assert!(!upgraded.from_cache);
        assert_eq!(upgraded.os_release, "6.2.0");
    }

    #[test]
    fn every_platform_probes_runtime_and_companion() {
        for platform in Platform::ALL {
            let ids: Vec<_> = default_probes(platform).into_iter().map(|p| p.id).collect();
            assert!(ids.contains(&"r".to_string()), "{platform}");
            assert!(ids.contains(&"ravemanager".to_string()), "{platform}");
            assert!(ids.contains(&"rstudio".to_string()), "{platform}");
        }
    }
}
