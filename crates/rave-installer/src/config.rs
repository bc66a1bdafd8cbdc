//! Installer configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! plan_dir = "plans"
//! headless = true
//!
//! [port_range]
//! start = 17283
//! end = 17300
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Inclusive loopback port range for interpreter sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port
    pub start: u16,
    /// Last port
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 17283,
            end: 17300,
        }
    }
}

/// Installer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Ports handed to interpreter sessions
    pub port_range: PortRange,
    /// Directory holding `<platform>.yaml` plans
    pub plan_dir: PathBuf,
    /// Directory for the file cache store
    pub cache_dir: PathBuf,
    /// Step timeout when the plan gives none
    pub default_step_timeout_ms: u64,
    /// Bound on skip-condition probes
    pub condition_timeout_ms: u64,
    /// Bound on each prerequisite probe
    pub probe_timeout_ms: u64,
    /// Lifetime of a cached passing prerequisite report
    pub prereq_cache_ttl_secs: u64,
    /// Suppress interactive notifications
    pub headless: bool,
    /// Delay between interactive-server readiness polls
    pub server_poll_interval_ms: u64,
    /// Readiness poll budget
    pub server_poll_attempts: u32,
    /// Progress event channel capacity
    pub event_buffer: usize,
    /// Extra directories searched for the interpreter before `PATH`
    pub runtime_search_dirs: Vec<PathBuf>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            plan_dir: PathBuf::from("plans"),
            cache_dir: PathBuf::from(".rave-cache"),
            default_step_timeout_ms: 30 * 60 * 1000,
            condition_timeout_ms: 10_000,
            probe_timeout_ms: 15_000,
            prereq_cache_ttl_secs: 86_400,
            headless: false,
            server_poll_interval_ms: 500,
            server_poll_attempts: 20,
            event_buffer: 256,
            runtime_search_dirs: Vec::new(),
        }
    }
}

impl InstallerConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - `ConfigError::Parse` for malformed TOML
    /// - `ConfigError::Invalid` if validation fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// - `ConfigError::Parse` for malformed TOML
    /// - `ConfigError::Invalid` if validation fails
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// - `ConfigError::Invalid` naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range.start > self.port_range.end {
            return Err(ConfigError::Invalid(format!(
                "port_range.start ({}) is greater than port_range.end ({})",
                self.port_range.start, self.port_range.end
            )));
        }
        for (name, value) in [
            ("default_step_timeout_ms", self.default_step_timeout_ms),
            ("condition_timeout_ms", self.condition_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("server_poll_interval_ms", self.server_poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be non-zero".into()));
        }
        Ok(())
    }

    /// With port range
    #[inline]
    #[must_use]
    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = PortRange { start, end };
        self
    }

    /// With plan directory
    #[inline]
    #[must_use]
    pub fn with_plan_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plan_dir = dir.into();
        self
    }

    /// With cache directory
    #[inline]
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// With headless mode
    #[inline]
    #[must_use]
    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// With skip-condition timeout
    #[inline]
    #[must_use]
    pub fn with_condition_timeout(mut self, timeout: Duration) -> Self {
        self.condition_timeout_ms = duration_ms(timeout);
        self
    }

    /// With default step timeout
    #[inline]
    #[must_use]
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout_ms = duration_ms(timeout);
        self
    }

    /// Default step timeout
    #[must_use]
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    /// Skip-condition timeout
    #[must_use]
    pub fn condition_timeout(&self) -> Duration {
        Duration::from_millis(self.condition_timeout_ms)
    }

    /// Prerequisite probe timeout
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Prerequisite cache lifetime
    #[must_use]
    pub fn prereq_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.prereq_cache_ttl_secs)
    }

    /// Interactive-server readiness polling
    #[must_use]
    pub fn server_probe(&self) -> rave_session::ServerProbe {
        rave_session::ServerProbe {
            interval: Duration::from_millis(self.server_poll_interval_ms),
            attempts: self.server_poll_attempts,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_toml_is_default() {
        let config = InstallerConfig::from_toml_str("").unwrap();
        assert_eq!(config, InstallerConfig::default());
        assert_eq!(config.default_step_timeout(), Duration::from_secs(1800));
        assert_eq!(config.prereq_cache_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    fn partial_toml_overrides() {
        let config = InstallerConfig::from_toml_str(
            r#"
            plan_dir = "/etc/rave/plans"
            headless = true

            [port_range]
            start = 9000
            end = 9010
            "#,
        )
        .unwrap();

        assert_eq!(config.plan_dir, PathBuf::from("/etc/rave/plans"));
        assert!(config.headless);
        assert_eq!(config.port_range, PortRange { start: 9000, end: 9010 });
        assert_eq!(config.condition_timeout_ms, 10_000);
    }

    #[test]
    fn reversed_port_range_is_invalid() {
        let err = InstallerConfig::new()
            .with_port_range(10, 5)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("port_range")));
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let err = InstallerConfig::from_toml_str("probe_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("probe_timeout_ms")));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            InstallerConfig::from_toml_str("headless = ["),
            Err(ConfigError::Parse(_))
        ));
    }
}
