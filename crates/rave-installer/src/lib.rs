//! RAVE Installer - dependency-ordered installation engine
//!
//! Provides:
//! - Per-platform YAML installation plans with validation
//! - Topological ordering with cycle detection
//! - A run state machine that can suspend on required failures
//! - Skip conditions, manual steps and a broadcast progress stream
//! - A cached prerequisite checker
//!
//! # Example
//!
//! ```rust,ignore
//! use rave_installer::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let shells = Arc::new(ShellSessions::default());
//! let locator = Arc::new(PathRuntimeLocator::new("Rscript"));
//! let executor = Arc::new(SessionStepExecutor::new(shells, locator));
//!
//! let installer = Installer::new(InstallerConfig::default(), executor);
//! let mut events = installer.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", event.type_name());
//!     }
//! });
//!
//! let platform = Platform::detect().ok_or("unsupported platform")?;
//! let summary = installer.start(platform).await?;
//! assert!(summary.success);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod cache;
pub mod config;
pub mod dag;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod locator;
pub mod plan;
pub mod platform;
pub mod prereq;
pub mod state_machine;

pub use cache::{CacheStore, FileCacheStore, MemoryCacheStore};
pub use config::{InstallerConfig, PortRange};
pub use dag::execution_order;
pub use engine::{Installer, RunSummary, StepRecord};
pub use error::{CacheError, ConfigError, InstallError, PlanError, Result};
pub use events::{EventKind, EventSink, InstallEvent, SkipReason};
pub use executor::{SessionStepExecutor, StepExecutor};
pub use locator::{FixedRuntimeLocator, PathRuntimeLocator, RuntimeInfo, RuntimeLocator};
pub use plan::{Plan, StepKind, StepSpec};
pub use platform::Platform;
pub use prereq::{
    CommandProbe, PrereqChecker, PrereqItem, PrereqReport, PrereqStatus, ProbeOutcome, ProbeSpec,
    SessionProbe,
};
pub use state_machine::{RunPhase, StepStatus};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving an installation
    pub use crate::{
        EventKind, InstallError, InstallEvent, Installer, InstallerConfig, PathRuntimeLocator,
        Plan, Platform, PrereqChecker, RunPhase, RunSummary, SessionStepExecutor, StepSpec,
        StepStatus,
    };
    pub use rave_session::{ManualOutcome, ShellSessions};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
