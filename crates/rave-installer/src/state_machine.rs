//! Run phase and step status transition tables

use crate::error::InstallError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of an installation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPhase {
    /// No run started
    Idle,
    /// Reading and validating the plan
    LoadingPlan,
    /// Execution order computed
    Sorted,
    /// Walking steps
    Executing,
    /// Waiting for "proceed anyway" or abort
    Suspended,
    /// Every step visited
    Completed,
    /// Stopped by abort or a fatal plan error
    Aborted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::LoadingPlan => "loading-plan",
            Self::Sorted => "sorted",
            Self::Executing => "executing",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl RunPhase {
    /// Phases reachable from `self`
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [RunPhase] {
        use RunPhase::*;
        match self {
            Idle | Completed | Aborted => &[LoadingPlan],
            LoadingPlan => &[Sorted, Aborted],
            Sorted => &[Executing, Aborted],
            Executing => &[Suspended, Completed, Aborted],
            Suspended => &[Executing, Aborted],
        }
    }

    /// Whether a run is in progress
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Completed | Self::Aborted)
    }
}

/// Runtime status of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not yet visited
    Pending,
    /// Command in flight
    Running,
    /// Command succeeded
    Success,
    /// Command failed
    Failed,
    /// Condition met, overridden or auto-skipped
    Skipped,
    /// Needs not satisfied
    Blocked,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl StepStatus {
    /// Statuses reachable from `self`
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [StepStatus] {
        use StepStatus::*;
        match self {
            Pending => &[Running, Skipped, Blocked],
            Running => &[Success, Failed, Skipped],
            Failed | Blocked => &[Skipped],
            Success | Skipped => &[],
        }
    }

    /// Whether dependents may run after this status
    #[must_use]
    pub fn satisfies_needs(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

/// Validate a run phase change
///
/// # Errors
/// - `InstallError::IllegalTransition` if `to` is not reachable from `from`
pub fn validate_phase(from: RunPhase, to: RunPhase) -> Result<(), InstallError> {
    if from.allowed_transitions().contains(&to) {
        Ok(())
    } else {
        Err(InstallError::illegal(from, to))
    }
}

/// Validate a step status change
///
/// # Errors
/// - `InstallError::IllegalTransition` if `to` is not reachable from `from`
pub fn validate_step(from: StepStatus, to: StepStatus) -> Result<(), InstallError> {
    if from.allowed_transitions().contains(&to) {
        Ok(())
    } else {
        Err(InstallError::illegal(from, to))
    }
}
