//! Progress events broadcast to the UI layer

use crate::engine::RunSummary;
use crate::plan::StepSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Why a step ended `skipped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Skip condition exited 0
    ConditionMet,
    /// Optional step whose needs were not satisfied
    DependencyUnsatisfied,
    /// Optional step whose command failed
    OptionalFailure,
    /// Human chose "proceed anyway"
    Overridden,
    /// Human skipped a manual command
    ManualSkip,
}

impl SkipReason {
    /// Whether the skip stands in for a failure that dependents inherit
    #[must_use]
    pub fn carries_failure(self) -> bool {
        matches!(self, Self::DependencyUnsatisfied | Self::OptionalFailure)
    }
}

/// Event payload, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    /// Run started
    InstallationStart {
        /// Run id
        run_id: Uuid,
        /// Plan name
        plan: String,
        /// Steps in the plan
        total_steps: usize,
    },
    /// A step's command is about to run
    StepStart {
        /// Step id
        step: String,
        /// Display name
        name: String,
        /// Zero-based position in execution order
        index: usize,
        /// Steps in the plan
        total: usize,
    },
    /// A step succeeded
    StepComplete {
        /// Step id
        step: String,
        /// Captured stdout
        output: String,
    },
    /// A step failed
    StepFailed {
        /// Step id
        step: String,
        /// Failure description
        error: String,
        /// Captured stdout
        output: String,
        /// Process exit code
        exit_code: Option<i32>,
        /// Step is required
        required: bool,
        /// Run is now waiting for "proceed anyway" or abort
        suspended: bool,
        /// Remediation shown verbatim
        instructions: String,
    },
    /// A step was skipped
    StepSkipped {
        /// Step id
        step: String,
        /// Why
        reason: SkipReason,
    },
    /// A step's needs were not satisfied
    StepBlocked {
        /// Step id
        step: String,
        /// Needs that did not succeed
        unmet: Vec<String>,
        /// Step is required
        required: bool,
        /// Run is now waiting for "proceed anyway" or abort
        suspended: bool,
        /// Remediation shown verbatim
        instructions: String,
    },
    /// A command is waiting for a human to run it
    StepRequiresAction {
        /// Step id
        step: String,
        /// Session awaiting `respond_to_manual`
        session_id: String,
        /// Literal command for the human
        command: String,
        /// Step's manual instructions
        instructions: Option<String>,
    },
    /// Run finished or was aborted
    InstallationComplete {
        /// Final counts and step records
        summary: RunSummary,
    },
    /// Fatal run error
    Error {
        /// Description
        message: String,
    },
}

/// Timestamped progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallEvent {
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Payload
    #[serde(flatten)]
    pub kind: EventKind,
}

impl InstallEvent {
    /// Stamp a payload with the current time
    #[must_use]
    pub fn now(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Wire name of the event type
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            EventKind::InstallationStart { .. } => "installation-start",
            EventKind::StepStart { .. } => "step-start",
            EventKind::StepComplete { .. } => "step-complete",
            EventKind::StepFailed { .. } => "step-failed",
            EventKind::StepSkipped { .. } => "step-skipped",
            EventKind::StepBlocked { .. } => "step-blocked",
            EventKind::StepRequiresAction { .. } => "step-requires-action",
            EventKind::InstallationComplete { .. } => "installation-complete",
            EventKind::Error { .. } => "error",
        }
    }

    /// Step id the event concerns, if any
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        match &self.kind {
            EventKind::StepStart { step, .. }
            | EventKind::StepComplete { step, .. }
            | EventKind::StepFailed { step, .. }
            | EventKind::StepSkipped { step, .. }
            | EventKind::StepBlocked { step, .. }
            | EventKind::StepRequiresAction { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// Sending half of the progress stream
///
/// Emission never blocks; with no subscribers events are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<InstallEvent>,
}

impl EventSink {
    /// Create a sink buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver seeing events emitted from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InstallEvent> {
        self.tx.subscribe()
    }

    /// Emit a payload stamped with the current time
    pub fn emit(&self, kind: EventKind) {
        let event = InstallEvent::now(kind);
        trace!(event = event.type_name(), step = ?event.step(), "progress event");
        let _ = self.tx.send(event);
    }

    /// Announce that `step` is waiting for a human in `session_id`
    pub fn requires_action(&self, step: &StepSpec, session_id: &str) {
        self.emit(EventKind::StepRequiresAction {
            step: step.id.clone(),
            session_id: session_id.to_string(),
            command: step.run.clone(),
            instructions: step.manual_instructions.clone(),
        });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
