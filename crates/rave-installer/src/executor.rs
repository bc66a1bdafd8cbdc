//! Step execution seam
//!
//! The engine drives steps through a [`StepExecutor`]. The production
//! implementation creates one ephemeral shell session per step and per
//! skip-condition probe, tearing it down as soon as the command finishes.

use crate::events::EventSink;
use crate::locator::RuntimeLocator;
use crate::plan::{StepKind, StepSpec};
use async_trait::async_trait;
use rave_session::{
    ExecOptions, ExecOutcome, ManualOutcome, SessionError, ShellOptions, ShellSessions, StreamKind,
    DEFAULT_SUBSCRIPTION_CAPACITY,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Runs step commands and skip conditions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run the skip condition; `true` means it exited 0
    ///
    /// Errors and timeouts count as `false`.
    async fn check_condition(&self, command: &str, timeout: Duration) -> bool;

    /// Run a step's command in a fresh session named `session_id`
    ///
    /// Manual steps announce themselves on `events` once the prompt is
    /// pending.
    async fn run_step(
        &self,
        step: &StepSpec,
        session_id: &str,
        timeout: Duration,
        events: EventSink,
    ) -> Result<ExecOutcome, SessionError>;

    /// Resolve a pending manual prompt
    fn respond_to_manual(&self, session_id: &str, outcome: ManualOutcome) -> Result<(), SessionError>;

    /// Kill every live step process and fail pending prompts
    fn abort_all(&self);
}

/// [`StepExecutor`] backed by [`ShellSessions`]
pub struct SessionStepExecutor {
    shells: Arc<ShellSessions>,
    locator: Arc<dyn RuntimeLocator>,
}

impl std::fmt::Debug for SessionStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStepExecutor")
            .field("shells", &self.shells)
            .finish_non_exhaustive()
    }
}

impl SessionStepExecutor {
    /// Create executor
    #[must_use]
    pub fn new(shells: Arc<ShellSessions>, locator: Arc<dyn RuntimeLocator>) -> Self {
        Self { shells, locator }
    }

    /// Underlying session registry
    #[must_use]
    pub fn shells(&self) -> &Arc<ShellSessions> {
        &self.shells
    }

    async fn session_options(&self, step: &StepSpec, session_id: &str) -> Result<ShellOptions, SessionError> {
        match step.kind {
            StepKind::Shell => Ok(ShellOptions::default()),
            StepKind::InterpreterScript => {
                let runtime = self
                    .locator
                    .locate()
                    .await
                    .ok_or_else(|| SessionError::ExecutableNotFound(session_id.to_string()))?;
                Ok(ShellOptions::script(runtime.path))
            }
        }
    }
}

#[async_trait]
impl StepExecutor for SessionStepExecutor {
    async fn check_condition(&self, command: &str, timeout: Duration) -> bool {
        let session_id = format!("condition-{}", Uuid::new_v4().simple());
        if let Err(e) = self.shells.create(&session_id, ShellOptions::default()) {
            warn!(error = %e, "could not create condition session");
            return false;
        }

        let result = self
            .shells
            .execute(&session_id, command, ExecOptions::default().with_timeout(timeout))
            .await;
        self.shells.terminate(&session_id);

        match result {
            Ok(outcome) => {
                debug!(command, satisfied = outcome.success, exit_code = ?outcome.exit_code, "condition evaluated");
                outcome.success
            }
            Err(e) => {
                warn!(command, error = %e, "condition probe failed");
                false
            }
        }
    }

    async fn run_step(
        &self,
        step: &StepSpec,
        session_id: &str,
        timeout: Duration,
        events: EventSink,
    ) -> Result<ExecOutcome, SessionError> {
        let options = self.session_options(step, session_id).await?;
        self.shells.create(session_id, options)?;

        let manual = step.manual_execute && self.shells.supports_manual();
        let exec = ExecOptions::default()
            .with_env(step.env.clone())
            .with_timeout(timeout)
            .manual(manual);

        let result = if manual {
            let mut output = self.shells.subscribe(session_id, DEFAULT_SUBSCRIPTION_CAPACITY)?;
            let running = self.shells.execute(session_id, &step.run, exec);
            tokio::pin!(running);
            loop {
                tokio::select! {
                    result = &mut running => break result,
                    Some(chunk) = output.recv() => {
                        if chunk.stream == StreamKind::System {
                            events.requires_action(step, session_id);
                        }
                    }
                }
            }
        } else {
            self.shells.execute(session_id, &step.run, exec).await
        };

        self.shells.terminate(session_id);
        result
    }

    fn respond_to_manual(&self, session_id: &str, outcome: ManualOutcome) -> Result<(), SessionError> {
        self.shells.respond_to_manual(session_id, outcome)
    }

    fn abort_all(&self) {
        self.shells.terminate_all();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::locator::{FixedRuntimeLocator, RuntimeInfo};
    use rave_session::shell::PosixShell;

    fn executor(locator: FixedRuntimeLocator) -> SessionStepExecutor {
        SessionStepExecutor::new(
            Arc::new(ShellSessions::new(Arc::new(PosixShell::default()))),
            Arc::new(locator),
        )
    }

    #[tokio::test]
    async fn condition_reflects_exit_code() {
        let exec = executor(FixedRuntimeLocator::default());
        assert!(exec.check_condition("true", Duration::from_secs(5)).await);
        assert!(!exec.check_condition("exit 3", Duration::from_secs(5)).await);
        assert!(exec.shells().is_empty());
    }

    #[tokio::test]
    async fn condition_timeout_counts_as_unsatisfied() {
        let exec = executor(FixedRuntimeLocator::default());
        assert!(!exec.check_condition("sleep 5", Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn step_session_is_torn_down() {
        let exec = executor(FixedRuntimeLocator::default());
        let step = StepSpec::shell("hello", "echo hi");

        let outcome = exec
            .run_step(&step, "step-hello", Duration::from_secs(5), EventSink::default())
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.output, "hi\n");
        assert!(exec.shells().info("step-hello").is_none());
    }

    #[tokio::test]
    async fn step_env_is_applied() {
        let exec = executor(FixedRuntimeLocator::default());
        let mut step = StepSpec::shell("env", "echo $RAVE_STEP_FLAG");
        step.env.insert("RAVE_STEP_FLAG".into(), "on".into());

        let outcome = exec
            .run_step(&step, "step-env", Duration::from_secs(5), EventSink::default())
            .await
            .unwrap();
        assert_eq!(outcome.output, "on\n");
    }

    #[tokio::test]
    async fn script_step_without_runtime_is_rejected() {
        let exec = executor(FixedRuntimeLocator(None));
        let mut step = StepSpec::shell("pkg", "install.packages('x')");
        step.kind = StepKind::InterpreterScript;

        let err = exec
            .run_step(&step, "step-pkg", Duration::from_secs(5), EventSink::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ExecutableNotFound(_)));
        assert!(exec.shells().is_empty());
    }

    #[tokio::test]
    async fn script_step_uses_located_runtime() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-rscript");
        // Evaluates `-e <code>` by echoing the code back.
        std::fs::write(&fake, "#!/bin/sh\nshift\necho \"evaluated: $1\"\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let exec = executor(FixedRuntimeLocator(Some(RuntimeInfo {
            path: fake,
            version: None,
        })));
        let mut step = StepSpec::shell("pkg", "library(jsonlite)");
        step.kind = StepKind::InterpreterScript;

        let outcome = exec
            .run_step(&step, "step-pkg", Duration::from_secs(5), EventSink::default())
            .await
            .unwrap();
        assert_eq!(outcome.output, "evaluated: library(jsonlite)\n");
    }
}
