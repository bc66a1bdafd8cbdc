//! Testing utilities for the RAVE workspace
//!
//! Scripted fakes for the installer's seams and small plan builders.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rave_installer::{
    CommandProbe, EventSink, Plan, ProbeOutcome, StepExecutor, StepSpec,
};
use rave_session::{ExecOutcome, ManualOutcome, SessionError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

/// What a scripted step does when run
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Exit 0 with this stdout
    Succeed(String),
    /// Exit with this code
    Fail(i32),
    /// Announce a manual prompt and wait for `respond_to_manual`
    Manual,
    /// Executor-level error before anything runs
    Error,
}

/// Call recorded by [`ScriptedExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Condition(String),
    Step(String),
    Abort,
}

/// [`StepExecutor`] answering from tables; steps not scripted succeed
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    conditions: Mutex<HashMap<String, bool>>,
    steps: Mutex<HashMap<String, Scripted>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ManualOutcome>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Condition `command` exits 0 when `met`
    #[must_use]
    pub fn condition(self, command: &str, met: bool) -> Self {
        self.conditions.lock().insert(command.to_string(), met);
        self
    }

    /// Script step `id`
    #[must_use]
    pub fn step(self, id: &str, behaviour: Scripted) -> Self {
        self.steps.lock().insert(id.to_string(), behaviour);
        self
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Ids of steps whose command ran, in order
    pub fn ran(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Step(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sessions with a pending manual prompt
    pub fn pending_prompts(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn check_condition(&self, command: &str, _timeout: Duration) -> bool {
        self.calls.lock().push(Call::Condition(command.to_string()));
        self.conditions.lock().get(command).copied().unwrap_or(false)
    }

    async fn run_step(
        &self,
        step: &StepSpec,
        session_id: &str,
        _timeout: Duration,
        events: EventSink,
    ) -> Result<ExecOutcome, SessionError> {
        self.calls.lock().push(Call::Step(step.id.clone()));
        let behaviour = self
            .steps
            .lock()
            .get(&step.id)
            .cloned()
            .unwrap_or_else(|| Scripted::Succeed(String::new()));

        match behaviour {
            Scripted::Succeed(output) => Ok(ExecOutcome::success(output, String::new(), Some(0))),
            Scripted::Fail(code) => Ok(ExecOutcome::failure(
                format!("Command failed with exit code {code}"),
                String::new(),
                String::new(),
            )
            .with_exit_code(Some(code))),
            Scripted::Error => Err(SessionError::ExecutableNotFound(session_id.to_string())),
            Scripted::Manual => {
                let (tx, rx) = oneshot::channel();
                self.pending.lock().insert(session_id.to_string(), tx);
                events.requires_action(step, session_id);
                Ok(match rx.await.unwrap_or(ManualOutcome::Failed) {
                    ManualOutcome::Success => ExecOutcome::success(String::new(), String::new(), Some(0)),
                    ManualOutcome::Failed => ExecOutcome::failure(
                        "Manual command failed",
                        String::new(),
                        String::new(),
                    ),
                    ManualOutcome::Skipped => ExecOutcome {
                        success: true,
                        skipped: true,
                        ..ExecOutcome::default()
                    },
                })
            }
        }
    }

    fn respond_to_manual(&self, session_id: &str, outcome: ManualOutcome) -> Result<(), SessionError> {
        let tx = self
            .pending
            .lock()
            .remove(session_id)
            .ok_or_else(|| SessionError::NoPendingPrompt(session_id.to_string()))?;
        let _ = tx.send(outcome);
        Ok(())
    }

    fn abort_all(&self) {
        self.calls.lock().push(Call::Abort);
        self.pending.lock().clear();
    }
}

/// [`CommandProbe`] answering from a table; unknown commands fail
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    answers: Mutex<HashMap<String, ProbeOutcome>>,
    runs: Mutex<usize>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// `command` succeeds and prints `output`
    #[must_use]
    pub fn installed(self, command: &str, output: &str) -> Self {
        self.answers.lock().insert(
            command.to_string(),
            ProbeOutcome {
                success: true,
                output: output.to_string(),
            },
        );
        self
    }

    /// Probe commands run so far
    pub fn runs(&self) -> usize {
        *self.runs.lock()
    }
}

#[async_trait]
impl CommandProbe for ScriptedProbe {
    async fn run(&self, command: &str, _timeout: Duration) -> ProbeOutcome {
        *self.runs.lock() += 1;
        self.answers
            .lock()
            .get(command)
            .cloned()
            .unwrap_or(ProbeOutcome {
                success: false,
                output: String::new(),
            })
    }
}

/// Shell step `id` running `install <id>`
pub fn step(id: &str) -> StepSpec {
    StepSpec::shell(id, format!("install {id}"))
}

/// Plan named `test`; panics on duplicate ids
pub fn plan(steps: Vec<StepSpec>) -> Plan {
    Plan::new("test", steps).unwrap()
}

/// Spin until `check` holds, yielding to the runtime between polls
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
