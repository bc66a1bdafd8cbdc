//! Dependency-ordered installation engine
//!
//! One run walks the plan's steps in dependency order, one at a time:
//!
//! 1. A step whose skip condition exits 0 is skipped without running.
//! 2. A step with a need that failed, or was skipped in place of failing, is
//!    blocked. Optional steps are then skipped; required steps suspend the run.
//! 3. Otherwise the command runs in a fresh session. Optional failures are
//!    skipped; required failures suspend the run.
//!
//! A suspended run resumes on [`Installer::proceed_anyway`], which marks the
//! step `skipped`, or ends on [`Installer::abort`]. Abort is checked before
//! every step and after every suspension.

use crate::config::InstallerConfig;
use crate::dag;
use crate::error::{InstallError, Result};
use crate::events::{EventKind, EventSink, InstallEvent, SkipReason};
use crate::executor::StepExecutor;
use crate::plan::{Plan, StepSpec};
use crate::platform::Platform;
use crate::state_machine::{validate_phase, validate_step, RunPhase, StepStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rave_session::{ExecOutcome, ManualOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Runtime record of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step id
    pub id: String,
    /// Display name
    pub name: String,
    /// Required flag from the plan
    pub required: bool,
    /// Current status
    pub status: StepStatus,
    /// Why the step was skipped
    pub skip_reason: Option<SkipReason>,
    /// Captured stdout
    pub output: String,
    /// Failure description
    pub error: Option<String>,
    /// Process exit code
    pub exit_code: Option<i32>,
    /// Command start
    pub started_at: Option<DateTime<Utc>>,
    /// Command end
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// Whether dependents may run after this step
    ///
    /// A step skipped because it failed, or because its own needs were not
    /// met, still counts as unmet for its dependents.
    #[must_use]
    pub fn satisfies_needs(&self) -> bool {
        self.status.satisfies_needs()
            && !self.skip_reason.is_some_and(SkipReason::carries_failure)
    }

    fn pending(step: &StepSpec) -> Self {
        Self {
            id: step.id.clone(),
            name: step.name.clone(),
            required: step.required,
            status: StepStatus::Pending,
            skip_reason: None,
            output: String::new(),
            error: None,
            exit_code: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Result of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run id
    pub run_id: Uuid,
    /// Plan name
    pub plan: String,
    /// No step failed and the run was not aborted
    pub success: bool,
    /// Run was aborted
    pub aborted: bool,
    /// Steps that ended `success`
    pub completed: usize,
    /// Steps that ended `failed`
    pub failed: usize,
    /// Steps that ended `skipped`
    pub skipped: usize,
    /// Steps that ended `blocked`
    pub blocked: usize,
    /// Every step in execution order
    pub steps: Vec<StepRecord>,
}

impl RunSummary {
    fn tally(run_id: Uuid, plan: &str, aborted: bool, steps: Vec<StepRecord>) -> Self {
        let count = |status| steps.iter().filter(|s| s.status == status).count();
        let failed = count(StepStatus::Failed);
        Self {
            run_id,
            plan: plan.to_string(),
            success: failed == 0 && !aborted,
            aborted,
            completed: count(StepStatus::Success),
            failed,
            skipped: count(StepStatus::Skipped),
            blocked: count(StepStatus::Blocked),
            steps,
        }
    }

    /// Record for a step
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[derive(Debug)]
struct RunState {
    phase: RunPhase,
    steps: Vec<StepRecord>,
}

/// Signals from the UI layer
#[derive(Debug, Default)]
struct Control {
    abort: AtomicBool,
    suspended: AtomicBool,
    proceed: AtomicBool,
    wake: Notify,
}

enum Resume {
    Proceed,
    Abort,
}

/// The installation engine
pub struct Installer {
    config: InstallerConfig,
    executor: Arc<dyn StepExecutor>,
    events: EventSink,
    control: Control,
    state: Mutex<RunState>,
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("phase", &self.phase())
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

impl Installer {
    /// Create engine
    #[must_use]
    pub fn new(config: InstallerConfig, executor: Arc<dyn StepExecutor>) -> Self {
        let events = EventSink::new(config.event_buffer);
        Self {
            config,
            executor,
            events,
            control: Control::default(),
            state: Mutex::new(RunState {
                phase: RunPhase::Idle,
                steps: Vec::new(),
            }),
        }
    }

    /// Progress events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InstallEvent> {
        self.events.subscribe()
    }

    /// Current run phase
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.state.lock().phase
    }

    /// Snapshot of step records for the current or last run
    #[must_use]
    pub fn steps(&self) -> Vec<StepRecord> {
        self.state.lock().steps.clone()
    }

    /// Whether the run is waiting for "proceed anyway" or abort
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.control.suspended.load(Ordering::SeqCst)
    }

    /// Resume a suspended run, skipping the step it stopped on
    ///
    /// Returns `false` if the run was not suspended.
    pub fn proceed_anyway(&self) -> bool {
        if !self.is_suspended() {
            return false;
        }
        self.control.proceed.store(true, Ordering::SeqCst);
        self.control.wake.notify_waiters();
        info!("proceeding past suspended step");
        true
    }

    /// Stop the run at the next check and kill live step processes
    pub fn abort(&self) {
        self.control.abort.store(true, Ordering::SeqCst);
        self.executor.abort_all();
        self.control.wake.notify_waiters();
        warn!("installation abort requested");
    }

    /// Resolve a manual prompt announced by a `step-requires-action` event
    ///
    /// # Errors
    /// - `InstallError::Session` if the session has no pending prompt
    pub fn respond_to_manual(&self, session_id: &str, outcome: ManualOutcome) -> Result<()> {
        self.executor.respond_to_manual(session_id, outcome)?;
        Ok(())
    }

    /// Load `<plan_dir>/<platform>.yaml` and run it
    ///
    /// # Errors
    /// - `InstallError::AlreadyRunning`
    /// - `InstallError::Plan` if the plan cannot be loaded or ordered
    pub async fn start(&self, platform: Platform) -> Result<RunSummary> {
        self.begin()?;
        match Plan::load(&self.config.plan_dir, platform) {
            Ok(plan) => self.execute(&plan).await,
            Err(e) => Err(self.fail_load(e.into())),
        }
    }

    /// Run an already-parsed plan
    ///
    /// # Errors
    /// - `InstallError::AlreadyRunning`
    /// - `InstallError::Plan` if the plan has a dependency cycle
    pub async fn run(&self, plan: &Plan) -> Result<RunSummary> {
        self.begin()?;
        self.execute(plan).await
    }

    fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase.is_active() {
            return Err(InstallError::AlreadyRunning);
        }
        validate_phase(state.phase, RunPhase::LoadingPlan)?;
        state.phase = RunPhase::LoadingPlan;
        state.steps.clear();
        drop(state);

        self.control.abort.store(false, Ordering::SeqCst);
        self.control.proceed.store(false, Ordering::SeqCst);
        self.control.suspended.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn fail_load(&self, err: InstallError) -> InstallError {
        error!(error = %err, "installation plan rejected");
        self.events.emit(EventKind::Error {
            message: err.to_string(),
        });
        self.state.lock().phase = RunPhase::Aborted;
        err
    }

    #[instrument(skip(self, plan), fields(plan = %plan.name, steps = plan.len()))]
    async fn execute(&self, plan: &Plan) -> Result<RunSummary> {
        let order = match dag::execution_order(plan) {
            Ok(order) => order,
            Err(e) => return Err(self.fail_load(e.into())),
        };
        self.set_phase(RunPhase::Sorted)?;

        let run_id = Uuid::new_v4();
        self.state.lock().steps = order.iter().map(StepRecord::pending).collect();
        let known: HashSet<&str> = order.iter().map(|s| s.id.as_str()).collect();

        self.set_phase(RunPhase::Executing)?;
        info!(%run_id, "installation started");
        self.events.emit(EventKind::InstallationStart {
            run_id,
            plan: plan.name.clone(),
            total_steps: order.len(),
        });

        let mut aborted = false;
        for (index, step) in order.iter().enumerate() {
            if self.control.abort.load(Ordering::SeqCst) {
                aborted = true;
                break;
            }
            if !self.run_one(index, order.len(), step, &known).await? {
                aborted = true;
                break;
            }
        }

        let final_phase = if aborted {
            RunPhase::Aborted
        } else {
            RunPhase::Completed
        };
        self.set_phase(final_phase)?;

        let summary = RunSummary::tally(run_id, &plan.name, aborted, self.steps());
        info!(
            success = summary.success,
            aborted,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            blocked = summary.blocked,
            "installation finished"
        );
        self.events.emit(EventKind::InstallationComplete {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Drive one step; returns `false` if the run was aborted
    async fn run_one(
        &self,
        index: usize,
        total: usize,
        step: &StepSpec,
        known: &HashSet<&str>,
    ) -> Result<bool> {
        if let Some(condition) = &step.condition {
            if self
                .executor
                .check_condition(condition, self.config.condition_timeout())
                .await
            {
                info!(step = %step.id, "skip condition met");
                self.skip(index, step, SkipReason::ConditionMet)?;
                return Ok(true);
            }
        }

        let unmet = self.unmet_needs(step, known);
        if !unmet.is_empty() {
            self.transition(index, StepStatus::Blocked)?;
            if step.required {
                self.enter_suspension()?;
            }
            self.events.emit(EventKind::StepBlocked {
                step: step.id.clone(),
                unmet: unmet.clone(),
                required: step.required,
                suspended: step.required,
                instructions: step.remediation(),
            });

            if !step.required {
                info!(step = %step.id, ?unmet, "optional step blocked; skipping");
                self.skip(index, step, SkipReason::DependencyUnsatisfied)?;
                return Ok(true);
            }

            warn!(step = %step.id, ?unmet, "required step blocked; waiting for decision");
            return self.suspend_then_skip(index, step).await;
        }

        self.transition(index, StepStatus::Running)?;
        self.update(index, |r| r.started_at = Some(Utc::now()));
        info!(step = %step.id, index, total, "step started");
        self.events.emit(EventKind::StepStart {
            step: step.id.clone(),
            name: step.name.clone(),
            index,
            total,
        });

        let session_id = format!("step-{}-{}", step.id, Uuid::new_v4().simple());
        let timeout = step
            .timeout
            .unwrap_or_else(|| self.config.default_step_timeout());
        let outcome = self
            .executor
            .run_step(step, &session_id, timeout, self.events.clone())
            .await
            .unwrap_or_else(|e| ExecOutcome::failure(e.to_string(), String::new(), String::new()));

        self.update(index, |r| {
            r.finished_at = Some(Utc::now());
            r.output.clone_from(&outcome.output);
            r.exit_code = outcome.exit_code;
            r.error.clone_from(&outcome.error);
        });

        if outcome.skipped {
            info!(step = %step.id, "manual step skipped");
            self.skip(index, step, SkipReason::ManualSkip)?;
            return Ok(true);
        }

        if outcome.success {
            self.transition(index, StepStatus::Success)?;
            info!(step = %step.id, "step completed");
            self.events.emit(EventKind::StepComplete {
                step: step.id.clone(),
                output: outcome.output,
            });
            return Ok(true);
        }

        self.transition(index, StepStatus::Failed)?;
        let error = outcome
            .error
            .clone()
            .unwrap_or_else(|| "step failed".to_string());
        warn!(step = %step.id, required = step.required, exit_code = ?outcome.exit_code, %error, "step failed");
        if step.required {
            self.enter_suspension()?;
        }
        self.events.emit(EventKind::StepFailed {
            step: step.id.clone(),
            error,
            output: outcome.output,
            exit_code: outcome.exit_code,
            required: step.required,
            suspended: step.required,
            instructions: step.remediation(),
        });

        if step.required {
            self.suspend_then_skip(index, step).await
        } else {
            self.skip(index, step, SkipReason::OptionalFailure)?;
            Ok(true)
        }
    }

    fn unmet_needs(&self, step: &StepSpec, known: &HashSet<&str>) -> Vec<String> {
        let state = self.state.lock();
        step.needs
            .iter()
            .filter(|need| known.contains(need.as_str()))
            .filter(|need| {
                state
                    .steps
                    .iter()
                    .find(|r| &r.id == *need)
                    .map_or(true, |r| !r.satisfies_needs())
            })
            .cloned()
            .collect()
    }

    /// Must run before any event carrying `suspended: true` is emitted
    fn enter_suspension(&self) -> Result<()> {
        self.set_phase(RunPhase::Suspended)?;
        self.control.suspended.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn suspend_then_skip(&self, index: usize, step: &StepSpec) -> Result<bool> {
        match self.suspend().await? {
            Resume::Abort => Ok(false),
            Resume::Proceed => {
                self.skip(index, step, SkipReason::Overridden)?;
                Ok(true)
            }
        }
    }

    async fn suspend(&self) -> Result<Resume> {
        let resume = loop {
            let woken = self.control.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            if self.control.abort.load(Ordering::SeqCst) {
                break Resume::Abort;
            }
            if self.control.proceed.swap(false, Ordering::SeqCst) {
                break Resume::Proceed;
            }
            woken.await;
        };

        self.control.suspended.store(false, Ordering::SeqCst);
        match resume {
            Resume::Abort => info!("suspended run aborted"),
            Resume::Proceed => self.set_phase(RunPhase::Executing)?,
        }
        Ok(resume)
    }

    fn skip(&self, index: usize, step: &StepSpec, reason: SkipReason) -> Result<()> {
        self.transition(index, StepStatus::Skipped)?;
        self.update(index, |r| r.skip_reason = Some(reason));
        self.events.emit(EventKind::StepSkipped {
            step: step.id.clone(),
            reason,
        });
        Ok(())
    }

    fn transition(&self, index: usize, to: StepStatus) -> Result<()> {
        let mut state = self.state.lock();
        let record = &mut state.steps[index];
        validate_step(record.status, to)?;
        record.status = to;
        Ok(())
    }

    fn update(&self, index: usize, f: impl FnOnce(&mut StepRecord)) {
        f(&mut self.state.lock().steps[index]);
    }

    fn set_phase(&self, to: RunPhase) -> Result<()> {
        let mut state = self.state.lock();
        validate_phase(state.phase, to)?;
        state.phase = to;
        Ok(())
    }
}
