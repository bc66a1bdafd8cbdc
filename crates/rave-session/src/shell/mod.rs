//! One-shot shell and script sessions
//!
//! A shell session is bookkeeping until `execute` spawns the command through
//! the platform [`ShellDispatch`]. Manual mode hands the command to a human in
//! a terminal and parks the call on a oneshot channel stored in the session,
//! resolved later by [`ShellSessions::respond_to_manual`] or by termination.

pub mod dispatch;

use crate::error::{Result, SessionError};
use crate::output::{self, OutputBuffers, OutputChunk, StreamKind};
use crate::types::{ExecOutcome, SessionInfo, SessionKind, SessionStatus};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
pub use dispatch::{for_platform, MacShell, PosixShell, Prepared, ShellDispatch, WindowsShell};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Default command timeout (30 minutes)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Time allowed for output readers to drain after the process exits or is killed
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Human resolution of a manual prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualOutcome {
    /// Command ran successfully
    Success,
    /// Command failed
    Failed,
    /// Human chose not to run it
    Skipped,
}

impl std::str::FromStr for ManualOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" | "s" => Ok(Self::Success),
            "failed" | "fail" | "f" => Ok(Self::Failed),
            "skipped" | "skip" | "k" => Ok(Self::Skipped),
            other => Err(format!("unknown manual outcome: {other}")),
        }
    }
}

/// Session creation options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellOptions {
    /// Shell command or interpreter script
    pub kind: SessionKind,
    /// Interpreter binary for script sessions
    pub interpreter_path: Option<PathBuf>,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            kind: SessionKind::Shell,
            interpreter_path: None,
        }
    }
}

impl ShellOptions {
    /// Options for evaluating scripts with `interpreter`
    #[must_use]
    pub fn script(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            kind: SessionKind::InterpreterScript,
            interpreter_path: Some(interpreter.into()),
        }
    }
}

/// Per-command options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    /// Environment overrides
    pub env: IndexMap<String, String>,
    /// Kill the process after this long
    pub timeout: Duration,
    /// Hand the command to a human (honored only where supported)
    pub manual: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            env: IndexMap::new(),
            timeout: DEFAULT_TIMEOUT,
            manual: false,
        }
    }
}

impl ExecOptions {
    /// With timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// With environment overrides
    #[must_use]
    pub fn with_env(mut self, env: IndexMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// With manual mode
    #[must_use]
    pub fn manual(mut self, manual: bool) -> Self {
        self.manual = manual;
        self
    }
}

struct ShellSession {
    id: String,
    options: ShellOptions,
    created_at: DateTime<Utc>,
    status: Mutex<SessionStatus>,
    buffers: Arc<OutputBuffers>,
    pending_manual: Mutex<Option<oneshot::Sender<ManualOutcome>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl ShellSession {
    fn claim(&self) -> Result<()> {
        let mut status = self.status.lock();
        if *status == SessionStatus::Running {
            return Err(SessionError::Busy(self.id.clone()));
        }
        *status = SessionStatus::Running;
        Ok(())
    }

    fn finish(&self) {
        *self.status.lock() = SessionStatus::Ready;
        self.kill.lock().take();
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            kind: self.options.kind,
            status: *self.status.lock(),
            port: None,
            executable: self.options.interpreter_path.clone(),
            created_at: self.created_at,
        }
    }
}

/// Registry of shell and script sessions
pub struct ShellSessions {
    dispatch: Arc<dyn ShellDispatch>,
    sessions: DashMap<String, Arc<ShellSession>>,
}

impl std::fmt::Debug for ShellSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSessions")
            .field("dispatch", &self.dispatch.name())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl Default for ShellSessions {
    fn default() -> Self {
        Self::new(for_platform())
    }
}

impl ShellSessions {
    /// Create registry with a dispatch strategy
    #[must_use]
    pub fn new(dispatch: Arc<dyn ShellDispatch>) -> Self {
        Self {
            dispatch,
            sessions: DashMap::new(),
        }
    }

    /// Whether manual mode is honored on this platform
    #[must_use]
    pub fn supports_manual(&self) -> bool {
        self.dispatch.supports_manual()
    }

    /// Register a session; no process is spawned
    ///
    /// # Errors
    /// - `SessionError::AlreadyExists` if `id` is taken
    /// - `SessionError::ExecutableNotFound` for script sessions without an interpreter
    pub fn create(&self, id: &str, options: ShellOptions) -> Result<SessionInfo> {
        if options.kind == SessionKind::InterpreterScript && options.interpreter_path.is_none() {
            return Err(SessionError::ExecutableNotFound(id.to_string()));
        }

        let session = Arc::new(ShellSession {
            id: id.to_string(),
            options,
            created_at: Utc::now(),
            status: Mutex::new(SessionStatus::Ready),
            buffers: Arc::new(OutputBuffers::new(id)),
            pending_manual: Mutex::new(None),
            kill: Mutex::new(None),
        });

        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => Err(SessionError::AlreadyExists(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                debug!(session_id = %id, kind = ?session.options.kind, "shell session created");
                Ok(session.info())
            }
        }
    }

    /// Receive live output chunks; replaces any previous subscriber
    ///
    /// # Errors
    /// - `SessionError::NotFound`
    pub fn subscribe(&self, id: &str, capacity: usize) -> Result<mpsc::Receiver<OutputChunk>> {
        Ok(self.get(id)?.buffers.subscribe(capacity))
    }

    /// Run `command` to completion
    ///
    /// Timeouts kill the process and return a failure carrying the output
    /// produced so far.
    ///
    /// # Errors
    /// - `SessionError::NotFound`, `SessionError::Busy`
    /// - `SessionError::Spawn` if the process cannot start
    pub async fn execute(&self, id: &str, command: &str, options: ExecOptions) -> Result<ExecOutcome> {
        let session = self.get(id)?;
        session.claim()?;
        session.buffers.clear();

        let result = if options.manual && self.dispatch.supports_manual() {
            self.execute_manual(&session, command, &options).await
        } else {
            self.execute_spawned(&session, command, &options).await
        };

        session.finish();
        result
    }

    async fn execute_manual(
        &self,
        session: &ShellSession,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecOutcome> {
        let env_script = dispatch::write_env_script(&options.env)?;
        let (tx, rx) = oneshot::channel();
        *session.pending_manual.lock() = Some(tx);

        if let Err(e) = self.dispatch.open_terminal(&env_script) {
            session.pending_manual.lock().take();
            return Err(e);
        }
        session.buffers.push(StreamKind::System, &format!("{command}\n"));
        info!(session_id = %session.id, "awaiting manual execution");

        // A dropped sender means the session went away without an answer.
        let outcome = rx.await.unwrap_or(ManualOutcome::Failed);
        drop(env_script);

        info!(session_id = %session.id, ?outcome, "manual execution resolved");
        Ok(match outcome {
            ManualOutcome::Success => ExecOutcome::success(String::new(), String::new(), None),
            ManualOutcome::Failed => ExecOutcome::failure(
                "manual execution reported failure",
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

    async fn execute_spawned(
        &self,
        session: &ShellSession,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecOutcome> {
        let Prepared {
            command: mut cmd,
            script,
        } = self.dispatch.prepare(
            &session.id,
            session.options.kind,
            session.options.interpreter_path.as_deref(),
            command,
        )?;

        cmd.envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            let program = cmd.as_std().get_program().to_string_lossy().into_owned();
            SessionError::spawn(program, e)
        })?;
        debug!(session_id = %session.id, dispatch = self.dispatch.name(), "process spawned");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(output::pump(stdout, session.buffers.clone(), StreamKind::Stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(output::pump(stderr, session.buffers.clone(), StreamKind::Stderr)));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *session.kill.lock() = Some(kill_tx);

        let outcome = tokio::select! {
            status = child.wait() => {
                let _ = tokio::time::timeout(DRAIN_GRACE, drain_readers(readers)).await;
                let code = status?.code();
                let stdout = session.buffers.stdout();
                let stderr = session.buffers.stderr();
                debug!(session_id = %session.id, exit_code = ?code, "process exited");
                if code == Some(0) {
                    ExecOutcome::success(stdout, stderr, code)
                } else {
                    let error = match code {
                        Some(code) => format!("Command failed with exit code {code}"),
                        None => "Command terminated by signal".to_string(),
                    };
                    ExecOutcome::failure(error, stdout, stderr).with_exit_code(code)
                }
            }
            () = tokio::time::sleep(options.timeout) => {
                let _ = child.kill().await;
                let _ = tokio::time::timeout(DRAIN_GRACE, drain_readers(readers)).await;
                warn!(session_id = %session.id, timeout_ms = options.timeout.as_millis() as u64, "command timed out");
                ExecOutcome::failure(
                    format!("Command timed out after {}ms", options.timeout.as_millis()),
                    session.buffers.stdout(),
                    session.buffers.stderr(),
                )
            }
            _ = kill_rx => {
                let _ = child.kill().await;
                ExecOutcome::failure(
                    "Session terminated",
                    session.buffers.stdout(),
                    session.buffers.stderr(),
                )
            }
        };

        drop(script);
        Ok(outcome)
    }

    /// Resolve a pending manual prompt
    ///
    /// # Errors
    /// - `SessionError::NotFound`
    /// - `SessionError::NoPendingPrompt` if the session is not waiting on a human
    pub fn respond_to_manual(&self, id: &str, outcome: ManualOutcome) -> Result<()> {
        let session = self.get(id)?;
        let sender = session
            .pending_manual
            .lock()
            .take()
            .ok_or_else(|| SessionError::NoPendingPrompt(id.to_string()))?;
        let _ = sender.send(outcome);
        Ok(())
    }

    /// Whether a manual prompt is waiting on a human
    #[must_use]
    pub fn has_pending_prompt(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|s| s.pending_manual.lock().is_some())
    }

    /// Fail any pending prompt, kill any live process and forget the session
    ///
    /// No-op for unknown ids.
    pub fn terminate(&self, id: &str) {
        let Some((_, session)) = self.sessions.remove(id) else {
            return;
        };
        if let Some(prompt) = session.pending_manual.lock().take() {
            let _ = prompt.send(ManualOutcome::Failed);
        }
        if let Some(kill) = session.kill.lock().take() {
            let _ = kill.send(());
        }
        session.buffers.unsubscribe();
        debug!(session_id = %id, "shell session terminated");
    }

    /// Terminate every session
    pub fn terminate_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "terminating all shell sessions");
        }
        for id in ids {
            self.terminate(&id);
        }
    }

    /// Snapshot of one session
    #[must_use]
    pub fn info(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.get(id).map(|s| s.info())
    }

    /// Number of registered sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn get(&self, id: &str) -> Result<Arc<ShellSession>> {
        self.sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}

async fn drain_readers(readers: Vec<tokio::task::JoinHandle<()>>) {
    for reader in readers {
        let _ = reader.await;
    }
}
