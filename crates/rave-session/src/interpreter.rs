//! Interactive interpreter sessions
//!
//! Each session owns one long-running interpreter process and a loopback
//! port from the shared [`PortPool`]. Commands are written to stdin with a
//! trailing sentinel statement; a command completes when the sentinel shows
//! up on stdout.
//!
//! # Lifecycle
//!
//! ```text
//! create -> Ready <-> Running
//!             \         |
//!              +--> Crashed (process exit)
//! terminate: any state -> removed, port released, process killed
//! ```

use crate::error::{Result, SessionError};
use crate::output::{self, OutputBuffers, OutputChunk, StreamKind};
use crate::ports::PortPool;
use crate::sentinel::{Dialect, Sentinel};
use crate::types::{ExecOutcome, SessionInfo, SessionKind, SessionStatus};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Environment variable carrying the allocated port to the interpreter
pub const PORT_ENV: &str = "RAVE_SESSION_PORT";

/// Options for spawning an interpreter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterOptions {
    /// Extra arguments (e.g. `--quiet --no-save`)
    pub args: Vec<String>,
    /// Environment overrides
    pub env: IndexMap<String, String>,
    /// Language used for the sentinel statement
    pub dialect: Dialect,
    /// Suppress crash notifications
    pub headless: bool,
    /// Working directory
    pub working_dir: Option<PathBuf>,
}

impl InterpreterOptions {
    /// Options for a dialect with no extra arguments
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            ..Self::default()
        }
    }

    /// With arguments
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// With headless mode
    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// With one environment override
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Emitted when a non-headless interpreter exits unexpectedly
///
/// Receivers offer the user a restart (same executable) or cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashNotice {
    /// Crashed session
    pub session_id: String,
    /// Executable to restart with
    pub executable: PathBuf,
    /// Exit code, if the process reported one
    pub exit_code: Option<i32>,
}

/// Readiness polling for embedded servers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerProbe {
    /// Delay between attempts
    pub interval: Duration,
    /// Maximum attempts
    pub attempts: u32,
}

impl Default for ServerProbe {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            attempts: 20,
        }
    }
}

struct InterpreterSession {
    id: String,
    executable: PathBuf,
    options: InterpreterOptions,
    port: u16,
    created_at: DateTime<Utc>,
    status: Mutex<SessionStatus>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    buffers: Arc<OutputBuffers>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    terminating: AtomicBool,
}

impl InterpreterSession {
    fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    /// Ready -> Running, rejecting busy or crashed sessions
    fn claim(&self) -> Result<()> {
        let mut status = self.status.lock();
        match *status {
            SessionStatus::Ready => {
                *status = SessionStatus::Running;
                Ok(())
            }
            SessionStatus::Running => Err(SessionError::Busy(self.id.clone())),
            SessionStatus::Crashed => Err(SessionError::NotReady(self.id.clone())),
        }
    }

    async fn write_stdin(&self, text: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| SessionError::StdinClosed(self.id.clone()))?;
        let written = async {
            stdin.write_all(text.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        written.map_err(|_| SessionError::StdinClosed(self.id.clone()))
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            kind: SessionKind::Interpreter,
            status: self.status(),
            port: Some(self.port),
            executable: Some(self.executable.clone()),
            created_at: self.created_at,
        }
    }

    fn on_exit(&self, exit_code: Option<i32>, crashes: &broadcast::Sender<CrashNotice>) {
        if self.terminating.load(Ordering::SeqCst) {
            self.buffers.wake();
            debug!(session_id = %self.id, "interpreter stopped");
            return;
        }

        // Status must flip before waking so a waiting execute sees the crash.
        self.set_status(SessionStatus::Crashed);
        self.buffers.wake();
        warn!(session_id = %self.id, ?exit_code, "interpreter exited unexpectedly");

        if !self.options.headless {
            let _ = crashes.send(CrashNotice {
                session_id: self.id.clone(),
                executable: self.executable.clone(),
                exit_code,
            });
        }
    }
}

/// Registry of interactive interpreter sessions
pub struct InterpreterSessions {
    ports: Arc<PortPool>,
    sessions: DashMap<String, Arc<InterpreterSession>>,
    crashes: broadcast::Sender<CrashNotice>,
    server_probe: ServerProbe,
    http: reqwest::Client,
}

impl std::fmt::Debug for InterpreterSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterSessions")
            .field("sessions", &self.sessions.len())
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

impl InterpreterSessions {
    /// Create registry drawing ports from `ports`
    #[must_use]
    pub fn new(ports: Arc<PortPool>) -> Self {
        Self::with_server_probe(ports, ServerProbe::default())
    }

    /// Create registry with custom readiness polling
    #[must_use]
    pub fn with_server_probe(ports: Arc<PortPool>, server_probe: ServerProbe) -> Self {
        let (crashes, _) = broadcast::channel(16);
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(server_probe.interval.max(Duration::from_millis(100)))
            .build()
            .unwrap_or_default();
        Self {
            ports,
            sessions: DashMap::new(),
            crashes,
            server_probe,
            http,
        }
    }

    /// Subscribe to crash notices
    #[must_use]
    pub fn crash_events(&self) -> broadcast::Receiver<CrashNotice> {
        self.crashes.subscribe()
    }

    /// Spawn an interpreter under `id`
    ///
    /// # Errors
    /// - `SessionError::AlreadyExists` if `id` is taken
    /// - `SessionError::ExecutableNotFound` if no executable was resolved
    /// - `SessionError::Port` if the port pool is exhausted
    /// - `SessionError::Spawn` if the process fails to start
    pub async fn create(
        &self,
        id: &str,
        executable: Option<&Path>,
        options: InterpreterOptions,
    ) -> Result<SessionInfo> {
        if self.sessions.contains_key(id) {
            return Err(SessionError::AlreadyExists(id.to_string()));
        }
        let executable = executable
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| SessionError::ExecutableNotFound(id.to_string()))?
            .to_path_buf();

        let port = self.ports.allocate()?;

        let mut cmd = Command::new(&executable);
        cmd.args(&options.args)
            .envs(&options.env)
            .env(PORT_ENV, port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(port);
                return Err(SessionError::spawn(executable.display().to_string(), e));
            }
        };

        let buffers = Arc::new(OutputBuffers::new(id));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(output::pump(stdout, buffers.clone(), StreamKind::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(output::pump(stderr, buffers.clone(), StreamKind::Stderr));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let session = Arc::new(InterpreterSession {
            id: id.to_string(),
            executable,
            options,
            port,
            created_at: Utc::now(),
            status: Mutex::new(SessionStatus::Ready),
            stdin: tokio::sync::Mutex::new(child.stdin.take()),
            buffers,
            kill: Mutex::new(Some(kill_tx)),
            terminating: AtomicBool::new(false),
        });

        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => {
                // Lost a race with a concurrent create; `child` is killed on drop.
                self.ports.release(port);
                return Err(SessionError::AlreadyExists(id.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }

        let watched = session.clone();
        let crashes = self.crashes.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            watched.on_exit(status.ok().and_then(|s| s.code()), &crashes);
        });

        info!(session_id = %id, port, executable = %session.executable.display(), "interpreter session created");
        Ok(session.info())
    }

    /// Run `code` and return the stdout it produced
    ///
    /// The sentinel statement for the session's dialect is appended; the
    /// returned output is everything on stdout before the sentinel. On
    /// timeout the outcome is a failure carrying partial output and the
    /// session stays `Running` until it is terminated or restarted.
    ///
    /// # Errors
    /// - `SessionError::NotFound`, `SessionError::Busy`, `SessionError::NotReady`
    /// - `SessionError::StdinClosed` if the process no longer reads input
    pub async fn execute(&self, id: &str, code: &str, timeout: Duration) -> Result<ExecOutcome> {
        let session = self.get(id)?;
        session.claim()?;

        session.buffers.clear();
        let sentinel = Sentinel::generate();
        let payload = sentinel.wrap(code, session.options.dialect);

        if let Err(e) = session.write_stdin(&payload).await {
            if session.status() == SessionStatus::Running {
                session.set_status(SessionStatus::Ready);
            }
            return Err(e);
        }
        debug!(session_id = %id, sentinel = sentinel.token(), "command submitted");

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = session.buffers.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(output) = session.buffers.stdout_before(sentinel.token()) {
                session.set_status(SessionStatus::Ready);
                return Ok(ExecOutcome::success(output, session.buffers.stderr(), None));
            }

            if session.status() == SessionStatus::Crashed {
                return Ok(ExecOutcome::failure(
                    "interpreter exited before completing the command",
                    session.buffers.stdout(),
                    session.buffers.stderr(),
                ));
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                warn!(session_id = %id, timeout_ms = timeout.as_millis() as u64, "command timed out");
                return Ok(ExecOutcome::failure(
                    format!("Command timed out after {}ms", timeout.as_millis()),
                    session.buffers.stdout(),
                    session.buffers.stderr(),
                ));
            }
        }
    }

    /// Hand the session to an embedded web server and wait for it to answer
    ///
    /// `command` is written to stdin as-is (no sentinel) after replacing
    /// `{port}` with the session's port. The session stays `Running`.
    /// Returns whether `http://127.0.0.1:<port>/` responded within the
    /// polling budget.
    ///
    /// # Errors
    /// - `SessionError::NotFound`, `SessionError::Busy`, `SessionError::NotReady`
    /// - `SessionError::StdinClosed`
    pub async fn start_interactive_server(&self, id: &str, command: &str) -> Result<bool> {
        let session = self.get(id)?;
        session.claim()?;

        let command = command.replace("{port}", &session.port.to_string());
        if let Err(e) = session.write_stdin(&format!("{command}\n")).await {
            session.set_status(SessionStatus::Ready);
            return Err(e);
        }

        let url = format!("http://127.0.0.1:{}/", session.port);
        info!(session_id = %id, %url, "waiting for interactive server");

        for attempt in 1..=self.server_probe.attempts {
            if session.status() == SessionStatus::Crashed {
                return Ok(false);
            }
            if self.http.get(&url).send().await.is_ok() {
                info!(session_id = %id, attempt, "interactive server is up");
                return Ok(true);
            }
            tokio::time::sleep(self.server_probe.interval).await;
        }

        warn!(session_id = %id, attempts = self.server_probe.attempts, "interactive server never responded");
        Ok(false)
    }

    /// Receive live output chunks; replaces any previous subscriber
    ///
    /// # Errors
    /// - `SessionError::NotFound`
    pub fn subscribe(&self, id: &str, capacity: usize) -> Result<tokio::sync::mpsc::Receiver<OutputChunk>> {
        Ok(self.get(id)?.buffers.subscribe(capacity))
    }

    /// Kill the process, release the port and forget the session
    ///
    /// No-op for unknown ids.
    pub fn terminate(&self, id: &str) {
        let Some((_, session)) = self.sessions.remove(id) else {
            return;
        };
        session.terminating.store(true, Ordering::SeqCst);
        if let Some(kill) = session.kill.lock().take() {
            let _ = kill.send(());
        }
        session.buffers.unsubscribe();
        self.ports.release(session.port);
        info!(session_id = %id, port = session.port, "interpreter session terminated");
    }

    /// Recreate a session with its original executable and options
    ///
    /// # Errors
    /// Same as [`InterpreterSessions::create`], plus `SessionError::NotFound`.
    pub async fn restart(&self, id: &str) -> Result<SessionInfo> {
        let session = self.get(id)?;
        let executable = session.executable.clone();
        let options = session.options.clone();
        drop(session);

        self.terminate(id);
        self.create(id, Some(&executable), options).await
    }

    /// Terminate every session
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.terminate(&id);
        }
    }

    /// Snapshot of one session
    #[must_use]
    pub fn info(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.get(id).map(|s| s.info())
    }

    /// Status of one session
    #[must_use]
    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        self.sessions.get(id).map(|s| s.status())
    }

    /// Snapshots of all sessions
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.info()).collect()
    }

    fn get(&self, id: &str) -> Result<Arc<InterpreterSession>> {
        self.sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}

impl Drop for InterpreterSessions {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ports::PortProbe;
    use pretty_assertions::assert_eq;

    struct AlwaysFree;

    impl PortProbe for AlwaysFree {
        fn is_available(&self, _port: u16) -> bool {
            true
        }
    }

    fn pool(start: u16, end: u16) -> Arc<PortPool> {
        Arc::new(PortPool::with_probe(start, end, Arc::new(AlwaysFree)).unwrap())
    }

    fn registry(start: u16, end: u16) -> InterpreterSessions {
        InterpreterSessions::new(pool(start, end))
    }

    fn sentinel_prefix() -> &'static str {
        "__RAVE_DONE_"
    }

    fn sh() -> InterpreterOptions {
        InterpreterOptions::new(Dialect::Shell).headless(true)
    }

    #[tokio::test]
    async fn execute_returns_output_before_sentinel() {
        let sessions = registry(9100, 9101);
        sessions.create("sh", Some(Path::new("/bin/sh")), sh()).await.unwrap();

        let outcome = sessions
            .execute("sh", "echo hello", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.output, "hello\n");
        assert!(!outcome.output.contains("__RAVE_DONE_"));
        assert_eq!(sessions.status("sh"), Some(SessionStatus::Ready));

        let second = sessions
            .execute("sh", "echo again", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(second.output, "again\n");

        sessions.terminate("sh");
    }

    #[tokio::test]
    async fn echoing_interpreter_never_leaks_sentinel() {
        let sessions = registry(9110, 9110);
        // `sh -v` echoes each input line (to stderr) before running it.
        sessions
            .create("echo", Some(Path::new("/bin/sh")), sh().with_args(["-v"]))
            .await
            .unwrap();

        let outcome = sessions
            .execute("echo", "echo visible", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output, "visible\n");
        assert!(!outcome.output.contains(sentinel_prefix()));
        sessions.terminate("echo");
    }

    #[tokio::test]
    async fn create_rejects_duplicate_and_missing_executable() {
        let sessions = registry(9120, 9122);
        sessions.create("a", Some(Path::new("/bin/sh")), sh()).await.unwrap();

        assert!(matches!(
            sessions.create("a", Some(Path::new("/bin/sh")), sh()).await,
            Err(SessionError::AlreadyExists(_))
        ));
        assert!(matches!(
            sessions.create("b", None, sh()).await,
            Err(SessionError::ExecutableNotFound(_))
        ));
        sessions.terminate("a");
    }

    #[tokio::test]
    async fn concurrent_execute_is_rejected() {
        let sessions = Arc::new(registry(9130, 9130));
        sessions.create("s", Some(Path::new("/bin/sh")), sh()).await.unwrap();

        let first = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                sessions
                    .execute("s", "sleep 0.3; echo done", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = sessions.execute("s", "echo nope", Duration::from_secs(5)).await;
        assert!(matches!(second, Err(SessionError::Busy(_))));

        let first = first.await.unwrap().unwrap();
        assert!(first.success);
        assert_eq!(first.output, "done\n");
        sessions.terminate("s");
    }

    #[tokio::test]
    async fn timeout_keeps_partial_output_and_process() {
        let sessions = registry(9140, 9140);
        sessions.create("t", Some(Path::new("/bin/sh")), sh()).await.unwrap();

        let outcome = sessions
            .execute("t", "echo partial; sleep 5", Duration::from_millis(300))
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.output, "partial\n");
        assert!(outcome.error.unwrap().contains("timed out"));
        assert_eq!(sessions.status("t"), Some(SessionStatus::Running));
        sessions.terminate("t");
    }

    #[tokio::test]
    async fn terminate_releases_port_and_is_idempotent() {
        let ports = Arc::new(PortPool::with_probe(9150, 9150, Arc::new(AlwaysFree)).unwrap());
        let sessions = InterpreterSessions::new(ports.clone());

        let info = sessions.create("p", Some(Path::new("/bin/sh")), sh()).await.unwrap();
        assert_eq!(info.port, Some(9150));
        assert!(matches!(
            sessions.create("q", Some(Path::new("/bin/sh")), sh()).await,
            Err(SessionError::Port(_))
        ));

        sessions.terminate("p");
        sessions.terminate("p");
        assert!(!ports.is_in_use(9150));
        assert!(sessions.info("p").is_none());
    }

    #[tokio::test]
    async fn crash_marks_session_and_notifies() {
        let sessions = registry(9160, 9161);
        let mut crashes = sessions.crash_events();
        sessions
            .create("c", Some(Path::new("/bin/sh")), InterpreterOptions::new(Dialect::Shell))
            .await
            .unwrap();

        let outcome = sessions.execute("c", "exit 3", Duration::from_secs(5)).await.unwrap();
        assert!(!outcome.success);

        let notice = tokio::time::timeout(Duration::from_secs(5), crashes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.session_id, "c");
        assert_eq!(notice.exit_code, Some(3));
        assert_eq!(sessions.status("c"), Some(SessionStatus::Crashed));
        assert!(matches!(
            sessions.execute("c", "echo", Duration::from_secs(1)).await,
            Err(SessionError::NotReady(_))
        ));

        let info = sessions.restart("c").await.unwrap();
        assert_eq!(info.status, SessionStatus::Ready);
        sessions.terminate("c");
    }

    #[tokio::test]
    async fn port_is_exported_to_interpreter() {
        let sessions = registry(9170, 9170);
        sessions.create("e", Some(Path::new("/bin/sh")), sh()).await.unwrap();

        let outcome = sessions
            .execute("e", "echo $RAVE_SESSION_PORT", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.output, "9170\n");
        sessions.terminate("e");
    }

    #[tokio::test]
    async fn interactive_server_answers_on_session_port() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let probe = ServerProbe {
            interval: Duration::from_millis(50),
            attempts: 40,
        };
        let sessions = InterpreterSessions::with_server_probe(pool(9180, 9180), probe);
        sessions.create("srv", Some(Path::new("/bin/sh")), sh()).await.unwrap();
        let mut chunks = sessions.subscribe("srv", 16).unwrap();

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 9180)).await.unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let up = sessions
            .start_interactive_server("srv", "echo listening on {port}")
            .await
            .unwrap();

        assert!(up);
        assert_eq!(sessions.status("srv"), Some(SessionStatus::Running));
        let chunk = tokio::time::timeout(Duration::from_secs(5), chunks.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.text, "listening on 9180\n");
        server.await.unwrap();
        sessions.terminate("srv");
    }

    #[tokio::test]
    async fn interactive_server_gives_up_after_attempts() {
        let probe = ServerProbe {
            interval: Duration::from_millis(20),
            attempts: 3,
        };
        let sessions = InterpreterSessions::with_server_probe(pool(9190, 9190), probe);
        sessions.create("quiet", Some(Path::new("/bin/sh")), sh()).await.unwrap();

        let up = sessions.start_interactive_server("quiet", "true").await.unwrap();

        assert!(!up);
        assert_eq!(sessions.status("quiet"), Some(SessionStatus::Running));
        assert!(matches!(
            sessions.execute("quiet", "echo", Duration::from_secs(1)).await,
            Err(SessionError::Busy(_))
        ));
        sessions.terminate("quiet");
    }
}
