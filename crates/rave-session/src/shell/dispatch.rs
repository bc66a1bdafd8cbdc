//! Platform shell strategies
//!
//! One [`ShellDispatch`] is chosen per [`ShellSessions`](super::ShellSessions)
//! at construction. It decides how a command line becomes a process and
//! whether the platform can hand a command to a human in a terminal.

use crate::error::{Result, SessionError};
use crate::types::SessionKind;
use indexmap::IndexMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempPath};
use tokio::process::Command;

/// A command ready to spawn, plus any temporary file it depends on
///
/// The temporary file is deleted when this value is dropped.
#[derive(Debug)]
pub struct Prepared {
    /// Command to spawn (stdio not yet configured)
    pub command: Command,
    /// Backing script, removed on drop
    pub script: Option<TempPath>,
}

impl Prepared {
    fn direct(command: Command) -> Self {
        Self {
            command,
            script: None,
        }
    }
}

/// How commands are run on this platform
pub trait ShellDispatch: Send + Sync + std::fmt::Debug {
    /// Strategy name for logs
    fn name(&self) -> &'static str;

    /// Build the process for `command`
    ///
    /// # Errors
    /// - `SessionError::ExecutableNotFound` for script kinds without an interpreter
    /// - `SessionError::Io` if a temporary script cannot be written
    fn prepare(
        &self,
        session_id: &str,
        kind: SessionKind,
        interpreter: Option<&Path>,
        command: &str,
    ) -> Result<Prepared>;

    /// Whether manual execution in a user-visible terminal is available
    fn supports_manual(&self) -> bool {
        false
    }

    /// Open a terminal that sources `env_script`
    ///
    /// # Errors
    /// - `SessionError::Spawn` if the terminal cannot be launched
    fn open_terminal(&self, _env_script: &Path) -> Result<()> {
        Ok(())
    }
}

/// Script-evaluation invocation shared by every platform
fn interpreter_script(session_id: &str, interpreter: Option<&Path>, code: &str) -> Result<Prepared> {
    let interpreter =
        interpreter.ok_or_else(|| SessionError::ExecutableNotFound(session_id.to_string()))?;
    let mut command = Command::new(interpreter);
    command.arg("-e").arg(code);
    Ok(Prepared::direct(command))
}

/// `sh -c` on Unix-like systems
#[derive(Debug, Clone)]
pub struct PosixShell {
    shell: PathBuf,
}

impl Default for PosixShell {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl PosixShell {
    /// Use a specific shell binary
    #[must_use]
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl ShellDispatch for PosixShell {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn prepare(
        &self,
        session_id: &str,
        kind: SessionKind,
        interpreter: Option<&Path>,
        command: &str,
    ) -> Result<Prepared> {
        match kind {
            SessionKind::InterpreterScript => interpreter_script(session_id, interpreter, command),
            SessionKind::Shell | SessionKind::Interpreter => {
                let mut cmd = Command::new(&self.shell);
                cmd.arg("-c").arg(command);
                Ok(Prepared::direct(cmd))
            }
        }
    }
}

/// POSIX execution plus manual mode through Terminal.app
#[derive(Debug, Clone, Default)]
pub struct MacShell {
    posix: PosixShell,
}

impl ShellDispatch for MacShell {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn prepare(
        &self,
        session_id: &str,
        kind: SessionKind,
        interpreter: Option<&Path>,
        command: &str,
    ) -> Result<Prepared> {
        self.posix.prepare(session_id, kind, interpreter, command)
    }

    fn supports_manual(&self) -> bool {
        true
    }

    fn open_terminal(&self, env_script: &Path) -> Result<()> {
        let source = format!("source {}", shell_quote(&env_script.display().to_string()));
        let script = format!(
            "tell application \"Terminal\"\nactivate\ndo script \"{}\"\nend tell",
            source.replace('\\', "\\\\").replace('"', "\\\"")
        );
        std::process::Command::new("osascript")
            .arg("-e")
            .arg(script)
            .spawn()
            .map(drop)
            .map_err(|e| SessionError::spawn("osascript", e))
    }
}

/// `cmd /C` over a temporary batch file
#[derive(Debug, Clone, Default)]
pub struct WindowsShell;

impl ShellDispatch for WindowsShell {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn prepare(
        &self,
        session_id: &str,
        kind: SessionKind,
        interpreter: Option<&Path>,
        command: &str,
    ) -> Result<Prepared> {
        if kind == SessionKind::InterpreterScript {
            return interpreter_script(session_id, interpreter, command);
        }

        let mut file = Builder::new()
            .prefix("rave-")
            .suffix(".bat")
            .tempfile()?;
        file.write_all(b"@echo off\r\n")?;
        file.write_all(command.replace('\n', "\r\n").as_bytes())?;
        file.write_all(b"\r\n")?;
        file.flush()?;
        let script = file.into_temp_path();

        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(script.as_os_str());
        Ok(Prepared {
            command: cmd,
            script: Some(script),
        })
    }
}

/// Strategy for the platform this binary was built for
#[must_use]
pub fn for_platform() -> std::sync::Arc<dyn ShellDispatch> {
    if cfg!(target_os = "windows") {
        std::sync::Arc::new(WindowsShell)
    } else if cfg!(target_os = "macos") {
        std::sync::Arc::new(MacShell::default())
    } else {
        std::sync::Arc::new(PosixShell::default())
    }
}

/// Single-quote a value for POSIX shells
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Write an environment-setup script for manual execution
///
/// # Errors
/// - `SessionError::Io` if the file cannot be written
pub(crate) fn write_env_script(env: &IndexMap<String, String>) -> Result<TempPath> {
    let mut file = Builder::new()
        .prefix("rave-env-")
        .suffix(".sh")
        .tempfile()?;
    writeln!(file, "#!/bin/sh")?;
    for (key, value) in env {
        writeln!(file, "export {key}={}", shell_quote(value))?;
    }
    file.flush()?;
    Ok(file.into_temp_path())
}
