//! RAVE Session - supervised interpreter and shell processes
//!
//! Provides:
//! - A loopback port pool with reuse-before-probe allocation
//! - Long-lived interpreter sessions with sentinel-framed request/response execution
//! - One-shot shell and script sessions with timeouts and a human-in-the-loop mode
//! - Bounded per-session output subscriptions
//!
//! # Example
//!
//! ```rust,ignore
//! use rave_session::prelude::*;
//! use std::{path::Path, sync::Arc, time::Duration};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ports = Arc::new(PortPool::new(17283, 17300)?);
//! let sessions = InterpreterSessions::new(ports);
//!
//! sessions
//!     .create("r", Some(Path::new("/usr/bin/R")), InterpreterOptions::new(Dialect::R))
//!     .await?;
//! let outcome = sessions.execute("r", "cat(1 + 1)", Duration::from_secs(10)).await?;
//! assert_eq!(outcome.output, "2");
//! sessions.terminate("r");
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod error;
pub mod interpreter;
pub mod output;
pub mod ports;
pub mod sentinel;
pub mod shell;
pub mod types;

pub use error::{PortError, Result, SessionError};
pub use interpreter::{CrashNotice, InterpreterOptions, InterpreterSessions, ServerProbe, PORT_ENV};
pub use output::{OutputBuffers, OutputChunk, StreamKind, DEFAULT_SUBSCRIPTION_CAPACITY};
pub use ports::{LoopbackProbe, PortPool, PortProbe, PortStats};
pub use sentinel::{Dialect, Sentinel};
pub use shell::{
    ExecOptions, ManualOutcome, ShellDispatch, ShellOptions, ShellSessions, DEFAULT_TIMEOUT,
};
pub use types::{ExecOutcome, SessionInfo, SessionKind, SessionStatus};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with sessions
    pub use crate::{
        Dialect, ExecOptions, ExecOutcome, InterpreterOptions, InterpreterSessions, ManualOutcome,
        PortPool, SessionError, SessionStatus, ShellOptions, ShellSessions,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
