//! Output boundary markers for unframed interpreter stdout
//!
//! A command is complete once its sentinel appears on stdout. The token is
//! `__RAVE_DONE_<unix millis>_<16 hex digits>__`. The statement that prints
//! it splits the literal in two halves so an interpreter that echoes its
//! input never echoes the whole token.

use rand::Rng;
use serde::{Deserialize, Serialize};

const PREFIX: &str = "__RAVE_DONE_";

/// Interpreter language, used to render the sentinel statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// GNU R
    #[default]
    R,
    /// Python 3
    Python,
    /// POSIX shell reading commands from stdin
    Shell,
}

/// A unique completion marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    token: String,
}

impl Sentinel {
    /// Generate a fresh sentinel
    #[must_use]
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix: u64 = rand::rng().random();
        Self {
            token: format!("{PREFIX}{millis}_{suffix:016x}__"),
        }
    }

    /// The marker text
    #[inline]
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Statement printing the marker on its own line
    #[must_use]
    pub fn statement(&self, dialect: Dialect) -> String {
        let mid = self.token.len() / 2;
        let (head, tail) = self.token.split_at(mid);
        match dialect {
            Dialect::R => format!("cat(paste0(\"{head}\", \"{tail}\"), \"\\n\", sep = \"\")"),
            Dialect::Python => format!("print(\"{head}\" + \"{tail}\", flush=True)"),
            Dialect::Shell => format!("printf '%s%s\\n' '{head}' '{tail}'"),
        }
    }

    /// Submitted code followed by the sentinel statement
    #[must_use]
    pub fn wrap(&self, code: &str, dialect: Dialect) -> String {
        let mut payload = String::with_capacity(code.len() + 96);
        payload.push_str(code);
        if !code.ends_with('\n') {
            payload.push('\n');
        }
        payload.push_str(&self.statement(dialect));
        payload.push('\n');
        payload
    }
}
