//! Declarative installation plans
//!
//! A plan is a YAML document per platform:
//!
//! ```yaml
//! name: R toolchain (linux)
//! steps:
//!   - id: r
//!     name: Install R
//!     kind: shell
//!     run: sudo apt-get install -y r-base
//!     if: command -v R
//!     required: true
//!   - id: packages
//!     name: Install R packages
//!     kind: script
//!     run: install.packages("jsonlite")
//!     needs: [r]
//! ```
//!
//! Steps are validated on load; a bad step fails the whole plan.

use crate::error::PlanError;
use crate::platform::Platform;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a step's command is run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// Platform shell command
    Shell,
    /// Interpreter script evaluation
    InterpreterScript,
}

impl StepKind {
    fn parse(step: &str, raw: &str) -> Result<Self, PlanError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "shell" => Ok(Self::Shell),
            "script" | "interpreter-script" | "r-script" | "rscript" => Ok(Self::InterpreterScript),
            _ => Err(PlanError::UnsupportedKind {
                step: step.to_string(),
                kind: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell => f.write_str("shell"),
            Self::InterpreterScript => f.write_str("interpreter-script"),
        }
    }
}

/// One validated plan step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique id
    pub id: String,
    /// Display name
    pub name: String,
    /// Execution kind
    pub kind: StepKind,
    /// Command text; empty means nothing to run
    pub run: String,
    /// Predecessor step ids, in declared order
    pub needs: Vec<String>,
    /// Skip-condition command; exit 0 skips the step
    pub condition: Option<String>,
    /// Failure suspends the run instead of auto-skipping
    pub required: bool,
    /// Per-step timeout
    pub timeout: Option<Duration>,
    /// Environment overrides
    pub env: IndexMap<String, String>,
    /// Hand the command to a human
    pub manual_execute: bool,
    /// Remediation text shown to the human
    pub manual_instructions: Option<String>,
}

impl StepSpec {
    /// Minimal shell step, mostly for tests and builders
    #[must_use]
    pub fn shell(id: impl Into<String>, run: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: StepKind::Shell,
            run: run.into(),
            needs: Vec::new(),
            condition: None,
            required: false,
            timeout: None,
            env: IndexMap::new(),
            manual_execute: false,
            manual_instructions: None,
        }
    }

    /// With predecessors
    #[must_use]
    pub fn needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    /// With required flag
    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// With skip condition (exit 0 skips the step)
    #[must_use]
    pub fn skip_if(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// With manual execution and instructions
    #[must_use]
    pub fn manual(mut self, instructions: impl Into<String>) -> Self {
        self.manual_execute = true;
        self.manual_instructions = Some(instructions.into());
        self
    }

    /// Remediation text for a human: instructions, else the command itself
    #[must_use]
    pub fn remediation(&self) -> String {
        self.manual_instructions
            .clone()
            .unwrap_or_else(|| self.run.clone())
    }
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    name: Option<String>,
    steps: Option<Vec<RawStep>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    id: Option<String>,
    name: Option<String>,
    #[serde(alias = "type")]
    kind: Option<String>,
    #[serde(default)]
    run: String,
    #[serde(default)]
    needs: Vec<String>,
    #[serde(rename = "if")]
    condition: Option<String>,
    #[serde(default)]
    required: bool,
    /// Milliseconds
    timeout: Option<u64>,
    #[serde(default)]
    env: IndexMap<String, String>,
    #[serde(default)]
    manual_execute: bool,
    manual_instructions: Option<String>,
}

impl RawStep {
    fn validate(self, index: usize) -> Result<StepSpec, PlanError> {
        let present = |value: Option<String>, field: &'static str| {
            value
                .filter(|v| !v.trim().is_empty())
                .ok_or(PlanError::MissingField { index, field })
        };
        let id = present(self.id, "id")?;
        let name = present(self.name, "name")?;
        let kind = StepKind::parse(&id, &present(self.kind, "kind")?)?;

        Ok(StepSpec {
            id,
            name,
            kind,
            run: self.run,
            needs: self.needs,
            condition: self.condition.filter(|c| !c.trim().is_empty()),
            required: self.required,
            timeout: self.timeout.map(Duration::from_millis),
            env: self.env,
            manual_execute: self.manual_execute,
            manual_instructions: self.manual_instructions,
        })
    }
}

/// A validated plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Display name
    pub name: String,
    /// Steps in declared order
    pub steps: Vec<StepSpec>,
}

impl Plan {
    /// Build a plan from already-validated steps
    ///
    /// # Errors
    /// - `PlanError::DuplicateStep` if two steps share an id
    pub fn new(name: impl Into<String>, steps: Vec<StepSpec>) -> Result<Self, PlanError> {
        let mut seen = HashSet::with_capacity(steps.len());
        for step in &steps {
            if !seen.insert(step.id.as_str()) {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
        }
        Ok(Self {
            name: name.into(),
            steps,
        })
    }

    /// Parse YAML text
    ///
    /// # Errors
    /// - `PlanError::Parse` for malformed YAML
    /// - `PlanError::MissingSteps` if there is no `steps` sequence
    /// - `PlanError::MissingField`, `PlanError::UnsupportedKind`, `PlanError::DuplicateStep`
    pub fn parse(text: &str) -> Result<Self, PlanError> {
        let raw: RawPlan = serde_yaml::from_str(text)?;
        let raw_steps = raw.steps.ok_or(PlanError::MissingSteps)?;
        let steps = raw_steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| step.validate(index))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(raw.name.unwrap_or_else(|| "installation".to_string()), steps)
    }

    /// Read and parse a plan file
    ///
    /// # Errors
    /// - `PlanError::Io` if the file cannot be read
    /// - any error from [`Plan::parse`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Load `<plan_dir>/<platform>.yaml`
    ///
    /// # Errors
    /// Same as [`Plan::from_file`].
    pub fn load(plan_dir: impl AsRef<Path>, platform: Platform) -> Result<Self, PlanError> {
        Self::from_file(Self::path_for(plan_dir, platform))
    }

    /// Plan file location for a platform
    #[must_use]
    pub fn path_for(plan_dir: impl AsRef<Path>, platform: Platform) -> PathBuf {
        plan_dir.as_ref().join(format!("{platform}.yaml"))
    }

    /// Look up a step
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Number of steps
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
