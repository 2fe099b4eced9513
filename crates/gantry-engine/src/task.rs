//! Task nodes: identifiers, actions, predicates, and execution states.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gantry_config::PropertyStore;

use crate::error::EngineError;
use crate::schedule::CancelToken;

/// A module-qualified task identifier such as `:core:test` or `:check`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(String);

impl TaskId {
    /// Build the identifier of task `name` in the module at `module_path`.
    pub fn new(module_path: &str, name: &str) -> Self {
        if module_path == crate::module::ROOT_PATH {
            Self(format!(":{name}"))
        } else {
            Self(format!("{module_path}:{name}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The unqualified task name (the segment after the last `:`).
    pub fn name(&self) -> &str {
        self.0.rsplit(':').next().unwrap_or(&self.0)
    }

    /// The owning module path (`:` for root tasks).
    pub fn module_path(&self) -> &str {
        match self.0.rfind(':') {
            Some(0) | None => crate::module::ROOT_PATH,
            Some(idx) => self.0.get(..idx).unwrap_or(crate::module::ROOT_PATH),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Kinds of edges between task nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// The target must complete before the source; failure propagates.
    DependsOn,
    /// The target runs after the source whatever the source's outcome.
    FinalizedBy,
    /// The target runs before the source when both are planned; no failure coupling.
    MustRunAfter,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DependsOn => "dependsOn",
            Self::FinalizedBy => "finalizedBy",
            Self::MustRunAfter => "mustRunAfter",
        })
    }
}

/// A failure raised by a task action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ActionError {
    pub message: String,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<EngineError> for ActionError {
    fn from(err: EngineError) -> Self {
        Self::new(err.to_string())
    }
}

/// Everything an in-process action may look at while running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub work_dir: PathBuf,
    pub properties: Arc<PropertyStore>,
    pub cancel: CancelToken,
}

pub type ActionFn = Arc<dyn Fn(&TaskContext) -> Result<(), ActionError> + Send + Sync>;

/// An external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// The unit of work a node performs.
#[derive(Clone)]
pub enum Action {
    /// Lifecycle task: only groups its dependencies.
    Noop,
    /// Run an external tool (compiler, code-quality checker, test runner).
    Command(CommandSpec),
    /// Run an in-process closure. `label` identifies the closure in fingerprints.
    Func { label: String, run: ActionFn },
}

impl Action {
    pub fn command(argv: Vec<String>) -> Self {
        Self::Command(CommandSpec {
            argv,
            env: BTreeMap::new(),
        })
    }

    pub fn func<F>(label: &str, run: F) -> Self
    where
        F: Fn(&TaskContext) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        Self::Func {
            label: label.to_owned(),
            run: Arc::new(run),
        }
    }

    /// A stable description of the action, part of the task fingerprint.
    pub fn descriptor(&self) -> String {
        match self {
            Self::Noop => "noop".to_owned(),
            Self::Command(spec) => {
                let mut parts = vec!["command".to_owned()];
                parts.extend(spec.argv.iter().cloned());
                parts.extend(spec.env.iter().map(|(k, v)| format!("{k}={v}")));
                parts.join("\u{1f}")
            }
            Self::Func { label, .. } => format!("func\u{1f}{label}"),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => f.write_str("Noop"),
            Self::Command(spec) => f.debug_tuple("Command").field(spec).finish(),
            Self::Func { label, .. } => f.debug_struct("Func").field("label", label).finish(),
        }
    }
}

pub type PredicateFn = Arc<dyn Fn(&PropertyStore) -> bool + Send + Sync>;

/// An `onlyIf` condition, evaluated when the node becomes ready.
#[derive(Clone)]
pub enum Predicate {
    /// The property is set to a truthy value.
    Flag(String),
    /// The property equals the given value.
    Equals(String, String),
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Custom(PredicateFn),
}

impl Predicate {
    /// Parse an expression such as `!skipIntegrationTests`, `profile=ci`,
    /// `profile!=ci`, or `a && !b || c` (`&&` binds tighter than `||`).
    ///
    /// # Errors
    /// Returns `EngineError::InvalidPredicate` for empty terms or keys.
    pub fn parse(expr: &str) -> Result<Self, EngineError> {
        let invalid = |reason: &str| EngineError::InvalidPredicate {
            expr: expr.to_owned(),
            reason: reason.to_owned(),
        };

        let mut any = Vec::new();
        for alternative in expr.split("||") {
            let mut all = Vec::new();
            for term in alternative.split("&&") {
                all.push(parse_term(term.trim()).ok_or_else(|| invalid("empty term or key"))?);
            }
            any.push(if all.len() == 1 {
                all.pop().ok_or_else(|| invalid("empty expression"))?
            } else {
                Self::All(all)
            });
        }
        if any.len() == 1 {
            any.pop().ok_or_else(|| invalid("empty expression"))
        } else {
            Ok(Self::Any(any))
        }
    }

    pub fn eval(&self, properties: &PropertyStore) -> bool {
        match self {
            Self::Flag(key) => properties.get_bool(key),
            Self::Equals(key, value) => properties.get(key) == Some(value.as_str()),
            Self::Not(inner) => !inner.eval(properties),
            Self::All(items) => items.iter().all(|p| p.eval(properties)),
            Self::Any(items) => items.iter().any(|p| p.eval(properties)),
            Self::Custom(f) => f(properties),
        }
    }
}

fn parse_term(term: &str) -> Option<Predicate> {
    if let Some((key, value)) = term.split_once("!=") {
        let key = key.trim();
        return (!key.is_empty()).then(|| {
            Predicate::Not(Box::new(Predicate::Equals(
                key.to_owned(),
                value.trim().to_owned(),
            )))
        });
    }
    if let Some(rest) = term.strip_prefix('!') {
        return parse_term(rest.trim()).map(|p| Predicate::Not(Box::new(p)));
    }
    if let Some((key, value)) = term.split_once('=') {
        let key = key.trim();
        return (!key.is_empty())
            .then(|| Predicate::Equals(key.to_owned(), value.trim().to_owned()));
    }
    (!term.is_empty()).then(|| Predicate::Flag(term.to_owned()))
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(key) => write!(f, "{key}"),
            Self::Equals(key, value) => write!(f, "{key}={value}"),
            Self::Not(inner) => write!(f, "!({inner:?})"),
            Self::All(items) => f.debug_tuple("All").field(items).finish(),
            Self::Any(items) => f.debug_tuple("Any").field(items).finish(),
            Self::Custom(_) => f.write_str("<custom>"),
        }
    }
}

/// Declared inputs contributing to a node's fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskInputs {
    /// Globs relative to the node's working directory.
    pub files: Vec<String>,
    /// Configuration values (property and setting names with their values).
    pub values: BTreeMap<String, String>,
    /// Tasks whose recorded output digest is an input of this node.
    pub tasks: Vec<TaskId>,
}

/// A schedulable unit of work.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub description: Option<String>,
    pub action: Action,
    /// Directory the action runs in; relative inputs and outputs resolve against it.
    pub work_dir: PathBuf,
    pub inputs: TaskInputs,
    /// Declared outputs (files or directories), relative to `work_dir`.
    pub outputs: Vec<PathBuf>,
    pub only_if: Option<Predicate>,
    pub timeout: Option<Duration>,
    /// `false` means the node is never skipped as up-to-date.
    pub cacheable: bool,
}

impl TaskNode {
    pub fn new(id: TaskId, action: Action) -> Self {
        Self {
            id,
            description: None,
            action,
            work_dir: PathBuf::from("."),
            inputs: TaskInputs::default(),
            outputs: Vec::new(),
            only_if: None,
            timeout: None,
            cacheable: true,
        }
    }

    pub fn with_work_dir(mut self, dir: &Path) -> Self {
        self.work_dir = dir.to_path_buf();
        self
    }

    pub fn with_input_files(mut self, patterns: &[&str]) -> Self {
        self.inputs
            .files
            .extend(patterns.iter().map(|p| (*p).to_owned()));
        self
    }

    pub fn with_input_value(mut self, key: &str, value: &str) -> Self {
        self.inputs.values.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_upstream_output(mut self, task: TaskId) -> Self {
        self.inputs.tasks.push(task);
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs.extend(outputs.iter().map(PathBuf::from));
        self
    }

    pub fn with_only_if(mut self, predicate: Predicate) -> Self {
        self.only_if = Some(predicate);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn never_up_to_date(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Declared outputs resolved against the working directory.
    pub fn resolved_outputs(&self) -> Vec<PathBuf> {
        self.outputs.iter().map(|o| self.work_dir.join(o)).collect()
    }
}

/// Why a node was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Inputs and outputs are unchanged since the last successful run.
    UpToDate,
    /// The `onlyIf` predicate was false.
    OnlyIf,
    /// A `dependsOn` predecessor failed (directly or transitively).
    UpstreamFailure { failed: TaskId },
    /// The invocation was cancelled before the node started.
    Cancelled,
}

/// Why a node failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    Action(String),
    Timeout(Duration),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action(message) => f.write_str(message),
            Self::Timeout(limit) => write!(f, "timed out after {:.1}s", limit.as_secs_f64()),
        }
    }
}

/// Lifecycle of a node within one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed(FailureCause),
    Skipped(SkipReason),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Skipped(_))
    }

    /// Whether nodes depending on this one must not run.
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            Self::Failed(_)
                | Self::Skipped(SkipReason::UpstreamFailure { .. } | SkipReason::Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Ready => f.write_str("ready"),
            Self::Running => f.write_str("running"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed(cause) => write!(f, "failed ({cause})"),
            Self::Skipped(SkipReason::UpToDate) => f.write_str("up-to-date"),
            Self::Skipped(SkipReason::OnlyIf) => f.write_str("skipped (onlyIf)"),
            Self::Skipped(SkipReason::UpstreamFailure { failed }) => {
                write!(f, "skipped ({failed} failed)")
            }
            Self::Skipped(SkipReason::Cancelled) => f.write_str("skipped (cancelled)"),
        }
    }
}
