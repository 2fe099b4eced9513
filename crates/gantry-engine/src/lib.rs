//! Module discovery, convention resolution, task planning, scheduling, and
//! report aggregation for Gantry.

pub mod aggregate;
pub mod convention;
pub mod diagnostics;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod module;
pub mod publish;
pub mod schedule;
pub mod task;
pub mod workspace;

pub use aggregate::{aggregate, AggregateReport, AggregationError, Fragment};
pub use convention::{Convention, ConventionRegistry, ResolvedConfig};
pub use error::EngineError;
pub use fingerprint::FingerprintStore;
pub use graph::{Plan, TaskGraph};
pub use module::{Module, ModuleGraph};
pub use schedule::{execute, CancelToken, ExecuteOptions, ExecutionSummary, TaskResult};
pub use task::{Action, EdgeKind, FailureCause, SkipReason, TaskId, TaskNode, TaskState};
pub use workspace::Workspace;
