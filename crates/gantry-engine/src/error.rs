//! Error types for gantry-engine.

/// Errors produced by engine operations.
///
/// Everything here is raised before or around execution; task-level failures
/// are recorded as [`crate::task::FailureCause`] on the node instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A filesystem operation failed.
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// A utility operation failed.
    #[error("{0}")]
    Util(#[from] gantry_util::error::UtilError),

    /// A manifest could not be read or parsed.
    #[error("{0}")]
    Manifest(#[from] gantry_config::manifest::ManifestError),

    /// A command-line property was malformed.
    #[error("{0}")]
    Property(#[from] gantry_config::properties::PropertyError),

    /// Report fragments could not be merged.
    #[error("{0}")]
    Aggregation(#[from] crate::aggregate::AggregationError),

    /// The workspace root has no `gantry.toml`.
    #[error("no gantry.toml found at {path} — not a gantry workspace")]
    MissingWorkspaceManifest { path: String },

    /// Discovery found no source module under the root.
    #[error("no modules found under {root} — a module needs a gantry.toml or a src/ directory")]
    Discovery { root: String },

    /// A module references a module that does not exist.
    #[error("module `{module}` depends on unknown module `{dependency}`")]
    UnknownModule { module: String, dependency: String },

    /// Modules depend on each other in a cycle.
    #[error("module dependency cycle: {cycle}")]
    ModuleCycle { cycle: String },

    /// A convention with this name is already registered.
    #[error("convention `{name}` is already registered")]
    DuplicateConvention { name: String },

    /// A module or convention names a convention that is not registered.
    #[error("unknown convention `{name}` (requested by {requested_by})")]
    UnknownConvention { name: String, requested_by: String },

    /// Conventions include each other in a cycle.
    #[error("convention include cycle: {cycle}")]
    ConventionCycle { cycle: String },

    /// A task with this identifier already exists in the graph.
    #[error("task `{id}` is already registered")]
    DuplicateTask { id: String },

    /// A requested or referenced task does not exist.
    #[error("unknown task `{name}`{context}")]
    UnknownTask { name: String, context: String },

    /// A task name is not usable as an identifier segment.
    #[error("invalid task name `{name}` in {module} — names must be non-empty and must not contain `:` or `^`")]
    InvalidTaskName { name: String, module: String },

    /// The ordering edges among planned tasks contain a cycle.
    #[error("task cycle detected: {cycle}")]
    CycleDetected { cycle: String },

    /// An `only_if` expression could not be parsed.
    #[error("invalid only_if expression `{expr}`: {reason}")]
    InvalidPredicate { expr: String, reason: String },

    /// A report publishes to a sink that is not declared.
    #[error("report `{report}` publishes to unknown sink `{sink}`")]
    UnknownSink { report: String, sink: String },

    /// Publishing an artifact to a sink failed.
    #[error("cannot publish {artifact} to `{sink}`: {message}")]
    Publish {
        sink: String,
        artifact: String,
        message: String,
    },

    /// The fingerprint cache could not be (de)serialized.
    #[error("cannot process fingerprint cache {path}: {message}")]
    FingerprintCache { path: String, message: String },

    /// The worker pool could not be started.
    #[error("cannot start worker pool: {message}")]
    WorkerPool { message: String },
}
