//! Parallel execution of a planned task graph.
//!
//! A fixed number of workers share one lock-protected state table and sleep on
//! a condition variable until a node becomes ready. Failures are collected
//! (fail-at-end): every node not excluded by an upstream failure still runs.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use gantry_config::PropertyStore;

use crate::error::EngineError;
use crate::fingerprint::{self, FingerprintRecord, FingerprintStore};
use crate::graph::{Plan, PlannedTask};
use crate::task::{
    Action, ActionFn, CommandSpec, FailureCause, SkipReason, TaskContext, TaskId, TaskNode,
    TaskState,
};

/// Cooperative cancellation flag shared by the caller, workers, and actions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for [`execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Number of workers; `0` is treated as `1`.
    pub parallelism: usize,
    pub cancel: CancelToken,
    /// Properties visible to `onlyIf` predicates and in-process actions.
    pub properties: Arc<PropertyStore>,
    /// Cancel the rest of the invocation on the first failure.
    pub fail_fast: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            cancel: CancelToken::new(),
            properties: Arc::new(PropertyStore::new()),
            fail_fast: false,
        }
    }
}

/// Number of available CPUs, at least 1.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// The outcome of one node.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: TaskId,
    pub state: TaskState,
    pub duration: Duration,
    /// Declared outputs present after the node finished.
    pub outputs: Vec<PathBuf>,
}

/// The outcome of one invocation, in plan order.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub results: Vec<TaskResult>,
    pub duration: Duration,
}

impl ExecutionSummary {
    pub fn result(&self, id: &TaskId) -> Option<&TaskResult> {
        self.results.iter().find(|r| &r.id == id)
    }

    pub fn state(&self, id: &TaskId) -> Option<&TaskState> {
        self.result(id).map(|r| &r.state)
    }

    pub fn failed(&self) -> Vec<&TaskResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.state, TaskState::Failed(_)))
            .collect()
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&TaskState) -> bool,
    {
        self.results.iter().filter(|r| predicate(&r.state)).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_empty()
    }

    /// `0` when nothing failed, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }
}

struct Table {
    states: Vec<TaskState>,
    started: Vec<bool>,
    durations: Vec<Duration>,
    /// Nodes not yet terminal.
    remaining: usize,
    running: usize,
}

struct Shared<'a, 'g> {
    plan: &'a Plan<'g>,
    store: &'a FingerprintStore,
    options: &'a ExecuteOptions,
    table: Mutex<Table>,
    wake: Condvar,
}

impl Shared<'_, '_> {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Execute every node of `plan`.
///
/// Fingerprint records are refreshed as nodes finish and the store is saved
/// once at the end; a failure to save is logged, not returned.
///
/// # Errors
/// Returns `EngineError::WorkerPool` if the worker threads cannot be started.
pub fn execute(
    plan: &Plan<'_>,
    store: &FingerprintStore,
    options: &ExecuteOptions,
) -> Result<ExecutionSummary, EngineError> {
    let start = Instant::now();
    let len = plan.len();
    let shared = Shared {
        plan,
        store,
        options,
        table: Mutex::new(Table {
            states: vec![TaskState::Pending; len],
            started: vec![false; len],
            durations: vec![Duration::ZERO; len],
            remaining: len,
            running: 0,
        }),
        wake: Condvar::new(),
    };

    let workers = options.parallelism.max(1).min(len.max(1));
    tracing::debug!(tasks = len, workers, "executing plan");

    if len > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("gantry-worker-{i}"))
            .build()
            .map_err(|e| EngineError::WorkerPool {
                message: e.to_string(),
            })?;
        pool.scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| worker(&shared));
            }
        });
    }

    if let Err(e) = store.save() {
        tracing::warn!(error = %e, "cannot save fingerprint cache");
    }

    let table = shared.table.into_inner().unwrap_or_else(PoisonError::into_inner);
    let results = plan
        .nodes()
        .zip(table.states)
        .zip(table.durations)
        .map(|((node, state), duration)| {
            let outputs = match state {
                TaskState::Succeeded | TaskState::Skipped(SkipReason::UpToDate) => node
                    .resolved_outputs()
                    .into_iter()
                    .filter(|p| p.exists())
                    .collect(),
                _ => Vec::new(),
            };
            TaskResult {
                id: node.id.clone(),
                state,
                duration,
                outputs,
            }
        })
        .collect();

    Ok(ExecutionSummary {
        results,
        duration: start.elapsed(),
    })
}

fn worker(shared: &Shared<'_, '_>) {
    loop {
        let pos = {
            let mut table = shared.lock();
            loop {
                if table.remaining == 0 {
                    return;
                }
                if let Some(pos) = next_ready(shared, &mut table) {
                    break pos;
                }
                if table.remaining == 0 {
                    shared.wake.notify_all();
                    return;
                }
                if table.running == 0 {
                    tracing::error!(remaining = table.remaining, "no runnable task left; stopping");
                    shared.wake.notify_all();
                    return;
                }
                table = shared
                    .wake
                    .wait(table)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let Some(node) = shared.plan.planned().get(pos).and_then(|t| shared.plan.graph().node_at(t.node)) else {
            return;
        };
        let started = Instant::now();
        let state = run_node(node, shared.store, shared.options);
        let elapsed = started.elapsed();

        if matches!(state, TaskState::Failed(_)) && shared.options.fail_fast {
            shared.options.cancel.cancel();
        }

        let mut table = shared.lock();
        if let Some(slot) = table.states.get_mut(pos) {
            *slot = state;
        }
        if let Some(slot) = table.durations.get_mut(pos) {
            *slot = elapsed;
        }
        table.running = table.running.saturating_sub(1);
        table.remaining = table.remaining.saturating_sub(1);
        drop(table);
        shared.wake.notify_all();
    }
}

/// Settle every waiting node whose fate is already decided, mark runnable
/// nodes `Ready`, and claim the first of them, marking it `Running`.
fn next_ready(shared: &Shared<'_, '_>, table: &mut Table) -> Option<usize> {
    let planned = shared.plan.planned();
    let cancelled = shared.options.cancel.is_cancelled();
    let mut settled = false;
    let mut claimed = None;

    for (pos, task) in planned.iter().enumerate() {
        let ready = match table.states.get(pos) {
            Some(TaskState::Pending) => false,
            Some(TaskState::Ready) => true,
            _ => continue,
        };

        if cancelled {
            let finalizes_started = task
                .finalizes
                .iter()
                .any(|&f| table.started.get(f).copied().unwrap_or(false));
            if !finalizes_started {
                settle(table, pos, TaskState::Skipped(SkipReason::Cancelled));
                settled = true;
                continue;
            }
        }

        if !ready && !promote(shared, table, pos, task) {
            settled |= table.states.get(pos).is_some_and(TaskState::is_terminal);
            continue;
        }
        if claimed.is_some() {
            continue;
        }

        if let Some(slot) = table.states.get_mut(pos) {
            *slot = TaskState::Running;
        }
        if let Some(flag) = table.started.get_mut(pos) {
            *flag = true;
        }
        table.running += 1;
        claimed = Some(pos);
    }

    if settled {
        shared.wake.notify_all();
    }
    claimed
}

/// Move a pending node to `Ready` once every predecessor is terminal, or skip
/// it when a dependency blocks it. Returns whether the node became `Ready`.
fn promote(shared: &Shared<'_, '_>, table: &mut Table, pos: usize, task: &PlannedTask) -> bool {
    let planned = shared.plan.planned();
    let all_terminal = task
        .preds
        .iter()
        .all(|&p| table.states.get(p).is_some_and(TaskState::is_terminal));
    if !all_terminal {
        return false;
    }

    let blocker = task.depends_on.iter().find_map(|&p| {
        let state = table.states.get(p)?;
        if !state.blocks_dependents() {
            return None;
        }
        match state {
            TaskState::Skipped(SkipReason::UpstreamFailure { failed }) => Some(failed.clone()),
            _ => planned
                .get(p)
                .and_then(|t| shared.plan.graph().node_at(t.node))
                .map(|n| n.id.clone()),
        }
    });
    if let Some(failed) = blocker {
        if let Some(node) = shared.plan.graph().node_at(task.node) {
            eprintln!("     Skipped {} ({failed} failed)", node.id);
        }
        settle(table, pos, TaskState::Skipped(SkipReason::UpstreamFailure { failed }));
        return false;
    }

    if let Some(slot) = table.states.get_mut(pos) {
        *slot = TaskState::Ready;
    }
    true
}

fn settle(table: &mut Table, pos: usize, state: TaskState) {
    if let Some(slot) = table.states.get_mut(pos) {
        *slot = state;
    }
    table.remaining = table.remaining.saturating_sub(1);
}

/// Run one ready node outside the lock and return its terminal state.
fn run_node(node: &TaskNode, store: &FingerprintStore, options: &ExecuteOptions) -> TaskState {
    if let Some(predicate) = &node.only_if {
        if !predicate.eval(&options.properties) {
            tracing::debug!(task = %node.id, "onlyIf predicate is false");
            eprintln!("     Skipped {} (onlyIf)", node.id);
            return TaskState::Skipped(SkipReason::OnlyIf);
        }
    }

    let fingerprint = if node.cacheable {
        match fingerprint::compute(node, store) {
            Ok(fp) => Some(fp),
            Err(e) => {
                store.forget(&node.id);
                return fail(node, FailureCause::Action(format!("cannot fingerprint inputs: {e}")));
            }
        }
    } else {
        None
    };

    if let Some(fp) = &fingerprint {
        let unchanged = store.get(&node.id).is_some_and(|r| &r.fingerprint == fp);
        if unchanged && fingerprint::outputs_exist(node) {
            tracing::debug!(task = %node.id, fingerprint = %fp, "inputs unchanged");
            eprintln!("  Up-to-date {}", node.id);
            remember(node, store, fp, "up-to-date");
            return TaskState::Skipped(SkipReason::UpToDate);
        }
    }

    eprintln!("   Executing {}", node.id);
    let started = Instant::now();
    let outcome = run_action(node, options);
    tracing::debug!(task = %node.id, duration_ms = started.elapsed().as_millis(), "action finished");

    match outcome {
        Ok(()) => {
            match &fingerprint {
                Some(fp) => remember(node, store, fp, "succeeded"),
                None => store.forget(&node.id),
            }
            TaskState::Succeeded
        }
        Err(cause) => {
            store.forget(&node.id);
            fail(node, cause)
        }
    }
}

fn fail(node: &TaskNode, cause: FailureCause) -> TaskState {
    tracing::debug!(task = %node.id, cause = %cause, "task failed");
    eprintln!("      Failed {}: {cause}", node.id);
    TaskState::Failed(cause)
}

fn remember(node: &TaskNode, store: &FingerprintStore, fingerprint: &str, state: &str) {
    let output_digest = match fingerprint::output_digest(node) {
        Ok(digest) => digest,
        Err(e) => {
            tracing::warn!(task = %node.id, error = %e, "cannot digest outputs");
            store.forget(&node.id);
            return;
        }
    };
    store.record(
        &node.id,
        FingerprintRecord {
            fingerprint: fingerprint.to_owned(),
            outputs: node
                .outputs
                .iter()
                .map(|o| o.display().to_string())
                .collect(),
            state: state.to_owned(),
            output_digest,
        },
    );
}

fn run_action(node: &TaskNode, options: &ExecuteOptions) -> Result<(), FailureCause> {
    match &node.action {
        Action::Noop => Ok(()),
        Action::Command(spec) => run_command(node, spec),
        Action::Func { run, .. } => {
            let ctx = TaskContext {
                id: node.id.clone(),
                work_dir: node.work_dir.clone(),
                properties: Arc::clone(&options.properties),
                cancel: options.cancel.clone(),
            };
            run_func(run, ctx, node.timeout)
        }
    }
}

fn run_command(node: &TaskNode, spec: &CommandSpec) -> Result<(), FailureCause> {
    let mut cmd = gantry_util::process::command_from_argv(&spec.argv)
        .map_err(|e| FailureCause::Action(e.to_string()))?;
    cmd.current_dir(&node.work_dir).envs(&spec.env);

    let output = gantry_util::process::run_command(&mut cmd, node.timeout)
        .map_err(|e| FailureCause::Action(e.to_string()))?;

    if !output.stdout.is_empty() {
        tracing::debug!(task = %node.id, stdout = %output.stdout.trim_end(), "command output");
    }
    if output.timed_out {
        return Err(FailureCause::Timeout(node.timeout.unwrap_or_default()));
    }
    if output.success {
        return Ok(());
    }

    let program = spec.argv.first().map_or("command", String::as_str);
    let status = output
        .exit_code
        .map_or_else(|| "a signal".to_owned(), |code| format!("exit code {code}"));
    let stderr = output.stderr.trim();
    let message = if stderr.is_empty() {
        format!("`{program}` failed with {status}")
    } else {
        let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        format!("`{program}` failed with {status}\n{}", tail.join("\n"))
    };
    Err(FailureCause::Action(message))
}

fn run_func(run: &ActionFn, ctx: TaskContext, timeout: Option<Duration>) -> Result<(), FailureCause> {
    let Some(limit) = timeout else {
        return invoke(run, &ctx);
    };

    let (tx, rx) = mpsc::channel();
    let run = Arc::clone(run);
    let spawned = std::thread::Builder::new()
        .name(format!("gantry-action-{}", ctx.id))
        .spawn(move || {
            let _ = tx.send(invoke(&run, &ctx));
        });
    if let Err(e) = spawned {
        return Err(FailureCause::Action(format!("cannot start action thread: {e}")));
    }

    match rx.recv_timeout(limit) {
        Ok(result) => result,
        // The action thread is abandoned; it finishes (or not) on its own.
        Err(mpsc::RecvTimeoutError::Timeout) => Err(FailureCause::Timeout(limit)),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(FailureCause::Action("action thread exited without a result".to_owned()))
        }
    }
}

fn invoke(run: &ActionFn, ctx: &TaskContext) -> Result<(), FailureCause> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| run(ctx))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(FailureCause::Action(e.message)),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "action panicked".to_owned());
            Err(FailureCause::Action(format!("action panicked: {message}")))
        }
    }
}
