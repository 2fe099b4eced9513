//! Conventions: named, reusable configuration mutations applied to modules.
//!
//! A convention is an ordered list of closures over a module's [`BuildState`].
//! Conventions may include other conventions, which are applied first and at
//! most once per module. Scalar settings are last-write-wins; set-valued
//! settings and task edge lists are union-merged.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use gantry_config::manifest::{ConventionDecl, TaskDecl};
use gantry_config::properties::{interpolate, split_list};

use crate::error::EngineError;
use crate::module::Module;

/// Set key under which plugin/tool names are collected.
pub const PLUGINS: &str = "plugins";

/// Mutable configuration of one module while conventions are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildState {
    pub settings: BTreeMap<String, String>,
    pub sets: BTreeMap<String, BTreeSet<String>>,
    pub tasks: BTreeMap<String, TaskDecl>,
    /// Convention currently being applied; `None` for the module overlay.
    current: Option<String>,
    /// Last convention write per scalar key, with the value written.
    writers: BTreeMap<String, (String, String)>,
    conflicts: Vec<Conflict>,
}

impl BuildState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a scalar setting, replacing the previous value.
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(convention) = self.current.clone() {
            if let Some((previous, previous_value)) = self.writers.get(key) {
                if previous != &convention && previous_value != value {
                    self.conflicts.push(Conflict {
                        key: key.to_owned(),
                        first: previous.clone(),
                        first_value: previous_value.clone(),
                        second: convention.clone(),
                        second_value: value.to_owned(),
                    });
                }
            }
            self.writers
                .insert(key.to_owned(), (convention, value.to_owned()));
        }
        self.settings.insert(key.to_owned(), value.to_owned());
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    /// Union `values` into the set-valued setting `key`.
    pub fn add_to_set<I, S>(&mut self, key: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sets
            .entry(key.to_owned())
            .or_default()
            .extend(values.into_iter().map(Into::into));
    }

    pub fn set_values(&self, key: &str) -> Vec<&str> {
        self.sets
            .get(key)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn add_plugin(&mut self, name: &str) {
        self.add_to_set(PLUGINS, [name]);
    }

    pub fn plugins(&self) -> Vec<&str> {
        self.set_values(PLUGINS)
    }

    /// Merge `decl` into the task `name`, creating it if needed.
    pub fn merge_task(&mut self, name: &str, decl: &TaskDecl) {
        let task = self.tasks.entry(name.to_owned()).or_default();
        merge_task_decl(task, decl);
    }

    /// The task `name`, created empty if missing.
    pub fn task_mut(&mut self, name: &str) -> &mut TaskDecl {
        self.tasks.entry(name.to_owned()).or_default()
    }
}

fn union_into(target: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Field-wise merge: scalars are last-write-wins, lists are union-merged.
fn merge_task_decl(task: &mut TaskDecl, decl: &TaskDecl) {
    if decl.description.is_some() {
        task.description.clone_from(&decl.description);
    }
    if !decl.command.is_empty() {
        task.command.clone_from(&decl.command);
    }
    task.env
        .extend(decl.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    union_into(&mut task.inputs, &decl.inputs);
    union_into(&mut task.input_properties, &decl.input_properties);
    union_into(&mut task.outputs, &decl.outputs);
    union_into(&mut task.depends_on, &decl.depends_on);
    union_into(&mut task.finalized_by, &decl.finalized_by);
    union_into(&mut task.must_run_after, &decl.must_run_after);
    if decl.only_if.is_some() {
        task.only_if.clone_from(&decl.only_if);
    }
    if decl.timeout_secs.is_some() {
        task.timeout_secs = decl.timeout_secs;
    }
    if decl.cacheable.is_some() {
        task.cacheable = decl.cacheable;
    }
    if decl.matrix.is_some() {
        task.matrix.clone_from(&decl.matrix);
    }
}

/// Two conventions wrote different values to the same scalar setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub key: String,
    pub first: String,
    pub first_value: String,
    pub second: String,
    pub second_value: String,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` set to `{}` by {} and to `{}` by {}",
            self.key, self.first_value, self.first, self.second_value, self.second
        )
    }
}

pub type MutationFn = Arc<dyn Fn(&mut BuildState) + Send + Sync>;

/// One named configuration step of a convention.
#[derive(Clone)]
pub struct Mutation {
    pub name: String,
    pub apply: MutationFn,
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation").field("name", &self.name).finish()
    }
}

/// A named, reusable bundle of configuration mutations.
#[derive(Debug, Clone)]
pub struct Convention {
    pub name: String,
    /// Conventions applied before this one.
    pub includes: Vec<String>,
    /// Plugins/tools this convention relies on.
    pub plugins: Vec<String>,
    pub mutations: Vec<Mutation>,
}

impl Convention {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            includes: Vec::new(),
            plugins: Vec::new(),
            mutations: Vec::new(),
        }
    }

    pub fn include(mut self, name: &str) -> Self {
        self.includes.push(name.to_owned());
        self
    }

    pub fn plugin(mut self, name: &str) -> Self {
        self.plugins.push(name.to_owned());
        self
    }

    pub fn mutation<F>(mut self, name: &str, apply: F) -> Self
    where
        F: Fn(&mut BuildState) + Send + Sync + 'static,
    {
        self.mutations.push(Mutation {
            name: name.to_owned(),
            apply: Arc::new(apply),
        });
        self
    }

    /// Compile a convention declared in the root manifest.
    pub fn from_decl(name: &str, decl: &ConventionDecl) -> Self {
        let mut convention = Self::new(name);
        convention.includes.clone_from(&decl.includes);
        convention.plugins.clone_from(&decl.plugins);

        if !decl.settings.is_empty() {
            let settings = decl.settings.clone();
            convention = convention.mutation("settings", move |state| {
                for (key, value) in &settings {
                    state.set(key, value);
                }
            });
        }
        if !decl.sets.is_empty() {
            let sets = decl.sets.clone();
            convention = convention.mutation("sets", move |state| {
                for (key, values) in &sets {
                    state.add_to_set(key, values.iter().cloned());
                }
            });
        }
        for (task_name, task) in &decl.tasks {
            let task_name = task_name.clone();
            let task = task.clone();
            convention = convention.mutation(&format!("task {task_name}"), move |state| {
                state.merge_task(&task_name, &task);
            });
        }
        convention
    }
}

/// The effective configuration of one module.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub module: String,
    /// Conventions actually applied, in application order (includes first).
    pub applied: Vec<String>,
    pub state: BuildState,
    pub conflicts: Vec<Conflict>,
}

/// All registered conventions.
#[derive(Debug, Clone, Default)]
pub struct ConventionRegistry {
    conventions: BTreeMap<String, Convention>,
}

impl ConventionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a convention.
    ///
    /// # Errors
    /// Returns `EngineError::DuplicateConvention` if the name is taken.
    pub fn register(&mut self, convention: Convention) -> Result<(), EngineError> {
        if self.conventions.contains_key(&convention.name) {
            return Err(EngineError::DuplicateConvention {
                name: convention.name,
            });
        }
        self.conventions.insert(convention.name.clone(), convention);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Convention> {
        self.conventions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.conventions.keys().map(String::as_str)
    }

    /// Apply the named conventions to `state` in order and return the names
    /// applied (included conventions first, each at most once).
    ///
    /// # Errors
    /// Returns `EngineError::UnknownConvention` for an unregistered name and
    /// `EngineError::ConventionCycle` if includes form a cycle.
    pub fn apply(
        &self,
        state: &mut BuildState,
        names: &[String],
        requested_by: &str,
    ) -> Result<Vec<String>, EngineError> {
        let mut color: HashMap<String, u8> = HashMap::new();
        let mut applied = Vec::new();
        for name in names {
            let mut stack = Vec::new();
            self.visit(name, requested_by, state, &mut color, &mut applied, &mut stack)?;
        }
        state.current = None;
        Ok(applied)
    }

    fn visit(
        &self,
        name: &str,
        requested_by: &str,
        state: &mut BuildState,
        color: &mut HashMap<String, u8>,
        applied: &mut Vec<String>,
        stack: &mut Vec<String>,
    ) -> Result<(), EngineError> {
        match color.get(name).copied().unwrap_or(0) {
            2 => return Ok(()),
            1 => {
                stack.push(name.to_owned());
                let start = stack.iter().position(|n| n == name).unwrap_or(0);
                let cycle = stack.get(start..).unwrap_or(stack.as_slice()).join(" -> ");
                return Err(EngineError::ConventionCycle { cycle });
            }
            _ => {}
        }

        let Some(convention) = self.conventions.get(name) else {
            return Err(EngineError::UnknownConvention {
                name: name.to_owned(),
                requested_by: requested_by.to_owned(),
            });
        };

        color.insert(name.to_owned(), 1);
        stack.push(name.to_owned());
        let requester = format!("convention `{name}`");
        for include in &convention.includes {
            self.visit(include, &requester, state, color, applied, stack)?;
        }
        stack.pop();

        state.current = Some(name.to_owned());
        for plugin in &convention.plugins {
            state.add_plugin(plugin);
        }
        for mutation in &convention.mutations {
            tracing::trace!(convention = name, mutation = %mutation.name, "applying mutation");
            (mutation.apply)(state);
        }
        state.current = None;

        color.insert(name.to_owned(), 2);
        applied.push(name.to_owned());
        Ok(())
    }

    /// Compute the effective configuration of `module`: its conventions in
    /// declaration order, then its own manifest settings, sets, and tasks.
    ///
    /// # Errors
    /// Returns an error if a convention is unknown or includes form a cycle.
    pub fn resolve(&self, module: &Module) -> Result<ResolvedConfig, EngineError> {
        let mut state = BuildState::new();
        let requested_by = format!("module {}", module.path);
        let applied = self.apply(&mut state, &module.conventions, &requested_by)?;

        let manifest = &module.manifest;
        for (key, value) in &manifest.settings {
            state.set(key, value);
        }
        for (key, values) in &manifest.sets {
            state.add_to_set(key, values.iter().cloned());
        }
        for (name, task) in &manifest.tasks {
            state.merge_task(name, task);
        }

        let conflicts = std::mem::take(&mut state.conflicts);
        for conflict in &conflicts {
            tracing::warn!(module = %module.path, "convention conflict: {conflict}");
        }
        tracing::debug!(module = %module.path, conventions = ?applied, tasks = state.tasks.len(), "resolved module configuration");

        Ok(ResolvedConfig {
            module: module.path.clone(),
            applied,
            state,
            conflicts,
        })
    }
}

/// Expand every task carrying a `matrix` into one variant per list value.
///
/// For a task `test` with values `11,21` this yields `test-11` and `test-21`
/// (with `${matrix}` substituted in command, env, inputs and outputs), turns
/// `test` into a lifecycle task depending on both, and makes the matrix's
/// `attach_to` task depend on `test`. `lookup` supplies the property value.
pub fn expand_matrix<F>(tasks: &BTreeMap<String, TaskDecl>, lookup: F) -> BTreeMap<String, TaskDecl>
where
    F: Fn(&str) -> Option<String>,
{
    let mut expanded = BTreeMap::new();
    let mut attachments = Vec::new();

    for (name, task) in tasks {
        let Some(matrix) = &task.matrix else {
            merge_task_decl(expanded.entry(name.clone()).or_default(), task);
            continue;
        };

        let raw = lookup(&matrix.property).unwrap_or_else(|| matrix.default.clone());
        let mut variants = Vec::new();
        for value in split_list(&raw) {
            let substitute = |s: &String| interpolate(s, |k| (k == "matrix").then(|| value.clone()));
            let variant = TaskDecl {
                description: task.description.clone(),
                command: task.command.iter().map(substitute).collect(),
                env: task
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), substitute(v)))
                    .collect(),
                inputs: task.inputs.iter().map(substitute).collect(),
                input_properties: task.input_properties.clone(),
                outputs: task.outputs.iter().map(substitute).collect(),
                depends_on: task.depends_on.clone(),
                finalized_by: task.finalized_by.clone(),
                must_run_after: task.must_run_after.clone(),
                only_if: task.only_if.clone(),
                timeout_secs: task.timeout_secs,
                cacheable: task.cacheable,
                matrix: None,
            };
            let variant_name = format!("{name}-{value}");
            merge_task_decl(expanded.entry(variant_name.clone()).or_default(), &variant);
            variants.push(variant_name);
        }

        let lifecycle = expanded.entry(name.clone()).or_insert_with(TaskDecl::default);
        lifecycle.description.clone_from(&task.description);
        union_into(&mut lifecycle.depends_on, &variants);
        if let Some(target) = &matrix.attach_to {
            attachments.push((target.clone(), name.clone()));
        }
    }

    for (target, name) in attachments {
        let task: &mut TaskDecl = expanded.entry(target).or_default();
        union_into(&mut task.depends_on, std::slice::from_ref(&name));
    }
    expanded
}
