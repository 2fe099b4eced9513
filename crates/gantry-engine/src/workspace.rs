//! Workspace assembly: manifests, properties, modules, and conventions turned
//! into one task graph per invocation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gantry_config::manifest::{ReportDecl, ReportKind, TaskDecl, WorkspaceManifest, MANIFEST_FILE};
use gantry_config::properties::interpolate;
use gantry_config::{PropertySource, PropertyStore};

use crate::aggregate::{aggregate, Fragment};
use crate::convention::{expand_matrix, Convention, ConventionRegistry, ResolvedConfig};
use crate::error::EngineError;
use crate::fingerprint::STATE_DIR;
use crate::graph::TaskGraph;
use crate::module::{Module, ModuleGraph, ROOT_PATH};
use crate::publish::{sink_from_decl, Sink};
use crate::task::{Action, ActionError, CommandSpec, EdgeKind, Predicate, TaskId, TaskNode};

/// Name of the root lifecycle task depending on every aggregate report.
pub const REPORTS_TASK: &str = "reports";

/// Where a merged report is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub name: String,
    pub kind: ReportKind,
    pub task: TaskId,
    pub output: PathBuf,
}

/// A loaded workspace: every module with its resolved configuration.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    manifest: WorkspaceManifest,
    properties: Arc<PropertyStore>,
    modules: ModuleGraph,
    registry: ConventionRegistry,
    configs: BTreeMap<String, ResolvedConfig>,
}

impl Workspace {
    /// Load the workspace at `root` with properties from the process
    /// environment, the root manifest, and the command line.
    ///
    /// # Errors
    /// Returns an error if the root manifest is missing or invalid, discovery
    /// fails, or a convention cannot be registered or resolved.
    pub fn load(root: &Path, cli_properties: &[(String, String)]) -> Result<Self, EngineError> {
        Self::load_with_env(root, cli_properties, std::env::vars())
    }

    /// Like [`Workspace::load`], with an explicit environment.
    ///
    /// # Errors
    /// See [`Workspace::load`].
    pub fn load_with_env<I>(
        root: &Path,
        cli_properties: &[(String, String)],
        env: I,
    ) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(EngineError::MissingWorkspaceManifest {
                path: root.display().to_string(),
            });
        }
        let manifest = WorkspaceManifest::from_path(&manifest_path)?;

        let mut properties = PropertyStore::new();
        properties.load_env(env);
        for (key, value) in &manifest.properties {
            properties.set(PropertySource::Project, key, value);
        }
        for (key, value) in cli_properties {
            properties.set(PropertySource::CommandLine, key, value);
        }

        Self::with_registry(root, manifest, properties, ConventionRegistry::new())
    }

    /// Assemble a workspace from parts. Conventions declared in the manifest
    /// are added to `registry`, which may already hold closure conventions.
    ///
    /// # Errors
    /// Returns an error if discovery fails, a manifest convention clashes with
    /// a registered one, or a module's conventions cannot be resolved.
    pub fn with_registry(
        root: &Path,
        manifest: WorkspaceManifest,
        properties: PropertyStore,
        mut registry: ConventionRegistry,
    ) -> Result<Self, EngineError> {
        for (name, decl) in &manifest.conventions {
            registry.register(Convention::from_decl(name, decl))?;
        }

        let modules = ModuleGraph::discover_with(root, &manifest)?;
        let mut configs = BTreeMap::new();
        for module in modules.module_order() {
            configs.insert(module.path.clone(), registry.resolve(module)?);
        }

        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            properties: Arc::new(properties),
            modules,
            registry,
            configs,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> String {
        self.manifest.workspace.name.clone().unwrap_or_else(|| {
            self.root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }

    pub fn manifest(&self) -> &WorkspaceManifest {
        &self.manifest
    }

    pub fn properties(&self) -> &Arc<PropertyStore> {
        &self.properties
    }

    pub fn modules(&self) -> &ModuleGraph {
        &self.modules
    }

    pub fn registry(&self) -> &ConventionRegistry {
        &self.registry
    }

    pub fn config(&self, module: &str) -> Option<&ResolvedConfig> {
        self.configs.get(module)
    }

    /// Directory holding the fingerprint cache and default report outputs.
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// Every declared aggregate report with its output location.
    pub fn reports(&self) -> Vec<ReportEntry> {
        self.manifest
            .reports
            .iter()
            .map(|(name, decl)| ReportEntry {
                name: name.clone(),
                kind: decl.kind,
                task: TaskId::new(ROOT_PATH, &format!("aggregate-{name}")),
                output: self.report_output(name, decl),
            })
            .collect()
    }

    fn report_output(&self, name: &str, decl: &ReportDecl) -> PathBuf {
        match &decl.output {
            Some(output) => self.root.join(output),
            None => self.state_dir().join("reports").join(format!("{name}.json")),
        }
    }

    /// Build the task graph of every module plus the report and publish tasks.
    ///
    /// # Errors
    /// Returns an error for invalid task names, unknown edge targets, invalid
    /// `only_if` expressions, duplicate tasks, or unknown sinks.
    pub fn task_graph(&self) -> Result<TaskGraph, EngineError> {
        // Matrix expansion first, so edges can target variants.
        let mut declared: Vec<(&Module, BTreeMap<String, TaskDecl>)> = Vec::new();
        for module in self.modules.module_order() {
            let Some(config) = self.configs.get(&module.path) else {
                continue;
            };
            let tasks = expand_matrix(&config.state.tasks, |key| {
                self.properties.get(key).map(str::to_owned)
            });
            for name in tasks.keys() {
                if name.is_empty() || name.contains(':') || name.contains('^') {
                    return Err(EngineError::InvalidTaskName {
                        name: name.clone(),
                        module: module.path.clone(),
                    });
                }
            }
            declared.push((module, tasks));
        }

        let known: BTreeSet<TaskId> = declared
            .iter()
            .flat_map(|(module, tasks)| tasks.keys().map(|name| TaskId::new(&module.path, name)))
            .collect();

        let mut graph = TaskGraph::new();
        let mut edges: Vec<(TaskId, TaskId, EdgeKind)> = Vec::new();

        for (module, tasks) in &declared {
            let config = self.configs.get(&module.path);
            for (name, decl) in tasks {
                let id = TaskId::new(&module.path, name);
                let lookup = |key: &str| self.lookup(module, config, key);

                let mut node = TaskNode::new(id.clone(), self.action(decl, &lookup))
                    .with_work_dir(&module.dir);
                node.description.clone_from(&decl.description);
                node.inputs.files = decl.inputs.iter().map(|i| interpolate(i, lookup)).collect();
                for key in &decl.input_properties {
                    node.inputs
                        .values
                        .insert(key.clone(), lookup(key).unwrap_or_default());
                }
                node.outputs = decl
                    .outputs
                    .iter()
                    .map(|o| PathBuf::from(interpolate(o, lookup)))
                    .collect();
                if let Some(expr) = &decl.only_if {
                    node.only_if = Some(Predicate::parse(expr)?);
                }
                node.timeout = decl.timeout_secs.map(Duration::from_secs);
                node.cacheable = decl.cacheable.unwrap_or(true);

                for reference in &decl.depends_on {
                    for target in self.resolve_reference(module, &id, reference, &known)? {
                        if !node.inputs.tasks.contains(&target) {
                            node.inputs.tasks.push(target.clone());
                        }
                        edges.push((id.clone(), target, EdgeKind::DependsOn));
                    }
                }
                for reference in &decl.finalized_by {
                    for target in self.resolve_reference(module, &id, reference, &known)? {
                        edges.push((id.clone(), target, EdgeKind::FinalizedBy));
                    }
                }
                for reference in &decl.must_run_after {
                    for target in self.resolve_reference(module, &id, reference, &known)? {
                        edges.push((id.clone(), target, EdgeKind::MustRunAfter));
                    }
                }

                graph.add_task(node)?;
            }
        }

        for (from, to, kind) in &edges {
            graph.add_edge(from, to, *kind)?;
        }

        self.add_report_tasks(&mut graph, &declared)?;
        tracing::debug!(tasks = graph.len(), "assembled task graph");
        Ok(graph)
    }

    /// Resolve `${key}`: module builtins, then properties, then module settings.
    fn lookup(&self, module: &Module, config: Option<&ResolvedConfig>, key: &str) -> Option<String> {
        let builtin = match key {
            "root" => Some(self.root.display().to_string()),
            "module.path" => Some(module.path.clone()),
            "module.name" => Some(if module.is_root() {
                self.name()
            } else {
                module.path.rsplit(':').next().unwrap_or_default().to_owned()
            }),
            "module.dir" => Some(module.dir.display().to_string()),
            "module.output_dir" => Some(module.output_dir.display().to_string()),
            _ => None,
        };
        builtin
            .or_else(|| self.properties.get(key).map(str::to_owned))
            .or_else(|| config.and_then(|c| c.state.setting(key)).map(str::to_owned))
    }

    fn action<F>(&self, decl: &TaskDecl, lookup: &F) -> Action
    where
        F: Fn(&str) -> Option<String>,
    {
        if decl.command.is_empty() {
            return Action::Noop;
        }
        Action::Command(CommandSpec {
            argv: decl.command.iter().map(|a| interpolate(a, lookup)).collect(),
            env: decl
                .env
                .iter()
                .map(|(k, v)| (k.clone(), interpolate(v, lookup)))
                .collect(),
        })
    }

    /// Resolve an edge target: `name` (same module), `:path:name` (absolute),
    /// or `^name` (that task in every dependency module which declares it).
    fn resolve_reference(
        &self,
        module: &Module,
        from: &TaskId,
        reference: &str,
        known: &BTreeSet<TaskId>,
    ) -> Result<Vec<TaskId>, EngineError> {
        if let Some(name) = reference.strip_prefix('^') {
            return Ok(module
                .depends_on
                .iter()
                .map(|dep| TaskId::new(dep, name))
                .filter(|id| known.contains(id))
                .collect());
        }
        let target = if reference.starts_with(':') {
            TaskId::from(reference)
        } else {
            TaskId::new(&module.path, reference)
        };
        if known.contains(&target) {
            Ok(vec![target])
        } else {
            Err(EngineError::UnknownTask {
                name: target.to_string(),
                context: format!(" (referenced by {from})"),
            })
        }
    }

    fn add_report_tasks(
        &self,
        graph: &mut TaskGraph,
        declared: &[(&Module, BTreeMap<String, TaskDecl>)],
    ) -> Result<(), EngineError> {
        if self.manifest.reports.is_empty() {
            return Ok(());
        }

        let reports_id = TaskId::new(ROOT_PATH, REPORTS_TASK);
        if !graph.contains(&reports_id) {
            let mut node = TaskNode::new(reports_id.clone(), Action::Noop).with_work_dir(&self.root);
            node.description = Some("Aggregates every cross-module report".to_owned());
            graph.add_task(node)?;
        }

        for (name, decl) in &self.manifest.reports {
            let aggregate_id = TaskId::new(ROOT_PATH, &format!("aggregate-{name}"));
            let output = self.report_output(name, decl);

            let mut contributors = Vec::new();
            let mut sources = Vec::new();
            let mut input_files = Vec::new();
            for (module, tasks) in declared {
                if !tasks.contains_key(&decl.task) {
                    continue;
                }
                contributors.push(TaskId::new(&module.path, &decl.task));
                sources.push((module.path.clone(), module.dir.clone()));
                let rel = module.relative_dir(&self.root);
                for pattern in &decl.fragments {
                    input_files.push(rel.join(pattern).display().to_string());
                }
            }
            if contributors.is_empty() {
                tracing::warn!(report = %name, task = %decl.task, "no module declares the contributing task");
            }

            let kind = decl.kind;
            let patterns = decl.fragments.clone();
            let target = output.clone();
            let action = Action::func(&format!("aggregate {kind} {name}"), move |_ctx| {
                write_aggregate(kind, &sources, &patterns, &target).map_err(|e| ActionError::new(e.to_string()))
            });

            let mut node = TaskNode::new(aggregate_id.clone(), action).with_work_dir(&self.root);
            node.description = Some(format!("Aggregates {kind} fragments of `{}`", decl.task));
            node.inputs.files = input_files;
            node.inputs.tasks.clone_from(&contributors);
            node.outputs = vec![output.strip_prefix(&self.root).unwrap_or(&output).to_path_buf()];
            graph.add_task(node)?;
            for contributor in &contributors {
                graph.add_edge(&aggregate_id, contributor, EdgeKind::DependsOn)?;
            }
            graph.add_edge(&reports_id, &aggregate_id, EdgeKind::DependsOn)?;

            if !decl.publish.is_empty() {
                self.add_publish_task(graph, name, decl, &aggregate_id, output)?;
            }
        }
        Ok(())
    }

    fn add_publish_task(
        &self,
        graph: &mut TaskGraph,
        name: &str,
        decl: &ReportDecl,
        aggregate_id: &TaskId,
        artifact: PathBuf,
    ) -> Result<(), EngineError> {
        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
        for sink_name in &decl.publish {
            let Some(sink) = self.manifest.sinks.get(sink_name) else {
                return Err(EngineError::UnknownSink {
                    report: name.to_owned(),
                    sink: sink_name.clone(),
                });
            };
            sinks.push(sink_from_decl(sink_name, sink, &self.root));
        }

        let publish_id = TaskId::new(ROOT_PATH, &format!("publish-{name}"));
        let action = Action::func(&format!("publish {name}"), move |ctx| {
            for sink in &sinks {
                sink.publish(&artifact, &ctx.properties)
                    .map_err(|e| ActionError::new(e.to_string()))?;
            }
            Ok(())
        });
        let mut node = TaskNode::new(publish_id.clone(), action)
            .with_work_dir(&self.root)
            .never_up_to_date();
        node.description = Some(format!("Publishes the `{name}` report to {}", decl.publish.join(", ")));
        graph.add_task(node)?;
        graph.add_edge(&publish_id, aggregate_id, EdgeKind::DependsOn)
    }

    /// Map requested names to task ids: `:path:name` selects one task, a bare
    /// name selects that task in every module declaring it.
    ///
    /// # Errors
    /// Returns `EngineError::UnknownTask` if a name matches nothing.
    pub fn select(&self, graph: &TaskGraph, names: &[String]) -> Result<Vec<TaskId>, EngineError> {
        let mut selected: Vec<TaskId> = Vec::new();
        for name in names {
            let matches: Vec<TaskId> = if name.starts_with(':') {
                let id = TaskId::from(name.as_str());
                if graph.contains(&id) {
                    vec![id]
                } else {
                    Vec::new()
                }
            } else {
                graph
                    .nodes()
                    .filter(|n| n.id.name() == name)
                    .map(|n| n.id.clone())
                    .collect()
            };
            if matches.is_empty() {
                return Err(EngineError::UnknownTask {
                    name: name.clone(),
                    context: " in any module".to_owned(),
                });
            }
            for id in matches {
                if !selected.contains(&id) {
                    selected.push(id);
                }
            }
        }
        Ok(selected)
    }
}

/// Collect the fragments of every contributing module and write the merged report.
fn write_aggregate(
    kind: ReportKind,
    sources: &[(String, PathBuf)],
    patterns: &[String],
    target: &Path,
) -> Result<(), EngineError> {
    let mut fragments = Vec::new();
    for (module, dir) in sources {
        let files = gantry_util::hash::expand_patterns(dir, patterns)?;
        fragments.extend(files.iter().map(|f| Fragment::new(module, f)));
    }
    aggregate(kind, &fragments)?.write(target)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fingerprint::FingerprintStore;
    use crate::schedule::{execute, ExecuteOptions};
    use crate::task::{SkipReason, TaskState};
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    const ROOT_MANIFEST: &str = r#"
[workspace]
name = "deezpatch"

[properties]
additionalJvms = "11"

[conventions.java]
plugins = ["java-library"]
settings = { "java.release" = "17" }

[conventions.java.tasks.compile]
command = ["javac", "--release", "${java.release}", "-d", "${module.output_dir}/classes"]
inputs = ["src/main/java"]
input_properties = ["java.release"]
outputs = ["build/classes"]

[conventions.testing]
includes = ["java"]

[conventions.testing.tasks.test]
depends_on = ["compile", "^compile"]
finalized_by = ["jacocoReport"]

[conventions.testing.tasks.jacocoReport]

[conventions.testing.tasks.integrationTest]
only_if = "!skipIntegrationTests"
must_run_after = ["test"]

[conventions.testing.tasks.check]
depends_on = ["test", "integrationTest"]

[reports.tests]
kind = "test"
task = "test"
fragments = ["build/test-results/*.xml"]
publish = ["archive"]

[sinks.archive]
type = "directory"
path = "dist"
"#;

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write(root, MANIFEST_FILE, ROOT_MANIFEST);
        for module in ["core", "kafka", "events"] {
            write(
                root,
                &format!("{module}/gantry.toml"),
                "[module]\nconventions = [\"testing\"]\n",
            );
            write(root, &format!("{module}/src/main/java/A.java"), "class A {}");
            write(
                root,
                &format!("{module}/build/test-results/TEST-{module}.xml"),
                &format!(
                    r#"<testsuite name="{module}"><testcase name="works" classname="{module}.A" time="0.1"/></testsuite>"#
                ),
            );
        }
        write(
            root,
            "kafka/gantry.toml",
            "[module]\nconventions = [\"testing\"]\ndepends_on = [\":core\"]\n\n[settings]\n\"java.release\" = \"21\"\n",
        );
        tmp
    }

    fn load(root: &Path, cli: &[(&str, &str)]) -> Workspace {
        let cli: Vec<(String, String)> = cli
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Workspace::load_with_env(root, &cli, Vec::new()).unwrap()
    }

    fn node<'g>(graph: &'g TaskGraph, id: &str) -> &'g TaskNode {
        graph.get(&TaskId::from(id)).unwrap()
    }

    #[test]
    fn property_layers_are_applied() {
        let tmp = fixture();
        let ws = Workspace::load_with_env(
            tmp.path(),
            &[("additionalJvms".to_owned(), "17,21".to_owned())],
            vec![
                ("GANTRY_PROP_additionalJvms".to_owned(), "8".to_owned()),
                ("GANTRY_PROP_profile".to_owned(), "ci".to_owned()),
            ],
        )
        .unwrap();
        assert_eq!(ws.properties().get("additionalJvms"), Some("17,21"));
        assert_eq!(ws.properties().get("profile"), Some("ci"));
        assert_eq!(ws.name(), "deezpatch");
    }

    #[test]
    fn conventions_materialize_tasks_per_module() {
        let tmp = fixture();
        let ws = load(tmp.path(), &[]);
        let graph = ws.task_graph().unwrap();

        let compile = node(&graph, ":core:compile");
        match &compile.action {
            Action::Command(spec) => {
                assert_eq!(spec.argv[2], "17");
                assert!(spec.argv[4].ends_with("classes"));
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(compile.inputs.values.get("java.release").map(String::as_str), Some("17"));

        // Module overlay wins.
        let kafka = node(&graph, ":kafka:compile");
        assert_eq!(kafka.inputs.values.get("java.release").map(String::as_str), Some("21"));

        assert!(matches!(node(&graph, ":core:check").action, Action::Noop));
        assert!(ws.config(":core").unwrap().state.plugins().contains(&"java-library"));
    }

    #[test]
    fn dependency_references_resolve() {
        let tmp = fixture();
        let ws = load(tmp.path(), &[]);
        let graph = ws.task_graph().unwrap();

        let deps = graph.targets(&TaskId::from(":kafka:test"), EdgeKind::DependsOn);
        let deps: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
        assert_eq!(deps, vec![":core:compile", ":kafka:compile"]);
        assert_eq!(
            node(&graph, ":kafka:test").inputs.tasks,
            vec![TaskId::from(":kafka:compile"), TaskId::from(":core:compile")]
        );

        let finalizers = graph.targets(&TaskId::from(":core:test"), EdgeKind::FinalizedBy);
        assert_eq!(finalizers, vec![&TaskId::from(":core:jacocoReport")]);
    }

    #[test]
    fn bare_names_select_every_module() {
        let tmp = fixture();
        let ws = load(tmp.path(), &[]);
        let graph = ws.task_graph().unwrap();

        let selected = ws.select(&graph, &["test".to_owned()]).unwrap();
        assert_eq!(selected.len(), 3);
        let one = ws.select(&graph, &[":core:test".to_owned()]).unwrap();
        assert_eq!(one, vec![TaskId::from(":core:test")]);
        assert!(matches!(
            ws.select(&graph, &["deploy".to_owned()]),
            Err(EngineError::UnknownTask { .. })
        ));
    }

    #[test]
    fn unknown_reference_is_reported() {
        let tmp = fixture();
        write(
            tmp.path(),
            "events/gantry.toml",
            "[module]\nconventions = [\"testing\"]\n\n[tasks.test]\ndepends_on = [\"generate\"]\n",
        );
        let ws = load(tmp.path(), &[]);
        match ws.task_graph() {
            Err(EngineError::UnknownTask { name, context }) => {
                assert_eq!(name, ":events:generate");
                assert!(context.contains(":events:test"));
            }
            other => panic!("expected unknown task, got {other:?}"),
        }
    }

    #[test]
    fn unknown_sink_is_reported() {
        let tmp = fixture();
        let manifest = ROOT_MANIFEST.replace("publish = [\"archive\"]", "publish = [\"coveralls\"]");
        write(tmp.path(), MANIFEST_FILE, &manifest);
        let ws = load(tmp.path(), &[]);
        assert!(matches!(ws.task_graph(), Err(EngineError::UnknownSink { .. })));
    }

    #[test]
    fn aggregate_lists_three_sources_and_publishes() {
        let tmp = fixture();
        let ws = load(tmp.path(), &[]);
        let graph = ws.task_graph().unwrap();

        let aggregate_id = TaskId::from(":aggregate-tests");
        let contributors = graph.targets(&aggregate_id, EdgeKind::DependsOn);
        assert_eq!(contributors.len(), 3);

        // Publishing only: the contributing test tasks are lifecycle tasks here,
        // so compile commands are not part of this plan.
        let mut only_reports = TaskGraph::new();
        for id in [":aggregate-tests", ":publish-tests"] {
            only_reports
                .add_task(graph.get(&TaskId::from(id)).unwrap().clone())
                .unwrap();
        }
        only_reports
            .add_edge(&TaskId::from(":publish-tests"), &aggregate_id, EdgeKind::DependsOn)
            .unwrap();
        let plan = only_reports.plan(&[TaskId::from(":publish-tests")]).unwrap();
        let opts = ExecuteOptions {
            parallelism: 2,
            properties: Arc::clone(ws.properties()),
            ..ExecuteOptions::default()
        };
        let summary = execute(&plan, &FingerprintStore::in_memory(), &opts).unwrap();
        assert!(summary.is_success(), "{summary:?}");

        let report = ws.reports().into_iter().next().unwrap();
        assert_eq!(report.output, tmp.path().join(".gantry/reports/tests.json"));
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&report.output).unwrap()).unwrap();
        assert_eq!(json["sources"].as_array().unwrap().len(), 3);
        assert_eq!(json["totals"]["tests"], 3);
        assert!(tmp.path().join("dist/tests.json").exists());
    }

    #[test]
    fn only_if_reads_command_line_properties() {
        let tmp = fixture();
        let ws = load(tmp.path(), &[("skipIntegrationTests", "true")]);
        let graph = ws.task_graph().unwrap();

        let mut g = TaskGraph::new();
        g.add_task(graph.get(&TaskId::from(":core:integrationTest")).unwrap().clone())
            .unwrap();
        let plan = g.plan(&[TaskId::from(":core:integrationTest")]).unwrap();
        let opts = ExecuteOptions {
            properties: Arc::clone(ws.properties()),
            ..ExecuteOptions::default()
        };
        let summary = execute(&plan, &FingerprintStore::in_memory(), &opts).unwrap();
        assert_eq!(
            summary.state(&TaskId::from(":core:integrationTest")),
            Some(&TaskState::Skipped(SkipReason::OnlyIf))
        );
    }

    #[test]
    fn matrix_variants_follow_property() {
        let tmp = fixture();
        write(
            tmp.path(),
            "core/gantry.toml",
            r#"
[module]
conventions = ["testing"]

[tasks.test.matrix]
property = "additionalJvms"
default = "17"
attach_to = "check"
"#,
        );
        let ws = load(tmp.path(), &[("additionalJvms", "11,21")]);
        let graph = ws.task_graph().unwrap();
        assert!(graph.contains(&TaskId::from(":core:test-11")));
        assert!(graph.contains(&TaskId::from(":core:test-21")));
        let lifecycle = graph.targets(&TaskId::from(":core:test"), EdgeKind::DependsOn);
        assert_eq!(lifecycle.len(), 2);
    }

    #[test]
    fn invalid_only_if_is_a_configuration_error() {
        let tmp = fixture();
        write(
            tmp.path(),
            "core/gantry.toml",
            "[module]\nconventions = [\"testing\"]\n\n[tasks.integrationTest]\nonly_if = \"a && \"\n",
        );
        let ws = load(tmp.path(), &[]);
        assert!(matches!(ws.task_graph(), Err(EngineError::InvalidPredicate { .. })));
    }

    #[test]
    fn unknown_convention_fails_loading() {
        let tmp = fixture();
        write(tmp.path(), "core/gantry.toml", "[module]\nconventions = [\"kotlin\"]\n");
        let result = Workspace::load_with_env(tmp.path(), &[], Vec::new());
        assert!(matches!(result, Err(EngineError::UnknownConvention { .. })));
    }

    #[test]
    fn closure_conventions_can_be_registered() {
        let tmp = fixture();
        let manifest = WorkspaceManifest::from_path(&tmp.path().join(MANIFEST_FILE)).unwrap();
        let mut registry = ConventionRegistry::new();
        registry
            .register(Convention::new("eclipse").mutation("eclipse task", |state| {
                state.task_mut("eclipse").description = Some("IDE files".to_owned());
            }))
            .unwrap();
        let ws = Workspace::with_registry(tmp.path(), manifest, PropertyStore::new(), registry).unwrap();
        assert!(ws.registry().get("eclipse").is_some());
        assert!(ws.registry().get("testing").is_some());
    }

    #[test]
    fn malformed_fragment_fails_aggregation() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "core/build/test-results/TEST-a.xml", "<testsuite><testcase");
        let sources = vec![(":core".to_owned(), tmp.path().join("core"))];
        let target = tmp.path().join("tests.json");
        let result = write_aggregate(ReportKind::Test, &sources, &["build/test-results/*.xml".to_owned()], &target);
        assert!(matches!(result, Err(EngineError::Aggregation(_))));
        assert!(!target.exists());
    }
}
