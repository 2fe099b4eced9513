#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::error::Error;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gantry_config::properties::parse_property_pair;
use gantry_engine::diagnostics::{print_plan, print_summary};
use gantry_engine::fingerprint::STATE_DIR;
use gantry_engine::schedule::default_parallelism;
use gantry_engine::{
    execute, CancelToken, ConventionRegistry, ExecuteOptions, FingerprintStore, ModuleGraph, TaskGraph, TaskNode,
    Workspace,
};
use tracing_subscriber::EnvFilter;

/// Exit code when at least one task failed.
const EXIT_TASK_FAILED: i32 = 1;
/// Exit code for planning and configuration errors.
const EXIT_CONFIG_ERROR: i32 = 2;

type CliResult<T = ()> = Result<T, Box<dyn Error>>;

#[derive(Debug, Parser)]
#[command(name = "gantry", about = "Convention-driven build orchestration for multi-module workspaces")]
#[command(version)]
struct Cli {
    /// Workspace root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run tasks and everything they depend on
    Run {
        /// Task names (`test`) or qualified ids (`:core:test`)
        #[arg(required = true)]
        tasks: Vec<String>,
        /// Maximum number of tasks running at once (defaults to the CPU count)
        #[arg(long, short = 'j')]
        parallelism: Option<NonZeroUsize>,
        /// Set a property, overriding the environment and gantry.toml
        #[arg(long = "property", short = 'P', value_name = "KEY=VALUE")]
        properties: Vec<String>,
        /// Print the execution plan without running anything
        #[arg(long)]
        dry_run: bool,
        /// Stop scheduling new tasks after the first failure
        #[arg(long)]
        fail_fast: bool,
    },
    /// List the tasks of every module
    Tasks,
    /// Print the module tree
    Modules,
    /// Remove fingerprints and aggregate reports
    Clean,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let root = match workspace_root(cli.root) {
        Ok(root) => root,
        Err(msg) => {
            eprintln!("error: {msg}");
            process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let result = match cli.command {
        Command::Run {
            tasks,
            parallelism,
            properties,
            dry_run,
            fail_fast,
        } => cmd_run(&root, &tasks, parallelism, &properties, dry_run, fail_fast),
        Command::Tasks => cmd_tasks(&root).map(|()| 0),
        Command::Modules => cmd_modules(&root).map(|()| 0),
        Command::Clean => cmd_clean(&root).map(|()| 0),
    };

    match result {
        Ok(0) => {}
        Ok(code) => process::exit(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            process::exit(EXIT_CONFIG_ERROR);
        }
    }
}

/// Install the stderr subscriber. `GANTRY_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("GANTRY_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn workspace_root(root: Option<PathBuf>) -> CliResult<PathBuf> {
    match root {
        Some(root) => Ok(root),
        None => Ok(std::env::current_dir()?),
    }
}

fn cmd_run(
    root: &Path,
    tasks: &[String],
    parallelism: Option<NonZeroUsize>,
    properties: &[String],
    dry_run: bool,
    fail_fast: bool,
) -> CliResult<i32> {
    let cli_properties = properties
        .iter()
        .map(|pair| parse_property_pair(pair))
        .collect::<Result<Vec<_>, _>>()?;

    let workspace = Workspace::load(root, &cli_properties)?;
    let graph = workspace.task_graph()?;
    let requested = workspace.select(&graph, tasks)?;
    let plan = graph.plan(&requested)?;
    tracing::debug!(requested = requested.len(), planned = plan.len(), "planned invocation");

    if dry_run {
        print_plan(&plan);
        return Ok(0);
    }

    let store = FingerprintStore::load(workspace.root())?;
    let options = ExecuteOptions {
        parallelism: parallelism.map_or_else(default_parallelism, NonZeroUsize::get),
        cancel: CancelToken::new(),
        properties: Arc::clone(workspace.properties()),
        fail_fast,
    };
    let summary = execute(&plan, &store, &options)?;
    print_summary(&summary, &workspace.reports());

    if summary.is_success() {
        Ok(0)
    } else {
        Ok(EXIT_TASK_FAILED)
    }
}

fn cmd_tasks(root: &Path) -> CliResult {
    let workspace = Workspace::load(root, &[])?;
    let graph = workspace.task_graph()?;
    for line in task_lines(&graph) {
        println!("{line}");
    }
    Ok(())
}

/// Every task grouped under its module, modules in path order.
fn task_lines(graph: &TaskGraph) -> Vec<String> {
    let mut by_module: BTreeMap<&str, Vec<&TaskNode>> = BTreeMap::new();
    for node in graph.nodes() {
        by_module.entry(node.id.module_path()).or_default().push(node);
    }

    let mut lines = Vec::new();
    for (module, nodes) in by_module {
        lines.push(module.to_owned());
        for node in nodes {
            match &node.description {
                Some(description) => lines.push(format!("  {:<24} {description}", node.id.name())),
                None => lines.push(format!("  {}", node.id.name())),
            }
        }
    }
    lines
}

fn cmd_modules(root: &Path) -> CliResult {
    let workspace = Workspace::load(root, &[])?;
    for line in module_tree(workspace.modules()) {
        println!("{line}");
    }
    println!("{}", convention_line(workspace.registry()));
    Ok(())
}

fn convention_line(registry: &ConventionRegistry) -> String {
    let names: Vec<&str> = registry.names().collect();
    format!("conventions: {}", names.join(", "))
}

/// Render the module hierarchy, one module per line, children indented.
fn module_tree(modules: &ModuleGraph) -> Vec<String> {
    fn visit(modules: &ModuleGraph, path: &str, depth: usize, lines: &mut Vec<String>) {
        let Some(module) = modules.get(path) else {
            return;
        };
        let mut line = format!("{}{}", "  ".repeat(depth), module.path);
        if !module.conventions.is_empty() {
            line.push_str(&format!(" [{}]", module.conventions.join(", ")));
        }
        if !module.depends_on.is_empty() {
            line.push_str(&format!(" -> {}", module.depends_on.join(", ")));
        }
        lines.push(line);
        for child in &module.children {
            visit(modules, child, depth + 1, lines);
        }
    }

    let mut lines = Vec::new();
    if let Some(root) = modules.root_module() {
        visit(modules, &root.path, 0, &mut lines);
    }
    lines
}

fn cmd_clean(root: &Path) -> CliResult {
    gantry_util::fs::remove_dir_all_if_exists(&root.join(STATE_DIR))?;
    eprintln!("    Cleaned {STATE_DIR}");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use clap::CommandFactory;
    use std::fs;

    fn workspace() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(
            root.join("gantry.toml"),
            "[workspace]\nname = \"demo\"\n\n[conventions.lib.tasks.check]\ndescription = \"Runs all checks\"\n",
        )
        .unwrap();
        for module in ["core", "app"] {
            fs::create_dir_all(root.join(module).join("src")).unwrap();
            fs::write(root.join(module).join("gantry.toml"), "[module]\nconventions = [\"lib\"]\n").unwrap();
        }
        fs::write(
            root.join("app/gantry.toml"),
            "[module]\nconventions = [\"lib\"]\ndepends_on = [\"core\"]\n",
        )
        .unwrap();
        tmp
    }

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_run_with_options() {
        let cli = Cli::try_parse_from([
            "gantry",
            "run",
            "test",
            ":core:check",
            "--parallelism",
            "4",
            "-P",
            "profile=ci",
            "--property",
            "additionalJvms=11,17",
            "--fail-fast",
            "--verbose",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Run {
                tasks,
                parallelism,
                properties,
                dry_run,
                fail_fast,
            } => {
                assert_eq!(tasks, vec!["test", ":core:check"]);
                assert_eq!(parallelism.map(NonZeroUsize::get), Some(4));
                assert_eq!(properties, vec!["profile=ci", "additionalJvms=11,17"]);
                assert!(!dry_run);
                assert!(fail_fast);
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn parse_run_requires_a_task() {
        let err = Cli::try_parse_from(["gantry", "run"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parse_run_rejects_zero_parallelism() {
        assert!(Cli::try_parse_from(["gantry", "run", "test", "--parallelism", "0"]).is_err());
    }

    #[test]
    fn parse_other_subcommands() {
        for (arg, expected) in [("tasks", "Tasks"), ("modules", "Modules"), ("clean", "Clean")] {
            let cli = Cli::try_parse_from(["gantry", arg]).unwrap();
            assert_eq!(format!("{:?}", cli.command), expected);
        }
        let cli = Cli::try_parse_from(["gantry", "modules", "--root", "/tmp/ws"]).unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/ws")));
    }

    #[test]
    fn run_lifecycle_tasks_succeeds() {
        let tmp = workspace();
        let code = cmd_run(tmp.path(), &["check".to_owned()], None, &[], false, false).unwrap();
        assert_eq!(code, 0);
        assert!(tmp.path().join(STATE_DIR).join("fingerprints.toml").exists());
    }

    #[test]
    fn dry_run_writes_nothing() {
        let tmp = workspace();
        let code = cmd_run(tmp.path(), &["check".to_owned()], None, &[], true, false).unwrap();
        assert_eq!(code, 0);
        assert!(!tmp.path().join(STATE_DIR).exists());
    }

    #[test]
    fn unknown_task_is_a_planning_error() {
        let tmp = workspace();
        assert!(cmd_run(tmp.path(), &["deploy".to_owned()], None, &[], false, false).is_err());
    }

    #[test]
    fn malformed_property_is_rejected() {
        let tmp = workspace();
        let result = cmd_run(tmp.path(), &["check".to_owned()], None, &["novalue".to_owned()], false, false);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn failing_task_exits_with_one() {
        let tmp = workspace();
        fs::write(
            tmp.path().join("core/gantry.toml"),
            "[module]\nconventions = [\"lib\"]\n\n[tasks.check]\ncommand = [\"sh\", \"-c\", \"exit 3\"]\n",
        )
        .unwrap();
        let code = cmd_run(tmp.path(), &[":core:check".to_owned()], Some(NonZeroUsize::MIN), &[], false, false).unwrap();
        assert_eq!(code, EXIT_TASK_FAILED);
    }

    #[test]
    fn module_tree_nests_children() {
        let tmp = workspace();
        let workspace = Workspace::load(tmp.path(), &[]).unwrap();
        let lines = module_tree(workspace.modules());
        assert_eq!(lines, vec![":", "  :app [lib] -> :core", "  :core [lib]"]);
    }

    #[test]
    fn tasks_are_listed_once_per_module() {
        let tmp = workspace();
        fs::write(
            tmp.path().join("gantry.toml"),
            "[workspace]\nname = \"demo\"\n\n[conventions.lib.tasks.check]\n\n[reports.tests]\nkind = \"test\"\ntask = \"check\"\nfragments = [\"build/*.xml\"]\n",
        )
        .unwrap();
        let workspace = Workspace::load(tmp.path(), &[]).unwrap();
        let lines = task_lines(&workspace.task_graph().unwrap());
        let headers: Vec<&str> = lines.iter().map(String::as_str).filter(|l| !l.starts_with(' ')).collect();
        assert_eq!(headers, vec![":", ":app", ":core"]);
        let root_tasks: Vec<&str> = lines
            .iter()
            .skip(1)
            .take_while(|l| l.starts_with(' '))
            .map(|l| l.trim())
            .collect();
        assert!(root_tasks.iter().any(|t| t.starts_with("aggregate-tests")));
        assert!(root_tasks.iter().any(|t| t.starts_with("reports")));
    }

    #[test]
    fn convention_line_lists_registered_conventions() {
        let tmp = workspace();
        let workspace = Workspace::load(tmp.path(), &[]).unwrap();
        assert_eq!(convention_line(workspace.registry()), "conventions: lib");
    }

    #[test]
    fn clean_removes_state_dir() {
        let tmp = workspace();
        fs::create_dir_all(tmp.path().join(STATE_DIR).join("reports")).unwrap();
        cmd_clean(tmp.path()).unwrap();
        assert!(!tmp.path().join(STATE_DIR).exists());
        cmd_clean(tmp.path()).unwrap();
    }
}
