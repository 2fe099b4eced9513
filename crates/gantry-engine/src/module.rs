//! Module discovery and the module dependency graph.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use gantry_config::manifest::{ModuleManifest, WorkspaceManifest, MANIFEST_FILE};

use crate::error::EngineError;

/// Path of the root module.
pub const ROOT_PATH: &str = ":";

/// Marker directory that makes a directory a source module.
const SOURCE_DIR: &str = "src";

/// Default output directory, relative to the module directory.
const DEFAULT_OUTPUT_DIR: &str = "build";

/// Directory names never descended into.
const SKIPPED_DIRS: &[&str] = &["build", "target", SOURCE_DIR];

/// A discovered build unit.
#[derive(Debug, Clone)]
pub struct Module {
    /// Gradle-style path (`:`, `:core`, `:libs:util`).
    pub path: String,
    /// Absolute module directory.
    pub dir: PathBuf,
    /// Path of the nearest ancestor module; `None` only for the root.
    pub parent: Option<String>,
    pub children: Vec<String>,
    /// Declared conventions in application order, without duplicates.
    pub conventions: Vec<String>,
    /// Paths of modules this module depends on.
    pub depends_on: Vec<String>,
    /// Absolute output directory.
    pub output_dir: PathBuf,
    pub manifest: ModuleManifest,
    /// Whether the module has a `src/` directory.
    pub has_sources: bool,
}

impl Module {
    fn new(path: String, dir: PathBuf, manifest: ModuleManifest) -> Self {
        let mut conventions: Vec<String> = Vec::new();
        for name in &manifest.module.conventions {
            if !conventions.contains(name) {
                conventions.push(name.clone());
            }
        }
        let depends_on = manifest
            .module
            .depends_on
            .iter()
            .map(|dep| normalize_path(dep))
            .collect();
        let output_dir = dir.join(
            manifest
                .module
                .output_dir
                .as_deref()
                .unwrap_or(DEFAULT_OUTPUT_DIR),
        );
        let has_sources = dir.join(SOURCE_DIR).is_dir();
        Self {
            path,
            dir,
            parent: None,
            children: Vec::new(),
            conventions,
            depends_on,
            output_dir,
            manifest,
            has_sources,
        }
    }

    pub fn is_root(&self) -> bool {
        self.path == ROOT_PATH
    }

    /// Number of path segments (`0` for the root).
    pub fn depth(&self) -> usize {
        self.path.split(':').filter(|s| !s.is_empty()).count()
    }

    /// Module directory relative to `root`, `.` for the root module.
    pub fn relative_dir(&self, root: &Path) -> PathBuf {
        match self.dir.strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("."),
            Ok(rel) => rel.to_path_buf(),
            Err(_) => self.dir.clone(),
        }
    }
}

/// All modules of a workspace, keyed by path.
#[derive(Debug, Clone)]
pub struct ModuleGraph {
    root: PathBuf,
    modules: BTreeMap<String, Module>,
}

impl ModuleGraph {
    /// Discover the modules under `root`, whose `gantry.toml` must exist.
    ///
    /// # Errors
    /// Returns an error if the root manifest is missing or invalid, or for any
    /// error listed on [`ModuleGraph::discover_with`].
    pub fn discover(root: &Path) -> Result<Self, EngineError> {
        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(EngineError::MissingWorkspaceManifest {
                path: root.display().to_string(),
            });
        }
        let manifest = WorkspaceManifest::from_path(&manifest_path)?;
        Self::discover_with(root, &manifest)
    }

    /// Discover the modules under `root` using an already parsed root manifest.
    ///
    /// # Algorithm
    /// 1. The root directory is always the module `:`.
    /// 2. Walk the tree (skipping hidden, `build`, `target`, `src` and excluded
    ///    directories); a directory with a `gantry.toml` or `src/` is a module.
    /// 3. Link every module to its nearest ancestor module.
    /// 4. Validate the module dependency graph.
    ///
    /// # Errors
    /// Returns `EngineError::Discovery` if no module has sources, a manifest
    /// error for an invalid module manifest, and `UnknownModule`/`ModuleCycle`
    /// for a broken dependency graph.
    pub fn discover_with(root: &Path, manifest: &WorkspaceManifest) -> Result<Self, EngineError> {
        let mut modules = BTreeMap::new();
        modules.insert(
            ROOT_PATH.to_owned(),
            Module::new(
                ROOT_PATH.to_owned(),
                root.to_path_buf(),
                manifest.root_module(),
            ),
        );

        let excluded: Vec<PathBuf> = manifest
            .workspace
            .exclude
            .iter()
            .map(|e| root.join(e))
            .collect();
        scan(root, root, &excluded, &mut modules)?;

        if !modules.values().any(|m| m.has_sources) {
            return Err(EngineError::Discovery {
                root: root.display().to_string(),
            });
        }

        link_parents(&mut modules);

        let graph = Self {
            root: root.to_path_buf(),
            modules,
        };
        graph.dependency_order()?;
        tracing::debug!(root = %root.display(), modules = graph.modules.len(), "discovered modules");
        Ok(graph)
    }

    /// The workspace root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<&Module> {
        self.modules.get(path)
    }

    pub fn root_module(&self) -> Option<&Module> {
        self.modules.get(ROOT_PATH)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules breadth-first: by depth, then lexicographically by path.
    pub fn module_order(&self) -> Vec<&Module> {
        let mut order: Vec<&Module> = self.modules.values().collect();
        order.sort_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.path.cmp(&b.path)));
        order
    }

    /// Modules ordered so that every module comes after the modules it depends on.
    ///
    /// # Algorithm
    /// DFS with three-color marking (white→gray→black) in `module_order`;
    /// post-order gives leaves first, a gray hit is a cycle.
    ///
    /// # Errors
    /// Returns `EngineError::UnknownModule` for a dependency on a missing module
    /// and `EngineError::ModuleCycle` with the offending path sequence.
    pub fn dependency_order(&self) -> Result<Vec<&Module>, EngineError> {
        let mut color: HashMap<&str, u8> = HashMap::new();
        let mut topo = Vec::new();
        for module in self.module_order() {
            let mut stack = Vec::new();
            self.dfs(module, &mut color, &mut topo, &mut stack)?;
        }
        Ok(topo)
    }

    fn dfs<'a>(
        &'a self,
        module: &'a Module,
        color: &mut HashMap<&'a str, u8>,
        topo: &mut Vec<&'a Module>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), EngineError> {
        match color.get(module.path.as_str()).copied().unwrap_or(0) {
            2 => return Ok(()),
            1 => {
                stack.push(&module.path);
                let start = stack
                    .iter()
                    .position(|p| *p == module.path)
                    .unwrap_or(0);
                let cycle = stack.get(start..).unwrap_or(stack.as_slice()).join(" -> ");
                return Err(EngineError::ModuleCycle { cycle });
            }
            _ => {}
        }

        color.insert(&module.path, 1);
        stack.push(&module.path);
        for dep in &module.depends_on {
            let Some(target) = self.modules.get(dep) else {
                return Err(EngineError::UnknownModule {
                    module: module.path.clone(),
                    dependency: dep.clone(),
                });
            };
            self.dfs(target, color, topo, stack)?;
        }
        stack.pop();
        color.insert(&module.path, 2);
        topo.push(module);
        Ok(())
    }
}

/// Module path for `dir` relative to `root`.
fn module_path(root: &Path, dir: &Path) -> String {
    let Ok(rel) = dir.strip_prefix(root) else {
        return ROOT_PATH.to_owned();
    };
    let segments: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if segments.is_empty() {
        ROOT_PATH.to_owned()
    } else {
        format!(":{}", segments.join(":"))
    }
}

/// Accept `core` as shorthand for `:core`.
fn normalize_path(path: &str) -> String {
    if path.starts_with(':') {
        path.to_owned()
    } else {
        format!(":{path}")
    }
}

fn scan(
    root: &Path,
    dir: &Path,
    excluded: &[PathBuf],
    modules: &mut BTreeMap<String, Module>,
) -> Result<(), EngineError> {
    let entries = std::fs::read_dir(dir).map_err(|source| EngineError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut subdirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| EngineError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
            continue;
        }
        if excluded.iter().any(|e| e == &path) {
            continue;
        }
        subdirs.push(path);
    }
    subdirs.sort();

    for sub in subdirs {
        let manifest_path = sub.join(MANIFEST_FILE);
        let is_module = manifest_path.is_file() || sub.join(SOURCE_DIR).is_dir();
        if is_module {
            let manifest = if manifest_path.is_file() {
                ModuleManifest::from_path(&manifest_path)?
            } else {
                ModuleManifest::default()
            };
            let path = module_path(root, &sub);
            modules.insert(path.clone(), Module::new(path, sub.clone(), manifest));
        }
        scan(root, &sub, excluded, modules)?;
    }
    Ok(())
}

/// Set each module's parent to its nearest ancestor module.
fn link_parents(modules: &mut BTreeMap<String, Module>) {
    let paths: Vec<String> = modules.keys().cloned().collect();
    let mut links = Vec::new();
    for path in &paths {
        if path == ROOT_PATH {
            continue;
        }
        let mut candidate = path.as_str();
        let parent = loop {
            match candidate.rfind(':') {
                Some(0) | None => break ROOT_PATH.to_owned(),
                Some(idx) => {
                    candidate = candidate.get(..idx).unwrap_or(ROOT_PATH);
                    if modules.contains_key(candidate) {
                        break candidate.to_owned();
                    }
                }
            }
        };
        links.push((path.clone(), parent));
    }

    for (child, parent) in links {
        if let Some(m) = modules.get_mut(&child) {
            m.parent = Some(parent.clone());
        }
        if let Some(p) = modules.get_mut(&parent) {
            p.children.push(child);
        }
    }
}
