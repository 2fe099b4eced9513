//! `gantry.toml` manifests for the workspace root and for each module.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// File name of every manifest.
pub const MANIFEST_FILE: &str = "gantry.toml";

/// The root `gantry.toml`.
///
/// Besides workspace-wide declarations, the root manifest doubles as the
/// manifest of the root module (`:`), so it accepts the module sections too.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    #[serde(default)]
    pub workspace: WorkspaceSection,
    /// Project-layer build properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Conventions declared as data.
    #[serde(default)]
    pub conventions: BTreeMap<String, ConventionDecl>,
    /// Cross-module aggregate reports.
    #[serde(default)]
    pub reports: BTreeMap<String, ReportDecl>,
    /// Publishing destinations referenced by reports.
    #[serde(default)]
    pub sinks: BTreeMap<String, SinkDecl>,
    #[serde(default)]
    pub module: ModuleSection,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub sets: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskDecl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSection {
    #[serde(default)]
    pub name: Option<String>,
    /// Directory names (relative to the root) never scanned for modules.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// A module's `gantry.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleManifest {
    #[serde(default)]
    pub module: ModuleSection,
    /// Scalar settings applied after every convention.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    /// Set-valued settings merged into the convention result.
    #[serde(default)]
    pub sets: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskDecl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleSection {
    /// Conventions applied to this module, in order.
    #[serde(default)]
    pub conventions: Vec<String>,
    /// Paths of modules this module depends on (e.g. `":core"`).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Output directory relative to the module directory (default `build`).
    #[serde(default)]
    pub output_dir: Option<String>,
}

/// A convention declared in the root manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConventionDecl {
    /// Conventions applied before this one.
    #[serde(default)]
    pub includes: Vec<String>,
    /// Plugins/tools this convention relies on.
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub sets: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskDecl>,
}

/// A task declaration, either in a convention or in a module manifest.
///
/// Edge targets accept three forms: `name` (same module), `:path:name`
/// (absolute), and `^name` (the task `name` in every module this module
/// depends on).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDecl {
    #[serde(default)]
    pub description: Option<String>,
    /// Program and arguments; `${key}` is interpolated from settings and properties.
    /// An empty command declares a lifecycle task.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Input globs relative to the module directory.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Property/setting names whose values are task inputs.
    #[serde(default)]
    pub input_properties: Vec<String>,
    /// Output files or directories relative to the module directory.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub finalized_by: Vec<String>,
    #[serde(default)]
    pub must_run_after: Vec<String>,
    /// Predicate expression, e.g. `"!skipIntegrationTests"` or `"profile=ci"`.
    #[serde(default)]
    pub only_if: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// `false` marks a task that must never be considered up-to-date.
    #[serde(default)]
    pub cacheable: Option<bool>,
    #[serde(default)]
    pub matrix: Option<MatrixDecl>,
}

/// Expand one task into a variant per value of a list property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixDecl {
    /// Property holding the comma-separated values.
    pub property: String,
    /// Values used when the property is unset.
    #[serde(default)]
    pub default: String,
    /// Lifecycle task (same module) that should depend on the matrix.
    #[serde(default)]
    pub attach_to: Option<String>,
}

/// Kind of an aggregate report, which also selects the fragment format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    /// JUnit XML test results.
    Test,
    /// JaCoCo XML coverage reports.
    Coverage,
    /// JSON dependency-update findings.
    DependencyUpdates,
    /// Generic JSON fragments with `schema_version` and `entries`.
    Json,
}

impl ReportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Coverage => "coverage",
            Self::DependencyUpdates => "dependency-updates",
            Self::Json => "json",
        }
    }
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cross-module report assembled from per-module fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDecl {
    pub kind: ReportKind,
    /// Name of the per-module task producing the fragments.
    pub task: String,
    /// Fragment globs relative to each module directory.
    pub fragments: Vec<String>,
    /// Output path relative to the workspace root.
    #[serde(default)]
    pub output: Option<String>,
    /// Sinks the merged report is published to.
    #[serde(default)]
    pub publish: Vec<String>,
}

/// A publishing destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum SinkDecl {
    /// Copy into a directory (relative paths resolve against the workspace root).
    Directory { path: String },
    /// POST to a report-upload service.
    Http {
        url: String,
        /// Property holding the bearer token.
        #[serde(default)]
        token_property: Option<String>,
        #[serde(default = "default_content_type")]
        content_type: String,
    },
    /// Hand the file to an external tool; the path is appended as last argument.
    Command { command: Vec<String> },
}

fn default_content_type() -> String {
    "application/json".to_owned()
}

impl WorkspaceManifest {
    /// Read and parse the root `gantry.toml`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or contains invalid TOML.
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        read_toml(path)
    }

    /// The module-level view of the root manifest.
    pub fn root_module(&self) -> ModuleManifest {
        ModuleManifest {
            module: self.module.clone(),
            settings: self.settings.clone(),
            sets: self.sets.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl ModuleManifest {
    /// Read and parse a module `gantry.toml`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or contains invalid TOML.
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        read_toml(path)
    }
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    toml::from_str(&content).map_err(|e| ManifestError::Parse {
        path: path.display().to_string(),
        source: e,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid gantry.toml at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let path = dir.path().join(MANIFEST_FILE);
        fs::write(&path, content).unwrap_or_else(|e| panic!("{e}"));
        (dir, path)
    }

    #[test]
    fn parse_workspace_manifest() {
        let (_dir, path) = write(
            r#"
[workspace]
name = "deezpatch"
exclude = ["docs"]

[properties]
additionalTestRunsOnJvmVersions = "11,21"

[conventions.java]
plugins = ["java-library"]
settings = { "java.release" = "17" }

[conventions.java.tasks.compile]
command = ["javac", "-d", "build/classes", "--release", "${java.release}"]
inputs = ["src/main/java"]
outputs = ["build/classes"]

[conventions.testing]
includes = ["java"]

[conventions.testing.tasks.integrationTest]
command = ["./run-it.sh"]
only_if = "!skipIntegrationTests"
must_run_after = ["test"]

[reports.tests]
kind = "test"
task = "test"
fragments = ["build/test-results/*.xml"]
publish = ["archive"]

[sinks.archive]
type = "directory"
path = "dist/reports"

[sinks.coveralls]
type = "http"
url = "https://coveralls.io/api/v1/jobs"
token_property = "coverallsToken"
"#,
        );

        let manifest = WorkspaceManifest::from_path(&path).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(manifest.workspace.name.as_deref(), Some("deezpatch"));
        assert_eq!(manifest.conventions.len(), 2);
        let testing = manifest
            .conventions
            .get("testing")
            .unwrap_or_else(|| panic!("missing testing"));
        assert_eq!(testing.includes, vec!["java".to_owned()]);
        let it = testing
            .tasks
            .get("integrationTest")
            .unwrap_or_else(|| panic!("missing integrationTest"));
        assert_eq!(it.only_if.as_deref(), Some("!skipIntegrationTests"));

        let report = manifest
            .reports
            .get("tests")
            .unwrap_or_else(|| panic!("missing report"));
        assert_eq!(report.kind, ReportKind::Test);

        match manifest.sinks.get("coveralls") {
            Some(SinkDecl::Http { content_type, .. }) => {
                assert_eq!(content_type, "application/json");
            }
            other => panic!("unexpected sink: {other:?}"),
        }
    }

    #[test]
    fn parse_module_manifest() {
        let (_dir, path) = write(
            r#"
[module]
conventions = ["java", "testing"]
depends_on = [":core"]

[settings]
"java.release" = "21"

[tasks.test.matrix]
property = "additionalTestRunsOnJvmVersions"
default = "11,21"
attach_to = "check"
"#,
        );
        let manifest = ModuleManifest::from_path(&path).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(manifest.module.conventions.len(), 2);
        assert_eq!(manifest.module.depends_on, vec![":core".to_owned()]);
        let matrix = manifest
            .tasks
            .get("test")
            .and_then(|t| t.matrix.clone())
            .unwrap_or_else(|| panic!("missing matrix"));
        assert_eq!(matrix.attach_to.as_deref(), Some("check"));
    }

    #[test]
    fn empty_module_manifest_is_valid() {
        let (_dir, path) = write("");
        let manifest = ModuleManifest::from_path(&path).unwrap_or_else(|e| panic!("{e}"));
        assert!(manifest.module.conventions.is_empty());
        assert!(manifest.tasks.is_empty());
    }

    #[test]
    fn unknown_report_kind_is_rejected() {
        let (_dir, path) = write(
            r#"
[reports.x]
kind = "pmd"
task = "lint"
fragments = []
"#,
        );
        assert!(matches!(
            WorkspaceManifest::from_path(&path),
            Err(ManifestError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        assert!(matches!(
            ModuleManifest::from_path(&dir.path().join(MANIFEST_FILE)),
            Err(ManifestError::Read { .. })
        ));
    }
}
