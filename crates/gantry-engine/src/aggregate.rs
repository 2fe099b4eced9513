//! Cross-module report aggregation.
//!
//! Each module contributes fragments of one kind (JUnit XML, JaCoCo XML, or
//! JSON); fragments are parsed in parallel and merged into a single JSON
//! artifact that lists every source fragment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use gantry_config::manifest::ReportKind;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Schema version accepted for dependency-update fragments.
pub const DEPENDENCY_UPDATES_SCHEMA: u64 = 1;

/// Version keywords that mark a pre-release.
const NON_STABLE_KEYWORDS: &[&str] = &["PREVIEW", "ALPHA", "BETA", "SNAPSHOT"];

/// One module's contribution to an aggregate report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub module: String,
    pub path: PathBuf,
}

impl Fragment {
    pub fn new(module: &str, path: &Path) -> Self {
        Self {
            module: module.to_owned(),
            path: path.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFragment {
    pub module: String,
    pub path: String,
}

/// The merged artifact.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateReport {
    pub kind: ReportKind,
    pub sources: Vec<SourceFragment>,
    #[serde(flatten)]
    pub body: ReportBody,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReportBody {
    Test(TestReport),
    Coverage(CoverageReport),
    DependencyUpdates(DependencyUpdatesReport),
    Json(JsonReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestCase {
    pub module: String,
    pub suite: String,
    pub class_name: String,
    pub name: String,
    pub status: TestStatus,
    pub time_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TestTotals {
    pub tests: usize,
    pub passed: usize,
    pub failures: usize,
    pub errors: usize,
    pub skipped: usize,
    pub time_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TestReport {
    pub totals: TestTotals,
    pub cases: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageFile {
    pub module: String,
    pub package: String,
    pub file: String,
    pub lines_missed: u64,
    pub lines_covered: u64,
    /// Per-line coverage by line number, when the fragment carries `<line>` elements.
    #[serde(skip)]
    pub lines: BTreeMap<u32, bool>,
}

impl CoverageFile {
    /// Fold another run of the same file into this one.
    ///
    /// With line data on both sides a line is covered when any run covered it.
    /// Otherwise the run with more covered lines wins.
    fn merge(&mut self, other: Self) {
        if self.lines.is_empty() || other.lines.is_empty() {
            if other.lines_covered > self.lines_covered {
                *self = other;
            }
            return;
        }
        for (nr, covered) in other.lines {
            *self.lines.entry(nr).or_insert(false) |= covered;
        }
        self.recount();
    }

    fn recount(&mut self) {
        let covered = self.lines.values().filter(|c| **c).count();
        let missed = self.lines.len() - covered;
        self.lines_covered = u64::try_from(covered).unwrap_or(u64::MAX);
        self.lines_missed = u64::try_from(missed).unwrap_or(u64::MAX);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LineTotals {
    pub missed: u64,
    pub covered: u64,
    /// Covered lines over all lines, `0.0` when there are none.
    pub ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoverageReport {
    pub lines: LineTotals,
    pub files: Vec<CoverageFile>,
}

/// A dependency-update fragment as written by the update checker.
#[derive(Debug, Clone, Deserialize)]
struct UpdatesFragment {
    schema_version: u64,
    #[serde(default)]
    dependencies: Vec<DependencyCandidates>,
}

#[derive(Debug, Clone, Deserialize)]
struct DependencyCandidates {
    group: String,
    name: String,
    current: String,
    #[serde(default)]
    candidates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyUpdate {
    pub module: String,
    pub group: String,
    pub name: String,
    pub current: String,
    /// Acceptable candidates, in fragment order.
    pub available: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyUpdatesReport {
    pub schema_version: u64,
    pub updates: Vec<DependencyUpdate>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JsonReport {
    pub schema_version: u64,
    pub entries: Vec<serde_json::Value>,
}

enum Parsed {
    Test(Vec<TestCase>),
    Coverage(Vec<CoverageFile>),
    DependencyUpdates(Vec<DependencyUpdate>),
    Json(u64, Vec<serde_json::Value>),
}

/// Merge `fragments` of one `kind` into a single report.
///
/// Fragments are parsed in parallel and merged in the given order. An empty
/// fragment list yields an empty report.
///
/// # Errors
/// Returns an error if a fragment cannot be read, does not parse, has the
/// wrong root element, or carries an incompatible `schema_version`.
pub fn aggregate(kind: ReportKind, fragments: &[Fragment]) -> Result<AggregateReport, AggregationError> {
    if fragments.is_empty() {
        tracing::warn!(kind = %kind, "no report fragments found; writing an empty report");
    }

    let parsed: Vec<Parsed> = fragments
        .par_iter()
        .map(|fragment| parse(kind, fragment))
        .collect::<Result<_, _>>()?;

    let sources = fragments
        .iter()
        .map(|f| SourceFragment {
            module: f.module.clone(),
            path: f.path.display().to_string(),
        })
        .collect();

    let body = match kind {
        ReportKind::Test => ReportBody::Test(merge_tests(parsed)),
        ReportKind::Coverage => ReportBody::Coverage(merge_coverage(parsed)),
        ReportKind::DependencyUpdates => {
            let updates = parsed
                .into_iter()
                .flat_map(|p| match p {
                    Parsed::DependencyUpdates(u) => u,
                    _ => Vec::new(),
                })
                .collect();
            ReportBody::DependencyUpdates(DependencyUpdatesReport {
                schema_version: DEPENDENCY_UPDATES_SCHEMA,
                updates,
            })
        }
        ReportKind::Json => ReportBody::Json(merge_json(fragments, parsed)?),
    };

    tracing::debug!(kind = %kind, fragments = fragments.len(), "aggregated report");
    Ok(AggregateReport { kind, sources, body })
}

impl AggregateReport {
    /// Write the report as pretty-printed JSON, creating parent directories.
    ///
    /// # Errors
    /// Returns an error if the report cannot be serialized or written.
    pub fn write(&self, path: &Path) -> Result<(), AggregationError> {
        let write_error = |message: String| AggregationError::Write {
            path: path.display().to_string(),
            message,
        };
        let mut json = serde_json::to_vec_pretty(self).map_err(|e| write_error(e.to_string()))?;
        json.push(b'\n');
        if let Some(parent) = path.parent() {
            gantry_util::fs::ensure_dir(parent).map_err(|e| write_error(e.to_string()))?;
        }
        gantry_util::fs::write_atomic(path, &json).map_err(|e| write_error(e.to_string()))
    }
}

/// Whether `version` is a pre-release (`-PREVIEW`, `-alpha`, `-SNAPSHOT`, ...).
///
/// A whole `RC<digits>` token (`2.0.0-RC1`) also counts; `SOURCE` does not.
pub fn is_non_stable(version: &str) -> bool {
    let upper = version.to_uppercase();
    NON_STABLE_KEYWORDS.iter().any(|k| upper.contains(k))
        || upper
            .split(['.', '-', '_', '+'])
            .any(|token| token.strip_prefix("RC").is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit())))
}

/// Candidates are rejected when they are pre-releases of a stable current version.
pub fn accept_candidate(current: &str, candidate: &str) -> bool {
    !(is_non_stable(candidate) && !is_non_stable(current))
}

fn parse(kind: ReportKind, fragment: &Fragment) -> Result<Parsed, AggregationError> {
    let content = std::fs::read_to_string(&fragment.path).map_err(|source| AggregationError::Read {
        path: fragment.path.display().to_string(),
        source,
    })?;
    match kind {
        ReportKind::Test => parse_junit(fragment, &content).map(Parsed::Test),
        ReportKind::Coverage => parse_jacoco(fragment, &content).map(Parsed::Coverage),
        ReportKind::DependencyUpdates => parse_updates(fragment, &content).map(Parsed::DependencyUpdates),
        ReportKind::Json => parse_json(fragment, &content),
    }
}

fn parse_xml<'a>(fragment: &Fragment, content: &'a str) -> Result<roxmltree::Document<'a>, AggregationError> {
    // Coverage reports carry a DOCTYPE.
    let mut options = roxmltree::ParsingOptions::default();
    options.allow_dtd = true;
    roxmltree::Document::parse_with_options(content, options).map_err(|e| AggregationError::Xml {
        path: fragment.path.display().to_string(),
        message: e.to_string(),
    })
}

fn expect_root(fragment: &Fragment, doc: &roxmltree::Document<'_>, expected: &[&str]) -> Result<(), AggregationError> {
    let found = doc.root_element().tag_name().name();
    if expected.contains(&found) {
        Ok(())
    } else {
        Err(AggregationError::UnexpectedRoot {
            path: fragment.path.display().to_string(),
            expected: expected.join(" or "),
            found: found.to_owned(),
        })
    }
}

fn parse_junit(fragment: &Fragment, content: &str) -> Result<Vec<TestCase>, AggregationError> {
    let doc = parse_xml(fragment, content)?;
    expect_root(fragment, &doc, &["testsuite", "testsuites"])?;

    let mut cases = Vec::new();
    for case in doc.descendants().filter(|n| n.has_tag_name("testcase")) {
        let suite = case
            .ancestors()
            .find(|n| n.has_tag_name("testsuite"))
            .and_then(|n| n.attribute("name"))
            .unwrap_or_default();
        let outcome = case.children().find_map(|child| {
            let status = match child.tag_name().name() {
                "failure" => TestStatus::Failed,
                "error" => TestStatus::Error,
                "skipped" => TestStatus::Skipped,
                _ => return None,
            };
            let message = child
                .attribute("message")
                .map(str::to_owned)
                .or_else(|| child.text().map(|t| t.trim().to_owned()))
                .filter(|m| !m.is_empty());
            Some((status, message))
        });
        let (status, message) = outcome.unwrap_or((TestStatus::Passed, None));
        cases.push(TestCase {
            module: fragment.module.clone(),
            suite: suite.to_owned(),
            class_name: case.attribute("classname").unwrap_or_default().to_owned(),
            name: case.attribute("name").unwrap_or_default().to_owned(),
            status,
            time_secs: case
                .attribute("time")
                .and_then(|t| t.replace(',', "").parse().ok())
                .unwrap_or(0.0),
            message,
        });
    }
    Ok(cases)
}

fn merge_tests(parsed: Vec<Parsed>) -> TestReport {
    let mut report = TestReport::default();
    for cases in parsed.into_iter().filter_map(|p| match p {
        Parsed::Test(cases) => Some(cases),
        _ => None,
    }) {
        for case in cases {
            let totals = &mut report.totals;
            totals.tests += 1;
            totals.time_secs += case.time_secs;
            match case.status {
                TestStatus::Passed => totals.passed += 1,
                TestStatus::Failed => totals.failures += 1,
                TestStatus::Error => totals.errors += 1,
                TestStatus::Skipped => totals.skipped += 1,
            }
            report.cases.push(case);
        }
    }
    report
}

fn parse_jacoco(fragment: &Fragment, content: &str) -> Result<Vec<CoverageFile>, AggregationError> {
    let doc = parse_xml(fragment, content)?;
    expect_root(fragment, &doc, &["report"])?;

    let mut files = Vec::new();
    for package in doc.descendants().filter(|n| n.has_tag_name("package")) {
        let package_name = package.attribute("name").unwrap_or_default();
        for source in package.children().filter(|n| n.has_tag_name("sourcefile")) {
            let Some(file) = source.attribute("name") else {
                return Err(AggregationError::MissingField {
                    path: fragment.path.display().to_string(),
                    field: "sourcefile/@name".to_owned(),
                });
            };
            let counter = source
                .children()
                .find(|n| n.has_tag_name("counter") && n.attribute("type") == Some("LINE"));
            let count = |attr: &str| {
                counter
                    .and_then(|n| n.attribute(attr))
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0)
            };
            let mut lines = BTreeMap::new();
            for line in source.children().filter(|n| n.has_tag_name("line")) {
                let Some(nr) = line.attribute("nr").and_then(|v| v.parse::<u32>().ok()) else {
                    continue;
                };
                let covered = line
                    .attribute("ci")
                    .and_then(|v| v.parse::<u64>().ok())
                    .is_some_and(|ci| ci > 0);
                *lines.entry(nr).or_insert(false) |= covered;
            }
            let mut entry = CoverageFile {
                module: fragment.module.clone(),
                package: package_name.to_owned(),
                file: file.to_owned(),
                lines_missed: count("missed"),
                lines_covered: count("covered"),
                lines,
            };
            if !entry.lines.is_empty() {
                entry.recount();
            }
            files.push(entry);
        }
    }
    Ok(files)
}

#[allow(clippy::cast_precision_loss)]
fn merge_coverage(parsed: Vec<Parsed>) -> CoverageReport {
    let mut by_file: BTreeMap<(String, String, String), CoverageFile> = BTreeMap::new();
    for file in parsed.into_iter().flat_map(|p| match p {
        Parsed::Coverage(files) => files,
        _ => Vec::new(),
    }) {
        let key = (file.module.clone(), file.package.clone(), file.file.clone());
        match by_file.get_mut(&key) {
            Some(existing) => existing.merge(file),
            None => {
                by_file.insert(key, file);
            }
        }
    }

    let files: Vec<CoverageFile> = by_file.into_values().collect();
    let missed: u64 = files.iter().map(|f| f.lines_missed).sum();
    let covered: u64 = files.iter().map(|f| f.lines_covered).sum();
    let total = missed + covered;
    let ratio = if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64
    };
    CoverageReport {
        lines: LineTotals {
            missed,
            covered,
            ratio,
        },
        files,
    }
}

fn parse_updates(fragment: &Fragment, content: &str) -> Result<Vec<DependencyUpdate>, AggregationError> {
    let parsed: UpdatesFragment = serde_json::from_str(content).map_err(|source| AggregationError::Json {
        path: fragment.path.display().to_string(),
        source,
    })?;
    if parsed.schema_version != DEPENDENCY_UPDATES_SCHEMA {
        return Err(AggregationError::UnsupportedSchema {
            path: fragment.path.display().to_string(),
            version: parsed.schema_version,
        });
    }
    Ok(parsed
        .dependencies
        .into_iter()
        .filter_map(|dep| {
            let available: Vec<String> = dep
                .candidates
                .into_iter()
                .filter(|c| accept_candidate(&dep.current, c))
                .collect();
            (!available.is_empty()).then(|| DependencyUpdate {
                module: fragment.module.clone(),
                group: dep.group,
                name: dep.name,
                current: dep.current,
                available,
            })
        })
        .collect())
}

fn parse_json(fragment: &Fragment, content: &str) -> Result<Parsed, AggregationError> {
    let path = || fragment.path.display().to_string();
    let value: serde_json::Value = serde_json::from_str(content).map_err(|source| AggregationError::Json {
        path: path(),
        source,
    })?;
    let Some(version) = value.get("schema_version").and_then(serde_json::Value::as_u64) else {
        return Err(AggregationError::MissingField {
            path: path(),
            field: "schema_version".to_owned(),
        });
    };
    let Some(entries) = value.get("entries").and_then(serde_json::Value::as_array) else {
        return Err(AggregationError::MissingField {
            path: path(),
            field: "entries".to_owned(),
        });
    };
    Ok(Parsed::Json(version, entries.clone()))
}

fn merge_json(fragments: &[Fragment], parsed: Vec<Parsed>) -> Result<JsonReport, AggregationError> {
    let mut report = JsonReport::default();
    let mut expected: Option<u64> = None;
    for (fragment, p) in fragments.iter().zip(parsed) {
        let Parsed::Json(version, entries) = p else {
            continue;
        };
        match expected {
            Some(v) if v != version => {
                return Err(AggregationError::SchemaMismatch {
                    path: fragment.path.display().to_string(),
                    expected: v,
                    found: version,
                });
            }
            Some(_) => {}
            None => expected = Some(version),
        }
        report.entries.extend(entries);
    }
    report.schema_version = expected.unwrap_or_default();
    Ok(report)
}

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("cannot read report fragment {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid XML in report fragment {path}: {message}")]
    Xml { path: String, message: String },
    #[error("invalid JSON in report fragment {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("report fragment {path} has root element <{found}>, expected <{expected}>")]
    UnexpectedRoot {
        path: String,
        expected: String,
        found: String,
    },
    #[error("report fragment {path} has schema_version {found}, but earlier fragments have {expected}")]
    SchemaMismatch {
        path: String,
        expected: u64,
        found: u64,
    },
    #[error("report fragment {path} has unsupported schema_version {version}")]
    UnsupportedSchema { path: String, version: u64 },
    #[error("report fragment {path} is missing `{field}`")]
    MissingField { path: String, field: String },
    #[error("cannot write aggregate report {path}: {message}")]
    Write { path: String, message: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;

    fn fragment(dir: &Path, module: &str, name: &str, content: &str) -> Fragment {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        Fragment::new(module, &path)
    }

    fn junit(suite: &str, failing: bool) -> String {
        let failure = if failing {
            r#"<failure message="expected 2 but was 3">AssertionError</failure>"#
        } else {
            ""
        };
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuite name="{suite}" tests="2" failures="{}" errors="0" skipped="0" time="0.5">
  <testcase name="dispatches" classname="{suite}" time="0.25"/>
  <testcase name="handles" classname="{suite}" time="0.25">{failure}</testcase>
</testsuite>
"#,
            u8::from(failing)
        )
    }

    #[test]
    fn three_modules_aggregate_into_one_report() {
        let tmp = tempfile::tempdir().unwrap();
        let fragments = vec![
            fragment(tmp.path(), ":core", "core.xml", &junit("CoreTest", false)),
            fragment(tmp.path(), ":kafka", "kafka.xml", &junit("KafkaTest", true)),
            fragment(tmp.path(), ":events", "events.xml", &junit("EventsTest", false)),
        ];

        let report = aggregate(ReportKind::Test, &fragments).unwrap();
        assert_eq!(report.sources.len(), 3);
        let ReportBody::Test(body) = &report.body else {
            panic!("expected test body");
        };
        assert_eq!(body.totals.tests, 6);
        assert_eq!(body.totals.failures, 1);
        assert_eq!(body.totals.passed, 5);
        let failed = body
            .cases
            .iter()
            .find(|c| c.status == TestStatus::Failed)
            .unwrap();
        assert_eq!(failed.module, ":kafka");
        assert_eq!(failed.message.as_deref(), Some("expected 2 but was 3"));

        let out = tmp.path().join("reports/tests.json");
        report.write(&out).unwrap();
        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(json["kind"], "test");
        assert_eq!(json["sources"].as_array().unwrap().len(), 3);
        assert_eq!(json["totals"]["tests"], 6);
    }

    #[test]
    fn testsuites_root_and_skipped_cases() {
        let tmp = tempfile::tempdir().unwrap();
        let xml = r#"<testsuites>
  <testsuite name="A"><testcase name="a" classname="A"><skipped/></testcase></testsuite>
  <testsuite name="B"><testcase name="b" classname="B"><error message="NPE"/></testcase></testsuite>
</testsuites>"#;
        let report = aggregate(ReportKind::Test, &[fragment(tmp.path(), ":core", "t.xml", xml)]).unwrap();
        let ReportBody::Test(body) = &report.body else {
            panic!("expected test body");
        };
        assert_eq!(body.totals.skipped, 1);
        assert_eq!(body.totals.errors, 1);
        assert_eq!(body.cases[1].suite, "B");
    }

    #[test]
    fn wrong_root_element_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fragment(tmp.path(), ":core", "jacoco.xml", "<report name=\"core\"/>");
        match aggregate(ReportKind::Test, &[f]) {
            Err(AggregationError::UnexpectedRoot { found, .. }) => assert_eq!(found, "report"),
            other => panic!("expected unexpected root, got {other:?}"),
        }
    }

    #[test]
    fn malformed_xml_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fragment(tmp.path(), ":core", "t.xml", "<testsuite><testcase>");
        assert!(matches!(
            aggregate(ReportKind::Test, &[f]),
            Err(AggregationError::Xml { .. })
        ));
    }

    #[test]
    fn coverage_sums_line_counters_across_modules() {
        let tmp = tempfile::tempdir().unwrap();
        let jacoco = |pkg: &str, missed: u32, covered: u32| {
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<!DOCTYPE report PUBLIC "-//JACOCO//DTD Report 1.1//EN" "report.dtd">
<report name="{pkg}">
  <package name="io/github/{pkg}">
    <class name="io/github/{pkg}/Dispatcher" sourcefilename="Dispatcher.java"/>
    <sourcefile name="Dispatcher.java">
      <counter type="INSTRUCTION" missed="10" covered="90"/>
      <counter type="LINE" missed="{missed}" covered="{covered}"/>
    </sourcefile>
  </package>
  <counter type="LINE" missed="{missed}" covered="{covered}"/>
</report>"#
            )
        };
        let fragments = vec![
            fragment(tmp.path(), ":core", "core.xml", &jacoco("core", 1, 9)),
            fragment(tmp.path(), ":kafka", "kafka.xml", &jacoco("kafka", 3, 7)),
        ];
        let report = aggregate(ReportKind::Coverage, &fragments).unwrap();
        let ReportBody::Coverage(body) = &report.body else {
            panic!("expected coverage body");
        };
        assert_eq!(body.files.len(), 2);
        assert_eq!(body.lines.missed, 4);
        assert_eq!(body.lines.covered, 16);
        assert!((body.lines.ratio - 0.8).abs() < 1e-9);
    }

    fn jacoco_lines(lines: &[(u32, u32)]) -> String {
        let body: String = lines
            .iter()
            .map(|(nr, ci)| {
                let mi = if *ci == 0 { 2 } else { 0 };
                format!("      <line nr=\"{nr}\" mi=\"{mi}\" ci=\"{ci}\" mb=\"0\" cb=\"0\"/>\n")
            })
            .collect();
        format!(
            r#"<report name="core">
  <package name="io/github/core">
    <sourcefile name="A.java">
{body}      <counter type="LINE" missed="0" covered="0"/>
    </sourcefile>
  </package>
</report>"#
        )
    }

    fn single_file(report: &AggregateReport) -> &CoverageFile {
        let ReportBody::Coverage(body) = &report.body else {
            panic!("expected coverage body");
        };
        assert_eq!(body.files.len(), 1);
        &body.files[0]
    }

    #[test]
    fn repeated_runs_of_one_file_are_not_double_counted() {
        let tmp = tempfile::tempdir().unwrap();
        let lines: Vec<(u32, u32)> = (1..=10).map(|nr| (nr, u32::from(nr <= 8))).collect();
        let xml = jacoco_lines(&lines);
        let fragments = vec![
            fragment(tmp.path(), ":core", "unit.xml", &xml),
            fragment(tmp.path(), ":core", "integration.xml", &xml),
        ];
        let report = aggregate(ReportKind::Coverage, &fragments).unwrap();
        let file = single_file(&report);
        assert_eq!(file.lines_covered, 8);
        assert_eq!(file.lines_missed, 2);
        assert_eq!(report.sources.len(), 2);
    }

    #[test]
    fn overlapping_runs_take_the_union_of_covered_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let unit = jacoco_lines(&[(1, 1), (2, 1), (3, 0), (4, 0)]);
        let integration = jacoco_lines(&[(1, 0), (2, 0), (3, 4), (4, 0)]);
        let fragments = vec![
            fragment(tmp.path(), ":core", "unit.xml", &unit),
            fragment(tmp.path(), ":core", "integration.xml", &integration),
        ];
        let report = aggregate(ReportKind::Coverage, &fragments).unwrap();
        let file = single_file(&report);
        assert_eq!(file.lines_covered, 3);
        assert_eq!(file.lines_missed, 1);
        let ReportBody::Coverage(body) = &report.body else {
            panic!("expected coverage body");
        };
        assert!((body.lines.ratio - 0.75).abs() < 1e-9);
    }

    #[test]
    fn dependency_updates_reject_unstable_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        let json = r#"{
  "schema_version": 1,
  "dependencies": [
    {"group": "org.junit", "name": "junit-bom", "current": "5.9.2",
     "candidates": ["5.10.0-RC1", "5.10.0-M1-SNAPSHOT", "5.10.0"]},
    {"group": "io.kafka", "name": "clients", "current": "3.5.0-beta1",
     "candidates": ["3.6.0-alpha"]},
    {"group": "org.slf4j", "name": "slf4j-api", "current": "2.0.7",
     "candidates": ["2.1.0-preview"]}
  ]
}"#;
        let report = aggregate(
            ReportKind::DependencyUpdates,
            &[fragment(tmp.path(), ":core", "updates.json", json)],
        )
        .unwrap();
        let ReportBody::DependencyUpdates(body) = &report.body else {
            panic!("expected dependency updates body");
        };
        assert_eq!(body.updates.len(), 2);
        assert_eq!(body.updates[0].available, vec!["5.10.0".to_owned()]);
        assert_eq!(body.updates[1].name, "clients");
    }

    #[test]
    fn dependency_updates_require_known_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fragment(tmp.path(), ":core", "u.json", r#"{"schema_version": 2}"#);
        assert!(matches!(
            aggregate(ReportKind::DependencyUpdates, &[f]),
            Err(AggregationError::UnsupportedSchema { version: 2, .. })
        ));
    }

    #[test]
    fn json_fragments_with_mismatched_schema_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let fragments = vec![
            fragment(tmp.path(), ":a", "a.json", r#"{"schema_version": 1, "entries": [1]}"#),
            fragment(tmp.path(), ":b", "b.json", r#"{"schema_version": 2, "entries": [2]}"#),
        ];
        assert!(matches!(
            aggregate(ReportKind::Json, &fragments),
            Err(AggregationError::SchemaMismatch { expected: 1, found: 2, .. })
        ));
    }

    #[test]
    fn json_fragments_concatenate_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let fragments = vec![
            fragment(tmp.path(), ":a", "a.json", r#"{"schema_version": 1, "entries": [{"x": 1}]}"#),
            fragment(tmp.path(), ":b", "b.json", r#"{"schema_version": 1, "entries": [{"x": 2}, {"x": 3}]}"#),
        ];
        let report = aggregate(ReportKind::Json, &fragments).unwrap();
        let ReportBody::Json(body) = &report.body else {
            panic!("expected json body");
        };
        assert_eq!(body.entries.len(), 3);
        assert_eq!(body.schema_version, 1);
    }

    #[test]
    fn no_fragments_yield_empty_report() {
        let report = aggregate(ReportKind::Test, &[]).unwrap();
        assert!(report.sources.is_empty());
    }

    #[test]
    fn stability_rules() {
        assert!(is_non_stable("1.0.0-SNAPSHOT"));
        assert!(is_non_stable("2.0.0-beta.1"));
        assert!(is_non_stable("5.10.0-RC1"));
        assert!(!is_non_stable("5.10.0"));
        assert!(!is_non_stable("1.2.3-SOURCES"));
        assert!(accept_candidate("1.0.0-alpha", "1.1.0-alpha"));
        assert!(!accept_candidate("1.0.0", "1.1.0-alpha"));
    }
}
