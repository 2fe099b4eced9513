//! Task fingerprints and the persisted fingerprint cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::task::{TaskId, TaskNode};

/// Directory (relative to the workspace root) holding invocation state.
pub const STATE_DIR: &str = ".gantry";

const CACHE_FILE: &str = "fingerprints.toml";
const CACHE_VERSION: u32 = 1;

/// What the last successful run of a task looked like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: String,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// `succeeded` or `up-to-date`.
    pub state: String,
    /// Digest over the declared outputs after the run.
    #[serde(default)]
    pub output_digest: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    tasks: BTreeMap<String, FingerprintRecord>,
}

/// Fingerprint records keyed by task id, shared by all workers.
#[derive(Debug, Default)]
pub struct FingerprintStore {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<String, FingerprintRecord>>,
}

impl FingerprintStore {
    /// A store that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `<root>/.gantry/fingerprints.toml`.
    ///
    /// A missing file yields an empty store. A cache that cannot be parsed (or
    /// was written by another format version) is discarded with a warning.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read.
    pub fn load(root: &Path) -> Result<Self, EngineError> {
        let path = root.join(STATE_DIR).join(CACHE_FILE);
        let mut records = BTreeMap::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| EngineError::Io {
                path: path.display().to_string(),
                source,
            })?;
            match toml::from_str::<CacheFile>(&content) {
                Ok(file) if file.version == CACHE_VERSION => records = file.tasks,
                Ok(file) => {
                    tracing::warn!(path = %path.display(), version = file.version, "ignoring fingerprint cache with unknown version");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable fingerprint cache");
                }
            }
        }
        tracing::debug!(path = %path.display(), records = records.len(), "loaded fingerprint cache");
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    /// Where the store is persisted, if anywhere.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the store atomically. In-memory stores are left alone.
    ///
    /// # Errors
    /// Returns an error if the cache cannot be serialized or written.
    pub fn save(&self) -> Result<(), EngineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = CacheFile {
            version: CACHE_VERSION,
            tasks: self.lock().clone(),
        };
        let content = toml::to_string(&file).map_err(|e| EngineError::FingerprintCache {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            gantry_util::fs::ensure_dir(parent)?;
        }
        gantry_util::fs::write_atomic(path, content.as_bytes())?;
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<FingerprintRecord> {
        self.lock().get(id.as_str()).cloned()
    }

    pub fn record(&self, id: &TaskId, record: FingerprintRecord) {
        self.lock().insert(id.to_string(), record);
    }

    pub fn forget(&self, id: &TaskId) {
        self.lock().remove(id.as_str());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, FingerprintRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Compute the fingerprint of `node`.
///
/// Covers the task id, the action descriptor, the declared input files
/// (relative path and content), the declared input values, the recorded output
/// digests of upstream tasks, and the declared output paths.
///
/// # Errors
/// Returns an error if an input pattern is invalid or a file cannot be read.
pub fn compute(node: &TaskNode, store: &FingerprintStore) -> Result<String, EngineError> {
    let files = gantry_util::hash::sha256_patterns(&node.work_dir, &node.inputs.files)?;
    let descriptor = node.action.descriptor();
    let values: Vec<String> = node
        .inputs
        .values
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    let upstream: Vec<String> = node
        .inputs
        .tasks
        .iter()
        .map(|task| {
            let digest = store.get(task).map(|r| r.output_digest).unwrap_or_default();
            format!("{task}={digest}")
        })
        .collect();
    let outputs: Vec<String> = node
        .outputs
        .iter()
        .map(|o| o.display().to_string())
        .collect();

    let mut parts: Vec<&str> = vec![node.id.as_str(), &descriptor, &files];
    parts.push("values");
    parts.extend(values.iter().map(String::as_str));
    parts.push("upstream");
    parts.extend(upstream.iter().map(String::as_str));
    parts.push("outputs");
    parts.extend(outputs.iter().map(String::as_str));
    Ok(gantry_util::hash::sha256_multi(&parts))
}

/// Digest over the current content of every declared output.
///
/// # Errors
/// Returns an error if an existing output cannot be read.
pub fn output_digest(node: &TaskNode) -> Result<String, EngineError> {
    let mut entries = Vec::new();
    for (declared, resolved) in node.outputs.iter().zip(node.resolved_outputs()) {
        let digest = gantry_util::hash::sha256_path(&resolved)?.unwrap_or_else(|| "absent".to_owned());
        entries.push(format!("{}={digest}", declared.display()));
    }
    let parts: Vec<&str> = entries.iter().map(String::as_str).collect();
    Ok(gantry_util::hash::sha256_multi(&parts))
}

/// Whether every declared output exists.
pub fn outputs_exist(node: &TaskNode) -> bool {
    node.resolved_outputs().iter().all(|p| p.exists())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::task::Action;
    use std::fs;

    fn node(dir: &Path) -> TaskNode {
        TaskNode::new(TaskId::from(":core:compile"), Action::command(vec!["javac".to_owned()]))
            .with_work_dir(dir)
            .with_input_files(&["src"])
            .with_outputs(&["build/classes"])
    }

    fn setup(dir: &Path) {
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/A.java"), "class A {}").unwrap();
        fs::write(dir.join("src/B.java"), "class B {}").unwrap();
    }

    #[test]
    fn same_inputs_same_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        setup(tmp.path());
        let store = FingerprintStore::in_memory();
        let a = compute(&node(tmp.path()), &store).unwrap();
        let b = compute(&node(tmp.path()), &store).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn input_content_changes_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        setup(tmp.path());
        let store = FingerprintStore::in_memory();
        let before = compute(&node(tmp.path()), &store).unwrap();
        fs::write(tmp.path().join("src/B.java"), "class B { int x; }").unwrap();
        assert_ne!(before, compute(&node(tmp.path()), &store).unwrap());
    }

    #[test]
    fn value_and_action_change_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        setup(tmp.path());
        let store = FingerprintStore::in_memory();
        let base = compute(&node(tmp.path()), &store).unwrap();
        let with_value = compute(&node(tmp.path()).with_input_value("java.release", "21"), &store).unwrap();
        assert_ne!(base, with_value);

        let mut other = node(tmp.path());
        other.action = Action::command(vec!["ecj".to_owned()]);
        assert_ne!(base, compute(&other, &store).unwrap());
    }

    #[test]
    fn upstream_output_digest_changes_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        setup(tmp.path());
        let store = FingerprintStore::in_memory();
        let upstream = TaskId::from(":core:test");
        let n = node(tmp.path()).with_upstream_output(upstream.clone());
        let before = compute(&n, &store).unwrap();
        store.record(
            &upstream,
            FingerprintRecord {
                fingerprint: "f".to_owned(),
                outputs: Vec::new(),
                state: "succeeded".to_owned(),
                output_digest: "d1".to_owned(),
            },
        );
        assert_ne!(before, compute(&n, &store).unwrap());
    }

    #[test]
    fn output_digest_tracks_output_content() {
        let tmp = tempfile::tempdir().unwrap();
        let n = node(tmp.path());
        let absent = output_digest(&n).unwrap();
        assert!(!outputs_exist(&n));

        fs::create_dir_all(tmp.path().join("build/classes")).unwrap();
        fs::write(tmp.path().join("build/classes/A.class"), "cafebabe").unwrap();
        let present = output_digest(&n).unwrap();
        assert!(outputs_exist(&n));
        assert_ne!(absent, present);
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::load(tmp.path()).unwrap();
        assert!(store.is_empty());
        let id = TaskId::from(":core:test");
        store.record(
            &id,
            FingerprintRecord {
                fingerprint: "abc".to_owned(),
                outputs: vec!["build/test-results".to_owned()],
                state: "succeeded".to_owned(),
                output_digest: "def".to_owned(),
            },
        );
        store.save().unwrap();

        let reloaded = FingerprintStore::load(tmp.path()).unwrap();
        assert_eq!(reloaded.get(&id), store.get(&id));

        reloaded.forget(&id);
        assert!(reloaded.get(&id).is_none());
    }

    #[test]
    fn corrupt_cache_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join(STATE_DIR)).unwrap();
        fs::write(tmp.path().join(STATE_DIR).join(CACHE_FILE), "not = [valid").unwrap();
        let store = FingerprintStore::load(tmp.path()).unwrap();
        assert!(store.is_empty());
    }
}
