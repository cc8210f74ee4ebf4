//! On-disk layout and durable file primitives.
//!
//! ```text
//! <data_dir>/
//!   snapshots/<timestamp>.snap        atomic rename; last N kept
//!   plugins/<name>/<version>/         code + manifest + test_cases.json
//!   goals/<goal_id>/history.json      append-only attempts
//!   logs/*.log
//! ```

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::plugin::PluginMetadata;
use crate::domain::models::task::Attempt;

/// Resolved paths under a runtime data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Open (and create) the layout under `root`.
    pub fn open(root: impl Into<PathBuf>) -> RuntimeResult<Self> {
        let root = root.into();
        let dir = Self { root };
        for sub in [dir.snapshots(), dir.plugins(), dir.goals(), dir.logs()] {
            fs::create_dir_all(&sub)?;
        }
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshots(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn plugins(&self) -> PathBuf {
        self.root.join("plugins")
    }

    pub fn goals(&self) -> PathBuf {
        self.root.join("goals")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Directory for one materialized plugin version.
    pub fn plugin_dir(&self, name: &str, version: &semver::Version) -> PathBuf {
        self.plugins().join(name).join(version.to_string())
    }

    /// Per-goal history file.
    pub fn goal_history(&self, goal_id: Uuid) -> PathBuf {
        self.goals().join(goal_id.to_string()).join("history.json")
    }
}

/// Write `contents` to `path` via a staging file and atomic rename.
pub fn atomic_write(path: &Path, contents: &[u8]) -> RuntimeResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RuntimeError::Storage(format!("No parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let staging = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("staging")
    ));
    {
        let mut file = fs::File::create(&staging)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&staging, path)?;
    Ok(())
}

/// Snapshot file store: atomic writes, newest-first listing, bounded
/// retention.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn new(dir: PathBuf, retain: usize) -> Self {
        Self {
            dir,
            retain: retain.max(1),
        }
    }

    /// Persist one snapshot and prune old ones. Returns the written path.
    pub fn write(&self, serialized: &[u8]) -> RuntimeResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let mut path = self.dir.join(format!("{stamp}.snap"));
        // Same-millisecond writers get a disambiguating suffix.
        let mut n = 0;
        while path.exists() {
            n += 1;
            path = self.dir.join(format!("{stamp}-{n}.snap"));
        }
        atomic_write(&path, serialized)?;
        self.prune()?;
        Ok(path)
    }

    /// Snapshot paths, newest first. Timestamped names sort
    /// lexicographically.
    pub fn list(&self) -> RuntimeResult<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "snap"))
                .collect(),
            Err(_) => Vec::new(),
        };
        paths.sort();
        paths.reverse();
        Ok(paths)
    }

    /// Read the newest snapshot, if any.
    pub fn read_latest(&self) -> RuntimeResult<Option<Vec<u8>>> {
        match self.list()?.first() {
            Some(path) => Ok(Some(fs::read(path)?)),
            None => Ok(None),
        }
    }

    fn prune(&self) -> RuntimeResult<()> {
        for stale in self.list()?.into_iter().skip(self.retain) {
            if let Err(e) = fs::remove_file(&stale) {
                tracing::warn!(path = %stale.display(), error = %e, "Failed to prune snapshot");
            }
        }
        Ok(())
    }
}

/// Append one terminal attempt to a goal's history file as a JSON line.
pub fn append_goal_history(
    data_dir: &DataDir,
    goal_id: Uuid,
    task_id: Uuid,
    attempt: &Attempt,
) -> RuntimeResult<()> {
    let path = data_dir.goal_history(goal_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let record = serde_json::json!({
        "task_id": task_id,
        "attempt": attempt,
    });
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{record}")?;
    Ok(())
}

/// Read a goal's history back, oldest first. Malformed lines are skipped.
pub fn read_goal_history(
    data_dir: &DataDir,
    goal_id: Uuid,
) -> RuntimeResult<Vec<(Uuid, Attempt)>> {
    let path = data_dir.goal_history(goal_id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in contents.lines() {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        let task_id = value
            .get("task_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());
        let attempt = value
            .get("attempt")
            .cloned()
            .and_then(|v| serde_json::from_value::<Attempt>(v).ok());
        if let (Some(task_id), Some(attempt)) = (task_id, attempt) {
            records.push((task_id, attempt));
        }
    }
    Ok(records)
}

/// Materialize a plugin version on disk: manifest, source, test cases.
pub fn write_plugin(
    data_dir: &DataDir,
    metadata: &PluginMetadata,
    source_file: &str,
    source: &str,
    test_cases: &serde_json::Value,
) -> RuntimeResult<PathBuf> {
    let dir = data_dir.plugin_dir(&metadata.name, &metadata.version);
    fs::create_dir_all(&dir)?;

    atomic_write(
        &dir.join("manifest.json"),
        serde_json::to_string_pretty(metadata)?.as_bytes(),
    )?;
    atomic_write(&dir.join(source_file), source.as_bytes())?;
    atomic_write(
        &dir.join("test_cases.json"),
        serde_json::to_string_pretty(test_cases)?.as_bytes(),
    )?;
    Ok(dir)
}

/// Scan the plugin store for manifests, as the registry does at startup.
pub fn scan_plugin_manifests(data_dir: &DataDir) -> RuntimeResult<Vec<(PluginMetadata, PathBuf)>> {
    let mut found = Vec::new();
    let root = data_dir.plugins();
    let Ok(names) = fs::read_dir(&root) else {
        return Ok(found);
    };
    for name_entry in names.filter_map(Result::ok) {
        let Ok(versions) = fs::read_dir(name_entry.path()) else {
            continue;
        };
        for version_entry in versions.filter_map(Result::ok) {
            let manifest_path = version_entry.path().join("manifest.json");
            if !manifest_path.exists() {
                continue;
            }
            match fs::read_to_string(&manifest_path)
                .map_err(RuntimeError::from)
                .and_then(|s| {
                    serde_json::from_str::<PluginMetadata>(&s).map_err(RuntimeError::from)
                }) {
                Ok(metadata) => found.push((metadata, version_entry.path())),
                Err(e) => {
                    tracing::warn!(
                        path = %manifest_path.display(),
                        error = %e,
                        "Skipping unreadable plugin manifest"
                    );
                }
            }
        }
    }
    Ok(found)
}
