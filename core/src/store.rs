use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One invocation of a job: created at launch, amended once at exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusEntry {
    /// Unique token identifying this invocation.
    #[serde(default)]
    pub id: String,
    /// Name of the job that ran.
    pub name: String,
    /// Epoch milliseconds when execution began.
    pub timestamp: i64,
    /// Exit code; absent while the child is still running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
}

impl RunStatusEntry {
    /// Build a fresh entry for a run starting now.
    pub fn begin(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            status_code: None,
        }
    }
}

/// Append-only run history, persisted as a JSON array document.
///
/// The whole document is held in memory and rewritten on every mutation.
/// Durability is best-effort: writes go to a temp file then rename.
pub struct StatusStore {
    path: PathBuf,
    entries: Mutex<Vec<RunStatusEntry>>,
}

impl StatusStore {
    /// Open the store at `path`, loading any existing document.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = read_document(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Insert a new entry and persist immediately.
    pub fn insert(&self, entry: RunStatusEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.push(entry);
        write_document(&self.path, &entries)
    }

    /// Patch the entry with `id` with its exit code and persist.
    pub fn update(&self, id: &str, status_code: i32) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.status_code = Some(status_code);
        }
        write_document(&self.path, &entries)
    }

    /// All entries recorded for `name`, in insertion order.
    pub fn find_by_name(&self, name: &str) -> Vec<RunStatusEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    /// The most recent start timestamp recorded for `name`.
    pub fn latest_for(&self, name: &str) -> Option<i64> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.timestamp)
            .max()
    }
}

fn read_document(path: &Path) -> Result<Vec<RunStatusEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let txt = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&txt).with_context(|| format!("parse {}", path.display()))
}

/// Write the document via temp file then rename.
pub(crate) fn write_json_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let buf = serde_json::to_vec_pretty(value).context("serialize document")?;
    let tmp = path.with_extension("tmp");
    let mut f =
        fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&buf)
        .with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

fn write_document(path: &Path, entries: &[RunStatusEntry]) -> Result<()> {
    write_json_document(path, &entries)
}
