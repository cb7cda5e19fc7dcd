//! Durable key/value storage and the typed repository the workspace talks to.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use directories::ProjectDirs;

use crate::calendar::UploadPayload;
use crate::error::{Result, WorkspaceError};
use crate::graph::WorkspaceSnapshot;
use crate::history::Checkpoint;
use crate::workspace::WorkspaceSettings;

/// Raw upload JSON as returned by the parse backend.
pub const PARSED_ICS_KEY: &str = "parsed-ics";
/// Latest `{nodes, edges}` snapshot.
pub const SCHEDULE_STATE_KEY: &str = "schedule-state";
/// Undo stack, oldest first, so undo survives a restart.
pub const HISTORY_KEY: &str = "schedule-history";
/// Build mode, reference date and selection policy of the session.
pub const SCHEDULE_SETTINGS_KEY: &str = "schedule-settings";

pub trait KeyValueStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for &T {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        (**self).remove(key)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        (**self).remove(key)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, String>) -> T,
    ) -> anyhow::Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(f(&mut entries))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.with_entries(|entries| entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }
}

/// One JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create data directory '{}'", root.display()))?;
        Ok(Self { root })
    }

    /// Platform data directory, or `.icsflow` when none can be determined.
    pub fn default_dir() -> PathBuf {
        ProjectDirs::from("dev", "icsflow", "icsflow")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".icsflow"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !valid {
            return Err(anyhow!("invalid storage key '{key}'"));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        Ok(Some(contents))
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, value)
            .with_context(|| format!("failed to write '{}'", staging.display()))?;
        fs::rename(&staging, &path)
            .with_context(|| format!("failed to replace '{}'", path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove '{}'", path.display()))
            }
        }
    }
}

/// Typed access to the persisted values. Unreadable stored JSON is
/// reported once and then treated as absent.
#[derive(Debug, Clone)]
pub struct WorkspaceRepository<S> {
    store: S,
}

impl<S: KeyValueStore> WorkspaceRepository<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn load(&self) -> Result<Option<WorkspaceSnapshot>> {
        let Some(raw) = self.store.get(SCHEDULE_STATE_KEY)? else {
            return Ok(None);
        };

        let snapshot = match serde_json::from_str::<WorkspaceSnapshot>(&raw) {
            Ok(snapshot) => snapshot,
            Err(source) => {
                let err = WorkspaceError::MalformedStoredJson {
                    key: SCHEDULE_STATE_KEY.to_string(),
                    source,
                };
                tracing::warn!(error = %err, "discarding persisted workspace");
                return Ok(None);
            }
        };

        if let Err(err) = snapshot.validate() {
            tracing::warn!(error = %err, "persisted workspace is inconsistent; discarding");
            return Ok(None);
        }

        Ok(Some(snapshot))
    }

    pub fn save(&self, snapshot: &WorkspaceSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        self.store.set(SCHEDULE_STATE_KEY, &json)?;
        tracing::debug!(
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            "persisted workspace"
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(SCHEDULE_STATE_KEY)?;
        Ok(())
    }

    pub fn load_history(&self) -> Result<VecDeque<Checkpoint>> {
        let Some(raw) = self.store.get(HISTORY_KEY)? else {
            return Ok(VecDeque::new());
        };
        match serde_json::from_str::<VecDeque<Checkpoint>>(&raw) {
            Ok(entries) if entries.iter().all(|entry| entry.snapshot.validate().is_ok()) => {
                Ok(entries)
            }
            Ok(_) => {
                tracing::warn!("persisted undo history is inconsistent; starting fresh");
                Ok(VecDeque::new())
            }
            Err(err) => {
                tracing::warn!(error = %err, "invalid {HISTORY_KEY} JSON; starting fresh");
                Ok(VecDeque::new())
            }
        }
    }

    pub fn save_history(&self, entries: &VecDeque<Checkpoint>) -> Result<()> {
        self.store.set(HISTORY_KEY, &serde_json::to_string(entries)?)?;
        Ok(())
    }

    pub fn clear_history(&self) -> Result<()> {
        self.store.remove(HISTORY_KEY)?;
        Ok(())
    }

    pub fn load_settings(&self) -> Result<Option<WorkspaceSettings>> {
        let Some(raw) = self.store.get(SCHEDULE_SETTINGS_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str::<WorkspaceSettings>(&raw) {
            Ok(settings) => Ok(Some(settings)),
            Err(err) => {
                tracing::warn!(error = %err, "invalid {SCHEDULE_SETTINGS_KEY} JSON; ignoring");
                Ok(None)
            }
        }
    }

    pub fn save_settings(&self, settings: &WorkspaceSettings) -> Result<()> {
        self.store.set(SCHEDULE_SETTINGS_KEY, &serde_json::to_string(settings)?)?;
        Ok(())
    }

    pub fn load_upload(&self) -> Result<Option<UploadPayload>> {
        let Some(raw) = self.store.get(PARSED_ICS_KEY)? else {
            return Ok(None);
        };
        match UploadPayload::parse(&raw) {
            Ok(payload) => Ok(Some(payload)),
            Err(err) => {
                tracing::warn!(error = %err, "invalid {PARSED_ICS_KEY} JSON; ignoring");
                Ok(None)
            }
        }
    }

    pub fn load_upload_raw(&self) -> Result<Option<String>> {
        Ok(self.store.get(PARSED_ICS_KEY)?)
    }

    pub fn save_upload(&self, payload: &UploadPayload) -> Result<()> {
        self.store.set(PARSED_ICS_KEY, &payload.to_json()?)?;
        Ok(())
    }

    pub fn clear_upload(&self) -> Result<()> {
        self.store.remove(PARSED_ICS_KEY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BuildMode, GraphEdge, GraphNode};
    use crate::selection::SelectionPolicy;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn sample() -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            nodes: vec![GraphNode::root("a", "A"), GraphNode::root("b", "B")],
            edges: vec![GraphEdge::new("a", "b")],
        }
    }

    #[test]
    fn memory_repository_round_trip() {
        let repo = WorkspaceRepository::new(MemoryStore::new());
        assert_eq!(repo.load().unwrap(), None);

        repo.save(&sample()).unwrap();
        assert_eq!(repo.load().unwrap(), Some(sample()));

        repo.clear().unwrap();
        assert_eq!(repo.load().unwrap(), None);
    }

    #[test]
    fn malformed_state_reads_as_absent() {
        let store = MemoryStore::new();
        store.set(SCHEDULE_STATE_KEY, "{not valid json").unwrap();
        store.set(PARSED_ICS_KEY, "also broken").unwrap();

        let repo = WorkspaceRepository::new(&store);
        assert_eq!(repo.load().unwrap(), None);
        assert_eq!(repo.load_upload().unwrap(), None);
        assert_eq!(repo.load_upload_raw().unwrap().as_deref(), Some("also broken"));
    }

    #[test]
    fn inconsistent_state_reads_as_absent() {
        let store = MemoryStore::new();
        let broken = WorkspaceSnapshot {
            nodes: vec![GraphNode::root("a", "A")],
            edges: vec![GraphEdge::new("a", "missing")],
        };
        store
            .set(SCHEDULE_STATE_KEY, &serde_json::to_string(&broken).unwrap())
            .unwrap();
        assert_eq!(WorkspaceRepository::new(&store).load().unwrap(), None);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let first = WorkspaceRepository::new(FileStore::open(temp_dir.path()).unwrap());
        first.save(&sample()).unwrap();
        assert!(temp_dir.path().join("schedule-state.json").is_file());

        let second = WorkspaceRepository::new(FileStore::open(temp_dir.path()).unwrap());
        assert_eq!(second.load().unwrap(), Some(sample()));

        second.clear().unwrap();
        second.clear().unwrap();
        assert_eq!(first.load().unwrap(), None);
    }

    #[test]
    fn file_store_rejects_path_like_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();
        assert!(store.set("../escape", "x").is_err());
        assert!(store.get("").is_err());
    }

    #[test]
    fn history_round_trip_and_corruption() {
        let store = MemoryStore::new();
        let repo = WorkspaceRepository::new(&store);
        assert!(repo.load_history().unwrap().is_empty());

        let entries: VecDeque<_> = vec![
            Checkpoint::new(WorkspaceSnapshot::default(), BuildMode::Chain),
            Checkpoint::new(sample(), BuildMode::Grouped),
        ]
        .into();
        repo.save_history(&entries).unwrap();
        assert_eq!(repo.load_history().unwrap(), entries);

        store.set(HISTORY_KEY, "[{").unwrap();
        assert!(repo.load_history().unwrap().is_empty());

        // Entries written without a mode were built as a chain.
        let bare = format!(r#"[{{"snapshot":{}}}]"#, serde_json::to_string(&sample()).unwrap());
        store.set(HISTORY_KEY, &bare).unwrap();
        assert_eq!(repo.load_history().unwrap()[0].mode, BuildMode::Chain);

        repo.clear_history().unwrap();
        assert_eq!(store.get(HISTORY_KEY).unwrap(), None);
    }

    #[test]
    fn settings_round_trip_and_corruption() {
        let store = MemoryStore::new();
        let repo = WorkspaceRepository::new(&store);
        assert_eq!(repo.load_settings().unwrap(), None);

        let settings = WorkspaceSettings {
            mode: BuildMode::Grouped,
            reference_date: NaiveDate::from_ymd_opt(2023, 10, 9),
            policy: SelectionPolicy::Date,
        };
        repo.save_settings(&settings).unwrap();
        assert_eq!(repo.load_settings().unwrap(), Some(settings));
        assert!(store.get(SCHEDULE_SETTINGS_KEY).unwrap().unwrap().contains("2023-10-09"));

        store.set(SCHEDULE_SETTINGS_KEY, r#"{"mode":"sideways"}"#).unwrap();
        assert_eq!(repo.load_settings().unwrap(), None);
    }

    #[test]
    fn upload_round_trip() {
        let repo = WorkspaceRepository::new(MemoryStore::new());
        let payload = UploadPayload::parse(r#"{"data":{"events":[{"summary":"A"}]}}"#).unwrap();
        repo.save_upload(&payload).unwrap();
        assert_eq!(repo.load_upload().unwrap(), Some(payload));
        repo.clear_upload().unwrap();
        assert_eq!(repo.load_upload().unwrap(), None);
    }
}
