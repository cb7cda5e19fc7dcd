use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::{BuildMode, WorkspaceSnapshot};
use crate::store::{KeyValueStore, WorkspaceRepository};

/// One undo step: the graph plus the build mode it was produced under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub snapshot: WorkspaceSnapshot,
    #[serde(default)]
    pub mode: BuildMode,
}

impl Checkpoint {
    pub fn new(snapshot: WorkspaceSnapshot, mode: BuildMode) -> Self {
        Self { snapshot, mode }
    }
}

/// Bounded undo stack whose top is always the live state. Every push and
/// every undo is written through to the repository.
#[derive(Debug)]
pub struct History<S> {
    entries: VecDeque<Checkpoint>,
    limit: usize,
    repository: WorkspaceRepository<S>,
}

impl<S: KeyValueStore> History<S> {
    pub fn new(repository: WorkspaceRepository<S>, limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(2),
            repository,
        }
    }

    /// Picks the persisted stack back up. `current` wins over a stack whose
    /// top disagrees with it.
    pub fn resume(
        repository: WorkspaceRepository<S>,
        limit: usize,
        current: Option<&WorkspaceSnapshot>,
        mode: BuildMode,
    ) -> Result<Self> {
        let mut history = Self::new(repository, limit);
        let mut entries = history.repository.load_history()?;
        if let Some(current) = current {
            if entries.back().map(|top| &top.snapshot) != Some(current) {
                entries = VecDeque::from([Checkpoint::new(current.clone(), mode)]);
            }
        } else {
            entries.clear();
        }
        history.entries = entries;
        history.trim();
        Ok(history)
    }

    pub fn repository(&self) -> &WorkspaceRepository<S> {
        &self.repository
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn current(&self) -> Option<&Checkpoint> {
        self.entries.back()
    }

    pub fn can_undo(&self) -> bool {
        self.entries.len() >= 2
    }

    /// Records `snapshot` as the new live state and persists it.
    pub fn snapshot(&mut self, snapshot: WorkspaceSnapshot, mode: BuildMode) -> Result<()> {
        self.repository.save(&snapshot)?;
        self.entries.push_back(Checkpoint::new(snapshot, mode));
        self.trim();
        self.repository.save_history(&self.entries)?;
        tracing::debug!(depth = self.entries.len(), "snapshot recorded");
        Ok(())
    }

    /// Overwrites the live state in place; used for changes that are not
    /// undo steps of their own.
    pub fn replace_current(&mut self, snapshot: WorkspaceSnapshot, mode: BuildMode) -> Result<()> {
        self.repository.save(&snapshot)?;
        let checkpoint = Checkpoint::new(snapshot, mode);
        match self.entries.back_mut() {
            Some(top) => *top = checkpoint,
            None => self.entries.push_back(checkpoint),
        }
        self.repository.save_history(&self.entries)?;
        Ok(())
    }

    /// Drops the live state and returns the one before it, which becomes
    /// live. `None` when there is nothing to go back to.
    pub fn undo(&mut self) -> Result<Option<Checkpoint>> {
        if !self.can_undo() {
            tracing::debug!(depth = self.entries.len(), "nothing to undo");
            return Ok(None);
        }

        self.entries.pop_back();
        let Some(restored) = self.entries.back().cloned() else {
            return Ok(None);
        };
        self.repository.save(&restored.snapshot)?;
        self.repository.save_history(&self.entries)?;
        tracing::info!(
            depth = self.entries.len(),
            mode = %restored.mode,
            "restored previous snapshot"
        );
        Ok(Some(restored))
    }

    /// Forgets every entry and the persisted state.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.repository.clear()?;
        self.repository.clear_history()?;
        Ok(())
    }

    fn trim(&mut self) {
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }
}
