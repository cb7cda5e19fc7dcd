use std::fmt;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::Point;
use crate::calendar::{CalendarEvent, UploadPayload, merge_uploads};
use crate::config::WorkspaceConfig;
use crate::error::Result;
pub use crate::graph::BuildMode;
use crate::graph::{GraphBuilder, GraphEdge, GraphNode, NodeKind, WorkspaceSnapshot};
use crate::history::History;
use crate::layout::{LayeredLayout, LayoutEngine};
use crate::selection::{SelectionPolicy, apply_selection};
use crate::store::{KeyValueStore, WorkspaceRepository};

/// Session choices that survive a restart alongside the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceSettings {
    pub mode: BuildMode,
    pub reference_date: Option<NaiveDate>,
    pub policy: SelectionPolicy,
}

/// One user's graph session. Every mutation works on a copy of the live
/// snapshot and only replaces it once the change succeeded and was recorded.
pub struct Workspace<S> {
    config: WorkspaceConfig,
    builder: GraphBuilder,
    layout: Box<dyn LayoutEngine + Send + Sync>,
    history: History<S>,
    live: WorkspaceSnapshot,
    reference_date: Option<NaiveDate>,
    policy: SelectionPolicy,
    mode: BuildMode,
}

impl<S> fmt::Debug for Workspace<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("nodes", &self.live.nodes.len())
            .field("edges", &self.live.edges.len())
            .field("reference_date", &self.reference_date)
            .field("policy", &self.policy)
            .field("mode", &self.mode)
            .finish()
    }
}

impl<S: KeyValueStore> Workspace<S> {
    /// Restores the persisted snapshot and settings. Without a snapshot, the
    /// stored upload is rebuilt; without that, the workspace starts empty.
    pub fn open(store: S, config: WorkspaceConfig) -> Result<Self> {
        let repository = WorkspaceRepository::new(store);
        let loaded = repository.load()?;
        let settings = repository.load_settings()?.unwrap_or(WorkspaceSettings {
            policy: config.selection_policy,
            ..WorkspaceSettings::default()
        });
        let history =
            History::resume(repository, config.history_limit, loaded.as_ref(), settings.mode)?;

        let mut workspace = Self {
            builder: GraphBuilder::new(config.zone, config.layout),
            layout: Box::new(LayeredLayout::new(config.layout)),
            policy: settings.policy,
            history,
            live: loaded.clone().unwrap_or_default(),
            reference_date: settings.reference_date,
            mode: settings.mode,
            config,
        };

        if loaded.is_none() {
            if let Some(upload) = workspace.history.repository().load_upload()? {
                tracing::info!("no saved layout; rebuilding from stored upload");
                let next = workspace.build_from(&upload);
                workspace.commit(next)?;
            }
        }

        Ok(workspace)
    }

    pub fn with_layout_engine(mut self, engine: impl LayoutEngine + Send + Sync + 'static) -> Self {
        self.layout = Box::new(engine);
        self
    }

    /// Build mode for the next rebuild; the live graph is left as it is.
    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn snapshot(&self) -> &WorkspaceSnapshot {
        &self.live
    }

    pub fn history(&self) -> &History<S> {
        &self.history
    }

    pub fn reference_date(&self) -> Option<NaiveDate> {
        self.reference_date
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub fn settings(&self) -> WorkspaceSettings {
        WorkspaceSettings {
            mode: self.mode,
            reference_date: self.reference_date,
            policy: self.policy,
        }
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    /// Events of the stored upload, empty when nothing was uploaded.
    pub fn events(&self) -> Result<Vec<CalendarEvent>> {
        Ok(self
            .history
            .repository()
            .load_upload()?
            .map(|upload| upload.events(self.config.zone))
            .unwrap_or_default())
    }

    pub fn available_dates(&self) -> Result<Vec<String>> {
        Ok(self.builder.available_dates(&self.events()?))
    }

    /// Laid-out chain of a single day. Read-only: nothing is recorded.
    pub fn day_view(&self, date: NaiveDate) -> Result<WorkspaceSnapshot> {
        let graph = self.builder.build_for_date(&self.events()?, date);
        Ok(self.place(graph))
    }

    /// Replaces the stored upload and rebuilds the graph from it.
    pub fn ingest_upload(&mut self, payload: UploadPayload) -> Result<&WorkspaceSnapshot> {
        self.history.repository().save_upload(&payload)?;
        let next = self.build_from(&payload);
        self.commit(next)?;
        Ok(&self.live)
    }

    /// Adds `payload` to the stored upload, then rebuilds from the union.
    pub fn append_upload(&mut self, payload: UploadPayload) -> Result<&WorkspaceSnapshot> {
        let existing = self.history.repository().load_upload_raw()?;
        let merged = merge_uploads(existing.as_deref(), payload);
        self.ingest_upload(merged)
    }

    /// Like [`Workspace::ingest_upload`] for a raw response body. A body
    /// without usable events produces an empty graph instead of an error.
    pub fn ingest_raw(&mut self, raw: &str, append: bool) -> Result<&WorkspaceSnapshot> {
        let payload = match UploadPayload::parse(raw) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "upload body has no usable events");
                UploadPayload::default()
            }
        };
        if append {
            self.append_upload(payload)
        } else {
            self.ingest_upload(payload)
        }
    }

    /// Throws away manual edits and rebuilds from the stored upload.
    pub fn rebuild(&mut self) -> Result<&WorkspaceSnapshot> {
        let upload = self.history.repository().load_upload()?.unwrap_or_default();
        let next = self.build_from(&upload);
        self.commit(next)?;
        Ok(&self.live)
    }

    pub fn set_mode(&mut self, mode: BuildMode) -> Result<&WorkspaceSnapshot> {
        self.mode = mode;
        self.rebuild()
    }

    pub fn set_reference_date(&mut self, date: NaiveDate) -> Result<()> {
        self.reference_date = Some(date);
        self.save_settings()?;
        self.reselect()
    }

    pub fn set_policy(&mut self, policy: SelectionPolicy) -> Result<()> {
        self.policy = policy;
        self.save_settings()?;
        self.reselect()
    }

    /// Appends a node below the last one and returns its id.
    pub fn add_node(
        &mut self,
        label: &str,
        kind: NodeKind,
        parent_id: Option<&str>,
    ) -> Result<String> {
        let builder = self.builder.clone();
        self.mutate(|snapshot| builder.add_node(snapshot, label, kind, parent_id))
    }

    /// `false` when the edge already existed; nothing is recorded then.
    pub fn connect(&mut self, source_id: &str, target_id: &str) -> Result<bool> {
        let mut next = self.live.clone();
        if !next.connect(source_id, target_id)? {
            return Ok(false);
        }
        self.commit(next)?;
        Ok(true)
    }

    pub fn disconnect(&mut self, edge_id: &str) -> Result<GraphEdge> {
        self.mutate(|snapshot| snapshot.disconnect(edge_id))
    }

    pub fn move_node(&mut self, node_id: &str, position: Point) -> Result<()> {
        self.mutate(|snapshot| snapshot.move_node(node_id, position))
    }

    pub fn rename_node(&mut self, node_id: &str, label: &str) -> Result<()> {
        self.mutate(|snapshot| snapshot.rename_node(node_id, label))
    }

    pub fn remove_node(&mut self, node_id: &str) -> Result<()> {
        self.mutate(|snapshot| snapshot.remove_node(node_id))
    }

    /// `true` if an earlier state was restored. The restored graph gets the
    /// build mode it was made under and the current selection.
    pub fn undo(&mut self) -> Result<bool> {
        let Some(restored) = self.history.undo()? else {
            return Ok(false);
        };
        self.mode = restored.mode;
        self.save_settings()?;
        self.live = restored.snapshot;
        self.reselect()?;
        Ok(true)
    }

    /// Drops the saved layout and the undo stack, then starts over from the
    /// stored upload if there is one.
    pub fn reset(&mut self) -> Result<&WorkspaceSnapshot> {
        self.history.clear()?;
        self.live = WorkspaceSnapshot::default();
        if let Some(upload) = self.history.repository().load_upload()? {
            let next = self.build_from(&upload);
            self.commit(next)?;
        }
        tracing::info!(nodes = self.live.nodes.len(), "workspace reset");
        Ok(&self.live)
    }

    fn effective_reference(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| Utc::now().with_timezone(&self.config.zone).date_naive())
    }

    fn place(&self, graph: WorkspaceSnapshot) -> WorkspaceSnapshot {
        let mut placed = self.layout.layout_snapshot(&graph);
        self.select(&mut placed.nodes);
        placed
    }

    fn select(&self, nodes: &mut [GraphNode]) {
        apply_selection(
            nodes,
            Some(self.effective_reference()),
            self.policy,
            self.config.zone,
        );
    }

    fn build_from(&self, upload: &UploadPayload) -> WorkspaceSnapshot {
        let events = upload.events(self.config.zone);
        let graph = self
            .builder
            .build_mode(&events, self.mode, &self.config.schedule_name);
        tracing::info!(
            events = events.len(),
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            mode = %self.mode,
            "built graph from upload"
        );
        self.place(graph)
    }

    fn mutate<T>(&mut self, change: impl FnOnce(&mut WorkspaceSnapshot) -> Result<T>) -> Result<T> {
        let mut next = self.live.clone();
        let outcome = change(&mut next)?;
        self.select(&mut next.nodes);
        self.commit(next)?;
        Ok(outcome)
    }

    /// Re-highlights the live graph in place; not an undo step.
    fn reselect(&mut self) -> Result<()> {
        let mut next = self.live.clone();
        self.select(&mut next.nodes);
        if next != self.live {
            self.history.replace_current(next.clone(), self.mode)?;
            self.live = next;
        }
        Ok(())
    }

    fn commit(&mut self, next: WorkspaceSnapshot) -> Result<()> {
        self.history.snapshot(next.clone(), self.mode)?;
        self.save_settings()?;
        self.live = next;
        Ok(())
    }

    fn save_settings(&self) -> Result<()> {
        self.history.repository().save_settings(&self.settings())
    }
}
