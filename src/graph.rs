use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calendar::{CalendarEvent, EventInstant};
use crate::error::{Result, WorkspaceError};
use crate::layout::LayoutConfig;
use crate::{APPENDED_NODE_GAP, Point};

pub const DAY_KEY_FORMAT: &str = "%m-%d-%Y";
pub const ROOT_NODE_ID: &str = "root";
const INVALID_DAY_KEY: &str = "Invalid Date";

/// How uploaded events are turned into a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// One precedence chain over every event.
    #[default]
    Chain,
    /// One chain per calendar day under a root named after the schedule.
    Grouped,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Chain => f.write_str("chain"),
            BuildMode::Grouped => f.write_str("grouped"),
        }
    }
}

impl FromStr for BuildMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "chain" => Ok(BuildMode::Chain),
            "grouped" | "day" => Ok(BuildMode::Grouped),
            other => bail!("unknown build mode '{other}'; expected 'chain' or 'grouped'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Root,
    Event,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Event => "event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    #[serde(default)]
    pub position: Point,
    /// Hex color from the weekday palette.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight: Option<String>,
    #[serde(default)]
    pub selected: bool,
    #[serde(default)]
    pub start: EventInstant,
    #[serde(default)]
    pub end: EventInstant,
}

impl GraphNode {
    pub fn root(id: impl Into<String>, label: impl Into<String>) -> Self {
        GraphNode {
            id: id.into(),
            kind: NodeKind::Root,
            label: label.into(),
            position: Point::ORIGIN,
            highlight: None,
            selected: false,
            start: EventInstant::INVALID,
            end: EventInstant::INVALID,
        }
    }

    pub fn from_event(event: &CalendarEvent) -> Self {
        GraphNode {
            id: event_node_id(event),
            kind: NodeKind::Event,
            label: event.summary.clone(),
            position: Point::ORIGIN,
            highlight: None,
            selected: false,
            start: event.start,
            end: event.end,
        }
    }

    pub fn is_root(&self) -> bool {
        self.kind == NodeKind::Root
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
}

impl GraphEdge {
    pub fn new(source_id: &str, target_id: &str) -> Self {
        GraphEdge {
            id: edge_identifier(source_id, target_id),
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
        }
    }
}

pub fn edge_identifier(source_id: &str, target_id: &str) -> String {
    format!("e-{source_id}-{target_id}")
}

pub fn event_node_id(event: &CalendarEvent) -> String {
    format!("event-{}", event.id)
}

pub fn day_key(date: NaiveDate) -> String {
    date.format(DAY_KEY_FORMAT).to_string()
}

/// A captured `{nodes, edges}` pair; the unit of persistence and undo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl WorkspaceSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut GraphNode> {
        self.nodes.iter_mut().find(|node| node.id == id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn edge(&self, id: &str) -> Option<&GraphEdge> {
        self.edges.iter().find(|edge| edge.id == id)
    }

    pub fn has_edge(&self, source_id: &str, target_id: &str) -> bool {
        self.edges
            .iter()
            .any(|edge| edge.source_id == source_id && edge.target_id == target_id)
    }

    /// Checks unique node ids, unique `(source, target)` pairs and that every
    /// edge endpoint exists.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(WorkspaceError::DuplicateNode(node.id.clone()));
            }
        }

        let mut pairs = HashSet::new();
        for edge in &self.edges {
            for endpoint in [&edge.source_id, &edge.target_id] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(WorkspaceError::UnknownNode(endpoint.clone()));
                }
            }
            if !pairs.insert((edge.source_id.as_str(), edge.target_id.as_str())) {
                return Err(WorkspaceError::DuplicateEdge(edge.id.clone()));
            }
        }

        Ok(())
    }

    /// Adds `source -> target` unless that pair is already connected.
    /// Returns whether a new edge was created.
    pub fn connect(&mut self, source_id: &str, target_id: &str) -> Result<bool> {
        for id in [source_id, target_id] {
            if !self.contains_node(id) {
                return Err(WorkspaceError::UnknownNode(id.to_string()));
            }
        }
        if self.has_edge(source_id, target_id) {
            return Ok(false);
        }
        self.edges.push(GraphEdge::new(source_id, target_id));
        Ok(true)
    }

    pub fn disconnect(&mut self, edge_id: &str) -> Result<GraphEdge> {
        let index = self
            .edges
            .iter()
            .position(|edge| edge.id == edge_id)
            .ok_or_else(|| WorkspaceError::UnknownEdge(edge_id.to_string()))?;
        Ok(self.edges.remove(index))
    }

    pub fn move_node(&mut self, node_id: &str, position: Point) -> Result<()> {
        let node = self
            .node_mut(node_id)
            .ok_or_else(|| WorkspaceError::UnknownNode(node_id.to_string()))?;
        node.position = position;
        Ok(())
    }

    pub fn rename_node(&mut self, node_id: &str, label: &str) -> Result<()> {
        let label = label.trim();
        if label.is_empty() {
            return Err(WorkspaceError::EmptyLabel);
        }
        let node = self
            .node_mut(node_id)
            .ok_or_else(|| WorkspaceError::UnknownNode(node_id.to_string()))?;
        node.label = label.to_string();
        Ok(())
    }

    /// Drops the node and every edge touching it.
    pub fn remove_node(&mut self, node_id: &str) -> Result<()> {
        let before = self.nodes.len();
        self.nodes.retain(|node| node.id != node_id);
        if self.nodes.len() == before {
            return Err(WorkspaceError::UnknownNode(node_id.to_string()));
        }
        self.edges
            .retain(|edge| edge.source_id != node_id && edge.target_id != node_id);
        Ok(())
    }
}

/// Ascending by start; invalid starts go last, input order breaks ties.
fn compare_starts(a: &CalendarEvent, b: &CalendarEvent) -> Ordering {
    match (a.start.get(), b.start.get()) {
        (Some(lhs), Some(rhs)) => lhs.cmp(&rhs),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn sort_by_start(events: &[CalendarEvent]) -> Vec<&CalendarEvent> {
    let mut sorted: Vec<&CalendarEvent> = events.iter().collect();
    sorted.sort_by(|a, b| compare_starts(a, b));
    sorted
}

/// Nearest-predecessor rule: each event gets at most one incoming edge, from
/// the closest earlier event (in sorted order) that ends by its start.
fn precedence_edges(sorted: &[&CalendarEvent]) -> Vec<GraphEdge> {
    let mut edges = Vec::new();
    for (i, current) in sorted.iter().enumerate() {
        if let Some(previous) = sorted[..i]
            .iter()
            .rev()
            .find(|candidate| candidate.end.at_or_before(&current.start))
        {
            edges.push(GraphEdge::new(
                &event_node_id(previous),
                &event_node_id(current),
            ));
        }
    }
    edges
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DayBucket {
    Date(NaiveDate),
    Invalid,
}

impl DayBucket {
    fn label(&self) -> String {
        match self {
            DayBucket::Date(date) => day_key(*date),
            DayBucket::Invalid => INVALID_DAY_KEY.to_string(),
        }
    }
}

/// Turns events into `{nodes, edges}`; positions are left at the origin for
/// the layout step.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    zone: FixedOffset,
    layout: LayoutConfig,
}

impl GraphBuilder {
    pub fn new(zone: FixedOffset, layout: LayoutConfig) -> Self {
        Self { zone, layout }
    }

    pub fn zone(&self) -> FixedOffset {
        self.zone
    }

    /// One chain over every event, sorted by start.
    pub fn build(&self, events: &[CalendarEvent]) -> WorkspaceSnapshot {
        let sorted = sort_by_start(events);
        let nodes = sorted.iter().map(|event| GraphNode::from_event(event)).collect();
        let edges = precedence_edges(&sorted);
        tracing::debug!(events = events.len(), edges = edges.len(), "built event graph");
        WorkspaceSnapshot { nodes, edges }
    }

    /// Chains each calendar day on its own. With a `root_label`, a single
    /// root node is added and linked to the head of every chain.
    pub fn build_grouped(
        &self,
        events: &[CalendarEvent],
        root_label: Option<&str>,
    ) -> WorkspaceSnapshot {
        let mut buckets: BTreeMap<DayBucket, Vec<CalendarEvent>> = BTreeMap::new();
        for event in events {
            let bucket = event
                .start
                .local_date(self.zone)
                .map_or(DayBucket::Invalid, DayBucket::Date);
            buckets.entry(bucket).or_default().push(event.clone());
        }

        let mut snapshot = WorkspaceSnapshot::default();
        if let Some(label) = root_label {
            snapshot.nodes.push(GraphNode::root(ROOT_NODE_ID, label));
        }

        for (bucket, day_events) in &buckets {
            let day = self.build(day_events);
            tracing::trace!(day = %bucket.label(), nodes = day.nodes.len(), "built day bucket");

            if root_label.is_some() {
                let has_predecessor: HashSet<&str> = day
                    .edges
                    .iter()
                    .map(|edge| edge.target_id.as_str())
                    .collect();
                let chain_heads = day
                    .nodes
                    .iter()
                    .filter(|node| !has_predecessor.contains(node.id.as_str()));
                for node in chain_heads {
                    snapshot.edges.push(GraphEdge::new(ROOT_NODE_ID, &node.id));
                }
            }

            snapshot.nodes.extend(day.nodes);
            snapshot.edges.extend(day.edges);
        }

        snapshot
    }

    pub fn build_mode(
        &self,
        events: &[CalendarEvent],
        mode: BuildMode,
        root_label: &str,
    ) -> WorkspaceSnapshot {
        match mode {
            BuildMode::Chain => self.build(events),
            BuildMode::Grouped => self.build_grouped(events, Some(root_label)),
        }
    }

    /// The chain for one calendar day; an unknown day gives an empty graph.
    pub fn build_for_date(&self, events: &[CalendarEvent], date: NaiveDate) -> WorkspaceSnapshot {
        let day_events: Vec<CalendarEvent> = events
            .iter()
            .filter(|event| event.start.local_date(self.zone) == Some(date))
            .cloned()
            .collect();
        self.build(&day_events)
    }

    /// Distinct `MM-DD-YYYY` keys of the days that have events, in date order.
    pub fn available_dates(&self, events: &[CalendarEvent]) -> Vec<String> {
        let dates: std::collections::BTreeSet<NaiveDate> = events
            .iter()
            .filter_map(|event| event.start.local_date(self.zone))
            .collect();
        dates.into_iter().map(day_key).collect()
    }

    /// Appends one manually created node, plus an edge from `parent_id` when
    /// given. Existing nodes and edges are left untouched.
    pub fn add_node(
        &self,
        snapshot: &mut WorkspaceSnapshot,
        label: &str,
        kind: NodeKind,
        parent_id: Option<&str>,
    ) -> Result<String> {
        let label = label.trim();
        if label.is_empty() {
            return Err(WorkspaceError::EmptyLabel);
        }
        if let Some(parent) = parent_id {
            if !snapshot.contains_node(parent) {
                return Err(WorkspaceError::UnknownNode(parent.to_string()));
            }
        }

        let position = snapshot
            .nodes
            .last()
            .map(|last| Point {
                x: last.position.x,
                y: last.position.y + self.layout.node_height + APPENDED_NODE_GAP,
            })
            .unwrap_or(Point::ORIGIN);

        let id = format!("node-{}", Uuid::new_v4().simple());
        let mut node = match kind {
            NodeKind::Root => GraphNode::root(id.clone(), label),
            NodeKind::Event => GraphNode {
                kind: NodeKind::Event,
                ..GraphNode::root(id.clone(), label)
            },
        };
        node.position = position;
        snapshot.nodes.push(node);

        if let Some(parent) = parent_id {
            snapshot.edges.push(GraphEdge::new(parent, &id));
        }

        Ok(id)
    }
}
