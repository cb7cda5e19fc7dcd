//! Calendar uploads in, laid-out event graphs out.
//!
//! An uploaded `.ics` file is parsed by an external backend. Its JSON answer
//! is normalized into [`CalendarEvent`]s, chained into a precedence graph,
//! positioned by a layered layout, highlighted against a reference date and
//! kept undoable through [`History`].

pub mod calendar;
pub mod config;
pub mod error;
pub mod graph;
pub mod history;
pub mod layout;
pub mod selection;
#[cfg(feature = "server")]
pub mod serve;
pub mod store;
pub mod upload;
pub mod workspace;

use serde::{Deserialize, Serialize};

pub const NODE_WIDTH: f32 = 190.0;
pub const NODE_HEIGHT: f32 = 70.0;
pub const RANK_SEPARATION: f32 = 50.0;
pub const NODE_SEPARATION: f32 = 50.0;
pub const APPENDED_NODE_GAP: f32 = 80.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

pub use calendar::{CalendarEvent, EventInstant, ParseResult, RawEvent, UploadPayload};
pub use config::WorkspaceConfig;
pub use error::{Result, WorkspaceError};
pub use graph::{
    BuildMode, GraphBuilder, GraphEdge, GraphNode, NodeKind, WorkspaceSnapshot, edge_identifier,
};
pub use history::{Checkpoint, History};
pub use layout::{LayeredLayout, LayoutConfig, LayoutEngine};
pub use selection::{HIGHLIGHT_PALETTE, SelectionPolicy};
pub use store::{FileStore, KeyValueStore, MemoryStore, WorkspaceRepository};
pub use upload::{UploadClient, validate_calendar_file};
pub use workspace::{Workspace, WorkspaceSettings};
