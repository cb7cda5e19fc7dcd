use std::collections::{HashMap, HashSet};

use dugong::graphlib::{Graph, GraphOptions};
use dugong::{EdgeLabel, GraphLabel, NodeLabel, RankDir};
use serde::{Deserialize, Serialize};

use crate::graph::{GraphEdge, GraphNode, WorkspaceSnapshot};
use crate::{NODE_HEIGHT, NODE_SEPARATION, NODE_WIDTH, Point, RANK_SEPARATION};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankDirection {
    #[default]
    TopBottom,
    BottomTop,
    LeftRight,
    RightLeft,
}

impl RankDirection {
    fn rankdir(self) -> RankDir {
        match self {
            RankDirection::TopBottom => RankDir::TB,
            RankDirection::BottomTop => RankDir::BT,
            RankDirection::LeftRight => RankDir::LR,
            RankDirection::RightLeft => RankDir::RL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutConfig {
    pub direction: RankDirection,
    pub node_width: f32,
    pub node_height: f32,
    /// Gap between consecutive ranks.
    pub rank_separation: f32,
    /// Gap between neighbours within a rank.
    pub node_separation: f32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            direction: RankDirection::TopBottom,
            node_width: NODE_WIDTH,
            node_height: NODE_HEIGHT,
            rank_separation: RANK_SEPARATION,
            node_separation: NODE_SEPARATION,
        }
    }
}

/// Boundary to whatever positions the graph. Implementations must be pure:
/// the same nodes and edges always produce the same centers.
pub trait LayoutEngine {
    /// Center point for every node id.
    fn positions(&self, nodes: &[GraphNode], edges: &[GraphEdge]) -> HashMap<String, Point>;

    /// Copies of `nodes` with `position` filled in; inputs are not touched.
    fn layout(&self, nodes: &[GraphNode], edges: &[GraphEdge]) -> Vec<GraphNode> {
        let positions = self.positions(nodes, edges);
        nodes
            .iter()
            .map(|node| {
                let mut placed = node.clone();
                if let Some(point) = positions.get(&node.id) {
                    placed.position = *point;
                }
                placed
            })
            .collect()
    }

    fn layout_snapshot(&self, snapshot: &WorkspaceSnapshot) -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            nodes: self.layout(&snapshot.nodes, &snapshot.edges),
            edges: snapshot.edges.clone(),
        }
    }
}

/// Dagre layered layout through `dugong`.
#[derive(Debug, Clone, Default)]
pub struct LayeredLayout {
    config: LayoutConfig,
}

impl LayeredLayout {
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    fn graph(
        &self,
        nodes: &[GraphNode],
        edges: &[GraphEdge],
    ) -> Graph<NodeLabel, EdgeLabel, GraphLabel> {
        let config = &self.config;
        let mut g = Graph::<NodeLabel, EdgeLabel, GraphLabel>::new(GraphOptions::default());
        g.set_graph(GraphLabel {
            rankdir: config.direction.rankdir(),
            nodesep: f64::from(config.node_separation),
            ranksep: f64::from(config.rank_separation),
            ..Default::default()
        });

        for node in nodes {
            g.set_node(
                node.id.clone(),
                NodeLabel {
                    width: f64::from(config.node_width),
                    height: f64::from(config.node_height),
                    ..Default::default()
                },
            );
        }

        // Edges to unknown ids would make dugong invent zero-sized nodes.
        let known: HashSet<&str> = nodes.iter().map(|node| node.id.as_str()).collect();
        for edge in edges {
            let linked = known.contains(edge.source_id.as_str())
                && known.contains(edge.target_id.as_str());
            if !linked {
                continue;
            }
            g.set_edge_with_label(
                edge.source_id.clone(),
                edge.target_id.clone(),
                EdgeLabel {
                    minlen: 1,
                    weight: 1.0,
                    ..Default::default()
                },
            );
        }
        g
    }
}

impl LayoutEngine for LayeredLayout {
    fn positions(&self, nodes: &[GraphNode], edges: &[GraphEdge]) -> HashMap<String, Point> {
        let mut positions = HashMap::new();
        if nodes.is_empty() {
            return positions;
        }

        let mut g = self.graph(nodes, edges);
        dugong::layout(&mut g);

        for node in nodes {
            let Some(label) = g.node(&node.id) else {
                continue;
            };
            let x = label.x.unwrap_or(0.0) as f32;
            let y = label.y.unwrap_or(0.0) as f32;
            positions.insert(node.id.clone(), Point::new(x, y));
        }
        positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<GraphNode> {
        ids.iter().map(|id| GraphNode::root(*id, id.to_uppercase())).collect()
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 0.01
    }

    #[test]
    fn chain_is_stacked_top_to_bottom() {
        let nodes = nodes(&["a", "b", "c"]);
        let edges = vec![GraphEdge::new("a", "b"), GraphEdge::new("b", "c")];
        let placed = LayeredLayout::default().layout(&nodes, &edges);

        let step = NODE_HEIGHT + RANK_SEPARATION;
        assert!(close(placed[1].position.y - placed[0].position.y, step));
        assert!(close(placed[2].position.y - placed[1].position.y, step));
        assert!(placed.iter().all(|n| close(n.position.x, placed[0].position.x)));
        assert!(nodes.iter().all(|n| n.position == Point::ORIGIN), "inputs untouched");
    }

    #[test]
    fn siblings_share_a_rank() {
        let nodes = nodes(&["root", "x", "y"]);
        let edges = vec![GraphEdge::new("root", "x"), GraphEdge::new("root", "y")];
        let positions = LayeredLayout::default().positions(&nodes, &edges);

        let root = positions["root"];
        let (x, y) = (positions["x"], positions["y"]);
        assert!(close(x.y, y.y));
        assert!(x.y > root.y);
        assert!(close((y.x - x.x).abs(), NODE_WIDTH + NODE_SEPARATION));
        assert!(root.x >= x.x.min(y.x) && root.x <= x.x.max(y.x));
    }

    #[test]
    fn same_input_same_output() {
        let nodes = nodes(&["a", "b", "c", "d"]);
        let edges = vec![
            GraphEdge::new("a", "c"),
            GraphEdge::new("b", "c"),
            GraphEdge::new("c", "d"),
        ];
        let engine = LayeredLayout::default();
        assert_eq!(engine.layout(&nodes, &edges), engine.layout(&nodes, &edges));
    }

    #[test]
    fn cycles_and_dangling_edges_still_place_every_node() {
        let nodes = nodes(&["a", "b", "c"]);
        let edges = vec![
            GraphEdge::new("a", "b"),
            GraphEdge::new("b", "c"),
            GraphEdge::new("c", "b"),
            GraphEdge::new("c", "ghost"),
        ];
        let positions = LayeredLayout::default().positions(&nodes, &edges);
        assert_eq!(positions.len(), 3);
        assert!(!positions.contains_key("ghost"));
        assert!(positions["b"].y > positions["a"].y);
    }

    #[test]
    fn left_right_swaps_axes() {
        let nodes = nodes(&["a", "b"]);
        let edges = vec![GraphEdge::new("a", "b")];
        let engine = LayeredLayout::new(LayoutConfig {
            direction: RankDirection::LeftRight,
            ..LayoutConfig::default()
        });
        let positions = engine.positions(&nodes, &edges);
        assert!(close(positions["a"].y, positions["b"].y));
        assert!(close(positions["b"].x - positions["a"].x, NODE_WIDTH + RANK_SEPARATION));
    }

    #[test]
    fn empty_graph_has_no_positions() {
        assert!(LayeredLayout::default().positions(&[], &[]).is_empty());
    }
}
