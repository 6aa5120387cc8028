//! Camera adjacency graph.
//!
//! Nodes are camera ids; edges say a subject leaving one camera can plausibly
//! show up at another, optionally within a transition-time window. The graph
//! is keyed by id strings, never by references, and is immutable once built.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::TopologyConfig;
use crate::error::{HandoverError, Result};

/// Expected latency range, in seconds, for a real handoff along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransitionWindow {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl TransitionWindow {
    pub fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    /// Inclusive on both ends.
    pub fn contains(&self, elapsed: f64) -> bool {
        elapsed >= self.min_secs && elapsed <= self.max_secs
    }
}

/// Immutable camera adjacency.
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    nodes: BTreeSet<String>,
    // from -> to -> window
    edges: BTreeMap<String, BTreeMap<String, Option<TransitionWindow>>>,
}

impl TopologyGraph {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Builds the graph from configuration plus cameras registered on the
    /// command line.
    pub fn from_config(cfg: &TopologyConfig, extra_cameras: &[String]) -> Result<Self> {
        let mut b = TopologyGraph::builder();
        for cam in cfg.cameras.iter().chain(extra_cameras.iter()) {
            b = b.camera(cam);
        }
        for edge in &cfg.edges {
            b = if edge.directed {
                b.directed_edge(&edge.from, &edge.to, edge.window)
            } else {
                b.edge(&edge.from, &edge.to, edge.window)
            };
        }
        b.build()
    }

    pub fn contains(&self, camera: &str) -> bool {
        self.nodes.contains(camera)
    }

    /// True if a subject can hand off from `from` to `to`.
    pub fn adjacent(&self, from: &str, to: &str) -> bool {
        self.edges
            .get(from)
            .is_some_and(|targets| targets.contains_key(to))
    }

    /// Window configured on the `from -> to` edge, if any.
    pub fn transition_window(&self, from: &str, to: &str) -> Option<TransitionWindow> {
        self.edges.get(from)?.get(to).copied().flatten()
    }

    /// Cameras that can hand off to `camera`, plus `camera` itself.
    pub fn candidate_sources(&self, camera: &str) -> BTreeSet<&str> {
        let mut out: BTreeSet<&str> = self
            .edges
            .iter()
            .filter(|(_, targets)| targets.contains_key(camera))
            .map(|(from, _)| from.as_str())
            .collect();
        if let Some(c) = self.nodes.get(camera) {
            out.insert(c.as_str());
        }
        out
    }

    pub fn cameras(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All directed edges as `(from, to, window)`.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str, Option<TransitionWindow>)> {
        self.edges.iter().flat_map(|(from, targets)| {
            targets
                .iter()
                .map(move |(to, w)| (from.as_str(), to.as_str(), *w))
        })
    }
}

/// Collects cameras and edges, then validates them into a [`TopologyGraph`].
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    nodes: BTreeSet<String>,
    edges: Vec<(String, String, Option<TransitionWindow>)>,
}

impl TopologyBuilder {
    pub fn camera(mut self, id: &str) -> Self {
        self.nodes.insert(id.to_string());
        self
    }

    /// Adds an edge in both directions.
    pub fn edge(self, a: &str, b: &str, window: Option<TransitionWindow>) -> Self {
        self.directed_edge(a, b, window).directed_edge(b, a, window)
    }

    pub fn directed_edge(mut self, from: &str, to: &str, window: Option<TransitionWindow>) -> Self {
        self.edges.push((from.to_string(), to.to_string(), window));
        self
    }

    pub fn build(self) -> Result<TopologyGraph> {
        let mut edges: BTreeMap<String, BTreeMap<String, Option<TransitionWindow>>> =
            BTreeMap::new();
        for (from, to, window) in self.edges {
            for cam in [&from, &to] {
                if !self.nodes.contains(cam) {
                    return Err(HandoverError::InvalidConfig(format!(
                        "edge {from} -> {to} references unknown camera {cam}"
                    )));
                }
            }
            if from == to {
                return Err(HandoverError::InvalidConfig(format!(
                    "self-loop on camera {from}"
                )));
            }
            if let Some(w) = window {
                if !(w.min_secs.is_finite() && w.max_secs.is_finite())
                    || w.min_secs < 0.0
                    || w.min_secs > w.max_secs
                {
                    return Err(HandoverError::InvalidConfig(format!(
                        "bad transition window on {from} -> {to}: [{}, {}]",
                        w.min_secs, w.max_secs
                    )));
                }
            }
            edges.entry(from).or_default().insert(to, window);
        }
        Ok(TopologyGraph {
            nodes: self.nodes,
            edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line() -> TopologyGraph {
        TopologyGraph::builder()
            .camera("a")
            .camera("b")
            .camera("c")
            .edge("a", "b", Some(TransitionWindow::new(1.0, 10.0)))
            .edge("b", "c", None)
            .build()
            .unwrap()
    }

    #[test]
    fn adjacency_is_symmetric_for_undirected_edges() {
        let g = line();
        assert!(g.adjacent("a", "b"));
        assert!(g.adjacent("b", "a"));
        assert!(g.adjacent("c", "b"));
        assert!(!g.adjacent("a", "c"));
        assert!(!g.adjacent("a", "a"));
    }

    #[test]
    fn windows() {
        let g = line();
        let w = g.transition_window("b", "a").unwrap();
        assert!(w.contains(1.0));
        assert!(w.contains(10.0));
        assert!(!w.contains(10.5));
        assert!(g.transition_window("b", "c").is_none());
        assert!(g.transition_window("a", "c").is_none());
    }

    #[test]
    fn candidate_sources_include_self() {
        let g = line();
        let src: Vec<&str> = g.candidate_sources("b").into_iter().collect();
        assert_eq!(src, vec!["a", "b", "c"]);
        let src: Vec<&str> = g.candidate_sources("a").into_iter().collect();
        assert_eq!(src, vec!["a", "b"]);
        assert!(g.candidate_sources("zzz").is_empty());
    }

    #[test]
    fn directed_edge_one_way() {
        let g = TopologyGraph::builder()
            .camera("in")
            .camera("hall")
            .directed_edge("in", "hall", None)
            .build()
            .unwrap();
        assert!(g.adjacent("in", "hall"));
        assert!(!g.adjacent("hall", "in"));
    }

    #[test]
    fn rejects_unknown_camera_and_bad_window() {
        let err = TopologyGraph::builder()
            .camera("a")
            .edge("a", "ghost", None)
            .build()
            .unwrap_err();
        assert!(matches!(err, HandoverError::InvalidConfig(_)));

        let err = TopologyGraph::builder()
            .camera("a")
            .camera("b")
            .edge("a", "b", Some(TransitionWindow::new(5.0, 1.0)))
            .build()
            .unwrap_err();
        assert!(matches!(err, HandoverError::InvalidConfig(_)));

        let err = TopologyGraph::builder()
            .camera("a")
            .edge("a", "a", None)
            .build()
            .unwrap_err();
        assert!(matches!(err, HandoverError::InvalidConfig(_)));
    }
}
