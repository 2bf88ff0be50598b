//! Toxic-flow analysis.
//!
//! No single tool below is malicious, yet an agent holding all of them can
//! be steered by a poisoned web page into reading `~/.ssh` and mailing it
//! out. The analysis finds those compositions.
//!
//! # Graph
//!
//! Nodes are entities with their [`CapabilityLabel`]s. Edges are plausible
//! hand-offs of attacker-influenced data:
//!
//! | From | To |
//! |------|----|
//! | `untrusted_content` | `private_data`, `public_sink`, `destructive` |
//! | `private_data` | `public_sink` |
//!
//! A flow is a simple path that starts at an untrusted-content node and
//! ends at a public-sink or destructive node.
//!
//! # Complexity
//!
//! Path enumeration is depth-first and bounded by [`MAX_PATH_LEN`] nodes,
//! so it is O(V^3) in the worst case. [`MAX_FLOWS`] caps what is kept;
//! flows past the cap are still counted.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tripwire_guard::{CapabilityLabel, Severity};
use tripwire_registry::EntityRef;

use crate::config::FlowRanking;

/// Longest flow, in nodes.
pub const MAX_PATH_LEN: usize = 3;

/// Flows kept per target.
pub const MAX_FLOWS: usize = 10_000;

/// Flows kept by [`ToxicFlowGraph::enumerate_flows_capped`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowEnumeration {
    /// Kept flows, in discovery order.
    pub flows: Vec<ToxicFlowFinding>,
    /// Flows found beyond the cap.
    pub omitted: usize,
}

/// One entity on a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStep {
    /// The entity.
    pub entity: EntityRef,
    /// Its labels.
    pub labels: BTreeSet<CapabilityLabel>,
}

/// A risky chain of entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToxicFlowFinding {
    /// Entities from source to sink.
    pub path: Vec<FlowStep>,
    /// How bad the composition is.
    pub severity: Severity,
    /// Why the chain is risky.
    pub explanation: String,
}

impl ToxicFlowFinding {
    /// Entities on the path.
    pub fn entities(&self) -> Vec<&EntityRef> {
        self.path.iter().map(|s| &s.entity).collect()
    }
}

/// Directed capability graph.
///
/// # Example
///
/// ```rust
/// use std::collections::BTreeSet;
/// use tripwire_core::ToxicFlowGraph;
/// use tripwire_guard::CapabilityLabel;
/// use tripwire_registry::{EntityKind, EntityRef};
///
/// let mut graph = ToxicFlowGraph::new();
/// let web = graph.add_node(
///     EntityRef::new("browser", EntityKind::Tool, "fetch"),
///     BTreeSet::from([CapabilityLabel::UntrustedContent]),
/// );
/// let shell = graph.add_node(
///     EntityRef::new("os", EntityKind::Tool, "run"),
///     BTreeSet::from([CapabilityLabel::Destructive]),
/// );
/// graph.add_edge(web, shell);
///
/// let flows = graph.enumerate_flows();
/// assert_eq!(flows.len(), 1);
/// assert_eq!(flows[0].path.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ToxicFlowGraph {
    nodes: Vec<FlowStep>,
    adjacency: Vec<Vec<usize>>,
}

impl ToxicFlowGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph with every edge the labels imply.
    pub fn from_labelled(nodes: impl IntoIterator<Item = (EntityRef, BTreeSet<CapabilityLabel>)>) -> Self {
        let mut graph = Self::new();
        for (entity, labels) in nodes {
            graph.add_node(entity, labels);
        }
        for from in 0..graph.nodes.len() {
            for to in 0..graph.nodes.len() {
                if from != to && implies_edge(&graph.nodes[from].labels, &graph.nodes[to].labels) {
                    graph.add_edge(from, to);
                }
            }
        }
        graph
    }

    /// Adds a node and returns its index.
    pub fn add_node(&mut self, entity: EntityRef, labels: BTreeSet<CapabilityLabel>) -> usize {
        self.nodes.push(FlowStep { entity, labels });
        self.adjacency.push(Vec::new());
        self.nodes.len() - 1
    }

    /// Adds a directed edge. Out-of-range indices and duplicates are ignored.
    pub fn add_edge(&mut self, from: usize, to: usize) {
        if from >= self.nodes.len() || to >= self.nodes.len() {
            return;
        }
        if !self.adjacency[from].contains(&to) {
            self.adjacency[from].push(to);
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Enumerates every flow, in discovery order, keeping at most
    /// [`MAX_FLOWS`].
    pub fn enumerate_flows(&self) -> Vec<ToxicFlowFinding> {
        self.enumerate_flows_capped(MAX_FLOWS).flows
    }

    /// Enumerates every flow, keeping the first `cap` and counting the rest.
    pub fn enumerate_flows_capped(&self, cap: usize) -> FlowEnumeration {
        let mut found = FlowEnumeration::default();
        let mut path = Vec::with_capacity(MAX_PATH_LEN);

        for start in 0..self.nodes.len() {
            if !self.nodes[start].labels.contains(&CapabilityLabel::UntrustedContent) {
                continue;
            }
            path.push(start);
            self.extend(&mut path, cap, &mut found);
            path.pop();
        }
        found
    }

    fn extend(&self, path: &mut Vec<usize>, cap: usize, found: &mut FlowEnumeration) {
        if path.len() >= MAX_PATH_LEN {
            return;
        }
        let Some(&last) = path.last() else {
            return;
        };
        for &next in &self.adjacency[last] {
            if path.contains(&next) {
                continue;
            }
            path.push(next);
            if is_sink(&self.nodes[next].labels) {
                if found.flows.len() < cap {
                    found.flows.push(self.finding(path));
                } else {
                    found.omitted += 1;
                }
            }
            self.extend(path, cap, found);
            path.pop();
        }
    }

    fn finding(&self, path: &[usize]) -> ToxicFlowFinding {
        let steps: Vec<FlowStep> = path.iter().map(|&i| self.nodes[i].clone()).collect();
        let (severity, explanation) = assess(&steps);
        ToxicFlowFinding {
            path: steps,
            severity,
            explanation,
        }
    }
}

fn is_sink(labels: &BTreeSet<CapabilityLabel>) -> bool {
    labels.contains(&CapabilityLabel::PublicSink) || labels.contains(&CapabilityLabel::Destructive)
}

fn implies_edge(from: &BTreeSet<CapabilityLabel>, to: &BTreeSet<CapabilityLabel>) -> bool {
    if from.contains(&CapabilityLabel::UntrustedContent)
        && (to.contains(&CapabilityLabel::PrivateData) || is_sink(to))
    {
        return true;
    }
    from.contains(&CapabilityLabel::PrivateData) && to.contains(&CapabilityLabel::PublicSink)
}

fn assess(steps: &[FlowStep]) -> (Severity, String) {
    let touches_private = steps[1..steps.len().saturating_sub(1)]
        .iter()
        .any(|s| s.labels.contains(&CapabilityLabel::PrivateData));
    let last = steps.last().map(|s| &s.labels);
    let destructive = last.is_some_and(|l| l.contains(&CapabilityLabel::Destructive));

    if touches_private && last.is_some_and(|l| l.contains(&CapabilityLabel::PublicSink)) {
        (
            Severity::High,
            "untrusted content can make the agent read private data and send it out".to_string(),
        )
    } else if destructive {
        (
            Severity::High,
            "untrusted content can trigger a destructive action".to_string(),
        )
    } else {
        (
            Severity::Medium,
            "untrusted content can reach a public sink".to_string(),
        )
    }
}

/// Orders flows by `ranking`. The sort is stable, so ties keep discovery
/// order.
pub fn rank_flows(flows: &[ToxicFlowFinding], ranking: FlowRanking) -> Vec<&ToxicFlowFinding> {
    let mut ranked: Vec<&ToxicFlowFinding> = flows.iter().collect();
    match ranking {
        FlowRanking::SeverityThenLength => ranked.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.path.len().cmp(&b.path.len()))
        }),
        FlowRanking::ShortestFirst => ranked.sort_by_key(|f| f.path.len()),
        FlowRanking::Discovery => {}
    }
    ranked
}

/// The flows shown by default: the first `top_k` by `ranking`, or all of
/// them with `full`.
pub fn displayed_flows(
    flows: &[ToxicFlowFinding],
    ranking: FlowRanking,
    top_k: usize,
    full: bool,
) -> Vec<&ToxicFlowFinding> {
    let mut ranked = rank_flows(flows, ranking);
    if !full {
        ranked.truncate(top_k);
    }
    ranked
}
