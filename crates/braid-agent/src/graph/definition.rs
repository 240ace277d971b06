use std::collections::HashMap;

use serde::Serialize;

use braid_core::error::{BraidError, Result};
use braid_core::types::SessionState;

use super::edge::{Condition, Edge, Target};
use super::node::Node;

/// Index of a node in a graph's arena.
pub type NodeIndex = usize;

/// Where the resolver sends the run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Node(NodeIndex),
    End,
}

enum Route {
    Static(Next),
    Conditional {
        branches: Vec<(Condition, Next)>,
        default: Next,
    },
}

struct Entry {
    name: String,
    node: Node,
}

/// Immutable, validated graph topology: an arena of named nodes and
/// index-based routes. Nodes without a route are terminal.
pub struct GraphDefinition {
    nodes: Vec<Entry>,
    index: HashMap<String, NodeIndex>,
    routes: Vec<Option<Route>>,
    entry: NodeIndex,
}

impl GraphDefinition {
    pub fn entry(&self) -> NodeIndex {
        self.entry
    }

    pub fn entry_name(&self) -> &str {
        &self.nodes[self.entry].name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    pub fn name(&self, idx: NodeIndex) -> &str {
        &self.nodes[idx].name
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx].node
    }

    pub fn is_terminal(&self, idx: NodeIndex) -> bool {
        self.routes[idx].is_none()
    }

    /// Next node after `idx`, given the state produced by its delta.
    ///
    /// Conditional branches are tried in declaration order; the first
    /// match wins, otherwise the default applies.
    pub fn resolve(&self, idx: NodeIndex, state: &SessionState) -> Next {
        match &self.routes[idx] {
            None => Next::End,
            Some(Route::Static(next)) => *next,
            Some(Route::Conditional { branches, default }) => branches
                .iter()
                .find(|(condition, _)| condition.evaluate(state))
                .map(|(_, next)| *next)
                .unwrap_or(*default),
        }
    }

    /// Name-based form of [`GraphDefinition::resolve`]. `None` means the run ends.
    pub fn resolve_next(&self, node: &str, state: &SessionState) -> Result<Option<&str>> {
        let idx = self
            .index_of(node)
            .ok_or_else(|| BraidError::GraphConfig(format!("unknown node '{}'", node)))?;
        Ok(match self.resolve(idx, state) {
            Next::Node(next) => Some(self.name(next)),
            Next::End => None,
        })
    }

    /// Serializable description of the graph.
    pub fn topology(&self) -> Topology {
        let target = |next: &Next| match next {
            Next::Node(i) => self.nodes[*i].name.clone(),
            Next::End => "END".to_string(),
        };

        let mut edges = Vec::new();
        for (from, route) in self.routes.iter().enumerate() {
            let from = &self.nodes[from].name;
            match route {
                None => {}
                Some(Route::Static(next)) => edges.push(TopologyEdge {
                    from: from.clone(),
                    to: target(next),
                    condition: None,
                }),
                Some(Route::Conditional { branches, default }) => {
                    for (condition, next) in branches {
                        edges.push(TopologyEdge {
                            from: from.clone(),
                            to: target(next),
                            condition: Some(condition.describe()),
                        });
                    }
                    edges.push(TopologyEdge {
                        from: from.clone(),
                        to: target(default),
                        condition: Some("default".into()),
                    });
                }
            }
        }

        Topology {
            entry: self.entry_name().to_string(),
            nodes: self
                .nodes
                .iter()
                .map(|e| TopologyNode {
                    name: e.name.clone(),
                    kind: e.node.kind(),
                })
                .collect(),
            edges,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Topology {
    pub entry: String,
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TopologyNode {
    pub name: String,
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TopologyEdge {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Builds a [`GraphDefinition`]. All routing errors surface from
/// [`GraphBuilder::build`], never at run time.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<(String, Node)>,
    edges: Vec<(String, Edge)>,
    entry: Option<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, name: impl Into<String>, node: impl Into<Node>) -> Self {
        self.nodes.push((name.into(), node.into()));
        self
    }

    /// Unconditional edge.
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<Target>) -> Self {
        self.edges.push((from.into(), Edge::Static(to.into())));
        self
    }

    /// Conditional edge. A `None` default is rejected by `build`.
    pub fn conditional(
        mut self,
        from: impl Into<String>,
        branches: Vec<(Condition, Target)>,
        default: Option<Target>,
    ) -> Self {
        self.edges
            .push((from.into(), Edge::Conditional { branches, default }));
        self
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    pub fn build(self) -> Result<GraphDefinition> {
        let mut index = HashMap::new();
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (name, node) in self.nodes {
            if name.is_empty() || name == "END" {
                return Err(BraidError::GraphConfig(format!(
                    "'{}' is not a valid node name",
                    name
                )));
            }
            if index.insert(name.clone(), nodes.len()).is_some() {
                return Err(BraidError::GraphConfig(format!("duplicate node '{}'", name)));
            }
            nodes.push(Entry { name, node });
        }

        let entry_name = self
            .entry
            .ok_or_else(|| BraidError::GraphConfig("no entry node".into()))?;
        let entry = *index.get(&entry_name).ok_or_else(|| {
            BraidError::GraphConfig(format!("entry node '{}' does not exist", entry_name))
        })?;

        let lookup = |target: &Target, from: &str| -> Result<Next> {
            match target {
                Target::End => Ok(Next::End),
                Target::Node(name) => index.get(name).map(|i| Next::Node(*i)).ok_or_else(|| {
                    BraidError::GraphConfig(format!(
                        "edge from '{}' points at unknown node '{}'",
                        from, name
                    ))
                }),
            }
        };

        let mut routes: Vec<Option<Route>> = (0..nodes.len()).map(|_| None).collect();
        for (from, edge) in self.edges {
            let from_idx = *index.get(&from).ok_or_else(|| {
                BraidError::GraphConfig(format!("edge from unknown node '{}'", from))
            })?;
            if routes[from_idx].is_some() {
                return Err(BraidError::GraphConfig(format!(
                    "node '{}' has more than one outgoing edge; use a conditional edge",
                    from
                )));
            }
            let route = match edge {
                Edge::Static(target) => Route::Static(lookup(&target, &from)?),
                Edge::Conditional { branches, default } => {
                    let default = default.ok_or_else(|| {
                        BraidError::GraphConfig(format!(
                            "conditional edge from '{}' has no default target",
                            from
                        ))
                    })?;
                    let default = lookup(&default, &from)?;
                    let branches = branches
                        .into_iter()
                        .map(|(condition, target)| -> Result<(Condition, Next)> {
                            Ok((condition, lookup(&target, &from)?))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Route::Conditional { branches, default }
                }
            };
            routes[from_idx] = Some(route);
        }

        Ok(GraphDefinition {
            nodes,
            index,
            routes,
            entry,
        })
    }
}
