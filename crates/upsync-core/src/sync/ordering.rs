//! Orders patches so referenced resources are created before their referrers.
//!
//! Resources that reference each other in a cycle cannot be ordered; they are
//! grouped so the request layer can send them together.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::models::{extract_references, PatchGroup, PatchMapping, PatchType};

/// Directed graph of resources keyed by `Type/id`; an edge `a -> b` means `a` references `b`
#[derive(Debug, Default)]
pub struct ReferenceGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<Vec<usize>>,
}

impl ReferenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, returning `false` if it was already present
    pub fn add_node(&mut self, key: impl Into<String>) -> bool {
        let key = key.into();
        if self.index.contains_key(&key) {
            return false;
        }
        self.index.insert(key.clone(), self.nodes.len());
        self.nodes.push(key);
        self.edges.push(Vec::new());
        true
    }

    /// Add an edge between existing nodes; unknown nodes and repeated edges are ignored
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let (Some(&from), Some(&to)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        if !self.edges[from].contains(&to) {
            self.edges[from].push(to);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Strongly connected components in Tarjan completion order.
    ///
    /// A component is emitted only after every component it references, so the
    /// result lists dependencies first. Roots are visited in insertion order and
    /// members of a component are listed in insertion order too.
    pub fn strongly_connected_components(&self) -> Vec<Vec<String>> {
        Tarjan::new(self)
            .run()
            .into_iter()
            .map(|component| {
                component
                    .into_iter()
                    .map(|node| self.nodes[node].clone())
                    .collect()
            })
            .collect()
    }
}

struct Tarjan<'a> {
    graph: &'a ReferenceGraph,
    counter: usize,
    discovered: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<usize>>,
}

impl<'a> Tarjan<'a> {
    fn new(graph: &'a ReferenceGraph) -> Self {
        let n = graph.len();
        Self {
            graph,
            counter: 0,
            discovered: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<Vec<usize>> {
        for root in 0..self.graph.len() {
            if self.discovered[root].is_none() {
                self.visit_from(root);
            }
        }
        self.components
    }

    fn discover(&mut self, node: usize) {
        self.discovered[node] = Some(self.counter);
        self.lowlink[node] = self.counter;
        self.counter += 1;
        self.stack.push(node);
        self.on_stack[node] = true;
    }

    /// Depth-first search with an explicit frame stack of (node, next edge)
    fn visit_from(&mut self, root: usize) {
        self.discover(root);
        let mut frames = vec![(root, 0)];

        while let Some(frame) = frames.last_mut() {
            let (node, next_edge) = *frame;
            if let Some(&target) = self.graph.edges[node].get(next_edge) {
                frame.1 += 1;
                match self.discovered[target] {
                    None => {
                        self.discover(target);
                        frames.push((target, 0));
                    }
                    Some(index) if self.on_stack[target] => {
                        self.lowlink[node] = self.lowlink[node].min(index);
                    }
                    Some(_) => {}
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                self.lowlink[parent] = self.lowlink[parent].min(self.lowlink[node]);
            }
            if Some(self.lowlink[node]) == self.discovered[node] {
                let mut component = Vec::new();
                while let Some(member) = self.stack.pop() {
                    self.on_stack[member] = false;
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                component.sort_unstable();
                self.components.push(component);
            }
        }
    }
}

/// Order squashed patches by their references to other pending creations.
///
/// Each mapping must belong to a distinct resource. Edges only point at insertions, so
/// every member of a cycle is an insertion.
pub fn order(mappings: Vec<PatchMapping>) -> Result<Vec<PatchGroup>> {
    let mut graph = ReferenceGraph::new();
    let mut by_key = HashMap::with_capacity(mappings.len());
    let mut inserts = HashSet::new();

    for mapping in &mappings {
        let key = mapping.generated_patch.key().to_string();
        if !graph.add_node(key.clone()) {
            return Err(Error::InvalidHistory {
                key,
                reason: "resource appears in more than one patch".into(),
            });
        }
        if mapping.generated_patch.patch_type == PatchType::Insert {
            inserts.insert(key);
        }
    }

    for mapping in &mappings {
        let from = mapping.generated_patch.key().to_string();
        for reference in extract_references(&mapping.generated_patch) {
            let to = reference.to_string();
            if to != from && inserts.contains(&to) {
                graph.add_edge(&from, &to);
            }
        }
    }

    for mapping in mappings {
        by_key.insert(mapping.generated_patch.key().to_string(), mapping);
    }

    let mut groups = Vec::new();
    for component in graph.strongly_connected_components() {
        let mut members: Vec<PatchMapping> = component
            .iter()
            .filter_map(|key| by_key.remove(key))
            .collect();
        if members.len() == 1 {
            groups.extend(members.pop().map(PatchGroup::Single));
            continue;
        }

        tracing::info!(
            "Reference cycle between {}, uploading together",
            component.join(", ")
        );
        groups.push(PatchGroup::Combined(members));
    }
    Ok(groups)
}
