// Traced graph intermediate representation
//
// Nodes live in a petgraph StableGraph so ids survive removals. Use edges run
// from a definition to each of its users and are rebuilt from the node's
// arguments whenever those change. Execution order is the explicit insertion
// order, kept separately from the edge structure.

use super::value::Argument;
use crate::{Result, RewriteError};
use petgraph::algo::is_cyclic_directed;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Node identifier in the graph (petgraph NodeIndex)
pub type NodeId = NodeIndex;

/// Kind of operation a node performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeOp {
    Placeholder,
    CallModule,
    CallFunction,
    CallMethod,
    Output,
}

impl NodeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeOp::Placeholder => "placeholder",
            NodeOp::CallModule => "call_module",
            NodeOp::CallFunction => "call_function",
            NodeOp::CallMethod => "call_method",
            NodeOp::Output => "output",
        }
    }
}

impl fmt::Display for NodeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Use edge: how many times the source appears in the target's arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    pub count: usize,
}

/// A node in the traced graph
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique name within the graph
    pub name: String,
    pub op: NodeOp,
    /// Submodule path, function name, method name or placeholder name
    pub target: String,
    pub args: Vec<Argument>,
    pub kwargs: BTreeMap<String, Argument>,
}

impl Node {
    /// Nodes referenced from args and kwargs, in order of appearance
    pub fn input_nodes(&self) -> Vec<NodeId> {
        let mut refs = Vec::new();
        for arg in &self.args {
            arg.referenced_nodes(&mut refs);
        }
        for arg in self.kwargs.values() {
            arg.referenced_nodes(&mut refs);
        }
        refs
    }
}

/// Where a new node goes in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    Append,
    After(NodeId),
    Before(NodeId),
}

/// Ordered traced computation graph
#[derive(Debug, Clone, Default)]
pub struct Graph {
    graph: StableGraph<Node, Use>,
    order: Vec<NodeId>,
    name_to_id: FxHashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a new node
    pub fn add_node(&mut self, op: NodeOp) -> NewNode<'_> {
        NewNode::new(self, op)
    }

    /// Shorthand for a placeholder appended to the graph
    pub fn placeholder(&mut self, name: &str) -> Result<NodeId> {
        self.add_node(NodeOp::Placeholder).target(name).name(name).finish()
    }

    /// Shorthand for a module call appended to the graph
    pub fn call_module(&mut self, target: &str, args: Vec<Argument>) -> Result<NodeId> {
        self.add_node(NodeOp::CallModule).target(target).args(args).finish()
    }

    /// Shorthand for the output node
    pub fn output(&mut self, result: Argument) -> Result<NodeId> {
        self.add_node(NodeOp::Output).target("output").name("output").arg(result).finish()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Node ids in execution order
    pub fn node_ids(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes in execution order
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.order.iter().map(move |&id| (id, &self.graph[id]))
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node_weight(id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.id_of(name).and_then(|id| self.node(id))
    }

    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.name_to_id.get(name).copied()
    }

    /// Node names in execution order
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes().map(|(_, node)| node.name.as_str()).collect()
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.order.iter().position(|&n| n == id)
    }

    /// Immediate successor in insertion order
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        let pos = self.position(id)?;
        self.order.get(pos + 1).copied()
    }

    /// Immediate predecessor in insertion order
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        let pos = self.position(id)?;
        pos.checked_sub(1).map(|p| self.order[p])
    }

    /// Nodes that consume `id`, in execution order
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        let mut users: Vec<NodeId> = self
            .graph
            .edges_directed(id, Direction::Outgoing)
            .map(|edge| edge.target())
            .collect();
        users.sort_by_key(|&u| self.position(u).unwrap_or(usize::MAX));
        users
    }

    /// Nodes whose target is `target` and whose op is `op`
    pub fn nodes_targeting(&self, op: NodeOp, target: &str) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, node)| node.op == op && node.target == target)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn output_node(&self) -> Option<NodeId> {
        self.nodes().find(|(_, node)| node.op == NodeOp::Output).map(|(id, _)| id)
    }

    pub fn placeholders(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, node)| node.op == NodeOp::Placeholder)
            .map(|(id, _)| id)
            .collect()
    }

    /// Replace a node's positional arguments
    pub fn set_args(&mut self, id: NodeId, args: Vec<Argument>) -> Result<()> {
        self.check_refs(&args)?;
        self.node_mut(id)?.args = args;
        self.connect(id);
        Ok(())
    }

    /// Redirect every consumer of `old` to `new`
    ///
    /// `new` itself is never rewritten, so a replacement that consumes the
    /// node it replaces does not end up referencing itself. Returns the
    /// number of argument slots rewritten.
    pub fn replace_all_uses_with(&mut self, old: NodeId, new: NodeId) -> Result<usize> {
        self.expect_node(old)?;
        self.expect_node(new)?;
        if old == new {
            return Ok(0);
        }

        let mut replaced = 0;
        for user in self.users(old) {
            if user == new {
                continue;
            }
            let node = self.node_mut(user)?;
            for arg in node.args.iter_mut() {
                replaced += arg.replace_node(old, new);
            }
            for arg in node.kwargs.values_mut() {
                replaced += arg.replace_node(old, new);
            }
            self.connect(user);
        }
        Ok(replaced)
    }

    /// Remove a node that no longer has users
    pub fn erase_node(&mut self, id: NodeId) -> Result<Node> {
        self.expect_node(id)?;
        let users = self.users(id);
        if !users.is_empty() {
            let node = &self.graph[id];
            return Err(RewriteError::EraseWithUses {
                node: node.name.clone(),
                users: users.iter().map(|&u| self.graph[u].name.clone()).collect(),
            });
        }

        self.order.retain(|&n| n != id);
        let node = self
            .graph
            .remove_node(id)
            .ok_or_else(|| RewriteError::NodeNotFound(format!("{:?}", id)))?;
        self.name_to_id.remove(&node.name);
        Ok(node)
    }

    /// Check structural invariants
    ///
    /// Names are unique, every referenced node exists and is defined before
    /// use, use edges are acyclic, and there is exactly one output node,
    /// placed last.
    pub fn lint(&self) -> Result<()> {
        if self.order.len() != self.graph.node_count() {
            return Err(RewriteError::InvalidGraph(format!(
                "execution order lists {} nodes but graph holds {}",
                self.order.len(),
                self.graph.node_count()
            )));
        }

        let mut seen: FxHashMap<NodeId, usize> = FxHashMap::default();
        let mut names: FxHashMap<&str, NodeId> = FxHashMap::default();
        for (pos, (id, node)) in self.nodes().enumerate() {
            if names.insert(node.name.as_str(), id).is_some() {
                return Err(RewriteError::InvalidGraph(format!("duplicate node name '{}'", node.name)));
            }
            for input in node.input_nodes() {
                match self.node(input) {
                    None => {
                        return Err(RewriteError::InvalidGraph(format!(
                            "node '{}' references a node that no longer exists ({:?})",
                            node.name, input
                        )))
                    }
                    Some(def) if !seen.contains_key(&input) => {
                        return Err(RewriteError::InvalidGraph(format!(
                            "node '{}' uses '{}' before it is defined",
                            node.name, def.name
                        )))
                    }
                    Some(_) => {}
                }
            }
            seen.insert(id, pos);
        }

        if is_cyclic_directed(&self.graph) {
            return Err(RewriteError::InvalidGraph("use edges contain a cycle".to_string()));
        }

        let outputs: Vec<NodeId> = self
            .nodes()
            .filter(|(_, node)| node.op == NodeOp::Output)
            .map(|(id, _)| id)
            .collect();
        match outputs.as_slice() {
            [only] if self.order.last() == Some(only) => Ok(()),
            [_] => Err(RewriteError::InvalidGraph("output node is not the last node".to_string())),
            [] => Err(RewriteError::InvalidGraph("graph has no output node".to_string())),
            _ => Err(RewriteError::InvalidGraph(format!("graph has {} output nodes", outputs.len()))),
        }
    }

    /// Export to Graphviz DOT format
    pub fn to_dot(&self) -> String {
        use std::fmt::Write;
        let mut dot = String::new();
        let _ = writeln!(dot, "digraph TracedGraph {{");
        let _ = writeln!(dot, "  rankdir=TB;");
        let _ = writeln!(dot, "  node [shape=box, style=rounded];");

        for (id, node) in self.nodes() {
            let color = match node.op {
                NodeOp::Placeholder | NodeOp::Output => "lightgray",
                NodeOp::CallModule => "lightgreen",
                NodeOp::CallFunction | NodeOp::CallMethod => "lightblue",
            };
            let _ = writeln!(
                dot,
                "  node{} [label=\"{}\\n{}\\n{}\", fillcolor={}, style=filled];",
                id.index(),
                node.op,
                node.name,
                node.target,
                color
            );
        }

        for id in &self.order {
            for edge in self.graph.edges_directed(*id, Direction::Outgoing) {
                match edge.weight().count {
                    1 => {
                        let _ = writeln!(dot, "  node{} -> node{};", edge.source().index(), edge.target().index());
                    }
                    n => {
                        let _ = writeln!(
                            dot,
                            "  node{} -> node{} [label=\"x{}\"];",
                            edge.source().index(),
                            edge.target().index(),
                            n
                        );
                    }
                }
            }
        }

        let _ = writeln!(dot, "}}");
        dot
    }

    /// Get graph statistics
    pub fn statistics(&self) -> GraphStatistics {
        let mut op_counts: HashMap<String, usize> = HashMap::new();
        for (_, node) in self.nodes() {
            *op_counts.entry(node.op.as_str().to_string()).or_insert(0) += 1;
        }
        GraphStatistics {
            total_nodes: self.graph.node_count(),
            total_edges: self.graph.edge_count(),
            op_counts,
        }
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.graph
            .node_weight_mut(id)
            .ok_or_else(|| RewriteError::NodeNotFound(format!("{:?}", id)))
    }

    fn expect_node(&self, id: NodeId) -> Result<&Node> {
        self.node(id).ok_or_else(|| RewriteError::NodeNotFound(format!("{:?}", id)))
    }

    fn check_refs<'a>(&self, args: impl IntoIterator<Item = &'a Argument>) -> Result<()> {
        let mut refs = Vec::new();
        for arg in args {
            arg.referenced_nodes(&mut refs);
        }
        for id in refs {
            if self.node(id).is_none() {
                return Err(RewriteError::NodeNotFound(format!("argument references {:?}", id)));
            }
        }
        Ok(())
    }

    /// Rebuild incoming use edges of `id` from its arguments
    fn connect(&mut self, id: NodeId) {
        let stale: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Incoming)
            .map(|edge| edge.id())
            .collect();
        for edge in stale {
            self.graph.remove_edge(edge);
        }

        let mut counts: BTreeMap<NodeId, usize> = BTreeMap::new();
        for input in self.graph[id].input_nodes() {
            *counts.entry(input).or_insert(0) += 1;
        }
        for (def, count) in counts {
            self.graph.add_edge(def, id, Use { count });
        }
    }

    /// Derive a unique name from `base`, appending `_<n>` on collision
    fn unique_name(&self, base: &str) -> String {
        if !self.name_to_id.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{}_{}", base, n))
            .find(|candidate| !self.name_to_id.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }
}

/// Builder for adding nodes to the graph
pub struct NewNode<'a> {
    graph: &'a mut Graph,
    node_data: Node,
    explicit_name: bool,
    insert_point: InsertPoint,
}

impl<'a> NewNode<'a> {
    fn new(graph: &'a mut Graph, op: NodeOp) -> Self {
        Self {
            graph,
            node_data: Node {
                name: String::new(),
                op,
                target: String::new(),
                args: Vec::new(),
                kwargs: BTreeMap::new(),
            },
            explicit_name: false,
            insert_point: InsertPoint::Append,
        }
    }

    /// Set node name; fails at `finish` if already taken
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.node_data.name = name.into();
        self.explicit_name = true;
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.node_data.target = target.into();
        self
    }

    /// Add a positional argument
    pub fn arg(mut self, arg: impl Into<Argument>) -> Self {
        self.node_data.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: Vec<Argument>) -> Self {
        self.node_data.args = args;
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Argument>) -> Self {
        self.node_data.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn kwargs(mut self, kwargs: BTreeMap<String, Argument>) -> Self {
        self.node_data.kwargs = kwargs;
        self
    }

    pub fn insert_after(mut self, anchor: NodeId) -> Self {
        self.insert_point = InsertPoint::After(anchor);
        self
    }

    pub fn insert_before(mut self, anchor: NodeId) -> Self {
        self.insert_point = InsertPoint::Before(anchor);
        self
    }

    pub fn at(mut self, insert_point: InsertPoint) -> Self {
        self.insert_point = insert_point;
        self
    }

    /// Finish building and add to graph
    pub fn finish(self) -> Result<NodeId> {
        let NewNode {
            graph,
            mut node_data,
            explicit_name,
            insert_point,
        } = self;

        if node_data.target.is_empty() {
            return Err(RewriteError::InvalidArgument(format!("{} node needs a target", node_data.op)));
        }
        graph.check_refs(node_data.args.iter().chain(node_data.kwargs.values()))?;

        if explicit_name {
            if graph.name_to_id.contains_key(&node_data.name) {
                return Err(RewriteError::DuplicateName(node_data.name));
            }
        } else {
            node_data.name = graph.unique_name(&node_data.target);
        }

        let position = match insert_point {
            InsertPoint::Append => graph.order.len(),
            InsertPoint::After(anchor) => {
                graph
                    .position(anchor)
                    .ok_or_else(|| RewriteError::NodeNotFound(format!("insertion anchor {:?}", anchor)))?
                    + 1
            }
            InsertPoint::Before(anchor) => graph
                .position(anchor)
                .ok_or_else(|| RewriteError::NodeNotFound(format!("insertion anchor {:?}", anchor)))?,
        };

        let name = node_data.name.clone();
        let node_id = graph.graph.add_node(node_data);
        graph.order.insert(position, node_id);
        graph.name_to_id.insert(name, node_id);
        graph.connect(node_id);

        Ok(node_id)
    }
}

/// Graph statistics
#[derive(Debug, Clone)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub op_counts: HashMap<String, usize>,
}

impl fmt::Display for GraphStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph Statistics:")?;
        writeln!(f, "  Total nodes: {}", self.total_nodes)?;
        writeln!(f, "  Total edges: {}", self.total_edges)?;
        writeln!(f, "  Operation kinds:")?;

        let mut sorted_ops: Vec<_> = self.op_counts.iter().collect();
        sorted_ops.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

        for (op, count) in sorted_ops {
            writeln!(f, "    {}: {}", op, count)?;
        }

        Ok(())
    }
}
