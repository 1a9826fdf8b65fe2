// Traced graph model
//
// This module provides the intermediate representation the rewriter works on:
// - Ordered nodes with explicit use/def edges (petgraph-backed)
// - A submodule registry keyed by dotted hierarchical path
// - Shape-level values for interpretation
// - An edit transaction that applies a batch of rewrites atomically

pub mod builtins;
pub mod edit;
pub mod graph_module;
pub mod ir;
pub mod module;
pub mod value;

// Re-exports for convenience
pub use edit::{EditTarget, GraphEdit};
pub use graph_module::{CompiledCode, GraphModule};
pub use ir::{Graph, GraphStatistics, InsertPoint, NewNode, Node, NodeId, NodeOp, Use};
pub use module::{BatchNorm2dParams, Conv2dParams, DConvBn, LinearParams, Module, ModuleKind, ModuleRegistry, QConvBn};
pub use value::{Argument, TensorMeta, Value};
