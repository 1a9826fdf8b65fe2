// Atomic graph edits
//
// A GraphEdit records insertions, use redirections, erasures and submodule
// changes without touching the graph. `commit` replays them on a staged copy,
// lints and recompiles the copy, and only then replaces the caller's module.
// A failing edit leaves the original untouched.

use super::graph_module::GraphModule;
use super::ir::{NodeId, NodeOp};
use super::module::Module;
use super::value::Argument;
use crate::{Result, RewriteError};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;

/// A node an edit refers to: already in the graph, or created by an earlier edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditTarget {
    Existing(NodeId),
    /// Index into the nodes inserted by this transaction, in insertion order
    Inserted(usize),
}

impl From<NodeId> for EditTarget {
    fn from(id: NodeId) -> Self {
        EditTarget::Existing(id)
    }
}

#[derive(Debug, Clone)]
enum EditOp {
    AddSubmodule {
        name: String,
        module: Module,
    },
    DeleteSubmodule {
        name: String,
    },
    InsertCallModule {
        after: EditTarget,
        target: String,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    },
    /// Inputs are read from `source` when the edit is applied
    InsertReplacement {
        source: EditTarget,
        target: String,
    },
    ReplaceAllUses {
        old: EditTarget,
        new: EditTarget,
    },
    EraseNode {
        node: EditTarget,
    },
}

/// Batch of graph edits applied all-or-nothing
#[derive(Debug, Clone, Default)]
pub struct GraphEdit {
    ops: Vec<EditOp>,
    inserted: usize,
}

impl GraphEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn add_submodule(&mut self, name: impl Into<String>, module: Module) -> &mut Self {
        self.ops.push(EditOp::AddSubmodule {
            name: name.into(),
            module,
        });
        self
    }

    pub fn delete_submodule(&mut self, name: impl Into<String>) -> &mut Self {
        self.ops.push(EditOp::DeleteSubmodule { name: name.into() });
        self
    }

    /// Queue a call_module node right after `after`; returns a handle to it
    pub fn insert_call_module(
        &mut self,
        after: impl Into<EditTarget>,
        target: impl Into<String>,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> EditTarget {
        self.ops.push(EditOp::InsertCallModule {
            after: after.into(),
            target: target.into(),
            args,
            kwargs,
        });
        let handle = EditTarget::Inserted(self.inserted);
        self.inserted += 1;
        handle
    }

    /// Queue a call_module to `target` right after `source`, taking the
    /// arguments `source` has at that point of the transaction
    ///
    /// Earlier edits may have redirected `source`'s inputs, so the arguments
    /// are copied when the edit is applied rather than when it is queued.
    pub fn insert_replacement(&mut self, source: impl Into<EditTarget>, target: impl Into<String>) -> EditTarget {
        self.ops.push(EditOp::InsertReplacement {
            source: source.into(),
            target: target.into(),
        });
        let handle = EditTarget::Inserted(self.inserted);
        self.inserted += 1;
        handle
    }

    pub fn replace_all_uses_with(&mut self, old: impl Into<EditTarget>, new: impl Into<EditTarget>) -> &mut Self {
        self.ops.push(EditOp::ReplaceAllUses {
            old: old.into(),
            new: new.into(),
        });
        self
    }

    pub fn erase_node(&mut self, node: impl Into<EditTarget>) -> &mut Self {
        self.ops.push(EditOp::EraseNode { node: node.into() });
        self
    }

    /// Apply every edit, validate, recompile and swap into `gm`
    ///
    /// Returns the ids of the inserted nodes, in insertion order.
    pub fn commit(self, gm: &mut GraphModule) -> Result<Vec<NodeId>> {
        let mut staged = gm.clone();
        let mut handles = Handles {
            existing: gm.graph().node_ids().iter().copied().collect(),
            erased: FxHashSet::default(),
            created: Vec::with_capacity(self.inserted),
        };
        let edit_count = self.ops.len();

        for op in self.ops {
            match op {
                EditOp::AddSubmodule { name, module } => staged.add_submodule(name, module)?,
                EditOp::DeleteSubmodule { name } => {
                    if !staged.delete_submodule(&name) {
                        return Err(RewriteError::UnresolvedTarget(format!("submodule '{}'", name)));
                    }
                }
                EditOp::InsertCallModule {
                    after,
                    target,
                    args,
                    kwargs,
                } => {
                    let anchor = handles.resolve(after)?;
                    let id = staged
                        .graph_mut()
                        .add_node(NodeOp::CallModule)
                        .target(target)
                        .args(args)
                        .kwargs(kwargs)
                        .insert_after(anchor)
                        .finish()?;
                    handles.created.push(id);
                }
                EditOp::InsertReplacement { source, target } => {
                    let anchor = handles.resolve(source)?;
                    let (args, kwargs) = staged
                        .graph()
                        .node(anchor)
                        .map(|node| (node.args.clone(), node.kwargs.clone()))
                        .ok_or_else(|| RewriteError::NodeNotFound(format!("{:?}", anchor)))?;
                    let id = staged
                        .graph_mut()
                        .add_node(NodeOp::CallModule)
                        .target(target)
                        .args(args)
                        .kwargs(kwargs)
                        .insert_after(anchor)
                        .finish()?;
                    handles.created.push(id);
                }
                EditOp::ReplaceAllUses { old, new } => {
                    let old = handles.resolve(old)?;
                    let new = handles.resolve(new)?;
                    staged.graph_mut().replace_all_uses_with(old, new)?;
                }
                EditOp::EraseNode { node } => {
                    let id = handles.resolve(node)?;
                    staged.graph_mut().erase_node(id)?;
                    handles.erased.insert(id);
                }
            }
        }

        staged.recompile()?;
        tracing::debug!(edits = edit_count, inserted = handles.created.len(), "Committed graph edit");
        *gm = staged;
        Ok(handles.created)
    }
}

/// Node ids visible to one commit
///
/// Erased slots can be reused by later insertions, so an erased id stays
/// unresolvable for the rest of the transaction.
struct Handles {
    existing: FxHashSet<NodeId>,
    erased: FxHashSet<NodeId>,
    created: Vec<NodeId>,
}

impl Handles {
    fn resolve(&self, target: EditTarget) -> Result<NodeId> {
        match target {
            EditTarget::Existing(id) if self.erased.contains(&id) => {
                Err(RewriteError::NodeNotFound(format!("{:?} was erased earlier in this edit", id)))
            }
            EditTarget::Existing(id) if !self.existing.contains(&id) => {
                Err(RewriteError::NodeNotFound(format!("{:?} is not in the graph being edited", id)))
            }
            EditTarget::Existing(id) => Ok(id),
            EditTarget::Inserted(index) => match self.created.get(index) {
                Some(id) if !self.erased.contains(id) => Ok(*id),
                Some(id) => Err(RewriteError::NodeNotFound(format!("{:?} was erased earlier in this edit", id))),
                None => Err(RewriteError::InvalidArgument(format!(
                    "edit refers to inserted node #{} before it exists",
                    index
                ))),
            },
        }
    }
}
