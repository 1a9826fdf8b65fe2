//! Dequantization-aware training rewrite
//!
//! Replaces every Conv2d immediately followed (in execution order) by a
//! BatchNorm2d with a single fused [`DConvBn`] module. The fused module takes
//! its convolution parameters from the matching fused quantized block of a
//! reference graph that was traced from the quantized version of the same
//! network.
//!
//! # Algorithm
//!
//! ```text
//! reference graph ──observe──▶ fused quantized blocks by path
//! original graph  ──observe──▶ Conv2d / Linear / BatchNorm2d by path
//!                     │
//!                     ▼
//! walk original nodes in order, pair Conv2d with the next node if it is a BatchNorm2d
//!                     │
//!                     ▼
//! one GraphEdit per pass: add fused module, redirect uses, erase the pair
//!                     │
//!                     ▼
//! commit (validate + recompile) ── all or nothing
//! ```
//!
//! The pair is matched by adjacency only. A Conv2d whose next node is not a
//! BatchNorm2d is left alone, even if a BatchNorm2d consumes it further down.
//! Consumers of the Conv2d itself, not only of the BatchNorm2d, end up
//! reading the fused node.

use crate::config::{PartialQuantizationConfig, QuantizationConfig};
use crate::graph::{DConvBn, GraphEdit, GraphModule, Module, ModuleKind, NodeId, NodeOp, Value};
use crate::passes::naming::fused_module_name;
use crate::passes::observer::{ModuleObserver, Observation};
use crate::passes::GraphPass;
use crate::{Result, RewriteError};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

/// What a rewrite did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteSummary {
    /// Paths of the registered fused modules, in traversal order
    pub fused: Vec<String>,
    pub nodes_before: usize,
    pub nodes_after: usize,
}

/// A Conv2d → BatchNorm2d pair scheduled for fusion
#[derive(Debug, Clone)]
struct FusionMatch {
    conv: NodeId,
    bn: NodeId,
    fused_name: String,
    module: DConvBn,
}

/// Conv+BatchNorm dequantization rewrite against a quantized reference graph
pub struct DequantizationPass<'q> {
    reference: &'q GraphModule,
    inputs: Vec<Value>,
    config: QuantizationConfig,
}

impl<'q> DequantizationPass<'q> {
    /// `inputs` must be accepted by both the reference graph and the graph being rewritten
    pub fn new(reference: &'q GraphModule, inputs: &[Value], config: QuantizationConfig) -> Self {
        Self {
            reference,
            inputs: inputs.to_vec(),
            config,
        }
    }

    pub fn config(&self) -> &QuantizationConfig {
        &self.config
    }

    /// Rewrite `gm` in place
    ///
    /// On error `gm` is left exactly as it was.
    ///
    /// # Errors
    ///
    /// - Either observation fails (unresolved submodule, arity or shape mismatch)
    /// - [`RewriteError::MissingQuantizedModule`] if a matched pair has no fused
    ///   quantized counterpart under the derived path
    /// - The edited graph fails validation
    pub fn apply(&self, gm: &mut GraphModule) -> Result<RewriteSummary> {
        info!(config = %self.config, "Running dequantization rewrite");
        let nodes_before = gm.graph().len();

        let quantized = ModuleObserver::quantization(self.reference).propagate(&self.inputs)?;
        let inserts = ModuleObserver::insertion(gm).propagate(&self.inputs)?;
        let matches = self.find_matches(gm, &inserts, &quantized)?;

        if matches.is_empty() {
            gm.recompile()?;
            info!("No Conv2d/BatchNorm2d pairs to fuse");
            return Ok(RewriteSummary {
                fused: Vec::new(),
                nodes_before,
                nodes_after: nodes_before,
            });
        }

        let fused: Vec<String> = matches.iter().map(|m| m.fused_name.clone()).collect();
        let edit = self.build_edit(gm, matches)?;
        edit.commit(gm)?;

        let nodes_after = gm.graph().len();
        info!(fused = fused.len(), nodes_before, nodes_after, "Dequantization rewrite complete");
        Ok(RewriteSummary {
            fused,
            nodes_before,
            nodes_after,
        })
    }

    fn find_matches(&self, gm: &GraphModule, inserts: &Observation, quantized: &Observation) -> Result<Vec<FusionMatch>> {
        let graph = gm.graph();
        let mut matches = Vec::new();
        let mut counter = 0usize;

        for (x, node) in graph.nodes() {
            if node.op != NodeOp::CallModule {
                continue;
            }
            if inserts.kind_of(&node.target) != Some(ModuleKind::Conv2d) {
                continue;
            }

            let bn = graph.next(x).filter(|&y| {
                graph.node(y).map_or(false, |next| {
                    next.op == NodeOp::CallModule && inserts.kind_of(&next.target) == Some(ModuleKind::BatchNorm2d)
                })
            });
            let Some(y) = bn else {
                warn!(node = %node.name, "Conv2d is not directly followed by BatchNorm2d, leaving it unfused");
                continue;
            };

            let fused_name = fused_module_name(&node.target, counter);
            let conv_params = match quantized.get(&fused_name) {
                Some(Module::QConvBn(q)) => q.conv_module.clone(),
                _ => return Err(RewriteError::MissingQuantizedModule(fused_name)),
            };
            debug!(conv = %node.name, fused = %fused_name, "Matched Conv2d/BatchNorm2d pair");

            matches.push(FusionMatch {
                conv: x,
                bn: y,
                fused_name,
                module: DConvBn::new(conv_params, self.config.clone()),
            });
            counter += 1;
        }

        Ok(matches)
    }

    fn build_edit(&self, gm: &GraphModule, matches: Vec<FusionMatch>) -> Result<GraphEdit> {
        let graph = gm.graph();
        let mut edit = GraphEdit::new();
        let mut erased: FxHashSet<NodeId> = FxHashSet::default();
        let mut dropped_targets: Vec<String> = Vec::new();

        for m in matches {
            let conv = graph
                .node(m.conv)
                .ok_or_else(|| RewriteError::NodeNotFound(format!("{:?}", m.conv)))?;
            let bn = graph
                .node(m.bn)
                .ok_or_else(|| RewriteError::NodeNotFound(format!("{:?}", m.bn)))?;

            edit.add_submodule(m.fused_name.clone(), Module::DConvBn(m.module));
            edit.replace_all_uses_with(m.bn, m.conv).erase_node(m.bn);
            let fused = edit.insert_replacement(m.conv, m.fused_name);
            edit.replace_all_uses_with(m.conv, fused).erase_node(m.conv);

            erased.insert(m.conv);
            erased.insert(m.bn);
            for target in [&bn.target, &conv.target] {
                if !dropped_targets.contains(target) {
                    dropped_targets.push(target.clone());
                }
            }
        }

        // A submodule goes away only once no surviving node calls it
        for target in dropped_targets {
            let still_called = graph
                .nodes_targeting(NodeOp::CallModule, &target)
                .iter()
                .any(|id| !erased.contains(id));
            if still_called {
                debug!(target = %target, "Keeping submodule still called elsewhere");
            } else {
                edit.delete_submodule(target);
            }
        }

        Ok(edit)
    }
}

impl GraphPass for DequantizationPass<'_> {
    fn name(&self) -> &str {
        "dequantization_aware_training"
    }

    fn run(&self, gm: &mut GraphModule) -> anyhow::Result<bool> {
        let summary = self.apply(gm)?;
        Ok(!summary.fused.is_empty())
    }
}

/// Rewrite `origin` against the quantized reference and return it recompiled
///
/// `qconfig` is merged over the defaults (8 bit, symmetric, "google"
/// formula, per-layer, momentum 0.95).
pub fn dequantization_aware_training(
    mut origin: GraphModule,
    quantized: &GraphModule,
    inputs: &[Value],
    qconfig: &PartialQuantizationConfig,
) -> Result<GraphModule> {
    let config = QuantizationConfig::resolve(qconfig)?;
    DequantizationPass::new(quantized, inputs, config).apply(&mut origin)?;
    Ok(origin)
}
