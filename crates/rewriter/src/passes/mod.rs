// Graph passes
//
// This module contains the observation and rewrite passes that run over
// traced graph modules.

pub mod dequantization;
pub mod naming;
pub mod observer;

pub use dequantization::{dequantization_aware_training, DequantizationPass, RewriteSummary};
pub use naming::{fused_module_name, module_space, FUSED_CONV_BN_PREFIX};
pub use observer::{ModuleFilter, ModuleObserver, Observation};

use crate::graph::GraphModule;
use anyhow::Result;

/// Graph pass trait
///
/// Each pass implements this trait to provide a composable transformation
/// on a graph module.
pub trait GraphPass {
    /// Get the name of this pass (for logging/debugging)
    fn name(&self) -> &str;

    /// Run the pass on the graph module
    ///
    /// Returns `true` if the graph was modified, `false` otherwise.
    fn run(&self, gm: &mut GraphModule) -> Result<bool>;
}
