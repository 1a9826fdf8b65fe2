//! Observer passes
//!
//! An observer interprets a graph module on sample inputs and records every
//! call_module node whose submodule passes a [`ModuleFilter`]. Module calls
//! still execute, so shapes downstream of a recorded node stay correct.
//!
//! Two filters are used by the dequantization rewrite:
//!
//! - [`ModuleFilter::Traceable`]: plain Conv2d, Linear and BatchNorm2d layers
//!   in the original graph
//! - [`ModuleFilter::FusedQuantized`]: fused quantized Conv+BatchNorm blocks in
//!   the quantized reference graph
//!
//! The record is rebuilt on every [`ModuleObserver::propagate`] call and
//! handed back by value, so two observations never share storage. An observer
//! borrows its graph module immutably; graph edits have to wait until every
//! observation that needs the unmodified graph has been taken.

use crate::graph::{GraphModule, Module, ModuleKind, Value};
use crate::interpreter::Interpreter;
use crate::Result;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Which submodules an observer records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFilter {
    /// Conv2d, Linear, BatchNorm2d
    Traceable,
    /// Fused quantized Conv+BatchNorm
    FusedQuantized,
}

impl ModuleFilter {
    pub fn matches(&self, kind: ModuleKind) -> bool {
        match self {
            ModuleFilter::Traceable => kind.is_traceable(),
            ModuleFilter::FusedQuantized => kind == ModuleKind::QConvBn,
        }
    }
}

/// Matched module targets of one run, plus the module behind each
#[derive(Debug, Clone, Default)]
pub struct Observation {
    /// Matched call_module targets in execution order
    pub places: Vec<String>,
    /// Target → submodule instance
    pub modules: FxHashMap<String, Module>,
}

impl Observation {
    pub fn contains(&self, target: &str) -> bool {
        self.modules.contains_key(target)
    }

    pub fn get(&self, target: &str) -> Option<&Module> {
        self.modules.get(target)
    }

    pub fn kind_of(&self, target: &str) -> Option<ModuleKind> {
        self.get(target).map(Module::kind)
    }

    pub fn len(&self) -> usize {
        self.places.len()
    }

    pub fn is_empty(&self) -> bool {
        self.places.is_empty()
    }
}

/// Interpreter that records filtered module calls
pub struct ModuleObserver<'a> {
    gm: &'a GraphModule,
    filter: ModuleFilter,
    record: Observation,
}

impl<'a> ModuleObserver<'a> {
    pub fn new(gm: &'a GraphModule, filter: ModuleFilter) -> Self {
        Self {
            gm,
            filter,
            record: Observation::default(),
        }
    }

    /// Observer over plain Conv2d/Linear/BatchNorm2d layers
    pub fn insertion(gm: &'a GraphModule) -> Self {
        Self::new(gm, ModuleFilter::Traceable)
    }

    /// Observer over fused quantized Conv+BatchNorm blocks
    pub fn quantization(gm: &'a GraphModule) -> Self {
        Self::new(gm, ModuleFilter::FusedQuantized)
    }

    pub fn filter(&self) -> ModuleFilter {
        self.filter
    }

    /// Interpret the module on `inputs` and return what was recorded
    ///
    /// Each call starts from an empty record; the previous one is not kept.
    pub fn propagate(&mut self, inputs: &[Value]) -> Result<Observation> {
        self.record = Observation::default();
        let result = self.run(inputs);
        let record = std::mem::take(&mut self.record);
        result?;
        tracing::debug!(filter = ?self.filter, matched = record.len(), "Observation complete");
        Ok(record)
    }
}

impl Interpreter for ModuleObserver<'_> {
    fn graph_module(&self) -> &GraphModule {
        self.gm
    }

    fn call_module(&mut self, target: &str, args: &[Value], kwargs: &BTreeMap<String, Value>) -> Result<Value> {
        let module = self.gm.fetch_module(target)?;
        if self.filter.matches(module.kind()) {
            self.record.places.push(target.to_string());
            self.record.modules.insert(target.to_string(), module.clone());
        }
        module.forward(target, args, kwargs)
    }
}
