// A traced graph bundled with the submodules it calls
//
// Any structural change drops the compiled form; `recompile` re-validates the
// graph and regenerates the forward listing before the module can run again.

use super::ir::{Graph, NodeOp};
use super::module::{Module, ModuleRegistry};
use super::value::{Argument, Value};
use crate::interpreter::{GraphInterpreter, Interpreter};
use crate::{Result, RewriteError};
use std::fmt;

/// Executable form produced by [`GraphModule::recompile`]
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCode {
    /// Readable forward listing
    pub code: String,
}

/// Traced graph plus submodule registry
#[derive(Debug, Clone, Default)]
pub struct GraphModule {
    graph: Graph,
    modules: ModuleRegistry,
    compiled: Option<CompiledCode>,
}

impl GraphModule {
    pub fn new(graph: Graph, modules: ModuleRegistry) -> Self {
        Self {
            graph,
            modules,
            compiled: None,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable graph access; invalidates the compiled form
    pub fn graph_mut(&mut self) -> &mut Graph {
        self.compiled = None;
        &mut self.graph
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn add_submodule(&mut self, name: impl Into<String>, module: Module) -> Result<()> {
        self.compiled = None;
        self.modules.add_submodule(name, module)
    }

    pub fn delete_submodule(&mut self, name: &str) -> bool {
        self.compiled = None;
        self.modules.delete_submodule(name)
    }

    /// Resolve a call_module target
    pub fn fetch_module(&self, target: &str) -> Result<&Module> {
        self.modules
            .get(target)
            .ok_or_else(|| RewriteError::UnresolvedTarget(format!("submodule '{}'", target)))
    }

    /// Graph invariants plus "every call_module target is registered"
    pub fn lint(&self) -> Result<()> {
        self.graph.lint()?;
        for (_, node) in self.graph.nodes() {
            if node.op == NodeOp::CallModule && !self.modules.contains(&node.target) {
                return Err(RewriteError::UnresolvedTarget(format!(
                    "node '{}' calls unregistered submodule '{}'",
                    node.name, node.target
                )));
            }
        }
        Ok(())
    }

    /// Validate the graph and regenerate its executable form
    pub fn recompile(&mut self) -> Result<&CompiledCode> {
        self.lint()?;
        let code = self.render_code();
        tracing::debug!(nodes = self.graph.len(), "Recompiled graph module");
        Ok(self.compiled.insert(CompiledCode { code }))
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Generated forward listing, if compiled
    pub fn code(&self) -> Option<&str> {
        self.compiled.as_ref().map(|c| c.code.as_str())
    }

    /// Run the compiled module on `inputs`
    pub fn forward(&self, inputs: &[Value]) -> Result<Value> {
        if self.compiled.is_none() {
            return Err(RewriteError::NotCompiled);
        }
        GraphInterpreter::new(self).run(inputs)
    }

    fn render_code(&self) -> String {
        let params: Vec<String> = self
            .graph
            .placeholders()
            .into_iter()
            .filter_map(|id| self.graph.node(id))
            .map(|node| ident(&node.name))
            .collect();

        let mut code = String::new();
        code.push_str("def forward(self");
        for p in &params {
            code.push_str(", ");
            code.push_str(p);
        }
        code.push_str("):\n");

        for (_, node) in self.graph.nodes() {
            let mut call_args: Vec<String> = node.args.iter().map(|a| self.render_arg(a)).collect();
            call_args.extend(node.kwargs.iter().map(|(k, v)| format!("{}={}", k, self.render_arg(v))));
            let line = match node.op {
                NodeOp::Placeholder => continue,
                NodeOp::CallModule => {
                    format!("{} = self.{}({})", ident(&node.name), node.target, call_args.join(", "))
                }
                NodeOp::CallFunction => {
                    format!("{} = {}({})", ident(&node.name), node.target, call_args.join(", "))
                }
                NodeOp::CallMethod => {
                    let receiver = call_args.first().cloned().unwrap_or_default();
                    let rest = call_args.get(1..).unwrap_or(&[]).join(", ");
                    format!("{} = {}.{}({})", ident(&node.name), receiver, node.target, rest)
                }
                NodeOp::Output => format!("return {}", call_args.join(", ")),
            };
            code.push_str("    ");
            code.push_str(&line);
            code.push('\n');
        }
        code
    }

    fn render_arg(&self, arg: &Argument) -> String {
        match arg {
            Argument::Node(id) => self
                .graph
                .node(*id)
                .map(|n| ident(&n.name))
                .unwrap_or_else(|| format!("<erased {:?}>", id)),
            Argument::Int(v) => v.to_string(),
            Argument::Float(v) => format!("{:?}", v),
            Argument::Bool(true) => "True".to_string(),
            Argument::Bool(false) => "False".to_string(),
            Argument::Str(s) => format!("{:?}", s),
            Argument::None => "None".to_string(),
            Argument::List(items) => {
                let inner: Vec<String> = items.iter().map(|a| self.render_arg(a)).collect();
                format!("[{}]", inner.join(", "))
            }
        }
    }
}

fn ident(name: &str) -> String {
    name.replace('.', "_")
}

impl fmt::Display for GraphModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, module) in self.modules.iter() {
            writeln!(f, "# {}: {}", name, module)?;
        }
        match &self.compiled {
            Some(compiled) => f.write_str(&compiled.code),
            None => f.write_str(&self.render_code()),
        }
    }
}
