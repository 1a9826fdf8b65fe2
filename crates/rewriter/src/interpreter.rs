//! Node-by-node graph interpretation
//!
//! [`Interpreter`] walks a [`GraphModule`] in execution order, resolving each
//! node's arguments from an [`Environment`] of previously computed values and
//! dispatching on the node kind. Every step is a default trait method, so an
//! implementor can intercept one kind of node (the observer passes override
//! [`Interpreter::call_module`]) and still delegate to the default behaviour.
//!
//! Execution is single-shot: an unresolvable target, an arity mismatch or a
//! shape mismatch aborts the run and is returned to the caller.

use crate::graph::{builtins, Argument, GraphModule, Node, NodeId, NodeOp, Value};
use crate::{Result, RewriteError};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Values computed so far in one run, plus the remaining graph inputs
#[derive(Debug)]
pub struct Environment {
    values: FxHashMap<NodeId, Value>,
    inputs: Vec<Value>,
    next_input: usize,
}

impl Environment {
    pub fn new(inputs: &[Value]) -> Self {
        Self {
            values: FxHashMap::default(),
            inputs: inputs.to_vec(),
            next_input: 0,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Value> {
        self.values.get(&id)
    }

    pub fn insert(&mut self, id: NodeId, value: Value) {
        self.values.insert(id, value);
    }

    /// Bind the next graph input to a placeholder
    pub fn next_input(&mut self, target: &str) -> Result<Value> {
        let value = self.inputs.get(self.next_input).cloned().ok_or_else(|| {
            RewriteError::InvalidArgument(format!("no input left for placeholder '{}'", target))
        })?;
        self.next_input += 1;
        Ok(value)
    }

    /// Resolve a node's arguments against computed values
    pub fn fetch_args_kwargs(&self, node: &Node) -> Result<(Vec<Value>, BTreeMap<String, Value>)> {
        let args = node
            .args
            .iter()
            .map(|a| self.resolve(node, a))
            .collect::<Result<Vec<_>>>()?;
        let kwargs = node
            .kwargs
            .iter()
            .map(|(k, a)| Ok((k.clone(), self.resolve(node, a)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok((args, kwargs))
    }

    fn resolve(&self, node: &Node, arg: &Argument) -> Result<Value> {
        Ok(match arg {
            Argument::Node(id) => self.values.get(id).cloned().ok_or_else(|| {
                RewriteError::InvalidGraph(format!("node '{}' uses a value that has not been computed", node.name))
            })?,
            Argument::Int(v) => Value::Int(*v),
            Argument::Float(v) => Value::Float(*v),
            Argument::Bool(v) => Value::Bool(*v),
            Argument::Str(v) => Value::Str(v.clone()),
            Argument::None => Value::None,
            Argument::List(items) => Value::List(
                items
                    .iter()
                    .map(|a| self.resolve(node, a))
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }
}

/// Executes a graph module node by node
pub trait Interpreter {
    /// The module being interpreted
    fn graph_module(&self) -> &GraphModule;

    /// Run every node in order and return the output node's value
    fn run(&mut self, inputs: &[Value]) -> Result<Value> {
        let expected = self.graph_module().graph().placeholders().len();
        if expected != inputs.len() {
            return Err(RewriteError::ArityMismatch {
                target: "forward".to_string(),
                expected,
                actual: inputs.len(),
            });
        }

        let order = self.graph_module().graph().node_ids().to_vec();
        let mut env = Environment::new(inputs);
        for id in order {
            let is_output = self
                .graph_module()
                .graph()
                .node(id)
                .map_or(false, |n| n.op == NodeOp::Output);
            let value = self.run_node(id, &mut env)?;
            if is_output {
                return Ok(value);
            }
            env.insert(id, value);
        }
        Err(RewriteError::InvalidGraph("graph has no output node".to_string()))
    }

    /// Evaluate a single node
    fn run_node(&mut self, id: NodeId, env: &mut Environment) -> Result<Value> {
        let node = self
            .graph_module()
            .graph()
            .node(id)
            .cloned()
            .ok_or_else(|| RewriteError::NodeNotFound(format!("{:?}", id)))?;
        let (args, kwargs) = env.fetch_args_kwargs(&node)?;
        tracing::trace!(node = %node.name, op = %node.op, target = %node.target, "Interpreting node");

        match node.op {
            NodeOp::Placeholder => self.placeholder(&node.target, env),
            NodeOp::CallModule => self.call_module(&node.target, &args, &kwargs),
            NodeOp::CallFunction => self.call_function(&node.target, &args, &kwargs),
            NodeOp::CallMethod => self.call_method(&node.target, &args, &kwargs),
            NodeOp::Output => self.output(&args),
        }
    }

    fn placeholder(&mut self, target: &str, env: &mut Environment) -> Result<Value> {
        env.next_input(target)
    }

    fn call_module(&mut self, target: &str, args: &[Value], kwargs: &BTreeMap<String, Value>) -> Result<Value> {
        self.graph_module().fetch_module(target)?.forward(target, args, kwargs)
    }

    fn call_function(&mut self, target: &str, args: &[Value], kwargs: &BTreeMap<String, Value>) -> Result<Value> {
        builtins::call_function(target, args, kwargs)
    }

    fn call_method(&mut self, target: &str, args: &[Value], kwargs: &BTreeMap<String, Value>) -> Result<Value> {
        builtins::call_method(target, args, kwargs)
    }

    fn output(&mut self, args: &[Value]) -> Result<Value> {
        match args {
            [single] => Ok(single.clone()),
            many => Ok(Value::List(many.to_vec())),
        }
    }
}

/// Interpreter with no interception
pub struct GraphInterpreter<'a> {
    gm: &'a GraphModule,
}

impl<'a> GraphInterpreter<'a> {
    pub fn new(gm: &'a GraphModule) -> Self {
        Self { gm }
    }
}

impl Interpreter for GraphInterpreter<'_> {
    fn graph_module(&self) -> &GraphModule {
        self.gm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Conv2dParams, Graph, Module, ModuleRegistry};

    fn residual() -> GraphModule {
        // x -> conv -> add(conv, x) -> relu -> output
        let mut graph = Graph::new();
        let x = graph.placeholder("x").unwrap();
        let conv = graph.call_module("conv", vec![x.into()]).unwrap();
        let add = graph
            .add_node(NodeOp::CallFunction)
            .target("add")
            .arg(conv)
            .arg(x)
            .finish()
            .unwrap();
        let relu = graph.call_module("relu", vec![add.into()]).unwrap();
        graph.output(relu.into()).unwrap();

        let mut modules = ModuleRegistry::new();
        modules
            .add_submodule("conv", Module::Conv2d(Conv2dParams::new(4, 4, 3).with_padding(1)))
            .unwrap();
        modules.add_submodule("relu", Module::ReLU).unwrap();
        GraphModule::new(graph, modules)
    }

    /// Counts module calls without changing results
    struct CountingInterpreter<'a> {
        gm: &'a GraphModule,
        calls: Vec<String>,
    }

    impl Interpreter for CountingInterpreter<'_> {
        fn graph_module(&self) -> &GraphModule {
            self.gm
        }

        fn call_module(&mut self, target: &str, args: &[Value], kwargs: &BTreeMap<String, Value>) -> Result<Value> {
            self.calls.push(target.to_string());
            self.gm.fetch_module(target)?.forward(target, args, kwargs)
        }
    }

    #[test]
    fn test_run_propagates_shapes() {
        let gm = residual();
        let out = GraphInterpreter::new(&gm).run(&[Value::tensor(vec![2, 4, 8, 8])]).unwrap();
        assert_eq!(out, Value::tensor(vec![2, 4, 8, 8]));
    }

    #[test]
    fn test_override_intercepts_module_calls() {
        let gm = residual();
        let mut interp = CountingInterpreter { gm: &gm, calls: Vec::new() };
        let out = interp.run(&[Value::tensor(vec![1, 4, 5, 5])]).unwrap();

        assert_eq!(out, Value::tensor(vec![1, 4, 5, 5]));
        assert_eq!(interp.calls, vec!["conv", "relu"]);
    }

    #[test]
    fn test_wrong_input_count() {
        let gm = residual();
        let err = GraphInterpreter::new(&gm).run(&[]).unwrap_err();
        assert!(matches!(err, RewriteError::ArityMismatch { expected: 1, actual: 0, .. }));
    }

    #[test]
    fn test_missing_submodule_is_fatal() {
        let mut gm = residual();
        gm.delete_submodule("relu");
        let err = GraphInterpreter::new(&gm).run(&[Value::tensor(vec![1, 4, 5, 5])]).unwrap_err();
        assert!(matches!(err, RewriteError::UnresolvedTarget(_)));
    }

    #[test]
    fn test_shape_mismatch_surfaces() {
        let gm = residual();
        let err = GraphInterpreter::new(&gm).run(&[Value::tensor(vec![1, 3, 5, 5])]).unwrap_err();
        assert!(matches!(err, RewriteError::ShapeMismatch { .. }));
    }
}
