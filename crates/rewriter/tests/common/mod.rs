//! Shared fixtures for the rewriter integration tests
//!
//! `TracedModel` stands in for a tracer: it appends call_module nodes and
//! registers their submodules in one step, so fixtures read like the forward
//! pass they describe.

#![allow(dead_code)]

use hologram_qat_rewriter::{
    Argument, BatchNorm2dParams, Conv2dParams, Graph, GraphModule, Module, ModuleRegistry, NodeId, NodeOp,
    QConvBn, QuantizationConfig, Value,
};

/// Install a test-friendly tracing subscriber once per process
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Incrementally traced model
pub struct TracedModel {
    graph: Graph,
    modules: ModuleRegistry,
}

impl TracedModel {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            modules: ModuleRegistry::new(),
        }
    }

    pub fn input(&mut self, name: &str) -> NodeId {
        self.graph.placeholder(name).unwrap()
    }

    /// Register `module` under `path` and call it on `input`
    pub fn module(&mut self, path: &str, module: Module, input: NodeId) -> NodeId {
        self.modules.add_submodule(path, module).unwrap();
        self.graph.call_module(path, vec![input.into()]).unwrap()
    }

    /// Call an already registered module again
    pub fn call_again(&mut self, path: &str, input: NodeId) -> NodeId {
        self.graph.call_module(path, vec![input.into()]).unwrap()
    }

    pub fn function(&mut self, target: &str, args: Vec<Argument>) -> NodeId {
        self.graph
            .add_node(NodeOp::CallFunction)
            .target(target)
            .args(args)
            .finish()
            .unwrap()
    }

    pub fn finish(mut self, result: NodeId) -> GraphModule {
        self.graph.output(result.into()).unwrap();
        let mut gm = GraphModule::new(self.graph, self.modules);
        gm.recompile().unwrap();
        gm
    }
}

pub fn conv(in_channels: usize, out_channels: usize) -> Conv2dParams {
    Conv2dParams::new(in_channels, out_channels, 3).with_padding(1)
}

pub fn conv2d(params: Conv2dParams) -> Module {
    Module::Conv2d(params)
}

pub fn bn(channels: usize) -> Module {
    Module::BatchNorm2d(BatchNorm2dParams::new(channels))
}

pub fn qconvbn(params: Conv2dParams) -> Module {
    let channels = params.out_channels;
    Module::QConvBn(QConvBn {
        conv_module: params,
        bn_module: BatchNorm2dParams::new(channels),
        config: QuantizationConfig::default(),
    })
}

pub fn image(channels: usize) -> Vec<Value> {
    vec![Value::tensor(vec![1, channels, 8, 8])]
}

/// Every node id referenced from any argument in the graph
pub fn referenced_ids(gm: &GraphModule) -> Vec<NodeId> {
    gm.graph().nodes().flat_map(|(_, node)| node.input_nodes()).collect()
}
