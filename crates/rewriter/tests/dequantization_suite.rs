//! Dequantization Rewrite Test Suite
//!
//! End-to-end checks of the Conv2d/BatchNorm2d fusion rewrite on traced
//! fixtures: structure, naming, use rewiring, parameter propagation and
//! configuration handling.

mod common;

use common::*;
use hologram_qat_rewriter::{
    dequantization_aware_training, Argument, Conv2dParams, DequantizationPass, GraphModule, Module, ModuleObserver,
    PartialQuantizationConfig, QuantizationConfig, QuantizationScheme, RewriteError, Value,
};

fn registry_names(gm: &GraphModule) -> Vec<String> {
    gm.modules().iter().map(|(name, _)| name.to_string()).collect()
}

fn fused_at<'a>(gm: &'a GraphModule, path: &str) -> &'a hologram_qat_rewriter::DConvBn {
    match gm.modules().get(path) {
        Some(Module::DConvBn(d)) => d,
        other => panic!("expected DConvBN at '{}', found {:?}", path, other),
    }
}

/// linear_in -> conv0 -> bn0 -> relu0 -> output
fn scenario() -> (GraphModule, GraphModule) {
    let mut m = TracedModel::new();
    let x = m.input("linear_in");
    let c = m.module("conv0", conv2d(conv(3, 16)), x);
    let b = m.module("bn0", bn(16), c);
    let r = m.module("relu0", Module::ReLU, b);
    let origin = m.finish(r);

    let mut q = TracedModel::new();
    let x = q.input("linear_in");
    let f = q.module("fake_conv_bn.0", qconvbn(Conv2dParams::new(3, 16, 3).with_padding(1)), x);
    let r = q.module("relu0", Module::ReLU, f);
    let quantized = q.finish(r);

    (origin, quantized)
}

#[test]
fn test_concrete_scenario() {
    init_tracing();
    let (origin, quantized) = scenario();

    let rewritten =
        dequantization_aware_training(origin, &quantized, &image(3), &PartialQuantizationConfig::new()).unwrap();

    assert_eq!(rewritten.graph().node_names(), vec!["linear_in", "fake_conv_bn.0", "relu0", "output"]);

    let fused = fused_at(&rewritten, "fake_conv_bn.0");
    let p = &fused.conv;
    assert_eq!(
        (p.in_channels, p.out_channels, p.kernel_size, p.stride, p.padding, p.dilation, p.groups),
        (3, 16, [3, 3], [1, 1], [1, 1], [1, 1], 1)
    );

    let fused_id = rewritten.graph().id_of("fake_conv_bn.0").unwrap();
    let relu = rewritten.graph().node_by_name("relu0").unwrap();
    assert_eq!(relu.args, vec![Argument::Node(fused_id)]);

    assert!(rewritten.is_compiled());
    assert_eq!(rewritten.forward(&image(3)).unwrap(), Value::tensor(vec![1, 16, 8, 8]));
    assert!(rewritten.code().unwrap().contains("fake_conv_bn_0 = self.fake_conv_bn.0(linear_in)"));
}

#[test]
fn test_graph_without_pairs_is_unchanged() {
    init_tracing();
    // conv -> relu -> bn: the BatchNorm2d is not adjacent to the Conv2d
    let mut m = TracedModel::new();
    let x = m.input("x");
    let c = m.module("conv", conv2d(conv(3, 8)), x);
    let r = m.module("relu", Module::ReLU, c);
    let b = m.module("bn", bn(8), r);
    let f = m.function("flatten", vec![b.into(), Argument::Int(1)]);
    let fc = m.module("fc", Module::linear(512, 10), f);
    let origin = m.finish(fc);

    let names_before: Vec<String> = origin.graph().node_names().iter().map(|s| s.to_string()).collect();
    let registry_before = registry_names(&origin);

    let mut q = TracedModel::new();
    let x = q.input("x");
    let quantized = q.finish(x);

    let rewritten =
        dequantization_aware_training(origin, &quantized, &image(3), &PartialQuantizationConfig::new()).unwrap();

    let names_after: Vec<String> = rewritten.graph().node_names().iter().map(|s| s.to_string()).collect();
    assert_eq!(names_after, names_before);
    assert_eq!(registry_names(&rewritten), registry_before);
    assert!(rewritten.is_compiled());
}

#[test]
fn test_each_pair_collapses_with_counter_in_traversal_order() {
    init_tracing();
    let mut m = TracedModel::new();
    let x = m.input("x");
    let c0 = m.module("conv0", conv2d(conv(3, 8)), x);
    let b0 = m.module("bn0", bn(8), c0);
    let c1 = m.module("layer1.conv1", conv2d(conv(8, 8)), b0);
    let b1 = m.module("layer1.bn1", bn(8), c1);
    let r1 = m.module("layer1.relu", Module::ReLU, b1);
    let c2 = m.module("layer2.conv", conv2d(conv(8, 8)), r1);
    let b2 = m.module("layer2.bn", bn(8), c2);
    let origin = m.finish(b2);
    assert_eq!(origin.graph().len(), 9);

    let mut q = TracedModel::new();
    let x = q.input("x");
    let f0 = q.module("fake_conv_bn.0", qconvbn(conv(3, 8)), x);
    let f1 = q.module("layer1.fake_conv_bn.1", qconvbn(conv(8, 8)), f0);
    let r1 = q.module("layer1.relu", Module::ReLU, f1);
    let f2 = q.module("layer2.fake_conv_bn.2", qconvbn(conv(8, 8)), r1);
    let quantized = q.finish(f2);

    let mut rewritten = origin.clone();
    let pass = DequantizationPass::new(&quantized, &image(3), QuantizationConfig::default());
    let summary = pass.apply(&mut rewritten).unwrap();

    assert_eq!(
        summary.fused,
        vec!["fake_conv_bn.0", "layer1.fake_conv_bn.1", "layer2.fake_conv_bn.2"]
    );
    assert_eq!(summary.nodes_before - summary.nodes_after, 3);
    assert_eq!(
        rewritten.graph().node_names(),
        vec![
            "x",
            "fake_conv_bn.0",
            "layer1.fake_conv_bn.1",
            "layer1.relu",
            "layer2.fake_conv_bn.2",
            "output"
        ]
    );
    assert_eq!(
        registry_names(&rewritten),
        vec!["fake_conv_bn.0", "layer1.fake_conv_bn.1", "layer1.relu", "layer2.fake_conv_bn.2"]
    );
    assert_eq!(rewritten.forward(&image(3)).unwrap(), Value::tensor(vec![1, 8, 8, 8]));
}

#[test]
fn test_pairing_follows_order_not_data_flow() {
    init_tracing();
    // stem -> conv, and bn reads stem rather than conv; add(conv, bn)
    let mut m = TracedModel::new();
    let x = m.input("x");
    let s = m.module("stem", conv2d(conv(3, 8)), x);
    let c = m.module("conv", conv2d(conv(8, 8)), s);
    let b = m.module("bn", bn(8), s);
    let add = m.function("add", vec![c.into(), b.into()]);
    let origin = m.finish(add);
    assert!(origin.graph().users(c).iter().all(|&u| u != b));

    let mut q = TracedModel::new();
    let x = q.input("x");
    let s = q.module("stem", conv2d(conv(3, 8)), x);
    let f = q.module("fake_conv_bn.0", qconvbn(conv(8, 8)), s);
    let quantized = q.finish(f);

    let rewritten =
        dequantization_aware_training(origin, &quantized, &image(3), &PartialQuantizationConfig::new()).unwrap();
    let graph = rewritten.graph();

    assert_eq!(graph.node_names(), vec!["x", "stem", "fake_conv_bn.0", "add", "output"]);
    assert!(matches!(rewritten.modules().get("fake_conv_bn.0"), Some(Module::DConvBn(_))));
    assert!(rewritten.modules().get("bn").is_none());

    let fused = graph.id_of("fake_conv_bn.0").unwrap();
    let stem = graph.id_of("stem").unwrap();
    assert_eq!(graph.node(fused).unwrap().args, vec![Argument::Node(stem)]);
    assert_eq!(graph.node_by_name("add").unwrap().args, vec![Argument::Node(fused), Argument::Node(fused)]);
    assert_eq!(rewritten.forward(&image(3)).unwrap(), Value::tensor(vec![1, 8, 8, 8]));
}

#[test]
fn test_consumers_of_both_nodes_are_rewired() {
    init_tracing();
    // x -> conv -> bn -> add(conv, bn) -> relu(bn)
    let mut m = TracedModel::new();
    let x = m.input("x");
    let c = m.module("conv", conv2d(conv(3, 8)), x);
    let b = m.module("bn", bn(8), c);
    let add = m.function("add", vec![c.into(), b.into()]);
    let relu = m.function("relu", vec![b.into()]);
    let out = m.function("add", vec![add.into(), relu.into()]);
    let origin = m.finish(out);

    let mut q = TracedModel::new();
    let x = q.input("x");
    let f = q.module("fake_conv_bn.0", qconvbn(conv(3, 8)), x);
    let quantized = q.finish(f);

    let rewritten =
        dequantization_aware_training(origin, &quantized, &image(3), &PartialQuantizationConfig::new()).unwrap();
    let graph = rewritten.graph();
    let fused = graph.id_of("fake_conv_bn.0").unwrap();

    assert_eq!(graph.node_by_name("add").unwrap().args, vec![Argument::Node(fused), Argument::Node(fused)]);
    assert_eq!(graph.node_by_name("relu").unwrap().args, vec![Argument::Node(fused)]);
    assert!(graph.node_by_name("conv").is_none());
    assert!(graph.node_by_name("bn").is_none());
    for id in referenced_ids(&rewritten) {
        assert!(graph.node(id).is_some(), "dangling reference to {:?}", id);
    }
    assert_eq!(graph.users(fused).len(), 2);
}

#[test]
fn test_structural_parameters_come_from_reference() {
    init_tracing();
    let (origin, _) = scenario();

    let reference_params = Conv2dParams::new(3, 16, 3).with_padding(1).with_bias(false);
    let mut q = TracedModel::new();
    let x = q.input("linear_in");
    let f = q.module("fake_conv_bn.0", qconvbn(reference_params.clone()), x);
    let quantized = q.finish(f);

    let rewritten =
        dequantization_aware_training(origin, &quantized, &image(3), &PartialQuantizationConfig::new()).unwrap();

    assert_eq!(fused_at(&rewritten, "fake_conv_bn.0").conv, reference_params);
}

#[test]
fn test_configuration_reaches_fused_module() {
    let (origin, quantized) = scenario();
    let rewritten =
        dequantization_aware_training(origin, &quantized, &image(3), &PartialQuantizationConfig::new()).unwrap();
    let config = &fused_at(&rewritten, "fake_conv_bn.0").config;
    assert_eq!(config, &QuantizationConfig::default());
    assert_eq!(
        (
            config.quantization_bit(),
            config.quantization_scheme(),
            config.quantization_formula(),
            config.per_layer_quantization(),
            config.momentum()
        ),
        (8, QuantizationScheme::Symmetric, "google", true, 0.95)
    );

    let (origin, quantized) = scenario();
    let qconfig = PartialQuantizationConfig::from_json_str(r#"{"momentum": 0.8}"#).unwrap();
    let rewritten = dequantization_aware_training(origin, &quantized, &image(3), &qconfig).unwrap();
    let config = &fused_at(&rewritten, "fake_conv_bn.0").config;
    assert_eq!(config.momentum(), 0.8);
    assert_eq!(config.quantization_bit(), 8);
    assert_eq!(config.quantization_scheme(), QuantizationScheme::Symmetric);
    assert_eq!(config.quantization_formula(), "google");
    assert!(config.per_layer_quantization());
}

#[test]
fn test_invalid_configuration_aborts_before_rewriting() {
    let (origin, quantized) = scenario();
    let qconfig = PartialQuantizationConfig::new().with_momentum(-0.1);
    let err = dequantization_aware_training(origin, &quantized, &image(3), &qconfig).unwrap_err();
    assert!(matches!(err, RewriteError::InvalidConfig(_)));
}

#[test]
fn test_naming_mismatch_is_fatal_and_leaves_graph_intact() {
    init_tracing();
    let mut m = TracedModel::new();
    let x = m.input("x");
    let c = m.module("layer1.conv", conv2d(conv(3, 8)), x);
    let b = m.module("layer1.bn", bn(8), c);
    let mut origin = m.finish(b);

    // Reference registered the block at the top level instead of under layer1
    let mut q = TracedModel::new();
    let x = q.input("x");
    let f = q.module("fake_conv_bn.0", qconvbn(conv(3, 8)), x);
    let quantized = q.finish(f);

    let pass = DequantizationPass::new(&quantized, &image(3), QuantizationConfig::default());
    let err = pass.apply(&mut origin).unwrap_err();

    assert!(matches!(err, RewriteError::MissingQuantizedModule(ref name) if name == "layer1.fake_conv_bn.0"));
    assert_eq!(origin.graph().node_names(), vec!["x", "layer1.conv", "layer1.bn", "output"]);
    assert_eq!(registry_names(&origin), vec!["layer1.bn", "layer1.conv"]);
}

#[test]
fn test_shared_conv_submodule_survives() {
    init_tracing();
    // stem -> block.conv -> block.bn -> block.conv (second call)
    let mut m = TracedModel::new();
    let x = m.input("x");
    let s = m.module("stem", conv2d(conv(3, 8)), x);
    let c = m.module("block.conv", conv2d(conv(8, 8)), s);
    let b = m.module("block.bn", bn(8), c);
    let again = m.call_again("block.conv", b);
    let origin = m.finish(again);
    assert_eq!(origin.graph().node_names(), vec!["x", "stem", "block.conv", "block.bn", "block.conv_1", "output"]);

    let mut q = TracedModel::new();
    let x = q.input("x");
    let s = q.module("stem", conv2d(conv(3, 8)), x);
    let f = q.module("block.fake_conv_bn.0", qconvbn(conv(8, 8)), s);
    let quantized = q.finish(f);

    let rewritten =
        dequantization_aware_training(origin, &quantized, &image(3), &PartialQuantizationConfig::new()).unwrap();

    assert_eq!(
        rewritten.graph().node_names(),
        vec!["x", "stem", "block.fake_conv_bn.0", "block.conv_1", "output"]
    );
    assert!(rewritten.modules().get("block.conv").is_some());
    assert!(rewritten.modules().get("block.bn").is_none());
    assert_eq!(rewritten.forward(&image(3)).unwrap(), Value::tensor(vec![1, 8, 8, 8]));
}

#[test]
fn test_observers_are_independent() {
    let (origin, quantized) = scenario();

    let mut insertion = ModuleObserver::insertion(&origin);
    let mut quantization = ModuleObserver::quantization(&quantized);
    let inserts = insertion.propagate(&image(3)).unwrap();
    let fused = quantization.propagate(&image(3)).unwrap();

    assert_eq!(inserts.places, vec!["conv0", "bn0"]);
    assert_eq!(fused.places, vec!["fake_conv_bn.0"]);

    // Re-running one observer does not disturb the other's record
    let again = insertion.propagate(&image(3)).unwrap();
    assert_eq!(again.places, inserts.places);
    assert_eq!(fused.len(), 1);
}

#[test]
fn test_mismatched_sample_input_is_fatal() {
    let (origin, quantized) = scenario();
    let err = dequantization_aware_training(origin, &quantized, &image(4), &PartialQuantizationConfig::new())
        .unwrap_err();
    assert!(matches!(err, RewriteError::ShapeMismatch { .. }));
}
