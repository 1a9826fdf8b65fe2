//! # Hologram QAT
//!
//! Quantization-aware training graph tooling for Hologram.
//!
//! ## Overview
//!
//! This library rewrites traced module graphs for dequantization-aware
//! training: every Conv2d immediately followed by a BatchNorm2d is replaced by
//! one fused module whose structure comes from a quantized reference graph.
//!
//! ## Library Usage
//!
//! ```no_run
//! use hologram_qat::{dequantization_aware_training, PartialQuantizationConfig, Value};
//!
//! # fn traced() -> (hologram_qat::GraphModule, hologram_qat::GraphModule) { unimplemented!() }
//! let (origin, quantized) = traced();
//! let qconfig = PartialQuantizationConfig::from_json_str(r#"{"quantization_bit": 8, "momentum": 0.9}"#)?;
//! let rewritten = dequantization_aware_training(origin, &quantized, &[Value::tensor(vec![1, 3, 224, 224])], &qconfig)?;
//! # Ok::<(), hologram_qat::RewriteError>(())
//! ```

// Re-export everything from the rewriter crate
pub use hologram_qat_rewriter::*;

/// Get the version of hologram-qat
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
