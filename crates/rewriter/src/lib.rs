//! # Hologram QAT Rewriter
//!
//! Traced module graphs, a node-by-node interpreter, and the
//! dequantization-aware training rewrite that fuses Conv2d/BatchNorm2d pairs.
//!
//! # Architecture
//!
//! ```text
//! traced GraphModule (original)      traced GraphModule (quantized reference)
//!            │                                    │
//!            ▼                                    ▼
//!   insertion observer                  quantization observer
//!   (Conv2d/Linear/BatchNorm2d)         (fused quantized Conv+BN)
//!            └──────────────┬─────────────────────┘
//!                           ▼
//!            match adjacent Conv2d → BatchNorm2d pairs
//!                           ▼
//!            GraphEdit: insert fused module, redirect uses, erase pair
//!                           ▼
//!            commit: validate + recompile (all or nothing)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use hologram_qat_rewriter::{dequantization_aware_training, GraphModule, PartialQuantizationConfig, Value};
//!
//! # fn traced() -> (GraphModule, GraphModule) { unimplemented!() }
//! let (origin, quantized) = traced();
//! let config = PartialQuantizationConfig::new().with_momentum(0.8);
//! let rewritten = dequantization_aware_training(origin, &quantized, &[Value::tensor(vec![1, 3, 32, 32])], &config)?;
//! println!("{}", rewritten);
//! # Ok::<(), hologram_qat_rewriter::RewriteError>(())
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod interpreter;
pub mod passes;

pub use config::{PartialQuantizationConfig, QuantizationConfig, QuantizationScheme};
pub use error::{Result, RewriteError};
pub use graph::{
    Argument, BatchNorm2dParams, CompiledCode, Conv2dParams, DConvBn, Graph, GraphEdit, GraphModule, LinearParams,
    Module, ModuleKind, ModuleRegistry, Node, NodeId, NodeOp, QConvBn, TensorMeta, Value,
};
pub use interpreter::{Environment, GraphInterpreter, Interpreter};
pub use passes::{
    dequantization_aware_training, fused_module_name, module_space, DequantizationPass, GraphPass, ModuleFilter,
    ModuleObserver, Observation, RewriteSummary,
};
