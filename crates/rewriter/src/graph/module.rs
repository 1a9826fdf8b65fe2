// Submodules referenced by call_module nodes
//
// Module kinds are a closed set. Each variant carries only the structural
// parameters the rewriter needs plus enough to infer output shapes, so a
// graph can be interpreted without tensor kernels.

use super::value::{TensorMeta, Value};
use crate::config::QuantizationConfig;
use crate::{Result, RewriteError};
use std::collections::BTreeMap;
use std::fmt;

/// Fieldless tag identifying a module variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Conv2d,
    BatchNorm2d,
    Linear,
    ReLU,
    Identity,
    Flatten,
    MaxPool2d,
    QConvBn,
    DConvBn,
}

impl ModuleKind {
    /// Plain layers the insertion observer records
    pub fn is_traceable(&self) -> bool {
        matches!(self, ModuleKind::Conv2d | ModuleKind::Linear | ModuleKind::BatchNorm2d)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Conv2d => "Conv2d",
            ModuleKind::BatchNorm2d => "BatchNorm2d",
            ModuleKind::Linear => "Linear",
            ModuleKind::ReLU => "ReLU",
            ModuleKind::Identity => "Identity",
            ModuleKind::Flatten => "Flatten",
            ModuleKind::MaxPool2d => "MaxPool2d",
            ModuleKind::QConvBn => "QConvBN",
            ModuleKind::DConvBn => "DConvBN",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural parameters of a 2D convolution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Conv2dParams {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub groups: usize,
    pub bias: bool,
}

impl Conv2dParams {
    /// Square kernel, stride 1, no padding, dilation 1, one group, with bias
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size: [kernel_size; 2],
            stride: [1; 2],
            padding: [0; 2],
            dilation: [1; 2],
            groups: 1,
            bias: true,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = [stride; 2];
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = [padding; 2];
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = [dilation; 2];
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    fn output_shape(&self, target: &str, input: &TensorMeta) -> Result<TensorMeta> {
        if input.rank() != 4 {
            return Err(shape_error(target, format!("expected NCHW input, got {}", input)));
        }
        if input.shape[1] != self.in_channels {
            return Err(shape_error(
                target,
                format!("expected {} input channels, got {}", self.in_channels, input.shape[1]),
            ));
        }
        if self.groups == 0 || self.in_channels % self.groups != 0 || self.out_channels % self.groups != 0 {
            return Err(shape_error(
                target,
                format!(
                    "groups={} must divide in_channels={} and out_channels={}",
                    self.groups, self.in_channels, self.out_channels
                ),
            ));
        }
        let h = window_output(target, input.shape[2], self.kernel_size[0], self.stride[0], self.padding[0], self.dilation[0])?;
        let w = window_output(target, input.shape[3], self.kernel_size[1], self.stride[1], self.padding[1], self.dilation[1])?;
        Ok(TensorMeta::new(vec![input.shape[0], self.out_channels, h, w]))
    }
}

/// Structural parameters of a 2D batch normalization
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNorm2dParams {
    pub num_features: usize,
    pub eps: f64,
    pub momentum: f64,
    pub affine: bool,
    pub track_running_stats: bool,
}

impl BatchNorm2dParams {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
            affine: true,
            track_running_stats: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearParams {
    pub in_features: usize,
    pub out_features: usize,
    pub bias: bool,
}

/// Fused quantized Conv+BatchNorm block found in a quantized reference graph
#[derive(Debug, Clone, PartialEq)]
pub struct QConvBn {
    pub conv_module: Conv2dParams,
    pub bn_module: BatchNorm2dParams,
    pub config: QuantizationConfig,
}

/// Dequantization-aware fused Conv+BatchNorm inserted by the rewriter
#[derive(Debug, Clone, PartialEq)]
pub struct DConvBn {
    pub conv: Conv2dParams,
    pub config: QuantizationConfig,
}

impl DConvBn {
    pub fn new(conv: Conv2dParams, config: QuantizationConfig) -> Self {
        Self { conv, config }
    }
}

/// A submodule instance
#[derive(Debug, Clone, PartialEq)]
pub enum Module {
    Conv2d(Conv2dParams),
    BatchNorm2d(BatchNorm2dParams),
    Linear(LinearParams),
    ReLU,
    Identity,
    Flatten { start_dim: usize },
    MaxPool2d { kernel_size: usize, stride: usize },
    QConvBn(QConvBn),
    DConvBn(DConvBn),
}

impl Module {
    pub fn linear(in_features: usize, out_features: usize) -> Self {
        Module::Linear(LinearParams {
            in_features,
            out_features,
            bias: true,
        })
    }

    pub fn kind(&self) -> ModuleKind {
        match self {
            Module::Conv2d(_) => ModuleKind::Conv2d,
            Module::BatchNorm2d(_) => ModuleKind::BatchNorm2d,
            Module::Linear(_) => ModuleKind::Linear,
            Module::ReLU => ModuleKind::ReLU,
            Module::Identity => ModuleKind::Identity,
            Module::Flatten { .. } => ModuleKind::Flatten,
            Module::MaxPool2d { .. } => ModuleKind::MaxPool2d,
            Module::QConvBn(_) => ModuleKind::QConvBn,
            Module::DConvBn(_) => ModuleKind::DConvBn,
        }
    }

    /// Convolution parameters, for the module kinds that have them
    pub fn conv_params(&self) -> Option<&Conv2dParams> {
        match self {
            Module::Conv2d(p) => Some(p),
            Module::QConvBn(q) => Some(&q.conv_module),
            Module::DConvBn(d) => Some(&d.conv),
            _ => None,
        }
    }

    /// Invoke the module on already resolved arguments
    pub fn forward(&self, target: &str, args: &[Value], kwargs: &BTreeMap<String, Value>) -> Result<Value> {
        if args.len() != 1 {
            return Err(RewriteError::ArityMismatch {
                target: target.to_string(),
                expected: 1,
                actual: args.len(),
            });
        }
        if let Some(key) = kwargs.keys().next() {
            return Err(RewriteError::InvalidArgument(format!(
                "module '{}' does not accept keyword '{}'",
                target, key
            )));
        }
        let input = args[0].as_tensor(target)?;

        let out = match self {
            Module::Conv2d(p) => p.output_shape(target, input)?,
            Module::QConvBn(q) => q.conv_module.output_shape(target, input)?,
            Module::DConvBn(d) => d.conv.output_shape(target, input)?,
            Module::BatchNorm2d(p) => {
                if input.rank() != 4 || input.shape[1] != p.num_features {
                    return Err(shape_error(
                        target,
                        format!("expected NCHW input with {} channels, got {}", p.num_features, input),
                    ));
                }
                input.clone()
            }
            Module::Linear(p) => {
                match input.shape.last() {
                    Some(&last) if last == p.in_features => {}
                    _ => {
                        return Err(shape_error(
                            target,
                            format!("expected last dimension {}, got {}", p.in_features, input),
                        ))
                    }
                }
                let mut shape = input.shape.clone();
                let rank = shape.len();
                shape[rank - 1] = p.out_features;
                TensorMeta::new(shape)
            }
            Module::ReLU | Module::Identity => input.clone(),
            Module::Flatten { start_dim } => flatten_shape(target, input, *start_dim)?,
            Module::MaxPool2d { kernel_size, stride } => {
                if input.rank() != 4 {
                    return Err(shape_error(target, format!("expected NCHW input, got {}", input)));
                }
                let h = window_output(target, input.shape[2], *kernel_size, *stride, 0, 1)?;
                let w = window_output(target, input.shape[3], *kernel_size, *stride, 0, 1)?;
                TensorMeta::new(vec![input.shape[0], input.shape[1], h, w])
            }
        };
        Ok(Value::Tensor(out))
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Module::Conv2d(p) => write!(f, "Conv2d({}, {}, kernel_size={:?}, stride={:?})", p.in_channels, p.out_channels, p.kernel_size, p.stride),
            Module::BatchNorm2d(p) => write!(f, "BatchNorm2d({}, eps={})", p.num_features, p.eps),
            Module::Linear(p) => write!(f, "Linear(in_features={}, out_features={})", p.in_features, p.out_features),
            Module::ReLU => write!(f, "ReLU()"),
            Module::Identity => write!(f, "Identity()"),
            Module::Flatten { start_dim } => write!(f, "Flatten(start_dim={})", start_dim),
            Module::MaxPool2d { kernel_size, stride } => write!(f, "MaxPool2d(kernel_size={}, stride={})", kernel_size, stride),
            Module::QConvBn(q) => write!(f, "QConvBN({}, {}, {})", q.conv_module.in_channels, q.conv_module.out_channels, q.config),
            Module::DConvBn(d) => write!(f, "DConvBN({}, {}, {})", d.conv.in_channels, d.conv.out_channels, d.config),
        }
    }
}

/// Flatten dims `start_dim..` into one
pub(crate) fn flatten_shape(target: &str, input: &TensorMeta, start_dim: usize) -> Result<TensorMeta> {
    if start_dim >= input.rank().max(1) {
        return Err(shape_error(target, format!("start_dim {} out of range for {}", start_dim, input)));
    }
    let mut shape: Vec<usize> = input.shape[..start_dim].to_vec();
    shape.push(input.shape[start_dim..].iter().product());
    Ok(TensorMeta::new(shape))
}

fn window_output(target: &str, size: usize, kernel: usize, stride: usize, padding: usize, dilation: usize) -> Result<usize> {
    let misfit = || {
        shape_error(
            target,
            format!("window kernel={} stride={} dilation={} does not fit size {} (padding {})", kernel, stride, dilation, size, padding),
        )
    };
    let span = dilation
        .checked_mul(kernel.saturating_sub(1))
        .and_then(|s| s.checked_add(1))
        .ok_or_else(misfit)?;
    let padded = padding
        .checked_mul(2)
        .and_then(|p| p.checked_add(size))
        .ok_or_else(misfit)?;
    if stride == 0 || kernel == 0 || padded < span {
        return Err(misfit());
    }
    Ok((padded - span) / stride + 1)
}

fn shape_error(target: &str, detail: String) -> RewriteError {
    RewriteError::ShapeMismatch {
        target: target.to_string(),
        detail,
    }
}

/// Submodule registry keyed by dotted hierarchical path
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Module>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under `name`
    ///
    /// Fails if the path is empty or already taken.
    pub fn add_submodule(&mut self, name: impl Into<String>, module: Module) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.split('.').any(str::is_empty) {
            return Err(RewriteError::InvalidArgument(format!("invalid submodule path '{}'", name)));
        }
        if self.modules.contains_key(&name) {
            return Err(RewriteError::DuplicateModule(name));
        }
        self.modules.insert(name, module);
        Ok(())
    }

    /// Remove a module; returns whether it existed
    pub fn delete_submodule(&mut self, name: &str) -> bool {
        self.modules.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Modules nested directly or transitively under `prefix`
    pub fn children_of<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a Module)> + 'a {
        self.modules
            .iter()
            .filter(move |(name, _)| {
                name.strip_prefix(prefix)
                    .map_or(false, |rest| prefix.is_empty() || rest.starts_with('.'))
            })
            .map(|(name, module)| (name.as_str(), module))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.modules.iter().map(|(name, module)| (name.as_str(), module))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
