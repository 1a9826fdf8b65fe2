//! Quantization configuration
//!
//! Callers hand the rewriter a partial mapping of options. Any key they leave
//! out falls back to a default, and keys the rewriter does not know are
//! ignored. Once resolved, a [`QuantizationConfig`] is read-only for the
//! duration of a pass.

use crate::{Result, RewriteError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default bit width
pub const DEFAULT_QUANTIZATION_BIT: u32 = 8;
/// Default quantization formula tag
pub const DEFAULT_QUANTIZATION_FORMULA: &str = "google";
/// Default running statistics momentum
pub const DEFAULT_MOMENTUM: f64 = 0.95;

/// Symmetric or asymmetric (affine) quantization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationScheme {
    #[default]
    Symmetric,
    #[serde(alias = "affine")]
    Asymmetric,
}

impl QuantizationScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantizationScheme::Symmetric => "symmetric",
            QuantizationScheme::Asymmetric => "asymmetric",
        }
    }
}

impl fmt::Display for QuantizationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied options; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialQuantizationConfig {
    pub quantization_bit: Option<u32>,
    pub quantization_scheme: Option<QuantizationScheme>,
    pub quantization_formula: Option<String>,
    pub per_layer_quantization: Option<bool>,
    pub momentum: Option<f64>,
}

impl PartialQuantizationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a JSON object such as `{"momentum": 0.8}`
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse from an already decoded JSON value
    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(RewriteError::InvalidConfig(format!(
                "expected a JSON object, got {}",
                value
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn with_quantization_bit(mut self, bit: u32) -> Self {
        self.quantization_bit = Some(bit);
        self
    }

    pub fn with_quantization_scheme(mut self, scheme: QuantizationScheme) -> Self {
        self.quantization_scheme = Some(scheme);
        self
    }

    pub fn with_quantization_formula(mut self, formula: impl Into<String>) -> Self {
        self.quantization_formula = Some(formula.into());
        self
    }

    pub fn with_per_layer_quantization(mut self, per_layer: bool) -> Self {
        self.per_layer_quantization = Some(per_layer);
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = Some(momentum);
        self
    }
}

/// Fully resolved quantization options
///
/// Deserializing goes through [`PartialQuantizationConfig`] and
/// [`QuantizationConfig::resolve`], so a decoded config is always validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PartialQuantizationConfig")]
pub struct QuantizationConfig {
    quantization_bit: u32,
    quantization_scheme: QuantizationScheme,
    quantization_formula: String,
    per_layer_quantization: bool,
    momentum: f64,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            quantization_bit: DEFAULT_QUANTIZATION_BIT,
            quantization_scheme: QuantizationScheme::Symmetric,
            quantization_formula: DEFAULT_QUANTIZATION_FORMULA.to_string(),
            per_layer_quantization: true,
            momentum: DEFAULT_MOMENTUM,
        }
    }
}

impl QuantizationConfig {
    /// Merge a partial mapping over the defaults
    ///
    /// # Errors
    ///
    /// Returns [`RewriteError::InvalidConfig`] if `momentum` is outside
    /// `[0, 1]` or `quantization_bit` is outside `1..=32`.
    pub fn resolve(partial: &PartialQuantizationConfig) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            quantization_bit: partial.quantization_bit.unwrap_or(defaults.quantization_bit),
            quantization_scheme: partial
                .quantization_scheme
                .unwrap_or(defaults.quantization_scheme),
            quantization_formula: partial
                .quantization_formula
                .clone()
                .unwrap_or(defaults.quantization_formula),
            per_layer_quantization: partial
                .per_layer_quantization
                .unwrap_or(defaults.per_layer_quantization),
            momentum: partial.momentum.unwrap_or(defaults.momentum),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=32).contains(&self.quantization_bit) {
            return Err(RewriteError::InvalidConfig(format!(
                "quantization_bit must be in 1..=32, got {}",
                self.quantization_bit
            )));
        }
        if !self.momentum.is_finite() || !(0.0..=1.0).contains(&self.momentum) {
            return Err(RewriteError::InvalidConfig(format!(
                "momentum must be in [0, 1], got {}",
                self.momentum
            )));
        }
        Ok(())
    }

    pub fn quantization_bit(&self) -> u32 {
        self.quantization_bit
    }

    pub fn quantization_scheme(&self) -> QuantizationScheme {
        self.quantization_scheme
    }

    pub fn quantization_formula(&self) -> &str {
        &self.quantization_formula
    }

    pub fn per_layer_quantization(&self) -> bool {
        self.per_layer_quantization
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }
}

impl TryFrom<PartialQuantizationConfig> for QuantizationConfig {
    type Error = RewriteError;

    fn try_from(partial: PartialQuantizationConfig) -> Result<Self> {
        Self::resolve(&partial)
    }
}

impl fmt::Display for QuantizationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bit={}, scheme={}, formula={}, per_layer={}, momentum={}",
            self.quantization_bit,
            self.quantization_scheme,
            self.quantization_formula,
            self.per_layer_quantization,
            self.momentum
        )
    }
}
