// Values flowing through a traced graph
//
// Arguments are what a node stores: literals plus references to other nodes.
// Values are what the interpreter computes: the same literals with node
// references replaced by the producing node's result. Tensors are tracked
// by shape only.

use super::ir::NodeId;
use crate::{Result, RewriteError};
use std::fmt;

/// Shape-only tensor description
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    pub shape: Vec<usize>,
}

impl TensorMeta {
    pub fn new(shape: impl Into<Vec<usize>>) -> Self {
        Self { shape: shape.into() }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor{:?}", self.shape)
    }
}

/// A node argument: a literal or a reference to another node
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Node(NodeId),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    None,
    List(Vec<Argument>),
}

impl Argument {
    /// Every node referenced by this argument, in order of appearance
    pub fn referenced_nodes(&self, out: &mut Vec<NodeId>) {
        match self {
            Argument::Node(id) => out.push(*id),
            Argument::List(items) => items.iter().for_each(|a| a.referenced_nodes(out)),
            _ => {}
        }
    }

    /// Rewrite references to `old` into references to `new`; returns the number replaced
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> usize {
        match self {
            Argument::Node(id) if *id == old => {
                *id = new;
                1
            }
            Argument::List(items) => items.iter_mut().map(|a| a.replace_node(old, new)).sum(),
            _ => 0,
        }
    }
}

impl From<NodeId> for Argument {
    fn from(id: NodeId) -> Self {
        Argument::Node(id)
    }
}

impl From<i64> for Argument {
    fn from(v: i64) -> Self {
        Argument::Int(v)
    }
}

impl From<f64> for Argument {
    fn from(v: f64) -> Self {
        Argument::Float(v)
    }
}

impl From<bool> for Argument {
    fn from(v: bool) -> Self {
        Argument::Bool(v)
    }
}

impl From<&str> for Argument {
    fn from(v: &str) -> Self {
        Argument::Str(v.to_string())
    }
}

/// A value computed by the interpreter
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tensor(TensorMeta),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    None,
    List(Vec<Value>),
}

impl Value {
    pub fn tensor(shape: impl Into<Vec<usize>>) -> Self {
        Value::Tensor(TensorMeta::new(shape))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::None => "none",
            Value::List(_) => "list",
        }
    }

    /// Borrow as a tensor, or fail naming the consumer
    pub fn as_tensor(&self, target: &str) -> Result<&TensorMeta> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(RewriteError::InvalidArgument(format!(
                "'{}' expected a tensor, got {}",
                target,
                other.type_name()
            ))),
        }
    }

    pub fn as_int(&self, target: &str) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(RewriteError::InvalidArgument(format!(
                "'{}' expected an int, got {}",
                target,
                other.type_name()
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tensor(t) => write!(f, "{}", t),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{:?}", v),
            Value::None => write!(f, "None"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}
