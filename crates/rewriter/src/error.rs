//! Error types for graph construction, interpretation and rewriting

use thiserror::Error;

/// Result type for rewriter operations
pub type Result<T> = std::result::Result<T, RewriteError>;

/// Errors that can occur while building, running or rewriting a graph
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("Unresolved target: {0}")]
    UnresolvedTarget(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("No fused quantized module named '{0}' in the reference graph")]
    MissingQuantizedModule(String),

    #[error("Cannot erase node '{node}': still used by {users:?}")]
    EraseWithUses { node: String, users: Vec<String> },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Arity mismatch in '{target}': expected {expected}, got {actual}")]
    ArityMismatch {
        target: String,
        expected: usize,
        actual: usize,
    },

    #[error("Shape mismatch in '{target}': {detail}")]
    ShapeMismatch { target: String, detail: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Duplicate node name: {0}")]
    DuplicateName(String),

    #[error("Submodule already registered: {0}")]
    DuplicateModule(String),

    #[error("Invalid quantization config: {0}")]
    InvalidConfig(String),

    #[error("Graph must be recompiled before it can run")]
    NotCompiled,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Pass failed: {0}")]
    Pass(String),
}

impl From<serde_json::Error> for RewriteError {
    fn from(err: serde_json::Error) -> Self {
        RewriteError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for RewriteError {
    fn from(err: anyhow::Error) -> Self {
        // Keep the original variant when a pass bubbled up one of ours.
        match err.downcast::<RewriteError>() {
            Ok(inner) => inner,
            Err(other) => RewriteError::Pass(other.to_string()),
        }
    }
}
