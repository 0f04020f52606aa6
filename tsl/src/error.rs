//! Errors reported by compilation, group composition, resolution and execution.
//!
//! Every entry point of the crate returns a [`Result`]. Failures are expected (most of them are authoring mistakes in
//! shader source or in a group description) and never leave a half-built template or instance behind: the host can
//! inspect the error, fix its input and try again without tearing down the [`ShadingSystem`](crate::ShadingSystem).

use thiserror::Error;

/// Errors that can occur anywhere in the shading pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TslError {
  /// The parser rejected the source text.
  #[error("syntax error at {line}:{column}: {message}")]
  Syntax {
    line: usize,
    column: usize,
    message: String,
  },

  /// A closure type, a callee or a variable was referenced but never registered or declared.
  #[error("unresolved symbol: {0}")]
  UnresolvedSymbol(String),

  /// An AST node could not produce valid code (type mismatch, invalid assignment, …).
  #[error("code generation failed: {0}")]
  Codegen(String),

  /// Structural problem in a shader group: missing or duplicate root, cycle, undefined member or port.
  #[error("shader group error: {0}")]
  Graph(String),

  /// A member parameter of a shader group could not be bound to a value.
  #[error("binding error: {0}")]
  Binding(String),

  /// Verification or linking of a compiled module failed.
  #[error("link failure: {0}")]
  Link(String),

  /// A name is already taken in the shading system registry, or the registry refused the operation.
  #[error("registry error: {0}")]
  Registry(String),

  /// Calling a resolved shader function failed.
  #[error("execution error: {0}")]
  Execution(String),

  /// Configuration could not be loaded.
  #[error("configuration error: {0}")]
  Config(String),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, TslError>;

impl TslError {
  pub(crate) fn codegen(msg: impl Into<String>) -> Self {
    TslError::Codegen(msg.into())
  }

  pub(crate) fn graph(msg: impl Into<String>) -> Self {
    TslError::Graph(msg.into())
  }

  pub(crate) fn binding(msg: impl Into<String>) -> Self {
    TslError::Binding(msg.into())
  }

  pub(crate) fn link(msg: impl Into<String>) -> Self {
    TslError::Link(msg.into())
  }

  pub(crate) fn execution(msg: impl Into<String>) -> Self {
    TslError::Execution(msg.into())
  }
}
