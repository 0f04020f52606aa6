//! TSL, a tiny shading language for offline renderers.
//!
//! This crate compiles small, C-like shader sources into callable functions, lets you wire several of them into
//! _shader groups_ and turns any of those into independently executable _instances_. It is the material side of a
//! renderer: a shader computes a value (often a _closure tree_, a weighted sum of material responses) from a handful of
//! typed inputs, and a renderer evaluates it millions of times.
//!
//! # Shader units
//!
//! A shader unit is one source with one `shader` entry. The entry parameters are its interface: inputs are passed by
//! value, `out` parameters are written by the shader.
//!
//! ```
//! use tsl::{ShadingSystem, Value};
//!
//! let system = ShadingSystem::new();
//! let ctx = system.make_shading_context();
//! let square = ctx
//!   .compile_shader_unit("square", "shader square(float x, out float y) { y = x * x; }")
//!   .unwrap();
//!
//! let mut args = [Value::Float(2.), Value::Float(0.)];
//! square.call(&mut args).unwrap();
//! assert_eq!(args[1], Value::Float(4.));
//! ```
//!
//! Compiling a unit produces a [`ShaderUnitTemplate`]. A template is immutable and never runs by itself: you create
//! [`ShaderInstance`]s from it and resolve them. Resolving clones the template module, optimizes and verifies the clone
//! if the template allows it, then links it against everything it depends on. Every instance owns its own code, so
//! many instances of one template can be resolved and run concurrently.
//!
//! # Shader groups
//!
//! A shader group wires templates together. Members are named; the output port of a member can feed the input port of
//! another one, member ports can be _exposed_ as arguments of the group, and inputs can be given default values. Each
//! input is bound by its connection first, then its exposure, then its default. One member is the root: composing the
//! group generates a wrapper function calling every member the root depends on, dependencies first.
//!
//! A composed group is a template like any other: it can be instanced, and it can be a member of another group.
//!
//! # The runtime
//!
//! Every compiled module links against the global runtime module of its [`ShadingSystem`]. It provides:
//!
//! - the closure algebra: `closure + closure`, `closure * float` and `float * closure`;
//! - the constructors of the closure types registered with [`ShadingSystem::register_closure`], used with
//!   `make_closure<Name>(…)`;
//! - a math library (`sin`, `cos`, `pow`, … and their `f`-suffixed single precision variants);
//! - host callbacks registered with [`ShadingSystem::register_callback`], either called directly or through a
//!   prototype such as `float custom_square(float x);`.
//!
//! # Errors
//!
//! Every fallible operation returns a [`TslError`]. Failures are expected (they are usually authoring mistakes) and
//! never leave anything half-built: a template that fails to compile is not registered and its name can be reused, a
//! failed resolution leaves an instance as it was.

pub mod ast;
pub mod codegen;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod global_module;
pub mod group;
pub mod ir;
pub mod lexer;
pub mod parser;
pub mod passes;
pub mod system;
pub mod template;
pub mod types;
pub mod value;
pub mod writer;

pub use crate::{
  config::ShadingSystemConfig,
  engine::ShaderFunction,
  error::{Result, TslError},
  global_module::ClosureVar,
  group::ShaderGroupTemplate,
  system::{ShadingContext, ShadingSystem},
  template::{ShaderInstance, ShaderUnitTemplate},
  types::{ArgDescriptor, Float3, Float4, ShaderArgumentType, ShaderUnitInputDefaultValue},
  value::{ClosureId, ClosureRef, ClosureTreeNode, Value},
};
