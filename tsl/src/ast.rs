//! Abstract syntax tree of shader sources.
//!
//! Nodes are plain data; each of them knows how to generate code for itself into a
//! [`CompileContext`](crate::codegen::CompileContext), see the [`codegen`](crate::codegen) module.

use crate::types::Type;
use std::collections::BTreeSet;

/// Function parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
  pub name: String,
  pub ty: Type,
  /// `out` parameters are passed by pointer and written by the callee.
  pub is_output: bool,
}

/// Function, shader entry or body-less prototype.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDecl {
  pub name: String,
  pub ret: Type,
  pub params: Vec<Param>,
  /// `None` for prototypes such as `float custom_square(float x);`, bound at link time.
  pub body: Option<Vec<Stmt>>,
  /// Whether this is the `shader` entry of its source.
  pub is_shader: bool,
}

/// Structure declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct StructDecl {
  pub name: String,
  pub fields: Vec<(String, Type)>,
}

/// Everything a shader source declares.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedProgram {
  /// The `shader` entry, if the source has one.
  pub shader: Option<FunctionDecl>,
  /// Every other function, in source order.
  pub functions: Vec<FunctionDecl>,
  pub structures: Vec<StructDecl>,
  /// Closure types referenced with `make_closure<…>`.
  pub closures: BTreeSet<String>,
}

/// Assignment operator: plain `=` or compound `+=`, `-=`, `*=`, `/=`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssignOp {
  Set,
  Add,
  Sub,
  Mul,
  Div,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
  // literals
  LitBool(bool),
  LitInt(i32),
  LitFloat(f32),
  LitDouble(f64),
  // var
  Var(String),
  // operators
  Not(Box<Self>),
  Neg(Box<Self>),
  BitNot(Box<Self>),
  And(Box<Self>, Box<Self>),
  Or(Box<Self>, Box<Self>),
  BitOr(Box<Self>, Box<Self>),
  BitAnd(Box<Self>, Box<Self>),
  BitXor(Box<Self>, Box<Self>),
  Add(Box<Self>, Box<Self>),
  Sub(Box<Self>, Box<Self>),
  Mul(Box<Self>, Box<Self>),
  Div(Box<Self>, Box<Self>),
  Rem(Box<Self>, Box<Self>),
  Shl(Box<Self>, Box<Self>),
  Shr(Box<Self>, Box<Self>),
  Eq(Box<Self>, Box<Self>),
  Neq(Box<Self>, Box<Self>),
  Lt(Box<Self>, Box<Self>),
  Lte(Box<Self>, Box<Self>),
  Gt(Box<Self>, Box<Self>),
  Gte(Box<Self>, Box<Self>),
  Ternary(Box<Self>, Box<Self>, Box<Self>),
  Assign {
    op: AssignOp,
    target: Box<Self>,
    value: Box<Self>,
  },
  /// `++x`, `x++`, `--x` and `x--`.
  IncDec {
    increment: bool,
    prefix: bool,
    target: Box<Self>,
  },
  // function call
  Call(String, Vec<Self>),
  /// `float3(…)`, `float4(…)` and scalar conversions such as `int(…)`.
  Construct(Type, Vec<Self>),
  /// `make_closure<Name>(…)`.
  MakeClosure(String, Vec<Self>),
  /// Field or component access, as in `foo.x` or `color.b`.
  Field(Box<Self>, String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
  /// `float a = 1.0, b;`
  VarDecl {
    ty: Type,
    vars: Vec<(String, Option<Expr>)>,
  },
  Expr(Expr),
  Block(Vec<Stmt>),
  If {
    cond: Expr,
    then_branch: Box<Stmt>,
    else_branch: Option<Box<Stmt>>,
  },
  While {
    cond: Expr,
    body: Box<Stmt>,
  },
  DoWhile {
    body: Box<Stmt>,
    cond: Expr,
  },
  For {
    init: Option<Box<Stmt>>,
    cond: Option<Expr>,
    step: Option<Expr>,
    body: Box<Stmt>,
  },
  Return(Option<Expr>),
  Break,
  Continue,
}
