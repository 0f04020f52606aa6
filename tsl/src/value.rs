//! Runtime values and closure trees.
//!
//! [`Value`] is what flows in and out of a resolved [`ShaderFunction`](crate::ShaderFunction): hosts build input values
//! and read output values back after a call. Closures are represented as immutable, reference-counted trees of
//! [`ClosureTreeNode`]s, so a tree built by one shader can be shared freely with the host or with other shaders.

use crate::types::{Float3, Float4, ShaderArgumentType, ShaderUnitInputDefaultValue, Type};
use std::{fmt, sync::Arc};

/// Identifier of a closure type.
///
/// The two first identifiers are reserved for the closure algebra nodes; registered closure types get identifiers
/// starting at [`ClosureId::FIRST_USER`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClosureId(pub u32);

impl ClosureId {
  /// Identifier of [`ClosureTreeNode::Add`].
  pub const ADD: ClosureId = ClosureId(1);

  /// Identifier of [`ClosureTreeNode::Mul`].
  pub const MUL: ClosureId = ClosureId(2);

  /// First identifier handed out to registered closure types.
  pub const FIRST_USER: ClosureId = ClosureId(3);
}

impl fmt::Display for ClosureId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Shared handle on a closure tree node.
pub type ClosureRef = Arc<ClosureTreeNode>;

/// Node of a closure tree.
#[derive(Clone, Debug, PartialEq)]
pub enum ClosureTreeNode {
  /// Sum of two closures.
  Add(ClosureRef, ClosureRef),
  /// Closure scaled by a weight.
  Mul { weight: f32, closure: ClosureRef },
  /// Leaf built by `make_closure<Name>(…)`; `params` follow the registered parameter layout.
  Bxdf { id: ClosureId, params: Vec<Value> },
}

impl ClosureTreeNode {
  /// Identifier of the node, algebra nodes included.
  pub fn id(&self) -> ClosureId {
    match self {
      ClosureTreeNode::Add(..) => ClosureId::ADD,
      ClosureTreeNode::Mul { .. } => ClosureId::MUL,
      ClosureTreeNode::Bxdf { id, .. } => *id,
    }
  }
}

/// Sum of two, possibly null, closures.
///
/// A null operand is the neutral element: `a + null = a` and `null + b = b`.
pub fn closure_add(a: Option<ClosureRef>, b: Option<ClosureRef>) -> Option<ClosureRef> {
  match (a, b) {
    (Some(a), Some(b)) => Some(Arc::new(ClosureTreeNode::Add(a, b))),
    (a, None) => a,
    (None, b) => b,
  }
}

/// Scale a, possibly null, closure; a null closure stays null.
pub fn closure_mul(closure: Option<ClosureRef>, weight: f32) -> Option<ClosureRef> {
  closure.map(|closure| Arc::new(ClosureTreeNode::Mul { weight, closure }))
}

/// Location in the memory of a running shader.
///
/// `cell` is a stack slot; `path` walks into structure fields and vector components from there.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Pointer {
  pub cell: usize,
  pub path: Vec<u32>,
}

/// Runtime value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
  Void,
  Bool(bool),
  Int(i32),
  Float(f32),
  Double(f64),
  Float3(Float3),
  Float4(Float4),
  /// `None` is the null closure.
  Closure(Option<ClosureRef>),
  Struct(Vec<Value>),
  Ptr(Pointer),
}

impl Value {
  /// Zero value of a non-structure type.
  ///
  /// Structures need their layout and are zeroed by the module that declares them.
  pub fn zero(ty: &Type) -> Self {
    match ty {
      Type::Void | Type::Struct(_) => Value::Void,
      Type::Bool => Value::Bool(false),
      Type::Int => Value::Int(0),
      Type::Float => Value::Float(0.),
      Type::Double => Value::Double(0.),
      Type::Float3 => Value::Float3(Float3::default()),
      Type::Float4 => Value::Float4(Float4::default()),
      Type::Closure => Value::Closure(None),
    }
  }

  /// Type tag of the value, if it can cross the host boundary.
  pub fn arg_type(&self) -> Option<ShaderArgumentType> {
    match self {
      Value::Bool(_) => Some(ShaderArgumentType::Bool),
      Value::Int(_) => Some(ShaderArgumentType::Int),
      Value::Float(_) => Some(ShaderArgumentType::Float),
      Value::Double(_) => Some(ShaderArgumentType::Double),
      Value::Float3(_) => Some(ShaderArgumentType::Float3),
      Value::Float4(_) => Some(ShaderArgumentType::Float4),
      Value::Closure(_) => Some(ShaderArgumentType::Closure),
      Value::Void | Value::Struct(_) | Value::Ptr(_) => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match *self {
      Value::Bool(b) => Some(b),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i32> {
    match *self {
      Value::Int(i) => Some(i),
      _ => None,
    }
  }

  pub fn as_float(&self) -> Option<f32> {
    match *self {
      Value::Float(x) => Some(x),
      _ => None,
    }
  }

  pub fn as_double(&self) -> Option<f64> {
    match *self {
      Value::Double(x) => Some(x),
      _ => None,
    }
  }

  pub fn as_float3(&self) -> Option<Float3> {
    match *self {
      Value::Float3(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_float4(&self) -> Option<Float4> {
    match *self {
      Value::Float4(v) => Some(v),
      _ => None,
    }
  }

  /// Closure carried by the value; `None` both for the null closure and for non-closure values.
  pub fn as_closure(&self) -> Option<&ClosureRef> {
    match self {
      Value::Closure(c) => c.as_ref(),
      _ => None,
    }
  }

  /// Component `index` of a vector or field `index` of a structure.
  pub(crate) fn component(&self, index: u32) -> Option<Value> {
    let index = index as usize;

    match self {
      Value::Float3(v) => v.to_array().get(index).copied().map(Value::Float),
      Value::Float4(v) => v.to_array().get(index).copied().map(Value::Float),
      Value::Struct(fields) => fields.get(index).cloned(),
      _ => None,
    }
  }

  /// Follow `path` into the value, returning the addressed sub-value.
  pub(crate) fn get_path(&self, path: &[u32]) -> Option<Value> {
    match path.split_first() {
      None => Some(self.clone()),
      Some((&head, rest)) => self.component(head)?.get_path(rest),
    }
  }

  /// Replace the sub-value addressed by `path`. Returns `false` if the path does not exist or the types disagree.
  pub(crate) fn set_path(&mut self, path: &[u32], value: Value) -> bool {
    let Some((&head, rest)) = path.split_first() else {
      *self = value;
      return true;
    };

    let index = head as usize;

    match self {
      Value::Struct(fields) => match fields.get_mut(index) {
        Some(field) => field.set_path(rest, value),
        None => false,
      },

      Value::Float3(v) => {
        let (Some(x), true) = (value.as_float(), rest.is_empty()) else {
          return false;
        };
        let mut a = v.to_array();

        match a.get_mut(index) {
          Some(c) => {
            *c = x;
            *v = Float3::from(a);
            true
          }
          None => false,
        }
      }

      Value::Float4(v) => {
        let (Some(x), true) = (value.as_float(), rest.is_empty()) else {
          return false;
        };
        let mut a = v.to_array();

        match a.get_mut(index) {
          Some(c) => {
            *c = x;
            *v = Float4::from(a);
            true
          }
          None => false,
        }
      }

      _ => false,
    }
  }
}

impl From<ShaderUnitInputDefaultValue> for Value {
  fn from(a: ShaderUnitInputDefaultValue) -> Self {
    match a {
      ShaderUnitInputDefaultValue::Int(i) => Value::Int(i),
      ShaderUnitInputDefaultValue::Float(x) => Value::Float(x),
      ShaderUnitInputDefaultValue::Double(x) => Value::Double(x),
      ShaderUnitInputDefaultValue::Bool(b) => Value::Bool(b),
      ShaderUnitInputDefaultValue::Float3(v) => Value::Float3(v),
      ShaderUnitInputDefaultValue::Float4(v) => Value::Float4(v),
    }
  }
}

impl ShaderUnitInputDefaultValue {
  /// Value of the literal as an argument of type `ty`.
  ///
  /// Only numeric widenings are applied (`bool → int`, `int → float`, `int → double`, `float → double`); `None` if
  /// the literal does not fit the type.
  pub fn coerce(self, ty: ShaderArgumentType) -> Option<Value> {
    use ShaderUnitInputDefaultValue as D;

    let value = match (self, ty) {
      (d, ty) if d.ty() == ty => Value::from(d),
      (D::Bool(b), ShaderArgumentType::Int) => Value::Int(i32::from(b)),
      (D::Int(i), ShaderArgumentType::Float) => Value::Float(i as f32),
      (D::Int(i), ShaderArgumentType::Double) => Value::Double(f64::from(i)),
      (D::Float(x), ShaderArgumentType::Double) => Value::Double(f64::from(x)),
      _ => return None,
    };

    Some(value)
  }
}

macro_rules! impl_From_value {
  ($t:ty, $variant:ident) => {
    impl From<$t> for Value {
      fn from(a: $t) -> Self {
        Value::$variant(a)
      }
    }
  };
}

impl_From_value!(bool, Bool);
impl_From_value!(i32, Int);
impl_From_value!(f32, Float);
impl_From_value!(f64, Double);
impl_From_value!(Float3, Float3);
impl_From_value!(Float4, Float4);

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Value::Void => f.write_str("void"),
      Value::Bool(b) => write!(f, "{}", b),
      Value::Int(i) => write!(f, "{}", i),
      Value::Float(x) => write!(f, "{:?}f", x),
      Value::Double(x) => write!(f, "{:?}d", x),
      Value::Float3(v) => write!(f, "float3({:?}, {:?}, {:?})", v.x, v.y, v.z),
      Value::Float4(v) => write!(f, "float4({:?}, {:?}, {:?}, {:?})", v.x, v.y, v.z, v.w),
      Value::Closure(None) => f.write_str("null_closure"),
      Value::Closure(Some(c)) => write!(f, "closure{}", c.id()),

      Value::Struct(fields) => {
        f.write_str("{")?;

        for (i, field) in fields.iter().enumerate() {
          if i > 0 {
            f.write_str(", ")?;
          }

          write!(f, "{}", field)?;
        }

        f.write_str("}")
      }

      Value::Ptr(p) => write!(f, "&{}{:?}", p.cell, p.path),
    }
  }
}
