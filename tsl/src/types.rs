//! Shading language types, host-facing argument tags and literal defaults.

use serde::Deserialize;
use std::fmt;

macro_rules! make_vn {
  ($t:ident, $dim:expr, $($field:ident),+) => {
    /// Single precision vector, laid out like its C counterpart.
    ///
    /// Each vector type implements [`From`] for sized arrays, so `Float3::from([1., 2., 3.])` and
    /// `[1., 2., 3.].into()` both work.
    #[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
    #[repr(C)]
    pub struct $t {
      $(pub $field: f32),+
    }

    impl $t {
      /// Build a vector from its components.
      pub const fn new($($field: f32),+) -> Self {
        Self { $($field),+ }
      }

      /// Components as an array, in declaration order.
      pub fn to_array(self) -> [f32; $dim] {
        [$(self.$field),+]
      }

      pub(crate) fn from_slice(a: &[f32]) -> Self {
        let mut it = a.iter().copied();
        Self { $($field: it.next().unwrap_or(0.)),+ }
      }
    }

    impl From<[f32; $dim]> for $t {
      fn from(a: [f32; $dim]) -> Self {
        Self::from_slice(&a)
      }
    }
  };
}

make_vn!(Float3, 3, x, y, z);
make_vn!(Float4, 4, x, y, z, w);

/// Types of the shading language.
///
/// `vector`, `color`, `normal` and `point` are all spellings of [`Type::Float3`]. Structures are referred to by name and
/// must be declared in the same shader source before being used.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Type {
  Void,
  Bool,
  Int,
  Float,
  Double,
  Float3,
  Float4,
  /// Handle on a closure tree, built with `make_closure<…>` and closure arithmetic.
  Closure,
  Struct(String),
}

impl Type {
  /// Map a type keyword to its type, if it is one.
  pub fn from_keyword(keyword: &str) -> Option<Self> {
    let ty = match keyword {
      "void" => Type::Void,
      "bool" => Type::Bool,
      "int" => Type::Int,
      "float" => Type::Float,
      "double" => Type::Double,
      "float3" | "vector" | "color" | "normal" | "point" => Type::Float3,
      "float4" => Type::Float4,
      "closure" => Type::Closure,
      _ => return None,
    };

    Some(ty)
  }

  /// Whether the type is one of the scalar types that take part in arithmetic promotion.
  pub fn is_scalar(&self) -> bool {
    self.scalar_rank().is_some()
  }

  /// Whether the type is a float vector.
  pub fn is_vector(&self) -> bool {
    matches!(self, Type::Float3 | Type::Float4)
  }

  /// Number of components of a vector type.
  pub fn components(&self) -> Option<usize> {
    match self {
      Type::Float3 => Some(3),
      Type::Float4 => Some(4),
      _ => None,
    }
  }

  /// Rank of a scalar type in the implicit promotion order `bool < int < float < double`.
  pub(crate) fn scalar_rank(&self) -> Option<u8> {
    match self {
      Type::Bool => Some(0),
      Type::Int => Some(1),
      Type::Float => Some(2),
      Type::Double => Some(3),
      _ => None,
    }
  }
}

impl fmt::Display for Type {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Type::Void => f.write_str("void"),
      Type::Bool => f.write_str("bool"),
      Type::Int => f.write_str("int"),
      Type::Float => f.write_str("float"),
      Type::Double => f.write_str("double"),
      Type::Float3 => f.write_str("float3"),
      Type::Float4 => f.write_str("float4"),
      Type::Closure => f.write_str("closure"),
      Type::Struct(name) => f.write_str(name),
    }
  }
}

/// Type tag of a value crossing the host boundary.
///
/// Shader unit parameters, exposed group arguments and closure parameters are all restricted to these types.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ShaderArgumentType {
  Int,
  Float,
  Double,
  Bool,
  Float3,
  Float4,
  Closure,
}

impl ShaderArgumentType {
  /// Language type carried by this tag.
  pub fn to_type(self) -> Type {
    match self {
      ShaderArgumentType::Int => Type::Int,
      ShaderArgumentType::Float => Type::Float,
      ShaderArgumentType::Double => Type::Double,
      ShaderArgumentType::Bool => Type::Bool,
      ShaderArgumentType::Float3 => Type::Float3,
      ShaderArgumentType::Float4 => Type::Float4,
      ShaderArgumentType::Closure => Type::Closure,
    }
  }

  /// Tag of a language type; structures and `void` have none.
  pub fn from_type(ty: &Type) -> Option<Self> {
    match ty {
      Type::Int => Some(ShaderArgumentType::Int),
      Type::Float => Some(ShaderArgumentType::Float),
      Type::Double => Some(ShaderArgumentType::Double),
      Type::Bool => Some(ShaderArgumentType::Bool),
      Type::Float3 => Some(ShaderArgumentType::Float3),
      Type::Float4 => Some(ShaderArgumentType::Float4),
      Type::Closure => Some(ShaderArgumentType::Closure),
      Type::Void | Type::Struct(_) => None,
    }
  }
}

impl fmt::Display for ShaderArgumentType {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    self.to_type().fmt(f)
  }
}

/// Argument descriptor.
///
/// Describes one parameter of a shader unit, or one argument of the interface a shader group exposes to the host.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq)]
pub struct ArgDescriptor {
  pub name: String,
  pub ty: ShaderArgumentType,
  pub is_output: bool,
}

impl ArgDescriptor {
  /// Describe an input argument.
  pub fn input(name: impl Into<String>, ty: ShaderArgumentType) -> Self {
    Self {
      name: name.into(),
      ty,
      is_output: false,
    }
  }

  /// Describe an output argument.
  pub fn output(name: impl Into<String>, ty: ShaderArgumentType) -> Self {
    Self {
      name: name.into(),
      ty,
      is_output: true,
    }
  }
}

/// Literal used for a shader group member input that is neither connected nor exposed.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ShaderUnitInputDefaultValue {
  Int(i32),
  Float(f32),
  Double(f64),
  Bool(bool),
  Float3(Float3),
  Float4(Float4),
}

impl ShaderUnitInputDefaultValue {
  /// Type tag of the literal.
  pub fn ty(&self) -> ShaderArgumentType {
    match self {
      ShaderUnitInputDefaultValue::Int(_) => ShaderArgumentType::Int,
      ShaderUnitInputDefaultValue::Float(_) => ShaderArgumentType::Float,
      ShaderUnitInputDefaultValue::Double(_) => ShaderArgumentType::Double,
      ShaderUnitInputDefaultValue::Bool(_) => ShaderArgumentType::Bool,
      ShaderUnitInputDefaultValue::Float3(_) => ShaderArgumentType::Float3,
      ShaderUnitInputDefaultValue::Float4(_) => ShaderArgumentType::Float4,
    }
  }
}

macro_rules! impl_From_default {
  ($t:ty, $variant:ident) => {
    impl From<$t> for ShaderUnitInputDefaultValue {
      fn from(a: $t) -> Self {
        ShaderUnitInputDefaultValue::$variant(a)
      }
    }
  };
}

impl_From_default!(i32, Int);
impl_From_default!(f32, Float);
impl_From_default!(f64, Double);
impl_From_default!(bool, Bool);
impl_From_default!(Float3, Float3);
impl_From_default!(Float4, Float4);

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn vector_spellings() {
    for kw in ["float3", "vector", "color", "normal", "point"] {
      assert_eq!(Type::from_keyword(kw), Some(Type::Float3));
    }

    assert_eq!(Type::from_keyword("Lambert"), None);
  }

  #[test]
  fn tags_round_trip_language_types() {
    assert_eq!(ShaderArgumentType::from_type(&Type::Struct("Foo".to_owned())), None);
    assert_eq!(
      ShaderArgumentType::from_type(&ShaderArgumentType::Closure.to_type()),
      Some(ShaderArgumentType::Closure)
    );
  }

  #[test]
  fn vectors_from_arrays() {
    let v = Float3::from([1., 2., 3.]);

    assert_eq!(v, Float3::new(1., 2., 3.));
    assert_eq!(Float4::from([1., 2., 3., 4.]).to_array(), [1., 2., 3., 4.]);
  }
}
