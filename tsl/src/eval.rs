//! Evaluation of pure operations over runtime values.
//!
//! Shared by the interpreter and by constant folding so both agree on every result. Integer arithmetic wraps, and
//! integer division or remainder by zero yields zero.

use crate::{
  error::{Result, TslError},
  ir::{BinOp, CmpOp, IrType, StructTable, UnOp},
  types::{Float3, Float4},
  value::Value,
};

fn mismatch(what: &str, a: &Value, b: &Value) -> TslError {
  TslError::execution(format!("cannot apply {} to {} and {}", what, a, b))
}

fn int_op(op: BinOp, a: i32, b: i32) -> i32 {
  match op {
    BinOp::Add => a.wrapping_add(b),
    BinOp::Sub => a.wrapping_sub(b),
    BinOp::Mul => a.wrapping_mul(b),
    BinOp::Div => a.checked_div(b).unwrap_or(0),
    BinOp::Rem => a.checked_rem(b).unwrap_or(0),
    BinOp::Shl => a.wrapping_shl(b as u32),
    BinOp::Shr => a.wrapping_shr(b as u32),
    BinOp::BitAnd => a & b,
    BinOp::BitOr => a | b,
    BinOp::BitXor => a ^ b,
  }
}

macro_rules! float_op {
  ($op:expr, $a:expr, $b:expr) => {
    match $op {
      BinOp::Add => Some($a + $b),
      BinOp::Sub => Some($a - $b),
      BinOp::Mul => Some($a * $b),
      BinOp::Div => Some($a / $b),
      BinOp::Rem => Some($a % $b),
      _ => None,
    }
  };
}

fn zip_vec<const N: usize>(op: BinOp, a: [f32; N], b: [f32; N]) -> Option<[f32; N]> {
  let mut out = [0.; N];

  for i in 0..N {
    out[i] = float_op!(op, a[i], b[i])?;
  }

  Some(out)
}

/// Binary arithmetic over two operands of the same type.
pub fn binary(op: BinOp, a: &Value, b: &Value) -> Result<Value> {
  let r = match (a, b) {
    (Value::Int(x), Value::Int(y)) => Some(Value::Int(int_op(op, *x, *y))),
    (Value::Float(x), Value::Float(y)) => float_op!(op, x, y).map(Value::Float),
    (Value::Double(x), Value::Double(y)) => float_op!(op, x, y).map(Value::Double),
    (Value::Float3(x), Value::Float3(y)) => {
      zip_vec(op, x.to_array(), y.to_array()).map(|v| Value::Float3(Float3::from(v)))
    }
    (Value::Float4(x), Value::Float4(y)) => {
      zip_vec(op, x.to_array(), y.to_array()).map(|v| Value::Float4(Float4::from(v)))
    }
    (Value::Bool(x), Value::Bool(y)) => match op {
      BinOp::BitAnd => Some(Value::Bool(x & y)),
      BinOp::BitOr => Some(Value::Bool(x | y)),
      BinOp::BitXor => Some(Value::Bool(x ^ y)),
      _ => None,
    },
    _ => None,
  };

  r.ok_or_else(|| mismatch(&format!("{:?}", op), a, b))
}

macro_rules! cmp {
  ($op:expr, $a:expr, $b:expr) => {
    match $op {
      CmpOp::Eq => $a == $b,
      CmpOp::Ne => $a != $b,
      CmpOp::Lt => $a < $b,
      CmpOp::Le => $a <= $b,
      CmpOp::Gt => $a > $b,
      CmpOp::Ge => $a >= $b,
    }
  };
}

/// Comparison of two operands of the same type.
pub fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<Value> {
  let r = match (a, b) {
    (Value::Bool(x), Value::Bool(y)) => cmp!(op, x, y),
    (Value::Int(x), Value::Int(y)) => cmp!(op, x, y),
    (Value::Float(x), Value::Float(y)) => cmp!(op, x, y),
    (Value::Double(x), Value::Double(y)) => cmp!(op, x, y),
    (Value::Float3(_), Value::Float3(_)) | (Value::Float4(_), Value::Float4(_)) => match op {
      CmpOp::Eq => a == b,
      CmpOp::Ne => a != b,
      _ => return Err(mismatch(&format!("{:?}", op), a, b)),
    },
    _ => return Err(mismatch(&format!("{:?}", op), a, b)),
  };

  Ok(Value::Bool(r))
}

pub fn unary(op: UnOp, a: &Value) -> Result<Value> {
  let r = match (op, a) {
    (UnOp::Neg, Value::Int(x)) => Value::Int(x.wrapping_neg()),
    (UnOp::Neg, Value::Float(x)) => Value::Float(-x),
    (UnOp::Neg, Value::Double(x)) => Value::Double(-x),
    (UnOp::Neg, Value::Float3(v)) => Value::Float3(Float3::new(-v.x, -v.y, -v.z)),
    (UnOp::Neg, Value::Float4(v)) => Value::Float4(Float4::new(-v.x, -v.y, -v.z, -v.w)),
    (UnOp::Not, Value::Bool(b)) => Value::Bool(!b),
    (UnOp::BitNot, Value::Int(x)) => Value::Int(!x),
    _ => {
      return Err(TslError::execution(format!(
        "cannot apply {:?} to {}",
        op, a
      )))
    }
  };

  Ok(r)
}

/// Scalar conversion; converting a value to its own type is the identity.
pub fn cast(a: &Value, to: &IrType) -> Result<Value> {
  let r = match (a, to) {
    (Value::Bool(b), IrType::I1) => Value::Bool(*b),
    (Value::Bool(b), IrType::I32) => Value::Int(*b as i32),
    (Value::Bool(b), IrType::F32) => Value::Float(*b as i32 as f32),
    (Value::Bool(b), IrType::F64) => Value::Double(*b as i32 as f64),

    (Value::Int(x), IrType::I1) => Value::Bool(*x != 0),
    (Value::Int(x), IrType::I32) => Value::Int(*x),
    (Value::Int(x), IrType::F32) => Value::Float(*x as f32),
    (Value::Int(x), IrType::F64) => Value::Double(*x as f64),

    (Value::Float(x), IrType::I1) => Value::Bool(*x != 0.),
    (Value::Float(x), IrType::I32) => Value::Int(*x as i32),
    (Value::Float(x), IrType::F32) => Value::Float(*x),
    (Value::Float(x), IrType::F64) => Value::Double(*x as f64),

    (Value::Double(x), IrType::I1) => Value::Bool(*x != 0.),
    (Value::Double(x), IrType::I32) => Value::Int(*x as i32),
    (Value::Double(x), IrType::F32) => Value::Float(*x as f32),
    (Value::Double(x), IrType::F64) => Value::Double(*x),

    (Value::Float3(_), IrType::Float3) | (Value::Float4(_), IrType::Float4) => a.clone(),

    _ => {
      return Err(TslError::execution(format!(
        "cannot convert {} to {:?}",
        a, to
      )))
    }
  };

  Ok(r)
}

/// Broadcast a scalar to every component of a vector type.
pub fn splat(a: &Value, to: &IrType) -> Result<Value> {
  let Value::Float(x) = cast(a, &IrType::F32)? else {
    return Err(TslError::execution(format!("cannot splat {}", a)));
  };

  match to {
    IrType::Float3 => Ok(Value::Float3(Float3::new(x, x, x))),
    IrType::Float4 => Ok(Value::Float4(Float4::new(x, x, x, x))),
    _ => Err(TslError::execution(format!("cannot splat {} to {:?}", a, to))),
  }
}

/// Build an aggregate of type `ty` from its components.
pub fn compose(ty: &IrType, components: Vec<Value>, structs: &StructTable) -> Result<Value> {
  let floats = || -> Result<Vec<f32>> {
    components
      .iter()
      .map(|c| {
        c.as_float()
          .ok_or_else(|| TslError::execution(format!("vector component {} is not a float", c)))
      })
      .collect()
  };

  match ty {
    IrType::Float3 if components.len() == 3 => Ok(Value::Float3(Float3::from_slice(&floats()?))),
    IrType::Float4 if components.len() == 4 => Ok(Value::Float4(Float4::from_slice(&floats()?))),
    IrType::Struct(name)
      if structs
        .get(name)
        .is_some_and(|layout| layout.fields.len() == components.len()) =>
    {
      Ok(Value::Struct(components))
    }
    _ => Err(TslError::execution(format!(
      "cannot build {:?} from {} components",
      ty,
      components.len()
    ))),
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn integer_arithmetic_wraps_and_divides_safely() {
    assert_eq!(
      binary(BinOp::Add, &Value::Int(i32::MAX), &Value::Int(1)).unwrap(),
      Value::Int(i32::MIN)
    );
    assert_eq!(
      binary(BinOp::Div, &Value::Int(7), &Value::Int(0)).unwrap(),
      Value::Int(0)
    );
    assert_eq!(
      binary(BinOp::Rem, &Value::Int(7), &Value::Int(3)).unwrap(),
      Value::Int(1)
    );
  }

  #[test]
  fn vectors_are_componentwise() {
    let a = Value::Float3(Float3::new(1., 2., 3.));
    let b = Value::Float3(Float3::new(2., 2., 2.));

    assert_eq!(
      binary(BinOp::Mul, &a, &b).unwrap(),
      Value::Float3(Float3::new(2., 4., 6.))
    );
    assert!(binary(BinOp::Shl, &a, &b).is_err());
  }

  #[test]
  fn mixed_operands_are_rejected() {
    assert!(binary(BinOp::Add, &Value::Int(1), &Value::Float(1.)).is_err());
    assert!(compare(CmpOp::Lt, &Value::Float(1.), &Value::Double(1.)).is_err());
  }

  #[test]
  fn casts() {
    assert_eq!(cast(&Value::Bool(true), &IrType::F32).unwrap(), Value::Float(1.));
    assert_eq!(cast(&Value::Float(2.7), &IrType::I32).unwrap(), Value::Int(2));
    assert_eq!(cast(&Value::Int(0), &IrType::I1).unwrap(), Value::Bool(false));
    assert_eq!(
      splat(&Value::Int(2), &IrType::Float3).unwrap(),
      Value::Float3(Float3::new(2., 2., 2.))
    );
  }
}
