//! Textual IR writer.
//!
//! Used for debug logging and for [`ShadingSystemConfig::dump_ir`](crate::ShadingSystemConfig::dump_ir).

use crate::ir::{Block, Body, Function, Inst, IrType, Linkage, Module, Op, Terminator};
use std::fmt;

// Number of space an indent level represents.
const INDENT_SPACES: usize = 2;

/// Write a [`Module`] to a [`String`].
pub fn write_module_to_str(module: &Module) -> Result<String, fmt::Error> {
  let mut output = String::new();
  write_module(&mut output, module)?;
  Ok(output)
}

/// Write a [`Module`] to a [`fmt::Write`](std::fmt::Write).
pub fn write_module(f: &mut impl fmt::Write, module: &Module) -> Result<(), fmt::Error> {
  writeln!(f, "; module {}", module.name())?;

  for (name, layout) in &module.structs {
    write!(f, "\nstruct {} {{", name)?;

    for (i, (field, ty)) in layout.fields.iter().enumerate() {
      if i > 0 {
        f.write_str(",")?;
      }

      write!(f, " {}: ", field)?;
      write_type(f, ty)?;
    }

    f.write_str(" }\n")?;
  }

  for fun in module.functions() {
    write_function(f, fun)?;
  }

  Ok(())
}

fn write_function(f: &mut impl fmt::Write, fun: &Function) -> Result<(), fmt::Error> {
  // just for aesthetics
  f.write_str("\n")?;

  let keyword = match fun.body {
    Body::Declaration => "declare",
    Body::Native(_) => "native",
    Body::Blocks { .. } => "define",
  };
  f.write_str(keyword)?;

  if fun.linkage == Linkage::Internal {
    f.write_str(" internal")?;
  }

  f.write_str(" ")?;
  write_type(f, &fun.ret)?;
  write!(f, " @{}(", fun.name)?;

  for (i, ty) in fun.params.iter().enumerate() {
    if i > 0 {
      f.write_str(", ")?;
    }

    write_type(f, ty)?;
    write!(f, " %{}", i)?;
  }

  f.write_str(")")?;

  match fun.body {
    Body::Blocks { ref blocks, .. } => {
      f.write_str(" {\n")?;

      for (i, block) in blocks.iter().enumerate() {
        write_block(f, i, block)?;
      }

      f.write_str("}\n")
    }

    _ => f.write_str("\n"),
  }
}

fn write_block(f: &mut impl fmt::Write, id: usize, block: &Block) -> Result<(), fmt::Error> {
  writeln!(f, "bb{}: ; {}", id, block.name)?;

  for inst in &block.insts {
    write_indent(f, 1)?;
    write_inst(f, inst)?;
    f.write_str("\n")?;
  }

  write_indent(f, 1)?;
  match block.term {
    Some(ref term) => write_terminator(f, term)?,
    None => f.write_str("<unterminated>")?,
  }

  f.write_str("\n")
}

fn write_inst(f: &mut impl fmt::Write, inst: &Inst) -> Result<(), fmt::Error> {
  if let Op::Store { ptr, value } = inst.op {
    return write!(f, "store %{}, %{}", value, ptr);
  }

  write!(f, "%{} = ", inst.result)?;

  match inst.op {
    Op::Const(ref v) => write!(f, "const {}", v)?,

    Op::Alloca(ref ty) => {
      f.write_str("alloca ")?;
      write_type(f, ty)?;
    }

    Op::Load(p) => write!(f, "load %{}", p)?,
    Op::Store { .. } => (),
    Op::FieldPtr { base, index } => write!(f, "field_ptr %{}, {}", base, index)?,
    Op::Extract { base, index } => write!(f, "extract %{}, {}", base, index)?,

    Op::Compose(ref args) => {
      f.write_str("compose")?;
      write_operands(f, args)?;
    }

    Op::Binary(op, a, b) => write!(f, "{} %{}, %{}", format!("{:?}", op).to_lowercase(), a, b)?,
    Op::Compare(op, a, b) => write!(f, "cmp {} %{}, %{}", format!("{:?}", op).to_lowercase(), a, b)?,
    Op::Unary(op, a) => write!(f, "{} %{}", format!("{:?}", op).to_lowercase(), a)?,
    Op::Cast(a) => write!(f, "cast %{}", a)?,
    Op::Splat(a) => write!(f, "splat %{}", a)?,

    Op::Call { ref callee, ref args } => {
      write!(f, "call @{}(", callee)?;
      write_operands(f, args)?;
      f.write_str(" )")?;
    }
  }

  f.write_str(" : ")?;
  write_type(f, &inst.ty)
}

fn write_operands(f: &mut impl fmt::Write, args: &[u32]) -> Result<(), fmt::Error> {
  for (i, arg) in args.iter().enumerate() {
    if i > 0 {
      f.write_str(",")?;
    }

    write!(f, " %{}", arg)?;
  }

  Ok(())
}

fn write_terminator(f: &mut impl fmt::Write, term: &Terminator) -> Result<(), fmt::Error> {
  match *term {
    Terminator::Br(b) => write!(f, "br bb{}", b),
    Terminator::CondBr {
      cond,
      then_block,
      else_block,
    } => write!(f, "cond_br %{}, bb{}, bb{}", cond, then_block, else_block),
    Terminator::Ret(Some(v)) => write!(f, "ret %{}", v),
    Terminator::Ret(None) => f.write_str("ret void"),
  }
}

fn write_type(f: &mut impl fmt::Write, ty: &IrType) -> Result<(), fmt::Error> {
  match ty {
    IrType::Void => f.write_str("void"),
    IrType::I1 => f.write_str("i1"),
    IrType::I32 => f.write_str("i32"),
    IrType::F32 => f.write_str("f32"),
    IrType::F64 => f.write_str("f64"),
    IrType::Float3 => f.write_str("float3"),
    IrType::Float4 => f.write_str("float4"),
    IrType::Closure => f.write_str("closure"),
    IrType::Struct(name) => write!(f, "%{}", name),

    IrType::Ptr(ty) => {
      write_type(f, ty)?;
      f.write_str("*")
    }
  }
}

fn write_indent(f: &mut impl fmt::Write, indent_lvl: usize) -> Result<(), fmt::Error> {
  write!(f, "{}", " ".repeat(indent_lvl * INDENT_SPACES))
}

impl fmt::Display for Module {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write_module(f, self)
  }
}
