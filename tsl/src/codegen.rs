//! Code generation from the AST into IR.
//!
//! Every node generates itself into a [`CompileContext`]: [`FunctionDecl::codegen`], [`StructDecl::codegen`],
//! [`Stmt::codegen`] and [`Expr::codegen`]. The context carries the target [`Module`], the builder of the function
//! being generated and the symbol tables the nodes resolve names against.
//!
//! # Typing rules
//!
//! - Scalars are implicitly converted along `bool < int < float < double`. Arithmetic happens in the widest operand
//!   type (and at least in `int`); assignments, initializers, arguments and return values convert to the target type.
//! - A scalar meets a vector by being broadcast to every component.
//! - Closures only support `closure + closure`, `closure * scalar` and `scalar * closure`.
//! - `out` arguments must be assignable and of the exact parameter type.

use crate::{
  ast::{AssignOp, Expr, FunctionDecl, Param, Stmt, StructDecl},
  error::{Result, TslError},
  global_module::{CLOSURE_ADD, CLOSURE_MUL},
  ir::{
    zero_value, BinOp, BlockId, CmpOp, Function, FunctionBuilder, IrType, Linkage, Module, StructLayout,
    UnOp, ValueId,
  },
  types::{ArgDescriptor, ShaderArgumentType, Type},
  value::Value,
};
use std::collections::HashMap;

/// Value produced by an expression, with its language type.
#[derive(Clone, Debug, PartialEq)]
pub struct Typed {
  pub value: ValueId,
  pub ty: Type,
}

/// Assignable location, with the language type of what it holds.
#[derive(Clone, Debug, PartialEq)]
pub struct Place {
  pub ptr: ValueId,
  pub ty: Type,
}

/// Named member of an aggregate. Several names can map to the same index (`x` and `r` on vectors).
#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
  pub name: String,
  pub ty: Type,
  pub index: u32,
}

/// Member layout of a structure or vector type, keyed by type name in [`CompileContext::structure_types`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TypeLayout {
  pub fields: Vec<FieldInfo>,
}

impl TypeLayout {
  pub fn field(&self, name: &str) -> Option<&FieldInfo> {
    self.fields.iter().find(|f| f.name == name)
  }
}

/// Callable function as seen from source code.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionSignature {
  /// Symbol the call is emitted against.
  pub symbol: String,
  pub params: Vec<Param>,
  pub ret: Type,
}

impl FunctionSignature {
  /// IR parameter types; `out` parameters are pointers.
  pub fn ir_params(&self) -> Vec<IrType> {
    ir_params(&self.params)
  }
}

fn ir_params(params: &[Param]) -> Vec<IrType> {
  params
    .iter()
    .map(|p| {
      let ty = IrType::from_type(&p.ty);
      if p.is_output {
        ty.ptr()
      } else {
        ty
      }
    })
    .collect()
}

/// Constructor of a registered closure type.
#[derive(Clone, Debug, PartialEq)]
pub struct ClosureSignature {
  pub symbol: String,
  pub params: Vec<Type>,
}

#[derive(Clone, Copy, Debug)]
struct LoopTarget {
  break_block: BlockId,
  continue_block: BlockId,
}

/// Everything code generation needs to know while emitting one module.
#[derive(Debug)]
pub struct CompileContext<'a> {
  pub module: &'a mut Module,
  /// Builder of the function currently being generated.
  pub builder: Option<FunctionBuilder>,
  var_symbols: Vec<HashMap<String, Place>>,
  /// Member layouts of vectors and declared structures, by type name.
  pub structure_types: HashMap<String, TypeLayout>,
  /// Closure constructors declared in the module, by closure type name.
  pub closures: HashMap<String, ClosureSignature>,
  /// Functions declared in the module, by source name.
  pub functions: HashMap<String, FunctionSignature>,
  /// Runtime functions callable without a prototype; declared in the module on first use.
  pub intrinsics: HashMap<String, FunctionSignature>,
  loops: Vec<LoopTarget>,
  current_ret: Type,
}

impl<'a> CompileContext<'a> {
  pub fn new(module: &'a mut Module) -> Self {
    Self {
      module,
      builder: None,
      var_symbols: Vec::new(),
      structure_types: HashMap::new(),
      closures: HashMap::new(),
      functions: HashMap::new(),
      intrinsics: HashMap::new(),
      loops: Vec::new(),
      current_ret: Type::Void,
    }
  }

  fn builder(&mut self) -> Result<&mut FunctionBuilder> {
    self
      .builder
      .as_mut()
      .ok_or_else(|| TslError::codegen("no function is being generated"))
  }

  pub fn push_var_symbol_layer(&mut self) {
    self.var_symbols.push(HashMap::new());
  }

  pub fn pop_var_symbol_layer(&mut self) {
    self.var_symbols.pop();
  }

  /// Bind a variable in the innermost scope.
  pub fn declare_var(&mut self, name: &str, place: Place) -> Result<()> {
    let layer = self
      .var_symbols
      .last_mut()
      .ok_or_else(|| TslError::codegen("no open scope"))?;

    if layer.contains_key(name) {
      return Err(TslError::codegen(format!(
        "variable {} is already declared in this scope",
        name
      )));
    }

    layer.insert(name.to_owned(), place);
    Ok(())
  }

  pub fn lookup_var(&self, name: &str) -> Option<&Place> {
    self.var_symbols.iter().rev().find_map(|layer| layer.get(name))
  }

  /// Resolve a callee by source name, declaring runtime functions on first use.
  fn lookup_function(&mut self, name: &str) -> Result<FunctionSignature> {
    if let Some(sig) = self.functions.get(name) {
      return Ok(sig.clone());
    }

    let sig = self
      .intrinsics
      .get(name)
      .cloned()
      .ok_or_else(|| TslError::UnresolvedSymbol(format!("function {}", name)))?;

    self.module.add_function(Function::declaration(
      sig.symbol.clone(),
      sig.ir_params(),
      IrType::from_type(&sig.ret),
      Linkage::External,
    ))?;
    self.functions.insert(name.to_owned(), sig.clone());

    Ok(sig)
  }

  fn layout(&self, ty: &Type) -> Option<&TypeLayout> {
    match ty {
      Type::Float3 | Type::Float4 | Type::Struct(_) => self.structure_types.get(&ty.to_string()),
      _ => None,
    }
  }

  fn field(&self, ty: &Type, name: &str) -> Result<FieldInfo> {
    self
      .layout(ty)
      .and_then(|layout| layout.field(name))
      .cloned()
      .ok_or_else(|| TslError::codegen(format!("type {} has no member {}", ty, name)))
  }

  fn constant(&mut self, value: Value, ty: &Type) -> Result<Typed> {
    let ir = IrType::from_type(ty);
    let value = self.builder()?.constant(value, ir);

    Ok(Typed {
      value,
      ty: ty.clone(),
    })
  }

  fn zero(&mut self, ty: &Type) -> Result<Typed> {
    let zero = zero_value(&IrType::from_type(ty), &self.module.structs);
    self.constant(zero, ty)
  }

  /// Convert a value to `to`, following the implicit conversion rules.
  pub fn convert(&mut self, v: Typed, to: &Type) -> Result<ValueId> {
    if v.ty == *to {
      return Ok(v.value);
    }

    let ir = IrType::from_type(to);

    if v.ty.is_scalar() && to.is_scalar() {
      return Ok(self.builder()?.cast(v.value, ir));
    }

    if v.ty.is_scalar() && to.is_vector() {
      return Ok(self.builder()?.splat(v.value, ir));
    }

    Err(TslError::codegen(format!(
      "cannot convert {} to {}",
      v.ty, to
    )))
  }

  fn to_bool(&mut self, v: Typed) -> Result<ValueId> {
    if !v.ty.is_scalar() {
      return Err(TslError::codegen(format!(
        "{} cannot be used as a condition",
        v.ty
      )));
    }

    self.convert(v, &Type::Bool)
  }

  fn arithmetic(&mut self, op: BinOp, a: Typed, b: Typed) -> Result<Typed> {
    let a_closure = a.ty == Type::Closure;
    let b_closure = b.ty == Type::Closure;

    if op == BinOp::Add && a_closure && b_closure {
      let value = self
        .builder()?
        .call(CLOSURE_ADD, vec![a.value, b.value], IrType::Closure);

      return Ok(Typed {
        value,
        ty: Type::Closure,
      });
    }

    if op == BinOp::Mul && a_closure != b_closure {
      let (closure, weight) = if a_closure { (a, b) } else { (b, a) };

      if !weight.ty.is_scalar() {
        return Err(TslError::codegen(format!(
          "cannot scale a closure by {}",
          weight.ty
        )));
      }

      let weight = self.convert(weight, &Type::Float)?;
      let value = self
        .builder()?
        .call(CLOSURE_MUL, vec![closure.value, weight], IrType::Closure);

      return Ok(Typed {
        value,
        ty: Type::Closure,
      });
    }

    let ty = arithmetic_type(&a.ty, &b.ty, op).ok_or_else(|| {
      TslError::codegen(format!("cannot apply {:?} to {} and {}", op, a.ty, b.ty))
    })?;

    let a = self.convert(a, &ty)?;
    let b = self.convert(b, &ty)?;
    let value = self.builder()?.binary(op, a, b);

    Ok(Typed { value, ty })
  }

  fn comparison(&mut self, op: CmpOp, a: Typed, b: Typed) -> Result<Typed> {
    let ty = match (&a.ty, &b.ty) {
      (x, y) if x.is_scalar() && y.is_scalar() => {
        if x.scalar_rank() >= y.scalar_rank() {
          x.clone()
        } else {
          y.clone()
        }
      }
      (x, y) if x.is_vector() && x == y && matches!(op, CmpOp::Eq | CmpOp::Ne) => x.clone(),
      _ => {
        return Err(TslError::codegen(format!(
          "cannot compare {} and {}",
          a.ty, b.ty
        )))
      }
    };

    let a = self.convert(a, &ty)?;
    let b = self.convert(b, &ty)?;
    let value = self.builder()?.compare(op, a, b);

    Ok(Typed {
      value,
      ty: Type::Bool,
    })
  }

  fn load(&mut self, place: &Place) -> Result<Typed> {
    let value = self.builder()?.load(place.ptr);

    Ok(Typed {
      value,
      ty: place.ty.clone(),
    })
  }

  fn store(&mut self, place: &Place, v: Typed) -> Result<Typed> {
    let value = self.convert(v, &place.ty)?;
    self.builder()?.store(place.ptr, value);

    Ok(Typed {
      value,
      ty: place.ty.clone(),
    })
  }
}

/// Type arithmetic happens in, if `op` is defined for the operands.
fn arithmetic_type(a: &Type, b: &Type, op: BinOp) -> Option<Type> {
  let bitwise = matches!(
    op,
    BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr
  );

  match (a, b) {
    (Type::Bool, Type::Bool) if matches!(op, BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor) => {
      Some(Type::Bool)
    }

    (x, y) if x.is_scalar() && y.is_scalar() => {
      let rank = x.scalar_rank().max(y.scalar_rank())?;
      let ty = match rank {
        0 | 1 => Type::Int,
        2 => Type::Float,
        _ => Type::Double,
      };

      if bitwise && ty != Type::Int {
        None
      } else {
        Some(ty)
      }
    }

    _ if bitwise => None,
    (x, y) if x.is_vector() && x == y => Some(x.clone()),
    (x, y) if x.is_vector() && y.is_scalar() => Some(x.clone()),
    (x, y) if x.is_scalar() && y.is_vector() => Some(y.clone()),
    _ => None,
  }
}

fn unit_value(ty: &Type) -> Option<Value> {
  match ty {
    Type::Int => Some(Value::Int(1)),
    Type::Float => Some(Value::Float(1.)),
    Type::Double => Some(Value::Double(1.)),
    _ => None,
  }
}

impl StructDecl {
  /// Register the structure layout in the module and in the context.
  pub fn codegen(&self, ctx: &mut CompileContext) -> Result<()> {
    let mut fields = Vec::with_capacity(self.fields.len());
    let mut layout = StructLayout::default();

    for (i, (name, ty)) in self.fields.iter().enumerate() {
      if let Type::Struct(inner) = ty {
        if !ctx.structure_types.contains_key(inner) {
          return Err(TslError::UnresolvedSymbol(format!("structure {}", inner)));
        }
      }

      if *ty == Type::Void {
        return Err(TslError::codegen(format!(
          "field {}.{} cannot be void",
          self.name, name
        )));
      }

      fields.push(FieldInfo {
        name: name.clone(),
        ty: ty.clone(),
        index: i as u32,
      });
      layout.fields.push((name.clone(), IrType::from_type(ty)));
    }

    ctx.module.declare_struct(self.name.clone(), layout)?;
    ctx
      .structure_types
      .insert(self.name.clone(), TypeLayout { fields });

    Ok(())
  }
}

impl FunctionDecl {
  /// Name of the function in source.
  pub fn function_name(&self) -> &str {
    &self.name
  }

  /// Parameter list of a shader entry, as seen by hosts and shader groups.
  pub fn parse_shader_parameters(&self) -> Result<Vec<ArgDescriptor>> {
    self
      .params
      .iter()
      .map(|p| {
        let ty = ShaderArgumentType::from_type(&p.ty).ok_or_else(|| {
          TslError::codegen(format!(
            "shader parameter {} has unsupported type {}",
            p.name, p.ty
          ))
        })?;

        Ok(ArgDescriptor {
          name: p.name.clone(),
          ty,
          is_output: p.is_output,
        })
      })
      .collect()
  }

  fn signature(&self, symbol: &str) -> FunctionSignature {
    FunctionSignature {
      symbol: symbol.to_owned(),
      params: self.params.clone(),
      ret: self.ret.clone(),
    }
  }

  /// Declare the prototype under `symbol`, so calls can be emitted before (or without) the body.
  pub fn declare(&self, ctx: &mut CompileContext, symbol: &str, linkage: Linkage) -> Result<()> {
    let sig = self.signature(symbol);

    ctx.module.add_function(Function::declaration(
      symbol,
      sig.ir_params(),
      IrType::from_type(&self.ret),
      linkage,
    ))?;
    ctx.functions.insert(self.name.clone(), sig);

    Ok(())
  }

  /// Generate the body under `symbol`. Prototypes without a body only get declared.
  pub fn codegen(&self, ctx: &mut CompileContext, symbol: &str, linkage: Linkage) -> Result<()> {
    self.declare(ctx, symbol, linkage)?;

    let Some(body) = &self.body else {
      return Ok(());
    };

    let params = ir_params(&self.params);
    let mut builder = FunctionBuilder::new(symbol, params, IrType::from_type(&self.ret), linkage);
    let mut places = Vec::with_capacity(self.params.len());

    for (i, p) in self.params.iter().enumerate() {
      if p.ty == Type::Void {
        return Err(TslError::codegen(format!("parameter {} cannot be void", p.name)));
      }

      let arg = builder.param(i);

      let ptr = if p.is_output {
        arg
      } else {
        let slot = builder.alloca(IrType::from_type(&p.ty));
        builder.store(slot, arg);
        slot
      };

      places.push((p.name.clone(), Place {
        ptr,
        ty: p.ty.clone(),
      }));
    }

    ctx.builder = Some(builder);
    ctx.current_ret = self.ret.clone();
    ctx.loops.clear();
    ctx.push_var_symbol_layer();

    let generated = self.generate_body(ctx, places, body);

    ctx.pop_var_symbol_layer();
    let builder = ctx.builder.take();
    generated?;

    let function = builder
      .ok_or_else(|| TslError::codegen("no function is being generated"))?
      .finish();

    log::trace!("generated function {}", symbol);
    ctx.module.add_function(function)
  }

  fn generate_body(
    &self,
    ctx: &mut CompileContext,
    places: Vec<(String, Place)>,
    body: &[Stmt],
  ) -> Result<()> {
    for (name, place) in places {
      ctx.declare_var(&name, place)?;
    }

    for stmt in body {
      stmt.codegen(ctx)?;
    }

    if !ctx.builder()?.is_terminated() {
      let ret = ctx.current_ret.clone();

      if ret == Type::Void {
        ctx.builder()?.ret(None);
      } else if ctx.builder()?.is_reachable() {
        return Err(TslError::codegen(format!(
          "function {} can reach its end without returning a value",
          self.name
        )));
      } else {
        let zero = ctx.zero(&ret)?;
        ctx.builder()?.ret(Some(zero.value));
      }
    }

    Ok(())
  }
}

impl Stmt {
  pub fn codegen(&self, ctx: &mut CompileContext) -> Result<()> {
    match self {
      Stmt::VarDecl { ty, vars } => {
        if *ty == Type::Void {
          return Err(TslError::codegen("variables cannot be void"));
        }

        if let Type::Struct(name) = ty {
          if !ctx.structure_types.contains_key(name) {
            return Err(TslError::UnresolvedSymbol(format!("structure {}", name)));
          }
        }

        for (name, init) in vars {
          let value = match init {
            Some(init) => init.codegen(ctx)?,
            None => ctx.zero(ty)?,
          };

          let ptr = ctx.builder()?.alloca(IrType::from_type(ty));
          let place = Place {
            ptr,
            ty: ty.clone(),
          };
          ctx.store(&place, value)?;
          ctx.declare_var(name, place)?;
        }

        Ok(())
      }

      Stmt::Expr(e) => e.codegen(ctx).map(|_| ()),

      Stmt::Block(stmts) => {
        ctx.push_var_symbol_layer();
        let r = stmts.iter().try_for_each(|s| s.codegen(ctx));
        ctx.pop_var_symbol_layer();
        r
      }

      Stmt::If {
        cond,
        then_branch,
        else_branch,
      } => {
        let c = cond.codegen(ctx)?;
        let c = ctx.to_bool(c)?;

        let b = ctx.builder()?;
        let then_block = b.create_block("if.then");
        let else_block = b.create_block("if.else");
        let merge = b.create_block("if.end");
        b.cond_br(c, then_block, else_block);

        b.position_at_end(then_block);
        scoped(ctx, then_branch)?;
        ctx.builder()?.br(merge);

        ctx.builder()?.position_at_end(else_block);
        if let Some(else_branch) = else_branch {
          scoped(ctx, else_branch)?;
        }
        ctx.builder()?.br(merge);

        ctx.builder()?.position_at_end(merge);
        Ok(())
      }

      Stmt::While { cond, body } => {
        let b = ctx.builder()?;
        let cond_block = b.create_block("while.cond");
        let body_block = b.create_block("while.body");
        let exit = b.create_block("while.end");
        b.br(cond_block);

        b.position_at_end(cond_block);
        let c = cond.codegen(ctx)?;
        let c = ctx.to_bool(c)?;
        ctx.builder()?.cond_br(c, body_block, exit);

        ctx.builder()?.position_at_end(body_block);
        in_loop(ctx, body, exit, cond_block)?;
        ctx.builder()?.br(cond_block);

        ctx.builder()?.position_at_end(exit);
        Ok(())
      }

      Stmt::DoWhile { body, cond } => {
        let b = ctx.builder()?;
        let body_block = b.create_block("do.body");
        let cond_block = b.create_block("do.cond");
        let exit = b.create_block("do.end");
        b.br(body_block);

        b.position_at_end(body_block);
        in_loop(ctx, body, exit, cond_block)?;
        ctx.builder()?.br(cond_block);

        ctx.builder()?.position_at_end(cond_block);
        let c = cond.codegen(ctx)?;
        let c = ctx.to_bool(c)?;
        ctx.builder()?.cond_br(c, body_block, exit);

        ctx.builder()?.position_at_end(exit);
        Ok(())
      }

      Stmt::For {
        init,
        cond,
        step,
        body,
      } => {
        ctx.push_var_symbol_layer();
        let r = gen_for(ctx, init.as_deref(), cond.as_ref(), step.as_ref(), body);
        ctx.pop_var_symbol_layer();
        r
      }

      Stmt::Return(value) => {
        let ret = ctx.current_ret.clone();

        match (value, &ret) {
          (None, Type::Void) => ctx.builder()?.ret(None),

          (Some(e), ty) if *ty != Type::Void => {
            let v = e.codegen(ctx)?;
            let v = ctx.convert(v, ty)?;
            ctx.builder()?.ret(Some(v));
          }

          (None, ty) => {
            return Err(TslError::codegen(format!(
              "missing return value of type {}",
              ty
            )))
          }

          (Some(_), _) => return Err(TslError::codegen("void function cannot return a value")),
        }

        Ok(())
      }

      Stmt::Break | Stmt::Continue => {
        let target = ctx
          .loops
          .last()
          .copied()
          .ok_or_else(|| TslError::codegen("break or continue outside of a loop"))?;

        let block = if *self == Stmt::Break {
          target.break_block
        } else {
          target.continue_block
        };

        ctx.builder()?.br(block);
        Ok(())
      }
    }
  }
}

// Statement in its own variable scope.
fn scoped(ctx: &mut CompileContext, stmt: &Stmt) -> Result<()> {
  ctx.push_var_symbol_layer();
  let r = stmt.codegen(ctx);
  ctx.pop_var_symbol_layer();
  r
}

fn in_loop(
  ctx: &mut CompileContext,
  body: &Stmt,
  break_block: BlockId,
  continue_block: BlockId,
) -> Result<()> {
  ctx.loops.push(LoopTarget {
    break_block,
    continue_block,
  });
  let r = scoped(ctx, body);
  ctx.loops.pop();
  r
}

fn gen_for(
  ctx: &mut CompileContext,
  init: Option<&Stmt>,
  cond: Option<&Expr>,
  step: Option<&Expr>,
  body: &Stmt,
) -> Result<()> {
  if let Some(init) = init {
    init.codegen(ctx)?;
  }

  let b = ctx.builder()?;
  let cond_block = b.create_block("for.cond");
  let body_block = b.create_block("for.body");
  let step_block = b.create_block("for.step");
  let exit = b.create_block("for.end");
  b.br(cond_block);
  b.position_at_end(cond_block);

  match cond {
    Some(cond) => {
      let c = cond.codegen(ctx)?;
      let c = ctx.to_bool(c)?;
      ctx.builder()?.cond_br(c, body_block, exit);
    }

    None => ctx.builder()?.br(body_block),
  }

  ctx.builder()?.position_at_end(body_block);
  in_loop(ctx, body, exit, step_block)?;
  ctx.builder()?.br(step_block);

  ctx.builder()?.position_at_end(step_block);
  if let Some(step) = step {
    step.codegen(ctx)?;
  }
  ctx.builder()?.br(cond_block);

  ctx.builder()?.position_at_end(exit);
  Ok(())
}

impl Expr {
  /// Binary arithmetic operator and operands, if this is one.
  fn as_arithmetic(&self) -> Option<(BinOp, &Expr, &Expr)> {
    let (op, a, b) = match self {
      Expr::Add(a, b) => (BinOp::Add, a, b),
      Expr::Sub(a, b) => (BinOp::Sub, a, b),
      Expr::Mul(a, b) => (BinOp::Mul, a, b),
      Expr::Div(a, b) => (BinOp::Div, a, b),
      Expr::Rem(a, b) => (BinOp::Rem, a, b),
      Expr::Shl(a, b) => (BinOp::Shl, a, b),
      Expr::Shr(a, b) => (BinOp::Shr, a, b),
      Expr::BitAnd(a, b) => (BinOp::BitAnd, a, b),
      Expr::BitOr(a, b) => (BinOp::BitOr, a, b),
      Expr::BitXor(a, b) => (BinOp::BitXor, a, b),
      _ => return None,
    };

    Some((op, a, b))
  }

  fn as_comparison(&self) -> Option<(CmpOp, &Expr, &Expr)> {
    let (op, a, b) = match self {
      Expr::Eq(a, b) => (CmpOp::Eq, a, b),
      Expr::Neq(a, b) => (CmpOp::Ne, a, b),
      Expr::Lt(a, b) => (CmpOp::Lt, a, b),
      Expr::Lte(a, b) => (CmpOp::Le, a, b),
      Expr::Gt(a, b) => (CmpOp::Gt, a, b),
      Expr::Gte(a, b) => (CmpOp::Ge, a, b),
      _ => return None,
    };

    Some((op, a, b))
  }

  /// Location the expression designates, for assignments and `out` arguments.
  pub fn place(&self, ctx: &mut CompileContext) -> Result<Place> {
    match self {
      Expr::Var(name) => ctx
        .lookup_var(name)
        .cloned()
        .ok_or_else(|| TslError::UnresolvedSymbol(format!("variable {}", name))),

      Expr::Field(base, name) => {
        let base = base.place(ctx)?;
        let field = ctx.field(&base.ty, name)?;
        let ptr = ctx
          .builder()?
          .field_ptr(base.ptr, field.index, IrType::from_type(&field.ty));

        Ok(Place { ptr, ty: field.ty })
      }

      _ => Err(TslError::codegen("expression is not assignable")),
    }
  }

  pub fn codegen(&self, ctx: &mut CompileContext) -> Result<Typed> {
    if let Some((op, a, b)) = self.as_arithmetic() {
      let a = a.codegen(ctx)?;
      let b = b.codegen(ctx)?;
      return ctx.arithmetic(op, a, b);
    }

    if let Some((op, a, b)) = self.as_comparison() {
      let a = a.codegen(ctx)?;
      let b = b.codegen(ctx)?;
      return ctx.comparison(op, a, b);
    }

    match self {
      Expr::LitBool(b) => ctx.constant(Value::Bool(*b), &Type::Bool),
      Expr::LitInt(i) => ctx.constant(Value::Int(*i), &Type::Int),
      Expr::LitFloat(x) => ctx.constant(Value::Float(*x), &Type::Float),
      Expr::LitDouble(x) => ctx.constant(Value::Double(*x), &Type::Double),

      Expr::Var(_) => {
        let place = self.place(ctx)?;
        ctx.load(&place)
      }

      Expr::Not(e) => {
        let v = e.codegen(ctx)?;
        let v = ctx.to_bool(v)?;
        let value = ctx.builder()?.unary(UnOp::Not, v);

        Ok(Typed {
          value,
          ty: Type::Bool,
        })
      }

      Expr::Neg(e) => {
        let v = e.codegen(ctx)?;
        let ty = match &v.ty {
          Type::Bool => Type::Int,
          ty if ty.is_scalar() || ty.is_vector() => ty.clone(),
          ty => return Err(TslError::codegen(format!("cannot negate {}", ty))),
        };
        let v = ctx.convert(v, &ty)?;
        let value = ctx.builder()?.unary(UnOp::Neg, v);

        Ok(Typed { value, ty })
      }

      Expr::BitNot(e) => {
        let v = e.codegen(ctx)?;
        if !matches!(v.ty, Type::Int | Type::Bool) {
          return Err(TslError::codegen(format!("cannot apply ~ to {}", v.ty)));
        }

        let v = ctx.convert(v, &Type::Int)?;
        let value = ctx.builder()?.unary(UnOp::BitNot, v);

        Ok(Typed {
          value,
          ty: Type::Int,
        })
      }

      Expr::And(a, b) => short_circuit(ctx, a, b, true),
      Expr::Or(a, b) => short_circuit(ctx, a, b, false),

      Expr::Ternary(cond, a, b) => ternary(ctx, cond, a, b),

      Expr::Assign { op, target, value } => {
        let place = target.place(ctx)?;
        let v = value.codegen(ctx)?;

        let v = match op {
          AssignOp::Set => v,
          AssignOp::Add | AssignOp::Sub | AssignOp::Mul | AssignOp::Div => {
            let bin = match op {
              AssignOp::Add => BinOp::Add,
              AssignOp::Sub => BinOp::Sub,
              AssignOp::Mul => BinOp::Mul,
              _ => BinOp::Div,
            };
            let current = ctx.load(&place)?;
            ctx.arithmetic(bin, current, v)?
          }
        };

        ctx.store(&place, v)
      }

      Expr::IncDec {
        increment,
        prefix,
        target,
      } => {
        let place = target.place(ctx)?;
        let one = unit_value(&place.ty).ok_or_else(|| {
          TslError::codegen(format!("cannot increment or decrement {}", place.ty))
        })?;

        let old = ctx.load(&place)?;
        let one = ctx.constant(one, &place.ty)?;
        let op = if *increment { BinOp::Add } else { BinOp::Sub };
        let new = ctx.builder()?.binary(op, old.value, one.value);
        ctx.builder()?.store(place.ptr, new);

        Ok(Typed {
          value: if *prefix { new } else { old.value },
          ty: place.ty,
        })
      }

      Expr::Call(name, args) => call(ctx, name, args),

      Expr::Construct(ty, args) => construct(ctx, ty, args),

      Expr::MakeClosure(name, args) => {
        let sig = ctx
          .closures
          .get(name)
          .cloned()
          .ok_or_else(|| TslError::UnresolvedSymbol(format!("closure {}", name)))?;

        if sig.params.len() != args.len() {
          return Err(TslError::codegen(format!(
            "closure {} takes {} arguments, {} given",
            name,
            sig.params.len(),
            args.len()
          )));
        }

        let mut values = Vec::with_capacity(args.len());
        for (arg, ty) in args.iter().zip(&sig.params) {
          let v = arg.codegen(ctx)?;
          values.push(ctx.convert(v, ty)?);
        }

        let value = ctx.builder()?.call(sig.symbol, values, IrType::Closure);
        Ok(Typed {
          value,
          ty: Type::Closure,
        })
      }

      Expr::Field(base, name) => {
        let base = base.codegen(ctx)?;
        let field = ctx.field(&base.ty, name)?;
        let value = ctx
          .builder()?
          .extract(base.value, field.index, IrType::from_type(&field.ty));

        Ok(Typed {
          value,
          ty: field.ty,
        })
      }

      // handled above
      _ => Err(TslError::codegen("unsupported expression")),
    }
  }
}

fn short_circuit(ctx: &mut CompileContext, a: &Expr, b: &Expr, is_and: bool) -> Result<Typed> {
  let lhs = a.codegen(ctx)?;
  let lhs = ctx.to_bool(lhs)?;

  let builder = ctx.builder()?;
  let slot = builder.alloca(IrType::I1);
  builder.store(slot, lhs);

  let rhs_block = builder.create_block(if is_and { "and.rhs" } else { "or.rhs" });
  let end = builder.create_block(if is_and { "and.end" } else { "or.end" });

  if is_and {
    builder.cond_br(lhs, rhs_block, end);
  } else {
    builder.cond_br(lhs, end, rhs_block);
  }

  builder.position_at_end(rhs_block);
  let rhs = b.codegen(ctx)?;
  let rhs = ctx.to_bool(rhs)?;
  let builder = ctx.builder()?;
  builder.store(slot, rhs);
  builder.br(end);

  builder.position_at_end(end);
  let value = builder.load(slot);

  Ok(Typed {
    value,
    ty: Type::Bool,
  })
}

fn ternary(ctx: &mut CompileContext, cond: &Expr, a: &Expr, b: &Expr) -> Result<Typed> {
  let c = cond.codegen(ctx)?;
  let c = ctx.to_bool(c)?;

  let builder = ctx.builder()?;
  let then_block = builder.create_block("select.then");
  let else_block = builder.create_block("select.else");
  let merge = builder.create_block("select.end");
  builder.cond_br(c, then_block, else_block);

  builder.position_at_end(then_block);
  let a = a.codegen(ctx)?;
  let then_end = ctx.builder()?.current_block();

  ctx.builder()?.position_at_end(else_block);
  let b = b.codegen(ctx)?;
  let else_end = ctx.builder()?.current_block();

  let ty = if a.ty == b.ty {
    a.ty.clone()
  } else {
    arithmetic_type(&a.ty, &b.ty, BinOp::Add).ok_or_else(|| {
      TslError::codegen(format!(
        "branches of ?: have incompatible types {} and {}",
        a.ty, b.ty
      ))
    })?
  };

  let slot = ctx.builder()?.alloca(IrType::from_type(&ty));
  let place = Place {
    ptr: slot,
    ty: ty.clone(),
  };

  for (end, v) in [(then_end, a), (else_end, b)] {
    ctx.builder()?.position_at_end(end);
    ctx.store(&place, v)?;
    ctx.builder()?.br(merge);
  }

  ctx.builder()?.position_at_end(merge);
  ctx.load(&place)
}

fn call(ctx: &mut CompileContext, name: &str, args: &[Expr]) -> Result<Typed> {
  let sig = ctx.lookup_function(name)?;

  if sig.params.len() != args.len() {
    return Err(TslError::codegen(format!(
      "function {} takes {} arguments, {} given",
      name,
      sig.params.len(),
      args.len()
    )));
  }

  let mut values = Vec::with_capacity(args.len());
  for (arg, param) in args.iter().zip(&sig.params) {
    if param.is_output {
      let place = arg.place(ctx).map_err(|_| {
        TslError::codegen(format!(
          "argument for out parameter {} of {} is not assignable",
          param.name, name
        ))
      })?;

      if place.ty != param.ty {
        return Err(TslError::codegen(format!(
          "out parameter {} of {} expects {}, found {}",
          param.name, name, param.ty, place.ty
        )));
      }

      values.push(place.ptr);
    } else {
      let v = arg.codegen(ctx)?;
      values.push(ctx.convert(v, &param.ty)?);
    }
  }

  let value = ctx
    .builder()?
    .call(sig.symbol, values, IrType::from_type(&sig.ret));

  Ok(Typed { value, ty: sig.ret })
}

fn construct(ctx: &mut CompileContext, ty: &Type, args: &[Expr]) -> Result<Typed> {
  let mut values = Vec::with_capacity(args.len());
  for arg in args {
    values.push(arg.codegen(ctx)?);
  }

  match ty {
    _ if ty.is_scalar() && values.len() == 1 => {
      let v = values.remove(0);
      if !v.ty.is_scalar() {
        return Err(TslError::codegen(format!("cannot convert {} to {}", v.ty, ty)));
      }

      let value = ctx.convert(v, ty)?;
      Ok(Typed {
        value,
        ty: ty.clone(),
      })
    }

    Type::Float3 | Type::Float4 => {
      let n = ty.components().unwrap_or(0);

      if values.len() == 1 && values[0].ty.is_scalar() {
        let value = ctx.convert(values.remove(0), ty)?;
        return Ok(Typed {
          value,
          ty: ty.clone(),
        });
      }

      // vector arguments contribute all of their components
      let mut components = Vec::with_capacity(n);
      for v in values {
        match v.ty.components() {
          Some(k) => {
            for i in 0..k {
              let c = ctx.builder()?.extract(v.value, i as u32, IrType::F32);
              components.push(c);
            }
          }
          None => components.push(ctx.convert(v, &Type::Float)?),
        }
      }

      if components.len() != n {
        return Err(TslError::codegen(format!(
          "{} needs {} components, {} given",
          ty,
          n,
          components.len()
        )));
      }

      let value = ctx.builder()?.compose(IrType::from_type(ty), components);
      Ok(Typed {
        value,
        ty: ty.clone(),
      })
    }

    Type::Struct(name) => {
      let layout = ctx
        .structure_types
        .get(name)
        .cloned()
        .ok_or_else(|| TslError::UnresolvedSymbol(format!("structure {}", name)))?;

      if layout.fields.len() != values.len() {
        return Err(TslError::codegen(format!(
          "{} has {} fields, {} given",
          name,
          layout.fields.len(),
          values.len()
        )));
      }

      let mut components = Vec::with_capacity(values.len());
      for (v, field) in values.into_iter().zip(&layout.fields) {
        components.push(ctx.convert(v, &field.ty)?);
      }

      let value = ctx.builder()?.compose(IrType::from_type(ty), components);
      Ok(Typed {
        value,
        ty: ty.clone(),
      })
    }

    _ => Err(TslError::codegen(format!(
      "cannot construct {} from {} arguments",
      ty,
      values.len()
    ))),
  }
}
