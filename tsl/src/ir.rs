//! Intermediate representation of compiled shader code.
//!
//! A [`Module`] is the opaque code container every template owns. It holds structure layouts and [`Function`]s; a
//! function is either a declaration (resolved at link time), a native function provided by the runtime, or a body
//! made of basic [`Block`]s.
//!
//! Bodies are in SSA form over explicit stack slots: every [`Inst`] defines exactly one [`ValueId`], and mutable
//! variables live in memory obtained with [`Op::Alloca`] and accessed with [`Op::Load`] / [`Op::Store`]. Function
//! parameters are the first values of a body: parameter `i` is value `i`.
//!
//! Modules are plain data and implement [`Clone`]; cloning a module is how an instance gets code of its own.

use crate::{
  error::{Result, TslError},
  types::Type,
  value::Value,
};
use std::{
  collections::{BTreeMap, HashMap},
  fmt,
  sync::Arc,
};

/// SSA value index, local to a function.
pub type ValueId = u32;

/// Basic block index, local to a function.
pub type BlockId = u32;

/// Low-level types.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum IrType {
  Void,
  I1,
  I32,
  F32,
  F64,
  Float3,
  Float4,
  Closure,
  Struct(String),
  Ptr(Box<IrType>),
}

impl IrType {
  /// Lower a language type.
  pub fn from_type(ty: &Type) -> Self {
    match ty {
      Type::Void => IrType::Void,
      Type::Bool => IrType::I1,
      Type::Int => IrType::I32,
      Type::Float => IrType::F32,
      Type::Double => IrType::F64,
      Type::Float3 => IrType::Float3,
      Type::Float4 => IrType::Float4,
      Type::Closure => IrType::Closure,
      Type::Struct(name) => IrType::Struct(name.clone()),
    }
  }

  /// Pointer to this type.
  pub fn ptr(self) -> Self {
    IrType::Ptr(Box::new(self))
  }

  /// Type pointed to, if this is a pointer.
  pub fn pointee(&self) -> Option<&IrType> {
    match self {
      IrType::Ptr(ty) => Some(ty),
      _ => None,
    }
  }

  /// Type of the component or field `index` of an aggregate.
  pub fn field(&self, index: u32, structs: &StructTable) -> Option<IrType> {
    match self {
      IrType::Float3 if index < 3 => Some(IrType::F32),
      IrType::Float4 if index < 4 => Some(IrType::F32),
      IrType::Struct(name) => structs
        .get(name)?
        .fields
        .get(index as usize)
        .map(|(_, ty)| ty.clone()),
      _ => None,
    }
  }
}

/// Field layout of a structure.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StructLayout {
  pub fields: Vec<(String, IrType)>,
}

/// Structure layouts by name.
pub type StructTable = BTreeMap<String, StructLayout>;

/// Zero value of a type; structures are zeroed field by field.
pub fn zero_value(ty: &IrType, structs: &StructTable) -> Value {
  match ty {
    IrType::Void | IrType::Ptr(_) => Value::Void,
    IrType::I1 => Value::Bool(false),
    IrType::I32 => Value::Int(0),
    IrType::F32 => Value::Float(0.),
    IrType::F64 => Value::Double(0.),
    IrType::Float3 => Value::zero(&Type::Float3),
    IrType::Float4 => Value::zero(&Type::Float4),
    IrType::Closure => Value::Closure(None),
    IrType::Struct(name) => Value::Struct(
      structs
        .get(name)
        .map(|layout| {
          layout
            .fields
            .iter()
            .map(|(_, ty)| zero_value(ty, structs))
            .collect()
        })
        .unwrap_or_default(),
    ),
  }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BinOp {
  Add,
  Sub,
  Mul,
  Div,
  Rem,
  Shl,
  Shr,
  BitAnd,
  BitOr,
  BitXor,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CmpOp {
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum UnOp {
  Neg,
  Not,
  BitNot,
}

/// Operation computed by an instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
  Const(Value),
  /// Stack slot holding a value of the given type, zero-initialized.
  Alloca(IrType),
  Load(ValueId),
  Store { ptr: ValueId, value: ValueId },
  /// Pointer to the field (or vector component) `index` of the pointed-to aggregate.
  FieldPtr { base: ValueId, index: u32 },
  /// Field (or vector component) `index` of an aggregate value.
  Extract { base: ValueId, index: u32 },
  /// Aggregate built from its components, in order.
  Compose(Vec<ValueId>),
  Binary(BinOp, ValueId, ValueId),
  Compare(CmpOp, ValueId, ValueId),
  Unary(UnOp, ValueId),
  /// Scalar conversion to the instruction type.
  Cast(ValueId),
  /// Scalar broadcast to every component of the instruction type.
  Splat(ValueId),
  Call { callee: String, args: Vec<ValueId> },
}

impl Op {
  /// Values read by the operation.
  pub fn operands(&self) -> Vec<ValueId> {
    match self {
      Op::Const(_) | Op::Alloca(_) => Vec::new(),
      Op::Load(a) | Op::Unary(_, a) | Op::Cast(a) | Op::Splat(a) => vec![*a],
      Op::FieldPtr { base, .. } | Op::Extract { base, .. } => vec![*base],
      Op::Store { ptr, value } => vec![*ptr, *value],
      Op::Binary(_, a, b) | Op::Compare(_, a, b) => vec![*a, *b],
      Op::Compose(args) | Op::Call { args, .. } => args.clone(),
    }
  }

  /// Rewrite every value read by the operation.
  pub fn map_operands(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
    match self {
      Op::Const(_) | Op::Alloca(_) => (),
      Op::Load(a) | Op::Unary(_, a) | Op::Cast(a) | Op::Splat(a) => *a = f(*a),
      Op::FieldPtr { base, .. } | Op::Extract { base, .. } => *base = f(*base),

      Op::Store { ptr, value } => {
        *ptr = f(*ptr);
        *value = f(*value);
      }

      Op::Binary(_, a, b) | Op::Compare(_, a, b) => {
        *a = f(*a);
        *b = f(*b);
      }

      Op::Compose(args) | Op::Call { args, .. } => {
        for arg in args {
          *arg = f(*arg);
        }
      }
    }
  }

  /// Whether the operation has no effect besides producing its value, and always produces the same value for the
  /// same operands.
  pub fn is_pure(&self) -> bool {
    !matches!(
      self,
      Op::Alloca(_) | Op::Load(_) | Op::Store { .. } | Op::Call { .. }
    )
  }
}

/// Instruction: an operation and the value it defines.
#[derive(Clone, Debug, PartialEq)]
pub struct Inst {
  pub result: ValueId,
  pub ty: IrType,
  pub op: Op,
}

/// Last instruction of a block.
#[derive(Clone, Debug, PartialEq)]
pub enum Terminator {
  Br(BlockId),
  CondBr {
    cond: ValueId,
    then_block: BlockId,
    else_block: BlockId,
  },
  Ret(Option<ValueId>),
}

impl Terminator {
  /// Blocks control can go to next.
  pub fn successors(&self) -> Vec<BlockId> {
    match *self {
      Terminator::Br(b) => vec![b],
      Terminator::CondBr {
        then_block,
        else_block,
        ..
      } => vec![then_block, else_block],
      Terminator::Ret(_) => Vec::new(),
    }
  }

  /// Values read by the terminator.
  pub fn operands(&self) -> Vec<ValueId> {
    match *self {
      Terminator::CondBr { cond, .. } => vec![cond],
      Terminator::Ret(Some(v)) => vec![v],
      Terminator::Br(_) | Terminator::Ret(None) => Vec::new(),
    }
  }

  pub fn map_operands(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
    match self {
      Terminator::CondBr { cond, .. } => *cond = f(*cond),
      Terminator::Ret(Some(v)) => *v = f(*v),
      Terminator::Br(_) | Terminator::Ret(None) => (),
    }
  }

  pub fn map_successors(&mut self, mut f: impl FnMut(BlockId) -> BlockId) {
    match self {
      Terminator::Br(b) => *b = f(*b),
      Terminator::CondBr {
        then_block,
        else_block,
        ..
      } => {
        *then_block = f(*then_block);
        *else_block = f(*else_block);
      }
      Terminator::Ret(_) => (),
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
  pub name: String,
  pub insts: Vec<Inst>,
  /// `None` only while the block is being built.
  pub term: Option<Terminator>,
}

/// Symbol visibility at link time.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Linkage {
  /// Visible to, and resolvable from, every linked module.
  External,
  /// Only visible from its own module.
  Internal,
}

/// Function implemented by the host or by the runtime rather than by IR.
#[derive(Clone)]
pub struct NativeFunction(Arc<dyn Fn(&[Value]) -> Value + Send + Sync>);

impl NativeFunction {
  pub fn new(f: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> Self {
    Self(Arc::new(f))
  }

  pub fn call(&self, args: &[Value]) -> Value {
    (self.0)(args)
  }
}

impl fmt::Debug for NativeFunction {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str("<native>")
  }
}

impl PartialEq for NativeFunction {
  fn eq(&self, rhs: &Self) -> bool {
    Arc::ptr_eq(&self.0, &rhs.0)
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Body {
  /// Prototype only; bound to a definition from another module at link time.
  Declaration,
  Blocks {
    blocks: Vec<Block>,
    value_count: u32,
  },
  Native(NativeFunction),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Function {
  pub name: String,
  pub params: Vec<IrType>,
  pub ret: IrType,
  pub linkage: Linkage,
  pub body: Body,
}

impl Function {
  /// Prototype without a body.
  pub fn declaration(
    name: impl Into<String>,
    params: Vec<IrType>,
    ret: IrType,
    linkage: Linkage,
  ) -> Self {
    Self {
      name: name.into(),
      params,
      ret,
      linkage,
      body: Body::Declaration,
    }
  }

  /// Function implemented natively.
  pub fn native(
    name: impl Into<String>,
    params: Vec<IrType>,
    ret: IrType,
    f: NativeFunction,
  ) -> Self {
    Self {
      name: name.into(),
      params,
      ret,
      linkage: Linkage::External,
      body: Body::Native(f),
    }
  }

  /// Whether the function has no body yet.
  pub fn is_declaration(&self) -> bool {
    matches!(self.body, Body::Declaration)
  }

  /// Whether `self` and `other` have the same parameter and return types.
  pub fn same_signature(&self, other: &Function) -> bool {
    self.params == other.params && self.ret == other.ret
  }

  /// Blocks of the body, if it has any.
  pub fn blocks(&self) -> Option<&[Block]> {
    match &self.body {
      Body::Blocks { blocks, .. } => Some(blocks),
      _ => None,
    }
  }
}

/// Compiled module.
#[derive(Clone, Debug, PartialEq)]
pub struct Module {
  name: String,
  pub structs: StructTable,
  functions: Vec<Function>,
  index: HashMap<String, usize>,
}

impl Module {
  /// Empty module called `name`.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      structs: StructTable::new(),
      functions: Vec::new(),
      index: HashMap::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn functions(&self) -> impl Iterator<Item = &Function> {
    self.functions.iter()
  }

  /// Function defined or declared as `name`.
  pub fn function(&self, name: &str) -> Option<&Function> {
    self.index.get(name).map(|&i| &self.functions[i])
  }

  pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
    let i = *self.index.get(name)?;
    self.functions.get_mut(i)
  }

  /// Declare a structure layout. Re-declaring an identical layout is allowed.
  pub fn declare_struct(&mut self, name: impl Into<String>, layout: StructLayout) -> Result<()> {
    let name = name.into();

    match self.structs.get(&name) {
      Some(existing) if *existing != layout => Err(TslError::codegen(format!(
        "structure {} declared twice with different layouts",
        name
      ))),
      _ => {
        self.structs.insert(name, layout);
        Ok(())
      }
    }
  }

  /// Add a function to the module.
  ///
  /// A prototype can be declared any number of times as long as signatures agree; a body replaces a matching
  /// prototype. Two bodies for the same symbol, or two different signatures, are refused.
  pub fn add_function(&mut self, function: Function) -> Result<()> {
    let Some(&i) = self.index.get(&function.name) else {
      self.index.insert(function.name.clone(), self.functions.len());
      self.functions.push(function);
      return Ok(());
    };

    let existing = &mut self.functions[i];

    if !existing.same_signature(&function) {
      return Err(TslError::codegen(format!(
        "conflicting signatures for function {}",
        function.name
      )));
    }

    match (existing.is_declaration(), function.is_declaration()) {
      (_, true) => Ok(()),
      (true, false) => {
        *existing = function;
        Ok(())
      }
      (false, false) => Err(TslError::codegen(format!(
        "function {} defined twice",
        function.name
      ))),
    }
  }
}

/// Incremental construction of a function body.
///
/// Emitting into a block that is already terminated opens a fresh, unreachable block, so code following a `return`
/// or a `break` can still be generated.
#[derive(Debug)]
pub struct FunctionBuilder {
  name: String,
  params: Vec<IrType>,
  ret: IrType,
  linkage: Linkage,
  blocks: Vec<Block>,
  value_types: Vec<IrType>,
  current: BlockId,
  allocas: usize,
}

impl FunctionBuilder {
  pub fn new(name: impl Into<String>, params: Vec<IrType>, ret: IrType, linkage: Linkage) -> Self {
    let value_types = params.clone();

    Self {
      name: name.into(),
      params,
      ret,
      linkage,
      blocks: vec![Block {
        name: "entry".to_owned(),
        insts: Vec::new(),
        term: None,
      }],
      value_types,
      current: 0,
      allocas: 0,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn ret_type(&self) -> &IrType {
    &self.ret
  }

  /// Value holding parameter `index`.
  pub fn param(&self, index: usize) -> ValueId {
    index as ValueId
  }

  /// Type of a value produced so far.
  pub fn value_type(&self, value: ValueId) -> &IrType {
    &self.value_types[value as usize]
  }

  /// Append an empty block; the insertion point does not move.
  pub fn create_block(&mut self, name: impl Into<String>) -> BlockId {
    self.blocks.push(Block {
      name: name.into(),
      insts: Vec::new(),
      term: None,
    });

    (self.blocks.len() - 1) as BlockId
  }

  /// Emit the next instructions at the end of `block`.
  pub fn position_at_end(&mut self, block: BlockId) {
    self.current = block;
  }

  pub fn current_block(&self) -> BlockId {
    self.current
  }

  /// Whether the current block already ends with a terminator.
  pub fn is_terminated(&self) -> bool {
    self.blocks[self.current as usize].term.is_some()
  }

  /// Whether control can flow from the entry block to the current block. Branch conditions are not evaluated.
  pub fn is_reachable(&self) -> bool {
    let mut seen = vec![false; self.blocks.len()];
    let mut stack = vec![0];

    while let Some(b) = stack.pop() {
      if b == self.current {
        return true;
      }

      if std::mem::replace(&mut seen[b as usize], true) {
        continue;
      }

      if let Some(term) = &self.blocks[b as usize].term {
        stack.extend(term.successors());
      }
    }

    false
  }

  fn new_value(&mut self, ty: IrType) -> ValueId {
    self.value_types.push(ty);
    (self.value_types.len() - 1) as ValueId
  }

  fn ensure_open(&mut self) {
    if self.is_terminated() {
      let b = self.create_block("unreachable");
      self.position_at_end(b);
    }
  }

  fn emit(&mut self, ty: IrType, op: Op) -> ValueId {
    self.ensure_open();
    let result = self.new_value(ty.clone());
    self.blocks[self.current as usize]
      .insts
      .push(Inst { result, ty, op });
    result
  }

  pub fn constant(&mut self, value: Value, ty: IrType) -> ValueId {
    self.emit(ty, Op::Const(value))
  }

  /// Stack slot for a value of type `ty`; slots are always placed at the top of the entry block.
  pub fn alloca(&mut self, ty: IrType) -> ValueId {
    let ptr_ty = ty.clone().ptr();
    let result = self.new_value(ptr_ty.clone());
    self.blocks[0].insts.insert(
      self.allocas,
      Inst {
        result,
        ty: ptr_ty,
        op: Op::Alloca(ty),
      },
    );
    self.allocas += 1;
    result
  }

  pub fn load(&mut self, ptr: ValueId) -> ValueId {
    let ty = self
      .value_type(ptr)
      .pointee()
      .cloned()
      .unwrap_or(IrType::Void);
    self.emit(ty, Op::Load(ptr))
  }

  pub fn store(&mut self, ptr: ValueId, value: ValueId) {
    self.emit(IrType::Void, Op::Store { ptr, value });
  }

  /// Pointer to field `index` of the aggregate behind `base`.
  pub fn field_ptr(&mut self, base: ValueId, index: u32, field_ty: IrType) -> ValueId {
    self.emit(field_ty.ptr(), Op::FieldPtr { base, index })
  }

  /// Field `index` of an aggregate value.
  pub fn extract(&mut self, base: ValueId, index: u32, field_ty: IrType) -> ValueId {
    self.emit(field_ty, Op::Extract { base, index })
  }

  /// Aggregate of type `ty` built from its components.
  pub fn compose(&mut self, ty: IrType, components: Vec<ValueId>) -> ValueId {
    self.emit(ty, Op::Compose(components))
  }

  pub fn binary(&mut self, op: BinOp, a: ValueId, b: ValueId) -> ValueId {
    let ty = self.value_type(a).clone();
    self.emit(ty, Op::Binary(op, a, b))
  }

  pub fn compare(&mut self, op: CmpOp, a: ValueId, b: ValueId) -> ValueId {
    self.emit(IrType::I1, Op::Compare(op, a, b))
  }

  pub fn unary(&mut self, op: UnOp, a: ValueId) -> ValueId {
    let ty = self.value_type(a).clone();
    self.emit(ty, Op::Unary(op, a))
  }

  /// Numeric conversion of `a` to `ty`.
  pub fn cast(&mut self, a: ValueId, ty: IrType) -> ValueId {
    self.emit(ty, Op::Cast(a))
  }

  /// Vector of type `ty` with every component set to `a`.
  pub fn splat(&mut self, a: ValueId, ty: IrType) -> ValueId {
    self.emit(ty, Op::Splat(a))
  }

  pub fn call(&mut self, callee: impl Into<String>, args: Vec<ValueId>, ret: IrType) -> ValueId {
    self.emit(
      ret,
      Op::Call {
        callee: callee.into(),
        args,
      },
    )
  }

  fn terminate(&mut self, term: Terminator) {
    self.ensure_open();
    self.blocks[self.current as usize].term = Some(term);
  }

  pub fn br(&mut self, target: BlockId) {
    self.terminate(Terminator::Br(target));
  }

  pub fn cond_br(&mut self, cond: ValueId, then_block: BlockId, else_block: BlockId) {
    self.terminate(Terminator::CondBr {
      cond,
      then_block,
      else_block,
    });
  }

  pub fn ret(&mut self, value: Option<ValueId>) {
    self.terminate(Terminator::Ret(value));
  }

  /// Finish the body. A block left open falls back to returning nothing.
  pub fn finish(mut self) -> Function {
    for block in &mut self.blocks {
      if block.term.is_none() {
        block.term = Some(Terminator::Ret(None));
      }
    }

    Function {
      name: self.name,
      params: self.params,
      ret: self.ret,
      linkage: self.linkage,
      body: Body::Blocks {
        blocks: self.blocks,
        value_count: self.value_types.len() as u32,
      },
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn allocas_are_hoisted_to_entry() {
    let mut b = FunctionBuilder::new("f", vec![IrType::F32], IrType::Void, Linkage::External);
    let next = b.create_block("next");
    b.br(next);
    b.position_at_end(next);
    let slot = b.alloca(IrType::F32);
    b.store(slot, b.param(0));
    b.ret(None);

    let f = b.finish();
    let blocks = f.blocks().unwrap();
    assert_eq!(blocks[0].insts[0].op, Op::Alloca(IrType::F32));
    assert_eq!(blocks[0].insts[0].result, slot);
  }

  #[test]
  fn emitting_after_terminator_opens_a_block() {
    let mut b = FunctionBuilder::new("f", vec![], IrType::Void, Linkage::Internal);
    b.ret(None);
    b.constant(Value::Int(1), IrType::I32);

    let f = b.finish();
    let blocks = f.blocks().unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1].name, "unreachable");
    assert_eq!(blocks[1].term, Some(Terminator::Ret(None)));
  }

  #[test]
  fn reachability_follows_branches() {
    let mut b = FunctionBuilder::new("f", vec![], IrType::I32, Linkage::Internal);
    let then_block = b.create_block("then");
    let orphan = b.create_block("orphan");
    let cond = b.constant(Value::Bool(true), IrType::I1);
    b.cond_br(cond, then_block, then_block);
    assert!(b.is_reachable());

    b.position_at_end(then_block);
    assert!(b.is_reachable());

    b.position_at_end(orphan);
    assert!(!b.is_reachable());
  }

  #[test]
  fn declarations_merge_with_definitions() {
    let mut m = Module::new("m");
    let decl = Function::declaration("g", vec![IrType::F32], IrType::F32, Linkage::External);
    m.add_function(decl.clone()).unwrap();
    m.add_function(decl.clone()).unwrap();

    let mut b = FunctionBuilder::new("g", vec![IrType::F32], IrType::F32, Linkage::External);
    b.ret(Some(b.param(0)));
    m.add_function(b.finish()).unwrap();
    assert!(!m.function("g").unwrap().is_declaration());

    // declaring again after the definition keeps the body
    m.add_function(decl).unwrap();
    assert!(!m.function("g").unwrap().is_declaration());

    let other = Function::declaration("g", vec![IrType::I32], IrType::F32, Linkage::External);
    assert!(matches!(m.add_function(other), Err(TslError::Codegen(_))));
  }

  #[test]
  fn zero_values_follow_layouts() {
    let mut structs = StructTable::new();
    structs.insert(
      "S".to_owned(),
      StructLayout {
        fields: vec![("a".to_owned(), IrType::I32), ("b".to_owned(), IrType::F64)],
      },
    );

    assert_eq!(
      zero_value(&IrType::Struct("S".to_owned()), &structs),
      Value::Struct(vec![Value::Int(0), Value::Double(0.)])
    );
  }
}
