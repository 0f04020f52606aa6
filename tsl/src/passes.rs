//! Optimization and verification of function bodies.
//!
//! [`optimize`] runs a fixed pipeline until it stops making progress:
//!
//! - instruction combining: constant folding, algebraic identities;
//! - common subexpression elimination, per block and over pure operations only;
//! - control flow simplification: constant branches, empty block forwarding, unreachable block removal and
//!   straight-line block merging;
//! - dead instruction removal.
//!
//! Folding goes through [`eval`], the same code the interpreter runs, so an optimized function computes exactly what
//! its unoptimized version computes.

use crate::{
  error::{Result, TslError},
  eval,
  ir::{BinOp, Block, BlockId, Body, Function, IrType, Module, Op, StructTable, Terminator, ValueId},
  value::Value,
};
use std::collections::{HashMap, HashSet};

// upper bound on pipeline rounds; every round either shrinks or folds something
const MAX_ROUNDS: usize = 32;

/// Optimize a function body in place. Declarations and native functions are left untouched.
pub fn optimize(function: &mut Function, structs: &StructTable) {
  let Body::Blocks { blocks, .. } = &mut function.body else {
    return;
  };

  for round in 0..MAX_ROUNDS {
    let mut changed = combine_instructions(blocks, structs);
    changed |= eliminate_common_subexpressions(blocks);
    changed |= simplify_cfg(blocks);
    changed |= remove_dead_instructions(blocks);

    if !changed {
      log::trace!("optimized {} in {} rounds", function.name, round + 1);
      return;
    }
  }
}

fn constants(blocks: &[Block]) -> HashMap<ValueId, Value> {
  blocks
    .iter()
    .flat_map(|b| &b.insts)
    .filter_map(|inst| match &inst.op {
      Op::Const(v) => Some((inst.result, v.clone())),
      _ => None,
    })
    .collect()
}

fn resolve(replace: &HashMap<ValueId, ValueId>, mut v: ValueId) -> ValueId {
  // replacement chains are acyclic: a value is only ever replaced by an earlier one
  while let Some(&to) = replace.get(&v) {
    v = to;
  }

  v
}

fn rewrite(blocks: &mut [Block], replace: &HashMap<ValueId, ValueId>) {
  if replace.is_empty() {
    return;
  }

  for block in blocks {
    for inst in &mut block.insts {
      inst.op.map_operands(|v| resolve(replace, v));
    }

    if let Some(term) = &mut block.term {
      term.map_operands(|v| resolve(replace, v));
    }
  }
}

fn fold(op: &Op, ty: &IrType, consts: &HashMap<ValueId, Value>, structs: &StructTable) -> Option<Value> {
  if matches!(op, Op::Const(_)) || !op.is_pure() {
    return None;
  }

  let args = op
    .operands()
    .iter()
    .map(|v| consts.get(v))
    .collect::<Option<Vec<_>>>()?;

  match (op, args.as_slice()) {
    (Op::Binary(op, ..), [a, b]) => eval::binary(*op, a, b).ok(),
    (Op::Compare(op, ..), [a, b]) => eval::compare(*op, a, b).ok(),
    (Op::Unary(op, _), [a]) => eval::unary(*op, a).ok(),
    (Op::Cast(_), [a]) => eval::cast(a, ty).ok(),
    (Op::Splat(_), [a]) => eval::splat(a, ty).ok(),
    (Op::Extract { index, .. }, [a]) => a.component(*index),
    (Op::Compose(_), args) => {
      eval::compose(ty, args.iter().map(|v| (*v).clone()).collect(), structs).ok()
    }
    _ => None,
  }
}

fn is_int(v: Option<&Value>, n: i32) -> bool {
  matches!(v, Some(Value::Int(x)) if *x == n)
}

fn is_one(v: Option<&Value>) -> bool {
  match v {
    Some(Value::Int(x)) => *x == 1,
    Some(Value::Float(x)) => *x == 1.,
    Some(Value::Double(x)) => *x == 1.,
    _ => false,
  }
}

/// Operand an instruction is equivalent to, if it is an identity such as `x + 0` or `x * 1`.
fn identity(op: &Op, consts: &HashMap<ValueId, Value>) -> Option<ValueId> {
  let Op::Binary(op, a, b) = *op else {
    return None;
  };
  let (ca, cb) = (consts.get(&a), consts.get(&b));

  match op {
    BinOp::Add | BinOp::BitOr | BinOp::BitXor if is_int(cb, 0) => Some(a),
    BinOp::Add | BinOp::BitOr | BinOp::BitXor if is_int(ca, 0) => Some(b),
    BinOp::Sub | BinOp::Shl | BinOp::Shr if is_int(cb, 0) => Some(a),
    BinOp::Mul | BinOp::Div if is_one(cb) => Some(a),
    BinOp::Mul if is_one(ca) => Some(b),
    _ => None,
  }
}

fn combine_instructions(blocks: &mut [Block], structs: &StructTable) -> bool {
  let mut consts = constants(blocks);
  let mut replace = HashMap::new();
  let mut changed = false;

  for block in blocks.iter_mut() {
    for inst in &mut block.insts {
      inst.op.map_operands(|v| resolve(&replace, v));

      if let Some(value) = fold(&inst.op, &inst.ty, &consts, structs) {
        consts.insert(inst.result, value.clone());
        inst.op = Op::Const(value);
        changed = true;
      } else if let Some(to) = identity(&inst.op, &consts) {
        replace.insert(inst.result, to);
      }
    }
  }

  changed |= !replace.is_empty();
  rewrite(blocks, &replace);
  changed
}

fn eliminate_common_subexpressions(blocks: &mut [Block]) -> bool {
  let mut replace = HashMap::new();

  for block in blocks.iter_mut() {
    let mut seen: Vec<(Op, IrType, ValueId)> = Vec::new();

    for inst in &mut block.insts {
      inst.op.map_operands(|v| resolve(&replace, v));

      if !inst.op.is_pure() {
        continue;
      }

      let prior = seen
        .iter()
        .find(|(op, ty, _)| *op == inst.op && *ty == inst.ty)
        .map(|(.., prior)| *prior);

      match prior {
        Some(prior) => {
          replace.insert(inst.result, prior);
        }
        None => seen.push((inst.op.clone(), inst.ty.clone(), inst.result)),
      }
    }
  }

  rewrite(blocks, &replace);
  !replace.is_empty()
}

fn remove_dead_instructions(blocks: &mut [Block]) -> bool {
  let mut changed = false;

  loop {
    let used: HashSet<ValueId> = blocks
      .iter()
      .flat_map(|b| {
        b.insts
          .iter()
          .flat_map(|i| i.op.operands())
          .chain(b.term.iter().flat_map(|t| t.operands()))
      })
      .collect();

    let mut removed = false;
    for block in blocks.iter_mut() {
      let before = block.insts.len();
      block.insts.retain(|i| {
        let removable = i.op.is_pure() || matches!(i.op, Op::Alloca(_));
        !removable || used.contains(&i.result)
      });
      removed |= block.insts.len() != before;
    }

    if !removed {
      return changed;
    }

    changed = true;
  }
}

/// Blocks reachable from the entry block.
fn reachable(blocks: &[Block]) -> Vec<bool> {
  let mut seen = vec![false; blocks.len()];
  let mut stack = vec![0];

  while let Some(b) = stack.pop() {
    if b >= blocks.len() || seen[b] {
      continue;
    }

    seen[b] = true;
    if let Some(term) = &blocks[b].term {
      stack.extend(term.successors().into_iter().map(|s| s as usize));
    }
  }

  seen
}

/// Block indices in reverse post-order from the entry block.
fn reverse_postorder(blocks: &[Block]) -> Vec<usize> {
  let mut visited = vec![false; blocks.len()];
  let mut post = Vec::with_capacity(blocks.len());
  // (block, index of the next successor to visit)
  let mut stack = vec![(0, 0)];

  if blocks.is_empty() {
    return post;
  }

  visited[0] = true;

  while let Some((b, next)) = stack.pop() {
    let succs = blocks[b]
      .term
      .as_ref()
      .map(Terminator::successors)
      .unwrap_or_default();

    match succs.get(next) {
      Some(&s) => {
        stack.push((b, next + 1));

        let s = s as usize;
        if s < blocks.len() && !visited[s] {
          visited[s] = true;
          stack.push((s, 0));
        }
      }

      None => post.push(b),
    }
  }

  post.reverse();
  post
}

fn remove_unreachable(blocks: &mut Vec<Block>) -> bool {
  let live = reachable(blocks);

  if live.iter().all(|&l| l) {
    return false;
  }

  let mut renumber = HashMap::new();
  let mut next = 0;
  for (i, &l) in live.iter().enumerate() {
    if l {
      renumber.insert(i as BlockId, next);
      next += 1;
    }
  }

  let mut i = 0;
  blocks.retain(|_| {
    i += 1;
    live[i - 1]
  });

  for block in blocks.iter_mut() {
    if let Some(term) = &mut block.term {
      term.map_successors(|b| renumber.get(&b).copied().unwrap_or(b));
    }
  }

  true
}

// Final target of a chain of forwarding blocks; a chain that loops on itself is left alone.
fn forward_target(forward: &HashMap<BlockId, BlockId>, start: BlockId) -> BlockId {
  let mut seen = HashSet::new();
  let mut b = start;

  while let Some(&to) = forward.get(&b) {
    if !seen.insert(b) {
      return start;
    }

    b = to;
  }

  b
}

fn simplify_cfg(blocks: &mut Vec<Block>) -> bool {
  let consts = constants(blocks);
  let mut changed = false;

  for block in blocks.iter_mut() {
    let Some(term) = &mut block.term else {
      continue;
    };

    if let Terminator::CondBr {
      cond,
      then_block,
      else_block,
    } = *term
    {
      let target = match consts.get(&cond) {
        Some(Value::Bool(true)) => Some(then_block),
        Some(Value::Bool(false)) => Some(else_block),
        _ if then_block == else_block => Some(then_block),
        _ => None,
      };

      if let Some(target) = target {
        *term = Terminator::Br(target);
        changed = true;
      }
    }
  }

  // empty blocks that only jump somewhere else
  let forward: HashMap<BlockId, BlockId> = blocks
    .iter()
    .enumerate()
    .skip(1)
    .filter_map(|(i, b)| match b.term {
      Some(Terminator::Br(to)) if b.insts.is_empty() && to as usize != i => Some((i as BlockId, to)),
      _ => None,
    })
    .collect();

  for block in blocks.iter_mut() {
    if let Some(term) = &mut block.term {
      let before = term.clone();
      term.map_successors(|b| forward_target(&forward, b));
      changed |= *term != before;
    }
  }

  changed |= remove_unreachable(blocks);

  loop {
    let mut preds = vec![0usize; blocks.len()];
    for block in blocks.iter() {
      for s in block.term.iter().flat_map(|t| t.successors()) {
        if let Some(p) = preds.get_mut(s as usize) {
          *p += 1;
        }
      }
    }

    let candidate = blocks.iter().enumerate().find_map(|(i, b)| match b.term {
      Some(Terminator::Br(s)) if s != 0 && s as usize != i && preds[s as usize] == 1 => {
        Some((i, s as usize))
      }
      _ => None,
    });

    let Some((pred, succ)) = candidate else {
      break;
    };

    // the merged block is left looping on itself, unreachable, until it gets removed below
    let name = blocks[succ].name.clone();
    let merged = std::mem::replace(
      &mut blocks[succ],
      Block {
        name,
        insts: Vec::new(),
        term: Some(Terminator::Br(succ as BlockId)),
      },
    );

    blocks[pred].insts.extend(merged.insts);
    blocks[pred].term = merged.term;
    changed = true;
  }

  remove_unreachable(blocks);
  changed
}

/// Check the internal consistency of the function `symbol` of `module`.
///
/// Every block must be terminated and branch to existing blocks, every operand must be defined before it is used,
/// operand types must agree with the operations using them, calls must match the declaration of their callee and
/// returns must match the function return type.
pub fn verify(module: &Module, symbol: &str) -> Result<()> {
  let function = module
    .function(symbol)
    .ok_or_else(|| TslError::link(format!("function {} not found in {}", symbol, module.name())))?;

  Verifier::new(module, function)?.run()
}

struct Verifier<'a> {
  module: &'a Module,
  function: &'a Function,
  blocks: &'a [Block],
  types: HashMap<ValueId, &'a IrType>,
}

impl<'a> Verifier<'a> {
  fn fail(&self, msg: impl std::fmt::Display) -> TslError {
    TslError::link(format!("function {} is invalid: {}", self.function.name, msg))
  }

  fn new(module: &'a Module, function: &'a Function) -> Result<Self> {
    let mut verifier = Verifier {
      module,
      function,
      blocks: &[],
      types: function
        .params
        .iter()
        .enumerate()
        .map(|(i, ty)| (i as ValueId, ty))
        .collect(),
    };

    let Body::Blocks { blocks, value_count } = &function.body else {
      return Err(verifier.fail("it has no body"));
    };

    if blocks.is_empty() {
      return Err(verifier.fail("it has no blocks"));
    }

    for inst in blocks.iter().flat_map(|b| &b.insts) {
      if inst.result >= *value_count {
        return Err(verifier.fail(format!("value %{} is out of range", inst.result)));
      }

      if verifier.types.insert(inst.result, &inst.ty).is_some() {
        return Err(verifier.fail(format!("value %{} is defined twice", inst.result)));
      }
    }

    verifier.blocks = blocks.as_slice();
    Ok(verifier)
  }

  fn ty(&self, v: ValueId) -> Result<&'a IrType> {
    self
      .types
      .get(&v)
      .copied()
      .ok_or_else(|| self.fail(format!("value %{} is never defined", v)))
  }

  fn run(&self) -> Result<()> {
    for (i, block) in self.blocks.iter().enumerate() {
      let term = block
        .term
        .as_ref()
        .ok_or_else(|| self.fail(format!("block bb{} is not terminated", i)))?;

      if let Some(s) = term
        .successors()
        .into_iter()
        .find(|&s| s as usize >= self.blocks.len())
      {
        return Err(self.fail(format!("block bb{} branches to missing block bb{}", i, s)));
      }
    }

    // unreachable blocks come last; they may use anything defined on the way
    let mut order = reverse_postorder(self.blocks);
    let live = reachable(self.blocks);
    order.extend((0..self.blocks.len()).filter(|&i| !live[i]));

    let mut defined: HashSet<ValueId> = (0..self.function.params.len() as ValueId).collect();

    for b in order {
      let block = &self.blocks[b];

      for inst in &block.insts {
        if let Some(v) = inst.op.operands().into_iter().find(|v| !defined.contains(v)) {
          return Err(self.fail(format!("%{} is used before its definition in bb{}", v, b)));
        }

        self.check_op(&inst.op, &inst.ty)?;
        defined.insert(inst.result);
      }

      if let Some(term) = &block.term {
        if let Some(v) = term.operands().into_iter().find(|v| !defined.contains(v)) {
          return Err(self.fail(format!("%{} is used before its definition in bb{}", v, b)));
        }

        self.check_terminator(term)?;
      }
    }

    Ok(())
  }

  fn expect(&self, found: &IrType, expected: &IrType, what: &str) -> Result<()> {
    if found == expected {
      Ok(())
    } else {
      Err(self.fail(format!("{} has type {:?}, expected {:?}", what, found, expected)))
    }
  }

  fn check_op(&self, op: &Op, ty: &IrType) -> Result<()> {
    let structs = &self.module.structs;

    match op {
      Op::Load(ptr) => {
        let pointee = self.ty(*ptr)?.pointee();
        self.expect(ty, pointee.unwrap_or(&IrType::Void), "load")
      }

      Op::Store { ptr, value } => {
        let pointee = self
          .ty(*ptr)?
          .pointee()
          .ok_or_else(|| self.fail(format!("store through non-pointer %{}", ptr)))?;
        self.expect(self.ty(*value)?, pointee, "stored value")
      }

      Op::FieldPtr { base, index } => {
        let field = self
          .ty(*base)?
          .pointee()
          .and_then(|agg| agg.field(*index, structs))
          .ok_or_else(|| self.fail(format!("%{} has no field {}", base, index)))?;
        self.expect(ty, &field.ptr(), "field pointer")
      }

      Op::Extract { base, index } => {
        let field = self
          .ty(*base)?
          .field(*index, structs)
          .ok_or_else(|| self.fail(format!("%{} has no field {}", base, index)))?;
        self.expect(ty, &field, "extracted field")
      }

      Op::Binary(_, a, b) => {
        self.expect(self.ty(*a)?, ty, "left operand")?;
        self.expect(self.ty(*b)?, ty, "right operand")
      }

      Op::Compare(_, a, b) => {
        self.expect(self.ty(*b)?, self.ty(*a)?, "compared operand")?;
        self.expect(ty, &IrType::I1, "comparison")
      }

      Op::Unary(_, a) => self.expect(self.ty(*a)?, ty, "operand"),

      Op::Call { callee, args } => {
        let f = self
          .module
          .function(callee)
          .ok_or_else(|| self.fail(format!("call to undeclared function {}", callee)))?;

        if f.params.len() != args.len() {
          return Err(self.fail(format!(
            "{} takes {} arguments, {} given",
            callee,
            f.params.len(),
            args.len()
          )));
        }

        for (arg, param) in args.iter().zip(&f.params) {
          self.expect(self.ty(*arg)?, param, "argument")?;
        }

        self.expect(ty, &f.ret, "call result")
      }

      Op::Const(_) | Op::Alloca(_) | Op::Compose(_) | Op::Cast(_) | Op::Splat(_) => Ok(()),
    }
  }

  fn check_terminator(&self, term: &Terminator) -> Result<()> {
    match (term, &self.function.ret) {
      (Terminator::CondBr { cond, .. }, _) => self.expect(self.ty(*cond)?, &IrType::I1, "condition"),
      (Terminator::Br(_), _) | (Terminator::Ret(None), IrType::Void) => Ok(()),
      (Terminator::Ret(Some(v)), ret) if *ret != IrType::Void => {
        self.expect(self.ty(*v)?, ret, "returned value")
      }
      _ => Err(self.fail("return does not match the return type")),
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::ir::{CmpOp, FunctionBuilder, Inst, Linkage};

  fn insts(f: &Function) -> Vec<Op> {
    f.blocks()
      .unwrap()
      .iter()
      .flat_map(|b| b.insts.iter().map(|i| i.op.clone()))
      .collect()
  }

  #[test]
  fn folds_constants() {
    let mut b = FunctionBuilder::new("f", vec![], IrType::I32, Linkage::External);
    let x = b.constant(Value::Int(2), IrType::I32);
    let y = b.constant(Value::Int(3), IrType::I32);
    let s = b.binary(BinOp::Mul, x, y);
    let f = b.cast(s, IrType::I32);
    b.ret(Some(f));

    let mut f = b.finish();
    optimize(&mut f, &StructTable::new());

    assert_eq!(insts(&f), vec![Op::Const(Value::Int(6))]);
  }

  #[test]
  fn removes_identities_and_duplicates() {
    let mut b = FunctionBuilder::new("f", vec![IrType::F32], IrType::F32, Linkage::External);
    let one = b.constant(Value::Float(1.), IrType::F32);
    let x = b.binary(BinOp::Mul, b.param(0), one);
    let y = b.binary(BinOp::Add, x, x);
    let z = b.binary(BinOp::Add, x, x);
    let r = b.binary(BinOp::Sub, y, z);
    b.ret(Some(r));

    let mut f = b.finish();
    optimize(&mut f, &StructTable::new());

    assert_eq!(
      insts(&f),
      vec![Op::Binary(BinOp::Add, 0, 0), Op::Binary(BinOp::Sub, y, y)]
    );
  }

  #[test]
  fn folds_constant_branches() {
    let mut b = FunctionBuilder::new("f", vec![], IrType::I32, Linkage::External);
    let t = b.constant(Value::Bool(true), IrType::I1);
    let then_block = b.create_block("then");
    let else_block = b.create_block("else");
    b.cond_br(t, then_block, else_block);

    b.position_at_end(then_block);
    let one = b.constant(Value::Int(1), IrType::I32);
    b.ret(Some(one));

    b.position_at_end(else_block);
    let two = b.constant(Value::Int(2), IrType::I32);
    b.ret(Some(two));

    let mut f = b.finish();
    optimize(&mut f, &StructTable::new());

    let blocks = f.blocks().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].term, Some(Terminator::Ret(Some(one))));
  }

  #[test]
  fn keeps_loops() {
    let mut b = FunctionBuilder::new("f", vec![IrType::I32], IrType::I32, Linkage::External);
    let slot = b.alloca(IrType::I32);
    b.store(slot, b.param(0));
    let cond_block = b.create_block("cond");
    let body = b.create_block("body");
    let exit = b.create_block("exit");
    b.br(cond_block);

    b.position_at_end(cond_block);
    let v = b.load(slot);
    let zero = b.constant(Value::Int(0), IrType::I32);
    let c = b.compare(CmpOp::Gt, v, zero);
    b.cond_br(c, body, exit);

    b.position_at_end(body);
    let v = b.load(slot);
    let one = b.constant(Value::Int(1), IrType::I32);
    let d = b.binary(BinOp::Sub, v, one);
    b.store(slot, d);
    b.br(cond_block);

    b.position_at_end(exit);
    let v = b.load(slot);
    b.ret(Some(v));

    let mut f = b.finish();
    optimize(&mut f, &StructTable::new());

    let m = {
      let mut m = Module::new("m");
      m.add_function(f.clone()).unwrap();
      m
    };
    verify(&m, "f").unwrap();
    assert_eq!(f.blocks().unwrap().len(), 4);
  }

  #[test]
  fn verifier_rejects_broken_bodies() {
    let mut m = Module::new("m");
    m.add_function(Function {
      name: "bad".to_owned(),
      params: vec![],
      ret: IrType::F32,
      linkage: Linkage::External,
      body: Body::Blocks {
        blocks: vec![Block {
          name: "entry".to_owned(),
          insts: vec![Inst {
            result: 0,
            ty: IrType::F32,
            op: Op::Binary(BinOp::Add, 1, 1),
          }],
          term: Some(Terminator::Ret(Some(0))),
        }],
        value_count: 2,
      },
    })
    .unwrap();

    assert!(matches!(verify(&m, "bad"), Err(TslError::Link(_))));
    assert!(matches!(verify(&m, "missing"), Err(TslError::Link(_))));

    let mut b = FunctionBuilder::new("void_ret", vec![], IrType::I32, Linkage::External);
    b.ret(None);
    m.add_function(b.finish()).unwrap();
    assert!(matches!(verify(&m, "void_ret"), Err(TslError::Link(_))));

    let mut b = FunctionBuilder::new("call", vec![], IrType::Void, Linkage::External);
    b.call("nowhere", vec![], IrType::Void);
    b.ret(None);
    m.add_function(b.finish()).unwrap();
    assert!(matches!(verify(&m, "call"), Err(TslError::Link(_))));
  }
}
