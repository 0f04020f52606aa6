//! Linking and execution of compiled modules.
//!
//! An [`ExecutionEngine`] owns the modules of one program. Asking it for the address of a symbol links the function
//! with everything it transitively calls and hands back a [`ShaderFunction`], an immutable program that can be shared
//! between threads and called any number of times.
//!
//! Calls are resolved the way a static linker would: a callee defined in the caller's own module wins (internal
//! functions are only visible there), otherwise it must be defined with external linkage by exactly one module.

use crate::{
  error::{Result, TslError},
  eval,
  ir::{zero_value, Block, Body, Function, Inst, IrType, Linkage, Module, Op, StructTable, Terminator, ValueId},
  value::{Pointer, Value},
};
use std::{
  collections::{HashMap, VecDeque},
  fmt,
  sync::Arc,
};

/// Nesting of calls allowed by default before a running shader is aborted.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Highest call depth that can be configured.
pub const MAX_CALL_DEPTH_LIMIT: usize = 1 << 16;

/// Modules to link together into callable functions.
#[derive(Debug)]
pub struct ExecutionEngine {
  modules: Vec<Module>,
  max_call_depth: usize,
}

impl ExecutionEngine {
  /// Engine linking against `module` first.
  pub fn new(module: Module) -> Self {
    Self {
      modules: vec![module],
      max_call_depth: DEFAULT_MAX_CALL_DEPTH,
    }
  }

  /// Change the call depth allowed to the functions linked by this engine, clamped to
  /// `1..=`[`MAX_CALL_DEPTH_LIMIT`].
  pub fn with_max_call_depth(mut self, max_call_depth: usize) -> Self {
    self.max_call_depth = max_call_depth.clamp(1, MAX_CALL_DEPTH_LIMIT);
    self
  }

  /// Make the definitions of `module` available to the linker.
  pub fn add_module(&mut self, module: Module) {
    self.modules.push(module);
  }

  /// Link the function `symbol` and everything it calls.
  pub fn get_function_address(&self, symbol: &str) -> Result<ShaderFunction> {
    let mut linker = Linker::new(&self.modules)?;

    let (m, f) = linker
      .externals
      .get(symbol)
      .copied()
      .ok_or_else(|| TslError::link(format!("symbol {} not found", symbol)))?;

    let entry = linker.intern(m, f);
    linker.link()?;

    log::debug!(
      "linked {} ({} functions from {} modules)",
      symbol,
      linker.functions.len(),
      self.modules.len()
    );

    Ok(ShaderFunction {
      program: Arc::new(Program {
        functions: linker.functions,
        structs: self.modules.iter().map(|m| m.structs.clone()).collect(),
        max_call_depth: self.max_call_depth,
      }),
      entry,
    })
  }
}

#[derive(Debug)]
struct LinkedFunction {
  function: Function,
  /// Index of the module the function comes from.
  module: usize,
  /// Callee symbols, resolved to function indices.
  callees: HashMap<String, usize>,
}

struct Linker<'a> {
  modules: &'a [Module],
  externals: HashMap<&'a str, (usize, &'a Function)>,
  interned: HashMap<(usize, &'a str), usize>,
  functions: Vec<LinkedFunction>,
  queue: VecDeque<usize>,
}

impl<'a> Linker<'a> {
  fn new(modules: &'a [Module]) -> Result<Self> {
    let mut externals = HashMap::new();

    for (m, module) in modules.iter().enumerate() {
      let defined = module
        .functions()
        .filter(|f| !f.is_declaration() && f.linkage == Linkage::External);

      for f in defined {
        if let Some((other, _)) = externals.insert(f.name.as_str(), (m, f)) {
          return Err(TslError::link(format!(
            "symbol {} is defined by both {} and {}",
            f.name,
            modules[other].name(),
            module.name()
          )));
        }
      }
    }

    Ok(Self {
      modules,
      externals,
      interned: HashMap::new(),
      functions: Vec::new(),
      queue: VecDeque::new(),
    })
  }

  fn intern(&mut self, module: usize, f: &'a Function) -> usize {
    if let Some(&i) = self.interned.get(&(module, f.name.as_str())) {
      return i;
    }

    let i = self.functions.len();
    self.functions.push(LinkedFunction {
      function: f.clone(),
      module,
      callees: HashMap::new(),
    });
    self.interned.insert((module, f.name.as_str()), i);
    self.queue.push_back(i);
    i
  }

  fn resolve(&self, module: usize, caller: &str, callee: &str) -> Result<(usize, &'a Function)> {
    let modules: &'a [Module] = self.modules;
    let local = modules[module].function(callee);

    let target = match local {
      Some(f) if !f.is_declaration() => (module, f),
      _ => self.externals.get(callee).copied().ok_or_else(|| {
        TslError::link(format!(
          "unresolved symbol {} referenced from {}",
          callee, caller
        ))
      })?,
    };

    if let Some(decl) = local {
      if !decl.same_signature(target.1) {
        return Err(TslError::link(format!(
          "{} is declared with a signature different from its definition in {}",
          callee,
          self.modules[target.0].name()
        )));
      }
    }

    Ok(target)
  }

  fn link(&mut self) -> Result<()> {
    while let Some(i) = self.queue.pop_front() {
      let module = self.functions[i].module;
      let caller = self.functions[i].function.name.clone();

      let mut callees = HashMap::new();
      for callee in called_symbols(&self.functions[i].function) {
        let (m, f) = self.resolve(module, &caller, &callee)?;
        let index = self.intern(m, f);
        callees.insert(callee, index);
      }

      self.functions[i].callees = callees;
    }

    Ok(())
  }
}

fn called_symbols(f: &Function) -> Vec<String> {
  let mut symbols: Vec<String> = f
    .blocks()
    .unwrap_or_default()
    .iter()
    .flat_map(|b| &b.insts)
    .filter_map(|inst| match &inst.op {
      Op::Call { callee, .. } => Some(callee.clone()),
      _ => None,
    })
    .collect();

  symbols.sort();
  symbols.dedup();
  symbols
}

/// Whether `v` is a value of type `ty`.
fn fits(ty: &IrType, v: &Value) -> bool {
  matches!(
    (ty, v),
    (IrType::Void, Value::Void)
      | (IrType::I1, Value::Bool(_))
      | (IrType::I32, Value::Int(_))
      | (IrType::F32, Value::Float(_))
      | (IrType::F64, Value::Double(_))
      | (IrType::Float3, Value::Float3(_))
      | (IrType::Float4, Value::Float4(_))
      | (IrType::Closure, Value::Closure(_))
      | (IrType::Struct(_), Value::Struct(_))
      | (IrType::Ptr(_), Value::Ptr(_))
  )
}

#[derive(Debug)]
struct Program {
  functions: Vec<LinkedFunction>,
  structs: Vec<StructTable>,
  max_call_depth: usize,
}

/// Activation of a function with a body: its registers and where it stands in its blocks.
struct Frame<'a> {
  program: &'a Program,
  linked: &'a LinkedFunction,
  blocks: &'a [Block],
  values: Vec<Value>,
  block: usize,
  inst: usize,
  // length of the memory when the frame was entered; its stack slots live above
  mark: usize,
}

/// Result of entering a function.
enum Entered<'a> {
  /// Native functions run at once.
  Done(Value),
  Frame(Frame<'a>),
}

/// What a frame does next.
enum Step {
  /// The current instruction produced a value.
  Next(Value),
  Call(usize, Vec<Value>),
  Jump(usize),
  Return(Value),
}

impl Program {
  fn enter(&self, f: usize, args: Vec<Value>, memory: &[Value], depth: usize) -> Result<Entered<'_>> {
    let linked = &self.functions[f];
    let function = &linked.function;

    if depth > self.max_call_depth {
      return Err(TslError::execution(format!(
        "call depth limit of {} exceeded in {}",
        self.max_call_depth, function.name
      )));
    }

    match &function.body {
      Body::Native(native) => {
        let ret = native.call(&args);

        if fits(&function.ret, &ret) {
          Ok(Entered::Done(ret))
        } else {
          Err(TslError::execution(format!(
            "native function {} returned {} where {:?} was expected",
            function.name, ret, function.ret
          )))
        }
      }

      Body::Blocks {
        blocks,
        value_count,
      } => {
        let mut values = args;
        values.resize(*value_count as usize, Value::Void);

        Ok(Entered::Frame(Frame {
          program: self,
          linked,
          blocks,
          values,
          block: 0,
          inst: 0,
          mark: memory.len(),
        }))
      }

      Body::Declaration => Err(TslError::execution(format!(
        "{} was called but never defined",
        function.name
      ))),
    }
  }

  /// Run function `f` to completion. Calls are kept on an explicit stack of frames, so the depth of shader recursion
  /// does not depend on the stack of the calling thread.
  fn run(&self, f: usize, args: Vec<Value>, memory: &mut Vec<Value>) -> Result<Value> {
    let mut stack = match self.enter(f, args, memory, 0)? {
      Entered::Done(v) => return Ok(v),
      Entered::Frame(frame) => vec![frame],
    };

    while let Some(frame) = stack.last_mut() {
      match frame.step(memory)? {
        Step::Next(v) => frame.complete(v),

        Step::Jump(block) => {
          frame.block = block;
          frame.inst = 0;
        }

        Step::Call(callee, args) => match self.enter(callee, args, memory, stack.len())? {
          Entered::Done(v) => {
            if let Some(frame) = stack.last_mut() {
              frame.complete(v);
            }
          }
          Entered::Frame(callee) => stack.push(callee),
        },

        Step::Return(v) => {
          let mark = frame.mark;
          stack.pop();
          memory.truncate(mark);

          match stack.last_mut() {
            Some(caller) => caller.complete(v),
            None => return Ok(v),
          }
        }
      }
    }

    Err(TslError::execution("no function is running"))
  }
}

impl<'a> Frame<'a> {
  fn get(&self, v: ValueId) -> Result<&Value> {
    self
      .values
      .get(v as usize)
      .ok_or_else(|| TslError::execution(format!("value %{} is out of range", v)))
  }

  fn pointer(&self, v: ValueId) -> Result<Pointer> {
    match self.get(v)? {
      Value::Ptr(p) => Ok(p.clone()),
      other => Err(TslError::execution(format!("{} is not a pointer", other))),
    }
  }

  fn step(&self, memory: &mut Vec<Value>) -> Result<Step> {
    let block = self
      .blocks
      .get(self.block)
      .ok_or_else(|| TslError::execution(format!("branch to missing block bb{}", self.block)))?;

    if let Some(inst) = block.insts.get(self.inst) {
      return match &inst.op {
        Op::Call { callee, args } => {
          let f = *self.linked.callees.get(callee).ok_or_else(|| {
            TslError::execution(format!("call to unlinked function {}", callee))
          })?;
          let args = args
            .iter()
            .map(|a| self.get(*a).cloned())
            .collect::<Result<Vec<_>>>()?;

          Ok(Step::Call(f, args))
        }

        _ => self.exec(inst, memory).map(Step::Next),
      };
    }

    match &block.term {
      Some(Terminator::Br(target)) => Ok(Step::Jump(*target as usize)),

      Some(Terminator::CondBr {
        cond,
        then_block,
        else_block,
      }) => match self.get(*cond)? {
        Value::Bool(true) => Ok(Step::Jump(*then_block as usize)),
        Value::Bool(false) => Ok(Step::Jump(*else_block as usize)),
        other => Err(TslError::execution(format!("{} is not a condition", other))),
      },

      Some(Terminator::Ret(v)) => match v {
        Some(v) => self.get(*v).cloned().map(Step::Return),
        None => Ok(Step::Return(Value::Void)),
      },

      None => Err(TslError::execution(format!(
        "block bb{} of {} is not terminated",
        self.block, self.linked.function.name
      ))),
    }
  }

  // Store the value of the current instruction and move past it.
  fn complete(&mut self, v: Value) {
    let result = self
      .blocks
      .get(self.block)
      .and_then(|b| b.insts.get(self.inst))
      .map(|inst| inst.result);

    if let Some(slot) = result.and_then(|r| self.values.get_mut(r as usize)) {
      *slot = v;
    }

    self.inst += 1;
  }

  fn exec(&self, inst: &Inst, memory: &mut Vec<Value>) -> Result<Value> {
    let structs = &self.program.structs[self.linked.module];

    let v = match &inst.op {
      Op::Const(v) => v.clone(),

      Op::Alloca(ty) => {
        memory.push(zero_value(ty, structs));
        Value::Ptr(Pointer {
          cell: memory.len() - 1,
          path: Vec::new(),
        })
      }

      Op::Load(ptr) => {
        let p = self.pointer(*ptr)?;
        memory
          .get(p.cell)
          .and_then(|cell| cell.get_path(&p.path))
          .ok_or_else(|| TslError::execution(format!("invalid load through {}", Value::Ptr(p.clone()))))?
      }

      Op::Store { ptr, value } => {
        let p = self.pointer(*ptr)?;
        let value = self.get(*value)?.clone();
        let stored = memory
          .get_mut(p.cell)
          .is_some_and(|cell| cell.set_path(&p.path, value));

        if !stored {
          return Err(TslError::execution(format!(
            "invalid store through {}",
            Value::Ptr(p)
          )));
        }

        Value::Void
      }

      Op::FieldPtr { base, index } => {
        let mut p = self.pointer(*base)?;
        p.path.push(*index);
        Value::Ptr(p)
      }

      Op::Extract { base, index } => {
        let base = self.get(*base)?;
        base
          .component(*index)
          .ok_or_else(|| TslError::execution(format!("{} has no component {}", base, index)))?
      }

      Op::Compose(components) => {
        let components = components
          .iter()
          .map(|c| self.get(*c).cloned())
          .collect::<Result<Vec<_>>>()?;
        eval::compose(&inst.ty, components, structs)?
      }

      Op::Binary(op, a, b) => eval::binary(*op, self.get(*a)?, self.get(*b)?)?,
      Op::Compare(op, a, b) => eval::compare(*op, self.get(*a)?, self.get(*b)?)?,
      Op::Unary(op, a) => eval::unary(*op, self.get(*a)?)?,
      Op::Cast(a) => eval::cast(self.get(*a)?, &inst.ty)?,
      Op::Splat(a) => eval::splat(self.get(*a)?, &inst.ty)?,

      Op::Call { callee, .. } => {
        return Err(TslError::execution(format!(
          "call to {} cannot be evaluated in place",
          callee
        )))
      }
    };

    Ok(v)
  }
}

/// Linked, callable shader function.
///
/// Cloning is cheap and the function can be called from any number of threads at once; every call runs on its own
/// memory.
#[derive(Clone)]
pub struct ShaderFunction {
  program: Arc<Program>,
  entry: usize,
}

impl ShaderFunction {
  fn function(&self) -> &Function {
    &self.program.functions[self.entry].function
  }

  /// Symbol the function was linked from.
  pub fn symbol(&self) -> &str {
    &self.function().name
  }

  /// Parameter types; output parameters are pointers.
  pub fn param_types(&self) -> &[IrType] {
    &self.function().params
  }

  /// Call the function.
  ///
  /// `args` holds one value per parameter. Values passed for output parameters are the initial content of the output
  /// slots, and are replaced by what the function wrote to them once the call returns.
  pub fn call(&self, args: &mut [Value]) -> Result<Value> {
    let params = self.param_types();

    if args.len() != params.len() {
      return Err(TslError::execution(format!(
        "{} takes {} arguments, {} given",
        self.symbol(),
        params.len(),
        args.len()
      )));
    }

    let mut memory = Vec::new();
    let mut actual = Vec::with_capacity(args.len());

    for (i, (arg, ty)) in args.iter().zip(params).enumerate() {
      let (ty, is_output) = match ty {
        IrType::Ptr(pointee) => (&**pointee, true),
        ty => (ty, false),
      };

      if !fits(ty, arg) {
        return Err(TslError::execution(format!(
          "argument {} of {} expects {:?}, got {}",
          i,
          self.symbol(),
          ty,
          arg
        )));
      }

      if is_output {
        memory.push(arg.clone());
        actual.push(Value::Ptr(Pointer {
          cell: memory.len() - 1,
          path: Vec::new(),
        }));
      } else {
        actual.push(arg.clone());
      }
    }

    let ret = self.program.run(self.entry, actual, &mut memory)?;

    // memory now only holds the output slots, in parameter order
    let mut outputs = memory.into_iter();
    for (arg, ty) in args.iter_mut().zip(params) {
      if matches!(ty, IrType::Ptr(_)) {
        if let Some(v) = outputs.next() {
          *arg = v;
        }
      }
    }

    Ok(ret)
  }
}

impl fmt::Debug for ShaderFunction {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("ShaderFunction")
      .field("symbol", &self.symbol())
      .finish()
  }
}
