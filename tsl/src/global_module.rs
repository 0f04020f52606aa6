//! Global runtime module.
//!
//! Every compiled unit links against the module published here: it defines the closure algebra (`closure + closure`,
//! `closure * float`), one constructor per registered closure type, the math library and every host callback. Code
//! generation only sees declarations of those functions; their native definitions are linked in at resolution time.
//!
//! The published [`Module`] is never mutated. Registering a closure type or a callback publishes a new module built
//! from a copy of the previous one, so templates compiled earlier keep linking against the module they were compiled
//! with.

use crate::{
  ast::Param,
  codegen::{ClosureSignature, CompileContext, FieldInfo, FunctionSignature, TypeLayout},
  error::{Result, TslError},
  ir::{Function, IrType, Linkage, Module, NativeFunction},
  types::{ShaderArgumentType, Type},
  value::{closure_add, closure_mul, ClosureId, ClosureTreeNode, Value},
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

/// Name of the global runtime module.
pub const GLOBAL_MODULE_NAME: &str = "tsl_global_module";

/// Symbol of the closure sum.
pub const CLOSURE_ADD: &str = "tsl.closure.add";

/// Symbol of the closure scaling.
pub const CLOSURE_MUL: &str = "tsl.closure.mul";

/// Symbol of the constructor of a registered closure type.
pub fn closure_constructor_symbol(name: &str) -> String {
  format!("tsl.closure.make.{}", name)
}

/// Parameter of a closure type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClosureVar {
  pub name: String,
  pub ty: ShaderArgumentType,
}

impl ClosureVar {
  pub fn new(name: impl Into<String>, ty: ShaderArgumentType) -> Self {
    Self {
      name: name.into(),
      ty,
    }
  }
}

#[derive(Debug)]
struct ClosureEntry {
  id: ClosureId,
  params: Vec<ClosureVar>,
}

#[derive(Debug)]
struct GlobalState {
  closures: HashMap<String, ClosureEntry>,
  next_closure_id: u32,
  // math library and host callbacks, by name
  functions: HashMap<String, FunctionSignature>,
  module: Arc<Module>,
}

/// Owner of closure registrations, host callbacks and the published runtime module.
#[derive(Debug)]
pub struct GlobalModule {
  state: RwLock<GlobalState>,
}

impl Default for GlobalModule {
  fn default() -> Self {
    Self::new()
  }
}

fn params_of(tys: &[Type]) -> Vec<Param> {
  tys
    .iter()
    .enumerate()
    .map(|(i, ty)| Param {
      name: format!("arg{}", i),
      ty: ty.clone(),
      is_output: false,
    })
    .collect()
}

macro_rules! math {
  ($variant:ident, $ty:ty, $f:expr) => {
    NativeFunction::new(|args| match args {
      [Value::$variant(x)] => Value::$variant(($f as fn($ty) -> $ty)(*x)),
      _ => Value::Void,
    })
  };

  ($variant:ident, $ty:ty, $f:expr, 2) => {
    NativeFunction::new(|args| match args {
      [Value::$variant(x), Value::$variant(y)] => {
        Value::$variant(($f as fn($ty, $ty) -> $ty)(*x, *y))
      }
      _ => Value::Void,
    })
  };
}

fn math_library() -> Vec<(&'static str, Type, usize, NativeFunction)> {
  vec![
    ("sinf", Type::Float, 1, math!(Float, f32, f32::sin)),
    ("cosf", Type::Float, 1, math!(Float, f32, f32::cos)),
    ("tanf", Type::Float, 1, math!(Float, f32, f32::tan)),
    ("sqrtf", Type::Float, 1, math!(Float, f32, f32::sqrt)),
    ("fabsf", Type::Float, 1, math!(Float, f32, f32::abs)),
    ("floorf", Type::Float, 1, math!(Float, f32, f32::floor)),
    ("ceilf", Type::Float, 1, math!(Float, f32, f32::ceil)),
    ("expf", Type::Float, 1, math!(Float, f32, f32::exp)),
    ("logf", Type::Float, 1, math!(Float, f32, f32::ln)),
    ("powf", Type::Float, 2, math!(Float, f32, f32::powf, 2)),
    ("fminf", Type::Float, 2, math!(Float, f32, f32::min, 2)),
    ("fmaxf", Type::Float, 2, math!(Float, f32, f32::max, 2)),
    ("sin", Type::Double, 1, math!(Double, f64, f64::sin)),
    ("cos", Type::Double, 1, math!(Double, f64, f64::cos)),
    ("tan", Type::Double, 1, math!(Double, f64, f64::tan)),
    ("sqrt", Type::Double, 1, math!(Double, f64, f64::sqrt)),
    ("fabs", Type::Double, 1, math!(Double, f64, f64::abs)),
    ("floor", Type::Double, 1, math!(Double, f64, f64::floor)),
    ("ceil", Type::Double, 1, math!(Double, f64, f64::ceil)),
    ("exp", Type::Double, 1, math!(Double, f64, f64::exp)),
    ("log", Type::Double, 1, math!(Double, f64, f64::ln)),
    ("pow", Type::Double, 2, math!(Double, f64, f64::powf, 2)),
    ("fmin", Type::Double, 2, math!(Double, f64, f64::min, 2)),
    ("fmax", Type::Double, 2, math!(Double, f64, f64::max, 2)),
  ]
}

fn vector_layout(names: &[&str], aliases: &[&str]) -> TypeLayout {
  let fields = names
    .iter()
    .enumerate()
    .chain(aliases.iter().enumerate())
    .map(|(i, name)| FieldInfo {
      name: (*name).to_owned(),
      ty: Type::Float,
      index: i as u32,
    })
    .collect();

  TypeLayout { fields }
}

impl GlobalModule {
  /// Build the runtime module with the closure algebra and the math library.
  pub fn new() -> Self {
    let mut module = Module::new(GLOBAL_MODULE_NAME);
    let mut functions = HashMap::new();

    let algebra = [
      Function::native(
        CLOSURE_ADD,
        vec![IrType::Closure, IrType::Closure],
        IrType::Closure,
        NativeFunction::new(|args| match args {
          [Value::Closure(a), Value::Closure(b)] => Value::Closure(closure_add(a.clone(), b.clone())),
          _ => Value::Void,
        }),
      ),
      Function::native(
        CLOSURE_MUL,
        vec![IrType::Closure, IrType::F32],
        IrType::Closure,
        NativeFunction::new(|args| match args {
          [Value::Closure(c), Value::Float(w)] => Value::Closure(closure_mul(c.clone(), *w)),
          _ => Value::Void,
        }),
      ),
    ];

    let math = math_library().into_iter().map(|(name, ty, arity, f)| {
      let params = vec![ty.clone(); arity];
      functions.insert(
        name.to_owned(),
        FunctionSignature {
          symbol: name.to_owned(),
          params: params_of(&params),
          ret: ty.clone(),
        },
      );

      Function::native(name, vec![IrType::from_type(&ty); arity], IrType::from_type(&ty), f)
    });

    for f in algebra.into_iter().chain(math.collect::<Vec<_>>()) {
      // fresh module with distinct names
      let _ = module.add_function(f);
    }

    Self {
      state: RwLock::new(GlobalState {
        closures: HashMap::new(),
        next_closure_id: ClosureId::FIRST_USER.0,
        functions,
        module: Arc::new(module),
      }),
    }
  }

  /// Module currently published; the one new compilations link against.
  pub fn runtime_module(&self) -> Arc<Module> {
    self.state.read().module.clone()
  }

  /// Register a closure type and its parameter layout.
  ///
  /// Registering the same name again with the same layout returns the identifier handed out the first time; a
  /// different layout under an existing name is refused.
  pub fn register_closure(&self, name: &str, params: &[ClosureVar]) -> Result<ClosureId> {
    let mut state = self.state.write();

    if let Some(entry) = state.closures.get(name) {
      return if entry.params == params {
        Ok(entry.id)
      } else {
        Err(TslError::Registry(format!(
          "closure {} is already registered with a different layout",
          name
        )))
      };
    }

    let id = ClosureId(state.next_closure_id);
    let symbol = closure_constructor_symbol(name);
    let param_tys = params.iter().map(|p| IrType::from_type(&p.ty.to_type())).collect();

    let mut module = (*state.module).clone();
    module.add_function(Function::native(
      symbol,
      param_tys,
      IrType::Closure,
      NativeFunction::new(move |args| {
        Value::Closure(Some(Arc::new(ClosureTreeNode::Bxdf {
          id,
          params: args.to_vec(),
        })))
      }),
    ))?;

    state.module = Arc::new(module);
    state.next_closure_id += 1;
    state.closures.insert(
      name.to_owned(),
      ClosureEntry {
        id,
        params: params.to_vec(),
      },
    );

    log::debug!("registered closure {} as {}", name, id);
    Ok(id)
  }

  /// Identifier and parameter layout of a registered closure type.
  pub fn closure(&self, name: &str) -> Option<(ClosureId, Vec<ClosureVar>)> {
    let state = self.state.read();
    state
      .closures
      .get(name)
      .map(|entry| (entry.id, entry.params.clone()))
  }

  /// Register a host function callable from shaders under `name`.
  ///
  /// Shaders either declare a matching prototype (`float custom_square(float x);`) or call it directly. Names of the
  /// math library and of earlier callbacks cannot be reused.
  pub fn register_callback(
    &self,
    name: &str,
    params: &[ShaderArgumentType],
    ret: ShaderArgumentType,
    f: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
  ) -> Result<()> {
    let mut state = self.state.write();

    if state.functions.contains_key(name) {
      return Err(TslError::Registry(format!(
        "function {} is already provided by the runtime",
        name
      )));
    }

    let tys: Vec<Type> = params.iter().map(|p| p.to_type()).collect();
    let ret = ret.to_type();

    let mut module = (*state.module).clone();
    module.add_function(Function::native(
      name,
      tys.iter().map(IrType::from_type).collect(),
      IrType::from_type(&ret),
      NativeFunction::new(f),
    ))?;

    state.module = Arc::new(module);
    state.functions.insert(
      name.to_owned(),
      FunctionSignature {
        symbol: name.to_owned(),
        params: params_of(&tys),
        ret,
      },
    );

    log::debug!("registered callback {}", name);
    Ok(())
  }

  /// Member layouts of the built-in vector types.
  pub fn declare_closure_tree_types(&self, ctx: &mut CompileContext) {
    ctx.structure_types.insert(
      Type::Float3.to_string(),
      vector_layout(&["x", "y", "z"], &["r", "g", "b"]),
    );
    ctx.structure_types.insert(
      Type::Float4.to_string(),
      vector_layout(&["x", "y", "z", "w"], &["r", "g", "b", "a"]),
    );
  }

  /// Declare the closure algebra in the module, and make the math library and callbacks callable.
  pub fn declare_global_module(&self, ctx: &mut CompileContext) -> Result<()> {
    ctx.module.add_function(Function::declaration(
      CLOSURE_ADD,
      vec![IrType::Closure, IrType::Closure],
      IrType::Closure,
      Linkage::External,
    ))?;
    ctx.module.add_function(Function::declaration(
      CLOSURE_MUL,
      vec![IrType::Closure, IrType::F32],
      IrType::Closure,
      Linkage::External,
    ))?;

    let state = self.state.read();
    ctx.intrinsics.extend(
      state
        .functions
        .iter()
        .map(|(name, sig)| (name.clone(), sig.clone())),
    );

    Ok(())
  }

  /// Declare the constructor of the closure type `name`.
  ///
  /// Fails with [`TslError::UnresolvedSymbol`] if the closure type is not registered.
  pub fn declare_closure_function(&self, name: &str, ctx: &mut CompileContext) -> Result<ClosureId> {
    let (id, params) = self
      .closure(name)
      .ok_or_else(|| TslError::UnresolvedSymbol(format!("closure {}", name)))?;

    let symbol = closure_constructor_symbol(name);
    let params: Vec<Type> = params.iter().map(|p| p.ty.to_type()).collect();

    ctx.module.add_function(Function::declaration(
      symbol.clone(),
      params.iter().map(IrType::from_type).collect(),
      IrType::Closure,
      Linkage::External,
    ))?;
    ctx
      .closures
      .insert(name.to_owned(), ClosureSignature { symbol, params });

    Ok(id)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn lambert() -> Vec<ClosureVar> {
    vec![
      ClosureVar::new("base_color", ShaderArgumentType::Int),
      ClosureVar::new("normal", ShaderArgumentType::Float),
    ]
  }

  #[test]
  fn closure_ids_are_stable() {
    let g = GlobalModule::new();
    let a = g.register_closure("Lambert", &lambert()).unwrap();
    let b = g.register_closure("Microfacet", &[]).unwrap();

    assert_eq!(a, ClosureId::FIRST_USER);
    assert_ne!(a, b);
    assert_eq!(g.register_closure("Lambert", &lambert()).unwrap(), a);
    assert!(matches!(
      g.register_closure("Lambert", &[]),
      Err(TslError::Registry(_))
    ));
  }

  #[test]
  fn registrations_publish_new_modules() {
    let g = GlobalModule::new();
    let before = g.runtime_module();
    g.register_closure("Lambert", &lambert()).unwrap();
    let after = g.runtime_module();

    assert!(before.function("tsl.closure.make.Lambert").is_none());
    assert!(after.function("tsl.closure.make.Lambert").is_some());
    assert!(after.function("cosf").is_some());
  }

  #[test]
  fn callbacks_cannot_shadow_runtime_functions() {
    let g = GlobalModule::new();

    assert!(g
      .register_callback("cosf", &[ShaderArgumentType::Float], ShaderArgumentType::Float, |_| {
        Value::Float(0.)
      })
      .is_err());

    g.register_callback(
      "custom_square",
      &[ShaderArgumentType::Float],
      ShaderArgumentType::Float,
      |args| match args {
        [Value::Float(x)] => Value::Float(x * x),
        _ => Value::Void,
      },
    )
    .unwrap();

    assert!(g
      .register_callback("custom_square", &[], ShaderArgumentType::Int, |_| Value::Int(0))
      .is_err());
  }

  #[test]
  fn unregistered_closures_are_unresolved() {
    let g = GlobalModule::new();
    let mut module = Module::new("m");
    let mut ctx = CompileContext::new(&mut module);

    assert!(matches!(
      g.declare_closure_function("Lambert", &mut ctx),
      Err(TslError::UnresolvedSymbol(_))
    ));

    g.register_closure("Lambert", &lambert()).unwrap();
    g.declare_closure_function("Lambert", &mut ctx).unwrap();
    assert_eq!(ctx.closures["Lambert"].params, vec![Type::Int, Type::Float]);
  }
}
