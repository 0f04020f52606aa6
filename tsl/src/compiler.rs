//! Shader unit compilation and instance resolution.

use crate::{
  ast::{FunctionDecl, ParsedProgram},
  codegen::CompileContext,
  config::ShadingSystemConfig,
  engine::ExecutionEngine,
  error::{Result, TslError},
  global_module::GlobalModule,
  group::ShaderGroupTemplate,
  ir::{Linkage, Module},
  parser::parse,
  passes,
  template::{CompiledUnit, DependencySet, ShaderInstance},
};
use std::sync::Arc;

/// Compiler turning shader sources into compiled units, and templates into callable instances.
#[derive(Debug)]
pub struct TslCompiler {
  global: Arc<GlobalModule>,
  config: ShadingSystemConfig,
}

impl TslCompiler {
  /// Compiler linking against `global`.
  pub fn new(global: Arc<GlobalModule>, config: ShadingSystemConfig) -> Self {
    Self { global, config }
  }

  pub fn config(&self) -> &ShadingSystemConfig {
    &self.config
  }

  /// Entry symbol of the shader `function` of the unit `unit`.
  pub fn entry_symbol(unit: &str, function: &str) -> String {
    format!("{}::{}", unit, function)
  }

  /// Compile `source` into a module named `name`.
  ///
  /// Structures are generated first, then every auxiliary function, then the `shader` entry, if any. Auxiliary
  /// functions with a body are private to the unit; body-less prototypes are left for the linker to bind to runtime
  /// callbacks.
  pub fn compile(&self, source: &str, name: &str) -> Result<CompiledUnit> {
    let program = parse(source)?;
    let mut module = Module::new(name);
    let mut dependencies = DependencySet::new();
    dependencies.insert(self.global.runtime_module());

    let (entry, params) = {
      let mut ctx = CompileContext::new(&mut module);
      self.global.declare_closure_tree_types(&mut ctx);
      self.global.declare_global_module(&mut ctx)?;

      for closure in &program.closures {
        self.global.declare_closure_function(closure, &mut ctx)?;
      }

      for s in &program.structures {
        s.codegen(&mut ctx)?;
      }

      // prototypes first, so functions can call each other in any order
      for f in &program.functions {
        f.declare(&mut ctx, f.function_name(), linkage(&program, f))?;
      }

      for f in &program.functions {
        f.codegen(&mut ctx, f.function_name(), linkage(&program, f))?;
      }

      match &program.shader {
        Some(shader) => {
          let params = shader.parse_shader_parameters()?;
          let symbol = Self::entry_symbol(name, shader.function_name());
          shader.codegen(&mut ctx, &symbol, Linkage::External)?;
          (Some(symbol), params)
        }

        None => {
          log::warn!("shader unit {} has no shader entry", name);
          (None, Vec::new())
        }
      }
    };

    log::debug!(
      "compiled shader unit {} ({} functions)",
      name,
      module.functions().count()
    );
    self.dump(&module);

    Ok(CompiledUnit {
      module: Arc::new(module),
      entry,
      params,
      ast: program.shader,
      dependencies,
    })
  }

  /// Compose a shader group into its wrapper module.
  pub fn resolve_group(&self, group: &ShaderGroupTemplate) -> Result<CompiledUnit> {
    let unit = group.compose(&self.global)?;

    log::debug!(
      "composed shader group {} ({} dependencies)",
      group.name(),
      unit.dependencies.len()
    );
    self.dump(&unit.module);

    Ok(unit)
  }

  /// Specialize the template of `instance` into its own module and link it.
  ///
  /// The template module is cloned, optimized and verified if the template allows it, then linked with every
  /// dependency of the template.
  pub fn resolve_instance(&self, instance: &ShaderInstance) -> Result<()> {
    let template = instance
      .template()
      .ok_or_else(|| TslError::link("template of the shader instance is gone"))?;

    let entry = template.entry_symbol().ok_or_else(|| {
      TslError::link(format!("template {} has no shader entry", template.name()))
    })?;

    let mut module = template.module().clone();
    let symbols: Vec<String> = module
      .functions()
      .filter(|f| f.blocks().is_some())
      .map(|f| f.name.clone())
      .collect();

    if template.allow_optimization() {
      let structs = module.structs.clone();

      for symbol in &symbols {
        if let Some(f) = module.function_mut(symbol) {
          passes::optimize(f, &structs);
        }
      }
    }

    if template.allow_verification() {
      for symbol in &symbols {
        passes::verify(&module, symbol)?;
      }
    }

    let mut engine =
      ExecutionEngine::new(module.clone()).with_max_call_depth(self.config.max_call_depth);

    for dep in template.dependencies().iter() {
      engine.add_module((**dep).clone());
    }

    let function = engine.get_function_address(entry)?;

    log::debug!("resolved instance of {} at {}", template.name(), entry);
    self.dump(&module);

    instance.set_resolved(module, function);
    Ok(())
  }

  fn dump(&self, module: &Module) {
    if self.config.dump_ir {
      log::debug!("{}", module);
    } else {
      log::trace!("{}", module);
    }
  }
}

/// Linkage of an auxiliary function: private if the source defines it, external if it is only a prototype.
fn linkage(program: &ParsedProgram, f: &FunctionDecl) -> Linkage {
  let defined = program
    .functions
    .iter()
    .any(|g| g.name == f.name && g.body.is_some());

  if defined {
    Linkage::Internal
  } else {
    Linkage::External
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{
    global_module::ClosureVar,
    template::{ShaderUnitTemplate, TemplateKind},
    types::ShaderArgumentType,
    value::Value,
  };

  fn compiler() -> TslCompiler {
    let _ = env_logger::builder().is_test(true).try_init();
    TslCompiler::new(Arc::new(GlobalModule::new()), ShadingSystemConfig::default())
  }

  fn template(compiler: &TslCompiler, name: &str, source: &str) -> Arc<ShaderUnitTemplate> {
    let unit = compiler.compile(source, name).unwrap();
    ShaderUnitTemplate::new(name, TemplateKind::Unit, unit, true, true)
  }

  #[test]
  fn entry_is_mangled() {
    let c = compiler();
    let unit = c
      .compile(
        "float sq(float x) { return x * x; } shader f(float a, out float b) { b = sq(a); }",
        "u",
      )
      .unwrap();

    assert_eq!(unit.entry.as_deref(), Some("u::f"));
    assert_eq!(unit.params.len(), 2);
    assert!(unit.params[1].is_output);
    assert_eq!(unit.module.function("sq").map(|f| f.linkage), Some(Linkage::Internal));
    assert_eq!(unit.module.function("u::f").map(|f| f.linkage), Some(Linkage::External));
    assert!(unit.ast.is_some());
    assert_eq!(unit.dependencies.len(), 1);
  }

  #[test]
  fn prototypes_stay_external() {
    let c = compiler();
    let unit = c
      .compile("float custom(float x); shader f(out float b) { b = custom(2.0); }", "u")
      .unwrap();

    let f = unit.module.function("custom").unwrap();
    assert!(f.is_declaration());
    assert_eq!(f.linkage, Linkage::External);
  }

  #[test]
  fn unregistered_closure() {
    let c = compiler();
    let r = c.compile("shader f(out closure c) { c = make_closure<Nope>(1); }", "u");
    assert!(matches!(r, Err(TslError::UnresolvedSymbol(_))));

    c.global
      .register_closure("Nope", &[ClosureVar::new("x", ShaderArgumentType::Int)])
      .unwrap();
    assert!(c
      .compile("shader f(out closure c) { c = make_closure<Nope>(1); }", "u")
      .is_ok());
  }

  #[test]
  fn resolve_again() {
    let c = compiler();
    let t = template(&c, "u", "shader f(float a, out float b) { b = a + 1.0 * 2.0; }");
    let i = t.make_shader_instance();

    c.resolve_instance(&i).unwrap();
    let optimized = i.function().unwrap();
    assert_ne!(i.module().as_ref(), Some(t.module()));

    t.set_allow_optimization(false);
    c.resolve_instance(&i).unwrap();
    assert_eq!(i.module().as_ref(), Some(t.module()));

    for f in [optimized, i.function().unwrap()] {
      let mut args = [Value::Float(1.), Value::Float(0.)];
      f.call(&mut args).unwrap();
      assert_eq!(args[1], Value::Float(3.));
    }
  }

  #[test]
  fn inert_template() {
    let c = compiler();
    let t = template(&c, "u", "float helper() { return 1.0; }");
    assert_eq!(t.entry_symbol(), None);

    let i = t.make_shader_instance();
    assert!(matches!(c.resolve_instance(&i), Err(TslError::Link(_))));
    assert!(!i.is_resolved());
  }

  #[test]
  fn optimization_keeps_template_untouched() {
    let c = compiler();
    let t = template(&c, "u", "shader f(out float b) { float x = 2.0 * 3.0; b = x + 0.0; }");
    let before = t.module().clone();

    let i = t.make_shader_instance();
    c.resolve_instance(&i).unwrap();

    assert_eq!(t.module(), &before);
    assert_ne!(i.module().unwrap(), before);
  }
}
