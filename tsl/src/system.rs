//! Shading system and shading contexts.
//!
//! A [`ShadingSystem`] owns the registry of every template compiled through it, the global runtime module and the
//! configuration. Hosts compile and resolve through [`ShadingContext`]s, any number of which can work concurrently on
//! the same system.

use crate::{
  compiler::TslCompiler,
  config::ShadingSystemConfig,
  engine::ShaderFunction,
  error::{Result, TslError},
  global_module::{ClosureVar, GlobalModule, GLOBAL_MODULE_NAME},
  group::ShaderGroupTemplate,
  template::{ShaderInstance, ShaderUnitTemplate, TemplateKind},
  types::ShaderArgumentType,
  value::{ClosureId, Value},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug)]
enum Slot {
  /// Name taken by a compilation in flight.
  Reserved,
  Ready(Arc<ShaderUnitTemplate>),
}

/// Templates by name.
#[derive(Debug, Default)]
struct Registry {
  units: Mutex<HashMap<String, Slot>>,
}

impl Registry {
  fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == GLOBAL_MODULE_NAME {
      return Err(TslError::Registry(format!("{:?} is not a valid template name", name)));
    }

    Ok(())
  }

  fn ensure_available(&self, name: &str) -> Result<()> {
    Self::check_name(name)?;

    if self.units.lock().contains_key(name) {
      return Err(TslError::Registry(format!("template {} already exists", name)));
    }

    Ok(())
  }

  /// Take `name` until the returned reservation is published or dropped.
  fn reserve(&self, name: &str) -> Result<Reservation<'_>> {
    Self::check_name(name)?;

    let mut units = self.units.lock();

    if units.contains_key(name) {
      return Err(TslError::Registry(format!("template {} already exists", name)));
    }

    units.insert(name.to_owned(), Slot::Reserved);

    Ok(Reservation {
      registry: self,
      name: name.to_owned(),
      published: false,
    })
  }

  fn get(&self, name: &str) -> Option<Arc<ShaderUnitTemplate>> {
    match self.units.lock().get(name) {
      Some(Slot::Ready(template)) => Some(template.clone()),
      _ => None,
    }
  }
}

/// Name taken in the registry; released on drop unless published.
struct Reservation<'a> {
  registry: &'a Registry,
  name: String,
  published: bool,
}

impl<'a> Reservation<'a> {
  fn publish(mut self, template: Arc<ShaderUnitTemplate>) {
    self
      .registry
      .units
      .lock()
      .insert(self.name.clone(), Slot::Ready(template));
    self.published = true;
  }
}

impl<'a> Drop for Reservation<'a> {
  fn drop(&mut self) {
    if !self.published {
      self.registry.units.lock().remove(&self.name);
      log::debug!("released template name {}", self.name);
    }
  }
}

#[derive(Debug)]
struct SystemState {
  global: Arc<GlobalModule>,
  config: ShadingSystemConfig,
  registry: Registry,
}

/// Entry point of the shading system.
#[derive(Debug)]
pub struct ShadingSystem {
  state: Arc<SystemState>,
}

impl Default for ShadingSystem {
  fn default() -> Self {
    Self::new()
  }
}

impl ShadingSystem {
  /// System with the default configuration.
  pub fn new() -> Self {
    Self::with_config(ShadingSystemConfig::default())
  }

  /// System using `config` for every template it compiles.
  pub fn with_config(config: ShadingSystemConfig) -> Self {
    log::debug!("new shading system: {:?}", config);

    Self {
      state: Arc::new(SystemState {
        global: Arc::new(GlobalModule::new()),
        config,
        registry: Registry::default(),
      }),
    }
  }

  pub fn config(&self) -> &ShadingSystemConfig {
    &self.state.config
  }

  /// Runtime shared by every module compiled through this system.
  pub fn global_module(&self) -> &GlobalModule {
    &self.state.global
  }

  /// New context compiling and resolving through this system.
  pub fn make_shading_context(&self) -> ShadingContext {
    ShadingContext {
      state: self.state.clone(),
      compiler: TslCompiler::new(self.state.global.clone(), self.state.config.clone()),
    }
  }

  /// Register a closure type shaders can build with `make_closure<name>(…)`.
  pub fn register_closure(&self, name: &str, params: &[ClosureVar]) -> Result<ClosureId> {
    self.state.global.register_closure(name, params)
  }

  /// Register a host function shaders can call.
  ///
  /// Templates compiled before the registration cannot see the callback.
  pub fn register_callback(
    &self,
    name: &str,
    params: &[ShaderArgumentType],
    ret: ShaderArgumentType,
    f: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
  ) -> Result<()> {
    self.state.global.register_callback(name, params, ret, f)
  }

  /// Template registered under `name`.
  pub fn shader_template(&self, name: &str) -> Option<Arc<ShaderUnitTemplate>> {
    self.state.registry.get(name)
  }
}

/// Compilation and resolution front-end of a [`ShadingSystem`].
#[derive(Debug)]
pub struct ShadingContext {
  state: Arc<SystemState>,
  compiler: TslCompiler,
}

impl ShadingContext {
  /// Compile `source` into the template `name`.
  pub fn compile_shader_unit_template(
    &self,
    name: &str,
    source: &str,
  ) -> Result<Arc<ShaderUnitTemplate>> {
    let reservation = self.state.registry.reserve(name)?;
    let unit = self.compiler.compile(source, name)?;
    let config = &self.state.config;
    let template = ShaderUnitTemplate::new(
      name,
      TemplateKind::Unit,
      unit,
      config.allow_optimization,
      config.allow_verification,
    );

    reservation.publish(template.clone());
    Ok(template)
  }

  /// Start building the group `name`.
  pub fn begin_shader_group_template(&self, name: &str) -> Result<ShaderGroupTemplate> {
    self.state.registry.ensure_available(name)?;
    Ok(ShaderGroupTemplate::new(name))
  }

  /// Compose `group` and register it as a template.
  pub fn end_shader_group_template(
    &self,
    group: ShaderGroupTemplate,
  ) -> Result<Arc<ShaderUnitTemplate>> {
    let reservation = self.state.registry.reserve(group.name())?;
    let unit = self.compiler.resolve_group(&group)?;
    let config = &self.state.config;
    let template = ShaderUnitTemplate::new(
      group.name(),
      TemplateKind::Group(group.topology().clone()),
      unit,
      group
        .allow_optimization()
        .unwrap_or(config.allow_optimization),
      group
        .allow_verification()
        .unwrap_or(config.allow_verification),
    );

    reservation.publish(template.clone());
    Ok(template)
  }

  /// Resolve `instance` and return its callable function.
  pub fn resolve_shader_instance(&self, instance: &ShaderInstance) -> Result<ShaderFunction> {
    self.compiler.resolve_instance(instance)?;

    instance
      .function()
      .ok_or_else(|| TslError::link("shader instance has no function after resolution"))
  }

  /// Compile `source` into the template `name`, and resolve a first instance of it.
  pub fn compile_shader_unit(&self, name: &str, source: &str) -> Result<ShaderFunction> {
    let template = self.compile_shader_unit_template(name, source)?;
    let instance = template.make_shader_instance();
    self.resolve_shader_instance(&instance)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn failed_names_are_released() {
    let system = ShadingSystem::new();
    let ctx = system.make_shading_context();

    assert!(matches!(
      ctx.compile_shader_unit_template("u", "shader f( {"),
      Err(TslError::Syntax { .. })
    ));
    assert!(system.shader_template("u").is_none());

    let t = ctx
      .compile_shader_unit_template("u", "shader f(out float b) { b = 1.0; }")
      .unwrap();
    assert!(Arc::ptr_eq(&system.shader_template("u").unwrap(), &t));

    assert!(matches!(
      ctx.compile_shader_unit_template("u", "shader f(out float b) { b = 2.0; }"),
      Err(TslError::Registry(_))
    ));
    assert!(matches!(ctx.begin_shader_group_template("u"), Err(TslError::Registry(_))));
  }

  #[test]
  fn reserved_names() {
    let system = ShadingSystem::new();
    let ctx = system.make_shading_context();

    assert!(matches!(
      ctx.compile_shader_unit_template(GLOBAL_MODULE_NAME, ""),
      Err(TslError::Registry(_))
    ));
    assert!(matches!(
      ctx.compile_shader_unit_template("", ""),
      Err(TslError::Registry(_))
    ));
  }

  #[test]
  fn reservation_blocks_the_name() {
    let registry = Registry::default();
    let r = registry.reserve("a").unwrap();

    assert!(matches!(registry.reserve("a"), Err(TslError::Registry(_))));
    assert!(registry.get("a").is_none());

    drop(r);
    assert!(registry.reserve("a").is_ok());
  }

  #[test]
  fn contexts_are_shareable() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<ShadingSystem>();
    assert_send_sync::<ShadingContext>();
  }
}
