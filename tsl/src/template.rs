//! Shader unit templates and their instances.
//!
//! A [`ShaderUnitTemplate`] is the immutable result of compiling a shader unit or composing a shader group. It never
//! runs by itself: hosts create [`ShaderInstance`]s from it and resolve them, which clones the template module and
//! links the clone into a callable [`ShaderFunction`]. A template backs any number of instances, and instances never
//! share compiled code with each other or with their template.

use crate::{
  ast::FunctionDecl,
  engine::ShaderFunction,
  group::GroupTopology,
  ir::Module,
  types::ArgDescriptor,
};
use parking_lot::{Mutex, RwLock};
use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc, Weak,
};

/// Modules needed at link time, keyed by module name.
///
/// The first module inserted under a name wins; later insertions under the same name are ignored.
#[derive(Clone, Debug, Default)]
pub struct DependencySet {
  modules: Vec<Arc<Module>>,
}

impl DependencySet {
  /// Empty set.
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a module; returns `false` if a module with the same name is already there.
  pub fn insert(&mut self, module: Arc<Module>) -> bool {
    if self.contains(module.name()) {
      return false;
    }

    self.modules.push(module);
    true
  }

  /// Whether a module called `name` is in the set.
  pub fn contains(&self, name: &str) -> bool {
    self.modules.iter().any(|m| m.name() == name)
  }

  /// Modules in insertion order.
  pub fn iter(&self) -> impl Iterator<Item = &Arc<Module>> {
    self.modules.iter()
  }

  pub fn len(&self) -> usize {
    self.modules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.modules.is_empty()
  }
}

/// Everything compiling a unit, or composing a group, produces.
#[derive(Clone, Debug)]
pub struct CompiledUnit {
  pub module: Arc<Module>,
  /// Symbol of the entry function; `None` for a source without a `shader` entry.
  pub entry: Option<String>,
  /// Parameters of the entry function, or the exposed arguments of a group.
  pub params: Vec<ArgDescriptor>,
  /// Root of the AST the unit was compiled from; groups have none.
  pub ast: Option<FunctionDecl>,
  pub dependencies: DependencySet,
}

#[derive(Debug)]
pub enum TemplateKind {
  Unit,
  Group(GroupTopology),
}

/// Compiled, reusable shader unit or shader group.
#[derive(Debug)]
pub struct ShaderUnitTemplate {
  name: String,
  kind: TemplateKind,
  compiled: CompiledUnit,
  allow_optimization: AtomicBool,
  allow_verification: AtomicBool,
  instances: Mutex<Vec<Arc<ShaderInstance>>>,
}

impl ShaderUnitTemplate {
  pub(crate) fn new(
    name: impl Into<String>,
    kind: TemplateKind,
    compiled: CompiledUnit,
    allow_optimization: bool,
    allow_verification: bool,
  ) -> Arc<Self> {
    Arc::new(Self {
      name: name.into(),
      kind,
      compiled,
      allow_optimization: AtomicBool::new(allow_optimization),
      allow_verification: AtomicBool::new(allow_verification),
      instances: Mutex::new(Vec::new()),
    })
  }

  /// Name the template is registered under.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Whether the template was compiled from source or composed from a group.
  pub fn kind(&self) -> &TemplateKind {
    &self.kind
  }

  pub fn is_group(&self) -> bool {
    matches!(self.kind, TemplateKind::Group(_))
  }

  /// Compiled module; never modified, only cloned by instances.
  pub fn module(&self) -> &Module {
    &self.compiled.module
  }

  /// Symbol of the entry function, if the template has one.
  pub fn entry_symbol(&self) -> Option<&str> {
    self.compiled.entry.as_deref()
  }

  /// Arguments of the entry function, in call order.
  pub fn parameters(&self) -> &[ArgDescriptor] {
    &self.compiled.params
  }

  /// Parsed shader entry of a unit; groups have none.
  pub fn ast(&self) -> Option<&FunctionDecl> {
    self.compiled.ast.as_ref()
  }

  /// Modules instances of this template are linked against.
  pub fn dependencies(&self) -> &DependencySet {
    &self.compiled.dependencies
  }

  /// Whether instances are optimized when resolved.
  pub fn allow_optimization(&self) -> bool {
    self.allow_optimization.load(Ordering::Relaxed)
  }

  /// Whether instances resolved from now on get optimized.
  pub fn set_allow_optimization(&self, allow: bool) {
    self.allow_optimization.store(allow, Ordering::Relaxed);
  }

  /// Whether instances are verified when resolved.
  pub fn allow_verification(&self) -> bool {
    self.allow_verification.load(Ordering::Relaxed)
  }

  /// Whether instances resolved from now on get verified.
  pub fn set_allow_verification(&self, allow: bool) {
    self.allow_verification.store(allow, Ordering::Relaxed);
  }

  /// Create a new, unresolved instance owned by this template.
  pub fn make_shader_instance(self: &Arc<Self>) -> Arc<ShaderInstance> {
    let instance = Arc::new(ShaderInstance {
      template: Arc::downgrade(self),
      resolved: RwLock::new(None),
    });

    self.instances.lock().push(instance.clone());
    instance
  }

  /// Number of instances created from this template so far.
  pub fn instance_count(&self) -> usize {
    self.instances.lock().len()
  }

  /// Add the modules this template needs at link time, its own included, to `deps`.
  pub fn parse_dependencies(&self, deps: &mut DependencySet) {
    deps.insert(self.compiled.module.clone());

    for module in self.compiled.dependencies.iter() {
      deps.insert(module.clone());
    }

    if let TemplateKind::Group(topology) = &self.kind {
      for member in topology.members().values() {
        member.parse_dependencies(deps);
      }
    }
  }
}

/// Instance after a successful resolution.
#[derive(Debug)]
struct ResolvedInstance {
  module: Module,
  function: ShaderFunction,
}

/// Independently executable specialization of a template.
///
/// Resolving an instance fills in its own module and its callable function. Resolving it again replaces both, which
/// picks up changes made to the optimization and verification flags of the template in between; a failed resolution
/// leaves the previous state untouched.
#[derive(Debug)]
pub struct ShaderInstance {
  template: Weak<ShaderUnitTemplate>,
  resolved: RwLock<Option<ResolvedInstance>>,
}

impl ShaderInstance {
  /// Template of the instance, unless it has been dropped.
  pub fn template(&self) -> Option<Arc<ShaderUnitTemplate>> {
    self.template.upgrade()
  }

  /// Whether a resolution succeeded at least once.
  pub fn is_resolved(&self) -> bool {
    self.resolved.read().is_some()
  }

  /// Callable function, once the instance is resolved.
  pub fn function(&self) -> Option<ShaderFunction> {
    self.resolved.read().as_ref().map(|r| r.function.clone())
  }

  /// Copy of the module of the instance, as optimized during resolution.
  pub fn module(&self) -> Option<Module> {
    self.resolved.read().as_ref().map(|r| r.module.clone())
  }

  pub(crate) fn set_resolved(&self, module: Module, function: ShaderFunction) {
    let previous = self
      .resolved
      .write()
      .replace(ResolvedInstance { module, function });

    if previous.is_some() {
      log::debug!("shader instance re-resolved");
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn unit(name: &str, deps: &[&str]) -> Arc<ShaderUnitTemplate> {
    let mut dependencies = DependencySet::new();
    for dep in deps {
      dependencies.insert(Arc::new(Module::new(*dep)));
    }

    ShaderUnitTemplate::new(
      name,
      TemplateKind::Unit,
      CompiledUnit {
        module: Arc::new(Module::new(name)),
        entry: None,
        params: Vec::new(),
        ast: None,
        dependencies,
      },
      true,
      false,
    )
  }

  #[test]
  fn first_module_under_a_name_wins() {
    let first = Arc::new(Module::new("m"));
    let mut deps = DependencySet::new();

    assert!(deps.insert(first.clone()));
    assert!(!deps.insert(Arc::new(Module::new("m"))));
    assert_eq!(deps.len(), 1);
    assert!(Arc::ptr_eq(deps.iter().next().unwrap(), &first));
  }

  #[test]
  fn dependencies_include_own_module() {
    let t = unit("a", &["global"]);
    let mut deps = DependencySet::new();
    t.parse_dependencies(&mut deps);

    let names: Vec<_> = deps.iter().map(|m| m.name().to_owned()).collect();
    assert_eq!(names, vec!["a", "global"]);
  }

  #[test]
  fn instances_are_plain_allocations() {
    let t = unit("a", &[]);
    let i = t.make_shader_instance();
    let j = t.make_shader_instance();

    assert_eq!(t.instance_count(), 2);
    assert!(!i.is_resolved());
    assert!(i.function().is_none());
    assert!(Arc::ptr_eq(&i.template().unwrap(), &t));
    assert!(!Arc::ptr_eq(&i, &j));
  }

  #[test]
  fn template_flags() {
    let t = unit("a", &[]);
    assert!(t.allow_optimization());
    assert!(!t.allow_verification());

    t.set_allow_verification(true);
    assert!(t.allow_verification());
  }
}
