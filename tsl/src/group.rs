//! Shader groups.
//!
//! A [`ShaderGroupTemplate`] wires shader unit templates (or other groups) together. Every member is known by a
//! name; the same template can be a member several times under different names. Each parameter of each member is
//! bound in one of three ways, tried in this order:
//!
//! 1. *connection*: an input fed by an output of another member;
//! 2. *exposure*: the parameter is one of the arguments of the group itself;
//! 3. *default*: an input initialized with a literal value.
//!
//! Outputs that are neither connected nor exposed get storage local to the group.
//!
//! Composing a group generates a wrapper function calling the entry of every member the root depends on, in
//! dependency order. The resulting template is used exactly like a unit template, including as a member of another
//! group.

use crate::{
  codegen::CompileContext,
  error::{Result, TslError},
  global_module::GlobalModule,
  ir::{Function, FunctionBuilder, IrType, Linkage, Module, ValueId},
  template::{CompiledUnit, DependencySet, ShaderUnitTemplate},
  types::{ArgDescriptor, ShaderUnitInputDefaultValue},
};
use std::{
  collections::{BTreeMap, BTreeSet, HashMap, HashSet},
  fmt,
  sync::Arc,
};

/// Parameter `port` of the member `member`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MemberPort {
  pub member: String,
  pub port: String,
}

impl MemberPort {
  pub fn new(member: impl Into<String>, port: impl Into<String>) -> Self {
    Self {
      member: member.into(),
      port: port.into(),
    }
  }
}

impl fmt::Display for MemberPort {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}.{}", self.member, self.port)
  }
}

/// Member parameter bound to an argument of the group.
#[derive(Clone, Debug, PartialEq)]
pub struct ExposedArgument {
  pub target: MemberPort,
  pub descriptor: ArgDescriptor,
}

/// Members and wiring of a shader group.
#[derive(Clone, Debug, Default)]
pub struct GroupTopology {
  members: BTreeMap<String, Arc<ShaderUnitTemplate>>,
  root: Option<String>,
  /// Destination input to source output.
  connections: BTreeMap<MemberPort, MemberPort>,
  defaults: BTreeMap<MemberPort, ShaderUnitInputDefaultValue>,
  exposed: Vec<ExposedArgument>,
}

impl GroupTopology {
  /// Member templates by member name.
  pub fn members(&self) -> &BTreeMap<String, Arc<ShaderUnitTemplate>> {
    &self.members
  }

  /// Name of the root member, if one was added.
  pub fn root(&self) -> Option<&str> {
    self.root.as_deref()
  }

  /// Source port of every connected input port.
  pub fn connections(&self) -> &BTreeMap<MemberPort, MemberPort> {
    &self.connections
  }

  /// Default values of input ports.
  pub fn defaults(&self) -> &BTreeMap<MemberPort, ShaderUnitInputDefaultValue> {
    &self.defaults
  }

  /// Arguments of the group, in registration order.
  pub fn exposed(&self) -> &[ExposedArgument] {
    &self.exposed
  }

  fn exposed_index(&self, target: &MemberPort) -> Option<usize> {
    self.exposed.iter().position(|e| e.target == *target)
  }

  fn port(&self, target: &MemberPort) -> Result<&ArgDescriptor> {
    let member = self.members.get(&target.member).ok_or_else(|| {
      TslError::graph(format!("{} refers to undefined member {}", target, target.member))
    })?;

    member
      .parameters()
      .iter()
      .find(|p| p.name == target.port)
      .ok_or_else(|| TslError::graph(format!("member {} has no port {}", target.member, target.port)))
  }

  /// Members to generate, dependencies first, starting from `root`.
  ///
  /// Only members the root transitively depends on through connections are part of the order. A connection cycle
  /// reachable from the root is an error.
  fn generation_order<'a>(&'a self, root: &'a str) -> Result<Vec<&'a str>> {
    let mut sources: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for (dst, src) in &self.connections {
      for end in [dst, src] {
        if !self.members.contains_key(&end.member) {
          return Err(TslError::graph(format!(
            "connection {} -> {} refers to undefined member {}",
            src, dst, end.member
          )));
        }
      }

      sources
        .entry(dst.member.as_str())
        .or_default()
        .insert(src.member.as_str());
    }

    let deps_of = |member: &str| -> Vec<&'a str> {
      sources
        .get(member)
        .map(|s| s.iter().copied().collect())
        .unwrap_or_default()
    };

    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut order = Vec::with_capacity(self.members.len());
    // (member, members it depends on, index of the next one to visit)
    let mut stack = vec![(root, deps_of(root), 0)];
    on_stack.insert(root);

    while let Some((member, deps, next)) = stack.last_mut() {
      match deps.get(*next).copied() {
        Some(dep) => {
          *next += 1;

          if on_stack.contains(dep) {
            return Err(TslError::graph(format!(
              "connection cycle through {} and {}",
              member, dep
            )));
          }

          if visited.contains(dep) {
            continue;
          }

          on_stack.insert(dep);
          stack.push((dep, deps_of(dep), 0));
        }

        None => {
          let member = *member;
          stack.pop();
          on_stack.remove(member);
          visited.insert(member);
          order.push(member);
        }
      }
    }

    Ok(order)
  }

  /// Check every port the wiring refers to.
  fn validate_ports(&self) -> Result<()> {
    for (dst, src) in &self.connections {
      let (d, s) = (self.port(dst)?, self.port(src)?);

      if d.is_output {
        return Err(TslError::graph(format!("{} is an output and cannot be fed by {}", dst, src)));
      }

      if !s.is_output {
        return Err(TslError::graph(format!("{} is an input and cannot feed {}", src, dst)));
      }

      if d.ty != s.ty {
        return Err(TslError::binding(format!(
          "cannot connect {} of type {} to {} of type {}",
          src, s.ty, dst, d.ty
        )));
      }
    }

    for e in &self.exposed {
      let p = self.port(&e.target)?;

      if p.ty != e.descriptor.ty || p.is_output != e.descriptor.is_output {
        return Err(TslError::binding(format!(
          "argument {} does not match {}",
          e.descriptor.name, e.target
        )));
      }
    }

    for (target, value) in &self.defaults {
      let p = self.port(target)?;

      if p.is_output {
        return Err(TslError::binding(format!("output {} cannot have a default value", target)));
      }

      if value.coerce(p.ty).is_none() {
        return Err(TslError::binding(format!(
          "default value {:?} does not fit {} of type {}",
          value, target, p.ty
        )));
      }
    }

    Ok(())
  }
}

/// Shader group under construction.
#[derive(Debug)]
pub struct ShaderGroupTemplate {
  name: String,
  topology: GroupTopology,
  allow_optimization: Option<bool>,
  allow_verification: Option<bool>,
}

impl ShaderGroupTemplate {
  /// Empty group called `name`.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      topology: GroupTopology::default(),
      allow_optimization: None,
      allow_verification: None,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Members and wiring added so far.
  pub fn topology(&self) -> &GroupTopology {
    &self.topology
  }

  /// Add `template` as the member `name`.
  ///
  /// Adding the same template again under the same name does nothing; a different template under an existing name,
  /// or a second root, is refused.
  pub fn add_shader_unit(
    &mut self,
    name: &str,
    template: &Arc<ShaderUnitTemplate>,
    is_root: bool,
  ) -> Result<()> {
    if is_root {
      if let Some(root) = self.topology.root.as_deref().filter(|&root| root != name) {
        return Err(TslError::graph(format!(
          "group {} already has root {}, cannot make {} the root",
          self.name, root, name
        )));
      }
    }

    match self.topology.members.get(name) {
      Some(existing) if !Arc::ptr_eq(existing, template) => {
        return Err(TslError::graph(format!(
          "member {} of group {} is already bound to template {}",
          name,
          self.name,
          existing.name()
        )));
      }

      Some(_) => (),

      None => {
        self
          .topology
          .members
          .insert(name.to_owned(), template.clone());
      }
    }

    if is_root {
      self.topology.root = Some(name.to_owned());
    }

    Ok(())
  }

  /// Feed the input `dst_port` of `dst` with the output `src_port` of `src`.
  pub fn connect_shader_units(
    &mut self,
    src: &str,
    src_port: &str,
    dst: &str,
    dst_port: &str,
  ) -> Result<()> {
    let dst = MemberPort::new(dst, dst_port);
    let src = MemberPort::new(src, src_port);

    if let Some(existing) = self.topology.connections.get(&dst) {
      return Err(TslError::graph(format!(
        "{} is already connected to {}",
        dst, existing
      )));
    }

    self.topology.connections.insert(dst, src);
    Ok(())
  }

  /// Make the parameter `port` of `member` the next argument of the group.
  pub fn expose_shader_argument(&mut self, member: &str, port: &str, arg: ArgDescriptor) -> Result<()> {
    let target = MemberPort::new(member, port);

    if self.topology.exposed_index(&target).is_some() {
      return Err(TslError::graph(format!("{} is already exposed", target)));
    }

    self.topology.exposed.push(ExposedArgument {
      target,
      descriptor: arg,
    });
    Ok(())
  }

  /// Value of the input `port` of `member` when it is neither connected nor exposed.
  pub fn init_shader_input(
    &mut self,
    member: &str,
    port: &str,
    value: impl Into<ShaderUnitInputDefaultValue>,
  ) -> Result<()> {
    let target = MemberPort::new(member, port);
    let value = value.into();

    if let Some(previous) = self.topology.defaults.insert(target.clone(), value) {
      log::debug!("default of {} changed from {:?} to {:?}", target, previous, value);
    }

    Ok(())
  }

  /// Override the system default for the composed template.
  pub fn set_allow_optimization(&mut self, allow: bool) {
    self.allow_optimization = Some(allow);
  }

  /// Override the system default for the composed template.
  pub fn set_allow_verification(&mut self, allow: bool) {
    self.allow_verification = Some(allow);
  }

  pub(crate) fn allow_optimization(&self) -> Option<bool> {
    self.allow_optimization
  }

  pub(crate) fn allow_verification(&self) -> Option<bool> {
    self.allow_verification
  }

  /// Symbol of the wrapper function of the group.
  pub fn wrapper_symbol(&self) -> String {
    format!("{}_shader_wrapper", self.name)
  }

  /// Validate the group and generate its wrapper function.
  pub(crate) fn compose(&self, global: &GlobalModule) -> Result<CompiledUnit> {
    let topology = &self.topology;

    let root = topology
      .root
      .as_deref()
      .ok_or_else(|| TslError::graph(format!("group {} has no root", self.name)))?;

    if !topology.members.contains_key(root) {
      return Err(TslError::graph(format!(
        "root {} of group {} is not a member",
        root, self.name
      )));
    }

    let order = topology.generation_order(root)?;
    topology.validate_ports()?;

    for name in &order {
      if topology.members[*name].entry_symbol().is_none() {
        return Err(TslError::graph(format!(
          "member {} of group {} has no shader entry",
          name, self.name
        )));
      }
    }

    log::debug!("composing group {}: {}", self.name, order.join(" -> "));

    let mut module = Module::new(self.name.clone());
    let mut dependencies = DependencySet::new();
    dependencies.insert(global.runtime_module());

    {
      let mut ctx = CompileContext::new(&mut module);
      global.declare_closure_tree_types(&mut ctx);
      global.declare_global_module(&mut ctx)?;

      for member in topology.members.values() {
        member.parse_dependencies(&mut dependencies);

        let Some(entry) = member.entry_symbol() else {
          continue;
        };

        let f = member.module().function(entry).ok_or_else(|| {
          TslError::link(format!("entry {} missing from template {}", entry, member.name()))
        })?;

        ctx.module.add_function(Function::declaration(
          entry,
          f.params.clone(),
          f.ret.clone(),
          Linkage::External,
        ))?;
      }
    }

    let params = topology
      .exposed
      .iter()
      .map(|e| {
        let ty = IrType::from_type(&e.descriptor.ty.to_type());
        if e.descriptor.is_output {
          ty.ptr()
        } else {
          ty
        }
      })
      .collect();

    let symbol = self.wrapper_symbol();
    let mut builder = FunctionBuilder::new(symbol.clone(), params, IrType::Void, Linkage::External);
    let mut outputs: HashMap<MemberPort, ValueId> = HashMap::new();

    for name in order {
      let member = &topology.members[name];
      let mut args = Vec::with_capacity(member.parameters().len());

      for p in member.parameters() {
        let target = MemberPort::new(name, &p.name);
        let arg = self.bind(&mut builder, &mut outputs, target, p)?;
        args.push(arg);
      }

      // checked above
      let Some(entry) = member.entry_symbol() else {
        continue;
      };
      let ret = module
        .function(entry)
        .map(|f| f.ret.clone())
        .unwrap_or(IrType::Void);

      builder.call(entry, args, ret);
    }

    builder.ret(None);
    module.add_function(builder.finish())?;

    Ok(CompiledUnit {
      module: Arc::new(module),
      entry: Some(symbol),
      params: topology.exposed.iter().map(|e| e.descriptor.clone()).collect(),
      ast: None,
      dependencies,
    })
  }

  /// Argument passed for the parameter `p` of a member: connection, then exposure, then default.
  fn bind(
    &self,
    builder: &mut FunctionBuilder,
    outputs: &mut HashMap<MemberPort, ValueId>,
    target: MemberPort,
    p: &ArgDescriptor,
  ) -> Result<ValueId> {
    let topology = &self.topology;
    let ty = IrType::from_type(&p.ty.to_type());

    if p.is_output {
      let ptr = match topology.exposed_index(&target) {
        Some(i) => builder.param(i),
        None => builder.alloca(ty),
      };

      outputs.insert(target, ptr);
      return Ok(ptr);
    }

    if let Some(src) = topology.connections.get(&target) {
      if topology.defaults.contains_key(&target) {
        log::warn!("default of {} ignored, it is connected to {}", target, src);
      }

      let ptr = outputs.get(src).copied().ok_or_else(|| {
        TslError::graph(format!("{} is read before {} is generated", src, src.member))
      })?;

      return Ok(builder.load(ptr));
    }

    if let Some(i) = topology.exposed_index(&target) {
      if topology.defaults.contains_key(&target) {
        log::warn!("default of {} ignored, it is exposed", target);
      }

      return Ok(builder.param(i));
    }

    let value = topology
      .defaults
      .get(&target)
      .and_then(|d| d.coerce(p.ty))
      .ok_or_else(|| {
        TslError::binding(format!(
          "input {} of group {} is neither connected, exposed nor initialized",
          target, self.name
        ))
      })?;

    Ok(builder.constant(value, ty))
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{
    template::TemplateKind,
    types::ShaderArgumentType,
  };

  fn template(name: &str) -> Arc<ShaderUnitTemplate> {
    ShaderUnitTemplate::new(
      name,
      TemplateKind::Unit,
      CompiledUnit {
        module: Arc::new(Module::new(name)),
        entry: Some(format!("{}::f", name)),
        params: vec![
          ArgDescriptor::input("i", ShaderArgumentType::Float),
          ArgDescriptor::output("o", ShaderArgumentType::Float),
        ],
        ast: None,
        dependencies: DependencySet::new(),
      },
      true,
      true,
    )
  }

  #[test]
  fn member_policies() {
    let a = template("a");
    let b = template("b");
    let mut g = ShaderGroupTemplate::new("g");

    g.add_shader_unit("x", &a, true).unwrap();
    g.add_shader_unit("x", &a, true).unwrap();
    g.add_shader_unit("y", &a, false).unwrap();

    assert!(matches!(g.add_shader_unit("x", &b, false), Err(TslError::Graph(_))));
    assert!(matches!(g.add_shader_unit("z", &b, true), Err(TslError::Graph(_))));
    assert_eq!(g.topology().root(), Some("x"));
    assert_eq!(g.topology().members().len(), 2);
  }

  #[test]
  fn wiring_policies() {
    let mut g = ShaderGroupTemplate::new("g");

    g.connect_shader_units("a", "o", "b", "i").unwrap();
    assert!(matches!(
      g.connect_shader_units("c", "o", "b", "i"),
      Err(TslError::Graph(_))
    ));

    let arg = ArgDescriptor::input("x", ShaderArgumentType::Float);
    g.expose_shader_argument("a", "i", arg.clone()).unwrap();
    assert!(matches!(
      g.expose_shader_argument("a", "i", arg),
      Err(TslError::Graph(_))
    ));

    g.init_shader_input("b", "i", 1.0f32).unwrap();
    g.init_shader_input("b", "i", 2.0f32).unwrap();
    assert_eq!(
      g.topology().defaults()[&MemberPort::new("b", "i")],
      ShaderUnitInputDefaultValue::Float(2.)
    );
  }

  fn topology(members: &[&str], edges: &[(&str, &str)]) -> GroupTopology {
    let mut g = ShaderGroupTemplate::new("g");
    for m in members {
      g.add_shader_unit(m, &template(m), false).unwrap();
    }
    for (src, dst) in edges {
      g.connect_shader_units(src, "o", dst, "i").unwrap();
    }
    g.topology
  }

  #[test]
  fn dependencies_come_first() {
    // d <- b <- a, d <- c <- a, e unreachable
    let t = topology(&["a", "b", "c", "d", "e"], &[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")]);

    assert_eq!(t.generation_order("a").unwrap(), vec!["d", "b", "c", "a"]);
    assert_eq!(t.generation_order("c").unwrap(), vec!["d", "c"]);
  }

  #[test]
  fn cycles_are_detected() {
    let t = topology(&["a", "b", "c"], &[("b", "a"), ("c", "b"), ("b", "c")]);
    assert!(matches!(t.generation_order("a"), Err(TslError::Graph(_))));

    let t = topology(&["a"], &[("a", "a")]);
    assert!(matches!(t.generation_order("a"), Err(TslError::Graph(_))));

    let t = topology(&["a"], &[("ghost", "a")]);
    assert!(matches!(t.generation_order("a"), Err(TslError::Graph(_))));
  }

  #[test]
  fn ports_are_validated() {
    let t = topology(&["a", "b"], &[("a", "b")]);
    assert!(t.validate_ports().is_ok());

    let mut g = ShaderGroupTemplate::new("g");
    g.add_shader_unit("a", &template("a"), true).unwrap();
    g.add_shader_unit("b", &template("b"), false).unwrap();
    g.connect_shader_units("a", "i", "b", "i").unwrap();
    assert!(matches!(g.topology.validate_ports(), Err(TslError::Graph(_))));

    let mut g = ShaderGroupTemplate::new("g");
    g.add_shader_unit("a", &template("a"), true).unwrap();
    g.init_shader_input("a", "i", 1.0f64).unwrap();
    assert!(matches!(g.topology.validate_ports(), Err(TslError::Binding(_))));

    let mut g = ShaderGroupTemplate::new("g");
    g.add_shader_unit("a", &template("a"), true).unwrap();
    g.expose_shader_argument("a", "o", ArgDescriptor::input("o", ShaderArgumentType::Float))
      .unwrap();
    assert!(matches!(g.topology.validate_ports(), Err(TslError::Binding(_))));

    let mut g = ShaderGroupTemplate::new("g");
    g.add_shader_unit("a", &template("a"), true).unwrap();
    g.init_shader_input("a", "nope", 1).unwrap();
    assert!(matches!(g.topology.validate_ports(), Err(TslError::Graph(_))));
  }

  #[test]
  fn missing_root() {
    let global = GlobalModule::new();
    let g = ShaderGroupTemplate::new("g");
    assert!(matches!(g.compose(&global), Err(TslError::Graph(_))));

    let mut g = ShaderGroupTemplate::new("g");
    g.add_shader_unit("a", &template("a"), false).unwrap();
    assert!(matches!(g.compose(&global), Err(TslError::Graph(_))));
  }
}
