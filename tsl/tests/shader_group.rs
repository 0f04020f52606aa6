use std::sync::Arc;
use tsl::{
  ArgDescriptor, ClosureId, ClosureTreeNode, ClosureVar, Float3, ShaderArgumentType, ShaderUnitTemplate,
  ShadingContext, ShadingSystem, TslError, Value,
};

fn init() -> ShadingSystem {
  let _ = env_logger::builder().is_test(true).try_init();
  ShadingSystem::new()
}

fn register_lambert(system: &ShadingSystem) -> ClosureId {
  system
    .register_closure(
      "Lambert",
      &[
        ClosureVar::new("base_color", ShaderArgumentType::Int),
        ClosureVar::new("normal", ShaderArgumentType::Float),
      ],
    )
    .unwrap()
}

fn unit(ctx: &ShadingContext, name: &str, source: &str) -> Arc<ShaderUnitTemplate> {
  ctx.compile_shader_unit_template(name, source).unwrap()
}

fn run(ctx: &ShadingContext, template: &Arc<ShaderUnitTemplate>, args: &mut [Value]) {
  let instance = template.make_shader_instance();
  let f = ctx.resolve_shader_instance(&instance).unwrap();
  f.call(args).unwrap();
}

fn lambert_params(node: &ClosureTreeNode, id: ClosureId) -> &[Value] {
  match node {
    ClosureTreeNode::Bxdf { id: got, params } if *got == id => params,
    node => panic!("expected a Lambert node, got {:?}", node),
  }
}

#[test]
fn basic_shader_group() {
  let system = init();
  let ctx = system.make_shading_context();
  let lambert = register_lambert(&system);

  let root = unit(
    &ctx,
    "root_shader",
    "shader output_node(in closure in_bxdf, out closure out_bxdf) { out_bxdf = in_bxdf * 0.5f; }",
  );
  let bxdf = unit(
    &ctx,
    "bxdf_shader",
    "shader lambert_node(out closure out_bxdf) { out_bxdf = make_closure<Lambert>(111, 4.0f); }",
  );

  let mut group = ctx.begin_shader_group_template("first shader").unwrap();
  group.add_shader_unit("root_shader", &root, true).unwrap();
  group.add_shader_unit("bxdf_shader_test", &bxdf, false).unwrap();
  group
    .connect_shader_units("bxdf_shader_test", "out_bxdf", "root_shader", "in_bxdf")
    .unwrap();
  group
    .expose_shader_argument(
      "root_shader",
      "out_bxdf",
      ArgDescriptor::output("out_bxdf", ShaderArgumentType::Closure),
    )
    .unwrap();
  let group = ctx.end_shader_group_template(group).unwrap();

  let mut args = [Value::Closure(None)];
  run(&ctx, &group, &mut args);

  let Value::Closure(Some(node)) = &args[0] else {
    panic!("null closure");
  };
  let ClosureTreeNode::Mul { weight, closure } = &**node else {
    panic!("expected a weighted closure, got {:?}", node);
  };

  assert_eq!(node.id(), ClosureId::MUL);
  assert_eq!(*weight, 0.5);
  assert_eq!(
    lambert_params(closure, lambert),
    &[Value::Int(111), Value::Float(4.)]
  );
}

#[test]
fn duplicate_shader_units() {
  let system = init();
  let ctx = system.make_shading_context();
  let lambert = register_lambert(&system);

  let root = unit(
    &ctx,
    "root_shader",
    "shader output_node(closure in_bxdf0, closure in_bxdf1, out closure out_bxdf) {
       out_bxdf = (in_bxdf0 + in_bxdf1) * 0.5f;
     }",
  );
  let bxdf = unit(
    &ctx,
    "bxdf_shader",
    "shader lambert_node(float test, out closure out_bxdf) { out_bxdf = make_closure<Lambert>(111, test); }",
  );

  let mut group = ctx.begin_shader_group_template("first shader").unwrap();
  group.add_shader_unit("root_shader", &root, true).unwrap();
  group.add_shader_unit("bxdf_shader0", &bxdf, false).unwrap();
  group.add_shader_unit("bxdf_shader1", &bxdf, false).unwrap();
  group
    .connect_shader_units("bxdf_shader0", "out_bxdf", "root_shader", "in_bxdf0")
    .unwrap();
  group
    .connect_shader_units("bxdf_shader1", "out_bxdf", "root_shader", "in_bxdf1")
    .unwrap();
  group.init_shader_input("bxdf_shader0", "test", 2.0f32).unwrap();
  group.init_shader_input("bxdf_shader1", "test", 12.0f32).unwrap();
  group
    .expose_shader_argument(
      "root_shader",
      "out_bxdf",
      ArgDescriptor::output("out_bxdf", ShaderArgumentType::Closure),
    )
    .unwrap();
  let group = ctx.end_shader_group_template(group).unwrap();

  // the member template is linked once however many times it is used
  assert_eq!(
    group
      .dependencies()
      .iter()
      .filter(|m| m.name() == "bxdf_shader")
      .count(),
    1
  );

  let mut args = [Value::Closure(None)];
  run(&ctx, &group, &mut args);

  let Value::Closure(Some(node)) = &args[0] else {
    panic!("null closure");
  };
  let ClosureTreeNode::Mul { weight, closure } = &**node else {
    panic!("expected a weighted closure, got {:?}", node);
  };
  let ClosureTreeNode::Add(a, b) = &**closure else {
    panic!("expected a closure sum, got {:?}", closure);
  };

  assert_eq!(*weight, 0.5);
  assert_eq!(lambert_params(a, lambert), &[Value::Int(111), Value::Float(2.)]);
  assert_eq!(lambert_params(b, lambert), &[Value::Int(111), Value::Float(12.)]);
}

fn passthrough_group(ctx: &ShadingContext, name: &str) -> Arc<ShaderUnitTemplate> {
  let root = unit(
    ctx,
    &format!("{}_root", name),
    "shader output_node(float in_bxdf, out float out_bxdf) { out_bxdf = in_bxdf * 1231.0f; }",
  );
  let bxdf = unit(
    ctx,
    &format!("{}_bxdf", name),
    "shader lambert_node(float in_bxdf, out float out_bxdf, out float dummy) { out_bxdf = in_bxdf; }",
  );

  let mut group = ctx.begin_shader_group_template(name).unwrap();
  group.add_shader_unit("root_shader", &root, true).unwrap();
  group.add_shader_unit("bxdf_shader", &bxdf, false).unwrap();
  group
    .connect_shader_units("bxdf_shader", "out_bxdf", "root_shader", "in_bxdf")
    .unwrap();
  group
    .expose_shader_argument(
      "root_shader",
      "out_bxdf",
      ArgDescriptor::output("out_bxdf", ShaderArgumentType::Float),
    )
    .unwrap();
  group
    .expose_shader_argument(
      "bxdf_shader",
      "in_bxdf",
      ArgDescriptor::input("in_bxdf", ShaderArgumentType::Float),
    )
    .unwrap();

  ctx.end_shader_group_template(group).unwrap()
}

#[test]
fn shader_group_without_closure() {
  let system = init();
  let ctx = system.make_shading_context();
  let group = passthrough_group(&ctx, "first shader");

  assert_eq!(
    group.parameters(),
    &[
      ArgDescriptor::output("out_bxdf", ShaderArgumentType::Float),
      ArgDescriptor::input("in_bxdf", ShaderArgumentType::Float),
    ]
  );

  let mut args = [Value::Float(0.), Value::Float(0.5)];
  run(&ctx, &group, &mut args);
  assert_eq!(args[0], Value::Float(1231. * 0.5));
}

#[test]
fn shader_group_arg_types() {
  let system = init();
  let ctx = system.make_shading_context();
  let lambert = register_lambert(&system);

  let root = unit(
    &ctx,
    "root_shader",
    "shader output_node(out int i, out float f, out double d, out bool b, out closure c, out vector vec) {
       i = 123;
       f = 123.0f;
       d = 123.0d;
       b = true;
       c = make_closure<Lambert>(111, 4.0f);
       vec.x = 1.0f; vec.y = 2.0f; vec.b = 3.0f;
     }",
  );

  let mut group = ctx.begin_shader_group_template("first shader").unwrap();
  group.add_shader_unit("root_shader", &root, true).unwrap();

  for (port, name, ty) in [
    ("i", "i", ShaderArgumentType::Int),
    ("f", "f", ShaderArgumentType::Float),
    ("d", "d", ShaderArgumentType::Double),
    ("b", "b", ShaderArgumentType::Bool),
    ("vec", "f3", ShaderArgumentType::Float3),
    ("c", "c", ShaderArgumentType::Closure),
  ] {
    group
      .expose_shader_argument("root_shader", port, ArgDescriptor::output(name, ty))
      .unwrap();
  }

  let group = ctx.end_shader_group_template(group).unwrap();

  let mut args = [
    Value::Int(0),
    Value::Float(0.),
    Value::Double(0.),
    Value::Bool(false),
    Value::Float3(Float3::default()),
    Value::Closure(None),
  ];
  run(&ctx, &group, &mut args);

  assert_eq!(args[0], Value::Int(123));
  assert_eq!(args[1], Value::Float(123.));
  assert_eq!(args[2], Value::Double(123.));
  assert_eq!(args[3], Value::Bool(true));
  assert_eq!(args[4], Value::Float3(Float3::new(1., 2., 3.)));

  let Value::Closure(Some(node)) = &args[5] else {
    panic!("null closure");
  };
  assert_eq!(lambert_params(node, lambert), &[Value::Int(111), Value::Float(4.)]);
}

#[test]
fn shader_group_input_defaults() {
  let system = init();
  let ctx = system.make_shading_context();

  let root = unit(
    &ctx,
    "root_shader",
    "shader output_node(int ii, float iff, double id, bool ib, vector if3,
                        out int i, out float f, out double d, out bool b, out vector f3) {
       i = ii;
       f = iff;
       d = id;
       b = ib;
       f3 = if3;
     }",
  );

  let mut group = ctx.begin_shader_group_template("first shader").unwrap();
  group.add_shader_unit("root_shader", &root, true).unwrap();

  for (port, ty) in [
    ("i", ShaderArgumentType::Int),
    ("f", ShaderArgumentType::Float),
    ("d", ShaderArgumentType::Double),
    ("b", ShaderArgumentType::Bool),
    ("f3", ShaderArgumentType::Float3),
  ] {
    group
      .expose_shader_argument("root_shader", port, ArgDescriptor::output(port, ty))
      .unwrap();
  }

  group.init_shader_input("root_shader", "ii", 12).unwrap();
  group.init_shader_input("root_shader", "iff", 13.0f32).unwrap();
  group.init_shader_input("root_shader", "id", 14.0f64).unwrap();
  group.init_shader_input("root_shader", "ib", true).unwrap();
  group
    .init_shader_input("root_shader", "if3", Float3::new(1., 2., 3.))
    .unwrap();

  let group = ctx.end_shader_group_template(group).unwrap();

  let mut args = [
    Value::Int(0),
    Value::Float(0.),
    Value::Double(0.),
    Value::Bool(false),
    Value::Float3(Float3::default()),
  ];
  run(&ctx, &group, &mut args);

  assert_eq!(
    args,
    [
      Value::Int(12),
      Value::Float(13.),
      Value::Double(14.),
      Value::Bool(true),
      Value::Float3(Float3::new(1., 2., 3.)),
    ]
  );
}

#[test]
fn defaults_widen_to_the_port_type() {
  let system = init();
  let ctx = system.make_shading_context();

  let root = unit(
    &ctx,
    "root_shader",
    "shader output_node(float x, double y, out double r) { r = x + y; }",
  );

  let mut group = ctx.begin_shader_group_template("g").unwrap();
  group.add_shader_unit("root", &root, true).unwrap();
  group.init_shader_input("root", "x", 2).unwrap();
  group.init_shader_input("root", "y", 0.5f32).unwrap();
  group
    .expose_shader_argument("root", "r", ArgDescriptor::output("r", ShaderArgumentType::Double))
    .unwrap();
  let group = ctx.end_shader_group_template(group).unwrap();

  let mut args = [Value::Double(0.)];
  run(&ctx, &group, &mut args);
  assert_eq!(args[0], Value::Double(2.5));
}

#[test]
fn shader_group_recursive() {
  let system = init();
  let ctx = system.make_shading_context();
  let inner = passthrough_group(&ctx, "inner_shader");

  let constant = unit(
    &ctx,
    "constant_shader",
    "shader constant_node(out float out_bxdf) { out_bxdf = 3.0f; }",
  );
  let resolve = unit(
    &ctx,
    "final_shader",
    "shader resolve_node(float bxdf0, float bxdf1, out float out_bxdf) { out_bxdf = bxdf0 + bxdf1; }",
  );

  let mut group = ctx.begin_shader_group_template("outter shader group").unwrap();
  group.add_shader_unit("final_shader", &resolve, true).unwrap();
  group.add_shader_unit("inner_shader", &inner, false).unwrap();
  group.add_shader_unit("constant_shader", &constant, false).unwrap();
  group
    .connect_shader_units("inner_shader", "out_bxdf", "final_shader", "bxdf0")
    .unwrap();
  group
    .connect_shader_units("constant_shader", "out_bxdf", "final_shader", "bxdf1")
    .unwrap();
  group
    .expose_shader_argument(
      "final_shader",
      "out_bxdf",
      ArgDescriptor::output("out_bxdf", ShaderArgumentType::Float),
    )
    .unwrap();
  group.init_shader_input("inner_shader", "in_bxdf", 0.2f32).unwrap();
  let group = ctx.end_shader_group_template(group).unwrap();

  let mut args = [Value::Float(0.)];
  run(&ctx, &group, &mut args);
  assert_eq!(args[0], Value::Float(1231.0f32 * 0.2f32 + 3.0f32));

  // the inner group is still usable on its own
  let mut args = [Value::Float(0.), Value::Float(1.)];
  run(&ctx, &inner, &mut args);
  assert_eq!(args[0], Value::Float(1231.));
}

#[test]
fn connection_beats_exposure_and_default() {
  let system = init();
  let ctx = system.make_shading_context();

  let source = unit(&ctx, "source", "shader s(out float o) { o = 7.0; }");
  let sink = unit(&ctx, "sink", "shader k(float i, out float o) { o = i; }");

  let mut group = ctx.begin_shader_group_template("g").unwrap();
  group.add_shader_unit("sink", &sink, true).unwrap();
  group.add_shader_unit("source", &source, false).unwrap();
  group.connect_shader_units("source", "o", "sink", "i").unwrap();
  group
    .expose_shader_argument("sink", "i", ArgDescriptor::input("i", ShaderArgumentType::Float))
    .unwrap();
  group.init_shader_input("sink", "i", 1.0f32).unwrap();
  group
    .expose_shader_argument("sink", "o", ArgDescriptor::output("o", ShaderArgumentType::Float))
    .unwrap();
  let group = ctx.end_shader_group_template(group).unwrap();

  let mut args = [Value::Float(100.), Value::Float(0.)];
  run(&ctx, &group, &mut args);
  assert_eq!(args[1], Value::Float(7.));
}

#[test]
fn exposure_beats_default() {
  let system = init();
  let ctx = system.make_shading_context();
  let sink = unit(&ctx, "sink", "shader k(float i, out float o) { o = i; }");

  let mut group = ctx.begin_shader_group_template("g").unwrap();
  group.add_shader_unit("sink", &sink, true).unwrap();
  group.init_shader_input("sink", "i", 1.0f32).unwrap();
  group
    .expose_shader_argument("sink", "o", ArgDescriptor::output("o", ShaderArgumentType::Float))
    .unwrap();
  group
    .expose_shader_argument("sink", "i", ArgDescriptor::input("i", ShaderArgumentType::Float))
    .unwrap();
  let group = ctx.end_shader_group_template(group).unwrap();

  let mut args = [Value::Float(0.), Value::Float(5.)];
  run(&ctx, &group, &mut args);
  assert_eq!(args[0], Value::Float(5.));
}

#[test]
fn unconnected_members_are_skipped() {
  let system = init();
  let ctx = system.make_shading_context();

  let root = unit(&ctx, "root", "shader r(out float o) { o = 1.0; }");
  // would fail to bind its input if it were generated
  let loose = unit(&ctx, "loose", "shader l(float i, out float o) { o = i; }");

  let mut group = ctx.begin_shader_group_template("g").unwrap();
  group.add_shader_unit("root", &root, true).unwrap();
  group.add_shader_unit("loose", &loose, false).unwrap();
  group
    .expose_shader_argument("root", "o", ArgDescriptor::output("o", ShaderArgumentType::Float))
    .unwrap();
  let group = ctx.end_shader_group_template(group).unwrap();

  let mut args = [Value::Float(0.)];
  run(&ctx, &group, &mut args);
  assert_eq!(args[0], Value::Float(1.));
}

#[test]
fn structural_errors() {
  let system = init();
  let ctx = system.make_shading_context();

  let a = unit(&ctx, "a", "shader a(float i, out float o) { o = i; }");
  let b = unit(&ctx, "b", "shader b(float i, out float o) { o = i; }");

  // no root
  let mut group = ctx.begin_shader_group_template("g").unwrap();
  group.add_shader_unit("a", &a, false).unwrap();
  assert!(matches!(ctx.end_shader_group_template(group), Err(TslError::Graph(_))));

  // cycle
  let mut group = ctx.begin_shader_group_template("g").unwrap();
  group.add_shader_unit("a", &a, true).unwrap();
  group.add_shader_unit("b", &b, false).unwrap();
  group.connect_shader_units("a", "o", "b", "i").unwrap();
  group.connect_shader_units("b", "o", "a", "i").unwrap();
  assert!(matches!(ctx.end_shader_group_template(group), Err(TslError::Graph(_))));

  // undefined member
  let mut group = ctx.begin_shader_group_template("g").unwrap();
  group.add_shader_unit("a", &a, true).unwrap();
  group.connect_shader_units("ghost", "o", "a", "i").unwrap();
  assert!(matches!(ctx.end_shader_group_template(group), Err(TslError::Graph(_))));

  // unbound input
  let mut group = ctx.begin_shader_group_template("g").unwrap();
  group.add_shader_unit("a", &a, true).unwrap();
  assert!(matches!(ctx.end_shader_group_template(group), Err(TslError::Binding(_))));

  // every failure released the name
  assert!(system.shader_template("g").is_none());

  let mut group = ctx.begin_shader_group_template("g").unwrap();
  group.add_shader_unit("a", &a, true).unwrap();
  group.init_shader_input("a", "i", 1.0f32).unwrap();
  assert!(ctx.end_shader_group_template(group).is_ok());
  assert!(system.shader_template("g").unwrap().is_group());
}

#[test]
fn members_without_entry() {
  let system = init();
  let ctx = system.make_shading_context();
  let inert = unit(&ctx, "inert", "float helper() { return 1.0; }");

  let mut group = ctx.begin_shader_group_template("g").unwrap();
  group.add_shader_unit("inert", &inert, true).unwrap();
  assert!(matches!(ctx.end_shader_group_template(group), Err(TslError::Graph(_))));
}

#[test]
fn composing_leaves_members_untouched() {
  let system = init();
  let ctx = system.make_shading_context();
  let a = unit(&ctx, "a", "shader a(float i, out float o) { o = i * 2.0; }");
  let before = a.module().clone();

  let mut group = ctx.begin_shader_group_template("g").unwrap();
  group.add_shader_unit("a", &a, true).unwrap();
  group.init_shader_input("a", "i", 1.0f32).unwrap();
  let group = ctx.end_shader_group_template(group).unwrap();
  run(&ctx, &group, &mut []);

  assert_eq!(a.module(), &before);
  assert_eq!(a.instance_count(), 0);
  assert_eq!(group.instance_count(), 1);
}
