use std::rc::Rc;

use scene_ngin::{
    Error,
    data_structures::{material::ShaderMaterial, texture::Texture},
    error::CompileLinkError,
    gpu::{RenderState, UniformData},
    render::{
        buffer_geometry::make_buffer_geometry_from_geometry,
        program::{Program, ProgramState},
        renderer::render_buffer_geometry,
        tex_image_2d::TexImage2D,
        vertex_array::VertexArrayObject,
    },
    uniforms,
};

mod common;

use common::test_utils::*;

fn block_i32(bytes: &[u8], offset: u32) -> i32 {
    let i = offset as usize;
    i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
}

#[test]
fn should_reflect_blocks_loose_uniforms_and_attributes() {
    let ctx = headless_context();
    let program = Program::new(ctx.state(), &mesh_shader()).unwrap();
    assert_eq!(program.state(), ProgramState::LinkedUnvalidated);

    program.validate().unwrap();
    assert!(program.is_validated());

    let blocks: Vec<&str> = program
        .uniform_blocks()
        .unwrap()
        .iter()
        .map(|b| b.name.as_str())
        .collect();
    assert_eq!(blocks, vec!["camera", "lights"]);

    let view_to_screen = program.uniform("viewToScreen").unwrap().unwrap();
    assert!(view_to_screen.is_block_member());
    assert_eq!(view_to_screen.active.offset, 64);
    let local_to_world = program.uniform("localToWorld").unwrap().unwrap();
    assert!(!local_to_world.is_block_member());
    assert_eq!(local_to_world.texture_unit, None);
    let inner_cos = program.uniform("punctualLightInnerCos").unwrap().unwrap();
    assert_eq!(inner_cos.active.offset, LIGHT_INNER_COS_OFFSET);
    assert_eq!((inner_cos.active.array_len, inner_cos.active.array_stride), (8, 16));

    let attributes = program.attributes().unwrap();
    assert_eq!(attributes.len(), 1);
    assert_eq!(attributes["position"].location, 0);
}

#[test]
fn should_assign_consecutive_texture_units() {
    let ctx = headless_context();
    let program = Program::new(ctx.state(), &textured_shader()).unwrap();

    let unit = |name: &str| program.uniform(name).unwrap().unwrap().texture_unit;
    assert_eq!(unit("baseColorMap"), Some(0));
    assert_eq!(unit("normalMap"), Some(1));
    assert_eq!(unit("baseColorSampler"), None);
}

#[test]
fn should_report_link_failures_and_dispose_the_program() {
    let ctx = headless_context();
    let shader = ShaderMaterial::new("mismatched", MESH_VERTEX, MISMATCHED_FRAGMENT);
    let program = Program::new(ctx.state(), &shader).unwrap();

    let error = program.validate().unwrap_err();
    let Error::CompileLink(CompileLinkError::Link { log }) = &error else {
        panic!("expected a link error, got {:?}", error);
    };
    assert!(log.contains("location 3"), "{}", log);
    assert!(matches!(program.state(), ProgramState::Failed(_)));
    assert!(program.is_disposed());
    // failing again reports the same error without touching the device
    assert!(matches!(program.validate(), Err(Error::CompileLink(_))));
    headless(&ctx, |gpu| {
        assert_eq!(gpu.live_programs(), 0);
        assert_eq!(gpu.live_shaders(), 0);
    });
}

#[test]
fn should_blame_the_stage_that_did_not_compile() {
    let ctx = headless_context();
    let shader = ShaderMaterial::new("broken", MESH_VERTEX, "@fragment fn fs_main( {");
    let program = Program::new(ctx.state(), &shader).unwrap();

    match program.validate() {
        Err(Error::CompileLink(CompileLinkError::Compile { stage, .. })) => assert_eq!(stage, "fragment"),
        other => panic!("expected a compile error, got {:?}", other),
    }
}

#[test]
fn should_ignore_unknown_uniforms() {
    let ctx = headless_context();
    let program = Program::new(ctx.state(), &mesh_shader()).unwrap();

    program
        .set_uniform_values(&uniforms! { "doesNotExist" => 1.0f32, "baseColorFactor" => [1.0f32, 0.5, 0.25, 1.0] })
        .unwrap();
}

#[test]
fn should_reject_values_of_the_wrong_kind() {
    let ctx = headless_context();
    let program = Program::new(ctx.state(), &textured_shader()).unwrap();
    let texture = Rc::new(TexImage2D::from_texture(ctx.state(), &Texture::solid("white", 1, 1, [255; 4])).unwrap());

    let error = program
        .set_uniform_values(&uniforms! { "localToWorld" => texture.clone() })
        .unwrap_err();
    assert!(matches!(&error, Error::BindingMismatch(m) if m.contains("is not a texture uniform")), "{}", error);

    let error = program
        .set_uniform_values(&uniforms! { "baseColorMap" => 1.0f32 })
        .unwrap_err();
    assert!(matches!(&error, Error::BindingMismatch(m) if m.contains("only accepts a texture")), "{}", error);

    program
        .set_uniform_values(&uniforms! { "baseColorMap" => texture.clone(), "normalMap" => texture })
        .unwrap();
}

#[test]
fn should_write_block_members_at_their_offsets() {
    let ctx = headless_context();
    let program = Program::new(ctx.state(), &mesh_shader()).unwrap();
    let geometry = make_buffer_geometry_from_geometry(ctx.state(), &triangle()).unwrap();
    let lights = uniforms! {
        "numPunctualLights" => 2,
        "punctualLightType" => UniformData::IntArray(vec![1, 2]),
        "punctualLightOuterCos" => UniformData::FloatArray(vec![0.0, 0.75]),
    };
    let material = uniforms! { "baseColorFactor" => [0.5f32, 0.5, 0.5, 1.0] };

    render_buffer_geometry(
        &ctx,
        &program,
        &geometry,
        &[&lights, &material],
        ctx.canvas().raw().unwrap(),
        RenderState::default(),
    )
    .unwrap();
    ctx.gpu().flush();

    let draws = headless(&ctx, |gpu| gpu.take_draws());
    assert_eq!(draws.len(), 1);
    let draw = &draws[0];
    assert_eq!(draw.call.count, 3);
    let block = &draw.blocks["lights"];
    assert_eq!(block_i32(block, 0), 2);
    assert_eq!(block_i32(block, LIGHT_TYPE_OFFSET), 1);
    assert_eq!(block_i32(block, LIGHT_TYPE_OFFSET + 16), 2);
    assert_eq!(draw.block_f32s::<1>("lights", LIGHT_OUTER_COS_OFFSET + 16), Some([0.75]));
    assert_eq!(
        draw.uniforms.get("baseColorFactor"),
        Some(&UniformData::Vec4([0.5, 0.5, 0.5, 1.0]))
    );
    assert!(draw.attributes.contains_key(&0));
}

#[test]
fn should_upload_an_unchanged_block_only_once() {
    let ctx = headless_context();
    let program = Program::new(ctx.state(), &mesh_shader()).unwrap();
    let values = uniforms! { "numPunctualLights" => 1 };

    program.set_uniform_values(&values).unwrap();
    let writes = headless(&ctx, |gpu| gpu.stats().buffer_writes);
    program.set_uniform_values(&values).unwrap();
    assert_eq!(headless(&ctx, |gpu| gpu.stats().buffer_writes), writes);

    program
        .set_uniform_values(&uniforms! { "numPunctualLights" => 3 })
        .unwrap();
    assert_eq!(headless(&ctx, |gpu| gpu.stats().buffer_writes), writes + 1);
}

#[test]
fn should_resolve_acquired_programs_once_linked() {
    let ctx = slow_link_context(2);
    let shader = mesh_shader();

    let program = Program::acquire(&ctx, &shader);
    assert!(program.peek().is_none());

    ctx.run_pending();
    assert!(program.peek().is_none(), "the link takes two ticks");

    ctx.run_pending();
    let linked = program.get().expect("linked after two ticks");
    assert!(linked.is_validated());

    let again = Program::acquire(&ctx, &shader);
    assert!(Rc::ptr_eq(&linked, &again.get().unwrap()));
    assert_eq!(ctx.program_cache.factory_calls(), 1);
}

#[test]
fn should_link_synchronously_when_configured() {
    let mut config = test_config();
    config.async_program_links = false;
    let ctx = scene_ngin::context::Context::new(
        scene_ngin::gpu::headless::HeadlessGpu::new(config.width, config.height).with_link_latency(5),
        config,
    );

    let program = Program::acquire(&ctx, &mesh_shader());
    assert!(program.get().is_some_and(|p| p.is_validated()));
}

#[test]
fn should_delete_everything_on_release() {
    let ctx = headless_context();
    let shader = mesh_shader();
    let program = Program::acquire(&ctx, &shader);
    program
        .get()
        .unwrap()
        .set_uniform_values(&uniforms! { "numPunctualLights" => 1 })
        .unwrap();

    program.dispose();

    assert!(!ctx.program_cache.contains(&shader.key()));
    headless(&ctx, |gpu| {
        assert_eq!(gpu.live_programs(), 0);
        assert_eq!(gpu.live_shaders(), 0);
        assert_eq!(gpu.live_buffers(), 0);
    });
}

#[test]
fn should_bind_through_a_vertex_array() {
    let ctx = headless_context();
    let program = Program::new(ctx.state(), &mesh_shader()).unwrap();
    let other = Program::new(ctx.state(), &textured_shader()).unwrap();
    let geometry = make_buffer_geometry_from_geometry(ctx.state(), &triangle()).unwrap();

    let vao = VertexArrayObject::new(&program, &geometry).unwrap();
    assert!(vao.binding(0).is_some());
    program.set_attribute_buffers(&vao).unwrap();

    assert!(matches!(
        other.set_attribute_buffers(&vao),
        Err(Error::BindingMismatch(_))
    ));
}
