use std::rc::Rc;

use scene_ngin::{
    Error,
    context::Context,
    data_structures::scene_graph::{SceneGraph, SceneTreeCache},
    error::ResourceKind,
    gpu::{BufferTarget, headless::HeadlessGpu},
    render::{
        buffer::Buffer, framebuffer::Framebuffer, program::Program, render_cache::update_render_cache,
        tex_image_2d::TexImage2D,
    },
};

mod common;

use common::test_utils::*;

#[test]
fn should_track_every_live_object() {
    let ctx = headless_context();
    let buffer = Buffer::new(ctx.state(), BufferTarget::Array, &[0; 16], "vertices").unwrap();
    let texture = TexImage2D::render_target(ctx.state(), 4, 4, "color").unwrap();
    let framebuffer = Framebuffer::with_color(&texture).unwrap();
    let program = Program::new(ctx.state(), &mesh_shader()).unwrap();

    {
        let registry = ctx.registry();
        assert_eq!(registry.live_count(), 6);
        assert_eq!(registry.live_count_of(ResourceKind::Shader), 2);
        assert_eq!(registry.live_count_of(ResourceKind::Framebuffer), 1);
    }

    buffer.dispose();
    framebuffer.dispose();
    texture.dispose();
    program.dispose();
    assert_eq!(ctx.registry().report_leaks(), 0);
    headless(&ctx, |gpu| {
        assert_eq!(gpu.live_buffers(), 0);
        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(gpu.live_programs(), 0);
    });
}

#[test]
fn should_fail_use_after_dispose() {
    let ctx = headless_context();
    let buffer = Buffer::new(ctx.state(), BufferTarget::Array, &[1, 2, 3, 4], "data").unwrap();

    buffer.dispose();
    buffer.dispose();

    assert!(buffer.is_disposed());
    assert!(matches!(
        buffer.raw(),
        Err(Error::Disposed { kind: ResourceKind::Buffer, .. })
    ));
    assert!(matches!(buffer.write(&[0; 4]), Err(Error::Disposed { .. })));
    headless(&ctx, |gpu| assert_eq!(gpu.stats().buffers_deleted, 1));
}

#[test]
fn should_dispose_everything_left_behind() {
    let ctx = headless_context();
    let (mut graph, mut tree) = (SceneGraph::new(), SceneTreeCache::default());
    let root = graph.add_group("root");
    let node = graph.add("object", mesh(Rc::new(triangle()), mesh_shader()));
    graph.append(root, node).unwrap();
    graph.update_node_tree(root, &mut tree).unwrap();
    let cache = update_render_cache(&ctx, &graph, root, None).unwrap();
    let stray = Buffer::new(ctx.state(), BufferTarget::Uniform, &[0; 64], "stray").unwrap();

    // program, two shaders, the geometry buffer and the stray buffer
    assert_eq!(ctx.registry().report_leaks(), 5);
    assert_eq!(ctx.dispose_all(), 5);

    assert_eq!(ctx.registry().live_count(), 0);
    assert!(stray.is_disposed());
    assert!(cache.entry(node).unwrap().program().get().unwrap().is_disposed());
    headless(&ctx, |gpu| {
        assert_eq!(gpu.live_buffers(), 0);
        assert_eq!(gpu.live_programs(), 0);
        assert_eq!(gpu.live_shaders(), 0);
    });

    // releasing the entries afterwards deletes nothing twice
    drop(cache);
    headless(&ctx, |gpu| {
        assert_eq!(gpu.stats().buffers_deleted, 2);
        assert_eq!(gpu.stats().programs_deleted, 1);
    });
}

#[test]
fn should_grow_buffers_on_larger_writes() {
    let ctx = headless_context();
    let buffer = Buffer::new(ctx.state(), BufferTarget::Array, &[0; 8], "growing").unwrap();
    let before = buffer.raw().unwrap();

    buffer.write(&[1; 4]).unwrap();
    assert_eq!(buffer.raw().unwrap(), before);
    assert_eq!(buffer.byte_length(), 8);

    buffer.write(&[2; 32]).unwrap();
    let after = buffer.raw().unwrap();
    assert_ne!(after, before);
    assert_eq!(buffer.byte_length(), 32);
    assert_eq!(buffer.version(), 2);
    assert_eq!(ctx.registry().live_count(), 1);
    headless(&ctx, |gpu| {
        assert_eq!(gpu.live_buffers(), 1);
        assert_eq!(gpu.buffer_data(after), Some(&[2u8; 32][..]));
    });
}

#[test]
fn should_reject_sub_data_past_the_end() {
    let ctx = headless_context();
    let buffer = Buffer::new(ctx.state(), BufferTarget::Array, &[0; 8], "small").unwrap();

    buffer.write_sub_data(4, &[7; 4]).unwrap();
    assert!(matches!(
        buffer.write_sub_data(6, &[7; 4]),
        Err(Error::OutOfBounds(_))
    ));

    let raw = buffer.raw().unwrap();
    headless(&ctx, |gpu| {
        assert_eq!(gpu.buffer_data(raw), Some(&[0, 0, 0, 0, 7, 7, 7, 7][..]));
    });
}

#[test]
fn should_report_creation_failures() {
    let ctx = headless_context();
    headless(&ctx, |gpu| gpu.fail_creation(ResourceKind::Texture, true));

    let error = TexImage2D::render_target(ctx.state(), 4, 4, "refused").unwrap_err();
    assert!(matches!(
        &error,
        Error::ResourceCreation { kind: ResourceKind::Texture, label } if label == "refused"
    ));
    assert_eq!(ctx.registry().live_count(), 0);

    headless(&ctx, |gpu| gpu.fail_creation(ResourceKind::Texture, false));
    assert!(TexImage2D::render_target(ctx.state(), 4, 4, "accepted").is_ok());
}

#[test]
fn should_clean_up_shaders_when_program_creation_fails() {
    let config = test_config();
    let mut gpu = HeadlessGpu::new(config.width, config.height);
    gpu.fail_creation(ResourceKind::Program, true);
    let ctx = Context::new(gpu, config);

    let error = Program::new(ctx.state(), &mesh_shader()).unwrap_err();

    assert!(matches!(error, Error::ResourceCreation { kind: ResourceKind::Program, .. }));
    assert_eq!(ctx.registry().live_count(), 0);
}

#[test]
fn should_clear_and_read_back_the_canvas() {
    let mut config = test_config();
    config.clear_colour = scene_ngin::wgpu::Color::RED;
    let ctx = Context::headless(config);

    ctx.canvas().clear(&ctx.clear_state).unwrap();
    let pixels = ctx.canvas().read_pixels().unwrap();

    assert_eq!(pixels.dimensions(), (64, 64));
    assert_eq!(pixels.get_pixel(10, 10).0, [255, 0, 0, 255]);
    let raw = ctx.canvas().raw().unwrap();
    headless(&ctx, |gpu| {
        assert_eq!(gpu.last_clear(raw).map(|c| c.color), Some(scene_ngin::wgpu::Color::RED));
    });
}
