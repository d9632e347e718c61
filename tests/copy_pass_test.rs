use std::rc::Rc;

use scene_ngin::{
    Error,
    data_structures::texture::Texture,
    gpu::RenderState,
    render::{
        copy_pass::{CopyPass, CopyProps, TextureEncoding},
        framebuffer::Framebuffer,
        tex_image_2d::TexImage2D,
    },
};

mod common;

use common::test_utils::*;

fn source(ctx: &scene_ngin::context::Context) -> Rc<TexImage2D> {
    Rc::new(TexImage2D::from_texture(ctx.state(), &Texture::solid("source", 4, 4, [10, 20, 30, 255])).unwrap())
}

#[test]
fn should_require_exactly_one_target() {
    let ctx = headless_context();
    let pass = CopyPass::new(&ctx).unwrap();
    let source = source(&ctx);
    let texture = TexImage2D::render_target(ctx.state(), 4, 4, "target").unwrap();

    let mut both = CopyProps::to_texture(&source, &texture);
    both.target_framebuffer = Some(ctx.canvas());
    let error = ctx.block_on(pass.exec(&ctx, both)).unwrap_err();
    assert!(matches!(&error, Error::BindingMismatch(m) if m.contains("both")), "{}", error);

    let mut neither = CopyProps::to_texture(&source, &texture);
    neither.target_texture = None;
    let error = ctx.block_on(pass.exec(&ctx, neither)).unwrap_err();
    assert!(matches!(&error, Error::BindingMismatch(m) if m.contains("no target")), "{}", error);

    headless(&ctx, |gpu| assert!(gpu.draws().is_empty()));
}

#[test]
fn should_copy_into_a_texture_through_a_temporary_framebuffer() {
    let ctx = headless_context();
    let pass = CopyPass::new(&ctx).unwrap();
    let source = source(&ctx);
    let texture = TexImage2D::render_target(ctx.state(), 4, 4, "target").unwrap();

    let mut props = CopyProps::to_texture(&source, &texture);
    props.source_encoding = TextureEncoding::Srgb;
    ctx.block_on(pass.exec(&ctx, props)).unwrap();

    let draws = headless(&ctx, |gpu| gpu.take_draws());
    assert_eq!(draws.len(), 1);
    let draw = &draws[0];
    assert_eq!(draw.call.state, RenderState::PASS);
    assert_eq!(draw.call.count, 6);
    assert_eq!(draw.textures.get(&0), Some(&source.raw().unwrap()));
    let params = &draw.blocks["params"];
    assert_eq!(&params[0..4], &1i32.to_le_bytes());
    assert_eq!(&params[4..8], &0i32.to_le_bytes());
    headless(&ctx, |gpu| {
        assert_eq!(gpu.stats().framebuffers_created, 1);
        assert_eq!(gpu.stats().framebuffers_deleted, 1);
    });
}

#[test]
fn should_copy_into_a_framebuffer() {
    let ctx = headless_context();
    let pass = CopyPass::new(&ctx).unwrap();
    let source = source(&ctx);
    let color = TexImage2D::render_target(ctx.state(), 8, 8, "offscreen").unwrap();
    let target = Framebuffer::with_color(&color).unwrap();

    ctx.block_on(pass.exec(&ctx, CopyProps::to_framebuffer(&source, &target)))
        .unwrap();

    let draws = headless(&ctx, |gpu| gpu.take_draws());
    assert_eq!(draws[0].call.target, target.raw().unwrap());
    assert!(target.raw().is_ok(), "a borrowed target stays alive");
}

#[test]
fn should_share_the_copy_program() {
    let ctx = slow_link_context(2);
    let first = CopyPass::new(&ctx).unwrap();
    let second = CopyPass::new(&ctx).unwrap();
    assert_eq!(ctx.program_cache.factory_calls(), 1);
    assert_eq!(ctx.program_cache.ref_count("copyPass"), 2);

    // exec waits for the link
    let source = source(&ctx);
    ctx.block_on(second.exec(&ctx, CopyProps::to_framebuffer(&source, ctx.canvas())))
        .unwrap();
    headless(&ctx, |gpu| assert_eq!(gpu.draws().len(), 1));

    first.dispose();
    second.dispose();
    assert!(!ctx.program_cache.contains("copyPass"));
}
