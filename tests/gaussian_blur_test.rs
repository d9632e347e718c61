use std::rc::Rc;

use scene_ngin::{
    Error,
    context::Context,
    data_structures::texture::Texture,
    gpu::{BlendState, RenderState},
    render::{
        framebuffer::Framebuffer,
        gaussian_blur::{GaussianBlur, GaussianBlurProps},
        tex_image_2d::TexImage2D,
    },
};

mod common;

use common::test_utils::*;

fn source(ctx: &Context) -> Rc<TexImage2D> {
    Rc::new(TexImage2D::from_texture(ctx.state(), &Texture::solid("source", 8, 8, [200, 0, 0, 255])).unwrap())
}

fn offscreen(ctx: &Context, label: &str) -> Rc<TexImage2D> {
    Rc::new(TexImage2D::render_target(ctx.state(), 8, 8, label).unwrap())
}

#[test]
fn should_blur_horizontally_then_vertically() {
    let ctx = headless_context();
    let blur = GaussianBlur::new(&ctx).unwrap();
    let source = source(&ctx);
    let temp = offscreen(&ctx, "temp");
    let color = offscreen(&ctx, "target");
    let target = Framebuffer::with_color(&color).unwrap();

    let mut props = GaussianBlurProps::new(&source, 2.0, &temp, &target);
    props.source_lod = 1;
    ctx.block_on(blur.exec(&ctx, props)).unwrap();
    ctx.gpu().flush();

    let draws = headless(&ctx, |gpu| gpu.take_draws());
    assert_eq!(draws.len(), 2);
    let (horizontal, vertical) = (&draws[0], &draws[1]);

    assert_ne!(horizontal.call.target, target.raw().unwrap());
    assert_eq!(horizontal.textures.get(&0), Some(&source.raw().unwrap()));
    assert_eq!(horizontal.block_f32s::<2>("params", 0), Some([1.0, 0.0]));
    // sourceLod, standardDeviationInTexels, kernelRadiusInTexels, targetAlpha
    assert_eq!(horizontal.block_f32s::<4>("params", 8), Some([1.0, 1.0, 3.0, 1.0]));

    assert_eq!(vertical.call.target, target.raw().unwrap());
    assert_eq!(vertical.call.state, RenderState::PASS);
    assert_eq!(vertical.textures.get(&0), Some(&temp.raw().unwrap()));
    assert_eq!(vertical.block_f32s::<2>("params", 0), Some([0.0, 1.0]));

    headless(&ctx, |gpu| {
        assert_eq!(gpu.stats().framebuffers_created, 2);
        assert_eq!(gpu.stats().framebuffers_deleted, 1);
    });
}

#[test]
fn should_blend_over_the_target_when_translucent() {
    let ctx = headless_context();
    let blur = GaussianBlur::new(&ctx).unwrap();
    let source = source(&ctx);
    let temp = offscreen(&ctx, "temp");
    let color = offscreen(&ctx, "target");
    let target = Framebuffer::with_color(&color).unwrap();

    let mut props = GaussianBlurProps::new(&source, 1.5, &temp, &target);
    props.target_alpha = 0.25;
    ctx.block_on(blur.exec(&ctx, props)).unwrap();
    ctx.gpu().flush();

    let draws = headless(&ctx, |gpu| gpu.take_draws());
    assert_eq!(draws[0].call.state.blend, BlendState::None);
    assert_eq!(draws[0].block_f32s::<1>("params", 20), Some([1.0]));
    assert_eq!(draws[1].call.state.blend, BlendState::PremultipliedAlpha);
    assert_eq!(draws[1].block_f32s::<1>("params", 20), Some([0.25]));
    assert_eq!(draws[1].block_f32s::<1>("params", 16), Some([5.0]), "radius is ceil(3 sd)");
}

#[test]
fn should_reject_invalid_props() {
    let ctx = headless_context();
    let blur = GaussianBlur::new(&ctx).unwrap();
    let source = source(&ctx);
    let temp = Rc::new(TexImage2D::render_target(ctx.state(), 4, 4, "small").unwrap());
    let color = offscreen(&ctx, "target");
    let target = Framebuffer::with_color(&color).unwrap();

    let error = ctx
        .block_on(blur.exec(&ctx, GaussianBlurProps::new(&source, 1.0, &temp, &target)))
        .unwrap_err();
    assert!(matches!(&error, Error::BindingMismatch(m) if m.contains("does not match")), "{}", error);

    let temp = offscreen(&ctx, "temp");
    let error = ctx
        .block_on(blur.exec(&ctx, GaussianBlurProps::new(&source, -1.0, &temp, &target)))
        .unwrap_err();
    assert!(matches!(error, Error::BindingMismatch(_)));

    let mut props = GaussianBlurProps::new(&source, 1.0, &temp, &target);
    props.target_alpha = 1.5;
    assert!(ctx.block_on(blur.exec(&ctx, props)).is_err());

    headless(&ctx, |gpu| {
        assert!(gpu.draws().is_empty());
        assert_eq!(gpu.stats().framebuffers_created, 1, "only the target framebuffer");
    });
}

#[test]
fn should_share_and_release_the_blur_program() {
    let ctx = headless_context();
    let first = GaussianBlur::new(&ctx).unwrap();
    let second = GaussianBlur::new(&ctx).unwrap();
    assert_eq!(ctx.program_cache.ref_count("gaussianBlur"), 2);

    first.dispose();
    assert!(ctx.program_cache.contains("gaussianBlur"));
    second.dispose();
    assert!(!ctx.program_cache.contains("gaussianBlur"));
}
