//! Issues the draws of a [`RenderCache`].

use crate::{
    Result,
    context::Context,
    data_structures::scene_graph::NodeId,
    gpu::{DrawCall, RawFramebuffer, RenderState},
    render::{
        buffer_geometry::BufferGeometry,
        framebuffer::Framebuffer,
        program::Program,
        render_cache::{MeshEntry, RenderCache},
        uniforms::UniformValueMap,
    },
};

/// What happened to the entries of one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub drawn: usize,
    /// Entries whose program, geometry or textures are still being built.
    pub pending: usize,
    /// Entries skipped because a resource failed or binding was rejected.
    pub failed: usize,
}

/// Clears `target` and draws every entry of `cache` that is ready.
///
/// Entries that are not ready are skipped and picked up again once their resources resolve.
/// Per-draw errors are logged and skipped as well, they never abort the frame.
pub fn render_scene(ctx: &Context, cache: &RenderCache, target: &Framebuffer) -> Result<FrameStats> {
    target.clear(&ctx.clear_state)?;
    let raw_target = target.raw()?;
    let mut stats = FrameStats::default();
    for (id, entry) in cache.draw_order() {
        match draw_entry(ctx, cache, id, entry, raw_target) {
            Ok(true) => stats.drawn += 1,
            Ok(false) => stats.pending += 1,
            Err(e) => {
                log::warn!("skipping draw of node {:?}: {}", id, e);
                stats.failed += 1;
            }
        }
    }
    ctx.gpu().flush();
    if stats.pending > 0 || stats.failed > 0 {
        log::trace!("frame: {:?}", stats);
    }
    Ok(stats)
}

fn draw_entry(ctx: &Context, cache: &RenderCache, id: NodeId, entry: &MeshEntry, target: RawFramebuffer) -> Result<bool> {
    if let Some(Err(e)) = entry.program().peek() {
        return Err(e.into());
    }
    if let Some(Err(e)) = entry.geometry().peek() {
        return Err(e.into());
    }
    for (_, texture) in entry.textures() {
        if let Some(Err(e)) = texture.peek() {
            return Err(e.into());
        }
    }
    let (Some(program), Some(geometry), Some(textures)) =
        (entry.program().get(), entry.geometry().get(), entry.texture_values())
    else {
        log::trace!("node {:?} not ready yet", id);
        return Ok(false);
    };
    let node = entry.node_uniforms();
    render_buffer_geometry(
        ctx,
        &program,
        &geometry,
        &[cache.camera_uniforms(), cache.light_uniforms(), entry.params(), &textures, &node],
        target,
        RenderState::default(),
    )?;
    Ok(true)
}

/// Binds `program`, its uniforms and `geometry`, then records one draw into `target`.
pub fn render_buffer_geometry(
    ctx: &Context,
    program: &Program,
    geometry: &BufferGeometry,
    uniforms: &[&UniformValueMap],
    target: RawFramebuffer,
    state: RenderState,
) -> Result<()> {
    if geometry.draw_count() == 0 {
        log::trace!("geometry #{} has nothing to draw", geometry.geometry_id());
        return Ok(());
    }
    program.use_program()?;
    program.set_uniform_value_maps(uniforms)?;
    program.set_attribute_buffers(geometry)?;
    ctx.gpu().draw(DrawCall {
        target,
        topology: geometry.topology(),
        first: 0,
        count: geometry.draw_count(),
        index_format: geometry.index_format(),
        state,
    });
    Ok(())
}
