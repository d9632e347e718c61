use std::rc::Rc;

use instant::Duration;
use scene_ngin::{
    context::Context,
    data_structures::{
        material::ShaderMaterial,
        scene_graph::{Camera, NodeId, NodeKind, SceneGraph},
        transform::Transform,
    },
    flow::{FrameDriver, SceneFlow},
    gpu::BufferTarget,
    render::{buffer::Buffer, render_cache::ShaderResolver},
};

mod common;

use common::test_utils::*;

#[derive(Default)]
struct Spinner {
    inits: u32,
    updates: u32,
    mesh: Option<NodeId>,
    leaked: Option<Buffer>,
    leak_a_buffer: bool,
    fail_update: bool,
    shader_override: Option<Rc<ShaderMaterial>>,
}

impl SceneFlow for Spinner {
    fn on_init(&mut self, ctx: &Context, graph: &mut SceneGraph, root: NodeId) -> anyhow::Result<()> {
        self.inits += 1;
        let mesh = graph.add("spinner", mesh(Rc::new(triangle()), mesh_shader()));
        graph.append(root, mesh)?;
        let camera = graph.add(
            "camera",
            NodeKind::Camera(Camera::perspective(cgmath::Deg(60.0), 1.0, 0.1, 100.0)),
        );
        graph.set_local_transform(camera, Transform::from_translation(0.0, 0.0, 5.0))?;
        graph.append(root, camera)?;
        self.mesh = Some(mesh);
        if self.leak_a_buffer {
            self.leaked = Some(Buffer::new(ctx.state(), BufferTarget::Uniform, &[0; 16], "leaked")?);
        }
        Ok(())
    }

    fn on_update(&mut self, _ctx: &Context, graph: &mut SceneGraph, _dt: Duration) -> anyhow::Result<()> {
        if self.fail_update {
            anyhow::bail!("update refused");
        }
        self.updates += 1;
        if let Some(mesh) = self.mesh {
            graph.set_local_transform(mesh, Transform::from_translation(self.updates as f32, 0.0, 0.0))?;
        }
        Ok(())
    }

    fn shader_resolver(&self) -> Option<ShaderResolver> {
        let shader = self.shader_override.clone()?;
        Some(Box::new(move |_| shader.clone()))
    }
}

#[test]
fn should_initialise_once_and_update_every_frame() {
    let mut driver = FrameDriver::new(headless_context(), Spinner::default()).unwrap();
    assert_eq!(driver.flow().inits, 1);
    assert_eq!(driver.graph().len(), 3);
    assert!(driver.render_cache().is_none());

    for _ in 0..3 {
        driver.tick().unwrap();
    }

    assert_eq!(driver.flow().inits, 1);
    assert_eq!(driver.flow().updates, 3);
    assert_eq!(driver.frames(), 3);
    assert_eq!(driver.render_cache().unwrap().len(), 1);
    let mesh = driver.flow().mesh.unwrap();
    assert_near(driver.graph().world_transform(mesh).w.x, 3.0);
}

#[test]
fn should_draw_every_frame_once_ready() {
    let mut driver = FrameDriver::new(headless_context(), Spinner::default()).unwrap();

    let stats = driver.tick().unwrap();
    assert_eq!(stats.drawn, 1);
    assert_eq!((stats.pending, stats.failed), (0, 0));

    driver.tick().unwrap();
    headless(driver.context(), |gpu| {
        assert_eq!(gpu.draws().len(), 2);
        assert_eq!(gpu.flushes(), 2);
    });
}

#[test]
fn should_keep_ticking_until_programs_are_linked() {
    let mut driver = FrameDriver::new(slow_link_context(3), Spinner::default()).unwrap();

    let first = driver.tick().unwrap();
    assert_eq!((first.drawn, first.pending), (0, 1));

    let stats = driver.run_until_ready(10).unwrap();
    assert_eq!((stats.drawn, stats.pending), (1, 0));
    assert!(driver.frames() <= 5, "ran {} frames", driver.frames());
}

#[test]
fn should_apply_the_shader_resolver() {
    let shader = Rc::new(ShaderMaterial::new("override", MESH_VERTEX, MESH_FRAGMENT));
    let flow = Spinner {
        shader_override: Some(shader.clone()),
        ..Default::default()
    };
    let mut driver = FrameDriver::new(headless_context(), flow).unwrap();

    driver.tick().unwrap();

    let mesh = driver.flow().mesh.unwrap();
    let entry = driver.render_cache().unwrap().entry(mesh).unwrap();
    assert_eq!(entry.shader_key(), shader.key());
    assert!(driver.context().program_cache.contains(&shader.key()));
    assert!(!driver.context().program_cache.contains(&mesh_shader().key()));
}

#[test]
fn should_propagate_update_errors() {
    let flow = Spinner {
        fail_update: true,
        ..Default::default()
    };
    let mut driver = FrameDriver::new(headless_context(), flow).unwrap();

    let error = driver.tick().unwrap_err();
    assert!(error.to_string().contains("update refused"));
    assert_eq!(driver.frames(), 0);
}

#[test]
fn should_release_everything_on_shutdown() {
    let mut driver = FrameDriver::new(headless_context(), Spinner::default()).unwrap();
    driver.tick().unwrap();

    assert_eq!(driver.shutdown(), 0);
    assert!(driver.render_cache().is_none());
    headless(driver.context(), |gpu| {
        assert_eq!(gpu.live_buffers(), 0);
        assert_eq!(gpu.live_programs(), 0);
    });
}

#[test]
fn should_force_delete_what_the_flow_leaked() {
    let flow = Spinner {
        leak_a_buffer: true,
        ..Default::default()
    };
    let mut driver = FrameDriver::new(headless_context(), flow).unwrap();
    driver.tick().unwrap();

    assert_eq!(driver.shutdown(), 1);
    assert!(driver.flow().leaked.as_ref().unwrap().is_disposed());
}
