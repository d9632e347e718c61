use std::rc::Rc;

use scene_ngin::{
    context::{Context, ContextConfig},
    data_structures::{
        geometry::{Attribute, Geometry, Topology},
        material::{Material, ShaderMaterial},
        scene_graph::{MeshNode, NodeKind},
    },
    gpu::headless::HeadlessGpu,
};

pub const MESH_VERTEX: &str = r#"
struct Camera {
    worldToView: mat4x4<f32>,
    viewToScreen: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> camera: Camera;
@group(0) @binding(1) var<uniform> localToWorld: mat4x4<f32>;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> VertexOutput {
    var out: VertexOutput;
    let world = localToWorld * vec4<f32>(position, 1.0);
    out.world_position = world.xyz;
    out.clip_position = camera.viewToScreen * camera.worldToView * world;
    return out;
}
"#;

/// Offsets inside the `lights` block of [`MESH_FRAGMENT`].
pub const LIGHT_TYPE_OFFSET: u32 = 16;
pub const LIGHT_POSITION_OFFSET: u32 = 144;
pub const LIGHT_COLOR_OFFSET: u32 = 272;
pub const LIGHT_INNER_COS_OFFSET: u32 = 400;
pub const LIGHT_OUTER_COS_OFFSET: u32 = 528;

pub const MESH_FRAGMENT: &str = r#"
struct Lights {
    numPunctualLights: i32,
    punctualLightType: array<vec4<i32>, 8>,
    punctualLightPosition: array<vec4<f32>, 8>,
    punctualLightColor: array<vec4<f32>, 8>,
    punctualLightInnerCos: array<vec4<f32>, 8>,
    punctualLightOuterCos: array<vec4<f32>, 8>,
}

@group(1) @binding(0) var<uniform> lights: Lights;
@group(1) @binding(1) var<uniform> baseColorFactor: vec4<f32>;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    var color = vec3<f32>(0.1);
    for (var i = 0; i < lights.numPunctualLights; i++) {
        let to_light = lights.punctualLightPosition[i].xyz - in.world_position;
        var cone = 1.0;
        if (lights.punctualLightType[i].x == 2) {
            cone = smoothstep(lights.punctualLightOuterCos[i].x, lights.punctualLightInnerCos[i].x, 1.0);
        }
        color += cone * lights.punctualLightColor[i].xyz / max(dot(to_light, to_light), 1.0);
    }
    return vec4<f32>(color, 1.0) * baseColorFactor;
}
"#;

pub const TEXTURED_FRAGMENT: &str = r#"
@group(1) @binding(0) var baseColorMap: texture_2d<f32>;
@group(1) @binding(1) var baseColorSampler: sampler;
@group(1) @binding(2) var normalMap: texture_2d<f32>;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let uv = in.world_position.xy;
    return textureSample(baseColorMap, baseColorSampler, uv) * textureSample(normalMap, baseColorSampler, uv);
}
"#;

/// Fragment stage that reads a varying the vertex stage never writes.
pub const MISMATCHED_FRAGMENT: &str = r#"
@fragment
fn fs_main(@location(3) missing: vec4<f32>) -> @location(0) vec4<f32> {
    return missing;
}
"#;

pub fn test_config() -> ContextConfig {
    ContextConfig {
        width: 64,
        height: 64,
        ..Default::default()
    }
}

pub fn headless_context() -> Context {
    Context::headless(test_config())
}

/// A context whose program links take `ticks` calls of `run_pending` to finish.
pub fn slow_link_context(ticks: u32) -> Context {
    let config = test_config();
    Context::new(HeadlessGpu::new(config.width, config.height).with_link_latency(ticks), config)
}

pub fn headless<R>(ctx: &Context, f: impl FnOnce(&mut HeadlessGpu) -> R) -> R {
    ctx.with_backend::<HeadlessGpu, R>(f)
        .expect("test contexts run on the headless backend")
}

pub fn mesh_shader() -> Rc<ShaderMaterial> {
    Rc::new(ShaderMaterial::new("mesh", MESH_VERTEX, MESH_FRAGMENT))
}

pub fn textured_shader() -> Rc<ShaderMaterial> {
    Rc::new(ShaderMaterial::new("textured", MESH_VERTEX, TEXTURED_FRAGMENT))
}

pub fn triangle() -> Geometry {
    Geometry::new(Topology::Triangles).with_attribute(
        "position",
        Attribute::from_f32(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0], 3),
    )
}

pub fn mesh(geometry: Rc<Geometry>, shader: Rc<ShaderMaterial>) -> NodeKind {
    NodeKind::Mesh(MeshNode {
        geometry,
        material: Material::new(shader),
    })
}

pub fn assert_near(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-5,
        "expected {} but got {}",
        expected,
        actual
    );
}
