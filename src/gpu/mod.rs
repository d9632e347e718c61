//! The GPU command surface.
//!
//! Everything above this module talks to the device through [`Gpu`]: buffer, texture, shader
//! and program objects are referenced by opaque raw handles, binding state is set call by call
//! and draws are recorded against a framebuffer. Calls are synchronous and report failure
//! immediately (creation returns `None`), except program linking whose status is polled so that
//! several programs can compile in parallel while the caller carries on.
//!
//! Two backends are provided:
//!
//! - [`headless::HeadlessGpu`] keeps every object in memory and records draws. It is used by the
//!   test-suite and by tools that run without an adapter.
//! - [`wgpu_backend::WgpuGpu`] renders into an offscreen canvas through `wgpu`.
//!
//! Shader sources are WGSL and are compiled and reflected with `naga` in both backends, see
//! [`reflect`].

use std::{any::Any, fmt};

use crate::data_structures::geometry::{ComponentType, Topology};

pub mod headless;
pub mod reflect;
pub mod wgpu_backend;

macro_rules! raw_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub(crate) u32);

            impl $name {
                pub fn id(&self) -> u32 {
                    self.0
                }
            }
        )*
    };
}

raw_handle!(
    /// Device-side buffer object.
    RawBuffer,
    /// Device-side 2D texture object.
    RawTexture,
    /// Device-side shader stage object.
    RawShader,
    /// Device-side linked program object.
    RawProgram,
    /// Render target. The canvas is a framebuffer too.
    RawFramebuffer,
);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferTarget {
    Array,
    ElementArray,
    Uniform,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn name(&self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    /// The driver has not finished linking yet.
    Pending,
    Linked,
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

/// Colour, depth and stencil values a framebuffer is cleared to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearState {
    pub color: wgpu::Color,
    pub depth: f32,
    pub stencil: u32,
}

impl ClearState {
    pub const BLACK: ClearState = ClearState {
        color: wgpu::Color::BLACK,
        depth: 1.0,
        stencil: 0,
    };
}

impl Default for ClearState {
    fn default() -> Self {
        Self {
            color: wgpu::Color {
                r: 1.0,
                g: 1.0,
                b: 1.0,
                a: 0.0,
            },
            depth: 1.0,
            stencil: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DepthTestState {
    #[default]
    Less,
    None,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendState {
    #[default]
    None,
    PremultipliedAlpha,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullingState {
    #[default]
    Back,
    None,
}

/// Fixed-function state a draw is issued with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderState {
    pub depth_test: DepthTestState,
    pub blend: BlendState,
    pub culling: CullingState,
}

impl RenderState {
    /// State for full-screen passes: no depth, no blending, no culling.
    pub const PASS: RenderState = RenderState {
        depth_test: DepthTestState::None,
        blend: BlendState::None,
        culling: CullingState::None,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Float,
    Int,
    UInt,
    Bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D2,
    Cube,
}

/// Reflected type of a uniform or attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniformType {
    Scalar(ScalarKind),
    Vector(ScalarKind, u8),
    Matrix { columns: u8, rows: u8 },
    Texture(TextureDimension),
    Sampler,
    Struct,
    Other,
}

impl UniformType {
    /// Number of texture units a uniform of this type occupies.
    pub fn texture_units(&self) -> u32 {
        match self {
            UniformType::Texture(_) => 1,
            _ => 0,
        }
    }

    pub fn is_sampler_like(&self) -> bool {
        matches!(self, UniformType::Texture(_) | UniformType::Sampler)
    }
}

/// One active uniform as reported by program introspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveUniform {
    pub index: u32,
    pub name: String,
    pub ty: UniformType,
    /// Element count for array uniforms, 0 otherwise.
    pub array_len: u32,
    pub array_stride: u32,
    pub size: u32,
    /// Owning uniform block, `None` for loose uniforms.
    pub block_index: Option<u32>,
    /// Byte offset inside the owning block.
    pub offset: u32,
    pub group: u32,
    pub binding: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveUniformBlock {
    pub index: u32,
    pub name: String,
    pub size: u32,
    pub group: u32,
    pub binding: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveAttribute {
    pub name: String,
    pub location: u32,
    pub ty: UniformType,
}

/// Raw uniform payload. Textures are bound separately through texture units.
#[derive(Clone, Debug, PartialEq)]
pub enum UniformData {
    Float(f32),
    Int(i32),
    UInt(u32),
    Bool(bool),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat3([[f32; 3]; 3]),
    Mat4([[f32; 4]; 4]),
    FloatArray(Vec<f32>),
    IntArray(Vec<i32>),
    Vec3Array(Vec<[f32; 3]>),
    Vec4Array(Vec<[f32; 4]>),
}

impl UniformData {
    fn elements(&self) -> Vec<Vec<u8>> {
        fn bytes<T: bytemuck::Pod>(value: &[T]) -> Vec<u8> {
            bytemuck::cast_slice(value).to_vec()
        }
        match self {
            UniformData::Float(v) => vec![bytes(&[*v])],
            UniformData::Int(v) => vec![bytes(&[*v])],
            UniformData::UInt(v) => vec![bytes(&[*v])],
            UniformData::Bool(v) => vec![bytes(&[*v as u32])],
            UniformData::Vec2(v) => vec![bytes(v)],
            UniformData::Vec3(v) => vec![bytes(v)],
            UniformData::Vec4(v) => vec![bytes(v)],
            // mat3x3 columns are padded to vec4 in uniform memory
            UniformData::Mat3(m) => {
                let mut out = Vec::with_capacity(48);
                for column in m {
                    out.extend_from_slice(bytemuck::cast_slice(column));
                    out.extend_from_slice(&[0; 4]);
                }
                vec![out]
            }
            UniformData::Mat4(m) => vec![bytes(m)],
            UniformData::FloatArray(values) => values.iter().map(|v| bytes(&[*v])).collect(),
            UniformData::IntArray(values) => values.iter().map(|v| bytes(&[*v])).collect(),
            UniformData::Vec3Array(values) => values.iter().map(|v| bytes(v)).collect(),
            UniformData::Vec4Array(values) => values.iter().map(|v| bytes(v)).collect(),
        }
    }

    /// Encodes the value in the uniform-buffer layout described by `uniform`.
    ///
    /// Array elements are written at `array_stride` intervals, so a scalar array can feed an
    /// `array<vec4<f32>, N>` declaration (the remaining components stay zero).
    pub fn encode(&self, uniform: &ActiveUniform) -> Vec<u8> {
        let elements = self.elements();
        if uniform.array_len == 0 {
            let mut out = elements.into_iter().next().unwrap_or_default();
            out.resize(uniform.size as usize, 0);
            return out;
        }
        let stride = uniform.array_stride.max(1) as usize;
        let mut out = vec![0u8; stride * uniform.array_len as usize];
        for (i, element) in elements.iter().enumerate().take(uniform.array_len as usize) {
            let n = element.len().min(stride);
            out[i * stride..i * stride + n].copy_from_slice(&element[..n]);
        }
        out
    }
}

/// Everything needed to feed one vertex attribute location from a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub buffer: RawBuffer,
    pub components: u8,
    pub component_type: ComponentType,
    pub normalized: bool,
    /// Effective byte stride, never 0.
    pub stride: u32,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawCall {
    pub target: RawFramebuffer,
    pub topology: Topology,
    pub first: u32,
    pub count: u32,
    pub index_format: Option<IndexFormat>,
    pub state: RenderState,
}

/// The device surface the core is written against.
///
/// Creation methods return `None` when the device cannot produce a handle; callers turn that
/// into [`crate::Error::ResourceCreation`].
pub trait Gpu: Any {
    fn backend_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn create_buffer(&mut self, target: BufferTarget, data: &[u8], label: &str) -> Option<RawBuffer>;
    fn write_buffer(&mut self, buffer: RawBuffer, offset: u64, data: &[u8]);
    fn delete_buffer(&mut self, buffer: RawBuffer);

    fn create_texture(&mut self, desc: &TextureDesc, rgba: &[u8]) -> Option<RawTexture>;
    fn delete_texture(&mut self, texture: RawTexture);

    fn canvas(&self) -> RawFramebuffer;
    fn framebuffer_size(&self, framebuffer: RawFramebuffer) -> (u32, u32);
    fn create_framebuffer(&mut self, color: RawTexture) -> Option<RawFramebuffer>;
    fn delete_framebuffer(&mut self, framebuffer: RawFramebuffer);
    fn clear(&mut self, framebuffer: RawFramebuffer, state: &ClearState);
    fn read_pixels(&mut self, framebuffer: RawFramebuffer) -> anyhow::Result<image::RgbaImage>;

    fn create_shader(&mut self, stage: ShaderStage, source: &str) -> Option<RawShader>;
    /// Compile diagnostics. Only meaningful once the owning program reported its link status.
    fn shader_compile_status(&self, shader: RawShader) -> Result<(), String>;
    fn delete_shader(&mut self, shader: RawShader);

    /// Attaches both stages and submits the link. Does not wait for the result.
    fn create_program(&mut self, vertex: RawShader, fragment: RawShader) -> Option<RawProgram>;
    /// Link status; with `wait` the call blocks until the driver has an answer.
    fn program_link_status(&mut self, program: RawProgram, wait: bool) -> LinkStatus;
    fn delete_program(&mut self, program: RawProgram);
    fn active_uniforms(&self, program: RawProgram) -> Vec<ActiveUniform>;
    fn active_uniform_blocks(&self, program: RawProgram) -> Vec<ActiveUniformBlock>;
    fn active_attributes(&self, program: RawProgram) -> Vec<ActiveAttribute>;

    fn use_program(&mut self, program: RawProgram);
    fn set_uniform(&mut self, program: RawProgram, uniform: &ActiveUniform, value: &UniformData);
    fn bind_uniform_block(&mut self, program: RawProgram, block: &ActiveUniformBlock, buffer: RawBuffer);
    fn bind_texture(&mut self, unit: u32, texture: RawTexture);
    fn bind_vertex_attribute(&mut self, location: u32, binding: VertexBinding);
    fn unbind_vertex_attribute(&mut self, location: u32);
    fn bind_index_buffer(&mut self, index: Option<(RawBuffer, IndexFormat)>);

    fn draw(&mut self, call: DrawCall);
    /// Submits recorded clears and draws.
    fn flush(&mut self);
    /// Lets the driver make progress on pipelined work such as program links.
    fn poll(&mut self);
}
