//! [`Gpu`] backend rendering through `wgpu` into an offscreen canvas.
//!
//! The call-by-call binding model of [`Gpu`] is mapped onto wgpu's pipeline objects at draw
//! time: the bound program, vertex layout and fixed-function state select a cached render
//! pipeline (auto layout), and a bind group is assembled from the current uniform values, the
//! uniform block buffers and the bound texture units. Uniform data is snapshotted per draw, so
//! block buffers can be rewritten between draws of one frame. Clears and draws are recorded and
//! encoded into render passes on [`Gpu::flush`].
//!
//! Every buffer keeps a host copy of its contents for those snapshots.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    iter,
    time::Duration,
};

use anyhow::Context as _;
use wgpu::util::DeviceExt;

use super::{
    ActiveAttribute, ActiveUniform, ActiveUniformBlock, BlendState, BufferTarget, ClearState,
    CullingState, DepthTestState, DrawCall, Gpu, IndexFormat, LinkStatus, RawBuffer,
    RawFramebuffer, RawProgram, RawShader, RawTexture, RenderState, ShaderStage, TextureDesc,
    TextureFormat, UniformData, UniformType, VertexBinding,
    reflect::{self, CompiledModule, ProgramReflection},
};
use crate::data_structures::geometry::{ComponentType, Topology};

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const CANVAS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

struct WgpuBuffer {
    buffer: wgpu::Buffer,
    shadow: Vec<u8>,
}

struct WgpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
}

struct WgpuFramebuffer {
    color: wgpu::Texture,
    view: wgpu::TextureView,
    depth: wgpu::TextureView,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
}

struct WgpuShader {
    source: String,
    compiled: Result<CompiledModule, String>,
}

struct WgpuProgram {
    link: Result<ProgramReflection, String>,
    modules: Option<(wgpu::ShaderModule, wgpu::ShaderModule)>,
    uniforms: BTreeMap<String, UniformData>,
    blocks: BTreeMap<String, RawBuffer>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: RawProgram,
    /// (location, stride, format) per vertex buffer slot.
    vertex: Vec<(u32, u64, wgpu::VertexFormat)>,
    topology: Topology,
    strip_index: Option<IndexFormat>,
    state: RenderState,
    color: wgpu::TextureFormat,
}

struct PreparedDraw {
    call: DrawCall,
    pipeline: wgpu::RenderPipeline,
    bind_groups: Vec<wgpu::BindGroup>,
    vertex_buffers: Vec<(wgpu::Buffer, u64)>,
    index: Option<(wgpu::Buffer, wgpu::IndexFormat)>,
}

enum Command {
    Clear(RawFramebuffer, ClearState),
    Draw(PreparedDraw),
}

#[derive(Default)]
struct BoundState {
    program: Option<RawProgram>,
    attributes: BTreeMap<u32, VertexBinding>,
    index_buffer: Option<(RawBuffer, IndexFormat)>,
    textures: BTreeMap<u32, RawTexture>,
}

pub struct WgpuGpu {
    device: wgpu::Device,
    queue: wgpu::Queue,
    next_id: u32,
    canvas: RawFramebuffer,
    buffers: HashMap<u32, WgpuBuffer>,
    textures: HashMap<u32, WgpuTexture>,
    framebuffers: HashMap<u32, WgpuFramebuffer>,
    shaders: HashMap<u32, WgpuShader>,
    programs: HashMap<u32, WgpuProgram>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    default_texture: wgpu::TextureView,
    default_sampler: wgpu::Sampler,
    bound: BoundState,
    commands: Vec<Command>,
}

impl WgpuGpu {
    /// Requests an adapter without a surface and allocates a `width`x`height` canvas.
    pub async fn new_offscreen(width: u32, height: u32) -> anyhow::Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            #[cfg(not(target_arch = "wasm32"))]
            backends: wgpu::Backends::PRIMARY,
            #[cfg(target_arch = "wasm32")]
            backends: wgpu::Backends::GL,
            ..wgpu::InstanceDescriptor::new_without_display_handle()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("no suitable GPU adapter")?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("scene-ngin device"),
                required_limits: if cfg!(target_arch = "wasm32") {
                    wgpu::Limits::downlevel_webgl2_defaults()
                } else {
                    wgpu::Limits::default()
                },
                ..Default::default()
            })
            .await
            .context("could not open the GPU device")?;
        log::info!("wgpu adapter: {:?}", adapter.get_info().name);
        Ok(Self::from_device(device, queue, width, height))
    }

    /// Wraps an existing device, e.g. one shared with a windowing layer.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue, width: u32, height: u32) -> Self {
        let canvas = create_framebuffer_textures(&device, "canvas", width, height, CANVAS_FORMAT);
        let default_texture = device.create_texture_with_data(
            &queue,
            &wgpu::TextureDescriptor {
                label: Some("default texture"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &[255, 255, 255, 255],
        );
        let default_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("default sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let mut framebuffers = HashMap::new();
        framebuffers.insert(1, canvas);
        Self {
            device,
            queue,
            next_id: 2,
            canvas: RawFramebuffer(1),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers,
            shaders: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            default_texture: default_texture.create_view(&wgpu::TextureViewDescriptor::default()),
            default_sampler,
            bound: BoundState::default(),
            commands: Vec::new(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn allocate(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn pipeline(&mut self, key: PipelineKey) -> Option<wgpu::RenderPipeline> {
        if let Some(pipeline) = self.pipelines.get(&key) {
            return Some(pipeline.clone());
        }
        let program = self.programs.get(&key.program.0)?;
        let reflection = program.link.as_ref().ok()?;
        let (vertex_module, fragment_module) = program.modules.as_ref()?;

        let attributes: Vec<[wgpu::VertexAttribute; 1]> = key
            .vertex
            .iter()
            .map(|(location, _, format)| {
                [wgpu::VertexAttribute {
                    format: *format,
                    offset: 0,
                    shader_location: *location,
                }]
            })
            .collect();
        let layouts: Vec<wgpu::VertexBufferLayout> = key
            .vertex
            .iter()
            .zip(&attributes)
            .map(|((_, stride, _), attributes)| wgpu::VertexBufferLayout {
                array_stride: *stride,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes,
            })
            .collect();

        let (depth_write_enabled, depth_compare) = match key.state.depth_test {
            DepthTestState::Less => (true, wgpu::CompareFunction::Less),
            DepthTestState::None => (false, wgpu::CompareFunction::Always),
        };
        let blend = match key.state.blend {
            BlendState::None => Some(wgpu::BlendState::REPLACE),
            BlendState::PremultipliedAlpha => Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
        };
        let cull_mode = match key.state.culling {
            CullingState::Back => Some(wgpu::Face::Back),
            CullingState::None => None,
        };

        log::debug!("wgpu: creating pipeline for program #{}", key.program.0);
        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            cache: None,
            label: Some("program pipeline"),
            layout: None,
            vertex: wgpu::VertexState {
                module: vertex_module,
                entry_point: Some(&reflection.vertex_entry),
                buffers: &layouts,
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: fragment_module,
                entry_point: Some(&reflection.fragment_entry),
                targets: &[Some(wgpu::ColorTargetState {
                    format: key.color,
                    blend,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: primitive_topology(key.topology),
                strip_index_format: key.strip_index.map(index_format),
                front_face: wgpu::FrontFace::Ccw,
                cull_mode,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: Some(depth_write_enabled),
                depth_compare: Some(depth_compare),
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
        });
        self.pipelines.insert(key, pipeline.clone());
        Some(pipeline)
    }

    /// Resolves the current binding state into a draw, `None` (with a warning) if it is incomplete.
    fn prepare(&mut self, call: DrawCall) -> Option<PreparedDraw> {
        let Some(program_id) = self.bound.program else {
            log::warn!("wgpu: draw without a program");
            return None;
        };
        let reflection = match self.programs.get(&program_id.0).map(|p| &p.link) {
            Some(Ok(reflection)) => reflection.clone(),
            _ => {
                log::warn!("wgpu: program #{} is not linked", program_id.0);
                return None;
            }
        };
        let color = self.framebuffers.get(&call.target.0)?.format;

        let mut vertex = Vec::new();
        let mut vertex_buffers = Vec::new();
        for attribute in &reflection.attributes {
            let Some(binding) = self.bound.attributes.get(&attribute.location) else {
                log::warn!("wgpu: attribute `{}` is not bound, skipping draw", attribute.name);
                return None;
            };
            let Some(format) = vertex_format(binding) else {
                log::warn!("wgpu: attribute `{}` has no vertex format equivalent", attribute.name);
                return None;
            };
            let buffer = self.buffers.get(&binding.buffer.0)?;
            vertex.push((attribute.location, binding.stride as u64, format));
            vertex_buffers.push((buffer.buffer.clone(), binding.offset as u64));
        }
        let index = match self.bound.index_buffer {
            Some((buffer, format)) if call.index_format.is_some() => {
                Some((self.buffers.get(&buffer.0)?.buffer.clone(), index_format(format)))
            }
            _ => None,
        };
        let strip_index = match call.topology {
            Topology::LineStrip | Topology::TriangleStrip => call.index_format,
            _ => None,
        };

        let pipeline = self.pipeline(PipelineKey {
            program: program_id,
            vertex,
            topology: call.topology,
            strip_index,
            state: call.state,
            color,
        })?;
        let bind_groups = self.bind_groups(program_id, &reflection, &pipeline)?;
        Some(PreparedDraw {
            call,
            pipeline,
            bind_groups,
            vertex_buffers,
            index,
        })
    }

    fn bind_groups(
        &self,
        program_id: RawProgram,
        reflection: &ProgramReflection,
        pipeline: &wgpu::RenderPipeline,
    ) -> Option<Vec<wgpu::BindGroup>> {
        let program = self.programs.get(&program_id.0)?;
        let groups = reflection
            .uniforms
            .iter()
            .map(|u| u.group + 1)
            .chain(reflection.blocks.iter().map(|b| b.group + 1))
            .max()
            .unwrap_or(0);

        enum Resource {
            Buffer(wgpu::Buffer),
            Texture(wgpu::TextureView),
            Sampler(wgpu::Sampler),
        }
        let mut resources: BTreeMap<(u32, u32), Resource> = BTreeMap::new();

        for block in &reflection.blocks {
            let mut contents = program
                .blocks
                .get(&block.name)
                .and_then(|b| self.buffers.get(&b.0))
                .map(|b| b.shadow.clone())
                .unwrap_or_default();
            contents.resize(block.size as usize, 0);
            resources.insert(
                (block.group, block.binding),
                Resource::Buffer(self.uniform_buffer(&block.name, contents)),
            );
        }
        let mut unit = 0;
        for uniform in &reflection.uniforms {
            match uniform.ty {
                _ if uniform.block_index.is_some() => (),
                UniformType::Texture(_) => {
                    let view = self
                        .bound
                        .textures
                        .get(&unit)
                        .and_then(|t| self.textures.get(&t.0))
                        .map_or_else(|| self.default_texture.clone(), |t| t.view.clone());
                    resources.insert((uniform.group, uniform.binding), Resource::Texture(view));
                    unit += 1;
                }
                UniformType::Sampler => {
                    resources.insert(
                        (uniform.group, uniform.binding),
                        Resource::Sampler(self.default_sampler.clone()),
                    );
                }
                _ => {
                    let contents = program
                        .uniforms
                        .get(&uniform.name)
                        .map(|value| value.encode(uniform))
                        .unwrap_or_else(|| vec![0; uniform.size as usize]);
                    resources.insert(
                        (uniform.group, uniform.binding),
                        Resource::Buffer(self.uniform_buffer(&uniform.name, contents)),
                    );
                }
            }
        }

        let bind_groups = (0..groups)
            .map(|group| {
                let entries: Vec<wgpu::BindGroupEntry> = resources
                    .range((group, 0)..(group + 1, 0))
                    .map(|((_, binding), resource)| wgpu::BindGroupEntry {
                        binding: *binding,
                        resource: match resource {
                            Resource::Buffer(buffer) => buffer.as_entire_binding(),
                            Resource::Texture(view) => wgpu::BindingResource::TextureView(view),
                            Resource::Sampler(sampler) => wgpu::BindingResource::Sampler(sampler),
                        },
                    })
                    .collect();
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("draw bind group"),
                    layout: &pipeline.get_bind_group_layout(group),
                    entries: &entries,
                })
            })
            .collect();
        Some(bind_groups)
    }

    fn uniform_buffer(&self, label: &str, mut contents: Vec<u8>) -> wgpu::Buffer {
        let padded = contents.len().max(16).next_multiple_of(16);
        contents.resize(padded, 0);
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: &contents,
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }

    fn encode_commands(&mut self) -> Option<wgpu::CommandEncoder> {
        if self.commands.is_empty() {
            return None;
        }
        // consecutive commands on one target share a render pass
        let mut passes: Vec<(RawFramebuffer, Option<ClearState>, Vec<PreparedDraw>)> = Vec::new();
        for command in self.commands.drain(..) {
            match command {
                Command::Clear(target, clear) => passes.push((target, Some(clear), Vec::new())),
                Command::Draw(draw) => match passes.last_mut() {
                    Some((target, _, draws)) if *target == draw.call.target => draws.push(draw),
                    _ => passes.push((draw.call.target, None, vec![draw])),
                },
            }
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame encoder"),
            });
        for (target, clear, draws) in &passes {
            let Some(framebuffer) = self.framebuffers.get(&target.0) else {
                log::warn!("wgpu: framebuffer #{} vanished before flush", target.0);
                continue;
            };
            let (color_load, depth_load) = match clear {
                Some(clear) => (
                    wgpu::LoadOp::Clear(clear.color),
                    wgpu::LoadOp::Clear(clear.depth),
                ),
                None => (wgpu::LoadOp::Load, wgpu::LoadOp::Load),
            };
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &framebuffer.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: color_load,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &framebuffer.depth,
                    depth_ops: Some(wgpu::Operations {
                        load: depth_load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
                multiview_mask: None,
            });
            for draw in draws {
                render_pass.set_pipeline(&draw.pipeline);
                for (group, bind_group) in draw.bind_groups.iter().enumerate() {
                    render_pass.set_bind_group(group as u32, bind_group, &[]);
                }
                for (slot, (buffer, offset)) in draw.vertex_buffers.iter().enumerate() {
                    render_pass.set_vertex_buffer(slot as u32, buffer.slice(*offset..));
                }
                let range = draw.call.first..draw.call.first + draw.call.count;
                match &draw.index {
                    Some((buffer, format)) => {
                        render_pass.set_index_buffer(buffer.slice(..), *format);
                        render_pass.draw_indexed(range, 0, 0..1);
                    }
                    None => render_pass.draw(range, 0..1),
                }
            }
        }
        Some(encoder)
    }
}

fn create_framebuffer_textures(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
) -> WgpuFramebuffer {
    let color = create_texture(device, label, width, height, format);
    let depth = create_depth_texture(device, [width, height], label);
    WgpuFramebuffer {
        view: color.create_view(&wgpu::TextureViewDescriptor::default()),
        color,
        depth,
        format,
        width: width.max(1),
        height: height.max(1),
    }
}

fn create_texture(device: &wgpu::Device, label: &str, width: u32, height: u32, format: wgpu::TextureFormat) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

fn create_depth_texture(device: &wgpu::Device, size: [u32; 2], label: &str) -> wgpu::TextureView {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: size[0].max(1),
            height: size[1].max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[DEPTH_FORMAT],
    });
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
    }
}

fn index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::U16 => wgpu::IndexFormat::Uint16,
        IndexFormat::U32 => wgpu::IndexFormat::Uint32,
    }
}

fn primitive_topology(topology: Topology) -> wgpu::PrimitiveTopology {
    match topology {
        Topology::Points => wgpu::PrimitiveTopology::PointList,
        Topology::Lines => wgpu::PrimitiveTopology::LineList,
        Topology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        Topology::Triangles => wgpu::PrimitiveTopology::TriangleList,
        Topology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

fn vertex_format(binding: &VertexBinding) -> Option<wgpu::VertexFormat> {
    use wgpu::VertexFormat as F;
    let format = match (binding.component_type, binding.components, binding.normalized) {
        (ComponentType::F32, 1, _) => F::Float32,
        (ComponentType::F32, 2, _) => F::Float32x2,
        (ComponentType::F32, 3, _) => F::Float32x3,
        (ComponentType::F32, 4, _) => F::Float32x4,
        (ComponentType::U32, 1, _) => F::Uint32,
        (ComponentType::U32, 2, _) => F::Uint32x2,
        (ComponentType::U32, 3, _) => F::Uint32x3,
        (ComponentType::U32, 4, _) => F::Uint32x4,
        (ComponentType::I32, 1, _) => F::Sint32,
        (ComponentType::I32, 2, _) => F::Sint32x2,
        (ComponentType::I32, 3, _) => F::Sint32x3,
        (ComponentType::I32, 4, _) => F::Sint32x4,
        (ComponentType::U16, 2, true) => F::Unorm16x2,
        (ComponentType::U16, 4, true) => F::Unorm16x4,
        (ComponentType::U16, 2, false) => F::Uint16x2,
        (ComponentType::U16, 4, false) => F::Uint16x4,
        (ComponentType::I16, 2, true) => F::Snorm16x2,
        (ComponentType::I16, 4, true) => F::Snorm16x4,
        (ComponentType::I16, 2, false) => F::Sint16x2,
        (ComponentType::I16, 4, false) => F::Sint16x4,
        (ComponentType::U8, 2, true) => F::Unorm8x2,
        (ComponentType::U8, 4, true) => F::Unorm8x4,
        (ComponentType::U8, 2, false) => F::Uint8x2,
        (ComponentType::U8, 4, false) => F::Uint8x4,
        (ComponentType::I8, 2, true) => F::Snorm8x2,
        (ComponentType::I8, 4, true) => F::Snorm8x4,
        (ComponentType::I8, 2, false) => F::Sint8x2,
        (ComponentType::I8, 4, false) => F::Sint8x4,
        _ => return None,
    };
    Some(format)
}

/// Copies are done in 4 byte units, buffers are sized accordingly.
fn aligned_len(len: usize) -> usize {
    len.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize)
}

impl Gpu for WgpuGpu {
    fn backend_name(&self) -> &'static str {
        "wgpu"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn create_buffer(&mut self, target: BufferTarget, data: &[u8], label: &str) -> Option<RawBuffer> {
        let usage = match target {
            BufferTarget::Array => wgpu::BufferUsages::VERTEX,
            BufferTarget::ElementArray => wgpu::BufferUsages::INDEX,
            BufferTarget::Uniform => wgpu::BufferUsages::UNIFORM,
        };
        let mut shadow = data.to_vec();
        shadow.resize(aligned_len(data.len()), 0);
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: &shadow,
            usage: usage | wgpu::BufferUsages::COPY_DST,
        });
        let id = self.allocate();
        self.buffers.insert(id, WgpuBuffer { buffer, shadow });
        Some(RawBuffer(id))
    }

    fn write_buffer(&mut self, buffer: RawBuffer, offset: u64, data: &[u8]) {
        let Some(target) = self.buffers.get_mut(&buffer.0) else {
            log::warn!("wgpu: write to unknown buffer #{}", buffer.0);
            return;
        };
        let start = offset as usize;
        let end = start + data.len();
        if end > target.shadow.len() {
            log::warn!(
                "wgpu: write of {} bytes at {} overflows buffer #{}",
                data.len(),
                offset,
                buffer.0
            );
            return;
        }
        target.shadow[start..end].copy_from_slice(data);
        let aligned_start = start - start % 4;
        let aligned_end = end.next_multiple_of(4).min(target.shadow.len());
        self.queue.write_buffer(
            &target.buffer,
            aligned_start as u64,
            &target.shadow[aligned_start..aligned_end],
        );
    }

    fn delete_buffer(&mut self, buffer: RawBuffer) {
        if let Some(removed) = self.buffers.remove(&buffer.0) {
            removed.buffer.destroy();
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc, rgba: &[u8]) -> Option<RawTexture> {
        let expected = desc.width as usize * desc.height as usize * 4;
        if !rgba.is_empty() && rgba.len() != expected {
            log::warn!(
                "wgpu: texture `{}` expects {} bytes, got {}",
                desc.label,
                expected,
                rgba.len()
            );
            return None;
        }
        let format = texture_format(desc.format);
        let texture = create_texture(&self.device, &desc.label, desc.width, desc.height, format);
        if !rgba.is_empty() {
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    aspect: wgpu::TextureAspect::All,
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                },
                rgba,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(4 * desc.width),
                    rows_per_image: Some(desc.height),
                },
                texture.size(),
            );
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.allocate();
        self.textures.insert(id, WgpuTexture { texture, view, format });
        Some(RawTexture(id))
    }

    fn delete_texture(&mut self, texture: RawTexture) {
        if let Some(removed) = self.textures.remove(&texture.0) {
            removed.texture.destroy();
        }
    }

    fn canvas(&self) -> RawFramebuffer {
        self.canvas
    }

    fn framebuffer_size(&self, framebuffer: RawFramebuffer) -> (u32, u32) {
        self.framebuffers
            .get(&framebuffer.0)
            .map_or((0, 0), |f| (f.width, f.height))
    }

    fn create_framebuffer(&mut self, color: RawTexture) -> Option<RawFramebuffer> {
        let texture = self.textures.get(&color.0)?;
        let size = texture.texture.size();
        let framebuffer = WgpuFramebuffer {
            color: texture.texture.clone(),
            view: texture.view.clone(),
            depth: create_depth_texture(&self.device, [size.width, size.height], "framebuffer depth"),
            format: texture.format,
            width: size.width,
            height: size.height,
        };
        let id = self.allocate();
        self.framebuffers.insert(id, framebuffer);
        Some(RawFramebuffer(id))
    }

    fn delete_framebuffer(&mut self, framebuffer: RawFramebuffer) {
        if framebuffer != self.canvas {
            self.framebuffers.remove(&framebuffer.0);
        }
    }

    fn clear(&mut self, framebuffer: RawFramebuffer, state: &ClearState) {
        self.commands.push(Command::Clear(framebuffer, *state));
    }

    fn read_pixels(&mut self, framebuffer: RawFramebuffer) -> anyhow::Result<image::RgbaImage> {
        self.flush();
        let target = self
            .framebuffers
            .get(&framebuffer.0)
            .ok_or_else(|| anyhow::anyhow!("unknown framebuffer #{}", framebuffer.0))?;
        let (width, height) = (target.width, target.height);
        let unpadded = 4 * width;
        let padded = unpadded.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            size: (padded * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            label: Some("read_pixels"),
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read_pixels encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                aspect: wgpu::TextureAspect::All,
                texture: &target.color,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &output_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(iter::once(encoder.finish()));

        // the mapping has to be requested before polling, otherwise the wait never ends
        let buffer_slice = output_buffer.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: Some(Duration::from_secs(3)),
            })
            .map_err(|e| anyhow::anyhow!("device poll failed: {:?}", e))?;
        futures::executor::block_on(rx.receive())
            .context("buffer mapping was cancelled")?
            .context("buffer mapping failed")?;

        let data = buffer_slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((unpadded * height) as usize);
        for row in data.chunks(padded as usize).take(height as usize) {
            pixels.extend_from_slice(&row[..unpadded as usize]);
        }
        drop(data);
        output_buffer.unmap();
        image::RgbaImage::from_raw(width, height, pixels).context("readback has an unexpected size")
    }

    fn create_shader(&mut self, stage: ShaderStage, source: &str) -> Option<RawShader> {
        let id = self.allocate();
        self.shaders.insert(
            id,
            WgpuShader {
                source: source.to_string(),
                compiled: reflect::compile(stage, source),
            },
        );
        Some(RawShader(id))
    }

    fn shader_compile_status(&self, shader: RawShader) -> Result<(), String> {
        match self.shaders.get(&shader.0).map(|s| &s.compiled) {
            Some(Ok(_)) => Ok(()),
            Some(Err(log)) => Err(log.clone()),
            None => Err(format!("unknown shader #{}", shader.0)),
        }
    }

    fn delete_shader(&mut self, shader: RawShader) {
        self.shaders.remove(&shader.0);
    }

    fn create_program(&mut self, vertex: RawShader, fragment: RawShader) -> Option<RawProgram> {
        let (vs, fs) = (self.shaders.get(&vertex.0)?, self.shaders.get(&fragment.0)?);
        let (link, modules) = match (&vs.compiled, &fs.compiled) {
            (Ok(vs_module), Ok(fs_module)) => {
                let link = reflect::link(vs_module, fs_module);
                let modules = link.is_ok().then(|| {
                    let module = |source: &str| {
                        self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                            label: Some("program stage"),
                            source: wgpu::ShaderSource::Wgsl(source.to_string().into()),
                        })
                    };
                    (module(&vs.source), module(&fs.source))
                });
                (link, modules)
            }
            _ => (Err("attached shaders did not compile".to_string()), None),
        };
        let id = self.allocate();
        self.programs.insert(
            id,
            WgpuProgram {
                link,
                modules,
                uniforms: BTreeMap::new(),
                blocks: BTreeMap::new(),
            },
        );
        Some(RawProgram(id))
    }

    fn program_link_status(&mut self, program: RawProgram, _wait: bool) -> LinkStatus {
        match self.programs.get(&program.0).map(|p| &p.link) {
            Some(Ok(_)) => LinkStatus::Linked,
            Some(Err(log)) => LinkStatus::Failed(log.clone()),
            None => LinkStatus::Failed(format!("unknown program #{}", program.0)),
        }
    }

    fn delete_program(&mut self, program: RawProgram) {
        self.programs.remove(&program.0);
        self.pipelines.retain(|key, _| key.program != program);
        if self.bound.program == Some(program) {
            self.bound.program = None;
        }
    }

    fn active_uniforms(&self, program: RawProgram) -> Vec<ActiveUniform> {
        match self.programs.get(&program.0).map(|p| &p.link) {
            Some(Ok(reflection)) => reflection.uniforms.clone(),
            _ => Vec::new(),
        }
    }

    fn active_uniform_blocks(&self, program: RawProgram) -> Vec<ActiveUniformBlock> {
        match self.programs.get(&program.0).map(|p| &p.link) {
            Some(Ok(reflection)) => reflection.blocks.clone(),
            _ => Vec::new(),
        }
    }

    fn active_attributes(&self, program: RawProgram) -> Vec<ActiveAttribute> {
        match self.programs.get(&program.0).map(|p| &p.link) {
            Some(Ok(reflection)) => reflection.attributes.clone(),
            _ => Vec::new(),
        }
    }

    fn use_program(&mut self, program: RawProgram) {
        self.bound.program = Some(program);
    }

    fn set_uniform(&mut self, program: RawProgram, uniform: &ActiveUniform, value: &UniformData) {
        if let Some(entry) = self.programs.get_mut(&program.0) {
            entry.uniforms.insert(uniform.name.clone(), value.clone());
        }
    }

    fn bind_uniform_block(&mut self, program: RawProgram, block: &ActiveUniformBlock, buffer: RawBuffer) {
        if let Some(entry) = self.programs.get_mut(&program.0) {
            entry.blocks.insert(block.name.clone(), buffer);
        }
    }

    fn bind_texture(&mut self, unit: u32, texture: RawTexture) {
        self.bound.textures.insert(unit, texture);
    }

    fn bind_vertex_attribute(&mut self, location: u32, binding: VertexBinding) {
        self.bound.attributes.insert(location, binding);
    }

    fn unbind_vertex_attribute(&mut self, location: u32) {
        self.bound.attributes.remove(&location);
    }

    fn bind_index_buffer(&mut self, index: Option<(RawBuffer, IndexFormat)>) {
        self.bound.index_buffer = index;
    }

    fn draw(&mut self, call: DrawCall) {
        if let Some(draw) = self.prepare(call) {
            self.commands.push(Command::Draw(draw));
        }
    }

    fn flush(&mut self) {
        if let Some(encoder) = self.encode_commands() {
            self.queue.submit(iter::once(encoder.finish()));
        }
    }

    fn poll(&mut self) {
        if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
            log::warn!("wgpu: device poll failed: {:?}", e);
        }
    }
}
