//! In-memory [`Gpu`] backend.
//!
//! Objects are plain host memory, shaders are compiled and linked with the same reflection code
//! the wgpu backend uses, and every draw is recorded together with a snapshot of the bound state.
//! Link latency and creation failures can be configured to exercise the asynchronous paths of
//! the program layer.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap, HashSet},
};

use super::{
    ActiveAttribute, ActiveUniform, ActiveUniformBlock, BufferTarget, ClearState, DrawCall, Gpu,
    IndexFormat, LinkStatus, RawBuffer, RawFramebuffer, RawProgram, RawShader, RawTexture,
    ShaderStage, TextureDesc, UniformData, VertexBinding,
    reflect::{self, CompiledModule, ProgramReflection},
};
use crate::error::ResourceKind;

/// Object counters, useful to assert on leaks and redundant uploads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GpuStats {
    pub buffers_created: u32,
    pub buffers_deleted: u32,
    pub buffer_writes: u32,
    pub textures_created: u32,
    pub textures_deleted: u32,
    pub shaders_created: u32,
    pub shaders_deleted: u32,
    pub programs_created: u32,
    pub programs_deleted: u32,
    pub framebuffers_created: u32,
    pub framebuffers_deleted: u32,
}

/// A draw and the state it was issued with.
#[derive(Clone, Debug)]
pub struct RecordedDraw {
    pub call: DrawCall,
    pub program: Option<RawProgram>,
    /// Loose uniform values by name.
    pub uniforms: BTreeMap<String, UniformData>,
    /// Contents of the buffer bound to each uniform block, by block name.
    pub blocks: BTreeMap<String, Vec<u8>>,
    pub attributes: BTreeMap<u32, VertexBinding>,
    pub index_buffer: Option<(RawBuffer, IndexFormat)>,
    pub textures: BTreeMap<u32, RawTexture>,
}

impl RecordedDraw {
    /// Reads `N` floats from a block snapshot at `offset`.
    pub fn block_f32s<const N: usize>(&self, block: &str, offset: u32) -> Option<[f32; N]> {
        let bytes = self.blocks.get(block)?;
        let start = offset as usize;
        let slice = bytes.get(start..start + N * 4)?;
        let mut out = [0.0; N];
        for (value, chunk) in out.iter_mut().zip(slice.chunks_exact(4)) {
            *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(out)
    }
}

#[derive(Debug)]
struct HeadlessBuffer {
    data: Vec<u8>,
}

#[derive(Debug)]
struct HeadlessFramebuffer {
    width: u32,
    height: u32,
    color: Option<RawTexture>,
    clear: ClearState,
}

#[derive(Debug)]
struct HeadlessShader {
    compiled: Result<CompiledModule, String>,
}

#[derive(Debug)]
struct HeadlessProgram {
    ticks_remaining: u32,
    link: Result<ProgramReflection, String>,
    uniforms: BTreeMap<String, UniformData>,
    blocks: BTreeMap<String, RawBuffer>,
}

#[derive(Debug, Default)]
struct BoundState {
    program: Option<RawProgram>,
    attributes: BTreeMap<u32, VertexBinding>,
    index_buffer: Option<(RawBuffer, IndexFormat)>,
    textures: BTreeMap<u32, RawTexture>,
}

#[derive(Debug)]
pub struct HeadlessGpu {
    next_id: u32,
    canvas: RawFramebuffer,
    link_latency: u32,
    failing: HashSet<ResourceKind>,
    buffers: HashMap<u32, HeadlessBuffer>,
    textures: HashMap<u32, TextureDesc>,
    framebuffers: HashMap<u32, HeadlessFramebuffer>,
    shaders: HashMap<u32, HeadlessShader>,
    programs: HashMap<u32, HeadlessProgram>,
    bound: BoundState,
    pending: Vec<RecordedDraw>,
    draws: Vec<RecordedDraw>,
    flushes: u32,
    stats: GpuStats,
}

impl HeadlessGpu {
    pub fn new(width: u32, height: u32) -> Self {
        let mut framebuffers = HashMap::new();
        framebuffers.insert(
            1,
            HeadlessFramebuffer {
                width: width.max(1),
                height: height.max(1),
                color: None,
                clear: ClearState::default(),
            },
        );
        Self {
            next_id: 2,
            canvas: RawFramebuffer(1),
            link_latency: 0,
            failing: HashSet::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers,
            shaders: HashMap::new(),
            programs: HashMap::new(),
            bound: BoundState::default(),
            pending: Vec::new(),
            draws: Vec::new(),
            flushes: 0,
            stats: GpuStats::default(),
        }
    }

    /// Number of [`Gpu::poll`] calls a program link takes to complete.
    pub fn with_link_latency(mut self, ticks: u32) -> Self {
        self.link_latency = ticks;
        self
    }

    /// Makes every creation of `kind` return no handle until cleared.
    pub fn fail_creation(&mut self, kind: ResourceKind, failing: bool) {
        if failing {
            self.failing.insert(kind);
        } else {
            self.failing.remove(&kind);
        }
    }

    pub fn stats(&self) -> &GpuStats {
        &self.stats
    }

    /// Draws submitted by [`Gpu::flush`] so far.
    pub fn draws(&self) -> &[RecordedDraw] {
        &self.draws
    }

    pub fn take_draws(&mut self) -> Vec<RecordedDraw> {
        std::mem::take(&mut self.draws)
    }

    pub fn flushes(&self) -> u32 {
        self.flushes
    }

    pub fn buffer_data(&self, buffer: RawBuffer) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_shaders(&self) -> usize {
        self.shaders.len()
    }

    pub fn last_clear(&self, framebuffer: RawFramebuffer) -> Option<ClearState> {
        self.framebuffers.get(&framebuffer.0).map(|f| f.clear)
    }

    /// Colour attachment of an offscreen framebuffer.
    pub fn framebuffer_color(&self, framebuffer: RawFramebuffer) -> Option<RawTexture> {
        self.framebuffers.get(&framebuffer.0).and_then(|f| f.color)
    }

    fn allocate(&mut self, kind: ResourceKind) -> Option<u32> {
        if self.failing.contains(&kind) {
            log::debug!("headless: refusing to create {}", kind);
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        Some(id)
    }

    fn reflection(&self, program: RawProgram) -> Option<&ProgramReflection> {
        self.programs
            .get(&program.0)
            .filter(|p| p.ticks_remaining == 0)
            .and_then(|p| p.link.as_ref().ok())
    }
}

impl Gpu for HeadlessGpu {
    fn backend_name(&self) -> &'static str {
        "headless"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn create_buffer(&mut self, _target: BufferTarget, data: &[u8], label: &str) -> Option<RawBuffer> {
        let id = self.allocate(ResourceKind::Buffer)?;
        log::trace!("headless: buffer #{} `{}` ({} bytes)", id, label, data.len());
        self.buffers.insert(id, HeadlessBuffer { data: data.to_vec() });
        self.stats.buffers_created += 1;
        Some(RawBuffer(id))
    }

    fn write_buffer(&mut self, buffer: RawBuffer, offset: u64, data: &[u8]) {
        let Some(target) = self.buffers.get_mut(&buffer.0) else {
            log::warn!("headless: write to unknown buffer #{}", buffer.0);
            return;
        };
        let start = offset as usize;
        if target.data.len() < start + data.len() {
            target.data.resize(start + data.len(), 0);
        }
        target.data[start..start + data.len()].copy_from_slice(data);
        self.stats.buffer_writes += 1;
    }

    fn delete_buffer(&mut self, buffer: RawBuffer) {
        if self.buffers.remove(&buffer.0).is_some() {
            self.stats.buffers_deleted += 1;
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc, rgba: &[u8]) -> Option<RawTexture> {
        let expected = desc.width as usize * desc.height as usize * 4;
        if !rgba.is_empty() && rgba.len() != expected {
            log::warn!(
                "headless: texture `{}` expects {} bytes, got {}",
                desc.label,
                expected,
                rgba.len()
            );
            return None;
        }
        let id = self.allocate(ResourceKind::Texture)?;
        self.textures.insert(id, desc.clone());
        self.stats.textures_created += 1;
        Some(RawTexture(id))
    }

    fn delete_texture(&mut self, texture: RawTexture) {
        if self.textures.remove(&texture.0).is_some() {
            self.stats.textures_deleted += 1;
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
        let (width, height) = self
            .textures
            .get(&color.0)
            .map(|t| (t.width, t.height))?;
        let id = self.allocate(ResourceKind::Framebuffer)?;
        self.framebuffers.insert(
            id,
            HeadlessFramebuffer {
                width,
                height,
                color: Some(color),
                clear: ClearState::default(),
            },
        );
        self.stats.framebuffers_created += 1;
        Some(RawFramebuffer(id))
    }

    fn delete_framebuffer(&mut self, framebuffer: RawFramebuffer) {
        if framebuffer != self.canvas && self.framebuffers.remove(&framebuffer.0).is_some() {
            self.stats.framebuffers_deleted += 1;
        }
    }

    fn clear(&mut self, framebuffer: RawFramebuffer, state: &ClearState) {
        if let Some(target) = self.framebuffers.get_mut(&framebuffer.0) {
            target.clear = *state;
        }
    }

    fn read_pixels(&mut self, framebuffer: RawFramebuffer) -> anyhow::Result<image::RgbaImage> {
        let target = self
            .framebuffers
            .get(&framebuffer.0)
            .ok_or_else(|| anyhow::anyhow!("unknown framebuffer #{}", framebuffer.0))?;
        let to_u8 = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        let color = target.clear.color;
        Ok(image::RgbaImage::from_pixel(
            target.width,
            target.height,
            image::Rgba([to_u8(color.r), to_u8(color.g), to_u8(color.b), to_u8(color.a)]),
        ))
    }

    fn create_shader(&mut self, stage: ShaderStage, source: &str) -> Option<RawShader> {
        let id = self.allocate(ResourceKind::Shader)?;
        self.shaders.insert(
            id,
            HeadlessShader {
                compiled: reflect::compile(stage, source),
            },
        );
        self.stats.shaders_created += 1;
        Some(RawShader(id))
    }

    fn shader_compile_status(&self, shader: RawShader) -> Result<(), String> {
        match self.shaders.get(&shader.0) {
            Some(HeadlessShader { compiled: Ok(_) }) => Ok(()),
            Some(HeadlessShader { compiled: Err(log) }) => Err(log.clone()),
            None => Err(format!("unknown shader #{}", shader.0)),
        }
    }

    fn delete_shader(&mut self, shader: RawShader) {
        if self.shaders.remove(&shader.0).is_some() {
            self.stats.shaders_deleted += 1;
        }
    }

    fn create_program(&mut self, vertex: RawShader, fragment: RawShader) -> Option<RawProgram> {
        let link = match (self.shaders.get(&vertex.0), self.shaders.get(&fragment.0)) {
            (Some(HeadlessShader { compiled: Ok(vs) }), Some(HeadlessShader { compiled: Ok(fs) })) => {
                reflect::link(vs, fs)
            }
            (Some(_), Some(_)) => Err("attached shaders did not compile".to_string()),
            _ => Err("program references a deleted shader".to_string()),
        };
        let id = self.allocate(ResourceKind::Program)?;
        self.programs.insert(
            id,
            HeadlessProgram {
                ticks_remaining: self.link_latency,
                link,
                uniforms: BTreeMap::new(),
                blocks: BTreeMap::new(),
            },
        );
        self.stats.programs_created += 1;
        Some(RawProgram(id))
    }

    fn program_link_status(&mut self, program: RawProgram, wait: bool) -> LinkStatus {
        let Some(entry) = self.programs.get_mut(&program.0) else {
            return LinkStatus::Failed(format!("unknown program #{}", program.0));
        };
        if wait {
            entry.ticks_remaining = 0;
        }
        match (&entry.link, entry.ticks_remaining) {
            (_, 1..) => LinkStatus::Pending,
            (Ok(_), 0) => LinkStatus::Linked,
            (Err(log), 0) => LinkStatus::Failed(log.clone()),
        }
    }

    fn delete_program(&mut self, program: RawProgram) {
        if self.programs.remove(&program.0).is_some() {
            self.stats.programs_deleted += 1;
        }
        if self.bound.program == Some(program) {
            self.bound.program = None;
        }
    }

    fn active_uniforms(&self, program: RawProgram) -> Vec<ActiveUniform> {
        self.reflection(program)
            .map(|r| r.uniforms.clone())
            .unwrap_or_default()
    }

    fn active_uniform_blocks(&self, program: RawProgram) -> Vec<ActiveUniformBlock> {
        self.reflection(program)
            .map(|r| r.blocks.clone())
            .unwrap_or_default()
    }

    fn active_attributes(&self, program: RawProgram) -> Vec<ActiveAttribute> {
        self.reflection(program)
            .map(|r| r.attributes.clone())
            .unwrap_or_default()
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
        let program = self.bound.program.and_then(|p| self.programs.get(&p.0));
        let uniforms = program.map(|p| p.uniforms.clone()).unwrap_or_default();
        let blocks = program
            .map(|p| {
                p.blocks
                    .iter()
                    .filter_map(|(name, buffer)| {
                        self.buffers
                            .get(&buffer.0)
                            .map(|b| (name.clone(), b.data.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.pending.push(RecordedDraw {
            call,
            program: self.bound.program,
            uniforms,
            blocks,
            attributes: self.bound.attributes.clone(),
            index_buffer: self.bound.index_buffer,
            textures: self.bound.textures.clone(),
        });
    }

    fn flush(&mut self) {
        self.flushes += 1;
        self.draws.append(&mut self.pending);
    }

    fn poll(&mut self) {
        for program in self.programs.values_mut() {
            program.ticks_remaining = program.ticks_remaining.saturating_sub(1);
        }
    }
}
