//! Linked shader programs and per-draw binding.
//!
//! A [`Program`] starts out [`ProgramState::LinkedUnvalidated`]: both stages were submitted and
//! the link is in flight on the driver side. [`Program::poll_validation`] checks the link status
//! without blocking, [`Program::validate`] waits for it. Either moves the program to
//! `Validated` or `Failed`; a failed program deletes its device objects and keeps the diagnostic.
//!
//! Reflection (uniforms, uniform blocks, attributes) is read once after validation and cached.
//! Texture uniforms get consecutive texture units in reflection order. Uniforms that live in a
//! uniform block are written into a per-block staging buffer at their reflected offset and the
//! block buffer is uploaded and bound before the draw.

use std::{
    cell::{OnceCell, RefCell},
    collections::BTreeMap,
    rc::Rc,
};

use crate::{
    Error, Result,
    context::{Context, GpuState},
    data_structures::material::ShaderMaterial,
    error::{CompileLinkError, ResourceKind},
    gpu::{
        ActiveAttribute, ActiveUniform, ActiveUniformBlock, BufferTarget, LinkStatus, RawProgram,
        ShaderStage,
    },
    render::{
        buffer::Buffer,
        buffer_geometry::BufferGeometry,
        shader::Shader,
        uniforms::{UniformValue, UniformValueMap},
        vertex_array::VertexArrayObject,
    },
    resources::{
        cache::ResourceRef,
        registry::{RawHandle, Registration},
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgramState {
    /// Submitted for linking, status not checked yet.
    LinkedUnvalidated,
    Validated,
    Failed(CompileLinkError),
}

/// A reflected uniform and the texture unit assigned to it, if it is a texture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramUniform {
    pub active: ActiveUniform,
    pub texture_unit: Option<u32>,
}

impl ProgramUniform {
    pub fn is_block_member(&self) -> bool {
        self.active.block_index.is_some()
    }
}

#[derive(Debug, Default)]
struct Reflection {
    uniforms: BTreeMap<String, ProgramUniform>,
    blocks: Vec<ActiveUniformBlock>,
    attributes: BTreeMap<String, ActiveAttribute>,
    texture_units: u32,
}

#[derive(Debug)]
struct BlockStorage {
    buffer: Option<Buffer>,
    staging: Vec<u8>,
    dirty: bool,
}

/// Where the vertex inputs of a draw come from.
#[derive(Clone, Copy, Debug)]
pub enum AttributeSource<'a> {
    Geometry(&'a BufferGeometry),
    VertexArray(&'a VertexArrayObject),
}

impl<'a> From<&'a BufferGeometry> for AttributeSource<'a> {
    fn from(geometry: &'a BufferGeometry) -> Self {
        AttributeSource::Geometry(geometry)
    }
}

impl<'a> From<&'a VertexArrayObject> for AttributeSource<'a> {
    fn from(vao: &'a VertexArrayObject) -> Self {
        AttributeSource::VertexArray(vao)
    }
}

#[derive(Debug)]
pub struct Program {
    registration: Registration,
    raw: RawProgram,
    name: String,
    vertex: Shader,
    fragment: Shader,
    state: RefCell<ProgramState>,
    reflection: OnceCell<Reflection>,
    blocks: RefCell<BTreeMap<u32, BlockStorage>>,
}

impl Program {
    /// Compiles both stages and submits the link. Link errors are reported by validation.
    pub fn new(state: &Rc<GpuState>, material: &ShaderMaterial) -> Result<Self> {
        let vertex = Shader::new(state, ShaderStage::Vertex, &material.vertex_source, &material.name)?;
        let fragment = match Shader::new(state, ShaderStage::Fragment, &material.fragment_source, &material.name) {
            Ok(fragment) => fragment,
            Err(e) => {
                vertex.dispose();
                return Err(e);
            }
        };
        let raw = state.gpu().create_program(vertex.raw()?, fragment.raw()?);
        let Some(raw) = raw else {
            vertex.dispose();
            fragment.dispose();
            return Err(Error::creation(ResourceKind::Program, material.name.as_str()));
        };
        Ok(Self {
            registration: Registration::new(state, RawHandle::Program(raw), &material.name),
            raw,
            name: material.name.clone(),
            vertex,
            fragment,
            state: RefCell::new(ProgramState::LinkedUnvalidated),
            reflection: OnceCell::new(),
            blocks: RefCell::new(BTreeMap::new()),
        })
    }

    /// Acquires the program for `material` through the context's program cache.
    ///
    /// With asynchronous links the returned reference resolves once the link status is known,
    /// which takes at least one tick of [`Context::run_pending`].
    pub fn acquire(ctx: &Context, material: &ShaderMaterial) -> ResourceRef<Program> {
        Self::acquire_as(ctx, &material.key(), material)
    }

    /// Like [`Program::acquire`] under an explicit cache key.
    pub fn acquire_as(ctx: &Context, key: &str, material: &ShaderMaterial) -> ResourceRef<Program> {
        let state = ctx.state().clone();
        let ticker = ctx.ticker();
        let async_links = ctx.config.async_program_links;
        ctx.program_cache.acquire_ref(key, move |_| {
            let program = Program::new(&state, material);
            let program = program.and_then(|p| {
                if !async_links {
                    p.validate()?;
                }
                Ok(p)
            });
            async move {
                let program = program?;
                while !program.poll_validation()? {
                    ticker.next_tick().await;
                }
                Ok(program)
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw(&self) -> Result<RawProgram> {
        self.registration.ensure_live()?;
        Ok(self.raw)
    }

    pub fn state(&self) -> ProgramState {
        self.state.borrow().clone()
    }

    pub fn is_validated(&self) -> bool {
        *self.state.borrow() == ProgramState::Validated
    }

    /// Checks the link without blocking. `Ok(false)` while the driver is still linking.
    pub fn poll_validation(&self) -> Result<bool> {
        self.check_link(false)
    }

    /// Waits for the link result.
    pub fn validate(&self) -> Result<()> {
        self.check_link(true).map(|_| ())
    }

    fn check_link(&self, wait: bool) -> Result<bool> {
        match &*self.state.borrow() {
            ProgramState::Validated => return Ok(true),
            ProgramState::Failed(e) => return Err(e.clone().into()),
            ProgramState::LinkedUnvalidated => (),
        }
        let raw = self.raw()?;
        let status = self.registration.state().gpu().program_link_status(raw, wait);
        match status {
            LinkStatus::Pending => Ok(false),
            LinkStatus::Linked => {
                log::debug!("program `{}` validated", self.name);
                *self.state.borrow_mut() = ProgramState::Validated;
                Ok(true)
            }
            LinkStatus::Failed(log) => {
                let error = [&self.vertex, &self.fragment]
                    .into_iter()
                    .find_map(|shader| {
                        shader.compile_log().map(|log| CompileLinkError::Compile {
                            stage: shader.stage().name(),
                            log,
                        })
                    })
                    .unwrap_or(CompileLinkError::Link { log });
                log::warn!("program `{}` failed: {}", self.name, error);
                *self.state.borrow_mut() = ProgramState::Failed(error.clone());
                self.dispose();
                Err(error.into())
            }
        }
    }

    fn reflection(&self) -> Result<&Reflection> {
        if let Some(reflection) = self.reflection.get() {
            return Ok(reflection);
        }
        self.validate()?;
        Ok(self.reflection.get_or_init(|| self.reflect()))
    }

    fn reflect(&self) -> Reflection {
        let gpu = self.registration.state().gpu();
        let mut reflection = Reflection {
            blocks: gpu.active_uniform_blocks(self.raw),
            ..Default::default()
        };
        for active in gpu.active_uniforms(self.raw) {
            let texture_unit = match active.ty.texture_units() {
                0 => None,
                n => {
                    let unit = reflection.texture_units;
                    reflection.texture_units += n;
                    Some(unit)
                }
            };
            reflection
                .uniforms
                .insert(active.name.clone(), ProgramUniform { active, texture_unit });
        }
        for attribute in gpu.active_attributes(self.raw) {
            reflection.attributes.insert(attribute.name.clone(), attribute);
        }
        log::trace!(
            "program `{}`: {} uniforms, {} blocks, {} attributes",
            self.name,
            reflection.uniforms.len(),
            reflection.blocks.len(),
            reflection.attributes.len()
        );
        reflection
    }

    pub fn uniforms(&self) -> Result<&BTreeMap<String, ProgramUniform>> {
        Ok(&self.reflection()?.uniforms)
    }

    pub fn uniform(&self, name: &str) -> Result<Option<&ProgramUniform>> {
        Ok(self.reflection()?.uniforms.get(name))
    }

    pub fn uniform_blocks(&self) -> Result<&[ActiveUniformBlock]> {
        Ok(&self.reflection()?.blocks)
    }

    pub fn attributes(&self) -> Result<&BTreeMap<String, ActiveAttribute>> {
        Ok(&self.reflection()?.attributes)
    }

    pub fn use_program(&self) -> Result<()> {
        self.reflection()?;
        self.registration.state().gpu().use_program(self.raw);
        Ok(())
    }

    /// Sets every supplied value the program declares. Unknown names are ignored.
    pub fn set_uniform_values(&self, values: &UniformValueMap) -> Result<()> {
        self.set_uniform_value_maps(&[values])
    }

    /// Like [`Program::set_uniform_values`] for several maps. Later maps win on name clashes and
    /// block buffers are uploaded once at the end.
    pub fn set_uniform_value_maps(&self, maps: &[&UniformValueMap]) -> Result<()> {
        let reflection = self.reflection()?;
        let raw = self.raw()?;
        let state = self.registration.state();
        for (name, value) in maps.iter().flat_map(|map| map.iter()) {
            let Some(uniform) = reflection.uniforms.get(name) else {
                log::trace!("program `{}` has no uniform `{}`", self.name, name);
                continue;
            };
            match (value, uniform.texture_unit) {
                (UniformValue::Texture(texture), Some(unit)) => {
                    let texture = texture.raw()?;
                    state.gpu().bind_texture(unit, texture);
                }
                (UniformValue::Data(data), None) if !uniform.active.ty.is_sampler_like() => {
                    match uniform.active.block_index {
                        Some(block) => self.stage_block_value(reflection, block, &uniform.active, data.encode(&uniform.active)),
                        None => state.gpu().set_uniform(raw, &uniform.active, data),
                    }
                }
                (UniformValue::Texture(_), None) => {
                    return Err(Error::BindingMismatch(format!(
                        "`{}` of program `{}` is not a texture uniform",
                        name, self.name
                    )));
                }
                (UniformValue::Data(_), _) => {
                    return Err(Error::BindingMismatch(format!(
                        "`{}` of program `{}` only accepts a texture",
                        name, self.name
                    )));
                }
            }
        }
        self.flush_blocks(reflection, raw)
    }

    fn stage_block_value(&self, reflection: &Reflection, block: u32, uniform: &ActiveUniform, bytes: Vec<u8>) {
        let mut blocks = self.blocks.borrow_mut();
        let size = reflection
            .blocks
            .iter()
            .find(|b| b.index == block)
            .map_or(0, |b| b.size as usize);
        let storage = blocks.entry(block).or_insert_with(|| BlockStorage {
            buffer: None,
            staging: vec![0; size],
            dirty: true,
        });
        let start = uniform.offset as usize;
        let end = (start + bytes.len()).min(storage.staging.len());
        if start < end && storage.staging[start..end] != bytes[..end - start] {
            storage.staging[start..end].copy_from_slice(&bytes[..end - start]);
            storage.dirty = true;
        }
    }

    fn flush_blocks(&self, reflection: &Reflection, raw: RawProgram) -> Result<()> {
        let state = self.registration.state();
        let mut blocks = self.blocks.borrow_mut();
        for (index, storage) in blocks.iter_mut() {
            let Some(block) = reflection.blocks.iter().find(|b| b.index == *index) else {
                continue;
            };
            if storage.buffer.is_none() {
                let label = format!("{}::{}", self.name, block.name);
                storage.buffer = Some(Buffer::new(state, BufferTarget::Uniform, &storage.staging, &label)?);
                storage.dirty = false;
            }
            let Some(buffer) = &storage.buffer else {
                continue;
            };
            if storage.dirty {
                buffer.write(&storage.staging)?;
                storage.dirty = false;
            }
            let buffer = buffer.raw()?;
            state.gpu().bind_uniform_block(raw, block, buffer);
        }
        Ok(())
    }

    /// Binds every reflected attribute from `source`. Attributes the source lacks stay unbound.
    pub fn set_attribute_buffers<'a>(&self, source: impl Into<AttributeSource<'a>>) -> Result<()> {
        let reflection = self.reflection()?;
        let state = self.registration.state();
        match source.into() {
            AttributeSource::Geometry(geometry) => {
                for (name, attribute) in &reflection.attributes {
                    match geometry.vertex_binding(name)? {
                        Some(binding) => state.gpu().bind_vertex_attribute(attribute.location, binding),
                        None => {
                            log::trace!("program `{}`: attribute `{}` left unbound", self.name, name);
                            state.gpu().unbind_vertex_attribute(attribute.location);
                        }
                    }
                }
                let index = geometry.index_binding()?;
                state.gpu().bind_index_buffer(index);
            }
            AttributeSource::VertexArray(vao) => {
                if vao.program_id() != self.registration.id().value() {
                    return Err(Error::BindingMismatch(format!(
                        "vertex array was built for another program than `{}`",
                        self.name
                    )));
                }
                let mut gpu = state.gpu();
                for attribute in reflection.attributes.values() {
                    match vao.binding(attribute.location) {
                        Some(binding) => gpu.bind_vertex_attribute(attribute.location, binding),
                        None => gpu.unbind_vertex_attribute(attribute.location),
                    }
                }
                gpu.bind_index_buffer(vao.index());
            }
        }
        Ok(())
    }

    pub(crate) fn registration_id(&self) -> u64 {
        self.registration.id().value()
    }

    pub fn is_disposed(&self) -> bool {
        self.registration.is_disposed()
    }

    /// Deletes the program, its shaders and its uniform block buffers.
    pub fn dispose(&self) {
        if self.registration.dispose() {
            log::debug!("program `{}` disposed", self.name);
        }
        self.vertex.dispose();
        self.fragment.dispose();
        for storage in self.blocks.borrow().values() {
            if let Some(buffer) = &storage.buffer {
                buffer.dispose();
            }
        }
    }
}
