//! WGSL compilation, link checks and program introspection on top of `naga`.
//!
//! Mapping of WGSL declarations onto the uniform model used by the program layer:
//!
//! - a `var<uniform>` whose type is a struct is a uniform block; each member becomes a uniform
//!   carrying the block index and its byte offset inside the block
//! - any other `var<uniform>` is a loose uniform
//! - `texture_*` globals are sampler-typed uniforms, `sampler` globals are sampler-state uniforms
//! - `@location` arguments of the vertex entry point (directly or as struct members) are attributes
//!
//! Only globals referenced by the selected entry points are reported, the same way a GL driver
//! only reports active uniforms.

use std::collections::{BTreeSet, HashSet};

use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};

use super::{
    ActiveAttribute, ActiveUniform, ActiveUniformBlock, ScalarKind, ShaderStage,
    TextureDimension, UniformType,
};

/// A parsed and validated shader stage.
#[derive(Debug)]
pub struct CompiledModule {
    pub stage: ShaderStage,
    pub module: naga::Module,
    pub info: ModuleInfo,
}

impl CompiledModule {
    fn entry_point(&self) -> Option<(usize, &naga::EntryPoint)> {
        let stage = naga_stage(self.stage);
        self.module
            .entry_points
            .iter()
            .enumerate()
            .find(|(_, ep)| ep.stage == stage)
    }
}

/// Result of a successful link.
#[derive(Clone, Debug, Default)]
pub struct ProgramReflection {
    pub vertex_entry: String,
    pub fragment_entry: String,
    pub uniforms: Vec<ActiveUniform>,
    pub blocks: Vec<ActiveUniformBlock>,
    pub attributes: Vec<ActiveAttribute>,
}

fn naga_stage(stage: ShaderStage) -> naga::ShaderStage {
    match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
    }
}

/// Parses and validates one stage. The error string is the rendered diagnostic.
pub fn compile(stage: ShaderStage, source: &str) -> Result<CompiledModule, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;
    let info = Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| e.emit_to_string(source))?;
    let compiled = CompiledModule {
        stage,
        module,
        info,
    };
    if compiled.entry_point().is_none() {
        return Err(format!("no @{} entry point found", stage));
    }
    Ok(compiled)
}

/// Collects the `@location` bindings of an entry-point interface (arguments or result).
fn locations(module: &naga::Module, ty: naga::Handle<naga::Type>, binding: Option<&naga::Binding>, name: Option<&str>, out: &mut Vec<(String, u32, naga::Handle<naga::Type>)>) {
    match binding {
        Some(naga::Binding::Location { location, .. }) => {
            out.push((name.unwrap_or_default().to_string(), *location, ty));
        }
        Some(naga::Binding::BuiltIn(_)) => (),
        None => {
            if let naga::TypeInner::Struct { members, .. } = &module.types[ty].inner {
                for member in members {
                    locations(module, member.ty, member.binding.as_ref(), member.name.as_deref(), out);
                }
            }
        }
    }
}

/// Checks that both stages fit together and reflects the program interface.
pub fn link(vertex: &CompiledModule, fragment: &CompiledModule) -> Result<ProgramReflection, String> {
    let (vs_index, vs_entry) = vertex
        .entry_point()
        .ok_or_else(|| "vertex shader has no @vertex entry point".to_string())?;
    let (fs_index, fs_entry) = fragment
        .entry_point()
        .ok_or_else(|| "fragment shader has no @fragment entry point".to_string())?;

    let mut written = Vec::new();
    if let Some(result) = &vs_entry.function.result {
        locations(&vertex.module, result.ty, result.binding.as_ref(), None, &mut written);
    }
    let written: HashSet<u32> = written.into_iter().map(|(_, location, _)| location).collect();
    let mut read = Vec::new();
    for argument in &fs_entry.function.arguments {
        locations(&fragment.module, argument.ty, argument.binding.as_ref(), argument.name.as_deref(), &mut read);
    }
    for (name, location, _) in &read {
        if !written.contains(location) {
            return Err(format!(
                "fragment input `{}` at location {} is not written by the vertex stage",
                name, location
            ));
        }
    }

    let mut attributes = Vec::new();
    for argument in &vs_entry.function.arguments {
        locations(&vertex.module, argument.ty, argument.binding.as_ref(), argument.name.as_deref(), &mut attributes);
    }
    let attributes = attributes
        .into_iter()
        .map(|(name, location, ty)| ActiveAttribute {
            name,
            location,
            ty: classify(&vertex.module.types[ty].inner),
        })
        .collect();

    let mut reflection = ProgramReflection {
        vertex_entry: vs_entry.name.clone(),
        fragment_entry: fs_entry.name.clone(),
        attributes,
        ..Default::default()
    };
    let mut seen = BTreeSet::new();
    reflect_globals(vertex, vs_index, &mut seen, &mut reflection);
    reflect_globals(fragment, fs_index, &mut seen, &mut reflection);
    Ok(reflection)
}

fn reflect_globals(
    compiled: &CompiledModule,
    entry_index: usize,
    seen: &mut BTreeSet<(u32, u32)>,
    reflection: &mut ProgramReflection,
) {
    let module = &compiled.module;
    let usage = compiled.info.get_entry_point(entry_index);
    for (handle, global) in module.global_variables.iter() {
        if usage[handle].is_empty() {
            continue;
        }
        let Some(binding) = &global.binding else {
            continue;
        };
        if !seen.insert((binding.group, binding.binding)) {
            continue;
        }
        let name = global.name.clone().unwrap_or_default();
        match global.space {
            naga::AddressSpace::Uniform => match &module.types[global.ty].inner {
                naga::TypeInner::Struct { members, span } => {
                    let block_index = reflection.blocks.len() as u32;
                    reflection.blocks.push(ActiveUniformBlock {
                        index: block_index,
                        name,
                        size: *span,
                        group: binding.group,
                        binding: binding.binding,
                    });
                    for member in members {
                        let (ty, array_len, array_stride) = uniform_type(module, member.ty);
                        let index = reflection.uniforms.len() as u32;
                        reflection.uniforms.push(ActiveUniform {
                            index,
                            name: member.name.clone().unwrap_or_default(),
                            ty,
                            array_len,
                            array_stride,
                            size: module.types[member.ty].inner.size(module.to_ctx()),
                            block_index: Some(block_index),
                            offset: member.offset,
                            group: binding.group,
                            binding: binding.binding,
                        });
                    }
                }
                inner => {
                    let (ty, array_len, array_stride) = uniform_type(module, global.ty);
                    let index = reflection.uniforms.len() as u32;
                    reflection.uniforms.push(ActiveUniform {
                        index,
                        name,
                        ty,
                        array_len,
                        array_stride,
                        size: inner.size(module.to_ctx()),
                        block_index: None,
                        offset: 0,
                        group: binding.group,
                        binding: binding.binding,
                    });
                }
            },
            naga::AddressSpace::Handle => {
                let ty = classify(&module.types[global.ty].inner);
                let index = reflection.uniforms.len() as u32;
                reflection.uniforms.push(ActiveUniform {
                    index,
                    name,
                    ty,
                    array_len: 0,
                    array_stride: 0,
                    size: 0,
                    block_index: None,
                    offset: 0,
                    group: binding.group,
                    binding: binding.binding,
                });
            }
            _ => log::debug!("ignoring non-uniform global `{}`", name),
        }
    }
}

fn uniform_type(module: &naga::Module, ty: naga::Handle<naga::Type>) -> (UniformType, u32, u32) {
    match &module.types[ty].inner {
        naga::TypeInner::Array { base, size, stride } => {
            let len = match size {
                naga::ArraySize::Constant(n) => n.get(),
                _ => 0,
            };
            (classify(&module.types[*base].inner), len, *stride)
        }
        inner => (classify(inner), 0, 0),
    }
}

fn scalar_kind(kind: naga::ScalarKind) -> ScalarKind {
    match kind {
        naga::ScalarKind::Sint | naga::ScalarKind::AbstractInt => ScalarKind::Int,
        naga::ScalarKind::Uint => ScalarKind::UInt,
        naga::ScalarKind::Bool => ScalarKind::Bool,
        naga::ScalarKind::Float | naga::ScalarKind::AbstractFloat => ScalarKind::Float,
    }
}

fn classify(inner: &naga::TypeInner) -> UniformType {
    match inner {
        naga::TypeInner::Scalar(scalar) => UniformType::Scalar(scalar_kind(scalar.kind)),
        naga::TypeInner::Vector { size, scalar } => {
            UniformType::Vector(scalar_kind(scalar.kind), *size as u8)
        }
        naga::TypeInner::Matrix { columns, rows, .. } => UniformType::Matrix {
            columns: *columns as u8,
            rows: *rows as u8,
        },
        naga::TypeInner::Image { dim, .. } => UniformType::Texture(match dim {
            naga::ImageDimension::Cube => TextureDimension::Cube,
            _ => TextureDimension::D2,
        }),
        naga::TypeInner::Sampler { .. } => UniformType::Sampler,
        naga::TypeInner::Struct { .. } => UniformType::Struct,
        _ => UniformType::Other,
    }
}
