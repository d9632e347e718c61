//! Shader sources and the per-mesh parameters fed to them.

use std::{
    collections::BTreeMap,
    hash::{DefaultHasher, Hash, Hasher},
    rc::Rc,
};

use crate::{data_structures::texture::Texture, gpu::UniformData};

/// A named pair of WGSL sources.
///
/// Programs are cached by [`ShaderMaterial::key`], so two materials with the same name and
/// sources share one linked program.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderMaterial {
    pub name: String,
    pub vertex_source: String,
    pub fragment_source: String,
}

impl ShaderMaterial {
    pub fn new(
        name: impl Into<String>,
        vertex_source: impl Into<String>,
        fragment_source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            vertex_source: vertex_source.into(),
            fragment_source: fragment_source.into(),
        }
    }

    /// Source identity: the name plus a hash of both stages.
    pub fn key(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.vertex_source.hash(&mut hasher);
        self.fragment_source.hash(&mut hasher);
        format!("{}#{:016x}", self.name, hasher.finish())
    }
}

#[derive(Clone, Debug)]
pub enum MaterialParam {
    Data(UniformData),
    Texture(Rc<Texture>),
}

impl From<UniformData> for MaterialParam {
    fn from(value: UniformData) -> Self {
        MaterialParam::Data(value)
    }
}

impl From<Rc<Texture>> for MaterialParam {
    fn from(value: Rc<Texture>) -> Self {
        MaterialParam::Texture(value)
    }
}

/// Shader plus uniform parameters of one mesh.
#[derive(Clone, Debug)]
pub struct Material {
    pub shader: Rc<ShaderMaterial>,
    params: BTreeMap<String, MaterialParam>,
    version: u32,
}

impl Material {
    pub fn new(shader: Rc<ShaderMaterial>) -> Self {
        Self {
            shader,
            params: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<MaterialParam>) -> Self {
        self.set_param(name, value);
        self
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<MaterialParam>) {
        self.params.insert(name.into(), value.into());
        self.version = self.version.wrapping_add(1);
    }

    pub fn set_shader(&mut self, shader: Rc<ShaderMaterial>) {
        self.shader = shader;
        self.version = self.version.wrapping_add(1);
    }

    pub fn params(&self) -> &BTreeMap<String, MaterialParam> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&MaterialParam> {
        self.params.get(name)
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}
