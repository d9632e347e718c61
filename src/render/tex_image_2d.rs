use std::rc::Rc;

use crate::{
    Error, Result,
    context::GpuState,
    data_structures::texture::Texture,
    error::ResourceKind,
    gpu::{RawTexture, TextureDesc, TextureFormat},
    resources::registry::{RawHandle, Registration},
};

/// A 2D texture living on the device.
#[derive(Debug)]
pub struct TexImage2D {
    registration: Registration,
    raw: RawTexture,
    desc: TextureDesc,
}

impl TexImage2D {
    /// Uploads decoded image data.
    pub fn from_texture(state: &Rc<GpuState>, texture: &Texture) -> Result<Self> {
        let (width, height) = texture.dimensions();
        let desc = TextureDesc {
            label: texture.name.clone(),
            width,
            height,
            format: texture.format(),
        };
        Self::create(state, desc, texture.image.as_raw())
    }

    /// An uninitialised texture, typically used as a render target.
    pub fn render_target(state: &Rc<GpuState>, width: u32, height: u32, label: &str) -> Result<Self> {
        let desc = TextureDesc {
            label: label.to_string(),
            width: width.max(1),
            height: height.max(1),
            format: TextureFormat::Rgba8Unorm,
        };
        Self::create(state, desc, &[])
    }

    fn create(state: &Rc<GpuState>, desc: TextureDesc, rgba: &[u8]) -> Result<Self> {
        let raw = state
            .gpu()
            .create_texture(&desc, rgba)
            .ok_or_else(|| Error::creation(ResourceKind::Texture, desc.label.as_str()))?;
        Ok(Self {
            registration: Registration::new(state, RawHandle::Texture(raw), &desc.label),
            raw,
            desc,
        })
    }

    pub fn raw(&self) -> Result<RawTexture> {
        self.registration.ensure_live()?;
        Ok(self.raw)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub(crate) fn state(&self) -> &Rc<GpuState> {
        self.registration.state()
    }

    pub fn is_disposed(&self) -> bool {
        self.registration.is_disposed()
    }

    pub fn dispose(&self) {
        self.registration.dispose();
    }
}
