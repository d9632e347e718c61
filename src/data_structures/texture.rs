//! In-memory image data.
//!
//! [`Texture`] is what asset loaders hand to the core: decoded RGBA pixels plus a colour-space
//! hint. Uploading it is the job of [`crate::render::tex_image_2d::TexImage2D`].

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::*;
use image::{ImageFormat, load_from_memory_with_format};

use crate::gpu::TextureFormat;

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

/// Decoded RGBA8 image with an identity used as resource-cache key.
#[derive(Clone, Debug)]
pub struct Texture {
    id: u64,
    pub name: String,
    pub image: image::RgbaImage,
    /// Linear data (normal maps, lookup tables) is uploaded without sRGB decoding.
    pub linear: bool,
}

impl Texture {
    pub fn new(name: impl Into<String>, image: image::RgbaImage) -> Self {
        Self {
            id: NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            image,
            linear: false,
        }
    }

    /// A `width` x `height` image filled with one colour.
    pub fn solid(name: impl Into<String>, width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self::new(
            name,
            image::RgbaImage::from_pixel(width.max(1), height.max(1), image::Rgba(rgba)),
        )
    }

    /// Decodes raw image file data.
    ///
    /// # Arguments
    ///
    /// * `bytes` represent raw image file data (PNG, JPEG, etc.)
    /// * `format` is an optional file extension hint (e.g. "png"). If None, auto-detect.
    pub fn from_bytes(bytes: &[u8], name: &str, format: Option<&str>) -> Result<Self> {
        let img = match format {
            None => image::load_from_memory(bytes)?,
            Some(fmt) => {
                let format = ImageFormat::from_extension(fmt)
                    .with_context(|| format!("unknown image format `{}`", fmt))?;
                load_from_memory_with_format(bytes, format)?
            }
        };
        Ok(Self::new(name, img.to_rgba8()))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn linear(mut self) -> Self {
        self.linear = true;
        self
    }

    pub fn format(&self) -> TextureFormat {
        if self.linear {
            TextureFormat::Rgba8Unorm
        } else {
            TextureFormat::Rgba8UnormSrgb
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}
