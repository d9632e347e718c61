use std::rc::Rc;

use crate::{
    Error, Result,
    context::GpuState,
    error::ResourceKind,
    gpu::{ClearState, RawFramebuffer},
    render::tex_image_2d::TexImage2D,
    resources::registry::{RawHandle, Registration},
};

/// A render target: either the canvas or an offscreen framebuffer with one colour attachment.
#[derive(Debug)]
pub struct Framebuffer {
    state: Rc<GpuState>,
    raw: RawFramebuffer,
    /// `None` for the canvas, which is owned by the device.
    registration: Option<Registration>,
}

impl Framebuffer {
    pub fn canvas(state: &Rc<GpuState>) -> Self {
        let raw = state.gpu().canvas();
        Self {
            state: state.clone(),
            raw,
            registration: None,
        }
    }

    /// Renders into `color`.
    pub fn with_color(color: &TexImage2D) -> Result<Self> {
        let state = color.state().clone();
        let texture = color.raw()?;
        let label = format!("framebuffer({})", color.desc().label);
        let raw = state
            .gpu()
            .create_framebuffer(texture)
            .ok_or_else(|| Error::creation(ResourceKind::Framebuffer, label.as_str()))?;
        let registration = Registration::new(&state, RawHandle::Framebuffer(raw), &label);
        Ok(Self {
            state,
            raw,
            registration: Some(registration),
        })
    }

    pub fn raw(&self) -> Result<RawFramebuffer> {
        if let Some(registration) = &self.registration {
            registration.ensure_live()?;
        }
        Ok(self.raw)
    }

    pub fn is_canvas(&self) -> bool {
        self.registration.is_none()
    }

    pub fn size(&self) -> (u32, u32) {
        self.state.gpu().framebuffer_size(self.raw)
    }

    pub fn clear(&self, clear_state: &ClearState) -> Result<()> {
        let raw = self.raw()?;
        self.state.gpu().clear(raw, clear_state);
        Ok(())
    }

    /// Submits pending work and reads the colour attachment back.
    pub fn read_pixels(&self) -> anyhow::Result<image::RgbaImage> {
        let raw = self.raw()?;
        let mut gpu = self.state.gpu();
        gpu.flush();
        gpu.read_pixels(raw)
    }

    pub fn dispose(&self) {
        if let Some(registration) = &self.registration {
            registration.dispose();
        }
    }
}
