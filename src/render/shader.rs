use std::rc::Rc;

use crate::{
    Error, Result,
    context::GpuState,
    error::ResourceKind,
    gpu::{RawShader, ShaderStage},
    resources::registry::{RawHandle, Registration},
};

/// One compiled shader stage. Compile errors surface through the owning program's link.
#[derive(Debug)]
pub struct Shader {
    registration: Registration,
    raw: RawShader,
    stage: ShaderStage,
}

impl Shader {
    pub fn new(state: &Rc<GpuState>, stage: ShaderStage, source: &str, label: &str) -> Result<Self> {
        let label = format!("{} ({})", label, stage);
        let raw = state
            .gpu()
            .create_shader(stage, source)
            .ok_or_else(|| Error::creation(ResourceKind::Shader, label.as_str()))?;
        Ok(Self {
            registration: Registration::new(state, RawHandle::Shader(raw), &label),
            raw,
            stage,
        })
    }

    pub fn raw(&self) -> Result<RawShader> {
        self.registration.ensure_live()?;
        Ok(self.raw)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// The compiler diagnostic, if compilation failed.
    pub fn compile_log(&self) -> Option<String> {
        self.registration
            .state()
            .gpu()
            .shader_compile_status(self.raw)
            .err()
    }

    pub fn dispose(&self) {
        self.registration.dispose();
    }
}
