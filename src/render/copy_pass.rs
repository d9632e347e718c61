//! Full-screen copy of a texture into a framebuffer or another texture, with optional
//! colour-space conversion.

use std::rc::Rc;

use crate::{
    Error, Result,
    context::Context,
    data_structures::{geometry::pass_geometry, material::ShaderMaterial},
    gpu::{RenderState, UniformData},
    render::{
        buffer_geometry::{BufferGeometry, make_buffer_geometry_from_geometry},
        framebuffer::Framebuffer,
        program::Program,
        renderer::render_buffer_geometry,
        tex_image_2d::TexImage2D,
        uniforms::{UniformValue, UniformValueMap},
    },
    resources::cache::ResourceRef,
};

const COPY_PASS_KEY: &str = "copyPass";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureEncoding {
    #[default]
    Linear = 0,
    Srgb = 1,
}

/// One copy. Exactly one of `target_framebuffer` and `target_texture` must be set.
#[derive(Clone, Copy, Debug)]
pub struct CopyProps<'a> {
    pub source: &'a Rc<TexImage2D>,
    pub source_encoding: TextureEncoding,
    pub target_framebuffer: Option<&'a Framebuffer>,
    pub target_texture: Option<&'a TexImage2D>,
    pub target_encoding: TextureEncoding,
}

impl<'a> CopyProps<'a> {
    pub fn to_framebuffer(source: &'a Rc<TexImage2D>, target: &'a Framebuffer) -> Self {
        Self {
            source,
            source_encoding: TextureEncoding::Linear,
            target_framebuffer: Some(target),
            target_texture: None,
            target_encoding: TextureEncoding::Linear,
        }
    }

    pub fn to_texture(source: &'a Rc<TexImage2D>, target: &'a TexImage2D) -> Self {
        Self {
            source,
            source_encoding: TextureEncoding::Linear,
            target_framebuffer: None,
            target_texture: Some(target),
            target_encoding: TextureEncoding::Linear,
        }
    }
}

#[derive(Debug)]
pub struct CopyPass {
    program: ResourceRef<Program>,
    geometry: BufferGeometry,
}

impl CopyPass {
    /// Acquires the shared copy program and uploads the pass geometry.
    pub fn new(ctx: &Context) -> Result<Self> {
        let material = ShaderMaterial::new(
            COPY_PASS_KEY,
            include_str!("shaders/copy_vertex.wgsl"),
            include_str!("shaders/copy_fragment.wgsl"),
        );
        let geometry = make_buffer_geometry_from_geometry(ctx.state(), &pass_geometry())?;
        Ok(Self {
            program: Program::acquire_as(ctx, COPY_PASS_KEY, &material),
            geometry,
        })
    }

    /// Draws `props.source` over the whole target. Waits for the program if it is still linking.
    pub async fn exec(&self, ctx: &Context, props: CopyProps<'_>) -> Result<()> {
        let target = match (props.target_framebuffer, props.target_texture) {
            (Some(_), Some(_)) => {
                return Err(Error::BindingMismatch(
                    "cannot specify both a target framebuffer and texture".into(),
                ));
            }
            (None, None) => {
                return Err(Error::BindingMismatch("no target framebuffer or texture specified".into()));
            }
            (Some(framebuffer), None) => CopyTarget::Borrowed(framebuffer),
            (None, Some(texture)) => CopyTarget::Temporary(Framebuffer::with_color(texture)?),
        };

        let result = self.draw(ctx, &props, target.framebuffer()).await;
        // recorded draws must reach the device before a temporary target goes away
        ctx.gpu().flush();
        if let CopyTarget::Temporary(framebuffer) = &target {
            framebuffer.dispose();
        }
        result
    }

    async fn draw(&self, ctx: &Context, props: &CopyProps<'_>, target: &Framebuffer) -> Result<()> {
        let program = self.program.promise().await?;
        let mut uniforms = UniformValueMap::new();
        uniforms.insert("sourceMap".into(), UniformValue::Texture(props.source.clone()));
        uniforms.insert(
            "sourceEncoding".into(),
            UniformData::Int(props.source_encoding as i32).into(),
        );
        uniforms.insert(
            "targetEncoding".into(),
            UniformData::Int(props.target_encoding as i32).into(),
        );
        render_buffer_geometry(
            ctx,
            &program,
            &self.geometry,
            &[&uniforms],
            target.raw()?,
            RenderState::PASS,
        )
    }

    pub fn dispose(&self) {
        self.program.dispose();
        self.geometry.dispose();
    }
}

enum CopyTarget<'a> {
    Borrowed(&'a Framebuffer),
    Temporary(Framebuffer),
}

impl CopyTarget<'_> {
    fn framebuffer(&self) -> &Framebuffer {
        match self {
            CopyTarget::Borrowed(framebuffer) => framebuffer,
            CopyTarget::Temporary(framebuffer) => framebuffer,
        }
    }
}
