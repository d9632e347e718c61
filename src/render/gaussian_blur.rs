//! Separable gaussian blur: a horizontal pass into a temporary texture, then a vertical pass
//! into the target framebuffer.

use std::rc::Rc;

use crate::{
    Error, Result,
    context::Context,
    data_structures::{geometry::pass_geometry, material::ShaderMaterial},
    gpu::{BlendState, RenderState, UniformData},
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

const GAUSSIAN_BLUR_KEY: &str = "gaussianBlur";

#[derive(Clone, Copy, Debug)]
pub struct GaussianBlurProps<'a> {
    pub source: &'a Rc<TexImage2D>,
    /// Mip level sampled from `source`.
    pub source_lod: u32,
    /// Measured in texels of level 0.
    pub standard_deviation_in_texels: f32,
    /// Holds the horizontal pass. Must match the target size.
    pub temp: &'a Rc<TexImage2D>,
    pub target: &'a Framebuffer,
    /// Values below 1 blend the result over the target.
    pub target_alpha: f32,
}

impl<'a> GaussianBlurProps<'a> {
    pub fn new(
        source: &'a Rc<TexImage2D>,
        standard_deviation_in_texels: f32,
        temp: &'a Rc<TexImage2D>,
        target: &'a Framebuffer,
    ) -> Self {
        Self {
            source,
            source_lod: 0,
            standard_deviation_in_texels,
            temp,
            target,
            target_alpha: 1.0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.standard_deviation_in_texels.is_nan() || self.standard_deviation_in_texels < 0.0 {
            return Err(Error::BindingMismatch(format!(
                "standard deviation must be non-negative, got {}",
                self.standard_deviation_in_texels
            )));
        }
        if !(0.0..=1.0).contains(&self.target_alpha) {
            return Err(Error::BindingMismatch(format!(
                "target alpha must be within [0, 1], got {}",
                self.target_alpha
            )));
        }
        if self.temp.size() != self.target.size() {
            return Err(Error::BindingMismatch(format!(
                "temp texture size {:?} does not match target size {:?}",
                self.temp.size(),
                self.target.size()
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct GaussianBlur {
    program: ResourceRef<Program>,
    geometry: BufferGeometry,
}

impl GaussianBlur {
    pub fn new(ctx: &Context) -> Result<Self> {
        let material = ShaderMaterial::new(
            GAUSSIAN_BLUR_KEY,
            include_str!("shaders/copy_vertex.wgsl"),
            include_str!("shaders/gaussian_blur_fragment.wgsl"),
        );
        let geometry = make_buffer_geometry_from_geometry(ctx.state(), &pass_geometry())?;
        Ok(Self {
            program: Program::acquire_as(ctx, GAUSSIAN_BLUR_KEY, &material),
            geometry,
        })
    }

    /// Blurs `props.source` into `props.target`. The temporary framebuffer around `props.temp`
    /// is deleted before this returns, even when a pass fails.
    pub async fn exec(&self, ctx: &Context, props: GaussianBlurProps<'_>) -> Result<()> {
        props.validate()?;
        let program = self.program.promise().await?;

        // deviation of the sampled level, in its own texels
        let level_sd = props.standard_deviation_in_texels / (1u32 << props.source_lod.min(31)) as f32;
        let mut uniforms = UniformValueMap::new();
        uniforms.insert("sourceLod".into(), UniformData::Float(props.source_lod as f32).into());
        uniforms.insert("standardDeviationInTexels".into(), UniformData::Float(level_sd).into());
        uniforms.insert(
            "kernelRadiusInTexels".into(),
            UniformData::Float((level_sd * 3.0).ceil()).into(),
        );

        let temp = Framebuffer::with_color(props.temp)?;
        let horizontal = {
            uniforms.insert("sourceMap".into(), UniformValue::Texture(props.source.clone()));
            uniforms.insert("blurDirection".into(), UniformData::Vec2([1.0, 0.0]).into());
            uniforms.insert("targetAlpha".into(), UniformData::Float(1.0).into());
            temp.raw().and_then(|raw| {
                render_buffer_geometry(ctx, &program, &self.geometry, &[&uniforms], raw, RenderState::PASS)
            })
        };
        // the vertical pass reads what the horizontal one wrote
        ctx.gpu().flush();
        temp.dispose();
        horizontal?;

        uniforms.insert("sourceMap".into(), UniformValue::Texture(props.temp.clone()));
        uniforms.insert("blurDirection".into(), UniformData::Vec2([0.0, 1.0]).into());
        uniforms.insert("targetAlpha".into(), UniformData::Float(props.target_alpha).into());
        let state = RenderState {
            blend: if props.target_alpha < 1.0 {
                BlendState::PremultipliedAlpha
            } else {
                BlendState::None
            },
            ..RenderState::PASS
        };
        render_buffer_geometry(
            ctx,
            &program,
            &self.geometry,
            &[&uniforms],
            props.target.raw()?,
            state,
        )
    }

    pub fn dispose(&self) {
        self.program.dispose();
        self.geometry.dispose();
    }
}
