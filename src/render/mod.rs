//! Device resources and the layers built on them.
//!
//! - GPU objects: [`buffer`], [`tex_image_2d`], [`framebuffer`], [`shader`]
//! - program layer: [`program`], [`uniforms`], [`vertex_array`]
//! - geometry upload: [`buffer_geometry`]
//! - scene mirroring: [`render_cache`], [`lights`]
//! - drawing: [`renderer`], [`copy_pass`], [`gaussian_blur`]

pub mod buffer;
pub mod buffer_geometry;
pub mod copy_pass;
pub mod framebuffer;
pub mod gaussian_blur;
pub mod lights;
pub mod program;
pub mod render_cache;
pub mod renderer;
pub mod shader;
pub mod tex_image_2d;
pub mod uniforms;
pub mod vertex_array;
