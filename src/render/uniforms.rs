use std::{collections::BTreeMap, rc::Rc};

use crate::{gpu::UniformData, render::tex_image_2d::TexImage2D};

/// A value a program uniform can be set to.
#[derive(Clone, Debug)]
pub enum UniformValue {
    Data(UniformData),
    Texture(Rc<TexImage2D>),
}

pub type UniformValueMap = BTreeMap<String, UniformValue>;

impl From<UniformData> for UniformValue {
    fn from(value: UniformData) -> Self {
        UniformValue::Data(value)
    }
}

impl From<Rc<TexImage2D>> for UniformValue {
    fn from(value: Rc<TexImage2D>) -> Self {
        UniformValue::Texture(value)
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::Data(UniformData::Float(value))
    }
}

impl From<i32> for UniformValue {
    fn from(value: i32) -> Self {
        UniformValue::Data(UniformData::Int(value))
    }
}

impl From<[f32; 3]> for UniformValue {
    fn from(value: [f32; 3]) -> Self {
        UniformValue::Data(UniformData::Vec3(value))
    }
}

impl From<[f32; 4]> for UniformValue {
    fn from(value: [f32; 4]) -> Self {
        UniformValue::Data(UniformData::Vec4(value))
    }
}

impl From<cgmath::Matrix4<f32>> for UniformValue {
    fn from(value: cgmath::Matrix4<f32>) -> Self {
        UniformValue::Data(UniformData::Mat4(value.into()))
    }
}

/// Builds a [`UniformValueMap`] from `name => value` pairs.
#[macro_export]
macro_rules! uniforms {
    ($($name:expr => $value:expr),* $(,)?) => {{
        let mut map = $crate::render::uniforms::UniformValueMap::new();
        $(map.insert(::std::string::String::from($name), $crate::render::uniforms::UniformValue::from($value));)*
        map
    }};
}
