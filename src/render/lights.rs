//! Uniform arrays aggregated from the light and camera nodes of a scene.
//!
//! Light arrays are rebuilt from scratch whenever a light changes. They are bounded by
//! [`crate::context::ContextConfig::max_punctual_lights`], so a rebuild is cheap and avoids
//! patching fixed-size arrays as lights come and go.

use cgmath::{EuclideanSpace, InnerSpace, SquareMatrix, Transform};

use crate::{
    data_structures::scene_graph::{Camera, Light, LightKind, NodeId, SceneGraph},
    gpu::UniformData,
    render::uniforms::{UniformValue, UniformValueMap},
};

pub const NUM_PUNCTUAL_LIGHTS: &str = "numPunctualLights";
pub const PUNCTUAL_LIGHT_TYPE: &str = "punctualLightType";
pub const PUNCTUAL_LIGHT_POSITION: &str = "punctualLightPosition";
pub const PUNCTUAL_LIGHT_COLOR: &str = "punctualLightColor";
pub const PUNCTUAL_LIGHT_DIRECTION: &str = "punctualLightDirection";
pub const PUNCTUAL_LIGHT_RANGE: &str = "punctualLightRange";
pub const PUNCTUAL_LIGHT_INNER_COS: &str = "punctualLightInnerCos";
pub const PUNCTUAL_LIGHT_OUTER_COS: &str = "punctualLightOuterCos";

pub const WORLD_TO_VIEW: &str = "worldToView";
pub const VIEW_TO_SCREEN: &str = "viewToScreen";
pub const LOCAL_TO_WORLD: &str = "localToWorld";

/// Per-light uniform arrays, indexed in scene traversal order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PunctualLightUniforms {
    pub types: Vec<i32>,
    pub positions: Vec<[f32; 3]>,
    /// Colour premultiplied by intensity.
    pub colors: Vec<[f32; 3]>,
    pub directions: Vec<[f32; 3]>,
    /// 0 means unlimited.
    pub ranges: Vec<f32>,
    /// Cone cosines, both 0 for point and directional lights.
    pub inner_cos: Vec<f32>,
    pub outer_cos: Vec<f32>,
}

impl PunctualLightUniforms {
    /// Collects `lights` in the given order, keeping at most `max` of them.
    pub fn build(graph: &SceneGraph, lights: &[NodeId], max: usize) -> Self {
        if lights.len() > max {
            log::warn!(
                "scene has {} punctual lights, only the first {} are used",
                lights.len(),
                max
            );
        }
        let mut out = Self::default();
        for id in lights.iter().take(max) {
            let Ok(node) = graph.node(*id) else {
                continue;
            };
            let Some(light) = node.as_light() else {
                continue;
            };
            out.push(light, graph.world_transform(*id));
        }
        out
    }

    fn push(&mut self, light: &Light, world: cgmath::Matrix4<f32>) {
        let position = world.transform_point(cgmath::Point3::origin());
        let (range, direction, inner, outer) = match light.kind {
            LightKind::Directional { direction } => (0.0, direction, 0.0, 0.0),
            LightKind::Point { range } => (range, cgmath::Vector3::new(0.0, 0.0, -1.0), 0.0, 0.0),
            LightKind::Spot {
                range,
                direction,
                inner_cone_cos,
                outer_cone_cos,
            } => (range, direction, inner_cone_cos, outer_cone_cos),
        };
        let world_direction = world.transform_vector(direction);
        let world_direction = if world_direction.magnitude2() > 0.0 {
            world_direction.normalize()
        } else {
            direction
        };
        let color = light.color * light.intensity;

        self.types.push(light.kind.tag());
        self.positions.push(position.into());
        self.colors.push(color.into());
        self.directions.push(world_direction.into());
        self.ranges.push(range);
        self.inner_cos.push(inner);
        self.outer_cos.push(outer);
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn to_uniform_values(&self) -> UniformValueMap {
        let mut map = UniformValueMap::new();
        let mut put = |name: &str, data: UniformData| {
            map.insert(name.to_string(), UniformValue::Data(data));
        };
        put(NUM_PUNCTUAL_LIGHTS, UniformData::Int(self.len() as i32));
        put(PUNCTUAL_LIGHT_TYPE, UniformData::IntArray(self.types.clone()));
        put(PUNCTUAL_LIGHT_POSITION, UniformData::Vec3Array(self.positions.clone()));
        put(PUNCTUAL_LIGHT_COLOR, UniformData::Vec3Array(self.colors.clone()));
        put(PUNCTUAL_LIGHT_DIRECTION, UniformData::Vec3Array(self.directions.clone()));
        put(PUNCTUAL_LIGHT_RANGE, UniformData::FloatArray(self.ranges.clone()));
        put(PUNCTUAL_LIGHT_INNER_COS, UniformData::FloatArray(self.inner_cos.clone()));
        put(PUNCTUAL_LIGHT_OUTER_COS, UniformData::FloatArray(self.outer_cos.clone()));
        map
    }
}

/// View and projection uniforms of the camera node `id`.
pub fn camera_uniforms(graph: &SceneGraph, id: NodeId, camera: &Camera) -> UniformValueMap {
    let world = graph.world_transform(id);
    let view = world.invert().unwrap_or_else(|| {
        log::warn!("camera world transform is not invertible, using identity view");
        cgmath::Matrix4::identity()
    });
    let mut map = UniformValueMap::new();
    map.insert(WORLD_TO_VIEW.to_string(), view.into());
    map.insert(VIEW_TO_SCREEN.to_string(), camera.projection_matrix().into());
    map
}
