//! Local node transforms.
//!
//! A node's placement relative to its parent is stored as translation, rotation and scale and
//! only turned into a matrix when the world transform is resolved.

use std::ops::Mul;

use cgmath::One;

/// Translation, rotation (as quaternion) and scale relative to the parent node.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub position: cgmath::Vector3<f32>,
    pub rotation: cgmath::Quaternion<f32>,
    pub scale: cgmath::Vector3<f32>,
}

impl Transform {
    /// Identity transformation (no move, rotate, or scale).
    pub fn new() -> Self {
        Self {
            position: cgmath::Vector3::new(0.0, 0.0, 0.0),
            // `Quaternion::one()` is the identity quaternion (no rotation)
            rotation: cgmath::Quaternion::one(),
            scale: cgmath::Vector3::new(1.0, 1.0, 1.0),
        }
    }

    pub fn from_translation(x: f32, y: f32, z: f32) -> Self {
        cgmath::Vector3::new(x, y, z).into()
    }

    pub fn with_rotation(mut self, rotation: cgmath::Quaternion<f32>) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, x: f32, y: f32, z: f32) -> Self {
        self.scale = cgmath::Vector3::new(x, y, z);
        self
    }

    /// `T * R * S`: scale first, then rotate, then translate.
    pub fn to_matrix(&self) -> cgmath::Matrix4<f32> {
        cgmath::Matrix4::from_translation(self.position)
            * cgmath::Matrix4::from(self.rotation)
            * cgmath::Matrix4::from_nonuniform_scale(self.scale.x, self.scale.y, self.scale.z)
    }
}

/// Composes `self` (parent) with `rhs` (child). Exact for uniform scale; use the matrix product
/// for anything else.
impl<'a, 'b> Mul<&'b Transform> for &'a Transform {
    type Output = Transform;

    fn mul(self, rhs: &'b Transform) -> Self::Output {
        let scaled_rhs_pos = cgmath::Vector3::new(
            self.scale.x * rhs.position.x,
            self.scale.y * rhs.position.y,
            self.scale.z * rhs.position.z,
        );
        Transform {
            position: self.position + (self.rotation * scaled_rhs_pos),
            rotation: self.rotation * rhs.rotation,
            scale: cgmath::Vector3::new(
                self.scale.x * rhs.scale.x,
                self.scale.y * rhs.scale.y,
                self.scale.z * rhs.scale.z,
            ),
        }
    }
}

impl Mul<Transform> for Transform {
    type Output = Self;

    fn mul(self, rhs: Transform) -> Self::Output {
        &self * &rhs
    }
}

impl From<cgmath::Vector3<f32>> for Transform {
    fn from(position: cgmath::Vector3<f32>) -> Self {
        Transform {
            position,
            ..Default::default()
        }
    }
}

impl From<gltf::scene::Transform> for Transform {
    fn from(transform: gltf::scene::Transform) -> Self {
        let (position, rotation, scale) = transform.decomposed();
        Transform {
            position: position.into(),
            // glTF stores quaternions as [x, y, z, w]
            rotation: cgmath::Quaternion::new(rotation[3], rotation[0], rotation[1], rotation[2]),
            scale: scale.into(),
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::new()
    }
}

