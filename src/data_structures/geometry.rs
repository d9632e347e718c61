//! CPU-side geometry: named vertex attributes over shared byte buffers.
//!
//! An [`Attribute`] is a typed view (count, components, stride, offset) over an
//! [`AttributeData`] buffer. Several attributes may alias one buffer, which is how interleaved
//! geometry is expressed. `AttributeData` carries an identity and a version so the GPU layer can
//! upload each buffer once and detect stale uploads.

use std::{
    cell::{Cell, Ref, RefCell},
    collections::BTreeMap,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use cgmath::{InnerSpace, Matrix, SquareMatrix, Transform as _};

use crate::{Error, Result, gpu::BufferTarget};

static NEXT_DATA_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_GEOMETRY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
}

impl ComponentType {
    pub fn size(&self) -> u32 {
        match self {
            ComponentType::I8 | ComponentType::U8 => 1,
            ComponentType::I16 | ComponentType::U16 => 2,
            ComponentType::I32 | ComponentType::U32 | ComponentType::F32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Topology {
    Points,
    Lines,
    LineStrip,
    #[default]
    Triangles,
    TriangleStrip,
}

/// Raw bytes backing one or more attributes.
#[derive(Debug)]
pub struct AttributeData {
    id: u64,
    bytes: RefCell<Vec<u8>>,
    version: Cell<u32>,
    target: BufferTarget,
}

impl AttributeData {
    pub fn new(bytes: Vec<u8>, target: BufferTarget) -> Rc<Self> {
        Rc::new(Self {
            id: NEXT_DATA_ID.fetch_add(1, Ordering::Relaxed),
            bytes: RefCell::new(bytes),
            version: Cell::new(0),
            target,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn target(&self) -> BufferTarget {
        self.target
    }

    pub fn bytes(&self) -> Ref<'_, Vec<u8>> {
        self.bytes.borrow()
    }

    pub fn len(&self) -> usize {
        self.bytes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the contents and bumps the version.
    pub fn write(&self, bytes: Vec<u8>) {
        *self.bytes.borrow_mut() = bytes;
        self.mark_dirty();
    }

    /// Flags the contents as changed after an in-place edit.
    pub fn mark_dirty(&self) {
        self.version.set(self.version.get().wrapping_add(1));
    }
}

/// Typed view over an [`AttributeData`].
#[derive(Clone, Debug)]
pub struct Attribute {
    pub data: Rc<AttributeData>,
    pub components: u8,
    pub component_type: ComponentType,
    pub normalized: bool,
    /// 0 means tightly packed.
    pub byte_stride: u32,
    pub byte_offset: u32,
    pub count: u32,
}

impl Attribute {
    /// A tightly packed attribute covering all of `data`.
    pub fn new(data: Rc<AttributeData>, components: u8, component_type: ComponentType) -> Self {
        let element = components as usize * component_type.size() as usize;
        let count = if element == 0 { 0 } else { data.len() / element } as u32;
        Self {
            data,
            components,
            component_type,
            normalized: false,
            byte_stride: 0,
            byte_offset: 0,
            count,
        }
    }

    pub fn from_slice<T: bytemuck::Pod>(
        values: &[T],
        components: u8,
        component_type: ComponentType,
        target: BufferTarget,
    ) -> Self {
        Self::new(
            AttributeData::new(bytemuck::cast_slice(values).to_vec(), target),
            components,
            component_type,
        )
    }

    pub fn from_f32(values: &[f32], components: u8) -> Self {
        Self::from_slice(values, components, ComponentType::F32, BufferTarget::Array)
    }

    pub fn indices_u16(values: &[u16]) -> Self {
        Self::from_slice(values, 1, ComponentType::U16, BufferTarget::ElementArray)
    }

    pub fn indices_u32(values: &[u32]) -> Self {
        Self::from_slice(values, 1, ComponentType::U32, BufferTarget::ElementArray)
    }

    pub fn normalized(mut self) -> Self {
        self.normalized = true;
        self
    }

    pub fn element_size(&self) -> u32 {
        self.components as u32 * self.component_type.size()
    }

    pub fn effective_stride(&self) -> u32 {
        if self.byte_stride == 0 {
            self.element_size()
        } else {
            self.byte_stride
        }
    }

    /// Bytes of element `index`, or `None` when it lies outside the backing buffer.
    pub fn vertex_bytes(&self, index: u32) -> Option<Vec<u8>> {
        let start = self.byte_offset as usize + index as usize * self.effective_stride() as usize;
        let end = start + self.element_size() as usize;
        self.data.bytes().get(start..end).map(<[u8]>::to_vec)
    }

    /// Reads the attribute as floats, converting integer components without normalization.
    pub fn read_f32(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.count as usize * self.components as usize);
        for i in 0..self.count {
            let Some(bytes) = self.vertex_bytes(i) else {
                break;
            };
            let size = self.component_type.size() as usize;
            for c in bytes.chunks_exact(size) {
                out.push(match self.component_type {
                    ComponentType::F32 => f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    ComponentType::I8 => c[0] as i8 as f32,
                    ComponentType::U8 => c[0] as f32,
                    ComponentType::I16 => i16::from_le_bytes([c[0], c[1]]) as f32,
                    ComponentType::U16 => u16::from_le_bytes([c[0], c[1]]) as f32,
                    ComponentType::I32 => i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32,
                    ComponentType::U32 => u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32,
                });
            }
        }
        out
    }

    /// Reads an index attribute as `u32` values.
    pub fn read_indices(&self) -> Vec<u32> {
        (0..self.count)
            .filter_map(|i| self.vertex_bytes(i))
            .map(|c| match self.component_type {
                ComponentType::U8 | ComponentType::I8 => c[0] as u32,
                ComponentType::U16 | ComponentType::I16 => u16::from_le_bytes([c[0], c[1]]) as u32,
                _ => u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
            })
            .collect()
    }
}

/// Named attributes, optional indices and a primitive topology.
#[derive(Debug)]
pub struct Geometry {
    id: u64,
    pub attributes: BTreeMap<String, Attribute>,
    pub indices: Option<Attribute>,
    pub topology: Topology,
}

impl Geometry {
    pub fn new(topology: Topology) -> Self {
        Self {
            id: NEXT_GEOMETRY_ID.fetch_add(1, Ordering::Relaxed),
            attributes: BTreeMap::new(),
            indices: None,
            topology,
        }
    }

    /// Identity of this geometry value. Every clone gets a new one, the backing data is shared.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn with_attribute(mut self, name: impl Into<String>, attribute: Attribute) -> Self {
        self.attributes.insert(name.into(), attribute);
        self
    }

    pub fn with_indices(mut self, indices: Attribute) -> Self {
        self.indices = Some(indices);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Vertex count, taken from `position` when present.
    pub fn vertex_count(&self) -> u32 {
        self.attributes
            .get("position")
            .or_else(|| self.attributes.values().next())
            .map_or(0, |a| a.count)
    }

    /// Number of elements a draw of this geometry covers.
    pub fn draw_count(&self) -> u32 {
        self.indices
            .as_ref()
            .map_or_else(|| self.vertex_count(), |i| i.count)
    }

    /// All distinct backing buffers, indices included.
    pub fn attribute_data(&self) -> Vec<Rc<AttributeData>> {
        let mut seen = Vec::<Rc<AttributeData>>::new();
        for attribute in self.attributes.values().chain(self.indices.iter()) {
            if !seen.iter().any(|d| d.id() == attribute.data.id()) {
                seen.push(attribute.data.clone());
            }
        }
        seen
    }
}

impl Clone for Geometry {
    fn clone(&self) -> Self {
        Self {
            id: NEXT_GEOMETRY_ID.fetch_add(1, Ordering::Relaxed),
            attributes: self.attributes.clone(),
            indices: self.indices.clone(),
            topology: self.topology,
        }
    }
}

/// Repacks all attributes into one buffer with per-vertex stride.
///
/// Each attribute slot takes its element size rounded up to 4 bytes. Indices are kept as they
/// are. Attributes must agree on their vertex count.
pub fn convert_to_interleaved_geometry(geometry: &Geometry) -> Result<Geometry> {
    let count = geometry.vertex_count();
    let mut layout = Vec::with_capacity(geometry.attributes.len());
    let mut stride = 0u32;
    for (name, attribute) in &geometry.attributes {
        if attribute.count != count {
            return Err(Error::InvalidGeometry(format!(
                "attribute `{}` has {} vertices, expected {}",
                name, attribute.count, count
            )));
        }
        layout.push((name, attribute, stride));
        stride += attribute.element_size().max(4).next_multiple_of(4);
    }

    let mut bytes = vec![0u8; stride as usize * count as usize];
    for i in 0..count {
        let base = (i * stride) as usize;
        for (name, attribute, offset) in &layout {
            let element = attribute.vertex_bytes(i).ok_or_else(|| {
                Error::InvalidGeometry(format!("attribute `{}` is shorter than its count", name))
            })?;
            let start = base + *offset as usize;
            bytes[start..start + element.len()].copy_from_slice(&element);
        }
    }

    let data = AttributeData::new(bytes, BufferTarget::Array);
    let mut interleaved = Geometry::new(geometry.topology);
    interleaved.indices = geometry.indices.clone();
    for (name, attribute, offset) in layout {
        interleaved.attributes.insert(
            name.clone(),
            Attribute {
                data: data.clone(),
                components: attribute.components,
                component_type: attribute.component_type,
                normalized: attribute.normalized,
                byte_stride: stride,
                byte_offset: offset,
                count,
            },
        );
    }
    Ok(interleaved)
}

/// Full-screen quad in clip space with `position`, `uv0` and `normal`.
pub fn pass_geometry() -> Geometry {
    // bottom left, then clockwise: top left, top right, bottom right
    Geometry::new(Topology::Triangles)
        .with_attribute(
            "position",
            Attribute::from_f32(&[-1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0, -1.0], 2),
        )
        // texture space is flipped vertically compared to clip space
        .with_attribute(
            "uv0",
            Attribute::from_f32(&[0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0], 2),
        )
        .with_attribute(
            "normal",
            Attribute::from_f32(&[0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0], 3),
        )
        .with_indices(Attribute::indices_u32(&[0, 2, 1, 0, 3, 2]))
}

fn triangles(geometry: &Geometry) -> Vec<[u32; 3]> {
    let indices = match &geometry.indices {
        Some(indices) => indices.read_indices(),
        None => (0..geometry.vertex_count()).collect(),
    };
    match geometry.topology {
        Topology::Triangles => indices.chunks_exact(3).map(|t| [t[0], t[1], t[2]]).collect(),
        Topology::TriangleStrip => indices
            .windows(3)
            .enumerate()
            .map(|(i, t)| if i % 2 == 0 { [t[0], t[1], t[2]] } else { [t[1], t[0], t[2]] })
            .collect(),
        _ => Vec::new(),
    }
}

/// Replaces `normal` with area-weighted vertex normals derived from `position`.
pub fn compute_vertex_normals(geometry: &mut Geometry) -> Result<()> {
    let positions = geometry
        .attribute("position")
        .filter(|p| p.components == 3)
        .ok_or_else(|| Error::InvalidGeometry("a 3 component `position` is required".into()))?
        .read_f32();
    let vertex = |i: u32| -> Option<cgmath::Vector3<f32>> {
        let i = i as usize * 3;
        positions
            .get(i..i + 3)
            .map(|p| cgmath::Vector3::new(p[0], p[1], p[2]))
    };

    let mut normals = vec![cgmath::Vector3::new(0.0f32, 0.0, 0.0); geometry.vertex_count() as usize];
    for [a, b, c] in triangles(geometry) {
        let (Some(pa), Some(pb), Some(pc)) = (vertex(a), vertex(b), vertex(c)) else {
            return Err(Error::InvalidGeometry(format!(
                "triangle ({}, {}, {}) references a missing vertex",
                a, b, c
            )));
        };
        let face = (pb - pa).cross(pc - pa);
        for i in [a, b, c] {
            normals[i as usize] += face;
        }
    }
    let flat: Vec<f32> = normals
        .into_iter()
        .flat_map(|n| {
            let n = if n.magnitude2() > 0.0 { n.normalize() } else { n };
            [n.x, n.y, n.z]
        })
        .collect();
    geometry
        .attributes
        .insert("normal".into(), Attribute::from_f32(&flat, 3));
    Ok(())
}

/// Returns a copy with `position` transformed as points and `normal`/`tangent` by the normal
/// matrix. Other attributes are shared with the input.
pub fn transform_geometry(geometry: &Geometry, matrix: cgmath::Matrix4<f32>) -> Geometry {
    let mut result = Geometry::new(geometry.topology);
    result.indices = geometry.indices.clone();
    result.attributes = geometry.attributes.clone();

    let normal_matrix = matrix
        .invert()
        .map(|m| m.transpose())
        .unwrap_or(matrix);
    for (name, attribute) in &geometry.attributes {
        if attribute.components < 3 || attribute.component_type != ComponentType::F32 {
            continue;
        }
        let values = attribute.read_f32();
        let components = attribute.components as usize;
        let mapped: Vec<f32> = match name.as_str() {
            "position" => values
                .chunks_exact(components)
                .flat_map(|v| {
                    let p = matrix.transform_point(cgmath::Point3::new(v[0], v[1], v[2]));
                    let mut out = vec![p.x, p.y, p.z];
                    out.extend_from_slice(&v[3..]);
                    out
                })
                .collect(),
            "normal" | "tangent" => values
                .chunks_exact(components)
                .flat_map(|v| {
                    let n = normal_matrix
                        .transform_vector(cgmath::Vector3::new(v[0], v[1], v[2]));
                    let n = if n.magnitude2() > 0.0 { n.normalize() } else { n };
                    let mut out = vec![n.x, n.y, n.z];
                    out.extend_from_slice(&v[3..]);
                    out
                })
                .collect(),
            _ => continue,
        };
        result
            .attributes
            .insert(name.clone(), Attribute::from_f32(&mapped, attribute.components));
    }
    result
}
