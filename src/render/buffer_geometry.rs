//! Geometry uploaded to device buffers.
//!
//! Every distinct [`AttributeData`] is uploaded once, so interleaved attributes share one
//! buffer. Each uploaded buffer remembers the data version it was filled from and
//! [`BufferGeometry::refresh`] re-uploads only the stale ones.

use std::{cell::Cell, collections::BTreeMap, rc::Rc};

use crate::{
    Error, Result,
    context::GpuState,
    data_structures::geometry::{AttributeData, ComponentType, Geometry, Topology},
    gpu::{BufferTarget, IndexFormat, RawBuffer, VertexBinding},
    render::buffer::Buffer,
};

#[derive(Debug)]
struct UploadedData {
    buffer: Buffer,
    data: Rc<AttributeData>,
    version: Cell<u32>,
    widen_u8: bool,
}

impl UploadedData {
    fn bytes(&self) -> Vec<u8> {
        widened(&self.data.bytes(), self.widen_u8)
    }
}

/// 8-bit indices are not drawable, they are uploaded as 16-bit.
fn widened(bytes: &[u8], widen_u8: bool) -> Vec<u8> {
    if widen_u8 {
        bytes.iter().flat_map(|b| (*b as u16).to_le_bytes()).collect()
    } else {
        bytes.to_vec()
    }
}

/// Binding metadata of one uploaded attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferAttribute {
    pub data_id: u64,
    pub components: u8,
    pub component_type: ComponentType,
    pub normalized: bool,
    /// Effective stride, never 0.
    pub stride: u32,
    pub offset: u32,
    pub count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferIndex {
    pub data_id: u64,
    pub format: IndexFormat,
    pub count: u32,
}

#[derive(Debug)]
pub struct BufferGeometry {
    geometry_id: u64,
    buffers: BTreeMap<u64, UploadedData>,
    attributes: BTreeMap<String, BufferAttribute>,
    indices: Option<BufferIndex>,
    topology: Topology,
    draw_count: u32,
}

/// Uploads all attribute data of `geometry`, one buffer per distinct backing data.
pub fn make_buffer_geometry_from_geometry(state: &Rc<GpuState>, geometry: &Geometry) -> Result<BufferGeometry> {
    let mut buffers = BTreeMap::new();
    let mut upload = |data: &Rc<AttributeData>, target: BufferTarget, widen_u8: bool| -> Result<()> {
        if buffers.contains_key(&data.id()) {
            return Ok(());
        }
        let bytes = widened(&data.bytes(), widen_u8);
        let label = format!("attribute data #{}", data.id());
        buffers.insert(
            data.id(),
            UploadedData {
                buffer: Buffer::new(state, target, &bytes, &label)?,
                data: data.clone(),
                version: Cell::new(data.version()),
                widen_u8,
            },
        );
        Ok(())
    };

    let mut attributes = BTreeMap::new();
    for (name, attribute) in &geometry.attributes {
        upload(&attribute.data, BufferTarget::Array, false)?;
        attributes.insert(
            name.clone(),
            BufferAttribute {
                data_id: attribute.data.id(),
                components: attribute.components,
                component_type: attribute.component_type,
                normalized: attribute.normalized,
                stride: attribute.effective_stride(),
                offset: attribute.byte_offset,
                count: attribute.count,
            },
        );
    }

    let indices = match &geometry.indices {
        Some(indices) => {
            let (format, widen) = match indices.component_type {
                ComponentType::U8 | ComponentType::I8 => (IndexFormat::U16, true),
                ComponentType::U16 | ComponentType::I16 => (IndexFormat::U16, false),
                ComponentType::U32 | ComponentType::I32 => (IndexFormat::U32, false),
                ComponentType::F32 => {
                    return Err(Error::InvalidGeometry("float indices are not supported".into()));
                }
            };
            if indices.byte_offset != 0 || indices.byte_stride > indices.element_size() {
                return Err(Error::InvalidGeometry("indices must be tightly packed".into()));
            }
            upload(&indices.data, BufferTarget::ElementArray, widen)?;
            Some(BufferIndex {
                data_id: indices.data.id(),
                format,
                count: indices.count,
            })
        }
        None => None,
    };

    log::debug!(
        "uploaded geometry #{}: {} attributes in {} buffers",
        geometry.id(),
        attributes.len(),
        buffers.len()
    );
    Ok(BufferGeometry {
        geometry_id: geometry.id(),
        buffers,
        attributes,
        indices,
        topology: geometry.topology,
        draw_count: geometry.draw_count(),
    })
}

impl BufferGeometry {
    pub fn geometry_id(&self) -> u64 {
        self.geometry_id
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn draw_count(&self) -> u32 {
        self.draw_count
    }

    /// Number of device buffers backing this geometry.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn attribute(&self, name: &str) -> Option<&BufferAttribute> {
        self.attributes.get(name)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn buffer(&self, data_id: u64) -> Option<&Buffer> {
        self.buffers.get(&data_id).map(|u| &u.buffer)
    }

    /// What to bind for attribute `name`, `None` if the geometry has no such attribute.
    pub fn vertex_binding(&self, name: &str) -> Result<Option<VertexBinding>> {
        let Some(attribute) = self.attributes.get(name) else {
            return Ok(None);
        };
        let buffer = self.raw_buffer(attribute.data_id)?;
        Ok(Some(VertexBinding {
            buffer,
            components: attribute.components,
            component_type: attribute.component_type,
            normalized: attribute.normalized,
            stride: attribute.stride,
            offset: attribute.offset,
        }))
    }

    pub fn index_binding(&self) -> Result<Option<(RawBuffer, IndexFormat)>> {
        self.indices
            .map(|i| Ok((self.raw_buffer(i.data_id)?, i.format)))
            .transpose()
    }

    pub fn index_format(&self) -> Option<IndexFormat> {
        self.indices.map(|i| i.format)
    }

    fn raw_buffer(&self, data_id: u64) -> Result<RawBuffer> {
        self.buffers
            .get(&data_id)
            .ok_or_else(|| Error::BindingMismatch(format!("no buffer for attribute data #{}", data_id)))?
            .buffer
            .raw()
    }

    /// Re-uploads buffers whose source data changed. Returns how many were written.
    pub fn refresh(&self) -> Result<usize> {
        let mut written = 0;
        for uploaded in self.buffers.values() {
            if uploaded.data.version() == uploaded.version.get() {
                continue;
            }
            uploaded.buffer.write(&uploaded.bytes())?;
            uploaded.version.set(uploaded.data.version());
            written += 1;
        }
        if written > 0 {
            log::trace!("geometry #{}: re-uploaded {} buffers", self.geometry_id, written);
        }
        Ok(written)
    }

    pub fn is_disposed(&self) -> bool {
        self.buffers.values().any(|u| u.buffer.is_disposed())
    }

    pub fn dispose(&self) {
        for uploaded in self.buffers.values() {
            uploaded.buffer.dispose();
        }
    }
}
