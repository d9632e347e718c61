use std::collections::BTreeMap;

use crate::{
    Result,
    gpu::{IndexFormat, RawBuffer, VertexBinding},
    render::{buffer_geometry::BufferGeometry, program::Program},
};

/// Attribute bindings of one geometry resolved against one program's attribute locations.
///
/// Building it up front saves the name lookups [`Program::set_attribute_buffers`] does for a
/// plain [`BufferGeometry`]. It is only valid with the program it was built for.
#[derive(Clone, Debug)]
pub struct VertexArrayObject {
    program_id: u64,
    bindings: BTreeMap<u32, VertexBinding>,
    index: Option<(RawBuffer, IndexFormat)>,
}

impl VertexArrayObject {
    pub fn new(program: &Program, geometry: &BufferGeometry) -> Result<Self> {
        let mut bindings = BTreeMap::new();
        for (name, attribute) in program.attributes()? {
            if let Some(binding) = geometry.vertex_binding(name)? {
                bindings.insert(attribute.location, binding);
            }
        }
        Ok(Self {
            program_id: program.registration_id(),
            bindings,
            index: geometry.index_binding()?,
        })
    }

    pub fn program_id(&self) -> u64 {
        self.program_id
    }

    pub fn binding(&self, location: u32) -> Option<VertexBinding> {
        self.bindings.get(&location).copied()
    }

    pub fn index(&self) -> Option<(RawBuffer, IndexFormat)> {
        self.index
    }
}
