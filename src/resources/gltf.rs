//! glTF import.
//!
//! A file is turned into a [`NodeTemplate`] tree: node TRS, meshes (one mesh node per primitive),
//! base-colour material parameters, decoded textures and cameras. Nothing touches the GPU here,
//! the render cache uploads what it needs once the template is instantiated into a graph.

use std::rc::Rc;

use ::gltf::{
    Gltf,
    buffer::Source as BufferSource,
    camera::Projection as GltfProjection,
    image::Source as ImageSource,
    mesh::Mode,
};
use anyhow::Context as _;

use crate::{
    data_structures::{
        geometry::{Attribute, ComponentType, Geometry, Topology},
        material::{Material, ShaderMaterial},
        scene_graph::{Camera, MeshNode, NodeKind, NodeTemplate, Projection},
        texture::Texture,
        transform::Transform,
    },
    gpu::{BufferTarget, UniformData},
    resources::{load_binary, resolve_relative},
};

pub const BASE_COLOR_FACTOR: &str = "baseColorFactor";
pub const BASE_COLOR_MAP: &str = "baseColorMap";
pub const NORMAL_MAP: &str = "normalMap";
pub const METALLIC_FACTOR: &str = "metallicFactor";
pub const ROUGHNESS_FACTOR: &str = "roughnessFactor";

/// Loads `file_name` (`.gltf` or `.glb`) and every buffer and image it references.
///
/// All meshes get `shader`; swap it per node after instantiation or through a shader resolver.
pub async fn load_gltf(file_name: &str, shader: Rc<ShaderMaterial>) -> anyhow::Result<NodeTemplate> {
    let bytes = load_binary(file_name).await?;
    let gltf = Gltf::from_slice(&bytes).with_context(|| format!("{} is not a glTF file", file_name))?;

    let mut buffers = Vec::new();
    for buffer in gltf.buffers() {
        let data = match buffer.source() {
            BufferSource::Bin => gltf
                .blob
                .clone()
                .with_context(|| format!("{} has no binary chunk", file_name))?,
            BufferSource::Uri(uri) => load_uri(file_name, uri).await?,
        };
        buffers.push(data);
    }

    let mut images = Vec::new();
    for image in gltf.images() {
        let name = format!("{}#image{}", file_name, image.index());
        let texture = match image.source() {
            ImageSource::View { view, mime_type } => {
                let buffer = buffers
                    .get(view.buffer().index())
                    .with_context(|| format!("{} references a missing buffer", name))?;
                let bytes = buffer
                    .get(view.offset()..view.offset() + view.length())
                    .with_context(|| format!("{} has a buffer view out of range", name))?;
                Texture::from_bytes(bytes, &name, mime_type.split('/').next_back())?
            }
            ImageSource::Uri { uri, mime_type } => {
                let bytes = load_uri(file_name, uri).await?;
                Texture::from_bytes(&bytes, &name, mime_type.and_then(|m| m.split('/').next_back()))?
            }
        };
        images.push(Rc::new(texture));
    }

    import_gltf(&gltf, &buffers, &images, file_name, shader)
}

async fn load_uri(file_name: &str, uri: &str) -> anyhow::Result<Vec<u8>> {
    if uri.starts_with("data:") {
        anyhow::bail!("{}: embedded data URIs are not supported", file_name);
    }
    load_binary(&resolve_relative(file_name, uri)).await
}

/// Builds the node template of an already parsed document.
///
/// `buffers` and `images` are indexed like the document's buffers and images.
pub fn import_gltf(
    gltf: &Gltf,
    buffers: &[Vec<u8>],
    images: &[Rc<Texture>],
    name: &str,
    shader: Rc<ShaderMaterial>,
) -> anyhow::Result<NodeTemplate> {
    let materials: Vec<Material> = gltf
        .materials()
        .map(|material| import_material(&material, images, shader.clone()))
        .collect();
    let default_material =
        Material::new(shader).with_param(BASE_COLOR_FACTOR, UniformData::Vec4([1.0; 4]));

    let importer = Importer {
        buffers,
        materials: &materials,
        default_material: &default_material,
    };

    let scene = gltf
        .default_scene()
        .or_else(|| gltf.scenes().next())
        .with_context(|| format!("{} has no scene", name))?;
    let mut roots: Vec<NodeTemplate> = scene.nodes().map(|node| importer.node(&node)).collect();
    let template = if roots.len() == 1 {
        roots.remove(0)
    } else {
        let mut group = NodeTemplate::new(name, NodeKind::Group);
        group.children = roots;
        group
    };
    log::info!("imported {} with {} nodes", name, template.node_count());
    Ok(template)
}

fn import_material(material: &::gltf::Material, images: &[Rc<Texture>], shader: Rc<ShaderMaterial>) -> Material {
    let pbr = material.pbr_metallic_roughness();
    let mut out = Material::new(shader)
        .with_param(BASE_COLOR_FACTOR, UniformData::Vec4(pbr.base_color_factor()))
        .with_param(METALLIC_FACTOR, UniformData::Float(pbr.metallic_factor()))
        .with_param(ROUGHNESS_FACTOR, UniformData::Float(pbr.roughness_factor()));
    if let Some(info) = pbr.base_color_texture() {
        match images.get(info.texture().source().index()) {
            Some(texture) => out.set_param(BASE_COLOR_MAP, texture.clone()),
            None => log::warn!("material {:?} references a missing image", material.name()),
        }
    }
    if let Some(normal) = material.normal_texture() {
        if let Some(texture) = images.get(normal.texture().source().index()) {
            // separate identity: normal data must not be sRGB decoded
            let normal_map = Texture::new(format!("{}#normal", texture.name), texture.image.clone()).linear();
            out.set_param(NORMAL_MAP, Rc::new(normal_map));
        }
    }
    out
}

struct Importer<'a> {
    buffers: &'a [Vec<u8>],
    materials: &'a [Material],
    default_material: &'a Material,
}

impl Importer<'_> {
    fn node(&self, node: &::gltf::Node) -> NodeTemplate {
        let name = node
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("node{}", node.index()));

        let mut meshes = Vec::new();
        if let Some(mesh) = node.mesh() {
            for primitive in mesh.primitives() {
                match self.primitive(&primitive) {
                    Ok(mesh_node) => meshes.push(mesh_node),
                    Err(e) => log::warn!(
                        "skipping primitive {} of mesh {:?}: {}",
                        primitive.index(),
                        mesh.name(),
                        e
                    ),
                }
            }
        }

        let mut children: Vec<NodeTemplate> = node.children().map(|child| self.node(&child)).collect();
        let kind = if meshes.len() == 1 {
            NodeKind::Mesh(meshes.remove(0))
        } else if let Some(camera) = node.camera() {
            NodeKind::Camera(import_camera(&camera))
        } else {
            NodeKind::Group
        };
        // several primitives become sibling meshes under this node
        for (i, mesh) in meshes.into_iter().enumerate() {
            children.insert(i, NodeTemplate::new(format!("{}#{}", name, i), NodeKind::Mesh(mesh)));
        }

        let mut template = NodeTemplate::new(name, kind);
        template.transform = Transform::from(node.transform());
        template.children = children;
        template
    }

    fn primitive(&self, primitive: &::gltf::Primitive) -> anyhow::Result<MeshNode> {
        let topology = match primitive.mode() {
            Mode::Points => Topology::Points,
            Mode::Lines => Topology::Lines,
            Mode::LineStrip => Topology::LineStrip,
            Mode::Triangles => Topology::Triangles,
            Mode::TriangleStrip => Topology::TriangleStrip,
            mode => anyhow::bail!("primitive mode {:?} is not supported", mode),
        };
        let reader = primitive.reader(|buffer| self.buffers.get(buffer.index()).map(Vec::as_slice));

        let positions: Vec<[f32; 3]> = reader.read_positions().context("primitive has no positions")?.collect();
        let mut geometry = Geometry::new(topology).with_attribute("position", Attribute::from_f32(positions.as_flattened(), 3));

        if let Some(normals) = reader.read_normals() {
            let normals: Vec<[f32; 3]> = normals.collect();
            geometry = geometry.with_attribute("normal", Attribute::from_f32(normals.as_flattened(), 3));
        }
        if let Some(tangents) = reader.read_tangents() {
            let tangents: Vec<[f32; 4]> = tangents.collect();
            geometry = geometry.with_attribute("tangent", Attribute::from_f32(tangents.as_flattened(), 4));
        }
        for (set, name) in [(0, "uv0"), (1, "uv1")] {
            if let Some(uvs) = reader.read_tex_coords(set) {
                let uvs: Vec<[f32; 2]> = uvs.into_f32().collect();
                geometry = geometry.with_attribute(name, Attribute::from_f32(uvs.as_flattened(), 2));
            }
        }
        if let Some(colors) = reader.read_colors(0) {
            let colors: Vec<[f32; 4]> = colors.into_rgba_f32().collect();
            geometry = geometry.with_attribute("color0", Attribute::from_f32(colors.as_flattened(), 4));
        }
        if let Some(joints) = reader.read_joints(0) {
            let joints: Vec<[u16; 4]> = joints.into_u16().collect();
            geometry = geometry.with_attribute(
                "joints0",
                Attribute::from_slice(joints.as_flattened(), 4, ComponentType::U16, BufferTarget::Array),
            );
        }
        if let Some(weights) = reader.read_weights(0) {
            let weights: Vec<[f32; 4]> = weights.into_f32().collect();
            geometry = geometry.with_attribute("weights0", Attribute::from_f32(weights.as_flattened(), 4));
        }
        if let Some(indices) = reader.read_indices() {
            let indices: Vec<u32> = indices.into_u32().collect();
            geometry = geometry.with_indices(Attribute::indices_u32(&indices));
        }

        let material = primitive
            .material()
            .index()
            .and_then(|i| self.materials.get(i))
            .unwrap_or(self.default_material)
            .clone();
        Ok(MeshNode {
            geometry: Rc::new(geometry),
            material,
        })
    }
}

fn import_camera(camera: &::gltf::Camera) -> Camera {
    match camera.projection() {
        GltfProjection::Perspective(p) => Camera::perspective(
            cgmath::Rad(p.yfov()),
            p.aspect_ratio().unwrap_or(1.0),
            p.znear(),
            p.zfar().unwrap_or(1000.0),
        ),
        GltfProjection::Orthographic(o) => Camera {
            projection: Projection::Orthographic {
                left: -o.xmag(),
                right: o.xmag(),
                bottom: -o.ymag(),
                top: o.ymag(),
                near: o.znear(),
                far: o.zfar(),
            },
        },
    }
}
