use scene_ngin::{
    data_structures::{
        material::{Material, MaterialParam},
        scene_graph::{NodeKind, NodeTemplate, Projection},
    },
    gpu::UniformData,
    resources::gltf::{BASE_COLOR_FACTOR, METALLIC_FACTOR, import_gltf},
};

mod common;

use common::test_utils::*;

const DOCUMENT: &str = r#"{
    "asset": { "version": "2.0" },
    "scene": 0,
    "scenes": [{ "nodes": ROOTS }],
    "nodes": [
        { "name": "body", "mesh": 0, "translation": [1.0, 2.0, 3.0], "children": [2] },
        { "camera": 0 },
        { "name": "parts", "mesh": 1 }
    ],
    "cameras": [
        { "type": "perspective", "perspective": { "yfov": 0.8, "znear": 0.1 } }
    ],
    "meshes": [
        { "primitives": [{ "attributes": { "POSITION": 0 }, "indices": 1, "material": 0 }] },
        { "primitives": [
            { "attributes": { "POSITION": 0 } },
            { "attributes": { "POSITION": 0 }, "mode": 6 },
            { "attributes": { "POSITION": 0 }, "indices": 1 }
        ] }
    ],
    "materials": [
        { "pbrMetallicRoughness": { "baseColorFactor": [1.0, 0.0, 0.0, 1.0], "metallicFactor": 0.5 } }
    ],
    "accessors": [
        { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
          "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] },
        { "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }
    ],
    "bufferViews": [
        { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
        { "buffer": 0, "byteOffset": 36, "byteLength": 6 }
    ],
    "buffers": [{ "uri": "triangle.bin", "byteLength": 42 }]
}"#;

fn triangle_buffer() -> Vec<u8> {
    let positions: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    let indices: [u16; 3] = [0, 1, 2];
    let mut bytes = bytemuck::cast_slice::<f32, u8>(&positions).to_vec();
    bytes.extend_from_slice(bytemuck::cast_slice::<u16, u8>(&indices));
    bytes
}

fn import(roots: &str) -> NodeTemplate {
    let json = DOCUMENT.replace("ROOTS", roots);
    let gltf = gltf::Gltf::from_slice(json.as_bytes()).unwrap();
    import_gltf(&gltf, &[triangle_buffer()], &[], "scene.gltf", mesh_shader()).unwrap()
}

fn child<'a>(template: &'a NodeTemplate, name: &str) -> &'a NodeTemplate {
    template
        .children
        .iter()
        .find(|c| c.name == name)
        .unwrap_or_else(|| panic!("{} has no child {}", template.name, name))
}

fn data_param(material: &Material, name: &str) -> Option<UniformData> {
    match material.param(name) {
        Some(MaterialParam::Data(data)) => Some(data.clone()),
        _ => None,
    }
}

#[test]
fn should_wrap_several_roots_in_a_group() {
    let template = import("[0, 1]");

    assert_eq!(template.name, "scene.gltf");
    assert!(matches!(template.kind, NodeKind::Group));
    let names: Vec<&str> = template.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["body", "node1"]);
    assert_eq!(template.node_count(), 6);
}

#[test]
fn should_return_a_single_root_as_is() {
    let template = import("[0]");

    assert_eq!(template.name, "body");
    assert_eq!(template.transform.position, cgmath::Vector3::new(1.0, 2.0, 3.0));
    let NodeKind::Mesh(mesh) = &template.kind else {
        panic!("body should be a mesh, got {:?}", template.kind);
    };
    assert_eq!(
        mesh.geometry.attribute("position").unwrap().read_f32(),
        vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]
    );
    assert_eq!(mesh.geometry.indices.as_ref().unwrap().read_indices(), vec![0, 1, 2]);
    assert_eq!(data_param(&mesh.material, BASE_COLOR_FACTOR), Some(UniformData::Vec4([1.0, 0.0, 0.0, 1.0])));
    assert_eq!(data_param(&mesh.material, METALLIC_FACTOR), Some(UniformData::Float(0.5)));
}

#[test]
fn should_split_primitives_into_child_meshes() {
    let template = import("[0]");
    let parts = child(&template, "parts");

    // the triangle fan primitive is skipped
    assert!(matches!(parts.kind, NodeKind::Group));
    let names: Vec<&str> = parts.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["parts#0", "parts#1"]);

    let NodeKind::Mesh(first) = &parts.children[0].kind else {
        panic!("parts#0 should be a mesh");
    };
    assert!(first.geometry.indices.is_none());
    assert_eq!(data_param(&first.material, BASE_COLOR_FACTOR), Some(UniformData::Vec4([1.0; 4])));
    let NodeKind::Mesh(second) = &parts.children[1].kind else {
        panic!("parts#1 should be a mesh");
    };
    assert_eq!(second.geometry.draw_count(), 3);
}

#[test]
fn should_import_cameras_with_defaults() {
    let template = import("[1]");

    assert_eq!(template.name, "node1");
    let NodeKind::Camera(camera) = &template.kind else {
        panic!("node1 should be a camera, got {:?}", template.kind);
    };
    match camera.projection {
        Projection::Perspective {
            fov_y,
            aspect,
            near,
            far,
        } => {
            assert_near(fov_y.0, 0.8);
            assert_near(aspect, 1.0);
            assert_near(near, 0.1);
            assert_near(far, 1000.0);
        }
        other => panic!("expected a perspective camera, got {:?}", other),
    }
}

#[test]
fn should_instantiate_an_imported_template() {
    let template = import("[0, 1]");
    let mut graph = scene_ngin::data_structures::scene_graph::SceneGraph::new();

    let root = graph.instantiate(&template);

    assert_eq!(graph.len(), 6);
    assert_eq!(graph.node(root).unwrap().children().len(), 2);
}
