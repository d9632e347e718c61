//! Scene graph and hierarchical scene organization.
//!
//! Nodes live in a [`SceneGraph`] arena and are addressed by generation-checked [`NodeId`]s, so
//! an id that outlived its node is detected instead of aliasing a new one. Every node carries a
//! local [`Transform`], an ordered list of children and a [`NodeKind`] payload.
//!
//! # Dirty propagation
//!
//! [`SceneGraph::mark_dirty`] is O(1): it flags the node and bumps its version without touching
//! descendants. The graph keeps a world epoch counter that advances whenever a world transform
//! is recomputed. Each node remembers the epoch of its own last recompute and the parent epoch it
//! saw at that time, so during [`SceneGraph::update_node_tree`] a child notices a recomputed
//! parent by comparing the two. Only dirty subtrees are recomputed.

use cgmath::SquareMatrix;
use slotmap::SlotMap;
use std::rc::Rc;

use crate::{
    data_structures::{
        geometry::Geometry, material::Material, transform::Transform,
    },
    error::StructuralError,
};

slotmap::new_key_type! {
    /// Identity of a scene node. Stale ids are rejected by every graph operation.
    pub struct NodeId;
}

/// Converts OpenGL style clip space (z in -1..1) to the 0..1 depth range of wgpu.
#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: cgmath::Matrix4<f32> = cgmath::Matrix4::new(
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
);

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: cgmath::Rad<f32>,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub projection: Projection,
}

impl Camera {
    pub fn perspective(fov_y: impl Into<cgmath::Rad<f32>>, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            projection: Projection::Perspective {
                fov_y: fov_y.into(),
                aspect,
                near,
                far,
            },
        }
    }

    /// View to clip space.
    pub fn projection_matrix(&self) -> cgmath::Matrix4<f32> {
        let m = match self.projection {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => cgmath::perspective(fov_y, aspect, near, far),
            Projection::Orthographic {
                left,
                right,
                bottom,
                top,
                near,
                far,
            } => cgmath::ortho(left, right, bottom, top, near, far),
        };
        OPENGL_TO_WGPU_MATRIX * m
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LightKind {
    Directional {
        direction: cgmath::Vector3<f32>,
    },
    Point {
        range: f32,
    },
    Spot {
        range: f32,
        direction: cgmath::Vector3<f32>,
        inner_cone_cos: f32,
        outer_cone_cos: f32,
    },
}

impl LightKind {
    /// Type tag written to the light uniform arrays.
    pub fn tag(&self) -> i32 {
        match self {
            LightKind::Directional { .. } => 0,
            LightKind::Point { .. } => 1,
            LightKind::Spot { .. } => 2,
        }
    }
}

/// A punctual light. Position and direction are taken from the node's world transform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Light {
    pub color: cgmath::Vector3<f32>,
    pub intensity: f32,
    pub kind: LightKind,
}

impl Light {
    pub fn point(color: [f32; 3], intensity: f32, range: f32) -> Self {
        Self {
            color: color.into(),
            intensity,
            kind: LightKind::Point { range },
        }
    }

    pub fn spot(color: [f32; 3], intensity: f32, range: f32, inner_cone_cos: f32, outer_cone_cos: f32) -> Self {
        Self {
            color: color.into(),
            intensity,
            kind: LightKind::Spot {
                range,
                direction: cgmath::Vector3::new(0.0, 0.0, -1.0),
                inner_cone_cos,
                outer_cone_cos,
            },
        }
    }

    pub fn directional(color: [f32; 3], intensity: f32) -> Self {
        Self {
            color: color.into(),
            intensity,
            kind: LightKind::Directional {
                direction: cgmath::Vector3::new(0.0, 0.0, -1.0),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct MeshNode {
    pub geometry: Rc<Geometry>,
    pub material: Material,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Group,
    Mesh(MeshNode),
    Light(Light),
    Camera(Camera),
}

/// One node of the graph.
#[derive(Debug)]
pub struct SceneNode {
    pub name: String,
    transform: Transform,
    version: u32,
    dirty: bool,
    world: cgmath::Matrix4<f32>,
    /// Epoch of the last world recompute, 0 if never resolved.
    world_epoch: u64,
    parent_epoch_seen: u64,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
}

impl SceneNode {
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn as_mesh(&self) -> Option<&MeshNode> {
        match &self.kind {
            NodeKind::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn as_light(&self) -> Option<&Light> {
        match &self.kind {
            NodeKind::Light(light) => Some(light),
            _ => None,
        }
    }

    pub fn as_camera(&self) -> Option<&Camera> {
        match &self.kind {
            NodeKind::Camera(camera) => Some(camera),
            _ => None,
        }
    }
}

/// Detached description of a subtree, as produced by asset loaders.
#[derive(Clone, Debug)]
pub struct NodeTemplate {
    pub name: String,
    pub transform: Transform,
    pub kind: NodeKind,
    pub children: Vec<NodeTemplate>,
}

impl NodeTemplate {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            transform: Transform::default(),
            kind,
            children: Vec::new(),
        }
    }

    /// Number of nodes in this subtree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(NodeTemplate::node_count).sum::<usize>()
    }
}

/// Output of one [`SceneGraph::update_node_tree`] pass.
#[derive(Debug, Default)]
pub struct SceneTreeCache {
    /// Nodes whose world transform was recomputed, in traversal order.
    pub touched: Vec<NodeId>,
    /// Nodes detached or destroyed since the previous pass.
    pub removed: Vec<NodeId>,
    pub passes: u64,
}

#[derive(Debug, Default)]
pub struct SceneGraph {
    nodes: SlotMap<NodeId, SceneNode>,
    epoch: u64,
    removed: Vec<NodeId>,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, kind: NodeKind) -> NodeId {
        self.nodes.insert(SceneNode {
            name: name.into(),
            transform: Transform::default(),
            version: 0,
            dirty: true,
            world: cgmath::Matrix4::identity(),
            world_epoch: 0,
            parent_epoch_seen: 0,
            parent: None,
            children: Vec::new(),
            kind,
        })
    }

    pub fn add_group(&mut self, name: impl Into<String>) -> NodeId {
        self.add(name, NodeKind::Group)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: NodeId) -> Result<&SceneNode, StructuralError> {
        self.nodes.get(id).ok_or(StructuralError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut SceneNode, StructuralError> {
        self.nodes.get_mut(id).ok_or(StructuralError::UnknownNode(id))
    }

    /// Whether `ancestor` lies on the parent chain of `node` (a node is its own ancestor).
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(id).and_then(|n| n.parent);
        }
        false
    }

    /// Attaches `child` as the last child of `parent` and invalidates its subtree.
    pub fn append(&mut self, parent: NodeId, child: NodeId) -> Result<(), StructuralError> {
        self.node(parent)?;
        if let Some(existing) = self.node(child)?.parent {
            return Err(StructuralError::AlreadyParented {
                child,
                parent: existing,
            });
        }
        if self.is_ancestor(child, parent) {
            return Err(StructuralError::Cycle { parent, child });
        }
        self.node_mut(parent)?.children.push(child);
        let node = self.node_mut(child)?;
        node.parent = Some(parent);
        node.dirty = true;
        node.version = node.version.wrapping_add(1);
        Ok(())
    }

    /// Detaches `child` from `parent`. The subtree stays in the arena and may be re-attached.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), StructuralError> {
        if self.node(child)?.parent != Some(parent) {
            return Err(StructuralError::NotAChild { parent, child });
        }
        self.node_mut(parent)?.children.retain(|c| *c != child);
        let node = self.node_mut(child)?;
        node.parent = None;
        node.dirty = true;
        node.version = node.version.wrapping_add(1);
        let subtree = self.descendants(child);
        self.removed.extend(subtree);
        Ok(())
    }

    /// Detaches `id` (if attached) and drops its whole subtree from the arena.
    pub fn destroy(&mut self, id: NodeId) -> Result<(), StructuralError> {
        if let Some(parent) = self.node(id)?.parent {
            self.remove_child(parent, id)?;
        } else {
            let subtree = self.descendants(id);
            self.removed.extend(subtree);
        }
        for node in self.descendants(id) {
            self.nodes.remove(node);
        }
        Ok(())
    }

    pub fn set_local_transform(&mut self, id: NodeId, transform: Transform) -> Result<(), StructuralError> {
        self.node_mut(id)?.transform = transform;
        self.mark_dirty(id)
    }

    /// O(1): flags the node and bumps its version. Descendants notice at the next tree update.
    pub fn mark_dirty(&mut self, id: NodeId) -> Result<(), StructuralError> {
        let node = self.node_mut(id)?;
        node.dirty = true;
        node.version = node.version.wrapping_add(1);
        Ok(())
    }

    /// Mutable access to the node payload. Marks the node dirty.
    pub fn kind_mut(&mut self, id: NodeId) -> Result<&mut NodeKind, StructuralError> {
        self.mark_dirty(id)?;
        Ok(&mut self.node_mut(id)?.kind)
    }

    /// Mutable access to a mesh payload, `None` when the node is not a mesh. Marks the node dirty.
    pub fn mesh_mut(&mut self, id: NodeId) -> Result<Option<&mut MeshNode>, StructuralError> {
        Ok(match self.kind_mut(id)? {
            NodeKind::Mesh(mesh) => Some(mesh),
            _ => None,
        })
    }

    pub fn light_mut(&mut self, id: NodeId) -> Result<Option<&mut Light>, StructuralError> {
        Ok(match self.kind_mut(id)? {
            NodeKind::Light(light) => Some(light),
            _ => None,
        })
    }

    /// Cached world transform. Identity for nodes that were never resolved or do not exist.
    pub fn world_transform(&self, id: NodeId) -> cgmath::Matrix4<f32> {
        match self.nodes.get(id) {
            Some(node) if node.world_epoch != 0 => node.world,
            _ => cgmath::Matrix4::identity(),
        }
    }

    /// Product of the local transforms along the parent chain, ignoring the cache.
    pub fn compute_world_transform(&self, id: NodeId) -> Result<cgmath::Matrix4<f32>, StructuralError> {
        let mut world = self.node(id)?.transform.to_matrix();
        let mut current = self.node(id)?.parent;
        while let Some(parent) = current {
            let node = self.node(parent)?;
            world = node.transform.to_matrix() * world;
            current = node.parent;
        }
        Ok(world)
    }

    /// `id` and all of its descendants in depth-first pre-order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            out.push(current);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// Resolves world transforms below `root`, recording which nodes were recomputed.
    ///
    /// A node is recomputed when it is dirty, was never resolved, or its parent was recomputed
    /// after it. The root's parent transform is the identity. Running the pass twice without
    /// mutations in between touches nothing the second time.
    pub fn update_node_tree(&mut self, root: NodeId, cache: &mut SceneTreeCache) -> Result<(), StructuralError> {
        self.node(root)?;
        cache.touched.clear();
        cache.removed.clear();
        cache.removed.append(&mut self.removed);
        cache.passes += 1;

        // (node, parent world, parent epoch)
        let mut stack = vec![(root, cgmath::Matrix4::identity(), 0u64)];
        while let Some((id, parent_world, parent_epoch)) = stack.pop() {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            if node.dirty || node.world_epoch == 0 || node.parent_epoch_seen != parent_epoch {
                self.epoch += 1;
                node.world = parent_world * node.transform.to_matrix();
                node.world_epoch = self.epoch;
                node.parent_epoch_seen = parent_epoch;
                node.dirty = false;
                cache.touched.push(id);
            }
            let (world, epoch) = (node.world, node.world_epoch);
            stack.extend(node.children.iter().rev().map(|c| (*c, world, epoch)));
        }
        log::trace!(
            "scene tree pass {}: {} touched, {} removed",
            cache.passes,
            cache.touched.len(),
            cache.removed.len()
        );
        Ok(())
    }

    /// Creates the nodes of `template` as a detached subtree and returns its root.
    pub fn instantiate(&mut self, template: &NodeTemplate) -> NodeId {
        let id = self.add(template.name.clone(), template.kind.clone());
        if let Some(node) = self.nodes.get_mut(id) {
            node.transform = template.transform;
        }
        for child in &template.children {
            let child_id = self.instantiate(child);
            self.attach_fresh(id, child_id);
        }
        id
    }

    fn attach_fresh(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.nodes.get_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.nodes.get_mut(parent) {
            node.children.push(child);
        }
    }
}
