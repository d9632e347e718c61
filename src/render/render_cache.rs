//! Device-side mirror of the drawable part of a scene graph.
//!
//! A [`RenderCache`] holds one [`MeshEntry`] per mesh node below its root, plus the light and
//! camera uniforms derived from the light and camera nodes. [`RenderCache::update_render_cache`]
//! builds it from scratch, [`RenderCache::update_dirty_nodes`] applies the result of one
//! [`SceneGraph::update_node_tree`] pass:
//!
//! - removed nodes lose their entry and release its cache references,
//! - new meshes get an entry,
//! - changed meshes re-acquire only what changed. A program is re-acquired only when the shader
//!   source identity changed, a buffer geometry only when the geometry itself was swapped,
//! - light arrays are rebuilt from scratch if any light moved, changed, appeared or vanished.
//!
//! Resources are acquired through the context caches and may still be pending. Entries are kept
//! regardless; the renderer skips them until everything they need has resolved.

use std::{collections::HashMap, fmt, rc::Rc};

use crate::{
    Result,
    context::Context,
    data_structures::{
        geometry::Geometry,
        material::{Material, MaterialParam, ShaderMaterial},
        scene_graph::{MeshNode, NodeId, NodeKind, SceneGraph, SceneTreeCache},
        texture::Texture,
    },
    render::{
        buffer_geometry::{BufferGeometry, make_buffer_geometry_from_geometry},
        lights::{self, PunctualLightUniforms},
        program::Program,
        tex_image_2d::TexImage2D,
        uniforms::{UniformValue, UniformValueMap},
    },
    resources::cache::ResourceRef,
};

/// Picks the shader a mesh is drawn with, overriding the one in its material.
pub type ShaderResolver = Box<dyn Fn(&MeshNode) -> Rc<ShaderMaterial>>;

/// Everything needed to draw one mesh node.
#[derive(Debug)]
pub struct MeshEntry {
    program: ResourceRef<Program>,
    shader_key: String,
    geometry: ResourceRef<BufferGeometry>,
    geometry_id: u64,
    material_version: u32,
    params: UniformValueMap,
    textures: Vec<(String, ResourceRef<TexImage2D>)>,
    local_to_world: cgmath::Matrix4<f32>,
    node_version: u32,
}

impl MeshEntry {
    pub fn program(&self) -> &ResourceRef<Program> {
        &self.program
    }

    pub fn shader_key(&self) -> &str {
        &self.shader_key
    }

    pub fn geometry(&self) -> &ResourceRef<BufferGeometry> {
        &self.geometry
    }

    /// Non-texture material parameters.
    pub fn params(&self) -> &UniformValueMap {
        &self.params
    }

    pub fn textures(&self) -> impl Iterator<Item = (&str, &ResourceRef<TexImage2D>)> {
        self.textures.iter().map(|(name, texture)| (name.as_str(), texture))
    }

    /// Texture parameters as uniform values, `None` while any of them is still pending.
    pub fn texture_values(&self) -> Option<UniformValueMap> {
        self.textures
            .iter()
            .map(|(name, texture)| Some((name.clone(), UniformValue::Texture(texture.get()?))))
            .collect()
    }

    /// The `localToWorld` uniform of the node.
    pub fn node_uniforms(&self) -> UniformValueMap {
        let mut map = UniformValueMap::new();
        map.insert(lights::LOCAL_TO_WORLD.to_string(), self.local_to_world.into());
        map
    }

    pub fn local_to_world(&self) -> cgmath::Matrix4<f32> {
        self.local_to_world
    }

    /// Node version the entry was last synchronized with.
    pub fn node_version(&self) -> u32 {
        self.node_version
    }
}

pub struct RenderCache {
    root: NodeId,
    /// Camera requested at construction, used while it exists.
    pinned_camera: Option<NodeId>,
    camera: Option<NodeId>,
    entries: HashMap<NodeId, MeshEntry>,
    order: Vec<NodeId>,
    light_nodes: Vec<NodeId>,
    lights: PunctualLightUniforms,
    light_uniforms: UniformValueMap,
    camera_uniforms: UniformValueMap,
    shader_resolver: Option<ShaderResolver>,
}

impl fmt::Debug for RenderCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderCache")
            .field("root", &self.root)
            .field("camera", &self.camera)
            .field("entries", &self.entries.len())
            .field("lights", &self.lights.len())
            .finish()
    }
}

/// Builds the render cache of the tree below `root`.
///
/// Without an explicit `camera` the first camera node in traversal order is used.
pub fn update_render_cache(
    ctx: &Context,
    graph: &SceneGraph,
    root: NodeId,
    camera: Option<NodeId>,
) -> Result<RenderCache> {
    let mut cache = RenderCache::new(root, camera);
    cache.update_render_cache(ctx, graph)?;
    Ok(cache)
}

impl RenderCache {
    /// An empty cache. Call [`RenderCache::update_render_cache`] to fill it.
    pub fn new(root: NodeId, camera: Option<NodeId>) -> Self {
        Self {
            root,
            pinned_camera: camera,
            camera,
            entries: HashMap::new(),
            order: Vec::new(),
            light_nodes: Vec::new(),
            lights: PunctualLightUniforms::default(),
            light_uniforms: UniformValueMap::new(),
            camera_uniforms: UniformValueMap::new(),
            shader_resolver: None,
        }
    }

    pub fn with_shader_resolver(mut self, resolver: impl Fn(&MeshNode) -> Rc<ShaderMaterial> + 'static) -> Self {
        self.shader_resolver = Some(Box::new(resolver));
        self
    }

    /// Rebuilds every entry from the current tree.
    ///
    /// New references are taken before the old entries are released, so resources that are
    /// still in use are shared instead of rebuilt.
    pub fn update_render_cache(&mut self, ctx: &Context, graph: &SceneGraph) -> Result<()> {
        graph.node(self.root)?;
        let previous = std::mem::take(&mut self.entries);
        self.order.clear();
        self.light_nodes.clear();
        let mut camera = self.pinned_camera.filter(|id| is_camera(graph, *id));

        for id in graph.descendants(self.root) {
            let node = graph.node(id)?;
            match node.kind() {
                NodeKind::Mesh(mesh) => {
                    let entry = self.build_entry(ctx, mesh, graph.world_transform(id), node.version());
                    self.entries.insert(id, entry);
                    self.order.push(id);
                }
                NodeKind::Light(_) => self.light_nodes.push(id),
                NodeKind::Camera(_) if camera.is_none() => camera = Some(id),
                NodeKind::Camera(_) | NodeKind::Group => (),
            }
        }
        drop(previous);

        self.camera = camera;
        self.refresh_camera(graph);
        self.refresh_lights(ctx, graph);
        log::debug!(
            "render cache built: {} meshes, {} lights, camera {:?}",
            self.entries.len(),
            self.lights.len(),
            self.camera
        );
        Ok(())
    }

    /// Applies the nodes touched and removed by the last tree update.
    pub fn update_dirty_nodes(&mut self, ctx: &Context, graph: &SceneGraph, tree: &SceneTreeCache) -> Result<()> {
        let mut order_changed = false;
        let mut lights_changed = false;
        // a camera was removed, touched, or replaced by a node of another kind
        let mut camera_changed = false;

        for id in &tree.removed {
            // re-attached below the root in the same pass, it shows up as touched
            if graph.contains(*id) && graph.is_ancestor(self.root, *id) {
                continue;
            }
            if self.entries.remove(id).is_some() {
                log::debug!("render cache: released entry of removed node {:?}", id);
                order_changed = true;
            }
            lights_changed |= self.light_nodes.contains(id);
            camera_changed |= self.camera == Some(*id);
        }

        for id in &tree.touched {
            let Ok(node) = graph.node(*id) else {
                continue;
            };
            lights_changed |= self.light_nodes.contains(id);
            match node.kind() {
                NodeKind::Mesh(mesh) => {
                    let world = graph.world_transform(*id);
                    match self.entries.get_mut(id) {
                        Some(entry) => {
                            let resolver = self.shader_resolver.as_ref();
                            refresh_entry(ctx, resolver, entry, mesh, world, node.version())?;
                        }
                        None => {
                            let entry = self.build_entry(ctx, mesh, world, node.version());
                            self.entries.insert(*id, entry);
                            order_changed = true;
                        }
                    }
                }
                kind => {
                    if self.entries.remove(id).is_some() {
                        order_changed = true;
                    }
                    match kind {
                        NodeKind::Light(_) => lights_changed = true,
                        NodeKind::Camera(_) => camera_changed = true,
                        _ => (),
                    }
                }
            }
            camera_changed |= self.camera == Some(*id);
        }

        if order_changed || lights_changed {
            self.rebuild_order(graph);
        }
        if lights_changed {
            self.refresh_lights(ctx, graph);
        }
        if camera_changed {
            self.camera = self.select_camera(graph);
            self.refresh_camera(graph);
        }
        log::trace!(
            "render cache synced: {} touched, {} removed, {} entries",
            tree.touched.len(),
            tree.removed.len(),
            self.entries.len()
        );
        Ok(())
    }

    fn build_entry(&self, ctx: &Context, mesh: &MeshNode, world: cgmath::Matrix4<f32>, version: u32) -> MeshEntry {
        let shader = resolve_shader(self.shader_resolver.as_ref(), mesh);
        let (params, textures) = material_params(ctx, &mesh.material);
        MeshEntry {
            program: Program::acquire(ctx, &shader),
            shader_key: shader.key(),
            geometry: acquire_geometry(ctx, &mesh.geometry),
            geometry_id: mesh.geometry.id(),
            material_version: mesh.material.version(),
            params,
            textures,
            local_to_world: world,
            node_version: version,
        }
    }

    /// Mesh order and light order both follow the tree traversal.
    fn rebuild_order(&mut self, graph: &SceneGraph) {
        self.order.clear();
        self.light_nodes.clear();
        for id in graph.descendants(self.root) {
            if self.entries.contains_key(&id) {
                self.order.push(id);
            } else if graph.node(id).is_ok_and(|n| n.as_light().is_some()) {
                self.light_nodes.push(id);
            }
        }
    }

    /// The pinned camera while it exists, otherwise the first camera in traversal order.
    fn select_camera(&self, graph: &SceneGraph) -> Option<NodeId> {
        self.pinned_camera
            .filter(|id| is_camera(graph, *id))
            .or_else(|| graph.descendants(self.root).into_iter().find(|id| is_camera(graph, *id)))
    }

    fn refresh_lights(&mut self, ctx: &Context, graph: &SceneGraph) {
        self.lights = PunctualLightUniforms::build(graph, &self.light_nodes, ctx.config.max_punctual_lights);
        self.light_uniforms = self.lights.to_uniform_values();
    }

    fn refresh_camera(&mut self, graph: &SceneGraph) {
        self.camera_uniforms = self
            .camera
            .and_then(|id| Some((id, *graph.node(id).ok()?.as_camera()?)))
            .map(|(id, camera)| lights::camera_uniforms(graph, id, &camera))
            .unwrap_or_default();
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn camera(&self) -> Option<NodeId> {
        self.camera
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn entry(&self, id: NodeId) -> Option<&MeshEntry> {
        self.entries.get(&id)
    }

    /// Entries in tree traversal order.
    pub fn draw_order(&self) -> impl Iterator<Item = (NodeId, &MeshEntry)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|entry| (*id, entry)))
    }

    pub fn lights(&self) -> &PunctualLightUniforms {
        &self.lights
    }

    pub fn light_uniforms(&self) -> &UniformValueMap {
        &self.light_uniforms
    }

    pub fn camera_uniforms(&self) -> &UniformValueMap {
        &self.camera_uniforms
    }

    /// Releases every entry.
    pub fn dispose(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        self.order.clear();
        if count > 0 {
            log::debug!("render cache disposed {} entries", count);
        }
    }
}

fn is_camera(graph: &SceneGraph, id: NodeId) -> bool {
    graph.node(id).is_ok_and(|node| node.as_camera().is_some())
}

fn resolve_shader(resolver: Option<&ShaderResolver>, mesh: &MeshNode) -> Rc<ShaderMaterial> {
    match resolver {
        Some(resolve) => resolve(mesh),
        None => mesh.material.shader.clone(),
    }
}

fn refresh_entry(
    ctx: &Context,
    resolver: Option<&ShaderResolver>,
    entry: &mut MeshEntry,
    mesh: &MeshNode,
    world: cgmath::Matrix4<f32>,
    version: u32,
) -> Result<()> {
    let shader = resolve_shader(resolver, mesh);
    let shader_key = shader.key();
    if shader_key != entry.shader_key {
        log::debug!("render cache: shader `{}` -> `{}`", entry.shader_key, shader_key);
        entry.program = Program::acquire(ctx, &shader);
        entry.shader_key = shader_key;
    }

    if mesh.geometry.id() != entry.geometry_id {
        entry.geometry = acquire_geometry(ctx, &mesh.geometry);
        entry.geometry_id = mesh.geometry.id();
    } else if let Some(geometry) = entry.geometry.get() {
        geometry.refresh()?;
    }

    if mesh.material.version() != entry.material_version {
        let (params, textures) = material_params(ctx, &mesh.material);
        entry.params = params;
        entry.textures = textures;
        entry.material_version = mesh.material.version();
    }

    entry.local_to_world = world;
    entry.node_version = version;
    Ok(())
}

fn acquire_geometry(ctx: &Context, geometry: &Rc<Geometry>) -> ResourceRef<BufferGeometry> {
    let state = ctx.state().clone();
    let key = format!("geometry:{}", geometry.id());
    ctx.geometry_cache.acquire_ref(&key, |_| {
        let uploaded = make_buffer_geometry_from_geometry(&state, geometry);
        async move { uploaded }
    })
}

fn acquire_texture(ctx: &Context, texture: &Rc<Texture>) -> ResourceRef<TexImage2D> {
    let state = ctx.state().clone();
    let key = format!("texture:{}", texture.id());
    ctx.texture_cache.acquire_ref(&key, |_| {
        let uploaded = TexImage2D::from_texture(&state, texture);
        async move { uploaded }
    })
}

fn material_params(ctx: &Context, material: &Material) -> (UniformValueMap, Vec<(String, ResourceRef<TexImage2D>)>) {
    let mut params = UniformValueMap::new();
    let mut textures = Vec::new();
    for (name, param) in material.params() {
        match param {
            MaterialParam::Data(data) => {
                params.insert(name.clone(), UniformValue::Data(data.clone()));
            }
            MaterialParam::Texture(texture) => textures.push((name.clone(), acquire_texture(ctx, texture))),
        }
    }
    (params, textures)
}
