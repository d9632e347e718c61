//! Frame loop.
//!
//! A "flow" owns the application side of a scene: it populates the graph once and mutates it
//! every frame. [`FrameDriver`] runs the engine side around it:
//!
//! 1. Let pending GPU work and spawned tasks make progress (program links, texture uploads)
//! 2. Call [`SceneFlow::on_update`] with the time since the last frame
//! 3. Resolve world transforms and collect touched/removed nodes
//! 4. Build the render cache on the first frame, then synchronise it incrementally
//! 5. Clear the canvas and draw every ready entry

use instant::{Duration, Instant};

use crate::{
    context::Context,
    data_structures::scene_graph::{NodeId, SceneGraph, SceneTreeCache},
    render::{
        render_cache::{RenderCache, ShaderResolver},
        renderer::{FrameStats, render_scene},
    },
};

/// Application hooks driven by [`FrameDriver`].
pub trait SceneFlow {
    /// Called once. Everything added below `root` is rendered.
    fn on_init(&mut self, ctx: &Context, graph: &mut SceneGraph, root: NodeId) -> anyhow::Result<()>;

    /// Called every frame before the scene is synchronised.
    fn on_update(&mut self, ctx: &Context, graph: &mut SceneGraph, dt: Duration) -> anyhow::Result<()>;

    /// Overrides the shader of every mesh when the render cache is built.
    fn shader_resolver(&self) -> Option<ShaderResolver> {
        None
    }
}

/// Sets up `env_logger` natively and `console_log` in the browser. Safe to call more than once.
pub fn init_logging() {
    #[cfg(not(target_arch = "wasm32"))]
    {
        if let Err(e) = env_logger::try_init() {
            println!("Warning: Could not initialize logger: {}", e);
        };
    }

    #[cfg(target_arch = "wasm32")]
    {
        // fails only when a logger is already installed
        let _ = console_log::init_with_level(log::Level::Info);
    }
}

pub struct FrameDriver<F: SceneFlow> {
    ctx: Context,
    graph: SceneGraph,
    root: NodeId,
    camera: Option<NodeId>,
    tree_cache: SceneTreeCache,
    render_cache: Option<RenderCache>,
    flow: F,
    last_frame: Instant,
    frames: u64,
}

impl<F: SceneFlow> FrameDriver<F> {
    /// Creates the scene root and lets `flow` populate it.
    pub fn new(ctx: Context, mut flow: F) -> anyhow::Result<Self> {
        let mut graph = SceneGraph::new();
        let root = graph.add_group("root");
        flow.on_init(&ctx, &mut graph, root)?;
        log::info!("scene initialised with {} nodes", graph.len());
        Ok(Self {
            ctx,
            graph,
            root,
            camera: None,
            tree_cache: SceneTreeCache::default(),
            render_cache: None,
            flow,
            last_frame: Instant::now(),
            frames: 0,
        })
    }

    /// Renders through `camera` instead of the first camera found below the root.
    pub fn with_camera(mut self, camera: NodeId) -> Self {
        self.camera = Some(camera);
        self
    }

    /// Runs one frame.
    pub fn tick(&mut self) -> anyhow::Result<FrameStats> {
        self.ctx.run_pending();

        let now = Instant::now();
        let dt = now - self.last_frame;
        self.last_frame = now;
        self.flow.on_update(&self.ctx, &mut self.graph, dt)?;

        self.graph.update_node_tree(self.root, &mut self.tree_cache)?;
        if self.render_cache.is_none() {
            let mut cache = RenderCache::new(self.root, self.camera);
            if let Some(resolver) = self.flow.shader_resolver() {
                cache = cache.with_shader_resolver(resolver);
            }
            cache.update_render_cache(&self.ctx, &self.graph)?;
            log::debug!("render cache built with {} entries", cache.len());
            self.render_cache = Some(cache);
        } else if let Some(cache) = &mut self.render_cache {
            cache.update_dirty_nodes(&self.ctx, &self.graph, &self.tree_cache)?;
        }
        let Some(cache) = &self.render_cache else {
            return Ok(FrameStats::default());
        };

        let stats = render_scene(&self.ctx, cache, self.ctx.canvas())?;
        self.frames += 1;
        Ok(stats)
    }

    /// Runs frames until nothing is pending any more, at most `max_frames`.
    pub fn run_until_ready(&mut self, max_frames: usize) -> anyhow::Result<FrameStats> {
        let mut stats = FrameStats::default();
        for _ in 0..max_frames {
            stats = self.tick()?;
            if stats.pending == 0 {
                break;
            }
        }
        Ok(stats)
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn graph(&self) -> &SceneGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut SceneGraph {
        &mut self.graph
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn render_cache(&self) -> Option<&RenderCache> {
        self.render_cache.as_ref()
    }

    pub fn flow(&self) -> &F {
        &self.flow
    }

    pub fn flow_mut(&mut self) -> &mut F {
        &mut self.flow
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Releases the render cache and deletes whatever GPU objects are still alive.
    /// Returns the number of objects that had to be force-deleted.
    pub fn shutdown(&mut self) -> usize {
        if let Some(mut cache) = self.render_cache.take() {
            cache.dispose();
        }
        self.ctx.registry().report_leaks();
        self.ctx.dispose_all()
    }
}
