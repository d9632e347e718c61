use std::{
    cell::{Cell, RefCell, RefMut},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Poll, Waker},
};

use futures::executor::{LocalPool, LocalSpawner};

use crate::{
    gpu::{ClearState, Gpu, headless::HeadlessGpu},
    render::{
        buffer_geometry::BufferGeometry, framebuffer::Framebuffer, program::Program,
        tex_image_2d::TexImage2D,
    },
    resources::{cache::ResourceCache, registry::ResourceRegistry},
};

/// Knobs callers set before building a [`Context`].
#[derive(Clone, Debug)]
pub struct ContextConfig {
    pub width: u32,
    pub height: u32,
    pub clear_colour: wgpu::Color,
    /// Lights beyond this count are dropped with a warning.
    pub max_punctual_lights: usize,
    /// Poll program links once per tick instead of blocking on them at creation.
    pub async_program_links: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            clear_colour: ClearState::default().color,
            max_punctual_lights: 8,
            async_program_links: true,
        }
    }
}

/// The device plus the registry of objects created on it.
pub struct GpuState {
    gpu: RefCell<Box<dyn Gpu>>,
    registry: RefCell<ResourceRegistry>,
}

impl fmt::Debug for GpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuState")
            .field("backend", &self.gpu.borrow().backend_name())
            .field("live", &self.registry.borrow().live_count())
            .finish()
    }
}

impl GpuState {
    pub fn new(gpu: impl Gpu + 'static) -> Rc<Self> {
        Rc::new(Self {
            gpu: RefCell::new(Box::new(gpu)),
            registry: RefCell::new(ResourceRegistry::new()),
        })
    }

    pub fn gpu(&self) -> RefMut<'_, Box<dyn Gpu>> {
        self.gpu.borrow_mut()
    }

    pub fn registry(&self) -> RefMut<'_, ResourceRegistry> {
        self.registry.borrow_mut()
    }

    /// Runs `f` against the concrete backend, `None` if the backend is of another type.
    pub fn with_backend<G: Gpu, R>(&self, f: impl FnOnce(&mut G) -> R) -> Option<R> {
        let mut gpu = self.gpu.borrow_mut();
        gpu.as_any_mut().downcast_mut::<G>().map(f)
    }

    /// Deletes every registered object. Outstanding resources report as disposed afterwards.
    pub fn dispose_all(&self) -> usize {
        let mut gpu = self.gpu.borrow_mut();
        self.registry.borrow_mut().dispose_all(&mut **gpu)
    }
}

/// Frame counter the cooperative tasks can wait on.
#[derive(Debug, Default)]
pub struct Ticker {
    tick: Cell<u64>,
    wakers: RefCell<Vec<Waker>>,
}

impl Ticker {
    pub fn tick(&self) -> u64 {
        self.tick.get()
    }

    pub fn advance(&self) {
        self.tick.set(self.tick.get() + 1);
        for waker in self.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    /// Resolves at the next [`Ticker::advance`].
    pub fn next_tick(self: &Rc<Self>) -> NextTick {
        NextTick {
            ticker: self.clone(),
            start: self.tick(),
        }
    }
}

pub struct NextTick {
    ticker: Rc<Ticker>,
    start: u64,
}

impl Future for NextTick {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<()> {
        if self.ticker.tick() > self.start {
            return Poll::Ready(());
        }
        self.ticker.wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}

/// Everything the rendering core needs: the device, the resource caches and the executor that
/// drives asynchronous construction.
pub struct Context {
    pub config: ContextConfig,
    pub clear_state: ClearState,
    state: Rc<GpuState>,
    pool: RefCell<LocalPool>,
    ticker: Rc<Ticker>,
    canvas: Framebuffer,
    pub program_cache: ResourceCache<Program>,
    pub texture_cache: ResourceCache<TexImage2D>,
    pub geometry_cache: ResourceCache<BufferGeometry>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("tick", &self.ticker.tick())
            .field("program_cache", &self.program_cache)
            .field("texture_cache", &self.texture_cache)
            .field("geometry_cache", &self.geometry_cache)
            .finish()
    }
}

impl Context {
    pub fn new(gpu: impl Gpu + 'static, config: ContextConfig) -> Self {
        log::info!(
            "creating {} context ({}x{})",
            gpu.backend_name(),
            config.width,
            config.height
        );
        let state = GpuState::new(gpu);
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        let canvas = Framebuffer::canvas(&state);
        let clear_state = ClearState {
            color: config.clear_colour,
            ..Default::default()
        };
        Self {
            config,
            clear_state,
            canvas,
            program_cache: ResourceCache::new("program cache", spawner.clone(), |p: &Program| {
                p.dispose();
            }),
            texture_cache: ResourceCache::new("texture cache", spawner.clone(), |t: &TexImage2D| {
                t.dispose();
            }),
            geometry_cache: ResourceCache::new("geometry cache", spawner, |g: &BufferGeometry| {
                g.dispose();
            }),
            state,
            pool: RefCell::new(pool),
            ticker: Rc::new(Ticker::default()),
        }
    }

    /// A context on the in-memory backend.
    pub fn headless(config: ContextConfig) -> Self {
        let gpu = HeadlessGpu::new(config.width, config.height);
        Self::new(gpu, config)
    }

    /// A context rendering into an offscreen wgpu canvas.
    pub async fn wgpu(config: ContextConfig) -> anyhow::Result<Self> {
        let gpu = crate::gpu::wgpu_backend::WgpuGpu::new_offscreen(config.width, config.height).await?;
        Ok(Self::new(gpu, config))
    }

    pub fn state(&self) -> &Rc<GpuState> {
        &self.state
    }

    pub fn gpu(&self) -> RefMut<'_, Box<dyn Gpu>> {
        self.state.gpu()
    }

    pub fn registry(&self) -> RefMut<'_, ResourceRegistry> {
        self.state.registry()
    }

    pub fn with_backend<G: Gpu, R>(&self, f: impl FnOnce(&mut G) -> R) -> Option<R> {
        self.state.with_backend(f)
    }

    pub fn canvas(&self) -> &Framebuffer {
        &self.canvas
    }

    pub fn spawner(&self) -> LocalSpawner {
        self.pool.borrow().spawner()
    }

    pub fn tick(&self) -> u64 {
        self.ticker.tick()
    }

    pub fn ticker(&self) -> Rc<Ticker> {
        self.ticker.clone()
    }

    pub fn next_tick(&self) -> NextTick {
        self.ticker.next_tick()
    }

    /// Lets the device make progress, advances the tick and runs every task that can proceed.
    pub fn run_pending(&self) {
        self.state.gpu().poll();
        self.ticker.advance();
        self.pool.borrow_mut().run_until_stalled();
    }

    /// Drives the executor, ticking once per stall, until `future` completes.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let mut future = Box::pin(future);
        loop {
            let waker = futures::task::noop_waker();
            let mut cx = std::task::Context::from_waker(&waker);
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
            self.run_pending();
        }
    }

    /// Deletes every live GPU object and logs how many there were.
    pub fn dispose_all(&self) -> usize {
        let count = self.state.dispose_all();
        if count > 0 {
            log::info!("disposed {} outstanding GPU objects", count);
        }
        count
    }
}
