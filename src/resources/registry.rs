//! Bookkeeping of live GPU objects.
//!
//! Every GPU resource registers its raw handle on construction and unregisters on disposal. A
//! resource counts as disposed exactly when it is no longer registered, so
//! [`ResourceRegistry::dispose_all`] invalidates every outstanding object at once.

use std::{collections::BTreeMap, fmt, rc::Rc};

use crate::{
    Error, Result,
    context::GpuState,
    error::ResourceKind,
    gpu::{Gpu, RawBuffer, RawFramebuffer, RawProgram, RawShader, RawTexture},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RawHandle {
    Buffer(RawBuffer),
    Texture(RawTexture),
    Shader(RawShader),
    Program(RawProgram),
    Framebuffer(RawFramebuffer),
}

impl RawHandle {
    pub fn kind(&self) -> ResourceKind {
        match self {
            RawHandle::Buffer(_) => ResourceKind::Buffer,
            RawHandle::Texture(_) => ResourceKind::Texture,
            RawHandle::Shader(_) => ResourceKind::Shader,
            RawHandle::Program(_) => ResourceKind::Program,
            RawHandle::Framebuffer(_) => ResourceKind::Framebuffer,
        }
    }

    fn delete(self, gpu: &mut dyn Gpu) {
        match self {
            RawHandle::Buffer(raw) => gpu.delete_buffer(raw),
            RawHandle::Texture(raw) => gpu.delete_texture(raw),
            RawHandle::Shader(raw) => gpu.delete_shader(raw),
            RawHandle::Program(raw) => gpu.delete_program(raw),
            RawHandle::Framebuffer(raw) => gpu.delete_framebuffer(raw),
        }
    }
}

#[derive(Clone, Debug)]
struct Registered {
    handle: RawHandle,
    label: String,
}

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    next_id: u64,
    live: BTreeMap<ResourceId, Registered>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: RawHandle, label: &str) -> ResourceId {
        self.next_id += 1;
        let id = ResourceId(self.next_id);
        self.live.insert(
            id,
            Registered {
                handle,
                label: label.to_string(),
            },
        );
        id
    }

    /// Removes `id` and hands back its handle. `None` if it was already gone.
    pub fn unregister(&mut self, id: ResourceId) -> Option<RawHandle> {
        self.live.remove(&id).map(|r| r.handle)
    }

    /// Swaps the handle behind a live id, returning the previous one.
    pub fn replace(&mut self, id: ResourceId, handle: RawHandle) -> Option<RawHandle> {
        self.live
            .get_mut(&id)
            .map(|r| std::mem::replace(&mut r.handle, handle))
    }

    pub fn is_live(&self, id: ResourceId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_count_of(&self, kind: ResourceKind) -> usize {
        self.live.values().filter(|r| r.handle.kind() == kind).count()
    }

    /// Logs every live resource and returns how many there are.
    pub fn report_leaks(&self) -> usize {
        for (id, resource) in &self.live {
            log::warn!(
                "leaked {} {} `{}`",
                resource.handle.kind(),
                id,
                resource.label
            );
        }
        self.live.len()
    }

    /// Deletes every live object, newest first, and returns how many were deleted.
    pub fn dispose_all(&mut self, gpu: &mut dyn Gpu) -> usize {
        let live = std::mem::take(&mut self.live);
        let count = live.len();
        for (id, resource) in live.into_iter().rev() {
            log::debug!("disposing {} {} `{}`", resource.handle.kind(), id, resource.label);
            resource.handle.delete(gpu);
        }
        count
    }
}

/// Ties one GPU object to the registry. Shared by every resource type.
#[derive(Debug)]
pub(crate) struct Registration {
    state: Rc<GpuState>,
    id: ResourceId,
    kind: ResourceKind,
}

impl Registration {
    pub(crate) fn new(state: &Rc<GpuState>, handle: RawHandle, label: &str) -> Self {
        let id = state.registry().register(handle, label);
        log::debug!("created {} {} `{}`", handle.kind(), id, label);
        Self {
            state: state.clone(),
            id,
            kind: handle.kind(),
        }
    }

    pub(crate) fn id(&self) -> ResourceId {
        self.id
    }

    pub(crate) fn state(&self) -> &Rc<GpuState> {
        &self.state
    }

    pub(crate) fn is_disposed(&self) -> bool {
        !self.state.registry().is_live(self.id)
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed {
                kind: self.kind,
                id: self.id.value(),
            });
        }
        Ok(())
    }

    /// Unregisters and deletes the object. Returns false if it was already disposed.
    pub(crate) fn dispose(&self) -> bool {
        let handle = self.state.registry().unregister(self.id);
        match handle {
            Some(handle) => {
                log::debug!("disposed {} {}", self.kind, self.id);
                handle.delete(&mut **self.state.gpu());
                true
            }
            None => false,
        }
    }
}
