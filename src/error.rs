//! Error taxonomy of the rendering core.
//!
//! Construction-time failures (buffers, textures, programs) are returned to the immediate
//! caller. Per-frame failures such as a program that is still linking are absorbed by the
//! renderer and never reach this type.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::data_structures::scene_graph::NodeId;

pub type Result<T> = std::result::Result<T, Error>;

/// The kind of GPU object a resource wraps. Used for registry bookkeeping and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Shader,
    Program,
    Framebuffer,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Buffer => "buffer",
            ResourceKind::Texture => "texture",
            ResourceKind::Shader => "shader",
            ResourceKind::Program => "program",
            ResourceKind::Framebuffer => "framebuffer",
        };
        f.write_str(name)
    }
}

/// Invalid scene-graph operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StructuralError {
    #[error("appending {child:?} under {parent:?} would create a cycle")]
    Cycle { parent: NodeId, child: NodeId },
    #[error("node {child:?} already has parent {parent:?}")]
    AlreadyParented { child: NodeId, parent: NodeId },
    #[error("node {child:?} is not a child of {parent:?}")]
    NotAChild { parent: NodeId, child: NodeId },
    #[error("node {0:?} does not exist (stale or destroyed id)")]
    UnknownNode(NodeId),
}

/// Shader compile or program link failure carrying the driver diagnostic.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CompileLinkError {
    #[error("{stage} shader failed to compile: {log}")]
    Compile { stage: &'static str, log: String },
    #[error("program failed to link: {log}")]
    Link { log: String },
}

/// A resource-cache factory rejected. Every holder of the pending reference observes the same value.
#[derive(Clone, Debug, Error)]
#[error("failed to acquire `{key}`: {source}")]
pub struct AcquisitionError {
    pub key: String,
    #[source]
    pub source: Arc<Error>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("failed to create {kind} `{label}`: the device returned no handle")]
    ResourceCreation { kind: ResourceKind, label: String },
    #[error(transparent)]
    CompileLink(#[from] CompileLinkError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error("binding mismatch: {0}")]
    BindingMismatch(String),
    #[error("{kind} #{id} was used after it was disposed")]
    Disposed { kind: ResourceKind, id: u64 },
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("out of bounds: {0}")]
    OutOfBounds(String),
}

impl Error {
    pub(crate) fn creation(kind: ResourceKind, label: impl Into<String>) -> Self {
        Error::ResourceCreation {
            kind,
            label: label.into(),
        }
    }
}
