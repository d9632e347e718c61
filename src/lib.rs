//! scene-ngin
//!
//! A scene-graph oriented rendering core. Applications build a tree of group, mesh, light and
//! camera nodes; the engine keeps a render cache of GPU-ready draw entries in sync with that tree
//! incrementally, shares programs, textures and geometry buffers between meshes through
//! reference-counted caches and tracks every GPU object so nothing leaks.
//!
//! High-level modules
//! - `context`: shared GPU state, resource registry and caches, cooperative executor, configuration
//! - `data_structures`: scene graph, geometry, materials and in-memory textures
//! - `error`: error types of the core
//! - `flow`: reference frame loop and logging setup
//! - `gpu`: the device command surface with headless and wgpu backends
//! - `render`: GPU resources, programs, render cache synchronisation and drawing
//! - `resources`: resource registry, resource caches and asset loading
//!

pub mod context;
pub mod data_structures;
pub mod error;
pub mod flow;
pub mod gpu;
pub mod render;
pub mod resources;

pub use error::{Error, Result};

// Re-exports commonly used types for convenience in downstream code.
pub use cgmath;
pub use wgpu;
