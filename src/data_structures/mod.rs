//! Engine data structures: scene graph, geometry, materials and in-memory textures.
//!
//! - `scene_graph` enables hierarchical scene organization with lazy world transforms
//! - `transform` holds the local translation/rotation/scale of a node
//! - `geometry` contains vertex attributes, interleaving and geometry helpers
//! - `material` pairs shader sources with per-mesh parameters
//! - `texture` holds decoded image data waiting to be uploaded

pub mod geometry;
pub mod material;
pub mod scene_graph;
pub mod texture;
pub mod transform;
