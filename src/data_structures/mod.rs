//! Engine data structures: transforms, meshes and the scene graph.
//!
//! - `transform` is the affine matrix every node composes
//! - `mesh` holds validated vertex/index buffers and the draw leaf
//! - `geometry` builds simple meshes procedurally
//! - `scene_graph` enables hierarchical scene organization

pub mod geometry;
pub mod mesh;
pub mod scene_graph;
pub mod transform;
