//! scenic-bridge
//!
//! A small retained-mode scene graph that renders through a GL-style graphics
//! device and keeps its transforms in step with a rigid-body simulation. A frame
//! steps physics, snapshots every body's pose, then runs an ordered list of render
//! passes over the same tree. Every pass hands the bound render target and viewport
//! back the way it found them.
//!
//! High-level modules
//! - `camera`: view/projection for the active camera and for light views
//! - `config`: engine, surface and physics configuration
//! - `context`: render context threaded through traversal (device, transform stack,
//!   camera, shader override, shadow map, frame statistics)
//! - `data_structures`: transforms, the scene graph, meshes and geometry builders
//! - `engine`: the frame driver and its listener hooks
//! - `flow`: winit runner
//! - `gpu`: the graphics device seam with headless and wgpu backends
//! - `offscreen`: lazily (re)allocated render-to-texture targets
//! - `passes`: scene, shadow and resolution-scale passes
//! - `physics`: fixed-timestep stepping and the live/buffered transform bridge
//! - `render`: the pass contract and the pass driver
//! - `shader`: the shader contract meshes draw through
//!

pub mod camera;
pub mod config;
pub mod context;
pub mod data_structures;
pub mod engine;
pub mod flow;
pub mod gpu;
pub mod offscreen;
pub mod passes;
pub mod physics;
pub mod render;
pub mod shader;

// Re-exports commonly used types for convenience in downstream code.
pub use cgmath;
pub use config::{EngineConfig, PhysicsConfig, StepMode};
pub use context::RenderContext;
pub use data_structures::{
    mesh::Mesh,
    scene_graph::{Group, NodeId, SceneNode, TransformGroup},
    transform::Transform,
};
pub use engine::{Engine, EngineListener};
pub use render::{PassStage, RenderPass};
