//! The concrete [`RenderPass`](crate::render::RenderPass)es shipped with the engine.
//!
//! - `scene` draws the scene graph into whatever is bound
//! - `shadow` renders depth from a light into an offscreen target
//! - `resolution` renders at a fraction of the viewport and scales the result up

pub mod resolution;
pub mod scene;
pub mod shadow;

pub use resolution::ResolutionScalePass;
pub use scene::ScenePass;
pub use shadow::ShadowPass;
