//! The shader contract meshes draw through.
//!
//! The engine never looks inside a shader. It only needs the three operations of
//! [`Shader`]: bind the program, bind one mesh's vertex data, unbind it again. Program
//! compilation belongs to whoever creates the shader.

use log::trace;

use crate::{
    context::RenderContext,
    data_structures::mesh::MeshBuffers,
    gpu::ProgramId,
};

pub trait Shader {
    fn label(&self) -> &str {
        "shader"
    }

    /// Makes this shader's program current.
    fn bind(&self, ctx: &mut RenderContext);

    /// Points the program's inputs at `mesh` and uploads per-draw state.
    fn bind_mesh(&self, ctx: &mut RenderContext, mesh: &MeshBuffers);

    /// Undoes whatever `bind_mesh` bound that would otherwise leak into the next draw.
    fn unbind_mesh(&self, ctx: &mut RenderContext);
}

/// Texture slot the shadow map is bound to.
pub const SHADOW_MAP_SLOT: u32 = 0;

/// A [`Shader`] backed by a device program.
///
/// Uploads the context's matrices with every mesh. With `samples_shadow_map` it also
/// binds the current [`ShadowMap`](crate::context::ShadowMap) to [`SHADOW_MAP_SLOT`].
#[derive(Debug, Clone)]
pub struct ProgramShader {
    label: String,
    program: ProgramId,
    samples_shadow_map: bool,
}

impl ProgramShader {
    pub fn new(label: impl Into<String>, program: ProgramId) -> Self {
        Self {
            label: label.into(),
            program,
            samples_shadow_map: false,
        }
    }

    pub fn sampling_shadow_map(mut self) -> Self {
        self.samples_shadow_map = true;
        self
    }

    pub fn program(&self) -> ProgramId {
        self.program
    }
}

impl Shader for ProgramShader {
    fn label(&self) -> &str {
        &self.label
    }

    fn bind(&self, ctx: &mut RenderContext) {
        ctx.device().use_program(self.program);
    }

    fn bind_mesh(&self, ctx: &mut RenderContext, mesh: &MeshBuffers) {
        let device = ctx.device();
        device.bind_vertex_buffer(mesh.vertex_buffer, &mesh.layout);
        device.bind_index_buffer(mesh.index_buffer, mesh.index_format);
        if self.samples_shadow_map {
            let shadow = ctx.shadow_map().map(|s| s.texture);
            if shadow.is_none() {
                trace!("'{}' samples a shadow map but no pre-pass produced one", self.label);
            }
            ctx.bind_texture(SHADOW_MAP_SLOT, shadow);
        }
        let uniforms = ctx.draw_uniforms();
        ctx.device().set_draw_uniforms(&uniforms);
    }

    fn unbind_mesh(&self, ctx: &mut RenderContext) {
        if self.samples_shadow_map {
            ctx.bind_texture(SHADOW_MAP_SLOT, None);
        }
    }
}
