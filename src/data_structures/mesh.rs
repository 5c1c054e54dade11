//! Meshes: the leaves of the scene graph.
//!
//! A [`Mesh`] owns one vertex buffer and one index buffer on the device plus the
//! attribute descriptors that say how the vertex bytes are laid out. Construction
//! validates everything up front; a mesh that exists can always be drawn once it has a
//! shader.

use std::{fmt, rc::Rc};

use log::warn;

use crate::{
    context::RenderContext,
    data_structures::scene_graph::SceneNode,
    gpu::{
        BufferId, BufferKind, GraphicsDevice, IndexFormat, LayoutAttribute, VertexFormat,
        VertexLayout,
    },
    shader::Shader,
};

/// What a vertex attribute means to a shader. Each semantic has a fixed shader location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Semantic {
    Position,
    Normal,
    TexCoord,
    Color,
}

impl Semantic {
    pub fn location(self) -> u32 {
        match self {
            Semantic::Position => 0,
            Semantic::Normal => 1,
            Semantic::TexCoord => 2,
            Semantic::Color => 3,
        }
    }
}

/// Where one attribute lives inside an interleaved vertex. Components are `f32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub semantic: Semantic,
    /// Byte offset inside one vertex.
    pub offset: u64,
    /// 1 to 4.
    pub components: u32,
    /// Byte size of one whole vertex.
    pub stride: u64,
}

impl VertexAttribute {
    pub const fn new(semantic: Semantic, offset: u64, components: u32, stride: u64) -> Self {
        Self {
            semantic,
            offset,
            components,
            stride,
        }
    }

    fn format(&self) -> Option<VertexFormat> {
        match self.components {
            1 => Some(VertexFormat::Float32),
            2 => Some(VertexFormat::Float32x2),
            3 => Some(VertexFormat::Float32x3),
            4 => Some(VertexFormat::Float32x4),
            _ => None,
        }
    }
}

/// Index data as produced by a loader.
#[derive(Clone, Debug, PartialEq)]
pub enum Indices {
    /// Byte indices are not drawable on every backend and are rejected.
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl Indices {
    pub fn len(&self) -> usize {
        match self {
            Indices::U8(v) => v.len(),
            Indices::U16(v) => v.len(),
            Indices::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why a mesh could not be built. None of these are recoverable for that mesh.
#[derive(Debug)]
pub enum MeshError {
    MissingPosition,
    UnsupportedIndexType(&'static str),
    NoIndices,
    NoVertices,
    /// Vertex bytes are not a whole number of vertices.
    RaggedVertices { len: usize, stride: u64 },
    InvalidAttribute { semantic: Semantic, reason: String },
    /// The device refused to create a buffer.
    Device(anyhow::Error),
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::MissingPosition => write!(f, "mesh has no position attribute"),
            MeshError::UnsupportedIndexType(ty) => {
                write!(f, "index element type {} is not supported", ty)
            }
            MeshError::NoIndices => write!(f, "mesh has no indices"),
            MeshError::NoVertices => write!(f, "mesh has no vertex data"),
            MeshError::RaggedVertices { len, stride } => write!(
                f,
                "{} bytes of vertex data is not a multiple of the {} byte stride",
                len, stride
            ),
            MeshError::InvalidAttribute { semantic, reason } => {
                write!(f, "invalid {:?} attribute: {}", semantic, reason)
            }
            MeshError::Device(e) => write!(f, "device error: {}", e),
        }
    }
}

impl std::error::Error for MeshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MeshError::Device(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// The device-side half of a mesh, handed to [`Shader::bind_mesh`].
#[derive(Clone, Debug, PartialEq)]
pub struct MeshBuffers {
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub index_format: IndexFormat,
    pub index_count: u32,
    pub layout: VertexLayout,
}

/// Everything needed to build a [`Mesh`].
#[derive(Clone, Debug)]
pub struct MeshDescriptor<'a> {
    pub label: &'a str,
    pub vertices: &'a [u8],
    pub attributes: &'a [VertexAttribute],
    pub indices: Indices,
}

fn validate(desc: &MeshDescriptor<'_>) -> Result<VertexLayout, MeshError> {
    let position = desc
        .attributes
        .iter()
        .find(|a| a.semantic == Semantic::Position)
        .ok_or(MeshError::MissingPosition)?;
    let stride = position.stride;

    let mut attributes = Vec::with_capacity(desc.attributes.len());
    for attribute in desc.attributes {
        let invalid = |reason: String| MeshError::InvalidAttribute {
            semantic: attribute.semantic,
            reason,
        };
        let format = attribute
            .format()
            .ok_or_else(|| invalid(format!("{} components", attribute.components)))?;
        if attribute.stride != stride {
            return Err(invalid(format!(
                "stride {} differs from the position stride {}",
                attribute.stride, stride
            )));
        }
        if attribute.offset + format.size() > stride {
            return Err(invalid(format!(
                "offset {} + size {} overflows stride {}",
                attribute.offset,
                format.size(),
                stride
            )));
        }
        if attributes
            .iter()
            .any(|a: &LayoutAttribute| a.location == attribute.semantic.location())
        {
            return Err(invalid("declared twice".to_string()));
        }
        attributes.push(LayoutAttribute {
            location: attribute.semantic.location(),
            format,
            offset: attribute.offset,
        });
    }

    if desc.vertices.is_empty() {
        return Err(MeshError::NoVertices);
    }
    if stride == 0 || desc.vertices.len() as u64 % stride != 0 {
        return Err(MeshError::RaggedVertices {
            len: desc.vertices.len(),
            stride,
        });
    }
    if desc.indices.is_empty() {
        return Err(MeshError::NoIndices);
    }
    if let Indices::U8(_) = desc.indices {
        return Err(MeshError::UnsupportedIndexType("u8"));
    }
    Ok(VertexLayout { stride, attributes })
}

/// A drawable leaf node.
pub struct Mesh {
    label: String,
    attributes: Vec<VertexAttribute>,
    buffers: Option<MeshBuffers>,
    shader: Option<Rc<dyn Shader>>,
}

impl Mesh {
    /// Validates `desc` and uploads its buffers.
    pub fn new(
        device: &mut dyn GraphicsDevice,
        desc: MeshDescriptor<'_>,
    ) -> Result<Self, MeshError> {
        let layout = validate(&desc)?;
        let (index_bytes, index_format): (&[u8], IndexFormat) = match &desc.indices {
            Indices::U16(v) => (bytemuck::cast_slice(v), IndexFormat::Uint16),
            Indices::U32(v) => (bytemuck::cast_slice(v), IndexFormat::Uint32),
            Indices::U8(_) => return Err(MeshError::UnsupportedIndexType("u8")),
        };

        let vertex_buffer = device
            .create_buffer(
                BufferKind::Vertex,
                &format!("{} Vertex Buffer", desc.label),
                desc.vertices,
            )
            .map_err(MeshError::Device)?;
        let index_buffer = match device.create_buffer(
            BufferKind::Index,
            &format!("{} Index Buffer", desc.label),
            index_bytes,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                device.delete_buffer(vertex_buffer);
                return Err(MeshError::Device(e));
            }
        };

        Ok(Self {
            label: desc.label.to_string(),
            attributes: desc.attributes.to_vec(),
            buffers: Some(MeshBuffers {
                vertex_buffer,
                index_buffer,
                index_format,
                index_count: desc.indices.len() as u32,
                layout,
            }),
            shader: None,
        })
    }

    pub fn with_shader(mut self, shader: Rc<dyn Shader>) -> Self {
        self.shader = Some(shader);
        self
    }

    pub fn set_shader(&mut self, shader: Option<Rc<dyn Shader>>) {
        self.shader = shader;
    }

    pub fn shader(&self) -> Option<&Rc<dyn Shader>> {
        self.shader.as_ref()
    }

    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    /// `None` once the mesh has been released.
    pub fn buffers(&self) -> Option<&MeshBuffers> {
        self.buffers.as_ref()
    }

    pub fn index_count(&self) -> u32 {
        self.buffers.as_ref().map_or(0, |b| b.index_count)
    }
}

impl SceneNode for Mesh {
    fn label(&self) -> &str {
        &self.label
    }

    fn render(&self, ctx: &mut RenderContext) {
        let Some(buffers) = &self.buffers else {
            warn!("mesh '{}' was released and cannot be drawn", self.label);
            ctx.stats_mut().skipped_draws += 1;
            return;
        };
        let shader = match ctx.shader_override().or(self.shader.as_ref()) {
            Some(shader) => shader.clone(),
            None => {
                warn!("mesh '{}' has no shader, skipping draw", self.label);
                ctx.stats_mut().skipped_draws += 1;
                return;
            }
        };

        ctx.use_shader(shader.clone());
        shader.bind_mesh(ctx, buffers);
        ctx.device().draw_indexed(buffers.index_count);
        ctx.stats_mut().draws += 1;
        shader.unbind_mesh(ctx);
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        if let Some(buffers) = self.buffers.take() {
            ctx.device().delete_buffer(buffers.vertex_buffer);
            ctx.device().delete_buffer(buffers.index_buffer);
        }
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        if self.buffers.is_some() {
            warn!("mesh '{}' dropped without release, its buffers leak", self.label);
        }
    }
}

impl fmt::Debug for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mesh")
            .field("label", &self.label)
            .field("buffers", &self.buffers)
            .field("shader", &self.shader.as_ref().map(|s| s.label().to_string()))
            .finish()
    }
}
