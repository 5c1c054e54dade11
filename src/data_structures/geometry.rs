//! Procedural geometry for tests, demos and debug drawing.

use std::mem;

use log::warn;

use crate::{
    data_structures::mesh::{Indices, Mesh, MeshDescriptor, MeshError, Semantic, VertexAttribute},
    gpu::GraphicsDevice,
};

/// Upper bound on [`Geometry::plane`] subdivision, about a million vertices.
pub const MAX_PLANE_DIVISIONS: u16 = 1024;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tex_coords: [f32; 2],
}

impl Vertex {
    const STRIDE: u64 = mem::size_of::<Vertex>() as u64;

    pub const ATTRIBUTES: [VertexAttribute; 3] = [
        VertexAttribute::new(Semantic::Position, 0, 3, Self::STRIDE),
        VertexAttribute::new(Semantic::Normal, mem::size_of::<[f32; 3]>() as u64, 3, Self::STRIDE),
        VertexAttribute::new(
            Semantic::TexCoord,
            mem::size_of::<[f32; 6]>() as u64,
            2,
            Self::STRIDE,
        ),
    ];

    fn new(position: [f32; 3], normal: [f32; 3], tex_coords: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            tex_coords,
        }
    }
}

/// Interleaved vertices plus triangle-list indices.
///
/// Indices are kept as `u32` while building and narrowed to `u16` on upload when every
/// vertex fits.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Geometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Geometry {
    /// A `width` x `height` rectangle in the XY plane facing +Z.
    pub fn quad(width: f32, height: f32) -> Self {
        let (w, h) = (width / 2.0, height / 2.0);
        let n = [0.0, 0.0, 1.0];
        Self {
            vertices: vec![
                Vertex::new([-w, -h, 0.0], n, [0.0, 1.0]),
                Vertex::new([w, -h, 0.0], n, [1.0, 1.0]),
                Vertex::new([w, h, 0.0], n, [1.0, 0.0]),
                Vertex::new([-w, h, 0.0], n, [0.0, 0.0]),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    /// A ground plane in XZ facing +Y, split into `divisions` x `divisions` cells.
    /// `divisions` is clamped to `1..=MAX_PLANE_DIVISIONS`.
    pub fn plane(size: f32, divisions: u16) -> Self {
        if divisions > MAX_PLANE_DIVISIONS {
            warn!(
                "plane with {} divisions clamped to {}",
                divisions, MAX_PLANE_DIVISIONS
            );
        }
        let divisions = divisions.clamp(1, MAX_PLANE_DIVISIONS);
        let step = size / divisions as f32;
        let half = size / 2.0;
        let row = divisions as u32 + 1;

        let mut vertices = Vec::with_capacity(row as usize * row as usize);
        for z in 0..row {
            for x in 0..row {
                let (fx, fz) = (x as f32, z as f32);
                vertices.push(Vertex::new(
                    [fx * step - half, 0.0, fz * step - half],
                    [0.0, 1.0, 0.0],
                    [fx / divisions as f32, fz / divisions as f32],
                ));
            }
        }

        let mut indices = Vec::with_capacity(divisions as usize * divisions as usize * 6);
        for z in 0..divisions as u32 {
            for x in 0..divisions as u32 {
                let i = z * row + x;
                // counter-clockwise seen from +Y
                indices.extend_from_slice(&[i, i + row, i + 1, i + 1, i + row, i + row + 1]);
            }
        }
        Self { vertices, indices }
    }

    /// An axis-aligned cube centred on the origin, four vertices per face.
    pub fn cube(size: f32) -> Self {
        let s = size / 2.0;
        // normal, then the face's u and v axes
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];

        let mut geometry = Self::default();
        for (n, u, v) in faces {
            let base = geometry.vertices.len() as u32;
            for (su, sv, uv) in [
                (-1.0, -1.0, [0.0, 1.0]),
                (1.0, -1.0, [1.0, 1.0]),
                (1.0, 1.0, [1.0, 0.0]),
                (-1.0, 1.0, [0.0, 0.0]),
            ] {
                let p = [0, 1, 2].map(|i| (n[i] + su * u[i] + sv * v[i]) * s);
                geometry.vertices.push(Vertex::new(p, n, uv));
            }
            geometry
                .indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        geometry
    }

    /// The narrowest index type that can address every vertex.
    pub fn packed_indices(&self) -> Indices {
        if self.vertices.len() <= u16::MAX as usize + 1 {
            Indices::U16(self.indices.iter().map(|&i| i as u16).collect())
        } else {
            Indices::U32(self.indices.clone())
        }
    }

    /// Uploads the geometry as a new mesh.
    pub fn into_mesh(
        self,
        device: &mut dyn GraphicsDevice,
        label: &str,
    ) -> Result<Mesh, MeshError> {
        let indices = self.packed_indices();
        Mesh::new(
            device,
            MeshDescriptor {
                label,
                vertices: bytemuck::cast_slice(&self.vertices),
                attributes: &Vertex::ATTRIBUTES,
                indices,
            },
        )
    }
}
