//! Cameras: a view matrix plus a projection.
//!
//! cgmath builds OpenGL-style clip space (z in -1..1); wgpu expects z in 0..1, so every
//! projection goes through [`OPENGL_TO_WGPU_MATRIX`].

use cgmath::{Deg, InnerSpace, Matrix4, Point3, Vector3};

#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: Matrix4<f32> = Matrix4::new(
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
);

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    Perspective {
        fovy: Deg<f32>,
        aspect: f32,
        znear: f32,
        zfar: f32,
    },
    Orthographic {
        half_width: f32,
        half_height: f32,
        znear: f32,
        zfar: f32,
    },
}

impl Projection {
    pub fn matrix(&self) -> Matrix4<f32> {
        let gl = match *self {
            Projection::Perspective {
                fovy,
                aspect,
                znear,
                zfar,
            } => cgmath::perspective(fovy, aspect, znear, zfar),
            Projection::Orthographic {
                half_width,
                half_height,
                znear,
                zfar,
            } => cgmath::ortho(-half_width, half_width, -half_height, half_height, znear, zfar),
        };
        OPENGL_TO_WGPU_MATRIX * gl
    }
}

/// The active point of view. Lives in the [`RenderContext`](crate::context::RenderContext).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub eye: Point3<f32>,
    pub target: Point3<f32>,
    pub up: Vector3<f32>,
    pub projection: Projection,
}

impl Camera {
    pub fn perspective(
        eye: impl Into<Point3<f32>>,
        target: impl Into<Point3<f32>>,
        fovy: Deg<f32>,
        aspect: f32,
    ) -> Self {
        let (eye, target) = (eye.into(), target.into());
        Self {
            eye,
            target,
            up: up_for(eye, target),
            projection: Projection::Perspective {
                fovy,
                aspect,
                znear: 0.1,
                zfar: 500.0,
            },
        }
    }

    /// An orthographic camera, the usual choice for a directional light.
    pub fn orthographic(
        eye: impl Into<Point3<f32>>,
        target: impl Into<Point3<f32>>,
        half_extent: f32,
        depth: f32,
    ) -> Self {
        let (eye, target) = (eye.into(), target.into());
        Self {
            eye,
            target,
            up: up_for(eye, target),
            projection: Projection::Orthographic {
                half_width: half_extent,
                half_height: half_extent,
                znear: 0.1,
                zfar: depth,
            },
        }
    }

    pub fn look_at(&mut self, eye: impl Into<Point3<f32>>, target: impl Into<Point3<f32>>) {
        self.eye = eye.into();
        self.target = target.into();
        self.up = up_for(self.eye, self.target);
    }

    /// Keeps perspective projections in step with the surface.
    pub fn set_aspect(&mut self, new_aspect: f32) {
        if let Projection::Perspective { aspect, .. } = &mut self.projection {
            *aspect = new_aspect;
        }
    }

    pub fn view(&self) -> Matrix4<f32> {
        Matrix4::look_at_rh(self.eye, self.target, self.up)
    }

    pub fn view_proj(&self) -> Matrix4<f32> {
        self.projection.matrix() * self.view()
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Point3::new(0.0, 0.0, 0.0),
            target: Point3::new(0.0, 0.0, -1.0),
            up: Vector3::unit_y(),
            projection: Projection::Perspective {
                fovy: Deg(45.0),
                aspect: 1.0,
                znear: 0.1,
                zfar: 500.0,
            },
        }
    }
}

// +Y unless we look straight along it.
fn up_for(eye: Point3<f32>, target: Point3<f32>) -> Vector3<f32> {
    let forward = target - eye;
    if forward.magnitude2() > 0.0 && forward.normalize().y.abs() > 0.999 {
        Vector3::unit_z()
    } else {
        Vector3::unit_y()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Transform, Vector4};

    #[test]
    fn target_projects_to_screen_centre() {
        let camera = Camera::perspective([0.0, 0.0, 5.0], [0.0, 0.0, 0.0], Deg(60.0), 1.0);
        let clip = camera.view_proj() * Vector4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn orthographic_depth_is_in_wgpu_range() {
        let camera = Camera::orthographic([0.0, 10.0, 0.0], [0.0, 0.0, 0.0], 5.0, 20.0);
        assert_eq!(camera.up, Vector3::unit_z());
        let p = camera.view_proj().transform_point(Point3::new(0.0, 0.0, 0.0));
        assert!(p.z >= 0.0 && p.z <= 1.0);
    }
}
