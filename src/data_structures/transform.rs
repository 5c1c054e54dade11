//! Affine transforms.
//!
//! A [`Transform`] is a column-major `cgmath::Matrix4<f32>` that is only ever built
//! from translations, rotations and scales, so it is always affine. Composition
//! follows the usual convention: `parent * child` maps child-local points into the
//! parent's space.

use std::{fmt, ops::Mul};

use cgmath::{
    EuclideanSpace, InnerSpace, Matrix4, Point3, Quaternion, Rad, SquareMatrix, Transform as _,
    Vector3, Vector4,
};

const AFFINE_EPSILON: f32 = 1e-6;

/// Rejected attempts to build a [`Transform`] from a raw matrix.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformError {
    /// The bottom row was not `(0, 0, 0, 1)`.
    NotAffine([f32; 4]),
    /// A component was NaN or infinite.
    NotFinite,
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformError::NotAffine(row) => {
                write!(f, "matrix is not affine, bottom row is {:?}", row)
            }
            TransformError::NotFinite => write!(f, "matrix contains NaN or infinite components"),
        }
    }
}

impl std::error::Error for TransformError {}

/// A 4x4 affine transform. The default is the identity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    matrix: Matrix4<f32>,
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    pub fn from_translation(translation: impl Into<Vector3<f32>>) -> Self {
        Self {
            matrix: Matrix4::from_translation(translation.into()),
        }
    }

    pub fn from_rotation(rotation: Quaternion<f32>) -> Self {
        Self {
            matrix: Matrix4::from(rotation.normalize()),
        }
    }

    pub fn from_angle_x(angle: impl Into<Rad<f32>>) -> Self {
        Self {
            matrix: Matrix4::from_angle_x(angle),
        }
    }

    pub fn from_angle_y(angle: impl Into<Rad<f32>>) -> Self {
        Self {
            matrix: Matrix4::from_angle_y(angle),
        }
    }

    pub fn from_angle_z(angle: impl Into<Rad<f32>>) -> Self {
        Self {
            matrix: Matrix4::from_angle_z(angle),
        }
    }

    pub fn from_scale(scale: impl Into<Vector3<f32>>) -> Self {
        let scale = scale.into();
        Self {
            matrix: Matrix4::from_nonuniform_scale(scale.x, scale.y, scale.z),
        }
    }

    /// Translation * rotation * scale, the order a scene editor applies them in.
    pub fn from_trs(
        translation: impl Into<Vector3<f32>>,
        rotation: Quaternion<f32>,
        scale: impl Into<Vector3<f32>>,
    ) -> Self {
        Self::from_translation(translation)
            * Self::from_rotation(rotation)
            * Self::from_scale(scale)
    }

    /// Wraps a raw matrix after checking that it is affine.
    pub fn try_from_matrix(matrix: Matrix4<f32>) -> Result<Self, TransformError> {
        let cols: [[f32; 4]; 4] = matrix.into();
        if cols.iter().flatten().any(|c| !c.is_finite()) {
            return Err(TransformError::NotFinite);
        }
        let bottom = [cols[0][3], cols[1][3], cols[2][3], cols[3][3]];
        let expected = [0.0, 0.0, 0.0, 1.0];
        if bottom
            .iter()
            .zip(expected.iter())
            .any(|(a, b)| (a - b).abs() > AFFINE_EPSILON)
        {
            return Err(TransformError::NotAffine(bottom));
        }
        Ok(Self { matrix })
    }

    /// Column-major array form, e.g. from a physics engine's `getOpenGLMatrix`.
    pub fn try_from_cols_array(cols: [[f32; 4]; 4]) -> Result<Self, TransformError> {
        Self::try_from_matrix(cols.into())
    }

    pub fn matrix(&self) -> &Matrix4<f32> {
        &self.matrix
    }

    pub fn to_cols_array(&self) -> [[f32; 4]; 4] {
        self.matrix.into()
    }

    /// The translation part.
    pub fn position(&self) -> Vector3<f32> {
        self.matrix.w.truncate()
    }

    /// Replaces the translation part and keeps rotation and scale.
    pub fn set_position(&mut self, position: impl Into<Vector3<f32>>) {
        let p = position.into();
        self.matrix.w = Vector4::new(p.x, p.y, p.z, 1.0);
    }

    pub fn with_position(mut self, position: impl Into<Vector3<f32>>) -> Self {
        self.set_position(position);
        self
    }

    pub fn transform_point(&self, point: impl Into<Point3<f32>>) -> Point3<f32> {
        self.matrix.transform_point(point.into())
    }

    /// Applies rotation and scale only.
    pub fn transform_vector(&self, vector: impl Into<Vector3<f32>>) -> Vector3<f32> {
        self.matrix.transform_vector(vector.into())
    }

    /// `None` for degenerate (zero-scale) transforms.
    pub fn inverse(&self) -> Option<Self> {
        self.matrix.invert().map(|matrix| Self { matrix })
    }

    /// `self` followed by `local`: the result maps `local`'s space into `self`'s parent.
    pub fn then(&self, local: &Transform) -> Self {
        Self {
            matrix: self.matrix * local.matrix,
        }
    }

    pub fn origin(&self) -> Point3<f32> {
        Point3::from_vec(self.position())
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul<Transform> for Transform {
    type Output = Transform;

    fn mul(self, rhs: Transform) -> Self::Output {
        self.then(&rhs)
    }
}

impl<'a, 'b> Mul<&'b Transform> for &'a Transform {
    type Output = Transform;

    fn mul(self, rhs: &'b Transform) -> Self::Output {
        self.then(rhs)
    }
}

impl From<Vector3<f32>> for Transform {
    fn from(position: Vector3<f32>) -> Self {
        Self::from_translation(position)
    }
}
