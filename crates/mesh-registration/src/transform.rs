//! Rigid transforms and the weighted Kabsch solve.

use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, UnitQuaternion, Vector3};

use crate::error::{MeshError, MeshResult};
use crate::types::Mesh;

/// A rotation followed by a translation: `p ↦ R p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    /// Create an identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Create a pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    pub fn from_rotation_translation(
        rotation: UnitQuaternion<f64>,
        translation: Vector3<f64>,
    ) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Apply the transformation to a point.
    #[inline]
    pub fn apply_to_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.rotation * point + self.translation
    }

    /// Apply the rotation only.
    #[inline]
    pub fn apply_to_vector(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * vector
    }

    /// Transform vertex positions and rotate any stored normals.
    pub fn apply_to_mesh(&self, mesh: &mut Mesh) {
        for v in &mut mesh.vertices {
            v.position = self.apply_to_point(&v.position);
            if let Some(n) = v.normal.as_mut() {
                *n = self.apply_to_vector(n);
            }
        }
    }

    /// Compose with another transformation (self applied first, then other).
    pub fn then(&self, other: &RigidTransform) -> RigidTransform {
        RigidTransform {
            rotation: other.rotation * self.rotation,
            translation: other.rotation * self.translation + other.translation,
        }
    }

    /// Get the inverse transformation.
    pub fn inverse(&self) -> RigidTransform {
        let rotation = self.rotation.inverse();
        RigidTransform {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// Convert to a 4x4 homogeneous transformation matrix.
    pub fn to_matrix4(&self) -> Matrix4<f64> {
        let mut m = self.rotation.to_homogeneous();
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Size of the update, used as the ICP stopping measure:
    /// rotation angle in radians plus translation length.
    pub fn magnitude(&self) -> f64 {
        self.rotation.angle() + self.translation.norm()
    }
}

/// Nearest proper rotation for a cross-covariance `H = Σ w · s · tᵀ`.
///
/// Returns `R = V Uᵀ` from `H = U Σ Vᵀ`, negating the singular vector of the
/// smallest singular value when the plain product would be a reflection.
/// Fails with `SingularSystem` when `H` has rank below two, because the
/// rotation is then not unique.
pub fn rotation_from_covariance(h: &Matrix3<f64>, stage: &'static str) -> MeshResult<Matrix3<f64>> {
    if !h.iter().all(|x| x.is_finite()) {
        return Err(MeshError::singular_system(stage, None, "non-finite covariance"));
    }
    let norm = h.norm();
    if norm < 1e-15 {
        return Err(MeshError::singular_system(stage, None, "zero covariance"));
    }

    let svd = h.svd(true, true);
    let u = svd.u.ok_or(MeshError::SvdFailed { stage })?;
    let v_t = svd.v_t.ok_or(MeshError::SvdFailed { stage })?;
    let sigma = svd.singular_values;

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| sigma[b].total_cmp(&sigma[a]));
    if sigma[order[1]] < 1e-12 * sigma[order[0]] {
        return Err(MeshError::singular_system(
            stage,
            None,
            format!("covariance has rank one (singular values {:?})", sigma.as_slice()),
        ));
    }

    let mut v = v_t.transpose();
    let mut rotation = v * u.transpose();
    if rotation.determinant() < 0.0 {
        let smallest = order[2];
        for i in 0..3 {
            v[(i, smallest)] = -v[(i, smallest)];
        }
        rotation = v * u.transpose();
    }
    Ok(rotation)
}

/// Weighted least-squares rigid transform mapping `source` onto `target`.
///
/// Minimizes `Σ wᵢ ‖R sᵢ + t - tᵢ‖²`. Requires a positive total weight and a
/// covariance of rank two or more.
pub fn weighted_rigid_transform(
    source: &[Point3<f64>],
    target: &[Point3<f64>],
    weights: &[f64],
) -> MeshResult<RigidTransform> {
    debug_assert_eq!(source.len(), target.len());
    debug_assert_eq!(source.len(), weights.len());

    let total: f64 = weights.iter().sum();
    if !(total > 0.0 && total.is_finite()) {
        return Err(MeshError::singular_system(
            "rigid alignment",
            None,
            "total correspondence weight is zero",
        ));
    }

    let weighted_mean = |points: &[Point3<f64>]| {
        points
            .iter()
            .zip(weights)
            .fold(Vector3::zeros(), |acc, (p, &w)| acc + p.coords * w)
            / total
    };
    let source_centroid = weighted_mean(source);
    let target_centroid = weighted_mean(target);

    let mut h = Matrix3::zeros();
    for ((s, t), &w) in source.iter().zip(target).zip(weights) {
        h += w * (s.coords - source_centroid) * (t.coords - target_centroid).transpose();
    }

    let r = rotation_from_covariance(&h, "rigid alignment")?;
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    let translation = target_centroid - rotation * source_centroid;
    Ok(RigidTransform::from_rotation_translation(rotation, translation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn sample_points() -> Vec<Point3<f64>> {
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 2.0, 0.0),
            Point3::new(0.0, 0.0, 3.0),
            Point3::new(1.0, 1.0, 1.0),
        ]
    }

    fn test_transform() -> RigidTransform {
        RigidTransform::from_rotation_translation(
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.7),
            Vector3::new(0.5, -1.0, 2.0),
        )
    }

    #[test]
    fn test_mesh_normals_rotate_without_translating() {
        let t = RigidTransform::from_rotation_translation(
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2),
            Vector3::new(4.0, 0.0, 0.0),
        );
        let mut mesh = Mesh::icosphere(0);
        mesh.compute_vertex_normals();
        let before = mesh.clone();
        t.apply_to_mesh(&mut mesh);
        let mut recomputed = mesh.clone();
        recomputed.compute_vertex_normals();

        for ((moved, original), fresh) in mesh
            .vertices
            .iter()
            .zip(&before.vertices)
            .zip(&recomputed.vertices)
        {
            assert!((moved.normal.unwrap() - fresh.normal.unwrap()).norm() < 1e-12);
            assert!((moved.position - t.apply_to_point(&original.position)).norm() < 1e-12);
            let (n, n0) = (moved.normal.unwrap(), original.normal.unwrap());
            assert!((n - t.apply_to_vector(&n0)).norm() < 1e-12);
            assert!((n.norm() - 1.0).abs() < 1e-12);
        }
        let x = t.apply_to_vector(&Vector3::x());
        assert!((x - Vector3::y()).norm() < 1e-12);
    }

    #[test]
    fn test_compose_and_inverse() {
        let t = test_transform();
        let round = t.then(&t.inverse());
        let p = Point3::new(3.0, -2.0, 1.0);
        assert!((round.apply_to_point(&p) - p).norm() < 1e-12);
        assert!(round.magnitude() < 1e-12);

        let twice = t.then(&t);
        let expected = t.apply_to_point(&t.apply_to_point(&p));
        assert!((twice.apply_to_point(&p) - expected).norm() < 1e-12);
    }

    #[test]
    fn test_matrix4_matches_point_application() {
        let t = test_transform();
        let p = Point3::new(1.0, 2.0, 3.0);
        let m = t.to_matrix4();
        let h = m * p.to_homogeneous();
        assert!((Point3::from_homogeneous(h).unwrap() - t.apply_to_point(&p)).norm() < 1e-12);
    }

    #[test]
    fn test_weighted_kabsch_recovers_transform() {
        let t = test_transform();
        let source = sample_points();
        let target: Vec<_> = source.iter().map(|p| t.apply_to_point(p)).collect();
        let weights = vec![1.0, 0.5, 2.0, 1.0, 0.25];

        let found = weighted_rigid_transform(&source, &target, &weights).unwrap();
        assert!(found.rotation.angle_to(&t.rotation) < 1e-9);
        assert!((found.translation - t.translation).norm() < 1e-9);
    }

    #[test]
    fn test_zero_weight_is_numerical_error() {
        let points = sample_points();
        let err = weighted_rigid_transform(&points, &points, &[0.0; 5]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SingularSystem);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_reflection_is_never_returned() {
        // Mirror image across the xy-plane: best proper rotation, not a flip.
        let source = sample_points();
        let target: Vec<_> = source.iter().map(|p| Point3::new(p.x, p.y, -p.z)).collect();
        let mut h = Matrix3::zeros();
        for (s, t) in source.iter().zip(&target) {
            h += s.coords * t.coords.transpose();
        }
        let r = rotation_from_covariance(&h, "test").unwrap();
        assert!((r.determinant() - 1.0).abs() < 1e-9);
        assert!((r * r.transpose() - Matrix3::identity()).norm() < 1e-9);
    }

    #[test]
    fn test_planar_points_still_solve() {
        let source = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
        ];
        let t = test_transform();
        let target: Vec<_> = source.iter().map(|p| t.apply_to_point(p)).collect();
        let found = weighted_rigid_transform(&source, &target, &[1.0; 4]).unwrap();
        assert!(found.rotation.angle_to(&t.rotation) < 1e-9);
    }

    #[test]
    fn test_collinear_points_are_rank_deficient() {
        let source = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        let err = weighted_rigid_transform(&source, &source, &[1.0; 3]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SingularSystem);
    }
}
