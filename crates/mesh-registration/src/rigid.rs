//! Robust rigid pre-alignment.
//!
//! Iterates closest-point matching and a Welsch-weighted Kabsch solve until
//! the per-iteration update becomes negligible. Distance rejection is left
//! to the non-rigid stage: before alignment the meshes can be far apart and
//! a normalized-frame threshold would discard most matches.

use nalgebra::Point3;
use tracing::{debug, info, warn};

use crate::correspondence::{RejectionPolicy, TargetSurface, count_valid, find_correspondences};
use crate::error::MeshResult;
use crate::landmark::Landmarks;
use crate::params::{RegistrationParams, RigidParams};
use crate::robust::{NuSchedule, median, welsch_weight};
use crate::transform::{RigidTransform, weighted_rigid_transform};
use crate::types::Mesh;

/// Outcome of the rigid stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RigidReport {
    /// ICP iterations run (pre-alignment not counted).
    pub iterations: usize,
    /// Always true: hitting the iteration cap is a quality issue, not a failure.
    pub converged: bool,
    /// Accumulated transform, pre-alignment included.
    pub transform: RigidTransform,
    /// RMS distance of accepted matches after the last update.
    pub rms_residual: f64,
    pub valid_correspondences: usize,
}

impl Default for RigidReport {
    fn default() -> Self {
        Self {
            iterations: 0,
            converged: true,
            transform: RigidTransform::identity(),
            rms_residual: 0.0,
            valid_correspondences: 0,
        }
    }
}

/// Rigid ICP state for one run.
#[derive(Debug, Clone)]
pub struct RigidAligner {
    settings: RigidParams,
    policy: RejectionPolicy,
    nu: NuSchedule,
    edge_length: f64,
    landmark_sources: Vec<usize>,
    landmark_targets: Vec<Point3<f64>>,
    landmark_weight: f64,
    transform: RigidTransform,
}

impl RigidAligner {
    /// Set up for `source`, whose mean edge length floors the robust scale.
    pub fn new(params: &RegistrationParams, source: &Mesh) -> Self {
        Self {
            settings: params.rigid.clone(),
            policy: RejectionPolicy::from_params(params).without_distance(),
            nu: params.nu,
            edge_length: source.mean_edge_length(),
            landmark_sources: Vec::new(),
            landmark_targets: Vec::new(),
            landmark_weight: params.gamma / params.alpha,
            transform: RigidTransform::identity(),
        }
    }

    /// Include landmark pairs in every Kabsch solve.
    ///
    /// Indices must already be validated against both meshes.
    pub fn with_landmarks(mut self, landmarks: &Landmarks, target: &Mesh) -> Self {
        self.landmark_sources = landmarks.source.clone();
        self.landmark_targets = landmarks.target_points(target);
        self
    }

    /// Transform accumulated so far.
    pub fn transform(&self) -> RigidTransform {
        self.transform
    }

    /// Move the source centroid onto the target centroid (if enabled).
    pub fn init(&mut self, source: &mut Mesh, target: &Mesh) -> RigidTransform {
        let step = match (self.settings.pre_align, source.centroid(), target.centroid()) {
            (true, Some(from), Some(to)) => RigidTransform::from_translation(to - from),
            _ => RigidTransform::identity(),
        };
        step.apply_to_mesh(source);
        self.transform = self.transform.then(&step);
        debug!(
            target: "mesh_registration::rigid",
            offset = %format!("{:.4?}", step.translation.as_slice()),
            "Pre-aligned centroids"
        );
        step
    }

    /// Run robust ICP on `source` in place.
    ///
    /// Numerical failures of a single solve end the loop early; the mesh
    /// keeps the last good pose.
    pub fn run(&mut self, source: &mut Mesh, surface: &TargetSurface) -> RigidReport {
        if source.vertices.iter().all(|v| v.normal.is_none()) {
            source.compute_vertex_normals();
        }

        let mut iterations = 0;
        for _ in 0..self.settings.max_iterations {
            let step = match self.iterate(source, surface) {
                Ok(step) => step,
                Err(err) => {
                    warn!(
                        target: "mesh_registration::rigid",
                        code = %err.code(),
                        iteration = iterations + 1,
                        "Rigid solve skipped: {}",
                        err
                    );
                    break;
                }
            };
            iterations += 1;
            step.apply_to_mesh(source);
            self.transform = self.transform.then(&step);

            if step.magnitude() < self.settings.tolerance {
                break;
            }
        }

        source.compute_vertex_normals();
        let (rms_residual, valid_correspondences) = self.residual(source, surface);

        info!(
            target: "mesh_registration::rigid",
            iterations,
            rms_residual,
            valid = valid_correspondences,
            angle = self.transform.rotation.angle(),
            "Rigid alignment finished"
        );

        RigidReport {
            iterations,
            converged: true,
            transform: self.transform,
            rms_residual,
            valid_correspondences,
        }
    }

    /// One match-and-solve round; returns the incremental update.
    fn iterate(&self, source: &Mesh, surface: &TargetSurface) -> MeshResult<RigidTransform> {
        let points = source.positions();
        let normals = source.normals();
        let matches = find_correspondences(&points, &normals, surface, &self.policy, None);

        let distances: Vec<f64> = matches
            .iter()
            .filter(|c| c.valid)
            .map(|c| c.distance)
            .collect();
        let nu = self.nu.initial(median(&distances), self.edge_length);

        let capacity = matches.len() + self.landmark_sources.len();
        let mut from = Vec::with_capacity(capacity);
        let mut to = Vec::with_capacity(capacity);
        let mut weights = Vec::with_capacity(capacity);
        for c in matches.iter().filter(|c| c.valid) {
            from.push(points[c.source]);
            to.push(c.target_point);
            weights.push(welsch_weight(c.distance, nu));
        }
        for (&s, t) in self.landmark_sources.iter().zip(&self.landmark_targets) {
            from.push(points[s]);
            to.push(*t);
            weights.push(self.landmark_weight);
        }

        weighted_rigid_transform(&from, &to, &weights)
    }

    fn residual(&self, source: &Mesh, surface: &TargetSurface) -> (f64, usize) {
        let matches = find_correspondences(
            &source.positions(),
            &source.normals(),
            surface,
            &self.policy,
            None,
        );
        let valid = count_valid(&matches);
        if valid == 0 {
            return (0.0, 0);
        }
        let sum: f64 = matches
            .iter()
            .filter(|c| c.valid)
            .map(|c| c.distance * c.distance)
            .sum();
        ((sum / valid as f64).sqrt(), valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    /// Ellipsoid without rotational symmetry so the pose is recoverable.
    fn ellipsoid() -> Mesh {
        let mut mesh = Mesh::icosphere(3);
        for v in &mut mesh.vertices {
            v.position = Point3::new(v.position.x, 0.6 * v.position.y, 0.3 * v.position.z);
        }
        mesh.compute_vertex_normals();
        mesh
    }

    fn moved(mesh: &Mesh, transform: &RigidTransform) -> Mesh {
        let mut copy = mesh.clone();
        transform.apply_to_mesh(&mut copy);
        copy.compute_vertex_normals();
        copy
    }

    #[test]
    fn test_recovers_small_rigid_motion() {
        let target = ellipsoid();
        let truth = RigidTransform::from_rotation_translation(
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.2),
            Vector3::new(0.1, -0.05, 0.02),
        );
        let mut source = moved(&target, &truth.inverse());
        let surface = TargetSurface::new(&target);
        let params = RegistrationParams::default();

        let mut aligner = RigidAligner::new(&params, &source);
        aligner.init(&mut source, &target);
        let report = aligner.run(&mut source, &surface);

        assert!(report.converged);
        assert!(report.iterations > 0);
        assert!(report.rms_residual < 1e-3, "rms = {}", report.rms_residual);
        for (a, b) in source.vertices.iter().zip(&target.vertices) {
            assert!((a.position - b.position).norm() < 1e-2);
        }
    }

    #[test]
    fn test_zero_iterations_keeps_pose() {
        let target = ellipsoid();
        let mut source = moved(&target, &RigidTransform::from_translation(Vector3::x()));
        let params = RegistrationParams::default().with_rigid(RigidParams {
            max_iterations: 0,
            pre_align: false,
            ..Default::default()
        });
        let before = source.positions();

        let mut aligner = RigidAligner::new(&params, &source);
        assert_eq!(aligner.init(&mut source, &target), RigidTransform::identity());
        let report = aligner.run(&mut source, &TargetSurface::new(&target));
        assert_eq!(report.iterations, 0);
        assert!(report.converged);
        assert_eq!(source.positions(), before);
    }

    #[test]
    fn test_pre_alignment_matches_centroids() {
        let target = ellipsoid();
        let mut source = moved(&target, &RigidTransform::from_translation(Vector3::new(3.0, 1.0, 0.0)));
        let mut aligner = RigidAligner::new(&RegistrationParams::default(), &source);
        let step = aligner.init(&mut source, &target);

        assert!((step.translation - Vector3::new(-3.0, -1.0, 0.0)).norm() < 1e-9);
        let (a, b) = (source.centroid().unwrap(), target.centroid().unwrap());
        assert!((a - b).norm() < 1e-9);
        assert_eq!(aligner.transform(), step);
    }

    #[test]
    fn test_landmarks_drive_the_solve() {
        // A sphere has no preferred pose; landmarks pin the rotation.
        let mut target = Mesh::icosphere(2);
        target.compute_vertex_normals();
        let truth = RigidTransform::from_rotation_translation(
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.5),
            Vector3::zeros(),
        );
        let mut source = moved(&target, &truth.inverse());
        let marks = Landmarks::new(vec![0, 5, 17, 40], vec![0, 5, 17, 40]).unwrap();

        let params = RegistrationParams::default();
        let mut aligner = RigidAligner::new(&params, &source).with_landmarks(&marks, &target);
        aligner.init(&mut source, &target);
        aligner.run(&mut source, &TargetSurface::new(&target));

        for &i in &marks.source {
            let d = (source.vertices[i].position - target.vertices[i].position).norm();
            assert!(d < 1e-3, "landmark {} off by {}", i, d);
        }
    }
}
