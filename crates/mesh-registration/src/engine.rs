//! The registration engine behind the pipeline.
//!
//! An engine owns one normalized source/target pair and advances through
//! four phases in a fixed order. Calling a phase early is an
//! [`InvalidPhase`](crate::MeshError::InvalidPhase) error rather than a
//! silent no-op.

use tracing::debug;

use crate::correspondence::TargetSurface;
use crate::deform::NonRigidDeformer;
use crate::error::{MeshError, MeshResult};
use crate::landmark::Landmarks;
use crate::params::RegistrationParams;
use crate::report::{GroundTruth, RegistrationReport};
use crate::rigid::RigidAligner;
use crate::types::Mesh;

/// Four-phase registration lifecycle.
pub trait RegistrationEngine {
    /// Prepare rigid alignment (centroid pre-alignment).
    fn rigid_init(&mut self) -> MeshResult<()>;

    /// Run rigid alignment.
    fn do_rigid(&mut self) -> MeshResult<()>;

    /// Build the non-rigid representation over the aligned source.
    fn initialize_non_rigid(&mut self) -> MeshResult<()>;

    /// Run non-rigid refinement.
    fn do_non_rigid(&mut self) -> MeshResult<()>;

    /// The source mesh in its current state, normalized frame.
    fn result(&self) -> &Mesh;

    /// Stage reports in normalized units.
    fn report(&self) -> &RegistrationReport;
}

/// How far an engine has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnginePhase {
    Created,
    RigidInitialized,
    RigidAligned,
    NonRigidInitialized,
    Finished,
}

/// Robust ICP followed by deformation-graph refinement.
pub struct RobustNonRigidEngine {
    params: RegistrationParams,
    source: Mesh,
    target: Mesh,
    surface: TargetSurface,
    landmarks: Option<Landmarks>,
    ground_truth: Option<GroundTruth>,
    phase: EnginePhase,
    rigid: Option<RigidAligner>,
    deformer: Option<NonRigidDeformer>,
    report: RegistrationReport,
}

impl RobustNonRigidEngine {
    /// Take ownership of a normalized pair. The target is indexed once here.
    pub fn new(source: Mesh, mut target: Mesh, params: &RegistrationParams) -> Self {
        target.compute_vertex_normals();
        let surface = TargetSurface::new(&target);
        Self {
            params: params.clone(),
            source,
            target,
            surface,
            landmarks: None,
            ground_truth: None,
            phase: EnginePhase::Created,
            rigid: None,
            deformer: None,
            report: RegistrationReport::default(),
        }
    }

    /// Add landmark pairs, checked against both meshes.
    pub fn with_landmarks(mut self, landmarks: Landmarks) -> MeshResult<Self> {
        landmarks.validate(self.source.vertex_count(), self.target.vertex_count())?;
        if !landmarks.is_empty() {
            self.landmarks = Some(landmarks);
        }
        Ok(self)
    }

    /// Track per-iteration error against a reference in the normalized frame.
    pub fn with_ground_truth(mut self, ground_truth: GroundTruth) -> Self {
        self.ground_truth = Some(ground_truth);
        self
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    fn require(
        &self,
        expected: EnginePhase,
        phase: &'static str,
        requires: &'static str,
    ) -> MeshResult<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(MeshError::InvalidPhase { phase, requires })
        }
    }

    fn advance(&mut self, phase: EnginePhase) {
        debug!(target: "mesh_registration::timing", from = ?self.phase, to = ?phase, "Engine phase");
        self.phase = phase;
    }
}

impl RegistrationEngine for RobustNonRigidEngine {
    fn rigid_init(&mut self) -> MeshResult<()> {
        self.require(EnginePhase::Created, "rigid_init", "a fresh engine")?;
        if self.source.vertices.iter().any(|v| v.normal.is_none()) {
            self.source.compute_vertex_normals();
        }
        let mut aligner = RigidAligner::new(&self.params, &self.source);
        if let Some(landmarks) = &self.landmarks {
            aligner = aligner.with_landmarks(landmarks, &self.target);
        }
        aligner.init(&mut self.source, &self.target);
        self.rigid = Some(aligner);
        self.advance(EnginePhase::RigidInitialized);
        Ok(())
    }

    fn do_rigid(&mut self) -> MeshResult<()> {
        self.require(EnginePhase::RigidInitialized, "do_rigid", "rigid_init")?;
        let aligner = self.rigid.as_mut().ok_or(MeshError::InvalidPhase {
            phase: "do_rigid",
            requires: "rigid_init",
        })?;
        self.report.rigid = aligner.run(&mut self.source, &self.surface);
        self.report.rms_residual = self.report.rigid.rms_residual;
        self.advance(EnginePhase::RigidAligned);
        Ok(())
    }

    fn initialize_non_rigid(&mut self) -> MeshResult<()> {
        self.require(EnginePhase::RigidAligned, "initialize_non_rigid", "do_rigid")?;
        let mut deformer = NonRigidDeformer::new(&self.params, &self.source);
        if let Some(landmarks) = &self.landmarks {
            deformer = deformer.with_landmarks(landmarks, &self.target);
        }
        self.deformer = Some(deformer);
        self.advance(EnginePhase::NonRigidInitialized);
        Ok(())
    }

    fn do_non_rigid(&mut self) -> MeshResult<()> {
        self.require(
            EnginePhase::NonRigidInitialized,
            "do_non_rigid",
            "initialize_non_rigid",
        )?;
        let deformer = self.deformer.as_mut().ok_or(MeshError::InvalidPhase {
            phase: "do_non_rigid",
            requires: "initialize_non_rigid",
        })?;

        let ground_truth = self.ground_truth.as_ref();
        self.report.nonrigid = deformer.run_with(&mut self.source, &self.surface, |positions| {
            ground_truth.and_then(|gt| gt.error(positions)).map(|e| e.rms)
        });
        self.report.rms_residual = self.report.nonrigid.rms_residual;
        self.report.gt_error = ground_truth.and_then(|gt| gt.error(&self.source.positions()));
        self.advance(EnginePhase::Finished);
        Ok(())
    }

    fn result(&self) -> &Mesh {
        &self.source
    }

    fn report(&self) -> &RegistrationReport {
        &self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::transform::RigidTransform;
    use nalgebra::{Point3, UnitQuaternion, Vector3};

    fn ellipsoid() -> Mesh {
        let mut mesh = Mesh::icosphere(2);
        for v in &mut mesh.vertices {
            v.position = Point3::new(0.5 * v.position.x, 0.3 * v.position.y, 0.2 * v.position.z);
        }
        mesh.compute_vertex_normals();
        mesh
    }

    fn test_params() -> RegistrationParams {
        RegistrationParams::default()
            .with_alpha(1e-3)
            .with_beta(1e-3)
            .with_sample_ratio(20.0)
            .with_distance_reject(false)
    }

    #[test]
    fn test_phases_must_run_in_order() {
        let mut engine = RobustNonRigidEngine::new(ellipsoid(), ellipsoid(), &test_params());

        let err = engine.do_rigid().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPhase);
        assert!(engine.initialize_non_rigid().is_err());
        assert!(engine.do_non_rigid().is_err());
        assert_eq!(engine.phase(), EnginePhase::Created);

        engine.rigid_init().unwrap();
        assert!(engine.rigid_init().is_err());
        engine.do_rigid().unwrap();
        assert!(engine.do_non_rigid().is_err());
        engine.initialize_non_rigid().unwrap();
        engine.do_non_rigid().unwrap();
        assert_eq!(engine.phase(), EnginePhase::Finished);
        assert!(engine.do_non_rigid().is_err());
    }

    #[test]
    fn test_full_run_aligns_rotated_copy() {
        let target = ellipsoid();
        let mut source = target.clone();
        RigidTransform::from_rotation_translation(
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), -0.15),
            Vector3::new(0.05, 0.02, 0.0),
        )
        .apply_to_mesh(&mut source);

        let mut engine = RobustNonRigidEngine::new(source, target.clone(), &test_params())
            .with_ground_truth(GroundTruth::new(&target));
        engine.rigid_init().unwrap();
        engine.do_rigid().unwrap();
        engine.initialize_non_rigid().unwrap();
        engine.do_non_rigid().unwrap();

        let report = engine.report();
        assert!(report.rigid.converged);
        assert!(report.rms_residual < 1e-3, "rms = {}", report.rms_residual);
        let gt = report.gt_error.unwrap();
        assert!(gt.max < 1e-2, "gt max = {}", gt.max);
        assert!(report.nonrigid.records.iter().all(|r| r.gt_error.is_some()));
        assert_eq!(engine.result().vertex_count(), target.vertex_count());
    }

    #[test]
    fn test_landmarks_are_validated() {
        let marks = Landmarks::new(vec![0, 1000], vec![0, 1]).unwrap();
        let err = RobustNonRigidEngine::new(ellipsoid(), ellipsoid(), &test_params())
            .with_landmarks(marks)
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::LandmarkOutOfBounds);
    }
}
