//! Registration pipeline: normalize, four timed engine phases, restore.
//!
//! # Example
//!
//! ```no_run
//! use mesh_registration::{NonRigidRegistration, RegistrationParams};
//! use std::path::Path;
//!
//! let mut registration = NonRigidRegistration::new();
//! registration.set_parameters(RegistrationParams::default().with_alpha(10.0));
//!
//! let ok = registration.register_meshes(
//!     Path::new("source.obj"),
//!     Path::new("target.obj"),
//!     Path::new("result.obj"),
//!     None,
//! );
//! println!("{}", registration.timing_info());
//! assert!(ok);
//! ```

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::engine::{RegistrationEngine, RobustNonRigidEngine};
use crate::error::{MeshError, MeshResult};
use crate::io::{load_landmarks, load_mesh, save_mesh};
use crate::landmark::Landmarks;
use crate::normalize::{Normalization, normalize_pair};
use crate::params::RegistrationParams;
use crate::progress::{CancelToken, Progress, ProgressCallback};
use crate::report::{GroundTruth, RegistrationReport, write_gt_report};
use crate::tracing_ext::{StageTimer, log_mesh_stats};
use crate::types::Mesh;

/// Wall-clock duration of each engine phase. Phases that did not complete
/// are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingInfo {
    pub rigid_init: Option<Duration>,
    pub rigid: Option<Duration>,
    pub nonrigid_init: Option<Duration>,
    pub nonrigid: Option<Duration>,
}

impl TimingInfo {
    /// Sum of the completed phases.
    pub fn total(&self) -> Duration {
        self.phases().iter().filter_map(|(_, d)| *d).sum()
    }

    /// Number of completed phases.
    pub fn completed(&self) -> usize {
        self.phases().iter().filter(|(_, d)| d.is_some()).count()
    }

    /// `(label, duration)` in execution order.
    pub fn phases(&self) -> [(&'static str, Option<Duration>); 4] {
        [
            ("Rigid initialization", self.rigid_init),
            ("Rigid registration", self.rigid),
            ("Non-rigid initialization", self.nonrigid_init),
            ("Non-rigid registration", self.nonrigid),
        ]
    }
}

impl fmt::Display for TimingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, duration) in self.phases() {
            match duration {
                Some(d) => writeln!(f, "{:<26}{:>12.3} ms", label, d.as_secs_f64() * 1000.0)?,
                None => writeln!(f, "{:<26}{:>15}", label, "not run")?,
            }
        }
        write!(f, "{:<26}{:>12.3} ms", "Total", self.total().as_secs_f64() * 1000.0)
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    /// Deformed source in original units.
    pub mesh: Mesh,
    /// Frame the optimization ran in.
    pub normalization: Normalization,
    /// Residuals and ground-truth errors in original units; the rigid
    /// transform is expressed in the normalized frame.
    pub report: RegistrationReport,
    pub timing: TimingInfo,
}

/// The engine operations in the order a run performs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    RigidInit,
    Rigid,
    NonRigidInit,
    NonRigid,
}

impl Phase {
    const ALL: [Phase; 4] = [Phase::RigidInit, Phase::Rigid, Phase::NonRigidInit, Phase::NonRigid];

    fn name(self) -> &'static str {
        match self {
            Phase::RigidInit => "rigid_init",
            Phase::Rigid => "rigid",
            Phase::NonRigidInit => "nonrigid_init",
            Phase::NonRigid => "nonrigid",
        }
    }

    fn run(self, engine: &mut dyn RegistrationEngine) -> MeshResult<()> {
        match self {
            Phase::RigidInit => engine.rigid_init(),
            Phase::Rigid => engine.do_rigid(),
            Phase::NonRigidInit => engine.initialize_non_rigid(),
            Phase::NonRigid => engine.do_non_rigid(),
        }
    }

    fn slot(self, timing: &mut TimingInfo) -> &mut Option<Duration> {
        match self {
            Phase::RigidInit => &mut timing.rigid_init,
            Phase::Rigid => &mut timing.rigid,
            Phase::NonRigidInit => &mut timing.nonrigid_init,
            Phase::NonRigid => &mut timing.nonrigid,
        }
    }
}

/// Runs one registration at a time on in-memory meshes.
///
/// Every run works on its own copy of the parameters and a freshly built
/// engine, so nothing carries over between runs.
pub struct RegistrationPipeline {
    params: RegistrationParams,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,
    timing: TimingInfo,
}

impl RegistrationPipeline {
    pub fn new(params: RegistrationParams) -> Self {
        Self {
            params,
            cancel: CancelToken::new(),
            progress: None,
            timing: TimingInfo::default(),
        }
    }

    /// Observe this token between phases.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Report each completed phase. Returning `false` cancels the run.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn params(&self) -> &RegistrationParams {
        &self.params
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Timing of the last run, including a failed one.
    pub fn timing(&self) -> &TimingInfo {
        &self.timing
    }

    /// Register `source` onto `target`.
    ///
    /// `landmarks` overrides any pairs stored in the parameters. Input,
    /// configuration and geometry problems fail the run; numerical trouble
    /// inside the optimizer is logged and the best-effort result returned.
    pub fn run(
        &mut self,
        mut source: Mesh,
        mut target: Mesh,
        landmarks: Option<Landmarks>,
    ) -> MeshResult<RegistrationOutcome> {
        self.timing = TimingInfo::default();
        let started = Instant::now();

        let mut params = self.params.clone();
        if let Some(landmarks) = landmarks {
            params = params.with_landmarks(landmarks);
        }
        params.validate()?;
        let landmarks = params.landmarks();
        if let Some(landmarks) = &landmarks {
            landmarks.validate(source.vertex_count(), target.vertex_count())?;
        }
        let mut ground_truth = GroundTruth::resolve(&params, &target, source.vertex_count())?;

        self.check_cancelled("normalization")?;
        log_mesh_stats(&source, "source");
        log_mesh_stats(&target, "target");
        let frame = normalize_pair(&mut source, &mut target)?;

        let mut engine = RobustNonRigidEngine::new(source, target, &params);
        if let Some(landmarks) = landmarks {
            engine = engine.with_landmarks(landmarks)?;
        }
        if let Some(gt) = ground_truth.as_mut() {
            gt.normalize(&frame);
            engine = engine.with_ground_truth(gt.clone());
        }
        let mut engine: Box<dyn RegistrationEngine> = Box::new(engine);

        for (index, phase) in Phase::ALL.into_iter().enumerate() {
            self.check_cancelled(phase.name())?;
            let timer = StageTimer::with_mesh(phase.name(), engine.result());
            {
                let _enter = timer.span().enter();
                phase.run(engine.as_mut())?;
            }
            *phase.slot(&mut self.timing) = Some(timer.elapsed());
            drop(timer);
            self.notify(index + 1, phase.name(), started);
        }

        let mut mesh = engine.result().clone();
        frame.restore(&mut mesh);

        let mut report = engine.report().clone();
        report.rms_residual = frame.restore_length(report.rms_residual);
        report.gt_error = report.gt_error.map(|e| e.restore(&frame));
        if let (true, Some(path)) = (ground_truth.is_some(), &params.out_gt_file) {
            write_gt_report(path, &report.nonrigid.records, report.gt_error, &frame)?;
        }

        info!(
            target: "mesh_registration::timing",
            total_ms = format!("{:.2}", self.timing.total().as_secs_f64() * 1000.0),
            rms_residual = report.rms_residual,
            "Registration complete"
        );

        Ok(RegistrationOutcome {
            mesh,
            normalization: frame,
            report,
            timing: self.timing,
        })
    }

    fn check_cancelled(&self, phase: &'static str) -> MeshResult<()> {
        if self.cancel.is_cancelled() {
            info!(target: "mesh_registration::timing", phase, "Registration cancelled");
            return Err(MeshError::Cancelled { phase });
        }
        Ok(())
    }

    fn notify(&self, completed: usize, phase: &'static str, started: Instant) {
        if let Some(callback) = &self.progress {
            let progress = Progress {
                elapsed: started.elapsed(),
                ..Progress::new(completed as u64, Phase::ALL.len() as u64, phase)
            };
            if !callback(&progress) {
                self.cancel.cancel();
            }
        }
    }
}

/// File-level façade: load, register, save.
///
/// Parameters stay fixed until the next [`set_parameters`](Self::set_parameters).
#[derive(Debug, Clone, Default)]
pub struct NonRigidRegistration {
    params: RegistrationParams,
    cancel: CancelToken,
    timing: TimingInfo,
    report: Option<RegistrationReport>,
}

impl NonRigidRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parameters(&mut self, params: RegistrationParams) {
        self.params = params;
    }

    pub fn parameters(&self) -> &RegistrationParams {
        &self.params
    }

    /// Token that cancels the current or next run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Register two mesh files and write the result to `output`.
    ///
    /// A landmark file forces the landmark term on for this run only.
    /// Nothing is written unless the whole run succeeds.
    pub fn try_register_meshes(
        &mut self,
        source: &Path,
        target: &Path,
        output: &Path,
        landmarks: Option<&Path>,
    ) -> MeshResult<RegistrationReport> {
        self.timing = TimingInfo::default();
        self.report = None;

        let source_mesh = load_mesh(source)?;
        let target_mesh = load_mesh(target)?;
        let landmarks = landmarks.map(load_landmarks).transpose()?;

        let mut pipeline =
            RegistrationPipeline::new(self.params.clone()).with_cancel_token(self.cancel.clone());
        let outcome = pipeline.run(source_mesh, target_mesh, landmarks);
        self.timing = *pipeline.timing();
        let outcome = outcome?;

        save_mesh(&outcome.mesh, output)?;
        self.report = Some(outcome.report.clone());
        Ok(outcome.report)
    }

    /// Like [`try_register_meshes`](Self::try_register_meshes), reporting
    /// only success. Errors are logged with their code.
    pub fn register_meshes(
        &mut self,
        source: &Path,
        target: &Path,
        output: &Path,
        landmarks: Option<&Path>,
    ) -> bool {
        match self.try_register_meshes(source, target, output, landmarks) {
            Ok(_) => true,
            Err(err) => {
                error!(
                    target: "mesh_registration::io",
                    code = %err.code(),
                    category = ?err.category(),
                    "Registration failed: {}",
                    err
                );
                false
            }
        }
    }

    /// Formatted phase durations of the last run.
    pub fn timing_info(&self) -> String {
        self.timing.to_string()
    }

    pub fn timing(&self) -> &TimingInfo {
        &self.timing
    }

    /// Report of the last successful run.
    pub fn report(&self) -> Option<&RegistrationReport> {
        self.report.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use nalgebra::Vector3;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sphere_pair() -> (Mesh, Mesh) {
        let source = Mesh::icosphere(2);
        let mut target = source.clone();
        target.scale(1.2);
        target.translate(Vector3::new(0.5, 0.0, 0.0));
        (source, target)
    }

    fn quick_params() -> RegistrationParams {
        RegistrationParams::fast()
            .with_alpha(1e-3)
            .with_beta(1e-3)
            .with_sample_ratio(20.0)
            .with_distance_reject(false)
    }

    #[test]
    fn test_timing_display_and_total() {
        let timing = TimingInfo {
            rigid_init: Some(Duration::from_millis(2)),
            rigid: Some(Duration::from_millis(3)),
            nonrigid_init: None,
            nonrigid: None,
        };
        assert_eq!(timing.total(), Duration::from_millis(5));
        assert_eq!(timing.completed(), 2);
        let text = timing.to_string();
        assert!(text.contains("Rigid initialization"));
        assert!(text.contains("not run"));
        assert!(text.lines().last().unwrap().contains("5.000 ms"));
    }

    #[test]
    fn test_run_records_every_phase() {
        let (source, target) = sphere_pair();
        let mut pipeline = RegistrationPipeline::new(quick_params());
        let outcome = pipeline.run(source, target.clone(), None).unwrap();

        assert_eq!(outcome.timing.completed(), 4);
        let sum: Duration = outcome.timing.phases().iter().filter_map(|(_, d)| *d).sum();
        assert_eq!(sum, outcome.timing.total());
        assert_eq!(outcome.mesh.vertex_count(), target.vertex_count());
        // Back in original units: roughly on the 1.2 sphere around (0.5, 0, 0).
        let center = nalgebra::Point3::new(0.5, 0.0, 0.0);
        for v in &outcome.mesh.vertices {
            assert!(((v.position - center).norm() - 1.2).abs() < 0.1);
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let (source, target) = sphere_pair();
        let token = CancelToken::new();
        token.cancel();
        let mut pipeline = RegistrationPipeline::new(quick_params()).with_cancel_token(token);
        let err = pipeline.run(source, target, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert_eq!(pipeline.timing().completed(), 0);
    }

    #[test]
    fn test_progress_callback_can_cancel() {
        let (source, target) = sphere_pair();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut pipeline = RegistrationPipeline::new(quick_params()).with_progress(Box::new(
            move |progress| {
                seen.fetch_add(1, Ordering::SeqCst);
                progress.current < 2
            },
        ));

        let err = pipeline.run(source, target, None).unwrap_err();
        assert!(matches!(err, MeshError::Cancelled { phase: "nonrigid_init" }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let timing = pipeline.timing();
        assert!(timing.rigid_init.is_some() && timing.rigid.is_some());
        assert!(timing.nonrigid_init.is_none() && timing.nonrigid.is_none());
    }

    #[test]
    fn test_invalid_parameters_fail_before_any_phase() {
        let (source, target) = sphere_pair();
        let mut pipeline = RegistrationPipeline::new(quick_params().with_alpha(-1.0));
        let err = pipeline.run(source, target, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
        assert_eq!(pipeline.timing().completed(), 0);
    }

    #[test]
    fn test_degenerate_target_is_fatal() {
        let (source, mut target) = sphere_pair();
        for v in &mut target.vertices {
            v.position = nalgebra::Point3::new(1.0, 1.0, 1.0);
        }
        let mut pipeline = RegistrationPipeline::new(quick_params());
        let err = pipeline.run(source, target, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DegenerateMesh);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_facade_keeps_parameters_between_runs() {
        let mut registration = NonRigidRegistration::new();
        assert_eq!(registration.parameters(), &RegistrationParams::default());
        registration.set_parameters(quick_params());
        assert_eq!(registration.parameters(), &quick_params());
        assert!(registration.report().is_none());
        assert!(registration.timing_info().contains("not run"));
    }
}
