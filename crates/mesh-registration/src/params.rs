//! Registration parameters.
//!
//! With the `registration-config` feature (on by default) the parameters
//! serialize to TOML and JSON, so a run can be described by a file:
//!
//! ```toml
//! alpha = 100.0
//! beta = 100.0
//! uniform_sample_ratio = 5.0
//! use_distance_reject = true
//! distance_threshold = 0.05
//!
//! [nu]
//! initial_factor = 3.0
//! decay = 0.5
//!
//! [nonrigid]
//! max_iterations = 100
//! ```
//!
//! Missing fields take their default values.

use std::f64::consts::{FRAC_PI_3, PI};
use std::path::PathBuf;

use crate::error::{MeshError, MeshResult};
use crate::landmark::Landmarks;
use crate::robust::NuSchedule;

/// Rigid stage tunables.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "registration-config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "registration-config", serde(default))]
pub struct RigidParams {
    /// ICP iteration cap.
    pub max_iterations: usize,
    /// Stop once an update's rotation angle plus translation length is below this.
    pub tolerance: f64,
    /// Move the source centroid onto the target centroid before ICP.
    pub pre_align: bool,
}

impl Default for RigidParams {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            pre_align: true,
        }
    }
}

/// Non-rigid stage tunables.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "registration-config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "registration-config", serde(default))]
pub struct NonRigidParams {
    /// Total iteration cap over all ν levels.
    pub max_iterations: usize,
    /// Iteration cap within one ν level.
    pub max_inner_iterations: usize,
    /// A level ends once the relative energy decrease falls below this.
    pub tolerance: f64,
    /// Graph nodes bound to each vertex.
    pub nodes_per_vertex: usize,
    /// Nearest nodes linked to each node in the graph.
    pub graph_neighbors: usize,
}

impl Default for NonRigidParams {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_inner_iterations: 20,
            tolerance: 1e-5,
            nodes_per_vertex: 4,
            graph_neighbors: 6,
        }
    }
}

/// Configuration for one registration run.
///
/// A run takes its own copy; the pipeline never writes back into the
/// caller's value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "registration-config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "registration-config", serde(default))]
pub struct RegistrationParams {
    /// Weight of the local-rotation smoothness term (> 0).
    pub alpha: f64,
    /// Weight of the translation smoothness term (≥ 0).
    pub beta: f64,
    /// Weight of the landmark term (> 0), large enough to act as a constraint.
    pub gamma: f64,
    /// Deformation graph density: nodes as a percentage of source vertices.
    pub uniform_sample_ratio: f64,
    pub use_distance_reject: bool,
    /// Maximum correspondence distance in the normalized frame. The
    /// non-rigid stage raises it to the current ν while ν is larger.
    pub distance_threshold: f64,
    pub use_normal_reject: bool,
    /// Maximum angle between matched normals, radians in (0, π].
    pub normal_threshold: f64,
    /// Anneal ν across levels instead of keeping it fixed.
    pub use_dynamic_nu: bool,
    pub use_landmark: bool,
    pub landmark_src: Vec<usize>,
    pub landmark_tar: Vec<usize>,
    /// Measure the error against a ground-truth mesh each iteration. On by
    /// default; without a `gt_mesh` the target is the reference when the
    /// vertex counts agree, and tracking is skipped otherwise.
    pub calc_gt_err: bool,
    /// Where to write the ground-truth error report.
    pub out_gt_file: Option<PathBuf>,
    /// Ground-truth mesh; the target is used when its vertex count matches.
    pub gt_mesh: Option<PathBuf>,
    pub nu: NuSchedule,
    pub rigid: RigidParams,
    pub nonrigid: NonRigidParams,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            alpha: 100.0,
            beta: 100.0,
            gamma: 1e8,
            uniform_sample_ratio: 5.0,
            use_distance_reject: true,
            distance_threshold: 0.05,
            use_normal_reject: false,
            normal_threshold: FRAC_PI_3,
            use_dynamic_nu: true,
            use_landmark: false,
            landmark_src: Vec::new(),
            landmark_tar: Vec::new(),
            calc_gt_err: true,
            out_gt_file: None,
            gt_mesh: None,
            nu: NuSchedule::default(),
            rigid: RigidParams::default(),
            nonrigid: NonRigidParams::default(),
        }
    }
}

impl RegistrationParams {
    /// Create default parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Coarse graph and short iteration budgets for previews.
    pub fn fast() -> Self {
        Self {
            uniform_sample_ratio: 2.0,
            rigid: RigidParams {
                max_iterations: 30,
                tolerance: 1e-5,
                ..Default::default()
            },
            nonrigid: NonRigidParams {
                max_iterations: 30,
                max_inner_iterations: 8,
                tolerance: 1e-4,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Dense graph, slow annealing and generous budgets.
    pub fn accurate() -> Self {
        Self {
            uniform_sample_ratio: 10.0,
            nu: NuSchedule {
                decay: 0.7,
                ..Default::default()
            },
            rigid: RigidParams {
                max_iterations: 200,
                tolerance: 1e-8,
                ..Default::default()
            },
            nonrigid: NonRigidParams {
                max_iterations: 300,
                max_inner_iterations: 30,
                tolerance: 1e-6,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn with_sample_ratio(mut self, ratio: f64) -> Self {
        self.uniform_sample_ratio = ratio;
        self
    }

    /// Enable or disable distance rejection.
    pub fn with_distance_reject(mut self, enabled: bool) -> Self {
        self.use_distance_reject = enabled;
        self
    }

    /// Enable distance rejection at `threshold`.
    pub fn with_distance_threshold(mut self, threshold: f64) -> Self {
        self.use_distance_reject = true;
        self.distance_threshold = threshold;
        self
    }

    /// Enable or disable normal rejection.
    pub fn with_normal_reject(mut self, enabled: bool) -> Self {
        self.use_normal_reject = enabled;
        self
    }

    /// Enable normal rejection at `radians`.
    pub fn with_normal_threshold(mut self, radians: f64) -> Self {
        self.use_normal_reject = true;
        self.normal_threshold = radians;
        self
    }

    pub fn with_dynamic_nu(mut self, enabled: bool) -> Self {
        self.use_dynamic_nu = enabled;
        self
    }

    pub fn with_nu_schedule(mut self, nu: NuSchedule) -> Self {
        self.nu = nu;
        self
    }

    /// Use these landmark pairs (and enable the landmark term).
    pub fn with_landmarks(mut self, landmarks: Landmarks) -> Self {
        self.use_landmark = true;
        self.landmark_src = landmarks.source;
        self.landmark_tar = landmarks.target;
        self
    }

    /// Enable ground-truth error tracking, optionally writing a report.
    pub fn with_gt_error(mut self, report: Option<PathBuf>) -> Self {
        self.calc_gt_err = true;
        self.out_gt_file = report;
        self
    }

    /// Turn ground-truth error tracking off.
    pub fn without_gt_error(mut self) -> Self {
        self.calc_gt_err = false;
        self.out_gt_file = None;
        self
    }

    pub fn with_gt_mesh(mut self, path: impl Into<PathBuf>) -> Self {
        self.gt_mesh = Some(path.into());
        self
    }

    pub fn with_rigid(mut self, rigid: RigidParams) -> Self {
        self.rigid = rigid;
        self
    }

    pub fn with_nonrigid(mut self, nonrigid: NonRigidParams) -> Self {
        self.nonrigid = nonrigid;
        self
    }

    /// Landmark pairs in force for a run, if any.
    pub fn landmarks(&self) -> Option<Landmarks> {
        (self.use_landmark && !self.landmark_src.is_empty()).then(|| Landmarks {
            source: self.landmark_src.clone(),
            target: self.landmark_tar.clone(),
        })
    }

    /// Check every option against its valid range.
    pub fn validate(&self) -> MeshResult<()> {
        fn positive(name: &'static str, value: f64) -> MeshResult<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(MeshError::invalid_parameter(
                    name,
                    format!("must be a positive number, got {}", value),
                ))
            }
        }

        positive("alpha", self.alpha)?;
        if !(self.beta.is_finite() && self.beta >= 0.0) {
            return Err(MeshError::invalid_parameter(
                "beta",
                format!("must be zero or positive, got {}", self.beta),
            ));
        }
        positive("gamma", self.gamma)?;
        positive("uniform_sample_ratio", self.uniform_sample_ratio)?;
        positive("distance_threshold", self.distance_threshold)?;
        if !(self.normal_threshold > 0.0 && self.normal_threshold <= PI) {
            return Err(MeshError::invalid_parameter(
                "normal_threshold",
                format!("must be in (0, π] radians, got {}", self.normal_threshold),
            ));
        }
        self.nu
            .validate()
            .map_err(|details| MeshError::invalid_parameter("nu", details))?;
        if !(self.rigid.tolerance.is_finite() && self.rigid.tolerance >= 0.0) {
            return Err(MeshError::invalid_parameter(
                "rigid.tolerance",
                format!("must be zero or positive, got {}", self.rigid.tolerance),
            ));
        }
        if !(self.nonrigid.tolerance.is_finite() && self.nonrigid.tolerance >= 0.0) {
            return Err(MeshError::invalid_parameter(
                "nonrigid.tolerance",
                format!("must be zero or positive, got {}", self.nonrigid.tolerance),
            ));
        }
        if self.nonrigid.nodes_per_vertex == 0 {
            return Err(MeshError::invalid_parameter(
                "nonrigid.nodes_per_vertex",
                "must be at least 1",
            ));
        }
        if self.landmark_src.len() != self.landmark_tar.len() {
            return Err(MeshError::landmark_mismatch(
                self.landmark_src.len(),
                self.landmark_tar.len(),
            ));
        }
        Ok(())
    }
}

#[cfg(feature = "registration-config")]
impl RegistrationParams {
    /// Parse parameters from a TOML string.
    pub fn from_toml(toml_str: &str) -> MeshResult<Self> {
        toml::from_str(toml_str).map_err(|e| MeshError::config(e.to_string(), None))
    }

    /// Load parameters from a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| MeshError::io_read(path, e))?;
        toml::from_str(&contents)
            .map_err(|e| MeshError::config(e.to_string(), Some(path.to_path_buf())))
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> MeshResult<String> {
        toml::to_string_pretty(self).map_err(|e| MeshError::config(e.to_string(), None))
    }

    /// Save parameters to a TOML file.
    pub fn save_toml(&self, path: impl AsRef<std::path::Path>) -> MeshResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml()?).map_err(|e| MeshError::io_write(path, e))
    }

    /// Parse parameters from a JSON string.
    pub fn from_json(json_str: &str) -> MeshResult<Self> {
        serde_json::from_str(json_str).map_err(|e| MeshError::config(e.to_string(), None))
    }

    /// Serialize to a pretty-printed JSON string.
    pub fn to_json(&self) -> MeshResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| MeshError::config(e.to_string(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_defaults() {
        let params = RegistrationParams::default();
        assert_eq!(params.alpha, 100.0);
        assert_eq!(params.gamma, 1e8);
        assert!(params.use_distance_reject && !params.use_normal_reject);
        assert!(params.use_dynamic_nu && !params.use_landmark && params.calc_gt_err);
        assert!(!params.clone().without_gt_error().calc_gt_err);
        assert!(params.validate().is_ok());
        assert!(RegistrationParams::fast().validate().is_ok());
        assert!(RegistrationParams::accurate().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let cases = [
            (RegistrationParams::new().with_alpha(0.0), "alpha"),
            (RegistrationParams::new().with_beta(-1.0), "beta"),
            (RegistrationParams::new().with_gamma(f64::NAN), "gamma"),
            (RegistrationParams::new().with_sample_ratio(0.0), "uniform_sample_ratio"),
            (RegistrationParams::new().with_distance_threshold(-0.1), "distance_threshold"),
            (RegistrationParams::new().with_normal_threshold(4.0), "normal_threshold"),
        ];
        for (params, field) in cases {
            match params.validate().unwrap_err() {
                MeshError::InvalidParameter { name, .. } => assert_eq!(name, field),
                other => panic!("Expected invalid {}, got {:?}", field, other),
            }
        }
        assert!(RegistrationParams::new().with_beta(0.0).validate().is_ok());
        assert!(RegistrationParams::new().with_normal_threshold(PI).validate().is_ok());
    }

    #[test]
    fn test_landmark_lengths_validated() {
        let params = RegistrationParams {
            landmark_src: vec![1, 2],
            landmark_tar: vec![3],
            ..Default::default()
        };
        assert_eq!(params.validate().unwrap_err().code(), ErrorCode::LandmarkMismatch);
    }

    #[test]
    fn test_landmarks_only_when_enabled() {
        let marks = Landmarks::new(vec![0, 1], vec![2, 3]).unwrap();
        let params = RegistrationParams::new().with_landmarks(marks.clone());
        assert_eq!(params.landmarks(), Some(marks));

        let disabled = RegistrationParams {
            use_landmark: false,
            ..params
        };
        assert_eq!(disabled.landmarks(), None);
    }

    #[cfg(feature = "registration-config")]
    #[test]
    fn test_toml_round_trip_and_partial_files() {
        let params = RegistrationParams::accurate()
            .with_alpha(5.0)
            .with_gt_error(Some(PathBuf::from("gt.txt")));
        let text = params.to_toml().unwrap();
        assert_eq!(RegistrationParams::from_toml(&text).unwrap(), params);

        let partial = RegistrationParams::from_toml("beta = 2.5\n[nonrigid]\nmax_iterations = 7\n").unwrap();
        assert_eq!(partial.beta, 2.5);
        assert_eq!(partial.alpha, 100.0);
        assert_eq!(partial.nonrigid.max_iterations, 7);
        assert_eq!(partial.nonrigid.max_inner_iterations, 20);
    }

    #[cfg(feature = "registration-config")]
    #[test]
    fn test_config_errors() {
        let err = RegistrationParams::from_toml("alpha = \"high\"").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Config);

        let json = RegistrationParams::fast().to_json().unwrap();
        assert_eq!(RegistrationParams::from_json(&json).unwrap(), RegistrationParams::fast());
        assert!(RegistrationParams::from_json("{ not json").is_err());
    }

    #[cfg(feature = "registration-config")]
    #[test]
    fn test_toml_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reg.toml");
        let params = RegistrationParams::new().with_landmarks(Landmarks::new(vec![4], vec![9]).unwrap());
        params.save_toml(&path).unwrap();
        assert_eq!(RegistrationParams::from_toml_file(&path).unwrap(), params);

        let err = RegistrationParams::from_toml_file(dir.path().join("missing.toml")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IoRead);
    }
}
