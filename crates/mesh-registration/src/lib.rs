//! Robust rigid and non-rigid registration of triangle meshes.
//!
//! Deforms a source mesh so that it fits a target surface while keeping
//! the source connectivity. A run has four phases:
//!
//! 1. **Rigid init**: centroid pre-alignment (and landmark seeding).
//! 2. **Rigid**: robust ICP with Welsch-weighted point-to-point matches.
//! 3. **Non-rigid init**: a deformation graph sampled from the source.
//! 4. **Non-rigid**: alternating per-node rotations and a sparse global
//!    solve for node translations, under a decreasing Welsch scale ν.
//!
//! Both meshes are mapped into a shared normalized frame before the
//! first phase and the result is mapped back afterwards, so every length
//! parameter is relative to the size of the pair.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use mesh_registration::{NonRigidRegistration, RegistrationParams};
//!
//! let mut registration = NonRigidRegistration::new();
//! registration.set_parameters(RegistrationParams::default().with_alpha(10.0));
//!
//! if registration.register_meshes(
//!     Path::new("source.obj"),
//!     Path::new("target.ply"),
//!     Path::new("out.obj"),
//!     None,
//! ) {
//!     println!("{}", registration.timing_info());
//! }
//! ```
//!
//! # Pipeline API
//!
//! ```no_run
//! use mesh_registration::{Mesh, RegistrationParams, RegistrationPipeline};
//!
//! let source = Mesh::load("source.stl").unwrap();
//! let target = Mesh::load("target.stl").unwrap();
//!
//! let mut pipeline = RegistrationPipeline::new(RegistrationParams::fast());
//! let outcome = pipeline.run(source, target, None).unwrap();
//! println!("{}", outcome.report);
//! outcome.mesh.save("registered.stl").unwrap();
//! ```
//!
//! # Errors
//!
//! Every failure is a [`MeshError`] carrying a stable [`ErrorCode`] and a
//! [`RecoverySuggestion`]. Numerical trouble inside a phase (a singular
//! per-node fit, a rejected step) is logged and recovered from rather than
//! returned.

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod error;
mod types;

pub mod correspondence;
pub mod deform;
pub mod engine;
pub mod graph;
pub mod io;
pub mod landmark;
pub mod normalize;
pub mod params;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod rigid;
pub mod robust;
pub mod solver;
pub mod tracing_ext;
pub mod transform;
pub mod validate;

// Core types
pub use error::{
    ErrorCategory, ErrorCode, MeshError, MeshLocation, MeshResult, RecoverySuggestion,
};
pub use types::{Mesh, Triangle, Vertex};

// I/O
pub use io::{MeshFormat, load_landmarks, load_mesh, save_mesh};

// Parameters
pub use landmark::Landmarks;
pub use params::{NonRigidParams, RegistrationParams, RigidParams};
pub use robust::NuSchedule;

// Stages
pub use deform::{DeformationState, IterationRecord, NonRigidDeformer, NonRigidReport};
pub use engine::{EnginePhase, RegistrationEngine, RobustNonRigidEngine};
pub use graph::DeformationGraph;
pub use normalize::{Normalization, normalize_pair};
pub use rigid::{RigidAligner, RigidReport};
pub use transform::RigidTransform;

// Orchestration
pub use pipeline::{NonRigidRegistration, RegistrationOutcome, RegistrationPipeline, TimingInfo};
pub use progress::{CancelToken, Progress, ProgressCallback};
pub use report::{GtError, GroundTruth, RegistrationReport};

// Inspection
pub use tracing_ext::{StageTimer, log_mesh_stats};
pub use validate::{MeshReport, mesh_report, validate_mesh_data};

impl Mesh {
    /// Load a mesh, picking the format from the file extension.
    pub fn load(path: impl AsRef<std::path::Path>) -> MeshResult<Self> {
        io::load_mesh(path.as_ref())
    }

    /// Save a mesh, picking the format from the file extension.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> MeshResult<()> {
        io::save_mesh(self, path.as_ref())
    }

    /// Summary statistics.
    pub fn report(&self) -> MeshReport {
        validate::mesh_report(self)
    }
}
