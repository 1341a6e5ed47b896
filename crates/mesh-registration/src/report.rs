//! Run reports and ground-truth error tracking.

use std::fmt;
use std::fmt::Write as _;
use std::path::Path;

use nalgebra::Point3;
use tracing::{info, warn};

use crate::deform::{IterationRecord, NonRigidReport};
use crate::error::{MeshError, MeshResult};
use crate::io::load_mesh;
use crate::normalize::Normalization;
use crate::params::RegistrationParams;
use crate::rigid::RigidReport;
use crate::types::Mesh;

/// Per-vertex distance between the result and a ground-truth mesh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GtError {
    pub rms: f64,
    pub max: f64,
}

impl GtError {
    /// Convert from normalized to original units.
    pub fn restore(self, frame: &Normalization) -> Self {
        Self {
            rms: frame.restore_length(self.rms),
            max: frame.restore_length(self.max),
        }
    }
}

/// Ground-truth positions with one entry per source vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruth {
    positions: Vec<Point3<f64>>,
}

impl GroundTruth {
    pub fn new(mesh: &Mesh) -> Self {
        Self {
            positions: mesh.positions(),
        }
    }

    /// Pick the ground truth for a run, if error tracking is enabled.
    ///
    /// Uses `params.gt_mesh` when set, otherwise the target itself. A
    /// reference whose vertex count differs from the source cannot be
    /// compared per vertex and is skipped with a warning.
    pub fn resolve(
        params: &RegistrationParams,
        target: &Mesh,
        source_vertices: usize,
    ) -> MeshResult<Option<Self>> {
        if !params.calc_gt_err {
            return Ok(None);
        }
        let reference = match &params.gt_mesh {
            Some(path) => Self::new(&load_mesh(path)?),
            None => Self::new(target),
        };
        if reference.positions.len() != source_vertices {
            warn!(
                target: "mesh_registration::io",
                reference_vertices = reference.positions.len(),
                source_vertices,
                "Ground-truth vertex count differs from source; error tracking disabled"
            );
            return Ok(None);
        }
        Ok(Some(reference))
    }

    /// Map the reference into the registration frame.
    pub fn normalize(&mut self, frame: &Normalization) {
        for p in &mut self.positions {
            *p = frame.apply_point(p);
        }
    }

    /// RMS and maximum per-vertex distance. `None` for mismatched counts.
    pub fn error(&self, positions: &[Point3<f64>]) -> Option<GtError> {
        if positions.len() != self.positions.len() || positions.is_empty() {
            return None;
        }
        let (sum, max) = positions
            .iter()
            .zip(&self.positions)
            .map(|(p, q)| (p - q).norm())
            .fold((0.0, 0.0f64), |(sum, max), d| (sum + d * d, max.max(d)));
        Some(GtError {
            rms: (sum / positions.len() as f64).sqrt(),
            max,
        })
    }
}

/// Write per-iteration ground-truth errors and the final values, all in
/// original units. `final_error` is expected already restored.
pub fn write_gt_report(
    path: &Path,
    records: &[IterationRecord],
    final_error: Option<GtError>,
    frame: &Normalization,
) -> MeshResult<()> {
    let mut text = String::from("# iteration gt_rms nu energy\n");
    for r in records {
        if let Some(rms) = r.gt_error {
            let _ = writeln!(
                text,
                "{} {:.9e} {:.6e} {:.6e}",
                r.iteration,
                frame.restore_length(rms),
                r.nu,
                r.energy
            );
        }
    }
    if let Some(err) = final_error {
        let _ = writeln!(text, "final_rms {:.9e}", err.rms);
        let _ = writeln!(text, "final_max {:.9e}", err.max);
    }

    std::fs::write(path, text).map_err(|e| MeshError::io_write(path, e))?;
    info!(target: "mesh_registration::io", path = %path.display(), "Wrote ground-truth report");
    Ok(())
}

/// Summary of a completed registration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationReport {
    pub rigid: RigidReport,
    pub nonrigid: NonRigidReport,
    /// Final RMS correspondence distance in original units.
    pub rms_residual: f64,
    /// Final ground-truth error in original units, when tracked.
    pub gt_error: Option<GtError>,
}

impl fmt::Display for RegistrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Rigid: {} iterations, rotation {:.4} rad, translation {:.4}",
            self.rigid.iterations,
            self.rigid.transform.rotation.angle(),
            self.rigid.transform.translation.norm()
        )?;
        writeln!(
            f,
            "Non-rigid: {} iterations over {} levels ({}), energy {:.6e}",
            self.nonrigid.iterations,
            self.nonrigid.levels,
            if self.nonrigid.converged {
                "converged"
            } else {
                "budget reached"
            },
            self.nonrigid.final_energy
        )?;
        if self.nonrigid.singular_nodes > 0 {
            writeln!(f, "Skipped node fits: {}", self.nonrigid.singular_nodes)?;
        }
        write!(f, "RMS residual: {:.6}", self.rms_residual)?;
        if let Some(gt) = self.gt_error {
            write!(f, "\nGround truth: rms {:.6}, max {:.6}", gt.rms, gt.max)?;
        }
        Ok(())
    }
}
