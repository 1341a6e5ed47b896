//! Shared normalization of a source/target pair into a unit-scale frame.

use nalgebra::{Point3, Vector3};
use tracing::debug;

use crate::error::{MeshError, MeshResult};
use crate::types::Mesh;

/// Similarity `p ↦ (p - center) / scale` applied to both meshes of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    /// Center of the target bounding box, in original units.
    pub center: Point3<f64>,
    /// Larger of the two bounding diagonals, in original units.
    pub scale: f64,
}

impl Normalization {
    /// The identity mapping.
    pub fn identity() -> Self {
        Self {
            center: Point3::origin(),
            scale: 1.0,
        }
    }

    /// Derive the frame from a source/target pair without modifying them.
    ///
    /// Fails with `EmptyMesh` if either mesh has no vertices and with
    /// `DegenerateMesh` if either has zero or non-finite extent.
    pub fn from_pair(source: &Mesh, target: &Mesh) -> MeshResult<Self> {
        let (tmin, tmax) = checked_bounds(target, "target")?;
        let (smin, smax) = checked_bounds(source, "source")?;

        let scale = (smax - smin).norm().max((tmax - tmin).norm());
        Ok(Self {
            center: nalgebra::center(&tmin, &tmax),
            scale,
        })
    }

    #[inline]
    pub fn apply_point(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from((p - self.center) / self.scale)
    }

    #[inline]
    pub fn restore_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.center + p.coords * self.scale
    }

    /// Map a mesh into the normalized frame. Normals are unaffected.
    pub fn apply(&self, mesh: &mut Mesh) {
        mesh.translate(-self.center.coords);
        mesh.scale(1.0 / self.scale);
    }

    /// Map a mesh from the normalized frame back to original units.
    pub fn restore(&self, mesh: &mut Mesh) {
        mesh.scale(self.scale);
        mesh.translate(self.center.coords);
    }

    /// Convert a normalized length into original units.
    #[inline]
    pub fn restore_length(&self, length: f64) -> f64 {
        length * self.scale
    }
}

/// Normalize `source` and `target` in place into the shared frame.
pub fn normalize_pair(source: &mut Mesh, target: &mut Mesh) -> MeshResult<Normalization> {
    let frame = Normalization::from_pair(source, target)?;
    frame.apply(source);
    frame.apply(target);
    debug!(
        center = ?frame.center,
        scale = frame.scale,
        "Normalized source and target"
    );
    Ok(frame)
}

fn checked_bounds(mesh: &Mesh, which: &str) -> MeshResult<(Point3<f64>, Point3<f64>)> {
    let (min, max) = mesh
        .bounds()
        .ok_or_else(|| MeshError::empty_mesh(format!("{} mesh has no vertices", which)))?;
    let extent: Vector3<f64> = max - min;
    let diagonal = extent.norm();
    if !diagonal.is_finite() {
        return Err(MeshError::degenerate_mesh(format!(
            "{} mesh has a non-finite bounding box",
            which
        )));
    }
    if diagonal <= f64::EPSILON * (1.0 + min.coords.norm().max(max.coords.norm())) {
        return Err(MeshError::degenerate_mesh(format!(
            "{} mesh has zero extent",
            which
        )));
    }
    Ok((min, max))
}
