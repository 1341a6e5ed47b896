//! Input validation for meshes entering a registration run.

use std::fmt;

use nalgebra::Point3;
use tracing::debug;

use crate::error::{MeshError, MeshResult};
use crate::types::Mesh;

/// Reject meshes whose data cannot be registered.
///
/// Checks, in order:
/// - every coordinate is finite
/// - every face index refers to an existing vertex
///
/// The first offending vertex or face is reported.
pub fn validate_mesh_data(mesh: &Mesh) -> MeshResult<()> {
    for (vertex_index, vertex) in mesh.vertices.iter().enumerate() {
        let p = &vertex.position;
        for (coordinate, value) in [("x", p.x), ("y", p.y), ("z", p.z)] {
            if !value.is_finite() {
                return Err(MeshError::InvalidCoordinate {
                    vertex_index,
                    coordinate,
                    value,
                });
            }
        }
    }

    let vertex_count = mesh.vertices.len();
    for (face_index, face) in mesh.faces.iter().enumerate() {
        if let Some(&vertex_index) = face.iter().find(|&&v| v as usize >= vertex_count) {
            return Err(MeshError::InvalidVertexIndex {
                face_index,
                vertex_index,
                vertex_count,
            });
        }
    }

    Ok(())
}

/// Summary statistics for a mesh, as shown by `mesh info`.
#[derive(Debug, Clone)]
pub struct MeshReport {
    pub vertex_count: usize,
    pub face_count: usize,
    pub edge_count: usize,
    /// Axis-aligned bounds, `None` for a mesh without vertices.
    pub bounds: Option<(Point3<f64>, Point3<f64>)>,
    pub bounding_diagonal: f64,
    pub mean_edge_length: f64,
    /// Vertices not referenced by any face.
    pub isolated_vertices: usize,
    /// Faces with (near) zero area.
    pub degenerate_faces: usize,
}

impl MeshReport {
    /// Whether the mesh has enough geometry to take part in a registration.
    pub fn is_registrable(&self) -> bool {
        self.vertex_count > 0 && self.face_count > 0 && self.bounding_diagonal > 0.0
    }
}

impl fmt::Display for MeshReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Vertices:          {}", self.vertex_count)?;
        writeln!(f, "Faces:             {}", self.face_count)?;
        writeln!(f, "Edges:             {}", self.edge_count)?;
        if let Some((min, max)) = self.bounds {
            writeln!(
                f,
                "Bounds:            [{:.4}, {:.4}, {:.4}] .. [{:.4}, {:.4}, {:.4}]",
                min.x, min.y, min.z, max.x, max.y, max.z
            )?;
        }
        writeln!(f, "Diagonal:          {:.6}", self.bounding_diagonal)?;
        writeln!(f, "Mean edge length:  {:.6}", self.mean_edge_length)?;
        if self.isolated_vertices > 0 {
            writeln!(f, "Isolated vertices: {}", self.isolated_vertices)?;
        }
        if self.degenerate_faces > 0 {
            writeln!(f, "Degenerate faces:  {}", self.degenerate_faces)?;
        }
        Ok(())
    }
}

/// Collect summary statistics. Assumes [`validate_mesh_data`] passed.
pub fn mesh_report(mesh: &Mesh) -> MeshReport {
    let mut referenced = vec![false; mesh.vertex_count()];
    for face in &mesh.faces {
        for &v in face {
            if let Some(seen) = referenced.get_mut(v as usize) {
                *seen = true;
            }
        }
    }
    let isolated_vertices = referenced.iter().filter(|&&r| !r).count();

    let diagonal = mesh.bounding_diagonal();
    let area_eps = (diagonal * 1e-9).powi(2);
    let degenerate_faces = mesh.triangles().filter(|t| t.area() <= area_eps).count();

    let report = MeshReport {
        vertex_count: mesh.vertex_count(),
        face_count: mesh.face_count(),
        edge_count: mesh.edges().len(),
        bounds: mesh.bounds(),
        bounding_diagonal: diagonal,
        mean_edge_length: mesh.mean_edge_length(),
        isolated_vertices,
        degenerate_faces,
    };
    debug!(
        vertices = report.vertex_count,
        faces = report.face_count,
        isolated = isolated_vertices,
        degenerate = degenerate_faces,
        "Mesh report"
    );
    report
}
