//! Closest-point correspondences against the target surface.
//!
//! Each source point is matched to the nearest point on the target's
//! triangles (not just the nearest vertex), then filtered by the rejection
//! policy and weighted by the Welsch kernel.

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::trace;

use crate::params::RegistrationParams;
use crate::robust::welsch_weight;
use crate::types::{Mesh, Triangle};

/// Vertices whose incident faces are searched per query.
const CANDIDATE_VERTICES: usize = 8;

/// A point on the target surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfacePoint {
    pub point: Point3<f64>,
    /// Interpolated unit normal, zero when the surface has none there.
    pub normal: Vector3<f64>,
    pub distance: f64,
}

/// Spatial index over a fixed target mesh.
pub struct TargetSurface {
    /// `None` for a target without vertices.
    tree: Option<ImmutableKdTree<f64, 3>>,
    positions: Vec<Point3<f64>>,
    normals: Vec<Vector3<f64>>,
    faces: Vec<[u32; 3]>,
    vertex_faces: Vec<Vec<u32>>,
}

impl TargetSurface {
    /// Index a target mesh. Vertex normals are taken as stored; call
    /// [`Mesh::compute_vertex_normals`] first if normal rejection is used.
    pub fn new(target: &Mesh) -> Self {
        let points: Vec<[f64; 3]> = target
            .vertices
            .iter()
            .map(|v| [v.position.x, v.position.y, v.position.z])
            .collect();
        let tree = (!points.is_empty()).then(|| ImmutableKdTree::new_from_slice(&points));
        Self {
            tree,
            positions: target.positions(),
            normals: target.normals(),
            faces: target.faces.clone(),
            vertex_faces: target.vertex_faces(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Position of a target vertex.
    pub fn position(&self, index: usize) -> Point3<f64> {
        self.positions[index]
    }

    /// Normal of a target vertex (zero if unknown).
    pub fn normal(&self, index: usize) -> Vector3<f64> {
        self.normals[index]
    }

    /// Closest target vertex to `query` and its squared distance.
    pub fn nearest_vertex(&self, query: &Point3<f64>) -> Option<(usize, f64)> {
        let nearest = self
            .tree
            .as_ref()?
            .nearest_one::<SquaredEuclidean>(&[query.x, query.y, query.z]);
        Some((nearest.item as usize, nearest.distance))
    }

    /// Closest point on the surface to `query`.
    ///
    /// Triangles incident to the nearest few vertices are tested exactly;
    /// a target without faces degrades to nearest-vertex matching.
    pub fn closest_point(&self, query: &Point3<f64>) -> SurfacePoint {
        let k = CANDIDATE_VERTICES.min(self.positions.len());
        let neighbours = match &self.tree {
            Some(tree) => tree.nearest_n::<SquaredEuclidean>(&[query.x, query.y, query.z], k),
            None => Vec::new(),
        };

        let Some(first) = neighbours.first() else {
            return SurfacePoint {
                point: *query,
                normal: Vector3::zeros(),
                distance: f64::INFINITY,
            };
        };
        let nearest = first.item as usize;
        let mut best = SurfacePoint {
            point: self.positions[nearest],
            normal: self.normals[nearest],
            distance: first.distance.sqrt(),
        };

        for n in &neighbours {
            for &face_idx in &self.vertex_faces[n.item as usize] {
                let face = self.faces[face_idx as usize];
                let [a, b, c] = face.map(|i| self.positions[i as usize]);
                let (point, bary) = Triangle::new(a, b, c).closest_point(query);
                let distance = (point - query).norm();
                if distance < best.distance {
                    best = SurfacePoint {
                        point,
                        normal: self.interpolate_normal(&face, &bary),
                        distance,
                    };
                }
            }
        }
        best
    }

    fn interpolate_normal(&self, face: &[u32; 3], bary: &[f64; 3]) -> Vector3<f64> {
        let blended = face
            .iter()
            .zip(bary)
            .fold(Vector3::zeros(), |acc, (&v, &w)| acc + self.normals[v as usize] * w);
        blended.try_normalize(f64::MIN_POSITIVE).unwrap_or_else(|| {
            let [a, b, c] = face.map(|i| self.positions[i as usize]);
            Triangle::new(a, b, c).normal().unwrap_or_else(Vector3::zeros)
        })
    }
}

/// Which candidate matches are discarded. Both tests must pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RejectionPolicy {
    /// Reject matches farther than this (normalized units).
    pub max_distance: Option<f64>,
    /// Reject matches whose normals differ by more than this angle (radians).
    pub max_normal_angle: Option<f64>,
}

impl RejectionPolicy {
    /// Accept everything.
    pub fn none() -> Self {
        Self::default()
    }

    /// Policy configured by the run parameters.
    pub fn from_params(params: &RegistrationParams) -> Self {
        Self {
            max_distance: params
                .use_distance_reject
                .then_some(params.distance_threshold),
            max_normal_angle: params.use_normal_reject.then_some(params.normal_threshold),
        }
    }

    /// The same policy with distance rejection switched off.
    pub fn without_distance(self) -> Self {
        Self {
            max_distance: None,
            ..self
        }
    }

    /// The same policy with the distance cutoff raised to at least `floor`.
    pub fn relaxed_to(self, floor: f64) -> Self {
        Self {
            max_distance: self.max_distance.map(|max| max.max(floor)),
            ..self
        }
    }

    /// Whether a match passes. The normal test is skipped when either normal
    /// is unknown (zero).
    pub fn accepts(
        &self,
        distance: f64,
        source_normal: &Vector3<f64>,
        target_normal: &Vector3<f64>,
    ) -> bool {
        if let Some(max) = self.max_distance {
            if !(distance <= max) {
                return false;
            }
        }
        if let Some(max_angle) = self.max_normal_angle {
            let (ns, nt) = (source_normal.norm(), target_normal.norm());
            if ns > 0.0 && nt > 0.0 {
                let cos = (source_normal.dot(target_normal) / (ns * nt)).clamp(-1.0, 1.0);
                if cos.acos() > max_angle {
                    return false;
                }
            }
        }
        true
    }
}

/// A source point matched to the target surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Index of the source point.
    pub source: usize,
    pub target_point: Point3<f64>,
    pub target_normal: Vector3<f64>,
    pub distance: f64,
    /// Passed the rejection policy.
    pub valid: bool,
    /// Robust weight in `[0, 1]`; zero for rejected matches.
    pub weight: f64,
}

impl Correspondence {
    /// Recompute the robust weight for a new ν.
    pub fn reweight(&mut self, nu: Option<f64>) {
        self.weight = match (self.valid, nu) {
            (false, _) => 0.0,
            (true, Some(nu)) => welsch_weight(self.distance, nu),
            (true, None) => 1.0,
        };
    }
}

/// Match every source point to the target surface in parallel.
///
/// `normals` holds one (possibly zero) normal per point. With `nu = None`
/// accepted matches get weight 1.
pub fn find_correspondences(
    points: &[Point3<f64>],
    normals: &[Vector3<f64>],
    surface: &TargetSurface,
    policy: &RejectionPolicy,
    nu: Option<f64>,
) -> Vec<Correspondence> {
    debug_assert_eq!(points.len(), normals.len());
    let matches: Vec<Correspondence> = points
        .par_iter()
        .zip(normals.par_iter())
        .enumerate()
        .map(|(source, (p, n))| {
            let hit = surface.closest_point(p);
            let mut c = Correspondence {
                source,
                target_point: hit.point,
                target_normal: hit.normal,
                distance: hit.distance,
                valid: policy.accepts(hit.distance, n, &hit.normal),
                weight: 0.0,
            };
            c.reweight(nu);
            c
        })
        .collect();

    trace!(
        target: "mesh_registration::correspondence",
        points = points.len(),
        valid = count_valid(&matches),
        "Correspondences computed"
    );
    matches
}

/// Number of matches that passed rejection.
pub fn count_valid(matches: &[Correspondence]) -> usize {
    matches.iter().filter(|c| c.valid).count()
}
