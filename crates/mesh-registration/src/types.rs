//! Core mesh data types.

use std::collections::{BTreeSet, HashMap};

use nalgebra::{Point3, Vector3};

/// A vertex in the mesh with optional computed attributes.
///
/// Coordinates are unit-agnostic; registration works in a normalized frame
/// and restores the caller's units on output.
#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    /// 3D position.
    pub position: Point3<f64>,

    /// Unit normal vector, computed from adjacent faces.
    pub normal: Option<Vector3<f64>>,
}

impl Vertex {
    /// Create a new vertex with only position set.
    #[inline]
    pub fn new(position: Point3<f64>) -> Self {
        Self {
            position,
            normal: None,
        }
    }

    /// Create a vertex from raw coordinates.
    #[inline]
    pub fn from_coords(x: f64, y: f64, z: f64) -> Self {
        Self::new(Point3::new(x, y, z))
    }
}

/// A triangle mesh with indexed vertices and faces.
///
/// The vertex count never changes during registration; only positions and
/// normals are rewritten.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    /// Vertex data.
    pub vertices: Vec<Vertex>,

    /// Triangle faces as indices into the vertex array.
    /// Each face is [v0, v1, v2] with counter-clockwise winding.
    pub faces: Vec<[u32; 3]>,
}

impl Mesh {
    /// Create a new empty mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mesh with pre-allocated capacity.
    pub fn with_capacity(vertex_count: usize, face_count: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(vertex_count),
            faces: Vec::with_capacity(face_count),
        }
    }

    /// Number of vertices in the mesh.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of faces (triangles) in the mesh.
    #[inline]
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if mesh is empty (no vertices or faces).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Vertex positions in index order.
    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.vertices.iter().map(|v| v.position).collect()
    }

    /// Vertex normals in index order; missing normals become zero vectors.
    pub fn normals(&self) -> Vec<Vector3<f64>> {
        self.vertices
            .iter()
            .map(|v| v.normal.unwrap_or_else(Vector3::zeros))
            .collect()
    }

    /// Overwrite vertex positions. `positions` must have one entry per vertex.
    pub fn set_positions(&mut self, positions: &[Point3<f64>]) {
        debug_assert_eq!(positions.len(), self.vertices.len());
        for (vertex, p) in self.vertices.iter_mut().zip(positions) {
            vertex.position = *p;
        }
    }

    /// Compute the axis-aligned bounding box.
    /// Returns (min_corner, max_corner) or None if mesh has no vertices.
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let first = self.vertices.first()?.position;
        let (mut min, mut max) = (first, first);

        for vertex in &self.vertices[1..] {
            let p = &vertex.position;
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }

        Some((min, max))
    }

    /// Length of the bounding box diagonal, 0 for a mesh without vertices.
    pub fn bounding_diagonal(&self) -> f64 {
        self.bounds().map_or(0.0, |(min, max)| (max - min).norm())
    }

    /// Mean of the vertex positions.
    pub fn centroid(&self) -> Option<Point3<f64>> {
        if self.vertices.is_empty() {
            return None;
        }
        let sum = self
            .vertices
            .iter()
            .fold(Vector3::zeros(), |acc, v| acc + v.position.coords);
        Some(Point3::from(sum / self.vertices.len() as f64))
    }

    /// Unique undirected edges, each as (low, high) vertex indices.
    pub fn edges(&self) -> BTreeSet<(u32, u32)> {
        let mut edges = BTreeSet::new();
        for face in &self.faces {
            for k in 0..3 {
                let (a, b) = (face[k], face[(k + 1) % 3]);
                edges.insert((a.min(b), a.max(b)));
            }
        }
        edges
    }

    /// Average length of the unique edges, 0 when there are none.
    pub fn mean_edge_length(&self) -> f64 {
        let edges = self.edges();
        if edges.is_empty() {
            return 0.0;
        }
        let total: f64 = edges
            .iter()
            .map(|&(a, b)| {
                (self.vertices[a as usize].position - self.vertices[b as usize].position).norm()
            })
            .sum();
        total / edges.len() as f64
    }

    /// For every vertex, the faces that reference it.
    pub fn vertex_faces(&self) -> Vec<Vec<u32>> {
        let mut adjacency = vec![Vec::new(); self.vertices.len()];
        for (face_idx, face) in self.faces.iter().enumerate() {
            for &v in face {
                adjacency[v as usize].push(face_idx as u32);
            }
        }
        adjacency
    }

    /// Iterate over triangles, yielding Triangle structs with actual vertex data.
    pub fn triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        self.faces.iter().map(|&[i0, i1, i2]| Triangle {
            v0: self.vertices[i0 as usize].position,
            v1: self.vertices[i1 as usize].position,
            v2: self.vertices[i2 as usize].position,
        })
    }

    /// Get a specific triangle by face index.
    pub fn triangle(&self, face_idx: usize) -> Option<Triangle> {
        self.faces.get(face_idx).map(|&[i0, i1, i2]| Triangle {
            v0: self.vertices[i0 as usize].position,
            v1: self.vertices[i1 as usize].position,
            v2: self.vertices[i2 as usize].position,
        })
    }

    /// Recompute area-weighted vertex normals from the faces.
    ///
    /// Vertices with no incident area keep `normal = None`.
    pub fn compute_vertex_normals(&mut self) {
        let mut accum = vec![Vector3::<f64>::zeros(); self.vertices.len()];

        for face in &self.faces {
            // Cross product length is twice the area, which gives the weighting.
            let n = Triangle::new(
                self.vertices[face[0] as usize].position,
                self.vertices[face[1] as usize].position,
                self.vertices[face[2] as usize].position,
            )
            .normal_unnormalized();
            for &v in face {
                accum[v as usize] += n;
            }
        }

        for (vertex, n) in self.vertices.iter_mut().zip(accum) {
            vertex.normal = n.try_normalize(f64::MIN_POSITIVE);
        }
    }

    /// Move every vertex by `offset`.
    pub fn translate(&mut self, offset: Vector3<f64>) {
        for v in &mut self.vertices {
            v.position += offset;
        }
    }

    /// Scale every vertex about the origin.
    pub fn scale(&mut self, factor: f64) {
        for v in &mut self.vertices {
            v.position.coords *= factor;
        }
    }

    /// Unit icosphere with outward-facing counter-clockwise faces.
    ///
    /// Each subdivision level splits every triangle in four; level `n` has
    /// `10·4ⁿ + 2` vertices.
    pub fn icosphere(subdivisions: u32) -> Self {
        let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;
        let corners = [
            [-1.0, phi, 0.0],
            [1.0, phi, 0.0],
            [-1.0, -phi, 0.0],
            [1.0, -phi, 0.0],
            [0.0, -1.0, phi],
            [0.0, 1.0, phi],
            [0.0, -1.0, -phi],
            [0.0, 1.0, -phi],
            [phi, 0.0, -1.0],
            [phi, 0.0, 1.0],
            [-phi, 0.0, -1.0],
            [-phi, 0.0, 1.0],
        ];

        let mut mesh = Mesh::with_capacity(12, 20);
        for c in &corners {
            let p = Vector3::new(c[0], c[1], c[2]).normalize();
            mesh.vertices.push(Vertex::new(Point3::from(p)));
        }
        mesh.faces = vec![
            [0, 11, 5],
            [0, 5, 1],
            [0, 1, 7],
            [0, 7, 10],
            [0, 10, 11],
            [1, 5, 9],
            [5, 11, 4],
            [11, 10, 2],
            [10, 7, 6],
            [7, 1, 8],
            [3, 9, 4],
            [3, 4, 2],
            [3, 2, 6],
            [3, 6, 8],
            [3, 8, 9],
            [4, 9, 5],
            [2, 4, 11],
            [6, 2, 10],
            [8, 6, 7],
            [9, 8, 1],
        ];

        for _ in 0..subdivisions {
            mesh = mesh.subdivide_on_sphere();
        }
        mesh
    }

    /// Split every face in four, pushing the new midpoints onto the unit sphere.
    fn subdivide_on_sphere(&self) -> Mesh {
        let mut out = Mesh::with_capacity(
            self.vertices.len() + self.faces.len() * 3 / 2,
            self.faces.len() * 4,
        );
        out.vertices = self.vertices.clone();

        let mut midpoints: HashMap<(u32, u32), u32> = HashMap::new();
        let mut midpoint = |a: u32, b: u32, vertices: &mut Vec<Vertex>| -> u32 {
            *midpoints.entry((a.min(b), a.max(b))).or_insert_with(|| {
                let m = (vertices[a as usize].position.coords
                    + vertices[b as usize].position.coords)
                    .normalize();
                vertices.push(Vertex::new(Point3::from(m)));
                (vertices.len() - 1) as u32
            })
        };

        for &[a, b, c] in &self.faces {
            let ab = midpoint(a, b, &mut out.vertices);
            let bc = midpoint(b, c, &mut out.vertices);
            let ca = midpoint(c, a, &mut out.vertices);
            out.faces.push([a, ab, ca]);
            out.faces.push([b, bc, ab]);
            out.faces.push([c, ca, bc]);
            out.faces.push([ab, bc, ca]);
        }
        out
    }
}

/// A triangle with concrete vertex positions.
///
/// Utility type for geometric calculations. Winding is counter-clockwise
/// when viewed from the front (normal points toward viewer).
#[derive(Debug, Clone, Copy)]
pub struct Triangle {
    pub v0: Point3<f64>,
    pub v1: Point3<f64>,
    pub v2: Point3<f64>,
}

impl Triangle {
    /// Create a new triangle from three points.
    #[inline]
    pub fn new(v0: Point3<f64>, v1: Point3<f64>, v2: Point3<f64>) -> Self {
        Self { v0, v1, v2 }
    }

    /// Compute the (unnormalized) face normal via cross product.
    /// The direction follows the right-hand rule with CCW winding.
    #[inline]
    pub fn normal_unnormalized(&self) -> Vector3<f64> {
        (self.v1 - self.v0).cross(&(self.v2 - self.v0))
    }

    /// Compute the unit face normal.
    /// Returns None for degenerate triangles (zero area).
    pub fn normal(&self) -> Option<Vector3<f64>> {
        self.normal_unnormalized().try_normalize(f64::EPSILON)
    }

    /// Compute the area of the triangle.
    #[inline]
    pub fn area(&self) -> f64 {
        self.normal_unnormalized().norm() * 0.5
    }

    /// Point of the triangle closest to `p`, with its barycentric
    /// coordinates `[w0, w1, w2]` relative to `v0`, `v1`, `v2`.
    ///
    /// Walks the Voronoi regions of the vertices and edges before falling
    /// back to the face interior, so it is exact for every query point.
    pub fn closest_point(&self, p: &Point3<f64>) -> (Point3<f64>, [f64; 3]) {
        let (a, b, c) = (self.v0, self.v1, self.v2);
        let ab = b - a;
        let ac = c - a;

        let ap = p - a;
        let d1 = ab.dot(&ap);
        let d2 = ac.dot(&ap);
        if d1 <= 0.0 && d2 <= 0.0 {
            return (a, [1.0, 0.0, 0.0]);
        }

        let bp = p - b;
        let d3 = ab.dot(&bp);
        let d4 = ac.dot(&bp);
        if d3 >= 0.0 && d4 <= d3 {
            return (b, [0.0, 1.0, 0.0]);
        }

        let vc = d1 * d4 - d3 * d2;
        if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
            let v = d1 / (d1 - d3);
            return (a + ab * v, [1.0 - v, v, 0.0]);
        }

        let cp = p - c;
        let d5 = ab.dot(&cp);
        let d6 = ac.dot(&cp);
        if d6 >= 0.0 && d5 <= d6 {
            return (c, [0.0, 0.0, 1.0]);
        }

        let vb = d5 * d2 - d1 * d6;
        if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
            let w = d2 / (d2 - d6);
            return (a + ac * w, [1.0 - w, 0.0, w]);
        }

        let va = d3 * d6 - d5 * d4;
        if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
            let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
            return (b + (c - b) * w, [0.0, 1.0 - w, w]);
        }

        let denom = va + vb + vc;
        if denom.abs() <= f64::MIN_POSITIVE {
            // Collinear corners: report the nearest corner.
            let corners = [(a, [1.0, 0.0, 0.0]), (b, [0.0, 1.0, 0.0]), (c, [0.0, 0.0, 1.0])];
            return corners
                .into_iter()
                .min_by(|x, y| {
                    (x.0 - p)
                        .norm_squared()
                        .total_cmp(&(y.0 - p).norm_squared())
                })
                .unwrap_or((a, [1.0, 0.0, 0.0]));
        }
        let v = vb / denom;
        let w = vc / denom;
        (a + ab * v + ac * w, [1.0 - v - w, v, w])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    fn unit_triangle() -> Triangle {
        Triangle::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        )
    }

    #[test]
    fn test_vertex_creation() {
        let v = Vertex::from_coords(1.0, 2.0, 3.0);
        assert!(approx_eq(v.position.x, 1.0));
        assert!(approx_eq(v.position.y, 2.0));
        assert!(approx_eq(v.position.z, 3.0));
        assert!(v.normal.is_none());
    }

    #[test]
    fn test_triangle_normal_and_area() {
        let tri = unit_triangle();
        let normal = tri.normal().expect("non-degenerate triangle");
        assert!(approx_eq(normal.z, 1.0));
        assert!(approx_eq(tri.area(), 0.5));
    }

    #[test]
    fn test_closest_point_regions() {
        let tri = unit_triangle();

        // Above the interior projects straight down.
        let (q, bary) = tri.closest_point(&Point3::new(0.25, 0.25, 2.0));
        assert!((q - Point3::new(0.25, 0.25, 0.0)).norm() < 1e-12);
        assert!(approx_eq(bary[0], 0.5));

        // Beyond a corner snaps to it.
        let (q, bary) = tri.closest_point(&Point3::new(-1.0, -1.0, 0.0));
        assert_eq!(q, tri.v0);
        assert_eq!(bary, [1.0, 0.0, 0.0]);

        // Outside the hypotenuse lands on the edge.
        let (q, bary) = tri.closest_point(&Point3::new(1.0, 1.0, 0.0));
        assert!((q - Point3::new(0.5, 0.5, 0.0)).norm() < 1e-12);
        assert!(approx_eq(bary[1], 0.5) && approx_eq(bary[2], 0.5));
    }

    #[test]
    fn test_closest_point_on_collinear_triangle() {
        let tri = Triangle::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        );
        let (q, _) = tri.closest_point(&Point3::new(1.9, 0.5, 0.0));
        assert!(q.x.is_finite() && q.y.abs() < 1e-12);
    }

    #[test]
    fn test_icosphere_counts_and_orientation() {
        for level in 0..3 {
            let mesh = Mesh::icosphere(level);
            assert_eq!(mesh.vertex_count(), 10 * 4usize.pow(level) + 2);
            assert_eq!(mesh.face_count(), 20 * 4usize.pow(level));
            for v in &mesh.vertices {
                assert!(approx_eq(v.position.coords.norm(), 1.0));
            }
        }

        let mesh = Mesh::icosphere(1);
        for tri in mesh.triangles() {
            let n = tri.normal().expect("icosphere faces are not degenerate");
            let c = (tri.v0.coords + tri.v1.coords + tri.v2.coords) / 3.0;
            assert!(n.dot(&c) > 0.0, "face points inward");
        }
    }

    #[test]
    fn test_vertex_normals_point_outward_on_sphere() {
        let mut mesh = Mesh::icosphere(2);
        mesh.compute_vertex_normals();
        for v in &mesh.vertices {
            let n = v.normal.expect("every sphere vertex has incident faces");
            assert!(n.dot(&v.position.coords) > 0.99);
        }
    }

    #[test]
    fn test_edges_and_adjacency() {
        let mesh = Mesh::icosphere(0);
        assert_eq!(mesh.edges().len(), 30);
        assert!(mesh.vertex_faces().iter().all(|faces| faces.len() == 5));
        assert!(mesh.mean_edge_length() > 1.0 && mesh.mean_edge_length() < 1.1);
    }

    #[test]
    fn test_bounds_and_diagonal() {
        let mut mesh = Mesh::icosphere(1);
        mesh.scale(2.0);
        mesh.translate(Vector3::new(1.0, 0.0, 0.0));
        let (min, max) = mesh.bounds().expect("non-empty mesh");
        assert!(approx_eq(min.x, -1.0) && approx_eq(max.x, 3.0));
        let centroid = mesh.centroid().expect("non-empty mesh");
        assert!((centroid - Point3::new(1.0, 0.0, 0.0)).norm() < 1e-9);
        assert!(Mesh::new().bounding_diagonal() == 0.0);
    }
}
