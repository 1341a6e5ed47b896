//! Sparse symmetric least-squares systems with three right-hand sides.
//!
//! Energies of the form `Σ w ‖Σ_j c_j x_j - d‖²` over unknown 3-vectors
//! `x_j` share one matrix across x, y and z, so the normal equations are
//! assembled once as triplets and factorized with a sparse Cholesky.

use nalgebra::{DMatrix, Vector3};
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use tracing::warn;

use crate::error::{MeshError, MeshResult};

/// Factorization attempts before giving up; damping grows tenfold each time.
const MAX_ATTEMPTS: usize = 6;

/// Initial damping relative to the mean diagonal entry.
const INITIAL_DAMPING: f64 = 1e-8;

/// Normal equations `A X = B` with `A` symmetric `m×m` and `B` `m×3`.
#[derive(Debug, Clone)]
pub struct SparseSystem {
    size: usize,
    triplets: Vec<(usize, usize, f64)>,
    rhs: DMatrix<f64>,
    trace: f64,
}

impl SparseSystem {
    /// An empty system over `size` unknown 3-vectors.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            triplets: Vec::new(),
            rhs: DMatrix::zeros(size, 3),
            trace: 0.0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn add_matrix(&mut self, i: usize, j: usize, value: f64) {
        if i == j {
            self.trace += value;
        }
        self.triplets.push((i, j, value));
    }

    fn add_rhs(&mut self, i: usize, value: Vector3<f64>) {
        for axis in 0..3 {
            self.rhs[(i, axis)] += value[axis];
        }
    }

    /// Add `w ‖x_i - d‖²`.
    pub fn add_anchor_term(&mut self, weight: f64, i: usize, d: &Vector3<f64>) {
        self.add_matrix(i, i, weight);
        self.add_rhs(i, weight * d);
    }

    /// Add `w ‖x_i - x_j - d‖²`.
    pub fn add_pair_term(&mut self, weight: f64, i: usize, j: usize, d: &Vector3<f64>) {
        self.add_matrix(i, i, weight);
        self.add_matrix(j, j, weight);
        self.add_matrix(i, j, -weight);
        self.add_matrix(j, i, -weight);
        self.add_rhs(i, weight * d);
        self.add_rhs(j, -weight * d);
    }

    /// Add `w ‖Σ_j c_j x_j - target‖²` for `(j, c_j)` in `coefficients`.
    pub fn add_combination_term(
        &mut self,
        weight: f64,
        coefficients: &[(usize, f64)],
        target: &Vector3<f64>,
    ) {
        for &(j, cj) in coefficients {
            for &(k, ck) in coefficients {
                self.add_matrix(j, k, weight * cj * ck);
            }
            self.add_rhs(j, weight * cj * target);
        }
    }

    /// Solve the system, adding `λ‖x - anchor‖²` as damping.
    ///
    /// `λ` starts small relative to the diagonal and grows tenfold after each
    /// failed factorization. Without an anchor the damping pulls towards zero.
    /// Every failure is logged; running out of attempts returns
    /// `SingularSystem`, which callers treat as "keep the previous values".
    pub fn solve(
        &self,
        anchor: Option<&[Vector3<f64>]>,
        stage: &'static str,
    ) -> MeshResult<Vec<Vector3<f64>>> {
        if self.size == 0 {
            return Ok(Vec::new());
        }

        let mean_diagonal = self.trace / self.size as f64;
        let mut lambda = INITIAL_DAMPING * mean_diagonal.max(f64::MIN_POSITIVE.sqrt());

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_solve(lambda, anchor) {
                Ok(solution) => return Ok(solution),
                Err(details) => {
                    let err = MeshError::singular_system(stage, None, details);
                    warn!(
                        target: "mesh_registration::nonrigid",
                        code = %err.code(),
                        attempt,
                        lambda,
                        "{}",
                        err
                    );
                }
            }
            lambda *= 10.0;
        }

        Err(MeshError::singular_system(
            stage,
            None,
            format!("no factorization after {} damping attempts", MAX_ATTEMPTS),
        ))
    }

    fn try_solve(
        &self,
        lambda: f64,
        anchor: Option<&[Vector3<f64>]>,
    ) -> Result<Vec<Vector3<f64>>, String> {
        let mut coo = CooMatrix::new(self.size, self.size);
        for &(i, j, v) in &self.triplets {
            coo.push(i, j, v);
        }
        let mut rhs = self.rhs.clone();
        for i in 0..self.size {
            coo.push(i, i, lambda);
            if let Some(anchor) = anchor {
                for axis in 0..3 {
                    rhs[(i, axis)] += lambda * anchor[i][axis];
                }
            }
        }

        let csc = CscMatrix::from(&coo);
        let cholesky = CscCholesky::factor(&csc).map_err(|e| format!("{:?}", e))?;
        let x = cholesky.solve(&rhs);

        if !x.iter().all(|v| v.is_finite()) {
            return Err("non-finite solution".to_string());
        }
        Ok((0..self.size)
            .map(|i| Vector3::new(x[(i, 0)], x[(i, 1)], x[(i, 2)]))
            .collect())
    }
}
