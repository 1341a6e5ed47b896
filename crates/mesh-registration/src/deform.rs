//! Non-rigid refinement on a deformation graph.
//!
//! Every node `j` carries a rotation `R_j` and translation `t_j`; a source
//! vertex moves to the blend of its nodes' transforms
//!
//! ```text
//! x_i = Σ_j w_ij [R_j (v_i - g_j) + g_j + t_j]
//! ```
//!
//! and the state minimizes
//!
//! ```text
//! E = Σ_valid ψ_ν(|x_i - c_i|)
//!   + α' Σ_j Σ_k∈N(j) ‖t_k - t_j - (R_j - I)(g_k - g_j)‖²
//!   + β' Σ_(j,k)     ‖t_j - t_k‖²
//!   + γ  Σ_l         ‖x_l - p_l‖²
//! ```
//!
//! where `ψ_ν(r) = 1 - exp(-r²/2ν²)` is the scale-free Welsch loss and
//! `α' = α / directed edges`, `β' = β / edges`. The regularizers are mean
//! edge residuals in the normalized frame, so graph density does not shift
//! their balance against the data sum, and the data term stiffens as ν
//! anneals.
//!
//! Distance rejection uses `max(distance_threshold, ν)` as its cutoff: a
//! match inside the current robust scale is never rejected for distance.
//!
//! Each iteration re-matches against the target, fits node rotations by
//! per-node Procrustes and then solves all translations jointly on the
//! Welsch-reweighted quadratic surrogate. A step is kept only when the
//! true energy does not increase.

use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::correspondence::{
    Correspondence, RejectionPolicy, TargetSurface, count_valid, find_correspondences,
};
use crate::error::{ErrorCode, MeshResult};
use crate::graph::DeformationGraph;
use crate::landmark::Landmarks;
use crate::params::{NonRigidParams, RegistrationParams};
use crate::robust::{NuSchedule, median, welsch_loss};
use crate::solver::SparseSystem;
use crate::transform::rotation_from_covariance;
use crate::types::Mesh;

/// Per-node transforms of the deformation graph.
#[derive(Debug, Clone, PartialEq)]
pub struct DeformationState {
    pub rotations: Vec<Matrix3<f64>>,
    pub translations: Vec<Vector3<f64>>,
}

impl DeformationState {
    /// Identity transforms for `node_count` nodes.
    pub fn identity(node_count: usize) -> Self {
        Self {
            rotations: vec![Matrix3::identity(); node_count],
            translations: vec![Vector3::zeros(); node_count],
        }
    }

    pub fn node_count(&self) -> usize {
        self.rotations.len()
    }

    /// Deformed positions of the `rest` vertices.
    pub fn deform(&self, graph: &DeformationGraph, rest: &[Point3<f64>]) -> Vec<Point3<f64>> {
        let anchors = rotated_anchors(graph, rest, &self.rotations);
        anchors
            .into_par_iter()
            .zip(graph.influences.par_iter())
            .map(|(a, bound)| {
                a + bound
                    .iter()
                    .fold(Vector3::zeros(), |acc, &(j, w)| acc + self.translations[j] * w)
            })
            .collect()
    }
}

/// `a_i = Σ_j w_ij [R_j (v_i - g_j) + g_j]`: positions before translation.
fn rotated_anchors(
    graph: &DeformationGraph,
    rest: &[Point3<f64>],
    rotations: &[Matrix3<f64>],
) -> Vec<Point3<f64>> {
    rest.par_iter()
        .zip(graph.influences.par_iter())
        .map(|(v, bound)| {
            let blended = bound.iter().fold(Vector3::zeros(), |acc, &(j, w)| {
                let g = graph.node_positions[j];
                acc + (rotations[j] * (v - g) + g.coords) * w
            });
            Point3::from(blended)
        })
        .collect()
}

/// One non-rigid iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationRecord {
    /// 1-based, counted over all ν levels.
    pub iteration: usize,
    /// Energy after the step.
    pub energy: f64,
    pub nu: f64,
    pub valid_correspondences: usize,
    /// Ground-truth RMS error in normalized units, when tracked.
    pub gt_error: Option<f64>,
}

/// Outcome of the non-rigid stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NonRigidReport {
    pub iterations: usize,
    /// ν levels started.
    pub levels: usize,
    /// The last level met the energy tolerance within its budget.
    pub converged: bool,
    pub final_energy: f64,
    /// Node rotation fits skipped over the whole run.
    pub singular_nodes: usize,
    /// RMS distance of accepted matches on the final mesh.
    pub rms_residual: f64,
    pub valid_correspondences: usize,
    pub records: Vec<IterationRecord>,
}

/// Energy split into its terms (weights applied).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyTerms {
    pub data: f64,
    pub rotation: f64,
    pub translation: f64,
    pub landmark: f64,
}

impl EnergyTerms {
    pub fn total(&self) -> f64 {
        self.data + self.rotation + self.translation + self.landmark
    }
}

#[derive(Debug, Clone, Copy)]
struct TermWeights {
    rotation: f64,
    translation: f64,
    landmark: f64,
}

/// Non-rigid optimizer for one run.
#[derive(Debug, Clone)]
pub struct NonRigidDeformer {
    graph: DeformationGraph,
    rest: Vec<Point3<f64>>,
    node_vertices: Vec<Vec<(usize, f64)>>,
    state: DeformationState,
    settings: NonRigidParams,
    policy: RejectionPolicy,
    schedule: NuSchedule,
    dynamic_nu: bool,
    weights: TermWeights,
    edge_length: f64,
    landmark_sources: Vec<usize>,
    landmark_targets: Vec<Point3<f64>>,
    singular_nodes: usize,
}

impl NonRigidDeformer {
    /// Build the deformation graph over the (rigidly aligned) source.
    pub fn new(params: &RegistrationParams, source: &Mesh) -> Self {
        let rest = source.positions();
        let settings = params.nonrigid.clone();
        let graph = DeformationGraph::build(
            &rest,
            params.uniform_sample_ratio,
            settings.nodes_per_vertex,
            settings.graph_neighbors,
        );

        let mut node_vertices = vec![Vec::new(); graph.node_count()];
        for (i, bound) in graph.influences.iter().enumerate() {
            for &(j, w) in bound {
                if w > 0.0 {
                    node_vertices[j].push((i, w));
                }
            }
        }

        let directed = graph.directed_edge_count();
        let undirected = graph.edges.len();
        let weights = TermWeights {
            rotation: if directed > 0 { params.alpha / directed as f64 } else { 0.0 },
            translation: if undirected > 0 { params.beta / undirected as f64 } else { 0.0 },
            landmark: params.gamma,
        };

        info!(
            target: "mesh_registration::nonrigid",
            vertices = rest.len(),
            nodes = graph.node_count(),
            edges = undirected,
            alpha = weights.rotation,
            beta = weights.translation,
            "Deformation graph ready"
        );

        Self {
            state: DeformationState::identity(graph.node_count()),
            graph,
            edge_length: source.mean_edge_length(),
            rest,
            node_vertices,
            settings,
            policy: RejectionPolicy::from_params(params),
            schedule: params.nu,
            dynamic_nu: params.use_dynamic_nu,
            weights,
            landmark_sources: Vec::new(),
            landmark_targets: Vec::new(),
            singular_nodes: 0,
        }
    }

    /// Pull landmark vertices onto their target vertices.
    ///
    /// Indices must already be validated against both meshes.
    pub fn with_landmarks(mut self, landmarks: &Landmarks, target: &Mesh) -> Self {
        self.landmark_sources = landmarks.source.clone();
        self.landmark_targets = landmarks.target_points(target);
        self
    }

    pub fn graph(&self) -> &DeformationGraph {
        &self.graph
    }

    pub fn state(&self) -> &DeformationState {
        &self.state
    }

    /// Current deformed positions.
    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.state.deform(&self.graph, &self.rest)
    }

    /// Energy of `state` against fixed correspondences.
    pub fn energy(
        &self,
        state: &DeformationState,
        matches: &[Correspondence],
        nu: f64,
    ) -> EnergyTerms {
        let positions = state.deform(&self.graph, &self.rest);
        let data = matches
            .par_iter()
            .filter(|c| c.valid)
            .map(|c| welsch_loss((positions[c.source] - c.target_point).norm(), nu))
            .sum();

        let g = &self.graph.node_positions;
        let (rot, t) = (&state.rotations, &state.translations);
        let rotation: f64 = (0..self.graph.node_count())
            .into_par_iter()
            .map(|j| {
                self.graph.neighbours[j]
                    .iter()
                    .map(|&k| {
                        let e = g[k] - g[j];
                        (t[k] - t[j] - (rot[j] * e - e)).norm_squared()
                    })
                    .sum::<f64>()
            })
            .sum();
        let translation: f64 = self
            .graph
            .edges
            .iter()
            .map(|&(j, k)| (t[j] - t[k]).norm_squared())
            .sum();
        let landmark: f64 = self
            .landmark_sources
            .iter()
            .zip(&self.landmark_targets)
            .map(|(&s, p)| (positions[s] - p).norm_squared())
            .sum();

        EnergyTerms {
            data,
            rotation: self.weights.rotation * rotation,
            translation: self.weights.translation * translation,
            landmark: self.weights.landmark * landmark,
        }
    }

    /// Run the optimization and write the result into `source`.
    pub fn run(&mut self, source: &mut Mesh, surface: &TargetSurface) -> NonRigidReport {
        self.run_with(source, surface, |_| None)
    }

    /// Like [`run`](Self::run), calling `observe` with the positions after
    /// every iteration; its return value is stored as that iteration's
    /// ground-truth error.
    pub fn run_with<F>(
        &mut self,
        source: &mut Mesh,
        surface: &TargetSurface,
        mut observe: F,
    ) -> NonRigidReport
    where
        F: FnMut(&[Point3<f64>]) -> Option<f64>,
    {
        let max_total = self.settings.max_iterations;
        let inner_cap = if self.dynamic_nu {
            self.settings.max_inner_iterations
        } else {
            max_total
        };

        let mut records: Vec<IterationRecord> = Vec::new();
        let mut previous: Option<Vec<Correspondence>> = None;
        let mut nu: Option<f64> = None;
        let mut levels = 0;
        let mut converged = false;

        'levels: while records.len() < max_total {
            levels += 1;
            let mut level_converged = false;

            for _ in 0..inner_cap {
                if records.len() >= max_total {
                    break;
                }
                let positions = self.positions();
                source.set_positions(&positions);
                source.compute_vertex_normals();
                let normals = source.normals();

                // Distance is tested once ν is known.
                let unbounded = self.policy.without_distance();
                let mut matches =
                    find_correspondences(&positions, &normals, surface, &unbounded, None);
                if let Some(previous) = &previous {
                    keep_closer(&mut matches, previous, &positions, &normals, &unbounded);
                }

                let level_nu = *nu.get_or_insert_with(|| {
                    let distances: Vec<f64> = matches
                        .iter()
                        .filter(|c| c.valid)
                        .map(|c| c.distance)
                        .collect();
                    self.schedule.initial(median(&distances), self.edge_length)
                });
                let policy = self.policy.relaxed_to(level_nu);
                for c in &mut matches {
                    c.valid = c.valid
                        && policy.accepts(c.distance, &normals[c.source], &c.target_normal);
                    c.reweight(Some(level_nu));
                }

                let valid = count_valid(&matches);
                if valid == 0 && self.landmark_sources.is_empty() {
                    warn!(
                        target: "mesh_registration::nonrigid",
                        iteration = records.len() + 1,
                        "No valid correspondences; stopping non-rigid refinement"
                    );
                    break 'levels;
                }

                let (before, after) = self.step(&matches, level_nu);
                let gt_error = observe(&self.positions());
                let record = IterationRecord {
                    iteration: records.len() + 1,
                    energy: after,
                    nu: level_nu,
                    valid_correspondences: valid,
                    gt_error,
                };
                debug!(
                    target: "mesh_registration::nonrigid",
                    iteration = record.iteration,
                    energy = after,
                    nu = level_nu,
                    valid,
                    gt_error = ?gt_error,
                    "Non-rigid iteration"
                );
                records.push(record);
                previous = Some(matches);

                let decrease = (before - after) / before.max(f64::MIN_POSITIVE);
                if decrease < self.settings.tolerance {
                    level_converged = true;
                    break;
                }
            }

            converged = level_converged;
            if !self.dynamic_nu {
                break;
            }
            match nu.and_then(|current| self.schedule.next(current, self.edge_length)) {
                Some(next) => {
                    debug!(target: "mesh_registration::nonrigid", nu = next, "Next ν level");
                    nu = Some(next);
                }
                None => break,
            }
        }
        if records.len() >= max_total && !converged {
            debug!(
                target: "mesh_registration::nonrigid",
                iterations = records.len(),
                "Iteration budget exhausted; keeping best-effort result"
            );
        }

        let positions = self.positions();
        source.set_positions(&positions);
        source.compute_vertex_normals();
        let final_matches =
            find_correspondences(&positions, &source.normals(), surface, &self.policy, None);
        let valid_correspondences = count_valid(&final_matches);
        let rms_residual = if valid_correspondences > 0 {
            let sum: f64 = final_matches
                .iter()
                .filter(|c| c.valid)
                .map(|c| c.distance * c.distance)
                .sum();
            (sum / valid_correspondences as f64).sqrt()
        } else {
            0.0
        };

        let report = NonRigidReport {
            iterations: records.len(),
            levels,
            converged,
            final_energy: records.last().map_or(0.0, |r| r.energy),
            singular_nodes: self.singular_nodes,
            rms_residual,
            valid_correspondences,
            records,
        };
        info!(
            target: "mesh_registration::nonrigid",
            iterations = report.iterations,
            levels = report.levels,
            converged = report.converged,
            energy = report.final_energy,
            rms_residual = report.rms_residual,
            singular_nodes = report.singular_nodes,
            "Non-rigid refinement finished"
        );
        report
    }

    /// One local/global update. Returns the energy before and after.
    fn step(&mut self, matches: &[Correspondence], nu: f64) -> (f64, f64) {
        let current = self.energy(&self.state, matches, nu).total();

        // Quadratic surrogate of the Welsch loss around the current residuals.
        let scale = 1.0 / (2.0 * nu * nu);
        let n = self.rest.len();
        let mut targets = vec![Point3::origin(); n];
        let mut omega = vec![0.0; n];
        for c in matches {
            targets[c.source] = c.target_point;
            omega[c.source] = c.weight * scale;
        }

        let rotations = self.fit_rotations(&targets, &omega);
        let translations = self
            .solve_translations(&rotations, &targets, &omega)
            .unwrap_or_else(|_| self.state.translations.clone());
        let candidate = DeformationState {
            rotations,
            translations,
        };
        let terms = self.energy(&candidate, matches, nu);
        if terms.total() <= current {
            debug!(
                target: "mesh_registration::nonrigid",
                data = terms.data,
                rotation = terms.rotation,
                translation = terms.translation,
                landmark = terms.landmark,
                "Accepted rotation and translation update"
            );
            self.state = candidate;
            return (current, terms.total());
        }

        // The rotation fit raised the energy; retry with translations only.
        if let Ok(translations) = self.solve_translations(&self.state.rotations, &targets, &omega) {
            let candidate = DeformationState {
                rotations: self.state.rotations.clone(),
                translations,
            };
            let energy = self.energy(&candidate, matches, nu).total();
            if energy <= current {
                debug!(
                    target: "mesh_registration::nonrigid",
                    energy,
                    "Rotation update rejected; accepted translation update"
                );
                self.state = candidate;
                return (current, energy);
            }
        }

        debug!(target: "mesh_registration::nonrigid", energy = current, "Step rejected");
        (current, current)
    }

    /// Per-node Procrustes fit of `R_j` with translations held fixed.
    ///
    /// A node whose covariance is degenerate keeps its rotation.
    fn fit_rotations(&mut self, targets: &[Point3<f64>], omega: &[f64]) -> Vec<Matrix3<f64>> {
        let g = &self.graph.node_positions;
        let t = &self.state.translations;
        let fits: Vec<MeshResult<Matrix3<f64>>> = (0..self.graph.node_count())
            .into_par_iter()
            .map(|j| {
                let mut h = Matrix3::zeros();
                for &(i, w) in &self.node_vertices[j] {
                    if omega[i] > 0.0 {
                        let from = self.rest[i] - g[j];
                        let to = targets[i] - g[j] - t[j];
                        h += omega[i] * w * from * to.transpose();
                    }
                }
                for &k in &self.graph.neighbours[j] {
                    let e = g[k] - g[j];
                    h += self.weights.rotation * e * (e + t[k] - t[j]).transpose();
                }
                for (&s, p) in self.landmark_sources.iter().zip(&self.landmark_targets) {
                    if let Some(&(_, w)) = self.graph.influences[s].iter().find(|(n, _)| *n == j) {
                        let from = self.rest[s] - g[j];
                        let to = p - g[j] - t[j];
                        h += self.weights.landmark * w * from * to.transpose();
                    }
                }
                rotation_from_covariance(&h, "node rotation fit")
            })
            .collect();

        let mut skipped = 0;
        let rotations = fits
            .into_iter()
            .enumerate()
            .map(|(j, fit)| match fit {
                Ok(r) => r,
                Err(err) => {
                    skipped += 1;
                    debug!(
                        target: "mesh_registration::nonrigid",
                        node = j,
                        code = %err.code(),
                        "{}",
                        err
                    );
                    self.state.rotations[j]
                }
            })
            .collect();

        if skipped > 0 {
            warn!(
                target: "mesh_registration::nonrigid",
                code = ErrorCode::SingularSystem.as_str(),
                nodes = skipped,
                "Singular rotation fit; nodes kept their previous rotation"
            );
            self.singular_nodes += skipped;
        }
        rotations
    }

    /// Jointly solve all translations for fixed rotations.
    ///
    /// The solver's damping pulls towards the current translations, so the
    /// result never raises the reweighted surrogate energy.
    fn solve_translations(
        &self,
        rotations: &[Matrix3<f64>],
        targets: &[Point3<f64>],
        omega: &[f64],
    ) -> MeshResult<Vec<Vector3<f64>>> {
        let graph = &self.graph;
        let g = &graph.node_positions;
        let anchors = rotated_anchors(graph, &self.rest, rotations);
        let mut system = SparseSystem::new(graph.node_count());

        for (i, bound) in graph.influences.iter().enumerate() {
            if omega[i] > 0.0 {
                system.add_combination_term(omega[i], bound, &(targets[i] - anchors[i]));
            }
        }
        if self.weights.rotation > 0.0 {
            for (j, neighbours) in graph.neighbours.iter().enumerate() {
                for &k in neighbours {
                    let e = g[k] - g[j];
                    let offset = rotations[j] * e - e;
                    system.add_pair_term(self.weights.rotation, k, j, &offset);
                }
            }
        }
        if self.weights.translation > 0.0 {
            for &(j, k) in &graph.edges {
                system.add_pair_term(self.weights.translation, j, k, &Vector3::zeros());
            }
        }
        for (&s, p) in self.landmark_sources.iter().zip(&self.landmark_targets) {
            system.add_combination_term(self.weights.landmark, &graph.influences[s], &(p - anchors[s]));
        }

        system
            .solve(Some(&self.state.translations), "non-rigid translation solve")
            .inspect_err(|err| {
                warn!(
                    target: "mesh_registration::nonrigid",
                    code = %err.code(),
                    "Translation solve failed; keeping previous translations: {}",
                    err
                );
            })
    }
}

/// Keep last iteration's target point wherever it is closer than the fresh
/// match; the surface search only inspects faces near the nearest vertices.
fn keep_closer(
    matches: &mut [Correspondence],
    previous: &[Correspondence],
    positions: &[Point3<f64>],
    normals: &[Vector3<f64>],
    policy: &RejectionPolicy,
) {
    for (c, old) in matches.iter_mut().zip(previous) {
        let distance = (positions[c.source] - old.target_point).norm();
        if distance < c.distance {
            c.target_point = old.target_point;
            c.target_normal = old.target_normal;
            c.distance = distance;
            c.valid = policy.accepts(distance, &normals[c.source], &old.target_normal);
        }
    }
}
