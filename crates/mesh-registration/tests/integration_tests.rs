//! End-to-end integration tests for mesh-registration.
//!
//! These tests run the full pipeline (load -> normalize -> rigid ->
//! non-rigid -> restore -> save) on synthetic spheres and ellipsoids.

use std::path::Path;
use std::time::Duration;

use mesh_registration::correspondence::TargetSurface;
use mesh_registration::{
    ErrorCode, Landmarks, Mesh, NonRigidRegistration, RegistrationParams, RegistrationPipeline,
    RigidTransform, Vertex,
};
use nalgebra::{Point3, UnitQuaternion, Vector3};
use tempfile::TempDir;

// =============================================================================
// Test Mesh Creation Helpers
// =============================================================================

fn create_sphere(subdivisions: u32) -> Mesh {
    let mut mesh = Mesh::icosphere(subdivisions);
    mesh.compute_vertex_normals();
    mesh
}

/// Ellipsoid with distinct radii so that no rotation maps it onto itself.
fn create_ellipsoid(radii: Vector3<f64>) -> Mesh {
    let mut mesh = Mesh::icosphere(2);
    for v in &mut mesh.vertices {
        v.position = Point3::from(v.position.coords.component_mul(&radii));
    }
    mesh.compute_vertex_normals();
    mesh
}

/// `n × n` grid on the z = 0 plane with unit spacing.
fn create_flat_grid(n: u32) -> Mesh {
    let mut mesh = Mesh::new();
    for y in 0..n {
        for x in 0..n {
            mesh.vertices.push(Vertex::from_coords(x as f64, y as f64, 0.0));
        }
    }
    for y in 0..n - 1 {
        for x in 0..n - 1 {
            let i = y * n + x;
            mesh.faces.push([i, i + 1, i + n + 1]);
            mesh.faces.push([i, i + n + 1, i + n]);
        }
    }
    mesh.compute_vertex_normals();
    mesh
}

/// Defaults with one graph node per vertex.
fn sphere_params() -> RegistrationParams {
    RegistrationParams::default().with_sample_ratio(100.0)
}

/// Distance of each vertex to the closest point on `target`'s triangles.
fn surface_errors(mesh: &Mesh, target: &Mesh) -> Vec<f64> {
    let surface = TargetSurface::new(target);
    mesh.vertices
        .iter()
        .map(|v| surface.closest_point(&v.position).distance)
        .collect()
}

fn rms_and_max(errors: &[f64]) -> (f64, f64) {
    let rms = (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt();
    (rms, errors.iter().cloned().fold(0.0, f64::max))
}

// =============================================================================
// Pipeline scenarios
// =============================================================================

fn scaled_translated_sphere_pair() -> (Mesh, Mesh) {
    let source = create_sphere(3);
    let mut target = source.clone();
    target.scale(1.5);
    target.translate(Vector3::new(1.0, 0.0, 0.0));
    (source, target)
}

#[test]
fn test_sphere_registers_onto_scaled_translated_sphere() {
    let (source, target) = scaled_translated_sphere_pair();

    let mut pipeline = RegistrationPipeline::new(sphere_params());
    let outcome = pipeline.run(source.clone(), target.clone(), None).unwrap();

    assert_eq!(outcome.mesh.vertex_count(), source.vertex_count());
    assert_eq!(outcome.mesh.faces, source.faces);

    // Errors measured in the normalized frame.
    let scale = outcome.normalization.scale;
    let (rms, max) = rms_and_max(&surface_errors(&outcome.mesh, &target));
    assert!(rms / scale < 5e-4, "normalized rms = {}", rms / scale);
    assert!(max / scale < 1e-3, "normalized max = {}", max / scale);

    let timing = outcome.timing;
    assert_eq!(timing.completed(), 4);
    let sum: Duration = timing.phases().iter().filter_map(|(_, d)| *d).sum();
    assert_eq!(sum, timing.total());
}

#[test]
fn test_default_parameters_register_scaled_sphere() {
    let (source, target) = scaled_translated_sphere_pair();
    let params = RegistrationParams::default();
    assert!(!params.use_landmark && params.use_distance_reject);

    let mut pipeline = RegistrationPipeline::new(params);
    let outcome = pipeline.run(source, target.clone(), None).unwrap();

    let scale = outcome.normalization.scale;
    let (rms, max) = rms_and_max(&surface_errors(&outcome.mesh, &target));
    assert!(rms / scale < 5e-3, "normalized rms = {}", rms / scale);
    assert!(max / scale < 1.5e-2, "normalized max = {}", max / scale);
    assert!(outcome.report.nonrigid.iterations > 0);
    assert_eq!(
        outcome.report.nonrigid.valid_correspondences,
        outcome.mesh.vertex_count()
    );
}

#[test]
fn test_planar_pair_registers() {
    let source = create_flat_grid(20);
    let mut target = source.clone();
    target.translate(Vector3::new(0.5, 0.0, 0.0));

    let mut pipeline = RegistrationPipeline::new(RegistrationParams::default());
    let outcome = pipeline.run(source.clone(), target.clone(), None).unwrap();

    assert_eq!(outcome.mesh.vertex_count(), source.vertex_count());
    assert!(outcome.mesh.vertices.iter().all(|v| v.position.z.abs() < 1e-6));
    let (_, max) = rms_and_max(&surface_errors(&outcome.mesh, &target));
    assert!(max < 1e-6, "max = {}", max);
}

#[test]
fn test_rigidly_moved_copy_is_recovered() {
    let target = create_ellipsoid(Vector3::new(2.0, 1.2, 0.8));
    let applied = RigidTransform::from_rotation_translation(
        UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.2),
        Vector3::new(0.3, -0.1, 0.2),
    );
    let mut source = target.clone();
    applied.apply_to_mesh(&mut source);

    let params = sphere_params().with_gt_error(None);
    let mut pipeline = RegistrationPipeline::new(params);
    let outcome = pipeline.run(source.clone(), target, None).unwrap();

    let report = &outcome.report;
    assert!(report.rigid.converged);
    let recovered = report.rigid.transform;
    let undo = applied.inverse();
    assert!(
        recovered.rotation.angle_to(&undo.rotation) < 1e-2,
        "rotation off by {} rad",
        recovered.rotation.angle_to(&undo.rotation)
    );

    // In the normalized frame the undoing motion about the frame center is
    // `p ↦ R⁻¹ p + (A⁻¹(c) - c) / s`.
    let frame = outcome.normalization;
    let expected = (undo.apply_to_point(&frame.center) - frame.center) / frame.scale;
    assert!(
        (recovered.translation - expected).norm() < 1e-3,
        "translation {:?}, expected {:?}",
        recovered.translation,
        expected
    );
    for v in &source.vertices {
        let moved = recovered.apply_to_point(&frame.apply_point(&v.position));
        let home = frame.apply_point(&undo.apply_to_point(&v.position));
        assert!((moved - home).norm() < 2e-3);
    }

    let gt = report.gt_error.unwrap();
    assert!(gt.max < 2e-2, "gt max = {}", gt.max);
    assert!(report.rms_residual < 1e-2, "rms = {}", report.rms_residual);
}

#[test]
fn test_landmarks_are_satisfied() {
    let source = create_sphere(2);
    let mut target = source.clone();
    // Pull a cap of the target outwards so the landmark has somewhere to go.
    let anchor = source.vertices[0].position;
    for v in &mut target.vertices {
        let d = (v.position - anchor).norm();
        if d < 0.6 {
            v.position += v.position.coords * 0.25 * (1.0 - d / 0.6);
        }
    }
    target.compute_vertex_normals();

    let marks = Landmarks::new(vec![0, 5], vec![0, 5]).unwrap();
    let mut pipeline = RegistrationPipeline::new(sphere_params());
    let outcome = pipeline.run(source, target.clone(), Some(marks)).unwrap();

    for index in [0, 5] {
        let d = (outcome.mesh.vertices[index].position - target.vertices[index].position).norm();
        assert!(d < 1e-2, "landmark {} off by {}", index, d);
    }
}

#[test]
fn test_landmark_indices_are_checked_before_running() {
    let source = create_sphere(1);
    let target = create_sphere(1);
    let marks = Landmarks::new(vec![0], vec![target.vertex_count()]).unwrap();

    let mut pipeline = RegistrationPipeline::new(sphere_params());
    let err = pipeline.run(source, target, Some(marks)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::LandmarkOutOfBounds);
    assert_eq!(pipeline.timing().completed(), 0);
}

// =============================================================================
// File-level façade
// =============================================================================

fn write_pair(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let source = create_sphere(2);
    let mut target = source.clone();
    target.scale(1.2);
    target.translate(Vector3::new(0.5, 0.0, 0.0));

    let source_path = dir.join("source.obj");
    let target_path = dir.join("target.ply");
    source.save(&source_path).unwrap();
    target.save(&target_path).unwrap();
    (source_path, target_path)
}

#[test]
fn test_register_meshes_writes_output() {
    let dir = TempDir::new().unwrap();
    let (source_path, target_path) = write_pair(dir.path());
    let output = dir.path().join("registered.stl");
    let gt_report = dir.path().join("gt.txt");

    let mut registration = NonRigidRegistration::new();
    registration.set_parameters(sphere_params().with_gt_error(Some(gt_report.clone())));
    assert!(registration.register_meshes(&source_path, &target_path, &output, None));

    assert!(output.exists());
    let registered = Mesh::load(&output).unwrap();
    assert!(registered.face_count() > 0);
    assert_eq!(registration.timing().completed(), 4);
    assert!(registration.report().is_some());
    assert!(registration.timing_info().contains("Total"));

    let text = std::fs::read_to_string(&gt_report).unwrap();
    assert!(text.starts_with("# iteration"));
    assert!(text.lines().any(|l| l.starts_with("final_rms")));
}

#[test]
fn test_landmark_file_is_used_for_one_run() {
    let dir = TempDir::new().unwrap();
    let (source_path, target_path) = write_pair(dir.path());
    let landmarks = dir.path().join("marks.txt");
    std::fs::write(&landmarks, "# source target\n0 0\n\n7 7\n").unwrap();
    let output = dir.path().join("out.obj");

    let mut registration = NonRigidRegistration::new();
    registration.set_parameters(sphere_params());
    let report = registration
        .try_register_meshes(&source_path, &target_path, &output, Some(&landmarks))
        .unwrap();
    assert!(report.rms_residual.is_finite());
    // The stored parameters are not changed by a per-run landmark file.
    assert!(!registration.parameters().use_landmark);
}

#[test]
fn test_empty_source_fails_without_output() {
    let dir = TempDir::new().unwrap();
    let (_, target_path) = write_pair(dir.path());
    let empty = dir.path().join("empty.obj");
    std::fs::write(&empty, "# no geometry\n").unwrap();
    let output = dir.path().join("out.obj");

    let mut registration = NonRigidRegistration::new();
    assert!(!registration.register_meshes(&empty, &target_path, &output, None));
    assert!(!output.exists());
    assert_eq!(registration.timing().completed(), 0);
    assert!(registration.report().is_none());
}

#[test]
fn test_missing_input_fails_without_output() {
    let dir = TempDir::new().unwrap();
    let (source_path, _) = write_pair(dir.path());
    let output = dir.path().join("out.obj");

    let mut registration = NonRigidRegistration::new();
    let err = registration
        .try_register_meshes(&source_path, &dir.path().join("missing.obj"), &output, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::IoRead);
    assert!(!output.exists());
}

#[test]
fn test_malformed_landmark_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let (source_path, target_path) = write_pair(dir.path());
    let landmarks = dir.path().join("marks.txt");
    std::fs::write(&landmarks, "0 0\n1 two\n").unwrap();
    let output = dir.path().join("out.obj");

    let mut registration = NonRigidRegistration::new();
    let err = registration
        .try_register_meshes(&source_path, &target_path, &output, Some(&landmarks))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ParseError);
    assert!(!output.exists());
}

#[test]
fn test_config_round_trip_drives_a_run() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("registration.toml");
    sphere_params().save_toml(&config).unwrap();
    let loaded = RegistrationParams::from_toml_file(&config).unwrap();
    assert_eq!(loaded, sphere_params());

    let (source_path, target_path) = write_pair(dir.path());
    let output = dir.path().join("out.ply");
    let mut registration = NonRigidRegistration::new();
    registration.set_parameters(loaded);
    assert!(registration.register_meshes(&source_path, &target_path, &output, None));
}
