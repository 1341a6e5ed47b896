//! Tracing helpers for registration runs.
//!
//! Every pipeline phase runs inside a [`StageTimer`], which opens an
//! `info` span and logs the phase duration when it is dropped. Enable the
//! output by installing a subscriber in the application:
//!
//! ```rust,ignore
//! use tracing_subscriber::{fmt, prelude::*, EnvFilter};
//!
//! tracing_subscriber::registry()
//!     .with(fmt::layer())
//!     .with(EnvFilter::from_default_env())
//!     .init();
//!
//! // RUST_LOG=mesh_registration=debug shows per-iteration energies.
//! ```
//!
//! # Targets
//!
//! - `mesh_registration::timing`: phase durations
//! - `mesh_registration::rigid`, `mesh_registration::nonrigid`: stage progress
//! - `mesh_registration::correspondence`: matching statistics (trace)
//! - `mesh_registration::io`: file loading and saving

use std::time::{Duration, Instant};

use tracing::{Span, debug, info};

use crate::types::Mesh;

/// A phase timer that logs its duration on drop.
///
/// ```rust,ignore
/// let timer = StageTimer::new("rigid");
/// let _enter = timer.span().enter();
/// // ... run the phase ...
/// let elapsed = timer.elapsed();
/// ```
pub struct StageTimer {
    name: &'static str,
    start: Instant,
    span: Span,
}

impl StageTimer {
    /// Start timing a phase.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!("registration_stage", stage = name);
        debug!(target: "mesh_registration::timing", stage = name, "Starting stage");
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Start timing a phase that works on `mesh`.
    pub fn with_mesh(name: &'static str, mesh: &Mesh) -> Self {
        let span = tracing::info_span!(
            "registration_stage",
            stage = name,
            vertices = mesh.vertex_count(),
            faces = mesh.face_count()
        );
        debug!(
            target: "mesh_registration::timing",
            stage = name,
            vertices = mesh.vertex_count(),
            faces = mesh.face_count(),
            "Starting stage"
        );
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        info!(
            target: "mesh_registration::timing",
            stage = self.name,
            elapsed_ms = format!("{:.2}", self.elapsed_ms()),
            "Stage completed"
        );
    }
}

/// Log mesh statistics at debug level.
pub fn log_mesh_stats(mesh: &Mesh, context: &str) {
    let (min_bounds, max_bounds) = mesh.bounds().unwrap_or_default();
    let dims = max_bounds - min_bounds;
    let has_normals = mesh.vertices.iter().any(|v| v.normal.is_some());

    debug!(
        target: "mesh_registration::mesh_state",
        context = context,
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        dimensions = format!("{:.4} x {:.4} x {:.4}", dims.x, dims.y, dims.z),
        has_normals,
        "Mesh state"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::EnvFilter;

    /// Formatted log output shared with the subscriber.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_stage_events_reach_subscriber() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("mesh_registration=debug"))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let sphere = Mesh::icosphere(1);
            drop(StageTimer::with_mesh("rigid", &sphere));
            log_mesh_stats(&sphere, "after rigid");
        });

        let text = captured.text();
        assert!(text.contains("mesh_registration::timing"));
        assert!(text.contains("Starting stage"));
        assert!(text.contains("Stage completed"));
        assert!(text.contains("vertices=42"));
        assert!(text.contains("Mesh state"));
    }

    #[test]
    fn test_filter_hides_debug_events() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("mesh_registration=info"))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            drop(StageTimer::new("restore"));
        });

        let text = captured.text();
        assert!(!text.contains("Starting stage"));
        assert!(text.contains("Stage completed"));
    }

    #[test]
    fn test_stage_timer() {
        let timer = StageTimer::new("test_stage");
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10.0);
        assert!(timer.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_log_mesh_stats() {
        // Must not panic on empty or populated meshes.
        log_mesh_stats(&Mesh::new(), "empty");
        let sphere = Mesh::icosphere(1);
        let _timer = StageTimer::with_mesh("sphere", &sphere);
        log_mesh_stats(&sphere, "sphere");
    }
}
