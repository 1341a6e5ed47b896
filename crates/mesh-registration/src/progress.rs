//! Phase progress reporting and coarse cancellation.
//!
//! A run is cancelled between phases, never inside one. Either flip a
//! [`CancelToken`] from another thread or return `false` from a
//! [`ProgressCallback`]:
//!
//! ```ignore
//! use mesh_registration::progress::{CancelToken, ProgressCallback};
//!
//! let token = CancelToken::new();
//! let callback: ProgressCallback = Box::new(|progress| {
//!     println!("{}% {}", progress.percent(), progress.message);
//!     true // Continue (return false to cancel)
//! });
//! let pipeline = RegistrationPipeline::new(params)
//!     .with_cancel_token(token.clone())
//!     .with_progress(callback);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Progress information passed to callbacks after each phase.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Phases completed.
    pub current: u64,
    /// Phases in a run.
    pub total: u64,
    /// Name of the phase just completed.
    pub message: String,
    /// Time since the run started.
    pub elapsed: Duration,
}

impl Progress {
    pub fn new(current: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: message.into(),
            elapsed: Duration::ZERO,
        }
    }

    /// Progress as a fraction (0.0 to 1.0).
    #[inline]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64) / (self.total as f64)
        }
    }

    /// Progress as a percentage (0 to 100).
    #[inline]
    pub fn percent(&self) -> u32 {
        (self.fraction() * 100.0).round() as u32
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }
}

/// Callback for phase progress.
///
/// Returns `true` to continue, `false` to request cancellation.
pub type ProgressCallback = Box<dyn Fn(&Progress) -> bool + Send + Sync>;

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the next phase boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        let progress = Progress::new(1, 4, "rigid_init");
        assert!((progress.fraction() - 0.25).abs() < 1e-12);
        assert_eq!(progress.percent(), 25);
        assert!(!progress.is_complete());
        assert!(Progress::new(4, 4, "done").is_complete());
        assert_eq!(Progress::new(0, 0, "empty").fraction(), 0.0);
    }

    #[test]
    fn test_cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());

        let handle = std::thread::spawn({
            let token = CancelToken::new();
            let seen = token.clone();
            move || {
                token.cancel();
                seen.is_cancelled()
            }
        });
        assert!(handle.join().unwrap());
    }
}
