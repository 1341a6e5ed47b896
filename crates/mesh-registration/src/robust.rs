//! Welsch robust weighting and the annealing schedule for its scale ν.
//!
//! A residual `r` gets weight `w(r) = exp(-r² / 2ν²)` and contributes the
//! loss `ψ(r) = 1 - w(r)` to the data energy. Near zero `ψ(r) ≈ r² / 2ν²`,
//! so the quadratic surrogate of a match is `w(r₀) / 2ν² · r²`. Large ν
//! behaves like plain least squares; small ν ignores anything much farther
//! than ν.

/// Lower bound for any ν, keeps the weight finite on degenerate input.
pub const MIN_NU: f64 = 1e-8;

/// Welsch weight of a residual.
#[inline]
pub fn welsch_weight(residual: f64, nu: f64) -> f64 {
    (-(residual * residual) / (2.0 * nu * nu)).exp()
}

/// Welsch loss of a residual, in `[0, 1)`.
#[inline]
pub fn welsch_loss(residual: f64, nu: f64) -> f64 {
    1.0 - welsch_weight(residual, nu)
}

/// Median of a slice of non-negative values; 0 for an empty slice.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    let mid = sorted.len() / 2;
    let (_, m, _) = sorted.select_nth_unstable_by(mid, f64::total_cmp);
    *m
}

/// How ν starts and shrinks over the non-rigid stage.
///
/// ν starts at `initial_factor × median residual`, is multiplied by `decay`
/// at every level and never drops below `min_factor × mean edge length`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "registration-config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "registration-config", serde(default))]
pub struct NuSchedule {
    pub initial_factor: f64,
    pub decay: f64,
    pub min_factor: f64,
}

impl Default for NuSchedule {
    fn default() -> Self {
        Self {
            initial_factor: 3.0,
            decay: 0.5,
            min_factor: 1.0,
        }
    }
}

impl NuSchedule {
    /// The smallest ν the schedule will produce for a given edge length.
    pub fn floor(&self, mean_edge_length: f64) -> f64 {
        (self.min_factor * mean_edge_length).max(MIN_NU)
    }

    /// Starting ν for a median residual.
    pub fn initial(&self, median_residual: f64, mean_edge_length: f64) -> f64 {
        (self.initial_factor * median_residual).max(self.floor(mean_edge_length))
    }

    /// Next level's ν, or `None` once the floor has been reached.
    pub fn next(&self, nu: f64, mean_edge_length: f64) -> Option<f64> {
        let floor = self.floor(mean_edge_length);
        if nu <= floor * (1.0 + 1e-12) {
            None
        } else {
            Some((nu * self.decay).max(floor))
        }
    }

    /// Check the schedule produces a finite, non-increasing sequence.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.initial_factor.is_finite() && self.initial_factor > 0.0) {
            return Err(format!(
                "initial_factor must be positive, got {}",
                self.initial_factor
            ));
        }
        if !(self.decay > 0.0 && self.decay < 1.0) {
            return Err(format!("decay must be in (0, 1), got {}", self.decay));
        }
        if !(self.min_factor.is_finite() && self.min_factor > 0.0) {
            return Err(format!(
                "min_factor must be positive, got {}",
                self.min_factor
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_shape() {
        assert_eq!(welsch_weight(0.0, 0.1), 1.0);
        assert!(welsch_weight(0.1, 0.1) > welsch_weight(0.2, 0.1));
        assert!(welsch_weight(10.0, 0.1) < 1e-100);
        // Wide kernels treat moderate residuals almost uniformly.
        assert!(welsch_weight(0.1, 100.0) > 0.9999);
    }

    #[test]
    fn test_loss_is_bounded_and_quadratic_near_zero() {
        let nu = 0.5;
        assert!(welsch_loss(1e6, nu) <= 1.0);
        let r = 1e-3;
        assert!((welsch_loss(r, nu) - r * r / (2.0 * nu * nu)).abs() < 1e-10);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), 0.0);
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 3.0);
    }

    #[test]
    fn test_schedule_decreases_to_floor_and_stops() {
        let schedule = NuSchedule::default();
        let edge = 0.01;
        let mut nu = schedule.initial(0.2, edge);
        assert!((nu - 0.6).abs() < 1e-12);

        let mut levels = 1;
        while let Some(next) = schedule.next(nu, edge) {
            assert!(next < nu);
            assert!(next >= schedule.floor(edge));
            nu = next;
            levels += 1;
        }
        assert_eq!(nu, schedule.floor(edge));
        assert!(levels > 3 && levels < 12);
    }

    #[test]
    fn test_initial_never_below_floor() {
        let schedule = NuSchedule::default();
        assert_eq!(schedule.initial(0.0, 0.05), 0.05);
        assert_eq!(schedule.initial(0.0, 0.0), MIN_NU);
        assert!(schedule.next(schedule.initial(0.0, 0.05), 0.05).is_none());
    }

    #[test]
    fn test_validate() {
        assert!(NuSchedule::default().validate().is_ok());
        let bad = NuSchedule {
            decay: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = NuSchedule {
            min_factor: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
