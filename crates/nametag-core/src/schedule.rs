//! Linear learning-rate decay.

use serde::{Deserialize, Serialize};

/// Fraction of the base rate that the decay bottoms out at by default.
pub const DEFAULT_MIN_LR_RATIO: f64 = 0.01;

/// Linearly decay `base_lr` towards `min_lr` over `total_steps`.
///
/// `compute(b, 0, n, m) == b` and `compute(b, n, n, m) == m`; the result is
/// non-increasing in `step` and never drops below `min_lr`.
pub fn compute(base_lr: f64, step: usize, total_steps: usize, min_lr: f64) -> f64 {
    if total_steps == 0 {
        return base_lr.max(min_lr);
    }
    let progress = step as f64 / total_steps as f64;
    (base_lr - (base_lr - min_lr) * progress).max(min_lr)
}

/// A linear decay schedule bound to one training run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearDecay {
    pub base_lr: f64,
    pub min_lr: f64,
    pub total_steps: usize,
}

impl LinearDecay {
    /// Decay to [`DEFAULT_MIN_LR_RATIO`] of the base rate.
    pub fn new(base_lr: f64, total_steps: usize) -> Self {
        Self {
            base_lr,
            min_lr: DEFAULT_MIN_LR_RATIO * base_lr,
            total_steps,
        }
    }

    #[must_use]
    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        compute(self.base_lr, step, self.total_steps, self.min_lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        assert_eq!(compute(1.0, 0, 100, 0.0), 1.0);
        assert_eq!(compute(1.0, 100, 100, 0.0), 0.0);
    }

    #[test]
    fn test_midpoint() {
        assert!((compute(1.0, 50, 100, 0.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_non_increasing() {
        let mut prev = f64::INFINITY;
        for step in 0..=120 {
            let lr = compute(1e-3, step, 100, 1e-5);
            assert!(lr <= prev);
            assert!(lr >= 1e-5);
            prev = lr;
        }
    }

    #[test]
    fn test_past_total_stays_at_floor() {
        assert_eq!(compute(1.0, 500, 100, 0.1), 0.1);
    }

    #[test]
    fn test_zero_total_steps() {
        assert_eq!(compute(1.0, 0, 0, 0.0), 1.0);
        assert_eq!(compute(0.01, 3, 0, 0.5), 0.5);
    }

    #[test]
    fn test_linear_decay_default_floor() {
        let schedule = LinearDecay::new(1e-3, 1000);
        assert!((schedule.min_lr - 1e-5).abs() < 1e-15);
        assert_eq!(schedule.lr_at(0), 1e-3);
        assert!((schedule.lr_at(1000) - 1e-5).abs() < 1e-15);
        assert_eq!(schedule.with_min_lr(0.0).lr_at(1000), 0.0);
    }
}
