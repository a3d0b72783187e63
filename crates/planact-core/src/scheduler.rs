//! Learning rate schedule functions.
//!
//! Each parameter group owns one [`LrSchedule`]. The schedule yields a
//! multiplier on the group's base learning rate as a function of the
//! optimizer step, so `lr(step) = base_lr * schedule.multiplier(step)`.

use serde::{Deserialize, Serialize};

/// Multiplicative learning-rate schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    /// Linear ramp from `min_initial_mult` to 1 over `peak_step` steps, then
    /// `(step - peak_step + 1)^exponent` afterwards.
    WarmupPowerLaw {
        /// Multiplier at step 0.
        min_initial_mult: f64,
        /// Step at which the multiplier reaches 1.
        peak_step: usize,
        /// Decay exponent (negative).
        exponent: f64,
    },
    /// `decay^step`.
    Exponential {
        /// Per-step decay factor.
        decay: f64,
    },
    /// Multiplier of 1 at every step.
    Constant,
}

impl LrSchedule {
    /// Warmup then power-law decay.
    pub fn warmup_power_law(min_initial_mult: f64, peak_step: usize, exponent: f64) -> Self {
        Self::WarmupPowerLaw {
            min_initial_mult,
            peak_step,
            exponent,
        }
    }

    /// Pure exponential decay.
    pub fn exponential(decay: f64) -> Self {
        Self::Exponential { decay }
    }

    /// Multiplier for `step`.
    #[must_use]
    pub fn multiplier(&self, step: usize) -> f64 {
        match *self {
            Self::WarmupPowerLaw {
                min_initial_mult,
                peak_step,
                exponent,
            } => {
                if step < peak_step {
                    min_initial_mult + step as f64 / peak_step as f64 * (1.0 - min_initial_mult)
                } else {
                    ((step - peak_step + 1) as f64).powf(exponent)
                }
            }
            Self::Exponential { decay } => decay.powi(step.min(i32::MAX as usize) as i32),
            Self::Constant => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_ramps_linearly_to_peak() {
        let schedule = LrSchedule::warmup_power_law(0.02, 100, -0.08);
        assert!((schedule.multiplier(0) - 0.02).abs() < 1e-12);
        assert!((schedule.multiplier(50) - 0.51).abs() < 1e-12);
        assert!((schedule.multiplier(100) - 1.0).abs() < 1e-12);
        assert!(schedule.multiplier(200) < 1.0);
        assert!((schedule.multiplier(200) - 101f64.powf(-0.08)).abs() < 1e-12);
    }

    #[test]
    fn test_no_warmup_starts_at_one() {
        let schedule = LrSchedule::warmup_power_law(1.0, 0, -0.2);
        assert_eq!(schedule.multiplier(0), 1.0);
        assert!((schedule.multiplier(9) - 10f64.powf(-0.2)).abs() < 1e-12);
    }

    #[test]
    fn test_exponential_decay() {
        let schedule = LrSchedule::exponential(0.995);
        assert_eq!(schedule.multiplier(0), 1.0);
        assert!((schedule.multiplier(10) - 0.995f64.powi(10)).abs() < 1e-12);
        assert!(schedule.multiplier(11) < schedule.multiplier(10));
    }

    #[test]
    fn test_schedule_serde_roundtrip() {
        let schedule = LrSchedule::exponential(0.9);
        let yaml = serde_yaml::to_string(&schedule).unwrap();
        assert!(yaml.contains("exponential"));
        let back: LrSchedule = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, schedule);
    }
}
