//! Adaptive gradient accumulation.
//!
//! The scheduler tracks a fractional number of microbatches per optimizer
//! step. Every `sample_every` steps it compares the measured gradient norm
//! with an analytic target trajectory and rescales the fractional count; at
//! every step boundary it dithers that count into an integer.

use planact_core::scaling;
use planact_core::MicrobatchConfig;
use rand::Rng;
use serde::Serialize;

/// Floor of the fractional microbatch count.
pub const MIN_FRACTIONAL_STEPS: f64 = 0.1;

/// Outcome of one gradient-norm measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GradNormSample {
    /// Optimizer step of the measurement.
    pub step: usize,
    /// Gradient norm divided by `sqrt(num_params)`.
    pub normalized: f64,
    /// Target trajectory at `step`.
    pub target: f64,
    /// `normalized / target`.
    pub ratio: f64,
    /// Fractional microbatch count after the update.
    pub fractional_steps: f64,
}

/// Maintains and dithers the microbatch count.
#[derive(Debug, Clone)]
pub struct MicrobatchScheduler {
    sample_every: usize,
    scale_lr: f64,
    sqrt_params: f64,
    steps_scale: f64,
    decay_exponent: f64,
    fractional_steps: f64,
    discrete_steps: usize,
}

impl MicrobatchScheduler {
    /// Create a scheduler for a model with `num_params` parameters.
    pub fn new(config: &MicrobatchConfig, num_params: usize) -> Self {
        Self {
            sample_every: config.sample_every.max(1),
            scale_lr: config.scale_lr,
            sqrt_params: (num_params.max(1) as f64).sqrt(),
            steps_scale: scaling::grad_norm_steps_scale(num_params),
            decay_exponent: scaling::expected_grad_norm_exponent(num_params),
            fractional_steps: MIN_FRACTIONAL_STEPS,
            discrete_steps: 1,
        }
    }

    /// Start from a different fractional count.
    pub fn with_fractional_steps(mut self, steps: f64) -> Self {
        self.fractional_steps = steps.max(MIN_FRACTIONAL_STEPS);
        self
    }

    /// Current fractional count.
    pub fn fractional_steps(&self) -> f64 {
        self.fractional_steps
    }

    /// Microbatches to accumulate before the next optimizer step.
    pub fn discrete_steps(&self) -> usize {
        self.discrete_steps
    }

    /// Whether the gradient norm is measured at `step`.
    pub fn should_sample(&self, step: usize) -> bool {
        step % self.sample_every == 0
    }

    /// Target normalized gradient norm: `(scale * (step + 0.01))^exponent`.
    pub fn target_grad_norm(&self, step: usize) -> f64 {
        (self.steps_scale * (step as f64 + 0.01)).powf(self.decay_exponent)
    }

    /// Rescale the fractional count from a measured global gradient norm.
    pub fn observe(&mut self, step: usize, grad_norm: f64) -> GradNormSample {
        let normalized = grad_norm / self.sqrt_params;
        let target = self.target_grad_norm(step);
        let ratio = normalized / target;
        let gain = self.sample_every as f64 * self.scale_lr;
        self.fractional_steps =
            (self.fractional_steps * (1.0 + gain * (ratio - 1.0))).max(MIN_FRACTIONAL_STEPS);
        GradNormSample {
            step,
            normalized,
            target,
            ratio,
            fractional_steps: self.fractional_steps,
        }
    }

    /// Round the fractional count to an integer with a Bernoulli draw on its
    /// remainder. Never returns less than 1.
    pub fn dither<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        let base = self.fractional_steps.floor();
        let remainder = self.fractional_steps - base;
        let coin = usize::from(rng.gen::<f64>() < remainder);
        self.discrete_steps = (base as usize + coin).max(1);
        self.discrete_steps
    }
}
