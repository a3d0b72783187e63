//! Scaling equations that derive hyperparameters from model size.
//!
//! Every function here is pure in the total trainable parameter count `P`.

/// Parameter count of the reference configuration that
/// [`tokens_per_batch_capacity`] is calibrated against.
pub const REFERENCE_PARAM_COUNT: f64 = 46_009_736.0;

/// Tokens that fit on the reference accelerator at the reference model size.
pub const DEFAULT_GPU_TOKEN_CAPACITY: usize = 114_688;

/// Base learning rate before group multipliers: `9e7 / ln(P)^8.8`.
pub fn base_learning_rate(num_params: usize) -> f64 {
    9e7 / ln_params(num_params).powf(8.8)
}

/// Base of the loss-dependent weight decay: `0.007 * (0.01 ln P)^-4`.
pub fn weight_decay_base(num_params: usize) -> f64 {
    0.007 * (0.01 * ln_params(num_params)).powf(-4.0)
}

/// Weight decay of the default group at live loss `loss`.
pub fn dynamic_weight_decay(base_weight_decay: f64, decay_base: f64, loss: f64) -> f64 {
    base_weight_decay / decay_base.powf(loss + 1e-8)
}

/// Exponent of the target gradient-norm trajectory: `-0.677 * ln(P)^-0.2`.
pub fn expected_grad_norm_exponent(num_params: usize) -> f64 {
    -0.677 * ln_params(num_params).powf(-0.2)
}

/// Step scale of the target gradient-norm trajectory: `ln(P) * P`.
pub fn grad_norm_steps_scale(num_params: usize) -> f64 {
    ln_params(num_params) * num_params as f64
}

/// Model size relative to the reference configuration.
pub fn model_scale(num_params: usize) -> f64 {
    num_params as f64 / REFERENCE_PARAM_COUNT
}

/// Tokens per batch that fit in memory for a model of `model_scale`.
pub fn tokens_per_batch_capacity(gpu_token_capacity: f64, model_scale: f64) -> usize {
    (gpu_token_capacity / (1.52174 + 0.482 * model_scale.powf(0.87))).floor() as usize
}

fn ln_params(num_params: usize) -> f64 {
    (num_params.max(2) as f64).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_learning_rate_shrinks_with_size() {
        let small = base_learning_rate(1_000_000);
        let large = base_learning_rate(100_000_000);
        assert!(small > large);
        let expected = 9e7 / (1_000_000f64).ln().powf(8.8);
        assert!((small - expected).abs() / expected < 1e-12);
    }

    #[test]
    fn test_dynamic_weight_decay_grows_as_loss_falls() {
        let base = weight_decay_base(REFERENCE_PARAM_COUNT as usize);
        assert!(base > 1.0);
        let high_loss = dynamic_weight_decay(16.0, base, 6.0);
        let low_loss = dynamic_weight_decay(16.0, base, 1.0);
        assert!(low_loss > high_loss);
        assert!(dynamic_weight_decay(16.0, base, 0.0) <= 16.0);
    }

    #[test]
    fn test_reference_capacity() {
        let capacity =
            tokens_per_batch_capacity(DEFAULT_GPU_TOKEN_CAPACITY as f64, model_scale(46_009_736));
        assert_eq!(capacity, (114_688.0_f64 / (1.52174 + 0.482)).floor() as usize);
    }

    #[test]
    fn test_grad_norm_exponent_is_negative() {
        assert!(expected_grad_norm_exponent(10_000) < 0.0);
        assert!(grad_norm_steps_scale(10_000) > 10_000.0);
    }
}
