//! AdamW optimizer with parameter group support.
//!
//! Each parameter is updated with the learning rate, weight decay and betas
//! of the group the [`ParameterGroupPlan`] assigned it to. Moment buffers are
//! created lazily on the first step.

use ndarray::{ArrayD, Zip};
use planact_core::{NamedParameter, PlanActError, Result};

use crate::ParameterGroupPlan;

#[derive(Debug, Clone)]
struct MomentState {
    exp_avg: ArrayD<f32>,
    exp_avg_sq: ArrayD<f32>,
}

/// AdamW with decoupled weight decay and per-group hyperparameters.
#[derive(Debug, Clone)]
pub struct GroupedAdamW {
    eps: f64,
    state: Vec<MomentState>,
    steps: usize,
}

impl GroupedAdamW {
    /// Create an optimizer with the given epsilon.
    pub fn new(eps: f64) -> Self {
        Self {
            eps,
            state: Vec::new(),
            steps: 0,
        }
    }

    /// Optimizer steps applied so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Apply one update to every trainable parameter from its accumulated gradient.
    pub fn step(&mut self, params: &mut [NamedParameter], plan: &ParameterGroupPlan) -> Result<()> {
        if params.len() != plan.assignment().len() {
            return Err(PlanActError::ShapeMismatch {
                expected: vec![plan.assignment().len()],
                actual: vec![params.len()],
            });
        }
        if self.state.is_empty() {
            self.state = params
                .iter()
                .map(|p| MomentState {
                    exp_avg: ArrayD::zeros(p.value.raw_dim()),
                    exp_avg_sq: ArrayD::zeros(p.value.raw_dim()),
                })
                .collect();
        }

        self.steps += 1;
        let t = self.steps as i32;
        let eps = self.eps as f32;

        for (index, (param, moments)) in params.iter_mut().zip(&mut self.state).enumerate() {
            if !param.requires_grad {
                continue;
            }
            let group = plan.group_of(index).ok_or_else(|| {
                PlanActError::InvalidArgument(format!("parameter {index} has no group"))
            })?;
            if moments.exp_avg.shape() != param.value.shape() {
                return Err(PlanActError::ShapeMismatch {
                    expected: moments.exp_avg.shape().to_vec(),
                    actual: param.value.shape().to_vec(),
                });
            }

            let (beta1, beta2) = group.betas;
            let lr = group.learning_rate;
            let decay = (1.0 - lr * group.weight_decay) as f32;
            let step_size = (lr / (1.0 - beta1.powi(t))) as f32;
            let bias_correction2_sqrt = (1.0 - beta2.powi(t)).sqrt() as f32;
            let (beta1, beta2) = (beta1 as f32, beta2 as f32);

            Zip::from(&mut param.value)
                .and(&mut moments.exp_avg)
                .and(&mut moments.exp_avg_sq)
                .and(&param.grad)
                .for_each(|p, m, v, &g| {
                    *p *= decay;
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let denom = v.sqrt() / bias_correction2_sqrt + eps;
                    *p -= step_size * *m / denom;
                });
        }
        Ok(())
    }
}
