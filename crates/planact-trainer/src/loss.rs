//! Cross-entropy, accuracy and the gradient handed back to the model.

use ndarray::{Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use planact_core::{PlanActError, Result};

/// Mean cross-entropy and arg-max accuracy over every position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossOutput {
    /// Mean negative log-likelihood.
    pub loss: f64,
    /// Fraction of positions whose arg-max equals the target.
    pub accuracy: f64,
}

/// Loss and accuracy of `logits` `(batch, length, vocab)` against `targets`
/// `(batch, length)`. An empty selection yields NaN for both.
pub fn cross_entropy(
    logits: ArrayView3<'_, f32>,
    targets: ArrayView2<'_, u32>,
) -> Result<LossOutput> {
    check_shapes(logits, targets)?;
    let mut total_loss = 0.0;
    let mut correct = 0usize;
    let mut count = 0usize;
    for (lane, &target) in logits.lanes(Axis(2)).into_iter().zip(targets.iter()) {
        let row = RowStats::compute(lane, target)?;
        total_loss += row.loss;
        correct += usize::from(row.correct);
        count += 1;
    }
    Ok(LossOutput {
        loss: total_loss / count as f64,
        accuracy: correct as f64 / count as f64,
    })
}

/// Loss plus the gradient of `grad_scale * loss` with respect to `logits`.
pub fn cross_entropy_with_grad(
    logits: &Array3<f32>,
    targets: ArrayView2<'_, u32>,
    grad_scale: f64,
) -> Result<(LossOutput, Array3<f32>)> {
    check_shapes(logits.view(), targets)?;
    let count = targets.len();
    if count == 0 {
        return Err(PlanActError::InvalidArgument(
            "cannot take the gradient of an empty batch".to_string(),
        ));
    }
    let per_position = grad_scale / count as f64;

    let mut grad = Array3::<f32>::zeros(logits.raw_dim());
    let mut total_loss = 0.0;
    let mut correct = 0usize;
    for ((lane, mut grad_lane), &target) in logits
        .lanes(Axis(2))
        .into_iter()
        .zip(grad.lanes_mut(Axis(2)))
        .zip(targets.iter())
    {
        let row = RowStats::compute(lane, target)?;
        total_loss += row.loss;
        correct += usize::from(row.correct);
        for (g, &l) in grad_lane.iter_mut().zip(lane.iter()) {
            *g = ((f64::from(l) - row.log_sum_exp).exp() * per_position) as f32;
        }
        grad_lane[target as usize] -= per_position as f32;
    }

    Ok((
        LossOutput {
            loss: total_loss / count as f64,
            accuracy: correct as f64 / count as f64,
        },
        grad,
    ))
}

fn check_shapes(logits: ArrayView3<'_, f32>, targets: ArrayView2<'_, u32>) -> Result<()> {
    let (batch, length, _) = logits.dim();
    if (batch, length) != targets.dim() {
        return Err(PlanActError::ShapeMismatch {
            expected: vec![batch, length],
            actual: targets.shape().to_vec(),
        });
    }
    Ok(())
}

struct RowStats {
    loss: f64,
    log_sum_exp: f64,
    correct: bool,
}

impl RowStats {
    fn compute(lane: ArrayView1<'_, f32>, target: u32) -> Result<Self> {
        let target = target as usize;
        if target >= lane.len() {
            return Err(PlanActError::InvalidArgument(format!(
                "target {target} outside {} logits",
                lane.len()
            )));
        }
        let mut argmax = 0;
        let mut max = f32::NEG_INFINITY;
        for (i, &l) in lane.iter().enumerate() {
            if l > max {
                max = l;
                argmax = i;
            }
        }
        let max = f64::from(max);
        let sum: f64 = lane.iter().map(|&l| (f64::from(l) - max).exp()).sum();
        let log_sum_exp = max + sum.ln();
        Ok(Self {
            loss: log_sum_exp - f64::from(lane[target]),
            log_sum_exp,
            correct: argmax == target,
        })
    }
}
