//! Common type definitions.

use std::collections::BTreeMap;

use ndarray::{Array2, Array3, ArrayD};
use serde::{Deserialize, Serialize};

use crate::{PlanActError, Result, StopConfig};

/// Flat mapping of metric name to scalar value, emitted once per evaluation event.
pub type MetricMap = BTreeMap<String, f64>;

/// Vocabulary size of the GPT-2 tokenizer, padded to a multiple of 64.
pub const DEFAULT_VOCAB_SIZE: u32 = 50304;

/// Corpus split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training tokens.
    Train,
    /// Held-out evaluation tokens.
    Eval,
}

/// The four reserved token ids that sit just past the natural vocabulary.
///
/// They never occur in natural text. Position 0 of every task input carries one
/// of the three task markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    /// Marker for the causal task.
    pub causal: u32,
    /// Marker for the planning task.
    pub planning: u32,
    /// Marker for the acting task.
    pub acting: u32,
    /// Mask token for hidden positions.
    pub mask: u32,
}

impl SpecialTokens {
    /// Reserve the four ids directly after a vocabulary of `vocab_size` tokens.
    pub fn after_vocab(vocab_size: u32) -> Self {
        Self {
            causal: vocab_size,
            planning: vocab_size + 1,
            acting: vocab_size + 2,
            mask: vocab_size + 3,
        }
    }

    /// Size of the embedding table needed to hold natural and special tokens.
    pub fn total_vocab_size(&self) -> usize {
        [self.causal, self.planning, self.acting, self.mask]
            .into_iter()
            .max()
            .map_or(0, |id| id as usize + 1)
    }

    /// Whether `id` is one of the reserved tokens.
    pub fn is_special(&self, id: u32) -> bool {
        id == self.causal || id == self.planning || id == self.acting || id == self.mask
    }
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self::after_vocab(DEFAULT_VOCAB_SIZE)
    }
}

/// Index range of the acting span inside a sequence of `length` tokens.
///
/// `first` is where the planner's mask starts, `last` is one past the final
/// acted position. Always `first < last <= length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActingSpan {
    length: usize,
    first: usize,
    last: usize,
}

impl ActingSpan {
    /// Build a span from explicit indices.
    pub fn new(length: usize, first: usize, last: usize) -> Result<Self> {
        if first >= last || last > length {
            return Err(PlanActError::InvalidArgument(format!(
                "acting span [{first}, {last}) is not a non-empty range inside a sequence of {length}"
            )));
        }
        Ok(Self { length, first, last })
    }

    /// Compute the span from masking rates.
    ///
    /// `planning_width = max(2, floor(planning_rate * L))`,
    /// `acting_width = max(1, floor(acting_rate * L))`, and the span is
    /// `[L - planning_width, L - planning_width + acting_width)`. Callers keep
    /// `acting_rate < planning_rate - 1.1 / L`, see [`ActingSpan::clamp_acting_rate`].
    pub fn from_rates(length: usize, planning_rate: f64, acting_rate: f64) -> Result<Self> {
        let planning_width = ((planning_rate * length as f64).floor() as usize).max(2);
        let acting_width = ((acting_rate * length as f64).floor() as usize).max(1);
        if planning_width > length {
            return Err(PlanActError::InvalidArgument(format!(
                "planning width {planning_width} exceeds sequence length {length}"
            )));
        }
        let first = length - planning_width;
        Self::new(length, first, first + acting_width)
    }

    /// Keep the acting rate at least 1.1 tokens below the planning rate.
    pub fn clamp_acting_rate(length: usize, planning_rate: f64, acting_rate: f64) -> f64 {
        acting_rate.min(planning_rate - 1.1 / length as f64)
    }

    /// Sequence length the span was computed for.
    pub fn length(&self) -> usize {
        self.length
    }

    /// First masked (acted) position.
    pub fn first(&self) -> usize {
        self.first
    }

    /// One past the last acted position.
    pub fn last(&self) -> usize {
        self.last
    }

    /// Number of positions hidden from the planner.
    pub fn planning_width(&self) -> usize {
        self.length - self.first
    }

    /// Number of positions the actor fills in.
    pub fn acting_width(&self) -> usize {
        self.last - self.first
    }
}

/// Input to a model forward pass.
#[derive(Debug, Clone)]
pub enum ModelInput {
    /// Token ids, shape `(batch, length)`; embedded inside the model.
    Tokens(Array2<u32>),
    /// Pre-embedded vectors, shape `(batch, length, width)`; treated as constants.
    Embeddings(Array3<f32>),
}

impl ModelInput {
    /// `(batch, length)` of the input.
    pub fn batch_and_length(&self) -> (usize, usize) {
        match self {
            Self::Tokens(tokens) => tokens.dim(),
            Self::Embeddings(vectors) => {
                let (batch, length, _) = vectors.dim();
                (batch, length)
            }
        }
    }
}

/// A named trainable tensor together with its accumulated gradient.
#[derive(Debug, Clone)]
pub struct NamedParameter {
    /// Dotted parameter name, e.g. `blocks.0.expand`.
    pub name: String,
    /// Current value.
    pub value: ArrayD<f32>,
    /// Accumulated gradient, same shape as `value`.
    pub grad: ArrayD<f32>,
    /// Whether the optimizer updates this parameter.
    pub requires_grad: bool,
}

impl NamedParameter {
    /// Create a trainable parameter with a zeroed gradient.
    pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
        let grad = ArrayD::zeros(value.raw_dim());
        Self {
            name: name.into(),
            value,
            grad,
            requires_grad: true,
        }
    }

    /// Number of scalar elements.
    pub fn numel(&self) -> usize {
        self.value.len()
    }

    /// Reset the accumulated gradient.
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Squared L2 norm of the accumulated gradient.
    pub fn grad_sq_norm(&self) -> f64 {
        self.grad.iter().map(|&g| f64::from(g) * f64::from(g)).sum()
    }
}

/// Loss, accuracy and perplexity for one task or sub-span.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Mean cross-entropy.
    pub loss: f64,
    /// Fraction of positions whose arg-max equals the target.
    pub accuracy: f64,
    /// `exp(loss)`.
    pub perplexity: f64,
}

impl TaskMetrics {
    /// Build metrics from a loss and accuracy; perplexity is derived.
    pub fn new(loss: f64, accuracy: f64) -> Self {
        Self {
            loss,
            accuracy,
            perplexity: loss.exp(),
        }
    }

    /// Insert `loss/<suffix>`, `acc/<suffix>` and `pplx/<suffix>` under `prefix`.
    pub fn insert_into(&self, metrics: &mut MetricMap, prefix: &str, suffix: &str) {
        metrics.insert(format!("{prefix}/loss/{suffix}"), self.loss);
        metrics.insert(format!("{prefix}/acc/{suffix}"), self.accuracy);
        metrics.insert(format!("{prefix}/pplx/{suffix}"), self.perplexity);
    }
}

/// The five-way plan-act loss breakdown at one operating point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActingBreakdown {
    /// Planning pass over the whole window.
    pub planning: TaskMetrics,
    /// Acting pass over the whole window.
    pub acting: TaskMetrics,
    /// Acting pass restricted to `[0, first)`.
    pub acting_causal: TaskMetrics,
    /// Acting pass restricted to `[first, last)`.
    pub acting_acting: TaskMetrics,
    /// Acting pass restricted to `[last, L)`.
    pub acting_planning: TaskMetrics,
}

/// One grid point of the full evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FullEvalRow {
    /// Width of the acting span.
    pub acting_width: usize,
    /// First acted position.
    pub first_acting_idx: usize,
    /// One past the last acted position.
    pub last_acting_idx: usize,
    /// Planner predictions blended per soft input.
    pub top_k: usize,
    /// Loss breakdown at this point.
    pub breakdown: ActingBreakdown,
}

/// Result of the full evaluation: one causal setting plus the plan-act grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullEvaluationTable {
    /// Sequence length evaluated at.
    pub length: usize,
    /// Causal loss over the same held-out windows.
    pub causal: TaskMetrics,
    /// Grid rows ordered by acting width, then last index, then top-k.
    pub rows: Vec<FullEvalRow>,
}

/// One summary line per finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummaryRow {
    /// Run name.
    pub run_name: String,
    /// Seed of the run.
    pub seed: u64,
    /// Trainable parameter count.
    pub num_params: usize,
    /// Whether the plan-act curriculum was used.
    pub plan_act: bool,
    /// Planning loss divider.
    pub planning_divider: f64,
    /// Acting loss divider.
    pub acting_divider: f64,
    /// Top-k used in training.
    pub top_k: usize,
    /// Optimizer steps taken.
    pub steps: usize,
    /// Training tokens consumed.
    pub tokens_seen: usize,
    /// Epoch fraction reached.
    pub epoch: f64,
    /// Training seconds, evaluation excluded.
    pub train_seconds: f64,
    /// Final quick-evaluation causal metrics.
    pub causal: TaskMetrics,
    /// Final quick-evaluation planning loss.
    pub planning_loss: f64,
    /// Final quick-evaluation acting loss.
    pub acting_loss: f64,
    /// Stop limits the run was configured with.
    pub limits: StopConfig,
    /// Values at every evaluation event, in order.
    pub history: RunTrajectory,
    /// Full evaluation CSV of the run, if one was written.
    pub full_evaluation_file: Option<String>,
}

impl RunSummaryRow {
    /// Record where the full evaluation of this run was written.
    pub fn with_full_evaluation_file(mut self, path: impl Into<String>) -> Self {
        self.full_evaluation_file = Some(path.into());
        self
    }
}

/// Per-evaluation trajectories of a run. Every list has one entry per
/// evaluation event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTrajectory {
    /// Last training microbatch before each evaluation.
    pub train: Vec<TaskMetrics>,
    /// Quick-evaluation causal metrics.
    pub val_causal: Vec<TaskMetrics>,
    /// Quick-evaluation planning metrics.
    pub val_planning: Vec<TaskMetrics>,
    /// Quick-evaluation acting metrics.
    pub val_acting: Vec<TaskMetrics>,
    /// Global gradient norm at the last optimizer step.
    pub grad_norm: Vec<f64>,
    /// Training seconds, evaluation excluded.
    pub cumulative_time: Vec<f64>,
    /// Training tokens consumed.
    pub tokens_seen: Vec<usize>,
    /// Epoch fraction.
    pub epoch: Vec<f64>,
    /// Batch size in use.
    pub batch_size: Vec<usize>,
    /// Sequence length in use.
    pub seq_length: Vec<usize>,
    /// Learning rate of the default group.
    pub learning_rate: Vec<f64>,
    /// Weight decay of the default group.
    pub weight_decay: Vec<f64>,
}

impl RunTrajectory {
    /// Number of evaluation events recorded.
    pub fn len(&self) -> usize {
        self.tokens_seen.len()
    }

    /// Whether no evaluation has been recorded.
    pub fn is_empty(&self) -> bool {
        self.tokens_seen.is_empty()
    }
}
