//! Causal, planning and acting task batches.
//!
//! Every builder is a pure function of its inputs: the window is never
//! mutated, and each call returns freshly allocated arrays.

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView3, Axis};
use planact_core::{ActingSpan, LanguageModel, PlanActError, Result, SpecialTokens};
use rand::Rng;
use rand_distr::{Beta, Distribution};

/// Token inputs with their targets.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskBatch {
    /// Shifted window with a task marker at position 0.
    pub inputs: Array2<u32>,
    /// The unmodified window.
    pub targets: Array2<u32>,
}

/// Embedded acting inputs with their targets.
#[derive(Debug, Clone)]
pub struct ActingBatch {
    /// `(batch, length, width)` vectors; positions `[last, L)` are soft tokens.
    pub inputs: Array3<f32>,
    /// The unmodified window.
    pub targets: Array2<u32>,
    /// Span the inputs were built for.
    pub span: ActingSpan,
}

/// Builds task inputs from raw windows.
#[derive(Debug, Clone, Copy)]
pub struct TaskBatchBuilder {
    tokens: SpecialTokens,
}

impl TaskBatchBuilder {
    /// Create a builder for the given special tokens.
    pub fn new(tokens: SpecialTokens) -> Self {
        Self { tokens }
    }

    /// Special tokens in use.
    pub fn special_tokens(&self) -> SpecialTokens {
        self.tokens
    }

    /// Next-token prediction: inputs are the window shifted right by one with
    /// the causal marker in front.
    pub fn causal(&self, window: &Array2<u32>) -> TaskBatch {
        TaskBatch {
            inputs: shift_right(window, self.tokens.causal),
            targets: window.clone(),
        }
    }

    /// Planning: like causal, but every position from `first_acting_idx` on
    /// is masked. Position 0 always keeps the planning marker, so an index
    /// of 0 masks everything after it.
    pub fn planning(&self, window: &Array2<u32>, first_acting_idx: usize) -> Result<TaskBatch> {
        let length = window.ncols();
        if first_acting_idx > length {
            return Err(PlanActError::InvalidArgument(format!(
                "first acting index {first_acting_idx} outside [0, {length}]"
            )));
        }
        let mut inputs = shift_right(window, self.tokens.planning);
        inputs.slice_mut(s![.., first_acting_idx..]).fill(self.tokens.mask);
        inputs.column_mut(0).fill(self.tokens.planning);
        Ok(TaskBatch {
            inputs,
            targets: window.clone(),
        })
    }

    /// Acting: positions `[first, last)` carry the acting marker, the tail
    /// `[last, L)` is replaced by a top-k blend of the planner's predictions.
    ///
    /// `planning_logits` are the logits of the planning pass over the same
    /// window. The result is embedded through `model` and carries no gradient.
    pub fn acting<M: LanguageModel + ?Sized>(
        &self,
        model: &M,
        window: &Array2<u32>,
        planning_logits: &Array3<f32>,
        span: ActingSpan,
        top_k: usize,
    ) -> Result<ActingBatch> {
        let (batch, length) = window.dim();
        if span.length() != length {
            return Err(PlanActError::InvalidArgument(format!(
                "span computed for length {} applied to windows of length {length}",
                span.length()
            )));
        }
        let (logit_batch, logit_length, _) = planning_logits.dim();
        if (logit_batch, logit_length) != (batch, length) {
            return Err(PlanActError::ShapeMismatch {
                expected: vec![batch, length],
                actual: vec![logit_batch, logit_length],
            });
        }

        let mut tokens = shift_right(window, self.tokens.acting);
        tokens
            .slice_mut(s![.., span.first()..span.last()])
            .fill(self.tokens.acting);
        let mut inputs = model.embed(&tokens)?;

        if span.last() < length {
            let tail = planning_logits.slice(s![.., span.last().., ..]);
            let soft = recombine_top_k(model, tail, top_k)?;
            inputs.slice_mut(s![.., span.last().., ..]).assign(&soft);
        }

        Ok(ActingBatch {
            inputs,
            targets: window.clone(),
            span,
        })
    }
}

/// Shift each row right by one and put `marker` at position 0.
fn shift_right(window: &Array2<u32>, marker: u32) -> Array2<u32> {
    let length = window.ncols();
    let mut inputs = Array2::from_elem(window.raw_dim(), marker);
    if length > 1 {
        inputs
            .slice_mut(s![.., 1..])
            .assign(&window.slice(s![.., ..length - 1]));
    }
    inputs
}

/// Top `k` entries of a logit row as `(token, weight)`, largest first.
///
/// Weights are the raw logit values divided by their sum, not a softmax.
/// With `k = 1` the single weight is exactly 1. Negative logits can yield
/// negative or unbounded weights; the formula is kept as is.
pub fn top_k_weights(logits: ArrayView1<'_, f32>, k: usize) -> Vec<(u32, f32)> {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    let k = k.min(order.len());
    if k == 0 {
        return Vec::new();
    }
    order.select_nth_unstable_by(k - 1, |&a, &b| logits[b].total_cmp(&logits[a]));
    order.truncate(k);
    order.sort_unstable_by(|&a, &b| logits[b].total_cmp(&logits[a]));

    let total: f32 = order.iter().map(|&i| logits[i]).sum();
    order
        .into_iter()
        .map(|i| (i as u32, logits[i] / total))
        .collect()
}

/// Blend the embeddings of each position's top-`k` predictions.
///
/// `logits` has shape `(batch, positions, vocab)`; the result has shape
/// `(batch, positions, width)`.
pub fn recombine_top_k<M: LanguageModel + ?Sized>(
    model: &M,
    logits: ArrayView3<'_, f32>,
    top_k: usize,
) -> Result<Array3<f32>> {
    let (batch, positions, vocab) = logits.dim();
    if top_k == 0 || top_k > vocab {
        return Err(PlanActError::InvalidArgument(format!(
            "top_k must lie in [1, {vocab}], got {top_k}"
        )));
    }

    let rows = batch * positions;
    let mut ids = Array2::<u32>::zeros((rows, top_k));
    let mut weights = Array2::<f32>::zeros((rows, top_k));
    let flat = logits
        .to_shape((rows, vocab))
        .map_err(|e| PlanActError::InvalidArgument(e.to_string()))?;
    for (row, lane) in flat.rows().into_iter().enumerate() {
        for (slot, (id, weight)) in top_k_weights(lane, top_k).into_iter().enumerate() {
            ids[[row, slot]] = id;
            weights[[row, slot]] = weight;
        }
    }

    let embedded = model.embed(&ids)?;
    let width = embedded.len_of(Axis(2));
    let mut blended = Array2::<f32>::zeros((rows, width));
    for (row, mut out) in blended.rows_mut().into_iter().enumerate() {
        for slot in 0..top_k {
            out.scaled_add(weights[[row, slot]], &embedded.slice(s![row, slot, ..]));
        }
    }

    blended
        .into_shape((batch, positions, width))
        .map_err(|e| PlanActError::InvalidArgument(e.to_string()))
}

/// Draw a masking rate from `Beta(mean * c, (1 - mean) * c)`.
pub fn randomize_masking_rate<R: Rng + ?Sized>(
    rng: &mut R,
    mean: f64,
    concentration: f64,
) -> Result<f64> {
    let beta = Beta::new(mean * concentration, (1.0 - mean) * concentration)
        .map_err(|e| PlanActError::config(format!("masking rate distribution: {e}")))?;
    Ok(beta.sample(rng))
}
