//! Collaborator traits.

use ndarray::{Array2, Array3};

use crate::{
    ActingSpan, FullEvaluationTable, MetricMap, ModelInput, NamedParameter, Result, RunSummaryRow,
};

/// A trainable causal language model.
///
/// The controller never looks inside the network. It embeds tokens, runs
/// forward passes, hands back the gradient of the loss with respect to the
/// logits, and reads or updates the named parameters.
pub trait LanguageModel {
    /// Embed token ids into vectors of shape `(batch, length, width)`.
    fn embed(&self, tokens: &Array2<u32>) -> Result<Array3<f32>>;

    /// Run a forward pass and return logits of shape `(batch, length, vocab)`.
    ///
    /// `span` is set on acting passes so that the model can adjust how the
    /// acted positions attend.
    fn forward(&mut self, input: &ModelInput, span: Option<ActingSpan>) -> Result<Array3<f32>>;

    /// Accumulate parameter gradients for the most recent forward pass given
    /// the gradient of the loss with respect to its logits.
    ///
    /// Embedding inputs are constants: no gradient flows back into them.
    fn backward(&mut self, grad_logits: &Array3<f32>) -> Result<()>;

    /// Named parameters in registration order.
    fn parameters(&self) -> &[NamedParameter];

    /// Mutable access for the optimizer.
    fn parameters_mut(&mut self) -> &mut [NamedParameter];

    /// Width of the logits, special tokens included.
    fn vocab_size(&self) -> usize;

    /// Total number of trainable scalars.
    fn num_trainable_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .filter(|p| p.requires_grad)
            .map(NamedParameter::numel)
            .sum()
    }

    /// Reset every accumulated gradient.
    fn zero_grad(&mut self) {
        for param in self.parameters_mut() {
            param.zero_grad();
        }
    }

    /// Global L2 norm of the accumulated gradients.
    fn grad_norm(&self) -> f64 {
        self.parameters()
            .iter()
            .filter(|p| p.requires_grad)
            .map(NamedParameter::grad_sq_norm)
            .sum::<f64>()
            .sqrt()
    }
}

/// Receives a flat metric map once per evaluation event.
///
/// Sinks observe training; they never influence it.
pub trait TelemetrySink {
    /// Called once before the first step.
    fn on_run_start(&mut self, _run_name: &str) {}

    /// Called at every evaluation event.
    fn emit(&mut self, step: usize, metrics: &MetricMap);

    /// Called once after the final evaluation.
    fn on_run_end(&mut self) {}
}

/// Persists the full-evaluation table and per-run summaries.
pub trait ResultWriter {
    /// Store the full evaluation of one run.
    fn write_full_evaluation(&mut self, run_name: &str, table: &FullEvaluationTable) -> Result<()>;

    /// Append one run summary.
    fn write_run_summary(&mut self, row: &RunSummaryRow) -> Result<()>;
}
