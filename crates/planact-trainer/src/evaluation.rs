//! Held-out evaluation: causal metrics and the plan-act loss breakdown.
//!
//! Every evaluation runs at the maximum sequence length with a fixed batch
//! size and step count derived from the token budget, so numbers stay
//! comparable across the sequence-length schedule.

use ndarray::{s, Array2, Array3};
use planact_core::{
    ActingBreakdown, ActingSpan, EvalConfig, FullEvalRow, FullEvaluationTable, LanguageModel,
    MetricMap, ModelInput, PlanActError, Result, RunConfig, Split, TaskMetrics,
};
use planact_data::{BatchSampler, TaskBatchBuilder};
use rand::Rng;
use serde::Serialize;

use crate::loss::{cross_entropy, LossOutput};

/// Result of the quick evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuickEvaluation {
    /// Causal next-token metrics.
    pub causal: TaskMetrics,
    /// Planning pass at the quick operating point.
    pub planning: TaskMetrics,
    /// Full acting pass at the quick operating point.
    pub acting: TaskMetrics,
}

impl QuickEvaluation {
    /// Insert `val/{loss,acc,pplx}/{causal,planning,acting}`.
    pub fn insert_into(&self, metrics: &mut MetricMap) {
        self.causal.insert_into(metrics, "val", "causal");
        self.planning.insert_into(metrics, "val", "planning");
        self.acting.insert_into(metrics, "val", "acting");
    }
}

/// Running mean of per-step loss and accuracy.
#[derive(Debug, Default, Clone, Copy)]
struct MeanAccumulator {
    loss: f64,
    accuracy: f64,
    steps: usize,
}

impl MeanAccumulator {
    fn add(&mut self, out: LossOutput) {
        self.loss += out.loss;
        self.accuracy += out.accuracy;
        self.steps += 1;
    }

    fn finish(&self) -> TaskMetrics {
        let steps = self.steps as f64;
        TaskMetrics::new(self.loss / steps, self.accuracy / steps)
    }
}

/// Computes evaluation metrics on the eval split.
#[derive(Debug, Clone)]
pub struct EvaluationHarness {
    config: EvalConfig,
    builder: TaskBatchBuilder,
    length: usize,
    batchsize: usize,
    steps: usize,
}

impl EvaluationHarness {
    /// Create a harness for `config` with the run's per-step token budget.
    pub fn new(config: &RunConfig, token_budget: usize) -> Self {
        let length = config.sequence.max_length;
        Self {
            config: config.eval.clone(),
            builder: TaskBatchBuilder::new(config.special_tokens()),
            length,
            batchsize: config.eval.eval_batchsize(token_budget, length),
            steps: config.eval.eval_steps(token_budget, length),
        }
    }

    /// Sequence length of every evaluation window.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Windows per evaluation batch.
    pub fn batchsize(&self) -> usize {
        self.batchsize
    }

    /// Batches per evaluation pass.
    pub fn steps(&self) -> usize {
        self.steps
    }

    fn sample<R: Rng + ?Sized>(&self, sampler: &BatchSampler, rng: &mut R) -> Result<Array2<u32>> {
        sampler.sample(rng, Split::Eval, self.batchsize, self.length)
    }

    /// Causal loss, accuracy and perplexity.
    pub fn causal<M, R>(&self, model: &mut M, sampler: &BatchSampler, rng: &mut R) -> Result<TaskMetrics>
    where
        M: LanguageModel + ?Sized,
        R: Rng + ?Sized,
    {
        let mut acc = MeanAccumulator::default();
        for _ in 0..self.steps {
            let window = self.sample(sampler, rng)?;
            let batch = self.builder.causal(&window);
            let logits = model.forward(&ModelInput::Tokens(batch.inputs), None)?;
            acc.add(cross_entropy(logits.view(), batch.targets.view())?);
        }
        Ok(acc.finish())
    }

    /// Five-way plan-act breakdown at one operating point.
    pub fn plan_act<M, R>(
        &self,
        model: &mut M,
        sampler: &BatchSampler,
        rng: &mut R,
        span: ActingSpan,
        top_k: usize,
    ) -> Result<ActingBreakdown>
    where
        M: LanguageModel + ?Sized,
        R: Rng + ?Sized,
    {
        let (first, last) = (span.first(), span.last());
        let mut planning = MeanAccumulator::default();
        let mut acting = MeanAccumulator::default();
        let mut acting_causal = MeanAccumulator::default();
        let mut acting_acting = MeanAccumulator::default();
        let mut acting_planning = MeanAccumulator::default();

        for _ in 0..self.steps {
            let window = self.sample(sampler, rng)?;
            let batch = self.builder.planning(&window, first)?;
            let planning_logits = model.forward(&ModelInput::Tokens(batch.inputs), None)?;
            planning.add(cross_entropy(planning_logits.view(), batch.targets.view())?);

            let batch = self
                .builder
                .acting(&*model, &window, &planning_logits, span, top_k)?;
            let logits: Array3<f32> =
                model.forward(&ModelInput::Embeddings(batch.inputs), Some(span))?;
            let targets = &batch.targets;
            acting.add(cross_entropy(logits.view(), targets.view())?);
            acting_causal.add(cross_entropy(
                logits.slice(s![.., ..first, ..]),
                targets.slice(s![.., ..first]),
            )?);
            acting_acting.add(cross_entropy(
                logits.slice(s![.., first..last, ..]),
                targets.slice(s![.., first..last]),
            )?);
            acting_planning.add(cross_entropy(
                logits.slice(s![.., last.., ..]),
                targets.slice(s![.., last..]),
            )?);
        }

        Ok(ActingBreakdown {
            planning: planning.finish(),
            acting: acting.finish(),
            acting_causal: acting_causal.finish(),
            acting_acting: acting_acting.finish(),
            acting_planning: acting_planning.finish(),
        })
    }

    /// Causal metrics plus planning and full acting metrics at the quick
    /// operating point.
    pub fn quick<M, R>(&self, model: &mut M, sampler: &BatchSampler, rng: &mut R) -> Result<QuickEvaluation>
    where
        M: LanguageModel + ?Sized,
        R: Rng + ?Sized,
    {
        let point = &self.config.quick;
        let causal = self.causal(model, sampler, rng)?;
        let span = ActingSpan::from_rates(self.length, point.planning_rate, point.acting_rate)?;
        let breakdown = self.plan_act(model, sampler, rng, span, point.top_k)?;
        Ok(QuickEvaluation {
            causal,
            planning: breakdown.planning,
            acting: breakdown.acting,
        })
    }

    /// Sweep acting width, last acting index and top-k.
    ///
    /// Rows are ordered by width, then last index, then top-k, and each grid
    /// point draws its own evaluation windows.
    pub fn full<M, R>(&self, model: &mut M, sampler: &BatchSampler, rng: &mut R) -> Result<FullEvaluationTable>
    where
        M: LanguageModel + ?Sized,
        R: Rng + ?Sized,
    {
        let grid = &self.config.full_grid;
        if grid.last_idx_start <= grid.max_acting_width {
            return Err(PlanActError::config(format!(
                "last acting index range starts at {} but widths reach {}",
                grid.last_idx_start, grid.max_acting_width
            )));
        }
        let last_indices = grid.last_indices(self.length);
        tracing::info!(
            points = grid.num_points(self.length),
            steps_per_point = self.steps,
            "Starting full evaluation"
        );

        let causal = self.causal(model, sampler, rng)?;
        let mut rows = Vec::with_capacity(grid.num_points(self.length));
        for acting_width in 1..=grid.max_acting_width {
            for &last in &last_indices {
                let first = last - acting_width;
                let span = ActingSpan::new(self.length, first, last)?;
                for top_k in 1..=grid.max_top_k {
                    let breakdown = self.plan_act(model, sampler, rng, span, top_k)?;
                    tracing::debug!(
                        first,
                        last,
                        top_k,
                        acting_loss = breakdown.acting.loss,
                        "Full evaluation point"
                    );
                    rows.push(FullEvalRow {
                        acting_width,
                        first_acting_idx: first,
                        last_acting_idx: last,
                        top_k,
                        breakdown,
                    });
                }
            }
        }

        Ok(FullEvaluationTable {
            length: self.length,
            causal,
            rows,
        })
    }
}
