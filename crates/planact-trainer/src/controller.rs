//! The training controller.
//!
//! [`TrainingController`] owns the model, the schedulers and the schedule
//! state of one run. Each call to [`TrainingController::step`] processes one
//! microbatch:
//!
//! 1. sample a window batch at the current length and batch size
//! 2. run the causal pass, or the planning and acting passes, and backward
//!    with the loss scaled by `1 / discrete_microbatch_steps`
//! 3. at a microbatch boundary: measure the gradient norm, apply the
//!    optimizer, update weight decay and learning rates, grow the sequence
//!    length, re-estimate and dither the microbatch count, zero gradients
//! 4. check the stop conditions
//! 5. run the quick evaluation every `eval_every` steps and once more when
//!    the run stops

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use ndarray::Array2;
use planact_core::{
    ActingSpan, FullEvaluationTable, LanguageModel, MetricMap, ModelInput, PlanActError, Result,
    RunConfig, RunSummaryRow, RunTrajectory, Split, StopConfig, TaskMetrics, TelemetrySink,
};
use planact_data::{randomize_masking_rate, BatchSampler, Corpus, TaskBatchBuilder};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::evaluation::{EvaluationHarness, QuickEvaluation};
use crate::loss::cross_entropy_with_grad;
use crate::microbatch::{GradNormSample, MicrobatchScheduler};
use crate::sequence_length::{GrowthEvent, SequenceLengthScheduler};
use crate::{GroupedAdamW, ParameterGroupPlan};

/// Mutable schedule state of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleState {
    /// Optimizer steps taken.
    pub step: usize,
    /// Microbatches accumulated since the last optimizer step.
    pub microbatch_counter: usize,
    /// Window length of the next microbatch.
    pub current_sequence_length: usize,
    /// Windows per microbatch.
    pub current_batchsize: usize,
    /// Fractional microbatch estimate, at least 0.1.
    pub fractional_microbatch_steps: f64,
    /// Microbatches per optimizer step, resampled at every boundary.
    pub discrete_microbatch_steps: usize,
    /// Training tokens consumed.
    pub tokens_seen: usize,
    /// `tokens_seen` over the size of the training split.
    pub epoch_fraction: f64,
    /// Training wall-clock seconds, evaluation excluded.
    pub elapsed_seconds: f64,
}

/// Which limit ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `step >= max_steps`.
    MaxSteps,
    /// `epoch >= max_epochs`.
    MaxEpochs,
    /// `tokens_seen >= max_tokens`.
    MaxTokens,
    /// `elapsed_seconds >= max_time_seconds`.
    MaxTime,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::MaxSteps => "max_steps",
            StopReason::MaxEpochs => "max_epochs",
            StopReason::MaxTokens => "max_tokens",
            StopReason::MaxTime => "max_time_seconds",
        };
        f.write_str(name)
    }
}

/// Result of one [`TrainingController::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep calling `step`.
    Continue,
    /// The run is over; the final evaluation has been recorded.
    Stopped(StopReason),
}

/// First limit in `config` that `state` has reached, in the order steps,
/// epochs, tokens, time.
pub fn stop_reason(config: &StopConfig, state: &ScheduleState) -> Option<StopReason> {
    if config.max_steps.is_some_and(|max| state.step >= max) {
        return Some(StopReason::MaxSteps);
    }
    if config
        .max_epochs
        .is_some_and(|max| state.epoch_fraction >= max)
    {
        return Some(StopReason::MaxEpochs);
    }
    if config.max_tokens.is_some_and(|max| state.tokens_seen >= max) {
        return Some(StopReason::MaxTokens);
    }
    if config
        .max_time_seconds
        .is_some_and(|max| state.elapsed_seconds >= max)
    {
        return Some(StopReason::MaxTime);
    }
    None
}

/// Loss and accuracy of the most recent microbatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainStats {
    /// Combined loss: causal, or `planning / planning_divider + acting / acting_divider`.
    pub loss: f64,
    /// Accuracy of the causal pass, or of the acting pass in plan-act mode.
    pub accuracy: f64,
    /// Undivided planning loss in plan-act mode.
    pub planning_loss: Option<f64>,
    /// Undivided acting loss in plan-act mode.
    pub acting_loss: Option<f64>,
}

/// Everything recorded at one evaluation event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalRecord {
    /// Optimizer steps taken when the evaluation ran.
    pub step: usize,
    /// Training metrics of the last microbatch.
    pub train: TaskMetrics,
    /// Global gradient norm at the last boundary.
    pub grad_norm: f64,
    /// Training tokens consumed.
    pub tokens_seen: usize,
    /// Epoch fraction.
    pub epoch: f64,
    /// Batch size in use.
    pub batchsize: usize,
    /// Sequence length in use.
    pub sequence_length: usize,
    /// Training seconds, evaluation excluded.
    pub train_seconds: f64,
    /// Learning rate of the default group.
    pub learning_rate: f64,
    /// Weight decay of the default group.
    pub weight_decay: f64,
    /// Quick evaluation results.
    pub val: QuickEvaluation,
}

impl EvalRecord {
    /// Flatten into telemetry keys.
    pub fn metrics(&self) -> MetricMap {
        let mut metrics = MetricMap::new();
        metrics.insert("train/loss".into(), self.train.loss);
        metrics.insert("train/acc".into(), self.train.accuracy);
        metrics.insert("train/pplx".into(), self.train.perplexity);
        self.val.insert_into(&mut metrics);
        metrics.insert("grad_norm".into(), self.grad_norm);
        metrics.insert("tokens_seen".into(), self.tokens_seen as f64);
        metrics.insert("epoch".into(), self.epoch);
        metrics.insert("batch_size".into(), self.batchsize as f64);
        metrics.insert("sequence_length".into(), self.sequence_length as f64);
        metrics.insert("cumulative_time".into(), self.train_seconds);
        metrics.insert("learning_rate".into(), self.learning_rate);
        metrics.insert("weight_decay".into(), self.weight_decay);
        metrics
    }
}

/// Evaluation records and scheduler events of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunHistory {
    /// One record per evaluation event, the final one last.
    pub evaluations: Vec<EvalRecord>,
    /// Sequence-length growth events.
    pub growth_events: Vec<GrowthEvent>,
    /// Gradient-norm measurements of the microbatch scheduler.
    pub grad_norm_samples: Vec<GradNormSample>,
    /// Why the run ended, once it has.
    pub stop_reason: Option<StopReason>,
}

impl RunHistory {
    /// The most recent evaluation.
    pub fn last_evaluation(&self) -> Option<&EvalRecord> {
        self.evaluations.last()
    }

    /// Evaluation records regrouped into one list per quantity.
    pub fn trajectory(&self) -> RunTrajectory {
        let mut trajectory = RunTrajectory::default();
        for record in &self.evaluations {
            trajectory.train.push(record.train);
            trajectory.val_causal.push(record.val.causal);
            trajectory.val_planning.push(record.val.planning);
            trajectory.val_acting.push(record.val.acting);
            trajectory.grad_norm.push(record.grad_norm);
            trajectory.cumulative_time.push(record.train_seconds);
            trajectory.tokens_seen.push(record.tokens_seen);
            trajectory.epoch.push(record.epoch);
            trajectory.batch_size.push(record.batchsize);
            trajectory.seq_length.push(record.sequence_length);
            trajectory.learning_rate.push(record.learning_rate);
            trajectory.weight_decay.push(record.weight_decay);
        }
        trajectory
    }
}

/// Drives one training run.
pub struct TrainingController<M: LanguageModel> {
    config: Arc<RunConfig>,
    model: M,
    sampler: BatchSampler,
    builder: TaskBatchBuilder,
    plan: ParameterGroupPlan,
    optimizer: GroupedAdamW,
    microbatch: MicrobatchScheduler,
    sequence: SequenceLengthScheduler,
    harness: EvaluationHarness,
    rng: StdRng,
    state: ScheduleState,
    history: RunHistory,
    num_params: usize,
    run_name: String,
    sink: Option<Box<dyn TelemetrySink>>,
    last_train: Option<TrainStats>,
    last_grad_norm: f64,
    started: bool,
    stopped: Option<StopReason>,
}

impl<M: LanguageModel> TrainingController<M> {
    /// Set up a run.
    ///
    /// Fails with a configuration error before any step if the config is
    /// invalid, the model's vocabulary cannot hold the special tokens, the
    /// corpus contains ids that collide with them, or the token budget leaves
    /// a final batch size of 1 or less.
    pub fn new(config: Arc<RunConfig>, model: M, corpus: Arc<Corpus>) -> Result<Self> {
        config.validate()?;
        let tokens = config.special_tokens();
        if model.vocab_size() < tokens.total_vocab_size() {
            return Err(PlanActError::config(format!(
                "model vocabulary {} cannot hold {} tokens plus 4 special tokens",
                model.vocab_size(),
                config.vocab_size
            )));
        }
        if corpus.max_token_id() >= config.vocab_size {
            return Err(PlanActError::config(format!(
                "corpus token id {} collides with the special tokens starting at {}",
                corpus.max_token_id(),
                config.vocab_size
            )));
        }

        let num_params = model.num_trainable_parameters();
        let token_budget = config.token_budget(num_params)?;
        let plan = ParameterGroupPlan::standard(
            &config.optimizer,
            model.parameters().iter().map(|p| p.name.as_str()),
            num_params,
        )?;
        let sequence = SequenceLengthScheduler::new(&config.sequence, token_budget)?;
        let microbatch = MicrobatchScheduler::new(&config.optimizer.microbatch, num_params);
        let harness = EvaluationHarness::new(&config, token_budget);

        tracing::info!(
            num_params,
            token_budget,
            initial_batchsize = sequence.current_batchsize(),
            final_batchsize = token_budget / sequence.max_length(),
            lr = plan.default_group().base_lr,
            plan_act = config.plan_act.enabled,
            "Initialized training controller"
        );
        tracing::debug!("{}", plan.summary());

        let state = ScheduleState {
            step: 0,
            microbatch_counter: 0,
            current_sequence_length: sequence.current_length(),
            current_batchsize: sequence.current_batchsize(),
            fractional_microbatch_steps: microbatch.fractional_steps(),
            discrete_microbatch_steps: microbatch.discrete_steps(),
            tokens_seen: 0,
            epoch_fraction: 0.0,
            elapsed_seconds: 0.0,
        };

        let mut model = model;
        model.zero_grad();

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            optimizer: GroupedAdamW::new(config.optimizer.eps),
            builder: TaskBatchBuilder::new(tokens),
            sampler: BatchSampler::new(corpus),
            run_name: format!("seed_{}", config.seed),
            config,
            model,
            plan,
            microbatch,
            sequence,
            harness,
            state,
            history: RunHistory::default(),
            num_params,
            sink: None,
            last_train: None,
            last_grad_norm: 0.0,
            started: false,
            stopped: None,
        })
    }

    /// Name reported to the telemetry sink and in the run summary.
    pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = name.into();
        self
    }

    /// Receive every evaluation event.
    pub fn with_sink(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Start from a different fractional microbatch estimate and dither the
    /// first step's count from it.
    pub fn with_initial_microbatch_steps(mut self, steps: f64) -> Self {
        self.microbatch = self.microbatch.with_fractional_steps(steps);
        self.state.discrete_microbatch_steps = self.microbatch.dither(&mut self.rng);
        self.state.fractional_microbatch_steps = self.microbatch.fractional_steps();
        self
    }

    /// Process one microbatch.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if let Some(reason) = self.stopped {
            return Ok(StepOutcome::Stopped(reason));
        }
        if !self.started {
            self.started = true;
            if let Some(sink) = self.sink.as_mut() {
                sink.on_run_start(&self.run_name);
            }
        }

        let timer = Instant::now();
        let length = self.state.current_sequence_length;
        let batchsize = self.state.current_batchsize;
        let window = self
            .sampler
            .sample(&mut self.rng, Split::Train, batchsize, length)?;

        let discrete = self.state.discrete_microbatch_steps;
        let stats = if self.config.plan_act.enabled {
            self.plan_act_microbatch(&window, discrete)?
        } else {
            self.causal_microbatch(&window, discrete)?
        };
        self.last_train = Some(stats);

        self.state.tokens_seen += batchsize * length;
        self.state.epoch_fraction =
            self.state.tokens_seen as f64 / self.sampler.corpus().len(Split::Train) as f64;
        self.state.microbatch_counter += 1;

        let mut eval_due = false;
        if self.state.microbatch_counter == discrete {
            eval_due = self.state.step % self.config.eval.eval_every == 0;
            self.optimizer_step(stats.loss)?;
        }
        self.state.elapsed_seconds += timer.elapsed().as_secs_f64();

        let stop = stop_reason(&self.config.stop, &self.state);
        if eval_due || stop.is_some() {
            self.evaluate()?;
        }

        match stop {
            Some(reason) => {
                tracing::info!(
                    reason = %reason,
                    steps = self.state.step,
                    tokens_seen = self.state.tokens_seen,
                    train_seconds = self.state.elapsed_seconds,
                    "Stopping run"
                );
                self.stopped = Some(reason);
                self.history.stop_reason = Some(reason);
                if let Some(sink) = self.sink.as_mut() {
                    sink.on_run_end();
                }
                Ok(StepOutcome::Stopped(reason))
            }
            None => Ok(StepOutcome::Continue),
        }
    }

    /// Step until a stop condition fires.
    pub fn run(&mut self) -> Result<&RunHistory> {
        while let StepOutcome::Continue = self.step()? {}
        Ok(&self.history)
    }

    /// Sweep the full plan-act evaluation grid with the current model.
    pub fn full_evaluation(&mut self) -> Result<FullEvaluationTable> {
        self.harness
            .full(&mut self.model, &self.sampler, &mut self.rng)
    }

    /// Summary of the run from its latest evaluation.
    pub fn summary(&self) -> Option<RunSummaryRow> {
        let record = self.history.last_evaluation()?;
        let plan_act = &self.config.plan_act;
        Some(RunSummaryRow {
            run_name: self.run_name.clone(),
            seed: self.config.seed,
            num_params: self.num_params,
            plan_act: plan_act.enabled,
            planning_divider: plan_act.planning_divider,
            acting_divider: plan_act.acting_divider,
            top_k: plan_act.top_k,
            steps: self.state.step,
            tokens_seen: self.state.tokens_seen,
            epoch: self.state.epoch_fraction,
            train_seconds: self.state.elapsed_seconds,
            causal: record.val.causal,
            planning_loss: record.val.planning.loss,
            acting_loss: record.val.acting.loss,
            limits: self.config.stop.clone(),
            history: self.history.trajectory(),
            full_evaluation_file: None,
        })
    }

    /// Current schedule state.
    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    /// Recorded history.
    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    /// The model being trained.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Parameter groups with their live learning rates and weight decay.
    pub fn parameter_groups(&self) -> &ParameterGroupPlan {
        &self.plan
    }

    /// Run name.
    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    /// Trainable parameter count.
    pub fn num_params(&self) -> usize {
        self.num_params
    }

    /// Training metrics of the most recent microbatch.
    pub fn last_train_stats(&self) -> Option<TrainStats> {
        self.last_train
    }

    /// Give back the model and the history.
    pub fn into_parts(self) -> (M, RunHistory) {
        (self.model, self.history)
    }

    fn causal_microbatch(&mut self, window: &Array2<u32>, discrete: usize) -> Result<TrainStats> {
        let batch = self.builder.causal(window);
        let logits = self.model.forward(&ModelInput::Tokens(batch.inputs), None)?;
        let (out, grad) =
            cross_entropy_with_grad(&logits, batch.targets.view(), 1.0 / discrete as f64)?;
        self.model.backward(&grad)?;
        Ok(TrainStats {
            loss: out.loss,
            accuracy: out.accuracy,
            planning_loss: None,
            acting_loss: None,
        })
    }

    fn plan_act_microbatch(&mut self, window: &Array2<u32>, discrete: usize) -> Result<TrainStats> {
        let config = Arc::clone(&self.config);
        let settings = &config.plan_act;
        let length = window.ncols();

        let mut planning_rate = settings.planner_masking_rate;
        let mut acting_rate = settings.actor_masking_rate;
        if settings.randomize_masking_rate {
            let concentration = settings.masking_rate_concentration;
            planning_rate = randomize_masking_rate(&mut self.rng, planning_rate, concentration)?;
            acting_rate = randomize_masking_rate(&mut self.rng, acting_rate, concentration)?;
        }
        let acting_rate = ActingSpan::clamp_acting_rate(length, planning_rate, acting_rate);
        let span = ActingSpan::from_rates(length, planning_rate, acting_rate)?;

        // The model caches a single forward pass, so planning backward runs
        // before the acting forward.
        let planning = self.builder.planning(window, span.first())?;
        let planning_logits = self
            .model
            .forward(&ModelInput::Tokens(planning.inputs), None)?;
        let planning_scale = 1.0 / (settings.planning_divider * discrete as f64);
        let (planning_out, grad) =
            cross_entropy_with_grad(&planning_logits, planning.targets.view(), planning_scale)?;
        self.model.backward(&grad)?;

        let acting = self.builder.acting(
            &self.model,
            window,
            &planning_logits,
            span,
            settings.top_k,
        )?;
        let acting_logits = self
            .model
            .forward(&ModelInput::Embeddings(acting.inputs), Some(span))?;
        let acting_scale = 1.0 / (settings.acting_divider * discrete as f64);
        let (acting_out, grad) =
            cross_entropy_with_grad(&acting_logits, acting.targets.view(), acting_scale)?;
        self.model.backward(&grad)?;

        Ok(TrainStats {
            loss: planning_out.loss / settings.planning_divider
                + acting_out.loss / settings.acting_divider,
            accuracy: acting_out.accuracy,
            planning_loss: Some(planning_out.loss),
            acting_loss: Some(acting_out.loss),
        })
    }

    fn optimizer_step(&mut self, loss: f64) -> Result<()> {
        let step = self.state.step;
        let grad_norm = self.model.grad_norm();
        self.last_grad_norm = grad_norm;

        self.optimizer.step(self.model.parameters_mut(), &self.plan)?;
        self.plan.update_weight_decay(loss);
        self.plan.step_schedules();

        if let Some(event) = self.sequence.maybe_grow(step) {
            tracing::info!(
                step,
                length = event.length,
                batchsize = event.batchsize,
                "Grew sequence length"
            );
            self.state.current_sequence_length = event.length;
            self.state.current_batchsize = event.batchsize;
            self.history.growth_events.push(event);
        }

        if self.microbatch.should_sample(step) {
            let sample = self.microbatch.observe(step, grad_norm);
            tracing::debug!(
                step,
                grad_norm = sample.normalized,
                target = sample.target,
                ratio = sample.ratio,
                microbatch_steps = sample.fractional_steps,
                "Re-estimated microbatch steps"
            );
            self.history.grad_norm_samples.push(sample);
        }
        self.state.discrete_microbatch_steps = self.microbatch.dither(&mut self.rng);
        self.state.fractional_microbatch_steps = self.microbatch.fractional_steps();

        self.model.zero_grad();
        self.state.microbatch_counter = 0;
        self.state.step += 1;
        Ok(())
    }

    fn evaluate(&mut self) -> Result<()> {
        let val = self
            .harness
            .quick(&mut self.model, &self.sampler, &mut self.rng)?;
        let train = self.last_train.unwrap_or(TrainStats {
            loss: f64::NAN,
            accuracy: f64::NAN,
            planning_loss: None,
            acting_loss: None,
        });
        let group = self.plan.default_group();
        let record = EvalRecord {
            step: self.state.step,
            train: TaskMetrics::new(train.loss, train.accuracy),
            grad_norm: self.last_grad_norm,
            tokens_seen: self.state.tokens_seen,
            epoch: self.state.epoch_fraction,
            batchsize: self.state.current_batchsize,
            sequence_length: self.state.current_sequence_length,
            train_seconds: self.state.elapsed_seconds,
            learning_rate: group.learning_rate,
            weight_decay: group.weight_decay,
            val,
        };

        if let Some(sink) = self.sink.as_mut() {
            sink.emit(record.step, &record.metrics());
        }
        self.history.evaluations.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planact_models::{ReferenceLm, ReferenceLmConfig};

    fn state() -> ScheduleState {
        ScheduleState {
            step: 0,
            microbatch_counter: 0,
            current_sequence_length: 32,
            current_batchsize: 4,
            fractional_microbatch_steps: 0.1,
            discrete_microbatch_steps: 1,
            tokens_seen: 0,
            epoch_fraction: 0.0,
            elapsed_seconds: 0.0,
        }
    }

    #[test]
    fn test_stop_reason_or_chain() {
        let config = StopConfig {
            max_steps: Some(10),
            max_epochs: Some(2.0),
            max_tokens: Some(1_000),
            max_time_seconds: Some(60.0),
        };
        assert_eq!(stop_reason(&config, &state()), None);

        let cases = [
            (ScheduleState { step: 10, ..state() }, StopReason::MaxSteps),
            (ScheduleState { epoch_fraction: 2.0, ..state() }, StopReason::MaxEpochs),
            (ScheduleState { tokens_seen: 1_000, ..state() }, StopReason::MaxTokens),
            (ScheduleState { elapsed_seconds: 61.0, ..state() }, StopReason::MaxTime),
        ];
        for (state, expected) in cases {
            assert_eq!(stop_reason(&config, &state), Some(expected));
        }
    }

    #[test]
    fn test_unset_limits_never_stop() {
        let config = StopConfig {
            max_tokens: Some(100),
            ..Default::default()
        };
        let late = ScheduleState {
            step: 1_000_000,
            epoch_fraction: 50.0,
            elapsed_seconds: 1e9,
            ..state()
        };
        assert_eq!(stop_reason(&config, &late), None);
    }

    fn controller(max_steps: usize) -> TrainingController<ReferenceLm> {
        let mut config = RunConfig {
            vocab_size: 20,
            ..Default::default()
        };
        config.stop.max_steps = Some(max_steps);
        config.sequence.initial_length = 16;
        config.sequence.max_length = 32;
        config.memory.token_budget = Some(128);
        config.eval.eval_token_budget = 256;

        let train: Vec<u32> = (0..4_000).map(|i| (i * 7 % 20) as u32).collect();
        let eval: Vec<u32> = (0..1_000).map(|i| (i * 3 % 20) as u32).collect();
        let corpus = Arc::new(Corpus::new(train, eval).unwrap());
        let model = ReferenceLm::new(ReferenceLmConfig::new(24).with_width(8)).unwrap();
        TrainingController::new(Arc::new(config), model, corpus).unwrap()
    }

    #[test]
    fn test_boundary_after_discrete_microbatches() {
        let mut controller = controller(100).with_initial_microbatch_steps(3.0);
        assert_eq!(controller.state().discrete_microbatch_steps, 3);

        for expected_counter in 1..=2 {
            assert_eq!(controller.step().unwrap(), StepOutcome::Continue);
            assert_eq!(controller.state().step, 0);
            assert_eq!(controller.state().microbatch_counter, expected_counter);
        }
        controller.step().unwrap();
        assert_eq!(controller.state().step, 1);
        assert_eq!(controller.state().microbatch_counter, 0);
        assert!(controller.state().discrete_microbatch_steps >= 1);
        assert_eq!(controller.state().tokens_seen, 3 * 128);
        // step 0 is an evaluation step
        assert_eq!(controller.history().evaluations.len(), 1);
        assert_eq!(controller.history().grad_norm_samples.len(), 1);
    }

    #[test]
    fn test_max_steps_gives_exact_step_count_and_final_eval() {
        let mut controller = controller(3);
        let history = controller.run().unwrap();
        assert_eq!(history.stop_reason, Some(StopReason::MaxSteps));
        // step 0 regular evaluation plus the forced one at stop
        assert_eq!(history.evaluations.len(), 2);
        assert_eq!(history.evaluations[1].step, 3);
        assert_eq!(controller.state().step, 3);

        assert_eq!(
            controller.step().unwrap(),
            StepOutcome::Stopped(StopReason::MaxSteps)
        );
        assert_eq!(controller.state().step, 3);
    }

    #[test]
    fn test_rejects_vocab_without_room_for_special_tokens() {
        let config = RunConfig {
            vocab_size: 20,
            stop: StopConfig {
                max_steps: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let corpus = Arc::new(Corpus::new(vec![1; 100], vec![1; 100]).unwrap());
        let model = ReferenceLm::new(ReferenceLmConfig::new(22).with_width(4)).unwrap();
        let err = TrainingController::new(Arc::new(config), model, corpus)
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }
}
