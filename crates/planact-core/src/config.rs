//! Configuration types for planact.
//!
//! A [`RunConfig`] is built once per run, validated, and then passed by
//! reference to every component. Nothing mutates it during training; all
//! live quantities belong to the controller's schedule state.

use serde::{Deserialize, Serialize};

use crate::scaling;
use crate::{PlanActError, Result, SpecialTokens, DEFAULT_VOCAB_SIZE};

/// Complete configuration of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Sequence-length growth.
    #[serde(default)]
    pub sequence: SequenceConfig,

    /// Token budget derivation.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Parameter groups, weight decay and microbatching.
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Stop conditions, combined with OR.
    #[serde(default)]
    pub stop: StopConfig,

    /// Plan-act curriculum.
    #[serde(default)]
    pub plan_act: PlanActConfig,

    /// Evaluation cadence and operating points.
    #[serde(default)]
    pub eval: EvalConfig,

    /// Natural vocabulary size; the four special tokens follow it.
    #[serde(default = "default_vocab_size")]
    pub vocab_size: u32,

    /// Seed for window sampling, dithering and masking-rate draws.
    #[serde(default)]
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sequence: SequenceConfig::default(),
            memory: MemoryConfig::default(),
            optimizer: OptimizerConfig::default(),
            stop: StopConfig::default(),
            plan_act: PlanActConfig::default(),
            eval: EvalConfig::default(),
            vocab_size: default_vocab_size(),
            seed: 0,
        }
    }
}

impl RunConfig {
    /// Special token ids for this vocabulary.
    pub fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens::after_vocab(self.vocab_size)
    }

    /// Check every field that does not depend on the model.
    pub fn validate(&self) -> Result<()> {
        self.sequence.validate()?;
        self.optimizer.validate()?;
        self.stop.validate()?;
        self.plan_act.validate()?;
        self.eval.validate(self.sequence.max_length)?;
        if self.vocab_size == 0 {
            return Err(PlanActError::config("vocab_size must be positive"));
        }
        Ok(())
    }

    /// Tokens per batch for a model with `num_params` trainable parameters.
    ///
    /// Fails when the budget cannot hold at least two windows of the maximum
    /// sequence length.
    pub fn token_budget(&self, num_params: usize) -> Result<usize> {
        let budget = self.memory.token_budget(num_params);
        let final_batchsize = budget / self.sequence.max_length;
        if final_batchsize <= 1 {
            return Err(PlanActError::config(format!(
                "token budget {budget} gives a final batch size of {final_batchsize} at length {}; \
                 reduce max_length or raise the budget",
                self.sequence.max_length
            )));
        }
        Ok(budget)
    }
}

/// Sequence-length growth schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Length at step 0.
    #[serde(default = "default_initial_length")]
    pub initial_length: usize,

    /// Length is never grown past this value.
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Length doubles every `growth_steps` optimizer steps.
    #[serde(default = "default_growth_steps")]
    pub growth_steps: usize,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            initial_length: default_initial_length(),
            max_length: default_max_length(),
            growth_steps: default_growth_steps(),
        }
    }
}

impl SequenceConfig {
    fn validate(&self) -> Result<()> {
        if self.initial_length < 2 {
            return Err(PlanActError::config("initial_length must be at least 2"));
        }
        if self.initial_length > self.max_length {
            return Err(PlanActError::config(format!(
                "initial_length {} exceeds max_length {}",
                self.initial_length, self.max_length
            )));
        }
        if self.growth_steps == 0 {
            return Err(PlanActError::config("growth_steps must be positive"));
        }
        Ok(())
    }
}

/// How the per-step token budget is derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Tokens that fit at the reference model size.
    #[serde(default = "default_gpu_token_capacity")]
    pub gpu_token_capacity: usize,

    /// Multiplier on `gpu_token_capacity` for larger or smaller devices.
    #[serde(default = "default_one")]
    pub capacity_scalar: f64,

    /// Explicit budget that bypasses the capacity equation.
    #[serde(default)]
    pub token_budget: Option<usize>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            gpu_token_capacity: default_gpu_token_capacity(),
            capacity_scalar: 1.0,
            token_budget: None,
        }
    }
}

impl MemoryConfig {
    /// Tokens per batch for a model with `num_params` parameters.
    pub fn token_budget(&self, num_params: usize) -> usize {
        self.token_budget.unwrap_or_else(|| {
            scaling::tokens_per_batch_capacity(
                self.gpu_token_capacity as f64 * self.capacity_scalar,
                scaling::model_scale(num_params),
            )
        })
    }
}

/// Learning-rate multipliers per parameter group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrMultipliers {
    /// Applied to every group on top of the scaling-law base rate.
    #[serde(default = "default_lr_mult_base")]
    pub base: f64,

    /// Position-bias scalars.
    #[serde(default = "default_lr_mult_position_bias")]
    pub position_bias: f64,

    /// Norms, biases and embeddings.
    #[serde(default = "default_lr_mult_non_dot_products")]
    pub non_dot_products: f64,

    /// Output projection.
    #[serde(default = "default_lr_mult_output_layer")]
    pub output_layer: f64,
}

impl Default for LrMultipliers {
    fn default() -> Self {
        Self {
            base: default_lr_mult_base(),
            position_bias: default_lr_mult_position_bias(),
            non_dot_products: default_lr_mult_non_dot_products(),
            output_layer: default_lr_mult_output_layer(),
        }
    }
}

/// Adaptive gradient-accumulation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicrobatchConfig {
    /// Re-estimate the fractional step count every this many optimizer steps.
    #[serde(default = "default_sample_every")]
    pub sample_every: usize,

    /// Gain of the multiplicative update.
    #[serde(default = "default_microbatch_scale_lr")]
    pub scale_lr: f64,
}

impl Default for MicrobatchConfig {
    fn default() -> Self {
        Self {
            sample_every: default_sample_every(),
            scale_lr: default_microbatch_scale_lr(),
        }
    }
}

/// Optimizer and parameter-group configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Group learning-rate multipliers.
    #[serde(default)]
    pub lr_mult: LrMultipliers,

    /// Numerator of the loss-dependent weight decay of the default group.
    #[serde(default = "default_base_weight_decay")]
    pub base_weight_decay: f64,

    /// Linear warmup length of the power-law schedules.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,

    /// Adam epsilon shared by every group.
    #[serde(default = "default_eps")]
    pub eps: f64,

    /// Microbatch dithering.
    #[serde(default)]
    pub microbatch: MicrobatchConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr_mult: LrMultipliers::default(),
            base_weight_decay: default_base_weight_decay(),
            warmup_steps: default_warmup_steps(),
            eps: default_eps(),
            microbatch: MicrobatchConfig::default(),
        }
    }
}

impl OptimizerConfig {
    fn validate(&self) -> Result<()> {
        if self.microbatch.sample_every == 0 {
            return Err(PlanActError::config("microbatch.sample_every must be positive"));
        }
        if self.eps <= 0.0 {
            return Err(PlanActError::config("eps must be positive"));
        }
        if self.base_weight_decay < 0.0 {
            return Err(PlanActError::config("base_weight_decay must be non-negative"));
        }
        Ok(())
    }
}

/// Stop conditions. The run stops as soon as any configured limit is reached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopConfig {
    /// Optimizer steps.
    #[serde(default)]
    pub max_steps: Option<usize>,

    /// Passes over the training split, measured in tokens seen. Fractional
    /// values stop partway through an epoch.
    #[serde(default)]
    pub max_epochs: Option<f64>,

    /// Training tokens seen.
    #[serde(default)]
    pub max_tokens: Option<usize>,

    /// Wall-clock training seconds, evaluation excluded.
    #[serde(default)]
    pub max_time_seconds: Option<f64>,
}

impl StopConfig {
    fn validate(&self) -> Result<()> {
        if self.max_steps.is_none()
            && self.max_epochs.is_none()
            && self.max_tokens.is_none()
            && self.max_time_seconds.is_none()
        {
            return Err(PlanActError::config(
                "at least one of max_steps, max_epochs, max_tokens, max_time_seconds must be set",
            ));
        }
        if let Some(max) = self.max_epochs {
            if !(max.is_finite() && max > 0.0) {
                return Err(PlanActError::config(format!(
                    "max_epochs must be positive, got {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Plan-act curriculum settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanActConfig {
    /// Train on planning and acting passes instead of plain causal prediction.
    #[serde(default)]
    pub enabled: bool,

    /// Planning loss is divided by this before summing.
    #[serde(default = "default_one")]
    pub planning_divider: f64,

    /// Acting loss is divided by this before summing.
    #[serde(default = "default_one")]
    pub acting_divider: f64,

    /// Mean fraction of the sequence hidden from the planner.
    #[serde(default = "default_planner_masking_rate")]
    pub planner_masking_rate: f64,

    /// Mean fraction of the sequence the actor fills in.
    #[serde(default = "default_actor_masking_rate")]
    pub actor_masking_rate: f64,

    /// Draw both masking rates from a Beta distribution every iteration.
    #[serde(default)]
    pub randomize_masking_rate: bool,

    /// Concentration `a + b` of that Beta distribution.
    #[serde(default = "default_masking_rate_concentration")]
    pub masking_rate_concentration: f64,

    /// Planner predictions blended into each soft acting input.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for PlanActConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            planning_divider: 1.0,
            acting_divider: 1.0,
            planner_masking_rate: default_planner_masking_rate(),
            actor_masking_rate: default_actor_masking_rate(),
            randomize_masking_rate: false,
            masking_rate_concentration: default_masking_rate_concentration(),
            top_k: default_top_k(),
        }
    }
}

impl PlanActConfig {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.planning_divider <= 0.0 || self.acting_divider <= 0.0 {
            return Err(PlanActError::config("loss dividers must be positive"));
        }
        for (name, rate) in [
            ("planner_masking_rate", self.planner_masking_rate),
            ("actor_masking_rate", self.actor_masking_rate),
        ] {
            if !(rate > 0.0 && rate < 1.0) {
                return Err(PlanActError::config(format!("{name} must lie in (0, 1), got {rate}")));
            }
        }
        if self.actor_masking_rate >= self.planner_masking_rate {
            return Err(PlanActError::config(
                "actor_masking_rate must be smaller than planner_masking_rate",
            ));
        }
        if self.masking_rate_concentration <= 0.0 {
            return Err(PlanActError::config("masking_rate_concentration must be positive"));
        }
        if self.top_k == 0 {
            return Err(PlanActError::config("top_k must be at least 1"));
        }
        Ok(())
    }
}

/// Plan-act operating point used by the quick evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickEvalPoint {
    /// Planner masking rate.
    #[serde(default = "default_planner_masking_rate")]
    pub planning_rate: f64,

    /// Actor masking rate.
    #[serde(default = "default_quick_acting_rate")]
    pub acting_rate: f64,

    /// Top-k blend width.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for QuickEvalPoint {
    fn default() -> Self {
        Self {
            planning_rate: default_planner_masking_rate(),
            acting_rate: default_quick_acting_rate(),
            top_k: default_top_k(),
        }
    }
}

/// Sweep of the full plan-act evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullEvalGrid {
    /// Acting widths `1..=max_acting_width`.
    #[serde(default = "default_max_acting_width")]
    pub max_acting_width: usize,

    /// First value of the `last_acting_idx` range.
    #[serde(default = "default_last_idx_start")]
    pub last_idx_start: usize,

    /// Stride of the `last_acting_idx` range, which runs up to the sequence length.
    #[serde(default = "default_last_idx_stride")]
    pub last_idx_stride: usize,

    /// Top-k values `1..=max_top_k`.
    #[serde(default = "default_top_k")]
    pub max_top_k: usize,
}

impl Default for FullEvalGrid {
    fn default() -> Self {
        Self {
            max_acting_width: default_max_acting_width(),
            last_idx_start: default_last_idx_start(),
            last_idx_stride: default_last_idx_stride(),
            max_top_k: default_top_k(),
        }
    }
}

impl FullEvalGrid {
    /// `last_acting_idx` values swept at sequence length `length`.
    pub fn last_indices(&self, length: usize) -> Vec<usize> {
        (self.last_idx_start..length)
            .step_by(self.last_idx_stride.max(1))
            .collect()
    }

    /// Number of rows the sweep produces at `length`.
    pub fn num_points(&self, length: usize) -> usize {
        self.max_acting_width * self.last_indices(length).len() * self.max_top_k
    }
}

/// Evaluation cadence and sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Quick evaluation every this many optimizer steps.
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,

    /// Held-out tokens consumed per evaluation.
    #[serde(default = "default_eval_token_budget")]
    pub eval_token_budget: usize,

    /// Evaluation batch size is the training batch size at max length divided by this.
    #[serde(default = "default_eval_batchsize_divisor")]
    pub batchsize_divisor: usize,

    /// Plan-act operating point of the quick evaluation.
    #[serde(default)]
    pub quick: QuickEvalPoint,

    /// Sweep of the final evaluation.
    #[serde(default)]
    pub full_grid: FullEvalGrid,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            eval_every: default_eval_every(),
            eval_token_budget: default_eval_token_budget(),
            batchsize_divisor: default_eval_batchsize_divisor(),
            quick: QuickEvalPoint::default(),
            full_grid: FullEvalGrid::default(),
        }
    }
}

impl EvalConfig {
    /// Evaluation batch size: `token_budget / length / divisor`, at least 1.
    pub fn eval_batchsize(&self, token_budget: usize, length: usize) -> usize {
        (token_budget / length / self.batchsize_divisor).max(1)
    }

    /// Evaluation steps: `eval_token_budget / length / eval_batchsize`, at least 1.
    pub fn eval_steps(&self, token_budget: usize, length: usize) -> usize {
        (self.eval_token_budget / length / self.eval_batchsize(token_budget, length)).max(1)
    }

    /// `length` is the length evaluations run at.
    fn validate(&self, length: usize) -> Result<()> {
        if self.eval_every == 0 {
            return Err(PlanActError::config("eval_every must be positive"));
        }
        if self.batchsize_divisor == 0 {
            return Err(PlanActError::config("batchsize_divisor must be positive"));
        }
        if self.quick.top_k == 0 || self.full_grid.max_top_k == 0 {
            return Err(PlanActError::config("evaluation top_k must be at least 1"));
        }
        if self.full_grid.max_acting_width == 0 || self.full_grid.last_idx_stride == 0 {
            return Err(PlanActError::config(
                "full evaluation grid needs a positive acting width and stride",
            ));
        }
        self.quick.validate(length)
    }
}

impl QuickEvalPoint {
    fn validate(&self, length: usize) -> Result<()> {
        let (planning, acting) = (self.planning_rate, self.acting_rate);
        if !(planning > 0.0 && planning < 1.0 && acting > 0.0 && acting < 1.0) {
            return Err(PlanActError::config(format!(
                "quick evaluation rates must lie in (0, 1), got planning {planning} and acting {acting}"
            )));
        }
        if acting >= planning - 1.1 / length as f64 {
            return Err(PlanActError::config(format!(
                "quick evaluation acting rate {acting} must stay below planning rate {planning} \
                 minus 1.1 / {length}"
            )));
        }
        Ok(())
    }
}

/// How planning and acting divider lists combine into settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossDividerMethod {
    /// Pair the lists element-wise; lengths must match.
    #[default]
    Zip,
    /// Every planning divider with every acting divider.
    Product,
}

/// Combine divider lists into `(planning, acting)` pairs.
pub fn loss_divider_pairs(
    planning: &[f64],
    acting: &[f64],
    method: LossDividerMethod,
) -> Result<Vec<(f64, f64)>> {
    match method {
        LossDividerMethod::Zip => {
            if planning.len() != acting.len() {
                return Err(PlanActError::config(format!(
                    "zip needs divider lists of equal length, got {} planning and {} acting",
                    planning.len(),
                    acting.len()
                )));
            }
            Ok(planning.iter().copied().zip(acting.iter().copied()).collect())
        }
        LossDividerMethod::Product => Ok(planning
            .iter()
            .flat_map(|&p| acting.iter().map(move |&a| (p, a)))
            .collect()),
    }
}

fn default_vocab_size() -> u32 {
    DEFAULT_VOCAB_SIZE
}
fn default_initial_length() -> usize {
    32
}
fn default_max_length() -> usize {
    1024
}
fn default_growth_steps() -> usize {
    80
}
fn default_gpu_token_capacity() -> usize {
    scaling::DEFAULT_GPU_TOKEN_CAPACITY
}
fn default_one() -> f64 {
    1.0
}
fn default_lr_mult_base() -> f64 {
    2.62
}
fn default_lr_mult_position_bias() -> f64 {
    100.0
}
fn default_lr_mult_non_dot_products() -> f64 {
    32.0
}
fn default_lr_mult_output_layer() -> f64 {
    2.0
}
fn default_sample_every() -> usize {
    5
}
fn default_microbatch_scale_lr() -> f64 {
    0.1
}
fn default_base_weight_decay() -> f64 {
    16.0
}
fn default_warmup_steps() -> usize {
    100
}
fn default_eps() -> f64 {
    1e-9
}
fn default_planner_masking_rate() -> f64 {
    0.25
}
fn default_actor_masking_rate() -> f64 {
    0.1
}
fn default_quick_acting_rate() -> f64 {
    0.01
}
fn default_masking_rate_concentration() -> f64 {
    8.0
}
fn default_top_k() -> usize {
    5
}
fn default_max_acting_width() -> usize {
    10
}
fn default_last_idx_start() -> usize {
    13
}
fn default_last_idx_stride() -> usize {
    10
}
fn default_eval_every() -> usize {
    10
}
fn default_eval_token_budget() -> usize {
    153_600
}
fn default_eval_batchsize_divisor() -> usize {
    16
}
