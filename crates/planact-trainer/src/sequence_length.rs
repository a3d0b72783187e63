//! Sequence-length growth under a fixed token budget.

use planact_core::{PlanActError, Result, SequenceConfig};
use serde::Serialize;

/// A change of sequence length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GrowthEvent {
    /// Optimizer step that triggered the growth.
    pub step: usize,
    /// New sequence length.
    pub length: usize,
    /// New batch size.
    pub batchsize: usize,
}

/// Doubles the sequence length every `growth_steps` optimizer steps and keeps
/// `batchsize = token_budget / length`.
#[derive(Debug, Clone)]
pub struct SequenceLengthScheduler {
    max_length: usize,
    growth_steps: usize,
    token_budget: usize,
    length: usize,
    batchsize: usize,
}

impl SequenceLengthScheduler {
    /// Create a scheduler. Fails unless `token_budget / max_length > 1`.
    pub fn new(config: &SequenceConfig, token_budget: usize) -> Result<Self> {
        if config.initial_length == 0 || config.initial_length > config.max_length {
            return Err(PlanActError::config(format!(
                "initial length {} must lie in [1, {}]",
                config.initial_length, config.max_length
            )));
        }
        if config.growth_steps == 0 {
            return Err(PlanActError::config("growth_steps must be positive"));
        }
        let final_batchsize = token_budget / config.max_length;
        if final_batchsize <= 1 {
            return Err(PlanActError::config(format!(
                "token budget {token_budget} leaves a final batch size of {final_batchsize}"
            )));
        }
        Ok(Self {
            max_length: config.max_length,
            growth_steps: config.growth_steps,
            token_budget,
            length: config.initial_length,
            batchsize: token_budget / config.initial_length,
        })
    }

    /// Current sequence length.
    pub fn current_length(&self) -> usize {
        self.length
    }

    /// Current batch size.
    pub fn current_batchsize(&self) -> usize {
        self.batchsize
    }

    /// Maximum sequence length.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Tokens per batch the scheduler keeps constant.
    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    /// Grow if `step` is a non-zero multiple of `growth_steps` and the
    /// length is still below the maximum.
    pub fn maybe_grow(&mut self, step: usize) -> Option<GrowthEvent> {
        if step == 0 || step % self.growth_steps != 0 || self.length >= self.max_length {
            return None;
        }
        self.length = (self.length * 2).min(self.max_length);
        self.batchsize = self.token_budget / self.length;
        Some(GrowthEvent {
            step,
            length: self.length,
            batchsize: self.batchsize,
        })
    }
}
