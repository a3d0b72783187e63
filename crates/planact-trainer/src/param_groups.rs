//! Parameter grouping for per-group learning rates, betas and weight decay.
//!
//! Groups are registered in order. A parameter joins the first group with a
//! keyword that appears in its name; the keyword-less default group takes the
//! rest. Membership is resolved once into an assignment table indexed like
//! the model's parameter list.

use planact_core::scaling;
use planact_core::{LrSchedule, OptimizerConfig, PlanActError, Result};

/// A group of parameters with shared optimizer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGroup {
    /// Group name (for logging).
    pub name: String,
    /// Substrings that claim a parameter; empty for the default group.
    pub keywords: Vec<String>,
    /// Learning rate at schedule step 0 multiplier 1.
    pub base_lr: f64,
    /// Learning rate used by the next optimizer step.
    pub learning_rate: f64,
    /// Decoupled weight decay.
    pub weight_decay: f64,
    /// Adam `(beta1, beta2)`.
    pub betas: (f64, f64),
    /// Multiplier applied to `base_lr` per optimizer step.
    pub schedule: LrSchedule,
}

impl ParameterGroup {
    /// Create a group with no keywords, zero weight decay and a constant schedule.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keywords: Vec::new(),
            base_lr: 0.0,
            learning_rate: 0.0,
            weight_decay: 0.0,
            betas: (0.9, 0.95),
            schedule: LrSchedule::Constant,
        }
    }

    /// Set the keywords that claim a parameter.
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Set the base learning rate.
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.base_lr = lr;
        self.learning_rate = lr * self.schedule.multiplier(0);
        self
    }

    /// Set the weight decay.
    pub fn with_weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    /// Set the Adam betas.
    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.betas = (beta1, beta2);
        self
    }

    /// Set the learning-rate schedule.
    pub fn with_schedule(mut self, schedule: LrSchedule) -> Self {
        self.schedule = schedule;
        self.learning_rate = self.base_lr * schedule.multiplier(0);
        self
    }

    /// Whether any keyword is a substring of `param_name`. Case matters.
    pub fn matches(&self, param_name: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| param_name.contains(keyword.as_str()))
    }

    fn is_default(&self) -> bool {
        self.keywords.is_empty()
    }
}

/// The standard four groups for a model with `num_params` parameters.
///
/// Registration order matters: `position_bias_mult` must claim its scalars
/// before the `bias` keyword of the norm group can.
pub fn standard_groups(config: &OptimizerConfig, num_params: usize) -> Vec<ParameterGroup> {
    let lr = scaling::base_learning_rate(num_params) * config.lr_mult.base;
    let warmup = LrSchedule::warmup_power_law(0.02, config.warmup_steps, -0.08);

    vec![
        ParameterGroup::new("decay")
            .with_schedule(warmup)
            .with_lr(lr)
            .with_weight_decay(config.base_weight_decay),
        ParameterGroup::new("position_bias_mult")
            .with_keywords(["position_bias_mult"])
            .with_schedule(LrSchedule::exponential(0.995))
            .with_lr(lr * config.lr_mult.position_bias),
        ParameterGroup::new("norm_bias_embedding")
            .with_keywords(["norm", "bias", "embedding"])
            .with_schedule(warmup)
            .with_lr(lr * config.lr_mult.non_dot_products),
        ParameterGroup::new("output")
            .with_keywords(["output"])
            .with_betas(0.6, 0.95)
            .with_schedule(LrSchedule::warmup_power_law(1.0, 0, -0.2))
            .with_lr(lr * config.lr_mult.output_layer),
    ]
}

/// Resolved parameter groups plus the live weight-decay and schedule state.
#[derive(Debug, Clone)]
pub struct ParameterGroupPlan {
    groups: Vec<ParameterGroup>,
    assignment: Vec<usize>,
    default_group: usize,
    base_weight_decay: f64,
    weight_decay_base: f64,
    schedule_step: usize,
}

impl ParameterGroupPlan {
    /// Resolve `param_names` against `groups`.
    ///
    /// Exactly one group must have no keywords; it becomes the default group
    /// and the only one whose weight decay follows the loss.
    pub fn new<'a>(
        groups: Vec<ParameterGroup>,
        param_names: impl IntoIterator<Item = &'a str>,
        weight_decay_base: f64,
    ) -> Result<Self> {
        let defaults: Vec<usize> = groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.is_default())
            .map(|(i, _)| i)
            .collect();
        let default_group = match defaults.as_slice() {
            [index] => *index,
            _ => {
                return Err(PlanActError::config(format!(
                    "expected exactly one keyword-less default group, found {}",
                    defaults.len()
                )))
            }
        };

        let assignment = param_names
            .into_iter()
            .map(|name| {
                groups
                    .iter()
                    .position(|g| !g.is_default() && g.matches(name))
                    .unwrap_or(default_group)
            })
            .collect();
        let base_weight_decay = groups[default_group].weight_decay;

        Ok(Self {
            groups,
            assignment,
            default_group,
            base_weight_decay,
            weight_decay_base,
            schedule_step: 0,
        })
    }

    /// The standard plan for a model, see [`standard_groups`].
    pub fn standard<'a>(
        config: &OptimizerConfig,
        param_names: impl IntoIterator<Item = &'a str>,
        num_params: usize,
    ) -> Result<Self> {
        Self::new(
            standard_groups(config, num_params),
            param_names,
            scaling::weight_decay_base(num_params),
        )
    }

    /// All groups in registration order.
    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    /// Group index of every parameter, in model order.
    pub fn assignment(&self) -> &[usize] {
        &self.assignment
    }

    /// Group of the parameter at `param_index`.
    pub fn group_of(&self, param_index: usize) -> Option<&ParameterGroup> {
        self.assignment.get(param_index).map(|&g| &self.groups[g])
    }

    /// The default (`decay`) group.
    pub fn default_group(&self) -> &ParameterGroup {
        &self.groups[self.default_group]
    }

    /// Optimizer steps the schedules have advanced through.
    pub fn schedule_step(&self) -> usize {
        self.schedule_step
    }

    /// Recompute the default group's weight decay from the live loss.
    ///
    /// Returns the new value.
    pub fn update_weight_decay(&mut self, loss: f64) -> f64 {
        let wd = scaling::dynamic_weight_decay(self.base_weight_decay, self.weight_decay_base, loss);
        self.groups[self.default_group].weight_decay = wd;
        wd
    }

    /// Advance every group's schedule by one optimizer step.
    pub fn step_schedules(&mut self) {
        self.schedule_step += 1;
        for group in &mut self.groups {
            group.learning_rate = group.base_lr * group.schedule.multiplier(self.schedule_step);
        }
    }

    /// Get summary of parameter grouping.
    pub fn summary(&self) -> String {
        let mut out = String::from("Parameter groups:");
        for (index, group) in self.groups.iter().enumerate() {
            let count = self.assignment.iter().filter(|&&g| g == index).count();
            out.push_str(&format!(
                "\n  - {}: {} params (lr={:.2e}, wd={:.2e})",
                group.name, count, group.learning_rate, group.weight_decay
            ));
        }
        out
    }
}
