//! Adaptive training control for plan-act language models.
//!
//! This crate provides:
//! - Parameter grouping with per-group learning-rate schedules and a
//!   loss-driven weight decay
//! - AdamW over those groups
//! - Microbatch dithering toward a target gradient-norm trajectory
//! - Sequence-length growth under a fixed token budget
//! - The [`TrainingController`] state machine
//! - Quick and full evaluation of the causal, planning and acting tasks
//! - Telemetry sinks and CSV result writers
//!
//! ```ignore
//! use planact_trainer::{LoggingSink, TrainingController};
//!
//! let mut controller = TrainingController::new(config, model, corpus)?
//!     .with_run_name("depth_1_width_64_seed_0")
//!     .with_sink(Box::new(LoggingSink::new()));
//! let history = controller.run()?;
//! ```

#![warn(missing_docs)]

pub mod adamw_groups;
pub mod callbacks;
pub mod controller;
pub mod evaluation;
pub mod loss;
pub mod microbatch;
pub mod param_groups;
pub mod results;
pub mod sequence_length;

pub use adamw_groups::*;
pub use callbacks::*;
pub use controller::*;
pub use evaluation::*;
pub use loss::*;
pub use microbatch::*;
pub use param_groups::*;
pub use results::*;
pub use sequence_length::*;
