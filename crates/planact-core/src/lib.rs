//! Core types, traits, and configuration for plan-act language model training.
//!
//! This crate provides the foundational abstractions shared by the rest of the
//! workspace:
//!
//! - The immutable [`RunConfig`] and its validation
//! - Error handling infrastructure
//! - Special tokens, acting spans and evaluation metric types
//! - Collaborator traits: [`LanguageModel`], [`TelemetrySink`], [`ResultWriter`]
//! - Learning rate schedule functions
//! - Scaling equations that derive hyperparameters from the parameter count

#![warn(missing_docs)]

mod config;
mod error;
pub mod scaling;
pub mod scheduler;
mod traits;
mod types;

pub use config::*;
pub use error::*;
pub use scheduler::LrSchedule;
pub use traits::*;
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{PlanActError, Result};
    pub use crate::scheduler::LrSchedule;
    pub use crate::traits::*;
    pub use crate::types::*;
}
