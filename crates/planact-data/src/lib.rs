//! Corpus handling and task-batch construction for planact.
//!
//! This crate provides:
//! - [`Corpus`]: the immutable train/eval token streams
//! - [`BatchSampler`]: i.i.d. fixed-length windows drawn with replacement
//! - [`TaskBatchBuilder`]: causal, planning and acting inputs built from a window

#![warn(missing_docs)]

pub mod corpus;
pub mod sampler;
pub mod tasks;

pub use corpus::*;
pub use sampler::*;
pub use tasks::*;
