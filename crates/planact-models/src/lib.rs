//! Model implementations for planact.
//!
//! The training controller only depends on the
//! [`LanguageModel`](planact_core::LanguageModel) trait. This crate ships a
//! small CPU model with an exact hand-written backward pass, used by the
//! integration tests, the benches and the CLI.

#![warn(missing_docs)]

pub mod reference;

pub use reference::{ReferenceLm, ReferenceLmConfig};
