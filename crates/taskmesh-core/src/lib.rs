//! Core types and error definitions for taskmesh.
//!
//! This crate provides the foundational types shared across all taskmesh
//! crates.
//!
//! # Main types
//!
//! - [`TaskmeshError`]: Unified error enum covering the engine's error taxonomy.
//! - [`TaskmeshResult`]: Convenience alias for `Result<T, TaskmeshError>`.
//! - [`Payload`]: Opaque task input/output data, owned by the submitter.

/// Error taxonomy shared by every taskmesh crate.
pub mod error;

pub use error::{TaskmeshError, TaskmeshResult};

/// Opaque data handed to, and returned from, task handlers.
///
/// The engine never inspects a payload, with one exception: workflow nodes
/// may declare `use_output_from` to receive a dependency's result.
pub type Payload = serde_json::Value;
