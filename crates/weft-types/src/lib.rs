//! Shared domain types for the Weft workflow engine.
//!
//! This crate contains the types used across the engine: the workflow graph
//! IR, execution tracking records, broker message envelopes, the error
//! taxonomy, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod execution;
pub mod queue;
pub mod workflow;
