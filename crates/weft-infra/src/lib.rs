//! Infrastructure implementations for the Weft workflow engine.
//!
//! Implements the weft-core ports with SQLite: the persistence repositories
//! and the durable message broker, plus the environment-based configuration
//! loader.

pub mod config;
pub mod sqlite;
