//! Observability bootstrap for the Weft workflow engine.

pub mod telemetry;
