//! Data sources for the engine.
//!
//! Measured series come from the application layer; this module only
//! provides seeded synthetic series with a known ground truth.

pub mod synthetic;

pub use synthetic::*;
