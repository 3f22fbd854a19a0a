//! Dielectric response models.
//!
//! Models are implemented as small, pure functions over a flat parameter
//! vector so that the fitting code can stay generic. The registry describes
//! each family's parameter schema as data.

pub mod model;
pub mod registry;

pub use model::*;
pub use registry::*;
