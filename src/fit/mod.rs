//! Fitting engine.
//!
//! Responsibilities:
//!
//! - map model parameters to bounded internal variables (`transform`)
//! - robust losses and the bounded least-squares solver (`loss`, `solver`)
//! - data-driven initial guesses (`init`)
//! - single-session fits and their lifecycle (`fitter`, `session`)
//! - multistart fan-out on a worker pool (`multistart`)
//! - picking the best session by AIC or BIC (`selection`)

pub mod fitter;
pub mod init;
pub mod loss;
pub mod multistart;
pub mod options;
pub mod selection;
pub mod session;
pub mod solver;
pub mod transform;

pub use fitter::*;
pub use init::*;
pub use loss::*;
pub use multistart::*;
pub use options::*;
pub use selection::*;
pub use session::*;
pub use solver::*;
pub use transform::*;
