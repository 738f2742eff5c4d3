//! Core types of the minimization frontend.
//!
//! [params](self) holds the parameter layout and structured/flat conversion,
//! [config](self) the per-parameter configuration resolution and [hook](self)
//! the backend-facing bundle of derivatives, constraints, tolerances and user
//! interaction.

mod config;
mod hook;
mod params;

pub use config::*;
pub use hook::*;
pub use params::*;
