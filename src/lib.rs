#![allow(clippy::many_single_char_names)]
#![allow(clippy::type_complexity)]
#![warn(missing_docs)]

//! # Conmin
//!
//! A frontend for nonlinear constrained minimization of scalar objectives
//! written entirely in Rust.
//!
//! The library normalizes heterogeneous user input -- structured or flat
//! parameters, bounds, linear and general constraints, analytic or estimated
//! derivatives -- into one canonical internal representation and dispatches
//! it to the selected iterative backend. Bound constraints, linear
//! (in)equality constraints and general nonlinear (in)equality constraints
//! are supported first-class, as are fixed parameters, per-parameter
//! finite-difference policies and complex-step differentiation.
//!
//! ## Backends
//!
//! * [lm_feasible](algo::lm_feasible) -- The default. A feasible-path
//!   constrained minimizer; the objective and constraints are only ever
//!   evaluated within bounds.
//! * [octave_sqp](algo::sqp) -- Active-set sequential quadratic programming
//!   with a damped BFGS approximation.
//! * [siman](algo::siman) -- Simulated annealing with optional plain-text
//!   checkpointing, useful for rough global searches.
//! * [d2_min](algo::d2_min) -- Newton iteration for problems with cheap
//!   second derivatives; no constraint support.
//!
//! ## Problem
//!
//! The problem is the minimization of a scalar function of *n* variables
//!
//! ```text
//! min f(x), x = { x1, ..., xn }
//! ```
//!
//! subject to any combination of
//!
//! ```text
//! Li <= xi <= Ui        (bounds)
//! Mᵀx + v >= 0          (linear inequalities)
//! Mᵀx + v  = 0          (linear equalities)
//! h(x) >= 0             (general inequalities)
//! g(x)  = 0             (general equalities)
//! ```
//!
//! The feasibility convention is uniform: a constraint row is satisfied when
//! its value is non-negative (inequalities) or zero (equalities).
//!
//! ## Minimizing
//!
//! ```rust
//! use conmin::nalgebra::{dvector, DVector};
//! use conmin::{minimize, ConstraintFn, Objective, Params, Settings};
//!
//! // Minimize x1² + x2² subject to x1² + 1 - x2 = 0.
//! let settings = Settings {
//!     equc: Some(ConstraintFn::new(|x: &DVector<f64>| {
//!         dvector![x[0] * x[0] + 1.0 - x[1]]
//!     })),
//!     ..Default::default()
//! };
//!
//! let outcome = minimize(
//!     Objective::flat(|x: &DVector<f64>| x.iter().map(|v| v * v).sum()),
//!     Params::flat(vec![-2.0, 5.0]),
//!     settings,
//! )
//! .expect("invalid problem setup");
//!
//! // Positive outcome codes mean success; limits and user stops are
//! // reported the same way, not as errors.
//! assert!(outcome.conv.code() > 0);
//! ```
//!
//! Parameters can also be structured as named blocks; see [`Params`] and the
//! structured variants of [`Objective`], [`Gradient`](pipeline::adapter::Gradient)
//! and [`Hessian`](pipeline::adapter::Hessian). Results are re-expanded to
//! the structure of the initial values.
//!
//! ## License
//!
//! Licensed under MIT.

pub mod algo;
mod core;
pub mod derivatives;
pub mod driver;
pub mod pipeline;

pub use crate::core::*;
pub use driver::{minimize, Error, Outcome, Settings};
pub use pipeline::adapter::{ConstraintFn, Gradient, Hessian, Objective, PairTable};
pub use pipeline::stack::LinearConstraint;

#[cfg(feature = "testing")]
pub mod testing;

#[cfg(not(feature = "testing"))]
pub(crate) mod testing;

pub use nalgebra;
