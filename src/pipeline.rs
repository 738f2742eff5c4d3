//! The staged transformation pipeline.
//!
//! Heterogeneous user-supplied functions are reduced to one canonical internal
//! representation through an explicit, ordered sequence of stages:
//!
//! 1. [adapter](crate::pipeline::adapter) -- structured (named-block)
//!    functions become functions over the flat parameter vector,
//! 2. [fixed](crate::pipeline::fixed) -- fixed parameters are eliminated and
//!    every function is rewritten over the free subspace,
//! 3. [stack](crate::pipeline::stack) -- bounds, linear and general
//!    constraints are stacked into a single constraint-value function and a
//!    single constraint-Jacobian function with per-row equality provenance.
//!
//! Each stage is a pure transformation taking and returning the small function
//! interface below, so the order of application is an explicit, testable list
//! rather than a nest of anonymous closures.

use nalgebra::{DMatrix, DVector};

pub mod adapter;
pub mod fixed;
pub mod stack;

pub use adapter::{ConstraintFn, ConstraintJac, ConstraintValues, Gradient, Hessian, Objective};
pub use fixed::FixedPartition;
pub use stack::{ConstraintStack, LinearConstraint};

/// Flat scalar objective over the internal parameter space.
pub type ObjFn = Box<dyn Fn(&DVector<f64>) -> f64 + Send + Sync>;

/// Gradient of the objective over the internal parameter space.
///
/// `FnMut` because numeric estimators carry a memoization cache.
pub type GradFn = Box<dyn FnMut(&DVector<f64>) -> DVector<f64> + Send>;

/// Hessian of the objective over the internal parameter space.
pub type HessFn = Box<dyn FnMut(&DVector<f64>) -> DMatrix<f64> + Send>;

/// Constraint values for the requested rows (`None` requests all rows).
pub type ConsFn = Box<dyn Fn(&DVector<f64>, Option<&[usize]>) -> DVector<f64> + Send + Sync>;

/// Constraint Jacobian rows for the requested rows (`None` requests all).
///
/// Columns always correspond to the active parameter subset of the stage the
/// function was produced by.
pub type ConsJacFn = Box<dyn FnMut(&DVector<f64>, Option<&[usize]>) -> DMatrix<f64> + Send>;

/// Selects the requested rows of a full value vector, in the requested order.
pub(crate) fn select_rows(full: &DVector<f64>, indices: &[usize]) -> DVector<f64> {
    DVector::from_iterator(indices.len(), indices.iter().map(|&i| full[i]))
}

/// Selects the requested rows of a full matrix, in the requested order.
pub(crate) fn select_matrix_rows(full: &DMatrix<f64>, indices: &[usize]) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(indices.len(), full.ncols());
    for (k, &i) in indices.iter().enumerate() {
        out.row_mut(k).copy_from(&full.row(i));
    }
    out
}

/// Selects the requested columns of a full matrix, in the requested order.
pub(crate) fn select_matrix_columns(full: &DMatrix<f64>, indices: &[usize]) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(full.nrows(), indices.len());
    for (k, &j) in indices.iter().enumerate() {
        out.column_mut(k).copy_from(&full.column(j));
    }
    out
}
