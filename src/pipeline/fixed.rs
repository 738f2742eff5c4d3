//! Fixed-parameter elimination.
//!
//! Parameters marked as fixed are excluded from optimization and held at
//! their initial values. Every function is rewritten to operate only on the
//! free subspace: full vectors are reconstituted before calling through to
//! the structural layer and derivative matrices are sliced down to the free
//! columns (and, for the Hessian, rows) afterwards.

use log::warn;
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use super::{select_matrix_columns, ConsFn, ConsJacFn, GradFn, HessFn, ObjFn};
use crate::pipeline::stack::LinearConstraint;

/// Error while partitioning parameters into fixed and free.
#[derive(Debug, Error)]
pub enum FixedError {
    /// Every parameter is marked fixed; nothing remains to optimize.
    #[error("at least one parameter must be free")]
    AllFixed,
    /// The fixed mask does not cover the parameter space.
    #[error("fixed mask has {got} entries, expected {expected}")]
    MaskLength {
        /// Expected entry count.
        expected: usize,
        /// Supplied entry count.
        got: usize,
    },
}

/// Partition of the parameter space into fixed and free subsets.
///
/// Fixed values are captured once from the initial parameter vector at
/// partition time and inserted back on every call into user-facing code.
#[derive(Debug, Clone)]
pub struct FixedPartition {
    mask: Vec<bool>,
    free_indices: Vec<usize>,
    initial: DVector<f64>,
}

impl FixedPartition {
    /// Creates the partition, capturing fixed values from the initial vector.
    pub fn new(mask: &[bool], initial: &DVector<f64>) -> Result<Self, FixedError> {
        if mask.len() != initial.len() {
            return Err(FixedError::MaskLength {
                expected: initial.len(),
                got: mask.len(),
            });
        }

        let free_indices: Vec<usize> = (0..mask.len()).filter(|&i| !mask[i]).collect();

        if free_indices.is_empty() {
            return Err(FixedError::AllFixed);
        }

        Ok(Self {
            mask: mask.to_vec(),
            free_indices,
            initial: initial.clone(),
        })
    }

    /// Number of parameters in the full space.
    pub fn n_full(&self) -> usize {
        self.mask.len()
    }

    /// Number of free parameters.
    pub fn n_free(&self) -> usize {
        self.free_indices.len()
    }

    /// Indices of the free parameters in the full space, in ascending order.
    pub fn free_indices(&self) -> &[usize] {
        &self.free_indices
    }

    /// Extracts the free sub-vector from a full vector.
    pub fn restrict(&self, full: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.free_indices.len(),
            self.free_indices.iter().map(|&i| full[i]),
        )
    }

    /// Rebuilds the full vector from a free sub-vector, inserting the captured
    /// fixed values.
    pub fn reconstitute(&self, free: &DVector<f64>) -> DVector<f64> {
        let mut full = self.initial.clone();
        for (k, &i) in self.free_indices.iter().enumerate() {
            full[i] = free[k];
        }
        full
    }

    /// Emits an advisory warning for every fixed parameter lying outside its
    /// declared bounds.
    pub fn warn_fixed_outside_bounds(&self, lower: &DVector<f64>, upper: &DVector<f64>) {
        for i in 0..self.mask.len() {
            if self.mask[i] && (self.initial[i] < lower[i] || self.initial[i] > upper[i]) {
                warn!(
                    "fixed parameter at element {} ({}) lies outside its bounds [{}, {}]",
                    i, self.initial[i], lower[i], upper[i]
                );
            }
        }
    }

    /// Rewrites the objective over the free subspace.
    pub fn wrap_objective(&self, f: ObjFn) -> ObjFn {
        let partition = self.clone();
        Box::new(move |free| f(&partition.reconstitute(free)))
    }

    /// Rewrites a full-space gradient over the free subspace: the full vector
    /// is reconstituted for the call, free entries are selected afterwards.
    pub fn wrap_gradient(&self, mut g: GradFn) -> GradFn {
        let partition = self.clone();
        Box::new(move |free| {
            let full = g(&partition.reconstitute(free));
            partition.restrict(&full)
        })
    }

    /// Rewrites a full-space Hessian over the free subspace, slicing both rows
    /// and columns.
    pub fn wrap_hessian(&self, mut h: HessFn) -> HessFn {
        let partition = self.clone();
        Box::new(move |free| {
            let full = h(&partition.reconstitute(free));
            let cols = select_matrix_columns(&full, partition.free_indices());
            super::select_matrix_rows(&cols, partition.free_indices())
        })
    }

    /// Rewrites a constraint value function over the free subspace. Row
    /// indices pass through untouched.
    pub fn wrap_constraint_values(&self, f: ConsFn) -> ConsFn {
        let partition = self.clone();
        Box::new(move |free, idx| f(&partition.reconstitute(free), idx))
    }

    /// Rewrites a constraint Jacobian over the free subspace, slicing the
    /// columns down to the free parameters.
    pub fn wrap_constraint_jac(&self, mut jac: ConsJacFn) -> ConsJacFn {
        let partition = self.clone();
        Box::new(move |free, idx| {
            let full = jac(&partition.reconstitute(free), idx);
            select_matrix_columns(&full, partition.free_indices())
        })
    }

    /// Reduces a full-space linear constraint to the free subspace.
    ///
    /// The fixed-parameter contribution `M_fixedᵀ · p_fixed` moves into the
    /// offset vector and the fixed rows of the matrix are dropped. Must run
    /// before configuration subsetting, while full-space values are still
    /// around.
    pub fn reduce_linear(&self, constraint: &LinearConstraint) -> LinearConstraint {
        let m = &constraint.m;
        let mut v = constraint.v.clone();

        for k in 0..m.ncols() {
            let mut shift = 0.0;
            for i in 0..self.mask.len() {
                if self.mask[i] {
                    shift += m[(i, k)] * self.initial[i];
                }
            }
            v[k] += shift;
        }

        let mut reduced = DMatrix::zeros(self.free_indices.len(), m.ncols());
        for (row, &i) in self.free_indices.iter().enumerate() {
            reduced.row_mut(row).copy_from(&m.row(i));
        }

        LinearConstraint { m: reduced, v }
    }
}
