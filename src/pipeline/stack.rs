//! Constraint stacking.
//!
//! Bounds, linear constraints and general (nonlinear) constraints are
//! concatenated into one stacked constraint-value function and one stacked
//! constraint-Jacobian function over the free parameter space, with the
//! equality provenance of every row tracked in a mask.
//!
//! The row order is fixed: bound inequalities, linear inequalities, linear
//! equalities, general inequalities, general equalities. The feasibility
//! convention for inequality rows is `value >= 0`.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use super::{ConsFn, ConsJacFn};

/// Error while assembling constraints.
#[derive(Debug, Error)]
pub enum StackError {
    /// The linear constraint matrix and offset vector disagree in size.
    #[error("linear constraint matrix has {cols} columns but the offset vector has {len} elements")]
    OffsetMismatch {
        /// Column count of the matrix (one column per constraint).
        cols: usize,
        /// Element count of the offset vector.
        len: usize,
    },
    /// The linear constraint matrix does not span the parameter space.
    #[error("linear constraint matrix has {rows} rows, expected {expected} (one per parameter)")]
    RowMismatch {
        /// Row count of the matrix.
        rows: usize,
        /// Expected row count.
        expected: usize,
    },
}

/// A linear constraint in matrix form: `value = Mᵀp + v`, one column of `M`
/// (and one element of `v`) per constraint row.
#[derive(Debug, Clone)]
pub struct LinearConstraint {
    /// Constraint matrix, `np × k`.
    pub m: DMatrix<f64>,
    /// Offset vector of length `k`.
    pub v: DVector<f64>,
}

impl LinearConstraint {
    /// Creates the constraint, validating the shapes.
    pub fn new(m: DMatrix<f64>, v: DVector<f64>) -> Result<Self, StackError> {
        if m.ncols() != v.len() {
            return Err(StackError::OffsetMismatch {
                cols: m.ncols(),
                len: v.len(),
            });
        }
        Ok(Self { m, v })
    }

    /// Number of constraint rows.
    pub fn count(&self) -> usize {
        self.v.len()
    }

    /// Evaluates all constraint rows at the given point.
    pub fn values(&self, p: &DVector<f64>) -> DVector<f64> {
        self.m.transpose() * p + &self.v
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundKind {
    Lower,
    Upper,
}

/// One stacked bound row: `p_i - lb_i >= 0` or `ub_i - p_i >= 0`.
#[derive(Debug, Clone, Copy)]
struct BoundRow {
    index: usize,
    kind: BoundKind,
    bound: f64,
}

impl BoundRow {
    fn value(&self, p: &DVector<f64>) -> f64 {
        match self.kind {
            BoundKind::Lower => p[self.index] - self.bound,
            BoundKind::Upper => self.bound - p[self.index],
        }
    }

    fn gradient_entry(&self) -> f64 {
        match self.kind {
            BoundKind::Lower => 1.0,
            BoundKind::Upper => -1.0,
        }
    }
}

/// Row counts of the individual stacked segments, in stacking order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackCounts {
    /// Bound-derived inequality rows.
    pub bounds: usize,
    /// User linear inequality rows.
    pub lin_inequc: usize,
    /// User linear equality rows.
    pub lin_equc: usize,
    /// General inequality rows.
    pub gen_inequc: usize,
    /// General equality rows.
    pub gen_equc: usize,
}

impl StackCounts {
    /// Total stacked row count.
    pub fn total(&self) -> usize {
        self.bounds + self.lin_inequc + self.lin_equc + self.gen_inequc + self.gen_equc
    }
}

#[derive(Clone)]
struct Segmentation {
    bounds: Vec<BoundRow>,
    lin_inequc: Option<LinearConstraint>,
    lin_equc: Option<LinearConstraint>,
    counts: StackCounts,
    n_free: usize,
}

impl Segmentation {
    // Segment starts in the stacked row space.
    fn starts(&self) -> [usize; 5] {
        let c = &self.counts;
        let s0 = 0;
        let s1 = s0 + c.bounds;
        let s2 = s1 + c.lin_inequc;
        let s3 = s2 + c.lin_equc;
        let s4 = s3 + c.gen_inequc;
        [s0, s1, s2, s3, s4]
    }

    fn linear_value(&self, constraint: &LinearConstraint, local: usize, p: &DVector<f64>) -> f64 {
        constraint.m.column(local).dot(p) + constraint.v[local]
    }
}

/// Inputs of the stacking stage, all already reduced to the free subspace.
pub struct StackInputs {
    /// Lower bounds of the free parameters.
    pub lower: DVector<f64>,
    /// Upper bounds of the free parameters.
    pub upper: DVector<f64>,
    /// User linear inequality constraints.
    pub lin_inequc: Option<LinearConstraint>,
    /// User linear equality constraints.
    pub lin_equc: Option<LinearConstraint>,
    /// General inequality constraints with their Jacobian and row count.
    pub gen_inequc: Option<(ConsFn, ConsJacFn, usize)>,
    /// General equality constraints with their Jacobian and row count.
    pub gen_equc: Option<(ConsFn, ConsJacFn, usize)>,
}

/// The stacked constraint set: one value function, one Jacobian function and
/// the per-row equality provenance.
pub struct ConstraintStack {
    f: ConsFn,
    df: ConsJacFn,
    eq_mask: Vec<bool>,
    counts: StackCounts,
    initial_values: DVector<f64>,
}

impl ConstraintStack {
    /// Builds the stack and records the constraint values at the initial
    /// point.
    pub fn build(inputs: StackInputs, x0: &DVector<f64>) -> Self {
        let StackInputs {
            lower,
            upper,
            lin_inequc,
            lin_equc,
            gen_inequc,
            gen_equc,
        } = inputs;

        let n_free = lower.len();

        let mut bounds = Vec::new();
        for i in 0..n_free {
            if lower[i].is_finite() {
                bounds.push(BoundRow {
                    index: i,
                    kind: BoundKind::Lower,
                    bound: lower[i],
                });
            }
        }
        for i in 0..n_free {
            if upper[i].is_finite() {
                bounds.push(BoundRow {
                    index: i,
                    kind: BoundKind::Upper,
                    bound: upper[i],
                });
            }
        }

        let (gen_in_f, gen_in_jac, gen_in_rows) = match gen_inequc {
            Some((f, jac, rows)) => (Some(f), Some(jac), rows),
            None => (None, None, 0),
        };
        let (gen_eq_f, gen_eq_jac, gen_eq_rows) = match gen_equc {
            Some((f, jac, rows)) => (Some(f), Some(jac), rows),
            None => (None, None, 0),
        };

        let counts = StackCounts {
            bounds: bounds.len(),
            lin_inequc: lin_inequc.as_ref().map_or(0, LinearConstraint::count),
            lin_equc: lin_equc.as_ref().map_or(0, LinearConstraint::count),
            gen_inequc: gen_in_rows,
            gen_equc: gen_eq_rows,
        };

        let mut eq_mask = vec![false; counts.bounds + counts.lin_inequc];
        eq_mask.extend(std::iter::repeat(true).take(counts.lin_equc));
        eq_mask.extend(std::iter::repeat(false).take(counts.gen_inequc));
        eq_mask.extend(std::iter::repeat(true).take(counts.gen_equc));

        let segmentation = Segmentation {
            bounds,
            lin_inequc,
            lin_equc,
            counts,
            n_free,
        };

        let f = stacked_values(segmentation.clone(), gen_in_f, gen_eq_f);
        let df = stacked_jacobian(segmentation, gen_in_jac, gen_eq_jac);

        let initial_values = f(x0, None);

        Self {
            f,
            df,
            eq_mask,
            counts,
            initial_values,
        }
    }

    /// Evaluates the stacked constraint rows (all of them for `None`).
    pub fn values(&self, p: &DVector<f64>, idx: Option<&[usize]>) -> DVector<f64> {
        (self.f)(p, idx)
    }

    /// Evaluates the stacked constraint Jacobian rows (all of them for
    /// `None`); one column per free parameter.
    pub fn jacobian(&mut self, p: &DVector<f64>, idx: Option<&[usize]>) -> DMatrix<f64> {
        (self.df)(p, idx)
    }

    /// Per-row equality provenance of the stacked rows.
    pub fn eq_mask(&self) -> &[bool] {
        &self.eq_mask
    }

    /// Row counts per stacked segment.
    pub fn counts(&self) -> StackCounts {
        self.counts
    }

    /// Total stacked row count.
    pub fn count(&self) -> usize {
        self.counts.total()
    }

    /// Determines whether there are no constraint rows at all.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Constraint values recorded at the initial parameter point.
    pub fn initial_values(&self) -> &DVector<f64> {
        &self.initial_values
    }
}

fn stacked_values(
    seg: Segmentation,
    gen_in: Option<ConsFn>,
    gen_eq: Option<ConsFn>,
) -> ConsFn {
    Box::new(move |p, idx| {
        let starts = seg.starts();
        let total = seg.counts.total();

        match idx {
            None => {
                let mut out = DVector::zeros(total);
                let mut row = 0;

                for bound in &seg.bounds {
                    out[row] = bound.value(p);
                    row += 1;
                }
                if let Some(lin) = &seg.lin_inequc {
                    out.rows_mut(row, lin.count()).copy_from(&lin.values(p));
                    row += lin.count();
                }
                if let Some(lin) = &seg.lin_equc {
                    out.rows_mut(row, lin.count()).copy_from(&lin.values(p));
                    row += lin.count();
                }
                if let Some(f) = &gen_in {
                    let values = f(p, None);
                    out.rows_mut(row, values.len()).copy_from(&values);
                    row += values.len();
                }
                if let Some(f) = &gen_eq {
                    let values = f(p, None);
                    out.rows_mut(row, values.len()).copy_from(&values);
                    row += values.len();
                }
                debug_assert_eq!(row, total);

                out
            }
            Some(idx) => {
                // Batch the general rows so index-aware user functions are
                // called once per segment, then interleave back positionally.
                let gen_in_local: Vec<usize> = idx
                    .iter()
                    .filter(|&&r| r >= starts[3] && r < starts[4])
                    .map(|&r| r - starts[3])
                    .collect();
                let gen_eq_local: Vec<usize> = idx
                    .iter()
                    .filter(|&&r| r >= starts[4])
                    .map(|&r| r - starts[4])
                    .collect();

                let gen_in_values = gen_in
                    .as_ref()
                    .filter(|_| !gen_in_local.is_empty())
                    .map(|f| f(p, Some(&gen_in_local)));
                let gen_eq_values = gen_eq
                    .as_ref()
                    .filter(|_| !gen_eq_local.is_empty())
                    .map(|f| f(p, Some(&gen_eq_local)));

                let mut gen_in_next = 0;
                let mut gen_eq_next = 0;

                DVector::from_iterator(
                    idx.len(),
                    idx.iter().map(|&r| {
                        if r < starts[1] {
                            seg.bounds[r].value(p)
                        } else if r < starts[2] {
                            let lin = seg.lin_inequc.as_ref().expect("segment present");
                            seg.linear_value(lin, r - starts[1], p)
                        } else if r < starts[3] {
                            let lin = seg.lin_equc.as_ref().expect("segment present");
                            seg.linear_value(lin, r - starts[2], p)
                        } else if r < starts[4] {
                            let values = gen_in_values.as_ref().expect("segment present");
                            let value = values[gen_in_next];
                            gen_in_next += 1;
                            value
                        } else {
                            let values = gen_eq_values.as_ref().expect("segment present");
                            let value = values[gen_eq_next];
                            gen_eq_next += 1;
                            value
                        }
                    }),
                )
            }
        }
    })
}

fn stacked_jacobian(
    seg: Segmentation,
    mut gen_in: Option<ConsJacFn>,
    mut gen_eq: Option<ConsJacFn>,
) -> ConsJacFn {
    Box::new(move |p, idx| {
        let starts = seg.starts();
        let n_free = seg.n_free;

        let requested: Vec<usize> = match idx {
            Some(idx) => idx.to_vec(),
            None => (0..seg.counts.total()).collect(),
        };

        let gen_in_local: Vec<usize> = requested
            .iter()
            .filter(|&&r| r >= starts[3] && r < starts[4])
            .map(|&r| r - starts[3])
            .collect();
        let gen_eq_local: Vec<usize> = requested
            .iter()
            .filter(|&&r| r >= starts[4])
            .map(|&r| r - starts[4])
            .collect();

        let gen_in_rows = match gen_in.as_mut() {
            Some(jac) if !gen_in_local.is_empty() => Some(jac(p, Some(&gen_in_local))),
            _ => None,
        };
        let gen_eq_rows = match gen_eq.as_mut() {
            Some(jac) if !gen_eq_local.is_empty() => Some(jac(p, Some(&gen_eq_local))),
            _ => None,
        };

        let mut out = DMatrix::zeros(requested.len(), n_free);
        let mut gen_in_next = 0;
        let mut gen_eq_next = 0;

        for (k, &r) in requested.iter().enumerate() {
            if r < starts[1] {
                let bound = &seg.bounds[r];
                out[(k, bound.index)] = bound.gradient_entry();
            } else if r < starts[2] {
                let lin = seg.lin_inequc.as_ref().expect("segment present");
                out.row_mut(k)
                    .copy_from(&lin.m.column(r - starts[1]).transpose());
            } else if r < starts[3] {
                let lin = seg.lin_equc.as_ref().expect("segment present");
                out.row_mut(k)
                    .copy_from(&lin.m.column(r - starts[2]).transpose());
            } else if r < starts[4] {
                let rows = gen_in_rows.as_ref().expect("segment present");
                out.row_mut(k).copy_from(&rows.row(gen_in_next));
                gen_in_next += 1;
            } else {
                let rows = gen_eq_rows.as_ref().expect("segment present");
                out.row_mut(k).copy_from(&rows.row(gen_eq_next));
                gen_eq_next += 1;
            }
        }

        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};

    fn bounded_stack() -> ConstraintStack {
        ConstraintStack::build(
            StackInputs {
                lower: dvector![-1.0, f64::NEG_INFINITY],
                upper: dvector![2.0, 5.0],
                lin_inequc: None,
                lin_equc: None,
                gen_inequc: None,
                gen_equc: None,
            },
            &dvector![0.0, 0.0],
        )
    }

    #[test]
    fn bound_rows_are_zero_on_the_boundary() {
        let stack = bounded_stack();

        // Rows: p0 - (-1) >= 0, 2 - p0 >= 0, 5 - p1 >= 0.
        assert_eq!(stack.count(), 3);

        let at_lower = stack.values(&dvector![-1.0, 0.0], None);
        assert_abs_diff_eq!(at_lower[0], 0.0);

        let at_upper = stack.values(&dvector![2.0, 5.0], None);
        assert_abs_diff_eq!(at_upper[1], 0.0);
        assert_abs_diff_eq!(at_upper[2], 0.0);
    }

    #[test]
    fn bound_rows_are_negative_outside() {
        let stack = bounded_stack();

        let outside = stack.values(&dvector![-1.5, 6.0], None);
        assert!(outside[0] < 0.0);
        assert!(outside[2] < 0.0);
    }

    #[test]
    fn infinite_bounds_produce_no_rows() {
        let stack = ConstraintStack::build(
            StackInputs {
                lower: dvector![f64::NEG_INFINITY, f64::NEG_INFINITY],
                upper: dvector![f64::INFINITY, f64::INFINITY],
                lin_inequc: None,
                lin_equc: None,
                gen_inequc: None,
                gen_equc: None,
            },
            &dvector![0.0, 0.0],
        );

        assert!(stack.is_empty());
    }

    fn full_stack() -> ConstraintStack {
        // Free space of dimension 2, one bound row (p0 >= 0), one linear
        // inequality (p0 + p1 - 1 >= 0), one linear equality (p0 - p1 = 0),
        // one general inequality (p0² >= 0 is trivially feasible, row value
        // p0²), one general equality (p1² - 1 = 0).
        let gen_in: ConsFn = Box::new(|p, idx| {
            let full = dvector![p[0] * p[0]];
            match idx {
                Some(idx) => crate::pipeline::select_rows(&full, idx),
                None => full,
            }
        });
        let gen_in_jac: ConsJacFn = Box::new(|p, _| dmatrix![2.0 * p[0], 0.0]);
        let gen_eq: ConsFn = Box::new(|p, idx| {
            let full = dvector![p[1] * p[1] - 1.0];
            match idx {
                Some(idx) => crate::pipeline::select_rows(&full, idx),
                None => full,
            }
        });
        let gen_eq_jac: ConsJacFn = Box::new(|p, _| dmatrix![0.0, 2.0 * p[1]]);

        ConstraintStack::build(
            StackInputs {
                lower: dvector![0.0, f64::NEG_INFINITY],
                upper: dvector![f64::INFINITY, f64::INFINITY],
                lin_inequc: Some(
                    LinearConstraint::new(dmatrix![1.0; 1.0], dvector![-1.0]).unwrap(),
                ),
                lin_equc: Some(
                    LinearConstraint::new(dmatrix![1.0; -1.0], dvector![0.0]).unwrap(),
                ),
                gen_inequc: Some((gen_in, gen_in_jac, 1)),
                gen_equc: Some((gen_eq, gen_eq_jac, 1)),
            },
            &dvector![2.0, 3.0],
        )
    }

    #[test]
    fn row_order_and_eq_mask_match_the_documented_layout() {
        let stack = full_stack();

        assert_eq!(
            stack.counts(),
            StackCounts {
                bounds: 1,
                lin_inequc: 1,
                lin_equc: 1,
                gen_inequc: 1,
                gen_equc: 1,
            }
        );

        // Equality rows are exactly the trailing linear-equality block and
        // the trailing general-equality block.
        assert_eq!(stack.eq_mask(), &[false, false, true, false, true]);
        assert_eq!(stack.eq_mask().iter().filter(|&&e| e).count(), 2);
    }

    #[test]
    fn stacked_values_follow_row_order() {
        let stack = full_stack();

        let p = dvector![2.0, 3.0];
        let values = stack.values(&p, None);

        assert_abs_diff_eq!(values[0], 2.0); // p0 - 0
        assert_abs_diff_eq!(values[1], 4.0); // p0 + p1 - 1
        assert_abs_diff_eq!(values[2], -1.0); // p0 - p1
        assert_abs_diff_eq!(values[3], 4.0); // p0²
        assert_abs_diff_eq!(values[4], 8.0); // p1² - 1
    }

    #[test]
    fn initial_values_are_recorded() {
        let stack = full_stack();
        assert_abs_diff_eq!(
            stack.initial_values(),
            &dvector![2.0, 4.0, -1.0, 4.0, 8.0]
        );
    }

    #[test]
    fn row_subset_is_returned_in_requested_order() {
        let stack = full_stack();

        let p = dvector![2.0, 3.0];
        let subset = stack.values(&p, Some(&[4, 0, 2]));
        assert_abs_diff_eq!(subset, dvector![8.0, 2.0, -1.0]);
    }

    #[test]
    fn jacobian_rows_match_the_segments() {
        let mut stack = full_stack();

        let p = dvector![2.0, 3.0];
        let jac = stack.jacobian(&p, None);

        let expected = dmatrix![
            1.0, 0.0;   // bound row on p0
            1.0, 1.0;   // linear inequality
            1.0, -1.0;  // linear equality
            4.0, 0.0;   // d(p0²)
            0.0, 6.0    // d(p1² - 1)
        ];
        assert_abs_diff_eq!(jac, expected);
    }

    #[test]
    fn linear_shape_validation() {
        assert!(matches!(
            LinearConstraint::new(dmatrix![1.0; 1.0], dvector![0.0, 0.0]),
            Err(StackError::OffsetMismatch { cols: 1, len: 2 })
        ));
    }
}
