//! Structural adapter: flat-vector arguments for structured user functions.
//!
//! Every user-supplied function (objective, gradient, Hessian, constraint
//! values, constraint Jacobians) is independently either flat or structured.
//! The wrappers produced here convert the internal flat vector to the named
//! form before calling through and convert structured return values back to
//! flat, concatenating blocks in layout order. This is the only place that
//! switches on the representation; everything downstream sees flat vectors.

use nalgebra::{Complex, DMatrix, DVector};

use super::{select_matrix_rows, select_rows, ConsFn, ConsJacFn, GradFn, HessFn, ObjFn};
use crate::core::{Layout, NamedBlocks};

/// User-supplied objective function.
pub enum Objective {
    /// Objective over the flat parameter vector.
    Flat(Box<dyn Fn(&DVector<f64>) -> f64 + Send + Sync>),
    /// Objective over the named-block structure.
    Named(Box<dyn Fn(&NamedBlocks) -> f64 + Send + Sync>),
}

impl Objective {
    /// Wraps a flat objective closure.
    pub fn flat(f: impl Fn(&DVector<f64>) -> f64 + Send + Sync + 'static) -> Self {
        Objective::Flat(Box::new(f))
    }

    /// Wraps a structured objective closure.
    pub fn named(f: impl Fn(&NamedBlocks) -> f64 + Send + Sync + 'static) -> Self {
        Objective::Named(Box::new(f))
    }
}

/// User-supplied analytic gradient of the objective.
pub enum Gradient {
    /// Gradient returning the flat vector directly.
    Flat(Box<dyn Fn(&DVector<f64>) -> DVector<f64> + Send + Sync>),
    /// Gradient over the named structure, returning per-name blocks which are
    /// concatenated in layout order.
    Named(Box<dyn Fn(&NamedBlocks) -> NamedBlocks + Send + Sync>),
}

impl Gradient {
    /// Wraps a flat gradient closure.
    pub fn flat(f: impl Fn(&DVector<f64>) -> DVector<f64> + Send + Sync + 'static) -> Self {
        Gradient::Flat(Box::new(f))
    }

    /// Wraps a structured gradient closure.
    pub fn named(f: impl Fn(&NamedBlocks) -> NamedBlocks + Send + Sync + 'static) -> Self {
        Gradient::Named(Box::new(f))
    }
}

/// Structured Hessian return value: per-name-pair blocks.
///
/// Only one triangle needs to be supplied; a missing `(a, b)` entry is
/// reflected from the transpose of the `(b, a)` entry.
#[derive(Default)]
pub struct PairTable {
    entries: Vec<(String, String, DMatrix<f64>)>,
}

impl PairTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the block for a name pair.
    pub fn insert(&mut self, row: impl Into<String>, col: impl Into<String>, block: DMatrix<f64>) {
        self.entries.push((row.into(), col.into(), block));
    }

    /// Returns the block for a name pair, if supplied.
    pub fn get(&self, row: &str, col: &str) -> Option<&DMatrix<f64>> {
        self.entries
            .iter()
            .find(|(r, c, _)| r == row && c == col)
            .map(|(_, _, b)| b)
    }
}

/// User-supplied analytic Hessian of the objective.
pub enum Hessian {
    /// Hessian returning the flat matrix directly.
    Flat(Box<dyn Fn(&DVector<f64>) -> DMatrix<f64> + Send + Sync>),
    /// Hessian over the named structure, returning a per-name-pair table.
    Named(Box<dyn Fn(&NamedBlocks) -> PairTable + Send + Sync>),
}

impl Hessian {
    /// Wraps a flat Hessian closure.
    pub fn flat(f: impl Fn(&DVector<f64>) -> DMatrix<f64> + Send + Sync + 'static) -> Self {
        Hessian::Flat(Box::new(f))
    }

    /// Wraps a structured Hessian closure.
    pub fn named(f: impl Fn(&NamedBlocks) -> PairTable + Send + Sync + 'static) -> Self {
        Hessian::Named(Box::new(f))
    }
}

/// User-supplied constraint value function.
///
/// The index-aware variant receives the requested row indices and may compute
/// only those rows; the other variants are post-filtered by the adapter.
pub enum ConstraintValues {
    /// Constraint values over the flat parameter vector.
    Flat(Box<dyn Fn(&DVector<f64>) -> DVector<f64> + Send + Sync>),
    /// Index-aware constraint values over the flat parameter vector, together
    /// with the total row count. The function may compute only the requested
    /// rows.
    FlatIndexed(
        usize,
        Box<dyn Fn(&DVector<f64>, &[usize]) -> DVector<f64> + Send + Sync>,
    ),
    /// Constraint values over the named structure.
    Named(Box<dyn Fn(&NamedBlocks) -> DVector<f64> + Send + Sync>),
}

/// User-supplied constraint Jacobian function.
///
/// Return value has one row per constraint and one column per (full-space)
/// parameter. Column slicing down to the active parameter subset is applied by
/// later stages regardless of the variant, since the raw user Jacobian has no
/// notion of active columns.
pub enum ConstraintJac {
    /// Jacobian over the flat parameter vector.
    Flat(Box<dyn Fn(&DVector<f64>) -> DMatrix<f64> + Send + Sync>),
    /// Index-aware Jacobian over the flat parameter vector.
    FlatIndexed(Box<dyn Fn(&DVector<f64>, &[usize]) -> DMatrix<f64> + Send + Sync>),
    /// Jacobian over the named structure.
    Named(Box<dyn Fn(&NamedBlocks) -> DMatrix<f64> + Send + Sync>),
}

/// A general (nonlinear) constraint: a value function with an optional
/// analytic or complex-step Jacobian.
pub struct ConstraintFn {
    /// The constraint value function.
    pub values: ConstraintValues,
    /// Optional analytic Jacobian.
    pub jacobian: Option<ConstraintJac>,
    /// Optional complex-step capable value function used for Jacobian
    /// estimation with higher accuracy.
    pub complex_step: Option<ComplexVectorFn>,
}

/// Complex-step capable scalar function.
pub type ComplexScalarFn = Box<dyn Fn(&DVector<Complex<f64>>) -> Complex<f64> + Send + Sync>;

/// Complex-step capable vector function.
pub type ComplexVectorFn =
    Box<dyn Fn(&DVector<Complex<f64>>) -> DVector<Complex<f64>> + Send + Sync>;

impl ConstraintFn {
    /// Creates a constraint from a flat value function only.
    pub fn new(f: impl Fn(&DVector<f64>) -> DVector<f64> + Send + Sync + 'static) -> Self {
        Self {
            values: ConstraintValues::Flat(Box::new(f)),
            jacobian: None,
            complex_step: None,
        }
    }

    /// Creates a constraint from a flat value function and its Jacobian.
    pub fn with_jacobian(
        f: impl Fn(&DVector<f64>) -> DVector<f64> + Send + Sync + 'static,
        jac: impl Fn(&DVector<f64>) -> DMatrix<f64> + Send + Sync + 'static,
    ) -> Self {
        Self {
            values: ConstraintValues::Flat(Box::new(f)),
            jacobian: Some(ConstraintJac::Flat(Box::new(jac))),
            complex_step: None,
        }
    }
}

/// Adapts the user objective to the flat interface.
pub fn adapt_objective(layout: &Layout, objective: Objective) -> ObjFn {
    match objective {
        Objective::Flat(f) => f,
        Objective::Named(f) => {
            let layout = layout.clone();
            Box::new(move |x| f(&layout.unflatten_named(x)))
        }
    }
}

/// Adapts the user gradient to the flat interface.
///
/// A structured gradient must return a block for every declared name with the
/// declared dimension; violations are contract breaches of the user function
/// and panic with a descriptive message.
pub fn adapt_gradient(layout: &Layout, gradient: Gradient) -> GradFn {
    match gradient {
        Gradient::Flat(f) => Box::new(move |x| f(x)),
        Gradient::Named(f) => {
            let layout = layout.clone();
            Box::new(move |x| {
                let blocks = f(&layout.unflatten_named(x));
                layout
                    .flatten_named(&blocks)
                    .expect("structured gradient must return every declared parameter block")
            })
        }
    }
}

/// Adapts the user Hessian to the flat interface.
///
/// For the structured variant the full matrix is assembled from the
/// per-name-pair table; entries missing in one triangle are reflected from
/// their transpose position.
pub fn adapt_hessian(layout: &Layout, hessian: Hessian) -> HessFn {
    match hessian {
        Hessian::Flat(f) => Box::new(move |x| f(x)),
        Hessian::Named(f) => {
            let layout = layout.clone();
            Box::new(move |x| {
                let table = f(&layout.unflatten_named(x));
                assemble_hessian(&layout, &table)
            })
        }
    }
}

fn assemble_hessian(layout: &Layout, table: &PairTable) -> DMatrix<f64> {
    let np = layout.np();
    let names = layout.names();
    let mut hes = DMatrix::zeros(np, np);

    for (i, row_name) in names.iter().enumerate() {
        let rows = layout.range_of(i);
        for (j, col_name) in names.iter().enumerate() {
            let cols = layout.range_of(j);

            let block = if let Some(block) = table.get(row_name, col_name) {
                block.clone()
            } else if let Some(block) = table.get(col_name, row_name) {
                block.transpose()
            } else {
                panic!(
                    "structured Hessian supplies neither ({row_name}, {col_name}) \
                     nor its transpose position"
                );
            };

            assert_eq!(
                (block.nrows(), block.ncols()),
                (rows.len(), cols.len()),
                "structured Hessian block ({row_name}, {col_name}) has wrong shape"
            );

            hes.view_mut((rows.start, cols.start), (rows.len(), cols.len()))
                .copy_from(&block);
        }
    }

    hes
}

/// Adapts a constraint value function to the indexed flat interface.
///
/// Index-oblivious functions are post-filtered by the requested row set.
pub fn adapt_constraint_values(layout: &Layout, values: ConstraintValues) -> ConsFn {
    match values {
        ConstraintValues::FlatIndexed(rows, f) => {
            let all: Vec<usize> = (0..rows).collect();
            Box::new(move |x, idx| match idx {
                Some(idx) => f(x, idx),
                None => f(x, &all),
            })
        }
        ConstraintValues::Flat(f) => Box::new(move |x, idx| {
            let full = f(x);
            match idx {
                Some(idx) => select_rows(&full, idx),
                None => full,
            }
        }),
        ConstraintValues::Named(f) => {
            let layout = layout.clone();
            Box::new(move |x, idx| {
                let full = f(&layout.unflatten_named(x));
                match idx {
                    Some(idx) => select_rows(&full, idx),
                    None => full,
                }
            })
        }
    }
}

/// Adapts a constraint Jacobian function to the indexed flat interface.
///
/// Row filtering follows the same rules as for values. Column slicing down to
/// the active parameter subset is applied by the fixed-parameter stage, which
/// is why the produced function still spans all full-space columns.
pub fn adapt_constraint_jac(
    layout: &Layout,
    jacobian: ConstraintJac,
    rows: usize,
) -> ConsJacFn {
    match jacobian {
        ConstraintJac::FlatIndexed(f) => {
            let all: Vec<usize> = (0..rows).collect();
            Box::new(move |x, idx| match idx {
                Some(idx) => f(x, idx),
                None => f(x, &all),
            })
        }
        ConstraintJac::Flat(f) => Box::new(move |x, idx| {
            let full = f(x);
            match idx {
                Some(idx) => select_matrix_rows(&full, idx),
                None => full,
            }
        }),
        ConstraintJac::Named(f) => {
            let layout = layout.clone();
            Box::new(move |x, idx| {
                let full = f(&layout.unflatten_named(x));
                match idx {
                    Some(idx) => select_matrix_rows(&full, idx),
                    None => full,
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};

    use crate::core::NamedBlocks;

    fn xy_layout() -> Layout {
        Layout::from_order(vec!["x".into(), "y".into()], Some(vec![2, 1])).unwrap()
    }

    #[test]
    fn structured_objective_sees_named_blocks() {
        let layout = xy_layout();
        let f = adapt_objective(
            &layout,
            Objective::named(|p: &NamedBlocks| {
                let x = p.get("x").unwrap();
                let y = p.get("y").unwrap();
                x[0] + 2.0 * x[1] + 3.0 * y[0]
            }),
        );

        assert_abs_diff_eq!(f(&dvector![1.0, 2.0, 3.0]), 14.0);
    }

    #[test]
    fn structured_gradient_is_flattened_in_layout_order() {
        let layout = xy_layout();
        let mut g = adapt_gradient(
            &layout,
            Gradient::named(|_| {
                let mut blocks = NamedBlocks::new();
                blocks.push("x", dvector![1.0, 2.0]);
                blocks.push("y", dvector![3.0]);
                blocks
            }),
        );

        assert_eq!(g(&dvector![0.0, 0.0, 0.0]), dvector![1.0, 2.0, 3.0]);
    }

    #[test]
    fn structured_hessian_reflects_missing_triangle() {
        let layout = xy_layout();
        let mut h = adapt_hessian(
            &layout,
            Hessian::named(|_| {
                let mut table = PairTable::new();
                table.insert("x", "x", dmatrix![2.0, 1.0; 1.0, 2.0]);
                table.insert("y", "y", dmatrix![4.0]);
                // Only the (x, y) block is supplied; (y, x) must be reflected.
                table.insert("x", "y", dmatrix![5.0; 6.0]);
                table
            }),
        );

        let hes = h(&dvector![0.0, 0.0, 0.0]);
        let expected = dmatrix![
            2.0, 1.0, 5.0;
            1.0, 2.0, 6.0;
            5.0, 6.0, 4.0
        ];
        assert_abs_diff_eq!(hes, expected);
    }

    #[test]
    fn index_oblivious_constraint_is_post_filtered() {
        let layout = Layout::anonymous(2).unwrap();
        let f = adapt_constraint_values(
            &layout,
            ConstraintValues::Flat(Box::new(|x| dvector![x[0], x[1], x[0] + x[1]])),
        );

        let x = dvector![1.0, 2.0];
        assert_eq!(f(&x, None), dvector![1.0, 2.0, 3.0]);
        assert_eq!(f(&x, Some(&[2, 0])), dvector![3.0, 1.0]);
    }

    #[test]
    fn index_aware_constraint_receives_requested_rows() {
        let layout = Layout::anonymous(1).unwrap();
        let f = adapt_constraint_values(
            &layout,
            ConstraintValues::FlatIndexed(
                3,
                Box::new(|x: &DVector<f64>, idx: &[usize]| {
                    DVector::from_iterator(idx.len(), idx.iter().map(|&i| x[0] * (i as f64 + 1.0)))
                }),
            ),
        );

        let x = dvector![2.0];
        assert_eq!(f(&x, None), dvector![2.0, 4.0, 6.0]);
        assert_eq!(f(&x, Some(&[1])), dvector![4.0]);
    }

    #[test]
    fn jacobian_rows_are_filtered() {
        let layout = Layout::anonymous(2).unwrap();
        let mut jac = adapt_constraint_jac(
            &layout,
            ConstraintJac::Flat(Box::new(|_| dmatrix![1.0, 0.0; 0.0, 1.0; 1.0, 1.0])),
            3,
        );

        let x = dvector![0.0, 0.0];
        let j = jac(&x, Some(&[2]));
        assert_eq!(j, dmatrix![1.0, 1.0]);
    }
}
