//! Testing objectives and utilities useful for benchmarking, debugging and
//! smoke testing.
//!
//! The hook builders assemble a minimal [`Hook`] with numeric derivatives, so
//! backends can be exercised without going through the whole pipeline.
//!
//! # References
//!
//! \[1\] [A Literature Survey of Benchmark Functions For Global Optimization
//! Problems](https://arxiv.org/abs/1308.4008)

#![allow(unused)]

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::algo::siman::SimanOptions;
use crate::core::Hook;
use crate::derivatives::{DiffOptions, GradientEstimator, HessianEstimator};
use crate::pipeline::stack::{ConstraintStack, LinearConstraint, StackInputs};
use crate::pipeline::{GradFn, HessFn, ObjFn};

/// The two-dimensional Rosenbrock function; minimum at `(1, 1)`.
pub fn rosenbrock() -> ObjFn {
    Box::new(|x| (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2))
}

/// The sphere function; minimum at the origin.
pub fn sphere() -> ObjFn {
    Box::new(|x| x.iter().map(|v| v * v).sum())
}

/// Forward finite-difference gradient of the given objective.
pub fn numeric_gradient(f: ObjFn, n: usize) -> GradFn {
    let mut estimator = GradientEstimator::new(DiffOptions::plain(n));
    Box::new(move |x| estimator.estimate(&f, x))
}

/// Finite-difference Hessian of the given objective.
pub fn numeric_hessian(f: ObjFn, n: usize) -> HessFn {
    let mut estimator = HessianEstimator::new(DiffOptions::plain(n));
    Box::new(move |x| estimator.estimate(&f, x))
}

fn stack_for_bounds(lower: &DVector<f64>, upper: &DVector<f64>) -> ConstraintStack {
    ConstraintStack::build(
        StackInputs {
            lower: lower.clone(),
            upper: upper.clone(),
            lin_inequc: None,
            lin_equc: None,
            gen_inequc: None,
            gen_equc: None,
        },
        &DVector::zeros(lower.len()),
    )
}

fn hook(f: ObjFn, lower: DVector<f64>, upper: DVector<f64>, hess: Option<HessFn>) -> Hook {
    let n = lower.len();
    let stack = stack_for_bounds(&lower, &upper);

    Hook {
        stack,
        lower,
        upper,
        tol_fun: 1e-9,
        tol_x: 1e-9,
        max_iter: 100,
        max_fract_change: vec![None; n],
        fract_prec: vec![None; n],
        grad: numeric_gradient(f, n),
        hess,
        callbacks: Vec::new(),
        trace_steps: false,
        siman: SimanOptions::default(),
        nobjf: Arc::new(AtomicUsize::new(0)),
    }
}

/// Hook without any constraints and with a numeric gradient.
pub fn unconstrained_hook(f: ObjFn, n: usize) -> Hook {
    hook(
        f,
        DVector::from_element(n, f64::NEG_INFINITY),
        DVector::from_element(n, f64::INFINITY),
        None,
    )
}

/// Hook without any constraints, with a numeric gradient and Hessian of the
/// same objective.
pub fn unconstrained_hook_with_hessian(f: ObjFn, n: usize) -> Hook {
    let n_params = n;
    let shared: Arc<ObjFn> = Arc::new(f);

    let grad_f = Arc::clone(&shared);
    let mut grad_estimator = GradientEstimator::new(DiffOptions::plain(n_params));
    let grad: GradFn = Box::new(move |x| grad_estimator.estimate(&grad_f, x));

    let hess_f = Arc::clone(&shared);
    let mut hess_estimator = HessianEstimator::new(DiffOptions::plain(n_params));
    let hess: HessFn = Box::new(move |x| hess_estimator.estimate(&hess_f, x));

    let mut hook = hook(
        Box::new(move |x| shared(x)),
        DVector::from_element(n_params, f64::NEG_INFINITY),
        DVector::from_element(n_params, f64::INFINITY),
        Some(hess),
    );
    hook.grad = grad;
    hook
}

/// Hook with bound constraints only and a numeric gradient.
pub fn bounded_hook(f: ObjFn, lower: DVector<f64>, upper: DVector<f64>) -> Hook {
    hook(f, lower, upper, None)
}

/// Hook with one optional linear inequality `aᵀx + b >= 0` and one optional
/// linear equality `aᵀx + b = 0`, both built at the given initial point.
pub fn hook_with_stack(
    f: ObjFn,
    x0: &DVector<f64>,
    lin_inequc: Option<(DVector<f64>, f64)>,
    lin_equc: Option<(DVector<f64>, f64)>,
) -> Hook {
    let n = x0.len();
    let lower = DVector::from_element(n, f64::NEG_INFINITY);
    let upper = DVector::from_element(n, f64::INFINITY);

    let linear = |(a, b): (DVector<f64>, f64)| LinearConstraint {
        m: DMatrix::from_column_slice(n, 1, a.as_slice()),
        v: DVector::from_element(1, b),
    };

    let stack = ConstraintStack::build(
        StackInputs {
            lower: lower.clone(),
            upper: upper.clone(),
            lin_inequc: lin_inequc.map(linear),
            lin_equc: lin_equc.map(linear),
            gen_inequc: None,
            gen_equc: None,
        },
        x0,
    );

    let mut hook = hook(f, lower, upper, None);
    hook.stack = stack;
    hook
}
