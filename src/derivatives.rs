//! Numeric differentiation of the objective and the constraints.
//!
//! Derivatives that the user does not supply analytically are estimated by
//! finite differences with scale-aware step sizes, or by the complex-step
//! method when a complex-capable function is available. All estimators honor
//! per-element step overrides, one-sided restrictions and parameter bounds.

use std::collections::HashMap;
use std::thread;

use nalgebra::{Complex, DMatrix, DVector};

use crate::core::FinDiffType;
use crate::pipeline::{ConsFn, ObjFn};

/// Square root of double precision machine epsilon. This value is a standard
/// constant for epsilons in approximating first-order derivate-based concepts.
pub const EPSILON_SQRT: f64 = 0.000000014901161193847656;

/// Cubic root of double precision machine epsilon. This value is a standard
/// constant for epsilons in approximating second-order derivate-based concepts.
pub const EPSILON_CBRT: f64 = 0.0000060554544523933395;

/// Default imaginary perturbation for complex-step differentiation.
pub const DEFAULT_CSTEP: f64 = 1e-20;

/// Memoization cache for function evaluations during differentiation.
///
/// Keyed by the exact bit pattern of the evaluation point, so only repeated
/// evaluations at identical points are merged. Each estimator owns its cache;
/// a cache is never shared across threads.
#[derive(Debug)]
pub struct EvalCache<T> {
    map: HashMap<Vec<u64>, T>,
}

impl<T: Clone> EvalCache<T> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Drops all memoized evaluations.
    pub fn reset(&mut self) {
        self.map.clear();
    }

    /// Number of memoized evaluations.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines whether the cache holds no evaluations.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn get(&self, x: &DVector<f64>) -> Option<T> {
        self.map.get(&key(x)).cloned()
    }

    fn insert(&mut self, x: &DVector<f64>, value: T) {
        self.map.insert(key(x), value);
    }

    fn get_or_insert_with(&mut self, x: &DVector<f64>, eval: impl FnOnce() -> T) -> T {
        if let Some(value) = self.get(x) {
            return value;
        }
        let value = eval();
        self.insert(x, value.clone());
        value
    }
}

impl<T: Clone> Default for EvalCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn key(x: &DVector<f64>) -> Vec<u64> {
    x.iter().map(|v| v.to_bits()).collect()
}

/// Per-element finite-difference policy.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Relative step factor per element (`None` uses the default for the
    /// derivative order).
    pub diffp: Vec<Option<f64>>,
    /// Elements restricted to one-sided probing.
    pub diff_onesided: Vec<bool>,
    /// Typical magnitude per element, used in place of near-zero values.
    pub typical_x: Vec<Option<f64>>,
    /// Lower bounds probes must respect.
    pub lower: DVector<f64>,
    /// Upper bounds probes must respect.
    pub upper: DVector<f64>,
    /// Forward or central differences.
    pub kind: FinDiffType,
    /// Evaluate independent probes on separate threads.
    pub parallel: bool,
}

impl DiffOptions {
    /// Unconstrained forward differences with default steps.
    pub fn plain(n: usize) -> Self {
        Self {
            diffp: vec![None; n],
            diff_onesided: vec![false; n],
            typical_x: vec![None; n],
            lower: DVector::from_element(n, f64::NEG_INFINITY),
            upper: DVector::from_element(n, f64::INFINITY),
            kind: FinDiffType::Forward,
            parallel: false,
        }
    }

    // Compute the step size. We would like to have the step as small as
    // possible (to be as close to the real derivative as possible). But at the
    // same time, very small step could cause F(x + e_i * step_i) ~= F(x) with
    // very small number of good digits.
    //
    // A reasonable way to balance these competing needs is to scale each
    // component by x_i itself. To avoid problems when x_i is close to zero, it
    // is modified to take the typical magnitude instead.
    fn step(&self, x: &DVector<f64>, i: usize, default_rel: f64) -> f64 {
        let rel = self.diffp[i].unwrap_or(default_rel);
        let magnitude = self.typical_x[i].map(f64::abs).unwrap_or(1.0);
        let xi = x[i];

        let step = rel * xi.abs().max(magnitude) * 1.0f64.copysign(xi);
        if step == 0.0 {
            rel * magnitude
        } else {
            step
        }
    }

    // A one-sided probe leaving the feasible interval flips to the other
    // side; a probe that still leaves it (very tight bounds) is clamped.
    fn forward_probe(&self, x: &DVector<f64>, i: usize, default_rel: f64) -> (f64, f64) {
        let xi = x[i];
        let mut step = self.step(x, i, default_rel);

        if xi + step > self.upper[i] || xi + step < self.lower[i] {
            step = -step;
        }
        let probe = (xi + step).clamp(self.lower[i], self.upper[i]);

        (probe, probe - xi)
    }

    fn central_probes(&self, x: &DVector<f64>, i: usize, default_rel: f64) -> (f64, f64) {
        let xi = x[i];
        let step = self.step(x, i, default_rel).abs();

        let lo = (xi - step).max(self.lower[i]);
        let hi = (xi + step).min(self.upper[i]);

        (lo, hi)
    }

    fn use_central(&self, i: usize) -> bool {
        self.kind == FinDiffType::Central && !self.diff_onesided[i]
    }
}

/// Evaluates the function at every point, on separate threads when requested.
///
/// Results come back in the order of the input points regardless of thread
/// scheduling.
fn eval_scalar_points(f: &ObjFn, points: &[DVector<f64>], parallel: bool) -> Vec<f64> {
    if parallel && points.len() > 1 {
        thread::scope(|scope| {
            let handles: Vec<_> = points.iter().map(|p| scope.spawn(move || f(p))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    } else {
        points.iter().map(|p| f(p)).collect()
    }
}

fn eval_vector_points(
    f: &ConsFn,
    points: &[DVector<f64>],
    parallel: bool,
) -> Vec<DVector<f64>> {
    if parallel && points.len() > 1 {
        thread::scope(|scope| {
            let handles: Vec<_> = points
                .iter()
                .map(|p| scope.spawn(move || f(p, None)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    } else {
        points.iter().map(|p| f(p, None)).collect()
    }
}

/// Finite-difference gradient of a scalar objective.
pub struct GradientEstimator {
    options: DiffOptions,
    cache: EvalCache<f64>,
}

impl GradientEstimator {
    /// Creates the estimator with the given policy.
    pub fn new(options: DiffOptions) -> Self {
        Self {
            options,
            cache: EvalCache::new(),
        }
    }

    /// Drops memoized evaluations, e.g. after the objective changed meaning.
    pub fn reset(&mut self) {
        self.cache.reset();
    }

    /// Estimates the gradient at the given point.
    pub fn estimate(&mut self, f: &ObjFn, x: &DVector<f64>) -> DVector<f64> {
        let n = x.len();

        enum Probe {
            // Indices into the probe point list plus the actual spread.
            Forward { at: usize, step: f64 },
            Central { lo: usize, hi: usize, spread: f64 },
        }

        let fx_needed = (0..n).any(|i| !self.options.use_central(i));
        let fx = if fx_needed {
            Some(self.cache.get_or_insert_with(x, || f(x)))
        } else {
            None
        };

        let mut points = Vec::new();
        let mut push = |point: DVector<f64>| -> usize {
            points.push(point);
            points.len() - 1
        };

        let probes: Vec<Probe> = (0..n)
            .map(|i| {
                if self.options.use_central(i) {
                    let (lo, hi) = self.options.central_probes(x, i, EPSILON_SQRT);
                    let mut lo_point = x.clone();
                    lo_point[i] = lo;
                    let mut hi_point = x.clone();
                    hi_point[i] = hi;
                    Probe::Central {
                        lo: push(lo_point),
                        hi: push(hi_point),
                        spread: hi - lo,
                    }
                } else {
                    let (probe, step) = self.options.forward_probe(x, i, EPSILON_SQRT);
                    let mut point = x.clone();
                    point[i] = probe;
                    Probe::Forward {
                        at: push(point),
                        step,
                    }
                }
            })
            .collect();

        let values = self.eval_all(f, &points);

        // Equal bounds leave no probe interval; the element is pinned and
        // its derivative is reported as zero.
        DVector::from_iterator(
            n,
            probes.iter().map(|probe| match probe {
                Probe::Forward { step, .. } if *step == 0.0 => 0.0,
                Probe::Forward { at, step } => (values[*at] - fx.unwrap()) / step,
                Probe::Central { spread, .. } if *spread == 0.0 => 0.0,
                Probe::Central { lo, hi, spread } => (values[*hi] - values[*lo]) / spread,
            }),
        )
    }

    fn eval_all(&mut self, f: &ObjFn, points: &[DVector<f64>]) -> Vec<f64> {
        // Serve from the cache first; only the misses go to the threads.
        let mut values: Vec<Option<f64>> = points.iter().map(|p| self.cache.get(p)).collect();

        let missing: Vec<usize> = (0..points.len()).filter(|&k| values[k].is_none()).collect();
        let missing_points: Vec<DVector<f64>> =
            missing.iter().map(|&k| points[k].clone()).collect();

        let computed = eval_scalar_points(f, &missing_points, self.options.parallel);
        for (&k, value) in missing.iter().zip(computed) {
            self.cache.insert(&points[k], value);
            values[k] = Some(value);
        }

        values.into_iter().map(|v| v.unwrap()).collect()
    }
}

/// Finite-difference Jacobian of a vector-valued constraint function.
pub struct JacobianEstimator {
    options: DiffOptions,
    cache: EvalCache<DVector<f64>>,
}

impl JacobianEstimator {
    /// Creates the estimator with the given policy.
    pub fn new(options: DiffOptions) -> Self {
        Self {
            options,
            cache: EvalCache::new(),
        }
    }

    /// Drops memoized evaluations.
    pub fn reset(&mut self) {
        self.cache.reset();
    }

    /// Estimates the Jacobian at the given point, one row per output element
    /// and one column per parameter.
    pub fn estimate(&mut self, f: &ConsFn, x: &DVector<f64>) -> DMatrix<f64> {
        let n = x.len();

        let fx = self.cache.get_or_insert_with(x, || f(x, None));
        let rows = fx.len();

        enum Probe {
            Forward { at: usize, step: f64 },
            Central { lo: usize, hi: usize, spread: f64 },
        }

        let mut points = Vec::new();
        let mut push = |point: DVector<f64>| -> usize {
            points.push(point);
            points.len() - 1
        };

        let probes: Vec<Probe> = (0..n)
            .map(|i| {
                if self.options.use_central(i) {
                    let (lo, hi) = self.options.central_probes(x, i, EPSILON_SQRT);
                    let mut lo_point = x.clone();
                    lo_point[i] = lo;
                    let mut hi_point = x.clone();
                    hi_point[i] = hi;
                    Probe::Central {
                        lo: push(lo_point),
                        hi: push(hi_point),
                        spread: hi - lo,
                    }
                } else {
                    let (probe, step) = self.options.forward_probe(x, i, EPSILON_SQRT);
                    let mut point = x.clone();
                    point[i] = probe;
                    Probe::Forward {
                        at: push(point),
                        step,
                    }
                }
            })
            .collect();

        let values = self.eval_all(f, &points);

        // Pinned elements (equal bounds) keep their zero column.
        let mut jac = DMatrix::zeros(rows, n);
        for (j, probe) in probes.iter().enumerate() {
            let col = match probe {
                Probe::Forward { step, .. } | Probe::Central { spread: step, .. }
                    if *step == 0.0 =>
                {
                    continue;
                }
                Probe::Forward { at, step } => (&values[*at] - &fx) / *step,
                Probe::Central { lo, hi, spread } => (&values[*hi] - &values[*lo]) / *spread,
            };
            jac.column_mut(j).copy_from(&col);
        }

        jac
    }

    fn eval_all(&mut self, f: &ConsFn, points: &[DVector<f64>]) -> Vec<DVector<f64>> {
        let mut values: Vec<Option<DVector<f64>>> =
            points.iter().map(|p| self.cache.get(p)).collect();

        let missing: Vec<usize> = (0..points.len()).filter(|&k| values[k].is_none()).collect();
        let missing_points: Vec<DVector<f64>> =
            missing.iter().map(|&k| points[k].clone()).collect();

        let computed = eval_vector_points(f, &missing_points, self.options.parallel);
        for (&k, value) in missing.iter().zip(computed) {
            self.cache.insert(&points[k], value.clone());
            values[k] = Some(value);
        }

        values.into_iter().map(|v| v.unwrap()).collect()
    }
}

/// Finite-difference Hessian of a scalar objective.
///
/// Diagonal entries use the three-point second-difference formula, off
/// diagonal entries reuse the one-step neighbor evaluations, so the full
/// matrix costs `n(n + 3)/2 + 1` evaluations.
pub struct HessianEstimator {
    options: DiffOptions,
}

impl HessianEstimator {
    /// Creates the estimator with the given policy.
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    /// Estimates the Hessian at the given point.
    pub fn estimate(&mut self, f: &ObjFn, x: &DVector<f64>) -> DMatrix<f64> {
        let n = x.len();
        let fx = f(x);

        let mut steps = DVector::zeros(n);
        let mut neighbors = DVector::zeros(n);

        let mut point = x.clone();

        for i in 0..n {
            let step = self.options.step(x, i, EPSILON_CBRT);
            steps[i] = step;

            point[i] = x[i] + step;
            neighbors[i] = f(&point);
            point[i] = x[i];
        }

        let mut hes = DMatrix::zeros(n, n);

        for i in 0..n {
            let stepi = steps[i];

            point[i] = x[i] + stepi + stepi;
            let fxi = f(&point);
            let fni = neighbors[i];

            point[i] = x[i] + stepi;

            hes[(i, i)] = ((fx - fni) + (fxi - fni)) / (stepi * stepi);

            for j in (i + 1)..n {
                let stepj = steps[j];

                point[j] = x[j] + stepj;

                let fxj = f(&point);
                let fnj = neighbors[j];

                let hij = ((fx - fni) + (fxj - fnj)) / (stepi * stepj);
                hes[(i, j)] = hij;
                hes[(j, i)] = hij;

                point[j] = x[j];
            }

            point[i] = x[i];
        }

        hes
    }
}

/// Gradient by the complex-step method.
///
/// Exact to machine precision for analytic functions because no subtractive
/// cancellation occurs; the perturbation can therefore be tiny.
pub fn complex_step_gradient(
    f: &dyn Fn(&DVector<Complex<f64>>) -> Complex<f64>,
    x: &DVector<f64>,
    h: f64,
) -> DVector<f64> {
    let n = x.len();
    let mut z: DVector<Complex<f64>> = x.map(|v| Complex::new(v, 0.0));

    DVector::from_iterator(
        n,
        (0..n).map(|i| {
            z[i].im = h;
            let fz = f(&z);
            z[i].im = 0.0;
            fz.im / h
        }),
    )
}

/// Jacobian by the complex-step method, one row per output element.
pub fn complex_step_jacobian(
    f: &dyn Fn(&DVector<Complex<f64>>) -> DVector<Complex<f64>>,
    x: &DVector<f64>,
    h: f64,
) -> DMatrix<f64> {
    let n = x.len();
    let mut z: DVector<Complex<f64>> = x.map(|v| Complex::new(v, 0.0));

    let mut columns = Vec::with_capacity(n);
    for i in 0..n {
        z[i].im = h;
        let fz = f(&z);
        z[i].im = 0.0;
        columns.push(fz.map(|v| v.im / h));
    }

    let rows = columns.first().map_or(0, |c| c.len());
    let mut jac = DMatrix::zeros(rows, n);
    for (i, col) in columns.iter().enumerate() {
        jac.column_mut(i).copy_from(col);
    }

    jac
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};

    // A simple, arbitrary function that produces Hessian matrix with non-zero
    // corners.
    fn mixed_vars() -> ObjFn {
        Box::new(|x| x[0].powi(2) + x[0] * x[1] + x[1].powi(3))
    }

    #[test]
    fn mixed_vars_gradient() {
        let mut estimator = GradientEstimator::new(DiffOptions::plain(2));
        let grad = estimator.estimate(&mixed_vars(), &dvector![3.0, -3.0]);

        assert_abs_diff_eq!(grad, dvector![3.0, 30.0], epsilon = 10e-6);
    }

    #[test]
    fn mixed_vars_gradient_central() {
        let mut options = DiffOptions::plain(2);
        options.kind = FinDiffType::Central;

        let mut estimator = GradientEstimator::new(options);
        let grad = estimator.estimate(&mixed_vars(), &dvector![3.0, -3.0]);

        assert_abs_diff_eq!(grad, dvector![3.0, 30.0], epsilon = 10e-6);
    }

    #[test]
    fn mixed_vars_hessian() {
        let mut estimator = HessianEstimator::new(DiffOptions::plain(2));
        let hes = estimator.estimate(&mixed_vars(), &dvector![3.0, -3.0]);

        assert_abs_diff_eq!(hes, dmatrix![2.0, 1.0; 1.0, -18.0], epsilon = 10e-3);
    }

    #[test]
    fn forward_probe_flips_away_from_upper_bound() {
        let mut options = DiffOptions::plain(1);
        options.upper = dvector![2.0];

        // x sits exactly on the bound, the probe must go below it.
        let mut estimator = GradientEstimator::new(options);
        let f: ObjFn = Box::new(|x| {
            assert!(x[0] <= 2.0);
            x[0] * x[0]
        });
        let grad = estimator.estimate(&f, &dvector![2.0]);

        assert_abs_diff_eq!(grad[0], 4.0, epsilon = 10e-5);
    }

    #[test]
    fn equal_bounds_pin_the_element_derivative_to_zero() {
        let f: ObjFn = Box::new(|x| x[0] * x[0] + 3.0 * x[1]);

        let mut central = DiffOptions::plain(2);
        central.kind = FinDiffType::Central;
        central.lower = dvector![1.0, f64::NEG_INFINITY];
        central.upper = dvector![1.0, f64::INFINITY];

        let grad = GradientEstimator::new(central).estimate(&f, &dvector![1.0, 2.0]);
        assert!(grad.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(grad[0], 0.0);
        assert_abs_diff_eq!(grad[1], 3.0, epsilon = 10e-6);

        let mut forward = DiffOptions::plain(2);
        forward.lower = dvector![1.0, f64::NEG_INFINITY];
        forward.upper = dvector![1.0, f64::INFINITY];

        let grad = GradientEstimator::new(forward).estimate(&f, &dvector![1.0, 2.0]);
        assert_abs_diff_eq!(grad[0], 0.0);
        assert_abs_diff_eq!(grad[1], 3.0, epsilon = 10e-6);
    }

    #[test]
    fn equal_bounds_pin_the_jacobian_column_to_zero() {
        let f: ConsFn = Box::new(|x, _| dvector![x[0] + x[1], x[0] * x[1]]);

        let mut options = DiffOptions::plain(2);
        options.kind = FinDiffType::Central;
        options.lower = dvector![2.0, f64::NEG_INFINITY];
        options.upper = dvector![2.0, f64::INFINITY];

        let jac = JacobianEstimator::new(options).estimate(&f, &dvector![2.0, 3.0]);
        assert!(jac.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(jac.column(0).norm(), 0.0);
        assert_abs_diff_eq!(jac[(0, 1)], 1.0, epsilon = 10e-6);
        assert_abs_diff_eq!(jac[(1, 1)], 2.0, epsilon = 10e-6);
    }

    #[test]
    fn central_probes_are_clipped_to_bounds() {
        let mut options = DiffOptions::plain(1);
        options.kind = FinDiffType::Central;
        options.lower = dvector![1.0];
        options.upper = dvector![1.0 + 1e-9];

        let mut estimator = GradientEstimator::new(options);
        let f: ObjFn = Box::new(|x| {
            assert!(x[0] >= 1.0 && x[0] <= 1.0 + 1e-9);
            3.0 * x[0]
        });
        let grad = estimator.estimate(&f, &dvector![1.0]);

        // The divisor is the actual spread, so a linear function stays exact.
        assert_abs_diff_eq!(grad[0], 3.0, epsilon = 10e-6);
    }

    #[test]
    fn diffp_overrides_the_default_step() {
        let mut options = DiffOptions::plain(1);
        options.diffp = vec![Some(0.5)];

        let mut estimator = GradientEstimator::new(options);
        // |x - 1| is non-differentiable at 1; a forward step of 0.5 from 0.9
        // crosses the kink and yields the right-hand slope.
        let f: ObjFn = Box::new(|x| (x[0] - 1.0).abs());
        let grad = estimator.estimate(&f, &dvector![0.9]);

        assert!(grad[0] > 0.0);
    }

    #[test]
    fn cache_merges_repeated_evaluations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let f: ObjFn = Box::new(move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            x[0] * x[0] + x[1]
        });

        let mut estimator = GradientEstimator::new(DiffOptions::plain(2));
        let x = dvector![1.0, 2.0];

        estimator.estimate(&f, &x);
        let first = calls.load(Ordering::SeqCst);

        // Same point again: base evaluation and probes are all memoized.
        estimator.estimate(&f, &x);
        assert_eq!(calls.load(Ordering::SeqCst), first);

        estimator.reset();
        estimator.estimate(&f, &x);
        assert_eq!(calls.load(Ordering::SeqCst), 2 * first);
    }

    #[test]
    fn parallel_probes_match_sequential() {
        let f: ObjFn = Box::new(|x| x[0].sin() + x[1].cos() * x[2]);
        let x = dvector![0.3, -1.2, 2.0];

        let mut sequential = GradientEstimator::new(DiffOptions::plain(3));
        let mut options = DiffOptions::plain(3);
        options.parallel = true;
        let mut parallel = GradientEstimator::new(options);

        assert_abs_diff_eq!(
            sequential.estimate(&f, &x),
            parallel.estimate(&f, &x),
            epsilon = 1e-12
        );
    }

    #[test]
    fn constraint_jacobian() {
        let f: ConsFn = Box::new(|x, _| dvector![x[0] * x[0] + x[1], x[1] * 3.0]);

        let mut estimator = JacobianEstimator::new(DiffOptions::plain(2));
        let jac = estimator.estimate(&f, &dvector![2.0, 1.0]);

        assert_abs_diff_eq!(jac, dmatrix![4.0, 1.0; 0.0, 3.0], epsilon = 10e-5);
    }

    #[test]
    fn complex_step_is_exact_for_analytic_functions() {
        let f = |z: &DVector<Complex<f64>>| z[0] * z[0] + z[0] * z[1] + z[1] * z[1] * z[1];
        let grad = complex_step_gradient(&f, &dvector![3.0, -3.0], DEFAULT_CSTEP);

        assert_abs_diff_eq!(grad, dvector![3.0, 30.0], epsilon = 1e-12);
    }

    #[test]
    fn complex_step_jacobian_rows_match_outputs() {
        let f = |z: &DVector<Complex<f64>>| {
            DVector::from_vec(vec![z[0] * z[1], z[1] * z[1]])
        };
        let jac = complex_step_jacobian(&f, &dvector![2.0, 5.0], DEFAULT_CSTEP);

        assert_abs_diff_eq!(jac, dmatrix![5.0, 2.0; 0.0, 10.0], epsilon = 1e-12);
    }
}
