//! Backend-facing solving context.
//!
//! All pipeline products that a backend needs -- the stacked constraints,
//! derivative functions, tolerances and the user interaction callbacks -- are
//! bundled into a [`Hook`] so backend signatures stay small.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::algo::siman::SimanOptions;
use crate::pipeline::{ConstraintStack, GradFn, HessFn};

/// Reason a backend stopped, reported as an outcome value rather than an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// The simple convergence criterion of the backend was met.
    Converged,
    /// The parameter change fell below `TolX` in two consecutive iterations.
    TolX,
    /// The objective change fell below `TolFun`.
    TolFun,
    /// The iteration limit was exhausted.
    IterLimit,
    /// The user callback requested a stop.
    UserStop,
    /// No progress could be made from the current point.
    Stalled,
}

impl Convergence {
    /// Numeric outcome code (positive means success).
    pub fn code(&self) -> i32 {
        match self {
            Convergence::Converged => 1,
            Convergence::TolX => 2,
            Convergence::TolFun => 3,
            Convergence::IterLimit => 0,
            Convergence::UserStop => -1,
            Convergence::Stalled => -4,
        }
    }

    /// Determines whether the outcome is a successful convergence.
    pub fn is_success(&self) -> bool {
        self.code() > 0
    }
}

impl fmt::Display for Convergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Convergence::Converged => "converged",
            Convergence::TolX => "parameter change below tolerance",
            Convergence::TolFun => "objective change below tolerance",
            Convergence::IterLimit => "iteration limit reached",
            Convergence::UserStop => "stopped by user callback",
            Convergence::Stalled => "no progress possible",
        };
        write!(f, "{} ({})", reason, self.code())
    }
}

/// Decision of the user interaction callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Keep iterating.
    Continue,
    /// Stop and report [`Convergence::UserStop`].
    Stop,
}

/// Snapshot of one iteration, handed to the user interaction callback.
#[derive(Debug)]
pub struct IterState<'a> {
    /// Completed iteration count.
    pub iter: usize,
    /// Current parameter values.
    pub x: &'a DVector<f64>,
    /// Current objective value.
    pub fx: f64,
}

/// User interaction callback, consulted once per iteration.
pub type UserCallback = Box<dyn FnMut(&IterState<'_>) -> UserAction + Send>;

/// One recorded iterate.
#[derive(Debug, Clone)]
pub struct TraceStep {
    /// Parameter values after the iteration.
    pub x: DVector<f64>,
    /// Objective value after the iteration.
    pub fx: f64,
}

/// Per-run bookkeeping reported alongside the result.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Iterations performed.
    pub niter: usize,
    /// Objective evaluations performed.
    pub nobjf: usize,
    /// Lagrange multipliers of the stacked constraints at the final point,
    /// when the backend computes them.
    pub lambda: Option<DVector<f64>>,
    /// Recorded iterates (only when tracing was requested).
    pub trace: Vec<TraceStep>,
    /// Whether the run ended on a user callback stop.
    pub user_stop: bool,
}

/// Result of one backend run in the free parameter space.
#[derive(Debug)]
pub struct Run {
    /// Final parameter values.
    pub x: DVector<f64>,
    /// Final objective value.
    pub fx: f64,
    /// Stop reason.
    pub conv: Convergence,
    /// Run bookkeeping.
    pub diag: Diagnostics,
}

/// Everything a backend needs besides the objective itself.
///
/// Lives in the free parameter space throughout; the driver reconstitutes
/// fixed parameters after the run.
pub struct Hook {
    pub(crate) stack: ConstraintStack,
    pub(crate) lower: DVector<f64>,
    pub(crate) upper: DVector<f64>,
    pub(crate) tol_fun: f64,
    pub(crate) tol_x: f64,
    pub(crate) max_iter: usize,
    pub(crate) max_fract_change: Vec<Option<f64>>,
    pub(crate) fract_prec: Vec<Option<f64>>,
    pub(crate) grad: GradFn,
    pub(crate) hess: Option<HessFn>,
    pub(crate) callbacks: Vec<UserCallback>,
    pub(crate) trace_steps: bool,
    pub(crate) siman: SimanOptions,
    pub(crate) nobjf: Arc<AtomicUsize>,
}

impl Hook {
    /// Stacked constraints.
    pub fn stack(&self) -> &ConstraintStack {
        &self.stack
    }

    /// Stacked constraints, mutably (the Jacobian function is `FnMut`).
    pub fn stack_mut(&mut self) -> &mut ConstraintStack {
        &mut self.stack
    }

    /// Lower bounds of the free parameters.
    pub fn lower(&self) -> &DVector<f64> {
        &self.lower
    }

    /// Upper bounds of the free parameters.
    pub fn upper(&self) -> &DVector<f64> {
        &self.upper
    }

    /// Objective change tolerance.
    pub fn tol_fun(&self) -> f64 {
        self.tol_fun
    }

    /// Parameter change tolerance.
    pub fn tol_x(&self) -> f64 {
        self.tol_x
    }

    /// Iteration limit.
    pub fn max_iter(&self) -> usize {
        self.max_iter
    }

    /// Whether iterates should be recorded in the diagnostics.
    pub fn trace_steps(&self) -> bool {
        self.trace_steps
    }

    /// Simulated annealing options.
    pub fn siman(&self) -> &SimanOptions {
        &self.siman
    }

    /// Objective evaluations counted so far.
    pub fn nobjf(&self) -> usize {
        self.nobjf.load(Ordering::Relaxed)
    }

    /// Evaluates the objective gradient.
    pub fn gradient(&mut self, x: &DVector<f64>) -> DVector<f64> {
        (self.grad)(x)
    }

    /// Determines whether a Hessian function is available.
    pub fn has_hessian(&self) -> bool {
        self.hess.is_some()
    }

    /// Evaluates the objective Hessian, if available.
    pub fn hessian(&mut self, x: &DVector<f64>) -> Option<DMatrix<f64>> {
        self.hess.as_mut().map(|h| h(x))
    }

    /// Consults the user interaction callbacks. Every callback sees the
    /// iteration; a single `Stop` decision wins.
    pub fn interact(&mut self, iter: usize, x: &DVector<f64>, fx: f64) -> UserAction {
        let state = IterState { iter, x, fx };
        let mut action = UserAction::Continue;
        for callback in self.callbacks.iter_mut() {
            if callback(&state) == UserAction::Stop {
                action = UserAction::Stop;
            }
        }
        action
    }

    /// Clamps a proposed step so that no element changes by more than its
    /// allowed fraction of the current magnitude.
    pub fn clamp_fractional(&self, x: &DVector<f64>, step: &mut DVector<f64>) {
        for i in 0..step.len() {
            if let Some(limit) = self.max_fract_change[i] {
                let cap = limit * x[i].abs().max(1.0);
                step[i] = step[i].clamp(-cap, cap);
            }
        }
    }

    /// Determines whether a step is below the per-element precision
    /// criterion everywhere (`TolX` where no override is set).
    pub fn fractional_converged(&self, x: &DVector<f64>, step: &DVector<f64>) -> bool {
        (0..step.len()).all(|i| {
            let prec = self.fract_prec[i].unwrap_or(self.tol_x);
            step[i].abs() <= prec * x[i].abs().max(1.0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    use crate::pipeline::stack::StackInputs;

    fn hook(n: usize) -> Hook {
        let lower = DVector::from_element(n, f64::NEG_INFINITY);
        let upper = DVector::from_element(n, f64::INFINITY);
        let stack = ConstraintStack::build(
            StackInputs {
                lower: lower.clone(),
                upper: upper.clone(),
                lin_inequc: None,
                lin_equc: None,
                gen_inequc: None,
                gen_equc: None,
            },
            &DVector::zeros(n),
        );

        Hook {
            stack,
            lower,
            upper,
            tol_fun: 1e-7,
            tol_x: 1e-7,
            max_iter: 20,
            max_fract_change: vec![None; n],
            fract_prec: vec![None; n],
            grad: Box::new(|x| x.clone()),
            hess: None,
            callbacks: Vec::new(),
            trace_steps: false,
            siman: SimanOptions::default(),
            nobjf: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn outcome_codes() {
        assert_eq!(Convergence::Converged.code(), 1);
        assert_eq!(Convergence::TolX.code(), 2);
        assert_eq!(Convergence::TolFun.code(), 3);
        assert_eq!(Convergence::IterLimit.code(), 0);
        assert_eq!(Convergence::UserStop.code(), -1);
        assert_eq!(Convergence::Stalled.code(), -4);

        assert!(Convergence::TolX.is_success());
        assert!(!Convergence::IterLimit.is_success());
        assert!(!Convergence::UserStop.is_success());
    }

    #[test]
    fn interact_defaults_to_continue() {
        let mut hook = hook(2);
        assert_eq!(
            hook.interact(0, &dvector![0.0, 0.0], 1.0),
            UserAction::Continue
        );
    }

    #[test]
    fn interact_forwards_the_callback_decision() {
        let mut hook = hook(1);
        hook.callbacks = vec![Box::new(|state| {
            if state.iter >= 3 {
                UserAction::Stop
            } else {
                UserAction::Continue
            }
        })];

        assert_eq!(hook.interact(2, &dvector![0.0], 1.0), UserAction::Continue);
        assert_eq!(hook.interact(3, &dvector![0.0], 1.0), UserAction::Stop);
    }

    #[test]
    fn any_stopping_callback_wins_and_all_are_consulted() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counting = |decision: UserAction, calls: &Arc<AtomicUsize>| -> UserCallback {
            let calls = Arc::clone(calls);
            Box::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                decision
            })
        };

        let mut hook = hook(1);
        hook.callbacks = vec![
            counting(UserAction::Continue, &calls),
            counting(UserAction::Stop, &calls),
            counting(UserAction::Continue, &calls),
        ];

        assert_eq!(hook.interact(0, &dvector![0.0], 1.0), UserAction::Stop);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fractional_step_clamp() {
        let mut hook = hook(2);
        hook.max_fract_change = vec![Some(0.1), None];

        let x = dvector![10.0, 10.0];
        let mut step = dvector![5.0, 5.0];
        hook.clamp_fractional(&x, &mut step);

        // Element 0 is capped at 10% of |x|, element 1 is unrestricted.
        assert_abs_diff_eq!(step, dvector![1.0, 5.0]);
    }

    #[test]
    fn fractional_precision_check() {
        let mut hook = hook(2);
        hook.fract_prec = vec![Some(1e-2), None];

        let x = dvector![10.0, 1.0];
        assert!(hook.fractional_converged(&x, &dvector![0.05, 1e-8]));
        assert!(!hook.fractional_converged(&x, &dvector![0.5, 1e-8]));
        // Element 1 falls back to TolX.
        assert!(!hook.fractional_converged(&x, &dvector![0.05, 1e-3]));
    }
}
