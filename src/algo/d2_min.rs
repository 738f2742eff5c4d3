//! Newton iteration on the second derivative.
//!
//! Minimizes by solving `H d = -g` with a Cholesky factorization of the
//! Hessian, adding a growing multiple of the identity when the factorization
//! fails, and backtracking on the objective. Bounds are enforced by
//! projecting every iterate into the box; other constraints are not
//! supported and are ignored with a warning.

use getset::{CopyGetters, Setters};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::algo::Backend;
use crate::core::{Convergence, Diagnostics, Hook, Run, TraceStep, UserAction};
use crate::pipeline::ObjFn;

/// Options for [`D2Min`].
#[derive(Debug, Clone, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct D2MinOptions {
    /// Number of line search halvings before a step is rejected. Default:
    /// `25`.
    halvings: usize,
    /// Initial identity shift when the Hessian is not positive definite.
    /// Default: `1e-6`.
    shift_init: f64,
    /// Identity shift above which the iteration gives up. Default: `1e10`.
    shift_max: f64,
}

impl Default for D2MinOptions {
    fn default() -> Self {
        Self {
            halvings: 25,
            shift_init: 1e-6,
            shift_max: 1e10,
        }
    }
}

/// Newton backend.
#[derive(Debug, Default)]
pub struct D2Min {
    options: D2MinOptions,
}

impl D2Min {
    /// Initializes the backend with given options.
    pub fn with_options(options: D2MinOptions) -> Self {
        Self { options }
    }
}

impl Backend for D2Min {
    const NAME: &'static str = "d2_min";
    const PATH_BOUNDS: bool = false;

    fn run(&mut self, f: &ObjFn, x0: &DVector<f64>, hook: &mut Hook) -> Run {
        let n = x0.len();

        let non_bound_rows = hook.stack().count() - hook.stack().counts().bounds;
        if non_bound_rows > 0 {
            warn!(
                "{} only supports bound constraints, ignoring {} constraint rows",
                Self::NAME,
                non_bound_rows
            );
        }

        let mut x = x0.clone();
        for i in 0..n {
            x[i] = x[i].clamp(hook.lower()[i], hook.upper()[i]);
        }
        let mut fx = f(&x);

        let mut diag = Diagnostics::default();
        let mut small_steps = 0;
        let mut conv = Convergence::IterLimit;

        for iter in 0..hook.max_iter() {
            diag.niter = iter + 1;

            let g = hook.gradient(&x);

            if g.norm() <= hook.tol_fun() {
                conv = Convergence::Converged;
                break;
            }

            let h = match hook.hessian(&x) {
                Some(h) => h,
                None => {
                    // Degrades to steepest descent.
                    warn!("no Hessian available, falling back to the identity");
                    DMatrix::identity(n, n)
                }
            };

            // Shift the diagonal until the factorization succeeds.
            let mut shift = 0.0;
            let mut d = None;

            loop {
                let shifted = &h + DMatrix::identity(n, n) * shift;
                if let Some(cholesky) = shifted.cholesky() {
                    d = Some(-cholesky.solve(&g));
                    break;
                }
                shift = if shift == 0.0 {
                    self.options.shift_init
                } else {
                    shift * 10.0
                };
                if shift > self.options.shift_max {
                    break;
                }
            }

            let Some(mut d) = d else {
                conv = Convergence::Stalled;
                break;
            };

            hook.clamp_fractional(&x, &mut d);

            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..self.options.halvings {
                let mut candidate = &x + alpha * &d;
                // Bounds are enforced by projection.
                for i in 0..n {
                    candidate[i] = candidate[i].clamp(hook.lower()[i], hook.upper()[i]);
                }
                let f_cand = f(&candidate);
                if f_cand < fx {
                    accepted = Some((candidate, f_cand));
                    break;
                }
                alpha /= 2.0;
            }

            let Some((x_new, f_new)) = accepted else {
                conv = Convergence::Stalled;
                break;
            };

            let step_taken = &x_new - &x;
            let f_change = (f_new - fx).abs();

            debug!("iter {}: fx = {}, step = {}", iter, f_new, step_taken.norm());

            if hook.fractional_converged(&x, &step_taken) {
                small_steps += 1;
            } else {
                small_steps = 0;
            }

            x = x_new;
            fx = f_new;

            if hook.trace_steps() {
                diag.trace.push(TraceStep { x: x.clone(), fx });
            }

            if hook.interact(iter, &x, fx) == UserAction::Stop {
                conv = Convergence::UserStop;
                diag.user_stop = true;
                break;
            }

            if small_steps >= 2 {
                conv = Convergence::TolX;
                break;
            }
            if f_change <= hook.tol_fun() * fx.abs().max(1.0) {
                conv = Convergence::TolFun;
                break;
            }
        }

        diag.nobjf = hook.nobjf();

        Run { x, fx, conv, diag }
    }
}
