//! Feasible-path constrained minimization.
//!
//! A Levenberg-Marquardt-flavored iteration on the KKT system: the quadratic
//! model of the Lagrangian is damped by a multiple of the identity that grows
//! on rejected steps and shrinks on accepted ones. Iterates are projected
//! into the bound box after every step, so the objective and the constraints
//! are only ever evaluated within bounds.
//!
//! # References
//!
//! \[1\] [Numerical
//! Optimization](https://link.springer.com/book/10.1007/978-0-387-40065-5),
//! chapters 10 and 18

use getset::{CopyGetters, Setters};
use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::algo::{bfgs_update, solve_kkt, Backend};
use crate::core::{Convergence, Diagnostics, Hook, Run, TraceStep, UserAction};
use crate::pipeline::ObjFn;

/// Options for [`LmFeasible`].
#[derive(Debug, Clone, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct LmFeasibleOptions {
    /// Initial damping factor. Default: `1e-3`.
    nu_init: f64,
    /// Damping factor above which the iteration gives up. Default: `1e10`.
    nu_max: f64,
    /// Penalty weight of the constraint violation in the merit function.
    /// Default: `100`.
    merit_weight: f64,
}

impl Default for LmFeasibleOptions {
    fn default() -> Self {
        Self {
            nu_init: 1e-3,
            nu_max: 1e10,
            merit_weight: 100.0,
        }
    }
}

/// Feasible-path backend. This is the default.
#[derive(Debug, Default)]
pub struct LmFeasible {
    options: LmFeasibleOptions,
}

impl LmFeasible {
    /// Initializes the backend with given options.
    pub fn with_options(options: LmFeasibleOptions) -> Self {
        Self { options }
    }

    fn violation(&self, c: &DVector<f64>, eq_mask: &[bool]) -> f64 {
        (0..c.len())
            .map(|i| {
                if eq_mask[i] {
                    c[i].abs()
                } else {
                    (-c[i]).max(0.0)
                }
            })
            .sum()
    }

    fn merit(&self, fx: f64, c: &DVector<f64>, eq_mask: &[bool]) -> f64 {
        fx + self.options.merit_weight * self.violation(c, eq_mask)
    }
}

fn project(x: &mut DVector<f64>, lower: &DVector<f64>, upper: &DVector<f64>) {
    for i in 0..x.len() {
        x[i] = x[i].clamp(lower[i], upper[i]);
    }
}

impl Backend for LmFeasible {
    const NAME: &'static str = "lm_feasible";
    const PATH_BOUNDS: bool = true;

    fn run(&mut self, f: &ObjFn, x0: &DVector<f64>, hook: &mut Hook) -> Run {
        let n = x0.len();
        let feas_tol = hook.tol_fun().sqrt();

        let mut x = x0.clone();
        project(&mut x, hook.lower(), hook.upper());

        let mut fx = f(&x);
        let mut g = hook.gradient(&x);
        let mut b = DMatrix::identity(n, n);
        let mut nu = self.options.nu_init;

        let mut diag = Diagnostics::default();
        let mut lambda_full = DVector::zeros(hook.stack().count());
        let mut small_steps = 0;

        let mut conv = Convergence::IterLimit;

        for iter in 0..hook.max_iter() {
            diag.niter = iter + 1;

            let eq_mask = hook.stack().eq_mask().to_vec();
            let c = hook.stack().values(&x, None);

            // Equality rows are always linearized; inequality rows only when
            // violated, bound rows never (projection handles them).
            let active: Vec<usize> = (0..c.len())
                .filter(|&i| eq_mask[i] || c[i] < -feas_tol)
                .collect();

            let jac = hook.stack_mut().jacobian(&x, Some(&active));
            let a = jac.transpose();
            let c_active = DVector::from_iterator(active.len(), active.iter().map(|&i| c[i]));

            let merit0 = self.merit(fx, &c, &eq_mask);
            let mut accepted = None;
            let mut last_step = f64::INFINITY;

            while nu <= self.options.nu_max {
                let damped = &b + DMatrix::identity(n, n) * nu;

                let Some((mut d, lambda)) = solve_kkt(&damped, &a, &g, &c_active) else {
                    nu *= 10.0;
                    continue;
                };

                hook.clamp_fractional(&x, &mut d);

                let mut candidate = &x + &d;
                project(&mut candidate, hook.lower(), hook.upper());
                last_step = (&candidate - &x).norm();

                let f_cand = f(&candidate);
                let c_cand = hook.stack().values(&candidate, None);

                if self.merit(f_cand, &c_cand, &eq_mask) < merit0 {
                    lambda_full.fill(0.0);
                    for (k, &row) in active.iter().enumerate() {
                        lambda_full[row] = lambda[k];
                    }
                    accepted = Some((candidate, f_cand, c_cand));
                    break;
                }

                nu *= 10.0;
            }

            let Some((x_new, f_new, c_new)) = accepted else {
                // The damping escalation exhausts with a vanishing projected
                // step; at a feasible point that is the stopping condition,
                // not a stall.
                conv = if self.violation(&c, &eq_mask) <= feas_tol
                    && last_step <= feas_tol * x.norm().max(1.0)
                {
                    Convergence::Converged
                } else {
                    Convergence::Stalled
                };
                break;
            };

            nu = (nu / 10.0).max(1e-10);

            let step_taken = &x_new - &x;
            let g_new = hook.gradient(&x_new);
            bfgs_update(&mut b, &step_taken, &(&g_new - &g));

            let f_change = (f_new - fx).abs();
            let feasible = self.violation(&c_new, &eq_mask) <= feas_tol;

            debug!(
                "iter {}: fx = {}, step = {}, nu = {}",
                iter,
                f_new,
                step_taken.norm(),
                nu
            );

            if hook.fractional_converged(&x, &step_taken) {
                small_steps += 1;
            } else {
                small_steps = 0;
            }

            x = x_new;
            fx = f_new;
            g = g_new;

            if hook.trace_steps() {
                diag.trace.push(TraceStep { x: x.clone(), fx });
            }

            if hook.interact(iter, &x, fx) == UserAction::Stop {
                conv = Convergence::UserStop;
                diag.user_stop = true;
                break;
            }

            if feasible {
                if small_steps >= 2 {
                    conv = Convergence::TolX;
                    break;
                }
                if f_change <= hook.tol_fun() * fx.abs().max(1.0) {
                    conv = Convergence::TolFun;
                    break;
                }
            }
        }

        diag.nobjf = hook.nobjf();
        if !lambda_full.is_empty() {
            diag.lambda = Some(lambda_full);
        }

        Run { x, fx, conv, diag }
    }
}
