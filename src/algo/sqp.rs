//! Sequential quadratic programming.
//!
//! An active-set SQP iteration with a damped BFGS approximation of the
//! Lagrangian Hessian and a backtracking line search on an L1 merit function.
//! Equality rows are always in the working set; inequality rows enter it when
//! active or violated and leave it when their multiplier turns negative.
//!
//! # References
//!
//! \[1\] [Numerical
//! Optimization](https://link.springer.com/book/10.1007/978-0-387-40065-5),
//! chapter 18

use getset::{CopyGetters, Setters};
use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::algo::{bfgs_update, solve_kkt, Backend};
use crate::core::{Convergence, Diagnostics, Hook, Run, TraceStep, UserAction};
use crate::pipeline::{ConstraintStack, ObjFn};

/// Options for [`OctaveSqp`].
#[derive(Debug, Clone, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct OctaveSqpOptions {
    /// Penalty weight of the constraint violation in the merit function.
    /// Default: `100`.
    merit_weight: f64,
    /// Number of line search halvings before a step is rejected. Default:
    /// `25`.
    halvings: usize,
    /// Tolerance below which an inequality row counts as active. Default:
    /// `sqrt(EPSILON)`.
    active_tol: f64,
}

impl Default for OctaveSqpOptions {
    fn default() -> Self {
        Self {
            merit_weight: 100.0,
            halvings: 25,
            active_tol: f64::EPSILON.sqrt(),
        }
    }
}

/// SQP backend.
#[derive(Debug, Default)]
pub struct OctaveSqp {
    options: OctaveSqpOptions,
}

impl OctaveSqp {
    /// Initializes the backend with given options.
    pub fn with_options(options: OctaveSqpOptions) -> Self {
        Self { options }
    }

    fn merit(&self, fx: f64, c: &DVector<f64>, eq_mask: &[bool]) -> f64 {
        let mut violation = 0.0;
        for i in 0..c.len() {
            if eq_mask[i] {
                violation += c[i].abs();
            } else {
                violation += (-c[i]).max(0.0);
            }
        }
        fx + self.options.merit_weight * violation
    }

    fn working_set(&self, c: &DVector<f64>, eq_mask: &[bool]) -> Vec<usize> {
        (0..c.len())
            .filter(|&i| eq_mask[i] || c[i] <= self.options.active_tol)
            .collect()
    }

    fn feasible(&self, c: &DVector<f64>, eq_mask: &[bool], tol: f64) -> bool {
        (0..c.len()).all(|i| {
            if eq_mask[i] {
                c[i].abs() <= tol
            } else {
                c[i] >= -tol
            }
        })
    }
}

impl Backend for OctaveSqp {
    const NAME: &'static str = "octave_sqp";
    const PATH_BOUNDS: bool = false;

    fn run(&mut self, f: &ObjFn, x0: &DVector<f64>, hook: &mut Hook) -> Run {
        let n = x0.len();
        let feas_tol = hook.tol_fun().sqrt();

        let mut x = x0.clone();
        let mut fx = f(&x);
        let mut g = hook.gradient(&x);
        let mut b = DMatrix::identity(n, n);

        let mut diag = Diagnostics::default();
        let mut lambda_full = DVector::zeros(hook.stack().count());
        let mut small_steps = 0;

        let mut conv = Convergence::IterLimit;

        for iter in 0..hook.max_iter() {
            diag.niter = iter + 1;

            let eq_mask = hook.stack().eq_mask().to_vec();
            let c = hook.stack().values(&x, None);
            let mut active = self.working_set(&c, &eq_mask);

            // Solve the quadratic subproblem, releasing inequality rows whose
            // multiplier turns negative.
            let step = loop {
                let jac = hook.stack_mut().jacobian(&x, Some(&active));
                let a = jac.transpose();
                let c_active = select(&c, &active);

                let Some((d, lambda)) = solve_kkt(&b, &a, &g, &c_active) else {
                    break None;
                };

                let blocking = active
                    .iter()
                    .enumerate()
                    .filter(|&(k, &row)| !eq_mask[row] && lambda[k] < 0.0)
                    .map(|(k, _)| k)
                    .min_by(|&p, &q| lambda[p].total_cmp(&lambda[q]));

                match blocking {
                    Some(k) if active.len() > 1 => {
                        active.remove(k);
                    }
                    _ => {
                        lambda_full.fill(0.0);
                        for (k, &row) in active.iter().enumerate() {
                            lambda_full[row] = lambda[k];
                        }
                        break Some(d);
                    }
                }
            };

            let Some(mut d) = step else {
                conv = Convergence::Stalled;
                break;
            };

            hook.clamp_fractional(&x, &mut d);

            // Backtracking on the L1 merit.
            let merit0 = self.merit(fx, &c, &eq_mask);
            let mut alpha = 1.0;
            let mut accepted = None;

            for _ in 0..self.options.halvings {
                let candidate = &x + alpha * &d;
                let f_cand = f(&candidate);
                let c_cand = hook.stack().values(&candidate, None);

                if self.merit(f_cand, &c_cand, &eq_mask) < merit0 {
                    accepted = Some((candidate, f_cand));
                    break;
                }
                alpha /= 2.0;
            }

            let Some((x_new, f_new)) = accepted else {
                // A vanishing subproblem step at a feasible point means the
                // KKT conditions hold up to the working precision.
                conv = if self.feasible(&c, &eq_mask, feas_tol)
                    && d.norm() <= feas_tol * x.norm().max(1.0)
                {
                    Convergence::Converged
                } else {
                    Convergence::Stalled
                };
                break;
            };

            let step_taken = &x_new - &x;
            let g_new = hook.gradient(&x_new);

            bfgs_update(&mut b, &step_taken, &(&g_new - &g));

            let f_change = (f_new - fx).abs();
            let c_new = hook.stack().values(&x_new, None);
            let feasible = self.feasible(&c_new, &eq_mask, feas_tol);

            debug!(
                "iter {}: fx = {}, step = {}, alpha = {}",
                iter,
                f_new,
                step_taken.norm(),
                alpha
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
                if g.norm() <= hook.tol_fun() && constraint_norm(hook.stack(), &x) <= feas_tol {
                    conv = Convergence::Converged;
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

fn select(c: &DVector<f64>, indices: &[usize]) -> DVector<f64> {
    DVector::from_iterator(indices.len(), indices.iter().map(|&i| c[i]))
}

fn constraint_norm(stack: &ConstraintStack, x: &DVector<f64>) -> f64 {
    if stack.is_empty() {
        return 0.0;
    }
    let c = stack.values(x, None);
    let eq_mask = stack.eq_mask();
    (0..c.len())
        .map(|i| {
            if eq_mask[i] {
                c[i].abs()
            } else {
                (-c[i]).max(0.0)
            }
        })
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    use crate::testing::{hook_with_stack, unconstrained_hook};

    fn sphere() -> ObjFn {
        Box::new(|x| x.iter().map(|v| v * v).sum())
    }

    #[test]
    fn unconstrained_quadratic() {
        let mut hook = unconstrained_hook(sphere(), 2);
        let mut backend = OctaveSqp::default();

        let run = backend.run(&sphere(), &dvector![3.0, -2.0], &mut hook);

        assert!(run.conv.is_success(), "{}", run.conv);
        assert_abs_diff_eq!(run.x, dvector![0.0, 0.0], epsilon = 1e-4);
    }

    #[test]
    fn equality_constrained_minimum() {
        // Minimize x1² + x2² subject to x1 + x2 = 2; solution (1, 1).
        let mut hook = hook_with_stack(
            sphere(),
            &dvector![0.5, 0.5],
            None,
            Some((dvector![1.0, 1.0], -2.0)),
        );
        let mut backend = OctaveSqp::default();

        let run = backend.run(&sphere(), &dvector![0.5, 0.5], &mut hook);

        assert!(run.conv.is_success(), "{}", run.conv);
        assert_abs_diff_eq!(run.x, dvector![1.0, 1.0], epsilon = 1e-4);
    }

    #[test]
    fn inequality_keeps_the_iterate_feasible_at_the_end() {
        // Minimize x1² + x2² subject to x1 + x2 >= 1; solution (0.5, 0.5).
        let mut hook = hook_with_stack(
            sphere(),
            &dvector![2.0, 2.0],
            Some((dvector![1.0, 1.0], -1.0)),
            None,
        );
        let mut backend = OctaveSqp::default();

        let run = backend.run(&sphere(), &dvector![2.0, 2.0], &mut hook);

        assert!(run.conv.is_success(), "{}", run.conv);
        assert_abs_diff_eq!(run.x, dvector![0.5, 0.5], epsilon = 1e-3);
        assert!(run.x[0] + run.x[1] >= 1.0 - 1e-6);
    }

    #[test]
    fn start_at_the_constrained_minimum_is_a_success() {
        // Already on x1 + x2 = 2 at the solution (1, 1); the subproblem step
        // vanishes from the first iteration on.
        let mut hook = hook_with_stack(
            sphere(),
            &dvector![1.0, 1.0],
            None,
            Some((dvector![1.0, 1.0], -2.0)),
        );
        let mut backend = OctaveSqp::default();

        let run = backend.run(&sphere(), &dvector![1.0, 1.0], &mut hook);

        assert!(run.conv.is_success(), "{}", run.conv);
        assert_abs_diff_eq!(run.x, dvector![1.0, 1.0], epsilon = 1e-6);
    }

    #[test]
    fn user_stop_is_reported() {
        let mut hook = unconstrained_hook(sphere(), 2);
        hook.callbacks = vec![Box::new(|_| UserAction::Stop)];

        let mut backend = OctaveSqp::default();
        let run = backend.run(&sphere(), &dvector![3.0, -2.0], &mut hook);

        assert_eq!(run.conv, Convergence::UserStop);
        assert_eq!(run.conv.code(), -1);
        assert!(run.diag.user_stop);
    }

    #[test]
    fn iteration_limit_is_an_outcome_not_an_error() {
        let mut hook = unconstrained_hook(sphere(), 2);
        hook.max_iter = 1;

        let mut backend = OctaveSqp::default();
        let run = backend.run(&sphere(), &dvector![30.0, -20.0], &mut hook);

        assert_eq!(run.conv, Convergence::IterLimit);
        assert_eq!(run.conv.code(), 0);
    }
}
