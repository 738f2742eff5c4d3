//! Simulated annealing.
//!
//! A Metropolis iteration with a geometric cooling schedule. Candidate points
//! are drawn uniformly around the current point, clamped into the bound box
//! and optionally redrawn until they satisfy the remaining constraints. The
//! best visited point is reported, which may differ from the final iterate.
//!
//! The annealing state can be checkpointed to a plain-text file after every
//! temperature step and recovered from it on a later run.
//!
//! # References
//!
//! \[1\] [Optimization by Simulated
//! Annealing](https://www.science.org/doi/10.1126/science.220.4598.671)

use std::path::{Path, PathBuf};

use getset::{CopyGetters, Getters, Setters};
use log::{debug, warn};
use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};

use crate::algo::Backend;
use crate::core::{Convergence, Diagnostics, Hook, Run, TraceStep, UserAction};
use crate::pipeline::{ConstraintStack, ObjFn};

/// Options for [`Siman`].
#[derive(Debug, Clone, Getters, CopyGetters, Setters)]
#[getset(set = "pub")]
pub struct SimanOptions {
    /// Initial temperature. Default: `1`.
    #[getset(get_copy = "pub")]
    t_init: f64,
    /// Temperature at which the annealing stops. Default: `1e-8`.
    #[getset(get_copy = "pub")]
    t_min: f64,
    /// Cooling divisor applied after every temperature step; must be greater
    /// than one. Default: `1.05`.
    #[getset(get_copy = "pub")]
    mu_t: f64,
    /// Metropolis trials per temperature step. Default: `100`.
    #[getset(get_copy = "pub")]
    iters_fixed_t: usize,
    /// Maximum candidate offset per element. Default: tenth of the current
    /// magnitude.
    #[getset(get = "pub")]
    max_rand_step: Option<DVector<f64>>,
    /// Redraw infeasible candidates instead of rejecting them outright.
    /// Default: `false`.
    #[getset(get_copy = "pub")]
    stoch_regain_constr: bool,
    /// File the annealing state is checkpointed to after every temperature
    /// step.
    #[getset(get = "pub")]
    save_state: Option<PathBuf>,
    /// File the annealing state is recovered from at the start of the run.
    #[getset(get = "pub")]
    recover_state: Option<PathBuf>,
    /// Seed of the random number generator. Default: entropy.
    #[getset(get_copy = "pub")]
    seed: Option<u64>,
}

impl Default for SimanOptions {
    fn default() -> Self {
        Self {
            t_init: 1.0,
            t_min: 1e-8,
            mu_t: 1.05,
            iters_fixed_t: 100,
            max_rand_step: None,
            stoch_regain_constr: false,
            save_state: None,
            recover_state: None,
            seed: None,
        }
    }
}

/// Simulated annealing backend.
#[derive(Debug, Default)]
pub struct Siman;

const REGAIN_TRIES: usize = 100;

#[derive(Debug)]
struct Checkpoint {
    t: f64,
    fx: f64,
    x: DVector<f64>,
}

impl Checkpoint {
    fn save(&self, path: &Path) {
        let x = self
            .x
            .iter()
            .map(|v| format!("{v:e}"))
            .collect::<Vec<_>>()
            .join(" ");
        let content = format!("t {:e}\nfx {:e}\nx {}\n", self.t, self.fx, x);

        if let Err(error) = std::fs::write(path, content) {
            warn!("cannot write annealing state to {}: {}", path.display(), error);
        }
    }

    fn load(path: &Path, n: usize) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) => {
                warn!(
                    "cannot read annealing state from {}: {}",
                    path.display(),
                    error
                );
                return None;
            }
        };

        let mut t = None;
        let mut fx = None;
        let mut x = None;

        for line in content.lines() {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("t") => t = fields.next().and_then(|v| v.parse().ok()),
                Some("fx") => fx = fields.next().and_then(|v| v.parse().ok()),
                Some("x") => {
                    let values: Option<Vec<f64>> = fields.map(|v| v.parse().ok()).collect();
                    x = values.map(DVector::from_vec);
                }
                _ => {}
            }
        }

        match (t, fx, x) {
            (Some(t), Some(fx), Some(x)) if x.len() == n => Some(Self { t, fx, x }),
            _ => {
                warn!("annealing state in {} is not usable", path.display());
                None
            }
        }
    }
}

fn feasible(stack: &ConstraintStack, x: &DVector<f64>, tol: f64) -> bool {
    if stack.is_empty() {
        return true;
    }

    let c = stack.values(x, None);
    let eq_mask = stack.eq_mask();
    (0..c.len()).all(|i| if eq_mask[i] { c[i].abs() <= tol } else { c[i] >= -tol })
}

impl Backend for Siman {
    const NAME: &'static str = "siman";
    const PATH_BOUNDS: bool = true;

    fn run(&mut self, f: &ObjFn, x0: &DVector<f64>, hook: &mut Hook) -> Run {
        let n = x0.len();
        let options = hook.siman().clone();
        let feas_tol = hook.tol_fun().sqrt();

        let mut rng = match options.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let offset = Uniform::new_inclusive(-1.0, 1.0);

        let mut x = x0.clone();
        for i in 0..n {
            x[i] = x[i].clamp(hook.lower()[i], hook.upper()[i]);
        }

        let mut t = options.t_init;
        let mut recovered_fx = None;

        if let Some(path) = &options.recover_state {
            if let Some(checkpoint) = Checkpoint::load(path, n) {
                t = checkpoint.t;
                x = checkpoint.x;
                recovered_fx = Some(checkpoint.fx);
                debug!("recovered annealing state at t = {}", t);
            }
        }

        let mut fx = recovered_fx.unwrap_or_else(|| f(&x));
        let mut best = x.clone();
        let mut best_f = fx;

        let mut diag = Diagnostics::default();
        let mut conv = Convergence::IterLimit;

        for iter in 0..hook.max_iter() {
            diag.niter = iter + 1;

            if t <= options.t_min {
                conv = Convergence::Converged;
                break;
            }

            for _ in 0..options.iters_fixed_t {
                let mut candidate = None;

                let tries = if options.stoch_regain_constr {
                    REGAIN_TRIES
                } else {
                    1
                };

                for _ in 0..tries {
                    let mut proposal = x.clone();
                    for i in 0..n {
                        let step = match options.max_rand_step.as_ref() {
                            Some(steps) => steps[i],
                            None => 0.1 * x[i].abs().max(1.0),
                        };
                        proposal[i] = (proposal[i] + offset.sample(&mut rng) * step)
                            .clamp(hook.lower()[i], hook.upper()[i]);
                    }

                    if feasible(hook.stack(), &proposal, feas_tol) {
                        candidate = Some(proposal);
                        break;
                    }
                }

                let Some(candidate) = candidate else {
                    continue;
                };

                let f_cand = f(&candidate);
                let delta = f_cand - fx;

                if delta < 0.0 || rng.gen::<f64>() < (-delta / t).exp() {
                    x = candidate;
                    fx = f_cand;

                    if fx < best_f {
                        best = x.clone();
                        best_f = fx;
                    }
                }
            }

            t /= options.mu_t;

            debug!("temperature step {}: t = {}, best = {}", iter, t, best_f);

            if let Some(path) = &options.save_state {
                Checkpoint {
                    t,
                    fx,
                    x: x.clone(),
                }
                .save(path);
            }

            if hook.trace_steps() {
                diag.trace.push(TraceStep {
                    x: best.clone(),
                    fx: best_f,
                });
            }

            if hook.interact(iter, &best, best_f) == UserAction::Stop {
                conv = Convergence::UserStop;
                diag.user_stop = true;
                break;
            }
        }

        if t <= hook.siman().t_min() && conv == Convergence::IterLimit {
            conv = Convergence::Converged;
        }

        diag.nobjf = hook.nobjf();

        Run {
            x: best,
            fx: best_f,
            conv,
            diag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    use crate::testing::bounded_hook;

    fn sphere() -> ObjFn {
        Box::new(|x| x.iter().map(|v| v * v).sum())
    }

    fn annealing_hook(t_min: f64) -> Hook {
        let mut hook = bounded_hook(sphere(), dvector![-5.0, -5.0], dvector![5.0, 5.0]);
        hook.max_iter = 2000;
        hook.siman = {
            let mut options = SimanOptions::default();
            options.set_seed(Some(42)).set_t_min(t_min);
            options
        };
        hook
    }

    #[test]
    fn finds_the_region_of_the_minimum() {
        let mut hook = annealing_hook(1e-3);
        let mut backend = Siman;

        let run = backend.run(&sphere(), &dvector![4.0, -4.0], &mut hook);

        assert!(run.conv.is_success(), "{}", run.conv);
        assert!(run.fx < 0.1, "best objective was {}", run.fx);
    }

    #[test]
    fn candidates_respect_bounds() {
        let f: ObjFn = Box::new(|x| {
            assert!(x[0] >= -1.0 && x[0] <= 1.0);
            x[0] * x[0]
        });
        let checker: ObjFn = Box::new(|x| {
            assert!(x[0] >= -1.0 && x[0] <= 1.0);
            x[0] * x[0]
        });

        let mut hook = bounded_hook(checker, dvector![-1.0], dvector![1.0]);
        hook.max_iter = 50;
        hook.siman = {
            let mut options = SimanOptions::default();
            options.set_seed(Some(7));
            options
        };

        let mut backend = Siman;
        backend.run(&f, &dvector![0.5], &mut hook);
    }

    #[test]
    fn seed_makes_runs_reproducible() {
        let run1 = Siman.run(&sphere(), &dvector![4.0, -4.0], &mut annealing_hook(1e-3));
        let run2 = Siman.run(&sphere(), &dvector![4.0, -4.0], &mut annealing_hook(1e-3));

        assert_abs_diff_eq!(run1.x, run2.x);
        assert_abs_diff_eq!(run1.fx, run2.fx);
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = std::env::temp_dir().join("conmin-siman-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.txt");

        let checkpoint = Checkpoint {
            t: 0.25,
            fx: 9.0,
            x: dvector![1.5, -2.5],
        };
        checkpoint.save(&path);

        // Everything written comes back, including the objective value.
        let loaded = Checkpoint::load(&path, 2).unwrap();
        assert_abs_diff_eq!(loaded.t, 0.25);
        assert_abs_diff_eq!(loaded.fx, 9.0);
        assert_abs_diff_eq!(loaded.x, dvector![1.5, -2.5]);

        // A dimension mismatch is rejected.
        assert!(Checkpoint::load(&path, 3).is_none());

        std::fs::remove_file(&path).unwrap();
    }
}
