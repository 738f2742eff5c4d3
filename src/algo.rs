//! The collection of implemented backends.

use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::core::{Hook, Run};
use crate::pipeline::ObjFn;

pub mod d2_min;
pub mod lm_feasible;
pub mod siman;
pub mod sqp;

pub use d2_min::D2Min;
pub use lm_feasible::LmFeasible;
pub use siman::Siman;
pub use sqp::OctaveSqp;

/// Interface of a backend.
///
/// A backend receives the objective and the [`Hook`] with every pipeline
/// product (constraints, derivatives, tolerances, interaction) and runs its
/// iteration to completion. Backends report their stop reason as an outcome
/// value in [`Run`], never as an error.
pub trait Backend {
    /// Name of the backend.
    const NAME: &'static str;

    /// Whether every point the backend passes to user functions stays within
    /// the declared bounds. When `false`, the driver widens the bounds used
    /// by finite-difference probing to infinity.
    const PATH_BOUNDS: bool;

    /// Runs the minimization from the given initial point in the free
    /// parameter space.
    fn run(&mut self, f: &ObjFn, x0: &DVector<f64>, hook: &mut Hook) -> Run;
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Constrained Levenberg-Marquardt-style minimizer keeping iterates
    /// feasible with respect to bounds.
    #[default]
    LmFeasible,
    /// Sequential quadratic programming with a BFGS Hessian approximation.
    OctaveSqp,
    /// Simulated annealing.
    Siman,
    /// Newton iteration on the analytic or estimated Hessian.
    D2Min,
}

impl Algorithm {
    /// Name of the selected backend.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::LmFeasible => LmFeasible::NAME,
            Algorithm::OctaveSqp => OctaveSqp::NAME,
            Algorithm::Siman => Siman::NAME,
            Algorithm::D2Min => D2Min::NAME,
        }
    }

    /// Whether the selected backend keeps user-visible points within bounds.
    pub fn path_bounds(&self) -> bool {
        match self {
            Algorithm::LmFeasible => LmFeasible::PATH_BOUNDS,
            Algorithm::OctaveSqp => OctaveSqp::PATH_BOUNDS,
            Algorithm::Siman => Siman::PATH_BOUNDS,
            Algorithm::D2Min => D2Min::PATH_BOUNDS,
        }
    }
}

/// Error when parsing a backend name.
#[derive(Debug, Error)]
#[error("unknown algorithm `{0}`")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lm_feasible" => Ok(Algorithm::LmFeasible),
            "octave_sqp" => Ok(Algorithm::OctaveSqp),
            "siman" => Ok(Algorithm::Siman),
            "d2_min" => Ok(Algorithm::D2Min),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Solves the KKT system of an equality-constrained quadratic subproblem.
///
/// Minimizes `1/2 dᵀBd + gᵀd` subject to `Aᵀd + c = 0`, where the columns of
/// `A` are the constraint gradients. Returns the step and the Lagrange
/// multipliers, or `None` when the system is singular.
pub(crate) fn solve_kkt(
    b: &DMatrix<f64>,
    a: &DMatrix<f64>,
    g: &DVector<f64>,
    c: &DVector<f64>,
) -> Option<(DVector<f64>, DVector<f64>)> {
    let n = b.nrows();
    let m = a.ncols();

    let mut kkt = DMatrix::zeros(n + m, n + m);
    kkt.view_mut((0, 0), (n, n)).copy_from(b);
    kkt.view_mut((0, n), (n, m)).copy_from(&(-a));
    kkt.view_mut((n, 0), (m, n)).copy_from(&a.transpose());

    let mut rhs = DVector::zeros(n + m);
    rhs.rows_mut(0, n).copy_from(&(-g));
    rhs.rows_mut(n, m).copy_from(&(-c));

    let solution = kkt.lu().solve(&rhs)?;

    let d = solution.rows(0, n).into_owned();
    let lambda = solution.rows(n, m).into_owned();
    Some((d, lambda))
}

/// Damped BFGS update (Powell's modification) of the Hessian approximation.
///
/// The damping keeps the approximation positive definite even when the
/// curvature condition `sᵀy > 0` fails along the step.
pub(crate) fn bfgs_update(b: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) {
    let bs = &*b * s;
    let s_b_s = s.dot(&bs);
    let s_y = s.dot(y);

    if s_b_s <= f64::EPSILON {
        return;
    }

    let theta = if s_y >= 0.2 * s_b_s {
        1.0
    } else {
        0.8 * s_b_s / (s_b_s - s_y)
    };

    let r = theta * y + (1.0 - theta) * &bs;
    let s_r = s.dot(&r);

    if s_r.abs() <= f64::EPSILON {
        return;
    }

    *b -= &bs * bs.transpose() / s_b_s;
    *b += &r * r.transpose() / s_r;
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn algorithm_names_round_trip() {
        for name in ["lm_feasible", "octave_sqp", "siman", "d2_min"] {
            let algorithm: Algorithm = name.parse().unwrap();
            assert_eq!(algorithm.name(), name);
        }
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let err = "gradient_descent".parse::<Algorithm>().unwrap_err();
        assert_eq!(err.to_string(), "unknown algorithm `gradient_descent`");
    }

    #[test]
    fn default_algorithm_keeps_path_within_bounds() {
        assert_eq!(Algorithm::default(), Algorithm::LmFeasible);
        assert!(Algorithm::default().path_bounds());
    }

    #[test]
    fn kkt_solves_an_equality_constrained_quadratic() {
        // Minimize 1/2 (d1² + d2²) + d1 subject to d1 + d2 = 1.
        let b = dmatrix![1.0, 0.0; 0.0, 1.0];
        let a = dmatrix![1.0; 1.0];
        let g = dvector![1.0, 0.0];
        let c = dvector![-1.0];

        let (d, lambda) = solve_kkt(&b, &a, &g, &c).unwrap();

        assert_abs_diff_eq!(d, dvector![0.0, 1.0], epsilon = 1e-12);
        assert_abs_diff_eq!(lambda[0], 1.0, epsilon = 1e-12);
        // The constraint holds exactly.
        assert_abs_diff_eq!(d[0] + d[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn kkt_reports_singular_systems() {
        let b = dmatrix![0.0, 0.0; 0.0, 0.0];
        let a = DMatrix::zeros(2, 0);
        let g = dvector![1.0, 1.0];
        let c = DVector::zeros(0);

        assert!(solve_kkt(&b, &a, &g, &c).is_none());
    }

    #[test]
    fn bfgs_update_preserves_positive_definiteness() {
        let mut b = DMatrix::identity(2, 2);

        // Negative curvature pair; the damping must keep B usable.
        let s = dvector![1.0, 0.0];
        let y = dvector![-0.5, 0.1];
        bfgs_update(&mut b, &s, &y);

        assert!(b.clone().cholesky().is_some());

        // A well-behaved pair moves B toward the true curvature.
        let s = dvector![0.0, 1.0];
        let y = dvector![0.0, 3.0];
        bfgs_update(&mut b, &s, &y);

        assert!(b.clone().cholesky().is_some());
        assert_abs_diff_eq!(b[(1, 1)], 3.0, epsilon = 1e-12);
    }
}
