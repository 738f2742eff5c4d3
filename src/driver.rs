//! High-level minimization driver.
//!
//! [`minimize`] runs the whole pipeline: the parameter layout is derived from
//! the initial values, the per-parameter configuration is resolved and
//! validated, user functions are adapted to the flat interface, fixed
//! parameters are eliminated, constraints are stacked and the selected
//! backend is dispatched. The result is re-expanded to the structure of the
//! initial values.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nalgebra::DVector;
use thiserror::Error;

use crate::algo::{
    Algorithm, Backend, D2Min, LmFeasible, OctaveSqp, Siman, UnknownAlgorithm,
};
use crate::core::{
    resolve, BoolBroadcast, Broadcast, ConfigError, ConfigSource, ConfigVectors, Convergence,
    Diagnostics, FinDiffOverride, FinDiffType, Hook, Layout, LayoutError, ParamEntry, Params,
    UserCallback,
};
use crate::derivatives::{
    complex_step_gradient, complex_step_jacobian, DiffOptions, GradientEstimator,
    HessianEstimator, JacobianEstimator, DEFAULT_CSTEP,
};
use crate::pipeline::adapter::{
    adapt_constraint_jac, adapt_constraint_values, adapt_gradient, adapt_hessian,
    adapt_objective, ComplexScalarFn, ConstraintFn, Gradient, Hessian, Objective,
};
use crate::pipeline::fixed::{FixedError, FixedPartition};
use crate::pipeline::stack::{ConstraintStack, LinearConstraint, StackError, StackInputs};
use crate::pipeline::{select_matrix_rows, ConsFn, ConsJacFn, GradFn, HessFn, ObjFn};

use crate::algo::siman::SimanOptions;

/// Error of the minimization driver.
///
/// Driver errors are always raised before the first objective evaluation;
/// once the iteration starts, every outcome is reported through
/// [`Outcome::conv`].
#[derive(Debug, Error)]
pub enum Error {
    /// The parameter structure is invalid.
    #[error("invalid parameter structure: {0}")]
    Layout(#[from] LayoutError),
    /// The per-parameter configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The fixed-parameter mask is invalid.
    #[error("invalid fixed mask: {0}")]
    Fixed(#[from] FixedError),
    /// A linear constraint has the wrong shape.
    #[error("invalid linear constraint: {0}")]
    Constraint(#[from] StackError),
    /// The algorithm name is not recognized.
    #[error(transparent)]
    Algorithm(#[from] UnknownAlgorithm),
}

/// Settings of one minimization run.
///
/// Everything defaults; construct with struct update syntax:
///
/// ```rust
/// use conmin::Settings;
///
/// let settings = Settings {
///     tol_fun: 1e-10,
///     ..Default::default()
/// };
/// ```
pub struct Settings {
    /// Backend selection.
    pub algorithm: Algorithm,
    /// Declared parameter names, used when the initial values are flat but
    /// structured functions are supplied.
    pub param_order: Option<Vec<String>>,
    /// Dimensions of the declared names (default: all scalar).
    pub param_dims: Option<Vec<usize>>,
    /// Per-name configuration table. Mutually exclusive with the direct
    /// configuration vectors below.
    pub param_config: Option<Vec<(String, ParamEntry)>>,
    /// Lower bounds.
    pub lbound: Option<Broadcast>,
    /// Upper bounds.
    pub ubound: Option<Broadcast>,
    /// Fixed-parameter mask.
    pub fixed: Option<BoolBroadcast>,
    /// Relative finite-difference step sizes.
    pub diffp: Option<Broadcast>,
    /// One-sided difference flags.
    pub diff_onesided: Option<BoolBroadcast>,
    /// Typical parameter magnitudes.
    pub typical_x: Option<Broadcast>,
    /// Maximum fractional parameter change per iteration.
    pub max_fract_change: Option<Broadcast>,
    /// Desired fractional precision per parameter.
    pub fract_prec: Option<Broadcast>,
    /// Uniform relative finite-difference step; overrides `diffp` with a
    /// warning.
    pub fin_diff_rel_step: Option<f64>,
    /// Uniform difference scheme; overrides `diff_onesided` with a warning.
    pub fin_diff_type: Option<FinDiffType>,
    /// Imaginary perturbation for complex-step derivatives.
    pub cstep: f64,
    /// Stopping tolerance on the objective change.
    pub tol_fun: f64,
    /// Stopping tolerance on the parameter change.
    pub tol_x: f64,
    /// Iteration limit.
    pub max_iter: usize,
    /// Analytic gradient of the objective.
    pub objf_grad: Option<Gradient>,
    /// Analytic Hessian of the objective.
    pub objf_hessian: Option<Hessian>,
    /// Complex-step capable objective used for gradient estimation. Mutually
    /// exclusive with `objf_grad`.
    pub complex_step_objf: Option<ComplexScalarFn>,
    /// General inequality constraints (feasible when the value is
    /// non-negative).
    pub inequc: Option<ConstraintFn>,
    /// General equality constraints (feasible when the value is zero).
    pub equc: Option<ConstraintFn>,
    /// Linear inequality constraints `Mᵀp + v >= 0`.
    pub lin_inequc: Option<LinearConstraint>,
    /// Linear equality constraints `Mᵀp + v = 0`.
    pub lin_equc: Option<LinearConstraint>,
    /// Per-iteration user callbacks; the run stops when any of them requests
    /// it.
    pub user_interaction: Vec<UserCallback>,
    /// Evaluate independent finite-difference probes on separate threads.
    pub parallel_local: bool,
    /// Record every accepted iterate in the diagnostics.
    pub trace_steps: bool,
    /// Simulated annealing options.
    pub siman: SimanOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            param_order: None,
            param_dims: None,
            param_config: None,
            lbound: None,
            ubound: None,
            fixed: None,
            diffp: None,
            diff_onesided: None,
            typical_x: None,
            max_fract_change: None,
            fract_prec: None,
            fin_diff_rel_step: None,
            fin_diff_type: None,
            cstep: DEFAULT_CSTEP,
            tol_fun: 1e-8,
            tol_x: 1e-8,
            max_iter: 100,
            objf_grad: None,
            objf_hessian: None,
            complex_step_objf: None,
            inequc: None,
            equc: None,
            lin_inequc: None,
            lin_equc: None,
            user_interaction: Vec::new(),
            parallel_local: false,
            trace_steps: false,
            siman: SimanOptions::default(),
        }
    }
}

/// Result of a minimization run.
#[derive(Debug)]
pub struct Outcome {
    /// Final parameter values, in the structure of the initial values.
    pub params: Params,
    /// Final objective value.
    pub objf: f64,
    /// Stop reason (positive code means success).
    pub conv: Convergence,
    /// Run bookkeeping.
    pub diag: Diagnostics,
}

/// Minimizes the objective subject to the configured constraints.
///
/// All validation failures are reported as [`Error`] before the objective is
/// evaluated even once; iteration outcomes (including the iteration limit and
/// user stops) are reported through [`Outcome::conv`].
pub fn minimize(
    objective: Objective,
    initial: Params,
    settings: Settings,
) -> Result<Outcome, Error> {
    let layout = build_layout(&initial, &settings)?;
    let x0_full = layout.flatten(&initial)?;
    let np = layout.np();

    // Backends take the square root of TolFun as the feasibility tolerance,
    // so negative tolerances must not reach them.
    for (item, got) in [("TolFun", settings.tol_fun), ("TolX", settings.tol_x)] {
        if got < 0.0 {
            return Err(ConfigError::NegativeTolerance { item, got }.into());
        }
    }

    if settings.objf_grad.is_some() && settings.complex_step_objf.is_some() {
        return Err(ConfigError::DerivativeConflict("the objective").into());
    }
    for (constraint, label) in [
        (&settings.inequc, "the inequality constraints"),
        (&settings.equc, "the equality constraints"),
    ] {
        if let Some(constraint) = constraint {
            if constraint.jacobian.is_some() && constraint.complex_step.is_some() {
                return Err(ConfigError::DerivativeConflict(label).into());
            }
        }
    }

    let source = config_source(&settings)?;
    let fin_diff = FinDiffOverride {
        rel_step: settings.fin_diff_rel_step,
        scheme: settings.fin_diff_type,
    };
    let config = resolve(&layout, &source, fin_diff, Some(settings.cstep))?;

    for lin in [&settings.lin_inequc, &settings.lin_equc]
        .into_iter()
        .flatten()
    {
        if lin.m.nrows() != np {
            return Err(StackError::RowMismatch {
                rows: lin.m.nrows(),
                expected: np,
            }
            .into());
        }
    }

    // Fixed-parameter elimination. Everything needing full-space values
    // (linear constraint folding, per-element probe policies) happens before
    // the configuration subset at the end.
    let partition = FixedPartition::new(&config.fixed, &x0_full)?;
    partition.warn_fixed_outside_bounds(&config.lbound, &config.ubound);

    let path_bounds = settings.algorithm.path_bounds();
    let full_diff = diff_options_full(&config, &settings, path_bounds);

    let lin_inequc = settings
        .lin_inequc
        .as_ref()
        .map(|l| partition.reduce_linear(l));
    let lin_equc = settings
        .lin_equc
        .as_ref()
        .map(|l| partition.reduce_linear(l));

    let nobjf = Arc::new(AtomicUsize::new(0));
    let objf_full = adapt_objective(&layout, objective);
    let counted: ObjFn = {
        let counter = Arc::clone(&nobjf);
        Box::new(move |x| {
            counter.fetch_add(1, Ordering::Relaxed);
            objf_full(x)
        })
    };
    let objf_free: Arc<ObjFn> = Arc::new(partition.wrap_objective(counted));

    let gen_inequc = settings
        .inequc
        .map(|c| general_constraint(&layout, &partition, c, &x0_full, &full_diff, settings.cstep))
        .transpose()?;
    let gen_equc = settings
        .equc
        .map(|c| general_constraint(&layout, &partition, c, &x0_full, &full_diff, settings.cstep))
        .transpose()?;

    // The configuration subset is the very last step of the elimination.
    let free_config = config.subset(partition.free_indices());
    let free_diff = DiffOptions {
        diffp: free_config.diffp.clone(),
        diff_onesided: free_config.diff_onesided.clone(),
        typical_x: free_config.typical_x.clone(),
        lower: probe_bound(&free_config.lbound, path_bounds, f64::NEG_INFINITY),
        upper: probe_bound(&free_config.ubound, path_bounds, f64::INFINITY),
        kind: FinDiffType::Central,
        parallel: settings.parallel_local,
    };

    let grad = build_gradient(
        &layout,
        &partition,
        settings.objf_grad,
        settings.complex_step_objf,
        settings.cstep,
        Arc::clone(&objf_free),
        free_diff.clone(),
    );

    let hess = build_hessian(
        &layout,
        &partition,
        settings.objf_hessian,
        settings.algorithm,
        Arc::clone(&objf_free),
        free_diff,
    );

    let x0_free = partition.restrict(&x0_full);
    let stack = ConstraintStack::build(
        StackInputs {
            lower: free_config.lbound.clone(),
            upper: free_config.ubound.clone(),
            lin_inequc,
            lin_equc,
            gen_inequc,
            gen_equc,
        },
        &x0_free,
    );

    let mut hook = Hook {
        stack,
        lower: free_config.lbound,
        upper: free_config.ubound,
        tol_fun: settings.tol_fun,
        tol_x: settings.tol_x,
        max_iter: settings.max_iter,
        max_fract_change: free_config.max_fract_change,
        fract_prec: free_config.fract_prec,
        grad,
        hess,
        callbacks: settings.user_interaction,
        trace_steps: settings.trace_steps,
        siman: settings.siman,
        nobjf: Arc::clone(&nobjf),
    };

    let f: ObjFn = {
        let shared = Arc::clone(&objf_free);
        Box::new(move |x| shared(x))
    };

    let run = match settings.algorithm {
        Algorithm::LmFeasible => LmFeasible::default().run(&f, &x0_free, &mut hook),
        Algorithm::OctaveSqp => OctaveSqp::default().run(&f, &x0_free, &mut hook),
        Algorithm::Siman => Siman.run(&f, &x0_free, &mut hook),
        Algorithm::D2Min => D2Min::default().run(&f, &x0_free, &mut hook),
    };

    let x_full = partition.reconstitute(&run.x);
    let params = if initial.is_named() {
        Params::Named(layout.unflatten_named(&x_full))
    } else {
        Params::Flat(x_full)
    };

    Ok(Outcome {
        params,
        objf: run.fx,
        conv: run.conv,
        diag: run.diag,
    })
}

fn build_layout(initial: &Params, settings: &Settings) -> Result<Layout, Error> {
    match initial {
        Params::Named(blocks) => Ok(Layout::from_named(blocks)?),
        Params::Flat(values) => match &settings.param_order {
            Some(order) => Ok(Layout::from_order(
                order.clone(),
                settings.param_dims.clone(),
            )?),
            None => Ok(Layout::anonymous(values.len())?),
        },
    }
}

fn config_source(settings: &Settings) -> Result<ConfigSource, Error> {
    let vectors = ConfigVectors {
        lbound: settings.lbound.clone(),
        ubound: settings.ubound.clone(),
        fixed: settings.fixed.clone(),
        diffp: settings.diffp.clone(),
        diff_onesided: settings.diff_onesided.clone(),
        typical_x: settings.typical_x.clone(),
        max_fract_change: settings.max_fract_change.clone(),
        fract_prec: settings.fract_prec.clone(),
    };

    let vectors_supplied = !vectors.is_empty();

    match &settings.param_config {
        Some(table) => {
            if vectors_supplied {
                return Err(ConfigError::MixedModes.into());
            }
            Ok(ConfigSource::Table(table.clone()))
        }
        None if vectors_supplied => Ok(ConfigSource::Vectors(vectors)),
        None => Ok(ConfigSource::Defaults),
    }
}

fn probe_bound(actual: &DVector<f64>, path_bounds: bool, infinite: f64) -> DVector<f64> {
    if path_bounds {
        actual.clone()
    } else {
        DVector::from_element(actual.len(), infinite)
    }
}

fn diff_options_full(
    config: &crate::core::ResolvedConfig,
    settings: &Settings,
    path_bounds: bool,
) -> DiffOptions {
    DiffOptions {
        diffp: config.diffp.clone(),
        diff_onesided: config.diff_onesided.clone(),
        typical_x: config.typical_x.clone(),
        lower: probe_bound(&config.lbound, path_bounds, f64::NEG_INFINITY),
        upper: probe_bound(&config.ubound, path_bounds, f64::INFINITY),
        kind: FinDiffType::Central,
        parallel: settings.parallel_local,
    }
}

fn build_gradient(
    layout: &Layout,
    partition: &FixedPartition,
    analytic: Option<Gradient>,
    complex_step: Option<ComplexScalarFn>,
    cstep: f64,
    objf_free: Arc<ObjFn>,
    free_diff: DiffOptions,
) -> GradFn {
    if let Some(gradient) = analytic {
        return partition.wrap_gradient(adapt_gradient(layout, gradient));
    }

    if let Some(f) = complex_step {
        let partition = partition.clone();
        return Box::new(move |free| {
            let full = partition.reconstitute(free);
            partition.restrict(&complex_step_gradient(&*f, &full, cstep))
        });
    }

    let mut estimator = GradientEstimator::new(free_diff);
    Box::new(move |free| estimator.estimate(&objf_free, free))
}

fn build_hessian(
    layout: &Layout,
    partition: &FixedPartition,
    analytic: Option<Hessian>,
    algorithm: Algorithm,
    objf_free: Arc<ObjFn>,
    free_diff: DiffOptions,
) -> Option<HessFn> {
    if let Some(hessian) = analytic {
        return Some(partition.wrap_hessian(adapt_hessian(layout, hessian)));
    }

    // Only the Newton backend needs second derivatives; the numeric estimate
    // is too expensive to compute speculatively for the others.
    if algorithm == Algorithm::D2Min {
        let mut estimator = HessianEstimator::new(free_diff);
        return Some(Box::new(move |free| estimator.estimate(&objf_free, free)));
    }

    None
}

fn general_constraint(
    layout: &Layout,
    partition: &FixedPartition,
    constraint: ConstraintFn,
    x0_full: &DVector<f64>,
    full_diff: &DiffOptions,
    cstep: f64,
) -> Result<(ConsFn, ConsJacFn, usize), Error> {
    let values: Arc<ConsFn> = Arc::new(adapt_constraint_values(layout, constraint.values));
    let rows = values(x0_full, None).len();

    let jac_full: ConsJacFn = if let Some(jacobian) = constraint.jacobian {
        adapt_constraint_jac(layout, jacobian, rows)
    } else if let Some(f) = constraint.complex_step {
        Box::new(move |x, idx| {
            let full = complex_step_jacobian(&*f, x, cstep);
            match idx {
                Some(idx) => select_matrix_rows(&full, idx),
                None => full,
            }
        })
    } else {
        let shared = Arc::clone(&values);
        let probe: ConsFn = Box::new(move |x, idx| shared(x, idx));
        let mut estimator = JacobianEstimator::new(full_diff.clone());
        Box::new(move |x, idx| {
            let full = estimator.estimate(&probe, x);
            match idx {
                Some(idx) => select_matrix_rows(&full, idx),
                None => full,
            }
        })
    };

    let values_box: ConsFn = {
        let shared = Arc::clone(&values);
        Box::new(move |x, idx| shared(x, idx))
    };

    Ok((
        partition.wrap_constraint_values(values_box),
        partition.wrap_constraint_jac(jac_full),
        rows,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector, DMatrix};

    use crate::core::{NamedBlocks, UserAction};

    fn sphere() -> Objective {
        Objective::flat(|x: &DVector<f64>| x.iter().map(|v| v * v).sum())
    }

    fn flat(outcome: &Outcome) -> &DVector<f64> {
        match &outcome.params {
            Params::Flat(v) => v,
            Params::Named(_) => panic!("expected flat parameters"),
        }
    }

    #[test]
    fn defaults_minimize_a_simple_objective() {
        let outcome = minimize(
            sphere(),
            Params::flat(vec![3.0, -2.0]),
            Settings::default(),
        )
        .unwrap();

        assert!(outcome.conv.is_success(), "{}", outcome.conv);
        assert_abs_diff_eq!(flat(&outcome), &dvector![0.0, 0.0], epsilon = 1e-4);
        assert!(outcome.objf < 1e-6);
        assert!(outcome.diag.nobjf > 0);
    }

    #[test]
    fn nonlinear_equality_constraint_with_default_algorithm() {
        // Minimize p1² + p2² subject to p1² + 1 - p2 = 0. The minimum of the
        // constrained problem is (0, 1).
        let settings = Settings {
            equc: Some(ConstraintFn::new(|x: &DVector<f64>| {
                dvector![x[0] * x[0] + 1.0 - x[1]]
            })),
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![-2.0, 5.0]), settings).unwrap();

        assert!(outcome.conv.code() > 0, "{}", outcome.conv);
        assert_abs_diff_eq!(flat(&outcome), &dvector![0.0, 1.0], epsilon = 1e-3);
    }

    #[test]
    fn all_fixed_fails_before_any_evaluation() {
        let objective = Objective::flat(|_: &DVector<f64>| -> f64 {
            panic!("the objective must not be evaluated")
        });

        let settings = Settings {
            fixed: Some(true.into()),
            ..Default::default()
        };

        let result = minimize(objective, Params::flat(vec![1.0, 2.0]), settings);
        assert!(matches!(result, Err(Error::Fixed(FixedError::AllFixed))));
    }

    #[test]
    fn crossed_bounds_fail_before_any_evaluation() {
        let objective = Objective::flat(|_: &DVector<f64>| -> f64 {
            panic!("the objective must not be evaluated")
        });

        let settings = Settings {
            lbound: Some(2.0.into()),
            ubound: Some(1.0.into()),
            ..Default::default()
        };

        let result = minimize(objective, Params::flat(vec![0.0]), settings);
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::BoundOrder(0)))
        ));
    }

    #[test]
    fn mixed_configuration_modes_are_rejected() {
        let settings = Settings {
            lbound: Some(0.0.into()),
            param_config: Some(vec![("p".to_owned(), ParamEntry::default())]),
            ..Default::default()
        };

        let result = minimize(sphere(), Params::flat(vec![1.0]), settings);
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::MixedModes))
        ));
    }

    #[test]
    fn fixed_parameter_keeps_its_value() {
        let settings = Settings {
            fixed: Some(vec![false, true].into()),
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![3.0, 7.0]), settings).unwrap();

        assert!(outcome.conv.is_success(), "{}", outcome.conv);
        let params = flat(&outcome);
        assert_abs_diff_eq!(params[0], 0.0, epsilon = 1e-4);
        // The fixed parameter is reconstituted untouched.
        assert_abs_diff_eq!(params[1], 7.0);
    }

    #[test]
    fn named_parameters_round_trip() {
        let objective = Objective::named(|p: &NamedBlocks| {
            let a = p.get("a").unwrap();
            let b = p.get("b").unwrap();
            (a[0] - 1.0).powi(2) + (a[1] - 2.0).powi(2) + (b[0] - 3.0).powi(2)
        });

        let mut blocks = NamedBlocks::new();
        blocks.push("a", dvector![0.0, 0.0]);
        blocks.push("b", dvector![0.0]);

        let outcome = minimize(objective, Params::named(blocks), Settings::default()).unwrap();

        assert!(outcome.conv.is_success(), "{}", outcome.conv);
        let Params::Named(result) = &outcome.params else {
            panic!("expected named parameters");
        };
        assert_abs_diff_eq!(
            result.get("a").unwrap(),
            &dvector![1.0, 2.0],
            epsilon = 1e-4
        );
        assert_abs_diff_eq!(result.get("b").unwrap(), &dvector![3.0], epsilon = 1e-4);
    }

    #[test]
    fn bounds_constrain_the_result() {
        let settings = Settings {
            lbound: Some(vec![1.0, f64::NEG_INFINITY].into()),
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![3.0, 2.0]), settings).unwrap();

        assert!(outcome.conv.is_success(), "{}", outcome.conv);
        let params = flat(&outcome);
        assert_abs_diff_eq!(params[0], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(params[1], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn linear_inequality_is_honored() {
        // x1 + x2 - 1 >= 0 pushes the sphere minimum to (0.5, 0.5).
        let settings = Settings {
            lin_inequc: Some(LinearConstraint {
                m: dmatrix![1.0; 1.0],
                v: dvector![-1.0],
            }),
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![2.0, 2.0]), settings).unwrap();

        assert!(outcome.conv.is_success(), "{}", outcome.conv);
        let params = flat(&outcome);
        assert_abs_diff_eq!(params, &dvector![0.5, 0.5], epsilon = 1e-3);
    }

    #[test]
    fn linear_constraint_shape_is_validated() {
        let settings = Settings {
            lin_equc: Some(LinearConstraint {
                m: DMatrix::zeros(3, 1),
                v: dvector![0.0],
            }),
            ..Default::default()
        };

        let result = minimize(sphere(), Params::flat(vec![1.0, 1.0]), settings);
        assert!(matches!(
            result,
            Err(Error::Constraint(StackError::RowMismatch {
                rows: 3,
                expected: 2,
            }))
        ));
    }

    #[test]
    fn analytic_gradient_is_used() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let settings = Settings {
            objf_grad: Some(Gradient::flat(move |x: &DVector<f64>| {
                counter.fetch_add(1, Ordering::SeqCst);
                2.0 * x
            })),
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![3.0, -2.0]), settings).unwrap();

        assert!(outcome.conv.is_success(), "{}", outcome.conv);
        assert!(calls.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn conflicting_derivative_methods_are_rejected() {
        let settings = Settings {
            objf_grad: Some(Gradient::flat(|x: &DVector<f64>| 2.0 * x)),
            complex_step_objf: Some(Box::new(|z| z[0] * z[0] + z[1] * z[1])),
            ..Default::default()
        };

        let result = minimize(sphere(), Params::flat(vec![1.0, 1.0]), settings);
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::DerivativeConflict(_)))
        ));
    }

    #[test]
    fn complex_step_objective_drives_the_gradient() {
        let settings = Settings {
            complex_step_objf: Some(Box::new(|z| z[0] * z[0] + z[1] * z[1])),
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![3.0, -2.0]), settings).unwrap();

        assert!(outcome.conv.is_success(), "{}", outcome.conv);
        assert_abs_diff_eq!(flat(&outcome), &dvector![0.0, 0.0], epsilon = 1e-4);
    }

    #[test]
    fn user_callback_stops_the_run() {
        let settings = Settings {
            user_interaction: vec![Box::new(|_| UserAction::Stop)],
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![3.0, -2.0]), settings).unwrap();

        assert_eq!(outcome.conv, Convergence::UserStop);
        assert_eq!(outcome.conv.code(), -1);
        assert!(outcome.diag.user_stop);
    }

    #[test]
    fn any_of_several_user_callbacks_stops_the_run() {
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&observed);

        let settings = Settings {
            user_interaction: vec![
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    UserAction::Continue
                }),
                Box::new(|_| UserAction::Stop),
            ],
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![3.0, -2.0]), settings).unwrap();

        assert_eq!(outcome.conv, Convergence::UserStop);
        // The observing callback still saw the iteration.
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn equal_bounds_pin_a_parameter() {
        // lbound == ubound is a legal way to pin an element; the run must
        // still make progress on the remaining ones.
        let settings = Settings {
            lbound: Some(vec![1.0, -5.0].into()),
            ubound: Some(vec![1.0, 5.0].into()),
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![1.0, 3.0]), settings).unwrap();

        assert!(outcome.conv.is_success(), "{}", outcome.conv);
        let params = flat(&outcome);
        assert_abs_diff_eq!(params[0], 1.0);
        assert_abs_diff_eq!(params[1], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn negative_tolerances_fail_before_any_evaluation() {
        let objective = Objective::flat(|_: &DVector<f64>| -> f64 {
            panic!("the objective must not be evaluated")
        });

        let settings = Settings {
            tol_fun: -1e-3,
            ..Default::default()
        };

        let result = minimize(objective, Params::flat(vec![1.0]), settings);
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::NegativeTolerance {
                item: "TolFun",
                ..
            }))
        ));
    }

    #[test]
    fn trace_records_iterates_when_requested() {
        let settings = Settings {
            trace_steps: true,
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![3.0, -2.0]), settings).unwrap();

        assert!(!outcome.diag.trace.is_empty());
        let last = outcome.diag.trace.last().unwrap();
        assert_abs_diff_eq!(last.fx, outcome.objf);
    }

    #[test]
    fn newton_backend_with_numeric_hessian() {
        let settings = Settings {
            algorithm: Algorithm::D2Min,
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![3.0, -2.0]), settings).unwrap();

        assert!(outcome.conv.is_success(), "{}", outcome.conv);
        assert_abs_diff_eq!(flat(&outcome), &dvector![0.0, 0.0], epsilon = 1e-4);
    }

    #[test]
    fn sqp_backend_solves_the_constrained_scenario() {
        let settings = Settings {
            algorithm: Algorithm::OctaveSqp,
            equc: Some(ConstraintFn::with_jacobian(
                |x: &DVector<f64>| dvector![x[0] * x[0] + 1.0 - x[1]],
                |x: &DVector<f64>| dmatrix![2.0 * x[0], -1.0],
            )),
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![-2.0, 5.0]), settings).unwrap();

        assert!(outcome.conv.code() > 0, "{}", outcome.conv);
        assert_abs_diff_eq!(flat(&outcome), &dvector![0.0, 1.0], epsilon = 1e-3);
    }

    #[test]
    fn siman_backend_runs_to_completion() {
        let settings = Settings {
            algorithm: Algorithm::Siman,
            lbound: Some((-5.0).into()),
            ubound: Some(5.0.into()),
            max_iter: 500,
            siman: {
                let mut options = SimanOptions::default();
                options.set_seed(Some(1)).set_t_min(1e-2);
                options
            },
            ..Default::default()
        };

        let outcome = minimize(sphere(), Params::flat(vec![4.0, -4.0]), settings).unwrap();

        assert!(outcome.conv.is_success(), "{}", outcome.conv);
        assert!(outcome.objf < 0.5);
    }
}
