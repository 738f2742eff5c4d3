//! Per-parameter configuration and its resolution to flat vectors.
//!
//! Configuration (bounds, fixed flags, finite-difference steps and so on) can
//! be supplied in one of two mutually exclusive modes: directly as vectors
//! over the flat parameter space, or as a per-parameter-name table which is
//! expanded through the [layout](crate::core::Layout). The resolver
//! produces one canonical [`ResolvedConfig`] either way.

use log::warn;
use nalgebra::DVector;
use thiserror::Error;

use super::params::Layout;

/// Error while resolving the per-parameter configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration table and direct configuration vectors were both
    /// supplied.
    #[error("per-name configuration table and direct configuration vectors are mutually exclusive")]
    MixedModes,
    /// A non-scalar configuration item has the wrong length.
    #[error("`{item}` must be a scalar or have {expected} elements, got {got}")]
    Length {
        /// Name of the configuration item.
        item: &'static str,
        /// Expected element count.
        expected: usize,
        /// Supplied element count.
        got: usize,
    },
    /// The configuration table refers to a name not present in the layout.
    #[error("unknown parameter name `{0}` in configuration table")]
    UnknownName(String),
    /// A finite-difference step is not positive.
    #[error("`diffp` must be positive, got {got} at element {index}")]
    NonPositiveStep {
        /// Flat element index.
        index: usize,
        /// Offending value.
        got: f64,
    },
    /// A typical magnitude is zero.
    #[error("`TypicalX` must be nonzero at element {0}")]
    ZeroTypicalX(usize),
    /// A lower bound exceeds the corresponding upper bound.
    #[error("lower bound larger than upper bound at element {0}")]
    BoundOrder(usize),
    /// A non-negative configuration item has a negative value.
    #[error("`{item}` must be non-negative, got {got} at element {index}")]
    Negative {
        /// Name of the configuration item.
        item: &'static str,
        /// Flat element index.
        index: usize,
        /// Offending value.
        got: f64,
    },
    /// The complex step size is not positive.
    #[error("`cstep` must be positive, got {0}")]
    NonPositiveCstep(f64),
    /// A stopping tolerance is negative.
    #[error("`{item}` must be non-negative, got {got}")]
    NegativeTolerance {
        /// Name of the tolerance.
        item: &'static str,
        /// Offending value.
        got: f64,
    },
    /// Two derivative methods were requested for the same function.
    #[error("analytic derivative and complex-step derivative of {0} are mutually exclusive")]
    DerivativeConflict(&'static str),
}

/// A scalar broadcast over the parameter space or an explicit vector.
#[derive(Debug, Clone)]
pub enum Broadcast {
    /// One value for every element.
    Scalar(f64),
    /// One value per element.
    Vector(DVector<f64>),
}

impl Broadcast {
    fn expand(&self, n: usize, item: &'static str) -> Result<DVector<f64>, ConfigError> {
        match self {
            Broadcast::Scalar(value) => Ok(DVector::from_element(n, *value)),
            Broadcast::Vector(values) => {
                if values.len() != n {
                    return Err(ConfigError::Length {
                        item,
                        expected: n,
                        got: values.len(),
                    });
                }
                Ok(values.clone())
            }
        }
    }
}

impl From<f64> for Broadcast {
    fn from(value: f64) -> Self {
        Broadcast::Scalar(value)
    }
}

impl From<Vec<f64>> for Broadcast {
    fn from(values: Vec<f64>) -> Self {
        Broadcast::Vector(DVector::from_vec(values))
    }
}

impl From<DVector<f64>> for Broadcast {
    fn from(values: DVector<f64>) -> Self {
        Broadcast::Vector(values)
    }
}

/// A boolean scalar broadcast or an explicit boolean vector.
#[derive(Debug, Clone)]
pub enum BoolBroadcast {
    /// One flag for every element.
    Scalar(bool),
    /// One flag per element.
    Vector(Vec<bool>),
}

impl BoolBroadcast {
    fn expand(&self, n: usize, item: &'static str) -> Result<Vec<bool>, ConfigError> {
        match self {
            BoolBroadcast::Scalar(value) => Ok(vec![*value; n]),
            BoolBroadcast::Vector(values) => {
                if values.len() != n {
                    return Err(ConfigError::Length {
                        item,
                        expected: n,
                        got: values.len(),
                    });
                }
                Ok(values.clone())
            }
        }
    }
}

impl From<bool> for BoolBroadcast {
    fn from(value: bool) -> Self {
        BoolBroadcast::Scalar(value)
    }
}

impl From<Vec<bool>> for BoolBroadcast {
    fn from(values: Vec<bool>) -> Self {
        BoolBroadcast::Vector(values)
    }
}

/// Finite-difference scheme selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinDiffType {
    /// One-sided (forward) differences.
    Forward,
    /// Central differences.
    Central,
}

/// Configuration supplied directly as vectors over the flat parameter space.
///
/// Every item is optional; missing items keep their defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigVectors {
    /// Lower bounds. Default: negative infinity.
    pub lbound: Option<Broadcast>,
    /// Upper bounds. Default: positive infinity.
    pub ubound: Option<Broadcast>,
    /// Fixed-parameter mask. Default: all free.
    pub fixed: Option<BoolBroadcast>,
    /// Relative finite-difference step sizes. Default: unset.
    pub diffp: Option<Broadcast>,
    /// One-sided difference flags. Default: central.
    pub diff_onesided: Option<BoolBroadcast>,
    /// Typical magnitudes of the parameters. Default: unset.
    pub typical_x: Option<Broadcast>,
    /// Maximum fractional change of a parameter per iteration. Default: unset.
    pub max_fract_change: Option<Broadcast>,
    /// Desired fractional precision per parameter. Default: unset.
    pub fract_prec: Option<Broadcast>,
}

impl ConfigVectors {
    /// Determines whether no configuration item was supplied.
    pub fn is_empty(&self) -> bool {
        self.lbound.is_none()
            && self.ubound.is_none()
            && self.fixed.is_none()
            && self.diffp.is_none()
            && self.diff_onesided.is_none()
            && self.typical_x.is_none()
            && self.max_fract_change.is_none()
            && self.fract_prec.is_none()
    }
}

/// Per-name entry of the configuration table.
///
/// Each item covers the whole block of the name: a scalar is broadcast over
/// the block, a vector must match the block dimension.
#[derive(Debug, Clone, Default)]
pub struct ParamEntry {
    /// Lower bounds of the block.
    pub lbound: Option<Broadcast>,
    /// Upper bounds of the block.
    pub ubound: Option<Broadcast>,
    /// Fixed flags of the block.
    pub fixed: Option<BoolBroadcast>,
    /// Relative finite-difference step sizes of the block.
    pub diffp: Option<Broadcast>,
    /// One-sided difference flags of the block.
    pub diff_onesided: Option<BoolBroadcast>,
    /// Typical magnitudes of the block.
    pub typical_x: Option<Broadcast>,
    /// Maximum fractional change of the block.
    pub max_fract_change: Option<Broadcast>,
    /// Desired fractional precision of the block.
    pub fract_prec: Option<Broadcast>,
}

/// The two mutually exclusive configuration modes.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// No per-parameter configuration; everything defaults.
    Defaults,
    /// Flat vectors over the parameter space.
    Vectors(ConfigVectors),
    /// Per-parameter-name table.
    Table(Vec<(String, ParamEntry)>),
}

/// Canonical per-element configuration over the flat parameter space.
///
/// Fields that distinguish "unset" from a legitimately supplied value use
/// `Option<f64>` per element instead of a not-a-number sentinel; downstream
/// consumers substitute their own defaults for `None`.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Lower bounds, possibly negative infinity.
    pub lbound: DVector<f64>,
    /// Upper bounds, possibly positive infinity.
    pub ubound: DVector<f64>,
    /// Fixed-parameter mask.
    pub fixed: Vec<bool>,
    /// Relative finite-difference step sizes.
    pub diffp: Vec<Option<f64>>,
    /// One-sided difference flags.
    pub diff_onesided: Vec<bool>,
    /// Typical magnitudes.
    pub typical_x: Vec<Option<f64>>,
    /// Maximum fractional change per iteration.
    pub max_fract_change: Vec<Option<f64>>,
    /// Desired fractional precision.
    pub fract_prec: Vec<Option<f64>>,
}

impl ResolvedConfig {
    /// All-defaults configuration for a parameter space of given size.
    pub fn defaults(np: usize) -> Self {
        Self {
            lbound: DVector::from_element(np, f64::NEG_INFINITY),
            ubound: DVector::from_element(np, f64::INFINITY),
            fixed: vec![false; np],
            diffp: vec![None; np],
            diff_onesided: vec![false; np],
            typical_x: vec![None; np],
            max_fract_change: vec![None; np],
            fract_prec: vec![None; np],
        }
    }

    /// Number of elements the configuration covers.
    pub fn len(&self) -> usize {
        self.fixed.len()
    }

    /// Determines whether the configuration covers no elements.
    pub fn is_empty(&self) -> bool {
        self.fixed.is_empty()
    }

    /// Subsets every per-element vector to the given indices, in that order.
    ///
    /// This is the very last transformation of the fixed-parameter
    /// elimination; everything needing full-space values must run before it.
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            lbound: DVector::from_iterator(indices.len(), indices.iter().map(|&i| self.lbound[i])),
            ubound: DVector::from_iterator(indices.len(), indices.iter().map(|&i| self.ubound[i])),
            fixed: indices.iter().map(|&i| self.fixed[i]).collect(),
            diffp: indices.iter().map(|&i| self.diffp[i]).collect(),
            diff_onesided: indices.iter().map(|&i| self.diff_onesided[i]).collect(),
            typical_x: indices.iter().map(|&i| self.typical_x[i]).collect(),
            max_fract_change: indices.iter().map(|&i| self.max_fract_change[i]).collect(),
            fract_prec: indices.iter().map(|&i| self.fract_prec[i]).collect(),
        }
    }
}

/// Derived finite-difference options that take precedence over directly
/// supplied step vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinDiffOverride {
    /// Relative step applied to every element.
    pub rel_step: Option<f64>,
    /// Difference scheme applied to every element.
    pub scheme: Option<FinDiffType>,
}

/// Resolves the supplied configuration mode into the canonical form.
///
/// All validation failures are fatal and reported before any objective
/// evaluation takes place.
pub fn resolve(
    layout: &Layout,
    source: &ConfigSource,
    fin_diff: FinDiffOverride,
    cstep: Option<f64>,
) -> Result<ResolvedConfig, ConfigError> {
    let np = layout.np();
    let mut config = ResolvedConfig::defaults(np);

    match source {
        ConfigSource::Defaults => {}
        ConfigSource::Vectors(vectors) => apply_vectors(&mut config, vectors, np)?,
        ConfigSource::Table(table) => apply_table(&mut config, table, layout)?,
    }

    apply_fin_diff_override(&mut config, source, fin_diff);
    validate(&config, cstep)?;

    Ok(config)
}

fn apply_vectors(
    config: &mut ResolvedConfig,
    vectors: &ConfigVectors,
    np: usize,
) -> Result<(), ConfigError> {
    if let Some(lbound) = &vectors.lbound {
        config.lbound = lbound.expand(np, "lbound")?;
    }
    if let Some(ubound) = &vectors.ubound {
        config.ubound = ubound.expand(np, "ubound")?;
    }
    if let Some(fixed) = &vectors.fixed {
        config.fixed = fixed.expand(np, "fixed")?;
    }
    if let Some(diffp) = &vectors.diffp {
        config.diffp = diffp.expand(np, "diffp")?.iter().map(|&v| Some(v)).collect();
    }
    if let Some(diff_onesided) = &vectors.diff_onesided {
        config.diff_onesided = diff_onesided.expand(np, "diff_onesided")?;
    }
    if let Some(typical_x) = &vectors.typical_x {
        config.typical_x = typical_x
            .expand(np, "TypicalX")?
            .iter()
            .map(|&v| Some(v))
            .collect();
    }
    if let Some(max_fract_change) = &vectors.max_fract_change {
        config.max_fract_change = max_fract_change
            .expand(np, "max_fract_change")?
            .iter()
            .map(|&v| Some(v))
            .collect();
    }
    if let Some(fract_prec) = &vectors.fract_prec {
        config.fract_prec = fract_prec
            .expand(np, "fract_prec")?
            .iter()
            .map(|&v| Some(v))
            .collect();
    }

    Ok(())
}

fn apply_table(
    config: &mut ResolvedConfig,
    table: &[(String, ParamEntry)],
    layout: &Layout,
) -> Result<(), ConfigError> {
    // Names absent from the table keep their defaults; names absent from the
    // layout are an error.
    for (name, entry) in table {
        let index = layout
            .index_of(name)
            .ok_or_else(|| ConfigError::UnknownName(name.clone()))?;
        let range = layout.range_of(index);
        let dim = range.len();

        if let Some(lbound) = &entry.lbound {
            config
                .lbound
                .rows_mut(range.start, dim)
                .copy_from(&lbound.expand(dim, "lbound")?);
        }
        if let Some(ubound) = &entry.ubound {
            config
                .ubound
                .rows_mut(range.start, dim)
                .copy_from(&ubound.expand(dim, "ubound")?);
        }
        if let Some(fixed) = &entry.fixed {
            config.fixed[range.clone()].copy_from_slice(&fixed.expand(dim, "fixed")?);
        }
        if let Some(diffp) = &entry.diffp {
            let expanded = diffp.expand(dim, "diffp")?;
            for (slot, value) in config.diffp[range.clone()].iter_mut().zip(expanded.iter()) {
                *slot = Some(*value);
            }
        }
        if let Some(diff_onesided) = &entry.diff_onesided {
            config.diff_onesided[range.clone()]
                .copy_from_slice(&diff_onesided.expand(dim, "diff_onesided")?);
        }
        if let Some(typical_x) = &entry.typical_x {
            let expanded = typical_x.expand(dim, "TypicalX")?;
            for (slot, value) in config.typical_x[range.clone()]
                .iter_mut()
                .zip(expanded.iter())
            {
                *slot = Some(*value);
            }
        }
        if let Some(max_fract_change) = &entry.max_fract_change {
            let expanded = max_fract_change.expand(dim, "max_fract_change")?;
            for (slot, value) in config.max_fract_change[range.clone()]
                .iter_mut()
                .zip(expanded.iter())
            {
                *slot = Some(*value);
            }
        }
        if let Some(fract_prec) = &entry.fract_prec {
            let expanded = fract_prec.expand(dim, "fract_prec")?;
            for (slot, value) in config.fract_prec[range.clone()]
                .iter_mut()
                .zip(expanded.iter())
            {
                *slot = Some(*value);
            }
        }
    }

    Ok(())
}

fn apply_fin_diff_override(
    config: &mut ResolvedConfig,
    source: &ConfigSource,
    fin_diff: FinDiffOverride,
) {
    let diffp_supplied = match source {
        ConfigSource::Defaults => false,
        ConfigSource::Vectors(vectors) => vectors.diffp.is_some(),
        ConfigSource::Table(table) => table.iter().any(|(_, e)| e.diffp.is_some()),
    };
    let onesided_supplied = match source {
        ConfigSource::Defaults => false,
        ConfigSource::Vectors(vectors) => vectors.diff_onesided.is_some(),
        ConfigSource::Table(table) => table.iter().any(|(_, e)| e.diff_onesided.is_some()),
    };

    if let Some(rel_step) = fin_diff.rel_step {
        if diffp_supplied {
            warn!("`FinDiffRelStep` overrides the supplied `diffp` values");
        }
        config.diffp = vec![Some(rel_step); config.len()];
    }

    if let Some(scheme) = fin_diff.scheme {
        if onesided_supplied {
            warn!("`FinDiffType` overrides the supplied `diff_onesided` flags");
        }
        let onesided = scheme == FinDiffType::Forward;
        config.diff_onesided = vec![onesided; config.len()];
    }
}

fn validate(config: &ResolvedConfig, cstep: Option<f64>) -> Result<(), ConfigError> {
    for (i, diffp) in config.diffp.iter().enumerate() {
        if let Some(diffp) = diffp {
            if *diffp <= 0.0 {
                return Err(ConfigError::NonPositiveStep {
                    index: i,
                    got: *diffp,
                });
            }
        }
    }

    for (i, typical) in config.typical_x.iter().enumerate() {
        if let Some(typical) = typical {
            if *typical == 0.0 {
                return Err(ConfigError::ZeroTypicalX(i));
            }
        }
    }

    for i in 0..config.len() {
        if config.lbound[i] > config.ubound[i] {
            return Err(ConfigError::BoundOrder(i));
        }
    }

    for (item, values) in [
        ("max_fract_change", &config.max_fract_change),
        ("fract_prec", &config.fract_prec),
    ] {
        for (i, value) in values.iter().enumerate() {
            if let Some(value) = value {
                if *value < 0.0 {
                    return Err(ConfigError::Negative {
                        item,
                        index: i,
                        got: *value,
                    });
                }
            }
        }
    }

    if let Some(cstep) = cstep {
        if cstep <= 0.0 {
            return Err(ConfigError::NonPositiveCstep(cstep));
        }
    }

    Ok(())
}
