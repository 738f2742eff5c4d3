//! Parameter containers and the flat layout of the parameter space.
//!
//! Every optimization run works internally on a single flat vector of free
//! parameters. Users, however, may describe their parameters either as a plain
//! vector or as an ordered collection of named blocks. The [`Layout`] type
//! resolves the named representation into a flat index space and provides the
//! flatten/unflatten round trip that the rest of the pipeline relies on.

use nalgebra::DVector;
use thiserror::Error;

/// Error while resolving the parameter layout.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// The same parameter name was declared twice.
    #[error("duplicate parameter name `{0}`")]
    DuplicateName(String),
    /// `param_order` and `param_dims` have different lengths.
    #[error("{names} parameter names declared, but {dims} dimensions")]
    DimsMismatch {
        /// Number of declared names.
        names: usize,
        /// Number of declared dimensions.
        dims: usize,
    },
    /// A declared parameter name is missing from the supplied structure.
    #[error("parameter `{0}` is missing from the supplied structure")]
    MissingName(String),
    /// A named block does not have the declared number of elements.
    #[error("parameter `{name}` has {got} elements, expected {expected}")]
    BlockMismatch {
        /// Name of the offending block.
        name: String,
        /// Declared element count.
        expected: usize,
        /// Supplied element count.
        got: usize,
    },
    /// A flat vector does not match the total element count of the layout.
    #[error("expected a vector of {expected} elements, got {got}")]
    LengthMismatch {
        /// Total element count of the layout.
        expected: usize,
        /// Supplied element count.
        got: usize,
    },
    /// The parameter space has no elements.
    #[error("empty parameter space")]
    Empty,
}

/// Ordered collection of named parameter blocks.
///
/// The order of insertion is significant. It defines the concatenation order
/// used when the blocks are flattened into a single vector.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NamedBlocks {
    blocks: Vec<(String, DVector<f64>)>,
}

impl NamedBlocks {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a named block.
    pub fn push(&mut self, name: impl Into<String>, values: DVector<f64>) {
        self.blocks.push((name.into(), values));
    }

    /// Returns the block with given name, if present.
    pub fn get(&self, name: &str) -> Option<&DVector<f64>> {
        self.blocks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Iterates over the blocks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DVector<f64>)> {
        self.blocks.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Determines whether there are no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl FromIterator<(String, DVector<f64>)> for NamedBlocks {
    fn from_iter<I: IntoIterator<Item = (String, DVector<f64>)>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}

/// The flattenable parameter container.
///
/// This is the only place where the vector and named-structure representations
/// meet. Everything downstream of the structural adapter sees flat vectors
/// exclusively.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    /// Plain vector of parameter values.
    Flat(DVector<f64>),
    /// Ordered named blocks of parameter values.
    Named(NamedBlocks),
}

impl Params {
    /// Creates a flat parameter container from anything vector-like.
    pub fn flat(values: impl Into<Vec<f64>>) -> Self {
        Params::Flat(DVector::from_vec(values.into()))
    }

    /// Creates a named parameter container.
    pub fn named(blocks: NamedBlocks) -> Self {
        Params::Named(blocks)
    }

    /// Determines whether the container is the named variant.
    pub fn is_named(&self) -> bool {
        matches!(self, Params::Named(_))
    }
}

impl From<Vec<f64>> for Params {
    fn from(values: Vec<f64>) -> Self {
        Params::flat(values)
    }
}

impl From<DVector<f64>> for Params {
    fn from(values: DVector<f64>) -> Self {
        Params::Flat(values)
    }
}

/// Flat layout of the parameter space.
///
/// Holds the ordered `(name, dimension)` pairs together with the cumulative
/// offsets of each block in the flat vector. For anonymous (plain vector)
/// input there are no names and the layout degenerates to a single block.
#[derive(Debug, Clone)]
pub struct Layout {
    names: Vec<String>,
    dims: Vec<usize>,
    offsets: Vec<usize>,
    np: usize,
}

impl Layout {
    /// Creates an anonymous layout for a plain vector of given length.
    pub fn anonymous(np: usize) -> Result<Self, LayoutError> {
        if np == 0 {
            return Err(LayoutError::Empty);
        }

        Ok(Self {
            names: Vec::new(),
            dims: Vec::new(),
            offsets: Vec::new(),
            np,
        })
    }

    /// Creates a layout from an explicit name order and per-name dimensions.
    ///
    /// When `dims` is `None`, every name gets one element.
    pub fn from_order(names: Vec<String>, dims: Option<Vec<usize>>) -> Result<Self, LayoutError> {
        let dims = match dims {
            Some(dims) => {
                if dims.len() != names.len() {
                    return Err(LayoutError::DimsMismatch {
                        names: names.len(),
                        dims: dims.len(),
                    });
                }
                dims
            }
            None => vec![1; names.len()],
        };

        Self::build(names, dims)
    }

    /// Creates a layout from a named structure, inferring the dimensions from
    /// the block sizes.
    pub fn from_named(blocks: &NamedBlocks) -> Result<Self, LayoutError> {
        let names = blocks.iter().map(|(n, _)| n.to_owned()).collect();
        let dims = blocks.iter().map(|(_, v)| v.len()).collect();
        Self::build(names, dims)
    }

    fn build(names: Vec<String>, dims: Vec<usize>) -> Result<Self, LayoutError> {
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(LayoutError::DuplicateName(name.clone()));
            }
        }

        let mut offsets = Vec::with_capacity(dims.len());
        let mut np = 0;
        for dim in dims.iter() {
            offsets.push(np);
            np += dim;
        }

        if np == 0 {
            return Err(LayoutError::Empty);
        }

        Ok(Self {
            names,
            dims,
            offsets,
            np,
        })
    }

    /// Total element count of the flat parameter space.
    pub fn np(&self) -> usize {
        self.np
    }

    /// Declared names in layout order. Empty for anonymous layouts.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Returns the position of a name in the layout, if declared.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Returns the flat index range covered by the block at given position.
    pub fn range_of(&self, index: usize) -> std::ops::Range<usize> {
        self.offsets[index]..self.offsets[index] + self.dims[index]
    }

    /// Flattens a parameter container into the universal internal vector.
    ///
    /// The element order is the concatenation order of the layout and is
    /// stable across the whole optimization run.
    pub fn flatten(&self, params: &Params) -> Result<DVector<f64>, LayoutError> {
        match params {
            Params::Flat(v) => {
                if v.len() != self.np {
                    return Err(LayoutError::LengthMismatch {
                        expected: self.np,
                        got: v.len(),
                    });
                }
                Ok(v.clone())
            }
            Params::Named(blocks) => self.flatten_named(blocks),
        }
    }

    /// Flattens a named structure into the flat vector.
    pub fn flatten_named(&self, blocks: &NamedBlocks) -> Result<DVector<f64>, LayoutError> {
        let mut flat = DVector::zeros(self.np);

        for (i, name) in self.names.iter().enumerate() {
            let block = blocks
                .get(name)
                .ok_or_else(|| LayoutError::MissingName(name.clone()))?;

            if block.len() != self.dims[i] {
                return Err(LayoutError::BlockMismatch {
                    name: name.clone(),
                    expected: self.dims[i],
                    got: block.len(),
                });
            }

            flat.rows_mut(self.offsets[i], self.dims[i]).copy_from(block);
        }

        Ok(flat)
    }

    /// Reconstructs the named structure from a flat vector.
    pub fn unflatten_named(&self, flat: &DVector<f64>) -> NamedBlocks {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                (
                    name.clone(),
                    flat.rows(self.offsets[i], self.dims[i]).clone_owned(),
                )
            })
            .collect()
    }

    /// Expands per-name values to per-element granularity.
    ///
    /// All elements of a block share the value produced for its name. This is
    /// what projects a per-parameter-name configuration table onto the flat
    /// vector.
    pub fn expand_per_name<T: Clone>(&self, mut value_of: impl FnMut(&str) -> T) -> Vec<T> {
        let mut out = Vec::with_capacity(self.np);
        for (i, name) in self.names.iter().enumerate() {
            let value = value_of(name);
            out.extend(std::iter::repeat(value).take(self.dims[i]));
        }
        out
    }
}
