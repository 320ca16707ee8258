use thiserror::Error;

/// Errors raised while building or transforming IR values.
///
/// Construction of an ill-typed expression (wrong arity, inconsistent child
/// dtypes) is a programmer error and panics instead; this enum covers the
/// data-dependent failures a caller can legitimately hit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    #[error("cannot reshape {from:?} (size {from_size}) to {to:?}")]
    InvalidReshape {
        from: Vec<usize>,
        from_size: usize,
        to: Vec<i64>,
    },
    #[error("reshape target {to:?} has more than one inferred (-1) dimension")]
    MultipleInferredDims { to: Vec<i64> },
    #[error("axes {axes:?} are not a permutation of 0..{rank}")]
    InvalidPermutation { axes: Vec<usize>, rank: usize },
    #[error("cannot expand {from:?} to {to:?}")]
    InvalidExpand { from: Vec<usize>, to: Vec<usize> },
    #[error("cannot expand axis {axis} with a partial mask")]
    MaskedExpand { axis: usize },
    #[error("invalid slice [{start}, {stop}) step {step} on axis {axis} of size {size}")]
    InvalidSlice {
        axis: usize,
        start: i64,
        stop: i64,
        step: i64,
        size: usize,
    },
    #[error("rank mismatch: expected {expected} dimensions, got {got}")]
    RankMismatch { expected: usize, got: usize },
}
