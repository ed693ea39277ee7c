//! Register state of an estimator: exactly one of the two encodings.
//!
//! The estimator starts with the compact sparse map and switches to the
//! fixed dense array once the map outgrows its memory budget. Modelling the
//! pair as a sum type makes the "currently absent" register set
//! unrepresentable; the transition is one-way.

use enum_dispatch::enum_dispatch;

use crate::dense::DenseRegisters;
use crate::sparse::SparseRegisters;

/// Operations uniform across both register encodings.
#[enum_dispatch(Registers)]
pub(crate) trait RegisterSet {
    /// Feed one hashcode into the register set. Returns whether a stored
    /// register value increased; only then does the cached count go stale.
    fn add(&mut self, hashcode: i64) -> bool;

    /// Heap memory held by the register payload, in bytes.
    fn size_of(&self) -> usize;
}

/// The two register encodings supported by the estimator.
#[enum_dispatch]
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Registers {
    Sparse(SparseRegisters),
    Dense(DenseRegisters),
}

/// Rank of a hashed value: one plus the position of the least-significant
/// set bit of the non-index pattern, capped at the pattern width. An
/// all-zero pattern therefore yields `width + 1`, the maximum rank the
/// pattern can express.
#[inline]
pub(crate) fn rank(pattern: u64, width: u32) -> u8 {
    (pattern.trailing_zeros().min(width) + 1) as u8
}
