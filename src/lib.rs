//! `hll-estimator` implements the HyperLogLog family of cardinality
//! estimation algorithms: the original estimator, the table-driven
//! bias-corrected variant, and the SPARSE/DENSE dual register encoding of
//! HyperLogLog++. Estimators are built from a validated configuration, fed
//! typed values, merged without access to the original elements, and
//! serialized to a compact engine-native byte form.
mod codec;
mod dense;
pub mod error;
pub mod estimator;
mod registers;
#[cfg(feature = "with_serde")]
mod serde;
mod sparse;
mod tables;

pub use error::HllError;
pub use estimator::{Encoding, HyperLogLog, HyperLogLogBuilder};
