//! Cardinality estimator implementing the HyperLogLog family of algorithms:
//! the original estimator from Flajolet et al., the bias-corrected variant
//! driven by lookup tables, and the SPARSE/DENSE dual encoding of
//! HyperLogLog++.
//!
//! # Data-structure design rationale
//!
//! ## Two register encodings
//!
//! A fresh estimator keeps a sorted sparse map from 25-bit register indices
//! to 6-bit ranks. While cardinality is low this is far smaller than the
//! dense array and, thanks to the higher index precision, linear counting
//! over it is near-exact. Once the map outgrows the memory budget of the
//! dense array (worst-case five serialized bytes per entry against `6m/8`
//! packed register bytes) the estimator switches to a flat array of
//! `m = 2^p` registers and never switches back.
//!
//! ## Accuracy
//!
//! - SPARSE: linear counting at 25 index bits, near-exact throughout the
//!   range the encoding covers.
//! - DENSE: harmonic-mean estimate with either the table-driven bias
//!   correction of HyperLogLog++ (`no_bias`, the default) or the classical
//!   small/large-range corrections of the original paper.
//! - Expected relative error is `1.04 / sqrt(2^p)`:
//!   p = 10: 3.25%, p = 12: 1.62%, p = 14: 0.81%, p = 16: 0.41%.
//!
//! ## Hashing
//!
//! Every ingestion entry point lowers its argument to little-endian bytes
//! and feeds one MurmurHash3 invocation: the 32-bit variant when the
//! configured hash width is below 64, otherwise the low 64 bits of the
//! 128-bit variant. The hash function and seed are fixed; estimators must
//! share them — and `p` and the hash width — to be mergeable.

use std::cell::Cell;
use std::fmt;
use std::mem::size_of;

use crate::codec;
use crate::dense::DenseRegisters;
use crate::error::HllError;
use crate::registers::{RegisterSet, Registers};
use crate::sparse::{SparseRegisters, P_PRIME};
use crate::tables;

/// Seed of every MurmurHash3 invocation. Part of the compatibility contract
/// of serialized estimators; changing it is a format break.
const HASH_SEED: u32 = 0;

/// Register encoding of an estimator at a point in its lifetime.
///
/// Every estimator starts `Sparse` (unless built dense outright) and
/// transitions to `Dense` at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Sparse,
    Dense,
}

/// Cardinality estimator over a stream of typed values.
///
/// Build via [`HyperLogLog::builder`], feed values with the `add_*` entry
/// points, read the estimate with [`HyperLogLog::count`], combine
/// independently built estimators with [`HyperLogLog::merge`].
#[derive(Clone, Debug)]
pub struct HyperLogLog {
    /// Register-index bits; `m = 1 << p`.
    p: u8,
    m: usize,
    /// Effective hash width: 32 or 128.
    chosen_hash_bits: u32,
    /// Alpha bias constant pre-multiplied by `m^2`.
    alpha_mm: f64,
    bit_packing: bool,
    no_bias: bool,
    /// Sparse map size beyond which the estimator switches to DENSE.
    encoding_switch_threshold: usize,
    registers: Registers,
    /// Counts are cached to avoid repeating the O(m) estimation scans; any
    /// register change clears the cache.
    cached_count: Cell<Option<u64>>,
}

/// Builder for [`HyperLogLog`].
///
/// Defaults: `p = 14`, 64 hash bits, SPARSE initial encoding, bit packing
/// and bias correction enabled.
#[derive(Clone, Debug)]
pub struct HyperLogLogBuilder {
    register_index_bits: u8,
    hash_bits: u32,
    encoding: Encoding,
    bit_packing: bool,
    no_bias: bool,
}

impl Default for HyperLogLogBuilder {
    fn default() -> Self {
        Self {
            register_index_bits: 14,
            hash_bits: 64,
            encoding: Encoding::Sparse,
            bit_packing: true,
            no_bias: true,
        }
    }
}

impl HyperLogLogBuilder {
    /// Set the number of low-order hashcode bits used as the register index.
    /// Valid range is `[4, 16]`; checked by [`Self::build`].
    pub fn register_index_bits(mut self, bits: u8) -> Self {
        self.register_index_bits = bits;
        self
    }

    /// Request a hash width in bits. The effective width is the nearest
    /// available hash-function width: 32 for requests up to 32, else 128.
    pub fn hash_bits(mut self, bits: u32) -> Self {
        self.hash_bits = bits;
        self
    }

    /// Choose the initial register encoding. The estimator still switches
    /// to DENSE on its own; starting dense just skips the sparse phase.
    pub fn initial_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Store dense registers at 6 bits each instead of one byte each.
    /// Better compression at the cost of more CPU cycles per access.
    pub fn bit_packing(mut self, enabled: bool) -> Self {
        self.bit_packing = enabled;
        self
    }

    /// Correct the dense estimate with the bias lookup tables instead of
    /// the classical range corrections. Substantially more accurate in the
    /// short range.
    pub fn no_bias(mut self, enabled: bool) -> Self {
        self.no_bias = enabled;
        self
    }

    /// Build the estimator, validating the configuration.
    pub fn build(self) -> Result<HyperLogLog, HllError> {
        if !(tables::MIN_P..=tables::MAX_P).contains(&self.register_index_bits) {
            return Err(HllError::InvalidConfig(format!(
                "p value should be between {} and {}, got {}",
                tables::MIN_P,
                tables::MAX_P,
                self.register_index_bits
            )));
        }
        let p = self.register_index_bits;
        let chosen_hash_bits = if self.hash_bits <= 32 { 32 } else { 128 };
        let registers = match self.encoding {
            Encoding::Sparse => Registers::Sparse(SparseRegisters::new(p)),
            Encoding::Dense => Registers::Dense(DenseRegisters::new(p, self.bit_packing)),
        };
        Ok(HyperLogLog::from_parts(
            p,
            chosen_hash_bits,
            self.bit_packing,
            self.no_bias,
            registers,
        ))
    }
}

impl HyperLogLog {
    /// Start building an estimator.
    pub fn builder() -> HyperLogLogBuilder {
        HyperLogLogBuilder::default()
    }

    /// Assemble an estimator around an existing register set. `p` must
    /// already be validated.
    pub(crate) fn from_parts(
        p: u8,
        chosen_hash_bits: u32,
        bit_packing: bool,
        no_bias: bool,
        registers: Registers,
    ) -> Self {
        let m = 1usize << p;
        // The sparse map is abandoned once it would serialize larger than
        // the dense array: worst case 5 varint bytes per entry against
        // 6m/8 packed bytes. Without packing every register takes a full
        // byte and the budget is looser. A memory heuristic, not an
        // accuracy requirement.
        let encoding_switch_threshold = if bit_packing {
            ((m * 6) / 8) / 5
        } else {
            m / 3
        };
        Self {
            p,
            m,
            chosen_hash_bits,
            alpha_mm: tables::alpha_mm(chosen_hash_bits, m),
            bit_packing,
            no_bias,
            encoding_switch_threshold,
            registers,
            cached_count: Cell::new(None),
        }
    }

    /// Register-index bits the estimator was built with.
    pub fn precision(&self) -> u8 {
        self.p
    }

    /// Number of registers in the dense encoding, `2^p`.
    pub fn register_count(&self) -> usize {
        self.m
    }

    /// Effective hash width in bits: 32 or 128.
    pub fn hash_bits(&self) -> u32 {
        self.chosen_hash_bits
    }

    /// Current register encoding.
    pub fn encoding(&self) -> Encoding {
        match self.registers {
            Registers::Sparse(_) => Encoding::Sparse,
            Registers::Dense(_) => Encoding::Dense,
        }
    }

    /// Theoretical standard error of the dense estimate, `1.04 / sqrt(m)`.
    pub fn std_error(&self) -> f64 {
        1.04 / (self.m as f64).sqrt()
    }

    /// Memory held by the estimator, including the register payload.
    pub fn size_of(&self) -> usize {
        size_of::<Self>() + self.registers.size_of()
    }

    pub(crate) fn bit_packing(&self) -> bool {
        self.bit_packing
    }

    pub(crate) fn no_bias(&self) -> bool {
        self.no_bias
    }

    pub(crate) fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn add_bool(&mut self, value: bool) {
        self.ingest(&[u8::from(value)]);
    }

    pub fn add_i8(&mut self, value: i8) {
        self.ingest(&value.to_le_bytes());
    }

    pub fn add_i16(&mut self, value: i16) {
        self.ingest(&value.to_le_bytes());
    }

    pub fn add_i32(&mut self, value: i32) {
        self.ingest(&value.to_le_bytes());
    }

    pub fn add_i64(&mut self, value: i64) {
        self.ingest(&value.to_le_bytes());
    }

    pub fn add_u64(&mut self, value: u64) {
        self.ingest(&value.to_le_bytes());
    }

    pub fn add_f32(&mut self, value: f32) {
        self.ingest(&value.to_bits().to_le_bytes());
    }

    pub fn add_f64(&mut self, value: f64) {
        self.ingest(&value.to_bits().to_le_bytes());
    }

    pub fn add_char(&mut self, value: char) {
        self.ingest(&u32::from(value).to_le_bytes());
    }

    pub fn add_str(&mut self, value: &str) {
        self.ingest(value.as_bytes());
    }

    pub fn add_bytes(&mut self, value: &[u8]) {
        self.ingest(value);
    }

    /// Record an absent value. Consumes one hash of a stable sentinel so a
    /// stream of nulls counts as one distinct element rather than nothing.
    pub fn add_null(&mut self) {
        self.ingest(&[]);
    }

    /// Feed a precomputed hashcode. All typed entry points funnel here; the
    /// hashcode must come from the same hash function, seed and width for
    /// results to mean anything.
    pub fn add_hash(&mut self, hashcode: i64) {
        if self.registers.add(hashcode) {
            self.cached_count.set(None);
        }
        self.promote_if_needed();
    }

    fn ingest(&mut self, bytes: &[u8]) {
        let hashcode = self.hash_bytes(bytes);
        self.add_hash(hashcode);
    }

    fn hash_bytes(&self, bytes: &[u8]) -> i64 {
        if self.chosen_hash_bits < 64 {
            i64::from(mur3::murmurhash3_x86_32(bytes, HASH_SEED) as i32)
        } else {
            let (low, _) = mur3::murmurhash3_x64_128(bytes, HASH_SEED);
            low as i64
        }
    }

    /// Estimated number of distinct elements added so far.
    ///
    /// Recomputed only after a mutation changed a register; otherwise the
    /// cached value is returned. An uncached call scans all registers in
    /// the dense encoding, so it is O(m).
    pub fn count(&self) -> u64 {
        if let Some(cached) = self.cached_count.get() {
            return cached;
        }
        let count = match &self.registers {
            // While sparse, linear counting at the higher index precision:
            // the effective register count is 2^25.
            Registers::Sparse(sparse) => {
                let m_prime = 1u64 << P_PRIME;
                linear_count(m_prime, m_prime - sparse.size() as u64)
            }
            Registers::Dense(dense) => self.count_dense(dense),
        };
        self.cached_count.set(Some(count));
        count
    }

    fn count_dense(&self, dense: &DenseRegisters) -> u64 {
        let m = self.m as u64;
        let zeros = dense.num_zeroes() as u64;
        let raw = (self.alpha_mm / dense.sum_inverse_pow2()) as u64;

        if self.no_bias {
            // Bias correction applies in the short range only; past 5m the
            // raw estimate is already unbiased.
            let corrected = if raw <= 5 * m {
                (raw as i64 - tables::estimate_bias(raw, self.p)).max(0) as u64
            } else {
                raw
            };
            // Below the per-precision threshold linear counting still beats
            // the corrected estimate, provided any register is empty.
            let linear = if zeros != 0 {
                linear_count(m, zeros)
            } else {
                corrected
            };
            if linear < tables::threshold(self.p) {
                linear
            } else {
                corrected
            }
        } else if raw as f64 <= 2.5 * m as f64 && zeros != 0 {
            // Classical short-range correction.
            linear_count(m, zeros)
        } else if self.chosen_hash_bits < 64 {
            // Long-range correction for hash collisions in a 32-bit hash
            // space; 64-bit hashing puts the range out of reach.
            let pow = f64::from(self.chosen_hash_bits).exp2();
            if raw as f64 > pow / 30.0 {
                (-pow * (1.0 - raw as f64 / pow).ln()) as u64
            } else {
                raw
            }
        } else {
            raw
        }
    }

    /// Merge another estimator into this one.
    ///
    /// Both must have been built with the same `p` and hash width;
    /// otherwise the merge fails and `self` is untouched. A sparse `self`
    /// is promoted when the other side is dense or when the merged map
    /// crosses the switch threshold; the transition is one-way.
    pub fn merge(&mut self, other: &HyperLogLog) -> Result<(), HllError> {
        if self.p != other.p || self.chosen_hash_bits != other.chosen_hash_bits {
            return Err(HllError::IncompatibleMerge(format!(
                "p {} vs {}, hash bits {} vs {}",
                self.p, other.p, self.chosen_hash_bits, other.chosen_hash_bits
            )));
        }

        match (&mut self.registers, &other.registers) {
            (Registers::Sparse(lhs), Registers::Sparse(rhs)) => lhs.merge(rhs),
            (Registers::Dense(lhs), Registers::Dense(rhs)) => lhs.merge(rhs),
            (Registers::Sparse(lhs), Registers::Dense(rhs)) => {
                let mut dense = DenseRegisters::from_sparse(lhs, self.bit_packing);
                dense.merge(rhs);
                self.registers = Registers::Dense(dense);
            }
            (Registers::Dense(lhs), Registers::Sparse(rhs)) => {
                lhs.merge(&DenseRegisters::from_sparse(rhs, self.bit_packing));
            }
        }

        self.cached_count.set(None);
        self.promote_if_needed();
        Ok(())
    }

    /// Serialize the register state to the engine-native byte form.
    pub fn to_bytes(&self) -> Vec<u8> {
        codec::to_bytes(self)
    }

    /// Reconstruct an estimator from [`HyperLogLog::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HllError> {
        codec::from_bytes(bytes)
    }

    fn promote_if_needed(&mut self) {
        if let Registers::Sparse(sparse) = &self.registers {
            if sparse.size() > self.encoding_switch_threshold {
                self.registers =
                    Registers::Dense(DenseRegisters::from_sparse(sparse, self.bit_packing));
                self.cached_count.set(None);
            }
        }
    }
}

impl PartialEq for HyperLogLog {
    /// Configuration and register state; the count cache is ignored.
    fn eq(&self, other: &Self) -> bool {
        self.p == other.p
            && self.chosen_hash_bits == other.chosen_hash_bits
            && self.bit_packing == other.bit_packing
            && self.no_bias == other.no_bias
            && self.registers == other.registers
    }
}

impl fmt::Display for HyperLogLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "encoding: {:?}, p: {}, hash bits: {}, count: {}",
            self.encoding(),
            self.p,
            self.chosen_hash_bits,
            self.count()
        )
    }
}

fn linear_count(m: u64, zeros: u64) -> u64 {
    (m as f64 * (m as f64 / zeros as f64).ln()).round() as u64
}
