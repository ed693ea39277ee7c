//! Lookup data backing the no-bias counting path.
//!
//! Three pieces, all indexed by `p - 4`:
//! - `THRESHOLD_DATA`: the per-precision cardinality below which linear
//!   counting beats the bias-corrected raw estimate.
//! - raw-estimate tables: the expected raw harmonic-mean estimate at a grid
//!   of true cardinalities covering the biased range.
//! - bias tables: the difference between those expectations and the true
//!   cardinality.
//!
//! The raw-estimate/bias pairs are materialized once per process from the
//! expected register occupancy under a Poisson arrival model. A register
//! receiving `Poisson(lambda = n/m)` elements has
//!
//! ```text
//! E[2^-value] = g(lambda)
//!             = e^-lambda + sum_r 2^-r * (e^(-lambda * 2^-r) - e^(-lambda * 2^-r+1))
//! ```
//!
//! so the expected raw estimate at true cardinality `n` is
//! `alpha * m / g(n/m)`, and the tabulated bias is that value minus `n`.
//! The model pins both ends of the biased range: as `n/m -> 0` the raw
//! estimate is stuck near `alpha * m` (the published reference tables start
//! at 11 for p = 4 and 11817 for p = 14, i.e. `0.673 * 16` and
//! `0.7213 * 2^14`), and past `5m` the estimate is unbiased. The grid spans
//! `n` in `[0.5m, 5.2m]`: below it linear counting governs, above it no
//! correction applies.

use std::sync::OnceLock;

/// Smallest supported register-index bit count.
pub(crate) const MIN_P: u8 = 4;
/// Largest supported register-index bit count.
pub(crate) const MAX_P: u8 = 16;

/// Neighbors averaged by the bias lookup.
const K_NEAREST_NEIGHBOR: usize = 6;

/// Grid points tabulated per precision.
const TABLE_POINTS: usize = 200;

/// Lowest tabulated cardinality, as a multiple of `m`.
const TABLE_LOAD_MIN: f64 = 0.5;
/// Highest tabulated cardinality, as a multiple of `m`.
const TABLE_LOAD_MAX: f64 = 5.2;

/// Cardinality below which linear counting is preferred over the corrected
/// raw estimate, per precision in `[4, 16]`.
const THRESHOLD_DATA: [f64; 13] = [
    10.0, 20.0, 40.0, 80.0, 220.0, 400.0, 900.0, 1800.0, 3100.0, 6500.0, 11500.0, 20000.0, 50000.0,
];

/// Linear-counting handover threshold for precision `p`, rounded to a count.
pub(crate) fn threshold(p: u8) -> u64 {
    (THRESHOLD_DATA[usize::from(p - MIN_P)] + 0.5) as u64
}

/// Bias constant alpha multiplied by `m^2`, selected by effective hash width.
pub(crate) fn alpha_mm(chosen_hash_bits: u32, m: usize) -> f64 {
    let alpha = if chosen_hash_bits <= 16 {
        0.673
    } else if chosen_hash_bits <= 32 {
        0.697
    } else if chosen_hash_bits <= 64 {
        0.709
    } else {
        0.7213 / (1.0 + 1.079 / m as f64)
    };
    alpha * (m * m) as f64
}

/// Estimated bias of `count` for precision `p`: the average tabulated bias
/// of the `K_NEAREST_NEIGHBOR` grid entries closest to `count` by squared
/// distance, rounded half up. Order among equal distances is unspecified.
pub(crate) fn estimate_bias(count: u64, p: u8) -> i64 {
    let table = table_for(p);

    let mut distances: Vec<(f64, usize)> = table
        .raw_estimates
        .iter()
        .enumerate()
        .map(|(idx, &estimate)| {
            let distance = count as f64 - estimate;
            (distance * distance, idx)
        })
        .collect();
    distances.sort_by(|a, b| a.0.total_cmp(&b.0));

    let bias_sum: f64 = distances
        .iter()
        .take(K_NEAREST_NEIGHBOR)
        .map(|&(_, idx)| table.biases[idx])
        .sum();

    (bias_sum / K_NEAREST_NEIGHBOR as f64 + 0.5) as i64
}

struct BiasTable {
    raw_estimates: Vec<f64>,
    biases: Vec<f64>,
}

fn table_for(p: u8) -> &'static BiasTable {
    static TABLES: OnceLock<Vec<BiasTable>> = OnceLock::new();
    let tables = TABLES.get_or_init(|| (MIN_P..=MAX_P).map(build_table).collect());
    &tables[usize::from(p - MIN_P)]
}

fn build_table(p: u8) -> BiasTable {
    let m = (1usize << p) as f64;
    let alpha_m = alpha_mm(128, 1 << p) / m;

    let mut raw_estimates = Vec::with_capacity(TABLE_POINTS);
    let mut biases = Vec::with_capacity(TABLE_POINTS);
    for i in 0..TABLE_POINTS {
        let load =
            TABLE_LOAD_MIN + (TABLE_LOAD_MAX - TABLE_LOAD_MIN) * i as f64 / (TABLE_POINTS - 1) as f64;
        let n = load * m;
        let raw = alpha_m / mean_inverse_pow2(load);
        raw_estimates.push(raw);
        biases.push(raw - n);
    }

    BiasTable {
        raw_estimates,
        biases,
    }
}

/// `E[2^-value]` of one register receiving `Poisson(load)` elements.
fn mean_inverse_pow2(load: f64) -> f64 {
    let mut sum = (-load).exp();
    let mut prev = sum;
    for r in 1..=63 {
        let cur = (-load * 0.5f64.powi(r)).exp();
        sum += 0.5f64.powi(r) * (cur - prev);
        prev = cur;
    }
    sum
}
