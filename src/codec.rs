//! Engine-native byte codec for estimator state.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! byte 0      format version (currently 1)
//! byte 1      p, register-index bits
//! byte 2      hash width code: 0 = 32-bit, 1 = 128-bit
//! byte 3      flags: bit 0 encoding (0 sparse, 1 dense),
//!                    bit 1 bit packing, bit 2 no-bias;
//!             remaining bits reserved, must be zero
//! payload     SPARSE: u32 entry count, then each entry packed as
//!             `(key << 6) | rank` in ascending key order, delta encoded,
//!             every delta an LEB128 varint of at most 5 bytes.
//!             DENSE: registers in index order, 6 bits each packed into
//!             ceil(6m/8) bytes when bit packing is on, else one byte per
//!             register.
//! ```
//!
//! Decoding validates everything it reads and never yields a partially
//! reconstructed estimator: unknown version or width code, out-of-range
//! `p`, reserved flag bits, truncation, oversized varints, non-ascending
//! sparse keys, zero or out-of-range ranks and trailing bytes are all
//! rejected. The enclosing signature/implementation-id envelope some
//! deployments wrap around these bytes is out of scope here.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::dense::{DenseRegisters, REGISTER_BITS, REGISTER_MAX};
use crate::error::HllError;
use crate::estimator::HyperLogLog;
use crate::registers::Registers;
use crate::sparse::{SparseRegisters, P_PRIME, Q_PRIME};
use crate::tables::{MAX_P, MIN_P};

const FORMAT_VERSION: u8 = 1;

const WIDTH_CODE_32: u8 = 0;
const WIDTH_CODE_128: u8 = 1;

const FLAG_DENSE: u8 = 1;
const FLAG_BIT_PACKING: u8 = 1 << 1;
const FLAG_NO_BIAS: u8 = 1 << 2;

/// Serialize an estimator's configuration and register state.
pub(crate) fn to_bytes(estimator: &HyperLogLog) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + estimator.size_of());

    buf.push(FORMAT_VERSION);
    buf.push(estimator.precision());
    buf.push(if estimator.hash_bits() < 64 {
        WIDTH_CODE_32
    } else {
        WIDTH_CODE_128
    });

    let mut flags = 0u8;
    if matches!(estimator.registers(), Registers::Dense(_)) {
        flags |= FLAG_DENSE;
    }
    if estimator.bit_packing() {
        flags |= FLAG_BIT_PACKING;
    }
    if estimator.no_bias() {
        flags |= FLAG_NO_BIAS;
    }
    buf.push(flags);

    match estimator.registers() {
        Registers::Sparse(sparse) => write_sparse(&mut buf, sparse),
        Registers::Dense(dense) => write_dense(&mut buf, dense, estimator.bit_packing()),
    }

    buf
}

/// Reconstruct an estimator serialized by [`to_bytes`].
pub(crate) fn from_bytes(bytes: &[u8]) -> Result<HyperLogLog, HllError> {
    let mut reader = bytes;

    let version = read_u8(&mut reader)?;
    if version != FORMAT_VERSION {
        return Err(HllError::MalformedData(format!(
            "unsupported format version {version}"
        )));
    }

    let p = read_u8(&mut reader)?;
    if !(MIN_P..=MAX_P).contains(&p) {
        return Err(HllError::MalformedData(format!("p {p} out of range")));
    }

    let chosen_hash_bits = match read_u8(&mut reader)? {
        WIDTH_CODE_32 => 32,
        WIDTH_CODE_128 => 128,
        code => {
            return Err(HllError::MalformedData(format!(
                "unknown hash width code {code}"
            )))
        }
    };

    let flags = read_u8(&mut reader)?;
    if flags & !(FLAG_DENSE | FLAG_BIT_PACKING | FLAG_NO_BIAS) != 0 {
        return Err(HllError::MalformedData(format!(
            "reserved flag bits set: {flags:#010b}"
        )));
    }
    let dense = flags & FLAG_DENSE != 0;
    let bit_packing = flags & FLAG_BIT_PACKING != 0;
    let no_bias = flags & FLAG_NO_BIAS != 0;

    let registers = if dense {
        Registers::Dense(read_dense(&mut reader, p, bit_packing)?)
    } else {
        Registers::Sparse(read_sparse(&mut reader, p)?)
    };

    if !reader.is_empty() {
        return Err(HllError::MalformedData(format!(
            "{} trailing bytes",
            reader.len()
        )));
    }

    Ok(HyperLogLog::from_parts(
        p,
        chosen_hash_bits,
        bit_packing,
        no_bias,
        registers,
    ))
}

fn write_sparse(buf: &mut Vec<u8>, sparse: &SparseRegisters) {
    buf.extend_from_slice(&(sparse.size() as u32).to_le_bytes());
    let mut last = 0u32;
    for (key, value) in sparse.entries() {
        let word = (key << Q_PRIME) | u32::from(value);
        write_varint(buf, word - last);
        last = word;
    }
}

fn read_sparse(reader: &mut &[u8], p: u8) -> Result<SparseRegisters, HllError> {
    let count = reader
        .read_u32::<LittleEndian>()
        .map_err(|_| truncated("sparse entry count"))?;
    if u64::from(count) > 1 << P_PRIME {
        return Err(HllError::MalformedData(format!(
            "sparse entry count {count} exceeds key space"
        )));
    }

    let mut sparse = SparseRegisters::new(p);
    let mut last = 0u32;
    for i in 0..count {
        let delta = read_varint(reader)?;
        if i > 0 && delta == 0 {
            return Err(HllError::MalformedData(
                "duplicate sparse entry".to_string(),
            ));
        }
        let word = last.checked_add(delta).ok_or_else(|| {
            HllError::MalformedData("sparse entry overflows key space".to_string())
        })?;
        let key = word >> Q_PRIME;
        let value = (word & u32::from(REGISTER_MAX)) as u8;
        if key >= 1 << P_PRIME {
            return Err(HllError::MalformedData(format!(
                "sparse key {key} exceeds {} bits",
                P_PRIME
            )));
        }
        if value == 0 {
            return Err(HllError::MalformedData(
                "sparse entry with zero rank".to_string(),
            ));
        }
        sparse.set(key, value);
        last = word;
    }
    Ok(sparse)
}

fn write_dense(buf: &mut Vec<u8>, dense: &DenseRegisters, bit_packing: bool) {
    if bit_packing {
        let packed_len = (dense.len() * REGISTER_BITS as usize).div_ceil(8);
        let start = buf.len();
        buf.resize(start + packed_len, 0);
        for (idx, value) in dense.iter().enumerate() {
            let bit_idx = idx * REGISTER_BITS as usize;
            let byte_idx = start + bit_idx / 8;
            let bit_pos = bit_idx % 8;
            let spread = u16::from(value) << bit_pos;
            buf[byte_idx] |= spread as u8;
            if spread > 0xff {
                buf[byte_idx + 1] |= (spread >> 8) as u8;
            }
        }
    } else {
        buf.extend(dense.iter());
    }
}

fn read_dense(reader: &mut &[u8], p: u8, bit_packing: bool) -> Result<DenseRegisters, HllError> {
    let m = 1usize << p;
    let payload_len = if bit_packing {
        (m * REGISTER_BITS as usize).div_ceil(8)
    } else {
        m
    };
    let current = *reader;
    if current.len() < payload_len {
        return Err(truncated("dense register payload"));
    }
    let payload = &current[..payload_len];
    *reader = &current[payload_len..];

    let mut dense = DenseRegisters::new(p, bit_packing);
    for idx in 0..m {
        let value = if bit_packing {
            let bit_idx = idx * REGISTER_BITS as usize;
            let byte_idx = bit_idx / 8;
            let bit_pos = bit_idx % 8;
            let low = u16::from(payload[byte_idx]);
            let high = payload
                .get(byte_idx + 1)
                .map_or(0u16, |&byte| u16::from(byte));
            (((high << 8 | low) >> bit_pos) & u16::from(REGISTER_MAX)) as u8
        } else {
            let value = payload[idx];
            if value > REGISTER_MAX {
                return Err(HllError::MalformedData(format!(
                    "register value {value} exceeds rank budget"
                )));
            }
            value
        };
        dense.set(idx, value);
    }
    Ok(dense)
}

/// LEB128, at most 5 bytes for a `u32`. The 5-byte worst case is what the
/// sparse-to-dense switch threshold budgets for.
fn write_varint(buf: &mut Vec<u8>, mut value: u32) {
    while value & !0x7f != 0 {
        buf.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn read_varint(reader: &mut &[u8]) -> Result<u32, HllError> {
    let mut value = 0u32;
    for index in 0..5 {
        let byte = read_u8(reader).map_err(|_| truncated("varint"))?;
        let chunk = u32::from(byte & 0x7f);
        if index == 4 && chunk > 0x0f {
            return Err(HllError::MalformedData(
                "varint overflows 32 bits".to_string(),
            ));
        }
        value |= chunk << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(HllError::MalformedData(
        "varint longer than 5 bytes".to_string(),
    ))
}

fn read_u8(reader: &mut &[u8]) -> Result<u8, HllError> {
    let mut byte = [0u8; 1];
    reader
        .read_exact(&mut byte)
        .map_err(|_| truncated("header"))?;
    Ok(byte[0])
}

fn truncated(what: &str) -> HllError {
    HllError::MalformedData(format!("truncated payload while reading {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::Encoding;
    use test_case::test_case;

    fn filled(n: i64, p: u8, bit_packing: bool) -> HyperLogLog {
        let mut estimator = HyperLogLog::builder()
            .register_index_bits(p)
            .bit_packing(bit_packing)
            .build()
            .unwrap();
        for i in 0..n {
            estimator.add_i64(i);
        }
        estimator
    }

    #[test]
    fn test_varint_round_trip() {
        let values = [0u32, 1, 127, 128, 300, 16383, 16384, u32::MAX];
        let mut buf = Vec::new();
        for &value in &values {
            write_varint(&mut buf, value);
        }
        // Spot-check the wire form of small values.
        assert_eq!(&buf[..5], &[0, 1, 127, 128, 1]);

        let mut reader = buf.as_slice();
        for &value in &values {
            assert_eq!(read_varint(&mut reader).unwrap(), value);
        }
        assert!(reader.is_empty());
    }

    #[test]
    fn test_varint_rejects_overflow() {
        // Six continuation bytes.
        let mut reader: &[u8] = &[0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(matches!(
            read_varint(&mut reader),
            Err(HllError::MalformedData(_))
        ));

        // Five bytes whose top chunk spills past 32 bits.
        let mut reader: &[u8] = &[0xff, 0xff, 0xff, 0xff, 0x1f];
        assert!(matches!(
            read_varint(&mut reader),
            Err(HllError::MalformedData(_))
        ));
    }

    #[test_case(0, Encoding::Sparse; "empty sparse")]
    #[test_case(1, Encoding::Sparse; "one element")]
    #[test_case(1000, Encoding::Sparse; "sparse map")]
    #[test_case(20_000, Encoding::Dense; "promoted dense")]
    fn test_round_trip(n: i64, expected: Encoding) {
        let original = filled(n, 14, true);
        assert_eq!(original.encoding(), expected);

        let restored = HyperLogLog::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.encoding(), original.encoding());
        assert_eq!(restored.count(), original.count());
    }

    #[test]
    fn test_round_trip_unpacked_dense() {
        let original = filled(20_000, 12, false);
        assert_eq!(original.encoding(), Encoding::Dense);
        let restored = HyperLogLog::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.count(), original.count());
    }

    #[test]
    fn test_round_trip_preserves_mergeability() {
        let mut original = filled(1_000, 14, true);
        let mut restored = HyperLogLog::from_bytes(&original.to_bytes()).unwrap();

        let other = {
            let mut other = HyperLogLog::builder().build().unwrap();
            for i in 1_000..2_000_i64 {
                other.add_i64(i);
            }
            other
        };
        original.merge(&other).unwrap();
        restored.merge(&other).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.count(), original.count());
    }

    #[test]
    fn test_dense_payload_size() {
        let packed = filled(20_000, 14, true);
        // 4 header bytes + ceil(6 * 2^14 / 8).
        assert_eq!(packed.to_bytes().len(), 4 + (6 << 14) / 8);

        let plain = filled(20_000, 14, false);
        assert_eq!(plain.to_bytes().len(), 4 + (1 << 14));
    }

    #[test]
    fn test_rejects_empty_and_truncated_input() {
        assert!(HyperLogLog::from_bytes(&[]).is_err());

        let bytes = filled(1_000, 14, true).to_bytes();
        for len in 1..bytes.len() {
            assert!(
                HyperLogLog::from_bytes(&bytes[..len]).is_err(),
                "prefix of {len} bytes must not parse"
            );
        }
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut bytes = filled(10, 14, true).to_bytes();
        bytes[0] = 2;
        assert!(matches!(
            HyperLogLog::from_bytes(&bytes),
            Err(HllError::MalformedData(_))
        ));
    }

    #[test]
    fn test_rejects_bad_precision() {
        let mut bytes = filled(10, 14, true).to_bytes();
        bytes[1] = 3;
        assert!(HyperLogLog::from_bytes(&bytes).is_err());
        bytes[1] = 17;
        assert!(HyperLogLog::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_rejects_bad_width_code() {
        let mut bytes = filled(10, 14, true).to_bytes();
        bytes[2] = 7;
        assert!(HyperLogLog::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_rejects_reserved_flags() {
        let mut bytes = filled(10, 14, true).to_bytes();
        bytes[3] |= 1 << 5;
        assert!(HyperLogLog::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = filled(10, 14, true).to_bytes();
        bytes.push(0);
        assert!(matches!(
            HyperLogLog::from_bytes(&bytes),
            Err(HllError::MalformedData(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_sparse_entries() {
        let mut bytes = Vec::new();
        bytes.push(FORMAT_VERSION);
        bytes.push(14);
        bytes.push(WIDTH_CODE_128);
        bytes.push(FLAG_BIT_PACKING | FLAG_NO_BIAS);
        bytes.extend_from_slice(&2u32.to_le_bytes());
        write_varint(&mut bytes, (5 << Q_PRIME) | 1);
        write_varint(&mut bytes, 0); // zero delta: same entry again
        assert!(matches!(
            HyperLogLog::from_bytes(&bytes),
            Err(HllError::MalformedData(_))
        ));
    }

    #[test]
    fn test_rejects_zero_rank_sparse_entry() {
        let mut bytes = Vec::new();
        bytes.push(FORMAT_VERSION);
        bytes.push(14);
        bytes.push(WIDTH_CODE_128);
        bytes.push(FLAG_BIT_PACKING | FLAG_NO_BIAS);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        write_varint(&mut bytes, 5 << Q_PRIME);
        assert!(matches!(
            HyperLogLog::from_bytes(&bytes),
            Err(HllError::MalformedData(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_plain_register() {
        let mut estimator = HyperLogLog::builder()
            .register_index_bits(4)
            .bit_packing(false)
            .initial_encoding(Encoding::Dense)
            .build()
            .unwrap();
        estimator.add_i64(1);
        let mut bytes = estimator.to_bytes();
        // Corrupt one plain register beyond the 6-bit rank budget.
        let last = bytes.len() - 1;
        bytes[last] = 200;
        assert!(matches!(
            HyperLogLog::from_bytes(&bytes),
            Err(HllError::MalformedData(_))
        ));
    }
}
