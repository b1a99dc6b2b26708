//! Distance kernel.
//!
//! Payloads cross this interface as opaque byte arrays interpreted per
//! element type; floating-point values are handled at the IEEE-754 bit
//! level, so results are deterministic for the same input on the same
//! platform. The metric set is closed: a value dispatched by `match`, never
//! a trait object.
//!
//! L2 and L1 return a non-negative distance; cosine returns `1 - cos(a, b)`
//! and inner product returns `-<a, b>` so that smaller is always closer;
//! Hamming is the popcount of the XOR of the raw payload bytes.

use crate::errors::{CanFail, StoreError, StoreResult};

/// Distance metrics understood by the kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Metric {
    /// Euclidean distance.
    #[default]
    L2 = 0,
    /// `1 - cosine similarity`.
    Cosine = 1,
    /// Negated inner product.
    Inner = 2,
    /// Manhattan distance.
    L1 = 3,
    /// Bit-level Hamming distance.
    Hamming = 4,
}

impl Metric {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::L2),
            1 => Some(Self::Cosine),
            2 => Some(Self::Inner),
            3 => Some(Self::L1),
            4 => Some(Self::Hamming),
            _ => None,
        }
    }
}

/// Element types a stored vector may carry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ElementType {
    #[default]
    Float32 = 0,
    Float16 = 1,
    BFloat16 = 2,
    Float64 = 3,
    Int8 = 4,
    UInt8 = 5,
    Int16 = 6,
    UInt16 = 7,
    Int32 = 8,
    UInt32 = 9,
    /// Packed bits, `dimension` bits rounded up to whole bytes.
    Binary = 10,
    /// `(index: u32, value: f32 bits)` pairs sorted by index; `dimension`
    /// counts the pairs.
    Sparse = 11,
}

impl ElementType {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Float32),
            1 => Some(Self::Float16),
            2 => Some(Self::BFloat16),
            3 => Some(Self::Float64),
            4 => Some(Self::Int8),
            5 => Some(Self::UInt8),
            6 => Some(Self::Int16),
            7 => Some(Self::UInt16),
            8 => Some(Self::Int32),
            9 => Some(Self::UInt32),
            10 => Some(Self::Binary),
            11 => Some(Self::Sparse),
            _ => None,
        }
    }

    /// Bytes per element for fixed-width types.
    fn width(self) -> Option<usize> {
        match self {
            Self::Int8 | Self::UInt8 => Some(1),
            Self::Float16 | Self::BFloat16 | Self::Int16 | Self::UInt16 => Some(2),
            Self::Float32 | Self::Int32 | Self::UInt32 => Some(4),
            Self::Float64 => Some(8),
            Self::Binary | Self::Sparse => None,
        }
    }

    /// Expected payload length for `dimension` elements.
    pub(crate) fn payload_len(self, dimension: u32) -> Option<usize> {
        match self {
            Self::Binary => Some((dimension as usize).div_ceil(8)),
            Self::Sparse => Some(dimension as usize * 8),
            other => other.width().map(|w| w * dimension as usize),
        }
    }

    /// Rejects payloads whose length does not match the declared dimension.
    pub(crate) fn check_payload(self, dimension: u32, payload: &[u8]) -> CanFail {
        if dimension == 0 {
            return Err(StoreError::InvalidArgument("zero dimension"));
        }
        match self.payload_len(dimension) {
            Some(expected) if expected == payload.len() => Ok(()),
            _ => Err(StoreError::InvalidArgument(
                "payload length does not match dimension and element type",
            )),
        }
    }
}

/// Widens one fixed-width element to f64. `idx` is the element index.
fn element(etype: ElementType, payload: &[u8], idx: usize) -> f64 {
    match etype {
        ElementType::Float32 => {
            let off = idx * 4;
            f32::from_le_bytes(payload[off..off + 4].try_into().unwrap()) as f64
        }
        ElementType::Float64 => {
            let off = idx * 8;
            f64::from_le_bytes(payload[off..off + 8].try_into().unwrap())
        }
        ElementType::Float16 => {
            let off = idx * 2;
            f16_to_f32(u16::from_le_bytes(payload[off..off + 2].try_into().unwrap())) as f64
        }
        ElementType::BFloat16 => {
            let off = idx * 2;
            let bits = u16::from_le_bytes(payload[off..off + 2].try_into().unwrap());
            f32::from_bits((bits as u32) << 16) as f64
        }
        ElementType::Int8 => payload[idx] as i8 as f64,
        ElementType::UInt8 => payload[idx] as f64,
        ElementType::Int16 => {
            let off = idx * 2;
            i16::from_le_bytes(payload[off..off + 2].try_into().unwrap()) as f64
        }
        ElementType::UInt16 => {
            let off = idx * 2;
            u16::from_le_bytes(payload[off..off + 2].try_into().unwrap()) as f64
        }
        ElementType::Int32 => {
            let off = idx * 4;
            i32::from_le_bytes(payload[off..off + 4].try_into().unwrap()) as f64
        }
        ElementType::UInt32 => {
            let off = idx * 4;
            u32::from_le_bytes(payload[off..off + 4].try_into().unwrap()) as f64
        }
        ElementType::Binary | ElementType::Sparse => unreachable!("handled before element access"),
    }
}

/// IEEE-754 binary16 -> binary32, bit-exact.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = (bits >> 15) as u32;
    let exp = ((bits >> 10) & 0x1F) as u32;
    let frac = (bits & 0x3FF) as u32;

    let out = if exp == 0 {
        if frac == 0 {
            sign << 31
        } else {
            // Subnormal: renormalize into the f32 exponent range.
            let mut exp32: i32 = 113;
            let mut frac32 = frac;
            while frac32 & 0x400 == 0 {
                frac32 <<= 1;
                exp32 -= 1;
            }
            (sign << 31) | ((exp32 as u32) << 23) | ((frac32 & 0x3FF) << 13)
        }
    } else if exp == 0x1F {
        (sign << 31) | (0xFF << 23) | (frac << 13)
    } else {
        (sign << 31) | ((exp + 112) << 23) | (frac << 13)
    };
    f32::from_bits(out)
}

/// Computes the distance between two equal-typed, equal-dimension payloads.
pub(crate) fn distance(
    metric: Metric,
    etype: ElementType,
    dimension: u32,
    a: &[u8],
    b: &[u8],
) -> StoreResult<f64> {
    etype.check_payload(dimension, a)?;
    etype.check_payload(dimension, b)?;

    if metric == Metric::Hamming || etype == ElementType::Binary {
        // Bit-level distance over the raw payload bytes.
        let bits: u32 = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x ^ y).count_ones())
            .sum();
        return Ok(bits as f64);
    }

    if etype == ElementType::Sparse {
        return Ok(sparse_distance(metric, a, b));
    }

    let dim = dimension as usize;
    Ok(match metric {
        Metric::L2 => {
            let mut acc = 0.0f64;
            for idx in 0..dim {
                let diff = element(etype, a, idx) - element(etype, b, idx);
                acc += diff * diff;
            }
            acc.sqrt()
        }
        Metric::L1 => {
            let mut acc = 0.0f64;
            for idx in 0..dim {
                acc += (element(etype, a, idx) - element(etype, b, idx)).abs();
            }
            acc
        }
        Metric::Inner => {
            let mut dot = 0.0f64;
            for idx in 0..dim {
                dot += element(etype, a, idx) * element(etype, b, idx);
            }
            -dot
        }
        Metric::Cosine => {
            let mut dot = 0.0f64;
            let mut norm_a = 0.0f64;
            let mut norm_b = 0.0f64;
            for idx in 0..dim {
                let x = element(etype, a, idx);
                let y = element(etype, b, idx);
                dot += x * y;
                norm_a += x * x;
                norm_b += y * y;
            }
            if norm_a == 0.0 || norm_b == 0.0 {
                1.0
            } else {
                1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
            }
        }
        Metric::Hamming => unreachable!("handled above"),
    })
}

/// Distance between two sparse vectors: `(index, value)` pairs merged by
/// index, absent indices contributing zero.
fn sparse_distance(metric: Metric, a: &[u8], b: &[u8]) -> f64 {
    let pair = |payload: &[u8], i: usize| -> (u32, f64) {
        let off = i * 8;
        let idx = u32::from_le_bytes(payload[off..off + 4].try_into().unwrap());
        let val = f32::from_le_bytes(payload[off + 4..off + 8].try_into().unwrap()) as f64;
        (idx, val)
    };
    let len_a = a.len() / 8;
    let len_b = b.len() / 8;

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    let mut l1 = 0.0f64;
    let mut l2 = 0.0f64;

    let (mut i, mut j) = (0usize, 0usize);
    while i < len_a || j < len_b {
        let next_a = (i < len_a).then(|| pair(a, i));
        let next_b = (j < len_b).then(|| pair(b, j));
        let (x, y) = match (next_a, next_b) {
            (Some((ia, va)), Some((ib, vb))) if ia == ib => {
                i += 1;
                j += 1;
                (va, vb)
            }
            (Some((ia, va)), Some((ib, _))) if ia < ib => {
                i += 1;
                (va, 0.0)
            }
            (Some(_), Some((_, vb))) => {
                j += 1;
                (0.0, vb)
            }
            (Some((_, va)), None) => {
                i += 1;
                (va, 0.0)
            }
            (None, Some((_, vb))) => {
                j += 1;
                (0.0, vb)
            }
            (None, None) => break,
        };
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
        l1 += (x - y).abs();
        l2 += (x - y) * (x - y);
    }

    match metric {
        Metric::L2 => l2.sqrt(),
        Metric::L1 => l1,
        Metric::Inner => -dot,
        Metric::Cosine => {
            if norm_a == 0.0 || norm_b == 0.0 {
                1.0
            } else {
                1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
            }
        }
        Metric::Hamming => unreachable!("hamming never reaches the sparse path"),
    }
}

/// Encodes a slice of f32 values into a little-endian payload. Test and
/// caller convenience.
pub fn f32_payload(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_known_value() {
        let a = f32_payload(&[0.0, 0.0, 0.0]);
        let b = f32_payload(&[3.0, 4.0, 0.0]);
        let d = distance(Metric::L2, ElementType::Float32, 3, &a, &b).unwrap();
        assert_eq!(d, 5.0);
    }

    #[test]
    fn identical_vectors_are_at_distance_zero() {
        let a = f32_payload(&[1.5, -2.5, 3.25]);
        for metric in [Metric::L2, Metric::L1, Metric::Cosine] {
            let d = distance(metric, ElementType::Float32, 3, &a, &a).unwrap();
            assert!(d.abs() < 1e-12, "{metric:?} gave {d}");
        }
    }

    #[test]
    fn inner_product_is_negated() {
        let a = f32_payload(&[1.0, 2.0]);
        let b = f32_payload(&[3.0, 4.0]);
        let d = distance(Metric::Inner, ElementType::Float32, 2, &a, &b).unwrap();
        assert_eq!(d, -11.0);
    }

    #[test]
    fn hamming_counts_bits() {
        let a = vec![0b1010_1010u8, 0xFF];
        let b = vec![0b0101_0101u8, 0xFF];
        let d = distance(Metric::Hamming, ElementType::Binary, 16, &a, &b).unwrap();
        assert_eq!(d, 8.0);
    }

    #[test]
    fn f16_widening() {
        assert_eq!(f16_to_f32(0x3C00), 1.0);
        assert_eq!(f16_to_f32(0xC000), -2.0);
        assert_eq!(f16_to_f32(0x0000), 0.0);
        // Subnormal: 0x0200 = 2^-15.
        assert_eq!(f16_to_f32(0x0200), 2.0f32.powi(-15));

        let a: Vec<u8> = [0x3C00u16, 0x4000]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let b: Vec<u8> = [0x3C00u16, 0x3C00]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let d = distance(Metric::L2, ElementType::Float16, 2, &a, &b).unwrap();
        assert_eq!(d, 1.0);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let a = f32_payload(&[1.0, 2.0]);
        let b = f32_payload(&[1.0, 2.0, 3.0]);
        assert!(matches!(
            distance(Metric::L2, ElementType::Float32, 2, &a, &b),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn sparse_merge_join() {
        // a = {0: 1.0, 3: 2.0}, b = {3: 2.0, 7: 1.0}
        let encode = |pairs: &[(u32, f32)]| -> Vec<u8> {
            pairs
                .iter()
                .flat_map(|(i, v)| {
                    let mut bytes = i.to_le_bytes().to_vec();
                    bytes.extend_from_slice(&v.to_le_bytes());
                    bytes
                })
                .collect()
        };
        let a = encode(&[(0, 1.0), (3, 2.0)]);
        let b = encode(&[(3, 2.0), (7, 1.0)]);
        let d = distance(Metric::L2, ElementType::Sparse, 2, &a, &b).unwrap();
        assert_eq!(d, (1.0f64 + 1.0).sqrt());
        let dot = distance(Metric::Inner, ElementType::Sparse, 2, &a, &b).unwrap();
        assert_eq!(dot, -4.0);
    }
}
