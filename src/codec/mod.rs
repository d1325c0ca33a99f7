//! Vector codecs backing the distance oracle.
//!
//! Two codecs are supported: `fp32` (raw f32 components) and `sq8` (scalar
//! quantization to u8 with per-vector min/scale calibration). The search and
//! build layers never touch codes directly; they go through
//! [`FlatStorage`](crate::store::FlatStorage), which dispatches to the
//! kernels in [`scalar`] and [`simd`].

pub mod scalar;
pub mod simd;

/// Borrowed view of one sq8-encoded vector. Zero allocation.
#[derive(Debug, Clone, Copy)]
pub struct Sq8Ref<'a> {
    pub data: &'a [u8],
    pub min: f32,
    pub scale: f32,
}

/// Encode an f32 vector to sq8 with min-max calibration.
///
/// `scale` is precomputed as `(max - min) / 255.0` so dequantization is a
/// single fused multiply-add per component. Constant vectors encode to the
/// midpoint byte with scale 0.
pub fn sq8_encode(vector: &[f32]) -> (Vec<u8>, f32, f32) {
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for &v in vector {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }

    let range = max - min;
    if range < f32::EPSILON {
        return (vec![128u8; vector.len()], min, 0.0);
    }

    let inv_scale = 255.0 / range;
    let data = vector
        .iter()
        .map(|&v| ((v - min) * inv_scale).round().clamp(0.0, 255.0) as u8)
        .collect();
    (data, min, range / 255.0)
}

/// Dequantize an sq8 code into `out`. Lossy.
pub fn sq8_decode(code: Sq8Ref<'_>, out: &mut [f32]) {
    debug_assert_eq!(code.data.len(), out.len());
    for (o, &b) in out.iter_mut().zip(code.data.iter()) {
        *o = code.min + b as f32 * code.scale;
    }
}
