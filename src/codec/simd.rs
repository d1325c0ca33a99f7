//! SIMD-accelerated distance kernels with runtime dispatch.
//!
//! Provides NEON (aarch64) and AVX2+FMA (x86_64) implementations of the hot
//! f32-vs-f32 and f32-vs-sq8 kernels. The best available variant is picked
//! per platform; unsupported targets fall back to the portable loops in
//! [`scalar`](super::scalar).

use super::scalar;
use super::Sq8Ref;

#[inline]
#[allow(unreachable_code)]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { neon_dot_f32(a, b) };
    }
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx2") && std::arch::is_x86_feature_detected!("fma")
        {
            return unsafe { avx2_dot_f32(a, b) };
        }
    }
    scalar::dot_f32(a, b)
}

#[inline]
#[allow(unreachable_code)]
pub fn l2_sq_f32(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { neon_l2_sq_f32(a, b) };
    }
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx2") && std::arch::is_x86_feature_detected!("fma")
        {
            return unsafe { avx2_l2_sq_f32(a, b) };
        }
    }
    scalar::l2_sq_f32(a, b)
}

#[inline]
#[allow(unreachable_code)]
pub fn dot_asym(query: &[f32], code: Sq8Ref<'_>) -> f32 {
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { neon_dot_asym(query, code) };
    }
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx2") && std::arch::is_x86_feature_detected!("fma")
        {
            return unsafe { avx2_dot_asym(query, code) };
        }
    }
    scalar::dot_asym(query, code)
}

#[inline]
#[allow(unreachable_code)]
pub fn l2_sq_asym(query: &[f32], code: Sq8Ref<'_>) -> f32 {
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { neon_l2_sq_asym(query, code) };
    }
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx2") && std::arch::is_x86_feature_detected!("fma")
        {
            return unsafe { avx2_l2_sq_asym(query, code) };
        }
    }
    scalar::l2_sq_asym(query, code)
}

// ============================================================================
// NEON implementations (aarch64)
// ============================================================================

#[cfg(target_arch = "aarch64")]
use std::arch::aarch64::*;

#[cfg(target_arch = "aarch64")]
unsafe fn neon_dot_f32(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    let mut s0 = vdupq_n_f32(0.0);
    let mut s1 = vdupq_n_f32(0.0);
    let mut s2 = vdupq_n_f32(0.0);
    let mut s3 = vdupq_n_f32(0.0);

    let chunks = len / 16;
    for i in 0..chunks {
        let base = i * 16;
        s0 = vfmaq_f32(s0, vld1q_f32(a_ptr.add(base)), vld1q_f32(b_ptr.add(base)));
        s1 = vfmaq_f32(
            s1,
            vld1q_f32(a_ptr.add(base + 4)),
            vld1q_f32(b_ptr.add(base + 4)),
        );
        s2 = vfmaq_f32(
            s2,
            vld1q_f32(a_ptr.add(base + 8)),
            vld1q_f32(b_ptr.add(base + 8)),
        );
        s3 = vfmaq_f32(
            s3,
            vld1q_f32(a_ptr.add(base + 12)),
            vld1q_f32(b_ptr.add(base + 12)),
        );
    }

    let mut sum = vaddvq_f32(vaddq_f32(vaddq_f32(s0, s1), vaddq_f32(s2, s3)));
    for i in (chunks * 16)..len {
        sum += *a_ptr.add(i) * *b_ptr.add(i);
    }
    sum
}

#[cfg(target_arch = "aarch64")]
unsafe fn neon_l2_sq_f32(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    let mut s0 = vdupq_n_f32(0.0);
    let mut s1 = vdupq_n_f32(0.0);
    let mut s2 = vdupq_n_f32(0.0);
    let mut s3 = vdupq_n_f32(0.0);

    let chunks = len / 16;
    for i in 0..chunks {
        let base = i * 16;
        let d0 = vsubq_f32(vld1q_f32(a_ptr.add(base)), vld1q_f32(b_ptr.add(base)));
        let d1 = vsubq_f32(
            vld1q_f32(a_ptr.add(base + 4)),
            vld1q_f32(b_ptr.add(base + 4)),
        );
        let d2 = vsubq_f32(
            vld1q_f32(a_ptr.add(base + 8)),
            vld1q_f32(b_ptr.add(base + 8)),
        );
        let d3 = vsubq_f32(
            vld1q_f32(a_ptr.add(base + 12)),
            vld1q_f32(b_ptr.add(base + 12)),
        );
        s0 = vfmaq_f32(s0, d0, d0);
        s1 = vfmaq_f32(s1, d1, d1);
        s2 = vfmaq_f32(s2, d2, d2);
        s3 = vfmaq_f32(s3, d3, d3);
    }

    let mut sum = vaddvq_f32(vaddq_f32(vaddq_f32(s0, s1), vaddq_f32(s2, s3)));
    for i in (chunks * 16)..len {
        let d = *a_ptr.add(i) - *b_ptr.add(i);
        sum += d * d;
    }
    sum
}

/// Convert 8 u8 code bytes to two dequantized float32x4_t lanes.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn neon_u8x8_dequantize(
    ptr: *const u8,
    min_vec: float32x4_t,
    scale_vec: float32x4_t,
) -> (float32x4_t, float32x4_t) {
    let u8x8 = vld1_u8(ptr);
    let u16x8 = vmovl_u8(u8x8);
    let lo = vcvtq_f32_u32(vmovl_u16(vget_low_u16(u16x8)));
    let hi = vcvtq_f32_u32(vmovl_u16(vget_high_u16(u16x8)));
    (
        vfmaq_f32(min_vec, lo, scale_vec),
        vfmaq_f32(min_vec, hi, scale_vec),
    )
}

#[cfg(target_arch = "aarch64")]
unsafe fn neon_dot_asym(query: &[f32], code: Sq8Ref<'_>) -> f32 {
    let len = query.len();
    let q_ptr = query.as_ptr();
    let s_ptr = code.data.as_ptr();
    let min_vec = vdupq_n_f32(code.min);
    let scale_vec = vdupq_n_f32(code.scale);

    let mut s0 = vdupq_n_f32(0.0);
    let mut s1 = vdupq_n_f32(0.0);

    let chunks = len / 8;
    for i in 0..chunks {
        let base = i * 8;
        let (deq_lo, deq_hi) = neon_u8x8_dequantize(s_ptr.add(base), min_vec, scale_vec);
        s0 = vfmaq_f32(s0, vld1q_f32(q_ptr.add(base)), deq_lo);
        s1 = vfmaq_f32(s1, vld1q_f32(q_ptr.add(base + 4)), deq_hi);
    }

    let mut sum = vaddvq_f32(vaddq_f32(s0, s1));
    for i in (chunks * 8)..len {
        let s = code.min + code.data[i] as f32 * code.scale;
        sum += *q_ptr.add(i) * s;
    }
    sum
}

#[cfg(target_arch = "aarch64")]
unsafe fn neon_l2_sq_asym(query: &[f32], code: Sq8Ref<'_>) -> f32 {
    let len = query.len();
    let q_ptr = query.as_ptr();
    let s_ptr = code.data.as_ptr();
    let min_vec = vdupq_n_f32(code.min);
    let scale_vec = vdupq_n_f32(code.scale);

    let mut s0 = vdupq_n_f32(0.0);
    let mut s1 = vdupq_n_f32(0.0);

    let chunks = len / 8;
    for i in 0..chunks {
        let base = i * 8;
        let (deq_lo, deq_hi) = neon_u8x8_dequantize(s_ptr.add(base), min_vec, scale_vec);
        let d0 = vsubq_f32(vld1q_f32(q_ptr.add(base)), deq_lo);
        let d1 = vsubq_f32(vld1q_f32(q_ptr.add(base + 4)), deq_hi);
        s0 = vfmaq_f32(s0, d0, d0);
        s1 = vfmaq_f32(s1, d1, d1);
    }

    let mut sum = vaddvq_f32(vaddq_f32(s0, s1));
    for i in (chunks * 8)..len {
        let s = code.min + code.data[i] as f32 * code.scale;
        let d = *q_ptr.add(i) - s;
        sum += d * d;
    }
    sum
}

// ============================================================================
// AVX2+FMA implementations (x86_64)
// ============================================================================

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

/// Horizontal sum of the 8 f32 lanes of a __m256.
#[cfg(target_arch = "x86_64")]
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn hsum_f32x8(v: __m256) -> f32 {
    let hi128 = _mm256_extractf128_ps(v, 1);
    let lo128 = _mm256_castps256_ps128(v);
    let sum128 = _mm_add_ps(lo128, hi128);
    let hi64 = _mm_movehl_ps(sum128, sum128);
    let sum64 = _mm_add_ps(sum128, hi64);
    let hi32 = _mm_shuffle_ps(sum64, sum64, 0x55);
    _mm_cvtss_f32(_mm_add_ss(sum64, hi32))
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn avx2_dot_f32(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    let mut s0 = _mm256_setzero_ps();
    let mut s1 = _mm256_setzero_ps();

    let chunks = len / 16;
    for i in 0..chunks {
        let base = i * 16;
        s0 = _mm256_fmadd_ps(
            _mm256_loadu_ps(a_ptr.add(base)),
            _mm256_loadu_ps(b_ptr.add(base)),
            s0,
        );
        s1 = _mm256_fmadd_ps(
            _mm256_loadu_ps(a_ptr.add(base + 8)),
            _mm256_loadu_ps(b_ptr.add(base + 8)),
            s1,
        );
    }

    let mut sum = hsum_f32x8(_mm256_add_ps(s0, s1));
    for i in (chunks * 16)..len {
        sum += *a_ptr.add(i) * *b_ptr.add(i);
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn avx2_l2_sq_f32(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    let mut s0 = _mm256_setzero_ps();
    let mut s1 = _mm256_setzero_ps();

    let chunks = len / 16;
    for i in 0..chunks {
        let base = i * 16;
        let d0 = _mm256_sub_ps(
            _mm256_loadu_ps(a_ptr.add(base)),
            _mm256_loadu_ps(b_ptr.add(base)),
        );
        let d1 = _mm256_sub_ps(
            _mm256_loadu_ps(a_ptr.add(base + 8)),
            _mm256_loadu_ps(b_ptr.add(base + 8)),
        );
        s0 = _mm256_fmadd_ps(d0, d0, s0);
        s1 = _mm256_fmadd_ps(d1, d1, s1);
    }

    let mut sum = hsum_f32x8(_mm256_add_ps(s0, s1));
    for i in (chunks * 16)..len {
        let d = *a_ptr.add(i) - *b_ptr.add(i);
        sum += d * d;
    }
    sum
}

/// Load 8 u8 code bytes, widen to f32, and dequantize.
#[cfg(target_arch = "x86_64")]
#[inline]
#[target_feature(enable = "avx2,fma")]
unsafe fn avx2_u8x8_dequantize(ptr: *const u8, min_vec: __m256, scale_vec: __m256) -> __m256 {
    let u8x8 = _mm_loadl_epi64(ptr as *const __m128i);
    let i32x8 = _mm256_cvtepu8_epi32(u8x8);
    let f32x8 = _mm256_cvtepi32_ps(i32x8);
    _mm256_fmadd_ps(f32x8, scale_vec, min_vec)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn avx2_dot_asym(query: &[f32], code: Sq8Ref<'_>) -> f32 {
    let len = query.len();
    let q_ptr = query.as_ptr();
    let s_ptr = code.data.as_ptr();
    let min_vec = _mm256_set1_ps(code.min);
    let scale_vec = _mm256_set1_ps(code.scale);

    let mut s0 = _mm256_setzero_ps();

    let chunks = len / 8;
    for i in 0..chunks {
        let base = i * 8;
        let deq = avx2_u8x8_dequantize(s_ptr.add(base), min_vec, scale_vec);
        s0 = _mm256_fmadd_ps(_mm256_loadu_ps(q_ptr.add(base)), deq, s0);
    }

    let mut sum = hsum_f32x8(s0);
    for i in (chunks * 8)..len {
        let s = code.min + code.data[i] as f32 * code.scale;
        sum += *q_ptr.add(i) * s;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn avx2_l2_sq_asym(query: &[f32], code: Sq8Ref<'_>) -> f32 {
    let len = query.len();
    let q_ptr = query.as_ptr();
    let s_ptr = code.data.as_ptr();
    let min_vec = _mm256_set1_ps(code.min);
    let scale_vec = _mm256_set1_ps(code.scale);

    let mut s0 = _mm256_setzero_ps();

    let chunks = len / 8;
    for i in 0..chunks {
        let base = i * 8;
        let deq = avx2_u8x8_dequantize(s_ptr.add(base), min_vec, scale_vec);
        let d = _mm256_sub_ps(_mm256_loadu_ps(q_ptr.add(base)), deq);
        s0 = _mm256_fmadd_ps(d, d, s0);
    }

    let mut sum = hsum_f32x8(s0);
    for i in (chunks * 8)..len {
        let s = code.min + code.data[i] as f32 * code.scale;
        let d = *q_ptr.add(i) - s;
        sum += d * d;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::sq8_encode;

    #[test]
    fn test_simd_matches_scalar_f32() {
        // 37 elements exercises both the vector body and the remainder loop
        let a: Vec<f32> = (0..37).map(|i| (i as f32 * 0.17).sin()).collect();
        let b: Vec<f32> = (0..37).map(|i| (i as f32 * 0.29).cos()).collect();
        assert!((dot_f32(&a, &b) - scalar::dot_f32(&a, &b)).abs() < 1e-3);
        assert!((l2_sq_f32(&a, &b) - scalar::l2_sq_f32(&a, &b)).abs() < 1e-3);
    }

    #[test]
    fn test_simd_matches_scalar_asym() {
        let q: Vec<f32> = (0..45).map(|i| (i as f32 * 0.13).sin()).collect();
        let v: Vec<f32> = (0..45).map(|i| (i as f32 * 0.07).cos()).collect();
        let (data, min, scale) = sq8_encode(&v);
        let code = Sq8Ref {
            data: &data,
            min,
            scale,
        };
        assert!((dot_asym(&q, code) - scalar::dot_asym(&q, code)).abs() < 1e-2);
        assert!((l2_sq_asym(&q, code) - scalar::l2_sq_asym(&q, code)).abs() < 1e-2);
    }
}
