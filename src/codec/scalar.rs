//! Portable distance kernels.
//!
//! The fp32 and asymmetric loops use fixed-size chunks with f32 inner
//! accumulators and f64 outer accumulation so the compiler can
//! auto-vectorize them; the symmetric sq8 loops accumulate in integers and
//! reconstruct the real value from closed-form sums, which keeps the inner
//! loop free of float conversions.

use super::Sq8Ref;

/// Chunk size for f32 loops. 8 lanes matches one 256-bit register.
const CHUNK_F32: usize = 8;

/// Chunk size for u8 integer loops. The sum of 32 u8*u8 products fits in i32.
const CHUNK_U8: usize = 32;

pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let len = a.len();
    let mut sum = 0.0f64;

    let full_chunks = len / CHUNK_F32;
    for c in 0..full_chunks {
        let base = c * CHUNK_F32;
        let mut acc = 0.0f32;
        for j in 0..CHUNK_F32 {
            acc += a[base + j] * b[base + j];
        }
        sum += acc as f64;
    }
    for i in (full_chunks * CHUNK_F32)..len {
        sum += (a[i] * b[i]) as f64;
    }
    sum as f32
}

pub fn l2_sq_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let len = a.len();
    let mut sum = 0.0f64;

    let full_chunks = len / CHUNK_F32;
    for c in 0..full_chunks {
        let base = c * CHUNK_F32;
        let mut acc = 0.0f32;
        for j in 0..CHUNK_F32 {
            let d = a[base + j] - b[base + j];
            acc += d * d;
        }
        sum += acc as f64;
    }
    for i in (full_chunks * CHUNK_F32)..len {
        let d = a[i] - b[i];
        sum += (d * d) as f64;
    }
    sum as f32
}

/// Asymmetric dot product: f32 query vs sq8 code.
pub fn dot_asym(query: &[f32], code: Sq8Ref<'_>) -> f32 {
    debug_assert_eq!(query.len(), code.data.len());
    let len = query.len();
    let s_min = code.min;
    let s_scale = code.scale;
    let mut sum = 0.0f64;

    let full_chunks = len / CHUNK_F32;
    for c in 0..full_chunks {
        let base = c * CHUNK_F32;
        let mut acc = 0.0f32;
        for j in 0..CHUNK_F32 {
            let s = s_min + code.data[base + j] as f32 * s_scale;
            acc += query[base + j] * s;
        }
        sum += acc as f64;
    }
    for i in (full_chunks * CHUNK_F32)..len {
        let s = s_min as f64 + code.data[i] as f64 * s_scale as f64;
        sum += query[i] as f64 * s;
    }
    sum as f32
}

/// Asymmetric squared Euclidean distance: f32 query vs sq8 code.
pub fn l2_sq_asym(query: &[f32], code: Sq8Ref<'_>) -> f32 {
    debug_assert_eq!(query.len(), code.data.len());
    let len = query.len();
    let s_min = code.min;
    let s_scale = code.scale;
    let mut sum = 0.0f64;

    let full_chunks = len / CHUNK_F32;
    for c in 0..full_chunks {
        let base = c * CHUNK_F32;
        let mut acc = 0.0f32;
        for j in 0..CHUNK_F32 {
            let s = s_min + code.data[base + j] as f32 * s_scale;
            let d = query[base + j] - s;
            acc += d * d;
        }
        sum += acc as f64;
    }
    for i in (full_chunks * CHUNK_F32)..len {
        let s = s_min as f64 + code.data[i] as f64 * s_scale as f64;
        let d = query[i] as f64 - s;
        sum += d * d;
    }
    sum as f32
}

/// Symmetric dot product between two sq8 codes.
///
/// Expands `sum((a_min + ai*a_scale) * (b_min + bi*b_scale))` into integer
/// accumulators and reconstructs the f64 result from closed-form sums.
pub fn dot_sq8(a: Sq8Ref<'_>, b: Sq8Ref<'_>) -> f32 {
    debug_assert_eq!(a.data.len(), b.data.len());
    let len = a.data.len();
    let mut sum_a = 0i64;
    let mut sum_b = 0i64;
    let mut sum_ab = 0i64;

    let full_chunks = len / CHUNK_U8;
    for c in 0..full_chunks {
        let base = c * CHUNK_U8;
        let mut csa = 0i32;
        let mut csb = 0i32;
        let mut csab = 0i32;
        for j in 0..CHUNK_U8 {
            let ai = a.data[base + j] as i32;
            let bi = b.data[base + j] as i32;
            csa += ai;
            csb += bi;
            csab += ai * bi;
        }
        sum_a += csa as i64;
        sum_b += csb as i64;
        sum_ab += csab as i64;
    }
    for i in (full_chunks * CHUNK_U8)..len {
        let ai = a.data[i] as i64;
        let bi = b.data[i] as i64;
        sum_a += ai;
        sum_b += bi;
        sum_ab += ai * bi;
    }

    let n = len as f64;
    let a_scale = a.scale as f64;
    let b_scale = b.scale as f64;
    let a_min = a.min as f64;
    let b_min = b.min as f64;

    (n * a_min * b_min
        + a_min * b_scale * sum_b as f64
        + b_min * a_scale * sum_a as f64
        + a_scale * b_scale * sum_ab as f64) as f32
}

/// Symmetric squared Euclidean distance between two sq8 codes.
pub fn l2_sq_sq8(a: Sq8Ref<'_>, b: Sq8Ref<'_>) -> f32 {
    debug_assert_eq!(a.data.len(), b.data.len());
    let len = a.data.len();
    let mut sum_a = 0i64;
    let mut sum_b = 0i64;
    let mut sum_a2 = 0i64;
    let mut sum_b2 = 0i64;
    let mut sum_ab = 0i64;

    let full_chunks = len / CHUNK_U8;
    for c in 0..full_chunks {
        let base = c * CHUNK_U8;
        let mut csa = 0i32;
        let mut csb = 0i32;
        let mut csa2 = 0i32;
        let mut csb2 = 0i32;
        let mut csab = 0i32;
        for j in 0..CHUNK_U8 {
            let ai = a.data[base + j] as i32;
            let bi = b.data[base + j] as i32;
            csa += ai;
            csb += bi;
            csa2 += ai * ai;
            csb2 += bi * bi;
            csab += ai * bi;
        }
        sum_a += csa as i64;
        sum_b += csb as i64;
        sum_a2 += csa2 as i64;
        sum_b2 += csb2 as i64;
        sum_ab += csab as i64;
    }
    for i in (full_chunks * CHUNK_U8)..len {
        let ai = a.data[i] as i64;
        let bi = b.data[i] as i64;
        sum_a += ai;
        sum_b += bi;
        sum_a2 += ai * ai;
        sum_b2 += bi * bi;
        sum_ab += ai * bi;
    }

    let n = len as f64;
    let a_scale = a.scale as f64;
    let b_scale = b.scale as f64;
    let offset = a.min as f64 - b.min as f64;

    // sum((offset + ai*a_scale - bi*b_scale)^2)
    (n * offset * offset
        + 2.0 * offset * (a_scale * sum_a as f64 - b_scale * sum_b as f64)
        + a_scale * a_scale * sum_a2 as f64
        - 2.0 * a_scale * b_scale * sum_ab as f64
        + b_scale * b_scale * sum_b2 as f64) as f32
}
