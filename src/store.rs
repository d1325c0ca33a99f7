//! Flattened vector storage and the distance oracle over it.
//!
//! [`FlatStorage`] owns the encoded codes of every inserted vector in a
//! contiguous arena (struct-of-arrays layout) together with the bijective
//! external-to-internal id mapping. Internal ids are dense u32 values
//! assigned at insertion and never reused; external ids are caller-chosen
//! i64 values. The oracle surface is `query_distance` and `pair_distance`,
//! which dispatch on the metric and the active codec.

use crate::codec::{scalar, simd, sq8_encode, Sq8Ref};
use crate::distance::{normalize, DistanceKind};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;

/// Which codec encodes the stored vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Raw f32 components, 4 bytes per dimension.
    Fp32,
    /// Scalar quantization to u8 with per-vector min/scale, 1 byte per
    /// dimension plus 8 bytes of calibration.
    Sq8,
}

/// Code arena, one variant per codec. All vector bytes are contiguous.
#[derive(Debug, Serialize, Deserialize)]
enum CodeArena {
    Fp32 {
        data: Vec<f32>,
    },
    Sq8 {
        data: Vec<u8>,
        mins: Vec<f32>,
        scales: Vec<f32>,
    },
}

/// Vector records plus the pairwise/query distance oracle.
#[derive(Debug, Serialize, Deserialize)]
pub struct FlatStorage {
    metric: DistanceKind,
    dim: usize,
    arena: CodeArena,
    /// Indexed by internal id.
    external_ids: Vec<i64>,
    id_map: HashMap<i64, u32>,
}

impl FlatStorage {
    pub fn new(metric: DistanceKind, dim: usize, codec: CodecKind) -> Self {
        let arena = match codec {
            CodecKind::Fp32 => CodeArena::Fp32 { data: Vec::new() },
            CodecKind::Sq8 => CodeArena::Sq8 {
                data: Vec::new(),
                mins: Vec::new(),
                scales: Vec::new(),
            },
        };
        Self {
            metric,
            dim,
            arena,
            external_ids: Vec::new(),
            id_map: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.external_ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.external_ids.is_empty()
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn metric(&self) -> DistanceKind {
        self.metric
    }

    pub fn codec(&self) -> CodecKind {
        match self.arena {
            CodeArena::Fp32 { .. } => CodecKind::Fp32,
            CodeArena::Sq8 { .. } => CodecKind::Sq8,
        }
    }

    /// Encoded byte length of one vector.
    pub fn code_size(&self) -> usize {
        match self.arena {
            CodeArena::Fp32 { .. } => self.dim * std::mem::size_of::<f32>(),
            CodeArena::Sq8 { .. } => self.dim + 2 * std::mem::size_of::<f32>(),
        }
    }

    /// Pre-size the arena for `additional` more vectors.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        self.external_ids
            .try_reserve(additional)
            .map_err(|e| Error::alloc("id arena", e))?;
        match &mut self.arena {
            CodeArena::Fp32 { data } => data
                .try_reserve(additional * self.dim)
                .map_err(|e| Error::alloc("code arena", e))?,
            CodeArena::Sq8 { data, mins, scales } => {
                data.try_reserve(additional * self.dim)
                    .map_err(|e| Error::alloc("code arena", e))?;
                mins.try_reserve(additional)
                    .map_err(|e| Error::alloc("code arena", e))?;
                scales
                    .try_reserve(additional)
                    .map_err(|e| Error::alloc("code arena", e))?;
            }
        }
        Ok(())
    }

    /// Encode and append one vector. Returns the assigned internal id.
    ///
    /// Fails on dimension mismatch and on duplicate external id; the mapping
    /// must stay bijective.
    pub fn insert(&mut self, external_id: i64, vector: &[f32]) -> Result<u32> {
        if vector.len() != self.dim {
            return Err(Error::DimensionNotEqual {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        if self.id_map.contains_key(&external_id) {
            return Err(Error::InvalidArgument(format!(
                "duplicate external id {external_id}"
            )));
        }
        let internal = self.external_ids.len() as u32;

        let mut owned;
        let v: &[f32] = if self.metric.needs_normalization() {
            owned = vector.to_vec();
            normalize(&mut owned);
            &owned
        } else {
            vector
        };

        match &mut self.arena {
            CodeArena::Fp32 { data } => data.extend_from_slice(v),
            CodeArena::Sq8 { data, mins, scales } => {
                let (code, min, scale) = sq8_encode(v);
                data.extend_from_slice(&code);
                mins.push(min);
                scales.push(scale);
            }
        }
        self.external_ids.push(external_id);
        self.id_map.insert(external_id, internal);
        Ok(internal)
    }

    /// Validate the query dimension and normalize it if the metric requires.
    pub fn prepare_query<'a>(&self, query: &'a [f32]) -> Result<Cow<'a, [f32]>> {
        if query.len() != self.dim {
            return Err(Error::DimensionNotEqual {
                expected: self.dim,
                actual: query.len(),
            });
        }
        if self.metric.needs_normalization() {
            let mut owned = query.to_vec();
            normalize(&mut owned);
            Ok(Cow::Owned(owned))
        } else {
            Ok(Cow::Borrowed(query))
        }
    }

    #[inline]
    fn fp32_code(data: &[f32], dim: usize, id: u32) -> &[f32] {
        let start = id as usize * dim;
        &data[start..start + dim]
    }

    #[inline]
    fn sq8_code<'a>(data: &'a [u8], mins: &[f32], scales: &[f32], dim: usize, id: u32) -> Sq8Ref<'a> {
        let start = id as usize * dim;
        Sq8Ref {
            data: &data[start..start + dim],
            min: mins[id as usize],
            scale: scales[id as usize],
        }
    }

    /// Distance from a prepared query to the vector at `id`.
    #[inline]
    pub fn query_distance(&self, query: &[f32], id: u32) -> f32 {
        match (&self.arena, self.metric) {
            (CodeArena::Fp32 { data }, DistanceKind::L2) => {
                simd::l2_sq_f32(query, Self::fp32_code(data, self.dim, id))
            }
            (CodeArena::Fp32 { data }, _) => self
                .metric
                .from_dot(simd::dot_f32(query, Self::fp32_code(data, self.dim, id))),
            (CodeArena::Sq8 { data, mins, scales }, DistanceKind::L2) => {
                simd::l2_sq_asym(query, Self::sq8_code(data, mins, scales, self.dim, id))
            }
            (CodeArena::Sq8 { data, mins, scales }, _) => self.metric.from_dot(simd::dot_asym(
                query,
                Self::sq8_code(data, mins, scales, self.dim, id),
            )),
        }
    }

    /// Distance between the vectors at internal ids `a` and `b`.
    ///
    /// Symmetric up to rounding only; the sq8 path reconstructs both sides
    /// from their own calibration.
    #[inline]
    pub fn pair_distance(&self, a: u32, b: u32) -> f32 {
        match (&self.arena, self.metric) {
            (CodeArena::Fp32 { data }, DistanceKind::L2) => simd::l2_sq_f32(
                Self::fp32_code(data, self.dim, a),
                Self::fp32_code(data, self.dim, b),
            ),
            (CodeArena::Fp32 { data }, _) => self.metric.from_dot(simd::dot_f32(
                Self::fp32_code(data, self.dim, a),
                Self::fp32_code(data, self.dim, b),
            )),
            (CodeArena::Sq8 { data, mins, scales }, DistanceKind::L2) => scalar::l2_sq_sq8(
                Self::sq8_code(data, mins, scales, self.dim, a),
                Self::sq8_code(data, mins, scales, self.dim, b),
            ),
            (CodeArena::Sq8 { data, mins, scales }, _) => self.metric.from_dot(scalar::dot_sq8(
                Self::sq8_code(data, mins, scales, self.dim, a),
                Self::sq8_code(data, mins, scales, self.dim, b),
            )),
        }
    }

    /// Decode the vector at `id` into `out` (lossy for sq8).
    pub fn decode_into(&self, id: u32, out: &mut [f32]) {
        match &self.arena {
            CodeArena::Fp32 { data } => {
                out.copy_from_slice(Self::fp32_code(data, self.dim, id));
            }
            CodeArena::Sq8 { data, mins, scales } => {
                crate::codec::sq8_decode(Self::sq8_code(data, mins, scales, self.dim, id), out);
            }
        }
    }

    #[inline]
    pub fn external_id(&self, internal: u32) -> i64 {
        self.external_ids[internal as usize]
    }

    #[inline]
    pub fn internal_id(&self, external: i64) -> Option<u32> {
        self.id_map.get(&external).copied()
    }

    pub fn external_ids(&self) -> &[i64] {
        &self.external_ids
    }

    /// Bytes held live by the arenas and id maps.
    pub fn memory_usage(&self) -> usize {
        let arena = match &self.arena {
            CodeArena::Fp32 { data } => data.capacity() * std::mem::size_of::<f32>(),
            CodeArena::Sq8 { data, mins, scales } => {
                data.capacity()
                    + (mins.capacity() + scales.capacity()) * std::mem::size_of::<f32>()
            }
        };
        arena
            + self.external_ids.capacity() * std::mem::size_of::<i64>()
            + self.id_map.capacity() * (std::mem::size_of::<i64>() + std::mem::size_of::<u32>())
    }

    /// Internal consistency check after deserialization.
    pub fn validate(&self) -> Result<()> {
        let n = self.external_ids.len();
        let arena_ok = match &self.arena {
            CodeArena::Fp32 { data } => data.len() == n * self.dim,
            CodeArena::Sq8 { data, mins, scales } => {
                data.len() == n * self.dim && mins.len() == n && scales.len() == n
            }
        };
        if !arena_ok {
            return Err(Error::InvalidBinary(
                "code arena length does not match element count".into(),
            ));
        }
        if self.id_map.len() != n {
            return Err(Error::InvalidBinary(
                "id map is not a bijection over the stored vectors".into(),
            ));
        }
        for (internal, ext) in self.external_ids.iter().enumerate() {
            if self.id_map.get(ext) != Some(&(internal as u32)) {
                return Err(Error::InvalidBinary(format!(
                    "external id {ext} does not map back to internal id {internal}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(storage: &mut FlatStorage, vectors: &[Vec<f32>]) {
        for (i, v) in vectors.iter().enumerate() {
            storage.insert(i as i64 * 10, v).unwrap();
        }
    }

    #[test]
    fn test_insert_assigns_dense_internal_ids() {
        let mut s = FlatStorage::new(DistanceKind::L2, 3, CodecKind::Fp32);
        assert_eq!(s.insert(5, &[1.0, 0.0, 0.0]).unwrap(), 0);
        assert_eq!(s.insert(-2, &[0.0, 1.0, 0.0]).unwrap(), 1);
        assert_eq!(s.external_id(0), 5);
        assert_eq!(s.internal_id(-2), Some(1));
        assert_eq!(s.internal_id(99), None);
    }

    #[test]
    fn test_duplicate_external_id_rejected() {
        let mut s = FlatStorage::new(DistanceKind::L2, 2, CodecKind::Fp32);
        s.insert(7, &[0.0, 0.0]).unwrap();
        let err = s.insert(7, &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut s = FlatStorage::new(DistanceKind::L2, 4, CodecKind::Fp32);
        let err = s.insert(0, &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, Error::DimensionNotEqual { expected: 4, actual: 2 }));
        let err = s.prepare_query(&[1.0]).unwrap_err();
        assert!(matches!(err, Error::DimensionNotEqual { .. }));
    }

    #[test]
    fn test_l2_distances() {
        let mut s = FlatStorage::new(DistanceKind::L2, 3, CodecKind::Fp32);
        fill(&mut s, &[vec![0.0, 0.0, 0.0], vec![3.0, 4.0, 0.0]]);
        assert!((s.pair_distance(0, 1) - 25.0).abs() < 1e-5);
        let q = s.prepare_query(&[0.0, 0.0, 0.0]).unwrap();
        assert!((s.query_distance(&q, 1) - 25.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_normalizes_stored_and_query() {
        let mut s = FlatStorage::new(DistanceKind::Cosine, 2, CodecKind::Fp32);
        // same direction, different magnitude
        fill(&mut s, &[vec![1.0, 0.0], vec![10.0, 0.0]]);
        assert!(s.pair_distance(0, 1).abs() < 1e-5);
        let q = s.prepare_query(&[100.0, 0.0]).unwrap();
        assert!(s.query_distance(&q, 0).abs() < 1e-5);
    }

    #[test]
    fn test_inner_product_convention() {
        let mut s = FlatStorage::new(DistanceKind::InnerProduct, 2, CodecKind::Fp32);
        fill(&mut s, &[vec![1.0, 0.0], vec![0.0, 1.0]]);
        // orthogonal: 1 - 0 = 1
        assert!((s.pair_distance(0, 1) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_sq8_close_to_fp32() {
        let vectors: Vec<Vec<f32>> = (0..8)
            .map(|i| (0..32).map(|j| ((i * 13 + j * 7) % 17) as f32 / 17.0).collect())
            .collect();
        let mut fp = FlatStorage::new(DistanceKind::L2, 32, CodecKind::Fp32);
        let mut sq = FlatStorage::new(DistanceKind::L2, 32, CodecKind::Sq8);
        fill(&mut fp, &vectors);
        fill(&mut sq, &vectors);
        for a in 0..8u32 {
            for b in 0..8u32 {
                let exact = fp.pair_distance(a, b);
                let approx = sq.pair_distance(a, b);
                assert!(
                    (exact - approx).abs() < 0.05 * exact.max(1.0),
                    "pair ({a},{b}): exact={exact}, approx={approx}"
                );
            }
        }
    }

    #[test]
    fn test_decode_roundtrip() {
        let mut s = FlatStorage::new(DistanceKind::L2, 4, CodecKind::Sq8);
        s.insert(1, &[0.1, 0.9, 0.5, 0.3]).unwrap();
        let mut out = vec![0.0f32; 4];
        s.decode_into(0, &mut out);
        for (a, b) in out.iter().zip([0.1, 0.9, 0.5, 0.3].iter()) {
            assert!((a - b).abs() < 0.01);
        }
    }

    #[test]
    fn test_validate_detects_arena_mismatch() {
        let mut s = FlatStorage::new(DistanceKind::L2, 2, CodecKind::Fp32);
        s.insert(1, &[1.0, 2.0]).unwrap();
        assert!(s.validate().is_ok());
        s.external_ids.push(42); // simulate corruption
        assert!(matches!(s.validate(), Err(Error::InvalidBinary(_))));
    }
}
