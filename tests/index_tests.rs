//! End-to-end scenarios: build quality, filtered paging, persistence, and
//! strategy selection.

use proxima::builder::{Odescent, OdescentOptions};
use proxima::store::FlatStorage;
use proxima::{
    CodecKind, DistanceKind, Error, Filter, Index, IndexOptions, IteratorContext, SearchOptions,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

const DIM: usize = 32;
const N: usize = 1000;

fn uniform_vectors(n: usize, dim: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * dim).map(|_| rng.gen::<f32>()).collect()
}

fn build_index(n: usize) -> (Index, Vec<f32>) {
    let vectors = uniform_vectors(n, DIM, 47);
    let ids: Vec<i64> = (0..n as i64).collect();
    let index = Index::new(IndexOptions::new(DistanceKind::L2, DIM)).unwrap();
    index.build(&ids, &vectors).unwrap();
    (index, vectors)
}

fn query_vector(seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..DIM).map(|_| rng.gen::<f32>()).collect()
}

fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Exact top-k by linear scan, optionally filtered by external id.
fn exact_knn(vectors: &[f32], query: &[f32], k: usize, filter: impl Fn(i64) -> bool) -> Vec<i64> {
    let mut scored: Vec<(f32, i64)> = (0..vectors.len() / DIM)
        .filter(|&i| filter(i as i64))
        .map(|i| (l2_sq(&vectors[i * DIM..(i + 1) * DIM], query), i as i64))
        .collect();
    scored.sort_by(|a, b| a.partial_cmp(b).unwrap());
    scored.into_iter().take(k).map(|(_, id)| id).collect()
}

struct OddFilter;

impl Filter for OddFilter {
    fn check_valid(&self, external_id: i64) -> bool {
        external_id % 2 != 0
    }
    fn valid_ratio(&self) -> f32 {
        0.618
    }
}

struct NeedleFilter;

impl Filter for NeedleFilter {
    fn check_valid(&self, external_id: i64) -> bool {
        external_id == 0
    }
    fn valid_ratio(&self) -> f32 {
        0.001
    }
}

struct RejectAll;

impl Filter for RejectAll {
    fn check_valid(&self, _external_id: i64) -> bool {
        false
    }
    fn valid_ratio(&self) -> f32 {
        0.5
    }
}

#[test]
fn search_returns_sorted_results_with_high_recall() {
    let (index, vectors) = build_index(N);
    let opts = SearchOptions { ef_search: 100 };

    let mut hit_count = 0usize;
    let mut total = 0usize;
    for q in 0..20u64 {
        let query = query_vector(1000 + q);
        let hits = index.knn_search(&query, 10, &opts, None).unwrap();
        assert_eq!(hits.len(), 10);
        for w in hits.windows(2) {
            assert!(w[0].distance <= w[1].distance, "distances not sorted");
        }
        let exact: HashSet<i64> = exact_knn(&vectors, &query, 10, |_| true).into_iter().collect();
        hit_count += hits.iter().filter(|h| exact.contains(&h.id)).count();
        total += 10;
    }
    let recall = hit_count as f64 / total as f64;
    assert!(recall >= 0.9, "recall {recall} below threshold");
}

#[test]
fn repeated_searches_are_identical() {
    let (index, _) = build_index(N);
    let query = query_vector(7);
    let opts = SearchOptions { ef_search: 80 };
    let a = index.knn_search(&query, 10, &opts, None).unwrap();
    let b = index.knn_search(&query, 10, &opts, None).unwrap();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(x.id, y.id);
        assert_eq!(x.distance, y.distance);
    }
}

#[test]
fn iterator_pages_are_disjoint_and_filtered() {
    let (index, _) = build_index(N);
    let query = query_vector(11);
    let opts = SearchOptions { ef_search: 200 };

    let mut ctx = IteratorContext::new();
    let mut seen: Vec<i64> = Vec::new();
    let mut last_worst = f32::MIN;
    for _ in 0..3 {
        let page = index
            .knn_search_iter(&query, 10, &opts, Some(&OddFilter), &mut ctx)
            .unwrap();
        assert_eq!(page.len(), 10);
        // pages are internally sorted and globally non-decreasing
        assert!(page[0].distance >= last_worst);
        for w in page.windows(2) {
            assert!(w[0].distance <= w[1].distance);
        }
        last_worst = page.last().unwrap().distance;
        seen.extend(page.iter().map(|h| h.id));
    }
    assert_eq!(seen.len(), 30);
    let unique: HashSet<i64> = seen.iter().copied().collect();
    assert_eq!(unique.len(), 30, "pages returned a duplicate id");
    assert!(seen.iter().all(|id| id % 2 != 0), "even id slipped through");
}

#[test]
fn iterator_pages_partition_the_single_shot_result() {
    let (index, _) = build_index(N);
    let query = query_vector(13);
    let opts = SearchOptions { ef_search: 200 };

    let single: Vec<i64> = index
        .knn_search(&query, 30, &opts, Some(&OddFilter))
        .unwrap()
        .into_iter()
        .map(|h| h.id)
        .collect();
    assert_eq!(single.len(), 30);

    let mut ctx = IteratorContext::new();
    let mut paged: Vec<i64> = Vec::new();
    for _ in 0..3 {
        let page = index
            .knn_search_iter(&query, 10, &opts, Some(&OddFilter), &mut ctx)
            .unwrap();
        paged.extend(page.iter().map(|h| h.id));
    }

    let single_set: HashSet<i64> = single.into_iter().collect();
    let paged_set: HashSet<i64> = paged.into_iter().collect();
    assert_eq!(single_set, paged_set);
}

#[test]
fn iterator_context_rejects_a_different_query() {
    let (index, _) = build_index(200);
    let opts = SearchOptions { ef_search: 50 };
    let mut ctx = IteratorContext::new();
    index
        .knn_search_iter(&query_vector(1), 5, &opts, None, &mut ctx)
        .unwrap();
    let err = index
        .knn_search_iter(&query_vector(2), 5, &opts, None, &mut ctx)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn serialize_deserialize_preserves_results() {
    let (index, _) = build_index(N);
    let query = query_vector(21);
    let opts = SearchOptions { ef_search: 100 };
    let before = index.knn_search(&query, 10, &opts, None).unwrap();

    let mut bytes = Vec::new();
    index.serialize(&mut bytes).unwrap();
    let restored = Index::deserialize(&mut bytes.as_slice()).unwrap();
    assert_eq!(restored.num_elements(), N);

    let after = restored.knn_search(&query, 10, &opts, None).unwrap();
    assert_eq!(before.len(), after.len());
    for (x, y) in before.iter().zip(after.iter()) {
        assert_eq!(x.id, y.id);
        assert_eq!(x.distance.to_bits(), y.distance.to_bits());
    }
}

#[test]
fn serialize_to_file_roundtrip() {
    let (index, _) = build_index(200);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.pxi");

    let mut file = std::fs::File::create(&path).unwrap();
    index.serialize(&mut file).unwrap();
    drop(file);

    let mut file = std::fs::File::open(&path).unwrap();
    let restored = Index::deserialize(&mut file).unwrap();
    assert_eq!(restored.num_elements(), 200);
}

#[test]
fn deserialize_rejects_corruption() {
    let (index, _) = build_index(100);
    let mut bytes = Vec::new();
    index.serialize(&mut bytes).unwrap();

    // flip a byte near the start of the payload region (the block store is
    // zero-padded past the payload, where a flip would go unnoticed)
    bytes[128] ^= 0xff;
    assert!(matches!(
        Index::deserialize(&mut bytes.as_slice()),
        Err(Error::InvalidBinary(_))
    ));

    // bad magic
    let mut bytes2 = Vec::new();
    index.serialize(&mut bytes2).unwrap();
    bytes2[0] = b'X';
    assert!(matches!(
        Index::deserialize(&mut bytes2.as_slice()),
        Err(Error::InvalidBinary(_))
    ));
}

#[test]
fn selective_filter_takes_the_brute_force_path() {
    let (index, _) = build_index(N);
    let opts = SearchOptions { ef_search: 100 };
    assert_eq!(index.stats().bruteforce_searches, 0);

    let hits = index
        .knn_search(&query_vector(3), 10, &opts, Some(&NeedleFilter))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 0);
    let stats = index.stats();
    assert_eq!(stats.bruteforce_searches, 1);

    // an unfiltered search goes through the graph
    index.knn_search(&query_vector(3), 10, &opts, None).unwrap();
    let stats = index.stats();
    assert_eq!(stats.bruteforce_searches, 1);
    assert!(stats.graph_searches >= 1);
}

#[test]
fn reject_all_filter_returns_empty_pages() {
    let (index, _) = build_index(300);
    let opts = SearchOptions { ef_search: 50 };
    let query = query_vector(5);

    let hits = index.knn_search(&query, 10, &opts, Some(&RejectAll)).unwrap();
    assert!(hits.is_empty());

    let mut ctx = IteratorContext::new();
    let page = index
        .knn_search_iter(&query, 10, &opts, Some(&RejectAll), &mut ctx)
        .unwrap();
    assert!(page.is_empty());
    let page = index
        .knn_search_iter(&query, 10, &opts, Some(&RejectAll), &mut ctx)
        .unwrap();
    assert!(page.is_empty());
}

#[test]
fn k_larger_than_admitted_returns_all_admitted() {
    let (index, _) = build_index(400);
    let opts = SearchOptions { ef_search: 100 };
    struct FirstFive;
    impl Filter for FirstFive {
        fn check_valid(&self, external_id: i64) -> bool {
            external_id < 5
        }
        fn valid_ratio(&self) -> f32 {
            0.0125
        }
    }
    let hits = index
        .knn_search(&query_vector(9), 50, &opts, Some(&FirstFive))
        .unwrap();
    assert_eq!(hits.len(), 5);
    let ids: HashSet<i64> = hits.iter().map(|h| h.id).collect();
    assert_eq!(ids, (0..5).collect::<HashSet<i64>>());
}

#[test]
fn range_search_returns_points_within_radius() {
    let (index, vectors) = build_index(N);
    let query = query_vector(31);
    let opts = SearchOptions { ef_search: 100 };

    let hits = index.knn_search(&query, 20, &opts, None).unwrap();
    let radius = hits[9].distance;
    let ranged = index.range_search(&query, radius, &opts, None).unwrap();
    assert!(!ranged.is_empty());
    assert!(ranged.iter().all(|h| h.distance <= radius));
    for w in ranged.windows(2) {
        assert!(w[0].distance <= w[1].distance);
    }
    // sanity against the exact count at that radius
    let exact_within = (0..N)
        .filter(|&i| l2_sq(&vectors[i * DIM..(i + 1) * DIM], &query) <= radius)
        .count();
    assert!(ranged.len() <= exact_within);
    assert!(ranged.len() >= 8);

    assert!(matches!(
        index.range_search(&query, -1.0, &opts, None),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn odescent_standalone_respects_degree_and_in_degree_bounds() {
    let vectors = uniform_vectors(1000, DIM, 47);
    let mut storage = FlatStorage::new(DistanceKind::L2, DIM, CodecKind::Fp32);
    for i in 0..1000 {
        storage.insert(i as i64, &vectors[i * DIM..(i + 1) * DIM]).unwrap();
    }
    let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();

    for pruning in [false, true] {
        let mut builder = Odescent::new(
            &storage,
            &pool,
            OdescentOptions {
                max_degree: 16,
                pruning,
                ..OdescentOptions::default()
            },
        );
        builder.build().unwrap();
        let adjacency = builder.into_adjacency();

        let mut in_degrees = vec![0usize; 1000];
        let mut total_out = 0usize;
        for (i, list) in adjacency.iter().enumerate() {
            assert!(list.len() <= 16, "node {i} over out-degree cap");
            total_out += list.len();
            for &id in list {
                in_degrees[id as usize] += 1;
            }
        }
        assert!(total_out as f64 / 1000.0 <= 16.0);
        for (i, &d) in in_degrees.iter().enumerate() {
            assert!(d >= 1, "node {i} unreachable (pruning={pruning})");
        }
    }
}

#[test]
fn incremental_add_after_build_is_searchable() {
    let (index, vectors) = build_index(500);
    // a near-duplicate of vector 0 under a fresh external id
    let mut twin: Vec<f32> = vectors[0..DIM].to_vec();
    twin[0] += 1e-4;
    index.add(500_000, &twin).unwrap();
    assert_eq!(index.num_elements(), 501);

    let hits = index
        .knn_search(&twin, 2, &SearchOptions { ef_search: 50 }, None)
        .unwrap();
    let ids: Vec<i64> = hits.iter().map(|h| h.id).collect();
    assert!(ids.contains(&500_000), "added point not found: {ids:?}");
    assert!(ids.contains(&0));
    assert!(hits[0].distance < 1e-6);
}

#[test]
fn cosine_index_orders_by_angle() {
    let index = Index::new(IndexOptions::new(DistanceKind::Cosine, 4)).unwrap();
    index
        .build(
            &[1, 2, 3],
            &[
                1.0, 0.0, 0.0, 0.0, // same direction as query, large magnitude
                0.0, 1.0, 0.0, 0.0, // orthogonal
                0.7, 0.7, 0.0, 0.0, // 45 degrees
            ],
        )
        .unwrap();
    let hits = index
        .knn_search(&[5.0, 0.0, 0.0, 0.0], 3, &SearchOptions::default(), None)
        .unwrap();
    assert_eq!(hits[0].id, 1);
    assert_eq!(hits[1].id, 3);
    assert_eq!(hits[2].id, 2);
    assert!(hits[0].distance < 1e-5);
    assert!((hits[2].distance - 1.0).abs() < 1e-5);
}
