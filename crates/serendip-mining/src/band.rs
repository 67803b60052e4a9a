//! Cross-similarity, percentile bands and per-source top-K selection.
//!
//! These are the pure parts of mining: given a source batch and a destination
//! sample they decide which pairs a round accepts. Nothing here touches storage.

use std::collections::HashSet;

use serde::Serialize;

use serendip_core::similarity::{cosine_with_norms, norm, percentile_cont, sorted_values};
use serendip_core::{CanonicalPair, ClaimEmbedding, DistributionSnapshot};

/// Slack applied to band membership to absorb `f32`/`f64` rounding.
pub const BAND_EPSILON: f64 = 1e-6;

/// One scored (source, destination) pair of a round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    /// Index into the source batch.
    pub source: usize,
    /// Index into the destination sample.
    pub dest: usize,
    pub similarity: f32,
    pub key: CanonicalPair,
}

/// Acceptance interval on similarity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Band {
    pub low: f64,
    pub high: f64,
}

impl Band {
    pub fn contains(&self, similarity: f32) -> bool {
        let s = similarity as f64;
        s >= self.low - BAND_EPSILON && s <= self.high + BAND_EPSILON
    }
}

/// Score every source against every destination, skipping self-pairs and
/// pairs whose claims share a document.
pub fn cross_similarities(sources: &[ClaimEmbedding], dests: &[ClaimEmbedding]) -> Vec<Edge> {
    let dest_norms: Vec<f32> = dests.iter().map(|d| norm(d.vector.as_slice())).collect();
    let mut edges = Vec::with_capacity(sources.len() * dests.len());

    for (si, source) in sources.iter().enumerate() {
        let sv = source.vector.as_slice();
        let source_norm = norm(sv);
        for (di, dest) in dests.iter().enumerate() {
            if dest.document_id == source.document_id {
                continue;
            }
            let Some(key) = CanonicalPair::new(source.id, dest.id) else {
                continue;
            };
            let similarity =
                cosine_with_norms(sv, dest.vector.as_slice(), source_norm, dest_norms[di]);
            edges.push(Edge {
                source: si,
                dest: di,
                similarity,
                key,
            });
        }
    }
    edges
}

/// The `[p_low, p_high]` percentile band of a round's own similarities.
///
/// `None` when the round produced no edges.
pub fn local_band(edges: &[Edge], p_low: f64, p_high: f64) -> Option<Band> {
    let sorted = sorted_values(edges.iter().map(|e| e.similarity as f64));
    Some(Band {
        low: percentile_cont(&sorted, p_low)?,
        high: percentile_cont(&sorted, p_high)?,
    })
}

/// The `[p_low, p_high]` band interpolated from a distribution snapshot.
pub fn global_band(snapshot: &DistributionSnapshot, p_low: f64, p_high: f64) -> Option<Band> {
    Some(Band {
        low: snapshot.similarity_at(p_low)?,
        high: snapshot.similarity_at(p_high)?,
    })
}

/// Pick, for each source, its lowest-similarity in-band edges.
///
/// `remaining[s]` is how many more pairs source `s` may take; it is decremented
/// for every pick. Pairs already in `taken` are skipped, and each pick is added
/// to it, so a pair reached from both ends is kept once. Ties on similarity are
/// broken by canonical pair so the selection is deterministic.
pub fn select_top_k(
    edges: &[Edge],
    band: &Band,
    remaining: &mut [usize],
    taken: &mut HashSet<CanonicalPair>,
) -> Vec<Edge> {
    let mut per_source: Vec<Vec<&Edge>> = vec![Vec::new(); remaining.len()];
    for edge in edges.iter().filter(|e| band.contains(e.similarity)) {
        if let Some(bucket) = per_source.get_mut(edge.source) {
            bucket.push(edge);
        }
    }

    let mut picked = Vec::new();
    for (source, mut bucket) in per_source.into_iter().enumerate() {
        if remaining[source] == 0 || bucket.is_empty() {
            continue;
        }
        bucket.sort_by(|a, b| {
            a.similarity
                .total_cmp(&b.similarity)
                .then_with(|| a.key.cmp(&b.key))
        });
        for edge in bucket {
            if remaining[source] == 0 {
                break;
            }
            if taken.insert(edge.key) {
                picked.push(*edge);
                remaining[source] -= 1;
            }
        }
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use serendip_core::Vector;
    use uuid::Uuid;

    fn claim(id: i64, doc: Uuid, v: Vec<f32>) -> ClaimEmbedding {
        ClaimEmbedding {
            id,
            document_id: doc,
            vector: Vector::from(v),
            sample_key: 0.5,
        }
    }

    fn edge(source: usize, dest_id: i64, similarity: f32) -> Edge {
        Edge {
            source,
            dest: dest_id as usize,
            similarity,
            key: CanonicalPair::new(1000 + source as i64, dest_id).unwrap(),
        }
    }

    #[test]
    fn test_cross_similarities_skips_self_and_same_document() {
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let sources = vec![claim(1, doc_a, vec![1.0, 0.0])];
        let dests = vec![
            claim(1, doc_a, vec![1.0, 0.0]),
            claim(2, doc_a, vec![0.0, 1.0]),
            claim(3, doc_b, vec![1.0, 1.0]),
        ];
        let edges = cross_similarities(&sources, &dests);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].key, CanonicalPair { a: 1, b: 3 });
        assert!((edges[0].similarity - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_local_band_matches_percentiles() {
        // Similarities 0.00, 0.01, ..., 1.00.
        let edges: Vec<Edge> = (0..=100).map(|i| edge(0, i, i as f32 / 100.0)).collect();
        let band = local_band(&edges, 0.10, 0.35).unwrap();
        assert!((band.low - 0.10).abs() < 1e-6);
        assert!((band.high - 0.35).abs() < 1e-6);
        assert!(local_band(&[], 0.1, 0.35).is_none());
    }

    #[test]
    fn test_band_contains_is_inclusive() {
        let band = Band {
            low: 0.2,
            high: 0.4,
        };
        assert!(band.contains(0.2));
        assert!(band.contains(0.4));
        assert!(!band.contains(0.41));
        assert!(!band.contains(0.19));
    }

    #[test]
    fn test_select_top_k_prefers_lowest_similarity_in_band() {
        let edges = vec![
            edge(0, 1, 0.05),
            edge(0, 2, 0.30),
            edge(0, 3, 0.20),
            edge(0, 4, 0.25),
            edge(0, 5, 0.90),
        ];
        let band = Band {
            low: 0.1,
            high: 0.35,
        };
        let mut remaining = vec![2];
        let mut taken = HashSet::new();
        let picked = select_top_k(&edges, &band, &mut remaining, &mut taken);
        let sims: Vec<f32> = picked.iter().map(|e| e.similarity).collect();
        assert_eq!(sims, vec![0.20, 0.25]);
        assert_eq!(remaining, vec![0]);
    }

    #[test]
    fn test_select_top_k_respects_remaining_quota_and_taken() {
        let edges = vec![edge(0, 1, 0.2), edge(0, 2, 0.3), edge(1, 3, 0.2)];
        let band = Band {
            low: 0.0,
            high: 1.0,
        };
        let mut remaining = vec![5, 0];
        let mut taken = HashSet::from([edges[0].key]);
        let picked = select_top_k(&edges, &band, &mut remaining, &mut taken);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].key, edges[1].key);
        assert_eq!(remaining, vec![4, 0]);
    }

    #[test]
    fn test_global_band_reads_snapshot_deciles() {
        let snapshot = DistributionSnapshot {
            run_id: Uuid::nil(),
            corpus_size: 10,
            observation_count: 100,
            percentiles: (0..=10).map(|i| i as f64 / 20.0).collect(),
            mean: 0.25,
            stddev: 0.1,
            is_approximate: true,
            compute_ms: 0,
            computed_at: chrono::Utc::now(),
        };
        let band = global_band(&snapshot, 0.2, 0.4).unwrap();
        assert!((band.low - 0.1).abs() < 1e-9);
        assert!((band.high - 0.2).abs() < 1e-9);
    }
}
