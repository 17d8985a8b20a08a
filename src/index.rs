use serde::{Deserialize, Serialize};
use thiserror::Error;

const KMEANS_MAX_ITERATIONS: usize = 25;
const KMEANS_TOLERANCE: f32 = 1e-4;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index is not trained; call train() before adding vectors")]
    NotTrained,
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("cannot train on an empty vector set")]
    EmptyTrainingSet,
}

/// Inverted-file index with a flat (exact squared-L2) coarse quantizer.
///
/// Vector space is partitioned into `nlist` clusters by k-means; each stored
/// vector lives in the inverted list of its nearest centroid. A query scans
/// the `nprobe` closest clusters only, trading exactness for speed. Distances
/// are squared Euclidean over `f32` vectors and are not normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfIndex {
    dimension: usize,
    nlist: usize,
    nprobe: usize,
    trained: bool,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<usize>>,
    vectors: Vec<Vec<f32>>,
}

impl IvfIndex {
    pub fn new(dimension: usize, nlist: usize, nprobe: usize) -> Self {
        Self {
            dimension,
            nlist: nlist.max(1),
            nprobe: nprobe.max(1),
            trained: false,
            centroids: Vec::new(),
            lists: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Fits cluster centroids on the training set with Lloyd's algorithm.
    /// Skipped (with a debug log) when the index is already trained; the
    /// trained structure is reused until the index is rebuilt from scratch.
    /// `nlist` is clamped to the training-set size for small corpora.
    pub fn train(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        if self.trained {
            tracing::debug!("Index already trained, skipping training");
            return Ok(());
        }
        if vectors.is_empty() {
            return Err(IndexError::EmptyTrainingSet);
        }
        for v in vectors {
            if v.len() != self.dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dimension,
                    actual: v.len(),
                });
            }
        }

        let k = self.nlist.min(vectors.len());
        if k < self.nlist {
            tracing::warn!(
                "Clamping nlist from {} to {} (training set has only {} vectors)",
                self.nlist,
                k,
                vectors.len()
            );
            self.nlist = k;
        }

        // Deterministic init: evenly spaced picks across the training set.
        let mut centroids: Vec<Vec<f32>> = (0..k)
            .map(|i| vectors[i * vectors.len() / k].clone())
            .collect();

        let mut assignments = vec![0usize; vectors.len()];
        for _ in 0..KMEANS_MAX_ITERATIONS {
            for (i, v) in vectors.iter().enumerate() {
                assignments[i] = nearest(&centroids, v);
            }

            let mut sums = vec![vec![0.0f32; self.dimension]; k];
            let mut counts = vec![0usize; k];
            for (i, v) in vectors.iter().enumerate() {
                let c = assignments[i];
                counts[c] += 1;
                for (s, x) in sums[c].iter_mut().zip(v) {
                    *s += x;
                }
            }

            let mut movement = 0.0f32;
            for c in 0..k {
                if counts[c] == 0 {
                    // Empty cluster: keep its previous centroid.
                    continue;
                }
                let inv = 1.0 / counts[c] as f32;
                for s in sums[c].iter_mut() {
                    *s *= inv;
                }
                movement += squared_l2(&centroids[c], &sums[c]);
                centroids[c] = std::mem::take(&mut sums[c]);
            }

            if movement < KMEANS_TOLERANCE {
                break;
            }
        }

        self.centroids = centroids;
        self.lists = vec![Vec::new(); k];
        self.trained = true;
        tracing::info!(
            "Trained IVF index: {} clusters over {} training vectors",
            k,
            vectors.len()
        );
        Ok(())
    }

    /// Adds one vector, assigning it to the inverted list of its nearest
    /// centroid. Returns the vector's position, which callers use to map
    /// results back to their own records.
    pub fn add(&mut self, vector: Vec<f32>) -> Result<usize, IndexError> {
        if !self.trained {
            return Err(IndexError::NotTrained);
        }
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let position = self.vectors.len();
        let cluster = nearest(&self.centroids, &vector);
        self.lists[cluster].push(position);
        self.vectors.push(vector);
        Ok(position)
    }

    /// Returns up to `k` (position, squared-L2 distance) pairs in ascending
    /// distance order, scanning only the `nprobe` nearest clusters. An
    /// untrained or empty index returns no results.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if !self.trained || self.vectors.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut centroid_dists: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(c, centroid)| (c, squared_l2(centroid, query)))
            .collect();
        centroid_dists.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut candidates: Vec<(usize, f32)> = Vec::new();
        for &(cluster, _) in centroid_dists.iter().take(self.nprobe) {
            for &position in &self.lists[cluster] {
                let dist = squared_l2(&self.vectors[position], query);
                candidates.push((position, dist));
            }
        }

        candidates.sort_by(|a, b| a.1.total_cmp(&b.1));
        candidates.truncate(k);
        candidates
    }
}

fn nearest(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let dist = squared_l2(centroid, vector);
        if dist < best_dist {
            best = c;
            best_dist = dist;
        }
    }
    best
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
