//! Seeded, weighted k-means.
//!
//! Extended codebooks are initialised from local features. Every silo clusters its own encoder
//! features and submits the centroids along with the cluster sizes. The coordinator clusters the
//! union of these centroids again, weighted by the cluster sizes, which yields the codewords of
//! the new codebook without any silo revealing its raw features.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors related to k-means clustering.
pub enum KMeansError {
    #[error("cannot build {k} clusters from {n} points")]
    TooFewPoints { n: usize, k: usize },
    #[error("the points don't have the dimension {0}")]
    DimensionMismatch(usize),
    #[error("the number of weights doesn't match the number of points")]
    WeightsMismatch,
    #[error("the number of clusters and the dimension must be positive")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
/// The result of a k-means clustering.
pub struct Clustering {
    /// The centroids, `k × dim` in row-major order.
    pub centroids: Vec<f32>,
    /// The summed weight of the points assigned to each centroid.
    pub sizes: Vec<f64>,
    /// The cluster of every point.
    pub assignments: Vec<usize>,
    /// The number of Lloyd iterations that were run.
    pub iterations: usize,
}

impl Clustering {
    /// Gets the centroid of the given cluster.
    pub fn centroid(&self, cluster: usize) -> &[f32] {
        let dim = self.centroids.len() / self.sizes.len();
        &self.centroids[cluster * dim..(cluster + 1) * dim]
    }
}

/// Parameters of a k-means run.
#[derive(Debug, Clone, Copy)]
pub struct KMeans {
    /// The number of clusters.
    pub k: usize,
    /// The dimension of the points.
    pub dim: usize,
    /// The maximal number of Lloyd iterations.
    pub max_iter: usize,
    /// The seed for the k-means++ initialisation.
    pub seed: u64,
}

impl KMeans {
    /// Creates k-means parameters with at most `300` iterations and seed `0`.
    pub fn new(k: usize, dim: usize) -> Self {
        Self {
            k,
            dim,
            max_iter: 300,
            seed: 0,
        }
    }

    /// Sets the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the maximal number of iterations.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Clusters the `points` (row-major, `n × dim`), all weighted equally.
    pub fn fit(&self, points: &[f32]) -> Result<Clustering, KMeansError> {
        let n = if self.dim == 0 { 0 } else { points.len() / self.dim };
        self.fit_weighted(points, &vec![1.; n])
    }

    /// Clusters the `points` (row-major, `n × dim`) weighted by `weights`.
    ///
    /// # Errors
    /// Fails if there are fewer points than clusters or if the input dimensions are
    /// inconsistent.
    pub fn fit_weighted(&self, points: &[f32], weights: &[f64]) -> Result<Clustering, KMeansError> {
        let KMeans { k, dim, .. } = *self;
        if k == 0 || dim == 0 {
            return Err(KMeansError::Empty);
        }
        if points.len() % dim != 0 {
            return Err(KMeansError::DimensionMismatch(dim));
        }
        let n = points.len() / dim;
        if weights.len() != n {
            return Err(KMeansError::WeightsMismatch);
        }
        if n < k {
            return Err(KMeansError::TooFewPoints { n, k });
        }

        let point = |i: usize| &points[i * dim..(i + 1) * dim];
        let mut centroids = self.init_plus_plus(points, weights, n);
        let mut assignments = vec![usize::MAX; n];
        let mut sizes = vec![0.; k];
        let mut iterations = 0;

        while iterations < self.max_iter {
            iterations += 1;

            let mut changed = false;
            for (i, assignment) in assignments.iter_mut().enumerate() {
                let (closest, _) = nearest(&centroids, dim, point(i));
                if *assignment != closest {
                    *assignment = closest;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![0_f64; k * dim];
            sizes.iter_mut().for_each(|s| *s = 0.);
            for (i, &c) in assignments.iter().enumerate() {
                sizes[c] += weights[i];
                for (s, &x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(point(i)) {
                    *s += weights[i] * x as f64;
                }
            }

            for c in 0..k {
                if sizes[c] > 0. {
                    for (value, s) in centroids[c * dim..(c + 1) * dim]
                        .iter_mut()
                        .zip(&sums[c * dim..(c + 1) * dim])
                    {
                        *value = (s / sizes[c]) as f32;
                    }
                } else {
                    // reseed an empty cluster with the point that is worst represented
                    let far = (0..n)
                        .max_by(|&a, &b| {
                            let da =
                                squared_distance(point(a), centroid(&centroids, dim, assignments[a]));
                            let db =
                                squared_distance(point(b), centroid(&centroids, dim, assignments[b]));
                            da.total_cmp(&db)
                        })
                        .unwrap_or(0);
                    centroids[c * dim..(c + 1) * dim].copy_from_slice(point(far));
                    assignments[far] = c;
                }
            }
        }

        sizes.iter_mut().for_each(|s| *s = 0.);
        for (i, &c) in assignments.iter().enumerate() {
            sizes[c] += weights[i];
        }

        Ok(Clustering {
            centroids,
            sizes,
            assignments,
            iterations,
        })
    }

    /// Picks the initial centroids with weighted k-means++.
    fn init_plus_plus(&self, points: &[f32], weights: &[f64], n: usize) -> Vec<f32> {
        let KMeans { k, dim, seed, .. } = *self;
        let point = |i: usize| &points[i * dim..(i + 1) * dim];
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut centroids = Vec::with_capacity(k * dim);
        let first = sample(&mut rng, weights).unwrap_or(0);
        centroids.extend_from_slice(point(first));

        let mut distances: Vec<f64> = (0..n)
            .map(|i| squared_distance(point(i), point(first)) as f64)
            .collect();
        for _ in 1..k {
            let scores: Vec<f64> = distances
                .iter()
                .zip(weights)
                .map(|(d, w)| d * w)
                .collect();
            // all remaining points coincide with a centroid: fall back to the weights
            let next = sample(&mut rng, &scores)
                .or_else(|| sample(&mut rng, weights))
                .unwrap_or(0);
            let start = centroids.len();
            centroids.extend_from_slice(point(next));
            for (i, d) in distances.iter_mut().enumerate() {
                let new = squared_distance(point(i), &centroids[start..start + dim]) as f64;
                if new < *d {
                    *d = new;
                }
            }
        }
        centroids
    }
}

/// Samples an index proportionally to the given non-negative scores.
fn sample(rng: &mut impl Rng, scores: &[f64]) -> Option<usize> {
    let total: f64 = scores.iter().sum();
    if total.is_nan() || total <= 0. {
        return None;
    }
    let mut target = rng.gen::<f64>() * total;
    for (i, s) in scores.iter().enumerate() {
        if *s > 0. {
            if target < *s {
                return Some(i);
            }
            target -= s;
        }
    }
    scores.iter().rposition(|s| *s > 0.)
}

fn centroid(centroids: &[f32], dim: usize, c: usize) -> &[f32] {
    &centroids[c * dim..(c + 1) * dim]
}

/// Finds the centroid closest to `x` and returns its index and squared distance.
pub fn nearest(centroids: &[f32], dim: usize, x: &[f32]) -> (usize, f32) {
    centroids
        .chunks_exact(dim)
        .enumerate()
        .map(|(c, centroid)| (c, squared_distance(x, centroid)))
        .fold((0, f32::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

/// The squared euclidean distance between two points.
pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
