//! Seeded k-means clustering of matrix columns
//!
//! k-means++ initialization followed by Lloyd iterations. Every random
//! draw comes from a `StdRng` seeded by the caller, and ties are broken
//! by the smallest cluster index, so memberships are reproducible.

use crate::dmatrix_util::column_sq_distance;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Arguments for k-means clustering
#[derive(Debug, Clone)]
pub struct KmeansArgs {
    /// Number of clusters
    pub num_clusters: usize,
    /// Maximum number of iterations
    pub max_iter: usize,
    /// Random seed for the initial centroids
    pub seed: u64,
}

impl Default for KmeansArgs {
    fn default() -> Self {
        Self {
            num_clusters: 1,
            max_iter: 100,
            seed: 42,
        }
    }
}

impl KmeansArgs {
    /// Create args with specified number of clusters
    pub fn with_clusters(num_clusters: usize) -> Self {
        Self {
            num_clusters,
            ..Default::default()
        }
    }
}

/// Trait for k-means clustering on matrices
pub trait Kmeans {
    /// Cluster columns and return membership vector, one per column
    fn kmeans_columns(&self, args: KmeansArgs) -> Vec<usize>;
}

impl Kmeans for DMatrix<f32> {
    fn kmeans_columns(&self, args: KmeansArgs) -> Vec<usize> {
        let nn = self.ncols();
        let kk = args.num_clusters.min(nn);
        if kk <= 1 {
            return vec![0; nn];
        }

        let mut rng = StdRng::seed_from_u64(args.seed);
        let mut centroids = plus_plus_init(self, kk, &mut rng);
        let mut membership = vec![0_usize; nn];

        for iter in 0..args.max_iter.max(1) {
            let mut changed = 0;
            for j in 0..nn {
                let best = nearest_centroid(self, j, &centroids);
                if best != membership[j] {
                    changed += 1;
                    membership[j] = best;
                }
            }

            if iter > 0 && changed == 0 {
                break;
            }

            // update step; empty clusters keep their previous centroid
            let mut sums = DMatrix::<f32>::zeros(self.nrows(), kk);
            let mut sizes = vec![0_usize; kk];
            for (j, &k) in membership.iter().enumerate() {
                let mut s_k = sums.column_mut(k);
                s_k += self.column(j);
                sizes[k] += 1;
            }
            for k in 0..kk {
                if sizes[k] > 0 {
                    centroids.set_column(k, &(sums.column(k) / sizes[k] as f32));
                }
            }
        }
        membership
    }
}

fn nearest_centroid(xx: &DMatrix<f32>, j: usize, centroids: &DMatrix<f32>) -> usize {
    let mut best = 0;
    let mut best_d = f32::INFINITY;
    for k in 0..centroids.ncols() {
        let d = column_sq_distance(xx, j, centroids, k);
        if d < best_d {
            best_d = d;
            best = k;
        }
    }
    best
}

fn plus_plus_init(xx: &DMatrix<f32>, kk: usize, rng: &mut StdRng) -> DMatrix<f32> {
    let nn = xx.ncols();
    let mut centroids = DMatrix::<f32>::zeros(xx.nrows(), kk);
    let first = rng.random_range(0..nn);
    centroids.set_column(0, &xx.column(first));

    let mut dist = (0..nn)
        .map(|j| column_sq_distance(xx, j, &centroids, 0))
        .collect::<Vec<_>>();

    for k in 1..kk {
        let total: f32 = dist.iter().sum();
        let next = if total > 0. {
            let mut u = rng.random::<f32>() * total;
            let mut pick = nn - 1;
            for (j, &d) in dist.iter().enumerate() {
                if u < d {
                    pick = j;
                    break;
                }
                u -= d;
            }
            pick
        } else {
            rng.random_range(0..nn)
        };
        centroids.set_column(k, &xx.column(next));
        for (j, d_j) in dist.iter_mut().enumerate() {
            *d_j = d_j.min(column_sq_distance(xx, j, &centroids, k));
        }
    }
    centroids
}
