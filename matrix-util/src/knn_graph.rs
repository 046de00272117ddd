use crate::knn_match::{ColumnDict, ColumnDictArgs};
use crate::utils::create_jobs;

use dashmap::DashMap;
use indicatif::ParallelProgressIterator;
use log::info;
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rayon::prelude::*;

const DEFAULT_BLOCK_SIZE: usize = 1000;

/// Undirected kNN graph: an edge joins two points when either one is
/// among the other's `k` nearest neighbours
pub struct KnnGraph {
    /// symmetric `n x n` distances
    pub adjacency: CscMatrix<f32>,
    /// `(i, j)` with `i < j`, sorted
    pub edges: Vec<(usize, usize)>,
    /// parallel to `edges`
    pub distances: Vec<f32>,
    pub n_nodes: usize,
}

pub struct KnnGraphArgs {
    pub knn: usize,
    pub block_size: usize,
    pub dict: ColumnDictArgs,
}

impl KnnGraphArgs {
    pub fn new(knn: usize, dict: ColumnDictArgs) -> Self {
        Self {
            knn,
            block_size: DEFAULT_BLOCK_SIZE,
            dict,
        }
    }
}

impl KnnGraph {
    /// Build the graph over the columns of `points` (d x n)
    pub fn from_columns(points: &DMatrix<f32>, args: &KnnGraphArgs) -> anyhow::Result<KnnGraph> {
        let nn = points.ncols();
        if nn < 2 {
            anyhow::bail!("need at least two points for a kNN graph, got {}", nn);
        }

        let dict = ColumnDict::from_dmatrix_columns(points, (0..nn).collect::<Vec<usize>>(), &args.dict)?;
        let knn = args.knn.min(nn - 1).max(1);

        let jobs = create_jobs(nn, args.block_size.max(1));
        let njobs = jobs.len() as u64;

        // i < j keys; a pair found from both ends keeps the shorter distance
        let pairs: DashMap<(usize, usize), f32> = DashMap::new();

        jobs.into_par_iter()
            .progress_count(njobs)
            .for_each(|(lb, ub)| {
                for i in lb..ub {
                    let (indices, distances) = dict.search_others_by_index(i, knn);
                    for (j, d) in indices.into_iter().zip(distances) {
                        let key = (i.min(j), i.max(j));
                        pairs
                            .entry(key)
                            .and_modify(|x| *x = x.min(d))
                            .or_insert(d);
                    }
                }
            });

        if pairs.is_empty() {
            anyhow::bail!("no neighbours found among {} points", nn);
        }

        let mut edges = pairs.into_iter().collect::<Vec<_>>();
        edges.par_sort_by_key(|&(ij, _)| ij);

        info!("{} edges in the {}-nn graph of {} points", edges.len(), knn, nn);

        let mut coo = CooMatrix::new(nn, nn);
        for &((i, j), d) in edges.iter() {
            coo.push(i, j, d);
            coo.push(j, i, d);
        }

        let (edges, distances): (Vec<_>, Vec<_>) = edges.into_iter().unzip();

        Ok(KnnGraph {
            adjacency: CscMatrix::from(&coo),
            edges,
            distances,
            n_nodes: nn,
        })
    }

    /// Neighbours of `node`, in increasing index
    pub fn neighbors(&self, node: usize) -> &[usize] {
        let offsets = self.adjacency.col_offsets();
        &self.adjacency.row_indices()[offsets[node]..offsets[node + 1]]
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Membership strength of every edge, in `(0, 1]` and parallel to
    /// `edges`.
    ///
    /// Each node gets a local offset `rho` (its nearest distance) and a
    /// bandwidth `sigma` with `sum_j exp(-(d_ij - rho_i)/sigma_i) =
    /// log2(degree_i)`. The two directed strengths of an edge are then
    /// combined as a fuzzy union, `a + b - a * b`.
    pub fn fuzzy_kernel_weights(&self) -> Vec<f32> {
        let offsets = self.adjacency.col_offsets();
        let values = self.adjacency.values();

        let (rho, sigma): (Vec<f32>, Vec<f32>) = (0..self.n_nodes)
            .into_par_iter()
            .map(|i| {
                let dists = &values[offsets[i]..offsets[i + 1]];
                if dists.is_empty() {
                    return (0., 1.);
                }
                let rho = dists.iter().cloned().fold(f32::INFINITY, f32::min);
                let target = (dists.len() as f32).log2();
                (rho, bandwidth(dists, rho, target))
            })
            .unzip();

        self.edges
            .iter()
            .zip(self.distances.iter())
            .map(|(&(i, j), &d)| {
                let w_ij = strength(d, rho[i], sigma[i]);
                let w_ji = strength(d, rho[j], sigma[j]);
                w_ij + w_ji - w_ij * w_ji
            })
            .collect()
    }
}

fn strength(d: f32, rho: f32, sigma: f32) -> f32 {
    (-(d - rho).max(0.) / sigma).exp()
}

/// Bisection for `sigma` in `sum_j exp(-max(0, d_j - rho) / sigma) = target`
fn bandwidth(dists: &[f32], rho: f32, target: f32) -> f32 {
    const TOL: f32 = 1e-5;
    const MAX_ITER: usize = 64;

    let mean = dists.iter().sum::<f32>() / dists.len() as f32;

    let (mut lo, mut hi, mut sigma) = (0f32, f32::INFINITY, 1f32);
    for _ in 0..MAX_ITER {
        let psum = dists.iter().map(|&d| strength(d, rho, sigma)).sum::<f32>();
        if (psum - target).abs() < TOL {
            break;
        }
        if psum > target {
            hi = sigma;
            sigma = (lo + hi) / 2.;
        } else {
            lo = sigma;
            sigma = if hi.is_finite() { (lo + hi) / 2. } else { sigma * 2. };
        }
    }
    sigma.max(1e-3 * mean).max(f32::MIN_POSITIVE)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// five points near the origin, five near (10, 10)
    fn two_blobs() -> DMatrix<f32> {
        let offsets = [(0., 0.), (0.1, 0.), (0., 0.1), (0.1, 0.1), (0.05, 0.05)];
        DMatrix::from_fn(2, 10, |i, j| {
            let (x, y) = offsets[j % 5];
            let shift = if j < 5 { 0. } else { 10. };
            shift + if i == 0 { x } else { y }
        })
    }

    fn args(knn: usize) -> KnnGraphArgs {
        KnnGraphArgs::new(knn, ColumnDictArgs::default())
    }

    #[test]
    fn edges_stay_within_blobs() {
        let graph = KnnGraph::from_columns(&two_blobs(), &args(3)).unwrap();
        assert_eq!(graph.edges.len(), graph.distances.len());
        for &(i, j) in graph.edges.iter() {
            assert!(i < j);
            assert_eq!(i < 5, j < 5, "edge ({}, {}) crosses blobs", i, j);
        }
    }

    #[test]
    fn adjacency_is_symmetric() {
        let graph = KnnGraph::from_columns(&two_blobs(), &args(2)).unwrap();
        for node in 0..graph.n_nodes {
            assert!(!graph.neighbors(node).is_empty());
            for &other in graph.neighbors(node) {
                assert!(graph.neighbors(other).contains(&node));
            }
        }
    }

    #[test]
    fn weights_are_memberships() {
        let graph = KnnGraph::from_columns(&two_blobs(), &args(4)).unwrap();
        let weights = graph.fuzzy_kernel_weights();
        assert_eq!(weights.len(), graph.num_edges());
        assert!(weights.iter().all(|&w| w > 0. && w <= 1.));
    }

    #[test]
    fn bandwidth_hits_target() {
        let dists = [0.1, 0.2, 0.3, 0.5, 1.0];
        let target = 5f32.log2();
        let sigma = bandwidth(&dists, 0.1, target);
        let psum = dists.iter().map(|&d| strength(d, 0.1, sigma)).sum::<f32>();
        assert!((psum - target).abs() < 0.01);
    }

    #[test]
    fn single_point_is_rejected() {
        assert!(KnnGraph::from_columns(&DMatrix::zeros(2, 1), &args(3)).is_err());
    }
}
