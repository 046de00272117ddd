//! PCA of the integrated matrix and a 2-D neighbour-preserving layout
//!
//! The layout optimizes the UMAP cross-entropy (McInnes et al. 2018)
//! over a fuzzy kNN graph of the principal components by sequential
//! stochastic gradient descent with negative sampling, so a fixed seed
//! reproduces it exactly.

use crate::common::*;

use matrix_util::knn_graph::{KnnGraph, KnnGraphArgs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const SCALE_CLIP: f32 = 10.;
const GRADIENT_CLIP: f32 = 4.;
const INIT_RANGE: f32 = 10.;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    pub n_pcs: usize,
    pub umap_neighbours: usize,
    pub min_dist: f32,
    pub spread: f32,
    pub n_epochs: usize,
    pub negative_sample_rate: usize,
    pub learning_rate: f32,
    pub exact_knn_below: usize,
    pub seed: u64,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            n_pcs: 30,
            umap_neighbours: 30,
            min_dist: 0.3,
            spread: 1.,
            n_epochs: 200,
            negative_sample_rate: 5,
            learning_rate: 1.,
            exact_knn_below: matrix_util::knn_match::DEFAULT_EXACT_BELOW,
            seed: 42,
        }
    }
}

/// Per-cell coordinates, cells in rows
#[derive(Clone, Debug)]
pub struct Embeddings {
    /// cells x PCs
    pub pca: Mat,
    /// cells x 2
    pub umap: Mat,
}

/// PCA then layout of a features x cells matrix
pub fn reduce_dimensions(values: &Mat, cfg: &ReductionConfig) -> anyhow::Result<Embeddings> {
    let pca = principal_components(values, cfg.n_pcs, cfg.seed)?;
    let umap = layout_2d(&pca, cfg)?;
    Ok(Embeddings { pca, umap })
}

/// cells x `min(n_pcs, features, cells)` scores `V D` of the
/// standardized matrix
pub fn principal_components(values: &Mat, n_pcs: usize, seed: u64) -> anyhow::Result<Mat> {
    let (nf, nn) = (values.nrows(), values.ncols());
    let rank = n_pcs.min(nf).min(nn);
    if rank == 0 {
        anyhow::bail!("cannot take {} PCs of a [{} x {}] matrix", n_pcs, nf, nn);
    }

    let zz = values.scale_rows(Some(SCALE_CLIP));
    let (_, dd, vv) = zz.rsvd(rank, seed)?;

    info!(
        "[reduce] {} PCs of {} features x {} cells (top singular value {:.3})",
        dd.len(),
        nf,
        nn,
        dd.iter().copied().fold(0_f32, f32::max)
    );

    Ok(Mat::from_fn(nn, dd.len(), |j, k| vv[(j, k)] * dd[k]))
}

/// cells x 2 layout from cells x PCs
pub fn layout_2d(pcs: &Mat, cfg: &ReductionConfig) -> anyhow::Result<Mat> {
    let nn = pcs.nrows();
    let mut yy = initial_layout(pcs);
    if nn < 3 {
        return Ok(yy);
    }

    let knn = cfg.umap_neighbours.min(nn - 1).max(1);
    let graph = KnnGraph::from_columns(
        &pcs.transpose(),
        &KnnGraphArgs::new(
            knn,
            ColumnDictArgs {
                exact_below: cfg.exact_knn_below,
                seed: cfg.seed,
                ef_search: knn.max(256),
            },
        ),
    )?;
    let weights = graph.fuzzy_kernel_weights();
    let (a, b) = fit_curve(cfg.min_dist, cfg.spread);

    info!(
        "[reduce] layout over {} edges, a = {:.3}, b = {:.3}, {} epochs",
        graph.edges.len(),
        a,
        b,
        cfg.n_epochs
    );

    optimize_layout(&mut yy, &graph.edges, &weights, a, b, cfg);
    Ok(yy)
}

/// PC1 and PC2 each rescaled to `[0, 10]`
fn initial_layout(pcs: &Mat) -> Mat {
    let nn = pcs.nrows();
    let mut yy = Mat::zeros(nn, 2);
    for k in 0..pcs.ncols().min(2) {
        let col = pcs.column(k);
        let (lo, hi) = (col.min(), col.max());
        for j in 0..nn {
            yy[(j, k)] = if hi > lo {
                (col[j] - lo) / (hi - lo) * INIT_RANGE
            } else {
                0.
            };
        }
    }
    yy
}

/// Least-squares `a`, `b` of `1 / (1 + a d^(2b))` against the target
/// membership `1` for `d < min_dist`, `exp(-(d - min_dist) / spread)` above
pub fn fit_curve(min_dist: f32, spread: f32) -> (f32, f32) {
    let xs = (1..=300)
        .map(|i| i as f32 * 3. * spread / 300.)
        .collect::<Vec<_>>();
    let target = xs
        .iter()
        .map(|&x| {
            if x < min_dist {
                1.
            } else {
                (-(x - min_dist) / spread).exp()
            }
        })
        .collect::<Vec<_>>();

    let sse = |a: f32, b: f32| -> f32 {
        xs.iter()
            .zip(target.iter())
            .map(|(&x, &t)| {
                let f = 1. / (1. + a * x.powf(2. * b));
                (f - t) * (f - t)
            })
            .sum()
    };

    // coarse grid over log(a) and b, then shrinking local refinement
    let mut best = (f32::INFINITY, 1., 1.);
    for i in 0..=40 {
        let a = 10_f32.powf(-1. + 2. * i as f32 / 40.);
        for j in 0..=40 {
            let b = 0.2 + 1.8 * j as f32 / 40.;
            let e = sse(a, b);
            if e < best.0 {
                best = (e, a, b);
            }
        }
    }

    let (mut step_a, mut step_b) = (0.05_f32, 0.045_f32);
    for _ in 0..30 {
        let (_, a0, b0) = best;
        for da in [-1., 0., 1.] {
            for db in [-1., 0., 1.] {
                let a = a0 * (1. + da * step_a);
                let b = (b0 + db * step_b).max(0.05);
                let e = sse(a, b);
                if e < best.0 {
                    best = (e, a, b);
                }
            }
        }
        step_a *= 0.8;
        step_b *= 0.8;
    }
    (best.1, best.2)
}

fn optimize_layout(
    yy: &mut Mat,
    edges: &[(usize, usize)],
    weights: &[f32],
    a: f32,
    b: f32,
    cfg: &ReductionConfig,
) {
    let nn = yy.nrows();
    let n_epochs = cfg.n_epochs.max(1);
    let w_max = weights.iter().copied().fold(0_f32, f32::max);
    if w_max <= 0. {
        return;
    }

    // strong edges are sampled every epoch, weak ones less often
    let epochs_per_sample = weights
        .iter()
        .map(|&w| {
            if w * n_epochs as f32 / w_max >= 1. {
                w_max / w
            } else {
                -1.
            }
        })
        .collect::<Vec<f32>>();
    let neg_rate = cfg.negative_sample_rate.max(1) as f32;
    let epochs_per_negative = epochs_per_sample
        .iter()
        .map(|&e| e / neg_rate)
        .collect::<Vec<_>>();
    let mut next_sample = epochs_per_sample.clone();
    let mut next_negative = epochs_per_negative.clone();

    let mut rng = StdRng::seed_from_u64(cfg.seed);

    for epoch in 0..n_epochs {
        let alpha = cfg.learning_rate * (1. - epoch as f32 / n_epochs as f32);
        let now = epoch as f32;

        for (e, &(i, j)) in edges.iter().enumerate() {
            if epochs_per_sample[e] <= 0. || next_sample[e] > now {
                continue;
            }

            let d2 = sq_dist(yy, i, j);
            if d2 > 0. {
                let coef = -2. * a * b * d2.powf(b - 1.) / (a * d2.powf(b) + 1.);
                for k in 0..2 {
                    let g = (coef * (yy[(i, k)] - yy[(j, k)])).clamp(-GRADIENT_CLIP, GRADIENT_CLIP);
                    yy[(i, k)] += g * alpha;
                    yy[(j, k)] -= g * alpha;
                }
            }
            next_sample[e] += epochs_per_sample[e];

            let n_neg = ((now - next_negative[e]) / epochs_per_negative[e]).max(0.) as usize;
            for _ in 0..n_neg {
                let other = rng.random_range(0..nn);
                if other == i {
                    continue;
                }
                let d2 = sq_dist(yy, i, other);
                for k in 0..2 {
                    let g = if d2 > 0. {
                        let coef = 2. * b / ((0.001 + d2) * (a * d2.powf(b) + 1.));
                        (coef * (yy[(i, k)] - yy[(other, k)])).clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
                    } else {
                        GRADIENT_CLIP
                    };
                    yy[(i, k)] += g * alpha;
                }
            }
            next_negative[e] += n_neg as f32 * epochs_per_negative[e];
        }
    }
}

fn sq_dist(yy: &Mat, i: usize, j: usize) -> f32 {
    let dx = yy[(i, 0)] - yy[(j, 0)];
    let dy = yy[(i, 1)] - yy[(j, 1)];
    dx * dx + dy * dy
}
