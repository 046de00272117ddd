//! Doublet detection by simulation
//!
//! Artificial doublets are formed by adding the raw counts of two real
//! cells drawn from different clusters. Real and artificial cells share
//! one PCA space, and a real cell's score grows with the number of
//! artificial doublets among its nearest neighbours.

use crate::common::*;

use anyhow::Context;
use lentil_data::sample::{DoubletCall, DoubletClass};
use lentil_data::sparse_util::column_sums;
use matrix_util::clustering::{Kmeans, KmeansArgs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const LIBRARY_SCALE: f32 = 1e4;
const SCALE_CLIP: f32 = 10.;
const RATE_TOLERANCE: f32 = 0.3;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DoubletConfig {
    pub seed: u64,
    /// below this many cells every cell is called a singlet
    pub min_cells: usize,
    pub n_hvg: usize,
    pub n_pcs: usize,
    /// artificial doublets per real cell
    pub sim_ratio: f32,
    /// neighbours per cell (0: `clamp(0.5 sqrt(n), 5, 50)`)
    pub knn: usize,
    /// clusters to draw doublet parents from (0: `clamp(sqrt(n) / 3, 2, 12)`)
    pub n_clusters: usize,
    /// expected doublet fraction (default: 1% per thousand cells)
    pub expected_rate: Option<f32>,
}

impl Default for DoubletConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            min_cells: 50,
            n_hvg: 1000,
            n_pcs: 20,
            sim_ratio: 1.0,
            knn: 0,
            n_clusters: 0,
            expected_rate: None,
        }
    }
}

impl DoubletConfig {
    pub fn expected_rate(&self, ncells: usize) -> f32 {
        self.expected_rate
            .unwrap_or(0.01 * ncells as f32 / 1000.)
            .clamp(0.005, 0.3)
    }

    fn num_neighbours(&self, ncells: usize) -> usize {
        if self.knn > 0 {
            self.knn
        } else {
            ((0.5 * (ncells as f32).sqrt()).round() as usize).clamp(5, 50)
        }
    }

    fn num_clusters(&self, ncells: usize) -> usize {
        if self.n_clusters > 0 {
            self.n_clusters
        } else {
            (((ncells as f32).sqrt() / 3.).round() as usize).clamp(2, 12)
        }
    }
}

#[derive(Clone, Debug)]
pub struct DoubletResult {
    /// one call per input cell
    pub calls: Vec<DoubletCall>,
    pub threshold: f32,
    pub expected_rate: f32,
    pub n_simulated: usize,
    /// true if the sample was too small to score
    pub degraded: bool,
}

impl DoubletResult {
    fn all_singlets(ncells: usize, expected_rate: f32) -> Self {
        Self {
            calls: vec![DoubletCall::singlet(0.); ncells],
            threshold: f32::INFINITY,
            expected_rate,
            n_simulated: 0,
            degraded: true,
        }
    }

    pub fn num_doublets(&self) -> usize {
        self.calls.iter().filter(|c| c.is_doublet()).count()
    }

    /// barcodes of the cells called doublets
    pub fn flagged<'a>(&self, cells: &'a [Box<str>]) -> Vec<&'a Box<str>> {
        cells
            .iter()
            .zip(self.calls.iter())
            .filter(|(_, c)| c.is_doublet())
            .map(|(x, _)| x)
            .collect()
    }
}

/// Score every cell of a sample and call doublets.
///
/// Deterministic given `cfg.seed`. Samples with too few cells, too few
/// variable genes or a rank-deficient PCA are not scored: every cell is
/// called a singlet with score 0 and a warning is logged.
pub fn score_doublets(sample: &Sample, cfg: &DoubletConfig) -> anyhow::Result<DoubletResult> {
    let nn = sample.num_cells();
    let rate = cfg.expected_rate(nn);

    let degrade = |reason: String| -> anyhow::Result<DoubletResult> {
        warn!(
            "[doublet] {}: {}; calling all {} cells singlets",
            sample.name(),
            reason,
            nn
        );
        Ok(DoubletResult::all_singlets(nn, rate))
    };

    if nn < cfg.min_cells.max(3) {
        return degrade(format!("{} cells < {}", nn, cfg.min_cells.max(3)));
    }

    let counts = sample.counts();
    let totals = column_sums(counts);
    let hvg = top_variable_genes(counts, &totals, cfg.n_hvg);
    if hvg.len() < 2 {
        return degrade(format!("{} variable genes", hvg.len()));
    }

    let scaling = GeneScaling::fit(counts, &totals, &hvg);
    let zz = scaling.standardize_columns(counts, &totals);

    let rank = cfg.n_pcs.min(hvg.len()).min(nn);
    if rank < 2 {
        return degrade(format!("only {} principal components", rank));
    }
    let (uu, dd, _) = zz.rsvd(rank, cfg.seed)?;
    if dd.len() < 2 || dd[1] <= 0. {
        return degrade("fewer than two non-zero principal components".into());
    }
    let pcs = uu.tr_mul(&zz);

    let kk = cfg.num_clusters(nn).min(nn);
    let membership = pcs.kmeans_columns(KmeansArgs {
        num_clusters: kk,
        max_iter: 100,
        seed: cfg.seed,
    });

    // artificial doublets projected onto the real cells' loadings
    let n_sim = ((cfg.sim_ratio * nn as f32).round() as usize).max(1);
    let parents = draw_parent_pairs(&membership, n_sim, cfg.seed);
    let sim_pcs = uu.tr_mul(&scaling.standardize_pairs(counts, &totals, &parents));

    let mut points = Mat::zeros(pcs.nrows(), nn + n_sim);
    points.columns_mut(0, nn).copy_from(&pcs);
    points.columns_mut(nn, n_sim).copy_from(&sim_pcs);

    let ratio = n_sim as f32 / nn as f32;
    let knn = cfg.num_neighbours(nn);
    let k_adj = ((knn as f32 * (1. + ratio)).round() as usize).clamp(1, nn + n_sim - 1);

    let dict = ColumnDict::from_dmatrix_columns(
        &points,
        (0..(nn + n_sim)).collect::<Vec<usize>>(),
        &ColumnDictArgs {
            exact_below: usize::MAX,
            ..Default::default()
        },
    )?;

    let scores = dict
        .search_all_others(k_adj)
        .into_iter()
        .map(|(neighbours, _)| {
            let n_sim_neigh = neighbours.iter().filter(|&&j| j >= nn).count();
            doublet_score(n_sim_neigh, k_adj, rate, ratio)
        })
        .collect::<Vec<_>>();

    let (real, simulated) = scores.split_at(nn);
    let threshold = choose_threshold(real, simulated, rate);

    let calls = real
        .iter()
        .map(|&score| DoubletCall {
            class: if score > threshold {
                DoubletClass::Doublet
            } else {
                DoubletClass::Singlet
            },
            score,
        })
        .collect::<Vec<_>>();

    let result = DoubletResult {
        calls,
        threshold,
        expected_rate: rate,
        n_simulated: n_sim,
        degraded: false,
    };

    info!(
        "[doublet] {}: {} of {} cells called doublets (threshold {:.4}, expected rate {:.4}, {} simulated, k = {})",
        sample.name(),
        result.num_doublets(),
        nn,
        threshold,
        rate,
        n_sim,
        k_adj
    );

    Ok(result)
}

/// Score and drop doublets; the returned sample carries no doublet
/// and the result keeps the calls of every input cell
pub fn remove_doublets(sample: &Sample, cfg: &DoubletConfig) -> anyhow::Result<(Sample, DoubletResult)> {
    let result = score_doublets(sample, cfg).with_context(|| {
        format!(
            "[doublet] sample {} (seed {}, n_hvg {}, n_pcs {})",
            sample.name(),
            cfg.seed,
            cfg.n_hvg,
            cfg.n_pcs
        )
    })?;

    let keep = result
        .calls
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.is_doublet())
        .map(|(j, _)| j)
        .collect::<Vec<_>>();

    let annotated = sample.clone().with_doublet_calls(result.calls.clone())?;
    Ok((annotated.select_cells(&keep)?, result))
}

/// `q rho / r / (1 - rho - q (1 - rho - rho / r))` with
/// `q = (n_sim + 1) / (k + 2)`
fn doublet_score(n_sim_neigh: usize, knn: usize, rate: f32, ratio: f32) -> f32 {
    let q = (n_sim_neigh as f32 + 1.) / (knn as f32 + 2.);
    q * rate / ratio / (1. - rate - q * (1. - rate - rate / ratio))
}

/// Minimize `FNR(simulated) + dev^2` over the observed scores, where
/// `dev` is the relative excess of the called fraction beyond the
/// tolerance band around the expected rate
fn choose_threshold(real: &[f32], simulated: &[f32], rate: f32) -> f32 {
    let mut real_sorted = real.to_vec();
    real_sorted.sort_by(|a, b| a.total_cmp(b));
    let mut sim_sorted = simulated.to_vec();
    sim_sorted.sort_by(|a, b| a.total_cmp(b));

    let mut candidates = real_sorted.clone();
    candidates.dedup();

    let nn = real_sorted.len().max(1) as f32;
    let mm = sim_sorted.len().max(1) as f32;

    let mut best = (f32::INFINITY, f32::INFINITY);
    for &t in candidates.iter() {
        let called = (real_sorted.len() - real_sorted.partition_point(|&s| s <= t)) as f32 / nn;
        let fnr = sim_sorted.partition_point(|&s| s <= t) as f32 / mm;
        let dev = ((called - rate).abs() / rate - RATE_TOLERANCE).max(0.);
        let cost = fnr + dev * dev;
        if cost < best.0 {
            best = (cost, t);
        }
    }
    best.1
}

/// Indices of the `n_hvg` genes with the largest variance of
/// `log1p(count / total * 1e4)`, excluding constant genes
fn top_variable_genes(counts: &CscMat, totals: &[f32], n_hvg: usize) -> Vec<usize> {
    let nn = counts.ncols() as f32;
    let mut sum = vec![0_f32; counts.nrows()];
    let mut sum_sq = vec![0_f32; counts.nrows()];

    for (col, &tot) in counts.col_iter().zip(totals) {
        for (&i, &x) in col.row_indices().iter().zip(col.values()) {
            let v = log_normalize(x, tot);
            sum[i] += v;
            sum_sq[i] += v * v;
        }
    }

    let mut genes = (0..counts.nrows())
        .map(|i| {
            let mu = sum[i] / nn;
            (i, sum_sq[i] / nn - mu * mu)
        })
        .filter(|&(_, v)| v > 1e-8)
        .collect::<Vec<_>>();

    genes.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    genes.truncate(n_hvg);
    genes.into_iter().map(|(i, _)| i).collect()
}

fn log_normalize(x: f32, total: f32) -> f32 {
    if total > 0. {
        (x / total * LIBRARY_SCALE).ln_1p()
    } else {
        0.
    }
}

/// Mean and standard deviation of the selected genes on real cells
struct GeneScaling {
    /// gene index -> row in the reduced matrix
    position: Vec<Option<usize>>,
    mean: Vec<f32>,
    sd: Vec<f32>,
}

impl GeneScaling {
    fn fit(counts: &CscMat, totals: &[f32], genes: &[usize]) -> Self {
        let mut position = vec![None; counts.nrows()];
        for (r, &g) in genes.iter().enumerate() {
            position[g] = Some(r);
        }

        let hh = genes.len();
        let nn = counts.ncols();
        let mut sum = vec![0_f32; hh];
        let mut sum_sq = vec![0_f32; hh];
        for (col, &tot) in counts.col_iter().zip(totals) {
            for (&i, &x) in col.row_indices().iter().zip(col.values()) {
                if let Some(r) = position[i] {
                    let v = log_normalize(x, tot);
                    sum[r] += v;
                    sum_sq[r] += v * v;
                }
            }
        }

        let mean = sum.iter().map(|s| s / nn as f32).collect::<Vec<_>>();
        let sd = (0..hh)
            .map(|r| {
                let var = (sum_sq[r] - nn as f32 * mean[r] * mean[r]) / (nn.max(2) - 1) as f32;
                let sd = var.max(0.).sqrt();
                if sd > 0. {
                    sd
                } else {
                    1.
                }
            })
            .collect();

        Self { position, mean, sd }
    }

    fn num_genes(&self) -> usize {
        self.mean.len()
    }

    fn standardize_into(&self, xx: &mut Mat, j: usize, entries: &[(usize, f32)], total: f32) {
        let mut x_j = xx.column_mut(j);
        for r in 0..self.num_genes() {
            x_j[r] = 0.;
        }
        for &(i, x) in entries {
            if let Some(r) = self.position[i] {
                x_j[r] += x;
            }
        }
        for r in 0..self.num_genes() {
            let v = log_normalize(x_j[r], total);
            x_j[r] = ((v - self.mean[r]) / self.sd[r]).clamp(-SCALE_CLIP, SCALE_CLIP);
        }
    }

    /// selected genes x cells, standardized
    fn standardize_columns(&self, counts: &CscMat, totals: &[f32]) -> Mat {
        let mut ret = Mat::zeros(self.num_genes(), counts.ncols());
        for (j, col) in counts.col_iter().enumerate() {
            let entries = col
                .row_indices()
                .iter()
                .copied()
                .zip(col.values().iter().copied())
                .collect::<Vec<_>>();
            self.standardize_into(&mut ret, j, &entries, totals[j]);
        }
        ret
    }

    /// summed raw counts of each pair, normalized by the summed library size
    fn standardize_pairs(&self, counts: &CscMat, totals: &[f32], pairs: &[(usize, usize)]) -> Mat {
        let mut ret = Mat::zeros(self.num_genes(), pairs.len());
        for (s, &(a, b)) in pairs.iter().enumerate() {
            let mut entries = vec![];
            for j in [a, b] {
                let col = counts.col(j);
                entries.extend(col.row_indices().iter().copied().zip(col.values().iter().copied()));
            }
            self.standardize_into(&mut ret, s, &entries, totals[a] + totals[b]);
        }
        ret
    }
}

/// Parent cells of each artificial doublet, from different clusters
/// whenever there is more than one cluster
fn draw_parent_pairs(membership: &[usize], n_sim: usize, seed: u64) -> Vec<(usize, usize)> {
    let nn = membership.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let multi = membership.iter().any(|&k| k != membership[0]);

    (0..n_sim)
        .map(|_| {
            let a = rng.random_range(0..nn);
            let mut b = rng.random_range(0..nn);
            while b == a || (multi && membership[a] == membership[b]) {
                b = rng.random_range(0..nn);
            }
            (a, b)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_increases_with_simulated_neighbours() {
        let s0 = doublet_score(0, 20, 0.05, 1.0);
        let s1 = doublet_score(10, 20, 0.05, 1.0);
        let s2 = doublet_score(20, 20, 0.05, 1.0);
        assert!(s0 < s1 && s1 < s2);
        assert!(s0 > 0.);
    }

    #[test]
    fn threshold_follows_simulated_scores() {
        let mut real = vec![0.01_f32; 95];
        real.extend(vec![0.9_f32; 5]);
        let t = choose_threshold(&real, &[0.9_f32; 100], 0.05);
        assert_eq!(real.iter().filter(|&&s| s > t).count(), 5);
    }

    #[test]
    fn threshold_penalizes_over_calling() {
        let mut real = vec![0.01_f32; 80];
        real.extend(vec![0.5_f32; 20]);
        let t = choose_threshold(&real, &[0.9_f32; 100], 0.05);
        assert_eq!(real.iter().filter(|&&s| s > t).count(), 0);
    }

    #[test]
    fn parents_come_from_different_clusters() {
        let membership = (0..40).map(|j| j % 3).collect::<Vec<_>>();
        let pairs = draw_parent_pairs(&membership, 100, 1);
        assert!(pairs.iter().all(|&(a, b)| membership[a] != membership[b]));
        assert_eq!(pairs, draw_parent_pairs(&membership, 100, 1));
    }
}
