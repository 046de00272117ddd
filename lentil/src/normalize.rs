//! Regularized negative binomial normalization, one sample at a time
//!
//! Each gene follows `y ~ NB(mu, theta)` with
//! `log mu = beta0 + beta1 log10(umi)`. The coefficients are fitted by
//! Poisson IRLS and `theta` by maximum likelihood on a subset of genes
//! spread over the range of gene means. All three are then smoothed
//! against log10 gene mean by Gaussian kernel regression, which yields
//! a model for every detected gene. Pearson residuals of this model
//! rank variable genes and feed integration; counts corrected to the
//! median sequencing depth feed cell-type prediction.

use crate::common::*;

use anyhow::Context;
use lentil_data::sparse_util::{column_sums, csc_from_columns};
use matrix_util::utils::median_f32;
use nalgebra_sparse::convert::serial::convert_csc_csr;
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use special::Gamma;
use std::collections::HashMap;

const MAX_LOG_MEAN: f32 = 40.;
const THETA_MIN: f64 = 1e-3;
const THETA_MAX: f64 = 1e5;
const IRLS_MAX_ITER: usize = 50;
const BISECTION_ITER: usize = 40;
/// exact digamma differences below this count, `special` above
const DIGAMMA_EXACT_BELOW: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// variable genes kept per sample
    pub n_hvg: usize,
    /// genes used to fit the unregularized model
    pub n_genes_fit: usize,
    /// genes need this many detecting cells to get a model
    pub min_cells: usize,
    /// samples with fewer cells cannot be normalized
    pub min_cells_sample: usize,
    /// multiplier of the kernel bandwidth
    pub bw_adjust: f32,
    /// residual clip (default `sqrt(n / 30)`)
    pub clip: Option<f32>,
    /// regress the mitochondrial fraction out of the residuals
    pub regress_mito: bool,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            n_hvg: 3000,
            n_genes_fit: 2000,
            min_cells: 5,
            min_cells_sample: 20,
            bw_adjust: 3.,
            clip: None,
            regress_mito: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeneModel {
    pub beta0: f32,
    pub beta1: f32,
    pub theta: f32,
}

impl GeneModel {
    pub fn mean(&self, log10_umi: f32) -> f32 {
        (self.beta0 + self.beta1 * log10_umi).min(MAX_LOG_MEAN).exp()
    }

    pub fn sd(&self, mu: f32) -> f32 {
        (mu + mu * mu / self.theta).sqrt().max(1e-8)
    }
}

/// Fitted models of one sample plus what is needed to produce
/// residuals for any gene on demand
pub struct SampleNormalization {
    name: Box<str>,
    genes: Vec<Box<str>>,
    gene_index: HashMap<Box<str>, usize>,
    cells: Vec<Box<str>>,
    counts: CsrMatrix<f32>,
    log10_umi: Vec<f32>,
    mito: Vec<f32>,
    models: Vec<Option<GeneModel>>,
    clip: f32,
    regress_mito: bool,
    hvg: Vec<usize>,
    corrected: CscMat,
}

impl SampleNormalization {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn genes(&self) -> &[Box<str>] {
        &self.genes
    }

    pub fn cells(&self) -> &[Box<str>] {
        &self.cells
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn model(&self, gene: &str) -> Option<GeneModel> {
        self.gene_index.get(gene).and_then(|&i| self.models[i])
    }

    /// variable genes, most variable first
    pub fn hvg_names(&self) -> Vec<Box<str>> {
        self.hvg.iter().map(|&i| self.genes[i].clone()).collect()
    }

    /// `log1p` of the depth-corrected counts, genes x cells
    pub fn corrected_log_counts(&self) -> &CscMat {
        &self.corrected
    }

    /// Pearson residuals of `features` x cells; rows of genes without
    /// a model, or absent from this sample, are zero
    pub fn residuals(&self, features: &[Box<str>]) -> Mat {
        let nn = self.num_cells();
        let rows = features
            .par_iter()
            .map(|f| match self.gene_index.get(f) {
                Some(&i) => self.residual_row(i),
                None => vec![0.; nn],
            })
            .collect::<Vec<_>>();
        Mat::from_fn(features.len(), nn, |r, j| rows[r][j])
    }

    fn dense_row(&self, i: usize) -> Vec<f32> {
        let mut y = vec![0_f32; self.num_cells()];
        let row = self.counts.row(i);
        for (&j, &x) in row.col_indices().iter().zip(row.values()) {
            y[j] = x;
        }
        y
    }

    fn residual_row(&self, i: usize) -> Vec<f32> {
        let Some(model) = self.models[i] else {
            return vec![0.; self.num_cells()];
        };

        let mut resid = self
            .dense_row(i)
            .iter()
            .zip(self.log10_umi.iter())
            .map(|(&y, &x)| {
                let mu = model.mean(x);
                ((y - mu) / model.sd(mu)).clamp(-self.clip, self.clip)
            })
            .collect::<Vec<_>>();

        if self.regress_mito {
            regress_out(&mut resid, &self.mito);
        }
        resid
    }

    /// counts re-generated at the median depth, `log1p` transformed
    fn correct_counts(&mut self) -> anyhow::Result<()> {
        let median_log10_umi = median_f32(&self.log10_umi);
        let nn = self.num_cells();

        let per_gene = (0..self.genes.len())
            .into_par_iter()
            .map(|i| {
                let y = self.dense_row(i);
                match self.models[i] {
                    Some(model) => {
                        let mu_med = model.mean(median_log10_umi);
                        let sd_med = model.sd(mu_med);
                        (0..nn)
                            .filter_map(|j| {
                                let mu = model.mean(self.log10_umi[j]);
                                let r = ((y[j] - mu) / model.sd(mu)).clamp(-self.clip, self.clip);
                                let v = (mu_med + r * sd_med).max(0.).round();
                                (v > 0.).then(|| (j, v.ln_1p()))
                            })
                            .collect::<Vec<_>>()
                    }
                    None => (0..nn)
                        .filter(|&j| y[j] > 0.)
                        .map(|j| (j, y[j].ln_1p()))
                        .collect(),
                }
            })
            .collect::<Vec<_>>();

        let mut columns = vec![vec![]; nn];
        for (i, entries) in per_gene.into_iter().enumerate() {
            for (j, v) in entries {
                columns[j].push((i, v));
            }
        }
        self.corrected = csc_from_columns(self.genes.len(), columns)?;
        Ok(())
    }
}

fn insufficient(sample: &Sample, reason: String) -> anyhow::Error {
    PipelineError::InsufficientData {
        stage: "normalize",
        sample: sample.name().into(),
        reason,
    }
    .into()
}

/// Fit one sample
pub fn normalize_sample(sample: &Sample, cfg: &NormalizeConfig) -> anyhow::Result<SampleNormalization> {
    let nn = sample.num_cells();
    if nn < cfg.min_cells_sample.max(2) {
        return Err(insufficient(
            sample,
            format!("{} cells < {}", nn, cfg.min_cells_sample.max(2)),
        ));
    }

    let counts = convert_csc_csr(sample.counts());
    let umi = column_sums(sample.counts());
    let log10_umi = umi.iter().map(|&u| u.max(1.).log10()).collect::<Vec<_>>();

    let gene_stats = counts
        .row_iter()
        .map(|row| {
            let detected = row.values().iter().filter(|&&x| x > 0.).count();
            let mean = row.values().iter().sum::<f32>() / nn as f32;
            (detected, mean)
        })
        .collect::<Vec<_>>();

    let model_genes = (0..sample.num_genes())
        .filter(|&i| gene_stats[i].0 >= cfg.min_cells)
        .collect::<Vec<_>>();
    if model_genes.len() < 2 {
        return Err(insufficient(
            sample,
            format!(
                "{} genes detected in >= {} cells",
                model_genes.len(),
                cfg.min_cells
            ),
        ));
    }

    let log10_mean = gene_stats
        .iter()
        .map(|&(_, m)| m.max(1e-10).log10())
        .collect::<Vec<_>>();

    // evenly spaced over the sorted gene means
    let mut by_mean = model_genes.clone();
    by_mean.sort_by(|&a, &b| log10_mean[a].total_cmp(&log10_mean[b]).then(a.cmp(&b)));
    let fit_genes = spread_evenly(&by_mean, cfg.n_genes_fit.max(2));

    let fitted = fit_genes
        .par_iter()
        .map(|&i| {
            let row = counts.row(i);
            let mut y = vec![0_f32; nn];
            for (&j, &x) in row.col_indices().iter().zip(row.values()) {
                y[j] = x;
            }
            fit_gene(&y, &umi, &log10_umi)
        })
        .collect::<Vec<_>>();

    let xx = fit_genes.iter().map(|&i| log10_mean[i]).collect::<Vec<_>>();
    let bw = cfg.bw_adjust * bandwidth_nrd0(&xx);
    let beta0 = fitted.iter().map(|m| m.beta0).collect::<Vec<_>>();
    let beta1 = fitted.iter().map(|m| m.beta1).collect::<Vec<_>>();
    let log_theta = fitted.iter().map(|m| m.theta.log10()).collect::<Vec<_>>();

    let mut models = vec![None; sample.num_genes()];
    for &i in model_genes.iter() {
        let x0 = log10_mean[i];
        models[i] = Some(GeneModel {
            beta0: kernel_regression(x0, &xx, &beta0, bw),
            beta1: kernel_regression(x0, &xx, &beta1, bw),
            theta: 10_f32.powf(kernel_regression(x0, &xx, &log_theta, bw)),
        });
    }

    let genes = sample.genes().to_vec();
    let gene_index = genes
        .iter()
        .enumerate()
        .map(|(i, g)| (g.clone(), i))
        .collect::<HashMap<_, _>>();

    let mut ret = SampleNormalization {
        name: sample.name().into(),
        genes,
        gene_index,
        cells: sample.cells().to_vec(),
        counts,
        log10_umi,
        mito: sample.qc().iter().map(|qc| qc.mito_fraction).collect(),
        models,
        clip: cfg.clip.unwrap_or((nn as f32 / 30.).sqrt()),
        regress_mito: cfg.regress_mito,
        hvg: vec![],
        corrected: CscMat::zeros(0, 0),
    };

    // residual variance ranks the variable genes
    let mut variances = model_genes
        .par_iter()
        .map(|&i| {
            let r = ret.residual_row(i);
            let mu = r.iter().sum::<f32>() / nn as f32;
            let var = r.iter().map(|x| (x - mu) * (x - mu)).sum::<f32>() / (nn - 1) as f32;
            (i, var)
        })
        .collect::<Vec<_>>();
    variances.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    variances.truncate(cfg.n_hvg);
    ret.hvg = variances.into_iter().map(|(i, _)| i).collect();

    ret.correct_counts()?;

    info!(
        "[normalize] {}: {} cells, {} models ({} fitted, bandwidth {:.3}), {} variable genes",
        ret.name,
        nn,
        model_genes.len(),
        fit_genes.len(),
        bw,
        ret.hvg.len()
    );

    Ok(ret)
}

/// Fit every sample in parallel; any failure aborts the stage
pub fn normalize_samples(
    samples: &[Sample],
    cfg: &NormalizeConfig,
) -> anyhow::Result<Vec<SampleNormalization>> {
    samples
        .par_iter()
        .progress_count(samples.len() as u64)
        .map(|s| {
            normalize_sample(s, cfg).with_context(|| {
                format!(
                    "[normalize] sample {} (min_cells {}, min_cells_sample {}, n_genes_fit {})",
                    s.name(),
                    cfg.min_cells,
                    cfg.min_cells_sample,
                    cfg.n_genes_fit
                )
            })
        })
        .collect()
}

/// at most `n` elements of `sorted`, evenly spaced, ends included
fn spread_evenly(sorted: &[usize], n: usize) -> Vec<usize> {
    if sorted.len() <= n {
        return sorted.to_vec();
    }
    let last = sorted.len() - 1;
    let mut ret = (0..n)
        .map(|k| sorted[(k * last + (n - 1) / 2) / (n - 1)])
        .collect::<Vec<_>>();
    ret.dedup();
    ret
}

/// Poisson IRLS for the coefficients, then maximum likelihood `theta`
fn fit_gene(y: &[f32], umi: &[f32], log10_umi: &[f32]) -> GeneModel {
    let nn = y.len();
    let sum_y = y.iter().map(|&v| v as f64).sum::<f64>();
    let sum_umi = umi.iter().map(|&v| v.max(1.) as f64).sum::<f64>();

    let mut b0 = (sum_y.max(1e-3) / sum_umi).ln();
    let mut b1 = std::f64::consts::LN_10;

    for _ in 0..IRLS_MAX_ITER {
        let (mut s_w, mut s_wx, mut s_wxx, mut s_wz, mut s_wxz) = (0., 0., 0., 0., 0.);
        for j in 0..nn {
            let x = log10_umi[j] as f64;
            let eta = (b0 + b1 * x).min(MAX_LOG_MEAN as f64);
            let mu = eta.exp().max(1e-10);
            let z = eta + (y[j] as f64 - mu) / mu;
            s_w += mu;
            s_wx += mu * x;
            s_wxx += mu * x * x;
            s_wz += mu * z;
            s_wxz += mu * x * z;
        }
        let det = s_w * s_wxx - s_wx * s_wx;
        if det.abs() < 1e-12 {
            break;
        }
        let new_b0 = (s_wxx * s_wz - s_wx * s_wxz) / det;
        let new_b1 = (s_w * s_wxz - s_wx * s_wz) / det;
        let delta = (new_b0 - b0).abs().max((new_b1 - b1).abs());
        b0 = new_b0;
        b1 = new_b1;
        if delta < 1e-6 {
            break;
        }
    }

    let mu = log10_umi
        .iter()
        .map(|&x| (b0 + b1 * x as f64).min(MAX_LOG_MEAN as f64).exp())
        .collect::<Vec<_>>();

    GeneModel {
        beta0: b0 as f32,
        beta1: b1 as f32,
        theta: estimate_theta(y, &mu) as f32,
    }
}

/// Bisection on `log(theta)` for the root of the NB score
fn estimate_theta(y: &[f32], mu: &[f64]) -> f64 {
    let counts = y.iter().map(|&v| v.max(0.).round() as usize).collect::<Vec<_>>();
    let max_y = counts.iter().copied().max().unwrap_or(0);

    // cells with y > k, for the exact part of the digamma sums
    let kk = max_y.min(DIGAMMA_EXACT_BELOW);
    let mut tail = vec![0_f64; kk + 1];
    for &c in counts.iter() {
        tail[c.min(kk)] += 1.;
    }
    for k in (0..kk).rev() {
        tail[k] += tail[k + 1];
    }
    let large = counts
        .iter()
        .copied()
        .filter(|&c| c > kk)
        .collect::<Vec<_>>();

    let score = |theta: f64| -> f64 {
        // sum_j digamma(y_j + theta) - digamma(theta)
        let mut s = (0..kk).map(|k| tail[k + 1] / (theta + k as f64)).sum::<f64>();
        for &c in large.iter() {
            s += (c as f64 + theta).digamma() - (theta + kk as f64).digamma();
        }
        for (&c, &m) in counts.iter().zip(mu) {
            s += theta.ln() + 1. - (theta + m).ln() - (c as f64 + theta) / (theta + m);
        }
        s
    };

    let (mut lo, mut hi) = (THETA_MIN.ln(), THETA_MAX.ln());
    if score(hi.exp()) > 0. {
        return THETA_MAX;
    }
    if score(lo.exp()) < 0. {
        return THETA_MIN;
    }
    for _ in 0..BISECTION_ITER {
        let mid = 0.5 * (lo + hi);
        if score(mid.exp()) > 0. {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (0.5 * (lo + hi)).exp()
}

/// Silverman's rule of thumb (R's `bw.nrd0`)
fn bandwidth_nrd0(xx: &[f32]) -> f32 {
    let nn = xx.len();
    if nn < 2 {
        return 1.;
    }
    let mu = xx.iter().sum::<f32>() / nn as f32;
    let sd = (xx.iter().map(|x| (x - mu) * (x - mu)).sum::<f32>() / (nn - 1) as f32).sqrt();
    let iqr = matrix_util::utils::quantile_f32(xx, 0.75) - matrix_util::utils::quantile_f32(xx, 0.25);

    let mut lo = sd.min(iqr / 1.34);
    if lo <= 0. {
        lo = if sd > 0. {
            sd
        } else if mu.abs() > 0. {
            mu.abs()
        } else {
            1.
        };
    }
    0.9 * lo * (nn as f32).powf(-0.2)
}

/// Nadaraya-Watson estimate at `x0` with a Gaussian kernel
fn kernel_regression(x0: f32, xx: &[f32], yy: &[f32], bw: f32) -> f32 {
    let (mut num, mut den) = (0_f64, 0_f64);
    for (&x, &y) in xx.iter().zip(yy) {
        let u = ((x - x0) / bw) as f64;
        let k = (-0.5 * u * u).exp();
        num += k * y as f64;
        den += k;
    }
    if den > 0. {
        (num / den) as f32
    } else {
        // far outside the fitted range: nearest fitted gene
        xx.iter()
            .zip(yy)
            .min_by(|a, b| (a.0 - x0).abs().total_cmp(&(b.0 - x0).abs()))
            .map(|(_, &y)| y)
            .unwrap_or(0.)
    }
}

/// Replace `r` by the residuals of its OLS fit on `covar`
fn regress_out(r: &mut [f32], covar: &[f32]) {
    let nn = r.len() as f32;
    let r_bar = r.iter().sum::<f32>() / nn;
    let c_bar = covar.iter().sum::<f32>() / nn;
    let sxx = covar.iter().map(|c| (c - c_bar) * (c - c_bar)).sum::<f32>();
    let sxy = covar
        .iter()
        .zip(r.iter())
        .map(|(c, y)| (c - c_bar) * (y - r_bar))
        .sum::<f32>();
    let slope = if sxx > 1e-12 { sxy / sxx } else { 0. };
    for (y, c) in r.iter_mut().zip(covar) {
        *y -= r_bar + slope * (c - c_bar);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn poisson_fit_recovers_depth_scaling() {
        // y = umi / 100 exactly
        let umi = (1..=200).map(|j| 1000. + 20. * j as f32).collect::<Vec<_>>();
        let log10_umi = umi.iter().map(|u| u.log10()).collect::<Vec<_>>();
        let y = umi.iter().map(|u| u / 100.).collect::<Vec<_>>();
        let model = fit_gene(&y, &umi, &log10_umi);
        assert_abs_diff_eq!(model.beta1, std::f32::consts::LN_10, epsilon = 1e-3);
        assert_abs_diff_eq!(model.mean(log10_umi[10]), y[10], epsilon = 1e-2);
    }

    #[test]
    fn theta_reflects_overdispersion() {
        let mu = vec![5_f64; 400];
        // Poisson-like: tiny variance around the mean
        let flat = (0..400).map(|j| (4 + j % 3) as f32).collect::<Vec<_>>();
        // very overdispersed: mostly zeros, a few large counts
        let bursty = (0..400).map(|j| if j % 10 == 0 { 50. } else { 0. }).collect::<Vec<_>>();
        let t_flat = estimate_theta(&flat, &mu);
        let t_bursty = estimate_theta(&bursty, &mu);
        assert!(t_flat > 100.);
        assert!(t_bursty < 1.);
    }

    #[test]
    fn regress_out_removes_linear_trend() {
        let covar = (0..50).map(|j| j as f32 / 50.).collect::<Vec<_>>();
        let mut r = covar.iter().map(|c| 3. * c + 1.).collect::<Vec<_>>();
        regress_out(&mut r, &covar);
        for x in r {
            assert_abs_diff_eq!(x, 0., epsilon = 1e-4);
        }
    }

    #[test]
    fn even_spread_keeps_ends() {
        let sorted = (0..100).collect::<Vec<_>>();
        let picked = spread_evenly(&sorted, 5);
        assert_eq!(picked.first(), Some(&0));
        assert_eq!(picked.last(), Some(&99));
        assert_eq!(picked.len(), 5);
    }
}
