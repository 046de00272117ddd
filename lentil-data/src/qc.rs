use crate::sample::{CellQc, Sample};
use crate::sparse_util::CscMat;
use log::info;
use serde::{Deserialize, Serialize};

/// Gene-name prefixes that mark mitochondrial genes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MitoPattern {
    pub prefixes: Vec<Box<str>>,
}

impl Default for MitoPattern {
    fn default() -> Self {
        Self {
            prefixes: vec!["MT-".into(), "mt-".into()],
        }
    }
}

impl MitoPattern {
    pub fn matches(&self, gene: &str) -> bool {
        self.prefixes.iter().any(|p| gene.starts_with(&**p))
    }
}

/// Compute detected genes, total counts and mitochondrial fraction
/// for every column of `counts`
pub fn compute_cell_qc(counts: &CscMat, genes: &[Box<str>], mito: &MitoPattern) -> Vec<CellQc> {
    let is_mito = genes.iter().map(|g| mito.matches(g)).collect::<Vec<_>>();

    counts
        .col_iter()
        .map(|col| {
            let mut total = 0_f32;
            let mut mt = 0_f32;
            let mut n_genes = 0;
            for (&i, &x) in col.row_indices().iter().zip(col.values()) {
                if x > 0. {
                    n_genes += 1;
                }
                total += x;
                if is_mito[i] {
                    mt += x;
                }
            }
            CellQc {
                n_genes,
                total_counts: total,
                mito_fraction: if total > 0. { mt / total } else { 0. },
            }
        })
        .collect()
}

/// Fixed per-cell thresholds; every bound is exclusive
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcThresholds {
    pub min_genes: usize,
    pub max_genes: usize,
    pub max_total_counts: f32,
    pub max_mito_fraction: f32,
}

impl Default for QcThresholds {
    fn default() -> Self {
        Self {
            min_genes: 200,
            max_genes: 5000,
            max_total_counts: 20000.,
            max_mito_fraction: 0.25,
        }
    }
}

impl QcThresholds {
    pub fn passes(&self, qc: &CellQc) -> bool {
        qc.n_genes > self.min_genes
            && qc.n_genes < self.max_genes
            && qc.total_counts < self.max_total_counts
            && qc.mito_fraction < self.max_mito_fraction
    }
}

/// Remove cells failing the thresholds, along with any cell already
/// called a doublet
pub fn quality_filter(sample: &Sample, thresholds: &QcThresholds) -> anyhow::Result<Sample> {
    let doublets = sample.doublet_calls();
    let keep = sample
        .qc()
        .iter()
        .enumerate()
        .filter(|&(j, qc)| {
            let doublet = doublets.map(|calls| calls[j].is_doublet()).unwrap_or(false);
            !doublet && thresholds.passes(qc)
        })
        .map(|(j, _)| j)
        .collect::<Vec<_>>();

    info!(
        "[qc] {}: kept {} of {} cells ({} < genes < {}, counts < {}, mito < {})",
        sample.name(),
        keep.len(),
        sample.num_cells(),
        thresholds.min_genes,
        thresholds.max_genes,
        thresholds.max_total_counts,
        thresholds.max_mito_fraction
    );

    sample.select_cells(&keep)
}
