use crate::error::PipelineError;
use crate::qc::QcThresholds;
use crate::sample::{CellQc, DoubletCall, Sample};
use crate::sparse_util::*;

use log::{info, warn};
use std::collections::HashMap;

/// Cell annotations carried through the merged dataset
#[derive(Clone, Debug)]
pub struct CellRecord {
    /// globally unique `{sample}_{barcode}`
    pub id: Box<str>,
    pub barcode: Box<str>,
    /// index into `MergedDataset::samples`
    pub sample: usize,
    pub qc: CellQc,
    pub doublet: Option<DoubletCall>,
}

/// All samples' cells side by side over the union of their genes
#[derive(Clone, Debug)]
pub struct MergedDataset {
    samples: Vec<Box<str>>,
    genes: Vec<Box<str>>,
    cells: Vec<CellRecord>,
    counts: CscMat,
}

/// Globally unique cell identifier
pub fn prefixed_cell_id(sample: &str, barcode: &str) -> Box<str> {
    format!("{}_{}", sample, barcode).into_boxed_str()
}

/// Concatenate samples in the given order.
///
/// Genes are unified by name in order of first appearance and each
/// sample's counts are re-indexed into the union. Fails with
/// `IdentifierCollision` if two cells end up with the same prefixed id.
pub fn merge_samples(samples: &[Sample]) -> anyhow::Result<MergedDataset> {
    let mut gene_index = HashMap::<Box<str>, usize>::new();
    let mut genes = vec![];
    for s in samples {
        for g in s.genes() {
            if !gene_index.contains_key(g) {
                gene_index.insert(g.clone(), genes.len());
                genes.push(g.clone());
            }
        }
    }

    let mut owner = HashMap::<Box<str>, usize>::new();
    let mut cells = vec![];
    let mut blocks = vec![];

    for (s_idx, s) in samples.iter().enumerate() {
        for (j, barcode) in s.cells().iter().enumerate() {
            let id = prefixed_cell_id(s.name(), barcode);
            if let Some(&first) = owner.get(&id) {
                return Err(PipelineError::IdentifierCollision {
                    cell: id,
                    first: samples[first].name().into(),
                    second: s.name().into(),
                }
                .into());
            }
            owner.insert(id.clone(), s_idx);
            cells.push(CellRecord {
                id,
                barcode: barcode.clone(),
                sample: s_idx,
                qc: s.qc()[j].clone(),
                doublet: s.doublet_calls().map(|calls| calls[j]),
            });
        }

        let row_map = s.genes().iter().map(|g| gene_index[g]).collect::<Vec<_>>();
        blocks.push(csc_remap_rows(s.counts(), genes.len(), &row_map)?);
    }

    let counts = csc_hstack(&blocks.iter().collect::<Vec<_>>())?;

    info!(
        "[merge] {} samples -> {} cells x {} genes",
        samples.len(),
        cells.len(),
        genes.len()
    );

    Ok(MergedDataset {
        samples: samples.iter().map(|s| s.name().into()).collect(),
        genes,
        cells,
        counts,
    })
}

impl MergedDataset {
    pub fn samples(&self) -> &[Box<str>] {
        &self.samples
    }

    pub fn genes(&self) -> &[Box<str>] {
        &self.genes
    }

    pub fn cells(&self) -> &[CellRecord] {
        &self.cells
    }

    pub fn counts(&self) -> &CscMat {
        &self.counts
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// merged column indices of each sample, in sample order
    pub fn cells_by_sample(&self) -> Vec<Vec<usize>> {
        let mut ret = vec![vec![]; self.samples.len()];
        for (j, c) in self.cells.iter().enumerate() {
            ret[c.sample].push(j);
        }
        ret
    }

    /// Keep the cells in `keep`, in that order
    pub fn select_cells(&self, keep: &[usize]) -> anyhow::Result<Self> {
        Ok(Self {
            samples: self.samples.clone(),
            genes: self.genes.clone(),
            cells: keep.iter().map(|&j| self.cells[j].clone()).collect(),
            counts: csc_select_columns(&self.counts, keep)?,
        })
    }

    /// Re-assert the QC thresholds and the absence of doublets after
    /// merging; returns the filtered dataset and the number removed
    pub fn quality_filter(&self, thresholds: &QcThresholds) -> anyhow::Result<(Self, usize)> {
        let keep = self
            .cells
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                let doublet = c.doublet.map(|d| d.is_doublet()).unwrap_or(false);
                !doublet && thresholds.passes(&c.qc)
            })
            .map(|(j, _)| j)
            .collect::<Vec<_>>();

        let removed = self.num_cells() - keep.len();
        if removed > 0 {
            warn!("[qc] {} cells removed after merging", removed);
        } else {
            info!("[qc] no cells removed after merging");
        }
        Ok((self.select_cells(&keep)?, removed))
    }

    /// One `Sample` per declared sample over the union genes, with
    /// prefixed cell ids, in declared order
    pub fn split_by_sample(&self) -> anyhow::Result<Vec<Sample>> {
        self.cells_by_sample()
            .into_iter()
            .enumerate()
            .map(|(s_idx, cols)| {
                let doublets = cols
                    .iter()
                    .map(|&j| self.cells[j].doublet)
                    .collect::<Option<Vec<_>>>();
                Ok(Sample::from_parts(
                    self.samples[s_idx].clone(),
                    self.genes.clone(),
                    cols.iter().map(|&j| self.cells[j].id.clone()).collect(),
                    csc_select_columns(&self.counts, &cols)?,
                    cols.iter().map(|&j| self.cells[j].qc.clone()).collect(),
                    doublets,
                ))
            })
            .collect()
    }
}
