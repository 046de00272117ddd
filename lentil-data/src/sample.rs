use crate::qc::{compute_cell_qc, MitoPattern};
use crate::sparse_util::*;
use serde::{Deserialize, Serialize};

/// Per-cell quality metrics
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CellQc {
    /// number of genes with non-zero counts
    pub n_genes: usize,
    pub total_counts: f32,
    /// fraction of counts on mitochondrial genes
    pub mito_fraction: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoubletClass {
    Singlet,
    Doublet,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DoubletCall {
    pub class: DoubletClass,
    pub score: f32,
}

impl DoubletCall {
    pub fn singlet(score: f32) -> Self {
        Self {
            class: DoubletClass::Singlet,
            score,
        }
    }

    pub fn is_doublet(&self) -> bool {
        self.class == DoubletClass::Doublet
    }
}

/// One sample's raw counts (genes x cells) with per-cell annotations.
///
/// A `Sample` is never modified after construction; filters return a
/// new one.
#[derive(Clone, Debug)]
pub struct Sample {
    name: Box<str>,
    genes: Vec<Box<str>>,
    cells: Vec<Box<str>>,
    counts: CscMat,
    qc: Vec<CellQc>,
    doublets: Option<Vec<DoubletCall>>,
}

impl Sample {
    /// Wrap a count matrix and compute QC metrics
    /// * `name` - sample identifier
    /// * `genes` - row names
    /// * `cells` - column names
    /// * `counts` - genes x cells raw counts
    /// * `mito` - which genes are mitochondrial
    pub fn new(
        name: &str,
        genes: Vec<Box<str>>,
        cells: Vec<Box<str>>,
        counts: CscMat,
        mito: &MitoPattern,
    ) -> anyhow::Result<Self> {
        if counts.nrows() != genes.len() || counts.ncols() != cells.len() {
            anyhow::bail!(
                "sample {}: [{} x {}] counts for {} genes and {} cells",
                name,
                counts.nrows(),
                counts.ncols(),
                genes.len(),
                cells.len()
            );
        }
        let qc = compute_cell_qc(&counts, &genes, mito);
        Ok(Self {
            name: name.into(),
            genes,
            cells,
            counts,
            qc,
            doublets: None,
        })
    }

    pub(crate) fn from_parts(
        name: Box<str>,
        genes: Vec<Box<str>>,
        cells: Vec<Box<str>>,
        counts: CscMat,
        qc: Vec<CellQc>,
        doublets: Option<Vec<DoubletCall>>,
    ) -> Self {
        Self {
            name,
            genes,
            cells,
            counts,
            qc,
            doublets,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn genes(&self) -> &[Box<str>] {
        &self.genes
    }

    pub fn cells(&self) -> &[Box<str>] {
        &self.cells
    }

    /// raw counts, genes x cells
    pub fn counts(&self) -> &CscMat {
        &self.counts
    }

    pub fn qc(&self) -> &[CellQc] {
        &self.qc
    }

    pub fn doublet_calls(&self) -> Option<&[DoubletCall]> {
        self.doublets.as_deref()
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }

    /// Attach one doublet call per cell
    pub fn with_doublet_calls(self, calls: Vec<DoubletCall>) -> anyhow::Result<Self> {
        if calls.len() != self.num_cells() {
            anyhow::bail!(
                "sample {}: {} doublet calls for {} cells",
                self.name,
                calls.len(),
                self.num_cells()
            );
        }
        Ok(Self {
            doublets: Some(calls),
            ..self
        })
    }

    /// A new sample holding only the cells in `keep`, in that order
    pub fn select_cells(&self, keep: &[usize]) -> anyhow::Result<Self> {
        Ok(Self {
            name: self.name.clone(),
            genes: self.genes.clone(),
            cells: keep.iter().map(|&j| self.cells[j].clone()).collect(),
            counts: csc_select_columns(&self.counts, keep)?,
            qc: keep.iter().map(|&j| self.qc[j].clone()).collect(),
            doublets: self
                .doublets
                .as_ref()
                .map(|calls| keep.iter().map(|&j| calls[j]).collect()),
        })
    }
}
