use crate::error::PipelineError;
use crate::qc::MitoPattern;
use crate::sample::Sample;
use crate::sparse_util::*;

use log::info;
use matrix_util::common_io::{find_file_with_gz, read_lines, read_lines_of_words_tab, write_lines};
use matrix_util::mtx_io::{read_mtx_triplets, write_mtx_triplets};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Sub-directory the quantifier writes filtered matrices to
pub const FILTERED_MATRIX_SUBDIR: &str = "outs/filtered_feature_bc_matrix";

/// Feature-type column value for gene expression counts
pub const GENE_EXPRESSION: &str = "Gene Expression";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderArgs {
    /// keep genes detected in at least this many cells
    pub min_cells: usize,
    /// keep cells with at least this many detected genes
    pub min_genes: usize,
    /// feature type to keep
    pub modality: Box<str>,
    pub mito: MitoPattern,
}

impl Default for LoaderArgs {
    fn default() -> Self {
        Self {
            min_cells: 3,
            min_genes: 200,
            modality: GENE_EXPRESSION.into(),
            mito: MitoPattern::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TenxFiles {
    pub matrix: PathBuf,
    pub features: PathBuf,
    pub barcodes: PathBuf,
}

/// Locate the three matrix files in `dir` or in its
/// `outs/filtered_feature_bc_matrix` sub-directory
pub fn locate_tenx_files(dir: &Path) -> Option<TenxFiles> {
    [dir.to_path_buf(), dir.join(FILTERED_MATRIX_SUBDIR)]
        .iter()
        .find_map(|d| {
            Some(TenxFiles {
                matrix: find_file_with_gz(d, &["matrix.mtx"])?,
                features: find_file_with_gz(d, &["features.tsv", "genes.tsv"])?,
                barcodes: find_file_with_gz(d, &["barcodes.tsv"])?,
            })
        })
}

fn missing(sample: &str, reason: String) -> anyhow::Error {
    PipelineError::MissingData {
        sample: sample.into(),
        reason,
    }
    .into()
}

fn path_str(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow::anyhow!("non-UTF-8 path {}", path.display()))
}

/// Load one sample directory
///
/// * `name` - sample identifier
/// * `dir` - directory with `matrix.mtx`, `features.tsv` and
///   `barcodes.tsv` (optionally gzipped), or a quantifier run directory
/// * `args` - modality and minimum detection filters
pub fn load_sample(name: &str, dir: &Path, args: &LoaderArgs) -> anyhow::Result<Sample> {
    let files = locate_tenx_files(dir).ok_or_else(|| {
        missing(
            name,
            format!(
                "no matrix.mtx/features.tsv/barcodes.tsv in {} or {}",
                dir.display(),
                dir.join(FILTERED_MATRIX_SUBDIR).display()
            ),
        )
    })?;

    let features = read_lines_of_words_tab(path_str(&files.features)?)
        .map_err(|e| missing(name, format!("{}: {}", files.features.display(), e)))?;
    let barcodes = read_lines(path_str(&files.barcodes)?)
        .map_err(|e| missing(name, format!("{}: {}", files.barcodes.display(), e)))?
        .into_iter()
        .filter(|x| !x.trim().is_empty())
        .collect::<Vec<_>>();
    let mtx = read_mtx_triplets(path_str(&files.matrix)?)
        .map_err(|e| missing(name, format!("{}: {}", files.matrix.display(), e)))?;

    if mtx.nrow != features.len() || mtx.ncol != barcodes.len() {
        return Err(missing(
            name,
            format!(
                "matrix is [{} x {}] but there are {} features and {} barcodes",
                mtx.nrow,
                mtx.ncol,
                features.len(),
                barcodes.len()
            ),
        ));
    }

    // gene name (2nd column) of every feature of the requested modality
    let mut row_map = vec![None; features.len()];
    let mut names = vec![];
    for (i, words) in features.iter().enumerate() {
        let feature_type = words.get(2).map(|x| &**x).unwrap_or(GENE_EXPRESSION);
        if feature_type != &*args.modality {
            continue;
        }
        let gene = words.get(1).unwrap_or(&words[0]).clone();
        row_map[i] = Some(names.len());
        names.push(gene);
    }

    let genes = make_unique(names);
    let mut columns = vec![vec![]; barcodes.len()];
    for &(i, j, x) in mtx.triplets.iter() {
        if let Some(k) = row_map[i as usize] {
            columns[j as usize].push((k, x));
        }
    }
    let counts = csc_from_columns(genes.len(), columns)?;

    info!(
        "[loader] {}: read {} {} features x {} barcodes from {}",
        name,
        genes.len(),
        args.modality,
        barcodes.len(),
        files.matrix.display()
    );

    filter_by_detection(name, genes, barcodes, counts, args)
}

/// Drop cells with fewer than `min_genes` detected genes, then genes
/// detected in fewer than `min_cells` of the remaining cells
pub fn filter_by_detection(
    name: &str,
    genes: Vec<Box<str>>,
    cells: Vec<Box<str>>,
    counts: CscMat,
    args: &LoaderArgs,
) -> anyhow::Result<Sample> {
    let keep_cells = column_nnz(&counts)
        .into_iter()
        .enumerate()
        .filter(|&(_, n)| n >= args.min_genes)
        .map(|(j, _)| j)
        .collect::<Vec<_>>();
    let counts = csc_select_columns(&counts, &keep_cells)?;

    let keep_genes = row_nnz(&counts)
        .into_iter()
        .enumerate()
        .filter(|&(_, n)| n >= args.min_cells)
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    let counts = csc_select_rows(&counts, &keep_genes)?;

    info!(
        "[loader] {}: {} genes (>= {} cells) x {} cells (>= {} genes)",
        name,
        keep_genes.len(),
        args.min_cells,
        keep_cells.len(),
        args.min_genes
    );

    Sample::new(
        name,
        keep_genes.iter().map(|&i| genes[i].clone()).collect(),
        keep_cells.iter().map(|&j| cells[j].clone()).collect(),
        counts,
        &args.mito,
    )
}

/// Append `.1`, `.2`, ... to repeated names
fn make_unique(names: Vec<Box<str>>) -> Vec<Box<str>> {
    let mut seen = HashMap::<Box<str>, usize>::new();
    let mut ret = Vec::with_capacity(names.len());
    for x in names {
        let count = seen.entry(x.clone()).or_insert(0);
        if *count == 0 {
            ret.push(x);
        } else {
            ret.push(format!("{}.{}", x, count).into_boxed_str());
        }
        *count += 1;
    }
    ret
}

/// Write a count matrix as a gzipped 10x-style directory
///
/// * `dir` - output directory (created if needed)
/// * `gene_ids` - first column of `features.tsv.gz`
/// * `gene_names` - second column of `features.tsv.gz`
/// * `barcodes` - cell barcodes
/// * `triplets` - 0-based `(gene, cell, count)` entries
pub fn write_tenx_dir(
    dir: &Path,
    gene_ids: &[Box<str>],
    gene_names: &[Box<str>],
    barcodes: &[Box<str>],
    triplets: &[(u64, u64, f32)],
) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;

    let features = gene_ids
        .iter()
        .zip(gene_names)
        .map(|(id, name)| format!("{}\t{}\t{}", id, name, GENE_EXPRESSION).into_boxed_str())
        .collect::<Vec<_>>();

    write_lines(&features, path_str(&dir.join("features.tsv.gz"))?)?;
    write_lines(barcodes, path_str(&dir.join("barcodes.tsv.gz"))?)?;
    write_mtx_triplets(
        triplets,
        gene_ids.len(),
        barcodes.len(),
        path_str(&dir.join("matrix.mtx.gz"))?,
    )?;
    Ok(())
}
