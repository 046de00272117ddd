use nalgebra_sparse::CscMatrix;

pub type CscMat = CscMatrix<f32>;

/// Build a CSC matrix from per-column `(row, value)` entries.
///
/// Entries within a column are sorted, duplicates summed and explicit
/// zeros dropped.
/// * `nrows` - number of rows
/// * `columns` - one entry list per column
pub fn csc_from_columns(nrows: usize, columns: Vec<Vec<(usize, f32)>>) -> anyhow::Result<CscMat> {
    let ncols = columns.len();
    let mut col_offsets = Vec::with_capacity(ncols + 1);
    let mut row_indices = vec![];
    let mut values = vec![];
    col_offsets.push(0);

    for mut col in columns {
        col.sort_by_key(|&(i, _)| i);
        let mut last: Option<usize> = None;
        for (i, x) in col {
            if x == 0.0 {
                continue;
            }
            if i >= nrows {
                anyhow::bail!("row index {} out of range {}", i, nrows);
            }
            if last == Some(i) {
                if let Some(v) = values.last_mut() {
                    *v += x;
                }
            } else {
                row_indices.push(i);
                values.push(x);
                last = Some(i);
            }
        }
        col_offsets.push(row_indices.len());
    }

    CscMatrix::try_from_csc_data(nrows, ncols, col_offsets, row_indices, values)
        .map_err(|e| anyhow::anyhow!("invalid sparse matrix: {}", e))
}

/// Entries of column `j` as `(row, value)` pairs
pub fn column_entries(xx: &CscMat, j: usize) -> Vec<(usize, f32)> {
    let col = xx.col(j);
    col.row_indices()
        .iter()
        .copied()
        .zip(col.values().iter().copied())
        .collect()
}

/// Keep the columns in `cols`, in that order
pub fn csc_select_columns(xx: &CscMat, cols: &[usize]) -> anyhow::Result<CscMat> {
    let columns = cols.iter().map(|&j| column_entries(xx, j)).collect();
    csc_from_columns(xx.nrows(), columns)
}

/// Keep the rows in `rows`; row `rows[k]` becomes row `k`
pub fn csc_select_rows(xx: &CscMat, rows: &[usize]) -> anyhow::Result<CscMat> {
    let mut new_index = vec![None; xx.nrows()];
    for (k, &i) in rows.iter().enumerate() {
        new_index[i] = Some(k);
    }
    let columns = (0..xx.ncols())
        .map(|j| {
            column_entries(xx, j)
                .into_iter()
                .filter_map(|(i, x)| new_index[i].map(|k| (k, x)))
                .collect()
        })
        .collect();
    csc_from_columns(rows.len(), columns)
}

/// Move row `i` to row `row_map[i]` of a matrix with `nrows` rows
pub fn csc_remap_rows(xx: &CscMat, nrows: usize, row_map: &[usize]) -> anyhow::Result<CscMat> {
    let columns = (0..xx.ncols())
        .map(|j| {
            column_entries(xx, j)
                .into_iter()
                .map(|(i, x)| (row_map[i], x))
                .collect()
        })
        .collect();
    csc_from_columns(nrows, columns)
}

/// Concatenate matrices with the same rows side by side
pub fn csc_hstack(blocks: &[&CscMat]) -> anyhow::Result<CscMat> {
    let nrows = blocks.first().map(|b| b.nrows()).unwrap_or(0);
    let mut columns = vec![];
    for b in blocks {
        if b.nrows() != nrows {
            anyhow::bail!("cannot stack {} rows next to {} rows", b.nrows(), nrows);
        }
        columns.extend((0..b.ncols()).map(|j| column_entries(b, j)));
    }
    csc_from_columns(nrows, columns)
}

/// Number of non-zero entries per row
pub fn row_nnz(xx: &CscMat) -> Vec<usize> {
    let mut ret = vec![0; xx.nrows()];
    for &i in xx.row_indices() {
        ret[i] += 1;
    }
    ret
}

/// Number of non-zero entries per column
pub fn column_nnz(xx: &CscMat) -> Vec<usize> {
    xx.col_offsets().windows(2).map(|w| w[1] - w[0]).collect()
}

/// Column sums
pub fn column_sums(xx: &CscMat) -> Vec<f32> {
    xx.col_iter().map(|col| col.values().iter().sum()).collect()
}

/// `(row, col, value)` triplets sorted by column then row
pub fn to_triplets(xx: &CscMat) -> Vec<(u64, u64, f32)> {
    xx.triplet_iter()
        .map(|(i, j, &x)| (i as u64, j as u64, x))
        .collect()
}
