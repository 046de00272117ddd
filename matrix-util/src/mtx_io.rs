use crate::common_io::*;
use std::io::{BufRead, Write};

/// MatrixMarket coordinate data with 0-based indices
pub struct MtxTriplets {
    pub nrow: usize,
    pub ncol: usize,
    /// (row, col, value), sorted by column then row
    pub triplets: Vec<(u64, u64, f32)>,
}

/// Write the triplets into a MatrixMarket file with 1-based indices
/// * `triplets` - the triplets to write
/// * `nrow` - number of rows
/// * `ncol` - number of columns
/// * `mtx_file` - the output file (e.g., "matrix.mtx.gz")
pub fn write_mtx_triplets(
    triplets: &[(u64, u64, f32)],
    nrow: usize,
    ncol: usize,
    mtx_file: &str,
) -> anyhow::Result<()> {
    if let Some(parent_dir) = std::path::Path::new(mtx_file).parent() {
        std::fs::create_dir_all(parent_dir)?;
    }

    let mut buf = open_buf_writer(mtx_file)?;

    let nnz = triplets.len();
    writeln!(buf, "%%MatrixMarket matrix coordinate integer general")?;
    writeln!(buf, "{} {} {}", nrow, ncol, nnz)?;

    for (row, col, val) in triplets {
        writeln!(buf, "{} {} {}", row + 1, col + 1, val)?;
    }

    buf.flush()?;
    Ok(())
}

/// Read a matrix market file and return the triplets with its shape.
///
/// Fails on a missing or malformed header, malformed entries,
/// out-of-range indices or a wrong number of entries.
/// * `mtx_file` - Path to the matrix market file
pub fn read_mtx_triplets(mtx_file: &str) -> anyhow::Result<MtxTriplets> {
    let buf = open_buf_reader(mtx_file)?;

    let mut shape: Option<(usize, usize, usize)> = None;
    let mut triplets = vec![];

    for (line_no, line) in buf.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('%') {
            continue;
        }
        let words = line.split_whitespace().collect::<Vec<_>>();
        if words.len() != 3 {
            anyhow::bail!("{}:{} expected 3 fields", mtx_file, line_no + 1);
        }

        match shape {
            None => {
                let nrow = words[0].parse::<usize>()?;
                let ncol = words[1].parse::<usize>()?;
                let nnz = words[2].parse::<usize>()?;
                triplets.reserve(nnz);
                shape = Some((nrow, ncol, nnz));
            }
            Some((nrow, ncol, _)) => {
                let row = words[0].parse::<u64>()?;
                let col = words[1].parse::<u64>()?;
                let val = words[2].parse::<f32>()?;
                if row == 0 || col == 0 || row > nrow as u64 || col > ncol as u64 {
                    anyhow::bail!(
                        "{}:{} entry ({}, {}) outside of [{} x {}]",
                        mtx_file,
                        line_no + 1,
                        row,
                        col,
                        nrow,
                        ncol
                    );
                }
                // convert 1-based to 0-based
                triplets.push((row - 1, col - 1, val));
            }
        }
    }

    let Some((nrow, ncol, nnz)) = shape else {
        anyhow::bail!("Failed to parse mtx header in {}", mtx_file);
    };

    if triplets.len() != nnz {
        anyhow::bail!(
            "{} declares {} entries but contains {}",
            mtx_file,
            nnz,
            triplets.len()
        );
    }

    triplets.sort_by_key(|&(row, col, _)| (col, row));

    Ok(MtxTriplets {
        nrow,
        ncol,
        triplets,
    })
}
