use matrix_util::common_io::*;
use matrix_util::mtx_io::*;

#[test]
fn gz_lines_and_mtx() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let lines_file = dir.path().join("barcodes.tsv.gz");
    let lines_file = lines_file.to_str().ok_or(anyhow::anyhow!("path"))?;
    let lines: Vec<Box<str>> = vec!["AAAC-1".into(), "AAAG-1".into()];
    write_lines(&lines, lines_file)?;
    assert_eq!(read_lines(lines_file)?, lines);

    let mtx_file = dir.path().join("sub").join("matrix.mtx.gz");
    let mtx_file = mtx_file.to_str().ok_or(anyhow::anyhow!("path"))?;
    write_mtx_triplets(&[(2, 1, 5.0), (0, 0, 1.0), (1, 1, 2.0)], 3, 2, mtx_file)?;

    let mtx = read_mtx_triplets(mtx_file)?;
    assert_eq!((mtx.nrow, mtx.ncol), (3, 2));
    assert_eq!(mtx.triplets, vec![(0, 0, 1.0), (1, 1, 2.0), (2, 1, 5.0)]);

    assert!(find_file_with_gz(dir.path(), &["barcodes.tsv"]).is_some());
    assert!(find_file_with_gz(dir.path(), &["features.tsv"]).is_none());
    Ok(())
}

#[test]
fn malformed_mtx_is_an_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mtx_file = dir.path().join("matrix.mtx");
    std::fs::write(&mtx_file, "%%MatrixMarket matrix coordinate integer general\n2 2 2\n1 1 3\n3 1 1\n")?;
    let mtx_file = mtx_file.to_str().ok_or(anyhow::anyhow!("path"))?;
    assert!(read_mtx_triplets(mtx_file).is_err());

    std::fs::write(mtx_file, "%%MatrixMarket matrix coordinate integer general\n2 2 3\n1 1 3\n")?;
    assert!(read_mtx_triplets(mtx_file).is_err());
    Ok(())
}
