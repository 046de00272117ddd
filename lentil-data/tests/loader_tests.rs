use lentil_data::error::PipelineError;
use lentil_data::simulate::*;
use lentil_data::sparse_util::row_nnz;
use lentil_data::tenx_io::*;
use matrix_util::common_io::write_lines;
use matrix_util::mtx_io::write_mtx_triplets;

fn small_sim() -> anyhow::Result<SimOut> {
    simulate_samples(&SimArgs {
        samples: 1,
        cells_per_sample: 120,
        genes: 400,
        qc_violation_rate: 0.1,
        doublet_rate: 0.0,
        ..Default::default()
    })
}

#[test]
fn load_written_directory() -> anyhow::Result<()> {
    let sim = small_sim()?;
    let dir = tempfile::tempdir()?;
    let dirs = sim.write_tenx_dirs(dir.path())?;

    let args = LoaderArgs::default();
    let sample = load_sample("s1", &dirs[0], &args)?;

    assert_eq!(sample.name(), "s1");
    assert!(sample.num_cells() < 120);
    assert!(sample.qc().iter().all(|qc| qc.n_genes >= args.min_genes));
    assert!(row_nnz(sample.counts()).iter().all(|&n| n >= args.min_cells));

    // low-depth cells never make it past the loader
    let low = sim.samples[0]
        .barcodes
        .iter()
        .zip(sim.samples[0].kinds.iter())
        .filter(|(_, k)| matches!(k, CellKind::LowDepth(_)))
        .map(|(b, _)| b.clone())
        .collect::<Vec<_>>();
    assert!(!low.is_empty());
    assert!(low.iter().all(|b| !sample.cells().contains(b)));
    Ok(())
}

#[test]
fn quantifier_layout_and_modality() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let outs = dir.path().join(FILTERED_MATRIX_SUBDIR);
    std::fs::create_dir_all(&outs)?;

    let features: Vec<Box<str>> = vec![
        "G1\tACTB\tGene Expression".into(),
        "G2\tCD3E\tGene Expression".into(),
        "A1\tCD3_TotalSeqB\tAntibody Capture".into(),
        "G3\tACTB\tGene Expression".into(),
    ];
    let barcodes: Vec<Box<str>> = vec!["AAAC-1".into(), "AAAG-1".into(), "AAAT-1".into()];
    let mut triplets = vec![];
    for j in 0..3 {
        for i in 0..4 {
            triplets.push((i, j, (i + j + 1) as f32));
        }
    }

    write_lines(&features, outs.join("features.tsv.gz").to_str().unwrap())?;
    write_lines(&barcodes, outs.join("barcodes.tsv.gz").to_str().unwrap())?;
    write_mtx_triplets(&triplets, 4, 3, outs.join("matrix.mtx.gz").to_str().unwrap())?;

    let args = LoaderArgs {
        min_genes: 1,
        min_cells: 1,
        ..Default::default()
    };
    let sample = load_sample("run", dir.path(), &args)?;

    let genes = sample.genes().iter().map(|g| &**g).collect::<Vec<_>>();
    assert_eq!(genes, vec!["ACTB", "CD3E", "ACTB.1"]);
    assert_eq!(sample.num_cells(), 3);
    assert_eq!(sample.qc()[0].total_counts, 1. + 2. + 4.);
    Ok(())
}

#[test]
fn missing_files_are_reported() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let err = load_sample("empty", dir.path(), &LoaderArgs::default())
        .err()
        .ok_or(anyhow::anyhow!("expected an error"))?;
    assert!(matches!(
        PipelineError::find(&err),
        Some(PipelineError::MissingData { .. })
    ));
    Ok(())
}

#[test]
fn shape_mismatch_is_missing_data() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let d = dir.path();
    let features: Vec<Box<str>> = vec!["G1\tA".into()];
    let barcodes: Vec<Box<str>> = vec!["B1".into(), "B2".into()];
    write_lines(&features, d.join("features.tsv").to_str().unwrap())?;
    write_lines(&barcodes, d.join("barcodes.tsv").to_str().unwrap())?;
    write_mtx_triplets(&[(0, 0, 1.0)], 2, 2, d.join("matrix.mtx").to_str().unwrap())?;

    let err = load_sample("bad", d, &LoaderArgs::default())
        .err()
        .ok_or(anyhow::anyhow!("expected an error"))?;
    assert!(matches!(
        PipelineError::find(&err),
        Some(PipelineError::MissingData { .. })
    ));
    Ok(())
}
