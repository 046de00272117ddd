use lentil::config::PipelineConfig;
use lentil::output::write_outputs;
use lentil::pipeline::{run_pipeline, SampleInput};
use lentil::predictor::{HierarchicalCentroidModel, LocalModelRegistry};
use lentil_data::merge::prefixed_cell_id;
use lentil_data::simulate::{simulate_samples, SimArgs, SimOut};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Write simulated samples and their reference model under `dir`
fn write_simulation(dir: &Path, args: &SimArgs) -> anyhow::Result<(SimOut, Vec<SampleInput>)> {
    let sim = simulate_samples(args)?;
    let dirs = sim.write_tenx_dirs(&dir.join("data"))?;
    let model = HierarchicalCentroidModel::from_profiles(
        "reference",
        "simulated",
        &sim.gene_names,
        &sim.type_names,
        &sim.type_profiles,
        (args.depth.0 + args.depth.1) / 2.,
    )?;
    model.to_json_file(&dir.join("models").join("reference.json"))?;

    let inputs = sim
        .samples
        .iter()
        .zip(dirs)
        .map(|(s, d)| SampleInput {
            name: s.name.clone(),
            dir: d,
        })
        .collect();
    Ok((sim, inputs))
}

fn fast_config(dir: &Path) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.normalize.n_genes_fit = 300;
    cfg.integration.k_filter = 100;
    cfg.integration.k_weight = 50;
    cfg.reduction.n_epochs = 50;
    cfg.reduction.umap_neighbours = 15;
    cfg.annotation.registry = dir.join("models");
    cfg.annotation.cache = dir.join("cache");
    cfg
}

#[test]
fn four_samples_end_to_end() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let args = SimArgs {
        samples: 4,
        cells_per_sample: 500,
        genes: 2000,
        doublet_rate: 0.05,
        qc_violation_rate: 0.1,
        ..Default::default()
    };
    let (sim, inputs) = write_simulation(dir.path(), &args)?;
    let mut cfg = fast_config(dir.path());
    cfg.doublet.expected_rate = Some(args.doublet_rate);
    let registry = LocalModelRegistry::from_config(&cfg.annotation);

    let out = run_pipeline(&inputs, &cfg, &registry)?;

    let report_names = out.report.samples.iter().map(|r| &*r.name).collect::<Vec<_>>();
    assert_eq!(report_names, vec!["sample1", "sample2", "sample3", "sample4"]);

    // every injected doublet is called and never reaches integration
    let integrated_ids = out.integrated.cells.iter().collect::<HashSet<_>>();
    for (s, report) in sim.samples.iter().zip(out.report.samples.iter()) {
        let flagged = report.flagged_doublets.iter().cloned().collect::<HashSet<_>>();
        assert_eq!(report.n_doublets, flagged.len());
        for b in s.doublet_barcodes() {
            assert!(flagged.contains(&b), "{} doublet {} not flagged", s.name, b);
            assert!(!integrated_ids.contains(&prefixed_cell_id(&s.name, &b)));
        }
    }

    // every QC violator and every flagged doublet is gone, nothing else
    let mut expected = 0;
    for (s, report) in sim.samples.iter().zip(out.report.samples.iter()) {
        let mut removed = s.qc_violator_barcodes();
        removed.extend(report.flagged_doublets.iter().cloned());
        expected += s.barcodes.len() - removed.len();
    }
    assert_eq!(out.integrated.num_cells(), expected);
    assert_eq!(out.merged.num_cells(), expected);
    assert_eq!(out.report.n_removed_after_merge, 0);

    let ids = out.integrated.cells.iter().collect::<HashSet<_>>();
    assert_eq!(ids.len(), expected);

    // labels for every cell, consistent with the reference tree
    let model = HierarchicalCentroidModel::from_json_file(&dir.path().join("models").join("reference.json"))?;
    let parent = model
        .nodes
        .iter()
        .filter_map(|n| n.parent.clone().map(|p| (n.label.clone(), p)))
        .collect::<HashMap<_, _>>();
    assert_eq!(out.labels.len(), expected);
    for l in out.labels.iter() {
        assert!(!l.level1.is_empty() && !l.level2.is_empty() && !l.level3.is_empty());
        assert_eq!(parent.get(&l.level3), Some(&l.level2));
        assert_eq!(parent.get(&l.level2), Some(&l.level1));
    }

    assert_eq!(out.embeddings.pca.nrows(), expected);
    assert_eq!(out.embeddings.pca.ncols(), cfg.reduction.n_pcs);
    assert_eq!(out.embeddings.umap.shape(), (expected, 2));
    assert!(out.embeddings.umap.iter().all(|x| x.is_finite()));

    let prefix = dir.path().join("out").join("run");
    let files = write_outputs(prefix.to_str().ok_or(anyhow::anyhow!("path"))?, &out)?;
    for f in [&files.integrated, &files.cells, &files.features, &files.anchors, &files.report] {
        assert!(Path::new(f).is_file(), "{} missing", f);
    }
    let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&files.report)?)?;
    assert_eq!(report["samples"].as_array().map(|x| x.len()), Some(4));
    Ok(())
}

#[test]
fn disjoint_pair_completes_without_correction() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let args = SimArgs {
        samples: 2,
        cells_per_sample: 200,
        genes: 1200,
        doublet_rate: 0.,
        qc_violation_rate: 0.,
        disjoint: true,
        ..Default::default()
    };
    let (_, inputs) = write_simulation(dir.path(), &args)?;
    let cfg = fast_config(dir.path());
    let registry = LocalModelRegistry::from_config(&cfg.annotation);

    let out = run_pipeline(&inputs, &cfg, &registry)?;

    assert!(out.anchors.is_empty());
    assert!(out.report.pairs.iter().all(|p| p.degenerate));
    assert!(out.report.samples.iter().all(|s| !s.corrected));
    assert_eq!(out.labels.len(), out.integrated.num_cells());
    Ok(())
}

#[test]
fn missing_model_fails_the_run() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let args = SimArgs {
        samples: 2,
        cells_per_sample: 150,
        genes: 600,
        qc_violation_rate: 0.,
        ..Default::default()
    };
    let (_, inputs) = write_simulation(dir.path(), &args)?;
    let mut cfg = fast_config(dir.path());
    cfg.annotation.model = "absent".into();
    let registry = LocalModelRegistry::from_config(&cfg.annotation);

    let err = match run_pipeline(&inputs, &cfg, &registry) {
        Ok(_) => anyhow::bail!("ran without a model"),
        Err(e) => e,
    };
    assert!(matches!(
        lentil_data::PipelineError::find(&err),
        Some(lentil_data::PipelineError::ModelUnavailable { .. })
    ));
    Ok(())
}
