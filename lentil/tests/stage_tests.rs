use lentil::doublet::{remove_doublets, score_doublets, DoubletConfig};
use lentil::feature_selection::{load_feature_list, select_integration_features};
use lentil::normalize::{normalize_sample, normalize_samples, NormalizeConfig};
use lentil_data::error::PipelineError;
use lentil_data::simulate::{simulate_samples, SimArgs, SimOut};
use lentil_data::sparse_util::csc_from_columns;
use lentil_data::tenx_io::{filter_by_detection, LoaderArgs};
use lentil_data::Sample;
use std::collections::HashSet;
use std::io::Write;

fn to_samples(sim: &SimOut) -> anyhow::Result<Vec<Sample>> {
    let args = LoaderArgs::default();
    sim.samples
        .iter()
        .map(|s| {
            let mut columns = vec![vec![]; s.barcodes.len()];
            for &(i, j, x) in s.triplets.iter() {
                columns[j as usize].push((i as usize, x));
            }
            let counts = csc_from_columns(sim.gene_names.len(), columns)?;
            filter_by_detection(&s.name, sim.gene_names.clone(), s.barcodes.clone(), counts, &args)
        })
        .collect()
}

fn names(xs: &[&str]) -> Vec<Box<str>> {
    xs.iter().map(|&x| Box::from(x)).collect()
}

#[test]
fn doublet_calls_are_deterministic() -> anyhow::Result<()> {
    let sim = simulate_samples(&SimArgs {
        samples: 1,
        cells_per_sample: 300,
        genes: 600,
        qc_violation_rate: 0.,
        ..Default::default()
    })?;
    let sample = &to_samples(&sim)?[0];
    let cfg = DoubletConfig::default();

    let first = score_doublets(sample, &cfg)?;
    let second = score_doublets(sample, &cfg)?;
    assert_eq!(first.calls, second.calls);
    assert_eq!(first.threshold, second.threshold);
    assert_eq!(first.calls.len(), sample.num_cells());
    assert!(!first.degraded);
    Ok(())
}

#[test]
fn simulated_doublets_score_higher() -> anyhow::Result<()> {
    let sim = simulate_samples(&SimArgs {
        samples: 1,
        cells_per_sample: 400,
        genes: 800,
        doublet_rate: 0.1,
        qc_violation_rate: 0.,
        rseed: 3,
        ..Default::default()
    })?;
    let truth = sim.samples[0].doublet_barcodes();
    let sample = &to_samples(&sim)?[0];
    let result = score_doublets(sample, &DoubletConfig::default())?;

    let (mut dbl, mut sgl) = (vec![], vec![]);
    for (b, c) in sample.cells().iter().zip(result.calls.iter()) {
        if truth.contains(b) {
            dbl.push(c.score);
        } else {
            sgl.push(c.score);
        }
    }
    let mean = |x: &[f32]| x.iter().sum::<f32>() / x.len().max(1) as f32;
    assert!(!dbl.is_empty());
    assert!(mean(&dbl) > mean(&sgl));
    Ok(())
}

#[test]
fn small_samples_skip_doublet_scoring() -> anyhow::Result<()> {
    let sim = simulate_samples(&SimArgs {
        samples: 1,
        cells_per_sample: 30,
        genes: 400,
        qc_violation_rate: 0.,
        ..Default::default()
    })?;
    let sample = &to_samples(&sim)?[0];
    let (kept, result) = remove_doublets(sample, &DoubletConfig::default())?;
    assert!(result.degraded);
    assert_eq!(result.num_doublets(), 0);
    assert_eq!(kept.num_cells(), sample.num_cells());
    assert!(kept.doublet_calls().is_some());
    Ok(())
}

#[test]
fn residuals_cover_requested_features() -> anyhow::Result<()> {
    let sim = simulate_samples(&SimArgs {
        samples: 2,
        cells_per_sample: 150,
        genes: 500,
        qc_violation_rate: 0.,
        ..Default::default()
    })?;
    let samples = to_samples(&sim)?;
    let cfg = NormalizeConfig {
        n_hvg: 100,
        n_genes_fit: 200,
        ..Default::default()
    };
    let norms = normalize_samples(&samples, &cfg)?;
    assert_eq!(norms.len(), 2);

    let norm = &norms[0];
    assert!(norm.hvg_names().len() <= 100);
    assert!(!norm.hvg_names().is_empty());

    let mut features = norm.hvg_names()[..5].to_vec();
    features.push("NOT_A_GENE".into());
    let resid = norm.residuals(&features);
    assert_eq!(resid.nrows(), 6);
    assert_eq!(resid.ncols(), norm.num_cells());
    assert_eq!(resid.row(5).norm(), 0.);
    assert!(resid.row(0).norm() > 0.);
    assert!(resid.iter().all(|x| x.is_finite()));

    let logc = norm.corrected_log_counts();
    assert_eq!(logc.nrows(), norm.genes().len());
    assert_eq!(logc.ncols(), norm.num_cells());
    assert!(logc.values().iter().all(|&x| x > 0.));
    Ok(())
}

#[test]
fn too_few_cells_is_insufficient_data() -> anyhow::Result<()> {
    let sim = simulate_samples(&SimArgs {
        samples: 1,
        cells_per_sample: 10,
        genes: 300,
        qc_violation_rate: 0.,
        ..Default::default()
    })?;
    let sample = &to_samples(&sim)?[0];
    let err = match normalize_sample(sample, &NormalizeConfig::default()) {
        Ok(_) => anyhow::bail!("a 10-cell sample was normalized"),
        Err(e) => e,
    };
    assert!(matches!(
        PipelineError::find(&err),
        Some(PipelineError::InsufficientData { stage: "normalize", .. })
    ));
    Ok(())
}

#[test]
fn shared_features_rank_by_frequency() -> anyhow::Result<()> {
    let lists = vec![
        names(&["g1", "g2", "g3", "g4"]),
        names(&["g2", "g1", "g5"]),
        names(&["g2", "g6", "g1"]),
    ];

    let sel = select_integration_features(&lists, 4, None)?;
    // ties in frequency fall back to the median rank, then the name
    assert_eq!(sel.selected_names, names(&["g2", "g1", "g6", "g3"]));
    assert_eq!(sel.frequency, vec![3, 3, 1, 1]);

    let union = lists.iter().flatten().collect::<HashSet<_>>();
    assert!(sel.selected_names.iter().all(|g| union.contains(g)));

    let again = select_integration_features(&lists, 4, None)?;
    assert_eq!(again.selected_names, sel.selected_names);

    let all = select_integration_features(&lists, 100, None)?;
    assert_eq!(all.len(), union.len());

    assert!(select_integration_features(&lists, 0, None).is_err());
    Ok(())
}

#[test]
fn feature_list_restricts_candidates() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("features.txt");
    let mut f = std::fs::File::create(&file)?;
    writeln!(f, "g3\textra")?;
    writeln!(f, "g5")?;
    writeln!(f)?;
    drop(f);

    let allowed = load_feature_list(file.to_str().ok_or(anyhow::anyhow!("path"))?)?;
    assert_eq!(allowed.len(), 2);

    let lists = vec![names(&["g1", "g3"]), names(&["g5", "g1"])];
    let sel = select_integration_features(&lists, 10, Some(&allowed))?;
    assert_eq!(sel.selected_names, names(&["g5", "g3"]));
    Ok(())
}
