use lentil::anchors::{find_integration_anchors, IntegrationConfig};
use lentil::feature_selection::select_integration_features;
use lentil::integrate::integrate_samples;
use lentil::normalize::{normalize_samples, NormalizeConfig};
use lentil_data::merge::merge_samples;
use lentil_data::simulate::{simulate_samples, SimArgs};
use lentil_data::sparse_util::csc_from_columns;
use lentil_data::tenx_io::{filter_by_detection, LoaderArgs};
use lentil_data::Sample;
use nalgebra::DMatrix;
use std::collections::HashSet;

struct Prepared {
    names: Vec<Box<str>>,
    features: Vec<Box<str>>,
    cells: Vec<Vec<Box<str>>>,
    data: Vec<DMatrix<f32>>,
}

/// simulated samples on the union genes, normalized, with residuals of
/// the shared variable features
fn prepare(args: &SimArgs) -> anyhow::Result<Prepared> {
    let sim = simulate_samples(args)?;
    let loader = LoaderArgs::default();
    let samples = sim
        .samples
        .iter()
        .map(|s| {
            let mut columns = vec![vec![]; s.barcodes.len()];
            for &(i, j, x) in s.triplets.iter() {
                columns[j as usize].push((i as usize, x));
            }
            let counts = csc_from_columns(sim.gene_names.len(), columns)?;
            filter_by_detection(&s.name, sim.gene_names.clone(), s.barcodes.clone(), counts, &loader)
        })
        .collect::<anyhow::Result<Vec<Sample>>>()?;

    let split = merge_samples(&samples)?.split_by_sample()?;
    let norms = normalize_samples(
        &split,
        &NormalizeConfig {
            n_hvg: 300,
            n_genes_fit: 200,
            ..Default::default()
        },
    )?;

    let ranked = norms.iter().map(|n| n.hvg_names()).collect::<Vec<_>>();
    let features = select_integration_features(&ranked, 300, None)?.selected_names;

    Ok(Prepared {
        names: split.iter().map(|s| Box::from(s.name())).collect(),
        cells: norms.iter().map(|n| n.cells().to_vec()).collect(),
        data: norms.iter().map(|n| n.residuals(&features)).collect(),
        features,
    })
}

fn small_config() -> IntegrationConfig {
    IntegrationConfig {
        dims: 10,
        k_filter: 50,
        k_weight: 30,
        ..Default::default()
    }
}

#[test]
fn anchors_link_distinct_samples() -> anyhow::Result<()> {
    let x = prepare(&SimArgs {
        samples: 3,
        cells_per_sample: 150,
        genes: 600,
        qc_violation_rate: 0.,
        doublet_rate: 0.,
        ..Default::default()
    })?;
    let cfg = small_config();
    let anchors = find_integration_anchors(&x.names, &x.data, &cfg)?;

    assert_eq!(anchors.pairs.len(), 3);
    assert!(anchors.pairs.iter().all(|p| !p.degenerate && p.n_anchors > 0));
    assert!(!anchors.is_empty());
    for a in anchors.anchors.iter() {
        assert_ne!(a.sample_a, a.sample_b);
        assert!(a.cell_a < x.data[a.sample_a].ncols());
        assert!(a.cell_b < x.data[a.sample_b].ncols());
        assert!((0. ..=1.).contains(&a.score));
    }
    let pairs = anchors
        .anchors
        .iter()
        .map(|a| (a.sample_a, a.cell_a, a.sample_b, a.cell_b))
        .collect::<HashSet<_>>();
    assert_eq!(pairs.len(), anchors.len());

    // same seed, same anchors
    let again = find_integration_anchors(&x.names, &x.data, &cfg)?;
    assert_eq!(again.anchors, anchors.anchors);

    let integrated = integrate_samples(&x.features, &x.names, &x.cells, x.data.clone(), &anchors, &cfg)?;
    let total = x.cells.iter().map(|c| c.len()).sum::<usize>();
    assert_eq!(integrated.num_cells(), total);
    assert_eq!(integrated.values.ncols(), total);
    assert_eq!(integrated.values.nrows(), x.features.len());
    assert_eq!(
        integrated.cells.iter().collect::<HashSet<_>>(),
        x.cells.iter().flatten().collect::<HashSet<_>>()
    );
    assert_eq!(integrated.order.len(), 3);
    assert_eq!(integrated.corrected.iter().filter(|&&c| c).count(), 2);
    assert!(integrated.values.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn disjoint_samples_pass_through() -> anyhow::Result<()> {
    let x = prepare(&SimArgs {
        samples: 2,
        cells_per_sample: 120,
        genes: 800,
        qc_violation_rate: 0.,
        doublet_rate: 0.,
        disjoint: true,
        ..Default::default()
    })?;
    // same genes measured in both samples, only the cell types differ
    let nf = x.features.len();
    let in_both = (0..nf)
        .filter(|&f| x.data.iter().all(|d| d.row(f).norm() > 0.))
        .count();
    assert!(in_both * 10 >= nf * 9, "{} of {} features in both samples", in_both, nf);

    let cfg = small_config();
    let anchors = find_integration_anchors(&x.names, &x.data, &cfg)?;

    assert!(anchors.is_empty());
    assert_eq!(anchors.pairs.len(), 1);
    assert!(anchors.pairs[0].degenerate);

    let integrated = integrate_samples(&x.features, &x.names, &x.cells, x.data.clone(), &anchors, &cfg)?;
    assert_eq!(integrated.corrected, vec![false, false]);

    let mut offset = 0;
    for d in x.data.iter() {
        assert_eq!(integrated.values.columns(offset, d.ncols()), d.columns(0, d.ncols()));
        offset += d.ncols();
    }
    Ok(())
}
