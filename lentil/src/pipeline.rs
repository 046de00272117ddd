//! Stage orchestration
//!
//! Stages run one after another with a full barrier in between; inside a
//! stage samples, sample pairs or cells are processed in parallel.

use crate::anchors::{find_integration_anchors, AnchorSet, PairSummary};
use crate::common::*;
use crate::config::PipelineConfig;
use crate::dim_reduce::{reduce_dimensions, Embeddings};
use crate::doublet::remove_doublets;
use crate::feature_selection::{load_feature_list, select_integration_features, FeatureSelection};
use crate::integrate::{integrate_samples, IntegratedMatrix};
use crate::normalize::normalize_samples;
use crate::predictor::{annotate_cells, CellTypeLabels, CellTypePredictor, ExpressionTable};

use anyhow::Context;
use lentil_data::merge::{merge_samples, MergedDataset};
use lentil_data::qc::quality_filter;
use lentil_data::sparse_util::csc_hstack;
use lentil_data::tenx_io::load_sample;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// A sample directory with its name
#[derive(Clone, Debug, PartialEq)]
pub struct SampleInput {
    pub name: Box<str>,
    pub dir: PathBuf,
}

impl SampleInput {
    /// `NAME=DIR`, or `DIR` named after its last component
    pub fn parse(arg: &str) -> anyhow::Result<Self> {
        let (name, dir) = match arg.split_once('=') {
            Some((name, dir)) => (name.trim().to_string(), PathBuf::from(dir.trim())),
            None => {
                let dir = PathBuf::from(arg.trim());
                let name = dir
                    .file_name()
                    .and_then(|x| x.to_str())
                    .map(str::to_string)
                    .unwrap_or_default();
                (name, dir)
            }
        };
        if name.is_empty() || dir.as_os_str().is_empty() {
            anyhow::bail!("cannot read a sample name and directory from `{}`", arg);
        }
        Ok(Self {
            name: name.into_boxed_str(),
            dir,
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SampleReport {
    pub name: Box<str>,
    pub n_loaded: usize,
    pub n_doublets: usize,
    pub doublet_threshold: f32,
    pub expected_doublet_rate: f32,
    pub doublet_degraded: bool,
    /// barcodes called doublets
    pub flagged_doublets: Vec<Box<str>>,
    pub n_after_qc: usize,
    pub n_hvg: usize,
    pub corrected: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    pub samples: Vec<SampleReport>,
    pub n_merged: usize,
    pub n_removed_after_merge: usize,
    pub n_features: usize,
    pub n_anchors: usize,
    pub pairs: Vec<PairSummary>,
    pub integration_order: Vec<Box<str>>,
    pub model: Box<str>,
    pub config: PipelineConfig,
}

pub struct PipelineOutput {
    pub merged: MergedDataset,
    pub features: FeatureSelection,
    pub anchors: AnchorSet,
    pub integrated: IntegratedMatrix,
    pub embeddings: Embeddings,
    /// one per integrated cell, same order
    pub labels: Vec<CellTypeLabels>,
    pub report: PipelineReport,
}

/// Load every sample directory, then run all stages
pub fn run_pipeline(
    inputs: &[SampleInput],
    cfg: &PipelineConfig,
    predictor: &dyn CellTypePredictor,
) -> anyhow::Result<PipelineOutput> {
    if inputs.is_empty() {
        anyhow::bail!("no samples");
    }
    check_unique_names(inputs.iter().map(|x| &*x.name))?;

    let samples = inputs
        .par_iter()
        .map(|x| load_sample(&x.name, &x.dir, &cfg.loader))
        .collect::<anyhow::Result<Vec<_>>>()
        .context("[loader]")?;

    run_on_samples(samples, cfg, predictor)
}

fn check_unique_names<'a>(names: impl Iterator<Item = &'a str>) -> anyhow::Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            anyhow::bail!("sample name `{}` given twice", name);
        }
    }
    Ok(())
}

/// Run every stage after loading
pub fn run_on_samples(
    samples: Vec<Sample>,
    cfg: &PipelineConfig,
    predictor: &dyn CellTypePredictor,
) -> anyhow::Result<PipelineOutput> {
    check_unique_names(samples.iter().map(|s| s.name()))?;
    let names = samples
        .iter()
        .map(|s| Box::from(s.name()))
        .collect::<Vec<Box<str>>>();

    // doublets, then fixed QC thresholds, one task per sample
    let (mut reports, filtered): (Vec<SampleReport>, Vec<Sample>) = samples
        .par_iter()
        .progress_count(samples.len() as u64)
        .map(|sample| -> anyhow::Result<(SampleReport, Sample)> {
            let (singlets, doublets) = remove_doublets(sample, &cfg.doublet)
                .with_context(|| format!("[doublet] sample {}", sample.name()))?;
            let passed = quality_filter(&singlets, &cfg.qc)
                .with_context(|| format!("[qc] sample {}", sample.name()))?;

            let report = SampleReport {
                name: sample.name().into(),
                n_loaded: sample.num_cells(),
                n_doublets: doublets.num_doublets(),
                doublet_threshold: doublets.threshold,
                expected_doublet_rate: doublets.expected_rate,
                doublet_degraded: doublets.degraded,
                flagged_doublets: doublets.flagged(sample.cells()).into_iter().cloned().collect(),
                n_after_qc: passed.num_cells(),
                n_hvg: 0,
                corrected: false,
            };
            Ok((report, passed))
        })
        .collect::<anyhow::Result<Vec<_>>>()?
        .into_iter()
        .unzip();
    drop(samples);

    let merged = merge_samples(&filtered)?;
    drop(filtered);
    let (merged, n_removed_after_merge) = merged.quality_filter(&cfg.qc)?;
    let per_sample = merged.split_by_sample()?;

    let norms = normalize_samples(&per_sample, &cfg.normalize)?;
    for (r, n) in reports.iter_mut().zip(norms.iter()) {
        r.n_hvg = n.hvg_names().len();
    }

    let restrict = match cfg.integration.feature_list.as_ref() {
        Some(path) => Some(load_feature_list(path_str(path)?)?),
        None => None,
    };
    let ranked = norms.iter().map(|n| n.hvg_names()).collect::<Vec<_>>();
    let features = select_integration_features(&ranked, cfg.integration.n_features, restrict.as_ref())
        .with_context(|| format!("[features] n_features {}", cfg.integration.n_features))?;

    let residuals = norms
        .iter()
        .map(|n| n.residuals(&features.selected_names))
        .collect::<Vec<_>>();

    let anchors = find_integration_anchors(&names, &residuals, &cfg.integration).with_context(|| {
        format!(
            "[anchors] dims {}, k_anchor {}, k_filter {}, k_score {}",
            cfg.integration.dims,
            cfg.integration.k_anchor,
            cfg.integration.k_filter,
            cfg.integration.k_score
        )
    })?;

    let cells = norms.iter().map(|n| n.cells().to_vec()).collect::<Vec<_>>();
    let integrated = integrate_samples(
        &features.selected_names,
        &names,
        &cells,
        residuals,
        &anchors,
        &cfg.integration,
    )
    .with_context(|| format!("[integrate] k_weight {}", cfg.integration.k_weight))?;

    for (r, &c) in reports.iter_mut().zip(integrated.corrected.iter()) {
        r.corrected = c;
    }

    let embeddings = reduce_dimensions(&integrated.values, &cfg.reduction)
        .with_context(|| format!("[reduce] n_pcs {}", cfg.reduction.n_pcs))?;

    // labels from normalized counts, not from corrected values
    let table = ExpressionTable::new(
        per_sample
            .first()
            .map(|s| s.genes().to_vec())
            .unwrap_or_default(),
        cells.iter().flatten().cloned().collect(),
        csc_hstack(
            &norms
                .iter()
                .map(|n| n.corrected_log_counts())
                .collect::<Vec<_>>(),
        )?,
    )?;
    let labels = annotate_cells(predictor, &cfg.annotation.model, &table)
        .with_context(|| format!("[annotate] model {}", cfg.annotation.model))?;

    let report = PipelineReport {
        samples: reports,
        n_merged: merged.num_cells() + n_removed_after_merge,
        n_removed_after_merge,
        n_features: features.len(),
        n_anchors: anchors.len(),
        pairs: anchors.pairs.clone(),
        integration_order: integrated.order.iter().map(|&s| names[s].clone()).collect(),
        model: cfg.annotation.model.clone(),
        config: cfg.clone(),
    };

    info!(
        "[pipeline] {} cells x {} features integrated from {} samples",
        integrated.num_cells(),
        integrated.features.len(),
        names.len()
    );

    Ok(PipelineOutput {
        merged,
        features,
        anchors,
        integrated,
        embeddings,
        labels,
        report,
    })
}

fn path_str(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow::anyhow!("non-UTF-8 path {}", path.display()))
}
