use crate::common::*;
use crate::pipeline::PipelineOutput;

use matrix_util::common_io::{mkdir, open_buf_writer};
use std::collections::HashMap;
use std::io::Write;

/// Files written for an output prefix
pub struct OutputFiles {
    pub integrated: String,
    pub cells: String,
    pub features: String,
    pub anchors: String,
    pub report: String,
}

impl OutputFiles {
    pub fn new(prefix: &str) -> Self {
        Self {
            integrated: format!("{}.integrated.tsv.gz", prefix),
            cells: format!("{}.cells.tsv.gz", prefix),
            features: format!("{}.features.tsv.gz", prefix),
            anchors: format!("{}.anchors.tsv.gz", prefix),
            report: format!("{}.report.json", prefix),
        }
    }
}

/// Write every table of a finished run under `prefix`
pub fn write_outputs(prefix: &str, out: &PipelineOutput) -> anyhow::Result<OutputFiles> {
    let files = OutputFiles::new(prefix);
    mkdir(&files.report)?;

    write_integrated(&files.integrated, out)?;
    write_cells(&files.cells, out)?;
    write_features(&files.features, out)?;
    write_anchors(&files.anchors, out)?;

    let mut writer = open_buf_writer(&files.report)?;
    serde_json::to_writer_pretty(&mut writer, &out.report)?;
    writer.flush()?;

    info!("wrote outputs: {}.*", prefix);
    Ok(files)
}

/// features x cells with a header of cell identifiers
fn write_integrated(file: &str, out: &PipelineOutput) -> anyhow::Result<()> {
    let x = &out.integrated;
    let mut buf = open_buf_writer(file)?;

    write!(buf, "feature")?;
    for c in x.cells.iter() {
        write!(buf, "\t{}", c)?;
    }
    writeln!(buf)?;

    for (i, f) in x.features.iter().enumerate() {
        write!(buf, "{}", f)?;
        for j in 0..x.values.ncols() {
            write!(buf, "\t{}", x.values[(i, j)])?;
        }
        writeln!(buf)?;
    }
    buf.flush()?;
    info!("wrote {} x {} integrated values: {}", x.features.len(), x.num_cells(), file);
    Ok(())
}

fn write_cells(file: &str, out: &PipelineOutput) -> anyhow::Result<()> {
    let records = out
        .merged
        .cells()
        .iter()
        .map(|c| (&*c.id, c))
        .collect::<HashMap<_, _>>();
    let samples = out.merged.samples();
    let pca = &out.embeddings.pca;
    let umap = &out.embeddings.umap;

    let mut buf = open_buf_writer(file)?;
    write!(
        buf,
        "cell\tbarcode\tsample\tn_genes\ttotal_counts\tmito_fraction\tdoublet_score\tlevel1\tlevel2\tlevel3"
    )?;
    for k in 0..pca.ncols() {
        write!(buf, "\tPC_{}", k + 1)?;
    }
    writeln!(buf, "\tUMAP_1\tUMAP_2")?;

    for (j, id) in out.integrated.cells.iter().enumerate() {
        let rec = records
            .get(&**id)
            .ok_or_else(|| anyhow::anyhow!("cell {} is not in the merged dataset", id))?;
        let labels = &out.labels[j];
        let doublet_score = rec
            .doublet
            .map(|d| d.score.to_string())
            .unwrap_or_else(|| "NA".to_string());

        write!(
            buf,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            id,
            rec.barcode,
            samples[rec.sample],
            rec.qc.n_genes,
            rec.qc.total_counts,
            rec.qc.mito_fraction,
            doublet_score,
            labels.level1,
            labels.level2,
            labels.level3
        )?;
        for k in 0..pca.ncols() {
            write!(buf, "\t{}", pca[(j, k)])?;
        }
        writeln!(buf, "\t{}\t{}", umap[(j, 0)], umap[(j, 1)])?;
    }
    buf.flush()?;
    info!("wrote {} cells: {}", out.integrated.num_cells(), file);
    Ok(())
}

fn write_features(file: &str, out: &PipelineOutput) -> anyhow::Result<()> {
    let sel = &out.features;
    let mut buf = open_buf_writer(file)?;
    writeln!(buf, "feature\tfrequency\tmedian_rank")?;
    for ((f, n), r) in sel
        .selected_names
        .iter()
        .zip(sel.frequency.iter())
        .zip(sel.median_rank.iter())
    {
        writeln!(buf, "{}\t{}\t{}", f, n, r)?;
    }
    buf.flush()?;
    Ok(())
}

/// anchors with merged cell identifiers
fn write_anchors(file: &str, out: &PipelineOutput) -> anyhow::Result<()> {
    let by_sample = out.merged.cells_by_sample();
    let samples = out.merged.samples();
    let cells = out.merged.cells();
    let cell_id = |s: usize, j: usize| -> anyhow::Result<Box<str>> {
        by_sample
            .get(s)
            .and_then(|cols| cols.get(j))
            .map(|&k| cells[k].id.clone())
            .ok_or_else(|| anyhow::anyhow!("anchor cell {} of sample {} out of range", j, s))
    };

    let mut buf = open_buf_writer(file)?;
    writeln!(buf, "sample_a\tcell_a\tsample_b\tcell_b\tscore")?;
    for a in out.anchors.anchors.iter() {
        writeln!(
            buf,
            "{}\t{}\t{}\t{}\t{}",
            samples[a.sample_a],
            cell_id(a.sample_a, a.cell_a)?,
            samples[a.sample_b],
            cell_id(a.sample_b, a.cell_b)?,
            a.score
        )?;
    }
    buf.flush()?;
    info!("wrote {} anchors: {}", out.anchors.len(), file);
    Ok(())
}
