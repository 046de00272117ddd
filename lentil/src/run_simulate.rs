use lentil::predictor::HierarchicalCentroidModel;
use lentil_data::simulate::{simulate_samples, SimArgs};

use clap::Args;
use log::info;
use matrix_util::common_io::{mkdir, open_buf_writer};
use std::io::Write;
use std::path::Path;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(short, long, required = true, help = "Output directory")]
    out: Box<str>,

    #[arg(long, default_value_t = 4, help = "Number of samples")]
    samples: usize,

    #[arg(long, default_value_t = 500, help = "Cells per sample")]
    cells: usize,

    #[arg(long, default_value_t = 2000, help = "Number of genes")]
    genes: usize,

    #[arg(long, default_value_t = 4, help = "Cell types per sample")]
    cell_types: usize,

    #[arg(long, default_value_t = 0.05, help = "Fraction of doublets")]
    doublet_rate: f32,

    #[arg(long, default_value_t = 0.1, help = "Fraction of cells failing QC")]
    qc_violation_rate: f32,

    #[arg(long, default_value_t = 0.3, help = "Log-scale sd of per-sample gene effects")]
    batch_sd: f32,

    #[arg(long, default_value_t = false, help = "Give every sample its own cell types and marker genes")]
    disjoint: bool,

    #[arg(long, default_value = "reference", help = "Id of the reference model to write")]
    model_id: Box<str>,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,
}

/// Write `{out}/{sample}` matrix directories, `{out}/{sample}.truth.tsv.gz`
/// and `{out}/models/{model_id}.json`
pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    let sim_args = SimArgs {
        samples: args.samples,
        cells_per_sample: args.cells,
        genes: args.genes,
        cell_types: args.cell_types,
        doublet_rate: args.doublet_rate,
        qc_violation_rate: args.qc_violation_rate,
        batch_sd: args.batch_sd,
        disjoint: args.disjoint,
        rseed: args.seed,
        ..SimArgs::default()
    };

    let out_dir = Path::new(&*args.out);
    let sim = simulate_samples(&sim_args)?;
    sim.write_tenx_dirs(out_dir)?;

    for s in sim.samples.iter() {
        let file = out_dir.join(format!("{}.truth.tsv.gz", s.name));
        let file = file.to_str().ok_or(anyhow::anyhow!("non-UTF-8 path"))?;
        mkdir(file)?;
        let mut buf = open_buf_writer(file)?;
        for (b, k) in s.barcodes.iter().zip(s.kinds.iter()) {
            writeln!(buf, "{}\t{:?}", b, k)?;
        }
        buf.flush()?;
    }

    let depth = (sim_args.depth.0 + sim_args.depth.1) / 2.;
    let model = HierarchicalCentroidModel::from_profiles(
        &args.model_id,
        "simulated cell types",
        &sim.gene_names,
        &sim.type_names,
        &sim.type_profiles,
        depth,
    )?;
    model.to_json_file(&out_dir.join("models").join(format!("{}.json", args.model_id)))?;

    info!(
        "simulated {} samples into {}",
        sim.samples.len(),
        out_dir.display()
    );
    Ok(())
}
