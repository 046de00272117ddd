mod run_integrate;
mod run_models;
mod run_quantify;
mod run_simulate;

use run_integrate::*;
use run_models::*;
use run_quantify::*;
use run_simulate::*;

use clap::{Parser, Subcommand};

/// LENTIL
#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Multi-sample single-cell RNA-seq integration and annotation\n\n\
                  Loads one count matrix directory per sample, removes doublets and \
                  low-quality cells, normalizes every sample, finds anchors between \
                  samples, corrects batch effects, embeds the integrated cells and \
                  assigns hierarchical cell-type labels.",
    term_width = 80
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,

    #[arg(short, long, global = true, help = "Verbosity.")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Run the full pipeline",
        long_about = "Run the full pipeline on sample directories.\n\n\
                      Each sample is `NAME=DIR` or `DIR` (named after the directory). \
                      A directory holds matrix.mtx, features.tsv and barcodes.tsv \
                      (optionally gzipped), directly or under outs/filtered_feature_bc_matrix.\n\n\
                      Outputs:\n\
                      - {out}.integrated.tsv.gz: integrated features x cells\n\
                      - {out}.cells.tsv.gz: per-cell QC, doublet score, labels, PCs and layout\n\
                      - {out}.features.tsv.gz: integration features\n\
                      - {out}.anchors.tsv.gz: anchors between samples\n\
                      - {out}.report.json: per-stage summary and configuration"
    )]
    Run(RunArgs),

    #[command(about = "Simulate samples with known doublets and QC failures")]
    Simulate(SimulateArgs),

    #[command(about = "List cell-type models in a registry")]
    Models(ModelsArgs),

    #[command(about = "Run a cellranger-compatible count tool on FASTQ files")]
    Quantify(QuantifyArgs),

    #[command(about = "Print the default configuration as JSON")]
    DefaultConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match &cli.commands {
        Commands::Run(args) => {
            run_integrate(args)?;
        }
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
        Commands::Models(args) => {
            run_models(args)?;
        }
        Commands::Quantify(args) => {
            run_quantify(args)?;
        }
        Commands::DefaultConfig => {
            print_default_config()?;
        }
    }

    Ok(())
}
