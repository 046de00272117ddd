use lentil::config::PipelineConfig;
use lentil::output::write_outputs;
use lentil::pipeline::{run_pipeline, SampleInput};
use lentil::predictor::LocalModelRegistry;

use clap::Args;
use log::info;
use rayon::ThreadPoolBuilder;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(required = true, help = "Sample directories, `NAME=DIR` or `DIR`")]
    samples: Vec<Box<str>>,

    #[arg(short, long, required = true, help = "Output file prefix")]
    out: Box<str>,

    #[arg(
        short,
        long,
        help = "JSON configuration",
        long_help = "JSON configuration file.\n\
                     Missing sections and fields keep their defaults; \
                     see `lentil default-config`."
    )]
    config: Option<Box<str>>,

    #[arg(long, help = "Random seed for every randomized stage")]
    seed: Option<u64>,

    #[arg(long, help = "Cell-type model id")]
    model: Option<Box<str>>,

    #[arg(long, help = "Directory of `<id>.json` cell-type models")]
    registry: Option<Box<str>>,

    #[arg(long, help = "Cache directory for fetched models")]
    cache: Option<Box<str>>,

    #[arg(long, help = "Number of threads (default: all logical CPUs)")]
    threads: Option<usize>,

    #[arg(long, help = "Number of integration features")]
    n_features: Option<usize>,

    #[arg(long, help = "Number of principal components")]
    n_pcs: Option<usize>,
}

pub fn run_integrate(args: &RunArgs) -> anyhow::Result<()> {
    let threads = args.threads.unwrap_or_else(num_cpus::get).max(1);
    ThreadPoolBuilder::new().num_threads(threads).build_global()?;
    info!("will use {} threads", rayon::current_num_threads());

    let mut cfg = match args.config.as_ref() {
        Some(file) => PipelineConfig::from_json_file(Path::new(&**file))?,
        None => PipelineConfig::default(),
    };
    if let Some(seed) = args.seed {
        cfg.set_seed(seed);
    }
    if let Some(model) = args.model.as_ref() {
        cfg.annotation.model = model.clone();
    }
    if let Some(dir) = args.registry.as_ref() {
        cfg.annotation.registry = PathBuf::from(&**dir);
    }
    if let Some(dir) = args.cache.as_ref() {
        cfg.annotation.cache = PathBuf::from(&**dir);
    }
    if let Some(n) = args.n_features {
        cfg.integration.n_features = n;
    }
    if let Some(n) = args.n_pcs {
        cfg.reduction.n_pcs = n;
    }

    let inputs = args
        .samples
        .iter()
        .map(|x| SampleInput::parse(x))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let registry = LocalModelRegistry::from_config(&cfg.annotation);
    let out = run_pipeline(&inputs, &cfg, &registry)?;
    write_outputs(&args.out, &out)?;

    info!("done");
    Ok(())
}
