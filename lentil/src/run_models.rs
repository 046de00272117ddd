use lentil::config::PipelineConfig;
use lentil::predictor::{AnnotationConfig, CellTypePredictor, LocalModelRegistry};

use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ModelsArgs {
    #[arg(long, help = "Directory of `<id>.json` cell-type models")]
    registry: Option<Box<str>>,
}

pub fn run_models(args: &ModelsArgs) -> anyhow::Result<()> {
    let mut cfg = AnnotationConfig::default();
    if let Some(dir) = args.registry.as_ref() {
        cfg.registry = PathBuf::from(&**dir);
    }

    let models = LocalModelRegistry::from_config(&cfg).catalog()?;
    if models.is_empty() {
        log::warn!("no models in {}", cfg.registry.display());
    }
    for m in models {
        println!("{}\t{}", m.id, m.description);
    }
    Ok(())
}

pub fn print_default_config() -> anyhow::Result<()> {
    println!("{}", PipelineConfig::default().to_json_string()?);
    Ok(())
}
