use lentil::quantifier::{CountCommand, QuantifyParams, Quantifier};

use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct QuantifyArgs {
    #[arg(long, required = true, help = "Sample id")]
    id: Box<str>,

    #[arg(long, required = true, value_delimiter = ',', help = "FASTQ directories (comma separated)")]
    fastqs: Vec<Box<str>>,

    #[arg(long, required = true, help = "Transcriptome reference directory")]
    transcriptome: Box<str>,

    #[arg(short, long, default_value = ".", help = "Directory to run in")]
    out: Box<str>,

    #[arg(long, default_value = "cellranger", help = "Count tool executable")]
    cellranger: Box<str>,

    #[arg(long, help = "Maximum cores of the count tool")]
    localcores: Option<usize>,

    #[arg(long, help = "Maximum memory (GB) of the count tool")]
    localmem: Option<usize>,
}

pub fn run_quantify(args: &QuantifyArgs) -> anyhow::Result<()> {
    let params = QuantifyParams {
        sample_id: args.id.clone(),
        fastq_dirs: args.fastqs.iter().map(|x| PathBuf::from(&**x)).collect(),
        transcriptome: PathBuf::from(&*args.transcriptome),
        output_root: PathBuf::from(&*args.out),
        local_cores: args.localcores,
        local_mem_gb: args.localmem,
    };

    let tool = CountCommand::new(&PathBuf::from(&*args.cellranger));
    let matrix_dir = tool.run(&params)?;
    println!("{}={}", params.sample_id, matrix_dir.display());
    Ok(())
}
