use crate::common::*;

use lentil_data::tenx_io::{locate_tenx_files, FILTERED_MATRIX_SUBDIR};
use std::path::{Path, PathBuf};
use std::process::Command;

/// One quantification run
#[derive(Clone, Debug)]
pub struct QuantifyParams {
    pub sample_id: Box<str>,
    pub fastq_dirs: Vec<PathBuf>,
    pub transcriptome: PathBuf,
    /// runs land in `output_root/<sample_id>`
    pub output_root: PathBuf,
    pub local_cores: Option<usize>,
    pub local_mem_gb: Option<usize>,
}

/// Turns sequencing reads into a count matrix directory
pub trait Quantifier {
    /// Directory holding `matrix.mtx`, `features.tsv` and `barcodes.tsv`
    fn run(&self, params: &QuantifyParams) -> anyhow::Result<PathBuf>;
}

/// A `cellranger count`-compatible executable
#[derive(Clone, Debug)]
pub struct CountCommand {
    pub executable: PathBuf,
    /// arguments placed before `count`
    pub leading_args: Vec<String>,
}

impl CountCommand {
    pub fn new(executable: &Path) -> Self {
        Self {
            executable: executable.to_path_buf(),
            leading_args: vec![],
        }
    }

    pub fn command_args(&self, params: &QuantifyParams) -> Vec<String> {
        let fastqs = params
            .fastq_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut args = self.leading_args.clone();
        args.extend([
            "count".to_string(),
            format!("--id={}", params.sample_id),
            format!("--fastqs={}", fastqs),
            format!("--sample={}", params.sample_id),
            format!("--transcriptome={}", params.transcriptome.display()),
        ]);
        if let Some(cores) = params.local_cores {
            args.push(format!("--localcores={}", cores));
        }
        if let Some(mem) = params.local_mem_gb {
            args.push(format!("--localmem={}", mem));
        }
        args
    }
}

impl Quantifier for CountCommand {
    fn run(&self, params: &QuantifyParams) -> anyhow::Result<PathBuf> {
        if params.fastq_dirs.is_empty() {
            anyhow::bail!("no FASTQ directories for {}", params.sample_id);
        }
        std::fs::create_dir_all(&params.output_root)?;

        let args = self.command_args(params);
        info!(
            "[quantify] {} {} (in {})",
            self.executable.display(),
            args.join(" "),
            params.output_root.display()
        );

        let output = Command::new(&self.executable)
            .args(&args)
            .current_dir(&params.output_root)
            .output()
            .map_err(|e| anyhow::anyhow!("cannot run {}: {}", self.executable.display(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} count failed for {} ({}): {}",
                self.executable.display(),
                params.sample_id,
                output.status,
                stderr.trim()
            );
        }

        let matrix_dir = params
            .output_root
            .join(&*params.sample_id)
            .join(FILTERED_MATRIX_SUBDIR);

        if locate_tenx_files(&matrix_dir).is_none() {
            return Err(PipelineError::MissingData {
                sample: params.sample_id.clone(),
                reason: format!("no count matrix under {}", matrix_dir.display()),
            }
            .into());
        }

        info!("[quantify] {}: {}", params.sample_id, matrix_dir.display());
        Ok(matrix_dir)
    }
}
