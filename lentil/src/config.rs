use crate::anchors::IntegrationConfig;
use crate::dim_reduce::ReductionConfig;
use crate::doublet::DoubletConfig;
use crate::normalize::NormalizeConfig;
use crate::predictor::AnnotationConfig;

use anyhow::Context;
use lentil_data::qc::QcThresholds;
use lentil_data::tenx_io::LoaderArgs;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Every tunable of a pipeline run, one section per stage.
///
/// Missing sections and fields take their defaults, so a partial JSON
/// file is enough to override a few values.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub loader: LoaderArgs,
    pub doublet: DoubletConfig,
    pub qc: QcThresholds,
    pub normalize: NormalizeConfig,
    pub integration: IntegrationConfig,
    pub reduction: ReductionConfig,
    pub annotation: AnnotationConfig,
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn to_json_string(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Use one seed for every randomized stage
    pub fn set_seed(&mut self, seed: u64) {
        self.doublet.seed = seed;
        self.integration.seed = seed;
        self.reduction.seed = seed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() -> anyhow::Result<()> {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{ "qc": { "max_mito_fraction": 0.1 }, "reduction": { "n_pcs": 10 } }"#)?;
        assert_eq!(cfg.qc.max_mito_fraction, 0.1);
        assert_eq!(cfg.qc.min_genes, 200);
        assert_eq!(cfg.reduction.n_pcs, 10);
        assert_eq!(cfg.integration.n_features, 3000);
        assert_eq!(cfg.normalize.n_hvg, 3000);
        assert_eq!(cfg.loader.min_cells, 3);
        Ok(())
    }

    #[test]
    fn default_config_round_trips() -> anyhow::Result<()> {
        let mut cfg = PipelineConfig::default();
        cfg.set_seed(7);
        let back: PipelineConfig = serde_json::from_str(&cfg.to_json_string()?)?;
        assert_eq!(back.doublet.seed, 7);
        assert_eq!(back.reduction.seed, 7);
        assert_eq!(back.annotation.model, cfg.annotation.model);
        Ok(())
    }
}
