/// Failures that callers may need to tell apart.
///
/// Stages return `anyhow::Result` and attach context (stage, sample and
/// parameter values); the kind is recovered with
/// `err.downcast_ref::<PipelineError>()`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// input files absent or malformed
    #[error("missing data for sample `{sample}`: {reason}")]
    MissingData { sample: Box<str>, reason: String },

    /// non-unique cell identifiers after merging
    #[error("cell identifier `{cell}` occurs in samples `{first}` and `{second}`")]
    IdentifierCollision {
        cell: Box<str>,
        first: Box<str>,
        second: Box<str>,
    },

    /// too few cells or genes to fit a stage's model
    #[error("[{stage}] insufficient data in sample `{sample}`: {reason}")]
    InsufficientData {
        stage: &'static str,
        sample: Box<str>,
        reason: String,
    },

    /// the cell-type model is missing or incompatible
    #[error("cell-type model `{model}` unavailable: {reason}")]
    ModelUnavailable { model: Box<str>, reason: String },

    /// a sample pair shares no anchors; recovered by pass-through
    #[error("no anchors between samples `{first}` and `{second}`: {reason}")]
    DegenerateAnchor {
        first: Box<str>,
        second: Box<str>,
        reason: String,
    },
}

impl PipelineError {
    /// Find a `PipelineError` anywhere in an `anyhow` chain
    pub fn find(err: &anyhow::Error) -> Option<&PipelineError> {
        err.chain().find_map(|e| e.downcast_ref::<PipelineError>())
    }
}
