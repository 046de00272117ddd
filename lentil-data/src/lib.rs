pub mod error; // typed pipeline failures
pub mod merge; // sample-prefixed merging and re-splitting
pub mod qc; // per-cell quality metrics and fixed thresholds
pub mod sample; // per-sample count matrices
pub mod simulate; // synthetic multi-sample data with ground truth
pub mod sparse_util; // CSC matrix helpers
pub mod tenx_io; // 10x-style matrix directories

pub use error::PipelineError;
pub use sample::{CellQc, DoubletCall, DoubletClass, Sample};
pub use sparse_util::CscMat;
