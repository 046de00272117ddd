pub use log::{info, warn};

pub type Mat = nalgebra::DMatrix<f32>;
pub type DVec = nalgebra::DVector<f32>;

pub use lentil_data::{CscMat, PipelineError, Sample};
pub use matrix_util::dmatrix_rsvd::{CrossProduct, RSVD};
pub use matrix_util::knn_match::{ColumnDict, ColumnDictArgs, MakeVecPoint};
pub use matrix_util::traits::MatOps;

pub use indicatif::ParallelProgressIterator;
pub use rayon::prelude::*;
