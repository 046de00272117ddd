pub mod clustering;
pub mod common_io;
pub mod dmatrix_rsvd;
pub mod dmatrix_util;
pub mod knn_graph;
pub mod knn_match;
pub mod mtx_io;
pub mod traits;
pub mod utils;
