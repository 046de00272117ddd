pub mod anchors; // pairwise CCA + mutual nearest neighbour anchors
pub mod common;
pub mod config;
pub mod dim_reduce; // PCA and a 2-D neighbour layout
pub mod doublet; // simulated-doublet scoring
pub mod feature_selection; // shared integration features
pub mod integrate; // anchor-weighted batch correction
pub mod normalize; // regularized negative binomial residuals
pub mod output;
pub mod pipeline;
pub mod predictor; // hierarchical cell-type labels
pub mod quantifier; // external count tool
