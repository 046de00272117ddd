use rand::Rng;

/// Normalize, centre or standardize a dense matrix.
///
/// Rows are features (genes), columns are observations (cells)
/// throughout this crate.
pub trait MatOps {
    type Mat;
    type Scalar;

    /// make every column unit-length (zero columns stay zero)
    fn normalize_columns_inplace(&mut self);
    fn normalize_columns(&self) -> Self::Mat;

    /// subtract the row mean from each row
    fn centre_rows_inplace(&mut self);

    /// standardize each row to mean zero and unit standard deviation
    ///
    /// * `clip` - optionally clamp the standardized values to `[-clip, clip]`
    ///
    /// Rows with zero variance are only centred.
    fn scale_rows_inplace(&mut self, clip: Option<Self::Scalar>);
    fn scale_rows(&self, clip: Option<Self::Scalar>) -> Self::Mat;
}

/// Sample random matrices from a caller-provided generator so that
/// every randomized algorithm stays reproducible given a seed.
pub trait SampleOps {
    type Mat;

    /// Sample a matrix from a uniform distribution `U(0,1)`
    fn runif<R: Rng>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat;

    /// Sample a matrix from a normal distribution `N(0,1)`
    fn rnorm<R: Rng>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat;
}
