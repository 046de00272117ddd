use crate::traits::*;
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::StandardNormal;

impl MatOps for DMatrix<f32> {
    type Mat = DMatrix<f32>;
    type Scalar = f32;

    fn normalize_columns_inplace(&mut self) {
        for mut x_j in self.column_iter_mut() {
            let denom = x_j.norm();
            if denom > 0. {
                x_j /= denom;
            }
        }
    }

    fn normalize_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.normalize_columns_inplace();
        ret
    }

    fn centre_rows_inplace(&mut self) {
        let nn = self.ncols();
        if nn == 0 {
            return;
        }
        for i in 0..self.nrows() {
            let mu = self.row(i).sum() / nn as f32;
            self.row_mut(i).add_scalar_mut(-mu);
        }
    }

    fn scale_rows_inplace(&mut self, clip: Option<f32>) {
        let nn = self.ncols();
        if nn < 2 {
            self.centre_rows_inplace();
            return;
        }
        for i in 0..self.nrows() {
            let mut x_i = self.row_mut(i);
            let mu = x_i.sum() / nn as f32;
            x_i.add_scalar_mut(-mu);
            let sd = (x_i.norm_squared() / (nn - 1) as f32).sqrt();
            if sd > 0. {
                x_i /= sd;
            }
            if let Some(c) = clip {
                x_i.apply(|x| *x = x.clamp(-c, c));
            }
        }
    }

    fn scale_rows(&self, clip: Option<f32>) -> Self::Mat {
        let mut ret = self.clone();
        ret.scale_rows_inplace(clip);
        ret
    }
}

impl SampleOps for DMatrix<f32> {
    type Mat = DMatrix<f32>;

    fn runif<R: Rng>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat {
        DMatrix::from_fn(dd, nn, |_, _| rng.random::<f32>())
    }

    fn rnorm<R: Rng>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat {
        DMatrix::from_fn(dd, nn, |_, _| rng.sample::<f32, _>(StandardNormal))
    }
}

/// Squared Euclidean distance between column `i` of `xx` and column
/// `j` of `yy`
pub fn column_sq_distance(xx: &DMatrix<f32>, i: usize, yy: &DMatrix<f32>, j: usize) -> f32 {
    xx.column(i)
        .iter()
        .zip(yy.column(j).iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum()
}

/// Pearson correlation between two slices; zero when either side has
/// no variance
pub fn pearson_correlation(xx: &[f32], yy: &[f32]) -> f32 {
    let nn = xx.len().min(yy.len());
    if nn < 2 {
        return 0.;
    }
    let mx = xx[..nn].iter().sum::<f32>() / nn as f32;
    let my = yy[..nn].iter().sum::<f32>() / nn as f32;
    let (mut sxy, mut sxx, mut syy) = (0_f32, 0_f32, 0_f32);
    for (x, y) in xx[..nn].iter().zip(yy[..nn].iter()) {
        let dx = x - mx;
        let dy = y - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0. || syy <= 0. {
        return 0.;
    }
    sxy / (sxx.sqrt() * syy.sqrt())
}
