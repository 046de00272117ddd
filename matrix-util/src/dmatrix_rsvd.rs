use crate::traits::SampleOps;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;

type Mat = DMatrix<f32>;
type DVec = DVector<f32>;

const OVERSAMPLE: usize = 10;
const DEFAULT_ITER: usize = 4;

/// A matrix that is only accessed through products, so that we can
/// decompose `X^T Y` and similar operators without forming them.
pub trait LinearOperator: Sync {
    fn nrows(&self) -> usize;
    fn ncols(&self) -> usize;
    /// `A * Q`
    fn apply(&self, qq: &Mat) -> Mat;
    /// `A^T * Q`
    fn apply_transpose(&self, qq: &Mat) -> Mat;
}

impl LinearOperator for Mat {
    fn nrows(&self) -> usize {
        self.nrows()
    }
    fn ncols(&self) -> usize {
        self.ncols()
    }
    fn apply(&self, qq: &Mat) -> Mat {
        self * qq
    }
    fn apply_transpose(&self, qq: &Mat) -> Mat {
        self.tr_mul(qq)
    }
}

/// Implicit cross product `X^T Y` of two feature-by-observation
/// matrices sharing the same rows
pub struct CrossProduct<'a> {
    pub xx: &'a Mat,
    pub yy: &'a Mat,
}

impl LinearOperator for CrossProduct<'_> {
    fn nrows(&self) -> usize {
        self.xx.ncols()
    }
    fn ncols(&self) -> usize {
        self.yy.ncols()
    }
    fn apply(&self, qq: &Mat) -> Mat {
        self.xx.tr_mul(&(self.yy * qq))
    }
    fn apply_transpose(&self, qq: &Mat) -> Mat {
        self.yy.tr_mul(&(self.xx * qq))
    }
}

pub trait RSVD {
    /// Randomized SVD returning `(U, d, V)`
    /// * `rank` - number of components
    /// * `seed` - random seed for the sketching matrix
    fn rsvd(&self, rank: usize, seed: u64) -> anyhow::Result<(Mat, DVec, Mat)>;
}

impl<A: LinearOperator> RSVD for A {
    fn rsvd(&self, rank: usize, seed: u64) -> anyhow::Result<(Mat, DVec, Mat)> {
        let mut rsvd = RandomizedSVD::new(rank, DEFAULT_ITER, seed);
        rsvd.compute(self)?;
        Ok((
            rsvd.matrix_u().clone(),
            rsvd.singular_values().clone(),
            rsvd.matrix_v().clone(),
        ))
    }
}

/// Randomized SVD
///
/// Implement Alg 4.4 of Halko et al. (2009) with re-orthogonalized
/// subspace iterations. The Gaussian sketch is drawn from a seeded
/// generator.
pub struct RandomizedSVD {
    max_rank: usize,
    iter: usize,
    seed: u64,
    u_vectors: Mat,
    singular_values: DVec,
    v_vectors: Mat,
}

impl RandomizedSVD {
    pub fn new(max_rank: usize, iter: usize, seed: u64) -> Self {
        Self {
            max_rank,
            iter,
            seed,
            u_vectors: Mat::zeros(0, 0),
            singular_values: DVec::zeros(0),
            v_vectors: Mat::zeros(0, 0),
        }
    }

    pub fn matrix_u(&self) -> &Mat {
        &self.u_vectors
    }

    pub fn matrix_v(&self) -> &Mat {
        &self.v_vectors
    }

    pub fn singular_values(&self) -> &DVec {
        &self.singular_values
    }

    pub fn compute<A: LinearOperator + ?Sized>(&mut self, op: &A) -> anyhow::Result<()> {
        let nr = op.nrows();
        let nc = op.ncols();
        let full = nr.min(nc);

        if full == 0 {
            anyhow::bail!("empty operator [{} x {}]", nr, nc);
        }

        let rank = if self.max_rank > 0 {
            self.max_rank.min(full)
        } else {
            full
        };
        let ncomp = (rank + OVERSAMPLE).min(full);

        let mut rng = StdRng::seed_from_u64(self.seed);
        let omega = Mat::rnorm(nc, ncomp, &mut rng);
        let yy = op.apply(&omega);

        // nothing to find in a zero operator
        if yy.norm() <= f32::EPSILON {
            self.u_vectors = Mat::zeros(nr, rank);
            self.singular_values = DVec::zeros(rank);
            self.v_vectors = Mat::zeros(nc, rank);
            return Ok(());
        }

        let mut qq = orthonormal_basis(yy);
        for _ in 0..self.iter {
            let zz = orthonormal_basis(op.apply_transpose(&qq));
            qq = orthonormal_basis(op.apply(&zz));
        }

        // B = Q^T A, computed as (A^T Q)^T
        let bb = op.apply_transpose(&qq).transpose();
        let svd = bb.svd(true, true);

        let (Some(svd_u), Some(svd_vt)) = (svd.u, svd.v_t) else {
            anyhow::bail!("SVD failed");
        };

        let dd = &svd.singular_values;
        let mut order = (0..dd.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| dd[b].total_cmp(&dd[a]).then(a.cmp(&b)));
        order.truncate(rank);

        let uu_small = svd_u.select_columns(order.iter());
        self.u_vectors = &qq * uu_small;
        self.v_vectors = svd_vt.select_rows(order.iter()).transpose();
        self.singular_values = DVec::from_iterator(order.len(), order.iter().map(|&k| dd[k]));

        // fix signs so that repeated runs agree exactly
        for k in 0..order.len() {
            let u_k = self.u_vectors.column(k);
            let pivot = u_k.iamax();
            if u_k[pivot] < 0. {
                self.u_vectors.column_mut(k).neg_mut();
                self.v_vectors.column_mut(k).neg_mut();
            }
        }

        Ok(())
    }
}

fn orthonormal_basis(xx: Mat) -> Mat {
    xx.qr().q()
}
