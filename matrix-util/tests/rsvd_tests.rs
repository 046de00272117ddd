use approx::assert_abs_diff_eq;
use matrix_util::dmatrix_rsvd::{CrossProduct, RSVD};
use matrix_util::traits::SampleOps;
use nalgebra::DMatrix;
use rand::SeedableRng;

#[test]
fn dmatrix_rsvd_identity() -> anyhow::Result<()> {
    let mut xx = DMatrix::<f32>::zeros(8, 8);
    xx.fill_with_identity();

    let (uu, dd, vv) = xx.rsvd(3, 1)?;

    assert_eq!(uu.ncols(), 3);
    assert_eq!(vv.ncols(), 3);
    for k in 0..3 {
        assert_abs_diff_eq!(dd[k], 1.0, epsilon = 1e-4);
    }
    assert_abs_diff_eq!(uu.transpose() * &uu, DMatrix::identity(3, 3), epsilon = 1e-4);
    Ok(())
}

#[test]
fn dmatrix_rsvd_low_rank_reconstruction() -> anyhow::Result<()> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(3);
    let aa = DMatrix::<f32>::rnorm(60, 4, &mut rng);
    let bb = DMatrix::<f32>::rnorm(4, 40, &mut rng);
    let xx = &aa * &bb;

    let (uu, dd, vv) = xx.rsvd(4, 42)?;
    let xx_hat = &uu * DMatrix::from_diagonal(&dd) * vv.transpose();

    assert_abs_diff_eq!(xx, xx_hat, epsilon = 1e-2);
    for k in 1..4 {
        assert!(dd[k - 1] >= dd[k]);
    }
    Ok(())
}

#[test]
fn rsvd_is_reproducible_with_seed() -> anyhow::Result<()> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(5);
    let xx = DMatrix::<f32>::rnorm(30, 50, &mut rng);

    let (u1, d1, v1) = xx.rsvd(5, 7)?;
    let (u2, d2, v2) = xx.rsvd(5, 7)?;
    assert_eq!(u1, u2);
    assert_eq!(d1, d2);
    assert_eq!(v1, v2);
    Ok(())
}

#[test]
fn cross_product_operator_matches_explicit() -> anyhow::Result<()> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(9);
    let xx = DMatrix::<f32>::rnorm(20, 15, &mut rng);
    let yy = DMatrix::<f32>::rnorm(20, 12, &mut rng);

    let explicit = xx.tr_mul(&yy);
    let (_, d_exp, _) = explicit.rsvd(12, 1)?;
    let (u, d_imp, v) = CrossProduct { xx: &xx, yy: &yy }.rsvd(12, 1)?;

    assert_eq!(u.nrows(), 15);
    assert_eq!(v.nrows(), 12);
    assert_abs_diff_eq!(d_exp, d_imp, epsilon = 1e-3);
    Ok(())
}

#[test]
fn zero_operator_has_zero_spectrum() -> anyhow::Result<()> {
    let xx = DMatrix::<f32>::from_fn(10, 6, |i, _| if i < 5 { 1.0 } else { 0.0 });
    let yy = DMatrix::<f32>::from_fn(10, 4, |i, _| if i >= 5 { 1.0 } else { 0.0 });

    let (_, dd, _) = CrossProduct { xx: &xx, yy: &yy }.rsvd(3, 1)?;
    assert_eq!(dd.len(), 3);
    assert!(dd.iter().all(|&d| d == 0.0));
    Ok(())
}
