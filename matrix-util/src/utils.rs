/// Split `0..ntot` into contiguous blocks of at most `block_size`
pub fn create_jobs(ntot: usize, block_size: usize) -> Vec<(usize, usize)> {
    let num_jobs = ntot.div_ceil(block_size);
    (0..num_jobs)
        .map(|b| {
            let lb: usize = b * block_size;
            let ub: usize = ((b + 1) * block_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}

/// Linear-interpolated quantile of unsorted values, `q` in [0, 1]
pub fn quantile_f32(values: &[f32], q: f32) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0., 1.) * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f32;
    sorted[lo] * (1. - frac) + sorted[hi] * frac
}

pub fn median_f32(values: &[f32]) -> f32 {
    quantile_f32(values, 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_cover_range() {
        let jobs = create_jobs(10, 4);
        assert_eq!(jobs, vec![(0, 4), (4, 8), (8, 10)]);
        assert!(create_jobs(0, 4).is_empty());
    }

    #[test]
    fn quantiles() {
        assert_eq!(median_f32(&[3., 1., 2.]), 2.);
        assert_eq!(median_f32(&[4., 1., 2., 3.]), 2.5);
        assert_eq!(quantile_f32(&[0., 10.], 0.9), 9.);
    }
}
