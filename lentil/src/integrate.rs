//! Anchor-weighted batch correction
//!
//! Samples join a growing reference one at a time. Each query cell is
//! moved by a weighted average of the differences between reference
//! and query anchor cells, weighting the anchors nearest to the cell in
//! the query's own PCA space.

use crate::anchors::{AnchorSet, IntegrationConfig};
use crate::common::*;

/// Batch-corrected features x cells over all samples, cells in
/// declared sample order
#[derive(Clone, Debug)]
pub struct IntegratedMatrix {
    pub features: Vec<Box<str>>,
    pub cells: Vec<Box<str>>,
    pub sample_of_cell: Vec<usize>,
    pub values: Mat,
    /// samples in the order they joined the reference
    pub order: Vec<usize>,
    /// whether each sample received a correction
    pub corrected: Vec<bool>,
}

impl IntegratedMatrix {
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }
}

/// Greedy integration order
///
/// The most similar pair (anchors over the smaller sample size) starts
/// the reference with its larger member; the sample most similar to the
/// current reference joins next. Samples sharing no anchors with the
/// reference come last, in declared order.
pub fn integration_order(sizes: &[usize], anchors: &AnchorSet) -> Vec<usize> {
    let ns = sizes.len();
    let similarity = |q: usize, refs: &[usize]| -> f32 {
        let shared = refs.iter().map(|&r| anchors.count_between(q, r)).sum::<usize>();
        let ref_size = refs.iter().map(|&r| sizes[r]).sum::<usize>();
        let denom = sizes[q].min(ref_size).max(1);
        shared as f32 / denom as f32
    };

    let mut best: Option<(f32, usize)> = None;
    for a in 0..ns {
        for b in (a + 1)..ns {
            let s = similarity(a, &[b]);
            if s > 0. && best.map(|(v, _)| s > v).unwrap_or(true) {
                let larger = if sizes[b] > sizes[a] { b } else { a };
                best = Some((s, larger));
            }
        }
    }

    let Some((_, first)) = best else {
        return (0..ns).collect();
    };

    let mut order = vec![first];
    let mut remaining = (0..ns).filter(|&s| s != first).collect::<Vec<_>>();
    while !remaining.is_empty() {
        let mut next: Option<(f32, usize)> = None;
        for (pos, &q) in remaining.iter().enumerate() {
            let s = similarity(q, &order);
            if s > 0. && next.map(|(v, _)| s > v).unwrap_or(true) {
                next = Some((s, pos));
            }
        }
        match next {
            Some((_, pos)) => order.push(remaining.remove(pos)),
            None => {
                order.append(&mut remaining);
            }
        }
    }
    order
}

/// Correct every sample against the reference built from the samples
/// before it in the integration order
///
/// * `features` - row names shared by all matrices
/// * `names` - sample names
/// * `cells` - cell identifiers of each sample
/// * `data` - features x cells per sample
/// * `anchors` - anchors with cell indices into `data`
///
/// The output holds exactly the input cells; samples without anchors to
/// the reference pass through unchanged.
pub fn integrate_samples(
    features: &[Box<str>],
    names: &[Box<str>],
    cells: &[Vec<Box<str>>],
    data: Vec<Mat>,
    anchors: &AnchorSet,
    cfg: &IntegrationConfig,
) -> anyhow::Result<IntegratedMatrix> {
    if names.len() != data.len() || cells.len() != data.len() {
        anyhow::bail!(
            "{} names, {} cell lists and {} matrices",
            names.len(),
            cells.len(),
            data.len()
        );
    }
    for (s, x) in data.iter().enumerate() {
        if x.nrows() != features.len() || x.ncols() != cells[s].len() {
            anyhow::bail!(
                "sample {}: [{} x {}] matrix for {} features and {} cells",
                names[s],
                x.nrows(),
                x.ncols(),
                features.len(),
                cells[s].len()
            );
        }
    }

    let sizes = data.iter().map(|x| x.ncols()).collect::<Vec<_>>();
    let order = integration_order(&sizes, anchors);
    let mut current = data;
    let mut corrected = vec![false; names.len()];

    if let Some(&first) = order.first() {
        info!("[integrate] reference starts from {}", names[first]);
    }

    for (pos, &q) in order.iter().enumerate().skip(1) {
        let reference = &order[..pos];
        let pairs = query_anchor_pairs(q, reference, anchors);

        if pairs.is_empty() {
            info!(
                "[integrate] {}: no anchors to the reference, passed through",
                names[q]
            );
            continue;
        }

        let delta = correction(q, &pairs, &current, cfg)?;
        if delta.iter().all(|&x| x == 0.) {
            info!(
                "[integrate] {}: {} anchors carry no weight, passed through",
                names[q],
                pairs.len()
            );
            continue;
        }
        current[q] += delta;
        corrected[q] = true;

        info!(
            "[integrate] {}: corrected with {} anchors against {} samples",
            names[q],
            pairs.len(),
            reference.len()
        );
    }

    let ntot = sizes.iter().sum::<usize>();
    let mut values = Mat::zeros(features.len(), ntot);
    let mut offset = 0;
    for x in current.iter() {
        values.columns_mut(offset, x.ncols()).copy_from(x);
        offset += x.ncols();
    }

    Ok(IntegratedMatrix {
        features: features.to_vec(),
        cells: cells.iter().flatten().cloned().collect(),
        sample_of_cell: cells
            .iter()
            .enumerate()
            .flat_map(|(s, c)| std::iter::repeat(s).take(c.len()))
            .collect(),
        values,
        order,
        corrected,
    })
}

struct AnchorPair {
    ref_sample: usize,
    ref_cell: usize,
    query_cell: usize,
    score: f32,
}

fn query_anchor_pairs(q: usize, reference: &[usize], anchors: &AnchorSet) -> Vec<AnchorPair> {
    anchors
        .anchors
        .iter()
        .filter_map(|x| {
            if x.sample_a == q && reference.contains(&x.sample_b) {
                Some(AnchorPair {
                    ref_sample: x.sample_b,
                    ref_cell: x.cell_b,
                    query_cell: x.cell_a,
                    score: x.score,
                })
            } else if x.sample_b == q && reference.contains(&x.sample_a) {
                Some(AnchorPair {
                    ref_sample: x.sample_a,
                    ref_cell: x.cell_a,
                    query_cell: x.cell_b,
                    score: x.score,
                })
            } else {
                None
            }
        })
        .collect()
}

/// features x query cells correction
fn correction(
    q: usize,
    pairs: &[AnchorPair],
    current: &[Mat],
    cfg: &IntegrationConfig,
) -> anyhow::Result<Mat> {
    let xq = &current[q];
    let (nf, nq) = (xq.nrows(), xq.ncols());
    let na = pairs.len();
    if nq == 0 {
        return Ok(Mat::zeros(nf, 0));
    }

    // reference minus query at every anchor
    let diff = Mat::from_fn(nf, na, |f, k| {
        let p = &pairs[k];
        current[p.ref_sample][(f, p.ref_cell)] - xq[(f, p.query_cell)]
    });

    // query cells in the query's own PCA space
    let rank = cfg.dims.min(nf).min(nq).max(1);
    let (_, dd, vv) = xq.scale_rows(None).rsvd(rank, cfg.seed)?;
    let pcs = Mat::from_fn(dd.len(), nq, |r, j| vv[(j, r)] * dd[r]);

    let anchor_points = Mat::from_fn(pcs.nrows(), na, |r, k| pcs[(r, pairs[k].query_cell)]);
    let dict = ColumnDict::from_dmatrix_columns(&anchor_points, (0..na).collect::<Vec<usize>>(), &cfg.dict_args())?;
    let k_weight = cfg.k_weight.min(na).max(1);

    let columns = (0..nq)
        .into_par_iter()
        .progress_count(nq as u64)
        .map(|j| {
            let (nearest, distances) = dict.search_point(&pcs.column(j).to_vp(), k_weight);
            let scores = nearest.iter().map(|&k| pairs[k].score).collect::<Vec<_>>();
            let weights = anchor_weights(&distances, &scores, cfg.sd_weight);
            let mut delta = DVec::zeros(nf);
            for (&k, &w) in nearest.iter().zip(weights.iter()) {
                if w > 0. {
                    delta.axpy(w, &diff.column(k), 1.);
                }
            }
            delta
        })
        .collect::<Vec<_>>();

    Ok(Mat::from_columns(&columns))
}

/// `w = 1 - exp(-(1 - d / d_max) score / (2 / sd)^2)`, normalized to
/// sum to one (all zero if no anchor carries weight)
pub fn anchor_weights(distances: &[f32], scores: &[f32], sd: f32) -> Vec<f32> {
    let d_max = distances.iter().copied().fold(0_f32, f32::max);
    let denom = (2. / sd).powi(2);

    let mut weights = distances
        .iter()
        .zip(scores)
        .map(|(&d, &s)| {
            let dist_w = if d_max > 0. { 1. - d / d_max } else { 1. };
            1. - (-(dist_w * s) / denom).exp()
        })
        .collect::<Vec<_>>();

    let total = weights.iter().sum::<f32>();
    if total > 0. {
        weights.iter_mut().for_each(|w| *w /= total);
    } else {
        weights.iter_mut().for_each(|w| *w = 0.);
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchors::Anchor;
    use approx::assert_abs_diff_eq;

    fn anchor(a: usize, b: usize) -> Anchor {
        Anchor {
            sample_a: a,
            cell_a: 0,
            sample_b: b,
            cell_b: 0,
            score: 1.,
        }
    }

    #[test]
    fn weights_favour_close_anchors() {
        let w = anchor_weights(&[0.1, 0.5, 1.0], &[1., 1., 1.], 1.);
        assert_abs_diff_eq!(w.iter().sum::<f32>(), 1., epsilon = 1e-6);
        assert!(w[0] > w[1] && w[1] > w[2]);
        assert_eq!(w[2], 0.);
    }

    #[test]
    fn zero_shift_is_not_a_correction() -> anyhow::Result<()> {
        // the only anchor joins two cells with identical values
        let xa = Mat::from_row_slice(2, 3, &[1., 2., 3., 0., 1., 0.]);
        let xb = Mat::from_row_slice(2, 2, &[1., 5., 0., 2.]);
        let features: Vec<Box<str>> = vec!["g1".into(), "g2".into()];
        let names: Vec<Box<str>> = vec!["a".into(), "b".into()];
        let cells: Vec<Vec<Box<str>>> = vec![
            vec!["a_1".into(), "a_2".into(), "a_3".into()],
            vec!["b_1".into(), "b_2".into()],
        ];
        let mut set = AnchorSet::default();
        set.anchors.push(anchor(0, 1));

        let cfg = IntegrationConfig {
            dims: 2,
            ..Default::default()
        };
        let out = integrate_samples(&features, &names, &cells, vec![xa.clone(), xb.clone()], &set, &cfg)?;
        assert_eq!(out.corrected, vec![false, false]);
        assert_eq!(out.values.columns(0, 3), xa.columns(0, 3));
        assert_eq!(out.values.columns(3, 2), xb.columns(0, 2));
        Ok(())
    }

    #[test]
    fn order_starts_from_the_most_similar_pair() {
        let mut set = AnchorSet::default();
        set.anchors.extend((0..10).map(|_| anchor(1, 2)));
        set.anchors.extend((0..2).map(|_| anchor(0, 1)));
        let order = integration_order(&[100, 50, 80], &set);
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn unanchored_samples_come_last() {
        let mut set = AnchorSet::default();
        set.anchors.extend((0..5).map(|_| anchor(1, 3)));
        let order = integration_order(&[10, 10, 10, 20], &set);
        assert_eq!(order, vec![3, 1, 0, 2]);
        assert_eq!(integration_order(&[10, 10], &AnchorSet::default()), vec![0, 1]);
    }
}
