//! Cross-sample anchors
//!
//! For every unordered pair of samples the standardized residuals are
//! projected by canonical correlation analysis, computed as a truncated
//! SVD of the implicit operator `Xa^T Xb`. Mutual nearest neighbours in
//! the L2-normalized canonical space become candidate anchors, which
//! are then filtered in the space of the top-loading features and
//! scored by how much the two cells' neighbourhoods overlap.

use crate::common::*;

use matrix_util::utils::quantile_f32;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// shared features used for anchors and integration
    pub n_features: usize,
    /// optional allow-list of candidate features, one per line
    pub feature_list: Option<PathBuf>,
    /// canonical components
    pub dims: usize,
    /// neighbours searched for mutual pairs
    pub k_anchor: usize,
    /// neighbours in the feature space that must contain the partner
    pub k_filter: usize,
    /// neighbourhood size for anchor scores
    pub k_score: usize,
    /// anchors weighting each query cell
    pub k_weight: usize,
    /// top-loading features for filtering
    pub max_features: usize,
    /// Gaussian kernel width of the anchor weights
    pub sd_weight: f32,
    /// minimum neighbourhood overlap on each side of a retained anchor
    pub min_overlap: f32,
    /// exact search below this many cells, HNSW above
    pub exact_knn_below: usize,
    pub seed: u64,
    /// a pair is degenerate if its top canonical value is below this
    /// fraction of `|Xa| |Xb|`
    pub degenerate_tol: f32,
    /// feature shuffles of the second sample giving the null canonical value
    pub null_permutations: usize,
    /// a pair is degenerate unless its top canonical value exceeds the
    /// mean shuffled one by this factor
    pub min_null_ratio: f32,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            n_features: 3000,
            feature_list: None,
            dims: 30,
            k_anchor: 5,
            k_filter: 200,
            k_score: 30,
            k_weight: 100,
            max_features: 200,
            sd_weight: 1.,
            min_overlap: 0.05,
            exact_knn_below: matrix_util::knn_match::DEFAULT_EXACT_BELOW,
            seed: 42,
            degenerate_tol: 1e-6,
            null_permutations: 3,
            min_null_ratio: 2.,
        }
    }
}

impl IntegrationConfig {
    pub(crate) fn dict_args(&self) -> ColumnDictArgs {
        ColumnDictArgs {
            exact_below: self.exact_knn_below,
            seed: self.seed,
            ef_search: self.k_filter.max(self.k_weight).max(256),
        }
    }
}

/// Two cells from different samples asserted to be in the same state;
/// cell indices are columns of each sample's matrix
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Anchor {
    pub sample_a: usize,
    pub cell_a: usize,
    pub sample_b: usize,
    pub cell_b: usize,
    pub score: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PairSummary {
    pub sample_a: usize,
    pub sample_b: usize,
    pub n_anchors: usize,
    /// no correspondence; the pair is passed through
    pub degenerate: bool,
}

#[derive(Clone, Debug, Default)]
pub struct AnchorSet {
    pub anchors: Vec<Anchor>,
    pub pairs: Vec<PairSummary>,
}

impl AnchorSet {
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// anchors between two samples, in either order
    pub fn between(&self, s: usize, t: usize) -> impl Iterator<Item = &Anchor> {
        self.anchors.iter().filter(move |x| {
            (x.sample_a == s && x.sample_b == t) || (x.sample_a == t && x.sample_b == s)
        })
    }

    pub fn count_between(&self, s: usize, t: usize) -> usize {
        self.between(s, t).count()
    }
}

/// Find anchors for every unordered sample pair in parallel
///
/// * `names` - sample names, for diagnostics
/// * `data` - per-sample features x cells matrices over the same features
/// * `cfg` - anchor settings
///
/// A degenerate pair contributes no anchors and is logged; any other
/// failure aborts.
pub fn find_integration_anchors(
    names: &[Box<str>],
    data: &[Mat],
    cfg: &IntegrationConfig,
) -> anyhow::Result<AnchorSet> {
    if names.len() != data.len() {
        anyhow::bail!("{} sample names for {} matrices", names.len(), data.len());
    }
    if let Some(x) = data.iter().find(|x| x.nrows() != data[0].nrows()) {
        anyhow::bail!(
            "samples must share features: {} vs {} rows",
            x.nrows(),
            data[0].nrows()
        );
    }

    let scaled = data
        .par_iter()
        .map(|x| x.scale_rows(None))
        .collect::<Vec<_>>();

    let tasks = (0..data.len())
        .flat_map(|a| ((a + 1)..data.len()).map(move |b| (a, b)))
        .collect::<Vec<_>>();

    info!(
        "[anchors] {} sample pairs over {} features",
        tasks.len(),
        data.first().map(|x| x.nrows()).unwrap_or(0)
    );

    let partial = tasks
        .par_iter()
        .progress_count(tasks.len() as u64)
        .map(|&(a, b)| {
            let pair = PairData {
                a,
                b,
                raw_a: &data[a],
                raw_b: &data[b],
                xa: &scaled[a],
                xb: &scaled[b],
            };
            match pair.find_anchors(names, cfg) {
                Ok(anchors) => {
                    info!(
                        "[anchors] {} - {}: {} anchors",
                        names[a],
                        names[b],
                        anchors.len()
                    );
                    Ok((
                        PairSummary {
                            sample_a: a,
                            sample_b: b,
                            n_anchors: anchors.len(),
                            degenerate: false,
                        },
                        anchors,
                    ))
                }
                Err(err) => match PipelineError::find(&err) {
                    Some(PipelineError::DegenerateAnchor { .. }) => {
                        warn!("[anchors] {}; no correction for this pair", err);
                        Ok((
                            PairSummary {
                                sample_a: a,
                                sample_b: b,
                                n_anchors: 0,
                                degenerate: true,
                            },
                            vec![],
                        ))
                    }
                    _ => Err(err.context(format!(
                        "[anchors] samples {} and {} (dims {}, k_anchor {}, k_filter {}, k_score {})",
                        names[a], names[b], cfg.dims, cfg.k_anchor, cfg.k_filter, cfg.k_score
                    ))),
                },
            }
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut ret = AnchorSet::default();
    for (summary, anchors) in partial {
        ret.pairs.push(summary);
        ret.anchors.extend(anchors);
    }
    info!("[anchors] {} anchors in total", ret.anchors.len());
    Ok(ret)
}

struct PairData<'a> {
    a: usize,
    b: usize,
    raw_a: &'a Mat,
    raw_b: &'a Mat,
    xa: &'a Mat,
    xb: &'a Mat,
}

impl PairData<'_> {
    fn degenerate(&self, names: &[Box<str>], reason: String) -> anyhow::Error {
        PipelineError::DegenerateAnchor {
            first: names[self.a].clone(),
            second: names[self.b].clone(),
            reason,
        }
        .into()
    }

    fn find_anchors(&self, names: &[Box<str>], cfg: &IntegrationConfig) -> anyhow::Result<Vec<Anchor>> {
        let (na, nb) = (self.xa.ncols(), self.xb.ncols());
        if na < 2 || nb < 2 || self.xa.nrows() == 0 {
            return Err(self.degenerate(
                names,
                format!("{} x {} cells over {} features", na, nb, self.xa.nrows()),
            ));
        }

        let dims = cfg.dims.min(na).min(nb).max(1);
        let cca = CrossProduct {
            xx: self.xa,
            yy: self.xb,
        };
        let (uu, dd, vv) = cca.rsvd(dims, cfg.seed)?;

        let scale = self.xa.norm() * self.xb.norm();
        let top = dd.iter().copied().fold(0_f32, f32::max);
        if top <= cfg.degenerate_tol * scale || scale <= 0. {
            return Err(self.degenerate(
                names,
                format!(
                    "top canonical value {:.3e} <= {:.1e} x {:.3e}",
                    top, cfg.degenerate_tol, scale
                ),
            ));
        }

        // shared states must beat the same cells with shuffled features
        let null = self.null_canonical_value(dims, cfg)?;
        if top < cfg.min_null_ratio * null {
            return Err(self.degenerate(
                names,
                format!(
                    "top canonical value {:.3e} < {} x shuffled {:.3e}",
                    top, cfg.min_null_ratio, null
                ),
            ));
        }

        // cells as unit-length columns in the canonical space
        let ea = uu.transpose().normalize_columns();
        let eb = vv.transpose().normalize_columns();

        let args = cfg.dict_args();
        let dict_a = ColumnDict::from_dmatrix_columns(&ea, (0..na).collect::<Vec<usize>>(), &args)?;
        let dict_b = ColumnDict::from_dmatrix_columns(&eb, (0..nb).collect::<Vec<usize>>(), &args)?;

        let mnn = mutual_neighbours(&dict_a, &dict_b, cfg.k_anchor.max(1));
        let n_mnn = mnn.len();

        let features = top_loading_features(self.xa, self.xb, &uu, &vv, cfg.max_features);
        let filtered = self.filter_by_features(mnn, &features, cfg)?;
        let n_filtered = filtered.len();

        let overlaps = neighbourhood_overlap(&dict_a, &dict_b, &filtered, cfg.k_score.max(1));

        let kept = filtered
            .into_iter()
            .zip(overlaps)
            .filter(|&(_, (oa, ob))| oa >= cfg.min_overlap && ob >= cfg.min_overlap)
            .map(|(ab, (oa, ob))| (ab, (oa + ob) / 2.))
            .collect::<Vec<_>>();

        if kept.is_empty() {
            return Err(self.degenerate(
                names,
                format!(
                    "{} mutual neighbours, {} after filtering, none with overlap >= {} on both sides",
                    n_mnn, n_filtered, cfg.min_overlap
                ),
            ));
        }

        let raw = kept.iter().map(|&(_, s)| s).collect::<Vec<_>>();
        let lo = quantile_f32(&raw, 0.01);
        let hi = quantile_f32(&raw, 0.90);

        Ok(kept
            .into_iter()
            .map(|((cell_a, cell_b), s)| Anchor {
                sample_a: self.a,
                cell_a,
                sample_b: self.b,
                cell_b,
                score: if hi > lo {
                    ((s - lo) / (hi - lo)).clamp(0., 1.)
                } else {
                    1.
                },
            })
            .collect())
    }

    /// Mean top canonical value of `Xa^T P Xb` over seeded random
    /// permutations `P` of the features of `b`
    fn null_canonical_value(&self, dims: usize, cfg: &IntegrationConfig) -> anyhow::Result<f32> {
        let nf = self.xb.nrows();
        let n_perm = cfg.null_permutations.max(1);
        let mut tot = 0_f32;
        for r in 0..n_perm {
            let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(r as u64 + 1));
            let mut perm = (0..nf).collect::<Vec<_>>();
            perm.shuffle(&mut rng);
            let shuffled = self.xb.select_rows(perm.iter());
            let (_, dd, _) = CrossProduct {
                xx: self.xa,
                yy: &shuffled,
            }
            .rsvd(dims, cfg.seed)?;
            tot += dd.iter().copied().fold(0_f32, f32::max);
        }
        Ok(tot / n_perm as f32)
    }

    /// keep pairs whose `a` cell is among the `k_filter` nearest
    /// sample-a cells of the `b` cell over the top features
    fn filter_by_features(
        &self,
        mnn: Vec<(usize, usize)>,
        features: &[usize],
        cfg: &IntegrationConfig,
    ) -> anyhow::Result<Vec<(usize, usize)>> {
        let na = self.raw_a.ncols();
        let k_filter = cfg.k_filter.min(na);
        if k_filter == na || features.is_empty() || mnn.is_empty() {
            return Ok(mnn);
        }

        let fa = self.raw_a.select_rows(features.iter()).normalize_columns();
        let fb = self.raw_b.select_rows(features.iter()).normalize_columns();

        let args = cfg.dict_args();
        let dict_a = ColumnDict::from_dmatrix_columns(&fa, (0..na).collect::<Vec<usize>>(), &args)?;
        let dict_b = ColumnDict::from_dmatrix_columns(&fb, (0..fb.ncols()).collect::<Vec<usize>>(), &args)?;

        Ok(mnn
            .into_par_iter()
            .filter(|&(a, b)| dict_b.search_against(b, k_filter, &dict_a).0.contains(&a))
            .collect())
    }
}

/// `(a, b)` with `b` among the `k` nearest of `a` and vice versa, in
/// order of `a` then neighbour rank
fn mutual_neighbours(
    dict_a: &ColumnDict<usize>,
    dict_b: &ColumnDict<usize>,
    knn: usize,
) -> Vec<(usize, usize)> {
    let nn_ab = dict_a.search_all_against(knn, dict_b);
    let nn_ba = dict_b.search_all_against(knn, dict_a);

    nn_ab
        .iter()
        .enumerate()
        .flat_map(|(a, (bs, _))| {
            bs.iter()
                .filter(|&&b| nn_ba[b].0.contains(&a))
                .map(move |&b| (a, b))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Features with the largest absolute loadings, taken round-robin
/// over the canonical components
fn top_loading_features(xa: &Mat, xb: &Mat, uu: &Mat, vv: &Mat, max_features: usize) -> Vec<usize> {
    let loadings = xa * uu + xb * vv;
    let nf = loadings.nrows();
    let target = max_features.min(nf);

    let orders = loadings
        .column_iter()
        .map(|l_k| {
            let mut order = (0..nf).collect::<Vec<_>>();
            order.sort_by(|&i, &j| l_k[j].abs().total_cmp(&l_k[i].abs()).then(i.cmp(&j)));
            order
        })
        .collect::<Vec<_>>();

    let mut chosen = HashSet::new();
    let mut ret = vec![];
    'outer: for r in 0..nf {
        for order in orders.iter() {
            if ret.len() >= target {
                break 'outer;
            }
            if chosen.insert(order[r]) {
                ret.push(order[r]);
            }
        }
    }
    ret.sort_unstable();
    ret
}

/// Shared fractions of the two cells' within- and cross-sample
/// neighbourhoods, `(|N_a(a) & N_a(b)| / k, |N_b(a) & N_b(b)| / k)`
fn neighbourhood_overlap(
    dict_a: &ColumnDict<usize>,
    dict_b: &ColumnDict<usize>,
    pairs: &[(usize, usize)],
    k_score: usize,
) -> Vec<(f32, f32)> {
    pairs
        .par_iter()
        .map(|&(a, b)| {
            let within_a = dict_a.search_others_by_index(a, k_score).0;
            let across_a = dict_a.search_against(a, k_score, dict_b).0;
            let across_b = dict_b.search_against(b, k_score, dict_a).0;
            let within_b = dict_b.search_others_by_index(b, k_score).0;

            let shared_a = within_a.iter().filter(|x| across_b.contains(x)).count();
            let shared_b = across_a.iter().filter(|x| within_b.contains(x)).count();
            (
                shared_a as f32 / k_score as f32,
                shared_b as f32 / k_score as f32,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use matrix_util::traits::SampleOps;

    /// `nn` cells in three states over the columns of `profiles`
    fn cells_from(profiles: &Mat, nn: usize, rng: &mut StdRng) -> Mat {
        let noise = Mat::rnorm(profiles.nrows(), nn, rng);
        Mat::from_fn(profiles.nrows(), nn, |g, j| profiles[(g, j % 3)] + 0.3 * noise[(g, j)])
    }

    #[test]
    fn unrelated_states_are_degenerate() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let shared = Mat::rnorm(200, 3, &mut rng);
        let other = Mat::rnorm(200, 3, &mut rng);

        let data = vec![
            cells_from(&shared, 60, &mut rng),
            cells_from(&shared, 60, &mut rng),
            cells_from(&other, 60, &mut rng),
        ];
        let names: Vec<Box<str>> = vec!["a".into(), "b".into(), "c".into()];
        let cfg = IntegrationConfig {
            dims: 5,
            k_score: 10,
            ..Default::default()
        };

        let set = find_integration_anchors(&names, &data, &cfg)?;
        assert_eq!(set.pairs.len(), 3);
        for p in set.pairs.iter() {
            let related = (p.sample_a, p.sample_b) == (0, 1);
            assert_eq!(p.degenerate, !related, "{:?}", p);
            assert_eq!(p.n_anchors > 0, related, "{:?}", p);
        }
        assert!(set.anchors.iter().all(|x| x.sample_b != 2));
        Ok(())
    }

    #[test]
    fn round_robin_loadings() {
        // feature 0 dominates component 0, feature 2 component 1
        let xa = Mat::from_row_slice(3, 2, &[5., -5., 0.1, 0.1, 0., 0.]);
        let xb = Mat::from_row_slice(3, 2, &[0., 0., 0.2, 0.1, 3., -3.]);
        let uu = Mat::from_row_slice(2, 2, &[1., 0., -1., 0.]);
        let vv = Mat::from_row_slice(2, 2, &[0., 1., 0., -1.]);
        assert_eq!(top_loading_features(&xa, &xb, &uu, &vv, 2), vec![0, 2]);
        assert_eq!(top_loading_features(&xa, &xb, &uu, &vv, 10).len(), 3);
    }
}
