use crate::common::*;

use matrix_util::common_io::read_lines;
use matrix_util::utils::median_f32;
use std::collections::{HashMap, HashSet};

/// Shared integration features with their ranking statistics
#[derive(Clone, Debug)]
pub struct FeatureSelection {
    pub selected_names: Vec<Box<str>>,
    /// number of samples listing each selected feature
    pub frequency: Vec<usize>,
    /// median 1-based rank over the samples listing it
    pub median_rank: Vec<f32>,
}

impl FeatureSelection {
    pub fn len(&self) -> usize {
        self.selected_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected_names.is_empty()
    }
}

/// Select features that are variable in many samples
///
/// Candidates are ranked by the number of samples whose list contains
/// them (descending), then by their median rank in those lists
/// (ascending), then by name.
///
/// * `ranked_lists` - per-sample variable genes, most variable first
/// * `n_features` - maximum number of features to return
/// * `restrict_to` - optional allow-list of candidates
pub fn select_integration_features(
    ranked_lists: &[Vec<Box<str>>],
    n_features: usize,
    restrict_to: Option<&HashSet<Box<str>>>,
) -> anyhow::Result<FeatureSelection> {
    if n_features == 0 {
        return Err(anyhow::anyhow!("n_features must be >= 1"));
    }

    let mut ranks = HashMap::<&Box<str>, Vec<f32>>::new();
    for list in ranked_lists {
        for (r, g) in list.iter().enumerate() {
            if restrict_to.map(|allowed| allowed.contains(g)).unwrap_or(true) {
                ranks.entry(g).or_default().push((r + 1) as f32);
            }
        }
    }

    if ranks.is_empty() {
        return Err(anyhow::anyhow!(
            "no candidate features in {} ranked lists",
            ranked_lists.len()
        ));
    }

    let mut candidates = ranks
        .into_iter()
        .map(|(g, r)| (g.clone(), r.len(), median_f32(&r)))
        .collect::<Vec<_>>();

    candidates.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then(a.2.total_cmp(&b.2))
            .then(a.0.cmp(&b.0))
    });
    candidates.truncate(n_features);

    info!(
        "[features] selected {} features from {} samples (cap {})",
        candidates.len(),
        ranked_lists.len(),
        n_features
    );

    let mut ret = FeatureSelection {
        selected_names: Vec::with_capacity(candidates.len()),
        frequency: Vec::with_capacity(candidates.len()),
        median_rank: Vec::with_capacity(candidates.len()),
    };
    for (g, freq, med) in candidates {
        ret.selected_names.push(g);
        ret.frequency.push(freq);
        ret.median_rank.push(med);
    }
    Ok(ret)
}

/// Load feature names from a text file (one per line, first
/// tab-separated word)
pub fn load_feature_list(file_path: &str) -> anyhow::Result<HashSet<Box<str>>> {
    let names = read_lines(file_path)?
        .into_iter()
        .filter_map(|line| {
            line.split('\t')
                .next()
                .map(str::trim)
                .filter(|x| !x.is_empty())
                .map(Box::from)
        })
        .collect::<HashSet<_>>();

    if names.is_empty() {
        return Err(anyhow::anyhow!("no features in {}", file_path));
    }
    info!("[features] {} candidate features from {}", names.len(), file_path);
    Ok(names)
}
