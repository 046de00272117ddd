use indicatif::ParallelProgressIterator;
use instant_distance::{Builder, HnswMap, Search};
use nalgebra::DMatrix;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fmt::{Debug, Display};

/// Below this many points a dictionary answers queries by brute force
pub const DEFAULT_EXACT_BELOW: usize = 5_000;

#[derive(Clone, Debug)]
pub struct ColumnDictArgs {
    /// use exact search when the dictionary holds fewer points
    pub exact_below: usize,
    /// HNSW construction seed
    pub seed: u64,
    /// HNSW candidate list size; the largest `k` ever requested
    pub ef_search: usize,
}

impl Default for ColumnDictArgs {
    fn default() -> Self {
        Self {
            exact_below: DEFAULT_EXACT_BELOW,
            seed: 42,
            ef_search: 256,
        }
    }
}

/// A dictionary of column vectors for nearest-neighbour look-up.
///
/// Small dictionaries are searched exhaustively with deterministic
/// tie-breaking by index; large ones go through an `HnswMap`.
pub struct ColumnDict<T> {
    dict: Option<HnswMap<VecPoint, usize>>,
    data_vec: Vec<VecPoint>,
    names: Vec<T>,
    name2index: HashMap<T, usize>,
}

impl<T> ColumnDict<T>
where
    T: Clone + Eq + std::hash::Hash + Debug + Display + Send + Sync,
{
    /// Build a dictionary over the columns of `data`
    /// * `data` - (d x n) matrix, each column is a point
    /// * `names` - one name per column
    /// * `args` - search settings
    pub fn from_dmatrix_columns(
        data: &DMatrix<f32>,
        names: Vec<T>,
        args: &ColumnDictArgs,
    ) -> anyhow::Result<Self> {
        if data.ncols() != names.len() {
            anyhow::bail!(
                "{} columns but {} names in the dictionary",
                data.ncols(),
                names.len()
            );
        }

        let data_vec = data
            .column_iter()
            .map(|x_j| VecPoint {
                data: x_j.iter().copied().collect(),
            })
            .collect::<Vec<_>>();

        let mut name2index = HashMap::with_capacity(names.len());
        for (j, x) in names.iter().enumerate() {
            if name2index.insert(x.clone(), j).is_some() {
                anyhow::bail!("duplicate name {} in the dictionary", x);
            }
        }

        let dict = if data_vec.len() >= args.exact_below {
            let values = (0..data_vec.len()).collect::<Vec<_>>();
            Some(
                Builder::default()
                    .seed(args.seed)
                    .ef_search(args.ef_search)
                    .build(data_vec.clone(), values),
            )
        } else {
            None
        };

        Ok(ColumnDict {
            dict,
            data_vec,
            names,
            name2index,
        })
    }

    pub fn names(&self) -> &[T] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.data_vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_vec.is_empty()
    }

    pub fn is_exact(&self) -> bool {
        self.dict.is_none()
    }

    pub fn index_of(&self, name: &T) -> Option<usize> {
        self.name2index.get(name).copied()
    }

    pub fn point(&self, index: usize) -> &VecPoint {
        &self.data_vec[index]
    }

    /// k-nearest neighbours of an arbitrary query point
    ///
    /// Returns column indices and Euclidean distances sorted by
    /// increasing distance.
    pub fn search_point(&self, query: &VecPoint, knn: usize) -> (Vec<usize>, Vec<f32>) {
        let nquery = knn.min(self.data_vec.len());
        if nquery == 0 {
            return (vec![], vec![]);
        }

        match &self.dict {
            Some(dict) => {
                let mut search = Search::default();
                dict.search(query, &mut search)
                    .take(nquery)
                    .map(|item| (*item.value, item.distance))
                    .unzip()
            }
            None => {
                use instant_distance::Point;
                let mut dist = self
                    .data_vec
                    .iter()
                    .enumerate()
                    .map(|(j, x)| (j, query.distance(x)))
                    .collect::<Vec<_>>();
                dist.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
                dist.truncate(nquery);
                dist.into_iter().unzip()
            }
        }
    }

    /// k-nearest neighbours of the named column, excluding itself
    pub fn search_others(&self, query_name: &T, knn: usize) -> anyhow::Result<(Vec<usize>, Vec<f32>)> {
        let self_idx = self
            .index_of(query_name)
            .ok_or_else(|| anyhow::anyhow!("name {} not found", query_name))?;
        Ok(self.search_others_by_index(self_idx, knn))
    }

    /// k-nearest neighbours of the `index`-th column, excluding itself
    pub fn search_others_by_index(&self, index: usize, knn: usize) -> (Vec<usize>, Vec<f32>) {
        let (indices, distances) = self.search_point(&self.data_vec[index], knn + 1);
        indices
            .into_iter()
            .zip(distances)
            .filter(|&(j, _)| j != index)
            .take(knn)
            .unzip()
    }

    /// k-nearest neighbour match of the `index`-th column against
    /// another dictionary
    pub fn search_against(&self, index: usize, knn: usize, against: &Self) -> (Vec<usize>, Vec<f32>) {
        against.search_point(&self.data_vec[index], knn)
    }

    /// k-nearest neighbour match by name against another dictionary
    /// to return a Vec of names in the other dictionary
    ///
    /// * `query_name` - the name of the column to match
    /// * `knn` - the number of nearest neighbours to return
    /// * `against` - the dictionary to match against
    ///
    pub fn match_against_by_name(
        &self,
        query_name: &T,
        knn: usize,
        against: &Self,
    ) -> anyhow::Result<Vec<T>> {
        let self_idx = self
            .index_of(query_name)
            .ok_or_else(|| anyhow::anyhow!("name {} not found", query_name))?;
        let (indices, _) = self.search_against(self_idx, knn, against);
        Ok(indices.into_iter().map(|j| against.names[j].clone()).collect())
    }

    /// k-nearest neighbours of every column of this dictionary within
    /// `against`, in column order
    pub fn search_all_against(&self, knn: usize, against: &Self) -> Vec<(Vec<usize>, Vec<f32>)> {
        let nn = self.len();
        (0..nn)
            .into_par_iter()
            .progress_count(nn as u64)
            .map(|i| self.search_against(i, knn, against))
            .collect()
    }

    /// k-nearest neighbours of every column within the same
    /// dictionary (self excluded), in column order
    pub fn search_all_others(&self, knn: usize) -> Vec<(Vec<usize>, Vec<f32>)> {
        let nn = self.len();
        (0..nn)
            .into_par_iter()
            .progress_count(nn as u64)
            .map(|i| self.search_others_by_index(i, knn))
            .collect()
    }
}

#[derive(Clone, Debug)]
/// a wrapper for Vec<f32>
pub struct VecPoint {
    pub data: Vec<f32>,
}

pub trait MakeVecPoint {
    fn to_vp(&self) -> VecPoint;
}

impl MakeVecPoint for Vec<f32> {
    fn to_vp(&self) -> VecPoint {
        VecPoint { data: self.clone() }
    }
}

impl MakeVecPoint for nalgebra::DVectorView<'_, f32> {
    fn to_vp(&self) -> VecPoint {
        VecPoint {
            data: self.iter().cloned().collect(),
        }
    }
}

impl instant_distance::Point for VecPoint {
    fn distance(&self, other: &Self) -> f32 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}
