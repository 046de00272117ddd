//! Hierarchical cell-type labels from pre-trained reference models
//!
//! Models are looked up in a catalog, fetched once into a local cache
//! keyed by model id, and applied to a genes x cells table of
//! log-transformed normalized counts.

use crate::common::*;

use lentil_data::sparse_util::column_entries;
use matrix_util::common_io::{mkdir, open_buf_reader, open_buf_writer};
use matrix_util::dmatrix_util::pearson_correlation;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MODEL_FILE: &str = "model.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    /// reference model id
    pub model: Box<str>,
    /// directory of `<id>.json` model files
    pub registry: PathBuf,
    /// fetched models, `<cache>/<id>/model.json`
    pub cache: PathBuf,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            model: "reference".into(),
            registry: PathBuf::from("models"),
            cache: PathBuf::from(".lentil-cache"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: Box<str>,
    pub description: Box<str>,
}

/// Genes x cells expression values handed to a predictor
#[derive(Clone, Debug)]
pub struct ExpressionTable {
    pub genes: Vec<Box<str>>,
    pub cells: Vec<Box<str>>,
    pub values: CscMat,
}

impl ExpressionTable {
    pub fn new(genes: Vec<Box<str>>, cells: Vec<Box<str>>, values: CscMat) -> anyhow::Result<Self> {
        if values.nrows() != genes.len() || values.ncols() != cells.len() {
            anyhow::bail!(
                "[{} x {}] values for {} genes and {} cells",
                values.nrows(),
                values.ncols(),
                genes.len(),
                cells.len()
            );
        }
        Ok(Self {
            genes,
            cells,
            values,
        })
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }
}

/// Labels of one cell, coarsest first
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellTypeLabels {
    pub level1: Box<str>,
    pub level2: Box<str>,
    pub level3: Box<str>,
}

/// A source of pre-trained cell-type models
pub trait CellTypePredictor: Sync {
    /// available models
    fn catalog(&self) -> anyhow::Result<Vec<ModelInfo>>;

    /// local path of the model `id`, fetched on first use
    fn fetch(&self, id: &str) -> anyhow::Result<PathBuf>;

    /// one label triple per cell of `table`
    fn predict(&self, table: &ExpressionTable, model_path: &Path) -> anyhow::Result<Vec<CellTypeLabels>>;
}

/// Fetch `model_id` and label every cell of `table`
pub fn annotate_cells(
    predictor: &dyn CellTypePredictor,
    model_id: &str,
    table: &ExpressionTable,
) -> anyhow::Result<Vec<CellTypeLabels>> {
    let path = predictor.fetch(model_id)?;
    let labels = predictor.predict(table, &path)?;
    if labels.len() != table.num_cells() {
        return Err(unavailable(
            model_id,
            format!("{} labels for {} cells", labels.len(), table.num_cells()),
        ));
    }
    info!(
        "[annotate] labelled {} cells with model {}",
        labels.len(),
        model_id
    );
    Ok(labels)
}

fn unavailable(model: &str, reason: String) -> anyhow::Error {
    PipelineError::ModelUnavailable {
        model: model.into(),
        reason,
    }
    .into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelNode {
    pub label: Box<str>,
    /// 1 (coarsest) to 3 (finest)
    pub level: u8,
    pub parent: Option<Box<str>>,
    /// mean `log1p` expression over the model genes
    pub centroid: Vec<f32>,
}

/// Three-level tree of reference centroids
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HierarchicalCentroidModel {
    pub id: Box<str>,
    pub description: Box<str>,
    pub genes: Vec<Box<str>>,
    pub nodes: Vec<ModelNode>,
}

impl HierarchicalCentroidModel {
    /// Build a reference from cell-type expression proportions
    ///
    /// Types become level-2 nodes, each refined by one level-3 node
    /// and grouped in pairs under level-1 nodes.
    ///
    /// * `profiles` - genes x types proportions
    /// * `depth` - counts per cell the centroids are scaled to
    pub fn from_profiles(
        id: &str,
        description: &str,
        genes: &[Box<str>],
        type_names: &[Box<str>],
        profiles: &Mat,
        depth: f32,
    ) -> anyhow::Result<Self> {
        if profiles.nrows() != genes.len() || profiles.ncols() != type_names.len() {
            anyhow::bail!(
                "[{} x {}] profiles for {} genes and {} types",
                profiles.nrows(),
                profiles.ncols(),
                genes.len(),
                type_names.len()
            );
        }

        let centroids = (0..type_names.len())
            .map(|t| {
                profiles
                    .column(t)
                    .iter()
                    .map(|&p| (p * depth).ln_1p())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let mut nodes = vec![];
        for (g, members) in centroids.chunks(2).enumerate() {
            let mut mean = vec![0_f32; genes.len()];
            for c in members {
                mean.iter_mut().zip(c).for_each(|(m, &x)| *m += x);
            }
            mean.iter_mut().for_each(|m| *m /= members.len() as f32);
            nodes.push(ModelNode {
                label: format!("group{}", g).into_boxed_str(),
                level: 1,
                parent: None,
                centroid: mean,
            });
        }

        for (t, name) in type_names.iter().enumerate() {
            nodes.push(ModelNode {
                label: name.clone(),
                level: 2,
                parent: Some(format!("group{}", t / 2).into_boxed_str()),
                centroid: centroids[t].clone(),
            });
            nodes.push(ModelNode {
                label: format!("{}.1", name).into_boxed_str(),
                level: 3,
                parent: Some(name.clone()),
                centroid: centroids[t].clone(),
            });
        }

        let ret = Self {
            id: id.into(),
            description: description.into(),
            genes: genes.to_vec(),
            nodes,
        };
        ret.validate().map_err(|reason| unavailable(id, reason))?;
        Ok(ret)
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let reader = open_buf_reader(path_str(path)?)?;
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let file = path_str(path)?;
        mkdir(file)?;
        let mut writer = open_buf_writer(file)?;
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        info!("wrote model {} to {}", self.id, file);
        Ok(())
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            id: self.id.clone(),
            description: self.description.clone(),
        }
    }

    /// Check the tree: unique labels, levels 1 to 3 nested through
    /// parents, every non-leaf with children, one centroid value per gene
    pub fn validate(&self) -> Result<(), String> {
        if self.genes.is_empty() {
            return Err("no genes".into());
        }

        let mut level_of = HashMap::new();
        for node in self.nodes.iter() {
            if !(1..=3).contains(&node.level) {
                return Err(format!("node {} at level {}", node.label, node.level));
            }
            if node.centroid.len() != self.genes.len() {
                return Err(format!(
                    "node {} has {} centroid values for {} genes",
                    node.label,
                    node.centroid.len(),
                    self.genes.len()
                ));
            }
            if level_of.insert(node.label.clone(), node.level).is_some() {
                return Err(format!("duplicate label {}", node.label));
            }
        }

        let mut parents = HashSet::new();
        for node in self.nodes.iter() {
            match (&node.parent, node.level) {
                (None, 1) => {}
                (Some(p), 1) => return Err(format!("level-1 node {} has parent {}", node.label, p)),
                (None, _) => return Err(format!("node {} has no parent", node.label)),
                (Some(p), level) => match level_of.get(p) {
                    Some(&pl) if pl + 1 == level => {
                        parents.insert(p.clone());
                    }
                    Some(&pl) => {
                        return Err(format!(
                            "node {} (level {}) under {} (level {})",
                            node.label, level, p, pl
                        ))
                    }
                    None => return Err(format!("node {} has unknown parent {}", node.label, p)),
                },
            }
        }

        if !self.nodes.iter().any(|n| n.level == 1) {
            return Err("no level-1 nodes".into());
        }
        if let Some(leaf) = self
            .nodes
            .iter()
            .find(|n| n.level < 3 && !parents.contains(&n.label))
        {
            return Err(format!("level-{} node {} has no children", leaf.level, leaf.label));
        }
        Ok(())
    }

    /// Nearest centroid by Pearson correlation, level by level, among
    /// the children of the label chosen one level up
    pub fn predict(&self, table: &ExpressionTable) -> anyhow::Result<Vec<CellTypeLabels>> {
        self.validate().map_err(|reason| unavailable(&self.id, reason))?;

        let model_index = self
            .genes
            .iter()
            .enumerate()
            .map(|(i, g)| (g, i))
            .collect::<HashMap<_, _>>();

        // table row -> position among the shared genes
        let mut position = vec![None; table.genes.len()];
        let mut shared = vec![];
        for (r, g) in table.genes.iter().enumerate() {
            if let Some(&i) = model_index.get(g) {
                position[r] = Some(shared.len());
                shared.push(i);
            }
        }
        if shared.is_empty() {
            return Err(unavailable(
                &self.id,
                "no genes shared with the expression table".into(),
            ));
        }

        let centroids = self
            .nodes
            .iter()
            .map(|n| shared.iter().map(|&i| n.centroid[i]).collect::<Vec<_>>())
            .collect::<Vec<_>>();

        let roots = (0..self.nodes.len())
            .filter(|&k| self.nodes[k].level == 1)
            .collect::<Vec<_>>();
        let mut children = HashMap::<&str, Vec<usize>>::new();
        for (k, n) in self.nodes.iter().enumerate() {
            if let Some(p) = n.parent.as_deref() {
                children.entry(p).or_default().push(k);
            }
        }

        info!(
            "[annotate] model {}: {} of {} genes shared, {} cells",
            self.id,
            shared.len(),
            self.genes.len(),
            table.num_cells()
        );

        let nn = table.num_cells();
        let labels = (0..nn)
            .into_par_iter()
            .progress_count(nn as u64)
            .map(|j| {
                let mut x = vec![0_f32; shared.len()];
                for (r, v) in column_entries(&table.values, j) {
                    if let Some(k) = position[r] {
                        x[k] = v;
                    }
                }

                let nearest = |candidates: &[usize]| -> usize {
                    let mut best = (f32::NEG_INFINITY, candidates[0]);
                    for &k in candidates {
                        let rho = pearson_correlation(&x, &centroids[k]);
                        if rho > best.0 {
                            best = (rho, k);
                        }
                    }
                    best.1
                };

                let l1 = nearest(&roots);
                let l2 = nearest(&children[&*self.nodes[l1].label]);
                let l3 = nearest(&children[&*self.nodes[l2].label]);

                CellTypeLabels {
                    level1: self.nodes[l1].label.clone(),
                    level2: self.nodes[l2].label.clone(),
                    level3: self.nodes[l3].label.clone(),
                }
            })
            .collect::<Vec<_>>();

        Ok(labels)
    }
}

fn path_str(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow::anyhow!("non-UTF-8 path {}", path.display()))
}

/// Models stored as `<registry>/<id>.json`, copied to
/// `<cache>/<id>/model.json` on first fetch
#[derive(Clone, Debug)]
pub struct LocalModelRegistry {
    pub registry_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl LocalModelRegistry {
    pub fn new(registry_dir: &Path, cache_dir: &Path) -> Self {
        Self {
            registry_dir: registry_dir.to_path_buf(),
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    pub fn from_config(cfg: &AnnotationConfig) -> Self {
        Self::new(&cfg.registry, &cfg.cache)
    }

    pub fn cached_path(&self, id: &str) -> PathBuf {
        self.cache_dir.join(id).join(MODEL_FILE)
    }
}

impl CellTypePredictor for LocalModelRegistry {
    fn catalog(&self) -> anyhow::Result<Vec<ModelInfo>> {
        let mut files = std::fs::read_dir(&self.registry_dir)
            .map_err(|e| anyhow::anyhow!("model registry {}: {}", self.registry_dir.display(), e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().and_then(|x| x.to_str()) == Some("json"))
            .collect::<Vec<_>>();
        files.sort();

        let mut ret = vec![];
        for file in files {
            match HierarchicalCentroidModel::from_json_file(&file) {
                Ok(model) => ret.push(model.info()),
                Err(e) => warn!("skipping {}: {}", file.display(), e),
            }
        }
        Ok(ret)
    }

    fn fetch(&self, id: &str) -> anyhow::Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(unavailable(id, "invalid model id".into()));
        }

        let cached = self.cached_path(id);
        if cached.is_file() {
            info!("[annotate] using cached model {}", cached.display());
            return Ok(cached);
        }

        let source = self.registry_dir.join(format!("{}.json", id));
        if !source.is_file() {
            return Err(unavailable(
                id,
                format!("not found in registry {}", self.registry_dir.display()),
            ));
        }

        let model = HierarchicalCentroidModel::from_json_file(&source)
            .map_err(|e| unavailable(id, format!("{}: {}", source.display(), e)))?;
        model
            .validate()
            .map_err(|reason| unavailable(id, reason))?;

        model.to_json_file(&cached)?;
        info!("[annotate] fetched model {} into {}", id, cached.display());
        Ok(cached)
    }

    fn predict(&self, table: &ExpressionTable, model_path: &Path) -> anyhow::Result<Vec<CellTypeLabels>> {
        let model = HierarchicalCentroidModel::from_json_file(model_path).map_err(|e| {
            unavailable(
                &model_path.display().to_string(),
                format!("cannot read model: {}", e),
            )
        })?;
        model.predict(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_model() -> HierarchicalCentroidModel {
        let node = |label: &str, level: u8, parent: Option<&str>, centroid: Vec<f32>| ModelNode {
            label: label.into(),
            level,
            parent: parent.map(Box::from),
            centroid,
        };
        HierarchicalCentroidModel {
            id: "toy".into(),
            description: "two lineages".into(),
            genes: vec!["g1".into(), "g2".into(), "g3".into()],
            nodes: vec![
                node("A", 1, None, vec![5., 1., 0.]),
                node("B", 1, None, vec![0., 1., 5.]),
                node("A1", 2, Some("A"), vec![5., 1., 0.]),
                node("B1", 2, Some("B"), vec![0., 1., 5.]),
                node("A1a", 3, Some("A1"), vec![5., 2., 0.]),
                node("A1b", 3, Some("A1"), vec![5., 0., 1.]),
                node("B1a", 3, Some("B1"), vec![0., 1., 5.]),
            ],
        }
    }

    #[test]
    fn labels_follow_the_tree() -> anyhow::Result<()> {
        let model = toy_model();
        let values = lentil_data::sparse_util::csc_from_columns(
            3,
            vec![vec![(0, 6.), (1, 2.)], vec![(1, 1.), (2, 4.)]],
        )?;
        let table = ExpressionTable::new(model.genes.clone(), vec!["c1".into(), "c2".into()], values)?;
        let labels = model.predict(&table)?;
        assert_eq!(&*labels[0].level1, "A");
        assert_eq!(&*labels[0].level3, "A1a");
        assert_eq!(&*labels[1].level2, "B1");
        assert_eq!(&*labels[1].level3, "B1a");
        Ok(())
    }

    #[test]
    fn broken_trees_are_rejected() {
        let mut model = toy_model();
        model.nodes[6].parent = Some("A".into());
        assert!(model.validate().is_err());

        let mut model = toy_model();
        model.nodes.truncate(6);
        assert!(model.validate().is_err());

        let mut model = toy_model();
        model.nodes[0].centroid.pop();
        assert!(model.validate().is_err());
    }
}
