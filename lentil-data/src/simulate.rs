use crate::tenx_io::write_tenx_dir;

use indicatif::ParallelProgressIterator;
use log::info;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, Normal, Poisson};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::Path;

pub struct SimArgs {
    pub samples: usize,
    pub cells_per_sample: usize,
    pub genes: usize,
    /// cell types per sample
    pub cell_types: usize,
    pub mito_genes: usize,
    pub markers_per_type: usize,
    pub marker_fold: f32,
    pub doublet_rate: f32,
    pub qc_violation_rate: f32,
    /// uniform sequencing depth range of normal cells
    pub depth: (f32, f32),
    /// log-scale standard deviation of per-sample gene effects
    pub batch_sd: f32,
    /// every sample gets its own cell types, with their own markers,
    /// over the same genes
    pub disjoint: bool,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            samples: 4,
            cells_per_sample: 500,
            genes: 2000,
            cell_types: 4,
            mito_genes: 13,
            markers_per_type: 50,
            marker_fold: 8.,
            doublet_rate: 0.05,
            qc_violation_rate: 0.10,
            depth: (2500., 5000.),
            batch_sd: 0.3,
            disjoint: false,
            rseed: 42,
        }
    }
}

const LOW_DEPTH: f32 = 100.;
const HIGH_DEPTH: f32 = 30000.;
const HIGH_MITO: f32 = 0.45;

/// Ground truth of a simulated cell
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellKind {
    Normal(usize),
    Doublet(usize, usize),
    LowDepth(usize),
    HighMito(usize),
    HighDepth(usize),
}

impl CellKind {
    pub fn is_doublet(&self) -> bool {
        matches!(self, CellKind::Doublet(..))
    }

    pub fn violates_qc(&self) -> bool {
        matches!(
            self,
            CellKind::LowDepth(_) | CellKind::HighMito(_) | CellKind::HighDepth(_)
        )
    }
}

pub struct SimSample {
    pub name: Box<str>,
    pub barcodes: Vec<Box<str>>,
    pub kinds: Vec<CellKind>,
    /// `(gene, cell, count)`, sorted by cell then gene
    pub triplets: Vec<(u64, u64, f32)>,
}

impl SimSample {
    pub fn doublet_barcodes(&self) -> HashSet<Box<str>> {
        self.barcodes_where(CellKind::is_doublet)
    }

    pub fn qc_violator_barcodes(&self) -> HashSet<Box<str>> {
        self.barcodes_where(CellKind::violates_qc)
    }

    fn barcodes_where(&self, pred: impl Fn(&CellKind) -> bool) -> HashSet<Box<str>> {
        self.barcodes
            .iter()
            .zip(self.kinds.iter())
            .filter(|(_, k)| pred(k))
            .map(|(b, _)| b.clone())
            .collect()
    }
}

pub struct SimOut {
    pub gene_ids: Vec<Box<str>>,
    pub gene_names: Vec<Box<str>>,
    pub type_names: Vec<Box<str>>,
    /// genes x types expression proportions (columns sum to one)
    pub type_profiles: DMatrix<f32>,
    pub samples: Vec<SimSample>,
}

impl SimOut {
    /// Write every sample as `dir/<sample>/{matrix.mtx,features.tsv,barcodes.tsv}.gz`
    pub fn write_tenx_dirs(&self, dir: &Path) -> anyhow::Result<Vec<std::path::PathBuf>> {
        self.samples
            .iter()
            .map(|s| {
                let sample_dir = dir.join(&*s.name);
                write_tenx_dir(
                    &sample_dir,
                    &self.gene_ids,
                    &self.gene_names,
                    &s.barcodes,
                    &s.triplets,
                )?;
                info!("wrote {}", sample_dir.display());
                Ok(sample_dir)
            })
            .collect()
    }
}

/// 10x-like 16-mer barcode for the `j`-th cell
pub fn barcode(j: usize) -> Box<str> {
    const ACGT: [char; 4] = ['A', 'C', 'G', 'T'];
    let mut x = j;
    let mut code = ['A'; 16];
    for c in code.iter_mut().rev() {
        *c = ACGT[x % 4];
        x /= 4;
    }
    format!("{}-1", code.iter().collect::<String>()).into_boxed_str()
}

/// Generate multiple samples of Poisson counts from cell-type
/// programs with batch effects, injected doublets and QC violators
///
/// ```text
/// Y(g,j) ~ Poisson( depth(j) * (1 - m(j)) * p(g, type(j)) * delta(g, sample) )
/// ```
///
/// Mitochondrial genes share `depth(j) * m(j)` counts uniformly.
/// Doublets sum two cells of different types; violators have very low
/// depth, very high mitochondrial fraction or very high depth.
pub fn simulate_samples(args: &SimArgs) -> anyhow::Result<SimOut> {
    let ss = args.samples.max(1);
    let dd = args.genes;
    let n_mito = if args.disjoint { 0 } else { args.mito_genes.min(dd) };
    if dd <= n_mito {
        anyhow::bail!("need more than {} genes", n_mito);
    }

    let mut rng = StdRng::seed_from_u64(args.rseed);

    let gene_ids = (0..dd)
        .map(|g| format!("ENSG{:011}", g + 1).into_boxed_str())
        .collect::<Vec<_>>();
    let gene_names = (0..dd)
        .map(|g| {
            if g < n_mito {
                format!("MT-ND{}", g + 1)
            } else {
                format!("GENE{:05}", g + 1)
            }
            .into_boxed_str()
        })
        .collect::<Vec<_>>();

    let n_types_total = if args.disjoint {
        ss * args.cell_types
    } else {
        args.cell_types
    };
    let sample_types = |s: usize| -> Vec<usize> {
        if args.disjoint {
            (s * args.cell_types..(s + 1) * args.cell_types).collect()
        } else {
            (0..args.cell_types).collect()
        }
    };

    // every type owns its own block of marker genes among the nuclear genes
    let nuclear = (n_mito..dd).collect::<Vec<_>>();
    let markers = args.markers_per_type.max(1);
    if n_types_total * markers > nuclear.len() {
        anyhow::bail!(
            "{} types x {} markers do not fit in {} genes",
            n_types_total,
            markers,
            nuclear.len()
        );
    }

    let base = Gamma::new(2.0_f32, 0.5)?;
    let mut type_profiles = DMatrix::<f32>::zeros(dd, n_types_total);
    for t in 0..n_types_total {
        for (pos, &g) in nuclear.iter().enumerate() {
            let mut p = base.sample(&mut rng);
            if pos / markers == t {
                p *= args.marker_fold;
            }
            type_profiles[(g, t)] = p;
        }
        let tot = type_profiles.column(t).sum();
        type_profiles.column_mut(t).unscale_mut(tot);
    }

    let type_names = (0..n_types_total)
        .map(|t| format!("type{}", t).into_boxed_str())
        .collect::<Vec<_>>();

    let batch = Normal::new(0.0_f32, args.batch_sd.max(0.))?;
    let delta_ds = DMatrix::<f32>::from_fn(dd, ss, |_, _| batch.sample(&mut rng).exp());

    let seeds = (0..ss).map(|_| rng.random::<u64>()).collect::<Vec<_>>();

    let samples = (0..ss)
        .into_par_iter()
        .progress_count(ss as u64)
        .map(|s| {
            let mut rng = StdRng::seed_from_u64(seeds[s]);
            let types = sample_types(s);

            // profiles with this sample's batch effect
            let mut prof = type_profiles.clone();
            for mut p_t in prof.column_iter_mut() {
                p_t.component_mul_assign(&delta_ds.column(s));
                let tot = p_t.sum();
                p_t.unscale_mut(tot);
            }

            let kinds = assign_kinds(args, &types, &mut rng);
            let mut triplets = vec![];

            for (j, kind) in kinds.iter().enumerate() {
                let counts = match *kind {
                    CellKind::Normal(t) => draw_cell(&prof, t, n_mito, args, None, None, &mut rng)?,
                    CellKind::Doublet(t1, t2) => {
                        let mut a = draw_cell(&prof, t1, n_mito, args, None, None, &mut rng)?;
                        let b = draw_cell(&prof, t2, n_mito, args, None, None, &mut rng)?;
                        a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                        a
                    }
                    CellKind::LowDepth(t) => {
                        draw_cell(&prof, t, n_mito, args, Some(LOW_DEPTH), None, &mut rng)?
                    }
                    CellKind::HighMito(t) => {
                        draw_cell(&prof, t, n_mito, args, None, Some(HIGH_MITO), &mut rng)?
                    }
                    CellKind::HighDepth(t) => {
                        draw_cell(&prof, t, n_mito, args, Some(HIGH_DEPTH), None, &mut rng)?
                    }
                };
                for (g, &y) in counts.iter().enumerate() {
                    if y > 0. {
                        triplets.push((g as u64, j as u64, y));
                    }
                }
            }

            Ok(SimSample {
                name: format!("sample{}", s + 1).into_boxed_str(),
                barcodes: (0..kinds.len()).map(barcode).collect(),
                kinds,
                triplets,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    info!(
        "simulated {} samples x {} cells over {} genes and {} cell types",
        ss, args.cells_per_sample, dd, n_types_total
    );

    Ok(SimOut {
        gene_ids,
        gene_names,
        type_names,
        type_profiles,
        samples,
    })
}

/// violators first, then doublets, on shuffled slots
fn assign_kinds(args: &SimArgs, types: &[usize], rng: &mut StdRng) -> Vec<CellKind> {
    let nn = args.cells_per_sample;
    let n_viol = ((nn as f32) * args.qc_violation_rate).round() as usize;
    let n_dbl = ((nn as f32) * args.doublet_rate).round() as usize;

    let mut slots = (0..nn).collect::<Vec<_>>();
    slots.shuffle(rng);

    let mut kinds = (0..nn)
        .map(|_| CellKind::Normal(types[rng.random_range(0..types.len())]))
        .collect::<Vec<_>>();

    for (r, &j) in slots.iter().enumerate() {
        let t = types[rng.random_range(0..types.len())];
        if r < n_viol {
            kinds[j] = match r % 3 {
                0 => CellKind::LowDepth(t),
                1 => CellKind::HighMito(t),
                _ => CellKind::HighDepth(t),
            };
        } else if r < n_viol + n_dbl {
            let mut t2 = types[rng.random_range(0..types.len())];
            if types.len() > 1 {
                while t2 == t {
                    t2 = types[rng.random_range(0..types.len())];
                }
            }
            kinds[j] = CellKind::Doublet(t, t2);
        }
    }
    kinds
}

fn draw_cell(
    prof: &DMatrix<f32>,
    t: usize,
    n_mito: usize,
    args: &SimArgs,
    depth: Option<f32>,
    mito: Option<f32>,
    rng: &mut StdRng,
) -> anyhow::Result<Vec<f32>> {
    let depth = depth.unwrap_or_else(|| rng.random_range(args.depth.0..args.depth.1));
    let m = if n_mito == 0 {
        0.
    } else {
        mito.unwrap_or_else(|| rng.random_range(0.02..0.08))
    };

    let mut ret = vec![0_f32; prof.nrows()];
    for (g, y) in ret.iter_mut().enumerate() {
        let lambda = if g < n_mito {
            depth * m / n_mito as f32
        } else {
            depth * (1. - m) * prof[(g, t)]
        };
        if lambda > 0. {
            *y = Poisson::new(lambda)?.sample(rng);
        }
    }
    Ok(ret)
}
