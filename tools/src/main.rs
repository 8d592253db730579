//! `rustcov`: command-line front-end that loads a particle catalog (and
//! its ancillary tables) and drives [`rustcov::compute_integral::ComputeIntegral`].

mod catalog;
mod tables;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rustcov::accumulator::Variant;
use rustcov::compute_integral::{ComputeIntegral, JackknifeRegions, TracerCatalogs};
use rustcov::config::Parameters;
use rustcov::correlation::{CorrelationFunction, TabulatedXi};
use rustcov::grid::Grid;
use rustcov::random_draws::RandomDraws;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VariantArg {
    Angular,
    Legendre,
    Power,
}

impl From<VariantArg> for Variant {
    fn from(v: VariantArg) -> Variant {
        match v {
            VariantArg::Angular => Variant::Angular,
            VariantArg::Legendre => Variant::Legendre,
            VariantArg::Power => Variant::Power,
        }
    }
}

/// Estimate the covariance matrix of two- and three-point clustering
/// statistics by Monte Carlo sampling of particle quadruplets.
#[derive(Parser, Debug)]
#[command(name = "rustcov", version, about)]
struct Cli {
    /// Primary particle catalog: whitespace-delimited `x y z w [tracer]`.
    #[arg(long)]
    catalog1: PathBuf,

    /// Second tracer's catalog, for cross-tracer / multi-tracer runs.
    #[arg(long)]
    catalog2: Option<PathBuf>,

    /// Two-column `r xi` table. Without one, a constant ξ(r) = 1 is used.
    #[arg(long)]
    xi_table: Option<PathBuf>,

    /// `nbin mbin` header followed by an `nbin x mbin` correction
    /// table, consulted by the Power binning variant.
    #[arg(long)]
    survey_correction: Option<PathBuf>,

    /// One jackknife region id per catalog1 particle, same file order.
    #[arg(long)]
    jackknife_regions: Option<PathBuf>,

    /// Directory `save_integrals`/`save_jackknife_integrals` writes into.
    #[arg(long, default_value = "rustcov-out")]
    out_dir: PathBuf,

    /// Cubic cell edge length.
    #[arg(long)]
    cell_size: f64,

    /// Wrap cell separations across the catalog's bounding box.
    #[arg(long)]
    periodic: bool,

    /// Chebyshev-distance radius (in cells) of the proposal cube.
    #[arg(long, default_value_t = 2)]
    draw_radius: i64,

    /// Upper bound of the radial binning range.
    #[arg(long)]
    rmax: f64,

    /// Number of radial bins.
    #[arg(long, default_value_t = 10)]
    nbin: usize,

    /// Number of angular bins / Legendre multipoles / Fourier modes.
    #[arg(long, default_value_t = 4)]
    mbin: usize,

    /// Secondary particles drawn per primary.
    #[arg(long, default_value_t = 10)]
    n2: usize,

    /// Tertiary particles drawn per secondary.
    #[arg(long, default_value_t = 5)]
    n3: usize,

    /// Quaternary particles drawn per tertiary.
    #[arg(long, default_value_t = 5)]
    n4: usize,

    /// Upper bound on reduction loops before giving up on convergence.
    #[arg(long, default_value_t = 200)]
    max_loops: usize,

    /// Worker thread count.
    #[arg(long, default_value_t = 1)]
    nthread: usize,

    /// Iterate the fixed 7-combination multi-tracer table instead of
    /// just the single-tracer `(1,1,1,1)` selection.
    #[arg(long)]
    multi_tracers: bool,

    /// Binning variant.
    #[arg(long, value_enum, default_value_t = VariantArg::Angular)]
    variant: VariantArg,

    /// Normalization divisor for the Power binning variant.
    #[arg(long)]
    power_norm: Option<f64>,

    /// RNG seed.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Relative Frobenius-norm convergence threshold on C4.
    #[arg(long, default_value_t = 1e-3)]
    convergence_tol: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let particles1 = catalog::load(&cli.catalog1)
        .with_context(|| format!("loading {}", cli.catalog1.display()))?;
    let region_assignment = cli
        .jackknife_regions
        .as_deref()
        .map(tables::load_region_assignment)
        .transpose()?;
    if let Some(regions) = &region_assignment {
        anyhow::ensure!(
            regions.len() == particles1.len(),
            "jackknife region file has {} entries, catalog1 has {} particles",
            regions.len(),
            particles1.len()
        );
    }

    let particles2 = cli
        .catalog2
        .as_deref()
        .map(catalog::load)
        .transpose()
        .with_context(|| "loading catalog2".to_string())?;

    // Cross-tracer cell-coordinate deltas (the driver tests a
    // coordinate derived from grid1 against grid2/3/4) are only
    // meaningful if every tracer grid shares one origin, so build both
    // grids from their combined bounding box rather than each its own.
    let (grid1, grid2) = match particles2 {
        Some(particles2) => {
            let (min, max) = rustcov::grid::combined_bounding_box(&[&particles1, &particles2]);
            let grid1 = Grid::build_in_box(particles1, cli.cell_size, cli.periodic, min, max);
            let grid2 = Grid::build_in_box(particles2, cli.cell_size, cli.periodic, min, max);
            (grid1, Some(grid2))
        }
        None => (Grid::build(particles1, cli.cell_size, cli.periodic), None),
    };

    let xi: Box<dyn CorrelationFunction + Sync> = match &cli.xi_table {
        Some(path) => Box::new(tables::load_xi_table(path)?),
        None => {
            tracing::warn!("no --xi-table given, using a constant xi(r) = 1");
            Box::new(TabulatedXi::constant(1.0))
        }
    };

    let draws_one = RandomDraws::new(cli.draw_radius, cli.cell_size, xi.as_ref());
    let draws_two = grid2
        .is_some()
        .then(|| RandomDraws::new(cli.draw_radius, cli.cell_size, xi.as_ref()));

    let r_edges = linspace(0.0, cli.rmax, cli.nbin + 1);

    let params = Parameters {
        nbin: cli.nbin,
        mbin: cli.mbin,
        n2: cli.n2,
        n3: cli.n3,
        n4: cli.n4,
        max_loops: cli.max_loops,
        nthread: cli.nthread,
        multi_tracers: cli.multi_tracers,
        out_file: cli.out_dir.clone(),
        power_norm: cli.power_norm,
        seed: cli.seed,
        convergence_tol: cli.convergence_tol,
    };
    params.validate().context("invalid parameters")?;

    let survey_correction = cli
        .survey_correction
        .as_deref()
        .map(tables::load_survey_correction)
        .transpose()?;

    // `region_assignment` is in catalog1's original file order (indexed
    // by particle id), but `Grid::build`/`build_in_box` reorder
    // particles by cell, so re-key by id into grid1's particle order.
    let region_of: Option<Vec<usize>> = region_assignment
        .as_ref()
        .map(|regions| grid1.p.iter().map(|p| regions[p.id as usize]).collect());
    let jackknife = region_of
        .as_ref()
        .map(|region_of| JackknifeRegions { region_of });

    let driver = ComputeIntegral {
        params,
        catalogs: TracerCatalogs {
            one: &grid1,
            two: grid2.as_ref(),
        },
        xi: [xi.as_ref(), xi.as_ref(), xi.as_ref()],
        draws_one: &draws_one,
        draws_two: draws_two.as_ref(),
        variant: cli.variant.into(),
        r_edges,
        jackknife,
        survey_correction: survey_correction.as_ref().map(|t| {
            let sc = t as &(dyn rustcov::survey_correction::SurveyCorrection + Sync);
            [sc, sc, sc]
        }),
        jackknife_weights: None,
    };

    driver.run().context("integral run failed")?;
    Ok(())
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    assert!(n >= 2, "need at least 2 edges");
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}
