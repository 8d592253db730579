//! `rustcov` estimates the covariance matrix of galaxy two- and
//! three-point clustering statistics by Monte Carlo sampling of
//! particle quadruplets drawn from a spatially gridded catalog.
//!
//! # Crate layout
//!
//! - [`grid`]: the uniform 3D cell grid particles are drawn from.
//! - [`particle`], [`tracer`]: the catalog's immutable data model.
//! - [`geometry`]: shared geometric primitives (points, cell-coordinate
//!   arithmetic, separation/µ computation).
//! - [`correlation`]: the ξ(r) / ξ(r, µ) interface the sampler and
//!   accumulator consult.
//! - [`survey_correction`]: window-function corrections for the
//!   Legendre and Power binning variants.
//! - [`jackknife`]: per-(bin, region) jackknife weights.
//! - [`random_draws`]: the biased cell-offset sampler.
//! - [`accumulator`]: the per-bin C2/C3/C4 partial sums and their
//!   `second`/`third`/`fourth` folding kernels — the hard part.
//! - [`compute_integral`]: the thread-parallel driver that ties all of
//!   the above together.
//! - [`config`]: run parameters and their validation.
//! - [`telemetry`]: acceptance-ratio/throughput summaries for the
//!   driver's printed diagnostics.
//! - [`error`]: the crate-wide error type.
//!
//! # Example
//!
//! ```no_run
//! use rustcov::accumulator::Variant;
//! use rustcov::compute_integral::{ComputeIntegral, TracerCatalogs};
//! use rustcov::config::Parameters;
//! use rustcov::correlation::TabulatedXi;
//! use rustcov::geometry::Point3D;
//! use rustcov::grid::Grid;
//! use rustcov::particle::Particle;
//! use rustcov::random_draws::RandomDraws;
//!
//! let particles: Vec<Particle> = (0..1000)
//!     .map(|i| Particle::new(Point3D::new(i as f64 % 10.0, 0.0, 0.0), 1.0, None, i))
//!     .collect();
//! let grid = Grid::build(particles, 5.0, true);
//! let xi = TabulatedXi::constant(1.0);
//! let draws = RandomDraws::new(2, 5.0, &xi);
//!
//! let params = Parameters {
//!     nbin: 10,
//!     mbin: 4,
//!     n2: 10,
//!     n3: 5,
//!     n4: 5,
//!     max_loops: 50,
//!     nthread: 1,
//!     multi_tracers: false,
//!     out_file: std::env::temp_dir().join("rustcov-doctest"),
//!     power_norm: None,
//!     seed: 1,
//!     convergence_tol: 0.01,
//! };
//!
//! let driver = ComputeIntegral {
//!     params,
//!     catalogs: TracerCatalogs { one: &grid, two: None },
//!     xi: [&xi, &xi, &xi],
//!     draws_one: &draws,
//!     draws_two: None,
//!     variant: Variant::Angular,
//!     r_edges: (0..=10).map(|b| b as f64).collect(),
//!     jackknife: None,
//!     survey_correction: None,
//!     jackknife_weights: None,
//! };
//!
//! driver.run().unwrap();
//! ```

pub mod accumulator;
pub mod compute_integral;
pub mod config;
pub mod correlation;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod jackknife;
pub mod particle;
pub mod random_draws;
pub mod survey_correction;
pub mod telemetry;
pub mod tracer;

pub use error::{Error, Result};
pub use geometry::{Point3D, Vec3D};
