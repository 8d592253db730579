//! Benchmarks the `second`/`third`/`fourth` folding kernels and a short
//! `run_selection` sweep, the hot path of a reduction loop. Uses
//! `criterion::Criterion` directly rather than the
//! `criterion_group!`/`criterion_main!` macros (hence `harness = false`
//! in the root `Cargo.toml`).

use criterion::Criterion;
use rustcov::accumulator::{Draw, PrimaryBatch, Probability2, Variant, VariantScratch};
use rustcov::compute_integral::{ComputeIntegral, TracerCatalogs};
use rustcov::config::Parameters;
use rustcov::correlation::TabulatedXi;
use rustcov::geometry::Point3D;
use rustcov::grid::Grid;
use rustcov::particle::Particle;
use rustcov::random_draws::RandomDraws;

fn uniform_cube_catalog(n_per_axis: usize) -> Vec<Particle> {
    let mut id = 0;
    let mut particles = Vec::new();
    for x in 0..n_per_axis {
        for y in 0..n_per_axis {
            for z in 0..n_per_axis {
                particles.push(Particle::new(
                    Point3D::new(x as f64, y as f64, z as f64),
                    1.0,
                    None,
                    id,
                ));
                id += 1;
            }
        }
    }
    particles
}

fn bench_second(c: &mut Criterion) {
    let xi = TabulatedXi::constant(1.0);
    let mut acc = rustcov::accumulator::IntegralAccumulator::new(
        10,
        4,
        (0..=10).map(|b| b as f64).collect(),
        Variant::Angular,
        None,
    );
    let prim_pos: Vec<_> = (0..64).map(|i| Point3D::new(i as f64 % 8.0, 0.0, 0.0)).collect();
    let prim_weight = vec![1.0; 64];
    let prim_id: Vec<u64> = (0..64).collect();
    let prim_tracer = vec![None; 64];
    let prim = PrimaryBatch {
        pos: &prim_pos,
        weight: &prim_weight,
        id: &prim_id,
        tracer: &prim_tracer,
    };
    let j_pos = Point3D::new(5.0, 1.0, 0.0);
    let j = Draw {
        pos: &j_pos,
        weight: 1.0,
        id: 9999,
        tracer: None,
    };
    let mut bin_ij = vec![None; 64];
    let mut w_ij = vec![0.0; 64];
    let mut scratch = VariantScratch::new(Variant::Angular, 64, 4);
    let _ = &xi;

    c.bench_function("second/64-primaries", |b| {
        b.iter(|| {
            acc.second(
                &prim,
                &j,
                &mut bin_ij,
                &mut w_ij,
                Probability2::uniform(0.1),
                &mut scratch,
            )
        })
    });
}

fn bench_run_selection(c: &mut Criterion) {
    let particles = uniform_cube_catalog(6);
    let grid = Grid::build(particles, 1.0, true);
    let xi = TabulatedXi::constant(1.0);
    let draws = RandomDraws::new(2, 1.0, &xi);

    let params = Parameters {
        nbin: 5,
        mbin: 3,
        n2: 4,
        n3: 2,
        n4: 2,
        max_loops: 1,
        nthread: 1,
        multi_tracers: false,
        out_file: std::env::temp_dir().join("rustcov-bench-out"),
        power_norm: None,
        seed: 1,
        convergence_tol: 1e-6,
    };

    let driver = ComputeIntegral {
        params,
        catalogs: TracerCatalogs {
            one: &grid,
            two: None,
        },
        xi: [&xi, &xi, &xi],
        draws_one: &draws,
        draws_two: None,
        variant: Variant::Angular,
        r_edges: (0..=5).map(|b| b as f64).collect(),
        jackknife: None,
        survey_correction: None,
        jackknife_weights: None,
    };

    c.bench_function("run_selection/6^3-catalog-1-loop", |b| {
        b.iter(|| driver.run_selection((1, 1, 1, 1)).unwrap())
    });
}

fn main() {
    let mut c = Criterion::default().configure_from_args();
    bench_second(&mut c);
    bench_run_selection(&mut c);
    c.final_summary();
}
