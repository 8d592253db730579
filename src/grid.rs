//! The uniform 3D cell grid.
//!
//! A `Grid` partitions the particles of one tracer catalog into a
//! regular cubic lattice of cells, sorts the particle array by cell so
//! that a cell's particles are a contiguous slice, and exposes the
//! cell-coordinate arithmetic and random-particle-draw primitives the
//! sampler needs. Once built, both the particle array and the cell
//! array are immutable.

use crate::geometry::{CellCoord, Vec3D};
use crate::particle::Particle;
use crate::tracer::TracerClass;
use rand::Rng;

/// A contiguous run of particles within [`Grid::particles`], plus the
/// per-tracer partition counts within that run and the cell's cubic
/// coordinate.
///
/// Invariant: `particles[start..start + count]` is partitioned so that
/// tracer-1 particles come first (`np1` of them), followed by tracer-2
/// particles (`np2` of them); `count == np1 + np2`. This lets the
/// sampler draw uniformly from one tracer partition of a cell without
/// a second pass.
#[derive(Debug, Clone, Copy)]
pub struct Cell {
    pub start: usize,
    pub count: usize,
    pub np1: usize,
    pub np2: usize,
    pub coord: CellCoord,
}

impl Cell {
    fn empty(coord: CellCoord) -> Self {
        Cell {
            start: 0,
            count: 0,
            np1: 0,
            np2: 0,
            coord,
        }
    }
}

/// The sentinel returned by [`Grid::test_cell`] when a 3D cell
/// coordinate falls outside the grid's bounds.
pub const OUT_OF_GRID: Option<usize> = None;

pub struct Grid {
    /// Particle array, contiguous and sorted by cell.
    pub p: Vec<Particle>,
    /// Cell array, addressable by 1D index via [`Grid::cell_id_from_1d`]
    /// and its inverse.
    pub c: Vec<Cell>,
    /// 1D ids of the cells with `count > 0`.
    pub filled: Vec<usize>,
    /// Number of cells along each axis.
    dims: [i64; 3],
    /// Cell edge length.
    pub cell_size: f64,
    /// Lower corner of the grid's bounding box, so cell 0 starts there.
    origin: Vec3D,
    /// Whether `cell_sep` wraps displacements across the grid's bounds.
    pub periodic: bool,
    /// Total particle weight in the grid.
    pub norm: f64,
    /// Maximum particle count in any one cell.
    pub maxnp: usize,
}

impl Grid {
    /// Builds a grid over `particles`, partitioning space into cells of
    /// edge length `cell_size`, with the grid's own bounding box as the
    /// cell-coordinate origin. `particles` is consumed and reordered;
    /// the returned grid owns the reordered array.
    ///
    /// Only appropriate for a single-tracer run, or as the *first* of
    /// several catalogs sharing a survey footprint: two grids built
    /// this way independently generally disagree on where cell `(0,0,0)`
    /// sits, so a cell-coordinate delta computed against one is
    /// meaningless against the other. Cross-tracer / multi-tracer runs
    /// must use [`Grid::build_in_box`] with a common bounding box —
    /// see [`combined_bounding_box`].
    pub fn build(particles: Vec<Particle>, cell_size: f64, periodic: bool) -> Grid {
        let (min, max) = bounding_box(&particles);
        Grid::build_in_box(particles, cell_size, periodic, min, max)
    }

    /// Builds a grid over `particles` using an externally supplied
    /// bounding box rather than computing one from `particles` itself.
    /// This is what lets several tracer catalogs share one cell-index
    /// coordinate frame: the driver tests a cell coordinate derived from
    /// `grid1` against `grid2`/`grid3`/`grid4`, which is only meaningful
    /// if they all agree on the origin.
    pub fn build_in_box(
        mut particles: Vec<Particle>,
        cell_size: f64,
        periodic: bool,
        min: crate::geometry::Point3D,
        max: crate::geometry::Point3D,
    ) -> Grid {
        assert!(cell_size > 0.0, "cell_size must be positive");

        let span = max - min.coords;
        let dims = [
            ((span.x / cell_size).ceil() as i64).max(1),
            ((span.y / cell_size).ceil() as i64).max(1),
            ((span.z / cell_size).ceil() as i64).max(1),
        ];
        let origin = min.coords;

        let cell_of = |p: &Particle| -> CellCoord {
            let rel = p.pos.coords - origin;
            CellCoord::new(
                (rel.x / cell_size).floor() as i64,
                (rel.y / cell_size).floor() as i64,
                (rel.z / cell_size).floor() as i64,
            )
        };

        let ncells = (dims[0] * dims[1] * dims[2]) as usize;
        let mut cells: Vec<Cell> = (0..ncells)
            .map(|id1| Cell::empty(coord_of_1d(id1, dims)))
            .collect();

        // Partial partition-by-cell sort: first by cell id, then within a
        // cell, tracer-1 particles before tracer-2 particles, so `np1`/
        // `np2` can be recovered from a single linear scan.
        particles.sort_by_key(|p| {
            let id1 = id1_of(cell_of(p), dims);
            let tracer_rank = match p.tracer {
                Some(TracerClass::One) | None => 0u8,
                Some(TracerClass::Two) => 1u8,
            };
            (id1, tracer_rank)
        });

        let mut maxnp = 0;
        let mut norm = 0.0;
        let mut idx = 0;
        while idx < particles.len() {
            let id1 = id1_of(cell_of(&particles[idx]), dims);
            let start = idx;
            let mut np1 = 0;
            let mut np2 = 0;
            while idx < particles.len() && id1_of(cell_of(&particles[idx]), dims) == id1 {
                match particles[idx].tracer {
                    Some(TracerClass::Two) => np2 += 1,
                    _ => np1 += 1,
                }
                norm += particles[idx].weight;
                idx += 1;
            }
            let count = np1 + np2;
            maxnp = maxnp.max(count);
            cells[id1] = Cell {
                start,
                count,
                np1,
                np2,
                coord: coord_of_1d(id1, dims),
            };
        }

        let filled: Vec<usize> = (0..ncells).filter(|&id| cells[id].count > 0).collect();

        Grid {
            p: particles,
            c: cells,
            filled,
            dims,
            cell_size,
            origin,
            periodic,
            norm,
            maxnp,
        }
    }

    /// Number of filled (nonempty) cells.
    pub fn nf(&self) -> usize {
        self.filled.len()
    }

    /// The 1D id of the `n`-th nonempty cell.
    pub fn filled_at(&self, n: usize) -> usize {
        self.filled[n]
    }

    /// Converts a 1D cell id to its 3D cubic coordinate.
    pub fn cell_id_from_1d(&self, id1: usize) -> CellCoord {
        coord_of_1d(id1, self.dims)
    }

    /// Looks up the 1D cell id of a 3D coordinate, or `None` if it
    /// falls outside the grid's bounds.
    pub fn test_cell(&self, coord: CellCoord) -> Option<usize> {
        if coord.x() < 0
            || coord.y() < 0
            || coord.z() < 0
            || coord.x() >= self.dims[0]
            || coord.y() >= self.dims[1]
            || coord.z() >= self.dims[2]
        {
            return None;
        }
        Some(id1_of(coord, self.dims))
    }

    /// Spatial displacement corresponding to a cell-coordinate delta.
    /// Under periodic geometry this wraps across the grid's extent;
    /// under non-periodic geometry it is the raw offset.
    pub fn cell_sep(&self, delta: CellCoord) -> Vec3D {
        let raw = Vec3D::new(
            delta.x() as f64 * self.cell_size,
            delta.y() as f64 * self.cell_size,
            delta.z() as f64 * self.cell_size,
        );
        if !self.periodic {
            return raw;
        }
        let wrap = |v: f64, n: i64| -> f64 {
            let extent = n as f64 * self.cell_size;
            let half = extent / 2.0;
            if v > half {
                v - extent
            } else if v < -half {
                v + extent
            } else {
                v
            }
        };
        Vec3D::new(
            wrap(raw.x, self.dims[0]),
            wrap(raw.y, self.dims[1]),
            wrap(raw.z, self.dims[2]),
        )
    }

    /// The particles of a given 1D cell id.
    pub fn cell_particles(&self, id1: usize) -> &[Particle] {
        let cell = &self.c[id1];
        &self.p[cell.start..cell.start + cell.count]
    }

    /// Draws a uniformly random particle from the named cell,
    /// optionally restricted to one tracer partition. Returns `None`
    /// if the cell is empty (or the requested partition within it is
    /// empty), for the caller to skip and count.
    pub fn draw_particle<R: Rng + ?Sized>(
        &self,
        id1: usize,
        partition: Option<TracerClass>,
        rng: &mut R,
    ) -> Option<(usize, &Particle)> {
        let cell = &self.c[id1];
        let (offset, len) = match partition {
            None => (0, cell.count),
            Some(TracerClass::One) => (0, cell.np1),
            Some(TracerClass::Two) => (cell.np1, cell.np2),
        };
        if len == 0 {
            return None;
        }
        let local = rng.gen_range(0..len);
        let global_idx = cell.start + offset + local;
        Some((global_idx, &self.p[global_idx]))
    }
}

fn id1_of(coord: CellCoord, dims: [i64; 3]) -> usize {
    (coord.x() + dims[0] * (coord.y() + dims[1] * coord.z())) as usize
}

fn coord_of_1d(id1: usize, dims: [i64; 3]) -> CellCoord {
    let id1 = id1 as i64;
    let x = id1 % dims[0];
    let y = (id1 / dims[0]) % dims[1];
    let z = id1 / (dims[0] * dims[1]);
    CellCoord::new(x, y, z)
}

fn bounding_box(particles: &[Particle]) -> (crate::geometry::Point3D, crate::geometry::Point3D) {
    use crate::geometry::Point3D;
    let mut min = Point3D::new(f64::INFINITY, f64::INFINITY, f64::INFINITY);
    let mut max = Point3D::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    for p in particles {
        min.x = min.x.min(p.pos.x);
        min.y = min.y.min(p.pos.y);
        min.z = min.z.min(p.pos.z);
        max.x = max.x.max(p.pos.x);
        max.y = max.y.max(p.pos.y);
        max.z = max.z.max(p.pos.z);
    }
    // Guard against a degenerate (single-point or empty) catalog so
    // `span` is never zero, which would otherwise produce zero-sized
    // grid dimensions.
    if !min.x.is_finite() {
        min = Point3D::origin();
        max = Point3D::origin();
    }
    max.x = max.x.max(min.x + 1e-9);
    max.y = max.y.max(min.y + 1e-9);
    max.z = max.z.max(min.z + 1e-9);
    (min, max)
}

/// The bounding box enclosing every particle across several catalogs,
/// for [`Grid::build_in_box`] callers that need two or more tracer
/// grids to share one cell-coordinate frame (a cross-tracer or
/// multi-tracer run).
pub fn combined_bounding_box(
    catalogs: &[&[Particle]],
) -> (crate::geometry::Point3D, crate::geometry::Point3D) {
    use crate::geometry::Point3D;
    let mut min = Point3D::new(f64::INFINITY, f64::INFINITY, f64::INFINITY);
    let mut max = Point3D::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    for catalog in catalogs {
        let (lo, hi) = bounding_box(catalog);
        min.x = min.x.min(lo.x);
        min.y = min.y.min(lo.y);
        min.z = min.z.min(lo.z);
        max.x = max.x.max(hi.x);
        max.y = max.y.max(hi.y);
        max.z = max.z.max(hi.z);
    }
    (min, max)
}
