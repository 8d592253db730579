//! Geometric primitives shared by the grid, the random-draw sampler and
//! the integral accumulator.
//!
//! The survey this crate samples lives in ordinary 3-space, so rather
//! than stay generic over `nalgebra::DimName` the types here are
//! concretized to three dimensions: every quantity this crate touches —
//! cell coordinates, separations, the line-of-sight — is inherently 3D.

use nalgebra::{Point3, Vector3};

/// A point in the survey volume.
pub type Point3D = Point3<f64>;

/// A displacement or separation vector in the survey volume.
pub type Vec3D = Vector3<f64>;

/// An integer cell-lattice coordinate. May be negative or outside the
/// grid's bounds; [`crate::grid::Grid::test_cell`] is the only place
/// that turns this into a validated 1D cell index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CellCoord(pub [i64; 3]);

impl CellCoord {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        CellCoord([x, y, z])
    }

    pub fn x(&self) -> i64 {
        self.0[0]
    }

    pub fn y(&self) -> i64 {
        self.0[1]
    }

    pub fn z(&self) -> i64 {
        self.0[2]
    }
}

impl std::ops::Add for CellCoord {
    type Output = CellCoord;
    fn add(self, rhs: CellCoord) -> CellCoord {
        CellCoord([
            self.0[0] + rhs.0[0],
            self.0[1] + rhs.0[1],
            self.0[2] + rhs.0[2],
        ])
    }
}

impl std::ops::Sub for CellCoord {
    type Output = CellCoord;
    fn sub(self, rhs: CellCoord) -> CellCoord {
        CellCoord([
            self.0[0] - rhs.0[0],
            self.0[1] - rhs.0[1],
            self.0[2] - rhs.0[2],
        ])
    }
}

/// Separation and line-of-sight cosine between two points, as used by
/// [`crate::accumulator::IntegralAccumulator::second`] to bin a pair.
///
/// The line-of-sight is taken as the direction of the midpoint of `a`
/// and `b` from the origin, the common "observer at the origin"
/// convention for survey clustering statistics. Callers embedding a
/// periodic test box (no well-defined observer) should instead use
/// [`mu_from_fixed_axis`].
pub fn separation_and_mu(a: &Point3D, b: &Point3D) -> (f64, f64) {
    let r_vec = a - b;
    let r = r_vec.norm();
    if r == 0.0 {
        return (0.0, 0.0);
    }
    let los = (a.coords + b.coords) * 0.5;
    let los_norm = los.norm();
    let mu = if los_norm == 0.0 {
        0.0
    } else {
        (r_vec.dot(&los) / (r * los_norm)).abs()
    };
    (r, mu)
}

/// Separation and line-of-sight cosine against a fixed axis (typically
/// the z-axis), for periodic test geometries where there is no single
/// observer position.
pub fn mu_from_fixed_axis(r_vec: &Vec3D, axis: &Vec3D) -> f64 {
    let r = r_vec.norm();
    if r == 0.0 {
        return 0.0;
    }
    (r_vec.dot(axis) / (r * axis.norm())).abs()
}
