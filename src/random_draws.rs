//! The biased cell-offset sampler.
//!
//! `RandomDraws` draws an integer cell displacement from a finite cube
//! of candidate offsets, with probability proportional either to 1/r²
//! (mirroring the typical pair-count falloff) or to |ξ(r)|. Both
//! distributions are built once at construction — the offsets, their
//! separations and the correlation-function table are all immutable —
//! and shared read-only across worker threads.

use crate::correlation::CorrelationFunction;
use crate::geometry::CellCoord;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// A small floor under any proposal weight, so that `p` stays strictly
/// positive for any offset in the proposal's support even where ξ(r)
/// evaluates to exactly zero.
const MIN_WEIGHT: f64 = 1e-12;

pub struct RandomDraws {
    offsets: Vec<CellCoord>,
    dist_inv_r2: WeightedIndex<f64>,
    probs_inv_r2: Vec<f64>,
    dist_xi: WeightedIndex<f64>,
    probs_xi: Vec<f64>,
}

impl RandomDraws {
    /// Builds the two proposal distributions over every integer cell
    /// offset within `radius_cells` (inclusive, Chebyshev distance) of
    /// the origin, using `cell_size` to turn offsets into physical
    /// separations and `xi` to weight the second distribution.
    pub fn new(radius_cells: i64, cell_size: f64, xi: &dyn CorrelationFunction) -> Self {
        assert!(radius_cells >= 0);
        assert!(cell_size > 0.0);

        let mut offsets = Vec::new();
        for dx in -radius_cells..=radius_cells {
            for dy in -radius_cells..=radius_cells {
                for dz in -radius_cells..=radius_cells {
                    offsets.push(CellCoord::new(dx, dy, dz));
                }
            }
        }

        let separations: Vec<f64> = offsets
            .iter()
            .map(|c| {
                let r = cell_size
                    * ((c.x() * c.x() + c.y() * c.y() + c.z() * c.z()) as f64).sqrt();
                // The zero offset has no well-defined 1/r^2 weight;
                // treat it as half a cell-width away, same order of
                // magnitude as its nearest neighbors.
                r.max(cell_size * 0.5)
            })
            .collect();

        let w_inv_r2: Vec<f64> = separations
            .iter()
            .map(|r| (1.0 / (r * r)).max(MIN_WEIGHT))
            .collect();
        let w_xi: Vec<f64> = separations
            .iter()
            .map(|r| xi.eval(*r, 0.0).abs().max(MIN_WEIGHT))
            .collect();

        let probs_inv_r2 = uniform_ratio(&w_inv_r2);
        let probs_xi = uniform_ratio(&w_xi);

        let dist_inv_r2 = WeightedIndex::new(&w_inv_r2).expect("nonempty positive weights");
        let dist_xi = WeightedIndex::new(&w_xi).expect("nonempty positive weights");

        RandomDraws {
            offsets,
            dist_inv_r2,
            probs_inv_r2,
            dist_xi,
            probs_xi,
        }
    }

    /// Samples a cell displacement with probability proportional to
    /// 1/r². Returns the displacement and the ratio of this proposal's
    /// probability to uniform sampling over the same support.
    pub fn random_cubedraw<R: Rng + ?Sized>(&self, rng: &mut R) -> (CellCoord, f64) {
        let idx = self.dist_inv_r2.sample(rng);
        (self.offsets[idx], self.probs_inv_r2[idx])
    }

    /// Samples a cell displacement with probability proportional to |ξ(r)|.
    pub fn random_xidraw<R: Rng + ?Sized>(&self, rng: &mut R) -> (CellCoord, f64) {
        let idx = self.dist_xi.sample(rng);
        (self.offsets[idx], self.probs_xi[idx])
    }
}

/// `n * w_i / sum(w)` for each weight: the ratio of the weighted
/// sampling probability to the uniform-over-n-candidates probability.
fn uniform_ratio(weights: &[f64]) -> Vec<f64> {
    let n = weights.len() as f64;
    let sum: f64 = weights.iter().sum();
    weights.iter().map(|w| n * w / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::TabulatedXi;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn draws_always_have_positive_probability() {
        let xi = TabulatedXi::constant(1.0);
        let rd = RandomDraws::new(2, 1.0, &xi);
        let mut rng = Pcg64::seed_from_u64(42);
        for _ in 0..1000 {
            let (_, p) = rd.random_cubedraw(&mut rng);
            assert!(p > 0.0);
            let (_, p) = rd.random_xidraw(&mut rng);
            assert!(p > 0.0);
        }
    }

    #[test]
    fn support_is_the_full_cube() {
        let xi = TabulatedXi::constant(1.0);
        let rd = RandomDraws::new(1, 1.0, &xi);
        assert_eq!(rd.offsets.len(), 27);
    }
}
