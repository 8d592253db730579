//! The correlation function ξ(r) / ξ(r,µ).
//!
//! Construction of ξ from raw catalogs is explicitly out of scope for
//! this crate; what is in scope is the narrow interface the sampler
//! and accumulator need — point evaluation at an arbitrary separation
//! (and, for anisotropic tables, line-of-sight cosine). [`TabulatedXi`]
//! is a concrete, testable implementation by piecewise-linear
//! interpolation over a table, standing in for whatever precomputed
//! table a caller supplies.

/// Evaluates the correlation function at an arbitrary separation.
pub trait CorrelationFunction: Send + Sync {
    /// ξ(r), or ξ(r, µ) if the table is anisotropic. `mu` is ignored by
    /// isotropic implementations.
    fn eval(&self, r: f64, mu: f64) -> f64;
}

/// A piecewise-linear interpolation of ξ(r) over a radial table, with
/// optional µ-bins for an anisotropic table ξ(r, µ).
///
/// Evaluation outside the tabulated range extrapolates flat (returns
/// the boundary value) rather than panicking, since proposal
/// probabilities derived from `|xi(r)|` must stay well-defined for any
/// r the sampler can reach.
pub struct TabulatedXi {
    r_edges: Vec<f64>,
    /// `values[m]` is the radial table for µ-bin `m`; `values.len() ==
    /// mu_edges.len() - 1`, or `values.len() == 1` for an isotropic table.
    values: Vec<Vec<f64>>,
    mu_edges: Vec<f64>,
}

impl TabulatedXi {
    /// An isotropic ξ(r) table: `r_edges` has `values.len() + 1` entries.
    pub fn isotropic(r_edges: Vec<f64>, values: Vec<f64>) -> Self {
        assert_eq!(r_edges.len(), values.len() + 1);
        TabulatedXi {
            r_edges,
            values: vec![values],
            mu_edges: vec![0.0, 1.0],
        }
    }

    /// An anisotropic ξ(r, µ) table with `mu_edges.len() - 1` µ-bins,
    /// each holding a radial table matching `r_edges`.
    pub fn anisotropic(r_edges: Vec<f64>, mu_edges: Vec<f64>, values: Vec<Vec<f64>>) -> Self {
        assert_eq!(values.len(), mu_edges.len() - 1);
        for v in &values {
            assert_eq!(r_edges.len(), v.len() + 1);
        }
        TabulatedXi {
            r_edges,
            values,
            mu_edges,
        }
    }

    /// A constant ξ(r) ≡ c for every separation, used to exercise
    /// importance-sampling convergence against a value with a known
    /// analytic answer.
    pub fn constant(c: f64) -> Self {
        TabulatedXi::isotropic(vec![0.0, f64::INFINITY], vec![c])
    }

    fn mu_bin(&self, mu: f64) -> usize {
        if self.mu_edges.len() <= 2 {
            return 0;
        }
        let mu = mu.clamp(self.mu_edges[0], *self.mu_edges.last().unwrap());
        match self
            .mu_edges
            .binary_search_by(|edge| edge.partial_cmp(&mu).unwrap())
        {
            Ok(i) => i.min(self.values.len() - 1),
            Err(i) => (i.saturating_sub(1)).min(self.values.len() - 1),
        }
    }

    fn interp_radial(table: &[f64], r_edges: &[f64], r: f64) -> f64 {
        if table.is_empty() {
            return 0.0;
        }
        if r <= r_edges[0] {
            return table[0];
        }
        let last = r_edges.len() - 1;
        if r >= r_edges[last] {
            return table[table.len() - 1];
        }
        // Find the bin centers (midpoints of each edge pair) and
        // linearly interpolate between them.
        let centers: Vec<f64> = r_edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect();
        match centers.binary_search_by(|c| c.partial_cmp(&r).unwrap()) {
            Ok(i) => table[i],
            Err(0) => table[0],
            Err(i) if i >= centers.len() => table[table.len() - 1],
            Err(i) => {
                let (c0, c1) = (centers[i - 1], centers[i]);
                let t = (r - c0) / (c1 - c0);
                table[i - 1] + t * (table[i] - table[i - 1])
            }
        }
    }
}

impl CorrelationFunction for TabulatedXi {
    fn eval(&self, r: f64, mu: f64) -> f64 {
        let bin = self.mu_bin(mu);
        Self::interp_radial(&self.values[bin], &self.r_edges, r)
    }
}
