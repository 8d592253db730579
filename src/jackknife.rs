//! Jackknife region weights.
//!
//! A survey is partitioned into jackknife regions for resampling error
//! estimation. [`JackknifeWeights`] supplies the per-(bin, region)
//! weight used by the jackknife-variant accumulator kernels; precomputing
//! those weights from the survey geometry is out of scope here.
//! [`product_weights`] builds the `nbin*mbin x nbin*mbin` outer-product
//! table [`crate::compute_integral::ComputeIntegral`] needs once per
//! tracer-index selection.

/// Supplies a per-(bin, region) weight.
pub trait JackknifeWeights: Send + Sync {
    fn num_regions(&self) -> usize;
    fn num_bins(&self) -> usize;
    fn weight(&self, region: usize, bin: usize) -> f64;
}

/// A dense `[region][bin]` weight table.
pub struct FlatJackknifeWeights {
    num_bins: usize,
    /// Row-major, region-major: `table[region * num_bins + bin]`.
    table: Vec<f64>,
}

impl FlatJackknifeWeights {
    pub fn new(num_regions: usize, num_bins: usize, table: Vec<f64>) -> Self {
        assert_eq!(table.len(), num_regions * num_bins);
        FlatJackknifeWeights { num_bins, table }
    }

    /// A trivial single-region weighting (every entry weight 1), useful
    /// as a baseline to check that the non-jackknife and jackknife
    /// totals agree.
    pub fn single_region(num_bins: usize) -> Self {
        FlatJackknifeWeights::new(1, num_bins, vec![1.0; num_bins])
    }
}

impl JackknifeWeights for FlatJackknifeWeights {
    fn num_regions(&self) -> usize {
        self.table.len() / self.num_bins
    }

    fn num_bins(&self) -> usize {
        self.num_bins
    }

    fn weight(&self, region: usize, bin: usize) -> f64 {
        self.table[region * self.num_bins + bin]
    }
}

/// The outer-product weight table between two bin-pair weightings,
/// `Sum_regions w_a[region, bin_a] * w_b[region, bin_b]`, flattened
/// row-major as `table[bin_a * nbins_b + bin_b]`.
///
/// `w_a` and `w_b` must share the same region count; a mismatch is a
/// caller bug (the jackknife regions partition one shared survey) and
/// is asserted rather than propagated as a `Result`.
pub fn product_weights(w_a: &dyn JackknifeWeights, w_b: &dyn JackknifeWeights) -> Vec<f64> {
    assert_eq!(
        w_a.num_regions(),
        w_b.num_regions(),
        "jackknife weight tables must share a region partition"
    );
    let (na, nb, nr) = (w_a.num_bins(), w_b.num_bins(), w_a.num_regions());
    let mut out = vec![0.0; na * nb];
    for region in 0..nr {
        for bin_a in 0..na {
            let wa = w_a.weight(region, bin_a);
            if wa == 0.0 {
                continue;
            }
            for bin_b in 0..nb {
                out[bin_a * nb + bin_b] += wa * w_b.weight(region, bin_b);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_weights_reduce_to_identity_for_single_region() {
        let w = FlatJackknifeWeights::single_region(3);
        let table = product_weights(&w, &w);
        assert_eq!(table.len(), 9);
        for v in table {
            assert_eq!(v, 1.0);
        }
    }
}
