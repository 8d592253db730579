//! Run parameters and their validation.
//!
//! `Parameters` is the boundary between the outside world (a config
//! file or CLI flags, assembled by the `tools` binary) and the
//! integrator core: everything downstream assumes a `Parameters` value
//! has already passed [`Parameters::validate`].

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Run parameters for one [`crate::compute_integral::ComputeIntegral`]
/// invocation.
#[derive(Debug, Clone)]
pub struct Parameters {
    /// Number of radial bins.
    pub nbin: usize,
    /// Number of angular bins, Legendre multipoles, or Fourier modes,
    /// depending on the binning variant.
    pub mbin: usize,
    /// Secondary particles drawn per primary.
    pub n2: usize,
    /// Tertiary particles drawn per secondary.
    pub n3: usize,
    /// Quaternary particles drawn per tertiary.
    pub n4: usize,
    /// Upper bound on reduction loops before giving up on convergence.
    pub max_loops: usize,
    /// Worker thread count.
    pub nthread: usize,
    /// Whether to iterate [`crate::tracer::MULTI_TRACER_COMBOS`] instead
    /// of a single tracer-index selection.
    pub multi_tracers: bool,
    /// Output directory for `save_integrals`/`save_jackknife_integrals`.
    pub out_file: PathBuf,
    /// Normalization divisor for the Power binning variant, if used.
    pub power_norm: Option<f64>,
    /// Seed multiplied by `(thread_index + 1)` to produce each worker's
    /// independent RNG stream. Bit-identical reruns are only guaranteed
    /// at `nthread == 1`; above that, which primary cells a given worker
    /// draws for depends on runtime scheduling of the dynamic work queue.
    pub seed: u64,
    /// Relative Frobenius-norm threshold below which a reduction is
    /// considered converged.
    pub convergence_tol: f64,
}

impl Parameters {
    /// Checks the invariants the driver relies on: branching factors
    /// must be positive, bin counts must be positive, and the thread
    /// count must not exceed what the machine actually offers.
    pub fn validate(&self) -> Result<()> {
        if self.nbin == 0 {
            return Err(Error::Config("nbin must be positive".into()));
        }
        if self.mbin == 0 {
            return Err(Error::Config("mbin must be positive".into()));
        }
        if self.n2 == 0 || self.n3 == 0 || self.n4 == 0 {
            return Err(Error::Config(
                "N2, N3 and N4 branching factors must all be positive".into(),
            ));
        }
        if self.max_loops == 0 {
            return Err(Error::Config("max_loops must be positive".into()));
        }
        if self.nthread == 0 {
            return Err(Error::Config("nthread must be positive".into()));
        }
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if self.nthread > available {
            return Err(Error::Config(format!(
                "nthread ({}) exceeds available parallelism ({available})",
                self.nthread
            )));
        }
        if !(self.convergence_tol > 0.0) {
            return Err(Error::Config("convergence_tol must be positive".into()));
        }
        Ok(())
    }
}
