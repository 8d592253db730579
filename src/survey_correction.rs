//! Geometric window-function corrections for the Legendre and Power
//! binning variants.
//!
//! The core only ever reads a per-bin correction factor; how that
//! factor was derived from the survey's window function is out of
//! scope. [`FlatSurveyCorrection`] is a minimal, table-backed
//! implementation sufficient to exercise the Legendre and Power kernel
//! paths end to end.

/// Supplies a correction factor for a given (radial bin, multipole /
/// Fourier-mode) pair.
pub trait SurveyCorrection: Send + Sync {
    fn correction(&self, radial_bin: usize, mode_bin: usize) -> f64;
}

/// A flat `nbin x mbin` table of correction factors.
pub struct FlatSurveyCorrection {
    mbin: usize,
    table: Vec<f64>,
}

impl FlatSurveyCorrection {
    /// A correction table of all `1.0` (i.e. no correction), for
    /// geometries with no window-function leakage to model.
    pub fn unity(nbin: usize, mbin: usize) -> Self {
        FlatSurveyCorrection {
            mbin,
            table: vec![1.0; nbin * mbin],
        }
    }

    pub fn from_table(nbin: usize, mbin: usize, table: Vec<f64>) -> Self {
        assert_eq!(table.len(), nbin * mbin);
        FlatSurveyCorrection { mbin, table }
    }
}

impl SurveyCorrection for FlatSurveyCorrection {
    fn correction(&self, radial_bin: usize, mode_bin: usize) -> f64 {
        self.table[radial_bin * self.mbin + mode_bin]
    }
}
