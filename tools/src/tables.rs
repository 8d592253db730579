//! Loaders for the small ancillary tables `rustcov` consumes: a
//! tabulated ξ(r), a flat survey-correction table, and a per-particle
//! jackknife-region assignment. All three are simple whitespace-delimited
//! ASCII formats, the same texture as [`crate::catalog`].

use anyhow::{bail, Context, Result};
use rustcov::correlation::TabulatedXi;
use rustcov::jackknife::FlatJackknifeWeights;
use rustcov::survey_correction::FlatSurveyCorrection;
use std::path::Path;

/// Loads a two-column `r xi` table (one bin center per line, ascending
/// `r`) and reconstructs bin edges as the midpoints between consecutive
/// centers, extrapolating the first and last edges outward by half the
/// adjacent bin width.
pub fn load_xi_table(path: &Path) -> Result<TabulatedXi> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to open xi table {}", path.display()))?;

    let mut centers = Vec::new();
    let mut values = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            bail!(
                "{}:{}: expected exactly 2 fields (r, xi), got {}",
                path.display(),
                lineno + 1,
                fields.len()
            );
        }
        centers.push(fields[0].parse::<f64>().with_context(|| {
            format!("{}:{}: invalid radius {:?}", path.display(), lineno + 1, fields[0])
        })?);
        values.push(fields[1].parse::<f64>().with_context(|| {
            format!("{}:{}: invalid xi value {:?}", path.display(), lineno + 1, fields[1])
        })?);
    }
    if centers.len() < 2 {
        bail!("{}: xi table needs at least 2 rows to define bin edges", path.display());
    }

    let r_edges = edges_from_centers(&centers);
    Ok(TabulatedXi::isotropic(r_edges, values))
}

/// `n` centers in, `n + 1` edges out: interior edges are midpoints,
/// and the two outer edges extend by the width of their adjacent bin.
fn edges_from_centers(centers: &[f64]) -> Vec<f64> {
    let n = centers.len();
    let mut edges = Vec::with_capacity(n + 1);
    edges.push(centers[0] - 0.5 * (centers[1] - centers[0]));
    for w in centers.windows(2) {
        edges.push(0.5 * (w[0] + w[1]));
    }
    edges.push(centers[n - 1] + 0.5 * (centers[n - 1] - centers[n - 2]));
    edges
}

/// Loads an `nbin x mbin` survey-correction table: a header line
/// `nbin mbin` followed by `nbin * mbin` whitespace-separated values in
/// row-major (radial-bin-major) order.
pub fn load_survey_correction(path: &Path) -> Result<FlatSurveyCorrection> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to open survey correction table {}", path.display()))?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty() && !l.trim().starts_with('#'));

    let header = lines
        .next()
        .with_context(|| format!("{}: missing header line", path.display()))?;
    let mut header_fields = header.split_whitespace();
    let nbin: usize = header_fields
        .next()
        .context("missing nbin in header")?
        .parse()
        .context("invalid nbin in header")?;
    let mbin: usize = header_fields
        .next()
        .context("missing mbin in header")?
        .parse()
        .context("invalid mbin in header")?;

    let values: Result<Vec<f64>> = lines
        .flat_map(str::split_whitespace)
        .map(|tok| tok.parse::<f64>().with_context(|| format!("invalid value {tok:?}")))
        .collect();
    let values = values?;
    if values.len() != nbin * mbin {
        bail!(
            "{}: header declares {} x {} = {} values, found {}",
            path.display(),
            nbin,
            mbin,
            nbin * mbin,
            values.len()
        );
    }
    Ok(FlatSurveyCorrection::from_table(nbin, mbin, values))
}

/// Loads a per-particle jackknife-region assignment: one non-negative
/// integer region id per line, in the same order as the primary
/// catalog file, and builds the trivial all-ones weight table
/// (region `r`, bin `b`) the driver needs for the `product_weights`
/// table (region membership alone, no per-region amplitude scaling).
pub fn load_region_assignment(path: &Path) -> Result<Vec<usize>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to open jackknife region file {}", path.display()))?;
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            l.parse::<usize>()
                .with_context(|| format!("{}: invalid region id {l:?}", path.display()))
        })
        .collect()
}

/// A single-region jackknife weighting over `num_bins` bins, used as
/// the default when no jackknife table is supplied.
pub fn unity_jackknife_weights(num_bins: usize) -> FlatJackknifeWeights {
    FlatJackknifeWeights::single_region(num_bins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn xi_table_edges_bracket_every_center() {
        let file = write_tmp("1.0 5.0\n3.0 2.0\n5.0 1.0\n");
        let xi = load_xi_table(file.path()).unwrap();
        assert_eq!(xi.eval(1.0, 0.0), 5.0);
        assert_eq!(xi.eval(5.0, 0.0), 1.0);
    }

    #[test]
    fn survey_correction_rejects_mismatched_counts() {
        let file = write_tmp("2 2\n1.0 1.0 1.0\n");
        assert!(load_survey_correction(file.path()).is_err());
    }

    #[test]
    fn survey_correction_round_trips_values() {
        let file = write_tmp("2 2\n1.0 2.0\n3.0 4.0\n");
        let table = load_survey_correction(file.path()).unwrap();
        assert_eq!(table.correction(0, 1), 2.0);
        assert_eq!(table.correction(1, 0), 3.0);
    }

    #[test]
    fn region_assignment_skips_blank_and_comment_lines() {
        let file = write_tmp("# comment\n0\n1\n\n2\n");
        let regions = load_region_assignment(file.path()).unwrap();
        assert_eq!(regions, vec![0, 1, 2]);
    }
}
