//! Run diagnostics: acceptance ratios, throughput, per-loop progress.
//!
//! The driver itself only ever *computes* acceptance ratios and
//! throughput; this module turns those numbers into the `tracing`
//! events a caller's subscriber renders, keeping that presentation
//! concern out of the Monte Carlo kernels themselves.

use crate::accumulator::AttemptedCounts;
use std::time::Duration;

/// The fraction of attempted draws that produced an accepted
/// contribution, for each of the 2-, 3- and 4-point sums. Every
/// out-of-support separation silently dropped by the accumulator
/// kernels shows up here as a lower ratio.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptanceRatios {
    pub pair: f64,
    pub triple: f64,
    pub quad: f64,
}

impl AcceptanceRatios {
    pub fn compute(attempted: &AttemptedCounts, cnt2: u64, cnt3: u64, cnt4: u64) -> Self {
        AcceptanceRatios {
            pair: ratio(cnt2 as f64, attempted.pairs),
            triple: ratio(cnt3 as f64, attempted.triples),
            quad: ratio(cnt4 as f64, attempted.quads),
        }
    }
}

fn ratio(accepted: f64, attempted: f64) -> f64 {
    if attempted > 0.0 {
        accepted / attempted
    } else {
        0.0
    }
}

/// Quads processed per second of wall-clock time.
pub fn throughput(quads_attempted: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        quads_attempted / secs
    } else {
        0.0
    }
}

/// Emits a per-loop `tracing` line with the estimated time remaining
/// and the Frobenius deltas already computed by
/// [`crate::accumulator::IntegralAccumulator::frobenius_difference_sum`].
pub fn log_progress(
    loop_number: usize,
    max_loops: usize,
    elapsed_so_far: Duration,
    deltas: &crate::accumulator::FrobeniusDeltas,
) {
    let remaining = max_loops.saturating_sub(loop_number);
    let per_loop = if loop_number > 0 {
        elapsed_so_far.as_secs_f64() / loop_number as f64
    } else {
        0.0
    };
    let eta = Duration::from_secs_f64(per_loop * remaining as f64);
    tracing::info!(
        loop_number,
        max_loops,
        eta_secs = eta.as_secs_f64(),
        f2 = deltas.f2,
        f3 = deltas.f3,
        f4 = deltas.f4,
        "reduction progress"
    );
}

/// Emits the final summary line: acceptance ratios and throughput.
pub fn log_final_summary(ratios: AcceptanceRatios, quads_per_sec: f64) {
    tracing::info!(
        pair_acceptance = ratios.pair,
        triple_acceptance = ratios.triple,
        quad_acceptance = ratios.quad,
        quads_per_sec,
        "run complete"
    );
}
