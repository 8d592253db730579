//! Tracer-class bookkeeping.
//!
//! A particle catalog may mix two tracer populations (e.g. two galaxy
//! samples). `rustcov` selects, for any 4-tuple of tracer indices
//! `(I1, I2, I3, I4)`, which grid/correlation-function/survey-correction
//! objects to use via [`pair_index`], and — when `multi_tracers` is
//! enabled — iterates a fixed table of 7 combinations ([`MULTI_TRACER_COMBOS`]).

/// Which of the (at most two) tracer populations a particle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TracerClass {
    One,
    Two,
}

impl TracerClass {
    pub fn index(self) -> u8 {
        match self {
            TracerClass::One => 1,
            TracerClass::Two => 2,
        }
    }
}

/// Maps a pair of tracer indices to one of three selector slots:
/// self-pairs `(1,1)` to slot 0, `(2,2)` to slot 1, and any mixed pair
/// to slot 2 — for picking a ξ table, survey-correction table, or
/// jackknife-weight table out of a small per-pair object set.
/// [`crate::compute_integral::ComputeIntegral`] uses it to index its
/// 3-slot `xi`/`survey_correction`/`jackknife_weights` arrays.
pub fn pair_index(i: u8, j: u8) -> usize {
    match (i, j) {
        (1, 1) => 0,
        (2, 2) => 1,
        _ => 2,
    }
}

/// The 7 tracer-index combinations iterated when `multi_tracers` is
/// enabled: `1111, 1112, 1122, 1222, 2222, 1121, 1212`.
///
/// Made explicit and testable here rather than threaded through as an
/// opaque `iter_no`.
pub const MULTI_TRACER_COMBOS: [(u8, u8, u8, u8); 7] = [
    (1, 1, 1, 1),
    (1, 1, 1, 2),
    (1, 1, 2, 2),
    (1, 2, 2, 2),
    (2, 2, 2, 2),
    (1, 1, 2, 1),
    (1, 2, 1, 2),
];
