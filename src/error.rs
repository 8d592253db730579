//! Crate-wide error type.
//!
//! Hot kernels never return [`Result`]: recoverable outcomes (an
//! out-of-grid cell draw, a collided particle id, an out-of-support
//! separation) are skipped and counted in place, as described in the
//! crate's top-level documentation. `Result` only appears at
//! construction, configuration validation and file-emission
//! boundaries.

use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A [`crate::config::Parameters`] value failed validation before any
    /// thread was spawned (e.g. `nthread` exceeds the runtime's available
    /// parallelism, or a branching factor is zero).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A page-aligned scratch buffer could not be allocated. Treated as
    /// fatal: the caller has no sane way to continue without per-thread
    /// scratch space.
    #[error("failed to allocate per-thread scratch buffer")]
    Allocation,

    /// Failure while reading a catalog, proposal table, or writing an
    /// accumulator snapshot to disk.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
