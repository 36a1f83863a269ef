//! Errors surfaced by a conversion run.

use crate::accel::AccelError;

/// The single error type returned by the public conversion API.
///
/// A run either produces the finished archive and returns `Ok`, or leaves no
/// output on disk and returns exactly one of these. Accelerator failures are
/// normally recovered by CPU fallback inside the scheduler and never reach
/// the caller; they only surface as [`Error::Accel`] when the run was pinned
/// to the GPU with `GpuMode::GpuOnly`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Header magic/version or layer-table structure unparseable.
    #[error("invalid slice file: {0}")]
    InvalidFormat(String),

    /// Read/write failure on the source or destination file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Host allocation failed.
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    /// Entry count, name length or size would exceed what ZIP can express.
    #[error("archive limit exceeded: {0}")]
    ArchiveLimit(String),

    /// The run's cancel token was set; the partial output has been removed.
    #[error("conversion cancelled")]
    Cancelled,

    /// A GPU backend failed and `GpuMode::GpuOnly` forbids CPU fallback.
    #[error("accelerator error: {0}")]
    Accel(#[from] AccelError),
}

impl Error {
    /// Whether this error corresponds to user cancellation rather than a
    /// genuine failure. Cancellation is reported but never logged as an
    /// error by the pipeline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
