use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Every failure the extractor can surface, grouped by recovery policy.
///
/// Input and range errors are fatal for the slice being parsed; metadata
/// inconsistencies and unresolved references are recovered at the next
/// section boundary; cancellation aborts the whole pipeline.
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("range out of bounds: offset {offset:#x} + len {len:#x} exceeds size {size:#x}")]
    RangeOutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("inconsistent metadata: {0}")]
    Inconsistent(String),

    #[error("unresolved reference to {0:#x}")]
    Unresolved(u64),

    #[error("partial demangle of `{0}`")]
    PartialDemangle(String),

    #[error("cancelled")]
    Cancelled,

    #[error("demangle delegate failed: {0}")]
    Delegate(String),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to open {path}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to stat {path}")]
    StatFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to mmap {path}")]
    MmapFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type DumpResult<T> = Result<T, DumpError>;

impl DumpError {
    /// Process exit code for the binary driver.
    pub fn exit_code(&self) -> i32 {
        match self {
            DumpError::InvalidInput(_)
            | DumpError::FileNotFound(_)
            | DumpError::OpenFailed { .. }
            | DumpError::StatFailed { .. }
            | DumpError::MmapFailed { .. } => 1,
            DumpError::RangeOutOfBounds { .. } => 2,
            DumpError::Cancelled => 3,
            _ => 64,
        }
    }

    pub(crate) fn range(offset: u64, len: u64, size: u64) -> DumpError {
        DumpError::RangeOutOfBounds { offset, len, size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        assert_eq!(DumpError::InvalidInput("bad magic".into()).exit_code(), 1);
        assert_eq!(DumpError::range(10, 4, 8).exit_code(), 2);
        assert_eq!(DumpError::Cancelled.exit_code(), 3);
        assert_eq!(DumpError::Unresolved(0x1000).exit_code(), 64);
    }
}
