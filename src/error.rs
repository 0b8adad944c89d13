use std::io;
use std::path::PathBuf;

/// Copyable discriminant of [`Error`], handy for matching in callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ReadFailure,
    NoGzipSignature,
    InputUnavailable,
    OutputUnavailable,
    OutputEmpty,
    OutputDirectoryEmpty,
    DeflateOperationFailed,
    TarExtractionFailedForCurrentHeader,
    TarRealignmentFailedForCurrentHeader,
    TarExtractionFailedForEntireArchive,
    UnsafeEntryPath,
    TruncatedEntry,
    ExceptionWasThrown,
}

/// Something that went wrong without being an expected outcome of the format.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("panicked: {0}")]
    Panic(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not read gzip header and footer: {needed} bytes needed, {available} available")]
    ReadFailure { needed: usize, available: u64 },

    #[error("input has no gzip signature (header: {header})")]
    NoGzipSignature { header: String },

    #[error("input is not usable: {reason}")]
    InputUnavailable { reason: String },

    #[error("output is not usable: {reason}")]
    OutputUnavailable { reason: String },

    #[error("output '{target}' is empty")]
    OutputEmpty { target: String },

    #[error("output directory '{path}' is empty")]
    OutputDirectoryEmpty { path: PathBuf },

    #[error("fallback deflate operation failed: {source}")]
    DeflateOperationFailed { source: Box<Error> },

    #[error("extraction failed for tar entry '{name}': {source}")]
    TarExtractionFailedForCurrentHeader { name: String, source: Box<Error> },

    #[error("realignment failed for tar block at header offset {offset}: {source}")]
    TarRealignmentFailedForCurrentHeader { offset: u64, source: Box<Error> },

    #[error("no file could be extracted from the tar archive ({expected} file header(s) found)")]
    TarExtractionFailedForEntireArchive { expected: usize },

    #[error("entry path '{name}' escapes the output directory")]
    UnsafeEntryPath { name: String },

    #[error("entry ended after {read} of {declared} bytes")]
    TruncatedEntry { declared: u64, read: u64 },

    #[error("unexpected fault in {origin}: {source}")]
    ExceptionWasThrown {
        origin: &'static str,
        source: Fault,
    },
}

impl Error {
    /// Wraps an unexpected fault raised inside the stage named by `origin`.
    pub fn exception(origin: &'static str, fault: impl Into<Fault>) -> Self {
        Self::ExceptionWasThrown {
            origin,
            source: fault.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ReadFailure { .. } => ErrorKind::ReadFailure,
            Self::NoGzipSignature { .. } => ErrorKind::NoGzipSignature,
            Self::InputUnavailable { .. } => ErrorKind::InputUnavailable,
            Self::OutputUnavailable { .. } => ErrorKind::OutputUnavailable,
            Self::OutputEmpty { .. } => ErrorKind::OutputEmpty,
            Self::OutputDirectoryEmpty { .. } => ErrorKind::OutputDirectoryEmpty,
            Self::DeflateOperationFailed { .. } => ErrorKind::DeflateOperationFailed,
            Self::TarExtractionFailedForCurrentHeader { .. } => {
                ErrorKind::TarExtractionFailedForCurrentHeader
            }
            Self::TarRealignmentFailedForCurrentHeader { .. } => {
                ErrorKind::TarRealignmentFailedForCurrentHeader
            }
            Self::TarExtractionFailedForEntireArchive { .. } => {
                ErrorKind::TarExtractionFailedForEntireArchive
            }
            Self::UnsafeEntryPath { .. } => ErrorKind::UnsafeEntryPath,
            Self::TruncatedEntry { .. } => ErrorKind::TruncatedEntry,
            Self::ExceptionWasThrown { .. } => ErrorKind::ExceptionWasThrown,
        }
    }

    /// The error nested inside a wrapping variant, if any.
    pub fn inner(&self) -> Option<&Error> {
        match self {
            Self::DeflateOperationFailed { source }
            | Self::TarExtractionFailedForCurrentHeader { source, .. }
            | Self::TarRealignmentFailedForCurrentHeader { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let err = Error::ReadFailure {
            needed: 18,
            available: 3,
        };
        assert_eq!(err.kind(), ErrorKind::ReadFailure);
        assert!(err.to_string().contains("18 bytes needed"));
    }

    #[test]
    fn nested_error_is_reachable() {
        let err = Error::DeflateOperationFailed {
            source: Box::new(Error::OutputEmpty {
                target: "stream".to_string(),
            }),
        };
        assert_eq!(err.inner().map(Error::kind), Some(ErrorKind::OutputEmpty));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn exception_keeps_origin_and_fault() {
        let io_err = io::Error::new(io::ErrorKind::InvalidData, "corrupt deflate stream");
        let err = Error::exception("direct decompression", io_err);
        assert_eq!(err.kind(), ErrorKind::ExceptionWasThrown);
        let text = err.to_string();
        assert!(text.contains("direct decompression"));
        assert!(text.contains("corrupt deflate stream"));
    }
}
