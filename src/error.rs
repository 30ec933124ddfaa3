//! Structured error type shared across the codec pipeline.

use std::fmt;
use std::io;

use thiserror::Error;

/// Convenience alias used by every fallible call in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a codec error.
///
/// The kind decides how a caller may react; the per-error context string
/// says which stage and byte offset produced it. `ShortRead` is the only
/// recoverable kind and only when the caller declared the read optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The source ran out of bytes before a mandatory read completed.
    ShortRead,
    /// An entry header failed to parse; the session is no longer usable.
    CorruptHeader,
    /// No registered format bid above the threshold at open time.
    UnrecognizedFormat,
    /// A named filter is unknown or not compiled into this build.
    UnrecognizedFilter,
    /// The target format cannot represent the supplied entry.
    UnsupportedEntryKind,
    /// Filter bidding kept succeeding past the configured chain depth.
    ChainDepthExceeded,
    /// A filter stage could not flush its trailer on close.
    IncompleteFilterFlush,
    /// The caller broke an API contract (misuse, not malformed input).
    ProtocolViolation,
    /// An I/O error from the underlying source or sink.
    Io,
}

impl ErrorKind {
    /// Stable lower-case label used in messages and logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ShortRead => "short read",
            Self::CorruptHeader => "corrupt header",
            Self::UnrecognizedFormat => "unrecognized format",
            Self::UnrecognizedFilter => "unrecognized filter",
            Self::UnsupportedEntryKind => "unsupported entry kind",
            Self::ChainDepthExceeded => "filter chain depth exceeded",
            Self::IncompleteFilterFlush => "incomplete filter flush",
            Self::ProtocolViolation => "protocol violation",
            Self::Io => "i/o error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error carrying a structured kind plus human-readable context.
///
/// Every fallible call returns this directly; there is no side-channel
/// error state to query afterwards. I/O failures keep the original
/// [`io::Error`] as their source so callers can still inspect the OS kind.
#[derive(Debug, Error)]
#[error("{kind}: {context}")]
pub struct Error {
    kind: ErrorKind,
    context: String,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    /// Build an error of `kind` with a context message.
    #[must_use]
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            source: None,
        }
    }

    /// Wrap an I/O error with the operation that issued it.
    #[must_use]
    pub fn io(err: io::Error, context: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Io,
            context: context.into(),
            source: Some(err),
        }
    }

    pub(crate) fn short_read(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::ShortRead, context)
    }

    pub(crate) fn corrupt(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::CorruptHeader, context)
    }

    pub(crate) fn unsupported(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedEntryKind, context)
    }

    pub(crate) fn misuse(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, context)
    }

    pub(crate) fn flush_failure(stage: &str, err: io::Error) -> Self {
        Self {
            kind: ErrorKind::IncompleteFilterFlush,
            context: format!("{stage}: flushing stream trailer"),
            source: Some(err),
        }
    }

    /// The structured kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable context (stage, offsets, field names).
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Whether a caller may treat this error as "fewer bytes than asked".
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.kind == ErrorKind::ShortRead
    }

    /// Clone the kind and context for replay from a parked session.
    ///
    /// The `io::Error` source is not cloneable; replays keep the kind and
    /// message, which is what state-machine callers key on.
    #[must_use]
    pub(crate) fn replay(&self) -> Self {
        Self {
            kind: self.kind,
            context: self.context.clone(),
            source: None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::io(err, "underlying stream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_context() {
        let err = Error::new(ErrorKind::CorruptHeader, "tar: bad checksum at offset 512");
        assert_eq!(
            err.to_string(),
            "corrupt header: tar: bad checksum at offset 512"
        );
        assert_eq!(err.kind(), ErrorKind::CorruptHeader);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn io_errors_keep_their_source() {
        let inner = io::Error::new(io::ErrorKind::UnexpectedEof, "boom");
        let err = Error::io(inner, "gzip stage: read at offset 40");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn replay_preserves_kind_and_message() {
        let inner = io::Error::new(io::ErrorKind::Other, "gone");
        let err = Error::io(inner, "zstd stage: read at offset 8");
        let replayed = err.replay();
        assert_eq!(replayed.kind(), ErrorKind::Io);
        assert_eq!(replayed.context(), err.context());
        assert!(std::error::Error::source(&replayed).is_none());
    }

    #[test]
    fn short_reads_are_recoverable() {
        assert!(Error::short_read("need 512, have 100").is_recoverable());
    }
}
