use thiserror::Error;

/// Decode-stage errors.
///
/// `UnsupportedVersion` and `Corrupt` are deliberately separate: callers show
/// a "version not supported" message for the former and a generic reading
/// failure for the latter.
#[derive(Debug, Error)]
pub enum Error {
    /// The replay's client version has no packet schema in this build.
    #[error("unsupported replay version: {0}")]
    UnsupportedVersion(String),

    /// The stream is structurally invalid.
    #[error("corrupt replay stream: {0}")]
    Corrupt(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn corrupt(what: impl Into<String>) -> Self {
        Error::Corrupt(what.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
