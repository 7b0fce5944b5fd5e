use thiserror::Error;

use crate::video::VideoError;

/// The full error taxonomy surfaced to callers of the render jobs. Callers
/// pattern-match these to produce kind-specific user messages; nothing below
/// this layer is allowed to escape as a raw panic or an untyped error.
#[derive(Debug, Error)]
pub enum RenderJobError {
    /// No resource bundle or packet schema exists for the replay's client
    /// version.
    #[error("version not supported: {0}")]
    VersionNotSupported(String),

    /// The replay stream is structurally invalid or decode failed
    /// unexpectedly.
    #[error("failed to read replay: {0}")]
    ReadingError(String),

    /// Battle-type code outside the supported set.
    #[error("unsupported battle type: {0}")]
    UnsupportedBattleType(i32),

    /// Decode succeeded but rendering or encoding failed.
    #[error("rendering failed: {0}")]
    RenderingError(String),

    /// Dual mode: the two replays are not recordings of the same battle.
    #[error("arena ids do not match: {0} vs {1}")]
    ArenaIdMismatch(i64, i64),

    /// Dual mode: the archive holds more than two replay files.
    #[error("too many replay files in archive: found {0}")]
    MultipleReplaysFound(usize),

    /// Dual mode: fewer than two replays, or a missing `a`/`b` prefix.
    #[error("not enough replay files: {0}")]
    NotEnoughReplaysFound(String),

    #[error("unhandled error: {0}")]
    Unhandled(String),
}

impl From<warships_replays::Error> for RenderJobError {
    fn from(e: warships_replays::Error) -> Self {
        match e {
            warships_replays::Error::UnsupportedVersion(version) => {
                RenderJobError::VersionNotSupported(version)
            }
            other => RenderJobError::ReadingError(other.to_string()),
        }
    }
}

/// Render-stage errors, folded into [`RenderJobError::RenderingError`] at
/// the job boundary.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("timeline holds no snapshots")]
    EmptyTimeline,

    #[error(transparent)]
    Video(#[from] VideoError),
}

impl From<RenderError> for RenderJobError {
    fn from(e: RenderError) -> Self {
        RenderJobError::RenderingError(e.to_string())
    }
}
