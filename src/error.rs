use thiserror::Error;

/// Flicker's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Flicker's crate-wide error type.
///
/// Every rendering keeps the `FFmpeg:` prefix the engine's log scrapers key
/// on, regardless of which backend produced the failure.
#[derive(Debug, Error)]
pub enum Error {
    /// The named movie lump does not exist in any mounted archive.
    #[error("FFmpeg: cannot find movie lump {0:?}")]
    NotFound(String),

    /// The codec library rejected the container or a codec operation.
    #[error("FFmpeg: {0}")]
    Codec(String),

    /// The caller misused the API (wrong state, mismatched buffers).
    #[error("FFmpeg: {0}")]
    Usage(String),
}

impl Error {
    pub(crate) fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }
}

/// Abort on an unrecoverable runtime failure.
///
/// Movies ship with the game data, so anything the codec rejects mid-stream
/// is a build problem, not a user problem. Errors that reach this point are
/// logged and then terminate like the engine's own abort routine.
pub(crate) fn fatal(message: impl std::fmt::Display) -> ! {
    tracing::error!(target: "flicker", %message, "fatal decode error");
    panic!("{message}");
}
