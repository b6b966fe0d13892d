//! Errors surfaced across the meshrpc workspace.
//!
//! One variant per error kind from the framework's error table: channel/codec
//! failures never reach a receive-handler directly, they travel through this
//! type to a connector delegate or a waiting completion callback.

use thiserror::Error;

/// The single error type shared by every meshrpc crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Invariant violation; a bug in this crate rather than misuse.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("channel failed to bind: {0}")]
    ChannelBindFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("framing length {len} exceeds cap {cap}")]
    FramingTooLarge { len: u64, cap: u64 },

    #[error("failed to decode message: {0}")]
    DecodeFailed(String),

    #[error("peer {0} is not visible")]
    PeerUnknown(String),

    #[error("peer {peer} does not support command {command}")]
    PeerIncapable { peer: String, command: String },

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("unsubscribe failed: {0}")]
    UnsubscribeFailed(String),

    #[error("request timed out")]
    Timeout,

    #[error("command {0} is already published")]
    DuplicateCommand(String),

    #[error("command {0} is not known")]
    UnknownCommand(String),

    #[error("remote command handler failed: {0}")]
    CommandError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::DecodeFailed(e.to_string())
    }
}

/// Wire-level counterpart of [`Error`] carried inside a response envelope's
/// `error` field (`{code, message}` per the framing schema).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
}

impl Error {
    /// Stable numeric code for wire transmission. Ranges are suggestive, not
    /// load-bearing for anything other than human debugging.
    pub fn code(&self) -> i32 {
        match self {
            Error::Internal(_) => 1,
            Error::ChannelBindFailed(_) => 100,
            Error::ConnectionClosed => 101,
            Error::FramingTooLarge { .. } => 200,
            Error::DecodeFailed(_) => 201,
            Error::PeerUnknown(_) => 300,
            Error::PeerIncapable { .. } => 301,
            Error::SubscribeFailed(_) => 302,
            Error::UnsubscribeFailed(_) => 303,
            Error::Timeout => 304,
            Error::DuplicateCommand(_) => 400,
            Error::UnknownCommand(_) => 401,
            Error::CommandError(_) => 500,
            Error::Io(_) => 600,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
        }
    }

    pub fn from_payload(payload: ErrorPayload) -> Self {
        match payload.code {
            300 => Error::PeerUnknown(payload.message),
            301 => Error::PeerIncapable {
                peer: String::new(),
                command: payload.message,
            },
            302 => Error::SubscribeFailed(payload.message),
            303 => Error::UnsubscribeFailed(payload.message),
            304 => Error::Timeout,
            400 => Error::DuplicateCommand(payload.message),
            401 => Error::UnknownCommand(payload.message),
            101 => Error::ConnectionClosed,
            _ => Error::CommandError(payload.message),
        }
    }
}
