use thiserror::Error;

use crate::bridge::protocol::{ChannelId, MAX_CHANNELS};
use crate::transport::TransportError;

/// Errors raised by the multiplexing engine.
///
/// Protocol-shape errors (`MalformedEnvelope`, `UnknownChannel`, `MissingId`) mean a
/// protocol assumption was violated. They are logged where they are detected and handed
/// back to the caller, which decides whether to tear the connection down.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("response id {encoded} routes to unregistered channel {channel}")]
    UnknownChannel { encoded: u64, channel: ChannelId },

    #[error("message sent on a channel has no id")]
    MissingId,

    #[error("all {} channels are in use", MAX_CHANNELS)]
    TooManyChannels,

    #[error("multiplexor has been dropped")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("cannot arm discard timer: {0}")]
    Runtime(String),
}

/// Coarse classification of [`MuxError`] for callers that only need to branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedEnvelope,
    UnknownChannel,
    MissingId,
    Capacity,
    Closed,
    Transport,
    Runtime,
}

impl MuxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedEnvelope(_) => ErrorKind::MalformedEnvelope,
            Self::UnknownChannel { .. } => ErrorKind::UnknownChannel,
            Self::MissingId => ErrorKind::MissingId,
            Self::TooManyChannels => ErrorKind::Capacity,
            Self::Closed => ErrorKind::Closed,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Runtime(_) => ErrorKind::Runtime,
        }
    }

    /// True for errors that indicate a violated protocol assumption rather than a
    /// resource or lifecycle condition.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MalformedEnvelope | ErrorKind::UnknownChannel | ErrorKind::MissingId
        )
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
