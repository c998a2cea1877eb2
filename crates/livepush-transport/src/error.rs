//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur during RTMP transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid argument (empty URL, malformed frame).
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// Invalid RTMP URL.
    #[error("invalid RTMP URL: {0}")]
    InvalidUrl(String),

    /// Connect or publish handshake failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Operation requires an established connection.
    #[error("not connected")]
    NotConnected,

    /// Operation is not valid in the current session state.
    #[error("illegal session state: {0}")]
    IllegalState(&'static str),

    /// RTMP protocol error.
    #[error("RTMP protocol error: {0}")]
    Protocol(String),

    /// Handshake/connect timed out.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Codec-level failure while building a tag.
    #[error(transparent)]
    Codec(#[from] livepush_codec::CodecError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
