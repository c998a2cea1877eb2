//! Error types for the engine module.

use thiserror::Error;

/// Errors that can occur while running the push pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine is already pushing.
    #[error("push already running")]
    AlreadyStarted,

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] livepush_transport::TransportError),

    /// Audio encoder failure.
    #[error(transparent)]
    Encoder(#[from] livepush_encoder::EncoderError),

    /// The sender thread could not be spawned.
    #[error("failed to spawn sender thread: {0}")]
    Spawn(std::io::Error),
}
