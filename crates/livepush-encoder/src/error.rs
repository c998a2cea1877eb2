//! Error types for the encoder module.

use thiserror::Error;

/// Errors that can occur during audio encoding.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// AAC encoder initialization failed.
    #[error("AAC encoder initialization failed: {0}")]
    Initialization(String),

    /// Encoding a frame failed.
    #[error("AAC encode failed: {0}")]
    EncodeFailed(String),

    /// Input parameters the pipeline cannot handle.
    #[error("unsupported input: {0}")]
    Unsupported(String),
}
