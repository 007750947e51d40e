//! Error types for the voice orchestration layer

use parley_core::CoreError;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while driving a call
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Returned by `Recognizer` implementations when the recognition session cannot start or stop.
    #[error("Recognizer error: {0}")]
    Recognizer(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    /// Returned by `Generator` implementations when the text stream cannot be opened.
    #[error("Generator error: {0}")]
    Generator(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// Returned by `AudioCache` implementations backed by external storage.
    #[error("Audio cache error: {0}")]
    Cache(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Recognition failed {limit} times in a row")]
    RecognitionErrorLimit { limit: u32 },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl<T> From<SendError<T>> for VoiceError {
    fn from(_: SendError<T>) -> Self {
        VoiceError::ChannelSend("receiver dropped".to_string())
    }
}
