//! Error types for the assistant pipeline.

/// Top-level error type for the voice-assistant system.
///
/// Variants follow the error kinds the pipeline surfaces: configuration and
/// training errors are fatal to the operation that raised them, recognition
/// and dispatch failures are recovered locally, timeouts are carried as flags
/// and only become errors when a caller insists on a result.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Required profile setting missing or invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Wake-word detection error.
    #[error("wake error: {0}")]
    Wake(String),

    /// Speech decoding (transcription) error.
    #[error("decode error: {0}")]
    Decode(String),

    /// Intent recognition error.
    #[error("recognize error: {0}")]
    Recognize(String),

    /// Intent dispatch error.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Training pipeline error.
    #[error("training error: {0}")]
    Training(String),

    /// Grammar parse or FST compilation error.
    #[error("grammar error: {0}")]
    Grammar(String),

    /// A timed operation expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
